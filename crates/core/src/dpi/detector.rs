//! Port + signature + SNI protocol detection.

use ahash::AHashMap;
use protocol::Category;

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub protocol: String,
    pub category: Category,
    pub confidence: f64,
    pub matched: &'static str,
}

impl Classification {
    pub fn unknown() -> Self {
        Self {
            protocol: "Unknown".to_string(),
            category: Category::Unknown,
            confidence: 0.0,
            matched: "none",
        }
    }
}

/// A byte-pattern signature. Signatures are looked up linearly; the
/// highest-weight match wins ties.
#[derive(Debug, Clone)]
pub struct Signature {
    pub name: String,
    pub target_protocol: String,
    pub category: Category,
    pub pattern: Vec<u8>,
    pub offset: usize,
    pub max_depth: usize,
    pub weight: f64,
}

pub struct Detector {
    /// (port, is_tcp) -> (protocol, category). Port-based matches are
    /// always reported at confidence 0.6.
    well_known_ports: AHashMap<u16, (String, Category)>,
    signatures: Vec<Signature>,
    /// Exact-or-substring SNI -> (service, category) map, reported at
    /// confidence 0.9.
    sni_services: AHashMap<&'static str, (&'static str, Category)>,
}

const PORT_CONFIDENCE: f64 = 0.6;
const SNI_CONFIDENCE: f64 = 0.9;
const HTTPS_FALLBACK_CONFIDENCE: f64 = 0.7;

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector {
    pub fn new() -> Self {
        let mut well_known_ports = AHashMap::new();
        well_known_ports.insert(80, ("HTTP".to_string(), Category::Web));
        well_known_ports.insert(443, ("HTTPS".to_string(), Category::Web));
        well_known_ports.insert(22, ("SSH".to_string(), Category::System));
        well_known_ports.insert(25, ("SMTP".to_string(), Category::Email));
        well_known_ports.insert(53, ("DNS".to_string(), Category::System));
        well_known_ports.insert(3478, ("STUN".to_string(), Category::Communication));
        well_known_ports.insert(1194, ("OpenVPN".to_string(), Category::Vpn));
        well_known_ports.insert(3389, ("RDP".to_string(), Category::System));

        let signatures = vec![
            Signature {
                name: "http-get".to_string(),
                target_protocol: "HTTP".to_string(),
                category: Category::Web,
                pattern: b"GET ".to_vec(),
                offset: 0,
                max_depth: 4,
                weight: 0.85,
            },
            Signature {
                name: "http-post".to_string(),
                target_protocol: "HTTP".to_string(),
                category: Category::Web,
                pattern: b"POST ".to_vec(),
                offset: 0,
                max_depth: 5,
                weight: 0.85,
            },
            Signature {
                name: "bittorrent-handshake".to_string(),
                target_protocol: "BitTorrent".to_string(),
                category: Category::FileTransfer,
                pattern: b"BitTorrent protocol".to_vec(),
                offset: 1,
                max_depth: 32,
                weight: 0.9,
            },
            Signature {
                name: "rtp-version2".to_string(),
                target_protocol: "RTP".to_string(),
                category: Category::Communication,
                pattern: vec![0x80],
                offset: 0,
                max_depth: 1,
                weight: 0.3,
            },
        ];

        let mut sni_services = AHashMap::new();
        sni_services.insert("youtube.com", ("YouTube", Category::Streaming));
        sni_services.insert("netflix.com", ("Netflix", Category::Streaming));
        sni_services.insert("twitch.tv", ("Twitch", Category::Streaming));
        sni_services.insert("spotify.com", ("Spotify", Category::Streaming));
        sni_services.insert("facebook.com", ("Facebook", Category::Social));
        sni_services.insert("instagram.com", ("Instagram", Category::Social));
        sni_services.insert("zoom.us", ("Zoom", Category::Communication));
        sni_services.insert("discord.com", ("Discord", Category::Communication));
        sni_services.insert("steamcommunity.com", ("Steam", Category::Gaming));

        Self {
            well_known_ports,
            signatures,
            sni_services,
        }
    }

    /// Port match and signature scan both run; the higher-confidence
    /// result wins. A port match alone never shadows a stronger
    /// signature hit (e.g. an HTTP GET on port 80 still reports the
    /// signature's 0.85, not the port table's 0.6).
    pub fn classify(&self, payload: &[u8], src_port: u16, dst_port: u16) -> Classification {
        let port_match = [dst_port, src_port].into_iter().find_map(|port| {
            self.well_known_ports.get(&port).map(|(protocol, category)| Classification {
                protocol: protocol.clone(),
                category: *category,
                confidence: PORT_CONFIDENCE,
                matched: "port-based",
            })
        });

        let mut best: Option<(&Signature, usize)> = None;
        for sig in &self.signatures {
            let depth = sig.max_depth.min(payload.len());
            if payload.len() < sig.offset + sig.pattern.len() {
                continue;
            }
            let search_window_end = depth.max(sig.offset + sig.pattern.len()).min(payload.len());
            let haystack = &payload[sig.offset..search_window_end];
            if contains(haystack, &sig.pattern) {
                let better = match best {
                    None => true,
                    Some((current, _)) => sig.weight > current.weight,
                };
                if better {
                    best = Some((sig, 0));
                }
            }
        }

        let signature_match = best.map(|(sig, _)| Classification {
            protocol: sig.target_protocol.clone(),
            category: sig.category,
            confidence: sig.weight,
            matched: "signature",
        });

        match (port_match, signature_match) {
            (Some(port), Some(sig)) => {
                if sig.confidence > port.confidence {
                    sig
                } else {
                    port
                }
            }
            (Some(port), None) => port,
            (None, Some(sig)) => sig,
            (None, None) => Classification::unknown(),
        }
    }

    /// Parse a TLS ClientHello (`16 03 .. 01 ..`) and extract the SNI
    /// extension (type `0`). Falls back to a generic HTTPS
    /// classification if no SNI matches a known service.
    pub fn classify_tls(&self, payload: &[u8]) -> Classification {
        match extract_sni(payload) {
            Some(sni) => {
                let lower = sni.to_ascii_lowercase();
                for (domain, (service, category)) in &self.sni_services {
                    if lower == *domain || lower.ends_with(&format!(".{domain}")) || lower.contains(domain) {
                        return Classification {
                            protocol: service.to_string(),
                            category: *category,
                            confidence: SNI_CONFIDENCE,
                            matched: "sni",
                        };
                    }
                }
                Classification {
                    protocol: "HTTPS".to_string(),
                    category: Category::Web,
                    confidence: HTTPS_FALLBACK_CONFIDENCE,
                    matched: "tls-fallback",
                }
            }
            None => Classification {
                protocol: "HTTPS".to_string(),
                category: Category::Web,
                confidence: HTTPS_FALLBACK_CONFIDENCE,
                matched: "tls-fallback",
            },
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Minimal TLS ClientHello SNI extractor: verifies the handshake/TLS
/// envelope (`16 03 .. .. .. 01 ..`) then walks session-id, cipher
/// suites, compression methods and extensions to find extension type 0
/// (server_name) and decode its hostname.
fn extract_sni(payload: &[u8]) -> Option<String> {
    // record header: type(1) version(2) length(2)
    if payload.len() < 6 || payload[0] != 0x16 || payload[1] != 0x03 {
        return None;
    }

    let mut pos = 5;
    // handshake header: msg_type(1)=1 (ClientHello) length(3)
    if payload.len() < pos + 4 || payload[pos] != 0x01 {
        return None;
    }
    pos += 4;

    // client_version(2) + random(32)
    pos += 2 + 32;
    if payload.len() < pos + 1 {
        return None;
    }

    // session id
    let session_id_len = *payload.get(pos)? as usize;
    pos += 1 + session_id_len;
    if payload.len() < pos + 2 {
        return None;
    }

    // cipher suites
    let cipher_len = u16::from_be_bytes([*payload.get(pos)?, *payload.get(pos + 1)?]) as usize;
    pos += 2 + cipher_len;
    if payload.len() < pos + 1 {
        return None;
    }

    // compression methods
    let comp_len = *payload.get(pos)? as usize;
    pos += 1 + comp_len;
    if payload.len() < pos + 2 {
        return None;
    }

    // extensions
    let extensions_len = u16::from_be_bytes([*payload.get(pos)?, *payload.get(pos + 1)?]) as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(payload.len());

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
        let ext_len = u16::from_be_bytes([payload[pos + 2], payload[pos + 3]]) as usize;
        let ext_start = pos + 4;
        let ext_end = (ext_start + ext_len).min(payload.len());

        if ext_type == 0 && ext_end > ext_start {
            return parse_server_name(&payload[ext_start..ext_end]);
        }

        pos = ext_end;
    }

    None
}

fn parse_server_name(ext_body: &[u8]) -> Option<String> {
    // server_name_list length(2), then entries: type(1)=0 len(2) name
    if ext_body.len() < 5 {
        return None;
    }
    let mut pos = 2;
    if ext_body[pos] != 0 {
        return None;
    }
    pos += 1;
    let name_len = u16::from_be_bytes([*ext_body.get(pos)?, *ext_body.get(pos + 1)?]) as usize;
    pos += 2;
    let name = ext_body.get(pos..pos + name_len)?;
    std::str::from_utf8(name).ok().map(|s| s.to_string())
}
