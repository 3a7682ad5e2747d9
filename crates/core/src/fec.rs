//! Reed-Solomon forward error correction over GF(2^8).
//!
//! `k` data shards plus `m` parity shards; any `k` of the `k+m` shards
//! recover the original data. Shard length is `ceil(len/k)`, zero
//! padded; callers must keep the original length alongside the shard
//! set to strip the padding back off on decode.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{Error, Result};

/// Default overhead ratio: `m ~= 0.3k`, with a floor of one parity shard.
pub fn default_parity_shards(k: usize) -> usize {
    ((k as f64) * 0.3).round().max(1.0) as usize
}

#[derive(Debug, Clone)]
pub struct ShardGroup {
    pub group_id: u64,
    pub k: usize,
    pub m: usize,
    pub shard_len: usize,
    pub original_len: usize,
    pub shards: Vec<Option<Vec<u8>>>,
}

impl ShardGroup {
    /// Bitmap of which shard slots are currently present.
    pub fn presence(&self) -> Vec<bool> {
        self.shards.iter().map(Option::is_some).collect()
    }

    pub fn present_count(&self) -> usize {
        self.shards.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_recoverable(&self) -> bool {
        self.present_count() >= self.k
    }
}

pub struct FecCodec {
    k: usize,
    m: usize,
}

impl FecCodec {
    pub fn new(k: usize, m: usize) -> Self {
        Self { k, m }
    }

    pub fn with_default_overhead(k: usize) -> Self {
        Self::new(k, default_parity_shards(k))
    }

    /// Encode `data` into `k + m` equal-length shards, zero-padding the
    /// final data shard as needed.
    pub fn encode(&self, group_id: u64, data: &[u8]) -> Result<ShardGroup> {
        let shard_len = data.len().div_ceil(self.k).max(1);

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.k + self.m);
        for i in 0..self.k {
            let start = i * shard_len;
            let end = (start + shard_len).min(data.len());
            let mut shard = vec![0u8; shard_len];
            if start < data.len() {
                shard[..end - start].copy_from_slice(&data[start..end]);
            }
            shards.push(shard);
        }
        for _ in 0..self.m {
            shards.push(vec![0u8; shard_len]);
        }

        let rs = ReedSolomon::new(self.k, self.m).map_err(|_| Error::ShardSizeMismatch)?;
        rs.encode(&mut shards).map_err(|_| Error::ShardSizeMismatch)?;

        Ok(ShardGroup {
            group_id,
            k: self.k,
            m: self.m,
            shard_len,
            original_len: data.len(),
            shards: shards.into_iter().map(Some).collect(),
        })
    }

    /// Reconstruct the original bytes from any `>= k` present shards
    /// (with correct positions); strips the zero padding using
    /// `group.original_len`.
    pub fn decode(&self, group: &ShardGroup) -> Result<Vec<u8>> {
        if group.present_count() < self.k {
            return Err(Error::TooFewShards);
        }

        let mut shards = group.shards.clone();
        if shards.iter().flatten().any(|s| s.len() != group.shard_len) {
            return Err(Error::ShardSizeMismatch);
        }

        let rs = ReedSolomon::new(self.k, self.m).map_err(|_| Error::ShardSizeMismatch)?;
        rs.reconstruct(&mut shards).map_err(|_| Error::TooFewShards)?;

        let mut out = Vec::with_capacity(group.k * group.shard_len);
        for shard in shards.into_iter().take(self.k) {
            out.extend_from_slice(&shard.expect("reconstructed"));
        }
        out.truncate(group.original_len);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_full_shard_set() {
        let codec = FecCodec::new(10, 3);
        let data = b"Integration test data for FEC encoding";
        let group = codec.encode(1, data).unwrap();
        let decoded = codec.decode(&group).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn round_trips_after_dropping_any_three_of_thirteen_shards() {
        let codec = FecCodec::new(10, 3);
        let data = b"Integration test data for FEC encoding";
        let mut group = codec.encode(1, data).unwrap();

        group.shards[2] = None;
        group.shards[5] = None;
        group.shards[11] = None;

        let decoded = codec.decode(&group).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn decode_fails_with_too_few_shards() {
        let codec = FecCodec::new(10, 3);
        let mut group = codec.encode(1, b"hello world").unwrap();
        for shard in group.shards.iter_mut().take(4) {
            *shard = None;
        }
        assert_eq!(codec.decode(&group).unwrap_err(), Error::TooFewShards);
    }

    #[test]
    fn default_overhead_is_about_thirty_percent_with_floor_of_one() {
        assert_eq!(default_parity_shards(10), 3);
        assert_eq!(default_parity_shards(1), 1);
        assert_eq!(default_parity_shards(2), 1);
    }
}
