use std::fmt;

use md5::{Digest, Md5};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Bloom filter sent by the backend alongside an existence filter so the
/// client can tell which cached documents were deleted without a full
/// re-listen.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() {
            if hash_count != 0 {
                return Err(invalid_argument(format!(
                    "Invalid hash count: {hash_count} for an empty bitmap"
                )));
            }
            if padding != 0 {
                return Err(invalid_argument(format!(
                    "Invalid padding when bitmap length is 0: {padding}"
                )));
            }
        } else if hash_count == 0 {
            return Err(invalid_argument("Invalid hash count: 0 for a non-empty bitmap"));
        }

        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Whether `value` may be in the set. Values are full resource names,
    /// e.g. `projects/p/databases/d/documents/coll/doc`.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (hash1, hash2) = md5_hashes(value);
        (0..self.hash_count as u64).all(|index| {
            let combined = hash1.wrapping_add(hash2.wrapping_mul(index));
            self.is_bit_set(combined % self.bit_count)
        })
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }

    #[cfg(test)]
    pub(crate) fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, value: &str) {
        let (hash1, hash2) = md5_hashes(value);
        for index in 0..self.hash_count as u64 {
            let bit = hash1.wrapping_add(hash2.wrapping_mul(index)) % self.bit_count;
            self.bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }
}

/// Splits the MD5 digest of `value` into two little-endian 64-bit halves.
fn md5_hashes(value: &str) -> (u64, u64) {
    let digest = Md5::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bit_count", &self.bit_count)
            .field("hash_count", &self.hash_count)
            .finish()
    }
}
