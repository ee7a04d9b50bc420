//! Per-module constant pool.
//!
//! The pool is a byte region of zero-terminated strings. The first byte is
//! `\0`, so offset 0 always means "no string". A hash table maps each
//! string to its first emitted offset, deduplicating repeats. Once the
//! pool section is written the pool is locked; adding to a locked pool is
//! a fatal error.

use rustc_hash::FxHashMap;
use thiserror::Error;

/// Growth granularity of the pool region.
pub const BUFSIZE: usize = 4096;

#[derive(Debug, Error, PartialEq)]
pub enum PoolError {
    #[error("constant pool is locked; try another module name")]
    Locked,
}

#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    data: Vec<u8>,
    offsets: FxHashMap<String, u32>,
    locked: bool,
}

impl ConstantPool {
    pub fn new() -> Self {
        let mut data = Vec::with_capacity(BUFSIZE);
        data.push(0);
        Self {
            data,
            offsets: FxHashMap::default(),
            locked: false,
        }
    }

    /// Intern a string, returning its pool offset. The empty string maps
    /// to the reserved offset 0 without touching the region.
    pub fn add(&mut self, s: &str) -> Result<u32, PoolError> {
        if s.is_empty() {
            return Ok(0);
        }
        if let Some(&offset) = self.offsets.get(s) {
            return Ok(offset);
        }
        if self.locked {
            return Err(PoolError::Locked);
        }

        if self.data.len() + s.len() + 1 > self.data.capacity() {
            self.data.reserve(BUFSIZE.max(s.len() + 1));
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        self.offsets.insert(s.to_string(), offset);
        Ok(offset)
    }

    /// Look up a string without adding it.
    pub fn offset_of(&self, s: &str) -> Option<u32> {
        if s.is_empty() {
            Some(0)
        } else {
            self.offsets.get(s).copied()
        }
    }

    /// Resolve an offset back to its zero-terminated string.
    pub fn get(&self, offset: u32) -> Option<&str> {
        let start = offset as usize;
        if start >= self.data.len() {
            return None;
        }
        let end = self.data[start..].iter().position(|&b| b == 0)?;
        std::str::from_utf8(&self.data[start..start + end]).ok()
    }

    /// Raw region bytes, including the leading `\0`.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() <= 1
    }

    /// Lock the pool after its section has been written.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Rebuild a pool from a serialized region (reader side). The offsets
    /// table is reconstructed so lookups work both ways.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut offsets = FxHashMap::default();
        let mut start = 1usize;
        while start < bytes.len() {
            match bytes[start..].iter().position(|&b| b == 0) {
                Some(end) => {
                    if let Ok(s) = std::str::from_utf8(&bytes[start..start + end]) {
                        offsets.entry(s.to_string()).or_insert(start as u32);
                    }
                    start += end + 1;
                }
                None => break,
            }
        }
        Self {
            data: bytes.to_vec(),
            offsets,
            locked: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_zero_reserved() {
        let mut pool = ConstantPool::new();
        assert_eq!(pool.add("").unwrap(), 0);
        assert_eq!(pool.bytes()[0], 0);
        assert_eq!(pool.get(0), Some(""));
    }

    #[test]
    fn test_add_and_get() {
        let mut pool = ConstantPool::new();
        let a = pool.add("alpha").unwrap();
        let b = pool.add("beta").unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(pool.get(a), Some("alpha"));
        assert_eq!(pool.get(b), Some("beta"));
    }

    #[test]
    fn test_dedup() {
        let mut pool = ConstantPool::new();
        let a = pool.add("x").unwrap();
        let b = pool.add("x").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_lock_rejects_new_strings() {
        let mut pool = ConstantPool::new();
        let a = pool.add("kept").unwrap();
        pool.lock();
        assert_eq!(pool.add("kept").unwrap(), a);
        assert_eq!(pool.add(""), Ok(0));
        assert_eq!(pool.add("fresh"), Err(PoolError::Locked));
    }

    #[test]
    fn test_every_string_nul_terminated() {
        let mut pool = ConstantPool::new();
        let offsets: Vec<u32> = ["a", "bb", "ccc"]
            .iter()
            .map(|s| pool.add(s).unwrap())
            .collect();
        for off in offsets {
            let s = pool.get(off).unwrap();
            let end = off as usize + s.len();
            assert_eq!(pool.bytes()[end], 0);
        }
    }

    #[test]
    fn test_from_bytes_roundtrip() {
        let mut pool = ConstantPool::new();
        let a = pool.add("alpha").unwrap();
        let restored = ConstantPool::from_bytes(pool.bytes());
        assert_eq!(restored.get(a), Some("alpha"));
        assert_eq!(restored.offset_of("alpha"), Some(a));
        assert!(restored.is_locked());
    }
}
