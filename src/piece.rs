use crate::constants::HASH_LEN;
use anyhow::{bail, Result};
use openssl::sha;
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceHash([u8; HASH_LEN]);

impl PieceHash {
    pub fn new(digest: [u8; HASH_LEN]) -> Self {
        Self(digest)
    }

    pub fn of(data: &[u8]) -> Self {
        Self(sha::sha1(data))
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        sha::sha1(data) == self.0
    }

    pub fn as_byte_ref(&self) -> &[u8] {
        self.0.as_ref()
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        if raw.len() != HASH_LEN {
            bail!("piece hash must be {HASH_LEN} bytes, got {}", raw.len());
        }

        let mut digest = [0u8; HASH_LEN];
        digest.copy_from_slice(raw);
        Ok(Self(digest))
    }
}

impl fmt::Debug for PieceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Missing,
    Requested,
    Owned,
}
