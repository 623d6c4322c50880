//! SHA-256 helpers.

use crate::error::{Result, VaasError};
use sha2::{Digest, Sha256 as Sha256Hasher};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read buffer for hashing (64KB)
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Lower-case hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sha256(String);

impl Sha256 {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_digest(digest: impl AsRef<[u8]>) -> Self {
        Self(hex::encode(digest))
    }
}

impl FromStr for Sha256 {
    type Err = VaasError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VaasError::InvalidOperation(format!(
                "not a SHA-256 hex digest: {:?}",
                s
            )));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl fmt::Display for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn sha256_bytes(data: &[u8]) -> Sha256 {
    Sha256::from_digest(Sha256Hasher::digest(data))
}

/// Hash everything `reader` yields, returning the digest and the byte count.
pub async fn sha256_reader<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Sha256, u64)> {
    let mut hasher = Sha256Hasher::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((Sha256::from_digest(hasher.finalize()), total))
}

pub async fn sha256_file(path: &Path) -> Result<Sha256> {
    let mut file = tokio::fs::File::open(path).await?;
    let (digest, _) = sha256_reader(&mut file).await?;
    Ok(digest)
}
