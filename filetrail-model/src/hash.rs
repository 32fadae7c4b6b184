use std::fmt;
use std::str::FromStr;

use crate::error::{ModelError, Result};

/// Digest algorithms the hasher can be configured with.
///
/// SHA-512 is the historical default; BLAKE3 is the fast option for large
/// trees. Every stored digest carries its algorithm prefix, so deployments
/// may switch algorithms without rewriting history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum HashAlgorithm {
    Sha256,
    #[default]
    Sha512,
    Blake3,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Blake3 => "blake3",
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
            HashAlgorithm::Blake3 => 32,
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            "sha512" | "sha-512" => Ok(HashAlgorithm::Sha512),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(ModelError::UnknownAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A self-describing content digest, stored and compared as
/// `algorithm:hexdigest` (e.g. `sha512:ab12…`).
///
/// Identical bytes always yield an identical `ContentHash` under the same
/// algorithm, which is what makes reverse lookup meaningful.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ContentHash(String);

impl ContentHash {
    /// Build a hash from raw digest bytes produced by `algorithm`.
    pub fn from_digest(algorithm: HashAlgorithm, digest: &[u8]) -> Self {
        ContentHash(format!("{}:{}", algorithm.as_str(), hex::encode(digest)))
    }

    /// Parse and validate an `algorithm:hex` string.
    pub fn parse(raw: &str) -> Result<Self> {
        let (algo, digest) = raw
            .split_once(':')
            .ok_or_else(|| ModelError::InvalidHash(raw.to_string()))?;
        let algorithm: HashAlgorithm = algo.parse()?;
        if digest.len() != algorithm.digest_len() * 2
            || !digest.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ModelError::InvalidHash(raw.to_string()));
        }
        Ok(ContentHash(format!("{algo}:{}", digest.to_ascii_lowercase())))
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        // The constructor validated the prefix.
        self.0
            .split_once(':')
            .and_then(|(algo, _)| algo.parse().ok())
            .unwrap_or_default()
    }

    pub fn digest_hex(&self) -> &str {
        self.0.split_once(':').map(|(_, hex)| hex).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full digests make test output unreadable; show a truncated form.
        let shown = if self.0.len() > 24 { &self.0[..24] } else { &self.0 };
        write!(f, "ContentHash({shown}…)")
    }
}
