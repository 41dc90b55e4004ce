//! Canonical hashing: digest algorithms and the [`CanonicalHash`] value.
//!
//! **Exactly one place computes executable digests.** Every hash the engine
//! prints or compares flows through [`digest`], which only accepts input
//! produced by [`canonicalize`], so the strip policy is always recorded.
//!
//! Two algorithms are first-class: SHA-256 (default) and SHA-1, kept for
//! comparison against historically published 160-bit hashes. They are never
//! substituted for one another.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::artifact::Artifact;
use crate::proof::strip::{canonicalize, CanonicalBytes, StripPolicy};

/// Errors from canonicalization, digesting, and comparison.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    /// A fixed length larger than the available bytes was requested.
    #[error("declared length {declared} exceeds input length {actual}")]
    InvalidLength { declared: usize, actual: usize },
    /// Two hashes were computed under different algorithms or strip policies.
    #[error("incompatible comparison: {detail}")]
    IncompatibleComparison { detail: String },
    /// An algorithm name did not match any supported digest.
    #[error("unknown digest algorithm: {name}")]
    UnknownAlgorithm { name: String },
    /// A hex digest could not be decoded or had the wrong width.
    #[error("malformed {algorithm} digest: {detail}")]
    MalformedDigest {
        algorithm: DigestAlgorithm,
        detail: String,
    },
}

/// Supported digest functions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// Legacy 160-bit digest.
    Sha1,
    /// Current 256-bit digest.
    #[default]
    Sha256,
}

impl DigestAlgorithm {
    pub const ALL: &[DigestAlgorithm] = &[Self::Sha1, Self::Sha256];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Digest width in bytes.
    #[must_use]
    pub const fn output_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    fn compute(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for DigestAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            _ => Err(HashError::UnknownAlgorithm { name: s.to_string() }),
        }
    }
}

/// A content digest over a canonical byte range.
///
/// Invariant: `digest.len() == algorithm.output_len()`.
///
/// `source_byte_length` is the length of the canonical range that was
/// digested. It is `None` only for digests published by a third party
/// (see [`CanonicalHash::from_published_hex`]), where the input length is
/// not known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalHash {
    algorithm: DigestAlgorithm,
    #[serde(with = "hex::serde")]
    digest: Vec<u8>,
    source_byte_length: Option<usize>,
    policy: StripPolicy,
}

impl CanonicalHash {
    /// Reconstruct a hash someone else computed, from its hex form.
    ///
    /// # Errors
    ///
    /// Returns [`HashError::MalformedDigest`] if `hex_digest` is not valid hex
    /// or does not have the width of `algorithm`.
    pub fn from_published_hex(
        algorithm: DigestAlgorithm,
        hex_digest: &str,
        policy: StripPolicy,
    ) -> Result<Self, HashError> {
        let digest = hex::decode(hex_digest.trim()).map_err(|e| HashError::MalformedDigest {
            algorithm,
            detail: e.to_string(),
        })?;
        if digest.len() != algorithm.output_len() {
            return Err(HashError::MalformedDigest {
                algorithm,
                detail: format!(
                    "expected {} bytes, got {}",
                    algorithm.output_len(),
                    digest.len()
                ),
            });
        }
        Ok(Self {
            algorithm,
            digest,
            source_byte_length: None,
            policy,
        })
    }

    #[must_use]
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    #[must_use]
    pub fn digest_bytes(&self) -> &[u8] {
        &self.digest
    }

    /// Lowercase hex digest (no algorithm prefix).
    #[must_use]
    pub fn hex(&self) -> String {
        hex::encode(&self.digest)
    }

    #[must_use]
    pub fn source_byte_length(&self) -> Option<usize> {
        self.source_byte_length
    }

    #[must_use]
    pub fn policy(&self) -> StripPolicy {
        self.policy
    }
}

impl std::fmt::Display for CanonicalHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hex())
    }
}

/// Digest a canonical byte range.
///
/// This function does not fail; the range was already validated by
/// [`canonicalize`].
#[must_use]
pub fn digest(range: CanonicalBytes<'_>, algorithm: DigestAlgorithm) -> CanonicalHash {
    CanonicalHash {
        algorithm,
        digest: algorithm.compute(range.as_bytes()),
        source_byte_length: Some(range.len()),
        policy: range.policy(),
    }
}

/// Canonicalize `bytes` under `policy`, then digest with `algorithm`.
///
/// # Errors
///
/// Returns [`HashError::InvalidLength`] if a fixed length exceeds `bytes.len()`.
pub fn canonical_hash(
    bytes: &[u8],
    policy: StripPolicy,
    algorithm: DigestAlgorithm,
) -> Result<CanonicalHash, HashError> {
    Ok(digest(canonicalize(bytes, policy)?, algorithm))
}

/// Hash an artifact under the policy its declared length implies.
///
/// # Errors
///
/// Returns [`HashError::InvalidLength`] if the declared length exceeds the
/// artifact's byte count.
pub fn artifact_hash(
    artifact: &Artifact,
    algorithm: DigestAlgorithm,
) -> Result<CanonicalHash, HashError> {
    canonical_hash(artifact.bytes(), artifact.default_policy(), algorithm)
}
