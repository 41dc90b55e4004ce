//! Comparator: turn two canonical hashes into a verdict.
//!
//! Pure and side-effect free. The only ambient input is the timestamp, which
//! [`compare_at`] takes explicitly so callers (and tests) can pin it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::proof::hash::{CanonicalHash, HashError};

/// Binary outcome of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Match,
    Mismatch,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Match => f.write_str("match"),
            Self::Mismatch => f.write_str("mismatch"),
        }
    }
}

/// The immutable outcome of one verification.
///
/// A `Mismatch` is a successful computation with a negative outcome, not an
/// error. Both hashes are always kept so they can be printed side by side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    built_hash: CanonicalHash,
    chain_hash: CanonicalHash,
    verdict: Verdict,
    produced_at: DateTime<Utc>,
}

impl VerificationResult {
    #[must_use]
    pub fn built_hash(&self) -> &CanonicalHash {
        &self.built_hash
    }

    #[must_use]
    pub fn chain_hash(&self) -> &CanonicalHash {
        &self.chain_hash
    }

    #[must_use]
    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    #[must_use]
    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    #[must_use]
    pub fn is_match(&self) -> bool {
        self.verdict == Verdict::Match
    }

    /// Equality on everything except `produced_at`.
    #[must_use]
    pub fn same_outcome(&self, other: &Self) -> bool {
        self.built_hash == other.built_hash
            && self.chain_hash == other.chain_hash
            && self.verdict == other.verdict
    }
}

/// Compare a built hash with an on-chain hash, stamped with the current time.
///
/// # Errors
///
/// See [`compare_at`].
pub fn compare(
    built: &CanonicalHash,
    chain: &CanonicalHash,
) -> Result<VerificationResult, HashError> {
    compare_at(built, chain, Utc::now())
}

/// Compare two hashes with an explicit timestamp.
///
/// Digests are compared only when both sides were produced by the same
/// algorithm under the same strip policy. Digest bytes decide the verdict;
/// `source_byte_length` does not, since a published hash may not know it.
///
/// # Errors
///
/// Returns [`HashError::IncompatibleComparison`] if the algorithms or the
/// strip policies differ. No verdict is produced in that case.
pub fn compare_at(
    built: &CanonicalHash,
    chain: &CanonicalHash,
    produced_at: DateTime<Utc>,
) -> Result<VerificationResult, HashError> {
    if built.algorithm() != chain.algorithm() {
        return Err(HashError::IncompatibleComparison {
            detail: format!(
                "built hash uses {}, on-chain hash uses {}",
                built.algorithm(),
                chain.algorithm()
            ),
        });
    }
    if built.policy() != chain.policy() {
        return Err(HashError::IncompatibleComparison {
            detail: format!(
                "built hash stripped with {}, on-chain hash stripped with {}",
                built.policy(),
                chain.policy()
            ),
        });
    }

    let verdict = if built.digest_bytes() == chain.digest_bytes() {
        Verdict::Match
    } else {
        Verdict::Mismatch
    };

    Ok(VerificationResult {
        built_hash: built.clone(),
        chain_hash: chain.clone(),
        verdict,
        produced_at,
    })
}
