//! Strip policies: choosing the byte range that identifies an executable.
//!
//! On-chain executables live in accounts sized for future upgrades, so their
//! tail is zero padding that says nothing about the program. Build outputs on
//! disk usually carry no padding at all. Both sides are normalized with the
//! same policy before digesting.
//!
//! # Zero-trim caveat
//!
//! [`StripPolicy::TrimTrailingZeros`] cannot tell padding from genuine
//! trailing zero bytes of the executable: if the real program ends in `0x00`,
//! those bytes are trimmed too. Both sides lose the same bytes, so equality
//! is preserved, but the reported length is shorter than the true
//! executable. No heuristic is applied. Callers that know the exact length
//! should use [`StripPolicy::FixedLength`].

use serde::{Deserialize, Serialize};

use crate::proof::hash::HashError;

/// How raw bytes are cut down before digesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", content = "length", rename_all = "snake_case")]
pub enum StripPolicy {
    /// Drop every trailing `0x00` byte.
    TrimTrailingZeros,
    /// Keep exactly the first `n` bytes.
    FixedLength(usize),
}

impl std::fmt::Display for StripPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrimTrailingZeros => write!(f, "trim-trailing-zeros"),
            Self::FixedLength(n) => write!(f, "fixed-length({n})"),
        }
    }
}

/// A canonical byte range, tagged with the policy that produced it.
///
/// Only [`canonicalize`] constructs this type, so a digest computed from it
/// always knows which policy shaped its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalBytes<'a> {
    bytes: &'a [u8],
    policy: StripPolicy,
}

impl<'a> CanonicalBytes<'a> {
    #[must_use]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[must_use]
    pub fn policy(&self) -> StripPolicy {
        self.policy
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Apply `policy` to `bytes`, returning the range passed to digesting.
///
/// Never copies: the result borrows from `bytes`.
///
/// # Errors
///
/// Returns [`HashError::InvalidLength`] if `policy` is
/// [`StripPolicy::FixedLength`] with `n > bytes.len()`.
pub fn canonicalize(bytes: &[u8], policy: StripPolicy) -> Result<CanonicalBytes<'_>, HashError> {
    let range = match policy {
        StripPolicy::TrimTrailingZeros => trim_trailing_zeros(bytes),
        StripPolicy::FixedLength(n) => {
            if n > bytes.len() {
                return Err(HashError::InvalidLength {
                    declared: n,
                    actual: bytes.len(),
                });
            }
            &bytes[..n]
        }
    };
    Ok(CanonicalBytes {
        bytes: range,
        policy,
    })
}

fn trim_trailing_zeros(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}
