//! Build artifacts: the raw executable bytes a build or a chain fetch yields.
//!
//! An [`Artifact`] is produced once and never mutated. It carries an optional
//! declared length: when the producer knows exactly where the executable
//! ends, hashing uses [`StripPolicy::FixedLength`] instead of trimming zeros.

use crate::proof::strip::StripPolicy;

/// Raw executable bytes plus the boundary the producer vouches for, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    bytes: Vec<u8>,
    declared_length: Option<usize>,
}

impl Artifact {
    /// An artifact with no declared length (hashing trims trailing zeros).
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            declared_length: None,
        }
    }

    /// An artifact whose producer declares the exact executable length.
    ///
    /// The length is not validated here; [`crate::proof::strip::canonicalize`]
    /// rejects a declared length that exceeds the byte count.
    #[must_use]
    pub fn with_declared_length(bytes: Vec<u8>, declared_length: usize) -> Self {
        Self {
            bytes,
            declared_length: Some(declared_length),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn declared_length(&self) -> Option<usize> {
        self.declared_length
    }

    /// Number of raw bytes, padding included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The strip policy implied by this artifact's declared length.
    #[must_use]
    pub fn default_policy(&self) -> StripPolicy {
        match self.declared_length {
            Some(n) => StripPolicy::FixedLength(n),
            None => StripPolicy::TrimTrailingZeros,
        }
    }

    /// Consume the artifact, returning the raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
