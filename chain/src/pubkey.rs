//! 32-byte account addresses and program-derived address derivation.

use curve25519_dalek::edwards::CompressedEdwardsY;
use sha2::{Digest, Sha256};

/// Domain separator appended to every derived-address preimage.
const PDA_MARKER: &[u8] = b"ProgramDerivedAddress";
const MAX_SEED_LEN: usize = 32;
const MAX_SEEDS: usize = 16;

/// Errors from address parsing and derivation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PubkeyError {
    #[error("invalid base58 address {input:?}: {detail}")]
    InvalidBase58 { input: String, detail: String },
    #[error("address {input:?} decodes to {len} bytes, expected 32")]
    WrongLength { input: String, len: usize },
    #[error("seed {index} is {len} bytes, max {MAX_SEED_LEN}")]
    SeedTooLong { index: usize, len: usize },
    #[error("at most {MAX_SEEDS} seeds, got {count}")]
    TooManySeeds { count: usize },
    #[error("derived address lies on the ed25519 curve")]
    OnCurve,
    #[error("no off-curve bump seed found")]
    NoViableBump,
}

/// An account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Pubkey([u8; 32]);

impl Pubkey {
    #[must_use]
    pub const fn new_from_array(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Read an address from a 32-byte slice.
    ///
    /// Returns `None` if `bytes` is not exactly 32 bytes long.
    #[must_use]
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    /// True if the bytes decompress to a valid ed25519 point.
    #[must_use]
    pub fn is_on_curve(&self) -> bool {
        CompressedEdwardsY(self.0).decompress().is_some()
    }

    /// Hash `seeds` with `program_id` into an address that has no private key.
    ///
    /// # Errors
    ///
    /// Seed count or length limits, or [`PubkeyError::OnCurve`] if the hash
    /// happens to be a valid public key.
    pub fn create_program_address(
        seeds: &[&[u8]],
        program_id: &Pubkey,
    ) -> Result<Pubkey, PubkeyError> {
        if seeds.len() > MAX_SEEDS {
            return Err(PubkeyError::TooManySeeds { count: seeds.len() });
        }
        let mut hasher = Sha256::new();
        for (index, seed) in seeds.iter().enumerate() {
            if seed.len() > MAX_SEED_LEN {
                return Err(PubkeyError::SeedTooLong {
                    index,
                    len: seed.len(),
                });
            }
            hasher.update(seed);
        }
        hasher.update(program_id.0);
        hasher.update(PDA_MARKER);
        let candidate = Pubkey(hasher.finalize().into());
        if candidate.is_on_curve() {
            return Err(PubkeyError::OnCurve);
        }
        Ok(candidate)
    }

    /// Search bump seeds from 255 down and return the first off-curve address.
    ///
    /// # Errors
    ///
    /// Seed limit errors, or [`PubkeyError::NoViableBump`] if all 256 bumps
    /// land on the curve.
    pub fn find_program_address(
        seeds: &[&[u8]],
        program_id: &Pubkey,
    ) -> Result<(Pubkey, u8), PubkeyError> {
        if seeds.len() >= MAX_SEEDS {
            return Err(PubkeyError::TooManySeeds {
                count: seeds.len() + 1,
            });
        }
        for bump in (0..=u8::MAX).rev() {
            let bump_seed = [bump];
            let mut with_bump: Vec<&[u8]> = seeds.to_vec();
            with_bump.push(&bump_seed);
            match Self::create_program_address(&with_bump, program_id) {
                Ok(address) => return Ok((address, bump)),
                Err(PubkeyError::OnCurve) => {}
                Err(other) => return Err(other),
            }
        }
        Err(PubkeyError::NoViableBump)
    }
}

impl std::fmt::Display for Pubkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl std::fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pubkey({self})")
    }
}

impl std::str::FromStr for Pubkey {
    type Err = PubkeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| PubkeyError::InvalidBase58 {
                input: s.to_string(),
                detail: e.to_string(),
            })?;
        Self::try_from_slice(&bytes).ok_or(PubkeyError::WrongLength {
            input: s.to_string(),
            len: bytes.len(),
        })
    }
}

impl serde::Serialize for Pubkey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Pubkey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
