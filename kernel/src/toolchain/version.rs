//! Toolchain versions and the release lines they belong to.

use serde::{Deserialize, Serialize};

use crate::toolchain::ToolchainError;

/// Releases that were yanked or never published; never resolvable.
pub const YANKED_VERSIONS: &[&str] = &[
    "1.10.0", "1.10.16", "1.10.18", "1.10.27", "1.10.36", "1.10.37", "1.11.7", "1.11.8",
    "1.11.9", "1.13.0", "1.14.0",
];

/// An exact `major.minor.patch` toolchain version.
///
/// Parsing accepts an optional leading `v`. Ordering is numeric, so
/// `1.9.0 < 1.10.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolchainVersion {
    major: u32,
    minor: u32,
    patch: u32,
}

/// Which upstream line a version belongs to. Decides install source,
/// vendoring strategy and valid flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseLine {
    /// 1.10 to 1.14.
    SolanaPre115,
    /// 1.16 to 1.18.23.
    Solana,
    /// 1.18.24 onward, and 2.x.
    Agave,
}

/// How dependencies are resolved before the offline compile step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendoringStrategy {
    /// `cargo fetch` through the git CLI; compile with `--frozen --locked`.
    GitCliFetch,
    /// Sparse registry protocol; compile with `--locked`.
    SparseRegistry,
}

impl ToolchainVersion {
    /// # Errors
    ///
    /// Returns [`ToolchainError::InvalidVersion`] for unsupported lines
    /// (below 1.10, or 1.15.x) and yanked releases.
    pub fn new(major: u32, minor: u32, patch: u32) -> Result<Self, ToolchainError> {
        let v = Self {
            major,
            minor,
            patch,
        };
        v.release_line_checked()?;
        let text = v.to_string();
        if YANKED_VERSIONS.contains(&text.as_str()) {
            return Err(ToolchainError::InvalidVersion {
                raw: text,
                detail: "release was yanked".into(),
            });
        }
        Ok(v)
    }

    #[must_use]
    pub fn major(&self) -> u32 {
        self.major
    }

    #[must_use]
    pub fn minor(&self) -> u32 {
        self.minor
    }

    #[must_use]
    pub fn patch(&self) -> u32 {
        self.patch
    }

    #[must_use]
    pub fn release_line(&self) -> ReleaseLine {
        // Constructors reject everything release_line_checked rejects.
        self.release_line_checked().unwrap_or(ReleaseLine::Agave)
    }

    #[must_use]
    pub fn vendoring_strategy(&self) -> VendoringStrategy {
        if (self.major, self.minor) < (1, 17) {
            VendoringStrategy::GitCliFetch
        } else {
            VendoringStrategy::SparseRegistry
        }
    }

    fn release_line_checked(&self) -> Result<ReleaseLine, ToolchainError> {
        let unsupported = |detail: &str| ToolchainError::InvalidVersion {
            raw: self.to_string(),
            detail: detail.into(),
        };
        match (self.major, self.minor) {
            (0, _) | (1, 0..=9) => Err(unsupported("toolchains below 1.10 are not supported")),
            (1, 15) => Err(unsupported("the 1.15 line was never released")),
            (1, 10..=14) => Ok(ReleaseLine::SolanaPre115),
            (1, 16 | 17) => Ok(ReleaseLine::Solana),
            (1, 18) if self.patch < 24 => Ok(ReleaseLine::Solana),
            _ => Ok(ReleaseLine::Agave),
        }
    }
}

impl std::fmt::Display for ToolchainVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::str::FromStr for ToolchainVersion {
    type Err = ToolchainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |detail: &str| ToolchainError::InvalidVersion {
            raw: s.to_string(),
            detail: detail.into(),
        };
        let trimmed = s.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let parts: Vec<&str> = body.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid("expected major.minor.patch"));
        }
        let mut nums = [0u32; 3];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid("components must be decimal integers"));
            }
            *slot = part
                .parse()
                .map_err(|_| invalid("component out of range"))?;
        }
        Self::new(nums[0], nums[1], nums[2])
    }
}

impl TryFrom<String> for ToolchainVersion {
    type Error = ToolchainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ToolchainVersion> for String {
    fn from(v: ToolchainVersion) -> Self {
        v.to_string()
    }
}
