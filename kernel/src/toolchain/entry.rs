//! Toolchain entries: pinned images, build flavors, target platforms.

use serde::{Deserialize, Serialize};

use crate::toolchain::version::{ReleaseLine, ToolchainVersion};
use crate::toolchain::ToolchainError;

/// Which cargo subcommand drives the build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildFlavor {
    /// `cargo build-sbf`.
    #[default]
    Standard,
    /// `cargo build-bpf`, for the pre-Agave BPF toolchain.
    LegacyBpf,
    /// `cargo test-sbf`.
    TestSbf,
}

impl BuildFlavor {
    pub const ALL: &[BuildFlavor] = &[Self::Standard, Self::LegacyBpf, Self::TestSbf];

    #[must_use]
    pub const fn cargo_subcommand(self) -> &'static str {
        match self {
            Self::Standard => "build-sbf",
            Self::LegacyBpf => "build-bpf",
            Self::TestSbf => "test-sbf",
        }
    }

    /// Check that `version` can run this flavor at all.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::IncompatibleFlavor`] when the release line
    /// does not ship the required platform tools.
    pub fn check_supported_by(self, version: ToolchainVersion) -> Result<(), ToolchainError> {
        let reject = |detail: &str| ToolchainError::IncompatibleFlavor {
            version,
            flavor: self,
            detail: detail.into(),
        };
        match self {
            Self::Standard => Ok(()),
            Self::LegacyBpf if version.release_line() == ReleaseLine::Agave => {
                Err(reject("the Agave line only ships the SBF toolchain"))
            }
            Self::LegacyBpf => Ok(()),
            Self::TestSbf if (version.major(), version.minor()) < (1, 16) => {
                Err(reject("test-sbf requires 1.16 or later"))
            }
            Self::TestSbf => Ok(()),
        }
    }
}

impl std::fmt::Display for BuildFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Standard => "standard",
            Self::LegacyBpf => "legacy_bpf",
            Self::TestSbf => "test_sbf",
        })
    }
}

/// Target CPU architecture. Always explicit, never host default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Amd64,
    Arm64,
}

impl Platform {
    /// Value for `docker --platform`.
    #[must_use]
    pub const fn docker_platform(self) -> &'static str {
        match self {
            Self::Amd64 => "linux/amd64",
            Self::Arm64 => "linux/arm64",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.docker_platform())
    }
}

/// A content-addressed container image reference: `name[:tag]@sha256:<64 hex>`.
///
/// Mutable references (tag only) are rejected, so a given reference always
/// names the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    reference: String,
    at: usize,
}

impl ImageRef {
    /// # Errors
    ///
    /// Returns [`ToolchainError::InvalidImageRef`] unless `reference` carries
    /// a lowercase `sha256` digest of 64 hex characters.
    pub fn parse(reference: &str) -> Result<Self, ToolchainError> {
        let invalid = |detail: &str| ToolchainError::InvalidImageRef {
            reference: reference.to_string(),
            detail: detail.into(),
        };
        let Some(at) = reference.rfind('@') else {
            return Err(invalid("image must be pinned by digest (name@sha256:...)"));
        };
        let (name, digest) = (&reference[..at], &reference[at + 1..]);
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(invalid("image name is empty or contains whitespace"));
        }
        let Some(hex_part) = digest.strip_prefix("sha256:") else {
            return Err(invalid("only sha256 digests are accepted"));
        };
        if hex_part.len() != 64
            || !hex_part
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(invalid("digest must be 64 lowercase hex characters"));
        }
        Ok(Self {
            reference: reference.to_string(),
            at,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.reference
    }

    /// Repository part, including any tag.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.reference[..self.at]
    }

    /// The `sha256:<hex>` digest.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.reference[self.at + 1..]
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reference)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = ToolchainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageRef> for String {
    fn from(image: ImageRef) -> Self {
        image.reference
    }
}

/// A resolved, immutable build environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ToolchainEntry {
    version: ToolchainVersion,
    image: ImageRef,
    flavor: BuildFlavor,
    platform: Platform,
}

impl ToolchainEntry {
    /// Build an entry outside the registry (image override).
    ///
    /// The flavor rules still apply; only the registry lookup is bypassed.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::IncompatibleFlavor`] if `flavor` cannot run on
    /// `version`.
    pub fn pinned(
        version: ToolchainVersion,
        image: ImageRef,
        flavor: BuildFlavor,
        platform: Platform,
    ) -> Result<Self, ToolchainError> {
        flavor.check_supported_by(version)?;
        Ok(Self {
            version,
            image,
            flavor,
            platform,
        })
    }

    #[must_use]
    pub fn version(&self) -> ToolchainVersion {
        self.version
    }

    #[must_use]
    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    #[must_use]
    pub fn flavor(&self) -> BuildFlavor {
        self.flavor
    }

    #[must_use]
    pub fn platform(&self) -> Platform {
        self.platform
    }
}
