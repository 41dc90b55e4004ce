//! Toolchain registry: exact version strings to content-addressed build
//! environments.
//!
//! Depends on nothing else in the kernel. Lookups are exact and fail closed:
//! an unknown version, a yanked release, or a flavor the release line cannot
//! run is an error, never a substitution.

pub mod entry;
pub mod registry;
pub mod version;

pub use entry::{BuildFlavor, ImageRef, Platform, ToolchainEntry};
pub use registry::ToolchainRegistry;
pub use version::{ReleaseLine, ToolchainVersion, VendoringStrategy};

/// Errors from toolchain resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolchainError {
    /// No registry entry for this exact version.
    #[error("no toolchain registered for version {version}")]
    NotFound { version: ToolchainVersion },
    /// The flavor cannot run on this version.
    #[error("flavor {flavor} is not available for toolchain {version}: {detail}")]
    IncompatibleFlavor {
        version: ToolchainVersion,
        flavor: BuildFlavor,
        detail: String,
    },
    /// A version string that is malformed, unsupported, or yanked.
    #[error("invalid toolchain version {raw:?}: {detail}")]
    InvalidVersion { raw: String, detail: String },
    /// An image reference that is not pinned by digest.
    #[error("invalid image reference {reference:?}: {detail}")]
    InvalidImageRef { reference: String, detail: String },
    /// A registry snapshot that failed to parse or validate.
    #[error("invalid registry snapshot: {detail}")]
    Snapshot { detail: String },
}
