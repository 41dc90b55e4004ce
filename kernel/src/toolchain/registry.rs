//! The toolchain registry table and its TOML snapshot format.
//!
//! # Snapshot format
//!
//! ```toml
//! [[toolchain]]
//! version = "1.18.26"
//! image = "example/verifiable-build@sha256:<64 hex>"
//! platform = "amd64"                 # optional, default amd64
//! flavors = ["standard", "test_sbf"] # optional, default: every flavor the line supports
//! ```
//!
//! Loading validates every row: versions must be supported and unique,
//! images must be digest-pinned, and listed flavors must be runnable on the
//! version. One bad row rejects the whole snapshot.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::toolchain::entry::{BuildFlavor, ImageRef, Platform, ToolchainEntry};
use crate::toolchain::version::ToolchainVersion;
use crate::toolchain::ToolchainError;

/// Entries compiled into the binary. Registry snapshots replace this table.
const BUILTIN_SNAPSHOT: &str = r#"
[[toolchain]]
version = "1.13.5"
image = "projectserum/build@sha256:75b75eab447ebcca1f471c98583d9b5d82c4be122c470852a022afcf9c98bead"
platform = "amd64"
flavors = ["legacy_bpf", "standard"]
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Record {
    image: ImageRef,
    platform: Platform,
    flavors: BTreeSet<BuildFlavor>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SnapshotFile {
    #[serde(default)]
    toolchain: Vec<SnapshotRow>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SnapshotRow {
    version: String,
    image: String,
    #[serde(default)]
    platform: Platform,
    flavors: Option<Vec<BuildFlavor>>,
}

/// Exact-version lookup table of pinned build environments.
///
/// Immutable after construction. Refreshing means building a new registry
/// and swapping it in at the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainRegistry {
    records: BTreeMap<ToolchainVersion, Record>,
    /// Fixed at load; see [`ToolchainRegistry::digest`].
    digest: String,
}

impl ToolchainRegistry {
    /// The table compiled into this build.
    ///
    /// # Errors
    ///
    /// Only if the embedded table is itself invalid, which the unit tests rule out.
    pub fn builtin() -> Result<Self, ToolchainError> {
        Self::from_toml_str(BUILTIN_SNAPSHOT)
    }

    /// Parse and validate a TOML snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Snapshot`] on syntax errors, duplicate
    /// versions, or unsupported flavors, and the underlying version or image
    /// error for invalid rows.
    pub fn from_toml_str(text: &str) -> Result<Self, ToolchainError> {
        let file: SnapshotFile = toml::from_str(text).map_err(|e| ToolchainError::Snapshot {
            detail: e.to_string(),
        })?;

        let mut records = BTreeMap::new();
        for row in file.toolchain {
            let version: ToolchainVersion = row.version.parse()?;
            let image = ImageRef::parse(&row.image)?;
            let flavors: BTreeSet<BuildFlavor> = match row.flavors {
                Some(list) => list.into_iter().collect(),
                None => BuildFlavor::ALL
                    .iter()
                    .copied()
                    .filter(|f| f.check_supported_by(version).is_ok())
                    .collect(),
            };
            if flavors.is_empty() {
                return Err(ToolchainError::Snapshot {
                    detail: format!("toolchain {version} lists no flavors"),
                });
            }
            for flavor in &flavors {
                flavor
                    .check_supported_by(version)
                    .map_err(|e| ToolchainError::Snapshot {
                        detail: e.to_string(),
                    })?;
            }
            let record = Record {
                image,
                platform: row.platform,
                flavors,
            };
            if records.insert(version, record).is_some() {
                return Err(ToolchainError::Snapshot {
                    detail: format!("duplicate entry for toolchain {version}"),
                });
            }
        }
        let digest = canonical_digest(&records)?;
        Ok(Self { records, digest })
    }

    /// Resolve `version` with the standard flavor.
    ///
    /// # Errors
    ///
    /// See [`ToolchainRegistry::resolve_flavor`].
    pub fn resolve(&self, version: ToolchainVersion) -> Result<ToolchainEntry, ToolchainError> {
        self.resolve_flavor(version, BuildFlavor::Standard)
    }

    /// Resolve an exact version and flavor to a pinned entry.
    ///
    /// # Errors
    ///
    /// - [`ToolchainError::NotFound`] if the version has no entry.
    /// - [`ToolchainError::IncompatibleFlavor`] if the entry's image does not
    ///   provide `flavor`.
    pub fn resolve_flavor(
        &self,
        version: ToolchainVersion,
        flavor: BuildFlavor,
    ) -> Result<ToolchainEntry, ToolchainError> {
        let record = self
            .records
            .get(&version)
            .ok_or(ToolchainError::NotFound { version })?;
        flavor.check_supported_by(version)?;
        if !record.flavors.contains(&flavor) {
            return Err(ToolchainError::IncompatibleFlavor {
                version,
                flavor,
                detail: format!(
                    "registered image provides only: {}",
                    record
                        .flavors
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        }
        ToolchainEntry::pinned(version, record.image.clone(), flavor, record.platform)
    }

    /// Flavors available for `version`, if registered.
    #[must_use]
    pub fn flavors(&self, version: ToolchainVersion) -> Option<Vec<BuildFlavor>> {
        self.records
            .get(&version)
            .map(|r| r.flavors.iter().copied().collect())
    }

    /// Registered versions in ascending order.
    pub fn versions(&self) -> impl Iterator<Item = ToolchainVersion> + '_ {
        self.records.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// SHA-256 over the registry's sorted JSON form, as lowercase hex.
    ///
    /// Two registries with the same rows produce the same digest regardless
    /// of row order in their source snapshots.
    #[must_use]
    pub fn digest(&self) -> String {
        self.digest.clone()
    }
}

/// Computed once per snapshot so a serialization failure rejects the load
/// instead of producing a digest of nothing.
fn canonical_digest(records: &BTreeMap<ToolchainVersion, Record>) -> Result<String, ToolchainError> {
    // BTreeMap keys and BTreeSet flavors serialize in sorted order.
    let by_string: BTreeMap<String, &Record> =
        records.iter().map(|(v, r)| (v.to_string(), r)).collect();
    let bytes = serde_json::to_vec(&by_string).map_err(|e| ToolchainError::Snapshot {
        detail: format!("cannot serialize registry for digest: {e}"),
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
