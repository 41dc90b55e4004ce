//! `Cargo.lock` inspection for toolchain auto-detection.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use veribuild_kernel::toolchain::{ToolchainError, ToolchainVersion};

/// Package whose locked version names the toolchain a program was built for.
pub const TOOLCHAIN_PACKAGE: &str = "solana-program";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockfileError {
    #[error("no Cargo.lock at {}", path.display())]
    Missing { path: PathBuf },
    #[error("unreadable Cargo.lock at {}: {detail}", path.display())]
    Parse { path: PathBuf, detail: String },
    #[error("Cargo.lock does not lock {package}")]
    PackageNotFound { package: String },
    #[error("Cargo.lock locks several versions of {package}: {}", versions.join(", "))]
    Conflicting {
        package: String,
        versions: Vec<String>,
    },
    #[error(transparent)]
    Version(#[from] ToolchainError),
}

#[derive(Deserialize)]
struct Lockfile {
    #[serde(default)]
    package: Vec<LockedPackage>,
}

#[derive(Deserialize)]
struct LockedPackage {
    name: String,
    version: String,
}

/// The toolchain version locked in `<root>/Cargo.lock`.
///
/// # Errors
///
/// A missing or unparsable lockfile, no locked toolchain package, several
/// distinct locked versions, or a version the registry cannot represent.
pub fn detect_toolchain_version(root: &Path) -> Result<ToolchainVersion, LockfileError> {
    let path = root.join("Cargo.lock");
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LockfileError::Missing { path })
        }
        Err(e) => {
            return Err(LockfileError::Parse {
                path,
                detail: e.to_string(),
            })
        }
    };
    locked_version(&text, TOOLCHAIN_PACKAGE).map_err(|e| match e {
        LockfileError::Parse { detail, .. } => LockfileError::Parse { path, detail },
        other => other,
    })
}

/// The single locked version of `package` in lockfile text.
///
/// # Errors
///
/// As [`detect_toolchain_version`]; `Parse` errors carry an empty path.
pub fn locked_version(text: &str, package: &str) -> Result<ToolchainVersion, LockfileError> {
    let lock: Lockfile = toml::from_str(text).map_err(|e| LockfileError::Parse {
        path: PathBuf::new(),
        detail: e.to_string(),
    })?;
    let versions: BTreeSet<&str> = lock
        .package
        .iter()
        .filter(|p| p.name == package)
        .map(|p| p.version.as_str())
        .collect();
    match versions.len() {
        0 => Err(LockfileError::PackageNotFound {
            package: package.to_string(),
        }),
        1 => {
            let raw = versions.into_iter().next().unwrap_or_default();
            Ok(raw.parse()?)
        }
        _ => Err(LockfileError::Conflicting {
            package: package.to_string(),
            versions: versions.into_iter().map(str::to_string).collect(),
        }),
    }
}
