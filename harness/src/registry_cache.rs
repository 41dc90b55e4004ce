//! Read-mostly toolchain registry cache shared across concurrent builds.
//!
//! Builds take an `Arc` snapshot and never write. Only [`RegistryCache::refresh`]
//! swaps the table, and a build that already holds a snapshot keeps resolving
//! against it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use veribuild_kernel::toolchain::{ToolchainError, ToolchainRegistry};

#[derive(Debug)]
pub struct RegistryCache {
    source: Option<PathBuf>,
    current: RwLock<Arc<ToolchainRegistry>>,
}

impl RegistryCache {
    /// A cache over an already-built registry. `refresh` reloads the built-in table.
    #[must_use]
    pub fn new(registry: ToolchainRegistry) -> Self {
        Self {
            source: None,
            current: RwLock::new(Arc::new(registry)),
        }
    }

    /// Load from a snapshot file, or the built-in table when `path` is `None`.
    ///
    /// # Errors
    ///
    /// [`ToolchainError::Snapshot`] for an unreadable or invalid snapshot.
    pub fn load(path: Option<&Path>) -> Result<Self, ToolchainError> {
        let registry = load_registry(path)?;
        Ok(Self {
            source: path.map(Path::to_path_buf),
            current: RwLock::new(Arc::new(registry)),
        })
    }

    /// The current table. Cheap; clones an `Arc`.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ToolchainRegistry> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Reload from the original source and swap it in.
    ///
    /// A failed reload leaves the current table in place.
    ///
    /// # Errors
    ///
    /// As [`RegistryCache::load`].
    pub fn refresh(&self) -> Result<Arc<ToolchainRegistry>, ToolchainError> {
        let fresh = Arc::new(load_registry(self.source.as_deref())?);
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.digest() != fresh.digest() {
            tracing::info!(
                old = %guard.digest(),
                new = %fresh.digest(),
                entries = fresh.len(),
                "toolchain registry refreshed"
            );
        }
        *guard = Arc::clone(&fresh);
        Ok(fresh)
    }
}

fn load_registry(path: Option<&Path>) -> Result<ToolchainRegistry, ToolchainError> {
    match path {
        None => ToolchainRegistry::builtin(),
        Some(p) => {
            let text = std::fs::read_to_string(p).map_err(|e| ToolchainError::Snapshot {
                detail: format!("{}: {e}", p.display()),
            })?;
            ToolchainRegistry::from_toml_str(&text)
        }
    }
}
