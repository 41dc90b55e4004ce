//! Source acquisition and library discovery.
//!
//! Every build gets its own temporary directory. A local path is copied into
//! it (minus `target/` and `.git/`), a repository is cloned into it and
//! checked out at the requested commit. The directory is removed when the
//! [`PreparedSource`] drops, on every exit path.

use std::path::{Component, Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use veribuild_chain::retry::{Attempt, RetryPolicy};
use walkdir::WalkDir;

use crate::cancel::RunControl;
use crate::orchestrator::{BuildError, BuildStage};
use crate::process::{self, ProcessError};

/// Where the program source comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLocation {
    Path { path: PathBuf },
    Repo { url: String, commit: Option<String> },
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path { path } => write!(f, "{}", path.display()),
            Self::Repo { url, commit: Some(c) } => write!(f, "{url}@{c}"),
            Self::Repo { url, commit: None } => write!(f, "{url}"),
        }
    }
}

/// A package that builds a library target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LibraryCandidate {
    pub name: String,
    /// Manifest path relative to the mount directory.
    pub manifest: PathBuf,
}

/// The library to build and the manifest that declares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibrarySelection {
    pub name: String,
    /// `None` builds from the mount root without `--manifest-path`.
    pub manifest: Option<PathBuf>,
}

/// A source tree materialized in a private temporary directory.
#[derive(Debug)]
pub struct PreparedSource {
    dir: TempDir,
    mount: PathBuf,
}

impl PreparedSource {
    /// Directory mounted into the build container.
    #[must_use]
    pub fn mount(&self) -> &Path {
        &self.mount
    }

    /// The temporary directory that owns everything.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// Copy or clone `location` into a fresh directory under `work_root`.
///
/// `mount_path` selects a subdirectory of the source to build from and must
/// stay inside it.
///
/// # Errors
///
/// [`BuildError::BuildFailure`] at [`BuildStage::Fetching`] for I/O and git
/// failures, [`BuildError::NetworkFailure`] once clone retries run out, and
/// interrupt errors from `ctl`.
pub fn prepare(
    location: &SourceLocation,
    mount_path: Option<&Path>,
    work_root: Option<&Path>,
    retry: &RetryPolicy,
    ctl: &RunControl,
) -> Result<PreparedSource, BuildError> {
    let fail = |detail: String| BuildError::BuildFailure {
        stage: BuildStage::Fetching,
        detail,
    };
    let relative = match mount_path {
        Some(p) => checked_relative(p).map_err(fail)?,
        None => PathBuf::new(),
    };

    let dir = match work_root {
        Some(root) => {
            std::fs::create_dir_all(root)
                .map_err(|e| fail(format!("work root {}: {e}", root.display())))?;
            tempfile::Builder::new().prefix("veribuild-").tempdir_in(root)
        }
        None => tempfile::Builder::new().prefix("veribuild-").tempdir(),
    }
    .map_err(|e| fail(format!("temporary directory: {e}")))?;

    let checkout = dir.path().join("src");
    match location {
        SourceLocation::Path { path } => copy_tree(path, &checkout).map_err(fail)?,
        SourceLocation::Repo { url, commit } => {
            clone(url, &checkout, retry, ctl)?;
            if let Some(commit) = commit {
                checkout_commit(&checkout, commit, ctl)?;
            }
        }
    }

    let mount = checkout.join(relative);
    if !mount.is_dir() {
        return Err(fail(format!(
            "mount path {} does not exist in the source",
            mount.display()
        )));
    }
    tracing::debug!(source = %location, mount = %mount.display(), "source prepared");
    Ok(PreparedSource { dir, mount })
}

fn checked_relative(p: &Path) -> Result<PathBuf, String> {
    if p.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        Ok(p.to_path_buf())
    } else {
        Err(format!(
            "mount path {} must be relative and stay inside the source",
            p.display()
        ))
    }
}

fn skipped(name: &std::ffi::OsStr) -> bool {
    name == "target" || name == ".git"
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), String> {
    if !from.is_dir() {
        return Err(format!("{} is not a directory", from.display()));
    }
    let walker = WalkDir::new(from)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(e.file_type().is_dir() && skipped(e.file_name())));
    for entry in walker {
        let entry = entry.map_err(|e| format!("walking {}: {e}", from.display()))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| e.to_string())?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)
                .map_err(|e| format!("creating {}: {e}", dest.display()))?;
        } else {
            std::fs::copy(entry.path(), &dest)
                .map_err(|e| format!("copying {}: {e}", entry.path().display()))?;
        }
    }
    Ok(())
}

fn git_failure(stage: BuildStage, e: ProcessError) -> BuildError {
    match e {
        ProcessError::Interrupted { interrupt, .. } => BuildError::interrupted(stage, interrupt),
        other => BuildError::BuildFailure {
            stage,
            detail: other.to_string(),
        },
    }
}

fn clone(url: &str, dest: &Path, retry: &RetryPolicy, ctl: &RunControl) -> Result<(), BuildError> {
    let result = retry.run(|attempt| {
        if attempt > 0 && dest.exists() {
            let _ = std::fs::remove_dir_all(dest);
        }
        let mut cmd = Command::new("git");
        cmd.args(["clone", "--quiet", url]).arg(dest);
        match process::run(cmd, ctl) {
            Ok(out) if out.status.success() => Ok(()),
            // Clone failures are mostly network: retry them.
            Ok(out) => Err(Attempt::Transient(BuildError::BuildFailure {
                stage: BuildStage::Fetching,
                detail: format!("git clone {url} failed: {}", out.stderr_tail),
            })),
            Err(e) => Err(Attempt::Terminal(git_failure(BuildStage::Fetching, e))),
        }
    });
    result.map_err(|failure| {
        if failure.retries_exhausted {
            BuildError::NetworkFailure {
                operation: format!("git clone {url}"),
                retries_exhausted: true,
                detail: failure.error.to_string(),
            }
        } else {
            failure.error
        }
    })
}

fn checkout_commit(repo: &Path, commit: &str, ctl: &RunControl) -> Result<(), BuildError> {
    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(repo)
        .args(["checkout", "--quiet", commit]);
    let out = process::run(cmd, ctl).map_err(|e| git_failure(BuildStage::Fetching, e))?;
    if out.status.success() {
        Ok(())
    } else {
        Err(BuildError::BuildFailure {
            stage: BuildStage::Fetching,
            detail: format!("git checkout {commit} failed: {}", out.stderr_tail),
        })
    }
}

/// Every package under `mount` that builds a library, sorted.
///
/// A manifest counts when it has a `[package]` and either a `[lib]` table or
/// a `src/lib.rs` beside it. Manifests that fail to parse are skipped.
///
/// # Errors
///
/// Directory traversal failure.
pub fn discover_libraries(mount: &Path) -> Result<Vec<LibraryCandidate>, String> {
    let mut found = Vec::new();
    let walker = WalkDir::new(mount)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(e.file_type().is_dir() && skipped(e.file_name())));
    for entry in walker {
        let entry = entry.map_err(|e| format!("walking {}: {e}", mount.display()))?;
        if !entry.file_type().is_file() || entry.file_name() != "Cargo.toml" {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let has_lib_rs = entry.path().with_file_name("src").join("lib.rs").is_file();
        let Some(name) = library_name(&text, has_lib_rs) else {
            continue;
        };
        let manifest = entry
            .path()
            .strip_prefix(mount)
            .map_err(|e| e.to_string())?
            .to_path_buf();
        found.push(LibraryCandidate { name, manifest });
    }
    found.sort();
    Ok(found)
}

/// `[lib] name`, else the package name with `-` replaced by `_`, as cargo
/// names the target.
fn library_name(manifest: &str, has_lib_rs: bool) -> Option<String> {
    let value: toml::Value = toml::from_str(manifest).ok()?;
    let package = value.get("package")?.get("name")?.as_str()?;
    let lib = value.get("lib");
    if lib.is_none() && !has_lib_rs {
        return None;
    }
    let declared = lib.and_then(|l| l.get("name")).and_then(toml::Value::as_str);
    Some(declared.map_or_else(|| package.replace('-', "_"), str::to_string))
}

/// Choose the library to build.
///
/// With a requested name, its declaring manifest is used when one exists;
/// otherwise the build runs from the mount root. Without one, exactly one
/// candidate must exist.
///
/// # Errors
///
/// [`BuildError::AmbiguousLibraryName`] listing every candidate when no name
/// is requested and the count is not exactly one.
pub fn select_library(
    candidates: &[LibraryCandidate],
    requested: Option<&str>,
) -> Result<LibrarySelection, BuildError> {
    if let Some(name) = requested {
        let manifest = candidates
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.manifest.clone());
        if manifest.is_none() {
            tracing::warn!(library = name, "no manifest declares this library; building from mount root");
        }
        return Ok(LibrarySelection {
            name: name.to_string(),
            manifest,
        });
    }
    match candidates {
        [only] => Ok(LibrarySelection {
            name: only.name.clone(),
            manifest: Some(only.manifest.clone()),
        }),
        _ => Err(BuildError::AmbiguousLibraryName {
            candidates: candidates.iter().map(|c| c.name.clone()).collect(),
        }),
    }
}
