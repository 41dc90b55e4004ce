//! Deterministic build orchestration.
//!
//! # Pipeline
//!
//! ```text
//! Resolving (explicit toolchain) → Fetching (copy or clone source)
//!   → Resolving (lockfile-detected toolchain, library selection)
//!   → Vendoring (pull image, start container, cargo fetch, cut network)
//!   → Compiling (offline, locked) → Extracting (target/deploy/<lib>.so) → Done
//! ```
//!
//! Each stage checks the run's [`RunControl`] first, so a cancelled or
//! timed-out build stops at the next boundary or kills the running child.
//! The container and the temporary source tree are owned by guards and are
//! released on every exit path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use veribuild_chain::retry::{Attempt, RetryPolicy};
use veribuild_kernel::artifact::Artifact;
use veribuild_kernel::toolchain::{
    BuildFlavor, ImageRef, Platform, ToolchainEntry, ToolchainError, ToolchainRegistry,
    ToolchainVersion, VendoringStrategy,
};
use walkdir::WalkDir;

use crate::cancel::{CancelToken, Interrupt, RunControl};
use crate::config::EngineConfig;
use crate::lockfile::{self, LockfileError};
use crate::registry_cache::RegistryCache;
use crate::runtime::{ContainerGuard, ContainerRuntime, ContainerSpec, MountOwner, RuntimeError};
use crate::source::{self, LibrarySelection, PreparedSource, SourceLocation};

/// Toolchain used when legacy BPF mode is requested without a version.
pub const LEGACY_BPF_VERSION: (u32, u32, u32) = (1, 13, 5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Resolving,
    Fetching,
    Vendoring,
    Compiling,
    Extracting,
    Done,
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Resolving => "resolving",
            Self::Fetching => "fetching",
            Self::Vendoring => "vendoring",
            Self::Compiling => "compiling",
            Self::Extracting => "extracting",
            Self::Done => "done",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// No library name given and the source does not declare exactly one.
    #[error("cannot choose a library to build; candidates: [{}]", candidates.join(", "))]
    AmbiguousLibraryName { candidates: Vec<String> },
    /// Deterministic failure; `detail` is the offending step's own output.
    #[error("build failed while {stage}: {detail}")]
    BuildFailure { stage: BuildStage, detail: String },
    #[error("build timed out while {stage} after {}s", elapsed.as_secs())]
    Timeout { stage: BuildStage, elapsed: Duration },
    #[error("build cancelled while {stage}")]
    Cancelled { stage: BuildStage },
    #[error("{operation} failed (retries exhausted: {retries_exhausted}): {detail}")]
    NetworkFailure {
        operation: String,
        retries_exhausted: bool,
        detail: String,
    },
    #[error(transparent)]
    Toolchain(#[from] ToolchainError),
}

impl BuildError {
    #[must_use]
    pub fn interrupted(stage: BuildStage, interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => Self::Cancelled { stage },
            Interrupt::TimedOut { elapsed } => Self::Timeout { stage, elapsed },
        }
    }

    fn from_runtime(stage: BuildStage, e: RuntimeError) -> Self {
        match e {
            RuntimeError::Interrupted { interrupt, .. } => Self::interrupted(stage, interrupt),
            RuntimeError::Transient { operation, detail } => Self::NetworkFailure {
                operation,
                retries_exhausted: false,
                detail,
            },
            RuntimeError::Failed { operation, detail } => Self::BuildFailure {
                stage,
                detail: format!("{operation}: {detail}"),
            },
        }
    }

    fn from_lockfile(e: LockfileError) -> Self {
        match e {
            LockfileError::Version(t) => Self::Toolchain(t),
            other => Self::BuildFailure {
                stage: BuildStage::Resolving,
                detail: other.to_string(),
            },
        }
    }
}

/// How the build environment is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolchainSelector {
    /// Read the locked toolchain version from the source's `Cargo.lock`.
    Detect,
    /// An exact registry version.
    Version(ToolchainVersion),
    /// A fully resolved entry.
    Pinned(ToolchainEntry),
    /// A digest-pinned image outside the registry. The version still comes
    /// from the lockfile and decides the vendoring strategy.
    Image(ImageRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub source: SourceLocation,
    /// Subdirectory of the source to build from.
    pub mount_path: Option<PathBuf>,
    pub library_name: Option<String>,
    pub toolchain: ToolchainSelector,
    /// Passed as one `--features` list, in order.
    pub cargo_features: Vec<String>,
    /// Extra arguments appended verbatim to the compile command.
    pub cargo_args: Vec<String>,
    pub bpf_mode: bool,
}

impl BuildSpec {
    #[must_use]
    pub fn new(source: SourceLocation) -> Self {
        Self {
            source,
            mount_path: None,
            library_name: None,
            toolchain: ToolchainSelector::Detect,
            cargo_features: Vec::new(),
            cargo_args: Vec::new(),
            bpf_mode: false,
        }
    }

    fn flavor(&self) -> BuildFlavor {
        if self.bpf_mode {
            BuildFlavor::LegacyBpf
        } else {
            BuildFlavor::Standard
        }
    }
}

/// A successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArtifact {
    pub artifact: Artifact,
    pub library: String,
    pub toolchain: ToolchainEntry,
    /// Digest of the registry snapshot the toolchain was resolved from.
    pub registry_digest: String,
}

/// Orchestrator knobs, normally taken from [`EngineConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    pub timeout: Duration,
    pub work_root: Option<PathBuf>,
    pub limits: Option<(String, String)>,
    pub retry: RetryPolicy,
}

impl BuildSettings {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.build.timeout(),
            work_root: config.build.work_root.clone(),
            limits: config.build.resource_limits(),
            retry: config.retry,
        }
    }
}

pub struct BuildOrchestrator<R> {
    runtime: R,
    registry: Arc<RegistryCache>,
    settings: BuildSettings,
}

impl<R: ContainerRuntime> BuildOrchestrator<R> {
    #[must_use]
    pub fn new(runtime: R, registry: Arc<RegistryCache>, settings: BuildSettings) -> Self {
        Self {
            runtime,
            registry,
            settings,
        }
    }

    #[must_use]
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    #[must_use]
    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Build `spec` to a single artifact.
    ///
    /// # Errors
    ///
    /// Any [`BuildError`]. Timeouts and cancellation are reported with the
    /// stage that was running.
    pub fn build(&self, spec: &BuildSpec, cancel: &CancelToken) -> Result<BuiltArtifact, BuildError> {
        let ctl = RunControl::new(cancel.clone(), Some(self.settings.timeout));
        let registry = self.registry.snapshot();
        let span = tracing::info_span!("build", source = %spec.source);
        let _enter = span.enter();

        let early = stage(BuildStage::Resolving, &ctl, || {
            resolve_explicit(&registry, spec)
        })?;

        let prepared = stage(BuildStage::Fetching, &ctl, || {
            source::prepare(
                &spec.source,
                spec.mount_path.as_deref(),
                self.settings.work_root.as_deref(),
                &self.settings.retry,
                &ctl,
            )
        })?;

        let (toolchain, library) = stage(BuildStage::Resolving, &ctl, || {
            let toolchain = match early {
                Some(entry) => entry,
                None => resolve_from_lockfile(&registry, spec, prepared.mount())?,
            };
            let candidates = source::discover_libraries(prepared.mount()).map_err(|detail| {
                BuildError::BuildFailure {
                    stage: BuildStage::Resolving,
                    detail,
                }
            })?;
            let library = source::select_library(&candidates, spec.library_name.as_deref())?;
            tracing::info!(
                toolchain = %toolchain.version(),
                image = %toolchain.image(),
                flavor = %toolchain.flavor(),
                library = %library.name,
                "build resolved"
            );
            Ok((toolchain, library))
        })?;

        let artifact = self.build_in_container(spec, &prepared, &toolchain, &library, &ctl)?;
        tracing::info!(stage = %BuildStage::Done, bytes = artifact.len(), elapsed_ms = ctl.elapsed().as_millis(), "build finished");
        Ok(BuiltArtifact {
            artifact,
            library: library.name,
            toolchain,
            registry_digest: registry.digest(),
        })
    }

    fn build_in_container(
        &self,
        spec: &BuildSpec,
        prepared: &PreparedSource,
        toolchain: &ToolchainEntry,
        library: &LibrarySelection,
        ctl: &RunControl,
    ) -> Result<Artifact, BuildError> {
        let image = toolchain.image().as_str();
        let platform = toolchain.platform();
        let vendoring = toolchain.version().vendoring_strategy();

        let (guard, workdir) = stage(BuildStage::Vendoring, ctl, || {
            self.pull(image, platform, ctl)?;
            let workdir = self
                .runtime
                .workdir(image, platform, ctl)
                .map_err(|e| BuildError::from_runtime(BuildStage::Vendoring, e))?;
            let id = self
                .runtime
                .start(
                    &ContainerSpec {
                        image: image.to_string(),
                        platform,
                        mount: Some((prepared.mount().to_path_buf(), workdir.clone())),
                        limits: self.settings.limits.clone(),
                        command: vec!["bash".into()],
                    },
                    ctl,
                )
                .map_err(|e| BuildError::from_runtime(BuildStage::Vendoring, e))?;
            let guard = ContainerGuard::new(&self.runtime, id)
                .with_mount_owner(MountOwner::of(prepared.mount(), &workdir));
            let fetch = fetch_command(vendoring, &workdir, library);
            self.exec_checked(BuildStage::Vendoring, guard.id(), Some(&workdir), &fetch, ctl)?;
            self.runtime
                .disconnect_network(guard.id(), ctl)
                .map_err(|e| BuildError::from_runtime(BuildStage::Vendoring, e))?;
            Ok((guard, workdir))
        })?;

        stage(BuildStage::Compiling, ctl, || {
            let build_dir = container_path(&workdir, library.manifest.as_deref().and_then(Path::parent));
            let argv = compile_command(toolchain.flavor(), vendoring, &workdir, library, spec);
            self.exec_checked(BuildStage::Compiling, guard.id(), Some(&build_dir), &argv, ctl)
        })?;

        let artifact = stage(BuildStage::Extracting, ctl, || {
            extract_artifact(prepared.mount(), &library.name)
        })?;
        drop(guard);
        Ok(artifact)
    }

    /// Copy one executable out of a prebuilt image.
    ///
    /// `path_in_image` is relative to the image's working directory.
    ///
    /// # Errors
    ///
    /// [`BuildError`] at the `Vendoring` or `Extracting` stage.
    pub fn extract_from_image(
        &self,
        image: &ImageRef,
        platform: Platform,
        path_in_image: &str,
        cancel: &CancelToken,
    ) -> Result<Artifact, BuildError> {
        let ctl = RunControl::new(cancel.clone(), Some(self.settings.timeout));
        let span = tracing::info_span!("extract", image = %image);
        let _enter = span.enter();

        let (guard, workdir) = stage(BuildStage::Vendoring, &ctl, || {
            self.pull(image.as_str(), platform, &ctl)?;
            let workdir = self
                .runtime
                .workdir(image.as_str(), platform, &ctl)
                .map_err(|e| BuildError::from_runtime(BuildStage::Vendoring, e))?;
            let id = self
                .runtime
                .start(
                    &ContainerSpec {
                        image: image.as_str().to_string(),
                        platform,
                        mount: None,
                        limits: self.settings.limits.clone(),
                        command: Vec::new(),
                    },
                    &ctl,
                )
                .map_err(|e| BuildError::from_runtime(BuildStage::Vendoring, e))?;
            Ok((ContainerGuard::new(&self.runtime, id), workdir))
        })?;

        stage(BuildStage::Extracting, &ctl, || {
            let fail = |detail: String| BuildError::BuildFailure {
                stage: BuildStage::Extracting,
                detail,
            };
            let scratch = scratch_dir(self.settings.work_root.as_deref()).map_err(fail)?;
            let host = scratch.path().join("program.so");
            let inside = format!("{}/{}", workdir.trim_end_matches('/'), path_in_image.trim_start_matches('/'));
            self.runtime
                .copy_out(guard.id(), &inside, &host, &ctl)
                .map_err(|e| BuildError::from_runtime(BuildStage::Extracting, e))?;
            let bytes = std::fs::read(&host).map_err(|e| fail(format!("{}: {e}", host.display())))?;
            Ok(Artifact::new(bytes))
        })
    }

    fn pull(&self, image: &str, platform: Platform, ctl: &RunControl) -> Result<(), BuildError> {
        self.settings
            .retry
            .run(|_| match self.runtime.pull(image, platform, ctl) {
                Ok(()) => Ok(()),
                Err(e @ RuntimeError::Transient { .. }) => Err(Attempt::Transient(e)),
                Err(e) => Err(Attempt::Terminal(e)),
            })
            .map_err(|failure| match failure.error {
                RuntimeError::Transient { operation, detail } => BuildError::NetworkFailure {
                    operation: format!("{operation} {image}"),
                    retries_exhausted: failure.retries_exhausted,
                    detail,
                },
                other => BuildError::from_runtime(BuildStage::Vendoring, other),
            })
    }

    fn exec_checked(
        &self,
        stage: BuildStage,
        id: &str,
        workdir: Option<&str>,
        argv: &[String],
        ctl: &RunControl,
    ) -> Result<(), BuildError> {
        tracing::debug!(%stage, command = %argv.join(" "), "exec");
        let outcome = self
            .runtime
            .exec(id, workdir, argv, ctl)
            .map_err(|e| BuildError::from_runtime(stage, e))?;
        if outcome.success {
            Ok(())
        } else {
            Err(BuildError::BuildFailure {
                stage,
                detail: format!(
                    "`{}` exited with {}:\n{}",
                    argv.join(" "),
                    outcome
                        .exit_code
                        .map_or_else(|| "a signal".to_string(), |c| format!("status {c}")),
                    outcome.stderr_tail
                ),
            })
        }
    }
}

/// Enter `stage`: check for interrupts, then run `f` inside a span.
fn stage<T>(
    stage: BuildStage,
    ctl: &RunControl,
    f: impl FnOnce() -> Result<T, BuildError>,
) -> Result<T, BuildError> {
    ctl.check()
        .map_err(|i| BuildError::interrupted(stage, i))?;
    let span = tracing::info_span!("stage", %stage);
    let _enter = span.enter();
    tracing::debug!("stage started");
    let result = f();
    if let Err(e) = &result {
        tracing::warn!(error = %e, "stage failed");
    }
    result
}

/// Resolve selectors that do not need the source tree.
fn resolve_explicit(
    registry: &ToolchainRegistry,
    spec: &BuildSpec,
) -> Result<Option<ToolchainEntry>, BuildError> {
    let flavor = spec.flavor();
    match &spec.toolchain {
        ToolchainSelector::Detect if spec.bpf_mode => {
            let (major, minor, patch) = LEGACY_BPF_VERSION;
            let v = ToolchainVersion::new(major, minor, patch)?;
            Ok(Some(registry.resolve_flavor(v, BuildFlavor::LegacyBpf)?))
        }
        ToolchainSelector::Detect | ToolchainSelector::Image(_) => Ok(None),
        ToolchainSelector::Version(v) => Ok(Some(registry.resolve_flavor(*v, flavor)?)),
        ToolchainSelector::Pinned(entry) => {
            if entry.flavor() != flavor && (spec.bpf_mode || entry.flavor() == BuildFlavor::LegacyBpf) {
                return Err(ToolchainError::IncompatibleFlavor {
                    version: entry.version(),
                    flavor,
                    detail: format!("pinned entry is {}", entry.flavor()),
                }
                .into());
            }
            Ok(Some(entry.clone()))
        }
    }
}

fn resolve_from_lockfile(
    registry: &ToolchainRegistry,
    spec: &BuildSpec,
    mount: &Path,
) -> Result<ToolchainEntry, BuildError> {
    let version = lockfile::detect_toolchain_version(mount).map_err(BuildError::from_lockfile)?;
    tracing::info!(%version, "toolchain detected from Cargo.lock");
    match &spec.toolchain {
        ToolchainSelector::Image(image) => Ok(ToolchainEntry::pinned(
            version,
            image.clone(),
            spec.flavor(),
            Platform::default(),
        )?),
        _ => Ok(registry.resolve_flavor(version, spec.flavor())?),
    }
}

fn container_path(workdir: &str, rel: Option<&Path>) -> String {
    let mut out = workdir.trim_end_matches('/').to_string();
    if let Some(rel) = rel {
        for part in rel.iter() {
            out.push('/');
            out.push_str(&part.to_string_lossy());
        }
    }
    out
}

fn manifest_args(workdir: &str, library: &LibrarySelection) -> Vec<String> {
    library
        .manifest
        .as_deref()
        .map(|m| vec!["--manifest-path".to_string(), container_path(workdir, Some(m))])
        .unwrap_or_default()
}

const SPARSE_CONFIG: [&str; 2] = ["--config", "registries.crates-io.protocol=\"sparse\""];

/// Dependency resolution, run while the container still has network.
fn fetch_command(strategy: VendoringStrategy, workdir: &str, library: &LibrarySelection) -> Vec<String> {
    let mut argv: Vec<String> = vec!["cargo".into()];
    match strategy {
        VendoringStrategy::GitCliFetch => {
            argv.extend(["--config", "net.git-fetch-with-cli=true"].map(String::from));
        }
        VendoringStrategy::SparseRegistry => argv.extend(SPARSE_CONFIG.map(String::from)),
    }
    argv.extend(["fetch", "--locked"].map(String::from));
    argv.extend(manifest_args(workdir, library));
    argv
}

/// The offline, locked compile.
fn compile_command(
    flavor: BuildFlavor,
    strategy: VendoringStrategy,
    workdir: &str,
    library: &LibrarySelection,
    spec: &BuildSpec,
) -> Vec<String> {
    let mut argv: Vec<String> = vec!["cargo".into(), flavor.cargo_subcommand().into(), "--".into()];
    match strategy {
        VendoringStrategy::GitCliFetch => argv.extend(["--frozen", "--locked"].map(String::from)),
        VendoringStrategy::SparseRegistry => {
            argv.extend(SPARSE_CONFIG.map(String::from));
            argv.extend(["--locked", "--offline"].map(String::from));
        }
    }
    argv.extend(manifest_args(workdir, library));
    if !spec.cargo_features.is_empty() {
        argv.push("--features".into());
        argv.push(spec.cargo_features.join(","));
    }
    argv.extend(spec.cargo_args.iter().cloned());
    argv
}

/// Exactly one `target/deploy/<library>.so` under `mount`.
fn extract_artifact(mount: &Path, library: &str) -> Result<Artifact, BuildError> {
    let fail = |detail: String| BuildError::BuildFailure {
        stage: BuildStage::Extracting,
        detail,
    };
    let file_name = format!("{library}.so");
    let found: Vec<PathBuf> = WalkDir::new(mount)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == file_name)
        .map(walkdir::DirEntry::into_path)
        .filter(|p| {
            p.parent()
                .is_some_and(|d| d.ends_with(Path::new("target").join("deploy")))
        })
        .collect();
    match found.as_slice() {
        [one] => {
            let bytes = std::fs::read(one).map_err(|e| fail(format!("{}: {e}", one.display())))?;
            tracing::debug!(path = %one.display(), bytes = bytes.len(), "artifact extracted");
            Ok(Artifact::new(bytes))
        }
        [] => Err(fail(format!("no target/deploy/{file_name} was produced"))),
        many => Err(fail(format!(
            "{} candidates for {file_name}: {}",
            many.len(),
            many.iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

fn scratch_dir(work_root: Option<&Path>) -> Result<tempfile::TempDir, String> {
    let builder = {
        let mut b = tempfile::Builder::new();
        b.prefix("veribuild-image-");
        b
    };
    match work_root {
        Some(root) => builder.tempdir_in(root),
        None => builder.tempdir(),
    }
    .map_err(|e| format!("temporary directory: {e}"))
}
