//! Container runtime seam.
//!
//! [`ContainerRuntime`] is the only way the orchestrator touches build
//! isolation. [`DockerRuntime`] drives the `docker` CLI through
//! [`crate::process::run`]; tests substitute a recording fake.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use veribuild_kernel::toolchain::Platform;

use crate::cancel::{CancelToken, Interrupt, RunControl};
use crate::process::{self, ProcessError, ProcessOutput};

/// Bound on container removal, which runs even after cancellation.
pub const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// Worth retrying: registry or daemon hiccup.
    #[error("{operation}: {detail}")]
    Transient { operation: String, detail: String },
    #[error("{operation}: {detail}")]
    Failed { operation: String, detail: String },
    #[error("{operation} interrupted")]
    Interrupted {
        operation: String,
        interrupt: Interrupt,
    },
}

/// What to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub platform: Platform,
    /// Host directory and the container path it is mounted at.
    pub mount: Option<(PathBuf, String)>,
    /// `(memory, cpus)`.
    pub limits: Option<(String, String)>,
    /// Command keeping the container alive; empty runs the image default.
    pub command: Vec<String>,
}

/// Result of a command run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
}

pub trait ContainerRuntime: Send + Sync {
    /// Fetch `image` for `platform`. Failures are usually transient.
    ///
    /// # Errors
    ///
    /// [`RuntimeError`]; `Transient` for pull failures.
    fn pull(&self, image: &str, platform: Platform, ctl: &RunControl) -> Result<(), RuntimeError>;

    /// The image's default working directory.
    ///
    /// # Errors
    ///
    /// [`RuntimeError`].
    fn workdir(&self, image: &str, platform: Platform, ctl: &RunControl)
        -> Result<String, RuntimeError>;

    /// Start a detached container and return its id.
    ///
    /// # Errors
    ///
    /// [`RuntimeError`].
    fn start(&self, spec: &ContainerSpec, ctl: &RunControl) -> Result<String, RuntimeError>;

    /// Run `argv` inside the container.
    ///
    /// # Errors
    ///
    /// [`RuntimeError`] if the command could not be run at all. A non-zero
    /// exit is reported through [`ExecOutcome`].
    fn exec(
        &self,
        id: &str,
        workdir: Option<&str>,
        argv: &[String],
        ctl: &RunControl,
    ) -> Result<ExecOutcome, RuntimeError>;

    /// Cut the container off from every network.
    ///
    /// # Errors
    ///
    /// [`RuntimeError`].
    fn disconnect_network(&self, id: &str, ctl: &RunControl) -> Result<(), RuntimeError>;

    /// Copy `container_path` out to `host_path`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError`].
    fn copy_out(
        &self,
        id: &str,
        container_path: &str,
        host_path: &Path,
        ctl: &RunControl,
    ) -> Result<(), RuntimeError>;

    /// Force-remove the container. Must work after cancellation.
    ///
    /// # Errors
    ///
    /// [`RuntimeError`].
    fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}

/// Removes its container on drop, on every exit path including unwinding.
pub struct ContainerGuard<'a> {
    runtime: &'a dyn ContainerRuntime,
    id: String,
    owner: Option<MountOwner>,
}

impl<'a> ContainerGuard<'a> {
    #[must_use]
    pub fn new(runtime: &'a dyn ContainerRuntime, id: String) -> Self {
        Self {
            runtime,
            id,
            owner: None,
        }
    }

    /// Hand the bind mount back to `owner` before the container goes.
    #[must_use]
    pub fn with_mount_owner(mut self, owner: Option<MountOwner>) -> Self {
        self.owner = owner;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    fn restore_ownership(&self, owner: &MountOwner) {
        // Fresh control: the build's own token may already be cancelled.
        let ctl = RunControl::new(CancelToken::new(), Some(OWNERSHIP_RESTORE_TIMEOUT));
        match self.runtime.exec(&self.id, None, &owner.chown_command(), &ctl) {
            Ok(out) if out.success => {
                tracing::debug!(container = %self.id, path = %owner.container_path, "mount ownership restored");
            }
            Ok(out) => tracing::warn!(
                container = %self.id,
                exit_code = ?out.exit_code,
                stderr = %out.stderr_tail,
                "restoring mount ownership failed"
            ),
            Err(e) => tracing::warn!(container = %self.id, error = %e, "restoring mount ownership failed"),
        }
    }
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        if let Some(owner) = &self.owner {
            self.restore_ownership(owner);
        }
        match self.runtime.remove(&self.id) {
            Ok(()) => tracing::debug!(container = %self.id, "container removed"),
            Err(e) => tracing::warn!(container = %self.id, error = %e, "container removal failed"),
        }
    }
}

const OWNERSHIP_RESTORE_TIMEOUT: Duration = Duration::from_secs(120);

/// Host user and group that own a bind-mounted directory.
///
/// Build containers run as root, so everything they write into the mount is
/// root-owned until handed back. Without that the per-build temporary
/// directory cannot be removed by an unprivileged caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOwner {
    pub container_path: String,
    pub uid: u32,
    pub gid: u32,
}

impl MountOwner {
    /// The owner of `host`, mounted at `container_path`. `None` where file
    /// ownership is not numeric.
    #[must_use]
    pub fn of(host: &Path, container_path: &str) -> Option<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let meta = std::fs::metadata(host).ok()?;
            Some(Self {
                container_path: container_path.to_string(),
                uid: meta.uid(),
                gid: meta.gid(),
            })
        }
        #[cfg(not(unix))]
        {
            let _ = (host, container_path);
            None
        }
    }

    #[must_use]
    pub fn chown_command(&self) -> Vec<String> {
        vec![
            "chown".into(),
            "-R".into(),
            format!("{}:{}", self.uid, self.gid),
            self.container_path.clone(),
        ]
    }
}

/// The `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerRuntime {
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd
    }

    fn run(&self, operation: &str, cmd: Command, ctl: &RunControl) -> Result<ProcessOutput, RuntimeError> {
        process::run(cmd, ctl).map_err(|e| match e {
            ProcessError::Interrupted { interrupt, .. } => RuntimeError::Interrupted {
                operation: operation.to_string(),
                interrupt,
            },
            other => RuntimeError::Failed {
                operation: operation.to_string(),
                detail: other.to_string(),
            },
        })
    }

    fn run_ok(&self, operation: &str, cmd: Command, ctl: &RunControl) -> Result<ProcessOutput, RuntimeError> {
        let out = self.run(operation, cmd, ctl)?;
        if out.status.success() {
            Ok(out)
        } else {
            Err(RuntimeError::Failed {
                operation: operation.to_string(),
                detail: out.stderr_tail,
            })
        }
    }
}

impl ContainerRuntime for DockerRuntime {
    fn pull(&self, image: &str, platform: Platform, ctl: &RunControl) -> Result<(), RuntimeError> {
        let cmd = self.command(["pull", "--quiet", "--platform", platform.docker_platform(), image]);
        match self.run_ok("docker pull", cmd, ctl) {
            Ok(_) => Ok(()),
            Err(RuntimeError::Failed { operation, detail }) => {
                Err(RuntimeError::Transient { operation, detail })
            }
            Err(e) => Err(e),
        }
    }

    fn workdir(
        &self,
        image: &str,
        platform: Platform,
        ctl: &RunControl,
    ) -> Result<String, RuntimeError> {
        let cmd = self.command([
            "run",
            "--rm",
            "--platform",
            platform.docker_platform(),
            image,
            "pwd",
        ]);
        let line = self.run_ok("docker run pwd", cmd, ctl)?.stdout_line();
        if line.starts_with('/') {
            Ok(line)
        } else {
            Err(RuntimeError::Failed {
                operation: "docker run pwd".into(),
                detail: format!("unexpected working directory {line:?}"),
            })
        }
    }

    fn start(&self, spec: &ContainerSpec, ctl: &RunControl) -> Result<String, RuntimeError> {
        let mut cmd = self.command([
            "run",
            "--rm",
            "-dit",
            "--platform",
            spec.platform.docker_platform(),
        ]);
        if let Some((host, container)) = &spec.mount {
            let mut volume = host.as_os_str().to_os_string();
            volume.push(":");
            volume.push(container);
            cmd.arg("-v").arg(volume);
        }
        if let Some((memory, cpus)) = &spec.limits {
            cmd.args(["--memory", memory, "--cpus", cpus]);
        }
        cmd.arg(&spec.image).args(&spec.command);
        let id = self.run_ok("docker run", cmd, ctl)?.stdout_line();
        if id.is_empty() {
            return Err(RuntimeError::Failed {
                operation: "docker run".into(),
                detail: "no container id on stdout".into(),
            });
        }
        Ok(id)
    }

    fn exec(
        &self,
        id: &str,
        workdir: Option<&str>,
        argv: &[String],
        ctl: &RunControl,
    ) -> Result<ExecOutcome, RuntimeError> {
        let mut cmd = self.command(["exec"]);
        if let Some(dir) = workdir {
            cmd.args(["-w", dir]);
        }
        cmd.arg(id).args(argv);
        let out = self.run("docker exec", cmd, ctl)?;
        Ok(ExecOutcome {
            success: out.status.success(),
            exit_code: out.status.code(),
            stderr_tail: out.stderr_tail,
        })
    }

    fn disconnect_network(&self, id: &str, ctl: &RunControl) -> Result<(), RuntimeError> {
        let cmd = self.command(["network", "disconnect", "--force", "bridge", id]);
        self.run_ok("docker network disconnect", cmd, ctl).map(|_| ())
    }

    fn copy_out(
        &self,
        id: &str,
        container_path: &str,
        host_path: &Path,
        ctl: &RunControl,
    ) -> Result<(), RuntimeError> {
        let mut cmd = self.command(["cp", &format!("{id}:{container_path}")]);
        cmd.arg(host_path);
        self.run_ok("docker cp", cmd, ctl).map(|_| ())
    }

    fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        // Fresh control: the build's own token may already be cancelled.
        let ctl = RunControl::new(CancelToken::new(), Some(REMOVE_TIMEOUT));
        let cmd = self.command(["rm", "-f", id]);
        self.run_ok("docker rm", cmd, &ctl).map(|_| ())
    }
}
