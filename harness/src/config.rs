//! Engine configuration: TOML file, then environment overrides, then
//! fail-closed validation.
//!
//! ```toml
//! rpc_url = "devnet"
//! max_concurrent_fetches = 4
//! registry_path = "/etc/veribuild/toolchains.toml"
//!
//! [retry]
//! max_retries = 3
//!
//! [build]
//! timeout_secs = 1800
//! memory_limit = "8g"
//! cpu_limit = "4"
//!
//! [remote]
//! base_url = "https://verify.osec.io"
//! ```
//!
//! Every field has a default, so an empty file (or no file) is valid.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use veribuild_chain::remote::DEFAULT_REMOTE_URL;
use veribuild_chain::retry::RetryPolicy;
use veribuild_chain::rpc::{resolve_cluster_url, MAINNET_URL};

pub const ENV_CONFIG_PATH: &str = "VERIBUILD_CONFIG";
pub const ENV_RPC_URL: &str = "VERIBUILD_RPC_URL";
pub const ENV_REMOTE_URL: &str = "VERIBUILD_REMOTE_URL";
pub const ENV_MEMORY_LIMIT: &str = "VERIBUILD_DOCKER_MEMORY_LIMIT";
pub const ENV_CPU_LIMIT: &str = "VERIBUILD_DOCKER_CPU_LIMIT";

/// Upper bound on parallel RPC fetches.
pub const MAX_CONCURRENT_FETCHES_LIMIT: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// RPC endpoint URL or cluster alias.
    pub rpc_url: String,
    pub rpc_timeout_ms: u64,
    pub max_concurrent_fetches: usize,
    /// Toolchain registry snapshot replacing the built-in table.
    pub registry_path: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub build: BuildConfig,
    pub remote: RemoteConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rpc_url: MAINNET_URL.to_string(),
            rpc_timeout_ms: 30_000,
            max_concurrent_fetches: 4,
            registry_path: None,
            retry: RetryPolicy::default(),
            build: BuildConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Overall deadline for one build, all stages included.
    pub timeout_secs: u64,
    /// Parent of per-build temporary directories; system temp dir if unset.
    pub work_root: Option<PathBuf>,
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<String>,
    pub docker_binary: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60 * 60,
            work_root: None,
            memory_limit: None,
            cpu_limit: None,
            docker_binary: "docker".into(),
        }
    }
}

impl BuildConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `(memory, cpus)` only when both limits are set.
    #[must_use]
    pub fn resource_limits(&self) -> Option<(String, String)> {
        match (&self.memory_limit, &self.cpu_limit) {
            (Some(m), Some(c)) => Some((m.clone(), c.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REMOTE_URL.into(),
            timeout_ms: 60_000,
        }
    }
}

impl EngineConfig {
    /// Load from `path` (if any), apply process environment overrides, validate.
    ///
    /// # Errors
    ///
    /// I/O, parse, or validation failure.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env: BTreeMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with("VERIBUILD_"))
            .collect();
        Self::load_with_env(path, &env)
    }

    /// Like [`EngineConfig::load`] with an explicit environment.
    ///
    /// # Errors
    ///
    /// I/O, parse, or validation failure.
    pub fn load_with_env(
        path: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|source| ConfigError::Io {
                    path: p.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Parse failure. Validation is not run.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env(&mut self, env: &BTreeMap<String, String>) {
        let get = |key: &str| env.get(key).filter(|v| !v.trim().is_empty()).cloned();
        if let Some(url) = get(ENV_RPC_URL) {
            self.rpc_url = url;
        }
        if let Some(url) = get(ENV_REMOTE_URL) {
            self.remote.base_url = url;
        }
        if let Some(m) = get(ENV_MEMORY_LIMIT) {
            self.build.memory_limit = Some(m);
        }
        if let Some(c) = get(ENV_CPU_LIMIT) {
            self.build.cpu_limit = Some(c);
        }
    }

    /// # Errors
    ///
    /// [`ConfigError::Validation`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Validation(msg));
        if let Err(e) = resolve_cluster_url(&self.rpc_url) {
            return fail(format!("rpc_url: {e}"));
        }
        if self.rpc_timeout_ms == 0 {
            return fail("rpc_timeout_ms must be > 0".into());
        }
        if self.max_concurrent_fetches == 0
            || self.max_concurrent_fetches > MAX_CONCURRENT_FETCHES_LIMIT
        {
            return fail(format!(
                "max_concurrent_fetches must be in 1..={MAX_CONCURRENT_FETCHES_LIMIT}"
            ));
        }
        if let Err(e) = self.retry.validate() {
            return fail(format!("retry: {e}"));
        }
        if self.build.timeout_secs == 0 {
            return fail("build.timeout_secs must be > 0".into());
        }
        if self.build.docker_binary.trim().is_empty() {
            return fail("build.docker_binary must not be empty".into());
        }
        if !(self.remote.base_url.starts_with("https://")
            || self.remote.base_url.starts_with("http://"))
        {
            return fail("remote.base_url must be an http(s) URL".into());
        }
        if self.remote.timeout_ms == 0 {
            return fail("remote.timeout_ms must be > 0".into());
        }
        Ok(())
    }

    /// The RPC endpoint with aliases expanded.
    ///
    /// # Errors
    ///
    /// Unknown alias (already rejected by [`EngineConfig::validate`]).
    pub fn resolved_rpc_url(&self) -> Result<String, ConfigError> {
        resolve_cluster_url(&self.rpc_url).map_err(|e| ConfigError::Validation(e.to_string()))
    }

    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote.timeout_ms)
    }
}
