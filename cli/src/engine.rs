//! Wiring: configuration to a live [`Verifier`].

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use veribuild_chain::fetch::ChainFetcher;
use veribuild_chain::remote::{HttpRemoteService, RemoteJobManager};
use veribuild_chain::rpc::HttpRpcClient;
use veribuild_harness::config::EngineConfig;
use veribuild_harness::orchestrator::{BuildOrchestrator, BuildSettings};
use veribuild_harness::registry_cache::RegistryCache;
use veribuild_harness::runtime::DockerRuntime;
use veribuild_harness::verify::Verifier;

pub type Engine = Verifier<HttpRpcClient, DockerRuntime, HttpRemoteService>;

pub struct Context {
    pub engine: Engine,
    pub json: bool,
}

impl Context {
    pub fn load(config_path: Option<&Path>, url: Option<&str>, json: bool) -> Result<Self> {
        let mut config = EngineConfig::load(config_path)?;
        if let Some(url) = url {
            config.rpc_url = url.to_string();
            config.validate()?;
        }
        let rpc_url = config.resolved_rpc_url()?;
        tracing::debug!(rpc = %rpc_url, remote = %config.remote.base_url, "engine configured");

        let rpc = HttpRpcClient::new(&rpc_url, config.rpc_timeout())
            .with_context(|| format!("creating RPC client for {rpc_url}"))?;
        let remote = HttpRemoteService::new(
            &config.remote.base_url,
            config.remote_timeout(),
            config.retry,
        )
        .with_context(|| format!("creating client for {}", config.remote.base_url))?;
        let registry = RegistryCache::load(config.registry_path.as_deref())
            .context("loading toolchain registry")?;

        let engine = Verifier::new(
            ChainFetcher::new(rpc, config.retry),
            BuildOrchestrator::new(
                DockerRuntime::new(config.build.docker_binary.clone()),
                Arc::new(registry),
                BuildSettings::from_config(&config),
            ),
            RemoteJobManager::new(remote),
            config.max_concurrent_fetches,
        );
        Ok(Self { engine, json })
    }
}
