//! Verification flows: build or extract one side, fetch the other, hash both
//! under the same algorithm and policy, compare.
//!
//! The two sides run concurrently inside a [`std::thread::scope`]. The
//! comparator is pure, so the verdict does not depend on which side finishes
//! first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use veribuild_chain::fetch::{ChainFetcher, FetchError, OnChainAccount};
use veribuild_chain::pubkey::Pubkey;
use veribuild_chain::remote::{
    RemoteError, RemoteJob, RemoteJobManager, RemoteService, SubmitRequest, VerificationRecord,
};
use veribuild_chain::rpc::{RpcTransport, MAINNET_GENESIS_HASH};
use veribuild_kernel::artifact::Artifact;
use veribuild_kernel::proof::compare::{compare, VerificationResult};
use veribuild_kernel::proof::hash::{artifact_hash, CanonicalHash, DigestAlgorithm, HashError};
use veribuild_kernel::toolchain::{ImageRef, Platform, ToolchainVersion};

use crate::cancel::CancelToken;
use crate::config::ConfigError;
use crate::orchestrator::{
    BuildError, BuildOrchestrator, BuildSpec, BuildStage, BuiltArtifact, ToolchainSelector,
};
use crate::runtime::ContainerRuntime;
use crate::source::SourceLocation;

/// Every failure a verification flow can end in.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot read {}: {detail}", path.display())]
    Io { path: PathBuf, detail: String },
    /// Remote verification only attests mainnet deployments.
    #[error("remote verification requires mainnet; RPC genesis hash is {genesis_hash}")]
    WrongCluster { genesis_hash: String },
}

impl VerifyError {
    /// Process exit status: 4 for a failed remote job, 2 for everything else.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Remote(RemoteError::RemoteJobFailure { .. }) => 4,
            _ => 2,
        }
    }

    /// The error's name in the engine's failure taxonomy.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Build(BuildError::AmbiguousLibraryName { .. }) => "AmbiguousLibraryName",
            Self::Build(BuildError::BuildFailure { .. }) => "BuildFailure",
            Self::Build(BuildError::Timeout { .. }) => "Timeout",
            Self::Build(BuildError::Cancelled { .. }) => "Cancelled",
            Self::Build(BuildError::Toolchain(_)) => "Toolchain",
            Self::Build(BuildError::NetworkFailure { .. })
            | Self::Fetch(FetchError::NetworkFailure { .. })
            | Self::Remote(RemoteError::NetworkFailure { .. }) => "NetworkFailure",
            Self::Fetch(FetchError::InvalidProgramAccount { .. }) => "InvalidProgramAccount",
            Self::Fetch(FetchError::MalformedResponse { .. })
            | Self::Remote(RemoteError::MalformedResponse { .. }) => "MalformedResponse",
            Self::Hash(HashError::InvalidLength { .. }) => "InvalidLength",
            Self::Hash(HashError::IncompatibleComparison { .. }) => "IncompatibleComparison",
            Self::Hash(_) => "Hash",
            Self::Remote(RemoteError::RemoteJobFailure { .. }) => "RemoteJobFailure",
            Self::Remote(RemoteError::Rejected { .. }) => "Rejected",
            Self::Config(_) => "Configuration",
            Self::Io { .. } => "Io",
            Self::WrongCluster { .. } => "WrongCluster",
        }
    }
}

/// An on-chain account and its canonical hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedAccount {
    pub account: OnChainAccount,
    pub hash: CanonicalHash,
}

/// Inputs for verifying a repository against a deployed program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoVerification {
    pub repo_url: String,
    pub commit: Option<String>,
    pub program_id: Pubkey,
    pub library_name: Option<String>,
    pub mount_path: Option<PathBuf>,
    /// Digest-pinned image overriding registry resolution.
    pub base_image: Option<ImageRef>,
    /// Exact registry version instead of the lockfile's.
    pub toolchain_version: Option<ToolchainVersion>,
    pub bpf_mode: bool,
    pub cargo_features: Vec<String>,
    pub cargo_args: Vec<String>,
    pub algorithm: DigestAlgorithm,
    /// Delegate to the attestation service, signed by this uploader.
    pub remote_uploader: Option<Pubkey>,
}

impl RepoVerification {
    #[must_use]
    pub fn new(repo_url: impl Into<String>, commit: Option<String>, program_id: Pubkey) -> Self {
        Self {
            repo_url: repo_url.into(),
            commit,
            program_id,
            library_name: None,
            mount_path: None,
            base_image: None,
            toolchain_version: None,
            bpf_mode: false,
            cargo_features: Vec::new(),
            cargo_args: Vec::new(),
            algorithm: DigestAlgorithm::default(),
            remote_uploader: None,
        }
    }

    fn build_spec(&self) -> BuildSpec {
        BuildSpec {
            source: SourceLocation::Repo {
                url: self.repo_url.clone(),
                commit: self.commit.clone(),
            },
            mount_path: self.mount_path.clone(),
            library_name: self.library_name.clone(),
            toolchain: match (&self.base_image, self.toolchain_version) {
                (Some(image), _) => ToolchainSelector::Image(image.clone()),
                (None, Some(version)) => ToolchainSelector::Version(version),
                (None, None) => ToolchainSelector::Detect,
            },
            cargo_features: self.cargo_features.clone(),
            cargo_args: self.cargo_args.clone(),
            bpf_mode: self.bpf_mode,
        }
    }

    /// The equivalent attestation-service request.
    #[must_use]
    pub fn submit_request(&self, uploader: Pubkey) -> SubmitRequest {
        let mut cargo_args = self.cargo_args.clone();
        if !self.cargo_features.is_empty() {
            cargo_args.insert(0, self.cargo_features.join(","));
            cargo_args.insert(0, "--features".into());
        }
        SubmitRequest {
            repository: self.repo_url.clone(),
            commit_hash: self.commit.clone(),
            program_id: self.program_id,
            signer: uploader,
            lib_name: self.library_name.clone(),
            bpf_flag: self.bpf_mode,
            mount_path: self
                .mount_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            base_image: self.base_image.as_ref().map(|i| i.as_str().to_string()),
            cargo_args,
        }
    }
}

/// What `verify_from_repo` produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RepoOutcome {
    Local { result: VerificationResult },
    Submitted { job_id: String },
}

/// Polling cadence for [`Verifier::wait_for_terminal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_polls: u32,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            max_polls: 120,
        }
    }
}

impl PollSchedule {
    #[must_use]
    pub fn interval(&self, poll: u32) -> Duration {
        let factor = 1u32.checked_shl(poll).unwrap_or(u32::MAX);
        self.initial_interval
            .saturating_mul(factor)
            .min(self.max_interval)
    }
}

/// Hash an executable file on disk.
///
/// With `length`, exactly that many leading bytes are hashed; otherwise
/// trailing zeros are trimmed.
///
/// # Errors
///
/// Unreadable file, or `length` beyond the file size.
pub fn hash_file(
    path: &Path,
    length: Option<usize>,
    algorithm: DigestAlgorithm,
) -> Result<CanonicalHash, VerifyError> {
    let bytes = std::fs::read(path).map_err(|e| VerifyError::Io {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let artifact = match length {
        Some(n) => Artifact::with_declared_length(bytes, n),
        None => Artifact::new(bytes),
    };
    Ok(artifact_hash(&artifact, algorithm)?)
}

/// Verification engine: build orchestration, chain access, remote jobs.
pub struct Verifier<T, R, S> {
    fetcher: ChainFetcher<T>,
    orchestrator: BuildOrchestrator<R>,
    remote: RemoteJobManager<S>,
    max_concurrent_fetches: usize,
}

impl<T, R, S> Verifier<T, R, S>
where
    T: RpcTransport,
    R: ContainerRuntime,
    S: RemoteService,
{
    #[must_use]
    pub fn new(
        fetcher: ChainFetcher<T>,
        orchestrator: BuildOrchestrator<R>,
        remote: RemoteJobManager<S>,
        max_concurrent_fetches: usize,
    ) -> Self {
        Self {
            fetcher,
            orchestrator,
            remote,
            max_concurrent_fetches,
        }
    }

    #[must_use]
    pub fn fetcher(&self) -> &ChainFetcher<T> {
        &self.fetcher
    }

    #[must_use]
    pub fn orchestrator(&self) -> &BuildOrchestrator<R> {
        &self.orchestrator
    }

    #[must_use]
    pub fn remote(&self) -> &RemoteJobManager<S> {
        &self.remote
    }

    /// # Errors
    ///
    /// See [`BuildOrchestrator::build`].
    pub fn build(&self, spec: &BuildSpec, cancel: &CancelToken) -> Result<BuiltArtifact, VerifyError> {
        Ok(self.orchestrator.build(spec, cancel)?)
    }

    /// Fetch a deployed program and hash its executable bytes.
    ///
    /// # Errors
    ///
    /// Fetch failures, or `length` beyond the executable.
    pub fn program_hash(
        &self,
        program_id: &Pubkey,
        length: Option<usize>,
        algorithm: DigestAlgorithm,
    ) -> Result<HashedAccount, VerifyError> {
        let account = self.fetcher.fetch_program(program_id)?;
        let hash = artifact_hash(&account.to_artifact(length), algorithm)?;
        Ok(HashedAccount { account, hash })
    }

    /// Fetch an upgrade buffer and hash its staged executable.
    ///
    /// # Errors
    ///
    /// Fetch failures.
    pub fn buffer_hash(
        &self,
        buffer: &Pubkey,
        algorithm: DigestAlgorithm,
    ) -> Result<HashedAccount, VerifyError> {
        let account = self.fetcher.fetch_buffer(buffer)?;
        let hash = artifact_hash(&account.to_artifact(None), algorithm)?;
        Ok(HashedAccount { account, hash })
    }

    /// Hash several programs, fetching in parallel under the configured bound.
    pub fn program_hashes(
        &self,
        program_ids: &[Pubkey],
        algorithm: DigestAlgorithm,
    ) -> Vec<Result<HashedAccount, VerifyError>> {
        self.fetcher
            .fetch_programs(program_ids, self.max_concurrent_fetches)
            .into_iter()
            .map(|fetched| {
                let account = fetched?;
                let hash = artifact_hash(&account.to_artifact(None), algorithm)?;
                Ok(HashedAccount { account, hash })
            })
            .collect()
    }

    /// Build a repository (or delegate to the attestation service) and
    /// compare against the deployed program.
    ///
    /// # Errors
    ///
    /// Build, fetch, hash, or remote failures. A mismatch is not an error.
    pub fn verify_from_repo(
        &self,
        request: &RepoVerification,
        cancel: &CancelToken,
    ) -> Result<RepoOutcome, VerifyError> {
        if let Some(uploader) = request.remote_uploader {
            let job_id = self.submit_remote(&request.submit_request(uploader))?;
            return Ok(RepoOutcome::Submitted { job_id });
        }

        let spec = request.build_spec();
        // A failed fetch makes the build pointless, so it stops the build too.
        let build_cancel = cancel.child();
        let (built, chain) = std::thread::scope(|scope| {
            let build = scope.spawn(|| self.orchestrator.build(&spec, &build_cancel));
            let chain = self.fetcher.fetch_program(&request.program_id);
            if chain.is_err() {
                build_cancel.cancel();
            }
            let built = build.join().unwrap_or_else(|_| {
                Err(BuildError::BuildFailure {
                    stage: BuildStage::Compiling,
                    detail: "build thread panicked".into(),
                })
            });
            (built, chain)
        });
        // The fetch error is the cause when it stopped the build.
        let chain = chain?;
        let built = built?;
        tracing::info!(
            library = %built.library,
            toolchain = %built.toolchain.version(),
            registry = %built.registry_digest,
            "comparing build against chain"
        );
        let result = self.compare_sides(&built.artifact, &chain, request.algorithm)?;
        Ok(RepoOutcome::Local { result })
    }

    /// Compare an executable baked into a prebuilt image with the chain.
    ///
    /// # Errors
    ///
    /// Extraction, fetch, or hash failures.
    pub fn verify_from_image(
        &self,
        image: &ImageRef,
        path_in_image: &str,
        program_id: &Pubkey,
        algorithm: DigestAlgorithm,
        cancel: &CancelToken,
    ) -> Result<VerificationResult, VerifyError> {
        let extract_cancel = cancel.child();
        let (extracted, chain) = std::thread::scope(|scope| {
            let extract = scope.spawn(|| {
                self.orchestrator.extract_from_image(
                    image,
                    Platform::default(),
                    path_in_image,
                    &extract_cancel,
                )
            });
            let chain = self.fetcher.fetch_program(program_id);
            if chain.is_err() {
                extract_cancel.cancel();
            }
            let extracted = extract.join().unwrap_or_else(|_| {
                Err(BuildError::BuildFailure {
                    stage: BuildStage::Extracting,
                    detail: "extraction thread panicked".into(),
                })
            });
            (extracted, chain)
        });
        let chain = chain?;
        let artifact = extracted?;
        self.compare_sides(&artifact, &chain, algorithm)
    }

    /// Hash both sides under the policy the built artifact implies.
    fn compare_sides(
        &self,
        built: &Artifact,
        chain: &OnChainAccount,
        algorithm: DigestAlgorithm,
    ) -> Result<VerificationResult, VerifyError> {
        let built_hash = artifact_hash(built, algorithm)?;
        let chain_hash = artifact_hash(&chain.to_artifact(built.declared_length()), algorithm)?;
        let result = compare(&built_hash, &chain_hash)?;
        tracing::info!(
            built = %result.built_hash(),
            chain = %result.chain_hash(),
            verdict = %result.verdict(),
            "verification finished"
        );
        Ok(result)
    }

    /// Submit to the attestation service after checking the RPC endpoint is
    /// mainnet.
    ///
    /// # Errors
    ///
    /// [`VerifyError::WrongCluster`] before any remote contact, or the
    /// service's own error.
    pub fn submit_remote(&self, request: &SubmitRequest) -> Result<String, VerifyError> {
        let genesis_hash = self.fetcher.genesis_hash()?;
        if genesis_hash != MAINNET_GENESIS_HASH {
            return Err(VerifyError::WrongCluster { genesis_hash });
        }
        Ok(self.remote.submit(request)?)
    }

    /// One non-blocking status round trip.
    ///
    /// # Errors
    ///
    /// Network or decoding failure. A failed job is a value, not an error.
    pub fn job_status(&self, job_id: &str) -> Result<RemoteJob, VerifyError> {
        Ok(self.remote.poll(job_id)?)
    }

    /// Recorded verifications of a program on the attestation service.
    ///
    /// # Errors
    ///
    /// Network or decoding failure.
    pub fn remote_status(&self, program_id: &Pubkey) -> Result<Vec<VerificationRecord>, VerifyError> {
        Ok(self.remote.status_all(program_id)?)
    }

    /// Poll on `schedule` until the job is terminal, the poll budget is spent,
    /// or `cancel` fires. Returns the last observed job either way; a
    /// non-terminal job is never reported as done.
    ///
    /// # Errors
    ///
    /// The first poll error.
    pub fn wait_for_terminal(
        &self,
        job_id: &str,
        schedule: PollSchedule,
        cancel: &CancelToken,
    ) -> Result<RemoteJob, VerifyError> {
        let mut poll = 0;
        loop {
            let job = self.job_status(job_id)?;
            poll += 1;
            if job.status.is_terminal() || poll >= schedule.max_polls || cancel.is_cancelled() {
                return Ok(job);
            }
            tracing::info!(%job_id, status = %job.status, poll, "remote job not finished");
            sleep_unless_cancelled(schedule.interval(poll - 1), cancel);
        }
    }
}

fn sleep_unless_cancelled(total: Duration, cancel: &CancelToken) {
    let step = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < total && !cancel.is_cancelled() {
        let chunk = step.min(total - slept);
        std::thread::sleep(chunk);
        slept += chunk;
    }
}
