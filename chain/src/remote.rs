//! Remote verification jobs: submit build metadata to an attestation service
//! and poll it for the outcome.
//!
//! The engine never builds anything on this path. [`RemoteJobManager::poll`]
//! is one round trip; backoff between polls belongs to the caller. Terminal
//! states are cached, so once a job is `Succeeded` or `Failed` every later
//! poll returns the same answer without contacting the service.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use veribuild_kernel::proof::compare::{compare, VerificationResult};
use veribuild_kernel::proof::hash::{CanonicalHash, DigestAlgorithm, HashError};
use veribuild_kernel::proof::strip::StripPolicy;

use crate::pubkey::Pubkey;
use crate::retry::{Attempt, RetryPolicy};

pub const DEFAULT_REMOTE_URL: &str = "https://verify.osec.io";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("{operation} failed (retries exhausted: {retries_exhausted}): {detail}")]
    NetworkFailure {
        operation: String,
        retries_exhausted: bool,
        detail: String,
    },
    /// The service refused the request (4xx), e.g. a duplicate submission.
    #[error("remote service rejected {operation} with HTTP {status}: {detail}")]
    Rejected {
        operation: String,
        status: u16,
        detail: String,
    },
    #[error("remote job {job_id} failed: {reason}")]
    RemoteJobFailure { job_id: String, reason: String },
    #[error("malformed response from {operation}: {detail}")]
    MalformedResponse { operation: String, detail: String },
}

/// What the remote side needs to reproduce the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitRequest {
    pub repository: String,
    pub commit_hash: Option<String>,
    pub program_id: Pubkey,
    pub signer: Pubkey,
    pub lib_name: Option<String>,
    pub bpf_flag: bool,
    pub mount_path: Option<String>,
    pub base_image: Option<String>,
    pub cargo_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubmitReceipt {
    pub request_id: String,
    #[serde(default)]
    pub message: String,
}

/// Job status as the service spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireJobStatus {
    InProgress,
    Completed,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobReport {
    pub status: WireJobStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub on_chain_hash: String,
    #[serde(default)]
    pub executable_hash: String,
    #[serde(default)]
    pub repo_url: String,
}

/// One recorded verification of a program by one signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub signer: String,
    pub is_verified: bool,
    pub on_chain_hash: String,
    pub executable_hash: String,
    pub repo_url: String,
    pub commit: String,
    pub last_verified_at: String,
}

impl std::fmt::Display for VerificationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "signer: {}", self.signer)?;
        writeln!(f, "verified: {}", self.is_verified)?;
        writeln!(f, "on-chain hash: {}", self.on_chain_hash)?;
        writeln!(f, "executable hash: {}", self.executable_hash)?;
        writeln!(f, "repository: {}", self.repo_url)?;
        writeln!(f, "commit: {}", self.commit)?;
        write!(f, "last verified: {}", self.last_verified_at)
    }
}

/// The attestation service, as the manager sees it.
pub trait RemoteService: Send + Sync {
    /// # Errors
    ///
    /// Network, rejection, or decoding failure.
    fn submit(&self, request: &SubmitRequest) -> Result<SubmitReceipt, RemoteError>;

    /// # Errors
    ///
    /// Network, rejection, or decoding failure.
    fn job_status(&self, job_id: &str) -> Result<JobReport, RemoteError>;

    /// # Errors
    ///
    /// Network, rejection, or decoding failure.
    fn status_all(&self, program_id: &Pubkey) -> Result<Vec<VerificationRecord>, RemoteError>;
}

/// Engine-side job status. Terminal states are `Succeeded` and `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteJobStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed { reason: String },
}

impl RemoteJobStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

impl std::fmt::Display for RemoteJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::InProgress => f.write_str("in progress"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteJob {
    pub job_id: String,
    /// Known when this manager submitted the job.
    pub program_id: Option<Pubkey>,
    pub uploader: Option<Pubkey>,
    pub status: RemoteJobStatus,
    /// Hash of the remotely built executable, once the job succeeded.
    pub result_hash: Option<CanonicalHash>,
    /// Hash the service read from chain, once the job succeeded.
    pub on_chain_hash: Option<CanonicalHash>,
    pub repo_url: Option<String>,
}

impl RemoteJob {
    /// Compare the remote build hash to the on-chain hash, once available.
    ///
    /// # Errors
    ///
    /// Propagates comparison incompatibilities.
    pub fn verification(&self) -> Option<Result<VerificationResult, HashError>> {
        match (&self.result_hash, &self.on_chain_hash) {
            (Some(built), Some(chain)) => Some(compare(built, chain)),
            _ => None,
        }
    }

    /// Turn a `Failed` job into [`RemoteError::RemoteJobFailure`].
    ///
    /// # Errors
    ///
    /// Only for `Failed` jobs.
    pub fn into_result(self) -> Result<Self, RemoteError> {
        match &self.status {
            RemoteJobStatus::Failed { reason } => Err(RemoteError::RemoteJobFailure {
                job_id: self.job_id.clone(),
                reason: reason.clone(),
            }),
            _ => Ok(self),
        }
    }
}

/// Tracks submitted jobs and caches terminal outcomes.
pub struct RemoteJobManager<S> {
    service: S,
    jobs: Mutex<BTreeMap<String, RemoteJob>>,
}

impl<S: RemoteService> RemoteJobManager<S> {
    #[must_use]
    pub fn new(service: S) -> Self {
        Self {
            service,
            jobs: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn service(&self) -> &S {
        &self.service
    }

    /// Submit a job and return its id. The request is sent exactly once.
    ///
    /// # Errors
    ///
    /// Whatever the service returns; nothing is recorded on failure.
    pub fn submit(&self, request: &SubmitRequest) -> Result<String, RemoteError> {
        let receipt = self.service.submit(request)?;
        if receipt.request_id.trim().is_empty() {
            return Err(RemoteError::MalformedResponse {
                operation: "verify".into(),
                detail: "empty request_id".into(),
            });
        }
        tracing::info!(
            job_id = %receipt.request_id,
            program_id = %request.program_id,
            message = %receipt.message,
            "remote verification submitted"
        );
        let job = RemoteJob {
            job_id: receipt.request_id.clone(),
            program_id: Some(request.program_id),
            uploader: Some(request.signer),
            status: RemoteJobStatus::Pending,
            result_hash: None,
            on_chain_hash: None,
            repo_url: Some(request.repository.clone()),
        };
        self.lock_jobs().insert(job.job_id.clone(), job);
        Ok(receipt.request_id)
    }

    /// One status round trip. Never blocks waiting for completion.
    ///
    /// # Errors
    ///
    /// Network or decoding failure. A `Failed` job is returned as a value;
    /// use [`RemoteJob::into_result`] to surface it as an error.
    pub fn poll(&self, job_id: &str) -> Result<RemoteJob, RemoteError> {
        if let Some(job) = self.lock_jobs().get(job_id) {
            if job.status.is_terminal() {
                return Ok(job.clone());
            }
        }

        let report = self.service.job_status(job_id)?;
        let mut job = self
            .lock_jobs()
            .get(job_id)
            .cloned()
            .unwrap_or_else(|| RemoteJob {
                job_id: job_id.to_string(),
                program_id: None,
                uploader: None,
                status: RemoteJobStatus::Pending,
                result_hash: None,
                on_chain_hash: None,
                repo_url: None,
            });
        apply_report(&mut job, report)?;
        tracing::debug!(job_id, status = %job.status, "remote job polled");

        let mut jobs = self.lock_jobs();
        // A concurrent poll may already have recorded a terminal state.
        if let Some(existing) = jobs.get(job_id) {
            if existing.status.is_terminal() {
                return Ok(existing.clone());
            }
        }
        jobs.insert(job_id.to_string(), job.clone());
        Ok(job)
    }

    /// All recorded verifications of `program_id`.
    ///
    /// # Errors
    ///
    /// Network or decoding failure.
    pub fn status_all(&self, program_id: &Pubkey) -> Result<Vec<VerificationRecord>, RemoteError> {
        self.service.status_all(program_id)
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, RemoteJob>> {
        // The map holds plain data; a panic mid-insert cannot leave it torn.
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn reason_or(message: String, fallback: &str) -> String {
    if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message
    }
}

fn apply_report(job: &mut RemoteJob, report: JobReport) -> Result<(), RemoteError> {
    job.status = match report.status {
        WireJobStatus::InProgress => RemoteJobStatus::InProgress,
        WireJobStatus::Failed => RemoteJobStatus::Failed {
            reason: reason_or(report.message, "remote service gave no reason"),
        },
        // The service reports jobs it cannot verify as `unknown`; it never
        // moves on from there.
        WireJobStatus::Unknown => RemoteJobStatus::Failed {
            reason: reason_or(report.message, "remote service could not verify the program"),
        },
        WireJobStatus::Completed => {
            job.result_hash = Some(published_hash(&report.executable_hash)?);
            job.on_chain_hash = Some(published_hash(&report.on_chain_hash)?);
            if !report.repo_url.is_empty() {
                job.repo_url = Some(report.repo_url);
            }
            RemoteJobStatus::Succeeded
        }
    };
    Ok(())
}

/// The service publishes SHA-256 over zero-trimmed bytes.
fn published_hash(hex_digest: &str) -> Result<CanonicalHash, RemoteError> {
    CanonicalHash::from_published_hex(
        DigestAlgorithm::Sha256,
        hex_digest,
        StripPolicy::TrimTrailingZeros,
    )
    .map_err(|e| RemoteError::MalformedResponse {
        operation: "job".into(),
        detail: e.to_string(),
    })
}

/// HTTP client for the attestation service.
///
/// Submission is never retried (the service is not idempotent). Status
/// lookups are retried under `retry` on 5xx and connection errors.
pub struct HttpRemoteService {
    base_url: String,
    client: reqwest::blocking::Client,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl HttpRemoteService {
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self, RemoteError> {
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::NetworkFailure {
                operation: "client".into(),
                retries_exhausted: false,
                detail: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            retry,
        })
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
    ) -> Result<T, RemoteError> {
        let url = format!("{}/{path}", self.base_url);
        self.retry
            .run(|_| {
                let response = self.client.get(&url).send().map_err(|e| {
                    Attempt::Transient(RemoteError::NetworkFailure {
                        operation: operation.into(),
                        retries_exhausted: true,
                        detail: e.to_string(),
                    })
                })?;
                decode_response(operation, response, true)
            })
            .map_err(|failure| match failure.error {
                RemoteError::NetworkFailure {
                    operation, detail, ..
                } => RemoteError::NetworkFailure {
                    operation,
                    retries_exhausted: failure.retries_exhausted,
                    detail,
                },
                other => other,
            })
    }
}

fn decode_response<T: serde::de::DeserializeOwned>(
    operation: &str,
    response: reqwest::blocking::Response,
    retry_server_errors: bool,
) -> Result<T, Attempt<RemoteError>> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().map_err(|e| {
            Attempt::Terminal(RemoteError::MalformedResponse {
                operation: operation.into(),
                detail: e.to_string(),
            })
        });
    }
    let body = response.text().unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body).map_or(body, |b| b.error);
    if status.is_server_error() {
        let error = RemoteError::NetworkFailure {
            operation: operation.into(),
            retries_exhausted: false,
            detail: format!("HTTP {status}: {detail}"),
        };
        return Err(if retry_server_errors {
            Attempt::Transient(error)
        } else {
            Attempt::Terminal(error)
        });
    }
    Err(Attempt::Terminal(RemoteError::Rejected {
        operation: operation.into(),
        status: status.as_u16(),
        detail,
    }))
}

fn flatten(attempt: Attempt<RemoteError>) -> RemoteError {
    match attempt {
        Attempt::Transient(e) | Attempt::Terminal(e) => e,
    }
}

impl RemoteService for HttpRemoteService {
    fn submit(&self, request: &SubmitRequest) -> Result<SubmitReceipt, RemoteError> {
        let url = format!("{}/verify", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .map_err(|e| RemoteError::NetworkFailure {
                operation: "verify".into(),
                retries_exhausted: false,
                detail: e.to_string(),
            })?;
        decode_response("verify", response, false).map_err(flatten)
    }

    fn job_status(&self, job_id: &str) -> Result<JobReport, RemoteError> {
        self.get_json("job", &format!("job/{job_id}"))
    }

    fn status_all(&self, program_id: &Pubkey) -> Result<Vec<VerificationRecord>, RemoteError> {
        self.get_json("status-all", &format!("status-all/{program_id}"))
    }
}
