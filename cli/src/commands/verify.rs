use std::path::PathBuf;

use anyhow::Result;
use serde_json::json;
use veribuild_chain::pubkey::Pubkey;
use veribuild_chain::remote::{RemoteJob, RemoteService};
use veribuild_chain::rpc::RpcTransport;
use veribuild_harness::cancel::CancelToken;
use veribuild_harness::runtime::ContainerRuntime;
use veribuild_harness::verify::{PollSchedule, RepoOutcome, RepoVerification, Verifier};
use veribuild_kernel::proof::compare::VerificationResult;
use veribuild_kernel::proof::hash::DigestAlgorithm;
use veribuild_kernel::toolchain::{ImageRef, ToolchainVersion};

use super::remote::{job_outcome, print_job};
use super::{emit_json, report_verification, Outcome};
use crate::engine::Context;
use crate::BuildArgs;

/// Repository inputs shared by `verify-from-repo` and `remote submit-job`.
pub struct RepoArgs {
    pub repo_url: String,
    pub commit_hash: Option<String>,
    pub program_id: Pubkey,
    pub mount_path: Option<PathBuf>,
    /// Set when the work goes to the attestation service.
    pub uploader: Option<Pubkey>,
    pub build: BuildArgs,
    pub algorithm: DigestAlgorithm,
}

impl RepoArgs {
    pub fn into_request(self) -> Result<RepoVerification> {
        let mut request = RepoVerification::new(self.repo_url, self.commit_hash, self.program_id);
        request.library_name = self.build.library_name;
        request.mount_path = self.mount_path;
        request.base_image = self.build.base_image.as_deref().map(ImageRef::parse).transpose()?;
        request.toolchain_version = self
            .build
            .toolchain
            .as_deref()
            .map(str::parse::<ToolchainVersion>)
            .transpose()?;
        request.bpf_mode = self.build.bpf;
        request.cargo_features = self.build.features;
        request.cargo_args = self.build.cargo_args;
        request.algorithm = self.algorithm;
        request.remote_uploader = self.uploader;
        Ok(request)
    }
}

/// A repository verification carried to its end: a local verdict, or the
/// remote job as last polled.
#[derive(Debug)]
enum Settled {
    Local(VerificationResult),
    Remote(RemoteJob),
}

impl Settled {
    fn outcome(&self) -> Outcome {
        match self {
            Self::Local(result) => Outcome::Verdict(result.verdict()),
            Self::Remote(job) => job_outcome(job),
        }
    }
}

/// Run the verification; a submitted job is polled on `schedule` until it
/// is terminal. `on_submit` sees the job id before polling starts.
fn settle<T, R, S>(
    engine: &Verifier<T, R, S>,
    request: &RepoVerification,
    schedule: PollSchedule,
    cancel: &CancelToken,
    on_submit: impl FnOnce(&str) -> Result<()>,
) -> Result<Settled>
where
    T: RpcTransport,
    R: ContainerRuntime,
    S: RemoteService,
{
    match engine.verify_from_repo(request, cancel)? {
        RepoOutcome::Local { result } => Ok(Settled::Local(result)),
        RepoOutcome::Submitted { job_id } => {
            on_submit(&job_id)?;
            Ok(Settled::Remote(engine.wait_for_terminal(&job_id, schedule, cancel)?))
        }
    }
}

pub fn from_repo(ctx: &Context, args: RepoArgs, cancel: &CancelToken) -> Result<Outcome> {
    let request = args.into_request()?;
    let settled = settle(&ctx.engine, &request, PollSchedule::default(), cancel, |job_id| {
        print_submitted(ctx, job_id)
    })?;
    match &settled {
        Settled::Local(result) => {
            report_verification(ctx, result)?;
        }
        Settled::Remote(job) => print_job(ctx, job)?,
    }
    Ok(settled.outcome())
}

pub fn from_image(
    ctx: &Context,
    image: &str,
    path_in_image: &str,
    program_id: &Pubkey,
    algorithm: DigestAlgorithm,
    cancel: &CancelToken,
) -> Result<Outcome> {
    let image = ImageRef::parse(image)?;
    let result = ctx
        .engine
        .verify_from_image(&image, path_in_image, program_id, algorithm, cancel)?;
    report_verification(ctx, &result)
}

pub(super) fn print_submitted(ctx: &Context, job_id: &str) -> Result<()> {
    if ctx.json {
        emit_json(&json!({ "job_id": job_id }))?;
    } else {
        println!("{job_id}");
    }
    tracing::info!(%job_id, "submitted; poll with `veribuild remote job-status --job-id {job_id}`");
    Ok(())
}
