use anyhow::Result;
use veribuild_chain::pubkey::Pubkey;
use veribuild_chain::remote::{RemoteJob, RemoteJobStatus};
use veribuild_harness::cancel::CancelToken;
use veribuild_harness::verify::PollSchedule;

use super::verify::{print_submitted, RepoArgs};
use super::{emit_json, Outcome};
use crate::engine::Context;

pub fn submit(ctx: &Context, args: RepoArgs) -> Result<Outcome> {
    let request = args.into_request()?;
    let uploader = request
        .remote_uploader
        .ok_or_else(|| anyhow::anyhow!("remote submission requires an uploader"))?;
    let job_id = ctx.engine.submit_remote(&request.submit_request(uploader))?;
    print_submitted(ctx, &job_id)?;
    Ok(Outcome::Done)
}

pub fn job_status(ctx: &Context, job_id: &str, wait: bool, cancel: &CancelToken) -> Result<Outcome> {
    let job = if wait {
        ctx.engine
            .wait_for_terminal(job_id, PollSchedule::default(), cancel)?
    } else {
        ctx.engine.job_status(job_id)?
    };
    print_job(ctx, &job)?;
    Ok(job_outcome(&job))
}

pub fn status(ctx: &Context, program_id: &Pubkey) -> Result<Outcome> {
    let records = ctx.engine.remote_status(program_id)?;
    if ctx.json {
        emit_json(&serde_json::to_value(&records)?)?;
    } else if records.is_empty() {
        tracing::info!(%program_id, "no recorded verifications");
    } else {
        let blocks: Vec<String> = records.iter().map(ToString::to_string).collect();
        println!("{}", blocks.join("\n\n"));
    }
    Ok(Outcome::Done)
}

pub(super) fn print_job(ctx: &Context, job: &RemoteJob) -> Result<()> {
    if ctx.json {
        return emit_json(&serde_json::to_value(job)?);
    }
    println!("Job:             {}", job.job_id);
    println!("Status:          {}", job.status);
    if let Some(hash) = &job.result_hash {
        println!("Executable hash: {hash}");
    }
    if let Some(hash) = &job.on_chain_hash {
        println!("On-chain hash:   {hash}");
    }
    if let Some(Ok(result)) = job.verification() {
        println!("Verdict:         {}", result.verdict());
    }
    Ok(())
}

/// A succeeded job's exit status follows its verdict; a job that never
/// reached a terminal state is not success.
pub(super) fn job_outcome(job: &RemoteJob) -> Outcome {
    match &job.status {
        RemoteJobStatus::Pending | RemoteJobStatus::InProgress => Outcome::NotTerminal,
        RemoteJobStatus::Failed { .. } => Outcome::RemoteFailed,
        RemoteJobStatus::Succeeded => match job.verification() {
            Some(Ok(result)) => Outcome::Verdict(result.verdict()),
            _ => Outcome::Done,
        },
    }
}
