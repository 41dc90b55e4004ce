//! One module per command family. Each returns an [`Outcome`] that decides
//! the exit status.

pub mod build;
pub mod hash;
pub mod remote;
pub mod verify;

use anyhow::Result;
use serde_json::Value;
use veribuild_harness::orchestrator::ToolchainSelector;
use veribuild_kernel::proof::compare::{Verdict, VerificationResult};
use veribuild_kernel::toolchain::{ImageRef, ToolchainVersion};

use crate::engine::Context;
use crate::BuildArgs;

/// How a successful command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Hashes printed, job submitted, records listed.
    Done,
    Verdict(Verdict),
    /// Remote job still pending or in progress.
    NotTerminal,
    /// Remote job finished with `Failed`.
    RemoteFailed,
}

impl Outcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Done | Self::Verdict(Verdict::Match) => 0,
            Self::Verdict(Verdict::Mismatch) => 1,
            Self::NotTerminal => 3,
            Self::RemoteFailed => 4,
        }
    }
}

fn emit_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print both hashes and the verdict. Both hashes are always shown.
fn report_verification(ctx: &Context, result: &VerificationResult) -> Result<Outcome> {
    if ctx.json {
        emit_json(&serde_json::to_value(result)?)?;
    } else {
        println!("Executable hash: {}", result.built_hash());
        println!("On-chain hash:   {}", result.chain_hash());
        println!("Verdict:         {}", result.verdict());
    }
    Ok(Outcome::Verdict(result.verdict()))
}

fn toolchain_selector(build: &BuildArgs) -> Result<ToolchainSelector> {
    Ok(match (&build.base_image, &build.toolchain) {
        (Some(image), _) => ToolchainSelector::Image(ImageRef::parse(image)?),
        (None, Some(version)) => ToolchainSelector::Version(version.parse::<ToolchainVersion>()?),
        (None, None) => ToolchainSelector::Detect,
    })
}
