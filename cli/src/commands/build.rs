use std::path::PathBuf;

use anyhow::{Context as _, Result};
use serde_json::json;
use veribuild_harness::cancel::CancelToken;
use veribuild_harness::orchestrator::BuildSpec;
use veribuild_harness::source::SourceLocation;
use veribuild_kernel::proof::hash::{artifact_hash, DigestAlgorithm};

use super::{emit_json, toolchain_selector, Outcome};
use crate::engine::Context;
use crate::BuildArgs;

pub fn run(
    ctx: &Context,
    mount_path: Option<PathBuf>,
    build: &BuildArgs,
    algorithm: DigestAlgorithm,
    cancel: &CancelToken,
) -> Result<Outcome> {
    let path = match mount_path {
        Some(p) => p,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let spec = BuildSpec {
        source: SourceLocation::Path { path },
        mount_path: None,
        library_name: build.library_name.clone(),
        toolchain: toolchain_selector(build)?,
        cargo_features: build.features.clone(),
        cargo_args: build.cargo_args.clone(),
        bpf_mode: build.bpf,
    };
    let built = ctx.engine.build(&spec, cancel)?;
    let hash = artifact_hash(&built.artifact, algorithm)?;

    if ctx.json {
        emit_json(&json!({
            "library": built.library,
            "toolchain": built.toolchain,
            "registry_digest": built.registry_digest,
            "executable_hash": hash,
        }))?;
    } else {
        println!("{hash}");
    }
    Ok(Outcome::Done)
}
