//! veribuild CLI: reproducible-build verification for on-chain programs.
//!
//! Stdout carries hashes and verdicts only; logs go to stderr.
//!
//! Exit status: 0 match (or hash printed), 1 mismatch, 2 error,
//! 3 remote job not finished, 4 remote job failed.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use veribuild_chain::pubkey::Pubkey;
use veribuild_harness::cancel::CancelToken;
use veribuild_harness::verify::VerifyError;
use veribuild_kernel::proof::hash::DigestAlgorithm;

mod commands;
mod engine;

/// Verify that deployed program bytes match a reproducible build.
#[derive(Parser)]
#[command(name = "veribuild")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(short, long, global = true, env = "VERIBUILD_CONFIG")]
    config: Option<PathBuf>,

    /// RPC endpoint URL or cluster alias (mainnet, devnet, testnet, localnet)
    #[arg(short = 'u', long, global = true)]
    url: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Digest selection shared by hashing commands.
#[derive(Args, Clone, Copy)]
struct HashArgs {
    /// Digest algorithm (sha256, sha1)
    #[arg(long, default_value = "sha256")]
    algorithm: DigestAlgorithm,
}

/// Build options shared by `build` and `verify-from-repo`.
#[derive(Args, Clone)]
pub(crate) struct BuildArgs {
    /// Library to build when the source declares several
    #[arg(long)]
    pub(crate) library_name: Option<String>,

    /// Digest-pinned toolchain image (name@sha256:<hex>) bypassing the registry
    #[arg(long, conflicts_with = "toolchain")]
    pub(crate) base_image: Option<String>,

    /// Exact toolchain version; detected from Cargo.lock when omitted
    #[arg(long)]
    pub(crate) toolchain: Option<String>,

    /// Build with the legacy BPF toolchain (cargo build-bpf)
    #[arg(long)]
    pub(crate) bpf: bool,

    /// Cargo features, comma separated
    #[arg(long, value_delimiter = ',')]
    pub(crate) features: Vec<String>,

    /// Extra arguments passed to cargo
    #[arg(last = true)]
    pub(crate) cargo_args: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a local source tree and print the executable hash
    Build {
        /// Source directory (defaults to the current directory)
        #[arg(short, long)]
        mount_path: Option<PathBuf>,

        #[command(flatten)]
        build: BuildArgs,

        #[command(flatten)]
        hash: HashArgs,
    },

    /// Hash an executable file
    GetExecutableHash {
        filepath: PathBuf,

        /// Hash exactly this many leading bytes instead of trimming zeros
        #[arg(long)]
        length: Option<usize>,

        #[command(flatten)]
        hash: HashArgs,
    },

    /// Hash the executable of one or more deployed programs
    GetProgramHash {
        #[arg(required = true)]
        program_ids: Vec<Pubkey>,

        /// Hash exactly this many leading bytes instead of trimming zeros
        #[arg(long)]
        length: Option<usize>,

        #[command(flatten)]
        hash: HashArgs,
    },

    /// Hash the executable staged in an upgrade buffer
    GetBufferHash {
        buffer_address: Pubkey,

        #[command(flatten)]
        hash: HashArgs,
    },

    /// Build a repository at a commit and compare with the deployed program
    VerifyFromRepo {
        repo_url: String,

        #[arg(long)]
        commit_hash: Option<String>,

        #[arg(long)]
        program_id: Pubkey,

        /// Subdirectory of the repository to build from
        #[arg(long)]
        mount_path: Option<PathBuf>,

        /// Delegate to the remote attestation service and wait for its verdict
        #[arg(long, requires = "uploader")]
        remote: bool,

        /// Uploader identity for remote submission
        #[arg(long)]
        uploader: Option<Pubkey>,

        #[command(flatten)]
        build: BuildArgs,

        #[command(flatten)]
        hash: HashArgs,
    },

    /// Compare an executable inside a prebuilt image with the deployed program
    VerifyFromImage {
        /// Digest-pinned image reference
        #[arg(short, long)]
        image: String,

        /// Executable path relative to the image's working directory
        #[arg(short, long)]
        executable_path_in_image: String,

        #[arg(short, long)]
        program_id: Pubkey,

        #[command(flatten)]
        hash: HashArgs,
    },

    /// Remote attestation service
    Remote {
        #[command(subcommand)]
        action: RemoteCommands,
    },
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// Submit a verification job
    SubmitJob {
        #[arg(long)]
        program_id: Pubkey,

        #[arg(long)]
        uploader: Pubkey,

        #[arg(long)]
        repo_url: String,

        #[arg(long)]
        commit_hash: Option<String>,

        #[arg(long)]
        mount_path: Option<PathBuf>,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// Poll a job once, or until it finishes with --wait
    JobStatus {
        #[arg(long)]
        job_id: String,

        /// Keep polling with backoff until the job is terminal
        #[arg(long)]
        wait: bool,
    },

    /// List recorded verifications of a program
    Status {
        #[arg(long)]
        program_id: Pubkey,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// First signal cancels (containers and temp dirs are torn down); a second
/// one exits immediately.
fn install_signal_handlers(cancel: &CancelToken) -> Result<()> {
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register_conditional_shutdown(signal, 130, cancel.flag())?;
        signal_hook::flag::register(signal, cancel.flag())?;
    }
    Ok(())
}

fn run(cli: Cli) -> Result<commands::Outcome> {
    let cancel = CancelToken::new();
    install_signal_handlers(&cancel)?;
    let ctx = engine::Context::load(cli.config.as_deref(), cli.url.as_deref(), cli.json)?;

    match cli.command {
        Commands::Build {
            mount_path,
            build,
            hash,
        } => commands::build::run(&ctx, mount_path, &build, hash.algorithm, &cancel),
        Commands::GetExecutableHash {
            filepath,
            length,
            hash,
        } => commands::hash::executable(&ctx, &filepath, length, hash.algorithm),
        Commands::GetProgramHash {
            program_ids,
            length,
            hash,
        } => commands::hash::program(&ctx, &program_ids, length, hash.algorithm),
        Commands::GetBufferHash {
            buffer_address,
            hash,
        } => commands::hash::buffer(&ctx, &buffer_address, hash.algorithm),
        Commands::VerifyFromRepo {
            repo_url,
            commit_hash,
            program_id,
            mount_path,
            remote,
            uploader,
            build,
            hash,
        } => commands::verify::from_repo(
            &ctx,
            commands::verify::RepoArgs {
                repo_url,
                commit_hash,
                program_id,
                mount_path,
                uploader: uploader.filter(|_| remote),
                build,
                algorithm: hash.algorithm,
            },
            &cancel,
        ),
        Commands::VerifyFromImage {
            image,
            executable_path_in_image,
            program_id,
            hash,
        } => commands::verify::from_image(
            &ctx,
            &image,
            &executable_path_in_image,
            &program_id,
            hash.algorithm,
            &cancel,
        ),
        Commands::Remote { action } => match action {
            RemoteCommands::SubmitJob {
                program_id,
                uploader,
                repo_url,
                commit_hash,
                mount_path,
                build,
            } => commands::remote::submit(
                &ctx,
                commands::verify::RepoArgs {
                    repo_url,
                    commit_hash,
                    program_id,
                    mount_path,
                    uploader: Some(uploader),
                    build,
                    algorithm: DigestAlgorithm::default(),
                },
            ),
            RemoteCommands::JobStatus { job_id, wait } => {
                commands::remote::job_status(&ctx, &job_id, wait, &cancel)
            }
            RemoteCommands::Status { program_id } => commands::remote::status(&ctx, &program_id),
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            let code = e.downcast_ref::<VerifyError>().map_or(2, VerifyError::exit_code);
            let kind = e.downcast_ref::<VerifyError>().map_or("Error", VerifyError::kind);
            tracing::error!(kind, "{e:#}");
            ExitCode::from(code)
        }
    }
}
