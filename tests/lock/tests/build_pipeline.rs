//! Build pipeline lock, run against a recording container runtime.
//!
//! Checks the stage order (pull, start, fetch with network, disconnect,
//! offline compile, remove), that the container is removed on every exit
//! path, and that resolution failures happen before any container work.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lock_tests::{padded_elf, MemoryChain, RecordingRuntime, ScriptedRemote};
use veribuild_chain::fetch::{ChainFetcher, FetchError};
use veribuild_chain::pubkey::Pubkey;
use veribuild_chain::remote::RemoteJobManager;
use veribuild_chain::retry::RetryPolicy;
use veribuild_harness::cancel::CancelToken;
use veribuild_harness::orchestrator::{
    BuildError, BuildOrchestrator, BuildSettings, BuildSpec, BuildStage, ToolchainSelector,
};
use veribuild_harness::registry_cache::RegistryCache;
use veribuild_harness::source::SourceLocation;
use veribuild_harness::verify::{Verifier, VerifyError};
use veribuild_kernel::proof::compare::Verdict;
use veribuild_kernel::proof::hash::DigestAlgorithm;
use veribuild_kernel::toolchain::{ImageRef, ToolchainError, ToolchainRegistry};

const IMAGE: &str =
    "example/verifiable-build@sha256:1111111111111111111111111111111111111111111111111111111111111111";
const ELF: &[u8] = b"\x7fELF\x02\x01\x01\x00built program\x07";

fn registry() -> RegistryCache {
    let snapshot = format!("[[toolchain]]\nversion = \"1.18.26\"\nimage = \"{IMAGE}\"\n");
    RegistryCache::new(ToolchainRegistry::from_toml_str(&snapshot).unwrap())
}

fn settings(work_root: &Path) -> BuildSettings {
    BuildSettings {
        timeout: Duration::from_secs(60),
        work_root: Some(work_root.to_path_buf()),
        limits: None,
        retry: RetryPolicy::none(),
    }
}

fn write(root: &Path, rel: &str, text: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, text).unwrap();
}

fn program_manifest(name: &str) -> String {
    format!(
        "[package]\nname = \"{name}\"\nversion = \"0.1.0\"\n\n[lib]\nname = \"{name}\"\ncrate-type = [\"cdylib\", \"lib\"]\n"
    )
}

fn lockfile(solana_version: &str) -> String {
    format!(
        "version = 3\n\n[[package]]\nname = \"solana-program\"\nversion = \"{solana_version}\"\n\n[[package]]\nname = \"borsh\"\nversion = \"0.10.3\"\n"
    )
}

/// A one-program source tree locked to `solana_version`.
fn single_program(solana_version: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "Cargo.toml", &program_manifest("dex"));
    write(dir.path(), "Cargo.lock", &lockfile(solana_version));
    write(dir.path(), "src/lib.rs", "");
    // A stale local artifact must not leak into the build.
    write(dir.path(), "target/deploy/dex.so", "stale");
    dir
}

fn orchestrator(runtime: RecordingRuntime, work_root: &Path) -> BuildOrchestrator<RecordingRuntime> {
    BuildOrchestrator::new(runtime, Arc::new(registry()), settings(work_root))
}

fn local_spec(path: &Path) -> BuildSpec {
    BuildSpec::new(SourceLocation::Path {
        path: path.to_path_buf(),
    })
}

#[test]
fn local_build_runs_every_stage_in_order() {
    let source = single_program("1.18.26");
    let work = tempfile::tempdir().unwrap();
    let runtime = RecordingRuntime::new("dex", ELF.to_vec());
    let orch = orchestrator(runtime.clone(), work.path());

    let built = orch.build(&local_spec(source.path()), &CancelToken::new()).unwrap();
    assert_eq!(built.artifact.bytes(), ELF);
    assert_eq!(built.library, "dex");
    assert_eq!(built.toolchain.version().to_string(), "1.18.26");
    assert_eq!(built.toolchain.image().as_str(), IMAGE);

    let verbs: Vec<String> = runtime
        .calls()
        .iter()
        .map(|c| c.split(' ').next().unwrap().to_string())
        .collect();
    assert_eq!(verbs, ["pull", "start", "exec", "disconnect", "exec", "exec", "rm"]);

    let execs = runtime.calls_starting_with("exec");
    assert!(execs[0].contains("fetch --locked"), "{}", execs[0]);
    assert!(execs[1].contains("build-sbf"), "{}", execs[1]);
    assert!(execs[1].contains("--offline"), "{}", execs[1]);
    assert_eq!(runtime.live_containers(), 0);
    // scratch trees are gone once the build returns
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
}

#[test]
fn unnamed_lib_of_a_hyphenated_package_builds_without_a_library_name() {
    let source = tempfile::tempdir().unwrap();
    write(
        source.path(),
        "Cargo.toml",
        "[package]\nname = \"token-vault\"\nversion = \"0.1.0\"\n\n[lib]\ncrate-type = [\"cdylib\", \"lib\"]\n",
    );
    write(source.path(), "Cargo.lock", &lockfile("1.18.26"));
    write(source.path(), "src/lib.rs", "");
    let work = tempfile::tempdir().unwrap();
    let runtime = RecordingRuntime::new("token_vault", ELF.to_vec());
    let orch = orchestrator(runtime.clone(), work.path());

    let built = orch.build(&local_spec(source.path()), &CancelToken::new()).unwrap();
    assert_eq!(built.library, "token_vault");
    assert_eq!(built.artifact.bytes(), ELF);
    assert_eq!(runtime.live_containers(), 0);
}

#[test]
fn features_and_cargo_args_reach_the_compile_command() {
    let source = single_program("1.18.26");
    let work = tempfile::tempdir().unwrap();
    let runtime = RecordingRuntime::new("dex", ELF.to_vec());
    let orch = orchestrator(runtime.clone(), work.path());

    let mut spec = local_spec(source.path());
    spec.cargo_features = vec!["mainnet".into(), "no-entrypoint".into()];
    spec.cargo_args = vec!["--jobs".into(), "1".into()];
    orch.build(&spec, &CancelToken::new()).unwrap();

    let compile = runtime
        .calls_starting_with("exec")
        .into_iter()
        .find(|c| c.contains("build-"))
        .unwrap();
    assert!(compile.ends_with("--features mainnet,no-entrypoint --jobs 1"), "{compile}");
}

#[test]
fn compile_failure_still_removes_the_container() {
    let source = single_program("1.18.26");
    let work = tempfile::tempdir().unwrap();
    let runtime = RecordingRuntime::failing_compile("dex");
    let orch = orchestrator(runtime.clone(), work.path());

    let err = orch.build(&local_spec(source.path()), &CancelToken::new()).unwrap_err();
    match err {
        BuildError::BuildFailure { stage, detail } => {
            assert_eq!(stage, BuildStage::Compiling);
            assert!(detail.contains("status 101"), "{detail}");
            assert!(detail.contains("E0425"), "{detail}");
        }
        other => panic!("expected BuildFailure, got {other:?}"),
    }
    assert_eq!(runtime.calls_starting_with("rm").len(), 1);
    assert_eq!(runtime.live_containers(), 0);
}

#[cfg(unix)]
#[test]
fn teardown_returns_the_mount_to_its_owner_before_removal() {
    use std::os::unix::fs::MetadataExt;

    for runtime in [
        RecordingRuntime::new("dex", ELF.to_vec()),
        RecordingRuntime::failing_compile("dex"),
    ] {
        let source = single_program("1.18.26");
        let work = tempfile::tempdir().unwrap();
        let meta = std::fs::metadata(work.path()).unwrap();
        let _ = orchestrator(runtime.clone(), work.path()).build(&local_spec(source.path()), &CancelToken::new());

        let calls = runtime.calls();
        let (chown, rm) = (calls.len() - 2, calls.len() - 1);
        assert_eq!(
            calls[chown],
            format!("exec c0 - chown -R {}:{} /work", meta.uid(), meta.gid())
        );
        assert_eq!(calls[rm], "rm c0");
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }
}

#[test]
fn several_libraries_without_a_name_is_ambiguous() {
    let source = tempfile::tempdir().unwrap();
    write(source.path(), "Cargo.toml", "[workspace]\nmembers = [\"programs/*\"]\n");
    write(source.path(), "Cargo.lock", &lockfile("1.18.26"));
    write(source.path(), "programs/dex/Cargo.toml", &program_manifest("dex"));
    write(source.path(), "programs/vault/Cargo.toml", &program_manifest("vault"));
    let work = tempfile::tempdir().unwrap();
    let runtime = RecordingRuntime::new("dex", ELF.to_vec());
    let orch = orchestrator(runtime.clone(), work.path());

    let err = orch.build(&local_spec(source.path()), &CancelToken::new()).unwrap_err();
    assert_eq!(
        err,
        BuildError::AmbiguousLibraryName {
            candidates: vec!["dex".into(), "vault".into()]
        }
    );
    assert!(runtime.calls().is_empty(), "no container work before selection");

    let mut named = local_spec(source.path());
    named.library_name = Some("vault".into());
    let runtime = RecordingRuntime::new("vault", ELF.to_vec());
    let built = orchestrator(runtime.clone(), work.path())
        .build(&named, &CancelToken::new())
        .unwrap();
    assert_eq!(built.library, "vault");
    let compile = runtime
        .calls_starting_with("exec")
        .into_iter()
        .find(|c| c.contains("build-"))
        .unwrap();
    assert!(compile.starts_with("exec c0 /work/programs/vault "), "{compile}");
    assert!(compile.contains("--manifest-path /work/programs/vault/Cargo.toml"), "{compile}");
}

#[test]
fn unregistered_version_fails_without_touching_the_runtime() {
    let source = single_program("1.17.3");
    let work = tempfile::tempdir().unwrap();
    let runtime = RecordingRuntime::new("dex", ELF.to_vec());
    let err = orchestrator(runtime.clone(), work.path())
        .build(&local_spec(source.path()), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, BuildError::Toolchain(ToolchainError::NotFound { .. })));
    assert!(runtime.calls().is_empty());
}

#[test]
fn digest_pinned_image_bypasses_the_registry() {
    let source = single_program("1.17.3");
    let work = tempfile::tempdir().unwrap();
    let runtime = RecordingRuntime::new("dex", ELF.to_vec());
    let image = "custom/build@sha256:2222222222222222222222222222222222222222222222222222222222222222";

    let mut spec = local_spec(source.path());
    spec.toolchain = ToolchainSelector::Image(ImageRef::parse(image).unwrap());
    let built = orchestrator(runtime.clone(), work.path())
        .build(&spec, &CancelToken::new())
        .unwrap();
    assert_eq!(built.toolchain.image().as_str(), image);
    assert_eq!(built.toolchain.version().to_string(), "1.17.3");
    assert!(runtime.calls()[0].starts_with(&format!("pull {image}")));
}

#[test]
fn cancelled_before_start_does_nothing() {
    let source = single_program("1.18.26");
    let work = tempfile::tempdir().unwrap();
    let runtime = RecordingRuntime::new("dex", ELF.to_vec());
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = orchestrator(runtime.clone(), work.path())
        .build(&local_spec(source.path()), &cancel)
        .unwrap_err();
    assert_eq!(
        err,
        BuildError::Cancelled {
            stage: BuildStage::Resolving
        }
    );
    assert!(runtime.calls().is_empty());
}

#[test]
fn cancelling_a_hung_pull_tears_down_the_build() {
    let source = single_program("1.18.26");
    let work = tempfile::tempdir().unwrap();
    let runtime = RecordingRuntime::blocking_pull("dex", ELF.to_vec());
    let orch = orchestrator(runtime.clone(), work.path());
    let cancel = CancelToken::new();

    let started = Instant::now();
    let err = std::thread::scope(|scope| {
        let build = scope.spawn(|| orch.build(&local_spec(source.path()), &cancel));
        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        build.join().unwrap().unwrap_err()
    });
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(
        err,
        BuildError::Cancelled {
            stage: BuildStage::Vendoring
        }
    );
    assert_eq!(runtime.live_containers(), 0);
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
}

// --- image verification through the engine ---

fn verifier(
    runtime: RecordingRuntime,
    chain: MemoryChain,
    work_root: &Path,
) -> Verifier<MemoryChain, RecordingRuntime, ScriptedRemote> {
    Verifier::new(
        ChainFetcher::new(chain, RetryPolicy::none()),
        orchestrator(runtime, work_root),
        RemoteJobManager::new(ScriptedRemote::default()),
        4,
    )
}

#[test]
fn image_executable_matches_padded_deployment() {
    let program_id = Pubkey::new_from_array([3; 32]);
    let chain = MemoryChain::mainnet().with_upgradeable_program(program_id, &padded_elf(ELF, 8192));
    let work = tempfile::tempdir().unwrap();
    let runtime = RecordingRuntime::new("dex", ELF.to_vec());
    let engine = verifier(runtime.clone(), chain, work.path());

    let result = engine
        .verify_from_image(
            &ImageRef::parse(IMAGE).unwrap(),
            "target/deploy/dex.so",
            &program_id,
            DigestAlgorithm::Sha256,
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(result.verdict(), Verdict::Match);
    assert_eq!(result.built_hash().digest_bytes(), result.chain_hash().digest_bytes());
    assert!(runtime
        .calls_starting_with("cp")
        .contains(&"cp c0:/work/target/deploy/dex.so".to_string()));
    assert_eq!(runtime.live_containers(), 0);
}

#[test]
fn image_executable_mismatch_reports_both_hashes() {
    let program_id = Pubkey::new_from_array([3; 32]);
    let chain = MemoryChain::mainnet().with_upgradeable_program(program_id, b"\x7fELF other");
    let work = tempfile::tempdir().unwrap();
    let engine = verifier(RecordingRuntime::new("dex", ELF.to_vec()), chain, work.path());

    let result = engine
        .verify_from_image(
            &ImageRef::parse(IMAGE).unwrap(),
            "target/deploy/dex.so",
            &program_id,
            DigestAlgorithm::Sha1,
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(result.verdict(), Verdict::Mismatch);
    assert_ne!(result.built_hash(), result.chain_hash());
    assert_eq!(result.built_hash().algorithm(), DigestAlgorithm::Sha1);
}

#[test]
fn batch_program_hashes_keep_input_order_and_fail_individually() {
    let a = Pubkey::new_from_array([10; 32]);
    let b = Pubkey::new_from_array([11; 32]);
    let missing = Pubkey::new_from_array([12; 32]);
    let chain = MemoryChain::mainnet()
        .with_upgradeable_program(a, b"program a")
        .with_upgradeable_program(b, b"program b");
    let work = tempfile::tempdir().unwrap();
    let engine = verifier(RecordingRuntime::new("dex", Vec::new()), chain, work.path());

    let results = engine.program_hashes(&[b, missing, a], DigestAlgorithm::Sha256);
    assert_eq!(results.len(), 3);
    let single_b = engine.program_hash(&b, None, DigestAlgorithm::Sha256).unwrap();
    let single_a = engine.program_hash(&a, None, DigestAlgorithm::Sha256).unwrap();
    assert_eq!(results[0].as_ref().unwrap().hash, single_b.hash);
    assert!(matches!(results[1], Err(VerifyError::Fetch(_))));
    assert_eq!(results[2].as_ref().unwrap().hash, single_a.hash);
}

#[test]
fn failed_fetch_stops_the_image_extraction_early() {
    let missing = Pubkey::new_from_array([4; 32]);
    let work = tempfile::tempdir().unwrap();
    let runtime = RecordingRuntime::blocking_pull("dex", ELF.to_vec());
    let engine = verifier(runtime.clone(), MemoryChain::mainnet(), work.path());
    let cancel = CancelToken::new();

    let started = Instant::now();
    let err = engine
        .verify_from_image(
            &ImageRef::parse(IMAGE).unwrap(),
            "target/deploy/dex.so",
            &missing,
            DigestAlgorithm::Sha256,
            &cancel,
        )
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(
        matches!(err, VerifyError::Fetch(FetchError::InvalidProgramAccount { .. })),
        "{err:?}"
    );
    // the caller's token is not consumed by the internal stop
    assert!(!cancel.is_cancelled());
    assert_eq!(runtime.live_containers(), 0);
}
