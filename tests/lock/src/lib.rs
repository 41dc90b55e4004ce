//! In-process doubles for the three seams the engine talks through: the RPC
//! node, the container runtime, and the attestation service.
//!
//! Every double records what it was asked to do so tests can assert on
//! side effects (containers removed, submissions sent) as well as results.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use veribuild_chain::loader::{self, UPGRADEABLE_LOADER_ID};
use veribuild_chain::pubkey::Pubkey;
use veribuild_chain::remote::{
    JobReport, RemoteError, RemoteService, SubmitReceipt, SubmitRequest, VerificationRecord,
};
use veribuild_chain::rpc::{RawAccount, RpcTransport, TransportError, MAINNET_GENESIS_HASH};
use veribuild_harness::cancel::RunControl;
use veribuild_harness::runtime::{ContainerRuntime, ContainerSpec, ExecOutcome, RuntimeError};
use veribuild_kernel::toolchain::Platform;

// ---------------------------------------------------------------------------
// Account layouts
// ---------------------------------------------------------------------------

/// Upgradeable program account pointing at `program_data`.
#[must_use]
pub fn program_account_data(program_data: &Pubkey) -> Vec<u8> {
    let mut data = 2u32.to_le_bytes().to_vec();
    data.extend_from_slice(program_data.as_bytes());
    data
}

/// Program-data account: 45-byte header, then `elf`.
#[must_use]
pub fn programdata_account_data(slot: u64, authority: Option<&Pubkey>, elf: &[u8]) -> Vec<u8> {
    let mut data = 3u32.to_le_bytes().to_vec();
    data.extend_from_slice(&slot.to_le_bytes());
    push_authority(&mut data, authority);
    data.extend_from_slice(elf);
    data
}

/// Buffer account: 37-byte header, then `elf`.
#[must_use]
pub fn buffer_account_data(authority: Option<&Pubkey>, elf: &[u8]) -> Vec<u8> {
    let mut data = 1u32.to_le_bytes().to_vec();
    push_authority(&mut data, authority);
    data.extend_from_slice(elf);
    data
}

fn push_authority(data: &mut Vec<u8>, authority: Option<&Pubkey>) {
    match authority {
        Some(key) => {
            data.push(1);
            data.extend_from_slice(key.as_bytes());
        }
        None => {
            data.push(0);
            data.extend_from_slice(&[0; 32]);
        }
    }
}

/// An executable with `padding` zero bytes after it, the way a program-data
/// account allocated for a larger upgrade looks.
#[must_use]
pub fn padded_elf(body: &[u8], padding: usize) -> Vec<u8> {
    let mut elf = body.to_vec();
    elf.resize(body.len() + padding, 0);
    elf
}

// ---------------------------------------------------------------------------
// RPC
// ---------------------------------------------------------------------------

/// A cluster held in memory.
pub struct MemoryChain {
    accounts: BTreeMap<Pubkey, RawAccount>,
    genesis_hash: String,
    transient_failures: Mutex<u32>,
    requests: AtomicUsize,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl MemoryChain {
    #[must_use]
    pub fn mainnet() -> Self {
        Self::with_genesis(MAINNET_GENESIS_HASH)
    }

    #[must_use]
    pub fn with_genesis(genesis_hash: &str) -> Self {
        Self {
            accounts: BTreeMap::new(),
            genesis_hash: genesis_hash.to_string(),
            transient_failures: Mutex::new(0),
            requests: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_account(mut self, address: Pubkey, owner: Pubkey, data: Vec<u8>) -> Self {
        self.accounts.insert(
            address,
            RawAccount {
                owner,
                data,
                executable: false,
                lamports: 1,
            },
        );
        self
    }

    /// Deploy `elf` behind an upgradeable program account at `program_id`.
    ///
    /// # Panics
    ///
    /// If the program-data address cannot be derived.
    #[must_use]
    pub fn with_upgradeable_program(self, program_id: Pubkey, elf: &[u8]) -> Self {
        let program_data = loader::program_data_address(&program_id).unwrap();
        let authority = Pubkey::new_from_array([9; 32]);
        self.with_account(
            program_id,
            UPGRADEABLE_LOADER_ID,
            program_account_data(&program_data),
        )
        .with_account(
            program_data,
            UPGRADEABLE_LOADER_ID,
            programdata_account_data(42, Some(&authority), elf),
        )
    }

    /// Fail the next `n` requests with a transient error.
    #[must_use]
    pub fn failing_first(self, n: u32) -> Self {
        *self.transient_failures.lock().unwrap() = n;
        self
    }

    #[must_use]
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn tick(&self) -> Result<(), TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut remaining = self.transient_failures.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(TransportError::Transient {
                detail: "503 Service Unavailable".into(),
            });
        }
        Ok(())
    }
}

impl RpcTransport for MemoryChain {
    fn get_account(&self, address: &Pubkey) -> Result<Option<RawAccount>, TransportError> {
        self.tick()?;
        Ok(self.accounts.get(address).cloned())
    }

    fn get_genesis_hash(&self) -> Result<String, TransportError> {
        self.tick()?;
        Ok(self.genesis_hash.clone())
    }

    fn endpoint(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Container runtime
// ---------------------------------------------------------------------------

/// Upper bound on a [`RecordingRuntime::blocking_pull`] pull.
pub const BLOCKING_PULL_LIMIT: std::time::Duration = std::time::Duration::from_secs(30);

/// A runtime that never starts anything. Compiles drop `artifact` at
/// `target/deploy/<library>.so` under the mounted host directory; image
/// copies write `artifact` to the host path.
#[derive(Clone)]
pub struct RecordingRuntime {
    inner: Arc<RuntimeState>,
}

struct RuntimeState {
    library: String,
    artifact: Vec<u8>,
    fail_compile: bool,
    block_pull: bool,
    calls: Mutex<Vec<String>>,
    mounts: Mutex<BTreeMap<String, std::path::PathBuf>>,
    next_id: AtomicUsize,
}

impl RecordingRuntime {
    #[must_use]
    pub fn new(library: &str, artifact: Vec<u8>) -> Self {
        Self::build(library, artifact, false)
    }

    /// Every compile exits non-zero.
    #[must_use]
    pub fn failing_compile(library: &str) -> Self {
        Self::build(library, Vec::new(), true)
    }

    /// Every image pull hangs until the operation is cancelled or times out
    /// (at most [`BLOCKING_PULL_LIMIT`]), then reports the interrupt.
    #[must_use]
    pub fn blocking_pull(library: &str, artifact: Vec<u8>) -> Self {
        let mut runtime = Self::build(library, artifact, false);
        if let Some(state) = Arc::get_mut(&mut runtime.inner) {
            state.block_pull = true;
        }
        runtime
    }

    fn build(library: &str, artifact: Vec<u8>, fail_compile: bool) -> Self {
        Self {
            inner: Arc::new(RuntimeState {
                library: library.to_string(),
                artifact,
                fail_compile,
                block_pull: false,
                calls: Mutex::new(Vec::new()),
                mounts: Mutex::new(BTreeMap::new()),
                next_id: AtomicUsize::new(0),
            }),
        }
    }

    /// Every call so far, as `verb args...` lines.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().unwrap().clone()
    }

    #[must_use]
    pub fn calls_starting_with(&self, verb: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(verb))
            .collect()
    }

    /// Containers started but not removed.
    #[must_use]
    pub fn live_containers(&self) -> usize {
        self.inner.mounts.lock().unwrap().len()
    }

    fn record(&self, line: String) {
        self.inner.calls.lock().unwrap().push(line);
    }
}

impl ContainerRuntime for RecordingRuntime {
    fn pull(&self, image: &str, platform: Platform, ctl: &RunControl) -> Result<(), RuntimeError> {
        self.record(format!("pull {image} {platform}"));
        if self.inner.block_pull {
            let started = std::time::Instant::now();
            while started.elapsed() < BLOCKING_PULL_LIMIT {
                if let Err(interrupt) = ctl.check() {
                    return Err(RuntimeError::Interrupted {
                        operation: "pull".into(),
                        interrupt,
                    });
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
        Ok(())
    }

    fn workdir(&self, _image: &str, _platform: Platform, _ctl: &RunControl) -> Result<String, RuntimeError> {
        Ok("/work".into())
    }

    fn start(&self, spec: &ContainerSpec, _ctl: &RunControl) -> Result<String, RuntimeError> {
        let id = format!("c{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.record(format!("start {id} {}", spec.image));
        let host = spec.mount.as_ref().map(|(host, _)| host.clone()).unwrap_or_default();
        self.inner.mounts.lock().unwrap().insert(id.clone(), host);
        Ok(id)
    }

    fn exec(
        &self,
        id: &str,
        workdir: Option<&str>,
        argv: &[String],
        _ctl: &RunControl,
    ) -> Result<ExecOutcome, RuntimeError> {
        let command = argv.join(" ");
        self.record(format!("exec {id} {} {command}", workdir.unwrap_or("-")));
        let compiling = argv.iter().any(|a| a.starts_with("build-"));
        if !compiling {
            return Ok(ExecOutcome {
                success: true,
                exit_code: Some(0),
                stderr_tail: String::new(),
            });
        }
        if self.inner.fail_compile {
            return Ok(ExecOutcome {
                success: false,
                exit_code: Some(101),
                stderr_tail: "error[E0425]: cannot find value".into(),
            });
        }
        let host = self.inner.mounts.lock().unwrap().get(id).cloned();
        if let Some(host) = host {
            let deploy = host.join("target").join("deploy");
            std::fs::create_dir_all(&deploy).map_err(|e| RuntimeError::Failed {
                operation: "exec".into(),
                detail: e.to_string(),
            })?;
            std::fs::write(deploy.join(format!("{}.so", self.inner.library)), &self.inner.artifact)
                .map_err(|e| RuntimeError::Failed {
                    operation: "exec".into(),
                    detail: e.to_string(),
                })?;
        }
        Ok(ExecOutcome {
            success: true,
            exit_code: Some(0),
            stderr_tail: String::new(),
        })
    }

    fn disconnect_network(&self, id: &str, _ctl: &RunControl) -> Result<(), RuntimeError> {
        self.record(format!("disconnect {id}"));
        Ok(())
    }

    fn copy_out(
        &self,
        id: &str,
        container_path: &str,
        host_path: &Path,
        _ctl: &RunControl,
    ) -> Result<(), RuntimeError> {
        self.record(format!("cp {id}:{container_path}"));
        std::fs::write(host_path, &self.inner.artifact).map_err(|e| RuntimeError::Failed {
            operation: "cp".into(),
            detail: e.to_string(),
        })
    }

    fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("rm {id}"));
        self.inner.mounts.lock().unwrap().remove(id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Attestation service
// ---------------------------------------------------------------------------

/// Answers status requests from a script; the last report repeats.
#[derive(Default)]
pub struct ScriptedRemote {
    reports: Mutex<VecDeque<JobReport>>,
    records: Vec<VerificationRecord>,
    submissions: Mutex<Vec<SubmitRequest>>,
    status_requests: AtomicUsize,
}

impl ScriptedRemote {
    #[must_use]
    pub fn new(reports: Vec<JobReport>) -> Self {
        Self {
            reports: Mutex::new(reports.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_records(mut self, records: Vec<VerificationRecord>) -> Self {
        self.records = records;
        self
    }

    #[must_use]
    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.submissions.lock().unwrap().clone()
    }

    #[must_use]
    pub fn status_requests(&self) -> usize {
        self.status_requests.load(Ordering::SeqCst)
    }
}

impl RemoteService for ScriptedRemote {
    fn submit(&self, request: &SubmitRequest) -> Result<SubmitReceipt, RemoteError> {
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push(request.clone());
        Ok(SubmitReceipt {
            request_id: format!("job-{}", submissions.len()),
            message: "Build verification started".into(),
        })
    }

    fn job_status(&self, _job_id: &str) -> Result<JobReport, RemoteError> {
        self.status_requests.fetch_add(1, Ordering::SeqCst);
        let mut reports = self.reports.lock().unwrap();
        let report = if reports.len() > 1 {
            reports.pop_front()
        } else {
            reports.front().cloned()
        };
        report.ok_or_else(|| RemoteError::MalformedResponse {
            operation: "job".into(),
            detail: "no scripted report".into(),
        })
    }

    fn status_all(&self, _program_id: &Pubkey) -> Result<Vec<VerificationRecord>, RemoteError> {
        Ok(self.records.clone())
    }
}
