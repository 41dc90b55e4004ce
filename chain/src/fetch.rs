//! On-chain data fetcher: program and buffer accounts to executable bytes.
//!
//! Ownership decides the layout:
//!
//! - upgradeable loader: the program account points at a derived program-data
//!   account; the executable follows its 45-byte header.
//! - loader v1/v2: the account data is the executable.
//! - anything else, or no account at all: [`FetchError::InvalidProgramAccount`].
//!
//! Every RPC call goes through the fetcher's [`RetryPolicy`]. Missing
//! accounts and wrong owners are terminal and never retried.

use std::ops::Range;

use rayon::prelude::*;
use veribuild_kernel::artifact::Artifact;

use crate::loader::{self, LoaderKind, LoaderState};
use crate::pubkey::Pubkey;
use crate::retry::{Attempt, RetryFailure, RetryPolicy};
use crate::rpc::{RawAccount, RpcTransport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Missing account, or an account no loader owns, or a loader state that
    /// does not hold what was asked for.
    #[error("invalid program account {address}: {detail}")]
    InvalidProgramAccount { address: Pubkey, detail: String },
    #[error("{operation} failed after {attempts} attempt(s) (retries exhausted: {retries_exhausted}): {detail}")]
    NetworkFailure {
        operation: String,
        attempts: u32,
        retries_exhausted: bool,
        detail: String,
    },
    #[error("malformed response from {operation}: {detail}")]
    MalformedResponse { operation: String, detail: String },
}

impl FetchError {
    fn from_retry(operation: String, failure: RetryFailure<TransportError>) -> Self {
        match failure.error {
            TransportError::Malformed { detail } => Self::MalformedResponse { operation, detail },
            TransportError::Transient { detail } | TransportError::Terminal { detail } => {
                Self::NetworkFailure {
                    operation,
                    attempts: failure.attempts,
                    retries_exhausted: failure.retries_exhausted,
                    detail,
                }
            }
        }
    }
}

/// Where the executable bytes came from, plus what the header said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountMetadata {
    /// Data read from the program account itself.
    NonUpgradeable,
    ProgramData {
        program_data_address: Pubkey,
        /// Slot of the last deployment.
        slot: u64,
        /// `None` once the program is immutable.
        upgrade_authority: Option<Pubkey>,
    },
    Buffer {
        authority: Option<Pubkey>,
    },
}

/// A fetched account with its executable byte range located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainAccount {
    owner: Pubkey,
    raw_data: Vec<u8>,
    executable_range: Range<usize>,
    metadata: AccountMetadata,
}

impl OnChainAccount {
    #[must_use]
    pub fn owner(&self) -> &Pubkey {
        &self.owner
    }

    /// Account data including any loader header.
    #[must_use]
    pub fn raw_data(&self) -> &[u8] {
        &self.raw_data
    }

    #[must_use]
    pub fn executable_range(&self) -> Range<usize> {
        self.executable_range.clone()
    }

    /// Executable bytes, padding included.
    #[must_use]
    pub fn executable_bytes(&self) -> &[u8] {
        &self.raw_data[self.executable_range.clone()]
    }

    #[must_use]
    pub fn metadata(&self) -> &AccountMetadata {
        &self.metadata
    }

    /// Copy the executable range into an artifact for hashing.
    #[must_use]
    pub fn to_artifact(&self, declared_length: Option<usize>) -> Artifact {
        let bytes = self.executable_bytes().to_vec();
        match declared_length {
            Some(n) => Artifact::with_declared_length(bytes, n),
            None => Artifact::new(bytes),
        }
    }
}

/// Fetches programs and buffers through an [`RpcTransport`].
pub struct ChainFetcher<T> {
    transport: T,
    retry: RetryPolicy,
}

impl<T: RpcTransport> ChainFetcher<T> {
    #[must_use]
    pub fn new(transport: T, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Locate the executable bytes of a deployed program.
    ///
    /// # Errors
    ///
    /// [`FetchError::InvalidProgramAccount`] if the account or its program
    /// data is missing or owned by something other than a loader;
    /// network errors after retries.
    pub fn fetch_program(&self, program_id: &Pubkey) -> Result<OnChainAccount, FetchError> {
        let account = self.require_account(program_id, "program")?;
        let invalid = |detail: String| FetchError::InvalidProgramAccount {
            address: *program_id,
            detail,
        };

        match loader::loader_kind(&account.owner) {
            None => Err(invalid(format!(
                "owned by {}, which is not a program loader",
                account.owner
            ))),
            Some(LoaderKind::NonUpgradeable) => {
                let len = account.data.len();
                Ok(OnChainAccount {
                    owner: account.owner,
                    raw_data: account.data,
                    executable_range: 0..len,
                    metadata: AccountMetadata::NonUpgradeable,
                })
            }
            Some(LoaderKind::Upgradeable) => {
                let LoaderState::Program { program_data } =
                    LoaderState::parse(&account.data).map_err(invalid)?
                else {
                    return Err(invalid("not an upgradeable program account".into()));
                };
                let derived = loader::program_data_address(program_id)
                    .map_err(|e| invalid(format!("cannot derive program-data address: {e}")))?;
                if derived != program_data {
                    return Err(invalid(format!(
                        "program-data address {program_data} does not match derived {derived}"
                    )));
                }
                self.fetch_program_data(program_id, &program_data)
            }
        }
    }

    fn fetch_program_data(
        &self,
        program_id: &Pubkey,
        address: &Pubkey,
    ) -> Result<OnChainAccount, FetchError> {
        let account = self.require_account(address, "program-data")?;
        let invalid = |detail: String| FetchError::InvalidProgramAccount {
            address: *program_id,
            detail,
        };
        if account.owner != loader::UPGRADEABLE_LOADER_ID {
            return Err(invalid(format!(
                "program-data account {address} is owned by {}",
                account.owner
            )));
        }
        let state = LoaderState::parse(&account.data)
            .map_err(|e| invalid(format!("program-data account {address}: {e}")))?;
        let LoaderState::ProgramData {
            slot,
            upgrade_authority,
        } = state
        else {
            return Err(invalid(format!("{address} is not a program-data account")));
        };
        tracing::debug!(%program_id, %address, slot, "located program data");
        let len = account.data.len();
        Ok(OnChainAccount {
            owner: account.owner,
            raw_data: account.data,
            executable_range: loader::PROGRAMDATA_HEADER_LEN..len,
            metadata: AccountMetadata::ProgramData {
                program_data_address: *address,
                slot,
                upgrade_authority,
            },
        })
    }

    /// Locate the executable bytes staged in an upgrade buffer.
    ///
    /// # Errors
    ///
    /// [`FetchError::InvalidProgramAccount`] if the account is missing, not
    /// owned by the upgradeable loader, or not in the buffer state.
    pub fn fetch_buffer(&self, buffer: &Pubkey) -> Result<OnChainAccount, FetchError> {
        let account = self.require_account(buffer, "buffer")?;
        let invalid = |detail: String| FetchError::InvalidProgramAccount {
            address: *buffer,
            detail,
        };
        if account.owner != loader::UPGRADEABLE_LOADER_ID {
            return Err(invalid(format!(
                "owned by {}, not the upgradeable loader",
                account.owner
            )));
        }
        let LoaderState::Buffer { authority } = LoaderState::parse(&account.data).map_err(invalid)?
        else {
            return Err(invalid("not a buffer account".into()));
        };
        let len = account.data.len();
        Ok(OnChainAccount {
            owner: account.owner,
            raw_data: account.data,
            executable_range: loader::BUFFER_HEADER_LEN..len,
            metadata: AccountMetadata::Buffer { authority },
        })
    }

    /// Cluster genesis hash, used to tell mainnet from other clusters.
    ///
    /// # Errors
    ///
    /// Network errors after retries.
    pub fn genesis_hash(&self) -> Result<String, FetchError> {
        self.retry
            .run(|_| self.transport.get_genesis_hash().map_err(classify))
            .map_err(|f| FetchError::from_retry("getGenesisHash".into(), f))
    }

    fn require_account(&self, address: &Pubkey, what: &str) -> Result<RawAccount, FetchError> {
        let fetched = self
            .retry
            .run(|attempt| {
                tracing::trace!(%address, attempt, endpoint = self.transport.endpoint(), "getAccountInfo");
                self.transport.get_account(address).map_err(classify)
            })
            .map_err(|f| FetchError::from_retry(format!("getAccountInfo({address})"), f))?;
        fetched.ok_or_else(|| FetchError::InvalidProgramAccount {
            address: *address,
            detail: format!("{what} account does not exist"),
        })
    }
}

impl<T: RpcTransport> ChainFetcher<T> {
    /// Fetch several programs with at most `max_in_flight` requests at once.
    ///
    /// Output order matches input order. Each program succeeds or fails on
    /// its own.
    pub fn fetch_programs(
        &self,
        program_ids: &[Pubkey],
        max_in_flight: usize,
    ) -> Vec<Result<OnChainAccount, FetchError>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_in_flight.max(1))
            .thread_name(|i| format!("veribuild-fetch-{i}"))
            .build();
        match pool {
            Ok(pool) => pool.install(|| {
                program_ids
                    .par_iter()
                    .map(|id| self.fetch_program(id))
                    .collect()
            }),
            Err(e) => {
                tracing::warn!(error = %e, "fetch pool unavailable, fetching sequentially");
                program_ids.iter().map(|id| self.fetch_program(id)).collect()
            }
        }
    }
}

fn classify(error: TransportError) -> Attempt<TransportError> {
    match error {
        TransportError::Transient { .. } => Attempt::Transient(error),
        TransportError::Terminal { .. } | TransportError::Malformed { .. } => {
            Attempt::Terminal(error)
        }
    }
}
