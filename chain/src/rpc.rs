//! JSON-RPC transport to a cluster endpoint.
//!
//! [`RpcTransport`] is the seam the fetcher is written against. The HTTP
//! implementation classifies failures as transient (retried by the caller)
//! or terminal; it never retries on its own.

use std::time::Duration;

use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;

use crate::pubkey::Pubkey;

/// Genesis hash of mainnet-beta.
pub const MAINNET_GENESIS_HASH: &str = "5eykt4UsFv8P8NJdTREpY1vzqKqZKvdpKuc147dw2N9d";

pub const MAINNET_URL: &str = "https://api.mainnet-beta.solana.com";
pub const DEVNET_URL: &str = "https://api.devnet.solana.com";
pub const TESTNET_URL: &str = "https://api.testnet.solana.com";
pub const LOCALNET_URL: &str = "http://localhost:8899";

/// A cluster argument that is neither a known alias nor an http(s) URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown cluster {input:?}: expected an http(s) URL or one of mainnet, devnet, testnet, localnet")]
pub struct UnknownCluster {
    pub input: String,
}

/// Expand cluster aliases to endpoint URLs.
///
/// # Errors
///
/// Returns [`UnknownCluster`] for anything that is not an alias or URL.
pub fn resolve_cluster_url(input: &str) -> Result<String, UnknownCluster> {
    let url = match input.trim() {
        "mainnet" | "mainnet-beta" | "main" | "m" => MAINNET_URL,
        "devnet" | "dev" | "d" => DEVNET_URL,
        "testnet" | "test" | "t" => TESTNET_URL,
        "localnet" | "localhost" | "local" | "l" => LOCALNET_URL,
        other if other.starts_with("https://") || other.starts_with("http://") => {
            return Ok(other.to_string())
        }
        _ => {
            return Err(UnknownCluster {
                input: input.to_string(),
            })
        }
    };
    Ok(url.to_string())
}

/// An account as returned by the RPC node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAccount {
    pub owner: Pubkey,
    pub data: Vec<u8>,
    pub executable: bool,
    pub lamports: u64,
}

/// Transport-level failure, pre-classified for retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Rate limiting, 5xx, timeouts, connection errors.
    #[error("transient: {detail}")]
    Transient { detail: String },
    /// 4xx (other than 429) or a JSON-RPC error object.
    #[error("rejected: {detail}")]
    Terminal { detail: String },
    /// The node answered with something that is not the expected shape.
    #[error("malformed response: {detail}")]
    Malformed { detail: String },
}

/// Read-only access to cluster state.
///
/// Implementations must be safe to call from several threads at once.
pub trait RpcTransport: Send + Sync {
    /// `Ok(None)` means the account does not exist.
    ///
    /// # Errors
    ///
    /// Classified transport failure.
    fn get_account(&self, address: &Pubkey) -> Result<Option<RawAccount>, TransportError>;

    /// # Errors
    ///
    /// Classified transport failure.
    fn get_genesis_hash(&self) -> Result<String, TransportError>;

    /// Endpoint label for logs.
    fn endpoint(&self) -> &str;
}

/// JSON-RPC over HTTP.
pub struct HttpRpcClient {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpRpcClient {
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Terminal {
                detail: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, TransportError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|e| TransportError::Transient {
                detail: format!("{method}: {e}"),
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(TransportError::Transient {
                detail: format!("{method}: HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(TransportError::Terminal {
                detail: format!("{method}: HTTP {status}"),
            });
        }

        let envelope: RpcEnvelope<T> = response.json().map_err(|e| TransportError::Malformed {
            detail: format!("{method}: {e}"),
        })?;
        decode_envelope(method, envelope)
    }
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct AccountInfoResult {
    value: Option<AccountValue>,
}

#[derive(Deserialize)]
struct AccountValue {
    data: (String, String),
    owner: String,
    executable: bool,
    lamports: u64,
}

fn decode_envelope<T>(method: &str, envelope: RpcEnvelope<T>) -> Result<T, TransportError> {
    if let Some(err) = envelope.error {
        // -32005 is the node-is-behind / rate-limit family.
        let detail = format!("{method}: RPC error {}: {}", err.code, err.message);
        return Err(if err.code == -32005 {
            TransportError::Transient { detail }
        } else {
            TransportError::Terminal { detail }
        });
    }
    envelope.result.ok_or_else(|| TransportError::Malformed {
        detail: format!("{method}: neither result nor error present"),
    })
}

fn decode_account(value: AccountValue) -> Result<RawAccount, TransportError> {
    let (encoded, encoding) = value.data;
    if encoding != "base64" {
        return Err(TransportError::Malformed {
            detail: format!("expected base64 account data, got {encoding}"),
        });
    }
    let data = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| TransportError::Malformed {
            detail: format!("account data is not base64: {e}"),
        })?;
    let owner = value.owner.parse().map_err(|e| TransportError::Malformed {
        detail: format!("account owner: {e}"),
    })?;
    Ok(RawAccount {
        owner,
        data,
        executable: value.executable,
        lamports: value.lamports,
    })
}

impl RpcTransport for HttpRpcClient {
    fn get_account(&self, address: &Pubkey) -> Result<Option<RawAccount>, TransportError> {
        let result: AccountInfoResult = self.call(
            "getAccountInfo",
            json!([address.to_string(), {"encoding": "base64", "commitment": "confirmed"}]),
        )?;
        result.value.map(decode_account).transpose()
    }

    fn get_genesis_hash(&self) -> Result<String, TransportError> {
        self.call("getGenesisHash", json!([]))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}
