//! Veribuild Chain: everything that talks to a cluster or the attestation
//! service.
//!
//! # API Surface
//!
//! - [`fetch::ChainFetcher::fetch_program`] / [`fetch::ChainFetcher::fetch_buffer`]
//!   -- locate executable bytes behind loader headers
//! - [`fetch::ChainFetcher::fetch_programs`] -- bounded-parallel batch fetch
//! - [`remote::RemoteJobManager::submit`] / [`remote::RemoteJobManager::poll`]
//!   -- remote verification jobs
//!
//! # Module Dependency Direction
//!
//! `pubkey` ← `loader` ← `fetch`, `rpc` ← `fetch`, `retry` ← `fetch`/`remote`.
//!
//! Network access goes through two traits, [`rpc::RpcTransport`] and
//! [`remote::RemoteService`], so every flow above runs against in-memory
//! fakes in tests.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod fetch;
pub mod loader;
pub mod pubkey;
pub mod remote;
pub mod retry;
pub mod rpc;
