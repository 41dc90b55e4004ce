//! Veribuild Harness: build orchestration and end-to-end verification flows.
//!
//! The harness owns every side effect the kernel refuses: child processes,
//! containers, temporary source trees, configuration files. It does NOT
//! implement hashing or comparison; it hands bytes to the kernel.
//!
//! # API Surface
//!
//! - [`orchestrator::BuildOrchestrator::build`] -- source + toolchain to one artifact
//! - [`verify::Verifier`] -- executable/program/buffer hashes, verify from
//!   repository or image, remote submission and polling
//! - [`config::EngineConfig::load`] -- TOML file plus environment overrides
//! - [`registry_cache::RegistryCache`] -- shared, refreshable toolchain table
//!
//! # Module Dependency Direction
//!
//! `cancel` ← `process` ← `runtime`/`source` ← `orchestrator` ← `verify`.
//! `config`, `lockfile` and `registry_cache` are leaves.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cancel;
pub mod config;
pub mod lockfile;
pub mod orchestrator;
pub mod process;
pub mod registry_cache;
pub mod runtime;
pub mod source;
pub mod verify;
