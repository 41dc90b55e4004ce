//! Veribuild Kernel: the pure core of the verification engine.
//!
//! # API Surface
//!
//! - [`toolchain::registry::ToolchainRegistry::resolve`] -- version string to pinned toolchain entry
//! - [`proof::strip::canonicalize`] -- normalize raw executable bytes under a strip policy
//! - [`proof::hash::digest`] -- digest a canonical byte range into a [`proof::hash::CanonicalHash`]
//! - [`proof::compare::compare`] -- two canonical hashes to a verdict
//!
//! # Module Dependency Direction
//!
//! `artifact` ← `proof`, and `toolchain` stands alone.
//!
//! One-way only. No cycles. Nothing in this crate touches the filesystem,
//! the network, or child processes; those live in `veribuild-chain` and
//! `veribuild-harness`.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod artifact;
pub mod proof;
pub mod toolchain;
