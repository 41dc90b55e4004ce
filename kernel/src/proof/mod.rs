//! Proof module: strip policies, canonical digests, and hash comparison.
//!
//! Depends on `artifact`. Nothing depends on `proof` within the kernel.

pub mod compare;
pub mod hash;
pub mod strip;
