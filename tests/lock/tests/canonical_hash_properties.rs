//! Canonical hashing properties over arbitrary inputs.
//!
//! - Same bytes, same policy, same algorithm: same digest, every time.
//! - Zero padding never changes a trimmed hash.
//! - A fixed-length hash ignores everything past the declared length.
//! - Hashes from different algorithms or policies never compare.

use proptest::prelude::*;
use sha2::{Digest, Sha256};
use veribuild_kernel::proof::compare::{compare, Verdict};
use veribuild_kernel::proof::hash::{canonical_hash, DigestAlgorithm, HashError};
use veribuild_kernel::proof::strip::StripPolicy;

fn algorithm() -> impl Strategy<Value = DigestAlgorithm> {
    prop_oneof![Just(DigestAlgorithm::Sha256), Just(DigestAlgorithm::Sha1)]
}

proptest! {
    #[test]
    fn hashing_is_deterministic(bytes in proptest::collection::vec(any::<u8>(), 0..2048), alg in algorithm()) {
        let a = canonical_hash(&bytes, StripPolicy::TrimTrailingZeros, alg).unwrap();
        let b = canonical_hash(&bytes.clone(), StripPolicy::TrimTrailingZeros, alg).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn zero_padding_is_invisible_to_trim(
        body in proptest::collection::vec(any::<u8>(), 0..1024),
        padding in 0usize..4096,
        alg in algorithm(),
    ) {
        let mut padded = body.clone();
        padded.resize(body.len() + padding, 0);
        let bare = canonical_hash(&body, StripPolicy::TrimTrailingZeros, alg).unwrap();
        let with_padding = canonical_hash(&padded, StripPolicy::TrimTrailingZeros, alg).unwrap();
        prop_assert_eq!(bare.digest_bytes(), with_padding.digest_bytes());
        prop_assert_eq!(compare(&bare, &with_padding).unwrap().verdict(), Verdict::Match);
    }

    #[test]
    fn fixed_length_ignores_the_tail(
        head in proptest::collection::vec(any::<u8>(), 1..512),
        tail_a in proptest::collection::vec(any::<u8>(), 0..512),
        tail_b in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let n = head.len();
        let a: Vec<u8> = head.iter().chain(&tail_a).copied().collect();
        let b: Vec<u8> = head.iter().chain(&tail_b).copied().collect();
        let ha = canonical_hash(&a, StripPolicy::FixedLength(n), DigestAlgorithm::Sha256).unwrap();
        let hb = canonical_hash(&b, StripPolicy::FixedLength(n), DigestAlgorithm::Sha256).unwrap();
        prop_assert_eq!(&ha, &hb);
        let expected = Sha256::digest(&head);
        prop_assert_eq!(ha.digest_bytes(), expected.as_slice());
    }

    #[test]
    fn fixed_length_past_the_end_is_rejected(
        bytes in proptest::collection::vec(any::<u8>(), 0..256),
        extra in 1usize..64,
    ) {
        let err = canonical_hash(&bytes, StripPolicy::FixedLength(bytes.len() + extra), DigestAlgorithm::Sha256)
            .unwrap_err();
        let is_invalid_length = matches!(err, HashError::InvalidLength { .. });
        prop_assert!(is_invalid_length);
    }
}

#[test]
fn trimming_is_idempotent() {
    let padded = [1u8, 2, 0, 3, 0, 0, 0];
    let once = canonical_hash(&padded, StripPolicy::TrimTrailingZeros, DigestAlgorithm::Sha256).unwrap();
    let twice = canonical_hash(&padded[..4], StripPolicy::TrimTrailingZeros, DigestAlgorithm::Sha256).unwrap();
    assert_eq!(once, twice);
    assert_eq!(once.source_byte_length(), Some(4));
}

#[test]
fn trimmed_digest_matches_an_independent_sha256() {
    let padded = [0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0];
    let ours = canonical_hash(&padded, StripPolicy::TrimTrailingZeros, DigestAlgorithm::Sha256).unwrap();
    assert_eq!(ours.hex(), hex::encode(Sha256::digest([0xde, 0xad, 0xbe, 0xef])));
}

#[test]
fn different_algorithms_never_compare() {
    let bytes = b"program";
    let sha256 = canonical_hash(bytes, StripPolicy::TrimTrailingZeros, DigestAlgorithm::Sha256).unwrap();
    let sha1 = canonical_hash(bytes, StripPolicy::TrimTrailingZeros, DigestAlgorithm::Sha1).unwrap();
    assert!(matches!(
        compare(&sha256, &sha1),
        Err(HashError::IncompatibleComparison { .. })
    ));
}

#[test]
fn different_policies_never_compare() {
    let bytes = b"program";
    let trimmed = canonical_hash(bytes, StripPolicy::TrimTrailingZeros, DigestAlgorithm::Sha256).unwrap();
    let fixed = canonical_hash(bytes, StripPolicy::FixedLength(bytes.len()), DigestAlgorithm::Sha256).unwrap();
    assert_eq!(trimmed.digest_bytes(), fixed.digest_bytes());
    assert!(compare(&trimmed, &fixed).is_err());
}

#[test]
fn empty_after_trim_hashes_the_empty_string() {
    let zeros = [0u8; 64];
    let h = canonical_hash(&zeros, StripPolicy::TrimTrailingZeros, DigestAlgorithm::Sha1).unwrap();
    assert_eq!(h.hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
}

#[test]
fn comparing_twice_gives_the_same_outcome() {
    let a = canonical_hash(b"\x7fELF body\0\0", StripPolicy::TrimTrailingZeros, DigestAlgorithm::Sha256).unwrap();
    let b = canonical_hash(b"\x7fELF body", StripPolicy::TrimTrailingZeros, DigestAlgorithm::Sha256).unwrap();
    let first = compare(&a, &b).unwrap();
    let second = compare(&a, &b).unwrap();
    assert!(first.same_outcome(&second));
    assert_eq!(first.verdict(), Verdict::Match);
}
