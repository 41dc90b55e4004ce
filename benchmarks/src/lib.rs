//! Shared inputs for veribuild benchmark suites.

use veribuild_chain::pubkey::Pubkey;

/// A deterministic pseudo-executable of `body_len` non-zero-terminated bytes
/// followed by `padding` zeros, shaped like a program-data payload.
#[must_use]
pub fn padded_executable(body_len: usize, padding: usize) -> Vec<u8> {
    let mut state: u32 = 0x9e37_79b9;
    let mut bytes: Vec<u8> = (0..body_len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state.to_le_bytes()[0]
        })
        .collect();
    if let Some(last) = bytes.last_mut() {
        *last |= 1;
    }
    bytes.resize(body_len + padding, 0);
    bytes
}

/// Upgradeable-loader program-data account data: 45-byte header, then `elf`.
#[must_use]
pub fn programdata_account(elf: &[u8]) -> Vec<u8> {
    let mut data = 3u32.to_le_bytes().to_vec();
    data.extend_from_slice(&311_000_000u64.to_le_bytes());
    data.push(1);
    data.extend_from_slice(Pubkey::new_from_array([7; 32]).as_bytes());
    data.extend_from_slice(elf);
    data
}
