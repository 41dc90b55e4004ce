//! Loader program identities and the upgradeable loader's account layout.
//!
//! The upgradeable loader writes a fixed-size header in front of every
//! program-data and buffer account. The executable starts right after the
//! header; everything past the true executable end is zero padding.
//!
//! ```text
//! Program:      [tag=2 u32][program_data: 32]                        36 bytes
//! ProgramData:  [tag=3 u32][slot u64][opt u8][authority: 32][elf..]  header 45
//! Buffer:       [tag=1 u32][opt u8][authority: 32][elf..]             header 37
//! ```
//!
//! All integers are little-endian. Offsets are fixed whether or not an
//! authority is present.

use crate::pubkey::Pubkey;

/// `BPFLoaderUpgradeab1e11111111111111111111111`
pub const UPGRADEABLE_LOADER_ID: Pubkey = Pubkey::new_from_array([
    2, 168, 246, 145, 78, 136, 161, 176, 226, 16, 21, 62, 247, 99, 174, 43, 0, 194, 185, 61, 22,
    193, 36, 210, 192, 83, 122, 16, 4, 128, 0, 0,
]);

/// `BPFLoader2111111111111111111111111111111111`
pub const LOADER_V2_ID: Pubkey = Pubkey::new_from_array([
    2, 168, 246, 145, 78, 136, 161, 110, 57, 90, 225, 40, 148, 143, 250, 105, 86, 147, 55, 104,
    24, 221, 71, 67, 82, 33, 243, 198, 0, 0, 0, 0,
]);

/// `BPFLoader1111111111111111111111111111111111`
pub const LOADER_V1_ID: Pubkey = Pubkey::new_from_array([
    2, 168, 246, 145, 78, 136, 161, 107, 189, 35, 149, 133, 95, 100, 4, 217, 180, 244, 86, 183,
    130, 27, 176, 20, 87, 73, 66, 140, 0, 0, 0, 0,
]);

pub const PROGRAM_ACCOUNT_LEN: usize = 4 + 32;
pub const PROGRAMDATA_HEADER_LEN: usize = 4 + 8 + 1 + 32;
pub const BUFFER_HEADER_LEN: usize = 4 + 1 + 32;

const TAG_UNINITIALIZED: u32 = 0;
const TAG_BUFFER: u32 = 1;
const TAG_PROGRAM: u32 = 2;
const TAG_PROGRAMDATA: u32 = 3;

/// How an account's owner relates to program loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKind {
    Upgradeable,
    /// Loader v1 or v2: account data is the executable, no header.
    NonUpgradeable,
}

/// Classify an owner program id.
#[must_use]
pub fn loader_kind(owner: &Pubkey) -> Option<LoaderKind> {
    if *owner == UPGRADEABLE_LOADER_ID {
        Some(LoaderKind::Upgradeable)
    } else if *owner == LOADER_V2_ID || *owner == LOADER_V1_ID {
        Some(LoaderKind::NonUpgradeable)
    } else {
        None
    }
}

/// The program-data address the upgradeable loader derives for `program_id`.
///
/// # Errors
///
/// Propagates derivation failures, which cannot occur for a single 32-byte seed
/// in practice.
pub fn program_data_address(program_id: &Pubkey) -> Result<Pubkey, crate::pubkey::PubkeyError> {
    Pubkey::find_program_address(&[program_id.as_bytes()], &UPGRADEABLE_LOADER_ID)
        .map(|(address, _)| address)
}

/// A decoded upgradeable-loader account header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Uninitialized,
    Buffer {
        authority: Option<Pubkey>,
    },
    Program {
        program_data: Pubkey,
    },
    ProgramData {
        slot: u64,
        upgrade_authority: Option<Pubkey>,
    },
}

impl LoaderState {
    /// Decode the header at the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the tag is unknown or the data
    /// is shorter than the header its tag requires.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        let tag = read_u32(data, 0).ok_or_else(|| format!("{} bytes is too short for a loader tag", data.len()))?;
        let need = |len: usize, what: &str| {
            if data.len() < len {
                Err(format!("{what} account needs {len} header bytes, got {}", data.len()))
            } else {
                Ok(())
            }
        };
        match tag {
            TAG_UNINITIALIZED => Ok(Self::Uninitialized),
            TAG_BUFFER => {
                need(BUFFER_HEADER_LEN, "buffer")?;
                Ok(Self::Buffer {
                    authority: read_option_pubkey(data, 4),
                })
            }
            TAG_PROGRAM => {
                need(PROGRAM_ACCOUNT_LEN, "program")?;
                let program_data = Pubkey::try_from_slice(&data[4..36])
                    .ok_or_else(|| "program account address truncated".to_string())?;
                Ok(Self::Program { program_data })
            }
            TAG_PROGRAMDATA => {
                need(PROGRAMDATA_HEADER_LEN, "program-data")?;
                let slot = read_u64(data, 4).ok_or_else(|| "program-data slot truncated".to_string())?;
                Ok(Self::ProgramData {
                    slot,
                    upgrade_authority: read_option_pubkey(data, 12),
                })
            }
            other => Err(format!("unknown upgradeable loader state tag {other}")),
        }
    }

    /// Byte offset where the executable begins, for states that hold one.
    #[must_use]
    pub fn executable_offset(&self) -> Option<usize> {
        match self {
            Self::Buffer { .. } => Some(BUFFER_HEADER_LEN),
            Self::ProgramData { .. } => Some(PROGRAMDATA_HEADER_LEN),
            Self::Uninitialized | Self::Program { .. } => None,
        }
    }
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    let bytes: [u8; 8] = data.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

fn read_option_pubkey(data: &[u8], at: usize) -> Option<Pubkey> {
    match data.get(at) {
        Some(1) => Pubkey::try_from_slice(data.get(at + 1..at + 33)?),
        _ => None,
    }
}
