/// Faults specific to FAT volumes
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("first cluster invalid")]
    FirstClusterInvalid
}

pub const DIR_ENTRY_SIZE: usize = 32;
/// name byte 0 of a deleted entry
pub const FREE: u8 = 0xe5;
/// name byte 0 of the entry that ends the directory
pub const FREE_AND_NO_MORE: u8 = 0x00;

// attribute bits
pub const READ_ONLY: u8 = 0x01;
pub const HIDDEN: u8 = 0x02;
pub const SYSTEM: u8 = 0x04;
pub const VOLUME_ID: u8 = 0x08;
pub const DIRECTORY: u8 = 0x10;
pub const ARCHIVE: u8 = 0x20;
/// all four low bits, marks a VFAT long name fragment
pub const LONG_NAME: u8 = 0x0f;

/// characters never found in an 8.3 name
pub const INVALID_CHARS: &str = "\"*+,/:;<=>?[\\]|";

/// Subdirectories nested deeper than this are not visited
pub const MAX_DIR_DEPTH: usize = 16;
