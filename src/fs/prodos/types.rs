use num_derive::FromPrimitive;
use thiserror::Error;
use chrono::{Datelike,Timelike};

pub const BLOCK_SIZE: usize = 512;
pub const VOL_KEY_BLOCK: usize = 2;
pub const VOL_DIR_BLOCKS: usize = 4;
pub const ENTRY_LEN: usize = 0x27;
pub const ENTRIES_PER_BLOCK: usize = 0x0d;
pub const STD_ACCESS: u8 = 1+2+32+64+128;
pub const MAX_BLOCKS: usize = 65535;
/// bound on the directory blocks visited in one walk
pub const MAX_DIR_BLOCKS: usize = 4096;
/// first byte of the reserved area of a subdirectory header
pub const SUBDIR_MAGIC: u8 = 0x75;

/// ProDOS MLI errors, displayed the way BASIC.SYSTEM reports them.
/// The discriminant is the BASIC.SYSTEM error number.
#[derive(Error,Debug)]
pub enum Error {
    #[error("RANGE ERROR")]
    Range = 2,
    #[error("PATH NOT FOUND")]
    PathNotFound = 6,
    #[error("I/O ERROR")]
    IOError = 8,
    #[error("DISK FULL")]
    DiskFull = 9,
    #[error("FILE LOCKED")]
    FileLocked = 10,
    #[error("DIRECTORY FULL")]
    DirectoryFull = 17
}

/// High nibble of the first byte of every directory entry
#[derive(Clone,Copy,FromPrimitive,PartialEq,Debug)]
pub enum StorageType {
    Inactive = 0x00,
    Seedling = 0x01,
    Sapling = 0x02,
    Tree = 0x03,
    /// Pascal area on a ProFile
    Pascal = 0x04,
    /// data and resource forks, key block is the extended key block
    Extended = 0x05,
    SubDirEntry = 0x0d,
    SubDirHeader = 0x0e,
    VolDirHeader = 0x0f
}

/// Bits of the access byte
#[derive(Clone,Copy,FromPrimitive)]
pub enum Access {
    Read = 0x01,
    Write = 0x02,
    Backup = 0x20,
    Rename = 0x40,
    Destroy = 0x80
}

/// Pack a timestamp as date word then time word, both little endian.
/// Without a timestamp the local time is used.
pub fn pack_time(time: Option<chrono::NaiveDateTime>) -> [u8;4] {
    let t = time.unwrap_or_else(|| chrono::Local::now().naive_local());
    let yy = (t.year().rem_euclid(100)) as u16;
    let date = t.day() as u16 | (t.month() as u16) << 5 | yy << 9;
    let hm = t.minute() as u16 | (t.hour() as u16) << 8;
    let [d0,d1] = date.to_le_bytes();
    let [t0,t1] = hm.to_le_bytes();
    [d0,d1,t0,t1]
}

/// Unpack a timestamp, `None` if the date is not a calendar date.
/// Two digit years below 79 are taken to be in the 2000s.
pub fn unpack_time(packed: [u8;4]) -> Option<chrono::NaiveDateTime> {
    let date = u16::from_le_bytes([packed[0],packed[1]]);
    let hm = u16::from_le_bytes([packed[2],packed[3]]);
    let yy = (date >> 9) as i32;
    let year = match yy {
        y if y < 79 => 2000 + y,
        y => 1900 + y
    };
    chrono::NaiveDate::from_ymd_opt(year,((date >> 5) & 0x0f) as u32,(date & 0x1f) as u32)?
        .and_hms_opt((hm >> 8) as u32,(hm & 0xff) as u32,0)
}

/// Letter first, then up to 14 letters, digits, or periods; case is ignored.
pub fn is_name_valid(s: &str) -> bool {
    regex::Regex::new(r"^[A-Za-z][A-Za-z0-9.]{0,14}$").map_or(false,|patt| patt.is_match(s))
}

#[test]
fn date_packing() {
    let t = chrono::NaiveDate::from_ymd_opt(1986,9,15).and_then(|d| d.and_hms_opt(13,45,0));
    let packed = pack_time(t);
    assert_eq!(u16::from_le_bytes([packed[0],packed[1]]),15 + (9 << 5) + (86 << 9));
    assert_eq!(unpack_time(packed),t);
    let later = chrono::NaiveDate::from_ymd_opt(2024,1,2).and_then(|d| d.and_hms_opt(0,5,0));
    assert_eq!(unpack_time(pack_time(later)),later);
    assert_eq!(unpack_time([0,0,0,0]),None);
}

#[test]
fn names() {
    assert!(is_name_valid("HELLO.WORLD"));
    assert!(is_name_valid("basic.system"));
    assert!(!is_name_valid("1ABC"));
    assert!(!is_name_valid("ABCDEFGHIJKLMNOP"));
    assert!(!is_name_valid("A B"));
}
