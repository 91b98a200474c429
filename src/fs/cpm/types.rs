//! ## CP/M constants and name handling
//!
//! Geometry constants describe CP/M 2.2 on a 5.25 inch Apple disk, which
//! is the only layout mounted here.

/// Status byte for a deleted file, also fill value for unused blocks.
pub const DELETED: u8 = 0xe5;
/// Status byte for a label
pub const LABEL: u8 = 0x20;
/// Status byte for a timestamp
pub const TIMESTAMP: u8 = 0x21;
/// Largest possible user number plus one
pub const USER_END: u8 = 0x10;
/// Password entries use the user number plus this
pub const PASSWORD_BASE: u8 = 0x10;
/// Unit of data transfer in bytes as seen by the CP/M BDOS.
pub const RECORD_SIZE: usize = 128;
/// Size of the directory entry in bytes, always 32
pub const DIR_ENTRY_SIZE: usize = 32;
/// Data addressed by one logical extent
pub const LOGICAL_EXTENT_SIZE: usize = 16384;
/// Characters forbidden from file names, space is only allowed as padding
pub const INVALID_CHARS: &str = "<>.,;:=?*[]";

/// Tracks before the directory, holding the CP/M system
pub const RESERVED_TRACKS: usize = 3;
/// Allocation block in bytes
pub const BLOCK_SIZE: usize = 1024;
pub const SECTORS_PER_BLOCK: usize = 4;
/// Blocks set aside for the directory, starting at block 0
pub const DIR_BLOCKS: usize = 2;
pub const DIR_ENTRIES: usize = 64;
/// Blocks on the volume, counting the directory
pub const TOTAL_BLOCKS: usize = 128;
/// Block pointers in an extent, one byte each since there are fewer than 256 blocks
pub const BLOCKS_PER_EXTENT: usize = 16;

/// Enumerates CP/M errors.  The `Display` trait will print the long message.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("bad data format")]
    BadFormat,
    #[error("cannot read")]
    ReadError
}

#[derive(PartialEq,Eq,Clone,Copy,Debug)]
pub enum ExtentType {
    File,
    Label,
    Password,
    Timestamp,
    Deleted,
    Unknown
}

pub fn extent_type(user: u8) -> ExtentType {
    match user {
        u if u < USER_END => ExtentType::File,
        u if u < PASSWORD_BASE + USER_END => ExtentType::Password,
        LABEL => ExtentType::Label,
        TIMESTAMP => ExtentType::Timestamp,
        DELETED => ExtentType::Deleted,
        _ => ExtentType::Unknown
    }
}

/// Name bytes must be printable ASCII once the attribute bit is stripped,
/// with spaces allowed only as trailing padding.
pub fn is_field_valid(field: &[u8],allow_empty: bool) -> bool {
    let chars: Vec<u8> = field.iter().map(|b| b & 0x7f).collect();
    let len = chars.iter().rposition(|c| *c != 0x20).map(|p| p + 1).unwrap_or(0);
    if len==0 {
        return allow_empty;
    }
    for c in &chars[0..len] {
        if *c <= 0x20 || *c > 0x7e || INVALID_CHARS.contains(*c as char) {
            return false;
        }
    }
    true
}

fn field_to_string(field: &[u8]) -> String {
    field.iter().map(|b| (b & 0x7f) as char).collect::<String>().trim_end().to_string()
}

/// Convert name and type fields to `NAME.TYP`, the attribute bits are not part of the name
pub fn file_name_to_string(name: &[u8;8],typ: &[u8;3]) -> String {
    let base = field_to_string(name);
    let ext = field_to_string(typ);
    match ext.len() {
        0 => base,
        _ => [base.as_str(),".",ext.as_str()].concat()
    }
}

/// User 0 files are listed by name, other users get a `n:` prefix
pub fn user_path(user: u8,name: &str) -> String {
    match user {
        0 => name.to_string(),
        u => format!("{}:{}",u,name)
    }
}

/// ProDOS type suggested by the CP/M file type
pub fn prodos_type(typ: &[u8;3]) -> u32 {
    match field_to_string(typ).as_str() {
        "COM" => 0xf0,
        "TXT" | "DOC" | "ASM" | "MAC" | "PRN" | "BAS" => 0x04,
        _ => 0x00
    }
}

#[test]
fn names() {
    assert_eq!(file_name_to_string(b"HELLO   ",&[b'C'|0x80,b'O',b'M']),"HELLO.COM");
    assert_eq!(file_name_to_string(b"README  ",b"   "),"README");
    assert_eq!(user_path(3,"A.B"),"3:A.B");
    assert!(is_field_valid(b"STAT    ",false));
    assert!(!is_field_valid(b"ST T    ",false));
    assert!(!is_field_valid(&[0;8],false));
    assert!(!is_field_valid(b"A.B     ",false));
    assert!(is_field_valid(b"   ",true));
    assert_eq!(extent_type(0xe5),ExtentType::Deleted);
    assert_eq!(extent_type(0x13),ExtentType::Password);
    assert_eq!(extent_type(0x41),ExtentType::Unknown);
}
