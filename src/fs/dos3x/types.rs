pub const VTOC_TRACK: usize = 17;
/// tracks covered by the 200 byte VTOC bitmap
pub const MAX_TRACKS: usize = 50;
/// bound on the catalog chain
pub const MAX_CATALOG_SECTORS: usize = 64;
/// bound on a track/sector list chain
pub const MAX_TSLIST_REPS: usize = 1000;
pub const PAIRS_PER_LIST: usize = 122;
pub const ENTRIES_PER_SECTOR: usize = 7;
pub const DELETED: u8 = 0xff;
pub const LOCKED: u8 = 0x80;

/// Enumerates DOS errors.  The `Display` trait will print equivalent DOS message such as `FILE LOCKED`.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("RANGE ERROR")]
    Range,
    #[error("I/O ERROR")]
    IOError,
    #[error("FILE LOCKED")]
    FileLocked,
    #[error("FILE TYPE MISMATCH")]
    FileTypeMismatch,
    #[error("SYNTAX ERROR")]
    SyntaxError
}

/// DOS type bits and the ProDOS types they are shown as
const TYPE_MAP: [(u8,u32,char);8] = [
    (0x00, 0x04, 'T'),
    (0x01, 0xfa, 'I'),
    (0x02, 0xfc, 'A'),
    (0x04, 0x06, 'B'),
    (0x08, 0xf2, 'S'),
    (0x10, 0xfe, 'R'),
    (0x20, 0xf3, 'a'),
    (0x40, 0xf4, 'b')
];

/// ProDOS type for the DOS type byte, lock bit ignored
pub fn prodos_type(dos_type: u8) -> u32 {
    let t = dos_type & 0x7f;
    match TYPE_MAP.iter().find(|(d,_,_)| *d==t) {
        Some((_,p,_)) => *p,
        None => 0x06
    }
}

pub fn dos_type(prodos_type: u32) -> Option<u8> {
    TYPE_MAP.iter().find(|(_,p,_)| *p==prodos_type).map(|(d,_,_)| *d)
}

pub fn type_letter(dos_type: u8) -> char {
    let t = dos_type & 0x7f;
    match TYPE_MAP.iter().find(|(d,_,_)| *d==t) {
        Some((_,_,c)) => *c,
        None => '?'
    }
}

/// DOS names are negative ASCII padded with spaces
pub fn file_name_to_string(fname: &[u8;30]) -> String {
    let s: String = fname.iter().map(|b| match b & 0x7f {
        c if c >= 0x20 && c < 0x7f => c as char,
        _ => '?'
    }).collect();
    s.trim_end().to_string()
}

pub fn string_to_file_name(s: &str) -> [u8;30] {
    let mut ans = [0xa0;30];
    for (i,c) in s.to_uppercase().bytes().take(30).enumerate() {
        ans[i] = c | 0x80;
    }
    ans
}

pub fn is_name_valid(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() > 0 && bytes.len() <= 30 && bytes[0].is_ascii_alphabetic()
        && bytes.iter().all(|c| *c >= 0x20 && *c < 0x7f && *c != b',')
}

#[test]
fn names_and_types() {
    let fname = string_to_file_name("hello world");
    assert_eq!(fname[0],0xc8);
    assert_eq!(fname[29],0xa0);
    assert_eq!(file_name_to_string(&fname),"HELLO WORLD");
    assert!(is_name_valid("HELLO, WORLD")==false);
    assert!(is_name_valid("A"));
    assert_eq!(prodos_type(0x84),0x06);
    assert_eq!(dos_type(0xfc),Some(0x02));
    assert_eq!(type_letter(0x82),'A');
}
