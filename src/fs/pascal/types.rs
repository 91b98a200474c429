use chrono::Datelike;

pub const BLOCK_SIZE: usize = 512;
pub const VOL_HEADER_BLOCK: usize = 2;
/// block after the standard directory
pub const DIR_END_BLOCK: usize = 6;
pub const ENTRY_SIZE: usize = 26;
pub const MAX_DIR_END: usize = 20;
pub const INVALID_CHARS: &str = " $=?,[#:";

/// Enumerates Pascal errors.  The `Display` trait will print the long message.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("illegal operation")]
    BadMode,
    #[error("illegal filename")]
    BadTitle,
    #[error("insufficient space")]
    NoRoom,
    #[error("no file")]
    NoFile,
    #[error("error reading real or integer")]
    BadFormat
}

/// Pascal type codes and the ProDOS types they are shown as
const TYPE_MAP: [(u16,u32);9] = [
    (0x00, 0x00),
    (0x01, 0x01),
    (0x02, 0x02),
    (0x03, 0x03),
    (0x04, 0x00),
    (0x05, 0x05),
    (0x06, 0x00),
    (0x07, 0x00),
    (0x08, 0x00)
];

/// Pascal type names, index is the type code
const TYPE_NAMES: [&str;9] = ["NONE","BAD","CODE","TEXT","INFO","DATA","GRAF","FOTO","SECURE"];

pub fn prodos_type(pascal_type: u16) -> u32 {
    match TYPE_MAP.iter().find(|(p,_)| *p==pascal_type) {
        Some((_,t)) => *t,
        None => 0
    }
}

/// Pascal type for a ProDOS type, text and binary are accepted as well
pub fn pascal_type(prodos_type: u32) -> Option<u16> {
    match prodos_type {
        0x04 => Some(0x03),
        0x06 => Some(0x05),
        0x00 => None,
        t => TYPE_MAP.iter().find(|(_,p)| *p==t).map(|(c,_)| *c)
    }
}

pub fn type_name(pascal_type: u16) -> &'static str {
    TYPE_NAMES.get(pascal_type as usize).copied().unwrap_or("????")
}

pub fn pack_date(time: Option<chrono::NaiveDateTime>) -> [u8;2] {
    let now = match time {
        Some(t) => t,
        _ => chrono::Local::now().naive_local()
    };
    let (_is_common_era,year) = now.year_ce();
    let packed_date = (now.month() + (now.day() << 4) + ((year%100) << 9)) as u16;
    u16::to_le_bytes(packed_date)
}

pub fn unpack_date(pascal_date: [u8;2]) -> Option<chrono::NaiveDateTime> {
    let date = u16::from_le_bytes(pascal_date);
    let yy = date >> 9;
    let year = match yy < 40 {
        true => 2000 + yy,
        false => 1900 + yy
    };
    let month = date & 15;
    let day = (date >> 4) & 31;
    chrono::NaiveDate::from_ymd_opt(year as i32,month as u32,day as u32).and_then(|d| d.and_hms_opt(0,0,0))
}

/// This will accept lower case, names are stored upper case
pub fn is_name_valid(s: &str,is_vol: bool) -> bool {
    let max = match is_vol { true => 7, false => 15 };
    s.len() > 0 && s.len() <= max && s.chars().all(|c| c.is_ascii() && !c.is_ascii_control() && !INVALID_CHARS.contains(c))
}

#[test]
fn dates_and_names() {
    let t = chrono::NaiveDate::from_ymd_opt(1984,7,4).and_then(|d| d.and_hms_opt(0,0,0));
    let packed = pack_date(t);
    assert_eq!(u16::from_le_bytes(packed),7 + (4 << 4) + (84 << 9));
    assert_eq!(unpack_date(packed),t);
    assert_eq!(unpack_date([0,0]),None);
    assert!(is_name_valid("SYSTEM.PASCAL",false));
    assert!(!is_name_valid("SYSTEM.PASCAL",true));
    assert!(!is_name_valid("A:B",false));
    assert_eq!(type_name(2),"CODE");
    assert_eq!(pascal_type(0x06),Some(5));
    assert_eq!(prodos_type(7),0);
}
