//! ### CP/M directory structures
//!
//! The directory is a packed sequence of 32-byte entries.  The primary type of entry is the
//! "extent," which lists up to 16 blocks of one file.  There is no separate file index or
//! volume bitmap, so everything about allocation comes from the extents.

use binrw::{binrw,BinRead};
use std::io::Cursor;
use super::types::*;
use crate::DYNERR;

/// The extent is in general a partial directory entry.  The bigger the
/// file gets the more extents are needed to point to all the blocks.
#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct Extent {
    /// 0-15 is a file's user number, see `extent_type` for the rest
    pub user: u8,
    pub name: [u8;8],
    /// high bits are read only, system, archived
    pub typ: [u8;3],
    /// low 5 bits of the extent index
    pub ex: u8,
    /// bytes used in the last record, 0 means the record is full
    pub s1: u8,
    /// high 6 bits of the extent index
    pub s2: u8,
    /// records used in the last logical extent
    pub rc: u8,
    pub blocks: [u8;BLOCKS_PER_EXTENT]
}

impl Extent {
    pub fn from_bytes(buf: &[u8]) -> Result<Self,DYNERR> {
        Ok(Self::read(&mut Cursor::new(buf))?)
    }
    pub fn kind(&self) -> ExtentType {
        extent_type(self.user)
    }
    /// Count of logical extents before this one
    pub fn index(&self) -> usize {
        (self.ex & 0x1f) as usize + (((self.s2 & 0x3f) as usize) << 5)
    }
    pub fn name(&self) -> String {
        file_name_to_string(&self.name,&self.typ)
    }
    pub fn is_read_only(&self) -> bool {
        self.typ[0] & 0x80 != 0
    }
    pub fn is_system(&self) -> bool {
        self.typ[1] & 0x80 != 0
    }
    /// allocated block pointers, in order, 0 is an unallocated slot
    pub fn block_list(&self) -> Vec<usize> {
        self.blocks.iter().map(|b| *b as usize).collect()
    }
    /// The eof in bytes, *assuming* this is the last extent.
    pub fn eof_if_last(&self) -> usize {
        let rc = usize::min(self.rc as usize,LOGICAL_EXTENT_SIZE/RECORD_SIZE);
        let tail = match (rc,self.s1) {
            (0,_) => 0,
            (r,0) => r*RECORD_SIZE,
            (r,b) => (r-1)*RECORD_SIZE + usize::min(b as usize,RECORD_SIZE)
        };
        self.index()*LOGICAL_EXTENT_SIZE + tail
    }
    /// Reason this entry cannot be on a CP/M disk, if any
    pub fn problem(&self) -> Option<&'static str> {
        match self.kind() {
            ExtentType::Unknown => Some("bad status byte"),
            ExtentType::File => {
                if !is_field_valid(&self.name,false) || !is_field_valid(&self.typ,true) {
                    return Some("bad file name");
                }
                if self.rc > 0x80 {
                    return Some("record count out of range");
                }
                match self.block_list().iter().any(|b| *b!=0 && (*b < DIR_BLOCKS || *b >= TOTAL_BLOCKS)) {
                    true => Some("block pointer out of range"),
                    false => None
                }
            },
            _ => None
        }
    }
}

/// Split a directory buffer into extents
pub fn extents_from_bytes(buf: &[u8]) -> Result<Vec<Extent>,DYNERR> {
    let mut ans = Vec::new();
    for chunk in buf.chunks_exact(DIR_ENTRY_SIZE) {
        ans.push(Extent::from_bytes(chunk)?);
    }
    Ok(ans)
}

#[test]
fn extent_fields() {
    let mut buf = vec![0;DIR_ENTRY_SIZE];
    buf[0] = 1;
    buf[1..9].copy_from_slice(b"BIG     ");
    buf[9..12].copy_from_slice(b"DAT");
    buf[12] = 2;
    buf[15] = 0x10;
    buf[16] = 40;
    let x = Extent::from_bytes(&buf).unwrap();
    assert_eq!(x.index(),2);
    assert_eq!(x.name(),"BIG.DAT");
    assert_eq!(x.eof_if_last(),2*16384 + 16*128);
    assert_eq!(x.problem(),None);
    buf[17] = 200;
    assert_eq!(Extent::from_bytes(&buf).unwrap().problem(),Some("block pointer out of range"));
}
