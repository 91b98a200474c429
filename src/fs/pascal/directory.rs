//! # Pascal directory elements
//! The directory is the header followed immediately by packed entries.
//! Entries are allowed to cross block boundaries, so the whole directory is handled as one buffer.

use binrw::{binrw,BinRead,BinWrite};
use std::io::Cursor;
use super::types::*;
use crate::DYNERR;

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct VolDirHeader {
    pub begin_block: u16,
    pub end_block: u16,
    pub file_type: u16,
    pub name_len: u8,
    pub name: [u8;7],
    pub total_blocks: u16,
    pub num_files: u16,
    pub last_access_date: u16,
    pub last_set_date: [u8;2],
    pub pad: [u8;4]
}

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct DirectoryEntry {
    pub begin_block: u16,
    pub end_block: u16,
    pub file_type: u16,
    pub name_len: u8,
    pub name: [u8;15],
    /// bytes used in the last block
    pub last_byte: u16,
    pub mod_date: [u8;2]
}

pub struct Directory {
    pub header: VolDirHeader,
    /// active entries in block order
    pub entries: Vec<DirectoryEntry>,
    /// room for this many entries
    pub capacity: usize
}

fn name_from(len: u8,name: &[u8]) -> String {
    let len = usize::min(len as usize,name.len());
    name[0..len].iter().map(|b| match *b { 0x20..=0x7e => *b as char, _ => '?' }).collect::<String>().trim_end().to_string()
}

fn name_to<const N: usize>(s: &str) -> (u8,[u8;N]) {
    let up = s.to_uppercase();
    let bytes = up.as_bytes();
    let len = usize::min(bytes.len(),N);
    let mut ans = [0;N];
    ans[0..len].copy_from_slice(&bytes[0..len]);
    (len as u8,ans)
}

impl VolDirHeader {
    pub fn new(vol_name: &str,total_blocks: usize) -> Self {
        let (name_len,name) = name_to::<7>(vol_name);
        Self {
            begin_block: 0,
            end_block: DIR_END_BLOCK as u16,
            file_type: 0,
            name_len,
            name,
            total_blocks: total_blocks as u16,
            num_files: 0,
            last_access_date: 0,
            last_set_date: pack_date(None),
            pad: [0;4]
        }
    }
    pub fn name(&self) -> String {
        name_from(self.name_len,&self.name)
    }
}

impl DirectoryEntry {
    pub fn new(name: &str) -> Self {
        let (name_len,name) = name_to::<15>(name);
        Self { begin_block: 0, end_block: 0, file_type: 0, name_len, name, last_byte: 0, mod_date: pack_date(None) }
    }
    pub fn name(&self) -> String {
        name_from(self.name_len,&self.name)
    }
    pub fn rename(&mut self,name: &str) {
        let (name_len,name) = name_to::<15>(name);
        self.name_len = name_len;
        self.name = name;
    }
    pub fn blocks(&self) -> usize {
        (self.end_block as usize).saturating_sub(self.begin_block as usize)
    }
    pub fn eof(&self) -> usize {
        match self.blocks() {
            0 => 0,
            n => (n-1)*BLOCK_SIZE + usize::min(self.last_byte as usize,BLOCK_SIZE)
        }
    }
}

impl Directory {
    /// Parse the directory from the contiguous directory blocks
    pub fn from_bytes(buf: &[u8]) -> Result<Self,DYNERR> {
        let header = VolDirHeader::read(&mut Cursor::new(&buf[0..ENTRY_SIZE]))?;
        let capacity = buf.len()/ENTRY_SIZE - 1;
        let mut entries = Vec::new();
        for i in 0..usize::min(header.num_files as usize,capacity) {
            let off = (i+1)*ENTRY_SIZE;
            entries.push(DirectoryEntry::read(&mut Cursor::new(&buf[off..off+ENTRY_SIZE]))?);
        }
        Ok(Self { header, entries, capacity })
    }
    /// Flatten, unused entry space is zeroed
    pub fn to_bytes(&self) -> Result<Vec<u8>,DYNERR> {
        let mut curs = Cursor::new(Vec::new());
        self.header.write(&mut curs)?;
        for entry in &self.entries {
            entry.write(&mut curs)?;
        }
        let mut ans = curs.into_inner();
        ans.resize((self.capacity+1)*ENTRY_SIZE,0);
        Ok(ans)
    }
}

#[test]
fn layout() {
    let mut buf = vec![0;4*BLOCK_SIZE];
    let mut hdr = VolDirHeader::new("blank",280);
    hdr.num_files = 1;
    let mut dir = Directory { header: hdr, entries: vec![DirectoryEntry::new("hello.text")], capacity: 77 };
    dir.entries[0].begin_block = 6;
    dir.entries[0].end_block = 10;
    dir.entries[0].last_byte = 512;
    let bytes = dir.to_bytes().unwrap();
    assert_eq!(bytes.len(),78*ENTRY_SIZE);
    buf[0..bytes.len()].copy_from_slice(&bytes);
    assert_eq!(buf[6],5);
    assert_eq!(&buf[7..12],b"BLANK");
    assert_eq!(buf[ENTRY_SIZE],6);
    let back = Directory::from_bytes(&buf).unwrap();
    assert_eq!(back.header.name(),"BLANK");
    assert_eq!(back.entries[0].name(),"HELLO.TEXT");
    assert_eq!(back.entries[0].eof(),2048);
}
