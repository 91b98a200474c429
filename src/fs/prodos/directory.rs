//! ### ProDOS directory structures
//!
//! Directory blocks hold a prev/next link followed by 13 entries of 39 bytes.
//! In a key block the first entry slot is the directory header.

use binrw::{binrw,BinRead,BinWrite};
use std::io::Cursor;
use num_traits::FromPrimitive;
use log::warn;
use super::types::*;
use crate::DYNERR;

// Block   | Contents
// -----------------------------
// 0       | Loader
// 1       | Loader
// 2       | Volume Directory Key
// 3 - 5   | Volume Directory
// 6 - p   | Volume Bitmap

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct Entry {
    pub stor_len_nibs: u8,
    pub name: [u8;15],
    pub file_type: u8,
    pub key_ptr: u16,
    pub blocks_used: u16,
    pub eof: [u8;3],
    pub create_time: [u8;4],
    pub version: u8,
    pub min_version: u8,
    pub access: u8,
    pub aux_type: u16,
    pub last_mod: [u8;4],
    pub header_ptr: u16
}

/// Header of a volume or subdirectory key block.
/// For the volume, `ptr` is the bitmap pointer and `tail` the total blocks;
/// for a subdirectory, `ptr` is the parent block and `tail` the parent entry number and length.
#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct Header {
    pub stor_len_nibs: u8,
    pub name: [u8;15],
    pub reserved: [u8;8],
    pub create_time: [u8;4],
    pub version: u8,
    pub min_version: u8,
    pub access: u8,
    pub entry_len: u8,
    pub entries_per_block: u8,
    pub file_count: u16,
    pub ptr: u16,
    pub tail: [u8;2]
}

/// Fork descriptor inside an extended file's key block
#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct MiniEntry {
    pub storage_type: u8,
    pub key_block: u16,
    pub blocks_used: u16,
    pub eof: [u8;3]
}

pub fn entry_offset(slot: usize) -> usize {
    4 + slot*ENTRY_LEN
}

fn name_from(nibs: u8,fname: &[u8;15]) -> String {
    let len = (nibs & 0x0f) as usize;
    match String::from_utf8(fname[0..len].to_vec()) {
        Ok(s) => s,
        Err(_) => {
            warn!("continuing with invalid filename");
            fname[0..len].iter().map(|b| match *b { 0x20..=0x7e => *b as char, _ => '?' }).collect()
        }
    }
}

fn name_to(stype: StorageType,s: &str) -> (u8,[u8;15]) {
    let up = s.to_uppercase();
    let bytes = up.as_bytes();
    let len = usize::min(bytes.len(),15);
    let mut ans = [0;15];
    ans[0..len].copy_from_slice(&bytes[0..len]);
    (((stype as u8) << 4) + len as u8,ans)
}

pub fn eof_from(eof: &[u8;3]) -> usize {
    u32::from_le_bytes([eof[0],eof[1],eof[2],0]) as usize
}

pub fn eof_to(eof: usize) -> [u8;3] {
    let b = u32::to_le_bytes(eof as u32);
    [b[0],b[1],b[2]]
}

impl Entry {
    pub fn new(stype: StorageType,name: &str) -> Self {
        let (stor_len_nibs,name) = name_to(stype,name);
        Self {
            stor_len_nibs,
            name,
            file_type: 0,
            key_ptr: 0,
            blocks_used: 0,
            eof: [0;3],
            create_time: [0;4],
            version: 0,
            min_version: 0,
            access: STD_ACCESS,
            aux_type: 0,
            last_mod: [0;4],
            header_ptr: 0
        }
    }
    pub fn from_block(buf: &[u8],slot: usize) -> Result<Self,DYNERR> {
        let off = entry_offset(slot);
        Ok(Self::read(&mut Cursor::new(&buf[off..off+ENTRY_LEN]))?)
    }
    pub fn to_block(&self,buf: &mut [u8],slot: usize) -> Result<(),DYNERR> {
        let mut curs = Cursor::new(Vec::new());
        self.write(&mut curs)?;
        let off = entry_offset(slot);
        buf[off..off+ENTRY_LEN].copy_from_slice(&curs.into_inner());
        Ok(())
    }
    pub fn storage_type(&self) -> Option<StorageType> {
        StorageType::from_u8(self.stor_len_nibs >> 4)
    }
    pub fn set_storage_type(&mut self,stype: StorageType) {
        self.stor_len_nibs = ((stype as u8) << 4) | (self.stor_len_nibs & 0x0f);
    }
    pub fn is_active(&self) -> bool {
        self.stor_len_nibs >> 4 != 0
    }
    pub fn name(&self) -> String {
        name_from(self.stor_len_nibs,&self.name)
    }
    pub fn rename(&mut self,name: &str) {
        let stype = self.stor_len_nibs >> 4;
        let (nibs,fname) = name_to(StorageType::Inactive,name);
        self.stor_len_nibs = (stype << 4) | nibs;
        self.name = fname;
    }
    pub fn eof(&self) -> usize {
        eof_from(&self.eof)
    }
}

impl Header {
    pub fn new(stype: StorageType,name: &str) -> Self {
        let (stor_len_nibs,name) = name_to(stype,name);
        Self {
            stor_len_nibs,
            name,
            reserved: [0;8],
            create_time: pack_time(None),
            version: 0,
            min_version: 0,
            access: STD_ACCESS,
            entry_len: ENTRY_LEN as u8,
            entries_per_block: ENTRIES_PER_BLOCK as u8,
            file_count: 0,
            ptr: 0,
            tail: [0;2]
        }
    }
    pub fn from_block(buf: &[u8]) -> Result<Self,DYNERR> {
        Ok(Self::read(&mut Cursor::new(&buf[4..4+ENTRY_LEN]))?)
    }
    pub fn to_block(&self,buf: &mut [u8]) -> Result<(),DYNERR> {
        let mut curs = Cursor::new(Vec::new());
        self.write(&mut curs)?;
        buf[4..4+ENTRY_LEN].copy_from_slice(&curs.into_inner());
        Ok(())
    }
    pub fn storage_type(&self) -> Option<StorageType> {
        StorageType::from_u8(self.stor_len_nibs >> 4)
    }
    pub fn name(&self) -> String {
        name_from(self.stor_len_nibs,&self.name)
    }
    pub fn rename(&mut self,name: &str) {
        let stype = self.stor_len_nibs >> 4;
        let (nibs,fname) = name_to(StorageType::Inactive,name);
        self.stor_len_nibs = (stype << 4) | nibs;
        self.name = fname;
    }
    pub fn total_blocks(&self) -> usize {
        u16::from_le_bytes(self.tail) as usize
    }
}

impl MiniEntry {
    pub fn from_key_block(buf: &[u8],rsrc: bool) -> Result<Self,DYNERR> {
        let off = match rsrc { true => 256, false => 0 };
        Ok(Self::read(&mut Cursor::new(&buf[off..off+8]))?)
    }
    pub fn to_key_block(&self,buf: &mut [u8],rsrc: bool) -> Result<(),DYNERR> {
        let mut curs = Cursor::new(Vec::new());
        self.write(&mut curs)?;
        let off = match rsrc { true => 256, false => 0 };
        buf[off..off+8].copy_from_slice(&curs.into_inner());
        Ok(())
    }
    pub fn storage_type(&self) -> Option<StorageType> {
        StorageType::from_u8(self.storage_type)
    }
    pub fn eof(&self) -> usize {
        eof_from(&self.eof)
    }
}

pub fn links(buf: &[u8]) -> (usize,usize) {
    (u16::from_le_bytes([buf[0],buf[1]]) as usize,u16::from_le_bytes([buf[2],buf[3]]) as usize)
}

pub fn set_links(buf: &mut [u8],prev: usize,next: usize) {
    buf[0..2].copy_from_slice(&u16::to_le_bytes(prev as u16));
    buf[2..4].copy_from_slice(&u16::to_le_bytes(next as u16));
}

#[test]
fn entry_layout() {
    let mut buf = vec![0;BLOCK_SIZE];
    let mut ent = Entry::new(StorageType::Sapling,"hello");
    ent.key_ptr = 0x123;
    ent.eof = eof_to(70000);
    ent.to_block(&mut buf,1).unwrap();
    assert_eq!(buf[entry_offset(1)],0x25);
    assert_eq!(&buf[entry_offset(1)+1..entry_offset(1)+6],b"HELLO");
    assert_eq!(buf[entry_offset(1)+0x11],0x23);
    let back = Entry::from_block(&buf,1).unwrap();
    assert_eq!(back.name(),"HELLO");
    assert_eq!(back.eof(),70000);
    assert_eq!(back.storage_type(),Some(StorageType::Sapling));
}
