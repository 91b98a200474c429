//! ### FAT directory structures
//!
//! This module encapsulates the FAT directory.  The FAT itself is implemented in
//! `crate::bios::fat`.  The BPB is in `crate::bios::bpb`.

use binrw::{binrw,BinRead};
use std::io::Cursor;
use log::trace;
use super::types::*;

#[derive(PartialEq,Eq,Debug)]
pub enum EntryType {
    Free,
    FreeAndNoMore,
    File,
    Directory,
    VolumeLabel,
    LongName
}

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct Entry {
    pub name: [u8;8],
    pub ext: [u8;3],
    /// RO=1,hidden=2,sys=4,vol=8,dir=16,archive=32,long_name=15.
    /// If this is the volume label, cluster1=0.
    /// If this is a directory, file_size=0.
    pub attr: u8,
    nt_res: u8,
    /// tenths of a second
    pub creation_tenth: u8,
    /// to the nearest 2 secs
    pub creation_time: u16,
    pub creation_date: u16,
    pub access_date: u16,
    pub cluster1_high: u16,
    pub write_time: u16,
    pub write_date: u16,
    pub cluster1_low: u16,
    pub file_size: u32
}

pub fn unpack_date(date16: u16) -> Option<chrono::NaiveDate> {
    if date16==0 {
        return None;
    }
    let year = 1980 + (date16 >> 9) as i32;
    let month = ((date16 & 0b0000_0001_1110_0000) >> 5) as u32;
    let day = (date16 & 0b1_1111) as u32;
    chrono::NaiveDate::from_ymd_opt(year,month,day)
}

pub fn unpack_time(time16: u16,tenths: u8) -> Option<chrono::NaiveTime> {
    let hour = (time16 >> 11) as u32;
    let min = ((time16 & 0b0000_0111_1110_0000) >> 5) as u32;
    let sec2 = (time16 & 0b1_1111) as u32;
    chrono::NaiveTime::from_hms_opt(hour,min,sec2*2 + tenths as u32/100)
}

fn field_to_string(field: &[u8]) -> String {
    field.iter().map(|c| match *c {
        x if x.is_ascii_graphic() || x==b' ' => x as char,
        _ => '?'
    }).collect::<String>().trim_end().to_string()
}

impl Entry {
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        Self::read(&mut Cursor::new(buf)).ok()
    }
    pub fn kind(&self) -> EntryType {
        trace!("entry has name[0] {} and attr {}",self.name[0],self.attr);
        match (self.name[0],self.attr) {
            (FREE,_) => EntryType::Free,
            (FREE_AND_NO_MORE,_) => EntryType::FreeAndNoMore,
            (_,a) if a & LONG_NAME == LONG_NAME => EntryType::LongName,
            (_,a) if a & VOLUME_ID > 0 => EntryType::VolumeLabel,
            (_,a) if a & DIRECTORY > 0 => EntryType::Directory,
            _ => EntryType::File
        }
    }
    /// `.` or `..`
    pub fn is_dot(&self) -> bool {
        self.name[0]==b'.'
    }
    /// name with the extension joined by a dot, the dot is omitted when there is no extension
    pub fn name(&self) -> String {
        let mut base = self.name;
        // 0x05 stands for a leading 0xe5
        if base[0]==0x05 {
            base[0] = FREE;
        }
        let base = field_to_string(&base);
        let ext = field_to_string(&self.ext);
        match ext.len() {
            0 => base,
            _ => [base,".".to_string(),ext].concat()
        }
    }
    /// label entries do not use the dot
    pub fn label(&self) -> String {
        field_to_string(&[self.name.as_slice(),self.ext.as_slice()].concat())
    }
    pub fn ext(&self) -> [u8;3] {
        self.ext
    }
    pub fn is_name_valid(&self) -> bool {
        let name = self.name();
        !name.starts_with(' ') && name.chars().all(|c| c!='?' && !INVALID_CHARS.contains(c))
    }
    pub fn get_attr(&self,mask: u8) -> bool {
        (self.attr & mask) > 0
    }
    pub fn cluster1(&self) -> u32 {
        self.cluster1_low as u32 + ((self.cluster1_high as u32) << 16)
    }
    pub fn eof(&self) -> usize {
        self.file_size as usize
    }
    pub fn created(&self) -> Option<chrono::NaiveDateTime> {
        Some(unpack_date(self.creation_date)?.and_time(unpack_time(self.creation_time,self.creation_tenth)?))
    }
    pub fn modified(&self) -> Option<chrono::NaiveDateTime> {
        Some(unpack_date(self.write_date)?.and_time(unpack_time(self.write_time,0)?))
    }
}

/// Split a directory buffer into entries, stopping at the end marker
pub fn entries(buf: &[u8]) -> Vec<(usize,Entry)> {
    let mut ans = Vec::new();
    for (i,chunk) in buf.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
        let entry = match Entry::from_bytes(chunk) {
            Some(e) => e,
            None => break
        };
        match entry.kind() {
            EntryType::FreeAndNoMore => break,
            EntryType::Free | EntryType::LongName => continue,
            _ => ans.push((i,entry))
        }
    }
    ans
}

#[cfg(test)]
pub fn raw_entry(name: &[u8;11],attr: u8,cluster1: u16,size: u32) -> Vec<u8> {
    let mut ans = vec![0;DIR_ENTRY_SIZE];
    ans[0..11].copy_from_slice(name);
    ans[11] = attr;
    // 1995-06-15 10:30:20
    ans[14..16].copy_from_slice(&((10u16 << 11) | (30 << 5) | 10).to_le_bytes());
    ans[16..18].copy_from_slice(&((15u16 << 9) | (6 << 5) | 15).to_le_bytes());
    ans[22..24].copy_from_slice(&((10u16 << 11) | (30 << 5) | 10).to_le_bytes());
    ans[24..26].copy_from_slice(&((15u16 << 9) | (6 << 5) | 15).to_le_bytes());
    ans[26..28].copy_from_slice(&cluster1.to_le_bytes());
    ans[28..32].copy_from_slice(&size.to_le_bytes());
    ans
}

#[test]
fn entry_fields() {
    let buf = [
        raw_entry(b"MYDISK     ",VOLUME_ID,0,0),
        raw_entry(b"HELLO   TXT",ARCHIVE|READ_ONLY,2,600),
        vec![FREE;DIR_ENTRY_SIZE],
        raw_entry(b"DOCS       ",DIRECTORY,4,0),
        vec![0;DIR_ENTRY_SIZE],
        raw_entry(b"HIDDEN  TXT",0,9,1)
    ].concat();
    let list = entries(&buf);
    assert_eq!(list.len(),3);
    assert_eq!(list[0].1.kind(),EntryType::VolumeLabel);
    assert_eq!(list[0].1.label(),"MYDISK");
    assert_eq!(list[1].1.name(),"HELLO.TXT");
    assert!(list[1].1.get_attr(READ_ONLY));
    assert_eq!(list[1].1.cluster1(),2);
    assert_eq!(list[1].1.eof(),600);
    let t = chrono::NaiveDate::from_ymd_opt(1995,6,15).and_then(|d| d.and_hms_opt(10,30,20));
    assert_eq!(list[1].1.modified(),t);
    assert_eq!(list[2].0,3);
    assert_eq!(list[2].1.name(),"DOCS");
    assert_eq!(list[2].1.kind(),EntryType::Directory);
}
