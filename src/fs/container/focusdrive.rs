//! ### FocusDrive
//!
//! Partition table from Parsons Engineering, starts at block 0 with the text
//! `Parsons Engin.` and lists up to 30 partitions with their names.

use binrw::{binrw,BinRead};
use std::io::Cursor;
use log::debug;
use super::Partition;
use crate::fs::Leniency;
use crate::img::DiskImg;
use crate::DYNERR;

pub const SIGNATURE: &[u8;14] = b"Parsons Engin.";
const MAX_PARTS: usize = 30;
const MAP_BLOCKS: usize = 3;

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct Entry {
    pub start: u32,
    pub count: u32,
    unknown: [u32;2],
    pub name: [u8;32]
}

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct PartitionMap {
    pub signature: [u8;14],
    unknown1: u8,
    pub part_count: u8,
    unknown2: [u8;16],
    pub entries: [Entry;MAX_PARTS]
}

fn read_map(img: &DiskImg) -> Option<PartitionMap> {
    let mut buf = Vec::new();
    for b in 0..MAP_BLOCKS {
        buf.append(&mut img.read_block(b).ok()?);
    }
    PartitionMap::read(&mut Cursor::new(&buf)).ok()
}

fn entry_name(e: &Entry,i: usize) -> String {
    let end = e.name.iter().position(|b| *b==0).unwrap_or(e.name.len());
    let name: String = e.name[0..end].iter().map(|b| (*b & 0x7f) as char).collect();
    match name.trim().len() {
        0 => format!("FocusDrive {}",i+1),
        _ => name.trim().to_string()
    }
}

pub fn test(img: &DiskImg,leniency: Leniency) -> bool {
    let map = match read_map(img) {
        Some(m) if &m.signature==SIGNATURE => m,
        _ => return false
    };
    let count = map.part_count as usize;
    if count==0 || count > MAX_PARTS {
        debug!("FocusDrive partition count {}",count);
        return false;
    }
    if leniency==Leniency::Lenient {
        return true;
    }
    map.entries[0..count].iter().all(|e| e.start as usize >= MAP_BLOCKS && e.start as usize + e.count as usize <= img.num_blocks())
}

pub fn partitions(img: &DiskImg) -> Result<Vec<Partition>,DYNERR> {
    let map = match read_map(img) {
        Some(m) => m,
        None => return Err(Box::new(crate::fs::Error::FileSystemMismatch))
    };
    let count = usize::min(map.part_count as usize,MAX_PARTS);
    Ok(map.entries[0..count].iter().enumerate()
        .filter(|(_,e)| e.count > 0)
        .map(|(i,e)| Partition::blocks(&entry_name(e,i),e.start as usize,e.count as usize))
        .collect())
}

#[test]
fn table() {
    use crate::img::{CreateParams,WrapperKind};
    let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(4096)).unwrap();
    let mut map = vec![0;512];
    map[0..14].copy_from_slice(SIGNATURE);
    map[15] = 2;
    map[32..36].copy_from_slice(&8u32.to_le_bytes());
    map[36..40].copy_from_slice(&1600u32.to_le_bytes());
    map[48..53].copy_from_slice(b"GAMES");
    map[80..84].copy_from_slice(&1608u32.to_le_bytes());
    map[84..88].copy_from_slice(&1600u32.to_le_bytes());
    img.write_block(0,&map).unwrap();
    assert!(test(&img,Leniency::Strict));
    let parts = partitions(&img).unwrap();
    assert_eq!(parts.len(),2);
    assert_eq!(parts[0].name,"GAMES");
    assert_eq!(parts[1].name,"FocusDrive 2");
    assert_eq!(parts[1].start_block,1608);
}
