//! ### MicroDrive
//!
//! ATA card partition table in block 0, little endian, identified by `0xCCCA`.
//! Partitions come in two groups of up to 8.

use binrw::{binrw,BinRead};
use std::io::Cursor;
use log::debug;
use super::Partition;
use crate::fs::Leniency;
use crate::img::DiskImg;
use crate::DYNERR;

pub const MAGIC: u16 = 0xccca;
const MAX_PARTS: usize = 8;

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct PartitionMap {
    pub magic: u16,
    pub cylinders: u16,
    reserved1: u16,
    pub heads: u16,
    pub sectors: u16,
    reserved2: u16,
    pub num_part1: u8,
    pub num_part2: u8,
    reserved3: [u8;10],
    pub rom_version: u16,
    reserved4: [u8;6],
    pub start1: [u32;MAX_PARTS],
    pub start2: [u32;MAX_PARTS],
    pub length1: [u32;MAX_PARTS],
    pub length2: [u32;MAX_PARTS]
}

impl PartitionMap {
    /// (start,length) of every listed partition
    fn entries(&self) -> Vec<(usize,usize)> {
        let n1 = usize::min(self.num_part1 as usize,MAX_PARTS);
        let n2 = usize::min(self.num_part2 as usize,MAX_PARTS);
        let mut ans: Vec<(usize,usize)> = (0..n1).map(|i| (self.start1[i] as usize,self.length1[i] as usize)).collect();
        ans.extend((0..n2).map(|i| (self.start2[i] as usize,self.length2[i] as usize)));
        ans
    }
}

fn read_map(img: &DiskImg) -> Option<PartitionMap> {
    let buf = img.read_block(0).ok()?;
    PartitionMap::read(&mut Cursor::new(&buf)).ok()
}

pub fn test(img: &DiskImg,leniency: Leniency) -> bool {
    let map = match read_map(img) {
        Some(m) if m.magic==MAGIC => m,
        _ => return false
    };
    if map.num_part1==0 || map.num_part1 as usize > MAX_PARTS || map.num_part2 as usize > MAX_PARTS {
        debug!("MicroDrive partition counts {} and {}",map.num_part1,map.num_part2);
        return false;
    }
    if leniency==Leniency::Lenient {
        return true;
    }
    for (start,len) in map.entries() {
        if start==0 || len==0 || start + len > img.num_blocks() {
            debug!("MicroDrive partition at {} with {} blocks does not fit",start,len);
            return false;
        }
    }
    true
}

pub fn partitions(img: &DiskImg) -> Result<Vec<Partition>,DYNERR> {
    let map = match read_map(img) {
        Some(m) => m,
        None => return Err(Box::new(crate::fs::Error::FileSystemMismatch))
    };
    Ok(map.entries().iter().enumerate()
        .filter(|(_,(_,len))| *len > 0)
        .map(|(i,(start,len))| Partition::blocks(&format!("MicroDrive {}",i+1),*start,*len))
        .collect())
}

#[cfg(test)]
pub fn map_block(parts: &[(u32,u32)]) -> Vec<u8> {
    let mut ans = vec![0;512];
    ans[0..2].copy_from_slice(&MAGIC.to_le_bytes());
    ans[12] = parts.len() as u8;
    for (i,(start,len)) in parts.iter().enumerate() {
        ans[0x20+4*i..0x24+4*i].copy_from_slice(&start.to_le_bytes());
        ans[0x60+4*i..0x64+4*i].copy_from_slice(&len.to_le_bytes());
    }
    ans
}

#[test]
fn table() {
    use crate::img::{CreateParams,WrapperKind};
    let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(4096)).unwrap();
    img.write_block(0,&map_block(&[(16,2000),(2016,3000)])).unwrap();
    assert!(!test(&img,Leniency::Strict));
    assert!(test(&img,Leniency::Lenient));
    img.write_block(0,&map_block(&[(16,2000),(2016,2000)])).unwrap();
    assert!(test(&img,Leniency::Strict));
    let parts = partitions(&img).unwrap();
    assert_eq!(parts.len(),2);
    assert_eq!(parts[1].name,"MicroDrive 2");
}
