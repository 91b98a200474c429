//! ### Apple Partition Map
//!
//! Block 0 holds the driver descriptor record (`ER`), the map entries (`PM`) follow from
//! block 1, one per block.  Every entry records the total number of entries in the map.

use binrw::{binrw,BinRead};
use std::io::Cursor;
use log::debug;
use super::Partition;
use crate::fs::Leniency;
use crate::img::{self,DiskImg};
use crate::DYNERR;

const DDR_SIG: u16 = 0x4552;
const PM_SIG: u16 = 0x504d;
const MAX_ENTRIES: u32 = 256;
/// entries of these types are not volumes
const SKIP_TYPES: [&str;3] = ["Apple_partition_map","Apple_Free","Apple_Void"];

#[binrw]
#[brw(big)]
#[derive(Clone,Debug)]
pub struct DriverDescriptor {
    pub sig: u16,
    pub block_size: u16,
    pub block_count: u32
}

#[binrw]
#[brw(big)]
#[derive(Clone,Debug)]
pub struct MapEntry {
    pub sig: u16,
    pad: u16,
    pub map_entries: u32,
    pub start: u32,
    pub count: u32,
    pub name: [u8;32],
    pub part_type: [u8;32]
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b==0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[0..end]).to_string()
}

impl MapEntry {
    pub fn name(&self) -> String {
        c_string(&self.name)
    }
    pub fn part_type(&self) -> String {
        c_string(&self.part_type)
    }
}

fn read_entry(img: &DiskImg,block: usize) -> Option<MapEntry> {
    let buf = img.read_block(block).ok()?;
    MapEntry::read(&mut Cursor::new(&buf)).ok()
}

pub fn test(img: &DiskImg,leniency: Leniency) -> bool {
    let ddr = match img.read_block(0).map(|b| DriverDescriptor::read(&mut Cursor::new(&b))) {
        Ok(Ok(d)) => d,
        _ => return false
    };
    if ddr.sig != DDR_SIG && leniency != Leniency::Lenient {
        return false;
    }
    if leniency==Leniency::Strict && ddr.block_size as usize != img::BLOCK_SIZE {
        debug!("partition map block size {}",ddr.block_size);
        return false;
    }
    let first = match read_entry(img,1) {
        Some(e) => e,
        None => return false
    };
    if first.sig != PM_SIG || first.map_entries==0 || first.map_entries > MAX_ENTRIES {
        return false;
    }
    if leniency==Leniency::Strict {
        for i in 1..=first.map_entries as usize {
            match read_entry(img,i) {
                Some(e) if e.sig==PM_SIG && e.map_entries==first.map_entries => {},
                _ => {
                    debug!("partition map entry {} is bad",i);
                    return false;
                }
            }
        }
    }
    true
}

pub fn partitions(img: &DiskImg) -> Result<Vec<Partition>,DYNERR> {
    let mut ans = Vec::new();
    let count = match read_entry(img,1) {
        Some(e) => usize::min(e.map_entries as usize,MAX_ENTRIES as usize),
        None => 0
    };
    for i in 1..=count {
        let e = match read_entry(img,i) {
            Some(e) if e.sig==PM_SIG => e,
            _ => break
        };
        let typ = e.part_type();
        if SKIP_TYPES.contains(&typ.as_str()) || typ.starts_with("Apple_Driver") {
            continue;
        }
        let name = match e.name().len() {
            0 => typ,
            _ => e.name()
        };
        ans.push(Partition::blocks(&name,e.start as usize,e.count as usize));
    }
    Ok(ans)
}

#[cfg(test)]
pub fn map_blocks(parts: &[(&str,&str,u32,u32)]) -> Vec<Vec<u8>> {
    let mut ans = Vec::new();
    let mut ddr = vec![0;512];
    ddr[0..2].copy_from_slice(&DDR_SIG.to_be_bytes());
    ddr[2..4].copy_from_slice(&512u16.to_be_bytes());
    ans.push(ddr);
    let all = [vec![("Apple","Apple_partition_map",1u32,63u32)],parts.to_vec()].concat();
    for (name,typ,start,count) in &all {
        let mut blk = vec![0;512];
        blk[0..2].copy_from_slice(&PM_SIG.to_be_bytes());
        blk[4..8].copy_from_slice(&(all.len() as u32).to_be_bytes());
        blk[8..12].copy_from_slice(&start.to_be_bytes());
        blk[12..16].copy_from_slice(&count.to_be_bytes());
        blk[16..16+name.len()].copy_from_slice(name.as_bytes());
        blk[48..48+typ.len()].copy_from_slice(typ.as_bytes());
        ans.push(blk);
    }
    ans
}

#[test]
fn map_entries() {
    use crate::img::{CreateParams,WrapperKind};
    let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(2048)).unwrap();
    for (i,blk) in map_blocks(&[("Disk1","Apple_HFS",64,1000),("","Apple_Free",1064,984)]).iter().enumerate() {
        img.write_block(i,blk).unwrap();
    }
    assert!(test(&img,Leniency::Strict));
    let parts = partitions(&img).unwrap();
    assert_eq!(parts.len(),1);
    assert_eq!(parts[0].name,"Disk1");
    assert_eq!(parts[0].start_block,64);
    img.write_block(0,&[0;512]).unwrap();
    assert!(!test(&img,Leniency::Moderate));
    assert!(test(&img,Leniency::Lenient));
}
