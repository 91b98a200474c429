//! ### OzDOS
//!
//! An 800K disk holding two 400K DOS 3.3 volumes interleaved by half-block.
//! The first volume owns the first 256 bytes of every block, the second owns the rest.
//! Each volume is 50 tracks of 32 sectors.

use super::Partition;
use super::unidos::{DISK_BLOCKS,TRACKS,SECTORS};
use crate::fs::{Leniency,dos3x};
use crate::img::{Addressing,DiskImg,SectorOrder};

pub fn partitions() -> Vec<Partition> {
    (0..2).map(|i| Partition {
        name: format!("OzDOS {}",i+1),
        start_block: 0,
        num_blocks: DISK_BLOCKS,
        addressing: Addressing::Sectors { tracks: TRACKS, sectors: SECTORS },
        order: SectorOrder::Dos,
        paired: Some(i)
    }).collect()
}

pub fn test(img: &DiskImg,leniency: Leniency) -> bool {
    if img.num_blocks() != DISK_BLOCKS {
        return false;
    }
    let found = partitions().iter()
        .filter_map(|p| p.open(img).ok())
        .filter(|half| dos3x::Disk::test(half,leniency,false))
        .count();
    match leniency {
        Leniency::Lenient => found > 0,
        _ => found == 2
    }
}
