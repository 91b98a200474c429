//! ### UNIDOS
//!
//! An 800K disk split into two 400K DOS 3.3 volumes.  Each half is 50 tracks of 32 sectors,
//! laid out linearly, the first half at block 0 and the second at block 800.

use super::Partition;
use crate::fs::{Leniency,dos3x};
use crate::img::{Addressing,DiskImg,SectorOrder};

pub const DISK_BLOCKS: usize = 1600;
pub const TRACKS: usize = 50;
pub const SECTORS: usize = 32;

pub fn partitions() -> Vec<Partition> {
    (0..2).map(|i| Partition {
        name: format!("UNIDOS {}",i+1),
        start_block: i*DISK_BLOCKS/2,
        num_blocks: DISK_BLOCKS/2,
        addressing: Addressing::Sectors { tracks: TRACKS, sectors: SECTORS },
        order: SectorOrder::Dos,
        paired: None
    }).collect()
}

/// Both halves must hold DOS 3.3, except at `Lenient` where one will do.
pub fn test(img: &DiskImg,leniency: Leniency) -> bool {
    if img.num_blocks() != DISK_BLOCKS {
        return false;
    }
    let mut found = 0;
    for p in partitions() {
        if let Ok(half) = p.open(img) {
            if dos3x::Disk::test(&half,leniency,false) {
                found += 1;
            }
        }
    }
    match leniency {
        Leniency::Lenient => found > 0,
        _ => found == 2
    }
}
