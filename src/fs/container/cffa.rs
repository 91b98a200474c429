//! ### CFFA
//!
//! CompactFlash card split into fixed 32MB partitions, up to 8 of them.
//! The last partition takes whatever remains.  There is no partition map, so the
//! first partition has to hold a recognizable ProDOS or HFS volume.

use log::debug;
use super::Partition;
use crate::fs::{Leniency,prodos,hfs};
use crate::img::DiskImg;

pub const PARTITION_BLOCKS: usize = 65536;
pub const MAX_PARTITIONS: usize = 8;
/// remainders smaller than this are not partitions
const MIN_PARTITION_BLOCKS: usize = 16;

pub fn partitions(total: usize) -> Vec<Partition> {
    let mut ans = Vec::new();
    let mut start = 0;
    while start + MIN_PARTITION_BLOCKS <= total && ans.len() < MAX_PARTITIONS {
        let count = usize::min(PARTITION_BLOCKS,total - start);
        ans.push(Partition::blocks(&format!("CFFA {}",ans.len()+1),start,count));
        start += count;
    }
    ans
}

pub fn test(img: &DiskImg,leniency: Leniency) -> bool {
    let total = img.num_blocks();
    if total <= PARTITION_BLOCKS {
        return false;
    }
    if leniency != Leniency::Lenient && total > PARTITION_BLOCKS*MAX_PARTITIONS {
        debug!("{} blocks is too large for CFFA",total);
        return false;
    }
    let parts = partitions(total);
    let first = match parts.first().map(|p| p.open(img)) {
        Some(Ok(i)) => i,
        _ => return false
    };
    if !prodos::Disk::test(&first,leniency) && !hfs::Disk::test(&first,leniency) {
        return false;
    }
    if leniency==Leniency::Strict && parts.len() > 1 {
        // the second partition should also hold something
        if let Ok(second) = parts[1].open(img) {
            return prodos::Disk::test(&second,Leniency::Moderate) || hfs::Disk::test(&second,Leniency::Moderate);
        }
    }
    true
}

#[test]
fn layout() {
    let parts = partitions(4*PARTITION_BLOCKS + 1000);
    assert_eq!(parts.len(),5);
    assert_eq!(parts[4].start_block,4*PARTITION_BLOCKS);
    assert_eq!(parts[4].num_blocks,1000);
    assert_eq!(partitions(9*PARTITION_BLOCKS).len(),8);
    assert_eq!(partitions(PARTITION_BLOCKS + 8).len(),1);
}
