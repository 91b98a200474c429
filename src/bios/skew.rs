//! ## Sector Skewing Module
//!
//! This contains all the sector skew tables.  This includes any non-trivial transformations
//! between blocks and sectors.
//!
//! The sector skews are kept separate from file systems and disk images because multiple
//! submodules of either can use the same tables.  Tables are private, use the accessors.

use log::trace;
use crate::img::Error;

/// Order in which 13-sector physical sectors pass under the head
const DOS32_PHYSICAL: [usize;13] = [0,10,7,4,1,11,8,5,2,12,9,6,3];
/// Translate DOS 3.3 logical sector to physical sector
const DOS_LSEC_TO_DOS_PSEC: [usize;16] = [0,13,11,9,7,5,3,1,14,12,10,8,6,4,2,15];
/// Translate DOS 3.3 physical sector to logical sector
const DOS_PSEC_TO_DOS_LSEC: [usize;16] = [0,7,14,6,13,5,12,4,11,3,10,2,9,1,8,15];
/// Position of a DOS 3.3 logical sector within a track of a ProDOS ordered image.
/// The table is its own inverse.
const DOS_LSEC_TO_PO_SLOT: [usize;16] = [0,14,13,12,11,10,9,8,7,6,5,4,3,2,1,15];
/// Take a 256 byte CP/M sector to a DOS logical sector
const CPM_SEC_TO_DOS_LSEC: [usize;16] = [0,6,12,3,9,15,14,5,11,2,8,7,13,4,10,1];
/// Sectors per track on 3.5 inch disks, indexed by zone (16 tracks per zone)
const ZONED_SECS_PER_TRACK: [usize;5] = [12,11,10,9,8];

pub fn dos_lsec_to_psec(lsec: usize) -> usize {
    DOS_LSEC_TO_DOS_PSEC[lsec & 0x0f]
}

pub fn dos_psec_to_lsec(psec: usize) -> usize {
    DOS_PSEC_TO_DOS_LSEC[psec & 0x0f]
}

pub fn dos_lsec_to_po_slot(lsec: usize) -> usize {
    DOS_LSEC_TO_PO_SLOT[lsec & 0x0f]
}

pub fn cpm_sec_to_dos_lsec(sec: usize) -> usize {
    CPM_SEC_TO_DOS_LSEC[sec & 0x0f]
}

/// Physical sector found at position `pos` around a 13-sector track
pub fn dos32_sector_at(pos: usize) -> usize {
    DOS32_PHYSICAL[pos % 13]
}

/// Get block number and byte offset into block corresponding to
/// track and logical sector of a 16-sector disk.  Returned in tuple (block,offset)
pub fn prodos_block_from_ts(track: usize,sector: usize) -> (usize,usize) {
    let block_offset: [usize;16] = [0,7,6,6,5,5,4,4,3,3,2,2,1,1,0,7];
    let byte_offset: [usize;16] = [0,0,256,0,256,0,256,0,256,0,256,0,256,0,256,256];
    (8*track + block_offset[sector & 0x0f], byte_offset[sector & 0x0f])
}

/// Get the two track and logical sector pairs holding a block on a 16-sector disk.
/// The returned pairs are arranged in order.
pub fn ts_from_prodos_block(block: usize) -> [[usize;2];2] {
    let sector1: [usize;8] = [0,13,11,9,7,5,3,1];
    let sector2: [usize;8] = [14,12,10,8,6,4,2,15];
    let [track,sec1,sec2] = [block/8,sector1[block%8],sector2[block%8]];
    trace!("locate block for 5.25 inch disk: track {}, sectors {},{}",track,sec1,sec2);
    [[track,sec1],[track,sec2]]
}

/// sectors on a 3.5 inch track
pub fn secs_per_track_35(track: usize) -> usize {
    ZONED_SECS_PER_TRACK[usize::min(track/16,4)]
}

/// Block number of a 3.5 inch sector, `sides` is 1 or 2.
pub fn block_from_35(track: usize,side: usize,sector: usize,sides: usize) -> Result<usize,Error> {
    if track >= 80 || side >= sides || sector >= secs_per_track_35(track) {
        return Err(Error::OutOfRange);
    }
    let mut block = 0;
    for t in 0..track {
        block += secs_per_track_35(t) * sides;
    }
    Ok(block + side*secs_per_track_35(track) + sector)
}

#[test]
fn po_slot_is_involution() {
    for s in 0..16 {
        assert_eq!(dos_lsec_to_po_slot(dos_lsec_to_po_slot(s)),s);
        assert_eq!(dos_psec_to_lsec(dos_lsec_to_psec(s)),s);
    }
}

#[test]
fn block_ts_agree() {
    for block in 0..280 {
        let [[t1,s1],[t2,s2]] = ts_from_prodos_block(block);
        assert_eq!(prodos_block_from_ts(t1,s1),(block,0));
        assert_eq!(prodos_block_from_ts(t2,s2),(block,256));
        // a ProDOS ordered image stores the halves contiguously
        assert_eq!(dos_lsec_to_po_slot(s1),2*(block%8));
        assert_eq!(dos_lsec_to_po_slot(s2),2*(block%8)+1);
    }
}

#[test]
fn blocks_35() {
    assert_eq!(block_from_35(0,1,0,2).unwrap(),12);
    assert_eq!(block_from_35(79,1,7,2).unwrap(),1599);
    assert_eq!(block_from_35(79,0,7,1).unwrap(),799);
    assert!(block_from_35(0,0,12,2).is_err());
}
