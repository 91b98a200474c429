//! ## Support for NIB disk images
//!
//! NIB tracks are the nibble stream of each track, already aligned to bytes, stored
//! in fixed size slots.  The common slot is 6656 bytes, the NB2 variant uses 6384.
//! Sectors are read by searching the track for address fields, so the normalized form
//! is simply the file itself.

use log::{debug,info};
use super::{Addressing,SectorOrder,PhysicalFormat,Prepped,CreateParams,ImageWrapper,WrapperKind,NibbleLayout,Error};
use super::nibble::NibbleFormat;
use crate::DYNERR;

pub const TRACK_BYTE_CAPACITY_NIB: usize = 6656;
pub const TRACK_BYTE_CAPACITY_NB2: usize = 6384;
const TRACKS: usize = 35;
const DEFAULT_VOLUME: u8 = 254;

pub fn file_extensions() -> Vec<String> {
    vec!["nib".to_string(),"nb2".to_string()]
}

pub struct Nib {
    slot: usize
}

fn slot_for(len: usize) -> Option<usize> {
    match len {
        l if l == TRACKS*TRACK_BYTE_CAPACITY_NIB => Some(TRACK_BYTE_CAPACITY_NIB),
        l if l == TRACKS*TRACK_BYTE_CAPACITY_NB2 => Some(TRACK_BYTE_CAPACITY_NB2),
        _ => None
    }
}

/// Size must match and the first track must hold a recognizable address field
pub fn test(buf: &[u8]) -> bool {
    match slot_for(buf.len()) {
        Some(slot) => super::sniff_nibble_format(&buf[0..slot],0).is_some(),
        None => false
    }
}

pub fn prep(buf: &[u8]) -> Result<(Nib,Prepped),DYNERR> {
    let slot = match slot_for(buf.len()) {
        Some(s) => s,
        None => return Err(Box::new(Error::ImageSizeMismatch))
    };
    let (format,volume) = match super::sniff_nibble_format(&buf[0..slot],0) {
        Some(x) => x,
        None => {
            debug!("no address field on track 0");
            return Err(Box::new(Error::UnrecognizedFormat));
        }
    };
    info!("NIB with {} sectors per track, volume {}",format.sectors(),volume);
    let phys = match slot {
        TRACK_BYTE_CAPACITY_NIB => PhysicalFormat::Nib525_6656,
        _ => PhysicalFormat::Nib525_6384
    };
    let mut ans = Prepped::new(buf.to_vec(),Addressing::Nibbles(NibbleLayout::fixed(format,TRACKS,slot)),SectorOrder::Physical,phys);
    ans.volume = Some(volume);
    Ok((Nib { slot },ans))
}

pub fn create(params: &CreateParams) -> Result<(Nib,Prepped),DYNERR> {
    let format = match params.addressing {
        Addressing::Sectors { tracks: TRACKS, sectors: 13 } => NibbleFormat::Dos32,
        Addressing::Sectors { tracks: TRACKS, sectors: 16 } => NibbleFormat::Dos33,
        _ => return Err(Box::new(Error::ImageSizeMismatch))
    };
    let (slot,phys) = match params.phys {
        PhysicalFormat::Nib525_6384 => (TRACK_BYTE_CAPACITY_NB2,PhysicalFormat::Nib525_6384),
        _ => (TRACK_BYTE_CAPACITY_NIB,PhysicalFormat::Nib525_6656)
    };
    let volume = params.volume.unwrap_or(DEFAULT_VOLUME);
    let data = super::blank_nibble_tracks(format,TRACKS,slot,volume)?;
    let mut ans = Prepped::new(data,Addressing::Nibbles(NibbleLayout::fixed(format,TRACKS,slot)),SectorOrder::Physical,phys);
    ans.volume = Some(volume);
    Ok((Nib { slot },ans))
}

impl ImageWrapper for Nib {
    fn kind(&self) -> WrapperKind {
        WrapperKind::RawNibble
    }
    fn flush(&mut self,normalized: &[u8]) -> Result<Vec<u8>,DYNERR> {
        if normalized.len() != TRACKS*self.slot {
            return Err(Box::new(Error::ImageSizeMismatch));
        }
        Ok(normalized.to_vec())
    }
    fn has_fast_flush(&self) -> bool {
        true
    }
}

#[test]
fn blank_nib_is_recognized() {
    let params = CreateParams {
        addressing: Addressing::Sectors { tracks: 35, sectors: 13 },
        phys: PhysicalFormat::Nib525_6656,
        order: SectorOrder::Physical,
        volume: Some(10)
    };
    let (_,p) = create(&params).unwrap();
    assert!(test(&p.data));
    let (_,back) = prep(&p.data).unwrap();
    assert_eq!(back.volume,Some(10));
    match back.addressing {
        Addressing::Nibbles(layout) => assert_eq!(layout.format,NibbleFormat::Dos32),
        _ => panic!("expected nibbles")
    }
}
