//! ## Support for TrackStar images
//!
//! TrackStar stores 40 or 80 tracks in fixed slots of 6656 bytes.  Each slot starts with a
//! text description, nibble data begins at 0x81, and the little endian word at 0x19fe says
//! how many nibbles are in use.  A used length of zero marks an unformatted track.
//! Files with 80 slots keep the whole tracks in the even slots.
//!
//! The normalized form packs only the used nibbles of each track back to back, with
//! a `NibbleLayout` giving each track's length and offset.

use log::{debug,info,warn};
use super::{Addressing,SectorOrder,PhysicalFormat,Prepped,CreateParams,ImageWrapper,WrapperKind,NibbleLayout,Error};
use super::nibble::NibbleFormat;
use crate::DYNERR;

pub const SLOT_LEN: usize = 6656;
const DATA_OFFSET: usize = 0x81;
const LENGTH_OFFSET: usize = 0x19fe;
pub const MAX_TRACK_LEN: usize = 6525;
const TRACKS: usize = 40;
const DEFAULT_VOLUME: u8 = 254;

pub fn file_extensions() -> Vec<String> {
    vec!["app".to_string()]
}

pub struct TrackStar {
    /// the whole file, slots are patched on flush
    raw: Vec<u8>,
    /// slots per track, 1 or 2
    stride: usize,
    layout: NibbleLayout
}

fn slot_count(len: usize) -> Option<usize> {
    match len {
        l if l == TRACKS*SLOT_LEN => Some(TRACKS),
        l if l == 2*TRACKS*SLOT_LEN => Some(2*TRACKS),
        _ => None
    }
}

fn used_len(slot: &[u8]) -> usize {
    u16::from_le_bytes([slot[LENGTH_OFFSET],slot[LENGTH_OFFSET+1]]) as usize
}

pub fn test(buf: &[u8]) -> bool {
    let slots = match slot_count(buf.len()) {
        Some(n) => n,
        None => return false
    };
    for i in 0..slots {
        let slot = &buf[i*SLOT_LEN..(i+1)*SLOT_LEN];
        if used_len(slot) > MAX_TRACK_LEN {
            return false;
        }
        // description is printable text
        if !slot[0..DATA_OFFSET].iter().all(|b| *b==0 || (*b >= 0x20 && *b < 0x7f)) {
            return false;
        }
    }
    true
}

pub fn prep(buf: &[u8]) -> Result<(TrackStar,Prepped),DYNERR> {
    let slots = match slot_count(buf.len()) {
        Some(n) => n,
        None => return Err(Box::new(Error::ImageSizeMismatch))
    };
    let stride = slots / TRACKS;
    let mut data: Vec<u8> = Vec::new();
    let mut length: Vec<usize> = Vec::new();
    let mut format: Option<NibbleFormat> = None;
    let mut volume: Option<u8> = None;
    for t in 0..TRACKS {
        let slot = &buf[t*stride*SLOT_LEN..(t*stride+1)*SLOT_LEN];
        let n = used_len(slot);
        if n > MAX_TRACK_LEN {
            return Err(Box::new(Error::Corrupt));
        }
        let nibs = &slot[DATA_OFFSET..DATA_OFFSET+n];
        if format.is_none() && n > 0 {
            if let Some((f,v)) = super::sniff_nibble_format(nibs,t as u8) {
                format = Some(f);
                volume = Some(v);
            }
        }
        data.extend_from_slice(nibs);
        length.push(n);
    }
    let format = match format {
        Some(f) => f,
        None => {
            debug!("TrackStar image has no readable address fields");
            return Err(Box::new(Error::UnrecognizedFormat));
        }
    };
    let unformatted = length.iter().filter(|l| **l==0).count();
    if unformatted > 0 {
        warn!("TrackStar image has {} unformatted tracks",unformatted);
    }
    info!("TrackStar image with {} slots",slots);
    let layout = NibbleLayout::packed(format,length);
    let mut prepped = Prepped::new(data,Addressing::Nibbles(layout.clone()),SectorOrder::Physical,PhysicalFormat::Nib525Var);
    prepped.volume = volume;
    Ok((TrackStar { raw: buf.to_vec(), stride, layout },prepped))
}

pub fn create(params: &CreateParams) -> Result<(TrackStar,Prepped),DYNERR> {
    let format = match params.addressing {
        Addressing::Sectors { tracks: 35, sectors: 13 } => NibbleFormat::Dos32,
        Addressing::Sectors { tracks: 35, sectors: 16 } => NibbleFormat::Dos33,
        _ => return Err(Box::new(Error::ImageSizeMismatch))
    };
    let volume = params.volume.unwrap_or(DEFAULT_VOLUME);
    let track_len = format.track_len();
    let mut length = vec![track_len;35];
    length.resize(TRACKS,0);
    let data = super::blank_nibble_tracks(format,35,track_len,volume)?;
    let mut raw = vec![0;TRACKS*SLOT_LEN];
    let desc = format!("diskimg v{}",env!("CARGO_PKG_VERSION"));
    for t in 0..TRACKS {
        let slot = &mut raw[t*SLOT_LEN..(t+1)*SLOT_LEN];
        slot[0..DATA_OFFSET].fill(0x20);
        slot[0..desc.len()].copy_from_slice(desc.as_bytes());
    }
    let layout = NibbleLayout::packed(format,length);
    let mut prepped = Prepped::new(data,Addressing::Nibbles(layout.clone()),SectorOrder::Physical,PhysicalFormat::Nib525Var);
    prepped.volume = Some(volume);
    Ok((TrackStar { raw, stride: 1, layout },prepped))
}

impl ImageWrapper for TrackStar {
    fn kind(&self) -> WrapperKind {
        WrapperKind::TrackStar
    }
    fn flush(&mut self,normalized: &[u8]) -> Result<Vec<u8>,DYNERR> {
        if normalized.len() != self.layout.total_len() {
            return Err(Box::new(Error::ImageSizeMismatch));
        }
        for t in 0..self.layout.count() {
            let (off,len) = (self.layout.offset[t],self.layout.length[t]);
            let start = t*self.stride*SLOT_LEN;
            let slot = &mut self.raw[start..start+SLOT_LEN];
            slot[DATA_OFFSET..DATA_OFFSET+len].copy_from_slice(&normalized[off..off+len]);
            slot[DATA_OFFSET+len..LENGTH_OFFSET].fill(0);
            slot[LENGTH_OFFSET..LENGTH_OFFSET+2].copy_from_slice(&u16::to_le_bytes(len as u16));
        }
        Ok(self.raw.clone())
    }
    fn has_fast_flush(&self) -> bool {
        false
    }
}

#[test]
fn short_tracks_are_honored() {
    let (mut w,p) = create(&super::CreateParams::dos_525(SectorOrder::Physical)).unwrap();
    let bytes = w.flush(&p.data).unwrap();
    assert_eq!(bytes.len(),40*SLOT_LEN);
    assert!(test(&bytes));
    let (_,back) = prep(&bytes).unwrap();
    assert_eq!(back.data,p.data);
    match back.addressing {
        Addressing::Nibbles(layout) => {
            assert_eq!(layout.length[0],NibbleFormat::Dos33.track_len());
            assert_eq!(layout.length[39],0);
        },
        _ => panic!("expected nibbles")
    }
}
