//! # DOS 3.x directory structures
//!
//! The VTOC bitmap is extended to 200 bytes, allowing 50 tracks of up to 32 sectors.
//! This covers the 400K halves of UNIDOS and OzDOS disks.

use binrw::{binrw,BinRead,BinWrite};
use std::io::Cursor;
use crate::DYNERR;

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct VTOC {
    pub pad1: u8,
    pub track1: u8,
    pub sector1: u8,
    pub version: u8,
    pub pad2: [u8;2],
    pub vol: u8,
    pub pad3: [u8;32],
    pub max_pairs: u8,
    pub pad4: [u8;8],
    pub last_track: u8,
    pub last_direction: u8,
    pub pad5: [u8;2],
    pub tracks: u8,
    pub sectors: u8,
    pub bytes: u16,
    pub bitmap: [u8;200]
}

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct TrackSectorList {
    pub pad1: u8,
    pub next_track: u8,
    pub next_sector: u8,
    pub pad2: [u8;2],
    pub sector_base: u16,
    pub pad3: [u8;5],
    pub pairs: [u8;244]
}

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct DirectoryEntry {
    pub tsl_track: u8,
    pub tsl_sector: u8,
    pub file_type: u8,
    pub name: [u8;30],
    pub sectors: u16
}

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct DirectorySector {
    pub pad1: u8,
    pub next_track: u8,
    pub next_sector: u8,
    pub pad2: [u8;8],
    pub entries: [DirectoryEntry;7]
}

macro_rules! sector_struct {
    ($t:ty) => {
        impl $t {
            pub fn from_bytes(buf: &[u8]) -> Result<Self,DYNERR> {
                Ok(Self::read(&mut Cursor::new(buf))?)
            }
            pub fn to_bytes(&self) -> Result<Vec<u8>,DYNERR> {
                let mut curs = Cursor::new(Vec::new());
                self.write(&mut curs)?;
                Ok(curs.into_inner())
            }
        }
    };
}

sector_struct!(VTOC);
sector_struct!(TrackSectorList);
sector_struct!(DirectorySector);

impl VTOC {
    /// bit for a sector within the track's 32 bit big endian map, 0 if the sector has no bit
    fn mask(&self,sector: usize) -> u32 {
        let sectors = self.sectors as usize;
        match (sector + 32).checked_sub(sectors) {
            Some(shift) if sector < sectors => 1u32.checked_shl(shift as u32).unwrap_or(0),
            _ => 0
        }
    }
    fn track_map(&self,track: usize) -> u32 {
        match self.bitmap.get(track*4..track*4+4) {
            Some(b) => u32::from_be_bytes([b[0],b[1],b[2],b[3]]),
            None => 0
        }
    }
    fn set_track_map(&mut self,track: usize,map: u32) {
        if let Some(b) = self.bitmap.get_mut(track*4..track*4+4) {
            b.copy_from_slice(&u32::to_be_bytes(map));
        }
    }
    pub fn is_free(&self,track: usize,sector: usize) -> bool {
        track < self.tracks as usize && self.track_map(track) & self.mask(sector) != 0
    }
    pub fn set_free(&mut self,track: usize,sector: usize,free: bool) {
        if track >= self.tracks as usize || sector >= self.sectors as usize {
            return;
        }
        let map = self.track_map(track);
        match free {
            true => self.set_track_map(track,map | self.mask(sector)),
            false => self.set_track_map(track,map & !self.mask(sector))
        }
    }
    pub fn num_free(&self) -> usize {
        let mut ans = 0;
        for t in 0..self.tracks as usize {
            for s in 0..self.sectors as usize {
                if self.is_free(t,s) {
                    ans += 1;
                }
            }
        }
        ans
    }
}

impl DirectoryEntry {
    pub fn blank() -> Self {
        Self { tsl_track: 0, tsl_sector: 0, file_type: 0, name: [0xa0;30], sectors: 0 }
    }
}

impl TrackSectorList {
    pub fn blank() -> Self {
        Self { pad1: 0, next_track: 0, next_sector: 0, pad2: [0;2], sector_base: 0, pad3: [0;5], pairs: [0;244] }
    }
}

#[test]
fn vtoc_bitmap() {
    let mut buf = vec![0;256];
    buf[0x34] = 35;
    buf[0x35] = 16;
    buf[0x36] = 0;
    buf[0x37] = 1;
    let mut vtoc = VTOC::from_bytes(&buf).unwrap();
    assert_eq!(vtoc.bytes,256);
    vtoc.set_free(3,15,true);
    vtoc.set_free(3,0,true);
    let bytes = vtoc.to_bytes().unwrap();
    assert_eq!(bytes.len(),256);
    assert_eq!(bytes[0x38+12],0x80);
    assert_eq!(bytes[0x38+13],0x01);
    assert_eq!(vtoc.num_free(),2);
}

#[test]
fn vtoc_bad_geometry() {
    let mut buf = vec![0;256];
    buf[0x34] = 200;
    buf[0x35] = 40;
    buf[0x36] = 0;
    buf[0x37] = 1;
    let mut vtoc = VTOC::from_bytes(&buf).unwrap();
    vtoc.set_free(60,0,true);
    vtoc.set_free(3,35,true);
    assert!(!vtoc.is_free(60,0));
    assert!(!vtoc.is_free(3,39));
    assert_eq!(vtoc.num_free(),0);
}
