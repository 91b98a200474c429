//! ## Support for unadorned sector images (DO, PO, DSK, D13, HDV, IMG)
//!
//! These are a sequential dump of already decoded sectors or blocks.  The size tells us the
//! geometry, while the order of 16-sector tracks can only be guessed from the extension.
//! When the extension does not decide it, the order is left unknown and the file system
//! format test tries each candidate.

use log::{debug,trace};
use super::{Addressing,SectorOrder,PhysicalFormat,Prepped,CreateParams,ImageWrapper,WrapperKind,Error};
use crate::outer::MAX_EXPANDED_SIZE;
use crate::DYNERR;

const SECTOR_SIZE: usize = 256;
const BLOCK_SIZE: usize = 512;
const D13_SIZE: usize = 35*13*SECTOR_SIZE;
const TRACK_16: usize = 16*SECTOR_SIZE;

pub fn file_extensions() -> Vec<String> {
    vec!["do".to_string(),"po".to_string(),"dsk".to_string(),"d13".to_string(),
        "hdv".to_string(),"img".to_string(),"iso".to_string(),"raw".to_string()]
}

/// Wrapper for unadorned data, nothing to remember
pub struct Dsk {}

pub fn test(buf: &[u8]) -> bool {
    buf.len() > 0 && buf.len() % SECTOR_SIZE == 0
}

fn order_from_ext(ext: &str) -> SectorOrder {
    match ext {
        "do" => SectorOrder::Dos,
        "po" => SectorOrder::ProDos,
        _ => SectorOrder::Unknown
    }
}

/// Geometry implied by the data length
fn addressing_for(len: usize) -> Option<Addressing> {
    if len == D13_SIZE {
        return Some(Addressing::Sectors { tracks: 35, sectors: 13 });
    }
    // 5.25 inch disks with 35 to 40 tracks
    if len % TRACK_16 == 0 && len/TRACK_16 >= 35 && len/TRACK_16 <= 40 {
        return Some(Addressing::Sectors { tracks: len/TRACK_16, sectors: 16 });
    }
    if len % BLOCK_SIZE == 0 {
        return Some(Addressing::Blocks(len/BLOCK_SIZE));
    }
    None
}

pub fn prep(buf: &[u8],ext: &str) -> Result<(Dsk,Prepped),DYNERR> {
    if buf.len() > MAX_EXPANDED_SIZE {
        return Err(Box::new(Error::TooLarge));
    }
    let addressing = match addressing_for(buf.len()) {
        Some(a) => a,
        None => {
            debug!("length {} is not a sector image",buf.len());
            return Err(Box::new(Error::UnrecognizedFormat));
        }
    };
    let order = match &addressing {
        Addressing::Sectors { tracks: _, sectors: 16 } => order_from_ext(ext),
        Addressing::Sectors { tracks: _, sectors: _ } => SectorOrder::Physical,
        _ => SectorOrder::ProDos
    };
    trace!("raw image as {:?} with order {}",addressing,order);
    Ok((Dsk {},Prepped::new(buf.to_vec(),addressing,order,PhysicalFormat::Sectors)))
}

pub fn create(params: &CreateParams) -> Result<(Dsk,Prepped),DYNERR> {
    if let Addressing::Nibbles(_) = params.addressing {
        return Err(Box::new(Error::Unsupported));
    }
    let data = vec![0;params.sector_bytes()];
    let order = match &params.addressing {
        Addressing::Blocks(_) => SectorOrder::ProDos,
        _ => params.order
    };
    Ok((Dsk {},Prepped::new(data,params.addressing.clone(),order,PhysicalFormat::Sectors)))
}

impl ImageWrapper for Dsk {
    fn kind(&self) -> WrapperKind {
        WrapperKind::Raw
    }
    fn flush(&mut self,normalized: &[u8]) -> Result<Vec<u8>,DYNERR> {
        Ok(normalized.to_vec())
    }
    fn has_fast_flush(&self) -> bool {
        true
    }
}

#[test]
fn geometry_by_size() {
    assert_eq!(addressing_for(116480),Some(Addressing::Sectors { tracks: 35, sectors: 13 }));
    assert_eq!(addressing_for(143360),Some(Addressing::Sectors { tracks: 35, sectors: 16 }));
    assert_eq!(addressing_for(819200),Some(Addressing::Blocks(1600)));
    assert_eq!(addressing_for(1000),None);
    let (_,p) = prep(&vec![0;143360],"po").unwrap();
    assert_eq!(p.order,SectorOrder::ProDos);
    let (_,p) = prep(&vec![0;143360],"dsk").unwrap();
    assert_eq!(p.order,SectorOrder::Unknown);
}
