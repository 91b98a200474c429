//! ## Support for Sim //e hard drive images
//!
//! A 32 byte header beginning with `SIMSYSTEM_HDV` and padded with zeros,
//! followed by ProDOS ordered blocks.

use log::debug;
use super::{Addressing,SectorOrder,PhysicalFormat,Prepped,CreateParams,ImageWrapper,WrapperKind,Error};
use crate::DYNERR;

const MAGIC: &[u8;13] = b"SIMSYSTEM_HDV";
const HEADER_LEN: usize = 32;
const BLOCK_SIZE: usize = 512;

pub fn file_extensions() -> Vec<String> {
    vec!["hdv".to_string()]
}

pub struct Sim2e {
    header: Vec<u8>
}

pub fn test(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN + BLOCK_SIZE && &buf[0..MAGIC.len()] == MAGIC
}

pub fn prep(buf: &[u8]) -> Result<(Sim2e,Prepped),DYNERR> {
    if !test(buf) {
        return Err(Box::new(Error::UnrecognizedFormat));
    }
    let data = &buf[HEADER_LEN..];
    if data.len() % BLOCK_SIZE != 0 {
        debug!("Sim //e data length {} is not whole blocks",data.len());
        return Err(Box::new(Error::ImageSizeMismatch));
    }
    let prepped = Prepped::new(data.to_vec(),Addressing::Blocks(data.len()/BLOCK_SIZE),SectorOrder::ProDos,PhysicalFormat::Sectors);
    Ok((Sim2e { header: buf[0..HEADER_LEN].to_vec() },prepped))
}

pub fn create(params: &CreateParams) -> Result<(Sim2e,Prepped),DYNERR> {
    let blocks = match params.addressing {
        Addressing::Blocks(n) => n,
        _ => return Err(Box::new(Error::Unsupported))
    };
    let mut header = MAGIC.to_vec();
    header.resize(HEADER_LEN,0);
    Ok((Sim2e { header },Prepped::new(vec![0;blocks*BLOCK_SIZE],Addressing::Blocks(blocks),SectorOrder::ProDos,PhysicalFormat::Sectors)))
}

impl ImageWrapper for Sim2e {
    fn kind(&self) -> WrapperKind {
        WrapperKind::Sim2e
    }
    fn flush(&mut self,normalized: &[u8]) -> Result<Vec<u8>,DYNERR> {
        Ok([self.header.as_slice(),normalized].concat())
    }
    fn has_fast_flush(&self) -> bool {
        true
    }
}

#[test]
fn header_kept() {
    let (mut w,p) = create(&CreateParams::blocks(16)).unwrap();
    let bytes = w.flush(&p.data).unwrap();
    assert_eq!(bytes.len(),32 + 16*512);
    assert!(test(&bytes));
    let (_,back) = prep(&bytes).unwrap();
    assert_eq!(back.addressing,Addressing::Blocks(16));
}
