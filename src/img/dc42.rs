//! ## Support for DiskCopy 4.2 images
//!
//! An 84 byte big endian header, then the 512 byte blocks, then the 12 byte sector tags.
//! The header carries a checksum of the data and of the tags.  A checksum that does not
//! match leaves the image readable but marks it damaged, which prevents writing.

use std::io::Cursor;
use binrw::{binrw,BinRead,BinWrite};
use log::{warn,debug,info};
use super::{Addressing,SectorOrder,PhysicalFormat,Prepped,CreateParams,ImageWrapper,WrapperKind,Error};
use crate::DYNERR;

const HEADER_LEN: usize = 84;
const BLOCK_SIZE: usize = 512;
const TAG_SIZE: usize = 12;
const PRIVATE: u16 = 0x0100;

pub fn file_extensions() -> Vec<String> {
    vec!["dc".to_string(),"dc42".to_string(),"image".to_string()]
}

#[binrw]
#[brw(big)]
#[derive(Clone,Debug)]
pub struct Header {
    /// pascal string
    name: [u8;64],
    data_size: u32,
    tag_size: u32,
    data_checksum: u32,
    tag_checksum: u32,
    /// 0=400K, 1=800K, 2=720K, 3=1440K
    disk_format: u8,
    /// 0x12 for 400K, 0x22 for 800K Apple II, 0x24 for 800K Apple IIgs
    format_byte: u8,
    private: u16
}

pub struct DiskCopy42 {
    header: Header,
    tags: Vec<u8>
}

/// DiskCopy checksum: add each big endian word and rotate right
pub fn checksum(dat: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for pair in dat.chunks(2) {
        let word = match pair.len() {
            2 => u16::from_be_bytes([pair[0],pair[1]]),
            _ => (pair[0] as u16) << 8
        };
        sum = sum.wrapping_add(word as u32).rotate_right(1);
    }
    sum
}

fn tag_checksum(tags: &[u8]) -> u32 {
    match tags.len() > TAG_SIZE {
        true => checksum(&tags[TAG_SIZE..]),
        false => 0
    }
}

fn format_codes(blocks: usize) -> Option<(u8,u8)> {
    match blocks {
        800 => Some((0,0x12)),
        1600 => Some((1,0x22)),
        1440 => Some((2,0x22)),
        2880 => Some((3,0x22)),
        _ => None
    }
}

pub fn test(buf: &[u8]) -> bool {
    if buf.len() < HEADER_LEN + BLOCK_SIZE {
        return false;
    }
    let name_len = buf[0] as usize;
    let data_size = u32::from_be_bytes([buf[64],buf[65],buf[66],buf[67]]) as usize;
    let tag_size = u32::from_be_bytes([buf[68],buf[69],buf[70],buf[71]]) as usize;
    let private = u16::from_be_bytes([buf[82],buf[83]]);
    name_len < 64 && private == PRIVATE && data_size % BLOCK_SIZE == 0 && data_size > 0
        && HEADER_LEN + data_size + tag_size == buf.len()
}

pub fn prep(buf: &[u8]) -> Result<(DiskCopy42,Prepped),DYNERR> {
    if !test(buf) {
        return Err(Box::new(Error::UnrecognizedFormat));
    }
    let header = Header::read(&mut Cursor::new(&buf[0..HEADER_LEN]))?;
    let data_end = HEADER_LEN + header.data_size as usize;
    let data = buf[HEADER_LEN..data_end].to_vec();
    let tags = buf[data_end..].to_vec();
    let name_len = header.name[0] as usize;
    info!("DiskCopy image `{}`",String::from_utf8_lossy(&header.name[1..1+name_len]));
    let mut prepped = Prepped::new(data,Addressing::Blocks(header.data_size as usize/BLOCK_SIZE),SectorOrder::ProDos,PhysicalFormat::Sectors);
    let actual = checksum(&prepped.data);
    if actual != header.data_checksum {
        warn!("DiskCopy data checksum mismatch, expected {:08X} got {:08X}",header.data_checksum,actual);
        prepped.damaged = true;
        prepped.read_only = true;
    }
    let actual = tag_checksum(&tags);
    if actual != header.tag_checksum {
        warn!("DiskCopy tag checksum mismatch, expected {:08X} got {:08X}",header.tag_checksum,actual);
        prepped.damaged = true;
        prepped.read_only = true;
    }
    if format_codes(header.data_size as usize/BLOCK_SIZE).is_none() {
        debug!("DiskCopy with nonstandard size {}",header.data_size);
    }
    Ok((DiskCopy42 { header, tags },prepped))
}

pub fn create(params: &CreateParams) -> Result<(DiskCopy42,Prepped),DYNERR> {
    let blocks = match params.addressing {
        Addressing::Blocks(n) => n,
        _ => return Err(Box::new(Error::ImageSizeMismatch))
    };
    let (disk_format,format_byte) = match format_codes(blocks) {
        Some(c) => c,
        None => return Err(Box::new(Error::ImageSizeMismatch))
    };
    let mut name = [0;64];
    let label = b"-not a Macintosh disk-";
    name[0] = label.len() as u8;
    name[1..1+label.len()].copy_from_slice(label);
    let header = Header {
        name,
        data_size: (blocks*BLOCK_SIZE) as u32,
        tag_size: 0,
        data_checksum: 0,
        tag_checksum: 0,
        disk_format,
        format_byte,
        private: PRIVATE
    };
    Ok((DiskCopy42 { header, tags: Vec::new() },Prepped::new(vec![0;blocks*BLOCK_SIZE],params.addressing.clone(),SectorOrder::ProDos,PhysicalFormat::Sectors)))
}

impl ImageWrapper for DiskCopy42 {
    fn kind(&self) -> WrapperKind {
        WrapperKind::DiskCopy42
    }
    fn flush(&mut self,normalized: &[u8]) -> Result<Vec<u8>,DYNERR> {
        self.header.data_size = normalized.len() as u32;
        self.header.tag_size = self.tags.len() as u32;
        self.header.data_checksum = checksum(normalized);
        self.header.tag_checksum = tag_checksum(&self.tags);
        let mut curs = Cursor::new(Vec::new());
        self.header.write(&mut curs)?;
        let mut ans = curs.into_inner();
        ans.extend_from_slice(normalized);
        ans.extend_from_slice(&self.tags);
        Ok(ans)
    }
    fn has_fast_flush(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn checksum_rotates() {
        assert_eq!(checksum(&[0,1]),0x8000_0000);
        assert_eq!(checksum(&[0,1,0,1]),0x4000_0000 + 0x8000_0000);
    }

    #[test]
    fn damaged_on_mismatch() {
        let (mut w,mut p) = create(&CreateParams::blocks(1600)).unwrap();
        p.data[1000] = 0x55;
        let mut bytes = w.flush(&p.data).unwrap();
        assert!(test(&bytes));
        let (_,good) = prep(&bytes).unwrap();
        assert!(!good.damaged);
        assert_eq!(good.data,p.data);
        bytes[HEADER_LEN+2000] ^= 1;
        let (_,bad) = prep(&bytes).unwrap();
        assert!(bad.damaged);
        assert!(bad.read_only);
    }
}
