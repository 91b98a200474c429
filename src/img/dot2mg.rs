//! ## Support for 2MG disk images
//!
//! This format consists of a header followed by data in either DSK or NIB format.
//! At the end of the data there can be a comment and creator information, which
//! are kept and written back when the image is saved.

use std::io::Cursor;
use binrw::{binrw,BinRead,BinWrite};
use log::{warn,debug,info,error};
use super::{Addressing,SectorOrder,PhysicalFormat,Prepped,CreateParams,ImageWrapper,WrapperKind,NibbleLayout,Error};
use super::nibble::NibbleFormat;
use super::nib::TRACK_BYTE_CAPACITY_NIB;
use crate::DYNERR;

const MAGIC: [u8;4] = *b"2IMG";
const CREATOR: [u8;4] = *b"DIMG";
const HEADER_LEN: usize = 64;
const BLOCK_SIZE: usize = 512;
const DOS_LEN: usize = 143360;
const FLAG_LOCKED: u32 = 0x8000_0000;
const FLAG_VOLUME: u32 = 0x100;

pub fn file_extensions() -> Vec<String> {
    vec!["2mg".to_string(),"2img".to_string()]
}

// all header entries are LE numbers
#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct Header {
    magic: [u8;4],
    creator_id: [u8;4],
    header_len: u16,
    version: u16,
    /// 0=DO, 1=PO, 2=nib
    img_fmt: u32,
    /// bits 0-7=volume if bit 8, write protected if bit 31
    flags: u32,
    blocks: u32,
    data_offset: u32,
    data_len: u32,
    comment_offset: u32,
    comment_len: u32,
    creator_offset: u32,
    creator_len: u32,
    pad: [u8;16]
}

pub struct Dot2mg {
    header: Header,
    comment: Vec<u8>,
    creator_info: Vec<u8>
}

pub fn test(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN && buf[0..4] == MAGIC
}

/// Optional chunk that follows the data, ignored if it runs past the end
fn chunk(buf: &[u8],offset: u32,len: u32,what: &str) -> Vec<u8> {
    let (offset,len) = (offset as usize,len as usize);
    if len == 0 {
        return Vec::new();
    }
    if offset + len > buf.len() {
        warn!("end of {} {} runs past EOF, ignoring",what,offset+len);
        return Vec::new();
    }
    debug!("2MG {}: {}",what,String::from_utf8_lossy(&buf[offset..offset+len]));
    buf[offset..offset+len].to_vec()
}

pub fn prep(buf: &[u8]) -> Result<(Dot2mg,Prepped),DYNERR> {
    let header = Header::read(&mut Cursor::new(&buf[0..HEADER_LEN]))?;
    if header.magic != MAGIC {
        return Err(Box::new(Error::UnrecognizedFormat));
    }
    if header.header_len as usize != HEADER_LEN {
        warn!("unexpected 2MG header length {}",header.header_len);
    }
    if header.version != 1 {
        warn!("unexpected 2MG version {}",header.version);
    }
    let offset = header.data_offset as usize;
    let mut len = header.data_len as usize;
    if header.img_fmt == 1 && len == 0 {
        // some writers leave this zero for block images
        len = header.blocks as usize * BLOCK_SIZE;
    }
    if offset + len > buf.len() {
        error!("end of data {} runs past EOF",offset+len);
        return Err(Box::new(Error::ImageSizeMismatch));
    }
    let data = buf[offset..offset+len].to_vec();
    let (addressing,order,phys) = match header.img_fmt {
        0 => {
            info!("2MG flagged as DOS ordered");
            if len % (16*256) != 0 {
                return Err(Box::new(Error::ImageSizeMismatch));
            }
            (Addressing::Sectors { tracks: len/(16*256), sectors: 16 },SectorOrder::Dos,PhysicalFormat::Sectors)
        },
        1 => {
            info!("2MG flagged as ProDOS ordered");
            if header.blocks as usize * BLOCK_SIZE != len {
                error!("2MG block count does not match data size");
                return Err(Box::new(Error::ImageSizeMismatch));
            }
            if len == DOS_LEN {
                (Addressing::Sectors { tracks: 35, sectors: 16 },SectorOrder::ProDos,PhysicalFormat::Sectors)
            } else {
                (Addressing::Blocks(len/BLOCK_SIZE),SectorOrder::ProDos,PhysicalFormat::Sectors)
            }
        },
        2 => {
            info!("2MG flagged as nibbles");
            if len % TRACK_BYTE_CAPACITY_NIB != 0 || len == 0 {
                return Err(Box::new(Error::ImageSizeMismatch));
            }
            let tracks = len / TRACK_BYTE_CAPACITY_NIB;
            let format = match super::sniff_nibble_format(&data[0..TRACK_BYTE_CAPACITY_NIB],0) {
                Some((f,_)) => f,
                None => NibbleFormat::Dos33
            };
            (Addressing::Nibbles(NibbleLayout::fixed(format,tracks,TRACK_BYTE_CAPACITY_NIB)),SectorOrder::Physical,PhysicalFormat::Nib525_6656)
        },
        fmt => {
            error!("illegal 2MG format {}",fmt);
            return Err(Box::new(Error::UnrecognizedFormat));
        }
    };
    let comment = chunk(buf,header.comment_offset,header.comment_len,"comment");
    let creator_info = chunk(buf,header.creator_offset,header.creator_len,"creator info");
    let mut prepped = Prepped::new(data,addressing,order,phys);
    if header.flags & FLAG_VOLUME > 0 {
        prepped.volume = Some((header.flags & 0xff) as u8);
    }
    if header.flags & FLAG_LOCKED > 0 {
        info!("2MG is write protected");
        prepped.read_only = true;
    }
    Ok((Dot2mg { header, comment, creator_info },prepped))
}

pub fn create(params: &CreateParams) -> Result<(Dot2mg,Prepped),DYNERR> {
    let now = chrono::Local::now().naive_local();
    let creator_info = format!("diskimg v{} {}",env!("CARGO_PKG_VERSION"),now.format("%d-%m-%Y %H:%M:%S"));
    let (fmt,data,order,phys) = match (&params.addressing,params.phys) {
        (Addressing::Sectors { tracks: 35, sectors: 16 },PhysicalFormat::Nib525_6656) => {
            let vol = params.volume.unwrap_or(254);
            let data = super::blank_nibble_tracks(NibbleFormat::Dos33,35,TRACK_BYTE_CAPACITY_NIB,vol)?;
            (2,data,SectorOrder::Physical,PhysicalFormat::Nib525_6656)
        },
        (Addressing::Sectors { tracks: _, sectors: 16 },PhysicalFormat::Sectors) => {
            let fmt = match params.order { SectorOrder::ProDos => 1, _ => 0 };
            let order = match fmt { 1 => SectorOrder::ProDos, _ => SectorOrder::Dos };
            (fmt,vec![0;params.sector_bytes()],order,PhysicalFormat::Sectors)
        },
        (Addressing::Blocks(_),PhysicalFormat::Sectors) => (1,vec![0;params.sector_bytes()],SectorOrder::ProDos,PhysicalFormat::Sectors),
        _ => {
            error!("2MG cannot hold the requested geometry");
            return Err(Box::new(Error::ImageSizeMismatch));
        }
    };
    let addressing = match fmt {
        2 => Addressing::Nibbles(NibbleLayout::fixed(NibbleFormat::Dos33,35,TRACK_BYTE_CAPACITY_NIB)),
        _ => params.addressing.clone()
    };
    let flags = match params.volume {
        Some(v) => FLAG_VOLUME | v as u32,
        None => 0
    };
    let header = Header {
        magic: MAGIC,
        creator_id: CREATOR,
        header_len: HEADER_LEN as u16,
        version: 1,
        img_fmt: fmt,
        flags,
        blocks: (params.sector_bytes() / BLOCK_SIZE) as u32,
        data_offset: HEADER_LEN as u32,
        data_len: data.len() as u32,
        comment_offset: 0,
        comment_len: 0,
        creator_offset: 0,
        creator_len: 0,
        pad: [0;16]
    };
    let mut prepped = Prepped::new(data,addressing,order,phys);
    prepped.volume = params.volume;
    Ok((Dot2mg { header, comment: Vec::new(), creator_info: creator_info.into_bytes() },prepped))
}

impl Dot2mg {
    pub fn comment(&self) -> String {
        String::from_utf8_lossy(&self.comment).to_string()
    }
    pub fn creator_info(&self) -> String {
        String::from_utf8_lossy(&self.creator_info).to_string()
    }
}

impl ImageWrapper for Dot2mg {
    fn kind(&self) -> WrapperKind {
        WrapperKind::Dot2mg
    }
    fn flush(&mut self,normalized: &[u8]) -> Result<Vec<u8>,DYNERR> {
        let buf_len = normalized.len() as u32;
        let rem_len = self.comment.len() as u32;
        let cre_len = self.creator_info.len() as u32;
        self.header.header_len = HEADER_LEN as u16;
        self.header.data_offset = HEADER_LEN as u32;
        self.header.data_len = buf_len;
        self.header.comment_offset = match rem_len { 0 => 0, _ => HEADER_LEN as u32 + buf_len };
        self.header.comment_len = rem_len;
        self.header.creator_offset = match cre_len { 0 => 0, _ => HEADER_LEN as u32 + buf_len + rem_len };
        self.header.creator_len = cre_len;
        let mut curs = Cursor::new(Vec::new());
        self.header.write(&mut curs)?;
        let mut ans = curs.into_inner();
        ans.extend_from_slice(normalized);
        ans.extend_from_slice(&self.comment);
        ans.extend_from_slice(&self.creator_info);
        Ok(ans)
    }
    fn has_fast_flush(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn comment_survives_flush() {
        let (mut w,p) = create(&CreateParams::blocks(280)).unwrap();
        w.comment = b"hello".to_vec();
        let bytes = w.flush(&p.data).unwrap();
        assert!(test(&bytes));
        let (back,pb) = prep(&bytes).unwrap();
        assert_eq!(back.comment(),"hello");
        assert!(back.creator_info().starts_with("diskimg"));
        assert_eq!(pb.addressing,Addressing::Blocks(280));
        assert!(!pb.read_only);
    }

    #[test]
    fn locked_flag() {
        let (mut w,p) = create(&CreateParams::dos_525(SectorOrder::Dos)).unwrap();
        w.header.flags = FLAG_LOCKED | FLAG_VOLUME | 7;
        let bytes = w.flush(&p.data).unwrap();
        let (_,pb) = prep(&bytes).unwrap();
        assert!(pb.read_only);
        assert_eq!(pb.volume,Some(7));
        assert_eq!(pb.order,SectorOrder::Dos);
    }
}
