//! ## Support for disk images held in a NuFX archive
//!
//! Only the part of NuFX needed to read and write one disk image thread is here.
//! The archive is a master header followed by records; each record has a header,
//! a list of 16 byte thread headers, and the thread data.  We take the first record
//! that carries a disk image thread (class 2, kind 1) and keep the rest of the archive
//! byte for byte so it can be written back around the updated record.
//!
//! Threads that are compressed are handed to a `ThreadCodec`.  No codec is built in,
//! so a compressed disk thread fails with `Unsupported` unless the caller supplies one.

use std::io::Cursor;
use binrw::{binrw,BinRead,BinWrite};
use log::{warn,debug,info,error};
use super::{Addressing,SectorOrder,PhysicalFormat,Prepped,CreateParams,ImageWrapper,WrapperKind,Error};
use crate::DYNERR;

const MASTER_ID: [u8;6] = [0x4e,0xf5,0x46,0xe9,0x6c,0xe5];
const RECORD_ID: [u8;4] = [0x4e,0xf5,0x46,0xd8];
const MASTER_LEN: usize = 48;
const ATTRIB_COUNT: u16 = 58;
const THREAD_HEADER_LEN: usize = 16;
const RECORD_VERSION: u16 = 3;
const CLASS_DATA: u16 = 2;
const CLASS_FILENAME: u16 = 3;
const KIND_DISK: u16 = 1;
const FORMAT_UNCOMPRESSED: u16 = 0;
const BLOCK_SIZE: usize = 512;
const DISK_NAME: &str = "DISK";

pub fn file_extensions() -> Vec<String> {
    vec!["sdk".to_string(),"shk".to_string(),"bxy".to_string()]
}

/// Expands (and optionally compresses) the thread formats that are not stored plainly
pub trait ThreadCodec {
    /// thread format code handled, e.g. 2 for LZW/1
    fn format(&self) -> u16;
    /// expand compressed thread data to `eof` bytes
    fn expand(&self,compressed: &[u8],eof: usize) -> Result<Vec<u8>,DYNERR>;
}

/// CRC-16/XMODEM as used throughout NuFX
pub fn crc16(seed: u16,dat: &[u8]) -> u16 {
    let mut crc = seed;
    for b in dat {
        crc ^= (*b as u16) << 8;
        for _i in 0..8 {
            crc = match crc & 0x8000 {
                0 => crc << 1,
                _ => (crc << 1) ^ 0x1021
            };
        }
    }
    crc
}

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
struct MasterHeader {
    id: [u8;6],
    crc: u16,
    total_records: u32,
    created: [u8;8],
    modified: [u8;8],
    version: u16,
    reserved1: [u8;8],
    eof: u32,
    reserved2: [u8;6]
}

/// Record header through the filename length, attribute count 58
#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
struct RecordHeader {
    id: [u8;4],
    crc: u16,
    attrib_count: u16,
    version: u16,
    total_threads: u32,
    file_sys_id: u16,
    file_sys_info: u16,
    access: u32,
    file_type: u32,
    extra_type: u32,
    storage_type: u16,
    created: [u8;8],
    modified: [u8;8],
    archived: [u8;8],
    filename_len: u16
}

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
struct ThreadHeader {
    class: u16,
    format: u16,
    kind: u16,
    crc: u16,
    eof: u32,
    comp_eof: u32
}

pub struct NuFX {
    master: MasterHeader,
    /// archive bytes from the end of the master header up to our record
    before: Vec<u8>,
    record: RecordHeader,
    /// filename stored in the record header, if any
    record_extra: Vec<u8>,
    /// threads other than the disk thread, header and data
    others: Vec<(ThreadHeader,Vec<u8>)>,
    after: Vec<u8>
}

/// NuFX date-time, pass None for all zeros
fn nufx_time(t: Option<chrono::NaiveDateTime>) -> [u8;8] {
    use chrono::{Datelike,Timelike};
    match t {
        Some(t) => [t.second() as u8,t.minute() as u8,t.hour() as u8,(t.year()-1900) as u8,
            t.day0() as u8,t.month0() as u8,0,t.weekday().number_from_sunday() as u8],
        None => [0;8]
    }
}

pub fn test(buf: &[u8]) -> bool {
    buf.len() >= MASTER_LEN + 4 && buf[0..6] == MASTER_ID && buf[MASTER_LEN..MASTER_LEN+4] == RECORD_ID
}

/// Parse one record at `ptr`, returning the record header, extra attribute bytes,
/// thread headers with their data, and the offset past the record.
fn parse_record(buf: &[u8],ptr: usize) -> Result<(RecordHeader,Vec<u8>,Vec<(ThreadHeader,Vec<u8>)>,usize),DYNERR> {
    if ptr + ATTRIB_COUNT as usize > buf.len() {
        return Err(Box::new(Error::Corrupt));
    }
    let mut curs = Cursor::new(&buf[ptr..]);
    let record = RecordHeader::read(&mut curs)?;
    if record.id != RECORD_ID || record.attrib_count != ATTRIB_COUNT {
        debug!("bad NuFX record header at {}",ptr);
        return Err(Box::new(Error::Corrupt));
    }
    let extra_start = ptr + ATTRIB_COUNT as usize;
    let extra_end = extra_start + record.filename_len as usize;
    let thread_start = extra_end;
    let thread_end = thread_start + record.total_threads as usize * THREAD_HEADER_LEN;
    if thread_end > buf.len() {
        return Err(Box::new(Error::Corrupt));
    }
    let actual = crc16(0,&buf[ptr+6..thread_end]);
    if actual != record.crc {
        warn!("NuFX record header CRC mismatch");
        return Err(Box::new(Error::Corrupt));
    }
    let mut threads = Vec::new();
    let mut data_ptr = thread_end;
    for i in 0..record.total_threads as usize {
        let off = thread_start + i*THREAD_HEADER_LEN;
        let th = ThreadHeader::read(&mut Cursor::new(&buf[off..off+THREAD_HEADER_LEN]))?;
        let end = data_ptr + th.comp_eof as usize;
        if end > buf.len() {
            error!("NuFX thread data runs past EOF");
            return Err(Box::new(Error::Corrupt));
        }
        threads.push((th,buf[data_ptr..end].to_vec()));
        data_ptr = end;
    }
    Ok((record,buf[extra_start..extra_end].to_vec(),threads,data_ptr))
}

pub fn prep(buf: &[u8],codec: Option<&dyn ThreadCodec>) -> Result<(NuFX,Prepped),DYNERR> {
    if !test(buf) {
        return Err(Box::new(Error::UnrecognizedFormat));
    }
    let master = MasterHeader::read(&mut Cursor::new(&buf[0..MASTER_LEN]))?;
    if crc16(0,&buf[8..MASTER_LEN]) != master.crc {
        warn!("NuFX master header CRC mismatch");
        return Err(Box::new(Error::Corrupt));
    }
    let mut ptr = MASTER_LEN;
    for _rec in 0..master.total_records {
        let (record,record_extra,threads,end) = parse_record(buf,ptr)?;
        let disk_idx = threads.iter().position(|(th,_)| th.class==CLASS_DATA && th.kind==KIND_DISK);
        let idx = match disk_idx {
            Some(i) => i,
            None => {
                ptr = end;
                continue;
            }
        };
        let (th,stored) = &threads[idx];
        let eof = record.extra_type as usize * record.storage_type as usize;
        let data = match (th.format,codec) {
            (FORMAT_UNCOMPRESSED,_) => stored.clone(),
            (fmt,Some(c)) if c.format()==fmt => c.expand(stored,eof)?,
            (fmt,_) => {
                error!("NuFX disk thread uses format {} and no codec is available",fmt);
                return Err(Box::new(Error::Unsupported));
            }
        };
        if data.len() != eof || record.storage_type as usize != BLOCK_SIZE {
            error!("NuFX disk thread length {} does not match {} blocks",data.len(),record.extra_type);
            return Err(Box::new(Error::ImageSizeMismatch));
        }
        let mut damaged = false;
        if record.version >= 3 && crc16(0xffff,&data) != th.crc {
            warn!("NuFX disk thread CRC mismatch");
            damaged = true;
        }
        info!("NuFX disk image of {} blocks",record.extra_type);
        let others = threads.iter().enumerate().filter(|(i,_)| *i!=idx).map(|(_,t)| t.clone()).collect();
        let blocks = data.len() / BLOCK_SIZE;
        let addressing = match blocks {
            280 => Addressing::Sectors { tracks: 35, sectors: 16 },
            n => Addressing::Blocks(n)
        };
        let mut prepped = Prepped::new(data,addressing,SectorOrder::ProDos,PhysicalFormat::Sectors);
        prepped.damaged = damaged;
        prepped.read_only = damaged;
        let wrapper = NuFX {
            master,
            before: buf[MASTER_LEN..ptr].to_vec(),
            record,
            record_extra,
            others,
            after: buf[end..].to_vec()
        };
        return Ok((wrapper,prepped));
    }
    debug!("NuFX archive has no disk image thread");
    Err(Box::new(Error::UnrecognizedFormat))
}

pub fn create(params: &CreateParams) -> Result<(NuFX,Prepped),DYNERR> {
    let bytes = params.sector_bytes();
    if let Addressing::Nibbles(_) = params.addressing {
        return Err(Box::new(Error::Unsupported));
    }
    if bytes % BLOCK_SIZE != 0 {
        return Err(Box::new(Error::ImageSizeMismatch));
    }
    let now = nufx_time(Some(chrono::Local::now().naive_local()));
    let master = MasterHeader {
        id: MASTER_ID,
        crc: 0,
        total_records: 1,
        created: now,
        modified: now,
        version: 2,
        reserved1: [0;8],
        eof: 0,
        reserved2: [0;6]
    };
    let record = RecordHeader {
        id: RECORD_ID,
        crc: 0,
        attrib_count: ATTRIB_COUNT,
        version: RECORD_VERSION,
        total_threads: 2,
        file_sys_id: 1,
        file_sys_info: 0x2f,
        access: 0xe3,
        file_type: 0,
        extra_type: (bytes/BLOCK_SIZE) as u32,
        storage_type: BLOCK_SIZE as u16,
        created: now,
        modified: now,
        archived: now,
        filename_len: 0
    };
    let name = ThreadHeader { class: CLASS_FILENAME, format: 0, kind: 0, crc: 0, eof: DISK_NAME.len() as u32, comp_eof: DISK_NAME.len() as u32 };
    let wrapper = NuFX {
        master,
        before: Vec::new(),
        record,
        record_extra: Vec::new(),
        others: vec![(name,DISK_NAME.as_bytes().to_vec())],
        after: Vec::new()
    };
    let addressing = match params.addressing {
        Addressing::Sectors { tracks: 35, sectors: 16 } => params.addressing.clone(),
        _ => Addressing::Blocks(bytes/BLOCK_SIZE)
    };
    Ok((wrapper,Prepped::new(vec![0;bytes],addressing,SectorOrder::ProDos,PhysicalFormat::Sectors)))
}

impl ImageWrapper for NuFX {
    fn kind(&self) -> WrapperKind {
        WrapperKind::NuFX
    }
    fn flush(&mut self,normalized: &[u8]) -> Result<Vec<u8>,DYNERR> {
        let disk = ThreadHeader {
            class: CLASS_DATA,
            format: FORMAT_UNCOMPRESSED,
            kind: KIND_DISK,
            crc: crc16(0xffff,normalized),
            eof: normalized.len() as u32,
            comp_eof: normalized.len() as u32
        };
        let mut threads = self.others.clone();
        threads.push((disk,normalized.to_vec()));
        self.record.total_threads = threads.len() as u32;
        self.record.extra_type = (normalized.len() / BLOCK_SIZE) as u32;
        self.record.storage_type = BLOCK_SIZE as u16;
        self.record.attrib_count = ATTRIB_COUNT;
        self.record.filename_len = self.record_extra.len() as u16;
        // build the record with a zero CRC, then patch it
        let mut curs = Cursor::new(Vec::new());
        self.record.write(&mut curs)?;
        let mut rec = curs.into_inner();
        rec.extend_from_slice(&self.record_extra);
        for (th,_) in &threads {
            let mut curs = Cursor::new(Vec::new());
            th.write(&mut curs)?;
            rec.append(&mut curs.into_inner());
        }
        let crc = crc16(0,&rec[6..]);
        self.record.crc = crc;
        rec[4..6].copy_from_slice(&u16::to_le_bytes(crc));
        for (_,dat) in &threads {
            rec.extend_from_slice(dat);
        }
        let mut ans: Vec<u8> = Vec::new();
        ans.extend_from_slice(&[0;MASTER_LEN]);
        ans.extend_from_slice(&self.before);
        ans.append(&mut rec);
        ans.extend_from_slice(&self.after);
        self.master.eof = ans.len() as u32;
        let mut curs = Cursor::new(Vec::new());
        self.master.write(&mut curs)?;
        let mut master = curs.into_inner();
        let crc = crc16(0,&master[8..MASTER_LEN]);
        self.master.crc = crc;
        master[6..8].copy_from_slice(&u16::to_le_bytes(crc));
        ans[0..MASTER_LEN].copy_from_slice(&master);
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
    fn xmodem_check_value() {
        assert_eq!(crc16(0,b"123456789"),0x31c3);
    }

    #[test]
    fn disk_thread_round_trip() {
        let (mut w,mut p) = create(&CreateParams::blocks(1600)).unwrap();
        p.data[512*3] = 0x77;
        let bytes = w.flush(&p.data).unwrap();
        assert!(test(&bytes));
        let (mut w2,back) = prep(&bytes,None).unwrap();
        assert_eq!(back.data,p.data);
        assert!(!back.damaged);
        assert_eq!(w2.flush(&back.data).unwrap(),bytes);
    }

    #[test]
    fn thread_crc_damage() {
        let (mut w,p) = create(&CreateParams::blocks(280)).unwrap();
        let mut bytes = w.flush(&p.data).unwrap();
        let n = bytes.len();
        bytes[n-1] ^= 0xff;
        let (_,back) = prep(&bytes,None).unwrap();
        assert!(back.damaged);
    }
}
