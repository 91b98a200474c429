//! ## Support for FDI flux images
//!
//! FDI records each track either as raw bit cells or as a list of pulse durations.
//! Pulse lists may be Huffman compressed.  We rebuild the bit cells from the average
//! pulse durations, shift them into nibbles, and then hand the nibbles to the usual
//! GCR decoders.
//! * 5.25 inch disks become variable length nibble tracks
//! * 3.5 inch disks are decoded all the way to 512 byte blocks, missing sectors go into
//!   the bad block map
//!
//! FDI images are read only.

use std::io::Cursor;
use binrw::{binrw,BinRead};
use bit_vec::BitVec;
use log::{debug,trace,info,warn};
use super::{Addressing,SectorOrder,PhysicalFormat,Prepped,ImageWrapper,WrapperKind,NibbleLayout,Error};
use super::nibble::{self,NibbleFormat};
use crate::bios::skew;
use crate::bits::get_bits;
use crate::fs::usage::LinearBitmap;
use crate::DYNERR;

const SIGNATURE: &[u8;27] = b"Formatted Disk Image file\r\n";
const HEADER_LEN: usize = 512;
const DESCRIPTOR_OFFSET: usize = 0x98;
const MAX_DESCRIPTORS: usize = (HEADER_LEN - DESCRIPTOR_OFFSET)/2;
const MAX_PULSES: usize = 1 << 20;
const MAX_CELLS_PER_PULSE: usize = 64;
const MAX_SUBSTREAMS: usize = 32;
const MAX_TREE_DEPTH: usize = 32;
const MAX_525_TRACKS: usize = 40;
/// bit cells in one revolution of a 5.25 inch disk
const CELLS_525: usize = 50000;
/// bit cells in one revolution of a 3.5 inch disk, by speed zone
const CELLS_35: [usize;5] = [76142,69930,63559,57142,50847];
const BLOCK_SIZE: usize = 512;

pub const DISK_TYPE_525: u8 = 1;
pub const DISK_TYPE_35: u8 = 2;

pub fn file_extensions() -> Vec<String> {
    vec!["fdi".to_string()]
}

#[binrw]
#[brw(big)]
#[derive(Clone,Debug)]
pub struct Header {
    signature: [u8;27],
    creator: [u8;30],
    crlf: [u8;2],
    comment: [u8;80],
    eof: u8,
    version: u16,
    last_track: u16,
    last_head: u8,
    disk_type: u8,
    rotation: u8,
    flags: u8,
    tpi: u8,
    head_width: u8,
    reserved: u16
}

/// Decoded pulse streams of one track
pub struct PulseTrack {
    pub avg: Vec<u32>,
    pub min: Vec<u32>,
    pub max: Vec<u32>,
    pub index: Vec<u32>
}

pub struct Fdi {
    header: Header
}

enum HuffNode {
    Leaf(usize),
    Branch(usize,usize)
}

fn align(bit_offset: &mut usize) {
    *bit_offset = (*bit_offset + 7) / 8 * 8;
}

/// Parse the tree in preorder, `1` is a branch and `0` a leaf.  Returns the node index.
fn parse_tree(buf: &[u8],bit_offset: &mut usize,nodes: &mut Vec<HuffNode>,leaves: &mut usize,depth: usize) -> Result<usize,DYNERR> {
    if depth > MAX_TREE_DEPTH {
        debug!("Huffman tree too deep");
        return Err(Box::new(Error::Corrupt));
    }
    let idx = nodes.len();
    if get_bits(buf,bit_offset,1)? == 0 {
        nodes.push(HuffNode::Leaf(*leaves));
        *leaves += 1;
        return Ok(idx);
    }
    nodes.push(HuffNode::Branch(0,0));
    let left = parse_tree(buf,bit_offset,nodes,leaves,depth+1)?;
    let right = parse_tree(buf,bit_offset,nodes,leaves,depth+1)?;
    nodes[idx] = HuffNode::Branch(left,right);
    Ok(idx)
}

/// Expand a Huffman compressed stream of `count` values.
/// Each sub-stream ORs its values in at its shift; the stream ends with shift 0.
pub fn decode_huffman(buf: &[u8],count: usize) -> Result<Vec<u32>,DYNERR> {
    let mut ans = vec![0u32;count];
    let mut ptr = 0;
    for _sub in 0..MAX_SUBSTREAMS {
        let header = get_bits(buf,&mut ptr,8)?;
        let sign_extend = header & 0x80 > 0;
        let wide = header & 0x40 > 0;
        let shift = header & 0x1f;
        let mut nodes: Vec<HuffNode> = Vec::new();
        let mut leaf_count = 0;
        parse_tree(buf,&mut ptr,&mut nodes,&mut leaf_count,0)?;
        align(&mut ptr);
        let mut leaves: Vec<u32> = Vec::with_capacity(leaf_count);
        for _i in 0..leaf_count {
            let v = match (wide,sign_extend) {
                (true,true) => get_bits(buf,&mut ptr,16)? as u16 as i16 as i32 as u32,
                (true,false) => get_bits(buf,&mut ptr,16)?,
                (false,true) => get_bits(buf,&mut ptr,8)? as u8 as i8 as i32 as u32,
                (false,false) => get_bits(buf,&mut ptr,8)?
            };
            leaves.push(v);
        }
        trace!("Huffman sub-stream shift {} with {} leaves",shift,leaf_count);
        for i in 0..count {
            let mut node = 0;
            loop {
                match nodes[node] {
                    HuffNode::Leaf(l) => {
                        ans[i] |= leaves[l] << shift;
                        break;
                    },
                    HuffNode::Branch(left,right) => {
                        node = match get_bits(buf,&mut ptr,1)? {
                            0 => left,
                            _ => right
                        };
                    }
                }
            }
        }
        align(&mut ptr);
        if shift == 0 {
            return Ok(ans);
        }
    }
    debug!("Huffman stream never reached shift 0");
    Err(Box::new(Error::Corrupt))
}

fn be32(buf: &[u8],off: usize) -> Result<u32,DYNERR> {
    match buf.get(off..off+4) {
        Some(b) => Ok(u32::from_be_bytes([b[0],b[1],b[2],b[3]])),
        None => Err(Box::new(Error::Corrupt))
    }
}

/// Decode the four pulse streams of a pulse track
pub fn decode_pulses(track: &[u8]) -> Result<PulseTrack,DYNERR> {
    let count = be32(track,0)? as usize;
    if count == 0 || count > MAX_PULSES {
        debug!("pulse count {} out of bounds",count);
        return Err(Box::new(Error::Corrupt));
    }
    let mut streams: Vec<Vec<u32>> = Vec::new();
    let mut ptr = 20;
    for i in 0..4 {
        let desc = be32(track,4+i*4)?;
        let compression = desc >> 24;
        let len = (desc & 0xffffff) as usize;
        let dat = match track.get(ptr..ptr+len) {
            Some(d) => d,
            None => return Err(Box::new(Error::Corrupt))
        };
        ptr += len;
        let vals = match (len,compression) {
            (0,_) => Vec::new(),
            (_,0) => {
                if len < count*4 {
                    return Err(Box::new(Error::Corrupt));
                }
                (0..count).map(|j| u32::from_be_bytes([dat[j*4],dat[j*4+1],dat[j*4+2],dat[j*4+3]])).collect()
            },
            (_,1) => decode_huffman(dat,count)?,
            (_,c) => {
                debug!("unknown pulse compression {}",c);
                return Err(Box::new(Error::Unsupported));
            }
        };
        streams.push(vals);
    }
    let index = streams.pop().unwrap_or_default();
    let max = streams.pop().unwrap_or_default();
    let min = streams.pop().unwrap_or_default();
    let avg = streams.pop().unwrap_or_default();
    if avg.len() != count {
        debug!("pulse track has no average stream");
        return Err(Box::new(Error::Corrupt));
    }
    Ok(PulseTrack { avg, min, max, index })
}

/// Turn average pulse durations into bit cells, given the cells in one revolution
pub fn pulses_to_cells(avg: &[u32],nominal_cells: usize) -> Result<BitVec,DYNERR> {
    let total: u64 = avg.iter().map(|x| *x as u64).sum();
    if total == 0 {
        return Err(Box::new(Error::Corrupt));
    }
    let cell = total as f64 / nominal_cells as f64;
    let mut ans = BitVec::new();
    for p in avg {
        let n = ((*p as f64 / cell).round() as usize).clamp(1,MAX_CELLS_PER_PULSE);
        for _i in 1..n {
            ans.push(false);
        }
        ans.push(true);
    }
    Ok(ans)
}

/// Shift bit cells into bytes, a byte is done when its high bit is set
pub fn cells_to_nibbles(cells: &BitVec) -> Vec<u8> {
    let mut ans: Vec<u8> = Vec::new();
    let mut acc: u8 = 0;
    for bit in cells.iter() {
        acc = (acc << 1) | bit as u8;
        if acc & 0x80 > 0 {
            ans.push(acc);
            acc = 0;
        }
    }
    ans
}

pub fn test(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN && &buf[0..SIGNATURE.len()] == SIGNATURE
}

/// Locate each track's data and type, in descriptor order
fn track_table(buf: &[u8],count: usize) -> Result<Vec<(u8,&[u8])>,DYNERR> {
    let mut ans = Vec::new();
    let mut ptr = HEADER_LEN;
    for i in 0..count {
        let typ = buf[DESCRIPTOR_OFFSET + i*2];
        let size = ((((typ & 0x3f) as usize) << 8) | buf[DESCRIPTOR_OFFSET + i*2 + 1] as usize) * 256;
        let dat = match buf.get(ptr..ptr+size) {
            Some(d) => d,
            None => {
                warn!("FDI track {} runs past EOF",i);
                return Err(Box::new(Error::Corrupt));
            }
        };
        ans.push((typ,dat));
        ptr += size;
    }
    Ok(ans)
}

/// Nibbles of one track, None if blank or of a type we do not read
fn track_nibbles(typ: u8,dat: &[u8],nominal_cells: usize) -> Result<Option<Vec<u8>>,DYNERR> {
    match typ {
        0x80..=0xbf => {
            let bit_count = be32(dat,0)? as usize;
            if bit_count > (dat.len()-4)*8 {
                return Err(Box::new(Error::Corrupt));
            }
            let mut cells = BitVec::from_bytes(&dat[4..]);
            cells.truncate(bit_count);
            Ok(Some(cells_to_nibbles(&cells)))
        },
        0xc0..=0xff => {
            let pulses = decode_pulses(dat)?;
            let cells = pulses_to_cells(&pulses.avg,nominal_cells)?;
            Ok(Some(cells_to_nibbles(&cells)))
        },
        0 => Ok(None),
        _ => {
            debug!("FDI track type {:02X} is not handled",typ);
            Ok(None)
        }
    }
}

fn prep_525(header: &Header,tracks: &[(u8,&[u8])]) -> Result<Prepped,DYNERR> {
    let heads = header.last_head as usize + 1;
    // 96 and 192 tpi images hold half and quarter tracks
    let stride = match header.tpi { 2 => 2, 5 => 4, _ => 1 };
    let mut data: Vec<u8> = Vec::new();
    let mut length: Vec<usize> = Vec::new();
    let mut format: Option<(NibbleFormat,u8)> = None;
    for t in 0..MAX_525_TRACKS {
        let idx = t*stride*heads;
        if idx >= tracks.len() {
            break;
        }
        let (typ,dat) = tracks[idx];
        let nibs = track_nibbles(typ,dat,CELLS_525)?.unwrap_or_default();
        if format.is_none() && nibs.len() > 0 {
            format = super::sniff_nibble_format(&nibs,t as u8);
        }
        length.push(nibs.len());
        data.extend_from_slice(&nibs);
    }
    let (format,volume) = match format {
        Some(f) => f,
        None => {
            debug!("no 5.25 inch address fields in FDI");
            return Err(Box::new(Error::UnrecognizedFormat));
        }
    };
    let mut ans = Prepped::new(data,Addressing::Nibbles(NibbleLayout::packed(format,length)),SectorOrder::Physical,PhysicalFormat::Nib525Var);
    ans.volume = Some(volume);
    Ok(ans)
}

fn prep_35(header: &Header,tracks: &[(u8,&[u8])]) -> Result<Prepped,DYNERR> {
    let sides = usize::min(header.last_head as usize + 1,2);
    let blocks = 800*sides;
    let mut data = vec![0;blocks*BLOCK_SIZE];
    let mut found = LinearBitmap::new(blocks);
    for (i,(typ,dat)) in tracks.iter().enumerate() {
        let (track,head) = (i / sides,i % sides);
        if track >= 80 {
            break;
        }
        let nibs = match track_nibbles(*typ,dat,CELLS_35[usize::min(track/16,4)])? {
            Some(n) => n,
            None => continue
        };
        let (sectors,bad) = nibble::decode_track_35(&nibs);
        if bad > 0 {
            warn!("{} bad sectors on track {} side {}",bad,track,head);
        }
        for s in sectors {
            if s.track != track || s.side != head {
                trace!("sector claims track {} side {} but found on {},{}",s.track,s.side,track,head);
                continue;
            }
            if let Ok(block) = skew::block_from_35(s.track,s.side,s.sector,sides) {
                data[block*BLOCK_SIZE..(block+1)*BLOCK_SIZE].copy_from_slice(&s.data);
                found.set(block);
            }
        }
    }
    let mut bad_map = LinearBitmap::new(blocks);
    for b in 0..blocks {
        if !found.is_set(b) {
            bad_map.set(b);
        }
    }
    let missing = bad_map.count_set();
    if missing > 0 {
        warn!("FDI is missing {} blocks",missing);
    }
    let mut ans = Prepped::new(data,Addressing::Blocks(blocks),SectorOrder::ProDos,PhysicalFormat::Sectors);
    if missing > 0 {
        ans.bad_blocks = Some(bad_map);
    }
    Ok(ans)
}

pub fn prep(buf: &[u8]) -> Result<(Fdi,Prepped),DYNERR> {
    if !test(buf) {
        return Err(Box::new(Error::UnrecognizedFormat));
    }
    let header = Header::read(&mut Cursor::new(&buf[0..DESCRIPTOR_OFFSET]))?;
    let count = (header.last_track as usize + 1) * (header.last_head as usize + 1);
    if count > MAX_DESCRIPTORS {
        debug!("FDI claims {} tracks",count);
        return Err(Box::new(Error::Corrupt));
    }
    let tracks = track_table(buf,count)?;
    let mut prepped = match header.disk_type {
        DISK_TYPE_525 => prep_525(&header,&tracks)?,
        DISK_TYPE_35 => prep_35(&header,&tracks)?,
        t => {
            debug!("FDI disk type {} not supported",t);
            return Err(Box::new(Error::Unsupported));
        }
    };
    info!("FDI version {}.{} with {} tracks",header.version >> 8,header.version & 0xff,count);
    prepped.read_only = true;
    Ok((Fdi { header },prepped))
}

impl Fdi {
    pub fn disk_type(&self) -> u8 {
        self.header.disk_type
    }
}

impl ImageWrapper for Fdi {
    fn kind(&self) -> WrapperKind {
        WrapperKind::Fdi
    }
    fn flush(&mut self,_normalized: &[u8]) -> Result<Vec<u8>,DYNERR> {
        Err(Box::new(Error::Unsupported))
    }
    fn has_fast_flush(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bits::put_bits;

    /// Preorder tree over `vals` with balanced splits, returns code of each value
    fn put_tree(buf: &mut Vec<u8>,ptr: &mut usize,vals: &[u32],prefix: (u32,usize),codes: &mut Vec<(u32,(u32,usize))>) {
        if vals.len() == 1 {
            put_bits(buf,ptr,0,1).unwrap();
            codes.push((vals[0],prefix));
            return;
        }
        put_bits(buf,ptr,1,1).unwrap();
        let mid = vals.len()/2;
        put_tree(buf,ptr,&vals[0..mid],(prefix.0 << 1,prefix.1+1),codes);
        put_tree(buf,ptr,&vals[mid..],((prefix.0 << 1) | 1,prefix.1+1),codes);
    }

    fn put_substream(buf: &mut Vec<u8>,ptr: &mut usize,vals: &[u32],shift: u32) {
        put_bits(buf,ptr,shift,8).unwrap();
        let mut distinct = vals.to_vec();
        distinct.sort();
        distinct.dedup();
        let mut codes = Vec::new();
        put_tree(buf,ptr,&distinct,(0,0),&mut codes);
        align(ptr);
        for (v,_) in &codes {
            put_bits(buf,ptr,*v,8).unwrap();
        }
        for v in vals {
            let (_,(code,len)) = codes.iter().find(|(x,_)| x==v).unwrap();
            if *len > 0 {
                put_bits(buf,ptr,*code,*len).unwrap();
            }
        }
        align(ptr);
        buf.resize(*ptr/8,0);
    }

    fn huffman(vals: &[u32]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut ptr = 0;
        let hi: Vec<u32> = vals.iter().map(|v| v >> 8).collect();
        let lo: Vec<u32> = vals.iter().map(|v| v & 0xff).collect();
        put_substream(&mut buf,&mut ptr,&hi,8);
        put_substream(&mut buf,&mut ptr,&lo,0);
        buf
    }

    fn header(disk_type: u8,last_track: u16,last_head: u8) -> Vec<u8> {
        let mut ans = vec![0;HEADER_LEN];
        ans[0..27].copy_from_slice(SIGNATURE);
        ans[0x8b] = 0x1a;
        ans[0x8c..0x8e].copy_from_slice(&[2,1]);
        ans[0x8e..0x90].copy_from_slice(&u16::to_be_bytes(last_track));
        ans[0x90] = last_head;
        ans[0x91] = disk_type;
        ans
    }

    /// pulse durations that reproduce the given nibbles
    fn nibbles_to_pulses(nibs: &[u8],unit: u32) -> Vec<u32> {
        let mut ans = Vec::new();
        let mut cells = 0;
        for n in nibs {
            for i in (0..8).rev() {
                cells += 1;
                if (n >> i) & 1 == 1 {
                    ans.push(cells*unit);
                    cells = 0;
                }
            }
        }
        ans
    }

    fn push_track(img: &mut Vec<u8>,desc: usize,typ: u8,mut dat: Vec<u8>) {
        let units = (dat.len() + 255)/256;
        dat.resize(units*256,0);
        img[DESCRIPTOR_OFFSET + desc*2] = typ | ((units >> 8) as u8 & 0x3f);
        img[DESCRIPTOR_OFFSET + desc*2 + 1] = units as u8;
        img.append(&mut dat);
    }

    fn pulse_fdi() -> Vec<u8> {
        let mut img = header(DISK_TYPE_525,0,0);
        let sectors: Vec<Vec<u8>> = (0..16).map(|s| vec![s as u8;256]).collect();
        let nibs = nibble::encode_track(NibbleFormat::Dos33,254,0,&sectors).unwrap();
        let pulses = nibbles_to_pulses(&nibs,1000);
        let stream = huffman(&pulses);
        let mut dat = u32::to_be_bytes(pulses.len() as u32).to_vec();
        dat.extend_from_slice(&u32::to_be_bytes(0x0100_0000 | stream.len() as u32));
        dat.extend_from_slice(&[0;12]);
        dat.extend_from_slice(&stream);
        push_track(&mut img,0,0xc0,dat);
        img
    }

    #[test]
    fn huffman_values() {
        let vals: Vec<u32> = vec![2000,4000,2000,6000,3000,2000];
        assert_eq!(decode_huffman(&huffman(&vals),vals.len()).unwrap(),vals);
    }

    #[test]
    fn pulse_track_decodes_deterministically() {
        let img = pulse_fdi();
        assert!(test(&img));
        let (_,first) = prep(&img).unwrap();
        let (_,second) = prep(&img).unwrap();
        assert_eq!(first.data,second.data);
        assert!(first.read_only);
        let layout = match first.addressing {
            Addressing::Nibbles(l) => l,
            _ => panic!("expected nibbles")
        };
        assert_eq!(layout.format,NibbleFormat::Dos33);
        let psec = skew::dos_lsec_to_psec(3);
        let dat = nibble::read_sector(&first.data[0..layout.length[0]],NibbleFormat::Dos33,0,psec as u8).unwrap();
        assert_eq!(dat,vec![psec as u8;256]);
    }

    #[test]
    fn raw_bits_35() {
        let mut img = header(DISK_TYPE_35,0,0);
        let sectors: Vec<Vec<u8>> = (0..12).map(|s| vec![0x10 + s as u8;512]).collect();
        let nibs = nibble::encode_track_35(0,0,&sectors).unwrap();
        let mut dat = u32::to_be_bytes(nibs.len() as u32 * 8).to_vec();
        dat.extend_from_slice(&nibs);
        push_track(&mut img,0,0x80,dat);
        let (_,p) = prep(&img).unwrap();
        assert_eq!(p.addressing,Addressing::Blocks(800));
        assert_eq!(p.data[5*512],0x15);
        let bad = p.bad_blocks.unwrap();
        assert!(!bad.is_set(11));
        assert!(bad.is_set(12));
    }
}
