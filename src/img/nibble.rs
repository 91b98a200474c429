//! ## Nibble Module
//!
//! Codecs for Steve Wozniak's nibbles, and the track level logic that finds and rewrites
//! sectors in a stream of nibbles.
//!
//! The nibbles handled by this module are a form of group code recording (GCR).
//! Each 8-bit nibble is derived from multiple bytes of data in a way that admits no simple
//! expression; in particular, each byte of data is scrambled across multiple non-contiguous nibbles.
//! The sector codecs are ports of the CiderPress routines.
//!
//! Track streams are treated as circular, so a sector that wraps around the end of the
//! stored data is still found.

use log::{trace,debug};
use crate::bios::skew;
use crate::img::NibbleError;

const INVALID_NIB_BYTE: u8 = 0xff;
const CHUNK53: usize = 0x33;
const CHUNK62: usize = 0x56;
/// nibbles in an encoded 256 byte 6&2 sector, including checksum
pub const NIBS_62: usize = 343;
/// nibbles in an encoded 256 byte 5&3 sector, including checksum
pub const NIBS_53: usize = 411;
/// nibbles in an encoded 524 byte 3.5 inch sector, including checksum
pub const NIBS_35: usize = 703;
/// how far past the address epilogue we look for the data prologue
const DATA_SEARCH_WINDOW: usize = 64;
const GAP1: usize = 48;
const GAP2: usize = 6;
const GAP3: usize = 27;

const FWD_53: [u8;32] = [
    0xab, 0xad, 0xae, 0xaf, 0xb5, 0xb6, 0xb7, 0xba,
    0xbb, 0xbd, 0xbe, 0xbf, 0xd6, 0xd7, 0xda, 0xdb,
    0xdd, 0xde, 0xdf, 0xea, 0xeb, 0xed, 0xee, 0xef,
    0xf5, 0xf6, 0xf7, 0xfa, 0xfb, 0xfd, 0xfe, 0xff
];

const FWD_62: [u8;64] = [
    0x96, 0x97, 0x9a, 0x9b, 0x9d, 0x9e, 0x9f, 0xa6,
    0xa7, 0xab, 0xac, 0xad, 0xae, 0xaf, 0xb2, 0xb3,
    0xb4, 0xb5, 0xb6, 0xb7, 0xb9, 0xba, 0xbb, 0xbc,
    0xbd, 0xbe, 0xbf, 0xcb, 0xcd, 0xce, 0xcf, 0xd3,
    0xd6, 0xd7, 0xd9, 0xda, 0xdb, 0xdc, 0xdd, 0xde,
    0xdf, 0xe5, 0xe6, 0xe7, 0xe9, 0xea, 0xeb, 0xec,
    0xed, 0xee, 0xef, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6,
    0xf7, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd, 0xfe, 0xff
];

/// Inverse tables are built from the forward ones on demand.
fn rev_lookup(fwd: &[u8],nib: u8) -> u8 {
    match fwd.iter().position(|x| *x==nib) {
        Some(i) => i as u8,
        None => INVALID_NIB_BYTE
    }
}

/// Disk II sector formats
#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum NibbleFormat {
    /// 16 sectors, 6&2 data, address prologue D5 AA 96
    Dos33,
    /// 13 sectors, 5&3 data, address prologue D5 AA B5
    Dos32
}

impl NibbleFormat {
    pub fn sectors(&self) -> usize {
        match self {
            Self::Dos33 => 16,
            Self::Dos32 => 13
        }
    }
    fn addr_prolog(&self) -> [u8;3] {
        match self {
            Self::Dos33 => [0xd5,0xaa,0x96],
            Self::Dos32 => [0xd5,0xaa,0xb5]
        }
    }
    fn data_nibs(&self) -> usize {
        match self {
            Self::Dos33 => NIBS_62,
            Self::Dos32 => NIBS_53
        }
    }
    /// nibbles needed for one track written by `encode_track`
    pub fn track_len(&self) -> usize {
        GAP1 + self.sectors() * (3 + 8 + 3 + GAP2 + 3 + self.data_nibs() + 3 + GAP3)
    }
}

/// encode a normal byte as two 4&4 nibbles
pub fn encode_44(val: u8) -> [u8;2] {
    return [(val >> 1) | 0xaa, val | 0xaa];
}

/// decode two 4&4 nibbles as a normal byte, invalid nibble will yield error
pub fn decode_44(nibs: [u8;2]) -> Result<u8,NibbleError> {
    if nibs[0] & 0xaa != 0xaa || nibs[1] & 0xaa != 0xaa {
        Err(NibbleError::InvalidByte)
    } else {
        Ok(((nibs[0] << 1) | 0x01) & nibs[1])
    }
}

/// encode a 5-bit value as a 5&3 nibble
pub fn encode_53(val: u8) -> u8 {
    return FWD_53[(val & 0x1f) as usize];
}

/// decode a 5&3 nibble as a 5-bit value, invalid nibble will yield error
pub fn decode_53(nib: u8) -> Result<u8,NibbleError> {
    match rev_lookup(&FWD_53,nib) {
        INVALID_NIB_BYTE => Err(NibbleError::InvalidByte),
        ans => Ok(ans)
    }
}

/// encode a 6-bit value as a 6&2 nibble
pub fn encode_62(val: u8) -> u8 {
    return FWD_62[(val & 0x3f) as usize];
}

/// decode a 6&2 nibble as a 6-bit value, invalid nibble will yield error
pub fn decode_62(nib: u8) -> Result<u8,NibbleError> {
    match rev_lookup(&FWD_62,nib) {
        INVALID_NIB_BYTE => Err(NibbleError::InvalidByte),
        ans => Ok(ans)
    }
}

/// encode 256 bytes as 411 nibbles
pub fn encode_sector_53(dat: &[u8]) -> Vec<u8> {
    let mut bak_buf: Vec<u8> = Vec::with_capacity(NIBS_53);
    let mut top: [u8;256] = [0;256];
    let mut threes: [u8;154] = [0;154];
    for i in 0..CHUNK53 {
        let offset = CHUNK53-1-i;
        top[offset+CHUNK53*0] = dat[i*5+0] >> 3;
        top[offset+CHUNK53*1] = dat[i*5+1] >> 3;
        top[offset+CHUNK53*2] = dat[i*5+2] >> 3;
        top[offset+CHUNK53*3] = dat[i*5+3] >> 3;
        top[offset+CHUNK53*4] = dat[i*5+4] >> 3;
        threes[offset+CHUNK53*0] =
            (dat[i*5+0] & 0x07) << 2 | (dat[i*5+3] & 0x04) >> 1 | (dat[i*5+4] & 0x04) >> 2;
        threes[offset+CHUNK53*1] =
            (dat[i*5+1] & 0x07) << 2 | (dat[i*5+3] & 0x02) >> 0 | (dat[i*5+4] & 0x02) >> 1;
        threes[offset+CHUNK53*2] =
            (dat[i*5+2] & 0x07) << 2 | (dat[i*5+3] & 0x01) << 1 | (dat[i*5+4] & 0x01) >> 0;
    }
    // last byte is different
    top[255] = dat[255] >> 3;
    threes[153] = dat[255] & 0x07;
    let mut chksum = 0;
    for i in (0..threes.len()).rev() {
        bak_buf.push(encode_53(threes[i] ^ chksum));
        chksum = threes[i];
    }
    for i in 0..top.len() {
        bak_buf.push(encode_53(top[i] ^ chksum));
        chksum = top[i];
    }
    bak_buf.push(encode_53(chksum));
    bak_buf
}

/// encode 256 bytes as 343 nibbles
pub fn encode_sector_62(dat: &[u8]) -> Vec<u8> {
    let mut bak_buf: Vec<u8> = Vec::with_capacity(NIBS_62);
    let mut top: [u8;256] = [0;256];
    let mut twos: [u8;CHUNK62] = [0;CHUNK62];
    let mut two_shift = 0;
    let mut two_pos_n = CHUNK62-1;
    for i in 0..256 {
        let val = dat[i];
        top[i] = val >> 2;
        twos[two_pos_n] |= ((val & 1) << 1 | (val & 2) >> 1) << two_shift;
        if two_pos_n==0 {
            two_pos_n = CHUNK62;
            two_shift += 2;
        }
        two_pos_n -= 1;
    }
    let mut chksum = 0;
    for i in (0..CHUNK62).rev() {
        bak_buf.push(encode_62(twos[i] ^ chksum));
        chksum = twos[i];
    }
    for i in 0..256 {
        bak_buf.push(encode_62(top[i] ^ chksum));
        chksum = top[i];
    }
    bak_buf.push(encode_62(chksum));
    bak_buf
}

/// decode 411 nibbles as 256 bytes
pub fn decode_sector_53(bak_buf: &[u8]) -> Result<Vec<u8>,NibbleError> {
    if bak_buf.len() < NIBS_53 {
        return Err(NibbleError::NibbleType);
    }
    let mut ans: Vec<u8> = Vec::new();
    let mut base: [u8;256] = [0;256];
    let mut threes: [u8;154] = [0;154];
    let mut chksum = 0;
    let mut idx = 0;
    for i in (0..threes.len()).rev() {
        chksum ^= decode_53(bak_buf[idx])?;
        threes[i] = chksum;
        idx += 1;
    }
    for i in 0..base.len() {
        chksum ^= decode_53(bak_buf[idx])?;
        base[i] = chksum << 3;
        idx += 1;
    }
    chksum ^= decode_53(bak_buf[idx])?;
    if chksum!=0 {
        return Err(NibbleError::BadChecksum);
    }
    for i in (0..CHUNK53).rev() {
        let three1 = threes[CHUNK53*0+i];
        let three2 = threes[CHUNK53*1+i];
        let three3 = threes[CHUNK53*2+i];
        let three4 = (three1 & 0x02) << 1 | (three2 & 0x02) | (three3 & 0x02) >> 1;
        let three5 = (three1 & 0x01) << 2 | (three2 & 0x01) << 1 | (three3 & 0x01);
        ans.push(base[CHUNK53*0+i] | ((three1 >> 2) & 0x07));
        ans.push(base[CHUNK53*1+i] | ((three2 >> 2) & 0x07));
        ans.push(base[CHUNK53*2+i] | ((three3 >> 2) & 0x07));
        ans.push(base[CHUNK53*3+i] | (three4 & 0x07));
        ans.push(base[CHUNK53*4+i] | (three5 & 0x07));
    }
    ans.push(base[255] | (threes[threes.len()-1] & 0x07));
    return Ok(ans);
}

/// decode 343 nibbles as 256 bytes
pub fn decode_sector_62(bak_buf: &[u8]) -> Result<Vec<u8>,NibbleError> {
    if bak_buf.len() < NIBS_62 {
        return Err(NibbleError::NibbleType);
    }
    let mut ans: Vec<u8> = Vec::new();
    let mut twos: [u8;CHUNK62*3] = [0;CHUNK62*3];
    let mut chksum = 0;
    let mut idx = 0;
    for i in 0..CHUNK62 {
        chksum ^= decode_62(bak_buf[idx])?;
        twos[i] = ((chksum & 0x01) << 1) | ((chksum & 0x02) >> 1);
        twos[i + CHUNK62] = ((chksum & 0x04) >> 1) | ((chksum & 0x08) >> 3);
        twos[i + CHUNK62*2] = ((chksum & 0x10) >> 3) | ((chksum & 0x20) >> 5);
        idx += 1;
    }
    for i in 0..256 {
        chksum ^= decode_62(bak_buf[idx])?;
        ans.push((chksum << 2) | twos[i]);
        idx += 1;
    }
    chksum ^= decode_62(bak_buf[idx])?;
    if chksum!=0 {
        return Err(NibbleError::BadChecksum);
    }
    return Ok(ans);
}

/// Encode a 524 byte 3.5 inch sector (12 tag bytes + 512 data bytes) as 703 nibbles.
pub fn encode_sector_35(dat: &[u8]) -> Result<Vec<u8>,NibbleError> {
    const SECTOR_SIZE: usize = 524;
    const CHUNK: usize = 175;
    const DATA_NIBS: usize = 699;
    if dat.len() < SECTOR_SIZE {
        return Err(NibbleError::NibbleType);
    }
    let mut bak_buf: Vec<u8> = vec![0;NIBS_35];
    let mut part0: [u8;CHUNK] = [0;CHUNK];
    let mut part1: [u8;CHUNK] = [0;CHUNK];
    let mut part2: [u8;CHUNK] = [0;CHUNK];
    let [mut chk0,mut chk1,mut chk2]: [usize;3] = [0,0,0];
    let mut i: usize = 0;
    let mut s: usize = 0;
    loop {
        chk0 = (chk0 & 0xff) << 1;
        if chk0 & 0x100 > 0 {
            chk0 += 1;
        }
        let val = dat[s];
        chk2 += val as usize;
        if chk0 & 0x100 > 0 {
            chk2 += 1;
            chk0 &= 0xff;
        }
        part0[i] = ((val as usize ^ chk0) & 0xff) as u8;
        let val = dat[s+1];
        chk1 += val as usize;
        if chk2 > 0xff {
            chk1 += 1;
            chk2 &= 0xff;
        }
        part1[i] = ((val as usize ^ chk2) & 0xff) as u8;
        if s + 2 >= SECTOR_SIZE {
            chk0 &= 0xff;
            chk1 &= 0xff;
            chk2 &= 0xff;
            break;
        }
        let val = dat[s+2];
        chk0 += val as usize;
        if chk1 > 0xff {
            chk0 += 1;
            chk1 &= 0xff;
        }
        part2[i] = ((val as usize ^ chk1) & 0xff) as u8;
        i += 1;
        s += 3;
    }
    for i in 0..CHUNK {
        let twos = ((part0[i] & 0xc0) >> 2) | ((part1[i] & 0xc0) >> 4) | ((part2[i] & 0xc0) >> 6);
        bak_buf[i*4+0] = encode_62(twos);
        bak_buf[i*4+1] = encode_62(part0[i] & 0x3f);
        bak_buf[i*4+2] = encode_62(part1[i] & 0x3f);
        if i*4 + 3 < DATA_NIBS {
            bak_buf[i*4+3] = encode_62(part2[i] & 0x3f);
        }
    }
    let twos = (((chk0 & 0xc0) >> 6) | ((chk1 & 0xc0) >> 4) | ((chk2 & 0xc0) >> 2)) as u8;
    bak_buf[DATA_NIBS+0] = encode_62(twos);
    bak_buf[DATA_NIBS+1] = encode_62(chk2 as u8 & 0x3f);
    bak_buf[DATA_NIBS+2] = encode_62(chk1 as u8 & 0x3f);
    bak_buf[DATA_NIBS+3] = encode_62(chk0 as u8 & 0x3f);
    Ok(bak_buf)
}

/// Decode 703 nibbles as a 524 byte 3.5 inch sector, tag bytes included.
pub fn decode_sector_35(bak_buf: &[u8]) -> Result<Vec<u8>,NibbleError> {
    const CHUNK: usize = 175;
    const DATA_NIBS: usize = 699;
    if bak_buf.len() < NIBS_35 {
        return Err(NibbleError::NibbleType);
    }
    let mut ans: Vec<u8> = Vec::new();
    let mut part0: [u8;CHUNK] = [0;CHUNK];
    let mut part1: [u8;CHUNK] = [0;CHUNK];
    let mut part2: [u8;CHUNK] = [0;CHUNK];
    let mut idx = 0;
    for i in 0..CHUNK {
        let twos = decode_62(bak_buf[idx+0])?;
        let nib0 = decode_62(bak_buf[idx+1])?;
        let nib1 = decode_62(bak_buf[idx+2])?;
        idx += 3;
        let nib2 = match i {
            x if x==CHUNK-1 => 0,
            _ => {
                idx += 1;
                decode_62(bak_buf[idx-1])?
            }
        };
        part0[i] = nib0 | ((twos << 2) & 0xc0);
        part1[i] = nib1 | ((twos << 4) & 0xc0);
        part2[i] = nib2 | ((twos << 6) & 0xc0);
    }
    let [mut chk0,mut chk1,mut chk2]: [usize;3] = [0,0,0];
    let mut i = 0;
    loop {
        chk0 = (chk0 & 0xff) << 1;
        if chk0 & 0x100 > 0 {
            chk0 += 1;
        }
        let val = (part0[i] as usize ^ chk0) as u8;
        chk2 += val as usize;
        if chk0 & 0x100 > 0 {
            chk2 += 1;
            chk0 &= 0xff;
        }
        ans.push(val);
        let val = (part1[i] as usize ^ chk2) as u8;
        chk1 += val as usize;
        if chk2 > 0xff {
            chk1 += 1;
            chk2 &= 0xff;
        }
        ans.push(val);
        if ans.len()>=524 {
            chk0 &= 0xff;
            chk1 &= 0xff;
            chk2 &= 0xff;
            break;
        }
        let val = (part2[i] as usize ^ chk1) as u8;
        chk0 += val as usize;
        if chk1 > 0xff {
            chk0 += 1;
            chk1 &= 0xff;
        }
        ans.push(val);
        i+= 1;
    }
    if idx != DATA_NIBS {
        return Err(NibbleError::NibbleType);
    }
    let twos = decode_62(bak_buf[idx+0])?;
    let nib2 = decode_62(bak_buf[idx+1])?;
    let nib1 = decode_62(bak_buf[idx+2])?;
    let nib0 = decode_62(bak_buf[idx+3])?;
    let rdchk0 = (nib0 | ((twos << 6) & 0xc0)) as usize;
    let rdchk1 = (nib1 | ((twos << 4) & 0xc0)) as usize;
    let rdchk2 = (nib2 | ((twos << 2) & 0xc0)) as usize;
    if chk0 != rdchk0 || chk1 != rdchk1 || chk2 != rdchk2 {
        debug!("expect checksum {},{},{} got {},{},{}",chk0,chk1,chk2,rdchk0,rdchk1,rdchk2);
        return Err(NibbleError::BadChecksum);
    }
    return Ok(ans);
}

/// nibble at circular position
fn at(nibs: &[u8],pos: usize) -> u8 {
    nibs[pos % nibs.len()]
}

/// copy `n` nibbles from circular position
fn take(nibs: &[u8],pos: usize,n: usize) -> Vec<u8> {
    (0..n).map(|i| at(nibs,pos+i)).collect()
}

fn matches(nibs: &[u8],pos: usize,patt: &[u8]) -> bool {
    patt.iter().enumerate().all(|(i,b)| at(nibs,pos+i)==*b)
}

/// Contents of a 5.25 inch address field
#[derive(Clone,Copy,Debug,PartialEq)]
pub struct AddressField {
    pub volume: u8,
    pub track: u8,
    pub sector: u8
}

/// Find the data field of a physical sector; returns the offset of the first data nibble
/// (following the prologue) along with the address field that led to it.
pub fn find_sector(nibs: &[u8],fmt: NibbleFormat,track: u8,sector: u8) -> Result<(usize,AddressField),NibbleError> {
    if nibs.len() < fmt.data_nibs() {
        return Err(NibbleError::BadTrack);
    }
    let prolog = fmt.addr_prolog();
    for pos in 0..nibs.len() {
        if !matches(nibs,pos,&prolog) {
            continue;
        }
        let fields = take(nibs,pos+3,8);
        let decoded: Result<Vec<u8>,NibbleError> = fields.chunks(2).map(|c| decode_44([c[0],c[1]])).collect();
        let [vol,trk,sec,chk] = match decoded {
            Ok(v) => [v[0],v[1],v[2],v[3]],
            Err(_) => continue
        };
        if vol ^ trk ^ sec != chk {
            trace!("address checksum mismatch at nibble {}",pos);
            continue;
        }
        if trk!=track || sec!=sector {
            continue;
        }
        let addr = AddressField { volume: vol, track: trk, sector: sec };
        let search_start = pos + 3 + 8 + 2;
        for d in search_start..search_start+DATA_SEARCH_WINDOW {
            if matches(nibs,d,&[0xd5,0xaa,0xad]) {
                return Ok(((d+3) % nibs.len(),addr));
            }
        }
        debug!("no data field after address of track {} sector {}",track,sector);
        return Err(NibbleError::BitPatternNotFound);
    }
    Err(NibbleError::SectorNotFound)
}

/// Read one physical sector out of a nibble track.
pub fn read_sector(nibs: &[u8],fmt: NibbleFormat,track: u8,sector: u8) -> Result<Vec<u8>,NibbleError> {
    let (data_pos,_) = find_sector(nibs,fmt,track,sector)?;
    let enc = take(nibs,data_pos,fmt.data_nibs());
    match fmt {
        NibbleFormat::Dos33 => decode_sector_62(&enc),
        NibbleFormat::Dos32 => decode_sector_53(&enc)
    }
}

/// Rewrite the data field of one physical sector in place.
pub fn write_sector(nibs: &mut [u8],fmt: NibbleFormat,track: u8,sector: u8,dat: &[u8]) -> Result<(),NibbleError> {
    if dat.len() < 256 {
        return Err(NibbleError::NibbleType);
    }
    let (data_pos,_) = find_sector(nibs,fmt,track,sector)?;
    let enc = match fmt {
        NibbleFormat::Dos33 => encode_sector_62(dat),
        NibbleFormat::Dos32 => encode_sector_53(dat)
    };
    let n = nibs.len();
    for (i,nib) in enc.iter().enumerate() {
        nibs[(data_pos+i) % n] = *nib;
    }
    Ok(())
}

/// Volume number stored in the first readable address field, if any
pub fn find_volume(nibs: &[u8],fmt: NibbleFormat,track: u8) -> Option<u8> {
    for s in 0..fmt.sectors() {
        if let Ok((_,addr)) = find_sector(nibs,fmt,track,s as u8) {
            return Some(addr.volume);
        }
    }
    None
}

/// Produce a standard track. `sectors` is indexed by physical sector.
/// The result is `fmt.track_len()` nibbles, the caller pads with sync bytes as needed.
pub fn encode_track(fmt: NibbleFormat,volume: u8,track: u8,sectors: &[Vec<u8>]) -> Result<Vec<u8>,NibbleError> {
    if sectors.len() != fmt.sectors() {
        return Err(NibbleError::BadTrack);
    }
    let mut ans: Vec<u8> = vec![0xff;GAP1];
    for pos in 0..fmt.sectors() {
        let psec = match fmt {
            NibbleFormat::Dos33 => pos,
            NibbleFormat::Dos32 => skew::dos32_sector_at(pos)
        };
        let dat = &sectors[psec];
        if dat.len() < 256 {
            return Err(NibbleError::NibbleType);
        }
        let sec = psec as u8;
        ans.extend_from_slice(&fmt.addr_prolog());
        ans.extend_from_slice(&encode_44(volume));
        ans.extend_from_slice(&encode_44(track));
        ans.extend_from_slice(&encode_44(sec));
        ans.extend_from_slice(&encode_44(volume ^ track ^ sec));
        ans.extend_from_slice(&[0xde,0xaa,0xeb]);
        ans.extend_from_slice(&[0xff;GAP2]);
        ans.extend_from_slice(&[0xd5,0xaa,0xad]);
        match fmt {
            NibbleFormat::Dos33 => ans.append(&mut encode_sector_62(dat)),
            NibbleFormat::Dos32 => ans.append(&mut encode_sector_53(dat))
        }
        ans.extend_from_slice(&[0xde,0xaa,0xeb]);
        ans.extend_from_slice(&[0xff;GAP3]);
    }
    Ok(ans)
}

/// 3.5 inch sector found on a track
pub struct Sector35 {
    pub track: usize,
    pub side: usize,
    pub sector: usize,
    /// 512 data bytes, tags removed
    pub data: Vec<u8>
}

/// Decode every readable sector on a 3.5 inch track.
/// Sectors with bad checksums are skipped and counted in the second tuple member.
pub fn decode_track_35(nibs: &[u8]) -> (Vec<Sector35>,usize) {
    let mut ans: Vec<Sector35> = Vec::new();
    let mut bad = 0;
    let n = nibs.len();
    if n < NIBS_35 {
        return (ans,0);
    }
    for pos in 0..n {
        if !matches(nibs,pos,&[0xd5,0xaa,0x96]) {
            continue;
        }
        let fields: Result<Vec<u8>,NibbleError> = take(nibs,pos+3,5).iter().map(|x| decode_62(*x)).collect();
        let f = match fields {
            Ok(f) => f,
            Err(_) => continue
        };
        if f[0] ^ f[1] ^ f[2] ^ f[3] != f[4] {
            trace!("3.5 address checksum mismatch at nibble {}",pos);
            continue;
        }
        let track = f[0] as usize | ((f[2] as usize & 0x1f) << 6);
        let side = ((f[2] >> 5) & 1) as usize;
        let sector = f[1] as usize;
        let search_start = pos + 3 + 5 + 2;
        for d in search_start..search_start+DATA_SEARCH_WINDOW {
            if matches(nibs,d,&[0xd5,0xaa,0xad]) {
                // skip the sector number nibble
                match decode_sector_35(&take(nibs,d+4,NIBS_35)) {
                    Ok(dat) => ans.push(Sector35 { track, side, sector, data: dat[12..524].to_vec() }),
                    Err(_) => bad += 1
                }
                break;
            }
        }
    }
    (ans,bad)
}

/// Produce a 3.5 inch track with 524 byte sectors, `sectors` holds the 512 data bytes
/// of each sector in order, tag bytes are zero.
pub fn encode_track_35(track: usize,side: usize,sectors: &[Vec<u8>]) -> Result<Vec<u8>,NibbleError> {
    let mut ans: Vec<u8> = vec![0xff;GAP1];
    for (s,dat) in sectors.iter().enumerate() {
        if dat.len() < 512 {
            return Err(NibbleError::NibbleType);
        }
        let f = [(track & 0x3f) as u8,s as u8,(((track >> 6) & 0x1f) | (side << 5)) as u8,0x22];
        ans.extend_from_slice(&[0xd5,0xaa,0x96]);
        for x in f {
            ans.push(encode_62(x));
        }
        ans.push(encode_62(f[0]^f[1]^f[2]^f[3]));
        ans.extend_from_slice(&[0xde,0xaa]);
        ans.extend_from_slice(&[0xff;GAP2]);
        ans.extend_from_slice(&[0xd5,0xaa,0xad]);
        ans.push(encode_62(s as u8));
        let mut full = vec![0;12];
        full.extend_from_slice(&dat[0..512]);
        ans.append(&mut encode_sector_35(&full)?);
        ans.extend_from_slice(&[0xde,0xaa]);
        ans.extend_from_slice(&[0xff;GAP3]);
    }
    Ok(ans)
}

#[test]
fn sector_62_round_trip() {
    let dat: Vec<u8> = (0..256).map(|i| (i*7 % 256) as u8).collect();
    let nibs = encode_sector_62(&dat);
    assert_eq!(nibs.len(),NIBS_62);
    assert!(nibs.iter().all(|n| *n >= 0x96));
    assert_eq!(decode_sector_62(&nibs).unwrap(),dat);
}

#[test]
fn sector_53_round_trip() {
    let dat: Vec<u8> = (0..256).map(|i| (255 - i) as u8).collect();
    let nibs = encode_sector_53(&dat);
    assert_eq!(nibs.len(),NIBS_53);
    assert_eq!(decode_sector_53(&nibs).unwrap(),dat);
}

#[test]
fn checksum_detected() {
    let dat = vec![0x55;256];
    let mut nibs = encode_sector_62(&dat);
    nibs[100] = encode_62(decode_62(nibs[100]).unwrap() ^ 1);
    assert!(decode_sector_62(&nibs).is_err());
}

#[test]
fn track_find_and_rewrite() {
    let sectors: Vec<Vec<u8>> = (0..16).map(|s| vec![s as u8;256]).collect();
    let mut track = encode_track(NibbleFormat::Dos33,254,17,&sectors).unwrap();
    assert_eq!(track.len(),NibbleFormat::Dos33.track_len());
    assert_eq!(track.len(),6384);
    assert_eq!(read_sector(&track,NibbleFormat::Dos33,17,9).unwrap(),vec![9;256]);
    assert_eq!(find_volume(&track,NibbleFormat::Dos33,17),Some(254));
    // rotate so sector 0 wraps around the end
    track.rotate_left(60);
    write_sector(&mut track,NibbleFormat::Dos33,17,0,&vec![0xaa;256]).unwrap();
    assert_eq!(read_sector(&track,NibbleFormat::Dos33,17,0).unwrap(),vec![0xaa;256]);
    assert!(read_sector(&track,NibbleFormat::Dos33,16,0).is_err());
}

#[test]
fn track_35_round_trip() {
    let sectors: Vec<Vec<u8>> = (0..12).map(|s| vec![s as u8 + 1;512]).collect();
    let track = encode_track_35(3,1,&sectors).unwrap();
    let (found,bad) = decode_track_35(&track);
    assert_eq!(bad,0);
    assert_eq!(found.len(),12);
    assert_eq!(found[5].track,3);
    assert_eq!(found[5].side,1);
    assert_eq!(found[5].data,vec![6;512]);
}
