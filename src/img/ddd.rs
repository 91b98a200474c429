//! ## Support for DDD compressed images
//!
//! DDD packs a 140K DOS ordered disk one track at a time into a bit stream.
//! The stream opens with the 8 bit volume number.  Each track then lists its 20 favorite
//! byte values, followed by codes for the 4096 track bytes:
//! * `0` + 8 bits is a literal byte
//! * a 4 to 7 bit code starting with `1` selects a favorite
//! * the 8 bit code `0xFC` + byte + count is a run (count 0 means 256)
//!
//! The favorite codes are canonical, so every code is recovered by extending the
//! candidate one bit at a time.  A file must decode to exactly 35 tracks and end
//! at its last byte.

use log::{debug,trace,info};
use super::{Addressing,SectorOrder,PhysicalFormat,Prepped,CreateParams,ImageWrapper,WrapperKind,Error};
use crate::bits::BitCursor;
use crate::DYNERR;

pub const TRACK_LEN: usize = 4096;
const TRACKS: usize = 35;
const FAVORITES: usize = 20;
const MIN_RUN: usize = 4;
const MAX_RUN: usize = 256;
const RUN_CODE: u32 = 0xfc;
const DEFAULT_VOLUME: u8 = 254;

/// (code length, first code, how many) for the favorite codes
const CODE_GROUPS: [(usize,u32,usize);4] = [(4,0x08,3),(5,0x16,5),(6,0x36,6),(7,0x78,6)];

pub fn file_extensions() -> Vec<String> {
    vec!["ddd".to_string()]
}

pub struct Ddd {
    volume: u8
}

/// Code and length for favorite `idx`
fn favorite_code(idx: usize) -> (u32,usize) {
    let mut first_idx = 0;
    for (len,first,count) in CODE_GROUPS {
        if idx < first_idx + count {
            return (first + (idx - first_idx) as u32,len);
        }
        first_idx += count;
    }
    (RUN_CODE,8)
}

/// 20 favorite byte values by descending count, ties going to the lower value
fn choose_favorites(track: &[u8]) -> [u8;FAVORITES] {
    let mut counts = [0usize;256];
    let mut i = 0;
    while i < track.len() {
        let run = run_length(track,i);
        if run >= MIN_RUN {
            i += run;
            continue;
        }
        counts[track[i] as usize] += 1;
        i += 1;
    }
    let mut values: Vec<u8> = (0..=255).collect();
    values.sort_by(|a,b| counts[*b as usize].cmp(&counts[*a as usize]).then(a.cmp(b)));
    let mut ans = [0;FAVORITES];
    ans.copy_from_slice(&values[0..FAVORITES]);
    ans
}

fn run_length(track: &[u8],start: usize) -> usize {
    let mut n = 1;
    while start + n < track.len() && n < MAX_RUN && track[start+n]==track[start] {
        n += 1;
    }
    n
}

/// Append one 4096 byte track to the stream
pub fn encode_track(track: &[u8],curs: &mut BitCursor) -> Result<(),DYNERR> {
    if track.len() != TRACK_LEN {
        return Err(Box::new(Error::ImageSizeMismatch));
    }
    let favs = choose_favorites(track);
    for f in favs {
        curs.put(f as u32,8)?;
    }
    let mut i = 0;
    while i < track.len() {
        let run = run_length(track,i);
        if run >= MIN_RUN {
            curs.put(RUN_CODE,8)?;
            curs.put(track[i] as u32,8)?;
            curs.put((run % MAX_RUN) as u32,8)?;
            i += run;
            continue;
        }
        match favs.iter().position(|f| *f==track[i]) {
            Some(idx) => {
                let (code,len) = favorite_code(idx);
                curs.put(code,len)?;
            },
            None => {
                curs.put(0,1)?;
                curs.put(track[i] as u32,8)?;
            }
        }
        i += 1;
    }
    Ok(())
}

/// Decode one track from the stream, must come out to exactly 4096 bytes
pub fn decode_track(curs: &mut BitCursor) -> Result<Vec<u8>,DYNERR> {
    let mut favs = [0;FAVORITES];
    for i in 0..FAVORITES {
        favs[i] = curs.get_u8()?;
    }
    let mut ans: Vec<u8> = Vec::with_capacity(TRACK_LEN);
    while ans.len() < TRACK_LEN {
        if curs.get(1)? == 0 {
            ans.push(curs.get_u8()?);
            continue;
        }
        let mut code: u32 = 0b1;
        let mut len = 1;
        let mut found = None;
        let mut first_idx = 0;
        for (group_len,first,count) in CODE_GROUPS {
            code = (code << (group_len - len)) | curs.get(group_len - len)?;
            len = group_len;
            if code >= first && code < first + count as u32 {
                found = Some(first_idx + (code - first) as usize);
                break;
            }
            first_idx += count;
        }
        if let Some(idx) = found {
            ans.push(favs[idx]);
            continue;
        }
        code = (code << 1) | curs.get(1)?;
        if code != RUN_CODE {
            debug!("invalid DDD code {:02X}",code);
            return Err(Box::new(Error::Corrupt));
        }
        let val = curs.get_u8()?;
        let count = match curs.get_u8()? {
            0 => MAX_RUN,
            n => n as usize
        };
        if ans.len() + count > TRACK_LEN {
            debug!("DDD run overflows track");
            return Err(Box::new(Error::Corrupt));
        }
        ans.resize(ans.len() + count,val);
    }
    Ok(ans)
}

/// Compress a DOS ordered 140K image
pub fn encode(volume: u8,data: &[u8]) -> Result<Vec<u8>,DYNERR> {
    if data.len() != TRACKS*TRACK_LEN {
        return Err(Box::new(Error::ImageSizeMismatch));
    }
    let mut curs = BitCursor::new();
    curs.put(volume as u32,8)?;
    for t in 0..TRACKS {
        encode_track(&data[t*TRACK_LEN..(t+1)*TRACK_LEN],&mut curs)?;
    }
    Ok(curs.into_bytes())
}

/// Expand to the volume number and DOS ordered sectors
pub fn decode(buf: &[u8]) -> Result<(u8,Vec<u8>),DYNERR> {
    let mut curs = BitCursor::from_bytes(buf);
    let volume = curs.get_u8()?;
    let mut ans: Vec<u8> = Vec::with_capacity(TRACKS*TRACK_LEN);
    for t in 0..TRACKS {
        trace!("DDD track {} at bit {}",t,curs.bit_offset);
        ans.append(&mut decode_track(&mut curs)?);
    }
    if curs.byte_pos() != buf.len() {
        debug!("DDD stream ends at {} of {} bytes",curs.byte_pos(),buf.len());
        return Err(Box::new(Error::Corrupt));
    }
    if curs.remaining() > 0 && curs.get(curs.remaining())? != 0 {
        debug!("DDD pad bits are not zero");
        return Err(Box::new(Error::Corrupt));
    }
    Ok((volume,ans))
}

/// Only a full decode can tell, so keep it to plausible sizes
pub fn test(buf: &[u8]) -> bool {
    buf.len() > TRACKS*FAVORITES && buf.len() < TRACKS*(FAVORITES + TRACK_LEN*9/8 + 1) && decode(buf).is_ok()
}

pub fn prep(buf: &[u8]) -> Result<(Ddd,Prepped),DYNERR> {
    let (volume,data) = decode(buf)?;
    info!("DDD image with volume {}",volume);
    let mut prepped = Prepped::new(data,Addressing::Sectors { tracks: TRACKS, sectors: 16 },SectorOrder::Dos,PhysicalFormat::Sectors);
    prepped.volume = Some(volume);
    Ok((Ddd { volume },prepped))
}

pub fn create(params: &CreateParams) -> Result<(Ddd,Prepped),DYNERR> {
    if params.addressing != (Addressing::Sectors { tracks: TRACKS, sectors: 16 }) {
        return Err(Box::new(Error::ImageSizeMismatch));
    }
    let volume = params.volume.unwrap_or(DEFAULT_VOLUME);
    let mut prepped = Prepped::new(vec![0;TRACKS*TRACK_LEN],params.addressing.clone(),SectorOrder::Dos,PhysicalFormat::Sectors);
    prepped.volume = Some(volume);
    Ok((Ddd { volume },prepped))
}

impl ImageWrapper for Ddd {
    fn kind(&self) -> WrapperKind {
        WrapperKind::Ddd
    }
    fn flush(&mut self,normalized: &[u8]) -> Result<Vec<u8>,DYNERR> {
        encode(self.volume,normalized)
    }
    fn has_fast_flush(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn codes_are_prefix_free() {
        let codes: Vec<(u32,usize)> = (0..=FAVORITES).map(|i| favorite_code(i)).collect();
        for (i,(c1,l1)) in codes.iter().enumerate() {
            assert_eq!(c1 >> (l1-1),1);
            for (j,(c2,l2)) in codes.iter().enumerate() {
                if i!=j && l1 <= l2 {
                    assert_ne!(c2 >> (l2-l1),*c1);
                }
            }
        }
    }

    #[test]
    fn whole_disk_round_trip() {
        let mut data = vec![0;TRACKS*TRACK_LEN];
        for i in 0..data.len() {
            data[i] = match (i/300) % 3 {
                0 => 0,
                1 => (i % 7) as u8,
                _ => (i*31 % 251) as u8
            };
        }
        let buf = encode(17,&data).unwrap();
        assert!(buf.len() < data.len());
        let (vol,back) = decode(&buf).unwrap();
        assert_eq!(vol,17);
        assert_eq!(back,data);
        let mut longer = buf.clone();
        longer.push(0);
        assert!(decode(&longer).is_err());
    }

    proptest! {
        #[test]
        fn track_inverse_law(track in proptest::collection::vec(prop_oneof![Just(0u8),Just(0xffu8),any::<u8>()],TRACK_LEN)) {
            let mut curs = BitCursor::new();
            encode_track(&track,&mut curs).unwrap();
            let mut rd = BitCursor::from_bytes(&curs.into_bytes());
            prop_assert_eq!(decode_track(&mut rd).unwrap(),track);
        }
    }
}
