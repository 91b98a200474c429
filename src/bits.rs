//! # Bit Cursor
//!
//! Bit-granular access to a byte buffer, used by the compressed and nibble
//! wrapper codecs.  Bits are always taken most significant first.
//!
//! The primitives are pure functions over a buffer and a bit offset, so they can be
//! exercised without any file I/O.  `BitCursor` bundles the two for sequential work.

/// Enumerates bit stream errors.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("bit stream ended early")]
    EndOfStream,
    #[error("bit count out of range")]
    BadCount
}

/// Read `count` bits (1 to 32) starting at `*bit_offset`, advancing the offset.
pub fn get_bits(buf: &[u8],bit_offset: &mut usize,count: usize) -> Result<u32,Error> {
    if count==0 || count>32 {
        return Err(Error::BadCount);
    }
    if *bit_offset + count > buf.len()*8 {
        return Err(Error::EndOfStream);
    }
    let mut ans: u32 = 0;
    for _i in 0..count {
        let byte = buf[*bit_offset/8];
        let bit = (byte >> (7 - *bit_offset%8)) & 1;
        ans = (ans << 1) | bit as u32;
        *bit_offset += 1;
    }
    Ok(ans)
}

/// Write the low `count` bits (1 to 32) of `val` at `*bit_offset`, advancing the offset.
/// The buffer grows as needed; new bytes start as zero.
pub fn put_bits(buf: &mut Vec<u8>,bit_offset: &mut usize,val: u32,count: usize) -> Result<(),Error> {
    if count==0 || count>32 {
        return Err(Error::BadCount);
    }
    for i in (0..count).rev() {
        let byte_idx = *bit_offset/8;
        if byte_idx >= buf.len() {
            buf.push(0);
        }
        let mask = 1 << (7 - *bit_offset%8);
        if (val >> i) & 1 == 1 {
            buf[byte_idx] |= mask;
        } else {
            buf[byte_idx] &= !mask;
        }
        *bit_offset += 1;
    }
    Ok(())
}

/// Sequential reader/writer over an owned buffer.
pub struct BitCursor {
    pub buffer: Vec<u8>,
    pub bit_offset: usize
}

impl BitCursor {
    pub fn new() -> Self {
        Self { buffer: Vec::new(), bit_offset: 0 }
    }
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self { buffer: buf.to_vec(), bit_offset: 0 }
    }
    pub fn get(&mut self,count: usize) -> Result<u32,Error> {
        get_bits(&self.buffer,&mut self.bit_offset,count)
    }
    pub fn get_u8(&mut self) -> Result<u8,Error> {
        Ok(self.get(8)? as u8)
    }
    pub fn put(&mut self,val: u32,count: usize) -> Result<(),Error> {
        put_bits(&mut self.buffer,&mut self.bit_offset,val,count)
    }
    /// bits not yet consumed
    pub fn remaining(&self) -> usize {
        (self.buffer.len()*8).saturating_sub(self.bit_offset)
    }
    /// byte position, rounding a partial byte up
    pub fn byte_pos(&self) -> usize {
        (self.bit_offset + 7) / 8
    }
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn msb_first() {
        let buf = [0b1010_0000,0xff];
        let mut off = 0;
        assert_eq!(get_bits(&buf,&mut off,3).unwrap(),0b101);
        assert_eq!(get_bits(&buf,&mut off,5).unwrap(),0);
        assert_eq!(get_bits(&buf,&mut off,8).unwrap(),0xff);
        assert!(get_bits(&buf,&mut off,1).is_err());
    }

    #[test]
    fn straddle_bytes() {
        let mut buf = Vec::new();
        let mut off = 3;
        put_bits(&mut buf,&mut off,0x1ff,9).unwrap();
        assert_eq!(buf,vec![0x1f,0xf0]);
        assert_eq!(off,12);
    }

    proptest! {
        #[test]
        fn put_then_get(vals in proptest::collection::vec((any::<u32>(),1usize..=32),1..64)) {
            let mut cur = BitCursor::new();
            for (v,n) in &vals {
                cur.put(*v,*n).unwrap();
            }
            cur.bit_offset = 0;
            for (v,n) in &vals {
                let mask = if *n==32 { u32::MAX } else { (1u32 << n) - 1 };
                prop_assert_eq!(cur.get(*n).unwrap(),v & mask);
            }
        }
    }
}
