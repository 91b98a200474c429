//! # Outer Wrapper Module
//!
//! Host level containers that may surround a disk image, at present gzip and zip.
//! Unwrapping always materializes the whole inner image in memory, so the expansion
//! is bounded by `MAX_EXPANDED_SIZE`.

use std::io::{Read,Write,Cursor};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug,info,warn};
use crate::DYNERR;

/// Largest inner image we are willing to expand
pub const MAX_EXPANDED_SIZE: usize = 1 << 30;
const GZIP_MAGIC: [u8;3] = [0x1f,0x8b,0x08];
const ZIP_MAGIC: [u8;4] = [0x50,0x4b,0x03,0x04];
const DEFAULT_MEMBER: &str = "disk.img";

/// Enumerates outer wrapper errors.  The `Display` trait will print equivalent long message.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("compressed stream is corrupt")]
    Corrupt,
    #[error("expanded image exceeds the size limit")]
    TooLarge,
    #[error("archive holds no usable image")]
    Archive
}

#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum OuterKind {
    Gzip,
    Zip
}

/// Remembers what is needed to re-wrap an inner image.
pub struct OuterWrapper {
    kind: OuterKind,
    member: String,
    damaged: bool
}

/// Cheap sniff of the container type.
pub fn test(buf: &[u8]) -> Option<OuterKind> {
    if buf.len() >= 18 && buf[0..3]==GZIP_MAGIC {
        return Some(OuterKind::Gzip);
    }
    if buf.len() >= 30 && buf[0..4]==ZIP_MAGIC {
        return Some(OuterKind::Zip);
    }
    None
}

/// Read until the end or the size bound.  With `lenient`, a decode failure keeps what was
/// decoded so far and reports damage through the second tuple member.
fn bounded_read(rdr: &mut dyn Read,lenient: bool,max: usize) -> Result<(Vec<u8>,bool),DYNERR> {
    let mut ans: Vec<u8> = Vec::new();
    let mut chunk = vec![0;0x10000];
    loop {
        match rdr.read(&mut chunk) {
            Ok(0) => return Ok((ans,false)),
            Ok(n) => {
                if ans.len() + n > max {
                    return Err(Box::new(Error::TooLarge));
                }
                ans.extend_from_slice(&chunk[0..n]);
            },
            Err(e) => {
                if lenient && ans.len() > 0 {
                    warn!("keeping {} bytes of damaged stream: {}",ans.len(),e);
                    return Ok((ans,true));
                }
                debug!("decompression failed: {}",e);
                return Err(Box::new(Error::Corrupt));
            }
        }
    }
}

/// Strip the container, returning the wrapper metadata and the inner image.
pub fn load(buf: &[u8],lenient: bool) -> Result<(OuterWrapper,Vec<u8>),DYNERR> {
    load_bounded(buf,lenient,MAX_EXPANDED_SIZE)
}

/// As `load`, with a caller supplied bound on the inner image size
pub fn load_bounded(buf: &[u8],lenient: bool,max: usize) -> Result<(OuterWrapper,Vec<u8>),DYNERR> {
    match test(buf) {
        Some(OuterKind::Gzip) => {
            let mut dec = GzDecoder::new(buf);
            let (inner,damaged) = bounded_read(&mut dec,lenient,max)?;
            info!("expanded gzip to {} bytes",inner.len());
            Ok((OuterWrapper { kind: OuterKind::Gzip, member: DEFAULT_MEMBER.to_string(), damaged },inner))
        },
        Some(OuterKind::Zip) => {
            let mut archive = zip::ZipArchive::new(Cursor::new(buf))?;
            for i in 0..archive.len() {
                let mut file = archive.by_index(i)?;
                if file.is_dir() {
                    continue;
                }
                if file.size() > max as u64 {
                    return Err(Box::new(Error::TooLarge));
                }
                let member = file.name().to_string();
                let (inner,damaged) = bounded_read(&mut file,lenient,max)?;
                info!("expanded zip member {} to {} bytes",member,inner.len());
                return Ok((OuterWrapper { kind: OuterKind::Zip, member, damaged },inner));
            }
            Err(Box::new(Error::Archive))
        },
        None => Err(Box::new(crate::img::Error::UnrecognizedFormat))
    }
}

impl OuterWrapper {
    pub fn new(kind: OuterKind) -> Self {
        Self { kind, member: DEFAULT_MEMBER.to_string(), damaged: false }
    }
    pub fn kind(&self) -> OuterKind {
        self.kind
    }
    /// true if the inner image was salvaged from a corrupt stream
    pub fn is_damaged(&self) -> bool {
        self.damaged
    }
    /// Re-wrap an inner image.
    pub fn save(&self,inner: &[u8]) -> Result<Vec<u8>,DYNERR> {
        match self.kind {
            OuterKind::Gzip => {
                let mut enc = GzEncoder::new(Vec::new(),Compression::default());
                enc.write_all(inner)?;
                Ok(enc.finish()?)
            },
            OuterKind::Zip => {
                let mut zw = zip::ZipWriter::new(Cursor::new(Vec::new()));
                let opt = zip::write::SimpleFileOptions::default()
                    .compression_method(zip::CompressionMethod::Deflated);
                zw.start_file(self.member.as_str(),opt)?;
                zw.write_all(inner)?;
                Ok(zw.finish()?.into_inner())
            }
        }
    }
}

#[test]
fn gzip_round_trip() {
    let inner: Vec<u8> = (0..5000).map(|i| (i%251) as u8).collect();
    let wrapped = OuterWrapper::new(OuterKind::Gzip).save(&inner).expect("gzip failed");
    assert_eq!(test(&wrapped),Some(OuterKind::Gzip));
    let (w,back) = load(&wrapped,false).expect("gunzip failed");
    assert!(!w.is_damaged());
    assert_eq!(back,inner);
}

#[test]
fn zip_round_trip() {
    let inner = vec![0xa5;143360];
    let wrapped = OuterWrapper::new(OuterKind::Zip).save(&inner).expect("zip failed");
    assert_eq!(test(&wrapped),Some(OuterKind::Zip));
    let (w,back) = load(&wrapped,false).expect("unzip failed");
    assert_eq!(w.kind(),OuterKind::Zip);
    assert_eq!(back,inner);
}

#[test]
fn size_bound() {
    let inner = vec![0;0x30000];
    let wrapped = OuterWrapper::new(OuterKind::Gzip).save(&inner).expect("gzip failed");
    match load_bounded(&wrapped,true,0x20000) {
        Err(e) => assert!(matches!(e.downcast_ref::<Error>(),Some(Error::TooLarge))),
        Ok(_) => panic!("bound was not enforced")
    }
    assert!(load_bounded(&wrapped,false,0x30000).is_ok());
}

#[test]
fn gzip_crc_mismatch() {
    let inner: Vec<u8> = (0..3000).map(|i| (i%7) as u8).collect();
    let mut wrapped = OuterWrapper::new(OuterKind::Gzip).save(&inner).expect("gzip failed");
    let n = wrapped.len();
    wrapped[n-8] ^= 0xff;
    assert!(load(&wrapped,false).is_err());
    let (w,back) = load(&wrapped,true).expect("lenient load failed");
    assert!(w.is_damaged());
    assert!(back.len() > 0);
}
