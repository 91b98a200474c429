//! # Disk Image Module
//!
//! A disk image file is peeled in layers.  An optional outer wrapper (gzip, zip) is stripped
//! by `crate::outer`, then an image wrapper (2MG, DiskCopy, DDD, ...) converts the wrapped bytes
//! into a normalized stream of blocks, sectors, or nibble tracks.  The normalized stream is held
//! by `DiskImg`, which is what file systems use as storage.
//!
//! ## Image Wrappers
//!
//! Each wrapper has its own submodule with a `test` function that cheaply sniffs the data,
//! a `prep` function that produces the normalized stream, and a `create` function for new images.
//! The wrapper object that comes back implements `ImageWrapper`, and remembers whatever it needs
//! to re-serialize the normalized stream (headers, comments, track tables).
//!
//! ## Addressing
//!
//! A `DiskImg` has exactly one addressing mode: a count of 512 byte blocks, a grid of 256 byte
//! sectors, or a list of variable length nibble tracks.  File systems ask for blocks or for
//! track and *logical* sector pairs; the image takes care of the sector order the file was saved
//! with.  The actual skew tables are in `bios::skew`.
//!
//! ## Sub-images
//!
//! Partitioned media are handled by creating child images over a byte range of the parent.
//! The child shares the parent's normalized data, so writes through the child land in the parent.

pub mod nibble;
pub mod dsk;
pub mod nib;
pub mod dot2mg;
pub mod dc42;
pub mod nufx;
pub mod ddd;
pub mod trackstar;
pub mod fdi;
pub mod sim2e;

use std::cell::{Cell,RefCell};
use std::rc::Rc;
use std::fmt;
use std::path::{Path,PathBuf};
use log::{trace,debug,info,warn};
use crate::bios::skew;
use crate::fs::usage::LinearBitmap;
use crate::outer::{self,OuterWrapper};
use crate::{STDRESULT,DYNERR};
use nibble::NibbleFormat;

pub const BLOCK_SIZE: usize = 512;
pub const SECTOR_SIZE: usize = 256;

/// Enumerates disk image errors.  The `Display` trait will print equivalent long message.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("unrecognized disk image format")]
    UnrecognizedFormat,
    #[error("disk image is corrupt")]
    Corrupt,
    #[error("image size did not match the request")]
    ImageSizeMismatch,
    #[error("decoded image exceeds the size limit")]
    TooLarge,
    #[error("block, track, or sector out of range")]
    OutOfRange,
    #[error("block is marked bad")]
    BadBlock,
    #[error("disk image is read only")]
    ReadOnly,
    #[error("sector order has not been resolved")]
    OrderUnresolved,
    #[error("operation not supported by this image")]
    Unsupported
}

/// Errors pertaining to nibble encoding
#[derive(thiserror::Error,Debug)]
pub enum NibbleError {
    #[error("could not interpret track data")]
    BadTrack,
    #[error("invalid byte while decoding")]
    InvalidByte,
    #[error("bad checksum found in a sector")]
    BadChecksum,
    #[error("could not find bit pattern")]
    BitPatternNotFound,
    #[error("sector not found")]
    SectorNotFound,
    #[error("nibble type appeared in wrong context")]
    NibbleType
}

/// Order in which 16-sector tracks were saved to the image
#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum SectorOrder {
    Dos,
    ProDos,
    Physical,
    Unknown
}

impl fmt::Display for SectorOrder {
    fn fmt(&self,f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dos => write!(f,"DOS"),
            Self::ProDos => write!(f,"ProDOS"),
            Self::Physical => write!(f,"physical"),
            Self::Unknown => write!(f,"unknown")
        }
    }
}

/// How the normalized stream represents the media
#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum PhysicalFormat {
    Sectors,
    /// 5.25 inch nibbles in 6656 byte track slots
    Nib525_6656,
    /// 5.25 inch nibbles in 6384 byte track slots
    Nib525_6384,
    /// 5.25 inch nibbles with a length per track
    Nib525Var
}

/// Per-track nibble table, consulted by every track access so that a track shorter
/// than its storage slot is read correctly.
#[derive(Clone,PartialEq,Debug)]
pub struct NibbleLayout {
    pub format: NibbleFormat,
    pub length: Vec<usize>,
    pub offset: Vec<usize>
}

impl NibbleLayout {
    /// every track in a slot of the same size
    pub fn fixed(format: NibbleFormat,tracks: usize,slot: usize) -> Self {
        Self {
            format,
            length: vec![slot;tracks],
            offset: (0..tracks).map(|t| t*slot).collect()
        }
    }
    /// tracks packed back to back with the given lengths
    pub fn packed(format: NibbleFormat,length: Vec<usize>) -> Self {
        let mut offset = Vec::new();
        let mut end = 0;
        for l in &length {
            offset.push(end);
            end += l;
        }
        Self { format, length, offset }
    }
    pub fn count(&self) -> usize {
        self.length.len()
    }
    pub fn total_len(&self) -> usize {
        match (self.offset.last(),self.length.last()) {
            (Some(o),Some(l)) => o + l,
            _ => 0
        }
    }
}

/// The active addressing mode
#[derive(Clone,PartialEq,Debug)]
pub enum Addressing {
    Blocks(usize),
    Sectors { tracks: usize, sectors: usize },
    Nibbles(NibbleLayout)
}

#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum WrapperKind {
    Raw,
    RawNibble,
    Dot2mg,
    DiskCopy42,
    NuFX,
    Ddd,
    TrackStar,
    Fdi,
    Sim2e
}

impl fmt::Display for WrapperKind {
    fn fmt(&self,f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => write!(f,"unadorned sectors"),
            Self::RawNibble => write!(f,"unadorned nibbles"),
            Self::Dot2mg => write!(f,"2MG"),
            Self::DiskCopy42 => write!(f,"DiskCopy 4.2"),
            Self::NuFX => write!(f,"NuFX disk image"),
            Self::Ddd => write!(f,"DDD"),
            Self::TrackStar => write!(f,"TrackStar"),
            Self::Fdi => write!(f,"FDI"),
            Self::Sim2e => write!(f,"Sim //e HDV")
        }
    }
}

/// Output of a wrapper's read path
pub struct Prepped {
    pub data: Vec<u8>,
    pub addressing: Addressing,
    pub order: SectorOrder,
    pub phys: PhysicalFormat,
    pub volume: Option<u8>,
    pub bad_blocks: Option<LinearBitmap>,
    /// wrapper insists on read only access (locked flag, failed checksum)
    pub read_only: bool,
    pub damaged: bool
}

impl Prepped {
    pub fn new(data: Vec<u8>,addressing: Addressing,order: SectorOrder,phys: PhysicalFormat) -> Self {
        Self { data, addressing, order, phys, volume: None, bad_blocks: None, read_only: false, damaged: false }
    }
}

/// Parameters of a new image
#[derive(Clone,PartialEq,Debug)]
pub struct CreateParams {
    /// for nibble formats give the sector geometry, the track layout is derived
    pub addressing: Addressing,
    pub phys: PhysicalFormat,
    pub order: SectorOrder,
    pub volume: Option<u8>
}

impl CreateParams {
    /// 140K 5.25 inch sectors
    pub fn dos_525(order: SectorOrder) -> Self {
        Self { addressing: Addressing::Sectors { tracks: 35, sectors: 16 }, phys: PhysicalFormat::Sectors, order, volume: None }
    }
    /// a ProDOS ordered block device
    pub fn blocks(count: usize) -> Self {
        Self { addressing: Addressing::Blocks(count), phys: PhysicalFormat::Sectors, order: SectorOrder::ProDos, volume: None }
    }
    /// byte length of the equivalent sector image
    pub fn sector_bytes(&self) -> usize {
        match &self.addressing {
            Addressing::Blocks(n) => n * BLOCK_SIZE,
            Addressing::Sectors { tracks, sectors } => tracks * sectors * SECTOR_SIZE,
            Addressing::Nibbles(layout) => layout.count() * layout.format.sectors() * SECTOR_SIZE
        }
    }
}

/// Re-serialization side of an image wrapper
pub trait ImageWrapper {
    fn kind(&self) -> WrapperKind;
    /// Produce the complete wrapped file from the normalized stream.
    fn flush(&mut self,normalized: &[u8]) -> Result<Vec<u8>,DYNERR>;
    /// True if the wrapped file holds the normalized stream verbatim, so that a change
    /// can be written back in place.
    fn has_fast_flush(&self) -> bool;
}

type PrepFn = fn(&[u8],&str) -> Result<(Box<dyn ImageWrapper>,Prepped),DYNERR>;

/// Entry in the ordered list of image wrappers
struct WrapperEntry {
    kind: WrapperKind,
    test: fn(&[u8]) -> bool,
    prep: PrepFn
}

fn prep_2mg(buf: &[u8],_ext: &str) -> Result<(Box<dyn ImageWrapper>,Prepped),DYNERR> {
    let (w,p) = dot2mg::prep(buf)?;
    Ok((Box::new(w),p))
}
fn prep_dc42(buf: &[u8],_ext: &str) -> Result<(Box<dyn ImageWrapper>,Prepped),DYNERR> {
    let (w,p) = dc42::prep(buf)?;
    Ok((Box::new(w),p))
}
fn prep_nufx(buf: &[u8],_ext: &str) -> Result<(Box<dyn ImageWrapper>,Prepped),DYNERR> {
    let (w,p) = nufx::prep(buf,None)?;
    Ok((Box::new(w),p))
}
fn prep_sim2e(buf: &[u8],_ext: &str) -> Result<(Box<dyn ImageWrapper>,Prepped),DYNERR> {
    let (w,p) = sim2e::prep(buf)?;
    Ok((Box::new(w),p))
}
fn prep_fdi(buf: &[u8],_ext: &str) -> Result<(Box<dyn ImageWrapper>,Prepped),DYNERR> {
    let (w,p) = fdi::prep(buf)?;
    Ok((Box::new(w),p))
}
fn prep_trackstar(buf: &[u8],_ext: &str) -> Result<(Box<dyn ImageWrapper>,Prepped),DYNERR> {
    let (w,p) = trackstar::prep(buf)?;
    Ok((Box::new(w),p))
}
fn prep_ddd(buf: &[u8],_ext: &str) -> Result<(Box<dyn ImageWrapper>,Prepped),DYNERR> {
    let (w,p) = ddd::prep(buf)?;
    Ok((Box::new(w),p))
}
fn prep_nib(buf: &[u8],_ext: &str) -> Result<(Box<dyn ImageWrapper>,Prepped),DYNERR> {
    let (w,p) = nib::prep(buf)?;
    Ok((Box::new(w),p))
}
fn prep_dsk(buf: &[u8],ext: &str) -> Result<(Box<dyn ImageWrapper>,Prepped),DYNERR> {
    let (w,p) = dsk::prep(buf,ext)?;
    Ok((Box::new(w),p))
}

/// Candidate wrappers in the order they are tried.  Formats with a signature come first,
/// unadorned formats that can only be recognized by size come last.
const WRAPPERS: [WrapperEntry;9] = [
    WrapperEntry { kind: WrapperKind::Dot2mg, test: dot2mg::test, prep: prep_2mg },
    WrapperEntry { kind: WrapperKind::DiskCopy42, test: dc42::test, prep: prep_dc42 },
    WrapperEntry { kind: WrapperKind::NuFX, test: nufx::test, prep: prep_nufx },
    WrapperEntry { kind: WrapperKind::Sim2e, test: sim2e::test, prep: prep_sim2e },
    WrapperEntry { kind: WrapperKind::Fdi, test: fdi::test, prep: prep_fdi },
    WrapperEntry { kind: WrapperKind::TrackStar, test: trackstar::test, prep: prep_trackstar },
    WrapperEntry { kind: WrapperKind::Ddd, test: ddd::test, prep: prep_ddd },
    WrapperEntry { kind: WrapperKind::RawNibble, test: nib::test, prep: prep_nib },
    WrapperEntry { kind: WrapperKind::Raw, test: dsk::test, prep: prep_dsk }
];

/// All file extensions we associate with disk images
pub fn file_extensions() -> Vec<String> {
    [dsk::file_extensions(),nib::file_extensions(),dot2mg::file_extensions(),dc42::file_extensions(),
        nufx::file_extensions(),ddd::file_extensions(),trackstar::file_extensions(),fdi::file_extensions(),
        sim2e::file_extensions()].concat()
}

/// Make a wrapper and initial normalized stream for a new image.
pub fn create_wrapper(kind: WrapperKind,params: &CreateParams) -> Result<(Box<dyn ImageWrapper>,Prepped),DYNERR> {
    Ok(match kind {
        WrapperKind::Raw => { let (w,p) = dsk::create(params)?; (Box::new(w),p) },
        WrapperKind::RawNibble => { let (w,p) = nib::create(params)?; (Box::new(w),p) },
        WrapperKind::Dot2mg => { let (w,p) = dot2mg::create(params)?; (Box::new(w),p) },
        WrapperKind::DiskCopy42 => { let (w,p) = dc42::create(params)?; (Box::new(w),p) },
        WrapperKind::NuFX => { let (w,p) = nufx::create(params)?; (Box::new(w),p) },
        WrapperKind::Ddd => { let (w,p) = ddd::create(params)?; (Box::new(w),p) },
        WrapperKind::TrackStar => { let (w,p) = trackstar::create(params)?; (Box::new(w),p) },
        WrapperKind::Sim2e => { let (w,p) = sim2e::create(params)?; (Box::new(w),p) },
        WrapperKind::Fdi => return Err(Box::new(Error::Unsupported))
    })
}

/// Encode blank 5.25 inch tracks, used by wrappers that create nibble images.
pub fn blank_nibble_tracks(format: NibbleFormat,tracks: usize,slot: usize,volume: u8) -> Result<Vec<u8>,DYNERR> {
    let mut ans: Vec<u8> = Vec::new();
    let sectors = vec![vec![0;SECTOR_SIZE];format.sectors()];
    for t in 0..tracks {
        let mut nibs = nibble::encode_track(format,volume,t as u8,&sectors)?;
        if nibs.len() > slot {
            return Err(Box::new(Error::ImageSizeMismatch));
        }
        nibs.resize(slot,0xff);
        ans.append(&mut nibs);
    }
    Ok(ans)
}

/// Which 5.25 inch format a nibble track carries, judged by the first readable address field.
/// Also returns the volume number from that field.
pub fn sniff_nibble_format(nibs: &[u8],track: u8) -> Option<(NibbleFormat,u8)> {
    for fmt in [NibbleFormat::Dos33,NibbleFormat::Dos32] {
        if let Some(vol) = nibble::find_volume(nibs,fmt,track) {
            trace!("track {} looks like {:?}",track,fmt);
            return Some((fmt,vol));
        }
    }
    None
}

/// Decode a nibble stream into 256 byte sectors in DOS logical order.
/// Unreadable sectors are zero filled and listed in the second tuple member as (track,sector).
pub fn nibbles_to_sectors(data: &[u8],layout: &NibbleLayout) -> (Vec<u8>,Vec<[usize;2]>) {
    let mut ans: Vec<u8> = Vec::new();
    let mut bad: Vec<[usize;2]> = Vec::new();
    let spt = layout.format.sectors();
    for t in 0..layout.count() {
        let nibs = &data[layout.offset[t]..layout.offset[t]+layout.length[t]];
        for s in 0..spt {
            let psec = match layout.format {
                NibbleFormat::Dos33 => skew::dos_lsec_to_psec(s),
                NibbleFormat::Dos32 => s
            };
            match nibble::read_sector(nibs,layout.format,t as u8,psec as u8) {
                Ok(dat) => ans.extend_from_slice(&dat),
                Err(_) => {
                    bad.push([t,s]);
                    ans.extend_from_slice(&[0;SECTOR_SIZE]);
                }
            }
        }
    }
    (ans,bad)
}

/// Re-encode sectors in DOS logical order as standard nibble tracks.
pub fn sectors_to_nibbles(sectors: &[u8],format: NibbleFormat,tracks: usize,slot: usize,volume: u8) -> Result<Vec<u8>,DYNERR> {
    let spt = format.sectors();
    if sectors.len() != tracks*spt*SECTOR_SIZE {
        return Err(Box::new(Error::ImageSizeMismatch));
    }
    let mut ans: Vec<u8> = Vec::new();
    for t in 0..tracks {
        let mut phys = vec![Vec::new();spt];
        for s in 0..spt {
            let psec = match format {
                NibbleFormat::Dos33 => skew::dos_lsec_to_psec(s),
                NibbleFormat::Dos32 => s
            };
            let off = (t*spt + s)*SECTOR_SIZE;
            phys[psec] = sectors[off..off+SECTOR_SIZE].to_vec();
        }
        let mut nibs = nibble::encode_track(format,volume,t as u8,&phys)?;
        if nibs.len() > slot {
            return Err(Box::new(Error::ImageSizeMismatch));
        }
        nibs.resize(slot,0xff);
        ans.append(&mut nibs);
    }
    Ok(ans)
}

/// Lower case extension of a path, looking through a trailing `.gz`
pub fn inner_extension(path: &str) -> String {
    let lower = path.to_lowercase();
    let trimmed = match lower.strip_suffix(".gz") {
        Some(s) => s.to_string(),
        None => lower
    };
    match Path::new(&trimmed).extension() {
        Some(e) => e.to_string_lossy().to_string(),
        None => String::new()
    }
}

/// How a child image sees the parent's bytes
#[derive(Clone,Copy,PartialEq,Eq,Debug)]
enum View {
    Linear,
    /// the given 256 byte half of every 512 byte block
    Paired(usize)
}

/// Where a top level image came from, used to save it back
struct Source {
    wrapper: Box<dyn ImageWrapper>,
    outer: Option<OuterWrapper>,
    path: Option<PathBuf>
}

/// The normalized disk image
pub struct DiskImg {
    data: Rc<RefCell<Vec<u8>>>,
    dirty: Rc<Cell<bool>>,
    base: usize,
    len: usize,
    view: View,
    addressing: Addressing,
    order: SectorOrder,
    phys: PhysicalFormat,
    volume: Option<u8>,
    bad_blocks: Option<LinearBitmap>,
    read_only: bool,
    damaged: bool,
    source: Option<Source>
}

impl DiskImg {
    fn from_prepped(p: Prepped,wrapper: Box<dyn ImageWrapper>,outer: Option<OuterWrapper>,read_only: bool) -> Self {
        let len = p.data.len();
        Self {
            data: Rc::new(RefCell::new(p.data)),
            dirty: Rc::new(Cell::new(false)),
            base: 0,
            len,
            view: View::Linear,
            addressing: p.addressing,
            order: p.order,
            phys: p.phys,
            volume: p.volume,
            bad_blocks: p.bad_blocks,
            read_only: read_only || p.read_only,
            damaged: p.damaged,
            source: Some(Source { wrapper, outer, path: None })
        }
    }
    /// Create a new zeroed image held by the given wrapper
    pub fn create(kind: WrapperKind,params: &CreateParams) -> Result<Self,DYNERR> {
        let (wrapper,prepped) = create_wrapper(kind,params)?;
        info!("created {} image of {} bytes",kind,prepped.data.len());
        let mut ans = Self::from_prepped(prepped,wrapper,None,false);
        ans.dirty.set(true);
        Ok(ans)
    }
    /// Identify and unwrap an image file's bytes.  The extension, if any, helps unadorned formats.
    pub fn open_bytes(buf: &[u8],ext: &str,read_only: bool,lenient: bool) -> Result<Self,DYNERR> {
        Self::open_bytes_bounded(buf,ext,read_only,lenient,outer::MAX_EXPANDED_SIZE)
    }
    /// As `open_bytes`, bounding the size of an image expanded from gzip or zip
    pub fn open_bytes_bounded(buf: &[u8],ext: &str,read_only: bool,lenient: bool,max_expanded: usize) -> Result<Self,DYNERR> {
        let (outer_wrapper,inner) = match outer::test(buf) {
            Some(_) => {
                let (w,inner) = outer::load_bounded(buf,lenient,max_expanded)?;
                (Some(w),inner)
            },
            None => (None,buf.to_vec())
        };
        let outer_damaged = outer_wrapper.as_ref().map_or(false,|w| w.is_damaged());
        let ext = ext.to_lowercase();
        for entry in WRAPPERS.iter() {
            if !(entry.test)(&inner) {
                continue;
            }
            match (entry.prep)(&inner,&ext) {
                Ok((wrapper,prepped)) => {
                    info!("identified {} image",entry.kind);
                    let mut ans = Self::from_prepped(prepped,wrapper,outer_wrapper,read_only || outer_damaged);
                    ans.damaged |= outer_damaged;
                    return Ok(ans);
                },
                Err(e) => {
                    debug!("{} passed test but failed prep: {}",entry.kind,e);
                    if let Some(Error::TooLarge) = e.downcast_ref::<Error>() {
                        return Err(e);
                    }
                }
            }
        }
        Err(Box::new(Error::UnrecognizedFormat))
    }
    /// Open an image file; `close` or `flush` will write changes back to the same path.
    pub fn open_path(path: &Path,read_only: bool,lenient: bool) -> Result<Self,DYNERR> {
        let buf = std::fs::read(path)?;
        let ext = inner_extension(&path.to_string_lossy());
        let mut ans = Self::open_bytes(&buf,&ext,read_only,lenient)?;
        if let Some(src) = ans.source.as_mut() {
            src.path = Some(path.to_path_buf());
        }
        Ok(ans)
    }
    /// Set the path that `flush` will write to
    pub fn set_path(&mut self,path: &Path) {
        if let Some(src) = self.source.as_mut() {
            src.path = Some(path.to_path_buf());
        }
    }
    /// Child image over a range of this image's bytes.  With `paired`, the child sees only
    /// the given 256 byte half of each 512 byte block in the range.
    pub fn sub_image(&self,offset: usize,len: usize,addressing: Addressing,order: SectorOrder,paired: Option<usize>) -> Result<Self,DYNERR> {
        let span = match paired {
            Some(_) => len*2,
            None => len
        };
        if self.view != View::Linear || offset + span > self.len {
            debug!("sub-image {}+{} does not fit in {}",offset,span,self.len);
            return Err(Box::new(Error::OutOfRange));
        }
        Ok(Self {
            data: Rc::clone(&self.data),
            dirty: Rc::clone(&self.dirty),
            base: self.base + offset,
            len,
            view: match paired { Some(k) => View::Paired(k & 1), None => View::Linear },
            addressing,
            order,
            phys: PhysicalFormat::Sectors,
            volume: None,
            bad_blocks: None,
            read_only: self.read_only,
            damaged: self.damaged,
            source: None
        })
    }
    pub fn addressing(&self) -> &Addressing {
        &self.addressing
    }
    pub fn order(&self) -> SectorOrder {
        self.order
    }
    pub fn set_order(&mut self,order: SectorOrder) {
        self.order = order;
    }
    pub fn phys(&self) -> PhysicalFormat {
        self.phys
    }
    /// volume number recorded by the wrapper or nibble address fields
    pub fn volume(&self) -> Option<u8> {
        self.volume
    }
    pub fn wrapper_kind(&self) -> Option<WrapperKind> {
        self.source.as_ref().map(|s| s.wrapper.kind())
    }
    /// host container the image was expanded from
    pub fn outer_kind(&self) -> Option<outer::OuterKind> {
        self.source.as_ref().and_then(|s| s.outer.as_ref()).map(|o| o.kind())
    }
    pub fn has_fast_flush(&self) -> bool {
        self.source.as_ref().map_or(false,|s| s.wrapper.has_fast_flush())
    }
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
    pub fn set_read_only(&mut self,read_only: bool) {
        self.read_only = read_only;
    }
    /// true if a wrapper level checksum or stream failed
    pub fn is_damaged(&self) -> bool {
        self.damaged
    }
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }
    /// length in bytes of the normalized stream seen by this image
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn set_bad_blocks(&mut self,map: Option<LinearBitmap>) {
        self.bad_blocks = map;
    }
    pub fn sectors_per_track(&self) -> usize {
        match &self.addressing {
            Addressing::Blocks(_) => 16,
            Addressing::Sectors { tracks: _, sectors } => *sectors,
            Addressing::Nibbles(layout) => layout.format.sectors()
        }
    }
    pub fn num_tracks(&self) -> usize {
        match &self.addressing {
            Addressing::Blocks(n) => n / 8,
            Addressing::Sectors { tracks, sectors: _ } => *tracks,
            Addressing::Nibbles(layout) => layout.count()
        }
    }
    /// Count of 512 byte blocks.  13-sector media count whole blocks only.
    pub fn num_blocks(&self) -> usize {
        match &self.addressing {
            Addressing::Blocks(n) => *n,
            Addressing::Sectors { tracks, sectors } => tracks * sectors / 2,
            Addressing::Nibbles(layout) => layout.count() * layout.format.sectors() / 2
        }
    }
    /// true if track and sector requests make sense
    pub fn sector_capable(&self) -> bool {
        match &self.addressing {
            Addressing::Blocks(n) => n % 8 == 0,
            _ => true
        }
    }
    /// true if sector requests depend on the sector order
    pub fn order_matters(&self) -> bool {
        match &self.addressing {
            Addressing::Sectors { tracks: _, sectors } => *sectors==16,
            _ => false
        }
    }

    /// Map an offset of this image to an offset in the shared data
    fn abs(&self,offset: usize) -> usize {
        match self.view {
            View::Linear => self.base + offset,
            View::Paired(k) => self.base + (offset/SECTOR_SIZE)*BLOCK_SIZE + k*SECTOR_SIZE + offset%SECTOR_SIZE
        }
    }
    /// Read a 256 byte aligned span
    fn read_span(&self,offset: usize,len: usize) -> Result<Vec<u8>,DYNERR> {
        if offset + len > self.len {
            return Err(Box::new(Error::OutOfRange));
        }
        let data = self.data.borrow();
        let mut ans = Vec::with_capacity(len);
        let mut done = 0;
        while done < len {
            let chunk = match self.view {
                View::Linear => len,
                View::Paired(_) => usize::min(SECTOR_SIZE,len-done)
            };
            let start = self.abs(offset+done);
            ans.extend_from_slice(&data[start..start+chunk]);
            done += chunk;
        }
        Ok(ans)
    }
    fn write_span(&mut self,offset: usize,dat: &[u8]) -> STDRESULT {
        if self.read_only {
            return Err(Box::new(Error::ReadOnly));
        }
        if offset + dat.len() > self.len {
            return Err(Box::new(Error::OutOfRange));
        }
        let mut done = 0;
        let mut data = self.data.borrow_mut();
        while done < dat.len() {
            let chunk = match self.view {
                View::Linear => dat.len(),
                View::Paired(_) => usize::min(SECTOR_SIZE,dat.len()-done)
            };
            let start = self.abs(offset+done);
            data[start..start+chunk].copy_from_slice(&dat[done..done+chunk]);
            done += chunk;
        }
        self.dirty.set(true);
        Ok(())
    }
    /// Byte offset of a logical sector in a sector or block addressed image
    fn sector_offset(&self,track: usize,sector: usize) -> Result<usize,DYNERR> {
        match &self.addressing {
            Addressing::Sectors { tracks, sectors } => {
                if track >= *tracks || sector >= *sectors {
                    return Err(Box::new(Error::OutOfRange));
                }
                let slot = match (*sectors,self.order) {
                    (16,SectorOrder::Dos) => sector,
                    (16,SectorOrder::ProDos) => skew::dos_lsec_to_po_slot(sector),
                    (16,SectorOrder::Physical) => skew::dos_lsec_to_psec(sector),
                    (16,SectorOrder::Unknown) => return Err(Box::new(Error::OrderUnresolved)),
                    _ => sector
                };
                Ok((track*sectors + slot)*SECTOR_SIZE)
            },
            Addressing::Blocks(n) => {
                if sector >= 16 || track >= n/8 {
                    return Err(Box::new(Error::OutOfRange));
                }
                let (block,off) = skew::prodos_block_from_ts(track,sector);
                Ok(block*BLOCK_SIZE + off)
            },
            Addressing::Nibbles(_) => Err(Box::new(Error::Unsupported))
        }
    }
    fn check_bad_ts(&self,track: usize,sector: usize) -> STDRESULT {
        if let Some(map) = &self.bad_blocks {
            if self.sectors_per_track()==16 {
                let (block,_) = skew::prodos_block_from_ts(track,sector);
                if map.is_set(block) {
                    return Err(Box::new(Error::BadBlock));
                }
            }
        }
        Ok(())
    }
    fn nibble_track(&self,layout: &NibbleLayout,track: usize) -> Result<(usize,usize),DYNERR> {
        if track >= layout.count() || layout.length[track]==0 {
            return Err(Box::new(Error::OutOfRange));
        }
        Ok((layout.offset[track],layout.length[track]))
    }
    fn nibble_psec(format: NibbleFormat,sector: usize) -> usize {
        match format {
            NibbleFormat::Dos33 => skew::dos_lsec_to_psec(sector),
            NibbleFormat::Dos32 => sector
        }
    }
    /// Read a 256 byte sector, `sector` is a logical sector number
    pub fn read_sector(&self,track: usize,sector: usize) -> Result<Vec<u8>,DYNERR> {
        trace!("read track {} sector {}",track,sector);
        self.check_bad_ts(track,sector)?;
        if let Addressing::Nibbles(layout) = &self.addressing {
            if sector >= layout.format.sectors() {
                return Err(Box::new(Error::OutOfRange));
            }
            let (off,len) = self.nibble_track(layout,track)?;
            let nibs = self.read_raw(off,len)?;
            let psec = Self::nibble_psec(layout.format,sector);
            return Ok(nibble::read_sector(&nibs,layout.format,track as u8,psec as u8)?);
        }
        let off = self.sector_offset(track,sector)?;
        self.read_span(off,SECTOR_SIZE)
    }
    /// Write a 256 byte sector, `sector` is a logical sector number
    pub fn write_sector(&mut self,track: usize,sector: usize,dat: &[u8]) -> STDRESULT {
        trace!("write track {} sector {}",track,sector);
        if self.read_only {
            return Err(Box::new(Error::ReadOnly));
        }
        let mut buf = dat.to_vec();
        buf.resize(SECTOR_SIZE,0);
        if let Addressing::Nibbles(layout) = self.addressing.clone() {
            if sector >= layout.format.sectors() {
                return Err(Box::new(Error::OutOfRange));
            }
            let (off,len) = self.nibble_track(&layout,track)?;
            let mut nibs = self.read_raw(off,len)?;
            let psec = Self::nibble_psec(layout.format,sector);
            nibble::write_sector(&mut nibs,layout.format,track as u8,psec as u8,&buf)?;
            return self.write_span(off,&nibs);
        }
        let off = self.sector_offset(track,sector)?;
        self.write_span(off,&buf)
    }
    /// Read a 512 byte block
    pub fn read_block(&self,block: usize) -> Result<Vec<u8>,DYNERR> {
        trace!("read block {}",block);
        if let Some(map) = &self.bad_blocks {
            if map.is_set(block) {
                return Err(Box::new(Error::BadBlock));
            }
        }
        match &self.addressing {
            Addressing::Blocks(n) => {
                if block >= *n {
                    return Err(Box::new(Error::OutOfRange));
                }
                self.read_span(block*BLOCK_SIZE,BLOCK_SIZE)
            },
            Addressing::Sectors { tracks: _, sectors } if *sectors!=16 => {
                self.read_span(block*BLOCK_SIZE,BLOCK_SIZE)
            },
            Addressing::Nibbles(layout) if layout.format!=NibbleFormat::Dos33 => Err(Box::new(Error::Unsupported)),
            _ => {
                let mut ans = Vec::with_capacity(BLOCK_SIZE);
                for [t,s] in skew::ts_from_prodos_block(block) {
                    ans.append(&mut self.read_sector(t,s)?);
                }
                Ok(ans)
            }
        }
    }
    /// Write a 512 byte block, short data is padded with zeros
    pub fn write_block(&mut self,block: usize,dat: &[u8]) -> STDRESULT {
        trace!("write block {}",block);
        if self.read_only {
            return Err(Box::new(Error::ReadOnly));
        }
        let mut buf = dat.to_vec();
        buf.resize(BLOCK_SIZE,0);
        match self.addressing.clone() {
            Addressing::Blocks(n) => {
                if block >= n {
                    return Err(Box::new(Error::OutOfRange));
                }
                self.write_span(block*BLOCK_SIZE,&buf)
            },
            Addressing::Sectors { tracks: _, sectors } if sectors!=16 => {
                self.write_span(block*BLOCK_SIZE,&buf)
            },
            Addressing::Nibbles(layout) if layout.format!=NibbleFormat::Dos33 => Err(Box::new(Error::Unsupported)),
            _ => {
                let [[t1,s1],[t2,s2]] = skew::ts_from_prodos_block(block);
                self.write_sector(t1,s1,&buf[0..SECTOR_SIZE])?;
                self.write_sector(t2,s2,&buf[SECTOR_SIZE..BLOCK_SIZE])
            }
        }
    }
    /// Read bytes of the normalized stream directly, for nibble tracks and partition maps
    pub fn read_raw(&self,offset: usize,len: usize) -> Result<Vec<u8>,DYNERR> {
        if self.view != View::Linear {
            return Err(Box::new(Error::Unsupported));
        }
        self.read_span(offset,len)
    }
    /// Copy of the whole normalized stream seen by this image
    pub fn normalized(&self) -> Vec<u8> {
        match self.read_span(0,self.len) {
            Ok(v) => v,
            Err(_) => Vec::new()
        }
    }
    /// Re-serialize through the image wrapper and outer wrapper
    pub fn to_bytes(&mut self) -> Result<Vec<u8>,DYNERR> {
        let normalized = self.normalized();
        match self.source.as_mut() {
            Some(src) => {
                let wrapped = src.wrapper.flush(&normalized)?;
                match &src.outer {
                    Some(o) => o.save(&wrapped),
                    None => Ok(wrapped)
                }
            },
            None => Err(Box::new(Error::Unsupported))
        }
    }
    /// Write pending changes back to the file the image came from.
    /// Child images leave this to the top level image.
    pub fn flush(&mut self) -> STDRESULT {
        if !self.dirty.get() {
            return Ok(());
        }
        let path = match self.source.as_ref().and_then(|s| s.path.clone()) {
            Some(p) => p,
            None => return Ok(())
        };
        if self.read_only {
            warn!("{} is read only, pending changes were not saved",path.display());
            return Ok(());
        }
        let bytes = self.to_bytes()?;
        std::fs::write(&path,bytes)?;
        info!("saved {}",path.display());
        self.dirty.set(false);
        Ok(())
    }
    /// Flush and release the image
    pub fn close(mut self) -> STDRESULT {
        self.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dos_order_mapping() {
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Dos)).unwrap();
        img.write_sector(17,14,&vec![0xee;256]).unwrap();
        let raw = img.normalized();
        assert_eq!(raw[(17*16+14)*256],0xee);
        // the same bytes seen as a ProDOS ordered image sit in a different slot
        img.set_order(SectorOrder::ProDos);
        assert_eq!(img.read_sector(17,1).unwrap(),vec![0xee;256]);
    }

    #[test]
    fn block_to_sector_consistency() {
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Dos)).unwrap();
        let dat: Vec<u8> = (0..512).map(|i| (i/2) as u8).collect();
        img.write_block(5,&dat).unwrap();
        let [[t1,s1],[t2,s2]] = skew::ts_from_prodos_block(5);
        assert_eq!(img.read_sector(t1,s1).unwrap(),dat[0..256].to_vec());
        assert_eq!(img.read_sector(t2,s2).unwrap(),dat[256..512].to_vec());
        assert_eq!(img.read_block(5).unwrap(),dat);
        assert!(img.read_block(280).is_err());
    }

    #[test]
    fn unresolved_order() {
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Unknown)).unwrap();
        assert!(img.read_sector(0,0).is_err());
        img.set_order(SectorOrder::Physical);
        assert!(img.read_sector(0,0).is_ok());
    }

    #[test]
    fn paired_children() {
        let img = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(1600)).unwrap();
        let geom = Addressing::Sectors { tracks: 50, sectors: 32 };
        let mut a = img.sub_image(0,409600,geom.clone(),SectorOrder::Physical,Some(0)).unwrap();
        let mut b = img.sub_image(0,409600,geom,SectorOrder::Physical,Some(1)).unwrap();
        a.write_sector(0,1,&vec![1;256]).unwrap();
        b.write_sector(0,1,&vec![2;256]).unwrap();
        let blk = img.read_block(1).unwrap();
        assert_eq!(blk[0..256],vec![1;256][..]);
        assert_eq!(blk[256..512],vec![2;256][..]);
        assert!(img.is_dirty());
    }

    #[test]
    fn bad_block_refused() {
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(280)).unwrap();
        let mut map = LinearBitmap::new(280);
        map.set(7);
        img.set_bad_blocks(Some(map));
        assert!(img.read_block(6).is_ok());
        assert!(img.read_block(7).is_err());
    }

    #[test]
    fn read_only_flush_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.do");
        std::fs::write(&path,vec![0;143360]).unwrap();
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Dos)).unwrap();
        img.set_path(&path);
        img.write_sector(3,4,&vec![0x55;256]).unwrap();
        img.set_read_only(true);
        assert!(img.flush().is_ok());
        assert!(img.is_dirty());
        assert_eq!(std::fs::read(&path).unwrap(),vec![0;143360]);
        img.set_read_only(false);
        img.flush().unwrap();
        assert!(!img.is_dirty());
        assert_eq!(std::fs::read(&path).unwrap()[(3*16+4)*256],0x55);
    }

    #[test]
    fn extension_through_gzip() {
        assert_eq!(inner_extension("/tmp/Disk.PO.gz"),"po");
        assert_eq!(inner_extension("game.dsk"),"dsk");
        assert_eq!(inner_extension("noext"),"");
    }
}
