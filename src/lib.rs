//! # `diskimg` main library
//!
//! This library opens disk images of vintage computers, with emphasis on Apple II, identifies
//! the file system they carry, and exposes the files through one uniform model.
//!
//! ## Architecture
//!
//! Opening an image proceeds through three layers:
//! * `outer` strips a host level gzip or zip container, if present
//! * `img` identifies the image wrapper and produces a `DiskImg`, a normalized stream of
//!   sectors or blocks with a known addressing and sector order
//! * `fs` recognizes the file system through the ordered `fs::registry`, and mounts it as a
//!   `fs::DiskFS` trait object
//!
//! When a `DiskFS` object is created it takes ownership of the `DiskImg`.
//! Changes are not permanent until the image is flushed back to its path or bytes.
//!
//! ## Image Wrappers
//!
//! * 2MG, DiskCopy 4.2, NuFX (uncompressed threads), Sim //e HDV, FDI
//! * TrackStar, DDD, raw nibble (NIB, NB2)
//! * unadorned sector images (DO, PO, D13, DSK, RAW, HDV, IMG)
//!
//! ## File Systems
//!
//! * DOS 3.2 and 3.3, ProDOS, Pascal (read and write)
//! * CP/M, RDOS, Gutenberg, HFS, FAT (read only)
//! * partition containers: UNIDOS, OzDOS, CFFA, Apple partition map, MicroDrive, FocusDrive

pub mod bits;
pub mod outer;
pub mod bios;
pub mod img;
pub mod fs;

use std::path::Path;
use log::info;
use fs::{DiskFS,Leniency,MountMode,MountOptions};
use img::DiskImg;

pub type DYNERR = Box<dyn std::error::Error>;
pub type STDRESULT = Result<(),Box<dyn std::error::Error>>;

/// How an image should be opened and mounted
#[derive(Clone,Debug)]
pub struct Options {
    /// weakest test that may be used to recognize the file system
    pub leniency: Leniency,
    pub read_only: bool,
    pub mode: MountMode,
    /// bound on an image expanded from gzip or zip
    pub max_expanded: usize
}

impl Default for Options {
    fn default() -> Self {
        Self {
            leniency: Leniency::Lenient,
            read_only: false,
            mode: MountMode::Full,
            max_expanded: outer::MAX_EXPANDED_SIZE
        }
    }
}

impl Options {
    fn mount_options(&self) -> MountOptions {
        MountOptions::new(self.mode,self.leniency)
    }
    fn lenient_wrappers(&self) -> bool {
        self.leniency==Leniency::Lenient
    }
}

/// Open image bytes and mount the file system.  The extension, if known, helps identify
/// unadorned sector images.
pub fn open_and_mount_bytes(buf: &[u8],ext: &str,opt: &Options) -> Result<Box<dyn DiskFS>,DYNERR> {
    let img = DiskImg::open_bytes_bounded(buf,ext,opt.read_only,opt.lenient_wrappers(),opt.max_expanded)?;
    fs::registry::mount(img,&opt.mount_options())
}

/// Open an image file and mount the file system.  Flushing the returned file system
/// writes changes back to the same path.
pub fn open_and_mount(path: &Path,opt: &Options) -> Result<Box<dyn DiskFS>,DYNERR> {
    let buf = std::fs::read(path)?;
    let ext = img::inner_extension(&path.to_string_lossy());
    let mut img = DiskImg::open_bytes_bounded(&buf,&ext,opt.read_only,opt.lenient_wrappers(),opt.max_expanded)?;
    img.set_path(path);
    info!("opened {}",path.display());
    fs::registry::mount(img,&opt.mount_options())
}

/// Display binary to stdout in columns of hex and ascii
pub fn display_block(start_addr: usize,block: &[u8]) {
    for (row,slice) in block.chunks(16).enumerate() {
        let txt: String = slice.iter().map(|c| match *c {
            x if x<32 => '.',
            x if x<127 => x as char,
            _ => '.'
        }).collect();
        let hex: Vec<String> = slice.iter().map(|b| format!("{:02X}",b)).collect();
        println!("{:04X} : {:<48}|{}|",start_addr + row*16,hex.join(" "),txt);
    }
}
