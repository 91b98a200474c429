//! # File System Module
//!
//! File system modules handle interactions with directories and files.  There is a sub-module for
//! each supported file system, and for each container format that divides a disk into volumes.
//!
//! File systems are represented by the `DiskFS` trait.  The trait object takes ownership of
//! a `DiskImg`, which it uses as storage.  When mounted, a file system builds a flat list of
//! `A2File` entries with parent links; directories are entries like any other.
//! Container formats hold no files, instead they own a list of `SubVolume`, each of which may
//! hold another `DiskFS`.
//!
//! This module also contains the `Block` enumeration, which specifies and locates allocation units.
//! The enumeration names the addressing used, and its value is a specific unit.
//! Sector skews are not handled here.  Transformation of a `Block` to a physical disk address is
//! handled within the `img` module, with the tables in `bios::skew`.
//!
//! ## Write Safety
//!
//! Every mutating entry point (`create_file`, `delete_file`, `rename_file`, `set_file_info`, `format`,
//! opening a file for writing) passes through `write_guard` before any I/O.  A file system that
//! found damage while mounting refuses with `Error::Damaged`; a read only image or mount refuses
//! with `Error::ReadOnly`.  Allocation maps are rebuilt from the disk for each operation and
//! never cached between calls.

pub mod usage;
pub mod types;
pub mod registry;
pub mod prodos;
pub mod dos3x;
pub mod pascal;
pub mod cpm;
pub mod rdos;
pub mod gutenberg;
pub mod hfs;
pub mod fat;
pub mod container;

use std::fmt;
use std::collections::HashSet;
use log::{trace,debug,info,warn,error};
use crate::img::{self,DiskImg};
use crate::{STDRESULT,DYNERR};
use usage::VolumeUsage;

/// Enumerates file system errors.  The `Display` trait will print equivalent long message.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("file system not compatible with request")]
    FileSystemMismatch,
    #[error("disk is damaged and cannot be modified")]
    Damaged,
    #[error("volume is mounted read only")]
    ReadOnly,
    #[error("operation not supported by this file system")]
    Unsupported,
    #[error("file not found")]
    FileNotFound,
    #[error("file is already open")]
    FileOpen,
    #[error("fork not present")]
    ForkNotPresent,
    #[error("invalid name")]
    InvalidName,
    #[error("duplicate name")]
    Duplicate,
    #[error("disk full")]
    DiskFull,
    #[error("directory full")]
    DirectoryFull,
    #[error("directory is not empty")]
    NotEmpty,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("range error")]
    Range
}

/// Allocation unit.  Track and sector units are 256 bytes with DOS logical sector numbering,
/// block units are 512 bytes.
#[derive(PartialEq,Eq,Clone,Copy,Hash,Debug)]
pub enum Block {
    /// value is [track,sector]
    DO([usize;2]),
    /// value is block number
    PO(usize)
}

impl Block {
    pub fn len(&self) -> usize {
        match self {
            Self::DO(_) => img::SECTOR_SIZE,
            Self::PO(_) => img::BLOCK_SIZE
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self,f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DO([t,s]) => write!(f,"track {} sector {}",t,s),
            Self::PO(b) => write!(f,"block {}",b)
        }
    }
}

/// How hard a file system looks at a candidate before accepting it
#[derive(Clone,Copy,PartialEq,Eq,PartialOrd,Ord,Debug)]
pub enum Leniency {
    Strict,
    Moderate,
    Lenient
}

/// How much work is done when mounting
#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum MountMode {
    /// volume identity only, used when probing nested formats
    ScanOnly,
    ReadOnly,
    Full
}

/// Settings passed down to mount functions
#[derive(Clone,Copy,Debug)]
pub struct MountOptions {
    pub mode: MountMode,
    pub leniency: Leniency,
    /// nesting depth of containers
    pub depth: usize
}

impl MountOptions {
    pub fn new(mode: MountMode,leniency: Leniency) -> Self {
        Self { mode, leniency, depth: 0 }
    }
    pub fn nested(&self) -> Self {
        Self { mode: self.mode, leniency: self.leniency, depth: self.depth + 1 }
    }
}

/// Answer to a free space query
#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub struct FreeSpace {
    pub total: usize,
    pub free: usize,
    /// bytes in an allocation unit
    pub unit_size: usize
}

#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum FileKind {
    File,
    Directory,
    VolumeDir,
    /// a disk image stored as a file, such as a Pascal area on ProDOS
    DiskImage
}

/// How much we trust an entry
#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum Quality {
    Good,
    Suspicious,
    Damaged
}

/// One directory entry, with its metadata normalized across file systems.
/// Format specific type codes are kept as found, ProDOS codes are used where a mapping exists.
#[derive(Clone,Debug)]
pub struct A2File {
    /// full path using `/` as separator, no leading separator
    pub path: String,
    pub name: String,
    pub kind: FileKind,
    pub file_type: u32,
    pub aux_type: u32,
    pub access: u8,
    pub created: Option<chrono::NaiveDateTime>,
    pub modified: Option<chrono::NaiveDateTime>,
    pub data_len: usize,
    pub rsrc_len: Option<usize>,
    /// bytes actually allocated to the data fork
    pub data_sparse_len: usize,
    pub rsrc_sparse_len: usize,
    /// index of the parent directory in the file list
    pub parent: Option<usize>,
    pub quality: Quality,
    /// locates the directory entry, stable across rescans, meaning depends on the file system
    pub key: u64
}

impl A2File {
    pub fn new(name: &str,kind: FileKind,key: u64) -> Self {
        Self {
            path: name.to_string(),
            name: name.to_string(),
            kind,
            file_type: 0,
            aux_type: 0,
            access: 0,
            created: None,
            modified: None,
            data_len: 0,
            rsrc_len: None,
            data_sparse_len: 0,
            rsrc_sparse_len: 0,
            parent: None,
            quality: Quality::Good,
            key
        }
    }
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory || self.kind == FileKind::VolumeDir
    }
    /// short type name for display
    pub fn type_name(&self) -> &'static str {
        types::type_name(self.file_type)
    }
    pub fn type_description(&self) -> &'static str {
        types::type_description(self.file_type,self.aux_type).unwrap_or("Unknown")
    }
}

/// Metadata accepted by `create_file` and `set_file_info`
#[derive(Clone,Debug,Default)]
pub struct FileInfo {
    pub file_type: u32,
    pub aux_type: u32,
    pub access: Option<u8>,
    pub created: Option<chrono::NaiveDateTime>,
    pub modified: Option<chrono::NaiveDateTime>,
    /// create with a resource fork, where the file system has them
    pub rsrc: bool
}

/// Where a fork's bytes live on disk
pub struct ForkMap {
    /// allocation units in file order, `None` for a sparse hole
    pub units: Vec<Option<Block>>,
    /// leading bytes of each unit that are not file data
    pub skip: usize,
    pub eof: usize
}

/// Open file cursor.  Reads go straight to disk; writes are buffered and committed on close.
pub struct A2FileDescr {
    key: u64,
    rsrc: bool,
    read_only: bool,
    map: ForkMap,
    pos: usize,
    pending: Option<Vec<u8>>
}

impl A2FileDescr {
    pub fn key(&self) -> u64 {
        self.key
    }
    pub fn is_rsrc(&self) -> bool {
        self.rsrc
    }
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
    pub fn eof(&self) -> usize {
        match &self.pending {
            Some(v) => v.len(),
            None => self.map.eof
        }
    }
    pub fn pos(&self) -> usize {
        self.pos
    }
    /// allocation units backing the fork when it was opened
    pub fn units(&self) -> &[Option<Block>] {
        &self.map.units
    }
    pub fn seek(&mut self,pos: usize) -> STDRESULT {
        if pos > self.eof() {
            return Err(Box::new(Error::Range));
        }
        self.pos = pos;
        Ok(())
    }
}

/// Nested volume held by a container
pub struct SubVolume {
    pub name: String,
    pub start_block: usize,
    pub num_blocks: usize,
    /// None if no file system could be mounted
    pub fs: Option<Box<dyn DiskFS>>
}

/// State shared by every file system
pub struct FsCore {
    pub img: DiskImg,
    pub mode: MountMode,
    pub files: Vec<A2File>,
    pub sub_volumes: Vec<SubVolume>,
    pub notes: Vec<String>,
    pub good: bool,
    pub fully_enumerated: bool,
    open: HashSet<u64>
}

impl FsCore {
    pub fn new(img: DiskImg,mode: MountMode) -> Self {
        let good = !img.is_damaged();
        Self {
            img,
            mode,
            files: Vec::new(),
            sub_volumes: Vec::new(),
            notes: Vec::new(),
            good,
            fully_enumerated: true,
            open: HashSet::new()
        }
    }
    /// Record a problem, `damage` also clears the good flag
    pub fn note(&mut self,msg: &str,damage: bool) {
        warn!("{}",msg);
        self.notes.push(msg.to_string());
        if damage {
            self.good = false;
        }
    }
    /// Push a file, filling in its path from the parent, returns its index
    pub fn add_file(&mut self,mut file: A2File) -> usize {
        if let Some(p) = file.parent {
            if let Some(parent) = self.files.get(p) {
                if parent.kind != FileKind::VolumeDir {
                    file.path = [parent.path.as_str(),"/",file.name.as_str()].concat();
                }
            }
        }
        trace!("add file {}",file.path);
        self.files.push(file);
        self.files.len() - 1
    }
    pub fn index_of_key(&self,key: u64) -> Option<usize> {
        self.files.iter().position(|f| f.key==key)
    }
}

/// Abstract file system interface.  Owns the underlying `DiskImg`.
/// Implementors supply the `core` accessors and the format specific hooks; the enumeration,
/// write guard, and file descriptor logic are provided.
pub trait DiskFS {
    fn core(&self) -> &FsCore;
    fn core_mut(&mut self) -> &mut FsCore;
    /// short name of the file system, e.g. "ProDOS"
    fn fs_name(&self) -> &'static str;
    /// volume name as shown to users, e.g. `DOS254` or `/UTILS`
    fn volume_name(&self) -> String;
    /// volume name without decoration
    fn bare_volume_name(&self) -> String {
        self.volume_name()
    }
    /// file system name and volume name together
    fn volume_id(&self) -> String {
        format!("{} {}",self.fs_name(),self.volume_name())
    }
    fn free_space(&self) -> Result<FreeSpace,DYNERR>;
    /// count of 512 byte blocks the file system says it spans
    fn fs_num_blocks(&self) -> usize;
    /// Tag every allocation unit with its use.  Also reports damage through the core.
    fn scan_usage(&mut self) -> Result<VolumeUsage,DYNERR>;
    /// Rebuild the file list from the disk
    fn rescan(&mut self) -> STDRESULT;
    /// Locate the units of a fork of file `idx`
    fn fork_map(&self,idx: usize,rsrc: bool) -> Result<ForkMap,DYNERR>;

    // Hooks for mutation, format specific, called only after the write guard passes.
    // Read only file systems keep the defaults.

    fn do_create_file(&mut self,_path: &str,_kind: FileKind,_info: &FileInfo) -> STDRESULT {
        Err(Box::new(Error::Unsupported))
    }
    fn do_delete_file(&mut self,_idx: usize) -> STDRESULT {
        Err(Box::new(Error::Unsupported))
    }
    fn do_rename_file(&mut self,_idx: usize,_name: &str) -> STDRESULT {
        Err(Box::new(Error::Unsupported))
    }
    fn do_set_file_info(&mut self,_idx: usize,_info: &FileInfo) -> STDRESULT {
        Err(Box::new(Error::Unsupported))
    }
    fn do_format(&mut self,_vol_name: &str) -> STDRESULT {
        Err(Box::new(Error::Unsupported))
    }
    /// Replace the contents of a fork
    fn store_fork(&mut self,_idx: usize,_rsrc: bool,_dat: &[u8]) -> STDRESULT {
        Err(Box::new(Error::Unsupported))
    }

    // Provided

    fn img(&self) -> &DiskImg {
        &self.core().img
    }
    fn img_mut(&mut self) -> &mut DiskImg {
        &mut self.core_mut().img
    }
    fn files(&self) -> &[A2File] {
        &self.core().files
    }
    /// Next file in list order, pass `None` to start
    fn next_file(&self,prev: Option<usize>) -> Option<usize> {
        let next = match prev {
            Some(i) => i + 1,
            None => 0
        };
        match next < self.core().files.len() {
            true => Some(next),
            false => None
        }
    }
    /// Find a file by its path, case insensitive
    fn find(&self,path: &str) -> Option<usize> {
        let want = path.trim_start_matches('/').to_uppercase();
        self.core().files.iter().position(|f| f.kind!=FileKind::VolumeDir && f.path.to_uppercase()==want)
    }
    fn sub_volumes(&self) -> &[SubVolume] {
        &self.core().sub_volumes
    }
    fn sub_volumes_mut(&mut self) -> &mut Vec<SubVolume> {
        &mut self.core_mut().sub_volumes
    }
    /// Next sub-volume, pass `None` to start
    fn next_sub_volume(&self,prev: Option<usize>) -> Option<&SubVolume> {
        let next = match prev {
            Some(i) => i + 1,
            None => 0
        };
        self.core().sub_volumes.get(next)
    }
    /// problems found while mounting
    fn notes(&self) -> &[String] {
        &self.core().notes
    }
    fn fully_enumerated(&self) -> bool {
        self.core().fully_enumerated
    }
    fn is_good(&self) -> bool {
        self.core().good
    }
    fn mode(&self) -> MountMode {
        self.core().mode
    }
    /// Refuse mutation of damaged or read only volumes
    fn write_guard(&self) -> STDRESULT {
        if !self.core().good {
            error!("{} is damaged and cannot be modified",self.volume_name());
            return Err(Box::new(Error::Damaged));
        }
        if self.core().img.is_read_only() || self.core().mode != MountMode::Full {
            error!("{} is read only",self.volume_name());
            return Err(Box::new(Error::ReadOnly));
        }
        Ok(())
    }
    fn find_closed(&self,path: &str) -> Result<usize,DYNERR> {
        let idx = match self.find(path) {
            Some(i) => i,
            None => return Err(Box::new(Error::FileNotFound))
        };
        if self.core().open.contains(&self.core().files[idx].key) {
            return Err(Box::new(Error::FileOpen));
        }
        Ok(idx)
    }
    fn create_file(&mut self,path: &str,kind: FileKind,info: &FileInfo) -> STDRESULT {
        self.write_guard()?;
        if self.find(path).is_some() {
            return Err(Box::new(Error::Duplicate));
        }
        self.do_create_file(path,kind,info)?;
        self.rescan()
    }
    fn delete_file(&mut self,path: &str) -> STDRESULT {
        self.write_guard()?;
        let idx = self.find_closed(path)?;
        self.do_delete_file(idx)?;
        self.rescan()
    }
    fn rename_file(&mut self,path: &str,new_name: &str) -> STDRESULT {
        self.write_guard()?;
        let idx = self.find_closed(path)?;
        self.do_rename_file(idx,new_name)?;
        self.rescan()
    }
    fn set_file_info(&mut self,path: &str,info: &FileInfo) -> STDRESULT {
        self.write_guard()?;
        let idx = self.find_closed(path)?;
        self.do_set_file_info(idx,info)?;
        self.rescan()
    }
    /// Erase the volume and write empty structures
    fn format(&mut self,vol_name: &str) -> STDRESULT {
        self.write_guard()?;
        if self.core().open.len() > 0 {
            return Err(Box::new(Error::FileOpen));
        }
        self.do_format(vol_name)?;
        self.rescan()
    }
    /// Open one fork of a file.  Only one open per file is allowed.
    fn open_file(&mut self,path: &str,read_only: bool,rsrc: bool) -> Result<A2FileDescr,DYNERR> {
        if !read_only {
            self.write_guard()?;
        }
        let idx = self.find_closed(path)?;
        let file = &self.core().files[idx];
        if file.is_dir() {
            return Err(Box::new(Error::FileNotFound));
        }
        if rsrc && file.rsrc_len.is_none() {
            return Err(Box::new(Error::ForkNotPresent));
        }
        let key = file.key;
        let map = self.fork_map(idx,rsrc)?;
        self.core_mut().open.insert(key);
        debug!("open {} with {} units",path,map.units.len());
        Ok(A2FileDescr { key, rsrc, read_only, map, pos: 0, pending: None })
    }
    /// Read one allocation unit
    fn read_unit(&self,unit: &Block) -> Result<Vec<u8>,DYNERR> {
        match unit {
            Block::DO([t,s]) => self.core().img.read_sector(*t,*s),
            Block::PO(b) => self.core().img.read_block(*b)
        }
    }
    fn write_unit(&mut self,unit: &Block,dat: &[u8]) -> STDRESULT {
        match unit {
            Block::DO([t,s]) => self.core_mut().img.write_sector(*t,*s,dat),
            Block::PO(b) => self.core_mut().img.write_block(*b,dat)
        }
    }
    /// Read the whole fork through its unit list
    fn read_fork_map(&self,map: &ForkMap) -> Result<Vec<u8>,DYNERR> {
        let mut ans: Vec<u8> = Vec::new();
        for unit in &map.units {
            if ans.len() >= map.eof {
                break;
            }
            match unit {
                Some(b) => {
                    let dat = self.read_unit(b)?;
                    ans.extend_from_slice(&dat[usize::min(map.skip,dat.len())..]);
                },
                None => {
                    let payload = match map.units.iter().flatten().next() {
                        Some(b) => b.len() - map.skip,
                        None => img::BLOCK_SIZE
                    };
                    ans.resize(ans.len() + payload,0);
                }
            }
        }
        ans.resize(map.eof,0);
        Ok(ans)
    }
    /// Read up to `len` bytes at the descriptor's position
    fn read(&self,fd: &mut A2FileDescr,len: usize) -> Result<Vec<u8>,DYNERR> {
        if !self.core().open.contains(&fd.key) {
            return Err(Box::new(Error::BadDescriptor));
        }
        let all = match &fd.pending {
            Some(v) => v.clone(),
            None => self.read_fork_map(&fd.map)?
        };
        let end = usize::min(fd.pos + len,all.len());
        let ans = all[fd.pos..end].to_vec();
        fd.pos = end;
        Ok(ans)
    }
    /// Write at the descriptor's position, extending the fork as needed
    fn write(&mut self,fd: &mut A2FileDescr,dat: &[u8]) -> STDRESULT {
        if !self.core().open.contains(&fd.key) {
            return Err(Box::new(Error::BadDescriptor));
        }
        if fd.read_only {
            return Err(Box::new(Error::ReadOnly));
        }
        if fd.pending.is_none() {
            fd.pending = Some(self.read_fork_map(&fd.map)?);
        }
        if let Some(buf) = fd.pending.as_mut() {
            if buf.len() < fd.pos + dat.len() {
                buf.resize(fd.pos + dat.len(),0);
            }
            buf[fd.pos..fd.pos+dat.len()].copy_from_slice(dat);
            fd.pos += dat.len();
        }
        Ok(())
    }
    /// Truncate or extend the fork
    fn set_eof(&mut self,fd: &mut A2FileDescr,eof: usize) -> STDRESULT {
        if fd.read_only {
            return Err(Box::new(Error::ReadOnly));
        }
        if fd.pending.is_none() {
            fd.pending = Some(self.read_fork_map(&fd.map)?);
        }
        if let Some(buf) = fd.pending.as_mut() {
            buf.resize(eof,0);
        }
        fd.pos = usize::min(fd.pos,eof);
        Ok(())
    }
    /// Commit pending writes and release the file
    fn close_file(&mut self,fd: A2FileDescr) -> STDRESULT {
        if !self.core_mut().open.remove(&fd.key) {
            return Err(Box::new(Error::BadDescriptor));
        }
        if let Some(dat) = fd.pending {
            self.write_guard()?;
            let idx = match self.core().index_of_key(fd.key) {
                Some(i) => i,
                None => return Err(Box::new(Error::FileNotFound))
            };
            self.store_fork(idx,fd.rsrc,&dat)?;
            self.rescan()?;
        }
        Ok(())
    }
    /// Convenience, read a whole fork by path
    fn read_file(&mut self,path: &str,rsrc: bool) -> Result<Vec<u8>,DYNERR> {
        let mut fd = self.open_file(path,true,rsrc)?;
        let eof = fd.eof();
        let ans = self.read(&mut fd,eof);
        self.close_file(fd)?;
        ans
    }
    /// Convenience, replace a whole fork by path
    fn write_file(&mut self,path: &str,rsrc: bool,dat: &[u8]) -> STDRESULT {
        let mut fd = self.open_file(path,false,rsrc)?;
        let res = self.set_eof(&mut fd,0).and_then(|_| self.write(&mut fd,dat));
        match res {
            Ok(()) => self.close_file(fd),
            Err(e) => {
                self.core_mut().open.remove(&fd.key);
                Err(e)
            }
        }
    }
    /// Write pending image changes to the file the image came from
    fn flush(&mut self) -> STDRESULT {
        self.core_mut().img.flush()
    }
}

/// Build the file list and, for full mounts, check the allocation map
pub fn finish_mount<T: DiskFS + 'static>(mut fs: T) -> Result<Box<dyn DiskFS>,DYNERR> {
    match fs.mode() {
        MountMode::ScanOnly => {},
        MountMode::ReadOnly => fs.rescan()?,
        MountMode::Full => {
            fs.rescan()?;
            let usage = fs.scan_usage()?;
            debug!("{} units in use, {} conflicts",usage.in_use(),usage.conflicts());
        }
    }
    info!("mounted {}",fs.volume_id());
    if !fs.is_good() {
        warn!("{} is damaged, writes are disabled",fs.volume_id());
    }
    Ok(Box::new(fs))
}

/// Normalize a name for case insensitive comparison
pub fn name_eq(a: &str,b: &str) -> bool {
    a.to_uppercase() == b.to_uppercase()
}

/// Split a path into parent path and leaf name
pub fn split_path(path: &str) -> (String,String) {
    let p = path.trim_start_matches('/');
    match p.rfind('/') {
        Some(i) => (p[0..i].to_string(),p[i+1..].to_string()),
        None => (String::new(),p.to_string())
    }
}

#[test]
fn path_split() {
    assert_eq!(split_path("/A/B/C"),("A/B".to_string(),"C".to_string()));
    assert_eq!(split_path("HELLO"),(String::new(),"HELLO".to_string()));
}
