//! # DOS 3.x file system module
//! This manipulates disk images containing one DOS 3.x volume.
//! Wide latitude is allowed for track counts, while sector counts
//! are restricted to 13, 16, or 32.
//!
//! * DOS 3.2 is mounted on 13 sector media, DOS 3.3 on 16 or 32 sector media
//! * The catalog is a chain of sectors starting from the VTOC, the walk is bounded
//! * The VTOC bitmap is read at the start of each mutating operation, never kept between calls
//!
//! File data is presented the way DOS stores it, i.e., `B` files begin with the
//! load address and length, `A` and `I` files with the program length.

pub mod types;
mod directory;

use std::collections::HashSet;
use log::{trace,debug,info,error};
use types::*;
use directory::*;
use super::{Block,DiskFS,FsCore,A2File,FileKind,FileInfo,ForkMap,FreeSpace,Leniency,MountMode,MountOptions,Quality};
use super::usage::{VolumeUsage,UsageTag};
use crate::img::{DiskImg,SECTOR_SIZE};
use crate::{DYNERR,STDRESULT};

/// access byte reported for unlocked files
const UNLOCKED_ACCESS: u8 = 0xc3;
/// access byte reported for locked files
const LOCKED_ACCESS: u8 = 0x01;

/// T/S lists and data sectors of a file
struct TsChain {
    lists: Vec<[usize;2]>,
    data: Vec<Option<[usize;2]>>,
    bad: bool
}

impl TsChain {
    fn allocated(&self) -> Vec<[usize;2]> {
        let mut ans = self.lists.clone();
        ans.extend(self.data.iter().flatten());
        ans
    }
}

/// Catalog sectors in chain order
struct CatalogChain {
    sectors: Vec<[usize;2]>,
    /// a link pointed outside the disk or back into the chain
    broken: bool,
    /// the walk stopped at `MAX_CATALOG_SECTORS`
    truncated: bool
}

fn entry_key(ts: [usize;2],idx: usize) -> u64 {
    ((ts[0] as u64) << 16) | ((ts[1] as u64) << 8) | idx as u64
}

fn entry_loc(key: u64) -> ([usize;2],usize) {
    ([(key >> 16) as usize & 0xff,(key >> 8) as usize & 0xff],key as usize & 0xff)
}

/// Parse `DOS254` or `254` as a volume number
fn parse_volume(vol_name: &str) -> Option<u8> {
    let up = vol_name.trim().to_uppercase();
    let digits = up.strip_prefix("DOS").unwrap_or(up.as_str());
    match digits.parse::<u8>() {
        Ok(v) if v >= 1 && v <= 254 => Some(v),
        _ => None
    }
}

/// The primary interface for disk operations.
pub struct Disk {
    core: FsCore,
    dos32: bool,
    vol: u8,
    tracks: usize,
    sectors: usize,
    catalog: [usize;2]
}

impl Disk {
    fn new(img: DiskImg,mode: MountMode,dos32: bool) -> Self {
        Self {
            core: FsCore::new(img,mode),
            dos32,
            vol: 0,
            tracks: 0,
            sectors: 0,
            catalog: [0,0]
        }
    }
    /// Follow the catalog links in the image without mounting
    fn walk_catalog_chain(img: &DiskImg,vtoc: &VTOC) -> Option<Vec<[usize;2]>> {
        let mut ans = Vec::new();
        let mut ts = [vtoc.track1 as usize,vtoc.sector1 as usize];
        while ts != [0,0] {
            if ts[0] >= vtoc.tracks as usize || ts[1] >= vtoc.sectors as usize || ans.contains(&ts) || ans.len() >= MAX_CATALOG_SECTORS {
                debug!("catalog link to {:?} is bad",ts);
                return None;
            }
            ans.push(ts);
            let buf = img.read_sector(ts[0],ts[1]).ok()?;
            ts = [buf[1] as usize,buf[2] as usize];
        }
        Some(ans)
    }
    /// Test an image for DOS 3.3, or DOS 3.2 if `dos32`.
    pub fn test(img: &DiskImg,leniency: Leniency,dos32: bool) -> bool {
        if !img.sector_capable() {
            return false;
        }
        let slen = img.sectors_per_track();
        let sectors_ok = match dos32 {
            true => slen==13,
            false => slen==16 || slen==32
        };
        if !sectors_ok {
            debug!("{} sectors per track rules out DOS 3.{}",slen,match dos32 { true => 2, false => 3 });
            return false;
        }
        let vtoc = match img.read_sector(VTOC_TRACK,0).map(|b| VTOC::from_bytes(&b)) {
            Ok(Ok(v)) => v,
            _ => {
                debug!("VTOC sector was not readable");
                return false;
            }
        };
        if vtoc.bytes != 256 || vtoc.sectors as usize != slen {
            debug!("VTOC wrong bytes {}, sectors {}",vtoc.bytes,vtoc.sectors);
            return false;
        }
        let tlen = vtoc.tracks as usize;
        if tlen <= VTOC_TRACK || tlen > MAX_TRACKS || tlen > img.num_tracks() {
            debug!("VTOC track count {} does not fit image",tlen);
            return false;
        }
        if vtoc.track1==0 || vtoc.track1 as usize >= tlen || vtoc.sector1 as usize >= slen {
            debug!("VTOC catalog pointer {},{} out of range",vtoc.track1,vtoc.sector1);
            return false;
        }
        if leniency < Leniency::Lenient && (vtoc.vol < 1 || vtoc.vol > 254) {
            debug!("volume {} out of range",vtoc.vol);
            return false;
        }
        match leniency {
            Leniency::Strict => {
                let version_ok = match dos32 {
                    true => vtoc.version <= 2,
                    false => vtoc.version >= 3
                };
                if !version_ok {
                    debug!("VTOC wrong version {}",vtoc.version);
                    return false;
                }
                let chain = match Self::walk_catalog_chain(img,&vtoc) {
                    Some(c) => c,
                    None => return false
                };
                // standard catalogs descend through the catalog track and end at sector 1
                for (i,ts) in chain.iter().enumerate() {
                    if ts[0] != vtoc.track1 as usize || ts[1] + i != vtoc.sector1 as usize {
                        debug!("catalog sector {:?} out of sequence",ts);
                        return false;
                    }
                }
                match chain.last() {
                    Some(ts) if ts[1]==1 => true,
                    _ => {
                        debug!("catalog does not end at sector 1");
                        false
                    }
                }
            },
            Leniency::Moderate => Self::walk_catalog_chain(img,&vtoc).is_some(),
            Leniency::Lenient => true
        }
    }
    /// Mount the volume, the `DiskFS` takes ownership of the image.
    pub fn mount(img: DiskImg,opts: &MountOptions,dos32: bool) -> Result<Box<dyn DiskFS>,DYNERR> {
        let mut fs = Self::new(img,opts.mode,dos32);
        fs.read_header()?;
        super::finish_mount(fs)
    }
    /// Create a new empty volume on the image, `vol_name` is like `DOS254` or `254`.
    pub fn format_img(img: DiskImg,vol_name: &str) -> Result<Box<dyn DiskFS>,DYNERR> {
        let dos32 = img.sectors_per_track()==13;
        let mut fs = Self::new(img,MountMode::Full,dos32);
        fs.format(vol_name)?;
        Ok(Box::new(fs))
    }
    fn read_vtoc(&self) -> Result<VTOC,DYNERR> {
        VTOC::from_bytes(&self.core.img.read_sector(VTOC_TRACK,0)?)
    }
    fn write_vtoc(&mut self,vtoc: &VTOC) -> STDRESULT {
        self.core.img.write_sector(VTOC_TRACK,0,&vtoc.to_bytes()?)
    }
    fn read_header(&mut self) -> STDRESULT {
        let vtoc = self.read_vtoc()?;
        let slen = self.core.img.sectors_per_track();
        let sectors = vtoc.sectors as usize;
        if ![13,16,32].contains(&sectors) || sectors != slen {
            error!("VTOC sector count {} does not fit {} sector tracks",sectors,slen);
            return Err(Box::new(super::Error::FileSystemMismatch));
        }
        self.vol = vtoc.vol;
        self.sectors = sectors;
        self.tracks = usize::min(vtoc.tracks as usize,usize::min(self.core.img.num_tracks(),MAX_TRACKS));
        if (vtoc.tracks as usize) > self.tracks {
            self.core.note(&format!("VTOC claims {} tracks but image has {}",vtoc.tracks,self.tracks),true);
        }
        self.catalog = [vtoc.track1 as usize,vtoc.sector1 as usize];
        Ok(())
    }
    fn ts_ok(&self,ts: [usize;2]) -> bool {
        ts[0] < self.tracks && ts[1] < self.sectors
    }
    fn unit(&self,ts: [usize;2]) -> usize {
        ts[0]*self.sectors + ts[1]
    }
    fn catalog_chain(&self) -> Result<CatalogChain,DYNERR> {
        let mut ans = CatalogChain { sectors: Vec::new(), broken: false, truncated: false };
        let mut visited = HashSet::new();
        let mut ts = self.catalog;
        while ts != [0,0] {
            if !self.ts_ok(ts) || !visited.insert(ts) {
                ans.broken = true;
                break;
            }
            if ans.sectors.len() >= MAX_CATALOG_SECTORS {
                ans.truncated = true;
                break;
            }
            let buf = self.core.img.read_sector(ts[0],ts[1])?;
            ans.sectors.push(ts);
            ts = [buf[1] as usize,buf[2] as usize];
        }
        Ok(ans)
    }
    fn read_catalog_sector(&self,ts: [usize;2]) -> Result<DirectorySector,DYNERR> {
        DirectorySector::from_bytes(&self.core.img.read_sector(ts[0],ts[1])?)
    }
    fn write_catalog_sector(&mut self,ts: [usize;2],sec: &DirectorySector) -> STDRESULT {
        self.core.img.write_sector(ts[0],ts[1],&sec.to_bytes()?)
    }
    fn read_entry(&self,key: u64) -> Result<DirectoryEntry,DYNERR> {
        let (ts,idx) = entry_loc(key);
        Ok(self.read_catalog_sector(ts)?.entries[idx].clone())
    }
    fn write_entry(&mut self,key: u64,entry: &DirectoryEntry) -> STDRESULT {
        let (ts,idx) = entry_loc(key);
        let mut sec = self.read_catalog_sector(ts)?;
        sec.entries[idx] = entry.clone();
        self.write_catalog_sector(ts,&sec)
    }
    /// Gather the T/S lists and data sectors starting from a T/S list.
    /// Bad links end the walk and set `bad`.
    fn ts_chain(&self,start: [usize;2]) -> Result<TsChain,DYNERR> {
        let mut ans = TsChain { lists: Vec::new(), data: Vec::new(), bad: false };
        let mut ts = start;
        while ts != [0,0] {
            if !self.ts_ok(ts) || ans.lists.contains(&ts) || ans.lists.len() >= MAX_TSLIST_REPS {
                ans.bad = true;
                break;
            }
            ans.lists.push(ts);
            let tsl = TrackSectorList::from_bytes(&self.core.img.read_sector(ts[0],ts[1])?)?;
            for i in 0..PAIRS_PER_LIST {
                let pair = [tsl.pairs[i*2] as usize,tsl.pairs[i*2+1] as usize];
                if pair[0]==0 {
                    ans.data.push(None);
                } else if self.ts_ok(pair) {
                    ans.data.push(Some(pair));
                } else {
                    ans.bad = true;
                    ans.data.push(None);
                }
            }
            ts = [tsl.next_track as usize,tsl.next_sector as usize];
        }
        while let Some(None) = ans.data.last() {
            ans.data.pop();
        }
        Ok(ans)
    }
    fn entry_chain(&self,entry: &DirectoryEntry) -> Result<TsChain,DYNERR> {
        self.ts_chain([entry.tsl_track as usize,entry.tsl_sector as usize])
    }
    /// Length and aux type from the data, as DOS would find them
    fn data_len(&self,dos_type: u8,chain: &TsChain) -> Result<(usize,u32,bool),DYNERR> {
        let alloc = chain.data.len()*SECTOR_SIZE;
        let first = match chain.data.first() {
            Some(Some(ts)) => Some(self.core.img.read_sector(ts[0],ts[1])?),
            _ => None
        };
        let word = |buf: &[u8],i: usize| u16::from_le_bytes([buf[i],buf[i+1]]) as usize;
        let (len,aux) = match (type_letter(dos_type),first) {
            ('B',Some(buf)) => (4 + word(&buf,2),word(&buf,0) as u32),
            ('A',Some(buf)) => (2 + word(&buf,0),0x0801),
            ('I',Some(buf)) => (2 + word(&buf,0),0),
            ('T',_) => {
                let mut len = alloc;
                if let Some(Some(ts)) = chain.data.last() {
                    let buf = self.core.img.read_sector(ts[0],ts[1])?;
                    if let Some(pos) = buf.iter().position(|b| *b==0) {
                        len = (chain.data.len()-1)*SECTOR_SIZE + pos;
                    }
                }
                (len,0)
            },
            _ => (alloc,0)
        };
        match len > alloc {
            true => Ok((alloc,aux,true)),
            false => Ok((len,aux,false))
        }
    }
    fn file_from_entry(&mut self,entry: &DirectoryEntry,key: u64) -> Result<A2File,DYNERR> {
        let name = file_name_to_string(&entry.name);
        let mut file = A2File::new(&name,FileKind::File,key);
        file.file_type = prodos_type(entry.file_type);
        file.access = match entry.file_type & LOCKED { 0 => UNLOCKED_ACCESS, _ => LOCKED_ACCESS };
        let chain = match self.entry_chain(entry) {
            Ok(c) => c,
            Err(e) => {
                self.core.note(&format!("{}: {}",name,e),true);
                file.quality = Quality::Damaged;
                return Ok(file);
            }
        };
        if chain.bad {
            self.core.note(&format!("{}: bad track/sector list",name),true);
            file.quality = Quality::Damaged;
        }
        match self.data_len(entry.file_type,&chain) {
            Ok((len,aux,short)) => {
                file.data_len = len;
                file.aux_type = aux;
                if short && file.quality==Quality::Good {
                    debug!("{}: header length exceeds allocation",name);
                    file.quality = Quality::Suspicious;
                }
            },
            Err(e) => {
                self.core.note(&format!("{}: {}",name,e),true);
                file.quality = Quality::Damaged;
            }
        }
        file.data_sparse_len = usize::min(file.data_len,chain.data.iter().flatten().count()*SECTOR_SIZE);
        let count = chain.allocated().len();
        if count != entry.sectors as usize && file.quality==Quality::Good {
            debug!("{}: sector count is {}, found {}",name,entry.sectors,count);
            file.quality = Quality::Suspicious;
        }
        Ok(file)
    }
    /// Next free sector in the order DOS searches, marks it used in `vtoc`
    fn allocate(&self,vtoc: &mut VTOC) -> Result<[usize;2],DYNERR> {
        let cat_track = self.catalog[0];
        let down = (1..cat_track).rev();
        let up = cat_track+1..self.tracks;
        for track in down.chain(up) {
            for sector in (0..self.sectors).rev() {
                if vtoc.is_free(track,sector) {
                    vtoc.set_free(track,sector,false);
                    trace!("allocate track {} sector {}",track,sector);
                    return Ok([track,sector]);
                }
            }
        }
        error!("no free sectors");
        Err(Box::new(super::Error::DiskFull))
    }
    fn free_sectors(&self,vtoc: &mut VTOC,list: &[[usize;2]]) {
        for ts in list {
            vtoc.set_free(ts[0],ts[1],true);
        }
    }
    /// Write data and T/S lists, returns the first T/S list and the sector count
    fn write_data(&mut self,vtoc: &mut VTOC,dat: &[u8]) -> Result<([usize;2],usize),DYNERR> {
        let n = (dat.len() + SECTOR_SIZE - 1)/SECTOR_SIZE;
        let list_count = usize::max(1,(n + PAIRS_PER_LIST - 1)/PAIRS_PER_LIST);
        let mut lists = Vec::new();
        for _ in 0..list_count {
            lists.push(self.allocate(vtoc)?);
        }
        for (k,ts) in lists.iter().enumerate() {
            let mut tsl = TrackSectorList::blank();
            if k+1 < lists.len() {
                tsl.next_track = lists[k+1][0] as u8;
                tsl.next_sector = lists[k+1][1] as u8;
            }
            tsl.sector_base = (k*PAIRS_PER_LIST) as u16;
            for i in 0..PAIRS_PER_LIST {
                let j = k*PAIRS_PER_LIST + i;
                if j >= n {
                    break;
                }
                let data_ts = self.allocate(vtoc)?;
                let end = usize::min(dat.len(),(j+1)*SECTOR_SIZE);
                self.core.img.write_sector(data_ts[0],data_ts[1],&dat[j*SECTOR_SIZE..end])?;
                tsl.pairs[i*2] = data_ts[0] as u8;
                tsl.pairs[i*2+1] = data_ts[1] as u8;
            }
            self.core.img.write_sector(ts[0],ts[1],&tsl.to_bytes()?)?;
        }
        Ok((lists[0],n + list_count))
    }
    fn has_name(&self,except: Option<u64>,name: &str) -> bool {
        self.core.files.iter().any(|f| Some(f.key)!=except && super::name_eq(&f.name,name))
    }
}

impl DiskFS for Disk {
    fn core(&self) -> &FsCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut FsCore {
        &mut self.core
    }
    fn fs_name(&self) -> &'static str {
        match self.dos32 {
            true => "DOS 3.2",
            false => "DOS 3.3"
        }
    }
    fn volume_name(&self) -> String {
        format!("DOS{:03}",self.vol)
    }
    fn bare_volume_name(&self) -> String {
        format!("{:03}",self.vol)
    }
    fn free_space(&self) -> Result<FreeSpace,DYNERR> {
        let vtoc = self.read_vtoc()?;
        Ok(FreeSpace { total: self.tracks*self.sectors, free: vtoc.num_free(), unit_size: SECTOR_SIZE })
    }
    fn fs_num_blocks(&self) -> usize {
        self.tracks*self.sectors/2
    }
    fn scan_usage(&mut self) -> Result<VolumeUsage,DYNERR> {
        let mut usage = VolumeUsage::new(self.tracks*self.sectors,SECTOR_SIZE);
        usage.mark(self.unit([VTOC_TRACK,0]),UsageTag::System);
        for ts in self.catalog_chain()?.sectors {
            usage.mark(self.unit(ts),UsageTag::Directory);
        }
        let keys: Vec<(u64,String)> = self.core.files.iter().map(|f| (f.key,f.name.clone())).collect();
        for (key,name) in keys {
            let entry = self.read_entry(key)?;
            let chain = match self.entry_chain(&entry) {
                Ok(c) => c,
                Err(_) => continue
            };
            for ts in chain.allocated() {
                if !usage.mark(self.unit(ts),UsageTag::FileData) {
                    self.core.note(&format!("{}: track {} sector {} is claimed twice",name,ts[0],ts[1]),true);
                }
            }
        }
        let vtoc = self.read_vtoc()?;
        let mut used_but_free = 0;
        for t in 0..self.tracks {
            for s in 0..self.sectors {
                let u = self.unit([t,s]);
                match (usage.get(u),vtoc.is_free(t,s)) {
                    (Some(UsageTag::Free),false) => usage.mark_if_free(u,UsageTag::System),
                    (Some(_),true) => used_but_free += 1,
                    _ => {}
                }
            }
        }
        if used_but_free > 0 {
            self.core.note(&format!("{} sectors in use are marked free",used_but_free),true);
        }
        Ok(usage)
    }
    fn rescan(&mut self) -> STDRESULT {
        self.read_header()?;
        self.core.files = Vec::new();
        let chain = self.catalog_chain()?;
        if chain.broken {
            self.core.note("catalog chain is broken or circular",true);
        }
        if chain.truncated {
            self.core.fully_enumerated = false;
            self.core.note(&format!("catalog exceeds {} sectors, could not fully enumerate",MAX_CATALOG_SECTORS),true);
        }
        for ts in chain.sectors {
            let sec = self.read_catalog_sector(ts)?;
            for (idx,entry) in sec.entries.iter().enumerate() {
                if entry.tsl_track==0 || entry.tsl_track==DELETED {
                    continue;
                }
                let file = self.file_from_entry(entry,entry_key(ts,idx))?;
                self.core.add_file(file);
            }
        }
        debug!("found {} entries on {}",self.core.files.len(),self.volume_name());
        Ok(())
    }
    fn fork_map(&self,idx: usize,rsrc: bool) -> Result<ForkMap,DYNERR> {
        if rsrc {
            return Err(Box::new(super::Error::ForkNotPresent));
        }
        let entry = self.read_entry(self.core.files[idx].key)?;
        let chain = self.entry_chain(&entry)?;
        Ok(ForkMap {
            units: chain.data.iter().map(|ts| ts.map(Block::DO)).collect(),
            skip: 0,
            eof: self.core.files[idx].data_len
        })
    }
    fn do_create_file(&mut self,path: &str,kind: FileKind,info: &FileInfo) -> STDRESULT {
        if kind != FileKind::File || info.rsrc {
            return Err(Box::new(super::Error::Unsupported));
        }
        if !is_name_valid(path) {
            error!("invalid DOS name {}",path);
            return Err(Box::new(super::Error::InvalidName));
        }
        let dos_type = match (info.file_type,dos_type(info.file_type)) {
            (0,_) => 0x04,
            (_,Some(t)) => t,
            _ => return Err(Box::new(Error::FileTypeMismatch))
        };
        let mut slot = None;
        for ts in self.catalog_chain()?.sectors {
            let sec = self.read_catalog_sector(ts)?;
            if let Some(idx) = sec.entries.iter().position(|e| e.tsl_track==0 || e.tsl_track==DELETED) {
                slot = Some(entry_key(ts,idx));
                break;
            }
        }
        let key = match slot {
            Some(k) => k,
            None => {
                error!("catalog is full");
                return Err(Box::new(super::Error::DirectoryFull));
            }
        };
        let mut vtoc = self.read_vtoc()?;
        let tsl = self.allocate(&mut vtoc)?;
        self.core.img.write_sector(tsl[0],tsl[1],&TrackSectorList::blank().to_bytes()?)?;
        let mut entry = DirectoryEntry::blank();
        entry.tsl_track = tsl[0] as u8;
        entry.tsl_sector = tsl[1] as u8;
        entry.file_type = dos_type;
        if let Some(access) = info.access {
            if access & 0x02 == 0 {
                entry.file_type |= LOCKED;
            }
        }
        entry.name = string_to_file_name(path);
        entry.sectors = 1;
        self.write_entry(key,&entry)?;
        self.write_vtoc(&vtoc)?;
        info!("created {}",path);
        Ok(())
    }
    fn do_delete_file(&mut self,idx: usize) -> STDRESULT {
        let key = self.core.files[idx].key;
        let mut entry = self.read_entry(key)?;
        if entry.file_type & LOCKED != 0 {
            return Err(Box::new(Error::FileLocked));
        }
        let chain = self.entry_chain(&entry)?;
        let mut vtoc = self.read_vtoc()?;
        self.free_sectors(&mut vtoc,&chain.allocated());
        // DOS keeps the old track in the last name byte
        entry.name[29] = entry.tsl_track;
        entry.tsl_track = DELETED;
        self.write_entry(key,&entry)?;
        self.write_vtoc(&vtoc)?;
        info!("deleted {}, freed {} sectors",self.core.files[idx].name,chain.allocated().len());
        Ok(())
    }
    fn do_rename_file(&mut self,idx: usize,name: &str) -> STDRESULT {
        if !is_name_valid(name) {
            return Err(Box::new(super::Error::InvalidName));
        }
        let key = self.core.files[idx].key;
        if self.has_name(Some(key),name) {
            return Err(Box::new(super::Error::Duplicate));
        }
        let mut entry = self.read_entry(key)?;
        if entry.file_type & LOCKED != 0 {
            return Err(Box::new(Error::FileLocked));
        }
        entry.name = string_to_file_name(name);
        self.write_entry(key,&entry)
    }
    fn do_set_file_info(&mut self,idx: usize,info: &FileInfo) -> STDRESULT {
        let key = self.core.files[idx].key;
        let mut entry = self.read_entry(key)?;
        let mut new_type = match dos_type(info.file_type) {
            Some(t) => t,
            None => return Err(Box::new(Error::FileTypeMismatch))
        };
        let locked = match info.access {
            Some(access) => access & 0x02 == 0,
            None => entry.file_type & LOCKED != 0
        };
        if locked {
            new_type |= LOCKED;
        }
        entry.file_type = new_type;
        self.write_entry(key,&entry)?;
        // the load address of a binary file lives in its first sector
        if type_letter(new_type)=='B' && info.aux_type <= 0xffff {
            if let Some(Some(ts)) = self.entry_chain(&entry)?.data.first() {
                let mut buf = self.core.img.read_sector(ts[0],ts[1])?;
                buf[0..2].copy_from_slice(&u16::to_le_bytes(info.aux_type as u16));
                self.core.img.write_sector(ts[0],ts[1],&buf)?;
            }
        }
        Ok(())
    }
    fn do_format(&mut self,vol_name: &str) -> STDRESULT {
        let vol = match parse_volume(vol_name) {
            Some(v) => v,
            None => {
                error!("DOS volume must be a number from 1 to 254");
                return Err(Box::new(super::Error::InvalidName));
            }
        };
        let sectors = self.core.img.sectors_per_track();
        let tracks = usize::min(self.core.img.num_tracks(),50);
        if !(sectors==13 || sectors==16 || sectors==32) || tracks <= VTOC_TRACK {
            error!("cannot put DOS on {} tracks of {} sectors",tracks,sectors);
            return Err(Box::new(Error::Range));
        }
        trace!("formatting: zero all");
        for t in 0..tracks {
            for s in 0..sectors {
                self.core.img.write_sector(t,s,&[0;SECTOR_SIZE])?;
            }
        }
        self.dos32 = sectors==13;
        self.tracks = tracks;
        self.sectors = sectors;
        self.vol = vol;
        self.catalog = [VTOC_TRACK,sectors-1];
        trace!("formatting: VTOC");
        let mut buf = vec![0;SECTOR_SIZE];
        buf[0x34] = tracks as u8;
        buf[0x35] = sectors as u8;
        buf[0x37] = 1;
        let mut vtoc = VTOC::from_bytes(&buf)?;
        vtoc.pad1 = match self.dos32 { true => 2, false => 4 };
        vtoc.track1 = VTOC_TRACK as u8;
        vtoc.sector1 = (sectors-1) as u8;
        vtoc.version = match self.dos32 { true => 2, false => 3 };
        vtoc.vol = vol;
        vtoc.max_pairs = PAIRS_PER_LIST as u8;
        vtoc.last_track = VTOC_TRACK as u8;
        vtoc.last_direction = 1;
        for t in 1..tracks {
            if t != VTOC_TRACK {
                for s in 0..sectors {
                    vtoc.set_free(t,s,true);
                }
            }
        }
        self.write_vtoc(&vtoc)?;
        trace!("formatting: catalog");
        for s in (1..sectors).rev() {
            let mut sec = vec![0;SECTOR_SIZE];
            if s > 1 {
                sec[1] = VTOC_TRACK as u8;
                sec[2] = (s-1) as u8;
            }
            self.core.img.write_sector(VTOC_TRACK,s,&sec)?;
        }
        self.core.good = true;
        self.core.fully_enumerated = true;
        self.core.notes = Vec::new();
        info!("formatted DOS{:03} with {} tracks of {} sectors",vol,tracks,sectors);
        Ok(())
    }
    fn store_fork(&mut self,idx: usize,rsrc: bool,dat: &[u8]) -> STDRESULT {
        if rsrc {
            return Err(Box::new(super::Error::ForkNotPresent));
        }
        let key = self.core.files[idx].key;
        let mut entry = self.read_entry(key)?;
        if entry.file_type & LOCKED != 0 {
            return Err(Box::new(Error::FileLocked));
        }
        let old = self.entry_chain(&entry)?.allocated();
        let mut vtoc = self.read_vtoc()?;
        // the old chain stays allocated until the entry points at the new one
        let n = (dat.len() + SECTOR_SIZE - 1)/SECTOR_SIZE;
        let needed = n + usize::max(1,(n + PAIRS_PER_LIST - 1)/PAIRS_PER_LIST);
        if vtoc.num_free() < needed {
            error!("{} bytes will not fit",dat.len());
            return Err(Box::new(super::Error::DiskFull));
        }
        let (tsl,count) = self.write_data(&mut vtoc,dat)?;
        entry.tsl_track = tsl[0] as u8;
        entry.tsl_sector = tsl[1] as u8;
        entry.sectors = count as u16;
        self.write_entry(key,&entry)?;
        self.free_sectors(&mut vtoc,&old);
        self.write_vtoc(&vtoc)?;
        debug!("stored {} bytes in {} sectors",dat.len(),count);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::img::{CreateParams,WrapperKind,SectorOrder,Addressing,PhysicalFormat};

    fn blank() -> Box<dyn DiskFS> {
        let img = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Dos)).unwrap();
        Disk::format_img(img,"DOS254").unwrap()
    }

    fn binary(load: u16,body: &[u8]) -> Vec<u8> {
        let mut ans = u16::to_le_bytes(load).to_vec();
        ans.extend_from_slice(&u16::to_le_bytes(body.len() as u16));
        ans.extend_from_slice(body);
        ans
    }

    #[test]
    fn format_and_test() {
        let fs = blank();
        assert!(Disk::test(fs.img(),Leniency::Strict,false));
        assert!(!Disk::test(fs.img(),Leniency::Strict,true));
        assert_eq!(fs.volume_name(),"DOS254");
        assert_eq!(fs.fs_name(),"DOS 3.3");
        let free = fs.free_space().unwrap();
        assert_eq!(free.total,560);
        assert_eq!(free.free,560 - 32);
        assert_eq!(fs.fs_num_blocks(),280);
    }

    #[test]
    fn wrong_order_is_rejected() {
        let fs = blank();
        let mut img = fs.img().sub_image(0,143360,Addressing::Sectors { tracks: 35, sectors: 16 },SectorOrder::ProDos,None).unwrap();
        assert!(!Disk::test(&img,Leniency::Strict,false));
        img.set_order(SectorOrder::Dos);
        assert!(Disk::test(&img,Leniency::Strict,false));
    }

    #[test]
    fn binary_file() {
        let mut fs = blank();
        let body: Vec<u8> = (0..1000).map(|i| (i % 199) as u8).collect();
        fs.create_file("HELLO",FileKind::File,&FileInfo { file_type: 0x06, ..Default::default() }).unwrap();
        fs.write_file("HELLO",false,&binary(0x2000,&body)).unwrap();
        let idx = fs.find("hello").unwrap();
        assert_eq!(fs.files()[idx].data_len,1004);
        assert_eq!(fs.files()[idx].aux_type,0x2000);
        assert_eq!(fs.files()[idx].type_name(),"BIN");
        assert_eq!(fs.read_file("HELLO",false).unwrap(),binary(0x2000,&body));
        // 4 data sectors and 1 list
        assert_eq!(fs.free_space().unwrap().free,528 - 5);
        fs.set_file_info("HELLO",&FileInfo { file_type: 0x06, aux_type: 0x6000, ..Default::default() }).unwrap();
        let idx = fs.find("HELLO").unwrap();
        assert_eq!(fs.files()[idx].aux_type,0x6000);
    }

    #[test]
    fn long_text_file() {
        let mut fs = blank();
        let txt: Vec<u8> = (0..40000).map(|i| 0xc1 + (i % 26) as u8).collect();
        fs.create_file("STORY",FileKind::File,&FileInfo { file_type: 0x04, ..Default::default() }).unwrap();
        fs.write_file("STORY",false,&txt).unwrap();
        let idx = fs.find("STORY").unwrap();
        assert_eq!(fs.files()[idx].data_len,40000);
        assert_eq!(fs.files()[idx].quality,Quality::Good);
        assert_eq!(fs.read_file("STORY",false).unwrap(),txt);
        // 157 data sectors need 2 lists
        assert_eq!(fs.free_space().unwrap().free,528 - 159);
    }

    #[test]
    fn delete_restores_free_space() {
        let mut fs = blank();
        for i in 0..10 {
            let name = format!("FILE{}",i);
            fs.create_file(&name,FileKind::File,&FileInfo { file_type: 0x06, ..Default::default() }).unwrap();
            fs.write_file(&name,false,&binary(0x800,&vec![i as u8;600])).unwrap();
        }
        assert_eq!(fs.files().len(),10);
        for i in 0..10 {
            fs.delete_file(&format!("FILE{}",i)).unwrap();
        }
        assert_eq!(fs.files().len(),0);
        assert_eq!(fs.free_space().unwrap().free,528);
    }

    #[test]
    fn full_disk_keeps_old_chain() {
        let mut fs = blank();
        let txt = |len: usize,seed: usize| -> Vec<u8> { (0..len).map(|i| 0xc1 + ((i + seed) % 26) as u8).collect() };
        fs.create_file("KEEP",FileKind::File,&FileInfo { file_type: 0x04, ..Default::default() }).unwrap();
        fs.write_file("KEEP",false,&txt(20*256,0)).unwrap();
        fs.create_file("FILLER",FileKind::File,&FileInfo { file_type: 0x04, ..Default::default() }).unwrap();
        // leave 4 sectors after the filler's data and lists
        let room = fs.free_space().unwrap().free - 4;
        let mut n = room;
        while n + (n + PAIRS_PER_LIST - 1)/PAIRS_PER_LIST > room {
            n -= 1;
        }
        fs.write_file("FILLER",false,&txt(n*256,3)).unwrap();
        let before = fs.free_space().unwrap().free;
        assert!(before >= 3 && before < 41);
        let err = fs.write_file("KEEP",false,&txt(40*256,7)).unwrap_err();
        assert!(matches!(err.downcast_ref::<super::super::Error>(),Some(super::super::Error::DiskFull)));
        assert_eq!(fs.read_file("KEEP",false).unwrap(),txt(20*256,0));
        assert_eq!(fs.free_space().unwrap().free,before);
        // the new chain is built in free sectors, then the old 21 are released
        fs.write_file("KEEP",false,&txt(2*256,9)).unwrap();
        assert_eq!(fs.read_file("KEEP",false).unwrap(),txt(2*256,9));
        assert_eq!(fs.free_space().unwrap().free,before - 3 + 21);
        assert_eq!(fs.scan_usage().unwrap().conflicts(),0);
    }

    #[test]
    fn catalog_full() {
        let mut fs = blank();
        for i in 0..105 {
            fs.create_file(&format!("F{}",i),FileKind::File,&FileInfo::default()).unwrap();
        }
        let err = fs.create_file("ONE.MORE",FileKind::File,&FileInfo::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<super::super::Error>(),Some(super::super::Error::DirectoryFull)));
    }

    #[test]
    fn locked_file() {
        let mut fs = blank();
        fs.create_file("KEEP",FileKind::File,&FileInfo { file_type: 0xfc, access: Some(0x01), ..Default::default() }).unwrap();
        let err = fs.delete_file("KEEP").unwrap_err();
        assert_eq!(err.to_string(),"FILE LOCKED");
        assert!(fs.rename_file("KEEP","OTHER").is_err());
        fs.set_file_info("KEEP",&FileInfo { file_type: 0xfc, access: Some(0xc3), ..Default::default() }).unwrap();
        fs.rename_file("KEEP","OTHER").unwrap();
        assert!(fs.find("OTHER").is_some());
    }

    #[test]
    fn circular_catalog() {
        let fs = blank();
        let mut img = fs.img().sub_image(0,143360,Addressing::Sectors { tracks: 35, sectors: 16 },SectorOrder::Dos,None).unwrap();
        let mut sec = img.read_sector(17,10).unwrap();
        sec[1] = 17;
        sec[2] = 15;
        img.write_sector(17,10,&sec).unwrap();
        assert!(!Disk::test(&img,Leniency::Moderate,false));
        assert!(Disk::test(&img,Leniency::Lenient,false));
        let mut fs = Disk::mount(img,&MountOptions::new(MountMode::Full,Leniency::Lenient),false).unwrap();
        assert!(!fs.is_good());
        let err = fs.create_file("X",FileKind::File,&FileInfo::default()).unwrap_err();
        assert_eq!(err.to_string(),"disk is damaged and cannot be modified");
    }

    #[test]
    fn long_catalog_is_bounded() {
        let fs = blank();
        let mut img = fs.img().sub_image(0,143360,Addressing::Sectors { tracks: 35, sectors: 16 },SectorOrder::Dos,None).unwrap();
        // extend the chain from sector 1 through tracks 18 to 22
        let mut prev = [17,1];
        for t in 18..23 {
            for s in (0..16).rev() {
                let mut sec = img.read_sector(prev[0],prev[1]).unwrap();
                sec[1] = t as u8;
                sec[2] = s as u8;
                img.write_sector(prev[0],prev[1],&sec).unwrap();
                prev = [t,s];
            }
        }
        let fs = Disk::mount(img,&MountOptions::new(MountMode::ReadOnly,Leniency::Lenient),false).unwrap();
        assert!(!fs.fully_enumerated());
        assert!(!fs.is_good());
    }

    #[test]
    fn thirteen_sector_volume() {
        let params = CreateParams { addressing: Addressing::Sectors { tracks: 35, sectors: 13 }, phys: PhysicalFormat::Sectors, order: SectorOrder::Dos, volume: None };
        let img = DiskImg::create(WrapperKind::Raw,&params).unwrap();
        let mut fs = Disk::format_img(img,"100").unwrap();
        assert_eq!(fs.fs_name(),"DOS 3.2");
        assert!(Disk::test(fs.img(),Leniency::Strict,true));
        assert!(!Disk::test(fs.img(),Leniency::Strict,false));
        assert_eq!(fs.free_space().unwrap().free,(35-2)*13);
        fs.create_file("APPLESOFT",FileKind::File,&FileInfo { file_type: 0xfc, ..Default::default() }).unwrap();
        fs.write_file("APPLESOFT",false,&[3,0,1,2,3]).unwrap();
        let idx = fs.find("APPLESOFT").unwrap();
        assert_eq!(fs.files()[idx].data_len,5);
        assert_eq!(fs.files()[idx].aux_type,0x0801);
    }

    #[test]
    fn volume_numbers() {
        assert_eq!(parse_volume("DOS254"),Some(254));
        assert_eq!(parse_volume("17"),Some(17));
        assert_eq!(parse_volume("DOS0"),None);
        assert_eq!(parse_volume("DOS255"),None);
    }
}
