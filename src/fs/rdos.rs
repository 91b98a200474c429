//! # RDOS file system module
//!
//! Read only support for the RDOS disks SSI used for its games.  The catalog occupies
//! the first sectors of track 1 and is a flat list of 32 byte entries.  Files are
//! contiguous runs of sectors, located by absolute sector number.
//!
//! * RDOS 3.2 is on 13 sector disks
//! * RDOS 3.3 is on 16 sector disks, which are read with ProDOS sector ordering
//!
//! The first entry is normally the operating system itself, starting at sector 0.

use binrw::{binrw,BinRead};
use std::io::Cursor;
use log::{trace,debug};
use super::{Block,DiskFS,FsCore,A2File,FileKind,ForkMap,FreeSpace,Leniency,MountMode,MountOptions,Quality};
use super::usage::{VolumeUsage,UsageTag};
use crate::img::{DiskImg,SECTOR_SIZE};
use crate::{DYNERR,STDRESULT};

const CATALOG_TRACK: usize = 1;
const ENTRY_SIZE: usize = 32;
const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE/ENTRY_SIZE;
const DELETED: u8 = 0x80;
/// `RDOS ` in high ASCII
const SIGNATURE: [u8;5] = [0xd2,0xc4,0xcf,0xd3,0xa0];

#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum Flavor {
    Rdos32,
    Rdos33
}

impl Flavor {
    fn sectors(&self) -> usize {
        match self {
            Self::Rdos32 => 13,
            Self::Rdos33 => 16
        }
    }
    fn catalog_sectors(&self) -> usize {
        match self {
            Self::Rdos32 => 10,
            Self::Rdos33 => 11
        }
    }
}

#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
struct Entry {
    name: [u8;24],
    file_type: u8,
    sectors: u8,
    load: u16,
    length: u16,
    start: u16
}

impl Entry {
    fn name(&self) -> String {
        self.name.iter().map(|b| match b & 0x7f { c @ 0x20..=0x7e => c as char, _ => '?' }).collect::<String>().trim_end().to_string()
    }
    fn is_end(&self) -> bool {
        self.name[0]==0
    }
    fn is_deleted(&self) -> bool {
        self.name[0]==DELETED
    }
    fn name_ok(&self) -> bool {
        self.name.iter().all(|b| *b >= 0xa0 && *b < 0xff)
    }
    fn type_char(&self) -> char {
        (self.file_type & 0x7f) as char
    }
}

/// Catalog entries in order, with their slot numbers, stopping at the end marker
fn read_catalog(img: &DiskImg,flavor: Flavor) -> Result<Vec<(usize,Entry)>,DYNERR> {
    let mut ans = Vec::new();
    for s in 0..flavor.catalog_sectors() {
        let buf = img.read_sector(CATALOG_TRACK,s)?;
        for i in 0..ENTRIES_PER_SECTOR {
            let entry = Entry::read(&mut Cursor::new(&buf[i*ENTRY_SIZE..(i+1)*ENTRY_SIZE]))?;
            if entry.is_end() {
                return Ok(ans);
            }
            ans.push((s*ENTRIES_PER_SECTOR + i,entry));
        }
    }
    Ok(ans)
}

/// The primary interface for disk operations.
pub struct Disk {
    core: FsCore,
    flavor: Flavor
}

impl Disk {
    fn new(img: DiskImg,mode: MountMode,flavor: Flavor) -> Self {
        Self {
            core: FsCore::new(img,mode),
            flavor
        }
    }
    pub fn test(img: &DiskImg,leniency: Leniency,flavor: Flavor) -> bool {
        if !img.sector_capable() || img.sectors_per_track() != flavor.sectors() || img.num_tracks() < 35 {
            return false;
        }
        let total = img.num_tracks()*flavor.sectors();
        let cat = match read_catalog(img,flavor) {
            Ok(c) => c,
            Err(_) => {
                debug!("RDOS catalog not readable");
                return false;
            }
        };
        let first = match cat.first() {
            Some((_,e)) => e,
            None => {
                debug!("RDOS catalog is empty");
                return false;
            }
        };
        if leniency < Leniency::Lenient && first.name[0..5] != SIGNATURE {
            debug!("first entry is not RDOS");
            return false;
        }
        for (slot,e) in &cat {
            if e.is_deleted() {
                continue;
            }
            if !e.name_ok() || e.start as usize + e.sectors as usize > total {
                debug!("RDOS entry {} is bad",slot);
                return false;
            }
        }
        if leniency==Leniency::Strict {
            let cat_end = (CATALOG_TRACK*flavor.sectors() + flavor.catalog_sectors()) as u16;
            if first.start != 0 || (first.sectors as u16) < cat_end || first.type_char() != 'B' {
                debug!("RDOS system entry does not cover the catalog");
                return false;
            }
        }
        true
    }
    pub fn mount(img: DiskImg,opts: &MountOptions,flavor: Flavor) -> Result<Box<dyn DiskFS>,DYNERR> {
        super::finish_mount(Self::new(img,opts.mode,flavor))
    }
    fn total(&self) -> usize {
        self.core.img.num_tracks()*self.flavor.sectors()
    }
    fn ts(&self,abs: usize) -> [usize;2] {
        [abs / self.flavor.sectors(),abs % self.flavor.sectors()]
    }
    fn entry(&self,key: u64) -> Result<Entry,DYNERR> {
        match read_catalog(&self.core.img,self.flavor)?.into_iter().find(|(slot,_)| *slot as u64==key) {
            Some((_,e)) => Ok(e),
            None => Err(Box::new(super::Error::FileNotFound))
        }
    }
    /// Sector usage, along with problems found
    fn usage_map(&self) -> Result<(VolumeUsage,Vec<String>),DYNERR> {
        let total = self.total();
        let mut usage = VolumeUsage::new(total,SECTOR_SIZE);
        let mut problems = Vec::new();
        for s in 0..self.flavor.catalog_sectors() {
            usage.mark(CATALOG_TRACK*self.flavor.sectors() + s,UsageTag::Directory);
        }
        for (_,e) in read_catalog(&self.core.img,self.flavor)? {
            if e.is_deleted() {
                continue;
            }
            let end = usize::min(e.start as usize + e.sectors as usize,total);
            for u in e.start as usize..end {
                if e.start==0 {
                    // the system image spans the boot and catalog tracks
                    usage.mark_if_free(u,UsageTag::System);
                } else if !usage.mark(u,UsageTag::FileData) {
                    problems.push(format!("{}: sector {} is claimed twice",e.name(),u));
                }
            }
        }
        Ok((usage,problems))
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
        match self.flavor {
            Flavor::Rdos32 => "RDOS 3.2",
            Flavor::Rdos33 => "RDOS 3.3"
        }
    }
    fn volume_name(&self) -> String {
        "RDOS".to_string()
    }
    fn free_space(&self) -> Result<FreeSpace,DYNERR> {
        let (usage,_) = self.usage_map()?;
        Ok(FreeSpace { total: usage.len(), free: usage.len() - usage.in_use(), unit_size: SECTOR_SIZE })
    }
    fn fs_num_blocks(&self) -> usize {
        self.total()/2
    }
    fn scan_usage(&mut self) -> Result<VolumeUsage,DYNERR> {
        let (usage,problems) = self.usage_map()?;
        for p in problems {
            self.core.note(&p,true);
        }
        Ok(usage)
    }
    fn rescan(&mut self) -> STDRESULT {
        self.core.files = Vec::new();
        let total = self.total();
        for (slot,e) in read_catalog(&self.core.img,self.flavor)? {
            if e.is_deleted() {
                continue;
            }
            let mut file = A2File::new(&e.name(),FileKind::File,slot as u64);
            let alloc = e.sectors as usize*SECTOR_SIZE;
            let (ft,aux,len) = match e.type_char() {
                'A' => (0xfc,0x0801,e.length as usize),
                'B' => (0x06,e.load as u32,e.length as usize),
                'T' => (0x04,0,alloc),
                _ => (0x00,0,alloc)
            };
            file.file_type = ft;
            file.aux_type = aux;
            file.access = 0x01;
            file.data_len = usize::min(len,alloc);
            file.data_sparse_len = file.data_len;
            if len > alloc {
                trace!("{}: length {} exceeds {} sectors",e.name(),len,e.sectors);
                file.quality = Quality::Suspicious;
            }
            if e.start as usize + e.sectors as usize > total {
                self.core.note(&format!("{}: extends past the end of the disk",e.name()),true);
                file.quality = Quality::Damaged;
            }
            self.core.add_file(file);
        }
        debug!("found {} RDOS files",self.core.files.len());
        Ok(())
    }
    fn fork_map(&self,idx: usize,rsrc: bool) -> Result<ForkMap,DYNERR> {
        if rsrc {
            return Err(Box::new(super::Error::ForkNotPresent));
        }
        let e = self.entry(self.core.files[idx].key)?;
        let end = usize::min(e.start as usize + e.sectors as usize,self.total());
        Ok(ForkMap {
            units: (e.start as usize..end).map(|u| Some(Block::DO(self.ts(u)))).collect(),
            skip: 0,
            eof: self.core.files[idx].data_len
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::img::{CreateParams,WrapperKind,SectorOrder,Addressing,PhysicalFormat};

    fn put_entry(buf: &mut [u8],slot: usize,name: &str,typ: char,sectors: u8,load: u16,length: u16,start: u16) {
        let e = &mut buf[slot*ENTRY_SIZE..(slot+1)*ENTRY_SIZE];
        let padded = format!("{:24}",name);
        for (i,c) in padded.bytes().enumerate() {
            e[i] = c | 0x80;
        }
        e[24] = typ as u8 | 0x80;
        e[25] = sectors;
        e[26..28].copy_from_slice(&load.to_le_bytes());
        e[28..30].copy_from_slice(&length.to_le_bytes());
        e[30..32].copy_from_slice(&start.to_le_bytes());
    }

    fn fixture() -> DiskImg {
        let params = CreateParams { addressing: Addressing::Sectors { tracks: 35, sectors: 13 }, phys: PhysicalFormat::Sectors, order: SectorOrder::Dos, volume: None };
        let mut img = DiskImg::create(WrapperKind::Raw,&params).unwrap();
        let mut cat = vec![0;SECTOR_SIZE];
        put_entry(&mut cat,0,"RDOS 2.1 COPYRIGHT 1981",'B',26,0x1b00,0x1a00,0);
        put_entry(&mut cat,1,"GAME",'B',4,0x4000,900,26);
        put_entry(&mut cat,2,"OLD",'B',2,0x4000,300,30);
        cat[2*ENTRY_SIZE] = DELETED;
        put_entry(&mut cat,3,"SCORES",'T',3,0,0,40);
        img.write_sector(1,0,&cat).unwrap();
        for s in 26..30 {
            img.write_sector(s/13,s%13,&[s as u8;256]).unwrap();
        }
        img
    }

    #[test]
    fn catalog() {
        let img = fixture();
        assert!(Disk::test(&img,Leniency::Strict,Flavor::Rdos32));
        assert!(!Disk::test(&img,Leniency::Strict,Flavor::Rdos33));
        let mut fs = Disk::mount(img,&MountOptions::new(MountMode::ReadOnly,Leniency::Strict),Flavor::Rdos32).unwrap();
        assert_eq!(fs.fs_name(),"RDOS 3.2");
        assert_eq!(fs.files().len(),3);
        let idx = fs.find("GAME").unwrap();
        assert_eq!(fs.files()[idx].aux_type,0x4000);
        let dat = fs.read_file("GAME",false).unwrap();
        assert_eq!(dat.len(),900);
        assert_eq!(dat[0],26);
        assert_eq!(dat[899],29);
        assert_eq!(fs.files()[fs.find("SCORES").unwrap()].data_len,768);
    }

    #[test]
    fn usage() {
        let mut fs = Disk::mount(fixture(),&MountOptions::new(MountMode::Full,Leniency::Strict),Flavor::Rdos32).unwrap();
        assert!(fs.is_good());
        let free = fs.free_space().unwrap();
        assert_eq!(free.total,455);
        assert_eq!(free.free,455 - 26 - 4 - 3);
        let usage = fs.scan_usage().unwrap();
        assert_eq!(usage.in_use() + free.free,free.total);
    }

    #[test]
    fn signature_required() {
        let mut img = fixture();
        let mut cat = img.read_sector(1,0).unwrap();
        cat[0] = 0xc1;
        img.write_sector(1,0,&cat).unwrap();
        assert!(!Disk::test(&img,Leniency::Moderate,Flavor::Rdos32));
        assert!(Disk::test(&img,Leniency::Lenient,Flavor::Rdos32));
    }
}
