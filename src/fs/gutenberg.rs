//! # Gutenberg file system module
//!
//! Read only support for disks written by the Gutenberg word processor.
//! Every sector starts with a 6 byte header holding the previous, next, and own
//! track and sector.  A set high bit on the previous track marks the first sector of
//! a chain, on the next track the last.  The catalog is itself such a chain starting
//! at track 17 sector 7; its first sector carries the volume name after the header.

use std::collections::HashSet;
use log::debug;
use super::{Block,DiskFS,FsCore,A2File,FileKind,ForkMap,FreeSpace,Leniency,MountMode,MountOptions,Quality};
use super::usage::{VolumeUsage,UsageTag};
use crate::img::{DiskImg,SECTOR_SIZE};
use crate::{DYNERR,STDRESULT};

const CATALOG: [usize;2] = [17,7];
const HEADER_SIZE: usize = 6;
const ENTRY_SIZE: usize = 16;
const ENTRIES_PER_SECTOR: usize = 15;
const NAME_LEN: usize = 12;
/// bound on any chain, the disk has no more sectors than this
const MAX_CHAIN: usize = 35*16;

/// Decoded sector header
#[derive(Clone,Copy,Debug)]
struct Header {
    prev: [usize;2],
    next: [usize;2],
    this: [usize;2],
    first: bool,
    last: bool
}

impl Header {
    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            prev: [(buf[0] & 0x7f) as usize,buf[1] as usize],
            next: [(buf[2] & 0x7f) as usize,buf[3] as usize],
            this: [(buf[4] & 0x7f) as usize,buf[5] as usize],
            first: buf[0] & 0x80 != 0,
            last: buf[2] & 0x80 != 0
        }
    }
}

/// Sectors of one chain
struct Chain {
    sectors: Vec<[usize;2]>,
    /// last sector's data
    tail: Vec<u8>,
    broken: bool
}

fn read_chain(img: &DiskImg,start: [usize;2]) -> Result<Chain,DYNERR> {
    let mut ans = Chain { sectors: Vec::new(), tail: Vec::new(), broken: false };
    let mut visited = HashSet::new();
    let mut ts = start;
    loop {
        if ts[0] >= img.num_tracks() || ts[1] >= 16 || !visited.insert(ts) || ans.sectors.len() >= MAX_CHAIN {
            ans.broken = true;
            return Ok(ans);
        }
        let buf = img.read_sector(ts[0],ts[1])?;
        let hdr = Header::from_bytes(&buf);
        ans.sectors.push(ts);
        if hdr.this != ts {
            ans.broken = true;
        }
        if hdr.last {
            ans.tail = buf[HEADER_SIZE..].to_vec();
            return Ok(ans);
        }
        ts = hdr.next;
    }
}

fn hi_ascii(field: &[u8]) -> String {
    field.iter().map(|b| match b & 0x7f { c @ 0x20..=0x7e => c as char, _ => '?' }).collect::<String>().trim_end().to_string()
}

struct Entry {
    name: String,
    start: [usize;2],
    file_type: u8
}

/// The primary interface for disk operations.
pub struct Disk {
    core: FsCore,
    vol_name: String
}

impl Disk {
    fn new(img: DiskImg,mode: MountMode) -> Self {
        Self {
            core: FsCore::new(img,mode),
            vol_name: String::new()
        }
    }
    pub fn test(img: &DiskImg,leniency: Leniency) -> bool {
        if !img.sector_capable() || img.sectors_per_track() != 16 || img.num_tracks() < 35 {
            return false;
        }
        let buf = match img.read_sector(CATALOG[0],CATALOG[1]) {
            Ok(b) => b,
            Err(_) => return false
        };
        let hdr = Header::from_bytes(&buf);
        if hdr.this != CATALOG {
            debug!("Gutenberg catalog header does not point to itself");
            return false;
        }
        match leniency {
            Leniency::Strict => {
                if !hdr.first {
                    debug!("Gutenberg catalog does not start a chain");
                    return false;
                }
                match read_chain(img,CATALOG) {
                    Ok(c) => !c.broken,
                    Err(_) => false
                }
            },
            Leniency::Moderate => buf[HEADER_SIZE..HEADER_SIZE+9].iter().all(|b| *b >= 0xa0),
            Leniency::Lenient => true
        }
    }
    pub fn mount(img: DiskImg,opts: &MountOptions) -> Result<Box<dyn DiskFS>,DYNERR> {
        super::finish_mount(Self::new(img,opts.mode))
    }
    fn total(&self) -> usize {
        self.core.img.num_tracks()*16
    }
    fn unit(ts: [usize;2]) -> usize {
        ts[0]*16 + ts[1]
    }
    /// Catalog entries keyed by position, along with the catalog chain
    fn entries(&self) -> Result<(Vec<(u64,Entry)>,Chain),DYNERR> {
        let chain = read_chain(&self.core.img,CATALOG)?;
        let mut ans = Vec::new();
        for (n,ts) in chain.sectors.iter().enumerate() {
            let buf = self.core.img.read_sector(ts[0],ts[1])?;
            for i in 0..ENTRIES_PER_SECTOR {
                let off = ENTRY_SIZE*(i+1);
                let e = &buf[off..off+ENTRY_SIZE];
                let name = hi_ascii(&e[0..NAME_LEN]);
                let start = [e[NAME_LEN] as usize,e[NAME_LEN+1] as usize];
                if start[0]==0 || name.len()==0 {
                    continue;
                }
                ans.push((((n*ENTRIES_PER_SECTOR) + i) as u64,Entry { name, start, file_type: e[NAME_LEN+2] }));
            }
        }
        Ok((ans,chain))
    }
    fn usage_map(&self) -> Result<(VolumeUsage,Vec<String>),DYNERR> {
        let mut usage = VolumeUsage::new(self.total(),SECTOR_SIZE);
        let mut problems = Vec::new();
        for s in 0..16 {
            usage.mark(s,UsageTag::System);
        }
        let (entries,cat) = self.entries()?;
        for ts in &cat.sectors {
            usage.mark(Self::unit(*ts),UsageTag::Directory);
        }
        for (_,e) in entries {
            let chain = read_chain(&self.core.img,e.start)?;
            for ts in chain.sectors {
                if !usage.mark(Self::unit(ts),UsageTag::FileData) {
                    problems.push(format!("{}: track {} sector {} is claimed twice",e.name,ts[0],ts[1]));
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
        "Gutenberg"
    }
    fn volume_name(&self) -> String {
        self.vol_name.clone()
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
        let buf = self.core.img.read_sector(CATALOG[0],CATALOG[1])?;
        self.vol_name = hi_ascii(&buf[HEADER_SIZE..ENTRY_SIZE]);
        let (entries,cat) = self.entries()?;
        if cat.broken {
            self.core.note("catalog chain is broken",true);
        }
        for (key,e) in entries {
            let mut file = A2File::new(&e.name,FileKind::File,key);
            file.file_type = 0x04;
            file.aux_type = e.file_type as u32;
            file.access = 0xc3;
            let chain = read_chain(&self.core.img,e.start)?;
            if chain.broken {
                self.core.note(&format!("{}: sector chain is broken",e.name),true);
                file.quality = Quality::Damaged;
            }
            let payload = SECTOR_SIZE - HEADER_SIZE;
            let tail = match chain.tail.iter().position(|b| *b==0) {
                Some(p) => p,
                None => chain.tail.len()
            };
            file.data_len = match chain.sectors.len() {
                0 => 0,
                n if chain.broken => n*payload,
                n => (n-1)*payload + tail
            };
            file.data_sparse_len = file.data_len;
            self.core.add_file(file);
        }
        debug!("found {} Gutenberg files",self.core.files.len());
        Ok(())
    }
    fn fork_map(&self,idx: usize,rsrc: bool) -> Result<ForkMap,DYNERR> {
        if rsrc {
            return Err(Box::new(super::Error::ForkNotPresent));
        }
        let key = self.core.files[idx].key;
        let start = match self.entries()?.0.into_iter().find(|(k,_)| *k==key) {
            Some((_,e)) => e.start,
            None => return Err(Box::new(super::Error::FileNotFound))
        };
        let chain = read_chain(&self.core.img,start)?;
        Ok(ForkMap {
            units: chain.sectors.into_iter().map(|ts| Some(Block::DO(ts))).collect(),
            skip: HEADER_SIZE,
            eof: self.core.files[idx].data_len
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::img::{CreateParams,WrapperKind,SectorOrder};

    fn put_sector(img: &mut DiskImg,this: [usize;2],prev: [usize;2],next: [usize;2],first: bool,last: bool,body: &[u8]) {
        let mut buf = vec![0;SECTOR_SIZE];
        buf[0] = prev[0] as u8 | match first { true => 0x80, false => 0 };
        buf[1] = prev[1] as u8;
        buf[2] = next[0] as u8 | match last { true => 0x80, false => 0 };
        buf[3] = next[1] as u8;
        buf[4] = this[0] as u8;
        buf[5] = this[1] as u8;
        buf[HEADER_SIZE..HEADER_SIZE+body.len()].copy_from_slice(body);
        img.write_sector(this[0],this[1],&buf).unwrap();
    }

    fn fixture() -> DiskImg {
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Dos)).unwrap();
        let mut cat = vec![0xa0;ENTRY_SIZE*(ENTRIES_PER_SECTOR+1)-HEADER_SIZE];
        cat[0..9].copy_from_slice(&"WORKDISK ".bytes().map(|b| b | 0x80).collect::<Vec<u8>>());
        let e = ENTRY_SIZE - HEADER_SIZE;
        for (i,c) in "LETTER".bytes().enumerate() {
            cat[e+i] = c | 0x80;
        }
        cat[e+NAME_LEN] = 20;
        cat[e+NAME_LEN+1] = 3;
        cat[e+NAME_LEN+2] = 0xd4;
        for i in 1..ENTRIES_PER_SECTOR {
            cat[e + i*ENTRY_SIZE + NAME_LEN] = 0;
        }
        put_sector(&mut img,CATALOG,CATALOG,CATALOG,true,true,&cat[0..SECTOR_SIZE-HEADER_SIZE]);
        put_sector(&mut img,[20,3],[20,4],[20,4],true,false,&[b'x';250]);
        let mut tail = vec![b'y';100];
        tail.push(0);
        put_sector(&mut img,[20,4],[20,3],[20,3],false,true,&tail);
        img
    }

    #[test]
    fn chained_file() {
        let img = fixture();
        assert!(Disk::test(&img,Leniency::Strict));
        let mut fs = Disk::mount(img,&MountOptions::new(MountMode::Full,Leniency::Strict)).unwrap();
        assert!(fs.is_good());
        assert_eq!(fs.volume_name(),"WORKDISK");
        assert_eq!(fs.files().len(),1);
        let dat = fs.read_file("LETTER",false).unwrap();
        assert_eq!(dat.len(),350);
        assert_eq!(dat[249],b'x');
        assert_eq!(dat[250],b'y');
        let free = fs.free_space().unwrap();
        assert_eq!(free.free,560 - 16 - 1 - 2);
    }

    #[test]
    fn self_reference_checked() {
        let mut img = fixture();
        let mut buf = img.read_sector(17,7).unwrap();
        buf[5] = 8;
        img.write_sector(17,7,&buf).unwrap();
        assert!(!Disk::test(&img,Leniency::Lenient));
        let blank = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Dos)).unwrap();
        assert!(!Disk::test(&blank,Leniency::Lenient));
    }
}
