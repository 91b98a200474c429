//! ## FAT file system module
//!
//! The File Allocation Table (FAT) file system is named after the structure that
//! keeps track of allocated clusters.
//! The FAT itself is implemented in `crate::bios::fat`, this module makes use of the FAT
//! as part of managing the overall file system.
//! Supports FAT12 and FAT16 volumes, read only.  Long file names are skipped, only the 8.3 names
//! are listed.  Assumes empty partition table.

mod directory;
mod types;

use std::collections::{HashMap,HashSet,VecDeque};
use log::{trace,debug};
use types::*;
use directory::{Entry,EntryType};
use super::{Block,DiskFS,FsCore,A2File,FileKind,ForkMap,FreeSpace,Leniency,MountMode,MountOptions,Quality};
use super::usage::{VolumeUsage,UsageTag};
use crate::img::{self,DiskImg};
use crate::bios::{bpb,fat};
use crate::bios::fat::Cluster;
use crate::{DYNERR,STDRESULT};

/// The primary interface for disk operations.
pub struct Disk {
    core: FsCore,
    boot: bpb::BootSector,
    /// bits per FAT entry
    typ: usize,
    label: String,
    /// first cluster of each listed entry, by key
    starts: HashMap<u64,u32>
}

fn entry_key(dir_cluster: u32,idx: usize) -> u64 {
    ((dir_cluster as u64) << 32) | idx as u64
}

/// image blocks covering a range of logical sectors
fn sec_blocks(boot: &bpb::BootSector,rng: [u64;2]) -> Vec<usize> {
    let k = usize::max(1,boot.sec_size() as usize / img::BLOCK_SIZE);
    (rng[0] as usize*k..rng[1] as usize*k).collect()
}

fn read_sectors(img: &DiskImg,boot: &bpb::BootSector,rng: [u64;2]) -> Result<Vec<u8>,DYNERR> {
    let mut ans = Vec::new();
    for b in sec_blocks(boot,rng) {
        ans.append(&mut img.read_block(b)?);
    }
    Ok(ans)
}

impl Disk {
    fn new(img: DiskImg,boot: bpb::BootSector,mode: MountMode) -> Self {
        let typ = boot.fat_type();
        Self {
            core: FsCore::new(img,mode),
            boot,
            typ,
            label: String::new(),
            starts: HashMap::new()
        }
    }
    /// Test an image for the FAT file system.
    pub fn test(img: &DiskImg,leniency: Leniency) -> bool {
        if img.num_blocks() < 2 {
            return false;
        }
        let buf = match img.read_block(0) {
            Ok(b) => b,
            Err(_) => {
                debug!("boot sector was not readable");
                return false;
            }
        };
        if !bpb::BootSector::has_signature(&buf) {
            if leniency != Leniency::Lenient || (buf[0]!=0xeb && buf[0]!=0xe9) {
                return false;
            }
            debug!("accepting boot sector without signature");
        }
        let boot = match bpb::BootSector::from_sector(&buf) {
            Ok(b) => b,
            Err(_) => return false
        };
        if !boot.verify() || boot.fat_size_16==0 || boot.fat_type()==32 {
            return false;
        }
        let k = boot.sec_size() as usize / img::BLOCK_SIZE;
        if leniency != Leniency::Lenient && boot.tot_sec() as usize * k > img.num_blocks() {
            debug!("FAT volume is larger than the image");
            return false;
        }
        if leniency==Leniency::Strict {
            let fat0 = match img.read_block(boot.res_secs() as usize * k) {
                Ok(b) => b[0],
                Err(_) => return false
            };
            if fat0 != boot.media {
                debug!("media byte {} does not match FAT {}",boot.media,fat0);
                return false;
            }
            let root = match read_sectors(img,&boot,boot.root_dir_sec_rng()) {
                Ok(r) => r,
                Err(_) => return false
            };
            let bad = directory::entries(&root).iter().filter(|(_,e)| e.kind()!=EntryType::VolumeLabel && !e.is_name_valid()).count();
            if bad > 0 {
                debug!("{} bad names in root directory",bad);
                return false;
            }
        }
        true
    }
    pub fn mount(img: DiskImg,opts: &MountOptions) -> Result<Box<dyn DiskFS>,DYNERR> {
        let boot = bpb::BootSector::from_sector(&img.read_block(0)?)?;
        let mut disk = Self::new(img,boot,opts.mode);
        disk.label = disk.find_label()?;
        super::finish_mount(disk)
    }
    /// image blocks per logical sector
    fn blocks_per_sec(&self) -> usize {
        usize::max(1,self.boot.sec_size() as usize / img::BLOCK_SIZE)
    }
    fn read_secs(&self,rng: [u64;2]) -> Result<Vec<u8>,DYNERR> {
        read_sectors(&self.core.img,&self.boot,rng)
    }
    fn cluster_blocks(&self,n: u32) -> Vec<usize> {
        let beg = self.boot.first_cluster_sec(n as u64);
        sec_blocks(&self.boot,[beg,beg + self.boot.sec_per_clus as u64])
    }
    fn max_cluster(&self) -> u32 {
        self.boot.cluster_count() as u32 + fat::FIRST_DATA_CLUSTER
    }
    /// buffer the first copy of the FAT
    fn read_fat(&self) -> Result<Vec<u8>,DYNERR> {
        let beg = self.boot.res_secs();
        self.read_secs([beg,beg + self.boot.fat_secs()])
    }
    /// Follow the chain starting at `cluster1`.  Returns the clusters that could be
    /// followed, along with a description of the problem if the chain did not end properly.
    fn chain(&self,cluster1: u32,fat_buf: &[u8]) -> (Vec<u32>,Option<&'static str>) {
        let mut ans = Vec::new();
        if cluster1==0 {
            return (ans,None);
        }
        let mut visited = HashSet::new();
        let mut curr = cluster1;
        loop {
            if curr < fat::FIRST_DATA_CLUSTER || curr >= self.max_cluster() {
                return (ans,Some("cluster out of range"));
            }
            if !visited.insert(curr) {
                return (ans,Some("cluster chain forms a loop"));
            }
            ans.push(curr);
            match fat::cluster_state(curr as usize,self.typ,fat_buf) {
                Some(Cluster::Next(n)) => curr = n,
                Some(Cluster::Last) => return (ans,None),
                Some(Cluster::Free) => return (ans,Some("cluster chain runs into a free cluster")),
                Some(Cluster::Bad) => return (ans,Some("cluster chain runs into a bad cluster")),
                None => return (ans,Some("cluster is beyond the FAT"))
            }
        }
    }
    fn read_chain(&self,chain: &[u32]) -> Result<Vec<u8>,DYNERR> {
        let mut ans = Vec::new();
        for c in chain {
            for b in self.cluster_blocks(*c) {
                ans.append(&mut self.core.img.read_block(b)?);
            }
        }
        Ok(ans)
    }
    /// Label from the root directory, or else the boot sector
    fn find_label(&self) -> Result<String,DYNERR> {
        let root = self.read_secs(self.boot.root_dir_sec_rng())?;
        for (_,e) in directory::entries(&root) {
            if e.kind()==EntryType::VolumeLabel {
                return Ok(e.label());
            }
        }
        let ans = match self.boot.label() {
            Some(lab) => String::from_utf8_lossy(&lab).trim_end().to_string(),
            None => String::new()
        };
        match ans.len() {
            0 => Ok("NO NAME".to_string()),
            _ => Ok(ans)
        }
    }
    fn entry_file(&mut self,e: &Entry,key: u64,parent: usize,fat_buf: &[u8]) -> A2File {
        let kind = match e.kind() {
            EntryType::Directory => FileKind::Directory,
            _ => FileKind::File
        };
        let mut file = A2File::new(&e.name(),kind,key);
        file.parent = Some(parent);
        file.created = e.created();
        file.modified = e.modified();
        file.access = match e.get_attr(READ_ONLY) {
            true => 0x01,
            false => 0xc3
        };
        if e.get_attr(HIDDEN) || e.get_attr(SYSTEM) {
            file.access |= 0x04;
        }
        if e.get_attr(ARCHIVE) {
            file.access |= 0x20;
        }
        if !e.is_name_valid() {
            self.core.note(&format!("invalid file name {}",e.name()),false);
            file.quality = Quality::Suspicious;
        }
        if e.cluster1() != 0 {
            self.starts.insert(key,e.cluster1());
        }
        let (chain,problem) = self.chain(e.cluster1(),fat_buf);
        if let Some(msg) = problem {
            self.core.note(&format!("{}: {}",e.name(),msg),true);
            file.quality = Quality::Damaged;
        }
        let capacity = chain.len()*self.boot.cluster_size() as usize;
        match kind {
            FileKind::Directory => {
                file.file_type = 0x0f;
                if e.cluster1()==0 {
                    self.core.note(&format!("{}: directory has no clusters",e.name()),true);
                    file.quality = Quality::Damaged;
                }
                file.data_sparse_len = capacity;
            },
            _ => {
                file.file_type = crate::fs::cpm::types::prodos_type(&e.ext());
                file.data_len = e.eof();
                file.data_sparse_len = usize::min(e.eof(),capacity);
                if e.eof() > capacity && problem.is_none() {
                    self.core.note(&format!("{}: size exceeds its clusters",e.name()),true);
                    file.quality = Quality::Damaged;
                }
            }
        }
        file
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
        match self.typ {
            12 => "FAT12",
            _ => "FAT16"
        }
    }
    fn volume_name(&self) -> String {
        self.label.clone()
    }
    fn free_space(&self) -> Result<FreeSpace,DYNERR> {
        let fat_buf = self.read_fat()?;
        let free = (fat::FIRST_DATA_CLUSTER..self.max_cluster()).filter(|c| fat::is_free(*c as usize,self.typ,&fat_buf)).count();
        Ok(FreeSpace {
            total: self.boot.cluster_count() as usize,
            free,
            unit_size: self.boot.cluster_size() as usize
        })
    }
    fn fs_num_blocks(&self) -> usize {
        self.boot.tot_sec() as usize * self.blocks_per_sec()
    }
    fn scan_usage(&mut self) -> Result<VolumeUsage,DYNERR> {
        let fat_buf = self.read_fat()?;
        let first = fat::FIRST_DATA_CLUSTER as usize;
        let mut usage = VolumeUsage::new(self.boot.cluster_count() as usize,self.boot.cluster_size() as usize);
        let mut problems = Vec::new();
        for f in &self.core.files {
            let start = match self.starts.get(&f.key) {
                Some(c) => *c,
                None => continue
            };
            let tag = match f.kind {
                FileKind::Directory => UsageTag::Directory,
                _ => UsageTag::FileData
            };
            for c in self.chain(start,&fat_buf).0 {
                if !usage.mark(c as usize - first,tag) {
                    problems.push(format!("{}: cluster {} is claimed twice",f.path,c));
                }
            }
        }
        let mut lost = 0;
        for c in first..self.max_cluster() as usize {
            match fat::cluster_state(c,self.typ,&fat_buf) {
                Some(Cluster::Bad) => usage.mark_if_free(c - first,UsageTag::Bad),
                Some(Cluster::Free) | None => {},
                _ => {
                    if usage.get(c - first)==Some(UsageTag::Free) {
                        lost += 1;
                        usage.mark_if_free(c - first,UsageTag::System);
                    }
                }
            }
        }
        if lost > 0 {
            trace!("{} allocated clusters belong to no file",lost);
        }
        for p in problems {
            self.core.note(&p,true);
        }
        Ok(usage)
    }
    fn rescan(&mut self) -> STDRESULT {
        self.core.files = Vec::new();
        self.starts = HashMap::new();
        self.label = self.find_label()?;
        let fat_buf = self.read_fat()?;
        let mut root = A2File::new(&self.label,FileKind::VolumeDir,0);
        root.file_type = 0x0f;
        root.path = String::new();
        let root_idx = self.core.add_file(root);
        let mut visited = HashSet::new();
        // (first cluster or 0 for the root, index in file list, depth)
        let mut queue: VecDeque<(u32,usize,usize)> = VecDeque::from([(0,root_idx,0)]);
        while let Some((cluster1,idx,depth)) = queue.pop_front() {
            let buf = match cluster1 {
                0 => self.read_secs(self.boot.root_dir_sec_rng())?,
                c => self.read_chain(&self.chain(c,&fat_buf).0)?
            };
            for (i,e) in directory::entries(&buf) {
                if e.is_dot() || e.kind()==EntryType::VolumeLabel {
                    continue;
                }
                let file = self.entry_file(&e,entry_key(cluster1,i),idx,&fat_buf);
                let is_dir = file.kind==FileKind::Directory;
                let new_idx = self.core.add_file(file);
                if is_dir && e.cluster1() != 0 {
                    if depth + 1 >= MAX_DIR_DEPTH {
                        self.core.fully_enumerated = false;
                        self.core.note(&format!("{}: directories are nested too deeply",e.name()),false);
                    } else if visited.insert(e.cluster1()) {
                        queue.push_back((e.cluster1(),new_idx,depth + 1));
                    } else {
                        self.core.note(&format!("{}: directory is listed twice",e.name()),true);
                    }
                }
            }
        }
        debug!("found {} FAT entries",self.core.files.len());
        Ok(())
    }
    fn fork_map(&self,idx: usize,rsrc: bool) -> Result<ForkMap,DYNERR> {
        if rsrc {
            return Err(Box::new(super::Error::ForkNotPresent));
        }
        let file = &self.core.files[idx];
        let fat_buf = self.read_fat()?;
        let chain = match self.starts.get(&file.key) {
            Some(c) => self.chain(*c,&fat_buf).0,
            None => Vec::new()
        };
        if chain.is_empty() && file.data_len > 0 {
            return Err(Box::new(Error::FirstClusterInvalid));
        }
        let mut units = Vec::new();
        for c in chain {
            units.extend(self.cluster_blocks(c).into_iter().map(|b| Some(Block::PO(b))));
        }
        Ok(ForkMap { units, skip: 0, eof: file.data_len })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use super::directory::raw_entry;
    use crate::img::{CreateParams,WrapperKind};

    fn set12(buf: &mut [u8],n: usize,val: u16) {
        let off = n + n/2;
        match n & 1 {
            1 => {
                buf[off] = (buf[off] & 0x0f) | ((val << 4) as u8);
                buf[off+1] = (val >> 4) as u8;
            },
            _ => {
                buf[off] = val as u8;
                buf[off+1] = (buf[off+1] & 0xf0) | ((val >> 8) as u8 & 0x0f);
            }
        }
    }

    fn write_fat(img: &mut DiskImg,links: &[(usize,u16)]) {
        let mut buf = vec![0;1536];
        set12(&mut buf,0,0xff9);
        set12(&mut buf,1,0xfff);
        for (n,v) in links {
            set12(&mut buf,*n,*v);
        }
        for (i,chunk) in buf.chunks(512).enumerate() {
            img.write_block(1+i,chunk).unwrap();
            img.write_block(4+i,chunk).unwrap();
        }
    }

    /// 720K floppy with HELLO.TXT in clusters 2-3, DOCS in cluster 4, DOCS/NOTE in cluster 5
    fn fixture() -> DiskImg {
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(1440)).unwrap();
        img.write_block(0,&bpb::floppy_720()).unwrap();
        write_fat(&mut img,&[(2,3),(3,0xfff),(4,0xfff),(5,0xfff)]);
        let root = [
            raw_entry(b"MYDISK     ",VOLUME_ID,0,0),
            raw_entry(b"HELLO   TXT",READ_ONLY|ARCHIVE,2,600),
            raw_entry(b"DOCS       ",DIRECTORY,4,0)
        ].concat();
        let mut blk = vec![0;512];
        blk[0..root.len()].copy_from_slice(&root);
        img.write_block(7,&blk).unwrap();
        img.write_block(14,&[b'H';512]).unwrap();
        img.write_block(15,&[b'h';512]).unwrap();
        let sub = [
            raw_entry(b".          ",DIRECTORY,4,0),
            raw_entry(b"..         ",DIRECTORY,0,0),
            raw_entry(b"NOTE       ",0,5,10)
        ].concat();
        let mut blk = vec![0;512];
        blk[0..sub.len()].copy_from_slice(&sub);
        img.write_block(18,&blk).unwrap();
        img.write_block(20,&[b'N';512]).unwrap();
        img
    }

    #[test]
    fn catalog() {
        let img = fixture();
        assert!(Disk::test(&img,Leniency::Strict));
        let mut fs = Disk::mount(img,&MountOptions::new(MountMode::Full,Leniency::Strict)).unwrap();
        assert!(fs.is_good());
        assert_eq!(fs.fs_name(),"FAT12");
        assert_eq!(fs.volume_name(),"MYDISK");
        assert_eq!(fs.files().len(),4);
        let hello = fs.find("hello.txt").unwrap();
        assert_eq!(fs.files()[hello].file_type,0x04);
        assert_eq!(fs.files()[hello].access,0x21);
        assert!(fs.files()[hello].modified.is_some());
        let dat = fs.read_file("HELLO.TXT",false).unwrap();
        assert_eq!(dat.len(),600);
        assert_eq!(dat[511],b'H');
        assert_eq!(dat[512],b'h');
        assert!(fs.read_file("HELLO.TXT",true).is_err());
        let note = fs.find("DOCS/NOTE").unwrap();
        assert_eq!(fs.files()[fs.files()[note].parent.unwrap()].name,"DOCS");
        assert_eq!(fs.read_file("DOCS/NOTE",false).unwrap(),vec![b'N';10]);
    }

    #[test]
    fn allocation() {
        let mut fs = Disk::mount(fixture(),&MountOptions::new(MountMode::ReadOnly,Leniency::Strict)).unwrap();
        let free = fs.free_space().unwrap();
        assert_eq!(free.total,713);
        assert_eq!(free.free,709);
        assert_eq!(free.unit_size,1024);
        let usage = fs.scan_usage().unwrap();
        assert_eq!(usage.in_use(),4);
        assert_eq!(usage.count(UsageTag::Directory),1);
        assert!(fs.is_good());
        assert_eq!(fs.fs_num_blocks(),1440);
    }

    #[test]
    fn chain_loop() {
        let mut img = fixture();
        write_fat(&mut img,&[(2,3),(3,2),(4,0xfff),(5,0xfff)]);
        let fs = Disk::mount(img,&MountOptions::new(MountMode::Full,Leniency::Moderate)).unwrap();
        assert!(!fs.is_good());
        let hello = fs.find("HELLO.TXT").unwrap();
        assert_eq!(fs.files()[hello].quality,Quality::Damaged);
    }

    #[test]
    fn signature() {
        let mut img = fixture();
        let mut boot = img.read_block(0).unwrap();
        boot[510] = 0;
        img.write_block(0,&boot).unwrap();
        assert!(!Disk::test(&img,Leniency::Strict));
        assert!(!Disk::test(&img,Leniency::Moderate));
        assert!(Disk::test(&img,Leniency::Lenient));
    }

    #[test]
    fn read_only() {
        let mut fs = Disk::mount(fixture(),&MountOptions::new(MountMode::Full,Leniency::Strict)).unwrap();
        assert!(fs.write_file("HELLO.TXT",false,&[0;10]).is_err());
        assert!(fs.delete_file("HELLO.TXT").is_err());
    }
}
