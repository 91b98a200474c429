//! ## CP/M file system module
//!
//! Read only support for CP/M 2.2 as it was laid out on 5.25 inch Apple disks.
//! The first three tracks hold the system, the directory starts on track 3 and
//! occupies the first two 1K blocks.  Each 1K block is four 256 byte sectors
//! taken through the CP/M skew, see `bios::skew`.
//!
//! The key concept of the CP/M directory is the "extent," which is a subset of a file's data.
//! A file larger than 16K needs more than one extent; all of its extents share the user number
//! and name, and the length is found from the extent with the highest index.
//! Files belonging to user 0 are listed by name, files of other users as `n:NAME.TYP`.

pub mod types;
mod directory;

use std::collections::{HashMap,HashSet};
use log::{trace,debug};
use types::*;
use directory::*;
use super::{Block,DiskFS,FsCore,A2File,FileKind,ForkMap,FreeSpace,Leniency,MountMode,MountOptions,Quality};
use super::usage::{VolumeUsage,UsageTag};
use crate::bios::skew;
use crate::img::{self,DiskImg};
use crate::{DYNERR,STDRESULT};

/// All the extents of one file, in directory order
struct FileExtents {
    user: u8,
    name: String,
    /// (directory slot, extent)
    extents: Vec<(usize,Extent)>
}

impl FileExtents {
    fn key(&self) -> u64 {
        ((self.user as u64) << 16) | self.extents[0].0 as u64
    }
    fn last(&self) -> Option<&Extent> {
        self.extents.iter().map(|(_,x)| x).max_by_key(|x| x.index())
    }
    fn allocated(&self) -> Vec<usize> {
        self.extents.iter().flat_map(|(_,x)| x.block_list()).filter(|b| *b!=0).collect()
    }
}

/// The sectors of a block as DOS logical sectors
fn block_units(block: usize) -> [Block;SECTORS_PER_BLOCK] {
    let track = RESERVED_TRACKS + block*SECTORS_PER_BLOCK/16;
    let first = (block*SECTORS_PER_BLOCK) % 16;
    let mut ans = [Block::DO([0,0]);SECTORS_PER_BLOCK];
    for i in 0..SECTORS_PER_BLOCK {
        ans[i] = Block::DO([track,skew::cpm_sec_to_dos_lsec(first+i)]);
    }
    ans
}

fn read_block(img: &DiskImg,block: usize) -> Result<Vec<u8>,DYNERR> {
    let mut ans = Vec::new();
    for unit in block_units(block) {
        if let Block::DO([t,s]) = unit {
            ans.append(&mut img.read_sector(t,s)?);
        }
    }
    Ok(ans)
}

fn read_directory(img: &DiskImg) -> Result<Vec<Extent>,DYNERR> {
    let mut buf = Vec::new();
    for b in 0..DIR_BLOCKS {
        buf.append(&mut read_block(img,b)?);
    }
    if buf.len() != DIR_ENTRIES*DIR_ENTRY_SIZE {
        return Err(Box::new(Error::BadFormat));
    }
    extents_from_bytes(&buf)
}

/// Gather file extents by user and name, preserving directory order
fn group_extents(dir: &[Extent]) -> Vec<FileExtents> {
    let mut ans: Vec<FileExtents> = Vec::new();
    let mut index: HashMap<(u8,String),usize> = HashMap::new();
    for (slot,x) in dir.iter().enumerate() {
        if x.kind() != ExtentType::File || x.problem().is_some() {
            continue;
        }
        let id = (x.user,x.name());
        match index.get(&id) {
            Some(i) => ans[*i].extents.push((slot,x.clone())),
            None => {
                index.insert(id,ans.len());
                ans.push(FileExtents { user: x.user, name: x.name(), extents: vec![(slot,x.clone())] });
            }
        }
    }
    ans
}

/// The primary interface for disk operations.
pub struct Disk {
    core: FsCore,
    label: Option<String>
}

impl Disk {
    fn new(img: DiskImg,mode: MountMode) -> Self {
        Self {
            core: FsCore::new(img,mode),
            label: None
        }
    }
    /// Test an image for a CP/M directory.  Strict wants a consistent directory with at least one
    /// file, Moderate accepts an empty directory, Lenient tolerates a few bad entries.
    pub fn test(img: &DiskImg,leniency: Leniency) -> bool {
        if !img.sector_capable() || img.sectors_per_track() != 16 || img.num_tracks() < 35 {
            return false;
        }
        let dir = match read_directory(img) {
            Ok(d) => d,
            Err(_) => {
                debug!("CP/M directory was not readable");
                return false;
            }
        };
        let mut bad = 0;
        for (slot,x) in dir.iter().enumerate() {
            if let Some(msg) = x.problem() {
                trace!("CP/M entry {}: {}",slot,msg);
                bad += 1;
            }
        }
        match leniency {
            Leniency::Strict => {
                if bad > 0 {
                    debug!("{} bad CP/M entries",bad);
                    return false;
                }
                let files = group_extents(&dir);
                if files.len()==0 {
                    debug!("no CP/M files");
                    return false;
                }
                let mut seen = HashSet::new();
                for f in &files {
                    for b in f.allocated() {
                        if !seen.insert(b) {
                            debug!("CP/M block {} is claimed twice",b);
                            return false;
                        }
                    }
                    let mut idx: Vec<usize> = f.extents.iter().map(|(_,x)| x.index()).collect();
                    idx.sort();
                    idx.dedup();
                    if idx.len() != f.extents.len() {
                        debug!("{} has duplicate extents",f.name);
                        return false;
                    }
                }
                true
            },
            Leniency::Moderate => {
                if bad > 0 {
                    debug!("{} bad CP/M entries",bad);
                }
                bad==0
            },
            Leniency::Lenient => bad < DIR_ENTRIES/8
        }
    }
    /// Mount the volume, the `DiskFS` takes ownership of the image.
    pub fn mount(img: DiskImg,opts: &MountOptions) -> Result<Box<dyn DiskFS>,DYNERR> {
        let fs = Self::new(img,opts.mode);
        super::finish_mount(fs)
    }
    fn groups(&self) -> Result<Vec<FileExtents>,DYNERR> {
        Ok(group_extents(&read_directory(&self.core.img)?))
    }
    fn claimed(&self) -> Result<HashSet<usize>,DYNERR> {
        let mut ans: HashSet<usize> = (0..DIR_BLOCKS).collect();
        for f in self.groups()? {
            ans.extend(f.allocated());
        }
        Ok(ans)
    }
    fn file_from_group(&mut self,f: &FileExtents) -> A2File {
        let path = user_path(f.user,&f.name);
        let mut file = A2File::new(&path,FileKind::File,f.key());
        let first = &f.extents[0].1;
        file.file_type = prodos_type(&first.typ);
        file.access = match first.is_read_only() { true => 0x01, false => 0xc3 };
        if first.is_system() {
            file.access |= 0x04;
        }
        file.data_len = f.last().map(|x| x.eof_if_last()).unwrap_or(0);
        file.data_sparse_len = usize::min(file.data_len,f.allocated().len()*BLOCK_SIZE);
        let mut idx: Vec<usize> = f.extents.iter().map(|(_,x)| x.index()).collect();
        idx.sort();
        idx.dedup();
        if idx.len() != f.extents.len() {
            self.core.note(&format!("{}: duplicate extents",path),true);
            file.quality = Quality::Damaged;
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
        "CP/M"
    }
    fn volume_name(&self) -> String {
        match &self.label {
            Some(s) => s.clone(),
            None => "CP/M".to_string()
        }
    }
    fn volume_id(&self) -> String {
        match &self.label {
            Some(s) => format!("CP/M {}",s),
            None => "CP/M".to_string()
        }
    }
    fn free_space(&self) -> Result<FreeSpace,DYNERR> {
        let used = self.claimed()?.iter().filter(|b| **b < TOTAL_BLOCKS).count();
        Ok(FreeSpace { total: TOTAL_BLOCKS, free: TOTAL_BLOCKS - used, unit_size: BLOCK_SIZE })
    }
    fn fs_num_blocks(&self) -> usize {
        self.core.img.num_tracks()*16*img::SECTOR_SIZE/img::BLOCK_SIZE
    }
    fn scan_usage(&mut self) -> Result<VolumeUsage,DYNERR> {
        let mut usage = VolumeUsage::new(TOTAL_BLOCKS,BLOCK_SIZE);
        for b in 0..DIR_BLOCKS {
            usage.mark(b,UsageTag::Directory);
        }
        for f in self.groups()? {
            for b in f.allocated() {
                if !usage.mark(b,UsageTag::FileData) {
                    self.core.note(&format!("{}: block {} is claimed twice",user_path(f.user,&f.name),b),true);
                }
            }
        }
        Ok(usage)
    }
    fn rescan(&mut self) -> STDRESULT {
        self.core.files = Vec::new();
        let dir = read_directory(&self.core.img)?;
        self.label = None;
        for (slot,x) in dir.iter().enumerate() {
            if let Some(msg) = x.problem() {
                self.core.note(&format!("directory entry {}: {}",slot,msg),true);
            }
            if x.kind()==ExtentType::Label && is_field_valid(&x.name,false) {
                self.label = Some(x.name());
            }
        }
        for f in group_extents(&dir) {
            let file = self.file_from_group(&f);
            self.core.add_file(file);
        }
        debug!("found {} CP/M files",self.core.files.len());
        Ok(())
    }
    fn fork_map(&self,idx: usize,rsrc: bool) -> Result<ForkMap,DYNERR> {
        if rsrc {
            return Err(Box::new(super::Error::ForkNotPresent));
        }
        let key = self.core.files[idx].key;
        let group = match self.groups()?.into_iter().find(|f| f.key()==key) {
            Some(g) => g,
            None => return Err(Box::new(Error::ReadError))
        };
        let mut blocks: Vec<Option<usize>> = Vec::new();
        for (_,x) in &group.extents {
            let base = x.index()*LOGICAL_EXTENT_SIZE/BLOCK_SIZE;
            for (i,b) in x.block_list().iter().enumerate() {
                if blocks.len() <= base + i {
                    blocks.resize(base + i + 1,None);
                }
                if *b != 0 {
                    blocks[base + i] = Some(*b);
                }
            }
        }
        let mut units = Vec::new();
        for b in blocks {
            match b {
                Some(b) => units.extend(block_units(b).iter().map(|u| Some(*u))),
                None => units.extend([None;SECTORS_PER_BLOCK])
            }
        }
        Ok(ForkMap { units, skip: 0, eof: self.core.files[idx].data_len })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::img::{CreateParams,WrapperKind,SectorOrder};

    fn write_block(img: &mut DiskImg,block: usize,dat: &[u8]) {
        for (i,unit) in block_units(block).iter().enumerate() {
            if let Block::DO([t,s]) = unit {
                img.write_sector(*t,*s,&dat[i*256..(i+1)*256]).unwrap();
            }
        }
    }

    fn entry(user: u8,name: &str,typ: &str,ex: u8,rc: u8,blocks: &[u8]) -> Vec<u8> {
        let mut ans = vec![user];
        ans.extend(format!("{:8}",name).as_bytes());
        ans.extend(format!("{:3}",typ).as_bytes());
        ans.extend([ex,0,0,rc]);
        let mut ptrs = [0u8;16];
        ptrs[0..blocks.len()].copy_from_slice(blocks);
        ans.extend(ptrs);
        ans
    }

    /// Directory with a 4K file in blocks 2-5 and a 20K file for user 3 in blocks 6-25
    fn fixture() -> DiskImg {
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Dos)).unwrap();
        for b in 0..TOTAL_BLOCKS {
            write_block(&mut img,b,&[DELETED;BLOCK_SIZE]);
        }
        let mut dir = Vec::new();
        dir.append(&mut entry(0,"HELLO","TXT",0,32,&[2,3,4,5]));
        let big: Vec<u8> = (6..22).collect();
        dir.append(&mut entry(3,"BIG","DAT",0,0x80,&big));
        dir.append(&mut entry(3,"BIG","DAT",1,32,&[22,23,24,25]));
        dir.resize(DIR_BLOCKS*BLOCK_SIZE,DELETED);
        write_block(&mut img,0,&dir[0..BLOCK_SIZE]);
        write_block(&mut img,1,&dir[BLOCK_SIZE..]);
        for b in 2..6 {
            write_block(&mut img,b,&[b'A';BLOCK_SIZE]);
        }
        for b in 6..26 {
            write_block(&mut img,b,&[b as u8;BLOCK_SIZE]);
        }
        img
    }

    #[test]
    fn detect() {
        let img = fixture();
        assert!(Disk::test(&img,Leniency::Strict));
        let mut wrong = img.sub_image(0,143360,crate::img::Addressing::Sectors { tracks: 35, sectors: 16 },SectorOrder::ProDos,None).unwrap();
        assert!(!Disk::test(&wrong,Leniency::Moderate));
        wrong.set_order(SectorOrder::Dos);
        assert!(Disk::test(&wrong,Leniency::Strict));
    }

    #[test]
    fn extents_and_lengths() {
        let mut fs = Disk::mount(fixture(),&MountOptions::new(MountMode::Full,Leniency::Strict)).unwrap();
        assert!(fs.is_good());
        assert_eq!(fs.files().len(),2);
        let idx = fs.find("3:big.dat").unwrap();
        assert_eq!(fs.files()[idx].data_len,16384 + 32*128);
        let dat = fs.read_file("3:BIG.DAT",false).unwrap();
        assert_eq!(dat.len(),20480);
        assert_eq!(dat[0],6);
        assert_eq!(dat[16384],22);
        assert_eq!(dat[20479],25);
        assert_eq!(fs.read_file("HELLO.TXT",false).unwrap(),vec![b'A';4096]);
        assert_eq!(fs.files()[fs.find("HELLO.TXT").unwrap()].type_name(),"TXT");
    }

    #[test]
    fn usage_matches_free_space() {
        let mut fs = Disk::mount(fixture(),&MountOptions::new(MountMode::ReadOnly,Leniency::Strict)).unwrap();
        let free = fs.free_space().unwrap();
        assert_eq!(free.total,128);
        assert_eq!(free.free,128 - 26);
        let usage = fs.scan_usage().unwrap();
        assert_eq!(usage.in_use() + free.free,free.total);
        assert_eq!(usage.conflicts(),0);
    }

    #[test]
    fn read_only() {
        let mut fs = Disk::mount(fixture(),&MountOptions::new(MountMode::Full,Leniency::Strict)).unwrap();
        let err = fs.delete_file("HELLO.TXT").unwrap_err();
        assert!(matches!(err.downcast_ref::<super::super::Error>(),Some(super::super::Error::Unsupported)));
    }

    #[test]
    fn blank_directory() {
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Dos)).unwrap();
        assert!(!Disk::test(&img,Leniency::Lenient));
        for b in 0..DIR_BLOCKS {
            write_block(&mut img,b,&[DELETED;BLOCK_SIZE]);
        }
        assert!(!Disk::test(&img,Leniency::Strict));
        assert!(Disk::test(&img,Leniency::Moderate));
    }
}
