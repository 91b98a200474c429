//! # HFS file system module
//!
//! Read only support for Macintosh HFS volumes.  The volume structures are interpreted by
//! `engine`, which sees the disk only through the `BlockDevice` callbacks.  `ImgDevice`
//! adapts a `DiskImg` to those callbacks.
//!
//! The file list is built by visiting folders from the root, so the listing is ordered by
//! folder rather than by catalog key.  Files fragmented beyond the three extents stored in
//! their catalog record need the extents overflow file, which is not read; such files are
//! reported as damaged.

pub mod engine;

use std::collections::{HashMap,VecDeque};
use log::{trace,debug};
use engine::{Volume,CatRecord,FileRecord,DirRecord};
use super::{Block,DiskFS,FsCore,A2File,FileKind,ForkMap,FreeSpace,Leniency,MountMode,MountOptions,Quality};
use super::usage::{VolumeUsage,UsageTag};
use crate::img::{self,DiskImg};
use crate::{DYNERR,STDRESULT};

/// Seek, read, and write over 512 byte blocks.  This is the only way the engine touches the disk.
pub trait BlockDevice {
    fn seek(&mut self,block: usize) -> STDRESULT;
    /// read `count` blocks at the current position and advance
    fn read(&mut self,count: usize) -> Result<Vec<u8>,DYNERR>;
    /// write whole blocks at the current position and advance
    fn write(&mut self,dat: &[u8]) -> STDRESULT;
    fn num_blocks(&self) -> usize;
}

enum Access<'a> {
    Shared(&'a DiskImg),
    Exclusive(&'a mut DiskImg)
}

/// `BlockDevice` over a disk image, writes need the exclusive form
pub struct ImgDevice<'a> {
    img: Access<'a>,
    pos: usize
}

impl<'a> ImgDevice<'a> {
    pub fn new(img: &'a DiskImg) -> Self {
        Self { img: Access::Shared(img), pos: 0 }
    }
    pub fn new_mut(img: &'a mut DiskImg) -> Self {
        Self { img: Access::Exclusive(img), pos: 0 }
    }
    fn image(&self) -> &DiskImg {
        match &self.img {
            Access::Shared(i) => i,
            Access::Exclusive(i) => i
        }
    }
}

impl<'a> BlockDevice for ImgDevice<'a> {
    fn seek(&mut self,block: usize) -> STDRESULT {
        if block > self.num_blocks() {
            return Err(Box::new(img::Error::OutOfRange));
        }
        self.pos = block;
        Ok(())
    }
    fn read(&mut self,count: usize) -> Result<Vec<u8>,DYNERR> {
        let mut ans = Vec::new();
        for i in 0..count {
            ans.append(&mut self.image().read_block(self.pos + i)?);
        }
        self.pos += count;
        Ok(ans)
    }
    fn write(&mut self,dat: &[u8]) -> STDRESULT {
        let pos = self.pos;
        let img = match &mut self.img {
            Access::Exclusive(i) => i,
            Access::Shared(_) => return Err(Box::new(img::Error::ReadOnly))
        };
        let mut count = 0;
        for chunk in dat.chunks(img::BLOCK_SIZE) {
            img.write_block(pos + count,chunk)?;
            count += 1;
        }
        self.pos += count;
        Ok(())
    }
    fn num_blocks(&self) -> usize {
        self.image().num_blocks()
    }
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
        if img.num_blocks() < 4 {
            return false;
        }
        let mut dev = ImgDevice::new(img);
        let mdb = match engine::read_mdb(&mut dev) {
            Ok(m) => m,
            Err(_) => return false
        };
        if mdb.sig != engine::SIGNATURE {
            return false;
        }
        if leniency==Leniency::Lenient {
            return mdb.alloc_size > 0 && mdb.alloc_size as usize % engine::BLOCK_SIZE == 0;
        }
        if mdb.name_len==0 || mdb.name_len as usize > engine::MAX_VOL_NAME {
            debug!("HFS volume name length {}",mdb.name_len);
            return false;
        }
        let vol = match Volume::open(&mut dev) {
            Ok(v) => v,
            Err(e) => {
                debug!("HFS open failed: {}",e);
                return false;
            }
        };
        match leniency {
            Leniency::Strict => match vol.catalog(&mut dev) {
                Ok(cat) => !cat.broken,
                Err(_) => false
            },
            _ => true
        }
    }
    pub fn mount(img: DiskImg,opts: &MountOptions) -> Result<Box<dyn DiskFS>,DYNERR> {
        let mut disk = Self::new(img,opts.mode);
        let name = disk.open()?.0.vol_name();
        disk.vol_name = name;
        super::finish_mount(disk)
    }
    fn open(&self) -> Result<(Volume,ImgDevice),DYNERR> {
        let mut dev = ImgDevice::new(&self.core.img);
        let vol = Volume::open(&mut dev)?;
        Ok((vol,dev))
    }
    fn find_record(&self,cnid: u32) -> Result<FileRecord,DYNERR> {
        let (vol,mut dev) = self.open()?;
        for r in vol.catalog(&mut dev)?.records {
            if let CatRecord::File { parent: _, name: _, rec } = r {
                if rec.cnid==cnid {
                    return Ok(rec);
                }
            }
        }
        Err(Box::new(super::Error::FileNotFound))
    }
    fn dir_file(&self,name: &str,rec: &DirRecord,parent: usize) -> A2File {
        let mut file = A2File::new(name,FileKind::Directory,rec.cnid as u64);
        file.file_type = 0x0f;
        file.access = 0xc3;
        file.created = engine::mac_time(rec.created);
        file.modified = engine::mac_time(rec.modified);
        file.parent = Some(parent);
        file
    }
    fn plain_file(&mut self,vol: &Volume,name: &str,rec: &FileRecord,parent: usize) -> A2File {
        let mut file = A2File::new(name,FileKind::File,rec.cnid as u64);
        if &rec.creator==b"pdos" && rec.fd_type[0]==b'p' {
            file.file_type = rec.fd_type[1] as u32;
            file.aux_type = u16::from_be_bytes([rec.fd_type[2],rec.fd_type[3]]) as u32;
        } else {
            file.file_type = u32::from_be_bytes(rec.fd_type);
            file.aux_type = u32::from_be_bytes(rec.creator);
        }
        file.access = match rec.is_locked() { true => 0x01, false => 0xc3 };
        file.created = engine::mac_time(rec.created);
        file.modified = engine::mac_time(rec.modified);
        file.parent = Some(parent);
        let (dlen,dphys,dext) = rec.fork(false);
        let (rlen,rphys,rext) = rec.fork(true);
        let dcap = vol.extent_blocks(dext).len()*engine::BLOCK_SIZE;
        let rcap = vol.extent_blocks(rext).len()*engine::BLOCK_SIZE;
        file.data_len = dlen;
        file.rsrc_len = Some(rlen);
        file.data_sparse_len = usize::min(dlen,dcap);
        file.rsrc_sparse_len = usize::min(rlen,rcap);
        if dphys > dcap || rphys > rcap || dlen > dcap || rlen > rcap {
            self.core.note(&format!("{}: fork continues in the extents overflow file",name),true);
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
        "HFS"
    }
    fn volume_name(&self) -> String {
        self.vol_name.clone()
    }
    fn free_space(&self) -> Result<FreeSpace,DYNERR> {
        let (vol,mut dev) = self.open()?;
        let bitmap = vol.bitmap(&mut dev)?;
        let used = bitmap.iter().filter(|b| *b).count();
        Ok(FreeSpace { total: bitmap.len(), free: bitmap.len() - used, unit_size: vol.mdb.alloc_size as usize })
    }
    fn fs_num_blocks(&self) -> usize {
        self.core.img.num_blocks()
    }
    fn scan_usage(&mut self) -> Result<VolumeUsage,DYNERR> {
        let (vol,mut dev) = self.open()?;
        let mut usage = VolumeUsage::new(vol.mdb.alloc_blocks as usize,vol.mdb.alloc_size as usize);
        let mut problems = Vec::new();
        for a in vol.alloc_units(&vol.mdb.ct_extents) {
            usage.mark(a,UsageTag::Directory);
        }
        for a in vol.alloc_units(&vol.mdb.xt_extents) {
            usage.mark(a,UsageTag::System);
        }
        for r in vol.catalog(&mut dev)?.records {
            if let CatRecord::File { parent: _, name, rec } = r {
                for a in vol.alloc_units(&rec.data_extents).into_iter().chain(vol.alloc_units(&rec.rsrc_extents)) {
                    if !usage.mark(a,UsageTag::FileData) {
                        problems.push(format!("{}: allocation block {} is claimed twice",name,a));
                    }
                }
            }
        }
        let bitmap = vol.bitmap(&mut dev)?;
        let mut used_but_free = 0;
        for (a,set) in bitmap.iter().enumerate() {
            match (usage.get(a),set) {
                (Some(UsageTag::Free),true) => usage.mark_if_free(a,UsageTag::System),
                (Some(_),false) => used_but_free += 1,
                _ => {}
            }
        }
        if used_but_free > 0 {
            problems.push(format!("{} allocation blocks in use are marked free",used_but_free));
        }
        for p in problems {
            self.core.note(&p,true);
        }
        Ok(usage)
    }
    fn rescan(&mut self) -> STDRESULT {
        self.core.files = Vec::new();
        let (vol,cat) = {
            let (vol,mut dev) = self.open()?;
            let cat = vol.catalog(&mut dev)?;
            (vol,cat)
        };
        self.vol_name = vol.vol_name();
        if cat.broken {
            self.core.fully_enumerated = false;
            self.core.note("catalog leaf chain is broken",true);
        }
        let mut root = A2File::new(&self.vol_name,FileKind::VolumeDir,engine::ROOT_CNID as u64);
        root.file_type = 0x0f;
        root.path = String::new();
        let root_idx = self.core.add_file(root);
        // children of each folder, in catalog order
        let mut children: HashMap<u32,Vec<&CatRecord>> = HashMap::new();
        for r in &cat.records {
            let parent = match r {
                CatRecord::Dir { parent, name: _, rec: _ } => *parent,
                CatRecord::File { parent, name: _, rec: _ } => *parent
            };
            children.entry(parent).or_default().push(r);
        }
        let mut placed = 0;
        let mut queue: VecDeque<(u32,usize)> = VecDeque::from([(engine::ROOT_CNID,root_idx)]);
        while let Some((cnid,idx)) = queue.pop_front() {
            let kids = match children.remove(&cnid) {
                Some(k) => k,
                None => continue
            };
            for r in kids {
                placed += 1;
                match r {
                    CatRecord::Dir { parent: _, name, rec } => {
                        let file = self.dir_file(name,rec,idx);
                        let new_idx = self.core.add_file(file);
                        queue.push_back((rec.cnid,new_idx));
                    },
                    CatRecord::File { parent: _, name, rec } => {
                        let file = self.plain_file(&vol,name,rec,idx);
                        self.core.add_file(file);
                    }
                }
            }
        }
        // the root folder itself is keyed by its parent
        let orphans = cat.records.len() - placed - children.remove(&engine::ROOT_PARENT).map_or(0,|v| v.len());
        if orphans > 0 {
            self.core.note(&format!("{} catalog records are not reachable from the root",orphans),true);
        }
        trace!("placed {} catalog records",placed);
        debug!("found {} HFS entries",self.core.files.len());
        Ok(())
    }
    fn fork_map(&self,idx: usize,rsrc: bool) -> Result<ForkMap,DYNERR> {
        let rec = self.find_record(self.core.files[idx].key as u32)?;
        let (vol,_) = self.open()?;
        let (eof,_,ext) = rec.fork(rsrc);
        Ok(ForkMap {
            units: vol.extent_blocks(ext).into_iter().map(|b| Some(Block::PO(b))).collect(),
            skip: 0,
            eof
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::img::{CreateParams,WrapperKind};

    fn key(parent: u32,name: &str) -> Vec<u8> {
        let mut ans = vec![(6 + name.len()) as u8,0];
        ans.extend(parent.to_be_bytes());
        ans.push(name.len() as u8);
        ans.extend(name.as_bytes());
        if ans.len() % 2 == 1 {
            ans.push(0);
        }
        ans
    }

    fn dir_rec(cnid: u32) -> Vec<u8> {
        let mut ans = vec![0;70];
        ans[0] = 1;
        ans[6..10].copy_from_slice(&cnid.to_be_bytes());
        ans[10..14].copy_from_slice(&86400u32.to_be_bytes());
        ans
    }

    fn thread_rec(parent: u32,name: &str) -> Vec<u8> {
        let mut ans = vec![3,0];
        ans.extend([0;8]);
        ans.extend(parent.to_be_bytes());
        ans.push(name.len() as u8);
        ans.extend(name.as_bytes());
        ans.resize(46,0);
        ans
    }

    fn file_rec(cnid: u32,typ: &[u8;4],creator: &[u8;4],data: (u32,u16,u16),rsrc: (u32,u16,u16)) -> Vec<u8> {
        let mut ans = vec![0;102];
        ans[0] = 2;
        ans[4..8].copy_from_slice(typ);
        ans[8..12].copy_from_slice(creator);
        ans[20..24].copy_from_slice(&cnid.to_be_bytes());
        ans[26..30].copy_from_slice(&data.0.to_be_bytes());
        ans[30..34].copy_from_slice(&(data.2 as u32*512).to_be_bytes());
        ans[36..40].copy_from_slice(&rsrc.0.to_be_bytes());
        ans[40..44].copy_from_slice(&(rsrc.2 as u32*512).to_be_bytes());
        ans[74..76].copy_from_slice(&data.1.to_be_bytes());
        ans[76..78].copy_from_slice(&data.2.to_be_bytes());
        ans[86..88].copy_from_slice(&rsrc.1.to_be_bytes());
        ans[88..90].copy_from_slice(&rsrc.2.to_be_bytes());
        ans
    }

    fn node(kind: u8,recs: &[Vec<u8>]) -> Vec<u8> {
        let mut ans = vec![0;engine::NODE_SIZE];
        ans[8] = kind;
        ans[9] = 1;
        ans[10..12].copy_from_slice(&(recs.len() as u16).to_be_bytes());
        let mut off = 14;
        for (i,r) in recs.iter().enumerate() {
            ans[off..off+r.len()].copy_from_slice(r);
            let pos = engine::NODE_SIZE - 2*(i+1);
            ans[pos..pos+2].copy_from_slice(&(off as u16).to_be_bytes());
            off += r.len();
        }
        ans
    }

    /// 800K volume, 512 byte allocation blocks starting at block 5.
    /// Catalog is allocation blocks 0-3, extents file 4-5, README uses 6-8, Docs/Note uses 9.
    fn fixture() -> DiskImg {
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(1600)).unwrap();
        let mut mdb = vec![0;512];
        mdb[0..2].copy_from_slice(&engine::SIGNATURE.to_be_bytes());
        mdb[14..16].copy_from_slice(&3u16.to_be_bytes());
        mdb[18..20].copy_from_slice(&1593u16.to_be_bytes());
        mdb[20..24].copy_from_slice(&512u32.to_be_bytes());
        mdb[28..30].copy_from_slice(&5u16.to_be_bytes());
        mdb[36] = 7;
        mdb[37..44].copy_from_slice(b"Macdisk");
        mdb[130..134].copy_from_slice(&1024u32.to_be_bytes());
        mdb[134..138].copy_from_slice(&[0,4,0,2]);
        mdb[146..150].copy_from_slice(&2048u32.to_be_bytes());
        mdb[150..154].copy_from_slice(&[0,0,0,4]);
        img.write_block(2,&mdb).unwrap();
        let mut bitmap = vec![0;512];
        bitmap[0] = 0xff;
        bitmap[1] = 0xc0;
        img.write_block(3,&bitmap).unwrap();
        let mut header = vec![0;106];
        header[0..2].copy_from_slice(&1u16.to_be_bytes());
        header[2..6].copy_from_slice(&1u32.to_be_bytes());
        header[6..10].copy_from_slice(&7u32.to_be_bytes());
        header[10..14].copy_from_slice(&1u32.to_be_bytes());
        header[14..18].copy_from_slice(&1u32.to_be_bytes());
        header[18..20].copy_from_slice(&512u16.to_be_bytes());
        header[20..22].copy_from_slice(&37u16.to_be_bytes());
        header[22..26].copy_from_slice(&4u32.to_be_bytes());
        header[26..30].copy_from_slice(&2u32.to_be_bytes());
        img.write_block(5,&node(1,&[header])).unwrap();
        let recs = vec![
            [key(1,"Macdisk"),dir_rec(2)].concat(),
            [key(2,""),thread_rec(1,"Macdisk")].concat(),
            [key(2,"Docs"),dir_rec(16)].concat(),
            [key(2,"README"),file_rec(17,b"TEXT",b"ttxt",(700,6,2),(100,8,1))].concat(),
            [key(16,""),thread_rec(2,"Docs")].concat(),
            [key(16,"Note"),file_rec(18,b"p\xfc\x08\x01",b"pdos",(10,9,1),(0,0,0))].concat()
        ];
        img.write_block(6,&node(0xff,&recs)).unwrap();
        img.write_block(11,&[b'R';512]).unwrap();
        img.write_block(12,&[b'r';512]).unwrap();
        img.write_block(13,&[b'f';512]).unwrap();
        img.write_block(14,&[b'N';512]).unwrap();
        img
    }

    #[test]
    fn catalog_walk() {
        let img = fixture();
        assert!(Disk::test(&img,Leniency::Strict));
        let mut fs = Disk::mount(img,&MountOptions::new(MountMode::Full,Leniency::Strict)).unwrap();
        assert!(fs.is_good());
        assert_eq!(fs.volume_name(),"Macdisk");
        assert_eq!(fs.files().len(),4);
        let readme = fs.find("README").unwrap();
        assert_eq!(fs.files()[readme].rsrc_len,Some(100));
        assert_eq!(fs.files()[readme].file_type,u32::from_be_bytes(*b"TEXT"));
        let dat = fs.read_file("README",false).unwrap();
        assert_eq!(dat.len(),700);
        assert_eq!(dat[511],b'R');
        assert_eq!(dat[512],b'r');
        assert_eq!(fs.read_file("README",true).unwrap(),vec![b'f';100]);
        let note = fs.find("Docs/Note").unwrap();
        assert_eq!(fs.files()[note].type_name(),"BAS");
        assert_eq!(fs.files()[note].aux_type,0x0801);
        assert_eq!(fs.read_file("docs/note",false).unwrap(),vec![b'N';10]);
        let docs = fs.find("Docs").unwrap();
        assert!(fs.files()[docs].created.is_some());
    }

    #[test]
    fn allocation() {
        let mut fs = Disk::mount(fixture(),&MountOptions::new(MountMode::ReadOnly,Leniency::Strict)).unwrap();
        let free = fs.free_space().unwrap();
        assert_eq!(free.total,1593);
        assert_eq!(free.free,1593 - 10);
        let usage = fs.scan_usage().unwrap();
        assert_eq!(usage.in_use() + free.free,free.total);
        assert!(fs.is_good());
    }

    #[test]
    fn device_seam() {
        let mut img = fixture();
        {
            let mut dev = ImgDevice::new(&img);
            assert!(dev.write(&[0;512]).is_err());
            dev.seek(2).unwrap();
            assert_eq!(&dev.read(1).unwrap()[0..2],b"BD");
        }
        let mut dev = ImgDevice::new_mut(&mut img);
        dev.seek(100).unwrap();
        dev.write(&[7;1024]).unwrap();
        dev.seek(101).unwrap();
        assert_eq!(dev.read(1).unwrap(),vec![7;512]);
        assert_eq!(dev.num_blocks(),1600);
    }

    #[test]
    fn broken_leaf_link() {
        let mut img = fixture();
        let mut leaf = img.read_block(6).unwrap();
        leaf[0..4].copy_from_slice(&1u32.to_be_bytes());
        img.write_block(6,&leaf).unwrap();
        assert!(!Disk::test(&img,Leniency::Strict));
        assert!(Disk::test(&img,Leniency::Moderate));
        let mut fs = Disk::mount(img,&MountOptions::new(MountMode::Full,Leniency::Moderate)).unwrap();
        assert!(!fs.is_good());
        assert!(!fs.fully_enumerated());
        assert!(fs.create_file("X",FileKind::File,&super::super::FileInfo::default()).is_err());
    }
}
