//! ## Pascal file system module
//!
//! This module is *not* for the Pascal language, but rather the Pascal file system.
//! Files are contiguous runs of blocks listed in a single directory, in block order.
//! There is no allocation bitmap, free space is whatever the directory does not claim.
//!
//! * Deleting a file shifts the later entries down, there are no tombstones
//! * New files start at the largest free gap
//! * A file that outgrows the space after it is moved to the largest gap

pub mod types;
mod directory;

use log::{trace,debug,info,error};
use types::*;
use directory::*;
use super::{Block,DiskFS,FsCore,A2File,FileKind,FileInfo,ForkMap,FreeSpace,Leniency,MountMode,MountOptions,Quality};
use super::usage::{VolumeUsage,UsageTag};
use crate::img::DiskImg;
use crate::{DYNERR,STDRESULT};

pub const FS_NAME: &str = "Pascal";

/// Read the contiguous directory blocks, `end` is the block after the directory
fn read_dir_blocks(img: &DiskImg,end: usize) -> Result<Vec<u8>,DYNERR> {
    let mut buf = Vec::new();
    for b in VOL_HEADER_BLOCK..end {
        buf.append(&mut img.read_block(b)?);
    }
    Ok(buf)
}

/// The primary interface for disk operations.
pub struct Disk {
    core: FsCore,
    vol_name: String,
    total_blocks: usize,
    dir_end: usize
}

impl Disk {
    fn new(img: DiskImg,mode: MountMode) -> Self {
        Self {
            core: FsCore::new(img,mode),
            vol_name: String::new(),
            total_blocks: 0,
            dir_end: DIR_END_BLOCK
        }
    }
    /// Test an image for the Pascal file system.
    pub fn test(img: &DiskImg,leniency: Leniency) -> bool {
        let buf = match img.read_block(VOL_HEADER_BLOCK) {
            Ok(b) => b,
            Err(_) => {
                debug!("Pascal directory was not readable");
                return false;
            }
        };
        let hdr = match Directory::from_bytes(&buf) {
            Ok(d) => d.header,
            Err(_) => return false
        };
        let end = hdr.end_block as usize;
        let end_ok = match leniency {
            Leniency::Strict => end==DIR_END_BLOCK,
            _ => end > VOL_HEADER_BLOCK && end <= MAX_DIR_END
        };
        if hdr.begin_block!=0 || hdr.file_type!=0 || !end_ok {
            debug!("header begin {} end {} type {}",hdr.begin_block,end,hdr.file_type);
            return false;
        }
        let name_ok = match leniency {
            Leniency::Lenient => hdr.name_len > 0 && hdr.name_len <= 7,
            _ => hdr.name_len > 0 && hdr.name_len <= 7 && is_name_valid(&hdr.name(),true)
        };
        if !name_ok {
            debug!("header name length {}",hdr.name_len);
            return false;
        }
        let total = hdr.total_blocks as usize;
        let total_ok = match leniency {
            Leniency::Lenient => total > end,
            _ => total > end && total <= img.num_blocks()
        };
        if !total_ok {
            debug!("header total blocks {} on {} block image",total,img.num_blocks());
            return false;
        }
        if leniency == Leniency::Lenient {
            return true;
        }
        let dir = match read_dir_blocks(img,end).and_then(|b| Directory::from_bytes(&b)) {
            Ok(d) => d,
            Err(_) => return false
        };
        if hdr.num_files as usize > dir.capacity {
            debug!("header file count {}",hdr.num_files);
            return false;
        }
        let mut prev_end = end;
        for (i,entry) in dir.entries.iter().enumerate() {
            let (beg,eend) = (entry.begin_block as usize,entry.end_block as usize);
            if beg < end || eend < beg || eend > total {
                debug!("entry {} begin {} end {}",i,beg,eend);
                return false;
            }
            if leniency == Leniency::Strict {
                if beg < prev_end || !is_name_valid(&entry.name(),false) || entry.name_len as usize > 15 {
                    debug!("entry {} out of order or badly named",i);
                    return false;
                }
                prev_end = eend;
            }
        }
        true
    }
    /// Mount the volume, the `DiskFS` takes ownership of the image.
    pub fn mount(img: DiskImg,opts: &MountOptions) -> Result<Box<dyn DiskFS>,DYNERR> {
        let mut fs = Self::new(img,opts.mode);
        fs.read_header()?;
        super::finish_mount(fs)
    }
    /// Create a new empty volume on the image.
    pub fn format_img(img: DiskImg,vol_name: &str) -> Result<Box<dyn DiskFS>,DYNERR> {
        let mut fs = Self::new(img,MountMode::Full);
        fs.format(vol_name)?;
        Ok(Box::new(fs))
    }
    fn read_header(&mut self) -> STDRESULT {
        let dir = Directory::from_bytes(&self.core.img.read_block(VOL_HEADER_BLOCK)?)?;
        self.vol_name = dir.header.name();
        self.dir_end = usize::max(VOL_HEADER_BLOCK+1,usize::min(dir.header.end_block as usize,MAX_DIR_END));
        self.total_blocks = usize::min(dir.header.total_blocks as usize,self.core.img.num_blocks());
        if (dir.header.total_blocks as usize) > self.total_blocks {
            self.core.note(&format!("volume claims {} blocks but image has {}",dir.header.total_blocks,self.total_blocks),true);
        }
        Ok(())
    }
    fn read_directory(&self) -> Result<Directory,DYNERR> {
        Directory::from_bytes(&read_dir_blocks(&self.core.img,self.dir_end)?)
    }
    fn write_directory(&mut self,dir: &Directory) -> STDRESULT {
        let buf = dir.to_bytes()?;
        for (i,b) in (VOL_HEADER_BLOCK..self.dir_end).enumerate() {
            let start = usize::min(buf.len(),i*BLOCK_SIZE);
            let end = usize::min(buf.len(),(i+1)*BLOCK_SIZE);
            let mut blk = self.core.img.read_block(b)?;
            blk[0..end-start].copy_from_slice(&buf[start..end]);
            self.core.img.write_block(b,&blk)?;
        }
        Ok(())
    }
    /// Blocks claimed by the directory and every entry except `skip`
    fn claimed(&self,dir: &Directory,skip: Option<usize>) -> Vec<bool> {
        let mut ans = vec![false;self.total_blocks];
        for b in 0..usize::min(self.dir_end,self.total_blocks) {
            ans[b] = true;
        }
        for (i,entry) in dir.entries.iter().enumerate() {
            if Some(i)==skip {
                continue;
            }
            for b in entry.begin_block as usize..usize::min(entry.end_block as usize,self.total_blocks) {
                ans[b] = true;
            }
        }
        ans
    }
    /// Start and length of the largest free run
    fn largest_gap(&self,dir: &Directory,skip: Option<usize>) -> (usize,usize) {
        let claimed = self.claimed(dir,skip);
        let mut best = (0,0);
        let mut start = 0;
        let mut count = 0;
        for (b,used) in claimed.iter().enumerate() {
            if *used {
                count = 0;
                continue;
            }
            if count==0 {
                start = b;
            }
            count += 1;
            if count > best.1 {
                best = (start,count);
            }
        }
        best
    }
    fn entry_index(&self,dir: &Directory,key: u64) -> Result<usize,DYNERR> {
        match dir.entries.iter().position(|e| e.begin_block as u64==key) {
            Some(i) => Ok(i),
            None => Err(Box::new(Error::NoFile))
        }
    }
    fn sort_and_save(&mut self,mut dir: Directory) -> STDRESULT {
        dir.entries.sort_by_key(|e| e.begin_block);
        dir.header.num_files = dir.entries.len() as u16;
        self.write_directory(&dir)
    }
    fn type_code(info: &FileInfo) -> Result<u16,DYNERR> {
        match (pascal_type(info.file_type),info.file_type) {
            (Some(c),_) => Ok(c),
            (None,0) if info.aux_type >= 1 && info.aux_type <= 8 => Ok(info.aux_type as u16),
            (None,0) => Ok(0x05),
            _ => Err(Box::new(Error::BadMode))
        }
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
        FS_NAME
    }
    fn volume_name(&self) -> String {
        self.vol_name.clone()
    }
    fn volume_id(&self) -> String {
        format!("{} {}:",FS_NAME,self.vol_name)
    }
    fn free_space(&self) -> Result<FreeSpace,DYNERR> {
        let dir = self.read_directory()?;
        let free = self.claimed(&dir,None).iter().filter(|used| !**used).count();
        Ok(FreeSpace { total: self.total_blocks, free, unit_size: BLOCK_SIZE })
    }
    fn fs_num_blocks(&self) -> usize {
        self.total_blocks
    }
    fn scan_usage(&mut self) -> Result<VolumeUsage,DYNERR> {
        let mut usage = VolumeUsage::new(self.total_blocks,BLOCK_SIZE);
        usage.mark(0,UsageTag::System);
        usage.mark(1,UsageTag::System);
        for b in VOL_HEADER_BLOCK..self.dir_end {
            usage.mark(b,UsageTag::Directory);
        }
        let dir = self.read_directory()?;
        for entry in &dir.entries {
            for b in entry.begin_block as usize..usize::min(entry.end_block as usize,self.total_blocks) {
                if !usage.mark(b,UsageTag::FileData) {
                    self.core.note(&format!("{}: block {} is claimed twice",entry.name(),b),true);
                }
            }
        }
        Ok(usage)
    }
    fn rescan(&mut self) -> STDRESULT {
        self.read_header()?;
        self.core.files = Vec::new();
        let dir = self.read_directory()?;
        if dir.header.num_files as usize > dir.capacity {
            self.core.fully_enumerated = false;
            self.core.note(&format!("directory claims {} files",dir.header.num_files),true);
        }
        let mut prev_end = self.dir_end;
        for entry in &dir.entries {
            let name = entry.name();
            let mut file = A2File::new(&name,FileKind::File,entry.begin_block as u64);
            file.file_type = prodos_type(entry.file_type);
            file.aux_type = entry.file_type as u32;
            file.access = 0xc3;
            file.modified = unpack_date(entry.mod_date);
            file.data_len = entry.eof();
            file.data_sparse_len = file.data_len;
            let (beg,end) = (entry.begin_block as usize,entry.end_block as usize);
            if beg < self.dir_end || end < beg || end > self.total_blocks {
                self.core.note(&format!("{}: blocks {} to {} out of range",name,beg,end),true);
                file.quality = Quality::Damaged;
            } else if beg < prev_end {
                self.core.note(&format!("{}: overlaps the previous file",name),true);
                file.quality = Quality::Damaged;
            } else if entry.last_byte as usize > BLOCK_SIZE {
                debug!("{}: last byte count {}",name,entry.last_byte);
                file.quality = Quality::Suspicious;
            }
            prev_end = usize::max(prev_end,end);
            self.core.add_file(file);
        }
        debug!("found {} entries on {}:",self.core.files.len(),self.vol_name);
        Ok(())
    }
    fn fork_map(&self,idx: usize,rsrc: bool) -> Result<ForkMap,DYNERR> {
        if rsrc {
            return Err(Box::new(super::Error::ForkNotPresent));
        }
        let dir = self.read_directory()?;
        let entry = &dir.entries[self.entry_index(&dir,self.core.files[idx].key)?];
        let end = usize::min(entry.end_block as usize,self.total_blocks);
        Ok(ForkMap {
            units: (entry.begin_block as usize..end).map(|b| Some(Block::PO(b))).collect(),
            skip: 0,
            eof: entry.eof()
        })
    }
    fn do_create_file(&mut self,path: &str,kind: FileKind,info: &FileInfo) -> STDRESULT {
        if kind != FileKind::File || info.rsrc {
            return Err(Box::new(super::Error::Unsupported));
        }
        if !is_name_valid(path,false) {
            error!("invalid Pascal name {}",path);
            return Err(Box::new(super::Error::InvalidName));
        }
        let code = Self::type_code(info)?;
        let mut dir = self.read_directory()?;
        if dir.entries.len() >= dir.capacity {
            error!("directory is full");
            return Err(Box::new(super::Error::DirectoryFull));
        }
        let (start,len) = self.largest_gap(&dir,None);
        if len==0 {
            return Err(Box::new(super::Error::DiskFull));
        }
        let mut entry = DirectoryEntry::new(path);
        entry.begin_block = start as u16;
        entry.end_block = (start + 1) as u16;
        entry.file_type = code;
        entry.mod_date = pack_date(info.modified);
        self.core.img.write_block(start,&[0;BLOCK_SIZE])?;
        dir.entries.push(entry);
        self.sort_and_save(dir)?;
        info!("created {} at block {}",path,start);
        Ok(())
    }
    fn do_delete_file(&mut self,idx: usize) -> STDRESULT {
        let mut dir = self.read_directory()?;
        let i = self.entry_index(&dir,self.core.files[idx].key)?;
        let entry = dir.entries.remove(i);
        self.sort_and_save(dir)?;
        info!("deleted {}, freed {} blocks",entry.name(),entry.blocks());
        Ok(())
    }
    fn do_rename_file(&mut self,idx: usize,name: &str) -> STDRESULT {
        if !is_name_valid(name,false) {
            return Err(Box::new(super::Error::InvalidName));
        }
        let mut dir = self.read_directory()?;
        let i = self.entry_index(&dir,self.core.files[idx].key)?;
        if dir.entries.iter().enumerate().any(|(j,e)| j!=i && super::name_eq(&e.name(),name)) {
            return Err(Box::new(super::Error::Duplicate));
        }
        dir.entries[i].rename(name);
        self.sort_and_save(dir)
    }
    fn do_set_file_info(&mut self,idx: usize,info: &FileInfo) -> STDRESULT {
        let code = Self::type_code(info)?;
        let mut dir = self.read_directory()?;
        let i = self.entry_index(&dir,self.core.files[idx].key)?;
        dir.entries[i].file_type = code;
        dir.entries[i].mod_date = pack_date(info.modified);
        self.sort_and_save(dir)
    }
    fn do_format(&mut self,vol_name: &str) -> STDRESULT {
        if !is_name_valid(vol_name,true) {
            error!("invalid Pascal volume name");
            return Err(Box::new(super::Error::InvalidName));
        }
        let total = usize::min(self.core.img.num_blocks(),u16::MAX as usize);
        if total <= DIR_END_BLOCK {
            return Err(Box::new(Error::NoRoom));
        }
        trace!("formatting: zero all");
        for b in 0..total {
            self.core.img.write_block(b,&[0;BLOCK_SIZE])?;
        }
        self.total_blocks = total;
        self.dir_end = DIR_END_BLOCK;
        self.vol_name = vol_name.to_uppercase();
        let buf = read_dir_blocks(&self.core.img,DIR_END_BLOCK)?;
        let mut dir = Directory::from_bytes(&buf)?;
        dir.header = VolDirHeader::new(vol_name,total);
        self.write_directory(&dir)?;
        self.core.good = true;
        self.core.fully_enumerated = true;
        self.core.notes = Vec::new();
        info!("formatted {}: with {} blocks",self.vol_name,total);
        Ok(())
    }
    fn store_fork(&mut self,idx: usize,rsrc: bool,dat: &[u8]) -> STDRESULT {
        if rsrc {
            return Err(Box::new(super::Error::ForkNotPresent));
        }
        let mut dir = self.read_directory()?;
        let i = self.entry_index(&dir,self.core.files[idx].key)?;
        let n = usize::max(1,(dat.len() + BLOCK_SIZE - 1)/BLOCK_SIZE);
        let begin = dir.entries[i].begin_block as usize;
        // room to grow in place runs to the next file or the end of the volume
        let limit = dir.entries.iter()
            .map(|e| e.begin_block as usize)
            .filter(|b| *b > begin)
            .min()
            .unwrap_or(self.total_blocks);
        let start = match begin + n <= limit {
            true => begin,
            false => {
                let (gap_start,gap_len) = self.largest_gap(&dir,Some(i));
                if gap_len < n {
                    let free = self.claimed(&dir,Some(i)).iter().filter(|used| !**used).count();
                    error!("{} blocks needed, largest gap is {}",n,gap_len);
                    return match free >= n {
                        true => Err(Box::new(Error::NoRoom)),
                        false => Err(Box::new(super::Error::DiskFull))
                    };
                }
                debug!("moving file from block {} to {}",begin,gap_start);
                gap_start
            }
        };
        for j in 0..n {
            let end = usize::min(dat.len(),(j+1)*BLOCK_SIZE);
            let chunk: &[u8] = match j*BLOCK_SIZE < end {
                true => &dat[j*BLOCK_SIZE..end],
                false => &[]
            };
            self.core.img.write_block(start+j,chunk)?;
        }
        let entry = &mut dir.entries[i];
        entry.begin_block = start as u16;
        entry.end_block = (start + n) as u16;
        entry.last_byte = (dat.len() - (n-1)*BLOCK_SIZE) as u16;
        if dat.len()==0 {
            entry.last_byte = 0;
        }
        entry.mod_date = pack_date(None);
        self.sort_and_save(dir)?;
        debug!("stored {} bytes in {} blocks",dat.len(),n);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::img::{CreateParams,WrapperKind,SectorOrder};

    fn blank() -> Box<dyn DiskFS> {
        let img = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::ProDos)).unwrap();
        Disk::format_img(img,"blank").unwrap()
    }

    fn data(len: usize,seed: usize) -> Vec<u8> {
        (0..len).map(|i| ((i + seed) % 253) as u8).collect()
    }

    #[test]
    fn format_and_test() {
        let fs = blank();
        assert!(Disk::test(fs.img(),Leniency::Strict));
        assert_eq!(fs.volume_id(),"Pascal BLANK:");
        let free = fs.free_space().unwrap();
        assert_eq!(free.total,280);
        assert_eq!(free.free,274);
    }

    #[test]
    fn write_read_delete() {
        let mut fs = blank();
        for (i,name) in ["ONE","TWO","THREE"].iter().enumerate() {
            fs.create_file(name,FileKind::File,&FileInfo { file_type: 0x06, ..Default::default() }).unwrap();
            fs.write_file(name,false,&data(1000 + i*600,i)).unwrap();
        }
        // 2 + 4 + 5 blocks
        assert_eq!(fs.free_space().unwrap().free,274 - 11);
        assert_eq!(fs.read_file("TWO",false).unwrap(),data(1600,1));
        let idx = fs.find("THREE").unwrap();
        assert_eq!(fs.files()[idx].data_len,2200);
        assert_eq!(fs.files()[idx].aux_type,5);
        fs.delete_file("ONE").unwrap();
        // later entries shift down
        let dir = Directory::from_bytes(&read_dir_blocks(fs.img(),DIR_END_BLOCK).unwrap()).unwrap();
        assert_eq!(dir.header.num_files,2);
        assert_eq!(dir.entries[0].name(),"TWO");
        assert_eq!(fs.read_file("THREE",false).unwrap(),data(2200,2));
        assert_eq!(fs.free_space().unwrap().free,274 - 9);
    }

    #[test]
    fn file_moves_when_it_grows() {
        let mut fs = blank();
        fs.create_file("FIRST",FileKind::File,&FileInfo::default()).unwrap();
        fs.write_file("FIRST",false,&data(512,0)).unwrap();
        fs.create_file("SECOND",FileKind::File,&FileInfo::default()).unwrap();
        fs.write_file("SECOND",false,&data(512,1)).unwrap();
        // FIRST is boxed in by SECOND
        fs.write_file("FIRST",false,&data(5000,2)).unwrap();
        assert_eq!(fs.read_file("FIRST",false).unwrap(),data(5000,2));
        assert_eq!(fs.read_file("SECOND",false).unwrap(),data(512,1));
        let dir = Directory::from_bytes(&read_dir_blocks(fs.img(),DIR_END_BLOCK).unwrap()).unwrap();
        assert_eq!(dir.entries[0].name(),"SECOND");
        assert_eq!(dir.entries[1].name(),"FIRST");
        assert_eq!(fs.free_space().unwrap().free,274 - 11);
    }

    #[test]
    fn too_big() {
        let mut fs = blank();
        fs.create_file("BIG",FileKind::File,&FileInfo::default()).unwrap();
        let err = fs.write_file("BIG",false,&vec![0;275*512]).unwrap_err();
        assert!(matches!(err.downcast_ref::<super::super::Error>(),Some(super::super::Error::DiskFull)));
        assert!(fs.create_file("A:B",FileKind::File,&FileInfo::default()).is_err());
    }
}
