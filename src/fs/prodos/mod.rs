//! ## ProDOS file system module
//!
//! This manipulates disk images containing one ProDOS volume.
//!
//! * Volume directory at block 2, subdirectories to any depth
//! * Seedling, sapling, tree, and sparse files
//! * Extended files with data and resource forks
//! * Pascal areas are listed as disk images
//!
//! The volume bitmap is read at the start of each mutating operation and written back
//! at its end, it is never kept between calls.

pub mod types;
mod directory;

use std::collections::HashSet;
use log::{trace,debug,info,warn,error};
use types::*;
use directory::*;
use super::{Block,DiskFS,FsCore,A2File,FileKind,FileInfo,ForkMap,FreeSpace,Leniency,MountMode,MountOptions,Quality};
use super::usage::{VolumeUsage,UsageTag};
use crate::img::DiskImg;
use crate::{DYNERR,STDRESULT};

pub const FS_NAME: &str = "ProDOS";

/// Data blocks of a fork, plus the index blocks that locate them
struct ForkBlocks {
    data: Vec<Option<usize>>,
    index: Vec<usize>,
    bad: bool
}

impl ForkBlocks {
    fn allocated(&self) -> Vec<usize> {
        let mut ans = self.index.clone();
        ans.extend(self.data.iter().flatten());
        ans
    }
}

/// put a u16 into an index block in the prescribed fashion
fn pack_index_ptr(buf: &mut [u8],ptr: usize,idx: usize) {
    let bytes = u16::to_le_bytes(ptr as u16);
    buf[idx] = bytes[0];
    buf[idx+256] = bytes[1];
}

fn index_ptr(buf: &[u8],idx: usize) -> usize {
    u16::from_le_bytes([buf[idx],buf[idx+256]]) as usize
}

/// key locating an entry, block in the high bits and slot in the low 4
fn entry_key(block: usize,slot: usize) -> u64 {
    ((block as u64) << 4) | slot as u64
}

fn entry_loc(key: u64) -> (usize,usize) {
    ((key >> 4) as usize,(key & 0x0f) as usize)
}

fn blocks_needed(len: usize) -> usize {
    let n = usize::max(1,(len + BLOCK_SIZE - 1)/BLOCK_SIZE);
    match n {
        1 => 1,
        n if n <= 256 => n + 1,
        n => n + 1 + (n + 255)/256
    }
}

fn is_free(bitmap: &[u8],block: usize) -> bool {
    bitmap[block/8] & (0x80 >> (block%8)) != 0
}

fn set_free(bitmap: &mut [u8],block: usize,free: bool) {
    match free {
        true => bitmap[block/8] |= 0x80 >> (block%8),
        false => bitmap[block/8] &= !(0x80 >> (block%8))
    }
}

/// The primary interface for disk operations.
pub struct Disk {
    core: FsCore,
    total_blocks: usize,
    bitmap_ptr: usize,
    vol_name: String
}

impl Disk {
    /// Test an image for the ProDOS file system.
    pub fn test(img: &DiskImg,leniency: Leniency) -> bool {
        let buf = match img.read_block(VOL_KEY_BLOCK) {
            Ok(b) => b,
            Err(_) => {
                debug!("ProDOS volume directory was not readable");
                return false;
            }
        };
        let hdr = match Header::from_block(&buf) {
            Ok(h) => h,
            Err(_) => return false
        };
        let (prev,next) = links(&buf);
        if prev!=0 || hdr.storage_type()!=Some(StorageType::VolDirHeader) {
            debug!("not a volume directory header");
            return false;
        }
        let epb_ok = match leniency {
            Leniency::Strict => hdr.entries_per_block==0x0d,
            _ => hdr.entries_per_block==0x0d || hdr.entries_per_block==0x0c
        };
        if hdr.entry_len as usize!=ENTRY_LEN || !epb_ok {
            debug!("unexpected header bytes {}, {}",hdr.entry_len,hdr.entries_per_block);
            return false;
        }
        let name_len = (hdr.stor_len_nibs & 0x0f) as usize;
        let name_ok = match leniency {
            Leniency::Lenient => name_len > 0 && hdr.name[0..name_len].iter().all(|c| *c > 0x20 && *c < 0x7f),
            _ => is_name_valid(&hdr.name())
        };
        if !name_ok {
            debug!("volume name unexpected character");
            return false;
        }
        let total = hdr.total_blocks();
        let size_ok = match leniency {
            Leniency::Lenient => total > VOL_KEY_BLOCK,
            _ => total > VOL_KEY_BLOCK + VOL_DIR_BLOCKS && total <= img.num_blocks()
        };
        if !size_ok {
            debug!("peculiar block count {} on {} block image",total,img.num_blocks());
            return false;
        }
        let bitmap_ptr = hdr.ptr as usize;
        if bitmap_ptr <= VOL_KEY_BLOCK || bitmap_ptr >= total {
            debug!("bitmap pointer {} out of range",bitmap_ptr);
            return false;
        }
        if leniency == Leniency::Strict {
            let mut visited = HashSet::from([VOL_KEY_BLOCK]);
            let (mut curr,mut next) = (VOL_KEY_BLOCK,next);
            while next != 0 {
                if next >= total || !visited.insert(next) || visited.len() > MAX_DIR_BLOCKS {
                    debug!("volume directory link to {} is bad",next);
                    return false;
                }
                let buf = match img.read_block(next) {
                    Ok(b) => b,
                    Err(_) => return false
                };
                let (p,n) = links(&buf);
                if p != curr {
                    debug!("volume directory block {} has back link {}",next,p);
                    return false;
                }
                curr = next;
                next = n;
            }
        }
        true
    }
    /// Mount the volume, the `DiskFS` takes ownership of the image.
    pub fn mount(img: DiskImg,opts: &MountOptions) -> Result<Box<dyn DiskFS>,DYNERR> {
        let mut fs = Self {
            core: FsCore::new(img,opts.mode),
            total_blocks: 0,
            bitmap_ptr: 0,
            vol_name: String::new()
        };
        fs.read_header()?;
        super::finish_mount(fs)
    }
    /// Create a new empty volume on the image.
    pub fn format_img(img: DiskImg,vol_name: &str) -> Result<Box<dyn DiskFS>,DYNERR> {
        let mut fs = Self {
            core: FsCore::new(img,MountMode::Full),
            total_blocks: 0,
            bitmap_ptr: 0,
            vol_name: String::new()
        };
        fs.format(vol_name)?;
        Ok(Box::new(fs))
    }
    fn read_header(&mut self) -> STDRESULT {
        let buf = self.core.img.read_block(VOL_KEY_BLOCK)?;
        let hdr = Header::from_block(&buf)?;
        self.total_blocks = usize::min(hdr.total_blocks(),self.core.img.num_blocks());
        if hdr.total_blocks() > self.total_blocks {
            self.core.note(&format!("volume claims {} blocks but image has {}",hdr.total_blocks(),self.total_blocks),true);
        }
        self.bitmap_ptr = hdr.ptr as usize;
        self.vol_name = hdr.name();
        Ok(())
    }
    fn bitmap_blocks(&self) -> usize {
        (self.total_blocks + 4095)/4096
    }
    fn read_bitmap(&self) -> Result<Vec<u8>,DYNERR> {
        let mut ans = Vec::new();
        for b in self.bitmap_ptr..self.bitmap_ptr+self.bitmap_blocks() {
            ans.append(&mut self.core.img.read_block(b)?);
        }
        Ok(ans)
    }
    fn write_bitmap(&mut self,bitmap: &[u8]) -> STDRESULT {
        for i in 0..self.bitmap_blocks() {
            self.core.img.write_block(self.bitmap_ptr+i,&bitmap[i*BLOCK_SIZE..(i+1)*BLOCK_SIZE])?;
        }
        Ok(())
    }
    fn num_free(&self,bitmap: &[u8]) -> usize {
        (0..self.total_blocks).filter(|b| is_free(bitmap,*b)).count()
    }
    fn allocate(&self,bitmap: &mut [u8]) -> Result<usize,DYNERR> {
        for b in 0..self.total_blocks {
            if is_free(bitmap,b) {
                set_free(bitmap,b,false);
                trace!("allocate block {}",b);
                return Ok(b);
            }
        }
        error!("no free blocks");
        Err(Box::new(super::Error::DiskFull))
    }
    fn read_entry(&self,key: u64) -> Result<Entry,DYNERR> {
        let (block,slot) = entry_loc(key);
        let buf = self.core.img.read_block(block)?;
        Entry::from_block(&buf,slot)
    }
    fn write_entry(&mut self,key: u64,entry: &Entry) -> STDRESULT {
        let (block,slot) = entry_loc(key);
        let mut buf = self.core.img.read_block(block)?;
        entry.to_block(&mut buf,slot)?;
        self.core.img.write_block(block,&buf)
    }
    fn valid_ptr(&self,ptr: usize) -> bool {
        ptr > VOL_KEY_BLOCK && ptr < self.total_blocks
    }
    /// Gather the blocks of a fork.  Bad pointers become holes and set `bad`.
    fn fork_blocks(&self,stype: StorageType,key: usize,eof: usize) -> Result<ForkBlocks,DYNERR> {
        let mut ans = ForkBlocks { data: Vec::new(), index: Vec::new(), bad: false };
        if !self.valid_ptr(key) {
            ans.bad = true;
            return Ok(ans);
        }
        let needed = (eof + BLOCK_SIZE - 1)/BLOCK_SIZE;
        match stype {
            StorageType::Seedling => {
                ans.data.push(Some(key));
                if needed > 1 {
                    ans.bad = true;
                }
            },
            StorageType::Sapling => {
                ans.index.push(key);
                let buf = self.core.img.read_block(key)?;
                for i in 0..256 {
                    ans.data.push(match index_ptr(&buf,i) {
                        0 => None,
                        p if self.valid_ptr(p) => Some(p),
                        _ => { ans.bad = true; None }
                    });
                }
                if needed > 256 {
                    ans.bad = true;
                }
            },
            StorageType::Tree => {
                ans.index.push(key);
                let master = self.core.img.read_block(key)?;
                let last = (0..128).rev().find(|j| index_ptr(&master,*j)!=0).map_or(0,|j| j+1);
                for j in 0..usize::max(last,(needed+255)/256) {
                    let ptr = if j < 128 { index_ptr(&master,j) } else { 0 };
                    if ptr==0 {
                        ans.data.extend(std::iter::repeat(None).take(256));
                        continue;
                    }
                    if !self.valid_ptr(ptr) {
                        ans.bad = true;
                        ans.data.extend(std::iter::repeat(None).take(256));
                        continue;
                    }
                    ans.index.push(ptr);
                    let buf = self.core.img.read_block(ptr)?;
                    for i in 0..256 {
                        ans.data.push(match index_ptr(&buf,i) {
                            0 => None,
                            p if self.valid_ptr(p) => Some(p),
                            _ => { ans.bad = true; None }
                        });
                    }
                }
                if needed > 128*256 {
                    ans.bad = true;
                }
            },
            _ => ans.bad = true
        }
        Ok(ans)
    }
    /// Storage type, key block, and eof of a fork, looking inside extended files
    fn fork_spec(&self,entry: &Entry,rsrc: bool) -> Result<(StorageType,usize,usize),DYNERR> {
        match entry.storage_type() {
            Some(StorageType::Extended) => {
                let key = entry.key_ptr as usize;
                if !self.valid_ptr(key) {
                    return Err(Box::new(Error::IOError));
                }
                let buf = self.core.img.read_block(key)?;
                let mini = MiniEntry::from_key_block(&buf,rsrc)?;
                match mini.storage_type() {
                    Some(s) => Ok((s,mini.key_block as usize,mini.eof())),
                    None => Err(Box::new(Error::IOError))
                }
            },
            Some(s) if !rsrc => Ok((s,entry.key_ptr as usize,entry.eof())),
            _ => Err(Box::new(super::Error::ForkNotPresent))
        }
    }
    /// Blocks in a directory chain starting at its key block, bounded and cycle checked
    fn dir_chain(&self,key_block: usize) -> Result<(Vec<usize>,bool),DYNERR> {
        let mut ans = Vec::new();
        let mut visited = HashSet::new();
        let mut curr = key_block;
        let mut prev = 0;
        loop {
            if !self.valid_ptr(curr) || !visited.insert(curr) || ans.len() >= MAX_DIR_BLOCKS {
                return Ok((ans,false));
            }
            let buf = self.core.img.read_block(curr)?;
            let (p,n) = links(&buf);
            if p != prev {
                return Ok((ans,false));
            }
            ans.push(curr);
            if n==0 {
                return Ok((ans,true));
            }
            prev = curr;
            curr = n;
        }
    }
    fn file_from_entry(&mut self,entry: &Entry,key: u64,parent: usize) -> Result<A2File,DYNERR> {
        let name = entry.name();
        let stype = entry.storage_type();
        let kind = match stype {
            Some(StorageType::SubDirEntry) => FileKind::Directory,
            Some(StorageType::Pascal) => FileKind::DiskImage,
            _ => FileKind::File
        };
        let mut file = A2File::new(&name,kind,key);
        file.parent = Some(parent);
        file.file_type = entry.file_type as u32;
        file.aux_type = entry.aux_type as u32;
        file.access = entry.access;
        file.created = unpack_time(entry.create_time);
        file.modified = unpack_time(entry.last_mod);
        match stype {
            Some(StorageType::SubDirEntry) => {
                file.data_len = entry.eof();
                file.data_sparse_len = entry.blocks_used as usize * BLOCK_SIZE;
            },
            Some(StorageType::Pascal) => {
                file.data_len = entry.blocks_used as usize * BLOCK_SIZE;
                file.data_sparse_len = file.data_len;
            },
            Some(StorageType::Seedling) | Some(StorageType::Sapling) | Some(StorageType::Tree) | Some(StorageType::Extended) => {
                let mut used = match stype { Some(StorageType::Extended) => 1, _ => 0 };
                for rsrc in [false,true] {
                    let (s,k,eof) = match self.fork_spec(entry,rsrc) {
                        Ok(spec) => spec,
                        Err(e) => {
                            if e.downcast_ref::<super::Error>().is_none() {
                                self.core.note(&format!("{}: bad extended key block",name),true);
                                file.quality = Quality::Damaged;
                            }
                            continue;
                        }
                    };
                    let blocks = self.fork_blocks(s,k,eof)?;
                    if blocks.bad {
                        self.core.note(&format!("{}: block list does not match length {}",name,eof),true);
                        file.quality = Quality::Damaged;
                    }
                    used += blocks.allocated().len();
                    let present = blocks.data.iter().take((eof + BLOCK_SIZE - 1)/BLOCK_SIZE).flatten().count();
                    let sparse = usize::min(eof,present*BLOCK_SIZE);
                    match rsrc {
                        false => { file.data_len = eof; file.data_sparse_len = sparse; },
                        true => { file.rsrc_len = Some(eof); file.rsrc_sparse_len = sparse; }
                    }
                }
                if used != entry.blocks_used as usize && file.quality==Quality::Good {
                    warn!("{}: blocks used is {}, found {}",name,entry.blocks_used,used);
                    file.quality = Quality::Suspicious;
                }
            },
            _ => {
                self.core.note(&format!("{}: unknown storage type {:X}",name,entry.stor_len_nibs >> 4),true);
                file.quality = Quality::Damaged;
            }
        }
        Ok(file)
    }
    fn walk_dir(&mut self,key_block: usize,parent: usize,visited: &mut HashSet<usize>) -> STDRESULT {
        let (chain,complete) = self.dir_chain(key_block)?;
        if !complete {
            self.core.note(&format!("directory at block {} has a broken chain",key_block),true);
        }
        let mut subdirs: Vec<(usize,usize,usize)> = Vec::new();
        for block in chain {
            if !visited.insert(block) {
                self.core.note(&format!("directory block {} is linked twice",block),true);
                return Ok(());
            }
            if visited.len() > MAX_DIR_BLOCKS {
                self.core.fully_enumerated = false;
                self.core.note("too many directory blocks",true);
                return Ok(());
            }
            let buf = self.core.img.read_block(block)?;
            let first = match block==key_block { true => 1, false => 0 };
            for slot in first..ENTRIES_PER_BLOCK {
                let entry = Entry::from_block(&buf,slot)?;
                if !entry.is_active() {
                    continue;
                }
                let key = entry_key(block,slot);
                let file = self.file_from_entry(&entry,key,parent)?;
                let is_dir = file.kind==FileKind::Directory;
                let idx = self.core.add_file(file);
                if is_dir {
                    subdirs.push((entry.key_ptr as usize,idx,block));
                }
            }
        }
        for (sub_key,idx,entry_block) in subdirs {
            if !self.valid_ptr(sub_key) {
                self.core.note(&format!("{}: subdirectory pointer out of range",self.core.files[idx].path),true);
                continue;
            }
            let buf = self.core.img.read_block(sub_key)?;
            let hdr = Header::from_block(&buf)?;
            if hdr.storage_type()!=Some(StorageType::SubDirHeader) {
                self.core.note(&format!("{}: not a subdirectory header",self.core.files[idx].path),true);
                self.core.files[idx].quality = Quality::Damaged;
                continue;
            }
            if hdr.ptr as usize != entry_block {
                warn!("{}: parent pointer {} should be {}",self.core.files[idx].path,hdr.ptr,entry_block);
                self.core.files[idx].quality = Quality::Suspicious;
            }
            self.walk_dir(sub_key,idx,visited)?;
        }
        Ok(())
    }
    /// Key block of the directory holding `path`, where empty means the volume directory
    fn dir_key_block(&self,path: &str) -> Result<usize,DYNERR> {
        if path.len()==0 {
            return Ok(VOL_KEY_BLOCK);
        }
        match self.find(path) {
            Some(idx) if self.core.files[idx].kind==FileKind::Directory => {
                let entry = self.read_entry(self.core.files[idx].key)?;
                Ok(entry.key_ptr as usize)
            },
            _ => Err(Box::new(Error::PathNotFound))
        }
    }
    /// Find an inactive entry slot, growing a subdirectory if needed.
    /// Returns the slot's key.
    fn free_slot(&mut self,key_block: usize,bitmap: &mut [u8]) -> Result<u64,DYNERR> {
        let (chain,complete) = self.dir_chain(key_block)?;
        if !complete {
            return Err(Box::new(super::Error::Damaged));
        }
        for block in &chain {
            let buf = self.core.img.read_block(*block)?;
            let first = match *block==key_block { true => 1, false => 0 };
            for slot in first..ENTRIES_PER_BLOCK {
                if !Entry::from_block(&buf,slot)?.is_active() {
                    return Ok(entry_key(*block,slot));
                }
            }
        }
        if key_block==VOL_KEY_BLOCK {
            error!("volume directory is full");
            return Err(Box::new(super::Error::DirectoryFull));
        }
        // grow the subdirectory by one block
        let last = chain[chain.len()-1];
        let new_block = self.allocate(bitmap)?;
        let mut buf = vec![0;BLOCK_SIZE];
        set_links(&mut buf,last,0);
        self.core.img.write_block(new_block,&buf)?;
        let mut last_buf = self.core.img.read_block(last)?;
        let (p,_) = links(&last_buf);
        set_links(&mut last_buf,p,new_block);
        self.core.img.write_block(last,&last_buf)?;
        // the directory's own entry tracks its size
        let hdr = Header::from_block(&self.core.img.read_block(key_block)?)?;
        let parent_key = entry_key(hdr.ptr as usize,(hdr.tail[0] as usize).saturating_sub(1));
        let mut parent_entry = self.read_entry(parent_key)?;
        parent_entry.blocks_used += 1;
        parent_entry.eof = eof_to(parent_entry.eof() + BLOCK_SIZE);
        self.write_entry(parent_key,&parent_entry)?;
        debug!("directory at {} grown to {} blocks",key_block,chain.len()+1);
        Ok(entry_key(new_block,0))
    }
    fn adjust_file_count(&mut self,key_block: usize,delta: i32) -> STDRESULT {
        let mut buf = self.core.img.read_block(key_block)?;
        let mut hdr = Header::from_block(&buf)?;
        hdr.file_count = (hdr.file_count as i32 + delta).max(0) as u16;
        hdr.to_block(&mut buf)?;
        self.core.img.write_block(key_block,&buf)
    }
    /// Write data as a new fork, returns the storage type, key block, and blocks used
    fn write_fork(&mut self,bitmap: &mut [u8],dat: &[u8]) -> Result<(StorageType,usize,usize),DYNERR> {
        let n = usize::max(1,(dat.len() + BLOCK_SIZE - 1)/BLOCK_SIZE);
        if n > 128*256 {
            return Err(Box::new(Error::Range));
        }
        let chunk = |i: usize| -> Vec<u8> {
            let end = usize::min(dat.len(),(i+1)*BLOCK_SIZE);
            match i*BLOCK_SIZE < end {
                true => dat[i*BLOCK_SIZE..end].to_vec(),
                false => Vec::new()
            }
        };
        if n==1 {
            let b = self.allocate(bitmap)?;
            self.core.img.write_block(b,&chunk(0))?;
            return Ok((StorageType::Seedling,b,1));
        }
        let mut index_blocks = Vec::new();
        let mut count = 0;
        for j in 0..(n+255)/256 {
            let ib = self.allocate(bitmap)?;
            let mut ibuf = vec![0;BLOCK_SIZE];
            for i in 0..usize::min(256,n-j*256) {
                let b = self.allocate(bitmap)?;
                self.core.img.write_block(b,&chunk(j*256+i))?;
                pack_index_ptr(&mut ibuf,b,i);
                count += 1;
            }
            self.core.img.write_block(ib,&ibuf)?;
            index_blocks.push(ib);
        }
        if index_blocks.len()==1 {
            return Ok((StorageType::Sapling,index_blocks[0],count+1));
        }
        let master = self.allocate(bitmap)?;
        let mut mbuf = vec![0;BLOCK_SIZE];
        for (j,ib) in index_blocks.iter().enumerate() {
            pack_index_ptr(&mut mbuf,*ib,j);
        }
        self.core.img.write_block(master,&mbuf)?;
        Ok((StorageType::Tree,master,count + index_blocks.len() + 1))
    }
    fn free_blocks(&self,bitmap: &mut [u8],blocks: &[usize]) {
        for b in blocks {
            if *b < self.total_blocks {
                set_free(bitmap,*b,true);
            }
        }
    }
    /// All blocks belonging to a file entry, key blocks included
    fn entry_blocks(&self,entry: &Entry) -> Result<Vec<usize>,DYNERR> {
        match entry.storage_type() {
            Some(StorageType::SubDirEntry) => Ok(self.dir_chain(entry.key_ptr as usize)?.0),
            Some(StorageType::Pascal) => {
                let start = entry.key_ptr as usize;
                Ok((start..start+entry.blocks_used as usize).collect())
            },
            Some(StorageType::Extended) => {
                let mut ans = vec![entry.key_ptr as usize];
                for rsrc in [false,true] {
                    let (s,k,eof) = self.fork_spec(entry,rsrc)?;
                    ans.append(&mut self.fork_blocks(s,k,eof)?.allocated());
                }
                Ok(ans)
            },
            Some(s) => {
                Ok(self.fork_blocks(s,entry.key_ptr as usize,entry.eof())?.allocated())
            },
            None => Ok(Vec::new())
        }
    }
    fn sibling_has_name(&self,idx: Option<usize>,parent: Option<usize>,name: &str) -> bool {
        self.core.files.iter().enumerate().any(|(i,f)| Some(i)!=idx && f.parent==parent && super::name_eq(&f.name,name))
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
        format!("{} /{}",FS_NAME,self.vol_name)
    }
    fn free_space(&self) -> Result<FreeSpace,DYNERR> {
        let bitmap = self.read_bitmap()?;
        Ok(FreeSpace { total: self.total_blocks, free: self.num_free(&bitmap), unit_size: BLOCK_SIZE })
    }
    fn fs_num_blocks(&self) -> usize {
        self.total_blocks
    }
    fn scan_usage(&mut self) -> Result<VolumeUsage,DYNERR> {
        let mut usage = VolumeUsage::new(self.total_blocks,BLOCK_SIZE);
        usage.mark(0,UsageTag::System);
        usage.mark(1,UsageTag::System);
        for b in self.dir_chain(VOL_KEY_BLOCK)?.0 {
            usage.mark(b,UsageTag::Directory);
        }
        for b in self.bitmap_ptr..self.bitmap_ptr+self.bitmap_blocks() {
            usage.mark(b,UsageTag::System);
        }
        let keys: Vec<(u64,FileKind,String)> = self.core.files.iter()
            .filter(|f| f.kind!=FileKind::VolumeDir)
            .map(|f| (f.key,f.kind,f.path.clone())).collect();
        for (key,kind,path) in keys {
            let entry = self.read_entry(key)?;
            let tag = match kind {
                FileKind::Directory => UsageTag::Directory,
                _ => UsageTag::FileData
            };
            let blocks = match self.entry_blocks(&entry) {
                Ok(b) => b,
                Err(_) => continue
            };
            for b in blocks {
                if !usage.mark(b,tag) {
                    self.core.note(&format!("{}: block {} is claimed twice",path,b),true);
                }
            }
        }
        let bitmap = self.read_bitmap()?;
        let mut used_but_free = 0;
        for b in 0..self.total_blocks {
            match (usage.get(b),is_free(&bitmap,b)) {
                (Some(UsageTag::Free),false) => usage.mark_if_free(b,UsageTag::System),
                (Some(_),true) => used_but_free += 1,
                _ => {}
            }
        }
        if used_but_free > 0 {
            self.core.note(&format!("{} blocks in use are marked free",used_but_free),true);
        }
        Ok(usage)
    }
    fn rescan(&mut self) -> STDRESULT {
        self.read_header()?;
        self.core.files = Vec::new();
        let mut root = A2File::new(&self.vol_name,FileKind::VolumeDir,entry_key(VOL_KEY_BLOCK,0));
        root.path = String::new();
        root.file_type = 0x0f;
        let root_idx = self.core.add_file(root);
        let mut visited = HashSet::new();
        self.walk_dir(VOL_KEY_BLOCK,root_idx,&mut visited)?;
        debug!("found {} entries on /{}",self.core.files.len()-1,self.vol_name);
        Ok(())
    }
    fn fork_map(&self,idx: usize,rsrc: bool) -> Result<ForkMap,DYNERR> {
        let entry = self.read_entry(self.core.files[idx].key)?;
        if entry.storage_type()==Some(StorageType::Pascal) {
            let start = entry.key_ptr as usize;
            let count = entry.blocks_used as usize;
            return Ok(ForkMap {
                units: (start..start+count).map(|b| Some(Block::PO(b))).collect(),
                skip: 0,
                eof: count*BLOCK_SIZE
            });
        }
        let (s,k,eof) = self.fork_spec(&entry,rsrc)?;
        let blocks = self.fork_blocks(s,k,eof)?;
        let n = (eof + BLOCK_SIZE - 1)/BLOCK_SIZE;
        let mut units: Vec<Option<Block>> = blocks.data.iter().take(n).map(|b| b.map(Block::PO)).collect();
        units.resize(n,None);
        Ok(ForkMap { units, skip: 0, eof })
    }
    fn do_create_file(&mut self,path: &str,kind: FileKind,info: &FileInfo) -> STDRESULT {
        let (parent_path,name) = super::split_path(path);
        if !is_name_valid(&name) {
            error!("invalid ProDOS name {}",name);
            return Err(Box::new(super::Error::InvalidName));
        }
        let dir_key = self.dir_key_block(&parent_path)?;
        let mut bitmap = self.read_bitmap()?;
        let needed = match (kind,info.rsrc) {
            (FileKind::File,true) => 3,
            (FileKind::File,false) | (FileKind::Directory,_) => 1,
            _ => return Err(Box::new(super::Error::Unsupported))
        };
        if self.num_free(&bitmap) < needed + 1 {
            return Err(Box::new(super::Error::DiskFull));
        }
        let slot_key = self.free_slot(dir_key,&mut bitmap)?;
        let key_block = self.allocate(&mut bitmap)?;
        let mut key_buf = vec![0;BLOCK_SIZE];
        let stype = match (kind,info.rsrc) {
            (FileKind::Directory,_) => StorageType::SubDirEntry,
            (_,true) => StorageType::Extended,
            _ => StorageType::Seedling
        };
        let mut entry = Entry::new(stype,&name);
        entry.key_ptr = key_block as u16;
        entry.blocks_used = 1;
        entry.file_type = info.file_type as u8;
        entry.aux_type = info.aux_type as u16;
        entry.access = info.access.unwrap_or(STD_ACCESS);
        entry.create_time = pack_time(info.created);
        entry.last_mod = pack_time(info.modified);
        entry.header_ptr = dir_key as u16;
        match stype {
            StorageType::SubDirEntry => {
                let (slot_block,slot) = entry_loc(slot_key);
                let mut hdr = Header::new(StorageType::SubDirHeader,&name);
                hdr.reserved[0] = SUBDIR_MAGIC;
                hdr.create_time = entry.create_time;
                hdr.ptr = slot_block as u16;
                hdr.tail = [slot as u8 + 1,ENTRY_LEN as u8];
                hdr.to_block(&mut key_buf)?;
                entry.file_type = 0x0f;
                entry.eof = eof_to(BLOCK_SIZE);
            },
            StorageType::Extended => {
                for rsrc in [false,true] {
                    let b = self.allocate(&mut bitmap)?;
                    self.core.img.write_block(b,&vec![0;BLOCK_SIZE])?;
                    let mini = MiniEntry { storage_type: StorageType::Seedling as u8, key_block: b as u16, blocks_used: 1, eof: [0;3] };
                    mini.to_key_block(&mut key_buf,rsrc)?;
                }
                entry.blocks_used = 3;
                entry.eof = eof_to(BLOCK_SIZE);
            },
            _ => {}
        }
        self.core.img.write_block(key_block,&key_buf)?;
        self.write_entry(slot_key,&entry)?;
        self.adjust_file_count(dir_key,1)?;
        self.write_bitmap(&bitmap)?;
        info!("created {}",path);
        Ok(())
    }
    fn do_delete_file(&mut self,idx: usize) -> STDRESULT {
        let key = self.core.files[idx].key;
        let mut entry = self.read_entry(key)?;
        if entry.access & Access::Destroy as u8 == 0 {
            return Err(Box::new(Error::FileLocked));
        }
        if self.core.files.iter().any(|f| f.parent==Some(idx)) {
            return Err(Box::new(super::Error::NotEmpty));
        }
        let blocks = self.entry_blocks(&entry)?;
        let mut bitmap = self.read_bitmap()?;
        self.free_blocks(&mut bitmap,&blocks);
        let dir_key = entry.header_ptr as usize;
        entry.stor_len_nibs = 0;
        self.write_entry(key,&entry)?;
        if self.valid_ptr(dir_key) {
            self.adjust_file_count(dir_key,-1)?;
        }
        self.write_bitmap(&bitmap)?;
        info!("deleted {}, freed {} blocks",self.core.files[idx].path,blocks.len());
        Ok(())
    }
    fn do_rename_file(&mut self,idx: usize,name: &str) -> STDRESULT {
        if !is_name_valid(name) {
            return Err(Box::new(super::Error::InvalidName));
        }
        if self.sibling_has_name(Some(idx),self.core.files[idx].parent,name) {
            return Err(Box::new(super::Error::Duplicate));
        }
        let key = self.core.files[idx].key;
        let mut entry = self.read_entry(key)?;
        if entry.access & Access::Rename as u8 == 0 {
            return Err(Box::new(Error::FileLocked));
        }
        entry.rename(name);
        self.write_entry(key,&entry)?;
        if entry.storage_type()==Some(StorageType::SubDirEntry) {
            let sub_key = entry.key_ptr as usize;
            let mut buf = self.core.img.read_block(sub_key)?;
            let mut hdr = Header::from_block(&buf)?;
            hdr.rename(name);
            hdr.to_block(&mut buf)?;
            self.core.img.write_block(sub_key,&buf)?;
        }
        Ok(())
    }
    fn do_set_file_info(&mut self,idx: usize,info: &FileInfo) -> STDRESULT {
        if info.file_type > 0xff || info.aux_type > 0xffff {
            return Err(Box::new(super::Error::Range));
        }
        let key = self.core.files[idx].key;
        let mut entry = self.read_entry(key)?;
        if entry.storage_type()!=Some(StorageType::SubDirEntry) {
            entry.file_type = info.file_type as u8;
        }
        entry.aux_type = info.aux_type as u16;
        if let Some(access) = info.access {
            entry.access = access;
        }
        if info.created.is_some() {
            entry.create_time = pack_time(info.created);
        }
        entry.last_mod = pack_time(info.modified);
        self.write_entry(key,&entry)
    }
    fn do_format(&mut self,vol_name: &str) -> STDRESULT {
        if !is_name_valid(vol_name) {
            return Err(Box::new(super::Error::InvalidName));
        }
        let total = usize::min(self.core.img.num_blocks(),MAX_BLOCKS);
        trace!("formatting: zero all");
        for b in 0..total {
            self.core.img.write_block(b,&vec![0;BLOCK_SIZE])?;
        }
        self.total_blocks = total;
        self.bitmap_ptr = VOL_KEY_BLOCK + VOL_DIR_BLOCKS;
        self.vol_name = vol_name.to_uppercase();
        trace!("formatting: volume directory");
        for b in VOL_KEY_BLOCK..VOL_KEY_BLOCK+VOL_DIR_BLOCKS {
            let mut buf = vec![0;BLOCK_SIZE];
            let prev = match b { VOL_KEY_BLOCK => 0, _ => b-1 };
            let next = match b+1 < VOL_KEY_BLOCK+VOL_DIR_BLOCKS { true => b+1, false => 0 };
            set_links(&mut buf,prev,next);
            if b==VOL_KEY_BLOCK {
                let mut hdr = Header::new(StorageType::VolDirHeader,vol_name);
                hdr.ptr = self.bitmap_ptr as u16;
                hdr.tail = u16::to_le_bytes(total as u16);
                hdr.to_block(&mut buf)?;
            }
            self.core.img.write_block(b,&buf)?;
        }
        trace!("formatting: bitmap");
        let mut bitmap = vec![0;self.bitmap_blocks()*BLOCK_SIZE];
        for b in self.bitmap_ptr+self.bitmap_blocks()..total {
            set_free(&mut bitmap,b,true);
        }
        self.write_bitmap(&bitmap)?;
        self.core.good = true;
        self.core.notes = Vec::new();
        info!("formatted /{} with {} blocks",self.vol_name,total);
        Ok(())
    }
    fn store_fork(&mut self,idx: usize,rsrc: bool,dat: &[u8]) -> STDRESULT {
        let key = self.core.files[idx].key;
        let mut entry = self.read_entry(key)?;
        if entry.access & Access::Write as u8 == 0 {
            return Err(Box::new(Error::FileLocked));
        }
        let (s,k,eof) = self.fork_spec(&entry,rsrc)?;
        let old = self.fork_blocks(s,k,eof)?.allocated();
        let mut bitmap = self.read_bitmap()?;
        // the old blocks stay allocated until the entry points at the new ones
        if self.num_free(&bitmap) < blocks_needed(dat.len()) {
            error!("{} bytes will not fit",dat.len());
            return Err(Box::new(super::Error::DiskFull));
        }
        let (stype,new_key,used) = self.write_fork(&mut bitmap,dat)?;
        if entry.storage_type()==Some(StorageType::Extended) {
            let ext_key = entry.key_ptr as usize;
            let mut buf = self.core.img.read_block(ext_key)?;
            let mini = MiniEntry { storage_type: stype as u8, key_block: new_key as u16, blocks_used: used as u16, eof: eof_to(dat.len()) };
            mini.to_key_block(&mut buf,rsrc)?;
            self.core.img.write_block(ext_key,&buf)?;
            let other = MiniEntry::from_key_block(&buf,!rsrc)?;
            entry.blocks_used = (1 + used + other.blocks_used as usize) as u16;
        } else {
            entry.set_storage_type(stype);
            entry.key_ptr = new_key as u16;
            entry.blocks_used = used as u16;
            entry.eof = eof_to(dat.len());
        }
        entry.last_mod = pack_time(None);
        self.write_entry(key,&entry)?;
        self.free_blocks(&mut bitmap,&old);
        self.write_bitmap(&bitmap)?;
        debug!("stored {} bytes in {} blocks",dat.len(),used);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::img::{CreateParams,WrapperKind,SectorOrder};

    fn blank(blocks: usize) -> Box<dyn DiskFS> {
        let img = match blocks {
            280 => DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::ProDos)).unwrap(),
            n => DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(n)).unwrap()
        };
        Disk::format_img(img,"TEST.DISK").unwrap()
    }

    #[test]
    fn format_and_test() {
        let fs = blank(280);
        assert!(Disk::test(fs.img(),Leniency::Strict));
        let free = fs.free_space().unwrap();
        assert_eq!(free.total,280);
        assert_eq!(free.free,280 - 7);
        assert_eq!(fs.volume_id(),"ProDOS /TEST.DISK");
    }

    #[test]
    fn sapling_and_tree() {
        let mut fs = blank(1600);
        let small: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        let large: Vec<u8> = (0..140000).map(|i| (i % 241) as u8).collect();
        fs.create_file("SMALL",FileKind::File,&FileInfo { file_type: 6, ..Default::default() }).unwrap();
        fs.create_file("LARGE",FileKind::File,&FileInfo { file_type: 6, ..Default::default() }).unwrap();
        fs.write_file("SMALL",false,&small).unwrap();
        fs.write_file("LARGE",false,&large).unwrap();
        assert_eq!(fs.read_file("SMALL",false).unwrap(),small);
        assert_eq!(fs.read_file("LARGE",false).unwrap(),large);
        let entry = Entry::from_block(&fs.img().read_block(2).unwrap(),2).unwrap();
        assert_eq!(entry.storage_type(),Some(StorageType::Tree));
        // 274 data blocks, 2 index blocks, 1 master
        assert_eq!(entry.blocks_used,277);
    }

    #[test]
    fn subdirectory_growth() {
        let mut fs = blank(280);
        fs.create_file("DIR",FileKind::Directory,&FileInfo::default()).unwrap();
        for i in 0..20 {
            fs.create_file(&format!("DIR/F{}",i),FileKind::File,&FileInfo::default()).unwrap();
        }
        let idx = fs.find("DIR/F19").unwrap();
        assert_eq!(fs.files()[fs.files()[idx].parent.unwrap()].name,"DIR");
        let dir = fs.find("DIR").unwrap();
        assert_eq!(fs.files()[dir].data_len,2*BLOCK_SIZE);
        assert!(fs.delete_file("DIR").is_err());
        for i in 0..20 {
            fs.delete_file(&format!("DIR/F{}",i)).unwrap();
        }
        fs.delete_file("DIR").unwrap();
        assert_eq!(fs.free_space().unwrap().free,280-7);
    }

    #[test]
    fn extended_forks() {
        let mut fs = blank(280);
        fs.create_file("FORKED",FileKind::File,&FileInfo { file_type: 0xb3, rsrc: true, ..Default::default() }).unwrap();
        fs.write_file("FORKED",true,&vec![0x5a;700]).unwrap();
        fs.write_file("FORKED",false,b"data fork").unwrap();
        let idx = fs.find("FORKED").unwrap();
        assert_eq!(fs.files()[idx].rsrc_len,Some(700));
        assert_eq!(fs.files()[idx].data_len,9);
        assert_eq!(fs.read_file("FORKED",true).unwrap(),vec![0x5a;700]);
        fs.create_file("PLAIN",FileKind::File,&FileInfo::default()).unwrap();
        assert!(fs.open_file("PLAIN",true,true).is_err());
    }

    #[test]
    fn full_disk_keeps_old_fork() {
        let mut fs = blank(280);
        let keep: Vec<u8> = (0..20*BLOCK_SIZE).map(|i| (i % 253) as u8).collect();
        fs.create_file("KEEP",FileKind::File,&FileInfo { file_type: 6, ..Default::default() }).unwrap();
        fs.write_file("KEEP",false,&keep).unwrap();
        fs.create_file("FILLER",FileKind::File,&FileInfo { file_type: 6, ..Default::default() }).unwrap();
        let n = fs.free_space().unwrap().free - 6;
        fs.write_file("FILLER",false,&vec![0x11;n*BLOCK_SIZE]).unwrap();
        let before = fs.free_space().unwrap().free;
        assert_eq!(before,6);
        let err = fs.write_file("KEEP",false,&vec![0x22;30*BLOCK_SIZE]).unwrap_err();
        assert!(matches!(err.downcast_ref::<super::super::Error>(),Some(super::super::Error::DiskFull)));
        assert_eq!(fs.read_file("KEEP",false).unwrap(),keep);
        assert_eq!(fs.free_space().unwrap().free,before);
        // a smaller fork goes into free blocks, then the old 21 are released
        fs.write_file("KEEP",false,&vec![0x33;1000]).unwrap();
        assert_eq!(fs.read_file("KEEP",false).unwrap(),vec![0x33;1000]);
        assert_eq!(fs.free_space().unwrap().free,before - 3 + 21);
        let usage = fs.scan_usage().unwrap();
        assert_eq!(usage.conflicts(),0);
        assert!(fs.is_good());
    }

    #[test]
    fn locked_file() {
        let mut fs = blank(280);
        fs.create_file("LOCKED",FileKind::File,&FileInfo { access: Some(Access::Read as u8), ..Default::default() }).unwrap();
        let err = fs.delete_file("LOCKED").unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some());
        assert_eq!(err.to_string(),"FILE LOCKED");
    }
}
