//! ### HFS engine
//!
//! Parses the master directory block and walks the leaf nodes of the catalog B-tree.
//! Forks are located from the three extents kept in the catalog record; the extents
//! overflow tree is not consulted.  All disk access goes through `BlockDevice`.

use binrw::{binrw,BinRead};
use std::io::Cursor;
use std::collections::HashSet;
use bit_vec::BitVec;
use log::{trace,debug};
use super::BlockDevice;
use crate::DYNERR;

pub const BLOCK_SIZE: usize = 512;
pub const MDB_BLOCK: usize = 2;
/// `BD`
pub const SIGNATURE: u16 = 0x4244;
pub const NODE_SIZE: usize = 512;
pub const MAX_VOL_NAME: usize = 27;
/// parent ID of the root folder
pub const ROOT_PARENT: u32 = 1;
pub const ROOT_CNID: u32 = 2;
const HEADER_NODE: u8 = 1;
const LEAF_NODE: u8 = 0xff;
const DIR_RECORD: u8 = 1;
const FILE_RECORD: u8 = 2;
const NODE_DESCRIPTOR_SIZE: usize = 14;

/// Enumerates HFS errors.  The `Display` trait will print equivalent long message.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("not an HFS volume")]
    BadSignature,
    #[error("volume geometry does not fit the disk")]
    BadGeometry,
    #[error("catalog node is damaged")]
    BadNode
}

#[binrw]
#[brw(big)]
#[derive(Clone,Copy,Debug,Default)]
pub struct ExtDescriptor {
    pub start: u16,
    pub count: u16
}

#[binrw]
#[brw(big)]
#[derive(Clone,Debug)]
pub struct MasterDirectoryBlock {
    pub sig: u16,
    pub created: u32,
    pub modified: u32,
    pub attributes: u16,
    pub root_files: u16,
    pub bitmap_start: u16,
    pub alloc_ptr: u16,
    pub alloc_blocks: u16,
    pub alloc_size: u32,
    pub clump_size: u32,
    pub first_alloc: u16,
    pub next_cnid: u32,
    pub free_blocks: u16,
    pub name_len: u8,
    pub name: [u8;MAX_VOL_NAME],
    pub backup: u32,
    pub seq_num: u16,
    pub write_count: u32,
    pub xt_clump: u32,
    pub ct_clump: u32,
    pub root_dirs: u16,
    pub file_count: u32,
    pub dir_count: u32,
    pub finder_info: [u32;8],
    pub vc_size: u16,
    pub vbm_c_size: u16,
    pub ctl_c_size: u16,
    pub xt_size: u32,
    pub xt_extents: [ExtDescriptor;3],
    pub ct_size: u32,
    pub ct_extents: [ExtDescriptor;3]
}

#[binrw]
#[brw(big)]
#[derive(Clone,Debug)]
pub struct NodeDescriptor {
    pub flink: u32,
    pub blink: u32,
    pub kind: u8,
    pub height: u8,
    pub num_recs: u16,
    reserved: u16
}

#[binrw]
#[brw(big)]
#[derive(Clone,Debug)]
pub struct HeaderRecord {
    pub depth: u16,
    pub root: u32,
    pub num_recs: u32,
    pub first_leaf: u32,
    pub last_leaf: u32,
    pub node_size: u16,
    pub max_key_len: u16,
    pub total_nodes: u32,
    pub free_nodes: u32
}

#[binrw]
#[brw(big)]
#[derive(Clone,Debug)]
pub struct DirRecord {
    pub rec_type: u8,
    reserved: u8,
    pub flags: u16,
    pub valence: u16,
    pub cnid: u32,
    pub created: u32,
    pub modified: u32,
    pub backup: u32,
    pub user_info: [u8;16],
    pub finder_info: [u8;16],
    reserved2: [u32;4]
}

#[binrw]
#[brw(big)]
#[derive(Clone,Debug)]
pub struct FileRecord {
    pub rec_type: u8,
    reserved: u8,
    pub flags: u8,
    pub file_kind: u8,
    pub fd_type: [u8;4],
    pub creator: [u8;4],
    pub fd_flags: u16,
    pub location: u32,
    pub folder: u16,
    pub cnid: u32,
    pub data_start: u16,
    pub data_logical: u32,
    pub data_physical: u32,
    pub rsrc_start: u16,
    pub rsrc_logical: u32,
    pub rsrc_physical: u32,
    pub created: u32,
    pub modified: u32,
    pub backup: u32,
    pub finder_info: [u8;16],
    pub clump: u16,
    pub data_extents: [ExtDescriptor;3],
    pub rsrc_extents: [ExtDescriptor;3],
    reserved2: u32
}

impl FileRecord {
    pub fn is_locked(&self) -> bool {
        self.flags & 0x01 != 0
    }
    /// (logical length, physical length, extents)
    pub fn fork(&self,rsrc: bool) -> (usize,usize,&[ExtDescriptor;3]) {
        match rsrc {
            false => (self.data_logical as usize,self.data_physical as usize,&self.data_extents),
            true => (self.rsrc_logical as usize,self.rsrc_physical as usize,&self.rsrc_extents)
        }
    }
}

pub enum CatRecord {
    Dir { parent: u32, name: String, rec: DirRecord },
    File { parent: u32, name: String, rec: FileRecord }
}

/// Leaf records of the catalog in key order
pub struct Catalog {
    pub records: Vec<CatRecord>,
    /// a node link was bad or formed a cycle
    pub broken: bool
}

/// Mac Roman to a path component, only the ASCII half is kept
pub fn mac_name(bytes: &[u8]) -> String {
    bytes.iter().map(|b| match *b {
        b'/' => ':',
        c @ 0x20..=0x7e => c as char,
        _ => '?'
    }).collect()
}

/// Seconds since 1904 to a date, 0 means no date
pub fn mac_time(secs: u32) -> Option<chrono::NaiveDateTime> {
    if secs==0 {
        return None;
    }
    let epoch = chrono::NaiveDate::from_ymd_opt(1904,1,1)?.and_hms_opt(0,0,0)?;
    epoch.checked_add_signed(chrono::TimeDelta::try_seconds(secs as i64)?)
}

pub fn read_mdb(dev: &mut dyn BlockDevice) -> Result<MasterDirectoryBlock,DYNERR> {
    dev.seek(MDB_BLOCK)?;
    let buf = dev.read(1)?;
    Ok(MasterDirectoryBlock::read(&mut Cursor::new(&buf))?)
}

fn be32(buf: &[u8],off: usize) -> u32 {
    u32::from_be_bytes([buf[off],buf[off+1],buf[off+2],buf[off+3]])
}

/// Offset of record `i`, from the table at the end of the node
fn record_offset(node: &[u8],i: usize) -> Option<usize> {
    let pos = NODE_SIZE.checked_sub(2*(i+1))?;
    let off = u16::from_be_bytes([node[pos],node[pos+1]]) as usize;
    match off >= NODE_DESCRIPTOR_SIZE && off < pos {
        true => Some(off),
        false => None
    }
}

/// An opened HFS volume
pub struct Volume {
    pub mdb: MasterDirectoryBlock,
    /// 512 byte blocks per allocation block
    pub per_alloc: usize,
    pub header: HeaderRecord
}

impl Volume {
    pub fn open(dev: &mut dyn BlockDevice) -> Result<Self,DYNERR> {
        let mdb = read_mdb(dev)?;
        if mdb.sig != SIGNATURE {
            return Err(Box::new(Error::BadSignature));
        }
        if mdb.alloc_size==0 || mdb.alloc_size as usize % BLOCK_SIZE != 0 {
            debug!("allocation size {} is invalid",mdb.alloc_size);
            return Err(Box::new(Error::BadGeometry));
        }
        let per_alloc = mdb.alloc_size as usize / BLOCK_SIZE;
        if mdb.first_alloc as usize + mdb.alloc_blocks as usize * per_alloc > dev.num_blocks() {
            debug!("{} allocation blocks do not fit",mdb.alloc_blocks);
            return Err(Box::new(Error::BadGeometry));
        }
        let mut ans = Self {
            mdb,
            per_alloc,
            header: HeaderRecord { depth: 0, root: 0, num_recs: 0, first_leaf: 0, last_leaf: 0, node_size: 0, max_key_len: 0, total_nodes: 0, free_nodes: 0 }
        };
        let node = ans.read_node(dev,0)?;
        let desc = NodeDescriptor::read(&mut Cursor::new(&node))?;
        if desc.kind != HEADER_NODE {
            debug!("catalog node 0 has kind {}",desc.kind);
            return Err(Box::new(Error::BadNode));
        }
        ans.header = HeaderRecord::read(&mut Cursor::new(&node[NODE_DESCRIPTOR_SIZE..]))?;
        if ans.header.node_size as usize != NODE_SIZE {
            debug!("catalog node size {}",ans.header.node_size);
            return Err(Box::new(Error::BadNode));
        }
        Ok(ans)
    }
    pub fn vol_name(&self) -> String {
        let len = usize::min(self.mdb.name_len as usize,MAX_VOL_NAME);
        mac_name(&self.mdb.name[0..len])
    }
    pub fn alloc_to_block(&self,alloc: usize) -> usize {
        self.mdb.first_alloc as usize + alloc*self.per_alloc
    }
    /// allocation blocks covered by the extents
    pub fn alloc_units(&self,ext: &[ExtDescriptor]) -> Vec<usize> {
        let mut ans = Vec::new();
        for e in ext {
            ans.extend(e.start as usize..e.start as usize + e.count as usize);
        }
        ans
    }
    /// 512 byte blocks covered by the extents, in order
    pub fn extent_blocks(&self,ext: &[ExtDescriptor]) -> Vec<usize> {
        let mut ans = Vec::new();
        for a in self.alloc_units(ext) {
            let b = self.alloc_to_block(a);
            ans.extend(b..b+self.per_alloc);
        }
        ans
    }
    fn read_node(&self,dev: &mut dyn BlockDevice,n: usize) -> Result<Vec<u8>,DYNERR> {
        let blocks = self.extent_blocks(&self.mdb.ct_extents);
        match blocks.get(n) {
            Some(b) => {
                dev.seek(*b)?;
                dev.read(1)
            },
            None => Err(Box::new(Error::BadNode))
        }
    }
    fn leaf_records(node: &[u8],desc: &NodeDescriptor,ans: &mut Vec<CatRecord>) -> Result<(),DYNERR> {
        for i in 0..desc.num_recs as usize {
            let off = match record_offset(node,i) {
                Some(o) => o,
                None => return Err(Box::new(Error::BadNode))
            };
            let key_len = node[off] as usize;
            if key_len==0 {
                continue;
            }
            if off + 7 > NODE_SIZE || off + 7 + node[off+6] as usize > NODE_SIZE {
                return Err(Box::new(Error::BadNode));
            }
            let parent = be32(node,off+2);
            let name = mac_name(&node[off+7..off+7+node[off+6] as usize]);
            let mut data = off + 1 + key_len;
            data += data & 1;
            if data >= NODE_SIZE {
                return Err(Box::new(Error::BadNode));
            }
            match node[data] {
                DIR_RECORD => {
                    let rec = DirRecord::read(&mut Cursor::new(&node[data..]))?;
                    ans.push(CatRecord::Dir { parent, name, rec });
                },
                FILE_RECORD => {
                    let rec = FileRecord::read(&mut Cursor::new(&node[data..]))?;
                    ans.push(CatRecord::File { parent, name, rec });
                },
                t => trace!("skip catalog record type {}",t)
            }
        }
        Ok(())
    }
    /// Walk the leaf chain from the first leaf
    pub fn catalog(&self,dev: &mut dyn BlockDevice) -> Result<Catalog,DYNERR> {
        let mut ans = Catalog { records: Vec::new(), broken: false };
        let mut visited = HashSet::new();
        let bound = usize::min(self.header.total_nodes as usize,self.extent_blocks(&self.mdb.ct_extents).len());
        let mut n = self.header.first_leaf as usize;
        while n != 0 {
            if n >= bound || !visited.insert(n) {
                debug!("catalog leaf link {} is bad",n);
                ans.broken = true;
                break;
            }
            let node = self.read_node(dev,n)?;
            let desc = NodeDescriptor::read(&mut Cursor::new(&node))?;
            if desc.kind != LEAF_NODE {
                debug!("node {} is not a leaf",n);
                ans.broken = true;
                break;
            }
            if Self::leaf_records(&node,&desc,&mut ans.records).is_err() {
                debug!("records of node {} are damaged",n);
                ans.broken = true;
                break;
            }
            n = desc.flink as usize;
        }
        Ok(ans)
    }
    /// Volume bitmap, one bit per allocation block
    pub fn bitmap(&self,dev: &mut dyn BlockDevice) -> Result<BitVec,DYNERR> {
        let count = self.mdb.alloc_blocks as usize;
        let blocks = (count + BLOCK_SIZE*8 - 1)/(BLOCK_SIZE*8);
        dev.seek(self.mdb.bitmap_start as usize)?;
        let mut ans = BitVec::from_bytes(&dev.read(blocks)?);
        ans.truncate(count);
        Ok(ans)
    }
}

#[test]
fn names_and_dates() {
    assert_eq!(mac_name(b"Read/Me"),"Read:Me");
    assert_eq!(mac_time(0),None);
    let t = chrono::NaiveDate::from_ymd_opt(1904,1,2).and_then(|d| d.and_hms_opt(0,1,0));
    assert_eq!(mac_time(86460),t);
}

#[test]
fn record_table() {
    let mut node = vec![0;NODE_SIZE];
    node[NODE_SIZE-2..].copy_from_slice(&14u16.to_be_bytes());
    node[NODE_SIZE-4..NODE_SIZE-2].copy_from_slice(&600u16.to_be_bytes());
    assert_eq!(record_offset(&node,0),Some(14));
    assert_eq!(record_offset(&node,1),None);
}
