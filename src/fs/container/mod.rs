//! # Container file systems
//!
//! Partitioning schemes and fixed splits that hold other volumes rather than files.
//! Each scheme supplies a `test` and a `partitions` function over the parent image.
//! Mounting a container builds a child `DiskImg` over each partition, tests it with the
//! format registry, and keeps the result as a `SubVolume` owned by the container.

pub mod unidos;
pub mod ozdos;
pub mod cffa;
pub mod macpart;
pub mod microdrive;
pub mod focusdrive;

use log::{info,debug};
use super::{DiskFS,FsCore,ForkMap,FreeSpace,Leniency,MountOptions,SubVolume};
use super::usage::{VolumeUsage,UsageTag};
use crate::img::{self,Addressing,DiskImg,SectorOrder};
use crate::{DYNERR,STDRESULT};

/// Containers nested deeper than this do not mount their partitions
pub const MAX_DEPTH: usize = 4;

#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum Scheme {
    Unidos,
    OzDos,
    Cffa,
    MacPart,
    MicroDrive,
    FocusDrive
}

impl std::fmt::Display for Scheme {
    fn fmt(&self,f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unidos => write!(f,"UNIDOS"),
            Self::OzDos => write!(f,"OzDOS"),
            Self::Cffa => write!(f,"CFFA"),
            Self::MacPart => write!(f,"MacPart"),
            Self::MicroDrive => write!(f,"MicroDrive"),
            Self::FocusDrive => write!(f,"FocusDrive")
        }
    }
}

/// Where a partition lives in the parent and how the child should address it
#[derive(Clone,Debug)]
pub struct Partition {
    pub name: String,
    /// first parent block
    pub start_block: usize,
    /// parent blocks spanned
    pub num_blocks: usize,
    pub addressing: Addressing,
    pub order: SectorOrder,
    /// child sees only this half of each parent block
    pub paired: Option<usize>
}

impl Partition {
    pub fn blocks(name: &str,start_block: usize,num_blocks: usize) -> Self {
        Self {
            name: name.to_string(),
            start_block,
            num_blocks,
            addressing: Addressing::Blocks(num_blocks),
            order: SectorOrder::ProDos,
            paired: None
        }
    }
    /// child image over the partition
    pub fn open(&self,parent: &DiskImg) -> Result<DiskImg,DYNERR> {
        let len = match self.paired {
            Some(_) => self.num_blocks*img::BLOCK_SIZE/2,
            None => self.num_blocks*img::BLOCK_SIZE
        };
        parent.sub_image(self.start_block*img::BLOCK_SIZE,len,self.addressing.clone(),self.order,self.paired)
    }
}

/// true if the image is a linear stream of blocks
pub fn is_block_device(img: &DiskImg) -> bool {
    match img.addressing() {
        Addressing::Blocks(_) => true,
        Addressing::Sectors { tracks: _, sectors } => *sectors != 16 && *sectors != 13,
        Addressing::Nibbles(_) => false
    }
}

fn test(scheme: Scheme,img: &DiskImg,leniency: Leniency) -> bool {
    if !is_block_device(img) {
        return false;
    }
    match scheme {
        Scheme::Unidos => unidos::test(img,leniency),
        Scheme::OzDos => ozdos::test(img,leniency),
        Scheme::Cffa => cffa::test(img,leniency),
        Scheme::MacPart => macpart::test(img,leniency),
        Scheme::MicroDrive => microdrive::test(img,leniency),
        Scheme::FocusDrive => focusdrive::test(img,leniency)
    }
}

fn partitions(scheme: Scheme,img: &DiskImg) -> Result<Vec<Partition>,DYNERR> {
    match scheme {
        Scheme::Unidos => Ok(unidos::partitions()),
        Scheme::OzDos => Ok(ozdos::partitions()),
        Scheme::Cffa => Ok(cffa::partitions(img.num_blocks())),
        Scheme::MacPart => macpart::partitions(img),
        Scheme::MicroDrive => microdrive::partitions(img),
        Scheme::FocusDrive => focusdrive::partitions(img)
    }
}

/// A container volume, holds sub-volumes and no files
pub struct Disk {
    core: FsCore,
    scheme: Scheme,
    parts: Vec<Partition>
}

impl Disk {
    pub fn test(img: &DiskImg,leniency: Leniency,scheme: Scheme) -> bool {
        test(scheme,img,leniency)
    }
    /// Mount the container and mount each partition.  A partition that cannot be
    /// recognized is kept with no file system.
    pub fn mount(img: DiskImg,opts: &MountOptions,scheme: Scheme) -> Result<Box<dyn DiskFS>,DYNERR> {
        let parts = partitions(scheme,&img)?;
        let mut disk = Self { core: FsCore::new(img,opts.mode), scheme, parts };
        disk.open_sub_volumes(opts)?;
        super::finish_mount(disk)
    }
    fn open_sub_volumes(&mut self,opts: &MountOptions) -> STDRESULT {
        let descend = opts.depth + 1 < MAX_DEPTH;
        if !descend {
            self.core.note(&format!("{} partitions are nested too deeply to mount",self.scheme),false);
            self.core.fully_enumerated = false;
        }
        for p in self.parts.clone() {
            let fs = match (descend,p.open(&self.core.img)) {
                (true,Ok(child)) => match super::registry::mount(child,&opts.nested()) {
                    Ok(fs) => Some(fs),
                    Err(e) => {
                        debug!("partition {} not mounted: {}",p.name,e);
                        None
                    }
                },
                (_,Err(_)) => {
                    self.core.note(&format!("partition {} extends past the end of the disk",p.name),true);
                    None
                },
                (false,_) => None
            };
            info!("{} partition {} at block {}, {} blocks",self.scheme,p.name,p.start_block,p.num_blocks);
            self.core.sub_volumes.push(SubVolume {
                name: p.name.clone(),
                start_block: p.start_block,
                num_blocks: p.num_blocks,
                fs
            });
        }
        Ok(())
    }
    pub fn scheme(&self) -> Scheme {
        self.scheme
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
        match self.scheme {
            Scheme::Unidos => "UNIDOS",
            Scheme::OzDos => "OzDOS",
            Scheme::Cffa => "CFFA",
            Scheme::MacPart => "MacPart",
            Scheme::MicroDrive => "MicroDrive",
            Scheme::FocusDrive => "FocusDrive"
        }
    }
    fn volume_name(&self) -> String {
        format!("{} ({} partitions)",self.fs_name(),self.parts.len())
    }
    fn volume_id(&self) -> String {
        self.volume_name()
    }
    /// blocks not covered by any partition count as free
    fn free_space(&self) -> Result<FreeSpace,DYNERR> {
        let usage = self.usage_map();
        Ok(FreeSpace { total: usage.len(), free: usage.count(UsageTag::Free), unit_size: img::BLOCK_SIZE })
    }
    fn fs_num_blocks(&self) -> usize {
        self.core.img.num_blocks()
    }
    fn scan_usage(&mut self) -> Result<VolumeUsage,DYNERR> {
        let usage = self.usage_map();
        if usage.conflicts() > 0 {
            self.core.note(&format!("{} blocks belong to more than one partition",usage.conflicts()),true);
        }
        Ok(usage)
    }
    fn rescan(&mut self) -> STDRESULT {
        self.core.files = Vec::new();
        Ok(())
    }
    fn fork_map(&self,_idx: usize,_rsrc: bool) -> Result<ForkMap,DYNERR> {
        Err(Box::new(super::Error::FileNotFound))
    }
}

impl Disk {
    fn usage_map(&self) -> VolumeUsage {
        let mut usage = VolumeUsage::new(self.core.img.num_blocks(),img::BLOCK_SIZE);
        for p in &self.parts {
            for b in p.start_block..usize::min(p.start_block + p.num_blocks,usage.len()) {
                // interleaved partitions share their blocks
                match p.paired {
                    Some(_) => usage.mark_if_free(b,UsageTag::FileData),
                    None => {
                        usage.mark(b,UsageTag::FileData);
                    }
                }
            }
        }
        // the map itself precedes the first partition
        let first = self.parts.iter().map(|p| p.start_block).min().unwrap_or(0);
        for b in 0..first {
            usage.mark_if_free(b,UsageTag::System);
        }
        usage
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::MountMode;
    use crate::img::{CreateParams,WrapperKind};

    #[test]
    fn partition_view() {
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(64)).unwrap();
        img.write_block(10,&[1;512]).unwrap();
        let p = Partition::blocks("P1",8,16);
        let child = p.open(&img).unwrap();
        assert_eq!(child.num_blocks(),16);
        assert_eq!(child.read_block(2).unwrap(),vec![1;512]);
        assert!(Partition::blocks("P2",60,16).open(&img).is_err());
    }

    #[test]
    fn unrecognized_partitions() {
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(4096)).unwrap();
        img.write_block(0,&microdrive::map_block(&[(16,2000),(2016,2000)])).unwrap();
        let fs = Disk::mount(img,&MountOptions::new(MountMode::Full,Leniency::Strict),Scheme::MicroDrive).unwrap();
        assert_eq!(fs.sub_volumes().len(),2);
        assert!(fs.sub_volumes()[0].fs.is_none());
        assert_eq!(fs.next_sub_volume(Some(0)).map(|s| s.start_block),Some(2016));
        assert!(fs.files().is_empty());
        let free = fs.free_space().unwrap();
        assert_eq!(free.free,4096 - 4016);
        assert!(fs.is_good());
    }

    #[test]
    fn depth_limit() {
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(4096)).unwrap();
        img.write_block(0,&microdrive::map_block(&[(16,2000)])).unwrap();
        let mut opts = MountOptions::new(MountMode::ReadOnly,Leniency::Strict);
        opts.depth = MAX_DEPTH - 1;
        let fs = Disk::mount(img,&opts,Scheme::MicroDrive).unwrap();
        assert!(!fs.fully_enumerated());
        assert!(fs.sub_volumes()[0].fs.is_none());
    }
}
