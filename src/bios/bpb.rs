//! ## BIOS Parameter Block Module
//!
//! This contains the BIOS parameter block (BPB) used with FAT volumes.
//! Implementation is based on Microsoft Hardware White Paper,
//! "FAT: General Overview of On-Disk Format," Dec. 6, 2000.
//! Only the FAT12/16 layout is kept, the FAT32 extension is not read.

use binrw::{binrw,BinRead};
use std::io::Cursor;
use log::debug;
use crate::DYNERR;

/// goes in boot[510..512]
pub const BOOT_SIGNATURE: [u8;2] = [0x55,0xaa];
/// signature indicating the tail fields are present
const EXTENDED_BOOT: u8 = 0x29;

/// The boot sector through the FAT12/16 tail fields.
/// The foundation fields start at byte 11, following `jmp` and `oem`.
#[binrw]
#[brw(little)]
#[derive(Clone,Debug)]
pub struct BootSector {
    pub jmp: [u8;3],
    pub oem: [u8;8],
    /// 512, 1024, 2048, or 4096
    pub bytes_per_sec: u16,
    /// 1, 2, 4, 8, 16, 32, 64, or 128.
    pub sec_per_clus: u8,
    /// usually 1 for FAT12 or FAT16
    pub reserved_sectors: u16,
    /// usually 2
    pub num_fats: u8,
    /// Directory entries in the root directory.
    /// The root directory should take up an integral number of sectors.
    pub root_ent_cnt: u16,
    /// 16-bit sector count, superceded by tot_sec_32 if 0.
    pub tot_sec_16: u16,
    /// Value should also be put in FAT[0] in the low 8 bits.
    /// typical values are 0xf0 (removable) and 0xf8 (fixed).
    pub media: u8,
    /// count of sectors occupied by one FAT, 0 means FAT32
    pub fat_size_16: u16,
    pub sec_per_trk: u16,
    pub num_heads: u16,
    /// hidden sectors preceding this FAT volume's partition
    pub hidd_sec: u32,
    pub tot_sec_32: u32,
    pub drv_num: u8,
    reserved1: u8,
    /// 0x29 if the following 3 fields are present
    pub boot_sig: u8,
    pub vol_id: u32,
    /// matches root directory label if it exists, otherwise "NO NAME    "
    pub vol_lab: [u8;11],
    /// "FAT12" or "FAT16" padded with spaces, only for display.
    pub fil_sys_type: [u8;8]
}

impl BootSector {
    pub fn from_sector(buf: &[u8]) -> Result<Self,DYNERR> {
        Ok(Self::read(&mut Cursor::new(buf))?)
    }
    /// signature at the end of the sector
    pub fn has_signature(buf: &[u8]) -> bool {
        buf.len() >= 512 && buf[510..512]==BOOT_SIGNATURE
    }
    /// check the foundation fields for consistency
    pub fn verify(&self) -> bool {
        let mut ans = true;
        let bytes = self.bytes_per_sec as u64;
        if ![512,1024,2048,4096].contains(&bytes) {
            debug!("invalid bytes per sector {}",bytes);
            ans = false;
        }
        if ![1,2,4,8,16,32,64,128].contains(&self.sec_per_clus) {
            debug!("invalid sectors per cluster {}",self.sec_per_clus);
            ans = false;
        }
        if self.reserved_sectors==0 {
            debug!("invalid count of reserved sectors 0");
            ans = false;
        }
        if self.num_fats==0 {
            debug!("invalid count of FATs 0");
            ans = false;
        }
        if bytes > 0 && (self.root_ent_cnt as u64*32)%bytes != 0 {
            debug!("invalid entry count {}",self.root_ent_cnt);
            ans = false;
        }
        if self.tot_sec()==0 {
            debug!("invalid sector count 0");
            ans = false;
        }
        if ans && self.first_data_sec() >= self.tot_sec() {
            debug!("no room for data region");
            ans = false;
        }
        ans
    }
    pub fn label(&self) -> Option<[u8;11]> {
        match self.boot_sig {
            EXTENDED_BOOT => Some(self.vol_lab),
            _ => None
        }
    }
    pub fn sec_size(&self) -> u64 {
        self.bytes_per_sec as u64
    }
    /// bytes per cluster
    pub fn cluster_size(&self) -> u64 {
        self.sec_per_clus as u64 * self.sec_size()
    }
    pub fn tot_sec(&self) -> u64 {
        match self.tot_sec_16 {
            0 => self.tot_sec_32 as u64,
            x => x as u64
        }
    }
    pub fn res_secs(&self) -> u64 {
        self.reserved_sectors as u64
    }
    /// sectors used by the root directory, rounding up
    pub fn root_dir_secs(&self) -> u64 {
        if self.bytes_per_sec==0 {
            return u16::MAX as u64;
        }
        (self.root_ent_cnt as u64*32 + self.sec_size() - 1) / self.sec_size()
    }
    /// sectors occupied by 1 FAT
    pub fn fat_secs(&self) -> u64 {
        self.fat_size_16 as u64
    }
    pub fn root_dir_sec_rng(&self) -> [u64;2] {
        let beg = self.res_secs() + self.num_fats as u64 * self.fat_secs();
        [beg,beg + self.root_dir_secs()]
    }
    pub fn first_data_sec(&self) -> u64 {
        self.root_dir_sec_rng()[1]
    }
    pub fn data_rgn_secs(&self) -> u64 {
        self.tot_sec().saturating_sub(self.first_data_sec())
    }
    /// total clusters used, rounding down (remainder partial-cluster is not used)
    pub fn cluster_count(&self) -> u64 {
        match self.sec_per_clus {
            0 => 0,
            x => self.data_rgn_secs()/x as u64
        }
    }
    /// FAT type determination based on the cluster count.
    /// These peculiar cutoffs are correct according to MS.
    pub fn fat_type(&self) -> usize {
        match self.cluster_count() {
            x if x < 4085 => 12,
            x if x < 65525 => 16,
            _ => 32
        }
    }
    pub fn first_cluster_sec(&self,n: u64) -> u64 {
        (n-2)*self.sec_per_clus as u64 + self.first_data_sec()
    }
}

#[cfg(test)]
pub fn floppy_720() -> Vec<u8> {
    let mut ans = vec![0;512];
    ans[0..3].copy_from_slice(&[0xeb,0x3c,0x90]);
    ans[3..11].copy_from_slice(b"MSDOS5.0");
    ans[11..13].copy_from_slice(&512u16.to_le_bytes());
    ans[13] = 2;
    ans[14..16].copy_from_slice(&1u16.to_le_bytes());
    ans[16] = 2;
    ans[17..19].copy_from_slice(&112u16.to_le_bytes());
    ans[19..21].copy_from_slice(&1440u16.to_le_bytes());
    ans[21] = 0xf9;
    ans[22..24].copy_from_slice(&3u16.to_le_bytes());
    ans[24..26].copy_from_slice(&9u16.to_le_bytes());
    ans[26..28].copy_from_slice(&2u16.to_le_bytes());
    ans[38] = EXTENDED_BOOT;
    ans[43..54].copy_from_slice(b"NO NAME    ");
    ans[54..62].copy_from_slice(b"FAT12   ");
    ans[510..512].copy_from_slice(&BOOT_SIGNATURE);
    ans
}

#[test]
fn geometry() {
    let buf = floppy_720();
    assert!(BootSector::has_signature(&buf));
    let boot = BootSector::from_sector(&buf).unwrap();
    assert!(boot.verify());
    assert_eq!(boot.root_dir_sec_rng(),[7,14]);
    assert_eq!(boot.cluster_count(),713);
    assert_eq!(boot.fat_type(),12);
    assert_eq!(boot.first_cluster_sec(3),16);
    assert_eq!(boot.label(),Some(*b"NO NAME    "));
}
