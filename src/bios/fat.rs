//! ### File allocation table (FAT)
//!
//! Module for reading the FAT on FAT volumes.  This module assumes the
//! entire FAT is buffered (as usual we suppose small retro volumes).
//!
//! The FAT can be thought of as a cluster pool with forward links.
//! A cluster is an allocation unit composed of a fixed number of logical sectors.
//! The links in the FAT form chains of clusters, each chain points to a file's data.
//! A cluster value tells us:
//! * state of cluster, can be damaged, free, or allocated
//! * if allocated, is this the last cluster
//! * if allocated and not the last cluster, where is the next cluster
//!
//! The first two clusters are reserved, so that the first data cluster is cluster 2.
//! Cluster 0 contains the same value as the BPB's media field in the low 8 bits, higher bits are 1.

// end of cluster chain (EOC), if FAT entry is >= the value it is EOC.
const EOC12_MIN: u32 = 0xff8;
const EOC16_MIN: u32 = 0xfff8;

const BAD_CLUSTER12: u32 = 0xff7;
const BAD_CLUSTER16: u32 = 0xfff7;

const FREE_CLUSTER: u32 = 0;
pub const FIRST_DATA_CLUSTER: u32 = 2;

/// State of a cluster according to its FAT entry
#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum Cluster {
    Free,
    Bad,
    Last,
    Next(u32)
}

/// get the value of cluster `n`, or None if the entry is outside the buffer.
/// `typ` = bits per FAT entry (12,16)
/// `buf` = buffer containing the entire FAT
pub fn get_cluster(n: usize,typ: usize,buf: &[u8]) -> Option<u32> {
    match typ {
        12 => {
            let offset = n + (n/2);
            let val16 = u16::from_le_bytes([*buf.get(offset)?,*buf.get(offset+1)?]);
            match n & 1 {
                1 => Some((val16 >> 4) as u32),
                _ => Some((val16 & 0x0fff) as u32)
            }
        },
        16 => {
            let offset = n*2;
            Some(u16::from_le_bytes([*buf.get(offset)?,*buf.get(offset+1)?]) as u32)
        },
        _ => None
    }
}

/// Interpret the entry for cluster `n`
pub fn cluster_state(n: usize,typ: usize,buf: &[u8]) -> Option<Cluster> {
    let val = get_cluster(n,typ,buf)?;
    let (bad,eoc) = match typ {
        12 => (BAD_CLUSTER12,EOC12_MIN),
        _ => (BAD_CLUSTER16,EOC16_MIN)
    };
    Some(match val {
        FREE_CLUSTER => Cluster::Free,
        v if v==bad => Cluster::Bad,
        v if v >= eoc => Cluster::Last,
        v => Cluster::Next(v)
    })
}

pub fn is_free(n: usize,typ: usize,buf: &[u8]) -> bool {
    cluster_state(n,typ,buf)==Some(Cluster::Free)
}

pub fn is_damaged(n: usize,typ: usize,buf: &[u8]) -> bool {
    cluster_state(n,typ,buf)==Some(Cluster::Bad)
}

#[test]
fn fat12_packing() {
    // entries 2 and 3 are 0x003 and 0xfff
    let buf = [0xf9,0xff,0xff,0x03,0xf0,0xff];
    assert_eq!(get_cluster(0,12,&buf),Some(0xff9));
    assert_eq!(cluster_state(2,12,&buf),Some(Cluster::Next(3)));
    assert_eq!(cluster_state(3,12,&buf),Some(Cluster::Last));
    assert_eq!(get_cluster(4,12,&buf),None);
    assert!(!is_free(2,12,&buf));
    assert!(!is_damaged(3,12,&buf));
}

#[test]
fn fat16_entries() {
    let buf = [0xf8,0xff,0xff,0xff,0x00,0x00,0xf7,0xff];
    assert!(is_free(2,16,&buf));
    assert!(is_damaged(3,16,&buf));
    assert_eq!(cluster_state(1,16,&buf),Some(Cluster::Last));
}
