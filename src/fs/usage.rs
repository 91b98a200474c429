//! ## Volume Usage
//!
//! Flat allocation maps built while scanning a volume.  These are derived from, never a source
//! of truth for, the on-disk allocation structures, so they are rebuilt on every scan and
//! discarded afterwards.

use std::fmt;
use bit_vec::BitVec;

/// Fixed length set of bits, used for bad block maps and free maps
#[derive(Clone,PartialEq,Debug)]
pub struct LinearBitmap {
    bits: BitVec
}

impl LinearBitmap {
    pub fn new(count: usize) -> Self {
        Self { bits: BitVec::from_elem(count,false) }
    }
    pub fn len(&self) -> usize {
        self.bits.len()
    }
    /// indices out of range are ignored
    pub fn set(&mut self,idx: usize) {
        if idx < self.bits.len() {
            self.bits.set(idx,true);
        }
    }
    pub fn clear(&mut self,idx: usize) {
        if idx < self.bits.len() {
            self.bits.set(idx,false);
        }
    }
    /// false for indices out of range
    pub fn is_set(&self,idx: usize) -> bool {
        self.bits.get(idx).unwrap_or(false)
    }
    pub fn count_set(&self) -> usize {
        self.bits.iter().filter(|b| *b).count()
    }
}

/// What an allocation unit is used for
#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum UsageTag {
    Free,
    /// boot code, volume headers, bitmaps, or units the map says are used that nothing claims
    System,
    Directory,
    FileData,
    Bad
}

impl fmt::Display for UsageTag {
    fn fmt(&self,f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f,"free"),
            Self::System => write!(f,"system"),
            Self::Directory => write!(f,"directory"),
            Self::FileData => write!(f,"file data"),
            Self::Bad => write!(f,"bad")
        }
    }
}

/// Map from allocation unit to its usage
#[derive(Clone,Debug)]
pub struct VolumeUsage {
    units: Vec<UsageTag>,
    unit_size: usize,
    conflicts: usize
}

impl VolumeUsage {
    pub fn new(count: usize,unit_size: usize) -> Self {
        Self { units: vec![UsageTag::Free;count], unit_size, conflicts: 0 }
    }
    pub fn len(&self) -> usize {
        self.units.len()
    }
    pub fn unit_size(&self) -> usize {
        self.unit_size
    }
    pub fn get(&self,unit: usize) -> Option<UsageTag> {
        self.units.get(unit).copied()
    }
    /// Tag a unit.  Returns false if the unit is out of range or already claimed,
    /// in which case a conflict is counted and the original tag is kept.
    pub fn mark(&mut self,unit: usize,tag: UsageTag) -> bool {
        match self.units.get_mut(unit) {
            Some(u) if *u==UsageTag::Free => {
                *u = tag;
                true
            },
            _ => {
                self.conflicts += 1;
                false
            }
        }
    }
    /// Tag a unit only if nothing claims it yet, never a conflict.
    pub fn mark_if_free(&mut self,unit: usize,tag: UsageTag) {
        if let Some(u) = self.units.get_mut(unit) {
            if *u==UsageTag::Free {
                *u = tag;
            }
        }
    }
    pub fn conflicts(&self) -> usize {
        self.conflicts
    }
    pub fn count(&self,tag: UsageTag) -> usize {
        self.units.iter().filter(|u| **u==tag).count()
    }
    /// units in any state other than free
    pub fn in_use(&self) -> usize {
        self.units.len() - self.count(UsageTag::Free)
    }
}

#[test]
fn bitmap_ops() {
    let mut map = LinearBitmap::new(20);
    map.set(0);
    map.set(19);
    map.set(25);
    assert_eq!(map.count_set(),2);
    map.clear(0);
    assert!(!map.is_set(0));
    assert!(map.is_set(19));
    assert!(!map.is_set(25));
    assert_eq!(map.len(),20);
    map.clear(40);
    assert_eq!(map.count_set(),1);
}

#[test]
fn usage_conflicts() {
    let mut usage = VolumeUsage::new(10,512);
    assert!(usage.mark(3,UsageTag::FileData));
    assert!(!usage.mark(3,UsageTag::Directory));
    assert!(!usage.mark(10,UsageTag::FileData));
    usage.mark_if_free(3,UsageTag::System);
    usage.mark_if_free(4,UsageTag::System);
    assert_eq!(usage.conflicts(),2);
    assert_eq!(usage.get(3),Some(UsageTag::FileData));
    assert_eq!(usage.in_use(),2);
}
