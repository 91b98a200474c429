//! # Format registry
//!
//! Ordered list of the file systems we can recognize.  Detection walks the leniency levels
//! from `Strict` down to the caller's floor, and at each level tries the candidates in order,
//! each with every plausible sector order.  Containers come first so that a partitioned disk
//! is not mistaken for whatever happens to sit in its first partition.

use std::fmt;
use log::{info,debug};
use super::{DiskFS,Leniency,MountOptions};
use super::{prodos,dos3x,pascal,cpm,rdos,gutenberg,hfs,fat,container};
use super::container::Scheme;
use crate::img::{DiskImg,SectorOrder};
use crate::DYNERR;

#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum FormatTag {
    MacPart,
    MicroDrive,
    FocusDrive,
    Cffa,
    Unidos,
    OzDos,
    Dos33,
    Dos32,
    ProDos,
    Pascal,
    Cpm,
    Rdos33,
    Rdos32,
    Gutenberg,
    Hfs,
    Fat
}

impl fmt::Display for FormatTag {
    fn fmt(&self,f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MacPart => "MacPart",
            Self::MicroDrive => "MicroDrive",
            Self::FocusDrive => "FocusDrive",
            Self::Cffa => "CFFA",
            Self::Unidos => "UNIDOS",
            Self::OzDos => "OzDOS",
            Self::Dos33 => "DOS 3.3",
            Self::Dos32 => "DOS 3.2",
            Self::ProDos => "ProDOS",
            Self::Pascal => "Pascal",
            Self::Cpm => "CP/M",
            Self::Rdos33 => "RDOS 3.3",
            Self::Rdos32 => "RDOS 3.2",
            Self::Gutenberg => "Gutenberg",
            Self::Hfs => "HFS",
            Self::Fat => "FAT"
        };
        write!(f,"{}",s)
    }
}

type TestFn = fn(&DiskImg,Leniency) -> bool;

/// One entry in the recognition order
pub struct Candidate {
    pub tag: FormatTag,
    test: TestFn,
    /// sector orders worth trying when the image is order sensitive
    pub orders: &'static [SectorOrder]
}

const ANY_ORDER: &[SectorOrder] = &[SectorOrder::Dos,SectorOrder::ProDos,SectorOrder::Physical];
const PRODOS_ORDER: &[SectorOrder] = &[SectorOrder::ProDos];

fn test_macpart(img: &DiskImg,l: Leniency) -> bool { container::Disk::test(img,l,Scheme::MacPart) }
fn test_microdrive(img: &DiskImg,l: Leniency) -> bool { container::Disk::test(img,l,Scheme::MicroDrive) }
fn test_focusdrive(img: &DiskImg,l: Leniency) -> bool { container::Disk::test(img,l,Scheme::FocusDrive) }
fn test_cffa(img: &DiskImg,l: Leniency) -> bool { container::Disk::test(img,l,Scheme::Cffa) }
fn test_unidos(img: &DiskImg,l: Leniency) -> bool { container::Disk::test(img,l,Scheme::Unidos) }
fn test_ozdos(img: &DiskImg,l: Leniency) -> bool { container::Disk::test(img,l,Scheme::OzDos) }
fn test_dos33(img: &DiskImg,l: Leniency) -> bool { dos3x::Disk::test(img,l,false) }
fn test_dos32(img: &DiskImg,l: Leniency) -> bool { dos3x::Disk::test(img,l,true) }
fn test_rdos33(img: &DiskImg,l: Leniency) -> bool { rdos::Disk::test(img,l,rdos::Flavor::Rdos33) }
fn test_rdos32(img: &DiskImg,l: Leniency) -> bool { rdos::Disk::test(img,l,rdos::Flavor::Rdos32) }

/// Recognition order
pub const CANDIDATES: [Candidate;16] = [
    Candidate { tag: FormatTag::MacPart, test: test_macpart, orders: ANY_ORDER },
    Candidate { tag: FormatTag::MicroDrive, test: test_microdrive, orders: ANY_ORDER },
    Candidate { tag: FormatTag::FocusDrive, test: test_focusdrive, orders: ANY_ORDER },
    Candidate { tag: FormatTag::Cffa, test: test_cffa, orders: ANY_ORDER },
    Candidate { tag: FormatTag::Unidos, test: test_unidos, orders: ANY_ORDER },
    Candidate { tag: FormatTag::OzDos, test: test_ozdos, orders: ANY_ORDER },
    Candidate { tag: FormatTag::Dos33, test: test_dos33, orders: ANY_ORDER },
    Candidate { tag: FormatTag::Dos32, test: test_dos32, orders: ANY_ORDER },
    Candidate { tag: FormatTag::ProDos, test: prodos::Disk::test, orders: ANY_ORDER },
    Candidate { tag: FormatTag::Pascal, test: pascal::Disk::test, orders: ANY_ORDER },
    Candidate { tag: FormatTag::Cpm, test: cpm::Disk::test, orders: ANY_ORDER },
    Candidate { tag: FormatTag::Rdos33, test: test_rdos33, orders: PRODOS_ORDER },
    Candidate { tag: FormatTag::Rdos32, test: test_rdos32, orders: ANY_ORDER },
    Candidate { tag: FormatTag::Gutenberg, test: gutenberg::Disk::test, orders: ANY_ORDER },
    Candidate { tag: FormatTag::Hfs, test: hfs::Disk::test, orders: ANY_ORDER },
    Candidate { tag: FormatTag::Fat, test: fat::Disk::test, orders: ANY_ORDER }
];

const LEVELS: [Leniency;3] = [Leniency::Strict,Leniency::Moderate,Leniency::Lenient];

/// Orders to try for a candidate, the image's own order first if it is known.
/// Images whose sector requests do not depend on order get a single try as they are.
fn orders_to_try(img: &DiskImg,c: &Candidate) -> Vec<SectorOrder> {
    if !img.order_matters() {
        return vec![img.order()];
    }
    let mut ans = Vec::new();
    if c.orders.contains(&img.order()) {
        ans.push(img.order());
    }
    for o in c.orders {
        if !ans.contains(o) {
            ans.push(*o);
        }
    }
    ans
}

/// Find the first format that passes, trying leniency levels down to `floor`.
/// On success the image is left in the sector order that passed.
pub fn detect(img: &mut DiskImg,floor: Leniency) -> Option<(FormatTag,Leniency)> {
    let orig = img.order();
    for leniency in LEVELS {
        if leniency > floor {
            break;
        }
        for c in CANDIDATES.iter() {
            for order in orders_to_try(img,c) {
                img.set_order(order);
                if (c.test)(img,leniency) {
                    info!("identified {} ({:?} order) at {:?} leniency",c.tag,order,leniency);
                    return Some((c.tag,leniency));
                }
            }
            img.set_order(orig);
        }
    }
    debug!("no file system was recognized");
    img.set_order(orig);
    None
}

/// Every candidate and sector order that passes at the given leniency, in candidate order.
pub fn detect_all(img: &mut DiskImg,leniency: Leniency) -> Vec<(FormatTag,SectorOrder)> {
    let orig = img.order();
    let mut ans = Vec::new();
    for c in CANDIDATES.iter() {
        for order in orders_to_try(img,c) {
            img.set_order(order);
            if (c.test)(img,leniency) {
                ans.push((c.tag,order));
            }
        }
        img.set_order(orig);
    }
    ans
}

/// Mount the image as the given format without testing
pub fn mount_as(tag: FormatTag,img: DiskImg,opts: &MountOptions) -> Result<Box<dyn DiskFS>,DYNERR> {
    match tag {
        FormatTag::MacPart => container::Disk::mount(img,opts,Scheme::MacPart),
        FormatTag::MicroDrive => container::Disk::mount(img,opts,Scheme::MicroDrive),
        FormatTag::FocusDrive => container::Disk::mount(img,opts,Scheme::FocusDrive),
        FormatTag::Cffa => container::Disk::mount(img,opts,Scheme::Cffa),
        FormatTag::Unidos => container::Disk::mount(img,opts,Scheme::Unidos),
        FormatTag::OzDos => container::Disk::mount(img,opts,Scheme::OzDos),
        FormatTag::Dos33 => dos3x::Disk::mount(img,opts,false),
        FormatTag::Dos32 => dos3x::Disk::mount(img,opts,true),
        FormatTag::ProDos => prodos::Disk::mount(img,opts),
        FormatTag::Pascal => pascal::Disk::mount(img,opts),
        FormatTag::Cpm => cpm::Disk::mount(img,opts),
        FormatTag::Rdos33 => rdos::Disk::mount(img,opts,rdos::Flavor::Rdos33),
        FormatTag::Rdos32 => rdos::Disk::mount(img,opts,rdos::Flavor::Rdos32),
        FormatTag::Gutenberg => gutenberg::Disk::mount(img,opts),
        FormatTag::Hfs => hfs::Disk::mount(img,opts),
        FormatTag::Fat => fat::Disk::mount(img,opts)
    }
}

/// Detect and mount.  Fails with `FileSystemMismatch` if nothing is recognized.
pub fn mount(mut img: DiskImg,opts: &MountOptions) -> Result<Box<dyn DiskFS>,DYNERR> {
    match detect(&mut img,opts.leniency) {
        Some((tag,_)) => mount_as(tag,img,opts),
        None => Err(Box::new(super::Error::FileSystemMismatch))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::MountMode;
    use crate::img::{CreateParams,WrapperKind};

    #[test]
    fn candidate_order() {
        let tags: Vec<FormatTag> = CANDIDATES.iter().map(|c| c.tag).collect();
        assert_eq!(tags[0],FormatTag::MacPart);
        assert_eq!(tags[15],FormatTag::Fat);
        let dos = tags.iter().position(|t| *t==FormatTag::Dos33).unwrap();
        let pro = tags.iter().position(|t| *t==FormatTag::ProDos).unwrap();
        assert!(dos < pro);
        assert_eq!(CANDIDATES[11].orders,PRODOS_ORDER);
    }

    #[test]
    fn blank_image() {
        let mut img = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(1600)).unwrap();
        assert!(detect(&mut img,Leniency::Strict).is_none());
        assert!(detect_all(&mut img,Leniency::Strict).is_empty());
        assert!(mount(img,&MountOptions::new(MountMode::Full,Leniency::Strict)).is_err());
    }

    #[test]
    fn dos_order_found() {
        let img = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Dos)).unwrap();
        let fs = dos3x::Disk::format_img(img,"DOS254").unwrap();
        let mut img = DiskImg::open_bytes(&fs.img().normalized(),"dsk",false,false).unwrap();
        let found = detect(&mut img,Leniency::Strict);
        assert_eq!(found,Some((FormatTag::Dos33,Leniency::Strict)));
        assert_eq!(img.order(),SectorOrder::Dos);
    }
}
