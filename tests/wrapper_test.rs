// test of image wrappers carrying a file system end to end
use diskimg::fs::{dos3x,prodos,DiskFS,FileKind,FileInfo};
use diskimg::img::{CreateParams,DiskImg,PhysicalFormat,SectorOrder,WrapperKind};
use diskimg::outer::{OuterKind,OuterWrapper};
use diskimg::Options;

/// high bit text, no zeros so DOS finds the true end
fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| 0xa0 + (i % 90) as u8).collect()
}

/// Format DOS 3.3 on a new image of the given wrapper, store one file, and serialize
fn dos_bytes(kind: WrapperKind,params: &CreateParams) -> Vec<u8> {
    let img = DiskImg::create(kind,params).expect("create failed");
    let mut fs = dos3x::Disk::format_img(img,"DOS254").expect("format failed");
    fs.create_file("HELLO",FileKind::File,&FileInfo { file_type: 0x04, ..Default::default() }).expect("create failed");
    fs.write_file("HELLO",false,&payload(3000)).expect("write failed");
    fs.img_mut().to_bytes().expect("serialize failed")
}

fn check_dos(buf: &[u8],ext: &str,kind: WrapperKind) {
    let mut fs = diskimg::open_and_mount_bytes(buf,ext,&Options::default()).expect("mount failed");
    assert_eq!(fs.img().wrapper_kind(),Some(kind));
    assert_eq!(fs.volume_name(),"DOS254");
    assert!(fs.is_good());
    assert_eq!(fs.read_file("HELLO",false).expect("read failed"),payload(3000));
}

#[test]
fn dos_on_sector_wrappers() {
    check_dos(&dos_bytes(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Dos)),"do",WrapperKind::Raw);
    check_dos(&dos_bytes(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::ProDos)),"dsk",WrapperKind::Raw);
    check_dos(&dos_bytes(WrapperKind::Dot2mg,&CreateParams::dos_525(SectorOrder::Dos)),"2mg",WrapperKind::Dot2mg);
    check_dos(&dos_bytes(WrapperKind::Ddd,&CreateParams::dos_525(SectorOrder::Dos)),"ddd",WrapperKind::Ddd);
    check_dos(&dos_bytes(WrapperKind::NuFX,&CreateParams::dos_525(SectorOrder::ProDos)),"sdk",WrapperKind::NuFX);
}

#[test]
fn dos_on_nibble_wrappers() {
    let mut nib = CreateParams::dos_525(SectorOrder::Physical);
    nib.phys = PhysicalFormat::Nib525_6656;
    check_dos(&dos_bytes(WrapperKind::RawNibble,&nib),"nib",WrapperKind::RawNibble);
    check_dos(&dos_bytes(WrapperKind::TrackStar,&CreateParams::dos_525(SectorOrder::Physical)),"app",WrapperKind::TrackStar);
    check_dos(&dos_bytes(WrapperKind::Dot2mg,&nib),"2mg",WrapperKind::Dot2mg);
}

#[test]
fn prodos_on_block_wrappers() {
    for kind in [WrapperKind::DiskCopy42,WrapperKind::Sim2e,WrapperKind::Dot2mg] {
        let img = DiskImg::create(kind,&CreateParams::blocks(1600)).expect("create failed");
        let mut fs = prodos::Disk::format_img(img,"BIG.DISK").expect("format failed");
        fs.create_file("DOCS",FileKind::Directory,&FileInfo::default()).expect("mkdir failed");
        fs.create_file("DOCS/README",FileKind::File,&FileInfo { file_type: 0x04, ..Default::default() }).expect("create failed");
        fs.write_file("DOCS/README",false,&payload(20000)).expect("write failed");
        let buf = fs.img_mut().to_bytes().expect("serialize failed");
        let mut fs = diskimg::open_and_mount_bytes(&buf,"",&Options::default()).expect("mount failed");
        assert_eq!(fs.img().wrapper_kind(),Some(kind));
        assert_eq!(fs.fs_name(),"ProDOS");
        assert_eq!(fs.fs_num_blocks(),1600);
        assert_eq!(fs.read_file("docs/readme",false).expect("read failed"),payload(20000));
    }
}

#[test]
fn prodos_2mg_header() {
    let img = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(280)).expect("create failed");
    let fs = prodos::Disk::format_img(img,"TWO.IMG").expect("format failed");
    let data = fs.img().normalized();
    let mut buf = vec![0;64];
    buf[0..4].copy_from_slice(b"2IMG");
    buf[4..8].copy_from_slice(b"TEST");
    buf[8..10].copy_from_slice(&64u16.to_le_bytes());
    buf[10..12].copy_from_slice(&1u16.to_le_bytes());
    buf[12..16].copy_from_slice(&1u32.to_le_bytes());
    buf[20..24].copy_from_slice(&280u32.to_le_bytes());
    buf[24..28].copy_from_slice(&64u32.to_le_bytes());
    buf[28..32].copy_from_slice(&(280u32*512).to_le_bytes());
    buf.extend_from_slice(&data);
    let fs = diskimg::open_and_mount_bytes(&buf,"2mg",&Options::default()).expect("mount failed");
    assert_eq!(fs.fs_name(),"ProDOS");
    assert_eq!(fs.volume_name(),"TWO.IMG");
    assert_eq!(fs.fs_num_blocks(),280);
}

#[test]
fn gzip_outer_wrapper() {
    let inner = dos_bytes(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Dos));
    let gz = OuterWrapper::new(OuterKind::Gzip).save(&inner).expect("gzip failed");
    let mut fs = diskimg::open_and_mount_bytes(&gz,"do",&Options::default()).expect("mount failed");
    assert_eq!(fs.img().outer_kind(),Some(OuterKind::Gzip));
    assert_eq!(fs.read_file("HELLO",false).expect("read failed"),payload(3000));
    fs.delete_file("HELLO").expect("delete failed");
    let again = fs.img_mut().to_bytes().expect("serialize failed");
    assert_eq!(diskimg::outer::test(&again),Some(OuterKind::Gzip));
    let fs = diskimg::open_and_mount_bytes(&again,"do",&Options::default()).expect("mount failed");
    assert!(fs.find("HELLO").is_none());
}

#[test]
fn expansion_bound() {
    let inner = dos_bytes(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Dos));
    let zip = OuterWrapper::new(OuterKind::Zip).save(&inner).expect("zip failed");
    let opt = Options { max_expanded: 100000, ..Options::default() };
    assert!(diskimg::open_and_mount_bytes(&zip,"do",&opt).is_err());
    assert!(diskimg::open_and_mount_bytes(&zip,"do",&Options::default()).is_ok());
}

#[test]
fn unrecognized_bytes() {
    let err = DiskImg::open_bytes(&[0x42;1000],"",false,false).err().expect("should fail");
    assert!(matches!(err.downcast_ref::<diskimg::img::Error>(),Some(diskimg::img::Error::UnrecognizedFormat)));
}
