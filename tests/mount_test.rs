// test of recognition and mounting through the public entry points
use std::collections::HashSet;
use diskimg::fs::{dos3x,prodos,pascal,registry,DiskFS,FileKind,FileInfo,Leniency,MountMode,MountOptions};
use diskimg::fs::registry::FormatTag;
use diskimg::img::{CreateParams,DiskImg,SectorOrder,WrapperKind};
use diskimg::Options;

fn binary(load: u16,len: usize) -> Vec<u8> {
    let mut ans = u16::to_le_bytes(load).to_vec();
    ans.extend_from_slice(&u16::to_le_bytes(len as u16));
    ans.extend((0..len).map(|i| (i % 211) as u8));
    ans
}

fn dos_fixture() -> Vec<u8> {
    let img = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::Dos)).expect("create failed");
    let mut fs = dos3x::Disk::format_img(img,"254").expect("format failed");
    for (i,name) in ["HELLO","WORLD","SPRITES"].iter().enumerate() {
        fs.create_file(name,FileKind::File,&FileInfo { file_type: 0x06, ..Default::default() }).expect("create failed");
        fs.write_file(name,false,&binary(0x2000,1000 + 3000*i)).expect("write failed");
    }
    fs.img().normalized()
}

fn prodos_fixture() -> Vec<u8> {
    let img = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::ProDos)).expect("create failed");
    let mut fs = prodos::Disk::format_img(img,"FIXTURE").expect("format failed");
    fs.create_file("SUB",FileKind::Directory,&FileInfo::default()).expect("mkdir failed");
    fs.create_file("SUB/DATA",FileKind::File,&FileInfo { file_type: 0x06, aux_type: 0x4000, ..Default::default() }).expect("create failed");
    fs.write_file("SUB/DATA",false,&binary(0x4000,5000)).expect("write failed");
    fs.img().normalized()
}

fn pascal_fixture() -> Vec<u8> {
    let img = DiskImg::create(WrapperKind::Raw,&CreateParams::dos_525(SectorOrder::ProDos)).expect("create failed");
    let mut fs = pascal::Disk::format_img(img,"PFIX").expect("format failed");
    fs.create_file("CODE",FileKind::File,&FileInfo { file_type: 0x06, ..Default::default() }).expect("create failed");
    fs.write_file("CODE",false,&binary(0,3000)).expect("write failed");
    fs.img().normalized()
}

#[test]
fn dos254_scenario() {
    let mut fs = diskimg::open_and_mount_bytes(&dos_fixture(),"do",&Options::default()).expect("mount failed");
    assert_eq!(fs.volume_name(),"DOS254");
    assert_eq!(fs.files().len(),3);
    let free = fs.free_space().expect("free space failed");
    assert!(free.free < 528);
    let names: Vec<String> = fs.files().iter().map(|f| f.path.clone()).collect();
    for name in names {
        fs.delete_file(&name).expect("delete failed");
    }
    fs.rescan().expect("rescan failed");
    assert!(fs.files().is_empty());
    assert_eq!(fs.free_space().expect("free space failed").free,528);
}

#[test]
fn strict_picks_one() {
    let cases = [
        (dos_fixture(),FormatTag::Dos33,SectorOrder::Dos),
        (prodos_fixture(),FormatTag::ProDos,SectorOrder::ProDos),
        (pascal_fixture(),FormatTag::Pascal,SectorOrder::ProDos)
    ];
    for (buf,tag,order) in cases {
        let mut img = DiskImg::open_bytes(&buf,"dsk",false,false).expect("open failed");
        let found = registry::detect_all(&mut img,Leniency::Strict);
        assert_eq!(found.first(),Some(&(tag,order)));
        let tags: HashSet<String> = found.iter().map(|(t,_)| t.to_string()).collect();
        assert_eq!(tags.len(),1,"{} matched {:?}",tag,found);
        assert_eq!(registry::detect(&mut img,Leniency::Strict),Some((tag,Leniency::Strict)));
        assert_eq!(img.order(),order);
    }
}

#[test]
fn allocation_invariant() {
    for buf in [dos_fixture(),prodos_fixture(),pascal_fixture()] {
        let mut fs = diskimg::open_and_mount_bytes(&buf,"dsk",&Options::default()).expect("mount failed");
        let usage = fs.scan_usage().expect("scan failed");
        let free = fs.free_space().expect("free space failed");
        assert_eq!(usage.conflicts(),0);
        assert_eq!(usage.in_use() + free.free,free.total,"{}",fs.volume_id());
        assert!(fs.is_good());
    }
}

#[test]
fn damaged_disk_refuses_writes() {
    let mut buf = dos_fixture();
    // mark the catalog track free in the VTOC bitmap
    let vtoc = 17*16*256;
    buf[vtoc + 0x38 + 17*4] = 0xff;
    buf[vtoc + 0x38 + 17*4 + 1] = 0xff;
    let mut fs = diskimg::open_and_mount_bytes(&buf,"do",&Options::default()).expect("mount failed");
    assert!(!fs.is_good());
    assert!(!fs.notes().is_empty());
    let before = fs.img().normalized();
    let guard = |e: Box<dyn std::error::Error>| matches!(e.downcast_ref::<diskimg::fs::Error>(),Some(diskimg::fs::Error::Damaged));
    assert!(guard(fs.create_file("NEW",FileKind::File,&FileInfo::default()).unwrap_err()));
    assert!(guard(fs.delete_file("HELLO").unwrap_err()));
    assert!(guard(fs.rename_file("HELLO","GOODBYE").unwrap_err()));
    assert!(guard(fs.set_file_info("HELLO",&FileInfo { file_type: 0x04, ..Default::default() }).unwrap_err()));
    assert!(guard(fs.format("001").unwrap_err()));
    assert!(guard(fs.write_file("HELLO",false,&[1,2,3]).unwrap_err()));
    assert!(!fs.img().is_dirty());
    assert_eq!(fs.img().normalized(),before);
    // reading is still allowed
    assert_eq!(fs.read_file("HELLO",false).expect("read failed"),binary(0x2000,1000));
}

#[test]
fn read_only_options() {
    let opt = Options { read_only: true, ..Options::default() };
    let mut fs = diskimg::open_and_mount_bytes(&prodos_fixture(),"po",&opt).expect("mount failed");
    let err = fs.delete_file("SUB/DATA").unwrap_err();
    assert!(matches!(err.downcast_ref::<diskimg::fs::Error>(),Some(diskimg::fs::Error::ReadOnly)));
    let opt = Options { mode: MountMode::ScanOnly, ..Options::default() };
    let fs = diskimg::open_and_mount_bytes(&prodos_fixture(),"po",&opt).expect("mount failed");
    assert_eq!(fs.volume_name(),"FIXTURE");
    assert!(fs.files().is_empty());
}

#[test]
fn leniency_floor() {
    let mut buf = dos_fixture();
    // end the catalog early so only weaker tests pass
    let cat2 = (17*16 + 2)*256;
    buf[cat2 + 1] = 0;
    buf[cat2 + 2] = 0;
    let img = DiskImg::open_bytes(&buf,"do",false,false).expect("open failed");
    assert!(registry::mount(img,&MountOptions::new(MountMode::ReadOnly,Leniency::Strict)).is_err());
    let mut img = DiskImg::open_bytes(&buf,"do",false,false).expect("open failed");
    let found = registry::detect(&mut img,Leniency::Lenient);
    assert!(matches!(found,Some((FormatTag::Dos33,l)) if l > Leniency::Strict));
}

#[test]
fn forced_mount_rejects_bad_geometry() {
    let mut buf = dos_fixture();
    // VTOC claims 40 sectors per track
    buf[17*16*256 + 0x35] = 40;
    for leniency in [Leniency::Strict,Leniency::Lenient] {
        let img = DiskImg::open_bytes(&buf,"do",false,false).expect("open failed");
        let err = registry::mount_as(FormatTag::Dos33,img,&MountOptions::new(MountMode::Full,leniency)).err().expect("mount should fail");
        assert!(matches!(err.downcast_ref::<diskimg::fs::Error>(),Some(diskimg::fs::Error::FileSystemMismatch)));
    }
    // 32 sectors is legal for DOS, but not on 16 sector tracks
    buf[17*16*256 + 0x35] = 32;
    let img = DiskImg::open_bytes(&buf,"do",false,false).expect("open failed");
    assert!(registry::mount_as(FormatTag::Dos33,img,&MountOptions::new(MountMode::ReadOnly,Leniency::Lenient)).is_err());
}

#[test]
fn path_round_trip() {
    let dir = tempfile::tempdir().expect("no temp dir");
    let path = dir.path().join("fixture.po");
    std::fs::write(&path,prodos_fixture()).expect("write failed");
    {
        let mut fs = diskimg::open_and_mount(&path,&Options::default()).expect("mount failed");
        fs.create_file("SUB/NOTES",FileKind::File,&FileInfo { file_type: 0x04, ..Default::default() }).expect("create failed");
        fs.write_file("SUB/NOTES",false,b"REMEMBER THE MILK\r").expect("write failed");
        fs.rename_file("SUB/DATA","PICTURE").expect("rename failed");
        fs.flush().expect("flush failed");
    }
    let mut fs = diskimg::open_and_mount(&path,&Options::default()).expect("mount failed");
    assert_eq!(fs.read_file("sub/notes",false).expect("read failed"),b"REMEMBER THE MILK\r".to_vec());
    assert!(fs.find("SUB/DATA").is_none());
    let idx = fs.find("SUB/PICTURE").expect("renamed file missing");
    assert_eq!(fs.files()[idx].aux_type,0x4000);
    assert_eq!(fs.files()[idx].type_name(),"BIN");
}
