// test of containers holding nested volumes
use diskimg::fs::{dos3x,prodos,DiskFS,FileKind,FileInfo};
use diskimg::fs::container::{unidos,ozdos,cffa,Partition};
use diskimg::img::{CreateParams,DiskImg,WrapperKind};
use diskimg::Options;

fn text(len: usize,seed: u8) -> Vec<u8> {
    (0..len).map(|i| 0xc1 + ((i + seed as usize) % 26) as u8).collect()
}

/// Format DOS on each partition of a new 800K image and store one file in each
fn dos_pair(parts: Vec<Partition>) -> Vec<u8> {
    let parent = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(1600)).expect("create failed");
    for (i,p) in parts.iter().enumerate() {
        let child = p.open(&parent).expect("partition failed");
        let mut fs = dos3x::Disk::format_img(child,&format!("{}",i+1)).expect("format failed");
        let name = format!("VOLUME{}",i+1);
        fs.create_file(&name,FileKind::File,&FileInfo { file_type: 0x04, ..Default::default() }).expect("create failed");
        fs.write_file(&name,false,&text(5000,i as u8)).expect("write failed");
    }
    parent.normalized()
}

fn check_pair(buf: &[u8],fs_name: &str) {
    let mut fs = diskimg::open_and_mount_bytes(buf,"po",&Options::default()).expect("mount failed");
    assert_eq!(fs.fs_name(),fs_name);
    assert!(fs.is_good());
    assert_eq!(fs.sub_volumes().len(),2);
    for i in 0..2 {
        let sub = fs.sub_volumes_mut()[i].fs.as_mut().expect("sub-volume not mounted");
        assert_eq!(sub.fs_name(),"DOS 3.3");
        assert_eq!(sub.volume_name(),format!("DOS{:03}",i+1));
        assert_eq!(sub.free_space().expect("free space failed").total,1600);
        let name = format!("VOLUME{}",i+1);
        assert_eq!(sub.read_file(&name,false).expect("read failed"),text(5000,i as u8));
    }
}

#[test]
fn unidos() {
    check_pair(&dos_pair(unidos::partitions()),"UNIDOS");
}

#[test]
fn ozdos() {
    check_pair(&dos_pair(ozdos::partitions()),"OzDOS");
}

#[test]
fn write_through_sub_volume() {
    let buf = dos_pair(unidos::partitions());
    let mut fs = diskimg::open_and_mount_bytes(&buf,"po",&Options::default()).expect("mount failed");
    {
        let sub = fs.sub_volumes_mut()[1].fs.as_mut().expect("sub-volume not mounted");
        sub.create_file("EXTRA",FileKind::File,&FileInfo { file_type: 0x04, ..Default::default() }).expect("create failed");
        sub.write_file("EXTRA",false,&text(700,9)).expect("write failed");
    }
    assert!(fs.img().is_dirty());
    let again = fs.img_mut().to_bytes().expect("serialize failed");
    let mut fs = diskimg::open_and_mount_bytes(&again,"po",&Options::default()).expect("mount failed");
    let sub = fs.sub_volumes_mut()[1].fs.as_mut().expect("sub-volume not mounted");
    assert_eq!(sub.read_file("EXTRA",false).expect("read failed"),text(700,9));
    let first = fs.sub_volumes()[0].fs.as_ref().expect("sub-volume not mounted");
    assert!(first.find("EXTRA").is_none());
}

#[test]
fn cffa_partitions() {
    let total = cffa::PARTITION_BLOCKS + 1600;
    let parent = DiskImg::create(WrapperKind::Raw,&CreateParams::blocks(total)).expect("create failed");
    for (i,p) in cffa::partitions(total).iter().enumerate() {
        let child = p.open(&parent).expect("partition failed");
        let mut fs = prodos::Disk::format_img(child,&format!("PART{}",i+1)).expect("format failed");
        fs.create_file("README",FileKind::File,&FileInfo { file_type: 0x04, ..Default::default() }).expect("create failed");
        fs.write_file("README",false,&text(1000,i as u8)).expect("write failed");
    }
    let fs = diskimg::open_and_mount_bytes(&parent.normalized(),"hdv",&Options::default()).expect("mount failed");
    assert_eq!(fs.fs_name(),"CFFA");
    let subs = fs.sub_volumes();
    assert_eq!(subs.len(),2);
    assert_eq!(subs[1].start_block,cffa::PARTITION_BLOCKS);
    assert_eq!(subs[1].num_blocks,1600);
    let names: Vec<String> = subs.iter().filter_map(|s| s.fs.as_ref()).map(|f| f.volume_name()).collect();
    assert_eq!(names,vec!["PART1".to_string(),"PART2".to_string()]);
    assert_eq!(fs.free_space().expect("free space failed").free,0);
}
