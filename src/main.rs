//! # Command Line Interface
//!
//! Thin inspection front end over the library: `stat`, `catalog` and `get`.

use std::io::Write;
use std::path::Path;
use clap::ArgMatches;
use log::error;
use diskimg::fs::{DiskFS,Leniency,MountMode};
use diskimg::{Options,DYNERR,STDRESULT};

mod cli;

const RCH: &str = "unreachable was reached";

fn options(cmd: &ArgMatches) -> Options {
    let leniency = match cmd.get_one::<String>("leniency").map(|s| s.as_str()) {
        Some("strict") => Leniency::Strict,
        Some("moderate") => Leniency::Moderate,
        _ => Leniency::Lenient
    };
    Options {
        leniency,
        read_only: cmd.get_flag("read-only"),
        mode: match cmd.get_flag("scan-only") {
            true => MountMode::ScanOnly,
            false => MountMode::Full
        },
        ..Options::default()
    }
}

fn mount(cmd: &ArgMatches) -> Result<Box<dyn DiskFS>,DYNERR> {
    let path = cmd.get_one::<String>("dimg").expect(RCH);
    diskimg::open_and_mount(Path::new(path),&options(cmd))
}

fn stat(disk: &dyn DiskFS,indent: usize) -> STDRESULT {
    let pad = " ".repeat(indent);
    if indent==0 {
        let img = disk.img();
        if let Some(outer) = img.outer_kind() {
            println!("{}container: {:?}",pad,outer);
        }
        if let Some(kind) = img.wrapper_kind() {
            println!("{}wrapper: {}",pad,kind);
        }
    }
    println!("{}file system: {}",pad,disk.fs_name());
    println!("{}volume: {}",pad,disk.volume_id());
    let free = disk.free_space()?;
    println!("{}free: {} of {} units ({} bytes each)",pad,free.free,free.total,free.unit_size);
    if !disk.is_good() {
        println!("{}damaged, modifications refused",pad);
    }
    for note in disk.notes() {
        println!("{}note: {}",pad,note);
    }
    for (i,sub) in disk.sub_volumes().iter().enumerate() {
        println!("{}sub-volume {}: {} (block {}, {} blocks)",pad,i,sub.name,sub.start_block,sub.num_blocks);
        if let Some(fs) = &sub.fs {
            stat(fs.as_ref(),indent + 4)?;
        }
    }
    Ok(())
}

fn catalog(disk: &dyn DiskFS,prefix: &str) {
    let mut curr = disk.next_file(None);
    while let Some(idx) = curr {
        let f = &disk.files()[idx];
        let len = match f.rsrc_len {
            Some(r) => format!("{}+{}",f.data_len,r),
            None => f.data_len.to_string()
        };
        let modified = match f.modified {
            Some(t) => t.format("%d-%b-%y %H:%M").to_string(),
            None => "<NO DATE>".to_string()
        };
        let flag = match f.quality {
            diskimg::fs::Quality::Good => ' ',
            _ => '!'
        };
        println!("{}{}{:<40} {:<4} {:>12} {}",flag,prefix,f.path,f.type_name(),len,modified);
        curr = disk.next_file(Some(idx));
    }
    for (i,sub) in disk.sub_volumes().iter().enumerate() {
        match &sub.fs {
            Some(fs) => catalog(fs.as_ref(),&format!("{}{}/",prefix,i)),
            None => println!(" {}{}/ <{} not recognized>",prefix,i,sub.name)
        }
    }
}

/// Walk leading numeric components into sub-volumes, then read the file
fn get(disk: &mut dyn DiskFS,path: &str,rsrc: bool) -> Result<Vec<u8>,DYNERR> {
    if !disk.sub_volumes().is_empty() {
        if let Some((head,tail)) = path.split_once('/') {
            if let Ok(i) = head.parse::<usize>() {
                let sub = disk.sub_volumes_mut().get_mut(i).ok_or(diskimg::fs::Error::FileNotFound)?;
                let fs = sub.fs.as_mut().ok_or(diskimg::fs::Error::FileSystemMismatch)?;
                return get(fs.as_mut(),tail,rsrc);
            }
        }
    }
    disk.read_file(path,rsrc)
}

fn main() -> Result<(),Box<dyn std::error::Error>>
{
    let matches = cli::build_cli().get_matches();
    let level = match matches.get_flag("verbose") {
        true => "info",
        false => "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Some(cmd) = matches.subcommand_matches("stat") {
        let disk = mount(cmd)?;
        return stat(disk.as_ref(),0);
    }
    if let Some(cmd) = matches.subcommand_matches("catalog") {
        let disk = mount(cmd)?;
        if !disk.fully_enumerated() {
            eprintln!("listing is incomplete, see `stat` for notes");
        }
        catalog(disk.as_ref(),"");
        return Ok(());
    }
    if let Some(cmd) = matches.subcommand_matches("get") {
        let mut disk = mount(cmd)?;
        let path = cmd.get_one::<String>("file").expect(RCH);
        let dat = match get(disk.as_mut(),path,cmd.get_flag("rsrc")) {
            Ok(d) => d,
            Err(e) => {
                error!("could not read {}: {}",path,e);
                return Err(e);
            }
        };
        if cmd.get_flag("hex") {
            diskimg::display_block(0,&dat);
        } else {
            std::io::stdout().write_all(&dat)?;
        }
        return Ok(());
    }
    eprintln!("No subcommand was found, try `diskimg --help`");
    Ok(())
}
