use clap::{crate_version,Arg,ArgAction,Command,ValueHint};

const LONG_HELP: &str =
"diskimg is always invoked with exactly one subcommand.
Set RUST_LOG environment variable to control logging level.
  levels: trace,debug,info,warn,error

Examples:
---------
summarize an image:    `diskimg stat myimg.2mg`
list every file:       `diskimg catalog myimg.po.gz`
extract a file:        `diskimg get myimg.dsk HELLO > hello.bin`
extract from a volume: `diskimg get mydrive.hdv 2/SYSTEM/README`";

const LENIENCY_HELP: &str = "weakest test that may be used to recognize a file system,
`strict` demands a fully consistent volume, `lenient` accepts little more than a signature";

fn img_arg() -> Arg {
    Arg::new("dimg").value_name("PATH").help("path to disk image")
        .value_hint(ValueHint::FilePath)
        .required(true)
}

fn common_args(cmd: Command) -> Command {
    cmd.arg(img_arg())
        .arg(Arg::new("read-only").long("read-only").help("never modify the image").action(ArgAction::SetTrue))
        .arg(Arg::new("leniency").long("leniency").value_name("LEVEL").help("recognition leniency")
            .long_help(LENIENCY_HELP)
            .value_parser(["strict","moderate","lenient"])
            .default_value("lenient"))
        .arg(Arg::new("scan-only").long("scan-only").help("identify volumes without walking directories")
            .action(ArgAction::SetTrue))
}

pub fn build_cli() -> Command {
    let main_cmd = Command::new("diskimg")
        .about("Identifies retro disk images and reads the files inside them.")
        .after_long_help(LONG_HELP)
        .version(crate_version!())
        .arg(Arg::new("verbose").short('v').long("verbose").help("log at info level").action(ArgAction::SetTrue)
            .global(true));
    main_cmd
        .subcommand(common_args(Command::new("stat")
            .about("show wrapper, file system, volume name and free space")))
        .subcommand(common_args(Command::new("catalog")
            .about("list files recursively, including sub-volumes")))
        .subcommand(common_args(Command::new("get")
            .arg(Arg::new("file").value_name("FILE").help("path of file within the image, sub-volumes are selected by a leading index")
                .required(true))
            .arg(Arg::new("rsrc").long("rsrc").help("get the resource fork").action(ArgAction::SetTrue))
            .arg(Arg::new("hex").long("hex").help("display as hex dump").action(ArgAction::SetTrue))
            .about("write a file's data to stdout")))
}
