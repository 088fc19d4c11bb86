use clap::*;
use clap_num::maybe_hex;
use exhume_vmdk::{DiskImage, ReadControl, VMDKError};
use log::{debug, error, info, warn, LevelFilter};
use std::time::Duration;

struct Options {
    offset: u64,
    size: Option<u64>,
    disk_size: bool,
    info: bool,
    json: bool,
    hex: bool,
    no_parent: bool,
    timeout: Option<u64>,
}

fn open_image(file_path: &str, no_parent: bool) -> Result<DiskImage, VMDKError> {
    if no_parent {
        let mut image = DiskImage::new(file_path);
        image.process()?;
        return Ok(image);
    }
    DiskImage::open(file_path)
}

fn hex_dump(offset: u64, bytes: &[u8]) {
    for (i, line) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!("{:016x}  {:<47}  |{}|", offset + (i * 16) as u64, hex.join(" "), ascii);
    }
}

fn process_file(file_path: &str, options: &Options) -> Result<(), VMDKError> {
    info!("Processing the file '{}' in 'vmdk' format...", file_path);
    let mut image = open_image(file_path, options.no_parent)?;
    debug!("------------------------------------------------------------");
    info!("Snapshot chain depth: {}", image.chain_depth());
    debug!("------------------------------------------------------------");

    if options.info {
        if options.json {
            if let Some(descriptor) = image.descriptor() {
                match serde_json::to_string_pretty(descriptor) {
                    Ok(json) => println!("{}", json),
                    Err(e) => error!("Unable to serialize the descriptor: {}", e),
                }
            }
        } else {
            image.print_info();
        }
    }

    if options.disk_size {
        println!("{}", image.get_virtual_disk_size_bytes()?);
    }

    if let Some(size) = options.size {
        let mut control = ReadControl::new();
        if let Some(timeout) = options.timeout {
            control = control.with_timeout(Duration::from_millis(timeout));
        }
        let outcome = image.read_with(options.offset, size, &control)?;
        for issue in &outcome.issues {
            warn!("{}", issue);
        }
        if options.hex {
            hex_dump(options.offset, &outcome.data);
        } else {
            println!("{}", String::from_utf8_lossy(&outcome.data));
        }
    }
    image.close();
    Ok(())
}

fn main() {
    let matches = Command::new("exhume_vmdk")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Read the virtual disk of a VMDK image, following its snapshot chain.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the VMDK descriptor or monolithic sparse file."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .required_unless_present_any(["disk_size", "info"])
                .help("The size (in bytes) to read."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("Read at a specific offset of the virtual disk."),
        )
        .arg(
            Arg::new("disk_size")
                .long("disk-size")
                .action(ArgAction::SetTrue)
                .help("Print the virtual disk size in bytes."),
        )
        .arg(
            Arg::new("info")
                .long("info")
                .action(ArgAction::SetTrue)
                .help("Print the descriptor metadata of the image and its parents."),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .requires("info")
                .help("Print the descriptor metadata as JSON."),
        )
        .arg(
            Arg::new("hex")
                .long("hex")
                .action(ArgAction::SetTrue)
                .help("Print the data as a hex dump."),
        )
        .arg(
            Arg::new("no_parent")
                .long("no-parent")
                .action(ArgAction::SetTrue)
                .help("Do not resolve the snapshot chain; unallocated grains read as zeros."),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("Abort the read after this many milliseconds."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    let log_level_str = matches
        .get_one::<String>("log_level")
        .map(String::as_str)
        .unwrap_or("info");
    let level_filter = match log_level_str {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    env_logger::Builder::new().filter_level(level_filter).init();

    let Some(file_path) = matches.get_one::<String>("body") else {
        error!("Missing body path");
        std::process::exit(1);
    };
    let options = Options {
        offset: matches.get_one::<u64>("offset").copied().unwrap_or(0),
        size: matches.get_one::<u64>("size").copied(),
        disk_size: matches.get_flag("disk_size"),
        info: matches.get_flag("info"),
        json: matches.get_flag("json"),
        hex: matches.get_flag("hex"),
        no_parent: matches.get_flag("no_parent"),
        timeout: matches.get_one::<u64>("timeout").copied(),
    };

    if let Err(e) = process_file(file_path, &options) {
        error!("{}", e);
        std::process::exit(1);
    }
}
