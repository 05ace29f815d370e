use std::fs;
use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};
use log::info;

use its_flash::{FlashDeviceInfo, RamFlash};
use its_flash_fs::{Error, FileFlags, FileId, FsConfig, ItsFs, FILE_ID_SIZE};

/// Inspect and edit flash images of the trusted storage filesystem.
///
/// The image file holds the raw contents of the emulated flash device,
/// block 0 first. All geometry options must match the ones the image was
/// formatted with.
#[derive(Parser, Debug)]
#[clap(about, author)]
struct Args {
    /// Flash image file to operate on.
    image: PathBuf,

    /// Erase block size in bytes.
    #[clap(long, default_value_t = 2048)]
    block_size: usize,

    /// Number of erase blocks.
    #[clap(long, default_value_t = 8)]
    num_blocks: u32,

    /// Sector size in bytes.
    #[clap(long, default_value_t = 512)]
    sector_size: usize,

    /// Program unit in bytes.
    #[clap(long, default_value_t = 1)]
    program_unit: usize,

    /// Largest supported file size in bytes.
    #[clap(long, default_value_t = 2048)]
    max_file_size: usize,

    /// Number of file-table slots.
    #[clap(long, default_value_t = 16)]
    max_files: u32,

    /// Trust metadata read back from the image instead of validating it.
    #[clap(long)]
    no_validate: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create (or overwrite) the image with an empty filesystem.
    Format,
    /// List all files.
    Ls,
    /// Show the metadata of one file.
    Info { id: String },
    /// Print a file's contents as hex, or write them to a file.
    Get {
        id: String,
        /// Write the raw contents here instead of hex-dumping to stdout.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Store a file from the given path.
    Put {
        id: String,
        file: PathBuf,
        /// Reserved size (default: the input file's size).
        #[clap(long)]
        max_size: Option<usize>,
        /// Make the file immutable.
        #[clap(long)]
        write_once: bool,
    },
    /// Delete a file.
    Del { id: String },
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("error: {err}");
        exit(1);
    }
}

fn run(args: &Args) -> Result<(), String> {
    let info = FlashDeviceInfo {
        base_addr: 0,
        sector_size: args.sector_size,
        block_size: args.block_size,
        num_blocks: args.num_blocks,
        program_unit: args.program_unit,
        max_file_size: args.max_file_size,
        max_num_files: args.max_files,
        erase_val: 0xff,
    };
    let config = FsConfig {
        validate_on_read: !args.no_validate,
    };

    if let Command::Format = args.command {
        let mut fs = ItsFs::new(RamFlash::new(info), config).map_err(describe)?;
        fs.wipe_all().map_err(describe)?;
        info!("formatted {} blocks of {} bytes", info.num_blocks, info.block_size);
        return save(args, fs.into_flash());
    }

    let image = fs::read(&args.image)
        .map_err(|err| format!("cannot read {}: {}", args.image.display(), err))?;
    let flash = RamFlash::from_image(info, &image)
        .map_err(|_| "image size does not match the geometry".to_string())?;
    let mut fs = ItsFs::new(flash, config).map_err(describe)?;
    fs.prepare().map_err(describe)?;

    match &args.command {
        Command::Format => unreachable!(),
        Command::Ls => {
            fs.for_each_file(|id, info| {
                println!(
                    "{:<24} {:>8} / {:<8} {}",
                    display_id(id),
                    info.size_current,
                    info.size_max,
                    flag_names(info.flags),
                );
            })
            .map_err(describe)?;
        }
        Command::Info { id } => {
            let info = fs.file_get_info(&parse_id(id)?).map_err(describe)?;
            println!("size:     {}", info.size_current);
            println!("reserved: {}", info.size_max);
            println!("flags:    {}", flag_names(info.flags));
        }
        Command::Get { id, output } => {
            let id = parse_id(id)?;
            let info = fs.file_get_info(&id).map_err(describe)?;
            let mut data = vec![0u8; info.size_current];
            fs.file_read(&id, 0, &mut data).map_err(describe)?;
            match output {
                Some(path) => fs::write(path, &data)
                    .map_err(|err| format!("cannot write {}: {}", path.display(), err))?,
                None => println!("{}", hex::encode(&data)),
            }
        }
        Command::Put {
            id,
            file,
            max_size,
            write_once,
        } => {
            let data = fs::read(file)
                .map_err(|err| format!("cannot read {}: {}", file.display(), err))?;
            let flags = if *write_once {
                FileFlags::WRITE_ONCE
            } else {
                FileFlags::empty()
            };
            fs.file_create(&parse_id(id)?, (*max_size).unwrap_or(data.len()), flags, &data)
                .map_err(describe)?;
            info!("stored {} bytes", data.len());
            return save(args, fs.into_flash());
        }
        Command::Del { id } => {
            fs.file_delete(&parse_id(id)?).map_err(describe)?;
            return save(args, fs.into_flash());
        }
    }
    Ok(())
}

fn save(args: &Args, flash: RamFlash) -> Result<(), String> {
    fs::write(&args.image, flash.image())
        .map_err(|err| format!("cannot write {}: {}", args.image.display(), err))
}

fn parse_id(s: &str) -> Result<FileId, String> {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() > FILE_ID_SIZE {
        return Err(format!("file ids are 1 to {FILE_ID_SIZE} bytes"));
    }
    let mut id = [0u8; FILE_ID_SIZE];
    id[..bytes.len()].copy_from_slice(bytes);
    Ok(FileId(id))
}

/// Ids are raw bytes; show them as text when they are printable and as
/// hex otherwise.
fn display_id(id: &FileId) -> String {
    let trimmed: Vec<u8> = {
        let mut bytes = id.0.to_vec();
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        bytes
    };
    if trimmed.iter().all(|b| b.is_ascii_graphic()) {
        String::from_utf8_lossy(&trimmed).into_owned()
    } else {
        hex::encode(id.0)
    }
}

fn flag_names(flags: FileFlags) -> &'static str {
    if flags.contains(FileFlags::WRITE_ONCE) {
        "write-once"
    } else {
        "-"
    }
}

fn describe(err: Error) -> String {
    match err {
        Error::InvalidArgument => "invalid argument".into(),
        Error::DoesNotExist => "no such file".into(),
        Error::InsufficientStorage => "not enough space".into(),
        Error::DataCorrupt => "metadata failed validation; the image is corrupt".into(),
        Error::StorageFailure => "no valid filesystem in the image (format it first?)".into(),
        Error::NotPermitted => "the file is write-once".into(),
        Error::Internal => "internal error".into(),
    }
}
