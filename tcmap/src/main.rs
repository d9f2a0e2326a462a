mod dm;

use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use tcvol::keyfile::{MAX_KEYFILES, MAX_PASSSZ};
use tcvol::safemem::SecureBuf;
use thiserror::Error;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum MapError {
    /// Wrapper for [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html)
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),

    /// Core volume failure; carries the user-facing message verbatim
    #[error("{0}")]
    Volume(#[from] tcvol::VolumeError),

    /// Device-mapper driver failure
    #[error("device-mapper: {0}")]
    Dm(#[from] devicemapper::DmError),

    /// Keyfile count exceeds the supported bound
    #[error("too many keyfiles (at most 256 are supported)")]
    TooManyKeyfiles,
}

/// Inspects and maps TrueCrypt volumes through dm-crypt
#[derive(Parser, Debug)]
#[command(name = "tcmap", version, about)]
#[command(group = ArgGroup::new("action").required(true).args(["info", "map"]))]
struct Args {
    /// Print information about the volume instead of mapping it
    #[arg(short, long)]
    info: bool,

    /// Create a dm-crypt mapping with this name for the volume
    #[arg(short, long, value_name = "NAME")]
    map: Option<String>,

    /// Path to the volume to operate on (e.g. /dev/sda1)
    #[arg(short, long, value_name = "PATH")]
    device: PathBuf,

    /// The volume is part of system encryption; read the primary header
    /// from this disk (e.g. /dev/sda)
    #[arg(short, long, value_name = "DISK")]
    system: Option<PathBuf>,

    /// Keyfile to combine with the passphrase; may be repeated
    #[arg(short, long, value_name = "PATH")]
    keyfile: Vec<PathBuf>,

    /// Protect a hidden volume when mapping the outer volume (reserved)
    #[arg(short = 'e', long)]
    protect_hidden: bool,
}

/// Prompts on the controlling terminal with echo disabled
///
/// Falls back to stdin when no terminal is available; the trailing newline
/// is stripped and the transient line is wiped after the copy into secure
/// memory.
fn read_passphrase() -> Result<SecureBuf, MapError> {
    let mut pass = SecureBuf::new(MAX_PASSSZ)?;
    let mut line = rpassword::prompt_password("Passphrase: ")?;
    let n = line.len().min(MAX_PASSSZ - 1);
    pass[..n].copy_from_slice(&line.as_bytes()[..n]);
    line.zeroize();
    Ok(pass)
}

fn print_info(info: &tcvol::VolumeInfo) {
    println!("PBKDF2 PRF:\t\t{}", info.prf().hash);
    println!("PBKDF2 iterations:\t{}", info.prf().iterations);
    println!("Cipher:\t\t\t{}", info.cipher().name);
    println!("Key Length:\t\t{} bits", info.cipher().klen * 8);
    println!("CRC Key Data:\t\t{:#x}", info.hdr().crc_keys);
}

fn run(args: &Args) -> Result<(), MapError> {
    if args.keyfile.len() > MAX_KEYFILES {
        return Err(MapError::TooManyKeyfiles);
    }
    if args.protect_hidden {
        warn!("hidden volume protection is accepted but not implemented");
    }

    let mut pass = read_passphrase()?;
    let info = tcvol::open_volume(
        &args.device,
        args.system.as_deref(),
        &mut pass,
        &args.keyfile,
    )?;

    if let Some(map_name) = &args.map {
        dm::dm_setup(map_name, &info)?;
        println!("All ok!");
    } else {
        print_info(&info);
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
