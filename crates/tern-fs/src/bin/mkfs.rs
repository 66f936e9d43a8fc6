use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tern_fs::disk::FileDisk;
use tern_fs::mkfs;

/// Create an empty tern file system in a disk image file.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the disk image to create.
    image: PathBuf,

    /// Total number of disk blocks, including the boot sector.
    #[clap(long, default_value_t = 1426)]
    blocks: i32,

    /// Number of inodes in the inode table.
    #[clap(long, default_value_t = 455)]
    inodes: i32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut disk = FileDisk::create(&args.image, args.blocks)
        .with_context(|| format!("creating image {:?}", args.image))?;
    mkfs::format(&mut disk, args.blocks, args.inodes)?;

    println!(
        "formatted {}: {} blocks, {} inodes",
        args.image.display(),
        args.blocks,
        args.inodes
    );
    Ok(())
}
