// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use block::qcow::QcowFile;
use block::{
    detect_image_format, open_base, open_disk, wait_for, BlockDispatcher, BlockMode, DiskConfig,
    ImageFormat, IoBuffer,
};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "vblk", version, about = "Serve disk images through block dispatchers")]
struct CliArgs {
    /// Increase logging verbosity, may be repeated
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Print the capacity and format of a disk image
    Info {
        #[command(flatten)]
        disk: DiskArgs,
    },

    /// Read a range of the disk
    Read {
        #[command(flatten)]
        disk: DiskArgs,

        /// Byte offset of the range, sector aligned
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Length of the range in bytes, sector aligned
        #[arg(long)]
        length: u64,

        /// File receiving the data, stdout if not set
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a byte pattern to a range of the disk, then read it back
    Write {
        #[command(flatten)]
        disk: DiskArgs,

        /// Byte offset of the range, sector aligned
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Length of the range in bytes, sector aligned
        #[arg(long)]
        length: u64,

        /// Byte written over the whole range
        #[arg(long, default_value_t = 0)]
        pattern: u8,
    },
}

#[derive(Args, Debug)]
struct DiskArgs {
    /// Path to the disk image
    #[arg(long, required_unless_present = "config")]
    disk: Option<PathBuf>,

    /// JSON disk configuration, replaces the other disk options
    #[arg(long, conflicts_with = "disk")]
    config: Option<PathBuf>,

    /// Image format (raw|qcow2), detected from the image if not set
    #[arg(long)]
    format: Option<ImageFormat>,

    /// How writes reach the image (read-only|read-write|volatile-write)
    #[arg(long, default_value_t = BlockMode::ReadOnly)]
    mode: BlockMode,

    /// Never serve the image from a shared mapping
    #[arg(long)]
    no_map: bool,

    /// Number of worker threads serving host I/O
    #[arg(long, default_value_t = block::DEFAULT_IO_THREADS)]
    io_threads: usize,
}

impl DiskArgs {
    fn into_config(self) -> anyhow::Result<DiskConfig> {
        if let Some(path) = self.config {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read disk configuration {path:?}"))?;
            return serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse disk configuration {path:?}"));
        }

        let path = self.disk.ok_or_else(|| anyhow!("Missing disk path"))?;
        let mut config = DiskConfig::new(path);
        config.format = self.format;
        config.mode = self.mode;
        config.direct_map = !self.no_map;
        config.io_threads = self.io_threads;
        Ok(config)
    }
}

fn open(config: &DiskConfig) -> anyhow::Result<Arc<dyn BlockDispatcher>> {
    wait_for(|c| open_disk(config, c))
        .with_context(|| format!("Failed to open disk {:?}", config.path))
}

fn info(config: &DiskConfig) -> anyhow::Result<()> {
    let base = open_base(config).with_context(|| format!("Failed to open {:?}", config.path))?;
    let format = match config.format {
        Some(format) => format,
        None => wait_for(|c| detect_image_format(base.as_ref(), c))
            .context("Failed to detect image format")?,
    };

    println!("path: {}", config.path.display());
    println!("format: {format}");
    println!("file size: {}", base.capacity());
    if format == ImageFormat::Qcow2 {
        let file = Arc::new(QcowFile::new());
        let header = wait_for(|c| file.load(base.clone(), c)).context("Failed to load image")?;
        println!("version: {}", header.version);
        println!("virtual size: {}", header.size);
        println!("cluster size: {}", header.cluster_size());
        println!("l1 entries: {}", header.l1_size);
        println!("snapshots: {}", header.nb_snapshots);
    }
    Ok(())
}

fn read(disk: &dyn BlockDispatcher, offset: u64, length: u64) -> anyhow::Result<Vec<u8>> {
    let buf = IoBuffer::new(usize::try_from(length).context("Length too large")?);
    wait_for(|c| disk.read_at(buf.clone(), offset, c))
        .with_context(|| format!("Failed to read {length} bytes at {offset:#x}"))?;
    Ok(buf.to_vec())
}

fn run(command: CliCommand) -> anyhow::Result<()> {
    match command {
        CliCommand::Info { disk } => info(&disk.into_config()?),
        CliCommand::Read {
            disk,
            offset,
            length,
            output,
        } => {
            let disk = open(&disk.into_config()?)?;
            let data = read(disk.as_ref(), offset, length)?;
            match output {
                Some(path) => File::create(&path)
                    .and_then(|mut f| f.write_all(&data))
                    .with_context(|| format!("Failed to write {path:?}")),
                None => io::stdout()
                    .lock()
                    .write_all(&data)
                    .context("Failed to write to stdout"),
            }
        }
        CliCommand::Write {
            disk,
            offset,
            length,
            pattern,
        } => {
            let config = disk.into_config()?;
            if config.mode == BlockMode::ReadOnly {
                bail!("Writing needs --mode read-write or --mode volatile-write");
            }
            let disk = open(&config)?;
            let len = usize::try_from(length).context("Length too large")?;
            let buf = IoBuffer::from_vec(vec![pattern; len]);
            wait_for(|c| disk.write_at(buf, offset, c))
                .with_context(|| format!("Failed to write {length} bytes at {offset:#x}"))?;

            let data = read(disk.as_ref(), offset, length)?;
            if data.iter().any(|&b| b != pattern) {
                bail!("Data read back at {offset:#x} differs from the pattern written");
            }
            wait_for(|c| disk.sync(c)).context("Failed to sync disk")?;
            println!("wrote {length} bytes at {offset:#x} ({})", config.mode);
            Ok(())
        }
    }
}

fn main() {
    let args = CliArgs::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(e) = run(args.command) {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}
