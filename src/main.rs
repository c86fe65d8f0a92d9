use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use log::info;

use btrfs_scan::dump::{self, Stats};
use btrfs_scan::image::ImageFile;
use btrfs_scan::partition;
use btrfs_scan::{parse, ParseOptions};

/// Catalog every inode of an unmounted btrfs filesystem image.
///
/// The image may be a bare btrfs volume or a whole-disk image with an
/// MBR/GPT partition table; in the latter case the first btrfs-looking
/// partition is used unless --offset or --partition says otherwise.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Params {
    /// Disk image to scan
    image: PathBuf,

    /// Byte offset of the partition holding the filesystem
    #[arg(long, conflicts_with = "partition")]
    offset: Option<u64>,

    /// Index of the partition-table entry to use
    #[arg(long)]
    partition: Option<usize>,

    /// Print the superblock summary and stop
    #[arg(long)]
    info: bool,

    /// Emit the catalog as JSON
    #[arg(long)]
    json: bool,

    /// Emit the catalog as CSV
    #[arg(long, conflicts_with = "json")]
    csv: bool,

    /// Append aggregate statistics
    #[arg(long)]
    stats: bool,

    /// Progress output on stderr
    #[arg(short, long)]
    verbose: bool,
}

fn resolve_offset(params: &Params) -> anyhow::Result<u64> {
    if let Some(offset) = params.offset {
        return Ok(offset);
    }

    let image = ImageFile::open(&params.image)
        .with_context(|| format!("cannot open {}", params.image.display()))?;
    let partitions = partition::scan_partitions(&image)?;

    if let Some(index) = params.partition {
        let part = partitions
            .get(index)
            .with_context(|| format!("partition {index} not found ({} in table)", partitions.len()))?;
        return Ok(part.start_byte);
    }

    for part in &partitions {
        if partition::is_btrfs_at(&image, part.start_byte) {
            info!(
                "using partition {} at byte offset {}",
                part.index, part.start_byte
            );
            return Ok(part.start_byte);
        }
    }
    if !partitions.is_empty() && !partition::is_btrfs_at(&image, 0) {
        bail!("no btrfs partition found in the partition table");
    }
    Ok(0)
}

fn main() -> anyhow::Result<()> {
    let params = Params::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if params.verbose { "info" } else { "warn" },
    ))
    .init();

    let offset = resolve_offset(&params)?;
    let options = ParseOptions {
        info_only: params.info,
        verbose: params.verbose,
    };

    let (superblock, entries) = parse(&params.image, offset, options)
        .with_context(|| format!("cannot parse {}", params.image.display()))?;

    if params.info {
        dump::print_superblock(&superblock);
        return Ok(());
    }

    if params.json {
        dump::print_json(&entries)?;
    } else if params.csv {
        dump::print_csv(&entries);
    } else {
        dump::print_superblock(&superblock);
        println!();
        dump::print_console(&entries);
    }

    if params.stats {
        println!();
        Stats::collect(&entries).print();
    }

    Ok(())
}
