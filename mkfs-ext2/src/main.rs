//! `mkfs.ext2`: formats a device or regular file as a fresh ext2 filesystem.

use std::env;
use std::path::PathBuf;
use std::process::exit;

const BIN_NAME: &str = "mkfs.ext2";
const DEFAULT_NUM_BLOCKS: u32 = 262144;

struct Args {
    device: PathBuf,
    block_size: u32,
    num_blocks: u32,
}

fn usage() -> ! {
    eprintln!(
        "Usage: {BIN_NAME} --device <path> [--blockSize <1024|2048|4096>] [--blocks <count>]"
    );
    exit(1);
}

fn parse_args() -> Args {
    let mut device = None;
    let mut block_size: u32 = 4096;
    let mut num_blocks: u32 = 0;

    let mut it = env::args_os().skip(1);
    while let Some(arg) = it.next() {
        let arg = match arg.into_string() {
            Ok(s) => s,
            Err(_) => usage(),
        };
        match arg.as_str() {
            "--device" => {
                let val = it.next().unwrap_or_else(|| usage());
                device = Some(PathBuf::from(val));
            }
            "--blockSize" => {
                let val = it.next().unwrap_or_else(|| usage());
                block_size = val
                    .to_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| usage());
            }
            "--blocks" => {
                let val = it.next().unwrap_or_else(|| usage());
                num_blocks = val
                    .to_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| usage());
            }
            _ => usage(),
        }
    }

    let Some(device) = device else { usage() };
    Args {
        device,
        block_size,
        num_blocks,
    }
}

fn main() {
    let args = parse_args();

    let num_blocks = if args.num_blocks != 0 {
        args.num_blocks
    } else {
        let disk_blocks = utils::disk::get_disk_size(&args.device)
            .unwrap_or_else(|e| utils::error(BIN_NAME, e))
            * 512
            / args.block_size as u64;
        if disk_blocks != 0 {
            disk_blocks as u32
        } else {
            DEFAULT_NUM_BLOCKS
        }
    };

    let summary = mkfs_ext2::make_ext2(&args.device, args.block_size, num_blocks)
        .unwrap_or_else(|e| utils::error(BIN_NAME, e));

    println!(
        "{BIN_NAME}: {} blocks of {} bytes, {} block group(s), {} free blocks, {} inodes ({} free)",
        summary.num_blocks,
        summary.block_size,
        summary.num_block_groups,
        summary.num_free_blocks,
        summary.num_inodes,
        summary.num_free_inodes,
    );
    println!(
        "{BIN_NAME}: volume id {}",
        summary
            .volume_id
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>()
    );
    println!(
        "{BIN_NAME}: superblock backups in group(s) {:?}",
        summary.backup_groups
    );
}
