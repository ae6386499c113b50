//! Top-level orchestration: lays out a complete ext2 image on an already
//! sized device, mirroring the superblock and BGDT into every backup group,
//! then carving out the root directory.

use crate::bgdt::Bgdt;
use crate::device::Device;
use crate::inode;
use crate::superblock::{Superblock, SUPERBLOCK_OFFSET};
use std::io;
use std::path::Path;
use utils::util::get_timestamp;
use uuid::Uuid;

/// What a successful format produced, for the CLI front-end to report.
#[derive(Debug)]
pub struct FormatSummary {
    pub block_size: u32,
    pub num_blocks: u32,
    pub num_block_groups: u32,
    pub num_free_blocks: u32,
    pub num_inodes: u32,
    pub num_free_inodes: u32,
    pub volume_id: [u8; 16],
    pub backup_groups: Vec<u32>,
}

/// Finds the first unused bit in `bitmap`, scanning LSB-first within each byte.
fn first_free_bit(bitmap: &[u8]) -> Option<u32> {
    for (byte_idx, byte) in bitmap.iter().enumerate() {
        if *byte != 0xff {
            for bit in 0..8u32 {
                if byte & (1 << bit) == 0 {
                    return Some(byte_idx as u32 * 8 + bit);
                }
            }
        }
    }
    None
}

/// Formats the device already opened at `path`, sized to `num_blocks *
/// block_size` bytes, as a fresh ext2 filesystem.
pub fn format(path: &Path, block_size: u32, num_blocks: u32) -> io::Result<FormatSummary> {
    let current_time = get_timestamp().as_secs() as u32;
    let volume_id = *Uuid::new_v4().as_bytes();

    let mut device = Device::new(path, num_blocks as u64 * block_size as u64)?;

    let mut sb = Superblock::plan(block_size, num_blocks, current_time, volume_id, 0)?;
    // Planning may have trimmed off the last group; shrink the backing store
    // to match the post-trim block count it actually describes.
    device.set_len(sb.num_blocks as u64 * block_size as u64)?;
    sb.write(&mut device, SUPERBLOCK_OFFSET)?;
    let mut bgdt = Bgdt::build(0, &sb, &mut device)?;

    // Mirror superblock and BGDT into every backup group. Each shadow copy is
    // planned from the same original `num_blocks` the primary started from,
    // so independent re-planning reaches the same trimmed layout.
    for &gid in &sb.copy_block_group_ids {
        if gid == 0 {
            continue;
        }
        let shadow = Superblock::plan(block_size, num_blocks, current_time, volume_id, gid)?;
        let base = shadow.copy_base(gid);
        shadow.write(&mut device, base)?;
        Bgdt::build(gid, &shadow, &mut device)?;
    }

    sb.save_copies = true;

    let root_table_location = bgdt.entries[0].inode_table_location;
    inode::write_root_inode(&sb, root_table_location, current_time, &mut device)?;
    bgdt.set_num_inodes_as_dirs(0, 1, &mut sb, &mut device)?;

    let alloc_group = bgdt
        .entries
        .iter()
        .position(|e| e.num_free_blocks > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no free blocks"))? as u32;
    let block_bitmap_location = bgdt.entries[alloc_group as usize].block_bitmap_location;
    let bitmap = device.read(
        block_bitmap_location as u64 * sb.block_size as u64,
        sb.block_size as u64,
    )?;
    let free_bit = first_free_bit(&bitmap)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "invalid block bitmap"))?;
    let root_data_block = alloc_group * sb.num_blocks_per_group + free_bit + sb.first_block_id;

    let mut bitmap = bitmap;
    bitmap[(free_bit / 8) as usize] |= 1 << (free_bit % 8);
    device.write(
        block_bitmap_location as u64 * sb.block_size as u64,
        &bitmap,
    )?;

    inode::finalize_root(&sb, root_table_location, root_data_block, &mut device)?;

    let new_free_blocks = bgdt.entries[alloc_group as usize].num_free_blocks - 1;
    bgdt.set_num_free_blocks(alloc_group, new_free_blocks, &mut sb, &mut device)?;
    sb.set_num_free_blocks(sb.num_free_blocks - 1, &mut device)?;

    device.unmount()?;

    Ok(FormatSummary {
        block_size: sb.block_size,
        num_blocks: sb.num_blocks,
        num_block_groups: sb.num_block_groups,
        num_free_blocks: sb.num_free_blocks,
        num_inodes: sb.num_inodes,
        num_free_inodes: sb.num_free_inodes,
        volume_id: sb.volume_id,
        backup_groups: sb.copy_block_group_ids,
    })
}

/// Convenience entry point taking a device path directly, used by the CLI.
pub fn make_ext2(device_path: &Path, block_size: u32, num_blocks: u32) -> io::Result<FormatSummary> {
    format(device_path, block_size, num_blocks)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::env;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        env::temp_dir().join(format!("mkfs_ext2_format_test_{}_{}", std::process::id(), name))
    }

    #[test]
    fn formats_small_image() {
        let path = tmp_path("small");
        let summary = make_ext2(&path, 1024, 8192).unwrap();
        assert_eq!(summary.num_block_groups, 1);
        assert_eq!(summary.backup_groups, vec![0]);
        assert!(summary.num_free_blocks < summary.num_blocks);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn formats_multi_group_image_with_backups() {
        let path = tmp_path("multi");
        let summary = make_ext2(&path, 1024, 32768).unwrap();
        assert_eq!(summary.num_block_groups, 4);
        assert_eq!(summary.backup_groups, vec![0, 1, 3]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn first_free_bit_scans_lsb_first() {
        assert_eq!(first_free_bit(&[0b0000_0001]), Some(1));
        assert_eq!(first_free_bit(&[0xff, 0b1111_1101]), Some(9));
        assert_eq!(first_free_bit(&[0xff, 0xff]), None);
    }
}
