//! The BGDT builder: per-group descriptor placement, bitmap initialization,
//! serialization, and write-through mutators.

use crate::device::Device;
use crate::superblock::Superblock;
use std::io;
use utils::util::get_timestamp;

/// Size in bytes of one serialized block group descriptor.
const ENTRY_SIZE: u64 = 32;

/// One block group's descriptor.
#[derive(Clone, Copy, Debug)]
pub struct BgdtEntry {
    pub block_bitmap_location: u32,
    pub inode_bitmap_location: u32,
    pub inode_table_location: u32,
    pub num_free_blocks: u16,
    pub num_free_inodes: u16,
    pub num_inodes_as_dirs: u16,
}

impl BgdtEntry {
    fn to_bytes(self) -> [u8; ENTRY_SIZE as usize] {
        let mut buf = [0u8; ENTRY_SIZE as usize];
        buf[0..4].copy_from_slice(&self.block_bitmap_location.to_le_bytes());
        buf[4..8].copy_from_slice(&self.inode_bitmap_location.to_le_bytes());
        buf[8..12].copy_from_slice(&self.inode_table_location.to_le_bytes());
        buf[12..14].copy_from_slice(&self.num_free_blocks.to_le_bytes());
        buf[14..16].copy_from_slice(&self.num_free_inodes.to_le_bytes());
        buf[16..18].copy_from_slice(&self.num_inodes_as_dirs.to_le_bytes());
        // Bytes 18..32 stay reserved/zero.
        buf
    }
}

/// One block group descriptor table copy (primary or backup), with the
/// per-group entries it was built from.
pub struct Bgdt {
    pub start_pos: u64,
    pub entries: Vec<BgdtEntry>,
}

/// Sets bit `index` (0-based, LSB-first within each byte) in `buf`.
fn set_bit(buf: &mut [u8], index: u32) {
    buf[(index / 8) as usize] |= 1 << (index % 8);
}

impl Bgdt {
    /// Builds the block group descriptor table copy owned by group `bg_num_copy`.
    ///
    /// Bitmaps (block and inode) are only initialized on disk when building the
    /// primary copy (`bg_num_copy == 0`); backup copies only carry the
    /// descriptor table itself, since the bitmaps and inode tables they
    /// describe are shared, not duplicated.
    pub fn build(bg_num_copy: u32, sb: &Superblock, device: &mut Device) -> io::Result<Self> {
        let start_pos =
            (bg_num_copy as u64 * sb.num_blocks_per_group as u64 + sb.first_block_id as u64 + 1)
                * sb.block_size as u64;

        let mut entries = Vec::with_capacity(sb.num_block_groups as usize);
        let mut table_bytes = Vec::with_capacity(sb.num_block_groups as usize * ENTRY_SIZE as usize);

        for g in 0..sb.num_block_groups {
            let g_start = g * sb.num_blocks_per_group + sb.first_block_id;
            let is_backup = sb.copy_block_group_ids.contains(&g);
            let overhead = if is_backup { 1 + sb.bgdt_blocks } else { 0 };

            let block_bitmap_location = g_start + overhead;
            let inode_bitmap_location = block_bitmap_location + 1;
            let inode_table_location = inode_bitmap_location + 1;

            let num_used_blocks = 2 + sb.inode_table_blocks + overhead;
            let num_used_inodes = if g == 0 { sb.first_inode_index - 1 } else { 0 };
            let num_free_inodes = sb.num_inodes_per_group - num_used_inodes;

            let num_total_blocks_in_group = if g != sb.num_block_groups - 1 {
                sb.num_blocks_per_group
            } else {
                sb.num_blocks - g_start
            };
            let num_free_blocks = num_total_blocks_in_group as i64 - num_used_blocks as i64;
            if num_free_blocks < 0 {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "not enough blocks specified",
                ));
            }

            if bg_num_copy == 0 {
                let mut block_bitmap = vec![0u8; sb.block_size as usize];
                for i in 0..num_used_blocks {
                    set_bit(&mut block_bitmap, i);
                }
                let mut pad_bit_index = num_total_blocks_in_group;
                while pad_bit_index < sb.block_size * 8 {
                    set_bit(&mut block_bitmap, pad_bit_index);
                    pad_bit_index += 1;
                }
                device.write(block_bitmap_location as u64 * sb.block_size as u64, &block_bitmap)?;

                let mut inode_bitmap = vec![0u8; sb.block_size as usize];
                for i in 0..num_used_inodes {
                    set_bit(&mut inode_bitmap, i);
                }
                device.write(inode_bitmap_location as u64 * sb.block_size as u64, &inode_bitmap)?;
            }

            let entry = BgdtEntry {
                block_bitmap_location,
                inode_bitmap_location,
                inode_table_location,
                num_free_blocks: num_free_blocks as u16,
                num_free_inodes: num_free_inodes as u16,
                num_inodes_as_dirs: 0,
            };
            table_bytes.extend_from_slice(&entry.to_bytes());
            entries.push(entry);
        }

        device.write(start_pos, &table_bytes)?;
        Ok(Self { start_pos, entries })
    }

    /// The absolute byte offset of group `group_index`'s entry within the BGDT
    /// copy stored in group `gid`.
    fn entry_base(gid: u32, group_index: u32, sb: &Superblock) -> u64 {
        gid as u64 * sb.num_blocks_per_group as u64 * sb.block_size as u64
            + sb.block_size as u64 * (sb.first_block_id as u64 + 1)
            + group_index as u64 * ENTRY_SIZE
    }

    fn write_through(
        &self,
        group_index: u32,
        field_offset: u64,
        bytes: &[u8],
        sb: &Superblock,
        device: &mut Device,
    ) -> io::Result<()> {
        let targets: &[u32] = if sb.save_copies {
            &sb.copy_block_group_ids
        } else {
            &sb.copy_block_group_ids[..1]
        };
        for &gid in targets {
            device.write(Self::entry_base(gid, group_index, sb) + field_offset, bytes)?;
        }
        Ok(())
    }

    /// Rewrites `num_free_blocks` for `group_index` across every live copy,
    /// also bumping the primary superblock's `time_last_write`.
    pub fn set_num_free_blocks(
        &mut self,
        group_index: u32,
        value: u16,
        sb: &mut Superblock,
        device: &mut Device,
    ) -> io::Result<()> {
        self.entries[group_index as usize].num_free_blocks = value;
        self.write_through(group_index, 12, &value.to_le_bytes(), sb, device)?;
        sb.set_time_last_write(get_timestamp().as_secs() as u32, device)
    }

    /// Rewrites `num_free_inodes` for `group_index` across every live copy,
    /// also bumping the primary superblock's `time_last_write`.
    pub fn set_num_free_inodes(
        &mut self,
        group_index: u32,
        value: u16,
        sb: &mut Superblock,
        device: &mut Device,
    ) -> io::Result<()> {
        self.entries[group_index as usize].num_free_inodes = value;
        self.write_through(group_index, 14, &value.to_le_bytes(), sb, device)?;
        sb.set_time_last_write(get_timestamp().as_secs() as u32, device)
    }

    /// Rewrites `num_inodes_as_dirs` for `group_index` across every live copy,
    /// also bumping the primary superblock's `time_last_write`.
    pub fn set_num_inodes_as_dirs(
        &mut self,
        group_index: u32,
        value: u16,
        sb: &mut Superblock,
        device: &mut Device,
    ) -> io::Result<()> {
        self.entries[group_index as usize].num_inodes_as_dirs = value;
        self.write_through(group_index, 16, &value.to_le_bytes(), sb, device)?;
        sb.set_time_last_write(get_timestamp().as_secs() as u32, device)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::env;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        env::temp_dir().join(format!("mkfs_ext2_bgdt_test_{}_{}", std::process::id(), name))
    }

    #[test]
    fn primary_entry_zero_locates_bitmaps_and_table() {
        let path = tmp_path("s6");
        let sb = Superblock::plan(4096, 65536, 0, [0; 16], 0).unwrap();
        let mut device = Device::new(&path, sb.num_blocks as u64 * sb.block_size as u64).unwrap();
        let bgdt = Bgdt::build(0, &sb, &mut device).unwrap();

        let e0 = bgdt.entries[0];
        assert_eq!(e0.block_bitmap_location, 1);
        assert_eq!(e0.inode_bitmap_location, 2);
        assert_eq!(e0.inode_table_location, 3);
        assert_eq!(e0.num_free_inodes, sb.num_inodes_per_group as u16 - 10);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn free_blocks_sum_to_superblock_value() {
        let path = tmp_path("sum");
        let sb = Superblock::plan(1024, 32768, 0, [0; 16], 0).unwrap();
        let mut device = Device::new(&path, sb.num_blocks as u64 * sb.block_size as u64).unwrap();
        let bgdt = Bgdt::build(0, &sb, &mut device).unwrap();

        let sum: u32 = bgdt.entries.iter().map(|e| e.num_free_blocks as u32).sum();
        assert_eq!(sum, sb.num_free_blocks);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn bitmap_padding_uses_shift_by_three() {
        let path = tmp_path("pad");
        // A deliberately small last group so the padding tail is observable.
        let sb = Superblock::plan(1024, 8192, 0, [0; 16], 0).unwrap();
        let mut device = Device::new(&path, sb.num_blocks as u64 * sb.block_size as u64).unwrap();
        let bgdt = Bgdt::build(0, &sb, &mut device).unwrap();
        let entry = bgdt.entries[0];

        let bitmap = device
            .read(entry.block_bitmap_location as u64 * sb.block_size as u64, sb.block_size as u64)
            .unwrap();
        let num_used = 2 + sb.inode_table_blocks;
        for i in 0..num_used {
            assert_eq!(bitmap[(i / 8) as usize] & (1 << (i % 8)), 1 << (i % 8));
        }
        let _ = std::fs::remove_file(&path);
    }
}
