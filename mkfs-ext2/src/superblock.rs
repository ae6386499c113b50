//! The superblock planner: layout arithmetic, sparse-backup group selection,
//! byte-exact serialization, and write-through mutators.

use crate::device::Device;
use std::collections::BTreeSet;
use std::io;
use utils::util::ceil_division;

/// The ext2 signature.
const EXT2_MAGIC: u16 = 0xef53;
/// Offset of the primary superblock from the start of the device.
pub const SUPERBLOCK_OFFSET: u64 = 1024;

/// Byte offset of `num_free_blocks` within a serialized superblock.
const OFF_NUM_FREE_BLOCKS: u64 = 12;
/// Byte offset of `num_free_inodes` within a serialized superblock.
const OFF_NUM_FREE_INODES: u64 = 16;
/// Byte offset of `time_last_mount` within a serialized superblock.
const OFF_TIME_LAST_MOUNT: u64 = 44;
/// Byte offset of `time_last_write` within a serialized superblock.
const OFF_TIME_LAST_WRITE: u64 = 48;
/// Byte offset of `num_mounts_since_check` within a serialized superblock.
const OFF_NUM_MOUNTS_SINCE_CHECK: u64 = 52;
/// Byte offset of `volume_name` within a serialized superblock.
const OFF_VOLUME_NAME: u64 = 120;

/// The on-disk layout of one superblock copy, in field order, matching the
/// byte table exactly: a packed view of this struct *is* the serialized form.
#[repr(C, packed)]
struct RawSuperblock {
    num_inodes: u32,
    num_blocks: u32,
    num_res_blocks: u32,
    num_free_blocks: u32,
    num_free_inodes: u32,
    first_block_id: u32,
    log_block_size: u32,
    log_frag_size: i32,
    num_blocks_per_group: u32,
    num_frags_per_group: u32,
    num_inodes_per_group: u32,
    time_last_mount: u32,
    time_last_write: u32,
    num_mounts_since_check: u16,
    num_mounts_max: u16,
    magic: u16,
    state: u16,
    error_action: u16,
    rev_minor: u16,
    time_last_check: u32,
    time_between_check: u32,
    creator_os: u32,
    rev_level: u32,
    def_res_uid: u16,
    def_res_gid: u16,
    first_inode_index: u32,
    inode_size: u16,
    bg_num: u16,
    features_compatible: u32,
    features_incompatible: u32,
    features_read_only_compatible: u32,
    volume_id: [u8; 16],
    volume_name: [u8; 16],
    last_mount_path: [u8; 64],
    _reserved: [u8; 824],
}

/// Planner state for one superblock copy (primary or backup).
pub struct Superblock {
    pub block_size: u32,
    pub num_blocks: u32,
    pub num_blocks_per_group: u32,
    pub num_frags_per_group: u32,
    pub num_inodes_per_group: u32,
    pub num_block_groups: u32,
    pub num_res_blocks: u32,
    pub first_block_id: u32,
    pub first_inode_index: u32,
    pub inode_size: u16,
    pub bgdt_blocks: u32,
    pub inode_table_blocks: u32,
    pub num_inodes: u32,
    pub num_free_blocks: u32,
    pub num_free_inodes: u32,
    pub log_block_size: u32,
    pub bg_num: u16,
    pub volume_id: [u8; 16],
    pub time_last_mount: u32,
    pub time_last_write: u32,
    pub time_last_check: u32,
    /// Groups that carry a superblock+BGDT copy, sorted ascending, always
    /// containing `0` first.
    pub copy_block_group_ids: Vec<u32>,
    /// When false, write-through mutators only touch the group-0 copy (used
    /// while backups have not been laid down on disk yet).
    pub save_copies: bool,
}

impl Superblock {
    /// Runs the layout planning algorithm for one superblock copy.
    ///
    /// `bg_num` is the group index this copy will live in (`0` for the
    /// primary). Planning is a pure function of its inputs: a shadow copy
    /// planned with the same `block_size`/`num_blocks`/`current_time`/
    /// `volume_id` as the primary, just a different `bg_num`, yields
    /// byte-identical results except for the `bg_num` field itself.
    pub fn plan(
        block_size: u32,
        num_blocks: u32,
        current_time: u32,
        volume_id: [u8; 16],
        bg_num: u32,
    ) -> io::Result<Self> {
        if block_size != 1024 && block_size != 2048 && block_size != 4096 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid block size specified",
            ));
        }
        if num_blocks == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero blocks specified"));
        }

        let num_blocks_per_group = block_size * 8;
        let num_inodes_per_group = block_size * 8;
        let mut num_blocks = num_blocks;
        let mut num_block_groups =
            ceil_division(num_blocks as u64, num_blocks_per_group as u64) as u32;

        let first_block_id: u32 = if block_size == 1024 { 1 } else { 0 };
        let first_inode_index: u32 = 11;
        let inode_size: u16 = 128;

        // Sparse superblock backup group selection (1, powers of 3/5/7 below
        // `num_block_groups`), deduplicated via a set from the start.
        let mut backups: BTreeSet<u32> = BTreeSet::new();
        if num_block_groups > 1 {
            backups.insert(1);
            let mut p = 3u32;
            while p < num_block_groups {
                backups.insert(p);
                p *= 3;
            }
            let mut p = 5u32;
            while p < num_block_groups {
                backups.insert(p);
                p *= 5;
            }
            let mut p = 7u32;
            while p < num_block_groups {
                backups.insert(p);
                p *= 7;
            }
        }

        let mut bgdt_blocks =
            ceil_division(num_block_groups as u64 * 32, block_size as u64) as u32;
        let inode_table_blocks =
            ceil_division(num_inodes_per_group as u64 * inode_size as u64, block_size as u64)
                as u32;

        let mut num_free_blocks = free_blocks(
            num_blocks,
            first_block_id,
            inode_table_blocks,
            num_block_groups,
            bgdt_blocks,
            backups.len() as u32,
        );

        // Last-group trim: runs at most once, the overhead shrinks monotonically with
        // the group count.
        let last_bg_id = num_block_groups - 1;
        let mut overhead: i64 = 2 + inode_table_blocks as i64;
        if backups.contains(&last_bg_id) {
            overhead += 1 + bgdt_blocks as i64;
        }
        let last_group_available =
            num_blocks as i64 - (last_bg_id as i64 * num_blocks_per_group as i64 + first_block_id as i64);
        if overhead > last_group_available {
            backups.remove(&last_bg_id);
            num_block_groups -= 1;
            num_blocks = num_block_groups * num_blocks_per_group;
            bgdt_blocks = ceil_division(num_block_groups as u64 * 32, block_size as u64) as u32;
            num_free_blocks = free_blocks(
                num_blocks,
                first_block_id,
                inode_table_blocks,
                num_block_groups,
                bgdt_blocks,
                backups.len() as u32,
            );
        }
        if num_free_blocks < 10 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "not enough blocks specified",
            ));
        }

        let num_inodes = num_inodes_per_group * num_block_groups;
        let num_free_inodes = num_inodes - (first_inode_index - 1);

        let log_block_size = block_size >> 11;
        let mut num_blocks_per_group = num_blocks_per_group;
        let mut num_frags_per_group = num_blocks_per_group;
        if num_blocks < num_blocks_per_group {
            num_blocks_per_group = num_blocks;
            num_frags_per_group = num_blocks;
        }

        let mut copy_block_group_ids: Vec<u32> = backups.into_iter().collect();
        copy_block_group_ids.insert(0, 0);
        copy_block_group_ids.sort_unstable();
        copy_block_group_ids.dedup();

        Ok(Self {
            block_size,
            num_blocks,
            num_blocks_per_group,
            num_frags_per_group,
            num_inodes_per_group,
            num_block_groups,
            num_res_blocks: (num_blocks as f64 * 0.05) as u32,
            first_block_id,
            first_inode_index,
            inode_size,
            bgdt_blocks,
            inode_table_blocks,
            num_inodes,
            num_free_blocks: num_free_blocks as u32,
            num_free_inodes,
            log_block_size,
            bg_num: bg_num as u16,
            volume_id,
            time_last_mount: current_time,
            time_last_write: current_time,
            time_last_check: current_time,
            copy_block_group_ids,
            save_copies: false,
        })
    }

    /// Serializes this superblock copy and writes it at the given absolute byte offset.
    pub fn write(&self, device: &mut Device, byte_offset: u64) -> io::Result<()> {
        let raw = RawSuperblock {
            num_inodes: self.num_inodes,
            num_blocks: self.num_blocks,
            num_res_blocks: self.num_res_blocks,
            num_free_blocks: self.num_free_blocks,
            num_free_inodes: self.num_free_inodes,
            first_block_id: self.first_block_id,
            log_block_size: self.log_block_size,
            log_frag_size: self.log_block_size as i32,
            num_blocks_per_group: self.num_blocks_per_group,
            num_frags_per_group: self.num_frags_per_group,
            num_inodes_per_group: self.num_inodes_per_group,
            time_last_mount: self.time_last_mount,
            time_last_write: self.time_last_write,
            num_mounts_since_check: 0,
            num_mounts_max: 25,
            magic: EXT2_MAGIC,
            state: 1,
            error_action: 1,
            rev_minor: 0,
            time_last_check: self.time_last_check,
            time_between_check: 15552000,
            creator_os: 0,
            rev_level: 1,
            def_res_uid: 0,
            def_res_gid: 0,
            first_inode_index: self.first_inode_index,
            inode_size: self.inode_size,
            bg_num: self.bg_num,
            features_compatible: 0,
            features_incompatible: 2,
            features_read_only_compatible: 1,
            volume_id: self.volume_id,
            volume_name: [0; 16],
            last_mount_path: [0; 64],
            _reserved: [0; 824],
        };
        device.write(byte_offset, utils::util::reinterpret(&raw))
    }

    /// The absolute byte offset of the superblock copy living in group `gid`.
    ///
    /// The primary superblock sits after the 1024-byte boot sector; backup
    /// copies do not reserve that boot area and start at their group's very
    /// first byte.
    pub(crate) fn copy_base(&self, gid: u32) -> u64 {
        if gid == 0 {
            SUPERBLOCK_OFFSET
        } else {
            (gid as u64 * self.num_blocks_per_group as u64 + self.first_block_id as u64)
                * self.block_size as u64
        }
    }

    /// Rewrites `bytes` at `field_offset` in every live copy (or only the
    /// group-0 copy while `save_copies` is false).
    fn write_through(&self, device: &mut Device, field_offset: u64, bytes: &[u8]) -> io::Result<()> {
        let targets: &[u32] = if self.save_copies {
            &self.copy_block_group_ids
        } else {
            &self.copy_block_group_ids[..1]
        };
        for &gid in targets {
            device.write(self.copy_base(gid) + field_offset, bytes)?;
        }
        Ok(())
    }

    pub fn set_num_free_blocks(&mut self, value: u32, device: &mut Device) -> io::Result<()> {
        self.num_free_blocks = value;
        self.write_through(device, OFF_NUM_FREE_BLOCKS, &value.to_le_bytes())
    }

    pub fn set_num_free_inodes(&mut self, value: u32, device: &mut Device) -> io::Result<()> {
        self.num_free_inodes = value;
        self.write_through(device, OFF_NUM_FREE_INODES, &value.to_le_bytes())
    }

    pub fn set_time_last_mount(&mut self, value: u32, device: &mut Device) -> io::Result<()> {
        self.time_last_mount = value;
        self.write_through(device, OFF_TIME_LAST_MOUNT, &value.to_le_bytes())
    }

    pub fn set_time_last_write(&mut self, value: u32, device: &mut Device) -> io::Result<()> {
        self.time_last_write = value;
        self.write_through(device, OFF_TIME_LAST_WRITE, &value.to_le_bytes())
    }

    pub fn set_num_mounts_since_check(&mut self, value: u16, device: &mut Device) -> io::Result<()> {
        self.write_through(device, OFF_NUM_MOUNTS_SINCE_CHECK, &value.to_le_bytes())
    }

    pub fn set_volume_name(&mut self, name: &[u8], device: &mut Device) -> io::Result<()> {
        let mut buf = [0u8; 16];
        let len = name.len().min(buf.len());
        buf[..len].copy_from_slice(&name[..len]);
        self.write_through(device, OFF_VOLUME_NAME, &buf)
    }
}

/// Computes the post-overhead free block count for the given layout parameters.
fn free_blocks(
    num_blocks: u32,
    first_block_id: u32,
    inode_table_blocks: u32,
    num_block_groups: u32,
    bgdt_blocks: u32,
    num_backups: u32,
) -> i64 {
    num_blocks as i64
        - first_block_id as i64
        - inode_table_blocks as i64 * num_block_groups as i64
        - 2 * num_block_groups as i64
        - (1 + bgdt_blocks as i64) * (num_backups as i64 + 1)
}

#[cfg(test)]
mod test {
    use super::*;

    const VOL: [u8; 16] = [0; 16];

    #[test]
    fn raw_superblock_size_is_1024() {
        assert_eq!(std::mem::size_of::<RawSuperblock>(), 1024);
    }

    #[test]
    fn single_group_has_no_backups() {
        let sb = Superblock::plan(1024, 8192, 0, VOL, 0).unwrap();
        assert_eq!(sb.num_block_groups, 1);
        assert_eq!(sb.first_block_id, 1);
        assert_eq!(sb.copy_block_group_ids, vec![0]);
    }

    #[test]
    fn two_groups_backs_up_group_one() {
        let sb = Superblock::plan(4096, 65536, 0, VOL, 0).unwrap();
        assert_eq!(sb.num_block_groups, 2);
        assert_eq!(sb.first_block_id, 0);
        assert_eq!(sb.copy_block_group_ids, vec![0, 1]);
        assert_eq!(sb.copy_base(1), 1 * 32768 * 4096);
    }

    #[test]
    fn four_groups_backs_up_one_and_three() {
        let sb = Superblock::plan(1024, 32768, 0, VOL, 0).unwrap();
        assert_eq!(sb.num_block_groups, 4);
        assert_eq!(sb.copy_block_group_ids, vec![0, 1, 3]);
    }

    #[test]
    fn too_few_blocks_fails() {
        let err = Superblock::plan(4096, 9, 0, VOL, 0).unwrap_err();
        assert_eq!(err.to_string(), "not enough blocks specified");
    }

    #[test]
    fn sixteen_groups_sparse_backup_set() {
        // Powers of 3/5/7 strictly below 16 groups are {3, 9}, {5}, {7}; combined
        // with group 1 and the prepended group 0 that is [0, 1, 3, 5, 7, 9] — group
        // 15 carries no backup, since it is neither 1 nor a power of 3/5/7.
        let sb = Superblock::plan(2048, 262144, 0, VOL, 0).unwrap();
        assert_eq!(sb.num_block_groups, 16);
        assert_eq!(sb.copy_block_group_ids, vec![0, 1, 3, 5, 7, 9]);
    }

    #[test]
    fn invalid_block_size_rejected() {
        Superblock::plan(3000, 8192, 0, VOL, 0).unwrap_err();
    }

    #[test]
    fn zero_blocks_rejected() {
        Superblock::plan(4096, 0, 0, VOL, 0).unwrap_err();
    }
}
