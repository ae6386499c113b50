//! The inode table: on-disk inode layout, the reserved inodes, and the root
//! directory's entries.

use crate::device::Device;
use crate::superblock::Superblock;
use std::io;
use utils::util::reinterpret;

/// Inode number of the filesystem root, fixed by the ext2 format itself.
pub const ROOT_INODE: u32 = 2;

const S_IFDIR: u16 = 0o040000;

/// Byte offset of `size_low` within a serialized inode.
pub const OFF_SIZE_LOW: u64 = 4;
/// Byte offset of `links_count` within a serialized inode.
pub const OFF_LINKS_COUNT: u64 = 26;
/// Byte offset of `blocks` within a serialized inode.
pub const OFF_BLOCKS: u64 = 28;
/// Byte offset of `block[0]` within a serialized inode.
pub const OFF_BLOCK0: u64 = 40;

/// The on-disk layout of one inode table entry, matching the standard
/// 128-byte ext2 inode exactly.
#[repr(C, packed)]
struct RawInode {
    mode: u16,
    uid: u16,
    size_low: u32,
    atime: u32,
    ctime: u32,
    mtime: u32,
    dtime: u32,
    gid: u16,
    links_count: u16,
    blocks: u32,
    flags: u32,
    osd1: u32,
    block: [u32; 15],
    generation: u32,
    file_acl: u32,
    size_high: u32,
    faddr: u32,
    osd2: [u8; 12],
}

/// Builds a fresh, otherwise-empty directory inode (no data block allocated yet).
fn new_dir_inode(time: u32) -> RawInode {
    RawInode {
        mode: S_IFDIR | 0o755,
        uid: 0,
        size_low: 0,
        atime: time,
        ctime: time,
        mtime: time,
        dtime: 0,
        gid: 0,
        links_count: 0,
        blocks: 0,
        flags: 0,
        osd1: 0,
        block: [0; 15],
        generation: 0,
        file_acl: 0,
        size_high: 0,
        faddr: 0,
        osd2: [0; 12],
    }
}

/// The absolute byte offset of inode `inode_index` (1-based) within the inode
/// table rooted at `table_location`.
fn inode_offset(sb: &Superblock, table_location: u32, inode_index: u32) -> u64 {
    table_location as u64 * sb.block_size as u64
        + (inode_index as u64 - 1) * sb.inode_size as u64
}

/// Writes the initial root directory inode (inode 2, in group 0's table) with
/// no data block allocated and `links_count` left at zero; `finalize_root`
/// fills those in once the root's data block has been chosen.
pub fn write_root_inode(
    sb: &Superblock,
    table_location: u32,
    time: u32,
    device: &mut Device,
) -> io::Result<()> {
    let raw = new_dir_inode(time);
    let offset = inode_offset(sb, table_location, ROOT_INODE);
    device.write(offset, reinterpret(&raw))
}

/// One packed 8-byte-aligned directory entry: inode number, record length,
/// name length, file type, and the name itself (unpadded length recorded
/// separately from `rec_len`, which rounds up to a 4-byte boundary).
fn dir_entry_bytes(inode: u32, rec_len: u16, name: &[u8], file_type: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(rec_len as usize);
    buf.extend_from_slice(&inode.to_le_bytes());
    buf.extend_from_slice(&rec_len.to_le_bytes());
    buf.push(name.len() as u8);
    buf.push(file_type);
    buf.extend_from_slice(name);
    buf.resize(rec_len as usize, 0);
    buf
}

/// Writes the `.` and `..` entries into the root's freshly-allocated data
/// block, and patches the root inode's `size_low`, `blocks`, `links_count`
/// and `block[0]` fields to point at it.
pub fn finalize_root(
    sb: &Superblock,
    table_location: u32,
    root_data_block: u32,
    device: &mut Device,
) -> io::Result<()> {
    const FT_DIR: u8 = 2;

    let mut block = Vec::with_capacity(sb.block_size as usize);
    block.extend_from_slice(&dir_entry_bytes(ROOT_INODE, 12, b".", FT_DIR));
    let remaining = sb.block_size - 12;
    block.extend_from_slice(&dir_entry_bytes(ROOT_INODE, remaining as u16, b"..", FT_DIR));
    device.write(root_data_block as u64 * sb.block_size as u64, &block)?;

    let offset = inode_offset(sb, table_location, ROOT_INODE);
    device.write(offset + OFF_SIZE_LOW, &sb.block_size.to_le_bytes())?;
    device.write(offset + OFF_LINKS_COUNT, &2u16.to_le_bytes())?;
    let blocks_512 = sb.block_size / 512;
    device.write(offset + OFF_BLOCKS, &blocks_512.to_le_bytes())?;
    device.write(offset + OFF_BLOCK0, &root_data_block.to_le_bytes())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bgdt::Bgdt;
    use std::env;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        env::temp_dir().join(format!("mkfs_ext2_inode_test_{}_{}", std::process::id(), name))
    }

    #[test]
    fn raw_inode_size_is_128() {
        assert_eq!(std::mem::size_of::<RawInode>(), 128);
    }

    #[test]
    fn root_inode_roundtrip() {
        let path = tmp_path("root");
        let sb = Superblock::plan(1024, 8192, 0, [0; 16], 0).unwrap();
        let mut device = Device::new(&path, sb.num_blocks as u64 * sb.block_size as u64).unwrap();
        let bgdt = Bgdt::build(0, &sb, &mut device).unwrap();
        let table_location = bgdt.entries[0].inode_table_location;

        write_root_inode(&sb, table_location, 1000, &mut device).unwrap();
        finalize_root(&sb, table_location, 50, &mut device).unwrap();

        let offset = inode_offset(&sb, table_location, ROOT_INODE);
        let raw = device.read(offset, 128).unwrap();
        assert_eq!(u16::from_le_bytes([raw[0], raw[1]]) & S_IFDIR, S_IFDIR);
        assert_eq!(
            u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            sb.block_size
        );
        assert_eq!(u16::from_le_bytes([raw[26], raw[27]]), 2);
        assert_eq!(
            u32::from_le_bytes([raw[40], raw[41], raw[42], raw[43]]),
            50
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn dir_entry_fills_rec_len() {
        let bytes = dir_entry_bytes(2, 12, b".", 2);
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes[6], 1);
        assert_eq!(bytes[7], 2);
        assert_eq!(bytes[8], b'.');
    }
}
