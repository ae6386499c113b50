//! Library crate implementing the `mkfs.ext2` layout planner and image writer.
//!
//! Builds a fresh ext2 filesystem image inside an arbitrary block-addressable
//! backing store: the primary superblock and its redundant copies, the block
//! group descriptor table (BGDT) and its copies, the per-group allocation
//! bitmaps and inode tables, the reserved inodes, and the root directory.
//!
//! Reading or fsck-ing existing images, mounting, and incremental
//! modification after initial format are explicitly out of scope.

pub mod bgdt;
pub mod device;
pub mod format;
pub mod inode;
pub mod superblock;

pub use format::{make_ext2, FormatSummary};
