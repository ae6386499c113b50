//! The device sink: a positioned byte reader/writer over the backing store.
//!
//! The backing store is preallocated to its final size at construction time
//! so that every later write lands inside an already-sized file (important
//! for block devices and for sparse regular files alike). A `mounted` flag
//! guards every I/O operation; using the sink after `unmount` is a contract
//! violation and panics, it is not a recoverable runtime condition.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;

/// A random-access byte sink over the backing store (a regular file or a block device).
pub struct Device {
    file: File,
    mounted: bool,
}

impl Device {
    /// Opens (creating if absent) the file at `path` and preallocates it to `bytes` bytes.
    pub fn new(path: &Path, bytes: u64) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if bytes > 0 {
            file.seek(SeekFrom::Start(bytes - 1))?;
            file.write_all(&[0])?;
        }
        Ok(Self {
            file,
            mounted: true,
        })
    }

    /// Wraps an already-open, already-sized file.
    pub fn from_file(file: File) -> Self {
        Self {
            file,
            mounted: true,
        }
    }

    /// Writes `data` at the absolute byte offset `position`.
    ///
    /// Panics if the device is not mounted.
    pub fn write(&mut self, position: u64, data: &[u8]) -> io::Result<()> {
        assert!(self.mounted, "device is not mounted");
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(data)
    }

    /// Reads up to `count` bytes starting at the absolute byte offset `position`.
    ///
    /// Returns fewer bytes than `count` only when the backing store ends first.
    ///
    /// Panics if the device is not mounted.
    pub fn read(&mut self, position: u64, count: u64) -> io::Result<Vec<u8>> {
        assert!(self.mounted, "device is not mounted");
        self.file.seek(SeekFrom::Start(position))?;
        let mut buf = vec![0u8; count as usize];
        let mut total = 0;
        while total < buf.len() {
            let n = self.file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        buf.truncate(total);
        Ok(buf)
    }

    /// Resizes the backing store to exactly `bytes` bytes.
    ///
    /// Used after planning trims the requested block count down by one
    /// group, so the on-disk file matches the post-trim size rather than
    /// the pre-trim size it was first opened with.
    pub fn set_len(&mut self, bytes: u64) -> io::Result<()> {
        assert!(self.mounted, "device is not mounted");
        self.file.set_len(bytes)
    }

    /// Flushes and closes the device. No further I/O may be performed afterwards.
    pub fn unmount(&mut self) -> io::Result<()> {
        self.file.sync_all()?;
        self.mounted = false;
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.mounted {
            let _ = self.file.sync_all();
            self.mounted = false;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::env;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        env::temp_dir().join(format!("mkfs_ext2_device_test_{}_{}", std::process::id(), name))
    }

    #[test]
    fn presizes_backing_file() {
        let path = tmp_path("presize");
        {
            let _dev = Device::new(&path, 4096).unwrap();
        }
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 4096);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn write_then_read_back() {
        let path = tmp_path("rw");
        let mut dev = Device::new(&path, 4096).unwrap();
        dev.write(100, b"hello").unwrap();
        let data = dev.read(100, 5).unwrap();
        assert_eq!(&data, b"hello");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn set_len_shrinks_backing_file() {
        let path = tmp_path("shrink");
        let mut dev = Device::new(&path, 8193).unwrap();
        dev.set_len(8192).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 8192);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    #[should_panic(expected = "device is not mounted")]
    fn panics_after_unmount() {
        let path = tmp_path("panic");
        let mut dev = Device::new(&path, 4096).unwrap();
        dev.unmount().unwrap();
        let _ = std::fs::remove_file(&path);
        dev.write(0, b"x").unwrap();
    }
}
