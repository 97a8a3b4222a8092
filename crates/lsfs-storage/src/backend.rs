//! Raw block storage under the metadata block cache
//!
//! A backend stores fixed-size blocks by number. Block `n` of a
//! [`FileBackend`] lives at byte `n * block_size` of a regular file; blocks
//! that were never written, or were discarded, read back as missing.

use lsfs_common::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Fixed-size block storage addressed by block number
pub trait BlockBackend: Send + Sync {
    /// Block size in bytes
    fn block_size(&self) -> usize;

    /// Read block `block` into `buf`; returns `false` if the block is missing
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<bool>;

    /// Write a full block
    fn write_block(&self, block: u64, data: &[u8]) -> Result<()>;

    /// Give a block's space back; later reads report it missing
    fn discard_block(&self, block: u64) -> Result<()>;

    /// Numbers of all stored blocks, ascending
    fn block_numbers(&self) -> Result<Vec<u64>>;

    /// Make written blocks durable
    fn sync(&self) -> Result<()>;
}

fn check_len(block_size: usize, len: usize) -> Result<()> {
    if len == block_size {
        Ok(())
    } else {
        Err(Error::storage(format!(
            "buffer length {len} does not match block size {block_size}"
        )))
    }
}

/// In-memory backend, used for tests and scratch filesystems
pub struct MemBackend {
    block_size: usize,
    blocks: RwLock<BTreeMap<u64, Vec<u8>>>,
}

impl MemBackend {
    /// Create an empty in-memory backend
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of stored blocks
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Whether no block is stored
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Whether a block is stored
    pub fn contains(&self, block: u64) -> bool {
        self.blocks.read().contains_key(&block)
    }
}

impl BlockBackend for MemBackend {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<bool> {
        check_len(self.block_size, buf.len())?;
        match self.blocks.read().get(&block) {
            Some(data) => {
                buf.copy_from_slice(data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_len(self.block_size, data.len())?;
        self.blocks.write().insert(block, data.to_vec());
        Ok(())
    }

    fn discard_block(&self, block: u64) -> Result<()> {
        self.blocks.write().remove(&block);
        Ok(())
    }

    fn block_numbers(&self) -> Result<Vec<u64>> {
        Ok(self.blocks.read().keys().copied().collect())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Backend storing blocks in a regular file with positioned I/O
pub struct FileBackend {
    file: File,
    path: PathBuf,
    block_size: usize,
}

impl FileBackend {
    /// Open a backing file, creating it if it does not exist
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len % block_size as u64 != 0 {
            warn!(
                "atime file {:?} length {} is not a multiple of block size {}",
                path, len, block_size
            );
        }

        debug!("opened atime backing file {:?} ({} bytes)", path, len);
        Ok(Self {
            file,
            path,
            block_size,
        })
    }

    /// Open an existing backing file without creating it
    pub fn open_existing(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::storage(format!("atime file {} does not exist", path.display())));
        }
        Self::open(path, block_size)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length in bytes
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Whether the backing file is empty
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn position(&self, block: u64) -> Result<u64> {
        block
            .checked_mul(self.block_size as u64)
            .ok_or_else(|| Error::storage(format!("block {block} is beyond the addressable range")))
    }

    /// Read as much of the block as the file holds; the rest is zeroed
    fn read_partial(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match read_at(&self.file, &mut buf[filled..], pos + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        buf[filled..].fill(0);
        Ok(filled)
    }

    fn zero_block(&self, pos: u64) -> Result<()> {
        write_all_at(&self.file, &vec![0u8; self.block_size], pos)?;
        Ok(())
    }
}

impl BlockBackend for FileBackend {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<bool> {
        check_len(self.block_size, buf.len())?;
        let pos = self.position(block)?;
        if pos >= self.len()? {
            buf.fill(0);
            return Ok(false);
        }
        self.read_partial(pos, buf)?;
        Ok(buf.iter().any(|&b| b != 0))
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_len(self.block_size, data.len())?;
        let pos = self.position(block)?;
        write_all_at(&self.file, data, pos)?;
        Ok(())
    }

    fn discard_block(&self, block: u64) -> Result<()> {
        let pos = self.position(block)?;
        if pos >= self.len()? {
            return Ok(());
        }

        #[cfg(target_os = "linux")]
        {
            match punch_hole(&self.file, pos, self.block_size as u64) {
                Ok(()) => return Ok(()),
                Err(e) => debug!("punch hole failed on {:?}: {}, zeroing block", self.path, e),
            }
        }

        self.zero_block(pos)
    }

    fn block_numbers(&self) -> Result<Vec<u64>> {
        let blocks = self.len()? / self.block_size as u64;
        let mut buf = vec![0u8; self.block_size];
        let mut found = Vec::new();
        for block in 0..blocks {
            if self.read_block(block, &mut buf)? {
                found.push(block);
            }
        }
        Ok(found)
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], pos: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, pos)
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], pos: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, pos)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], pos: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, pos)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut pos: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, pos)?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        data = &data[n..];
        pos += n as u64;
    }
    Ok(())
}

/// Deallocate a byte range while keeping the file length
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn punch_hole(file: &File, offset: u64, len: u64) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let offset = libc::off_t::try_from(offset)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let len = libc::off_t::try_from(len)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset,
            len,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn block_of(byte: u8, size: usize) -> Vec<u8> {
        vec![byte; size]
    }

    #[test]
    fn test_mem_backend_roundtrip() {
        let backend = MemBackend::new(512);
        let mut buf = vec![0u8; 512];

        assert!(!backend.read_block(4, &mut buf).unwrap());

        backend.write_block(4, &block_of(7, 512)).unwrap();
        assert!(backend.read_block(4, &mut buf).unwrap());
        assert_eq!(buf, block_of(7, 512));
        assert_eq!(backend.block_numbers().unwrap(), vec![4]);

        backend.discard_block(4).unwrap();
        assert!(!backend.contains(4));
        assert!(backend.is_empty());
    }

    #[test]
    fn test_mem_backend_rejects_short_buffer() {
        let backend = MemBackend::new(512);
        assert!(backend.write_block(0, &[1u8; 100]).is_err());
    }

    #[test]
    fn test_file_backend_sparse_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("atime");
        let backend = FileBackend::open(&path, 512).unwrap();
        let mut buf = vec![0u8; 512];

        assert!(backend.is_empty().unwrap());
        assert!(!backend.read_block(0, &mut buf).unwrap());

        backend.write_block(2, &block_of(0xAB, 512)).unwrap();
        assert_eq!(backend.len().unwrap(), 3 * 512);

        // Blocks 0 and 1 are a hole below block 2
        assert!(!backend.read_block(0, &mut buf).unwrap());
        assert!(buf.iter().all(|&b| b == 0));
        assert!(backend.read_block(2, &mut buf).unwrap());
        assert_eq!(buf, block_of(0xAB, 512));
        assert_eq!(backend.block_numbers().unwrap(), vec![2]);
    }

    #[test]
    fn test_file_backend_discard() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("atime");
        let backend = FileBackend::open(&path, 512).unwrap();
        let mut buf = vec![0u8; 512];

        backend.write_block(0, &block_of(1, 512)).unwrap();
        backend.write_block(1, &block_of(2, 512)).unwrap();
        backend.discard_block(0).unwrap();
        backend.discard_block(9).unwrap();

        assert!(!backend.read_block(0, &mut buf).unwrap());
        assert!(backend.read_block(1, &mut buf).unwrap());
        assert_eq!(backend.len().unwrap(), 2 * 512);
        assert_eq!(backend.block_numbers().unwrap(), vec![1]);
    }

    #[test]
    fn test_file_backend_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("atime");

        {
            let backend = FileBackend::open(&path, 1024).unwrap();
            backend.write_block(5, &block_of(9, 1024)).unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open_existing(&path, 1024).unwrap();
        let mut buf = vec![0u8; 1024];
        assert!(backend.read_block(5, &mut buf).unwrap());
        assert_eq!(buf, block_of(9, 1024));
        assert_eq!(backend.path(), path.as_path());

        assert!(FileBackend::open_existing(dir.path().join("missing"), 1024).is_err());
    }
}
