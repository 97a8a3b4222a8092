//! Metadata file block access
//!
//! [`MetadataFile`] is the interface a block-indexed metadata file offers
//! to the stores built on it: fetch (or create) a block by number, mark it
//! dirty, hand it back, and reclaim it once it is empty.
//!
//! Lock order: callers must drop the guard returned by
//! [`BlockHandle::data`] before calling back into the metadata file.

use lsfs_common::Result;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;

/// A block borrowed from a metadata file for the duration of one operation
///
/// Handles are not `Clone`; each one is given back exactly once through
/// [`MetadataFile::release_block`].
pub struct BlockHandle {
    block: u64,
    data: Arc<Mutex<Vec<u8>>>,
}

impl BlockHandle {
    /// Wrap a resident block buffer
    #[must_use]
    pub fn new(block: u64, data: Arc<Mutex<Vec<u8>>>) -> Self {
        Self { block, data }
    }

    /// Block number within the metadata file
    #[must_use]
    pub const fn block_number(&self) -> u64 {
        self.block
    }

    /// Lock the block contents
    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock()
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHandle")
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

/// Block-level access to a metadata file
pub trait MetadataFile: Send + Sync {
    /// Block size in bytes
    fn block_size(&self) -> usize;

    /// Declare the entry layout of the file; called once at setup
    fn configure_entry_layout(&self, block_size: usize, header_size: usize) -> Result<()>;

    /// Get a block, running `init` over a zeroed buffer if it has to be created
    ///
    /// Fails with `BlockNotFound` if the block is missing and `create` is
    /// false.
    fn get_block(
        &self,
        block: u64,
        create: bool,
        init: &dyn Fn(&mut [u8]),
    ) -> Result<BlockHandle>;

    /// Include the block in the next write-back
    fn mark_block_dirty(&self, handle: &BlockHandle);

    /// Record that the file itself has unflushed changes
    fn mark_file_dirty(&self);

    /// Whether the file has unflushed changes
    fn is_dirty(&self) -> bool;

    /// Give a block back; does not force write-back
    fn release_block(&self, handle: BlockHandle);

    /// Reclaim a block; it must not be held by anyone
    fn delete_block(&self, block: u64) -> Result<()>;

    /// Write back all dirty blocks, returning how many were written
    fn flush(&self) -> Result<u64>;

    /// Numbers of all blocks currently in the file, ascending
    fn block_numbers(&self) -> Result<Vec<u64>>;
}
