//! Atime file block layout
//!
//! Block layout (little-endian, no padding):
//! ```text
//! +----------------------+  offset 0
//! |  live entry count    |  u64 - number of present entries below
//! +----------------------+  offset 8
//! |  entry 0             |  i64 seconds, i64 nanoseconds
//! |  entry 1             |
//! |  ...                 |
//! |  entry N-1           |
//! +----------------------+  offset 8 + 16 * N (tail up to block_size unused)
//! ```
//!
//! `N = (block_size - 8) / 16`. Object `id` lives in block `id / N` at slot
//! `id % N`, and block `n` starts at byte `n * block_size` of the file.
//! An all-zero entry means "absent".

use bytes::{Buf, BufMut};
use lsfs_common::config::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use lsfs_common::{Error, ObjectId, Result, Timespec};
use std::ops::Range;

/// Size of the per-block header (live entry counter)
pub const ATIME_HEADER_SIZE: usize = 8;

/// Size of one timestamp entry
pub const ATIME_ENTRY_SIZE: usize = 16;

/// Physical shape of an atime file, fixed for the life of the file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AtimeLayout {
    block_size: usize,
    entries_per_block: u64,
}

impl AtimeLayout {
    /// Create the layout for a block size
    pub fn new(block_size: usize) -> Result<Self> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(Error::configuration(format!(
                "unsupported atime block size {block_size}"
            )));
        }
        Ok(Self {
            block_size,
            entries_per_block: ((block_size - ATIME_HEADER_SIZE) / ATIME_ENTRY_SIZE) as u64,
        })
    }

    /// Block size in bytes
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of entry slots per block (`N`)
    #[must_use]
    pub const fn entries_per_block(&self) -> u64 {
        self.entries_per_block
    }

    /// Block holding the entry for `id`
    #[must_use]
    pub const fn block_number(&self, id: ObjectId) -> u64 {
        id.get() / self.entries_per_block
    }

    /// Slot of `id` within its block
    #[must_use]
    pub const fn offset(&self, id: ObjectId) -> usize {
        (id.get() % self.entries_per_block) as usize
    }

    /// Object id stored at `offset` of `block`
    #[must_use]
    pub const fn object_id(&self, block: u64, offset: usize) -> ObjectId {
        ObjectId::new(block * self.entries_per_block + offset as u64)
    }

    /// Byte offset of a block within the backing file
    #[must_use]
    pub const fn block_position(&self, block: u64) -> u64 {
        block * self.block_size as u64
    }

    fn entry_range(offset: usize) -> Range<usize> {
        let start = ATIME_HEADER_SIZE + offset * ATIME_ENTRY_SIZE;
        start..start + ATIME_ENTRY_SIZE
    }

    /// Read the live entry counter from a block buffer
    #[must_use]
    pub fn live_count(&self, block: &[u8]) -> u64 {
        let mut buf = &block[..ATIME_HEADER_SIZE];
        buf.get_u64_le()
    }

    /// Write the live entry counter into a block buffer
    pub fn set_live_count(&self, block: &mut [u8], count: u64) {
        let mut buf = &mut block[..ATIME_HEADER_SIZE];
        buf.put_u64_le(count);
    }

    /// Read the entry at `offset`
    #[must_use]
    pub fn read_entry(&self, block: &[u8], offset: usize) -> Timespec {
        let mut buf = &block[Self::entry_range(offset)];
        let sec = buf.get_i64_le();
        let nsec = buf.get_i64_le();
        Timespec { sec, nsec }
    }

    /// Write the entry at `offset`
    pub fn write_entry(&self, block: &mut [u8], offset: usize, time: Timespec) {
        let mut buf = &mut block[Self::entry_range(offset)];
        buf.put_i64_le(time.sec);
        buf.put_i64_le(time.nsec);
    }

    /// Count the entries of a block that are not absent
    #[must_use]
    pub fn count_present(&self, block: &[u8]) -> u64 {
        (0..self.entries_per_block as usize)
            .filter(|&offset| !self.read_entry(block, offset).is_absent())
            .count() as u64
    }
}

/// Decoded copy of one atime block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AtimeBlock {
    /// Counter as stored in the header
    pub live_entries: u64,
    /// All `N` slots, absent ones included
    pub entries: Vec<Timespec>,
}

impl AtimeBlock {
    /// An empty block for the given layout
    #[must_use]
    pub fn empty(layout: &AtimeLayout) -> Self {
        Self {
            live_entries: 0,
            entries: vec![Timespec::ABSENT; layout.entries_per_block() as usize],
        }
    }

    /// Decode a block buffer
    pub fn decode(layout: &AtimeLayout, data: &[u8]) -> Result<Self> {
        if data.len() < layout.block_size() {
            return Err(Error::storage(format!(
                "atime block too small: {} < {}",
                data.len(),
                layout.block_size()
            )));
        }

        let mut buf = data;
        let live_entries = buf.get_u64_le();
        let mut entries = Vec::with_capacity(layout.entries_per_block() as usize);
        for _ in 0..layout.entries_per_block() {
            let sec = buf.get_i64_le();
            let nsec = buf.get_i64_le();
            entries.push(Timespec { sec, nsec });
        }

        Ok(Self {
            live_entries,
            entries,
        })
    }

    /// Encode into a full block buffer
    #[must_use]
    pub fn encode(&self, layout: &AtimeLayout) -> Vec<u8> {
        let mut buf = Vec::with_capacity(layout.block_size());
        buf.put_u64_le(self.live_entries);
        for entry in &self.entries {
            buf.put_i64_le(entry.sec);
            buf.put_i64_le(entry.nsec);
        }
        buf.resize(layout.block_size(), 0);
        buf
    }

    /// Number of entries that are not absent
    #[must_use]
    pub fn present(&self) -> u64 {
        self.entries.iter().filter(|e| !e.is_absent()).count() as u64
    }

    /// Whether the header counter agrees with the entries
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.live_entries == self.present()
    }
}
