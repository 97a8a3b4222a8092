//! Block cache for metadata files
//!
//! Keeps metadata blocks resident between operations, tracks which ones are
//! dirty, and writes them back to the [`BlockBackend`] on [`flush`]. Only
//! clean blocks that nobody holds are ever evicted, so a dirty block stays
//! in memory until it has been written back.
//!
//! [`flush`]: MetadataFile::flush

use crate::backend::BlockBackend;
use crate::metafile::{BlockHandle, MetadataFile};
use lsfs_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of blocks evicted
    pub evictions: AtomicU64,
    /// Number of dirty blocks written back
    pub writebacks: AtomicU64,
    /// Current number of dirty blocks
    pub dirty_count: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// A block held in memory
struct ResidentBlock {
    data: Arc<Mutex<Vec<u8>>>,
    /// Modified since the last write-back
    dirty: bool,
    /// Outstanding handles
    holders: usize,
    /// Logical clock value of the last access, for LRU eviction
    last_access: u64,
}

impl ResidentBlock {
    fn is_evictable(&self) -> bool {
        !self.dirty && self.holders == 0
    }
}

/// Write-back block cache implementing [`MetadataFile`] over a backend
pub struct MetaBlockCache<B: BlockBackend> {
    backend: B,
    blocks: Mutex<HashMap<u64, ResidentBlock>>,
    /// Maximum resident blocks before clean ones are evicted
    capacity: usize,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    file_dirty: AtomicBool,
    stats: CacheStats,
}

impl<B: BlockBackend> MetaBlockCache<B> {
    /// Create a cache keeping up to `capacity` blocks resident
    pub fn new(backend: B, capacity: usize) -> Self {
        Self {
            backend,
            blocks: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            file_dirty: AtomicBool::new(false),
            stats: CacheStats::default(),
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// The backend blocks are written back to
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of resident blocks
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Whether no block is resident
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    /// Whether a block is resident
    pub fn is_resident(&self, block: u64) -> bool {
        self.blocks.lock().contains_key(&block)
    }

    /// Advance the logical clock and return the new value
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Find the least recently used evictable block
    fn find_lru_entry(blocks: &HashMap<u64, ResidentBlock>) -> Option<u64> {
        blocks
            .iter()
            .filter(|(_, b)| b.is_evictable())
            .min_by_key(|(_, b)| b.last_access)
            .map(|(&n, _)| n)
    }

    /// Evict clean idle blocks until at most `limit` remain
    fn evict_to(&self, blocks: &mut HashMap<u64, ResidentBlock>, limit: usize) {
        while blocks.len() > limit {
            let Some(victim) = Self::find_lru_entry(blocks) else {
                break;
            };
            blocks.remove(&victim);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            trace!("evicted metadata block {}", victim);
        }
    }

    /// Allocate a zeroed block buffer, reporting allocation failure
    fn alloc_block(&self) -> Result<Vec<u8>> {
        let size = self.backend.block_size();
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| Error::OutOfMemory { bytes: size })?;
        buf.resize(size, 0);
        Ok(buf)
    }
}

impl<B: BlockBackend> MetadataFile for MetaBlockCache<B> {
    fn block_size(&self) -> usize {
        self.backend.block_size()
    }

    fn configure_entry_layout(&self, block_size: usize, header_size: usize) -> Result<()> {
        if block_size != self.backend.block_size() {
            return Err(Error::configuration(format!(
                "entry layout block size {} does not match file block size {}",
                block_size,
                self.backend.block_size()
            )));
        }
        if header_size >= block_size {
            return Err(Error::configuration(format!(
                "header size {header_size} leaves no room in a {block_size}-byte block"
            )));
        }
        debug!(
            "configured metadata file layout: block_size={} header_size={}",
            block_size, header_size
        );
        Ok(())
    }

    fn get_block(
        &self,
        block: u64,
        create: bool,
        init: &dyn Fn(&mut [u8]),
    ) -> Result<BlockHandle> {
        let clock = self.tick();
        let mut blocks = self.blocks.lock();

        if let Some(resident) = blocks.get_mut(&block) {
            resident.holders += 1;
            resident.last_access = clock;
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(BlockHandle::new(block, Arc::clone(&resident.data)));
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let mut buf = self.alloc_block()?;
        if !self.backend.read_block(block, &mut buf)? {
            if !create {
                return Err(Error::BlockNotFound { block });
            }
            init(&mut buf);
            debug!("created metadata block {}", block);
        }

        self.evict_to(&mut blocks, self.capacity.saturating_sub(1));

        let data = Arc::new(Mutex::new(buf));
        blocks.insert(
            block,
            ResidentBlock {
                data: Arc::clone(&data),
                dirty: false,
                holders: 1,
                last_access: clock,
            },
        );
        Ok(BlockHandle::new(block, data))
    }

    fn mark_block_dirty(&self, handle: &BlockHandle) {
        let mut blocks = self.blocks.lock();
        match blocks.get_mut(&handle.block_number()) {
            Some(resident) if !resident.dirty => {
                resident.dirty = true;
                self.stats.dirty_count.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => {}
            None => warn!(
                "mark_block_dirty on non-resident block {}",
                handle.block_number()
            ),
        }
    }

    fn mark_file_dirty(&self) {
        self.file_dirty.store(true, Ordering::Release);
    }

    fn is_dirty(&self) -> bool {
        self.file_dirty.load(Ordering::Acquire)
            || self.stats.dirty_count.load(Ordering::Relaxed) > 0
    }

    fn release_block(&self, handle: BlockHandle) {
        let mut blocks = self.blocks.lock();
        match blocks.get_mut(&handle.block_number()) {
            Some(resident) if resident.holders > 0 => resident.holders -= 1,
            _ => warn!(
                "release of block {} that is not held",
                handle.block_number()
            ),
        }
        self.evict_to(&mut blocks, self.capacity);
    }

    fn delete_block(&self, block: u64) -> Result<()> {
        let mut blocks = self.blocks.lock();
        if let Some(resident) = blocks.get(&block) {
            if resident.holders > 0 {
                return Err(Error::invariant(format!(
                    "cannot reclaim block {} while {} handle(s) are outstanding",
                    block, resident.holders
                )));
            }
            if resident.dirty {
                self.stats.dirty_count.fetch_sub(1, Ordering::Relaxed);
            }
            blocks.remove(&block);
        }

        self.backend.discard_block(block)?;
        self.file_dirty.store(true, Ordering::Release);
        debug!("reclaimed metadata block {}", block);
        Ok(())
    }

    fn flush(&self) -> Result<u64> {
        let mut blocks = self.blocks.lock();
        let mut dirty: Vec<u64> = blocks
            .iter()
            .filter(|(_, b)| b.dirty)
            .map(|(&n, _)| n)
            .collect();
        dirty.sort_unstable();

        let mut written = 0u64;
        for block in dirty {
            if let Some(resident) = blocks.get_mut(&block) {
                {
                    let data = resident.data.lock();
                    self.backend.write_block(block, &data)?;
                }
                resident.dirty = false;
                self.stats.dirty_count.fetch_sub(1, Ordering::Relaxed);
                self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
                written += 1;
            }
        }

        self.backend.sync()?;
        self.file_dirty.store(false, Ordering::Release);
        self.evict_to(&mut blocks, self.capacity);

        if written > 0 {
            debug!("flushed {} metadata blocks", written);
        }
        Ok(written)
    }

    fn block_numbers(&self) -> Result<Vec<u64>> {
        let mut numbers = self.backend.block_numbers()?;
        numbers.extend(self.blocks.lock().keys().copied());
        numbers.sort_unstable();
        numbers.dedup();
        Ok(numbers)
    }
}
