//! Access-time attribute file
//!
//! Keeps each object's last access time in a separate block-indexed
//! metadata file, so reading an object does not dirty (and copy-on-write)
//! its inode. Object `id` owns slot `id % N` of block `id / N`; every block
//! carries a counter of its present entries and is reclaimed as soon as
//! that counter drops to zero.
//!
//! # Locking
//!
//! One store-wide mutex covers the whole acquire → mutate → release
//! sequence, and for deletes the reclamation that follows. Two operations
//! can therefore never interleave on a block's counter, and a block being
//! reclaimed cannot be re-created halfway through.
//!
//! # Bypass mode
//!
//! Without a configured atime file, [`AtimeFile::fill`] hands back the
//! fallback time without touching any block, and updates and deletes do
//! nothing.

use crate::backend::FileBackend;
use crate::cache::MetaBlockCache;
use crate::inode::AtimeInode;
use crate::layout::{ATIME_HEADER_SIZE, AtimeBlock, AtimeLayout};
use crate::metafile::MetadataFile;
use lsfs_common::{AtimeConfig, Error, ObjectId, Result, Timespec};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

/// Operation counters for the atime file
#[derive(Debug, Default)]
pub struct AtimeStats {
    /// Fills served from the atime file
    pub fills: AtomicU64,
    /// Fills that found an entry already present
    pub fill_hits: AtomicU64,
    /// Fills that created the entry from the fallback time
    pub fill_inits: AtomicU64,
    /// Fills answered in bypass mode
    pub bypassed_fills: AtomicU64,
    pub updates: AtomicU64,
    pub deletes: AtomicU64,
    /// Blocks handed back after their last entry was deleted
    pub blocks_reclaimed: AtomicU64,
}

/// A block whose header counter disagrees with its entries
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMismatch {
    pub block: u64,
    /// Counter stored in the block header
    pub recorded: u64,
    /// Entries actually present
    pub present: u64,
}

/// Result of [`AtimeFile::verify`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub blocks_checked: u64,
    pub live_entries: u64,
    pub mismatches: Vec<BlockMismatch>,
    /// Blocks with no entries that are still stored
    pub reclaimable: Vec<u64>,
}

impl VerifyReport {
    /// Whether every block counter matched its entries
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

enum Backing {
    Bypass,
    File {
        layout: AtimeLayout,
        metafile: Arc<dyn MetadataFile>,
    },
}

/// The access-time attribute store
pub struct AtimeFile {
    backing: Backing,
    /// Held across acquire, mutate, release and reclaim
    lock: Mutex<()>,
    mark_dirty_on_fill: bool,
    stats: AtimeStats,
}

impl AtimeFile {
    /// A store with no backing file; access times stay inline
    #[must_use]
    pub fn bypass() -> Self {
        Self {
            backing: Backing::Bypass,
            lock: Mutex::new(()),
            mark_dirty_on_fill: true,
            stats: AtimeStats::default(),
        }
    }

    /// Open the store described by `config`
    ///
    /// Creates the backing file if it does not exist yet.
    pub fn open(config: &AtimeConfig) -> Result<Self> {
        config.validate()?;
        let Some(path) = &config.path else {
            info!("no atime file configured, access times are kept inline");
            return Ok(Self::bypass());
        };

        let backend = FileBackend::open(path, config.block_size)?;
        let cache = MetaBlockCache::new(backend, config.cache_blocks);
        let store = Self::with_metafile(Arc::new(cache), config)?;

        info!(
            "opened atime file {:?} (block_size={}, entries_per_block={})",
            path,
            config.block_size,
            store.layout().map_or(0, |l| l.entries_per_block())
        );
        Ok(store)
    }

    /// Build a store over an existing metadata file
    pub fn with_metafile(metafile: Arc<dyn MetadataFile>, config: &AtimeConfig) -> Result<Self> {
        config.validate()?;
        let layout = AtimeLayout::new(config.block_size)?;
        if metafile.block_size() != layout.block_size() {
            return Err(Error::configuration(format!(
                "metadata file block size {} does not match configured {}",
                metafile.block_size(),
                layout.block_size()
            )));
        }
        metafile.configure_entry_layout(layout.block_size(), ATIME_HEADER_SIZE)?;

        Ok(Self {
            backing: Backing::File { layout, metafile },
            lock: Mutex::new(()),
            mark_dirty_on_fill: config.mark_dirty_on_fill,
            stats: AtimeStats::default(),
        })
    }

    /// Whether the store runs without a backing file
    #[must_use]
    pub const fn is_bypass(&self) -> bool {
        matches!(self.backing, Backing::Bypass)
    }

    /// Block layout, `None` in bypass mode
    #[must_use]
    pub const fn layout(&self) -> Option<&AtimeLayout> {
        match &self.backing {
            Backing::Bypass => None,
            Backing::File { layout, .. } => Some(layout),
        }
    }

    /// Operation counters
    pub fn stats(&self) -> &AtimeStats {
        &self.stats
    }

    /// Whether there are mutations not yet written back
    pub fn is_dirty(&self) -> bool {
        match &self.backing {
            Backing::Bypass => false,
            Backing::File { metafile, .. } => metafile.is_dirty(),
        }
    }

    /// Resolve an object's access time, recording `fallback` if it has none
    ///
    /// Returns the time now stored for the object. Once an entry exists a
    /// later fill never changes it, whatever fallback it is given.
    pub fn fill(&self, id: ObjectId, fallback: Timespec) -> Result<Timespec> {
        let Backing::File { layout, metafile } = &self.backing else {
            self.stats.bypassed_fills.fetch_add(1, Ordering::Relaxed);
            return Ok(fallback);
        };
        self.stats.fills.fetch_add(1, Ordering::Relaxed);

        let fallback = fallback.to_stored();
        let slots = layout.entries_per_block();
        let _guard = self.lock.lock();

        let (time, _) = with_block(
            metafile.as_ref(),
            layout,
            id,
            BlockAccess::Create {
                dirty_on_acquire: self.mark_dirty_on_fill,
            },
            |block, offset| {
                let current = layout.read_entry(block, offset);
                if !current.is_absent() {
                    self.stats.fill_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok((current, false));
                }

                let live = layout.live_count(block);
                if live >= slots {
                    return Err(Error::invariant(format!(
                        "block {} counts {} live entries but has only {} slots",
                        layout.block_number(id),
                        live,
                        slots
                    )));
                }
                layout.write_entry(block, offset, fallback);
                layout.set_live_count(block, live + 1);
                self.stats.fill_inits.fetch_add(1, Ordering::Relaxed);
                Ok((fallback, true))
            },
        )?;

        trace!("fill ino={} atime={}", id, time);
        Ok(time)
    }

    /// Overwrite the access time of an object that already has an entry
    pub fn update(&self, id: ObjectId, time: Timespec) -> Result<()> {
        let Backing::File { layout, metafile } = &self.backing else {
            return Ok(());
        };
        self.stats.updates.fetch_add(1, Ordering::Relaxed);

        let time = time.to_stored();
        let _guard = self.lock.lock();

        with_block(metafile.as_ref(), layout, id, BlockAccess::Existing, |block, offset| {
            if layout.read_entry(block, offset).is_absent() {
                return Err(absent_entry("update", id));
            }
            layout.write_entry(block, offset, time);
            Ok(((), true))
        })
        .map_err(|e| missing_block_as_absent(e, "update", id))
        .inspect_err(|e| warn!("atime update failed: {}", e))?;

        trace!("update ino={} atime={}", id, time);
        Ok(())
    }

    /// Remove an object's entry, reclaiming its block if it was the last one
    pub fn delete(&self, id: ObjectId) -> Result<()> {
        let Backing::File { layout, metafile } = &self.backing else {
            return Ok(());
        };
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);

        let block_number = layout.block_number(id);
        let _guard = self.lock.lock();

        let ((), live) = with_block(metafile.as_ref(), layout, id, BlockAccess::Existing, |block, offset| {
            if layout.read_entry(block, offset).is_absent() {
                return Err(absent_entry("delete", id));
            }
            let live = layout.live_count(block).checked_sub(1).ok_or_else(|| {
                Error::invariant(format!(
                    "block {block_number} holds ino {id} but its live count is zero"
                ))
            })?;
            layout.write_entry(block, offset, Timespec::ABSENT);
            layout.set_live_count(block, live);
            Ok(((), true))
        })
        .map_err(|e| missing_block_as_absent(e, "delete", id))
        .inspect_err(|e| warn!("atime delete failed: {}", e))?;

        // The handle is released by now; the store lock is still held.
        if live == 0 {
            metafile.delete_block(block_number)?;
            self.stats.blocks_reclaimed.fetch_add(1, Ordering::Relaxed);
            debug!("reclaimed atime block {} after deleting ino {}", block_number, id);
        }
        Ok(())
    }

    /// Resolve an inode's access time, using its mtime as the fallback
    pub fn fill_inode<I: AtimeInode + ?Sized>(&self, inode: &mut I) -> Result<Timespec> {
        let atime = self.fill(inode.ino(), inode.mtime())?;
        inode.set_atime(atime);
        Ok(atime)
    }

    /// Record a new access time for an inode
    pub fn touch_inode<I: AtimeInode + ?Sized>(&self, inode: &mut I, now: Timespec) -> Result<()> {
        self.update(inode.ino(), now)?;
        let stored = if self.is_bypass() { now } else { now.to_stored() };
        inode.set_atime(stored);
        Ok(())
    }

    /// Look up an object's entry without creating or dirtying anything
    pub fn get(&self, id: ObjectId) -> Result<Option<Timespec>> {
        let Backing::File { layout, .. } = &self.backing else {
            return Ok(None);
        };
        Ok(self
            .read_block(layout.block_number(id))?
            .map(|block| block.entries[layout.offset(id)])
            .filter(|t| !t.is_absent()))
    }

    /// Decode a stored block, `None` if the block does not exist
    pub fn read_block(&self, block_number: u64) -> Result<Option<AtimeBlock>> {
        let Backing::File { layout, metafile } = &self.backing else {
            return Ok(None);
        };
        let _guard = self.lock.lock();

        let handle = match metafile.get_block(block_number, false, &|_: &mut [u8]| {}) {
            Ok(handle) => handle,
            Err(Error::BlockNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let decoded = AtimeBlock::decode(layout, &handle.data());
        metafile.release_block(handle);
        decoded.map(Some)
    }

    /// Numbers of all existing blocks, ascending
    pub fn block_numbers(&self) -> Result<Vec<u64>> {
        match &self.backing {
            Backing::Bypass => Ok(Vec::new()),
            Backing::File { metafile, .. } => metafile.block_numbers(),
        }
    }

    /// Check every stored block's counter against its entries
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        for block_number in self.block_numbers()? {
            let Some(block) = self.read_block(block_number)? else {
                continue;
            };
            let present = block.present();
            report.blocks_checked += 1;
            report.live_entries += present;
            if present == 0 && block.live_entries == 0 {
                report.reclaimable.push(block_number);
            }
            if !block.is_consistent() {
                warn!(
                    "atime block {} records {} live entries, found {}",
                    block_number, block.live_entries, present
                );
                report.mismatches.push(BlockMismatch {
                    block: block_number,
                    recorded: block.live_entries,
                    present,
                });
            }
        }
        Ok(report)
    }

    /// Write back all dirty blocks; returns the number written
    pub fn flush(&self) -> Result<u64> {
        let Backing::File { metafile, .. } = &self.backing else {
            return Ok(0);
        };
        let _guard = self.lock.lock();
        metafile.flush()
    }
}

/// How [`with_block`] obtains the block owning an entry
#[derive(Clone, Copy, Debug)]
enum BlockAccess {
    /// Create the block zero-filled if it does not exist yet
    Create { dirty_on_acquire: bool },
    /// Fail with `BlockNotFound` if the block does not exist; dirty only on
    /// a successful modification
    Existing,
}

fn absent_entry(op: &str, id: ObjectId) -> Error {
    Error::invariant(format!("{op} of ino {id} which has no atime entry"))
}

/// A missing block holds no entries, so the entry is absent
fn missing_block_as_absent(e: Error, op: &str, id: ObjectId) -> Error {
    match e {
        Error::BlockNotFound { .. } => absent_entry(op, id),
        e => e,
    }
}

fn mark_dirty(metafile: &dyn MetadataFile, handle: &crate::metafile::BlockHandle) {
    metafile.mark_block_dirty(handle);
    metafile.mark_file_dirty();
}

/// Run `op` over the block owning `id` and release the block afterwards
///
/// `op` gets the block buffer and the slot offset of `id`, and returns its
/// value plus whether it modified the block. It must check before it writes,
/// so an error leaves the block as it was. Returns the value and the block's
/// live count after `op`. The caller holds the store lock.
fn with_block<R>(
    metafile: &dyn MetadataFile,
    layout: &AtimeLayout,
    id: ObjectId,
    access: BlockAccess,
    op: impl FnOnce(&mut [u8], usize) -> Result<(R, bool)>,
) -> Result<(R, u64)> {
    let (create, dirty_on_acquire) = match access {
        BlockAccess::Create { dirty_on_acquire } => (true, dirty_on_acquire),
        BlockAccess::Existing => (false, false),
    };
    let handle = metafile.get_block(layout.block_number(id), create, &|buf: &mut [u8]| {
        buf.fill(0);
    })?;
    if dirty_on_acquire {
        mark_dirty(metafile, &handle);
    }

    let result = {
        let mut data = handle.data();
        op(&mut data, layout.offset(id))
            .map(|(value, modified)| (value, modified, layout.live_count(&data)))
    };

    if matches!(result, Ok((_, true, _))) && !dirty_on_acquire {
        mark_dirty(metafile, &handle);
    }
    metafile.release_block(handle);

    result.map(|(value, _, live)| (value, live))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BlockBackend, MemBackend};
    use crate::inode::InodeAttrs;
    use crate::metafile::BlockHandle;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::thread;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Get(u64),
        Release(u64),
        Delete(u64),
    }

    /// Metadata file that records the calls made to it
    struct RecordingFile {
        inner: MetaBlockCache<MemBackend>,
        events: Mutex<Vec<Event>>,
    }

    impl RecordingFile {
        fn new(block_size: usize) -> Self {
            Self {
                inner: MetaBlockCache::new(MemBackend::new(block_size), 16),
                events: Mutex::new(Vec::new()),
            }
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }
    }

    impl MetadataFile for RecordingFile {
        fn block_size(&self) -> usize {
            self.inner.block_size()
        }

        fn configure_entry_layout(&self, block_size: usize, header_size: usize) -> Result<()> {
            self.inner.configure_entry_layout(block_size, header_size)
        }

        fn get_block(
            &self,
            block: u64,
            create: bool,
            init: &dyn Fn(&mut [u8]),
        ) -> Result<BlockHandle> {
            self.events.lock().push(Event::Get(block));
            self.inner.get_block(block, create, init)
        }

        fn mark_block_dirty(&self, handle: &BlockHandle) {
            self.inner.mark_block_dirty(handle);
        }

        fn mark_file_dirty(&self) {
            self.inner.mark_file_dirty();
        }

        fn is_dirty(&self) -> bool {
            self.inner.is_dirty()
        }

        fn release_block(&self, handle: BlockHandle) {
            self.events.lock().push(Event::Release(handle.block_number()));
            self.inner.release_block(handle);
        }

        fn delete_block(&self, block: u64) -> Result<()> {
            self.events.lock().push(Event::Delete(block));
            self.inner.delete_block(block)
        }

        fn flush(&self) -> Result<u64> {
            self.inner.flush()
        }

        fn block_numbers(&self) -> Result<Vec<u64>> {
            self.inner.block_numbers()
        }
    }

    /// Backend whose reads always fail
    struct FailingBackend;

    impl BlockBackend for FailingBackend {
        fn block_size(&self) -> usize {
            512
        }

        fn read_block(&self, _block: u64, _buf: &mut [u8]) -> Result<bool> {
            Err(Error::Io(std::io::Error::other("disk gone")))
        }

        fn write_block(&self, _block: u64, _data: &[u8]) -> Result<()> {
            Err(Error::Io(std::io::Error::other("disk gone")))
        }

        fn discard_block(&self, _block: u64) -> Result<()> {
            Ok(())
        }

        fn block_numbers(&self) -> Result<Vec<u64>> {
            Ok(Vec::new())
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    fn small_config() -> AtimeConfig {
        AtimeConfig {
            block_size: 512,
            ..Default::default()
        }
    }

    fn mem_store() -> AtimeFile {
        let cache = MetaBlockCache::new(MemBackend::new(512), 64);
        AtimeFile::with_metafile(Arc::new(cache), &small_config()).unwrap()
    }

    fn recording_store() -> (AtimeFile, Arc<RecordingFile>) {
        let file = Arc::new(RecordingFile::new(512));
        let store = AtimeFile::with_metafile(file.clone(), &small_config()).unwrap();
        (store, file)
    }

    fn live_count(store: &AtimeFile, block: u64) -> Option<u64> {
        store.read_block(block).unwrap().map(|b| b.live_entries)
    }

    fn id(n: u64) -> ObjectId {
        ObjectId::new(n)
    }

    #[test]
    fn test_fill_update_delete_scenario() {
        let (store, file) = recording_store();
        assert_eq!(store.layout().unwrap().entries_per_block(), 31);

        let t = store.fill(id(10), Timespec::from_secs(1000)).unwrap();
        assert_eq!(t, Timespec::from_secs(1000));
        assert_eq!(live_count(&store, 0), Some(1));

        let t = store.fill(id(10), Timespec::from_secs(2000)).unwrap();
        assert_eq!(t, Timespec::from_secs(1000));
        assert_eq!(live_count(&store, 0), Some(1));

        file.events.lock().clear();
        store.delete(id(10)).unwrap();
        assert_eq!(
            file.events(),
            vec![Event::Get(0), Event::Release(0), Event::Delete(0)]
        );
        assert_eq!(live_count(&store, 0), None);
        assert_eq!(store.get(id(10)).unwrap(), None);
        assert_eq!(store.stats().blocks_reclaimed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reclaim_only_when_block_empties() {
        let (store, file) = recording_store();

        store.fill(id(1), Timespec::from_secs(5)).unwrap();
        store.fill(id(2), Timespec::from_secs(6)).unwrap();

        store.delete(id(1)).unwrap();
        assert!(!file.events().contains(&Event::Delete(0)));
        assert_eq!(live_count(&store, 0), Some(1));

        store.delete(id(2)).unwrap();
        let deletes = file
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Delete(_)))
            .count();
        assert_eq!(deletes, 1);
    }

    #[test]
    fn test_fill_idempotent() {
        let store = mem_store();
        let first = Timespec::new(1_700_000_000, 42);

        assert_eq!(store.fill(id(77), first).unwrap(), first);
        for secs in [1, 2_000_000_000, -5] {
            assert_eq!(store.fill(id(77), Timespec::from_secs(secs)).unwrap(), first);
        }
        assert_eq!(store.get(id(77)).unwrap(), Some(first));
        assert_eq!(store.stats().fill_inits.load(Ordering::Relaxed), 1);
        assert_eq!(store.stats().fill_hits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_adjacent_blocks_are_independent() {
        let store = mem_store();

        store.fill(id(30), Timespec::from_secs(1)).unwrap();
        store.fill(id(31), Timespec::from_secs(2)).unwrap();
        assert_eq!(live_count(&store, 0), Some(1));
        assert_eq!(live_count(&store, 1), Some(1));

        store.delete(id(31)).unwrap();
        assert_eq!(live_count(&store, 0), Some(1));
        assert_eq!(live_count(&store, 1), None);
        assert_eq!(store.get(id(30)).unwrap(), Some(Timespec::from_secs(1)));
    }

    #[test]
    fn test_delete_after_fill_clears_entry() {
        let store = mem_store();

        store.fill(id(3), Timespec::from_secs(10)).unwrap();
        store.fill(id(4), Timespec::from_secs(11)).unwrap();
        assert_eq!(live_count(&store, 0), Some(2));

        store.delete(id(3)).unwrap();
        let block = store.read_block(0).unwrap().unwrap();
        assert_eq!(block.live_entries, 1);
        assert!(block.entries[3].is_absent());
        assert!(block.is_consistent());
    }

    #[test]
    fn test_double_delete_is_invariant_violation() {
        let store = mem_store();

        store.fill(id(5), Timespec::from_secs(1)).unwrap();
        store.fill(id(6), Timespec::from_secs(1)).unwrap();
        store.delete(id(5)).unwrap();

        let err = store.delete(id(5)).unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(live_count(&store, 0), Some(1));
    }

    #[test]
    fn test_update_requires_present_entry() {
        let store = mem_store();

        let err = store.update(id(9), Timespec::from_secs(50)).unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(store.get(id(9)).unwrap(), None);
        assert_eq!(live_count(&store, 0), None);

        store.fill(id(9), Timespec::from_secs(50)).unwrap();
        store.update(id(9), Timespec::from_secs(60)).unwrap();
        assert_eq!(store.get(id(9)).unwrap(), Some(Timespec::from_secs(60)));
        assert_eq!(live_count(&store, 0), Some(1));
    }

    #[test]
    fn test_rejected_calls_create_no_blocks() {
        let (store, file) = recording_store();

        assert!(store.delete(id(217)).unwrap_err().is_invariant_violation());
        assert!(store
            .update(id(279), Timespec::from_secs(5))
            .unwrap_err()
            .is_invariant_violation());

        assert!(store.block_numbers().unwrap().is_empty());
        assert_eq!(store.verify().unwrap(), VerifyReport::default());
        assert!(!store.is_dirty());
        assert!(!file.events().iter().any(|e| matches!(e, Event::Delete(_))));

        // An absent entry in an existing block is rejected the same way
        store.fill(id(1), Timespec::from_secs(1)).unwrap();
        assert!(store.delete(id(2)).unwrap_err().is_invariant_violation());
        assert_eq!(store.block_numbers().unwrap(), vec![0]);
        assert_eq!(live_count(&store, 0), Some(1));
    }

    #[test]
    fn test_epoch_fallback_stays_present() {
        let store = mem_store();

        let t = store.fill(id(1), Timespec::ABSENT).unwrap();
        assert!(!t.is_absent());
        assert_eq!(live_count(&store, 0), Some(1));

        store.update(id(1), Timespec::ABSENT).unwrap();
        assert!(store.read_block(0).unwrap().unwrap().is_consistent());
    }

    #[test]
    fn test_bypass_mode() {
        let store = AtimeFile::bypass();
        assert!(store.is_bypass());
        assert!(store.layout().is_none());

        for n in [0, 31, 1 << 40, u64::MAX] {
            let fallback = Timespec::new(n as i64 & 0xFFFF, 3);
            assert_eq!(store.fill(id(n), fallback).unwrap(), fallback);
        }
        store.update(id(1), Timespec::from_secs(1)).unwrap();
        store.delete(id(1)).unwrap();

        assert_eq!(store.stats().bypassed_fills.load(Ordering::Relaxed), 4);
        assert_eq!(store.stats().fills.load(Ordering::Relaxed), 0);
        assert!(!store.is_dirty());
        assert!(store.verify().unwrap().is_clean());
    }

    #[test]
    fn test_open_without_path_is_bypass() {
        let store = AtimeFile::open(&AtimeConfig::default()).unwrap();
        assert!(store.is_bypass());
    }

    #[test]
    fn test_fill_inode() {
        let store = mem_store();
        let mut inode = InodeAttrs::new(id(12), Timespec::from_secs(300));

        assert_eq!(store.fill_inode(&mut inode).unwrap(), Timespec::from_secs(300));
        assert_eq!(inode.atime, Timespec::from_secs(300));

        store.touch_inode(&mut inode, Timespec::from_secs(400)).unwrap();
        assert_eq!(inode.atime, Timespec::from_secs(400));

        let mut reloaded = InodeAttrs::new(id(12), Timespec::from_secs(300));
        store.fill_inode(&mut reloaded).unwrap();
        assert_eq!(reloaded.atime, Timespec::from_secs(400));

        let bypass = AtimeFile::bypass();
        let mut inode = InodeAttrs::new(id(12), Timespec::from_secs(300));
        bypass.fill_inode(&mut inode).unwrap();
        assert_eq!(inode.atime, inode.mtime);
    }

    #[test]
    fn test_fill_dirty_policy() {
        let cache = MetaBlockCache::new(MemBackend::new(512), 8);
        let config = AtimeConfig {
            mark_dirty_on_fill: false,
            ..small_config()
        };
        let store = AtimeFile::with_metafile(Arc::new(cache), &config).unwrap();

        store.fill(id(2), Timespec::from_secs(1)).unwrap();
        assert!(store.is_dirty());
        assert_eq!(store.flush().unwrap(), 1);
        assert!(!store.is_dirty());

        // Entry already present: nothing changes, nothing dirtied
        store.fill(id(2), Timespec::from_secs(2)).unwrap();
        assert!(!store.is_dirty());

        let eager = mem_store();
        eager.fill(id(2), Timespec::from_secs(1)).unwrap();
        eager.flush().unwrap();
        eager.fill(id(2), Timespec::from_secs(2)).unwrap();
        assert!(eager.is_dirty());
    }

    #[test]
    fn test_io_error_holds_no_block() {
        let cache = Arc::new(MetaBlockCache::new(FailingBackend, 8));
        let store = AtimeFile::with_metafile(cache.clone(), &small_config()).unwrap();

        let err = store.fill(id(1), Timespec::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_block_size_mismatch_rejected() {
        let cache = MetaBlockCache::new(MemBackend::new(1024), 8);
        assert!(AtimeFile::with_metafile(Arc::new(cache), &small_config()).is_err());
    }

    #[test]
    fn test_randomized_counters_match_entries() {
        let store = mem_store();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut model: HashMap<u64, Timespec> = HashMap::new();

        for step in 0..2000 {
            let n = rng.gen_range(0..100u64);
            if model.contains_key(&n) && rng.gen_bool(0.5) {
                store.delete(id(n)).unwrap();
                model.remove(&n);
            } else {
                let fallback = Timespec::from_secs(rng.gen_range(1..1_000_000));
                let got = store.fill(id(n), fallback).unwrap();
                assert_eq!(got, *model.entry(n).or_insert(fallback));
            }

            if step % 100 == 0 {
                let report = store.verify().unwrap();
                assert!(report.is_clean(), "{report:?}");
                assert_eq!(report.live_entries, model.len() as u64);
            }
        }

        for block in 0..4u64 {
            let expected = model.keys().filter(|&&n| n / 31 == block).count() as u64;
            assert_eq!(live_count(&store, block).unwrap_or(0), expected);
        }
    }

    #[test]
    fn test_concurrent_fill_delete_same_block() {
        let store = Arc::new(mem_store());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    // Each thread owns ids t, t+8, t+16, t+24, all in block 0
                    for round in 0..200 {
                        for n in (t..31).step_by(8) {
                            store.fill(id(n), Timespec::from_secs(round + 1)).unwrap();
                        }
                        if round % 2 == 0 {
                            for n in (t..31).step_by(8) {
                                store.delete(id(n)).unwrap();
                            }
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let report = store.verify().unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(live_count(&store, 0), Some(31));
    }

    #[test]
    fn test_file_backed_persistence() {
        let dir = tempdir().unwrap();
        let config = AtimeConfig {
            cache_blocks: 4,
            ..AtimeConfig::with_path(dir.path().join("atime"))
        };

        {
            let store = AtimeFile::open(&config).unwrap();
            store.fill(id(1), Timespec::new(100, 1)).unwrap();
            store.fill(id(600), Timespec::new(200, 2)).unwrap();
            store.fill(id(601), Timespec::new(300, 3)).unwrap();
            store.delete(id(1)).unwrap();
            assert!(store.flush().unwrap() >= 1);
        }

        let store = AtimeFile::open(&config).unwrap();
        assert_eq!(store.get(id(1)).unwrap(), None);
        assert_eq!(store.get(id(600)).unwrap(), Some(Timespec::new(200, 2)));
        assert_eq!(store.fill(id(601), Timespec::from_secs(9)).unwrap(), Timespec::new(300, 3));

        let report = store.verify().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.blocks_checked, 1);
        assert_eq!(report.live_entries, 2);
        assert!(store.read_block(0).unwrap().is_none());
    }

    #[test]
    fn test_verify_reports_mismatch() {
        let backend = MemBackend::new(512);
        let layout = AtimeLayout::new(512).unwrap();
        let mut raw = vec![0u8; 512];
        layout.set_live_count(&mut raw, 3);
        layout.write_entry(&mut raw, 0, Timespec::from_secs(1));
        backend.write_block(2, &raw).unwrap();
        backend.write_block(4, &vec![0u8; 512]).unwrap();

        let store =
            AtimeFile::with_metafile(Arc::new(MetaBlockCache::new(backend, 8)), &small_config())
                .unwrap();
        let report = store.verify().unwrap();

        assert!(!report.is_clean());
        assert_eq!(
            report.mismatches,
            vec![BlockMismatch {
                block: 2,
                recorded: 3,
                present: 1
            }]
        );
    }
}
