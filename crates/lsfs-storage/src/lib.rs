//! lsfs Storage - Block-indexed metadata files
//!
//! This crate implements the per-object attribute files of lsfs:
//! - Access-time store keeping atimes out of the inodes
//! - Block layout and codec for atime blocks
//! - Write-back metadata block cache (LRU, dirty tracking)
//! - File and in-memory block backends

pub mod atime;
pub mod backend;
pub mod cache;
pub mod inode;
pub mod layout;
pub mod metafile;

// Re-exports
pub use atime::{AtimeFile, AtimeStats, BlockMismatch, VerifyReport};
pub use backend::{BlockBackend, FileBackend, MemBackend};
pub use cache::{CacheStats, MetaBlockCache};
pub use inode::{AtimeInode, InodeAttrs};
pub use layout::{ATIME_ENTRY_SIZE, ATIME_HEADER_SIZE, AtimeBlock, AtimeLayout};
pub use metafile::{BlockHandle, MetadataFile};
