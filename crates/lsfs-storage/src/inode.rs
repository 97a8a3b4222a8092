//! Inode-side view of access times
//!
//! The atime file does not own inodes. It only needs an inode's number, a
//! fallback time for objects that have no entry yet, and somewhere to put
//! the resolved access time.

use lsfs_common::{ObjectId, Timespec};

/// An object whose access time lives in the atime file
pub trait AtimeInode {
    /// Inode number, the key into the atime file
    fn ino(&self) -> ObjectId;

    /// Modification time, used when no access time has been recorded
    fn mtime(&self) -> Timespec;

    /// Publish the resolved access time on the in-memory inode
    fn set_atime(&mut self, atime: Timespec);
}

/// Plain in-memory inode attributes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InodeAttrs {
    pub ino: ObjectId,
    pub mtime: Timespec,
    pub atime: Timespec,
}

impl InodeAttrs {
    /// Attributes of a freshly loaded inode, access time not yet resolved
    #[must_use]
    pub const fn new(ino: ObjectId, mtime: Timespec) -> Self {
        Self {
            ino,
            mtime,
            atime: Timespec::ABSENT,
        }
    }
}

impl AtimeInode for InodeAttrs {
    fn ino(&self) -> ObjectId {
        self.ino
    }

    fn mtime(&self) -> Timespec {
        self.mtime
    }

    fn set_atime(&mut self, atime: Timespec) {
        self.atime = atime;
    }
}
