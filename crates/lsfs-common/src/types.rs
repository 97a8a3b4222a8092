//! Core type definitions for lsfs
//!
//! Object identifiers and the second/nanosecond timestamps stored in the
//! atime file.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Stable integer key identifying a filesystem object (inode number)
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    From,
    Into,
    Display,
)]
#[display("{_0}")]
pub struct ObjectId(u64);

impl ObjectId {
    /// Create from a raw inode number
    #[must_use]
    pub const fn new(ino: u64) -> Self {
        Self(ino)
    }

    /// Get the raw inode number
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// A point in time as seconds and nanoseconds since the Unix epoch
///
/// `nsec` is always kept in `0..1_000_000_000`, so the derived ordering is
/// chronological.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    /// The all-zero value, which the atime file reserves for "no entry"
    pub const ABSENT: Self = Self { sec: 0, nsec: 0 };

    /// Create a timestamp, folding out-of-range nanoseconds into seconds
    #[must_use]
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self {
            sec: sec.saturating_add(nsec.div_euclid(NSEC_PER_SEC)),
            nsec: nsec.rem_euclid(NSEC_PER_SEC),
        }
    }

    /// Create a timestamp on a whole second
    #[must_use]
    pub const fn from_secs(sec: i64) -> Self {
        Self { sec, nsec: 0 }
    }

    /// Current wall-clock time
    #[must_use]
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Convert from a `SystemTime`, including times before the epoch
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self::new(
                i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                i64::from(d.subsec_nanos()),
            ),
            Err(e) => {
                let d = e.duration();
                Self::new(
                    -i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                    -i64::from(d.subsec_nanos()),
                )
            }
        }
    }

    /// Convert to a `SystemTime`, `None` if the platform cannot represent it
    #[must_use]
    pub fn to_system_time(self) -> Option<SystemTime> {
        let t = Self::new(self.sec, self.nsec);
        let secs = Duration::from_secs(t.sec.unsigned_abs());
        let base = if t.sec >= 0 {
            UNIX_EPOCH.checked_add(secs)?
        } else {
            UNIX_EPOCH.checked_sub(secs)?
        };
        base.checked_add(Duration::from_nanos(t.nsec.unsigned_abs()))
    }

    /// Whether this is the reserved "no entry" value
    #[must_use]
    pub const fn is_absent(self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    /// The value to store for this time
    ///
    /// The epoch itself would collide with the absent marker, so it is
    /// stored one nanosecond later.
    #[must_use]
    pub const fn to_stored(self) -> Self {
        let t = Self::new(self.sec, self.nsec);
        if t.is_absent() { Self { sec: 0, nsec: 1 } } else { t }
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = Self::new(self.sec, self.nsec);
        if t.sec < 0 && t.nsec > 0 {
            // -2 s + 0.5 s is written -1.5
            write!(f, "-{}.{:09}", -(t.sec + 1), NSEC_PER_SEC - t.nsec)
        } else {
            write!(f, "{}.{:09}", t.sec, t.nsec)
        }
    }
}

impl From<SystemTime> for Timespec {
    fn from(time: SystemTime) -> Self {
        Self::from_system_time(time)
    }
}
