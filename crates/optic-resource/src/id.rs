use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use optic_chunk::{ReadLeExt, Result, WriteLeExt};

/// Process-unique identifier for a wrapped resource.
///
/// Ids are allocated monotonically and never reused. The top bit records
/// which numbering space the id came from: ids minted while replaying a
/// capture must never collide with ids read out of that capture, since both
/// kinds coexist in the replay session's maps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub struct ResourceId(u64);

const REPLAY_BIT: u64 = 1 << 63;

impl ResourceId {
    pub const NULL: ResourceId = ResourceId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_replay_generated(self) -> bool {
        self.0 & REPLAY_BIT != 0
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> ResourceId {
        ResourceId(raw)
    }
}

impl core::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_null() {
            write!(f, "rid:null")
        } else if self.is_replay_generated() {
            write!(f, "rid:{}'", self.0 & !REPLAY_BIT)
        } else {
            write!(f, "rid:{}", self.0)
        }
    }
}

/// Monotonic id source. One per logical device; the replay side gets its own
/// allocator flagged so its ids live in the second numbering space.
pub struct IdAllocator {
    next: AtomicU64,
    replay: bool,
}

impl IdAllocator {
    pub fn new(replay: bool) -> Self {
        Self {
            next: AtomicU64::new(1),
            replay,
        }
    }

    pub fn alloc(&self) -> ResourceId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        if self.replay {
            ResourceId(n | REPLAY_BIT)
        } else {
            ResourceId(n)
        }
    }
}

/// Ids serialize as their raw u64; [`ResourceId::NULL`] doubles as the
/// "unbound" encoding, so no separate presence flag is needed.
pub trait IdWriteExt: Write {
    fn write_id(&mut self, id: ResourceId) -> Result<()> {
        self.write_u64_le(id.to_raw())
    }
}

impl<T: Write + ?Sized> IdWriteExt for T {}

pub trait IdReadExt: Read {
    fn read_id(&mut self) -> Result<ResourceId> {
        Ok(ResourceId::from_raw(self.read_u64_le()?))
    }
}

impl<T: Read + ?Sized> IdReadExt for T {}
