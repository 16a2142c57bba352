use parking_lot::Mutex;
use std::fmt;

/// A tenant's virtual network identifier.
///
/// Identifiers are carried in the tunnel id of encapsulated traffic, so they are limited to 24
/// bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vnid(u32);

/// Allocates VNIDs from a bounded range.
///
/// The allocator only tracks usage; it knows nothing about which namespace holds an id. The
/// registry is its only caller.
pub struct Allocator {
    min: u32,
    max: u32,
    used: Mutex<Bitmap>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("network id {0} is already allocated")]
    AlreadyAllocated(Vnid),

    #[error("network id {id} is outside of the allocatable range [{min}, {max}]")]
    OutOfRange { id: Vnid, min: Vnid, max: Vnid },

    #[error("network id range [{min}, {max}] is exhausted")]
    RangeExhausted { min: Vnid, max: Vnid },
}

struct Bitmap {
    words: Vec<u64>,
    count: usize,
}

// === impl Vnid ===

impl Vnid {
    /// The identifier of namespaces that are visible to, and can reach, every other namespace.
    pub const GLOBAL: Self = Self(0);

    pub const MIN: Self = Self(10);

    pub const MAX: Self = Self((1 << 24) - 1);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub fn is_global(self) -> bool {
        self == Self::GLOBAL
    }
}

impl From<u32> for Vnid {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<Vnid> for u32 {
    fn from(Vnid(id): Vnid) -> u32 {
        id
    }
}

impl std::str::FromStr for Vnid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for Vnid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl Allocator ===

impl Default for Allocator {
    fn default() -> Self {
        Self::new(Vnid::MIN, Vnid::MAX)
    }
}

impl Allocator {
    pub fn new(min: Vnid, max: Vnid) -> Self {
        // The global id is never allocatable, even if a caller configures a range that starts at
        // zero.
        let min = min.get().max(Vnid::GLOBAL.get() + 1);
        let max = max.get().max(min);
        let size = (max - min) as usize + 1;
        Self {
            min,
            max,
            used: Mutex::new(Bitmap::new(size)),
        }
    }

    /// Reserves a specific id.
    pub fn allocate(&self, id: Vnid) -> Result<(), AllocError> {
        let offset = self.offset(id).ok_or(AllocError::OutOfRange {
            id,
            min: Vnid(self.min),
            max: Vnid(self.max),
        })?;

        if !self.used.lock().set(offset) {
            return Err(AllocError::AlreadyAllocated(id));
        }
        Ok(())
    }

    /// Reserves the smallest free id.
    pub fn allocate_next(&self) -> Result<Vnid, AllocError> {
        let mut used = self.used.lock();
        let offset = used.first_clear().ok_or(AllocError::RangeExhausted {
            min: Vnid(self.min),
            max: Vnid(self.max),
        })?;
        let set = used.set(offset);
        debug_assert!(set, "first clear bit must be settable");
        Ok(Vnid(self.min + offset as u32))
    }

    /// Frees an id. Freeing an id that is not allocated, or that is outside the range, does
    /// nothing.
    pub fn release(&self, id: Vnid) {
        if let Some(offset) = self.offset(id) {
            self.used.lock().clear(offset);
        }
    }

    pub fn is_allocated(&self, id: Vnid) -> bool {
        self.offset(id)
            .map(|offset| self.used.lock().get(offset))
            .unwrap_or(false)
    }

    pub fn allocated_count(&self) -> usize {
        self.used.lock().count
    }

    pub fn capacity(&self) -> usize {
        (self.max - self.min) as usize + 1
    }

    fn offset(&self, Vnid(id): Vnid) -> Option<usize> {
        if id < self.min || id > self.max {
            return None;
        }
        Some((id - self.min) as usize)
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("allocated", &self.allocated_count())
            .finish()
    }
}

// === impl Bitmap ===

impl Bitmap {
    fn new(size: usize) -> Self {
        let mut words = vec![0u64; size.div_ceil(64)];
        // Mark the bits beyond the end of the range as used so that they are never handed out.
        let tail = size % 64;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = !0u64 << tail;
            }
        }
        Self { words, count: 0 }
    }

    fn get(&self, offset: usize) -> bool {
        self.words[offset / 64] & (1 << (offset % 64)) != 0
    }

    /// Returns false if the bit was already set.
    fn set(&mut self, offset: usize) -> bool {
        let word = &mut self.words[offset / 64];
        let bit = 1 << (offset % 64);
        if *word & bit != 0 {
            return false;
        }
        *word |= bit;
        self.count += 1;
        true
    }

    fn clear(&mut self, offset: usize) {
        let word = &mut self.words[offset / 64];
        let bit = 1 << (offset % 64);
        if *word & bit != 0 {
            *word &= !bit;
            self.count -= 1;
        }
    }

    fn first_clear(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != !0)
            .map(|(i, w)| i * 64 + w.trailing_ones() as usize)
    }
}
