//! Bitmap allocator for message ids.
//!
//! # Why not a simple counter? (for beginners)
//!
//! A master correlates each reply with the request that caused it through the
//! message id.  Two requests that are in flight at the same time must never
//! share an id, but ids of finished requests can be handed out again.  Reusing
//! ids keeps them small, and small ids are encoded in fewer bytes on the wire.
//!
//! The allocator keeps one bit per id in a growable array of 64-bit words:
//!
//! ```text
//! word 0: ...0000_0000_0000_1011
//!                             │└─ id 0: permanently reserved
//!                             └── id 1: allocated
//! ```
//!
//! A cursor remembers where the last search stopped, so consecutive
//! allocations walk forward instead of always returning the lowest free id.
//! That makes a just-released id unlikely to be reused immediately, which
//! helps when reading traces.
//!
//! # Thread safety
//!
//! The allocator is a plain value.  Callers that share it wrap it in a
//! `Mutex` together with the table of pending requests it guards.

const WORD_BITS: u32 = 64;

/// Allocates message ids that are unique among the outstanding ones.
///
/// Id 0 is reserved and never returned.
///
/// # Examples
///
/// ```rust
/// use tbus_core::IdAllocator;
///
/// let mut ids = IdAllocator::new();
/// let a = ids.alloc();
/// let b = ids.alloc();
/// assert_ne!(a, b);
/// assert_ne!(a, 0);
///
/// ids.release(a);
/// assert!(!ids.is_allocated(a));
/// ```
#[derive(Debug, Clone)]
pub struct IdAllocator {
    words: Vec<u64>,
    /// Where the next search starts.
    cursor: u32,
}

impl IdAllocator {
    /// Creates an allocator with one word of capacity and id 0 reserved.
    pub fn new() -> Self {
        Self {
            words: vec![1],
            cursor: 1,
        }
    }

    /// Number of ids the bitmap can currently represent.
    pub fn capacity(&self) -> u32 {
        self.words.len() as u32 * WORD_BITS
    }

    /// Returns a free id and marks it allocated.
    ///
    /// Searches from the cursor to the end of the bitmap, then wraps around to
    /// the beginning.  When every bit is taken the bitmap grows by one word.
    pub fn alloc(&mut self) -> u32 {
        let id = match self
            .find_free(self.cursor, self.capacity())
            .or_else(|| self.find_free(0, self.cursor))
        {
            Some(id) => id,
            None => {
                let id = self.capacity();
                self.words.push(0);
                id
            }
        };
        self.set(id);
        self.cursor = id + 1;
        id
    }

    /// Marks `id` free.  Id 0 and ids that are not allocated are ignored.
    pub fn release(&mut self, id: u32) {
        if id == 0 || !self.is_allocated(id) {
            return;
        }
        let (word, bit) = Self::locate(id);
        self.words[word] &= !(1u64 << bit);
    }

    pub fn is_allocated(&self, id: u32) -> bool {
        let (word, bit) = Self::locate(id);
        self.words
            .get(word)
            .map_or(false, |w| w & (1u64 << bit) != 0)
    }

    /// Number of outstanding ids, not counting the reserved id 0.
    pub fn allocated(&self) -> usize {
        let total: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        total as usize - 1
    }

    fn locate(id: u32) -> (usize, u32) {
        ((id / WORD_BITS) as usize, id % WORD_BITS)
    }

    fn set(&mut self, id: u32) {
        let (word, bit) = Self::locate(id);
        self.words[word] |= 1u64 << bit;
    }

    /// First clear bit in `[from, to)`, skipping whole words that are full.
    fn find_free(&self, from: u32, to: u32) -> Option<u32> {
        let mut id = from;
        while id < to {
            let (word, bit) = Self::locate(id);
            let free = !self.words[word] >> bit;
            if free == 0 {
                id = (word as u32 + 1) * WORD_BITS;
                continue;
            }
            let candidate = id + free.trailing_zeros();
            return (candidate < to).then_some(candidate);
        }
        None
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_first_id_is_one() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.alloc(), 1);
        assert_eq!(ids.alloc(), 2);
    }

    #[test]
    fn test_zero_is_never_returned_or_released() {
        // Arrange
        let mut ids = IdAllocator::new();

        // Act
        ids.release(0);
        let handed_out: Vec<u32> = (0..500).map(|_| ids.alloc()).collect();

        // Assert
        assert!(!handed_out.contains(&0));
        assert!(ids.is_allocated(0));
    }

    #[test]
    fn test_outstanding_ids_are_unique() {
        // Arrange
        let mut ids = IdAllocator::new();
        let mut outstanding = HashSet::new();

        // Act – interleave allocations and releases
        for round in 0..1000u32 {
            let id = ids.alloc();
            assert!(outstanding.insert(id), "id {id} handed out twice");
            if round % 3 == 0 {
                let victim = *outstanding.iter().next().unwrap();
                outstanding.remove(&victim);
                ids.release(victim);
            }
        }

        // Assert
        assert_eq!(ids.allocated(), outstanding.len());
    }

    #[test]
    fn test_grows_by_one_word_when_full() {
        // Arrange – fill the first word (ids 1..=63)
        let mut ids = IdAllocator::new();
        for _ in 1..64 {
            ids.alloc();
        }
        assert_eq!(ids.capacity(), 64);

        // Act
        let id = ids.alloc();

        // Assert
        assert_eq!(id, 64);
        assert_eq!(ids.capacity(), 128);
    }

    #[test]
    fn test_search_wraps_around_to_released_ids() {
        // Arrange – fill the first word, release id 5
        let mut ids = IdAllocator::new();
        for _ in 1..64 {
            ids.alloc();
        }
        ids.release(5);

        // Act – cursor is at the end, so the search wraps to the start
        let id = ids.alloc();

        // Assert
        assert_eq!(id, 5);
        assert_eq!(ids.capacity(), 64, "no growth needed");
    }

    #[test]
    fn test_cursor_moves_forward_past_released_ids() {
        let mut ids = IdAllocator::new();
        let a = ids.alloc();
        let _b = ids.alloc();
        ids.release(a);
        assert_eq!(ids.alloc(), 3, "search continues from the cursor");
    }

    #[test]
    fn test_release_of_unallocated_id_is_ignored() {
        let mut ids = IdAllocator::new();
        ids.release(7);
        ids.release(10_000);
        assert_eq!(ids.allocated(), 0);
    }

    #[test]
    fn test_allocated_excludes_reserved_zero() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.allocated(), 0);
        let id = ids.alloc();
        ids.alloc();
        assert_eq!(ids.allocated(), 2);
        ids.release(id);
        assert_eq!(ids.allocated(), 1);
    }
}
