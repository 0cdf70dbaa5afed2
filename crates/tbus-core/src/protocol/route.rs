//! Address paths through a tree of nested buses.
//!
//! # How routing works (for beginners)
//!
//! Every bus hands out small addresses (1, 2, 3, ...) to the devices plugged
//! into it.  A bus can itself be plugged into a parent bus, so the address
//! space is a tree.  To reach a device deep in the tree the sender lists one
//! address per bus on the way down:
//!
//! ```text
//! root bus ──[1]──► bus A ──[4]──► bus B ──[2]──► LED
//!
//! path = [1, 4, 2]
//! ```
//!
//! Each bus reads the *first* hop, forwards the message to that device, and
//! removes the hop it consumed.  When the path is empty the message has
//! arrived.
//!
//! # Why not mutate the path in place?
//!
//! A [`RoutePath`] stores the hops in a shared, immutable buffer (`Arc<[u8]>`)
//! together with the number of hops already consumed.  Stripping a hop builds a
//! new `RoutePath` over the same buffer, so a message that is still being
//! encoded elsewhere can never observe a half-modified path.

use std::fmt;
use std::sync::Arc;

/// Maximum number of hops a route prefix can describe (5-bit count + 1).
pub const MAX_HOPS: usize = 32;

/// An ordered list of per-hop bus addresses, with a consumed-hops cursor.
#[derive(Clone, Default)]
pub struct RoutePath {
    /// All hops as originally received or built.  Never modified.
    hops: Option<Arc<[u8]>>,
    /// Number of leading hops already stripped by buses on the way down.
    consumed: usize,
}

impl RoutePath {
    /// Builds a path from a list of hop addresses.
    ///
    /// An empty list produces a local (un-routed) path.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tbus_core::protocol::RoutePath;
    ///
    /// let path = RoutePath::new([1, 4, 2]);
    /// assert_eq!(path.hops(), &[1, 4, 2]);
    /// assert_eq!(path.next_hop(), Some(1));
    /// ```
    pub fn new(hops: impl Into<Vec<u8>>) -> Self {
        let hops: Vec<u8> = hops.into();
        if hops.is_empty() {
            return Self::local();
        }
        Self {
            hops: Some(Arc::from(hops)),
            consumed: 0,
        }
    }

    /// A path with no hops: the message targets the receiving endpoint.
    pub fn local() -> Self {
        Self {
            hops: None,
            consumed: 0,
        }
    }

    /// The hops that have not been consumed yet.
    pub fn hops(&self) -> &[u8] {
        match &self.hops {
            Some(hops) => &hops[self.consumed..],
            None => &[],
        }
    }

    /// Number of remaining hops.
    pub fn len(&self) -> usize {
        self.hops().len()
    }

    /// `true` when no hops remain.
    pub fn is_empty(&self) -> bool {
        self.hops().is_empty()
    }

    /// The address the next bus must look up, if any.
    pub fn next_hop(&self) -> Option<u8> {
        self.hops().first().copied()
    }

    /// Returns the path with its first remaining hop removed.
    ///
    /// The underlying buffer is shared, not copied.  Stripping an empty path
    /// returns another empty path.
    pub fn stripped(&self) -> Self {
        if self.is_empty() {
            return Self::local();
        }
        Self {
            hops: self.hops.clone(),
            consumed: self.consumed + 1,
        }
    }

    /// Returns a new path that reaches `addr` first and then follows `self`.
    pub fn prefixed(&self, addr: u8) -> Self {
        let mut hops = Vec::with_capacity(self.len() + 1);
        hops.push(addr);
        hops.extend_from_slice(self.hops());
        Self::new(hops)
    }

    /// Returns a new path that follows `self` and then goes one hop further to `addr`.
    pub fn join(&self, addr: u8) -> Self {
        let mut hops = self.hops().to_vec();
        hops.push(addr);
        Self::new(hops)
    }
}

impl PartialEq for RoutePath {
    fn eq(&self, other: &Self) -> bool {
        self.hops() == other.hops()
    }
}

impl Eq for RoutePath {}

impl fmt::Debug for RoutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RoutePath").field(&self.hops()).finish()
    }
}

impl From<Vec<u8>> for RoutePath {
    fn from(hops: Vec<u8>) -> Self {
        Self::new(hops)
    }
}

impl From<&[u8]> for RoutePath {
    fn from(hops: &[u8]) -> Self {
        Self::new(hops.to_vec())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
