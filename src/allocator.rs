//! Ephemeral port allocation.
//!
//! Issues external source ports for TCP and UDP flows and echo identifiers
//! for ICMP flows. The allocator itself does not know which ports are held
//! by live flows; the table layer verifies each proposal against its
//! external-key index and retries, falling back to [`PortAllocator::allocate_random`].

use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;

/// First port of the default ephemeral range.
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// Last port of the default ephemeral range.
pub const EPHEMERAL_PORT_END: u16 = 65535;

/// Lock-free issuer of external ports.
///
/// A monotonically incremented counter walks the range `[start, end)`; the
/// increment is a relaxed fetch-add so parallel packet workers never
/// serialize here.
#[derive(Debug)]
pub struct PortAllocator {
    counter: AtomicU32,
    start: u16,
    end: u16,
}

impl PortAllocator {
    /// Creates an allocator over `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty.
    #[must_use]
    pub fn new(start: u16, end: u16) -> Self {
        assert!(end > start, "empty port range");
        Self {
            counter: AtomicU32::new(0),
            start,
            end,
        }
    }

    /// Returns the next port in the rotation.
    #[inline]
    pub fn allocate(&self) -> u16 {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let range = u32::from(self.end - self.start);
        self.start + (n % range) as u16
    }

    /// Returns a uniformly random port in the range.
    pub fn allocate_random(&self) -> u16 {
        rand::thread_rng().gen_range(self.start..self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_cycles_through_range() {
        let alloc = PortAllocator::new(1000, 1010);

        let ports: Vec<u16> = (0..25).map(|_| alloc.allocate()).collect();
        for (i, port) in ports.iter().enumerate() {
            assert_eq!(*port, 1000 + (i % 10) as u16);
        }
    }

    #[test]
    fn test_allocate_default_range() {
        let alloc = PortAllocator::new(EPHEMERAL_PORT_START, EPHEMERAL_PORT_END);

        for _ in 0..100_000 {
            let port = alloc.allocate();
            assert!(port >= EPHEMERAL_PORT_START);
            assert!(port < EPHEMERAL_PORT_END);
        }
    }

    #[test]
    fn test_allocate_random_in_range() {
        let alloc = PortAllocator::new(2000, 2010);

        for _ in 0..1000 {
            let port = alloc.allocate_random();
            assert!((2000..2010).contains(&port));
        }
    }

    #[test]
    #[should_panic(expected = "empty port range")]
    fn test_empty_range_panics() {
        let _ = PortAllocator::new(5000, 5000);
    }
}
