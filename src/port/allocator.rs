//! Bounded port pool
//!
//! Ports are handed out lowest-free-first so allocation order is
//! deterministic. Releasing a port that is not leased is rejected with
//! [`PortError::NotLeased`] and leaves the pool untouched.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, UdpSocket};

use parking_lot::Mutex;
use thiserror::Error;

/// Port pool errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// Every port in the range is leased (or unbindable when probing)
    #[error("port pool exhausted ({min}-{max})")]
    Exhausted { min: u16, max: u16 },

    /// Port was released without being leased
    #[error("port {0} is not leased")]
    NotLeased(u16),
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    /// Create a range, swapping the bounds if given in reverse
    pub fn new(min: u16, max: u16) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Whether `port` falls inside the range
    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }

    /// Ranges always hold at least one port
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 20000,
            max: 30000,
        }
    }
}

struct Pool {
    free: BTreeSet<u16>,
    leased: BTreeSet<u16>,
}

/// Thread-safe port pool
pub struct PortAllocator {
    range: PortRange,
    probe_udp: bool,
    pool: Mutex<Pool>,
}

impl PortAllocator {
    /// Create a pool over `range`
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            probe_udp: false,
            pool: Mutex::new(Pool {
                free: (range.min..=range.max).collect(),
                leased: BTreeSet::new(),
            }),
        }
    }

    /// Skip ports that some other process already holds on loopback UDP
    pub fn with_udp_probe(mut self, enabled: bool) -> Self {
        self.probe_udp = enabled;
        self
    }

    /// The configured range
    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Total number of ports managed
    pub fn capacity(&self) -> usize {
        self.range.len()
    }

    /// Lease the lowest free port
    pub fn acquire(&self) -> Result<u16, PortError> {
        let mut pool = self.pool.lock();

        let port = pool
            .free
            .iter()
            .copied()
            .find(|&port| !self.probe_udp || udp_port_available(port))
            .ok_or(PortError::Exhausted {
                min: self.range.min,
                max: self.range.max,
            })?;

        pool.free.remove(&port);
        pool.leased.insert(port);

        tracing::trace!(port = port, leased = pool.leased.len(), "Port acquired");
        Ok(port)
    }

    /// Return a leased port to the pool
    pub fn release(&self, port: u16) -> Result<(), PortError> {
        let mut pool = self.pool.lock();

        if !pool.leased.remove(&port) {
            tracing::warn!(port = port, "Release of port that is not leased");
            return Err(PortError::NotLeased(port));
        }
        pool.free.insert(port);

        tracing::trace!(port = port, leased = pool.leased.len(), "Port released");
        Ok(())
    }

    /// Whether `port` is currently leased
    pub fn is_leased(&self, port: u16) -> bool {
        self.pool.lock().leased.contains(&port)
    }

    /// Number of ports currently leased
    pub fn leased_count(&self) -> usize {
        self.pool.lock().leased.len()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortRange::default())
    }
}

fn udp_port_available(port: u16) -> bool {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_acquire_lowest_first() {
        let ports = PortAllocator::new(PortRange::new(5000, 5003));

        assert_eq!(ports.acquire().unwrap(), 5000);
        assert_eq!(ports.acquire().unwrap(), 5001);

        ports.release(5000).unwrap();
        assert_eq!(ports.acquire().unwrap(), 5000);
        assert_eq!(ports.acquire().unwrap(), 5002);
    }

    #[test]
    fn test_exhaustion() {
        let ports = PortAllocator::new(PortRange::new(7000, 7001));

        ports.acquire().unwrap();
        ports.acquire().unwrap();

        assert_eq!(
            ports.acquire(),
            Err(PortError::Exhausted {
                min: 7000,
                max: 7001
            })
        );

        // Freed port is immediately reusable
        ports.release(7001).unwrap();
        assert_eq!(ports.acquire().unwrap(), 7001);
    }

    #[test]
    fn test_double_release_rejected() {
        let ports = PortAllocator::new(PortRange::new(6000, 6009));
        let port = ports.acquire().unwrap();

        ports.release(port).unwrap();
        assert_eq!(ports.release(port), Err(PortError::NotLeased(port)));
        assert_eq!(ports.leased_count(), 0);

        // Out of range and never-leased ports are rejected the same way
        assert_eq!(ports.release(1), Err(PortError::NotLeased(1)));
        assert_eq!(ports.release(6005), Err(PortError::NotLeased(6005)));
    }

    #[test]
    fn test_never_hands_out_leased_port() {
        let ports = PortAllocator::new(PortRange::new(9000, 9015));
        let mut held: HashSet<u16> = HashSet::new();

        // Deterministic interleaving of acquires and releases
        for step in 0..200u32 {
            if step % 3 == 2 && !held.is_empty() {
                let victim = *held.iter().min().unwrap();
                held.remove(&victim);
                ports.release(victim).unwrap();
            } else if let Ok(port) = ports.acquire() {
                assert!(held.insert(port), "port {} handed out twice", port);
            } else {
                assert_eq!(held.len(), ports.capacity());
            }
            assert_eq!(held.len(), ports.leased_count());
        }
    }

    #[test]
    fn test_concurrent_acquire_unique() {
        let ports = Arc::new(PortAllocator::new(PortRange::new(40000, 40999)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || {
                    (0..100).map(|_| ports.acquire().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port));
            }
        }
        assert_eq!(seen.len(), 800);
        assert_eq!(ports.leased_count(), 800);
    }

    #[test]
    fn test_udp_probe_skips_bound_port() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken = socket.local_addr().unwrap().port();

        let ports = PortAllocator::new(PortRange::new(taken, taken)).with_udp_probe(true);
        assert!(matches!(ports.acquire(), Err(PortError::Exhausted { .. })));

        drop(socket);
        assert_eq!(ports.acquire().unwrap(), taken);
    }

    #[test]
    fn test_range_reversed_bounds() {
        let range = PortRange::new(10, 5);

        assert_eq!(range.min, 5);
        assert_eq!(range.max, 10);
        assert_eq!(range.len(), 6);
        assert!(range.contains(7));
        assert!(!range.contains(11));
    }
}
