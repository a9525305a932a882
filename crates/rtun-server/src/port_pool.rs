//! Pool of public ports leased to tunnel sessions
//!
//! A port is either available (in the pool) or leased to exactly one
//! session. Every mutation goes through one mutex and never holds it across
//! I/O.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

pub type LeaseId = u64;

/// What `lease()` handed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lease {
    /// A port taken from the pool
    Pooled(u16),
    /// The pool was empty; the caller binds port 0 and lets the OS choose
    Ephemeral,
}

/// Ticket for one lease, redeemed exactly once with [`PortPool::retire`]
/// or [`PortPool::claim`]
#[derive(Debug)]
pub struct PortLease {
    id: LeaseId,
    lease: Lease,
}

impl PortLease {
    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn lease(&self) -> Lease {
        self.lease
    }

    /// The pooled port, or `None` for an ephemeral lease
    pub fn port(&self) -> Option<u16> {
        match self.lease {
            Lease::Pooled(port) => Some(port),
            Lease::Ephemeral => None,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.lease == Lease::Ephemeral
    }
}

struct PoolState {
    available: Vec<u16>,
    /// Leases not yet retired
    outstanding: HashSet<LeaseId>,
    next_lease_id: LeaseId,
    rng: StdRng,
}

impl PoolState {
    fn insert(&mut self, port: u16) -> bool {
        if port == 0 || self.available.contains(&port) {
            return false;
        }
        self.available.push(port);
        true
    }
}

pub struct PortPool {
    state: Mutex<PoolState>,
}

impl PortPool {
    /// Create an empty pool; every lease is ephemeral until ports are configured
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                available: Vec::new(),
                outstanding: HashSet::new(),
                next_lease_id: 1,
                rng: StdRng::from_entropy(),
            }),
        }
    }

    pub fn with_ports(ports: impl IntoIterator<Item = u16>) -> Self {
        let pool = Self::new();
        pool.configure(ports);
        pool
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add ports to the available set. Returns how many were added.
    pub fn configure(&self, ports: impl IntoIterator<Item = u16>) -> usize {
        let mut state = self.state();
        let mut added = 0;
        for port in ports {
            if state.insert(port) {
                added += 1;
            } else {
                warn!("Skipping port {}: zero or already in the pool", port);
            }
        }
        added
    }

    /// Add every port in `start..=end`. Returns how many were added.
    pub fn configure_range(&self, start: u16, end: u16) -> usize {
        if start > end {
            warn!("Empty port range {}-{}", start, end);
            return 0;
        }
        self.configure(start..=end)
    }

    /// Take a port chosen uniformly at random, or an ephemeral lease when
    /// the pool is empty.
    pub fn lease(&self) -> PortLease {
        let mut state = self.state();

        let id = state.next_lease_id;
        state.next_lease_id += 1;
        state.outstanding.insert(id);

        let lease = if state.available.is_empty() {
            Lease::Ephemeral
        } else {
            let len = state.available.len();
            let index = state.rng.gen_range(0..len);
            Lease::Pooled(state.available.swap_remove(index))
        };

        debug!(lease_id = id, ?lease, "Port leased");
        PortLease { id, lease }
    }

    /// Put `port` back into the available set.
    ///
    /// Refuses (and returns false) if the port is already available, so a
    /// stray second call cannot duplicate it.
    pub fn release(&self, port: u16) -> bool {
        let released = self.state().insert(port);
        if !released {
            warn!("Port {} released twice, ignoring", port);
        }
        released
    }

    /// End a lease: the first call for a ticket returns its port to the pool
    /// and returns true, every later call returns false.
    pub fn retire(&self, lease: &PortLease) -> bool {
        let mut state = self.state();
        if !state.outstanding.remove(&lease.id) {
            return false;
        }
        if let Lease::Pooled(port) = lease.lease {
            if !state.insert(port) {
                warn!("Port {} was already back in the pool", port);
            }
        }
        debug!(lease_id = lease.id, lease = ?lease.lease, "Lease retired");
        true
    }

    /// First half of retiring a lease whose port is still bound.
    ///
    /// Closes the lease's books under the pool lock and returns true for the
    /// first call only. The port stays out of the pool until the winner hands
    /// it back with [`PortPool::restore`], after closing its listener.
    pub fn claim(&self, lease: &PortLease) -> bool {
        let claimed = self.state().outstanding.remove(&lease.id);
        if claimed {
            debug!(lease_id = lease.id, lease = ?lease.lease, "Lease claimed");
        }
        claimed
    }

    /// Return the port of a claimed lease to the pool
    pub fn restore(&self, lease: &PortLease) -> bool {
        let mut state = self.state();
        if state.outstanding.contains(&lease.id) {
            warn!(lease_id = lease.id, "Lease restored before it was claimed, ignoring");
            return false;
        }
        match lease.lease {
            Lease::Pooled(port) => state.insert(port),
            Lease::Ephemeral => true,
        }
    }

    /// Snapshot of the available ports, sorted
    pub fn available(&self) -> Vec<u16> {
        let mut ports = self.state().available.clone();
        ports.sort_unstable();
        ports
    }

    pub fn contains(&self, port: u16) -> bool {
        self.state().available.contains(&port)
    }

    pub fn len(&self) -> usize {
        self.state().available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().available.is_empty()
    }

    /// Number of leases handed out and not yet retired
    pub fn outstanding(&self) -> usize {
        self.state().outstanding.len()
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_empty_pool_leases_ephemeral() {
        let pool = PortPool::new();
        let lease = pool.lease();

        assert!(lease.is_ephemeral());
        assert_eq!(lease.port(), None);
        assert_eq!(pool.outstanding(), 1);

        assert!(pool.retire(&lease));
        assert!(pool.is_empty());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_configure_range_is_inclusive() {
        let pool = PortPool::new();
        assert_eq!(pool.configure_range(9000, 9004), 5);
        assert_eq!(pool.available(), vec![9000, 9001, 9002, 9003, 9004]);
    }

    #[test]
    fn test_configure_composes_and_dedupes() {
        let pool = PortPool::new();
        pool.configure_range(9000, 9002);
        assert_eq!(pool.configure([9002, 9010, 0, 9010]), 1);
        assert_eq!(pool.available(), vec![9000, 9001, 9002, 9010]);
    }

    #[test]
    fn test_inverted_range_adds_nothing() {
        let pool = PortPool::new();
        assert_eq!(pool.configure_range(9005, 9000), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_lease_removes_port() {
        let pool = PortPool::with_ports([7001]);
        let lease = pool.lease();

        assert_eq!(lease.lease(), Lease::Pooled(7001));
        assert!(!pool.contains(7001));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_exhausted_pool_falls_back_to_ephemeral() {
        let pool = PortPool::with_ports([7001]);
        let first = pool.lease();
        let second = pool.lease();

        assert_eq!(first.port(), Some(7001));
        assert!(second.is_ephemeral());

        assert!(pool.retire(&second));
        assert!(pool.is_empty());
        assert!(pool.retire(&first));
        assert_eq!(pool.available(), vec![7001]);
    }

    #[test]
    fn test_leases_are_unique_until_released() {
        let pool = PortPool::new();
        pool.configure_range(10000, 10099);

        let leases: Vec<_> = (0..100).map(|_| pool.lease()).collect();
        let ports: HashSet<u16> = leases.iter().filter_map(|l| l.port()).collect();

        assert_eq!(ports.len(), 100);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_concurrent_leases_never_collide() {
        let pool = Arc::new(PortPool::new());
        pool.configure_range(20000, 20199);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || (0..25).map(|_| pool.lease()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for lease in handle.join().unwrap() {
                let port = lease.port().expect("pool should not be exhausted");
                assert!(seen.insert(port), "port {} leased twice", port);
            }
        }
        assert_eq!(seen.len(), 200);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_lease_choice_is_not_fifo() {
        let mut first_picks = HashSet::new();
        for _ in 0..50 {
            let pool = PortPool::new();
            pool.configure_range(30000, 30009);
            first_picks.insert(pool.lease().port().unwrap());
        }
        assert!(first_picks.len() > 1);
    }

    #[test]
    fn test_retire_is_idempotent() {
        let pool = PortPool::with_ports([7001, 7002]);
        let lease = pool.lease();
        let port = lease.port().unwrap();

        assert!(pool.retire(&lease));
        let after_once = pool.available();

        assert!(!pool.retire(&lease));
        assert_eq!(pool.available(), after_once);
        assert!(pool.contains(port));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_concurrent_retire_releases_once() {
        for _ in 0..50 {
            let pool = Arc::new(PortPool::with_ports([7001]));
            let lease = Arc::new(pool.lease());

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let pool = pool.clone();
                    let lease = lease.clone();
                    std::thread::spawn(move || pool.retire(&lease))
                })
                .collect();

            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|&won| won)
                .count();

            assert_eq!(winners, 1);
            assert_eq!(pool.available(), vec![7001]);
        }
    }

    #[test]
    fn test_claimed_port_stays_out_until_restored() {
        let pool = PortPool::with_ports([7001]);
        let lease = pool.lease();

        assert!(pool.claim(&lease));
        assert!(!pool.claim(&lease));
        assert!(!pool.retire(&lease));
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.is_empty());

        assert!(pool.restore(&lease));
        assert_eq!(pool.available(), vec![7001]);
        assert!(!pool.restore(&lease));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_restore_requires_claim() {
        let pool = PortPool::with_ports([7001]);
        let lease = pool.lease();

        assert!(!pool.restore(&lease));
        assert!(pool.is_empty());
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_release_refuses_duplicates() {
        let pool = PortPool::with_ports([7001]);
        assert!(!pool.release(7001));
        assert_eq!(pool.len(), 1);

        let lease = pool.lease();
        assert!(pool.release(lease.port().unwrap()));
        assert_eq!(pool.available(), vec![7001]);
    }
}
