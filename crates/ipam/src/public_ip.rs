//! Public IP allocator
//!
//! Hands out single addresses (`/32` or `/128`) from the configured prefix
//! pools. State lives behind one `RwLock`; callers never hold it across an API
//! call because every method returns before touching the network.
//!
//! Durable state is the set of `IPAddress` objects. After a restart the
//! allocator is rebuilt by [`PublicIPAllocator::restore`]ing each of them.

use crate::error::AllocationError;
use crate::ipset::{IPSet, IpFamily};
use crate::released::{self, ReleasedReceiver, ReleasedSender};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// What a claimer asks for.
///
/// A request with literal `ips` reserves exactly those addresses; otherwise
/// one address is carved per entry of `families`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressRequest {
    /// Families to allocate dynamically
    pub families: Vec<IpFamily>,
    /// Literal addresses to reserve
    pub ips: Vec<IpAddr>,
}

impl AddressRequest {
    /// Dynamic request, one address per family
    pub fn dynamic(families: impl IntoIterator<Item = IpFamily>) -> Self {
        Self {
            families: families.into_iter().collect(),
            ips: Vec::new(),
        }
    }

    /// Literal request
    pub fn literal(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let ips: Vec<IpAddr> = ips.into_iter().collect();
        Self {
            families: ips.iter().map(IpFamily::of).collect(),
            ips,
        }
    }
}

/// Addresses reserved for one claimer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// UID of the claimer at allocation time
    pub uid: String,
    /// Reserved addresses
    pub ips: Vec<IpAddr>,
}

/// Outcome of comparing a request with the allocation already held by its key.
enum Existing {
    Absent,
    Satisfies(Vec<IpAddr>),
    Stale(Allocation),
}

#[derive(Debug, Clone)]
struct State<K> {
    available: IPSet,
    allocations: HashMap<K, Allocation>,
}

/// Public address allocator keyed by claimer.
#[derive(Debug)]
pub struct PublicIPAllocator<K> {
    pool: IPSet,
    state: RwLock<State<K>>,
    released: ReleasedSender,
}

fn returned(available: &IPSet, ips: &[IpAddr]) -> IPSet {
    let mut builder = available.builder();
    for ip in ips {
        builder.add(*ip);
    }
    builder.build()
}

fn same_addresses(a: &[IpAddr], b: &[IpAddr]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    a.dedup();
    b.sort();
    b.dedup();
    a == b
}

impl<K: Eq + Hash + Clone + Debug> PublicIPAllocator<K> {
    /// Allocator over `pool`, with the receiving end of its released channel.
    pub fn new(pool: IPSet) -> (Self, ReleasedReceiver) {
        let (released, rx) = released::channel();
        let allocator = Self {
            state: RwLock::new(State {
                available: pool.clone(),
                allocations: HashMap::new(),
            }),
            pool,
            released,
        };
        (allocator, rx)
    }

    fn read(&self) -> RwLockReadGuard<'_, State<K>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<K>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured pools
    pub fn pool(&self) -> &IPSet {
        &self.pool
    }

    /// Snapshot of the addresses still free
    pub fn available(&self) -> IPSet {
        self.read().available.clone()
    }

    /// Current allocation of `key`
    pub fn allocation(&self, key: &K) -> Option<Allocation> {
        self.read().allocations.get(key).cloned()
    }

    /// Whether `key` holds an allocation made for `uid`
    pub fn is_allocated(&self, key: &K, uid: &str) -> bool {
        self.read()
            .allocations
            .get(key)
            .is_some_and(|allocation| allocation.uid == uid)
    }

    /// Number of claimers holding addresses
    pub fn allocation_count(&self) -> usize {
        self.read().allocations.len()
    }

    /// Allocate for `key`.
    ///
    /// Idempotent for the same `uid`. A previous allocation with another
    /// `uid`, or for a different literal request, is replaced. The same
    /// claimer keeps its previous addresses when the new request cannot be
    /// served.
    pub fn allocate(
        &self,
        key: &K,
        uid: &str,
        request: &AddressRequest,
    ) -> Result<Vec<IpAddr>, AllocationError> {
        let (result, released) = {
            let mut state = self.write();
            Self::allocate_in(&self.pool, &mut state, key, uid, request)
        };
        if released {
            self.released.notify();
        }
        result
    }

    /// Prospective result of [`allocate`](Self::allocate) without touching state.
    pub fn allocate_dry_run(
        &self,
        key: &K,
        uid: &str,
        request: &AddressRequest,
    ) -> Result<Vec<IpAddr>, AllocationError> {
        let mut state = self.read().clone();
        Self::allocate_in(&self.pool, &mut state, key, uid, request).0
    }

    /// Returns the outcome and whether addresses went back to the pool.
    fn allocate_in(
        pool: &IPSet,
        state: &mut State<K>,
        key: &K,
        uid: &str,
        request: &AddressRequest,
    ) -> (Result<Vec<IpAddr>, AllocationError>, bool) {
        match Self::existing(state, key, uid, request) {
            Existing::Satisfies(ips) => (Ok(ips), false),
            Existing::Absent => (Self::reserve(pool, state, key, uid, request), false),
            Existing::Stale(stale) => Self::replace(pool, state, key, uid, request, stale),
        }
    }

    /// Whether `request` could be served right now.
    pub fn can_fit(&self, request: &AddressRequest) -> bool {
        let state = self.read();
        Self::plan(&self.pool, &state.available, request).is_ok()
    }

    /// Return the addresses of `key` to the pool.
    pub fn release(&self, key: &K) -> Option<Allocation> {
        let allocation = {
            let mut state = self.write();
            let allocation = state.allocations.remove(key)?;
            Self::give_back(&mut state, &allocation.ips);
            allocation
        };
        debug!(?key, ips = ?allocation.ips, "Released public IPs");
        self.released.notify();
        Some(allocation)
    }

    /// Release `key` only if its allocation belongs to `uid`.
    pub fn release_if_uid(&self, key: &K, uid: &str) -> Option<Allocation> {
        if !self.is_allocated(key, uid) {
            return None;
        }
        self.release(key)
    }

    /// Re-reserve a persisted address during rehydration.
    ///
    /// Addresses of the same `key` and `uid` accumulate into one allocation.
    pub fn restore(&self, key: &K, uid: &str, ip: IpAddr) -> Result<(), AllocationError> {
        if !self.pool.contains(ip) {
            return Err(AllocationError::OutOfRange(ip.to_string()));
        }
        let mut state = self.write();
        if let Some(existing) = state.allocations.get(key) {
            if existing.uid != uid {
                return Err(AllocationError::AlreadyTaken(format!("{key:?}")));
            }
            if existing.ips.contains(&ip) {
                return Ok(());
            }
        }
        if !state.available.contains(ip) {
            return Err(AllocationError::AlreadyTaken(ip.to_string()));
        }
        let mut builder = state.available.builder();
        builder.remove(ip);
        state.available = builder.build();
        state
            .allocations
            .entry(key.clone())
            .or_insert_with(|| Allocation {
                uid: uid.to_string(),
                ips: Vec::new(),
            })
            .ips
            .push(ip);
        Ok(())
    }

    /// Compare the allocation held by `key` with `uid` and `request`.
    fn existing(state: &State<K>, key: &K, uid: &str, request: &AddressRequest) -> Existing {
        let Some(existing) = state.allocations.get(key) else {
            return Existing::Absent;
        };
        if existing.uid == uid
            && (request.ips.is_empty() || same_addresses(&existing.ips, &request.ips))
        {
            return Existing::Satisfies(existing.ips.clone());
        }
        Existing::Stale(existing.clone())
    }

    /// Swap the stale allocation of `key` for one serving `request`.
    ///
    /// The new addresses are planned as if the stale ones were free, so a
    /// changed literal request may keep some of them. A failed plan leaves the
    /// allocation of a claimer with the same `uid` untouched.
    fn replace(
        pool: &IPSet,
        state: &mut State<K>,
        key: &K,
        uid: &str,
        request: &AddressRequest,
        stale: Allocation,
    ) -> (Result<Vec<IpAddr>, AllocationError>, bool) {
        let freed = returned(&state.available, &stale.ips);
        match Self::plan(pool, &freed, request) {
            Ok((ips, remaining)) => {
                debug!(?key, stale = ?stale.ips, ips = ?ips, "Replaced stale public IP allocation");
                state.available = remaining;
                state.allocations.insert(
                    key.clone(),
                    Allocation {
                        uid: uid.to_string(),
                        ips: ips.clone(),
                    },
                );
                (Ok(ips), true)
            }
            Err(err) if stale.uid == uid => (Err(err), false),
            Err(err) => {
                debug!(?key, ips = ?stale.ips, "Released public IPs of previous claimer");
                state.available = freed;
                state.allocations.remove(key);
                (Err(err), true)
            }
        }
    }

    fn give_back(state: &mut State<K>, ips: &[IpAddr]) {
        state.available = returned(&state.available, ips);
    }

    /// Compute the addresses for `request` and the remaining free set.
    fn plan(
        pool: &IPSet,
        available: &IPSet,
        request: &AddressRequest,
    ) -> Result<(Vec<IpAddr>, IPSet), AllocationError> {
        if !request.ips.is_empty() {
            let mut ips = request.ips.clone();
            ips.sort();
            ips.dedup();
            let mut builder = available.builder();
            for ip in &ips {
                let family = IpFamily::of(ip);
                if !pool.has_family(family) {
                    return Err(AllocationError::CannotHandleIPFamily(family));
                }
                if !pool.contains(*ip) {
                    return Err(AllocationError::OutOfRange(ip.to_string()));
                }
                if !available.contains(*ip) {
                    return Err(AllocationError::AlreadyTaken(ip.to_string()));
                }
                builder.remove(*ip);
            }
            return Ok((request.ips.clone(), builder.build()));
        }

        if request.families.is_empty() {
            return Err(AllocationError::InvalidRequest(
                "no ip family requested".to_string(),
            ));
        }
        let mut remaining = available.clone();
        let mut ips = Vec::with_capacity(request.families.len());
        for family in &request.families {
            if !pool.has_family(*family) {
                return Err(AllocationError::CannotHandleIPFamily(*family));
            }
            let (prefix, rest) = remaining
                .remove_free_prefix(*family, family.max_prefix_len())
                .ok_or(AllocationError::NoSpaceLeft)?;
            ips.push(prefix.addr());
            remaining = rest;
        }
        Ok((ips, remaining))
    }

    fn reserve(
        pool: &IPSet,
        state: &mut State<K>,
        key: &K,
        uid: &str,
        request: &AddressRequest,
    ) -> Result<Vec<IpAddr>, AllocationError> {
        let (ips, remaining) = Self::plan(pool, &state.available, request)?;
        state.available = remaining;
        state.allocations.insert(
            key.clone(),
            Allocation {
                uid: uid.to_string(),
                ips: ips.clone(),
            },
        );
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnet::IpNet;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn allocator(prefixes: &[&str]) -> (PublicIPAllocator<&'static str>, ReleasedReceiver) {
        let nets: Vec<IpNet> = prefixes.iter().map(|p| p.parse().unwrap()).collect();
        PublicIPAllocator::new(IPSet::from_prefixes(&nets))
    }

    fn v4() -> AddressRequest {
        AddressRequest::dynamic([IpFamily::V4])
    }

    #[test]
    fn test_dynamic_allocation_exhaustion_and_release() {
        let (allocator, mut released) = allocator(&["10.0.0.0/31"]);
        assert_eq!(allocator.allocate(&"p1", "u1", &v4()), Ok(vec![ip("10.0.0.0")]));
        assert_eq!(allocator.allocate(&"p2", "u2", &v4()), Ok(vec![ip("10.0.0.1")]));
        assert_eq!(
            allocator.allocate(&"p3", "u3", &v4()),
            Err(AllocationError::NoSpaceLeft)
        );
        assert!(!allocator.can_fit(&v4()));

        allocator.release(&"p1").unwrap();
        assert_eq!(released.drain(), 1);
        assert!(allocator.can_fit(&v4()));
        assert_eq!(allocator.allocate(&"p3", "u3", &v4()), Ok(vec![ip("10.0.0.0")]));
    }

    #[test]
    fn test_allocate_is_idempotent_for_same_uid() {
        let (allocator, mut released) = allocator(&["10.0.0.0/30"]);
        let first = allocator.allocate(&"p1", "u1", &v4()).unwrap();
        let second = allocator.allocate(&"p1", "u1", &v4()).unwrap();
        assert_eq!(first, second);
        let literal = allocator
            .allocate(&"p1", "u1", &AddressRequest::literal(first.clone()))
            .unwrap();
        assert_eq!(literal, first);
        assert_eq!(allocator.available().len(IpFamily::V4), 3);
        assert_eq!(released.drain(), 0);
    }

    #[test]
    fn test_stale_uid_releases_and_notifies() {
        let (allocator, mut released) = allocator(&["10.0.0.0/30"]);
        allocator.allocate(&"p1", "old", &v4()).unwrap();
        let ips = allocator.allocate(&"p1", "new", &v4()).unwrap();
        assert_eq!(ips, vec![ip("10.0.0.0")]);
        assert!(allocator.is_allocated(&"p1", "new"));
        assert!(!allocator.is_allocated(&"p1", "old"));
        assert_eq!(released.drain(), 1);
    }

    #[test]
    fn test_changed_literal_request_keeps_old_addresses_until_served() {
        let (allocator, mut released) = allocator(&["10.0.0.0/30"]);
        allocator
            .allocate(&"p1", "u1", &AddressRequest::literal([ip("10.0.0.1")]))
            .unwrap();
        allocator
            .allocate(&"p2", "u2", &AddressRequest::literal([ip("10.0.0.2")]))
            .unwrap();

        // Taken by p2: p1 keeps what it had
        let taken = AddressRequest::literal([ip("10.0.0.1"), ip("10.0.0.2")]);
        assert_eq!(
            allocator.allocate(&"p1", "u1", &taken),
            Err(AllocationError::AlreadyTaken("10.0.0.2".to_string()))
        );
        assert_eq!(allocator.allocation(&"p1").unwrap().ips, vec![ip("10.0.0.1")]);
        assert!(!allocator.available().contains(ip("10.0.0.1")));
        assert_eq!(released.drain(), 0);

        // Free: the overlap is kept and the rest reserved
        let grown = AddressRequest::literal([ip("10.0.0.1"), ip("10.0.0.3")]);
        assert_eq!(
            allocator.allocate(&"p1", "u1", &grown),
            Ok(vec![ip("10.0.0.1"), ip("10.0.0.3")])
        );
        assert_eq!(allocator.available().len(IpFamily::V4), 1);
        assert_eq!(released.drain(), 1);
    }

    #[test]
    fn test_literal_collision() {
        let (allocator, _released) = allocator(&["10.0.0.0/31"]);
        let request = AddressRequest::literal([ip("10.0.0.0")]);
        allocator.allocate(&"p1", "u1", &request).unwrap();
        assert_eq!(
            allocator.allocate(&"p2", "u2", &request),
            Err(AllocationError::AlreadyTaken("10.0.0.0".to_string()))
        );
        assert!(allocator.allocation(&"p2").is_none());
    }

    #[test]
    fn test_literal_reservation_is_atomic() {
        let (allocator, _released) = allocator(&["10.0.0.0/30"]);
        allocator
            .allocate(&"p1", "u1", &AddressRequest::literal([ip("10.0.0.2")]))
            .unwrap();
        let request = AddressRequest::literal([ip("10.0.0.1"), ip("10.0.0.2")]);
        assert!(allocator.allocate(&"p2", "u2", &request).is_err());
        assert!(allocator.available().contains(ip("10.0.0.1")));
    }

    #[test]
    fn test_literal_outside_pool() {
        let (allocator, _released) = allocator(&["10.0.0.0/30"]);
        assert_eq!(
            allocator.allocate(&"p1", "u1", &AddressRequest::literal([ip("10.0.1.1")])),
            Err(AllocationError::OutOfRange("10.0.1.1".to_string()))
        );
    }

    #[test]
    fn test_unsupported_family() {
        let (allocator, _released) = allocator(&["10.0.0.0/30"]);
        assert_eq!(
            allocator.allocate(&"p1", "u1", &AddressRequest::dynamic([IpFamily::V6])),
            Err(AllocationError::CannotHandleIPFamily(IpFamily::V6))
        );
    }

    #[test]
    fn test_dual_stack() {
        let (allocator, _released) = allocator(&["10.0.0.0/30", "2001:db8::/126"]);
        let ips = allocator
            .allocate(&"p1", "u1", &AddressRequest::dynamic([IpFamily::V4, IpFamily::V6]))
            .unwrap();
        assert_eq!(ips, vec![ip("10.0.0.0"), ip("2001:db8::")]);
    }

    #[test]
    fn test_dry_run_does_not_mutate() {
        let (allocator, _released) = allocator(&["10.0.0.0/31"]);
        assert_eq!(
            allocator.allocate_dry_run(&"p1", "u1", &v4()),
            Ok(vec![ip("10.0.0.0")])
        );
        assert_eq!(allocator.available().len(IpFamily::V4), 2);
        assert!(allocator.allocation(&"p1").is_none());
    }

    #[test]
    fn test_restore_rehydrates_occupancy() {
        let (allocator, _released) = allocator(&["10.0.0.0/24"]);
        allocator.restore(&"a", "ua", ip("10.0.0.3")).unwrap();
        allocator.restore(&"b", "ub", ip("10.0.0.5")).unwrap();
        allocator.restore(&"b", "ub", ip("10.0.0.5")).unwrap();
        assert_eq!(
            allocator.restore(&"c", "uc", ip("10.0.0.5")),
            Err(AllocationError::AlreadyTaken("10.0.0.5".to_string()))
        );

        let mut expected = allocator.pool().builder();
        expected.remove(ip("10.0.0.3")).remove(ip("10.0.0.5"));
        assert_eq!(allocator.available(), expected.build());
        assert_eq!(allocator.allocate(&"d", "ud", &v4()), Ok(vec![ip("10.0.0.0")]));
    }

    #[test]
    fn test_release_if_uid() {
        let (allocator, _released) = allocator(&["10.0.0.0/31"]);
        allocator.allocate(&"p1", "u1", &v4()).unwrap();
        assert!(allocator.release_if_uid(&"p1", "other").is_none());
        assert!(allocator.release_if_uid(&"p1", "u1").is_some());
        assert_eq!(allocator.allocation_count(), 0);
    }
}
