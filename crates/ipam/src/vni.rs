//! VNI allocator
//!
//! Range allocator over `[min, max]`. Dynamic requests always get the lowest
//! free VNI so that rehydration followed by allocation is deterministic.

use crate::error::{AllocationError, ConfigError};
use crate::released::{self, ReleasedReceiver, ReleasedSender};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Largest 24-bit VNI
pub const MAX_VNI: i32 = (1 << 24) - 1;

#[derive(Debug, Clone)]
struct VniAllocation {
    uid: String,
    vni: i32,
}

#[derive(Debug, Default)]
struct State<K> {
    taken: BTreeSet<i32>,
    allocations: HashMap<K, VniAllocation>,
}

/// Virtual network identifier allocator keyed by claimer.
#[derive(Debug)]
pub struct VNIAllocator<K> {
    min: i32,
    max: i32,
    state: RwLock<State<K>>,
    released: ReleasedSender,
}

impl<K: Eq + Hash + Clone + Debug> VNIAllocator<K> {
    /// Allocator over `[min, max]`; requires `0 < min <= max <= MAX_VNI`.
    pub fn new(min: i32, max: i32) -> Result<(Self, ReleasedReceiver), ConfigError> {
        if min <= 0 || max < min || max > MAX_VNI {
            return Err(ConfigError::InvalidVNIRange { min, max });
        }
        let (released, rx) = released::channel();
        let allocator = Self {
            min,
            max,
            state: RwLock::new(State {
                taken: BTreeSet::new(),
                allocations: HashMap::new(),
            }),
            released,
        };
        Ok((allocator, rx))
    }

    fn read(&self) -> RwLockReadGuard<'_, State<K>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<K>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// `(min, max)`
    pub fn range(&self) -> (i32, i32) {
        (self.min, self.max)
    }

    fn capacity(&self) -> usize {
        (self.max - self.min + 1) as usize
    }

    /// Whether `vni` is reserved by anyone
    pub fn is_taken(&self, vni: i32) -> bool {
        self.read().taken.contains(&vni)
    }

    /// Number of reserved VNIs
    pub fn taken_count(&self) -> usize {
        self.read().taken.len()
    }

    /// VNI currently held by `key`
    pub fn allocation(&self, key: &K) -> Option<i32> {
        self.read().allocations.get(key).map(|a| a.vni)
    }

    /// Whether `key` holds a VNI allocated for `uid`
    pub fn is_allocated(&self, key: &K, uid: &str) -> bool {
        self.read().allocations.get(key).is_some_and(|a| a.uid == uid)
    }

    fn check(&self, state: &State<K>, requested: Option<i32>) -> Result<i32, AllocationError> {
        match requested {
            Some(vni) => {
                if vni < self.min || vni > self.max {
                    return Err(AllocationError::OutOfRange(vni.to_string()));
                }
                if state.taken.contains(&vni) {
                    return Err(AllocationError::AlreadyTaken(vni.to_string()));
                }
                Ok(vni)
            }
            None => {
                if state.taken.len() >= self.capacity() {
                    return Err(AllocationError::NoSpaceLeft);
                }
                let mut candidate = self.min;
                for &taken in state.taken.range(self.min..=self.max) {
                    if taken != candidate {
                        break;
                    }
                    candidate += 1;
                }
                if candidate > self.max {
                    return Err(AllocationError::NoSpaceLeft);
                }
                Ok(candidate)
            }
        }
    }

    /// Allocate a VNI for `key`, honoring a requested value.
    ///
    /// A network with the same `uid` asking for another VNI keeps its current
    /// one when the new request fails.
    pub fn allocate(
        &self,
        key: &K,
        uid: &str,
        requested: Option<i32>,
    ) -> Result<i32, AllocationError> {
        let mut released = false;
        let result = {
            let mut state = self.write();
            let stale = match state.allocations.get(key) {
                Some(existing) if existing.uid == uid && requested.is_none_or(|vni| vni == existing.vni) => {
                    return Ok(existing.vni);
                }
                Some(existing) => Some(existing.clone()),
                None => None,
            };
            if let Some(stale) = &stale {
                state.taken.remove(&stale.vni);
            }
            match self.check(&state, requested) {
                Ok(vni) => {
                    if let Some(stale) = &stale {
                        debug!(?key, vni = stale.vni, "Released stale VNI allocation");
                        released = true;
                    }
                    state.taken.insert(vni);
                    state.allocations.insert(
                        key.clone(),
                        VniAllocation {
                            uid: uid.to_string(),
                            vni,
                        },
                    );
                    Ok(vni)
                }
                Err(err) => {
                    match stale {
                        Some(stale) if stale.uid == uid => {
                            state.taken.insert(stale.vni);
                        }
                        Some(stale) => {
                            state.allocations.remove(key);
                            debug!(?key, vni = stale.vni, "Released VNI of previous network");
                            released = true;
                        }
                        None => {}
                    }
                    Err(err)
                }
            }
        };
        if released {
            self.released.notify();
        }
        result
    }

    /// Whether a request for `requested` (or any VNI) could succeed now.
    pub fn can_fit(&self, requested: Option<i32>) -> bool {
        let state = self.read();
        self.check(&state, requested).is_ok()
    }

    /// Return the VNI of `key`.
    pub fn release(&self, key: &K) -> Option<i32> {
        let vni = {
            let mut state = self.write();
            let allocation = state.allocations.remove(key)?;
            state.taken.remove(&allocation.vni);
            allocation.vni
        };
        debug!(?key, vni, "Released VNI");
        self.released.notify();
        Some(vni)
    }

    /// Release `key` only if its VNI belongs to `uid`.
    pub fn release_if_uid(&self, key: &K, uid: &str) -> Option<i32> {
        if !self.is_allocated(key, uid) {
            return None;
        }
        self.release(key)
    }

    /// Re-reserve a persisted VNI during rehydration.
    pub fn restore(&self, key: &K, uid: &str, vni: i32) -> Result<(), AllocationError> {
        if vni < self.min || vni > self.max {
            return Err(AllocationError::OutOfRange(vni.to_string()));
        }
        let mut state = self.write();
        if let Some(existing) = state.allocations.get(key) {
            if existing.uid == uid && existing.vni == vni {
                return Ok(());
            }
            return Err(AllocationError::AlreadyTaken(format!("{key:?}")));
        }
        if !state.taken.insert(vni) {
            return Err(AllocationError::AlreadyTaken(vni.to_string()));
        }
        state.allocations.insert(
            key.clone(),
            VniAllocation {
                uid: uid.to_string(),
                vni,
            },
        );
        Ok(())
    }
}
