// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! PASID allocation and lookup.
//!
//! The table hands out host PASIDs, tracks references on externally owned
//! (guest) PASIDs, and carries the binding attached to each live PASID so
//! the page request path can resolve a PASID to its binding without taking
//! the subsystem mutex.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use log::warn;
use sync::Mutex;

use crate::registry::Binding;

/// Width of a PASID in bits.
pub const PASID_BITS: u32 = 20;
/// One past the largest valid PASID.
pub const PASID_MAX: u32 = 1 << PASID_BITS;
/// PASID 0 carries requests without a PASID (RID to PASID translation) and
/// is never handed out.
pub const PASID_RID2PASID: u32 = 0;

/// A process address space identifier tagging DMA transactions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pasid(u32);

impl Pasid {
    /// Wraps a raw PASID, rejecting zero and out-of-range values.
    pub fn new(val: u32) -> Option<Pasid> {
        (val > PASID_RID2PASID && val < PASID_MAX).then_some(Pasid(val))
    }

    pub fn val(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pasid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identifier set a PASID was allocated from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PasidSet {
    /// PASIDs allocated by this subsystem for host-mode bindings.
    Host,
    /// PASIDs allocated by an external owner for guest-mode bindings.
    Guest,
}

/// Receives free events for PASIDs that still have outstanding references.
pub trait PasidObserver: Send + Sync {
    /// The owner of `pasid` freed it while the attached binding was live.
    fn pasid_freed(&self, pasid: Pasid, binding: &Arc<Binding>);
}

struct PasidState {
    set: PasidSet,
    refs: usize,
    free_pending: bool,
    data: Option<Arc<Binding>>,
}

/// The PASID allocation table.
pub struct PasidTable {
    entries: Mutex<BTreeMap<u32, PasidState>>,
    observers: Mutex<Vec<Weak<dyn PasidObserver>>>,
}

impl PasidTable {
    pub fn new() -> PasidTable {
        PasidTable {
            entries: Mutex::new(BTreeMap::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn register_observer(&self, observer: Weak<dyn PasidObserver>) {
        self.observers.lock().push(observer);
    }

    /// Allocates the lowest free PASID in `[min, max)` with one reference
    /// held by the caller.
    pub fn alloc(&self, set: PasidSet, min: u32, max: u32) -> Option<Pasid> {
        let mut entries = self.entries.lock();
        let min = min.max(PASID_RID2PASID + 1);
        let max = max.min(PASID_MAX);
        let mut candidate = min;
        for (&id, _) in entries.range(min..max) {
            if id != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate >= max {
            return None;
        }
        entries.insert(
            candidate,
            PasidState {
                set,
                refs: 1,
                free_pending: false,
                data: None,
            },
        );
        Pasid::new(candidate)
    }

    /// Takes an additional reference on an allocated PASID. Fails once the
    /// owner has freed the PASID, even if references are still outstanding.
    pub fn get(&self, pasid: Pasid) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&pasid.val()) {
            Some(state) if !state.free_pending => {
                state.refs += 1;
                true
            }
            _ => false,
        }
    }

    /// Drops one reference; the entry is reclaimed when the last reference
    /// goes away.
    pub fn put(&self, pasid: Pasid) {
        let mut entries = self.entries.lock();
        let Some(state) = entries.get_mut(&pasid.val()) else {
            warn!("put of unallocated PASID {}", pasid);
            return;
        };
        state.refs -= 1;
        if state.refs == 0 {
            entries.remove(&pasid.val());
        }
    }

    /// Attaches `binding` as the data resolved by [`PasidTable::find`].
    pub fn attach_data(&self, pasid: Pasid, binding: Arc<Binding>) {
        let mut entries = self.entries.lock();
        if let Some(state) = entries.get_mut(&pasid.val()) {
            state.data = Some(binding);
        }
    }

    /// Detaches and returns the binding attached to `pasid`.
    pub fn detach_data(&self, pasid: Pasid) -> Option<Arc<Binding>> {
        let mut entries = self.entries.lock();
        entries.get_mut(&pasid.val()).and_then(|state| state.data.take())
    }

    /// Looks up the binding attached to `pasid`, restricted to `set` when
    /// one is given. Reserved and out-of-range PASIDs resolve to nothing.
    pub fn find(&self, set: Option<PasidSet>, pasid: u32) -> Option<Arc<Binding>> {
        if pasid == PASID_RID2PASID || pasid >= PASID_MAX {
            return None;
        }
        let entries = self.entries.lock();
        let state = entries.get(&pasid)?;
        if let Some(set) = set {
            if state.set != set {
                return None;
            }
        }
        state.data.clone()
    }

    pub fn is_allocated(&self, pasid: u32) -> bool {
        self.entries.lock().contains_key(&pasid)
    }

    /// Frees `pasid` on behalf of its owner, dropping the owner's reference.
    /// While other references are outstanding the entry enters a
    /// free-pending state (no new references) and observers are notified so
    /// the remaining users can clean up asynchronously.
    pub fn free(&self, pasid: Pasid) {
        let notify = {
            let mut entries = self.entries.lock();
            let Some(state) = entries.get_mut(&pasid.val()) else {
                warn!("free of unallocated PASID {}", pasid);
                return;
            };
            if state.free_pending {
                warn!("double free of PASID {}", pasid);
                return;
            }
            state.free_pending = true;
            state.refs -= 1;
            if state.refs == 0 {
                entries.remove(&pasid.val());
                None
            } else {
                state.data.clone()
            }
        };
        let Some(binding) = notify else { return };
        let observers: Vec<_> = self
            .observers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            observer.pasid_freed(pasid, &binding);
        }
    }
}

impl Default for PasidTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_lowest_free() {
        let table = PasidTable::new();
        let a = table.alloc(PasidSet::Host, 1, 10).unwrap();
        let b = table.alloc(PasidSet::Host, 1, 10).unwrap();
        assert_eq!(a.val(), 1);
        assert_eq!(b.val(), 2);
        table.put(a);
        // The freed slot is reused.
        let c = table.alloc(PasidSet::Host, 1, 10).unwrap();
        assert_eq!(c.val(), 1);
    }

    #[test]
    fn alloc_exhaustion() {
        let table = PasidTable::new();
        assert!(table.alloc(PasidSet::Host, 1, 2).is_some());
        assert!(table.alloc(PasidSet::Host, 1, 2).is_none());
    }

    #[test]
    fn zero_is_reserved() {
        let table = PasidTable::new();
        let p = table.alloc(PasidSet::Host, 0, 10).unwrap();
        assert_eq!(p.val(), 1);
        assert!(table.find(None, PASID_RID2PASID).is_none());
    }

    #[test]
    fn get_fails_after_free() {
        let table = PasidTable::new();
        let p = table.alloc(PasidSet::Guest, 1, 10).unwrap();
        assert!(table.get(p));
        table.free(p);
        assert!(!table.get(p));
        // The outstanding reference keeps the entry alive until put.
        assert!(table.is_allocated(p.val()));
        table.put(p);
        assert!(!table.is_allocated(p.val()));
    }

    #[test]
    fn find_is_set_scoped() {
        let table = PasidTable::new();
        let p = table.alloc(PasidSet::Guest, 5, 10).unwrap();
        let binding = Binding::new(
            p,
            crate::registry::BindingMode::GuestNested,
            crate::registry::BindingFlags::GUEST_MODE,
            None,
            None,
        );
        table.attach_data(p, binding);
        assert!(table.find(Some(PasidSet::Guest), p.val()).is_some());
        assert!(table.find(Some(PasidSet::Host), p.val()).is_none());
        assert!(table.find(None, p.val()).is_some());
    }
}
