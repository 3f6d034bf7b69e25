// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The host address-space boundary.
//!
//! Address spaces are owned by the surrounding system; the SVA core only
//! needs enough of their surface to resolve device page faults against them
//! and to hear about unmaps and teardown.

use std::sync::Arc;

use bitflags::bitflags;

use crate::pasid::Pasid;

bitflags! {
    /// Access rights, both as requested by a page request and as granted by
    /// a region.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Access: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Privileged-mode request.
        const PRIV = 1 << 3;
    }
}

bitflags! {
    /// Flags passed to an address space's fault handler.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        /// The fault is resolved on behalf of a user context.
        const USER = 1 << 0;
        /// The faulting access originates outside the CPU.
        const REMOTE = 1 << 1;
        const WRITE = 1 << 2;
    }
}

/// A contiguous mapped range of an address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub access: Access,
}

/// Region lookup and fault-in, valid while the owning space's reader lock
/// is held.
pub trait RegionAccess {
    /// Returns the nearest region ending above `addr`, first growing a
    /// downward-growable region to cover `addr` when possible. The returned
    /// region may still start above `addr`.
    fn region_covering(&self, addr: u64) -> Option<Region>;

    /// Drives the space's fault handler for the page containing `addr`.
    /// May sleep.
    fn handle_fault(&self, addr: u64, flags: FaultFlags) -> anyhow::Result<()>;
}

/// Callbacks an address space delivers while mappings change or the space
/// exits. They run in the space's internal context and must not block on
/// long-held subsystem locks.
pub trait SpaceObserver: Send + Sync {
    /// Mappings in `[start, end)` were removed; cached translations
    /// covering them must be flushed.
    fn range_invalidated(&self, start: u64, end: u64);

    /// The space is exiting and its page tables are about to be torn down.
    fn space_released(&self);
}

/// A host address space whose page tables devices may walk.
pub trait AddressSpace: Send + Sync {
    /// Identifier unique among live address spaces.
    fn id(&self) -> u64;

    /// Physical address of the space's top-level page table.
    fn root_table(&self) -> u64;

    /// Takes a reference keeping the space's tables alive, unless the space
    /// is already tearing down.
    fn try_retain(&self) -> bool;

    /// Drops a reference taken with `try_retain`.
    fn release(&self);

    /// Runs `op` with the space's region reader lock held.
    fn with_read_lock(&self, op: &mut dyn FnMut(&dyn RegionAccess));

    fn attach_observer(&self, observer: Arc<dyn SpaceObserver>) -> anyhow::Result<()>;

    fn detach_observer(&self, observer: &Arc<dyn SpaceObserver>);

    /// Publishes (or withdraws, with `None`) the PASID this space is
    /// reachable under, so newly created mappings target it as well.
    fn publish_pasid(&self, pasid: Option<Pasid>);
}
