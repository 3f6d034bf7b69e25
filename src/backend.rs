// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The hardware boundary: register-level operations one IOMMU unit exposes
//! to the SVA core, and the per-unit software state layered on top of them.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bitflags::bitflags;
use sync::Completion;
use sync::Mutex;

use crate::descriptor::InvDescriptor;
use crate::device::DomainId;
use crate::device::SourceId;
use crate::pasid::Pasid;
use crate::prq::PrqContext;
use crate::prq::PrqInterrupt;
use crate::prq::PrqRing;

bitflags! {
    /// Capabilities an IOMMU unit reports to the SVA core.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct IommuCaps: u32 {
        /// PASID-tagged requests are supported.
        const PASID = 1 << 0;
        /// 5-level first-stage paging.
        const FL5LP = 1 << 1;
        /// 1 GiB first-stage pages.
        const FL1GP = 1 << 2;
        /// Supervisor request support.
        const SRS = 1 << 3;
        /// A page request queue is present.
        const PRQ = 1 << 4;
    }
}

bitflags! {
    /// Page request status register bits.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PrqStatus: u32 {
        /// A page request interrupt is latched.
        const PENDING = 1 << 0;
        /// The request queue overflowed.
        const OVERFLOW = 1 << 1;
        /// A page group response is still in flight in hardware.
        const RESPONSE_OUTSTANDING = 1 << 2;
    }
}

/// PASID table entry configuration programmed per (device, PASID).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PasidEntry {
    /// First-level translation rooted at a host page table.
    FirstLevel {
        root: u64,
        did: DomainId,
        supervisor: bool,
        five_level: bool,
    },
    /// Guest first-level translation nested over the domain's second-level
    /// tables.
    Nested {
        first_root: u64,
        addr_width: u32,
        vendor_flags: u64,
        did: DomainId,
    },
}

/// Register-level operations of one IOMMU unit.
///
/// Implementations sit on the other side of the MMIO and invalidation-queue
/// plumbing; everything here may be called concurrently from bind/unbind
/// paths, the queue service thread and address-space observers.
pub trait IommuBackend: Send + Sync {
    fn capabilities(&self) -> IommuCaps;

    fn read_prq_head(&self) -> u64;

    fn write_prq_head(&self, head: u64);

    fn read_prq_tail(&self) -> u64;

    fn read_prq_status(&self) -> PrqStatus;

    /// Clears the given latched status bits (write-one-to-clear).
    fn clear_prq_status(&self, bits: PrqStatus);

    /// Points the hardware at `ring`, or tears the queue down with `None`.
    /// Programming a new base resets both queue indices.
    fn set_prq_base(&self, ring: Option<Arc<PrqRing>>);

    /// Registers the threaded page request interrupt (`None` releases it).
    fn set_prq_interrupt(&self, irq: Option<Arc<PrqInterrupt>>) -> anyhow::Result<()>;

    /// Submits a batch to the invalidation queue and waits for completion;
    /// `drain` additionally requests a page-request drain on the wait.
    /// Transient queue errors are retried by the implementation.
    fn submit_invalidations(&self, batch: &[InvDescriptor], drain: bool) -> anyhow::Result<()>;

    fn set_pasid_entry(&self, sid: SourceId, pasid: Pasid, entry: &PasidEntry)
        -> anyhow::Result<()>;

    /// Clears the PASID table entry for (`sid`, `pasid`). `fault` selects
    /// whether accesses during teardown report faults rather than being
    /// silently dropped; `keep_pte` leaves the translation intact for
    /// domain-default (gIOVA) usage.
    fn clear_pasid_entry(&self, sid: SourceId, pasid: Pasid, fault: bool, keep_pte: bool);
}

/// Per-unit SVA state layered over an [`IommuBackend`].
pub struct IommuUnit {
    name: String,
    backend: Arc<dyn IommuBackend>,
    // Serialises PASID-table programming on this unit.
    pasid_lock: Mutex<()>,
    // Signalled by the queue service thread after each serviced batch.
    prq_complete: Completion,
    pub(crate) prq: Mutex<Option<PrqContext>>,
    requests_handled: AtomicU64,
}

impl IommuUnit {
    pub(crate) fn new(name: &str, backend: Arc<dyn IommuBackend>) -> Arc<IommuUnit> {
        Arc::new(IommuUnit {
            name: name.to_string(),
            backend,
            pasid_lock: Mutex::new(()),
            prq_complete: Completion::new(),
            prq: Mutex::new(None),
            requests_handled: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> IommuCaps {
        self.backend.capabilities()
    }

    /// Page requests serviced since the queue was enabled.
    pub fn requests_handled(&self) -> u64 {
        self.requests_handled.load(Ordering::Relaxed)
    }

    pub(crate) fn note_request_handled(&self) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn backend(&self) -> &Arc<dyn IommuBackend> {
        &self.backend
    }

    pub(crate) fn prq_complete(&self) -> &Completion {
        &self.prq_complete
    }

    pub(crate) fn prq_ring(&self) -> Option<Arc<PrqRing>> {
        self.prq.lock().as_ref().map(|ctx| ctx.ring.clone())
    }

    pub(crate) fn program_pasid_entry(
        &self,
        sid: SourceId,
        pasid: Pasid,
        entry: &PasidEntry,
    ) -> anyhow::Result<()> {
        let _guard = self.pasid_lock.lock();
        self.backend.set_pasid_entry(sid, pasid, entry)
    }

    pub(crate) fn teardown_pasid_entry(
        &self,
        sid: SourceId,
        pasid: Pasid,
        fault: bool,
        keep_pte: bool,
    ) {
        let _guard = self.pasid_lock.lock();
        self.backend.clear_pasid_entry(sid, pasid, fault, keep_pte);
    }
}
