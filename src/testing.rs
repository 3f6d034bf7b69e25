// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recording test doubles for the subsystem's external collaborators: the
//! IOMMU hardware, host address spaces, and the generic fault dispatcher.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use anyhow::bail;
use sync::Mutex;

use crate::address_space::Access;
use crate::address_space::AddressSpace;
use crate::address_space::FaultFlags;
use crate::address_space::Region;
use crate::address_space::RegionAccess;
use crate::address_space::SpaceObserver;
use crate::backend::IommuBackend;
use crate::backend::IommuCaps;
use crate::backend::PasidEntry;
use crate::backend::PrqStatus;
use crate::descriptor::InvDescriptor;
use crate::descriptor::PageRequest;
use crate::descriptor::INV_TYPE_DEV_PIOTLB;
use crate::descriptor::INV_TYPE_PIOTLB;
use crate::descriptor::PAGE_REQUEST_SIZE;
use crate::device::Endpoint;
use crate::device::SourceId;
use crate::fault::FaultEvent;
use crate::fault::FaultSink;
use crate::pasid::Pasid;
use crate::prq::PrqInterrupt;
use crate::prq::PrqRing;
use crate::PAGE_SIZE;

struct FakeRegs {
    head: u64,
    tail: u64,
    status: PrqStatus,
}

impl Default for FakeRegs {
    fn default() -> FakeRegs {
        FakeRegs {
            head: 0,
            tail: 0,
            status: PrqStatus::empty(),
        }
    }
}

/// One invalidation batch as submitted to the hardware.
#[derive(Clone)]
pub struct InvBatch {
    pub descriptors: Vec<InvDescriptor>,
    pub drain: bool,
}

/// An in-memory IOMMU that records everything the core programs into it.
///
/// Posted page requests land in the ring exactly as hardware would place
/// them, but the service thread is only woken by an explicit
/// [`FakeIommu::trigger`], which lets tests control batching.
pub struct FakeIommu {
    caps: IommuCaps,
    regs: Mutex<FakeRegs>,
    ring: Mutex<Option<Arc<PrqRing>>>,
    irq: Mutex<Option<Arc<PrqInterrupt>>>,
    entries: Mutex<BTreeMap<(u16, u32), PasidEntry>>,
    batches: Mutex<Vec<InvBatch>>,
    fail_pasid_program: AtomicBool,
}

impl FakeIommu {
    pub fn new() -> Arc<FakeIommu> {
        Self::with_caps(IommuCaps::all())
    }

    pub fn with_caps(caps: IommuCaps) -> Arc<FakeIommu> {
        Arc::new(FakeIommu {
            caps,
            regs: Mutex::new(FakeRegs::default()),
            ring: Mutex::new(None),
            irq: Mutex::new(None),
            entries: Mutex::new(BTreeMap::new()),
            batches: Mutex::new(Vec::new()),
            fail_pasid_program: AtomicBool::new(false),
        })
    }

    /// Writes `req` at the tail and advances it, latching the pending
    /// status. On a full ring the overflow status is latched instead.
    pub fn post_request(&self, req: PageRequest) {
        let ring = self
            .ring
            .lock()
            .clone()
            .expect("page request queue not enabled");
        let mask = ring.offset_mask();
        let mut regs = self.regs.lock();
        let next = (regs.tail + PAGE_REQUEST_SIZE as u64) & mask;
        if next == regs.head & mask {
            regs.status |= PrqStatus::OVERFLOW;
            return;
        }
        ring.set_slot(regs.tail & mask, req);
        regs.tail = next;
        regs.status |= PrqStatus::PENDING;
    }

    /// Fires the page request interrupt.
    pub fn trigger(&self) {
        if let Some(irq) = self.irq.lock().clone() {
            irq.raise();
        }
    }

    pub fn post_and_trigger(&self, req: PageRequest) {
        self.post_request(req);
        self.trigger();
    }

    pub fn pasid_entry(&self, sid: SourceId, pasid: Pasid) -> Option<PasidEntry> {
        self.entries.lock().get(&(sid.bits(), pasid.val())).cloned()
    }

    pub fn batches(&self) -> Vec<InvBatch> {
        self.batches.lock().clone()
    }

    /// Page group responses submitted so far, oldest first.
    pub fn page_group_responses(&self) -> Vec<InvDescriptor> {
        self.flushes_of_type(|d| d.is_page_group_response())
    }

    pub fn piotlb_flushes(&self) -> Vec<InvDescriptor> {
        self.flushes_of_type(|d| d.inv_type() == INV_TYPE_PIOTLB)
    }

    pub fn dev_iotlb_flushes(&self) -> Vec<InvDescriptor> {
        self.flushes_of_type(|d| d.inv_type() == INV_TYPE_DEV_PIOTLB)
    }

    fn flushes_of_type(&self, matches: impl Fn(&InvDescriptor) -> bool) -> Vec<InvDescriptor> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.descriptors.iter())
            .filter(|d| matches(d))
            .copied()
            .collect()
    }

    /// Latches extra status bits, e.g. a pending hardware response.
    pub fn set_status(&self, bits: PrqStatus) {
        self.regs.lock().status |= bits;
    }

    pub fn status(&self) -> PrqStatus {
        self.regs.lock().status
    }

    pub fn fail_pasid_programming(&self, fail: bool) {
        self.fail_pasid_program.store(fail, Ordering::Relaxed);
    }
}

impl IommuBackend for FakeIommu {
    fn capabilities(&self) -> IommuCaps {
        self.caps
    }

    fn read_prq_head(&self) -> u64 {
        self.regs.lock().head
    }

    fn write_prq_head(&self, head: u64) {
        self.regs.lock().head = head;
    }

    fn read_prq_tail(&self) -> u64 {
        self.regs.lock().tail
    }

    fn read_prq_status(&self) -> PrqStatus {
        self.regs.lock().status
    }

    fn clear_prq_status(&self, bits: PrqStatus) {
        self.regs.lock().status &= !bits;
    }

    fn set_prq_base(&self, ring: Option<Arc<PrqRing>>) {
        let mut regs = self.regs.lock();
        regs.head = 0;
        regs.tail = 0;
        *self.ring.lock() = ring;
    }

    fn set_prq_interrupt(&self, irq: Option<Arc<PrqInterrupt>>) -> anyhow::Result<()> {
        *self.irq.lock() = irq;
        Ok(())
    }

    fn submit_invalidations(&self, batch: &[InvDescriptor], drain: bool) -> anyhow::Result<()> {
        self.batches.lock().push(InvBatch {
            descriptors: batch.to_vec(),
            drain,
        });
        if drain {
            // A drained wait completes only once in-flight responses have
            // been pushed out.
            self.regs.lock().status &= !PrqStatus::RESPONSE_OUTSTANDING;
        }
        Ok(())
    }

    fn set_pasid_entry(
        &self,
        sid: SourceId,
        pasid: Pasid,
        entry: &PasidEntry,
    ) -> anyhow::Result<()> {
        if self.fail_pasid_program.load(Ordering::Relaxed) {
            bail!("pasid table programming failure");
        }
        self.entries
            .lock()
            .insert((sid.bits(), pasid.val()), entry.clone());
        Ok(())
    }

    fn clear_pasid_entry(&self, sid: SourceId, pasid: Pasid, _fault: bool, _keep_pte: bool) {
        self.entries.lock().remove(&(sid.bits(), pasid.val()));
    }
}

#[derive(Copy, Clone)]
struct FakeRegion {
    start: u64,
    end: u64,
    access: Access,
    grows_down: bool,
}

/// An address space backed by a handful of synthetic regions, with a
/// recording fault handler.
pub struct FakeAddressSpace {
    id: u64,
    root: u64,
    regions: Mutex<Vec<FakeRegion>>,
    region_lock: RwLock<()>,
    live: AtomicBool,
    refs: AtomicUsize,
    observers: Mutex<Vec<Arc<dyn SpaceObserver>>>,
    published: Mutex<Option<Pasid>>,
    faults: Mutex<Vec<(u64, FaultFlags)>>,
    fail_faults: AtomicBool,
}

impl FakeAddressSpace {
    pub fn new(root: u64) -> Arc<FakeAddressSpace> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(FakeAddressSpace {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            root,
            regions: Mutex::new(Vec::new()),
            region_lock: RwLock::new(()),
            live: AtomicBool::new(true),
            refs: AtomicUsize::new(0),
            observers: Mutex::new(Vec::new()),
            published: Mutex::new(None),
            faults: Mutex::new(Vec::new()),
            fail_faults: AtomicBool::new(false),
        })
    }

    pub fn add_region(&self, start: u64, end: u64, access: Access) {
        let mut regions = self.regions.lock();
        regions.push(FakeRegion {
            start,
            end,
            access,
            grows_down: false,
        });
        regions.sort_by_key(|r| r.start);
    }

    /// Adds a region that grows downward on demand, like a stack.
    pub fn add_stack_region(&self, start: u64, end: u64, access: Access) {
        let mut regions = self.regions.lock();
        regions.push(FakeRegion {
            start,
            end,
            access,
            grows_down: true,
        });
        regions.sort_by_key(|r| r.start);
    }

    /// Simulates the space unmapping `[start, end)`.
    pub fn invalidate_range(&self, start: u64, end: u64) {
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer.range_invalidated(start, end);
        }
    }

    /// Simulates the space exiting: observers hear about it and further
    /// `try_retain` calls fail.
    pub fn exit(&self) {
        self.live.store(false, Ordering::Release);
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer.space_released();
        }
    }

    pub fn faults(&self) -> Vec<(u64, FaultFlags)> {
        self.faults.lock().clone()
    }

    pub fn fault_count(&self) -> usize {
        self.faults.lock().len()
    }

    pub fn published_pasid(&self) -> Option<Pasid> {
        *self.published.lock()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn fail_faults(&self, fail: bool) {
        self.fail_faults.store(fail, Ordering::Relaxed);
    }
}

struct FakeRegionAccess<'a> {
    space: &'a FakeAddressSpace,
}

impl RegionAccess for FakeRegionAccess<'_> {
    fn region_covering(&self, addr: u64) -> Option<Region> {
        let mut regions = self.space.regions.lock();
        let region = regions.iter_mut().find(|r| r.end > addr)?;
        if region.grows_down && addr < region.start {
            region.start = addr & !(PAGE_SIZE - 1);
        }
        Some(Region {
            start: region.start,
            end: region.end,
            access: region.access,
        })
    }

    fn handle_fault(&self, addr: u64, flags: FaultFlags) -> anyhow::Result<()> {
        if self.space.fail_faults.load(Ordering::Relaxed) {
            bail!("fault handling failed");
        }
        self.space.faults.lock().push((addr, flags));
        Ok(())
    }
}

impl AddressSpace for FakeAddressSpace {
    fn id(&self) -> u64 {
        self.id
    }

    fn root_table(&self) -> u64 {
        self.root
    }

    fn try_retain(&self) -> bool {
        if !self.live.load(Ordering::Acquire) {
            return false;
        }
        self.refs.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn release(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    fn with_read_lock(&self, op: &mut dyn FnMut(&dyn RegionAccess)) {
        let _guard = self
            .region_lock
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        op(&FakeRegionAccess { space: self });
    }

    fn attach_observer(&self, observer: Arc<dyn SpaceObserver>) -> anyhow::Result<()> {
        if !self.live.load(Ordering::Acquire) {
            bail!("address space is exiting");
        }
        self.observers.lock().push(observer);
        Ok(())
    }

    fn detach_observer(&self, observer: &Arc<dyn SpaceObserver>) {
        self.observers
            .lock()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    fn publish_pasid(&self, pasid: Option<Pasid>) {
        *self.published.lock() = pasid;
    }
}

/// A fault dispatcher recording reported events and installed fault data.
pub struct FakeFaultSink {
    events: Mutex<Vec<FaultEvent>>,
    fault_data: Mutex<BTreeMap<(u16, u32), Arc<dyn Any + Send + Sync>>>,
    fail_reports: AtomicBool,
}

impl FakeFaultSink {
    pub fn new() -> Arc<FakeFaultSink> {
        Arc::new(FakeFaultSink {
            events: Mutex::new(Vec::new()),
            fault_data: Mutex::new(BTreeMap::new()),
            fail_reports: AtomicBool::new(false),
        })
    }

    pub fn events(&self) -> Vec<FaultEvent> {
        self.events.lock().clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn has_fault_data(&self, sid: SourceId, pasid: Pasid) -> bool {
        self.fault_data
            .lock()
            .contains_key(&(sid.bits(), pasid.val()))
    }

    pub fn fail_reports(&self, fail: bool) {
        self.fail_reports.store(fail, Ordering::Relaxed);
    }
}

impl FaultSink for FakeFaultSink {
    fn report(&self, _endpoint: &Arc<Endpoint>, event: &FaultEvent) -> anyhow::Result<()> {
        if self.fail_reports.load(Ordering::Relaxed) {
            bail!("fault report refused");
        }
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn install_fault_data(
        &self,
        sid: SourceId,
        pasid: Pasid,
        data: Arc<dyn Any + Send + Sync>,
    ) -> anyhow::Result<()> {
        self.fault_data
            .lock()
            .insert((sid.bits(), pasid.val()), data);
        Ok(())
    }

    fn remove_fault_data(&self, sid: SourceId, pasid: Pasid) {
        self.fault_data.lock().remove(&(sid.bits(), pasid.val()));
    }
}
