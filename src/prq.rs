// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The page request queue: ring storage, the per-unit service thread that
//! consumes hardware-posted fault descriptors, and the drain protocol that
//! quiesces a PASID before its binding is retired.

use std::sync::Arc;
use std::thread::JoinHandle;

use log::error;
use log::info;
use log::warn;
use sync::Condvar;
use sync::Mutex;

use crate::backend::IommuUnit;
use crate::backend::PrqStatus;
use crate::descriptor::InvDescriptor;
use crate::descriptor::PageRequest;
use crate::descriptor::ResponseCode;
use crate::descriptor::PAGE_REQUEST_SIZE;
use crate::device::AtsInfo;
use crate::device::DomainId;
use crate::device::SourceId;
use crate::fault;
use crate::fault::FaultEvent;
use crate::pasid::Pasid;
use crate::registry::Binding;
use crate::registry::BindingFlags;
use crate::registry::DeviceBinding;
use crate::sva::SvaCore;
use crate::PAGE_SIZE;

const DESC_SIZE: u64 = PAGE_REQUEST_SIZE as u64;

/// The fixed ring of page request descriptors shared with the hardware.
/// Head and tail are byte offsets held in unit registers; the ring itself
/// only carries the descriptor memory.
pub struct PrqRing {
    slots: Mutex<Box<[PageRequest]>>,
    bytes: u64,
}

impl PrqRing {
    /// Allocates a ring of `4 KiB << order` bytes.
    pub(crate) fn new(order: u32) -> Arc<PrqRing> {
        let bytes = PAGE_SIZE << order;
        let slots = vec![PageRequest::default(); (bytes / DESC_SIZE) as usize];
        Arc::new(PrqRing {
            slots: Mutex::new(slots.into_boxed_slice()),
            bytes,
        })
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes
    }

    /// Mask clamping a byte offset to a descriptor slot inside the ring.
    pub fn offset_mask(&self) -> u64 {
        self.bytes - DESC_SIZE
    }

    /// Copies out the descriptor at byte offset `offset`.
    pub fn slot(&self, offset: u64) -> PageRequest {
        self.slots.lock()[(offset / DESC_SIZE) as usize]
    }

    /// Producer-side store, used by whatever posts requests into the ring.
    pub fn set_slot(&self, offset: u64, req: PageRequest) {
        self.slots.lock()[(offset / DESC_SIZE) as usize] = req;
    }
}

enum IrqWake {
    Request,
    Stop,
}

#[derive(Default)]
struct IrqState {
    pending: bool,
    stop: bool,
}

/// Wakeup channel between the page request interrupt and the service
/// thread.
pub struct PrqInterrupt {
    state: Mutex<IrqState>,
    cv: Condvar,
}

impl PrqInterrupt {
    pub(crate) fn new() -> PrqInterrupt {
        PrqInterrupt {
            state: Mutex::new(IrqState::default()),
            cv: Condvar::new(),
        }
    }

    /// Signals that the hardware latched a page request interrupt.
    pub fn raise(&self) {
        self.state.lock().pending = true;
        self.cv.notify_all();
    }

    pub(crate) fn stop(&self) {
        self.state.lock().stop = true;
        self.cv.notify_all();
    }

    /// Blocks until woken. Pending work is reported before a stop request
    /// so the final batch is not dropped.
    fn wait(&self) -> IrqWake {
        let mut state = self.state.lock();
        loop {
            if state.pending {
                state.pending = false;
                return IrqWake::Request;
            }
            if state.stop {
                return IrqWake::Stop;
            }
            state = self.cv.wait(state);
        }
    }
}

pub(crate) struct PrqContext {
    pub(crate) ring: Arc<PrqRing>,
    pub(crate) irq: Arc<PrqInterrupt>,
    pub(crate) worker: Option<JoinHandle<()>>,
}

enum Disposition {
    Respond(ResponseCode),
    HandedOff,
}

/// The service thread body for one IOMMU unit; the sole consumer of its
/// ring.
pub(crate) struct PrqWorker {
    pub(crate) core: Arc<SvaCore>,
    pub(crate) unit: Arc<IommuUnit>,
    pub(crate) ring: Arc<PrqRing>,
}

impl PrqWorker {
    pub(crate) fn run(&self, irq: Arc<PrqInterrupt>) {
        loop {
            match irq.wait() {
                IrqWake::Request => self.service(),
                IrqWake::Stop => break,
            }
        }
    }

    /// Services everything between the head and tail sampled after clearing
    /// the interrupt latch. Descriptors are handled strictly in ring order;
    /// the head register is published only after the whole batch is done.
    fn service(&self) {
        let backend = self.unit.backend();
        // Clear the latch before sampling the indices, so a request posted
        // after the sample re-raises the interrupt.
        backend.clear_prq_status(PrqStatus::PENDING);
        let mask = self.ring.offset_mask();
        let tail = backend.read_prq_tail() & mask;
        let mut head = backend.read_prq_head() & mask;
        let mut cached_binding: Option<Arc<Binding>> = None;
        let mut cached_device: Option<Arc<DeviceBinding>> = None;
        while head != tail {
            let req = self.ring.slot(head);
            let disposition =
                self.handle_request(&req, &mut cached_binding, &mut cached_device);
            if let Disposition::Respond(code) = disposition {
                if req.last_in_group() || req.priv_data_present() {
                    let resp = InvDescriptor::page_group_response(
                        req.rid(),
                        req.pasid(),
                        req.pasid_present(),
                        req.private_data(),
                        code,
                        req.group_index(),
                        req.last_in_group(),
                    );
                    if let Err(e) = backend.submit_invalidations(&[resp], false) {
                        error!(
                            "{}: failed to post page group response: {:#}",
                            self.unit.name(),
                            e
                        );
                    }
                }
            }
            self.unit.note_request_handled();
            head = (head + DESC_SIZE) & mask;
        }
        backend.write_prq_head(tail);

        if backend.read_prq_status().contains(PrqStatus::OVERFLOW) {
            warn!("{}: page request queue overflow", self.unit.name());
            let head = backend.read_prq_head() & mask;
            let tail = backend.read_prq_tail() & mask;
            if head == tail {
                backend.clear_prq_status(PrqStatus::OVERFLOW);
                info!("{}: page request queue overflow cleared", self.unit.name());
            }
        }

        self.unit.prq_complete().complete();
    }

    fn handle_request(
        &self,
        req: &PageRequest,
        cached_binding: &mut Option<Arc<Binding>>,
        cached_device: &mut Option<Arc<DeviceBinding>>,
    ) -> Disposition {
        if !req.pasid_present() {
            error!(
                "{}: page request without PASID from {}",
                self.unit.name(),
                req.rid()
            );
            return Disposition::Respond(ResponseCode::Invalid);
        }
        if req.pm_req() && (req.rd_req() || req.wr_req()) {
            error!(
                "{}: unexpected privileged-mode page request from {}",
                self.unit.name(),
                req.rid()
            );
            return Disposition::Respond(ResponseCode::Invalid);
        }
        if req.exe_req() && req.rd_req() {
            error!(
                "{}: execute page request not supported (from {})",
                self.unit.name(),
                req.rid()
            );
            return Disposition::Respond(ResponseCode::Invalid);
        }

        // Consecutive requests usually share a PASID and requester; reuse
        // the previous lookups when they do.
        if cached_binding
            .as_ref()
            .map_or(true, |b| b.pasid().val() != req.pasid())
        {
            *cached_device = None;
            *cached_binding = self.core.pasids.find(None, req.pasid());
            if cached_binding.is_none() {
                error!(
                    "{}: page request for invalid PASID {} from {}",
                    self.unit.name(),
                    req.pasid(),
                    req.rid()
                );
                return Disposition::Respond(ResponseCode::Invalid);
            }
        }
        let binding = cached_binding.clone().unwrap();
        if cached_device
            .as_ref()
            .map_or(true, |d| d.sid() != req.rid())
        {
            *cached_device = binding.find_device(req.rid());
        }

        // Guest-mode faults are resolved outside this crate; the response
        // is owed by whoever handles the report.
        if binding.flags().contains(BindingFlags::GUEST_MODE) {
            if let Some(device) = cached_device.as_ref() {
                let event = FaultEvent::from_request(req);
                if self.core.sink.report(device.endpoint(), &event).is_ok() {
                    return Disposition::HandedOff;
                }
            }
            return Disposition::Respond(ResponseCode::Invalid);
        }

        Disposition::Respond(fault::resolve(&self.core.config, &binding, req))
    }
}

/// Quiesces all page requests and responses for `pasid` on `unit`.
///
/// Called after the PASID entry has been cleared and before the binding is
/// retired. Phase one waits out every queued request for the PASID (the
/// service thread signals per serviced batch); phase two fences the
/// hardware with a drained invalidation batch until no response remains
/// outstanding.
pub(crate) fn drain(
    unit: &IommuUnit,
    sid: SourceId,
    did: DomainId,
    dev_tlb: Option<AtsInfo>,
    pasid: Pasid,
) {
    let Some(ring) = unit.prq_ring() else {
        return;
    };
    let backend = unit.backend();
    let mask = ring.offset_mask();

    loop {
        unit.prq_complete().reinit();
        let tail = backend.read_prq_tail() & mask;
        let mut head = backend.read_prq_head() & mask;
        let mut queued = false;
        while head != tail {
            let req = ring.slot(head);
            if req.pasid_present() && req.pasid() == pasid.val() {
                queued = true;
                break;
            }
            head = (head + DESC_SIZE) & mask;
        }
        if !queued {
            break;
        }
        unit.prq_complete().wait();
    }

    let (qdep, pfsid) = dev_tlb
        .map(|ats| (ats.queue_depth, ats.pfsid))
        .unwrap_or((0, 0));
    let batch = [
        InvDescriptor::wait_fenced(),
        InvDescriptor::piotlb_all(did, pasid),
        InvDescriptor::dev_iotlb_pages(sid, pfsid, pasid, qdep, 0, 0),
    ];
    loop {
        unit.prq_complete().reinit();
        if let Err(e) = backend.submit_invalidations(&batch, true) {
            warn!("{}: drain invalidation failed: {:#}", unit.name(), e);
            break;
        }
        if !backend
            .read_prq_status()
            .contains(PrqStatus::RESPONSE_OUTSTANDING)
        {
            break;
        }
        unit.prq_complete().wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_offsets_wrap() {
        let ring = PrqRing::new(0);
        assert_eq!(ring.size_bytes(), 4096);
        let mask = ring.offset_mask();
        assert_eq!((4096 - DESC_SIZE + DESC_SIZE) & mask, 0);
        assert_eq!((mask + DESC_SIZE) & mask, 0);
    }

    #[test]
    fn ring_slot_roundtrip() {
        let ring = PrqRing::new(0);
        let sid = crate::device::SourceId::new(0, 8);
        let pasid = Pasid::new(3).unwrap();
        let req = PageRequest::new(
            sid,
            pasid,
            0x1000,
            crate::address_space::Access::READ,
            1,
            true,
        );
        ring.set_slot(3 * DESC_SIZE, req);
        assert_eq!(ring.slot(3 * DESC_SIZE).pasid(), 3);
        assert_eq!(ring.slot(0).pasid(), 0);
    }

    #[test]
    fn interrupt_reports_pending_before_stop() {
        let irq = PrqInterrupt::new();
        irq.raise();
        irq.stop();
        assert!(matches!(irq.wait(), IrqWake::Request));
        assert!(matches!(irq.wait(), IrqWake::Stop));
    }
}
