// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bindings and their device edges.
//!
//! A [`Binding`] ties one PASID to one translation source (a host address
//! space, the kernel tables, or a nested guest root) and owns the set of
//! devices using that PASID. Device-set mutations are serialised by the
//! subsystem mutex; the queue service thread and space observers traverse
//! the set on the read side, and a removed edge stays alive until the last
//! such reader drops its reference.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use bitflags::bitflags;
use sync::Mutex;

use crate::address_space::AddressSpace;
use crate::backend::IommuUnit;
use crate::descriptor::DEV_IOTLB_MAX_INVS;
use crate::device::AtsInfo;
use crate::device::DomainId;
use crate::device::Endpoint;
use crate::device::SourceId;
use crate::observer::BindingObserver;
use crate::pasid::Pasid;

/// How a binding's PASID translates DMA addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BindingMode {
    /// First-level walk of a user address space.
    HostUser,
    /// First-level walk of the kernel's tables.
    HostSupervisor,
    /// Guest first-level walk nested over a second-level domain.
    GuestNested,
}

bitflags! {
    /// Capability and mode bits recorded on a binding.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BindingFlags: u32 {
        const SUPERVISOR = 1 << 0;
        const GUEST_MODE = 1 << 1;
        /// A distinct guest-visible PASID is recorded.
        const GUEST_PASID = 1 << 2;
        const FIVE_LEVEL = 1 << 3;
        const GB_PAGES = 1 << 4;
    }
}

/// Binding lifecycle. Transitions only move forward and happen under the
/// subsystem mutex.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum LifeState {
    Live,
    Draining,
    Freed,
}

/// One (device, binding) edge.
pub struct DeviceBinding {
    endpoint: Arc<Endpoint>,
    sid: SourceId,
    unit: Arc<IommuUnit>,
    did: DomainId,
    // Device-TLB parameters, queue depth clamped to the invalidation limit.
    dev_tlb: Option<AtsInfo>,
    users: AtomicUsize,
}

impl DeviceBinding {
    pub(crate) fn new(endpoint: &Arc<Endpoint>, did: DomainId) -> Arc<DeviceBinding> {
        let dev_tlb = endpoint.ats().map(|ats| AtsInfo {
            queue_depth: if ats.queue_depth >= DEV_IOTLB_MAX_INVS {
                0
            } else {
                ats.queue_depth
            },
            pfsid: ats.pfsid,
        });
        Arc::new(DeviceBinding {
            endpoint: endpoint.clone(),
            sid: endpoint.sid(),
            unit: endpoint.unit().clone(),
            did,
            dev_tlb,
            users: AtomicUsize::new(1),
        })
    }

    pub(crate) fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub(crate) fn sid(&self) -> SourceId {
        self.sid
    }

    pub(crate) fn unit(&self) -> &Arc<IommuUnit> {
        &self.unit
    }

    pub(crate) fn did(&self) -> DomainId {
        self.did
    }

    pub(crate) fn dev_tlb(&self) -> Option<AtsInfo> {
        self.dev_tlb
    }

    /// Drops one user and returns how many remain. Serialised by the
    /// subsystem mutex.
    pub(crate) fn release_user(&self) -> usize {
        self.users.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

/// A PASID bound to one translation source, shared by every device using
/// that PASID.
pub struct Binding {
    pasid: Pasid,
    mode: BindingMode,
    flags: BindingFlags,
    space: Option<Arc<dyn AddressSpace>>,
    guest_pasid: Option<u32>,
    devices: RwLock<Vec<Arc<DeviceBinding>>>,
    observer: Mutex<Option<Arc<BindingObserver>>>,
    state: AtomicU8,
}

impl Binding {
    pub(crate) fn new(
        pasid: Pasid,
        mode: BindingMode,
        flags: BindingFlags,
        space: Option<Arc<dyn AddressSpace>>,
        guest_pasid: Option<u32>,
    ) -> Arc<Binding> {
        Arc::new(Binding {
            pasid,
            mode,
            flags,
            space,
            guest_pasid,
            devices: RwLock::new(Vec::new()),
            observer: Mutex::new(None),
            state: AtomicU8::new(LifeState::Live as u8),
        })
    }

    pub fn pasid(&self) -> Pasid {
        self.pasid
    }

    pub fn mode(&self) -> BindingMode {
        self.mode
    }

    pub fn flags(&self) -> BindingFlags {
        self.flags
    }

    pub fn guest_pasid(&self) -> Option<u32> {
        self.guest_pasid
    }

    pub fn device_count(&self) -> usize {
        self.read_devices().len()
    }

    pub(crate) fn space(&self) -> Option<&Arc<dyn AddressSpace>> {
        self.space.as_ref()
    }

    fn read_devices(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<DeviceBinding>>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_devices(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<DeviceBinding>>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait-free-ish lookup used by the queue service thread; the returned
    /// edge stays valid even if it is concurrently removed.
    pub(crate) fn find_device(&self, sid: SourceId) -> Option<Arc<DeviceBinding>> {
        self.read_devices().iter().find(|d| d.sid() == sid).cloned()
    }

    /// Snapshot of the device set for observer traversal.
    pub(crate) fn devices_snapshot(&self) -> Vec<Arc<DeviceBinding>> {
        self.read_devices().clone()
    }

    pub(crate) fn add_device(&self, device: Arc<DeviceBinding>) {
        self.write_devices().push(device);
    }

    pub(crate) fn remove_device(&self, sid: SourceId) -> Option<Arc<DeviceBinding>> {
        let mut devices = self.write_devices();
        let index = devices.iter().position(|d| d.sid() == sid)?;
        Some(devices.swap_remove(index))
    }

    pub(crate) fn take_devices(&self) -> Vec<Arc<DeviceBinding>> {
        std::mem::take(&mut *self.write_devices())
    }

    pub(crate) fn state(&self) -> LifeState {
        match self.state.load(Ordering::Acquire) {
            0 => LifeState::Live,
            1 => LifeState::Draining,
            _ => LifeState::Freed,
        }
    }

    pub(crate) fn set_state(&self, state: LifeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_observer(&self, observer: Arc<BindingObserver>) {
        *self.observer.lock() = Some(observer);
    }

    pub(crate) fn take_observer(&self) -> Option<Arc<BindingObserver>> {
        self.observer.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::IommuCaps;
    use crate::testing::FakeIommu;

    fn endpoint(devfn: u8) -> Arc<Endpoint> {
        let iommu = FakeIommu::with_caps(IommuCaps::all());
        let unit = IommuUnit::new("dmar-test", iommu);
        Arc::new(Endpoint::new(
            "test-dev",
            SourceId::new(0, devfn),
            unit,
            20,
        ))
    }

    fn binding() -> Arc<Binding> {
        Binding::new(
            Pasid::new(7).unwrap(),
            BindingMode::HostUser,
            BindingFlags::empty(),
            None,
            None,
        )
    }

    #[test]
    fn device_set_add_remove() {
        let b = binding();
        let e1 = endpoint(0x08);
        let e2 = endpoint(0x10);
        b.add_device(DeviceBinding::new(&e1, DomainId::FIRST_LEVEL_DEFAULT));
        b.add_device(DeviceBinding::new(&e2, DomainId::FIRST_LEVEL_DEFAULT));
        assert_eq!(b.device_count(), 2);
        assert!(b.find_device(e1.sid()).is_some());

        let removed = b.remove_device(e1.sid()).unwrap();
        assert_eq!(removed.sid(), e1.sid());
        assert!(b.find_device(e1.sid()).is_none());
        assert_eq!(b.device_count(), 1);
        assert!(b.remove_device(e1.sid()).is_none());
    }

    #[test]
    fn removed_device_survives_reader() {
        let b = binding();
        let e = endpoint(0x08);
        b.add_device(DeviceBinding::new(&e, DomainId::FIRST_LEVEL_DEFAULT));
        let held = b.find_device(e.sid()).unwrap();
        b.remove_device(e.sid());
        // The reader's reference remains usable after removal.
        assert_eq!(held.sid(), e.sid());
    }

    #[test]
    fn ats_queue_depth_is_clamped() {
        let iommu = FakeIommu::with_caps(IommuCaps::all());
        let unit = IommuUnit::new("dmar-test", iommu);
        let e = Arc::new(
            Endpoint::new("ats-dev", SourceId::new(0, 0x20), unit, 20).with_ats(AtsInfo {
                queue_depth: DEV_IOTLB_MAX_INVS,
                pfsid: 5,
            }),
        );
        let d = DeviceBinding::new(&e, DomainId::FIRST_LEVEL_DEFAULT);
        assert_eq!(d.dev_tlb().unwrap().queue_depth, 0);
    }

    #[test]
    fn lifecycle_states() {
        let b = binding();
        assert_eq!(b.state(), LifeState::Live);
        b.set_state(LifeState::Draining);
        assert_eq!(b.state(), LifeState::Draining);
        b.set_state(LifeState::Freed);
        assert_eq!(b.state(), LifeState::Freed);
    }
}
