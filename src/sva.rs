// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The subsystem object: host and guest bind/unbind, the page-response
//! path for externally resolved faults, page request queue lifecycle, and
//! asynchronous cleanup when a PASID is freed out from under its bindings.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Weak;
use std::thread;
use std::thread::JoinHandle;

use bitflags::bitflags;
use log::error;
use log::warn;
use sync::Mutex;

use crate::address_space::AddressSpace;
use crate::address_space::SpaceObserver;
use crate::backend::IommuBackend;
use crate::backend::IommuCaps;
use crate::backend::IommuUnit;
use crate::backend::PasidEntry;
use crate::descriptor::InvDescriptor;
use crate::device::Domain;
use crate::device::DomainId;
use crate::device::Endpoint;
use crate::fault::FaultEvent;
use crate::fault::FaultSink;
use crate::fault::PageResponse;
use crate::observer::BindingObserver;
use crate::pasid::Pasid;
use crate::pasid::PasidObserver;
use crate::pasid::PasidSet;
use crate::pasid::PasidTable;
use crate::pasid::PASID_BITS;
use crate::pasid::PASID_MAX;
use crate::prq;
use crate::prq::PrqContext;
use crate::prq::PrqInterrupt;
use crate::prq::PrqRing;
use crate::prq::PrqWorker;
use crate::registry::Binding;
use crate::registry::BindingFlags;
use crate::registry::BindingMode;
use crate::registry::DeviceBinding;
use crate::registry::LifeState;
use crate::Result;
use crate::SvaError;

bitflags! {
    /// Bind-time flags.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BindFlags: u32 {
        /// Bind the kernel's address space; no user space is supplied.
        const SUPERVISOR_MODE = 1 << 0;
        /// The binding nests a guest page table over a second-level domain.
        const GUEST_MODE = 1 << 1;
        /// The guest PASID field of the descriptor is meaningful.
        const GUEST_PASID_VALID = 1 << 2;
        /// Use the domain's pre-assigned host PASID instead of the
        /// descriptor's.
        const HPASID_DEFAULT = 1 << 3;
    }
}

/// The guest bind descriptor format understood by this implementation.
pub const PASID_FORMAT_VTD: u32 = 1;

// Attribute bits defined for nested-mode vendor flags; the rest of the
// field is reserved.
const GUEST_VENDOR_FLAGS_MASK: u64 = 0x7f;

/// Guest bind parameters, as passed down from the user-facing bind surface.
pub struct GuestBindData {
    /// Descriptor format; must be [`PASID_FORMAT_VTD`].
    pub format: u32,
    /// Size of the descriptor the caller filled in.
    pub argsz: u32,
    pub flags: BindFlags,
    /// Host PASID the binding is tracked under.
    pub hpasid: u32,
    /// Guest-visible PASID, meaningful with `GUEST_PASID_VALID`.
    pub gpasid: u32,
    /// Guest page table root for the first-level walk.
    pub gpgd: u64,
    /// Guest address width in bits.
    pub addr_width: u32,
    /// Vendor-specific attribute bits for the nested entry.
    pub vendor_flags: u64,
}

impl GuestBindData {
    /// Smallest descriptor a caller can legitimately hand in.
    pub const MIN_ARGSZ: u32 = 48;
}

/// Subsystem-wide configuration captured at construction.
#[derive(Copy, Clone, Debug)]
pub struct SvaConfig {
    /// The CPU uses 5-level paging.
    pub five_level_paging: bool,
    /// The CPU may create 1 GiB mappings.
    pub gb_pages: bool,
    /// Root of the kernel page table, used by supervisor-mode bindings.
    pub kernel_root_table: u64,
    /// Request queue size as a power-of-two multiple of 4 KiB.
    pub prq_order: u32,
}

impl Default for SvaConfig {
    fn default() -> SvaConfig {
        SvaConfig {
            five_level_paging: false,
            gb_pages: false,
            kernel_root_table: 0,
            prq_order: 0,
        }
    }
}

impl SvaConfig {
    pub(crate) fn va_bits(&self) -> u32 {
        if self.five_level_paging {
            57
        } else {
            48
        }
    }
}

/// A live host-mode binding returned by [`Sva::bind`].
pub struct SvaHandle {
    endpoint: Arc<Endpoint>,
    pasid: Pasid,
}

impl SvaHandle {
    /// The PASID backing this binding.
    pub fn pasid(&self) -> Pasid {
        self.pasid
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }
}

#[derive(Default)]
struct SvaState {
    // Address-space id -> binding, for coalescing binds of one space.
    spaces: BTreeMap<u64, Arc<Binding>>,
    // The shared supervisor binding, if any.
    supervisor: Option<Arc<Binding>>,
}

pub(crate) struct SvaCore {
    pub(crate) config: SvaConfig,
    // The subsystem mutex: serialises bind/unbind/cleanup and guards
    // SvaState plus device-set mutations. Never held across an
    // invalidation wait.
    state: Mutex<SvaState>,
    pub(crate) pasids: Arc<PasidTable>,
    pub(crate) sink: Arc<dyn FaultSink>,
    cleanup: Mutex<Option<mpsc::Sender<Arc<Binding>>>>,
}

/// The shared virtual addressing subsystem.
pub struct Sva {
    core: Arc<SvaCore>,
    cleanup_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Sva {
    /// Creates the subsystem. Guest-mode faults are dispatched to `sink`.
    pub fn new(config: SvaConfig, sink: Arc<dyn FaultSink>) -> Sva {
        let core = Arc::new(SvaCore {
            config,
            state: Mutex::new(SvaState::default()),
            pasids: Arc::new(PasidTable::new()),
            sink,
            cleanup: Mutex::new(None),
        });
        let observer_core: Arc<dyn PasidObserver> = core.clone();
        let observer: Weak<dyn PasidObserver> = Arc::downgrade(&observer_core);
        core.pasids.register_observer(observer);

        let (sender, receiver) = mpsc::channel::<Arc<Binding>>();
        *core.cleanup.lock() = Some(sender);
        let worker_core = core.clone();
        let worker = thread::Builder::new()
            .name("sva-cleanup".to_string())
            .spawn(move || {
                while let Ok(binding) = receiver.recv() {
                    worker_core.cleanup_binding(binding);
                }
            })
            .expect("failed to spawn cleanup thread");

        Sva {
            core,
            cleanup_worker: Mutex::new(Some(worker)),
        }
    }

    /// Registers an IOMMU unit with the subsystem.
    pub fn add_unit(&self, name: &str, backend: Arc<dyn IommuBackend>) -> Arc<IommuUnit> {
        IommuUnit::new(name, backend)
    }

    /// The PASID allocation table. Guest PASIDs are allocated here by their
    /// external owner before [`Sva::bind_guest`].
    pub fn pasids(&self) -> &Arc<PasidTable> {
        &self.core.pasids
    }

    /// Enables page request servicing on `unit`: allocates the ring,
    /// programs the queue registers and starts the service thread. A second
    /// call on an enabled unit is a no-op.
    pub fn enable_page_requests(&self, unit: &Arc<IommuUnit>) -> Result<()> {
        let mut prq = unit.prq.lock();
        if prq.is_some() {
            return Ok(());
        }
        let ring = PrqRing::new(self.core.config.prq_order);
        let irq = Arc::new(PrqInterrupt::new());
        unit.backend()
            .set_prq_interrupt(Some(irq.clone()))
            .map_err(SvaError::InterruptSetup)?;
        unit.backend().set_prq_base(Some(ring.clone()));

        let worker = PrqWorker {
            core: self.core.clone(),
            unit: unit.clone(),
            ring: ring.clone(),
        };
        let worker_irq = irq.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-prq", unit.name()))
            .spawn(move || worker.run(worker_irq))
            .expect("failed to spawn page request thread");

        *prq = Some(PrqContext {
            ring,
            irq,
            worker: Some(handle),
        });
        Ok(())
    }

    /// Stops page request servicing on `unit` and tears the queue down.
    pub fn disable_page_requests(&self, unit: &Arc<IommuUnit>) {
        let ctx = unit.prq.lock().take();
        let Some(mut ctx) = ctx else {
            return;
        };
        ctx.irq.stop();
        if let Some(worker) = ctx.worker.take() {
            let _ = worker.join();
        }
        unit.backend().set_prq_base(None);
        if let Err(e) = unit.backend().set_prq_interrupt(None) {
            warn!("{}: failed to release prq interrupt: {:#}", unit.name(), e);
        }
    }

    fn check_unit(&self, unit: &IommuUnit) -> Result<()> {
        let caps = unit.capabilities();
        if !caps.contains(IommuCaps::PASID) {
            return Err(SvaError::NotCapable);
        }
        if self.core.config.gb_pages && !caps.contains(IommuCaps::FL1GP) {
            error!("{}: incompatible 1 GiB page capability", unit.name());
            return Err(SvaError::NotCapable);
        }
        if self.core.config.five_level_paging && !caps.contains(IommuCaps::FL5LP) {
            error!("{}: incompatible paging mode", unit.name());
            return Err(SvaError::NotCapable);
        }
        Ok(())
    }

    fn host_binding_flags(&self, supervisor: bool) -> BindingFlags {
        let mut flags = BindingFlags::empty();
        if supervisor {
            flags |= BindingFlags::SUPERVISOR;
        }
        if self.core.config.five_level_paging {
            flags |= BindingFlags::FIVE_LEVEL;
        }
        if self.core.config.gb_pages {
            flags |= BindingFlags::GB_PAGES;
        }
        flags
    }

    fn program_first_level(&self, endpoint: &Arc<Endpoint>, binding: &Binding) -> Result<()> {
        let root = match binding.space() {
            Some(space) => space.root_table(),
            None => self.core.config.kernel_root_table,
        };
        let entry = PasidEntry::FirstLevel {
            root,
            did: DomainId::FIRST_LEVEL_DEFAULT,
            supervisor: binding.flags().contains(BindingFlags::SUPERVISOR),
            five_level: binding.flags().contains(BindingFlags::FIVE_LEVEL),
        };
        endpoint
            .unit()
            .program_pasid_entry(endpoint.sid(), binding.pasid(), &entry)
            .map_err(SvaError::PasidEntry)
    }

    /// Establishes a host-mode binding of `endpoint` to `space`, creating a
    /// fresh PASID for the space on its first bind.
    pub fn bind(
        &self,
        endpoint: &Arc<Endpoint>,
        space: Option<Arc<dyn AddressSpace>>,
        flags: BindFlags,
    ) -> Result<SvaHandle> {
        self.check_unit(endpoint.unit())?;
        if endpoint.pasid_bits() == 0 {
            return Err(SvaError::PasidUnsupported(endpoint.sid()));
        }
        if flags.intersects(
            BindFlags::GUEST_MODE | BindFlags::GUEST_PASID_VALID | BindFlags::HPASID_DEFAULT,
        ) {
            return Err(SvaError::InvalidArguments("guest flags on a host bind"));
        }
        let supervisor = flags.contains(BindFlags::SUPERVISOR_MODE);
        if supervisor {
            if !endpoint.unit().capabilities().contains(IommuCaps::SRS) {
                return Err(SvaError::NotCapable);
            }
            if space.is_some() {
                return Err(SvaError::InvalidArguments(
                    "supervisor bind takes no address space",
                ));
            }
        } else if space.is_none() {
            return Err(SvaError::InvalidArguments("host bind requires an address space"));
        }
        let pasid_limit = if endpoint.pasid_bits() >= PASID_BITS {
            PASID_MAX
        } else {
            1 << endpoint.pasid_bits()
        };

        let mut state = self.core.state.lock();
        let existing = match &space {
            Some(space) => state.spaces.get(&space.id()).cloned(),
            None => state.supervisor.clone(),
        };
        if let Some(binding) = existing {
            if binding.pasid().val() >= pasid_limit {
                warn!(
                    "{}: limited PASID width, cannot use existing PASID {}",
                    endpoint.name(),
                    binding.pasid()
                );
                return Err(SvaError::OutOfPasids);
            }
            if binding.find_device(endpoint.sid()).is_some() {
                return Err(SvaError::AlreadyBound(endpoint.sid(), binding.pasid()));
            }
            // A new device joining an existing binding still gets its own
            // PASID table entry.
            self.program_first_level(endpoint, &binding)?;
            binding.add_device(DeviceBinding::new(endpoint, DomainId::FIRST_LEVEL_DEFAULT));
            return Ok(SvaHandle {
                endpoint: endpoint.clone(),
                pasid: binding.pasid(),
            });
        }

        let pasid = self
            .core
            .pasids
            .alloc(PasidSet::Host, 1, pasid_limit)
            .ok_or(SvaError::OutOfPasids)?;
        let mode = if supervisor {
            BindingMode::HostSupervisor
        } else {
            BindingMode::HostUser
        };
        let binding = Binding::new(
            pasid,
            mode,
            self.host_binding_flags(supervisor),
            space.clone(),
            None,
        );
        if let Some(space) = &space {
            let observer = BindingObserver::new(&binding);
            let dyn_observer: Arc<dyn SpaceObserver> = observer.clone();
            if let Err(e) = space.attach_observer(dyn_observer) {
                self.core.pasids.put(pasid);
                return Err(SvaError::Observer(e));
            }
            binding.set_observer(observer);
        }
        if let Err(e) = self.program_first_level(endpoint, &binding) {
            self.core.detach_observer(&binding);
            self.core.pasids.put(pasid);
            return Err(e);
        }
        self.core.pasids.attach_data(pasid, binding.clone());
        match &space {
            Some(space) => {
                state.spaces.insert(space.id(), binding.clone());
            }
            None => state.supervisor = Some(binding.clone()),
        }
        binding.add_device(DeviceBinding::new(endpoint, DomainId::FIRST_LEVEL_DEFAULT));
        if let Some(space) = &space {
            // The space now translates DMA too; mappings it creates from
            // here on must target this PASID.
            space.publish_pasid(Some(pasid));
        }
        Ok(SvaHandle {
            endpoint: endpoint.clone(),
            pasid,
        })
    }

    /// Tears down the host-mode binding behind `handle`. Unbinding an
    /// already-released binding succeeds silently.
    pub fn unbind(&self, handle: SvaHandle) -> Result<()> {
        self.unbind_endpoint(
            &handle.endpoint,
            handle.pasid,
            Some(PasidSet::Host),
            false,
            false,
        )
    }

    fn unbind_endpoint(
        &self,
        endpoint: &Arc<Endpoint>,
        pasid: Pasid,
        set: Option<PasidSet>,
        keep_pte: bool,
        drop_fault_data: bool,
    ) -> Result<()> {
        let mut state = self.core.state.lock();
        let Some(binding) = self.core.pasids.find(set, pasid.val()) else {
            return Ok(());
        };
        let Some(device) = binding.find_device(endpoint.sid()) else {
            return Ok(());
        };
        if device.release_user() > 0 {
            return Ok(());
        }
        binding.remove_device(endpoint.sid());
        device
            .unit()
            .teardown_pasid_entry(device.sid(), pasid, false, keep_pte);
        let last = binding.device_count() == 0;
        if last {
            binding.set_state(LifeState::Draining);
            match binding.mode() {
                BindingMode::HostUser => {
                    if let Some(space) = binding.space() {
                        state.spaces.remove(&space.id());
                    }
                }
                BindingMode::HostSupervisor => {
                    if state
                        .supervisor
                        .as_ref()
                        .map_or(false, |b| Arc::ptr_eq(b, &binding))
                    {
                        state.supervisor = None;
                    }
                }
                BindingMode::GuestNested => {}
            }
        }
        drop(state);

        // The service thread keeps resolving queued faults for this PASID
        // until the drain returns; only then is the binding retired.
        prq::drain(
            device.unit(),
            device.sid(),
            device.did(),
            device.dev_tlb(),
            pasid,
        );

        if last {
            let state = self.core.state.lock();
            self.core.detach_observer(&binding);
            if let Some(space) = binding.space() {
                space.publish_pasid(None);
            }
            self.core.pasids.detach_data(pasid);
            self.core.pasids.put(pasid);
            binding.set_state(LifeState::Freed);
            drop(state);
        }
        if drop_fault_data && endpoint.aux_domains() {
            // Outside the subsystem mutex; the reporting path may hold
            // this data concurrently.
            self.core.sink.remove_fault_data(endpoint.sid(), pasid);
        }
        Ok(())
    }

    /// Binds `endpoint` to a guest page table nested over `domain`'s
    /// second-level translation.
    pub fn bind_guest(
        &self,
        domain: &Arc<Domain>,
        endpoint: &Arc<Endpoint>,
        data: &GuestBindData,
        fault_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<()> {
        if data.format != PASID_FORMAT_VTD {
            return Err(SvaError::InvalidDescriptor("unknown descriptor format"));
        }
        if data.argsz < GuestBindData::MIN_ARGSZ {
            return Err(SvaError::InvalidDescriptor("descriptor too small"));
        }
        if data.vendor_flags & !GUEST_VENDOR_FLAGS_MASK != 0 {
            return Err(SvaError::InvalidDescriptor("reserved vendor flags set"));
        }
        if data.flags.contains(BindFlags::SUPERVISOR_MODE) {
            return Err(SvaError::InvalidDescriptor("supervisor flag on a guest bind"));
        }
        let hpasid_default = data.flags.contains(BindFlags::HPASID_DEFAULT);
        // Except for domain-default (gIOVA) usage, nesting requires the
        // full PASID width from the device.
        if !hpasid_default && endpoint.pasid_bits() != PASID_BITS {
            return Err(SvaError::InvalidArguments("endpoint lacks full PASID width"));
        }
        let pasid = if hpasid_default {
            domain
                .default_pasid()
                .ok_or(SvaError::DefaultPasidUnassigned)?
        } else {
            Pasid::new(data.hpasid).ok_or(SvaError::InvalidPasid(data.hpasid))?
        };

        // Fault routing must be reachable the moment the PASID entry goes
        // live, and installing it under the subsystem mutex would race the
        // service thread's reporting path.
        let fault_data_installed = if endpoint.aux_domains() && domain.needs_fault_data() {
            match fault_data {
                Some(data) => {
                    self.core
                        .sink
                        .install_fault_data(endpoint.sid(), pasid, data)
                        .map_err(SvaError::FaultData)?;
                    true
                }
                None => false,
            }
        } else {
            false
        };

        let state = self.core.state.lock();
        let result = self.bind_guest_locked(domain, endpoint, data, pasid);
        drop(state);
        if result.is_err() && fault_data_installed {
            self.core.sink.remove_fault_data(endpoint.sid(), pasid);
        }
        result
    }

    fn bind_guest_locked(
        &self,
        domain: &Arc<Domain>,
        endpoint: &Arc<Endpoint>,
        data: &GuestBindData,
        pasid: Pasid,
    ) -> Result<()> {
        let existing = self.core.pasids.find(None, pasid.val());
        if let Some(binding) = &existing {
            if binding.state() != LifeState::Live {
                return Err(SvaError::InvalidPasid(pasid.val()));
            }
            if binding.find_device(endpoint.sid()).is_some() {
                warn!("{}: already bound with PASID {}", endpoint.name(), pasid);
                return Err(SvaError::AlreadyBound(endpoint.sid(), pasid));
            }
        }
        let created = existing.is_none();
        let binding = match existing {
            Some(binding) => binding,
            None => {
                // The PASID was allocated by its external owner; hold a
                // reference for the binding's lifetime.
                if !self.core.pasids.get(pasid) {
                    return Err(SvaError::InvalidPasid(pasid.val()));
                }
                let mut flags = BindingFlags::GUEST_MODE;
                let guest_pasid = if data.flags.contains(BindFlags::GUEST_PASID_VALID) {
                    flags |= BindingFlags::GUEST_PASID;
                    Some(data.gpasid)
                } else {
                    None
                };
                let binding = Binding::new(
                    pasid,
                    BindingMode::GuestNested,
                    flags,
                    None,
                    guest_pasid,
                );
                self.core.pasids.attach_data(pasid, binding.clone());
                binding
            }
        };

        let entry = PasidEntry::Nested {
            first_root: data.gpgd,
            addr_width: data.addr_width,
            vendor_flags: data.vendor_flags,
            did: domain.did(),
        };
        if let Err(e) = endpoint
            .unit()
            .program_pasid_entry(endpoint.sid(), pasid, &entry)
        {
            error!(
                "{}: failed to set up PASID {} in nested mode: {:#}",
                endpoint.name(),
                pasid,
                e
            );
            endpoint
                .unit()
                .teardown_pasid_entry(endpoint.sid(), pasid, false, false);
            if created {
                self.core.pasids.detach_data(pasid);
                self.core.pasids.put(pasid);
            }
            return Err(SvaError::PasidEntry(e));
        }
        binding.add_device(DeviceBinding::new(endpoint, domain.did()));
        Ok(())
    }

    /// Releases the guest-mode binding of (`endpoint`, `pasid`). Unbinding
    /// an already-released binding succeeds silently.
    pub fn unbind_guest(
        &self,
        domain: &Arc<Domain>,
        endpoint: &Arc<Endpoint>,
        pasid: u32,
        flags: BindFlags,
    ) -> Result<()> {
        let (pasid, set, keep_pte) = if flags.contains(BindFlags::HPASID_DEFAULT) {
            let pasid = domain
                .default_pasid()
                .ok_or(SvaError::DefaultPasidUnassigned)?;
            (pasid, Some(PasidSet::Host), true)
        } else {
            (
                Pasid::new(pasid).ok_or(SvaError::InvalidPasid(pasid))?,
                None,
                false,
            )
        };
        self.unbind_endpoint(endpoint, pasid, set, keep_pte, true)
    }

    /// Submits the page group response composed by an external fault
    /// handler for a previously reported guest-mode fault.
    pub fn page_response(
        &self,
        _domain: &Arc<Domain>,
        endpoint: &Arc<Endpoint>,
        event: &FaultEvent,
        msg: &PageResponse,
    ) -> Result<()> {
        if !event.pasid_valid {
            return Err(SvaError::InvalidArguments("response requires a PASID"));
        }
        let Some(pasid) = Pasid::new(event.pasid) else {
            return Err(SvaError::InvalidPasid(event.pasid));
        };
        {
            let _state = self.core.state.lock();
            let binding = self
                .core
                .pasids
                .find(None, pasid.val())
                .ok_or(SvaError::NotFound(endpoint.sid(), event.pasid))?;
            if binding.find_device(endpoint.sid()).is_none() {
                return Err(SvaError::NotFound(endpoint.sid(), event.pasid));
            }
        }
        if event.last_page || event.private_data.is_some() {
            let resp = InvDescriptor::page_group_response(
                endpoint.sid(),
                event.pasid,
                event.pasid_valid,
                event.private_data,
                msg.code,
                event.group,
                event.last_page,
            );
            endpoint
                .unit()
                .backend()
                .submit_invalidations(&[resp], false)
                .map_err(SvaError::Response)?;
        }
        Ok(())
    }
}

impl Drop for Sva {
    fn drop(&mut self) {
        // Closing the channel stops the cleanup worker.
        *self.core.cleanup.lock() = None;
        if let Some(worker) = self.cleanup_worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl PasidObserver for SvaCore {
    fn pasid_freed(&self, pasid: Pasid, binding: &Arc<Binding>) {
        if binding.pasid() != pasid {
            warn!(
                "PASID free notification mismatch: {} vs {}",
                pasid,
                binding.pasid()
            );
            return;
        }
        let cleanup = self.cleanup.lock();
        match cleanup.as_ref() {
            Some(sender) => {
                if sender.send(binding.clone()).is_err() {
                    warn!("cleanup worker gone; PASID {} not reclaimed", pasid);
                }
            }
            None => warn!("cleanup queue closed; PASID {} not reclaimed", pasid),
        }
    }
}

impl SvaCore {
    fn detach_observer(&self, binding: &Binding) {
        if let (Some(space), Some(observer)) = (binding.space(), binding.take_observer()) {
            let observer: Arc<dyn SpaceObserver> = observer;
            space.detach_observer(&observer);
        }
    }

    /// Retires a binding whose PASID was freed by its external owner while
    /// devices were still attached.
    fn cleanup_binding(&self, binding: Arc<Binding>) {
        let mut state = self.state.lock();
        if binding.state() != LifeState::Live {
            // An unbind beat the notification; nothing left to do.
            return;
        }
        binding.set_state(LifeState::Draining);
        match binding.mode() {
            BindingMode::HostUser => {
                if let Some(space) = binding.space() {
                    state.spaces.remove(&space.id());
                }
            }
            BindingMode::HostSupervisor => {
                if state
                    .supervisor
                    .as_ref()
                    .map_or(false, |b| Arc::ptr_eq(b, &binding))
                {
                    state.supervisor = None;
                }
            }
            BindingMode::GuestNested => {}
        }
        let devices = binding.take_devices();
        for device in &devices {
            device
                .unit()
                .teardown_pasid_entry(device.sid(), binding.pasid(), true, false);
        }
        drop(state);

        for device in &devices {
            prq::drain(
                device.unit(),
                device.sid(),
                device.did(),
                device.dev_tlb(),
                binding.pasid(),
            );
        }

        let state = self.state.lock();
        self.detach_observer(&binding);
        if let Some(space) = binding.space() {
            space.publish_pasid(None);
        }
        self.pasids.detach_data(binding.pasid());
        self.pasids.put(binding.pasid());
        binding.set_state(LifeState::Freed);
        drop(state);

        // Partial-assignment fault routing goes away only after the mutex
        // is released, so it cannot race queue reporting.
        for device in &devices {
            if device.endpoint().aux_domains() {
                self.sink.remove_fault_data(device.sid(), binding.pasid());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn va_bits_follow_paging_mode() {
        let mut config = SvaConfig::default();
        assert_eq!(config.va_bits(), 48);
        config.five_level_paging = true;
        assert_eq!(config.va_bits(), 57);
    }
}
