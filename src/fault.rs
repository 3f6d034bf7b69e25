// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host fault resolution and the external fault dispatch boundary.

use std::any::Any;
use std::sync::Arc;

use log::warn;

use crate::address_space::Access;
use crate::address_space::FaultFlags;
use crate::descriptor::PageRequest;
use crate::descriptor::ResponseCode;
use crate::device::Endpoint;
use crate::device::SourceId;
use crate::pasid::Pasid;
use crate::registry::Binding;
use crate::registry::BindingMode;
use crate::sva::SvaConfig;

/// A page fault forwarded to an external handler for guest-mode bindings.
#[derive(Clone, Debug)]
pub struct FaultEvent {
    pub sid: SourceId,
    pub pasid: u32,
    pub pasid_valid: bool,
    /// The eventual response must carry the PASID back to the device.
    pub needs_pasid: bool,
    pub address: u64,
    pub access: Access,
    pub group: u16,
    pub last_page: bool,
    pub private_data: Option<[u64; 2]>,
}

impl FaultEvent {
    pub(crate) fn from_request(req: &PageRequest) -> FaultEvent {
        // Private data demands a group response exactly like last-page, so
        // surface it as one for handlers that only understand the latter.
        let last_page = req.last_in_group() || req.priv_data_present();
        FaultEvent {
            sid: req.rid(),
            pasid: req.pasid(),
            pasid_valid: req.pasid_present(),
            needs_pasid: req.pasid_present(),
            address: req.address(),
            access: req.requested_access(),
            group: req.group_index(),
            last_page,
            private_data: req.private_data(),
        }
    }
}

/// A resolution produced by an external fault handler.
#[derive(Copy, Clone, Debug)]
pub struct PageResponse {
    pub code: ResponseCode,
}

/// External dispatcher for faults the core does not resolve itself.
pub trait FaultSink: Send + Sync {
    /// Reports a guest-mode fault for `endpoint`. A successful report
    /// transfers response ownership to the external handler.
    fn report(&self, endpoint: &Arc<Endpoint>, event: &FaultEvent) -> anyhow::Result<()>;

    /// Installs per-(device, PASID) fault routing data ahead of nested
    /// PASID entry programming.
    fn install_fault_data(
        &self,
        _sid: SourceId,
        _pasid: Pasid,
        _data: Arc<dyn Any + Send + Sync>,
    ) -> anyhow::Result<()> {
        anyhow::bail!("per-PASID fault data not supported")
    }

    /// Removes fault routing data installed by `install_fault_data`.
    fn remove_fault_data(&self, _sid: SourceId, _pasid: Pasid) {}
}

/// Whether the high bits of `addr` correctly sign-extend the VA width.
pub(crate) fn is_canonical(addr: u64, va_bits: u32) -> bool {
    let shift = 64 - va_bits;
    (((addr as i64) << shift) >> shift) == addr as i64
}

fn access_error(granted: Access, requested: Access) -> bool {
    let requested = requested & (Access::READ | Access::WRITE | Access::EXEC);
    !granted.contains(requested)
}

/// Resolves a host-mode page request against the binding's address space.
pub(crate) fn resolve(config: &SvaConfig, binding: &Binding, req: &PageRequest) -> ResponseCode {
    // Supervisor bindings walk the kernel's tables; a device has no
    // business issuing recoverable faults against those.
    if binding.mode() != BindingMode::HostUser {
        warn!(
            "page request on {:?} binding for PASID {}",
            binding.mode(),
            binding.pasid()
        );
        return ResponseCode::Invalid;
    }
    let Some(space) = binding.space() else {
        return ResponseCode::Invalid;
    };
    let address = req.address();
    if !is_canonical(address, config.va_bits()) {
        return ResponseCode::Invalid;
    }
    // The space may be mid-exit; resolving against half-torn-down tables
    // is not recoverable for the device either way.
    if !space.try_retain() {
        return ResponseCode::Invalid;
    }
    let mut code = ResponseCode::Invalid;
    space.with_read_lock(&mut |regions| {
        let Some(region) = regions.region_covering(address) else {
            return;
        };
        if address < region.start {
            return;
        }
        if access_error(region.access, req.requested_access()) {
            return;
        }
        let mut flags = FaultFlags::USER | FaultFlags::REMOTE;
        if req.wr_req() {
            flags |= FaultFlags::WRITE;
        }
        if regions.handle_fault(address, flags).is_ok() {
            code = ResponseCode::Success;
        }
    });
    space.release();
    code
}
