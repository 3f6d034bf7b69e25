// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared Virtual Addressing (SVA) core for an Intel-style IOMMU.
//!
//! DMA-capable devices tag requests with a Process Address Space ID (PASID)
//! and walk the page tables of the address space bound to that PASID. This
//! crate owns the software side of that contract:
//!
//! - the registry of PASID → address-space bindings and the devices
//!   attached to each of them,
//! - the page request queue (PRQ) service thread that resolves recoverable
//!   device page faults and posts group responses,
//! - the drain protocol that quiesces in-flight faults before a binding is
//!   torn down, and
//! - the observer that keeps IOMMU and device TLBs coherent with the bound
//!   address space.
//!
//! Hardware access, device enumeration and the address-space internals stay
//! behind the [`backend::IommuBackend`], [`device::Endpoint`] and
//! [`address_space::AddressSpace`] boundaries; `testing` provides recording
//! fakes for all three.

pub mod address_space;
pub mod backend;
pub mod descriptor;
pub mod device;
pub mod fault;
mod observer;
pub mod pasid;
pub mod prq;
pub mod registry;
mod sva;
pub mod testing;

use remain::sorted;
use thiserror::Error;

use crate::device::SourceId;
use crate::pasid::Pasid;

pub use crate::sva::BindFlags;
pub use crate::sva::GuestBindData;
pub use crate::sva::Sva;
pub use crate::sva::SvaConfig;
pub use crate::sva::SvaHandle;
pub use crate::sva::PASID_FORMAT_VTD;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

#[sorted]
#[derive(Error, Debug)]
pub enum SvaError {
    #[error("device {0} is already bound to PASID {1}")]
    AlreadyBound(SourceId, Pasid),
    #[error("domain has no pre-assigned host PASID")]
    DefaultPasidUnassigned,
    #[error("failed to install fault routing data: {0}")]
    FaultData(anyhow::Error),
    #[error("failed to register page request interrupt: {0}")]
    InterruptSetup(anyhow::Error),
    #[error("invalid bind arguments: {0}")]
    InvalidArguments(&'static str),
    #[error("malformed guest bind descriptor: {0}")]
    InvalidDescriptor(&'static str),
    #[error("PASID {0} is out of range or not allocated")]
    InvalidPasid(u32),
    #[error("IOMMU unit is not SVA capable")]
    NotCapable,
    #[error("no binding for device {0} and PASID {1}")]
    NotFound(SourceId, u32),
    #[error("failed to attach address space observer: {0}")]
    Observer(anyhow::Error),
    #[error("PASID space exhausted")]
    OutOfPasids,
    #[error("failed to program PASID table entry: {0}")]
    PasidEntry(anyhow::Error),
    #[error("device {0} lacks PASID support")]
    PasidUnsupported(SourceId),
    #[error("failed to post page group response: {0}")]
    Response(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SvaError>;
