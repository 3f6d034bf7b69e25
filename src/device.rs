// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Descriptions of the devices and translation domains the subsystem binds.
//! Both are produced by device enumeration and domain management, which
//! live outside this crate.

use std::fmt;
use std::sync::Arc;

use sync::Mutex;

use crate::backend::IommuUnit;
use crate::pasid::Pasid;

/// Packed bus/device/function identity of a DMA requester.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(u16);

impl SourceId {
    pub fn new(bus: u8, devfn: u8) -> SourceId {
        SourceId(((bus as u16) << 8) | devfn as u16)
    }

    pub fn from_bits(bits: u16) -> SourceId {
        SourceId(bits)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bus = (self.0 >> 8) as u8;
        let devfn = (self.0 & 0xff) as u8;
        write!(f, "{:02x}:{:02x}.{}", bus, devfn >> 3, devfn & 0x7)
    }
}

/// IOMMU translation domain identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DomainId(u16);

impl DomainId {
    /// The domain carrying first-level-only (host) translations.
    pub const FIRST_LEVEL_DEFAULT: DomainId = DomainId(0);

    pub const fn new(val: u16) -> DomainId {
        DomainId(val)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

/// Device-TLB (ATS) parameters of an endpoint.
#[derive(Copy, Clone, Debug)]
pub struct AtsInfo {
    /// Invalidation queue depth advertised by the endpoint.
    pub queue_depth: u8,
    /// Source-ID the endpoint's translation requests carry when issued
    /// through a physical function.
    pub pfsid: u16,
}

/// A DMA endpoint as handed over by device enumeration.
pub struct Endpoint {
    name: String,
    sid: SourceId,
    unit: Arc<IommuUnit>,
    pasid_bits: u32,
    ats: Option<AtsInfo>,
    aux_domains: bool,
}

impl Endpoint {
    /// Describes an endpoint behind `unit` whose PASID capability is
    /// `pasid_bits` wide (zero for none).
    pub fn new(name: &str, sid: SourceId, unit: Arc<IommuUnit>, pasid_bits: u32) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            sid,
            unit,
            pasid_bits,
            ats: None,
            aux_domains: false,
        }
    }

    /// Marks the endpoint's device TLB as enabled.
    pub fn with_ats(mut self, ats: AtsInfo) -> Endpoint {
        self.ats = Some(ats);
        self
    }

    /// Marks the endpoint as assignable through auxiliary sub-domains,
    /// which routes its guest faults through per-PASID fault data.
    pub fn with_aux_domains(mut self) -> Endpoint {
        self.aux_domains = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sid(&self) -> SourceId {
        self.sid
    }

    pub fn unit(&self) -> &Arc<IommuUnit> {
        &self.unit
    }

    pub fn pasid_bits(&self) -> u32 {
        self.pasid_bits
    }

    pub fn ats(&self) -> Option<AtsInfo> {
        self.ats
    }

    pub fn aux_domains(&self) -> bool {
        self.aux_domains
    }
}

/// A second-level translation domain used by guest-mode bindings.
pub struct Domain {
    did: DomainId,
    default_pasid: Mutex<Option<Pasid>>,
    needs_fault_data: bool,
}

impl Domain {
    pub fn new(did: DomainId) -> Domain {
        Domain {
            did,
            default_pasid: Mutex::new(None),
            needs_fault_data: false,
        }
    }

    /// Requires guest faults in this domain to be routed through
    /// pre-installed per-PASID fault data.
    pub fn with_fault_data_required(mut self) -> Domain {
        self.needs_fault_data = true;
        self
    }

    pub fn did(&self) -> DomainId {
        self.did
    }

    /// Assigns (or clears) the host PASID used for whole-domain bindings.
    pub fn set_default_pasid(&self, pasid: Option<Pasid>) {
        *self.default_pasid.lock() = pasid;
    }

    pub fn default_pasid(&self) -> Option<Pasid> {
        *self.default_pasid.lock()
    }

    pub fn needs_fault_data(&self) -> bool {
        self.needs_fault_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_packing() {
        let sid = SourceId::new(0x3a, 0x41);
        assert_eq!(sid.bits(), 0x3a41);
        assert_eq!(SourceId::from_bits(0x3a41), sid);
        assert_eq!(format!("{}", sid), "3a:08.1");
    }
}
