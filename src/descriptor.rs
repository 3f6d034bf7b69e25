// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire-level descriptor formats: the 32-byte page request descriptor the
//! hardware posts into the request queue, and the invalidation-queue
//! descriptors software submits back (group responses, TLB flushes and the
//! fenced wait used while draining).

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::address_space::Access;
use crate::device::DomainId;
use crate::device::SourceId;
use crate::pasid::Pasid;

/// Size of every queue descriptor, request and invalidation alike.
pub const PAGE_REQUEST_SIZE: usize = 32;

/// Type code of a page request descriptor.
pub const PAGE_REQUEST_TYPE: u8 = 1;

/// Status delivered in a page group response.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    /// All pages in the group were made resident.
    Success,
    /// The request was malformed or hit an unmapped or forbidden address.
    Invalid,
    /// The target is in a state where it cannot service page requests.
    Failure,
}

impl ResponseCode {
    fn raw(self) -> u64 {
        match self {
            ResponseCode::Success => 0,
            ResponseCode::Invalid => 1,
            ResponseCode::Failure => 0xf,
        }
    }

    fn from_raw(raw: u64) -> ResponseCode {
        match raw {
            0 => ResponseCode::Success,
            1 => ResponseCode::Invalid,
            _ => ResponseCode::Failure,
        }
    }
}

// Page request qword 0.
const REQ_TYPE_MASK: u64 = 0xff;
const REQ_PASID_PRESENT: u64 = 1 << 8;
const REQ_PRIV_DATA_PRESENT: u64 = 1 << 9;
const REQ_RID_SHIFT: u64 = 16;
const REQ_RID_MASK: u64 = 0xffff;
const REQ_PASID_SHIFT: u64 = 32;
const REQ_PASID_MASK: u64 = 0xf_ffff;
const REQ_EXE: u64 = 1 << 52;
const REQ_PM: u64 = 1 << 53;
// Page request qword 1.
const REQ_RD: u64 = 1 << 0;
const REQ_WR: u64 = 1 << 1;
const REQ_LPIG: u64 = 1 << 2;
const REQ_GROUP_SHIFT: u64 = 3;
const REQ_GROUP_MASK: u64 = 0x1ff;
const REQ_ADDR_MASK: u64 = !0xfff;

/// A page request descriptor, as the hardware lays it out in the request
/// queue ring.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromZeroes, FromBytes)]
pub struct PageRequest {
    qw0: u64,
    qw1: u64,
    priv_data: [u64; 2],
}

const _: () = assert!(std::mem::size_of::<PageRequest>() == PAGE_REQUEST_SIZE);

impl PageRequest {
    /// Builds a request from `rid` for `pasid` at the page containing
    /// `addr`.
    pub fn new(
        rid: SourceId,
        pasid: Pasid,
        addr: u64,
        access: Access,
        group: u16,
        last: bool,
    ) -> PageRequest {
        let mut qw0 = PAGE_REQUEST_TYPE as u64
            | REQ_PASID_PRESENT
            | ((rid.bits() as u64) << REQ_RID_SHIFT)
            | (((pasid.val() as u64) & REQ_PASID_MASK) << REQ_PASID_SHIFT);
        if access.contains(Access::EXEC) {
            qw0 |= REQ_EXE;
        }
        if access.contains(Access::PRIV) {
            qw0 |= REQ_PM;
        }
        let mut qw1 = (addr & REQ_ADDR_MASK) | (((group as u64) & REQ_GROUP_MASK) << REQ_GROUP_SHIFT);
        if access.contains(Access::READ) {
            qw1 |= REQ_RD;
        }
        if access.contains(Access::WRITE) {
            qw1 |= REQ_WR;
        }
        if last {
            qw1 |= REQ_LPIG;
        }
        PageRequest {
            qw0,
            qw1,
            priv_data: [0; 2],
        }
    }

    /// Attaches 16 bytes of private data that the response must echo.
    pub fn with_private_data(mut self, data: [u64; 2]) -> PageRequest {
        self.qw0 |= REQ_PRIV_DATA_PRESENT;
        self.priv_data = data;
        self
    }

    /// Clears the PASID-present bit, producing the malformed request shape a
    /// misbehaving device could post.
    pub fn without_pasid(mut self) -> PageRequest {
        self.qw0 &= !REQ_PASID_PRESENT;
        self
    }

    pub fn request_type(&self) -> u8 {
        (self.qw0 & REQ_TYPE_MASK) as u8
    }

    pub fn pasid_present(&self) -> bool {
        self.qw0 & REQ_PASID_PRESENT != 0
    }

    pub fn priv_data_present(&self) -> bool {
        self.qw0 & REQ_PRIV_DATA_PRESENT != 0
    }

    pub fn rid(&self) -> SourceId {
        SourceId::from_bits(((self.qw0 >> REQ_RID_SHIFT) & REQ_RID_MASK) as u16)
    }

    pub fn pasid(&self) -> u32 {
        ((self.qw0 >> REQ_PASID_SHIFT) & REQ_PASID_MASK) as u32
    }

    pub fn exe_req(&self) -> bool {
        self.qw0 & REQ_EXE != 0
    }

    pub fn pm_req(&self) -> bool {
        self.qw0 & REQ_PM != 0
    }

    pub fn rd_req(&self) -> bool {
        self.qw1 & REQ_RD != 0
    }

    pub fn wr_req(&self) -> bool {
        self.qw1 & REQ_WR != 0
    }

    pub fn last_in_group(&self) -> bool {
        self.qw1 & REQ_LPIG != 0
    }

    pub fn group_index(&self) -> u16 {
        ((self.qw1 >> REQ_GROUP_SHIFT) & REQ_GROUP_MASK) as u16
    }

    /// Faulting address. Bits below the page granule read as zero.
    pub fn address(&self) -> u64 {
        self.qw1 & REQ_ADDR_MASK
    }

    pub fn private_data(&self) -> Option<[u64; 2]> {
        self.priv_data_present().then_some(self.priv_data)
    }

    pub fn requested_access(&self) -> Access {
        let mut access = Access::empty();
        if self.rd_req() {
            access |= Access::READ;
        }
        if self.wr_req() {
            access |= Access::WRITE;
        }
        if self.exe_req() {
            access |= Access::EXEC;
        }
        if self.pm_req() {
            access |= Access::PRIV;
        }
        access
    }
}

// Invalidation descriptor type codes (qword 0, low nibble).
const INV_TYPE_MASK: u64 = 0xf;
pub const INV_TYPE_WAIT: u64 = 0x5;
pub const INV_TYPE_PIOTLB: u64 = 0x6;
pub const INV_TYPE_DEV_PIOTLB: u64 = 0x8;
pub const INV_TYPE_PAGE_GROUP_RESP: u64 = 0x9;

// Wait descriptor.
const WAIT_STATUS_WRITE: u64 = 1 << 5;
const WAIT_FENCE: u64 = 1 << 6;
const WAIT_STATUS_DONE: u64 = 1 << 32;

// PASID-scoped IOTLB invalidation.
const PIOTLB_GRAN_SHIFT: u64 = 4;
const PIOTLB_GRAN_PASID: u64 = 2;
const PIOTLB_GRAN_PAGES: u64 = 3;
const PIOTLB_DID_SHIFT: u64 = 16;
const PIOTLB_PASID_SHIFT: u64 = 32;
const PIOTLB_PASID_MASK: u64 = 0xf_ffff;
const PIOTLB_IH: u64 = 1 << 6;
const PIOTLB_AM_MASK: u64 = 0x3f;
const PIOTLB_ADDR_MASK: u64 = !0xfff;

// Device-TLB invalidation.
const DEV_PIOTLB_QDEP_SHIFT: u64 = 4;
const DEV_PIOTLB_QDEP_MASK: u64 = 0x1f;
const DEV_PIOTLB_SID_SHIFT: u64 = 16;
const DEV_PIOTLB_PASID_SHIFT: u64 = 32;
const DEV_PIOTLB_SIZE: u64 = 1 << 11;
/// Queue depths at or above this disable per-invalidation accounting.
pub const DEV_IOTLB_MAX_INVS: u8 = 32;

// Page group response.
const PGRP_PASID_PRESENT: u64 = 1 << 4;
const PGRP_PDP: u64 = 1 << 5;
const PGRP_RESP_CODE_SHIFT: u64 = 12;
const PGRP_RESP_CODE_MASK: u64 = 0xf;
const PGRP_DID_SHIFT: u64 = 16;
const PGRP_PASID_SHIFT: u64 = 32;
const PGRP_PASID_MASK: u64 = 0xf_ffff;
const PGRP_LPIG: u64 = 1 << 0;
const PGRP_INDEX_SHIFT: u64 = 3;
const PGRP_INDEX_MASK: u64 = 0x1ff;

/// A 32-byte invalidation queue descriptor.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct InvDescriptor {
    pub qw0: u64,
    pub qw1: u64,
    pub qw2: u64,
    pub qw3: u64,
}

const _: () = assert!(std::mem::size_of::<InvDescriptor>() == PAGE_REQUEST_SIZE);

impl InvDescriptor {
    /// A fenced wait whose status write completes only after every prior
    /// descriptor in the batch has fully executed.
    pub fn wait_fenced() -> InvDescriptor {
        InvDescriptor {
            qw0: INV_TYPE_WAIT | WAIT_FENCE | WAIT_STATUS_WRITE | WAIT_STATUS_DONE,
            ..Default::default()
        }
    }

    /// Flushes every cached first-level translation for `pasid` in `did`.
    pub fn piotlb_all(did: DomainId, pasid: Pasid) -> InvDescriptor {
        InvDescriptor {
            qw0: INV_TYPE_PIOTLB
                | (PIOTLB_GRAN_PASID << PIOTLB_GRAN_SHIFT)
                | ((did.bits() as u64) << PIOTLB_DID_SHIFT)
                | ((pasid.val() as u64) << PIOTLB_PASID_SHIFT),
            ..Default::default()
        }
    }

    /// Flushes `1 << order` pages at `addr` for `pasid` in `did`. `ih`
    /// hints that leaf entries were not modified.
    pub fn piotlb_pages(did: DomainId, pasid: Pasid, addr: u64, order: u32, ih: bool) -> InvDescriptor {
        let mut qw1 = (addr & PIOTLB_ADDR_MASK) | (order as u64 & PIOTLB_AM_MASK);
        if ih {
            qw1 |= PIOTLB_IH;
        }
        InvDescriptor {
            qw0: INV_TYPE_PIOTLB
                | (PIOTLB_GRAN_PAGES << PIOTLB_GRAN_SHIFT)
                | ((did.bits() as u64) << PIOTLB_DID_SHIFT)
                | ((pasid.val() as u64) << PIOTLB_PASID_SHIFT),
            qw1,
            ..Default::default()
        }
    }

    /// Flushes the device TLB of the endpoint at `sid` for `pasid`. An
    /// `order` of zero targets a single page at `addr`; `addr` zero with
    /// `order` zero flushes conservatively.
    pub fn dev_iotlb_pages(
        sid: SourceId,
        pfsid: u16,
        pasid: Pasid,
        qdep: u8,
        addr: u64,
        order: u32,
    ) -> InvDescriptor {
        let mut qw1 = addr & PIOTLB_ADDR_MASK;
        if order > 0 {
            qw1 |= DEV_PIOTLB_SIZE;
        }
        InvDescriptor {
            qw0: INV_TYPE_DEV_PIOTLB
                | (((qdep as u64) & DEV_PIOTLB_QDEP_MASK) << DEV_PIOTLB_QDEP_SHIFT)
                | ((sid.bits() as u64) << DEV_PIOTLB_SID_SHIFT)
                | ((pasid.val() as u64) << DEV_PIOTLB_PASID_SHIFT)
                | (((pfsid as u64) & 0xf) << 12)
                | (((pfsid as u64) & 0xfff0) << 48),
            qw1,
            ..Default::default()
        }
    }

    /// A page group response to the requester at `rid`, echoing `priv_data`
    /// when the request carried some.
    pub fn page_group_response(
        rid: SourceId,
        pasid: u32,
        pasid_present: bool,
        priv_data: Option<[u64; 2]>,
        code: ResponseCode,
        group: u16,
        last: bool,
    ) -> InvDescriptor {
        let mut qw0 = INV_TYPE_PAGE_GROUP_RESP
            | ((rid.bits() as u64) << PGRP_DID_SHIFT)
            | (((pasid as u64) & PGRP_PASID_MASK) << PGRP_PASID_SHIFT)
            | (code.raw() << PGRP_RESP_CODE_SHIFT);
        if pasid_present {
            qw0 |= PGRP_PASID_PRESENT;
        }
        if priv_data.is_some() {
            qw0 |= PGRP_PDP;
        }
        let mut qw1 = ((group as u64) & PGRP_INDEX_MASK) << PGRP_INDEX_SHIFT;
        if last {
            qw1 |= PGRP_LPIG;
        }
        let [qw2, qw3] = priv_data.unwrap_or([0, 0]);
        InvDescriptor { qw0, qw1, qw2, qw3 }
    }

    pub fn inv_type(&self) -> u64 {
        self.qw0 & INV_TYPE_MASK
    }

    pub fn is_page_group_response(&self) -> bool {
        self.inv_type() == INV_TYPE_PAGE_GROUP_RESP
    }

    pub fn response_code(&self) -> ResponseCode {
        ResponseCode::from_raw((self.qw0 >> PGRP_RESP_CODE_SHIFT) & PGRP_RESP_CODE_MASK)
    }

    pub fn response_pasid(&self) -> u32 {
        ((self.qw0 >> PGRP_PASID_SHIFT) & PGRP_PASID_MASK) as u32
    }

    pub fn response_pasid_present(&self) -> bool {
        self.qw0 & PGRP_PASID_PRESENT != 0
    }

    pub fn response_group(&self) -> u16 {
        ((self.qw1 >> PGRP_INDEX_SHIFT) & PGRP_INDEX_MASK) as u16
    }

    pub fn response_last(&self) -> bool {
        self.qw1 & PGRP_LPIG != 0
    }

    pub fn echoed_private_data(&self) -> Option<[u64; 2]> {
        (self.qw0 & PGRP_PDP != 0).then_some([self.qw2, self.qw3])
    }

    pub fn piotlb_pasid(&self) -> u32 {
        ((self.qw0 >> PIOTLB_PASID_SHIFT) & PIOTLB_PASID_MASK) as u32
    }

    pub fn piotlb_address(&self) -> u64 {
        self.qw1 & PIOTLB_ADDR_MASK
    }

    pub fn piotlb_order(&self) -> u32 {
        (self.qw1 & PIOTLB_AM_MASK) as u32
    }
}
