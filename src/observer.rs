// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The observer installed on host-mode address spaces. It keeps the IOMMU
//! and device TLBs coherent with the space's mappings and fences hardware
//! off the page tables when the space exits.

use std::sync::Arc;
use std::sync::Weak;

use log::debug;

use crate::address_space::SpaceObserver;
use crate::descriptor::InvDescriptor;
use crate::registry::Binding;
use crate::registry::DeviceBinding;
use crate::PAGE_SHIFT;
use crate::PAGE_SIZE;

pub(crate) struct BindingObserver {
    binding: Weak<Binding>,
}

impl BindingObserver {
    pub(crate) fn new(binding: &Arc<Binding>) -> Arc<BindingObserver> {
        Arc::new(BindingObserver {
            binding: Arc::downgrade(binding),
        })
    }
}

impl SpaceObserver for BindingObserver {
    fn range_invalidated(&self, start: u64, end: u64) {
        let Some(binding) = self.binding.upgrade() else {
            return;
        };
        let pages = (end.saturating_sub(start) + PAGE_SIZE - 1) >> PAGE_SHIFT;
        for device in binding.devices_snapshot() {
            flush_range_dev(&binding, &device, start, pages);
        }
    }

    fn space_released(&self) {
        // The page tables are about to go away and hardware must stop
        // walking them now. The binding itself is retired later, by the
        // unbind path.
        let Some(binding) = self.binding.upgrade() else {
            return;
        };
        for device in binding.devices_snapshot() {
            device
                .unit()
                .teardown_pasid_entry(device.sid(), binding.pasid(), true, false);
        }
    }
}

/// The largest power-of-two-aligned stride covering `pages` pages, and the
/// aligned span it produces around `[address, address + pages)`.
fn aligned_cover(address: u64, pages: u64) -> (u32, u64, u64) {
    let order = pages.next_power_of_two().trailing_zeros();
    let align = 1u64 << (PAGE_SHIFT + order);
    let start = address & !(align - 1);
    let end = (address + (pages << PAGE_SHIFT) + align - 1) & !(align - 1);
    (order, start, end)
}

/// Flushes `pages` pages at `address` for one device as a series of aligned
/// sub-range invalidations.
fn flush_range_dev(binding: &Binding, device: &DeviceBinding, address: u64, pages: u64) {
    if pages == 0 {
        return;
    }
    let (order, mut start, end) = aligned_cover(address, pages);
    let align = 1u64 << (PAGE_SHIFT + order);
    while start < end {
        let mut batch = vec![InvDescriptor::piotlb_pages(
            device.did(),
            binding.pasid(),
            start,
            order,
            true,
        )];
        if let Some(ats) = device.dev_tlb() {
            batch.push(InvDescriptor::dev_iotlb_pages(
                device.sid(),
                ats.pfsid,
                binding.pasid(),
                ats.queue_depth,
                start,
                order,
            ));
        }
        if let Err(e) = device.unit().backend().submit_invalidations(&batch, false) {
            debug!("range flush failed for {}: {:#}", device.sid(), e);
        }
        start += align;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_single_page() {
        let (order, start, end) = aligned_cover(0x5000, 1);
        assert_eq!(order, 0);
        assert_eq!(start, 0x5000);
        assert_eq!(end, 0x6000);
    }

    #[test]
    fn cover_two_pages_misaligned() {
        // Two pages starting at 0x1000 round out to two 8 KiB strides.
        let (order, start, end) = aligned_cover(0x1000, 2);
        assert_eq!(order, 1);
        assert_eq!(start, 0);
        assert_eq!(end, 0x4000);
    }

    #[test]
    fn cover_three_pages() {
        let (order, start, end) = aligned_cover(0x4000, 3);
        assert_eq!(order, 2);
        assert_eq!(start, 0x4000);
        assert_eq!(end, 0x8000);
    }
}
