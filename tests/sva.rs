// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end exercises of the SVA subsystem against the recording fakes:
//! bind/fault/unbind round trips, drain under load, observer-driven
//! flushes, and the external PASID-free race.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use iommu_sva::address_space::Access;
use iommu_sva::address_space::AddressSpace;
use iommu_sva::address_space::FaultFlags;
use iommu_sva::backend::IommuCaps;
use iommu_sva::backend::IommuUnit;
use iommu_sva::backend::PasidEntry;
use iommu_sva::backend::PrqStatus;
use iommu_sva::descriptor::PageRequest;
use iommu_sva::descriptor::ResponseCode;
use iommu_sva::device::AtsInfo;
use iommu_sva::device::Domain;
use iommu_sva::device::DomainId;
use iommu_sva::device::Endpoint;
use iommu_sva::device::SourceId;
use iommu_sva::fault::PageResponse;
use iommu_sva::pasid::PasidSet;
use iommu_sva::pasid::PASID_MAX;
use iommu_sva::testing::FakeAddressSpace;
use iommu_sva::testing::FakeFaultSink;
use iommu_sva::testing::FakeIommu;
use iommu_sva::BindFlags;
use iommu_sva::GuestBindData;
use iommu_sva::Sva;
use iommu_sva::SvaConfig;
use iommu_sva::SvaError;
use iommu_sva::SvaHandle;
use iommu_sva::PASID_FORMAT_VTD;

struct TestRig {
    sva: Arc<Sva>,
    iommu: Arc<FakeIommu>,
    unit: Arc<IommuUnit>,
    sink: Arc<FakeFaultSink>,
}

fn rig_with_config(config: SvaConfig) -> TestRig {
    let sink = FakeFaultSink::new();
    let sva = Arc::new(Sva::new(config, sink.clone()));
    let iommu = FakeIommu::new();
    let unit = sva.add_unit("dmar0", iommu.clone());
    sva.enable_page_requests(&unit).unwrap();
    TestRig {
        sva,
        iommu,
        unit,
        sink,
    }
}

fn rig() -> TestRig {
    rig_with_config(SvaConfig::default())
}

fn endpoint(rig: &TestRig, devfn: u8) -> Arc<Endpoint> {
    Arc::new(Endpoint::new(
        &format!("00:{:02x}.0", devfn >> 3),
        SourceId::new(0, devfn),
        rig.unit.clone(),
        20,
    ))
}

fn host_bind(rig: &TestRig, ep: &Arc<Endpoint>, space: &Arc<FakeAddressSpace>) -> SvaHandle {
    let space: Arc<dyn AddressSpace> = space.clone();
    rig.sva.bind(ep, Some(space), BindFlags::empty()).unwrap()
}

fn guest_data(hpasid: u32) -> GuestBindData {
    GuestBindData {
        format: PASID_FORMAT_VTD,
        argsz: 64,
        flags: BindFlags::GUEST_PASID_VALID,
        hpasid,
        gpasid: 0x99,
        gpgd: 0xdead_0000,
        addr_width: 48,
        vendor_flags: 0x1,
    }
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn host_bind_fault_unbind() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let space = FakeAddressSpace::new(0x1000_0000);
    space.add_region(0x4000_0000, 0x4001_0000, Access::READ | Access::WRITE);

    let handle = host_bind(&rig, &ep, &space);
    let pasid = handle.pasid();
    assert_eq!(space.published_pasid(), Some(pasid));
    assert_eq!(space.observer_count(), 1);
    match rig.iommu.pasid_entry(ep.sid(), pasid) {
        Some(PasidEntry::FirstLevel { root, .. }) => assert_eq!(root, 0x1000_0000),
        other => panic!("unexpected pasid entry {:?}", other),
    }

    let addr = 0x4000_1000;
    rig.iommu
        .post_and_trigger(PageRequest::new(ep.sid(), pasid, addr, Access::READ, 7, true));
    wait_for("page group response", || {
        !rig.iommu.page_group_responses().is_empty()
    });

    let resp = rig.iommu.page_group_responses()[0];
    assert_eq!(resp.response_code(), ResponseCode::Success);
    assert_eq!(resp.response_pasid(), pasid.val());
    assert!(resp.response_pasid_present());
    assert_eq!(resp.response_group(), 7);
    assert!(resp.response_last());
    assert_eq!(
        space.faults(),
        vec![(addr, FaultFlags::USER | FaultFlags::REMOTE)]
    );
    assert_eq!(rig.unit.requests_handled(), 1);

    rig.sva.unbind(handle).unwrap();
    assert!(rig.sva.pasids().find(None, pasid.val()).is_none());
    assert!(!rig.sva.pasids().is_allocated(pasid.val()));
    assert!(rig.iommu.pasid_entry(ep.sid(), pasid).is_none());
    assert_eq!(space.published_pasid(), None);
    assert_eq!(space.observer_count(), 0);
    assert_eq!(space.ref_count(), 0);
}

#[test]
fn non_canonical_address_is_invalid() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let space = FakeAddressSpace::new(0x1000_0000);
    space.add_region(0, u64::MAX, Access::READ | Access::WRITE);
    let handle = host_bind(&rig, &ep, &space);

    // Bit 47 set without sign extension.
    let addr = 0x0000_8000_0000_0000;
    rig.iommu.post_and_trigger(PageRequest::new(
        ep.sid(),
        handle.pasid(),
        addr,
        Access::READ,
        1,
        true,
    ));
    wait_for("response", || !rig.iommu.page_group_responses().is_empty());
    assert_eq!(
        rig.iommu.page_group_responses()[0].response_code(),
        ResponseCode::Invalid
    );
    // The fault handler never ran.
    assert_eq!(space.fault_count(), 0);
    rig.sva.unbind(handle).unwrap();
}

#[test]
fn write_fault_against_readonly_region() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let space = FakeAddressSpace::new(0x1000_0000);
    space.add_region(0x5000_0000, 0x5000_4000, Access::READ);
    let handle = host_bind(&rig, &ep, &space);

    rig.iommu.post_and_trigger(PageRequest::new(
        ep.sid(),
        handle.pasid(),
        0x5000_1000,
        Access::WRITE,
        2,
        true,
    ));
    wait_for("response", || !rig.iommu.page_group_responses().is_empty());
    assert_eq!(
        rig.iommu.page_group_responses()[0].response_code(),
        ResponseCode::Invalid
    );
    assert_eq!(space.fault_count(), 0);
    rig.sva.unbind(handle).unwrap();
}

#[test]
fn address_below_region_start_is_invalid() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let space = FakeAddressSpace::new(0x1000_0000);
    space.add_region(0x6000_0000, 0x6000_4000, Access::READ);
    let handle = host_bind(&rig, &ep, &space);

    rig.iommu.post_and_trigger(PageRequest::new(
        ep.sid(),
        handle.pasid(),
        0x5fff_0000,
        Access::READ,
        1,
        true,
    ));
    wait_for("response", || !rig.iommu.page_group_responses().is_empty());
    assert_eq!(
        rig.iommu.page_group_responses()[0].response_code(),
        ResponseCode::Invalid
    );
    rig.sva.unbind(handle).unwrap();
}

#[test]
fn stack_region_extends_downward() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let space = FakeAddressSpace::new(0x1000_0000);
    space.add_stack_region(0x7000_8000, 0x7001_0000, Access::READ | Access::WRITE);
    let handle = host_bind(&rig, &ep, &space);

    rig.iommu.post_and_trigger(PageRequest::new(
        ep.sid(),
        handle.pasid(),
        0x7000_6000,
        Access::WRITE,
        1,
        true,
    ));
    wait_for("response", || !rig.iommu.page_group_responses().is_empty());
    assert_eq!(
        rig.iommu.page_group_responses()[0].response_code(),
        ResponseCode::Success
    );
    assert_eq!(space.fault_count(), 1);
    rig.sva.unbind(handle).unwrap();
}

#[test]
fn malformed_requests_are_refused() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let space = FakeAddressSpace::new(0x1000_0000);
    space.add_region(0x4000_0000, 0x4001_0000, Access::READ | Access::WRITE);
    let handle = host_bind(&rig, &ep, &space);
    let pasid = handle.pasid();

    // No PASID, privileged read, and execute+read are all bad requests.
    rig.iommu.post_request(
        PageRequest::new(ep.sid(), pasid, 0x4000_0000, Access::READ, 1, true).without_pasid(),
    );
    rig.iommu.post_request(PageRequest::new(
        ep.sid(),
        pasid,
        0x4000_0000,
        Access::READ | Access::PRIV,
        2,
        true,
    ));
    rig.iommu.post_request(PageRequest::new(
        ep.sid(),
        pasid,
        0x4000_0000,
        Access::READ | Access::EXEC,
        3,
        true,
    ));
    rig.iommu.trigger();
    wait_for("responses", || rig.iommu.page_group_responses().len() == 3);
    for resp in rig.iommu.page_group_responses() {
        assert_eq!(resp.response_code(), ResponseCode::Invalid);
    }
    assert_eq!(space.fault_count(), 0);
    rig.sva.unbind(handle).unwrap();
}

#[test]
fn drain_waits_for_queued_requests() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let space = FakeAddressSpace::new(0x1000_0000);
    space.add_region(0x4000_0000, 0x4010_0000, Access::READ | Access::WRITE);
    let handle = host_bind(&rig, &ep, &space);
    let pasid = handle.pasid();

    // Eight queued requests the service thread has not yet seen.
    for i in 0..8u16 {
        rig.iommu.post_request(PageRequest::new(
            ep.sid(),
            pasid,
            0x4000_0000 + (i as u64) * 0x1000,
            Access::READ,
            i,
            true,
        ));
    }
    rig.iommu.set_status(PrqStatus::RESPONSE_OUTSTANDING);

    let done = Arc::new(AtomicBool::new(false));
    let unbind_done = done.clone();
    let sva = rig.sva.clone();
    let unbinder = thread::spawn(move || {
        sva.unbind(handle).unwrap();
        unbind_done.store(true, Ordering::Release);
    });

    // The drain must block while requests for the PASID sit in the ring.
    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::Acquire));

    rig.iommu.trigger();
    unbinder.join().unwrap();

    // Every queued request was answered before the unbind completed.
    let responses = rig.iommu.page_group_responses();
    assert_eq!(responses.len(), 8);
    for resp in &responses {
        assert_eq!(resp.response_code(), ResponseCode::Success);
    }
    // The hardware drain batch went out and no response is outstanding.
    assert!(rig
        .iommu
        .batches()
        .iter()
        .any(|b| b.drain && b.descriptors.len() == 3));
    assert!(!rig.iommu.status().contains(PrqStatus::RESPONSE_OUTSTANDING));
    assert!(rig.sva.pasids().find(None, pasid.val()).is_none());
}

#[test]
fn responses_follow_ring_order() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let space = FakeAddressSpace::new(0x1000_0000);
    space.add_region(0x4000_0000, 0x4010_0000, Access::READ);
    let handle = host_bind(&rig, &ep, &space);

    for group in [3u16, 1, 2] {
        rig.iommu.post_request(PageRequest::new(
            ep.sid(),
            handle.pasid(),
            0x4000_0000,
            Access::READ,
            group,
            true,
        ));
    }
    rig.iommu.trigger();
    wait_for("responses", || rig.iommu.page_group_responses().len() == 3);
    let groups: Vec<u16> = rig
        .iommu
        .page_group_responses()
        .iter()
        .map(|r| r.response_group())
        .collect();
    assert_eq!(groups, vec![3, 1, 2]);
    rig.sva.unbind(handle).unwrap();
}

#[test]
fn observer_flushes_invalidated_range() {
    let rig = rig();
    let ep = Arc::new(
        Endpoint::new("00:02.0", SourceId::new(0, 0x10), rig.unit.clone(), 20).with_ats(AtsInfo {
            queue_depth: 16,
            pfsid: 0x8,
        }),
    );
    let space = FakeAddressSpace::new(0x1000_0000);
    space.add_region(0, 0x10_0000, Access::READ | Access::WRITE);
    let handle = host_bind(&rig, &ep, &space);
    let pasid = handle.pasid();

    space.invalidate_range(0x1000, 0x3000);

    // Two pages starting at 0x1000 cover as two 8 KiB aligned flushes.
    let piotlb = rig.iommu.piotlb_flushes();
    assert_eq!(piotlb.len(), 2);
    for flush in &piotlb {
        assert_eq!(flush.piotlb_pasid(), pasid.val());
        assert_eq!(flush.piotlb_order(), 1);
    }
    assert_eq!(piotlb[0].piotlb_address(), 0x0000);
    assert_eq!(piotlb[1].piotlb_address(), 0x2000);
    // The device TLB is flushed alongside each sub-range.
    assert_eq!(rig.iommu.dev_iotlb_flushes().len(), 2);

    rig.sva.unbind(handle).unwrap();
}

#[test]
fn space_exit_fences_hardware() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let space = FakeAddressSpace::new(0x1000_0000);
    space.add_region(0x4000_0000, 0x4001_0000, Access::READ);
    let handle = host_bind(&rig, &ep, &space);
    let pasid = handle.pasid();

    space.exit();
    // The observer cleared the entry so hardware cannot walk freed tables.
    assert!(rig.iommu.pasid_entry(ep.sid(), pasid).is_none());

    // A straggling fault resolves to INVALID against the dying space.
    rig.iommu.post_and_trigger(PageRequest::new(
        ep.sid(),
        pasid,
        0x4000_0000,
        Access::READ,
        1,
        true,
    ));
    wait_for("response", || !rig.iommu.page_group_responses().is_empty());
    assert_eq!(
        rig.iommu.page_group_responses()[0].response_code(),
        ResponseCode::Invalid
    );
    assert_eq!(space.fault_count(), 0);

    rig.sva.unbind(handle).unwrap();
    assert!(rig.sva.pasids().find(None, pasid.val()).is_none());
}

#[test]
fn external_pasid_free_cleans_up() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let domain = Arc::new(Domain::new(DomainId::new(2)));
    let gpasid = rig.sva.pasids().alloc(PasidSet::Guest, 10, 100).unwrap();

    rig.sva
        .bind_guest(&domain, &ep, &guest_data(gpasid.val()), None)
        .unwrap();
    assert!(rig.iommu.pasid_entry(ep.sid(), gpasid).is_some());

    rig.sva.pasids().free(gpasid);
    wait_for("async cleanup", || {
        !rig.sva.pasids().is_allocated(gpasid.val())
    });
    assert!(rig.sva.pasids().find(None, gpasid.val()).is_none());
    assert!(rig.iommu.pasid_entry(ep.sid(), gpasid).is_none());
    // The cleanup path drained the queue for the dying PASID.
    assert!(rig.iommu.batches().iter().any(|b| b.drain));

    // A stale request for the freed PASID is answered INVALID.
    rig.iommu.post_and_trigger(PageRequest::new(
        ep.sid(),
        gpasid,
        0x1000,
        Access::READ,
        1,
        true,
    ));
    wait_for("response", || !rig.iommu.page_group_responses().is_empty());
    assert_eq!(
        rig.iommu.page_group_responses()[0].response_code(),
        ResponseCode::Invalid
    );

    // Unbind after free is a silent no-op.
    rig.sva
        .unbind_guest(&domain, &ep, gpasid.val(), BindFlags::empty())
        .unwrap();
}

#[test]
fn guest_fault_hand_off_and_response() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let domain = Arc::new(Domain::new(DomainId::new(3)));
    let gpasid = rig.sva.pasids().alloc(PasidSet::Guest, 10, 100).unwrap();
    rig.sva
        .bind_guest(&domain, &ep, &guest_data(gpasid.val()), None)
        .unwrap();

    let priv_data = [0xdead, 0xbeef];
    rig.iommu.post_and_trigger(
        PageRequest::new(ep.sid(), gpasid, 0x8000, Access::WRITE, 5, false)
            .with_private_data(priv_data),
    );
    wait_for("fault report", || rig.sink.event_count() == 1);
    let event = rig.sink.events().remove(0);
    assert_eq!(event.pasid, gpasid.val());
    assert_eq!(event.address, 0x8000);
    assert!(event.last_page);
    assert_eq!(event.private_data, Some(priv_data));
    // The core did not respond; the external handler owns the response.
    assert!(rig.iommu.page_group_responses().is_empty());

    rig.sva
        .page_response(
            &domain,
            &ep,
            &event,
            &PageResponse {
                code: ResponseCode::Success,
            },
        )
        .unwrap();
    let responses = rig.iommu.page_group_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].response_code(), ResponseCode::Success);
    assert_eq!(responses[0].response_pasid(), gpasid.val());
    assert_eq!(responses[0].echoed_private_data(), Some(priv_data));

    rig.sva
        .unbind_guest(&domain, &ep, gpasid.val(), BindFlags::empty())
        .unwrap();
    assert!(rig.sva.pasids().find(None, gpasid.val()).is_none());
    // The external owner still holds its allocation.
    assert!(rig.sva.pasids().is_allocated(gpasid.val()));
}

#[test]
fn guest_fault_with_refusing_sink_is_invalid() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let domain = Arc::new(Domain::new(DomainId::new(3)));
    let gpasid = rig.sva.pasids().alloc(PasidSet::Guest, 10, 100).unwrap();
    rig.sva
        .bind_guest(&domain, &ep, &guest_data(gpasid.val()), None)
        .unwrap();

    rig.sink.fail_reports(true);
    rig.iommu.post_and_trigger(PageRequest::new(
        ep.sid(),
        gpasid,
        0x8000,
        Access::READ,
        1,
        true,
    ));
    wait_for("response", || !rig.iommu.page_group_responses().is_empty());
    assert_eq!(
        rig.iommu.page_group_responses()[0].response_code(),
        ResponseCode::Invalid
    );

    rig.sva
        .unbind_guest(&domain, &ep, gpasid.val(), BindFlags::empty())
        .unwrap();
}

#[test]
fn guest_descriptor_validation() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let domain = Arc::new(Domain::new(DomainId::new(4)));
    let gpasid = rig.sva.pasids().alloc(PasidSet::Guest, 10, 100).unwrap();

    let mut bad = guest_data(gpasid.val());
    bad.format = 7;
    assert!(matches!(
        rig.sva.bind_guest(&domain, &ep, &bad, None),
        Err(SvaError::InvalidDescriptor(_))
    ));

    let mut bad = guest_data(gpasid.val());
    bad.argsz = 8;
    assert!(matches!(
        rig.sva.bind_guest(&domain, &ep, &bad, None),
        Err(SvaError::InvalidDescriptor(_))
    ));

    let mut bad = guest_data(gpasid.val());
    bad.vendor_flags = 1 << 40;
    assert!(matches!(
        rig.sva.bind_guest(&domain, &ep, &bad, None),
        Err(SvaError::InvalidDescriptor(_))
    ));

    // Devices without the full PASID width cannot be nested.
    let narrow = Arc::new(Endpoint::new(
        "00:03.0",
        SourceId::new(0, 0x18),
        rig.unit.clone(),
        16,
    ));
    assert!(matches!(
        rig.sva
            .bind_guest(&domain, &narrow, &guest_data(gpasid.val()), None),
        Err(SvaError::InvalidArguments(_))
    ));

    // HPASID_DEFAULT without a domain-assigned PASID is refused.
    let mut default = guest_data(0);
    default.flags = BindFlags::HPASID_DEFAULT;
    assert!(matches!(
        rig.sva.bind_guest(&domain, &ep, &default, None),
        Err(SvaError::DefaultPasidUnassigned)
    ));

    // Nothing was programmed along the way.
    assert!(rig.iommu.pasid_entry(ep.sid(), gpasid).is_none());
}

#[test]
fn guest_bind_with_domain_default_pasid() {
    let rig = rig();
    // Narrow PASID width is fine for whole-domain (gIOVA) usage.
    let ep = Arc::new(Endpoint::new(
        "00:04.0",
        SourceId::new(0, 0x20),
        rig.unit.clone(),
        16,
    ));
    let domain = Arc::new(Domain::new(DomainId::new(5)));
    let hpasid = rig.sva.pasids().alloc(PasidSet::Host, 1, PASID_MAX).unwrap();
    domain.set_default_pasid(Some(hpasid));

    let mut data = guest_data(0);
    data.flags = BindFlags::HPASID_DEFAULT;
    rig.sva.bind_guest(&domain, &ep, &data, None).unwrap();
    match rig.iommu.pasid_entry(ep.sid(), hpasid) {
        Some(PasidEntry::Nested { did, .. }) => assert_eq!(did, DomainId::new(5)),
        other => panic!("unexpected pasid entry {:?}", other),
    }

    rig.sva
        .unbind_guest(&domain, &ep, 0, BindFlags::HPASID_DEFAULT)
        .unwrap();
    assert!(rig.sva.pasids().find(None, hpasid.val()).is_none());
    // The domain owner keeps its allocation.
    assert!(rig.sva.pasids().is_allocated(hpasid.val()));
}

#[test]
fn duplicate_bind_is_refused() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let space = FakeAddressSpace::new(0x1000_0000);
    let handle = host_bind(&rig, &ep, &space);

    let space_dyn: Arc<dyn AddressSpace> = space.clone();
    assert!(matches!(
        rig.sva.bind(&ep, Some(space_dyn), BindFlags::empty()),
        Err(SvaError::AlreadyBound(..))
    ));

    rig.sva.unbind(handle).unwrap();
}

#[test]
fn second_device_shares_the_binding() {
    let rig = rig();
    let ep1 = endpoint(&rig, 0x10);
    let ep2 = endpoint(&rig, 0x18);
    let space = FakeAddressSpace::new(0x1000_0000);

    let h1 = host_bind(&rig, &ep1, &space);
    let h2 = host_bind(&rig, &ep2, &space);
    assert_eq!(h1.pasid(), h2.pasid());
    let pasid = h1.pasid();
    assert!(rig.iommu.pasid_entry(ep1.sid(), pasid).is_some());
    assert!(rig.iommu.pasid_entry(ep2.sid(), pasid).is_some());

    rig.sva.unbind(h1).unwrap();
    // The binding survives while the second device is attached.
    assert!(rig.sva.pasids().find(None, pasid.val()).is_some());
    assert!(rig.iommu.pasid_entry(ep1.sid(), pasid).is_none());
    assert!(rig.iommu.pasid_entry(ep2.sid(), pasid).is_some());
    assert_eq!(space.published_pasid(), Some(pasid));

    rig.sva.unbind(h2).unwrap();
    assert!(rig.sva.pasids().find(None, pasid.val()).is_none());
    assert_eq!(space.published_pasid(), None);
}

#[test]
fn disjoint_binds_compose() {
    let rig = rig();
    let ep1 = endpoint(&rig, 0x10);
    let ep2 = endpoint(&rig, 0x18);
    let space1 = FakeAddressSpace::new(0x1000_0000);
    let space2 = FakeAddressSpace::new(0x2000_0000);

    let h1 = host_bind(&rig, &ep1, &space1);
    let h2 = host_bind(&rig, &ep2, &space2);
    assert_ne!(h1.pasid(), h2.pasid());

    // Unbind in the opposite order from binding.
    let (p1, p2) = (h1.pasid(), h2.pasid());
    rig.sva.unbind(h1).unwrap();
    assert!(rig.sva.pasids().find(None, p2.val()).is_some());
    rig.sva.unbind(h2).unwrap();
    assert!(rig.sva.pasids().find(None, p1.val()).is_none());
    assert!(rig.sva.pasids().find(None, p2.val()).is_none());
    assert!(!rig.sva.pasids().is_allocated(p1.val()));
    assert!(!rig.sva.pasids().is_allocated(p2.val()));
}

#[test]
fn bind_unbind_round_trip_restores_state() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let space = FakeAddressSpace::new(0x1000_0000);

    let h1 = host_bind(&rig, &ep, &space);
    let p1 = h1.pasid();
    rig.sva.unbind(h1).unwrap();
    assert!(!rig.sva.pasids().is_allocated(p1.val()));

    // A fresh round trip starts from the same clean slate.
    let h2 = host_bind(&rig, &ep, &space);
    assert_eq!(h2.pasid(), p1);
    rig.sva.unbind(h2).unwrap();
    assert!(!rig.sva.pasids().is_allocated(p1.val()));
}

#[test]
fn request_after_unbind_is_invalid() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let space = FakeAddressSpace::new(0x1000_0000);
    space.add_region(0x4000_0000, 0x4001_0000, Access::READ);
    let handle = host_bind(&rig, &ep, &space);
    let pasid = handle.pasid();
    rig.sva.unbind(handle).unwrap();

    // Hardware should not post for a cleared PASID entry; if it does, the
    // lookup fails and the device is told so.
    rig.iommu.post_and_trigger(PageRequest::new(
        ep.sid(),
        pasid,
        0x4000_0000,
        Access::READ,
        1,
        true,
    ));
    wait_for("response", || !rig.iommu.page_group_responses().is_empty());
    assert_eq!(
        rig.iommu.page_group_responses()[0].response_code(),
        ResponseCode::Invalid
    );
    assert_eq!(space.fault_count(), 0);
}

#[test]
fn supervisor_bind_uses_kernel_tables() {
    let config = SvaConfig {
        kernel_root_table: 0x9_9990_0000,
        ..Default::default()
    };
    let rig = rig_with_config(config);
    let ep = endpoint(&rig, 0x10);

    // A supervisor bind paired with an address space is malformed.
    let space = FakeAddressSpace::new(0x1000_0000);
    let space_dyn: Arc<dyn AddressSpace> = space.clone();
    assert!(matches!(
        rig.sva.bind(&ep, Some(space_dyn), BindFlags::SUPERVISOR_MODE),
        Err(SvaError::InvalidArguments(_))
    ));

    let handle = rig.sva.bind(&ep, None, BindFlags::SUPERVISOR_MODE).unwrap();
    let pasid = handle.pasid();
    match rig.iommu.pasid_entry(ep.sid(), pasid) {
        Some(PasidEntry::FirstLevel {
            root, supervisor, ..
        }) => {
            assert_eq!(root, 0x9_9990_0000);
            assert!(supervisor);
        }
        other => panic!("unexpected pasid entry {:?}", other),
    }

    // Devices must not issue user-space fault requests on a supervisor
    // binding.
    rig.iommu.post_and_trigger(PageRequest::new(
        ep.sid(),
        pasid,
        0x4000_0000,
        Access::READ,
        1,
        true,
    ));
    wait_for("response", || !rig.iommu.page_group_responses().is_empty());
    assert_eq!(
        rig.iommu.page_group_responses()[0].response_code(),
        ResponseCode::Invalid
    );

    rig.sva.unbind(handle).unwrap();
    assert!(!rig.sva.pasids().is_allocated(pasid.val()));
}

#[test]
fn bind_requires_capabilities() {
    let sink = FakeFaultSink::new();
    let sva = Arc::new(Sva::new(SvaConfig::default(), sink));
    let iommu = FakeIommu::with_caps(IommuCaps::FL5LP | IommuCaps::FL1GP);
    let unit = sva.add_unit("dmar1", iommu.clone());
    let ep = Arc::new(Endpoint::new(
        "00:05.0",
        SourceId::new(0, 0x28),
        unit,
        20,
    ));
    let space = FakeAddressSpace::new(0x1000_0000);
    let space_dyn: Arc<dyn AddressSpace> = space.clone();
    assert!(matches!(
        sva.bind(&ep, Some(space_dyn), BindFlags::empty()),
        Err(SvaError::NotCapable)
    ));
}

#[test]
fn bind_requires_device_pasid_support() {
    let rig = rig();
    let ep = Arc::new(Endpoint::new(
        "00:06.0",
        SourceId::new(0, 0x30),
        rig.unit.clone(),
        0,
    ));
    let space = FakeAddressSpace::new(0x1000_0000);
    let space_dyn: Arc<dyn AddressSpace> = space.clone();
    assert!(matches!(
        rig.sva.bind(&ep, Some(space_dyn), BindFlags::empty()),
        Err(SvaError::PasidUnsupported(_))
    ));
}

#[test]
fn failed_entry_programming_unwinds() {
    let rig = rig();
    let ep = endpoint(&rig, 0x10);
    let space = FakeAddressSpace::new(0x1000_0000);
    rig.iommu.fail_pasid_programming(true);

    let space_dyn: Arc<dyn AddressSpace> = space.clone();
    assert!(matches!(
        rig.sva.bind(&ep, Some(space_dyn), BindFlags::empty()),
        Err(SvaError::PasidEntry(_))
    ));
    // Everything published on the way in was unwound.
    assert_eq!(space.observer_count(), 0);
    assert_eq!(space.published_pasid(), None);

    // The subsystem is intact: the same bind succeeds once programming
    // works again.
    rig.iommu.fail_pasid_programming(false);
    let handle = host_bind(&rig, &ep, &space);
    rig.sva.unbind(handle).unwrap();
}

#[test]
fn aux_domain_fault_data_lifecycle() {
    let rig = rig();
    let ep = Arc::new(
        Endpoint::new("00:07.0", SourceId::new(0, 0x38), rig.unit.clone(), 20)
            .with_aux_domains(),
    );
    let domain = Arc::new(Domain::new(DomainId::new(6)).with_fault_data_required());
    let gpasid = rig.sva.pasids().alloc(PasidSet::Guest, 10, 100).unwrap();

    let cookie: Arc<dyn std::any::Any + Send + Sync> = Arc::new(0xab_u32);
    rig.sva
        .bind_guest(&domain, &ep, &guest_data(gpasid.val()), Some(cookie))
        .unwrap();
    assert!(rig.sink.has_fault_data(ep.sid(), gpasid));

    rig.sva
        .unbind_guest(&domain, &ep, gpasid.val(), BindFlags::empty())
        .unwrap();
    assert!(!rig.sink.has_fault_data(ep.sid(), gpasid));
}
