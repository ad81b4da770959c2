//! Multi-Processor MM Entry Tests
//!
//! Every logical processor is a host thread calling `DispatchContext::mm_entry`.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

use crate::patina_mm_core_integration::common::*;

use patina_mm_core::comm_buffer::CommunicateHeader;
use patina_mm_core::config::{MonarchPolicy, Quorum, RendezvousPolicy, SyncMode, TimeoutAction};
use patina_mm_core::registry::HandlerStatus;
use patina_mm_core::rendezvous::{CpuStatus, Role};
use patina_mm_core::{MmEntryRequest, MmError};
use r_efi::efi;

fn assert_all_checked_out(framework: &MmCoreTestFramework) {
    let rendezvous = framework.context().rendezvous();
    assert!(rendezvous.cpus().iter().all(|cpu| cpu.status() == CpuStatus::Absent));
    assert_eq!(rendezvous.monarch(), None);
}

#[test]
fn test_two_cpus_monarch_dispatches_and_releases_both() {
    init_logger();
    let root = CountingHandler::new(Ok(HandlerStatus::SourceQuiesced));
    let framework = MmCoreTestFramework::builder()
        .with_cpus(2)
        .with_handler(Some(test_guids::DOUBLER_HANDLER), DoublerHandler)
        .with_handler(None, root.clone())
        .build()
        .expect("framework should build");

    let size = framework.write_message(&test_guids::DOUBLER_HANDLER, &[1, 2, 3, 4]);
    let responses = framework.enter_all(0, Some(MmEntryRequest::new(framework.buffer_address(), Some(size))));

    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].role, Some(Role::Monarch));
    assert_eq!(responses[0].status, efi::Status::SUCCESS);
    assert_eq!(responses[0].comm_buffer_size, Some(size));
    assert_eq!(responses[1].role, Some(Role::Subordinate));
    assert_eq!(responses[1].status, efi::Status::SUCCESS);

    let outcome = framework.read_outcome(responses[0].status, size);
    assert_eq!(outcome.payload, vec![2, 4, 6, 8]);
    assert_eq!(root.calls(), 1);
    assert_all_checked_out(&framework);
}

#[test]
fn test_repeated_entries_with_first_arrival_monarch() {
    init_logger();
    const CPUS: usize = 4;
    const ENTRIES: usize = 25;

    let counter = CountingHandler::new(Ok(HandlerStatus::Success));
    let framework = MmCoreTestFramework::builder()
        .with_cpus(CPUS)
        .with_rendezvous(RendezvousPolicy {
            monarch: MonarchPolicy::FirstArrival,
            quorum: Quorum::All,
            sync_mode: SyncMode::Blocking,
            timeout: GENEROUS_TIMEOUT,
            on_timeout: TimeoutAction::Fail,
        })
        .with_handler(Some(test_guids::SHARED), counter.clone())
        .build()
        .expect("framework should build");

    for entry in 0..ENTRIES {
        let poster = entry % CPUS;
        let size = framework.write_message(&test_guids::SHARED, &[entry as u8; 8]);
        let responses = framework.enter_all(poster, Some(MmEntryRequest::new(framework.buffer_address(), None)));

        let monarchs = responses.iter().filter(|r| r.role == Some(Role::Monarch)).count();
        let subordinates = responses.iter().filter(|r| r.role == Some(Role::Subordinate)).count();
        assert_eq!((monarchs, subordinates), (1, CPUS - 1), "entry {entry}");

        assert_eq!(responses[poster].status, efi::Status::SUCCESS, "entry {entry}");
        assert_eq!(responses[poster].comm_buffer_size, Some(size), "entry {entry}");
        assert_all_checked_out(&framework);
    }

    assert_eq!(counter.calls(), ENTRIES);
}

#[test]
fn test_missing_processor_times_out_and_recovers() {
    init_logger();
    let counter = CountingHandler::new(Ok(HandlerStatus::Success));
    let framework = MmCoreTestFramework::builder()
        .with_cpus(2)
        .with_rendezvous(RendezvousPolicy {
            monarch: MonarchPolicy::Fixed(0),
            quorum: Quorum::All,
            sync_mode: SyncMode::Blocking,
            timeout: SHORT_TIMEOUT,
            on_timeout: TimeoutAction::Fail,
        })
        .with_handler(Some(test_guids::SHARED), counter.clone())
        .build()
        .expect("framework should build");

    let size = framework.write_message(&test_guids::SHARED, &[0; 4]);
    let request = Some(MmEntryRequest::new(framework.buffer_address(), Some(size)));

    let response = framework.context().mm_entry(0, request);
    assert_eq!(response.status, efi::Status::TIMEOUT);
    assert_eq!(counter.calls(), 0);
    assert_all_checked_out(&framework);

    let responses = framework.enter_all(0, request);
    assert_eq!(responses[0].status, efi::Status::SUCCESS);
    assert_eq!(counter.calls(), 1);
}

#[test]
fn test_partial_quorum_dispatches_with_arrived_processors() {
    init_logger();
    let counter = CountingHandler::new(Ok(HandlerStatus::Success));
    let framework = MmCoreTestFramework::builder()
        .with_cpus(3)
        .with_rendezvous(RendezvousPolicy {
            monarch: MonarchPolicy::FirstArrival,
            quorum: Quorum::AtLeast(1),
            sync_mode: SyncMode::NonBlocking,
            timeout: SHORT_TIMEOUT,
            on_timeout: TimeoutAction::Fail,
        })
        .with_handler(Some(test_guids::SHARED), counter.clone())
        .build()
        .expect("framework should build");

    let size = framework.write_message(&test_guids::SHARED, &[0; 4]);
    let response = framework.context().mm_entry(2, Some(MmEntryRequest::new(framework.buffer_address(), Some(size))));

    assert_eq!(response.role, Some(Role::Monarch));
    assert_eq!(response.status, efi::Status::SUCCESS);
    assert_eq!(counter.calls(), 1);
    assert_all_checked_out(&framework);
}

#[test]
fn test_partial_quorum_poster_arriving_after_dispatch_gets_its_own_result() {
    init_logger();
    let counter = CountingHandler::new(Ok(HandlerStatus::Success));
    let framework = MmCoreTestFramework::builder()
        .with_cpus(2)
        .with_rendezvous(RendezvousPolicy {
            monarch: MonarchPolicy::FirstArrival,
            quorum: Quorum::AtLeast(1),
            sync_mode: SyncMode::NonBlocking,
            timeout: GENEROUS_TIMEOUT,
            on_timeout: TimeoutAction::Fail,
        })
        .with_handler(Some(test_guids::SHARED), counter.clone())
        .build()
        .expect("framework should build");

    let first = framework.context().mm_entry(0, None);
    assert_eq!(first.role, Some(Role::Monarch));
    assert_eq!(counter.calls(), 0);

    let size = framework.write_message(&test_guids::SHARED, &[9; 6]);
    let request = Some(MmEntryRequest::new(framework.buffer_address(), None));
    let poster = framework.context().mm_entry(1, request);
    assert_eq!(poster.role, Some(Role::Monarch));
    assert_eq!(poster.status, efi::Status::SUCCESS);
    assert_eq!(poster.comm_buffer_size, Some(size));
    assert_eq!(counter.calls(), 1);

    // Nothing is left behind for the next poster.
    let again = framework.context().mm_entry(0, request);
    assert_eq!(again.status, efi::Status::SUCCESS);
    assert_eq!(again.comm_buffer_size, Some(size));
    assert_eq!(counter.calls(), 2);
    assert_all_checked_out(&framework);
}

#[test]
fn test_registration_closes_on_first_entry() {
    init_logger();
    let framework = MmCoreTestFramework::builder().build().expect("framework should build");
    let registry = framework.context().registry();

    registry.register(Some(test_guids::SHARED), DoublerHandler).expect("registration is open before the first MMI");
    let response = framework.context().mm_entry(0, None);
    assert_eq!(response.role, Some(Role::Monarch));
    assert_eq!(response.status, efi::Status::SUCCESS);

    assert_eq!(registry.register(Some(test_guids::SHARED), DoublerHandler), Err(MmError::AccessDenied));
    let size = framework.write_message(&test_guids::SHARED, &[1]);
    let response = framework.context().mm_entry(0, Some(MmEntryRequest::new(framework.buffer_address(), Some(size))));
    assert_eq!(response.comm_buffer_size, Some(CommunicateHeader::SIZE + 1));
}
