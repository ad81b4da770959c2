//! End-to-End Dispatch Tests
//!
//! Communication buffers written by a simulated caller, dispatched through `DispatchContext`, and read back.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

use crate::patina_mm_core_integration::common::*;

use std::sync::{Arc, Mutex};

use patina_mm_core::comm_buffer::CommunicateHeader;
use patina_mm_core::config::MultiHandlerDispatch;
use patina_mm_core::registry::{DispatchHandle, HandlerContext, HandlerStatus};
use patina_mm_core::{MmError, ValidationError};
use r_efi::efi;

#[test]
fn test_doubler_handler_doubles_payload() {
    init_logger();
    let framework = MmCoreTestFramework::builder()
        .with_buffer_size(64)
        .with_handler(Some(test_guids::DOUBLER_HANDLER), DoublerHandler)
        .build()
        .expect("framework should build");

    let payload: Vec<u8> = (1..=16).collect();
    let outcome = framework.communicate(&test_guids::DOUBLER_HANDLER, &payload);

    assert_eq!(outcome.status, efi::Status::SUCCESS);
    assert_eq!(outcome.guid, test_guids::DOUBLER_HANDLER);
    assert_eq!(outcome.payload.len(), 16);
    assert_eq!(outcome.size, CommunicateHeader::SIZE + 16);
    let expected: Vec<u8> = payload.iter().map(|b| b * 2).collect();
    assert_eq!(outcome.payload, expected);
}

#[test]
fn test_unregistered_guid_is_not_handled_and_buffer_unmodified() {
    init_logger();
    let framework = MmCoreTestFramework::builder()
        .with_handler(Some(test_guids::DOUBLER_HANDLER), DoublerHandler)
        .build()
        .expect("framework should build");

    let mut size = framework.write_message(&test_guids::UNHANDLED, &[]);
    let before = framework.snapshot();

    let status = framework.context().dispatch(1, 0, framework.buffer_address(), Some(&mut size));

    assert_eq!(status, efi::Status::NOT_FOUND);
    assert_eq!(size, CommunicateHeader::SIZE);
    assert_eq!(framework.snapshot(), before);
}

#[test]
fn test_inconsistent_length_rejected_before_any_handler() {
    init_logger();
    let counter = CountingHandler::new(Ok(HandlerStatus::Success));
    let framework = MmCoreTestFramework::builder()
        .with_buffer_size(64)
        .with_handler(Some(test_guids::DOUBLER_HANDLER), counter.clone())
        .build()
        .expect("framework should build");

    framework.with_buffer(|b| {
        MmMessageWriter::new(b).write_header(&test_guids::DOUBLER_HANDLER, 65).expect("header should fit");
    });
    let mut size = framework.buffer_size();
    let report = framework.context().dispatch_with_report(1, 0, framework.buffer_address(), Some(&mut size));

    assert_eq!(report.error(), Some(MmError::Validation(ValidationError::HeaderSizeMismatch)));
    assert_eq!(report.status(), efi::Status::BAD_BUFFER_SIZE);
    assert_eq!(counter.calls(), 0);
    assert_eq!(size, 64);
}

#[test]
fn test_inconsistent_length_rejected_when_buffer_fills_mailbox() {
    init_logger();
    let counter = CountingHandler::new(Ok(HandlerStatus::Success));
    let framework = MmCoreTestFramework::builder()
        .with_buffer_size(64)
        .with_config(|config| config.mailbox_capacity = 64)
        .with_handler(Some(test_guids::DOUBLER_HANDLER), counter.clone())
        .build()
        .expect("framework should build");

    framework.with_buffer(|b| {
        MmMessageWriter::new(b)
            .write_header(&test_guids::DOUBLER_HANDLER, (64 - CommunicateHeader::SIZE + 1) as u64)
            .expect("header should fit");
    });
    let mut size = 64;
    let report = framework.context().dispatch_with_report(1, 0, framework.buffer_address(), Some(&mut size));

    assert_eq!(report.error(), Some(MmError::Validation(ValidationError::HeaderSizeMismatch)));
    assert_eq!(counter.calls(), 0);
}

#[test]
fn test_buffer_reaching_into_mmram_is_rejected() {
    init_logger();
    let counter = CountingHandler::new(Ok(HandlerStatus::Success));
    let framework = MmCoreTestFramework::builder()
        .with_handler(Some(test_guids::DOUBLER_HANDLER), counter.clone())
        .build()
        .expect("framework should build");

    let address = framework.mmram_base() - CommunicateHeader::SIZE as u64;
    let mut size = CommunicateHeader::SIZE + 8;
    let report = framework.context().dispatch_with_report(1, 0, address, Some(&mut size));

    assert_eq!(report.error(), Some(MmError::Validation(ValidationError::IntersectsExcludedRegion)));
    assert_eq!(report.status(), efi::Status::SECURITY_VIOLATION);
    assert_eq!(counter.calls(), 0);
}

#[test]
fn test_wrapping_address_is_rejected() {
    init_logger();
    let framework = MmCoreTestFramework::builder().build().expect("framework should build");

    let mut size = 0x40;
    let report = framework.context().dispatch_with_report(1, 0, u64::MAX - 0x10, Some(&mut size));
    assert_eq!(report.error(), Some(MmError::Validation(ValidationError::AddressOverflow)));

    let mut size = 0;
    let report = framework.context().dispatch_with_report(1, 0, framework.buffer_address(), Some(&mut size));
    assert_eq!(report.error(), Some(MmError::Validation(ValidationError::NullOrZeroBuffer)));
}

#[test]
fn test_truncated_response_updates_size() {
    init_logger();
    let framework = MmCoreTestFramework::builder()
        .with_handler(Some(test_guids::TRUNCATE_HANDLER), TruncatingHandler { keep: 3 })
        .build()
        .expect("framework should build");

    let outcome = framework.communicate(&test_guids::TRUNCATE_HANDLER, b"truncate me");

    assert_eq!(outcome.status, efi::Status::SUCCESS);
    assert_eq!(outcome.size, CommunicateHeader::SIZE + 3);
    assert_eq!(outcome.payload, b"tru");
}

#[test]
fn test_handler_reads_processor_id_from_save_state() {
    init_logger();
    let framework = MmCoreTestFramework::builder()
        .with_handler(Some(test_guids::PROCESSOR_ID_HANDLER), ProcessorIdHandler)
        .build()
        .expect("framework should build");

    let outcome = framework.communicate(&test_guids::PROCESSOR_ID_HANDLER, &[0; 8]);

    assert_eq!(outcome.status, efi::Status::SUCCESS);
    assert_eq!(outcome.payload, test_processor_id(0).to_le_bytes());
}

#[test]
fn test_default_handler_runs_before_registration_order() {
    init_logger();
    let order = Arc::new(Mutex::new(Vec::new()));
    let recorder = |tag: &'static str, status: HandlerStatus| {
        let order = order.clone();
        move |_: DispatchHandle, _: &mut HandlerContext<'_>| -> patina_mm_core::Result<HandlerStatus> {
            order.lock().unwrap().push(tag);
            Ok(status)
        }
    };

    let framework = MmCoreTestFramework::builder()
        .with_handler(Some(test_guids::SHARED), recorder("first", HandlerStatus::SourcePending))
        .with_handler(Some(test_guids::SHARED), recorder("second", HandlerStatus::Success))
        .with_handler(Some(test_guids::SHARED), recorder("third", HandlerStatus::Success))
        .with_default_handler(test_guids::SHARED, recorder("default", HandlerStatus::SourcePending))
        .build()
        .expect("framework should build");

    let outcome = framework.communicate(&test_guids::SHARED, &[0; 4]);

    assert_eq!(outcome.status, efi::Status::SUCCESS);
    assert_eq!(*order.lock().unwrap(), vec!["default", "first", "second"]);
}

#[test]
fn test_broadcast_runs_every_handler() {
    init_logger();
    let first = CountingHandler::new(Ok(HandlerStatus::Success));
    let second = CountingHandler::new(Ok(HandlerStatus::Success));
    let framework = MmCoreTestFramework::builder()
        .with_config(|config| config.handlers.dispatch = MultiHandlerDispatch::Broadcast)
        .with_handler(Some(test_guids::SHARED), first.clone())
        .with_handler(Some(test_guids::SHARED), second.clone())
        .build()
        .expect("framework should build");

    assert_eq!(framework.communicate(&test_guids::SHARED, &[0; 4]).status, efi::Status::SUCCESS);
    assert_eq!((first.calls(), second.calls()), (1, 1));
}

#[test]
fn test_failing_handler_leaves_buffer_unmodified() {
    init_logger();
    let framework = MmCoreTestFramework::builder()
        .with_handler(Some(test_guids::SHARED), CountingHandler::new(Err(MmError::DeviceError)))
        .with_handler(Some(test_guids::SHARED), DoublerHandler)
        .build()
        .expect("framework should build");

    let mut size = framework.write_message(&test_guids::SHARED, &[1, 2, 3, 4]);
    let before = framework.snapshot();
    let status = framework.context().dispatch(1, 0, framework.buffer_address(), Some(&mut size));

    assert_eq!(status, efi::Status::DEVICE_ERROR);
    assert_eq!(framework.snapshot(), before);
}

#[test]
fn test_handler_unregistering_itself() {
    init_logger();
    let one_shot = OneShotHandler::new();
    let framework = MmCoreTestFramework::builder()
        .with_handler(Some(test_guids::SHARED), one_shot.clone())
        .build()
        .expect("framework should build");

    assert_eq!(framework.communicate(&test_guids::SHARED, &[0; 4]).status, efi::Status::SUCCESS);
    assert_eq!(framework.communicate(&test_guids::SHARED, &[0; 4]).status, efi::Status::NOT_FOUND);
    assert_eq!(one_shot.calls(), 1);
    assert!(framework.context().registry().is_empty());
}

#[test]
fn test_root_handler_runs_on_every_dispatch() {
    init_logger();
    let root = CountingHandler::new(Ok(HandlerStatus::SourceQuiesced));
    let framework = MmCoreTestFramework::builder()
        .with_handler(None, root.clone())
        .with_handler(Some(test_guids::DOUBLER_HANDLER), DoublerHandler)
        .build()
        .expect("framework should build");

    assert_eq!(framework.communicate(&test_guids::DOUBLER_HANDLER, &[1]).status, efi::Status::SUCCESS);
    assert_eq!(framework.communicate(&test_guids::UNHANDLED, &[1]).status, efi::Status::NOT_FOUND);
    assert_eq!(framework.context().dispatch(2, 0, 0, None), efi::Status::SUCCESS);
    assert_eq!(root.calls(), 3);
}
