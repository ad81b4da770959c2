//! Management Mode Interrupt (MMI) Handlers
//!
//! This module provides standardized MMI handler implementations for testing.
//!
//! ## Logging
//!
//! - The `doubler_handler` log target is used for logging within the doubler handler.
//! - The `counting_handler` log target is used for logging within the counting handler.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use patina_mm_core::error::{MmError, Result};
use patina_mm_core::registry::{DispatchHandle, HandlerContext, HandlerStatus, MmiHandler};
use patina_mm_core::save_state::SaveStateRegister;

/// Doubles every payload byte in place and keeps the length
pub struct DoublerHandler;

impl MmiHandler for DoublerHandler {
    fn handle(&self, _handle: DispatchHandle, context: &mut HandlerContext<'_>) -> Result<HandlerStatus> {
        let message = context.message_mut().ok_or(MmError::InvalidParameter)?;
        log::debug!(target: "doubler_handler", "Doubling {} bytes", message.len());
        for byte in message.as_mut_slice() {
            *byte = byte.wrapping_mul(2);
        }
        Ok(HandlerStatus::Success)
    }
}

/// Keeps only the first `keep` payload bytes
pub struct TruncatingHandler {
    pub keep: usize,
}

impl MmiHandler for TruncatingHandler {
    fn handle(&self, _handle: DispatchHandle, context: &mut HandlerContext<'_>) -> Result<HandlerStatus> {
        let message = context.message_mut().ok_or(MmError::InvalidParameter)?;
        message.set_len(self.keep)?;
        Ok(HandlerStatus::Success)
    }
}

/// Replaces the payload with the processor identifier of the dispatching CPU
pub struct ProcessorIdHandler;

impl MmiHandler for ProcessorIdHandler {
    fn handle(&self, _handle: DispatchHandle, context: &mut HandlerContext<'_>) -> Result<HandlerStatus> {
        let cpu = context.cpu_index();
        let id = context.save_state().read_register(cpu, SaveStateRegister::ProcessorId, 8)?;
        context.message_mut().ok_or(MmError::InvalidParameter)?.write_response(id.as_slice())?;
        Ok(HandlerStatus::Success)
    }
}

/// Counts invocations and reports a fixed outcome
#[derive(Clone)]
pub struct CountingHandler {
    calls: Arc<AtomicUsize>,
    outcome: Result<HandlerStatus>,
}

impl CountingHandler {
    pub fn new(outcome: Result<HandlerStatus>) -> Self {
        Self { calls: Arc::new(AtomicUsize::new(0)), outcome }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MmiHandler for CountingHandler {
    fn handle(&self, handle: DispatchHandle, _context: &mut HandlerContext<'_>) -> Result<HandlerStatus> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!(target: "counting_handler", "{:?} call {} -> {:?}", handle, calls, self.outcome);
        self.outcome
    }
}

/// Unregisters itself on its first invocation
#[derive(Clone)]
pub struct OneShotHandler {
    inner: CountingHandler,
}

impl OneShotHandler {
    pub fn new() -> Self {
        Self { inner: CountingHandler::new(Ok(HandlerStatus::Success)) }
    }

    pub fn calls(&self) -> usize {
        self.inner.calls()
    }
}

impl MmiHandler for OneShotHandler {
    fn handle(&self, handle: DispatchHandle, context: &mut HandlerContext<'_>) -> Result<HandlerStatus> {
        context.registry().unregister(handle)?;
        self.inner.handle(handle, context)
    }
}
