//! Root MMI Dispatcher
//!
//! Runs one MM entry on the monarch: validate the communication buffer, copy its message into MM-owned memory, invoke
//! the handlers registered for the header GUID, write the response back, then run the root handlers.
//!
//! ## Communication Buffer Lifecycle
//!
//! ```text
//! Entered -> Validating -> Dispatching -> HandlerRunning* -> WritingResponse -> Returning -> ReturnedSuccess
//!                 |             |               |                                  ^      \-> ReturnedError
//!                 +-------------+---------------+----------------------------------+
//! ```
//!
//! The caller's buffer is written only in `WritingResponse`, which is reached only when the MMI was handled and no
//! handler failed. Every other path leaves the buffer exactly as it was.
//!
//! ## Logging
//!
//! Dispatch progress is logged on the `mm_dispatch` target. A lookup miss is logged at `debug` level only.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::{vec, vec::Vec};
use core::fmt;

use r_efi::efi;

use crate::comm_buffer::CommBufferValidator;
use crate::config::MultiHandlerDispatch;
use crate::error::{MmError, Result, ValidationError};
use crate::registry::{HandlerContext, HandlerRef, HandlerRegistry, HandlerSet, HandlerStatus, MessageBuffer};
use crate::save_state::SaveStateAccessor;

/// State of one communication buffer dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Entered,
    Validating,
    Dispatching,
    HandlerRunning,
    WritingResponse,
    Returning,
    ReturnedSuccess,
    ReturnedError,
}

impl DispatchState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: DispatchState) -> bool {
        use DispatchState::*;
        matches!(
            (self, next),
            (Entered, Validating)
                | (Entered, Returning)
                | (Validating, Dispatching)
                | (Validating, Returning)
                | (Dispatching, HandlerRunning)
                | (Dispatching, Returning)
                | (HandlerRunning, HandlerRunning)
                | (HandlerRunning, WritingResponse)
                | (HandlerRunning, Returning)
                | (WritingResponse, Returning)
                | (Returning, ReturnedSuccess)
                | (Returning, ReturnedError)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchState::ReturnedSuccess | DispatchState::ReturnedError)
    }
}

/// Outcome of one dispatch.
#[derive(Clone, PartialEq, Eq)]
pub struct DispatchReport {
    status: efi::Status,
    states: Vec<DispatchState>,
    error: Option<MmError>,
    handled: bool,
    handlers_invoked: usize,
    root_handlers_invoked: usize,
    response_size: Option<usize>,
}

impl DispatchReport {
    fn new() -> Self {
        Self {
            status: efi::Status::SUCCESS,
            states: vec![DispatchState::Entered],
            error: None,
            handled: false,
            handlers_invoked: 0,
            root_handlers_invoked: 0,
            response_size: None,
        }
    }

    /// Status returned to the caller.
    pub fn status(&self) -> efi::Status {
        self.status
    }

    pub fn state(&self) -> DispatchState {
        self.states.last().copied().unwrap_or(DispatchState::Entered)
    }

    /// Every state the dispatch went through, in order.
    pub fn states(&self) -> &[DispatchState] {
        &self.states
    }

    /// The error behind a non-success status.
    pub fn error(&self) -> Option<MmError> {
        self.error
    }

    /// Whether a GUID handler (or, without a communication buffer, a root handler) handled the MMI.
    pub fn handled(&self) -> bool {
        self.handled
    }

    pub fn handlers_invoked(&self) -> usize {
        self.handlers_invoked
    }

    pub fn root_handlers_invoked(&self) -> usize {
        self.root_handlers_invoked
    }

    /// Size of the response written back, header included.
    pub fn response_size(&self) -> Option<usize> {
        self.response_size
    }

    /// Whether the dispatch hit a memory-corruption class error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.error,
            Some(MmError::CompromisedData) | Some(MmError::Validation(ValidationError::RegionTableCorrupted))
        )
    }

    fn advance(&mut self, next: DispatchState) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            log::error!(target: "mm_dispatch", "Illegal dispatch transition {:?} -> {:?}", current, next);
            return Err(MmError::InvalidParameter);
        }
        self.states.push(next);
        Ok(())
    }
}

impl fmt::Debug for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchReport")
            .field("status", &self.status)
            .field("state", &self.state())
            .field("error", &self.error)
            .field("handled", &self.handled)
            .field("handlers_invoked", &self.handlers_invoked)
            .field("root_handlers_invoked", &self.root_handlers_invoked)
            .field("response_size", &self.response_size)
            .finish()
    }
}

#[derive(Debug, Default)]
struct HandlerOutcome {
    handled: bool,
    invoked: usize,
    error: Option<MmError>,
}

/// Everything a dispatch passes down to handlers, bundled.
#[derive(Clone, Copy)]
struct Invocation<'a> {
    event_id: u64,
    cpu_index: usize,
    save_state: SaveStateAccessor<'a>,
}

/// The root MMI dispatcher.
pub struct RootDispatcher {
    validator: CommBufferValidator,
    registry: HandlerRegistry,
    policy: MultiHandlerDispatch,
    scratch: spin::Mutex<Vec<u8>>,
}

impl RootDispatcher {
    /// Creates a dispatcher whose scratch buffer holds the largest message the mailbox can carry.
    pub fn new(validator: CommBufferValidator, registry: HandlerRegistry, message_capacity: usize) -> Self {
        let policy = registry.policy().dispatch;
        Self { validator, registry, policy, scratch: spin::Mutex::new(vec![0u8; message_capacity]) }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn validator(&self) -> &CommBufferValidator {
        &self.validator
    }

    /// Services one MM entry.
    ///
    /// `comm_buffer_address == 0` with no size means the entry carries no communication buffer; only root handlers
    /// run. Otherwise the buffer is validated, and on success `comm_buffer_size` (when given) is updated to the
    /// response size.
    pub fn dispatch(
        &self,
        save_state: SaveStateAccessor<'_>,
        event_id: u64,
        cpu_index: usize,
        comm_buffer_address: efi::PhysicalAddress,
        comm_buffer_size: Option<&mut usize>,
    ) -> DispatchReport {
        let _scope = self.registry.begin_dispatch();
        let invocation = Invocation { event_id, cpu_index, save_state };
        let mut report = DispatchReport::new();

        let comm_result = if comm_buffer_address == 0 && comm_buffer_size.is_none() {
            None
        } else {
            Some(self.dispatch_comm_buffer(&mut report, invocation, comm_buffer_address, comm_buffer_size))
        };

        // Every non-terminal state may move to Returning.
        let _ = report.advance(DispatchState::Returning);

        let root = self.run_root_handlers(invocation);
        report.root_handlers_invoked = root.invoked;

        let result = match comm_result {
            Some(result) => result,
            None => {
                report.handled = root.handled;
                match root.error {
                    Some(err) => Err(err),
                    None if root.handled => Ok(()),
                    None => Err(MmError::NotFound),
                }
            }
        };

        match result {
            Ok(()) => {
                report.status = efi::Status::SUCCESS;
                let _ = report.advance(DispatchState::ReturnedSuccess);
            }
            Err(err) => {
                report.status = err.into();
                report.error = Some(err);
                let _ = report.advance(DispatchState::ReturnedError);
            }
        }

        log::debug!(target: "mm_dispatch", "Dispatch on cpu {} finished: {:?}", cpu_index, report);
        report
    }

    fn dispatch_comm_buffer(
        &self,
        report: &mut DispatchReport,
        invocation: Invocation<'_>,
        address: efi::PhysicalAddress,
        size: Option<&mut usize>,
    ) -> Result<()> {
        report.advance(DispatchState::Validating)?;
        let range = self.validator.validate_buffer(address, size.as_deref().copied())?;

        report.advance(DispatchState::Dispatching)?;
        let guid = range.header().guid();
        let handlers = self.registry.lookup(Some(&guid));
        if handlers.is_empty() {
            log::debug!(target: "mm_dispatch", "No handler registered for {:?}", guid);
            return Err(MmError::NotFound);
        }

        let mut scratch = self.scratch.try_lock().ok_or_else(|| {
            log::error!(target: "mm_dispatch", "Nested dispatch for {:?} rejected", guid);
            MmError::AlreadyStarted
        })?;
        let message = scratch.get_mut(..range.message_length()).ok_or(MmError::BufferTooSmall)?;
        range.copy_message_into(message);

        let mut context = HandlerContext::new(
            invocation.event_id,
            invocation.cpu_index,
            Some(MessageBuffer::new(guid, message)),
            invocation.save_state,
            &self.registry,
        );
        let outcome = self.run_handlers(Some(&mut *report), &handlers, &mut context, true)?;
        report.handlers_invoked = outcome.invoked;
        report.handled = outcome.handled;

        if let Some(err) = outcome.error {
            log::error!(target: "mm_dispatch", "Handler for {:?} failed: {}", guid, err);
            return Err(err);
        }
        if !outcome.handled {
            log::debug!(target: "mm_dispatch", "MMI for {:?} not handled", guid);
            return Err(MmError::NotFound);
        }

        let response_length = context.into_message_len().unwrap_or(0);
        report.advance(DispatchState::WritingResponse)?;
        let response = scratch.get(..response_length).ok_or(MmError::BufferTooSmall)?;
        let total = range.write_response(response).ok_or(MmError::BufferTooSmall)?;

        if let Some(size) = size {
            *size = total;
        }
        report.response_size = Some(total);
        Ok(())
    }

    fn run_root_handlers(&self, invocation: Invocation<'_>) -> HandlerOutcome {
        let handlers = self.registry.lookup(None);
        let mut context =
            HandlerContext::new(invocation.event_id, invocation.cpu_index, None, invocation.save_state, &self.registry);
        let outcome = self.run_handlers(None, &handlers, &mut context, false).unwrap_or_default();
        if let Some(err) = outcome.error {
            log::error!(target: "mm_dispatch", "Root handler failed: {}", err);
        }
        outcome
    }

    fn run_handlers(
        &self,
        mut report: Option<&mut DispatchReport>,
        handlers: &HandlerSet,
        context: &mut HandlerContext<'_>,
        addressed: bool,
    ) -> Result<HandlerOutcome> {
        let mut outcome = HandlerOutcome::default();

        for handler in handlers {
            // A handler earlier in this dispatch may have unregistered it.
            if !self.registry.is_registered(handler.handle()) {
                continue;
            }
            if let Some(report) = report.as_deref_mut() {
                report.advance(DispatchState::HandlerRunning)?;
            }

            outcome.invoked += 1;
            match invoke_guarded(handler, context) {
                Ok(status) => {
                    log::trace!(target: "mm_dispatch", "{:?} returned {:?}", handler.handle(), status);
                    if status.is_handled() {
                        outcome.handled = true;
                    }
                    if addressed && status == HandlerStatus::InterruptPending {
                        outcome.handled = false;
                        break;
                    }
                    let first_success = self.policy == MultiHandlerDispatch::FirstSuccess;
                    if addressed && status == HandlerStatus::Success && first_success {
                        break;
                    }
                }
                Err(err) => {
                    outcome.error = Some(outcome.error.map_or(err, |prev| prev.most_severe(err)));
                }
            }
        }

        Ok(outcome)
    }
}

impl fmt::Debug for RootDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootDispatcher")
            .field("validator", &self.validator)
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .finish()
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "std"))] {
        fn invoke_guarded(handler: &HandlerRef, context: &mut HandlerContext<'_>) -> Result<HandlerStatus> {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.invoke(context))).unwrap_or_else(|_| {
                log::error!(target: "mm_dispatch", "{:?} panicked", handler.handle());
                Err(MmError::Aborted)
            })
        }
    } else {
        // Without unwinding a handler panic goes straight to the image's panic handler.
        fn invoke_guarded(handler: &HandlerRef, context: &mut HandlerContext<'_>) -> Result<HandlerStatus> {
            handler.invoke(context)
        }
    }
}
