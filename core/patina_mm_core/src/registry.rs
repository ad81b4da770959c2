//! MMI Handler Registry
//!
//! Maps handler identifiers (GUIDs) to the ordered list of MMI handlers registered for them. Handlers registered
//! without an identifier are root handlers and run on every MM entry.
//!
//! Lookups take a reader lock and return a [`HandlerSet`] snapshot, so a handler may register or unregister other
//! handlers (or itself) while it runs. Unregistration during a dispatch only marks the entry; marked entries are
//! skipped by later lookups and swept once the outermost dispatch finishes.
//!
//! ## Logging
//!
//! Registry changes are logged on the `mmi_registry` target.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::{sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use r_efi::efi;

use crate::config::HandlerPolicy;
use crate::error::{MmError, Result};
use crate::save_state::SaveStateAccessor;

/// Result of a single handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    /// The request was handled.
    Success,
    /// The interrupt source was quiesced. Counts as handled.
    SourceQuiesced,
    /// The source is still pending; the next handler is tried.
    SourcePending,
    /// The interrupt is still pending and no further handler for this identifier may run.
    InterruptPending,
}

impl HandlerStatus {
    /// Whether this status marks the MMI as handled.
    pub const fn is_handled(&self) -> bool {
        matches!(self, HandlerStatus::Success | HandlerStatus::SourceQuiesced)
    }
}

/// Opaque token identifying one registration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchHandle(u64);

impl DispatchHandle {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DispatchHandle({})", self.0)
    }
}

/// The message portion of a communication buffer, held in MM-owned memory while handlers run.
///
/// Handlers may shrink the message but never grow it past its original length.
pub struct MessageBuffer<'a> {
    guid: efi::Guid,
    data: &'a mut [u8],
    length: usize,
}

impl<'a> MessageBuffer<'a> {
    /// Wraps `data` as a message for `guid`. The whole slice is the initial message.
    pub fn new(guid: efi::Guid, data: &'a mut [u8]) -> Self {
        let length = data.len();
        Self { guid, data, length }
    }

    pub fn guid(&self) -> &efi::Guid {
        &self.guid
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The original message length, the upper bound for [`set_len`](Self::set_len).
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// The full original message region, including bytes past the current length.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Sets the response length.
    ///
    /// # Errors
    ///
    /// Returns [`BufferTooSmall`](MmError::BufferTooSmall) if `length` exceeds the original message length.
    pub fn set_len(&mut self, length: usize) -> Result<()> {
        if length > self.data.len() {
            return Err(MmError::BufferTooSmall);
        }
        self.length = length;
        Ok(())
    }

    /// Replaces the message with `response`.
    ///
    /// # Errors
    ///
    /// Returns [`BufferTooSmall`](MmError::BufferTooSmall) if `response` is longer than the original message.
    pub fn write_response(&mut self, response: &[u8]) -> Result<()> {
        let target = self.data.get_mut(..response.len()).ok_or(MmError::BufferTooSmall)?;
        target.copy_from_slice(response);
        self.length = response.len();
        Ok(())
    }
}

impl fmt::Debug for MessageBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("guid", &self.guid)
            .field("length", &self.length)
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// Everything a handler may use during one invocation.
pub struct HandlerContext<'a> {
    event_id: u64,
    cpu_index: usize,
    message: Option<MessageBuffer<'a>>,
    save_state: SaveStateAccessor<'a>,
    registry: &'a HandlerRegistry,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        event_id: u64,
        cpu_index: usize,
        message: Option<MessageBuffer<'a>>,
        save_state: SaveStateAccessor<'a>,
        registry: &'a HandlerRegistry,
    ) -> Self {
        Self { event_id, cpu_index, message, save_state, registry }
    }

    /// Identifier of the MMI event being serviced.
    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    /// Index of the processor that took the MMI.
    pub fn cpu_index(&self) -> usize {
        self.cpu_index
    }

    /// The message, `None` for root handlers.
    pub fn message(&self) -> Option<&MessageBuffer<'a>> {
        self.message.as_ref()
    }

    pub fn message_mut(&mut self) -> Option<&mut MessageBuffer<'a>> {
        self.message.as_mut()
    }

    pub fn save_state(&self) -> &SaveStateAccessor<'a> {
        &self.save_state
    }

    /// The registry the running handler came from. Unregistering here is deferred until dispatch completes.
    pub fn registry(&self) -> &'a HandlerRegistry {
        self.registry
    }

    pub(crate) fn into_message_len(self) -> Option<usize> {
        self.message.map(|m| m.len())
    }
}

/// An MMI handler.
///
/// Closures with the matching signature implement this trait; whatever they capture is the handler's context.
pub trait MmiHandler: Send + Sync {
    /// Services one MMI.
    fn handle(&self, handle: DispatchHandle, context: &mut HandlerContext<'_>) -> Result<HandlerStatus>;
}

impl<F> MmiHandler for F
where
    F: Fn(DispatchHandle, &mut HandlerContext<'_>) -> Result<HandlerStatus> + Send + Sync,
{
    fn handle(&self, handle: DispatchHandle, context: &mut HandlerContext<'_>) -> Result<HandlerStatus> {
        self(handle, context)
    }
}

struct HandlerEntry {
    handle: DispatchHandle,
    handler_type: Option<efi::Guid>,
    is_default: bool,
    handler: Arc<dyn MmiHandler>,
    pending_removal: AtomicBool,
}

impl HandlerEntry {
    fn is_live(&self) -> bool {
        !self.pending_removal.load(Ordering::Acquire)
    }
}

/// A handler returned by [`HandlerRegistry::lookup`].
#[derive(Clone)]
pub struct HandlerRef {
    handle: DispatchHandle,
    is_default: bool,
    handler: Arc<dyn MmiHandler>,
}

impl HandlerRef {
    pub fn handle(&self) -> DispatchHandle {
        self.handle
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn invoke(&self, context: &mut HandlerContext<'_>) -> Result<HandlerStatus> {
        self.handler.handle(self.handle, context)
    }
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRef").field("handle", &self.handle).field("is_default", &self.is_default).finish()
    }
}

/// Snapshot of the handlers for one identifier: default handler first, then registration order.
///
/// Iterating does not consume the set, so it can be walked more than once.
#[derive(Debug, Clone, Default)]
pub struct HandlerSet {
    handlers: Vec<HandlerRef>,
}

impl HandlerSet {
    pub fn iter(&self) -> core::slice::Iter<'_, HandlerRef> {
        self.handlers.iter()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<'a> IntoIterator for &'a HandlerSet {
    type Item = &'a HandlerRef;
    type IntoIter = core::slice::Iter<'a, HandlerRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.handlers.iter()
    }
}

/// Handler registry.
pub struct HandlerRegistry {
    entries: spin::RwLock<Vec<HandlerEntry>>,
    next_handle: AtomicU64,
    policy: HandlerPolicy,
    max_handlers: usize,
    closed: AtomicBool,
    dispatch_depth: AtomicUsize,
}

impl HandlerRegistry {
    pub fn new(policy: HandlerPolicy, max_handlers: usize) -> Self {
        Self {
            entries: spin::RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            policy,
            max_handlers,
            closed: AtomicBool::new(false),
            dispatch_depth: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> &HandlerPolicy {
        &self.policy
    }

    /// Registers `handler` for `handler_type`. `None` registers a root handler.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied`](MmError::AccessDenied) once registration has been closed.
    /// Returns [`DuplicateNotAllowed`](MmError::DuplicateNotAllowed) if the policy allows one handler per identifier
    /// and one exists.
    /// Returns [`OutOfResources`](MmError::OutOfResources) if the handler limit is reached or allocation fails.
    pub fn register<H: MmiHandler + 'static>(
        &self,
        handler_type: Option<efi::Guid>,
        handler: H,
    ) -> Result<DispatchHandle> {
        self.insert(handler_type, false, Arc::new(handler))
    }

    /// Registers the default handler for `guid`. It runs before every other handler for the identifier.
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register), and [`DuplicateNotAllowed`](MmError::DuplicateNotAllowed) if the
    /// identifier already has a default handler.
    pub fn register_default<H: MmiHandler + 'static>(&self, guid: efi::Guid, handler: H) -> Result<DispatchHandle> {
        self.insert(Some(guid), true, Arc::new(handler))
    }

    fn insert(
        &self,
        handler_type: Option<efi::Guid>,
        is_default: bool,
        handler: Arc<dyn MmiHandler>,
    ) -> Result<DispatchHandle> {
        if self.is_closed() {
            log::error!(target: "mmi_registry", "Registration for {:?} after registration closed", handler_type);
            return Err(MmError::AccessDenied);
        }

        let mut entries = self.entries.write();

        let live = entries.iter().filter(|e| e.is_live());
        if live.clone().count() >= self.max_handlers {
            log::error!(target: "mmi_registry", "Handler limit of {} reached", self.max_handlers);
            return Err(MmError::OutOfResources);
        }

        let mut same_type = live.filter(|e| handler_type.is_some() && e.handler_type == handler_type);
        let duplicate = if is_default {
            same_type.any(|e| e.is_default)
        } else {
            !self.policy.allow_multiple && same_type.any(|e| !e.is_default)
        };
        if duplicate {
            log::warn!(target: "mmi_registry", "Duplicate handler for {:?} rejected", handler_type);
            return Err(MmError::DuplicateNotAllowed);
        }

        entries.try_reserve(1).map_err(|_| MmError::OutOfResources)?;

        let handle = DispatchHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        entries.push(HandlerEntry {
            handle,
            handler_type,
            is_default,
            handler,
            pending_removal: AtomicBool::new(false),
        });

        log::debug!(target: "mmi_registry", "Registered {:?} for {:?} (default: {})", handle, handler_type, is_default);
        Ok(handle)
    }

    /// Unregisters the handler behind `handle`.
    ///
    /// While a dispatch is in flight the entry is only marked; it is removed when the dispatch finishes.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound`](MmError::NotFound) if the handle is unknown or was already unregistered.
    pub fn unregister(&self, handle: DispatchHandle) -> Result<()> {
        {
            let entries = self.entries.read();
            let entry = entries.iter().find(|e| e.handle == handle).ok_or(MmError::NotFound)?;
            entry
                .pending_removal
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .map_err(|_| MmError::NotFound)?;
        }

        log::debug!(target: "mmi_registry", "Unregistered {:?}", handle);

        if self.dispatch_depth.load(Ordering::Acquire) == 0 {
            self.sweep();
        }
        Ok(())
    }

    /// Returns the live handlers for `handler_type`. `None` returns the root handlers.
    pub fn lookup(&self, handler_type: Option<&efi::Guid>) -> HandlerSet {
        let mut handlers: Vec<HandlerRef> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.is_live() && e.handler_type.as_ref() == handler_type)
            .map(|e| HandlerRef { handle: e.handle, is_default: e.is_default, handler: e.handler.clone() })
            .collect();

        // Stable, so registration order is kept behind the default handler.
        handlers.sort_by_key(|h| !h.is_default);

        HandlerSet { handlers }
    }

    /// Whether `handle` is registered and not marked for removal.
    pub fn is_registered(&self, handle: DispatchHandle) -> bool {
        self.entries.read().iter().any(|e| e.handle == handle && e.is_live())
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries.read().iter().filter(|e| e.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes registration. Later [`register`](Self::register) calls fail with `AccessDenied`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::info!(target: "mmi_registry", "Handler registration closed with {} handlers", self.len());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the start of a dispatch. Removals are deferred until every scope is dropped.
    pub(crate) fn begin_dispatch(&self) -> DispatchScope<'_> {
        self.dispatch_depth.fetch_add(1, Ordering::AcqRel);
        DispatchScope { registry: self }
    }

    fn sweep(&self) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.is_live());
        if entries.len() != before {
            log::trace!(target: "mmi_registry", "Swept {} handler(s)", before - entries.len());
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .field("closed", &self.is_closed())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Guard returned by [`HandlerRegistry::begin_dispatch`].
pub(crate) struct DispatchScope<'a> {
    registry: &'a HandlerRegistry,
}

impl Drop for DispatchScope<'_> {
    fn drop(&mut self) {
        if self.registry.dispatch_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.registry.sweep();
        }
    }
}
