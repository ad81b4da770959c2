//! Management Mode (MM) Core Configuration
//!
//! Defines the policy the MM core needs before the first MMI is handled. Several behaviors of the generic core are
//! platform policy rather than architecture (how many processors must check in before dispatch, whether a rendezvous
//! timeout is fatal, whether several handlers for one GUID all run). These are explicit inputs here so the core never
//! has to guess a default on behalf of a platform.
//!
//! ## MM Configuration Usage
//!
//! The platform builds an [`MmCoreConfiguration`] once, typically starting from [`Default`] and overriding the fields
//! it cares about, and hands it to the [`DispatchContextBuilder`](crate::context::DispatchContextBuilder). The
//! configuration is immutable for the rest of the boot session.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;
use core::time::Duration;

use crate::comm_buffer::CommunicateHeader;

/// Default size of the MM communication mailbox (one 4KB page).
pub const DEFAULT_MAILBOX_CAPACITY: usize = 0x1000;

/// Default upper bound on the number of registered MMI handlers.
pub const DEFAULT_MAX_HANDLERS: usize = 256;

/// Default rendezvous timeout.
pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_millis(100);

/// Management Mode (MM) Core Configuration
#[derive(Debug, Clone)]
pub struct MmCoreConfiguration {
    /// Processor synchronization policy.
    pub rendezvous: RendezvousPolicy,
    /// How multiple handlers registered for one identifier are treated.
    pub handlers: HandlerPolicy,
    /// Size in bytes of the negotiated communication mailbox, header included.
    pub mailbox_capacity: usize,
    /// Maximum number of handlers the registry accepts.
    pub max_handlers: usize,
    /// Frequency of the platform performance counter in Hz. Zero asks the time source for its own value.
    pub timer_frequency: u64,
    /// Halt the processor instead of returning when a memory-corruption class error is detected.
    pub halt_on_fatal: bool,
}

impl Default for MmCoreConfiguration {
    fn default() -> Self {
        MmCoreConfiguration {
            rendezvous: RendezvousPolicy::default(),
            handlers: HandlerPolicy::default(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            max_handlers: DEFAULT_MAX_HANDLERS,
            timer_frequency: 0,
            halt_on_fatal: false,
        }
    }
}

impl MmCoreConfiguration {
    /// Returns the largest payload the mailbox can carry.
    ///
    /// Note: Zero will be returned if the mailbox is too small to hold the header.
    pub fn message_capacity(&self) -> usize {
        self.mailbox_capacity.saturating_sub(CommunicateHeader::SIZE)
    }
}

/// Processor rendezvous policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousPolicy {
    /// How the monarch processor is chosen.
    pub monarch: MonarchPolicy,
    /// How many processors must arrive before dispatch.
    pub quorum: Quorum,
    /// Whether the monarch waits for the quorum or only samples it.
    pub sync_mode: SyncMode,
    /// Bound on the arrival wait and on the check-out wait after release.
    pub timeout: Duration,
    /// What the monarch does when the quorum is not reached in time.
    pub on_timeout: TimeoutAction,
}

impl Default for RendezvousPolicy {
    fn default() -> Self {
        RendezvousPolicy {
            monarch: MonarchPolicy::FirstArrival,
            quorum: Quorum::All,
            sync_mode: SyncMode::Blocking,
            timeout: DEFAULT_RENDEZVOUS_TIMEOUT,
            on_timeout: TimeoutAction::Fail,
        }
    }
}

/// Monarch election policy.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum MonarchPolicy {
    /// The first processor to arrive drives dispatch.
    FirstArrival,
    /// The processor with the given index always drives dispatch.
    Fixed(usize),
}

impl fmt::Debug for MonarchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonarchPolicy::FirstArrival => write!(f, "MonarchPolicy::FirstArrival"),
            MonarchPolicy::Fixed(index) => write!(f, "MonarchPolicy::Fixed(cpu {index})"),
        }
    }
}

/// Number of processors that must arrive before dispatch begins.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Quorum {
    /// Every processor described by the platform.
    All,
    /// At least this many processors, the monarch included.
    AtLeast(usize),
}

impl Quorum {
    /// Resolves the quorum against the processor count, never exceeding it and never below one.
    pub fn required(&self, cpu_count: usize) -> usize {
        match self {
            Quorum::All => cpu_count,
            Quorum::AtLeast(count) => (*count).clamp(1, cpu_count.max(1)),
        }
    }
}

impl fmt::Debug for Quorum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quorum::All => write!(f, "Quorum::All"),
            Quorum::AtLeast(count) => write!(f, "Quorum::AtLeast({count})"),
        }
    }
}

/// Rendezvous wait mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Poll until the quorum is reached or the deadline passes.
    Blocking,
    /// Sample the arrival state once and return.
    NonBlocking,
}

/// Action taken by the monarch when the rendezvous times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Fail this dispatch cycle with `TIMEOUT`. Arrived processors are still released.
    Fail,
    /// Dispatch with whichever processors arrived.
    ProceedWithArrived,
}

/// Handler registration and dispatch policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerPolicy {
    /// Whether more than one handler may be registered for the same GUID.
    pub allow_multiple: bool,
    /// How multiple handlers for the same GUID are invoked.
    pub dispatch: MultiHandlerDispatch,
}

impl Default for HandlerPolicy {
    fn default() -> Self {
        HandlerPolicy { allow_multiple: true, dispatch: MultiHandlerDispatch::FirstSuccess }
    }
}

/// Dispatch behavior when several handlers match one GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiHandlerDispatch {
    /// Stop at the first handler that reports the request handled.
    FirstSuccess,
    /// Invoke every matching handler.
    Broadcast,
}
