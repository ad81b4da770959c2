//! MM Core Dispatch Context
//!
//! [`DispatchContext`] owns everything the MM core needs for the rest of the boot session: the configuration, the
//! root dispatcher (validator, handler registry and scratch buffer), the rendezvous engine with the per-CPU state,
//! and the optional platform save-state hook. It is built once by [`DispatchContextBuilder`] and then shared by every
//! processor entering MM.
//!
//! ## MM Entry
//!
//! Every processor that takes an MMI calls [`DispatchContext::mm_entry`]. A processor that carries a communication
//! buffer posts it with its entry. The rendezvous engine elects a monarch, which waits for the configured quorum,
//! dispatches the posted request, and releases everyone. The posting processor receives the status and response size
//! whether it ended up as monarch or subordinate.
//!
//! ```rust,ignore
//! let context = DispatchContextBuilder::new(config)
//!     .with_region_table(regions)
//!     .with_processors(cpus)
//!     .build()?;
//!
//! context.registry().register(Some(MY_GUID), my_handler)?;
//!
//! // On every processor, for every MMI:
//! let response = context.mm_entry(cpu_index, Some(MmEntryRequest::new(comm_buffer, Some(size))));
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::{boxed::Box, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use r_efi::efi;

use crate::comm_buffer::{CommBufferValidator, CommunicateHeader};
use crate::config::{MmCoreConfiguration, TimeoutAction};
use crate::dispatcher::{DispatchReport, RootDispatcher};
use crate::error::{MmError, Result};
use crate::hob::PlatformInfo;
use crate::memory::MemoryRegionTable;
use crate::poll::{ArchTimer, TimeSource};
use crate::registry::HandlerRegistry;
use crate::rendezvous::{PerCpuState, RendezvousEngine, Role};
use crate::save_state::{CpuSaveState, SaveStateAccessor, SaveStateHook};

/// A communication buffer posted with an MM entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmEntryRequest {
    pub comm_buffer_address: efi::PhysicalAddress,
    /// Caller supplied size. `None` derives the size from the header.
    pub comm_buffer_size: Option<usize>,
}

impl MmEntryRequest {
    pub fn new(comm_buffer_address: efi::PhysicalAddress, comm_buffer_size: Option<usize>) -> Self {
        Self { comm_buffer_address, comm_buffer_size }
    }
}

/// What one processor returns from an MM entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmEntryResponse {
    /// Role the processor played in this entry. `None` if it could not take part.
    pub role: Option<Role>,
    /// Status of the posted request. `SUCCESS` for processors that posted nothing.
    pub status: efi::Status,
    /// Response size of the posted request, header included.
    pub comm_buffer_size: Option<usize>,
}

impl MmEntryResponse {
    fn new(role: Option<Role>, status: efi::Status) -> Self {
        Self { role, status, comm_buffer_size: None }
    }
}

#[derive(Debug, Clone, Copy)]
struct Posted {
    cpu_index: usize,
    request: MmEntryRequest,
}

#[derive(Debug, Clone, Copy)]
struct Completion {
    status: efi::Status,
    comm_buffer_size: Option<usize>,
}

/// Requests and completions exchanged between the posting processor and the monarch.
///
/// A request is accepted only together with its poster's arrival, and only until the monarch collects it. Each
/// processor owns one completion slot.
#[derive(Debug)]
struct Mailbox {
    posted: Option<Posted>,
    collected: bool,
    completions: Vec<Option<Completion>>,
}

impl Mailbox {
    fn new(cpu_count: usize) -> Self {
        Self { posted: None, collected: false, completions: alloc::vec![None; cpu_count] }
    }
}

/// The MM core state for one boot session.
pub struct DispatchContext {
    config: MmCoreConfiguration,
    dispatcher: RootDispatcher,
    rendezvous: RendezvousEngine,
    hook: Option<Box<dyn SaveStateHook>>,
    mailbox: spin::Mutex<Mailbox>,
    next_event: AtomicU64,
}

impl DispatchContext {
    pub fn builder(config: MmCoreConfiguration) -> DispatchContextBuilder {
        DispatchContextBuilder::new(config)
    }

    pub fn config(&self) -> &MmCoreConfiguration {
        &self.config
    }

    /// The handler registry. Registration is open until the first [`mm_entry`](Self::mm_entry).
    pub fn registry(&self) -> &HandlerRegistry {
        self.dispatcher.registry()
    }

    pub fn validator(&self) -> &CommBufferValidator {
        self.dispatcher.validator()
    }

    pub fn rendezvous(&self) -> &RendezvousEngine {
        &self.rendezvous
    }

    pub fn save_state(&self) -> SaveStateAccessor<'_> {
        SaveStateAccessor::new(self.rendezvous.cpus(), self.hook.as_deref())
    }

    /// Dispatches a communication buffer on `cpu_index` without a rendezvous.
    ///
    /// On success `comm_buffer_size` is updated to the response size.
    pub fn dispatch(
        &self,
        event_id: u64,
        cpu_index: usize,
        comm_buffer_address: efi::PhysicalAddress,
        comm_buffer_size: Option<&mut usize>,
    ) -> efi::Status {
        let report = self.dispatch_with_report(event_id, cpu_index, comm_buffer_address, comm_buffer_size);
        self.check_fatal(&report);
        report.status()
    }

    /// Same as [`dispatch`](Self::dispatch), returning the full [`DispatchReport`].
    pub fn dispatch_with_report(
        &self,
        event_id: u64,
        cpu_index: usize,
        comm_buffer_address: efi::PhysicalAddress,
        comm_buffer_size: Option<&mut usize>,
    ) -> DispatchReport {
        self.dispatcher.dispatch(self.save_state(), event_id, cpu_index, comm_buffer_address, comm_buffer_size)
    }

    /// Runs one MM entry on `cpu_index`.
    ///
    /// Every processor taking part in the MMI calls this. Subordinates return after the monarch releases them. A
    /// request posted by a processor that arrives after the monarch collected requests is not run; that processor
    /// gets `NOT_READY` and retries on the next MMI.
    pub fn mm_entry(&self, cpu_index: usize, request: Option<MmEntryRequest>) -> MmEntryResponse {
        self.registry().close();

        let (role, accepted) = match self.arrive_and_post(cpu_index, request) {
            Ok(arrival) => arrival,
            Err(err) => return MmEntryResponse::new(None, err.into()),
        };
        let unserved = if request.is_some() { efi::Status::NOT_READY } else { efi::Status::SUCCESS };

        match role {
            Role::Monarch => self.run_monarch(cpu_index),
            Role::Subordinate => {
                if let Err(err) = self.rendezvous.park(cpu_index) {
                    return MmEntryResponse::new(Some(role), err.into());
                }
                if accepted {
                    self.take_completion(cpu_index, role)
                } else {
                    MmEntryResponse::new(Some(role), unserved)
                }
            }
            Role::Late => {
                log::debug!(target: "mm_core", "cpu {} left as a late arrival", cpu_index);
                MmEntryResponse::new(Some(role), unserved)
            }
        }
    }

    /// Arrives at the rendezvous and posts `request` in one step.
    ///
    /// Returns the role and whether the request was accepted for this MMI.
    fn arrive_and_post(&self, cpu_index: usize, request: Option<MmEntryRequest>) -> Result<(Role, bool)> {
        let mut mailbox = self.mailbox.lock();
        if let (Some(_), Some(pending)) = (request, mailbox.posted) {
            log::warn!(
                target: "mm_core",
                "cpu {} posted a request while cpu {}'s is pending",
                cpu_index,
                pending.cpu_index
            );
            return Err(MmError::AlreadyStarted);
        }

        let role = self.rendezvous.arrive(cpu_index)?;
        if role == Role::Monarch {
            mailbox.collected = false;
        }

        let Some(request) = request else {
            return Ok((role, false));
        };
        if role == Role::Late || mailbox.collected {
            log::debug!(target: "mm_core", "cpu {} posted after requests were collected", cpu_index);
            return Ok((role, false));
        }

        if let Some(slot) = mailbox.completions.get_mut(cpu_index) {
            *slot = None;
        }
        mailbox.posted = Some(Posted { cpu_index, request });
        Ok((role, true))
    }

    /// Takes the posted request. Requests posted after this belong to the next MMI.
    fn collect(&self) -> Option<Posted> {
        let mut mailbox = self.mailbox.lock();
        mailbox.collected = true;
        mailbox.posted.take()
    }

    fn take_completion(&self, cpu_index: usize, role: Role) -> MmEntryResponse {
        let completion = self.mailbox.lock().completions.get_mut(cpu_index).and_then(Option::take);
        match completion {
            Some(completion) => MmEntryResponse {
                role: Some(role),
                status: completion.status,
                comm_buffer_size: completion.comm_buffer_size,
            },
            None => {
                log::warn!(target: "mm_core", "cpu {} found no completion for its request", cpu_index);
                MmEntryResponse::new(Some(role), efi::Status::NOT_READY)
            }
        }
    }

    fn run_monarch(&self, cpu_index: usize) -> MmEntryResponse {
        let guard = self.rendezvous.release_guard();
        let policy = self.rendezvous.policy();

        let ready = match self.rendezvous.wait_for_all_processors(policy.sync_mode) {
            Ok(report) => {
                log::trace!(target: "mm_core", "Quorum reached: {:?}", report);
                Ok(())
            }
            Err(err @ (MmError::Timeout | MmError::NotReady)) => match policy.on_timeout {
                TimeoutAction::Fail => Err(err),
                TimeoutAction::ProceedWithArrived => {
                    log::warn!(
                        target: "mm_core",
                        "Proceeding with {} of {} processors",
                        self.rendezvous.arrived_count(),
                        self.rendezvous.cpu_count()
                    );
                    Ok(())
                }
            },
            Err(err) => Err(err),
        };

        let posted = self.collect();
        let event_id = self.next_event.fetch_add(1, Ordering::Relaxed);
        let mut comm_buffer_size = posted.and_then(|p| p.request.comm_buffer_size);

        let status = match ready {
            Err(err) => {
                log::error!(target: "mm_core", "MMI {} not dispatched: {}", event_id, err);
                err.into()
            }
            Ok(()) => {
                let address = posted.map_or(0, |p| p.request.comm_buffer_address);
                let report = self.dispatch_with_report(event_id, cpu_index, address, comm_buffer_size.as_mut());
                self.check_fatal(&report);
                if report.status() == efi::Status::SUCCESS && comm_buffer_size.is_none() {
                    comm_buffer_size = report.response_size();
                }
                report.status()
            }
        };

        // Arrivals are serialized on the mailbox, so nobody can post between the release and re-opening collection.
        let mut mailbox = self.mailbox.lock();
        let (status, comm_buffer_size) = match posted {
            Some(p) if p.cpu_index != cpu_index => {
                if let Some(slot) = mailbox.completions.get_mut(p.cpu_index) {
                    *slot = Some(Completion { status, comm_buffer_size });
                }
                (efi::Status::SUCCESS, None)
            }
            Some(_) => (status, comm_buffer_size),
            None => (efi::Status::SUCCESS, None),
        };

        let released = guard.release();
        mailbox.collected = false;
        drop(mailbox);

        log::trace!(target: "mm_core", "MMI {} complete, released {} processor(s)", event_id, released);
        MmEntryResponse { role: Some(Role::Monarch), status, comm_buffer_size }
    }

    fn check_fatal(&self, report: &DispatchReport) {
        if !report.is_fatal() {
            return;
        }
        log::error!(target: "mm_core", "Fatal MM core error: {:?}", report.error());
        if self.config.halt_on_fatal {
            halt();
        }
    }
}

impl fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("rendezvous", &self.rendezvous)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "std"))] {
        fn halt() -> ! {
            panic!("MM core halted on a fatal error");
        }
    } else if #[cfg(target_arch = "x86_64")] {
        fn halt() -> ! {
            x86_64::instructions::interrupts::disable();
            loop {
                x86_64::instructions::hlt();
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        fn halt() -> ! {
            loop {
                aarch64_cpu::asm::wfe();
            }
        }
    } else {
        compile_error!("Unsupported architecture for the MM core halt loop");
    }
}

/// Builds a [`DispatchContext`].
pub struct DispatchContextBuilder {
    config: MmCoreConfiguration,
    regions: Option<MemoryRegionTable>,
    cpus: Option<Vec<PerCpuState>>,
    time: Option<Box<dyn TimeSource>>,
    hook: Option<Box<dyn SaveStateHook>>,
}

impl DispatchContextBuilder {
    pub fn new(config: MmCoreConfiguration) -> Self {
        Self { config, regions: None, cpus: None, time: None, hook: None }
    }

    /// Takes the memory regions and processors from parsed platform HOBs.
    ///
    /// ## Safety
    ///
    /// The communication regions described by `info` must be mapped for the MM core for the rest of the boot session.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidParameter`](MmError::InvalidParameter) if the regions overlap or wrap.
    pub unsafe fn with_platform_info(mut self, info: &PlatformInfo) -> Result<Self> {
        self.regions = Some(unsafe { info.region_table() }?);
        self.cpus = Some(
            info.enabled_processors()
                .enumerate()
                .map(|(index, p)| PerCpuState::new(index, p.processor_id, CpuSaveState::default()))
                .collect(),
        );
        Ok(self)
    }

    pub fn with_region_table(mut self, regions: MemoryRegionTable) -> Self {
        self.regions = Some(regions);
        self
    }

    pub fn with_processors(mut self, cpus: Vec<PerCpuState>) -> Self {
        self.cpus = Some(cpus);
        self
    }

    /// Overrides the architectural counter.
    pub fn with_time_source(mut self, time: Box<dyn TimeSource>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_save_state_hook(mut self, hook: Box<dyn SaveStateHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Builds the context.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidParameter`](MmError::InvalidParameter) if the regions or processors are missing, the mailbox
    /// cannot hold a header, or no counter frequency is available.
    pub fn build(self) -> Result<DispatchContext> {
        let config = self.config;
        let regions = self.regions.ok_or(MmError::InvalidParameter)?;
        let cpus = self.cpus.ok_or(MmError::InvalidParameter)?;
        if config.mailbox_capacity < CommunicateHeader::SIZE {
            log::error!(target: "mm_core", "Mailbox of {} bytes cannot hold a header", config.mailbox_capacity);
            return Err(MmError::InvalidParameter);
        }

        let time = self.time.unwrap_or_else(|| Box::new(ArchTimer) as Box<dyn TimeSource>);
        let frequency = match config.timer_frequency {
            0 => time.perf_frequency(),
            frequency => frequency,
        };

        let rendezvous = RendezvousEngine::new(cpus, config.rendezvous, time, frequency)?;
        let registry = HandlerRegistry::new(config.handlers, config.max_handlers);
        let validator = CommBufferValidator::new(regions, config.mailbox_capacity);
        let dispatcher = RootDispatcher::new(validator, registry, config.message_capacity());

        log::info!(
            target: "mm_core",
            "MM core ready: {} processor(s), mailbox {:#X} bytes, counter {} Hz",
            rendezvous.cpu_count(),
            config.mailbox_capacity,
            frequency
        );

        let cpu_count = rendezvous.cpu_count();
        Ok(DispatchContext {
            config,
            dispatcher,
            rendezvous,
            hook: self.hook,
            mailbox: spin::Mutex::new(Mailbox::new(cpu_count)),
            next_event: AtomicU64::new(1),
        })
    }
}
