//! Processor Rendezvous
//!
//! Every logical processor enters MM on an MMI. The [`RendezvousEngine`] elects one of them as the monarch, which
//! waits for the configured quorum, runs the dispatcher, and then releases everyone else. The other processors park
//! on their own status word until released.
//!
//! ## Protocol
//!
//! Each processor moves through `Absent -> Arrived -> Released -> Absent`. The monarch publishes `Released` with a
//! compare-exchange on every arrived processor; subordinates observe it with acquire loads and check out by storing
//! `Absent`. While the monarch is releasing, the engine is closing: a processor arriving then leaves immediately as
//! [`Role::Late`] instead of parking behind a release that already happened. Election re-opens only after released
//! processors checked out (or the check-out wait timed out).
//!
//! ## Logging
//!
//! Rendezvous progress is logged on the `mm_rendezvous` target.
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
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::config::{MonarchPolicy, RendezvousPolicy, SyncMode};
use crate::error::{MmError, Result};
use crate::poll::{poll_until, Deadline, PollOutcome, TimeSource};
use crate::save_state::CpuSaveState;

const NO_MONARCH: usize = usize::MAX;

/// Rendezvous status of one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuStatus {
    Absent = 0,
    Arrived = 1,
    Released = 2,
}

impl CpuStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CpuStatus::Arrived,
            2 => CpuStatus::Released,
            _ => CpuStatus::Absent,
        }
    }
}

/// Per-processor state. One per logical processor, index stable for the boot session.
pub struct PerCpuState {
    index: usize,
    processor_id: u64,
    status: AtomicU8,
    pub(crate) save_state: spin::Mutex<CpuSaveState>,
}

impl PerCpuState {
    pub fn new(index: usize, processor_id: u64, save_state: CpuSaveState) -> Self {
        Self {
            index,
            processor_id,
            status: AtomicU8::new(CpuStatus::Absent as u8),
            save_state: spin::Mutex::new(save_state),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Platform identifier of the processor.
    pub fn processor_id(&self) -> u64 {
        self.processor_id
    }

    pub fn status(&self) -> CpuStatus {
        CpuStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn transition(&self, from: CpuStatus, to: CpuStatus) -> bool {
        self.status.compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }
}

impl fmt::Debug for PerCpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerCpuState")
            .field("index", &self.index)
            .field("processor_id", &format_args!("{:#X}", self.processor_id))
            .field("status", &self.status())
            .finish()
    }
}

/// What an arriving processor does for this MM entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Drives the dispatch and releases everyone afterwards.
    Monarch,
    /// Parks until the monarch releases it.
    Subordinate,
    /// Arrived while the monarch was already releasing; leaves without parking.
    Late,
}

/// Arrival state observed by the monarch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousReport {
    pub arrived: usize,
    pub required: usize,
    pub cpu_count: usize,
}

/// Processor rendezvous engine.
pub struct RendezvousEngine {
    cpus: Vec<PerCpuState>,
    policy: RendezvousPolicy,
    time: Box<dyn TimeSource>,
    frequency: u64,
    monarch: AtomicUsize,
    closing: AtomicBool,
}

impl RendezvousEngine {
    /// Creates the engine.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidParameter`](MmError::InvalidParameter) if there are no processors, the counter frequency is
    /// zero, or a fixed monarch index is out of range.
    pub fn new(
        cpus: Vec<PerCpuState>,
        policy: RendezvousPolicy,
        time: Box<dyn TimeSource>,
        frequency: u64,
    ) -> Result<Self> {
        if cpus.is_empty() || frequency == 0 {
            return Err(MmError::InvalidParameter);
        }
        if let MonarchPolicy::Fixed(index) = policy.monarch {
            if index >= cpus.len() {
                return Err(MmError::InvalidParameter);
            }
        }

        log::info!(target: "mm_rendezvous", "Rendezvous for {} processors with {:?}", cpus.len(), policy);
        Ok(Self {
            cpus,
            policy,
            time,
            frequency,
            monarch: AtomicUsize::new(NO_MONARCH),
            closing: AtomicBool::new(false),
        })
    }

    pub fn cpus(&self) -> &[PerCpuState] {
        &self.cpus
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn policy(&self) -> &RendezvousPolicy {
        &self.policy
    }

    /// Index of the current monarch, if one has been elected.
    pub fn monarch(&self) -> Option<usize> {
        match self.monarch.load(Ordering::Acquire) {
            NO_MONARCH => None,
            index => Some(index),
        }
    }

    /// Number of processors currently in the `Arrived` state.
    pub fn arrived_count(&self) -> usize {
        self.cpus.iter().filter(|c| c.status() == CpuStatus::Arrived).count()
    }

    fn cpu(&self, cpu_index: usize) -> Result<&PerCpuState> {
        self.cpus.get(cpu_index).ok_or(MmError::InvalidParameter)
    }

    /// Records the arrival of `cpu_index` and returns its role.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidParameter`](MmError::InvalidParameter) for an unknown processor.
    /// Returns [`AlreadyStarted`](MmError::AlreadyStarted) if the processor has not checked out of the previous entry.
    pub fn arrive(&self, cpu_index: usize) -> Result<Role> {
        let cpu = self.cpu(cpu_index)?;

        if self.closing.load(Ordering::SeqCst) {
            log::debug!(target: "mm_rendezvous", "cpu {} arrived while releasing", cpu_index);
            return Ok(Role::Late);
        }

        if !cpu.transition(CpuStatus::Absent, CpuStatus::Arrived) {
            log::error!(target: "mm_rendezvous", "cpu {} arrived twice ({:?})", cpu_index, cpu.status());
            return Err(MmError::AlreadyStarted);
        }

        // The monarch may have started releasing between the first check and the arrival store.
        if self.closing.load(Ordering::SeqCst) {
            if cpu.transition(CpuStatus::Arrived, CpuStatus::Absent) {
                log::debug!(target: "mm_rendezvous", "cpu {} arrived while releasing", cpu_index);
                return Ok(Role::Late);
            }
            // Already released by the monarch; park picks the release up immediately.
            return Ok(Role::Subordinate);
        }

        let role = match self.policy.monarch {
            MonarchPolicy::FirstArrival => {
                match self.monarch.compare_exchange(NO_MONARCH, cpu_index, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => Role::Monarch,
                    Err(_) => Role::Subordinate,
                }
            }
            MonarchPolicy::Fixed(index) if index == cpu_index => {
                self.monarch.store(cpu_index, Ordering::SeqCst);
                Role::Monarch
            }
            MonarchPolicy::Fixed(_) => Role::Subordinate,
        };

        log::trace!(target: "mm_rendezvous", "cpu {} arrived as {:?}", cpu_index, role);
        Ok(role)
    }

    /// Waits for the configured quorum.
    ///
    /// # Errors
    ///
    /// Returns [`Timeout`](MmError::Timeout) if a blocking wait passed its deadline.
    /// Returns [`NotReady`](MmError::NotReady) if a non-blocking sample found the quorum incomplete.
    pub fn wait_for_all_processors(&self, mode: SyncMode) -> Result<RendezvousReport> {
        let cpu_count = self.cpu_count();
        let required = self.policy.quorum.required(cpu_count);
        let report = |arrived| RendezvousReport { arrived, required, cpu_count };

        match mode {
            SyncMode::NonBlocking => {
                let arrived = self.arrived_count();
                if arrived >= required {
                    Ok(report(arrived))
                } else {
                    Err(MmError::NotReady)
                }
            }
            SyncMode::Blocking => {
                let deadline = Deadline::after(self.time.as_ref(), self.frequency, self.policy.timeout);
                match poll_until(self.time.as_ref(), &deadline, || self.arrived_count() >= required) {
                    PollOutcome::Ready => Ok(report(self.arrived_count())),
                    PollOutcome::TimedOut => {
                        log::error!(
                            target: "mm_rendezvous",
                            "Rendezvous timed out: {} of {} required processors arrived",
                            self.arrived_count(),
                            required
                        );
                        Err(MmError::Timeout)
                    }
                }
            }
        }
    }

    /// Parks a subordinate until the monarch releases it, then checks it out.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidParameter`](MmError::InvalidParameter) for an unknown processor or one that has not arrived.
    pub fn park(&self, cpu_index: usize) -> Result<()> {
        let cpu = self.cpu(cpu_index)?;
        if cpu.status() == CpuStatus::Absent {
            return Err(MmError::InvalidParameter);
        }

        while cpu.status() != CpuStatus::Released {
            core::hint::spin_loop();
        }

        cpu.status.store(CpuStatus::Absent as u8, Ordering::Release);
        log::trace!(target: "mm_rendezvous", "cpu {} checked out", cpu_index);
        Ok(())
    }

    /// Releases every arrived processor, waits for them to check out, and re-opens election.
    ///
    /// Returns the number of processors released, the monarch excluded.
    pub fn release_all(&self) -> usize {
        self.closing.store(true, Ordering::SeqCst);
        let monarch = self.monarch.load(Ordering::SeqCst);

        let released = self
            .cpus
            .iter()
            .filter(|cpu| cpu.index != monarch && cpu.transition(CpuStatus::Arrived, CpuStatus::Released))
            .count();

        let deadline = Deadline::after(self.time.as_ref(), self.frequency, self.policy.timeout);
        let checked_out = poll_until(self.time.as_ref(), &deadline, || {
            self.cpus.iter().all(|cpu| cpu.index == monarch || cpu.status() != CpuStatus::Released)
        });
        if checked_out == PollOutcome::TimedOut {
            log::warn!(target: "mm_rendezvous", "Released processors did not check out in time");
        }

        if let Some(cpu) = self.cpus.get(monarch) {
            cpu.status.store(CpuStatus::Absent as u8, Ordering::SeqCst);
        }
        self.monarch.store(NO_MONARCH, Ordering::SeqCst);
        self.closing.store(false, Ordering::SeqCst);

        log::trace!(target: "mm_rendezvous", "Released {} processor(s)", released);
        released
    }

    /// Returns a guard that calls [`release_all`](Self::release_all) when dropped, including during unwinding.
    pub fn release_guard(&self) -> ReleaseGuard<'_> {
        ReleaseGuard { engine: self, released: None }
    }
}

impl fmt::Debug for RendezvousEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousEngine")
            .field("cpus", &self.cpus)
            .field("policy", &self.policy)
            .field("monarch", &self.monarch())
            .finish()
    }
}

/// Releases all processors exactly once, on [`release`](Self::release) or on drop.
pub struct ReleaseGuard<'a> {
    engine: &'a RendezvousEngine,
    released: Option<usize>,
}

impl ReleaseGuard<'_> {
    pub fn release(mut self) -> usize {
        self.release_once()
    }

    fn release_once(&mut self) -> usize {
        match self.released {
            Some(count) => count,
            None => {
                let count = self.engine.release_all();
                self.released = Some(count);
                count
            }
        }
    }
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.release_once();
    }
}
