//! Bounded Polling
//!
//! The monarch's waits in the rendezvous engine go through [`poll_until`], which spins on a predicate against a
//! [`Deadline`] measured on a [`TimeSource`].
//!
//! [`ArchTimer`] reads the architectural performance counter through `mu_rust_helpers::perf_timer`. Host builds use a
//! monotonic clock instead so tests can run real multi-threaded rendezvous. Platforms whose counter frequency is not
//! discoverable set [`MmCoreConfiguration::timer_frequency`](crate::config::MmCoreConfiguration::timer_frequency).
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::time::Duration;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

/// A free-running counter with a known frequency.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait TimeSource: Send + Sync {
    /// Current counter value.
    fn cpu_count(&self) -> u64;
    /// Counter frequency in Hz. Zero if it cannot be determined.
    fn perf_frequency(&self) -> u64;
}

/// The architectural counter of the executing processor.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchTimer;

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "std"))] {
        fn epoch() -> &'static std::time::Instant {
            static EPOCH: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
            EPOCH.get_or_init(std::time::Instant::now)
        }

        impl TimeSource for ArchTimer {
            fn cpu_count(&self) -> u64 {
                epoch().elapsed().as_nanos() as u64
            }

            fn perf_frequency(&self) -> u64 {
                1_000_000_000
            }
        }
    } else {
        use mu_rust_helpers::perf_timer::{Arch, ArchFunctionality};

        impl TimeSource for ArchTimer {
            fn cpu_count(&self) -> u64 {
                Arch::cpu_count()
            }

            fn perf_frequency(&self) -> u64 {
                Arch::perf_frequency()
            }
        }
    }
}

/// A point in time on a [`TimeSource`], measured in counter ticks from a starting count.
///
/// Counter wrap-around is tolerated; only the elapsed distance is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start: u64,
    ticks: u64,
}

impl Deadline {
    /// A deadline `timeout` from now on a counter running at `frequency` Hz.
    pub fn after(time: &dyn TimeSource, frequency: u64, timeout: Duration) -> Self {
        let ticks = timeout.as_nanos().saturating_mul(frequency as u128) / 1_000_000_000;
        Self { start: time.cpu_count(), ticks: u64::try_from(ticks).unwrap_or(u64::MAX) }
    }

    /// A deadline that has already passed.
    #[cfg(test)]
    pub(crate) fn expired() -> Self {
        Self { start: 0, ticks: 0 }
    }

    pub fn is_expired(&self, time: &dyn TimeSource) -> bool {
        time.cpu_count().wrapping_sub(self.start) >= self.ticks
    }
}

/// Result of [`poll_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    TimedOut,
}

/// Spins until `predicate` returns true or `deadline` passes.
///
/// The predicate is evaluated once more after the deadline is observed, so a condition that became true right at the
/// deadline is reported as ready.
pub fn poll_until<F>(time: &dyn TimeSource, deadline: &Deadline, mut predicate: F) -> PollOutcome
where
    F: FnMut() -> bool,
{
    loop {
        if predicate() {
            return PollOutcome::Ready;
        }
        if deadline.is_expired(time) {
            return if predicate() { PollOutcome::Ready } else { PollOutcome::TimedOut };
        }
        core::hint::spin_loop();
    }
}
