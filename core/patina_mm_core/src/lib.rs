//! Patina Standalone MM Core
//!
//! The dispatch core of a Standalone Management Mode (MM) environment. Normal-world code fills a communication buffer
//! and triggers a Management Mode Interrupt (MMI); every processor enters MM; this crate brings the processors
//! together, validates the buffer, runs the registered MMI handlers and returns the result.
//!
//! ## MM Technology Background
//!
//! MM executes in an isolated region of memory (MMRAM) with the highest execution privilege on the platform. Because
//! of that privilege, everything arriving from outside MM is untrusted: the location and size of the communication
//! buffer, the header inside it and the payload. The core therefore:
//!
//! - accepts a buffer only if it lies entirely inside a platform-described communication region and outside MMRAM
//!   ([`comm_buffer`]),
//! - reads the header once and lets handlers work on an MM-owned copy of the payload ([`dispatcher`]),
//! - writes back only when the MMI was handled without error.
//!
//! ## Crate Layout
//!
//! Leaves first:
//!
//! - [`save_state`]: read and write one register of one processor's captured state.
//! - [`memory`] and [`comm_buffer`]: the region table and the communication buffer validator.
//! - [`registry`]: MMI handlers keyed by GUID.
//! - [`poll`] and [`rendezvous`]: processor synchronization around a dispatch.
//! - [`dispatcher`]: the root MMI dispatcher.
//! - [`hob`]: platform inputs parsed from the HOB list.
//! - [`context`]: the state for one boot session and the MM entry point.
//!
//! ## Features
//!
//! - `std`: host builds. Handler panics are caught at the dispatch boundary and reported as `ABORTED`.
//!
//!   Firmware builds do not unwind. A panicking handler ends in the MM image's `#[panic_handler]`, which must halt
//!   the processor: the dispatch never returns and processors parked in the rendezvous stay parked until the platform
//!   resets.
//! - `mockall`: exports mocks of the platform traits ([`poll::TimeSource`], [`save_state::SaveStateHook`]).
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod comm_buffer;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod hob;
pub mod memory;
pub mod poll;
pub mod registry;
pub mod rendezvous;
pub mod save_state;

pub use context::{DispatchContext, DispatchContextBuilder, MmEntryRequest, MmEntryResponse};
pub use error::{MmError, Result, ValidationError};
