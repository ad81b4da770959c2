//! Common Test Infrastructure for Patina MM Core Integration Tests
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

pub mod constants;
pub mod handlers;
pub mod message_writer;

pub use {constants::*, framework::*, handlers::*, message_writer::*};
