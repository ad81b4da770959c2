//! Patina MM Core Integration Tests
//!
//! Tests full MM entries through `DispatchContext`: communication buffers written the way a normal-world caller
//! writes them, handlers registered the way MM drivers register them, and processors simulated with host threads.
//!
//! ## Logging
//!
//! The `env_logger` crate can be used to enable logging during tests.
//!
//! To enable logging, set the `RUST_LOG` environment variable to the desired
//! log level (e.g., `debug`, `info`, `warn`, `error`) before running the tests.
//!
//! For example, to enable dispatch logging, run:
//!
//! ```sh
//! RUST_LOG=mm_dispatch=trace cargo test -p patina_mm_core --test patina_mm_core_integration
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

// Common utilities available to all test modules
mod common;

// Test module groups
mod dispatch;
mod platform;
