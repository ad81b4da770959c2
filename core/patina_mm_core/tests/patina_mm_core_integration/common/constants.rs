//! Test constants for Patina MM Core integration tests
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

use core::time::Duration;

/// Standard communication buffer size (one page)
pub const TEST_BUFFER_SIZE: usize = 0x1000;

/// Size of the MMRAM window placed right after the communication buffer
pub const TEST_MMRAM_SIZE: u64 = 0x1000;

/// Rendezvous timeout for tests where every processor is expected to arrive
pub const GENEROUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Rendezvous timeout for tests that expect a timeout
pub const SHORT_TIMEOUT: Duration = Duration::from_millis(20);

/// Test GUIDs for different handlers
pub mod test_guids {
    use r_efi::efi;

    /// Doubles every payload byte
    pub const DOUBLER_HANDLER: efi::Guid =
        efi::Guid::from_fields(0x12345678, 0x1234, 0x5678, 0x12, 0x34, &[0x56, 0x78, 0x90, 0xab, 0xcd, 0xef]);

    /// Never registered
    pub const UNHANDLED: efi::Guid =
        efi::Guid::from_fields(0x87654321, 0x4321, 0x8765, 0x43, 0x21, &[0xfe, 0xdc, 0xba, 0x98, 0x76, 0x54]);

    /// Truncates the payload
    pub const TRUNCATE_HANDLER: efi::Guid =
        efi::Guid::from_fields(0x0badf00d, 0x5eed, 0x4c1e, 0x9b, 0x07, &[0x31, 0x4f, 0x59, 0x26, 0x53, 0x58]);

    /// Reports the processor identifier of the dispatching CPU
    pub const PROCESSOR_ID_HANDLER: efi::Guid =
        efi::Guid::from_fields(0x5a4e7c10, 0x7d3b, 0x4a90, 0x8e, 0x12, &[0x6f, 0x0c, 0x2d, 0x91, 0xb4, 0x3a]);

    /// Used by tests that register several handlers for one GUID
    pub const SHARED: efi::Guid =
        efi::Guid::from_fields(0xc0ffee00, 0x1111, 0x4222, 0xa3, 0x33, &[0x44, 0x55, 0x66, 0x77, 0x88, 0x99]);
}
