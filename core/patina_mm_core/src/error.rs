//! Module for converting MM core errors to UEFI status codes.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;

use r_efi::efi;

/// A specialized [`Result`](core::result::Result) type for MM core operations.
pub type Result<T> = core::result::Result<T, MmError>;

/// Reasons a communication buffer was rejected before any of its contents were used.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ValidationError {
    /// The buffer address is null or the buffer size is zero.
    NullOrZeroBuffer,
    /// `address + size` does not fit in the physical address space.
    AddressOverflow,
    /// The buffer is not fully contained in a single accessible allowed region.
    OutsideAllowedRegion,
    /// The buffer touches at least one excluded region (e.g. MMRAM).
    IntersectsExcludedRegion,
    /// The header does not fit in the buffer, or the declared message does not fit in the buffer.
    HeaderSizeMismatch,
    /// The buffer or the declared message is larger than the negotiated mailbox.
    LengthTooLargeForMailbox,
    /// The region descriptor table no longer matches the table built at initialization.
    RegionTableCorrupted,
}

impl ValidationError {
    /// Returns whether the error belongs to the memory-corruption class that must not be recovered from.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, ValidationError::RegionTableCorrupted)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NullOrZeroBuffer => write!(f, "null or zero-sized communication buffer"),
            ValidationError::AddressOverflow => write!(f, "communication buffer range overflows the address space"),
            ValidationError::OutsideAllowedRegion => write!(f, "communication buffer is outside every allowed region"),
            ValidationError::IntersectsExcludedRegion => {
                write!(f, "communication buffer intersects an excluded region")
            }
            ValidationError::HeaderSizeMismatch => write!(f, "communicate header is inconsistent with the buffer size"),
            ValidationError::LengthTooLargeForMailbox => write!(f, "communication buffer exceeds the mailbox capacity"),
            ValidationError::RegionTableCorrupted => write!(f, "memory region table integrity check failed"),
        }
    }
}

impl From<ValidationError> for efi::Status {
    fn from(e: ValidationError) -> efi::Status {
        match e {
            ValidationError::NullOrZeroBuffer => efi::Status::INVALID_PARAMETER,
            ValidationError::AddressOverflow => efi::Status::INVALID_PARAMETER,
            ValidationError::OutsideAllowedRegion => efi::Status::ACCESS_DENIED,
            ValidationError::IntersectsExcludedRegion => efi::Status::SECURITY_VIOLATION,
            ValidationError::HeaderSizeMismatch => efi::Status::BAD_BUFFER_SIZE,
            ValidationError::LengthTooLargeForMailbox => efi::Status::BUFFER_TOO_SMALL,
            ValidationError::RegionTableCorrupted => efi::Status::COMPROMISED_DATA,
        }
    }
}

/// MM core error codes.
///
/// The subset of EDK II status codes produced by the MM core, plus the registry policy errors and the nested
/// [`ValidationError`] so callers can tell exactly why a buffer was rejected.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MmError {
    /// The parameter was incorrect.
    InvalidParameter,
    /// The item was not found.
    NotFound,
    /// The operation is not supported by this implementation; a higher-level implementation may support it.
    Unsupported,
    /// The resource has run out.
    OutOfResources,
    /// A handler is already registered for the identifier and the policy allows only one.
    DuplicateNotAllowed,
    /// Access was denied (e.g. registration after the registry was closed).
    AccessDenied,
    /// A timeout time expired.
    Timeout,
    /// The operation has not completed yet; poll again.
    NotReady,
    /// The buffer was not large enough for the requested data.
    BufferTooSmall,
    /// The operation was aborted (a handler panicked).
    Aborted,
    /// The operation is already in progress.
    AlreadyStarted,
    /// A handler reported a device level failure.
    DeviceError,
    /// Data required for a security decision is no longer trustworthy.
    CompromisedData,
    /// The communication buffer failed validation.
    Validation(ValidationError),
}

impl MmError {
    /// Converts an `r_efi::efi::Status` to a `Result`.
    ///
    /// Status codes that have no direct equivalent map to [`MmError::DeviceError`].
    pub fn status_to_result(status: efi::Status) -> Result<()> {
        match status {
            efi::Status::SUCCESS => Ok(()),
            efi::Status::INVALID_PARAMETER => Err(MmError::InvalidParameter),
            efi::Status::NOT_FOUND => Err(MmError::NotFound),
            efi::Status::UNSUPPORTED => Err(MmError::Unsupported),
            efi::Status::OUT_OF_RESOURCES => Err(MmError::OutOfResources),
            efi::Status::ACCESS_DENIED => Err(MmError::AccessDenied),
            efi::Status::TIMEOUT => Err(MmError::Timeout),
            efi::Status::NOT_READY => Err(MmError::NotReady),
            efi::Status::BUFFER_TOO_SMALL => Err(MmError::BufferTooSmall),
            efi::Status::ABORTED => Err(MmError::Aborted),
            efi::Status::ALREADY_STARTED => Err(MmError::AlreadyStarted),
            efi::Status::COMPROMISED_DATA => Err(MmError::CompromisedData),
            _ => Err(MmError::DeviceError),
        }
    }

    /// Ranking used when several handlers fail for the same MMI; the highest rank is reported.
    pub const fn severity(&self) -> u8 {
        match self {
            MmError::CompromisedData => 6,
            MmError::Validation(v) if v.is_fatal() => 6,
            MmError::Aborted => 5,
            MmError::DeviceError => 4,
            MmError::Timeout => 3,
            MmError::AccessDenied | MmError::Validation(_) => 3,
            MmError::OutOfResources | MmError::BufferTooSmall => 2,
            MmError::InvalidParameter | MmError::DuplicateNotAllowed | MmError::AlreadyStarted => 1,
            MmError::NotFound | MmError::NotReady | MmError::Unsupported => 0,
        }
    }

    /// Returns the more severe of two errors, preferring `self` on ties.
    pub fn most_severe(self, other: MmError) -> MmError {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmError::Validation(v) => write!(f, "validation failed: {v}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl From<ValidationError> for MmError {
    fn from(e: ValidationError) -> MmError {
        MmError::Validation(e)
    }
}

impl From<MmError> for efi::Status {
    fn from(e: MmError) -> efi::Status {
        match e {
            MmError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            MmError::NotFound => efi::Status::NOT_FOUND,
            MmError::Unsupported => efi::Status::UNSUPPORTED,
            MmError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            MmError::DuplicateNotAllowed => efi::Status::ALREADY_STARTED,
            MmError::AccessDenied => efi::Status::ACCESS_DENIED,
            MmError::Timeout => efi::Status::TIMEOUT,
            MmError::NotReady => efi::Status::NOT_READY,
            MmError::BufferTooSmall => efi::Status::BUFFER_TOO_SMALL,
            MmError::Aborted => efi::Status::ABORTED,
            MmError::AlreadyStarted => efi::Status::ALREADY_STARTED,
            MmError::DeviceError => efi::Status::DEVICE_ERROR,
            MmError::CompromisedData => efi::Status::COMPROMISED_DATA,
            MmError::Validation(v) => v.into(),
        }
    }
}
