//! MM Communication Buffer Validation
//!
//! Every MMI that carries a communication buffer starts here. The normal world supplies an address and (optionally)
//! a size; nothing about either is trusted. [`CommBufferValidator::validate_buffer`] checks the range against the
//! [`MemoryRegionTable`] and the header against the mailbox before a single payload byte is used, and on success hands
//! back a [`ValidatedRange`]. The validated range is the only way the rest of the core reads or writes buffer memory.
//!
//! ## Check Order
//!
//! 1. Null address or zero size.
//! 2. `address + size` overflow.
//! 3. Region table integrity.
//! 4. Intersection with any excluded region.
//! 5. Containment in a single readable and writable allowed region.
//! 6. Size against the mailbox capacity, then against the header size.
//! 7. Header `message_length` against the mailbox capacity and the buffer size.
//!
//! The header is fetched exactly once. The snapshot taken at validation time is the one the dispatcher uses.
//!
//! ## Logging
//!
//! Rejections are logged on the `mm_validate` target at `warn` level.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;

use r_efi::efi;
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes as DeriveFromBytes, Immutable, IntoBytes as DeriveIntoBytes, KnownLayout};

use crate::error::ValidationError;
use crate::memory::{MemoryAccess, MemoryRegionTable};

/// Fixed header at the start of every communication buffer.
///
/// Wire layout: 16 byte GUID followed by the payload length in bytes. No padding.
#[derive(Clone, Copy, PartialEq, Eq, DeriveIntoBytes, DeriveFromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CommunicateHeader {
    pub header_guid: [u8; 16],
    pub message_length: u64,
}

const _: () = assert!(core::mem::size_of::<CommunicateHeader>() == 24);

impl CommunicateHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(guid: efi::Guid, message_length: u64) -> Self {
        Self { header_guid: *guid.as_bytes(), message_length }
    }

    /// The identifier of the handler set this message is addressed to.
    pub fn guid(&self) -> efi::Guid {
        efi::Guid::from_bytes(&self.header_guid)
    }

    /// Reads a header from the start of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.get(..Self::SIZE).and_then(|b| Self::read_from_bytes(b).ok())
    }

    /// Total buffer size needed for this header and its payload, `None` on overflow.
    pub fn total_size(&self) -> Option<usize> {
        usize::try_from(self.message_length).ok()?.checked_add(Self::SIZE)
    }
}

impl fmt::Debug for CommunicateHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommunicateHeader")
            .field("header_guid", &self.guid())
            .field("message_length", &self.message_length)
            .finish()
    }
}

/// A communication buffer range that passed validation.
///
/// Only [`CommBufferValidator`] constructs one. It records exactly the bounds that were validated and the header
/// snapshot read during validation.
#[derive(Debug, PartialEq, Eq)]
pub struct ValidatedRange {
    address: efi::PhysicalAddress,
    size: usize,
    header: CommunicateHeader,
}

impl ValidatedRange {
    pub fn address(&self) -> efi::PhysicalAddress {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The header snapshot taken during validation.
    pub fn header(&self) -> &CommunicateHeader {
        &self.header
    }

    /// Length of the message declared by the header snapshot.
    pub fn message_length(&self) -> usize {
        // Validation bounded message_length by the range size.
        self.header.message_length as usize
    }

    /// Copies the declared message into `dst`, returning the number of bytes copied.
    ///
    /// Copies at most `dst.len()` bytes.
    pub(crate) fn copy_message_into(&self, dst: &mut [u8]) -> usize {
        let count = self.message_length().min(dst.len());
        // SAFETY: validation proved [address, address + size) lies in an allowed region the region table vouches is
        // mapped, and SIZE + message_length <= size.
        unsafe {
            core::ptr::copy_nonoverlapping(
                (self.address as usize + CommunicateHeader::SIZE) as *const u8,
                dst.as_mut_ptr(),
                count,
            );
        }
        count
    }

    /// Writes a response header (same GUID, `message.len()` length) followed by `message` back into the range.
    ///
    /// Returns the new total size, which never exceeds the validated size.
    pub(crate) fn write_response(&self, message: &[u8]) -> Option<usize> {
        let total = CommunicateHeader::SIZE.checked_add(message.len())?;
        if message.len() > self.message_length() || total > self.size {
            return None;
        }

        let header = CommunicateHeader { header_guid: self.header.header_guid, message_length: message.len() as u64 };
        // SAFETY: as in `copy_message_into`; total <= size was checked above.
        unsafe {
            core::ptr::copy_nonoverlapping(
                header.as_bytes().as_ptr(),
                self.address as usize as *mut u8,
                CommunicateHeader::SIZE,
            );
            core::ptr::copy_nonoverlapping(
                message.as_ptr(),
                (self.address as usize + CommunicateHeader::SIZE) as *mut u8,
                message.len(),
            );
        }
        Some(total)
    }
}

/// Validates caller supplied communication buffers against a fixed region table.
pub struct CommBufferValidator {
    regions: MemoryRegionTable,
    mailbox_capacity: usize,
}

impl CommBufferValidator {
    pub fn new(regions: MemoryRegionTable, mailbox_capacity: usize) -> Self {
        Self { regions, mailbox_capacity }
    }

    pub fn regions(&self) -> &MemoryRegionTable {
        &self.regions
    }

    pub fn mailbox_capacity(&self) -> usize {
        self.mailbox_capacity
    }

    /// Validates the buffer at `address`.
    ///
    /// When `size` is `None` the header-sized range is validated first, the size is derived from the header, and the
    /// derived range is validated in full against the same header snapshot.
    ///
    /// No memory is written on any path.
    pub fn validate_buffer(
        &self,
        address: efi::PhysicalAddress,
        size: Option<usize>,
    ) -> Result<ValidatedRange, ValidationError> {
        let result = match size {
            Some(size) => self.check_range(address, size).and_then(|_| {
                let header = self.fetch_header(address);
                self.check_header(&header, size)?;
                Ok(ValidatedRange { address, size, header })
            }),
            None => self.check_range(address, CommunicateHeader::SIZE).and_then(|_| {
                let header = self.fetch_header(address);
                let size = header
                    .total_size()
                    .filter(|&size| size <= self.mailbox_capacity)
                    .ok_or(ValidationError::LengthTooLargeForMailbox)?;
                self.check_range(address, size)?;
                self.check_header(&header, size)?;
                Ok(ValidatedRange { address, size, header })
            }),
        };

        if let Err(err) = &result {
            log::warn!(target: "mm_validate", "Rejected buffer {:#X} (size {:?}): {}", address, size, err);
        }
        result
    }

    fn check_range(&self, address: efi::PhysicalAddress, size: usize) -> Result<(), ValidationError> {
        if address == 0 || size == 0 {
            return Err(ValidationError::NullOrZeroBuffer);
        }

        let end = address.checked_add(size as u64).ok_or(ValidationError::AddressOverflow)?;
        // The range must also be addressable by the core itself.
        if usize::try_from(end).is_err() {
            return Err(ValidationError::AddressOverflow);
        }

        if !self.regions.verify_integrity() {
            log::error!(target: "mm_validate", "Memory region table integrity check failed");
            return Err(ValidationError::RegionTableCorrupted);
        }

        if self.regions.excluded().any(|r| r.intersects(address, end)) {
            return Err(ValidationError::IntersectsExcludedRegion);
        }

        let rw = MemoryAccess::READ | MemoryAccess::WRITE;
        if !self.regions.allowed().any(|r| r.access.contains(rw) && r.contains(address, end)) {
            return Err(ValidationError::OutsideAllowedRegion);
        }

        if size > self.mailbox_capacity {
            return Err(ValidationError::LengthTooLargeForMailbox);
        }

        if size < CommunicateHeader::SIZE {
            return Err(ValidationError::HeaderSizeMismatch);
        }

        Ok(())
    }

    /// `size` already passed [`check_range`](Self::check_range), so it is within the mailbox.
    fn check_header(&self, header: &CommunicateHeader, size: usize) -> Result<(), ValidationError> {
        match header.total_size() {
            Some(total) if total <= size => Ok(()),
            _ => Err(ValidationError::HeaderSizeMismatch),
        }
    }

    fn fetch_header(&self, address: efi::PhysicalAddress) -> CommunicateHeader {
        // SAFETY: the caller validated [address, address + SIZE) against the allowed regions. The buffer carries no
        // alignment guarantee.
        unsafe { core::ptr::read_unaligned(address as usize as *const CommunicateHeader) }
    }
}

impl fmt::Debug for CommBufferValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommBufferValidator")
            .field("mailbox_capacity", &self.mailbox_capacity)
            .field("regions", &self.regions.regions().len())
            .finish()
    }
}
