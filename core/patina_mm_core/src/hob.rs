//! Platform HOB Parsing
//!
//! The MM core learns about the platform from the HOB list handed over at MM initialization:
//!
//! - MM communication region HOBs describe the pages communication buffers may live in.
//! - The MMRAM descriptor block HOB describes MMRAM, which callers must never be able to point the core at.
//! - The MP information HOB describes the logical processors.
//!
//! The list is walked with [`mu_pi::hob::HobList`]. Only GUID extension HOBs are inspected, and every payload is
//! length checked before it is folded into [`PlatformInfo`].
//!
//! ## Logging
//!
//! Parsed HOBs are logged on the `mm_hob` target.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::vec::Vec;
use core::ffi::c_void;

use mu_pi::hob::{Hob, HobList};
use r_efi::efi;
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes as DeriveFromBytes, Immutable, IntoBytes as DeriveIntoBytes, KnownLayout};

use crate::error::{MmError, Result};
use crate::memory::{MemoryAccess, MemoryRegionDescriptor, MemoryRegionTable};

/// Size of a UEFI page.
pub const UEFI_PAGE_SIZE: u64 = 0x1000;

/// MM communication region HOB.
pub const MM_COMM_REGION_HOB_GUID: efi::Guid =
    efi::Guid::from_fields(0xd4ffc718, 0xfb82, 0x4274, 0x9a, 0xfc, &[0xaa, 0x8b, 0x1e, 0xef, 0x52, 0x93]);

/// MMRAM descriptor block HOB.
pub const MMRAM_MEMORY_RESERVE_GUID: efi::Guid =
    efi::Guid::from_fields(0x0703f912, 0xbf8d, 0x4e2a, 0xbe, 0x07, &[0xab, 0x27, 0x25, 0x25, 0xc5, 0x92]);

/// MP information HOB.
pub const MP_INFORMATION_HOB_GUID: efi::Guid =
    efi::Guid::from_fields(0xba33f15d, 0x4000, 0x45c1, 0x8e, 0x88, &[0xf9, 0x16, 0x92, 0xd4, 0x57, 0xe3]);

/// Set in [`ProcessorInformation::status_flag`] when the processor is enabled.
pub const PROCESSOR_ENABLED_BIT: u32 = 0x2;

/// MM communication region. The region is `pages` 4KB pages starting at `address`.
#[derive(Debug, Clone, Copy, DeriveIntoBytes, DeriveFromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MmCommRegionHob {
    pub buffer_type: u64,
    pub address: u64,
    pub pages: u64,
}

/// One MMRAM range.
#[derive(Debug, Clone, Copy, DeriveIntoBytes, DeriveFromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MmramDescriptor {
    pub physical_start: u64,
    pub cpu_start: u64,
    pub physical_size: u64,
    pub region_state: u64,
}

/// Fixed part of the MMRAM descriptor block. `number_of_mm_reserved_regions` descriptors follow.
#[derive(Debug, Clone, Copy, DeriveIntoBytes, DeriveFromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MmramDescriptorBlock {
    pub number_of_mm_reserved_regions: u32,
    pub reserved: u32,
}

/// Fixed part of the MP information HOB. `number_of_processors` entries follow.
#[derive(Debug, Clone, Copy, DeriveIntoBytes, DeriveFromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MpInformationHobData {
    pub number_of_processors: u64,
    pub number_of_enabled_processors: u64,
}

/// Per-processor entry of the MP information HOB.
#[derive(Debug, Clone, Copy, DeriveIntoBytes, DeriveFromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ProcessorInformation {
    pub processor_id: u64,
    pub status_flag: u32,
    pub package: u32,
    pub core: u32,
    pub thread: u32,
    pub extended_location: [u32; 6],
}

const _: () = assert!(core::mem::size_of::<ProcessorInformation>() == 48);

/// A logical processor described by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorDescriptor {
    pub processor_id: u64,
    pub enabled: bool,
}

/// Platform description gathered from the HOB list.
#[derive(Debug, Clone, Default)]
pub struct PlatformInfo {
    /// Allowed communication regions.
    pub comm_regions: Vec<MemoryRegionDescriptor>,
    /// Excluded MMRAM ranges.
    pub mmram: Vec<MemoryRegionDescriptor>,
    /// Logical processors in platform order.
    pub processors: Vec<ProcessorDescriptor>,
}

impl PlatformInfo {
    /// Parses the HOB list handed to the MM core at initialization.
    ///
    /// ## Safety
    ///
    /// `physical_hob_list` must point to a well formed HOB list terminated by an end-of-list HOB.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidParameter`](MmError::InvalidParameter) if the pointer is null, otherwise the errors of
    /// [`from_hob_list`](Self::from_hob_list).
    pub unsafe fn from_physical_hob_list(physical_hob_list: *const c_void) -> Result<Self> {
        if physical_hob_list.is_null() {
            log::error!(target: "mm_hob", "No HOB list handed to the MM core");
            return Err(MmError::InvalidParameter);
        }

        let mut hob_list = HobList::default();
        hob_list.discover_hobs(physical_hob_list);
        Self::from_hob_list(&hob_list)
    }

    /// Folds the MM related GUID HOBs of `hob_list` into a [`PlatformInfo`].
    ///
    /// # Errors
    ///
    /// Returns [`CompromisedData`](MmError::CompromisedData) if a HOB payload is shorter than its contents claim.
    pub fn from_hob_list(hob_list: &HobList<'_>) -> Result<Self> {
        let mut info = PlatformInfo::default();

        for hob in hob_list.iter() {
            let Hob::GuidHob(guid_hob, data) = hob else {
                continue;
            };

            if guid_hob.name == MM_COMM_REGION_HOB_GUID {
                info.comm_regions.push(Self::parse_comm_region(data)?);
            } else if guid_hob.name == MMRAM_MEMORY_RESERVE_GUID {
                info.mmram.extend(Self::parse_mmram(data)?);
            } else if guid_hob.name == MP_INFORMATION_HOB_GUID {
                info.processors = Self::parse_mp_information(data)?;
            }
        }

        log::info!(
            target: "mm_hob",
            "Platform: {} communication region(s), {} MMRAM range(s), {} processor(s)",
            info.comm_regions.len(),
            info.mmram.len(),
            info.processors.len()
        );
        Ok(info)
    }

    fn parse_comm_region(data: &[u8]) -> Result<MemoryRegionDescriptor> {
        let (hob, _) = MmCommRegionHob::read_from_prefix(data).map_err(|_| {
            log::error!(target: "mm_hob", "MM communication region HOB holds {} bytes", data.len());
            MmError::CompromisedData
        })?;
        let length = hob.pages.checked_mul(UEFI_PAGE_SIZE).ok_or(MmError::CompromisedData)?;
        log::debug!(
            target: "mm_hob",
            "MM communication region {:#X} ({} pages, type {})",
            hob.address,
            hob.pages,
            hob.buffer_type
        );
        Ok(MemoryRegionDescriptor::allowed(hob.address, length, MemoryAccess::READ | MemoryAccess::WRITE))
    }

    fn parse_mmram(data: &[u8]) -> Result<Vec<MemoryRegionDescriptor>> {
        let (block, rest) = MmramDescriptorBlock::read_from_prefix(data).map_err(|_| MmError::CompromisedData)?;
        let count = block.number_of_mm_reserved_regions as usize;
        let needed = count.checked_mul(core::mem::size_of::<MmramDescriptor>()).ok_or(MmError::CompromisedData)?;
        let raw = rest.get(..needed).ok_or(MmError::CompromisedData)?;

        // HOB data carries no alignment guarantee, so each descriptor is copied out.
        let descriptors = raw
            .chunks_exact(core::mem::size_of::<MmramDescriptor>())
            .map(|chunk| MmramDescriptor::read_from_bytes(chunk).map_err(|_| MmError::CompromisedData))
            .collect::<Result<Vec<_>>>()?;

        Ok(descriptors
            .iter()
            .inspect(|d| log::debug!(target: "mm_hob", "MMRAM {:#X} size {:#X}", d.physical_start, d.physical_size))
            .map(|d| MemoryRegionDescriptor::excluded(d.physical_start, d.physical_size))
            .collect())
    }

    fn parse_mp_information(data: &[u8]) -> Result<Vec<ProcessorDescriptor>> {
        let (header, rest) = MpInformationHobData::read_from_prefix(data).map_err(|_| MmError::CompromisedData)?;
        let count = usize::try_from(header.number_of_processors).map_err(|_| MmError::CompromisedData)?;
        let needed = count.checked_mul(core::mem::size_of::<ProcessorInformation>()).ok_or(MmError::CompromisedData)?;
        let raw = rest.get(..needed).ok_or(MmError::CompromisedData)?;

        raw.chunks_exact(core::mem::size_of::<ProcessorInformation>())
            .map(|chunk| {
                let entry = ProcessorInformation::read_from_bytes(chunk).map_err(|_| MmError::CompromisedData)?;
                Ok(ProcessorDescriptor {
                    processor_id: entry.processor_id,
                    enabled: entry.status_flag & PROCESSOR_ENABLED_BIT != 0,
                })
            })
            .collect()
    }

    /// Processors that take part in the rendezvous.
    pub fn enabled_processors(&self) -> impl Iterator<Item = &ProcessorDescriptor> {
        self.processors.iter().filter(|p| p.enabled)
    }

    /// Builds the region table from the parsed regions.
    ///
    /// ## Safety
    ///
    /// Same contract as [`MemoryRegionTable::new`]: the communication regions must be mapped for the MM core.
    pub unsafe fn region_table(&self) -> Result<MemoryRegionTable> {
        let regions = self.comm_regions.iter().chain(self.mmram.iter()).copied().collect();
        unsafe { MemoryRegionTable::new(regions) }
    }
}
