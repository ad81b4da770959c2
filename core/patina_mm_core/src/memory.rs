//! MM Memory Region Table
//!
//! The fixed set of physical memory ranges the MM core consults before touching any caller supplied buffer. Allowed
//! regions are where communication buffers may live (the MM communication region pages). Excluded regions are memory
//! the normal world must never be able to point the core at, MMRAM first among them.
//!
//! The table is built once from platform HOB data and never changes afterwards. A fingerprint taken at construction is
//! re-checked by the validator so a corrupted table is detected rather than trusted.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use r_efi::efi;

use crate::error::{MmError, Result};

bitflags! {
    /// Access permissions of a memory region. An empty set means the region is not accessible at all.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Whether a region may hold communication buffers or must never be touched on behalf of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Allowed,
    Excluded,
}

/// One physical memory range with its permission tag.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegionDescriptor {
    pub base: efi::PhysicalAddress,
    pub length: u64,
    pub access: MemoryAccess,
    pub kind: RegionKind,
}

impl MemoryRegionDescriptor {
    /// An allowed region with the given permissions.
    pub const fn allowed(base: efi::PhysicalAddress, length: u64, access: MemoryAccess) -> Self {
        Self { base, length, access, kind: RegionKind::Allowed }
    }

    /// An excluded region. Excluded regions carry no access rights for the normal world.
    pub const fn excluded(base: efi::PhysicalAddress, length: u64) -> Self {
        Self { base, length, access: MemoryAccess::empty(), kind: RegionKind::Excluded }
    }

    /// Exclusive end of the region, `None` if the region wraps the address space.
    pub fn end(&self) -> Option<u64> {
        self.base.checked_add(self.length)
    }

    /// Whether `[start, end)` lies entirely inside this region.
    pub fn contains(&self, start: u64, end: u64) -> bool {
        match self.end() {
            Some(region_end) => start >= self.base && end <= region_end,
            None => false,
        }
    }

    /// Whether `[start, end)` shares at least one byte with this region.
    pub fn intersects(&self, start: u64, end: u64) -> bool {
        match self.end() {
            Some(region_end) => start < region_end && self.base < end,
            None => false,
        }
    }
}

impl fmt::Debug for MemoryRegionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryRegion({:?} [{:#X}..{:#X}) {:?})",
            self.kind,
            self.base,
            self.base.wrapping_add(self.length),
            self.access
        )
    }
}

/// The fixed region set consulted by the communication buffer validator.
pub struct MemoryRegionTable {
    regions: Vec<MemoryRegionDescriptor>,
    fingerprint: u64,
}

impl MemoryRegionTable {
    /// Builds the table, rejecting empty, wrapping, or overlapping descriptors.
    ///
    /// Regions are kept sorted by base address.
    ///
    /// ## Safety
    ///
    /// - Every allowed region must describe memory that is mapped and accessible to the MM core for the lifetime of the
    ///   table. The validator hands out slices over these ranges.
    pub unsafe fn new(mut regions: Vec<MemoryRegionDescriptor>) -> Result<Self> {
        regions.sort_by_key(|r| r.base);

        for region in regions.iter() {
            if region.length == 0 || region.end().is_none() {
                log::error!(target: "mm_validate", "Rejecting malformed region {:?}", region);
                return Err(MmError::InvalidParameter);
            }
        }

        for pair in regions.windows(2) {
            // Sorted by base, so overlap only needs checking against the next neighbor.
            let end = pair[0].end().ok_or(MmError::InvalidParameter)?;
            if pair[1].base < end {
                log::error!(target: "mm_validate", "Rejecting overlapping regions {:?} and {:?}", pair[0], pair[1]);
                return Err(MmError::InvalidParameter);
            }
        }

        let fingerprint = Self::compute_fingerprint(&regions);
        log::debug!(target: "mm_validate", "Memory region table built with {} regions", regions.len());
        Ok(Self { regions, fingerprint })
    }

    /// Returns the regions in base address order.
    pub fn regions(&self) -> &[MemoryRegionDescriptor] {
        &self.regions
    }

    /// Returns the allowed regions.
    pub fn allowed(&self) -> impl Iterator<Item = &MemoryRegionDescriptor> {
        self.regions.iter().filter(|r| r.kind == RegionKind::Allowed)
    }

    /// Returns the excluded regions.
    pub fn excluded(&self) -> impl Iterator<Item = &MemoryRegionDescriptor> {
        self.regions.iter().filter(|r| r.kind == RegionKind::Excluded)
    }

    /// Whether the table still matches the fingerprint taken at construction.
    pub fn verify_integrity(&self) -> bool {
        Self::compute_fingerprint(&self.regions) == self.fingerprint
    }

    #[cfg(test)]
    pub(crate) fn corrupt_for_test(&mut self) {
        if let Some(region) = self.regions.first_mut() {
            region.length ^= 0x10;
        }
    }

    fn compute_fingerprint(regions: &[MemoryRegionDescriptor]) -> u64 {
        regions.iter().fold(regions.len() as u64, |acc, r| {
            let kind = match r.kind {
                RegionKind::Allowed => 0xA5A5_0000_0000_0001u64,
                RegionKind::Excluded => 0x5A5A_0000_0000_0002u64,
            };
            let mixed = r.base ^ r.length.rotate_left(17) ^ (r.access.bits() as u64).rotate_left(41) ^ kind;
            acc.rotate_left(7) ^ mixed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        })
    }
}

impl fmt::Debug for MemoryRegionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MemoryRegionTable ({} regions):", self.regions.len())?;
        for region in self.regions.iter() {
            writeln!(f, "  {region:?}")?;
        }
        Ok(())
    }
}
