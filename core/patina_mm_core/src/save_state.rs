//! CPU Save-State Access
//!
//! When a processor enters MM its architectural state is captured into a per-CPU save-state area. Handlers inspect
//! and modify that state (e.g. to read the registers of the processor that issued a software MMI) through
//! [`SaveStateAccessor`].
//!
//! Register identifiers follow the PI specification `EFI_MM_SAVE_STATE_REGISTER` numbering for x64. AArch64 registers
//! use an implementation-defined range starting at [`AARCH64_REGISTER_BASE`].
//!
//! A platform may install a [`SaveStateHook`]. The hook is consulted first for every access; returning
//! `Unsupported` falls back to the architectural implementation in this module.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;

use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes as DeriveFromBytes, Immutable, IntoBytes as DeriveIntoBytes, KnownLayout};

use crate::error::{MmError, Result};
use crate::rendezvous::PerCpuState;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

/// First identifier of the AArch64 register range.
pub const AARCH64_REGISTER_BASE: u32 = 0x1000;

/// Value read from [`SaveStateRegister::Lma`] when the processor was in 64-bit mode.
pub const LMA_64BIT: u64 = 64;

/// A save-state register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaveStateRegister {
    GdtBase,
    IdtBase,
    LdtBase,
    GdtLimit,
    IdtLimit,
    LdtLimit,
    LdtInfo,
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    LdtrSel,
    TrSel,
    Dr7,
    Dr6,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    Rip,
    Rflags,
    Cr0,
    Cr3,
    Cr4,
    /// I/O instruction information. Needs a platform hook.
    Io,
    /// Long mode active.
    Lma,
    /// Platform identifier of the processor (e.g. the APIC ID or MPIDR).
    ProcessorId,
    /// General purpose register `Xn`, `n` in `0..=30`.
    Aarch64X(u8),
    Aarch64Sp,
    Aarch64Elr,
    Aarch64Spsr,
    Aarch64Esr,
    Aarch64Far,
}

impl SaveStateRegister {
    const X64_IDS: [(u32, SaveStateRegister); 41] = [
        (4, Self::GdtBase),
        (5, Self::IdtBase),
        (6, Self::LdtBase),
        (7, Self::GdtLimit),
        (8, Self::IdtLimit),
        (9, Self::LdtLimit),
        (10, Self::LdtInfo),
        (20, Self::Es),
        (21, Self::Cs),
        (22, Self::Ss),
        (23, Self::Ds),
        (24, Self::Fs),
        (25, Self::Gs),
        (26, Self::LdtrSel),
        (27, Self::TrSel),
        (28, Self::Dr7),
        (29, Self::Dr6),
        (30, Self::R8),
        (31, Self::R9),
        (32, Self::R10),
        (33, Self::R11),
        (34, Self::R12),
        (35, Self::R13),
        (36, Self::R14),
        (37, Self::R15),
        (38, Self::Rax),
        (39, Self::Rbx),
        (40, Self::Rcx),
        (41, Self::Rdx),
        (42, Self::Rsp),
        (43, Self::Rbp),
        (44, Self::Rsi),
        (45, Self::Rdi),
        (46, Self::Rip),
        (51, Self::Rflags),
        (52, Self::Cr0),
        (53, Self::Cr3),
        (54, Self::Cr4),
        (512, Self::Io),
        (513, Self::Lma),
        (514, Self::ProcessorId),
    ];

    /// Numeric identifier of the register.
    pub fn id(&self) -> u32 {
        match self {
            Self::Aarch64X(n) => AARCH64_REGISTER_BASE + *n as u32,
            Self::Aarch64Sp => AARCH64_REGISTER_BASE + 0x20,
            Self::Aarch64Elr => AARCH64_REGISTER_BASE + 0x21,
            Self::Aarch64Spsr => AARCH64_REGISTER_BASE + 0x22,
            Self::Aarch64Esr => AARCH64_REGISTER_BASE + 0x23,
            Self::Aarch64Far => AARCH64_REGISTER_BASE + 0x24,
            other => Self::X64_IDS.iter().find(|(_, r)| r == other).map(|(id, _)| *id).unwrap_or(0),
        }
    }

    /// Looks a register up by its numeric identifier.
    pub fn from_id(id: u32) -> Option<Self> {
        match id.checked_sub(AARCH64_REGISTER_BASE) {
            Some(n @ 0..=30) => Some(Self::Aarch64X(n as u8)),
            Some(0x20) => Some(Self::Aarch64Sp),
            Some(0x21) => Some(Self::Aarch64Elr),
            Some(0x22) => Some(Self::Aarch64Spsr),
            Some(0x23) => Some(Self::Aarch64Esr),
            Some(0x24) => Some(Self::Aarch64Far),
            Some(_) => None,
            None => Self::X64_IDS.iter().find(|(i, _)| *i == id).map(|(_, r)| *r),
        }
    }
}

/// Register value returned by a read: the low `width` bytes, little-endian.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RegisterBytes {
    bytes: [u8; 8],
    width: usize,
}

impl RegisterBytes {
    /// Builds a value from the low `width` bytes of `value`.
    pub fn from_u64(value: u64, width: usize) -> Result<Self> {
        if !is_valid_width(width) {
            return Err(MmError::InvalidParameter);
        }
        Ok(Self { bytes: value.to_le_bytes(), width })
    }

    fn from_slice(slice: &[u8]) -> Self {
        let mut bytes = [0u8; 8];
        let width = slice.len().min(8);
        bytes[..width].copy_from_slice(&slice[..width]);
        Self { bytes, width }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.width]
    }

    /// The value zero-extended to 64 bits.
    pub fn to_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..self.width].copy_from_slice(self.as_slice());
        u64::from_le_bytes(bytes)
    }
}

impl fmt::Debug for RegisterBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegisterBytes({:#X}, width {})", self.to_u64(), self.width)
    }
}

fn is_valid_width(width: usize) -> bool {
    matches!(width, 1 | 2 | 4 | 8)
}

/// Captured x64 processor state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, DeriveIntoBytes, DeriveFromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct X64SaveState {
    pub gdt_base: u64,
    pub idt_base: u64,
    pub ldt_base: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub gdt_limit: u32,
    pub idt_limit: u32,
    pub ldt_limit: u32,
    pub ldt_info: u32,
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub ldtr_sel: u16,
    pub tr_sel: u16,
}

impl X64SaveState {
    fn field_mut(&mut self, register: SaveStateRegister) -> Option<&mut [u8]> {
        use SaveStateRegister as R;
        let field = match register {
            R::GdtBase => self.gdt_base.as_mut_bytes(),
            R::IdtBase => self.idt_base.as_mut_bytes(),
            R::LdtBase => self.ldt_base.as_mut_bytes(),
            R::GdtLimit => self.gdt_limit.as_mut_bytes(),
            R::IdtLimit => self.idt_limit.as_mut_bytes(),
            R::LdtLimit => self.ldt_limit.as_mut_bytes(),
            R::LdtInfo => self.ldt_info.as_mut_bytes(),
            R::Es => self.es.as_mut_bytes(),
            R::Cs => self.cs.as_mut_bytes(),
            R::Ss => self.ss.as_mut_bytes(),
            R::Ds => self.ds.as_mut_bytes(),
            R::Fs => self.fs.as_mut_bytes(),
            R::Gs => self.gs.as_mut_bytes(),
            R::LdtrSel => self.ldtr_sel.as_mut_bytes(),
            R::TrSel => self.tr_sel.as_mut_bytes(),
            R::Dr7 => self.dr7.as_mut_bytes(),
            R::Dr6 => self.dr6.as_mut_bytes(),
            R::R8 => self.r8.as_mut_bytes(),
            R::R9 => self.r9.as_mut_bytes(),
            R::R10 => self.r10.as_mut_bytes(),
            R::R11 => self.r11.as_mut_bytes(),
            R::R12 => self.r12.as_mut_bytes(),
            R::R13 => self.r13.as_mut_bytes(),
            R::R14 => self.r14.as_mut_bytes(),
            R::R15 => self.r15.as_mut_bytes(),
            R::Rax => self.rax.as_mut_bytes(),
            R::Rbx => self.rbx.as_mut_bytes(),
            R::Rcx => self.rcx.as_mut_bytes(),
            R::Rdx => self.rdx.as_mut_bytes(),
            R::Rsp => self.rsp.as_mut_bytes(),
            R::Rbp => self.rbp.as_mut_bytes(),
            R::Rsi => self.rsi.as_mut_bytes(),
            R::Rdi => self.rdi.as_mut_bytes(),
            R::Rip => self.rip.as_mut_bytes(),
            R::Rflags => self.rflags.as_mut_bytes(),
            R::Cr0 => self.cr0.as_mut_bytes(),
            R::Cr3 => self.cr3.as_mut_bytes(),
            R::Cr4 => self.cr4.as_mut_bytes(),
            _ => return None,
        };
        Some(field)
    }
}

/// Captured AArch64 processor state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, DeriveIntoBytes, DeriveFromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Aarch64SaveState {
    pub x: [u64; 31],
    pub sp: u64,
    pub elr: u64,
    pub spsr: u64,
    pub esr: u64,
    pub far: u64,
}

impl Aarch64SaveState {
    fn field_mut(&mut self, register: SaveStateRegister) -> Option<&mut [u8]> {
        use SaveStateRegister as R;
        let field = match register {
            R::Aarch64X(n) => self.x.get_mut(n as usize)?.as_mut_bytes(),
            R::Aarch64Sp => self.sp.as_mut_bytes(),
            R::Aarch64Elr => self.elr.as_mut_bytes(),
            R::Aarch64Spsr => self.spsr.as_mut_bytes(),
            R::Aarch64Esr => self.esr.as_mut_bytes(),
            R::Aarch64Far => self.far.as_mut_bytes(),
            _ => return None,
        };
        Some(field)
    }
}

/// A processor's captured state, one variant per supported architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuSaveState {
    X64(X64SaveState),
    Aarch64(Aarch64SaveState),
}

impl Default for CpuSaveState {
    fn default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "aarch64")] {
                CpuSaveState::Aarch64(Aarch64SaveState::default())
            } else {
                CpuSaveState::X64(X64SaveState::default())
            }
        }
    }
}

impl CpuSaveState {
    /// Parses a raw x64 save-state snapshot.
    pub fn x64_from_bytes(bytes: &[u8]) -> Option<Self> {
        X64SaveState::read_from_prefix(bytes).ok().map(|(state, _)| CpuSaveState::X64(state))
    }

    /// Parses a raw AArch64 save-state snapshot.
    pub fn aarch64_from_bytes(bytes: &[u8]) -> Option<Self> {
        Aarch64SaveState::read_from_prefix(bytes).ok().map(|(state, _)| CpuSaveState::Aarch64(state))
    }

    /// Raw bytes of the snapshot.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            CpuSaveState::X64(state) => state.as_bytes(),
            CpuSaveState::Aarch64(state) => state.as_bytes(),
        }
    }

    fn field_mut(&mut self, register: SaveStateRegister) -> Option<&mut [u8]> {
        match self {
            CpuSaveState::X64(state) => state.field_mut(register),
            CpuSaveState::Aarch64(state) => state.field_mut(register),
        }
    }

    fn is_x64(&self) -> bool {
        matches!(self, CpuSaveState::X64(_))
    }
}

/// Platform override for save-state access.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait SaveStateHook: Send + Sync {
    /// Reads `register`. Return `Unsupported` to fall back to the architectural implementation.
    fn read_register(&self, cpu_index: usize, register: SaveStateRegister, width: usize) -> Result<RegisterBytes>;
    /// Writes `register`. Return `Unsupported` to fall back to the architectural implementation.
    fn write_register(&self, cpu_index: usize, register: SaveStateRegister, bytes: &[u8]) -> Result<()>;
}

/// Reads and writes registers in the per-CPU save-state areas.
#[derive(Clone, Copy)]
pub struct SaveStateAccessor<'a> {
    cpus: &'a [PerCpuState],
    hook: Option<&'a dyn SaveStateHook>,
}

impl<'a> SaveStateAccessor<'a> {
    pub fn new(cpus: &'a [PerCpuState], hook: Option<&'a dyn SaveStateHook>) -> Self {
        Self { cpus, hook }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn cpu(&self, cpu_index: usize) -> Result<&'a PerCpuState> {
        self.cpus.get(cpu_index).ok_or(MmError::InvalidParameter)
    }

    /// Reads the low `width` bytes of `register` from the save state of `cpu_index`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidParameter`](MmError::InvalidParameter) for an unknown CPU, a width outside `{1, 2, 4, 8}`, or
    /// a width larger than the register.
    /// Returns [`NotFound`](MmError::NotFound) if the register does not exist in this CPU's save-state format.
    /// Returns [`Unsupported`](MmError::Unsupported) if the register needs platform support that is not installed.
    pub fn read_register(&self, cpu_index: usize, register: SaveStateRegister, width: usize) -> Result<RegisterBytes> {
        let cpu = self.cpu(cpu_index)?;
        if !is_valid_width(width) {
            return Err(MmError::InvalidParameter);
        }

        if let Some(hook) = self.hook {
            match hook.read_register(cpu_index, register, width) {
                Err(MmError::Unsupported) => (),
                result => return result,
            }
        }

        let result = match register {
            SaveStateRegister::Io => Err(MmError::Unsupported),
            SaveStateRegister::ProcessorId => RegisterBytes::from_u64(cpu.processor_id(), width),
            SaveStateRegister::Lma => {
                if !cpu.save_state.lock().is_x64() {
                    Err(MmError::NotFound)
                } else if width > 4 {
                    Err(MmError::InvalidParameter)
                } else {
                    RegisterBytes::from_u64(LMA_64BIT, width)
                }
            }
            _ => {
                let mut state = cpu.save_state.lock();
                match state.field_mut(register) {
                    None => Err(MmError::NotFound),
                    Some(field) if width > field.len() => Err(MmError::InvalidParameter),
                    Some(field) => Ok(RegisterBytes::from_slice(&field[..width])),
                }
            }
        };

        if let Err(err) = result {
            log::debug!(target: "mm_save_state", "Read of {:?} on cpu {} failed: {:?}", register, cpu_index, err);
        }
        result
    }

    /// Writes `bytes` into the low bytes of `register` in the save state of `cpu_index`.
    ///
    /// Writes to [`SaveStateRegister::Lma`] are ignored. [`SaveStateRegister::ProcessorId`] is read-only.
    ///
    /// # Errors
    ///
    /// Same as [`read_register`](Self::read_register), with the width taken from `bytes.len()`.
    pub fn write_register(&self, cpu_index: usize, register: SaveStateRegister, bytes: &[u8]) -> Result<()> {
        let cpu = self.cpu(cpu_index)?;
        if !is_valid_width(bytes.len()) {
            return Err(MmError::InvalidParameter);
        }

        if let Some(hook) = self.hook {
            match hook.write_register(cpu_index, register, bytes) {
                Err(MmError::Unsupported) => (),
                result => return result,
            }
        }

        let mut state = cpu.save_state.lock();
        let result = match register {
            SaveStateRegister::Io => Err(MmError::Unsupported),
            SaveStateRegister::ProcessorId => Err(MmError::InvalidParameter),
            SaveStateRegister::Lma if state.is_x64() => Ok(()),
            _ => match state.field_mut(register) {
                None => Err(MmError::NotFound),
                Some(field) if bytes.len() > field.len() => Err(MmError::InvalidParameter),
                Some(field) => {
                    field[..bytes.len()].copy_from_slice(bytes);
                    Ok(())
                }
            },
        };

        match result {
            Ok(()) => log::trace!(target: "mm_save_state", "Wrote {:?} on cpu {}", register, cpu_index),
            Err(err) => {
                log::debug!(target: "mm_save_state", "Write of {:?} on cpu {} failed: {:?}", register, cpu_index, err)
            }
        }
        result
    }

    /// Replaces the captured state of `cpu_index`, typically right after the processor enters MM.
    pub fn load(&self, cpu_index: usize, state: CpuSaveState) -> Result<()> {
        *self.cpu(cpu_index)?.save_state.lock() = state;
        Ok(())
    }

    /// Returns a copy of the captured state of `cpu_index`, typically right before the processor leaves MM.
    pub fn snapshot(&self, cpu_index: usize) -> Result<CpuSaveState> {
        Ok(*self.cpu(cpu_index)?.save_state.lock())
    }
}

impl fmt::Debug for SaveStateAccessor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveStateAccessor")
            .field("cpus", &self.cpus.len())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}
