// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

pub mod irqchip;
#[allow(non_upper_case_globals)]
pub mod msr_index;
pub mod regs;
pub mod run_page;

///
/// Export generically-named wrappers of the kernel ABI structures. The
/// layouts are fixed by the driver and shared by every backend.
///
pub use {
    kvm_bindings::kvm_cpuid_entry2 as CpuIdEntry, kvm_bindings::kvm_debugregs as DebugRegisters,
    kvm_bindings::kvm_dtable as DescriptorTable, kvm_bindings::kvm_fpu as FpuState,
    kvm_bindings::kvm_msr_entry as MsrEntry, kvm_bindings::kvm_regs as StandardRegisters,
    kvm_bindings::kvm_segment as SegmentRegister, kvm_bindings::kvm_sregs as SpecialRegisters,
    kvm_bindings::kvm_vcpu_events as VcpuEvents, kvm_bindings::kvm_xcr as Xcr,
    kvm_bindings::kvm_xcrs as ExtendedControlRegisters,
};

// MTRR constants
pub const MTRR_ENABLE: u64 = 0x800; // IA32_MTRR_DEF_TYPE MSR: E (MTRRs enabled) flag, bit 11
pub const MTRR_MEM_TYPE_WB: u64 = 0x6;
pub const MSR_MTRR_VARIABLE_COUNT: u32 = 8;

// IOAPIC pins
pub const NUM_IOAPIC_PINS: usize = 24;
// Pins per 8259 PIC
pub const NUM_PIC_PINS: usize = 8;

/// Number of hardware debug address registers.
pub const NUM_HW_BREAKPOINTS: usize = 4;

/// Size in bytes of the wire buffer used for a batch of MSR requests.
pub const MSR_BUFFER_SIZE: usize = 4096;
/// Size of the `nmsrs`/`pad` header preceding the entries in that buffer.
pub const MSR_BUFFER_HEADER: usize = 8;
/// Largest batch that fits in one MSR request.
pub const MAX_MSR_ENTRIES: usize =
    (MSR_BUFFER_SIZE - MSR_BUFFER_HEADER) / std::mem::size_of::<MsrEntry>();

// Guest debug control flags
pub const GUEST_DEBUG_ENABLE: u32 = 0x1;
pub const GUEST_DEBUG_SINGLESTEP: u32 = 0x2;
pub const GUEST_DEBUG_USE_SW_BP: u32 = 0x1_0000;
pub const GUEST_DEBUG_USE_HW_BP: u32 = 0x2_0000;
pub const GUEST_DEBUG_INJECT_DB: u32 = 0x4_0000;
pub const GUEST_DEBUG_INJECT_BP: u32 = 0x8_0000;

// Valid fields of the pending-event structure
pub const VCPU_EVENT_VALID_NMI_PENDING: u32 = 0x1;
pub const VCPU_EVENT_VALID_SIPI_VECTOR: u32 = 0x2;
pub const VCPU_EVENT_VALID_SHADOW: u32 = 0x4;
pub const VCPU_EVENT_VALID_SMM: u32 = 0x8;

// CPUID leaf 1 ECX feature bits
pub const CPUID_1_ECX_VMX: u32 = 1 << 5;
pub const CPUID_1_ECX_SMX: u32 = 1 << 6;

/// Software breakpoint instruction (`int3`).
pub const INT3_OPCODE: u8 = 0xcc;

// X86 Exceptions
#[allow(dead_code, clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    DE = 0,  // Divide Error
    DB = 1,  // Debug Exception
    BP = 3,  // Breakpoint
    OF = 4,  // Overflow
    BR = 5,  // BOUND Range Exceeded
    UD = 6,  // Invalid/Undefined Opcode
    NM = 7,  // No Math Coprocessor
    DF = 8,  // Double Fault
    TS = 10, // Invalid TSS
    NP = 11, // Segment Not Present
    SS = 12, // Stack Segment Fault
    GP = 13, // General Protection
    PF = 14, // Page Fault
    MF = 16, // Math Fault
    AC = 17, // Alignment Check
    MC = 18, // Machine Check
    XM = 19, // SIMD Floating-Point Exception
    VE = 20, // Virtualization Exception
    CP = 21, // Control Protection Exception
}

/// Multiprocessing state of a vCPU, as reported by the kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MpState {
    #[default]
    Runnable,
    Uninitialized,
    InitReceived,
    Halted,
    SipiReceived,
    Other(u32),
}

impl From<u32> for MpState {
    fn from(raw: u32) -> Self {
        match raw {
            0 => MpState::Runnable,
            1 => MpState::Uninitialized,
            2 => MpState::InitReceived,
            3 => MpState::Halted,
            4 => MpState::SipiReceived,
            other => MpState::Other(other),
        }
    }
}

impl From<MpState> for u32 {
    fn from(state: MpState) -> Self {
        match state {
            MpState::Runnable => 0,
            MpState::Uninitialized => 1,
            MpState::InitReceived => 2,
            MpState::Halted => 3,
            MpState::SipiReceived => 4,
            MpState::Other(raw) => raw,
        }
    }
}

/// Local APIC register page.
///
/// Registers are 32 bits wide and sit on 16-byte boundaries within the
/// 1 KiB page.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LapicState {
    pub regs: [u8; 1024],
}

impl Default for LapicState {
    fn default() -> Self {
        LapicState { regs: [0; 1024] }
    }
}

impl std::fmt::Debug for LapicState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LapicState")
            .field("id", &self.get_reg(0x20))
            .field("tpr", &self.get_reg(0x80))
            .finish_non_exhaustive()
    }
}

impl LapicState {
    /// Reads the 32-bit register at byte offset `reg_offset`.
    pub fn get_reg(&self, reg_offset: usize) -> u32 {
        LittleEndian::read_u32(&self.regs[reg_offset..reg_offset + 4])
    }

    /// Writes the 32-bit register at byte offset `reg_offset`.
    pub fn set_reg(&mut self, reg_offset: usize, value: u32) {
        LittleEndian::write_u32(&mut self.regs[reg_offset..reg_offset + 4], value)
    }
}

/// Legacy XSAVE area, 4 KiB.
#[derive(Clone, PartialEq, Eq)]
pub struct XsaveState {
    pub region: [u32; 1024],
}

impl Default for XsaveState {
    fn default() -> Self {
        XsaveState { region: [0; 1024] }
    }
}

impl std::fmt::Debug for XsaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Legacy region header: FCW/FSW at the start, MXCSR at byte 24.
        f.debug_struct("XsaveState")
            .field("fcw_fsw", &self.region[0])
            .field("mxcsr", &self.region[6])
            .finish_non_exhaustive()
    }
}

/// Breakpoint configuration handed to the kernel for one vCPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GuestDebug {
    pub control: u32,
    /// DR0-DR3 addresses, with DR7 in slot 7.
    pub debugreg: [u64; 8],
}

pub fn cpuid_has_feature_control(entries: &[CpuIdEntry]) -> bool {
    entries
        .iter()
        .find(|e| e.function == 1 && e.index == 0)
        .map(|e| e.ecx & (CPUID_1_ECX_VMX | CPUID_1_ECX_SMX) != 0)
        .unwrap_or(false)
}

#[macro_export]
macro_rules! msr {
    ($msr:expr) => {
        MsrEntry {
            index: $msr,
            data: 0x0,
            ..Default::default()
        }
    };
}
#[macro_export]
macro_rules! msr_data {
    ($msr:expr, $data:expr) => {
        MsrEntry {
            index: $msr,
            data: $data,
            ..Default::default()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msr_batch_capacity() {
        assert_eq!(std::mem::size_of::<MsrEntry>(), 16);
        assert_eq!(MAX_MSR_ENTRIES, 255);
    }

    #[test]
    fn test_lapic_register_access() {
        let mut lapic = LapicState::default();
        lapic.set_reg(0x20, 0x0300_0000);
        assert_eq!(lapic.get_reg(0x20), 0x0300_0000);
        assert_eq!(lapic.regs[0x23], 0x03);
    }

    #[test]
    fn test_mp_state_codes() {
        assert_eq!(MpState::from(3), MpState::Halted);
        assert_eq!(u32::from(MpState::SipiReceived), 4);
        assert_eq!(MpState::from(9), MpState::Other(9));
    }

    #[test]
    fn test_feature_control_detection() {
        let mut leaf = CpuIdEntry {
            function: 1,
            ..Default::default()
        };
        assert!(!cpuid_has_feature_control(&[leaf]));
        leaf.ecx = CPUID_1_ECX_VMX;
        assert!(cpuid_has_feature_control(&[leaf]));
    }
}
