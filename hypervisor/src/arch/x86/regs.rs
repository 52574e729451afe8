//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

// EFER (technically not a register) bits
pub const EFER_LMA: u64 = 0x400;
pub const EFER_LME: u64 = 0x100;

// CR0 bits
pub const CR0_PE: u64 = 0x1;
pub const CR0_ET: u64 = 0x10;
pub const CR0_NW: u64 = 0x2000_0000;
pub const CR0_CD: u64 = 0x4000_0000;
pub const CR0_PG: u64 = 0x8000_0000;

// RFlags bits
pub const IF_SHIFT: usize = 9;
pub const IF: u64 = 1 << IF_SHIFT;
// Bit 1 of RFLAGS is reserved and always set.
pub const RFLAGS_RESERVED: u64 = 0x2;

// DR6 bits
pub const DR6_BS: u64 = 1 << 14;
pub const DR6_INIT: u64 = 0xffff_0ff0;
// DR7 bits
pub const DR7_GE: u64 = 1 << 9;
pub const DR7_FIXED_1: u64 = 0x0400;
pub const DR7_INIT: u64 = DR7_FIXED_1;

/// Builds the DR7 enable bit for hardware slot `n` (global enable).
pub const fn dr7_global_enable(n: usize) -> u64 {
    2 << (n * 2)
}

/// Condition field (R/W bits) of DR7 for hardware slot `n`.
pub const fn dr7_condition(dr7: u64, n: usize) -> u64 {
    (dr7 >> (16 + n * 4)) & 0x3
}

pub const fn dr7_type_shift(n: usize) -> usize {
    16 + n * 4
}

pub const fn dr7_len_shift(n: usize) -> usize {
    18 + n * 4
}

// APIC base MSR bits
pub const APIC_BASE_DEFAULT: u64 = 0xfee0_0000;
pub const APIC_BASE_ENABLE: u64 = 1 << 11;
pub const APIC_BASE_BSP: u64 = 1 << 8;
