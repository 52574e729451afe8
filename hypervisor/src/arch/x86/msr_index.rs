// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Model specific register indices used by the state synchronizer.

pub const MSR_IA32_TSC: u32 = 0x0000_0010;
pub const MSR_IA32_APICBASE: u32 = 0x0000_001b;
pub const MSR_IA32_FEATURE_CONTROL: u32 = 0x0000_003a;
pub const MSR_IA32_TSC_ADJUST: u32 = 0x0000_003b;
pub const MSR_IA32_SMBASE: u32 = 0x0000_009e;
pub const MSR_IA32_SYSENTER_CS: u32 = 0x0000_0174;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x0000_0175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x0000_0176;
pub const MSR_IA32_MISC_ENABLE: u32 = 0x0000_01a0;
pub const MSR_IA32_CR_PAT: u32 = 0x0000_0277;
pub const MSR_IA32_BNDCFGS: u32 = 0x0000_0d90;
pub const MSR_IA32_XSS: u32 = 0x0000_0da0;
pub const MSR_IA32_TSCDEADLINE: u32 = 0x0000_06e0;

pub const MSR_MTRRcap: u32 = 0x0000_00fe;
pub const MSR_MTRRdefType: u32 = 0x0000_02ff;
pub const MSR_MTRRfix64K_00000: u32 = 0x0000_0250;
pub const MSR_MTRRfix16K_80000: u32 = 0x0000_0258;
pub const MSR_MTRRfix16K_A0000: u32 = 0x0000_0259;
pub const MSR_MTRRfix4K_C0000: u32 = 0x0000_0268;
pub const MSR_MTRRfix4K_C8000: u32 = 0x0000_0269;
pub const MSR_MTRRfix4K_D0000: u32 = 0x0000_026a;
pub const MSR_MTRRfix4K_D8000: u32 = 0x0000_026b;
pub const MSR_MTRRfix4K_E0000: u32 = 0x0000_026c;
pub const MSR_MTRRfix4K_E8000: u32 = 0x0000_026d;
pub const MSR_MTRRfix4K_F0000: u32 = 0x0000_026e;
pub const MSR_MTRRfix4K_F8000: u32 = 0x0000_026f;

pub const fn msr_mtrr_phys_base(n: u32) -> u32 {
    0x0000_0200 + 2 * n
}

pub const fn msr_mtrr_phys_mask(n: u32) -> u32 {
    0x0000_0201 + 2 * n
}

pub const MSR_STAR: u32 = 0xc000_0081;
pub const MSR_LSTAR: u32 = 0xc000_0082;
pub const MSR_CSTAR: u32 = 0xc000_0083;
pub const MSR_SYSCALL_MASK: u32 = 0xc000_0084;
pub const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;
pub const MSR_TSC_AUX: u32 = 0xc000_0103;
pub const MSR_VM_HSAVE_PA: u32 = 0xc001_0117;

// Paravirtual clock
pub const MSR_KVM_WALL_CLOCK_NEW: u32 = 0x4b56_4d00;
pub const MSR_KVM_SYSTEM_TIME_NEW: u32 = 0x4b56_4d01;

pub const MTRR_FIXED_MSRS: [u32; 11] = [
    MSR_MTRRfix64K_00000,
    MSR_MTRRfix16K_80000,
    MSR_MTRRfix16K_A0000,
    MSR_MTRRfix4K_C0000,
    MSR_MTRRfix4K_C8000,
    MSR_MTRRfix4K_D0000,
    MSR_MTRRfix4K_D8000,
    MSR_MTRRfix4K_E0000,
    MSR_MTRRfix4K_E8000,
    MSR_MTRRfix4K_F0000,
    MSR_MTRRfix4K_F8000,
];
