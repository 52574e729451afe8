// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use thiserror::Error;

use crate::arch::x86::run_page::{
    RunState, INTERNAL_ERROR_DELIVERY_EV, INTERNAL_ERROR_EMULATION, INTERNAL_ERROR_SIMUL_EX,
    SYSTEM_EVENT_CRASH, SYSTEM_EVENT_RESET, SYSTEM_EVENT_SHUTDOWN,
};
use crate::arch::x86::{
    CpuIdEntry, DebugRegisters, ExtendedControlRegisters, FpuState, GuestDebug, LapicState,
    MpState, MsrEntry, SpecialRegisters, StandardRegisters, VcpuEvents, XsaveState,
};

#[derive(Error, Debug)]
///
/// Enum for CPU error
pub enum HypervisorCpuError {
    ///
    /// Setting standard registers error
    ///
    #[error("Failed to set standard register: {0}")]
    SetStandardRegs(#[source] anyhow::Error),
    ///
    /// Getting standard registers error
    ///
    #[error("Failed to get standard registers: {0}")]
    GetStandardRegs(#[source] anyhow::Error),
    ///
    /// Setting special register error
    ///
    #[error("Failed to set special registers: {0}")]
    SetSpecialRegs(#[source] anyhow::Error),
    ///
    /// Getting standard register error
    ///
    #[error("Failed to get special registers: {0}")]
    GetSpecialRegs(#[source] anyhow::Error),
    ///
    /// Setting floating point registers error
    ///
    #[error("Failed to set floating point registers: {0}")]
    SetFloatingPointRegs(#[source] anyhow::Error),
    ///
    /// Getting floating point register error
    ///
    #[error("Failed to get floating point registers: {0}")]
    GetFloatingPointRegs(#[source] anyhow::Error),
    ///
    /// Setting Cpuid error
    ///
    #[error("Failed to set Cpuid: {0}")]
    SetCpuid(#[source] anyhow::Error),
    ///
    /// Setting Lapic state error
    ///
    #[error("Failed to set Lapic state: {0}")]
    SetLapicState(#[source] anyhow::Error),
    ///
    /// Getting Lapic state error
    ///
    #[error("Failed to get Lapic state: {0}")]
    GetLapicState(#[source] anyhow::Error),
    ///
    /// Setting MSR entries error
    ///
    #[error("Failed to set Msr entries: {0}")]
    SetMsrEntries(#[source] anyhow::Error),
    ///
    /// Getting Msr entries error
    ///
    #[error("Failed to get Msr entries: {0}")]
    GetMsrEntries(#[source] anyhow::Error),
    ///
    /// Setting MP state error
    ///
    #[error("Failed to set MP state: {0}")]
    SetMpState(#[source] anyhow::Error),
    ///
    /// Getting MP state error
    ///
    #[error("Failed to get MP state: {0}")]
    GetMpState(#[source] anyhow::Error),
    ///
    /// Setting Saved Processor Extended States error
    ///
    #[error("Failed to set Saved Processor Extended States: {0}")]
    SetXsaveState(#[source] anyhow::Error),
    ///
    /// Getting Saved Processor Extended States error
    ///
    #[error("Failed to get Saved Processor Extended States: {0}")]
    GetXsaveState(#[source] anyhow::Error),
    ///
    /// Setting Extended Control Registers error
    ///
    #[error("Failed to set Extended Control Registers: {0}")]
    SetXcsr(#[source] anyhow::Error),
    ///
    /// Getting Extended Control Registers error
    ///
    #[error("Failed to get Extended Control Registers: {0}")]
    GetXcsr(#[source] anyhow::Error),
    ///
    /// Running Vcpu error
    ///
    #[error("Failed to run vcpu: {0}")]
    RunVcpu(#[source] anyhow::Error),
    ///
    /// Run page access error
    ///
    #[error("Failed to access the vcpu run page: {0}")]
    RunPage(#[source] anyhow::Error),
    ///
    /// Getting Vcpu events error
    ///
    #[error("Failed to get Vcpu events: {0}")]
    GetVcpuEvents(#[source] anyhow::Error),
    ///
    /// Setting Vcpu events error
    ///
    #[error("Failed to set Vcpu events: {0}")]
    SetVcpuEvents(#[source] anyhow::Error),
    ///
    /// Getting debug registers error
    ///
    #[error("Failed to get debug registers: {0}")]
    GetDebugRegs(#[source] anyhow::Error),
    ///
    /// Setting debug registers error
    ///
    #[error("Failed to set debug registers: {0}")]
    SetDebugRegs(#[source] anyhow::Error),
    ///
    /// Setting guest debug configuration error
    ///
    #[error("Failed to set guest debug configuration: {0}")]
    SetDebugConfig(#[source] anyhow::Error),
    ///
    /// Guest virtual address translation error
    ///
    #[error("Failed to translate guest virtual address: {0}")]
    TranslateVirtualAddress(#[source] anyhow::Error),
    ///
    /// Interrupt injection error
    ///
    #[error("Failed to inject interrupt: {0}")]
    InjectInterrupt(#[source] anyhow::Error),
    ///
    /// NMI injection error
    ///
    #[error("Failed to inject NMI: {0}")]
    InjectNmi(#[source] anyhow::Error),
    ///
    /// SMI injection error
    ///
    #[error("Failed to inject SMI: {0}")]
    InjectSmi(#[source] anyhow::Error),
}

///
/// Result type for returning from a function
///
pub type Result<T> = anyhow::Result<T, HypervisorCpuError>;

/// Architectural state reported with a debug exit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugExit {
    pub exception: u32,
    pub pc: u64,
    pub dr6: u64,
    pub dr7: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InternalErrorKind {
    /// The kernel failed to emulate an instruction.
    Emulation,
    /// An exception was raised while delivering another one.
    SimultaneousException,
    /// A VM exit happened while an event was being delivered.
    DeliveryEvent,
    Other(u32),
}

impl From<u32> for InternalErrorKind {
    fn from(raw: u32) -> Self {
        match raw {
            INTERNAL_ERROR_EMULATION => InternalErrorKind::Emulation,
            INTERNAL_ERROR_SIMUL_EX => InternalErrorKind::SimultaneousException,
            INTERNAL_ERROR_DELIVERY_EV => InternalErrorKind::DeliveryEvent,
            other => InternalErrorKind::Other(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemEventKind {
    Shutdown,
    Reset,
    Crash,
    Other(u32),
}

impl From<u32> for SystemEventKind {
    fn from(raw: u32) -> Self {
        match raw {
            SYSTEM_EVENT_SHUTDOWN => SystemEventKind::Shutdown,
            SYSTEM_EVENT_RESET => SystemEventKind::Reset,
            SYSTEM_EVENT_CRASH => SystemEventKind::Crash,
            other => SystemEventKind::Other(other),
        }
    }
}

/// Result of translating a guest virtual address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TranslatedAddress {
    pub gpa: u64,
    pub valid: bool,
    pub writeable: bool,
}

/// Reason a vCPU returned from the blocking run request.
///
/// IO and MMIO payloads borrow the vCPU's run page: data written into an
/// `IoIn`/`MmioRead` buffer is handed back to the guest on the next run.
#[derive(Debug)]
pub enum VmExit<'a> {
    IoIn {
        port: u16,
        size: u8,
        count: u32,
        data: &'a mut [u8],
    },
    IoOut {
        port: u16,
        size: u8,
        count: u32,
        data: &'a [u8],
    },
    MmioRead {
        addr: u64,
        data: &'a mut [u8],
    },
    MmioWrite {
        addr: u64,
        data: &'a [u8],
    },
    Hlt,
    IrqWindowOpen,
    Intr,
    Nmi,
    Shutdown,
    SystemEvent {
        kind: SystemEventKind,
        flags: u64,
    },
    InternalError {
        suberror: InternalErrorKind,
        data: Vec<u64>,
    },
    TprAccess {
        rip: u64,
        is_write: bool,
    },
    SetTpr,
    Debug(DebugExit),
    IoapicEoi(u8),
    Exception {
        exception: u32,
        error_code: u32,
    },
    Hypercall {
        nr: u64,
        args: [u64; 6],
    },
    FailEntry {
        hardware_entry_failure_reason: u64,
        cpu: u32,
    },
    Unknown {
        hardware_exit_reason: u64,
    },
    /// The run request was interrupted before or while in the guest,
    /// typically by a kick. Retry after processing pending events.
    Interrupted,
    /// An exit reason this client does not decode.
    Unsupported(u32),
}

impl VmExit<'_> {
    /// Detaches the exit from the run page. Returns `None` for IO and MMIO
    /// exits, whose payload lives in the run page.
    pub fn into_owned(self) -> Option<VmExit<'static>> {
        Some(match self {
            VmExit::IoIn { .. }
            | VmExit::IoOut { .. }
            | VmExit::MmioRead { .. }
            | VmExit::MmioWrite { .. } => return None,
            VmExit::Hlt => VmExit::Hlt,
            VmExit::IrqWindowOpen => VmExit::IrqWindowOpen,
            VmExit::Intr => VmExit::Intr,
            VmExit::Nmi => VmExit::Nmi,
            VmExit::Shutdown => VmExit::Shutdown,
            VmExit::SystemEvent { kind, flags } => VmExit::SystemEvent { kind, flags },
            VmExit::InternalError { suberror, data } => VmExit::InternalError { suberror, data },
            VmExit::TprAccess { rip, is_write } => VmExit::TprAccess { rip, is_write },
            VmExit::SetTpr => VmExit::SetTpr,
            VmExit::Debug(debug) => VmExit::Debug(debug),
            VmExit::IoapicEoi(vector) => VmExit::IoapicEoi(vector),
            VmExit::Exception {
                exception,
                error_code,
            } => VmExit::Exception {
                exception,
                error_code,
            },
            VmExit::Hypercall { nr, args } => VmExit::Hypercall { nr, args },
            VmExit::FailEntry {
                hardware_entry_failure_reason,
                cpu,
            } => VmExit::FailEntry {
                hardware_entry_failure_reason,
                cpu,
            },
            VmExit::Unknown {
                hardware_exit_reason,
            } => VmExit::Unknown {
                hardware_exit_reason,
            },
            VmExit::Interrupted => VmExit::Interrupted,
            VmExit::Unsupported(reason) => VmExit::Unsupported(reason),
        })
    }
}

/// A decoded exit together with the header fields refreshed by the
/// kernel on the same exit.
#[derive(Debug)]
pub struct RunExit<'a> {
    pub state: RunState,
    pub exit: VmExit<'a>,
}

///
/// Trait to represent a generic Vcpu
///
pub trait Vcpu: Send + Sync {
    ///
    /// Returns the vCPU id.
    ///
    fn id(&self) -> u32;
    ///
    /// Returns the vCPU general purpose registers.
    ///
    fn get_regs(&self) -> Result<StandardRegisters>;
    ///
    /// Sets the vCPU general purpose registers.
    ///
    fn set_regs(&self, regs: &StandardRegisters) -> Result<()>;
    ///
    /// Returns the vCPU special registers.
    ///
    fn get_sregs(&self) -> Result<SpecialRegisters>;
    ///
    /// Sets the vCPU special registers.
    ///
    fn set_sregs(&self, sregs: &SpecialRegisters) -> Result<()>;
    ///
    /// Returns the floating point state (FPU) from the vCPU.
    ///
    fn get_fpu(&self) -> Result<FpuState>;
    ///
    /// Set the floating point state (FPU) of a vCPU.
    ///
    fn set_fpu(&self, fpu: &FpuState) -> Result<()>;
    ///
    /// Returns the vCPU's XSAVE area.
    ///
    fn get_xsave(&self) -> Result<XsaveState>;
    ///
    /// Sets the vCPU's XSAVE area.
    ///
    fn set_xsave(&self, xsave: &XsaveState) -> Result<()>;
    ///
    /// Returns the vCPU's extended control registers.
    ///
    fn get_xcrs(&self) -> Result<ExtendedControlRegisters>;
    ///
    /// Sets the vCPU's extended control registers.
    ///
    fn set_xcrs(&self, xcrs: &ExtendedControlRegisters) -> Result<()>;
    ///
    /// Returns the state of the LAPIC (Local Advanced Programmable Interrupt Controller).
    ///
    fn get_lapic(&self) -> Result<LapicState>;
    ///
    /// Sets the state of the LAPIC (Local Advanced Programmable Interrupt Controller).
    ///
    fn set_lapic(&self, lapic: &LapicState) -> Result<()>;
    ///
    /// Reads the MSRs listed in `msrs`, filling in their data. Returns the
    /// number of entries processed, which stops at the first faulty MSR.
    ///
    fn get_msrs(&self, msrs: &mut [MsrEntry]) -> Result<usize>;
    ///
    /// Writes the MSRs in `msrs`. Returns the number of entries
    /// processed, which stops at the first faulty MSR.
    ///
    fn set_msrs(&self, msrs: &[MsrEntry]) -> Result<usize>;
    ///
    /// Returns the vcpu's current "multiprocessing state".
    ///
    fn get_mp_state(&self) -> Result<MpState>;
    ///
    /// Sets the vcpu's current "multiprocessing state".
    ///
    fn set_mp_state(&self, mp_state: MpState) -> Result<()>;
    ///
    /// Returns currently pending exceptions, interrupts, and NMIs as well as related
    /// states of the vcpu.
    ///
    fn get_vcpu_events(&self) -> Result<VcpuEvents>;
    ///
    /// Sets pending exceptions, interrupts, and NMIs as well as related states
    /// of the vcpu.
    ///
    fn set_vcpu_events(&self, events: &VcpuEvents) -> Result<()>;
    fn get_debug_regs(&self) -> Result<DebugRegisters>;
    fn set_debug_regs(&self, debug_regs: &DebugRegisters) -> Result<()>;
    ///
    /// Programs software/hardware breakpoints and single-stepping.
    ///
    fn set_guest_debug(&self, debug: &GuestDebug) -> Result<()>;
    ///
    /// Sets the guest CPUID table.
    ///
    fn set_cpuid2(&self, entries: &[CpuIdEntry]) -> Result<()>;
    ///
    /// Translates a guest virtual address through the guest page tables.
    ///
    fn translate_gva(&self, gva: u64) -> Result<TranslatedAddress>;
    ///
    /// Queues an external interrupt. Only valid without an in-kernel
    /// interrupt controller.
    ///
    fn inject_interrupt(&self, vector: u32) -> Result<()>;
    fn nmi(&self) -> Result<()>;
    fn smi(&self) -> Result<()>;
    ///
    /// Asks for an exit as soon as the guest can take an interrupt.
    ///
    fn set_request_interrupt_window(&mut self, request: bool) -> Result<()>;
    ///
    /// Sets the task priority handed to the guest on the next run.
    ///
    fn set_cr8(&mut self, cr8: u64) -> Result<()>;
    ///
    /// When set, the next run returns `Interrupted` without entering the guest.
    ///
    fn set_immediate_exit(&mut self, exit: bool) -> Result<()>;
    ///
    /// Triggers the running of the current virtual CPU returning an exit reason.
    ///
    fn run(&mut self) -> Result<RunExit<'_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_owned() {
        let mut buf = [0u8; 4];
        let exit = VmExit::MmioRead {
            addr: 0xd000_0000,
            data: &mut buf,
        };
        assert!(exit.into_owned().is_none());
        let exit = VmExit::IoOut {
            port: 0x3f8,
            size: 1,
            count: 1,
            data: &buf[..1],
        };
        assert!(exit.into_owned().is_none());

        let exit = VmExit::InternalError {
            suberror: InternalErrorKind::Emulation,
            data: vec![1, 2],
        };
        assert!(matches!(
            exit.into_owned(),
            Some(VmExit::InternalError {
                suberror: InternalErrorKind::Emulation,
                data,
            }) if data == [1, 2]
        ));
        assert!(matches!(
            VmExit::Unsupported(99).into_owned(),
            Some(VmExit::Unsupported(99))
        ));
    }
}
