// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Cached vCPU register state and its transfer to and from the kernel.

use std::collections::BTreeMap;

use hypervisor::arch::x86::msr_index::*;
use hypervisor::arch::x86::regs::{CR0_CD, CR0_ET, CR0_NW, DR6_INIT, DR7_INIT, RFLAGS_RESERVED};
use hypervisor::arch::x86::{
    cpuid_has_feature_control, CpuIdEntry, DebugRegisters, ExtendedControlRegisters, FpuState,
    LapicState, MpState, MsrEntry, SegmentRegister, SpecialRegisters, StandardRegisters,
    VcpuEvents, XsaveState, MAX_MSR_ENTRIES, MSR_MTRR_VARIABLE_COUNT,
    VCPU_EVENT_VALID_NMI_PENDING, VCPU_EVENT_VALID_SIPI_VECTOR,
};
use hypervisor::{msr_data, HypervisorCpuError, Vcpu};
use serde::Serialize;
use thiserror::Error;

use crate::config::IrqchipMode;
use crate::session::Session;

const DEFAULT_PHYS_BITS: u32 = 36;
const CPUID_EXT_ADDRESS_SIZES: u32 = 0x8000_0008;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to put {0} state")]
    Put(&'static str, #[source] HypervisorCpuError),

    #[error("Failed to get {0} state")]
    Get(&'static str, #[source] HypervisorCpuError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How much state a put writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegisterLevel {
    /// State the guest modifies while it runs.
    RuntimeOnly,
    /// Additionally state that changes on reset.
    ResetState,
    /// Everything, as after loading a snapshot.
    FullState,
}

/// Optional MSRs the host reported as supported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MsrFeatures {
    pub star: bool,
    pub hsave_pa: bool,
    pub tsc_aux: bool,
    pub tsc_adjust: bool,
    pub tsc_deadline: bool,
    pub smbase: bool,
    pub misc_enable: bool,
    pub bndcfgs: bool,
    pub xss: bool,
}

impl MsrFeatures {
    pub fn from_supported(msrs: &[u32]) -> Self {
        let mut features = MsrFeatures::default();
        for &index in msrs {
            match index {
                MSR_STAR => features.star = true,
                MSR_VM_HSAVE_PA => features.hsave_pa = true,
                MSR_TSC_AUX => features.tsc_aux = true,
                MSR_IA32_TSC_ADJUST => features.tsc_adjust = true,
                MSR_IA32_TSCDEADLINE => features.tsc_deadline = true,
                MSR_IA32_SMBASE => features.smbase = true,
                MSR_IA32_MISC_ENABLE => features.misc_enable = true,
                MSR_IA32_BNDCFGS => features.bndcfgs = true,
                MSR_IA32_XSS => features.xss = true,
                _ => {}
            }
        }
        features
    }
}

/// Per-vCPU copy of every register class.
///
/// Setters mark the snapshot dirty; a dirty snapshot is pushed to the
/// kernel before the vCPU next enters the guest.
#[derive(Clone, Debug, Default)]
pub struct RegisterSnapshot {
    regs: StandardRegisters,
    sregs: SpecialRegisters,
    fpu: FpuState,
    xsave: XsaveState,
    xcrs: ExtendedControlRegisters,
    msrs: BTreeMap<u32, u64>,
    mp_state: MpState,
    halted: bool,
    lapic: LapicState,
    events: VcpuEvents,
    debug_regs: DebugRegisters,
    interrupt_injected: Option<u8>,
    tsc_valid: bool,
    dirty: bool,
}

macro_rules! snapshot_accessors {
    ($($field:ident, $field_mut:ident: $ty:ty;)*) => {
        $(
            pub fn $field(&self) -> &$ty {
                &self.$field
            }

            pub fn $field_mut(&mut self) -> &mut $ty {
                self.dirty = true;
                &mut self.$field
            }
        )*
    };
}

impl RegisterSnapshot {
    snapshot_accessors! {
        regs, regs_mut: StandardRegisters;
        sregs, sregs_mut: SpecialRegisters;
        fpu, fpu_mut: FpuState;
        xsave, xsave_mut: XsaveState;
        xcrs, xcrs_mut: ExtendedControlRegisters;
        lapic, lapic_mut: LapicState;
        events, events_mut: VcpuEvents;
        debug_regs, debug_regs_mut: DebugRegisters;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn msr(&self, index: u32) -> Option<u64> {
        self.msrs.get(&index).copied()
    }

    pub fn msrs(&self) -> &BTreeMap<u32, u64> {
        &self.msrs
    }

    pub fn set_msr(&mut self, index: u32, value: u64) {
        self.msrs.insert(index, value);
        self.dirty = true;
    }

    pub fn mp_state(&self) -> MpState {
        self.mp_state
    }

    pub fn set_mp_state(&mut self, mp_state: MpState) {
        self.mp_state = mp_state;
        self.dirty = true;
    }

    /// Whether the in-kernel LAPIC reported the vCPU halted.
    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn interrupt_injected(&self) -> Option<u8> {
        self.interrupt_injected
    }

    pub fn set_interrupt_injected(&mut self, vector: Option<u8>) {
        self.interrupt_injected = vector;
        self.dirty = true;
    }

    /// Forces the TSC to be read again on the next get.
    pub fn invalidate_tsc(&mut self) {
        self.tsc_valid = false;
    }

    /// Puts the vCPU in the architectural state that follows INIT.
    pub fn reset_to_init(&mut self, bsp: bool) {
        self.regs = StandardRegisters {
            rip: 0xfff0,
            rflags: RFLAGS_RESERVED,
            rdx: 0x600,
            ..Default::default()
        };

        let data_seg = SegmentRegister {
            limit: 0xffff,
            type_: 3,
            present: 1,
            s: 1,
            ..Default::default()
        };
        let mut sregs = SpecialRegisters {
            cs: SegmentRegister {
                selector: 0xf000,
                base: 0xffff_0000,
                type_: 0xb,
                ..data_seg
            },
            ds: data_seg,
            es: data_seg,
            fs: data_seg,
            gs: data_seg,
            ss: data_seg,
            cr0: CR0_CD | CR0_NW | CR0_ET,
            ..Default::default()
        };
        sregs.tr.type_ = 0xb;
        sregs.tr.present = 1;
        sregs.tr.limit = 0xffff;
        sregs.ldt.type_ = 2;
        sregs.ldt.present = 1;
        sregs.ldt.limit = 0xffff;
        sregs.gdt.limit = 0xffff;
        sregs.idt.limit = 0xffff;
        sregs.apic_base = self.sregs.apic_base;
        self.sregs = sregs;

        self.fpu = FpuState {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        };
        self.xsave = XsaveState::default();
        self.xsave.region[0] = 0x37f;
        self.xsave.region[6] = 0x1f80;
        self.xcrs = ExtendedControlRegisters::default();
        self.xcrs.nr_xcrs = 1;
        self.xcrs.xcrs[0].value = 1;

        self.events = VcpuEvents::default();
        self.debug_regs = DebugRegisters {
            dr6: DR6_INIT,
            dr7: DR7_INIT,
            ..Default::default()
        };
        self.interrupt_injected = None;
        self.mp_state = if bsp {
            MpState::Runnable
        } else {
            MpState::Uninitialized
        };
        self.halted = false;
        self.dirty = true;
    }

    /// Starts the vCPU at the real-mode page given by a startup IPI.
    pub fn apply_sipi(&mut self, vector: u8) {
        self.sregs.cs.selector = u16::from(vector) << 8;
        self.sregs.cs.base = u64::from(vector) << 12;
        self.regs.rip = 0;
        self.mp_state = MpState::Runnable;
        self.halted = false;
        self.dirty = true;
    }

    pub fn crash_report(&self) -> CrashReport {
        CrashReport {
            rip: self.regs.rip,
            rsp: self.regs.rsp,
            rflags: self.regs.rflags,
            rax: self.regs.rax,
            rbx: self.regs.rbx,
            rcx: self.regs.rcx,
            rdx: self.regs.rdx,
            cr0: self.sregs.cr0,
            cr2: self.sregs.cr2,
            cr3: self.sregs.cr3,
            cr4: self.sregs.cr4,
            efer: self.sregs.efer,
            cs: self.sregs.cs.selector,
            ss: self.sregs.ss.selector,
            mp_state: self.mp_state,
            interrupt_injected: self.interrupt_injected,
            exception: self
                .events
                .exception
                .injected
                .ne(&0)
                .then_some(self.events.exception.nr),
            msrs: self.msrs.clone(),
        }
    }
}

/// Register summary logged when a vCPU dies.
#[derive(Clone, Debug, Serialize)]
pub struct CrashReport {
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub cs: u16,
    pub ss: u16,
    pub mp_state: MpState,
    pub interrupt_injected: Option<u8>,
    pub exception: Option<u8>,
    pub msrs: BTreeMap<u32, u64>,
}

/// Moves register snapshots between the cache and the kernel.
#[derive(Clone, Debug)]
pub struct VcpuStateSync {
    features: MsrFeatures,
    has_xsave: bool,
    has_xcrs: bool,
    has_smm: bool,
    feature_control: bool,
    kernel_lapic: bool,
    phys_addr_mask: u64,
}

impl VcpuStateSync {
    /// `guest_cpuid` is the table the vCPUs run with.
    pub fn new(session: &Session, guest_cpuid: &[CpuIdEntry]) -> Self {
        let caps = session.capabilities();
        let phys_bits = guest_cpuid
            .iter()
            .find(|e| e.function == CPUID_EXT_ADDRESS_SIZES)
            .map(|e| e.eax & 0xff)
            .filter(|&bits| bits > 0 && bits < 64)
            .unwrap_or(DEFAULT_PHYS_BITS);

        VcpuStateSync {
            features: MsrFeatures::from_supported(session.supported_msrs()),
            has_xsave: caps.xsave,
            has_xcrs: caps.xcrs,
            has_smm: caps.smm,
            feature_control: cpuid_has_feature_control(guest_cpuid),
            kernel_lapic: session.config().kernel_irqchip != IrqchipMode::Off,
            phys_addr_mask: (1u64 << phys_bits) - 1,
        }
    }

    pub fn features(&self) -> &MsrFeatures {
        &self.features
    }

    /// MSRs written in the main batch at `level`.
    pub fn msr_list(&self, level: RegisterLevel) -> Vec<u32> {
        let f = &self.features;
        let mut msrs = vec![
            MSR_IA32_SYSENTER_CS,
            MSR_IA32_SYSENTER_ESP,
            MSR_IA32_SYSENTER_EIP,
            MSR_IA32_CR_PAT,
        ];
        let optional = [
            (f.star, MSR_STAR),
            (f.hsave_pa, MSR_VM_HSAVE_PA),
            (f.tsc_aux, MSR_TSC_AUX),
            (f.tsc_adjust, MSR_IA32_TSC_ADJUST),
            (f.misc_enable, MSR_IA32_MISC_ENABLE),
            (f.smbase && self.has_smm, MSR_IA32_SMBASE),
            (f.bndcfgs, MSR_IA32_BNDCFGS),
            (f.xss, MSR_IA32_XSS),
        ];
        msrs.extend(optional.iter().filter(|(on, _)| *on).map(|(_, msr)| *msr));
        msrs.extend([MSR_CSTAR, MSR_KERNEL_GS_BASE, MSR_SYSCALL_MASK, MSR_LSTAR]);

        if level >= RegisterLevel::ResetState {
            msrs.extend([
                MSR_IA32_TSC,
                MSR_KVM_SYSTEM_TIME_NEW,
                MSR_KVM_WALL_CLOCK_NEW,
                MSR_MTRRdefType,
            ]);
            msrs.extend(MTRR_FIXED_MSRS);
            for n in 0..MSR_MTRR_VARIABLE_COUNT {
                msrs.push(msr_mtrr_phys_base(n));
                msrs.push(msr_mtrr_phys_mask(n));
            }
        }
        msrs
    }

    fn is_mtrr_mask(index: u32) -> bool {
        (0..MSR_MTRR_VARIABLE_COUNT).any(|n| msr_mtrr_phys_mask(n) == index)
    }

    /// Writes `entries` in batches, skipping each entry the kernel refuses.
    fn set_msr_batch(&self, vcpu: &dyn Vcpu, entries: &[MsrEntry]) -> Result<()> {
        for chunk in entries.chunks(MAX_MSR_ENTRIES) {
            let mut remaining = chunk.len();
            while remaining > 0 {
                let start = chunk.len() - remaining;
                let done = vcpu
                    .set_msrs(&chunk[start..])
                    .map_err(|e| Error::Put("MSR", e))?;
                if done >= remaining {
                    break;
                }
                warn!(
                    "vCPU {}: failed to set MSR {:#x}, skipping it",
                    vcpu.id(),
                    chunk[start + done].index
                );
                remaining -= done + 1;
            }
        }
        Ok(())
    }

    /// Reads `entries` in batches. Entries the kernel refuses are dropped
    /// from the returned list.
    fn get_msr_batch(&self, vcpu: &dyn Vcpu, mut entries: Vec<MsrEntry>) -> Result<Vec<MsrEntry>> {
        let mut read = Vec::with_capacity(entries.len());
        for chunk in entries.chunks_mut(MAX_MSR_ENTRIES) {
            let mut remaining = chunk.len();
            while remaining > 0 {
                let start = chunk.len() - remaining;
                let done = vcpu
                    .get_msrs(&mut chunk[start..])
                    .map_err(|e| Error::Get("MSR", e))?;
                read.extend_from_slice(&chunk[start..start + done.min(remaining)]);
                if done >= remaining {
                    break;
                }
                warn!(
                    "vCPU {}: failed to get MSR {:#x}, skipping it",
                    vcpu.id(),
                    chunk[start + done].index
                );
                remaining -= done + 1;
            }
        }
        Ok(read)
    }

    pub fn put_registers(
        &self,
        vcpu: &dyn Vcpu,
        snap: &mut RegisterSnapshot,
        level: RegisterLevel,
    ) -> Result<()> {
        // Writing feature control can take the vCPU out of nested mode,
        // which would discard anything written before it.
        if level >= RegisterLevel::ResetState && self.feature_control {
            let value = snap.msr(MSR_IA32_FEATURE_CONTROL).unwrap_or(0);
            self.set_msr_batch(vcpu, &[msr_data!(MSR_IA32_FEATURE_CONTROL, value)])?;
        }

        vcpu.set_regs(&snap.regs)
            .map_err(|e| Error::Put("general purpose register", e))?;
        if self.has_xsave {
            vcpu.set_xsave(&snap.xsave)
                .map_err(|e| Error::Put("XSAVE", e))?;
        } else {
            vcpu.set_fpu(&snap.fpu).map_err(|e| Error::Put("FPU", e))?;
        }
        if self.has_xcrs {
            vcpu.set_xcrs(&snap.xcrs).map_err(|e| Error::Put("XCR", e))?;
        }

        let mut sregs = snap.sregs;
        sregs.interrupt_bitmap = [0; 4];
        if let Some(vector) = snap.interrupt_injected {
            sregs.interrupt_bitmap[usize::from(vector) / 64] |= 1 << (vector % 64);
        }
        vcpu.set_sregs(&sregs)
            .map_err(|e| Error::Put("special register", e))?;

        let entries: Vec<MsrEntry> = self
            .msr_list(level)
            .into_iter()
            .map(|index| {
                let mut value = snap.msr(index).unwrap_or(0);
                if Self::is_mtrr_mask(index) {
                    value &= self.phys_addr_mask;
                }
                msr_data!(index, value)
            })
            .collect();
        self.set_msr_batch(vcpu, &entries)?;

        if level >= RegisterLevel::ResetState {
            vcpu.set_mp_state(snap.mp_state)
                .map_err(|e| Error::Put("MP", e))?;
            if self.kernel_lapic {
                vcpu.set_lapic(&snap.lapic)
                    .map_err(|e| Error::Put("LAPIC", e))?;
            }
        }

        // The deadline is only meaningful once the LAPIC is in place.
        if self.features.tsc_deadline && self.kernel_lapic {
            let value = snap.msr(MSR_IA32_TSCDEADLINE).unwrap_or(0);
            self.set_msr_batch(vcpu, &[msr_data!(MSR_IA32_TSCDEADLINE, value)])?;
        }

        let mut events = snap.events;
        if level >= RegisterLevel::ResetState {
            events.flags |= VCPU_EVENT_VALID_NMI_PENDING | VCPU_EVENT_VALID_SIPI_VECTOR;
        }
        vcpu.set_vcpu_events(&events)
            .map_err(|e| Error::Put("vCPU event", e))?;
        vcpu.set_debug_regs(&snap.debug_regs)
            .map_err(|e| Error::Put("debug register", e))?;

        snap.dirty = false;
        Ok(())
    }

    pub fn get_registers(&self, vcpu: &dyn Vcpu, snap: &mut RegisterSnapshot) -> Result<()> {
        snap.regs = vcpu
            .get_regs()
            .map_err(|e| Error::Get("general purpose register", e))?;
        if self.has_xsave {
            snap.xsave = vcpu.get_xsave().map_err(|e| Error::Get("XSAVE", e))?;
        } else {
            snap.fpu = vcpu.get_fpu().map_err(|e| Error::Get("FPU", e))?;
        }
        if self.has_xcrs {
            snap.xcrs = vcpu.get_xcrs().map_err(|e| Error::Get("XCR", e))?;
        }

        snap.sregs = vcpu
            .get_sregs()
            .map_err(|e| Error::Get("special register", e))?;
        snap.interrupt_injected = snap
            .sregs
            .interrupt_bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != 0)
            .map(|(i, word)| (i * 64) as u8 + word.trailing_zeros() as u8);

        let mut indices = self.msr_list(RegisterLevel::FullState);
        if snap.tsc_valid {
            indices.retain(|&i| i != MSR_IA32_TSC);
        }
        if self.feature_control {
            indices.push(MSR_IA32_FEATURE_CONTROL);
        }
        if self.features.tsc_deadline && self.kernel_lapic {
            indices.push(MSR_IA32_TSCDEADLINE);
        }
        let entries = indices.into_iter().map(|i| msr_data!(i, 0)).collect();
        for entry in self.get_msr_batch(vcpu, entries)? {
            if entry.index == MSR_IA32_TSC {
                snap.tsc_valid = true;
            }
            snap.msrs.insert(entry.index, entry.data);
        }

        snap.mp_state = vcpu.get_mp_state().map_err(|e| Error::Get("MP", e))?;
        if self.kernel_lapic {
            snap.halted = snap.mp_state == MpState::Halted;
            snap.lapic = vcpu.get_lapic().map_err(|e| Error::Get("LAPIC", e))?;
        }
        snap.events = vcpu
            .get_vcpu_events()
            .map_err(|e| Error::Get("vCPU event", e))?;
        snap.debug_regs = vcpu
            .get_debug_regs()
            .map_err(|e| Error::Get("debug register", e))?;

        snap.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use hypervisor::arch::x86::CPUID_1_ECX_VMX;
    use hypervisor::mock::{MockHypervisor, MockVcpuState};

    use super::*;
    use crate::config::AccelConfig;
    use crate::test_utils::{mock_session, session_guard};

    fn sync_for(session: &Session) -> VcpuStateSync {
        let cpuid = vec![CpuIdEntry {
            function: 1,
            ecx: CPUID_1_ECX_VMX,
            ..Default::default()
        }];
        VcpuStateSync::new(session, &cpuid)
    }

    fn populated_snapshot(sync: &VcpuStateSync) -> RegisterSnapshot {
        let mut snap = RegisterSnapshot::default();
        snap.regs_mut().rip = 0x10_0000;
        snap.regs_mut().rax = 0xdead_beef;
        snap.regs_mut().rflags = 0x202;
        snap.sregs_mut().cr0 = 0x8000_0011;
        snap.sregs_mut().efer = 0x500;
        snap.sregs_mut().cs.selector = 0x10;
        snap.set_interrupt_injected(Some(0x71));
        snap.xsave_mut().region[0] = 0x37f;
        snap.xcrs_mut().nr_xcrs = 1;
        snap.xcrs_mut().xcrs[0].value = 7;
        for (n, index) in sync
            .msr_list(RegisterLevel::FullState)
            .into_iter()
            .enumerate()
        {
            snap.set_msr(index, 0x1000 + n as u64);
        }
        snap.set_msr(MSR_IA32_FEATURE_CONTROL, 5);
        snap.set_mp_state(MpState::Halted);
        snap.lapic_mut().set_reg(0x80, 0x20);
        snap.events_mut().nmi.pending = 1;
        snap.events_mut().exception.nr = 14;
        snap.debug_regs_mut().dr7 = 0x400;
        snap
    }

    fn msr_writes(state: &MockVcpuState) -> BTreeMap<u32, u64> {
        state.msrs.lock().unwrap().clone()
    }

    #[test]
    fn test_msr_features() {
        let features =
            MsrFeatures::from_supported(&[MSR_STAR, MSR_IA32_TSCDEADLINE, MSR_IA32_XSS, 0x1234]);
        assert!(features.star && features.tsc_deadline && features.xss);
        assert!(!features.hsave_pa && !features.tsc_aux && !features.bndcfgs);
    }

    #[test]
    fn test_msr_list_levels() {
        let _guard = session_guard();
        let hv = MockHypervisor::new().with_msr_list(&[MSR_STAR, MSR_TSC_AUX]);
        let (session, _state) = mock_session(hv, AccelConfig::default());
        let sync = sync_for(&session);

        let runtime = sync.msr_list(RegisterLevel::RuntimeOnly);
        assert_eq!(runtime.len(), 4 + 2 + 4);
        assert!(runtime.contains(&MSR_STAR) && runtime.contains(&MSR_TSC_AUX));
        assert!(!runtime.contains(&MSR_IA32_TSC));

        let reset = sync.msr_list(RegisterLevel::ResetState);
        assert_eq!(reset.len(), runtime.len() + 4 + 11 + 16);
        assert!(reset.len() <= MAX_MSR_ENTRIES);
        assert_eq!(reset, sync.msr_list(RegisterLevel::FullState));
    }

    #[test]
    fn test_full_state_roundtrip() {
        let _guard = session_guard();
        let hv = MockHypervisor::new().with_msr_list(&[MSR_STAR, MSR_IA32_TSCDEADLINE]);
        let (session, state) = mock_session(hv, AccelConfig::default());
        let sync = sync_for(&session);
        let vcpu = session.create_vcpu(0).unwrap();

        let mut snap = populated_snapshot(&sync);
        snap.set_msr(MSR_IA32_TSCDEADLINE, 0x9999);
        assert!(snap.is_dirty());
        sync.put_registers(vcpu.as_ref(), &mut snap, RegisterLevel::FullState)
            .unwrap();
        assert!(!snap.is_dirty());
        let vcpu_state = state.vcpu(0);
        assert_eq!(vcpu_state.msr(MSR_IA32_FEATURE_CONTROL), Some(5));

        let mut read = RegisterSnapshot::default();
        sync.get_registers(vcpu.as_ref(), &mut read).unwrap();

        assert_eq!(read.regs().rip, snap.regs().rip);
        assert_eq!(read.regs().rax, snap.regs().rax);
        assert_eq!(read.regs().rflags, snap.regs().rflags);
        assert_eq!(read.sregs().cr0, snap.sregs().cr0);
        assert_eq!(read.sregs().efer, snap.sregs().efer);
        assert_eq!(read.sregs().cs.selector, 0x10);
        assert_eq!(read.interrupt_injected(), Some(0x71));
        assert_eq!(read.xsave(), snap.xsave());
        assert_eq!(read.xcrs().xcrs[0].value, 7);
        assert_eq!(read.msrs(), snap.msrs());
        assert_eq!(read.mp_state(), MpState::Halted);
        assert!(read.halted());
        assert_eq!(read.lapic(), snap.lapic());
        assert_eq!(read.events().nmi.pending, 1);
        assert_eq!(read.events().exception.nr, 14);
        assert_eq!(read.debug_regs().dr7, 0x400);
        assert_eq!(msr_writes(&vcpu_state).len(), snap.msrs().len());
    }

    #[test]
    fn test_runtime_put_skips_reset_state() {
        let _guard = session_guard();
        let (session, state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let sync = sync_for(&session);
        let vcpu = session.create_vcpu(0).unwrap();

        let mut snap = populated_snapshot(&sync);
        sync.put_registers(vcpu.as_ref(), &mut snap, RegisterLevel::RuntimeOnly)
            .unwrap();
        let vcpu_state = state.vcpu(0);
        assert_eq!(vcpu_state.msr(MSR_IA32_FEATURE_CONTROL), None);
        assert_eq!(vcpu_state.msr(MSR_IA32_TSC), None);
        assert_eq!(*vcpu_state.mp_state.lock().unwrap(), MpState::Runnable);
        assert_eq!(vcpu_state.lapic.lock().unwrap().get_reg(0x80), 0);
        assert_eq!(vcpu_state.events.lock().unwrap().flags, 0);

        sync.put_registers(vcpu.as_ref(), &mut snap, RegisterLevel::ResetState)
            .unwrap();
        assert_eq!(
            vcpu_state.events.lock().unwrap().flags,
            VCPU_EVENT_VALID_NMI_PENDING | VCPU_EVENT_VALID_SIPI_VECTOR
        );
    }

    #[test]
    fn test_faulty_msr_is_skipped() {
        let _guard = session_guard();
        let (session, state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let sync = sync_for(&session);
        let vcpu = session.create_vcpu(0).unwrap();
        let vcpu_state = state.vcpu(0);
        vcpu_state
            .faulty_msrs
            .lock()
            .unwrap()
            .insert(MSR_IA32_CR_PAT);

        let mut snap = populated_snapshot(&sync);
        sync.put_registers(vcpu.as_ref(), &mut snap, RegisterLevel::RuntimeOnly)
            .unwrap();
        let written = msr_writes(&vcpu_state);
        assert!(!written.contains_key(&MSR_IA32_CR_PAT));
        assert!(written.contains_key(&MSR_LSTAR));
        assert_eq!(written.len(), sync.msr_list(RegisterLevel::RuntimeOnly).len() - 1);

        let mut read = RegisterSnapshot::default();
        sync.get_registers(vcpu.as_ref(), &mut read).unwrap();
        assert_eq!(read.msr(MSR_IA32_CR_PAT), None);
        assert!(read.msr(MSR_LSTAR).is_some());
    }

    #[test]
    fn test_mtrr_mask_is_clipped() {
        let _guard = session_guard();
        let (session, state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let sync = sync_for(&session);
        let vcpu = session.create_vcpu(0).unwrap();

        let mut snap = RegisterSnapshot::default();
        snap.set_msr(msr_mtrr_phys_mask(0), 0xffff_ffff_f000_0800);
        sync.put_registers(vcpu.as_ref(), &mut snap, RegisterLevel::FullState)
            .unwrap();
        assert_eq!(
            state.vcpu(0).msr(msr_mtrr_phys_mask(0)),
            Some(0xf_f000_0800)
        );
    }

    #[test]
    fn test_tsc_read_once_while_valid() {
        let _guard = session_guard();
        let (session, state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let sync = sync_for(&session);
        let vcpu = session.create_vcpu(0).unwrap();
        let vcpu_state = state.vcpu(0);
        vcpu_state.msrs.lock().unwrap().insert(MSR_IA32_TSC, 100);

        let mut snap = RegisterSnapshot::default();
        sync.get_registers(vcpu.as_ref(), &mut snap).unwrap();
        assert_eq!(snap.msr(MSR_IA32_TSC), Some(100));

        vcpu_state.msrs.lock().unwrap().insert(MSR_IA32_TSC, 200);
        sync.get_registers(vcpu.as_ref(), &mut snap).unwrap();
        assert_eq!(snap.msr(MSR_IA32_TSC), Some(100));

        snap.invalidate_tsc();
        sync.get_registers(vcpu.as_ref(), &mut snap).unwrap();
        assert_eq!(snap.msr(MSR_IA32_TSC), Some(200));
    }

    #[test]
    fn test_fpu_without_xsave() {
        let _guard = session_guard();
        let hv = MockHypervisor::new()
            .without_capability(hypervisor::Capability::Xsave)
            .without_capability(hypervisor::Capability::Xcrs);
        let (session, state) = mock_session(hv, AccelConfig::default());
        let sync = sync_for(&session);
        let vcpu = session.create_vcpu(0).unwrap();

        let mut snap = RegisterSnapshot::default();
        snap.fpu_mut().fcw = 0x37f;
        snap.xsave_mut().region[0] = 0x1234;
        sync.put_registers(vcpu.as_ref(), &mut snap, RegisterLevel::RuntimeOnly)
            .unwrap();
        let vcpu_state = state.vcpu(0);
        assert_eq!(vcpu_state.fpu.lock().unwrap().fcw, 0x37f);
        assert_eq!(vcpu_state.xsave.lock().unwrap().region[0], 0);
    }

    #[test]
    fn test_reset_and_sipi() {
        let mut snap = RegisterSnapshot::default();
        snap.reset_to_init(false);
        assert_eq!(snap.regs().rip, 0xfff0);
        assert_eq!(snap.sregs().cs.base, 0xffff_0000);
        assert_eq!(snap.mp_state(), MpState::Uninitialized);

        snap.apply_sipi(0x9a);
        assert_eq!(snap.sregs().cs.selector, 0x9a00);
        assert_eq!(snap.sregs().cs.base, 0x9_a000);
        assert_eq!(snap.regs().rip, 0);
        assert_eq!(snap.mp_state(), MpState::Runnable);
        assert!(snap.is_dirty());
    }

    #[test]
    fn test_crash_report_serializes() {
        let mut snap = RegisterSnapshot::default();
        snap.regs_mut().rip = 0x1234;
        snap.set_msr(MSR_LSTAR, 0xffff_8000_0000_0000);
        let json = serde_json::to_string(&snap.crash_report()).unwrap();
        assert!(json.contains("\"rip\":4660"));
        assert!(json.contains("\"mp_state\":\"Runnable\""));
    }
}
