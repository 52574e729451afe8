// Copyright © 2020, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! In-process backend that replays scripted exits.
//!
//! Every request is recorded so that callers can check what would have
//! reached the kernel. vCPU exits are served from a per-vCPU queue of run
//! pages built with [`RunPageBuilder`] and decoded by the same codec as the
//! kernel backend. Guest virtual addresses translate to themselves.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::arch::x86::irqchip::{IrqchipKind, IrqchipState, IoapicState, PicState};
use crate::arch::x86::run_page::{self, RunPageBuilder, SYSTEM_EVENT_SHUTDOWN};
use crate::arch::x86::{
    CpuIdEntry, DebugRegisters, ExtendedControlRegisters, FpuState, GuestDebug, LapicState,
    MpState, MsrEntry, SpecialRegisters, StandardRegisters, VcpuEvents, XsaveState,
};
use crate::cpu::{self, RunExit, TranslatedAddress, Vcpu, VmExit};
use crate::hypervisor::{self, Capability, Hypervisor};
use crate::vm::{self, IrqRoutingEntry, UserMemoryRegion, Vm};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// VM-level requests that carry no other observable state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockVmRequest {
    TssAddress(u64),
    IdentityMapAddress(u64),
    BootCpuId(u32),
    CreateIrqChip,
    SplitIrqchip,
    EnableCap(Capability, [u64; 4]),
}

/// Inputs written into the run page before a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunInputs {
    pub request_interrupt_window: bool,
    pub cr8: u64,
    pub immediate_exit: bool,
}

/// Observable state of one mock vCPU.
pub struct MockVcpuState {
    pub regs: Mutex<StandardRegisters>,
    pub sregs: Mutex<SpecialRegisters>,
    pub fpu: Mutex<FpuState>,
    pub xsave: Mutex<XsaveState>,
    pub xcrs: Mutex<ExtendedControlRegisters>,
    pub lapic: Mutex<LapicState>,
    pub mp_state: Mutex<MpState>,
    pub events: Mutex<VcpuEvents>,
    pub debug_regs: Mutex<DebugRegisters>,
    pub msrs: Mutex<BTreeMap<u32, u64>>,
    /// MSR indices the kernel refuses; batches stop at the first of them.
    pub faulty_msrs: Mutex<HashSet<u32>>,
    pub cpuid: Mutex<Vec<CpuIdEntry>>,
    /// Every guest debug configuration applied, oldest first.
    pub guest_debug: Mutex<Vec<GuestDebug>>,
    pub injected: Mutex<Vec<u32>>,
    pub nmis: Mutex<usize>,
    pub smis: Mutex<usize>,
    /// Guest virtual pages (4 KiB aligned) that fail translation.
    pub unmapped: Mutex<HashSet<u64>>,
    pub inputs: Mutex<RunInputs>,
    script: Mutex<VecDeque<Vec<u8>>>,
    /// Run pages as left by the exit handler, oldest first.
    completed: Mutex<Vec<Vec<u8>>>,
    runs: Mutex<usize>,
}

impl Default for MockVcpuState {
    fn default() -> Self {
        MockVcpuState {
            regs: Mutex::new(StandardRegisters::default()),
            sregs: Mutex::new(SpecialRegisters::default()),
            fpu: Mutex::new(FpuState::default()),
            xsave: Mutex::new(XsaveState::default()),
            xcrs: Mutex::new(ExtendedControlRegisters::default()),
            lapic: Mutex::new(LapicState::default()),
            mp_state: Mutex::new(MpState::Runnable),
            events: Mutex::new(VcpuEvents::default()),
            debug_regs: Mutex::new(DebugRegisters::default()),
            msrs: Mutex::new(BTreeMap::new()),
            faulty_msrs: Mutex::new(HashSet::new()),
            cpuid: Mutex::new(Vec::new()),
            guest_debug: Mutex::new(Vec::new()),
            injected: Mutex::new(Vec::new()),
            nmis: Mutex::new(0),
            smis: Mutex::new(0),
            unmapped: Mutex::new(HashSet::new()),
            inputs: Mutex::new(RunInputs::default()),
            script: Mutex::new(VecDeque::new()),
            completed: Mutex::new(Vec::new()),
            runs: Mutex::new(0),
        }
    }
}

impl MockVcpuState {
    /// Queues an exit to be returned by a later run.
    pub fn push_exit(&self, page: Vec<u8>) {
        lock(&self.script).push_back(page);
    }

    pub fn pending_exits(&self) -> usize {
        lock(&self.script).len()
    }

    /// Run pages after the exit handler filled in any IO/MMIO read data.
    pub fn completed_pages(&self) -> Vec<Vec<u8>> {
        lock(&self.completed).clone()
    }

    /// Number of run requests that entered the (mock) guest.
    pub fn runs(&self) -> usize {
        *lock(&self.runs)
    }

    pub fn msr(&self, index: u32) -> Option<u64> {
        lock(&self.msrs).get(&index).copied()
    }

    pub fn last_guest_debug(&self) -> Option<GuestDebug> {
        lock(&self.guest_debug).last().copied()
    }
}

/// Observable state of the mock VM, shared with whoever built the
/// hypervisor.
#[derive(Default)]
pub struct MockVmState {
    pub requests: Mutex<Vec<MockVmRequest>>,
    /// Every memory slot request, in order.
    pub region_log: Mutex<Vec<UserMemoryRegion>>,
    /// Currently installed slots.
    pub slots: Mutex<BTreeMap<u32, UserMemoryRegion>>,
    /// Every routing table committed, in order.
    pub routing_commits: Mutex<Vec<Vec<IrqRoutingEntry>>>,
    pub irq_lines: Mutex<Vec<(u32, bool)>>,
    /// Status reported for line changes; positive means delivered.
    pub irq_line_status: Mutex<i32>,
    pub irqchips: Mutex<HashMap<IrqchipKind, IrqchipState>>,
    /// Dirty bitmaps handed out by the next log fetch of a slot.
    pub dirty_logs: Mutex<HashMap<u32, Vec<u64>>>,
    /// Makes routing table commits fail while set.
    pub fail_gsi_routing: AtomicBool,
    /// Makes memory slot requests fail while set.
    pub fail_user_memory_region: AtomicBool,
    vcpus: Mutex<HashMap<u32, Arc<MockVcpuState>>>,
}

impl MockVmState {
    /// Returns the state of vCPU `id`, creating it if needed so that exits
    /// can be scripted before the vCPU exists.
    pub fn vcpu(&self, id: u32) -> Arc<MockVcpuState> {
        lock(&self.vcpus).entry(id).or_default().clone()
    }

    pub fn last_routing(&self) -> Option<Vec<IrqRoutingEntry>> {
        lock(&self.routing_commits).last().cloned()
    }

    pub fn routing_commit_count(&self) -> usize {
        lock(&self.routing_commits).len()
    }

    pub fn slot(&self, slot: u32) -> Option<UserMemoryRegion> {
        lock(&self.slots).get(&slot).copied()
    }
}

/// Mock hypervisor with a configurable capability set.
pub struct MockHypervisor {
    caps: Mutex<HashMap<Capability, i32>>,
    vm_state: Arc<MockVmState>,
    msr_list: Vec<u32>,
    supported_cpuid: Vec<CpuIdEntry>,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    /// A hypervisor advertising what a recent host kernel does.
    pub fn new() -> Self {
        let caps = [
            (Capability::Irqchip, 1),
            (Capability::Hlt, 1),
            (Capability::NrVcpus, 8),
            (Capability::NrMemslots, 32),
            (Capability::UserNmi, 1),
            (Capability::IrqRouting, 4096),
            (Capability::SetBootCpuId, 1),
            (Capability::SetIdentityMapAddr, 1),
            (Capability::Xsave, 1),
            (Capability::Xcrs, 1),
            (Capability::MaxVcpus, 288),
            (Capability::ReadonlyMem, 1),
            (Capability::CheckExtensionVm, 1),
            (Capability::X86Smm, 1),
            (Capability::MultiAddressSpace, 2),
            (Capability::GuestDebugHwBps, 4),
            (Capability::SplitIrqchip, 1),
            (Capability::ImmediateExit, 1),
            (Capability::MaxVcpuId, 1023),
        ];
        let supported_cpuid = vec![CpuIdEntry {
            function: 1,
            ecx: crate::arch::x86::CPUID_1_ECX_VMX,
            ..Default::default()
        }];
        MockHypervisor {
            caps: Mutex::new(caps.into_iter().collect()),
            vm_state: Arc::new(MockVmState::default()),
            msr_list: Vec::new(),
            supported_cpuid,
        }
    }

    pub fn with_capability(self, cap: Capability, value: i32) -> Self {
        lock(&self.caps).insert(cap, value);
        self
    }

    pub fn without_capability(self, cap: Capability) -> Self {
        lock(&self.caps).remove(&cap);
        self
    }

    /// MSR indices reported as supported by the host.
    pub fn with_msr_list(mut self, msrs: &[u32]) -> Self {
        self.msr_list = msrs.to_vec();
        self
    }

    pub fn with_supported_cpuid(mut self, entries: Vec<CpuIdEntry>) -> Self {
        self.supported_cpuid = entries;
        self
    }

    pub fn vm_state(&self) -> Arc<MockVmState> {
        self.vm_state.clone()
    }
}

impl Hypervisor for MockHypervisor {
    fn api_version(&self) -> hypervisor::Result<i32> {
        Ok(12)
    }

    fn create_vm(&self) -> hypervisor::Result<Arc<dyn Vm>> {
        Ok(Arc::new(MockVm {
            caps: lock(&self.caps).clone(),
            state: self.vm_state.clone(),
        }))
    }

    fn check_extension(&self, cap: Capability) -> i32 {
        lock(&self.caps).get(&cap).copied().unwrap_or(0)
    }

    fn get_supported_cpuid(&self) -> hypervisor::Result<Vec<CpuIdEntry>> {
        Ok(self.supported_cpuid.clone())
    }

    fn get_emulated_cpuid(&self) -> hypervisor::Result<Vec<CpuIdEntry>> {
        Ok(Vec::new())
    }

    fn get_msr_list(&self) -> hypervisor::Result<Vec<u32>> {
        Ok(self.msr_list.clone())
    }
}

pub struct MockVm {
    caps: HashMap<Capability, i32>,
    state: Arc<MockVmState>,
}

impl MockVm {
    fn record(&self, req: MockVmRequest) {
        debug!("mock vm request {:?}", req);
        lock(&self.state.requests).push(req);
    }
}

impl Vm for MockVm {
    fn check_extension(&self, cap: Capability) -> i32 {
        self.caps.get(&cap).copied().unwrap_or(0)
    }

    fn create_vcpu(&self, id: u32) -> vm::Result<Box<dyn Vcpu>> {
        Ok(Box::new(MockVcpu {
            id,
            state: self.state.vcpu(id),
            page: RunPageBuilder::new().build(),
        }))
    }

    fn set_tss_address(&self, addr: u64) -> vm::Result<()> {
        self.record(MockVmRequest::TssAddress(addr));
        Ok(())
    }

    fn set_identity_map_address(&self, addr: u64) -> vm::Result<()> {
        self.record(MockVmRequest::IdentityMapAddress(addr));
        Ok(())
    }

    fn set_boot_cpu_id(&self, id: u32) -> vm::Result<()> {
        self.record(MockVmRequest::BootCpuId(id));
        Ok(())
    }

    fn create_irq_chip(&self) -> vm::Result<()> {
        self.record(MockVmRequest::CreateIrqChip);
        let mut chips = lock(&self.state.irqchips);
        chips.insert(
            IrqchipKind::PicMaster,
            IrqchipState::PicMaster(PicState::default()),
        );
        chips.insert(
            IrqchipKind::PicSlave,
            IrqchipState::PicSlave(PicState::default()),
        );
        chips.insert(
            IrqchipKind::Ioapic,
            IrqchipState::Ioapic(IoapicState {
                base_address: 0xfec0_0000,
                ..Default::default()
            }),
        );
        Ok(())
    }

    fn enable_split_irq(&self) -> vm::Result<()> {
        self.record(MockVmRequest::SplitIrqchip);
        Ok(())
    }

    fn enable_cap(&self, cap: Capability, args: [u64; 4]) -> vm::Result<()> {
        if !self.caps.contains_key(&cap) {
            return Err(vm::HypervisorVmError::EnableCap(anyhow!(
                "capability {:?} not supported",
                cap
            )));
        }
        self.record(MockVmRequest::EnableCap(cap, args));
        Ok(())
    }

    fn get_irqchip(&self, kind: IrqchipKind) -> vm::Result<IrqchipState> {
        lock(&self.state.irqchips)
            .get(&kind)
            .copied()
            .ok_or_else(|| vm::HypervisorVmError::GetIrqchip(anyhow!("no irqchip {:?}", kind)))
    }

    fn set_irqchip(&self, state: &IrqchipState) -> vm::Result<()> {
        let mut chips = lock(&self.state.irqchips);
        if !chips.contains_key(&state.kind()) {
            return Err(vm::HypervisorVmError::SetIrqchip(anyhow!(
                "no irqchip {:?}",
                state.kind()
            )));
        }
        chips.insert(state.kind(), *state);
        Ok(())
    }

    fn irq_line(&self, gsi: u32, level: bool) -> vm::Result<i32> {
        lock(&self.state.irq_lines).push((gsi, level));
        Ok(*lock(&self.state.irq_line_status))
    }

    fn set_gsi_routing(&self, entries: &[IrqRoutingEntry]) -> vm::Result<()> {
        if self.state.fail_gsi_routing.load(Ordering::SeqCst) {
            return Err(vm::HypervisorVmError::SetGsiRouting(anyhow!(
                "routing commit rejected"
            )));
        }
        lock(&self.state.routing_commits).push(entries.to_vec());
        Ok(())
    }

    fn set_user_memory_region(&self, region: UserMemoryRegion) -> vm::Result<()> {
        if self.state.fail_user_memory_region.load(Ordering::SeqCst) {
            return Err(vm::HypervisorVmError::SetUserMemory(anyhow!(
                "slot {} rejected",
                region.slot
            )));
        }
        lock(&self.state.region_log).push(region);
        let mut slots = lock(&self.state.slots);
        if region.memory_size == 0 {
            slots.remove(&region.slot);
        } else {
            slots.insert(region.slot, region);
        }
        Ok(())
    }

    fn get_dirty_log(&self, slot: u32, memory_size: u64) -> vm::Result<Vec<u64>> {
        if !lock(&self.state.slots).contains_key(&slot) {
            return Err(vm::HypervisorVmError::GetDirtyLog(anyhow!(
                "slot {:#x} not installed",
                slot
            )));
        }
        let pages = memory_size.div_ceil(4096);
        let words = pages.div_ceil(64) as usize;
        let mut bitmap = lock(&self.state.dirty_logs)
            .remove(&slot)
            .unwrap_or_default();
        bitmap.resize(words, 0);
        Ok(bitmap)
    }
}

pub struct MockVcpu {
    id: u32,
    state: Arc<MockVcpuState>,
    page: Vec<u8>,
}

impl MockVcpu {
    fn shutdown_page() -> Vec<u8> {
        RunPageBuilder::new()
            .system_event(SYSTEM_EVENT_SHUTDOWN, 0)
            .build()
    }
}

impl Vcpu for MockVcpu {
    fn id(&self) -> u32 {
        self.id
    }

    fn get_regs(&self) -> cpu::Result<StandardRegisters> {
        Ok(*lock(&self.state.regs))
    }

    fn set_regs(&self, regs: &StandardRegisters) -> cpu::Result<()> {
        *lock(&self.state.regs) = *regs;
        Ok(())
    }

    fn get_sregs(&self) -> cpu::Result<SpecialRegisters> {
        Ok(*lock(&self.state.sregs))
    }

    fn set_sregs(&self, sregs: &SpecialRegisters) -> cpu::Result<()> {
        *lock(&self.state.sregs) = *sregs;
        Ok(())
    }

    fn get_fpu(&self) -> cpu::Result<FpuState> {
        Ok(*lock(&self.state.fpu))
    }

    fn set_fpu(&self, fpu: &FpuState) -> cpu::Result<()> {
        *lock(&self.state.fpu) = *fpu;
        Ok(())
    }

    fn get_xsave(&self) -> cpu::Result<XsaveState> {
        Ok(lock(&self.state.xsave).clone())
    }

    fn set_xsave(&self, xsave: &XsaveState) -> cpu::Result<()> {
        *lock(&self.state.xsave) = xsave.clone();
        Ok(())
    }

    fn get_xcrs(&self) -> cpu::Result<ExtendedControlRegisters> {
        Ok(*lock(&self.state.xcrs))
    }

    fn set_xcrs(&self, xcrs: &ExtendedControlRegisters) -> cpu::Result<()> {
        *lock(&self.state.xcrs) = *xcrs;
        Ok(())
    }

    fn get_lapic(&self) -> cpu::Result<LapicState> {
        Ok(*lock(&self.state.lapic))
    }

    fn set_lapic(&self, lapic: &LapicState) -> cpu::Result<()> {
        *lock(&self.state.lapic) = *lapic;
        Ok(())
    }

    fn get_msrs(&self, msrs: &mut [MsrEntry]) -> cpu::Result<usize> {
        let faulty = lock(&self.state.faulty_msrs);
        let store = lock(&self.state.msrs);
        for (i, entry) in msrs.iter_mut().enumerate() {
            if faulty.contains(&entry.index) {
                return Ok(i);
            }
            entry.data = store.get(&entry.index).copied().unwrap_or(0);
        }
        Ok(msrs.len())
    }

    fn set_msrs(&self, msrs: &[MsrEntry]) -> cpu::Result<usize> {
        let faulty = lock(&self.state.faulty_msrs);
        let mut store = lock(&self.state.msrs);
        for (i, entry) in msrs.iter().enumerate() {
            if faulty.contains(&entry.index) {
                return Ok(i);
            }
            store.insert(entry.index, entry.data);
        }
        Ok(msrs.len())
    }

    fn get_mp_state(&self) -> cpu::Result<MpState> {
        Ok(*lock(&self.state.mp_state))
    }

    fn set_mp_state(&self, mp_state: MpState) -> cpu::Result<()> {
        *lock(&self.state.mp_state) = mp_state;
        Ok(())
    }

    fn get_vcpu_events(&self) -> cpu::Result<VcpuEvents> {
        Ok(*lock(&self.state.events))
    }

    fn set_vcpu_events(&self, events: &VcpuEvents) -> cpu::Result<()> {
        *lock(&self.state.events) = *events;
        Ok(())
    }

    fn get_debug_regs(&self) -> cpu::Result<DebugRegisters> {
        Ok(*lock(&self.state.debug_regs))
    }

    fn set_debug_regs(&self, debug_regs: &DebugRegisters) -> cpu::Result<()> {
        *lock(&self.state.debug_regs) = *debug_regs;
        Ok(())
    }

    fn set_guest_debug(&self, debug: &GuestDebug) -> cpu::Result<()> {
        lock(&self.state.guest_debug).push(*debug);
        Ok(())
    }

    fn set_cpuid2(&self, entries: &[CpuIdEntry]) -> cpu::Result<()> {
        *lock(&self.state.cpuid) = entries.to_vec();
        Ok(())
    }

    fn translate_gva(&self, gva: u64) -> cpu::Result<TranslatedAddress> {
        let valid = !lock(&self.state.unmapped).contains(&(gva & !0xfff));
        Ok(TranslatedAddress {
            gpa: gva,
            valid,
            writeable: valid,
        })
    }

    fn inject_interrupt(&self, vector: u32) -> cpu::Result<()> {
        lock(&self.state.injected).push(vector);
        Ok(())
    }

    fn nmi(&self) -> cpu::Result<()> {
        *lock(&self.state.nmis) += 1;
        Ok(())
    }

    fn smi(&self) -> cpu::Result<()> {
        *lock(&self.state.smis) += 1;
        Ok(())
    }

    fn set_request_interrupt_window(&mut self, request: bool) -> cpu::Result<()> {
        lock(&self.state.inputs).request_interrupt_window = request;
        run_page::set_request_interrupt_window(&mut self.page, request)
            .map_err(|e| cpu::HypervisorCpuError::RunPage(e.into()))
    }

    fn set_cr8(&mut self, cr8: u64) -> cpu::Result<()> {
        lock(&self.state.inputs).cr8 = cr8;
        run_page::set_cr8(&mut self.page, cr8)
            .map_err(|e| cpu::HypervisorCpuError::RunPage(e.into()))
    }

    fn set_immediate_exit(&mut self, exit: bool) -> cpu::Result<()> {
        lock(&self.state.inputs).immediate_exit = exit;
        run_page::set_immediate_exit(&mut self.page, exit)
            .map_err(|e| cpu::HypervisorCpuError::RunPage(e.into()))
    }

    fn run(&mut self) -> cpu::Result<RunExit<'_>> {
        let inputs = *lock(&self.state.inputs);
        if inputs.immediate_exit {
            let state = run_page::read_state(&self.page).unwrap_or_default();
            return Ok(RunExit {
                state,
                exit: VmExit::Interrupted,
            });
        }

        *lock(&self.state.runs) += 1;
        let next = lock(&self.state.script)
            .pop_front()
            .unwrap_or_else(Self::shutdown_page);
        let previous = std::mem::replace(&mut self.page, next);
        lock(&self.state.completed).push(previous);

        // Inputs persist across exits, the kernel never clears them.
        run_page::set_request_interrupt_window(&mut self.page, inputs.request_interrupt_window)
            .map_err(|e| cpu::HypervisorCpuError::RunPage(e.into()))?;

        let state = run_page::read_state(&self.page)
            .map_err(|e| cpu::HypervisorCpuError::RunPage(e.into()))?;
        let exit = run_page::decode(&mut self.page)
            .map_err(|e| cpu::HypervisorCpuError::RunPage(e.into()))?;
        Ok(RunExit { state, exit })
    }
}
