// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use std::mem::size_of;
use std::os::raw::c_ulong;
use std::sync::Arc;

use kvm_bindings::{
    kvm_enable_cap, kvm_interrupt, kvm_irq_level, kvm_irq_routing, kvm_irq_routing_entry,
    kvm_mp_state, kvm_run, CpuId, Msrs, KVM_API_VERSION, KVM_MAX_CPUID_ENTRIES,
};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};
use vmm_sys_util::errno;
use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ref, ioctl_with_val};

use crate::arch::x86::irqchip::{IrqchipKind, IrqchipState};
use crate::arch::x86::run_page;
use crate::arch::x86::{
    CpuIdEntry, DebugRegisters, ExtendedControlRegisters, FpuState, GuestDebug, LapicState,
    MpState, MsrEntry, SpecialRegisters, StandardRegisters, VcpuEvents, XsaveState,
    NUM_IOAPIC_PINS,
};
use crate::cpu::{self, RunExit, TranslatedAddress, VmExit};
use crate::hypervisor::{self, Capability};
use crate::vm::{self, IrqRoutingEntry, UserMemoryRegion};

pub mod x86_64;

use x86_64::{
    guest_debug_to_kvm, irqchip_from_state, irqchip_request, irqchip_state, lapic_from_kvm,
    lapic_to_kvm, memory_region, routing_entry, xsave_from_kvm, xsave_to_kvm,
    KVM_CHECK_EXTENSION, KVM_INTERRUPT, KVM_IRQ_LINE_STATUS, KVM_NMI, KVM_SET_BOOT_CPU_ID,
    KVM_SET_GSI_ROUTING, KVM_SMI,
};

pub use kvm_bindings;
pub use kvm_ioctls;

// Returns a `Vec<T>` with a size in bytes at least as large as `size_in_bytes`.
fn vec_with_size_in_bytes<T: Default>(size_in_bytes: usize) -> Vec<T> {
    let rounded_size = size_in_bytes.div_ceil(size_of::<T>());
    let mut v = Vec::with_capacity(rounded_size);
    v.resize_with(rounded_size, T::default);
    v
}

// The kvm API has many structs that resemble the following `Foo` structure:
//
// ```
// #[repr(C)]
// struct Foo {
//    some_data: u32
//    entries: __IncompleteArrayField<__u32>,
// }
// ```
//
// In order to allocate such a structure, `size_of::<Foo>()` would be too small because it would not
// include any space for `entries`. To make the allocation large enough while still being aligned
// for `Foo`, a `Vec<Foo>` is created. Only the first element of `Vec<Foo>` would actually be used
// as a `Foo`. The remaining memory in the `Vec<Foo>` is for `entries`, which must be contiguous
// with `Foo`. This function is used to make the `Vec<Foo>` with enough space for `count` entries.
fn vec_with_array_field<T: Default, F>(count: usize) -> Vec<T> {
    let element_space = count * size_of::<F>();
    let vec_size_bytes = size_of::<T>() + element_space;
    vec_with_size_in_bytes(vec_size_bytes)
}

fn check_extension_raw<F: std::os::unix::io::AsRawFd>(fd: &F, cap: Capability) -> i32 {
    // SAFETY: the request takes an integer argument and touches no memory.
    let ret = unsafe { ioctl_with_val(fd, KVM_CHECK_EXTENSION(), cap.number() as c_ulong) };
    ret.max(0)
}

/// Wrapper over KVM VM ioctls.
pub struct KvmVm {
    fd: Arc<VmFd>,
    run_size: usize,
}

///
/// Implementation of Vm trait for KVM
/// Example:
/// #[cfg(feature = "kvm")]
/// extern crate hypervisor
/// let kvm = hypervisor::kvm::KvmHypervisor::new().unwrap();
/// let hypervisor: Arc<dyn hypervisor::Hypervisor> = Arc::new(kvm);
/// let vm = hypervisor.create_vm().expect("new VM fd creation failed");
/// vm.set/get().unwrap()
///
impl vm::Vm for KvmVm {
    fn check_extension(&self, cap: Capability) -> i32 {
        check_extension_raw(&*self.fd, cap)
    }
    ///
    /// Creates a VcpuFd object from a vcpu RawFd.
    ///
    fn create_vcpu(&self, id: u32) -> vm::Result<Box<dyn cpu::Vcpu>> {
        let fd = self
            .fd
            .create_vcpu(u64::from(id))
            .map_err(|e| vm::HypervisorVmError::CreateVcpu(e.into()))?;
        Ok(Box::new(KvmVcpu {
            fd,
            id,
            run_size: self.run_size,
        }))
    }
    ///
    /// Sets the address of the three-page region in the VM's address space.
    ///
    fn set_tss_address(&self, addr: u64) -> vm::Result<()> {
        self.fd
            .set_tss_address(addr as usize)
            .map_err(|e| vm::HypervisorVmError::SetTssAddress(e.into()))
    }
    ///
    /// Sets the address of the one-page region in the VM's address space.
    ///
    fn set_identity_map_address(&self, addr: u64) -> vm::Result<()> {
        self.fd
            .set_identity_map_address(addr)
            .map_err(|e| vm::HypervisorVmError::SetIdentityMapAddress(e.into()))
    }
    fn set_boot_cpu_id(&self, id: u32) -> vm::Result<()> {
        // SAFETY: the request takes an integer argument and touches no memory.
        let ret = unsafe { ioctl_with_val(&*self.fd, KVM_SET_BOOT_CPU_ID(), c_ulong::from(id)) };
        if ret < 0 {
            return Err(vm::HypervisorVmError::SetBootCpuId(
                errno::Error::last().into(),
            ));
        }
        Ok(())
    }
    ///
    /// Creates an in-kernel interrupt controller.
    ///
    fn create_irq_chip(&self) -> vm::Result<()> {
        self.fd
            .create_irq_chip()
            .map_err(|e| vm::HypervisorVmError::CreateIrq(e.into()))
    }
    fn enable_split_irq(&self) -> vm::Result<()> {
        // Create split irqchip
        // Only the local APIC is emulated in kernel, both PICs and IOAPIC
        // are not.
        let cap = kvm_enable_cap {
            cap: Capability::SplitIrqchip.number(),
            args: [NUM_IOAPIC_PINS as u64, 0, 0, 0],
            ..Default::default()
        };
        self.fd
            .enable_cap(&cap)
            .map_err(|e| vm::HypervisorVmError::EnableSplitIrq(e.into()))
    }
    fn enable_cap(&self, cap: Capability, args: [u64; 4]) -> vm::Result<()> {
        let cap = kvm_enable_cap {
            cap: cap.number(),
            args,
            ..Default::default()
        };
        self.fd
            .enable_cap(&cap)
            .map_err(|e| vm::HypervisorVmError::EnableCap(e.into()))
    }
    fn get_irqchip(&self, kind: IrqchipKind) -> vm::Result<IrqchipState> {
        let mut chip = irqchip_request(kind);
        self.fd
            .get_irqchip(&mut chip)
            .map_err(|e| vm::HypervisorVmError::GetIrqchip(e.into()))?;
        Ok(irqchip_state(kind, &chip))
    }
    fn set_irqchip(&self, state: &IrqchipState) -> vm::Result<()> {
        self.fd
            .set_irqchip(&irqchip_from_state(state))
            .map_err(|e| vm::HypervisorVmError::SetIrqchip(e.into()))
    }
    fn irq_line(&self, gsi: u32, level: bool) -> vm::Result<i32> {
        let mut irq_level = kvm_irq_level {
            level: u32::from(level),
            ..Default::default()
        };
        irq_level.__bindgen_anon_1.irq = gsi;
        // SAFETY: the kernel reads and writes back exactly one kvm_irq_level.
        let ret =
            unsafe { ioctl_with_mut_ref(&*self.fd, KVM_IRQ_LINE_STATUS(), &mut irq_level) };
        if ret < 0 {
            return Err(vm::HypervisorVmError::SetIrqLine(
                errno::Error::last().into(),
            ));
        }
        // SAFETY: on success the kernel stored the delivery status in the union.
        Ok(unsafe { irq_level.__bindgen_anon_1.status })
    }
    ///
    /// Sets the GSI routing table entries, overwriting any previously set
    /// entries, as per the `KVM_SET_GSI_ROUTING` ioctl.
    ///
    fn set_gsi_routing(&self, entries: &[IrqRoutingEntry]) -> vm::Result<()> {
        let mut irq_routing =
            vec_with_array_field::<kvm_irq_routing, kvm_irq_routing_entry>(entries.len());
        irq_routing[0].nr = entries.len() as u32;
        irq_routing[0].flags = 0;

        // SAFETY: the vector was sized to hold `entries.len()` trailing entries.
        let entries_slice: &mut [kvm_irq_routing_entry] =
            unsafe { irq_routing[0].entries.as_mut_slice(entries.len()) };
        for (dst, src) in entries_slice.iter_mut().zip(entries) {
            *dst = routing_entry(src);
        }

        // SAFETY: the kernel reads `nr` entries following the header, all of
        // which live in `irq_routing`.
        let ret = unsafe { ioctl_with_ref(&*self.fd, KVM_SET_GSI_ROUTING(), &irq_routing[0]) };
        if ret < 0 {
            return Err(vm::HypervisorVmError::SetGsiRouting(
                errno::Error::last().into(),
            ));
        }
        Ok(())
    }
    ///
    /// Creates/modifies a guest physical memory slot.
    ///
    fn set_user_memory_region(&self, region: UserMemoryRegion) -> vm::Result<()> {
        // SAFETY: the memory manager keeps host mappings alive for as long
        // as they are registered and never hands out overlapping slots.
        unsafe {
            self.fd
                .set_user_memory_region(memory_region(&region))
                .map_err(|e| vm::HypervisorVmError::SetUserMemory(e.into()))
        }
    }
    fn get_dirty_log(&self, slot: u32, memory_size: u64) -> vm::Result<Vec<u64>> {
        self.fd
            .get_dirty_log(slot, memory_size as usize)
            .map_err(|e| vm::HypervisorVmError::GetDirtyLog(e.into()))
    }
}

/// Wrapper over KVM system ioctls.
pub struct KvmHypervisor {
    kvm: Kvm,
}

impl KvmHypervisor {
    /// Create a hypervisor based on Kvm
    pub fn new() -> hypervisor::Result<KvmHypervisor> {
        let kvm_obj =
            Kvm::new().map_err(|e| hypervisor::HypervisorError::HypervisorCreate(e.into()))?;
        let api_version = kvm_obj.get_api_version();

        if api_version != KVM_API_VERSION as i32 {
            return Err(hypervisor::HypervisorError::IncompatibleApiVersion);
        }

        Ok(KvmHypervisor { kvm: kvm_obj })
    }
}

/// Implementation of Hypervisor trait for KVM
/// Example:
/// #[cfg(feature = "kvm")]
/// extern crate hypervisor
/// let kvm = hypervisor::kvm::KvmHypervisor::new().unwrap();
/// let hypervisor: Arc<dyn hypervisor::Hypervisor> = Arc::new(kvm);
/// let vm = hypervisor.create_vm().expect("new VM fd creation failed");
///
impl hypervisor::Hypervisor for KvmHypervisor {
    fn api_version(&self) -> hypervisor::Result<i32> {
        Ok(self.kvm.get_api_version())
    }
    /// Create a KVM vm object and return the object as Vm trait object
    fn create_vm(&self) -> hypervisor::Result<Arc<dyn vm::Vm>> {
        let fd: VmFd;
        loop {
            match self.kvm.create_vm() {
                Ok(res) => fd = res,
                Err(e) => {
                    if e.errno() == libc::EINTR {
                        // If the error returned is EINTR, which means the
                        // ioctl has been interrupted, we have to retry as
                        // this can't be considered as a regular error.
                        continue;
                    } else {
                        return Err(hypervisor::HypervisorError::VmCreate(e.into()));
                    }
                }
            }
            break;
        }

        let run_size = self
            .kvm
            .get_vcpu_mmap_size()
            .map_err(|e| hypervisor::HypervisorError::GetVcpuMmap(e.into()))?;

        Ok(Arc::new(KvmVm {
            fd: Arc::new(fd),
            run_size,
        }))
    }
    fn check_extension(&self, cap: Capability) -> i32 {
        check_extension_raw(&self.kvm, cap)
    }
    ///
    /// X86 specific call to get the system supported CPUID values.
    ///
    fn get_supported_cpuid(&self) -> hypervisor::Result<Vec<CpuIdEntry>> {
        let cpuid = self
            .kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(|e| hypervisor::HypervisorError::GetCpuId(e.into()))?;
        Ok(cpuid.as_slice().to_vec())
    }
    fn get_emulated_cpuid(&self) -> hypervisor::Result<Vec<CpuIdEntry>> {
        let cpuid = self
            .kvm
            .get_emulated_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(|e| hypervisor::HypervisorError::GetCpuId(e.into()))?;
        Ok(cpuid.as_slice().to_vec())
    }
    ///
    /// Retrieve the list of MSRs supported by KVM.
    ///
    fn get_msr_list(&self) -> hypervisor::Result<Vec<u32>> {
        let list = self
            .kvm
            .get_msr_index_list()
            .map_err(|e| hypervisor::HypervisorError::GetMsrList(e.into()))?;
        Ok(list.as_slice().to_vec())
    }
}

/// Vcpu struct for KVM
pub struct KvmVcpu {
    fd: VcpuFd,
    id: u32,
    run_size: usize,
}

impl KvmVcpu {
    fn run_page(&mut self) -> &mut [u8] {
        let run: *mut kvm_run = self.fd.get_kvm_run();
        // SAFETY: the run structure heads a shared mapping of `run_size`
        // bytes that lives as long as the vCPU fd, and the exclusive borrow
        // of `self` keeps other accessors out.
        unsafe { std::slice::from_raw_parts_mut(run as *mut u8, self.run_size) }
    }
}

impl cpu::Vcpu for KvmVcpu {
    fn id(&self) -> u32 {
        self.id
    }
    ///
    /// Returns the vCPU general purpose registers.
    ///
    fn get_regs(&self) -> cpu::Result<StandardRegisters> {
        self.fd
            .get_regs()
            .map_err(|e| cpu::HypervisorCpuError::GetStandardRegs(e.into()))
    }
    ///
    /// Sets the vCPU general purpose registers using the `KVM_SET_REGS` ioctl.
    ///
    fn set_regs(&self, regs: &StandardRegisters) -> cpu::Result<()> {
        self.fd
            .set_regs(regs)
            .map_err(|e| cpu::HypervisorCpuError::SetStandardRegs(e.into()))
    }
    ///
    /// Returns the vCPU special registers.
    ///
    fn get_sregs(&self) -> cpu::Result<SpecialRegisters> {
        self.fd
            .get_sregs()
            .map_err(|e| cpu::HypervisorCpuError::GetSpecialRegs(e.into()))
    }
    ///
    /// Sets the vCPU special registers using the `KVM_SET_SREGS` ioctl.
    ///
    fn set_sregs(&self, sregs: &SpecialRegisters) -> cpu::Result<()> {
        self.fd
            .set_sregs(sregs)
            .map_err(|e| cpu::HypervisorCpuError::SetSpecialRegs(e.into()))
    }
    ///
    /// Returns the floating point state (FPU) from the vCPU.
    ///
    fn get_fpu(&self) -> cpu::Result<FpuState> {
        self.fd
            .get_fpu()
            .map_err(|e| cpu::HypervisorCpuError::GetFloatingPointRegs(e.into()))
    }
    ///
    /// Set the floating point state (FPU) of a vCPU using the `KVM_SET_FPU` ioct.
    ///
    fn set_fpu(&self, fpu: &FpuState) -> cpu::Result<()> {
        self.fd
            .set_fpu(fpu)
            .map_err(|e| cpu::HypervisorCpuError::SetFloatingPointRegs(e.into()))
    }
    fn get_xsave(&self) -> cpu::Result<XsaveState> {
        self.fd
            .get_xsave()
            .map(|xsave| xsave_from_kvm(&xsave))
            .map_err(|e| cpu::HypervisorCpuError::GetXsaveState(e.into()))
    }
    fn set_xsave(&self, xsave: &XsaveState) -> cpu::Result<()> {
        let xsave = xsave_to_kvm(xsave);
        // SAFETY: the legacy 4 KiB area is all the kernel reads when the
        // extended size was never negotiated.
        #[allow(unused_unsafe)]
        unsafe {
            self.fd
                .set_xsave(&xsave)
                .map_err(|e| cpu::HypervisorCpuError::SetXsaveState(e.into()))
        }
    }
    ///
    /// X86 specific call that returns the vcpu's current "xcrs".
    ///
    fn get_xcrs(&self) -> cpu::Result<ExtendedControlRegisters> {
        self.fd
            .get_xcrs()
            .map_err(|e| cpu::HypervisorCpuError::GetXcsr(e.into()))
    }
    ///
    /// X86 specific call that sets the vcpu's current "xcrs".
    ///
    fn set_xcrs(&self, xcrs: &ExtendedControlRegisters) -> cpu::Result<()> {
        self.fd
            .set_xcrs(xcrs)
            .map_err(|e| cpu::HypervisorCpuError::SetXcsr(e.into()))
    }
    ///
    /// Returns the state of the LAPIC (Local Advanced Programmable Interrupt Controller).
    ///
    fn get_lapic(&self) -> cpu::Result<LapicState> {
        self.fd
            .get_lapic()
            .map(|klapic| lapic_from_kvm(&klapic))
            .map_err(|e| cpu::HypervisorCpuError::GetLapicState(e.into()))
    }
    ///
    /// Sets the state of the LAPIC (Local Advanced Programmable Interrupt Controller).
    ///
    fn set_lapic(&self, lapic: &LapicState) -> cpu::Result<()> {
        self.fd
            .set_lapic(&lapic_to_kvm(lapic))
            .map_err(|e| cpu::HypervisorCpuError::SetLapicState(e.into()))
    }
    ///
    /// Returns the model-specific registers (MSR) for this vCPU.
    ///
    fn get_msrs(&self, msrs: &mut [MsrEntry]) -> cpu::Result<usize> {
        let mut kvm_msrs = Msrs::from_entries(msrs)
            .map_err(|e| cpu::HypervisorCpuError::GetMsrEntries(anyhow!("{:?}", e)))?;
        let succ = self
            .fd
            .get_msrs(&mut kvm_msrs)
            .map_err(|e| cpu::HypervisorCpuError::GetMsrEntries(e.into()))?;
        msrs[..succ].copy_from_slice(&kvm_msrs.as_slice()[..succ]);
        Ok(succ)
    }
    ///
    /// Setup the model-specific registers (MSR) for this vCPU.
    /// Returns the number of MSR entries actually written.
    ///
    fn set_msrs(&self, msrs: &[MsrEntry]) -> cpu::Result<usize> {
        let kvm_msrs = Msrs::from_entries(msrs)
            .map_err(|e| cpu::HypervisorCpuError::SetMsrEntries(anyhow!("{:?}", e)))?;
        self.fd
            .set_msrs(&kvm_msrs)
            .map_err(|e| cpu::HypervisorCpuError::SetMsrEntries(e.into()))
    }
    ///
    /// Returns the vcpu's current "multiprocessing state".
    ///
    fn get_mp_state(&self) -> cpu::Result<MpState> {
        self.fd
            .get_mp_state()
            .map(|mp| MpState::from(mp.mp_state))
            .map_err(|e| cpu::HypervisorCpuError::GetMpState(e.into()))
    }
    ///
    /// Sets the vcpu's current "multiprocessing state".
    ///
    fn set_mp_state(&self, mp_state: MpState) -> cpu::Result<()> {
        self.fd
            .set_mp_state(kvm_mp_state {
                mp_state: mp_state.into(),
            })
            .map_err(|e| cpu::HypervisorCpuError::SetMpState(e.into()))
    }
    ///
    /// Returns currently pending exceptions, interrupts, and NMIs as well as related
    /// states of the vcpu.
    ///
    fn get_vcpu_events(&self) -> cpu::Result<VcpuEvents> {
        self.fd
            .get_vcpu_events()
            .map_err(|e| cpu::HypervisorCpuError::GetVcpuEvents(e.into()))
    }
    ///
    /// Sets pending exceptions, interrupts, and NMIs as well as related states
    /// of the vcpu.
    ///
    fn set_vcpu_events(&self, events: &VcpuEvents) -> cpu::Result<()> {
        self.fd
            .set_vcpu_events(events)
            .map_err(|e| cpu::HypervisorCpuError::SetVcpuEvents(e.into()))
    }
    fn get_debug_regs(&self) -> cpu::Result<DebugRegisters> {
        self.fd
            .get_debug_regs()
            .map_err(|e| cpu::HypervisorCpuError::GetDebugRegs(e.into()))
    }
    fn set_debug_regs(&self, debug_regs: &DebugRegisters) -> cpu::Result<()> {
        self.fd
            .set_debug_regs(debug_regs)
            .map_err(|e| cpu::HypervisorCpuError::SetDebugRegs(e.into()))
    }
    fn set_guest_debug(&self, debug: &GuestDebug) -> cpu::Result<()> {
        self.fd
            .set_guest_debug(&guest_debug_to_kvm(debug))
            .map_err(|e| cpu::HypervisorCpuError::SetDebugConfig(e.into()))
    }
    ///
    /// X86 specific call to setup the CPUID registers.
    ///
    fn set_cpuid2(&self, entries: &[CpuIdEntry]) -> cpu::Result<()> {
        let cpuid = CpuId::from_entries(entries)
            .map_err(|e| cpu::HypervisorCpuError::SetCpuid(anyhow!("{:?}", e)))?;
        self.fd
            .set_cpuid2(&cpuid)
            .map_err(|e| cpu::HypervisorCpuError::SetCpuid(e.into()))
    }
    fn translate_gva(&self, gva: u64) -> cpu::Result<TranslatedAddress> {
        let tr = self
            .fd
            .translate_gva(gva)
            .map_err(|e| cpu::HypervisorCpuError::TranslateVirtualAddress(e.into()))?;
        Ok(TranslatedAddress {
            gpa: tr.physical_address,
            valid: tr.valid != 0,
            writeable: tr.writeable != 0,
        })
    }
    fn inject_interrupt(&self, vector: u32) -> cpu::Result<()> {
        let irq = kvm_interrupt { irq: vector };
        // SAFETY: the kernel reads exactly one kvm_interrupt.
        let ret = unsafe { ioctl_with_ref(&self.fd, KVM_INTERRUPT(), &irq) };
        if ret < 0 {
            return Err(cpu::HypervisorCpuError::InjectInterrupt(
                errno::Error::last().into(),
            ));
        }
        Ok(())
    }
    fn nmi(&self) -> cpu::Result<()> {
        // SAFETY: the request carries no argument.
        let ret = unsafe { ioctl(&self.fd, KVM_NMI()) };
        if ret < 0 {
            return Err(cpu::HypervisorCpuError::InjectNmi(
                errno::Error::last().into(),
            ));
        }
        Ok(())
    }
    fn smi(&self) -> cpu::Result<()> {
        // SAFETY: the request carries no argument.
        let ret = unsafe { ioctl(&self.fd, KVM_SMI()) };
        if ret < 0 {
            return Err(cpu::HypervisorCpuError::InjectSmi(
                errno::Error::last().into(),
            ));
        }
        Ok(())
    }
    fn set_request_interrupt_window(&mut self, request: bool) -> cpu::Result<()> {
        run_page::set_request_interrupt_window(self.run_page(), request)
            .map_err(|e| cpu::HypervisorCpuError::RunPage(e.into()))
    }
    fn set_cr8(&mut self, cr8: u64) -> cpu::Result<()> {
        run_page::set_cr8(self.run_page(), cr8)
            .map_err(|e| cpu::HypervisorCpuError::RunPage(e.into()))
    }
    fn set_immediate_exit(&mut self, exit: bool) -> cpu::Result<()> {
        run_page::set_immediate_exit(self.run_page(), exit)
            .map_err(|e| cpu::HypervisorCpuError::RunPage(e.into()))
    }
    ///
    /// Triggers the running of the current virtual CPU returning an exit reason.
    ///
    fn run(&mut self) -> cpu::Result<RunExit<'_>> {
        // The exit is decoded from the run page below rather than from the
        // wrapper's view, so that every reason reaches the exit handler.
        let result = self.fd.run().map(|_| ());
        if let Err(e) = result {
            return match e.errno() {
                libc::EAGAIN | libc::EINTR => {
                    let state = run_page::read_state(self.run_page()).unwrap_or_default();
                    Ok(RunExit {
                        state,
                        exit: VmExit::Interrupted,
                    })
                }
                _ => Err(cpu::HypervisorCpuError::RunVcpu(anyhow!(
                    "VCPU error {:?}",
                    e
                ))),
            };
        }

        let page = self.run_page();
        let state =
            run_page::read_state(page).map_err(|e| cpu::HypervisorCpuError::RunPage(e.into()))?;
        let exit =
            run_page::decode(page).map_err(|e| cpu::HypervisorCpuError::RunPage(e.into()))?;
        Ok(RunExit { state, exit })
    }
}
