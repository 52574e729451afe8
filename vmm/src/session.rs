// Copyright © 2020, Oracle and/or its affiliates.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use hypervisor::x86::CpuIdEntry;
use hypervisor::{Capability, Hypervisor, HypervisorError, HypervisorVmError, Vcpu, Vm};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AccelConfig, IrqchipMode};

const DEFAULT_NR_SLOTS: u32 = 32;
const DEFAULT_RECOMMENDED_VCPUS: u32 = 4;

/// Set while a session is alive. Only one VM is driven per process.
static SESSION_ALIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Hypervisor device is unavailable")]
    DeviceUnavailable(#[source] anyhow::Error),

    #[error("A hypervisor session is already open in this process")]
    AlreadyOpen,

    #[error("Error querying the API version")]
    ApiVersion(#[source] HypervisorError),

    #[error("Error creating the VM")]
    CreateVm(#[source] HypervisorError),

    #[error("Error querying the supported MSR list")]
    GetMsrList(#[source] HypervisorError),

    #[error("Error querying the supported CPUID")]
    GetSupportedCpuid(#[source] HypervisorError),

    #[error("Capability {0:?} is required but not available")]
    MissingCapability(Capability),

    #[error("Error creating the interrupt controller")]
    CreateIrqchip(#[source] HypervisorVmError),

    #[error("Error setting the identity map address")]
    SetIdentityMapAddress(#[source] HypervisorVmError),

    #[error("Error setting the TSS address")]
    SetTssAddress(#[source] HypervisorVmError),

    #[error("Error setting the boot CPU id")]
    SetBootCpuId(#[source] HypervisorVmError),

    #[error("Error enabling capability {0:?}")]
    EnableCap(Capability, #[source] HypervisorVmError),

    #[error("vCPU id {0} is above the maximum {1}")]
    VcpuIdOutOfRange(u32, u32),

    #[error("Error creating vCPU {0}")]
    CreateVcpu(u32, #[source] HypervisorVmError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Capabilities negotiated at session creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Capabilities {
    pub api_version: i32,
    pub nr_slots: u32,
    pub recommended_vcpus: u32,
    pub max_vcpus: u32,
    pub max_vcpu_id: u32,
    /// Number of GSIs usable for routing; zero without routing support.
    pub gsi_count: u32,
    pub readonly_mem: bool,
    pub multi_address_space: bool,
    pub xsave: bool,
    pub xcrs: bool,
    pub smm: bool,
    pub immediate_exit: bool,
    pub hw_breakpoints: bool,
    pub msi_devid: bool,
    pub user_nmi: bool,
    pub set_boot_cpu_id: bool,
}

/// Clears the process-wide flag once the owning session is gone.
struct InstanceToken;

impl InstanceToken {
    fn acquire() -> Result<Self> {
        if SESSION_ALIVE.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyOpen);
        }
        Ok(InstanceToken)
    }
}

impl Drop for InstanceToken {
    fn drop(&mut self) {
        SESSION_ALIVE.store(false, Ordering::SeqCst);
    }
}

/// An open connection to the hypervisor device together with the VM it
/// drives.
pub struct Session {
    hypervisor: Arc<dyn Hypervisor>,
    vm: Arc<dyn Vm>,
    config: AccelConfig,
    caps: Capabilities,
    check_extension_vm: bool,
    supported_msrs: Vec<u32>,
    supported_cpuid: Vec<CpuIdEntry>,
    // Handles of destroyed vCPUs, kept open so a later create with the
    // same id reuses the kernel object.
    parked_vcpus: Mutex<HashMap<u32, Box<dyn Vcpu>>>,
    device_lock: Arc<Mutex<()>>,
    _token: InstanceToken,
}

impl Session {
    /// Opens the default backend compiled into this build.
    pub fn open_default(config: AccelConfig) -> Result<Arc<Session>> {
        let hypervisor =
            hypervisor::new().map_err(|e| SessionError::DeviceUnavailable(e.into()))?;
        Session::open(hypervisor, config)
    }

    pub fn open(hypervisor: Arc<dyn Hypervisor>, config: AccelConfig) -> Result<Arc<Session>> {
        let token = InstanceToken::acquire()?;

        let api_version = hypervisor.api_version().map_err(SessionError::ApiVersion)?;
        let vm = hypervisor.create_vm().map_err(SessionError::CreateVm)?;
        let check_extension_vm = hypervisor.check_extension(Capability::CheckExtensionVm) > 0;

        let query = |cap: Capability| -> i32 {
            if check_extension_vm {
                vm.check_extension(cap)
            } else {
                hypervisor.check_extension(cap)
            }
        };
        let caps = negotiate(api_version, query);
        info!(
            "Hypervisor API version {}, {} memory slots, {} max vCPUs",
            caps.api_version, caps.nr_slots, caps.max_vcpus
        );

        if query(Capability::SetIdentityMapAddr) > 0 {
            vm.set_identity_map_address(config.identity_map)
                .map_err(SessionError::SetIdentityMapAddress)?;
        }
        vm.set_tss_address(config.tss)
            .map_err(SessionError::SetTssAddress)?;

        match config.kernel_irqchip {
            IrqchipMode::On => {
                if query(Capability::Irqchip) <= 0 {
                    return Err(SessionError::MissingCapability(Capability::Irqchip));
                }
                vm.create_irq_chip().map_err(SessionError::CreateIrqchip)?;
            }
            IrqchipMode::Split => {
                if query(Capability::SplitIrqchip) <= 0 {
                    return Err(SessionError::MissingCapability(Capability::SplitIrqchip));
                }
                vm.enable_split_irq().map_err(SessionError::CreateIrqchip)?;
            }
            IrqchipMode::Off => {}
        }

        let supported_msrs = hypervisor
            .get_msr_list()
            .map_err(SessionError::GetMsrList)?;
        let supported_cpuid = hypervisor
            .get_supported_cpuid()
            .map_err(SessionError::GetSupportedCpuid)?;

        Ok(Arc::new(Session {
            hypervisor,
            vm,
            config,
            caps,
            check_extension_vm,
            supported_msrs,
            supported_cpuid,
            parked_vcpus: Mutex::new(HashMap::new()),
            device_lock: Arc::new(Mutex::new(())),
            _token: token,
        }))
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn vm(&self) -> &Arc<dyn Vm> {
        &self.vm
    }

    pub fn config(&self) -> &AccelConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn supported_msrs(&self) -> &[u32] {
        &self.supported_msrs
    }

    pub fn supported_cpuid(&self) -> &[CpuIdEntry] {
        &self.supported_cpuid
    }

    /// Lock serializing every access to the emulated devices.
    pub fn device_lock(&self) -> Arc<Mutex<()>> {
        self.device_lock.clone()
    }

    /// Global capability query.
    pub fn check_extension(&self, cap: Capability) -> bool {
        self.hypervisor.check_extension(cap) > 0
    }

    /// VM-scoped capability query, falling back to the global device on
    /// kernels that cannot answer per VM.
    pub fn vm_check_extension(&self, cap: Capability) -> i32 {
        if self.check_extension_vm {
            self.vm.check_extension(cap)
        } else {
            self.hypervisor.check_extension(cap)
        }
    }

    pub fn set_boot_cpu_id(&self, id: u32) -> Result<()> {
        if !self.caps.set_boot_cpu_id {
            return Err(SessionError::MissingCapability(Capability::SetBootCpuId));
        }
        self.vm.set_boot_cpu_id(id).map_err(SessionError::SetBootCpuId)
    }

    pub fn enable_cap(&self, cap: Capability, args: &[u64]) -> Result<()> {
        let mut raw = [0u64; 4];
        for (dst, src) in raw.iter_mut().zip(args) {
            *dst = *src;
        }
        self.vm
            .enable_cap(cap, raw)
            .map_err(|e| SessionError::EnableCap(cap, e))
    }

    /// Returns the handle for vCPU `id`, reusing a parked one if the vCPU
    /// was destroyed before.
    pub fn create_vcpu(&self, id: u32) -> Result<Box<dyn Vcpu>> {
        if id > self.caps.max_vcpu_id {
            return Err(SessionError::VcpuIdOutOfRange(id, self.caps.max_vcpu_id));
        }
        if let Some(vcpu) = self.parked().remove(&id) {
            debug!("Reusing parked vCPU {}", id);
            return Ok(vcpu);
        }
        self.vm
            .create_vcpu(id)
            .map_err(|e| SessionError::CreateVcpu(id, e))
    }

    /// Parks the handle instead of closing it.
    pub fn destroy_vcpu(&self, vcpu: Box<dyn Vcpu>) {
        let id = vcpu.id();
        debug!("Parking vCPU {}", id);
        self.parked().insert(id, vcpu);
    }

    pub fn parked_vcpus(&self) -> usize {
        self.parked().len()
    }

    fn parked(&self) -> MutexGuard<'_, HashMap<u32, Box<dyn Vcpu>>> {
        self.parked_vcpus
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn negotiate<F: Fn(Capability) -> i32>(api_version: i32, query: F) -> Capabilities {
    let count = |cap: Capability| -> Option<u32> {
        let value = query(cap);
        (value > 0).then_some(value as u32)
    };

    let nr_slots = count(Capability::NrMemslots).unwrap_or(DEFAULT_NR_SLOTS);
    let recommended_vcpus = count(Capability::NrVcpus).unwrap_or(DEFAULT_RECOMMENDED_VCPUS);
    let max_vcpus = count(Capability::MaxVcpus).unwrap_or(recommended_vcpus);
    let max_vcpu_id = count(Capability::MaxVcpuId).unwrap_or(max_vcpus);
    let gsi_count = count(Capability::IrqRouting).map_or(0, |n| n - 1);

    Capabilities {
        api_version,
        nr_slots,
        recommended_vcpus,
        max_vcpus,
        max_vcpu_id,
        gsi_count,
        readonly_mem: count(Capability::ReadonlyMem).is_some(),
        multi_address_space: count(Capability::MultiAddressSpace).is_some_and(|n| n > 1),
        xsave: count(Capability::Xsave).is_some(),
        xcrs: count(Capability::Xcrs).is_some(),
        smm: count(Capability::X86Smm).is_some(),
        immediate_exit: count(Capability::ImmediateExit).is_some(),
        hw_breakpoints: count(Capability::GuestDebugHwBps).is_some(),
        msi_devid: count(Capability::MsiDevid).is_some(),
        user_nmi: count(Capability::UserNmi).is_some(),
        set_boot_cpu_id: count(Capability::SetBootCpuId).is_some(),
    }
}
