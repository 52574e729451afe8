// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arch::x86::CpuIdEntry;
use crate::vm::Vm;

#[derive(Error, Debug)]
///
///
pub enum HypervisorError {
    ///
    /// Hypervisor device open failure
    ///
    #[error("Failed to open the hypervisor device: {0}")]
    HypervisorCreate(#[source] anyhow::Error),
    ///
    /// Vm creation failure
    ///
    #[error("Failed to create Vm: {0}")]
    VmCreate(#[source] anyhow::Error),
    ///
    /// Vm setup failure
    ///
    #[error("Failed to setup Vm: {0}")]
    VmSetup(#[source] anyhow::Error),
    ///
    /// API version error
    ///
    #[error("Failed to get API Version: {0}")]
    GetApiVersion(#[source] anyhow::Error),
    ///
    /// Vcpu mmap error
    ///
    #[error("Failed to get Vcpu Mmap: {0}")]
    GetVcpuMmap(#[source] anyhow::Error),
    ///
    /// CpuId error
    ///
    #[error("Failed to get cpuid: {0}")]
    GetCpuId(#[source] anyhow::Error),
    ///
    /// Failed to retrieve list of MSRs.
    ///
    #[error("Failed to get the list of supported MSRs: {0}")]
    GetMsrList(#[source] anyhow::Error),
    ///
    /// API version is not compatible
    ///
    #[error("Incompatible API version")]
    IncompatibleApiVersion,
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Capabilities negotiated with the kernel driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Irqchip,
    Hlt,
    NrVcpus,
    NrMemslots,
    UserNmi,
    IrqRouting,
    SetBootCpuId,
    SetIdentityMapAddr,
    Xsave,
    Xcrs,
    MaxVcpus,
    ReadonlyMem,
    CheckExtensionVm,
    X86Smm,
    MultiAddressSpace,
    GuestDebugHwBps,
    SplitIrqchip,
    ImmediateExit,
    MaxVcpuId,
    MsiDevid,
}

impl Capability {
    /// Capability number as used by the extension query.
    pub fn number(self) -> u32 {
        match self {
            Capability::Irqchip => 0,
            Capability::Hlt => 1,
            Capability::NrVcpus => 9,
            Capability::NrMemslots => 10,
            Capability::UserNmi => 22,
            Capability::IrqRouting => 25,
            Capability::SetBootCpuId => 34,
            Capability::SetIdentityMapAddr => 37,
            Capability::Xsave => 55,
            Capability::Xcrs => 56,
            Capability::MaxVcpus => 66,
            Capability::ReadonlyMem => 81,
            Capability::CheckExtensionVm => 105,
            Capability::X86Smm => 117,
            Capability::MultiAddressSpace => 118,
            Capability::GuestDebugHwBps => 119,
            Capability::SplitIrqchip => 121,
            Capability::ImmediateExit => 136,
            Capability::MaxVcpuId => 128,
            Capability::MsiDevid => 131,
        }
    }
}

///
/// Trait to represent a Hypervisor
///
/// This crate provides a hypervisor-agnostic interfaces
///
pub trait Hypervisor: Send + Sync {
    ///
    /// Returns the driver API version.
    ///
    fn api_version(&self) -> Result<i32>;
    ///
    /// Create a Vm using the underlying hypervisor
    /// Return a hypervisor-agnostic Vm trait object
    ///
    fn create_vm(&self) -> Result<Arc<dyn Vm>>;
    ///
    /// Queries a global capability. Zero means absent; positive values may
    /// carry a count.
    ///
    fn check_extension(&self, cap: Capability) -> i32;
    ///
    /// Get the supported CpuID
    ///
    fn get_supported_cpuid(&self) -> Result<Vec<CpuIdEntry>>;
    ///
    /// Get the CpuID leaves the kernel emulates
    ///
    fn get_emulated_cpuid(&self) -> Result<Vec<CpuIdEntry>>;
    ///
    /// Retrieve the list of MSRs supported by the hypervisor.
    ///
    fn get_msr_list(&self) -> Result<Vec<u32>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_numbers_match_abi() {
        assert_eq!(Capability::IrqRouting.number(), kvm_bindings::KVM_CAP_IRQ_ROUTING);
        assert_eq!(Capability::NrMemslots.number(), kvm_bindings::KVM_CAP_NR_MEMSLOTS);
        assert_eq!(Capability::MaxVcpuId.number(), kvm_bindings::KVM_CAP_MAX_VCPU_ID);
        assert_eq!(Capability::ReadonlyMem.number(), kvm_bindings::KVM_CAP_READONLY_MEM);
        assert_eq!(
            Capability::MultiAddressSpace.number(),
            kvm_bindings::KVM_CAP_MULTI_ADDRESS_SPACE
        );
        assert_eq!(Capability::SplitIrqchip.number(), kvm_bindings::KVM_CAP_SPLIT_IRQCHIP);
        assert_eq!(Capability::ImmediateExit.number(), kvm_bindings::KVM_CAP_IMMEDIATE_EXIT);
    }
}
