// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! A generic abstraction around an in-kernel x86 hypervisor
//!
//! This crate offers a trait abstraction for the global hypervisor device,
//! the VM handle and the vCPU handle, together with the fixed-layout codec
//! for the memory-mapped run page they share with the kernel.
//!
//! # Backends
//!
//! - `kvm`: the Linux kernel driver
//! - `mock`: a scripted, in-process backend used by tests
//!

#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

/// Architecture specific definitions
#[macro_use]
pub mod arch;
#[cfg(feature = "kvm")]
/// KVM implementation module
pub mod kvm;
#[cfg(any(test, feature = "mock"))]
/// Scripted in-process backend
pub mod mock;

/// Hypevisor related module
pub mod hypervisor;
/// Vm related module
pub mod vm;
/// CPU related module
mod cpu;

use std::sync::Arc;

pub use crate::hypervisor::{Capability, Hypervisor, HypervisorError};
pub use arch::x86;
pub use cpu::{
    DebugExit, HypervisorCpuError, InternalErrorKind, RunExit, SystemEventKind, TranslatedAddress,
    Vcpu, VmExit,
};
pub use vm::{
    HypervisorVmError, IrqRoute, IrqRoutingEntry, IrqchipKind, IrqchipState, MemTxAttrs,
    MemoryRegionFlags, MsiMessage, UserMemoryRegion, Vm, VmOps,
};

/// Opens the default hypervisor backend for this build.
pub fn new() -> std::result::Result<Arc<dyn Hypervisor>, HypervisorError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "kvm")] {
            let hv = kvm::KvmHypervisor::new()?;
            Ok(Arc::new(hv))
        } else {
            Err(HypervisorError::HypervisorCreate(anyhow!(
                "no hypervisor backend compiled in"
            )))
        }
    }
}
