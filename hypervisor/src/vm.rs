// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpu::Vcpu;
use crate::hypervisor::Capability;
pub use crate::arch::x86::irqchip::{IrqchipKind, IrqchipState};

#[derive(Error, Debug)]
///
/// Enum for VM error
pub enum HypervisorVmError {
    ///
    /// Create Vcpu error
    ///
    #[error("Failed to create Vcpu: {0}")]
    CreateVcpu(#[source] anyhow::Error),
    ///
    /// TSS address error
    ///
    #[error("Failed to set TSS address: {0}")]
    SetTssAddress(#[source] anyhow::Error),
    ///
    /// Identity map address error
    ///
    #[error("Failed to set identity map address: {0}")]
    SetIdentityMapAddress(#[source] anyhow::Error),
    ///
    /// Boot CPU id error
    ///
    #[error("Failed to set boot CPU id: {0}")]
    SetBootCpuId(#[source] anyhow::Error),
    ///
    /// Create interrupt controller error
    ///
    #[error("Failed to create interrupt controller: {0}")]
    CreateIrq(#[source] anyhow::Error),
    ///
    /// Get interrupt controller state error
    ///
    #[error("Failed to get interrupt controller state: {0}")]
    GetIrqchip(#[source] anyhow::Error),
    ///
    /// Set interrupt controller state error
    ///
    #[error("Failed to set interrupt controller state: {0}")]
    SetIrqchip(#[source] anyhow::Error),
    ///
    /// Interrupt line error
    ///
    #[error("Failed to set interrupt line: {0}")]
    SetIrqLine(#[source] anyhow::Error),
    ///
    /// Set GSI routing error
    ///
    #[error("Failed to set GSI routing: {0}")]
    SetGsiRouting(#[source] anyhow::Error),
    ///
    /// Set user memory error
    ///
    #[error("Failed to set user memory: {0}")]
    SetUserMemory(#[source] anyhow::Error),
    ///
    /// Get dirty log error
    ///
    #[error("Failed to get dirty log: {0}")]
    GetDirtyLog(#[source] anyhow::Error),
    ///
    /// Enable capability error
    ///
    #[error("Failed to enable capability: {0}")]
    EnableCap(#[source] anyhow::Error),
    ///
    /// Enabling split irqchip error
    ///
    #[error("Failed to enable split Irq: {0}")]
    EnableSplitIrq(#[source] anyhow::Error),
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorVmError>;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryRegionFlags: u32 {
        const LOG_DIRTY_PAGES = 1;
        const READONLY = 1 << 1;
    }
}

/// A guest-physical to host-virtual mapping as handed to the kernel.
///
/// `slot` already carries the address-space id in its upper 16 bits. A
/// `memory_size` of zero removes the slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserMemoryRegion {
    pub slot: u32,
    pub flags: MemoryRegionFlags,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

/// An MSI message as written by a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsiMessage {
    pub address_lo: u32,
    pub address_hi: u32,
    pub data: u32,
    /// Requester id, only meaningful when the VM uses MSI device ids.
    pub devid: Option<u32>,
}

impl MsiMessage {
    pub fn address(&self) -> u64 {
        (u64::from(self.address_hi) << 32) | u64::from(self.address_lo)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrqRoute {
    Irqchip { chip: IrqchipKind, pin: u32 },
    Msi(MsiMessage),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrqRoutingEntry {
    pub gsi: u32,
    pub route: IrqRoute,
}

///
/// Trait to represent a Vm
///
/// This crate provides a hypervisor-agnostic interfaces for Vm
///
pub trait Vm: Send + Sync {
    /// Queries a VM-scoped capability. Zero means absent; positive values
    /// may carry a count.
    fn check_extension(&self, cap: Capability) -> i32;
    /// Creates a new vCPU and maps its run page.
    fn create_vcpu(&self, id: u32) -> Result<Box<dyn Vcpu>>;
    /// Sets the address of the three-page region in the VM's address space.
    fn set_tss_address(&self, addr: u64) -> Result<()>;
    /// Sets the address of the one-page identity map.
    fn set_identity_map_address(&self, addr: u64) -> Result<()>;
    /// Selects which vCPU id starts as the bootstrap processor.
    fn set_boot_cpu_id(&self, id: u32) -> Result<()>;
    /// Creates an in-kernel interrupt controller.
    fn create_irq_chip(&self) -> Result<()>;
    /// Enables the split irqchip: LAPICs in kernel, PIC and IOAPIC in user space.
    fn enable_split_irq(&self) -> Result<()>;
    /// Enables a capability with up to four arguments.
    fn enable_cap(&self, cap: Capability, args: [u64; 4]) -> Result<()>;
    /// Reads the state of one in-kernel interrupt controller.
    fn get_irqchip(&self, kind: IrqchipKind) -> Result<IrqchipState>;
    /// Writes the state of one in-kernel interrupt controller.
    fn set_irqchip(&self, state: &IrqchipState) -> Result<()>;
    /// Sets the level of a GSI, returning the delivery status reported by
    /// the kernel (positive when delivered, zero when coalesced).
    fn irq_line(&self, gsi: u32, level: bool) -> Result<i32>;
    /// Sets the GSI routing table entries, overwriting any previously set
    /// entries.
    fn set_gsi_routing(&self, entries: &[IrqRoutingEntry]) -> Result<()>;
    /// Creates/modifies a guest physical memory slot.
    fn set_user_memory_region(&self, region: UserMemoryRegion) -> Result<()>;
    /// Fetches and clears the dirty-page bitmap of a slot, one bit per page
    /// packed into 64-bit words.
    fn get_dirty_log(&self, slot: u32, memory_size: u64) -> Result<Vec<u64>>;
}

/// Attributes of a guest memory or IO transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemTxAttrs {
    /// The access was made from system management mode.
    pub smm: bool,
    /// vCPU that issued the access.
    pub requester_id: u32,
}

///
/// Callbacks from the execution loop into the emulator's device models.
///
/// IO and MMIO handlers run under the device-access lock. The remaining
/// hooks have no-op defaults.
///
pub trait VmOps: Send + Sync {
    fn pio_read(&self, port: u64, data: &mut [u8], attrs: MemTxAttrs) -> Result<()>;
    fn pio_write(&self, port: u64, data: &[u8], attrs: MemTxAttrs) -> Result<()>;
    fn mmio_read(&self, gpa: u64, data: &mut [u8], attrs: MemTxAttrs) -> Result<()>;
    fn mmio_write(&self, gpa: u64, data: &[u8], attrs: MemTxAttrs) -> Result<()>;
    /// End of interrupt for a level-triggered vector, to be broadcast to
    /// the IOAPIC model.
    fn eoi(&self, _vector: u8) {}
    /// A guest access to the TPR, for the APIC model.
    fn tpr_access(&self, _vcpu_id: u32, _rip: u64, _is_write: bool) {}
    /// User-space PIC: returns the vector to inject when an interrupt is
    /// deliverable.
    fn pic_interrupt(&self) -> Option<u8> {
        None
    }
    /// User-space APIC: task priority to expose through CR8.
    fn apic_tpr(&self, _vcpu_id: u32) -> u8 {
        0
    }
    /// User-space APIC: task priority and base reported by the guest.
    fn apic_update(&self, _vcpu_id: u32, _tpr: u8, _apic_base: u64) {}
    /// User-space APIC: re-evaluate pending interrupts for a vCPU.
    fn apic_poll(&self, _vcpu_id: u32) {}
    fn request_reset(&self) {}
    fn request_shutdown(&self) {}
    /// The guest reported a crash. `state` is a serialized register dump.
    fn request_panic(&self, _vcpu_id: u32, _state: &str) {}
}
