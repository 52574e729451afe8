// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//
// Copyright © 2020, Microsoft  Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use std::os::raw::c_char;

use kvm_bindings::{
    kvm_guest_debug, kvm_irq_routing_entry, kvm_irq_routing_irqchip, kvm_irq_routing_msi,
    kvm_irqchip, kvm_lapic_state, kvm_userspace_memory_region, kvm_xsave,
    KVM_IRQ_ROUTING_IRQCHIP, KVM_IRQ_ROUTING_MSI, KVM_MSI_VALID_DEVID,
};
use vmm_sys_util::{ioctl_io_nr, ioctl_ioc_nr, ioctl_iow_nr, ioctl_iowr_nr};

use crate::arch::x86::irqchip::{IrqchipKind, IrqchipState, IRQCHIP_STATE_SIZE};
use crate::arch::x86::{GuestDebug, LapicState, XsaveState};
use crate::vm::{IrqRoute, IrqRoutingEntry, UserMemoryRegion};

pub const KVMIO: u32 = 0xAE;

// Requests not wrapped by kvm-ioctls, or whose wrappers drop the result
// this client needs.
ioctl_io_nr!(KVM_CHECK_EXTENSION, KVMIO, 0x03);
ioctl_iowr_nr!(KVM_IRQ_LINE_STATUS, KVMIO, 0x67, kvm_bindings::kvm_irq_level);
ioctl_iow_nr!(KVM_SET_GSI_ROUTING, KVMIO, 0x6a, kvm_bindings::kvm_irq_routing);
ioctl_io_nr!(KVM_SET_BOOT_CPU_ID, KVMIO, 0x78);
ioctl_iow_nr!(KVM_INTERRUPT, KVMIO, 0x86, kvm_bindings::kvm_interrupt);
ioctl_io_nr!(KVM_NMI, KVMIO, 0x9a);
ioctl_io_nr!(KVM_SMI, KVMIO, 0xb7);

pub fn memory_region(region: &UserMemoryRegion) -> kvm_userspace_memory_region {
    kvm_userspace_memory_region {
        slot: region.slot,
        flags: region.flags.bits(),
        guest_phys_addr: region.guest_phys_addr,
        memory_size: region.memory_size,
        userspace_addr: region.userspace_addr,
    }
}

pub fn routing_entry(entry: &IrqRoutingEntry) -> kvm_irq_routing_entry {
    let mut kvm_route = kvm_irq_routing_entry {
        gsi: entry.gsi,
        ..Default::default()
    };

    match entry.route {
        IrqRoute::Irqchip { chip, pin } => {
            kvm_route.type_ = KVM_IRQ_ROUTING_IRQCHIP;
            kvm_route.u.irqchip = kvm_irq_routing_irqchip {
                irqchip: chip.id(),
                pin,
            };
        }
        IrqRoute::Msi(msg) => {
            kvm_route.type_ = KVM_IRQ_ROUTING_MSI;
            let mut msi = kvm_irq_routing_msi {
                address_lo: msg.address_lo,
                address_hi: msg.address_hi,
                data: msg.data,
                ..Default::default()
            };
            if let Some(devid) = msg.devid {
                kvm_route.flags = KVM_MSI_VALID_DEVID;
                msi.__bindgen_anon_1.devid = devid;
            }
            kvm_route.u.msi = msi;
        }
    }

    kvm_route
}

pub fn irqchip_request(kind: IrqchipKind) -> kvm_irqchip {
    kvm_irqchip {
        chip_id: kind.id(),
        ..Default::default()
    }
}

pub fn irqchip_state(kind: IrqchipKind, chip: &kvm_irqchip) -> IrqchipState {
    // SAFETY: every variant of the union is plain bytes, and `dummy` spans
    // all of them.
    let raw = unsafe { chip.chip.dummy };
    let raw: [u8; IRQCHIP_STATE_SIZE] = raw.map(|b| b as u8);
    IrqchipState::decode(kind, &raw)
}

pub fn irqchip_from_state(state: &IrqchipState) -> kvm_irqchip {
    let mut chip = irqchip_request(state.kind());
    chip.chip.dummy = state.encode().map(|b| b as c_char);
    chip
}

pub fn lapic_from_kvm(klapic: &kvm_lapic_state) -> LapicState {
    LapicState {
        regs: klapic.regs.map(|b| b as u8),
    }
}

pub fn lapic_to_kvm(lapic: &LapicState) -> kvm_lapic_state {
    kvm_lapic_state {
        regs: lapic.regs.map(|b| b as c_char),
    }
}

pub fn xsave_from_kvm(xsave: &kvm_xsave) -> XsaveState {
    XsaveState {
        region: xsave.region,
    }
}

pub fn xsave_to_kvm(state: &XsaveState) -> kvm_xsave {
    kvm_xsave {
        region: state.region,
        ..Default::default()
    }
}

pub fn guest_debug_to_kvm(debug: &GuestDebug) -> kvm_guest_debug {
    let mut dbg = kvm_guest_debug {
        control: debug.control,
        ..Default::default()
    };
    dbg.arch.debugreg = debug.debugreg;
    dbg
}

#[cfg(test)]
mod tests {
    use std::mem::{offset_of, size_of};

    use kvm_bindings::{kvm_irq_routing, kvm_msr_entry, kvm_userspace_memory_region};

    use super::*;
    use crate::vm::{MemoryRegionFlags, MsiMessage};

    #[test]
    fn test_wire_layouts() {
        assert_eq!(size_of::<kvm_userspace_memory_region>(), 32);
        assert_eq!(offset_of!(kvm_userspace_memory_region, guest_phys_addr), 8);
        assert_eq!(offset_of!(kvm_userspace_memory_region, userspace_addr), 24);
        assert_eq!(size_of::<kvm_irq_routing_entry>(), 48);
        assert_eq!(offset_of!(kvm_irq_routing_entry, u), 16);
        assert_eq!(size_of::<kvm_irq_routing>(), 8);
        assert_eq!(offset_of!(kvm_msr_entry, data), 8);
        assert_eq!(size_of::<kvm_lapic_state>(), 1024);
    }

    #[test]
    fn test_memory_region_conversion() {
        let region = memory_region(&UserMemoryRegion {
            slot: 3 | (1 << 16),
            flags: MemoryRegionFlags::READONLY | MemoryRegionFlags::LOG_DIRTY_PAGES,
            guest_phys_addr: 0x10_0000,
            memory_size: 0x1000,
            userspace_addr: 0x7f00_0000_0000,
        });
        assert_eq!(region.slot, 0x1_0003);
        assert_eq!(
            region.flags,
            kvm_bindings::KVM_MEM_READONLY | kvm_bindings::KVM_MEM_LOG_DIRTY_PAGES
        );
    }

    #[test]
    fn test_routing_entry_conversion() {
        let route = routing_entry(&IrqRoutingEntry {
            gsi: 5,
            route: IrqRoute::Irqchip {
                chip: IrqchipKind::Ioapic,
                pin: 5,
            },
        });
        assert_eq!(route.type_, KVM_IRQ_ROUTING_IRQCHIP);
        // SAFETY: the entry was built as an irqchip route.
        let irqchip = unsafe { route.u.irqchip };
        assert_eq!(irqchip.irqchip, 2);
        assert_eq!(irqchip.pin, 5);

        let route = routing_entry(&IrqRoutingEntry {
            gsi: 24,
            route: IrqRoute::Msi(MsiMessage {
                address_lo: 0xfee0_0000,
                address_hi: 0,
                data: 0x40,
                devid: Some(0x10),
            }),
        });
        assert_eq!(route.type_, KVM_IRQ_ROUTING_MSI);
        assert_eq!(route.flags, KVM_MSI_VALID_DEVID);
        // SAFETY: the entry was built as an MSI route.
        let msi = unsafe { route.u.msi };
        assert_eq!(msi.data, 0x40);
        // SAFETY: devid was written above.
        assert_eq!(unsafe { msi.__bindgen_anon_1.devid }, 0x10);
    }

    #[test]
    fn test_irqchip_conversion() {
        let mut state = crate::arch::x86::irqchip::PicState::default();
        state.irq_base = 0x20;
        state.elcr = 0x0c;
        let chip = irqchip_from_state(&IrqchipState::PicSlave(state));
        assert_eq!(chip.chip_id, 1);
        assert_eq!(
            irqchip_state(IrqchipKind::PicSlave, &chip),
            IrqchipState::PicSlave(state)
        );
    }
}
