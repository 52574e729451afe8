// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

//! Save and restore of the interrupt controllers emulated by the kernel.
//!
//! The emulator's device models hold the architectural register view of
//! the PICs, the IOAPIC and the local APICs. When the kernel emulates those
//! chips, the proxies here move that view in and out of the kernel around
//! a save or a load.

use hypervisor::arch::x86::irqchip::{IoapicState, PicState};
use hypervisor::arch::x86::{LapicState, NUM_IOAPIC_PINS};
use hypervisor::{HypervisorCpuError, HypervisorVmError, IrqchipKind, IrqchipState, Vcpu, Vm};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where the kernel IOAPIC decodes MMIO.
pub const IOAPIC_DEFAULT_BASE_ADDRESS: u64 = 0xfec0_0000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error reading interrupt controller state")]
    GetIrqchip(#[source] HypervisorVmError),

    #[error("Error writing interrupt controller state")]
    SetIrqchip(#[source] HypervisorVmError),

    #[error("Kernel returned the state of the wrong chip, expected {0:?}")]
    WrongChip(IrqchipKind),

    #[error("Error reading local APIC state")]
    GetLapic(#[source] HypervisorCpuError),

    #[error("Error writing local APIC state")]
    SetLapic(#[source] HypervisorCpuError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Register view of one 8259 PIC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PicDeviceState {
    pub last_irr: u8,
    pub irr: u8,
    pub imr: u8,
    pub isr: u8,
    pub priority_add: u8,
    pub irq_base: u8,
    pub read_reg_select: u8,
    pub poll: bool,
    pub special_mask: bool,
    pub init_state: u8,
    pub auto_eoi: bool,
    pub rotate_on_auto_eoi: bool,
    pub special_fully_nested_mode: bool,
    pub init4: bool,
    pub elcr: u8,
    pub elcr_mask: u8,
}

impl From<&PicState> for PicDeviceState {
    fn from(k: &PicState) -> Self {
        PicDeviceState {
            last_irr: k.last_irr,
            irr: k.irr,
            imr: k.imr,
            isr: k.isr,
            priority_add: k.priority_add,
            irq_base: k.irq_base,
            read_reg_select: k.read_reg_select,
            poll: k.poll != 0,
            special_mask: k.special_mask != 0,
            init_state: k.init_state,
            auto_eoi: k.auto_eoi != 0,
            rotate_on_auto_eoi: k.rotate_on_auto_eoi != 0,
            special_fully_nested_mode: k.special_fully_nested_mode != 0,
            init4: k.init4 != 0,
            elcr: k.elcr,
            elcr_mask: k.elcr_mask,
        }
    }
}

impl From<&PicDeviceState> for PicState {
    fn from(s: &PicDeviceState) -> Self {
        PicState {
            last_irr: s.last_irr,
            irr: s.irr,
            imr: s.imr,
            isr: s.isr,
            priority_add: s.priority_add,
            irq_base: s.irq_base,
            read_reg_select: s.read_reg_select,
            poll: s.poll.into(),
            special_mask: s.special_mask.into(),
            init_state: s.init_state,
            auto_eoi: s.auto_eoi.into(),
            rotate_on_auto_eoi: s.rotate_on_auto_eoi.into(),
            special_fully_nested_mode: s.special_fully_nested_mode.into(),
            init4: s.init4.into(),
            elcr: s.elcr,
            elcr_mask: s.elcr_mask,
        }
    }
}

/// Proxy for the kernel master or slave PIC.
#[derive(Clone, Copy, Debug)]
pub struct PicProxy {
    pub master: bool,
}

impl PicProxy {
    fn kind(&self) -> IrqchipKind {
        if self.master {
            IrqchipKind::PicMaster
        } else {
            IrqchipKind::PicSlave
        }
    }

    pub fn pre_save(&self, vm: &dyn Vm) -> Result<PicDeviceState> {
        let kind = self.kind();
        match vm.get_irqchip(kind).map_err(Error::GetIrqchip)? {
            IrqchipState::PicMaster(state) | IrqchipState::PicSlave(state) => {
                Ok(PicDeviceState::from(&state))
            }
            IrqchipState::Ioapic(_) => Err(Error::WrongChip(kind)),
        }
    }

    pub fn post_load(&self, vm: &dyn Vm, state: &PicDeviceState) -> Result<()> {
        let chip = PicState::from(state);
        let state = if self.master {
            IrqchipState::PicMaster(chip)
        } else {
            IrqchipState::PicSlave(chip)
        };
        vm.set_irqchip(&state).map_err(Error::SetIrqchip)
    }
}

// I/O REDIRECTION TABLE REGISTER
//
// 63-56: Destination Field
// 16:    Interrupt Mask
// 15:    Trigger Mode
// 14:    Remote IRR
// 13:    Interrupt Input Pin Polarity
// 12:    Delivery Status
// 11:    Destination Mode
// 10-8:  Delivery Mode
// 7-0:   Interrupt Vector
pub type RedirectionTableEntry = u64;

pub fn vector(entry: RedirectionTableEntry) -> u8 {
    (entry & 0xffu64) as u8
}
pub fn delivery_mode(entry: RedirectionTableEntry) -> u8 {
    ((entry >> 8) & 0x7u64) as u8
}
pub fn destination_mode(entry: RedirectionTableEntry) -> u8 {
    ((entry >> 11) & 0x1u64) as u8
}
pub fn delivery_status(entry: RedirectionTableEntry) -> u8 {
    ((entry >> 12) & 0x1u64) as u8
}
pub fn polarity(entry: RedirectionTableEntry) -> u8 {
    ((entry >> 13) & 0x1u64) as u8
}
pub fn remote_irr(entry: RedirectionTableEntry) -> u8 {
    ((entry >> 14) & 0x1u64) as u8
}
pub fn trigger_mode(entry: RedirectionTableEntry) -> u8 {
    ((entry >> 15) & 0x1u64) as u8
}
pub fn interrupt_mask(entry: RedirectionTableEntry) -> u8 {
    ((entry >> 16) & 0x1u64) as u8
}
pub fn destination_field(entry: RedirectionTableEntry) -> u8 {
    ((entry >> 56) & 0xffu64) as u8
}

/// Register view of the IOAPIC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoapicDeviceState {
    pub id: u8,
    pub ioregsel: u8,
    pub irr: u32,
    pub ioredtbl: [RedirectionTableEntry; NUM_IOAPIC_PINS],
}

/// Proxy for the kernel IOAPIC.
#[derive(Clone, Copy, Debug)]
pub struct IoapicProxy;

impl IoapicProxy {
    pub fn pre_save(&self, vm: &dyn Vm) -> Result<IoapicDeviceState> {
        match vm
            .get_irqchip(IrqchipKind::Ioapic)
            .map_err(Error::GetIrqchip)?
        {
            IrqchipState::Ioapic(k) => Ok(IoapicDeviceState {
                id: k.id as u8,
                ioregsel: k.ioregsel as u8,
                irr: k.irr,
                ioredtbl: k.redirtbl,
            }),
            _ => Err(Error::WrongChip(IrqchipKind::Ioapic)),
        }
    }

    pub fn post_load(&self, vm: &dyn Vm, state: &IoapicDeviceState) -> Result<()> {
        let chip = IoapicState {
            base_address: IOAPIC_DEFAULT_BASE_ADDRESS,
            ioregsel: u32::from(state.ioregsel),
            id: u32::from(state.id),
            irr: state.irr,
            redirtbl: state.ioredtbl,
        };
        vm.set_irqchip(&IrqchipState::Ioapic(chip))
            .map_err(Error::SetIrqchip)
    }
}

const APIC_ID: usize = 0x20;
const APIC_TASKPRI: usize = 0x80;
const APIC_ARBPRI: usize = 0x90;
const APIC_LDR: usize = 0xd0;
const APIC_DFR: usize = 0xe0;
const APIC_SPIV: usize = 0xf0;
const APIC_ISR: usize = 0x100;
const APIC_TMR: usize = 0x180;
const APIC_IRR: usize = 0x200;
const APIC_ESR: usize = 0x280;
const APIC_ICR: usize = 0x300;
const APIC_ICR2: usize = 0x310;
const APIC_LVT: usize = 0x320;
const APIC_TMICT: usize = 0x380;
const APIC_TDCR: usize = 0x3e0;

pub const APIC_LVT_NB: usize = 6;

/// Register view of a local APIC.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApicDeviceState {
    pub id: u8,
    pub tpr: u8,
    pub arb_id: u8,
    pub log_dest: u8,
    pub dest_mode: u8,
    pub spurious_vec: u32,
    pub isr: [u32; 8],
    pub tmr: [u32; 8],
    pub irr: [u32; 8],
    pub esr: u32,
    pub icr: [u32; 2],
    pub lvt: [u32; APIC_LVT_NB],
    pub initial_count: u32,
    pub divide_conf: u32,
    pub count_shift: u8,
}

impl ApicDeviceState {
    fn unpack(kapic: &LapicState) -> Self {
        let mut s = ApicDeviceState {
            id: (kapic.get_reg(APIC_ID) >> 24) as u8,
            tpr: kapic.get_reg(APIC_TASKPRI) as u8,
            arb_id: kapic.get_reg(APIC_ARBPRI) as u8,
            log_dest: (kapic.get_reg(APIC_LDR) >> 24) as u8,
            dest_mode: (kapic.get_reg(APIC_DFR) >> 28) as u8,
            spurious_vec: kapic.get_reg(APIC_SPIV),
            esr: kapic.get_reg(APIC_ESR),
            icr: [kapic.get_reg(APIC_ICR), kapic.get_reg(APIC_ICR2)],
            initial_count: kapic.get_reg(APIC_TMICT),
            divide_conf: kapic.get_reg(APIC_TDCR),
            ..Default::default()
        };
        for i in 0..8 {
            s.isr[i] = kapic.get_reg(APIC_ISR + i * 0x10);
            s.tmr[i] = kapic.get_reg(APIC_TMR + i * 0x10);
            s.irr[i] = kapic.get_reg(APIC_IRR + i * 0x10);
        }
        for (i, lvt) in s.lvt.iter_mut().enumerate() {
            *lvt = kapic.get_reg(APIC_LVT + i * 0x10);
        }
        s.count_shift = timer_count_shift(s.divide_conf);
        s
    }

    fn pack(&self, kapic: &mut LapicState) {
        kapic.set_reg(APIC_ID, u32::from(self.id) << 24);
        kapic.set_reg(APIC_TASKPRI, u32::from(self.tpr));
        kapic.set_reg(APIC_LDR, u32::from(self.log_dest) << 24);
        kapic.set_reg(APIC_DFR, (u32::from(self.dest_mode) << 28) | 0x0fff_ffff);
        kapic.set_reg(APIC_SPIV, self.spurious_vec);
        for i in 0..8 {
            kapic.set_reg(APIC_ISR + i * 0x10, self.isr[i]);
            kapic.set_reg(APIC_TMR + i * 0x10, self.tmr[i]);
            kapic.set_reg(APIC_IRR + i * 0x10, self.irr[i]);
        }
        kapic.set_reg(APIC_ESR, self.esr);
        kapic.set_reg(APIC_ICR, self.icr[0]);
        kapic.set_reg(APIC_ICR2, self.icr[1]);
        for (i, lvt) in self.lvt.iter().enumerate() {
            kapic.set_reg(APIC_LVT + i * 0x10, *lvt);
        }
        kapic.set_reg(APIC_TMICT, self.initial_count);
        kapic.set_reg(APIC_TDCR, self.divide_conf);
    }
}

/// Timer divisor exponent encoded by the divide configuration register.
pub fn timer_count_shift(divide_conf: u32) -> u8 {
    let v = (divide_conf & 3) | ((divide_conf >> 1) & 4);
    ((v + 1) & 7) as u8
}

/// Proxy for a kernel local APIC. Must be used from the vCPU's thread.
#[derive(Clone, Copy, Debug)]
pub struct ApicProxy;

impl ApicProxy {
    pub fn pre_save(&self, vcpu: &dyn Vcpu) -> Result<ApicDeviceState> {
        let kapic = vcpu.get_lapic().map_err(Error::GetLapic)?;
        Ok(ApicDeviceState::unpack(&kapic))
    }

    pub fn post_load(&self, vcpu: &dyn Vcpu, state: &ApicDeviceState) -> Result<()> {
        let mut kapic = LapicState::default();
        state.pack(&mut kapic);
        vcpu.set_lapic(&kapic).map_err(Error::SetLapic)
    }
}

#[cfg(test)]
mod tests {
    use hypervisor::mock::MockHypervisor;
    use hypervisor::Hypervisor;

    use super::*;

    #[test]
    fn test_redirection_entry_fields() {
        let entry: RedirectionTableEntry =
            (0x3u64 << 56) | (1 << 16) | (1 << 15) | (1 << 13) | (1 << 11) | (0x5 << 8) | 0x31;
        assert_eq!(vector(entry), 0x31);
        assert_eq!(delivery_mode(entry), 5);
        assert_eq!(destination_mode(entry), 1);
        assert_eq!(delivery_status(entry), 0);
        assert_eq!(polarity(entry), 1);
        assert_eq!(remote_irr(entry), 0);
        assert_eq!(trigger_mode(entry), 1);
        assert_eq!(interrupt_mask(entry), 1);
        assert_eq!(destination_field(entry), 3);
    }

    #[test]
    fn test_timer_count_shift() {
        // Divide by 2, 16 and 1.
        assert_eq!(timer_count_shift(0b0000), 1);
        assert_eq!(timer_count_shift(0b0011), 4);
        assert_eq!(timer_count_shift(0b1011), 0);
    }

    #[test]
    fn test_pic_proxy() {
        let vm = MockHypervisor::new().create_vm().unwrap();
        vm.create_irq_chip().unwrap();

        let slave = PicProxy { master: false };
        let mut state = slave.pre_save(vm.as_ref()).unwrap();
        assert_eq!(state, PicDeviceState::default());
        state.imr = 0xfb;
        state.irq_base = 0x70;
        state.auto_eoi = true;
        state.elcr_mask = 0xde;
        slave.post_load(vm.as_ref(), &state).unwrap();

        match vm.get_irqchip(IrqchipKind::PicSlave).unwrap() {
            IrqchipState::PicSlave(k) => {
                assert_eq!(k.imr, 0xfb);
                assert_eq!(k.irq_base, 0x70);
                assert_eq!(k.auto_eoi, 1);
                assert_eq!(k.elcr_mask, 0xde);
            }
            other => panic!("unexpected chip {:?}", other),
        }
        // The master is untouched.
        let master = PicProxy { master: true }.pre_save(vm.as_ref()).unwrap();
        assert_eq!(master, PicDeviceState::default());
    }

    #[test]
    fn test_proxies_need_kernel_chips() {
        let vm = MockHypervisor::new().create_vm().unwrap();
        assert!(matches!(
            IoapicProxy.pre_save(vm.as_ref()),
            Err(Error::GetIrqchip(_))
        ));
        assert!(matches!(
            PicProxy { master: true }.post_load(vm.as_ref(), &PicDeviceState::default()),
            Err(Error::SetIrqchip(_))
        ));
    }

    #[test]
    fn test_ioapic_proxy() {
        let vm = MockHypervisor::new().create_vm().unwrap();
        vm.create_irq_chip().unwrap();

        let mut state = IoapicProxy.pre_save(vm.as_ref()).unwrap();
        state.id = 4;
        state.ioregsel = 0x12;
        state.irr = 1 << 9;
        state.ioredtbl[9] = (1 << 15) | 0x29;
        IoapicProxy.post_load(vm.as_ref(), &state).unwrap();

        match vm.get_irqchip(IrqchipKind::Ioapic).unwrap() {
            IrqchipState::Ioapic(k) => {
                assert_eq!(k.base_address, IOAPIC_DEFAULT_BASE_ADDRESS);
                assert_eq!(k.id, 4);
                assert_eq!(k.ioregsel, 0x12);
                assert_eq!(k.irr, 1 << 9);
                assert_eq!(k.redirtbl[9], (1 << 15) | 0x29);
            }
            other => panic!("unexpected chip {:?}", other),
        }
        assert_eq!(IoapicProxy.pre_save(vm.as_ref()).unwrap(), state);
    }

    #[test]
    fn test_apic_proxy() {
        let vm = MockHypervisor::new().create_vm().unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();

        let mut kapic = LapicState::default();
        kapic.set_reg(APIC_ID, 2 << 24);
        kapic.set_reg(APIC_ARBPRI, 0x11);
        kapic.set_reg(APIC_DFR, 0xf000_0000);
        kapic.set_reg(APIC_ISR + 0x10, 0x8000);
        kapic.set_reg(APIC_LVT + 0x50, 0x1_00fe);
        kapic.set_reg(APIC_TDCR, 0b1010);
        vcpu.set_lapic(&kapic).unwrap();

        let state = ApicProxy.pre_save(vcpu.as_ref()).unwrap();
        assert_eq!(state.id, 2);
        assert_eq!(state.arb_id, 0x11);
        assert_eq!(state.dest_mode, 0xf);
        assert_eq!(state.isr[1], 0x8000);
        assert_eq!(state.lvt[5], 0x1_00fe);
        assert_eq!(state.count_shift, timer_count_shift(0b1010));

        ApicProxy.post_load(vcpu.as_ref(), &state).unwrap();
        let kapic = vcpu.get_lapic().unwrap();
        assert_eq!(kapic.get_reg(APIC_ID), 2 << 24);
        assert_eq!(kapic.get_reg(APIC_DFR), 0xffff_ffff);
        assert_eq!(kapic.get_reg(APIC_LVT + 0x50), 0x1_00fe);
        // Arbitration priority is derived by the kernel and not restored.
        assert_eq!(kapic.get_reg(APIC_ARBPRI), 0);
    }
}
