// Copyright © 2020, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Kernel-resident interrupt controller state.
//!
//! The irqchip get/set requests carry a chip id followed by a 512-byte
//! union holding either a PIC or an IOAPIC state block. This module packs
//! and unpacks those blocks.

use byteorder::{ByteOrder, NativeEndian};
use serde::{Deserialize, Serialize};

use super::NUM_IOAPIC_PINS;

/// Size of the chip-specific union in an irqchip request.
pub const IRQCHIP_STATE_SIZE: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IrqchipKind {
    PicMaster,
    PicSlave,
    Ioapic,
}

impl IrqchipKind {
    /// Chip id as used on the wire.
    pub fn id(self) -> u32 {
        match self {
            IrqchipKind::PicMaster => 0,
            IrqchipKind::PicSlave => 1,
            IrqchipKind::Ioapic => 2,
        }
    }

    /// Number of input pins the chip exposes for routing.
    pub fn pins(self) -> u32 {
        match self {
            IrqchipKind::PicMaster | IrqchipKind::PicSlave => super::NUM_PIC_PINS as u32,
            IrqchipKind::Ioapic => NUM_IOAPIC_PINS as u32,
        }
    }
}

/// One 8259 PIC, field for field as the kernel stores it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PicState {
    pub last_irr: u8,
    pub irr: u8,
    pub imr: u8,
    pub isr: u8,
    pub priority_add: u8,
    pub irq_base: u8,
    pub read_reg_select: u8,
    pub poll: u8,
    pub special_mask: u8,
    pub init_state: u8,
    pub auto_eoi: u8,
    pub rotate_on_auto_eoi: u8,
    pub special_fully_nested_mode: u8,
    pub init4: u8,
    pub elcr: u8,
    pub elcr_mask: u8,
}

impl PicState {
    pub fn decode(raw: &[u8; IRQCHIP_STATE_SIZE]) -> Self {
        PicState {
            last_irr: raw[0],
            irr: raw[1],
            imr: raw[2],
            isr: raw[3],
            priority_add: raw[4],
            irq_base: raw[5],
            read_reg_select: raw[6],
            poll: raw[7],
            special_mask: raw[8],
            init_state: raw[9],
            auto_eoi: raw[10],
            rotate_on_auto_eoi: raw[11],
            special_fully_nested_mode: raw[12],
            init4: raw[13],
            elcr: raw[14],
            elcr_mask: raw[15],
        }
    }

    pub fn encode(&self, raw: &mut [u8; IRQCHIP_STATE_SIZE]) {
        raw[..16].copy_from_slice(&[
            self.last_irr,
            self.irr,
            self.imr,
            self.isr,
            self.priority_add,
            self.irq_base,
            self.read_reg_select,
            self.poll,
            self.special_mask,
            self.init_state,
            self.auto_eoi,
            self.rotate_on_auto_eoi,
            self.special_fully_nested_mode,
            self.init4,
            self.elcr,
            self.elcr_mask,
        ]);
    }
}

const IOAPIC_BASE_ADDRESS_OFFSET: usize = 0;
const IOAPIC_IOREGSEL_OFFSET: usize = 8;
const IOAPIC_ID_OFFSET: usize = 12;
const IOAPIC_IRR_OFFSET: usize = 16;
const IOAPIC_REDIRTBL_OFFSET: usize = 24;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoapicState {
    pub base_address: u64,
    pub ioregsel: u32,
    pub id: u32,
    pub irr: u32,
    /// Raw 64-bit redirection table entries.
    pub redirtbl: [u64; NUM_IOAPIC_PINS],
}

impl IoapicState {
    pub fn decode(raw: &[u8; IRQCHIP_STATE_SIZE]) -> Self {
        let mut redirtbl = [0u64; NUM_IOAPIC_PINS];
        for (i, entry) in redirtbl.iter_mut().enumerate() {
            *entry = NativeEndian::read_u64(&raw[IOAPIC_REDIRTBL_OFFSET + i * 8..]);
        }
        IoapicState {
            base_address: NativeEndian::read_u64(&raw[IOAPIC_BASE_ADDRESS_OFFSET..]),
            ioregsel: NativeEndian::read_u32(&raw[IOAPIC_IOREGSEL_OFFSET..]),
            id: NativeEndian::read_u32(&raw[IOAPIC_ID_OFFSET..]),
            irr: NativeEndian::read_u32(&raw[IOAPIC_IRR_OFFSET..]),
            redirtbl,
        }
    }

    pub fn encode(&self, raw: &mut [u8; IRQCHIP_STATE_SIZE]) {
        NativeEndian::write_u64(&mut raw[IOAPIC_BASE_ADDRESS_OFFSET..], self.base_address);
        NativeEndian::write_u32(&mut raw[IOAPIC_IOREGSEL_OFFSET..], self.ioregsel);
        NativeEndian::write_u32(&mut raw[IOAPIC_ID_OFFSET..], self.id);
        NativeEndian::write_u32(&mut raw[IOAPIC_IRR_OFFSET..], self.irr);
        for (i, entry) in self.redirtbl.iter().enumerate() {
            NativeEndian::write_u64(&mut raw[IOAPIC_REDIRTBL_OFFSET + i * 8..], *entry);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrqchipState {
    PicMaster(PicState),
    PicSlave(PicState),
    Ioapic(IoapicState),
}

impl IrqchipState {
    pub fn kind(&self) -> IrqchipKind {
        match self {
            IrqchipState::PicMaster(_) => IrqchipKind::PicMaster,
            IrqchipState::PicSlave(_) => IrqchipKind::PicSlave,
            IrqchipState::Ioapic(_) => IrqchipKind::Ioapic,
        }
    }

    pub fn decode(kind: IrqchipKind, raw: &[u8; IRQCHIP_STATE_SIZE]) -> Self {
        match kind {
            IrqchipKind::PicMaster => IrqchipState::PicMaster(PicState::decode(raw)),
            IrqchipKind::PicSlave => IrqchipState::PicSlave(PicState::decode(raw)),
            IrqchipKind::Ioapic => IrqchipState::Ioapic(IoapicState::decode(raw)),
        }
    }

    pub fn encode(&self) -> [u8; IRQCHIP_STATE_SIZE] {
        let mut raw = [0u8; IRQCHIP_STATE_SIZE];
        match self {
            IrqchipState::PicMaster(pic) | IrqchipState::PicSlave(pic) => pic.encode(&mut raw),
            IrqchipState::Ioapic(ioapic) => ioapic.encode(&mut raw),
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use std::mem::{offset_of, size_of};

    use kvm_bindings::{kvm_ioapic_state, kvm_irqchip, kvm_pic_state};

    use super::*;

    #[test]
    fn test_layout_matches_abi() {
        assert_eq!(size_of::<kvm_pic_state>(), 16);
        assert_eq!(offset_of!(kvm_pic_state, elcr_mask), 15);
        assert_eq!(offset_of!(kvm_pic_state, special_fully_nested_mode), 12);
        assert_eq!(offset_of!(kvm_ioapic_state, ioregsel), IOAPIC_IOREGSEL_OFFSET);
        assert_eq!(offset_of!(kvm_ioapic_state, id), IOAPIC_ID_OFFSET);
        assert_eq!(offset_of!(kvm_ioapic_state, irr), IOAPIC_IRR_OFFSET);
        assert_eq!(offset_of!(kvm_ioapic_state, redirtbl), IOAPIC_REDIRTBL_OFFSET);
        assert_eq!(offset_of!(kvm_irqchip, chip), 8);
        assert_eq!(size_of::<kvm_irqchip>(), 8 + IRQCHIP_STATE_SIZE);
    }

    #[test]
    fn test_ioapic_entries_land_at_their_offsets() {
        let mut state = IoapicState {
            id: 2,
            ..Default::default()
        };
        state.redirtbl[23] = 0xff00_0000_0001_0030;
        let raw = IrqchipState::Ioapic(state).encode();
        assert_eq!(NativeEndian::read_u32(&raw[12..]), 2);
        assert_eq!(
            NativeEndian::read_u64(&raw[IOAPIC_REDIRTBL_OFFSET + 23 * 8..]),
            0xff00_0000_0001_0030
        );
        assert_eq!(IoapicState::decode(&raw), state);
    }

    #[test]
    fn test_pic_fields_in_order() {
        let mut raw = [0u8; IRQCHIP_STATE_SIZE];
        for (i, b) in raw[..16].iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        let pic = PicState::decode(&raw);
        assert_eq!(pic.last_irr, 1);
        assert_eq!(pic.irq_base, 6);
        assert_eq!(pic.elcr_mask, 16);
        assert_eq!(IrqchipKind::PicSlave.id(), 1);
        assert_eq!(IrqchipKind::Ioapic.pins(), 24);
    }
}
