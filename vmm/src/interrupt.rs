// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

use std::sync::Arc;

use hypervisor::{
    HypervisorVmError, IrqRoute, IrqRoutingEntry, IrqchipKind, MsiMessage, Vm,
};
use thiserror::Error;

use crate::config::IrqchipMode;
use crate::session::Session;

const MIN_ROUTING_ENTRIES: usize = 64;
const MSI_CACHE_BUCKETS: usize = 256;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No free GSI")]
    NoSpace,

    #[error("No MSI route for GSI {0}")]
    NotFound(u32),

    #[error("Pin {pin} is out of range for {chip:?}")]
    InvalidPin { chip: IrqchipKind, pin: u32 },

    #[error("Device {device} has no MSI vector {vector}")]
    InvalidVector { device: u32, vector: u32 },

    #[error("Failed to set GSI routing")]
    SetGsiRouting(#[source] HypervisorVmError),

    #[error("Failed to set interrupt line")]
    SetIrqLine(#[source] HypervisorVmError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A device able to describe its MSI vectors.
pub trait MsiSource: Send + Sync {
    /// Identifies the device in the routing side table.
    fn id(&self) -> u32;
    fn vector_count(&self) -> u32;
    /// Message currently programmed for `vector`.
    fn msi_message(&self, vector: u32) -> MsiMessage;
    /// Requester id, reported when the VM uses MSI device ids.
    fn requester_id(&self) -> u32 {
        0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MsiCacheEntry {
    address: u64,
    data: u32,
    gsi: u32,
}

/// A route added on behalf of a device vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsiRouteRecord {
    pub device: u32,
    pub vector: u32,
    pub gsi: u32,
}

/// The VM's GSI routing table.
///
/// Changes are staged locally; the kernel only sees them on
/// [`commit_routes`](IrqRoutingManager::commit_routes), which replaces the
/// whole table.
pub struct IrqRoutingManager {
    vm: Arc<dyn Vm>,
    entries: Vec<IrqRoutingEntry>,
    // Positions in `entries` of each GSI's routes.
    gsi_entries: Vec<Vec<usize>>,
    used_gsi: Vec<u64>,
    gsi_count: u32,
    msi_devid: bool,
    msi_cache: Vec<Vec<MsiCacheEntry>>,
    msi_routes: Vec<MsiRouteRecord>,
}

impl IrqRoutingManager {
    pub fn new(session: &Session) -> Result<Self> {
        let caps = session.capabilities();
        let mut manager = IrqRoutingManager {
            vm: session.vm().clone(),
            entries: Vec::new(),
            gsi_entries: vec![Vec::new(); caps.gsi_count as usize],
            used_gsi: vec![0; (caps.gsi_count as usize).div_ceil(64)],
            gsi_count: caps.gsi_count,
            msi_devid: caps.msi_devid,
            msi_cache: vec![Vec::new(); MSI_CACHE_BUCKETS],
            msi_routes: Vec::new(),
        };

        if session.config().kernel_irqchip == IrqchipMode::On && caps.gsi_count > 0 {
            manager.setup_default_routes()?;
            manager.commit_routes()?;
        }
        Ok(manager)
    }

    // Legacy ISA interrupts go to both PICs and the IOAPIC. GSI 2 is the
    // PIC cascade, so IOAPIC pin 0 (the timer) takes its place.
    fn setup_default_routes(&mut self) -> Result<()> {
        for pin in 0..8 {
            if pin != 2 {
                self.add_irqchip_route(pin, IrqchipKind::PicMaster, pin)?;
            }
        }
        for pin in 0..8 {
            self.add_irqchip_route(8 + pin, IrqchipKind::PicSlave, pin)?;
        }
        for pin in 0..IrqchipKind::Ioapic.pins() {
            match pin {
                0 => self.add_irqchip_route(2, IrqchipKind::Ioapic, 0)?,
                2 => {}
                _ => self.add_irqchip_route(pin, IrqchipKind::Ioapic, pin)?,
            }
        }
        Ok(())
    }

    pub fn gsi_count(&self) -> u32 {
        self.gsi_count
    }

    pub fn routes(&self) -> &[IrqRoutingEntry] {
        &self.entries
    }

    pub fn msi_routes(&self) -> &[MsiRouteRecord] {
        &self.msi_routes
    }

    pub fn is_gsi_used(&self, gsi: u32) -> bool {
        self.used_gsi
            .get(gsi as usize / 64)
            .is_some_and(|w| *w & (1 << (gsi % 64)) != 0)
    }

    fn set_gsi(&mut self, gsi: u32) {
        self.used_gsi[gsi as usize / 64] |= 1 << (gsi % 64);
    }

    fn clear_gsi(&mut self, gsi: u32) {
        if let Some(word) = self.used_gsi.get_mut(gsi as usize / 64) {
            *word &= !(1 << (gsi % 64));
        }
    }

    fn used_gsi_count(&self) -> u32 {
        self.used_gsi.iter().map(|w| w.count_ones()).sum()
    }

    fn push_entry(&mut self, entry: IrqRoutingEntry) {
        if self.entries.len() == self.entries.capacity() {
            let grow = self.entries.capacity().max(MIN_ROUTING_ENTRIES / 2) * 2;
            self.entries.reserve_exact(grow - self.entries.len());
        }
        if let Some(positions) = self.gsi_entries.get_mut(entry.gsi as usize) {
            positions.push(self.entries.len());
        }
        self.entries.push(entry);
    }

    fn find_entry<P: Fn(&IrqRoute) -> bool>(&self, gsi: u32, pred: P) -> Option<usize> {
        self.gsi_entries
            .get(gsi as usize)?
            .iter()
            .copied()
            .find(|&i| pred(&self.entries[i].route))
    }

    // The last entry moves into `index`; its GSI's position list follows.
    fn swap_remove_entry(&mut self, index: usize) {
        let last = self.entries.len() - 1;
        self.entries.swap_remove(index);
        if index == last {
            return;
        }
        let moved = self.entries[index].gsi as usize;
        if let Some(pos) = self
            .gsi_entries
            .get_mut(moved)
            .and_then(|positions| positions.iter_mut().find(|p| **p == last))
        {
            *pos = index;
        }
    }

    /// Routes `gsi` to a pin of an in-kernel interrupt controller. A GSI
    /// has at most one route per controller; an existing one is replaced.
    pub fn add_irqchip_route(&mut self, gsi: u32, chip: IrqchipKind, pin: u32) -> Result<()> {
        if pin >= chip.pins() {
            return Err(Error::InvalidPin { chip, pin });
        }
        if gsi >= self.gsi_count {
            return Err(Error::NoSpace);
        }

        let entry = IrqRoutingEntry {
            gsi,
            route: IrqRoute::Irqchip { chip, pin },
        };
        let existing = self.find_entry(gsi, |route| {
            matches!(route, IrqRoute::Irqchip { chip: c, .. } if *c == chip)
        });
        match existing {
            Some(i) => self.entries[i] = entry,
            None => self.push_entry(entry),
        }
        self.set_gsi(gsi);
        Ok(())
    }

    /// Allocates the lowest free GSI. When the table is full the cached
    /// direct-send routes are dropped first.
    pub fn get_virq(&mut self) -> Result<u32> {
        if self.used_gsi_count() >= self.gsi_count {
            self.flush_dynamic_msi_routes();
        }

        let gsi = self
            .used_gsi
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)
            .map(|(i, w)| i as u32 * 64 + w.trailing_ones())
            .filter(|&gsi| gsi < self.gsi_count)
            .ok_or(Error::NoSpace)?;
        self.set_gsi(gsi);
        Ok(gsi)
    }

    fn flush_dynamic_msi_routes(&mut self) {
        let cached: Vec<u32> = self
            .msi_cache
            .iter()
            .flatten()
            .map(|e| e.gsi)
            .collect();
        if cached.is_empty() {
            return;
        }
        debug!("Flushing {} cached MSI routes", cached.len());
        for gsi in cached {
            self.release_virq(gsi);
        }
    }

    fn resolve_msi(&self, mut msg: MsiMessage, requester_id: u32) -> MsiMessage {
        msg.devid = self.msi_devid.then_some(requester_id);
        msg
    }

    /// Adds a route for `vector` of `device` and returns its GSI. Without a
    /// device the route starts with an empty message, to be filled in with
    /// [`update_msi_route`](IrqRoutingManager::update_msi_route).
    pub fn add_msi_route(&mut self, vector: u32, device: Option<&dyn MsiSource>) -> Result<u32> {
        let msg = match device {
            Some(dev) => {
                if vector >= dev.vector_count() {
                    return Err(Error::InvalidVector {
                        device: dev.id(),
                        vector,
                    });
                }
                self.resolve_msi(dev.msi_message(vector), dev.requester_id())
            }
            None => MsiMessage::default(),
        };

        let gsi = self.get_virq()?;
        self.push_entry(IrqRoutingEntry {
            gsi,
            route: IrqRoute::Msi(msg),
        });
        if let Some(dev) = device {
            self.msi_routes.push(MsiRouteRecord {
                device: dev.id(),
                vector,
                gsi,
            });
        }
        Ok(gsi)
    }

    /// Returns whether the staged route changed.
    pub fn update_msi_route(&mut self, gsi: u32, msg: MsiMessage) -> Result<bool> {
        let index = self
            .find_entry(gsi, |route| matches!(route, IrqRoute::Msi(_)))
            .ok_or(Error::NotFound(gsi))?;
        let entry = &mut self.entries[index];
        let route = IrqRoute::Msi(msg);
        if entry.route == route {
            return Ok(false);
        }
        entry.route = route;
        Ok(true)
    }

    /// Hands the whole staged table to the kernel.
    pub fn commit_routes(&self) -> Result<()> {
        debug!("Committing {} GSI routes", self.entries.len());
        self.vm
            .set_gsi_routing(&self.entries)
            .map_err(Error::SetGsiRouting)
    }

    /// Drops every route of `gsi` and makes the GSI available again.
    pub fn release_virq(&mut self, gsi: u32) {
        let mut positions = self
            .gsi_entries
            .get_mut(gsi as usize)
            .map(std::mem::take)
            .unwrap_or_default();
        // Highest first, so the remaining positions stay valid.
        positions.sort_unstable_by(|a, b| b.cmp(a));
        for index in positions {
            self.swap_remove_entry(index);
        }
        self.clear_gsi(gsi);
        self.release_virq_post(gsi);
    }

    // Forgets everything that still refers to a released GSI.
    fn release_virq_post(&mut self, gsi: u32) {
        for bucket in self.msi_cache.iter_mut() {
            bucket.retain(|e| e.gsi != gsi);
        }
        self.msi_routes.retain(|r| r.gsi != gsi);
    }

    /// Raises or lowers `gsi`, returning the kernel delivery status.
    pub fn set_irq(&self, gsi: u32, level: bool) -> Result<i32> {
        self.vm.irq_line(gsi, level).map_err(Error::SetIrqLine)
    }

    /// Delivers an MSI not tied to a registered device vector. Identical
    /// messages share one cached GSI.
    pub fn send_msi(&mut self, msg: MsiMessage) -> Result<i32> {
        let bucket = (msg.data & 0xff) as usize;
        let address = msg.address();
        let cached = self.msi_cache[bucket]
            .iter()
            .find(|e| e.address == address && e.data == msg.data)
            .map(|e| e.gsi);

        let gsi = match cached {
            Some(gsi) => {
                debug!("MSI cache hit {:#x}/{:#x} -> GSI {}", address, msg.data, gsi);
                gsi
            }
            None => {
                let gsi = self.get_virq()?;
                self.push_entry(IrqRoutingEntry {
                    gsi,
                    route: IrqRoute::Msi(msg),
                });
                if let Err(e) = self.commit_routes() {
                    self.release_virq(gsi);
                    return Err(e);
                }
                self.msi_cache[bucket].push(MsiCacheEntry {
                    address,
                    data: msg.data,
                    gsi,
                });
                debug!("MSI cache miss {:#x}/{:#x} -> GSI {}", address, msg.data, gsi);
                gsi
            }
        };

        self.set_irq(gsi, true)
    }
}
