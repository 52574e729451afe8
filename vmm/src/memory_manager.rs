// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use hypervisor::{HypervisorVmError, MemoryRegionFlags, UserMemoryRegion, Vm};
use thiserror::Error;
use vm_memory::{GuestMemory, GuestMemoryMmap, GuestMemoryRegion, MemoryRegionAddress};

use crate::session::Session;

/// Granularity of the kernel dirty log.
pub const DIRTY_PAGE_SIZE: u64 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    /// The slot table of an address space is full. The table is sized
    /// once at VM creation, so the embedder treats this as fatal.
    #[error("No free memory slot in address space {0}")]
    NoFreeSlot(u16),

    #[error("Region {gpa:#x}+{size:#x} overlaps an existing slot")]
    Overlap { gpa: u64, size: u64 },

    #[error("No slot registered for {gpa:#x}+{size:#x}")]
    NotFound { gpa: u64, size: u64 },

    #[error("Address space {0} is not registered")]
    InvalidAddressSpace(u16),

    #[error("Failed to set the user memory region")]
    SetUserMemoryRegion(#[source] HypervisorVmError),

    #[error("Failed to get the dirty log")]
    GetDirtyLog(#[source] HypervisorVmError),

    #[error("Failed to get the host address of guest memory")]
    GuestMemoryHostAddress(#[source] vm_memory::GuestMemoryError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Address spaces a slot can be registered in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Memory,
    Smram,
}

impl AddressSpace {
    pub fn id(self) -> u16 {
        match self {
            AddressSpace::Memory => 0,
            AddressSpace::Smram => 1,
        }
    }
}

/// One entry of a listener's slot table. `size == 0` marks a free entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemorySlot {
    pub id: u32,
    pub start: u64,
    pub size: u64,
    pub host_addr: u64,
    pub flags: MemoryRegionFlags,
    pub user_backed: bool,
}

impl MemorySlot {
    pub fn is_free(&self) -> bool {
        self.size == 0
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn contains(&self, gpa: u64) -> bool {
        !self.is_free() && gpa >= self.start && gpa < self.end()
    }

    fn overlaps(&self, start: u64, size: u64) -> bool {
        !self.is_free() && start < self.end() && self.start < start + size
    }
}

/// Binds one slot table to one address-space id.
pub struct AddressSpaceListener {
    asid: u16,
    slots: Vec<MemorySlot>,
}

impl AddressSpaceListener {
    fn new(asid: u16, nr_slots: u32) -> Self {
        let slots = (0..nr_slots)
            .map(|id| MemorySlot {
                id,
                ..Default::default()
            })
            .collect();
        AddressSpaceListener { asid, slots }
    }

    pub fn asid(&self) -> u16 {
        self.asid
    }

    pub fn slots(&self) -> impl Iterator<Item = &MemorySlot> {
        self.slots.iter().filter(|s| !s.is_free())
    }

    fn kernel_slot(&self, id: u32) -> u32 {
        id | (u32::from(self.asid) << 16)
    }

    fn find(&self, start: u64, size: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| !s.is_free() && s.start == start && s.size == size)
    }

    fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_free())
    }

    fn overlaps(&self, start: u64, size: u64) -> bool {
        self.slots.iter().any(|s| s.overlaps(start, size))
    }
}

/// Guest pages written since the bitmap was last cleared.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirtyBitmap {
    bits: Vec<u64>,
}

impl DirtyBitmap {
    pub fn new(guest_size: u64) -> Self {
        let pages = guest_size.div_ceil(DIRTY_PAGE_SIZE);
        DirtyBitmap {
            bits: vec![0; pages.div_ceil(64) as usize],
        }
    }

    pub fn set(&mut self, page: u64) {
        let word = (page / 64) as usize;
        if word >= self.bits.len() {
            self.bits.resize(word + 1, 0);
        }
        self.bits[word] |= 1 << (page % 64);
    }

    pub fn is_set(&self, page: u64) -> bool {
        self.bits
            .get((page / 64) as usize)
            .is_some_and(|w| *w & (1 << (page % 64)) != 0)
    }

    /// Page numbers (gpa / 4 KiB) of every dirty page, ascending.
    pub fn dirty_pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.bits.iter().enumerate().flat_map(|(i, &word)| {
            (0..64u64)
                .filter(move |bit| word & (1 << *bit) != 0)
                .map(move |bit| i as u64 * 64 + bit)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }

    /// Merges a kernel bitmap whose bit 0 is the page at `start`.
    fn merge(&mut self, start: u64, pages: u64, kernel: &[u64]) {
        let first = start / DIRTY_PAGE_SIZE;
        for (i, &word) in kernel.iter().enumerate() {
            if word == 0 {
                continue;
            }
            for bit in 0..64u64 {
                let page = i as u64 * 64 + bit;
                if page >= pages {
                    break;
                }
                if word & (1 << bit) != 0 {
                    self.set(first + page);
                }
            }
        }
    }
}

pub(crate) fn host_page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Registry of the guest memory slots of one VM.
pub struct MemoryManager {
    vm: Arc<dyn Vm>,
    pub(crate) listeners: Vec<AddressSpaceListener>,
    page_size: u64,
    readonly_supported: bool,
    readonly_two_step: bool,
    dirty: DirtyBitmap,
}

impl MemoryManager {
    pub fn new(session: &Session) -> Self {
        let caps = session.capabilities();
        let mut listeners = vec![AddressSpaceListener::new(
            AddressSpace::Memory.id(),
            caps.nr_slots,
        )];
        if session.config().smm && caps.multi_address_space {
            listeners.push(AddressSpaceListener::new(
                AddressSpace::Smram.id(),
                caps.nr_slots,
            ));
        }

        MemoryManager {
            vm: session.vm().clone(),
            listeners,
            page_size: host_page_size(),
            readonly_supported: caps.readonly_mem,
            readonly_two_step: session.config().readonly_two_step,
            dirty: DirtyBitmap::default(),
        }
    }

    pub fn listeners(&self) -> &[AddressSpaceListener] {
        &self.listeners
    }

    pub fn dirty_bitmap(&self) -> &DirtyBitmap {
        &self.dirty
    }

    /// Returns the collected dirty pages and starts a fresh bitmap.
    pub fn take_dirty_bitmap(&mut self) -> DirtyBitmap {
        std::mem::take(&mut self.dirty)
    }

    fn listener_index(&self, space: AddressSpace) -> Result<usize> {
        self.listeners
            .iter()
            .position(|l| l.asid == space.id())
            .ok_or(Error::InvalidAddressSpace(space.id()))
    }

    // Shrinks [gpa, gpa + size) to whole host pages.
    fn align(&self, gpa: u64, size: u64, host_addr: u64) -> Option<(u64, u64, u64)> {
        let mask = self.page_size - 1;
        let start = (gpa + mask) & !mask;
        let delta = start - gpa;
        if delta >= size {
            return None;
        }
        let size = (size - delta) & !mask;
        if size == 0 {
            return None;
        }
        Some((start, size, host_addr + delta))
    }

    fn register(&self, listener: usize, slot: &MemorySlot, size: u64) -> Result<()> {
        let region = UserMemoryRegion {
            slot: self.listeners[listener].kernel_slot(slot.id),
            flags: slot.flags,
            guest_phys_addr: slot.start,
            memory_size: size,
            userspace_addr: slot.host_addr,
        };
        self.vm
            .set_user_memory_region(region)
            .map_err(Error::SetUserMemoryRegion)
    }

    fn allocate(&self, listener: usize) -> Result<usize> {
        let l = &self.listeners[listener];
        l.find_free().ok_or_else(|| {
            error!(
                "Out of memory slots in address space {} ({} slots)",
                l.asid,
                l.slots.len()
            );
            Error::NoFreeSlot(l.asid)
        })
    }

    /// Registers guest RAM backed by `host_addr`.
    ///
    /// Returns the slot id, or `None` when nothing was registered: the
    /// range shrinks to nothing once aligned to host pages, or it is
    /// read-only on a kernel without read-only slots and is left to MMIO
    /// emulation.
    pub fn add(
        &mut self,
        space: AddressSpace,
        gpa: u64,
        size: u64,
        host_addr: u64,
        readonly: bool,
        log_dirty: bool,
    ) -> Result<Option<u32>> {
        let listener = self.listener_index(space)?;
        let Some((start, size, host_addr)) = self.align(gpa, size, host_addr) else {
            debug!("Ignoring sub-page region {:#x}", gpa);
            return Ok(None);
        };
        if readonly && !self.readonly_supported {
            info!(
                "Read-only region {:#x}+{:#x} left to MMIO emulation",
                start, size
            );
            return Ok(None);
        }
        if self.listeners[listener].overlaps(start, size) {
            return Err(Error::Overlap { gpa: start, size });
        }

        let index = self.allocate(listener)?;
        let mut flags = MemoryRegionFlags::empty();
        flags.set(MemoryRegionFlags::READONLY, readonly);
        flags.set(MemoryRegionFlags::LOG_DIRTY_PAGES, log_dirty);
        let slot = MemorySlot {
            id: self.listeners[listener].slots[index].id,
            start,
            size,
            host_addr,
            flags,
            user_backed: false,
        };
        self.register(listener, &slot, size)?;
        self.listeners[listener].slots[index] = slot;

        info!(
            "Created memory slot {} (as {}): {:#x} -> {:#x} size {:#x}",
            slot.id, space.id(), start, host_addr, size
        );
        Ok(Some(slot.id))
    }

    /// Unregisters the slot matching exactly the aligned range.
    pub fn remove(&mut self, space: AddressSpace, gpa: u64, size: u64) -> Result<()> {
        let listener = self.listener_index(space)?;
        let Some((start, size, _)) = self.align(gpa, size, 0) else {
            return Ok(());
        };
        let index = self.listeners[listener]
            .find(start, size)
            .filter(|&i| !self.listeners[listener].slots[i].user_backed)
            .ok_or(Error::NotFound { gpa: start, size })?;
        self.release(listener, index)
    }

    fn release(&mut self, listener: usize, index: usize) -> Result<()> {
        let slot = self.listeners[listener].slots[index];
        if slot.flags.contains(MemoryRegionFlags::LOG_DIRTY_PAGES) {
            self.sync_slot(listener, &slot)?;
        }
        self.register(listener, &slot, 0)?;
        self.listeners[listener].slots[index] = MemorySlot {
            id: slot.id,
            ..Default::default()
        };

        info!(
            "Removed memory slot {}: {:#x} -> {:#x} size {:#x}",
            slot.id, slot.start, slot.host_addr, slot.size
        );
        Ok(())
    }

    fn update_flags(
        &mut self,
        listener: usize,
        index: usize,
        flags: MemoryRegionFlags,
    ) -> Result<bool> {
        let mut slot = self.listeners[listener].slots[index];
        if slot.flags == flags {
            return Ok(false);
        }

        let old = slot.flags;
        if old.contains(MemoryRegionFlags::LOG_DIRTY_PAGES)
            && !flags.contains(MemoryRegionFlags::LOG_DIRTY_PAGES)
        {
            self.sync_slot(listener, &slot)?;
        }

        slot.flags = flags;
        let readonly_flip = old.contains(MemoryRegionFlags::READONLY)
            != flags.contains(MemoryRegionFlags::READONLY);
        if readonly_flip && self.readonly_two_step && !slot.user_backed {
            self.register(listener, &slot, 0)?;
        }
        self.register(listener, &slot, slot.size)?;
        self.listeners[listener].slots[index] = slot;
        Ok(true)
    }

    fn find_slot(&self, space: AddressSpace, gpa: u64, size: u64) -> Result<(usize, usize)> {
        let listener = self.listener_index(space)?;
        let (start, size, _) = self
            .align(gpa, size, 0)
            .ok_or(Error::NotFound { gpa, size })?;
        let index = self.listeners[listener]
            .find(start, size)
            .ok_or(Error::NotFound { gpa: start, size })?;
        Ok((listener, index))
    }

    /// Returns whether the kernel had to be told.
    pub fn set_readonly(
        &mut self,
        space: AddressSpace,
        gpa: u64,
        size: u64,
        readonly: bool,
    ) -> Result<bool> {
        let (listener, index) = self.find_slot(space, gpa, size)?;
        let mut flags = self.listeners[listener].slots[index].flags;
        flags.set(MemoryRegionFlags::READONLY, readonly);
        self.update_flags(listener, index, flags)
    }

    /// Returns whether the kernel had to be told.
    pub fn set_dirty_logging(
        &mut self,
        space: AddressSpace,
        gpa: u64,
        size: u64,
        enable: bool,
    ) -> Result<bool> {
        let (listener, index) = self.find_slot(space, gpa, size)?;
        let mut flags = self.listeners[listener].slots[index].flags;
        flags.set(MemoryRegionFlags::LOG_DIRTY_PAGES, enable);
        self.update_flags(listener, index, flags)
    }

    /// Registers caller-owned memory as is: no alignment and no read-only
    /// handling.
    pub fn map_user_backed(
        &mut self,
        space: AddressSpace,
        gpa: u64,
        size: u64,
        host_addr: u64,
    ) -> Result<u32> {
        let listener = self.listener_index(space)?;
        if size == 0 || self.listeners[listener].overlaps(gpa, size) {
            return Err(Error::Overlap { gpa, size });
        }
        let index = self.allocate(listener)?;
        let slot = MemorySlot {
            id: self.listeners[listener].slots[index].id,
            start: gpa,
            size,
            host_addr,
            flags: MemoryRegionFlags::empty(),
            user_backed: true,
        };
        self.register(listener, &slot, size)?;
        self.listeners[listener].slots[index] = slot;

        info!(
            "Mapped user memory slot {}: {:#x} -> {:#x} size {:#x}",
            slot.id, gpa, host_addr, size
        );
        Ok(slot.id)
    }

    pub fn unmap_user_backed(&mut self, space: AddressSpace, gpa: u64, size: u64) -> Result<()> {
        let listener = self.listener_index(space)?;
        let index = self.listeners[listener]
            .find(gpa, size)
            .filter(|&i| self.listeners[listener].slots[i].user_backed)
            .ok_or(Error::NotFound { gpa, size })?;
        self.release(listener, index)
    }

    fn sync_slot(&mut self, listener: usize, slot: &MemorySlot) -> Result<()> {
        let bitmap = self
            .vm
            .get_dirty_log(self.listeners[listener].kernel_slot(slot.id), slot.size)
            .map_err(Error::GetDirtyLog)?;
        let pages = slot.size.div_ceil(DIRTY_PAGE_SIZE);
        self.dirty.merge(slot.start, pages, &bitmap);
        Ok(())
    }

    /// Fetches the kernel dirty log of every logging slot into the
    /// manager's bitmap.
    pub fn log_sync(&mut self) -> Result<()> {
        for listener in 0..self.listeners.len() {
            let logging: Vec<MemorySlot> = self.listeners[listener]
                .slots()
                .filter(|s| s.flags.contains(MemoryRegionFlags::LOG_DIRTY_PAGES))
                .copied()
                .collect();
            for slot in logging {
                self.sync_slot(listener, &slot)?;
            }
        }
        Ok(())
    }

    /// Registers every region of `memory` in the main address space.
    pub fn add_guest_memory(&mut self, memory: &GuestMemoryMmap, log_dirty: bool) -> Result<()> {
        for region in memory.iter() {
            let host_addr = region
                .get_host_address(MemoryRegionAddress(0))
                .map_err(Error::GuestMemoryHostAddress)? as u64;
            self.add(
                AddressSpace::Memory,
                region.start_addr().0,
                region.len(),
                host_addr,
                false,
                log_dirty,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use hypervisor::mock::MockHypervisor;
    use hypervisor::Capability;
    use vm_memory::GuestAddress;

    use super::*;
    use crate::config::AccelConfig;
    use crate::test_utils::{mock_session, session_guard};

    #[test]
    fn test_add_remove_reuses_slot() {
        let _guard = session_guard();
        let (session, state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let mut mm = MemoryManager::new(&session);
        let buf = vec![0u8; 0x4000];
        let hva = buf.as_ptr() as u64;

        let slot = mm
            .add(AddressSpace::Memory, 0x10_0000, 0x4000, hva, false, false)
            .unwrap();
        assert_eq!(slot, Some(0));
        assert_eq!(state.slot(0).unwrap().guest_phys_addr, 0x10_0000);
        assert!(mm.gpa2hva(0x10_1000).is_some());

        mm.remove(AddressSpace::Memory, 0x10_0000, 0x4000).unwrap();
        assert!(mm.gpa2hva(0x10_1000).is_none());
        assert!(state.slot(0).is_none());

        let slot = mm
            .add(AddressSpace::Memory, 0x20_0000, 0x1000, hva, false, false)
            .unwrap();
        assert_eq!(slot, Some(0));
        assert!(matches!(
            mm.remove(AddressSpace::Memory, 0x20_0000, 0x2000),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_alignment() {
        let _guard = session_guard();
        let (session, state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let mut mm = MemoryManager::new(&session);

        assert_eq!(
            mm.add(AddressSpace::Memory, 0x1800, 0x800, 0x7000_0800, false, false)
                .unwrap(),
            None
        );
        assert_eq!(
            mm.add(AddressSpace::Memory, 0x1800, 0x2000, 0x7000_0800, false, false)
                .unwrap(),
            Some(0)
        );
        let region = state.slot(0).unwrap();
        assert_eq!(region.guest_phys_addr, 0x2000);
        assert_eq!(region.memory_size, 0x1000);
        assert_eq!(region.userspace_addr, 0x7000_1000);
    }

    #[test]
    fn test_overlap_and_exhaustion() {
        let _guard = session_guard();
        let hv = MockHypervisor::new().with_capability(Capability::NrMemslots, 2);
        let (session, _state) = mock_session(hv, AccelConfig::default());
        let mut mm = MemoryManager::new(&session);

        mm.add(AddressSpace::Memory, 0, 0x2000, 0x7000_0000, false, false)
            .unwrap();
        assert!(matches!(
            mm.add(AddressSpace::Memory, 0x1000, 0x2000, 0x7000_0000, false, false),
            Err(Error::Overlap { .. })
        ));
        mm.add(AddressSpace::Memory, 0x2000, 0x1000, 0x7000_2000, false, false)
            .unwrap();
        assert!(matches!(
            mm.add(AddressSpace::Memory, 0x8000, 0x1000, 0x7000_8000, false, false),
            Err(Error::NoFreeSlot(0))
        ));
    }

    #[test]
    fn test_readonly_two_step() {
        let _guard = session_guard();
        let (session, state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let mut mm = MemoryManager::new(&session);
        mm.add(AddressSpace::Memory, 0, 0x1000, 0x7000_0000, false, false)
            .unwrap();
        state.region_log.lock().unwrap().clear();

        assert!(mm.set_readonly(AddressSpace::Memory, 0, 0x1000, true).unwrap());
        let log = state.region_log.lock().unwrap().clone();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].memory_size, 0);
        assert_eq!(log[1].memory_size, 0x1000);
        assert!(log[1].flags.contains(MemoryRegionFlags::READONLY));

        // Unchanged flags never reach the kernel.
        assert!(!mm.set_readonly(AddressSpace::Memory, 0, 0x1000, true).unwrap());
        assert_eq!(state.region_log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_readonly_single_step() {
        let _guard = session_guard();
        let config = AccelConfig {
            readonly_two_step: false,
            ..Default::default()
        };
        let (session, state) = mock_session(MockHypervisor::new(), config);
        let mut mm = MemoryManager::new(&session);
        mm.add(AddressSpace::Memory, 0, 0x1000, 0x7000_0000, false, false)
            .unwrap();
        state.region_log.lock().unwrap().clear();

        mm.set_readonly(AddressSpace::Memory, 0, 0x1000, true).unwrap();
        assert_eq!(state.region_log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_readonly_without_capability_is_mmio() {
        let _guard = session_guard();
        let hv = MockHypervisor::new().without_capability(Capability::ReadonlyMem);
        let (session, state) = mock_session(hv, AccelConfig::default());
        let mut mm = MemoryManager::new(&session);
        assert_eq!(
            mm.add(AddressSpace::Memory, 0xfffc_0000, 0x4_0000, 0x7000_0000, true, false)
                .unwrap(),
            None
        );
        assert!(state.slots.lock().unwrap().is_empty());
    }

    #[test]
    fn test_smram_address_space() {
        let _guard = session_guard();
        let config = AccelConfig {
            smm: true,
            ..Default::default()
        };
        let (session, state) = mock_session(MockHypervisor::new(), config);
        let mut mm = MemoryManager::new(&session);
        assert_eq!(mm.listeners().len(), 2);

        mm.add(AddressSpace::Smram, 0xa_0000, 0x2_0000, 0x7000_0000, false, false)
            .unwrap();
        assert!(state.slot(1 << 16).is_some());
        // Both address spaces number their slots independently.
        mm.add(AddressSpace::Memory, 0xa_0000, 0x2_0000, 0x7100_0000, false, false)
            .unwrap();
        assert!(state.slot(0).is_some());
    }

    #[test]
    fn test_smram_requires_opt_in() {
        let _guard = session_guard();
        let (session, _state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let mut mm = MemoryManager::new(&session);
        assert!(matches!(
            mm.add(AddressSpace::Smram, 0xa_0000, 0x1000, 0x7000_0000, false, false),
            Err(Error::InvalidAddressSpace(1))
        ));
    }

    #[test]
    fn test_dirty_log_merge() {
        let _guard = session_guard();
        let (session, state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let mut mm = MemoryManager::new(&session);
        mm.add(AddressSpace::Memory, 0x4000, 0x4000, 0x7000_0000, false, true)
            .unwrap();

        state.dirty_logs.lock().unwrap().insert(0, vec![0b101]);
        mm.log_sync().unwrap();
        let pages: Vec<u64> = mm.dirty_bitmap().dirty_pages().collect();
        assert_eq!(pages, vec![4, 6]);

        let bitmap = mm.take_dirty_bitmap();
        assert!(bitmap.is_set(4) && !bitmap.is_set(5) && bitmap.is_set(6));
        assert!(mm.dirty_bitmap().is_empty());
    }

    #[test]
    fn test_remove_flushes_dirty_log() {
        let _guard = session_guard();
        let (session, state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let mut mm = MemoryManager::new(&session);
        mm.add(AddressSpace::Memory, 0, 0x2000, 0x7000_0000, false, false)
            .unwrap();
        assert!(mm.set_dirty_logging(AddressSpace::Memory, 0, 0x2000, true).unwrap());

        state.dirty_logs.lock().unwrap().insert(0, vec![0b10]);
        mm.remove(AddressSpace::Memory, 0, 0x2000).unwrap();
        assert_eq!(mm.dirty_bitmap().dirty_pages().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_failed_remove_keeps_slot_and_dirty_pages() {
        let _guard = session_guard();
        let (session, state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let mut mm = MemoryManager::new(&session);
        mm.add(AddressSpace::Memory, 0, 0x2000, 0x7000_0000, false, false)
            .unwrap();
        assert!(mm.set_dirty_logging(AddressSpace::Memory, 0, 0x2000, true).unwrap());

        // The fetch clears the kernel log, so the merged page must survive.
        state.dirty_logs.lock().unwrap().insert(0, vec![0b10]);
        state.fail_user_memory_region.store(true, Ordering::SeqCst);
        assert!(matches!(
            mm.remove(AddressSpace::Memory, 0, 0x2000),
            Err(Error::SetUserMemoryRegion(_))
        ));
        assert_eq!(mm.dirty_bitmap().dirty_pages().collect::<Vec<_>>(), vec![1]);
        assert_eq!(state.slot(0).unwrap().memory_size, 0x2000);

        state.fail_user_memory_region.store(false, Ordering::SeqCst);
        mm.remove(AddressSpace::Memory, 0, 0x2000).unwrap();
        assert!(state.slot(0).is_none());
        assert_eq!(mm.dirty_bitmap().dirty_pages().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_user_backed_mapping() {
        let _guard = session_guard();
        let (session, state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let mut mm = MemoryManager::new(&session);
        let slot = mm
            .map_user_backed(AddressSpace::Memory, 0xd_0000, 0x800, 0x7000_0400)
            .unwrap();
        let region = state.slot(slot).unwrap();
        assert_eq!(region.memory_size, 0x800);
        assert_eq!(region.userspace_addr, 0x7000_0400);

        // User-backed slots are not visible to the regular path.
        assert!(mm.remove(AddressSpace::Memory, 0xd_0000, 0x1000).is_err());
        mm.unmap_user_backed(AddressSpace::Memory, 0xd_0000, 0x800)
            .unwrap();
        assert!(state.slot(slot).is_none());
    }

    #[test]
    fn test_add_guest_memory() {
        let _guard = session_guard();
        let (session, state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let mut mm = MemoryManager::new(&session);
        let memory = GuestMemoryMmap::<()>::from_ranges(&[
            (GuestAddress(0), 0x10_0000),
            (GuestAddress(0x100_0000), 0x10_0000),
        ])
        .unwrap();
        mm.add_guest_memory(&memory, false).unwrap();
        assert_eq!(state.slots.lock().unwrap().len(), 2);
        assert_eq!(state.slot(1).unwrap().guest_phys_addr, 0x100_0000);
    }

    #[test]
    fn test_bitmap_words() {
        let mut bitmap = DirtyBitmap::new(0x10_0000);
        assert!(bitmap.is_empty());
        bitmap.set(300);
        assert!(bitmap.is_set(300));
        assert_eq!(bitmap.dirty_pages().collect::<Vec<_>>(), vec![300]);
        bitmap.clear();
        assert!(bitmap.is_empty());
    }
}
