// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest-physical to host-virtual translation over the registered slots.

use crate::memory_manager::{MemoryManager, MemorySlot};

impl MemoryManager {
    fn active_slots(&self) -> impl Iterator<Item = &MemorySlot> {
        self.listeners.iter().flat_map(|l| l.slots())
    }

    /// Host address backing `gpa`, or `None` for an unbacked address.
    pub fn gpa2hva(&self, gpa: u64) -> Option<u64> {
        self.active_slots()
            .find(|s| s.contains(gpa))
            .map(|s| s.host_addr + (gpa - s.start))
    }

    /// Every guest range backed by `[hva, hva + len)`.
    ///
    /// The returned vector holds at most `cap` `(gpa, size)` pairs, while
    /// the count is the number of overlapping slots, so a caller can tell
    /// the result was truncated.
    pub fn hva2gpa(&self, hva: u64, len: u64, cap: usize) -> (usize, Vec<(u64, u64)>) {
        let end = hva.saturating_add(len);
        let mut count = 0;
        let mut ranges = Vec::new();

        for slot in self.active_slots() {
            let slot_end = slot.host_addr + slot.size;
            let start = hva.max(slot.host_addr);
            let stop = end.min(slot_end);
            if start >= stop {
                continue;
            }
            count += 1;
            if ranges.len() < cap {
                ranges.push((slot.start + (start - slot.host_addr), stop - start));
            }
        }

        (count, ranges)
    }
}

#[cfg(test)]
mod tests {
    use hypervisor::mock::MockHypervisor;

    use crate::config::AccelConfig;
    use crate::memory_manager::{AddressSpace, MemoryManager};
    use crate::test_utils::{mock_session, session_guard};

    #[test]
    fn test_gpa_hva_inverse() {
        let _guard = session_guard();
        let (session, _state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let mut mm = MemoryManager::new(&session);
        mm.add(AddressSpace::Memory, 0, 0x1_0000, 0x7f00_0000_0000, false, false)
            .unwrap();
        mm.add(AddressSpace::Memory, 0x10_0000, 0x2000, 0x7f10_0000_0000, false, false)
            .unwrap();

        for gpa in [0, 0x1234, 0xffff, 0x10_0000, 0x10_1fff] {
            let hva = mm.gpa2hva(gpa).unwrap();
            assert_eq!(mm.hva2gpa(hva, 1, 4), (1, vec![(gpa, 1)]));
        }
        assert_eq!(mm.gpa2hva(0x1_0000), None);
        assert_eq!(mm.gpa2hva(0x10_2000), None);
    }

    #[test]
    fn test_hva2gpa_clipping_and_cap() {
        let _guard = session_guard();
        let (session, _state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        let mut mm = MemoryManager::new(&session);
        // Two guest ranges aliasing the same host page, plus its neighbour.
        mm.add(AddressSpace::Memory, 0x1000, 0x1000, 0x7000_0000, false, false)
            .unwrap();
        mm.add(AddressSpace::Memory, 0x8000, 0x1000, 0x7000_0000, false, false)
            .unwrap();
        mm.add(AddressSpace::Memory, 0x2000, 0x1000, 0x7000_1000, false, false)
            .unwrap();

        let (count, ranges) = mm.hva2gpa(0x7000_0800, 0x1000, 8);
        assert_eq!(count, 3);
        assert_eq!(
            ranges,
            vec![(0x1800, 0x800), (0x8800, 0x800), (0x2000, 0x800)]
        );

        let (count, ranges) = mm.hva2gpa(0x7000_0800, 0x1000, 1);
        assert_eq!(count, 3);
        assert_eq!(ranges, vec![(0x1800, 0x800)]);

        assert_eq!(mm.hva2gpa(0x6000_0000, 0x1000, 8), (0, vec![]));
    }
}
