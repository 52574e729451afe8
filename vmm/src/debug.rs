// Copyright © 2022, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Software and hardware breakpoints shared by every vCPU.

use hypervisor::arch::x86::regs::{
    dr7_condition, dr7_global_enable, dr7_len_shift, dr7_type_shift, DR6_BS, DR7_GE,
};
use hypervisor::arch::x86::{
    Exception, GuestDebug, GUEST_DEBUG_ENABLE, GUEST_DEBUG_SINGLESTEP, GUEST_DEBUG_USE_HW_BP,
    GUEST_DEBUG_USE_SW_BP, INT3_OPCODE, NUM_HW_BREAKPOINTS,
};
use hypervisor::DebugExit;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap};

/// DR7 with the exact-breakpoint bits (LE/GE) set.
const DR7_EXACT: u64 = 0x0600;

#[derive(Debug, Error)]
pub enum Error {
    #[error("All {} hardware breakpoint slots are in use", NUM_HW_BREAKPOINTS)]
    NoSpace,

    #[error("Breakpoint already exists")]
    AlreadyExists,

    #[error("Breakpoint not found")]
    NotFound,

    #[error("Invalid breakpoint length {0} for this type or address")]
    InvalidLength(u64),

    #[error("Breakpoint kind {0:?} is not supported")]
    Unsupported(BreakpointKind),

    #[error("Expected a trap instruction at {pc:#x}, found {found:#x}")]
    TrapMismatch { pc: u64, found: u8 },

    #[error("Cannot access guest memory")]
    GuestMemory(#[source] GuestMemoryError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakpointKind {
    Execute,
    Write,
    /// Read or write.
    Access,
    /// Read only, which x86 debug registers cannot express.
    Read,
}

impl BreakpointKind {
    fn dr7_type(self) -> Option<u64> {
        match self {
            BreakpointKind::Execute => Some(0),
            BreakpointKind::Write => Some(1),
            BreakpointKind::Access => Some(3),
            BreakpointKind::Read => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SoftwareBreakpoint {
    pc: u64,
    gpa: u64,
    saved: u8,
    use_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HardwareBreakpoint {
    pub addr: u64,
    pub len: u64,
    pub kind: BreakpointKind,
}

/// Why a vCPU stopped on a debug exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebugStop {
    SingleStep,
    HwBreakpoint { addr: u64 },
    Watchpoint { addr: u64, kind: BreakpointKind },
    SwBreakpoint { pc: u64 },
    /// Raised by the guest's own debugging; hand it back to the guest.
    Guest,
}

/// Breakpoint tables for the whole VM.
///
/// The kernel debug facility is global, so every change must be pushed
/// to all vCPUs by the caller.
pub struct DebugController {
    memory: GuestMemoryMmap,
    sw_breakpoints: Vec<SoftwareBreakpoint>,
    hw_breakpoints: Vec<HardwareBreakpoint>,
}

impl DebugController {
    pub fn new(memory: GuestMemoryMmap) -> Self {
        DebugController {
            memory,
            sw_breakpoints: Vec::new(),
            hw_breakpoints: Vec::new(),
        }
    }

    pub fn hw_breakpoints(&self) -> &[HardwareBreakpoint] {
        &self.hw_breakpoints
    }

    pub fn has_sw_breakpoint(&self, pc: u64) -> bool {
        self.sw_breakpoints.iter().any(|bp| bp.pc == pc)
    }

    /// Plants a trap at `pc`, whose guest-physical address is `gpa`.
    pub fn insert_sw_breakpoint(&mut self, pc: u64, gpa: u64) -> Result<()> {
        if let Some(bp) = self.sw_breakpoints.iter_mut().find(|bp| bp.pc == pc) {
            bp.use_count += 1;
            return Ok(());
        }

        let saved: u8 = self
            .memory
            .read_obj(GuestAddress(gpa))
            .map_err(Error::GuestMemory)?;
        self.memory
            .write_obj(INT3_OPCODE, GuestAddress(gpa))
            .map_err(Error::GuestMemory)?;
        self.sw_breakpoints.push(SoftwareBreakpoint {
            pc,
            gpa,
            saved,
            use_count: 1,
        });
        debug!("Inserted software breakpoint at {:#x}", pc);
        Ok(())
    }

    pub fn remove_sw_breakpoint(&mut self, pc: u64) -> Result<()> {
        let index = self
            .sw_breakpoints
            .iter()
            .position(|bp| bp.pc == pc)
            .ok_or(Error::NotFound)?;

        let bp = &mut self.sw_breakpoints[index];
        if bp.use_count > 1 {
            bp.use_count -= 1;
            return Ok(());
        }

        let bp = *bp;
        self.restore(&bp)?;
        self.sw_breakpoints.remove(index);
        debug!("Removed software breakpoint at {:#x}", pc);
        Ok(())
    }

    fn restore(&self, bp: &SoftwareBreakpoint) -> Result<()> {
        let found: u8 = self
            .memory
            .read_obj(GuestAddress(bp.gpa))
            .map_err(Error::GuestMemory)?;
        if found != INT3_OPCODE {
            return Err(Error::TrapMismatch { pc: bp.pc, found });
        }
        self.memory
            .write_obj(bp.saved, GuestAddress(bp.gpa))
            .map_err(Error::GuestMemory)
    }

    pub fn insert_hw_breakpoint(
        &mut self,
        addr: u64,
        len: u64,
        kind: BreakpointKind,
    ) -> Result<()> {
        if kind.dr7_type().is_none() {
            return Err(Error::Unsupported(kind));
        }
        let len = match kind {
            BreakpointKind::Execute => 1,
            _ => match len {
                1 => 1,
                2 | 4 | 8 if addr % len == 0 => len,
                _ => return Err(Error::InvalidLength(len)),
            },
        };

        let bp = HardwareBreakpoint { addr, len, kind };
        if self.hw_breakpoints.contains(&bp) {
            return Err(Error::AlreadyExists);
        }
        if self.hw_breakpoints.len() >= NUM_HW_BREAKPOINTS {
            return Err(Error::NoSpace);
        }
        self.hw_breakpoints.push(bp);
        Ok(())
    }

    pub fn remove_hw_breakpoint(
        &mut self,
        addr: u64,
        len: u64,
        kind: BreakpointKind,
    ) -> Result<()> {
        let len = if kind == BreakpointKind::Execute { 1 } else { len };
        let index = self
            .hw_breakpoints
            .iter()
            .position(|bp| *bp == HardwareBreakpoint { addr, len, kind })
            .ok_or(Error::NotFound)?;
        self.hw_breakpoints.remove(index);
        Ok(())
    }

    /// Drops every breakpoint and restores the guest bytes under the traps.
    pub fn remove_all(&mut self) -> Result<()> {
        self.hw_breakpoints.clear();
        let mut result = Ok(());
        for bp in std::mem::take(&mut self.sw_breakpoints) {
            if let Err(e) = self.restore(&bp) {
                warn!("Cannot restore guest code at {:#x}: {}", bp.pc, e);
                result = Err(e);
            }
        }
        result
    }

    /// Debug control for a vCPU, stepping or not.
    pub fn guest_debug(&self, single_step: bool) -> GuestDebug {
        let mut debug = GuestDebug::default();

        if !self.sw_breakpoints.is_empty() {
            debug.control |= GUEST_DEBUG_ENABLE | GUEST_DEBUG_USE_SW_BP;
        }

        if !self.hw_breakpoints.is_empty() {
            debug.control |= GUEST_DEBUG_ENABLE | GUEST_DEBUG_USE_HW_BP;
            let mut dr7 = DR7_EXACT;
            for (n, bp) in self.hw_breakpoints.iter().enumerate() {
                debug.debugreg[n] = bp.addr;
                dr7 |= dr7_global_enable(n);
                dr7 |= bp.kind.dr7_type().unwrap_or(0) << dr7_type_shift(n);
                dr7 |= len_code(bp.len) << dr7_len_shift(n);
            }
            debug.debugreg[7] = dr7;
        }

        if single_step {
            debug.control |= GUEST_DEBUG_ENABLE | GUEST_DEBUG_SINGLESTEP;
        }
        debug
    }

    pub fn classify_debug_exit(&self, exit: &DebugExit, single_step: bool) -> DebugStop {
        if exit.exception == Exception::DB as u32 {
            if exit.dr6 & DR6_BS != 0 {
                if single_step {
                    return DebugStop::SingleStep;
                }
            } else if exit.dr7 & DR7_GE != 0 {
                for n in 0..NUM_HW_BREAKPOINTS {
                    if exit.dr6 & (1 << n) == 0 {
                        continue;
                    }
                    let Some(bp) = self.hw_breakpoints.get(n) else {
                        continue;
                    };
                    return match dr7_condition(exit.dr7, n) {
                        0 => DebugStop::HwBreakpoint { addr: bp.addr },
                        1 => DebugStop::Watchpoint {
                            addr: bp.addr,
                            kind: BreakpointKind::Write,
                        },
                        3 => DebugStop::Watchpoint {
                            addr: bp.addr,
                            kind: BreakpointKind::Access,
                        },
                        // I/O breakpoints are never ours.
                        _ => continue,
                    };
                }
            }
        } else if exit.exception == Exception::BP as u32 && self.has_sw_breakpoint(exit.pc) {
            return DebugStop::SwBreakpoint { pc: exit.pc };
        }
        DebugStop::Guest
    }
}

fn len_code(len: u64) -> u64 {
    match len {
        2 => 1,
        4 => 3,
        8 => 2,
        _ => 0,
    }
}
