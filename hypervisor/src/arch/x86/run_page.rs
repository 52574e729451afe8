// Copyright © 2020, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Codec for the memory-mapped run page shared with the kernel.
//!
//! The run page starts with a fixed header of input and output fields,
//! followed by a payload union whose meaning depends on the exit reason.
//! IO data lives elsewhere in the same mapping, at `data_offset` from the
//! start of the page. All fields are native-endian.
//!
//! ```text
//!   0  request_interrupt_window  u8   (in)
//!   1  immediate_exit            u8   (in)
//!   8  exit_reason               u32  (out)
//!  12  ready_for_interrupt_inj.  u8   (out)
//!  13  if_flag                   u8   (out)
//!  14  flags                     u16  (out)
//!  16  cr8                       u64  (in/out)
//!  24  apic_base                 u64  (out)
//!  32  payload union             256 bytes
//! 288  valid_regs                u64
//! 296  dirty_regs                u64
//! ```

use byteorder::{ByteOrder, NativeEndian};
use thiserror::Error;

use crate::cpu::{DebugExit, InternalErrorKind, SystemEventKind, VmExit};

pub const REQUEST_INTERRUPT_WINDOW_OFFSET: usize = 0;
pub const IMMEDIATE_EXIT_OFFSET: usize = 1;
pub const EXIT_REASON_OFFSET: usize = 8;
pub const READY_FOR_INTERRUPT_INJECTION_OFFSET: usize = 12;
pub const IF_FLAG_OFFSET: usize = 13;
pub const FLAGS_OFFSET: usize = 14;
pub const CR8_OFFSET: usize = 16;
pub const APIC_BASE_OFFSET: usize = 24;
pub const PAYLOAD_OFFSET: usize = 32;
pub const PAYLOAD_SIZE: usize = 256;
pub const VALID_REGS_OFFSET: usize = 288;
pub const DIRTY_REGS_OFFSET: usize = 296;
/// Bytes covered by the header and the payload union.
pub const RUN_HEADER_SIZE: usize = DIRTY_REGS_OFFSET + 8;

// Exit reasons
pub const EXIT_UNKNOWN: u32 = 0;
pub const EXIT_EXCEPTION: u32 = 1;
pub const EXIT_IO: u32 = 2;
pub const EXIT_HYPERCALL: u32 = 3;
pub const EXIT_DEBUG: u32 = 4;
pub const EXIT_HLT: u32 = 5;
pub const EXIT_MMIO: u32 = 6;
pub const EXIT_IRQ_WINDOW_OPEN: u32 = 7;
pub const EXIT_SHUTDOWN: u32 = 8;
pub const EXIT_FAIL_ENTRY: u32 = 9;
pub const EXIT_INTR: u32 = 10;
pub const EXIT_SET_TPR: u32 = 11;
pub const EXIT_TPR_ACCESS: u32 = 12;
pub const EXIT_NMI: u32 = 16;
pub const EXIT_INTERNAL_ERROR: u32 = 17;
pub const EXIT_SYSTEM_EVENT: u32 = 24;
pub const EXIT_IOAPIC_EOI: u32 = 26;

pub const IO_DIRECTION_IN: u8 = 0;
pub const IO_DIRECTION_OUT: u8 = 1;

pub const INTERNAL_ERROR_EMULATION: u32 = 1;
pub const INTERNAL_ERROR_SIMUL_EX: u32 = 2;
pub const INTERNAL_ERROR_DELIVERY_EV: u32 = 3;
/// Capacity of the internal-error `data` array.
pub const INTERNAL_ERROR_MAX_DATA: usize = 16;

pub const SYSTEM_EVENT_SHUTDOWN: u32 = 1;
pub const SYSTEM_EVENT_RESET: u32 = 2;
pub const SYSTEM_EVENT_CRASH: u32 = 3;

/// Run flag reporting that the vCPU was in system management mode.
pub const RUN_FLAG_SMM: u16 = 1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RunPageError {
    #[error("Run page is {0} bytes, smaller than its header")]
    TooShort(usize),
    #[error("IO data at offset {offset:#x} of length {len} lies outside the run mapping")]
    DataOutOfBounds { offset: usize, len: usize },
    #[error("MMIO access of {0} bytes does not fit the payload")]
    InvalidMmioLength(u32),
}

pub type Result<T> = std::result::Result<T, RunPageError>;

/// Output fields refreshed by the kernel on every exit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunState {
    pub ready_for_interrupt_injection: bool,
    pub if_flag: bool,
    pub smm: bool,
    pub cr8: u64,
    pub apic_base: u64,
}

fn payload_u8(page: &[u8], off: usize) -> u8 {
    page[PAYLOAD_OFFSET + off]
}

fn payload_u16(page: &[u8], off: usize) -> u16 {
    NativeEndian::read_u16(&page[PAYLOAD_OFFSET + off..])
}

fn payload_u32(page: &[u8], off: usize) -> u32 {
    NativeEndian::read_u32(&page[PAYLOAD_OFFSET + off..])
}

fn payload_u64(page: &[u8], off: usize) -> u64 {
    NativeEndian::read_u64(&page[PAYLOAD_OFFSET + off..])
}

fn check_len(page: &[u8]) -> Result<()> {
    if page.len() < RUN_HEADER_SIZE {
        return Err(RunPageError::TooShort(page.len()));
    }
    Ok(())
}

pub fn exit_reason(page: &[u8]) -> Result<u32> {
    check_len(page)?;
    Ok(NativeEndian::read_u32(&page[EXIT_REASON_OFFSET..]))
}

pub fn read_state(page: &[u8]) -> Result<RunState> {
    check_len(page)?;
    Ok(RunState {
        ready_for_interrupt_injection: page[READY_FOR_INTERRUPT_INJECTION_OFFSET] != 0,
        if_flag: page[IF_FLAG_OFFSET] != 0,
        smm: NativeEndian::read_u16(&page[FLAGS_OFFSET..]) & RUN_FLAG_SMM != 0,
        cr8: NativeEndian::read_u64(&page[CR8_OFFSET..]),
        apic_base: NativeEndian::read_u64(&page[APIC_BASE_OFFSET..]),
    })
}

pub fn set_request_interrupt_window(page: &mut [u8], request: bool) -> Result<()> {
    check_len(page)?;
    page[REQUEST_INTERRUPT_WINDOW_OFFSET] = request as u8;
    Ok(())
}

pub fn set_immediate_exit(page: &mut [u8], exit: bool) -> Result<()> {
    check_len(page)?;
    page[IMMEDIATE_EXIT_OFFSET] = exit as u8;
    Ok(())
}

pub fn set_cr8(page: &mut [u8], cr8: u64) -> Result<()> {
    check_len(page)?;
    NativeEndian::write_u64(&mut page[CR8_OFFSET..], cr8);
    Ok(())
}

/// Decodes the exit stored in `page`.
///
/// `page` must cover the whole run mapping so that IO data, which the
/// kernel places past the header, can be borrowed in place. Exit reasons
/// the codec does not know are reported as `VmExit::Unsupported`.
pub fn decode(page: &mut [u8]) -> Result<VmExit<'_>> {
    let reason = exit_reason(page)?;

    let exit = match reason {
        EXIT_UNKNOWN => VmExit::Unknown {
            hardware_exit_reason: payload_u64(page, 0),
        },
        EXIT_EXCEPTION => VmExit::Exception {
            exception: payload_u32(page, 0),
            error_code: payload_u32(page, 4),
        },
        EXIT_IO => {
            let direction = payload_u8(page, 0);
            let size = payload_u8(page, 1);
            let port = payload_u16(page, 2);
            let count = payload_u32(page, 4);
            let offset = payload_u64(page, 8) as usize;
            let len = size as usize * count as usize;
            if offset
                .checked_add(len)
                .map(|end| end > page.len())
                .unwrap_or(true)
            {
                return Err(RunPageError::DataOutOfBounds { offset, len });
            }
            if direction == IO_DIRECTION_OUT {
                let page: &[u8] = page;
                VmExit::IoOut {
                    port,
                    size,
                    count,
                    data: &page[offset..offset + len],
                }
            } else {
                VmExit::IoIn {
                    port,
                    size,
                    count,
                    data: &mut page[offset..offset + len],
                }
            }
        }
        EXIT_HYPERCALL => {
            let mut args = [0u64; 6];
            for (i, arg) in args.iter_mut().enumerate() {
                *arg = payload_u64(page, 8 + i * 8);
            }
            VmExit::Hypercall {
                nr: payload_u64(page, 0),
                args,
            }
        }
        EXIT_DEBUG => VmExit::Debug(DebugExit {
            exception: payload_u32(page, 0),
            pc: payload_u64(page, 8),
            dr6: payload_u64(page, 16),
            dr7: payload_u64(page, 24),
        }),
        EXIT_HLT => VmExit::Hlt,
        EXIT_MMIO => {
            let addr = payload_u64(page, 0);
            let len = payload_u32(page, 16);
            if len as usize > 8 {
                return Err(RunPageError::InvalidMmioLength(len));
            }
            let is_write = payload_u8(page, 20) != 0;
            let start = PAYLOAD_OFFSET + 8;
            let end = start + len as usize;
            if is_write {
                let page: &[u8] = page;
                VmExit::MmioWrite {
                    addr,
                    data: &page[start..end],
                }
            } else {
                VmExit::MmioRead {
                    addr,
                    data: &mut page[start..end],
                }
            }
        }
        EXIT_IRQ_WINDOW_OPEN => VmExit::IrqWindowOpen,
        EXIT_SHUTDOWN => VmExit::Shutdown,
        EXIT_FAIL_ENTRY => VmExit::FailEntry {
            hardware_entry_failure_reason: payload_u64(page, 0),
            cpu: payload_u32(page, 8),
        },
        EXIT_INTR => VmExit::Intr,
        EXIT_SET_TPR => VmExit::SetTpr,
        EXIT_TPR_ACCESS => VmExit::TprAccess {
            rip: payload_u64(page, 0),
            is_write: payload_u32(page, 8) != 0,
        },
        EXIT_NMI => VmExit::Nmi,
        EXIT_INTERNAL_ERROR => {
            let suberror = payload_u32(page, 0);
            let ndata = (payload_u32(page, 4) as usize).min(INTERNAL_ERROR_MAX_DATA);
            let data = (0..ndata).map(|i| payload_u64(page, 8 + i * 8)).collect();
            VmExit::InternalError {
                suberror: InternalErrorKind::from(suberror),
                data,
            }
        }
        EXIT_SYSTEM_EVENT => VmExit::SystemEvent {
            kind: SystemEventKind::from(payload_u32(page, 0)),
            flags: payload_u64(page, 8),
        },
        EXIT_IOAPIC_EOI => VmExit::IoapicEoi(payload_u8(page, 0)),
        other => VmExit::Unsupported(other),
    };

    Ok(exit)
}

/// Builds synthetic run pages, as the kernel would leave them after an
/// exit. Used by the in-process backend and by tests.
pub struct RunPageBuilder {
    page: Vec<u8>,
}

/// Offset at which built IO exits place their data.
pub const BUILDER_IO_DATA_OFFSET: usize = 4096;
/// Size of pages produced by the builder.
pub const BUILDER_PAGE_SIZE: usize = 8192;

impl Default for RunPageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RunPageBuilder {
    pub fn new() -> Self {
        RunPageBuilder {
            page: vec![0; BUILDER_PAGE_SIZE],
        }
    }

    fn reason(mut self, reason: u32) -> Self {
        NativeEndian::write_u32(&mut self.page[EXIT_REASON_OFFSET..], reason);
        self
    }

    fn put_u8(&mut self, off: usize, v: u8) {
        self.page[PAYLOAD_OFFSET + off] = v;
    }

    fn put_u16(&mut self, off: usize, v: u16) {
        NativeEndian::write_u16(&mut self.page[PAYLOAD_OFFSET + off..], v);
    }

    fn put_u32(&mut self, off: usize, v: u32) {
        NativeEndian::write_u32(&mut self.page[PAYLOAD_OFFSET + off..], v);
    }

    fn put_u64(&mut self, off: usize, v: u64) {
        NativeEndian::write_u64(&mut self.page[PAYLOAD_OFFSET + off..], v);
    }

    pub fn exit(self, reason: u32) -> Self {
        self.reason(reason)
    }

    pub fn state(mut self, state: RunState) -> Self {
        self.page[READY_FOR_INTERRUPT_INJECTION_OFFSET] = state.ready_for_interrupt_injection as u8;
        self.page[IF_FLAG_OFFSET] = state.if_flag as u8;
        NativeEndian::write_u16(
            &mut self.page[FLAGS_OFFSET..],
            if state.smm { RUN_FLAG_SMM } else { 0 },
        );
        NativeEndian::write_u64(&mut self.page[CR8_OFFSET..], state.cr8);
        NativeEndian::write_u64(&mut self.page[APIC_BASE_OFFSET..], state.apic_base);
        self
    }

    /// An IO exit. For `out` accesses `data` holds the `size * count`
    /// bytes written by the guest; for `in` accesses it is ignored.
    pub fn io(mut self, out: bool, port: u16, size: u8, count: u32, data: &[u8]) -> Self {
        self.put_u8(0, if out { IO_DIRECTION_OUT } else { IO_DIRECTION_IN });
        self.put_u8(1, size);
        self.put_u16(2, port);
        self.put_u32(4, count);
        self.put_u64(8, BUILDER_IO_DATA_OFFSET as u64);
        if out {
            let len = data.len().min(BUILDER_PAGE_SIZE - BUILDER_IO_DATA_OFFSET);
            self.page[BUILDER_IO_DATA_OFFSET..BUILDER_IO_DATA_OFFSET + len]
                .copy_from_slice(&data[..len]);
        }
        self.reason(EXIT_IO)
    }

    pub fn mmio(mut self, addr: u64, data: &[u8], len: u32, is_write: bool) -> Self {
        self.put_u64(0, addr);
        let n = data.len().min(8);
        self.page[PAYLOAD_OFFSET + 8..PAYLOAD_OFFSET + 8 + n].copy_from_slice(&data[..n]);
        self.put_u32(16, len);
        self.put_u8(20, is_write as u8);
        self.reason(EXIT_MMIO)
    }

    pub fn debug(mut self, exception: u32, pc: u64, dr6: u64, dr7: u64) -> Self {
        self.put_u32(0, exception);
        self.put_u64(8, pc);
        self.put_u64(16, dr6);
        self.put_u64(24, dr7);
        self.reason(EXIT_DEBUG)
    }

    pub fn system_event(mut self, kind: u32, flags: u64) -> Self {
        self.put_u32(0, kind);
        self.put_u32(4, 1);
        self.put_u64(8, flags);
        self.reason(EXIT_SYSTEM_EVENT)
    }

    pub fn internal_error(mut self, suberror: u32, data: &[u64]) -> Self {
        let n = data.len().min(INTERNAL_ERROR_MAX_DATA);
        self.put_u32(0, suberror);
        self.put_u32(4, n as u32);
        for (i, d) in data[..n].iter().enumerate() {
            self.put_u64(8 + i * 8, *d);
        }
        self.reason(EXIT_INTERNAL_ERROR)
    }

    pub fn fail_entry(mut self, reason: u64, cpu: u32) -> Self {
        self.put_u64(0, reason);
        self.put_u32(8, cpu);
        self.reason(EXIT_FAIL_ENTRY)
    }

    pub fn unknown(mut self, hardware_exit_reason: u64) -> Self {
        self.put_u64(0, hardware_exit_reason);
        self.reason(EXIT_UNKNOWN)
    }

    pub fn tpr_access(mut self, rip: u64, is_write: bool) -> Self {
        self.put_u64(0, rip);
        self.put_u32(8, is_write as u32);
        self.reason(EXIT_TPR_ACCESS)
    }

    pub fn ioapic_eoi(mut self, vector: u8) -> Self {
        self.put_u8(0, vector);
        self.reason(EXIT_IOAPIC_EOI)
    }

    pub fn exception(mut self, exception: u32, error_code: u32) -> Self {
        self.put_u32(0, exception);
        self.put_u32(4, error_code);
        self.reason(EXIT_EXCEPTION)
    }

    pub fn build(self) -> Vec<u8> {
        self.page
    }
}
