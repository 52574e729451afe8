// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0

#[macro_use]
extern crate log;

use std::error::Error;
use std::io::Write;
use std::sync::Mutex;

use hypervisor::{MemTxAttrs, VmOps};
use vm_memory::{Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap};
use vmm::cpu::Vcpu;

/// Prints a chain of errors to the user in a consistent manner.
/// The user will see a clear chain of errors, followed by debug output
/// for opening issues.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    eprint!("Error: {component} exited with the following ");
    if top_error.source().is_none() {
        eprintln!("error:");
        eprintln!("  {top_error}");
    } else {
        eprintln!("chain of errors:");
        std::iter::successors(Some(top_error), |sub_error| (*sub_error).source())
            .enumerate()
            .for_each(|(level, error)| {
                eprintln!("  {level}: {error}",);
            });
    }

    eprintln!();
    eprintln!("Debug Info: {top_error:?}");
}

/// Where the smoke guest is loaded and starts executing, in real mode.
pub const SMOKE_GUEST_ADDRESS: u64 = 0x1000;
/// The smoke guest prints to the first UART.
pub const SMOKE_SERIAL_PORT: u64 = 0x3f8;
/// Any write to this port ends the smoke run.
pub const SMOKE_EXIT_PORT: u64 = 0xf4;

/// Writes "OK\n" to the UART data register, signals the exit port and
/// halts.
pub const SMOKE_GUEST: [u8; 17] = [
    0xba, 0xf8, 0x03, // mov dx, 0x3f8
    0xb0, b'O', // mov al, 'O'
    0xee, // out dx, al
    0xb0, b'K', // mov al, 'K'
    0xee, // out dx, al
    0xb0, b'\n', // mov al, '\n'
    0xee, // out dx, al
    0xb0, 0x00, // mov al, 0
    0xe6, 0xf4, // out 0xf4, al
    0xf4, // hlt
];

/// Device side of the smoke run: a write-only UART and an exit port.
pub struct SmokeOps {
    output: Mutex<Vec<u8>>,
    echo: bool,
    exit: flume::Sender<()>,
}

impl SmokeOps {
    /// `exit` fires once the guest is done. With `echo` set, serial output
    /// is copied to stdout as it arrives.
    pub fn new(exit: flume::Sender<()>, echo: bool) -> Self {
        SmokeOps {
            output: Mutex::new(Vec::new()),
            echo,
            exit,
        }
    }

    /// Everything the guest wrote to the UART so far.
    pub fn output(&self) -> Vec<u8> {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn finish(&self) {
        // Nobody waiting means the run is already over.
        let _ = self.exit.try_send(());
    }
}

impl VmOps for SmokeOps {
    fn pio_read(
        &self,
        _port: u64,
        data: &mut [u8],
        _attrs: MemTxAttrs,
    ) -> hypervisor::vm::Result<()> {
        // Floating bus.
        data.fill(0xff);
        Ok(())
    }

    fn pio_write(&self, port: u64, data: &[u8], attrs: MemTxAttrs) -> hypervisor::vm::Result<()> {
        match port {
            SMOKE_SERIAL_PORT => {
                self.output
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .extend_from_slice(data);
                if self.echo {
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(data).and_then(|_| stdout.flush());
                }
            }
            SMOKE_EXIT_PORT => {
                info!("vCPU {} wrote the exit port", attrs.requester_id);
                self.finish();
            }
            _ => debug!("Ignoring write to port {:#x}", port),
        }
        Ok(())
    }

    fn mmio_read(
        &self,
        gpa: u64,
        data: &mut [u8],
        _attrs: MemTxAttrs,
    ) -> hypervisor::vm::Result<()> {
        debug!("Unhandled MMIO read at {:#x}", gpa);
        data.fill(0xff);
        Ok(())
    }

    fn mmio_write(&self, gpa: u64, _data: &[u8], _attrs: MemTxAttrs) -> hypervisor::vm::Result<()> {
        debug!("Unhandled MMIO write at {:#x}", gpa);
        Ok(())
    }

    fn request_reset(&self) {
        warn!("Smoke guest requested a reset");
        self.finish();
    }

    fn request_shutdown(&self) {
        self.finish();
    }

    fn request_panic(&self, vcpu_id: u32, state: &str) {
        error!("Smoke guest crashed on vCPU {}: {}", vcpu_id, state);
        self.finish();
    }
}

/// Copies the smoke guest into memory and points the bootstrap vCPU at it.
pub fn load_smoke_guest(
    memory: &GuestMemoryMmap,
    bsp: &mut Vcpu,
) -> Result<(), GuestMemoryError> {
    memory.write_slice(&SMOKE_GUEST, GuestAddress(SMOKE_GUEST_ADDRESS))?;

    let snapshot = bsp.snapshot_mut();
    let cs = &mut snapshot.sregs_mut().cs;
    cs.selector = 0;
    cs.base = 0;
    snapshot.regs_mut().rip = SMOKE_GUEST_ADDRESS;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use hypervisor::arch::x86::run_page::RunPageBuilder;
    use hypervisor::mock::MockHypervisor;
    use vmm::config::AccelConfig;
    use vmm::session::Session;
    use vmm::Accelerator;

    use super::*;

    #[test]
    fn test_smoke_run_on_mock() {
        let hv = MockHypervisor::new();
        let state = hv.vm_state();
        let session = Session::open(Arc::new(hv), AccelConfig::default()).unwrap();
        let memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10_0000)]).unwrap();

        let (tx, rx) = flume::bounded(1);
        let ops = Arc::new(SmokeOps::new(tx, false));
        let accel = Accelerator::new(session, memory, ops.clone()).unwrap();

        let mut vcpus = accel.create_vcpus(1).unwrap();
        load_smoke_guest(accel.guest_memory(), &mut vcpus[0]).unwrap();
        let mut code = [0u8; SMOKE_GUEST.len()];
        accel
            .guest_memory()
            .read_slice(&mut code, GuestAddress(SMOKE_GUEST_ADDRESS))
            .unwrap();
        assert_eq!(code, SMOKE_GUEST);

        // The exits the guest produces on real hardware.
        let mock = state.vcpu(0);
        for byte in b"OK\n" {
            mock.push_exit(
                RunPageBuilder::new()
                    .io(true, SMOKE_SERIAL_PORT as u16, 1, 1, &[*byte])
                    .build(),
            );
        }
        mock.push_exit(
            RunPageBuilder::new()
                .io(true, SMOKE_EXIT_PORT as u16, 1, 1, &[0])
                .build(),
        );

        accel.start(vcpus).unwrap();
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        accel.shutdown().unwrap();

        assert_eq!(ops.output(), b"OK\n");
        let regs = *mock.regs.lock().unwrap();
        assert_eq!(regs.rip, SMOKE_GUEST_ADDRESS);
        assert_eq!(mock.sregs.lock().unwrap().cs.base, 0);
    }
}
