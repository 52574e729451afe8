// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hypervisor::VmOps;
use thiserror::Error;
use vm_memory::GuestMemoryMmap;

use crate::cpu::{CpuManager, Vcpu};
use crate::debug::DebugController;
use crate::interrupt::IrqRoutingManager;
use crate::memory_manager::MemoryManager;
use crate::session::{Session, SessionError};

pub mod config;
pub mod cpu;
pub mod debug;
pub mod device_state;
pub mod interrupt;
pub mod memory_manager;
pub mod session;
pub mod translation;
pub mod vcpu_state;

/// Errors associated with the accelerator as a whole
#[derive(Debug, Error)]
pub enum Error {
    #[error("Error opening the hypervisor session")]
    Session(#[source] SessionError),

    #[error("Error registering guest memory")]
    Memory(#[source] memory_manager::Error),

    #[error("Error setting up interrupt routing")]
    IrqRouting(#[source] interrupt::Error),

    #[error("vCPU error")]
    Cpu(#[source] cpu::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Every component driving one VM through the hypervisor.
pub struct Accelerator {
    session: Arc<Session>,
    guest_memory: GuestMemoryMmap,
    memory_manager: Mutex<MemoryManager>,
    irq_routing: Mutex<IrqRoutingManager>,
    cpu_manager: CpuManager,
}

impl Accelerator {
    /// Registers `guest_memory` and sets up the default interrupt routes.
    /// `vm_ops` receives the exits the kernel does not handle.
    pub fn new(
        session: Arc<Session>,
        guest_memory: GuestMemoryMmap,
        vm_ops: Arc<dyn VmOps>,
    ) -> Result<Self> {
        let mut memory_manager = MemoryManager::new(&session);
        memory_manager
            .add_guest_memory(&guest_memory, false)
            .map_err(Error::Memory)?;
        let irq_routing = IrqRoutingManager::new(&session).map_err(Error::IrqRouting)?;

        let debug = Arc::new(Mutex::new(DebugController::new(guest_memory.clone())));
        let guest_cpuid = session.supported_cpuid().to_vec();
        let cpu_manager = CpuManager::new(session.clone(), vm_ops, debug, guest_cpuid);

        Ok(Accelerator {
            session,
            guest_memory,
            memory_manager: Mutex::new(memory_manager),
            irq_routing: Mutex::new(irq_routing),
            cpu_manager,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn guest_memory(&self) -> &GuestMemoryMmap {
        &self.guest_memory
    }

    pub fn memory_manager(&self) -> MutexGuard<'_, MemoryManager> {
        self.memory_manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn irq_routing(&self) -> MutexGuard<'_, IrqRoutingManager> {
        self.irq_routing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cpu_manager(&self) -> &CpuManager {
        &self.cpu_manager
    }

    /// Creates vCPUs `0..count` in their post-INIT state. vCPU 0 is the
    /// bootstrap processor.
    pub fn create_vcpus(&self, count: u8) -> Result<Vec<Vcpu>> {
        (0..u32::from(count))
            .map(|id| self.cpu_manager.create_vcpu(id).map_err(Error::Cpu))
            .collect()
    }

    pub fn start(&self, vcpus: Vec<Vcpu>) -> Result<()> {
        info!("Starting {} vCPUs", vcpus.len());
        self.cpu_manager.start(vcpus).map_err(Error::Cpu)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.cpu_manager.shutdown().map_err(Error::Cpu)
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::{Arc, Mutex, MutexGuard};

    use hypervisor::mock::{MockHypervisor, MockVmState};

    use crate::config::AccelConfig;
    use crate::session::Session;

    // Only one session may be open per process.
    static SESSION_LOCK: Mutex<()> = Mutex::new(());

    pub fn session_guard() -> MutexGuard<'static, ()> {
        SESSION_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mock_session(
        hv: MockHypervisor,
        config: AccelConfig,
    ) -> (Arc<Session>, Arc<MockVmState>) {
        let state = hv.vm_state();
        let session = Session::open(Arc::new(hv), config).unwrap();
        (session, state)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use hypervisor::arch::x86::run_page::RunPageBuilder;
    use hypervisor::mock::MockHypervisor;
    use hypervisor::{IrqchipKind, MemTxAttrs, MsiMessage};
    use vm_memory::GuestAddress;

    use super::*;
    use crate::config::AccelConfig;
    use crate::test_utils::{mock_session, session_guard};

    #[derive(Default)]
    struct Ops {
        port_0x80: Mutex<Vec<u8>>,
        shutdown: AtomicBool,
    }

    impl VmOps for Ops {
        fn pio_read(
            &self,
            _port: u64,
            _data: &mut [u8],
            _attrs: MemTxAttrs,
        ) -> hypervisor::vm::Result<()> {
            Ok(())
        }

        fn pio_write(
            &self,
            port: u64,
            data: &[u8],
            _attrs: MemTxAttrs,
        ) -> hypervisor::vm::Result<()> {
            if port == 0x80 {
                self.port_0x80.lock().unwrap().extend_from_slice(data);
            }
            Ok(())
        }

        fn mmio_read(
            &self,
            _gpa: u64,
            _data: &mut [u8],
            _attrs: MemTxAttrs,
        ) -> hypervisor::vm::Result<()> {
            Ok(())
        }

        fn mmio_write(
            &self,
            _gpa: u64,
            _data: &[u8],
            _attrs: MemTxAttrs,
        ) -> hypervisor::vm::Result<()> {
            Ok(())
        }

        fn request_shutdown(&self) {
            self.shutdown.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_end_to_end() {
        let _guard = session_guard();
        let (session, state) = mock_session(MockHypervisor::new(), AccelConfig::default());
        assert_eq!(session.capabilities().nr_slots, 32);

        let ram = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap();
        let ops = Arc::new(Ops::default());
        let accel = Accelerator::new(session, ram, ops.clone()).unwrap();

        let slot = state.slot(0).unwrap();
        assert_eq!(slot.guest_phys_addr, 0);
        assert_eq!(slot.memory_size, 0x1000);
        let hva = accel.memory_manager().gpa2hva(0x10).unwrap();
        assert_eq!(accel.memory_manager().hva2gpa(hva, 1, 4), (1, vec![(0x10, 1)]));

        let mut routing = accel.irq_routing();
        routing
            .add_irqchip_route(5, IrqchipKind::Ioapic, 5)
            .unwrap();
        routing.commit_routes().unwrap();
        let commits = state.routing_commit_count();

        let msg = MsiMessage {
            address_lo: 0xfee0_0000,
            data: 0x40,
            ..Default::default()
        };
        routing.send_msi(msg).unwrap();
        let (gsi, level) = *state.irq_lines.lock().unwrap().last().unwrap();
        assert_ne!(gsi, 5);
        assert!(level);
        assert_eq!(state.routing_commit_count(), commits + 1);

        routing.send_msi(msg).unwrap();
        assert_eq!(state.irq_lines.lock().unwrap().last().unwrap().0, gsi);
        assert_eq!(state.routing_commit_count(), commits + 1);
        drop(routing);

        // One vCPU writes to the POST port, then the script runs dry and
        // the guest shuts down.
        let vcpus = accel.create_vcpus(1).unwrap();
        state
            .vcpu(0)
            .push_exit(RunPageBuilder::new().io(true, 0x80, 1, 1, &[0x55]).build());
        accel.start(vcpus).unwrap();
        while !ops.shutdown.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        accel.shutdown().unwrap();
        assert_eq!(*ops.port_0x80.lock().unwrap(), vec![0x55]);
    }
}
