// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use std::{io, thread};

use hypervisor::arch::x86::regs::{APIC_BASE_BSP, APIC_BASE_DEFAULT, APIC_BASE_ENABLE, CR0_PE};
use hypervisor::arch::x86::run_page::RunState;
use hypervisor::arch::x86::{CpuIdEntry, Exception, MpState};
use hypervisor::{
    DebugExit, HypervisorCpuError, InternalErrorKind, IrqchipKind, MemTxAttrs, SystemEventKind,
    VmExit, VmOps,
};
use bitflags::bitflags;
use libc::{c_void, siginfo_t};
use thiserror::Error;
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};

use crate::config::{EmulationErrorPolicy, IrqchipMode};
use crate::debug::{self, BreakpointKind, DebugController, DebugStop};
use crate::device_state::{
    self, ApicDeviceState, ApicProxy, IoapicDeviceState, IoapicProxy, PicDeviceState, PicProxy,
};
use crate::session::{Session, SessionError};
use crate::vcpu_state::{self, RegisterLevel, RegisterSnapshot, VcpuStateSync};

const KICK_RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error creating vCPU")]
    CreateVcpu(#[source] SessionError),

    #[error("Error setting CPUID on vCPU {0}")]
    SetCpuid(u32, #[source] HypervisorCpuError),

    #[error("Error synchronizing vCPU state")]
    VcpuState(#[source] vcpu_state::Error),

    #[error("Error running vCPU")]
    VcpuRun(#[source] HypervisorCpuError),

    #[error("Error writing vCPU run inputs")]
    RunInput(#[source] HypervisorCpuError),

    #[error("Error setting guest debug")]
    SetGuestDebug(#[source] HypervisorCpuError),

    #[error("Error translating guest virtual address")]
    TranslateVirtualAddress(#[source] HypervisorCpuError),

    #[error("Guest virtual address {0:#x} is not mapped")]
    Unmapped(u64),

    #[error("Cannot spawn a new vCPU thread")]
    VcpuSpawn(#[source] io::Error),

    #[error("Cannot register the vCPU signal handler")]
    RegisterSignalHandler(#[source] vmm_sys_util::errno::Error),

    #[error("Error joining vCPU thread")]
    ThreadCleanup,

    #[error("vCPU {0} does not exist")]
    VcpuNotFound(u32),

    #[error("vCPU {0} stopped before handling the request")]
    VcpuGone(u32),

    #[error("vCPU {0} has not been started")]
    VcpuNotStarted(u32),

    #[error("vCPUs must be paused")]
    NotPaused,

    #[error("Breakpoint error")]
    Debug(#[source] debug::Error),

    #[error("Device state error")]
    DeviceState(#[source] device_state::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

bitflags! {
    /// Events raised on a vCPU from other threads.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AsyncEvents: u32 {
        const HARD = 1 << 0;
        const NMI = 1 << 1;
        const SMI = 1 << 2;
        const INIT = 1 << 3;
        const SIPI = 1 << 4;
        const MCE = 1 << 5;
        const POLL = 1 << 6;
        const TPR = 1 << 7;
        const EXIT = 1 << 8;
    }
}

/// Outcome of one pass through the execution loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitAction {
    Continue,
    Halted,
    Interrupted,
    Debug(DebugStop),
    Reset,
    Shutdown,
    Fatal,
}

/// A debug stop reported to the embedder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugEvent {
    pub vcpu_id: u32,
    pub stop: DebugStop,
}

type VcpuClosure = Box<dyn FnOnce(&mut Vcpu) + Send>;

/// Work queued for a vCPU thread, run before its next guest entry.
pub enum VcpuRequest {
    RefreshGuestDebug,
    SetSingleStep(bool),
    Run(VcpuClosure),
}

/// Cross-thread handle on one vCPU.
pub struct VcpuControl {
    id: u32,
    events: AtomicU32,
    sipi_vector: AtomicU32,
    kicked: AtomicBool,
    in_run: AtomicBool,
    parked: AtomicBool,
    started: AtomicBool,
    exited: AtomicBool,
    requests: (flume::Sender<VcpuRequest>, flume::Receiver<VcpuRequest>),
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl VcpuControl {
    fn new(id: u32) -> Self {
        VcpuControl {
            id,
            events: AtomicU32::new(0),
            sipi_vector: AtomicU32::new(0),
            kicked: AtomicBool::new(false),
            in_run: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            started: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            requests: flume::unbounded(),
            handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn pending_events(&self) -> AsyncEvents {
        AsyncEvents::from_bits_truncate(self.events.load(Ordering::SeqCst))
    }

    fn clear_events(&self, events: AsyncEvents) {
        self.events.fetch_and(!events.bits(), Ordering::SeqCst);
    }

    /// Raises `events` and forces the vCPU out of the guest to see them.
    pub fn raise(&self, events: AsyncEvents) {
        self.events.fetch_or(events.bits(), Ordering::SeqCst);
        self.kick();
    }

    pub fn raise_sipi(&self, vector: u8) {
        self.sipi_vector.store(u32::from(vector), Ordering::SeqCst);
        self.raise(AsyncEvents::SIPI);
    }

    pub fn request(&self, request: VcpuRequest) {
        // The receiver lives as long as `self`.
        let _ = self.requests.0.send(request);
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<thread::JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal_thread(&self) {
        if let Some(handle) = self.lock_handle().as_ref() {
            // SAFETY: the thread handle is valid until joined, which
            // requires the lock held here.
            unsafe {
                libc::pthread_kill(handle.as_pthread_t(), SIGRTMIN());
            }
        }
    }

    fn unpark_thread(&self) {
        if let Some(handle) = self.lock_handle().as_ref() {
            handle.thread().unpark()
        }
    }

    fn join_thread(&self) -> Result<()> {
        let handle = self.lock_handle().take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| Error::ThreadCleanup)?
        }
        Ok(())
    }

    /// Gets the vCPU out of a blocking run or a park.
    ///
    /// A signal that lands just before the thread enters the kernel is
    /// lost, so keep signalling until the thread has seen the kick.
    pub fn kick(&self) {
        self.kicked.store(true, Ordering::SeqCst);
        self.unpark_thread();
        while self.kicked.load(Ordering::SeqCst)
            && self.in_run.load(Ordering::SeqCst)
            && !self.exited.load(Ordering::SeqCst)
        {
            self.signal_thread();
            thread::sleep(KICK_RETRY_INTERVAL);
        }
    }

    fn has_work(&self) -> bool {
        !self.pending_events().is_empty()
            || !self.requests.1.is_empty()
            || self.kicked.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.exited.store(true, Ordering::SeqCst);
        // Dropping the queued closures wakes anyone waiting on them.
        self.requests.1.drain();
    }
}

/// Every vCPU control of the VM.
#[derive(Clone, Default)]
pub struct VcpuControlSet(Arc<RwLock<Vec<Arc<VcpuControl>>>>);

impl VcpuControlSet {
    fn insert(&self, control: Arc<VcpuControl>) {
        let mut controls = self.0.write().unwrap_or_else(PoisonError::into_inner);
        controls.retain(|c| c.id != control.id);
        controls.push(control);
    }

    pub fn get(&self, id: u32) -> Option<Arc<VcpuControl>> {
        self.all().into_iter().find(|c| c.id == id)
    }

    pub fn all(&self) -> Vec<Arc<VcpuControl>> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queues a request built by `request` on every vCPU and kicks them.
    pub fn broadcast<F: Fn() -> VcpuRequest>(&self, request: F) {
        for control in self.all() {
            control.request(request());
            control.kick();
        }
    }

    pub fn kick_all(&self) {
        for control in self.all() {
            control.kick();
        }
    }
}

fn lock_devices(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A vCPU together with its cached state, driven by its own thread.
pub struct Vcpu {
    id: u32,
    vcpu: Box<dyn hypervisor::Vcpu>,
    control: Arc<VcpuControl>,
    sync: Arc<VcpuStateSync>,
    snapshot: RegisterSnapshot,
    vm_ops: Arc<dyn VmOps>,
    device_lock: Arc<Mutex<()>>,
    debug: Arc<Mutex<DebugController>>,
    emulation_error: EmulationErrorPolicy,
    irqchip: IrqchipMode,
    halted: bool,
    single_step: bool,
    smm: bool,
    run_state: RunState,
    tpr_access_write: bool,
}

impl Vcpu {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn control(&self) -> &Arc<VcpuControl> {
        &self.control
    }

    pub fn snapshot(&self) -> &RegisterSnapshot {
        &self.snapshot
    }

    /// Mutable access to the cached registers. Changes reach the kernel
    /// before the next guest entry.
    pub fn snapshot_mut(&mut self) -> &mut RegisterSnapshot {
        self.snapshot.mark_dirty();
        &mut self.snapshot
    }

    pub fn hypervisor_vcpu(&self) -> &dyn hypervisor::Vcpu {
        self.vcpu.as_ref()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Refreshes the cache from the kernel unless it holds newer values.
    pub fn synchronize_state(&mut self) -> Result<()> {
        if !self.snapshot.is_dirty() {
            self.sync
                .get_registers(self.vcpu.as_ref(), &mut self.snapshot)
                .map_err(Error::VcpuState)?;
        }
        Ok(())
    }

    pub fn put_state(&mut self, level: RegisterLevel) -> Result<()> {
        self.sync
            .put_registers(self.vcpu.as_ref(), &mut self.snapshot, level)
            .map_err(Error::VcpuState)
    }

    fn drain_requests(&mut self) -> Result<()> {
        while let Ok(request) = self.control.requests.1.try_recv() {
            match request {
                VcpuRequest::RefreshGuestDebug => self.refresh_guest_debug()?,
                VcpuRequest::SetSingleStep(enable) => {
                    self.single_step = enable;
                    self.refresh_guest_debug()?;
                }
                VcpuRequest::Run(f) => f(self),
            }
        }
        Ok(())
    }

    fn refresh_guest_debug(&mut self) -> Result<()> {
        let debug = self
            .debug
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .guest_debug(self.single_step);
        self.vcpu
            .set_guest_debug(&debug)
            .map_err(Error::SetGuestDebug)
    }

    /// Handles events raised by other threads. Returns an action when the
    /// vCPU must not enter the guest.
    fn process_async_events(&mut self) -> Result<Option<ExitAction>> {
        let events = self.control.pending_events();

        if events.contains(AsyncEvents::EXIT) {
            self.control.clear_events(AsyncEvents::EXIT);
            return Ok(Some(ExitAction::Interrupted));
        }

        if events.contains(AsyncEvents::MCE) {
            self.control.clear_events(AsyncEvents::MCE);
            self.synchronize_state()?;
            let exception = self.snapshot.events().exception;
            if exception.injected != 0 && exception.nr == Exception::DF as u8 {
                warn!("vCPU {}: machine check during double fault", self.id);
                return Ok(Some(ExitAction::Reset));
            }
            let exception = &mut self.snapshot.events_mut().exception;
            exception.injected = 1;
            exception.nr = Exception::MC as u8;
            exception.has_error_code = 0;
            self.halted = false;
            if self.irqchip != IrqchipMode::Off {
                self.vcpu
                    .set_mp_state(MpState::Runnable)
                    .map_err(|e| Error::VcpuState(vcpu_state::Error::Put("MP", e)))?;
            }
        }

        if events.contains(AsyncEvents::INIT) && !self.smm {
            self.control.clear_events(AsyncEvents::INIT);
            self.synchronize_state()?;
            let bsp = self.snapshot.sregs().apic_base & APIC_BASE_BSP != 0;
            self.snapshot.reset_to_init(bsp);
            self.halted = !bsp;
        }

        if self.irqchip != IrqchipMode::Off {
            return Ok(None);
        }

        if events.contains(AsyncEvents::POLL) {
            self.control.clear_events(AsyncEvents::POLL);
            let _guard = lock_devices(&self.device_lock);
            self.vm_ops.apic_poll(self.id);
        }

        let events = self.control.pending_events();
        if (events.contains(AsyncEvents::HARD) && self.run_state.if_flag)
            || events.contains(AsyncEvents::NMI)
        {
            self.halted = false;
        }

        if events.contains(AsyncEvents::SIPI) {
            self.control.clear_events(AsyncEvents::SIPI);
            self.synchronize_state()?;
            let vector = self.control.sipi_vector.load(Ordering::SeqCst) as u8;
            self.snapshot.apply_sipi(vector);
            self.halted = false;
        }

        if events.contains(AsyncEvents::TPR) {
            self.control.clear_events(AsyncEvents::TPR);
            self.synchronize_state()?;
            let _guard = lock_devices(&self.device_lock);
            self.vm_ops
                .tpr_access(self.id, self.snapshot.regs().rip, self.tpr_access_write);
        }

        Ok(self.halted.then_some(ExitAction::Halted))
    }

    fn pre_run(&mut self) -> Result<()> {
        let events = self.control.pending_events();

        if events.contains(AsyncEvents::NMI) {
            self.control.clear_events(AsyncEvents::NMI);
            if let Err(e) = self.vcpu.nmi() {
                error!("vCPU {}: NMI injection failed, NMI lost: {}", self.id, e);
            }
        }
        if events.contains(AsyncEvents::SMI) {
            self.control.clear_events(AsyncEvents::SMI);
            if let Err(e) = self.vcpu.smi() {
                error!("vCPU {}: SMI injection failed, SMI lost: {}", self.id, e);
            }
        }

        if self.irqchip != IrqchipMode::On {
            let _guard = lock_devices(&self.device_lock);
            if self.control.pending_events().contains(AsyncEvents::HARD)
                && self.run_state.ready_for_interrupt_injection
                && self.run_state.if_flag
            {
                self.control.clear_events(AsyncEvents::HARD);
                if let Some(vector) = self.vm_ops.pic_interrupt() {
                    if let Err(e) = self.vcpu.inject_interrupt(u32::from(vector)) {
                        error!(
                            "vCPU {}: interrupt injection failed, vector {:#x} lost: {}",
                            self.id, vector, e
                        );
                    }
                }
            }
            let window = self.control.pending_events().contains(AsyncEvents::HARD);
            self.vcpu
                .set_request_interrupt_window(window)
                .map_err(Error::RunInput)?;
            self.vcpu
                .set_cr8(u64::from(self.vm_ops.apic_tpr(self.id)))
                .map_err(Error::RunInput)?;
        }
        Ok(())
    }

    /// Runs the vCPU once: pending events, state push, the blocking run
    /// and the exit handling.
    pub fn run_once(&mut self) -> Result<ExitAction> {
        self.drain_requests()?;
        if let Some(action) = self.process_async_events()? {
            return Ok(action);
        }
        if self.snapshot.is_dirty() {
            self.put_state(RegisterLevel::RuntimeOnly)?;
        }
        self.pre_run()?;

        self.control.in_run.store(true, Ordering::SeqCst);
        let immediate_exit = self.control.kicked.load(Ordering::SeqCst);
        if immediate_exit {
            self.vcpu.set_immediate_exit(true).map_err(Error::RunInput)?;
        }

        let exit = match self.vcpu.run() {
            Ok(run) => {
                self.control.in_run.store(false, Ordering::SeqCst);
                self.run_state = run.state;
                self.smm = run.state.smm;
                {
                    let _guard = (self.irqchip == IrqchipMode::Off)
                        .then(|| lock_devices(&self.device_lock));
                    self.vm_ops
                        .apic_update(self.id, run.state.cr8 as u8, run.state.apic_base);
                }
                let attrs = MemTxAttrs {
                    smm: run.state.smm,
                    requester_id: self.id,
                };

                match run.exit {
                    VmExit::IoIn {
                        port,
                        size,
                        count,
                        data,
                    } => {
                        let _guard = lock_devices(&self.device_lock);
                        let accesses = data.chunks_mut(usize::from(size).max(1));
                        for access in accesses.take(count as usize) {
                            if let Err(e) = self.vm_ops.pio_read(u64::from(port), access, attrs) {
                                warn!("vCPU {}: IO read at {:#x} failed: {}", self.id, port, e);
                            }
                        }
                        None
                    }
                    VmExit::IoOut {
                        port,
                        size,
                        count,
                        data,
                    } => {
                        let _guard = lock_devices(&self.device_lock);
                        for access in data.chunks(usize::from(size).max(1)).take(count as usize) {
                            if let Err(e) = self.vm_ops.pio_write(u64::from(port), access, attrs) {
                                warn!("vCPU {}: IO write at {:#x} failed: {}", self.id, port, e);
                            }
                        }
                        None
                    }
                    VmExit::MmioRead { addr, data } => {
                        let _guard = lock_devices(&self.device_lock);
                        if let Err(e) = self.vm_ops.mmio_read(addr, data, attrs) {
                            warn!("vCPU {}: MMIO read at {:#x} failed: {}", self.id, addr, e);
                        }
                        None
                    }
                    VmExit::MmioWrite { addr, data } => {
                        let _guard = lock_devices(&self.device_lock);
                        if let Err(e) = self.vm_ops.mmio_write(addr, data, attrs) {
                            warn!("vCPU {}: MMIO write at {:#x} failed: {}", self.id, addr, e);
                        }
                        None
                    }
                    exit => exit.into_owned(),
                }
            }
            Err(e) => {
                self.control.in_run.store(false, Ordering::SeqCst);
                return Err(Error::VcpuRun(e));
            }
        };

        self.control.kicked.store(false, Ordering::SeqCst);
        if immediate_exit {
            self.vcpu
                .set_immediate_exit(false)
                .map_err(Error::RunInput)?;
        }

        match exit {
            Some(exit) => self.handle_exit(exit),
            None => Ok(ExitAction::Continue),
        }
    }

    fn handle_exit(&mut self, exit: VmExit<'static>) -> Result<ExitAction> {
        match exit {
            // Completed in place while the run page was borrowed.
            VmExit::IoIn { .. }
            | VmExit::IoOut { .. }
            | VmExit::MmioRead { .. }
            | VmExit::MmioWrite { .. } => Ok(ExitAction::Continue),
            VmExit::IrqWindowOpen | VmExit::Intr | VmExit::Nmi | VmExit::SetTpr => {
                Ok(ExitAction::Continue)
            }
            VmExit::Interrupted => Ok(ExitAction::Interrupted),
            VmExit::Hlt => {
                let events = self.control.pending_events();
                if (events.contains(AsyncEvents::HARD) && self.run_state.if_flag)
                    || events.contains(AsyncEvents::NMI)
                {
                    Ok(ExitAction::Continue)
                } else {
                    self.halted = true;
                    Ok(ExitAction::Halted)
                }
            }
            VmExit::Shutdown => {
                info!("vCPU {}: triple fault, resetting", self.id);
                Ok(ExitAction::Reset)
            }
            VmExit::SystemEvent { kind, flags } => match kind {
                SystemEventKind::Shutdown => Ok(ExitAction::Shutdown),
                SystemEventKind::Reset => Ok(ExitAction::Reset),
                SystemEventKind::Crash => {
                    let report = self.crash_report();
                    error!("vCPU {}: guest crashed: {}", self.id, report);
                    self.vm_ops.request_panic(self.id, &report);
                    Ok(ExitAction::Shutdown)
                }
                SystemEventKind::Other(kind) => {
                    error!(
                        "vCPU {}: unknown system event {} (flags {:#x})",
                        self.id, kind, flags
                    );
                    Ok(ExitAction::Fatal)
                }
            },
            VmExit::InternalError { suberror, data } => {
                error!(
                    "vCPU {}: internal error, suberror {:?}, data {:x?}",
                    self.id, suberror, data
                );
                if suberror == InternalErrorKind::Emulation
                    && self.emulation_error == EmulationErrorPolicy::Permissive
                    && self.in_user_mode()?
                {
                    warn!("vCPU {}: emulation failure in user mode, continuing", self.id);
                    return Ok(ExitAction::Interrupted);
                }
                Ok(ExitAction::Fatal)
            }
            VmExit::TprAccess { rip, is_write } => {
                self.tpr_access_write = is_write;
                let _guard = lock_devices(&self.device_lock);
                self.vm_ops.tpr_access(self.id, rip, is_write);
                Ok(ExitAction::Continue)
            }
            VmExit::Debug(debug) => self.handle_debug(debug),
            VmExit::IoapicEoi(vector) => {
                let _guard = lock_devices(&self.device_lock);
                self.vm_ops.eoi(vector);
                Ok(ExitAction::Continue)
            }
            VmExit::Exception {
                exception,
                error_code,
            } => {
                error!(
                    "vCPU {}: unexpected exception exit {} (error code {:#x})",
                    self.id, exception, error_code
                );
                Ok(ExitAction::Fatal)
            }
            VmExit::Hypercall { nr, .. } => {
                error!("vCPU {}: unexpected hypercall exit {:#x}", self.id, nr);
                Ok(ExitAction::Fatal)
            }
            VmExit::FailEntry {
                hardware_entry_failure_reason,
                cpu,
            } => {
                error!(
                    "vCPU {}: failed to enter guest, hardware reason {:#x} on host CPU {}",
                    self.id, hardware_entry_failure_reason, cpu
                );
                Ok(ExitAction::Fatal)
            }
            VmExit::Unknown {
                hardware_exit_reason,
            } => {
                error!(
                    "vCPU {}: unknown exit, hardware reason {:#x}",
                    self.id, hardware_exit_reason
                );
                Ok(ExitAction::Fatal)
            }
            VmExit::Unsupported(reason) => {
                error!("vCPU {}: unsupported exit reason {}", self.id, reason);
                Ok(ExitAction::Fatal)
            }
        }
    }

    fn in_user_mode(&mut self) -> Result<bool> {
        self.synchronize_state()?;
        let sregs = self.snapshot.sregs();
        Ok(sregs.cr0 & CR0_PE != 0 && sregs.cs.dpl == 3)
    }

    fn handle_debug(&mut self, exit: DebugExit) -> Result<ExitAction> {
        let stop = self
            .debug
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .classify_debug_exit(&exit, self.single_step);
        self.synchronize_state()?;

        if stop != DebugStop::Guest {
            return Ok(ExitAction::Debug(stop));
        }

        let exception = &mut self.snapshot.events_mut().exception;
        exception.injected = 1;
        exception.nr = exit.exception as u8;
        exception.has_error_code = 0;
        if exit.exception == Exception::DB as u32 {
            self.snapshot.debug_regs_mut().dr6 = exit.dr6;
        }
        Ok(ExitAction::Continue)
    }

    fn crash_report(&mut self) -> String {
        if let Err(e) = self.synchronize_state() {
            warn!("vCPU {}: cannot read state for the crash report: {}", self.id, e);
        }
        serde_json::to_string(&self.snapshot.crash_report())
            .unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }

    /// Logs the full register state.
    pub fn dump_state(&mut self) {
        let report = self.crash_report();
        error!("vCPU {} state: {}", self.id, report);
    }

    fn wait_for_event(&self, kill: &AtomicBool, pause: &AtomicBool) {
        while !kill.load(Ordering::SeqCst)
            && !pause.load(Ordering::SeqCst)
            && !self.control.has_work()
        {
            thread::park();
        }
    }
}

/// Owns the vCPUs of the VM and their threads.
pub struct CpuManager {
    session: Arc<Session>,
    vm_ops: Arc<dyn VmOps>,
    sync: Arc<VcpuStateSync>,
    debug: Arc<Mutex<DebugController>>,
    controls: VcpuControlSet,
    guest_cpuid: Vec<CpuIdEntry>,
    vcpus_kill_signalled: Arc<AtomicBool>,
    vcpus_pause_signalled: Arc<AtomicBool>,
    debug_events: (flume::Sender<DebugEvent>, flume::Receiver<DebugEvent>),
}

impl CpuManager {
    /// `guest_cpuid` is the CPUID table given to every vCPU.
    pub fn new(
        session: Arc<Session>,
        vm_ops: Arc<dyn VmOps>,
        debug: Arc<Mutex<DebugController>>,
        guest_cpuid: Vec<CpuIdEntry>,
    ) -> Self {
        let sync = Arc::new(VcpuStateSync::new(&session, &guest_cpuid));
        CpuManager {
            session,
            vm_ops,
            sync,
            debug,
            controls: VcpuControlSet::default(),
            guest_cpuid,
            vcpus_kill_signalled: Arc::new(AtomicBool::new(false)),
            vcpus_pause_signalled: Arc::new(AtomicBool::new(false)),
            debug_events: flume::unbounded(),
        }
    }

    pub fn controls(&self) -> &VcpuControlSet {
        &self.controls
    }

    pub fn state_sync(&self) -> &Arc<VcpuStateSync> {
        &self.sync
    }

    /// Creates vCPU `id` in its post-INIT state.
    pub fn create_vcpu(&self, id: u32) -> Result<Vcpu> {
        let vcpu = self.session.create_vcpu(id).map_err(Error::CreateVcpu)?;
        vcpu.set_cpuid2(&self.guest_cpuid)
            .map_err(|e| Error::SetCpuid(id, e))?;

        let control = Arc::new(VcpuControl::new(id));
        self.controls.insert(control.clone());

        let config = self.session.config();
        let mut vcpu = Vcpu {
            id,
            vcpu,
            control,
            sync: self.sync.clone(),
            snapshot: RegisterSnapshot::default(),
            vm_ops: self.vm_ops.clone(),
            device_lock: self.session.device_lock(),
            debug: self.debug.clone(),
            emulation_error: config.emulation_error,
            irqchip: config.kernel_irqchip,
            halted: false,
            single_step: false,
            smm: false,
            run_state: RunState::default(),
            tpr_access_write: false,
        };

        let bsp = id == 0;
        let mut apic_base = APIC_BASE_DEFAULT | APIC_BASE_ENABLE;
        if bsp {
            apic_base |= APIC_BASE_BSP;
        }
        vcpu.snapshot.sregs_mut().apic_base = apic_base;
        vcpu.snapshot.reset_to_init(bsp);
        vcpu.halted = !bsp && config.kernel_irqchip == IrqchipMode::Off;
        vcpu.put_state(RegisterLevel::FullState)?;
        vcpu.refresh_guest_debug()?;
        Ok(vcpu)
    }

    /// Hands a vCPU back to the session once its thread is gone.
    pub fn destroy_vcpu(&self, vcpu: Vcpu) {
        self.session.destroy_vcpu(vcpu.vcpu);
    }

    /// Spawns one thread per vCPU and returns once all of them are running.
    pub fn start(&self, vcpus: Vec<Vcpu>) -> Result<()> {
        extern "C" fn handle_signal(_: i32, _: *mut siginfo_t, _: *mut c_void) {}
        // This uses an async signal safe handler to kick the vcpu threads.
        register_signal_handler(SIGRTMIN(), handle_signal).map_err(Error::RegisterSignalHandler)?;

        let vcpu_thread_barrier = Arc::new(Barrier::new(vcpus.len() + 1));

        for mut vcpu in vcpus {
            let control = vcpu.control.clone();
            let vcpu_thread_barrier = vcpu_thread_barrier.clone();
            let vcpu_kill_signalled = self.vcpus_kill_signalled.clone();
            let vcpu_pause_signalled = self.vcpus_pause_signalled.clone();
            let controls = self.controls.clone();
            let debug_events = self.debug_events.0.clone();
            let vm_ops = self.vm_ops.clone();

            let handle = thread::Builder::new()
                .name(format!("vcpu{}", vcpu.id))
                .spawn(move || {
                    // Block until all CPUs are ready.
                    vcpu_thread_barrier.wait();
                    debug!("vCPU {} thread started", vcpu.id);

                    loop {
                        match vcpu.run_once() {
                            Ok(ExitAction::Continue) | Ok(ExitAction::Interrupted) => {}
                            Ok(ExitAction::Halted) => {
                                vcpu.wait_for_event(&vcpu_kill_signalled, &vcpu_pause_signalled)
                            }
                            Ok(ExitAction::Debug(stop)) => {
                                if let Err(e) = debug_events.send(DebugEvent {
                                    vcpu_id: vcpu.id,
                                    stop,
                                }) {
                                    warn!("vCPU {}: debug stop not delivered: {}", vcpu.id, e);
                                }
                                vcpu_pause_signalled.store(true, Ordering::SeqCst);
                                for control in controls.all() {
                                    if control.id != vcpu.id {
                                        control.kick();
                                    }
                                }
                            }
                            Ok(ExitAction::Reset) => {
                                vm_ops.request_reset();
                                break;
                            }
                            Ok(ExitAction::Shutdown) => {
                                vm_ops.request_shutdown();
                                break;
                            }
                            Ok(ExitAction::Fatal) => {
                                vcpu.dump_state();
                                vm_ops.request_shutdown();
                                vcpu_kill_signalled.store(true, Ordering::SeqCst);
                                controls.kick_all();
                                break;
                            }
                            Err(e) => {
                                error!("vCPU {} generated error: {}", vcpu.id, e);
                                vcpu.dump_state();
                                vm_ops.request_shutdown();
                                vcpu_kill_signalled.store(true, Ordering::SeqCst);
                                controls.kick_all();
                                break;
                            }
                        }

                        // We've been told to terminate
                        if vcpu_kill_signalled.load(Ordering::SeqCst) {
                            break;
                        }

                        // Park until resumed, still serving requests so the
                        // state of a stopped vCPU can be inspected.
                        while vcpu_pause_signalled.load(Ordering::SeqCst)
                            && !vcpu_kill_signalled.load(Ordering::SeqCst)
                        {
                            vcpu.control.parked.store(true, Ordering::SeqCst);
                            if let Err(e) = vcpu.drain_requests() {
                                warn!("vCPU {}: request failed while paused: {}", vcpu.id, e);
                            }
                            vcpu.control.kicked.store(false, Ordering::SeqCst);
                            if vcpu_pause_signalled.load(Ordering::SeqCst)
                                && vcpu.control.requests.1.is_empty()
                            {
                                thread::park();
                            }
                        }
                        vcpu.control.parked.store(false, Ordering::SeqCst);

                        if vcpu_kill_signalled.load(Ordering::SeqCst) {
                            break;
                        }
                    }

                    vcpu.control.close();
                    debug!("vCPU {} thread stopped", vcpu.id);
                })
                .map_err(Error::VcpuSpawn)?;

            *control.lock_handle() = Some(handle);
            control.started.store(true, Ordering::SeqCst);
        }

        // Unblock all CPU threads.
        vcpu_thread_barrier.wait();
        Ok(())
    }

    pub fn kick(&self, id: u32) -> Result<()> {
        self.controls
            .get(id)
            .ok_or(Error::VcpuNotFound(id))?
            .kick();
        Ok(())
    }

    pub fn kick_all(&self) {
        self.controls.kick_all();
    }

    pub fn raise(&self, id: u32, events: AsyncEvents) -> Result<()> {
        self.controls
            .get(id)
            .ok_or(Error::VcpuNotFound(id))?
            .raise(events);
        Ok(())
    }

    pub fn pause(&self) {
        // Tell the vCPUs to pause themselves next time they exit
        self.vcpus_pause_signalled.store(true, Ordering::SeqCst);
        self.controls.kick_all();
    }

    /// Whether every live vCPU thread is parked.
    pub fn is_paused(&self) -> bool {
        self.vcpus_pause_signalled.load(Ordering::SeqCst)
            && self.controls.all().iter().all(|c| {
                c.parked.load(Ordering::SeqCst)
                    || c.exited.load(Ordering::SeqCst)
                    || c.lock_handle().is_none()
            })
    }

    pub fn resume(&self) {
        // The guest clock moved on while stopped.
        for control in self.controls.all() {
            control.request(VcpuRequest::Run(Box::new(|vcpu: &mut Vcpu| {
                vcpu.snapshot.invalidate_tsc()
            })));
        }

        self.vcpus_pause_signalled.store(false, Ordering::SeqCst);

        // Unpark all the VCPU threads.
        for control in self.controls.all() {
            control.unpark_thread();
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        // Tell the vCPUs to stop themselves next time they go through the loop
        self.vcpus_kill_signalled.store(true, Ordering::SeqCst);
        self.controls.kick_all();

        for control in self.controls.all() {
            control.join_thread()?;
        }
        Ok(())
    }

    pub fn debug_events(&self) -> flume::Receiver<DebugEvent> {
        self.debug_events.1.clone()
    }

    /// Runs `f` on the thread of vCPU `id` and returns its result.
    ///
    /// Fails with [`Error::VcpuNotStarted`] until [`CpuManager::start`] has
    /// handed the vCPU to its thread.
    pub fn with_vcpu<R, F>(&self, id: u32, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Vcpu) -> R + Send + 'static,
    {
        let control = self.controls.get(id).ok_or(Error::VcpuNotFound(id))?;
        if !control.started.load(Ordering::SeqCst) {
            return Err(Error::VcpuNotStarted(id));
        }
        let (tx, rx) = flume::bounded(1);
        control.request(VcpuRequest::Run(Box::new(move |vcpu: &mut Vcpu| {
            let _ = tx.send(f(vcpu));
        })));
        if control.exited.load(Ordering::SeqCst) {
            control.close();
        }
        control.kick();
        rx.recv().map_err(|_| Error::VcpuGone(id))
    }

    /// Guest-physical address of `gva` as seen by vCPU 0.
    pub fn translate_gva(&self, gva: u64) -> Result<u64> {
        let translated = self
            .with_vcpu(0, move |vcpu| vcpu.vcpu.translate_gva(gva))?
            .map_err(Error::TranslateVirtualAddress)?;
        if !translated.valid {
            return Err(Error::Unmapped(gva));
        }
        Ok(translated.gpa)
    }

    fn lock_debug(&self) -> MutexGuard<'_, DebugController> {
        self.debug.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes the breakpoint tables to every vCPU.
    pub fn update_guest_debug(&self) {
        self.controls
            .broadcast(|| VcpuRequest::RefreshGuestDebug);
    }

    pub fn insert_sw_breakpoint(&self, pc: u64) -> Result<()> {
        // Translate first: the vCPU thread may need the debug lock.
        let gpa = self.translate_gva(pc)?;
        self.lock_debug()
            .insert_sw_breakpoint(pc, gpa)
            .map_err(Error::Debug)?;
        self.update_guest_debug();
        Ok(())
    }

    pub fn remove_sw_breakpoint(&self, pc: u64) -> Result<()> {
        self.lock_debug()
            .remove_sw_breakpoint(pc)
            .map_err(Error::Debug)?;
        self.update_guest_debug();
        Ok(())
    }

    pub fn insert_hw_breakpoint(&self, addr: u64, len: u64, kind: BreakpointKind) -> Result<()> {
        self.lock_debug()
            .insert_hw_breakpoint(addr, len, kind)
            .map_err(Error::Debug)?;
        self.update_guest_debug();
        Ok(())
    }

    pub fn remove_hw_breakpoint(&self, addr: u64, len: u64, kind: BreakpointKind) -> Result<()> {
        self.lock_debug()
            .remove_hw_breakpoint(addr, len, kind)
            .map_err(Error::Debug)?;
        self.update_guest_debug();
        Ok(())
    }

    pub fn remove_all_breakpoints(&self) -> Result<()> {
        let result = self.lock_debug().remove_all().map_err(Error::Debug);
        self.update_guest_debug();
        result
    }

    pub fn set_single_step(&self, id: u32, enable: bool) -> Result<()> {
        let control = self.controls.get(id).ok_or(Error::VcpuNotFound(id))?;
        control.request(VcpuRequest::SetSingleStep(enable));
        control.kick();
        Ok(())
    }

    fn ensure_paused(&self) -> Result<()> {
        if self.is_paused() {
            Ok(())
        } else {
            Err(Error::NotPaused)
        }
    }

    pub fn pic_pre_save(&self, master: bool) -> Result<PicDeviceState> {
        self.ensure_paused()?;
        PicProxy { master }
            .pre_save(self.session.vm().as_ref())
            .map_err(Error::DeviceState)
    }

    pub fn pic_post_load(&self, master: bool, state: &PicDeviceState) -> Result<()> {
        self.ensure_paused()?;
        PicProxy { master }
            .post_load(self.session.vm().as_ref(), state)
            .map_err(Error::DeviceState)
    }

    pub fn ioapic_pre_save(&self) -> Result<IoapicDeviceState> {
        self.ensure_paused()?;
        IoapicProxy
            .pre_save(self.session.vm().as_ref())
            .map_err(Error::DeviceState)
    }

    pub fn ioapic_post_load(&self, state: &IoapicDeviceState) -> Result<()> {
        self.ensure_paused()?;
        IoapicProxy
            .post_load(self.session.vm().as_ref(), state)
            .map_err(Error::DeviceState)
    }

    pub fn apic_pre_save(&self, id: u32) -> Result<ApicDeviceState> {
        self.ensure_paused()?;
        self.with_vcpu(id, |vcpu| ApicProxy.pre_save(vcpu.hypervisor_vcpu()))?
            .map_err(Error::DeviceState)
    }

    pub fn apic_post_load(&self, id: u32, state: &ApicDeviceState) -> Result<()> {
        self.ensure_paused()?;
        let state = state.clone();
        self.with_vcpu(id, move |vcpu| {
            ApicProxy.post_load(vcpu.hypervisor_vcpu(), &state)
        })?
        .map_err(Error::DeviceState)
    }

    /// Chips whose state lives in the kernel for the configured mode.
    pub fn kernel_irqchips(&self) -> &'static [IrqchipKind] {
        match self.session.config().kernel_irqchip {
            IrqchipMode::On => &[
                IrqchipKind::PicMaster,
                IrqchipKind::PicSlave,
                IrqchipKind::Ioapic,
            ],
            IrqchipMode::Split | IrqchipMode::Off => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use hypervisor::arch::x86::run_page::{
        RunPageBuilder, EXIT_HLT, EXIT_INTR, EXIT_IRQ_WINDOW_OPEN, EXIT_SHUTDOWN,
        INTERNAL_ERROR_EMULATION, SYSTEM_EVENT_CRASH, SYSTEM_EVENT_RESET,
    };
    use hypervisor::arch::x86::{GUEST_DEBUG_ENABLE, GUEST_DEBUG_SINGLESTEP};
    use hypervisor::mock::{MockHypervisor, MockVmState};
    use vm_memory::{GuestAddress, GuestMemoryMmap};

    use super::*;
    use crate::config::AccelConfig;
    use crate::test_utils::{mock_session, session_guard};

    #[derive(Default)]
    struct RecordingOps {
        accesses: Mutex<Vec<(bool, u64, Vec<u8>, MemTxAttrs)>>,
        eois: Mutex<Vec<u8>>,
        tpr: Mutex<Vec<(u32, u64, bool)>>,
        panics: Mutex<Vec<String>>,
        pic_vector: Mutex<Option<u8>>,
        resets: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    impl VmOps for RecordingOps {
        fn pio_read(
            &self,
            port: u64,
            data: &mut [u8],
            attrs: MemTxAttrs,
        ) -> hypervisor::vm::Result<()> {
            let n = self.accesses.lock().unwrap().len() as u8;
            data.fill(0xa0 + n);
            self.accesses
                .lock()
                .unwrap()
                .push((false, port, data.to_vec(), attrs));
            Ok(())
        }

        fn pio_write(
            &self,
            port: u64,
            data: &[u8],
            attrs: MemTxAttrs,
        ) -> hypervisor::vm::Result<()> {
            self.accesses
                .lock()
                .unwrap()
                .push((true, port, data.to_vec(), attrs));
            Ok(())
        }

        fn mmio_read(
            &self,
            gpa: u64,
            data: &mut [u8],
            attrs: MemTxAttrs,
        ) -> hypervisor::vm::Result<()> {
            data.fill(0x5a);
            self.accesses
                .lock()
                .unwrap()
                .push((false, gpa, data.to_vec(), attrs));
            Ok(())
        }

        fn mmio_write(
            &self,
            gpa: u64,
            data: &[u8],
            attrs: MemTxAttrs,
        ) -> hypervisor::vm::Result<()> {
            self.accesses
                .lock()
                .unwrap()
                .push((true, gpa, data.to_vec(), attrs));
            Ok(())
        }

        fn eoi(&self, vector: u8) {
            self.eois.lock().unwrap().push(vector);
        }

        fn tpr_access(&self, vcpu_id: u32, rip: u64, is_write: bool) {
            self.tpr.lock().unwrap().push((vcpu_id, rip, is_write));
        }

        fn pic_interrupt(&self) -> Option<u8> {
            self.pic_vector.lock().unwrap().take()
        }

        fn apic_tpr(&self, _vcpu_id: u32) -> u8 {
            3
        }

        fn request_reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn request_shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn request_panic(&self, _vcpu_id: u32, state: &str) {
            self.panics.lock().unwrap().push(state.to_string());
        }
    }

    struct Fixture {
        manager: CpuManager,
        ops: Arc<RecordingOps>,
        state: Arc<MockVmState>,
    }

    fn fixture(config: AccelConfig) -> Fixture {
        let (session, state) = mock_session(MockHypervisor::new(), config);
        let memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
        let ops = Arc::new(RecordingOps::default());
        let manager = CpuManager::new(
            session.clone(),
            ops.clone(),
            Arc::new(Mutex::new(DebugController::new(memory))),
            session.supported_cpuid().to_vec(),
        );
        Fixture {
            manager,
            ops,
            state,
        }
    }

    fn userspace_irqchip() -> AccelConfig {
        AccelConfig {
            kernel_irqchip: IrqchipMode::Off,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_vcpu_initial_state() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        let vcpu = f.manager.create_vcpu(0).unwrap();
        let mock = f.state.vcpu(0);
        assert_eq!(mock.regs.lock().unwrap().rip, 0xfff0);
        assert_eq!(mock.sregs.lock().unwrap().cs.base, 0xffff_0000);
        assert_ne!(mock.sregs.lock().unwrap().apic_base & APIC_BASE_BSP, 0);
        assert_eq!(mock.cpuid.lock().unwrap().len(), 1);
        assert!(!vcpu.snapshot().is_dirty());

        let ap = f.manager.create_vcpu(1).unwrap();
        assert_eq!(ap.snapshot().mp_state(), MpState::Uninitialized);
        assert_eq!(f.state.vcpu(1).sregs.lock().unwrap().apic_base & APIC_BASE_BSP, 0);
    }

    #[test]
    fn test_io_replay() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        let mut vcpu = f.manager.create_vcpu(0).unwrap();
        let mock = f.state.vcpu(0);
        mock.push_exit(
            RunPageBuilder::new()
                .io(true, 0x3f8, 2, 3, &[1, 2, 3, 4, 5, 6])
                .build(),
        );
        mock.push_exit(RunPageBuilder::new().io(false, 0x60, 2, 3, &[]).build());

        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Continue);
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Continue);

        let accesses = f.ops.accesses.lock().unwrap();
        let attrs = MemTxAttrs {
            smm: false,
            requester_id: 0,
        };
        assert_eq!(
            *accesses,
            vec![
                (true, 0x3f8, vec![1, 2], attrs),
                (true, 0x3f8, vec![3, 4], attrs),
                (true, 0x3f8, vec![5, 6], attrs),
                (false, 0x60, vec![0xa3, 0xa3], attrs),
                (false, 0x60, vec![0xa4, 0xa4], attrs),
                (false, 0x60, vec![0xa5, 0xa5], attrs),
            ]
        );
    }

    #[test]
    fn test_mmio_and_eoi() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        let mut vcpu = f.manager.create_vcpu(0).unwrap();
        let mock = f.state.vcpu(0);
        let smm = RunState {
            smm: true,
            ..Default::default()
        };
        mock.push_exit(
            RunPageBuilder::new()
                .mmio(0xfed0_0000, &[0xaa, 0xbb, 0xcc, 0xdd], 4, true)
                .state(smm)
                .build(),
        );
        mock.push_exit(RunPageBuilder::new().ioapic_eoi(0x31).build());
        mock.push_exit(RunPageBuilder::new().exit(EXIT_IRQ_WINDOW_OPEN).build());
        mock.push_exit(RunPageBuilder::new().exit(EXIT_INTR).build());

        for _ in 0..4 {
            assert_eq!(vcpu.run_once().unwrap(), ExitAction::Continue);
        }
        let accesses = f.ops.accesses.lock().unwrap();
        assert_eq!(accesses.len(), 1);
        assert_eq!(accesses[0].1, 0xfed0_0000);
        assert_eq!(accesses[0].2, vec![0xaa, 0xbb, 0xcc, 0xdd]);
        assert!(accesses[0].3.smm);
        assert_eq!(*f.ops.eois.lock().unwrap(), vec![0x31]);
    }

    #[test]
    fn test_lifecycle_exits() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        let mut vcpu = f.manager.create_vcpu(0).unwrap();
        let mock = f.state.vcpu(0);
        mock.push_exit(RunPageBuilder::new().exit(EXIT_SHUTDOWN).build());
        mock.push_exit(
            RunPageBuilder::new()
                .system_event(SYSTEM_EVENT_RESET, 0)
                .build(),
        );
        mock.push_exit(
            RunPageBuilder::new()
                .system_event(SYSTEM_EVENT_CRASH, 0)
                .build(),
        );
        mock.push_exit(RunPageBuilder::new().fail_entry(0x21, 3).build());
        mock.push_exit(RunPageBuilder::new().unknown(0x99).build());

        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Reset);
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Reset);
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Shutdown);
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Fatal);
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Fatal);
        // An empty script ends with a shutdown event.
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Shutdown);

        let panics = f.ops.panics.lock().unwrap();
        assert_eq!(panics.len(), 1);
        assert!(panics[0].contains("\"rip\":65520"));
    }

    #[test]
    fn test_emulation_error_policy() {
        let _guard = session_guard();
        let exit = || {
            RunPageBuilder::new()
                .internal_error(INTERNAL_ERROR_EMULATION, &[1, 2])
                .build()
        };

        let f = fixture(AccelConfig::default());
        let mut vcpu = f.manager.create_vcpu(0).unwrap();
        let mock = f.state.vcpu(0);
        mock.sregs.lock().unwrap().cr0 |= CR0_PE;
        mock.sregs.lock().unwrap().cs.dpl = 3;
        mock.push_exit(exit());
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Fatal);
        drop(vcpu);
        drop(f);

        let f = fixture(AccelConfig {
            emulation_error: EmulationErrorPolicy::Permissive,
            ..Default::default()
        });
        let mut vcpu = f.manager.create_vcpu(0).unwrap();
        let mock = f.state.vcpu(0);
        // Real mode: still fatal.
        mock.push_exit(exit());
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Fatal);

        mock.sregs.lock().unwrap().cr0 |= CR0_PE;
        mock.sregs.lock().unwrap().cs.dpl = 3;
        mock.push_exit(exit());
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Interrupted);
    }

    #[test]
    fn test_halt_without_kernel_irqchip() {
        let _guard = session_guard();
        let f = fixture(userspace_irqchip());
        let mut vcpu = f.manager.create_vcpu(0).unwrap();
        let mock = f.state.vcpu(0);
        mock.push_exit(RunPageBuilder::new().exit(EXIT_HLT).build());

        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Halted);
        assert!(vcpu.is_halted());
        let runs = mock.runs();
        // No event: stays halted without entering the guest.
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Halted);
        assert_eq!(mock.runs(), runs);

        // NMI wakes it and is injected before entry. The kick that came
        // with it makes that entry return at once.
        vcpu.control().raise(AsyncEvents::NMI);
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Interrupted);
        assert!(!vcpu.is_halted());
        assert_eq!(*mock.nmis.lock().unwrap(), 1);

        mock.push_exit(RunPageBuilder::new().exit(EXIT_INTR).build());
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Continue);
        assert_eq!(mock.runs(), runs + 1);
    }

    #[test]
    fn test_userspace_pic_injection() {
        let _guard = session_guard();
        let f = fixture(userspace_irqchip());
        let mut vcpu = f.manager.create_vcpu(0).unwrap();
        let mock = f.state.vcpu(0);
        let ready = RunState {
            ready_for_interrupt_injection: true,
            if_flag: true,
            ..Default::default()
        };
        mock.push_exit(RunPageBuilder::new().exit(EXIT_INTR).state(ready).build());
        mock.push_exit(RunPageBuilder::new().exit(EXIT_INTR).state(ready).build());
        mock.push_exit(RunPageBuilder::new().exit(EXIT_INTR).state(ready).build());

        // Not ready before the first exit: only the window is requested.
        *f.ops.pic_vector.lock().unwrap() = Some(0x20);
        vcpu.control().raise(AsyncEvents::HARD);
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Interrupted);
        assert!(mock.inputs.lock().unwrap().request_interrupt_window);
        assert_eq!(mock.inputs.lock().unwrap().cr8, 3);
        assert!(mock.injected.lock().unwrap().is_empty());

        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Continue);
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Continue);
        assert_eq!(*mock.injected.lock().unwrap(), vec![0x20]);
        assert!(!mock.inputs.lock().unwrap().request_interrupt_window);
    }

    #[test]
    fn test_tpr_access_reported() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        let mut vcpu = f.manager.create_vcpu(0).unwrap();
        f.state
            .vcpu(0)
            .push_exit(RunPageBuilder::new().tpr_access(0xc000_1000, true).build());
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Continue);
        assert_eq!(*f.ops.tpr.lock().unwrap(), vec![(0, 0xc000_1000, true)]);
    }

    #[test]
    fn test_init_and_sipi() {
        let _guard = session_guard();
        let f = fixture(userspace_irqchip());
        let mut vcpu = f.manager.create_vcpu(1).unwrap();
        let mock = f.state.vcpu(1);
        assert!(vcpu.is_halted());

        mock.regs.lock().unwrap().rip = 0x1234;
        vcpu.control().raise(AsyncEvents::INIT);
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Halted);
        assert_eq!(vcpu.snapshot().regs().rip, 0xfff0);

        vcpu.control().raise_sipi(0x10);
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Interrupted);
        assert!(!vcpu.is_halted());
        assert_eq!(mock.sregs.lock().unwrap().cs.base, 0x1_0000);
        assert_eq!(mock.regs.lock().unwrap().rip, 0);
    }

    #[test]
    fn test_machine_check() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        let mut vcpu = f.manager.create_vcpu(0).unwrap();
        let mock = f.state.vcpu(0);

        vcpu.control().raise(AsyncEvents::MCE);
        mock.push_exit(RunPageBuilder::new().exit(EXIT_INTR).build());
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Interrupted);
        let events = *mock.events.lock().unwrap();
        assert_eq!(events.exception.injected, 1);
        assert_eq!(events.exception.nr, Exception::MC as u8);

        mock.events.lock().unwrap().exception.nr = Exception::DF as u8;
        vcpu.control().raise(AsyncEvents::MCE);
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Reset);
    }

    #[test]
    fn test_guest_debug_exit_reinjected() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        let mut vcpu = f.manager.create_vcpu(0).unwrap();
        let mock = f.state.vcpu(0);
        mock.push_exit(
            RunPageBuilder::new()
                .debug(Exception::DB as u32, 0x1000, 0x4001, 0)
                .build(),
        );
        mock.push_exit(RunPageBuilder::new().exit(EXIT_INTR).build());

        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Continue);
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Continue);
        let events = *mock.events.lock().unwrap();
        assert_eq!(events.exception.injected, 1);
        assert_eq!(events.exception.nr, 1);
        assert_eq!(mock.debug_regs.lock().unwrap().dr6, 0x4001);
    }

    #[test]
    fn test_single_step_stop() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        let mut vcpu = f.manager.create_vcpu(0).unwrap();
        let mock = f.state.vcpu(0);

        vcpu.control().request(VcpuRequest::SetSingleStep(true));
        mock.push_exit(
            RunPageBuilder::new()
                .debug(Exception::DB as u32, 0x1000, 0x4000, 0)
                .build(),
        );
        assert_eq!(
            vcpu.run_once().unwrap(),
            ExitAction::Debug(DebugStop::SingleStep)
        );
        assert_eq!(
            mock.last_guest_debug().unwrap().control,
            GUEST_DEBUG_ENABLE | GUEST_DEBUG_SINGLESTEP
        );
    }

    #[test]
    fn test_kick_sets_immediate_exit() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        let mut vcpu = f.manager.create_vcpu(0).unwrap();
        let mock = f.state.vcpu(0);
        mock.push_exit(RunPageBuilder::new().exit(EXIT_INTR).build());

        vcpu.control().kick();
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Interrupted);
        assert_eq!(mock.pending_exits(), 1);
        assert!(!mock.inputs.lock().unwrap().immediate_exit);
        assert_eq!(vcpu.run_once().unwrap(), ExitAction::Continue);
    }

    #[test]
    fn test_requests_need_started_vcpu() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        let _vcpu = f.manager.create_vcpu(0).unwrap();

        assert!(matches!(
            f.manager.translate_gva(0x100),
            Err(Error::VcpuNotStarted(0))
        ));
        assert!(matches!(
            f.manager.insert_sw_breakpoint(0x100),
            Err(Error::VcpuNotStarted(0))
        ));
        assert!(matches!(
            f.manager.with_vcpu(1, |_| ()),
            Err(Error::VcpuNotFound(1))
        ));
    }

    #[test]
    fn test_threads_run_to_shutdown() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        let vcpus = vec![
            f.manager.create_vcpu(0).unwrap(),
            f.manager.create_vcpu(1).unwrap(),
        ];
        f.state
            .vcpu(0)
            .push_exit(RunPageBuilder::new().io(true, 0x80, 1, 1, &[0x42]).build());

        f.manager.start(vcpus).unwrap();
        while f
            .manager
            .controls()
            .all()
            .iter()
            .any(|c| !c.exited.load(Ordering::SeqCst))
        {
            thread::sleep(Duration::from_millis(1));
        }
        f.manager.shutdown().unwrap();
        assert_eq!(f.ops.shutdowns.load(Ordering::SeqCst), 2);
        assert_eq!(f.ops.accesses.lock().unwrap()[0].2, vec![0x42]);
        assert!(matches!(f.manager.kick(7), Err(Error::VcpuNotFound(7))));
    }

    #[test]
    fn test_pause_resume_and_proxies() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        let vcpu = f.manager.create_vcpu(0).unwrap();
        let mock = f.state.vcpu(0);
        // The vCPU parks on the halt until paused.
        mock.push_exit(RunPageBuilder::new().exit(EXIT_HLT).build());
        f.manager.start(vec![vcpu]).unwrap();

        assert!(matches!(f.manager.ioapic_pre_save(), Err(Error::NotPaused)));
        f.manager.pause();
        while !f.manager.is_paused() {
            thread::sleep(Duration::from_millis(1));
        }

        let pic = f.manager.pic_pre_save(true).unwrap();
        f.manager.pic_post_load(true, &pic).unwrap();
        let ioapic = f.manager.ioapic_pre_save().unwrap();
        f.manager.ioapic_post_load(&ioapic).unwrap();
        let mut apic = f.manager.apic_pre_save(0).unwrap();
        apic.tpr = 0x20;
        f.manager.apic_post_load(0, &apic).unwrap();
        assert_eq!(mock.lapic.lock().unwrap().get_reg(0x80), 0x20);

        f.manager.insert_sw_breakpoint(0x100).unwrap();
        f.manager
            .insert_hw_breakpoint(0x2000, 4, BreakpointKind::Write)
            .unwrap();
        // Requests are served while paused.
        let debug = f.manager.with_vcpu(0, |_| ()).map(|_| mock.last_guest_debug());
        assert!(debug.unwrap().unwrap().control & GUEST_DEBUG_ENABLE != 0);
        f.manager.remove_all_breakpoints().unwrap();

        f.manager.resume();
        f.manager.shutdown().unwrap();
        assert!(matches!(f.manager.with_vcpu(0, |_| ()), Err(Error::VcpuGone(0))));
    }

    #[test]
    fn test_debug_stop_pauses_vm() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        let vcpu = f.manager.create_vcpu(0).unwrap();
        f.manager
            .insert_hw_breakpoint(0x1000, 1, BreakpointKind::Execute)
            .unwrap();
        let mock = f.state.vcpu(0);
        mock.push_exit(
            RunPageBuilder::new()
                .debug(Exception::DB as u32, 0x1000, 0x1, 0x602)
                .build(),
        );
        let events = f.manager.debug_events();
        f.manager.start(vec![vcpu]).unwrap();

        let event = events.recv().unwrap();
        assert_eq!(
            event,
            DebugEvent {
                vcpu_id: 0,
                stop: DebugStop::HwBreakpoint { addr: 0x1000 }
            }
        );
        while !f.manager.is_paused() {
            thread::sleep(Duration::from_millis(1));
        }
        f.manager.shutdown().unwrap();
    }

    #[test]
    fn test_kernel_irqchips() {
        let _guard = session_guard();
        let f = fixture(AccelConfig::default());
        assert_eq!(f.manager.kernel_irqchips().len(), 3);
        drop(f);
        let f = fixture(userspace_irqchip());
        assert!(f.manager.kernel_irqchips().is_empty());
    }
}
