//! The GPU device: interrupt threads, the device thread, and client entry
//! points.
//!
//! TEAM_529: Three interrupt threads (job, MMU, GPU) latch and clear their
//! IRQ status and post it to the device thread. The device thread owns the
//! scheduler and every hardware-mutating decision. Client threads talk to it
//! through [`DeviceRequest`]s and wait on replies where they need an answer.
//!
//! State split:
//! - [`DeviceShared`] is shared with connections (it is their owner): the
//!   register window, bus services, the address manager and the request
//!   sender.
//! - [`DeviceCore`] is confined to the device thread: the scheduler plus
//!   [`DeviceHardware`], which carries out the scheduler's decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::{debug, error, info, trace, warn};
use mali_error::define_kernel_error;
use mali_hal::regs::{
    AS_PRESENT, AddressSpaceRegisters, CYCLE_COUNT_LO, GPU_COMMAND, GPU_FAULTADDRESS_LO,
    GPU_FAULTSTATUS, GPU_ID, GPU_IRQ_CLEAR, GPU_IRQ_MASK, GPU_IRQ_RAWSTAT, GPU_IRQ_STATUS,
    GpuCommand, GpuIrq, JOB_IRQ_CLEAR, JOB_IRQ_MASK, JOB_IRQ_STATUS, JS_PRESENT, JobSlotCommand,
    JobSlotConfig, JobSlotRegisters, MMU_IRQ_CLEAR, MMU_IRQ_MASK, MMU_IRQ_STATUS, TIMESTAMP_LO,
    job_irq_done, job_irq_failed,
};
use mali_hal::{BusMapper, InterruptSource, PageAllocator, RegisterIo, RegisterIoExt};
use mali_utils::HashSet;
use parking_lot::Mutex;

use crate::address_manager::AddressManager;
use crate::address_space::{AddressSpaceObserver, AddressSpaceOwner, MmuError};
use crate::atom::{Atom, AtomFlags, ResultCode};
use crate::config::DriverConfig;
use crate::connection::{Connection, ConnectionOwner, Notification};
use crate::device_request::{DeviceRequest, DeviceTask, GpuTimestamp, Reply};
use crate::job_scheduler::{JobScheduler, JobSchedulerOwner, SchedulerConfig};
use crate::logger;
use crate::performance_counters::{PerfCounterError, PerformanceCounters, SampleCompletion};
use crate::semaphore::Semaphore;

define_kernel_error! {
    /// TEAM_529: Device errors.
    pub enum DeviceError(0x06, "device") {
        /// RESET_COMPLETED never arrived
        ResetTimeout = 0x01 => "GPU reset timed out",
        /// Could not start a driver thread
        ThreadSpawn = 0x02 => "Failed to spawn driver thread",
        /// The device thread has exited
        DeviceGone = 0x03 => "Device thread not running",
        AddressSpace(MmuError) = 0x04 => "Address space creation failed",
        PerfCounter(PerfCounterError) = 0x05 => "Performance counter request failed",
    }
}

impl From<MmuError> for DeviceError {
    fn from(e: MmuError) -> Self {
        DeviceError::AddressSpace(e)
    }
}

impl From<PerfCounterError> for DeviceError {
    fn from(e: PerfCounterError) -> Self {
        DeviceError::PerfCounter(e)
    }
}

/// Polls of `GPU_IRQ_RAWSTAT` before a reset command is given up on.
const RESET_POLL_LIMIT: u32 = 100_000;
/// Hardware supports at most 16 address and job slots.
const MAX_SLOTS: u32 = 16;

/// Platform services a device is built on.
#[derive(Clone)]
pub struct DevicePlatform {
    pub registers: Arc<dyn RegisterIo>,
    pub bus_mapper: Arc<dyn BusMapper>,
    pub page_allocator: Arc<dyn PageAllocator>,
    pub job_interrupt: Arc<dyn InterruptSource>,
    pub mmu_interrupt: Arc<dyn InterruptSource>,
    pub gpu_interrupt: Arc<dyn InterruptSource>,
}

// ============================================================================
// Shared state
// ============================================================================

/// Device state reachable from any thread.
pub struct DeviceShared {
    config: DriverConfig,
    gpu_id: u32,
    job_slot_count: u32,
    registers: Arc<dyn RegisterIo>,
    bus_mapper: Arc<dyn BusMapper>,
    page_allocator: Arc<dyn PageAllocator>,
    address_manager: Arc<AddressManager>,
    requests: Sender<DeviceRequest>,
    connections: Mutex<Vec<Weak<Connection>>>,
}

impl DeviceShared {
    pub fn address_manager(&self) -> &Arc<AddressManager> {
        &self.address_manager
    }

    fn post(&self, request: DeviceRequest) -> Result<(), DeviceError> {
        self.requests.send(request).map_err(|_| DeviceError::DeviceGone)
    }

    fn live_connections(&self) -> Vec<Arc<Connection>> {
        let mut connections = self.connections.lock();
        connections.retain(|c| c.strong_count() > 0);
        connections.iter().filter_map(Weak::upgrade).collect()
    }
}

impl AddressSpaceOwner for DeviceShared {
    fn address_space_observer(&self) -> Arc<dyn AddressSpaceObserver> {
        self.address_manager.clone()
    }

    fn page_allocator(&self) -> Arc<dyn PageAllocator> {
        self.page_allocator.clone()
    }
}

impl ConnectionOwner for DeviceShared {
    fn bus_mapper(&self) -> Arc<dyn BusMapper> {
        self.bus_mapper.clone()
    }

    fn job_slot_count(&self) -> u32 {
        self.job_slot_count
    }

    fn schedule_atom(&self, atom: Arc<Atom>) {
        if self.post(DeviceRequest::ScheduleAtom(atom)).is_err() {
            warn!("device: atom submitted after shutdown");
        }
    }

    fn cancel_atoms(&self, connection: &Arc<Connection>) {
        let client_id = connection.client_id();
        if self.post(DeviceRequest::CancelAtoms { client_id }).is_err() {
            debug!("device: cancel for client {client_id} after shutdown");
        }
    }
}

// ============================================================================
// Device thread state
// ============================================================================

/// Executes scheduler decisions against the registers.
pub struct DeviceHardware {
    shared: Arc<DeviceShared>,
    protected_mode: bool,
    /// Atoms holding the cycle counter running.
    cycle_counter_users: HashSet<u64>,
    perf_counters: PerformanceCounters,
}

impl DeviceHardware {
    fn io(&self) -> &dyn RegisterIo {
        &*self.shared.registers
    }

    /// Soft reset, falling back to a hard reset, then restore IRQ masks.
    fn reset_gpu(&mut self) -> Result<(), DeviceError> {
        let io = self.shared.registers.clone();
        io.write32(GPU_IRQ_CLEAR, GpuIrq::RESET_COMPLETED.bits());
        for command in [GpuCommand::SoftReset, GpuCommand::HardReset] {
            io.write32(GPU_COMMAND, command as u32);
            let completed = (0..RESET_POLL_LIMIT)
                .any(|_| io.read32(GPU_IRQ_RAWSTAT) & GpuIrq::RESET_COMPLETED.bits() != 0);
            if completed {
                io.write32(GPU_IRQ_CLEAR, GpuIrq::RESET_COMPLETED.bits());
                self.enable_interrupts();
                self.protected_mode = false;
                self.cycle_counter_users.clear();
                debug!("device: {command:?} completed");
                return Ok(());
            }
            warn!("device: {command:?} did not complete");
        }
        error!("device: GPU did not come out of reset");
        Err(DeviceError::ResetTimeout)
    }

    fn enable_interrupts(&self) {
        let io = self.io();
        io.write32(
            GPU_IRQ_MASK,
            (GpuIrq::GPU_FAULT | GpuIrq::MULTIPLE_GPU_FAULTS | GpuIrq::PRFCNT_SAMPLE_COMPLETED)
                .bits(),
        );
        io.write32(JOB_IRQ_MASK, u32::MAX);
        io.write32(MMU_IRQ_MASK, u32::MAX);
    }

    fn query_timestamp(&self) -> GpuTimestamp {
        let host_before = Instant::now();
        let gpu_cycle_count = self.io().read64(CYCLE_COUNT_LO);
        let gpu_timestamp = self.io().read64(TIMESTAMP_LO);
        GpuTimestamp {
            host_before,
            gpu_cycle_count,
            gpu_timestamp,
            host_after: Instant::now(),
        }
    }

    fn report_sample(completion: SampleCompletion) {
        if let Some(connection) = completion.connection.upgrade() {
            connection.send_notification(Notification::PerformanceCounterReadCompleted {
                trigger_id: completion.trigger_id,
                result: completion.result,
            });
        }
    }

    fn release_cycle_counter(&mut self, atom: &Atom) {
        if self.cycle_counter_users.remove(&atom.trace_id()) && self.cycle_counter_users.is_empty()
        {
            self.io()
                .write32(GPU_COMMAND, GpuCommand::CycleCountStop as u32);
        }
    }
}

impl JobSchedulerOwner for DeviceHardware {
    fn run_atom(&mut self, atom: &Arc<Atom>) {
        let Some(address_slot) = atom.address_slot_number() else {
            error!("device: atom {} started without an address slot", atom.trace_id());
            return;
        };
        if atom.flags().contains(AtomFlags::REQUIRE_CYCLE_COUNTER)
            && self.cycle_counter_users.insert(atom.trace_id())
            && self.cycle_counter_users.len() == 1
        {
            self.io()
                .write32(GPU_COMMAND, GpuCommand::CycleCountStart as u32);
        }

        let regs = JobSlotRegisters::new(atom.slot());
        let head = atom.resume_address().unwrap_or(atom.gpu_address());
        let config = JobSlotConfig::START_FLUSH_CLEAN
            | JobSlotConfig::START_FLUSH_INV
            | JobSlotConfig::END_FLUSH_CLEAN
            | JobSlotConfig::END_FLUSH_INV;
        let io = self.io();
        io.write64(regs.head_next(), head);
        io.write64(regs.affinity_next(), u64::from(u32::MAX));
        io.write32(regs.config_next(), config.bits() | address_slot);
        io.write32(regs.command_next(), JobSlotCommand::Start as u32);
        trace!(
            "device: slot {} started atom {} at {head:#x} in AS {address_slot}",
            atom.slot(),
            atom.trace_id()
        );
    }

    fn atom_completed(&mut self, atom: &Arc<Atom>, result: ResultCode) {
        self.release_cycle_counter(atom);
        match atom.connection().upgrade() {
            Some(connection) => connection.send_atom_completion(atom, result),
            None => trace!("device: atom {} outlived its connection", atom.trace_id()),
        }
    }

    fn soft_stop_atom(&mut self, atom: &Arc<Atom>) {
        let regs = JobSlotRegisters::new(atom.slot());
        self.io()
            .write32(regs.command(), JobSlotCommand::SoftStop as u32);
    }

    fn hard_stop_atom(&mut self, atom: &Arc<Atom>) {
        let regs = JobSlotRegisters::new(atom.slot());
        self.io()
            .write32(regs.command(), JobSlotCommand::HardStop as u32);
    }

    fn assign_address_space(&mut self, atom: &Arc<Atom>) -> bool {
        self.shared.address_manager.assign_address_space(atom)
    }

    fn release_mappings_for_atom(&mut self, atom: &Arc<Atom>) {
        self.shared.address_manager.atom_finished(atom);
    }

    fn allocate_jit_memory(&mut self, atom: &Arc<Atom>) -> Option<ResultCode> {
        match atom.connection().upgrade() {
            Some(connection) => connection.process_jit_allocate(atom),
            None => Some(ResultCode::Cancelled),
        }
    }

    fn release_jit_memory(&mut self, atom: &Arc<Atom>) -> ResultCode {
        match atom.connection().upgrade() {
            Some(connection) => connection.process_jit_free(atom),
            None => ResultCode::Cancelled,
        }
    }

    fn wait_for_semaphore(&mut self, atom: &Arc<Atom>, semaphore: &Arc<Semaphore>) {
        trace!(
            "device: atom {} waits on semaphore {}",
            atom.trace_id(),
            semaphore.id()
        );
        let requests = self.shared.requests.clone();
        semaphore.wait_async(move || {
            let _ = requests.send(DeviceRequest::SemaphoreSignaled);
        });
    }

    fn output_hang_message(&mut self, reason: &str, status: &[String]) {
        error!("device: hang detected: {reason}");
        error!("device: gpu id {:#x}", self.shared.gpu_id);
        for line in status {
            error!("  {line}");
        }
        for line in self.shared.address_manager.dump() {
            error!("  {line}");
        }
        for connection in self.shared.live_connections() {
            for line in connection.dump() {
                error!("  {line}");
            }
        }
    }

    fn enter_protected_mode(&mut self) {
        self.io()
            .write32(GPU_COMMAND, GpuCommand::SetProtectedMode as u32);
        self.protected_mode = true;
    }

    fn exit_protected_mode(&mut self) {
        // Only a reset takes the GPU out of protected mode. Slot and counter
        // programming does not survive it.
        self.shared.address_manager.clear_address_mappings(true);
        if let Err(e) = self.reset_gpu() {
            error!("device: leaving protected mode failed: {e}");
        }
        let io = &*self.shared.registers;
        if let Some(aborted) = self.perf_counters.reset(io) {
            Self::report_sample(aborted);
        }
        self.protected_mode = false;
    }

    fn is_in_protected_mode(&self) -> bool {
        self.protected_mode
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Everything the device thread owns.
pub struct DeviceCore {
    scheduler: JobScheduler,
    hw: DeviceHardware,
}

impl DeviceCore {
    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn is_in_protected_mode(&self) -> bool {
        self.hw.protected_mode
    }

    /// Returns false once the thread should exit.
    fn process_request(&mut self, request: DeviceRequest) -> bool {
        trace!("device: {request:?}");
        match request {
            DeviceRequest::ScheduleAtom(atom) => {
                self.scheduler.enqueue_atom(atom);
                self.scheduler.try_to_schedule(&mut self.hw);
            }
            DeviceRequest::CancelAtoms { client_id } => {
                self.scheduler
                    .cancel_atoms_for_connection(&mut self.hw, client_id);
            }
            DeviceRequest::JobInterrupt { status } => self.process_job_interrupt(status),
            DeviceRequest::MmuInterrupt { status } => self.process_mmu_interrupt(status),
            DeviceRequest::GpuInterrupt { status } => self.process_gpu_interrupt(status),
            DeviceRequest::SemaphoreSignaled => self.scheduler.try_to_schedule(&mut self.hw),
            DeviceRequest::Task(task, reply) => reply.send(task(self)),
            DeviceRequest::DumpStatus(reply) => reply.send(self.dump()),
            DeviceRequest::QueryTimestamp(reply) => reply.send(self.hw.query_timestamp()),
            DeviceRequest::Shutdown => return false,
        }
        true
    }

    fn process_job_interrupt(&mut self, status: u32) {
        for slot in 0..self.scheduler.job_slot_count() {
            let failed = status & job_irq_failed(slot) != 0;
            if !failed && status & job_irq_done(slot) == 0 {
                continue;
            }
            let regs = JobSlotRegisters::new(slot);
            let io = &*self.hw.shared.registers;
            let result = if failed {
                ResultCode::from_job_status(io.read32(regs.status()))
            } else {
                ResultCode::Success
            };
            let tail = io.read64(regs.tail());
            self.scheduler
                .job_completed(&mut self.hw, slot, result, tail);
        }
    }

    fn process_mmu_interrupt(&mut self, status: u32) {
        for slot in 0..self.hw.shared.address_manager.slot_count() {
            let page_fault = status & (1 << slot) != 0;
            let bus_fault = status & (1 << (slot + 16)) != 0;
            if !page_fault && !bus_fault {
                continue;
            }
            let regs = AddressSpaceRegisters::new(slot);
            let io = &*self.hw.shared.registers;
            let fault_status = io.read32(regs.fault_status());
            let fault_address = io.read64(regs.fault_address());
            let kind = if bus_fault { "bus" } else { "page" };

            let Some(connection) = self.hw.shared.address_manager.connection_in_slot(slot) else {
                warn!("mmu: {kind} fault on unused AS {slot} at {fault_address:#x}");
                continue;
            };
            error!(
                "mmu: {kind} fault on AS {slot} client {} status {fault_status:#x}: {}",
                connection.client_id(),
                connection.describe_fault_address(fault_address)
            );
            connection.mark_context_lost();
            self.scheduler
                .cancel_atoms_for_connection(&mut self.hw, connection.client_id());
            self.hw
                .shared
                .address_manager
                .unlock_address_space(connection.address_space_id());
        }
    }

    fn process_gpu_interrupt(&mut self, status: u32) {
        let irq = GpuIrq::from_bits_truncate(status);
        if irq.contains(GpuIrq::PRFCNT_SAMPLE_COMPLETED) {
            if let Some(completion) = self.hw.perf_counters.sample_completed() {
                DeviceHardware::report_sample(completion);
            }
        }
        if irq.intersects(GpuIrq::GPU_FAULT | GpuIrq::MULTIPLE_GPU_FAULTS) {
            let io = &*self.hw.shared.registers;
            error!(
                "device: GPU fault status {:#x} at {:#x}",
                io.read32(GPU_FAULTSTATUS),
                io.read64(GPU_FAULTADDRESS_LO)
            );
            self.reset_device("GPU fault");
        }
    }

    /// Recover from a fault: drop every address slot, reset the GPU, fail
    /// in-flight atoms and carry on with the rest of the queue.
    pub fn reset_device(&mut self, reason: &str) {
        warn!("device: resetting GPU: {reason}");
        self.hw.shared.address_manager.clear_address_mappings(true);
        self.scheduler.kill_executing_atoms(&mut self.hw);
        if let Err(e) = self.hw.reset_gpu() {
            error!("device: reset failed: {e}");
        }
        let io = &*self.hw.shared.registers;
        if let Some(aborted) = self.hw.perf_counters.reset(io) {
            DeviceHardware::report_sample(aborted);
        }
        self.scheduler.try_to_schedule(&mut self.hw);
    }

    pub fn enable_performance_counters(
        &mut self,
        connection: &Arc<Connection>,
        dump_address: u64,
    ) -> Result<(), DeviceError> {
        let shared = &self.hw.shared;
        self.hw.perf_counters.enable(
            &*shared.registers,
            &shared.address_manager,
            connection,
            dump_address,
        )?;
        Ok(())
    }

    pub fn trigger_performance_counters(&mut self, trigger_id: u64) -> Result<(), DeviceError> {
        let io = &*self.hw.shared.registers;
        self.hw.perf_counters.trigger(io, trigger_id)?;
        Ok(())
    }

    pub fn disable_performance_counters(&mut self) {
        let io = &*self.hw.shared.registers;
        if let Some(aborted) = self.hw.perf_counters.disable(io) {
            DeviceHardware::report_sample(aborted);
        }
    }

    pub fn dump(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "gpu id {:#x} protected {}",
            self.hw.shared.gpu_id, self.hw.protected_mode
        )];
        lines.extend(self.scheduler.dump());
        lines.extend(self.hw.shared.address_manager.dump());
        for connection in self.hw.shared.live_connections() {
            lines.extend(connection.dump());
            for removed in connection.recently_removed_mappings() {
                lines.push(format!(
                    "  removed {:#x}+{:#x} buffer {}",
                    removed.gpu_va, removed.size, removed.buffer_id
                ));
            }
        }
        lines
    }

    fn run(mut self, requests: Receiver<DeviceRequest>) {
        info!("device: thread started");
        loop {
            let received = match self.scheduler.get_current_timeout_duration(Instant::now()) {
                Some(timeout) => requests.recv_timeout(timeout),
                None => requests.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(request) => {
                    if !self.process_request(request) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.scheduler.handle_timed_out_atoms(&mut self.hw) {
                self.reset_device("hard-stop was never acknowledged");
            }
        }
        self.disable_performance_counters();
        info!("device: thread exiting");
    }
}

// ============================================================================
// Interrupt threads
// ============================================================================

struct InterruptLine {
    name: &'static str,
    source: Arc<dyn InterruptSource>,
    status: u32,
    clear: u32,
    request: fn(u32) -> DeviceRequest,
}

fn interrupt_loop(line: &InterruptLine, io: &dyn RegisterIo, requests: &Sender<DeviceRequest>) {
    debug!("device: {} interrupt thread started", line.name);
    while line.source.wait().is_ok() {
        let status = io.read32(line.status);
        if status != 0 {
            io.write32(line.clear, status);
            if requests.send((line.request)(status)).is_err() {
                break;
            }
        }
        line.source.complete();
    }
    debug!("device: {} interrupt thread exiting", line.name);
}

// ============================================================================
// Device
// ============================================================================

pub struct Device {
    shared: Arc<DeviceShared>,
    interrupts: Vec<Arc<dyn InterruptSource>>,
    device_thread: Mutex<Option<JoinHandle<()>>>,
    interrupt_threads: Mutex<Vec<JoinHandle<()>>>,
    next_client_id: AtomicU64,
}

/// Slots the hardware reports present, or the configured count when the
/// register reads as zero.
fn present_count(mask: u32, fallback: u32) -> u32 {
    let count = match mask.count_ones() {
        0 => fallback,
        present => present,
    };
    count.min(MAX_SLOTS)
}

impl Device {
    /// Reset the GPU and start the device and interrupt threads.
    pub fn create(platform: DevicePlatform, config: DriverConfig) -> Result<Arc<Self>, DeviceError> {
        if logger::init(config.log_level).is_err() {
            debug!("device: keeping the logger already installed");
        }
        let io = platform.registers.clone();
        let gpu_id = io.read32(GPU_ID);
        let address_slot_count = present_count(io.read32(AS_PRESENT), config.address_slot_count);
        let job_slot_count = present_count(io.read32(JS_PRESENT), config.job_slot_count);
        info!(
            "device: gpu id {gpu_id:#x}, {address_slot_count} address slots, {job_slot_count} job slots"
        );

        let (sender, receiver) = unbounded();
        let shared = Arc::new(DeviceShared {
            address_manager: AddressManager::new(
                io.clone(),
                address_slot_count,
                config.acquire_slot_timeout,
            ),
            gpu_id,
            job_slot_count,
            registers: io.clone(),
            bus_mapper: platform.bus_mapper.clone(),
            page_allocator: platform.page_allocator.clone(),
            requests: sender.clone(),
            connections: Mutex::new(Vec::new()),
            config,
        });

        let mut core = DeviceCore {
            scheduler: JobScheduler::new(job_slot_count, SchedulerConfig::from(&shared.config)),
            hw: DeviceHardware {
                shared: shared.clone(),
                protected_mode: false,
                cycle_counter_users: HashSet::new(),
                perf_counters: PerformanceCounters::new(),
            },
        };
        core.hw.reset_gpu()?;

        let device_thread = thread::Builder::new()
            .name("mali-device".into())
            .spawn(move || core.run(receiver))
            .map_err(|_| DeviceError::ThreadSpawn)?;

        let device = Arc::new(Self {
            shared,
            interrupts: vec![
                platform.job_interrupt.clone(),
                platform.mmu_interrupt.clone(),
                platform.gpu_interrupt.clone(),
            ],
            device_thread: Mutex::new(Some(device_thread)),
            interrupt_threads: Mutex::new(Vec::new()),
            next_client_id: AtomicU64::new(1),
        });

        let lines = [
            InterruptLine {
                name: "job",
                source: platform.job_interrupt,
                status: JOB_IRQ_STATUS,
                clear: JOB_IRQ_CLEAR,
                request: |status| DeviceRequest::JobInterrupt { status },
            },
            InterruptLine {
                name: "mmu",
                source: platform.mmu_interrupt,
                status: MMU_IRQ_STATUS,
                clear: MMU_IRQ_CLEAR,
                request: |status| DeviceRequest::MmuInterrupt { status },
            },
            InterruptLine {
                name: "gpu",
                source: platform.gpu_interrupt,
                status: GPU_IRQ_STATUS,
                clear: GPU_IRQ_CLEAR,
                request: |status| DeviceRequest::GpuInterrupt { status },
            },
        ];
        for line in lines {
            let io = io.clone();
            let requests = sender.clone();
            let handle = thread::Builder::new()
                .name(format!("mali-{}-irq", line.name))
                .spawn(move || interrupt_loop(&line, &*io, &requests));
            match handle {
                Ok(handle) => device.interrupt_threads.lock().push(handle),
                Err(_) => {
                    device.shutdown();
                    return Err(DeviceError::ThreadSpawn);
                }
            }
        }
        Ok(device)
    }

    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    pub fn gpu_id(&self) -> u32 {
        self.shared.gpu_id
    }

    pub fn address_manager(&self) -> &Arc<AddressManager> {
        &self.shared.address_manager
    }

    /// New client connection with its own address space.
    pub fn open_connection(&self) -> Result<Arc<Connection>, DeviceError> {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::create(
            client_id,
            self.shared.clone(),
            self.shared.config.cache_coherent,
        )?;
        self.shared
            .connections
            .lock()
            .push(Arc::downgrade(&connection));
        info!("device: opened connection {client_id}");
        Ok(connection)
    }

    /// Stop notifications and cancel all outstanding work of `connection`.
    /// Its address space goes away with the last reference.
    pub fn close_connection(&self, connection: &Arc<Connection>) {
        connection.set_notification_handler(None);
        self.shared.cancel_atoms(connection);
        self.shared
            .connections
            .lock()
            .retain(|c| !std::ptr::eq(c.as_ptr(), Arc::as_ptr(connection)));
        info!("device: closed connection {}", connection.client_id());
    }

    pub fn connection_count(&self) -> usize {
        self.shared.live_connections().len()
    }

    /// Run `task` on the device thread and wait for its result.
    pub fn run_task_on_device_thread<F>(&self, task: F) -> Result<(), DeviceError>
    where
        F: FnOnce(&mut DeviceCore) -> Result<(), DeviceError> + Send + 'static,
    {
        let (reply, receiver) = Reply::pair();
        let task: DeviceTask = Box::new(task);
        self.shared.post(DeviceRequest::Task(task, reply))?;
        receiver.recv().map_err(|_| DeviceError::DeviceGone)?
    }

    pub fn dump_status(&self) -> Result<Vec<String>, DeviceError> {
        let (reply, receiver) = Reply::pair();
        self.shared.post(DeviceRequest::DumpStatus(reply))?;
        receiver.recv().map_err(|_| DeviceError::DeviceGone)
    }

    pub fn query_timestamp(&self) -> Result<GpuTimestamp, DeviceError> {
        let (reply, receiver) = Reply::pair();
        self.shared.post(DeviceRequest::QueryTimestamp(reply))?;
        receiver.recv().map_err(|_| DeviceError::DeviceGone)
    }

    pub fn enable_performance_counters(
        &self,
        connection: &Arc<Connection>,
        dump_address: u64,
    ) -> Result<(), DeviceError> {
        let connection = connection.clone();
        self.run_task_on_device_thread(move |core| {
            core.enable_performance_counters(&connection, dump_address)
        })
    }

    pub fn trigger_performance_counters(&self, trigger_id: u64) -> Result<(), DeviceError> {
        self.run_task_on_device_thread(move |core| core.trigger_performance_counters(trigger_id))
    }

    pub fn disable_performance_counters(&self) -> Result<(), DeviceError> {
        self.run_task_on_device_thread(|core| {
            core.disable_performance_counters();
            Ok(())
        })
    }

    /// Release pooled JIT memory of every connection. Returns bytes freed.
    pub fn periodic_memory_pressure_callback(&self) -> u64 {
        self.shared
            .live_connections()
            .iter()
            .map(|c| c.periodic_memory_pressure_callback())
            .sum()
    }

    /// Stop all driver threads. Safe to call more than once.
    pub fn shutdown(&self) {
        let Some(device_thread) = self.device_thread.lock().take() else {
            return;
        };
        let _ = self.shared.post(DeviceRequest::Shutdown);
        if device_thread.join().is_err() {
            error!("device: device thread panicked");
        }
        for interrupt in &self.interrupts {
            interrupt.cancel();
        }
        for handle in self.interrupt_threads.lock().drain(..) {
            if handle.join().is_err() {
                error!("device: interrupt thread panicked");
            }
        }
        info!("device: shut down");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
