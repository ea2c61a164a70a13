//! Units of GPU work.
//!
//! TEAM_522: An atom is either a hardware job chain bound to a job slot or a
//! soft atom the driver executes itself (semaphore operations, JIT memory).
//! Atoms may depend on up to two earlier atoms of the same connection. An
//! order dependency only delays execution; a data dependency also carries
//! the predecessor's failure forward as this atom's result.
//!
//! Immutable submission data lives directly in [`Atom`]. Everything the
//! scheduler updates sits behind one lock so client threads can read the
//! result while the device thread advances the atom.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::address_manager::AddressSlotMapping;
use crate::connection::Connection;
use crate::jit::JitAllocationInfo;
use crate::semaphore::Semaphore;

bitflags! {
    /// Submission flags. At most one soft operation bit may be set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct AtomFlags: u32 {
        const SEMAPHORE_SET            = 1 << 0;
        const SEMAPHORE_RESET          = 1 << 1;
        const SEMAPHORE_WAIT           = 1 << 2;
        const SEMAPHORE_WAIT_AND_RESET = 1 << 3;
        const JIT_ALLOCATE             = 1 << 4;
        const JIT_FREE                 = 1 << 5;
        /// Must run with the GPU in protected mode
        const PROTECTED                = 1 << 8;
        const REQUIRE_CYCLE_COUNTER    = 1 << 9;

        const SOFT_OPERATIONS = Self::SEMAPHORE_SET.bits()
            | Self::SEMAPHORE_RESET.bits()
            | Self::SEMAPHORE_WAIT.bits()
            | Self::SEMAPHORE_WAIT_AND_RESET.bits()
            | Self::JIT_ALLOCATE.bits()
            | Self::JIT_FREE.bits();
        const SEMAPHORE_OPERATIONS = Self::SEMAPHORE_SET.bits()
            | Self::SEMAPHORE_RESET.bits()
            | Self::SEMAPHORE_WAIT.bits()
            | Self::SEMAPHORE_WAIT_AND_RESET.bits();
    }
}

/// Atom completion status as reported to clients.
///
/// Values below `0x100` mirror the job slot status register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResultCode {
    /// Not finished yet.
    Running = 0x00,
    Success = 0x01,
    SoftStopped = 0x03,
    /// Hardware reports the job chain was hard-stopped.
    AtomTerminated = 0x04,
    ConfigFault = 0x40,
    PowerFault = 0x41,
    ReadFault = 0x42,
    WriteFault = 0x43,
    AffinityFault = 0x44,
    BusFault = 0x48,
    InstructionFault = 0x50,
    DataInvalidFault = 0x58,
    TileRangeFault = 0x59,
    OutOfMemoryFault = 0x60,
    UnknownFault = 0x7F,
    /// Killed by a device reset.
    Terminated = 0x100,
    TimedOut = 0x101,
    MemoryGrowthFailed = 0x102,
    /// The owning connection went away.
    Cancelled = 0x103,
}

impl ResultCode {
    /// Decode a job slot `STATUS` register value.
    pub fn from_job_status(status: u32) -> Self {
        match status & 0xFF {
            0x00 | 0x01 => Self::Success,
            0x03 => Self::SoftStopped,
            0x04 => Self::AtomTerminated,
            0x40 => Self::ConfigFault,
            0x41 => Self::PowerFault,
            0x42 => Self::ReadFault,
            0x43 => Self::WriteFault,
            0x44 => Self::AffinityFault,
            0x48 => Self::BusFault,
            0x50..=0x57 => Self::InstructionFault,
            0x58 => Self::DataInvalidFault,
            0x59 => Self::TileRangeFault,
            0x60..=0x6F => Self::OutOfMemoryFault,
            _ => Self::UnknownFault,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    pub fn raw(self) -> u32 {
        self as u32
    }
}

/// How an atom waits on a predecessor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyKind {
    /// Wait for completion only.
    Order,
    /// Wait for completion and inherit a failure.
    Data,
}

#[derive(Clone, Debug)]
pub struct Dependency {
    kind: DependencyKind,
    /// Dropped once the predecessor completes.
    atom: Option<Arc<Atom>>,
    saved_result: ResultCode,
}

impl Dependency {
    pub fn new(kind: DependencyKind, atom: Arc<Atom>) -> Self {
        Self {
            kind,
            atom: Some(atom),
            saved_result: ResultCode::Running,
        }
    }
}

/// Work a soft atom performs on the device thread.
#[derive(Clone, Debug)]
pub enum SoftOp {
    SemaphoreSet(Arc<Semaphore>),
    SemaphoreReset(Arc<Semaphore>),
    SemaphoreWait(Arc<Semaphore>),
    SemaphoreWaitAndReset(Arc<Semaphore>),
    JitAllocate(Vec<JitAllocationInfo>),
    JitFree(Vec<u8>),
}

#[derive(Clone, Debug)]
pub enum AtomKind {
    Hardware,
    Soft(SoftOp),
}

/// Where an atom is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtomLifecycle {
    /// Submitted, dependencies outstanding.
    Pending,
    /// Queued on a job slot.
    Runnable,
    /// On the hardware, or a soft atom waiting on its semaphore.
    Executing,
    /// Hard-stopped after a timeout. It keeps its job slot until the
    /// hardware reports the stop.
    HardStopped,
    Completed,
}

/// Submission fields of an atom.
#[derive(Clone, Copy, Debug, Default)]
pub struct AtomInfo {
    /// GPU address of the first job in the chain.
    pub gpu_address: u64,
    pub slot: u32,
    /// Client-chosen number, reused in a 256-entry ring.
    pub atom_number: u8,
    /// Opaque value echoed back in the completion notification.
    pub user_data: u64,
    pub priority: i8,
    pub flags: AtomFlags,
}

struct AtomState {
    dependencies: Vec<Dependency>,
    result: ResultCode,
    lifecycle: AtomLifecycle,
    address_slot_mapping: Option<Arc<AddressSlotMapping>>,
    execution_started: Option<Instant>,
    /// Set by the timeout path: the atom must yield (or, once hard-stopped,
    /// the hardware must acknowledge the stop) before this.
    hard_stop_deadline: Option<Instant>,
    preempted: bool,
    /// Tail pointer to resume from after a preemption soft-stop.
    resume_address: Option<u64>,
    jit_addresses: Vec<u64>,
}

pub struct Atom {
    trace_id: u64,
    connection: Weak<Connection>,
    client_id: u64,
    info: AtomInfo,
    kind: AtomKind,
    state: Mutex<AtomState>,
}

impl Atom {
    pub fn new(
        connection: Weak<Connection>,
        client_id: u64,
        info: AtomInfo,
        kind: AtomKind,
    ) -> Arc<Self> {
        static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            trace_id: NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed),
            connection,
            client_id,
            info,
            kind,
            state: Mutex::new(AtomState {
                dependencies: Vec::new(),
                result: ResultCode::Running,
                lifecycle: AtomLifecycle::Pending,
                address_slot_mapping: None,
                execution_started: None,
                hard_stop_deadline: None,
                preempted: false,
                resume_address: None,
                jit_addresses: Vec::new(),
            }),
        })
    }

    // ------------------------------------------------------------------------
    // Submission data
    // ------------------------------------------------------------------------

    /// Driver-wide unique id for log lines.
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    pub fn connection(&self) -> &Weak<Connection> {
        &self.connection
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn gpu_address(&self) -> u64 {
        self.info.gpu_address
    }

    pub fn slot(&self) -> u32 {
        self.info.slot
    }

    pub fn atom_number(&self) -> u8 {
        self.info.atom_number
    }

    pub fn user_data(&self) -> u64 {
        self.info.user_data
    }

    pub fn priority(&self) -> i8 {
        self.info.priority
    }

    pub fn flags(&self) -> AtomFlags {
        self.info.flags
    }

    pub fn kind(&self) -> &AtomKind {
        &self.kind
    }

    pub fn soft_op(&self) -> Option<&SoftOp> {
        match &self.kind {
            AtomKind::Soft(op) => Some(op),
            AtomKind::Hardware => None,
        }
    }

    pub fn is_soft(&self) -> bool {
        matches!(self.kind, AtomKind::Soft(_))
    }

    pub fn is_protected(&self) -> bool {
        self.info.flags.contains(AtomFlags::PROTECTED)
    }

    // ------------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------------

    pub fn set_dependencies(&self, dependencies: Vec<Dependency>) {
        self.state.lock().dependencies = dependencies;
    }

    /// Latch the results of completed predecessors and drop our references
    /// to them. Returns true when nothing is outstanding.
    pub fn update_dependencies(&self) -> bool {
        let mut state = self.state.lock();
        let mut satisfied = true;
        for dependency in &mut state.dependencies {
            let Some(predecessor) = &dependency.atom else {
                continue;
            };
            let result = predecessor.result_code();
            if result == ResultCode::Running {
                satisfied = false;
            } else {
                dependency.saved_result = result;
                dependency.atom = None;
            }
        }
        satisfied
    }

    /// First failure among data dependencies, else success. Order
    /// dependencies never fail an atom.
    pub fn final_dependency_result(&self) -> ResultCode {
        self.state
            .lock()
            .dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Data && d.atom.is_none())
            .map(|d| d.saved_result)
            .find(|result| !result.is_success())
            .unwrap_or(ResultCode::Success)
    }

    // ------------------------------------------------------------------------
    // Scheduler state
    // ------------------------------------------------------------------------

    pub fn result_code(&self) -> ResultCode {
        self.state.lock().result
    }

    pub fn set_result_code(&self, result: ResultCode) {
        self.state.lock().result = result;
    }

    pub fn is_completed(&self) -> bool {
        self.result_code() != ResultCode::Running
    }

    pub fn lifecycle(&self) -> AtomLifecycle {
        self.state.lock().lifecycle
    }

    pub fn set_lifecycle(&self, lifecycle: AtomLifecycle) {
        self.state.lock().lifecycle = lifecycle;
    }

    pub fn address_slot_mapping(&self) -> Option<Arc<AddressSlotMapping>> {
        self.state.lock().address_slot_mapping.clone()
    }

    pub fn set_address_slot_mapping(&self, mapping: Arc<AddressSlotMapping>) {
        let previous = self.state.lock().address_slot_mapping.replace(mapping);
        drop(previous);
    }

    /// Remove the slot reference; the caller drops it outside our lock.
    pub fn take_address_slot_mapping(&self) -> Option<Arc<AddressSlotMapping>> {
        self.state.lock().address_slot_mapping.take()
    }

    pub fn address_slot_number(&self) -> Option<u32> {
        self.state
            .lock()
            .address_slot_mapping
            .as_ref()
            .map(|mapping| mapping.slot_number())
    }

    pub fn execution_started(&self) -> Option<Instant> {
        self.state.lock().execution_started
    }

    pub fn set_execution_started(&self, now: Instant) {
        let mut state = self.state.lock();
        state.execution_started = Some(now);
        state.hard_stop_deadline = None;
    }

    pub fn hard_stop_deadline(&self) -> Option<Instant> {
        self.state.lock().hard_stop_deadline
    }

    /// Mark the atom as soft-stopped for running too long.
    pub fn set_hard_stop_deadline(&self, deadline: Instant) {
        self.state.lock().hard_stop_deadline = Some(deadline);
    }

    pub fn is_preempted(&self) -> bool {
        self.state.lock().preempted
    }

    pub fn set_preempted(&self, preempted: bool) {
        self.state.lock().preempted = preempted;
    }

    pub fn resume_address(&self) -> Option<u64> {
        self.state.lock().resume_address
    }

    pub fn set_resume_address(&self, address: Option<u64>) {
        self.state.lock().resume_address = address;
    }

    pub fn jit_addresses(&self) -> Vec<u64> {
        self.state.lock().jit_addresses.clone()
    }

    pub fn set_jit_addresses(&self, addresses: Vec<u64>) {
        self.state.lock().jit_addresses = addresses;
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("trace_id", &self.trace_id)
            .field("client", &self.client_id)
            .field("number", &self.info.atom_number)
            .field("slot", &self.info.slot)
            .field("priority", &self.info.priority)
            .field("gpu_address", &format_args!("{:#x}", self.info.gpu_address))
            .field("flags", &self.info.flags)
            .finish_non_exhaustive()
    }
}
