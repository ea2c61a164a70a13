//! TEAM_528: Work posted to the device thread.
//!
//! Interrupt threads and client threads never mutate scheduler or hardware
//! state themselves. They post a [`DeviceRequest`] and, where they need an
//! answer, block on the paired [`Reply`] receiver.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::atom::Atom;
use crate::device::{DeviceCore, DeviceError};

/// Closure run on the device thread with exclusive access to its state.
pub type DeviceTask = Box<dyn FnOnce(&mut DeviceCore) -> Result<(), DeviceError> + Send>;

/// One-shot answer channel.
pub struct Reply<T> {
    sender: Sender<T>,
}

impl<T> Reply<T> {
    pub fn pair() -> (Self, Receiver<T>) {
        let (sender, receiver) = bounded(1);
        (Self { sender }, receiver)
    }

    /// The requester may have given up waiting; that is not an error.
    pub fn send(self, value: T) {
        let _ = self.sender.send(value);
    }
}

/// GPU and host clocks read back to back on the device thread.
#[derive(Clone, Copy, Debug)]
pub struct GpuTimestamp {
    pub host_before: Instant,
    pub gpu_cycle_count: u64,
    pub gpu_timestamp: u64,
    pub host_after: Instant,
}

pub enum DeviceRequest {
    ScheduleAtom(Arc<Atom>),
    CancelAtoms { client_id: u64 },
    /// Latched `JOB_IRQ_STATUS`.
    JobInterrupt { status: u32 },
    /// Latched `MMU_IRQ_STATUS`.
    MmuInterrupt { status: u32 },
    /// Latched `GPU_IRQ_STATUS`.
    GpuInterrupt { status: u32 },
    /// A semaphore some soft atom waits on was signalled.
    SemaphoreSignaled,
    Task(DeviceTask, Reply<Result<(), DeviceError>>),
    DumpStatus(Reply<Vec<String>>),
    QueryTimestamp(Reply<GpuTimestamp>),
    Shutdown,
}

impl fmt::Debug for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScheduleAtom(atom) => write!(f, "ScheduleAtom({})", atom.trace_id()),
            Self::CancelAtoms { client_id } => write!(f, "CancelAtoms({client_id})"),
            Self::JobInterrupt { status } => write!(f, "JobInterrupt({status:#x})"),
            Self::MmuInterrupt { status } => write!(f, "MmuInterrupt({status:#x})"),
            Self::GpuInterrupt { status } => write!(f, "GpuInterrupt({status:#x})"),
            Self::SemaphoreSignaled => f.write_str("SemaphoreSignaled"),
            Self::Task(..) => f.write_str("Task"),
            Self::DumpStatus(_) => f.write_str("DumpStatus"),
            Self::QueryTimestamp(_) => f.write_str("QueryTimestamp"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}
