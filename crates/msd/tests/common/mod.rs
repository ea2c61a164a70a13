//! Shared fixtures for the driver scenario tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, unbounded};
use mali_hal::fake::{FakeBusMapper, FakeInterrupt, FakePageAllocator, FakeRegisterIo};
use mali_hal::regs::{JOB_IRQ_STATUS, JobSlotRegisters, job_irq_done, job_irq_failed};
use mali_msd::{Connection, Device, DevicePlatform, DriverConfig, Notification};

pub const WAIT: Duration = Duration::from_secs(5);

/// A device running on fake hardware.
pub struct Rig {
    pub io: Arc<FakeRegisterIo>,
    pub allocator: Arc<FakePageAllocator>,
    pub job_irq: Arc<FakeInterrupt>,
    pub gpu_irq: Arc<FakeInterrupt>,
    pub device: Arc<Device>,
}

impl Rig {
    pub fn new(config: DriverConfig) -> Self {
        let io = Arc::new(FakeRegisterIo::new());
        let allocator = Arc::new(FakePageAllocator::new());
        let job_irq = Arc::new(FakeInterrupt::new());
        let gpu_irq = Arc::new(FakeInterrupt::new());
        let platform = DevicePlatform {
            registers: io.clone(),
            bus_mapper: Arc::new(FakeBusMapper::new()),
            page_allocator: allocator.clone(),
            job_interrupt: job_irq.clone(),
            mmu_interrupt: Arc::new(FakeInterrupt::new()),
            gpu_interrupt: gpu_irq.clone(),
        };
        let device = Device::create(platform, config).unwrap();
        Self {
            io,
            allocator,
            job_irq,
            gpu_irq,
            device,
        }
    }

    /// Wait until the device thread has handled everything posted so far.
    pub fn sync(&self) {
        self.device.dump_status().unwrap();
    }

    /// Report the job on `slot` as finished, successfully or with a raw
    /// job status code.
    pub fn complete_job(&self, slot: u32, status: Option<u32>) {
        match status {
            Some(code) => {
                self.io.set(JobSlotRegisters::new(slot).status(), code);
                self.io.set(JOB_IRQ_STATUS, job_irq_failed(slot));
            }
            None => self.io.set(JOB_IRQ_STATUS, job_irq_done(slot)),
        }
        self.job_irq.trigger();
    }

    /// Job chain addresses started on `slot`, in order.
    pub fn started_on(&self, slot: u32) -> Vec<u64> {
        let head = JobSlotRegisters::new(slot).head_next();
        self.io
            .writes()
            .into_iter()
            .filter(|&(offset, _)| offset == head)
            .map(|(_, lo)| u64::from(lo))
            .collect()
    }
}

pub fn listen(connection: &Connection) -> Receiver<Notification> {
    let (sender, receiver) = unbounded();
    connection.set_notification_handler(Some(Arc::new(move |n: Notification| {
        let _ = sender.send(n);
    })));
    receiver
}

pub fn completion(atom_number: u8, result: mali_msd::ResultCode) -> Notification {
    Notification::AtomCompleted {
        atom_number,
        result,
        user_data: 0,
    }
}
