//! TEAM_525: Fake device owner for unit tests.

use std::sync::Arc;
use std::time::Duration;

use mali_hal::fake::{FakeBusMapper, FakeInterrupt, FakePageAllocator, FakeRegisterIo};
use mali_hal::{BusMapper, PageAllocator};
use parking_lot::Mutex;

use crate::address_manager::AddressManager;
use crate::address_space::{AddressSpaceObserver, AddressSpaceOwner};
use crate::atom::Atom;
use crate::connection::{Connection, ConnectionOwner};
use crate::device::DevicePlatform;

pub struct TestOwner {
    pub io: Arc<FakeRegisterIo>,
    pub allocator: Arc<FakePageAllocator>,
    pub bus_mapper: Arc<FakeBusMapper>,
    pub manager: Arc<AddressManager>,
    pub scheduled: Mutex<Vec<Arc<Atom>>>,
    pub cancelled: Mutex<Vec<u64>>,
    pub job_slots: u32,
}

impl TestOwner {
    pub fn new(address_slots: u32) -> Arc<Self> {
        Self::with_timeout(address_slots, Duration::from_secs(1))
    }

    pub fn with_timeout(address_slots: u32, timeout: Duration) -> Arc<Self> {
        let io = Arc::new(FakeRegisterIo::new());
        Arc::new(Self {
            manager: AddressManager::new(io.clone(), address_slots, timeout),
            io,
            allocator: Arc::new(FakePageAllocator::new()),
            bus_mapper: Arc::new(FakeBusMapper::new()),
            scheduled: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            job_slots: 3,
        })
    }

    pub fn connection(self: &Arc<Self>, client_id: u64) -> Arc<Connection> {
        Connection::create(client_id, self.clone(), false).unwrap()
    }

    pub fn take_scheduled(&self) -> Vec<Arc<Atom>> {
        std::mem::take(&mut *self.scheduled.lock())
    }
}

impl AddressSpaceOwner for TestOwner {
    fn address_space_observer(&self) -> Arc<dyn AddressSpaceObserver> {
        self.manager.clone()
    }

    fn page_allocator(&self) -> Arc<dyn PageAllocator> {
        self.allocator.clone()
    }
}

impl ConnectionOwner for TestOwner {
    fn bus_mapper(&self) -> Arc<dyn BusMapper> {
        self.bus_mapper.clone()
    }

    fn job_slot_count(&self) -> u32 {
        self.job_slots
    }

    fn schedule_atom(&self, atom: Arc<Atom>) {
        self.scheduled.lock().push(atom);
    }

    fn cancel_atoms(&self, connection: &Arc<Connection>) {
        self.cancelled.lock().push(connection.client_id());
    }
}

/// Fake platform for a full device with its threads.
pub struct FakePlatform {
    pub io: Arc<FakeRegisterIo>,
    pub allocator: Arc<FakePageAllocator>,
    pub bus_mapper: Arc<FakeBusMapper>,
    pub job_irq: Arc<FakeInterrupt>,
    pub mmu_irq: Arc<FakeInterrupt>,
    pub gpu_irq: Arc<FakeInterrupt>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            io: Arc::new(FakeRegisterIo::new()),
            allocator: Arc::new(FakePageAllocator::new()),
            bus_mapper: Arc::new(FakeBusMapper::new()),
            job_irq: Arc::new(FakeInterrupt::new()),
            mmu_irq: Arc::new(FakeInterrupt::new()),
            gpu_irq: Arc::new(FakeInterrupt::new()),
        }
    }

    pub fn platform(&self) -> DevicePlatform {
        DevicePlatform {
            registers: self.io.clone(),
            bus_mapper: self.bus_mapper.clone(),
            page_allocator: self.allocator.clone(),
            job_interrupt: self.job_irq.clone(),
            mmu_interrupt: self.mmu_irq.clone(),
            gpu_interrupt: self.gpu_irq.clone(),
        }
    }
}
