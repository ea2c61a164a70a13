//! Address slot arbitration under contention.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use mali_hal::fake::{FakeBusMapper, FakePageAllocator, FakeRegisterIo};
use mali_hal::{BusMapper, PageAllocator};
use mali_msd::address_space::{AddressSpaceObserver, AddressSpaceOwner};
use mali_msd::connection::ConnectionOwner;
use mali_msd::{AddressManager, Atom, Connection, SlotError};

struct Host {
    manager: Arc<AddressManager>,
    allocator: Arc<FakePageAllocator>,
}

impl Host {
    fn new(slots: u32, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            manager: AddressManager::new(Arc::new(FakeRegisterIo::new()), slots, timeout),
            allocator: Arc::new(FakePageAllocator::new()),
        })
    }

    fn connection(self: &Arc<Self>, client_id: u64) -> Arc<Connection> {
        Connection::create(client_id, self.clone(), false).unwrap()
    }
}

impl AddressSpaceOwner for Host {
    fn address_space_observer(&self) -> Arc<dyn AddressSpaceObserver> {
        self.manager.clone()
    }

    fn page_allocator(&self) -> Arc<dyn PageAllocator> {
        self.allocator.clone()
    }
}

impl ConnectionOwner for Host {
    fn bus_mapper(&self) -> Arc<dyn BusMapper> {
        Arc::new(FakeBusMapper::new())
    }

    fn job_slot_count(&self) -> u32 {
        3
    }

    fn schedule_atom(&self, _atom: Arc<Atom>) {}

    fn cancel_atoms(&self, _connection: &Arc<Connection>) {}
}

#[test]
fn one_more_connection_than_slots_blocks_until_release() {
    let host = Host::new(2, Duration::from_secs(5));
    let first = host.connection(1);
    let second = host.connection(2);
    let held = [
        host.manager.allocate_mapping_for_address_space(&first).unwrap(),
        host.manager.allocate_mapping_for_address_space(&second).unwrap(),
    ];

    let (done, finished) = bounded(1);
    let waiter = {
        let host = host.clone();
        thread::spawn(move || {
            let third = host.connection(3);
            let mapping = host.manager.allocate_mapping_for_address_space(&third);
            let _ = done.send(mapping.map(|m| m.slot_number()));
        })
    };

    assert!(finished.recv_timeout(Duration::from_millis(100)).is_err());
    let [kept, released] = held;
    let freed_slot = released.slot_number();
    drop(released);

    let slot = finished.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(slot, freed_slot);
    assert_ne!(slot, kept.slot_number());
    waiter.join().unwrap();
}

#[test]
fn live_mappings_never_exceed_slot_count() {
    const SLOTS: u32 = 2;
    let host = Host::new(SLOTS, Duration::from_secs(5));
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (1..=6)
        .map(|client_id| {
            let host = host.clone();
            let live = live.clone();
            let peak = peak.clone();
            thread::spawn(move || {
                let connection = host.connection(client_id);
                for _ in 0..5 {
                    let mapping = host
                        .manager
                        .allocate_mapping_for_address_space(&connection)
                        .unwrap();
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    live.fetch_sub(1, Ordering::SeqCst);
                    drop(mapping);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= SLOTS as usize);
    assert_eq!(host.manager.busy_slot_count(), 0);
}

#[test]
fn busy_slots_time_out() {
    let host = Host::new(1, Duration::from_millis(50));
    let first = host.connection(1);
    let second = host.connection(2);
    let _held = host.manager.allocate_mapping_for_address_space(&first).unwrap();

    assert_eq!(
        host.manager
            .allocate_mapping_for_address_space(&second)
            .err(),
        Some(SlotError::Timeout)
    );
}
