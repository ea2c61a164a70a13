//! Hardware address slot allocation.
//!
//! TEAM_519: The GPU has a handful of MMU address-space slots. Atoms can only
//! run while their connection's address space occupies one, so slots are
//! handed out as reference-counted [`AddressSlotMapping`]s. A slot whose
//! mapping has been dropped keeps its page-table programming until someone
//! else needs it; re-running work from the same connection is then free.
//!
//! Locking: the slot table lock is always taken before a per-slot hardware
//! lock, and register sequences run with only the per-slot lock held so a
//! slow flush on one slot never stalls assignment of another.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use mali_error::define_kernel_error;
use mali_hal::regs::{
    AddressSpaceRegisters, AsCommand, AsStatus, MMU_MEMATTR_DEFAULT, TranslationTableFlags,
    encode_lock_region,
};
use mali_hal::{HalError, RegisterIo, RegisterIoExt};
use mali_utils::{SpinMutex, SpinMutexGuard};
use parking_lot::{Condvar, Mutex};

use crate::address_space::{AddressSpaceId, AddressSpaceObserver, VIRTUAL_ADDRESS_LIMIT};
use crate::atom::Atom;
use crate::connection::Connection;

define_kernel_error! {
    /// TEAM_519: Address slot errors.
    pub enum SlotError(0x03, "slot") {
        /// Every slot stayed busy for the whole acquire timeout
        Timeout = 0x01 => "Timed out waiting for an address slot",
        /// The atom's connection was already torn down
        ConnectionGone = 0x02 => "Connection no longer exists",
    }
}

/// Polls of `AS_STATUS` before a slot command is declared stuck.
const SLOT_IDLE_POLL_LIMIT: u32 = 100_000;

// ============================================================================
// Slot mapping
// ============================================================================

/// Exclusive use of one hardware slot by one connection. The slot cannot be
/// reassigned while any clone of this is alive.
pub struct AddressSlotMapping {
    slot_number: u32,
    connection: Arc<Connection>,
    /// Set when a device reset force-cleared the slot underneath us.
    expired: AtomicBool,
    manager: Weak<AddressManager>,
}

impl AddressSlotMapping {
    pub fn slot_number(&self) -> u32 {
        self.slot_number
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }
}

impl Drop for AddressSlotMapping {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.mapping_released();
        }
    }
}

impl fmt::Debug for AddressSlotMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSlotMapping")
            .field("slot", &self.slot_number)
            .field("client", &self.connection.client_id())
            .field("expired", &self.is_expired())
            .finish()
    }
}

// ============================================================================
// Slot table
// ============================================================================

#[derive(Default)]
struct AddressSlot {
    mapping: Weak<AddressSlotMapping>,
    address_space: Option<AddressSpaceId>,
    last_used: u64,
}

impl AddressSlot {
    fn is_busy(&self) -> bool {
        self.mapping.strong_count() > 0
    }
}

struct SlotTable {
    slots: Vec<AddressSlot>,
    tick: u64,
}

impl SlotTable {
    fn find(&self, space: AddressSpaceId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.address_space == Some(space))
    }

    /// A never-used slot if there is one, else the least recently used slot
    /// nobody holds a mapping for.
    fn pick_victim(&self) -> Option<usize> {
        if let Some(free) = self.slots.iter().position(|s| s.address_space.is_none()) {
            return Some(free);
        }
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.is_busy())
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(index, _)| index)
    }

    fn touch(&mut self, index: usize) {
        self.tick += 1;
        self.slots[index].last_used = self.tick;
    }
}

// ============================================================================
// Hardware slot
// ============================================================================

/// Register sequences for one MMU slot. Only reachable through its lock.
struct HardwareSlot {
    regs: AddressSpaceRegisters,
}

impl HardwareSlot {
    fn wait_for_idle(&self, io: &dyn RegisterIo) -> Result<(), HalError> {
        for _ in 0..SLOT_IDLE_POLL_LIMIT {
            if io.read32(self.regs.status()) & AsStatus::ACTIVE.bits() == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(HalError::RegisterTimeout)
    }

    fn send_command(&self, io: &dyn RegisterIo, command: AsCommand) -> Result<(), HalError> {
        self.wait_for_idle(io)?;
        io.write32(self.regs.command(), command as u32);
        Ok(())
    }

    fn configure(&self, io: &dyn RegisterIo, translation_table_entry: u64) -> Result<(), HalError> {
        io.write64(self.regs.transtab(), translation_table_entry);
        io.write64(self.regs.memattr(), MMU_MEMATTR_DEFAULT);
        self.send_command(io, AsCommand::Update)
    }

    fn flush_range(
        &self,
        io: &dyn RegisterIo,
        start: u64,
        length: u64,
        synchronous: bool,
    ) -> Result<(), HalError> {
        io.write64(self.regs.lockaddr(), encode_lock_region(start, length));
        self.send_command(io, AsCommand::Lock)?;
        // Both flush commands release the lock when they finish.
        let command = if synchronous {
            AsCommand::FlushMem
        } else {
            AsCommand::FlushPageTables
        };
        self.send_command(io, command)?;
        if synchronous {
            self.wait_for_idle(io)?;
        }
        Ok(())
    }

    fn invalidate(&self, io: &dyn RegisterIo) -> Result<(), HalError> {
        self.flush_range(io, 0, VIRTUAL_ADDRESS_LIMIT, true)?;
        io.write64(
            self.regs.transtab(),
            TranslationTableFlags::ADRMODE_UNMAPPED.bits(),
        );
        self.send_command(io, AsCommand::Update)
    }

    fn unlock(&self, io: &dyn RegisterIo) -> Result<(), HalError> {
        self.send_command(io, AsCommand::Unlock)
    }
}

// ============================================================================
// Address manager
// ============================================================================

pub struct AddressManager {
    io: Arc<dyn RegisterIo>,
    slots: Mutex<SlotTable>,
    slot_freed: Condvar,
    hardware_slots: Vec<SpinMutex<HardwareSlot>>,
    acquire_slot_timeout: Duration,
    weak_self: Weak<AddressManager>,
}

impl AddressManager {
    pub fn new(
        io: Arc<dyn RegisterIo>,
        slot_count: u32,
        acquire_slot_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            io,
            slots: Mutex::new(SlotTable {
                slots: (0..slot_count).map(|_| AddressSlot::default()).collect(),
                tick: 0,
            }),
            slot_freed: Condvar::new(),
            hardware_slots: (0..slot_count)
                .map(|n| {
                    SpinMutex::new(HardwareSlot {
                        regs: AddressSpaceRegisters::new(n),
                    })
                })
                .collect(),
            acquire_slot_timeout,
            weak_self: weak_self.clone(),
        })
    }

    pub fn slot_count(&self) -> u32 {
        self.hardware_slots.len() as u32
    }

    /// Make sure `atom` holds a slot for its connection's address space.
    /// Returns false if none could be obtained.
    pub fn assign_address_space(&self, atom: &Atom) -> bool {
        if atom.address_slot_mapping().is_some() {
            return true;
        }
        let Some(connection) = atom.connection().upgrade() else {
            warn!("address: atom {} has no connection", atom.trace_id());
            return false;
        };
        match self.allocate_mapping_for_address_space(&connection) {
            Ok(mapping) => {
                atom.set_address_slot_mapping(mapping);
                true
            }
            Err(e) => {
                warn!(
                    "address: no slot for client {} atom {}: {e}",
                    connection.client_id(),
                    atom.trace_id()
                );
                false
            }
        }
    }

    /// Drop the atom's slot reference. The slot keeps its programming.
    pub fn atom_finished(&self, atom: &Atom) {
        if let Some(mapping) = atom.take_address_slot_mapping() {
            trace!(
                "address: atom {} released slot {}",
                atom.trace_id(),
                mapping.slot_number()
            );
        }
    }

    /// Get a slot for `connection`'s address space, evicting the least
    /// recently used idle slot if needed. Blocks while every slot is busy,
    /// up to the acquire timeout.
    pub fn allocate_mapping_for_address_space(
        &self,
        connection: &Arc<Connection>,
    ) -> Result<Arc<AddressSlotMapping>, SlotError> {
        let space = connection.address_space_id();
        let deadline = Instant::now() + self.acquire_slot_timeout;
        let mut table = self.slots.lock();
        let mut warned = false;
        let mut timed_out = false;

        loop {
            if let Some(index) = table.find(space) {
                table.touch(index);
                if let Some(mapping) = table.slots[index].mapping.upgrade() {
                    return Ok(mapping);
                }
                let mapping = self.new_mapping(index, connection);
                table.slots[index].mapping = Arc::downgrade(&mapping);
                return Ok(mapping);
            }

            if let Some(index) = table.pick_victim() {
                let previous = table.slots[index].address_space.replace(space);
                let mapping = self.new_mapping(index, connection);
                table.slots[index].mapping = Arc::downgrade(&mapping);
                table.touch(index);

                let hardware = self.hardware_slots[index].lock();
                drop(table);

                if let Some(previous) = previous {
                    debug!("address: slot {index} evicts {previous:?} for {space:?}");
                    if let Err(e) = hardware.invalidate(&*self.io) {
                        error!("address: invalidating slot {index} failed: {e}");
                    }
                }
                if let Err(e) = hardware.configure(&*self.io, connection.translation_table_entry())
                {
                    error!("address: programming slot {index} failed: {e}");
                }
                return Ok(mapping);
            }

            if timed_out {
                error!(
                    "address: client {} starved for {:?}",
                    connection.client_id(),
                    self.acquire_slot_timeout
                );
                return Err(SlotError::Timeout);
            }
            if !warned {
                warn!("address: out of slots, blocking");
                warned = true;
            }
            // One more pass after the deadline in case a slot freed just then.
            timed_out = self.slot_freed.wait_until(&mut table, deadline).timed_out();
        }
    }

    /// Detach address spaces from slots ahead of a GPU reset. With
    /// `force_expire`, slots still held by running atoms are cleared too and
    /// their mappings are marked expired.
    pub fn clear_address_mappings(&self, force_expire: bool) {
        let mut expired = Vec::new();
        let mut table = self.slots.lock();
        for (index, slot) in table.slots.iter_mut().enumerate() {
            // Wait out any flush in progress on this slot.
            let hardware = self.hardware_slots[index].lock();
            if slot.address_space.is_none() || (slot.is_busy() && !force_expire) {
                continue;
            }
            if let Some(mapping) = slot.mapping.upgrade() {
                mapping.expired.store(true, Ordering::Release);
                expired.push(mapping);
            }
            slot.address_space = None;
            slot.mapping = Weak::new();
            if let Err(e) = hardware.invalidate(&*self.io) {
                error!("address: invalidating slot {index} failed: {e}");
            }
        }
        drop(table);
        // Released outside the table lock; their Drop takes it.
        drop(expired);
        self.slot_freed.notify_all();
    }

    /// Slot currently holding `space`.
    pub fn slot_for_address_space(&self, space: AddressSpaceId) -> Option<u32> {
        self.slots.lock().find(space).map(|index| index as u32)
    }

    /// Connection whose address space is resident in `slot` and in use.
    pub fn connection_in_slot(&self, slot: u32) -> Option<Arc<Connection>> {
        let mapping = {
            let table = self.slots.lock();
            table.slots.get(slot as usize)?.mapping.upgrade()
        };
        mapping.map(|mapping| mapping.connection().clone())
    }

    /// Number of slots held by a live mapping.
    pub fn busy_slot_count(&self) -> usize {
        self.slots.lock().slots.iter().filter(|s| s.is_busy()).count()
    }

    pub fn dump(&self) -> Vec<String> {
        let table = self.slots.lock();
        table
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| match slot.address_space {
                Some(space) => format!(
                    "AS {index}: {space:?} {} last used {}",
                    if slot.is_busy() { "busy" } else { "idle" },
                    slot.last_used
                ),
                None => format!("AS {index}: free"),
            })
            .collect()
    }

    fn new_mapping(&self, index: usize, connection: &Arc<Connection>) -> Arc<AddressSlotMapping> {
        Arc::new(AddressSlotMapping {
            slot_number: index as u32,
            connection: connection.clone(),
            expired: AtomicBool::new(false),
            manager: self.weak_self.clone(),
        })
    }

    fn mapping_released(&self) {
        let _table = self.slots.lock();
        self.slot_freed.notify_all();
    }

    /// Per-slot lock for the slot holding `space`, taken before the table
    /// lock is released so the slot cannot change hands in between.
    fn lock_hardware_slot_for(
        &self,
        space: AddressSpaceId,
    ) -> Option<(usize, SpinMutexGuard<'_, HardwareSlot>)> {
        let table = self.slots.lock();
        let index = table.find(space)?;
        let hardware = self.hardware_slots[index].lock();
        drop(table);
        Some((index, hardware))
    }
}

impl AddressSpaceObserver for AddressManager {
    fn flush_address_mapping_range(
        &self,
        space: AddressSpaceId,
        start: u64,
        length: u64,
        synchronous: bool,
    ) {
        // Not resident: nothing cached to flush.
        let Some((index, hardware)) = self.lock_hardware_slot_for(space) else {
            return;
        };
        if let Err(e) = hardware.flush_range(&*self.io, start, length, synchronous) {
            error!("address: flush of slot {index} failed: {e}");
        }
    }

    fn unlock_address_space(&self, space: AddressSpaceId) {
        let Some((index, hardware)) = self.lock_hardware_slot_for(space) else {
            return;
        };
        if let Err(e) = hardware.unlock(&*self.io) {
            error!("address: unlock of slot {index} failed: {e}");
        }
    }

    fn release_space_mappings(&self, space: AddressSpaceId) {
        let mut table = self.slots.lock();
        let Some(index) = table.find(space) else {
            return;
        };
        table.slots[index].address_space = None;
        table.slots[index].mapping = Weak::new();
        let hardware = self.hardware_slots[index].lock();
        drop(table);

        if let Err(e) = hardware.invalidate(&*self.io) {
            error!("address: invalidating slot {index} failed: {e}");
        }
        drop(hardware);
        self.slot_freed.notify_all();
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
