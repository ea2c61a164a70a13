//! TEAM_530: Client-facing driver surface.
//!
//! Clients never hold driver objects directly. Connections, buffers and
//! semaphores live in generation-checked [`HandleTable`]s and cross the
//! boundary as raw `u64` handles; a released or forged handle resolves to
//! [`AbiError::InvalidHandle`].
//!
//! Atom submission uses a packed command stream of little-endian `#[repr(C)]`
//! records:
//!
//! ```text
//! MaliAtomWire                      40 bytes, one per atom
//!   [JIT_ALLOCATE] MaliTrailerWire  8 bytes, count = N
//!                  MaliJitInfoWire  32 bytes x N
//!   [JIT_FREE]     MaliTrailerWire  8 bytes, count = N
//!                  ids              N bytes, padded to 8
//! ```

use std::collections::VecDeque;
use std::mem::size_of;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::warn;
use mali_error::define_kernel_error;
use mali_hal::PAGE_SHIFT;
use mali_utils::{Handle, HandleTable};
use parking_lot::Mutex;

use crate::address_space::AccessFlags;
use crate::atom::{AtomFlags, AtomInfo, DependencyKind};
use crate::buffer::Buffer;
use crate::connection::{AtomError, AtomSubmission, Connection, NotificationHandler};
use crate::device::{Device, DeviceError};
use crate::device_request::GpuTimestamp;
use crate::gpu_mapping::{GpuMapping, MappingError};
use crate::jit::{JitAllocationInfo, JitError};
use crate::semaphore::Semaphore;

define_kernel_error! {
    /// TEAM_530: Client ABI errors.
    pub enum AbiError(0x07, "abi") {
        /// Stale, released or forged handle
        InvalidHandle = 0x01 => "Invalid handle",
        /// Command stream truncated or inconsistent
        MalformedCommand = 0x02 => "Malformed command stream",
        /// Unknown access bits
        InvalidAccess = 0x03 => "Invalid access flags",
        Atom(AtomError) = 0x04 => "Atom rejected",
        Mapping(MappingError) = 0x05 => "Mapping request failed",
        Jit(JitError) = 0x06 => "JIT request failed",
        Device(DeviceError) = 0x07 => "Device request failed",
    }
}

impl From<AtomError> for AbiError {
    fn from(e: AtomError) -> Self {
        AbiError::Atom(e)
    }
}

impl From<MappingError> for AbiError {
    fn from(e: MappingError) -> Self {
        AbiError::Mapping(e)
    }
}

impl From<JitError> for AbiError {
    fn from(e: JitError) -> Self {
        AbiError::Jit(e)
    }
}

impl From<DeviceError> for AbiError {
    fn from(e: DeviceError) -> Self {
        AbiError::Device(e)
    }
}

// ============================================================================
// Wire format
// ============================================================================

pub const DEPENDENCY_NONE: u8 = 0;
pub const DEPENDENCY_DATA: u8 = 1;
pub const DEPENDENCY_ORDER: u8 = 2;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MaliDependencyWire {
    pub atom_number: u8,
    /// One of the `DEPENDENCY_*` values.
    pub kind: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MaliAtomWire {
    /// Must equal `size_of::<MaliAtomWire>()`.
    pub size: u64,
    pub job_chain_addr: u64,
    pub data: u64,
    pub flags: u32,
    pub slot: u32,
    pub atom_number: u8,
    pub priority: i8,
    pub reserved: [u8; 2],
    pub dependencies: [MaliDependencyWire; 2],
}

/// Element count of the variable-length list that follows.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MaliTrailerWire {
    pub count: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MaliJitInfoWire {
    pub va_pages: u64,
    pub committed_pages: u64,
    pub extend_pages: u64,
    pub usage_id: u16,
    pub id: u8,
    pub bin_id: u8,
    pub max_allocations: u8,
    pub reserved: [u8; 3],
}

impl MaliAtomWire {
    pub fn new(atom_number: u8, job_chain_addr: u64, flags: AtomFlags) -> Self {
        Self {
            size: size_of::<Self>() as u64,
            job_chain_addr,
            flags: flags.bits(),
            atom_number,
            ..Self::default()
        }
    }
}

impl From<MaliJitInfoWire> for JitAllocationInfo {
    fn from(wire: MaliJitInfoWire) -> Self {
        Self {
            id: wire.id,
            bin_id: wire.bin_id,
            max_allocations: wire.max_allocations,
            usage_id: wire.usage_id,
            va_pages: wire.va_pages,
            committed_pages: wire.committed_pages,
            extend_pages: wire.extend_pages,
        }
    }
}

struct CommandReader<'a> {
    bytes: &'a [u8],
}

impl<'a> CommandReader<'a> {
    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], AbiError> {
        if len > self.bytes.len() {
            return Err(AbiError::MalformedCommand);
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }

    fn read<T: Pod>(&mut self) -> Result<T, AbiError> {
        let bytes = self.take(size_of::<T>())?;
        bytemuck::try_pod_read_unaligned(bytes).map_err(|_| AbiError::MalformedCommand)
    }
}

fn parse_atom(reader: &mut CommandReader<'_>) -> Result<AtomSubmission, AbiError> {
    let wire: MaliAtomWire = reader.read()?;
    if wire.size != size_of::<MaliAtomWire>() as u64 {
        return Err(AbiError::MalformedCommand);
    }
    let flags = AtomFlags::from_bits(wire.flags).ok_or(AtomError::InvalidFlags)?;
    let mut submission = AtomSubmission {
        info: AtomInfo {
            gpu_address: wire.job_chain_addr,
            slot: wire.slot,
            atom_number: wire.atom_number,
            user_data: wire.data,
            priority: wire.priority,
            flags,
        },
        ..AtomSubmission::default()
    };
    for dependency in wire.dependencies {
        let kind = match dependency.kind {
            DEPENDENCY_NONE => continue,
            DEPENDENCY_DATA => DependencyKind::Data,
            DEPENDENCY_ORDER => DependencyKind::Order,
            _ => return Err(AbiError::MalformedCommand),
        };
        submission.dependencies.push((dependency.atom_number, kind));
    }

    if flags.contains(AtomFlags::JIT_ALLOCATE) {
        let trailer: MaliTrailerWire = reader.read()?;
        for _ in 0..trailer.count {
            let info: MaliJitInfoWire = reader.read()?;
            submission.jit_allocations.push(info.into());
        }
    } else if flags.contains(AtomFlags::JIT_FREE) {
        let trailer: MaliTrailerWire = reader.read()?;
        let count = trailer.count as usize;
        let ids = reader.take(count.next_multiple_of(8))?;
        submission.jit_free_ids.extend_from_slice(&ids[..count]);
    }
    Ok(submission)
}

// ============================================================================
// Driver
// ============================================================================

#[derive(Default)]
struct Objects {
    connections: HandleTable<Arc<Connection>>,
    buffers: HandleTable<Arc<Buffer>>,
    semaphores: HandleTable<Arc<Semaphore>>,
}

fn lookup<T: Clone>(table: &HandleTable<T>, raw: u64) -> Result<T, AbiError> {
    table
        .get(Handle::from_raw(raw))
        .cloned()
        .ok_or(AbiError::InvalidHandle)
}

pub struct Driver {
    device: Arc<Device>,
    objects: Mutex<Objects>,
}

impl Driver {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            objects: Mutex::new(Objects::default()),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    // ------------------------------------------------------------------------
    // Object lifetime
    // ------------------------------------------------------------------------

    pub fn create_connection(&self) -> Result<u64, AbiError> {
        let connection = self.device.open_connection()?;
        Ok(self.objects.lock().connections.insert(connection).to_raw())
    }

    /// Cancels the connection's outstanding atoms. Its address space is torn
    /// down once in-flight work drops the last reference.
    pub fn release_connection(&self, handle: u64) -> Result<(), AbiError> {
        let connection = self
            .objects
            .lock()
            .connections
            .remove(Handle::from_raw(handle))
            .ok_or(AbiError::InvalidHandle)?;
        self.device.close_connection(&connection);
        Ok(())
    }

    pub fn create_buffer(&self, page_count: u64) -> u64 {
        self.objects.lock().buffers.insert(Buffer::new(page_count)).to_raw()
    }

    /// Mappings of the buffer stay in their address spaces until removed,
    /// but can no longer be committed.
    pub fn release_buffer(&self, handle: u64) -> Result<(), AbiError> {
        self.objects
            .lock()
            .buffers
            .remove(Handle::from_raw(handle))
            .map(drop)
            .ok_or(AbiError::InvalidHandle)
    }

    pub fn create_semaphore(&self) -> u64 {
        self.objects.lock().semaphores.insert(Semaphore::new()).to_raw()
    }

    pub fn release_semaphore(&self, handle: u64) -> Result<(), AbiError> {
        self.objects
            .lock()
            .semaphores
            .remove(Handle::from_raw(handle))
            .map(drop)
            .ok_or(AbiError::InvalidHandle)
    }

    pub fn connection(&self, handle: u64) -> Result<Arc<Connection>, AbiError> {
        lookup(&self.objects.lock().connections, handle)
    }

    pub fn buffer(&self, handle: u64) -> Result<Arc<Buffer>, AbiError> {
        lookup(&self.objects.lock().buffers, handle)
    }

    pub fn semaphore(&self, handle: u64) -> Result<Arc<Semaphore>, AbiError> {
        lookup(&self.objects.lock().semaphores, handle)
    }

    // ------------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------------

    /// Reserve `page_count` pages of GPU VA at `gpu_va` for buffer pages
    /// starting at `page_offset`. Nothing is backed until committed.
    pub fn map_buffer_gpu(
        &self,
        connection: u64,
        buffer: u64,
        gpu_va: u64,
        page_offset: u64,
        page_count: u64,
        access: u64,
    ) -> Result<(), AbiError> {
        let connection = self.connection(connection)?;
        let buffer = self.buffer(buffer)?;
        let access = AccessFlags::from_bits(access).ok_or(AbiError::InvalidAccess)?;
        let size = page_count
            .checked_shl(PAGE_SHIFT)
            .filter(|size| size >> PAGE_SHIFT == page_count)
            .ok_or(MappingError::InvalidRange)?;
        let mapping = GpuMapping::new(gpu_va, page_offset, size, access, &buffer)?;
        connection.add_mapping(mapping)?;
        Ok(())
    }

    pub fn unmap_buffer_gpu(&self, connection: u64, gpu_va: u64) -> Result<(), AbiError> {
        self.connection(connection)?.remove_mapping(gpu_va)?;
        Ok(())
    }

    pub fn commit_buffer(
        &self,
        connection: u64,
        buffer: u64,
        page_offset: u64,
        page_count: u64,
    ) -> Result<(), AbiError> {
        let connection = self.connection(connection)?;
        let buffer = self.buffer(buffer)?;
        connection.commit_memory_for_buffer(&buffer, page_offset, page_count)?;
        Ok(())
    }

    pub fn decommit_buffer(
        &self,
        connection: u64,
        buffer: u64,
        page_offset: u64,
        page_count: u64,
    ) -> Result<(), AbiError> {
        let connection = self.connection(connection)?;
        let buffer = self.buffer(buffer)?;
        connection.decommit_memory_for_buffer(&buffer, page_offset, page_count)?;
        Ok(())
    }

    /// Reserve the connection's JIT window.
    pub fn set_jit_memory_region(
        &self,
        connection: u64,
        gpu_va: u64,
        va_pages: u64,
        max_allocations: u8,
        trim_level: u8,
    ) -> Result<(), AbiError> {
        self.connection(connection)?
            .set_jit_memory_region(gpu_va, va_pages, max_allocations, trim_level)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    pub fn set_notification_handler(
        &self,
        connection: u64,
        handler: Option<Arc<dyn NotificationHandler>>,
    ) -> Result<(), AbiError> {
        self.connection(connection)?.set_notification_handler(handler);
        Ok(())
    }

    /// Submit every atom in `commands`. Semaphore soft atoms consume
    /// `semaphores` in order. Returns the number of atoms queued; atoms
    /// before a malformed or rejected one stay queued.
    pub fn execute_immediate_commands(
        &self,
        connection: u64,
        commands: &[u8],
        semaphores: &[u64],
    ) -> Result<usize, AbiError> {
        let connection = self.connection(connection)?;
        let mut semaphore_queue = {
            let objects = self.objects.lock();
            semaphores
                .iter()
                .map(|&raw| lookup(&objects.semaphores, raw))
                .collect::<Result<VecDeque<_>, _>>()?
        };

        let mut reader = CommandReader { bytes: commands };
        let mut queued = 0;
        while !reader.is_empty() {
            let submission = parse_atom(&mut reader).inspect_err(|e| {
                warn!(
                    "abi: client {} sent a bad command stream: {e}",
                    connection.client_id()
                );
            })?;
            connection.execute_atom(&submission, &mut semaphore_queue)?;
            queued += 1;
        }
        Ok(queued)
    }

    // ------------------------------------------------------------------------
    // Device queries
    // ------------------------------------------------------------------------

    pub fn enable_performance_counters(
        &self,
        connection: u64,
        dump_address: u64,
    ) -> Result<(), AbiError> {
        let connection = self.connection(connection)?;
        self.device
            .enable_performance_counters(&connection, dump_address)?;
        Ok(())
    }

    pub fn trigger_performance_counters(&self, trigger_id: u64) -> Result<(), AbiError> {
        self.device.trigger_performance_counters(trigger_id)?;
        Ok(())
    }

    pub fn disable_performance_counters(&self) -> Result<(), AbiError> {
        self.device.disable_performance_counters()?;
        Ok(())
    }

    pub fn query_timestamp(&self) -> Result<GpuTimestamp, AbiError> {
        Ok(self.device.query_timestamp()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::AccessFlags;
    use crate::test_support::FakePlatform;
    use std::time::Duration;

    fn driver() -> (FakePlatform, Driver) {
        let fake = FakePlatform::new();
        let device = Device::create(fake.platform(), crate::DriverConfig::default()).unwrap();
        (fake, Driver::new(device))
    }

    fn bytes_of_all(parts: &[&[u8]]) -> Vec<u8> {
        parts.concat()
    }

    #[test]
    fn test_wire_sizes() {
        assert_eq!(size_of::<MaliAtomWire>(), 40);
        assert_eq!(size_of::<MaliTrailerWire>(), 8);
        assert_eq!(size_of::<MaliJitInfoWire>(), 32);
    }

    #[test]
    fn test_released_handle_is_invalid() {
        let (_fake, driver) = driver();
        let buffer = driver.create_buffer(4);
        driver.release_buffer(buffer).unwrap();
        assert_eq!(driver.release_buffer(buffer), Err(AbiError::InvalidHandle));

        let recycled = driver.create_buffer(4);
        assert_ne!(recycled, buffer);
        assert!(driver.buffer(buffer).is_err());
        assert!(driver.buffer(recycled).is_ok());
        assert_eq!(driver.connection(0).err(), Some(AbiError::InvalidHandle));
    }

    #[test]
    fn test_map_and_commit() {
        let (_fake, driver) = driver();
        let connection = driver.create_connection().unwrap();
        let buffer = driver.create_buffer(3);
        let access = (AccessFlags::READ | AccessFlags::WRITE).bits();

        driver
            .map_buffer_gpu(connection, buffer, 0x1000, 0, 3, access)
            .unwrap();
        assert_eq!(
            driver.map_buffer_gpu(connection, buffer, 0x2000, 0, 1, access),
            Err(AbiError::Mapping(MappingError::Overlap))
        );
        assert_eq!(
            driver.map_buffer_gpu(connection, buffer, 0x8000, 0, 1, 1 << 40),
            Err(AbiError::InvalidAccess)
        );

        driver.commit_buffer(connection, buffer, 1, 1).unwrap();
        let conn = driver.connection(connection).unwrap();
        assert!(conn.read_pte_for_testing(0x2000).is_valid());
        assert!(!conn.read_pte_for_testing(0x1000).is_valid());

        driver.decommit_buffer(connection, buffer, 1, 1).unwrap();
        assert!(!conn.read_pte_for_testing(0x2000).is_valid());
        driver.unmap_buffer_gpu(connection, 0x1000).unwrap();
        assert_eq!(conn.mapping_count(), 0);
    }

    #[test]
    fn test_semaphore_set_command() {
        let (_fake, driver) = driver();
        let connection = driver.create_connection().unwrap();
        let semaphore = driver.create_semaphore();
        let commands = MaliAtomWire::new(1, 0, AtomFlags::SEMAPHORE_SET);

        let queued = driver
            .execute_immediate_commands(connection, bytemuck::bytes_of(&commands), &[semaphore])
            .unwrap();
        assert_eq!(queued, 1);
        assert!(
            driver
                .semaphore(semaphore)
                .unwrap()
                .wait_timeout(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_jit_trailers_parse() {
        let mut atom = MaliAtomWire::new(4, 0, AtomFlags::JIT_FREE);
        atom.dependencies[0] = MaliDependencyWire {
            atom_number: 3,
            kind: DEPENDENCY_ORDER,
        };
        let trailer = MaliTrailerWire {
            count: 3,
            reserved: 0,
        };
        let ids = [7u8, 8, 9, 0, 0, 0, 0, 0];
        let stream = bytes_of_all(&[
            bytemuck::bytes_of(&atom),
            bytemuck::bytes_of(&trailer),
            &ids,
        ]);

        let mut reader = CommandReader { bytes: &stream };
        let submission = parse_atom(&mut reader).unwrap();
        assert!(reader.is_empty());
        assert_eq!(submission.jit_free_ids, vec![7, 8, 9]);
        assert_eq!(submission.dependencies, vec![(3, DependencyKind::Order)]);

        let allocate = MaliAtomWire::new(5, 0, AtomFlags::JIT_ALLOCATE);
        let info = MaliJitInfoWire {
            va_pages: 16,
            committed_pages: 4,
            id: 2,
            ..MaliJitInfoWire::default()
        };
        let trailer = MaliTrailerWire {
            count: 1,
            reserved: 0,
        };
        let stream = bytes_of_all(&[
            bytemuck::bytes_of(&allocate),
            bytemuck::bytes_of(&trailer),
            bytemuck::bytes_of(&info),
        ]);
        let submission = parse_atom(&mut CommandReader { bytes: &stream }).unwrap();
        assert_eq!(submission.jit_allocations.len(), 1);
        assert_eq!(submission.jit_allocations[0].va_pages, 16);
        assert_eq!(submission.jit_allocations[0].id, 2);
    }

    #[test]
    fn test_malformed_commands_rejected() {
        let (_fake, driver) = driver();
        let connection = driver.create_connection().unwrap();
        let atom = MaliAtomWire::new(1, 0x10_0000, AtomFlags::empty());
        let bytes = bytemuck::bytes_of(&atom);

        assert_eq!(
            driver.execute_immediate_commands(connection, &bytes[..20], &[]),
            Err(AbiError::MalformedCommand)
        );

        let mut bad_size = atom;
        bad_size.size = 8;
        assert_eq!(
            driver.execute_immediate_commands(connection, bytemuck::bytes_of(&bad_size), &[]),
            Err(AbiError::MalformedCommand)
        );

        let mut bad_flags = atom;
        bad_flags.flags = 1 << 31;
        assert_eq!(
            driver.execute_immediate_commands(connection, bytemuck::bytes_of(&bad_flags), &[]),
            Err(AbiError::Atom(AtomError::InvalidFlags))
        );

        assert_eq!(
            driver.execute_immediate_commands(connection, bytes, &[99]),
            Err(AbiError::InvalidHandle)
        );
    }
}
