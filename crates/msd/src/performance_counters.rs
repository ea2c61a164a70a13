//! TEAM_527: Hardware performance counter sampling.
//!
//! The GPU dumps counter blocks into a client buffer through the MMU, so the
//! client's address space must hold an address slot for as long as counters
//! are enabled. A sample is requested with `PRFCNT_SAMPLE`; its completion
//! arrives as a GPU interrupt and is reported back to the client by trigger
//! id. Only the device thread touches this state.

use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use mali_error::define_kernel_error;
use mali_hal::regs::{
    GPU_COMMAND, GpuCommand, PRFCNT_BASE_LO, PRFCNT_CONFIG, PRFCNT_JM_EN, PRFCNT_MMU_L2_EN,
    PRFCNT_SHADER_EN, PRFCNT_TILER_EN,
};
use mali_hal::{RegisterIo, RegisterIoExt, is_page_aligned};

use crate::address_manager::{AddressManager, AddressSlotMapping, SlotError};
use crate::connection::Connection;

define_kernel_error! {
    /// TEAM_527: Performance counter errors.
    pub enum PerfCounterError(0x0A, "prfcnt") {
        AlreadyEnabled = 0x01 => "Performance counters already enabled",
        NotEnabled = 0x02 => "Performance counters not enabled",
        /// A sample is still being written
        SampleInProgress = 0x03 => "Sample in progress",
        /// Dump address must be page aligned
        InvalidBuffer = 0x04 => "Invalid dump buffer",
        NoAddressSlot(SlotError) = 0x05 => "No address slot for the dump buffer",
    }
}

/// `PRFCNT_CONFIG` mode: sample on `PRFCNT_SAMPLE` only.
const PRFCNT_CONFIG_MODE_MANUAL: u32 = 1;
const PRFCNT_CONFIG_AS_SHIFT: u32 = 4;
/// Enable every counter of a block.
const PRFCNT_ENABLE_ALL: u32 = 0xFFFF_FFFF;

/// Result reported to a client whose sample was abandoned.
pub const SAMPLE_RESULT_ABORTED: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfCounterState {
    Disabled,
    Enabled,
    Triggered { trigger_id: u64 },
}

/// A finished or abandoned sample to report to its client.
#[derive(Debug)]
pub struct SampleCompletion {
    pub connection: Weak<Connection>,
    pub trigger_id: u64,
    pub result: u32,
}

pub struct PerformanceCounters {
    state: PerfCounterState,
    connection: Weak<Connection>,
    /// Keeps the dump buffer's address space resident.
    mapping: Option<Arc<AddressSlotMapping>>,
    dump_address: u64,
}

impl Default for PerformanceCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceCounters {
    pub fn new() -> Self {
        Self {
            state: PerfCounterState::Disabled,
            connection: Weak::new(),
            mapping: None,
            dump_address: 0,
        }
    }

    pub fn state(&self) -> PerfCounterState {
        self.state
    }

    /// Start counting into the buffer mapped at `dump_address` in
    /// `connection`'s address space.
    pub fn enable(
        &mut self,
        io: &dyn RegisterIo,
        address_manager: &AddressManager,
        connection: &Arc<Connection>,
        dump_address: u64,
    ) -> Result<(), PerfCounterError> {
        if self.state != PerfCounterState::Disabled {
            return Err(PerfCounterError::AlreadyEnabled);
        }
        if dump_address == 0 || !is_page_aligned(dump_address) {
            return Err(PerfCounterError::InvalidBuffer);
        }
        let mapping = address_manager
            .allocate_mapping_for_address_space(connection)
            .map_err(PerfCounterError::NoAddressSlot)?;

        self.dump_address = dump_address;
        self.program(io, mapping.slot_number());
        io.write32(GPU_COMMAND, GpuCommand::PrfcntClear as u32);

        info!(
            "prfcnt: enabled for client {} on slot {}",
            connection.client_id(),
            mapping.slot_number()
        );
        self.mapping = Some(mapping);
        self.connection = Arc::downgrade(connection);
        self.state = PerfCounterState::Enabled;
        Ok(())
    }

    fn program(&self, io: &dyn RegisterIo, slot: u32) {
        io.write64(PRFCNT_BASE_LO, self.dump_address);
        io.write32(PRFCNT_JM_EN, PRFCNT_ENABLE_ALL);
        io.write32(PRFCNT_SHADER_EN, PRFCNT_ENABLE_ALL);
        io.write32(PRFCNT_TILER_EN, PRFCNT_ENABLE_ALL);
        io.write32(PRFCNT_MMU_L2_EN, PRFCNT_ENABLE_ALL);
        io.write32(
            PRFCNT_CONFIG,
            (slot << PRFCNT_CONFIG_AS_SHIFT) | PRFCNT_CONFIG_MODE_MANUAL,
        );
    }

    /// Request a dump; completion is reported with `trigger_id`.
    pub fn trigger(&mut self, io: &dyn RegisterIo, trigger_id: u64) -> Result<(), PerfCounterError> {
        match self.state {
            PerfCounterState::Disabled => Err(PerfCounterError::NotEnabled),
            PerfCounterState::Triggered { .. } => Err(PerfCounterError::SampleInProgress),
            PerfCounterState::Enabled => {
                debug!("prfcnt: sample {trigger_id} requested");
                io.write32(GPU_COMMAND, GpuCommand::PrfcntSample as u32);
                self.state = PerfCounterState::Triggered { trigger_id };
                Ok(())
            }
        }
    }

    /// The GPU reported `PRFCNT_SAMPLE_COMPLETED`.
    pub fn sample_completed(&mut self) -> Option<SampleCompletion> {
        let PerfCounterState::Triggered { trigger_id } = self.state else {
            warn!("prfcnt: unexpected sample completion");
            return None;
        };
        self.state = PerfCounterState::Enabled;
        Some(SampleCompletion {
            connection: self.connection.clone(),
            trigger_id,
            result: 0,
        })
    }

    /// Stop counting and give the address slot back. A sample in flight is
    /// reported as aborted.
    pub fn disable(&mut self, io: &dyn RegisterIo) -> Option<SampleCompletion> {
        if self.state == PerfCounterState::Disabled {
            return None;
        }
        io.write32(PRFCNT_CONFIG, 0);
        let aborted = self.abandon_sample();
        self.state = PerfCounterState::Disabled;
        self.mapping = None;
        self.connection = Weak::new();
        info!("prfcnt: disabled");
        aborted
    }

    /// The GPU was reset: registers are lost, so reprogram them if the slot
    /// survived and abort any sample in flight.
    pub fn reset(&mut self, io: &dyn RegisterIo) -> Option<SampleCompletion> {
        let aborted = self.abandon_sample();
        let slot = match &self.mapping {
            Some(mapping) if !mapping.is_expired() => Some(mapping.slot_number()),
            _ => None,
        };
        match slot {
            Some(slot) => {
                self.program(io, slot);
                self.state = PerfCounterState::Enabled;
            }
            None if self.state != PerfCounterState::Disabled => {
                warn!("prfcnt: address slot lost in reset, disabling");
                self.state = PerfCounterState::Disabled;
                self.mapping = None;
                self.connection = Weak::new();
            }
            None => {}
        }
        aborted
    }

    fn abandon_sample(&mut self) -> Option<SampleCompletion> {
        let PerfCounterState::Triggered { trigger_id } = self.state else {
            return None;
        };
        self.state = PerfCounterState::Enabled;
        Some(SampleCompletion {
            connection: self.connection.clone(),
            trigger_id,
            result: SAMPLE_RESULT_ABORTED,
        })
    }
}
