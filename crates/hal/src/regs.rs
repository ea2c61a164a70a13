//! GPU register map and typed MMIO access.
//!
//! TEAM_515: The hardware only supports 32-bit MMIO. 64-bit registers are
//! exposed as LO/HI pairs and accessed low word first through
//! [`RegisterIoExt`], so callers never issue a 64-bit access.

use bitflags::bitflags;

/// Raw 32-bit register access to the GPU's MMIO window.
pub trait RegisterIo: Send + Sync {
    /// Read a 32-bit register at `offset` bytes into the window.
    fn read32(&self, offset: u32) -> u32;
    /// Write a 32-bit register at `offset` bytes into the window.
    fn write32(&self, offset: u32, value: u32);
}

/// 64-bit helpers built on two little-endian 32-bit accesses.
pub trait RegisterIoExt {
    fn read64(&self, lo_offset: u32) -> u64;
    fn write64(&self, lo_offset: u32, value: u64);
}

impl<T: RegisterIo + ?Sized> RegisterIoExt for T {
    fn read64(&self, lo_offset: u32) -> u64 {
        let lo = u64::from(self.read32(lo_offset));
        let hi = u64::from(self.read32(lo_offset + 4));
        (hi << 32) | lo
    }

    fn write64(&self, lo_offset: u32, value: u64) {
        self.write32(lo_offset, value as u32);
        self.write32(lo_offset + 4, (value >> 32) as u32);
    }
}

// ============================================================================
// GPU control block
// ============================================================================

pub const GPU_ID: u32 = 0x000;
pub const AS_PRESENT: u32 = 0x018;
pub const JS_PRESENT: u32 = 0x01C;
pub const GPU_IRQ_RAWSTAT: u32 = 0x020;
pub const GPU_IRQ_CLEAR: u32 = 0x024;
pub const GPU_IRQ_MASK: u32 = 0x028;
pub const GPU_IRQ_STATUS: u32 = 0x02C;
pub const GPU_COMMAND: u32 = 0x030;
pub const GPU_STATUS: u32 = 0x034;
pub const GPU_FAULTSTATUS: u32 = 0x03C;
pub const GPU_FAULTADDRESS_LO: u32 = 0x040;
pub const PRFCNT_BASE_LO: u32 = 0x060;
pub const PRFCNT_CONFIG: u32 = 0x068;
pub const PRFCNT_JM_EN: u32 = 0x06C;
pub const PRFCNT_SHADER_EN: u32 = 0x070;
pub const PRFCNT_TILER_EN: u32 = 0x074;
pub const PRFCNT_MMU_L2_EN: u32 = 0x07C;
pub const CYCLE_COUNT_LO: u32 = 0x090;
pub const TIMESTAMP_LO: u32 = 0x098;

/// Values written to `GPU_COMMAND`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum GpuCommand {
    Nop = 0,
    SoftReset = 1,
    HardReset = 2,
    PrfcntClear = 3,
    PrfcntSample = 4,
    CycleCountStart = 5,
    CycleCountStop = 6,
    CleanCaches = 7,
    CleanInvCaches = 8,
    SetProtectedMode = 9,
}

bitflags! {
    /// GPU IRQ bits (`GPU_IRQ_*`).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GpuIrq: u32 {
        const GPU_FAULT               = 1 << 0;
        const MULTIPLE_GPU_FAULTS     = 1 << 7;
        const RESET_COMPLETED         = 1 << 8;
        const POWER_CHANGED_SINGLE    = 1 << 9;
        const POWER_CHANGED_ALL       = 1 << 10;
        const PRFCNT_SAMPLE_COMPLETED = 1 << 16;
        const CLEAN_CACHES_COMPLETED  = 1 << 17;
    }
}

bitflags! {
    /// `GPU_STATUS` bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GpuStatus: u32 {
        const ACTIVE                = 1 << 0;
        const PROTECTED_MODE_ACTIVE = 1 << 7;
    }
}

// ============================================================================
// Job control block
// ============================================================================

pub const JOB_IRQ_RAWSTAT: u32 = 0x1000;
pub const JOB_IRQ_CLEAR: u32 = 0x1004;
pub const JOB_IRQ_MASK: u32 = 0x1008;
pub const JOB_IRQ_STATUS: u32 = 0x100C;
pub const JOB_IRQ_JS_STATE: u32 = 0x1010;

const JOB_SLOT_BASE: u32 = 0x1800;
const JOB_SLOT_STRIDE: u32 = 0x80;

/// Bit in `JOB_IRQ_*` signalling that `slot` finished.
#[inline]
pub const fn job_irq_done(slot: u32) -> u32 {
    1 << slot
}

/// Bit in `JOB_IRQ_*` signalling that `slot` failed.
#[inline]
pub const fn job_irq_failed(slot: u32) -> u32 {
    1 << (slot + 16)
}

/// Values written to `JS_COMMAND` / `JS_COMMAND_NEXT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum JobSlotCommand {
    Nop = 0,
    Start = 1,
    SoftStop = 2,
    HardStop = 3,
}

bitflags! {
    /// `JS_CONFIG` bits. The address space number lives in bits [3:0].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct JobSlotConfig: u32 {
        const START_FLUSH_CLEAN = 1 << 8;
        const START_FLUSH_INV   = 1 << 9;
        const END_FLUSH_CLEAN   = 1 << 12;
        const END_FLUSH_INV     = 1 << 13;
        const JOB_CHAIN_FLAG    = 1 << 16;
    }
}

/// Register bank of one job slot.
#[derive(Clone, Copy, Debug)]
pub struct JobSlotRegisters {
    base: u32,
}

impl JobSlotRegisters {
    pub const fn new(slot: u32) -> Self {
        Self {
            base: JOB_SLOT_BASE + slot * JOB_SLOT_STRIDE,
        }
    }

    pub const fn head(&self) -> u32 {
        self.base
    }
    pub const fn tail(&self) -> u32 {
        self.base + 0x08
    }
    pub const fn status(&self) -> u32 {
        self.base + 0x24
    }
    pub const fn command(&self) -> u32 {
        self.base + 0x20
    }
    pub const fn head_next(&self) -> u32 {
        self.base + 0x40
    }
    pub const fn affinity_next(&self) -> u32 {
        self.base + 0x50
    }
    pub const fn config_next(&self) -> u32 {
        self.base + 0x58
    }
    pub const fn command_next(&self) -> u32 {
        self.base + 0x60
    }
}

// ============================================================================
// MMU block
// ============================================================================

pub const MMU_IRQ_RAWSTAT: u32 = 0x2000;
pub const MMU_IRQ_CLEAR: u32 = 0x2004;
pub const MMU_IRQ_MASK: u32 = 0x2008;
pub const MMU_IRQ_STATUS: u32 = 0x200C;

const AS_BASE: u32 = 0x2400;
const AS_STRIDE: u32 = 0x40;

/// Values written to `AS_COMMAND`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AsCommand {
    Nop = 0,
    Update = 1,
    Lock = 2,
    Unlock = 3,
    FlushPageTables = 4,
    FlushMem = 5,
}

bitflags! {
    /// `AS_STATUS` bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AsStatus: u32 {
        const ACTIVE = 1 << 0;
    }
}

bitflags! {
    /// LPAE translation-table register mode bits (`AS_TRANSTAB`).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TranslationTableFlags: u64 {
        const ADRMODE_UNMAPPED = 0b01;
        const ADRMODE_IDENTITY = 0b10;
        const ADRMODE_TABLE    = 0b11;
        const READ_INNER       = 1 << 2;
        const SHARE_OUTER      = 1 << 4;
    }
}

/// Memory attributes: index 0 normal write-back, index 1 outer write-alloc.
pub const MMU_MEMATTR_DEFAULT: u64 = 0x8888_8888_8888_8D88;

/// Smallest lockable region is 32KB (log2 = 15).
pub const MMU_LOCK_REGION_MIN_LOG2: u32 = 15;

/// Register bank of one MMU address space slot.
#[derive(Clone, Copy, Debug)]
pub struct AddressSpaceRegisters {
    base: u32,
}

impl AddressSpaceRegisters {
    pub const fn new(slot: u32) -> Self {
        Self {
            base: AS_BASE + slot * AS_STRIDE,
        }
    }

    pub const fn transtab(&self) -> u32 {
        self.base
    }
    pub const fn memattr(&self) -> u32 {
        self.base + 0x08
    }
    pub const fn lockaddr(&self) -> u32 {
        self.base + 0x10
    }
    pub const fn command(&self) -> u32 {
        self.base + 0x18
    }
    pub const fn fault_status(&self) -> u32 {
        self.base + 0x1C
    }
    pub const fn fault_address(&self) -> u32 {
        self.base + 0x20
    }
    pub const fn status(&self) -> u32 {
        self.base + 0x28
    }
}

/// Encode a lock region covering `[start, start + length)`.
///
/// The hardware locks a naturally aligned power-of-two region, so the width
/// grows until the aligned base plus size covers the whole range.
pub fn encode_lock_region(start: u64, length: u64) -> u64 {
    let end = start.saturating_add(length.max(1));
    let mut log2 = MMU_LOCK_REGION_MIN_LOG2;
    while log2 < 63 {
        let size = 1u64 << log2;
        let base = start & !(size - 1);
        if base.saturating_add(size) >= end {
            return base | u64::from(log2 - 1);
        }
        log2 += 1;
    }
    u64::from(log2 - 1)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::fake::FakeRegisterIo;

    #[test]
    fn test_64bit_access_is_split_low_first() {
        let io = FakeRegisterIo::new();
        io.write64(0x2400, 0x1122_3344_5566_7788);
        assert_eq!(io.read32(0x2400), 0x5566_7788);
        assert_eq!(io.read32(0x2404), 0x1122_3344);
        assert_eq!(io.read64(0x2400), 0x1122_3344_5566_7788);

        let writes = io.writes();
        assert_eq!(writes[0], (0x2400, 0x5566_7788));
        assert_eq!(writes[1], (0x2404, 0x1122_3344));
    }

    #[test]
    fn test_slot_register_offsets() {
        let as2 = AddressSpaceRegisters::new(2);
        assert_eq!(as2.transtab(), 0x2480);
        assert_eq!(as2.command(), 0x2498);
        assert_eq!(as2.status(), 0x24A8);

        let js1 = JobSlotRegisters::new(1);
        assert_eq!(js1.head(), 0x1880);
        assert_eq!(js1.command_next(), 0x18E0);
        assert_eq!(job_irq_failed(1), 1 << 17);
    }

    #[test]
    fn test_lock_region_encoding() {
        // Small range rounds up to the 32KB minimum.
        assert_eq!(encode_lock_region(0x1000, 0x1000), 14);
        // Range straddling a 32KB boundary needs a wider lock.
        let encoded = encode_lock_region(0x7000, 0x2000);
        assert_eq!(encoded & 0x3F, 15);
        assert_eq!(encoded & !0x3F, 0);
    }
}
