#![cfg_attr(not(feature = "std"), no_std)]

// TEAM_515: HAL crate for the Mali driver core.
// Root holds the platform seams (register access, bus mapping, interrupts)
// and the GPU register map. Host-side fakes live behind the `std` feature.

extern crate alloc;

pub mod regs;
pub mod traits;

#[cfg(feature = "std")]
pub mod fake;

pub use regs::{RegisterIo, RegisterIoExt};
pub use traits::{BusMapper, BusMapping, BusUnpin, InterruptSource, PageAllocator, TablePage};

use mali_error::define_kernel_error;

/// GPU page size: 4KB
pub const PAGE_SIZE: u64 = 4096;
/// Page shift (log2 of page size)
pub const PAGE_SHIFT: u32 = 12;

define_kernel_error! {
    /// Errors reported by platform services.
    pub enum HalError(0x01, "hal") {
        /// Pinning buffer pages for DMA failed
        BusMapFailed = 0x01 => "Bus mapping failed",
        /// No physical pages left
        OutOfPages = 0x02 => "Out of physical pages",
        /// Interrupt object was closed while waiting
        InterruptCanceled = 0x03 => "Interrupt wait canceled",
        /// Hardware did not reach the expected state in time
        RegisterTimeout = 0x04 => "Register poll timed out",
        /// Page range outside the buffer
        OutOfRange = 0x05 => "Page range outside buffer",
    }
}

/// Round `value` up to the next page boundary.
#[inline]
pub const fn page_round_up(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn test_page_helpers() {
        assert_eq!(page_round_up(0), 0);
        assert_eq!(page_round_up(1), PAGE_SIZE);
        assert_eq!(page_round_up(PAGE_SIZE), PAGE_SIZE);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3001));
        assert_eq!(1u64 << PAGE_SHIFT, PAGE_SIZE);
    }

    #[test]
    fn test_hal_error_codes() {
        assert_eq!(HalError::BusMapFailed.code(), 0x0101);
        assert_eq!(HalError::TAG, "hal");
    }
}
