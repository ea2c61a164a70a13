//! TEAM_512: Driver error handling infrastructure.
//!
//! Provides the `define_kernel_error!` macro used by every subsystem of the
//! driver core so that errors carry a stable numeric code (for client status
//! reporting and hang dumps) and a short subsystem tag for log lines.
//!
//! ## Usage
//!
//! ### Simple errors (no inner data)
//! ```ignore
//! define_kernel_error! {
//!     pub enum SlotError(0x03, "slot") {
//!         Timeout = 0x01 => "Timed out waiting for a free address slot",
//!         ConnectionGone = 0x02 => "Connection destroyed before slot assignment",
//!     }
//! }
//! ```
//!
//! ### Nested errors (with inner error type)
//! ```ignore
//! define_kernel_error! {
//!     pub enum MappingError(0x05, "mapping") {
//!         PageTable(MmuError) = 0x01 => "Page table update failed",
//!     }
//! }
//! ```

#![no_std]

/// Macro to define a subsystem error type with consistent handling.
///
/// Supports both simple variants and nested variants containing inner errors.
#[macro_export]
macro_rules! define_kernel_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal, $tag:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal => $desc:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            /// Subsystem identifier for this error type.
            pub const SUBSYSTEM: u8 = $subsystem;

            /// Short subsystem tag used as a log prefix.
            pub const TAG: &'static str = $tag;

            /// Numeric error code: subsystem in the high byte.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? _unused) => {
                            (($subsystem as u16) << 8) | $code
                        }
                    )*
                }
            }

            /// Error description for logging.
            pub const fn name(&self) -> &'static str {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? _unused) => {
                            $desc
                        }
                    )*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_kernel_error!(@display_body self f $desc $(($inner))? inner)
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {}

        impl From<$name> for u16 {
            fn from(err: $name) -> u16 {
                err.code()
            }
        }
    };

    // Helper to generate patterns
    (@pattern $variant:ident ($inner:ty) $bind:ident) => { Self::$variant($bind) };
    (@pattern $variant:ident $bind:ident) => { Self::$variant };

    // Helper to generate display bodies
    (@display_body $self:ident $f:ident $desc:literal ($inner:ty) $bind:ident) => {
        write!($f, "E{:04X}: {} ({})", $self.code(), $desc, $bind)
    };
    (@display_body $self:ident $f:ident $desc:literal $bind:ident) => {
        write!($f, "E{:04X}: {}", $self.code(), $desc)
    };
}

#[cfg(test)]
mod tests {

    define_kernel_error! {
        /// Test error type
        pub enum FaultError(0xF0, "fault") {
            /// Translation fault
            Translation = 0x01 => "Translation fault",
            /// Permission fault
            Permission = 0x02 => "Permission fault",
        }
    }

    define_kernel_error! {
        pub enum RecoveryError(0xF1, "recovery") {
            Fault(FaultError) = 0x01 => "Recovery aborted",
            Exhausted = 0x02 => "Recovery attempts exhausted",
        }
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(FaultError::Translation.code(), 0xF001);
        assert_eq!(FaultError::Permission.code(), 0xF002);
        assert_eq!(RecoveryError::Fault(FaultError::Permission).code(), 0xF101);
        assert_eq!(RecoveryError::Exhausted.code(), 0xF102);
    }

    #[test]
    fn test_error_names_and_tags() {
        assert_eq!(FaultError::Translation.name(), "Translation fault");
        assert_eq!(
            RecoveryError::Fault(FaultError::Translation).name(),
            "Recovery aborted"
        );
        assert_eq!(FaultError::TAG, "fault");
        assert_eq!(RecoveryError::TAG, "recovery");
    }

    #[test]
    fn test_display_format() {
        extern crate std;
        use std::format;
        assert_eq!(format!("{}", FaultError::Permission), "EF002: Permission fault");
        assert_eq!(
            format!("{}", RecoveryError::Fault(FaultError::Translation)),
            "EF101: Recovery aborted (EF001: Translation fault)"
        );
    }

    #[test]
    fn test_code_conversion() {
        let status: u16 = RecoveryError::Exhausted.into();
        assert_eq!(status, 0xF102);
        assert_eq!(FaultError::SUBSYSTEM, 0xF0);
    }
}
