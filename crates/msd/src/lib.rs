// TEAM_516: Mali GPU driver core.
// One device thread owns the job scheduler and all hardware-mutating
// decisions; client threads submit work through connections and the `abi`
// handle layer. Platform access goes through the `mali_hal` seams, so the
// whole core runs against fakes in tests.

pub mod abi;
pub mod address_manager;
pub mod address_space;
pub mod atom;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod device;
pub mod device_request;
pub mod gpu_mapping;
pub mod jit;
pub mod job_scheduler;
pub mod logger;
pub mod performance_counters;
pub mod semaphore;

#[cfg(test)]
mod test_support;

pub use abi::{AbiError, Driver};
pub use address_manager::{AddressManager, SlotError};
pub use address_space::{AccessFlags, AddressSpace, MmuError};
pub use atom::{Atom, AtomFlags, AtomInfo, DependencyKind, ResultCode};
pub use buffer::Buffer;
pub use config::{ConfigError, DriverConfig};
pub use connection::{AtomError, AtomSubmission, Connection, Notification, NotificationHandler};
pub use device::{Device, DeviceError, DevicePlatform};
pub use gpu_mapping::{GpuMapping, MappingError};
pub use jit::JitError;
pub use job_scheduler::JobScheduler;
pub use semaphore::Semaphore;
