//! hostadm drives the host kernel side of blkbridge: it attaches remote
//! NVMe-oF namespaces exposed by the storage target, wraps them in a
//! linear device-mapper target and publishes a stable endpoint node that
//! can be retargeted while a consumer holds it open.
//!
//! Everything goes through the host utilities (`nvme`, `dmsetup`, `lsblk`,
//! `blockdev`), optionally executed inside another process's namespaces,
//! and is serialized against other management processes with a well known
//! file lock.

pub mod device;
pub mod dmsetup;
pub mod error;
pub mod executor;
pub mod filelock;
pub mod initiator;
pub mod nvme;

pub use error::Error;
pub use executor::Executor;
pub use initiator::Initiator;
