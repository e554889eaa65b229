//! Errors encountered whilst driving the host utilities and the initiator
//! lifecycle.

use std::{path::PathBuf, process::ExitStatus, time::Duration};

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to spawn {program}: {source}"))]
    CommandSpawn {
        program: String,
        source: std::io::Error,
    },

    #[snafu(display(
        "{program} {args:?} failed with {status}: stdout {stdout}, stderr {stderr}"
    ))]
    CommandFailed {
        program: String,
        args: Vec<String>,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    #[snafu(display("timeout {timeout:?} executing {program} {args:?}"))]
    CommandTimeout {
        program: String,
        args: Vec<String>,
        timeout: Duration,
    },

    #[snafu(display("unexpected {program} output: {reason}"))]
    OutputParse { program: String, reason: String },

    #[snafu(display("failed to decode {program} json output: {source}"))]
    JsonOutput {
        program: String,
        source: serde_json::Error,
    },

    #[snafu(display(
        "cannot find a valid nvme device with subsystem NQN {nqn} and address {traddr}:{trsvcid}"
    ))]
    ValidNvmeDeviceNotFound {
        nqn: String,
        traddr: String,
        trsvcid: String,
    },

    #[snafu(display("subsystem {nqn} controller {controller} is not live, state {state}"))]
    ControllerNotLive {
        nqn: String,
        controller: String,
        state: String,
    },

    #[snafu(display("found empty subsystem NQN after discovering {traddr}:{trsvcid}"))]
    DiscoveryEmpty { traddr: String, trsvcid: String },

    #[snafu(display("found zero or multiple nvme devices for initiator {name}"))]
    DeviceCountMismatch { name: String },

    #[snafu(display("found zero or multiple namespaces for initiator {name}"))]
    NamespaceCountMismatch { name: String },

    #[snafu(display(
        "detected controller {found} does not match the recorded {recorded} for initiator {name}"
    ))]
    ControllerMismatch {
        name: String,
        found: String,
        recorded: String,
    },

    #[snafu(display(
        "namespace {device} is missing from the dependents of endpoint {endpoint} for initiator {name}"
    ))]
    NamespaceMismatch {
        name: String,
        device: String,
        endpoint: String,
    },

    #[snafu(display("initiator {name} already exists in this process"))]
    InitiatorExists { name: String },

    #[snafu(display("empty name or subsystem NQN for initiator creation"))]
    InitiatorParams {},

    #[snafu(display("invalid transport address {traddr}:{trsvcid} for initiator {name}"))]
    InvalidTransportAddress {
        name: String,
        traddr: String,
        trsvcid: String,
    },

    #[snafu(display("no attached namespace device for initiator {name}"))]
    NoBackingDevice { name: String },

    #[snafu(display("found no block device for {path}"))]
    DeviceNotFound { path: String },

    #[snafu(display("failed to validate block device {path:?} creation"))]
    DeviceValidation { path: PathBuf },

    #[snafu(display("timeout {timeout:?} removing {path:?}"))]
    RemoveTimeout { path: PathBuf, timeout: Duration },

    #[snafu(display("failed to {op} {path:?}: {source}"))]
    DeviceIo {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to create device node {path:?}: {source}"))]
    Mknod { path: PathBuf, source: nix::Error },

    #[snafu(display("dm device {name} not found"))]
    DmDeviceNotFound { name: String },

    #[snafu(display("failed to open lock file {path:?}: {source}"))]
    LockOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to lock {path:?}: {source}"))]
    LockAcquire { path: PathBuf, source: nix::Error },

    #[snafu(display("failed to lock {path:?} within {timeout:?}"))]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[snafu(display(
        "failed to connect initiator {name} within {retries} retries: {source}"
    ))]
    ConnectRetriesExhausted {
        name: String,
        retries: u32,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display(
        "failed to load device info after starting initiator {name}: {source}"
    ))]
    WaitDevice {
        name: String,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("subsystem {nqn} is still connected after {retries} retries"))]
    StillConnected { nqn: String, retries: u32 },

    #[snafu(display("failed to disconnect target for initiator {name}: {source}"))]
    Disconnect {
        name: String,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("failed to start nvme initiator {name}: {source}"))]
    StartFailed {
        name: String,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
}

impl Error {
    /// True when a dmsetup invocation failed because the device is held
    /// open. Callers decide whether busy is fatal; nobody outside this
    /// module matches on the stderr text.
    pub fn is_dm_device_busy(&self) -> bool {
        match self {
            Error::CommandFailed { stderr, .. } => stderr.contains("Device or resource busy"),
            Error::StartFailed { source, .. } => source.is_dm_device_busy(),
            _ => false,
        }
    }

    /// True when device enumeration found nothing valid for the requested
    /// subsystem NQN and address. This is how "disconnected" is recognized.
    pub fn is_valid_nvme_device_not_found(&self) -> bool {
        match self {
            Error::ValidNvmeDeviceNotFound { .. } => true,
            Error::StartFailed { source, .. } => source.is_valid_nvme_device_not_found(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn dm_busy_recognition() {
        let err = Error::CommandFailed {
            program: "dmsetup".into(),
            args: vec!["remove".into(), "vol-1".into()],
            status: ExitStatus::from_raw(256),
            stdout: String::new(),
            stderr: "device-mapper: remove ioctl on vol-1  failed: Device or resource busy"
                .into(),
        };
        assert!(err.is_dm_device_busy());

        let err = Error::CommandFailed {
            program: "dmsetup".into(),
            args: vec!["remove".into(), "vol-1".into()],
            status: ExitStatus::from_raw(256),
            stdout: String::new(),
            stderr: "No such device or address".into(),
        };
        assert!(!err.is_dm_device_busy());
    }

    #[test]
    fn not_found_recognition() {
        let err = Error::ValidNvmeDeviceNotFound {
            nqn: "nqn.2023-01.io.blkbridge:vol-1".into(),
            traddr: "127.0.0.1".into(),
            trsvcid: "4420".into(),
        };
        assert!(err.is_valid_nvme_device_not_found());
        assert!(!err.is_dm_device_busy());
    }
}
