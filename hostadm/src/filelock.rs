//! Cross-process exclusion for kernel-state mutations. Every operation
//! that mutates NVMe or device-mapper state takes this lock for its whole
//! duration, so concurrent managers cannot interleave a disconnect with a
//! connect on the same subsystem.

use std::{
    fs::{File, OpenOptions},
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::Path,
    time::Duration,
};

use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use snafu::ResultExt;
use tokio::time::{sleep, Instant};

use crate::error::{self, Error};

/// Well known lock file shared by every manager on the host.
pub const LOCK_FILE: &str = "/var/run/blkbridge.lock";

/// Budget for acquiring the lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(120);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// An exclusive flock on a well known file. The kernel releases it when
/// the file is closed, so dropping the guard unlocks.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Acquire the exclusive lock, polling within the timeout budget.
    pub async fn acquire<P: AsRef<Path>>(path: P, timeout: Duration) -> Result<FileLock, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(path)
            .context(error::LockOpenSnafu {
                path: path.to_path_buf(),
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => return Ok(FileLock { _file: file }),
                Err(Errno::EWOULDBLOCK) => {}
                Err(source) => {
                    return Err(source).context(error::LockAcquireSnafu {
                        path: path.to_path_buf(),
                    })
                }
            }
            if Instant::now() >= deadline {
                return error::LockTimeoutSnafu {
                    path: path.to_path_buf(),
                    timeout,
                }
                .fail();
            }
            sleep(LOCK_RETRY_INTERVAL).await;
        }
    }
}
