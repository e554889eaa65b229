//! Kernel block device helpers: enumeration and resolution through lsblk
//! and blockdev, plus creation and removal of the published endpoint
//! nodes.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use snafu::ResultExt;
use tracing::info;

use crate::{
    error::{self, Error},
    executor::Executor,
};

const LSBLK_BINARY: &str = "lsblk";
const BLOCKDEV_BINARY: &str = "blockdev";

/// Kernel device nodes live here.
pub const DEV_DIR: &str = "/dev";

/// Endpoints are published here, one node per initiator name.
pub const ENDPOINT_DIR: &str = "/dev/blkbridge";

/// NSID the target assigns to the single namespace of a subsystem.
pub const DEFAULT_NAMESPACE_ID: u32 = 1;

/// Unlinking a wedged device node can hang in the kernel.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// A kernel block device as reported by lsblk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelDevice {
    pub name: String,
    pub major: u32,
    pub minor: u32,
}

/// The device pair an initiator manages: the attached nvme namespace and
/// the device actually exported at the endpoint (the dm device, or the
/// namespace itself when dm is skipped).
#[derive(Clone, Debug, Default)]
pub struct BridgedDevice {
    pub nvme: KernelDevice,
    pub export: KernelDevice,
}

/// Path of the endpoint node published for an initiator name.
pub fn endpoint_path(name: &str) -> PathBuf {
    Path::new(ENDPOINT_DIR).join(name)
}

/// /dev path of a kernel device name.
pub fn device_path(name: &str) -> PathBuf {
    Path::new(DEV_DIR).join(name)
}

/// Namespace device name of a controller: "nvme1" + nsid 1 -> "nvme1n1".
pub fn namespace_name(controller: &str, nsid: u32) -> String {
    format!("{}n{}", controller, nsid)
}

/// Controller name of a namespace device: "nvme1n1" -> "nvme1".
pub fn controller_name(namespace: &str) -> String {
    static TRAILING_NS: Lazy<Regex> = Lazy::new(|| Regex::new(r"n\d+$").unwrap());
    TRAILING_NS.replace(namespace, "").into_owned()
}

fn parse_majmin(field: &str) -> Option<(u32, u32)> {
    let (major, minor) = field.trim().split_once(':')?;
    Some((major.trim().parse().ok()?, minor.trim().parse().ok()?))
}

/// One "NAME MAJ:MIN" line of plain lsblk output.
fn parse_device_line(line: &str) -> Option<KernelDevice> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 2 {
        return None;
    }
    let (major, minor) = parse_majmin(fields[1])?;
    Some(KernelDevice {
        name: fields[0].to_string(),
        major,
        minor,
    })
}

/// Resolve the block device behind a path.
pub async fn detect_device(path: &Path, executor: &Executor) -> Result<KernelDevice, Error> {
    let path_str = path.display().to_string();
    let output = executor
        .execute(
            LSBLK_BINARY,
            ["-l", "-n", path_str.as_str(), "-o", "NAME,MAJ:MIN"],
        )
        .await?;

    output
        .lines()
        .next()
        .and_then(parse_device_line)
        .ok_or(Error::DeviceNotFound { path: path_str })
}

/// Enumerate every block device the host knows about.
pub async fn get_known_devices(
    executor: &Executor,
) -> Result<HashMap<String, KernelDevice>, Error> {
    let output = executor
        .execute(LSBLK_BINARY, ["-l", "-n", "-o", "NAME,MAJ:MIN"])
        .await?;

    Ok(output
        .lines()
        .filter_map(parse_device_line)
        .map(|device| (device.name.clone(), device))
        .collect())
}

#[derive(Debug, Deserialize)]
struct LsblkReport {
    blockdevices: Vec<LsblkEntry>,
}

#[derive(Debug, Deserialize)]
struct LsblkEntry {
    #[serde(rename = "maj:min")]
    maj_min: String,
}

fn parse_device_numbers(output: &str, path: &str) -> Result<(u32, u32), Error> {
    let report: LsblkReport =
        serde_json::from_str(output).context(error::JsonOutputSnafu {
            program: LSBLK_BINARY,
        })?;
    if report.blockdevices.len() != 1 {
        return error::OutputParseSnafu {
            program: LSBLK_BINARY,
            reason: format!(
                "expected exactly one device for {}, got {}",
                path,
                report.blockdevices.len()
            ),
        }
        .fail();
    }
    parse_majmin(&report.blockdevices[0].maj_min).ok_or_else(|| Error::OutputParse {
        program: LSBLK_BINARY.to_string(),
        reason: format!("invalid maj:min {}", report.blockdevices[0].maj_min),
    })
}

/// Major and minor numbers of the device behind a path.
pub async fn get_device_numbers(path: &Path, executor: &Executor) -> Result<(u32, u32), Error> {
    let path_str = path.display().to_string();
    let output = executor
        .execute(
            LSBLK_BINARY,
            ["-l", "-J", "-n", "-o", "MAJ:MIN", path_str.as_str()],
        )
        .await?;
    parse_device_numbers(&output, &path_str)
}

/// Size of the device in 512 byte sectors.
pub async fn get_device_sectors(path: &Path, executor: &Executor) -> Result<u64, Error> {
    let path_str = path.display().to_string();
    let output = executor
        .execute(BLOCKDEV_BINARY, ["--getsize", path_str.as_str()])
        .await?;
    output
        .trim()
        .parse()
        .map_err(|_| Error::OutputParse {
            program: BLOCKDEV_BINARY.to_string(),
            reason: format!("invalid sector count '{}' for {}", output.trim(), path_str),
        })
}

/// Publish `dev` at `dest`: a fresh block device node carrying the same
/// major and minor, mode 0660.
pub fn duplicate_device(dev: &KernelDevice, dest: &Path) -> Result<(), Error> {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};
    use std::os::unix::fs::PermissionsExt;

    if let Some(dir) = dest.parent() {
        std::fs::create_dir_all(dir).context(error::DeviceIoSnafu {
            op: "mkdir",
            path: dir.to_path_buf(),
        })?;
    }

    info!(
        "creating device node {} {}:{}",
        dest.display(),
        dev.major,
        dev.minor
    );
    mknod(
        dest,
        SFlag::S_IFBLK,
        Mode::from_bits_truncate(0o660),
        makedev(dev.major as u64, dev.minor as u64),
    )
    .context(error::MknodSnafu {
        path: dest.to_path_buf(),
    })?;

    std::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o660)).context(
        error::DeviceIoSnafu {
            op: "chmod",
            path: dest.to_path_buf(),
        },
    )?;
    Ok(())
}

/// Unlink a device node if it exists. The removal is bounded because an
/// unlink on a dead device node can hang in the kernel.
pub async fn remove_device(path: &Path) -> Result<(), Error> {
    if !path.exists() {
        return Ok(());
    }

    let target = path.to_path_buf();
    let unlink = tokio::task::spawn_blocking(move || std::fs::remove_file(&target));

    match tokio::time::timeout(REMOVE_TIMEOUT, unlink).await {
        Err(_) => error::RemoveTimeoutSnafu {
            path: path.to_path_buf(),
            timeout: REMOVE_TIMEOUT,
        }
        .fail(),
        Ok(joined) => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if err.kind() == ErrorKind::NotFound => Ok(()),
            Ok(Err(source)) => Err(Error::DeviceIo {
                op: "remove",
                path: path.to_path_buf(),
                source,
            }),
            Err(join_err) => Err(Error::DeviceIo {
                op: "remove",
                path: path.to_path_buf(),
                source: std::io::Error::new(ErrorKind::Other, join_err),
            }),
        },
    }
}

/// True when the path exists and is a block device node.
pub fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_block_device())
        .unwrap_or(false)
}
