//! Thin wrappers over the dmsetup utility for the linear mapping an
//! initiator publishes: create, reload, suspend, resume, remove, deps and
//! info.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use strum_macros::AsRefStr;

use crate::{
    error::Error,
    executor::Executor,
};

const DMSETUP_BINARY: &str = "dmsetup";

/// Mapper nodes appear under this directory.
pub const DM_DIR: &str = "/dev/mapper";

/// The dmsetup verbs this module drives.
#[derive(AsRefStr)]
#[strum(serialize_all = "lowercase")]
enum DmSubCmd {
    Create,
    Reload,
    Suspend,
    Resume,
    Remove,
    Deps,
    Info,
}

/// State of one device-mapper device as reported by `dmsetup info`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DmDeviceInfo {
    pub name: String,
    pub block_dev_name: String,
    pub major: u32,
    pub minor: u32,
    pub suspended: bool,
    pub read_only: bool,
    pub table_live: bool,
    pub table_inactive: bool,
}

/// Mapper node path of a dm device name.
pub fn device_path(name: &str) -> PathBuf {
    Path::new(DM_DIR).join(name)
}

/// Single segment table mapping the whole backing device 1:1.
pub fn linear_table(sectors: u64, backing_path: &Path) -> String {
    format!("0 {} linear {} 0", sectors, backing_path.display())
}

/// Create a dm device with the given table.
pub async fn create(name: &str, table: &str, executor: &Executor) -> Result<(), Error> {
    executor
        .execute(
            DMSETUP_BINARY,
            [DmSubCmd::Create.as_ref(), name, "--table", table],
        )
        .await
        .map(|_| ())
}

/// Load a new table as the inactive slot of an existing dm device. It
/// becomes live on the next resume.
pub async fn reload(name: &str, table: &str, executor: &Executor) -> Result<(), Error> {
    executor
        .execute(
            DMSETUP_BINARY,
            [DmSubCmd::Reload.as_ref(), name, "--table", table],
        )
        .await
        .map(|_| ())
}

/// Suspend the dm device, holding new I/O in the kernel. Without
/// `noflush` in-flight writes drain first; without `nolockfs` a mounted
/// filesystem is quiesced too.
pub async fn suspend(
    name: &str,
    noflush: bool,
    nolockfs: bool,
    executor: &Executor,
) -> Result<(), Error> {
    let mut args = vec![DmSubCmd::Suspend.as_ref().to_string()];
    if noflush {
        args.push("--noflush".to_string());
    }
    if nolockfs {
        args.push("--nolockfs".to_string());
    }
    args.push(name.to_string());

    executor.execute(DMSETUP_BINARY, args).await.map(|_| ())
}

/// Resume a suspended dm device, swapping in the inactive table if one
/// was loaded.
pub async fn resume(name: &str, executor: &Executor) -> Result<(), Error> {
    executor
        .execute(DMSETUP_BINARY, [DmSubCmd::Resume.as_ref(), name])
        .await
        .map(|_| ())
}

/// Remove a dm device.
pub async fn remove(
    name: &str,
    force: bool,
    deferred: bool,
    executor: &Executor,
) -> Result<(), Error> {
    let mut args = vec![DmSubCmd::Remove.as_ref().to_string()];
    if force {
        args.push("--force".to_string());
    }
    if deferred {
        args.push("--deferred".to_string());
    }
    args.push(name.to_string());

    executor.execute(DMSETUP_BINARY, args).await.map(|_| ())
}

/// Kernel device names the dm device depends on.
pub async fn deps(name: &str, executor: &Executor) -> Result<Vec<String>, Error> {
    let output = executor
        .execute(
            DMSETUP_BINARY,
            [DmSubCmd::Deps.as_ref(), "-o", "blkdevname", name],
        )
        .await?;
    Ok(parse_deps(&output))
}

/// "1 dependencies  : (nvme1n1)" -> the parenthesised device names.
fn parse_deps(output: &str) -> Vec<String> {
    static DEP_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(([^)]+)\)").unwrap());
    DEP_NAME
        .captures_iter(output)
        .map(|capture| capture[1].to_string())
        .collect()
}

/// Columns view of the named dm device (or of all devices when dmsetup is
/// given a pattern).
pub async fn info(name: &str, executor: &Executor) -> Result<Vec<DmDeviceInfo>, Error> {
    let output = executor
        .execute(
            DMSETUP_BINARY,
            [
                DmSubCmd::Info.as_ref(),
                "-c",
                "--noheadings",
                "-o",
                "name,blkdevname,attr,major,minor",
                "--separator",
                " ",
                name,
            ],
        )
        .await?;
    Ok(output.lines().filter_map(parse_info_line).collect())
}

/// The single place the `dmsetup info -c` attr column is interpreted; if
/// the utility changes its format this is the function to fix.
fn parse_info_line(line: &str) -> Option<DmDeviceInfo> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 5 {
        return None;
    }
    let attrs = fields[2];
    Some(DmDeviceInfo {
        name: fields[0].to_string(),
        block_dev_name: fields[1].to_string(),
        major: fields[3].parse().ok()?,
        minor: fields[4].parse().ok()?,
        suspended: attrs.contains('s'),
        read_only: attrs.contains('r'),
        table_live: attrs.contains('L'),
        table_inactive: attrs.contains('I'),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_table_shape() {
        assert_eq!(
            linear_table(2097152, Path::new("/dev/nvme1n1")),
            "0 2097152 linear /dev/nvme1n1 0"
        );
    }

    #[test]
    fn deps_output() {
        assert_eq!(
            parse_deps("1 dependencies  : (nvme1n1)\n"),
            vec!["nvme1n1".to_string()]
        );
        assert_eq!(
            parse_deps("2 dependencies  : (sdb) (sdc)\n"),
            vec!["sdb".to_string(), "sdc".to_string()]
        );
        assert!(parse_deps("0 dependencies  :\n").is_empty());
    }

    #[test]
    fn info_lines() {
        let live = parse_info_line("vol-1 dm-0 L--w 253 0").unwrap();
        assert_eq!(live.name, "vol-1");
        assert_eq!(live.block_dev_name, "dm-0");
        assert_eq!((live.major, live.minor), (253, 0));
        assert!(live.table_live);
        assert!(!live.suspended);
        assert!(!live.read_only);

        let suspended = parse_info_line("vol-2 dm-1 Ls-w 253 1").unwrap();
        assert!(suspended.suspended);
        assert!(suspended.table_live);

        assert!(parse_info_line("No devices found").is_none());
        assert!(parse_info_line("").is_none());
    }
}
