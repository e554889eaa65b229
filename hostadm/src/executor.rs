//! Runs the host utilities, optionally entering another process's mount,
//! ipc and network namespaces first via nsenter. Every invocation runs
//! under a deadline with stdout and stderr captured, so a wedged utility
//! cannot wedge the caller.

use std::{
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use snafu::ResultExt;
use tokio::process::Command;
use tracing::trace;

use crate::error::{self, Error};

/// The namespace entering helper.
const NSENTER_BINARY: &str = "nsenter";

/// Default budget for one host utility invocation.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(60);

/// Executes host utilities, optionally inside the namespaces of pid 1 of
/// a given /proc tree. Built once per initiator and reused for every
/// invocation.
#[derive(Clone, Debug)]
pub struct Executor {
    /// Path to the ns directory of the process whose namespaces are
    /// entered, e.g. `/host/proc/1/ns`. `None` runs directly.
    ns: Option<PathBuf>,
}

impl Executor {
    /// Build an executor. With a host /proc path the nsenter helper and
    /// the target namespaces are validated up front so later failures mean
    /// the utility failed, not the plumbing.
    pub async fn new(host_proc: Option<&str>) -> Result<Executor, Error> {
        let executor = Executor {
            ns: host_proc.map(|proc_dir| PathBuf::from(proc_dir).join("1").join("ns")),
        };

        if let Some(ns) = &executor.ns {
            run(NSENTER_BINARY, vec!["-V".to_string()], DEFAULT_CMD_TIMEOUT).await?;
            run(
                NSENTER_BINARY,
                vec![
                    format!("--mount={}", ns.join("mnt").display()),
                    "mount".to_string(),
                ],
                DEFAULT_CMD_TIMEOUT,
            )
            .await?;
            run(
                NSENTER_BINARY,
                vec![
                    format!("--net={}", ns.join("net").display()),
                    "ip".to_string(),
                    "addr".to_string(),
                ],
                DEFAULT_CMD_TIMEOUT,
            )
            .await?;
        }

        Ok(executor)
    }

    /// Run a host utility with the default budget and return its stdout.
    pub async fn execute<I, S>(&self, program: &str, args: I) -> Result<String, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.execute_with_timeout(program, args, DEFAULT_CMD_TIMEOUT)
            .await
    }

    /// Run a host utility under the given budget; the child is killed on
    /// expiry.
    pub async fn execute_with_timeout<I, S>(
        &self,
        program: &str,
        args: I,
        timeout: Duration,
    ) -> Result<String, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        match &self.ns {
            None => run(program, args, timeout).await,
            Some(ns) => {
                let mut full = vec![
                    format!("--mount={}", ns.join("mnt").display()),
                    format!("--net={}", ns.join("net").display()),
                    format!("--ipc={}", ns.join("ipc").display()),
                    program.to_string(),
                ];
                full.extend(args);
                run(NSENTER_BINARY, full, timeout).await
            }
        }
    }
}

async fn run(program: &str, args: Vec<String>, timeout: Duration) -> Result<String, Error> {
    trace!("running {} {:?}", program, args);

    let mut command = Command::new(program);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().context(error::CommandSpawnSnafu { program })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        // Dropping the wait future kills the child.
        Err(_) => {
            return error::CommandTimeoutSnafu {
                program,
                args,
                timeout,
            }
            .fail()
        }
        Ok(output) => output.context(error::CommandSpawnSnafu { program })?,
    };

    if !output.status.success() {
        return error::CommandFailedSnafu {
            program,
            args,
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
        .fail();
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
