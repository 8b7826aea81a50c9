use std::time::Duration;

use memscope_lib::{process::find_process_id, ProcessAccess, ProcessError, ProcessHandle};
use tracing::{debug, info};

use crate::cli::Target;

pub mod cli;
pub mod commands;
pub mod logging;
pub mod models;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Opens the target process with `access`, polling by name when `--wait` is set.
pub async fn attach(target: &Target, access: ProcessAccess) -> anyhow::Result<ProcessHandle> {
    let pid = match (&target.name, target.pid) {
        (Some(name), _) => find_pid(name, target.wait).await?,
        (None, Some(pid)) => pid,
        (None, None) => std::process::id(),
    };

    let handle = ProcessHandle::open(pid, access)?;
    info!(pid, "attached");

    Ok(handle)
}

async fn find_pid(name: &str, wait: bool) -> anyhow::Result<u32> {
    if wait {
        info!(name, "waiting for process to start... (press ctrl+c to exit)");
    }

    loop {
        match find_process_id(name) {
            Ok(pid) => {
                info!(name, pid, "found process");
                return Ok(pid);
            }
            Err(ProcessError::NotFound(_)) if wait => {
                debug!(name, "process not found, retrying...");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
