use std::{process::Stdio, time::Duration};

use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to launch {script}: {source}")]
    Spawn {
        script: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{script} exited with status {code:?}: {output}")]
    Exit {
        script: String,
        code: Option<i32>,
        output: String,
    },
    #[error("{script} did not finish within {timeout:?}")]
    Timeout { script: String, timeout: Duration },
}

/// Runs `script old_host new_host` and returns its combined output.
///
/// The child is killed if it outlives `timeout`.
pub async fn run_script(
    script: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, HookError> {
    let child = Command::new(script)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| HookError::Spawn {
            script: script.to_string(),
            source,
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| HookError::Spawn {
            script: script.to_string(),
            source,
        })?,
        Err(_) => {
            return Err(HookError::Timeout {
                script: script.to_string(),
                timeout,
            })
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let combined = combined.trim().to_string();

    if output.status.success() {
        Ok(combined)
    } else {
        Err(HookError::Exit {
            script: script.to_string(),
            code: output.status.code(),
            output: combined,
        })
    }
}

/// Runs an optional failover hook. Failures are logged and returned to the
/// caller, which records them without aborting the protocol.
pub async fn run_failover_hook(
    label: &str,
    script: Option<&str>,
    old_host: &str,
    new_host: &str,
    timeout: Duration,
) -> Result<(), HookError> {
    let Some(script) = script.filter(|script| !script.trim().is_empty()) else {
        return Ok(());
    };
    info!(hook = label, script, old_host, new_host, "calling failover script");
    match run_script(script, &[old_host, new_host], timeout).await {
        Ok(output) => {
            info!(hook = label, %output, "failover script complete");
            Ok(())
        }
        Err(error) => {
            warn!(hook = label, %error, "failover script failed");
            Err(error)
        }
    }
}
