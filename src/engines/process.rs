//! Child process plumbing shared by engine adapters
//!
//! Children are spawned with piped stdout/stderr and `kill_on_drop`, so no
//! exit path leaks a process. Both output streams are drained concurrently
//! into a line channel so neither can block the child. Cancellation sends
//! SIGTERM (on Unix) and escalates to SIGKILL after the grace period.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How a driven child finished
#[derive(Debug)]
pub(crate) enum ChildExit {
    /// Child exited on its own; true if the exit status was success
    Finished { success: bool },
    /// Cancellation fired and the child was terminated
    Cancelled,
}

/// Check whether an executable is discoverable on PATH
pub(crate) fn binary_available(name: &str) -> bool {
    which::which(name).is_ok()
}

/// Configure a command for adapter use: piped output, killed if dropped
pub(crate) fn engine_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);
    cmd
}

/// Run a child to completion, feeding every stdout/stderr line to `on_line`
///
/// Returns when the child exits or, on cancellation, after the child has
/// been terminated (gracefully within `grace`, then forcibly).
pub(crate) async fn drive_child(
    mut child: Child,
    cancel: &CancellationToken,
    grace: Duration,
    mut on_line: impl FnMut(&str),
) -> std::io::Result<ChildExit> {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);

    if let Some(stdout) = child.stdout.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    // Drop our sender so the channel closes once both readers finish
    drop(line_tx);

    loop {
        tokio::select! {
            maybe_line = line_rx.recv() => {
                match maybe_line {
                    Some(line) => on_line(&line),
                    None => {
                        // Streams closed; child is done or nearly so
                        let status = child.wait().await?;
                        return Ok(ChildExit::Finished { success: status.success() });
                    }
                }
            }
            _ = cancel.cancelled() => {
                terminate_child(&mut child, grace).await;
                return Ok(ChildExit::Cancelled);
            }
        }
    }
}

/// Terminate a child: graceful signal first, SIGKILL after `grace`
pub(crate) async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill(2) with a pid we own; failure is handled by the
            // SIGKILL escalation below.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        child.start_kill().ok();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {
            tracing::debug!("Child terminated within grace period");
        }
        Err(_) => {
            tracing::warn!("Child unresponsive after grace period, killing");
            child.start_kill().ok();
            child.wait().await.ok();
        }
    }
}
