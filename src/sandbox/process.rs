//! Child-process capture with a wall-clock watchdog.
//!
//! Both executors funnel through [`run_with_watchdog`], so stdout/stderr
//! capture, truncation and timeout handling are identical whether the
//! child is `docker start -a` or a host interpreter.
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long to wait for output pipes to drain after the child is gone.
/// A descendant that left the process group can keep a pipe open; its
/// output is abandoned.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Appended to a stream that hit the byte cap
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// What a child produced before it exited or was killed.
#[derive(Debug)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the watchdog killed the child
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
    pub truncated: bool,
    pub duration: Duration,
}

#[derive(Default)]
struct CappedBuffer {
    data: Vec<u8>,
    truncated: bool,
}

/// Spawns `command`, writes `stdin_payload` to its stdin, and collects
/// both output streams (each capped at `max_output` bytes) until it
/// exits or `timeout` elapses. On timeout the child is killed and what
/// was captured so far is returned.
///
/// On unix the child leads its own process group, and the whole group is
/// killed once the child is gone so nothing it forked outlives the call.
pub async fn run_with_watchdog(
    mut command: Command,
    stdin_payload: &str,
    timeout: Duration,
    max_output: usize,
) -> std::io::Result<Captured> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let started = Instant::now();
    let mut child = command.spawn()?;
    let group = child.id();

    let stdin = child.stdin.take();
    let payload = stdin_payload.to_string();
    let writer = tokio::spawn(async move {
        if let Some(mut pipe) = stdin {
            // EPIPE here just means the child stopped reading early
            if let Err(e) = pipe.write_all(payload.as_bytes()).await {
                debug!("stdin write ended early: {e}");
            }
            let _ = pipe.shutdown().await;
        }
    });

    let stdout_buf = Arc::new(Mutex::new(CappedBuffer::default()));
    let stderr_buf = Arc::new(Mutex::new(CappedBuffer::default()));
    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, stdout_buf.clone(), max_output)));
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, stderr_buf.clone(), max_output)));

    let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (Some(status?), false),
        Err(_) => {
            warn!("Watchdog fired after {}s, killing child", timeout.as_secs_f64());
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill child: {e}");
            }
            let _ = child.wait().await;
            (None, true)
        }
    };
    let duration = started.elapsed();
    if let Some(pgid) = group {
        kill_group(pgid);
    }
    writer.abort();

    finish(stdout_task).await;
    finish(stderr_task).await;

    let (stdout, out_truncated) = take(&stdout_buf);
    let (stderr, err_truncated) = take(&stderr_buf);

    Ok(Captured {
        stdout,
        stderr,
        status,
        timed_out,
        truncated: out_truncated || err_truncated,
        duration,
    })
}

/// SIGKILLs every process left in the group led by `pgid`.
#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: plain syscall; a negative pid addresses the process group
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        debug!(pgid, "Killed leftover processes in group");
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Reads a pipe to EOF, keeping at most `limit` bytes. Reading continues
/// past the limit so the child never blocks on a full pipe.
async fn drain<R>(mut pipe: R, buffer: Arc<Mutex<CappedBuffer>>, limit: usize)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut buf = buffer.lock().unwrap_or_else(|p| p.into_inner());
                let room = limit.saturating_sub(buf.data.len());
                if n > room {
                    buf.truncated = true;
                }
                let keep = n.min(room);
                buf.data.extend_from_slice(&chunk[..keep]);
            }
        }
    }
}

async fn finish(task: Option<JoinHandle<()>>) {
    let Some(mut task) = task else {
        return;
    };
    if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
        debug!("Output pipe still open after child exit, abandoning");
        task.abort();
    }
}

fn take(buffer: &Arc<Mutex<CappedBuffer>>) -> (String, bool) {
    let mut buf = buffer.lock().unwrap_or_else(|p| p.into_inner());
    let data = std::mem::take(&mut buf.data);
    let mut text = String::from_utf8_lossy(&data).into_owned();
    if buf.truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    (text, buf.truncated)
}
