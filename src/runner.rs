use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::RunError;
use crate::types::{OutputLine, Stream};

/// How long readers may keep draining after the process has been killed.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Longer lines are split into chunks of this many bytes.
pub const MAX_LINE: usize = 1024 * 1024;

/// Immutable description of one external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    /// Human readable name, e.g. "DNS Lookup (MX)".
    pub name: String,
    pub binary: String,
    pub args: Vec<String>,
    /// `None` runs until exit or cancellation.
    pub timeout: Option<Duration>,
}

/// Summary of a finished invocation.
#[derive(Debug)]
pub struct ToolOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub error: Option<RunError>,
}

impl ToolOutcome {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

enum Interrupt {
    Cancelled,
    TimedOut(Duration),
}

impl From<Interrupt> for RunError {
    fn from(i: Interrupt) -> Self {
        match i {
            Interrupt::Cancelled => RunError::Cancelled,
            Interrupt::TimedOut(d) => RunError::TimedOut(d),
        }
    }
}

/// Spawn `spec` and stream every stdout/stderr line into `tx`.
///
/// - `tx` is dropped (closing the channel) once both readers hit EOF, before
///   this function returns.
/// - `cancel` and `spec.timeout` both kill the process; output read so far is
///   kept in the returned summary.
/// - A send that blocks on a full channel blocks the reader, so a slow
///   consumer throttles the tool instead of growing memory.
pub async fn run(
    spec: &ToolSpec,
    cancel: CancellationToken,
    tx: mpsc::Sender<OutputLine>,
) -> ToolOutcome {
    let start = Instant::now();

    tracing::debug!(tool = %spec.name, binary = %spec.binary, args = ?spec.args, "spawning tool");

    let mut cmd = Command::new(&spec.binary);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so a kill also reaches whatever the tool spawned.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(source) => {
            return ToolOutcome {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                duration: start.elapsed(),
                error: Some(RunError::Spawn {
                    binary: spec.binary.clone(),
                    source,
                }),
            };
        }
    };

    let deadline = spec.timeout.map(|t| start + t);
    let mut interrupt: Option<Interrupt> = None;
    let mut io_error: Option<std::io::Error> = None;
    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    {
        let readers = async {
            tokio::join!(
                pump(stdout, Stream::Stdout, &tx, &mut stdout_buf),
                pump(stderr, Stream::Stderr, &tx, &mut stderr_buf),
            )
        };
        tokio::pin!(readers);

        tokio::select! {
            (a, b) = &mut readers => {
                io_error = a.err().or(b.err());
            }
            reason = stop_signal(&cancel, deadline, spec.timeout) => {
                interrupt = Some(reason);
                kill_group(&mut child, &spec.binary);
                // Killing closes the pipes; let the readers flush what is left.
                if time::timeout(KILL_GRACE, &mut readers).await.is_err() {
                    tracing::warn!(binary = %spec.binary, "output pipes still open after kill, abandoning readers");
                }
            }
        }
    }
    // Both readers are finished or dropped: close the channel before waiting.
    drop(tx);

    let status = if interrupt.is_some() {
        child.wait().await
    } else {
        tokio::select! {
            s = child.wait() => s,
            reason = stop_signal(&cancel, deadline, spec.timeout) => {
                interrupt = Some(reason);
                kill_group(&mut child, &spec.binary);
                child.wait().await
            }
        }
    };

    let exit_code = status.as_ref().ok().and_then(|s| s.code());
    let error = match (interrupt, status) {
        (Some(i), _) => Some(RunError::from(i)),
        (None, Err(e)) => Some(RunError::Io(e)),
        (None, Ok(s)) if !s.success() => Some(RunError::Exit {
            code: s.code().unwrap_or(-1),
        }),
        (None, Ok(_)) => io_error.map(RunError::Io),
    };

    ToolOutcome {
        exit_code,
        stdout: stdout_buf,
        stderr: stderr_buf,
        duration: start.elapsed(),
        error,
    }
}

/// SIGKILL the tool's process group, falling back to the direct child.
fn kill_group(child: &mut Child, binary: &str) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => return,
                Err(e) => tracing::debug!(binary, error = %e, "killpg failed"),
            }
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::warn!(binary, error = %e, "kill failed");
    }
}

async fn stop_signal(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
) -> Interrupt {
    match (deadline, timeout) {
        (Some(at), Some(t)) => tokio::select! {
            _ = cancel.cancelled() => Interrupt::Cancelled,
            _ = time::sleep_until(at) => Interrupt::TimedOut(t),
        },
        _ => {
            cancel.cancelled().await;
            Interrupt::Cancelled
        }
    }
}

/// Read `src` line by line, appending to `buf` and forwarding each line.
///
/// A line longer than [`MAX_LINE`] is forwarded as several lines.
async fn pump<R>(
    src: Option<R>,
    stream: Stream,
    tx: &mpsc::Sender<OutputLine>,
    buf: &mut String,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(src) = src else {
        return Ok(());
    };
    let mut reader = BufReader::new(src);
    let mut raw = Vec::with_capacity(256);
    let mut forwarding = true;
    let mut after_split = false;

    loop {
        raw.clear();
        let n = (&mut reader)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut raw)
            .await?;
        if n == 0 {
            return Ok(());
        }
        let complete = raw.last() == Some(&b'\n');
        while matches!(raw.last(), Some(b'\n' | b'\r')) {
            raw.pop();
        }
        // The terminator of a line that was split exactly at the cap.
        let skip = after_split && raw.is_empty();
        after_split = !complete;
        if skip {
            continue;
        }
        let line = String::from_utf8_lossy(&raw).into_owned();
        buf.push_str(&line);
        buf.push('\n');

        // Keep draining even if nobody listens, so the child never blocks on a full pipe.
        if forwarding && tx.send(OutputLine::now(stream, line)).await.is_err() {
            forwarding = false;
        }
    }
}
