//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::{CancelToken, Cancelled, POLL_INTERVAL};

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout and stderr as one lossy string, with truncation notices.
    pub fn combined(&self) -> String {
        let mut buf = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if !self.stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        buf
    }

    pub fn truncated_bytes(&self) -> usize {
        self.stdout_truncated + self.stderr_truncated
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// A fired `cancel` token kills the child and returns [`Cancelled`].
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    run_inner(cmd, stdin, timeout, output_limit_bytes, None, cancel)
}

/// Like [`run_command_with_timeout`], but also writes every stdout line to `stream_path`
/// as it arrives. The full (bounded) stdout is still returned.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, stream = %stream_path.display()))]
pub fn run_command_with_stream(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    stream_path: &Path,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    if let Some(parent) = stream_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create stream dir {}", parent.display()))?;
    }
    let file = File::create(stream_path)
        .with_context(|| format!("create stream file {}", stream_path.display()))?;
    run_inner(
        cmd,
        stdin,
        timeout,
        output_limit_bytes,
        Some(BufWriter::new(file)),
        cancel,
    )
}

type Tee = BufWriter<File>;

/// How long reader threads may keep draining pipes after the child was killed.
const READER_GRACE: Duration = Duration::from_millis(500);

fn run_inner(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    tee: Option<Tee>,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    cancel.check()?;
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    // Own process group, so a timeout or cancel can take down grandchildren too.
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle =
        thread::spawn(move || read_stream_limited_with_tee(stdout, output_limit_bytes, tee));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    // Feed stdin from its own thread so a child that never reads cannot block the timeout.
    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                if let Err(e) = child_stdin.write_all(&input) {
                    warn!(err = %e, "failed to write child stdin");
                }
            }))
        }
        None => None,
    };

    let waited = wait_with_deadline(&mut child, timeout, cancel)?;

    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        return Err(anyhow!("stdin writer thread panicked"));
    }
    let grace = match waited {
        Waited::Exited(_) => None,
        Waited::TimedOut(_) | Waited::Cancelled => Some(READER_GRACE),
    };
    let (stdout, stdout_truncated) = join_output(stdout_handle, grace).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle, grace).context("join stderr")?;

    let (status, timed_out) = match waited {
        Waited::Exited(status) => (status, false),
        Waited::TimedOut(status) => (status, true),
        Waited::Cancelled => return Err(Cancelled.into()),
    };

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

enum Waited {
    Exited(ExitStatus),
    TimedOut(ExitStatus),
    Cancelled,
}

/// Wait for the child in short slices so the cancel token is observed promptly.
fn wait_with_deadline(child: &mut Child, timeout: Duration, cancel: &CancelToken) -> Result<Waited> {
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            warn!("cancellation requested, killing child process");
            kill_and_reap(child)?;
            return Ok(Waited::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            let status = kill_and_reap(child)?;
            return Ok(Waited::TimedOut(status));
        }
        let slice = (deadline - now).min(POLL_INTERVAL);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            return Ok(Waited::Exited(status));
        }
    }
}

fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    #[cfg(unix)]
    kill_group(child.id());
    if let Err(e) = child.kill() {
        // Already exited between the last poll and the kill.
        debug!(err = %e, "kill failed");
    }
    child.wait().context("wait command after kill")
}

/// SIGKILL the process group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(err = %e, pid, "killpg failed");
    }
}

type OutputHandle = thread::JoinHandle<Result<(Vec<u8>, usize)>>;

/// Join a reader thread. With `grace`, give up after that long and return no output;
/// a process outside the killed group may still hold the pipe open.
fn join_output(handle: OutputHandle, grace: Option<Duration>) -> Result<(Vec<u8>, usize)> {
    if let Some(grace) = grace {
        let deadline = Instant::now() + grace;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(grace_ms = grace.as_millis(), "output pipe still open after kill, abandoning reader");
                return Ok((Vec::new(), 0));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line by line with a size limit, optionally tee-ing to a file.
fn read_stream_limited_with_tee<R: Read>(
    reader: R,
    limit: usize,
    tee: Option<Tee>,
) -> Result<(Vec<u8>, usize)> {
    let Some(mut tee) = tee else {
        return read_stream_limited(reader, limit);
    };

    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Err(e) = tee.write_all(&line) {
            warn!(err = %e, "failed to write to stream file");
        } else if let Err(e) = tee.flush() {
            warn!(err = %e, "failed to flush stream file");
        }

        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}
