//! Subprocess execution with output redirection and a runner-side deadline.

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufRead as _, BufReader, Read, Write as _};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::{ProfError, ProfResult};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    File(PathBuf),
    /// stderr only: share the stdout file.
    Stdout,
    Null,
}

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub stdout: Sink,
    pub stderr: Sink,
    /// Keep only the first N lines of stdout, like `| head -n N`.
    pub head_lines: Option<usize>,
    pub deadline: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout: Sink::Null,
            stderr: Sink::Null,
            head_lines: None,
            deadline: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdout(mut self, sink: Sink) -> Self {
        self.stdout = sink;
        self
    }

    pub fn stderr(mut self, sink: Sink) -> Self {
        self.stderr = sink;
        self
    }

    pub fn head_lines(mut self, lines: Option<usize>) -> Self {
        self.head_lines = lines;
        self
    }

    pub fn deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Shell-like rendering for logs and reports.
    pub fn display(&self) -> String {
        let mut out = quote(&self.program.to_string_lossy());
        for arg in &self.args {
            out.push(' ');
            out.push_str(&quote(&arg.to_string_lossy()));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs the process to completion, streaming its output into the configured sinks.
///
/// An error means the process never started (or its sinks could not be opened);
/// a non-zero exit is reported through the outcome.
pub fn run(spec: &ProcessSpec) -> ProfResult<ProcessOutcome> {
    let started = Instant::now();
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args).stdin(Stdio::null());
    own_process_group(&mut cmd);

    let stdout_file = match &spec.stdout {
        Sink::File(path) => Some(create_sink(path)?),
        Sink::Stdout | Sink::Null => None,
    };
    let pump_target = match (&stdout_file, spec.head_lines) {
        (Some(file), Some(limit)) => {
            cmd.stdout(Stdio::piped());
            Some((file.try_clone()?, limit))
        }
        (Some(file), None) => {
            cmd.stdout(Stdio::from(file.try_clone()?));
            None
        }
        (None, _) => {
            cmd.stdout(Stdio::null());
            None
        }
    };
    match &spec.stderr {
        Sink::File(path) => {
            cmd.stderr(Stdio::from(create_sink(path)?));
        }
        Sink::Stdout => match &stdout_file {
            Some(file) => {
                cmd.stderr(Stdio::from(file.try_clone()?));
            }
            None => {
                cmd.stderr(Stdio::null());
            }
        },
        Sink::Null => {
            cmd.stderr(Stdio::null());
        }
    }

    let mut child = spawn(&mut cmd, &spec.program)?;

    let pump = match (pump_target, child.stdout.take()) {
        (Some((file, limit)), Some(pipe)) => {
            Some(std::thread::spawn(move || copy_head(pipe, file, limit)))
        }
        _ => None,
    };

    let waited = wait_with_deadline(&mut child, spec.deadline);

    if let Some(handle) = pump {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("output capture for {} failed: {err}", spec.display()),
            Err(_) => tracing::warn!("output capture thread for {} panicked", spec.display()),
        }
    }

    let (status, timed_out) = waited?;
    Ok(ProcessOutcome {
        exit_code: status.code(),
        timed_out,
        elapsed: started.elapsed(),
    })
}

/// Runs the process and returns its stdout, for short queries like `perf --version`.
pub fn run_captured(
    program: &Path,
    args: &[&str],
    deadline: Duration,
) -> ProfResult<(ProcessOutcome, String)> {
    let started = Instant::now();
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    own_process_group(&mut cmd);
    let mut child = spawn(&mut cmd, program)?;

    let reader = child.stdout.take().map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).map(|_| buf)
        })
    });
    let (status, timed_out) = wait_with_deadline(&mut child, Some(deadline))?;
    let stdout = match reader.map(|h| h.join()) {
        Some(Ok(Ok(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    };
    Ok((
        ProcessOutcome {
            exit_code: status.code(),
            timed_out,
            elapsed: started.elapsed(),
        },
        stdout,
    ))
}

/// Retries while the executable is still open for writing elsewhere (ETXTBSY),
/// which happens right after a tool was installed or generated.
fn spawn(cmd: &mut Command, program: &Path) -> ProfResult<Child> {
    const ETXTBSY: i32 = 26;
    let mut attempts = 0;
    loop {
        match cmd.spawn() {
            Ok(child) => return Ok(child),
            Err(err) if err.raw_os_error() == Some(ETXTBSY) && attempts < 10 => {
                attempts += 1;
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                return Err(ProfError::Tool(format!(
                    "failed to start {}: {err}",
                    program.display()
                )));
            }
        }
    }
}

fn create_sink(path: &Path) -> ProfResult<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(File::create(path)?)
}

fn wait_with_deadline(
    child: &mut Child,
    deadline: Option<Duration>,
) -> ProfResult<(ExitStatus, bool)> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        if deadline.is_some_and(|limit| started.elapsed() >= limit) {
            if let Err(err) = kill_process_group(child) {
                tracing::warn!("failed to kill process {}: {err}", child.id());
            }
            let status = child.wait()?;
            return Ok((status, true));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Puts the child in a fresh process group so a deadline kill also reaches
/// whatever it spawned (`time -v <target>`, `perf record -- <target>`).
#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt as _;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        return child.kill();
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::debug!("killpg({pgid}) failed: {err}; killing the child only");
            child.kill()
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

/// Writes the first `limit` lines and drains the rest so the child never blocks on a full pipe.
fn copy_head(pipe: impl Read, mut out: File, limit: usize) -> std::io::Result<()> {
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    let mut written = 0usize;
    while written < limit {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        out.write_all(&line)?;
        written += 1;
    }
    out.flush()?;
    std::io::copy(&mut reader, &mut std::io::sink())?;
    Ok(())
}

fn quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,%+@".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
