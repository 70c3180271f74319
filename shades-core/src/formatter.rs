//! Formatter trait definitions and the external command formatter.

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::domain::Failure;
use crate::error::{Result, ShadesError};

/// Placeholder that replaces randomized log paths in failure messages.
pub const LOG_PLACEHOLDER: &str = "<log>";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A code formatter under test.
#[cfg_attr(test, mockall::automock)]
pub trait Formatter: Send + Sync {
    /// Formatter name and version, e.g. `black, 24.1.0`.
    fn identity(&self) -> String;
    /// Format `source`, which was read from `path`, with extra `args`.
    fn format(
        &self,
        source: &str,
        path: &Path,
        args: &[String],
    ) -> std::result::Result<String, Failure>;
}

/// A formatter that returns its input unchanged.
#[derive(Debug, Default, Clone)]
pub struct NoopFormatter;

impl Formatter for NoopFormatter {
    fn identity(&self) -> String {
        "noop".to_string()
    }

    fn format(
        &self,
        source: &str,
        _path: &Path,
        _args: &[String],
    ) -> std::result::Result<String, Failure> {
        Ok(source.to_string())
    }
}

/// Pipes sources through an external program reading stdin and writing
/// stdout.
#[derive(Debug, Clone)]
pub struct CommandFormatter {
    program: String,
    identity: String,
    base_args: Vec<String>,
    parse_markers: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandFormatter {
    /// Create a formatter with a known identity, using black's stdin mode.
    pub fn new(program: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            identity: identity.into(),
            base_args: vec!["-q".to_string()],
            parse_markers: vec!["Cannot parse".to_string()],
            timeout: None,
        }
    }

    /// Create a formatter, asking the program for its version.
    pub fn detect(program: impl Into<String>) -> Result<Self> {
        let program = program.into();
        let output = Command::new(&program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(ShadesError::Other(format!(
                "{program} --version failed with {}",
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let identity = stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| program.clone());
        Ok(Self::new(program, identity))
    }

    /// Replace the arguments placed before the per-run arguments.
    pub fn with_base_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    /// Replace the diagnostics substrings that identify unparsable input.
    pub fn with_parse_markers(mut self, markers: Vec<String>) -> Self {
        self.parse_markers = markers;
        self
    }

    /// Kill the program when a single run takes longer than `limit`.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    fn run(&self, source: &str, path: &Path, args: &[String]) -> io::Result<RunOutput> {
        let mut child = Command::new(&self.program)
            .args(&self.base_args)
            .args(args)
            .arg("--stdin-filename")
            .arg(path)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Feed stdin from another thread so a full stdout pipe cannot
        // deadlock the write.
        let writer = child.stdin.take().map(|mut stdin| {
            let input = source.as_bytes().to_vec();
            std::thread::spawn(move || stdin.write_all(&input))
        });
        let output = match self.timeout {
            Some(limit) => wait_with_deadline(child, limit)?,
            None => child.wait_with_output()?,
        };
        if let Some(writer) = writer {
            // A formatter that exits early closes the pipe; its exit status
            // already tells the story.
            let _ = writer.join();
        }

        Ok(RunOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn classify(&self, output: RunOutput, path: &Path) -> Failure {
        let stderr = output.stderr.trim();
        let mut message = summary_line(stderr, path).unwrap_or_else(|| match output.status.code() {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by signal".to_string(),
        });

        let log = log_path(stderr).map(|log_path| {
            message = message.replace(log_path, LOG_PLACEHOLDER);
            std::fs::read_to_string(log_path).unwrap_or_default()
        });

        let is_parse_error = output.status.code().is_some()
            && self
                .parse_markers
                .iter()
                .any(|marker| stderr.contains(marker.as_str()));
        let mut failure = if is_parse_error {
            Failure::parse(message)
        } else {
            Failure::crash(message)
        };
        if !stderr.is_empty() {
            failure = failure.with_traceback(stderr);
        }
        if let Some(log) = log.filter(|log| !log.is_empty()) {
            failure = failure.with_log(log);
        }
        failure
    }
}

impl Formatter for CommandFormatter {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn format(
        &self,
        source: &str,
        path: &Path,
        args: &[String],
    ) -> std::result::Result<String, Failure> {
        let output = self.run(source, path, args).map_err(|err| {
            if err.kind() == io::ErrorKind::TimedOut {
                Failure::crash(err.to_string())
            } else {
                Failure::crash(format!("failed to run {}: {err}", self.program))
            }
        })?;
        if !output.status.success() {
            return Err(self.classify(output, path));
        }
        String::from_utf8(output.stdout)
            .map_err(|_| Failure::crash("formatter produced invalid UTF-8"))
    }
}

struct RunOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: String,
}

/// Wait for `child`, killing it once `limit` has passed.
fn wait_with_deadline(mut child: Child, limit: Duration) -> io::Result<Output> {
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);
    let deadline = Instant::now() + limit;

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            // The child may exit between the checks; either way it is gone.
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out after {}s", limit.as_secs_f64()),
            ));
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    Ok(Output {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = reader.read_to_end(&mut buffer);
        buffer
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Pick the line describing the failure and drop the `error: cannot format
/// <path>: ` prefix.
fn summary_line(stderr: &str, path: &Path) -> Option<String> {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let line = lines
        .iter()
        .find(|line| line.starts_with("error:"))
        .or_else(|| lines.last())
        .copied()?;
    let prefix = format!("error: cannot format {}: ", path.display());
    let line = line
        .strip_prefix(prefix.as_str())
        .or_else(|| line.strip_prefix("error: cannot format -: "))
        .unwrap_or(line);
    Some(line.to_string())
}

fn log_path(stderr: &str) -> Option<&str> {
    let (_, rest) = stderr.split_once("helpful: ")?;
    let candidate = rest.split_whitespace().next()?;
    candidate.ends_with(".log").then_some(candidate)
}
