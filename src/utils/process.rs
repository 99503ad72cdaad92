use std::{
    io::Read,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use tracing as log;

use crate::error::{CommandFailure, Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub enum StdioSpec {
    Inherit,
    Null,
    Pipe,
}

impl StdioSpec {
    #[inline]
    fn to_stdio(&self) -> Stdio {
        match self {
            StdioSpec::Inherit => Stdio::inherit(),
            StdioSpec::Null => Stdio::null(),
            StdioSpec::Pipe => Stdio::piped(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CmdSpec {
    program: String,
    args: Vec<String>,
    stdout: StdioSpec,
    stderr: StdioSpec,
    timeout: Option<Duration>,
}

impl CmdSpec {
    #[must_use]
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout: StdioSpec::Inherit,
            stderr: StdioSpec::Inherit,
            timeout: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(it.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn stdout(mut self, s: StdioSpec) -> Self {
        self.stdout = s;
        self
    }

    #[must_use]
    pub fn stderr(mut self, s: StdioSpec) -> Self {
        self.stderr = s;
        self
    }

    /// Overrides the runner's default timeout for this command only.
    #[must_use]
    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }

    #[cfg(test)]
    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn render(&self) -> String {
        let mut out = sh_quote(&self.program);
        for a in &self.args {
            out.push(' ');
            out.push_str(&sh_quote(a));
        }
        out
    }

    fn failed(&self, failure: CommandFailure) -> Error {
        Error::Command {
            cmd: self.render(),
            failure,
        }
    }
}

/// Runs external commands. Every component reaches the host through this
/// trait, so a recording double can stand in for it.
pub trait Runner: Send + Sync {
    fn run(&self, cmd: &CmdSpec) -> Result<()>;
    fn run_capture(&self, cmd: &CmdSpec) -> Result<String>;
}

#[derive(Clone, Debug)]
pub struct ProcessRunner {
    default_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    fn spawn(&self, spec: &CmdSpec, capture: bool) -> Result<Child> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stderr(spec.stderr.to_stdio());
        if capture {
            cmd.stdout(Stdio::piped());
        } else {
            cmd.stdout(spec.stdout.to_stdio());
        }
        cmd.spawn()
            .map_err(|e| spec.failed(CommandFailure::Spawn(e)))
    }

    fn execute(&self, spec: &CmdSpec, capture: bool) -> Result<String> {
        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        log::debug!("[exec] {} (timeout {}s)", spec.render(), timeout.as_secs());

        let mut child = self.spawn(spec, capture)?;

        // stdout must be drained while waiting, a full pipe stalls the child
        let reader = child.stdout.take().map(|mut out| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = out.read_to_end(&mut buf);
                buf
            })
        });

        let status = wait_with_deadline(&mut child, timeout)
            .map_err(|e| spec.failed(CommandFailure::Spawn(e)))?;

        let stdout = reader
            .and_then(|h| h.join().ok())
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default();

        match status {
            Some(st) if st.success() => Ok(stdout),
            Some(st) => Err(spec.failed(CommandFailure::Exit(st.to_string()))),
            None => Err(spec.failed(CommandFailure::Timeout(timeout))),
        }
    }
}

impl Runner for ProcessRunner {
    fn run(&self, cmd: &CmdSpec) -> Result<()> {
        self.execute(cmd, false).map(|_| ())
    }

    fn run_capture(&self, cmd: &CmdSpec) -> Result<String> {
        self.execute(cmd, true)
    }
}

/// Returns `None` when the deadline passed; the child is killed and reaped.
/// A timeout too large to represent never expires.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn sh_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".into();
    }
    if !s
        .bytes()
        .any(|b| b == b' ' || b == b'\'' || b == b'"' || b == b'\\')
    {
        return s.to_string();
    }
    let mut out = String::from("'");
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn sh_quote_empty() {
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn sh_quote_with_space() {
        assert_eq!(sh_quote("/media/raw/my file"), "'/media/raw/my file'");
    }

    #[test]
    fn sh_quote_with_single_quote() {
        assert_eq!(sh_quote("don't"), "'don'\\''t'");
    }

    #[test]
    fn cmd_spec_render() {
        let cmd = CmdSpec::new("lvcreate")
            .args(["-s", "-n", "snap1", "-L", "2048m"])
            .arg("data/vol1");
        assert_eq!(cmd.render(), "lvcreate -s -n snap1 -L 2048m data/vol1");
    }

    #[test]
    fn capture_returns_stdout() {
        let runner = ProcessRunner::new(Duration::from_secs(5));
        let out = runner
            .run_capture(&CmdSpec::new("sh").args(["-c", "echo hello"]))
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn non_zero_exit_is_command_failure() {
        let runner = ProcessRunner::new(Duration::from_secs(5));
        let err = runner
            .run(&CmdSpec::new("sh").args(["-c", "exit 3"]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalCommandFailure);
        assert!(!err.is_timeout());
    }

    #[test]
    fn per_command_timeout_kills_child() {
        let runner = ProcessRunner::new(Duration::from_secs(30));
        let started = Instant::now();
        let err = runner
            .run(
                &CmdSpec::new("sleep")
                    .arg("10")
                    .timeout(Duration::from_millis(200)),
            )
            .unwrap_err();
        assert!(err.is_timeout(), "got {err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn unrepresentable_timeout_waits_for_exit() {
        let runner = ProcessRunner::new(Duration::from_secs(5));
        let out = runner
            .run_capture(&CmdSpec::new("echo").arg("ok").timeout(Duration::MAX))
            .unwrap();
        assert_eq!(out.trim(), "ok");
    }

    #[test]
    fn missing_program_is_spawn_failure() {
        let runner = ProcessRunner::new(Duration::from_secs(5));
        let err = runner
            .run(&CmdSpec::new("/nonexistent/lvsnap-test-bin"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalCommandFailure);
    }
}
