use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// How often a running test checks for cancellation.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// A user-supplied shell command run once per mutant.
#[derive(Debug, Clone)]
pub struct TestCommand {
    pub command: String,
    pub cwd: PathBuf,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    /// Non-zero exit, or `code: None` when the test died from a signal it
    /// was not sent by us.
    Failed { code: Option<i32> },
    TimedOut,
    Cancelled,
    LaunchFailed(String),
}

impl TestOutcome {
    /// `Some(survived)` for a completed run, `None` when the outcome says
    /// nothing about the mutant.
    pub fn survived(&self) -> Option<bool> {
        match self {
            TestOutcome::Passed => Some(true),
            TestOutcome::Failed { .. } => Some(false),
            TestOutcome::TimedOut | TestOutcome::Cancelled | TestOutcome::LaunchFailed(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestRun {
    pub outcome: TestOutcome,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl TestCommand {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the command to completion, timeout or cancellation. Never panics
    /// and never leaves a child behind.
    pub fn run(&self, mutant_id: &str, cancel: &AtomicBool) -> TestRun {
        let start = Instant::now();
        let mut child = match self.spawn(mutant_id) {
            Ok(child) => child,
            Err(e) => {
                return TestRun {
                    outcome: TestOutcome::LaunchFailed(e.to_string()),
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: start.elapsed(),
                }
            }
        };

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        let outcome = self.wait(&mut child, start, cancel);
        debug!(mutant = mutant_id, ?outcome, elapsed_ms = start.elapsed().as_millis() as u64, "test finished");

        TestRun {
            outcome,
            stdout: join_output(stdout),
            stderr: join_output(stderr),
            duration: start.elapsed(),
        }
    }

    fn spawn(&self, mutant_id: &str) -> std::io::Result<Child> {
        let mut cmd = shell(&self.command);
        cmd.current_dir(&self.cwd)
            .env("KATA_MUTANT", mutant_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // own process group: a kill reaches grandchildren that hold our pipes
            cmd.process_group(0);
        }
        cmd.spawn()
    }

    fn wait(&self, child: &mut Child, start: Instant, cancel: &AtomicBool) -> TestOutcome {
        loop {
            match child.wait_timeout(POLL_SLICE) {
                Ok(Some(status)) => {
                    return if status.success() {
                        TestOutcome::Passed
                    } else {
                        TestOutcome::Failed {
                            code: status.code(),
                        }
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    kill(child);
                    return TestOutcome::LaunchFailed(format!("wait failed: {e}"));
                }
            }
            if cancel.load(Ordering::SeqCst) {
                kill(child);
                return TestOutcome::Cancelled;
            }
            if let Some(limit) = self.timeout {
                if start.elapsed() >= limit {
                    warn!(command = %self.command, limit_secs = limit.as_secs_f64(), "test command timed out");
                    kill(child);
                    return TestOutcome::TimedOut;
                }
            }
        }
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

fn kill(child: &mut Child) {
    #[cfg(unix)]
    {
        // SAFETY: plain kill(2) on the process group we created at spawn.
        unsafe {
            libc::kill(-(child.id() as libc::pid_t), libc::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_output(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
