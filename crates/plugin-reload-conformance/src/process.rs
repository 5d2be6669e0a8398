//! Broker process lifecycle.
//!
//! Scenario logic only sees the [`ProcessController`] and [`BrokerProcess`]
//! traits. [`SubprocessController`] is the production implementation: it
//! spawns the broker binary with tokio, drains its output pipes in the
//! background and delivers signals through `nix`.

use crate::config::BrokerCommand;
use crate::error::{HarnessError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerSignal {
    /// Re-read configuration (`SIGHUP`).
    Reload,
    /// Graceful shutdown (`SIGTERM`).
    Terminate,
    /// Forced shutdown (`SIGKILL`).
    Kill,
}

impl BrokerSignal {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Reload => "SIGHUP",
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            Self::Reload => Signal::SIGHUP,
            Self::Terminate => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
        }
    }
}

impl fmt::Display for BrokerSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExitState {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitState {
    #[must_use]
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    #[must_use]
    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitState {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Everything a finished broker left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit: Option<ExitState>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Starts brokers. The returned process is owned exclusively by the caller.
pub trait ProcessController {
    type Process: BrokerProcess;

    /// Launches a broker reading `config_path`. Resolves once the process
    /// exists, not once it accepts connections.
    fn start<'a>(
        &'a mut self,
        config_path: &'a Path,
        port: u16,
    ) -> impl Future<Output = Result<Self::Process>> + Send + 'a;
}

/// A running (or finished) broker.
pub trait BrokerProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Delivers `signal`. Fails with [`HarnessError::ProcessNotRunning`] once
    /// the process has exited.
    fn signal(&mut self, signal: BrokerSignal) -> Result<()>;

    /// Non-blocking exit check.
    fn exit_state(&mut self) -> Result<Option<ExitState>>;

    /// Requests graceful shutdown. Does nothing if the process already exited.
    fn terminate(&mut self);

    /// Waits for exit and drained output. Repeated calls return the same
    /// output.
    fn wait(&mut self) -> impl Future<Output = ProcessOutput> + Send + '_;
}

/// Spawns the configured broker binary as a child process.
#[derive(Debug, Clone)]
pub struct SubprocessController {
    command: BrokerCommand,
    shutdown_grace: Duration,
}

impl SubprocessController {
    #[must_use]
    pub fn new(command: BrokerCommand, shutdown_grace: Duration) -> Self {
        Self {
            command,
            shutdown_grace,
        }
    }

    fn spawn(&self, config_path: &Path, port: u16) -> Result<SubprocessBroker> {
        let args = self.command.render_args(config_path, port);
        let mut command = Command::new(&self.command.program);
        command
            .args(&args)
            .envs(&self.command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.command.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|source| HarnessError::ProcessSpawn {
                program: self.command.program.clone(),
                source,
            })?;
        let pid = child.id();
        let stdout = child.stdout.take().map(OutputPipe::drain);
        let stderr = child.stderr.take().map(OutputPipe::drain);
        info!(
            pid = ?pid,
            program = %self.command.program,
            ?args,
            "broker spawned"
        );

        Ok(SubprocessBroker {
            child,
            pid,
            stdout,
            stderr,
            exit: None,
            output: None,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

#[allow(clippy::manual_async_fn)]
impl ProcessController for SubprocessController {
    type Process = SubprocessBroker;

    fn start<'a>(
        &'a mut self,
        config_path: &'a Path,
        port: u16,
    ) -> impl Future<Output = Result<Self::Process>> + Send + 'a {
        async move { self.spawn(config_path, port) }
    }
}

/// Continuously drains one output pipe so the broker never blocks on a full
/// pipe buffer.
#[derive(Debug)]
struct OutputPipe {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl OutputPipe {
    fn drain<R>(mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buffer, task }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }

    /// Waits for EOF up to `grace`. A grandchild holding the pipe open only
    /// costs the bytes it has not written yet.
    async fn finish(self, grace: Duration) -> Vec<u8> {
        let Self { buffer, mut task } = self;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            task.abort();
        }
        let mut captured = buffer.lock();
        std::mem::take(&mut *captured)
    }
}

#[derive(Debug)]
pub struct SubprocessBroker {
    child: Child,
    pid: Option<u32>,
    stdout: Option<OutputPipe>,
    stderr: Option<OutputPipe>,
    exit: Option<ExitState>,
    output: Option<ProcessOutput>,
    shutdown_grace: Duration,
}

impl SubprocessBroker {
    /// Output captured so far, without waiting for exit.
    #[must_use]
    pub fn captured_stdout(&self) -> Vec<u8> {
        self.stdout.as_ref().map(OutputPipe::snapshot).unwrap_or_default()
    }

    #[must_use]
    pub fn captured_stderr(&self) -> Vec<u8> {
        self.stderr.as_ref().map(OutputPipe::snapshot).unwrap_or_default()
    }
}

#[allow(clippy::manual_async_fn)]
impl BrokerProcess for SubprocessBroker {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn signal(&mut self, signal: BrokerSignal) -> Result<()> {
        if self.exit_state()?.is_some() {
            return Err(HarnessError::ProcessNotRunning);
        }
        let pid = self.pid.ok_or(HarnessError::ProcessNotRunning)?;
        send_signal(pid, signal)?;
        debug!(pid, %signal, "signal delivered");
        Ok(())
    }

    fn exit_state(&mut self) -> Result<Option<ExitState>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }
        let status = self
            .child
            .try_wait()
            .map_err(|source| HarnessError::ProcessStatus { source })?;
        self.exit = status.map(ExitState::from);
        Ok(self.exit)
    }

    fn terminate(&mut self) {
        match self.exit_state() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(err) => warn!(error = %err, "could not query broker before terminate"),
        }
        let Some(pid) = self.pid else {
            return;
        };
        match send_signal(pid, BrokerSignal::Terminate) {
            Ok(()) => debug!(pid, "terminate requested"),
            Err(HarnessError::ProcessNotRunning) => {}
            Err(err) => {
                warn!(pid, error = %err, "terminate failed, killing broker");
                if let Err(err) = self.child.start_kill() {
                    warn!(pid, error = %err, "kill failed");
                }
            }
        }
    }

    fn wait(&mut self) -> impl Future<Output = ProcessOutput> + Send + '_ {
        async move {
            if let Some(output) = &self.output {
                return output.clone();
            }

            let grace = self.shutdown_grace;
            let status = match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(err)) => {
                    warn!(pid = ?self.pid, error = %err, "waiting for broker failed");
                    None
                }
                Err(_) => {
                    warn!(pid = ?self.pid, ?grace, "broker ignored terminate, killing");
                    if let Err(err) = self.child.kill().await {
                        warn!(pid = ?self.pid, error = %err, "kill failed");
                    }
                    self.child.wait().await.ok()
                }
            };
            if self.exit.is_none() {
                self.exit = status.map(ExitState::from);
            }

            let stdout = match self.stdout.take() {
                Some(pipe) => pipe.finish(grace).await,
                None => Vec::new(),
            };
            let stderr = match self.stderr.take() {
                Some(pipe) => pipe.finish(grace).await,
                None => Vec::new(),
            };

            let output = ProcessOutput {
                exit: self.exit,
                stdout,
                stderr,
            };
            info!(pid = ?self.pid, exit = ?output.exit, "broker reaped");
            self.output = Some(output.clone());
            output
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: BrokerSignal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| HarnessError::Signal {
        signal,
        pid,
        reason: "pid out of range".to_string(),
    })?;
    match kill(Pid::from_raw(raw), signal.as_nix()) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(HarnessError::ProcessNotRunning),
        Err(errno) => Err(HarnessError::Signal {
            signal,
            pid,
            reason: errno.desc().to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: BrokerSignal) -> Result<()> {
    Err(HarnessError::Signal {
        signal,
        pid,
        reason: "signal delivery requires a unix host".to_string(),
    })
}
