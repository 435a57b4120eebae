use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::output::{OutputSink, Stream};
use crate::error::LaunchError;
use crate::types::{ExitKind, ExitReport};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

// Output still buffered in the pipes when the child exits gets this long to drain.
const PUMP_DRAIN: Duration = Duration::from_secs(1);
const KILL_WAIT: Duration = Duration::from_secs(5);

struct LiveProcess {
    pid: Option<u32>,
    binary: PathBuf,
    stopping: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
}

impl LiveProcess {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

/// Owns at most one child process of a service.
pub struct ProcessRunner {
    service: String,
    output: Arc<dyn OutputSink>,
    grace_period: Duration,
    live: Option<LiveProcess>,
}

impl ProcessRunner {
    pub fn new(service: impl Into<String>, output: Arc<dyn OutputSink>) -> Self {
        Self {
            service: service.into(),
            output,
            grace_period: DEFAULT_GRACE_PERIOD,
            live: None,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn is_running(&self) -> bool {
        self.live.as_ref().is_some_and(|live| !live.has_exited())
    }

    pub fn pid(&self) -> Option<u32> {
        self.live
            .as_ref()
            .filter(|live| !live.has_exited())
            .and_then(|live| live.pid)
    }

    /// Launches `binary` with a literal argument vector. Exactly one
    /// `ExitReport` is sent on `exits` once the process is gone.
    pub fn start(
        &mut self,
        binary: &Path,
        args: &[String],
        exits: mpsc::UnboundedSender<ExitReport>,
    ) -> Result<(), LaunchError> {
        if let Some(live) = &self.live {
            if !live.has_exited() {
                return Err(LaunchError::AlreadyRunning {
                    service: self.service.clone(),
                    pid: live.pid,
                });
            }
        }

        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            service: self.service.clone(),
            binary: binary.to_path_buf(),
            source,
        })?;
        let pid = child.id();
        log::debug!("{}: started {:?} as pid {:?}", self.service, binary, pid);

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(self.spawn_pump(stdout, Stream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(self.spawn_pump(stderr, Stream::Stderr));
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited_rx) = watch::channel(false);

        let service = self.service.clone();
        let reaper_stopping = stopping.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = tokio::time::timeout(PUMP_DRAIN, futures::future::join_all(pumps)).await;

            let kind = if reaper_stopping.load(Ordering::SeqCst) {
                ExitKind::Requested
            } else {
                ExitKind::Unexpected
            };
            let (code, signal) = match status {
                Ok(status) => (status.code(), exit_signal(&status)),
                Err(e) => {
                    log::error!("{}: waiting for pid {:?} failed: {}", service, pid, e);
                    (None, None)
                }
            };
            let report = ExitReport {
                service,
                pid,
                code,
                signal,
                kind,
            };

            let _ = exited_tx.send(true);
            let _ = exits.send(report);
        });

        self.live = Some(LiveProcess {
            pid,
            binary: binary.to_path_buf(),
            stopping,
            exited: exited_rx,
        });
        Ok(())
    }

    /// Terminates the process group and waits for the reaper. SIGKILL follows
    /// after the grace period. No-op when nothing is running.
    pub async fn stop(&mut self) {
        let Some(mut live) = self.live.take() else {
            return;
        };
        if live.has_exited() {
            return;
        }

        live.stopping.store(true, Ordering::SeqCst);
        log::debug!(
            "{}: stopping pid {:?} ({:?})",
            self.service,
            live.pid,
            live.binary
        );
        if let Some(pid) = live.pid {
            signal_group(pid, Signal::Terminate);
        }

        if wait_exited(&mut live.exited, self.grace_period).await {
            return;
        }

        let Some(pid) = live.pid else {
            log::error!(
                "{}: process without a pid did not exit within {:?}",
                self.service,
                self.grace_period
            );
            return;
        };
        log::warn!(
            "{}: pid {} ignored SIGTERM for {:?}, killing",
            self.service,
            pid,
            self.grace_period
        );
        signal_group(pid, Signal::Kill);

        if !wait_exited(&mut live.exited, KILL_WAIT).await {
            log::error!("{}: pid {} survived SIGKILL", self.service, pid);
        }
    }

    fn spawn_pump<R>(&self, reader: R, stream: Stream) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let output = self.output.clone();
        let service = self.service.clone();
        // Reads raw bytes until EOF: closing the pipe early would SIGPIPE the child.
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let decoded = String::from_utf8_lossy(&buf);
                        let line = decoded.strip_suffix('\n').unwrap_or(decoded.as_ref());
                        let line = line.strip_suffix('\r').unwrap_or(line);
                        output.write_line(&service, stream, line);
                    }
                    Err(e) => {
                        log::warn!("{}: reading {:?} failed: {}", service, stream, e);
                        break;
                    }
                }
            }
        })
    }
}

async fn wait_exited(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    matches!(
        tokio::time::timeout(limit, exited.wait_for(|done| *done)).await,
        Ok(Ok(_))
    )
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child leads its own process group (see `process_group(0)`).
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signo) };
    if rc != 0 {
        log::debug!(
            "kill(-{}, {:?}) failed: {}",
            pid,
            signal,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, signal: Signal) {
    log::error!("cannot deliver {:?} to pid {} on this platform", signal, pid);
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
