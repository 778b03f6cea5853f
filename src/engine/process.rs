use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};

use crate::domain::EngineKind;

const TAIL_LINES: usize = 200;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to launch and where its output goes
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub engine: EngineKind,
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    /// stdout/stderr are appended here
    pub log_path: PathBuf,
}

/// How the engine process ended
#[derive(Debug, Clone, PartialEq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub message: String,
}

/// Handle to a running engine process.
///
/// The child itself is owned by a monitor task; the handle only talks to it
/// through channels, so it can be cloned freely.
#[derive(Debug, Clone)]
pub struct EngineProcess {
    engine: EngineKind,
    pid: u32,
    started_at: DateTime<Utc>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::Sender<()>,
    tail: Arc<Mutex<VecDeque<String>>>,
}

impl EngineProcess {
    pub async fn spawn(spec: ProcessSpec) -> Result<Self> {
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .await
            .with_context(|| format!("Failed to open engine log {}", spec.log_path.display()))?;
        let log_file = Arc::new(tokio::sync::Mutex::new(log_file));

        tracing::info!(
            engine = %spec.engine,
            binary = %spec.binary.display(),
            work_dir = %spec.work_dir.display(),
            "starting engine"
        );

        let mut child = Command::new(&spec.binary)
            .args(&spec.args)
            .current_dir(&spec.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", spec.binary.display()))?;

        let pid = child.id().unwrap_or(0);
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));

        if let Some(stdout) = child.stdout.take() {
            spawn_log_pipe(stdout, log_file.clone(), tail.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_pipe(stderr, log_file, tail.clone());
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let engine = spec.engine;

        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx.recv() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    message: format!("engine exited: {}", status),
                },
                Err(e) => ExitInfo {
                    code: None,
                    message: format!("engine wait failed: {}", e),
                },
            };
            tracing::info!(engine = %engine, pid, "{}", info.message);
            let _ = exit_tx.send(Some(info));
        });

        Ok(Self {
            engine: spec.engine,
            pid,
            started_at: Utc::now(),
            exit_rx,
            kill_tx,
            tail,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// `Some` once the process has exited
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    pub fn exit_watcher(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Last lines the engine printed, oldest first
    pub fn recent_output(&self) -> Vec<String> {
        self.tail
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Wait until the process exits or `timeout` elapses. Returns whether it exited.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exit_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|e| e.is_some()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// SIGTERM, then SIGKILL after `grace`.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        if self.exit_info().is_some() {
            return Ok(());
        }

        if terminate(self.pid) && self.wait_exit(grace).await {
            return Ok(());
        }

        tracing::warn!(engine = %self.engine, pid = self.pid, "engine did not exit, killing");
        let _ = self.kill_tx.send(()).await;
        if self.wait_exit(Duration::from_secs(5)).await {
            Ok(())
        } else {
            anyhow::bail!("engine pid {} did not exit after kill", self.pid)
        }
    }

    /// Signal the monitor to kill the child without waiting for the exit.
    pub fn kill(&self) {
        if self.exit_info().is_some() {
            return;
        }
        terminate(self.pid);
        let _ = self.kill_tx.try_send(());
    }

    /// Poll until the engine listens on `host:port`, or sleep briefly when there is no port.
    pub async fn wait_for_ready(
        &self,
        host: &str,
        port: Option<u16>,
        timeout: Duration,
    ) -> Result<()> {
        let port = match port.filter(|p| *p > 0) {
            Some(port) => port,
            None => {
                sleep(Duration::from_millis(500)).await;
                return self.ensure_alive();
            }
        };

        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_alive()?;
            if port_ready(host, port).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "engine not ready after {:?}: {}:{} is not listening{}",
                    timeout,
                    host,
                    port,
                    self.output_hint()
                );
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll until the TUN interface shows up (Linux only).
    pub async fn wait_for_interface(&self, name: &str, timeout: Duration) -> Result<()> {
        if !cfg!(target_os = "linux") || name.is_empty() {
            return Ok(());
        }
        let path = Path::new("/sys/class/net").join(name);
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_alive()?;
            if tokio::fs::metadata(&path).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("TUN interface {} did not appear within {:?}", name, timeout);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        match self.exit_info() {
            Some(info) => anyhow::bail!("{} before ready{}", info.message, self.output_hint()),
            None => Ok(()),
        }
    }

    fn output_hint(&self) -> String {
        let lines = self.recent_output();
        let start = lines.len().saturating_sub(5);
        if lines.is_empty() {
            String::new()
        } else {
            format!(" (last output: {})", lines[start..].join(" | "))
        }
    }
}

fn spawn_log_pipe<R>(
    reader: R,
    file: Arc<tokio::sync::Mutex<tokio::fs::File>>,
    tail: Arc<Mutex<VecDeque<String>>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(512);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            {
                let mut file = file.lock().await;
                let _ = file.write_all(&buf).await;
                if !buf.ends_with(b"\n") {
                    let _ = file.write_all(b"\n").await;
                }
            }
            let line = String::from_utf8_lossy(&buf).trim_end().to_string();
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    });
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(pid, "SIGTERM failed: {}", e);
            false
        }
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> bool {
    false
}

/// On unix a failing bind with `AddrInUse` means someone is listening.
#[cfg(unix)]
async fn port_ready(host: &str, port: u16) -> bool {
    match std::net::TcpListener::bind((host, port)) {
        Ok(_) => false,
        Err(e) => e.kind() == std::io::ErrorKind::AddrInUse,
    }
}

#[cfg(not(unix))]
async fn port_ready(host: &str, port: u16) -> bool {
    // Wildcard listeners accept on loopback.
    let host = match host {
        "0.0.0.0" => "127.0.0.1",
        "::" => "::1",
        other => other,
    };
    matches!(
        tokio::time::timeout(
            Duration::from_millis(300),
            tokio::net::TcpStream::connect((host, port)),
        )
        .await,
        Ok(Ok(_))
    )
}

/// Ask the OS for an unused loopback port.
pub async fn pick_free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("Failed to reserve a local port")?;
    Ok(listener.local_addr()?.port())
}
