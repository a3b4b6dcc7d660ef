//! Process-handle capability and its OS implementation

use async_trait::async_trait;
use log::{debug, warn};
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

/// Read size for output pumps; small so progress redraws surface quickly
const READ_CHUNK: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Signal operations on a launched process group.
pub trait ProcessSignals: Send + Sync + fmt::Debug {
    fn pause(&self) -> io::Result<()>;
    fn resume(&self) -> io::Result<()>;
    fn terminate(&self) -> io::Result<()>;
    fn kill(&self) -> io::Result<()>;
    fn is_alive(&self) -> bool;
}

/// A launched process: its signal handle, merged output lines and exit code.
///
/// The output channel closes once every output stream reached EOF. The exit
/// channel yields the exit code, or `-signal` when the process was killed.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub signals: Arc<dyn ProcessSignals>,
    pub output: mpsc::UnboundedReceiver<OutputLine>,
    pub exit: oneshot::Receiver<i32>,
}

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, program: &str, args: &[String]) -> io::Result<SpawnedProcess>;
}

/// Spawns real processes, each leading its own process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSpawner;

#[async_trait]
impl ProcessSpawner for OsSpawner {
    async fn spawn(&self, program: &str, args: &[String]) -> io::Result<SpawnedProcess> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("process exited before it could be tracked"))?;
        debug!("process_spawned: {} pid={}", program, pid);

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, OutputStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, OutputStream::Stderr, line_tx));
        }

        let alive = Arc::new(AtomicBool::new(true));
        let (exit_tx, exit_rx) = oneshot::channel();
        let alive_flag = alive.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!("process_wait_failed: pid={} error={}", pid, e);
                    -1
                }
            };
            alive_flag.store(false, Ordering::SeqCst);
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess {
            pid: Some(pid),
            signals: Arc::new(ProcessGroup {
                pgid: pid as libc::pid_t,
                alive,
            }),
            output: line_rx,
            exit: exit_rx,
        })
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}

/// Splits a byte stream on `\n` and `\r`, forwarding non-empty lines.
async fn pump_lines<R>(mut reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("output_read_failed: {:?} error={}", stream, e);
                break;
            }
        };

        for &b in &chunk[..read] {
            if b == b'\n' || b == b'\r' {
                flush_line(&mut pending, stream, &tx);
            } else {
                pending.push(b);
            }
        }
    }

    flush_line(&mut pending, stream, &tx);
}

fn flush_line(pending: &mut Vec<u8>, stream: OutputStream, tx: &mpsc::UnboundedSender<OutputLine>) {
    if pending.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    let _ = tx.send(OutputLine { stream, text });
}

#[derive(Debug)]
struct ProcessGroup {
    pgid: libc::pid_t,
    alive: Arc<AtomicBool>,
}

impl ProcessGroup {
    fn send(&self, signal: libc::c_int) -> io::Result<()> {
        // SAFETY: killpg takes plain integers and has no memory-safety preconditions
        let rc = unsafe { libc::killpg(self.pgid, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl ProcessSignals for ProcessGroup {
    fn pause(&self) -> io::Result<()> {
        self.send(libc::SIGSTOP)
    }

    fn resume(&self) -> io::Result<()> {
        self.send(libc::SIGCONT)
    }

    fn terminate(&self) -> io::Result<()> {
        self.send(libc::SIGTERM)
    }

    fn kill(&self) -> io::Result<()> {
        self.send(libc::SIGKILL)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
