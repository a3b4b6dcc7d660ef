//! In-memory process fake for tests
//!
//! Each spawn is recorded as a [`FakeProcess`] the test drives by hand:
//! emit output lines, finish with an exit code, inspect received signals.

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

use crate::process::{OutputLine, OutputStream, ProcessSignals, ProcessSpawner, SpawnedProcess};

pub const FAKE_VERSION: &str = "v2.2.2-fake";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeSignal {
    Pause,
    Resume,
    Terminate,
    Kill,
}

#[derive(Debug, Default)]
struct SpawnerState {
    processes: Vec<FakeProcess>,
    fail_next: Option<io::ErrorKind>,
    ignore_terminate: bool,
}

#[derive(Debug, Default)]
pub struct FakeSpawner {
    state: Mutex<SpawnerState>,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next spawn fails with this error kind.
    pub fn fail_next_launch(&self, kind: io::ErrorKind) {
        self.lock().fail_next = Some(kind);
    }

    /// Processes spawned from now on survive SIGTERM.
    pub fn ignore_terminate(&self, ignore: bool) {
        self.lock().ignore_terminate = ignore;
    }

    pub fn launch_count(&self) -> usize {
        self.lock().processes.len()
    }

    /// Panics when fewer than `index + 1` processes were spawned.
    pub fn process(&self, index: usize) -> FakeProcess {
        self.lock().processes[index].clone()
    }

    pub fn last_process(&self) -> Option<FakeProcess> {
        self.lock().processes.last().cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpawnerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(&self, program: &str, args: &[String]) -> io::Result<SpawnedProcess> {
        let mut state = self.lock();
        if let Some(kind) = state.fail_next.take() {
            return Err(io::Error::new(kind, format!("{}: fake launch failure", program)));
        }

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        // Version probes answer immediately and are not recorded
        if args.len() == 1 && args[0] == "version" {
            let _ = line_tx.send(OutputLine {
                stream: OutputStream::Stdout,
                text: FAKE_VERSION.to_string(),
            });
            let _ = exit_tx.send(0);
            return Ok(SpawnedProcess {
                pid: None,
                signals: Arc::new(FakeHandle::exited()),
                output: line_rx,
                exit: exit_rx,
            });
        }

        let handle = Arc::new(FakeHandle {
            output: Mutex::new(Some(line_tx)),
            exit: Mutex::new(Some(exit_tx)),
            received: Mutex::new(Vec::new()),
            ignore_terminate: state.ignore_terminate,
            deny_signals: AtomicBool::new(false),
        });
        let pid = 4000 + state.processes.len() as u32;
        state.processes.push(FakeProcess {
            program: program.to_string(),
            args: args.to_vec(),
            handle: handle.clone(),
        });

        Ok(SpawnedProcess {
            pid: Some(pid),
            signals: handle,
            output: line_rx,
            exit: exit_rx,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FakeProcess {
    program: String,
    args: Vec<String>,
    handle: Arc<FakeHandle>,
}

impl FakeProcess {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn emit(&self, stream: OutputStream, text: &str) {
        if let Some(tx) = self.handle.output.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            let _ = tx.send(OutputLine {
                stream,
                text: text.to_string(),
            });
        }
    }

    pub fn emit_stdout(&self, text: &str) {
        self.emit(OutputStream::Stdout, text);
    }

    pub fn emit_stderr(&self, text: &str) {
        self.emit(OutputStream::Stderr, text);
    }

    /// Writes a progress-bar style line the way the engine redraws it.
    pub fn emit_progress(&self, percent: f64) {
        self.emit_stderr(&format!("{:.2}% 1.0 GiB / 2.0 GiB (64 MiB/s)", percent));
    }

    /// Closes output and reports the exit code.
    pub fn exit(&self, code: i32) {
        self.handle.finish(code);
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    pub fn signals_received(&self) -> Vec<FakeSignal> {
        self.handle.received.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Every signal fails with EPERM while set; nothing is recorded.
    pub fn deny_signals(&self, deny: bool) {
        self.handle.deny_signals.store(deny, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct FakeHandle {
    output: Mutex<Option<mpsc::UnboundedSender<OutputLine>>>,
    exit: Mutex<Option<oneshot::Sender<i32>>>,
    received: Mutex<Vec<FakeSignal>>,
    ignore_terminate: bool,
    deny_signals: AtomicBool,
}

impl FakeHandle {
    fn exited() -> Self {
        Self {
            output: Mutex::new(None),
            exit: Mutex::new(None),
            received: Mutex::new(Vec::new()),
            ignore_terminate: false,
            deny_signals: AtomicBool::new(false),
        }
    }

    fn record(&self, signal: FakeSignal) -> io::Result<()> {
        if self.deny_signals.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        self.received.lock().unwrap_or_else(|p| p.into_inner()).push(signal);
        Ok(())
    }

    fn finish(&self, code: i32) {
        self.output.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(tx) = self.exit.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = tx.send(code);
        }
    }
}

impl ProcessSignals for FakeHandle {
    fn pause(&self) -> io::Result<()> {
        self.record(FakeSignal::Pause)
    }

    fn resume(&self) -> io::Result<()> {
        self.record(FakeSignal::Resume)
    }

    fn terminate(&self) -> io::Result<()> {
        self.record(FakeSignal::Terminate)?;
        if !self.ignore_terminate {
            self.finish(-libc::SIGTERM);
        }
        Ok(())
    }

    fn kill(&self) -> io::Result<()> {
        self.record(FakeSignal::Kill)?;
        self.finish(-libc::SIGKILL);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.exit.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }
}
