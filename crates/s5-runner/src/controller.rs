//! Per-transfer controller: launch, progress, signals, completion

use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout, Instant};

use crate::args::TransferArgs;
use crate::error::TransferError;
use crate::process::{OutputLine, OutputStream, ProcessSignals, ProcessSpawner};
use crate::progress::{parse_percent, ProgressTracker};

/// Grace period between SIGTERM and SIGKILL
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

const LIVENESS_POLL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(2);
/// Output still buffered after exit is drained for at most this long
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const ERROR_TAIL_LINES: usize = 5;
const NO_SPACE_MARKER: &str = "no space left on device";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    Paused,
    Cancelling,
    Exited,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Running => write!(f, "running"),
            ControllerState::Paused => write!(f, "paused"),
            ControllerState::Cancelling => write!(f, "cancelling"),
            ControllerState::Exited => write!(f, "exited"),
        }
    }
}

/// Final state of one engine process.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub exit_code: i32,
    pub cancelled: bool,
    pub progress: f64,
    pub error_detail: Option<String>,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.cancelled && self.error_detail.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Process was gone before any signal was needed
    AlreadyExited,
    /// Exited within the grace period after SIGTERM
    Terminated,
    /// Needed SIGKILL
    Killed,
}

/// Receivers handed to the owner of a controller.
///
/// `completion` resolves exactly once per process, whatever ended it.
#[derive(Debug)]
pub struct TransferEvents {
    pub progress: watch::Receiver<f64>,
    pub completion: oneshot::Receiver<TransferOutcome>,
}

#[derive(Debug)]
pub struct TransferController {
    pid: Option<u32>,
    signals: Arc<dyn ProcessSignals>,
    state: Arc<Mutex<ControllerState>>,
    cancelled: Arc<AtomicBool>,
}

impl TransferController {
    /// Validates the arguments and launches the engine.
    ///
    /// Launch failures surface here; nothing is left running on error.
    pub async fn start(
        spawner: &dyn ProcessSpawner,
        program: &str,
        args: &TransferArgs,
    ) -> Result<(Self, TransferEvents), TransferError> {
        args.validate()?;
        let argv = args.to_argv();
        info!("transfer_start: {} {}", program, argv.join(" "));

        let process = spawner
            .spawn(program, &argv)
            .await
            .map_err(|source| TransferError::Launch {
                program: program.to_string(),
                source,
            })?;

        let state = Arc::new(Mutex::new(ControllerState::Running));
        let cancelled = Arc::new(AtomicBool::new(false));
        let (progress_tx, progress_rx) = watch::channel(0.0);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(supervise(
            process.pid,
            process.output,
            process.exit,
            process.signals.clone(),
            progress_tx,
            done_tx,
            state.clone(),
            cancelled.clone(),
        ));

        Ok((
            Self {
                pid: process.pid,
                signals: process.signals,
                state,
                cancelled,
            },
            TransferEvents {
                progress: progress_rx,
                completion: done_rx,
            },
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ControllerState {
        *self.lock_state()
    }

    pub fn is_alive(&self) -> bool {
        self.signals.is_alive()
    }

    /// Stops the process group; buffered output is kept.
    pub fn pause(&self) -> Result<(), TransferError> {
        let mut state = self.lock_state();
        if *state != ControllerState::Running {
            return Err(TransferError::InvalidState {
                action: "pause",
                state: *state,
            });
        }
        self.signals.pause()?;
        *state = ControllerState::Paused;
        info!("transfer_paused: pid={:?}", self.pid);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), TransferError> {
        let mut state = self.lock_state();
        if *state != ControllerState::Paused {
            return Err(TransferError::InvalidState {
                action: "resume",
                state: *state,
            });
        }
        self.signals.resume()?;
        *state = ControllerState::Running;
        info!("transfer_resumed: pid={:?}", self.pid);
        Ok(())
    }

    /// SIGTERM, wait up to `graceful_timeout`, then SIGKILL.
    ///
    /// Returns once the process is observed gone, or after the kill wait.
    /// A signal that cannot be delivered restores the previous state, so
    /// the cancel can be retried.
    pub async fn cancel(&self, graceful_timeout: Duration) -> Result<CancelOutcome, TransferError> {
        let previous = {
            let mut state = self.lock_state();
            match *state {
                ControllerState::Cancelling => {
                    return Err(TransferError::InvalidState {
                        action: "cancel",
                        state: *state,
                    })
                }
                ControllerState::Exited => {
                    self.cancelled.store(true, Ordering::SeqCst);
                    return Ok(CancelOutcome::AlreadyExited);
                }
                current => {
                    *state = ControllerState::Cancelling;
                    current
                }
            }
        };
        self.cancelled.store(true, Ordering::SeqCst);

        if !self.signals.is_alive() {
            return Ok(CancelOutcome::AlreadyExited);
        }

        match self.escalate(graceful_timeout).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.cancelled.store(false, Ordering::SeqCst);
                let mut state = self.lock_state();
                if *state == ControllerState::Cancelling {
                    *state = previous;
                }
                error!("transfer_cancel: pid={:?} signal failed: {}", self.pid, e);
                Err(e.into())
            }
        }
    }

    async fn escalate(&self, graceful_timeout: Duration) -> io::Result<CancelOutcome> {
        info!("transfer_cancel: pid={:?} grace={:?}", self.pid, graceful_timeout);
        ignore_missing(self.signals.terminate())?;
        // A stopped group only acts on SIGTERM once continued
        ignore_missing(self.signals.resume())?;

        let deadline = Instant::now() + graceful_timeout;
        while self.signals.is_alive() && Instant::now() < deadline {
            sleep(LIVENESS_POLL).await;
        }
        if !self.signals.is_alive() {
            return Ok(CancelOutcome::Terminated);
        }

        warn!("transfer_cancel: pid={:?} ignored SIGTERM, killing", self.pid);
        ignore_missing(self.signals.kill())?;
        let kill_deadline = Instant::now() + KILL_WAIT;
        while self.signals.is_alive() && Instant::now() < kill_deadline {
            sleep(LIVENESS_POLL).await;
        }
        if self.signals.is_alive() {
            error!("transfer_cancel: pid={:?} still alive after SIGKILL", self.pid);
        }
        Ok(CancelOutcome::Killed)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// ESRCH means the group is already gone, which is what the caller wanted.
fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
        other => other,
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    pid: Option<u32>,
    mut output: mpsc::UnboundedReceiver<OutputLine>,
    mut exit: oneshot::Receiver<i32>,
    signals: Arc<dyn ProcessSignals>,
    progress_tx: watch::Sender<f64>,
    done_tx: oneshot::Sender<TransferOutcome>,
    state: Arc<Mutex<ControllerState>>,
    cancelled: Arc<AtomicBool>,
) {
    let mut scan = OutputScan::default();
    let mut exit_code: Option<i32> = None;
    let mut output_open = true;

    while output_open && exit_code.is_none() {
        tokio::select! {
            line = output.recv() => match line {
                Some(line) => scan.observe(&line, &progress_tx, signals.as_ref()),
                None => output_open = false,
            },
            code = &mut exit => exit_code = Some(code.unwrap_or(-1)),
        }
    }

    let code = match exit_code {
        Some(code) => code,
        None => (&mut exit).await.unwrap_or(-1),
    };

    // Lines written just before exit may still be in flight
    while output_open {
        match timeout(DRAIN_GRACE, output.recv()).await {
            Ok(Some(line)) => scan.observe(&line, &progress_tx, signals.as_ref()),
            Ok(None) | Err(_) => output_open = false,
        }
    }

    if let Ok(mut state) = state.lock() {
        *state = ControllerState::Exited;
    }

    let was_cancelled = cancelled.load(Ordering::SeqCst);
    let outcome = scan.into_outcome(code, was_cancelled);
    if outcome.is_success() {
        info!("transfer_exit: pid={:?} code=0", pid);
    } else if was_cancelled {
        info!("transfer_exit: pid={:?} code={} (cancelled)", pid, code);
    } else {
        warn!(
            "transfer_exit: pid={:?} code={} error={}",
            pid,
            code,
            outcome.error_detail.as_deref().unwrap_or("")
        );
    }
    let _ = done_tx.send(outcome);
}

#[derive(Default)]
struct OutputScan {
    tracker: ProgressTracker,
    stderr_tail: VecDeque<String>,
    fatal: Option<String>,
}

impl OutputScan {
    fn observe(&mut self, line: &OutputLine, progress_tx: &watch::Sender<f64>, signals: &dyn ProcessSignals) {
        if let Some(percent) = parse_percent(&line.text) {
            if let Some(value) = self.tracker.observe(percent) {
                debug!("transfer_progress: {:.2}%", value);
                progress_tx.send_replace(value);
            }
            return;
        }

        if line.stream != OutputStream::Stderr {
            return;
        }
        let trimmed = line.text.trim();
        if trimmed.is_empty() {
            return;
        }

        if self.fatal.is_none() && trimmed.to_lowercase().contains(NO_SPACE_MARKER) {
            let message = format!(
                "No space left on device at {:.1}% progress",
                self.tracker.value()
            );
            error!("transfer_fatal: {}", message);
            self.fatal = Some(message);
            let _ = signals.terminate();
            let _ = signals.resume();
        }

        if self.stderr_tail.len() == ERROR_TAIL_LINES {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(trimmed.to_string());
    }

    fn into_outcome(self, exit_code: i32, cancelled: bool) -> TransferOutcome {
        let error_detail = if cancelled {
            None
        } else if let Some(fatal) = self.fatal {
            Some(fatal)
        } else if exit_code != 0 {
            if self.stderr_tail.is_empty() {
                Some(format!("exit code {}", exit_code))
            } else {
                Some(Vec::from(self.stderr_tail).join("\n"))
            }
        } else {
            None
        };

        TransferOutcome {
            exit_code,
            cancelled,
            progress: self.tracker.value(),
            error_detail,
        }
    }
}

/// Runs `<program> version` and returns its first stdout line.
pub async fn probe_version(spawner: &dyn ProcessSpawner, program: &str) -> Result<String, TransferError> {
    let mut process = spawner
        .spawn(program, &["version".to_string()])
        .await
        .map_err(|source| TransferError::Launch {
            program: program.to_string(),
            source,
        })?;

    let mut first_line = None;
    while let Some(line) = process.output.recv().await {
        if first_line.is_none() && line.stream == OutputStream::Stdout {
            first_line = Some(line.text.trim().to_string());
        }
    }
    let code = process.exit.await.unwrap_or(-1);
    if code != 0 {
        return Err(TransferError::Launch {
            program: program.to_string(),
            source: io::Error::other(format!("version probe exited with code {}", code)),
        });
    }
    Ok(first_line.unwrap_or_default())
}
