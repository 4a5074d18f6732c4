//! Readiness tracking for the backend
//!
//! The gate is the only writer of [`ReadinessState`]. It coalesces concurrent
//! start requests into a single spawn and lets every request wait, up to the
//! startup timeout, for the backend to become ready.
//!
//! Readiness is detected by matching a marker substring (`"listening on"` by
//! default) in the backend's stdout. This depends on the exact wording of a
//! log line: a backend that serves traffic without printing the marker never
//! becomes `Ready`, and requests then wait out the full startup timeout
//! before being proxied anyway.

use crate::process::{BackendObserver, OutputStream, ProcessSupervisor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle of the backend as seen by request handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    /// Never started
    NotStarted,
    /// Spawned, marker not yet seen
    Starting,
    /// Marker seen, accepting traffic
    Ready,
    /// Exited (or failed to spawn); the code is absent when killed by a signal
    Stopped(Option<i32>),
}

impl ReadinessState {
    /// Whether a start request may spawn a new backend from this state
    pub fn can_start(&self) -> bool {
        matches!(self, ReadinessState::NotStarted | ReadinessState::Stopped(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadinessState::NotStarted => "not_started",
            ReadinessState::Starting => "starting",
            ReadinessState::Ready => "ready",
            ReadinessState::Stopped(_) => "stopped",
        }
    }
}

pub struct ReadinessGate {
    supervisor: Arc<ProcessSupervisor>,
    state: watch::Sender<ReadinessState>,
    ready_marker: String,
    startup_timeout: Duration,
    /// Set at shutdown; no further spawns
    closed: AtomicBool,
}

impl ReadinessGate {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Arc<Self> {
        let (state, _) = watch::channel(ReadinessState::NotStarted);
        let config = supervisor.config();
        Arc::new(Self {
            ready_marker: config.ready_marker.clone(),
            startup_timeout: config.startup_timeout(),
            supervisor,
            state,
            closed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> ReadinessState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ReadinessState::Ready
    }

    /// Receiver notified on every state transition
    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state.subscribe()
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn token(&self) -> &str {
        self.supervisor.token()
    }

    /// Make sure the backend has been asked to start, then wait for it.
    ///
    /// Returns as soon as the backend is ready or has stopped, or when the
    /// startup timeout elapses. Never fails: callers proxy regardless and
    /// let the router report an unreachable backend.
    pub async fn ensure_started(self: &Arc<Self>) -> ReadinessState {
        let mut rx = self.state.subscribe();

        if self.begin_start() {
            self.supervisor
                .start(Arc::clone(self) as Arc<dyn BackendObserver>);
        }

        let waited = tokio::time::timeout(
            self.startup_timeout,
            rx.wait_for(|state| *state != ReadinessState::Starting),
        )
        .await;

        match waited {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => self.state(),
            Err(_) => {
                warn!(
                    timeout_ms = self.startup_timeout.as_millis() as u64,
                    "Backend not ready before startup timeout, proxying anyway"
                );
                self.state()
            }
        }
    }

    /// Claim the single in-flight start. Exactly one caller wins per
    /// NotStarted/Stopped period.
    fn begin_start(&self) -> bool {
        self.state.send_if_modified(|state| {
            if self.closed.load(Ordering::SeqCst) {
                debug!("Gate closed, not starting backend");
                false
            } else if state.can_start() {
                *state = ReadinessState::Starting;
                true
            } else {
                false
            }
        })
    }

    /// Refuse further starts and terminate the backend
    pub async fn shutdown(&self) {
        // Under the state lock so no start can be claimed past this point
        self.state.send_if_modified(|_| {
            self.closed.store(true, Ordering::SeqCst);
            false
        });
        self.supervisor.shutdown().await;
    }
}

impl BackendObserver for ReadinessGate {
    fn on_output(&self, stream: OutputStream, line: &str) {
        if stream != OutputStream::Stdout || !line.contains(&self.ready_marker) {
            return;
        }

        let became_ready = self.state.send_if_modified(|state| {
            if *state == ReadinessState::Starting {
                *state = ReadinessState::Ready;
                true
            } else {
                false
            }
        });

        if became_ready {
            info!(pid = self.supervisor.pid(), "Backend is now ready");
        }
    }

    fn on_exit(&self, pid: Option<u32>, code: Option<i32>) {
        let previous = self.state.send_replace(ReadinessState::Stopped(code));
        info!(pid, code, previous = previous.as_str(), "Backend stopped");
    }
}
