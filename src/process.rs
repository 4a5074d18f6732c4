use crate::config::{BackendConfig, STATE_DIR_ENV};
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long to keep reading output after the child exits. Grandchildren can
/// hold the pipes open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Which pipe a line of backend output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Receives everything the supervisor observes about the child.
///
/// `on_exit` is called exactly once per spawn attempt, after the last
/// `on_output` for that child. A failed spawn reports `on_exit(None, None)`.
pub trait BackendObserver: Send + Sync {
    fn on_output(&self, stream: OutputStream, line: &str);
    fn on_exit(&self, pid: Option<u32>, code: Option<i32>);
}

/// The live child, as seen from outside the monitor task
struct BackendHandle {
    /// Spawn sequence number, used to match exits to the handle
    id: u64,
    pid: Option<u32>,
    /// Asks the monitor task to terminate the child
    stop: Arc<Notify>,
    /// Flips to true once the exit has been reported
    exited_rx: watch::Receiver<bool>,
}

/// Owns the backend child process.
///
/// At most one child is alive at a time; [`start`](ProcessSupervisor::start)
/// is a no-op while one is running. The child itself lives inside a monitor
/// task which waits for it, clears the handle and reports the exit.
pub struct ProcessSupervisor {
    config: BackendConfig,
    token: String,
    handle: Mutex<Option<BackendHandle>>,
    spawn_attempts: AtomicU64,
    /// Set under the handle lock at shutdown; no spawns afterwards
    closed: AtomicBool,
}

impl ProcessSupervisor {
    /// Create a supervisor. Returns `Arc<Self>` since monitor tasks keep a
    /// reference back to it.
    pub fn new(config: BackendConfig, token: String) -> Arc<Self> {
        Arc::new(Self {
            config,
            token,
            handle: Mutex::new(None),
            spawn_attempts: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Pid of the live child, if any
    pub fn pid(&self) -> Option<u32> {
        self.handle.lock().as_ref().and_then(|h| h.pid)
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Number of times a spawn has been attempted
    pub fn spawn_attempts(&self) -> u64 {
        self.spawn_attempts.load(Ordering::SeqCst)
    }

    /// Spawn the backend unless one is already alive.
    ///
    /// Returns the pid of the live child. Spawn failures are not returned as
    /// errors; they are reported to `observer` as an exit.
    pub fn start(self: &Arc<Self>, observer: Arc<dyn BackendObserver>) -> Option<u32> {
        let mut slot = self.handle.lock();
        if let Some(existing) = slot.as_ref() {
            debug!(pid = existing.pid, "Backend already running");
            return existing.pid;
        }

        if self.closed.load(Ordering::SeqCst) {
            drop(slot);
            debug!("Supervisor shut down, not spawning backend");
            observer.on_exit(None, None);
            return None;
        }

        let id = self.spawn_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let args = self.config.launch_args(&self.token);

        info!(command = %self.config.command, port = self.config.port, "Starting backend");

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        cmd.env(STATE_DIR_ENV, &self.config.state_dir);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                drop(slot);
                error!(command = %self.config.command, error = %e, "Failed to spawn backend");
                observer.on_exit(None, None);
                return None;
            }
        };

        let pid = child.id();
        info!(pid, "Backend process spawned");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, OutputStream::Stdout, Arc::clone(&observer)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, OutputStream::Stderr, Arc::clone(&observer)));
        }

        let stop = Arc::new(Notify::new());
        let (exited_tx, exited_rx) = watch::channel(false);

        *slot = Some(BackendHandle {
            id,
            pid,
            stop: Arc::clone(&stop),
            exited_rx,
        });
        drop(slot);

        let supervisor = Arc::clone(self);
        let grace_period = self.config.shutdown_grace_period();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = stop.notified() => terminate(&mut child, grace_period).await,
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(pid, error = %e, "Error waiting for backend to exit");
                    None
                }
            };

            drain_readers(readers).await;
            supervisor.clear(id);

            info!(pid, code, "Backend exited");
            observer.on_exit(pid, code);
            let _ = exited_tx.send(true);
        });

        pid
    }

    /// Terminate the live child (SIGTERM, then SIGKILL after the grace
    /// period) and wait until its exit has been reported.
    pub async fn stop(&self) {
        let (stop, mut exited_rx, pid) = {
            let slot = self.handle.lock();
            match slot.as_ref() {
                Some(h) => (Arc::clone(&h.stop), h.exited_rx.clone(), h.pid),
                None => return,
            }
        };

        info!(pid, "Stopping backend");
        stop.notify_one();
        let _ = exited_rx.wait_for(|exited| *exited).await;
    }

    /// Refuse any further spawns, then stop the live child.
    ///
    /// The flag is set under the handle lock, so a concurrent `start` either
    /// lands its child in the slot before this runs (and is stopped) or sees
    /// the flag and spawns nothing.
    pub async fn shutdown(&self) {
        {
            let _slot = self.handle.lock();
            self.closed.store(true, Ordering::SeqCst);
        }
        self.stop().await;
    }

    fn clear(&self, id: u64) {
        let mut slot = self.handle.lock();
        if slot.as_ref().map(|h| h.id) == Some(id) {
            *slot = None;
        }
    }
}

fn spawn_line_reader<R>(
    pipe: R,
    stream: OutputStream,
    observer: Arc<dyn BackendObserver>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Decode lossily; closing the pipe early would SIGPIPE the child
                    let decoded = String::from_utf8_lossy(&buf);
                    let line = decoded.trim_end_matches(['\n', '\r']);
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        match stream {
                            OutputStream::Stdout => {
                                info!(target: "gateway", stream = stream.as_str(), "{}", trimmed)
                            }
                            OutputStream::Stderr => {
                                warn!(target: "gateway", stream = stream.as_str(), "{}", trimmed)
                            }
                        }
                    }
                    observer.on_output(stream, line);
                }
                Err(e) => {
                    debug!(stream = stream.as_str(), error = %e, "Backend output stream closed");
                    break;
                }
            }
        }
    })
}

async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader).await.is_err() {
            debug!("Backend output still open after exit, detaching");
            reader.abort();
        }
    }
}

async fn terminate(child: &mut Child, grace_period: Duration) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        info!(pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Line(OutputStream, String),
        Exit(Option<u32>, Option<i32>),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
        exited: Notify,
    }

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }

        fn exits(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, Event::Exit(..)))
                .count()
        }

        async fn wait_exit(&self) {
            tokio::time::timeout(Duration::from_secs(5), self.exited.notified())
                .await
                .expect("backend did not exit in time");
        }
    }

    impl BackendObserver for Recorder {
        fn on_output(&self, stream: OutputStream, line: &str) {
            self.events.lock().push(Event::Line(stream, line.to_string()));
        }

        fn on_exit(&self, pid: Option<u32>, code: Option<i32>) {
            self.events.lock().push(Event::Exit(pid, code));
            self.exited.notify_one();
        }
    }

    fn sh_config(script: &str) -> BackendConfig {
        let mut config = BackendConfig::local("sh", 4321).with_args(vec![
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
        ]);
        config.shutdown_grace_period_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_exit() {
        let supervisor = ProcessSupervisor::new(
            BackendConfig::local("/nonexistent/gatewrap-backend", 4321),
            "tok".to_string(),
        );
        let recorder = Arc::new(Recorder::default());

        assert_eq!(supervisor.start(recorder.clone()), None);
        assert_eq!(recorder.events(), vec![Event::Exit(None, None)]);
        assert_eq!(supervisor.spawn_attempts(), 1);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let supervisor = ProcessSupervisor::new(sh_config("exec sleep 30"), "tok".to_string());
        let recorder = Arc::new(Recorder::default());

        let first = supervisor.start(recorder.clone());
        let second = supervisor.start(recorder.clone());

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(supervisor.spawn_attempts(), 1);
        assert!(supervisor.is_running());

        supervisor.stop().await;
        assert!(!supervisor.is_running());
        assert_eq!(recorder.exits(), 1);
    }

    #[tokio::test]
    async fn test_output_is_forwarded_before_exit() {
        let supervisor = ProcessSupervisor::new(
            sh_config("echo hello; echo oops 1>&2; exit 3"),
            "tok".to_string(),
        );
        let recorder = Arc::new(Recorder::default());

        let pid = supervisor.start(recorder.clone());
        recorder.wait_exit().await;

        let events = recorder.events();
        assert!(events.contains(&Event::Line(OutputStream::Stdout, "hello".to_string())));
        assert!(events.contains(&Event::Line(OutputStream::Stderr, "oops".to_string())));
        assert_eq!(events.last(), Some(&Event::Exit(pid, Some(3))));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_launch_args_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(r#"echo "$@"; echo "state=$OPENCLAW_STATE_DIR""#)
            .with_state_dir(dir.path());
        let supervisor = ProcessSupervisor::new(config, "secret".to_string());
        let recorder = Arc::new(Recorder::default());

        supervisor.start(recorder.clone());
        recorder.wait_exit().await;

        let events = recorder.events();
        assert!(events.contains(&Event::Line(
            OutputStream::Stdout,
            "--bind loopback --port 4321 --token secret --allow-unconfigured".to_string()
        )));
        assert!(events.contains(&Event::Line(
            OutputStream::Stdout,
            format!("state={}", dir.path().display())
        )));
    }

    #[tokio::test]
    async fn test_stop_terminates_child() {
        let supervisor = ProcessSupervisor::new(sh_config("exec sleep 30"), "tok".to_string());
        let recorder = Arc::new(Recorder::default());

        let pid = supervisor.start(recorder.clone());
        assert_eq!(supervisor.pid(), pid);

        tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .expect("stop should finish within the grace period");

        assert!(!supervisor.is_running());
        // Killed by a signal, so no exit code
        assert_eq!(recorder.events(), vec![Event::Exit(pid, None)]);
    }

    #[tokio::test]
    async fn test_stop_without_child_is_noop() {
        let supervisor = ProcessSupervisor::new(sh_config("true"), "tok".to_string());
        supervisor.stop().await;
        assert_eq!(supervisor.spawn_attempts(), 0);
    }

    #[tokio::test]
    async fn test_no_spawn_after_shutdown() {
        let supervisor = ProcessSupervisor::new(sh_config("exec sleep 30"), "tok".to_string());
        let recorder = Arc::new(Recorder::default());

        let pid = supervisor.start(recorder.clone());
        supervisor.shutdown().await;
        assert_eq!(recorder.events(), vec![Event::Exit(pid, None)]);

        // A start that lost the race still reports an exit so waiters are released
        assert_eq!(supervisor.start(recorder.clone()), None);
        assert_eq!(recorder.exits(), 2);
        assert_eq!(supervisor.spawn_attempts(), 1);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_pipe_open() {
        let supervisor = ProcessSupervisor::new(
            sh_config(r"printf 'boot \377\n'; sleep 0.1; echo after; exit 4"),
            "tok".to_string(),
        );
        let recorder = Arc::new(Recorder::default());

        let pid = supervisor.start(recorder.clone());
        recorder.wait_exit().await;

        let events = recorder.events();
        assert!(events.contains(&Event::Line(OutputStream::Stdout, "boot \u{FFFD}".to_string())));
        assert!(events.contains(&Event::Line(OutputStream::Stdout, "after".to_string())));
        // Exited on its own terms, not through SIGPIPE
        assert_eq!(events.last(), Some(&Event::Exit(pid, Some(4))));
    }

    #[tokio::test]
    async fn test_restart_after_exit() {
        let supervisor = ProcessSupervisor::new(sh_config("exit 0"), "tok".to_string());
        let recorder = Arc::new(Recorder::default());

        supervisor.start(recorder.clone());
        recorder.wait_exit().await;
        supervisor.start(recorder.clone());
        recorder.wait_exit().await;

        assert_eq!(supervisor.spawn_attempts(), 2);
        assert_eq!(recorder.exits(), 2);
    }
}
