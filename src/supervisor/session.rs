use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::metrics::{IntervalLine, MetricSample, ParseContext, parse_interval};
use crate::wire::{LifecycleState, MetricsSince, Role, SessionKey, SessionStatus};

/// Upper bound on draining buffered output after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct SessionData {
    samples: Vec<MetricSample>,
    cursor: usize,
    exit_code: Option<i32>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    log_path: Option<PathBuf>,
}

impl SessionData {
    /// Drops the undrained per-stream samples a `[SUM]` sample replaces.
    fn fold_streams(&mut self, sum: &MetricSample) {
        let cursor = self.cursor.min(self.samples.len());
        let fresh = self.samples.split_off(cursor);
        self.samples.extend(
            fresh
                .into_iter()
                .filter(|sample| !sample.same_interval(sum)),
        );
    }
}

/// One generator invocation. The monitor task is the only writer of samples
/// and of the final lifecycle state.
#[derive(Debug)]
pub(super) struct Session {
    key: SessionKey,
    reverse: bool,
    parallel: u32,
    lifecycle: watch::Sender<LifecycleState>,
    stop_requested: watch::Sender<bool>,
    data: Mutex<SessionData>,
}

impl Session {
    pub(super) fn new(key: SessionKey, reverse: bool, parallel: u32) -> Self {
        let (lifecycle, _) = watch::channel(LifecycleState::Starting);
        let (stop_requested, _) = watch::channel(false);
        Self {
            key,
            reverse,
            parallel,
            lifecycle,
            stop_requested,
            data: Mutex::new(SessionData::default()),
        }
    }

    fn data(&self) -> MutexGuard<'_, SessionData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn state(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    pub(super) fn set_log_path(&self, path: PathBuf) {
        self.data().log_path = Some(path);
    }

    /// `starting -> running`; a stop that raced the launch wins.
    pub(super) fn mark_running(&self) {
        self.data().started_at = Some(Utc::now());
        self.lifecycle.send_if_modified(|state| {
            if *state == LifecycleState::Starting {
                *state = LifecycleState::Running;
                true
            } else {
                false
            }
        });
    }

    pub(super) fn mark_failed(&self, message: String) {
        {
            let mut data = self.data();
            data.error = Some(message);
            data.stopped_at = Some(Utc::now());
        }
        self.lifecycle.send_replace(LifecycleState::Error);
    }

    fn finish(&self, status: Option<ExitStatus>, stderr_tail: Option<String>) {
        let requested = *self.stop_requested.borrow();
        let code = status.and_then(|status| status.code());
        let clean = status.is_some_and(|status| status.success());
        let next = if requested || clean {
            LifecycleState::Stopped
        } else {
            LifecycleState::Error
        };
        {
            let mut data = self.data();
            data.exit_code = code;
            data.stopped_at = Some(Utc::now());
            if next == LifecycleState::Error {
                data.error = Some(stderr_tail.unwrap_or_else(|| {
                    code.map_or_else(
                        || "generator terminated by signal".to_owned(),
                        |code| format!("generator exited with code {}", code),
                    )
                }));
            }
        }
        self.lifecycle.send_replace(next);
        info!("Session {} finished: {:?} (exit code {:?})", self.key, next, code);
    }

    /// Returns `false` when the session was already past `running`.
    pub(super) fn request_stop(&self) -> bool {
        let changed = self.lifecycle.send_if_modified(|state| {
            if state.is_active() && *state != LifecycleState::Stopping {
                *state = LifecycleState::Stopping;
                true
            } else {
                false
            }
        });
        self.stop_requested.send_replace(true);
        changed
    }

    /// Waits until the monitor has recorded a terminal state.
    pub(super) async fn wait_terminal(&self, limit: Duration) -> bool {
        let mut lifecycle = self.lifecycle.subscribe();
        tokio::time::timeout(limit, lifecycle.wait_for(|state| state.is_terminal()))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    /// Feeds one line of generator output through the parser.
    pub(super) fn ingest(&self, line: &str) {
        let context = self.parse_context();
        if let Some(parsed) = parse_interval(line, &context)
            && context.keeps(&parsed)
        {
            self.record(parsed);
        }
    }

    fn record(&self, parsed: IntervalLine) {
        let mut data = self.data();
        if parsed.aggregate && self.key.role == Role::Server {
            data.fold_streams(&parsed.sample);
        }
        data.samples.push(parsed.sample);
    }

    pub(super) fn metrics(&self, since: MetricsSince) -> Vec<MetricSample> {
        let mut data = self.data();
        match since {
            MetricsSince::Start => data.samples.clone(),
            MetricsSince::Last => {
                let fresh = data.samples.get(data.cursor..).unwrap_or_default().to_vec();
                data.cursor = data.samples.len();
                fresh
            }
        }
    }

    pub(super) fn status(&self) -> SessionStatus {
        let data = self.data();
        SessionStatus {
            key: self.key,
            role: self.key.role,
            port: self.key.port,
            state: self.state(),
            exit_code: data.exit_code,
            error: data.error.clone(),
            started_at: data.started_at.map(|value| value.to_rfc3339()),
            stopped_at: data.stopped_at.map(|value| value.to_rfc3339()),
            samples: data.samples.len(),
            log_path: data
                .log_path
                .as_ref()
                .map(|path| path.display().to_string()),
        }
    }

    fn parse_context(&self) -> ParseContext {
        ParseContext {
            session: self.key,
            reverse: self.reverse,
            parallel: self.parallel,
            timestamp_ms: current_time_ms(),
        }
    }

    pub(super) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_requested.subscribe()
    }
}

pub(super) struct MonitorIo {
    pub(super) stdout: ChildStdout,
    pub(super) stderr: Option<ChildStderr>,
    pub(super) log: Option<File>,
}

/// Owns the child until it exits: reads output, records samples, and
/// terminates the process when a stop is requested.
pub(super) async fn monitor(
    session: std::sync::Arc<Session>,
    mut child: Child,
    io: MonitorIo,
    grace: Duration,
) {
    let mut stop_signal = session.stop_signal();
    let mut stdout = Some(BufReader::new(io.stdout).lines());
    let mut stderr = io.stderr.map(|stream| BufReader::new(stream).lines());
    let mut log = io.log;
    let mut stderr_tail: Option<String> = None;

    let status = if *stop_signal.borrow_and_update() {
        terminate(&mut child, grace, session.key).await
    } else {
        loop {
            tokio::select! {
                line = next_line(&mut stdout) => match line {
                    Some(line) => record_line(&session, &mut log, &line).await,
                    None => stdout = None,
                },
                line = next_line(&mut stderr) => match line {
                    Some(line) => {
                        write_log(&mut log, &line).await;
                        if !line.trim().is_empty() {
                            stderr_tail = Some(line.trim().to_owned());
                        }
                    }
                    None => stderr = None,
                },
                changed = stop_signal.changed() => {
                    if changed.is_err() || *stop_signal.borrow() {
                        break terminate(&mut child, grace, session.key).await;
                    }
                }
                status = child.wait() => break status.ok(),
            }
        }
    };

    drain(&session, &mut stdout, &mut log).await;
    if let Some(file) = log.as_mut()
        && let Err(err) = file.flush().await
    {
        debug!("Failed to flush log for {}: {}", session.key, err);
    }
    session.finish(status, stderr_tail);
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> Option<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match lines.as_mut() {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

async fn record_line(session: &Session, log: &mut Option<File>, line: &str) {
    write_log(log, line).await;
    session.ingest(line);
}

async fn drain(
    session: &Session,
    stdout: &mut Option<Lines<BufReader<ChildStdout>>>,
    log: &mut Option<File>,
) {
    let Some(lines) = stdout.as_mut() else {
        return;
    };
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Ok(Some(line)) = lines.next_line().await {
            record_line(session, log, &line).await;
        }
    })
    .await;
    if drained.is_err() {
        debug!("Output of {} still open after exit; dropping it", session.key);
    }
}

async fn write_log(log: &mut Option<File>, line: &str) {
    let Some(file) = log.as_mut() else {
        return;
    };
    let mut bytes = Vec::with_capacity(line.len().saturating_add(1));
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');
    if let Err(err) = file.write_all(&bytes).await {
        warn!("Session log write failed, disabling it: {}", err);
        *log = None;
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration, key: SessionKey) -> Option<ExitStatus> {
    send_terminate(child, key);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            warn!(
                "Session {} ignored termination for {}ms; killing",
                key,
                grace.as_millis()
            );
            if let Err(err) = child.kill().await {
                warn!("Failed to kill session {}: {}", key, err);
            }
            child.wait().await.ok()
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child, key: SessionKey) {
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // Safety: kill(2) with a pid we spawned and still own; no memory is shared.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        debug!(
            "SIGTERM to session {} failed: {}",
            key,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, key: SessionKey) {
    if let Err(err) = child.start_kill() {
        debug!("Terminating session {} failed: {}", key, err);
    }
}

pub(crate) fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
