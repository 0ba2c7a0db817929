//! Generator subprocess lifecycle: spawn, observe, and stop sessions keyed
//! by role and port.
mod command;
mod generator;
mod session;


use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::fs::File;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::metrics::MetricSample;
use crate::wire::{
    ClientStartRequest, LifecycleState, MetricsResponse, MetricsSince, Role, SessionKey,
    SessionStatus,
};

pub use generator::{probe_version, resolve_generator};
pub(crate) use session::current_time_ms;

use command::{generator_args, log_file_path};
use session::{MonitorIo, Session, monitor};

pub const DEFAULT_MAX_SERVERS: usize = 50;
pub const DEFAULT_MAX_CLIENTS: usize = 50;
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);
/// A server that exits within this window after spawning failed to bind.
pub const DEFAULT_SERVER_SETTLE: Duration = Duration::from_millis(150);
/// Slack on top of the grace period while waiting for the monitor to settle.
const STOP_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub program: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub stop_grace: Duration,
    pub server_settle: Duration,
    pub max_servers: usize,
    pub max_clients: usize,
}

impl GeneratorConfig {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            log_dir: None,
            stop_grace: DEFAULT_STOP_GRACE,
            server_settle: DEFAULT_SERVER_SETTLE,
            max_servers: DEFAULT_MAX_SERVERS,
            max_clients: DEFAULT_MAX_CLIENTS,
        }
    }

    const fn capacity(&self, role: Role) -> usize {
        match role {
            Role::Server => self.max_servers,
            Role::Client => self.max_clients,
        }
    }
}

/// What to launch. The role is implied by the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionParams {
    Server { port: u16, bind: Option<String> },
    Client(ClientStartRequest),
}

/// Owns every session on this agent. The registry lock guards only the
/// key-to-session map and is never held across process or network I/O.
#[derive(Debug)]
pub struct Supervisor {
    config: GeneratorConfig,
    sessions: Mutex<BTreeMap<SessionKey, Arc<Session>>>,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, BTreeMap<SessionKey, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the generator for `params` and returns its session key.
    ///
    /// # Errors
    ///
    /// Returns a conflict when the key is already active or the role is at
    /// capacity, and a spawn error when the binary cannot be launched or a
    /// server exits before it settles.
    pub async fn start(&self, params: SessionParams) -> Result<SessionKey, SessionError> {
        let key = params.key();
        let session = self.reserve(&params)?;
        match self.launch(&session, &params).await {
            Ok(()) => Ok(key),
            Err(err) => {
                warn!("Session {} failed to start: {}", key, err);
                session.mark_failed(err.to_string());
                Err(err)
            }
        }
    }

    fn reserve(&self, params: &SessionParams) -> Result<Arc<Session>, SessionError> {
        let key = params.key();
        let mut registry = self.registry();
        if registry
            .get(&key)
            .is_some_and(|session| session.state().is_active())
        {
            return Err(SessionError::Conflict {
                key: key.to_string(),
            });
        }
        let active = registry
            .iter()
            .filter(|(other, session)| other.role == key.role && session.state().is_active())
            .count();
        let max = self.config.capacity(key.role);
        if active >= max {
            return Err(SessionError::Capacity {
                role: key.role.as_str(),
                max,
            });
        }
        let session = Arc::new(Session::new(key, params.reverse(), params.parallel()));
        if registry.insert(key, Arc::clone(&session)).is_some() {
            debug!("Reaped finished session {}", key);
        }
        Ok(session)
    }

    async fn launch(&self, session: &Arc<Session>, params: &SessionParams) -> Result<(), SessionError> {
        let key = params.key();
        let args = generator_args(params);
        debug!(
            "Spawning {} {} for {}",
            self.config.program.display(),
            args.join(" "),
            key
        );
        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SessionError::Spawn {
                key: key.to_string(),
                program: self.config.program.display().to_string(),
                source: err,
            })?;

        let Some(stdout) = child.stdout.take() else {
            if let Err(err) = child.kill().await {
                debug!("Failed to kill {} after missing stdout: {}", key, err);
            }
            return Err(SessionError::MissingStdout {
                key: key.to_string(),
            });
        };
        let io = MonitorIo {
            stdout,
            stderr: child.stderr.take(),
            log: self.open_log(session, params).await,
        };

        session.mark_running();
        info!("Session {} running", key);
        tokio::spawn(monitor(Arc::clone(session), child, io, self.config.stop_grace));

        if key.role == Role::Server
            && session.wait_terminal(self.config.server_settle).await
            && session.state() == LifecycleState::Error
        {
            return Err(SessionError::ExitedImmediately {
                key: key.to_string(),
                code: session.status().exit_code,
            });
        }
        Ok(())
    }

    async fn open_log(&self, session: &Session, params: &SessionParams) -> Option<File> {
        let log_dir = self.config.log_dir.as_deref()?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let path = log_file_path(log_dir, params, &stamp);
        match File::create(&path).await {
            Ok(file) => {
                session.set_log_path(path);
                Some(file)
            }
            Err(err) => {
                warn!("Cannot open session log {}: {}", path.display(), err);
                None
            }
        }
    }

    /// Stops one session. Stopping an absent or finished key is a no-op that
    /// returns `false`.
    pub async fn stop(&self, key: SessionKey) -> bool {
        let session = self.registry().get(&key).cloned();
        let Some(session) = session else {
            return false;
        };
        if !session.request_stop() {
            return false;
        }
        info!("Stopping session {}", key);
        let limit = self.config.stop_grace.saturating_add(STOP_SLACK);
        if !session.wait_terminal(limit).await {
            warn!(
                "Session {} did not report exit within {}ms",
                key,
                limit.as_millis()
            );
        }
        true
    }

    /// Stops every active session, optionally restricted to one role, and
    /// returns the keys that were stopped.
    pub async fn stop_all(&self, role: Option<Role>) -> Vec<SessionKey> {
        let keys = self.active_keys(role);
        let results = join_all(keys.iter().map(|key| self.stop(*key))).await;
        keys.into_iter()
            .zip(results)
            .filter_map(|(key, stopped)| stopped.then_some(key))
            .collect()
    }

    #[must_use]
    pub fn active_keys(&self, role: Option<Role>) -> Vec<SessionKey> {
        self.registry()
            .iter()
            .filter(|(key, session)| {
                session.state().is_active() && role.is_none_or(|role| key.role == role)
            })
            .map(|(key, _)| *key)
            .collect()
    }

    /// Samples for one key; an unknown key yields an empty sequence.
    #[must_use]
    pub fn metrics(&self, key: SessionKey, since: MetricsSince) -> Vec<MetricSample> {
        let session = self.registry().get(&key).cloned();
        session.map(|session| session.metrics(since)).unwrap_or_default()
    }

    /// Samples and states for every known session, keyed by session key.
    #[must_use]
    pub fn metrics_all(&self, since: MetricsSince) -> MetricsResponse {
        let sessions: Vec<(SessionKey, Arc<Session>)> = self
            .registry()
            .iter()
            .map(|(key, session)| (*key, Arc::clone(session)))
            .collect();
        let mut response = MetricsResponse::default();
        for (key, session) in sessions {
            response.metrics.insert(key, session.metrics(since));
            response.states.insert(key, session.state());
        }
        response
    }

    #[must_use]
    pub fn status(&self, key: SessionKey) -> LifecycleState {
        self.registry()
            .get(&key)
            .map_or(LifecycleState::Idle, |session| session.state())
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<SessionStatus> {
        let sessions: Vec<Arc<Session>> = self.registry().values().cloned().collect();
        sessions.iter().map(|session| session.status()).collect()
    }

    /// Stops everything; used on agent shutdown.
    pub async fn shutdown(&self) {
        let stopped = self.stop_all(None).await;
        if !stopped.is_empty() {
            info!("Stopped {} session(s) on shutdown", stopped.len());
        }
    }
}
