//! Session registry.
//!
//! [`SessionManager`] is the only component that creates or destroys backend
//! sessions. It owns one table keyed by the rendered [`SessionKey`], guarded
//! by a single reader/writer lock that is never held across backend I/O.
//!
//! Creation is double-checked: a caller that misses on the read path takes
//! the write lock, checks again, and reserves the key with a `Creating` slot
//! before calling the backend. Concurrent callers for the same key find the
//! reservation and wait for its outcome instead of creating a second sandbox.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::{BackendError, SandboxBackend};
use crate::records::{SessionRecord, SessionRecordStore};
use crate::session::{CodeSession, Scope, SessionConfig, SessionKey, SessionStatus};
use crate::settings::SandboxSettings;

/// Errors returned by the [`SessionManager`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// No usable session under this key or id.
    #[error("session not found: {0}")]
    NotFound(String),
    /// The backend failed.
    #[error("{operation} failed: {source}")]
    Backend {
        /// Manager operation that failed
        operation: &'static str,
        /// Backend error
        #[source]
        source: BackendError,
    },
    /// The session was destroyed while its sandbox was being created.
    #[error("session {0} was destroyed while it was being created")]
    CreationAborted(String),
    /// Another caller's creation of this session failed.
    #[error("creating session {key} failed: {message}")]
    CreationFailed {
        /// Rendered key
        key: String,
        /// Creator's error
        message: String,
    },
    /// Some sessions could not be destroyed. The rest were.
    #[error("{failed} of {total} sessions failed to clean up: {}", .details.join("; "))]
    Cleanup {
        /// Number of failures
        failed: usize,
        /// Number of sessions the cleanup tried to destroy
        total: usize,
        /// One message per failure
        details: Vec<String>,
    },
    /// The session table is unusable.
    #[error("session table unavailable: {0}")]
    Unavailable(String),
}

impl SessionError {
    /// Whether the backend reported the sandbox itself as gone.
    pub fn is_session_gone(&self) -> bool {
        matches!(self, SessionError::Backend { source, .. } if source.is_session_gone())
    }
}

struct Usage {
    at: Instant,
    wall: DateTime<Utc>,
}

/// A live session in the table.
struct Entry {
    session: CodeSession,
    usage: Mutex<Usage>,
    leases: AtomicUsize,
    failed: AtomicBool,
}

impl Entry {
    fn new(session: CodeSession) -> Self {
        let wall = session.last_used_at;
        Self {
            session,
            usage: Mutex::new(Usage {
                at: Instant::now(),
                wall,
            }),
            leases: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        let mut usage = self.usage.lock().unwrap_or_else(|p| p.into_inner());
        usage.at = Instant::now();
        usage.wall = Utc::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let usage = self.usage.lock().unwrap_or_else(|p| p.into_inner());
        now.saturating_duration_since(usage.at)
    }

    fn is_usable(&self) -> bool {
        !self.failed.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> CodeSession {
        let mut session = self.session.clone();
        session.last_used_at = self.usage.lock().unwrap_or_else(|p| p.into_inner()).wall;
        session.status = if self.failed.load(Ordering::SeqCst) {
            SessionStatus::Error
        } else if self.leases.load(Ordering::SeqCst) > 0 {
            SessionStatus::Busy
        } else {
            SessionStatus::Ready
        };
        session
    }
}

type CreationOutcome = Option<Result<(), String>>;

enum Lookup {
    Live(CodeSession),
    Creating(watch::Receiver<CreationOutcome>),
    Missing,
}

enum Slot {
    Creating {
        token: u64,
        outcome: watch::Receiver<CreationOutcome>,
    },
    Live(Arc<Entry>),
}

#[derive(Default)]
struct Table {
    slots: HashMap<String, Slot>,
    by_id: HashMap<String, String>,
}

impl Table {
    fn remove_live(&mut self, rendered: &str) -> Option<Arc<Entry>> {
        match self.slots.remove(rendered)? {
            Slot::Live(entry) => {
                self.by_id.remove(&entry.session.id);
                Some(entry)
            }
            Slot::Creating { .. } => None,
        }
    }

    fn live(&self, rendered: &str) -> Option<&Arc<Entry>> {
        match self.slots.get(rendered)? {
            Slot::Live(entry) => Some(entry),
            Slot::Creating { .. } => None,
        }
    }

    fn usable_by_id(&self, id: &str) -> Result<&Arc<Entry>, SessionError> {
        self.by_id
            .get(id)
            .and_then(|rendered| self.live(rendered))
            .filter(|entry| entry.is_usable())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }
}

struct Inner {
    backend: Arc<dyn SandboxBackend>,
    records: Option<Arc<dyn SessionRecordStore>>,
    table: RwLock<Table>,
    next_token: AtomicU64,
}

impl Inner {
    async fn record_created(&self, session: &CodeSession) {
        let Some(records) = &self.records else {
            return;
        };
        let record = SessionRecord::from_session(session, self.backend.name());
        if let Err(e) = records.put(record).await {
            tracing::warn!(session_key = %session.key, error = %e, "failed to record session");
        }
    }

    async fn record_used(&self, session: &CodeSession) {
        let Some(records) = &self.records else {
            return;
        };
        match records.update_last_used(&session.key).await {
            Ok(true) => {}
            // Expired or never written: describe the session afresh.
            Ok(false) => self.record_created(session).await,
            Err(e) => {
                tracing::warn!(session_key = %session.key, error = %e, "failed to refresh session record");
            }
        }
    }

    async fn forget(&self, key: &SessionKey) {
        let Some(records) = &self.records else {
            return;
        };
        if let Err(e) = records.delete(key).await {
            tracing::warn!(session_key = %key, error = %e, "failed to delete session record");
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Table>, SessionError> {
        self.table
            .read()
            .map_err(|_| SessionError::Unavailable("lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Table>, SessionError> {
        self.table
            .write()
            .map_err(|_| SessionError::Unavailable("lock poisoned".into()))
    }

    /// Destroy already-unregistered sessions, collecting failures.
    async fn destroy_all(&self, entries: Vec<Arc<Entry>>) -> Result<usize, SessionError> {
        let total = entries.len();
        let mut details = Vec::new();
        for entry in entries {
            let handle = &entry.session.container_handle;
            match self.backend.destroy_session(handle).await {
                Ok(()) => {
                    self.forget(&entry.session.key).await;
                    tracing::info!(
                        session_key = %entry.session.key,
                        session_id = %entry.session.id,
                        container = %handle,
                        "session destroyed"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        session_key = %entry.session.key,
                        container = %handle,
                        error = %e,
                        "failed to destroy session"
                    );
                    details.push(format!("{}: {e}", entry.session.key));
                }
            }
        }
        if details.is_empty() {
            Ok(total)
        } else {
            Err(SessionError::Cleanup {
                failed: details.len(),
                total,
                details,
            })
        }
    }

    async fn cleanup_idle(&self, max_idle: Duration) -> Result<usize, SessionError> {
        let now = Instant::now();
        let doomed = {
            let mut table = self.write()?;
            let idle: Vec<String> = table
                .slots
                .iter()
                .filter_map(|(rendered, slot)| match slot {
                    Slot::Live(entry)
                        if entry.leases.load(Ordering::SeqCst) == 0
                            && (entry.idle_for(now) > max_idle || !entry.is_usable()) =>
                    {
                        Some(rendered.clone())
                    }
                    _ => None,
                })
                .collect();
            idle.iter()
                .filter_map(|rendered| table.remove_live(rendered))
                .collect::<Vec<_>>()
        };
        if doomed.is_empty() {
            return Ok(0);
        }
        tracing::info!(
            count = doomed.len(),
            max_idle_secs = max_idle.as_secs(),
            "reaping idle sessions"
        );
        self.destroy_all(doomed).await
    }
}

/// Removes an abandoned `Creating` reservation if the creator never finishes.
struct Reservation<'a> {
    inner: &'a Inner,
    rendered: String,
    token: u64,
    armed: bool,
}

impl Reservation<'_> {
    fn release(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let Ok(mut table) = self.inner.table.write() else {
            return;
        };
        if matches!(
            table.slots.get(&self.rendered),
            Some(Slot::Creating { token, .. }) if *token == self.token
        ) {
            table.slots.remove(&self.rendered);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

struct Reaper {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    backend: Arc<dyn SandboxBackend>,
    reaper: Option<(Duration, Duration)>,
    records: Option<Arc<dyn SessionRecordStore>>,
}

impl fmt::Debug for SessionManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManagerBuilder")
            .field("backend", &self.backend.name())
            .field("reaper", &self.reaper)
            .field("records", &self.records.is_some())
            .finish()
    }
}

impl SessionManagerBuilder {
    /// Run the idle reaper on the schedule in `settings`. A zero
    /// `cleanup_interval` leaves it off.
    pub fn settings(mut self, settings: &SandboxSettings) -> Self {
        self.reaper = (!settings.cleanup_interval.is_zero())
            .then_some((settings.cleanup_interval, settings.idle_timeout));
        self
    }

    /// Mirror every session into `records`: written on creation, refreshed
    /// on reuse, deleted once the sandbox is destroyed.
    pub fn record_store(mut self, records: Arc<dyn SessionRecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    /// Build the manager, starting the reaper if one was configured.
    pub fn build(self) -> SessionManager {
        let manager = SessionManager {
            inner: Arc::new(Inner {
                backend: self.backend,
                records: self.records,
                table: RwLock::new(Table::default()),
                next_token: AtomicU64::new(1),
            }),
            reaper: Mutex::new(None),
        };
        if let Some((interval, max_idle)) = self.reaper {
            manager.start_reaper(interval, max_idle);
        }
        manager
    }
}

/// Owner of every sandbox session in the process.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use tidepool::{MemoryBackend, SessionConfig, SessionKey, SessionManager};
///
/// let manager = SessionManager::new(Arc::new(MemoryBackend::new()));
/// let key = SessionKey::workflow("run-123");
/// let (session, created) = manager
///     .get_or_create_session(&key, &SessionConfig::default())
///     .await?;
/// assert!(created);
/// ```
pub struct SessionManager {
    inner: Arc<Inner>,
    reaper: Mutex<Option<Reaper>>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sessions = self.inner.read().map(|t| t.slots.len()).unwrap_or(0);
        f.debug_struct("SessionManager")
            .field("backend", &self.inner.backend.name())
            .field("sessions", &sessions)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Manager without a background reaper or record store.
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        Self::builder(backend).build()
    }

    /// Manager whose reaper runs on the schedule in `settings`.
    ///
    /// The reaper needs a Tokio runtime; without one it is not started.
    pub fn with_settings(backend: Arc<dyn SandboxBackend>, settings: &SandboxSettings) -> Self {
        Self::builder(backend).settings(settings).build()
    }

    /// Start configuring a manager for `backend`.
    pub fn builder(backend: Arc<dyn SandboxBackend>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            backend,
            reaper: None,
            records: None,
        }
    }

    /// The record store sessions are mirrored to, if any.
    pub fn record_store(&self) -> Option<&Arc<dyn SessionRecordStore>> {
        self.inner.records.as_ref()
    }

    /// The backend sessions live on.
    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.inner.backend
    }

    /// Return the live session for `key`, creating it on first use.
    ///
    /// The flag is `true` when this call created the session. At most one
    /// backend sandbox is created per key however many callers race here.
    pub async fn get_or_create_session(
        &self,
        key: &SessionKey,
        config: &SessionConfig,
    ) -> Result<(CodeSession, bool), SessionError> {
        let rendered = key.to_string();
        'retry: loop {
            let lookup = {
                let table = self.inner.read()?;
                match table.slots.get(&rendered) {
                    Some(Slot::Live(entry)) if entry.is_usable() => {
                        entry.touch();
                        Lookup::Live(entry.snapshot())
                    }
                    Some(Slot::Creating { outcome, .. }) => Lookup::Creating(outcome.clone()),
                    _ => Lookup::Missing,
                }
            };
            let pending = match lookup {
                Lookup::Live(session) => return Ok(self.reuse(session).await),
                Lookup::Creating(outcome) => Some(outcome),
                Lookup::Missing => None,
            };
            if let Some(outcome) = pending {
                self.wait_for_creation(&rendered, outcome).await?;
                continue;
            }

            let reserved = 'reserve: {
                let mut table = self.inner.write()?;
                match table.slots.get(&rendered) {
                    Some(Slot::Live(entry)) if entry.is_usable() => {
                        entry.touch();
                        break 'reserve Err(entry.snapshot());
                    }
                    Some(Slot::Creating { .. }) => continue 'retry,
                    _ => {}
                }
                // Anything left here is a failed session; replace it.
                let stale = table.remove_live(&rendered);
                let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
                let (sender, outcome) = watch::channel(None);
                table
                    .slots
                    .insert(rendered.clone(), Slot::Creating { token, outcome });
                Ok((token, sender, stale))
            };
            let (token, sender, stale) = match reserved {
                Ok(reserved) => reserved,
                Err(session) => return Ok(self.reuse(session).await),
            };

            if let Some(stale) = stale {
                tracing::info!(session_key = %rendered, "replacing failed session");
                if let Err(e) = self.inner.destroy_all(vec![stale]).await {
                    tracing::warn!(session_key = %rendered, error = %e, "stale session cleanup failed");
                }
            }

            return self.create(key, rendered, config, token, sender).await;
        }
    }

    async fn reuse(&self, session: CodeSession) -> (CodeSession, bool) {
        self.inner.record_used(&session).await;
        (session, false)
    }

    async fn wait_for_creation(
        &self,
        rendered: &str,
        mut outcome: watch::Receiver<CreationOutcome>,
    ) -> Result<(), SessionError> {
        let result = outcome.wait_for(Option::is_some).await.map(|v| v.clone());
        match result {
            Ok(Some(Err(message))) => Err(SessionError::CreationFailed {
                key: rendered.to_string(),
                message,
            }),
            // Success, or the creator went away: look again.
            _ => Ok(()),
        }
    }

    async fn create(
        &self,
        key: &SessionKey,
        rendered: String,
        config: &SessionConfig,
        token: u64,
        sender: watch::Sender<CreationOutcome>,
    ) -> Result<(CodeSession, bool), SessionError> {
        let mut reservation = Reservation {
            inner: &self.inner,
            rendered: rendered.clone(),
            token,
            armed: true,
        };
        let started = Instant::now();

        let session = match self.inner.backend.create_session(key, config).await {
            Ok(session) => session,
            Err(e) => {
                reservation.release();
                tracing::warn!(session_key = %rendered, error = %e, "session creation failed");
                let _ = sender.send(Some(Err(e.to_string())));
                return Err(SessionError::Backend {
                    operation: "create session",
                    source: e,
                });
            }
        };

        let entry = Arc::new(Entry::new(session));
        let installed = match self.install(&rendered, token, &entry) {
            Ok(installed) => installed,
            Err(e) => {
                reservation.release();
                let _ = sender.send(Some(Err(e.to_string())));
                self.discard(&rendered, &entry.session.container_handle).await;
                return Err(e);
            }
        };
        reservation.armed = false;

        if !installed {
            // Destroyed while we were creating: the sandbox must not outlive that.
            let _ = sender.send(Some(Err("destroyed during creation".into())));
            self.discard(&rendered, &entry.session.container_handle).await;
            return Err(SessionError::CreationAborted(rendered));
        }

        let _ = sender.send(Some(Ok(())));
        self.inner.record_created(&entry.session).await;
        tracing::info!(
            session_key = %rendered,
            session_id = %entry.session.id,
            container = %entry.session.container_handle,
            backend = self.inner.backend.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "session created"
        );
        Ok((entry.snapshot(), true))
    }

    /// Swap our `Creating` reservation for the live entry, if it is still ours.
    fn install(
        &self,
        rendered: &str,
        token: u64,
        entry: &Arc<Entry>,
    ) -> Result<bool, SessionError> {
        let mut table = self.inner.write()?;
        let ours = matches!(
            table.slots.get(rendered),
            Some(Slot::Creating { token: current, .. }) if *current == token
        );
        if ours {
            table
                .by_id
                .insert(entry.session.id.clone(), rendered.to_string());
            table
                .slots
                .insert(rendered.to_string(), Slot::Live(entry.clone()));
        }
        Ok(ours)
    }

    /// Tear down a sandbox that never made it into the table.
    async fn discard(&self, rendered: &str, handle: &str) {
        if let Err(e) = self.inner.backend.destroy_session(handle).await {
            tracing::warn!(session_key = %rendered, error = %e, "failed to destroy orphaned sandbox");
        }
    }

    /// Look up the live session for `key` without creating one.
    pub fn get_session(&self, key: &SessionKey) -> Result<CodeSession, SessionError> {
        let rendered = key.to_string();
        let table = self.inner.read()?;
        match table.live(&rendered) {
            Some(entry) if entry.is_usable() => Ok(entry.snapshot()),
            _ => Err(SessionError::NotFound(rendered)),
        }
    }

    /// Look up a live session by id and mark it used.
    pub fn get_session_by_id(&self, id: &str) -> Result<CodeSession, SessionError> {
        let entry = self.entry_by_id(id)?;
        entry.touch();
        Ok(entry.snapshot())
    }

    /// Mark a session used now.
    pub fn touch(&self, id: &str) -> Result<(), SessionError> {
        self.entry_by_id(id)?.touch();
        Ok(())
    }

    fn entry_by_id(&self, id: &str) -> Result<Arc<Entry>, SessionError> {
        let table = self.inner.read()?;
        let entry = table.usable_by_id(id)?.clone();
        Ok(entry)
    }

    /// Borrow a session for one operation.
    ///
    /// The session reports `Busy` and is never reaped while the lease is held.
    pub fn lease(&self, id: &str) -> Result<SessionLease, SessionError> {
        let entry = {
            let table = self.inner.read()?;
            let entry = table.usable_by_id(id)?;
            // Sweeps check `leases` under the write lock, so pin before unlocking.
            entry.leases.fetch_add(1, Ordering::SeqCst);
            entry.clone()
        };
        entry.touch();
        Ok(SessionLease { entry })
    }

    /// Snapshot of every live session.
    pub fn sessions(&self) -> Result<Vec<CodeSession>, SessionError> {
        let table = self.inner.read()?;
        let mut sessions: Vec<CodeSession> = table
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(entry) => Some(entry.snapshot()),
                Slot::Creating { .. } => None,
            })
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// Destroy the session for `key`. Returns whether there was one.
    ///
    /// The key leaves the table before the backend is asked to tear the
    /// sandbox down, so nobody can pick the session up mid-destruction.
    pub async fn destroy_session(&self, key: &SessionKey) -> Result<bool, SessionError> {
        let rendered = key.to_string();
        let entry = {
            let mut table = self.inner.write()?;
            match table.slots.get(&rendered) {
                Some(Slot::Creating { .. }) => {
                    // The creator sees its reservation gone and discards its sandbox.
                    table.slots.remove(&rendered);
                    return Ok(true);
                }
                Some(Slot::Live(_)) => table.remove_live(&rendered),
                None => return Ok(false),
            }
        };
        let Some(entry) = entry else {
            return Ok(false);
        };
        self.inner
            .backend
            .destroy_session(&entry.session.container_handle)
            .await
            .map_err(|source| SessionError::Backend {
                operation: "destroy session",
                source,
            })?;
        self.inner.forget(key).await;
        tracing::info!(
            session_key = %rendered,
            session_id = %entry.session.id,
            container = %entry.session.container_handle,
            "session destroyed"
        );
        Ok(true)
    }

    /// Destroy the session with this id. Returns whether there was one.
    pub async fn close_session(&self, id: &str) -> Result<bool, SessionError> {
        let key = {
            let table = self.inner.read()?;
            table
                .by_id
                .get(id)
                .and_then(|rendered| table.live(rendered))
                .map(|entry| entry.session.key.clone())
        };
        match key {
            Some(key) => self.destroy_session(&key).await,
            None => Ok(false),
        }
    }

    /// Destroy every session of a workflow run. Returns how many were destroyed.
    pub async fn cleanup_workflow(&self, workflow_run_id: &str) -> Result<usize, SessionError> {
        self.cleanup_scope(Scope::Workflow, workflow_run_id).await
    }

    /// Destroy every session of an agent run. Returns how many were destroyed.
    pub async fn cleanup_agent(&self, agent_run_id: &str) -> Result<usize, SessionError> {
        self.cleanup_scope(Scope::Agent, agent_run_id).await
    }

    async fn cleanup_scope(&self, scope: Scope, scope_id: &str) -> Result<usize, SessionError> {
        let doomed = {
            let mut table = self.inner.write()?;
            let keys: Vec<String> = table
                .slots
                .iter()
                .filter(|(_, slot)| match slot {
                    Slot::Live(entry) => entry.session.key.is_in_scope(scope, scope_id),
                    Slot::Creating { .. } => false,
                })
                .map(|(rendered, _)| rendered.clone())
                .collect();
            // Reservations in this scope are dropped too; their creators clean up.
            table.slots.retain(|rendered, slot| match slot {
                Slot::Creating { .. } => SessionKey::parse(rendered)
                    .is_none_or(|key| !key.is_in_scope(scope, scope_id)),
                Slot::Live(_) => true,
            });
            keys.iter()
                .filter_map(|rendered| table.remove_live(rendered))
                .collect::<Vec<_>>()
        };
        tracing::debug!(%scope, scope_id, count = doomed.len(), "cleaning up scope");
        self.inner.destroy_all(doomed).await
    }

    /// Destroy every unleased session unused for longer than `max_idle`.
    ///
    /// Failed sessions are swept regardless of age. Returns how many were
    /// destroyed; failures are aggregated into [`SessionError::Cleanup`].
    pub async fn cleanup_idle_sessions(&self, max_idle: Duration) -> Result<usize, SessionError> {
        self.inner.cleanup_idle(max_idle).await
    }

    /// Start the background reaper, replacing any running one.
    pub fn start_reaper(&self, interval: Duration, max_idle: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime, idle session reaper not started");
            return;
        };
        let (shutdown, mut stop) = watch::channel(false);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        match inner.cleanup_idle(max_idle).await {
                            Ok(0) => {}
                            Ok(count) => tracing::info!(count, "reaped idle sessions"),
                            Err(e) => tracing::warn!(error = %e, "idle session sweep incomplete"),
                        }
                    }
                }
            }
            tracing::debug!("idle session reaper stopped");
        });

        let previous = self
            .reaper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(Reaper { shutdown, task });
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(true);
            previous.task.abort();
        }
        tracing::debug!(
            interval_secs = interval.as_secs(),
            max_idle_secs = max_idle.as_secs(),
            "idle session reaper started"
        );
    }

    fn take_reaper(&self) -> Option<Reaper> {
        self.reaper.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Stop the reaper and destroy every session.
    ///
    /// Keeps going past individual failures and reports them together.
    pub async fn close(&self) -> Result<usize, SessionError> {
        if let Some(reaper) = self.take_reaper() {
            let _ = reaper.shutdown.send(true);
            let _ = reaper.task.await;
        }
        let drained = {
            let mut table = self.inner.write()?;
            table.by_id.clear();
            table
                .slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Live(entry) => Some(entry),
                    Slot::Creating { .. } => None,
                })
                .collect::<Vec<_>>()
        };
        tracing::info!(count = drained.len(), "closing session manager");
        self.inner.destroy_all(drained).await
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(reaper) = self.take_reaper() {
            let _ = reaper.shutdown.send(true);
            reaper.task.abort();
        }
    }
}

/// A borrowed session. See [`SessionManager::lease`].
pub struct SessionLease {
    entry: Arc<Entry>,
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_id", &self.entry.session.id)
            .finish_non_exhaustive()
    }
}

impl SessionLease {
    /// Current view of the session.
    pub fn session(&self) -> CodeSession {
        self.entry.snapshot()
    }

    /// Backend handle.
    pub fn handle(&self) -> &str {
        &self.entry.session.container_handle
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.entry.session.config
    }

    /// Record that the backend no longer knows this sandbox. The session
    /// stops being handed out and the next `get_or_create_session` for its
    /// key replaces it.
    pub fn mark_failed(&self) {
        if !self.entry.failed.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                session_id = %self.entry.session.id,
                container = %self.entry.session.container_handle,
                "sandbox lost, session marked failed"
            );
        }
    }

    /// Mark the session failed if `error` says the sandbox is gone.
    pub fn observe(&self, error: &BackendError) {
        if error.is_session_gone() {
            self.mark_failed();
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.entry.touch();
        self.entry.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::records::MemorySessionRecordStore;

    fn manager() -> (Arc<MemoryBackend>, SessionManager) {
        let backend = Arc::new(MemoryBackend::new());
        let manager = SessionManager::new(backend.clone());
        (backend, manager)
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_session() {
        let (backend, manager) = manager();
        let key = SessionKey::workflow("wf-1");

        let (first, created) = manager
            .get_or_create_session(&key, &SessionConfig::default())
            .await
            .unwrap();
        assert!(created);
        let (second, created) = manager
            .get_or_create_session(&key, &SessionConfig::default())
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(backend.create_count(), 1);
    }

    #[tokio::test]
    async fn test_get_session_not_found() {
        let (_, manager) = manager();
        let err = manager.get_session(&SessionKey::agent("nobody")).unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_creation_leaves_no_entry() {
        let (backend, manager) = manager();
        backend.fail_creates(Some("no engine"));
        let key = SessionKey::agent("a-1");

        let err = manager
            .get_or_create_session(&key, &SessionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Backend { .. }));
        assert!(manager.get_session(&key).is_err());
        assert!(manager.sessions().unwrap().is_empty());

        backend.fail_creates(None);
        let (_, created) = manager
            .get_or_create_session(&key, &SessionConfig::default())
            .await
            .unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn test_destroy_removes_from_table() {
        let (backend, manager) = manager();
        let key = SessionKey::agent("a-1");
        let (session, _) = manager
            .get_or_create_session(&key, &SessionConfig::default())
            .await
            .unwrap();

        assert!(manager.destroy_session(&key).await.unwrap());
        assert!(manager.get_session(&key).is_err());
        assert!(manager.get_session_by_id(&session.id).is_err());
        assert!(backend.live_handles().is_empty());
        assert!(!manager.destroy_session(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_during_creation_aborts_creator() {
        let backend = Arc::new(MemoryBackend::new().with_create_delay(Duration::from_millis(100)));
        let manager = Arc::new(SessionManager::new(backend.clone()));
        let key = SessionKey::agent("slow");

        let creator = {
            let manager = manager.clone();
            let key = key.clone();
            tokio::spawn(async move {
                manager
                    .get_or_create_session(&key, &SessionConfig::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.destroy_session(&key).await.unwrap());

        let err = creator.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::CreationAborted(_)));
        assert!(backend.live_handles().is_empty());
        assert!(manager.get_session(&key).is_err());
    }

    #[tokio::test]
    async fn test_lease_marks_busy_and_blocks_reaping() {
        let (_, manager) = manager();
        let (session, _) = manager
            .get_or_create_session(&SessionKey::agent("a"), &SessionConfig::default())
            .await
            .unwrap();

        let lease = manager.lease(&session.id).unwrap();
        assert_eq!(lease.session().status, SessionStatus::Busy);
        assert_eq!(manager.cleanup_idle_sessions(Duration::ZERO).await.unwrap(), 0);

        drop(lease);
        assert_eq!(
            manager.get_session_by_id(&session.id).unwrap().status,
            SessionStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_failed_session_is_replaced() {
        let (backend, manager) = manager();
        let key = SessionKey::agent("a");
        let (first, _) = manager
            .get_or_create_session(&key, &SessionConfig::default())
            .await
            .unwrap();

        {
            let lease = manager.lease(&first.id).unwrap();
            lease.observe(&BackendError::SessionNotFound(first.container_handle.clone()));
        }
        assert!(manager.get_session(&key).is_err());

        let (second, created) = manager
            .get_or_create_session(&key, &SessionConfig::default())
            .await
            .unwrap();
        assert!(created);
        assert_ne!(first.id, second.id);
        assert_eq!(backend.live_handles(), vec![second.container_handle]);
    }

    #[tokio::test]
    async fn test_close_destroys_everything() {
        let (backend, manager) = manager();
        for id in ["a", "b", "c"] {
            manager
                .get_or_create_session(&SessionKey::agent(id), &SessionConfig::default())
                .await
                .unwrap();
        }
        assert_eq!(manager.close().await.unwrap(), 3);
        assert!(backend.live_handles().is_empty());
        assert!(manager.sessions().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_runs_on_interval() {
        let backend = Arc::new(MemoryBackend::new());
        let settings = SandboxSettings {
            idle_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(10),
            ..SandboxSettings::default()
        };
        let manager = SessionManager::with_settings(backend.clone(), &settings);
        manager
            .get_or_create_session(&SessionKey::agent("a"), &SessionConfig::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.live_handles().len(), 1);

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(backend.live_handles().is_empty());

        manager.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sandbox_is_destroyed_when_table_is_poisoned() {
        let backend = Arc::new(MemoryBackend::new().with_create_delay(Duration::from_secs(1)));
        let manager = Arc::new(SessionManager::new(backend.clone()));
        let creating = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .get_or_create_session(&SessionKey::agent("a-1"), &SessionConfig::default())
                    .await
            }
        });
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.create_count(), 1);

        let table = &manager.inner.table;
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = table.write();
            panic!("poison the session table");
        }));

        assert!(creating.await.unwrap().is_err());
        assert_eq!(backend.destroy_count(), 1);
        assert!(backend.live_handles().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_granted_lease_is_never_reaped() {
        let (backend, manager) = manager();
        let manager = Arc::new(manager);

        for round in 0..200 {
            let key = SessionKey::agent(format!("a-{round}"));
            let (session, _) = manager
                .get_or_create_session(&key, &SessionConfig::default())
                .await
                .unwrap();

            let sweeper = tokio::spawn({
                let manager = manager.clone();
                async move { manager.cleanup_idle_sessions(Duration::ZERO).await }
            });
            let lease = manager.lease(&session.id);
            sweeper.await.unwrap().unwrap();

            if let Ok(lease) = lease {
                assert!(
                    backend.live_handles().contains(&session.container_handle),
                    "round {round}: leased sandbox was destroyed"
                );
                assert_eq!(lease.session().status, SessionStatus::Busy);
                drop(lease);
                manager.destroy_session(&key).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_sessions_are_mirrored_to_the_record_store() {
        let backend = Arc::new(MemoryBackend::new());
        let records = Arc::new(MemorySessionRecordStore::new());
        let manager = SessionManager::builder(backend)
            .record_store(records.clone())
            .build();
        let key = SessionKey::workflow("wf-1");

        let (session, _) = manager
            .get_or_create_session(&key, &SessionConfig::default())
            .await
            .unwrap();
        let record = records.get(&key).await.unwrap().unwrap();
        assert_eq!(record.session_id, session.id);
        assert_eq!(record.container_handle, session.container_handle);
        assert_eq!(record.backend, "memory");

        // A record lost from the store is rewritten on reuse.
        records.delete(&key).await.unwrap();
        manager
            .get_or_create_session(&key, &SessionConfig::default())
            .await
            .unwrap();
        assert!(records.get_by_session_id(&session.id).await.unwrap().is_some());

        assert!(manager.destroy_session(&key).await.unwrap());
        assert!(records.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_clears_records() {
        let backend = Arc::new(MemoryBackend::new());
        let records = Arc::new(MemorySessionRecordStore::new());
        let manager = SessionManager::builder(backend)
            .record_store(records.clone())
            .build();
        for key in [SessionKey::agent("a-1"), SessionKey::agent("a-2")] {
            manager
                .get_or_create_session(&key, &SessionConfig::default())
                .await
                .unwrap();
        }
        assert_eq!(records.list().await.unwrap().len(), 2);

        assert_eq!(manager.close().await.unwrap(), 2);
        assert!(records.list().await.unwrap().is_empty());
    }
}
