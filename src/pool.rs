use crate::config::{Config, ConfigError};
use crate::controller::{Controller, Ctl, InFlight};
use crate::events::{Event, EventChannel};
use crate::handler::{LastValueHandler, ResultHandler, WorkError, WorkFuture};
use crate::lock::CrossProcessLock;
use crate::notifications::{self, LogLevel, Notification};
use crate::protocol::{SubmissionId, SubmissionSpec};
use crate::registry::Registry;
use crate::shared_state::SharedState;
use crate::worker::{execute_submission, spawn, ExecOutcome};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::*;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::*;

/// Pool lifecycle states. Transitions are monotonic; once the pool is `Stopped` it stays
/// stopped for the rest of the process.
#[derive(Copy, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum PoolStatus {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// Holds the lifecycle state and lets waiters observe transitions.
#[derive(Debug)]
pub(crate) struct StatusCell {
    tx: watch::Sender<PoolStatus>,
}

impl StatusCell {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(PoolStatus::Uninitialized);
        Self { tx }
    }

    pub(crate) fn current(&self) -> PoolStatus {
        *self.tx.borrow()
    }

    /// Moves the status forward. Backward transitions are refused, which is what makes the
    /// lifecycle monotonic. Returns whether the status changed.
    pub(crate) fn advance(&self, to: PoolStatus) -> bool {
        self.tx.send_if_modified(|status| {
            if to > *status {
                *status = to;
                true
            } else {
                false
            }
        })
    }
}

static POOL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// State shared between the [Pool] facade, the controller task, and the per-worker tasks.
pub(crate) struct PoolShared {
    config: Config,
    registry: Arc<Registry>,
    state: Arc<SharedState>,
    events: EventChannel,
    status: StatusCell,
    ctl: mpsc::UnboundedSender<Ctl>,
    lock: Arc<CrossProcessLock>,
    offload_enabled: AtomicBool,
    offload_force_disabled: AtomicBool,
    fail_open: AtomicBool,
    started: watch::Sender<bool>,
    loaded: watch::Sender<bool>,
    live_workers: AtomicUsize,
}

impl PoolShared {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub(crate) fn events(&self) -> &EventChannel {
        &self.events
    }

    pub(crate) fn status(&self) -> &StatusCell {
        &self.status
    }

    pub(crate) fn lock(&self) -> &Arc<CrossProcessLock> {
        &self.lock
    }

    pub(crate) fn ctl(&self) -> &mpsc::UnboundedSender<Ctl> {
        &self.ctl
    }

    pub(crate) fn offload_enabled(&self) -> bool {
        self.offload_enabled.load(Ordering::SeqCst)
    }

    /// Returns whether the flag changed.
    pub(crate) fn set_offload_enabled(&self, enabled: bool) -> bool {
        self.offload_enabled.swap(enabled, Ordering::SeqCst) != enabled
    }

    /// The automatic enable that happens once workers are up. A sticky `disable_offload` wins.
    pub(crate) fn auto_enable_offload(&self) -> bool {
        if self.offload_force_disabled.load(Ordering::SeqCst) {
            warn!("not enabling offload because it was explicitly disabled");
            return false;
        }
        self.set_offload_enabled(true)
    }

    pub(crate) fn set_started(&self, value: bool) {
        self.started.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
    }

    pub(crate) fn set_loaded(&self, value: bool) {
        self.loaded.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
    }

    pub(crate) fn worker_attached(&self) {
        self.live_workers.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the number of live workers left.
    pub(crate) fn worker_detached(&self) -> usize {
        self.live_workers.fetch_sub(1, Ordering::SeqCst) - 1
    }
}

/// The pool facade: spawns and supervises the worker processes, routes submissions per the
/// offload/fail-open policy, and fans notifications out to every worker.
///
/// The flow is: build a [Registry], call [crate::init], build a `Pool`, `start_workers`, then
/// `submit` work by key. `stop` before exiting.
pub struct Pool {
    shared: Arc<PoolShared>,
    controller_inbox: Mutex<Option<mpsc::UnboundedReceiver<Ctl>>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.shared.status.current())
            .field("workers", &self.shared.live_workers.load(Ordering::SeqCst))
            .finish()
    }
}

impl Pool {
    pub fn new(config: Config, registry: Arc<Registry>) -> Result<Self, ConfigError> {
        let lock_path = config.lock_dir().join(format!(
            "offload-{}-{}.lock",
            std::process::id(),
            POOL_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        ));
        let lock = CrossProcessLock::open(&lock_path).map_err(|err| {
            ConfigError::CouldNotCreateLockFile {
                path: lock_path,
                err,
            }
        })?;

        let (ctl, inbox) = mpsc::unbounded_channel();
        let (started, _) = watch::channel(false);
        let (loaded, _) = watch::channel(false);

        let shared = Arc::new(PoolShared {
            config,
            registry,
            state: Arc::new(SharedState::new()),
            events: EventChannel::new(),
            status: StatusCell::new(),
            ctl,
            lock: Arc::new(lock),
            offload_enabled: AtomicBool::new(false),
            offload_force_disabled: AtomicBool::new(false),
            fail_open: AtomicBool::new(true),
            started,
            loaded,
            live_workers: AtomicUsize::new(0),
        });

        Ok(Self {
            shared,
            controller_inbox: Mutex::new(Some(inbox)),
        })
    }

    /// Seeds the shared state map (including the host's `current_state` bag) before the workers
    /// are spawned, so every worker inherits it.
    pub fn prepare_globals(
        &self,
        values: serde_json::Map<String, Value>,
    ) -> Result<(), StartError> {
        let status = self.shared.status.current();
        if status != PoolStatus::Uninitialized {
            return Err(StartError::InvalidState(status));
        }
        for (key, value) in values {
            self.shared.state.set(key, value);
        }
        Ok(())
    }

    /// Spawns the worker processes and waits until every worker has run its init functions and
    /// signaled start-complete. Calling this again while the pool is starting or running is a
    /// no-op.
    #[instrument(name = "Pool::start_workers", skip(self))]
    pub async fn start_workers(&self) -> Result<(), StartError> {
        let status = self.shared.status.current();
        match status {
            PoolStatus::Stopping | PoolStatus::Stopped => {
                return Err(StartError::InvalidState(status))
            }
            PoolStatus::Starting | PoolStatus::Running => return Ok(()),
            PoolStatus::Uninitialized => {
                if !self.shared.status.advance(PoolStatus::Starting) {
                    return Ok(());
                }
            }
        }

        if let Some(inbox) = self
            .controller_inbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            tokio::spawn(Controller::new(self.shared.clone(), inbox).run());
        }

        let requested = self.shared.config.worker_count();
        let count = self.shared.config.effective_worker_count();
        info!(
            available_cpus = num_cpus::get(),
            requested, count, "starting worker processes"
        );
        self.shared
            .events
            .send(Event::PoolStarting { requested, count });

        let mut spawned = 0;
        let mut last_error = None;
        for worker_id in 0..count {
            match spawn::spawn_worker(&self.shared, worker_id) {
                Ok(link) => {
                    let _ = self.shared.ctl.send(Ctl::AdoptWorker(link));
                    spawned += 1;
                }
                Err(err) => {
                    error!(worker_id, "could not spawn worker: {err}");
                    last_error = Some(err);
                }
            }
        }
        if spawned == 0 {
            return Err(match last_error {
                Some(err) => StartError::Spawn(err),
                None => StartError::Timeout,
            });
        }

        let mut ready = self.shared.started.subscribe();
        let result = tokio::time::timeout(
            self.shared.config.start_timeout(),
            ready.wait_for(|ready| *ready),
        )
        .await;
        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(StartError::Timeout),
            Err(_) => {
                // fail-open keeps submissions working locally while the workers are broken
                error!("workers did not signal start-complete in time");
                Err(StartError::Timeout)
            }
        }
    }

    /// Submits a single-shot work function by key. `R` is the function's return type.
    pub fn submit<A, R>(&self, key: &str, args: A) -> Result<WorkFuture<R>, SubmitError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.submit_with_handler(key, args, false, LastValueHandler::default())
    }

    /// Submits a streaming work function by key under the default handler, whose future
    /// resolves to the final produced item. Use a custom handler to observe every item.
    pub fn submit_streaming<A, R>(&self, key: &str, args: A) -> Result<WorkFuture<R>, SubmitError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.submit_with_handler(key, args, true, LastValueHandler::default())
    }

    /// Submits work with an explicit [ResultHandler]. `streaming` must match how the key was
    /// registered.
    pub fn submit_with_handler<A, R, H>(
        &self,
        key: &str,
        args: A,
        streaming: bool,
        handler: H,
    ) -> Result<WorkFuture<R>, SubmitError>
    where
        A: Serialize,
        R: DeserializeOwned,
        H: ResultHandler,
    {
        match self.shared.registry.is_streaming(key) {
            None => return Err(SubmitError::UnknownCallable(key.to_string())),
            Some(registered) if registered != streaming => {
                return Err(SubmitError::WrongKind {
                    key: key.to_string(),
                    registered_streaming: registered,
                })
            }
            Some(_) => {}
        }
        let args = serde_json::to_value(args).map_err(SubmitError::Transport)?;

        let status = self.shared.status.current();
        let offload = self.shared.offload_enabled();
        let fail_open = self.shared.fail_open.load(Ordering::SeqCst);
        let forced_off = self.shared.offload_force_disabled.load(Ordering::SeqCst);

        enum Route {
            Dispatch,
            Local,
        }

        let route = match status {
            PoolStatus::Running => {
                if offload {
                    Route::Dispatch
                } else if fail_open {
                    Route::Local
                } else {
                    return Err(SubmitError::OffloadDisabled);
                }
            }
            // submissions made while starting wait in the queue until the pool is running
            PoolStatus::Starting => {
                if fail_open {
                    Route::Dispatch
                } else {
                    return Err(SubmitError::OffloadDisabled);
                }
            }
            PoolStatus::Uninitialized => {
                if fail_open {
                    Route::Local
                } else if forced_off {
                    return Err(SubmitError::OffloadDisabled);
                } else {
                    return Err(SubmitError::InvalidState(status));
                }
            }
            PoolStatus::Stopping | PoolStatus::Stopped => {
                if fail_open {
                    Route::Local
                } else {
                    return Err(SubmitError::OffloadDisabled);
                }
            }
        };

        let spec = SubmissionSpec {
            id: SubmissionId::next(),
            key: key.to_string(),
            args,
            streaming,
        };
        match route {
            Route::Dispatch => Ok(self.dispatch(spec, Box::new(handler))),
            Route::Local => Ok(self.run_local(spec, Box::new(handler))),
        }
    }

    fn dispatch<R: DeserializeOwned>(
        &self,
        spec: SubmissionSpec,
        handler: Box<dyn ResultHandler>,
    ) -> WorkFuture<R> {
        let id = spec.id;
        let (done, rx) = oneshot::channel();
        let message = Ctl::Submit {
            spec,
            inflight: InFlight { handler, done },
        };
        if let Err(err) = self.shared.ctl.send(message) {
            // the controller is gone (the pool stopped underneath us); shutdown drops work
            if let Ctl::Submit { inflight, .. } = err.0 {
                inflight.complete_cancelled();
            }
        }
        WorkFuture::pending(id, rx, self.shared.state.clone(), self.shared.ctl.clone())
    }

    /// Fail-open execution in the calling process: the future is completed synchronously before
    /// `submit` returns, streaming items and all.
    fn run_local<R: DeserializeOwned>(
        &self,
        spec: SubmissionSpec,
        mut handler: Box<dyn ResultHandler>,
    ) -> WorkFuture<R> {
        debug!(id = %spec.id, key = %spec.key, "executing submission in the calling process");
        let id = spec.id;
        let outcome = execute_submission(
            &self.shared.registry,
            &self.shared.state,
            &spec,
            &mut |value| {
                handler.handle_result(value);
                true
            },
        );
        let outcome = match outcome {
            ExecOutcome::Value(value) => {
                handler.handle_result(value);
                Ok(handler.finalize_result())
            }
            ExecOutcome::StreamEnd => Ok(handler.finalize_result()),
            ExecOutcome::Error {
                kind,
                message,
                traceback,
            } => Err(WorkError::Worker {
                kind,
                message,
                traceback,
            }),
            ExecOutcome::Cancelled => {
                handler.cancel();
                Err(WorkError::Cancelled)
            }
        };
        self.shared.state.purge_cancelled(id);
        match &outcome {
            Ok(_) => self.shared.events.send(Event::SubmissionCompleted { id }),
            Err(WorkError::Worker { kind, .. }) => self
                .shared
                .events
                .send(Event::SubmissionFailed { id, kind: *kind }),
            Err(_) => self.shared.events.send(Event::SubmissionCancelled { id }),
        }
        WorkFuture::ready(id, outcome)
    }

    /// Stops the pool: broadcasts the shutdown sentinels, completes every outstanding future as
    /// cancelled, waits up to `timeout` (default from [Config]) for workers to exit and kills
    /// the rest. Never fails; kill problems are logged. Stopping a stopped pool is a no-op.
    #[instrument(name = "Pool::stop", skip(self))]
    pub async fn stop(&self, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or_else(|| self.shared.config.stop_timeout());
        match self.shared.status.current() {
            PoolStatus::Stopped => return,
            PoolStatus::Uninitialized => {
                // nothing was ever started, but the pool can't be resurrected either
                self.shared.status.advance(PoolStatus::Stopped);
                return;
            }
            _ => {}
        }
        let (done, rx) = oneshot::channel();
        if self.shared.ctl.send(Ctl::Stop { timeout, done }).is_ok() {
            let _ = rx.await;
        } else {
            self.shared.status.advance(PoolStatus::Stopped);
        }
    }

    /// Re-enables offload after a `disable_offload`, clearing its stickiness.
    pub fn enable_offload(&self) {
        self.shared
            .offload_force_disabled
            .store(false, Ordering::SeqCst);
        if self.shared.set_offload_enabled(true) {
            self.shared.events.send(Event::OffloadEnabled);
        }
    }

    /// Disables dispatch to workers. Sticky: the pool will not re-enable offload on its own;
    /// submissions run in the calling process while fail-open is on.
    pub fn disable_offload(&self) {
        self.shared
            .offload_force_disabled
            .store(true, Ordering::SeqCst);
        if self.shared.set_offload_enabled(false) {
            self.shared.events.send(Event::OffloadDisabled);
        }
    }

    /// Makes submissions fail with [SubmitError::OffloadDisabled] instead of silently running
    /// in the calling process when workers are unavailable.
    pub fn disable_fail_open(&self) {
        self.shared.fail_open.store(false, Ordering::SeqCst);
    }

    pub fn status(&self) -> PoolStatus {
        self.shared.status.current()
    }

    /// The number of live worker processes.
    pub fn current_process_count(&self) -> usize {
        self.shared.live_workers.load(Ordering::SeqCst)
    }

    /// Whether every worker has signaled start-complete.
    pub fn processes_started(&self) -> bool {
        *self.shared.started.borrow()
    }

    /// Waits until every worker has signaled start-complete. Returns false on timeout.
    pub async fn wait_for_process_start(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.started.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Waits until every worker has acknowledged its notification path, i.e. the pool is fully
    /// loaded and notifications will be delivered. Returns false on timeout.
    pub async fn wait_for_complete_load(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.loaded.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Publishes a custom notification to every live worker. Returns `Ok(false)` (and drops the
    /// notification) while the workers are not fully loaded yet.
    pub fn enqueue_notification(
        &self,
        name: &str,
        payload: Value,
    ) -> Result<bool, NotificationError> {
        if !self.shared.registry.has_notification(name) {
            return Err(NotificationError::Unknown(name.to_string()));
        }
        if !*self.shared.loaded.borrow() {
            debug!(name, "workers are not ready yet, notification dropped");
            return Ok(false);
        }
        let _ = self
            .shared
            .ctl
            .send(Ctl::Broadcast(Notification::new(name, payload)));
        Ok(true)
    }

    /// Changes the log level in every worker process.
    pub fn update_log_level(&self, level: LogLevel) {
        let _ = self
            .shared
            .ctl
            .send(Ctl::Broadcast(notifications::update_log_level(level)));
    }

    /// Updates one key of the shared state map and publishes the new value to every worker's
    /// mirror. Single-key updates are atomic; spanning updates belong in the main process.
    pub fn update_state_value(&self, key: &str, value: Value) {
        self.shared.state.set(key, value.clone());
        let _ = self
            .shared
            .ctl
            .send(Ctl::Broadcast(notifications::update_state_value(key, value)));
    }

    /// The pool's event channel, for hosts that want to observe worker and submission activity.
    pub fn events(&self) -> &EventChannel {
        &self.shared.events
    }

    /// The main-process copy of the shared state map.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared.state
    }

    /// The lock shared with every worker process, for host actions that must be restricted to
    /// one process at a time.
    pub fn cross_process_lock(&self) -> &Arc<CrossProcessLock> {
        &self.shared.lock
    }
}

#[cfg(test)]
impl Pool {
    pub(crate) fn test_parts(&self) -> (Arc<PoolShared>, mpsc::UnboundedReceiver<Ctl>) {
        let inbox = self
            .controller_inbox
            .lock()
            .unwrap()
            .take()
            .expect("controller inbox already taken");
        (self.shared.clone(), inbox)
    }
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("offload is unavailable and fail-open is disabled")]
    OffloadDisabled,

    #[error("the pool cannot accept submissions while {0}")]
    InvalidState(PoolStatus),

    #[error("no work function registered under {0:?}")]
    UnknownCallable(String),

    #[error("work function {key:?} was submitted with the wrong streaming mode")]
    WrongKind {
        key: String,
        registered_streaming: bool,
    },

    #[error("the arguments could not be serialized for transport")]
    Transport(#[source] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("the pool cannot start while {0}")]
    InvalidState(PoolStatus),

    #[error("no worker process could be spawned")]
    Spawn(#[source] std::io::Error),

    #[error("workers did not signal start-complete within the start timeout")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("notification {0:?} has no registered handler")]
    Unknown(String),
}
