//! The worker-process side: plain blocking threads over the stdio pipes.
//!
//! Thread layout per worker:
//! * the reader thread demultiplexes stdin frames into a command channel and a notification
//!   channel, so a notification is acted on promptly even while a submission is executing
//! * the notification listener thread applies built-ins (state mirror updates, cancel flags,
//!   log level changes, shutdown) and custom handlers
//! * the main thread runs init functions and then the command loop, executing user functions
//!   synchronously
//!
use super::{execute_submission, ExecOutcome, ENV_LOCK_PATH, ENV_LOG_LEVEL, ENV_WORKER_ID};
use crate::lock::CrossProcessLock;
use crate::notifications::{
    self, CancelPayload, LogLevel, Notification, StateValuePayload,
};
use crate::protocol::{read_frame, write_frame, FrameError, MainFrame, ResultFrame, SubmissionSpec, WorkerFrame};
use crate::registry::Registry;
use crate::shared_state::SharedState;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing::*;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;

/// Call this early in `main`, after building the registry and before starting any pool.
///
/// In the host process it does nothing and returns. In a process the pool spawned as a worker it
/// never returns: it runs the worker runtime against the given registry until the pool shuts it
/// down, then exits. This is what makes work submitted by key resolvable in every process; the
/// registration code ran here too.
pub fn init(registry: &Arc<Registry>) {
    let Ok(raw_id) = std::env::var(ENV_WORKER_ID) else {
        return;
    };
    let worker_id: usize = match raw_id.parse() {
        Ok(id) => id,
        Err(_) => {
            eprintln!("offload worker started with a malformed {ENV_WORKER_ID}={raw_id:?}");
            std::process::exit(2);
        }
    };
    let code = run_worker(registry.clone(), worker_id);
    std::process::exit(code);
}

enum WorkerCommand {
    Run(SubmissionSpec),
    Shutdown,
}

fn run_worker(registry: Arc<Registry>, worker_id: usize) -> i32 {
    let level = std::env::var(ENV_LOG_LEVEL)
        .ok()
        .and_then(|raw| raw.parse::<LogLevel>().ok())
        .unwrap_or(LogLevel::Info);
    install_tracing(level.as_level_filter());
    info!(worker_id, "worker process starting");

    let state = Arc::new(SharedState::new());
    let writer = Arc::new(FrameWriter::new());
    let keep_running = Arc::new(AtomicBool::new(true));

    let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
    let (notification_tx, notification_rx) = mpsc::channel::<Notification>();

    let reader = std::thread::Builder::new()
        .name(format!("offload-reader-{worker_id}"))
        .spawn(move || read_loop(command_tx, notification_tx));
    if let Err(err) = reader {
        error!("could not spawn the frame reader thread: {err}");
        return 1;
    }

    let listener = {
        let registry = registry.clone();
        let state = state.clone();
        let writer = writer.clone();
        let keep_running = keep_running.clone();
        std::thread::Builder::new()
            .name(format!("offload-notifications-{worker_id}"))
            .spawn(move || {
                notification_loop(
                    &registry,
                    &state,
                    &writer,
                    &keep_running,
                    worker_id,
                    notification_rx,
                )
            })
    };
    let listener = match listener {
        Ok(handle) => handle,
        Err(err) => {
            error!("could not spawn the notification listener thread: {err}");
            return 1;
        }
    };

    run_init_funcs(&registry);

    if writer.send(&WorkerFrame::Started { worker_id }).is_err() {
        error!("could not signal start-complete, exiting");
        return 1;
    }

    while keep_running.load(Ordering::SeqCst) {
        let command = match command_rx.recv() {
            Ok(command) => command,
            // the reader is gone, which means stdin closed: the main process is gone
            Err(_) => break,
        };
        match command {
            WorkerCommand::Shutdown => {
                debug!("received the shutdown sentinel");
                break;
            }
            WorkerCommand::Run(spec) => {
                debug!(id = %spec.id, key = %spec.key, "executing submission");
                let id = spec.id;
                let item_writer = writer.clone();
                let mut on_item = |payload: Value| {
                    item_writer
                        .send(&WorkerFrame::Result(ResultFrame::StreamValue { id, payload }))
                        .is_ok()
                };
                let outcome = execute_submission(&registry, &state, &spec, &mut on_item);
                let terminal = match outcome {
                    ExecOutcome::Value(payload) => ResultFrame::Value { id, payload },
                    ExecOutcome::StreamEnd => ResultFrame::StreamEnd { id },
                    ExecOutcome::Error {
                        kind,
                        message,
                        traceback,
                    } => ResultFrame::Error {
                        id,
                        kind,
                        message,
                        traceback,
                    },
                    ExecOutcome::Cancelled => ResultFrame::Cancelled { id },
                };
                if writer.send(&WorkerFrame::Result(terminal)).is_err() {
                    error!("could not deliver a terminal frame, the main process is probably gone");
                    break;
                }
                state.purge_cancelled(id);
            }
        }
        if listener.is_finished() {
            error!("the notification listener died, exiting");
            break;
        }
    }

    info!(worker_id, "leaving the worker command loop");
    0
}

/// Runs the registered init functions in registration order, holding the cross-process lock so
/// hosts can do one-process-at-a-time setup such as warming shared caches. A failing init
/// function is logged and the worker keeps going.
fn run_init_funcs(registry: &Registry) {
    if registry.init_funcs().is_empty() {
        return;
    }
    let lock = std::env::var(ENV_LOCK_PATH)
        .ok()
        .and_then(|path| match CrossProcessLock::open(Path::new(&path)) {
            Ok(lock) => Some(lock),
            Err(err) => {
                warn!("could not open the cross-process lock file: {err}");
                None
            }
        });
    let guard = lock.as_ref().and_then(|lock| match lock.lock() {
        Ok(guard) => Some(guard),
        Err(err) => {
            warn!("could not take the cross-process lock for init functions: {err}");
            None
        }
    });

    for (index, init) in registry.init_funcs().iter().enumerate() {
        if let Err(err) = init() {
            error!(index, "init function failed: {err:?}");
        }
    }

    drop(guard);
}

fn read_loop(commands: mpsc::Sender<WorkerCommand>, notifications: mpsc::Sender<Notification>) {
    let stdin = std::io::stdin();
    let mut stdin = stdin.lock();
    loop {
        match read_frame::<_, MainFrame>(&mut stdin) {
            Ok(Some(MainFrame::Run(spec))) => {
                if commands.send(WorkerCommand::Run(spec)).is_err() {
                    break;
                }
            }
            Ok(Some(MainFrame::Notify(notification))) => {
                if notifications.send(notification).is_err() {
                    break;
                }
            }
            Ok(Some(MainFrame::Shutdown)) => {
                let _ = commands.send(WorkerCommand::Shutdown);
                break;
            }
            Ok(None) => {
                debug!("stdin closed, the main process is gone");
                break;
            }
            Err(err) => {
                error!("failed to read a frame from the main process: {err}");
                break;
            }
        }
    }
    // dropping the senders unblocks the command loop and the notification listener
}

fn notification_loop(
    registry: &Registry,
    state: &SharedState,
    writer: &FrameWriter,
    keep_running: &AtomicBool,
    worker_id: usize,
    inbox: mpsc::Receiver<Notification>,
) {
    for notification in inbox.iter() {
        if !handle_notification(registry, state, writer, keep_running, worker_id, notification) {
            break;
        }
    }
    debug!("notification listener exiting");
}

fn handle_notification(
    registry: &Registry,
    state: &SharedState,
    writer: &FrameWriter,
    keep_running: &AtomicBool,
    worker_id: usize,
    notification: Notification,
) -> bool {
    match notification.name.as_str() {
        notifications::PING => {
            let _ = writer.send(&WorkerFrame::NotifyAck { worker_id });
        }
        notifications::SHUTDOWN => {
            info!("received the shutdown notification");
            keep_running.store(false, Ordering::SeqCst);
            return false;
        }
        notifications::STATE_SNAPSHOT => match notification.payload {
            Value::Object(map) => state.replace(map),
            other => error!("malformed state snapshot payload: {other:?}"),
        },
        notifications::UPDATE_STATE_VALUE => {
            match serde_json::from_value::<StateValuePayload>(notification.payload) {
                Ok(update) => state.set(update.key, update.value),
                Err(err) => error!("malformed state update payload: {err}"),
            }
        }
        notifications::CANCEL => {
            match serde_json::from_value::<CancelPayload>(notification.payload) {
                Ok(cancel) => {
                    state.mark_cancelled(cancel.id);
                }
                Err(err) => error!("malformed cancel payload: {err}"),
            }
        }
        notifications::UPDATE_LOG_LEVEL => {
            match serde_json::from_value::<LogLevel>(notification.payload) {
                Ok(level) => apply_log_level(level),
                Err(err) => error!("malformed log level payload: {err}"),
            }
        }
        custom => match registry.notification_handler(custom) {
            Some(handler) => {
                if let Err(err) = handler(notification.payload) {
                    error!("handler for notification {custom:?} failed: {err:?}");
                }
            }
            None => error!("unhandled notification {custom:?}"),
        },
    }
    true
}

struct FrameWriter {
    out: Mutex<std::io::Stdout>,
}

impl FrameWriter {
    fn new() -> Self {
        Self {
            out: Mutex::new(std::io::stdout()),
        }
    }

    fn send(&self, frame: &WorkerFrame) -> Result<(), FrameError> {
        let mut out = self
            .out
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        write_frame(&mut *out, frame)
    }
}

static LOG_RELOAD: OnceLock<reload::Handle<LevelFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

fn install_tracing(initial: LevelFilter) {
    let (level, handle) = reload::Layer::new(initial);
    tracing_subscriber::registry()
        .with(level)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    let _ = LOG_RELOAD.set(handle);
}

fn apply_log_level(level: LogLevel) {
    match LOG_RELOAD.get() {
        Some(handle) => {
            if let Err(err) = handle.reload(level.as_level_filter()) {
                error!("could not update the log level: {err}");
            } else {
                info!(%level, "log level updated");
            }
        }
        None => error!("log level update arrived before the subscriber was installed"),
    }
}
