use crate::controller::Ctl;
use crate::protocol::SubmissionId;
use crate::shared_state::SharedState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::*;
use tokio::sync::{mpsc, oneshot};
use tracing::*;

/// Shapes the results of one submission before its future completes.
///
/// For a single-shot submission `handle_result` is called once with the returned value; for a
/// streaming submission it is called once per produced item, in production order. In both cases
/// `finalize_result` then produces the value the future completes with. `cancel` is a hook
/// invoked when the submission ends as cancelled, so sinks can be flushed or torn down; the
/// flag-setting plumbing itself lives on [WorkFuture::cancel].
pub trait ResultHandler: Send + 'static {
    fn handle_result(&mut self, value: Value);

    fn finalize_result(&mut self) -> Value;

    fn cancel(&mut self) {}
}

/// The default handler: keeps the last value it saw. For a single-shot submission that is the
/// return value; for a streaming submission it is the final item.
#[derive(Debug, Default)]
pub struct LastValueHandler {
    result: Option<Value>,
}

impl ResultHandler for LastValueHandler {
    fn handle_result(&mut self, value: Value) {
        self.result = Some(value);
    }

    fn finalize_result(&mut self) -> Value {
        self.result.take().unwrap_or(Value::Null)
    }
}

/// Accumulates every delivered value into an array. The natural handler for streaming
/// submissions whose caller wants all items.
#[derive(Debug, Default)]
pub struct CollectingHandler {
    items: Vec<Value>,
}

impl ResultHandler for CollectingHandler {
    fn handle_result(&mut self, value: Value) {
        self.items.push(value);
    }

    fn finalize_result(&mut self) -> Value {
        Value::Array(std::mem::take(&mut self.items))
    }
}

/// What kind of failure a submission ended with.
#[derive(Copy, Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkErrorKind {
    /// The user function failed.
    Work,
    /// A payload could not cross the serialization boundary.
    Serialization,
    /// The submitted key did not resolve to a registered function.
    UnknownCallable,
    /// The worker process died while the submission was in flight.
    WorkerCrash,
}

impl std::fmt::Display for WorkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Work => "work",
            Self::Serialization => "serialization",
            Self::UnknownCallable => "unknown-callable",
            Self::WorkerCrash => "worker-crash",
        };
        write!(f, "{name}")
    }
}

#[derive(Error, Debug)]
pub enum WorkError {
    #[error("work was cancelled")]
    Cancelled,

    #[error("{kind} failure: {message}")]
    Worker {
        kind: WorkErrorKind,
        message: String,
        /// The failure rendered at the raise site, transported verbatim.
        traceback: String,
    },

    #[error("the work result was lost because the pool went away")]
    Lost,

    #[error("the work result could not be decoded into the requested type")]
    Decode(#[source] serde_json::Error),

    #[error("timed out waiting for the work result")]
    Timeout,
}

pub(crate) type Outcome = Result<Value, WorkError>;

enum CompletionSource {
    /// Completed synchronously before `submit` returned (fail-open local execution).
    Ready(Option<Outcome>),
    /// Completed by the result dispatcher when the terminal frame arrives.
    Pending {
        rx: oneshot::Receiver<Outcome>,
        state: Arc<SharedState>,
        ctl: mpsc::UnboundedSender<Ctl>,
    },
}

/// The caller's handle on one submission.
///
/// `R` is the type `finalize_result`'s value decodes into: the work function's return type under
/// the default handler, or whatever shape a custom handler produces.
pub struct WorkFuture<R = Value> {
    id: SubmissionId,
    source: CompletionSource,
    _result: PhantomData<fn() -> R>,
}

impl<R> std::fmt::Debug for WorkFuture<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkFuture").field("id", &self.id).finish()
    }
}

impl<R: DeserializeOwned> WorkFuture<R> {
    pub(crate) fn pending(
        id: SubmissionId,
        rx: oneshot::Receiver<Outcome>,
        state: Arc<SharedState>,
        ctl: mpsc::UnboundedSender<Ctl>,
    ) -> Self {
        Self {
            id,
            source: CompletionSource::Pending { rx, state, ctl },
            _result: PhantomData,
        }
    }

    pub(crate) fn ready(id: SubmissionId, outcome: Outcome) -> Self {
        Self {
            id,
            source: CompletionSource::Ready(Some(outcome)),
            _result: PhantomData,
        }
    }

    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Requests cancellation of this submission.
    ///
    /// Sets the shared cancel flag (visible to the worker's cooperative checks) and tells the
    /// dispatcher; if the submission has not been picked up by a worker yet it completes as
    /// cancelled without ever being dispatched. Calling this more than once is a no-op.
    pub fn cancel(&self) {
        let CompletionSource::Pending { state, ctl, .. } = &self.source else {
            return;
        };
        if state.mark_cancelled(self.id) {
            let _ = ctl.send(Ctl::Cancel { id: self.id });
        } else {
            debug!(id = %self.id, "redundant cancel request");
        }
    }

    /// Waits for the terminal result of the submission.
    pub async fn result(self) -> Result<R, WorkError> {
        let outcome = match self.source {
            CompletionSource::Ready(outcome) => outcome.unwrap_or(Err(WorkError::Lost)),
            CompletionSource::Pending { rx, .. } => match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(WorkError::Lost),
            },
        };
        outcome.and_then(|value| serde_json::from_value(value).map_err(WorkError::Decode))
    }

    /// Waits up to `timeout` for the terminal result. The handle is consumed either way; a
    /// caller that intends to abandon the work on timeout should `cancel` first.
    pub async fn result_timeout(self, timeout: Duration) -> Result<R, WorkError> {
        match tokio::time::timeout(timeout, self.result()).await {
            Ok(result) => result,
            Err(_) => Err(WorkError::Timeout),
        }
    }
}
