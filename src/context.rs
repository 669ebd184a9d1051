use crate::protocol::SubmissionId;
use crate::shared_state::SharedState;
use serde_json::Value;
use std::sync::Arc;
use thiserror::*;

/// The context handed to every offloaded function. It identifies the submission being executed
/// and gives the function its view of the shared state map, including the cooperative
/// cancellation predicate.
///
/// Cancellation is never delivered asynchronously; work that should stop promptly has to poll
/// [WorkContext::is_cancelled] (or a [CancelProbe]) at its own checkpoints.
#[derive(Debug, Clone)]
pub struct WorkContext {
    id: SubmissionId,
    state: Arc<SharedState>,
}

impl WorkContext {
    pub(crate) fn new(id: SubmissionId, state: Arc<SharedState>) -> Self {
        Self { id, state }
    }

    pub fn submission_id(&self) -> SubmissionId {
        self.id
    }

    /// Whether this submission has been cancelled by the main process.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled(self.id)
    }

    /// A cheap, clonable handle on the cancellation predicate, for producer closures that
    /// outlive the borrow of the context.
    pub fn cancel_probe(&self) -> CancelProbe {
        CancelProbe {
            id: self.id,
            state: self.state.clone(),
        }
    }

    pub fn state_value(&self, key: &str) -> Option<Value> {
        self.state.get(key)
    }

    /// The host-defined `current_state` bag, if one was seeded or published.
    pub fn current_state(&self) -> Option<Value> {
        self.state.current_state()
    }
}

#[derive(Debug, Clone)]
pub struct CancelProbe {
    id: SubmissionId,
    state: Arc<SharedState>,
}

impl CancelProbe {
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled(self.id)
    }
}

/// Marker error for aborting work from inside an offloaded function. Returning it (wrapped in
/// `anyhow::Error`) makes the submission finish as cancelled rather than failed:
///
/// ```ignore
/// if cx.is_cancelled() {
///     return Err(WorkCancelled.into());
/// }
/// ```
#[derive(Error, Debug)]
#[error("work was cancelled")]
pub struct WorkCancelled;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_observe_the_cancel_flag() {
        let state = Arc::new(SharedState::new());
        let id = SubmissionId::from(3);
        let cx = WorkContext::new(id, state.clone());
        let probe = cx.cancel_probe();

        assert!(!cx.is_cancelled());
        assert!(!probe.is_cancelled());

        state.mark_cancelled(id);
        assert!(cx.is_cancelled());
        assert!(probe.is_cancelled());
    }

    #[test]
    fn probes_are_scoped_to_their_submission() {
        let state = Arc::new(SharedState::new());
        let cx = WorkContext::new(SubmissionId::from(4), state.clone());
        state.mark_cancelled(SubmissionId::from(5));
        assert!(!cx.is_cancelled());
    }
}
