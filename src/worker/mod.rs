//! # Worker processes
//!
//! A worker is a re-execution of the host binary. The host calls [crate::init] early in `main`;
//! in a process spawned by the pool that call never returns, it runs the command loop until the
//! shutdown sentinel arrives. `spawn` is the main-process side (child process plumbing),
//! `runtime` is the worker-process side.

pub(crate) mod spawn;
pub(crate) mod runtime;

pub use runtime::init;

use crate::context::{WorkCancelled, WorkContext};
use crate::handler::WorkErrorKind;
use crate::protocol::SubmissionSpec;
use crate::registry::{CallError, Registry, WorkFn};
use crate::shared_state::SharedState;
use serde_json::Value;
use std::sync::Arc;

pub(crate) const ENV_WORKER_ID: &str = "OFFLOAD_WORKER_ID";
pub(crate) const ENV_LOCK_PATH: &str = "OFFLOAD_LOCK_PATH";
pub(crate) const ENV_LOG_LEVEL: &str = "OFFLOAD_LOG_LEVEL";

/// How one submission ended. `on_item` receives streaming items as they are produced and returns
/// whether to keep going; a `false` aborts the iteration (the delivery path is gone).
#[derive(Debug)]
pub(crate) enum ExecOutcome {
    Value(Value),
    StreamEnd,
    Error {
        kind: WorkErrorKind,
        message: String,
        traceback: String,
    },
    Cancelled,
}

/// Runs one submission to its terminal outcome. This is the shared core of the worker command
/// loop and of fail-open local execution: resolve the key, run the function, poll the cancel
/// flag between streamed items.
pub(crate) fn execute_submission(
    registry: &Registry,
    state: &Arc<SharedState>,
    spec: &SubmissionSpec,
    on_item: &mut dyn FnMut(Value) -> bool,
) -> ExecOutcome {
    if state.is_cancelled(spec.id) {
        return ExecOutcome::Cancelled;
    }

    let Some(work_fn) = registry.work_fn(&spec.key) else {
        return ExecOutcome::Error {
            kind: WorkErrorKind::UnknownCallable,
            message: format!("no work function registered under {:?}", spec.key),
            traceback: String::new(),
        };
    };

    let cx = WorkContext::new(spec.id, state.clone());

    match work_fn {
        WorkFn::Single(func) => {
            if spec.streaming {
                return kind_mismatch(&spec.key, false);
            }
            match func(&cx, spec.args.clone()) {
                Ok(value) => ExecOutcome::Value(value),
                Err(err) => fail_outcome(err),
            }
        }
        WorkFn::Streaming(func) => {
            if !spec.streaming {
                return kind_mismatch(&spec.key, true);
            }
            let iter = match func(&cx, spec.args.clone()) {
                Ok(iter) => iter,
                Err(err) => return fail_outcome(err),
            };
            for item in iter {
                match item {
                    Ok(value) => {
                        if !on_item(value) {
                            return ExecOutcome::Cancelled;
                        }
                        if state.is_cancelled(spec.id) {
                            return ExecOutcome::Cancelled;
                        }
                    }
                    Err(err) => return fail_outcome(err),
                }
            }
            ExecOutcome::StreamEnd
        }
    }
}

fn kind_mismatch(key: &str, registered_streaming: bool) -> ExecOutcome {
    let (registered, submitted) = if registered_streaming {
        ("streaming", "single-shot")
    } else {
        ("single-shot", "streaming")
    };
    ExecOutcome::Error {
        kind: WorkErrorKind::UnknownCallable,
        message: format!("{key:?} is registered as a {registered} function but was submitted as {submitted}"),
        traceback: String::new(),
    }
}

fn fail_outcome(err: CallError) -> ExecOutcome {
    match err {
        CallError::User(err) if err.is::<WorkCancelled>() => ExecOutcome::Cancelled,
        CallError::User(err) => ExecOutcome::Error {
            kind: WorkErrorKind::Work,
            message: err.to_string(),
            traceback: format!("{err:?}"),
        },
        CallError::Codec(err) => ExecOutcome::Error {
            kind: WorkErrorKind::Serialization,
            message: err.to_string(),
            traceback: format!("{err:?}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SubmissionId;
    use serde_json::json;

    fn registry() -> Registry {
        Registry::builder()
            .register("double", |_cx, v: i64| Ok(v * 2))
            .register("boom", |_cx, _: ()| -> Result<(), anyhow::Error> {
                Err(anyhow::anyhow!("it broke"))
            })
            .register("give_up", |cx: &WorkContext, _: ()| -> Result<(), anyhow::Error> {
                let _ = cx.submission_id();
                Err(WorkCancelled.into())
            })
            .register_streaming("range", |_cx, n: u64| Ok((0..n).map(Ok)))
            .build()
            .unwrap()
    }

    fn spec(key: &str, args: Value, streaming: bool) -> SubmissionSpec {
        SubmissionSpec {
            id: SubmissionId::next(),
            key: key.to_string(),
            args,
            streaming,
        }
    }

    fn run(spec: &SubmissionSpec) -> (ExecOutcome, Vec<Value>) {
        let registry = registry();
        let state = Arc::new(SharedState::new());
        let mut items = vec![];
        let outcome = execute_submission(&registry, &state, spec, &mut |v| {
            items.push(v);
            true
        });
        (outcome, items)
    }

    #[test]
    fn single_shot_work_produces_a_value() {
        let (outcome, items) = run(&spec("double", json!(21), false));
        assert_matches!(outcome, ExecOutcome::Value(v) if v == json!(42));
        assert!(items.is_empty());
    }

    #[test]
    fn streaming_work_delivers_items_then_ends() {
        let (outcome, items) = run(&spec("range", json!(3), true));
        assert_matches!(outcome, ExecOutcome::StreamEnd);
        assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn failures_keep_the_rendered_traceback() {
        let (outcome, _) = run(&spec("boom", json!(null), false));
        assert_matches!(
            outcome,
            ExecOutcome::Error { kind: WorkErrorKind::Work, message, .. } if message == "it broke"
        );
    }

    #[test]
    fn unknown_keys_fail_without_running_anything() {
        let (outcome, _) = run(&spec("missing", json!(null), false));
        assert_matches!(
            outcome,
            ExecOutcome::Error {
                kind: WorkErrorKind::UnknownCallable,
                ..
            }
        );
    }

    #[test]
    fn kind_mismatches_are_rejected() {
        let (outcome, _) = run(&spec("range", json!(3), false));
        assert_matches!(
            outcome,
            ExecOutcome::Error {
                kind: WorkErrorKind::UnknownCallable,
                ..
            }
        );
    }

    #[test]
    fn returning_the_cancelled_marker_ends_as_cancelled() {
        let (outcome, _) = run(&spec("give_up", json!(null), false));
        assert_matches!(outcome, ExecOutcome::Cancelled);
    }

    #[test]
    fn a_preset_cancel_flag_skips_execution_entirely() {
        let registry = registry();
        let state = Arc::new(SharedState::new());
        let spec = spec("double", json!(1), false);
        state.mark_cancelled(spec.id);

        let outcome = execute_submission(&registry, &state, &spec, &mut |_| true);
        assert_matches!(outcome, ExecOutcome::Cancelled);
    }

    #[test]
    fn the_cancel_flag_stops_a_stream_between_items() {
        let registry = registry();
        let state = Arc::new(SharedState::new());
        let spec = spec("range", json!(100), true);

        let mut items = vec![];
        let state_for_cb = state.clone();
        let id = spec.id;
        let outcome = execute_submission(&registry, &state, &spec, &mut |v| {
            items.push(v);
            // cancel as soon as the third item was delivered
            if items.len() == 3 {
                state_for_cb.mark_cancelled(id);
            }
            true
        });

        assert_matches!(outcome, ExecOutcome::Cancelled);
        assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
    }
}
