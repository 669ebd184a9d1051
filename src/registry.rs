//! The registry maps string keys to the concrete functions a worker may execute, and carries the
//! per-worker init functions and custom notification handlers.
//!
//! Because worker processes are re-executions of the host binary, the same registration code runs
//! in every process; all the registry has to guarantee is that a key submitted in the main
//! process resolves to the same function in each worker. Registration happens once, at startup,
//! through [RegistryBuilder]; the built [Registry] is immutable, which is what makes late
//! registration (after workers have forked off) impossible by construction.
//!
use crate::context::WorkContext;
use crate::notifications::RESERVED_NAMES;
use fxhash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::*;

/// How a single call failed, before it is mapped onto a result frame.
#[derive(Debug)]
pub(crate) enum CallError {
    /// The user function itself failed (or asked for cancellation via `WorkCancelled`).
    User(anyhow::Error),
    /// Arguments or results could not cross the serialization boundary.
    Codec(serde_json::Error),
}

pub(crate) type SingleFn =
    Box<dyn Fn(&WorkContext, Value) -> Result<Value, CallError> + Send + Sync>;
pub(crate) type StreamIter = Box<dyn Iterator<Item = Result<Value, CallError>>>;
pub(crate) type StreamFn =
    Box<dyn Fn(&WorkContext, Value) -> Result<StreamIter, CallError> + Send + Sync>;
pub(crate) type InitFn = Box<dyn Fn() -> Result<(), anyhow::Error> + Send + Sync>;
pub(crate) type NotificationFn = Box<dyn Fn(Value) -> Result<(), anyhow::Error> + Send + Sync>;

pub(crate) enum WorkFn {
    Single(SingleFn),
    Streaming(StreamFn),
}

pub struct Registry {
    work: FxHashMap<String, WorkFn>,
    init_funcs: Vec<InitFn>,
    notifications: FxHashMap<String, NotificationFn>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("work", &self.work.keys().collect::<Vec<_>>())
            .field("init_funcs", &self.init_funcs.len())
            .field("notifications", &self.notifications.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.work.contains_key(key)
    }

    /// Whether the key names a streaming function. `None` when the key is unknown.
    pub fn is_streaming(&self, key: &str) -> Option<bool> {
        self.work
            .get(key)
            .map(|f| matches!(f, WorkFn::Streaming(_)))
    }

    pub(crate) fn work_fn(&self, key: &str) -> Option<&WorkFn> {
        self.work.get(key)
    }

    pub(crate) fn init_funcs(&self) -> &[InitFn] {
        &self.init_funcs
    }

    pub fn has_notification(&self, name: &str) -> bool {
        self.notifications.contains_key(name)
    }

    pub(crate) fn notification_handler(&self, name: &str) -> Option<&NotificationFn> {
        self.notifications.get(name)
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    work: Vec<(String, WorkFn)>,
    init_funcs: Vec<InitFn>,
    notifications: Vec<(String, NotificationFn)>,
}

impl RegistryBuilder {
    /// Registers a single-shot work function under `key`. The function receives a [WorkContext]
    /// and its deserialized arguments, and produces one result.
    pub fn register<A, R, F>(mut self, key: impl Into<String>, func: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&WorkContext, A) -> Result<R, anyhow::Error> + Send + Sync + 'static,
    {
        let wrapped: SingleFn = Box::new(move |cx, raw| {
            let args: A = serde_json::from_value(raw).map_err(CallError::Codec)?;
            let out = func(cx, args).map_err(CallError::User)?;
            serde_json::to_value(out).map_err(CallError::Codec)
        });
        self.work.push((key.into(), WorkFn::Single(wrapped)));
        self
    }

    /// Registers a streaming work function under `key`: it returns a lazy, finite,
    /// non-restartable sequence that is iterated exactly once in the worker, with each item
    /// delivered to the submission's result handler as it is produced.
    pub fn register_streaming<A, T, I, F>(mut self, key: impl Into<String>, func: F) -> Self
    where
        A: DeserializeOwned,
        T: Serialize,
        I: IntoIterator<Item = Result<T, anyhow::Error>>,
        I::IntoIter: 'static,
        F: Fn(&WorkContext, A) -> Result<I, anyhow::Error> + Send + Sync + 'static,
    {
        let wrapped: StreamFn = Box::new(move |cx, raw| {
            let args: A = serde_json::from_value(raw).map_err(CallError::Codec)?;
            let iter = func(cx, args).map_err(CallError::User)?.into_iter();
            let iter = iter.map(|item| match item {
                Ok(value) => serde_json::to_value(value).map_err(CallError::Codec),
                Err(err) => Err(CallError::User(err)),
            });
            Ok(Box::new(iter) as StreamIter)
        });
        self.work.push((key.into(), WorkFn::Streaming(wrapped)));
        self
    }

    /// Adds a function to run once in each worker process as it starts, before that worker
    /// accepts any submission. Init functions run in registration order, holding the
    /// cross-process lock, so loading shared resources is safe.
    pub fn add_init_func<F>(mut self, func: F) -> Self
    where
        F: Fn() -> Result<(), anyhow::Error> + Send + Sync + 'static,
    {
        self.init_funcs.push(Box::new(func));
        self
    }

    /// Registers a handler for a custom notification name, invoked in every worker (on its
    /// notification listener thread) when the main process enqueues that notification.
    pub fn add_notification<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Result<(), anyhow::Error> + Send + Sync + 'static,
    {
        self.notifications.push((name.into(), Box::new(func)));
        self
    }

    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut work = FxHashMap::default();
        for (key, func) in self.work {
            if work.insert(key.clone(), func).is_some() {
                return Err(RegistryError::DuplicateKey(key));
            }
        }

        let mut notifications = FxHashMap::default();
        for (name, func) in self.notifications {
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(RegistryError::ReservedNotification(name));
            }
            if notifications.insert(name.clone(), func).is_some() {
                return Err(RegistryError::DuplicateNotification(name));
            }
        }

        Ok(Registry {
            work,
            init_funcs: self.init_funcs,
            notifications,
        })
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("work function {0:?} is registered twice")]
    DuplicateKey(String),

    #[error("notification {0:?} is registered twice")]
    DuplicateNotification(String),

    #[error("notification name {0:?} is reserved for the built-in notifications")]
    ReservedNotification(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SubmissionId;
    use crate::shared_state::SharedState;
    use std::sync::Arc;

    fn test_context() -> WorkContext {
        WorkContext::new(SubmissionId::from(1), Arc::new(SharedState::new()))
    }

    #[test]
    fn registered_functions_resolve_and_run() {
        let registry = Registry::builder()
            .register("add", |_cx, (a, b): (i64, i64)| Ok(a + b))
            .build()
            .unwrap();

        assert!(registry.contains("add"));
        assert_eq!(registry.is_streaming("add"), Some(false));

        let WorkFn::Single(f) = registry.work_fn("add").unwrap() else {
            panic!("expected a single-shot function");
        };
        let out = f(&test_context(), serde_json::json!([2, 3])).unwrap();
        assert_eq!(out, serde_json::json!(5));
    }

    #[test]
    fn streaming_functions_yield_their_items_in_order() {
        let registry = Registry::builder()
            .register_streaming("range", |_cx, n: u64| Ok((0..n).map(Ok)))
            .build()
            .unwrap();

        assert_eq!(registry.is_streaming("range"), Some(true));

        let WorkFn::Streaming(f) = registry.work_fn("range").unwrap() else {
            panic!("expected a streaming function");
        };
        let items: Vec<Value> = f(&test_context(), serde_json::json!(3))
            .map_err(|_| "produce failed")
            .unwrap()
            .map(|item| item.map_err(|_| "item failed").unwrap())
            .collect();
        assert_eq!(items, vec![serde_json::json!(0), serde_json::json!(1), serde_json::json!(2)]);
    }

    #[test]
    fn unknown_keys_resolve_to_nothing() {
        let registry = Registry::builder().build().unwrap();
        assert!(!registry.contains("missing"));
        assert_eq!(registry.is_streaming("missing"), None);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let result = Registry::builder()
            .register("twice", |_cx, v: i64| Ok(v))
            .register("twice", |_cx, v: i64| Ok(v))
            .build();
        assert_matches!(result, Err(RegistryError::DuplicateKey(key)) if key == "twice");
    }

    #[test]
    fn reserved_notification_names_are_rejected() {
        let result = Registry::builder()
            .add_notification("cancel", |_payload| Ok(()))
            .build();
        assert_matches!(result, Err(RegistryError::ReservedNotification(name)) if name == "cancel");
    }

    #[test]
    fn bad_arguments_surface_as_codec_errors() {
        let registry = Registry::builder()
            .register("add", |_cx, (a, b): (i64, i64)| Ok(a + b))
            .build()
            .unwrap();

        let WorkFn::Single(f) = registry.work_fn("add").unwrap() else {
            panic!("expected a single-shot function");
        };
        let result = f(&test_context(), serde_json::json!("not a pair"));
        assert_matches!(result, Err(CallError::Codec(_)));
    }
}
