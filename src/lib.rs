//! # offload
//!
//! A process-based work offload pool. The host program registers named work functions in a
//! [Registry], calls [init] (which turns spawned copies of the binary into workers), builds a
//! [Pool] and starts it, then submits work by key without blocking its own event loop. Results
//! come back through [WorkFuture]s, streaming producers deliver items incrementally through a
//! [ResultHandler], and in-flight work is cancelled cooperatively: the worker-side function
//! polls a predicate on its [WorkContext].
//!
//! ```ignore
//! let registry = Arc::new(
//!     Registry::builder()
//!         .register("add", |_cx, (a, b): (i64, i64)| Ok(a + b))
//!         .build()?,
//! );
//! offload::init(&registry);
//!
//! let pool = Pool::new(Config::default(), registry)?;
//! pool.start_workers().await?;
//! let five: i64 = pool.submit("add", (2, 3))?.result().await?;
//! pool.stop(None).await;
//! ```
//!
//! When workers are unavailable (not started yet, crashed, or offload disabled), submissions
//! fail open by default: the work runs synchronously in the calling process instead. Use
//! [Pool::disable_fail_open] to get hard rejections instead.

pub(crate) mod config;
pub(crate) mod context;
pub(crate) mod controller;
pub mod events;
pub(crate) mod handler;
pub(crate) mod lock;
pub(crate) mod notifications;
pub(crate) mod pool;
pub(crate) mod protocol;
pub(crate) mod registry;
pub(crate) mod shared_state;
pub(crate) mod worker;

pub use config::{Config, ConfigBuilder, ConfigError};
pub use context::{CancelProbe, WorkCancelled, WorkContext};
pub use events::{Event, EventChannel, EventConsumer};
pub use handler::{
    CollectingHandler, LastValueHandler, ResultHandler, WorkError, WorkErrorKind, WorkFuture,
};
pub use lock::{CrossProcessGuard, CrossProcessLock};
pub use notifications::{LogLevel, Notification};
pub use pool::{NotificationError, Pool, PoolStatus, StartError, SubmitError};
pub use protocol::SubmissionId;
pub use registry::{Registry, RegistryBuilder, RegistryError};
pub use shared_state::{SharedState, CURRENT_STATE_KEY};
pub use worker::init;

#[macro_use]
extern crate derive_builder;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;
