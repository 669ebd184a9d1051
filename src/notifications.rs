//! Notifications travel out-of-band from the main process to every worker, so a worker can react
//! (update its state mirror, observe a cancellation, change its log level) even while its command
//! loop is busy executing a submission.
//!
use crate::protocol::SubmissionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named message broadcast to every live worker. Built-in names are reserved; anything else
/// must have a handler registered through `RegistryBuilder::add_notification` before the workers
/// are started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub name: String,
    pub payload: Value,
}

impl Notification {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

pub const UPDATE_LOG_LEVEL: &str = "update_log_level";
pub const UPDATE_STATE_VALUE: &str = "update_state_value";
pub const CANCEL: &str = "cancel";

// Internal plumbing names: the initial-handshake/keepalive ping, the shutdown broadcast, and the
// spawn-time state seeding.
pub(crate) const PING: &str = "ping";
pub(crate) const SHUTDOWN: &str = "shutdown";
pub(crate) const STATE_SNAPSHOT: &str = "state_snapshot";

pub(crate) const RESERVED_NAMES: &[&str] = &[
    UPDATE_LOG_LEVEL,
    UPDATE_STATE_VALUE,
    CANCEL,
    PING,
    SHUTDOWN,
    STATE_SNAPSHOT,
];

/// Log levels understood by the built-in `update_log_level` notification.
#[derive(Copy, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_level_filter(self) -> tracing::level_filters::LevelFilter {
        use tracing::level_filters::LevelFilter;
        match self {
            Self::Trace => LevelFilter::TRACE,
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warn => LevelFilter::WARN,
            Self::Error => LevelFilter::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StateValuePayload {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CancelPayload {
    pub id: SubmissionId,
}

pub(crate) fn update_state_value(key: &str, value: Value) -> Notification {
    let payload = serde_json::to_value(StateValuePayload {
        key: key.to_string(),
        value,
    })
    .expect("state value payloads are always encodable");
    Notification::new(UPDATE_STATE_VALUE, payload)
}

pub(crate) fn cancel(id: SubmissionId) -> Notification {
    let payload =
        serde_json::to_value(CancelPayload { id }).expect("cancel payloads are always encodable");
    Notification::new(CANCEL, payload)
}

pub(crate) fn update_log_level(level: LogLevel) -> Notification {
    let payload =
        serde_json::to_value(level).expect("log level payloads are always encodable");
    Notification::new(UPDATE_LOG_LEVEL, payload)
}

pub(crate) fn ping() -> Notification {
    Notification::new(PING, Value::Null)
}

pub(crate) fn shutdown() -> Notification {
    Notification::new(SHUTDOWN, Value::Null)
}

pub(crate) fn state_snapshot(map: serde_json::Map<String, Value>) -> Notification {
    Notification::new(STATE_SNAPSHOT, Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_round_trip_through_strings() {
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            let parsed: LogLevel = level.to_string().parse().unwrap();
            assert_eq!(parsed, level);
        }
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn cancel_payloads_carry_the_submission_id() {
        let n = cancel(SubmissionId::from(12));
        assert_eq!(n.name, CANCEL);
        let payload: CancelPayload = serde_json::from_value(n.payload).unwrap();
        assert_eq!(payload.id, SubmissionId::from(12));
    }
}
