use crate::notifications::LogLevel;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::*;

/// A collection of knobs that affect how the pool runs. This is not specific to a single
/// submission, it relates to the pool itself.
///
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(error = "ConfigError"))]
pub struct Config {
    /// The number of worker processes to request. `0` means "pick for me", which resolves to
    /// one worker per available CPU, minus one for the host program.
    #[builder(default = "0")]
    worker_count: usize,

    /// How long `start_workers` waits for every worker to signal that it finished its init
    /// functions and is accepting submissions.
    #[builder(default = "self.default_start_timeout()")]
    start_timeout: Duration,

    /// How long the notification plane may sit idle before a keepalive ping is broadcast, so
    /// workers can tell the main process is still there.
    #[builder(default = "self.default_keep_alive_interval()")]
    keep_alive_interval: Duration,

    /// How long `stop` waits for workers to exit cleanly before force-killing them, when the
    /// caller does not pass an explicit timeout.
    #[builder(default = "self.default_stop_timeout()")]
    stop_timeout: Duration,

    /// The program to execute as the worker image. By default this is the current executable,
    /// which re-runs the host's registration code and then diverts into the worker runtime.
    #[builder(default = "self.default_worker_program()?")]
    worker_program: PathBuf,

    /// Extra environment variables for worker processes. Workers inherit the host environment;
    /// these are layered on top.
    #[builder(default)]
    worker_env: HashMap<String, String>,

    /// The directory in which the cross-process lock file is created.
    #[builder(default = "self.default_lock_dir()")]
    lock_dir: PathBuf,

    /// The log level worker processes start with. Can be changed at runtime with
    /// `Pool::update_log_level`.
    #[builder(default = "LogLevel::Info")]
    worker_log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build().unwrap()
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn start_timeout(&self) -> Duration {
        self.start_timeout
    }

    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub fn worker_program(&self) -> &PathBuf {
        &self.worker_program
    }

    pub fn worker_env(&self) -> &HashMap<String, String> {
        &self.worker_env
    }

    pub fn lock_dir(&self) -> &PathBuf {
        &self.lock_dir
    }

    pub fn worker_log_level(&self) -> LogLevel {
        self.worker_log_level
    }

    /// The worker count that will actually be spawned: the requested count clamped so that at
    /// least one CPU stays free for the host program, but never below one worker.
    pub fn effective_worker_count(&self) -> usize {
        clamp_worker_count(self.worker_count, num_cpus::get())
    }
}

impl ConfigBuilder {
    fn default_start_timeout(&self) -> Duration {
        Duration::from_secs(20)
    }

    fn default_keep_alive_interval(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn default_stop_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn default_worker_program(&self) -> Result<PathBuf, ConfigError> {
        std::env::current_exe().map_err(ConfigError::CouldNotResolveWorkerProgram)
    }

    fn default_lock_dir(&self) -> PathBuf {
        std::env::temp_dir()
    }
}

pub(crate) fn clamp_worker_count(requested: usize, available_cpus: usize) -> usize {
    let cap = available_cpus.saturating_sub(1).max(1);
    if requested == 0 {
        cap
    } else {
        requested.min(cap)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not resolve the worker program path")]
    CouldNotResolveWorkerProgram(#[source] std::io::Error),

    #[error("could not create the cross-process lock file at {path:?}")]
    CouldNotCreateLockFile {
        path: PathBuf,
        #[source] err: std::io::Error,
    },

    #[error("attempted to build a Config struct while missing fields: {0:?}")]
    BuilderError(derive_builder::UninitializedFieldError),
}

impl From<derive_builder::UninitializedFieldError> for ConfigError {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        Self::BuilderError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let config = Config::default();
        assert_eq!(config.worker_count(), 0);
        assert!(config.effective_worker_count() >= 1);
    }

    #[test]
    fn one_cpu_machines_still_get_one_worker() {
        assert_eq!(clamp_worker_count(0, 1), 1);
        assert_eq!(clamp_worker_count(4, 1), 1);
    }

    #[quickcheck]
    fn clamped_count_never_exceeds_cpus_minus_one(requested: usize, cpus: usize) -> bool {
        let cpus = cpus.max(2);
        clamp_worker_count(requested, cpus) <= cpus - 1
    }

    #[quickcheck]
    fn clamped_count_is_at_least_one(requested: usize, cpus: usize) -> bool {
        clamp_worker_count(requested, cpus) >= 1
    }

    #[quickcheck]
    fn small_requests_are_honored(requested: usize, cpus: usize) -> bool {
        let cpus = cpus.max(2);
        let requested = requested.max(1);
        if requested <= cpus - 1 {
            clamp_worker_count(requested, cpus) == requested
        } else {
            true
        }
    }
}
