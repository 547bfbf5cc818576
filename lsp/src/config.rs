//! Launch and timing configuration for one language server.
//!
//! Deserialized by callers (the CLI reads it from TOML); everything except
//! `command` has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::codec::DEFAULT_MAX_FRAME_BYTES;

const DEFAULT_DESYNC_THRESHOLD: usize = 16;

/// Configuration for a single language server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "rust-analyzer"), resolved on `PATH`.
    command: String,
    #[serde(default)]
    args: Vec<String>,
    /// Child working directory; also the default workspace root.
    #[serde(default)]
    working_dir: Option<PathBuf>,
    /// Forwarded verbatim as `initializationOptions`.
    #[serde(default)]
    initialization_options: Option<Value>,
    /// Forwarded as `trace` ("off", "messages", "verbose").
    #[serde(default)]
    trace: Option<String>,
    #[serde(default)]
    timeouts: Timeouts,
    #[serde(default = "default_max_frame_bytes")]
    max_frame_bytes: usize,
    /// Consecutive unmatched responses before a desync is reported.
    #[serde(default = "default_desync_threshold")]
    desync_threshold: usize,
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_desync_threshold() -> usize {
    DEFAULT_DESYNC_THRESHOLD
}

impl ServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            initialization_options: None,
            trace: None,
            timeouts: Timeouts::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            desync_threshold: DEFAULT_DESYNC_THRESHOLD,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_initialization_options(mut self, options: Value) -> Self {
        self.initialization_options = Some(options);
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_desync_threshold(mut self, threshold: usize) -> Self {
        self.desync_threshold = threshold;
        self
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    #[must_use]
    pub fn initialization_options(&self) -> Option<&Value> {
        self.initialization_options.as_ref()
    }

    #[must_use]
    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    #[must_use]
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    #[must_use]
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    #[must_use]
    pub fn desync_threshold(&self) -> usize {
        self.desync_threshold
    }
}

/// Protocol timeouts, in milliseconds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// `initialize` may trigger workspace indexing, so this one is generous.
    pub initialize_ms: u64,
    /// Default bound for [`Session::call_default`](crate::Session::call_default).
    pub request_ms: u64,
    /// How long `shutdown` may take before `exit` is sent anyway.
    pub shutdown_ms: u64,
    /// Grace period between terminate and kill.
    pub grace_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            initialize_ms: 30_000,
            request_ms: 10_000,
            shutdown_ms: 2_000,
            grace_ms: 2_000,
        }
    }
}

impl Timeouts {
    #[must_use]
    pub fn initialize(&self) -> Duration {
        Duration::from_millis(self.initialize_ms)
    }

    #[must_use]
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    #[must_use]
    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }

    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}
