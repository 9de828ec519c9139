//! Accumulated image configuration.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Environment, working directory, user, ports, labels and entry point at
/// one point of a stage.
///
/// A value is never mutated in place: each `with_*` method consumes the
/// value and returns the next one, so the config after instruction `i` is a
/// function of the config before it and the instruction alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    env: BTreeMap<String, String>,
    workdir: Option<String>,
    user: Option<String>,
    exposed_ports: BTreeSet<String>,
    labels: BTreeMap<String, String>,
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    volumes: BTreeSet<String>,
}

impl StageConfig {
    /// An empty config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory (an absolute image path).
    #[must_use]
    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Set the user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Expose a port, written `port` or `port/protocol`.
    #[must_use]
    pub fn with_exposed_port(mut self, port: impl Into<String>) -> Self {
        self.exposed_ports.insert(port.into());
        self
    }

    /// Set a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the entry point.
    #[must_use]
    pub fn with_entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }

    /// Set the default command.
    #[must_use]
    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    /// Declare a volume mount point.
    #[must_use]
    pub fn with_volume(mut self, path: impl Into<String>) -> Self {
        self.volumes.insert(path.into());
        self
    }

    /// Environment variables.
    #[must_use]
    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Environment as `KEY=value` strings, sorted by key.
    #[must_use]
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Working directory; `/` when never set.
    #[must_use]
    pub fn workdir(&self) -> &str {
        self.workdir.as_deref().unwrap_or("/")
    }

    /// Whether a working directory was set explicitly.
    #[must_use]
    pub const fn has_workdir(&self) -> bool {
        self.workdir.is_some()
    }

    /// User, if set.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Exposed ports.
    #[must_use]
    pub const fn exposed_ports(&self) -> &BTreeSet<String> {
        &self.exposed_ports
    }

    /// Labels.
    #[must_use]
    pub const fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Entry point, if set.
    #[must_use]
    pub fn entrypoint(&self) -> Option<&[String]> {
        self.entrypoint.as_deref()
    }

    /// Default command, if set.
    #[must_use]
    pub fn cmd(&self) -> Option<&[String]> {
        self.cmd.as_deref()
    }

    /// Volume mount points.
    #[must_use]
    pub const fn volumes(&self) -> &BTreeSet<String> {
        &self.volumes
    }
}
