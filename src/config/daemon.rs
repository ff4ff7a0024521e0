// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Process-local daemon configuration: the knobs that live outside the
//! bus policy XML schema (data directory, generation persistence, socket
//! backlog, resource caps). A `serde`+`serde_yaml` struct with a
//! `load_from_file` / `validate_and_normalize` pair, split between
//! "session/wire parameters" (the bus XML, loaded by [`super::parser`])
//! and "process parameters" (this file).

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionLimits;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DaemonConfig {
    /// Path (relative to this file's own directory unless absolute) to the
    /// `busconfig` XML tree that supplies listen addresses, auth
    /// mechanisms and the policy.
    #[serde(rename = "BusConfigPath")]
    pub bus_config_path: String,

    /// Directory the daemon may write runtime state into (currently only
    /// the generation seed file).
    #[serde(rename = "DataDirectory")]
    pub data_directory: String,

    /// File holding the persisted unique-name generation counter, resolved
    /// relative to `DataDirectory`. See [`crate::registry::next_generation_from_seed_file`].
    #[serde(default = "default_generation_seed_file", rename = "GenerationSeedFile")]
    pub generation_seed_file: String,

    /// Requested kernel accept-backlog for the listening socket. `tokio`'s
    /// `UnixListener` has no API to set this (unlike a raw `socket2`
    /// listener, which this crate's dependency stack does not otherwise
    /// need); the field is parsed and validated but not yet wired to the
    /// listener, see DESIGN.md.
    #[serde(default = "default_socket_backlog", rename = "SocketBacklog")]
    pub socket_backlog: u32,

    #[serde(default, rename = "Limits")]
    pub limits: DaemonLimits,
}

fn default_generation_seed_file() -> String {
    "generation".to_owned()
}

fn default_socket_backlog() -> u32 {
    128
}

/// YAML mirror of [`ConnectionLimits`]'s configurable resource caps. Kept
/// as a separate serde-friendly struct rather
/// than deriving `Deserialize` directly on `ConnectionLimits` so that
/// connection.rs stays free of a serde dependency on its own types.
#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
pub struct DaemonLimits {
    #[serde(rename = "MaxPendingReplies")]
    pub max_pending_replies: usize,
    #[serde(rename = "MaxMatchRules")]
    pub max_match_rules: usize,
    #[serde(rename = "MaxOutboundBytes")]
    pub max_outbound_bytes: u64,
    #[serde(rename = "MaxMessageSize")]
    pub max_message_size: usize,
    #[serde(rename = "MaxFdsPerMessage")]
    pub max_fds_per_message: usize,
}

impl Default for DaemonLimits {
    fn default() -> Self {
        let defaults = ConnectionLimits::default();
        Self {
            max_pending_replies: defaults.max_pending_replies,
            max_match_rules: defaults.max_match_rules,
            max_outbound_bytes: defaults.max_outbound_bytes,
            max_message_size: defaults.max_message_size,
            max_fds_per_message: defaults.max_fds_per_message,
        }
    }
}

impl From<DaemonLimits> for ConnectionLimits {
    fn from(limits: DaemonLimits) -> Self {
        Self {
            max_pending_replies: limits.max_pending_replies,
            max_match_rules: limits.max_match_rules,
            max_outbound_bytes: limits.max_outbound_bytes,
            max_message_size: limits.max_message_size,
            max_fds_per_message: limits.max_fds_per_message,
        }
    }
}

impl DaemonConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: DaemonConfig =
            serde_yaml::from_str(&s).context("failed to parse daemon config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants; normalizes nothing at present (unlike the
    /// teacher's session-type-driven normalization, this config has no
    /// fields whose value implies another).
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.bus_config_path.is_empty(), "BusConfigPath must not be empty");
        ensure!(!self.data_directory.is_empty(), "DataDirectory must not be empty");
        ensure!(self.socket_backlog >= 1, "SocketBacklog must be >= 1");
        ensure!(self.limits.max_pending_replies >= 1, "MaxPendingReplies must be >= 1");
        ensure!(self.limits.max_match_rules >= 1, "MaxMatchRules must be >= 1");
        ensure!(self.limits.max_outbound_bytes >= 1, "MaxOutboundBytes must be >= 1");
        ensure!(self.limits.max_message_size >= 16, "MaxMessageSize must be >= 16");
        Ok(())
    }

    /// The generation seed file resolved against `data_directory`.
    pub fn generation_seed_file_path(&self) -> std::path::PathBuf {
        Path::new(&self.data_directory).join(&self.generation_seed_file)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_temp_yaml(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("daemon.yaml");
        let mut f = fs::File::create(&path).expect("create");
        f.write_all(content.as_bytes()).expect("write");
        path
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_temp_yaml(
            &dir,
            r#"
BusConfigPath: "bus.conf"
DataDirectory: "/var/lib/rbusd"
"#,
        );
        let cfg = DaemonConfig::load_from_file(&path).expect("load");
        assert_eq!(cfg.socket_backlog, 128);
        assert_eq!(cfg.limits.max_message_size, 64 * 1024 * 1024);
        assert_eq!(cfg.generation_seed_file, "generation");
    }

    #[test]
    fn rejects_empty_bus_config_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_temp_yaml(
            &dir,
            r#"
BusConfigPath: ""
DataDirectory: "/var/lib/rbusd"
"#,
        );
        assert!(DaemonConfig::load_from_file(&path).is_err());
    }

    #[test]
    fn generation_seed_file_path_joins_data_directory() {
        let cfg = DaemonConfig {
            bus_config_path: "bus.conf".into(),
            data_directory: "/var/lib/rbusd".into(),
            generation_seed_file: "generation".into(),
            socket_backlog: 128,
            limits: DaemonLimits::default(),
        };
        assert_eq!(cfg.generation_seed_file_path(), Path::new("/var/lib/rbusd/generation"));
    }
}
