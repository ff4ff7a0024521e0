// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Parsed command-line invocation. Hand-rolled rather than pulled from a
/// flags crate: `std::env::args()` is read straight off with no
/// argument-parsing crate in the dependency stack, which suits the one or
/// two flags this daemon accepts.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the process-local YAML config (`DaemonConfig`).
    pub daemon_config: String,
    /// Path to the logger's own YAML config, passed through unchanged to
    /// [`crate::config::logger::init_logger`].
    pub logger_config: String,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self { daemon_config: "daemon.yaml".to_owned(), logger_config: "logger.yaml".to_owned() }
    }
}

/// Parses `--config <path>` and `--log-config <path>` out of `args`
/// (normally `std::env::args().skip(1)`). Unknown flags are rejected;
/// missing flags fall back to [`CliArgs::default`].
pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs> {
    let mut result = CliArgs::default();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                result.daemon_config =
                    iter.next().ok_or_else(|| anyhow::anyhow!("--config requires a path argument"))?;
            },
            "--log-config" => {
                result.logger_config = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--log-config requires a path argument"))?;
            },
            other => bail!("unrecognized argument: {other}"),
        }
    }
    Ok(result)
}

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}
