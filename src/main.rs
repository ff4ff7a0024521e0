// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use rbusd::{
    config::{cli::{parse_args, resolve_config_path}, daemon::DaemonConfig, logger::init_logger, parser},
    connection::ConnectionLimits,
    registry::next_generation_from_seed_file,
    router::Router,
    server::{BusServer, unix_listen_path},
    transport::AuthMechanism,
    wire::Endian,
};
use tokio::task::JoinSet;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1)).context("parsing command-line arguments")?;
    let logger_config_path =
        resolve_config_path(&args.logger_config).context("resolving logger config path")?;
    let logger_config_path = logger_config_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("logger config path is not valid UTF-8"))?;
    let _logger_guard = init_logger(logger_config_path)?;

    let daemon_config_path =
        resolve_config_path(&args.daemon_config).context("resolving daemon config path")?;
    let daemon_cfg =
        DaemonConfig::load_from_file(&daemon_config_path).context("loading daemon config")?;
    let bus_cfg = parser::parse_file(std::path::Path::new(&daemon_cfg.bus_config_path))
        .context("parsing bus config")?;

    if let Some(user) = &bus_cfg.user {
        warn!(user, "<user> drop-privileges is not implemented (platform-specific primitive, out of scope)");
    }
    if bus_cfg.fork {
        warn!("<fork/> is not implemented; rbusd always runs in the foreground");
    }
    if let Some(pidfile) = &bus_cfg.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing pidfile {pidfile}"))?;
    }

    let generation =
        next_generation_from_seed_file(&daemon_cfg.generation_seed_file_path())
            .context("reading/advancing generation seed file")?;

    let allowed_mechanisms: Vec<AuthMechanism> = bus_cfg
        .auth_mechanisms
        .iter()
        .filter_map(|m| AuthMechanism::from_wire_name(m))
        .collect();
    let allowed_mechanisms =
        if allowed_mechanisms.is_empty() { vec![AuthMechanism::Anonymous, AuthMechanism::External] } else { allowed_mechanisms };

    let limits = ConnectionLimits::from(daemon_cfg.limits);
    let router = Arc::new(Router::new(generation, bus_cfg.policy, Endian::Little));

    let mut servers = JoinSet::new();
    let mut bound_any = false;
    for address in &bus_cfg.listen {
        let socket_path = match unix_listen_path(address) {
            Ok(path) => path,
            Err(e) => {
                warn!("skipping unsupported listen address {address}: {e:#}");
                continue;
            },
        };
        let server =
            BusServer::bind(&socket_path, Arc::clone(&router), allowed_mechanisms.clone(), limits)
                .with_context(|| format!("binding listen address {address}"))?;
        info!(socket_path, "listening");
        bound_any = true;
        servers.spawn(async move { server.run().await });
    }

    anyhow::ensure!(bound_any, "no usable listen address in bus config (only unix: is supported)");

    while let Some(result) = servers.join_next().await {
        match result {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!("a listener stopped: {e:#}"),
            Err(e) => warn!("listener task panicked: {e:#}"),
        }
    }

    Ok(())
}
