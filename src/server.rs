// SPDX-License-Identifier: AGPL-3.0-or-later

//! Main-loop integration (C9): accepts connections on a `UnixListener`,
//! runs each through the auth handshake, then hands it off to the
//! authenticated read/write loop with its messages routed through the
//! shared [`Router`].
//!
//! A plain accept loop spawning one task per peer, each logging its own
//! lifecycle via `tracing`. The abstract watch/timeout callback model
//! (`add_watch`, `remove_watch`, `toggle_watch`, and the timeout trio)
//! some message buses expose to host event loops is replaced here by
//! tokio's own readiness-driven I/O — `BusConnection`/`Router` never call
//! into a poller API directly, so a different host loop could still be
//! substituted without touching C1-C7.

use std::{os::unix::fs::FileTypeExt, sync::Arc};

use anyhow::{Context, Result, bail};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::{
    connection::{BusConnection, ConnectionIdAllocator, ConnectionLimits},
    policy::Principal,
    router::Router,
    transport::{self, AuthMechanism},
    utils::generate_guid,
};

/// Parses a bus `<listen>` address of the form `unix:path=/tmp/bus` into
/// the filesystem path to bind. Remote transports (`tcp:...`) are out of
/// scope, so any other scheme is rejected rather than silently
/// ignored.
pub fn unix_listen_path(address: &str) -> Result<String> {
    let rest = address.strip_prefix("unix:").ok_or_else(|| {
        anyhow::anyhow!("unsupported listen address scheme (only unix: is implemented): {address}")
    })?;
    for pair in rest.split(',') {
        if let Some(path) = pair.strip_prefix("path=") {
            return Ok(path.to_owned());
        }
    }
    bail!("unix listen address missing path= component: {address}")
}

/// Owns the listening socket and the shared routing state every accepted
/// connection is wired into.
pub struct BusServer {
    listener: UnixListener,
    router: Arc<Router>,
    guid: String,
    allowed_mechanisms: Vec<AuthMechanism>,
    limits: ConnectionLimits,
    ids: Arc<ConnectionIdAllocator>,
}

impl BusServer {
    /// Binds a fresh listening socket at `socket_path`, removing a stale
    /// socket file left behind by a previous run (a clean shutdown already
    /// unlinks it; a crash can leave it behind, and `bind` on an existing
    /// path otherwise fails with `AddrInUse`).
    pub fn bind(
        socket_path: &str,
        router: Arc<Router>,
        allowed_mechanisms: Vec<AuthMechanism>,
        limits: ConnectionLimits,
    ) -> Result<Self> {
        if let Ok(meta) = std::fs::metadata(socket_path)
            && meta.file_type().is_socket()
        {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("removing stale socket at {socket_path}"))?;
        }
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("binding unix listener at {socket_path}"))?;
        Ok(Self {
            listener,
            router,
            guid: generate_guid(),
            allowed_mechanisms,
            limits,
            ids: Arc::new(ConnectionIdAllocator::default()),
        })
    }

    /// Runs the accept loop until the listener errors (the process is
    /// expected to be killed rather than told to stop gracefully).
    pub async fn run(self) -> Result<()> {
        info!(guid = %self.guid, "bus server accepting connections");
        loop {
            let (stream, _addr) = self.listener.accept().await.context("accepting connection")?;
            let router = Arc::clone(&self.router);
            let guid = self.guid.clone();
            let allowed = self.allowed_mechanisms.clone();
            let limits = self.limits;
            let ids = Arc::clone(&self.ids);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, router, guid, allowed, limits, ids).await {
                    warn!("connection handling ended with error: {e:#}");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    router: Arc<Router>,
    guid: String,
    allowed: Vec<AuthMechanism>,
    limits: ConnectionLimits,
    ids: Arc<ConnectionIdAllocator>,
) -> Result<()> {
    let peer_cred = stream.peer_cred().context("reading peer credential")?;
    let groups = crate::utils::groups_for_uid(peer_cred.uid(), peer_cred.gid());
    let principal = Principal { uid: peer_cred.uid(), groups };

    let (read_half, write_half) = stream.into_split();
    let mut reader = tokio::io::BufReader::new(read_half);
    let mut writer = write_half;
    let auth_result =
        transport::run_auth_handshake(&mut reader, &mut writer, &allowed, principal, &guid)
            .await
            .context("auth handshake failed")?;

    let read_half = reader.into_inner();
    let stream = read_half
        .reunite(writer)
        .map_err(|e| anyhow::anyhow!("failed to reunite stream halves: {e}"))?;

    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let conn = BusConnection::new(ids.next(), outbound_tx, limits);
    let authenticated_uid = auth_result.principal.uid;
    conn.set_principal(auth_result.principal);
    router.connections.insert(Arc::clone(&conn));
    info!(connection = ?conn.id, uid = authenticated_uid, "connection authenticated");

    let route_router = Arc::clone(&router);
    let route_id = conn.id;
    transport::run_authenticated_loop(stream, Arc::clone(&conn), outbound_rx, move |msg| {
        route_router.route(route_id, msg);
    })
    .await;

    router.disconnect(conn.id);
    info!(connection = ?conn.id, "connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_listen_path_parses_path_attribute() {
        assert_eq!(
            unix_listen_path("unix:path=/tmp/bus").expect("parse"),
            "/tmp/bus".to_owned()
        );
    }

    #[test]
    fn unix_listen_path_parses_path_among_multiple_attributes() {
        assert_eq!(
            unix_listen_path("unix:abstract=0,path=/tmp/bus").expect("parse"),
            "/tmp/bus".to_owned()
        );
    }

    #[test]
    fn unix_listen_path_rejects_tcp_scheme() {
        assert!(unix_listen_path("tcp:host=localhost,port=1234").is_err());
    }

    #[tokio::test]
    async fn bind_and_accept_one_connection_completes_hello() {
        use crate::{
            message::MessageBuilder,
            policy::Policy,
            wire::{Endian, Value},
        };

        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("bus.sock");
        let router = Arc::new(Router::new(1, Policy::default(), Endian::Little));
        let server = BusServer::bind(
            socket_path.to_str().expect("utf8 path"),
            Arc::clone(&router),
            vec![AuthMechanism::Anonymous],
            ConnectionLimits::default(),
        )
        .expect("bind");

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        // Give the accept loop a chance to start listening.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut client = UnixStream::connect(&socket_path).await.expect("connect");
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(&[0u8]).await.expect("nul byte");
        client.write_all(b"AUTH ANONYMOUS\r\n").await.expect("auth line");
        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).await.expect("read OK");
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("OK "));
        client.write_all(b"BEGIN\r\n").await.expect("begin");

        let hello = MessageBuilder::new("Hello", crate::router::BUS_NAME).build(Endian::Little);
        let _ = hello.assign_serial(1);
        client.write_all(&hello.encode().expect("encode")).await.expect("write hello");

        let mut header = [0u8; crate::wire::PREAMBLE_LEN];
        client.read_exact(&mut header).await.expect("read reply preamble");
        let hdr_len = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;
        let body_len = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes")) as usize;
        let mut rest = vec![0u8; hdr_len + body_len];
        client.read_exact(&mut rest).await.expect("read reply body");
        let mut full = header.to_vec();
        full.extend_from_slice(&rest);
        let reply = crate::message::Message::decode(&full).expect("decode reply");
        assert!(matches!(reply.body().first(), Some(Value::String(s)) if s.starts_with(':')));
    }
}
