// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, atomic::{AtomicU32, Ordering}};

use anyhow::{Context, Result};
use rbusd::{
    connection::ConnectionLimits,
    message::{Message, MessageBuilder},
    policy::Policy,
    router::Router,
    server::BusServer,
    transport::AuthMechanism,
    wire::{Endian, PREAMBLE_LEN},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};

/// Binds a fresh bus on a temp-dir socket and spawns its accept loop,
/// mirroring what `main.rs` does for one `<listen>` address.
pub async fn spawn_bus(policy: Policy) -> Result<(tempfile::TempDir, std::path::PathBuf, Arc<Router>)> {
    let dir = tempfile::tempdir().context("tempdir")?;
    let socket_path = dir.path().join("bus.sock");
    let router = Arc::new(Router::new(1, policy, Endian::Little));
    let server = BusServer::bind(
        socket_path.to_str().expect("utf8 path"),
        Arc::clone(&router),
        vec![AuthMechanism::Anonymous],
        ConnectionLimits::default(),
    )
    .context("bind")?;
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    // Give the accept loop a chance to start listening before any caller
    // tries to connect.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    Ok((dir, socket_path, router))
}

/// A bare client speaking the wire protocol directly, the way a real peer
/// library would, instead of going through `BusConnection`/`Router`.
pub struct TestClient {
    stream: UnixStream,
    next_serial: AtomicU32,
}

impl TestClient {
    pub async fn connect(socket_path: &std::path::Path) -> Result<Self> {
        let mut stream = UnixStream::connect(socket_path).await.context("connect")?;
        stream.write_all(&[0u8]).await?;
        stream.write_all(b"AUTH ANONYMOUS\r\n").await?;
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await?;
        anyhow::ensure!(
            String::from_utf8_lossy(&buf[..n]).starts_with("OK "),
            "auth not accepted"
        );
        stream.write_all(b"BEGIN\r\n").await?;
        Ok(Self { stream, next_serial: AtomicU32::new(1) })
    }

    /// Sends `builder`, stamping the next client-local serial, and returns
    /// the serial used.
    pub async fn send(&mut self, builder: MessageBuilder) -> Result<u32> {
        let msg = builder.build(Endian::Little);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        assert!(msg.assign_serial(serial));
        self.stream.write_all(&msg.encode()?).await?;
        Ok(serial)
    }

    /// Reads one complete framed message off the wire.
    pub async fn recv(&mut self) -> Result<Message> {
        let mut header = [0u8; PREAMBLE_LEN];
        self.stream.read_exact(&mut header).await.context("reading preamble")?;
        let hdr_len = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;
        let body_len = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes")) as usize;
        let mut rest = vec![0u8; hdr_len + body_len];
        self.stream.read_exact(&mut rest).await.context("reading header+body")?;
        let mut full = header.to_vec();
        full.extend_from_slice(&rest);
        Ok(Message::decode(&full)?)
    }

    /// Completes the `Hello` handshake and returns the assigned unique name.
    pub async fn hello(&mut self) -> Result<String> {
        self.send(MessageBuilder::new("Hello", rbusd::router::BUS_NAME)).await?;
        let reply = self.recv().await?;
        let name = reply
            .body()
            .first()
            .and_then(rbusd::wire::Value::as_str)
            .context("Hello reply missing unique name")?
            .to_owned();
        // `NameAcquired` always follows the reply, per the hand-off order
        // the router commits to.
        let signal = self.recv().await?;
        anyhow::ensure!(signal.has_name("NameAcquired"), "expected NameAcquired after Hello");
        Ok(name)
    }

    #[allow(dead_code)]
    pub fn stream_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }
}
