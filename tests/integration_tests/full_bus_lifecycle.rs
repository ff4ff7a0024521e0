// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end coverage over a real `UnixListener`/`UnixStream` pair: two
//! independent peers completing `Hello`, contending for a well-known name,
//! and observing the resulting `NameOwnerChanged` traffic and disconnect
//! cleanup, none of which a single-module unit test can exercise together.

use rbusd::{
    message::MessageBuilder,
    policy::Policy,
    registry::{RequestNameFlags, RequestNameReply},
    router::BUS_NAME,
    wire::Value,
};

use crate::integration_tests::common::{TestClient, spawn_bus};

#[tokio::test]
async fn two_peers_contend_for_a_name_then_the_owner_disconnects() {
    let (_dir, socket_path, _router) = spawn_bus(Policy::default()).await.expect("spawn bus");

    let mut a = TestClient::connect(&socket_path).await.expect("connect a");
    let mut b = TestClient::connect(&socket_path).await.expect("connect b");
    let unique_a = a.hello().await.expect("hello a");
    let unique_b = b.hello().await.expect("hello b");
    assert_ne!(unique_a, unique_b);

    // B watches for ownership changes on the name it is about to lose.
    let mut add_match = MessageBuilder::new("AddMatch", BUS_NAME);
    add_match.append_arg(Value::from("type='signal',member='NameOwnerChanged'"));
    b.send(add_match).await.expect("send AddMatch");
    let reply = b.recv().await.expect("AddMatch reply");
    assert!(!reply.is_error());

    let mut request_a = MessageBuilder::new("RequestName", BUS_NAME);
    request_a.append_args(vec![Value::from("org.example.Shared"), Value::Uint32(RequestNameFlags::empty().bits())]);
    a.send(request_a).await.expect("send RequestName from a");
    let reply_a = a.recv().await.expect("RequestName reply to a");
    assert_eq!(reply_a.body().first(), Some(&Value::Uint32(RequestNameReply::PrimaryOwner.code())));

    // A's acquisition is broadcast (B's match rule above picks it up)
    // before B ever sends its own contending RequestName.
    let owner_changed = b.recv().await.expect("NameOwnerChanged broadcast");
    assert_eq!(owner_changed.name(), Some("NameOwnerChanged"));
    assert_eq!(owner_changed.body().first(), Some(&Value::from("org.example.Shared")));
    assert_eq!(owner_changed.body().get(2), Some(&Value::from(unique_a.as_str())));

    let mut request_b = MessageBuilder::new("RequestName", BUS_NAME);
    request_b.append_args(vec![
        Value::from("org.example.Shared"),
        Value::Uint32(RequestNameFlags::DO_NOT_QUEUE.bits()),
    ]);
    b.send(request_b).await.expect("send RequestName from b");
    let reply_b = b.recv().await.expect("RequestName reply to b");
    assert_eq!(reply_b.body().first(), Some(&Value::Uint32(RequestNameReply::Exists.code())));

    // Dropping A's socket should release the name and hand it to nobody
    // (B asked not to queue), surfacing a second NameOwnerChanged to B.
    drop(a);
    let released = b.recv().await.expect("NameOwnerChanged after disconnect");
    assert_eq!(released.name(), Some("NameOwnerChanged"));
    assert_eq!(released.body().first(), Some(&Value::from("org.example.Shared")));
    assert_eq!(released.body().get(1), Some(&Value::from(unique_a.as_str())));
    assert_eq!(released.body().get(2), Some(&Value::from("")));
}

#[tokio::test]
async fn list_names_reflects_bus_name_and_acquired_names() {
    let (_dir, socket_path, _router) = spawn_bus(Policy::default()).await.expect("spawn bus");
    let mut client = TestClient::connect(&socket_path).await.expect("connect");
    client.hello().await.expect("hello");

    let mut request = MessageBuilder::new("RequestName", BUS_NAME);
    request.append_args(vec![Value::from("org.example.Thing"), Value::Uint32(RequestNameFlags::empty().bits())]);
    client.send(request).await.expect("send RequestName");
    let _ = client.recv().await.expect("RequestName reply");

    client.send(MessageBuilder::new("ListNames", BUS_NAME)).await.expect("send ListNames");
    let reply = client.recv().await.expect("ListNames reply");
    let Some(Value::Array { items, .. }) = reply.body().first() else {
        panic!("ListNames reply body should be a string array");
    };
    let names: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
    assert!(names.contains(&BUS_NAME));
    assert!(names.contains(&"org.example.Thing"));
}
