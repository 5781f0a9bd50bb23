// Protocol clients against the in-process stub server.

mod common;

use std::net::TcpStream;
use std::sync::Arc;

use kvsoda::clients::{BinaryClient, Store, StoreFactory, TargetFactory, TextClient};
use kvsoda::{key_for, ArpaVerb, OpKind, Operation, SodaError, Target, WorkloadConfig};

fn config(batch: usize) -> WorkloadConfig {
    WorkloadConfig {
        batch,
        ..WorkloadConfig::default()
    }
}

fn op(kind: OpKind, id: i64) -> Operation {
    let payload = match kind {
        OpKind::Set | OpKind::Arpa(_) => Some(format!("doc-{}", id)),
        _ => None,
    };
    Operation {
        kind,
        key_id: id,
        key: key_for(id, ""),
        payload,
    }
}

#[test]
fn test_binary_sets_then_gets() {
    let server = common::start_binary(None);
    let stream = TcpStream::connect(server.addr).unwrap();
    let mut client = BinaryClient::new(stream, &config(10), None);

    for id in 0..50 {
        client.enqueue(op(OpKind::Set, id)).unwrap();
    }
    for id in 0..50 {
        client.enqueue(op(OpKind::Get, id)).unwrap();
    }
    client.finish().unwrap();

    assert_eq!(client.num_ops(), 100);
    assert_eq!(client.error_responses(), 0);
    assert!(client.timings().get("set").map_or(0, |h| h.total()) > 0);

    let state = server.state.lock();
    assert_eq!(state.items.len(), 50);
    assert_eq!(state.count("set"), 50);
    assert_eq!(state.count("get"), 50);
    assert_eq!(
        state.items.get(key_for(7, "").as_bytes()).map(Vec::as_slice),
        Some(&b"doc-7"[..])
    );
}

#[test]
fn test_binary_arpa_extras_and_misses() {
    let server = common::start_binary(None);
    let stream = TcpStream::connect(server.addr).unwrap();
    let mut client = BinaryClient::new(stream, &config(4), None);

    client.enqueue(op(OpKind::Set, 1)).unwrap();
    client.enqueue(op(OpKind::Arpa(ArpaVerb::Append), 1)).unwrap();
    client.enqueue(op(OpKind::Arpa(ArpaVerb::Prepend), 1)).unwrap();
    client.enqueue(op(OpKind::Arpa(ArpaVerb::Add), 1)).unwrap();
    client.enqueue(op(OpKind::Arpa(ArpaVerb::Replace), 2)).unwrap();
    client.enqueue(op(OpKind::Delete, 3)).unwrap();
    client.finish().unwrap();

    assert_eq!(client.num_ops(), 6);
    // add on an existing key, replace and delete on missing keys
    assert_eq!(client.error_responses(), 3);

    let state = server.state.lock();
    for request in &state.requests {
        let expected = match request.command.as_str() {
            "set" | "add" | "replace" => 8,
            _ => 0,
        };
        assert_eq!(request.extras_len, expected, "{}", request.command);
    }
    assert_eq!(
        state.items.get(key_for(1, "").as_bytes()).map(Vec::as_slice),
        Some(&b"doc-1doc-1doc-1"[..])
    );
}

#[test]
fn test_binary_truncated_header_is_connection_lost() {
    let server = common::start_truncating(10);
    let stream = TcpStream::connect(server.addr).unwrap();
    let mut client = BinaryClient::new(stream, &config(10), None);

    client.enqueue(op(OpKind::Get, 1)).unwrap();
    match client.finish() {
        Err(SodaError::ConnectionLost { needed, got }) => {
            assert_eq!(needed, 24);
            assert_eq!(got, 10);
        }
        other => panic!("expected ConnectionLost, got {:?}", other),
    }
}

#[test]
fn test_factory_authenticates() {
    let server = common::start_binary(Some(("bucket", "secret")));
    let target = Target::parse(&format!("memcached://bucket:secret@{}", server.addr)).unwrap();
    let factory = TargetFactory::new(target, Arc::new(config(5)), None);

    let mut store = factory.create_store(0).unwrap();
    store.enqueue(op(OpKind::Set, 0)).unwrap();
    store.finish().unwrap();
    assert_eq!(store.num_ops(), 1);
    assert_eq!(server.state.lock().count("sasl-auth"), 1);
}

#[test]
fn test_factory_rejects_bad_password() {
    let server = common::start_binary(Some(("bucket", "secret")));
    let target = Target::parse(&format!("memcached://bucket:wrong@{}", server.addr)).unwrap();
    let factory = TargetFactory::new(target, Arc::new(config(5)), None);

    match factory.create_store(0) {
        Err(SodaError::Auth { user, status }) => {
            assert_eq!(user, "bucket");
            assert_eq!(status, common::STATUS_AUTH_ERROR);
        }
        Err(other) => panic!("expected auth error, got {:?}", other),
        Ok(_) => panic!("expected auth error, got a store"),
    }
}

#[test]
fn test_factory_connect_refused() {
    let addr = common::closed_addr();
    let target = Target::parse(&format!("memcached://{}", addr)).unwrap();
    let factory = TargetFactory::new(target, Arc::new(config(5)), None);
    assert!(matches!(
        factory.create_store(0),
        Err(SodaError::Connect { .. })
    ));
}

#[test]
fn test_text_client_round_trip() {
    let server = common::start_ascii();
    let stream = TcpStream::connect(server.addr).unwrap();
    let mut client = TextClient::new(stream, &config(8), None);

    for id in 0..20 {
        client.enqueue(op(OpKind::Set, id)).unwrap();
    }
    for id in 0..20 {
        client.enqueue(op(OpKind::Get, id)).unwrap();
    }
    client.enqueue(op(OpKind::Get, -1)).unwrap();
    client.enqueue(op(OpKind::Delete, 0)).unwrap();
    client.enqueue(op(OpKind::Arpa(ArpaVerb::Append), 1)).unwrap();
    client.finish().unwrap();

    assert_eq!(client.num_ops(), 43);
    // only the miss on id -1
    assert_eq!(client.error_responses(), 1);

    let state = server.state.lock();
    assert_eq!(state.items.len(), 19);
    assert_eq!(state.count("append"), 1);
    assert_eq!(
        state.items.get(key_for(1, "").as_bytes()).map(Vec::as_slice),
        Some(&b"doc-1doc-1"[..])
    );
}
