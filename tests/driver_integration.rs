//! End-to-end driver tests against an in-process server speaking OP_MSG.
//!
//! The server answers `hello` as a standalone and serves `aggregate` from a
//! fixed batch, so a translated query travels through framing, TCP,
//! topology discovery and server selection before being materialized.

use std::sync::Arc;
use std::time::Duration;

use lodestar::bson::binary::{ReaderSettings, WriterSettings};
use lodestar::bson::serialization::{ClassMapBuilder, ConventionPack, MemberMapBuilder, NativeValue, TypeRef};
use lodestar::driver::{CancellationSignal, Message, ServerAddress, ServerType, TcpTransport, TopologyType};
use lodestar::linq::QueryOutput;
use lodestar::prelude::*;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn respond(request: &Document) -> Document {
    let command = request.keys().next().map(String::as_str).unwrap_or("");
    match command {
        "hello" => doc! { "ok" => 1, "isWritablePrimary" => true, "maxWireVersion" => 21 },
        "aggregate" => {
            let batch = array![doc! { "_v" => 2 }];
            doc! {
                "ok" => 1,
                "cursor" => doc! { "id" => 0i64, "ns" => "app.people", "firstBatch" => batch },
            }
        }
        other => doc! {
            "ok" => 0,
            "code" => 59,
            "codeName" => "CommandNotFound",
            "errmsg" => format!("no such command: '{other}'"),
        },
    }
}

async fn serve_connection(mut socket: TcpStream) {
    loop {
        let mut prefix = [0u8; 4];
        if socket.read_exact(&mut prefix).await.is_err() {
            return;
        }
        let length = i32::from_le_bytes(prefix) as usize;
        let mut frame = vec![0u8; length];
        frame[..4].copy_from_slice(&prefix);
        if socket.read_exact(&mut frame[4..]).await.is_err() {
            return;
        }
        let request = Message::decode(&frame, &ReaderSettings::default()).unwrap();
        let reply = request.reply(respond(&request.body)).encode(&WriterSettings::default()).unwrap();
        if socket.write_all(&reply).await.is_err() {
            return;
        }
    }
}

async fn start_server() -> ServerAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_connection(socket));
        }
    });
    ServerAddress::new("127.0.0.1", port)
}

async fn connect(address: ServerAddress) -> Cluster {
    let settings = ClusterSettings {
        seeds: vec![address],
        server_selection_timeout: Duration::from_secs(2),
        ..ClusterSettings::default()
    };
    let cluster = Cluster::new(settings, Arc::new(TcpTransport::new(Duration::from_secs(2)))).unwrap();
    let topology = cluster.heartbeat().await;
    assert_eq!(topology.topology_type(), TopologyType::Single);
    cluster
}

#[tokio::test]
async fn test_discovers_standalone_over_tcp() {
    let address = start_server().await;
    let cluster = connect(address.clone()).await;
    let server = cluster
        .select_server(&ServerSelector::Write, &CancellationSignal::new())
        .await
        .unwrap();
    assert_eq!(server.address, address);
    assert_eq!(server.server_type, ServerType::Standalone);
    assert_eq!(server.max_wire_version, 21);
    assert!(server.round_trip_time.is_some());
}

#[tokio::test]
async fn test_translated_count_round_trip() {
    let registry = SerializerRegistry::new();
    registry
        .register_class_map(
            ClassMapBuilder::new("Person")
                .member(MemberMapBuilder::new("Age", TypeRef::Int32))
                .freeze(&ConventionPack::new())
                .unwrap(),
        )
        .unwrap();
    let p = Parameter::new("p", TypeRef::class("Person"));
    let query = Queryable::new(&registry, "people", TypeRef::class("Person"))
        .count_where(Expr::lambda([p.clone()], p.expr().member("Age").gte(Expr::constant(18))))
        .unwrap();

    let cluster = connect(start_server().await).await;
    let reply = cluster
        .run_command(&ServerSelector::Write, "app", query.to_command(), &CancellationSignal::new())
        .await
        .unwrap();
    let batch: Vec<Document> = reply
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap()
        .iter()
        .filter_map(|item| item.as_document().cloned())
        .collect();
    let output = query.materialize(&registry, &batch).unwrap();
    assert_eq!(output, QueryOutput::Scalar(NativeValue::Int64(2)));
}

#[tokio::test]
async fn test_command_error_surfaces() {
    let cluster = connect(start_server().await).await;
    let err = cluster
        .run_command(&ServerSelector::Write, "app", doc! { "frobnicate" => 1 }, &CancellationSignal::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DriverError::Command {
            code: 59,
            code_name: "CommandNotFound".to_string(),
            message: "no such command: 'frobnicate'".to_string(),
        }
    );
}

#[tokio::test]
async fn test_unreachable_server_times_out_selection() {
    // Bind then drop so the port is very likely closed.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let settings = ClusterSettings {
        seeds: vec![ServerAddress::new("127.0.0.1", port)],
        server_selection_timeout: Duration::from_millis(100),
        ..ClusterSettings::default()
    };
    let cluster = Cluster::new(settings, Arc::new(TcpTransport::new(Duration::from_millis(200)))).unwrap();
    let description = cluster.heartbeat().await;
    assert!(!description.has_known_servers());
    let err = cluster
        .select_server(&ServerSelector::Write, &CancellationSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::ServerSelection(_)));
}
