//! Integration tests for the message bus over a real socket and over an
//! in-memory transport.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use prochive::bus::message::{GetConnections, Heartbeat, RxIncrement, StopServer};
use prochive::bus::{spawn_bus_server, BusClient, BusEnvelope, BusMessage, BusReply};
use prochive::AppError;

/// Master stand-in: records messages and answers with `reply_for`.
fn serve(
    mut rx: mpsc::UnboundedReceiver<BusEnvelope>,
    reply_for: fn(&BusMessage) -> BusReply,
) -> tokio::task::JoinHandle<Vec<BusMessage>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(envelope) = rx.recv().await {
            let _ = envelope.reply.send(reply_for(&envelope.message));
            seen.push(envelope.message);
        }
        seen
    })
}

fn standard_reply(message: &BusMessage) -> BusReply {
    match message {
        BusMessage::GetConnections(_) => BusReply::Connections(Vec::new()),
        BusMessage::StopServer(_) => BusReply::Error("master is shutting down".into()),
        _ => BusReply::Ack,
    }
}

#[tokio::test]
async fn requests_round_trip_through_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("bus.sock");
    let (tx, rx) = mpsc::unbounded_channel();
    let ct = CancellationToken::new();
    let server = spawn_bus_server(&socket, tx, ct.clone()).expect("listener");
    let master = serve(rx, standard_reply);

    let client = BusClient::connect(&socket).await.expect("connect");
    client
        .dispatch(Heartbeat {
            pid: 1,
            memory: 2,
            time_ns: 3,
        })
        .await
        .expect("heartbeat acknowledged");
    let connections = client.dispatch(GetConnections {}).await.unwrap();
    assert!(connections.is_empty());

    let refused = client.dispatch(StopServer { code: 0 }).await;
    assert!(matches!(refused, Err(AppError::Transport(_))));

    client.stop(Duration::from_secs(2)).await.expect("flush");
    drop(client);
    ct.cancel();
    server.await.unwrap();
    let seen = tokio::time::timeout(Duration::from_secs(5), master)
        .await
        .expect("master stand-in finishes")
        .unwrap();
    assert_eq!(seen.len(), 3);
}

/// Messages from one client reach the master in dispatch order even when
/// the sender does not wait for each reply.
#[tokio::test]
async fn messages_keep_dispatch_order() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("bus.sock");
    let (tx, rx) = mpsc::unbounded_channel();
    let ct = CancellationToken::new();
    spawn_bus_server(&socket, tx, ct.clone()).unwrap();
    let master = serve(rx, standard_reply);

    let client = BusClient::connect(&socket).await.unwrap();
    let pending: Vec<_> = (1..=20)
        .map(|bytes| client.dispatch(RxIncrement { pid: 5, bytes }))
        .collect();
    for reply in pending {
        reply.await.unwrap();
    }

    ct.cancel();
    drop(client);
    let seen = tokio::time::timeout(Duration::from_secs(5), master)
        .await
        .unwrap()
        .unwrap();
    let order: Vec<u64> = seen
        .iter()
        .filter_map(|m| match m {
            BusMessage::RxIncrement(inc) => Some(inc.bytes),
            _ => None,
        })
        .collect();
    assert_eq!(order, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("bus.sock");
    std::fs::write(&socket, b"left over").unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let ct = CancellationToken::new();
    spawn_bus_server(&socket, tx, ct.clone()).expect("stale file removed");
    let _master = serve(rx, standard_reply);

    let client = BusClient::connect(&socket).await.unwrap();
    client.dispatch(StopServer { code: 1 }).await.unwrap_err();
    ct.cancel();
}

#[tokio::test]
async fn unreachable_socket_is_a_transport_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = BusClient::connect(&dir.path().join("missing.sock"))
        .await
        .expect_err("nobody listens");
    assert!(matches!(err, AppError::Transport(_)));
}

/// Losing the connection fails every outstanding request.
#[tokio::test]
async fn transport_failure_fails_pending_requests() {
    let (client_io, master_io) = tokio::io::duplex(1024);
    let (reader, writer) = tokio::io::split(client_io);
    let client = BusClient::from_parts(reader, writer);

    let first = client.dispatch(Heartbeat {
        pid: 1,
        memory: 0,
        time_ns: 0,
    });
    let second = client.dispatch(GetConnections {});
    drop(master_io);

    let first = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .expect("first request resolves");
    let second = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .expect("second request resolves");
    assert!(matches!(first, Err(AppError::Transport(_))));
    assert!(matches!(second, Err(AppError::Transport(_))));

    let later = tokio::time::timeout(
        Duration::from_secs(5),
        client.dispatch(Heartbeat {
            pid: 1,
            memory: 0,
            time_ns: 0,
        }),
    )
    .await
    .expect("request after failure resolves");
    assert!(matches!(later, Err(AppError::Transport(_))));
}

#[tokio::test]
async fn flush_gives_up_after_timeout() {
    let (client_io, _silent_master) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(client_io);
    let client = BusClient::from_parts(reader, writer);

    drop(client.dispatch(Heartbeat {
        pid: 1,
        memory: 0,
        time_ns: 0,
    }));
    let err = client
        .stop(Duration::from_millis(100))
        .await
        .expect_err("no reply ever arrives");
    assert!(matches!(err, AppError::Transport(_)));
}
