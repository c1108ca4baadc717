//! Master side of the message bus.
//!
//! Listens on a filesystem Unix socket using the `interprocess` crate.
//! Every child holds one connection. Requests on a connection are
//! forwarded to the master loop one at a time, so messages from a single
//! child are applied in the order they were sent.

use std::path::Path;

use futures_util::{SinkExt, StreamExt};
use interprocess::local_socket::{tokio::prelude::*, GenericFilePath, ListenerOptions};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::{decode_frame, encode_frame, BusCodec};
use super::message::{BusMessage, BusReply, Frame};
use crate::{AppError, Result};

/// A request forwarded to the master loop together with its reply slot.
#[derive(Debug)]
pub struct BusEnvelope {
    /// The child's message.
    pub message: BusMessage,
    /// Where the master sends its reply.
    pub reply: oneshot::Sender<BusReply>,
}

/// Spawn the bus listener task.
///
/// A stale socket file left by a previous master is removed first.
///
/// # Errors
///
/// Returns `AppError::Transport` if the listener cannot be created.
pub fn spawn_bus_server(
    path: &Path,
    events: mpsc::UnboundedSender<BusEnvelope>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }

    let listener_name = path
        .to_fs_name::<GenericFilePath>()
        .map_err(|err| {
            AppError::Transport(format!("invalid bus socket path '{}': {err}", path.display()))
        })?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Transport(format!("failed to create bus listener: {err}")))?;

    info!(socket = %path.display(), "bus listening");
    let socket_path = path.display().to_string();

    let handle = tokio::spawn(async move {
        let span = info_span!("bus_server", socket = %socket_path);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("bus shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(stream, events.clone(), ct.clone()));
                            }
                            Err(err) => {
                                warn!(%err, "bus accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Serve one child connection until EOF, error or cancellation.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    events: mpsc::UnboundedSender<BusEnvelope>,
    ct: CancellationToken,
) {
    let span = info_span!("bus_conn");
    async move {
        let (reader, writer) = stream.split();
        let mut frames = FramedRead::new(reader, BusCodec::new());
        let mut sink = FramedWrite::new(writer, BusCodec::new());

        loop {
            let next = tokio::select! {
                () = ct.cancelled() => break,
                next = frames.next() => next,
            };

            let line = match next {
                None => break,
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    warn!(%err, "bus read error");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let (id, message) = match decode_frame(&line) {
                Ok(Frame::Request { id, message }) => (id, message),
                Ok(Frame::Reply { id, .. }) => {
                    debug!(id, "ignoring reply frame sent by a child");
                    continue;
                }
                Err(err) => {
                    warn!(%err, "dropping malformed bus frame");
                    continue;
                }
            };

            let reply = forward(&events, message).await;
            let encoded = match encode_frame(&Frame::Reply { id, reply }) {
                Ok(encoded) => encoded,
                Err(err) => {
                    warn!(%err, id, "failed to encode bus reply");
                    continue;
                }
            };
            if let Err(err) = sink.send(encoded).await {
                warn!(%err, "failed to write bus reply");
                break;
            }
        }

        debug!("bus connection closed");
    }
    .instrument(span)
    .await;
}

/// Hand a message to the master loop and wait for its verdict.
async fn forward(events: &mpsc::UnboundedSender<BusEnvelope>, message: BusMessage) -> BusReply {
    let (tx, rx) = oneshot::channel();
    if events.send(BusEnvelope { message, reply: tx }).is_err() {
        return BusReply::Error("master is shutting down".into());
    }
    rx.await
        .unwrap_or_else(|_| BusReply::Error("master dropped the request".into()))
}
