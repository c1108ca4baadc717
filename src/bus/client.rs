//! Child side of the message bus.
//!
//! [`BusClient::dispatch`] enqueues a message synchronously and returns a
//! [`Pending`] future for the typed reply. Dropping the future makes the
//! dispatch fire-and-forget; the message is still delivered. A writer
//! task owns the send half and a reader task resolves replies by
//! correlation id. When the connection fails every outstanding request
//! fails with `AppError::Transport`.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use interprocess::local_socket::{tokio::prelude::*, GenericFilePath};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use super::codec::{decode_frame, encode_frame, BusCodec};
use super::message::{BusMessage, BusReply, Frame, Request};
use crate::{AppError, Result};

type ReplySlot = oneshot::Sender<Result<BusReply>>;

/// Outstanding requests, keyed by correlation id.
#[derive(Default)]
struct PendingReplies {
    closed: bool,
    waiting: HashMap<u64, ReplySlot>,
}

type SharedPending = Arc<Mutex<PendingReplies>>;

enum Outgoing {
    Frame {
        id: u64,
        message: BusMessage,
        reply: ReplySlot,
    },
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle to a child's bus connection.
#[derive(Debug, Clone)]
pub struct BusClient {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    next_id: Arc<AtomicU64>,
}

impl BusClient {
    /// Connect to the master's bus socket.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the socket is unreachable.
    pub async fn connect(path: &Path) -> Result<Self> {
        let name = path.to_fs_name::<GenericFilePath>().map_err(|err| {
            AppError::Transport(format!("invalid bus socket path '{}': {err}", path.display()))
        })?;
        let stream = interprocess::local_socket::tokio::Stream::connect(name)
            .await
            .map_err(|err| {
                AppError::Transport(format!("cannot reach bus at '{}': {err}", path.display()))
            })?;
        let (reader, writer) = stream.split();
        Ok(Self::from_parts(reader, writer))
    }

    /// Build a client over an arbitrary duplex transport.
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: SharedPending = Arc::default();
        let drained = Arc::new(Notify::new());

        tokio::spawn(write_frames(
            writer,
            rx,
            Arc::clone(&pending),
            Arc::clone(&drained),
        ));
        tokio::spawn(read_replies(reader, pending, drained));

        Self {
            outgoing: tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Enqueue a message; the returned future resolves to the typed reply.
    ///
    /// Messages are written in the order `dispatch` is called.
    pub fn dispatch<R: Request>(&self, request: R) -> Pending<R> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        // A closed writer drops the slot, which resolves the future with
        // a transport error.
        let _ = self.outgoing.send(Outgoing::Frame {
            id,
            message: request.into(),
            reply,
        });
        Pending {
            rx,
            _request: PhantomData,
        }
    }

    /// Wait until every enqueued message has been written and answered.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` when the deadline elapses or the
    /// connection is already gone.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.outgoing
            .send(Outgoing::Flush(tx))
            .map_err(|_| AppError::Transport("bus connection already closed".into()))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(AppError::Transport("bus connection closed during flush".into())),
            Err(_) => Err(AppError::Transport(format!(
                "bus flush did not complete within {}",
                humantime::format_duration(timeout)
            ))),
        }
    }
}

/// Future for a dispatched request's typed response.
#[must_use = "dropping a Pending makes the dispatch fire-and-forget"]
pub struct Pending<R: Request> {
    rx: oneshot::Receiver<Result<BusReply>>,
    _request: PhantomData<fn() -> R>,
}

impl<R: Request> Future for Pending<R> {
    type Output = Result<R::Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(reply))) => Poll::Ready(R::extract(reply)),
            Poll::Ready(Ok(Err(err))) => Poll::Ready(Err(err)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(AppError::Transport(
                "bus connection closed before reply".into(),
            ))),
        }
    }
}

async fn write_frames<W>(
    writer: W,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    pending: SharedPending,
    drained: Arc<Notify>,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, BusCodec::new());

    while let Some(item) = rx.recv().await {
        match item {
            Outgoing::Frame { id, message, reply } => {
                let line = match encode_frame(&Frame::Request { id, message }) {
                    Ok(line) => line,
                    Err(err) => {
                        let _ = reply.send(Err(err));
                        continue;
                    }
                };
                {
                    let mut guard = pending.lock().await;
                    if guard.closed {
                        let _ = reply.send(Err(AppError::Transport(
                            "bus connection closed".into(),
                        )));
                        continue;
                    }
                    guard.waiting.insert(id, reply);
                }
                if let Err(err) = sink.send(line).await {
                    warn!(%err, "bus write failed");
                    fail_all(&pending, &drained, &err.to_string()).await;
                    break;
                }
            }
            Outgoing::Flush(done) => {
                loop {
                    if pending.lock().await.waiting.is_empty() {
                        break;
                    }
                    drained.notified().await;
                }
                let _ = done.send(());
            }
        }
    }
    debug!("bus writer finished");
}

async fn read_replies<R>(reader: R, pending: SharedPending, drained: Arc<Notify>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, BusCodec::new());

    let reason = loop {
        match frames.next().await {
            None => break "bus connection closed by master".to_owned(),
            Some(Err(err)) => break err.to_string(),
            Some(Ok(line)) => match decode_frame(&line) {
                Ok(Frame::Reply { id, reply }) => {
                    let mut guard = pending.lock().await;
                    if let Some(slot) = guard.waiting.remove(&id) {
                        let _ = slot.send(Ok(reply));
                    }
                    if guard.waiting.is_empty() {
                        drained.notify_one();
                    }
                }
                Ok(Frame::Request { id, .. }) => {
                    debug!(id, "ignoring request frame sent by the master");
                }
                Err(err) => warn!(%err, "dropping malformed bus reply"),
            },
        }
    };

    fail_all(&pending, &drained, &reason).await;
}

/// Fail every outstanding request and refuse new ones.
async fn fail_all(pending: &SharedPending, drained: &Notify, reason: &str) {
    let mut guard = pending.lock().await;
    guard.closed = true;
    for (_, slot) in guard.waiting.drain() {
        let _ = slot.send(Err(AppError::Transport(reason.to_owned())));
    }
    drained.notify_one();
}
