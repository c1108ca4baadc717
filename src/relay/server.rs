//! Master side of the relay.

use std::path::Path;

use futures_util::{SinkExt, StreamExt};
use nix::sys::stat::Mode;
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{RelayFrame, RelayRequest, RelayResponse};
use crate::bus::codec::BusCodec;
use crate::{AppError, Result};

/// A relay request forwarded to the master loop.
#[derive(Debug)]
pub struct RelayEnvelope {
    /// The query.
    pub request: RelayRequest,
    /// Where the master sends its answer.
    pub reply: oneshot::Sender<RelayResponse>,
}

/// Create a FIFO with mode 0644, replacing any leftover file.
///
/// # Errors
///
/// Returns `AppError::Io` when the FIFO cannot be created.
pub fn create_fifo(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    nix::unistd::mkfifo(
        path,
        Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
    )
    .map_err(|err| AppError::Io(format!("cannot create fifo '{}': {err}", path.display())))
}

/// Open both FIFOs and spawn the task answering relay requests.
///
/// Both ends are opened read-write so the open never blocks and the
/// reader never sees EOF when a client disconnects.
///
/// # Errors
///
/// Returns `AppError::Io` when a FIFO cannot be opened.
pub fn spawn_relay(
    rx_fifo: &Path,
    tx_fifo: &Path,
    requests: mpsc::UnboundedSender<RelayEnvelope>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let receiver = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(rx_fifo)
        .map_err(|err| AppError::Io(format!("cannot open '{}': {err}", rx_fifo.display())))?;
    let sender = pipe::OpenOptions::new()
        .read_write(true)
        .open_sender(tx_fifo)
        .map_err(|err| AppError::Io(format!("cannot open '{}': {err}", tx_fifo.display())))?;

    info!(rx = %rx_fifo.display(), tx = %tx_fifo.display(), "relay listening");

    let handle = tokio::spawn(
        async move {
            let mut lines = FramedRead::new(receiver, BusCodec::new());
            let mut sink = FramedWrite::new(sender, BusCodec::new());

            loop {
                let next = tokio::select! {
                    () = ct.cancelled() => break,
                    next = lines.next() => next,
                };
                let line = match next {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(err)) => {
                        warn!(%err, "relay read error");
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let frame: RelayFrame<RelayRequest> = match serde_json::from_str(line.trim()) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(%err, "dropping malformed relay request");
                        continue;
                    }
                };

                let (tx, rx) = oneshot::channel();
                if requests
                    .send(RelayEnvelope {
                        request: frame.body,
                        reply: tx,
                    })
                    .is_err()
                {
                    break;
                }
                let Ok(body) = rx.await else {
                    debug!("master dropped relay request");
                    continue;
                };

                let encoded = match serde_json::to_string(&RelayFrame { id: frame.id, body }) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        warn!(%err, "failed to encode relay response");
                        continue;
                    }
                };
                if let Err(err) = sink.send(encoded).await {
                    warn!(%err, "failed to write relay response");
                }
            }
            debug!("relay stopped");
        }
        .instrument(info_span!("relay")),
    );

    Ok(handle)
}
