//! Blocking relay client used by `prochive-ctl`.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, Flock, FlockArg, OFlag};

use super::{RelayFrame, RelayRequest, RelayResponse};
use crate::master::paths::RunPaths;
use crate::master::pidfile::running_master;
use crate::models::{Connection, PeriodicInfo, ServerStatusSnapshot};
use crate::{AppError, Result};

/// Result of a relay query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome<T> {
    /// The master answered.
    Answered(T),
    /// No live master, or its FIFOs are missing.
    NotRunning,
}

/// A typed relay query.
pub trait RelayQuery {
    /// Decoded answer.
    type Response;

    /// Wire request.
    fn request() -> RelayRequest;

    /// Decode the master's answer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` for an answer of the wrong kind.
    fn extract(response: RelayResponse) -> Result<Self::Response>;
}

/// Status snapshot query.
#[derive(Debug, Clone, Copy)]
pub struct StatusQuery;

impl RelayQuery for StatusQuery {
    type Response = ServerStatusSnapshot;

    fn request() -> RelayRequest {
        RelayRequest::Status
    }

    fn extract(response: RelayResponse) -> Result<Self::Response> {
        match response {
            RelayResponse::Status(snapshot) => Ok(*snapshot),
            other => Err(mismatch(&other)),
        }
    }
}

/// Open connections query.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionsQuery;

impl RelayQuery for ConnectionsQuery {
    type Response = Vec<Connection>;

    fn request() -> RelayRequest {
        RelayRequest::Connections
    }

    fn extract(response: RelayResponse) -> Result<Self::Response> {
        match response {
            RelayResponse::Connections(connections) => Ok(connections),
            other => Err(mismatch(&other)),
        }
    }
}

/// Periodic task listing query.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerQuery;

impl RelayQuery for SchedulerQuery {
    type Response = Vec<PeriodicInfo>;

    fn request() -> RelayRequest {
        RelayRequest::Scheduler
    }

    fn extract(response: RelayResponse) -> Result<Self::Response> {
        match response {
            RelayResponse::Scheduler(tasks) => Ok(tasks),
            other => Err(mismatch(&other)),
        }
    }
}

fn mismatch(response: &RelayResponse) -> AppError {
    AppError::Transport(format!("unexpected relay answer: {response:?}"))
}

/// Sends one query at a time to the master of `paths`.
///
/// Concurrent clients take turns: each holds an exclusive lock on the
/// request FIFO until its answer arrives or it gives up.
#[derive(Debug, Clone)]
pub struct RelayClient {
    paths: RunPaths,
    timeout: Duration,
}

impl RelayClient {
    /// Client waiting at most `timeout` for each answer.
    #[must_use]
    pub fn new(paths: RunPaths, timeout: Duration) -> Self {
        Self { paths, timeout }
    }

    /// Ask the master and wait for the typed answer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` when the relay stays busy or no answer
    /// arrives within the timeout, or the answer cannot be decoded, and
    /// `AppError::Io` when a FIFO cannot be opened.
    pub fn query<Q: RelayQuery>(&self) -> Result<QueryOutcome<Q::Response>> {
        if running_master(&self.paths.pid_file).is_none()
            || !self.paths.rx_fifo.exists()
            || !self.paths.tx_fifo.exists()
        {
            return Ok(QueryOutcome::NotRunning);
        }

        // Read-write opens never block on a FIFO without a peer.
        let deadline = Instant::now() + self.timeout;
        let requests = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.paths.rx_fifo)?;
        let mut requests = lock_until(requests, deadline)?;
        let answers = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.paths.tx_fifo)?;
        set_nonblocking(&answers)?;
        // Answers nobody waited for would fill the pipe and stall the relay.
        discard_pending(&answers)?;

        let id = correlation_id();
        let mut line = serde_json::to_string(&RelayFrame {
            id,
            body: Q::request(),
        })?;
        line.push('\n');
        requests.write_all(line.as_bytes())?;
        requests.flush()?;

        match await_answer(&answers, id, deadline)? {
            Some(response) => Q::extract(response).map(QueryOutcome::Answered),
            None => Err(AppError::Transport(format!(
                "master did not answer within {}",
                humantime::format_duration(self.timeout)
            ))),
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Take the exclusive client lock on `file`, polling until `deadline`.
fn lock_until(mut file: File, deadline: Instant) -> Result<Flock<File>> {
    loop {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => return Ok(locked),
            Err((returned, Errno::EWOULDBLOCK)) if Instant::now() < deadline => {
                file = returned;
                std::thread::sleep(POLL_INTERVAL);
            }
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(AppError::Transport("relay is busy with another client".into()));
            }
            Err((_, errno)) => return Err(errno.into()),
        }
    }
}

fn set_nonblocking(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Read and drop whatever is queued in the non-blocking `file`.
fn discard_pending(mut file: &File) -> Result<()> {
    let mut buf = [0_u8; 4096];
    loop {
        match file.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}

/// Read lines from the non-blocking `file` until the frame tagged `id`
/// arrives; `None` once `deadline` passes.
fn await_answer(mut file: &File, id: u64, deadline: Instant) -> Result<Option<RelayResponse>> {
    let mut buf = [0_u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match file.read(&mut buf) {
            Ok(read) if read > 0 => {
                pending.extend_from_slice(&buf[..read]);
                while let Some(end) = pending.iter().position(|byte| *byte == b'\n') {
                    let line: Vec<u8> = pending.drain(..=end).collect();
                    // Lines for other ids are leftovers of earlier clients.
                    if let Ok(frame) = serde_json::from_slice::<RelayFrame<RelayResponse>>(&line) {
                        if frame.id == id {
                            return Ok(Some(frame.body));
                        }
                    }
                }
                continue;
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => return Err(err.into()),
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn correlation_id() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.subsec_nanos());
    (u64::from(std::process::id()) << 32) | u64::from(nanos)
}
