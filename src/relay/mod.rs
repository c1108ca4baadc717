//! Synchronous query channel for out-of-process control clients.
//!
//! Two FIFOs next to the PID file: `rx` carries requests to the master,
//! `tx` carries responses back. Each line is a JSON [`RelayFrame`]; the
//! frame id lets a client skip a stale answer left behind by a client
//! that gave up waiting.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};

use crate::models::{Connection, PeriodicInfo, ServerStatusSnapshot};

pub use client::{
    ConnectionsQuery, QueryOutcome, RelayClient, RelayQuery, SchedulerQuery, StatusQuery,
};
pub use server::{create_fifo, spawn_relay, RelayEnvelope};

/// Queries the master answers over the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayRequest {
    /// Full status snapshot.
    Status,
    /// Open connections.
    Connections,
    /// Periodic task listing.
    Scheduler,
}

/// Answers sent back over the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RelayResponse {
    /// Answer to [`RelayRequest::Status`].
    Status(Box<ServerStatusSnapshot>),
    /// Answer to [`RelayRequest::Connections`].
    Connections(Vec<Connection>),
    /// Answer to [`RelayRequest::Scheduler`].
    Scheduler(Vec<PeriodicInfo>),
}

/// One relay line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFrame<T> {
    /// Correlation id chosen by the client.
    pub id: u64,
    /// Payload.
    pub body: T,
}
