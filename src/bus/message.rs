//! Typed bus messages, replies and wire frames.
//!
//! Every message type implements [`Request`], which names the response
//! type the sender expects and how to extract it from a [`BusReply`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Connection, PeriodicInfo, RoleKind, ServerStatusSnapshot, TemplateId};
use crate::{AppError, Result};

/// A message that can be dispatched over the bus.
pub trait Request: Into<BusMessage> {
    /// Value the dispatch future resolves to.
    type Response;

    /// Convert the master's reply into the typed response.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` when the reply is an error or of an
    /// unexpected variant.
    fn extract(reply: BusReply) -> Result<Self::Response>;
}

/// Child announces itself after start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessSpawned {
    /// Template the child was started from.
    pub template_id: TemplateId,
    /// Worker or periodic.
    pub kind: RoleKind,
    /// Child pid.
    pub pid: u32,
    /// Effective OS user.
    pub user: String,
    /// Template name.
    pub name: String,
    /// Whether the child honours reload.
    pub reloadable: bool,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
}

/// Periodic liveness and memory report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    /// Child pid.
    pub pid: u32,
    /// Resident memory in bytes.
    pub memory: u64,
    /// Monotonic nanoseconds since the child runtime started.
    pub time_ns: u64,
}

/// Child relinquished its supervised resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Detached {
    /// Child pid.
    pub pid: u32,
}

/// Stop acknowledgement sent by a child right before it exits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessExiting {
    /// Child pid.
    pub pid: u32,
    /// Exit code the child is about to return.
    pub exit_code: i32,
}

/// Several messages applied atomically and acknowledged once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Composite {
    /// Messages in application order.
    pub messages: Vec<BusMessage>,
}

/// Bytes received by a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RxIncrement {
    /// Worker pid.
    pub pid: u32,
    /// Byte delta.
    pub bytes: u64,
}

/// Bytes sent by a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxIncrement {
    /// Worker pid.
    pub pid: u32,
    /// Byte delta.
    pub bytes: u64,
}

/// Requests handled by a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestIncrement {
    /// Worker pid.
    pub pid: u32,
    /// Request delta.
    pub requests: u64,
}

/// A worker accepted a client connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionOpened {
    /// The new connection.
    pub connection: Connection,
}

/// A worker closed a client connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionClosed {
    /// Worker pid.
    pub pid: u32,
    /// Worker-local connection id.
    pub connection_id: u64,
}

/// Ask the master to shut down.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopServer {
    /// Exit code for the master.
    #[serde(default)]
    pub code: i32,
}

/// Ask the master to reload reloadable workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReloadServer {}

/// Ask the master for a status snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetServerStatus {}

/// Ask the master for the open connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetConnections {}

/// Ask the master for the periodic task listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetSchedulerStatus {}

/// Every message the bus carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// See [`ProcessSpawned`].
    ProcessSpawned(ProcessSpawned),
    /// See [`Heartbeat`].
    Heartbeat(Heartbeat),
    /// See [`Detached`].
    Detached(Detached),
    /// See [`ProcessExiting`].
    ProcessExiting(ProcessExiting),
    /// See [`Composite`].
    Composite(Composite),
    /// See [`RxIncrement`].
    RxIncrement(RxIncrement),
    /// See [`TxIncrement`].
    TxIncrement(TxIncrement),
    /// See [`RequestIncrement`].
    RequestIncrement(RequestIncrement),
    /// See [`ConnectionOpened`].
    ConnectionOpened(ConnectionOpened),
    /// See [`ConnectionClosed`].
    ConnectionClosed(ConnectionClosed),
    /// See [`StopServer`].
    StopServer(StopServer),
    /// See [`ReloadServer`].
    ReloadServer(ReloadServer),
    /// See [`GetServerStatus`].
    GetServerStatus(GetServerStatus),
    /// See [`GetConnections`].
    GetConnections(GetConnections),
    /// See [`GetSchedulerStatus`].
    GetSchedulerStatus(GetSchedulerStatus),
}

/// Reply sent by the master for exactly one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BusReply {
    /// Message applied.
    Ack,
    /// Status snapshot.
    Status(Box<ServerStatusSnapshot>),
    /// Open connections.
    Connections(Vec<Connection>),
    /// Periodic task listing.
    Scheduler(Vec<PeriodicInfo>),
    /// Master could not handle the request.
    Error(String),
}

/// One line on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Child → master.
    Request {
        /// Correlation id, unique per connection.
        id: u64,
        /// Payload.
        message: BusMessage,
    },
    /// Master → child.
    Reply {
        /// Correlation id of the request being answered.
        id: u64,
        /// Payload.
        reply: BusReply,
    },
}

fn unexpected(reply: BusReply) -> AppError {
    match reply {
        BusReply::Error(msg) => AppError::Transport(msg),
        other => AppError::Transport(format!("unexpected reply: {other:?}")),
    }
}

macro_rules! bus_message {
    ($variant:ident) => {
        impl From<$variant> for BusMessage {
            fn from(message: $variant) -> Self {
                Self::$variant(message)
            }
        }
    };
}

macro_rules! ack_request {
    ($($variant:ident),+ $(,)?) => {
        $(
            bus_message!($variant);

            impl Request for $variant {
                type Response = ();

                fn extract(reply: BusReply) -> Result<()> {
                    match reply {
                        BusReply::Ack => Ok(()),
                        other => Err(unexpected(other)),
                    }
                }
            }
        )+
    };
}

ack_request!(
    ProcessSpawned,
    Heartbeat,
    Detached,
    ProcessExiting,
    Composite,
    RxIncrement,
    TxIncrement,
    RequestIncrement,
    ConnectionOpened,
    ConnectionClosed,
    StopServer,
    ReloadServer,
);

bus_message!(GetServerStatus);
bus_message!(GetConnections);
bus_message!(GetSchedulerStatus);

impl Request for GetServerStatus {
    type Response = ServerStatusSnapshot;

    fn extract(reply: BusReply) -> Result<Self::Response> {
        match reply {
            BusReply::Status(snapshot) => Ok(*snapshot),
            other => Err(unexpected(other)),
        }
    }
}

impl Request for GetConnections {
    type Response = Vec<Connection>;

    fn extract(reply: BusReply) -> Result<Self::Response> {
        match reply {
            BusReply::Connections(connections) => Ok(connections),
            other => Err(unexpected(other)),
        }
    }
}

impl Request for GetSchedulerStatus {
    type Response = Vec<PeriodicInfo>;

    fn extract(reply: BusReply) -> Result<Self::Response> {
        match reply {
            BusReply::Scheduler(tasks) => Ok(tasks),
            other => Err(unexpected(other)),
        }
    }
}
