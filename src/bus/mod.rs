//! Request/reply message bus between children and the master.
//!
//! Transport is a filesystem Unix socket carrying newline-delimited JSON
//! [`message::Frame`]s. Children dispatch typed messages through
//! [`client::BusClient`]; the master receives them as
//! [`server::BusEnvelope`]s and answers each exactly once.

pub mod client;
pub mod codec;
pub mod message;
pub mod server;

pub use client::{BusClient, Pending};
pub use message::{BusMessage, BusReply, Request};
pub use server::{spawn_bus_server, BusEnvelope};

/// Environment variable carrying the bus socket path to re-executed children.
pub const SOCKET_ENV: &str = "PROCHIVE_SOCKET";
