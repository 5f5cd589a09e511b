//! # Replication Server Library
//!
//! The server half of the replication protocol. It accepts TCP connections,
//! runs the login and resync handshakes, and keeps every synchronized client
//! up to date with the world store the application owns.
//!
//! ## Core Responsibilities
//!
//! ### Connection Pumping
//! Every connection gets an inbound and an outbound task. The tick thread
//! never blocks on a socket: it drains reassembled messages from one queue
//! and pushes outgoing messages onto the other.
//!
//! ### Session Handling
//! LOGIN assigns a player id and sends a full snapshot (globals, players,
//! entities). A dropped player keeps its identity for a grace window so a
//! RESYNC from a new connection can reclaim it without the other clients
//! ever seeing the player leave.
//!
//! ### State Broadcasting
//! Each tick the server announces entities that appeared or vanished and
//! sends UPDATE messages to clients that are due one. A client's update
//! interval stretches with its average ping, up to four times the base.
//!
//! ## Module Organization
//!
//! - `connection`: per-socket pump with its I/O tasks and counters
//! - `client_manager`: live and drop-pending connections, player id pool
//! - `session`: handlers for client messages
//! - `hooks`: callbacks for game-specific behaviour
//! - `network`: listener, tick driver and fan-out helpers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::hooks::NoHooks;
//! use server::network::{Server, ServerConfig};
//! use shared::MemoryWorld;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     let mut world = MemoryWorld::new();
//!
//!     // Ticks every 20ms until Ctrl+C, then asks clients to reconnect later
//!     server.run(&mut world, &mut NoHooks, Duration::from_millis(20)).await
//! }
//! ```
//!
//! ## Locking
//!
//! The registry sits behind one async mutex shared with the accept task.
//! The world store is only ever borrowed by the tick thread, and always
//! after the registry lock has been taken.

pub mod client_manager;
pub mod connection;
pub mod hooks;
pub mod network;
pub mod session;

pub use client_manager::ClientManager;
pub use connection::{ConnectionHandle, ConnectionId, ConnectionPump, ConnectionStats, PumpConfig};
pub use hooks::{NoHooks, ServerHooks};
pub use network::{Server, ServerConfig};
