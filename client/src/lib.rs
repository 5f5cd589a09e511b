//! # Replication Client Library
//!
//! Client half of the replication protocol. A [`ClientLink`] owns the TCP
//! connection to the server, and a [`ClientSession`] applies what arrives on
//! it to a local [`shared::WorldStore`].
//!
//! ## Module Organization
//!
//! ### Link Module (`link`)
//! Connection management:
//! - LOGIN on connect, RESYNC on reconnect when the player id is known
//! - PING/PONG latency tracking and stall detection
//! - Jittered exponential reconnection with an attempt limit
//!
//! ### Session Module (`session`)
//! Protocol state on top of the link:
//! - Snapshot handling (INFO, PLAYER_LIST, OBJECTS_CLEAR, OBJECTS_ADD)
//! - UPDATE decoding with smoothing of remote entities
//! - Resync requests when the local world falls out of step
//! - Sending updates for entities this client owns
//!
//! ### Hooks Module (`hooks`)
//! Callbacks for game code: login, player joins and leaves, and messages
//! with game-defined tags.
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::{ClientLink, ClientSession, LinkConfig, NoHooks};
//! use shared::{MemoryWorld, SmoothingConfig};
//!
//! # async fn run() -> Result<(), client::LinkError> {
//! let mut link = ClientLink::new(LinkConfig::default());
//! let mut session = ClientSession::new(MemoryWorld::new(), SmoothingConfig::default());
//! link.connect("127.0.0.1", 7777, "alice", "").await?;
//!
//! loop {
//!     link.maintain().await;
//!     session.process(&mut link, &mut NoHooks).await;
//!     session.send_owned_updates(&mut link).await?;
//!     tokio::time::sleep(std::time::Duration::from_millis(20)).await;
//! }
//! # }
//! ```

pub mod hooks;
pub mod link;
pub mod session;

pub use hooks::{ClientHooks, NoHooks};
pub use link::{ClientLink, LinkConfig, LinkError, LinkEvent, ReconnectSchedule};
pub use session::ClientSession;
