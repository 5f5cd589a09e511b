//! # Shared protocol library
//!
//! Everything both ends of a connection agree on: the binary message format,
//! stream reassembly, identifier allocation, latency tracking, the entity
//! replication codec and the session vocabulary.
//!
//! ## Module Organization
//!
//! - `message`: tagged, length-prefixed messages with big-endian typed fields
//! - `tags`: the registry of message tags
//! - `reassembler`: turns raw socket reads into complete messages
//! - `id_pool`: recycling allocator for entity and player ids
//! - `latency`: PING/PONG bookkeeping and rolling round-trip statistics
//! - `codec`: precision-tiered entity encoding and receive-side smoothing
//! - `session`: session states, disconnect reasons and control messages
//! - `world`: the world store interface and an in-memory implementation
//!
//! ## Wire Format
//!
//! Every message starts with a 4-byte tag and a 4-byte total length (header
//! included), both big-endian, followed by the payload. Payload fields are
//! big-endian as well; strings are zero-terminated.

pub mod codec;
pub mod id_pool;
pub mod latency;
pub mod message;
pub mod reassembler;
pub mod session;
pub mod tags;
pub mod world;

pub use codec::{AutoThresholds, Direction, Precision, SmoothingConfig, Smoother};
pub use id_pool::{IdPool, IdPoolError};
pub use latency::PingTracker;
pub use message::{DecodeError, Message, HEADER_SIZE};
pub use reassembler::{FrameReassembler, DEFAULT_MAX_MESSAGE_SIZE};
pub use session::{LoginRequest, SessionError, SessionState};
pub use tags::Tag;
pub use world::{EntityInit, EntityState, MemoryWorld, PlayerRecord, Properties, WorldStore};

/// Port used by the demo binaries when none is given.
pub const DEFAULT_PORT: u16 = 7777;

/// How long a dropped player's identity is held for a resync.
pub const DEFAULT_GRACE_SECS: u64 = 10;
