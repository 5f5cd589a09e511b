//! Session vocabulary shared by both ends: states, disconnect reasons,
//! version matching and builders for the fixed-layout control messages.

use crate::message::{DecodeError, Message};
use crate::tags;
use crate::world::{EntityInit, PlayerRecord, Properties, WorldStore};
use log::warn;
use thiserror::Error;

pub const REASON_PACKET_SIZE: &str = "packet size error";
pub const REASON_BAD_GAME: &str = "wrong game";
pub const REASON_BAD_VERSION: &str = "incompatible version";
pub const REASON_LOGIN_FAILED: &str = "login failed";
pub const REASON_SERVER_FULL: &str = "server full";
pub const REASON_LOGIN_TIMEOUT: &str = "login timeout";
pub const REASON_INVALID_PEER: &str = "unexpected message";
pub const REASON_REPLACED: &str = "replaced by a newer connection";
pub const REASON_RESYNC_FAILED: &str = "resync failed";
pub const REASON_PING_TIMEOUT: &str = "ping timeout";
pub const REASON_SHUTDOWN: &str = "server shutting down";

/// Session progress of a connection. Values 3 and above are left to the
/// embedding game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    GameSpecific(u8),
}

impl SessionState {
    pub fn to_wire(self) -> u8 {
        match self {
            SessionState::Disconnected => 0,
            SessionState::Connecting => 1,
            SessionState::Connected => 2,
            SessionState::GameSpecific(value) => value.max(3),
        }
    }

    pub fn from_wire(value: u8) -> Self {
        match value {
            0 => SessionState::Disconnected,
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            other => SessionState::GameSpecific(other),
        }
    }

    pub fn is_connected(self) -> bool {
        self >= SessionState::Connected
    }
}

/// Protocol-level failures surfaced to the application. None of these stop
/// the process; they end processing of a single message or connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("truncated message: {0}")]
    Truncated(#[from] DecodeError),
    #[error("out of sync: unknown entity {id} in {tag} message")]
    UnknownEntity { id: u32, tag: tags::Tag },
    #[error("out of sync: unknown player {id} in {tag} message")]
    UnknownPlayer { id: u16, tag: tags::Tag },
    #[error("bad entity payload for {id}: {source}")]
    BadEntityPayload {
        id: u32,
        #[source]
        source: bincode::Error,
    },
    #[error("player {player} may not update entity {id} owned by {owner}")]
    NotOwner { player: u16, id: u32, owner: u16 },
    #[error("unexpected {0} message before synchronization")]
    Unexpected(tags::Tag),
}

/// Two version strings are compatible when their first whitespace-separated
/// tokens are equal, e.g. `"1.4 beta"` and `"1.4 release"`.
pub fn versions_compatible(ours: &str, theirs: &str) -> bool {
    match (ours.split_whitespace().next(), theirs.split_whitespace().next()) {
        (Some(a), Some(b)) => a == b,
        (None, None) => true,
        _ => false,
    }
}

/// Contents of a client LOGIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub game_id: String,
    pub version: String,
    pub name: String,
    pub credentials: String,
}

impl LoginRequest {
    pub fn to_message(&self) -> Message {
        let mut msg = Message::new(tags::LOGIN);
        msg.add_string(&self.game_id)
            .add_string(&self.version)
            .add_string(&self.name)
            .add_string(&self.credentials);
        msg
    }

    pub fn read(msg: &mut Message) -> Result<Self, DecodeError> {
        Ok(Self {
            game_id: msg.next_string()?,
            version: msg.next_string()?,
            name: msg.next_string()?,
            credentials: msg.next_string()?,
        })
    }
}

/// Server reply to LOGIN or RESYNC: the assigned player id and game state.
pub fn login_reply(player_id: u16, state: SessionState) -> Message {
    let mut msg = Message::new(tags::LOGIN);
    msg.add_u16(player_id).add_u8(state.to_wire());
    msg
}

pub fn disconnect_message(reason: &str) -> Message {
    let mut msg = Message::new(tags::DISCONNECT);
    msg.add_string(reason);
    msg
}

pub fn reconnect_message(delay_seconds: u16) -> Message {
    let mut msg = Message::new(tags::RECONNECT);
    msg.add_u16(delay_seconds);
    msg
}

pub fn resync_request(player_id: u16, name: &str) -> Message {
    let mut msg = Message::new(tags::RESYNC);
    msg.add_u16(player_id).add_string(name);
    msg
}

/// Server-to-client RESYNC: an empty hint asking the client to send its
/// own RESYNC so the server can resend the snapshot.
pub fn resync_hint() -> Message {
    Message::new(tags::RESYNC)
}

pub fn change_state_message(state: SessionState) -> Message {
    let mut msg = Message::new(tags::CHANGE_STATE);
    msg.add_u8(state.to_wire());
    msg
}

pub fn ping_message(id: u8) -> Message {
    let mut msg = Message::new(tags::PING);
    msg.add_u8(id);
    msg
}

pub fn pong_message(id: u8) -> Message {
    let mut msg = Message::new(tags::PONG);
    msg.add_u8(id);
    msg
}

pub fn add_properties(msg: &mut Message, properties: &Properties) {
    msg.add_u16(properties.len().min(u16::MAX as usize) as u16);
    for (key, value) in properties.iter().take(u16::MAX as usize) {
        msg.add_string(key).add_string(value);
    }
}

pub fn read_properties(msg: &mut Message) -> Result<Properties, DecodeError> {
    let count = msg.next_u16()?;
    let mut properties = Properties::new();
    for _ in 0..count {
        let key = msg.next_string()?;
        let value = msg.next_string()?;
        properties.insert(key, value);
    }
    Ok(properties)
}

pub fn info_message(globals: &Properties) -> Message {
    let mut msg = Message::new(tags::INFO);
    add_properties(&mut msg, globals);
    msg
}

pub fn player_properties_message(player_id: u16, properties: &Properties) -> Message {
    let mut msg = Message::new(tags::PLAYER_PROPERTIES);
    msg.add_u16(player_id);
    add_properties(&mut msg, properties);
    msg
}

pub fn player_add_message(player: &PlayerRecord) -> Message {
    let mut msg = Message::new(tags::PLAYER_ADD);
    msg.add_u16(player.id).add_string(&player.name);
    msg
}

pub fn player_remove_message(player_id: u16) -> Message {
    let mut msg = Message::new(tags::PLAYER_REMOVE);
    msg.add_u16(player_id);
    msg
}

pub fn player_list_message<W: WorldStore + ?Sized>(world: &W) -> Message {
    let players: Vec<&PlayerRecord> = world
        .player_ids()
        .into_iter()
        .filter_map(|id| world.player(id))
        .collect();
    let mut msg = Message::new(tags::PLAYER_LIST);
    msg.add_u16(players.len() as u16);
    for player in players {
        msg.add_u16(player.id).add_string(&player.name);
        add_properties(&mut msg, &player.properties);
    }
    msg
}

/// Smallest encoded PLAYER_LIST record: id, empty name, empty property bag.
const MIN_PLAYER_RECORD: usize = 2 + 1 + 2;

/// Capacity for `declared` records, limited to what the unread bytes can hold.
fn bounded_capacity(declared: usize, remaining: usize, min_record: usize) -> usize {
    declared.min(remaining / min_record)
}

/// Reads PLAYER_LIST into records.
pub fn read_player_list(msg: &mut Message) -> Result<Vec<PlayerRecord>, DecodeError> {
    let count = msg.next_u16()?;
    let mut players = Vec::with_capacity(bounded_capacity(
        count as usize,
        msg.remaining(),
        MIN_PLAYER_RECORD,
    ));
    for _ in 0..count {
        let id = msg.next_u16()?;
        let name = msg.next_string()?;
        let properties = read_properties(msg)?;
        players.push(PlayerRecord {
            id,
            name,
            properties,
        });
    }
    Ok(players)
}

/// OBJECTS_ADD for the given ids. Ids the world cannot resolve or encode
/// are skipped.
pub fn objects_add_message<W: WorldStore + ?Sized>(world: &W, ids: &[u32]) -> Message {
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(init) = world.entity_init(*id) else {
            continue;
        };
        match init.encode() {
            Ok(bytes) => records.push((*id, init.kind, bytes)),
            Err(e) => warn!("Skipping entity {} in OBJECTS_ADD: {}", id, e),
        }
    }

    let mut msg = Message::new(tags::OBJECTS_ADD);
    msg.add_u32(records.len() as u32);
    for (id, kind, bytes) in records {
        msg.add_u32(id)
            .add_u16(kind)
            .add_u32(bytes.len() as u32)
            .add_bytes(&bytes);
    }
    msg
}

/// Reads OBJECTS_ADD records as `(id, init)` pairs.
pub fn read_objects_add(msg: &mut Message) -> Result<Vec<(u32, EntityInit)>, SessionError> {
    let count = msg.next_u32()?;
    let mut out = Vec::new();
    for _ in 0..count {
        let id = msg.next_u32()?;
        let kind = msg.next_u16()?;
        let len = msg.next_u32()? as usize;
        let bytes = msg.next_bytes(len)?;
        let mut init = EntityInit::decode(&bytes)
            .map_err(|source| SessionError::BadEntityPayload { id, source })?;
        init.kind = kind;
        out.push((id, init));
    }
    Ok(out)
}

pub fn objects_remove_message(ids: &[u32]) -> Message {
    let mut msg = Message::new(tags::OBJECTS_REMOVE);
    msg.add_u32(ids.len() as u32);
    for id in ids {
        msg.add_u32(*id);
    }
    msg
}

pub fn read_objects_remove(msg: &mut Message) -> Result<Vec<u32>, DecodeError> {
    let count = msg.next_u32()?;
    let mut ids = Vec::new();
    for _ in 0..count {
        ids.push(msg.next_u32()?);
    }
    Ok(ids)
}

/// Applies a property bag to a player, honouring the reserved `name` key.
pub fn apply_player_properties(player: &mut PlayerRecord, properties: Properties) {
    for (key, value) in properties {
        if key == crate::world::NAME_PROPERTY {
            player.name = value;
        } else {
            player.properties.insert(key, value);
        }
    }
}
