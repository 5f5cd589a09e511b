//! Message tag registry.
//!
//! A tag is the first 4 bytes of every message. Tags are the big-endian
//! packing of a 4-character ASCII mnemonic so they stay readable in packet
//! dumps.

use std::fmt;

/// 32-bit message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u32);

impl Tag {
    /// Packs a 4-character mnemonic into a tag value.
    pub const fn from_ascii(code: &[u8; 4]) -> Self {
        Tag(u32::from_be_bytes(*code))
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Returns true if the tag is one of the core protocol tags.
    pub fn is_core(self) -> bool {
        ALL.contains(&self)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            for b in bytes {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

pub const PADDING: Tag = Tag::from_ascii(b"PAD_");
pub const LOGIN: Tag = Tag::from_ascii(b"LOGI");
pub const DISCONNECT: Tag = Tag::from_ascii(b"DISC");
pub const RECONNECT: Tag = Tag::from_ascii(b"RECO");
pub const INFO: Tag = Tag::from_ascii(b"INFO");
pub const CHANGE_STATE: Tag = Tag::from_ascii(b"CHST");
pub const UPDATE: Tag = Tag::from_ascii(b"UPDT");
pub const OBJECTS_ADD: Tag = Tag::from_ascii(b"OADD");
pub const OBJECTS_REMOVE: Tag = Tag::from_ascii(b"ORMV");
pub const OBJECTS_CLEAR: Tag = Tag::from_ascii(b"OCLR");
pub const PLAYER_LIST: Tag = Tag::from_ascii(b"PLST");
pub const PLAYER_ADD: Tag = Tag::from_ascii(b"PLAD");
pub const PLAYER_REMOVE: Tag = Tag::from_ascii(b"PLRM");
pub const PLAYER_PROPERTIES: Tag = Tag::from_ascii(b"PLPR");
pub const PING: Tag = Tag::from_ascii(b"PING");
pub const PONG: Tag = Tag::from_ascii(b"PONG");
pub const RESYNC: Tag = Tag::from_ascii(b"RSYN");

const ALL: [Tag; 17] = [
    PADDING,
    LOGIN,
    DISCONNECT,
    RECONNECT,
    INFO,
    CHANGE_STATE,
    UPDATE,
    OBJECTS_ADD,
    OBJECTS_REMOVE,
    OBJECTS_CLEAR,
    PLAYER_LIST,
    PLAYER_ADD,
    PLAYER_REMOVE,
    PLAYER_PROPERTIES,
    PING,
    PONG,
    RESYNC,
];
