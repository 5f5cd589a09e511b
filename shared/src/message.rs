//! Self-describing binary message container.
//!
//! Layout on the wire:
//!
//! ```text
//! +----------------+-----------------------+------------------+
//! | tag (4 bytes)  | total length (4 bytes)| payload          |
//! | u32 big-endian | u32 big-endian        | typed fields     |
//! +----------------+-----------------------+------------------+
//! ```
//!
//! The total length includes the 8 header bytes. Every multi-byte field is
//! big-endian regardless of host order; strings are raw bytes followed by a
//! single zero byte.

use crate::tags::Tag;
use thiserror::Error;

/// Size of the tag + length header.
pub const HEADER_SIZE: usize = 8;

/// Allocation step for messages built locally for sending.
pub const OUTGOING_CHUNK: usize = 256;

/// Allocation step for messages assembled from received bytes.
pub const INCOMING_CHUNK: usize = 16;

/// Errors produced while reading fields from a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message truncated: wanted {wanted} bytes at offset {offset}, length is {length}")]
    Truncated {
        wanted: usize,
        offset: usize,
        length: usize,
    },
    #[error("buffer of {0} bytes is too short for a message header")]
    MissingHeader(usize),
}

/// A single protocol message with a sequential read cursor.
#[derive(Debug, Clone)]
pub struct Message {
    data: Vec<u8>,
    cursor: usize,
    chunk: usize,
}

impl Message {
    /// Creates an empty outgoing message carrying only the header.
    pub fn new(tag: Tag) -> Self {
        let mut data = Vec::with_capacity(OUTGOING_CHUNK);
        data.extend_from_slice(&tag.to_bytes());
        data.extend_from_slice(&(HEADER_SIZE as u32).to_be_bytes());
        Self {
            data,
            cursor: HEADER_SIZE,
            chunk: OUTGOING_CHUNK,
        }
    }

    /// Creates an incoming message from raw bytes starting with a header.
    ///
    /// The bytes may be a prefix of the full message; the reassembler
    /// appends the rest with [`Message::append_raw`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut message = Self {
            data: Vec::new(),
            cursor: HEADER_SIZE,
            chunk: INCOMING_CHUNK,
        };
        message.set_data(bytes)?;
        Ok(message)
    }

    /// Replaces the contents with `bytes`, which must hold at least a header.
    pub fn set_data(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::MissingHeader(bytes.len()));
        }
        self.data.clear();
        self.reserve_chunked(bytes.len());
        self.data.extend_from_slice(bytes);
        self.cursor = HEADER_SIZE;
        Ok(())
    }

    /// Appends received bytes without touching the declared length.
    pub fn append_raw(&mut self, bytes: &[u8]) {
        self.reserve_chunked(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    pub fn tag(&self) -> Tag {
        Tag(u32::from_be_bytes([
            self.data[0],
            self.data[1],
            self.data[2],
            self.data[3],
        ]))
    }

    /// Length declared in the header, header included.
    pub fn total_length(&self) -> usize {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]) as usize
    }

    /// Number of bytes actually held, which can lag behind `total_length`
    /// while a message is still being reassembled.
    pub fn buffered_len(&self) -> usize {
        self.data.len()
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() >= self.total_length()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_SIZE..]
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Unread bytes between the cursor and the end of the message.
    pub fn remaining(&self) -> usize {
        self.read_limit().saturating_sub(self.cursor)
    }

    /// Moves the cursor back to the first payload byte.
    pub fn rewind(&mut self) {
        self.cursor = HEADER_SIZE;
    }

    fn read_limit(&self) -> usize {
        self.total_length().min(self.data.len())
    }

    fn reserve_chunked(&mut self, extra: usize) {
        let needed = self.data.len() + extra;
        if needed > self.data.capacity() {
            let rounded = needed.div_ceil(self.chunk) * self.chunk;
            self.data.reserve_exact(rounded - self.data.len());
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.reserve_chunked(bytes.len());
        self.data.extend_from_slice(bytes);
        let length = self.data.len() as u32;
        self.data[4..HEADER_SIZE].copy_from_slice(&length.to_be_bytes());
    }

    pub fn add_u8(&mut self, value: u8) -> &mut Self {
        self.push(&[value]);
        self
    }

    pub fn add_i8(&mut self, value: i8) -> &mut Self {
        self.push(&value.to_be_bytes());
        self
    }

    pub fn add_u16(&mut self, value: u16) -> &mut Self {
        self.push(&value.to_be_bytes());
        self
    }

    pub fn add_i16(&mut self, value: i16) -> &mut Self {
        self.push(&value.to_be_bytes());
        self
    }

    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        self.push(&value.to_be_bytes());
        self
    }

    pub fn add_i32(&mut self, value: i32) -> &mut Self {
        self.push(&value.to_be_bytes());
        self
    }

    pub fn add_u64(&mut self, value: u64) -> &mut Self {
        self.push(&value.to_be_bytes());
        self
    }

    pub fn add_i64(&mut self, value: i64) -> &mut Self {
        self.push(&value.to_be_bytes());
        self
    }

    pub fn add_f32(&mut self, value: f32) -> &mut Self {
        self.push(&value.to_bits().to_be_bytes());
        self
    }

    pub fn add_f64(&mut self, value: f64) -> &mut Self {
        self.push(&value.to_bits().to_be_bytes());
        self
    }

    /// Appends a zero-terminated string. Anything after an embedded zero
    /// byte is dropped since it could not be read back.
    pub fn add_string(&mut self, value: &str) -> &mut Self {
        let bytes = value.as_bytes();
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        self.push(&bytes[..end]);
        self.push(&[0]);
        self
    }

    /// Appends raw bytes with no length prefix.
    pub fn add_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.push(value);
        self
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let limit = self.read_limit();
        if self.cursor + N > limit {
            let err = DecodeError::Truncated {
                wanted: N,
                offset: self.cursor,
                length: limit,
            };
            self.cursor = limit;
            return Err(err);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.cursor..self.cursor + N]);
        self.cursor += N;
        Ok(out)
    }

    pub fn next_u8(&mut self) -> Result<u8, DecodeError> {
        self.take::<1>().map(|b| b[0])
    }

    pub fn next_i8(&mut self) -> Result<i8, DecodeError> {
        self.take::<1>().map(i8::from_be_bytes)
    }

    pub fn next_u16(&mut self) -> Result<u16, DecodeError> {
        self.take::<2>().map(u16::from_be_bytes)
    }

    pub fn next_i16(&mut self) -> Result<i16, DecodeError> {
        self.take::<2>().map(i16::from_be_bytes)
    }

    pub fn next_u32(&mut self) -> Result<u32, DecodeError> {
        self.take::<4>().map(u32::from_be_bytes)
    }

    pub fn next_i32(&mut self) -> Result<i32, DecodeError> {
        self.take::<4>().map(i32::from_be_bytes)
    }

    pub fn next_u64(&mut self) -> Result<u64, DecodeError> {
        self.take::<8>().map(u64::from_be_bytes)
    }

    pub fn next_i64(&mut self) -> Result<i64, DecodeError> {
        self.take::<8>().map(i64::from_be_bytes)
    }

    pub fn next_f32(&mut self) -> Result<f32, DecodeError> {
        self.take::<4>()
            .map(|b| f32::from_bits(u32::from_be_bytes(b)))
    }

    pub fn next_f64(&mut self) -> Result<f64, DecodeError> {
        self.take::<8>()
            .map(|b| f64::from_bits(u64::from_be_bytes(b)))
    }

    /// Reads a zero-terminated string. Invalid UTF-8 is replaced rather
    /// than rejected; a missing terminator is a truncation.
    pub fn next_string(&mut self) -> Result<String, DecodeError> {
        let limit = self.read_limit();
        let start = self.cursor.min(limit);
        match self.data[start..limit].iter().position(|b| *b == 0) {
            Some(len) => {
                let value = String::from_utf8_lossy(&self.data[start..start + len]).into_owned();
                self.cursor = start + len + 1;
                Ok(value)
            }
            None => {
                self.cursor = limit;
                Err(DecodeError::Truncated {
                    wanted: limit - start + 1,
                    offset: start,
                    length: limit,
                })
            }
        }
    }

    /// Reads `len` raw bytes.
    pub fn next_bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        let limit = self.read_limit();
        if self.cursor + len > limit {
            let err = DecodeError::Truncated {
                wanted: len,
                offset: self.cursor,
                length: limit,
            };
            self.cursor = limit;
            return Err(err);
        }
        let out = self.data[self.cursor..self.cursor + len].to_vec();
        self.cursor += len;
        Ok(out)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Message {}
