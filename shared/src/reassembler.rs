//! Stream-to-message reassembly.
//!
//! TCP delivers an unstructured byte stream: one read can hold half a header
//! or a dozen coalesced messages. The reassembler accepts whatever chunks the
//! socket hands out and yields complete [`Message`]s in wire order.

use crate::message::{Message, HEADER_SIZE};
use crate::session;
use log::warn;
use std::collections::VecDeque;

/// Default upper bound on a single message, header included.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Incremental framing state for one connection.
#[derive(Debug)]
pub struct FrameReassembler {
    max_message_size: usize,
    header: Vec<u8>,
    in_progress: Option<Message>,
    missing: usize,
    ready: VecDeque<Message>,
    failed: bool,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl FrameReassembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size: max_message_size.max(HEADER_SIZE),
            header: Vec::with_capacity(HEADER_SIZE),
            in_progress: None,
            missing: 0,
            ready: VecDeque::new(),
            failed: false,
        }
    }

    /// Consumes a raw chunk read from the socket.
    pub fn feed(&mut self, mut bytes: &[u8]) {
        if self.failed {
            return;
        }

        // (a) finish a header split across reads
        if !self.header.is_empty() {
            let take = (HEADER_SIZE - self.header.len()).min(bytes.len());
            self.header.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.header.len() < HEADER_SIZE {
                return;
            }
            let header = std::mem::take(&mut self.header);
            if !self.begin(&header) {
                return;
            }
        }

        // (b) extend the in-progress message
        if let Some(message) = self.in_progress.as_mut() {
            let take = self.missing.min(bytes.len());
            message.append_raw(&bytes[..take]);
            self.missing -= take;
            bytes = &bytes[take..];
            if self.missing > 0 {
                return;
            }
            if let Some(done) = self.in_progress.take() {
                self.ready.push_back(done);
            }
        }

        // (c) whole headers
        while bytes.len() >= HEADER_SIZE {
            let declared = declared_length(&bytes[..HEADER_SIZE]);
            if !self.in_range(declared) {
                self.fail(declared);
                return;
            }
            if bytes.len() >= declared {
                match Message::from_bytes(&bytes[..declared]) {
                    Ok(message) => self.ready.push_back(message),
                    Err(_) => {
                        self.fail(declared);
                        return;
                    }
                }
                bytes = &bytes[declared..];
            } else {
                if !self.begin(&bytes[..HEADER_SIZE]) {
                    return;
                }
                if let Some(message) = self.in_progress.as_mut() {
                    let rest = &bytes[HEADER_SIZE..];
                    message.append_raw(rest);
                    self.missing -= rest.len();
                }
                return;
            }
        }

        if !bytes.is_empty() {
            self.header.extend_from_slice(bytes);
        }
    }

    /// Starts a message from a complete header. Returns false on a length
    /// error, in which case the reassembler has already failed.
    fn begin(&mut self, header: &[u8]) -> bool {
        let declared = declared_length(header);
        if !self.in_range(declared) {
            self.fail(declared);
            return false;
        }
        match Message::from_bytes(header) {
            Ok(message) if declared == HEADER_SIZE => {
                self.ready.push_back(message);
            }
            Ok(message) => {
                self.in_progress = Some(message);
                self.missing = declared - HEADER_SIZE;
            }
            Err(_) => {
                self.fail(declared);
                return false;
            }
        }
        true
    }

    fn in_range(&self, declared: usize) -> bool {
        declared >= HEADER_SIZE && declared <= self.max_message_size
    }

    fn fail(&mut self, declared: usize) {
        warn!(
            "Rejecting message with declared length {} (allowed {}..={})",
            declared, HEADER_SIZE, self.max_message_size
        );
        self.header.clear();
        self.in_progress = None;
        self.missing = 0;
        self.failed = true;
        self.ready.push_back(session::disconnect_message(&format!(
            "{}: declared length {}",
            session::REASON_PACKET_SIZE,
            declared
        )));
    }

    /// Dequeues the next complete message.
    pub fn pop(&mut self) -> Option<Message> {
        self.ready.pop_front()
    }

    /// Number of complete messages waiting.
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// True once a framing error has been detected; further input is ignored.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Bytes held that do not yet form a complete message.
    pub fn pending_bytes(&self) -> usize {
        self.header.len()
            + self
                .in_progress
                .as_ref()
                .map(Message::buffered_len)
                .unwrap_or(0)
    }
}

fn declared_length(header: &[u8]) -> usize {
    u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize
}
