//! Registry of client connections for the replication server
//!
//! This module owns every [`ConnectionPump`] the server has accepted and
//! the pool of player ids handed out to them. Connections live in one of two
//! lists:
//! - `live`: connections whose queues are pumped every tick
//! - `pending`: dropped connections waiting for their I/O tasks to exit and
//!   for their player's grace window to run out
//!
//! The registry is shared between the accept task and the tick thread
//! behind a single async mutex. When both the registry and the world store
//! are needed, the registry is locked first.

use crate::connection::ConnectionPump;
use log::{info, warn};
use shared::{tags, IdPool, Message};
use std::time::Duration;

/// Tracks live and drop-pending connections and player id assignment
pub struct ClientManager {
    live: Vec<ConnectionPump>,
    pending: Vec<ConnectionPump>,
    player_ids: IdPool,
    /// Maximum number of concurrent live connections
    max_clients: usize,
}

impl ClientManager {
    /// Creates an empty registry with the given capacity limit
    pub fn new(max_clients: usize) -> Self {
        Self {
            live: Vec::new(),
            pending: Vec::new(),
            player_ids: IdPool::for_players(),
            max_clients,
        }
    }

    /// Adds a freshly accepted connection
    ///
    /// Returns the connection back if the server is at capacity, so the
    /// caller can tell the peer why before retiring it.
    pub fn add(&mut self, pump: ConnectionPump) -> Result<(), ConnectionPump> {
        if self.live.len() >= self.max_clients {
            return Err(pump);
        }
        info!("Client {} connected ({:?})", pump.addr(), pump.id());
        self.live.push(pump);
        Ok(())
    }

    /// Parks a connection for retirement without ever pumping it
    pub fn park(&mut self, pump: ConnectionPump) {
        self.pending.push(pump);
    }

    pub fn live(&self) -> &[ConnectionPump] {
        &self.live
    }

    pub fn live_mut(&mut self) -> &mut [ConnectionPump] {
        &mut self.live
    }

    pub fn pending(&self) -> &[ConnectionPump] {
        &self.pending
    }

    pub(crate) fn pending_mut(&mut self) -> &mut [ConnectionPump] {
        &mut self.pending
    }

    /// Returns the number of live connections
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Returns true if no connection is live
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Index of the live connection currently holding `player_id`
    pub fn find_by_player(&self, player_id: u16) -> Option<usize> {
        if player_id == 0 {
            return None;
        }
        self.live.iter().position(|c| c.player_id == player_id)
    }

    /// True if some dropped connection still reserves `player_id`
    pub fn is_drop_pending(&self, player_id: u16) -> bool {
        player_id != 0
            && self
                .live
                .iter()
                .chain(self.pending.iter())
                .any(|c| c.drop_pending_id == player_id)
    }

    pub fn acquire_player_id(&mut self) -> Option<u16> {
        let id = self.player_ids.acquire()?;
        u16::try_from(id).ok()
    }

    /// Marks `player_id` as issued. Returns false if it already was.
    pub fn claim_player_id(&mut self, player_id: u16) -> bool {
        self.player_ids.claim(u32::from(player_id))
    }

    pub fn release_player_id(&mut self, player_id: u16) {
        self.player_ids.release(u32::from(player_id));
    }

    pub fn is_player_id_live(&self, player_id: u16) -> bool {
        self.player_ids.is_live(u32::from(player_id))
    }

    /// Queues `message` to every live connection.
    ///
    /// Without `force`, connections that have not finished the login
    /// handshake are skipped.
    pub fn broadcast(&self, message: &Message, force: bool) -> usize {
        self.send_filtered(message, force, |_| true)
    }

    /// Like [`ClientManager::broadcast`] but skips the connection holding
    /// `player_id`
    pub fn send_all_except(&self, player_id: u16, message: &Message, force: bool) -> usize {
        self.send_filtered(message, force, |c| c.player_id != player_id || player_id == 0)
    }

    /// Queues `message` to the connection holding `player_id`. Returns false
    /// if no such connection is live.
    pub fn send_to_player(&self, player_id: u16, message: &Message, force: bool) -> bool {
        match self.find_by_player(player_id) {
            Some(index) => {
                let client = &self.live[index];
                (force || client.synchronized) && client.send(message)
            }
            None => false,
        }
    }

    fn send_filtered<F>(&self, message: &Message, force: bool, include: F) -> usize
    where
        F: Fn(&ConnectionPump) -> bool,
    {
        let mut sent = 0;
        for client in &self.live {
            if !client.is_connected() || !(force || client.synchronized) || !include(client) {
                continue;
            }
            if client.send(message) {
                sent += 1;
            }
        }
        sent
    }

    /// Moves every disconnected live connection to the pending list.
    ///
    /// The player id a connection held becomes its drop-pending id, so the
    /// identity survives until cleanup or a resync reclaims it. Returns the
    /// number of connections moved.
    pub fn take_disconnected(&mut self) -> usize {
        let mut moved = 0;
        let mut index = 0;
        while index < self.live.len() {
            if self.live[index].is_connected() {
                index += 1;
                continue;
            }
            let mut pump = self.live.remove(index);
            // A DISCONNECT that arrived after this tick's inbound pass still
            // skips the grace window.
            while let Some(msg) = pump.try_recv() {
                if msg.tag() == tags::DISCONNECT {
                    pump.force_cleanup = true;
                }
            }
            if pump.player_id != 0 {
                info!(
                    "Player {} ({}) dropped from {}",
                    pump.player_id,
                    pump.name,
                    pump.addr()
                );
            }
            pump.drop_pending_id = pump.player_id;
            pump.player_id = 0;
            pump.synchronized = false;
            self.pending.push(pump);
            moved += 1;
        }
        moved
    }

    /// Removes pending connections that are ready to be retired.
    ///
    /// A connection is ready once its I/O tasks have exited and either it
    /// reserves no player, cleanup is forced, or `grace` has elapsed since
    /// it dropped. A connection whose tasks are still running `exit_timeout`
    /// after the grace window is retired anyway and its tasks detached.
    pub fn take_retirable(&mut self, grace: Duration, exit_timeout: Duration) -> Vec<ConnectionPump> {
        let mut ready = Vec::new();
        let mut index = 0;
        while index < self.pending.len() {
            let pump = &self.pending[index];
            let since = pump.disconnected_for().unwrap_or_default();
            let grace_over =
                pump.drop_pending_id == 0 || pump.force_cleanup || since >= grace;
            let io_done = pump.io_finished();
            let overdue = since >= grace + exit_timeout;
            if grace_over && (io_done || overdue) {
                if !io_done {
                    warn!(
                        "Connection {:?} I/O still running {:?} after disconnect",
                        pump.id(),
                        since
                    );
                }
                ready.push(self.pending.remove(index));
            } else {
                index += 1;
            }
        }
        ready
    }

    /// Empties both lists, e.g. for shutdown
    pub fn take_all(&mut self) -> Vec<ConnectionPump> {
        let mut all: Vec<ConnectionPump> = self.live.drain(..).collect();
        all.append(&mut self.pending);
        all
    }
}
