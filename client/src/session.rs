//! Client-side session handling: applies server messages to the local world
//! and sends the entities this client owns back to the server.

use crate::hooks::ClientHooks;
use crate::link::{ClientLink, LinkError};
use log::{debug, info, trace, warn};
use shared::codec::{
    decode_entity, read_update_header, write_update, AutoThresholds, Direction, Precision,
    SmoothingConfig, Smoother,
};
use shared::session::{
    self as proto, apply_player_properties, pong_message, read_objects_add, read_objects_remove,
    read_player_list, read_properties, resync_request,
};
use shared::{tags, EntityState, Message, PlayerRecord, SessionError, SessionState, WorldStore};
use std::time::{Duration, Instant};

pub struct ClientSession<W> {
    world: W,
    state: SessionState,
    smoother: Smoother,
    update_precision: Precision,
    thresholds: AutoThresholds,
    /// A RESYNC went out and no LOGIN reply has arrived since.
    resync_requested: bool,
    last_disconnect_reason: Option<String>,
    outbox: Vec<Message>,
    close_requested: bool,
}

impl<W: WorldStore> ClientSession<W> {
    pub fn new(world: W, smoothing: SmoothingConfig) -> Self {
        Self {
            world,
            state: SessionState::Disconnected,
            smoother: Smoother::new(smoothing),
            update_precision: Precision::AUTO,
            thresholds: AutoThresholds::CLIENT,
            resync_requested: false,
            last_disconnect_reason: None,
            outbox: Vec::new(),
            close_requested: false,
        }
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn smoother_mut(&mut self) -> &mut Smoother {
        &mut self.smoother
    }

    pub fn set_update_precision(&mut self, precision: Precision) {
        self.update_precision = precision;
    }

    pub fn last_disconnect_reason(&self) -> Option<&str> {
        self.last_disconnect_reason.as_deref()
    }

    /// Handles everything queued on the link, then sends any replies.
    /// Returns the number of messages handled.
    pub async fn process<H>(&mut self, link: &mut ClientLink, hooks: &mut H) -> usize
    where
        H: ClientHooks<W>,
    {
        let mut handled = 0;
        while let Some(msg) = link.try_recv() {
            if let Err(e) = self.handle(link, hooks, msg) {
                warn!("{}", e);
            }
            handled += 1;
        }
        self.flush(link).await;
        handled
    }

    /// Sends an UPDATE with every entity this client owns.
    pub async fn send_owned_updates(&mut self, link: &mut ClientLink) -> Result<usize, LinkError> {
        let player_id = link.player_id();
        if player_id == 0 || !self.state.is_connected() {
            return Ok(0);
        }
        let records: Vec<(u32, EntityState)> = self
            .world
            .entity_ids()
            .into_iter()
            .filter_map(|id| self.world.entity(id).map(|state| (id, *state)))
            .filter(|(_, state)| state.owner == player_id)
            .collect();
        if records.is_empty() {
            return Ok(0);
        }
        let msg = write_update(
            &records,
            self.update_precision,
            Direction::ToServer,
            &self.thresholds,
        );
        link.send(&msg).await?;
        Ok(records.len())
    }

    async fn flush(&mut self, link: &mut ClientLink) {
        for msg in self.outbox.drain(..) {
            if let Err(e) = link.send(&msg).await {
                debug!("Dropping {} reply: {}", msg.tag(), e);
                break;
            }
        }
        if self.close_requested {
            self.close_requested = false;
            link.close().await;
        }
    }

    fn request_resync(&mut self, link: &ClientLink) {
        if self.resync_requested {
            return;
        }
        self.resync_requested = true;
        let name = link.name().unwrap_or_default();
        self.outbox.push(resync_request(link.player_id(), name));
    }

    /// Applies one server message. Replies are queued and go out on the
    /// next [`ClientSession::process`].
    pub fn handle<H>(
        &mut self,
        link: &mut ClientLink,
        hooks: &mut H,
        mut msg: Message,
    ) -> Result<(), SessionError>
    where
        H: ClientHooks<W>,
    {
        let tag = msg.tag();
        trace!("Received {}", tag);

        let result = match tag {
            tags::PADDING => Ok(()),
            tags::LOGIN => {
                let player_id = msg.next_u16()?;
                let state = SessionState::from_wire(msg.next_u8()?);
                info!("Logged in as player {} (state {:?})", player_id, state);
                link.on_login(player_id);
                self.state = state;
                self.resync_requested = false;
                self.last_disconnect_reason = None;
                hooks.logged_in(&mut self.world, player_id);
                Ok(())
            }
            tags::INFO => {
                let globals = read_properties(&mut msg)?;
                let target = self.world.globals_mut();
                target.clear();
                target.extend(globals);
                Ok(())
            }
            tags::CHANGE_STATE => {
                let state = SessionState::from_wire(msg.next_u8()?);
                debug!("Game state {:?} -> {:?}", self.state, state);
                self.state = state;
                hooks.state_changed(state);
                Ok(())
            }
            tags::PLAYER_LIST => {
                let players = read_player_list(&mut msg)?;
                self.world.clear_players();
                for player in players {
                    self.world.insert_player(player);
                }
                Ok(())
            }
            tags::PLAYER_ADD => {
                let id = msg.next_u16()?;
                let name = msg.next_string()?;
                self.world.insert_player(PlayerRecord::new(id, &name));
                hooks.player_added(&mut self.world, id);
                Ok(())
            }
            tags::PLAYER_REMOVE => {
                let id = msg.next_u16()?;
                match self.world.remove_player(id) {
                    Some(_) => {
                        hooks.player_removed(&mut self.world, id);
                        Ok(())
                    }
                    None => Err(SessionError::UnknownPlayer { id, tag }),
                }
            }
            tags::PLAYER_PROPERTIES => {
                let id = msg.next_u16()?;
                let properties = read_properties(&mut msg)?;
                match self.world.player_mut(id) {
                    Some(player) => {
                        apply_player_properties(player, properties);
                        Ok(())
                    }
                    None => Err(SessionError::UnknownPlayer { id, tag }),
                }
            }
            tags::OBJECTS_ADD => {
                for (id, init) in read_objects_add(&mut msg)? {
                    self.smoother.forget(id);
                    self.world.insert_entity(id, init);
                }
                Ok(())
            }
            tags::OBJECTS_REMOVE => {
                for id in read_objects_remove(&mut msg)? {
                    self.smoother.forget(id);
                    if !self.world.remove_entity(id) {
                        debug!("OBJECTS_REMOVE for unknown entity {}", id);
                    }
                }
                Ok(())
            }
            tags::OBJECTS_CLEAR => {
                self.world.clear_entities();
                self.smoother.clear();
                Ok(())
            }
            tags::UPDATE => self.handle_update(link, &mut msg),
            tags::PING => {
                let id = msg.next_u8()?;
                self.outbox.push(pong_message(id));
                Ok(())
            }
            tags::PONG => {
                let id = msg.next_u8()?;
                if let Some(rtt) = link.on_pong(id) {
                    trace!("Round trip {:?}", rtt);
                }
                Ok(())
            }
            tags::RECONNECT => {
                let seconds = msg.next_u16()?;
                info!("Server asked us to reconnect in {}s", seconds);
                link.forget_player();
                link.schedule_reconnect(Duration::from_secs(u64::from(seconds)));
                self.state = SessionState::Disconnected;
                self.close_requested = true;
                Ok(())
            }
            tags::RESYNC => {
                self.resync_requested = false;
                self.request_resync(link);
                Ok(())
            }
            tags::DISCONNECT => {
                let reason = msg.next_string().unwrap_or_default();
                warn!("Disconnected by server: {}", reason);
                if reason == proto::REASON_RESYNC_FAILED {
                    // The old identity is gone; come back as a new player.
                    link.forget_player();
                    link.schedule_backoff();
                }
                self.state = SessionState::Disconnected;
                self.close_requested = true;
                hooks.disconnected(&reason);
                self.last_disconnect_reason = Some(reason);
                Ok(())
            }
            _ => {
                if !hooks.game_message(&mut self.world, &mut msg) {
                    debug!("Ignoring {} message", tag);
                }
                Ok(())
            }
        };

        if let Err(SessionError::UnknownEntity { .. } | SessionError::UnknownPlayer { .. }) =
            &result
        {
            self.request_resync(link);
        }
        result
    }

    fn handle_update(&mut self, link: &ClientLink, msg: &mut Message) -> Result<(), SessionError> {
        let header = read_update_header(msg)?;
        let player_id = link.player_id();
        let now = Instant::now();
        let lead = Duration::from_secs_f32(link.latency().average().max(0.0) / 2000.0);

        for _ in 0..header.count {
            let id = msg.next_u32()?;
            if self.world.entity(id).is_none() {
                return Err(SessionError::UnknownEntity {
                    id,
                    tag: tags::UPDATE,
                });
            }
            let state = decode_entity(msg, header.precision, Direction::ToClient)?;
            // Our own entities are authoritative here.
            if player_id != 0 && state.owner == player_id {
                continue;
            }
            let smoothed = self.smoother.apply(id, state, now, lead);
            self.world.apply_entity(id, smoothed);
        }
        Ok(())
    }
}
