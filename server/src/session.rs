//! Server-side message handling.
//!
//! One [`Session`] is built per inbound message with borrows of everything
//! a handler may touch. Handlers run on the tick thread with the registry
//! lock held, so they may freely look at other connections.

use crate::client_manager::ClientManager;
use crate::connection::ConnectionPump;
use crate::hooks::ServerHooks;
use crate::network::ServerConfig;
use log::{debug, info, trace, warn};
use shared::codec::{decode_entity, read_update_header, Direction};
use shared::session::{
    self as proto, apply_player_properties, login_reply, pong_message, read_properties,
};
use shared::{tags, LoginRequest, Message, PlayerRecord, SessionError, SessionState, WorldStore};
use std::time::Instant;

/// Queues a DISCONNECT carrying `reason` and closes the connection.
pub(crate) fn reject(client: &ConnectionPump, reason: &str) {
    client.send_owned(proto::disconnect_message(reason));
    client.disconnect();
}

/// Queues the full snapshot a newly synchronized client needs: globals,
/// players, then every entity.
pub(crate) fn send_snapshot<W: WorldStore>(client: &ConnectionPump, world: &W) {
    client.send_owned(proto::info_message(world.globals()));
    client.send_owned(proto::player_list_message(world));
    client.send_owned(Message::new(tags::OBJECTS_CLEAR));
    client.send_owned(proto::objects_add_message(world, &world.entity_ids()));
}

pub(crate) struct Session<'a, W, H> {
    pub clients: &'a mut ClientManager,
    pub world: &'a mut W,
    pub hooks: &'a mut H,
    pub config: &'a ServerConfig,
    pub game_state: SessionState,
}

impl<W, H> Session<'_, W, H>
where
    W: WorldStore,
    H: ServerHooks<W>,
{
    fn client(&self, index: usize) -> &ConnectionPump {
        &self.clients.live()[index]
    }

    fn client_mut(&mut self, index: usize) -> &mut ConnectionPump {
        &mut self.clients.live_mut()[index]
    }

    /// Dispatches one message from the live connection at `index`.
    pub fn handle(&mut self, index: usize, mut msg: Message) -> Result<(), SessionError> {
        let tag = msg.tag();
        trace!("{} from {}", tag, self.client(index).addr());

        match tag {
            tags::PADDING => Ok(()),
            tags::PING => {
                let id = msg.next_u8()?;
                self.client(index).send_owned(pong_message(id));
                Ok(())
            }
            tags::PONG => {
                let id = msg.next_u8()?;
                let client = self.client_mut(index);
                if let Some(rtt) = client.ping.on_pong(id, Instant::now()) {
                    trace!("Player {} round trip {:?}", client.player_id, rtt);
                }
                Ok(())
            }
            tags::DISCONNECT => {
                let reason = msg.next_string().unwrap_or_default();
                let client = self.client_mut(index);
                info!(
                    "Client {} (player {}) disconnected: {}",
                    client.addr(),
                    client.player_id,
                    reason
                );
                client.force_cleanup = true;
                client.disconnect();
                Ok(())
            }
            tags::LOGIN => self.handle_login(index, &mut msg),
            tags::RESYNC => self.handle_resync(index, &mut msg),
            _ if !self.client(index).synchronized => {
                reject(self.client(index), proto::REASON_INVALID_PEER);
                Err(SessionError::Unexpected(tag))
            }
            tags::UPDATE => self.handle_update(index, &mut msg),
            tags::PLAYER_PROPERTIES => self.handle_player_properties(index, &mut msg),
            _ => {
                let player_id = self.client(index).player_id;
                if !self.hooks.game_message(self.world, player_id, &mut msg) {
                    debug!("Ignoring {} from player {}", tag, player_id);
                }
                Ok(())
            }
        }
    }

    fn handle_login(&mut self, index: usize, msg: &mut Message) -> Result<(), SessionError> {
        if self.client(index).synchronized {
            warn!(
                "Duplicate LOGIN from player {}",
                self.client(index).player_id
            );
            return Ok(());
        }

        let request = match LoginRequest::read(msg) {
            Ok(request) => request,
            Err(e) => {
                reject(self.client(index), proto::REASON_INVALID_PEER);
                return Err(e.into());
            }
        };
        let addr = self.client(index).addr();

        if request.game_id != self.config.game_id {
            warn!("Login from {} for game {:?} rejected", addr, request.game_id);
            reject(self.client(index), proto::REASON_BAD_GAME);
            return Ok(());
        }
        if !self
            .hooks
            .version_compatible(&self.config.version, &request.version)
        {
            warn!(
                "Login from {} with version {:?} rejected (server {:?})",
                addr, request.version, self.config.version
            );
            reject(self.client(index), proto::REASON_BAD_VERSION);
            return Ok(());
        }
        if !self.hooks.validate_login(&request.name, &request.credentials) {
            warn!("Login from {} as {:?} failed validation", addr, request.name);
            reject(self.client(index), proto::REASON_LOGIN_FAILED);
            return Ok(());
        }

        let Some(player_id) = self.clients.acquire_player_id() else {
            warn!("Player ids exhausted, rejecting {}", addr);
            reject(self.client(index), proto::REASON_SERVER_FULL);
            return Ok(());
        };

        let player = PlayerRecord::new(player_id, &request.name);
        let announce = proto::player_add_message(&player);
        self.world.insert_player(player);

        let game_state = self.game_state;
        let client = &mut self.clients.live_mut()[index];
        client.player_id = player_id;
        client.name = request.name.clone();
        client.send_owned(login_reply(player_id, game_state));
        send_snapshot(client, &*self.world);
        client.synchronized = true;

        info!(
            "Player {} ({}) logged in from {}",
            player_id, request.name, addr
        );
        self.clients.send_all_except(player_id, &announce, false);
        self.hooks.player_joined(self.world, player_id);
        Ok(())
    }

    /// Finds the player a RESYNC refers to. With an explicit id the stored
    /// name must match; with id 0 the name is looked up among players whose
    /// connection has dropped or is about to be replaced.
    fn resync_target(&self, index: usize, player_id: u16, name: &str) -> Option<u16> {
        if player_id != 0 {
            return self
                .world
                .player(player_id)
                .filter(|player| player.name == name)
                .map(|_| player_id);
        }
        self.world.player_ids().into_iter().find(|id| {
            let name_matches = self
                .world
                .player(*id)
                .map(|player| player.name == name)
                .unwrap_or(false);
            let held_elsewhere = self
                .clients
                .find_by_player(*id)
                .map(|holder| holder != index)
                .unwrap_or(false);
            name_matches && (self.clients.is_drop_pending(*id) || held_elsewhere)
        })
    }

    fn handle_resync(&mut self, index: usize, msg: &mut Message) -> Result<(), SessionError> {
        let requested = msg.next_u16()?;
        let name = msg.next_string()?;

        // A synchronized client asking for its own identity wants a fresh
        // snapshot.
        if self.client(index).synchronized {
            let client = self.client(index);
            if requested == 0 || requested == client.player_id {
                debug!("Resending snapshot to player {}", client.player_id);
                client.send_owned(login_reply(client.player_id, self.game_state));
                send_snapshot(client, &*self.world);
            } else {
                warn!(
                    "Player {} asked to resync as player {}",
                    client.player_id, requested
                );
            }
            return Ok(());
        }

        let Some(player_id) = self.resync_target(index, requested, &name) else {
            warn!(
                "Resync from {} as {} ({:?}) failed",
                self.client(index).addr(),
                requested,
                name
            );
            reject(self.client(index), proto::REASON_RESYNC_FAILED);
            return Ok(());
        };

        // Evict stale holders and cancel any pending removal of the player.
        for (other, client) in self.clients.live_mut().iter_mut().enumerate() {
            if other != index && client.player_id == player_id {
                info!(
                    "Player {} replaced, closing {}",
                    player_id,
                    client.addr()
                );
                reject(client, proto::REASON_REPLACED);
                client.player_id = 0;
                client.synchronized = false;
            }
            if client.drop_pending_id == player_id {
                client.drop_pending_id = 0;
            }
        }
        for client in self.clients.pending_mut() {
            if client.drop_pending_id == player_id {
                client.drop_pending_id = 0;
            }
        }
        self.clients.claim_player_id(player_id);

        let game_state = self.game_state;
        let client = &mut self.clients.live_mut()[index];
        client.player_id = player_id;
        client.name = name;
        client.send_owned(login_reply(player_id, game_state));
        send_snapshot(client, &*self.world);
        client.synchronized = true;

        info!(
            "Player {} resynchronized from {}",
            player_id,
            self.client(index).addr()
        );
        Ok(())
    }

    fn handle_update(&mut self, index: usize, msg: &mut Message) -> Result<(), SessionError> {
        let sender = self.client(index).player_id;
        let header = read_update_header(msg)?;

        for _ in 0..header.count {
            let id = msg.next_u32()?;
            let owner = match self.world.entity(id) {
                Some(state) => state.owner,
                None => {
                    self.client(index).send_owned(proto::resync_hint());
                    return Err(SessionError::UnknownEntity {
                        id,
                        tag: tags::UPDATE,
                    })
                }
            };
            let mut state = decode_entity(msg, header.precision, Direction::ToServer)?;
            if owner != sender {
                warn!(
                    "{}",
                    SessionError::NotOwner {
                        player: sender,
                        id,
                        owner
                    }
                );
                continue;
            }
            state.owner = owner;
            self.world.apply_entity(id, state);
        }
        Ok(())
    }

    fn handle_player_properties(
        &mut self,
        index: usize,
        msg: &mut Message,
    ) -> Result<(), SessionError> {
        let sender = self.client(index).player_id;
        let player_id = msg.next_u16()?;
        let properties = read_properties(msg)?;

        let Some(player) = self.world.player_mut(player_id) else {
            return Err(SessionError::UnknownPlayer {
                id: player_id,
                tag: tags::PLAYER_PROPERTIES,
            });
        };
        if player_id != sender {
            warn!(
                "Player {} tried to set properties of player {}",
                sender, player_id
            );
            return Ok(());
        }

        let forward = proto::player_properties_message(player_id, &properties);
        apply_player_properties(player, properties);
        let renamed = player.name.clone();
        self.client_mut(index).name = renamed;
        self.clients.send_all_except(sender, &forward, false);
        Ok(())
    }
}
