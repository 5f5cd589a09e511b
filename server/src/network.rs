//! Server network layer handling TCP accepts and per-tick replication

use crate::client_manager::ClientManager;
use crate::connection::{ConnectionId, ConnectionPump, PumpConfig};
use crate::hooks::ServerHooks;
use crate::session::{reject, Session};
use log::{debug, error, info, warn};
use shared::codec::{write_update, AutoThresholds, Direction, Precision};
use shared::session::{self as proto};
use shared::{tags, EntityState, Message, SessionState, WorldStore, DEFAULT_GRACE_SECS, DEFAULT_PORT};
use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Average ping at which a client's update interval has doubled.
pub const BACKOFF_PING_MS: f32 = 200.0;

/// Upper bound on the update interval multiplier.
pub const MAX_UPDATE_BACKOFF: f32 = 4.0;

/// Multiplier applied to the base update interval for a client whose
/// average ping is `average_ping_ms`.
pub fn update_backoff(average_ping_ms: f32) -> f32 {
    (1.0 + average_ping_ms.max(0.0) / BACKOFF_PING_MS).min(MAX_UPDATE_BACKOFF)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub game_id: String,
    pub version: String,
    pub max_clients: usize,
    /// Base interval between UPDATE messages to one client.
    pub update_interval: Duration,
    pub update_precision: Precision,
    pub auto_thresholds: AutoThresholds,
    /// Connections that have not logged in by then are dropped.
    pub login_timeout: Duration,
    /// How long a dropped player is kept for a resync.
    pub grace_period: Duration,
    /// How long to wait for a connection's I/O tasks to exit.
    pub exit_timeout: Duration,
    pub ping_interval: Duration,
    /// Drop clients whose oldest unanswered ping is older than this.
    pub ping_timeout: Option<Duration>,
    pub pump: PumpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            game_id: "replication-demo".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_clients: 64,
            update_interval: Duration::from_millis(50),
            update_precision: Precision::AUTO,
            auto_thresholds: AutoThresholds::SERVER,
            login_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(DEFAULT_GRACE_SECS),
            exit_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(1),
            ping_timeout: Some(Duration::from_secs(15)),
            pump: PumpConfig::default(),
        }
    }
}

/// Replication server: owns the listener task and the connection registry,
/// and is driven once per tick by the caller with the world store.
pub struct Server {
    config: ServerConfig,
    local_addr: SocketAddr,
    clients: Arc<Mutex<ClientManager>>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
    /// Entity ids every synchronized client has been told about.
    known_entities: BTreeSet<u32>,
    game_state: SessionState,
    draining: bool,
}

impl Server {
    /// Binds the listener and starts accepting connections.
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on {}", local_addr);

        let clients = Arc::new(Mutex::new(ClientManager::new(config.max_clients)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&clients),
            config.pump.clone(),
            shutdown_rx,
        ));

        Ok(Server {
            config,
            local_addr,
            clients,
            shutdown_tx,
            accept_task: Some(accept_task),
            known_entities: BTreeSet::new(),
            game_state: SessionState::Connected,
            draining: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The registry, for inspection. Lock it before the world store.
    pub fn clients(&self) -> &Arc<Mutex<ClientManager>> {
        &self.clients
    }

    pub fn game_state(&self) -> SessionState {
        self.game_state
    }

    /// Changes the game state and announces it to every synchronized client.
    pub async fn set_game_state(&mut self, state: SessionState) {
        self.game_state = state;
        let clients = self.clients.lock().await;
        clients.broadcast(&proto::change_state_message(state), false);
    }

    /// One server tick: handle inbound messages, retire dropped connections,
    /// announce entity additions and removals, then send due updates.
    pub async fn drive<W, H>(&mut self, world: &mut W, hooks: &mut H)
    where
        W: WorldStore,
        H: ServerHooks<W>,
    {
        let registry = Arc::clone(&self.clients);
        let retired = {
            let mut clients = registry.lock().await;
            self.process_in(&mut clients, world, hooks);
            let retired = self.remove_disconnected(&mut clients, world, hooks);
            self.sync_entities(&clients, world);
            self.send_updates(&mut clients, world);
            retired
        };
        // Joined without the registry lock so the accept task keeps going.
        for pump in retired {
            pump.retire(Duration::from_millis(10)).await;
        }
    }

    /// Drains every live connection's inbound queue through the session
    /// handlers and enforces the login timeout.
    pub fn process_in<W, H>(&mut self, clients: &mut ClientManager, world: &mut W, hooks: &mut H)
    where
        W: WorldStore,
        H: ServerHooks<W>,
    {
        for index in 0..clients.len() {
            {
                let client = &clients.live()[index];
                if client.is_connected()
                    && !client.synchronized
                    && client.accepted_at.elapsed() > self.config.login_timeout
                {
                    warn!("Client {} did not log in in time", client.addr());
                    reject(client, proto::REASON_LOGIN_TIMEOUT);
                }
            }

            while let Some(msg) = clients.live_mut()[index].try_recv() {
                // After a drop only the parting DISCONNECT still matters.
                if !clients.live()[index].is_connected() && msg.tag() != tags::DISCONNECT {
                    continue;
                }
                let addr = clients.live()[index].addr();
                let mut session = Session {
                    clients: &mut *clients,
                    world: &mut *world,
                    hooks: &mut *hooks,
                    config: &self.config,
                    game_state: self.game_state,
                };
                if let Err(e) = session.handle(index, msg) {
                    warn!("Client {}: {}", addr, e);
                }
            }
        }
    }

    /// Moves dropped connections to the pending list and takes out the ones
    /// whose grace window is over, removing their players for good. The
    /// returned connections still need [`ConnectionPump::retire`].
    pub fn remove_disconnected<W, H>(
        &mut self,
        clients: &mut ClientManager,
        world: &mut W,
        hooks: &mut H,
    ) -> Vec<ConnectionPump>
    where
        W: WorldStore,
        H: ServerHooks<W>,
    {
        if let Some(limit) = self.config.ping_timeout {
            let now = Instant::now();
            for client in clients.live() {
                let stale = client
                    .ping
                    .oldest_outstanding(now)
                    .map(|age| age > limit)
                    .unwrap_or(false);
                if stale && client.is_connected() {
                    warn!("Player {} ping timeout", client.player_id);
                    reject(client, proto::REASON_PING_TIMEOUT);
                }
            }
        }

        clients.take_disconnected();

        let grace = if self.draining {
            Duration::ZERO
        } else {
            self.config.grace_period
        };
        let retired = clients.take_retirable(grace, self.config.exit_timeout);
        for pump in &retired {
            let player_id = pump.drop_pending_id;
            if player_id != 0 && clients.find_by_player(player_id).is_none() {
                remove_player(clients, world, hooks, player_id);
            }
            let stats = pump.stats();
            debug!(
                "Retiring {:?} ({}): {} bytes in, {} bytes out, {} messages in, {} messages out",
                pump.id(),
                pump.addr(),
                stats.bytes_in,
                stats.bytes_out,
                stats.messages_in,
                stats.messages_out
            );
        }
        retired
    }

    /// Announces entities that appeared or vanished since the last tick.
    fn sync_entities<W: WorldStore>(&mut self, clients: &ClientManager, world: &W) {
        let current: BTreeSet<u32> = world.entity_ids().into_iter().collect();
        let added: Vec<u32> = current.difference(&self.known_entities).copied().collect();
        let removed: Vec<u32> = self.known_entities.difference(&current).copied().collect();

        if !added.is_empty() {
            clients.broadcast(&proto::objects_add_message(world, &added), false);
        }
        if !removed.is_empty() {
            clients.broadcast(&proto::objects_remove_message(&removed), false);
        }
        self.known_entities = current;
    }

    /// Sends PINGs and UPDATEs to every synchronized client that is due.
    ///
    /// A client's update interval grows with its average ping, and entities
    /// the client owns are left out of its updates.
    pub fn send_updates<W: WorldStore>(&mut self, clients: &mut ClientManager, world: &W) {
        let now = Instant::now();
        let ids = world.entity_ids();

        for client in clients.live_mut() {
            if !client.synchronized || !client.is_connected() {
                continue;
            }

            let ping_due = client
                .last_ping
                .map(|at| now.duration_since(at) >= self.config.ping_interval)
                .unwrap_or(true);
            if ping_due {
                client.last_ping = Some(now);
                if let Some(id) = client.ping.send_ping(now) {
                    client.send_owned(proto::ping_message(id));
                }
            }

            let interval = self
                .config
                .update_interval
                .mul_f32(update_backoff(client.ping.average()));
            let update_due = client
                .last_update
                .map(|at| now.duration_since(at) >= interval)
                .unwrap_or(true);
            if !update_due {
                continue;
            }
            client.last_update = Some(now);

            let records: Vec<(u32, EntityState)> = ids
                .iter()
                .filter_map(|id| world.entity(*id).map(|state| (*id, *state)))
                .filter(|(_, state)| state.owner != client.player_id)
                .collect();
            if records.is_empty() {
                continue;
            }
            client.send_owned(write_update(
                &records,
                self.config.update_precision,
                Direction::ToClient,
                &self.config.auto_thresholds,
            ));
        }
    }

    /// Queues `message` to every synchronized client.
    pub async fn broadcast(&self, message: &Message) -> usize {
        self.clients.lock().await.broadcast(message, false)
    }

    pub async fn send_all_except(&self, player_id: u16, message: &Message) -> usize {
        self.clients
            .lock()
            .await
            .send_all_except(player_id, message, false)
    }

    pub async fn send_to_player(&self, player_id: u16, message: &Message) -> bool {
        self.clients
            .lock()
            .await
            .send_to_player(player_id, message, false)
    }

    /// Disconnects a player with `reason`. The player is removed on the
    /// next tick without waiting for the grace window.
    pub async fn kick(&self, player_id: u16, reason: &str) -> bool {
        let mut clients = self.clients.lock().await;
        let Some(index) = clients.find_by_player(player_id) else {
            return false;
        };
        let client = &mut clients.live_mut()[index];
        info!("Kicking player {}: {}", player_id, reason);
        client.force_cleanup = true;
        reject(client, reason);
        true
    }

    /// Stops accepting, asks every client to reconnect after
    /// `delay_seconds` and closes their connections. Later ticks retire
    /// them without a grace window.
    pub async fn drain(&mut self, delay_seconds: u16) {
        self.draining = true;
        let _ = self.shutdown_tx.send(true);
        let mut clients = self.clients.lock().await;
        info!(
            "Draining {} clients, reconnect in {}s",
            clients.len(),
            delay_seconds
        );
        let reconnect = proto::reconnect_message(delay_seconds);
        for client in clients.live_mut() {
            client.force_cleanup = true;
            client.send(&reconnect);
            client.disconnect();
        }
    }

    /// Stops the listener and retires every connection, waiting at most
    /// `exit_timeout` for each one's I/O tasks.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.take() {
            if tokio::time::timeout(self.config.exit_timeout, task).await.is_err() {
                warn!("Accept task did not stop in time");
            }
        }

        let all = self.clients.lock().await.take_all();
        let count = all.len();
        for pump in all {
            if pump.is_connected() {
                reject(&pump, proto::REASON_SHUTDOWN);
            }
            pump.retire(self.config.exit_timeout).await;
        }
        info!("Server stopped, {} connections closed", count);
    }

    /// Runs the tick loop until Ctrl+C, then drains and shuts down.
    pub async fn run<W, H>(
        mut self,
        world: &mut W,
        hooks: &mut H,
        tick: Duration,
    ) -> Result<(), Box<dyn std::error::Error>>
    where
        W: WorldStore,
        H: ServerHooks<W>,
    {
        let mut tick_interval = interval(tick);
        let mut last_tick = Instant::now();
        let mut ticks: u64 = 0;

        info!("Server started successfully");

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32();
                    last_tick = now;

                    world.step_physics(dt);
                    self.drive(world, hooks).await;
                    ticks += 1;

                    if ticks % 200 == 0 {
                        let clients = self.clients.lock().await;
                        if !clients.is_empty() {
                            debug!(
                                "Tick {}: {} clients, {} pending, {} entities",
                                ticks,
                                clients.len(),
                                clients.pending().len(),
                                world.entity_ids().len()
                            );
                        }
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!("Failed to listen for Ctrl+C: {}", e);
                    }
                    info!("Server shutting down");
                    break;
                }
            }
        }

        self.drain(5).await;
        // Give the outbound tasks a few ticks to flush RECONNECT.
        for _ in 0..5 {
            tick_interval.tick().await;
            self.drive(world, hooks).await;
        }
        self.shutdown().await;
        Ok(())
    }
}

fn remove_player<W, H>(clients: &mut ClientManager, world: &mut W, hooks: &mut H, player_id: u16)
where
    W: WorldStore,
    H: ServerHooks<W>,
{
    if let Some(player) = world.remove_player(player_id) {
        info!("Player {} ({}) removed", player_id, player.name);
        clients.broadcast(&proto::player_remove_message(player_id), false);
        hooks.player_left(world, player_id);
    }
    clients.release_player_id(player_id);
}

async fn accept_loop(
    listener: TcpListener,
    clients: Arc<Mutex<ClientManager>>,
    pump_config: PumpConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_id: u64 = 1;
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed for {}: {}", addr, e);
                    }
                    let pump = ConnectionPump::spawn(stream, addr, ConnectionId(next_id), pump_config.clone());
                    next_id += 1;

                    let mut registry = clients.lock().await;
                    if let Err(pump) = registry.add(pump) {
                        warn!("Server full, refusing {}", addr);
                        reject(&pump, proto::REASON_SERVER_FULL);
                        registry.park(pump);
                    }
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Accept loop stopped");
}
