//! Integration tests for the replication server and client
//!
//! These tests run a real server on a loopback port and talk to it either
//! through raw sockets or through the client library.

use client::{ClientLink, ClientSession, LinkConfig, NoHooks as ClientNoHooks};
use server::{NoHooks, Server, ServerConfig, ServerHooks};
use shared::session::{self as proto, resync_request};
use shared::{
    tags, EntityState, FrameReassembler, LoginRequest, Message, MemoryWorld, SessionState,
    SmoothingConfig, Tag, WorldStore, DEFAULT_MAX_MESSAGE_SIZE,
};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(3);

/// Gives every player an entity it owns, like the demo server does.
#[derive(Default)]
struct AvatarHooks {
    avatars: Vec<(u16, u32)>,
}

impl ServerHooks<MemoryWorld> for AvatarHooks {
    fn player_joined(&mut self, world: &mut MemoryWorld, player_id: u16) {
        let mut state = EntityState::at([0.0, 0.0, 0.0]);
        state.owner = player_id;
        if let Some(id) = world.spawn(2, "avatar", state) {
            self.avatars.push((player_id, id));
        }
    }

    fn player_left(&mut self, world: &mut MemoryWorld, player_id: u16) {
        if let Some(pos) = self.avatars.iter().position(|(p, _)| *p == player_id) {
            let (_, id) = self.avatars.remove(pos);
            world.despawn(id);
        }
    }
}

struct Harness<H = NoHooks> {
    server: Server,
    world: MemoryWorld,
    hooks: H,
}

impl Harness<NoHooks> {
    async fn start(config: ServerConfig) -> Self {
        Self::with_hooks(config, NoHooks).await
    }
}

impl<H: ServerHooks<MemoryWorld>> Harness<H> {
    async fn with_hooks(config: ServerConfig, hooks: H) -> Self {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            update_interval: Duration::from_millis(10),
            ..config
        };
        let server = Server::bind(config).await.expect("bind loopback");
        Self {
            server,
            world: MemoryWorld::new(),
            hooks,
        }
    }

    fn port(&self) -> u16 {
        self.server.local_addr().port()
    }

    async fn tick(&mut self) {
        self.server.drive(&mut self.world, &mut self.hooks).await;
    }

    /// Ticks the server and lets the client side catch up.
    async fn settle(
        &mut self,
        link: &mut ClientLink,
        session: &mut ClientSession<MemoryWorld>,
        rounds: usize,
    ) {
        for _ in 0..rounds {
            self.tick().await;
            sleep(Duration::from_millis(5)).await;
            session.process(link, &mut ClientNoHooks).await;
        }
    }
}

/// A hand-driven peer speaking the wire format directly.
struct RawPeer {
    stream: TcpStream,
    reassembler: FrameReassembler,
    closed: bool,
}

impl RawPeer {
    async fn connect<H: ServerHooks<MemoryWorld>>(harness: &Harness<H>) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", harness.port()))
            .await
            .expect("connect to server");
        Self {
            stream,
            reassembler: FrameReassembler::new(DEFAULT_MAX_MESSAGE_SIZE),
            closed: false,
        }
    }

    async fn send(&mut self, msg: &Message) {
        self.stream.write_all(msg.as_bytes()).await.unwrap();
    }

    async fn login(&mut self, name: &str, version: &str) {
        let request = LoginRequest {
            game_id: ServerConfig::default().game_id,
            version: version.to_string(),
            name: name.to_string(),
            credentials: String::new(),
        };
        self.send(&request.to_message()).await;
    }

    /// Next message from the server, ticking it while waiting. `None` once
    /// the connection is closed and drained, or on timeout.
    async fn recv<H: ServerHooks<MemoryWorld>>(
        &mut self,
        harness: &mut Harness<H>,
    ) -> Option<Message> {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(msg) = self.reassembler.pop() {
                return Some(msg);
            }
            if self.closed || Instant::now() >= deadline {
                return None;
            }
            harness.tick().await;
            let mut buf = [0u8; 4096];
            match timeout(Duration::from_millis(10), self.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => self.closed = true,
                Ok(Ok(n)) => self.reassembler.feed(&buf[..n]),
                Err(_) => {}
            }
        }
    }

    /// Skips messages until one with `tag` arrives.
    async fn recv_tag<H: ServerHooks<MemoryWorld>>(
        &mut self,
        harness: &mut Harness<H>,
        tag: Tag,
    ) -> Option<Message> {
        while let Some(msg) = self.recv(harness).await {
            if msg.tag() == tag {
                return Some(msg);
            }
        }
        None
    }

    /// Collects every tag that arrives within `window`.
    async fn drain_tags<H: ServerHooks<MemoryWorld>>(
        &mut self,
        harness: &mut Harness<H>,
        window: Duration,
    ) -> Vec<Tag> {
        let until = Instant::now() + window;
        let mut seen = Vec::new();
        while Instant::now() < until && !self.closed {
            harness.tick().await;
            let mut buf = [0u8; 4096];
            match timeout(Duration::from_millis(10), self.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => self.closed = true,
                Ok(Ok(n)) => self.reassembler.feed(&buf[..n]),
                Err(_) => {}
            }
            while let Some(msg) = self.reassembler.pop() {
                seen.push(msg.tag());
            }
        }
        seen
    }

    /// Reads until the server closes the socket.
    async fn wait_closed<H: ServerHooks<MemoryWorld>>(&mut self, harness: &mut Harness<H>) -> bool {
        while self.recv(harness).await.is_some() {}
        self.closed
    }
}

fn version() -> String {
    ServerConfig::default().version
}

fn disconnect_reason(mut msg: Message) -> String {
    msg.next_string().unwrap()
}

fn quiet_smoothing() -> SmoothingConfig {
    SmoothingConfig {
        enabled: false,
        ..SmoothingConfig::default()
    }
}

async fn connected_client<H: ServerHooks<MemoryWorld>>(
    harness: &mut Harness<H>,
    name: &str,
) -> (ClientLink, ClientSession<MemoryWorld>) {
    let mut link = ClientLink::new(LinkConfig::default());
    link.connect("127.0.0.1", harness.port(), name, "")
        .await
        .expect("client connects");
    let mut session = ClientSession::new(MemoryWorld::new(), quiet_smoothing());
    let deadline = Instant::now() + WAIT;
    while link.player_id() == 0 && Instant::now() < deadline {
        harness.settle(&mut link, &mut session, 1).await;
    }
    assert_ne!(link.player_id(), 0, "login reply never arrived");
    (link, session)
}

/// LOGIN AND SESSION TESTS
mod session_tests {
    use super::*;

    /// Tests that a LOGIN is answered with the reply and the full snapshot, in order
    #[tokio::test]
    async fn login_receives_snapshot_in_order() {
        let mut harness = Harness::start(ServerConfig::default()).await;
        harness
            .world
            .globals_mut()
            .insert("motd".to_string(), "hello".to_string());
        harness.world.spawn(1, "drone", EntityState::at([1.0, 2.0, 3.0]));

        let mut peer = RawPeer::connect(&harness).await;
        peer.login("alice", &version()).await;

        let mut reply = peer.recv(&mut harness).await.expect("login reply");
        assert_eq!(reply.tag(), tags::LOGIN);
        let player_id = reply.next_u16().unwrap();
        assert_ne!(player_id, 0);
        assert_eq!(
            SessionState::from_wire(reply.next_u8().unwrap()),
            SessionState::Connected
        );

        let mut info = peer.recv(&mut harness).await.unwrap();
        assert_eq!(info.tag(), tags::INFO);
        let globals = proto::read_properties(&mut info).unwrap();
        assert_eq!(globals.get("motd").map(String::as_str), Some("hello"));

        let mut list = peer.recv(&mut harness).await.unwrap();
        assert_eq!(list.tag(), tags::PLAYER_LIST);
        let players = proto::read_player_list(&mut list).unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].name, "alice");

        assert_eq!(
            peer.recv(&mut harness).await.unwrap().tag(),
            tags::OBJECTS_CLEAR
        );
        let mut objects = peer.recv(&mut harness).await.unwrap();
        assert_eq!(objects.tag(), tags::OBJECTS_ADD);
        let added = proto::read_objects_add(&mut objects).unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].1.label, "drone");
    }

    /// Tests that an incompatible version is refused and the connection closed
    #[tokio::test]
    async fn incompatible_version_is_rejected() {
        let mut harness = Harness::start(ServerConfig::default()).await;
        let mut peer = RawPeer::connect(&harness).await;
        peer.login("bob", "99.0.0").await;

        let msg = peer
            .recv_tag(&mut harness, tags::DISCONNECT)
            .await
            .expect("disconnect");
        assert_eq!(disconnect_reason(msg), proto::REASON_BAD_VERSION);
        assert!(peer.wait_closed(&mut harness).await);
    }

    /// Tests that messages other than LOGIN from an unsynchronized peer end the connection
    #[tokio::test]
    async fn update_before_login_is_rejected() {
        let mut harness = Harness::start(ServerConfig::default()).await;
        let mut peer = RawPeer::connect(&harness).await;
        peer.send(&Message::new(tags::UPDATE)).await;

        let msg = peer
            .recv_tag(&mut harness, tags::DISCONNECT)
            .await
            .expect("disconnect");
        assert_eq!(disconnect_reason(msg), proto::REASON_INVALID_PEER);
        assert!(peer.wait_closed(&mut harness).await);
    }

    /// Tests that a full server turns new connections away
    #[tokio::test]
    async fn full_server_rejects_extra_connection() {
        let mut harness = Harness::start(ServerConfig {
            max_clients: 1,
            ..ServerConfig::default()
        })
        .await;
        let mut first = RawPeer::connect(&harness).await;
        first.login("first", &version()).await;
        first.recv_tag(&mut harness, tags::LOGIN).await.unwrap();

        let mut second = RawPeer::connect(&harness).await;
        let msg = second
            .recv_tag(&mut harness, tags::DISCONNECT)
            .await
            .expect("disconnect");
        assert_eq!(disconnect_reason(msg), proto::REASON_SERVER_FULL);
    }

    /// Tests that a graceful DISCONNECT removes the player without waiting for the grace window
    #[tokio::test]
    async fn graceful_disconnect_announces_removal() {
        let mut harness = Harness::start(ServerConfig {
            grace_period: Duration::from_secs(60),
            ..ServerConfig::default()
        })
        .await;
        let mut observer = RawPeer::connect(&harness).await;
        observer.login("observer", &version()).await;
        observer.recv_tag(&mut harness, tags::LOGIN).await.unwrap();

        let mut leaver = RawPeer::connect(&harness).await;
        leaver.login("leaver", &version()).await;
        let mut reply = leaver.recv_tag(&mut harness, tags::LOGIN).await.unwrap();
        let leaver_id = reply.next_u16().unwrap();

        let mut added = observer
            .recv_tag(&mut harness, tags::PLAYER_ADD)
            .await
            .unwrap();
        assert_eq!(added.next_u16().unwrap(), leaver_id);

        leaver.send(&proto::disconnect_message("bye")).await;
        drop(leaver);

        let mut removed = observer
            .recv_tag(&mut harness, tags::PLAYER_REMOVE)
            .await
            .expect("removal announced");
        assert_eq!(removed.next_u16().unwrap(), leaver_id);
        assert!(harness.world.player(leaver_id).is_none());
    }
}

/// STATE REPLICATION TESTS
mod replication_tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    /// Tests that a client's world mirrors server entities and follows their updates
    #[tokio::test]
    async fn client_world_follows_server_updates() {
        let mut harness = Harness::start(ServerConfig::default()).await;
        let drone = harness
            .world
            .spawn(1, "drone", EntityState::at([10.0, 0.0, -4.0]))
            .unwrap();

        let (mut link, mut session) = connected_client(&mut harness, "watcher").await;
        harness.settle(&mut link, &mut session, 3).await;
        assert!(session.world().entity(drone).is_some());

        let mut moved = *harness.world.entity(drone).unwrap();
        moved.position = [250.0, 5.0, 12.5];
        harness.world.apply_entity(drone, moved);
        harness.settle(&mut link, &mut session, 10).await;

        let seen = session.world().entity(drone).unwrap();
        assert_approx_eq!(seen.position[0], 250.0);
        assert_approx_eq!(seen.position[1], 5.0);
        assert_approx_eq!(seen.position[2], 12.5);
    }

    /// Tests that entities appearing and vanishing on the server are announced
    #[tokio::test]
    async fn spawned_and_despawned_entities_are_announced() {
        let mut harness = Harness::start(ServerConfig::default()).await;
        let (mut link, mut session) = connected_client(&mut harness, "watcher").await;
        harness.settle(&mut link, &mut session, 2).await;

        let id = harness
            .world
            .spawn(1, "late", EntityState::at([0.0, 1.0, 0.0]))
            .unwrap();
        harness.settle(&mut link, &mut session, 5).await;
        assert!(session.world().entity(id).is_some());

        harness.world.despawn(id);
        harness.settle(&mut link, &mut session, 5).await;
        assert!(session.world().entity(id).is_none());
    }

    /// Tests that updates for an owned entity are applied by the server
    #[tokio::test]
    async fn owned_entity_updates_reach_server() {
        let mut harness =
            Harness::with_hooks(ServerConfig::default(), AvatarHooks::default()).await;
        let (mut link, mut session) = connected_client(&mut harness, "pilot").await;
        harness.settle(&mut link, &mut session, 3).await;

        let player_id = link.player_id();
        let owned = session.world().entities_owned_by(player_id);
        assert_eq!(owned.len(), 1, "avatar replicated to its owner");
        let avatar = owned[0];

        let mut state = *session.world().entity(avatar).unwrap();
        state.position = [-30.0, 2.0, 8.0];
        session.world_mut().apply_entity(avatar, state);
        assert_eq!(session.send_owned_updates(&mut link).await.unwrap(), 1);
        harness.settle(&mut link, &mut session, 5).await;

        let on_server = harness.world.entity(avatar).unwrap();
        assert_approx_eq!(on_server.position[0], -30.0);
        assert_approx_eq!(on_server.position[2], 8.0);
        assert_eq!(on_server.owner, player_id);
    }

    /// Tests that a client cannot move an entity it does not own
    #[tokio::test]
    async fn foreign_entity_updates_are_ignored() {
        let mut harness = Harness::start(ServerConfig::default()).await;
        let drone = harness
            .world
            .spawn(1, "drone", EntityState::at([1.0, 1.0, 1.0]))
            .unwrap();
        let mut peer = RawPeer::connect(&harness).await;
        peer.login("cheater", &version()).await;
        peer.recv_tag(&mut harness, tags::OBJECTS_ADD).await.unwrap();

        let forged = shared::codec::write_update(
            &[(drone, EntityState::at([900.0, 900.0, 900.0]))],
            shared::Precision::FULL,
            shared::Direction::ToServer,
            &shared::AutoThresholds::CLIENT,
        );
        peer.send(&forged).await;
        peer.drain_tags(&mut harness, Duration::from_millis(100)).await;

        assert_approx_eq!(harness.world.entity(drone).unwrap().position[0], 1.0);
    }
}

/// RESYNCHRONIZATION TESTS
mod resync_tests {
    use super::*;

    /// Tests that a dropped player reclaims its id without others seeing it leave
    #[tokio::test]
    async fn dropped_player_resyncs_without_removal() {
        let mut harness = Harness::start(ServerConfig {
            grace_period: Duration::from_secs(30),
            ..ServerConfig::default()
        })
        .await;
        let mut observer = RawPeer::connect(&harness).await;
        observer.login("observer", &version()).await;
        observer.recv_tag(&mut harness, tags::LOGIN).await.unwrap();

        let mut first = RawPeer::connect(&harness).await;
        first.login("alice", &version()).await;
        let mut reply = first.recv_tag(&mut harness, tags::LOGIN).await.unwrap();
        let alice = reply.next_u16().unwrap();
        observer
            .recv_tag(&mut harness, tags::PLAYER_ADD)
            .await
            .unwrap();

        // Drop the socket without a DISCONNECT.
        drop(first);
        observer
            .drain_tags(&mut harness, Duration::from_millis(100))
            .await;

        let mut second = RawPeer::connect(&harness).await;
        second.send(&resync_request(alice, "alice")).await;
        let mut reply = second
            .recv_tag(&mut harness, tags::LOGIN)
            .await
            .expect("resync accepted");
        assert_eq!(reply.next_u16().unwrap(), alice);
        let mut list = second
            .recv_tag(&mut harness, tags::PLAYER_LIST)
            .await
            .unwrap();
        let players = proto::read_player_list(&mut list).unwrap();
        assert!(players.iter().any(|p| p.id == alice && p.name == "alice"));

        let seen = observer
            .drain_tags(&mut harness, Duration::from_millis(200))
            .await;
        assert!(!seen.contains(&tags::PLAYER_REMOVE));
        assert!(!seen.contains(&tags::PLAYER_ADD));
        assert!(harness.world.player(alice).is_some());
    }

    /// Tests that a resync by name claims a dropped player and outlives its grace window
    #[tokio::test]
    async fn resync_by_name_survives_grace_window() {
        let grace = Duration::from_millis(300);
        let mut harness = Harness::start(ServerConfig {
            grace_period: grace,
            ..ServerConfig::default()
        })
        .await;
        let mut observer = RawPeer::connect(&harness).await;
        observer.login("observer", &version()).await;
        observer.recv_tag(&mut harness, tags::LOGIN).await.unwrap();

        let mut first = RawPeer::connect(&harness).await;
        first.login("alice", &version()).await;
        let mut reply = first.recv_tag(&mut harness, tags::LOGIN).await.unwrap();
        let alice = reply.next_u16().unwrap();
        observer
            .recv_tag(&mut harness, tags::PLAYER_ADD)
            .await
            .unwrap();

        drop(first);
        observer
            .drain_tags(&mut harness, Duration::from_millis(50))
            .await;

        let mut second = RawPeer::connect(&harness).await;
        second.send(&resync_request(0, "alice")).await;
        let mut reply = second
            .recv_tag(&mut harness, tags::LOGIN)
            .await
            .expect("resync by name accepted");
        assert_eq!(reply.next_u16().unwrap(), alice);

        let seen = observer.drain_tags(&mut harness, grace * 3).await;
        assert!(!seen.contains(&tags::PLAYER_REMOVE));
        assert!(harness.world.player(alice).is_some());
        assert!(harness
            .server
            .clients()
            .lock()
            .await
            .find_by_player(alice)
            .is_some());
    }

    /// Tests that a resync after the player was removed fails
    #[tokio::test]
    async fn resync_after_removal_fails() {
        let mut harness = Harness::start(ServerConfig {
            grace_period: Duration::ZERO,
            ..ServerConfig::default()
        })
        .await;
        let mut first = RawPeer::connect(&harness).await;
        first.login("alice", &version()).await;
        let mut reply = first.recv_tag(&mut harness, tags::LOGIN).await.unwrap();
        let alice = reply.next_u16().unwrap();
        drop(first);

        let deadline = Instant::now() + WAIT;
        while harness.world.player(alice).is_some() && Instant::now() < deadline {
            harness.tick().await;
            sleep(Duration::from_millis(5)).await;
        }
        assert!(harness.world.player(alice).is_none());

        let mut second = RawPeer::connect(&harness).await;
        second.send(&resync_request(alice, "alice")).await;
        let msg = second
            .recv_tag(&mut harness, tags::DISCONNECT)
            .await
            .expect("resync refused");
        assert_eq!(disconnect_reason(msg), proto::REASON_RESYNC_FAILED);
    }

    /// Tests that a client link reconnecting with a known id resumes as the same player
    #[tokio::test]
    async fn client_link_reconnect_resumes_player() {
        let mut harness = Harness::start(ServerConfig {
            grace_period: Duration::from_secs(30),
            ..ServerConfig::default()
        })
        .await;
        let (mut link, mut session) = connected_client(&mut harness, "roamer").await;
        let player_id = link.player_id();

        link.close().await;
        harness.settle(&mut link, &mut session, 3).await;
        link.reconnect().await.expect("reconnect");

        let deadline = Instant::now() + WAIT;
        while harness.server.clients().lock().await.find_by_player(player_id).is_none()
            && Instant::now() < deadline
        {
            harness.settle(&mut link, &mut session, 1).await;
        }
        assert_eq!(link.player_id(), player_id);
        assert!(harness.world.player(player_id).is_some());
        assert_eq!(harness.world.player_count(), 1);
    }
}

/// CONNECTION BEHAVIOR TESTS
mod connection_tests {
    use super::*;

    /// Tests that a frame declaring an oversized length tears the connection down
    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let mut harness = Harness::start(ServerConfig::default()).await;
        let mut peer = RawPeer::connect(&harness).await;

        let mut header = Vec::new();
        header.extend_from_slice(&tags::PADDING.to_bytes());
        header.extend_from_slice(&(64u32 * 1024 * 1024).to_be_bytes());
        peer.stream.write_all(&header).await.unwrap();
        peer.stream.write_all(&[0u8; 128]).await.unwrap();

        assert!(peer.wait_closed(&mut harness).await);
    }

    /// Tests that replies come back in the order requests were sent
    #[tokio::test]
    async fn pings_are_answered_in_order() {
        let mut harness = Harness::start(ServerConfig::default()).await;
        let mut peer = RawPeer::connect(&harness).await;
        peer.login("pinger", &version()).await;
        peer.recv_tag(&mut harness, tags::LOGIN).await.unwrap();

        let mut burst = Vec::new();
        for id in 0..50u8 {
            burst.extend_from_slice(proto::ping_message(id).as_bytes());
        }
        peer.stream.write_all(&burst).await.unwrap();

        for expected in 0..50u8 {
            let mut pong = peer
                .recv_tag(&mut harness, tags::PONG)
                .await
                .expect("pong");
            assert_eq!(pong.next_u8().unwrap(), expected);
        }
    }

    /// Tests that both sides measure latency once pings flow
    #[tokio::test]
    async fn ping_round_trip_measured_both_ways() {
        let mut harness = Harness::start(ServerConfig {
            ping_interval: Duration::from_millis(20),
            ..ServerConfig::default()
        })
        .await;
        let (mut link, mut session) = connected_client(&mut harness, "pinger").await;

        link.send_ping().await.unwrap();
        let deadline = Instant::now() + WAIT;
        loop {
            harness.settle(&mut link, &mut session, 1).await;
            let server_samples = harness.server.clients().lock().await.live()[0]
                .latency()
                .samples();
            if (link.latency().samples() > 0 && server_samples > 0) || Instant::now() >= deadline {
                break;
            }
        }
        assert!(link.latency().samples() > 0);
        let clients = harness.server.clients().lock().await;
        assert!(clients.live()[0].latency().samples() > 0);
    }
}

/// SERVER LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    /// Tests that a kicked player is told why and removed promptly
    #[tokio::test]
    async fn kick_sends_reason_and_removes_player() {
        let mut harness = Harness::start(ServerConfig {
            grace_period: Duration::from_secs(60),
            ..ServerConfig::default()
        })
        .await;
        let mut peer = RawPeer::connect(&harness).await;
        peer.login("rowdy", &version()).await;
        let mut reply = peer.recv_tag(&mut harness, tags::LOGIN).await.unwrap();
        let player_id = reply.next_u16().unwrap();

        assert!(harness.server.kick(player_id, "behave").await);
        let msg = peer
            .recv_tag(&mut harness, tags::DISCONNECT)
            .await
            .expect("kick reason");
        assert_eq!(disconnect_reason(msg), "behave");
        assert!(peer.wait_closed(&mut harness).await);

        let deadline = Instant::now() + WAIT;
        while harness.world.player(player_id).is_some() && Instant::now() < deadline {
            harness.tick().await;
            sleep(Duration::from_millis(5)).await;
        }
        assert!(harness.world.player(player_id).is_none());
    }

    /// Tests that draining asks clients to come back later
    #[tokio::test]
    async fn drain_schedules_client_reconnect() {
        let mut harness = Harness::start(ServerConfig::default()).await;
        let (mut link, mut session) = connected_client(&mut harness, "tenant").await;

        harness.server.drain(3).await;
        let deadline = Instant::now() + WAIT;
        while link.reconnect_at().is_none() && Instant::now() < deadline {
            harness.settle(&mut link, &mut session, 1).await;
        }

        assert!(!link.is_connected());
        assert_eq!(link.player_id(), 0);
        assert!(link.reconnect_at().is_some());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    /// Tests that shutdown closes every connection
    #[tokio::test]
    async fn shutdown_closes_connections() {
        let mut harness = Harness::start(ServerConfig::default()).await;
        let mut peer = RawPeer::connect(&harness).await;
        peer.login("stayer", &version()).await;
        peer.recv_tag(&mut harness, tags::LOGIN).await.unwrap();

        let Harness { server, .. } = harness;
        server.shutdown().await;

        let mut buf = [0u8; 4096];
        let mut closed = false;
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            match timeout(Duration::from_millis(50), peer.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => {
                    closed = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(closed);
    }
}
