//! Client side of a connection: one TCP socket, one inbound task.
//!
//! Outgoing messages are written directly from the caller's task; incoming
//! bytes are reassembled by a background task and queued for
//! [`ClientLink::try_recv`]. Liveness is tracked with PING/PONG, and lost
//! connections can be re-established with the remembered identity.

use log::{debug, info, trace, warn};
use rand::Rng;
use shared::session::{disconnect_message, ping_message, resync_request};
use shared::{FrameReassembler, LoginRequest, Message, PingTracker, DEFAULT_MAX_MESSAGE_SIZE};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("no previous connection to reconnect to")]
    NoTarget,
    #[error("reconnect attempted too soon, retry in {0:?}")]
    RateLimited(Duration),
    #[error("maximum reconnection attempts exhausted")]
    AttemptsExhausted,
}

/// Client link tuning.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub game_id: String,
    pub version: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    /// Tear the link down when a ping has gone unanswered this long.
    pub disconnect_timeout: Duration,
    /// When set (and longer than `disconnect_timeout`), a stalled link first
    /// sends a RESYNC and is only torn down after this long.
    pub resync_timeout: Option<Duration>,
    /// Minimum spacing between reconnection attempts.
    pub min_reconnect_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Relative jitter applied to reconnection delays, 0.0 to 1.0.
    pub reconnect_jitter: f64,
    pub max_message_size: usize,
    pub read_buffer_size: usize,
    pub exit_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            game_id: "replication-demo".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            disconnect_timeout: Duration::from_secs(15),
            resync_timeout: None,
            min_reconnect_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            reconnect_jitter: 0.25,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buffer_size: 4096,
            exit_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Identity {
    host: String,
    port: u16,
    name: String,
    credentials: String,
}

/// Delays between reconnection attempts: exponential, jittered, bounded.
#[derive(Debug)]
pub struct ReconnectSchedule {
    base: Duration,
    max: Duration,
    jitter: f64,
    max_attempts: u32,
    attempts: u32,
    current: Duration,
}

impl ReconnectSchedule {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            base: config.reconnect_delay,
            max: config.max_reconnect_delay,
            jitter: config.reconnect_jitter.clamp(0.0, 1.0),
            max_attempts: config.max_reconnect_attempts,
            attempts: 0,
            current: config.reconnect_delay,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are used up.
    /// The attempt itself is counted by [`ReconnectSchedule::consume`].
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining() == 0 {
            return None;
        }
        let delay = self.current;
        self.current = self.current.mul_f64(2.0).min(self.max);
        Some(self.jittered(delay))
    }

    /// Applies jitter to a delay the server asked for.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay.min(self.max);
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor).min(self.max)
    }

    /// Counts one attempt; false once the budget is spent.
    pub fn consume(&mut self) -> bool {
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.attempts += 1;
        true
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.base;
    }
}

/// What [`ClientLink::maintain`] did this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Idle,
    /// The link stalled and a RESYNC was sent.
    ResyncRequested,
    /// The link was torn down after unanswered pings.
    TimedOut,
    /// A scheduled reconnection opened a new socket.
    Reconnected,
    /// A scheduled reconnection failed; another may follow.
    ReconnectFailed,
}

pub struct ClientLink {
    config: LinkConfig,
    identity: Option<Identity>,
    writer: Option<OwnedWriteHalf>,
    inbound: Option<mpsc::UnboundedReceiver<Message>>,
    reader: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    connected: Arc<AtomicBool>,
    bytes_in: Arc<AtomicU64>,
    bytes_out: u64,
    player_id: u16,
    ping: PingTracker,
    last_ping: Option<Instant>,
    resync_sent: bool,
    schedule: ReconnectSchedule,
    last_attempt: Option<Instant>,
    reconnect_at: Option<Instant>,
}

impl ClientLink {
    pub fn new(config: LinkConfig) -> Self {
        let schedule = ReconnectSchedule::new(&config);
        Self {
            config,
            identity: None,
            writer: None,
            inbound: None,
            reader: None,
            shutdown_tx: None,
            connected: Arc::new(AtomicBool::new(false)),
            bytes_in: Arc::new(AtomicU64::new(0)),
            bytes_out: 0,
            player_id: 0,
            ping: PingTracker::default(),
            last_ping: None,
            resync_sent: false,
            schedule,
            last_attempt: None,
            reconnect_at: None,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Player id assigned by the last LOGIN reply, 0 before that.
    pub fn player_id(&self) -> u16 {
        self.player_id
    }

    pub fn name(&self) -> Option<&str> {
        self.identity.as_ref().map(|identity| identity.name.as_str())
    }

    pub fn latency(&self) -> &PingTracker {
        &self.ping
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// When the next scheduled reconnection attempt is due.
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Opens a connection and sends LOGIN. Any previous connection is closed
    /// and reconnection counters start over.
    pub async fn connect(
        &mut self,
        host: &str,
        port: u16,
        name: &str,
        credentials: &str,
    ) -> Result<(), LinkError> {
        self.identity = Some(Identity {
            host: host.to_string(),
            port,
            name: name.to_string(),
            credentials: credentials.to_string(),
        });
        self.player_id = 0;
        self.schedule.reset();
        self.reconnect_at = None;
        let hello = self.login_message();
        self.open(hello).await
    }

    /// Re-opens the remembered connection. A client that still knows its
    /// player id asks to resync into it; otherwise it logs in afresh.
    pub async fn reconnect(&mut self) -> Result<(), LinkError> {
        let Some(identity) = self.identity.clone() else {
            return Err(LinkError::NoTarget);
        };
        let now = Instant::now();
        if let Some(last) = self.last_attempt {
            let since = now.duration_since(last);
            if since < self.config.min_reconnect_interval {
                return Err(LinkError::RateLimited(
                    self.config.min_reconnect_interval - since,
                ));
            }
        }
        self.last_attempt = Some(now);
        if !self.schedule.consume() {
            return Err(LinkError::AttemptsExhausted);
        }

        let hello = if self.player_id != 0 {
            resync_request(self.player_id, &identity.name)
        } else {
            self.login_message()
        };
        info!(
            "Reconnecting to {}:{} as {} (player {})",
            identity.host, identity.port, identity.name, self.player_id
        );
        self.open(hello).await
    }

    /// Schedules a reconnection `delay` from now, with jitter.
    pub fn schedule_reconnect(&mut self, delay: Duration) {
        let delay = self.schedule.jittered(delay);
        debug!("Reconnection scheduled in {:?}", delay);
        self.reconnect_at = Some(Instant::now() + delay);
    }

    /// Schedules the next attempt of the backoff sequence. Returns false
    /// once attempts are exhausted.
    pub fn schedule_backoff(&mut self) -> bool {
        match self.schedule.next_delay() {
            Some(delay) => {
                debug!(
                    "Reconnection attempt {} in {:?}",
                    self.schedule.attempts() + 1,
                    delay
                );
                self.reconnect_at = Some(Instant::now() + delay);
                true
            }
            None => {
                warn!("{}", LinkError::AttemptsExhausted);
                self.reconnect_at = None;
                false
            }
        }
    }

    pub fn cancel_reconnect(&mut self) {
        self.reconnect_at = None;
    }

    /// Called when the server confirms a login or resync.
    pub fn on_login(&mut self, player_id: u16) {
        self.player_id = player_id;
        self.schedule.reset();
        self.reconnect_at = None;
    }

    /// Forgets the player id so the next reconnection logs in afresh.
    pub fn forget_player(&mut self) {
        self.player_id = 0;
    }

    /// Best effort DISCONNECT carrying `reason`, then local teardown. The
    /// player id is forgotten and no reconnection stays scheduled.
    pub async fn disconnect_nice(&mut self, reason: &str) {
        if self.is_connected() {
            if let Err(e) = self.send(&disconnect_message(reason)).await {
                debug!("Could not send DISCONNECT: {}", e);
            }
        }
        self.close().await;
        self.player_id = 0;
        self.reconnect_at = None;
    }

    /// Writes `message` to the socket, retrying once on failure. A second
    /// failure marks the link disconnected.
    pub async fn send(&mut self, message: &Message) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        let bytes = message.as_bytes();
        let mut offset = 0;
        let mut retried = false;
        while offset < bytes.len() {
            match writer.write(&bytes[offset..]).await {
                Ok(0) => {
                    self.connected.store(false, Ordering::Release);
                    return Err(LinkError::Send(io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => offset += n,
                Err(e) if !retried => {
                    trace!("Write failed ({}), retrying once", e);
                    retried = true;
                }
                Err(e) => {
                    warn!("Write failed: {}", e);
                    self.connected.store(false, Ordering::Release);
                    return Err(LinkError::Send(e));
                }
            }
        }
        self.bytes_out += bytes.len() as u64;
        Ok(())
    }

    /// Next reassembled message, if any. Messages that arrived before a
    /// disconnect remain readable until the next connect.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.inbound.as_mut()?.try_recv().ok()
    }

    /// Sends a PING and returns its id, or `None` if 256 are outstanding.
    pub async fn send_ping(&mut self) -> Result<Option<u8>, LinkError> {
        let now = Instant::now();
        self.last_ping = Some(now);
        let Some(id) = self.ping.send_ping(now) else {
            return Ok(None);
        };
        self.send(&ping_message(id)).await?;
        Ok(Some(id))
    }

    /// Records a PONG; returns the round trip if the id was outstanding.
    pub fn on_pong(&mut self, id: u8) -> Option<Duration> {
        self.ping.on_pong(id, Instant::now())
    }

    /// Periodic upkeep: pings, stall detection and scheduled reconnection.
    pub async fn maintain(&mut self) -> LinkEvent {
        let now = Instant::now();

        if self.is_connected() {
            let ping_due = self
                .last_ping
                .map(|at| now.duration_since(at) >= self.config.ping_interval)
                .unwrap_or(true);
            if ping_due {
                if let Err(e) = self.send_ping().await {
                    debug!("Ping failed: {}", e);
                }
            }

            let stalled = self.ping.oldest_outstanding(now).unwrap_or_default();
            if stalled > self.config.disconnect_timeout {
                match self.config.resync_timeout {
                    Some(limit) if stalled <= limit => {
                        if !self.resync_sent {
                            self.resync_sent = true;
                            warn!("No PONG for {:?}, requesting resync", stalled);
                            let name = self.name().unwrap_or_default().to_string();
                            match self.send(&resync_request(self.player_id, &name)).await {
                                Ok(()) => return LinkEvent::ResyncRequested,
                                Err(e) => {
                                    warn!("Resync request failed ({}), dropping connection", e);
                                    self.close().await;
                                    return LinkEvent::TimedOut;
                                }
                            }
                        }
                    }
                    _ => {
                        warn!("No PONG for {:?}, dropping connection", stalled);
                        self.close().await;
                        return LinkEvent::TimedOut;
                    }
                }
            }
            return LinkEvent::Idle;
        }

        match self.reconnect_at {
            Some(at) if now >= at => {
                self.reconnect_at = None;
                match self.reconnect().await {
                    Ok(()) => LinkEvent::Reconnected,
                    Err(LinkError::RateLimited(wait)) => {
                        self.reconnect_at = Some(now + wait);
                        LinkEvent::Idle
                    }
                    Err(e) => {
                        warn!("Reconnection failed: {}", e);
                        self.schedule_backoff();
                        LinkEvent::ReconnectFailed
                    }
                }
            }
            _ => LinkEvent::Idle,
        }
    }

    /// Tears the connection down locally and waits briefly for the inbound
    /// task. Safe to call when already closed.
    pub async fn close(&mut self) {
        self.connected.store(false, Ordering::Release);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = tokio::time::timeout(self.config.exit_timeout, writer.shutdown()).await;
        }
        if let Some(reader) = self.reader.take() {
            if tokio::time::timeout(self.config.exit_timeout, reader)
                .await
                .is_err()
            {
                warn!(
                    "Inbound task did not exit within {:?}, detaching",
                    self.config.exit_timeout
                );
            }
        }
    }

    fn login_message(&self) -> Message {
        let (name, credentials) = self
            .identity
            .as_ref()
            .map(|identity| (identity.name.clone(), identity.credentials.clone()))
            .unwrap_or_default();
        LoginRequest {
            game_id: self.config.game_id.clone(),
            version: self.config.version.clone(),
            name,
            credentials,
        }
        .to_message()
    }

    async fn open(&mut self, hello: Message) -> Result<(), LinkError> {
        self.close().await;
        let Some(identity) = self.identity.as_ref() else {
            return Err(LinkError::NoTarget);
        };
        let addr = format!("{}:{}", identity.host, identity.port);

        let stream = match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(LinkError::Connect { addr, source }),
            Err(_) => return Err(LinkError::ConnectTimeout(addr)),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        info!("Connected to {}", addr);

        let (reader, writer) = stream.into_split();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        self.reader = Some(tokio::spawn(read_loop(
            reader,
            Arc::clone(&connected),
            Arc::clone(&self.bytes_in),
            inbound_tx,
            self.config.max_message_size,
            self.config.read_buffer_size,
            shutdown_rx,
        )));
        self.writer = Some(writer);
        self.inbound = Some(inbound_rx);
        self.shutdown_tx = Some(shutdown_tx);
        self.connected = connected;
        self.ping.reset();
        self.last_ping = None;
        self.resync_sent = false;

        self.send(&hello).await
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    connected: Arc<AtomicBool>,
    bytes_in: Arc<AtomicU64>,
    inbound: mpsc::UnboundedSender<Message>,
    max_message_size: usize,
    read_buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reassembler = FrameReassembler::new(max_message_size);
    let mut buf = vec![0u8; read_buffer_size.max(1)];
    let mut failures = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("Server closed the connection");
                    break;
                }
                Ok(n) => {
                    failures = 0;
                    bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                    reassembler.feed(&buf[..n]);
                    let mut receiver_gone = false;
                    while let Some(message) = reassembler.pop() {
                        if inbound.send(message).is_err() {
                            receiver_gone = true;
                            break;
                        }
                    }
                    if receiver_gone || reassembler.is_failed() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted && failures < 3 => {
                    failures += 1;
                }
                Err(e) => {
                    debug!("Read failed: {}", e);
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    connected.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::tags;
    use tokio::net::TcpListener;

    fn test_config() -> LinkConfig {
        LinkConfig {
            game_id: "test".to_string(),
            version: "1.0".to_string(),
            min_reconnect_interval: Duration::from_millis(50),
            reconnect_jitter: 0.0,
            ..LinkConfig::default()
        }
    }

    async fn read_one(stream: &mut TcpStream) -> Message {
        let mut reassembler = FrameReassembler::default();
        let mut buf = [0u8; 1024];
        loop {
            if let Some(message) = reassembler.pop() {
                return message;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "link closed");
            reassembler.feed(&buf[..n]);
        }
    }

    #[test]
    fn test_schedule_backs_off_and_exhausts() {
        let config = LinkConfig {
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_millis(350),
            max_reconnect_attempts: 4,
            reconnect_jitter: 0.0,
            ..LinkConfig::default()
        };
        let mut schedule = ReconnectSchedule::new(&config);
        for expected in [100, 200, 350, 350] {
            assert_eq!(schedule.next_delay(), Some(Duration::from_millis(expected)));
            assert!(schedule.consume());
        }
        assert_eq!(schedule.next_delay(), None);
        assert!(!schedule.consume());
        assert_eq!(schedule.remaining(), 0);
        schedule.reset();
        assert_eq!(schedule.remaining(), 4);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = LinkConfig {
            reconnect_jitter: 0.25,
            ..LinkConfig::default()
        };
        let schedule = ReconnectSchedule::new(&config);
        for _ in 0..100 {
            let delay = schedule.jittered(Duration::from_millis(1000));
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[tokio::test]
    async fn test_connect_sends_login() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut link = ClientLink::new(test_config());

        link.connect("127.0.0.1", port, "ada", "secret").await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();

        let mut msg = read_one(&mut server_side).await;
        assert_eq!(msg.tag(), tags::LOGIN);
        let request = LoginRequest::read(&mut msg).unwrap();
        assert_eq!(request.game_id, "test");
        assert_eq!(request.name, "ada");
        assert_eq!(request.credentials, "secret");
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn test_server_close_marks_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut link = ClientLink::new(test_config());
        link.connect("127.0.0.1", port, "ada", "").await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        drop(server_side);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!link.is_connected());
        assert!(matches!(
            link.send(&ping_message(0)).await,
            Err(LinkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_with_player_id_sends_resync() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut link = ClientLink::new(test_config());
        link.connect("127.0.0.1", port, "ada", "").await.unwrap();
        let (first, _) = listener.accept().await.unwrap();
        link.on_login(7);
        drop(first);

        link.reconnect().await.unwrap();
        let (mut second, _) = listener.accept().await.unwrap();
        let mut msg = read_one(&mut second).await;
        assert_eq!(msg.tag(), tags::RESYNC);
        assert_eq!(msg.next_u16(), Ok(7));
        assert_eq!(msg.next_string().unwrap(), "ada");

        assert!(matches!(
            link.reconnect().await,
            Err(LinkError::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn test_direct_reconnects_spend_attempt_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut link = ClientLink::new(LinkConfig {
            min_reconnect_interval: Duration::ZERO,
            max_reconnect_attempts: 2,
            ..test_config()
        });
        link.connect("127.0.0.1", port, "ada", "").await.unwrap();

        link.reconnect().await.unwrap();
        link.reconnect().await.unwrap();
        assert!(matches!(
            link.reconnect().await,
            Err(LinkError::AttemptsExhausted)
        ));

        // A LOGIN reply refills the budget.
        link.on_login(3);
        link.reconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_resync_request_tears_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut link = ClientLink::new(LinkConfig {
            disconnect_timeout: Duration::from_millis(20),
            resync_timeout: Some(Duration::from_secs(10)),
            ..test_config()
        });
        link.connect("127.0.0.1", port, "ada", "").await.unwrap();
        let (_server_side, _) = listener.accept().await.unwrap();
        link.send_ping().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // No writer left, so the RESYNC cannot go out.
        link.writer = None;
        assert_eq!(link.maintain().await, LinkEvent::TimedOut);
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_read_loop_stops_when_receiver_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();
        let (reader, _writer) = client.into_split();

        let connected = Arc::new(AtomicBool::new(true));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(inbound_rx);
        let task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&connected),
            Arc::new(AtomicU64::new(0)),
            inbound_tx,
            DEFAULT_MAX_MESSAGE_SIZE,
            1024,
            shutdown_rx,
        ));

        server_side.write_all(ping_message(1).as_bytes()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("read loop exits")
            .unwrap();
        assert!(!connected.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_reconnect_without_target_fails() {
        let mut link = ClientLink::new(test_config());
        assert!(matches!(link.reconnect().await, Err(LinkError::NoTarget)));
    }

    #[tokio::test]
    async fn test_disconnect_nice_sends_reason() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut link = ClientLink::new(test_config());
        link.connect("127.0.0.1", port, "ada", "").await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();
        assert_eq!(read_one(&mut server_side).await.tag(), tags::LOGIN);

        link.disconnect_nice("bye").await;
        let mut msg = read_one(&mut server_side).await;
        assert_eq!(msg.tag(), tags::DISCONNECT);
        assert_eq!(msg.next_string().unwrap(), "bye");
        assert!(!link.is_connected());
        assert_eq!(link.player_id(), 0);
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut link = ClientLink::new(test_config());
        link.connect("127.0.0.1", port, "ada", "").await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();
        read_one(&mut server_side).await;

        let id = link.send_ping().await.unwrap().unwrap();
        let mut ping = read_one(&mut server_side).await;
        assert_eq!(ping.tag(), tags::PING);
        assert_eq!(ping.next_u8(), Ok(id));
        assert!(link.on_pong(id).is_some());
        assert!(link.on_pong(id).is_none());
        assert_eq!(link.latency().samples(), 1);
    }
}
