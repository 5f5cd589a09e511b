//! Per-client connection pump.
//!
//! Each accepted socket gets two tasks: an inbound task that reads raw bytes,
//! reassembles them into messages and queues them for the tick thread, and an
//! outbound task that writes queued messages in FIFO order. The tick thread
//! only ever touches the queues, never the socket.
//!
//! Shutdown is a single idempotent [`ConnectionHandle::disconnect`] that
//! either side may call; the I/O tasks observe it through a watch channel and
//! exit, after which [`ConnectionPump::retire`] joins them.

use log::{debug, trace, warn};
use shared::{FrameReassembler, Message, PingTracker, DEFAULT_MAX_MESSAGE_SIZE};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Server-local identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Socket-level tuning for a pump.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub max_message_size: usize,
    pub read_buffer_size: usize,
    /// Consecutive transient I/O failures tolerated before giving up.
    pub io_retries: u32,
    pub retry_delay: Duration,
    /// Time allowed for queued messages to go out once disconnecting.
    pub flush_timeout: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buffer_size: 4096,
            io_retries: 3,
            retry_delay: Duration::from_millis(5),
            flush_timeout: Duration::from_millis(250),
        }
    }
}

const NOT_DISCONNECTED: u64 = u64::MAX;

#[derive(Debug)]
struct Shared {
    connected: AtomicBool,
    created: Instant,
    /// Milliseconds after `created` at which the connection dropped.
    disconnected_after: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
}

impl Shared {
    fn disconnect(&self) -> bool {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return false;
        }
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.disconnected_after
            .store(elapsed.min(NOT_DISCONNECTED - 1), Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        true
    }
}

/// Cloneable handle for observing or closing a connection from any task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Marks the connection closed and tells its I/O tasks to exit. Only
    /// the first call has any effect; returns whether this call did it.
    pub fn disconnect(&self) -> bool {
        self.shared.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

/// Traffic counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub messages_in: u64,
    pub messages_out: u64,
}

/// Server-side state of one client connection.
#[derive(Debug)]
pub struct ConnectionPump {
    id: ConnectionId,
    addr: SocketAddr,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    inbound: mpsc::UnboundedReceiver<Message>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,

    pub(crate) player_id: u16,
    /// Player id held when the connection dropped, kept so a resync can
    /// still find it. Cleared when a resync reclaims the identity.
    pub(crate) drop_pending_id: u16,
    pub(crate) synchronized: bool,
    pub(crate) name: String,
    pub(crate) accepted_at: Instant,
    pub(crate) last_update: Option<Instant>,
    pub(crate) last_ping: Option<Instant>,
    pub(crate) ping: PingTracker,
    /// Skip the grace window on cleanup (graceful leave, kick).
    pub(crate) force_cleanup: bool,
}

impl ConnectionPump {
    /// Splits `stream` and starts its inbound and outbound tasks.
    pub fn spawn<S>(stream: S, addr: SocketAddr, id: ConnectionId, config: PumpConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            created: Instant::now(),
            disconnected_after: AtomicU64::new(NOT_DISCONNECTED),
            shutdown_tx,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&shared),
            inbound_tx,
            config.clone(),
            shutdown_rx.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            writer,
            Arc::clone(&shared),
            outbound_rx,
            config,
            shutdown_rx,
        ));

        debug!("Connection {:?} from {} started", id, addr);

        Self {
            id,
            addr,
            shared,
            outbound: outbound_tx,
            inbound: inbound_rx,
            reader: Some(reader),
            writer: Some(writer),
            player_id: 0,
            drop_pending_id: 0,
            synchronized: false,
            name: String::new(),
            accepted_at: Instant::now(),
            last_update: None,
            last_ping: None,
            ping: PingTracker::default(),
            force_cleanup: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn player_id(&self) -> u16 {
        self.player_id
    }

    pub fn drop_pending_id(&self) -> u16 {
        self.drop_pending_id
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn latency(&self) -> &PingTracker {
        &self.ping
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn disconnect(&self) -> bool {
        let first = self.shared.disconnect();
        if first {
            debug!("Connection {:?} ({}) disconnecting", self.id, self.addr);
        }
        first
    }

    /// Queues a copy of `message` for the outbound task. Never blocks.
    /// Returns false once the connection is closed.
    pub fn send(&self, message: &Message) -> bool {
        self.send_owned(message.clone())
    }

    pub fn send_owned(&self, message: Message) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.outbound.send(message).is_ok()
    }

    /// Next reassembled message, if any. Never blocks.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.inbound.try_recv().ok()
    }

    /// How long ago the connection dropped, if it has.
    pub fn disconnected_for(&self) -> Option<Duration> {
        let after = self.shared.disconnected_after.load(Ordering::Acquire);
        if after == NOT_DISCONNECTED {
            return None;
        }
        let at = self.shared.created + Duration::from_millis(after);
        Some(at.elapsed())
    }

    /// True once both I/O tasks have exited.
    pub fn io_finished(&self) -> bool {
        let done = |handle: &Option<JoinHandle<()>>| {
            handle.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
        };
        done(&self.reader) && done(&self.writer)
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_in: self.shared.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.shared.bytes_out.load(Ordering::Relaxed),
            messages_in: self.shared.messages_in.load(Ordering::Relaxed),
            messages_out: self.shared.messages_out.load(Ordering::Relaxed),
        }
    }

    /// Disconnects, waits up to `timeout` for both I/O tasks and releases
    /// the queues. A task that does not exit in time is detached and logged;
    /// it keeps its own half of the socket alive until it finishes. Returns
    /// true if both tasks were joined.
    pub async fn retire(mut self, timeout: Duration) -> bool {
        self.disconnect();
        let mut joined = true;
        for (label, handle) in [("inbound", self.reader.take()), ("outbound", self.writer.take())]
        {
            let Some(handle) = handle else { continue };
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Connection {:?} {} task failed: {}", self.id, label, e);
                }
                Err(_) => {
                    warn!(
                        "Connection {:?} {} task did not exit within {:?}, detaching",
                        self.id, label, timeout
                    );
                    joined = false;
                }
            }
        }

        self.inbound.close();
        let mut dropped = 0;
        while self.inbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            trace!(
                "Connection {:?} dropped {} unprocessed messages",
                self.id,
                dropped
            );
        }
        joined
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

async fn read_loop<R>(
    mut reader: R,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<Message>,
    config: PumpConfig,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut reassembler = FrameReassembler::new(config.max_message_size);
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];
    let mut failures = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    trace!("Peer closed the stream");
                    shared.disconnect();
                    break;
                }
                Ok(n) => {
                    failures = 0;
                    shared.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                    reassembler.feed(&buf[..n]);
                    let mut receiver_gone = false;
                    while let Some(message) = reassembler.pop() {
                        shared.messages_in.fetch_add(1, Ordering::Relaxed);
                        if inbound.send(message).is_err() {
                            receiver_gone = true;
                            break;
                        }
                    }
                    if receiver_gone || reassembler.is_failed() {
                        shared.disconnect();
                        break;
                    }
                }
                Err(e) if is_transient(e.kind()) && failures < config.io_retries => {
                    failures += 1;
                    trace!("Transient read error ({}), retry {}", e, failures);
                    tokio::time::sleep(config.retry_delay).await;
                }
                Err(e) => {
                    debug!("Read failed: {}", e);
                    shared.disconnect();
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
}

/// Writes all of `bytes`, retrying transient failures without resending
/// what already went out.
async fn write_message<W>(writer: &mut W, bytes: &[u8], config: &PumpConfig) -> bool
where
    W: AsyncWrite + Unpin,
{
    let mut offset = 0;
    let mut failures = 0;
    while offset < bytes.len() {
        match writer.write(&bytes[offset..]).await {
            Ok(0) => return false,
            Ok(n) => {
                offset += n;
                failures = 0;
            }
            Err(e) if is_transient(e.kind()) && failures < config.io_retries => {
                failures += 1;
                tokio::time::sleep(config.retry_delay).await;
            }
            Err(e) => {
                debug!("Write failed: {}", e);
                return false;
            }
        }
    }
    writer.flush().await.is_ok()
}

async fn write_loop<W>(
    mut writer: W,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    config: PumpConfig,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            next = outbound.recv() => match next {
                Some(message) => {
                    if !write_message(&mut writer, message.as_bytes(), &config).await {
                        shared.disconnect();
                        break;
                    }
                    shared.bytes_out.fetch_add(message.total_length() as u64, Ordering::Relaxed);
                    shared.messages_out.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Best effort: deliver what was queued before the disconnect, such as a
    // DISCONNECT carrying the reason.
    let deadline = tokio::time::Instant::now() + config.flush_timeout;
    while let Ok(message) = outbound.try_recv() {
        let write = write_message(&mut writer, message.as_bytes(), &config);
        match tokio::time::timeout_at(deadline, write).await {
            Ok(true) => {
                shared.bytes_out.fetch_add(message.total_length() as u64, Ordering::Relaxed);
                shared.messages_out.fetch_add(1, Ordering::Relaxed);
            }
            _ => break,
        }
    }
    let _ = tokio::time::timeout(config.flush_timeout, writer.shutdown()).await;
}
