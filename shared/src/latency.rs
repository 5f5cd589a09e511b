//! Round-trip time measurement over PING/PONG.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Maximum number of pings in flight at once (ids are a single byte).
pub const MAX_OUTSTANDING_PINGS: usize = 256;

/// Number of samples kept for the rolling statistics.
pub const LATENCY_HISTORY: usize = 120;

/// Tracks outstanding pings and a bounded history of round-trip times.
#[derive(Debug, Clone)]
pub struct PingTracker {
    outstanding: [Option<Instant>; MAX_OUTSTANDING_PINGS],
    history: VecDeque<Duration>,
    capacity: usize,
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new(LATENCY_HISTORY)
    }
}

impl PingTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            outstanding: [None; MAX_OUTSTANDING_PINGS],
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Reserves the smallest unused ping id and records the send time.
    /// Returns `None` when all 256 ids are in flight.
    pub fn send_ping(&mut self, now: Instant) -> Option<u8> {
        let slot = self.outstanding.iter().position(Option::is_none)?;
        self.outstanding[slot] = Some(now);
        Some(slot as u8)
    }

    /// Completes a ping. Unknown or already answered ids are ignored.
    pub fn on_pong(&mut self, id: u8, now: Instant) -> Option<Duration> {
        let sent = self.outstanding[id as usize].take()?;
        let rtt = now.saturating_duration_since(sent);
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(rtt);
        Some(rtt)
    }

    /// Age of the oldest unanswered ping.
    pub fn oldest_outstanding(&self, now: Instant) -> Option<Duration> {
        self.outstanding
            .iter()
            .flatten()
            .map(|sent| now.saturating_duration_since(*sent))
            .max()
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.iter().filter(|s| s.is_some()).count()
    }

    /// Forgets pending pings; used after a reconnect.
    pub fn clear_outstanding(&mut self) {
        self.outstanding = [None; MAX_OUTSTANDING_PINGS];
    }

    pub fn reset(&mut self) {
        self.clear_outstanding();
        self.history.clear();
    }

    pub fn samples(&self) -> usize {
        self.history.len()
    }

    /// Most recent round-trip time in milliseconds.
    pub fn latest(&self) -> f32 {
        self.history
            .back()
            .map(|d| d.as_secs_f32() * 1000.0)
            .unwrap_or(0.0)
    }

    pub fn average(&self) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        let total: f32 = self.history.iter().map(|d| d.as_secs_f32() * 1000.0).sum();
        total / self.history.len() as f32
    }

    pub fn median(&self) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<Duration> = self.history.iter().copied().collect();
        sorted.sort();
        let mid = sorted.len() / 2;
        let ms = |d: Duration| d.as_secs_f32() * 1000.0;
        if sorted.len() % 2 == 0 {
            (ms(sorted[mid - 1]) + ms(sorted[mid])) / 2.0
        } else {
            ms(sorted[mid])
        }
    }
}
