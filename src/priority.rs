//! Priority send scheduling.
//!
//! Online games emit small frequent packets (tens of bytes, dozens per
//! second); downloads emit large rare ones. Without scheduling, one bulky
//! datagram queued ahead of a game tick adds latency where it hurts most.
//!
//! Three bounded levels, classified by payload size:
//!
//! | level  | capacity | gaming mode        | streaming mode      |
//! |--------|----------|--------------------|---------------------|
//! | High   | 512      | <= 256 bytes       | <= 1024 bytes       |
//! | Medium | 256      | <= 1024 bytes      | everything larger   |
//! | Low    | 128      | everything larger  | (unused)            |
//!
//! High always drains first. A Low entry waiting longer than 500 ms jumps
//! ahead of Medium so bulk traffic is never starved outright. When High is
//! full, admission may displace one queued Low (preferred) or Medium entry;
//! the displacement is a recorded drop, not a reorder.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::PriorityMode;
use crate::session::Session;

/// High-level queue capacity.
pub const HIGH_QUEUE_CAPACITY: usize = 512;
/// Medium-level queue capacity.
pub const MEDIUM_QUEUE_CAPACITY: usize = 256;
/// Low-level queue capacity.
pub const LOW_QUEUE_CAPACITY: usize = 128;

/// Payloads up to this size classify as High in gaming mode.
pub const HIGH_MAX_SIZE: usize = 256;
/// Payloads up to this size classify as Medium in gaming mode.
pub const MEDIUM_MAX_SIZE: usize = 1024;

/// Maximum observed wait before a Low entry overtakes Medium.
pub const STARVATION_TIMEOUT: Duration = Duration::from_millis(500);

/// Send-queue level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityLevel {
    /// Games, VoIP, DNS
    High = 0,
    /// Web traffic, medium transfers
    Medium = 1,
    /// Downloads, bulk
    Low = 2,
}

/// A datagram waiting in the send queue.
pub struct PriorityPacket {
    /// Finished wire bytes (already encrypted and wrapped)
    pub data: Bytes,
    /// Level this packet was admitted at
    pub level: PriorityLevel,
    /// Admission time, used by the starvation guard
    pub enqueued_at: Instant,
    /// Session that owns the packet; consulted for the current remote
    /// address at send time
    pub session: Arc<Session>,
}

/// Three-level bounded send queue.
pub struct PriorityQueue {
    queues: [Mutex<VecDeque<PriorityPacket>>; 3],
    capacities: [usize; 3],
    mode: PriorityMode,
    enqueued: [AtomicU64; 3],
    dropped: AtomicU64,
    available: Notify,
}

impl PriorityQueue {
    pub fn new(mode: PriorityMode) -> Self {
        Self {
            queues: [
                Mutex::new(VecDeque::with_capacity(HIGH_QUEUE_CAPACITY)),
                Mutex::new(VecDeque::with_capacity(MEDIUM_QUEUE_CAPACITY)),
                Mutex::new(VecDeque::with_capacity(LOW_QUEUE_CAPACITY)),
            ],
            capacities: [
                HIGH_QUEUE_CAPACITY,
                MEDIUM_QUEUE_CAPACITY,
                LOW_QUEUE_CAPACITY,
            ],
            mode,
            enqueued: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            dropped: AtomicU64::new(0),
            available: Notify::new(),
        }
    }

    /// Classify a payload size under the configured mode.
    pub fn classify(&self, size: usize) -> PriorityLevel {
        match self.mode {
            PriorityMode::Gaming => {
                if size <= HIGH_MAX_SIZE {
                    PriorityLevel::High
                } else if size <= MEDIUM_MAX_SIZE {
                    PriorityLevel::Medium
                } else {
                    PriorityLevel::Low
                }
            }
            PriorityMode::Streaming => {
                // Signalling and media chunks both ride High
                if size <= MEDIUM_MAX_SIZE {
                    PriorityLevel::High
                } else {
                    PriorityLevel::Medium
                }
            }
            PriorityMode::None => PriorityLevel::Medium,
        }
    }

    /// Classify by data size and admit. Returns false when the packet was
    /// dropped.
    pub fn enqueue(&self, data: Bytes, session: &Arc<Session>) -> bool {
        let level = self.classify(data.len());
        self.enqueue_with_level(data, level, session)
    }

    /// Admit at an explicit level.
    pub fn enqueue_with_level(
        &self,
        data: Bytes,
        level: PriorityLevel,
        session: &Arc<Session>,
    ) -> bool {
        let packet = PriorityPacket {
            data,
            level,
            enqueued_at: Instant::now(),
            session: Arc::clone(session),
        };

        let admitted = {
            let mut queue = self.queues[level as usize].lock();
            if queue.len() < self.capacities[level as usize] {
                queue.push_back(packet);
                true
            } else if level == PriorityLevel::High {
                drop(queue);
                self.bump_in(packet)
            } else {
                false
            }
        };

        if admitted {
            self.enqueued[level as usize].fetch_add(1, Ordering::Relaxed);
            self.available.notify_one();
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    /// Admit a High packet into a full queue by displacing the oldest Low
    /// entry (preferred) or the oldest Medium entry. The displaced packet
    /// counts as a drop; aggregate occupancy does not grow. With nothing to
    /// displace, the High packet itself is dropped.
    fn bump_in(&self, packet: PriorityPacket) -> bool {
        let displaced = self.queues[PriorityLevel::Low as usize]
            .lock()
            .pop_front()
            .or_else(|| self.queues[PriorityLevel::Medium as usize].lock().pop_front());
        if displaced.is_none() {
            return false;
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);

        self.queues[PriorityLevel::High as usize]
            .lock()
            .push_back(packet);
        true
    }

    /// Take the next packet to send, or `None` when all levels are empty.
    ///
    /// High drains first. If the Low head has waited past the starvation
    /// timeout it overtakes Medium.
    pub fn dequeue(&self) -> Option<PriorityPacket> {
        if let Some(pkt) = self.queues[PriorityLevel::High as usize].lock().pop_front() {
            return Some(pkt);
        }

        if self.low_is_starving() {
            if let Some(pkt) = self.queues[PriorityLevel::Low as usize].lock().pop_front() {
                return Some(pkt);
            }
        }

        if let Some(pkt) = self.queues[PriorityLevel::Medium as usize].lock().pop_front() {
            return Some(pkt);
        }

        self.queues[PriorityLevel::Low as usize].lock().pop_front()
    }

    /// Wait until a packet is available. Used by the sender task.
    pub async fn dequeue_blocking(&self) -> PriorityPacket {
        loop {
            let notified = self.available.notified();
            if let Some(pkt) = self.dequeue() {
                return pkt;
            }
            notified.await;
        }
    }

    fn low_is_starving(&self) -> bool {
        self.queues[PriorityLevel::Low as usize]
            .lock()
            .front()
            .map(|pkt| pkt.enqueued_at.elapsed() > STARVATION_TIMEOUT)
            .unwrap_or(false)
    }

    /// Point-in-time queue counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            high_depth: self.queues[0].lock().len(),
            medium_depth: self.queues[1].lock().len(),
            low_depth: self.queues[2].lock().len(),
            high_enqueued: self.enqueued[0].load(Ordering::Relaxed),
            medium_enqueued: self.enqueued[1].load(Ordering::Relaxed),
            low_enqueued: self.enqueued[2].load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub high_depth: usize,
    pub medium_depth: usize,
    pub low_depth: usize,
    pub high_enqueued: u64,
    pub medium_enqueued: u64,
    pub low_enqueued: u64,
    pub dropped: u64,
}

impl QueueStats {
    /// Total packets admitted across all levels.
    pub fn total_enqueued(&self) -> u64 {
        self.high_enqueued + self.medium_enqueued + self.low_enqueued
    }
}

/// Sliding-window throughput estimate.
///
/// Advisory telemetry only; not a control input to the scheduler.
pub struct BandwidthEstimator {
    inner: Mutex<EstimatorState>,
}

struct EstimatorState {
    samples: VecDeque<f64>,
    last_measure: Instant,
    bytes_since: u64,
}

/// Samples retained in the sliding window.
const MAX_SAMPLES: usize = 20;

impl BandwidthEstimator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EstimatorState {
                samples: VecDeque::with_capacity(MAX_SAMPLES),
                last_measure: Instant::now(),
                bytes_since: 0,
            }),
        }
    }

    /// Record bytes moved through the tunnel. Rolls a new sample once per
    /// second.
    pub fn record_bytes(&self, n: u64) {
        let mut state = self.inner.lock();
        state.bytes_since += n;

        let elapsed = state.last_measure.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let rate = state.bytes_since as f64 / elapsed.as_secs_f64();
            if state.samples.len() == MAX_SAMPLES {
                state.samples.pop_front();
            }
            state.samples.push_back(rate);
            state.bytes_since = 0;
            state.last_measure = Instant::now();
        }
    }

    /// Mean of the sampled rates, in bytes per second.
    pub fn estimate(&self) -> f64 {
        let state = self.inner.lock();
        if state.samples.is_empty() {
            return 0.0;
        }
        state.samples.iter().sum::<f64>() / state.samples.len() as f64
    }

    /// Whether utilization of `max_bandwidth` exceeds `threshold` (0.0-1.0).
    pub fn is_congested(&self, threshold: f64, max_bandwidth: f64) -> bool {
        if max_bandwidth <= 0.0 {
            return false;
        }
        self.estimate() / max_bandwidth > threshold
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}
