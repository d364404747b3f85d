//! Per-bridge media statistics.
//!
//! Counters are shared between the receive loop, the outbound sender and the
//! periodic logger, so they are plain atomics. Loss is inferred from gaps in
//! the remote sequence numbers; a packet that fills an earlier gap counts as
//! reordered and is taken back out of the loss count.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// How often a running bridge logs its counters.
pub const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Live counters for one media bridge.
#[derive(Debug)]
pub struct MediaStats {
    // ---
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,

    /// Unparsable datagrams and unnegotiated payload types
    pub packets_dropped: AtomicU64,

    /// Datagrams from an address that is neither learned nor negotiated
    pub unknown_source: AtomicU64,

    pub packets_late: AtomicU64,
    pub packets_lost: AtomicU64,
    pub packets_reordered: AtomicU64,

    /// Decoded frames discarded because the sink fell behind
    pub sink_dropped: AtomicU64,
    pub codec_fallbacks: AtomicU64,

    highest_sequence: Mutex<Option<u16>>,
    start_time: Instant,
}

/// Point-in-time copy of [`MediaStats`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaStatsSnapshot {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_dropped: u64,
    pub unknown_source: u64,
    pub packets_late: u64,
    pub packets_lost: u64,
    pub packets_reordered: u64,
    pub sink_dropped: u64,
    pub codec_fallbacks: u64,
}

impl MediaStats {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            unknown_source: AtomicU64::new(0),
            packets_late: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            packets_reordered: AtomicU64::new(0),
            sink_dropped: AtomicU64::new(0),
            codec_fallbacks: AtomicU64::new(0),
            highest_sequence: Mutex::new(None),
            start_time: Instant::now(),
        }
    }

    /// Records an accepted inbound packet.
    ///
    /// # Arguments
    ///
    /// * `sequence` - RTP sequence number of the packet
    /// * `payload_len` - Payload size in bytes
    ///
    /// Returns `true` if the packet arrived behind the highest sequence seen.
    pub fn record_received(&self, sequence: u16, payload_len: usize) -> bool {
        // ---
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(payload_len as u64, Ordering::Relaxed);

        let mut highest = self.highest_sequence.lock();
        let Some(last) = *highest else {
            *highest = Some(sequence);
            return false;
        };

        let ahead = sequence.wrapping_sub(last);
        if ahead == 0 {
            false
        } else if ahead < 0x8000 {
            // Gap of (ahead - 1) packets
            self.packets_lost
                .fetch_add(ahead as u64 - 1, Ordering::Relaxed);
            *highest = Some(sequence);
            false
        } else {
            self.packets_reordered.fetch_add(1, Ordering::Relaxed);
            let _ = self
                .packets_lost
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
            true
        }
    }

    pub fn record_sent(&self, payload_len: usize) {
        // ---
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MediaStatsSnapshot {
        // ---
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MediaStatsSnapshot {
            packets_received: load(&self.packets_received),
            bytes_received: load(&self.bytes_received),
            packets_sent: load(&self.packets_sent),
            bytes_sent: load(&self.bytes_sent),
            packets_dropped: load(&self.packets_dropped),
            unknown_source: load(&self.unknown_source),
            packets_late: load(&self.packets_late),
            packets_lost: load(&self.packets_lost),
            packets_reordered: load(&self.packets_reordered),
            sink_dropped: load(&self.sink_dropped),
            codec_fallbacks: load(&self.codec_fallbacks),
        }
    }

    /// Returns runtime duration.
    pub fn runtime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Force log current statistics.
    pub fn log(&self) {
        // ---
        let s = self.snapshot();
        info!(
            "RTP stats: rx {} pkts, tx {} pkts, {} dropped, {} unknown source, {} late, {:.2}% loss, {:.2}% reordered",
            s.packets_received,
            s.packets_sent,
            s.packets_dropped,
            s.unknown_source,
            s.packets_late,
            s.loss_percentage(),
            s.reorder_percentage()
        );
    }
}

impl Default for MediaStats {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaStatsSnapshot {
    // ---
    /// Calculates current packet loss percentage.
    pub fn loss_percentage(&self) -> f64 {
        // ---
        let total = self.packets_received + self.packets_lost;
        if total == 0 {
            0.0
        } else {
            (self.packets_lost as f64 / total as f64) * 100.0
        }
    }

    /// Calculates reorder percentage.
    pub fn reorder_percentage(&self) -> f64 {
        // ---
        if self.packets_received == 0 {
            0.0
        } else {
            (self.packets_reordered as f64 / self.packets_received as f64) * 100.0
        }
    }
}
