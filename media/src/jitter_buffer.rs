//! Reorder window for inbound RTP.
//!
//! Packets are held in RTP timestamp order until the buffer reaches its
//! target depth, then released oldest first, one per arrival. Anything older
//! than the last released packet is dropped rather than waited for. When
//! arrivals stop, [`JitterBuffer::flush_idle`] releases the tail.

use sipbridge_common::RtpPacket;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Jitter buffer configuration.
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    // ---
    /// Packets held before playout starts (5 x 20ms = 100ms)
    pub depth_packets: usize,

    /// Hard cap; the oldest packet is evicted beyond this
    pub max_packets: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        // ---
        Self {
            depth_packets: 5,
            max_packets: 50,
        }
    }
}

/// What happened to a packet offered to [`JitterBuffer::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Buffered; `reordered` is set when it landed ahead of a newer packet
    Accepted { reordered: bool },

    /// Older than the playout point
    Late,

    Duplicate,
}

/// Timestamp-ordered jitter buffer.
///
/// # Example
///
/// ```
/// use media::jitter_buffer::{JitterBuffer, JitterBufferConfig};
/// use sipbridge_common::RtpPacket;
///
/// let mut buffer = JitterBuffer::new(JitterBufferConfig {
///     depth_packets: 2,
///     max_packets: 10,
/// });
///
/// buffer.insert(RtpPacket::new(0, 1, 160, 0x1234, vec![0xD5; 160]));
/// assert!(buffer.pop_ready().is_none());
///
/// buffer.insert(RtpPacket::new(0, 0, 0, 0x1234, vec![0xD5; 160]));
/// assert_eq!(buffer.pop_ready().map(|p| p.timestamp), Some(0));
/// ```
pub struct JitterBuffer {
    // ---
    config: JitterBufferConfig,

    /// Pending packets, ascending by timestamp
    buffer: VecDeque<RtpPacket>,

    /// Timestamp of the last packet handed out
    last_played: Option<u32>,

    /// When the most recent packet was accepted
    last_arrival: Option<Instant>,
}

impl JitterBuffer {
    // ---
    pub fn new(config: JitterBufferConfig) -> Self {
        // ---
        Self {
            config,
            buffer: VecDeque::new(),
            last_played: None,
            last_arrival: None,
        }
    }

    /// Inserts a packet in timestamp order.
    pub fn insert(&mut self, packet: RtpPacket) -> InsertOutcome {
        // ---
        if let Some(last) = self.last_played {
            if !timestamp_before(last, packet.timestamp) {
                debug!(
                    "Discarding late packet: ts={} (played up to {})",
                    packet.timestamp, last
                );
                return InsertOutcome::Late;
            }
        }

        if self
            .buffer
            .iter()
            .any(|p| p.timestamp == packet.timestamp && p.sequence == packet.sequence)
        {
            debug!("Discarding duplicate packet: seq={}", packet.sequence);
            return InsertOutcome::Duplicate;
        }

        // First buffered packet that should play after this one
        let insert_pos = self
            .buffer
            .iter()
            .position(|p| {
                timestamp_before(packet.timestamp, p.timestamp)
                    || (p.timestamp == packet.timestamp
                        && sequence_before(packet.sequence, p.sequence))
            })
            .unwrap_or(self.buffer.len());
        let reordered = insert_pos < self.buffer.len();
        self.buffer.insert(insert_pos, packet);
        self.last_arrival = Some(Instant::now());

        if self.buffer.len() > self.config.max_packets {
            warn!("Jitter buffer overflow, dropping oldest packet");
            if let Some(evicted) = self.buffer.pop_front() {
                self.last_played = Some(evicted.timestamp);
            }
        }

        InsertOutcome::Accepted { reordered }
    }

    /// Pops the oldest packet once the buffer holds `depth_packets`.
    pub fn pop_ready(&mut self) -> Option<RtpPacket> {
        // ---
        if self.buffer.len() < self.config.depth_packets.max(1) {
            return None;
        }
        self.pop_oldest()
    }

    /// Releases everything still buffered, oldest first.
    pub fn drain(&mut self) -> Vec<RtpPacket> {
        // ---
        let mut out = Vec::with_capacity(self.buffer.len());
        while let Some(packet) = self.pop_oldest() {
            out.push(packet);
        }
        out
    }

    /// Releases everything buffered once nothing has arrived for `idle`.
    ///
    /// Without this the last `depth_packets - 1` packets of an utterance
    /// would wait for the caller to speak again.
    pub fn flush_idle(&mut self, now: Instant, idle: Duration) -> Vec<RtpPacket> {
        // ---
        match self.last_arrival {
            Some(at) if !self.buffer.is_empty() && now.saturating_duration_since(at) >= idle => {
                debug!("Flushing idle jitter buffer: {:?}", self.status());
                self.drain()
            }
            _ => Vec::new(),
        }
    }

    fn pop_oldest(&mut self) -> Option<RtpPacket> {
        // ---
        let packet = self.buffer.pop_front()?;
        self.last_played = Some(packet.timestamp);
        Some(packet)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current occupancy, as logged on idle flushes.
    pub fn status(&self) -> JitterBufferStatus {
        // ---
        JitterBufferStatus {
            buffered_packets: self.buffer.len(),
            is_primed: self.last_played.is_some(),
            last_played: self.last_played,
        }
    }
}

/// Jitter buffer status for observability.
#[derive(Debug, Clone)]
pub struct JitterBufferStatus {
    pub buffered_packets: usize,
    pub is_primed: bool,
    pub last_played: Option<u32>,
}

/// `true` if timestamp `a` is strictly earlier than `b`, across wraparound.
fn timestamp_before(a: u32, b: u32) -> bool {
    // ---
    let diff = b.wrapping_sub(a);
    diff != 0 && diff < 0x8000_0000
}

fn sequence_before(a: u16, b: u16) -> bool {
    // ---
    let diff = b.wrapping_sub(a);
    diff != 0 && diff < 0x8000
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn make_packet(index: u32) -> RtpPacket {
        RtpPacket::new(0, index as u16, index.wrapping_mul(160), 0x12345678, vec![0xFF; 160])
    }

    fn buffer(depth: usize) -> JitterBuffer {
        JitterBuffer::new(JitterBufferConfig {
            depth_packets: depth,
            max_packets: 10,
        })
    }

    #[test]
    fn test_jitter_buffer_in_order() {
        // ---
        let mut buffer = buffer(1);

        buffer.insert(make_packet(0));
        assert_eq!(buffer.pop_ready().unwrap().sequence, 0);
        buffer.insert(make_packet(1));
        assert_eq!(buffer.pop_ready().unwrap().sequence, 1);
    }

    #[test]
    fn test_jitter_buffer_reordering() {
        // ---
        let mut buffer = buffer(3);

        assert_eq!(buffer.insert(make_packet(0)), InsertOutcome::Accepted { reordered: false });
        assert_eq!(buffer.insert(make_packet(2)), InsertOutcome::Accepted { reordered: false });
        assert!(buffer.pop_ready().is_none());

        // Out of sequence, lands before packet 2
        assert_eq!(buffer.insert(make_packet(1)), InsertOutcome::Accepted { reordered: true });

        assert_eq!(buffer.pop_ready().unwrap().timestamp, 0);
        buffer.insert(make_packet(3));
        assert_eq!(buffer.pop_ready().unwrap().timestamp, 160);
    }

    #[test]
    fn test_drain_is_ascending() {
        // ---
        let mut buffer = buffer(5);
        for i in [4, 0, 3, 1, 2] {
            buffer.insert(make_packet(i));
        }

        let order: Vec<u32> = buffer.drain().iter().map(|p| p.timestamp / 160).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_jitter_buffer_late_packet() {
        // ---
        let mut buffer = buffer(1);

        buffer.insert(make_packet(0));
        buffer.insert(make_packet(1));
        buffer.pop_ready();
        buffer.pop_ready();

        // Packet 0 arrives again after playout moved past it
        assert_eq!(buffer.insert(make_packet(0)), InsertOutcome::Late);
        assert_eq!(buffer.insert(make_packet(1)), InsertOutcome::Late);
    }

    #[test]
    fn test_timestamp_wraparound() {
        // ---
        let mut buffer = buffer(3);
        let near_end = u32::MAX / 160 - 1;

        buffer.insert(make_packet(near_end + 2));
        buffer.insert(make_packet(near_end));
        buffer.insert(make_packet(near_end + 1));

        let order: Vec<u32> = buffer.drain().iter().map(|p| p.timestamp).collect();
        assert_eq!(
            order,
            vec![
                near_end.wrapping_mul(160),
                (near_end + 1).wrapping_mul(160),
                (near_end + 2).wrapping_mul(160)
            ]
        );
    }

    #[test]
    fn test_duplicate_packets() {
        // ---
        let mut buffer = buffer(5);

        buffer.insert(make_packet(0));
        assert_eq!(buffer.insert(make_packet(0)), InsertOutcome::Duplicate);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        // ---
        let mut buffer = JitterBuffer::new(JitterBufferConfig {
            depth_packets: 100,
            max_packets: 3,
        });
        for i in 0..4 {
            buffer.insert(make_packet(i));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.insert(make_packet(0)), InsertOutcome::Late);
        assert_eq!(buffer.drain()[0].timestamp, 160);
    }

    #[test]
    fn test_idle_flush_releases_tail() {
        // ---
        let mut buffer = buffer(5);
        for i in 0..7 {
            buffer.insert(make_packet(i));
            while buffer.pop_ready().is_some() {}
        }
        assert_eq!(buffer.len(), 4);

        let idle = Duration::from_millis(100);
        let now = Instant::now();
        assert!(buffer.flush_idle(now, idle).is_empty());

        let flushed: Vec<u32> = buffer
            .flush_idle(now + idle, idle)
            .iter()
            .map(|p| p.timestamp / 160)
            .collect();
        assert_eq!(flushed, vec![3, 4, 5, 6]);
        assert!(buffer.is_empty());

        // Playout point moved past the flushed packets
        assert_eq!(buffer.insert(make_packet(6)), InsertOutcome::Late);
        assert_eq!(buffer.insert(make_packet(7)), InsertOutcome::Accepted { reordered: false });
    }

    #[test]
    fn test_idle_flush_on_empty_buffer() {
        // ---
        let mut buffer = buffer(5);
        let later = Instant::now() + Duration::from_secs(10);
        assert!(buffer.flush_idle(later, Duration::ZERO).is_empty());
    }

    #[test]
    fn test_buffer_priming() {
        // ---
        let mut buffer = buffer(5);
        for i in 0..4 {
            buffer.insert(make_packet(i));
            assert!(buffer.pop_ready().is_none());
        }
        assert!(!buffer.status().is_primed);

        buffer.insert(make_packet(4));
        assert_eq!(buffer.pop_ready().unwrap().timestamp, 0);
        assert!(buffer.status().is_primed);
    }
}
