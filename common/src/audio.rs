//! PCM frames exchanged with the AI audio channel.

use std::time::Duration;

/// A chunk of 16-bit signed little-endian PCM.
///
/// This is the only audio representation that crosses the boundary between
/// the media bridge and the AI conversation channel. Frames are always mono.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    // ---
    /// Samples per second
    pub sample_rate: u32,

    /// Channel count (always 1 at the bridge boundary)
    pub channels: u16,

    /// Interleaved 16-bit little-endian samples
    pub data: Vec<u8>,
}

impl AudioFrame {
    // ---
    /// Wraps raw little-endian PCM bytes as a mono frame.
    pub fn new(sample_rate: u32, data: Vec<u8>) -> Self {
        // ---
        Self {
            sample_rate,
            channels: 1,
            data,
        }
    }

    /// Builds a mono frame from samples.
    pub fn from_samples(sample_rate: u32, samples: &[i16]) -> Self {
        // ---
        let mut data = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Self::new(sample_rate, data)
    }

    /// A frame of digital silence lasting `duration`.
    pub fn silence(sample_rate: u32, duration: Duration) -> Self {
        // ---
        let samples = (sample_rate as u128 * duration.as_millis() / 1000) as usize;
        Self::new(sample_rate, vec![0u8; samples * 2])
    }

    /// Decodes the byte buffer into samples. A trailing odd byte is ignored.
    pub fn samples(&self) -> Vec<i16> {
        // ---
        self.data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    /// Number of samples per channel.
    pub fn sample_count(&self) -> usize {
        // ---
        self.data.len() / 2 / self.channels.max(1) as usize
    }

    /// Playout duration of the frame.
    pub fn duration(&self) -> Duration {
        // ---
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.sample_count() as u64 * 1_000_000 / self.sample_rate as u64)
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.data.len() < 2
    }
}
