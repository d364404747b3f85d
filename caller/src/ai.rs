//! The AI audio channel seam and a scripted stand-in for it.
//!
//! The conversation engine itself lives outside this workspace. The
//! orchestrator only needs a duplex PCM stream: caller audio goes in through
//! [`AiAudioChannel::send`], speech comes back through the callback given to
//! [`AiAudioChannel::on_audio`].

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use media::codec::resample;
use parking_lot::Mutex;
use sipbridge_common::AudioFrame;
use std::f32::consts::PI;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Consumer of AI speech.
pub type AudioCallback = Arc<dyn Fn(AudioFrame) + Send + Sync>;

/// Duplex PCM stream to a conversation engine.
pub trait AiAudioChannel: Send + Sync {
    // ---
    /// Delivers decoded caller audio. Must not block.
    fn send(&self, frame: AudioFrame);

    /// Registers where AI speech goes. Called once, after the call connects.
    ///
    /// Dropping the callback signals that the channel has nothing more to
    /// say, which ends the call.
    fn on_audio(&self, callback: AudioCallback);

    /// The call is over.
    fn close(&self) {}
}

/// Test tone: frequency, length and peak amplitude.
pub const TEST_TONE_HZ: f32 = 1000.0;
pub const TEST_TONE_DURATION: Duration = Duration::from_secs(3);
pub const TEST_TONE_AMPLITUDE: f32 = 16000.0;

/// Chunk size handed to the callback.
const CHUNK: Duration = Duration::from_millis(100);

/// Plays a fixed prompt into the call and optionally records the caller.
pub struct ScriptedChannel {
    // ---
    prompt: Vec<i16>,
    sample_rate: u32,
    hang_up_after_prompt: bool,
    record_path: Option<PathBuf>,

    /// Caller audio and its rate
    received: Mutex<(u32, Vec<i16>)>,

    /// Kept while the call should stay up after the prompt
    held: Mutex<Option<AudioCallback>>,
}

impl ScriptedChannel {
    // ---
    /// A channel that plays `prompt` (mono PCM at `sample_rate`).
    pub fn new(prompt: Vec<i16>, sample_rate: u32) -> Self {
        // ---
        Self {
            prompt,
            sample_rate,
            hang_up_after_prompt: false,
            record_path: None,
            received: Mutex::new((0, Vec::new())),
            held: Mutex::new(None),
        }
    }

    /// The 1 kHz test tone at `sample_rate`.
    pub fn test_tone(sample_rate: u32) -> Self {
        Self::new(
            tone(sample_rate, TEST_TONE_HZ, TEST_TONE_DURATION, TEST_TONE_AMPLITUDE),
            sample_rate,
        )
    }

    /// A WAV prompt converted to mono at `sample_rate`.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or has an unsupported format.
    pub fn from_wav<P: AsRef<Path>>(path: P, sample_rate: u32) -> Result<Self> {
        Ok(Self::new(read_prompt(path, sample_rate)?, sample_rate))
    }

    /// Release the callback once the prompt has been queued, ending the call.
    pub fn hang_up_after_prompt(mut self, enabled: bool) -> Self {
        self.hang_up_after_prompt = enabled;
        self
    }

    /// Write caller audio to `path` when the call closes.
    pub fn record_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.record_path = Some(path.into());
        self
    }

    /// Caller samples received so far and their rate.
    pub fn received(&self) -> (u32, Vec<i16>) {
        self.received.lock().clone()
    }

    pub fn prompt_duration(&self) -> Duration {
        // ---
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.prompt.len() as u64 * 1000 / self.sample_rate as u64)
    }
}

impl AiAudioChannel for ScriptedChannel {
    // ---
    fn send(&self, frame: AudioFrame) {
        // ---
        let mut received = self.received.lock();
        received.0 = frame.sample_rate;
        received.1.extend(frame.samples());
    }

    fn on_audio(&self, callback: AudioCallback) {
        // ---
        let per_chunk = (self.sample_rate as u64 * CHUNK.as_millis() as u64 / 1000).max(1) as usize;
        for chunk in self.prompt.chunks(per_chunk) {
            callback(AudioFrame::from_samples(self.sample_rate, chunk));
        }
        info!(
            "Queued {:?} of prompt audio",
            self.prompt_duration()
        );

        if !self.hang_up_after_prompt {
            *self.held.lock() = Some(callback);
        }
    }

    fn close(&self) {
        // ---
        self.held.lock().take();

        let Some(path) = &self.record_path else {
            return;
        };
        let (rate, samples) = self.received();
        if samples.is_empty() {
            warn!("No caller audio to record");
            return;
        }
        match write_wav(path, rate, &samples) {
            Ok(()) => info!(
                "Recorded {} samples of caller audio to {}",
                samples.len(),
                path.display()
            ),
            Err(e) => warn!("Failed to record caller audio: {:#}", e),
        }
    }
}

/// A sine tone.
pub fn tone(sample_rate: u32, frequency: f32, duration: Duration, amplitude: f32) -> Vec<i16> {
    // ---
    let count = (sample_rate as u128 * duration.as_millis() / 1000) as usize;
    (0..count)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (amplitude * (2.0 * PI * frequency * t).sin()) as i16
        })
        .collect()
}

/// Reads a WAV file and converts it to mono PCM at `target_rate`.
///
/// # Arguments
///
/// * `path` - WAV file (16-bit integer or 32-bit float)
/// * `target_rate` - Rate the AI channel produces, usually 24000
///
/// # Errors
///
/// Returns error if:
/// - File cannot be opened
/// - WAV format is invalid
/// - Sample format is unsupported
pub fn read_prompt<P: AsRef<Path>>(path: P, target_rate: u32) -> Result<Vec<i16>> {
    // ---
    let path = path.as_ref();
    let mut reader = WavReader::open(path)
        .with_context(|| format!("failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    info!(
        "Prompt {}: {}Hz, {} channels, {} bits",
        path.display(),
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample
    );

    let raw: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read 16-bit PCM WAV samples")?,

        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read 32-bit float WAV samples")?
            .into_iter()
            .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect(),

        (SampleFormat::Int, bits) => {
            anyhow::bail!("unsupported integer PCM WAV format: {}-bit", bits);
        }

        (SampleFormat::Float, bits) => {
            anyhow::bail!("unsupported float WAV format: {}-bit", bits);
        }
    };

    let mono = if spec.channels > 1 {
        mix_to_mono(&raw, spec.channels as usize)
    } else {
        raw
    };
    Ok(resample(&mono, spec.sample_rate, target_rate))
}

/// Writes mono 16-bit PCM.
///
/// # Errors
///
/// Returns error if the file cannot be created or written.
pub fn write_wav<P: AsRef<Path>>(path: P, sample_rate: u32, samples: &[i16]) -> Result<()> {
    // ---
    let path = path.as_ref();
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize().context("failed to finalize WAV")?;
    Ok(())
}

/// Averages interleaved channels.
fn mix_to_mono(samples: &[i16], channels: usize) -> Vec<i16> {
    // ---
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}
