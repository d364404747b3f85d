//! Block automatic gain control for caller audio.
//!
//! Each decoded block is scaled towards a target RMS. Quiet blocks get more
//! gain, capped per loudness band, and peaks above the knee are compressed
//! before the final clamp.

/// Loudness the gain stage steers towards.
pub const TARGET_RMS: f64 = 4000.0;

const SOFT_KNEE: f64 = 20000.0;
const SOFT_SLOPE: f64 = 0.3;

/// `(rms upper bound, max gain)` bands, quietest first.
const GAIN_BANDS: [(f64, f64); 4] = [(100.0, 25.0), (500.0, 10.0), (1500.0, 5.0), (3000.0, 2.0)];

/// Floor used when computing gain for near-silent blocks.
const MIN_RMS: f64 = 50.0;

pub fn rms(pcm: &[i16]) -> f64 {
    // ---
    if pcm.is_empty() {
        return 0.0;
    }
    let sum: f64 = pcm.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / pcm.len() as f64).sqrt()
}

/// Gain chosen for a block with the given RMS.
pub fn gain_for(block_rms: f64) -> f64 {
    // ---
    for &(bound, max_gain) in &GAIN_BANDS {
        if block_rms < bound {
            return (TARGET_RMS / block_rms.max(MIN_RMS)).min(max_gain);
        }
    }
    1.0
}

/// Applies gain to one block in place and returns the gain used.
pub fn apply(pcm: &mut [i16]) -> f64 {
    // ---
    let gain = gain_for(rms(pcm));
    if (gain - 1.0).abs() < f64::EPSILON {
        return gain;
    }

    for sample in pcm.iter_mut() {
        let mut y = *sample as f64 * gain;
        if y > SOFT_KNEE {
            y = SOFT_KNEE + (y - SOFT_KNEE) * SOFT_SLOPE;
        } else if y < -SOFT_KNEE {
            y = -SOFT_KNEE + (y + SOFT_KNEE) * SOFT_SLOPE;
        }
        *sample = y.clamp(-32767.0, 32767.0) as i16;
    }
    gain
}
