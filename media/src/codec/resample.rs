//! Band-limited sample-rate conversion.
//!
//! Conversion is windowed-sinc interpolation with the cutoff at the lower of
//! the two Nyquist frequencies. When telephony audio is produced from a
//! wideband source (source rate >= 16 kHz, downsampling), the signal is first
//! band-passed to the 300-3400 Hz voice band with a zero-phase Butterworth
//! cascade so nothing above the narrowband channel survives to alias.

use std::borrow::Cow;
use std::f64::consts::PI;

/// Zero crossings of the sinc kernel on each side of the centre tap.
const HALF_TAPS: f64 = 16.0;

const VOICE_LOW_HZ: f64 = 300.0;
const VOICE_HIGH_HZ: f64 = 3400.0;
const BUTTERWORTH_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// Converts mono PCM from `src_rate` to `dst_rate`.
///
/// Output length is `len * dst_rate / src_rate` rounded down. Same-rate
/// input is returned unchanged. Streams converted chunk by chunk go through
/// [`Encoder`](crate::codec::Encoder), which carries the remainder.
///
/// # Example
///
/// ```
/// use media::codec::resample;
///
/// let wideband = vec![0i16; 480]; // 20ms @ 24kHz
/// let narrowband = resample(&wideband, 24000, 8000);
/// assert_eq!(narrowband.len(), 160);
/// ```
pub fn resample(pcm: &[i16], src_rate: u32, dst_rate: u32) -> Vec<i16> {
    // ---
    if src_rate == dst_rate || pcm.is_empty() || src_rate == 0 || dst_rate == 0 {
        return pcm.to_vec();
    }

    let signal: Cow<[f64]> = if dst_rate < src_rate && src_rate >= 16000 {
        Cow::Owned(voice_band_filter(pcm, src_rate))
    } else {
        Cow::Owned(pcm.iter().map(|&s| s as f64).collect())
    };

    sinc_interpolate(&signal, src_rate, dst_rate)
}

fn sinc_interpolate(signal: &[f64], src_rate: u32, dst_rate: u32) -> Vec<i16> {
    // ---
    let ratio = src_rate as f64 / dst_rate as f64;
    let cutoff = (dst_rate as f64 / src_rate as f64).min(1.0);
    let half_width = HALF_TAPS / cutoff;
    let out_len = (signal.len() as u64 * dst_rate as u64 / src_rate as u64) as usize;

    let mut out = Vec::with_capacity(out_len);
    for n in 0..out_len {
        let t = n as f64 * ratio;
        let first = (t - half_width).ceil().max(0.0) as usize;
        let last = ((t + half_width).floor() as usize).min(signal.len() - 1);

        let mut acc = 0.0;
        let mut weight = 0.0;
        for (k, &x) in signal.iter().enumerate().take(last + 1).skip(first) {
            let tau = t - k as f64;
            let h = cutoff * sinc(cutoff * tau) * blackman(tau / half_width);
            acc += x * h;
            weight += h;
        }

        let y = if weight.abs() > 1e-9 { acc / weight } else { 0.0 };
        out.push(y.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }
    out
}

fn sinc(x: f64) -> f64 {
    // ---
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Blackman window over `x` in [-1, 1].
fn blackman(x: f64) -> f64 {
    // ---
    if x.abs() >= 1.0 {
        return 0.0;
    }
    let phase = PI * (x + 1.0);
    0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos()
}

/// Zero-phase 300-3400 Hz band-pass (each section run forward and backward).
fn voice_band_filter(pcm: &[i16], rate: u32) -> Vec<f64> {
    // ---
    let mut signal: Vec<f64> = pcm.iter().map(|&s| s as f64).collect();
    let fs = rate as f64;

    let sections = [
        Biquad::highpass(fs, VOICE_LOW_HZ, BUTTERWORTH_Q),
        Biquad::lowpass(fs, VOICE_HIGH_HZ, BUTTERWORTH_Q),
    ];
    for section in &sections {
        section.clone().run(&mut signal);
        signal.reverse();
        section.clone().run(&mut signal);
        signal.reverse();
    }
    signal
}

/// Second-order IIR section (RBJ cookbook coefficients, normalised by a0).
#[derive(Debug, Clone)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    // ---
    fn lowpass(fs: f64, f0: f64, q: f64) -> Self {
        // ---
        let w0 = 2.0 * PI * f0 / fs;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        Self::normalised(
            (1.0 - cos) / 2.0,
            1.0 - cos,
            (1.0 - cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    fn highpass(fs: f64, f0: f64, q: f64) -> Self {
        // ---
        let w0 = 2.0 * PI * f0 / fs;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        Self::normalised(
            (1.0 + cos) / 2.0,
            -(1.0 + cos),
            (1.0 + cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    fn normalised(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// Transposed direct form II, in place.
    fn run(&mut self, signal: &mut [f64]) {
        // ---
        for x in signal.iter_mut() {
            let input = *x;
            let y = self.b0 * input + self.z1;
            self.z1 = self.b1 * input - self.a1 * y + self.z2;
            self.z2 = self.b2 * input - self.a2 * y;
            *x = y;
        }
    }
}
