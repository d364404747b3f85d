//! ITU-T G.722 sub-band ADPCM at 64 kbit/s.
//!
//! 16 kHz linear PCM is split by a 24-tap QMF into a low band (6-bit
//! ADPCM) and a high band (2-bit ADPCM). Each pair of input samples yields
//! one output byte: `ihigh << 6 | ilow`.
//!
//! Encoder and decoder are stateful. A stream must be driven through a
//! single instance so predictor state stays continuous across packets.

use std::fmt;

/// QMF coefficients (one half of the symmetric 24-tap filter).
const QMF_COEFFS: [i32; 12] = [3, -11, 12, 32, -210, 951, 3876, -805, 362, -156, 53, -11];

/// Low-band quantizer decision levels.
const Q6: [i32; 32] = [
    0, 35, 72, 110, 150, 190, 233, 276, 323, 370, 422, 473, 530, 587, 650, 714, 786, 858, 940,
    1023, 1121, 1219, 1339, 1458, 1612, 1765, 1980, 2195, 2557, 2919, 0, 0,
];

/// Low-band codes for negative differences.
const ILN: [i32; 32] = [
    0, 63, 62, 31, 30, 29, 28, 27, 26, 25, 24, 23, 22, 21, 20, 19, 18, 17, 16, 15, 14, 13, 12,
    11, 10, 9, 8, 7, 6, 5, 4, 0,
];

/// Low-band codes for positive differences.
const ILP: [i32; 32] = [
    0, 61, 60, 59, 58, 57, 56, 55, 54, 53, 52, 51, 50, 49, 48, 47, 46, 45, 44, 43, 42, 41, 40,
    39, 38, 37, 36, 35, 34, 33, 32, 0,
];

const WL: [i32; 8] = [-60, -30, 58, 172, 334, 538, 1198, 3042];
const RL42: [i32; 16] = [0, 7, 6, 5, 4, 3, 2, 1, 7, 6, 5, 4, 3, 2, 1, 0];

/// Inverse log table for scale factor adaptation.
const ILB: [i32; 32] = [
    2048, 2093, 2139, 2186, 2233, 2282, 2332, 2383, 2435, 2489, 2543, 2599, 2656, 2714, 2774,
    2834, 2896, 2960, 3025, 3091, 3158, 3228, 3298, 3371, 3444, 3520, 3597, 3676, 3756, 3838,
    3922, 4008,
];

/// 4-bit inverse quantizer used for predictor adaptation.
const QM4: [i32; 16] = [
    0, -20456, -12896, -8968, -6288, -4240, -2584, -1200, 20456, 12896, 8968, 6288, 4240, 2584,
    1200, 0,
];

/// 6-bit inverse quantizer used for low-band reconstruction.
const QM6: [i32; 64] = [
    -136, -136, -136, -136, -24808, -21904, -19008, -16704, -14984, -13512, -12280, -11192,
    -10232, -9360, -8576, -7856, -7192, -6576, -6000, -5456, -4944, -4464, -4008, -3576, -3168,
    -2776, -2400, -2032, -1688, -1360, -1040, -728, 24808, 21904, 19008, 16704, 14984, 13512,
    12280, 11192, 10232, 9360, 8576, 7856, 7192, 6576, 6000, 5456, 4944, 4464, 4008, 3576, 3168,
    2776, 2400, 2032, 1688, 1360, 1040, 728, 432, 136, -432, -136,
];

const IHN: [i32; 3] = [0, 1, 0];
const IHP: [i32; 3] = [0, 3, 2];
const WH: [i32; 3] = [0, -214, 798];
const RH2: [i32; 4] = [2, 1, 2, 1];
const QM2: [i32; 4] = [-7408, -1616, 7408, 1616];

/// Input the encoder cannot take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum G722Error {
    /// The encoder consumes samples in pairs.
    OddSampleCount(usize),
}

impl fmt::Display for G722Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            G722Error::OddSampleCount(n) => write!(f, "G.722 needs an even sample count, got {n}"),
        }
    }
}

impl std::error::Error for G722Error {}

fn saturate(x: i32) -> i32 {
    x.clamp(i16::MIN as i32, i16::MAX as i32)
}

/// Adaptive predictor state for one sub-band.
#[derive(Debug, Clone, Default)]
struct Band {
    s: i32,
    sp: i32,
    sz: i32,
    r: [i32; 3],
    a: [i32; 3],
    ap: [i32; 3],
    p: [i32; 3],
    d: [i32; 7],
    b: [i32; 7],
    bp: [i32; 7],
    sg: [i32; 7],
    nb: i32,
    det: i32,
}

impl Band {
    // ---
    fn new(det: i32) -> Self {
        Self {
            det,
            ..Self::default()
        }
    }

    /// Log-domain scale factor update (LOGSCL/LOGSCH + SCALEL/SCALEH).
    fn adapt_scale(&mut self, weight: i32, nb_max: i32, shift_base: i32) {
        // ---
        let nb = ((self.nb * 127) >> 7) + weight;
        self.nb = nb.clamp(0, nb_max);

        let idx = ((self.nb >> 6) & 31) as usize;
        let shift = shift_base - (self.nb >> 11);
        let wd = if shift < 0 {
            ILB[idx] << -shift
        } else {
            ILB[idx] >> shift
        };
        self.det = wd << 2;
    }

    /// Reconstruction and pole/zero predictor adaptation.
    fn update(&mut self, d: i32) {
        // ---
        self.d[0] = d;
        self.r[0] = saturate(self.s + d);
        self.p[0] = saturate(self.sz + d);

        // Second pole coefficient
        for i in 0..3 {
            self.sg[i] = self.p[i] >> 15;
        }
        let wd1 = saturate(self.a[1] << 2);
        let wd2 = if self.sg[0] == self.sg[1] { -wd1 } else { wd1 };
        let wd2 = wd2.min(32767);
        let mut wd3 = if self.sg[0] == self.sg[2] { 128 } else { -128 };
        wd3 += wd2 >> 7;
        wd3 += (self.a[2] * 32512) >> 15;
        self.ap[2] = wd3.clamp(-12288, 12288);

        // First pole coefficient
        self.sg[0] = self.p[0] >> 15;
        self.sg[1] = self.p[1] >> 15;
        let wd1 = if self.sg[0] == self.sg[1] { 192 } else { -192 };
        let wd2 = (self.a[1] * 32640) >> 15;
        let limit = saturate(15360 - self.ap[2]);
        self.ap[1] = saturate(wd1 + wd2).clamp(-limit, limit);

        // Zero coefficients
        let step = if d == 0 { 0 } else { 128 };
        self.sg[0] = d >> 15;
        for i in 1..7 {
            self.sg[i] = self.d[i] >> 15;
            let wd2 = if self.sg[i] == self.sg[0] { step } else { -step };
            let wd3 = (self.b[i] * 32640) >> 15;
            self.bp[i] = saturate(wd2 + wd3);
        }

        // Delay line
        for i in (1..7).rev() {
            self.d[i] = self.d[i - 1];
            self.b[i] = self.bp[i];
        }
        for i in (1..3).rev() {
            self.r[i] = self.r[i - 1];
            self.p[i] = self.p[i - 1];
            self.a[i] = self.ap[i];
        }

        // Pole section output
        let wd1 = (self.a[1] * saturate(self.r[1] + self.r[1])) >> 15;
        let wd2 = (self.a[2] * saturate(self.r[2] + self.r[2])) >> 15;
        self.sp = saturate(wd1 + wd2);

        // Zero section output
        let mut sz = 0;
        for i in (1..7).rev() {
            sz += (self.b[i] * saturate(self.d[i] + self.d[i])) >> 15;
        }
        self.sz = saturate(sz);

        self.s = saturate(self.sp + self.sz);
    }
}

/// Stateful G.722 encoder (16 kHz in, 8 kbyte/s out).
#[derive(Debug, Clone)]
pub struct G722Encoder {
    // ---
    x: [i32; 24],
    low: Band,
    high: Band,
}

impl Default for G722Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl G722Encoder {
    // ---
    pub fn new() -> Self {
        Self {
            x: [0; 24],
            low: Band::new(32),
            high: Band::new(8),
        }
    }

    /// Encodes 16 kHz samples; output has half as many bytes as input samples.
    ///
    /// # Errors
    ///
    /// Returns `G722Error::OddSampleCount` when `pcm` has an odd length.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, G722Error> {
        // ---
        if pcm.len() % 2 != 0 {
            return Err(G722Error::OddSampleCount(pcm.len()));
        }

        let mut out = Vec::with_capacity(pcm.len() / 2);
        for pair in pcm.chunks_exact(2) {
            out.push(self.encode_pair(pair[0] as i32, pair[1] as i32));
        }
        Ok(out)
    }

    fn encode_pair(&mut self, first: i32, second: i32) -> u8 {
        // ---
        // Transmit QMF
        self.x.copy_within(2.., 0);
        self.x[22] = first;
        self.x[23] = second;

        let mut sum_odd = 0;
        let mut sum_even = 0;
        for i in 0..12 {
            sum_odd += self.x[2 * i] * QMF_COEFFS[i];
            sum_even += self.x[2 * i + 1] * QMF_COEFFS[11 - i];
        }
        let xlow = (sum_even + sum_odd) >> 14;
        let xhigh = (sum_even - sum_odd) >> 14;

        // Low band: 6-bit quantizer
        let el = saturate(xlow - self.low.s);
        let magnitude = if el >= 0 { el } else { -(el + 1) };
        let mut i = 1;
        while i < 30 {
            if magnitude < (Q6[i] * self.low.det) >> 12 {
                break;
            }
            i += 1;
        }
        let ilow = if el < 0 { ILN[i] } else { ILP[i] };

        let ril = (ilow >> 2) as usize;
        let dlow = (self.low.det * QM4[ril]) >> 15;
        self.low.adapt_scale(WL[RL42[ril] as usize], 18432, 8);
        self.low.update(dlow);

        // High band: 2-bit quantizer
        let eh = saturate(xhigh - self.high.s);
        let magnitude = if eh >= 0 { eh } else { -(eh + 1) };
        let mih = if magnitude >= (564 * self.high.det) >> 12 { 2 } else { 1 };
        let ihigh = if eh < 0 { IHN[mih] } else { IHP[mih] };

        let dhigh = (self.high.det * QM2[ihigh as usize]) >> 15;
        self.high.adapt_scale(WH[RH2[ihigh as usize] as usize], 22528, 10);
        self.high.update(dhigh);

        ((ihigh << 6) | ilow) as u8
    }
}

/// Stateful G.722 decoder (8 kbyte/s in, 16 kHz out).
#[derive(Debug, Clone)]
pub struct G722Decoder {
    // ---
    x: [i32; 24],
    low: Band,
    high: Band,
}

impl Default for G722Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl G722Decoder {
    // ---
    pub fn new() -> Self {
        Self {
            x: [0; 24],
            low: Band::new(32),
            high: Band::new(8),
        }
    }

    /// Decodes G.722 bytes into 16 kHz samples (two per byte).
    pub fn decode(&mut self, data: &[u8]) -> Vec<i16> {
        // ---
        let mut out = Vec::with_capacity(data.len() * 2);
        for &code in data {
            let (a, b) = self.decode_byte(code);
            out.push(a);
            out.push(b);
        }
        out
    }

    fn decode_byte(&mut self, code: u8) -> (i16, i16) {
        // ---
        let ilow = (code & 0x3F) as usize;
        let ihigh = ((code >> 6) & 0x03) as usize;

        // Low band reconstruction uses the full 6-bit code
        let wd2 = (self.low.det * QM6[ilow]) >> 15;
        let rlow = (self.low.s + wd2).clamp(-16384, 16383);

        // Predictor adaptation uses the truncated 4-bit code
        let ril = ilow >> 2;
        let dlow = (self.low.det * QM4[ril]) >> 15;
        self.low.adapt_scale(WL[RL42[ril] as usize], 18432, 8);
        self.low.update(dlow);

        let dhigh = (self.high.det * QM2[ihigh]) >> 15;
        let rhigh = (dhigh + self.high.s).clamp(-16384, 16383);
        self.high.adapt_scale(WH[RH2[ihigh] as usize], 22528, 10);
        self.high.update(dhigh);

        // Receive QMF
        self.x.copy_within(2.., 0);
        self.x[22] = rlow + rhigh;
        self.x[23] = rlow - rhigh;

        let mut xout1 = 0;
        let mut xout2 = 0;
        for i in 0..12 {
            xout2 += self.x[2 * i] * QMF_COEFFS[i];
            xout1 += self.x[2 * i + 1] * QMF_COEFFS[11 - i];
        }
        (saturate(xout1 >> 11) as i16, saturate(xout2 >> 11) as i16)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn tone(freq: f64, amplitude: f64, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| (amplitude * (i as f64 * 2.0 * std::f64::consts::PI * freq / 16000.0).sin()) as i16)
            .collect()
    }

    fn rms(samples: &[i16]) -> f64 {
        let sum: f64 = samples.iter().map(|&s| (s as f64).powi(2)).sum();
        (sum / samples.len().max(1) as f64).sqrt()
    }

    #[test]
    fn test_output_sizes() {
        // ---
        let mut encoder = G722Encoder::new();
        let mut decoder = G722Decoder::new();

        let encoded = encoder.encode(&vec![0i16; 320]).expect("encode");
        assert_eq!(encoded.len(), 160);
        assert_eq!(decoder.decode(&encoded).len(), 320);
    }

    #[test]
    fn test_odd_length_rejected() {
        // ---
        let mut encoder = G722Encoder::new();
        assert_eq!(encoder.encode(&[1, 2, 3]), Err(G722Error::OddSampleCount(3)));
    }

    #[test]
    fn test_silence_stays_quiet() {
        // ---
        let mut encoder = G722Encoder::new();
        let mut decoder = G722Decoder::new();

        let decoded = decoder.decode(&encoder.encode(&vec![0i16; 1600]).expect("encode"));
        assert!(rms(&decoded) < 50.0, "rms={}", rms(&decoded));
    }

    #[test]
    fn test_tone_energy_survives_roundtrip() {
        // ---
        let mut encoder = G722Encoder::new();
        let mut decoder = G722Decoder::new();

        let input = tone(1000.0, 8000.0, 3200);
        let mut decoded = Vec::new();
        for frame in input.chunks(320) {
            let encoded = encoder.encode(frame).expect("encode");
            decoded.extend(decoder.decode(&encoded));
        }

        // Skip the adaptation period at the start
        let settled_in = rms(&input[1600..]);
        let settled_out = rms(&decoded[1600..]);
        let ratio = settled_out / settled_in;
        assert!((0.7..1.3).contains(&ratio), "energy ratio {ratio}");
    }
}
