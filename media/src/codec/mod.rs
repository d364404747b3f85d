//! Codec Engine: G.711, G.722, resampling and gain control.
//!
//! The sample-level functions are pure. G.722 carries ADPCM predictor state
//! between packets, so the bridge keeps one [`Encoder`] and one [`Decoder`]
//! per call.

pub mod agc;
pub mod g711;
pub mod g722;
pub mod resample;

pub use agc::apply as apply_agc;
pub use resample::resample;

use g722::{G722Decoder, G722Encoder};
use sipbridge_common::{CallError, CallResult};
use std::fmt;
use tracing::warn;

/// RTP clock rate of every supported payload type (G.722 included, RFC 3551).
pub const RTP_CLOCK_RATE: u32 = 8000;

/// Audio payload formats the bridge can put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadCodec {
    Pcmu,
    Pcma,
    G722,
}

impl PayloadCodec {
    // ---
    /// Maps an RTP payload type to a supported codec.
    pub fn from_payload_type(payload_type: u8) -> Option<Self> {
        // ---
        match payload_type {
            0 => Some(Self::Pcmu),
            8 => Some(Self::Pcma),
            9 => Some(Self::G722),
            _ => None,
        }
    }

    /// Picks the first supported payload type from a remote answer.
    ///
    /// Falls back to PCMA when nothing usable was negotiated.
    pub fn negotiate(offered: &[u8]) -> Self {
        // ---
        offered
            .iter()
            .find_map(|&pt| Self::from_payload_type(pt))
            .unwrap_or(Self::Pcma)
    }

    pub fn payload_type(self) -> u8 {
        // ---
        match self {
            Self::Pcmu => 0,
            Self::Pcma => 8,
            Self::G722 => 9,
        }
    }

    /// PCM sample rate the codec consumes and produces.
    pub fn sample_rate(self) -> u32 {
        // ---
        match self {
            Self::G722 => 16000,
            Self::Pcmu | Self::Pcma => 8000,
        }
    }

    /// Encoded bytes per `ptime_ms` of audio (8 bytes per ms for all three).
    pub fn bytes_per_packet(self, ptime_ms: u32) -> usize {
        (RTP_CLOCK_RATE * ptime_ms / 1000) as usize
    }

    /// Filler byte used to pad a short trailing payload.
    pub fn silence_byte(self) -> Option<u8> {
        // ---
        match self {
            Self::Pcmu => Some(g711::ULAW_SILENCE),
            Self::Pcma => Some(g711::ALAW_SILENCE),
            Self::G722 => None,
        }
    }
}

impl fmt::Display for PayloadCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let name = match self {
            Self::Pcmu => "PCMU",
            Self::Pcma => "PCMA",
            Self::G722 => "G722",
        };
        write!(f, "{name}")
    }
}

/// Inbound payload decoder for one call.
#[derive(Debug, Default)]
pub struct Decoder {
    g722: G722Decoder,
}

impl Decoder {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one payload to PCM at `codec.sample_rate()`.
    pub fn decode(&mut self, codec: PayloadCodec, payload: &[u8]) -> Vec<i16> {
        // ---
        match codec {
            PayloadCodec::Pcmu => g711::ulaw_decode_all(payload),
            PayloadCodec::Pcma => g711::alaw_decode_all(payload),
            PayloadCodec::G722 => self.g722.decode(payload),
        }
    }
}

/// Result of encoding one chunk of outbound audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Codec the payload is actually in (PCMA after a fallback)
    pub codec: PayloadCodec,
    pub payload: Vec<u8>,
    pub fell_back: bool,
}

/// Outbound encoder for one call.
///
/// Input arrives in arbitrary chunk sizes. Samples that would not convert to
/// a whole number of codec samples (an even number for G.722) are held back
/// and prepended to the next chunk, so chunk boundaries never lose audio or
/// break the encoder.
#[derive(Debug, Default)]
pub struct Encoder {
    g722: G722Encoder,

    /// Source samples held over from the previous chunk
    carry: Vec<i16>,

    /// Codec and source rate `carry` belongs to
    carry_format: Option<(PayloadCodec, u32)>,
}

impl Encoder {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes PCM that is already at `codec.sample_rate()`.
    ///
    /// # Errors
    ///
    /// Returns `CallError::CodecFallback` when the G.722 encoder rejects
    /// the input.
    pub fn encode_native(&mut self, codec: PayloadCodec, pcm: &[i16]) -> CallResult<Vec<u8>> {
        // ---
        match codec {
            PayloadCodec::Pcmu => Ok(g711::ulaw_encode_all(pcm)),
            PayloadCodec::Pcma => Ok(g711::alaw_encode_all(pcm)),
            PayloadCodec::G722 => self
                .g722
                .encode(pcm)
                .map_err(|e| CallError::CodecFallback(e.to_string())),
        }
    }

    /// Resamples `pcm` from `src_rate` and encodes it as `codec`.
    ///
    /// Up to one resampling block of trailing input is carried into the next
    /// call; a change of codec or source rate discards it.
    ///
    /// A failed G.722 encode is never silent: it is logged and the chunk is
    /// re-encoded as A-law at 8 kHz, with `fell_back` set on the result.
    pub fn encode(&mut self, codec: PayloadCodec, pcm: &[i16], src_rate: u32) -> Encoded {
        // ---
        if self.carry_format != Some((codec, src_rate)) {
            self.carry.clear();
            self.carry_format = Some((codec, src_rate));
        }
        self.carry.extend_from_slice(pcm);

        let block = block_len(codec, src_rate);
        let whole = self.carry.len() - self.carry.len() % block;
        let input: Vec<i16> = self.carry.drain(..whole).collect();
        self.encode_or_fall_back(codec, &input, src_rate)
    }

    fn encode_or_fall_back(&mut self, codec: PayloadCodec, pcm: &[i16], src_rate: u32) -> Encoded {
        // ---
        let native = resample(pcm, src_rate, codec.sample_rate());
        match self.encode_native(codec, &native) {
            Ok(payload) => Encoded {
                codec,
                payload,
                fell_back: false,
            },
            Err(e) => {
                warn!("{} encode failed ({}), substituting PCMA", codec, e);
                let narrow = resample(pcm, src_rate, PayloadCodec::Pcma.sample_rate());
                Encoded {
                    codec: PayloadCodec::Pcma,
                    payload: g711::alaw_encode_all(&narrow),
                    fell_back: true,
                }
            }
        }
    }
}

/// Smallest run of `src_rate` samples that resamples to a whole number of
/// `codec` samples, doubled when G.722 would otherwise get an odd count.
fn block_len(codec: PayloadCodec, src_rate: u32) -> usize {
    // ---
    let pairs = codec == PayloadCodec::G722;
    let dst_rate = codec.sample_rate();
    if src_rate == 0 || src_rate == dst_rate {
        return if pairs { 2 } else { 1 };
    }

    let divisor = gcd(src_rate, dst_rate);
    let (block_in, block_out) = (src_rate / divisor, dst_rate / divisor);
    let block_in = if pairs && block_out % 2 == 1 {
        block_in * 2
    } else {
        block_in
    };
    block_in as usize
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    // ---
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_payload_type_mapping() {
        // ---
        assert_eq!(PayloadCodec::from_payload_type(0), Some(PayloadCodec::Pcmu));
        assert_eq!(PayloadCodec::from_payload_type(8), Some(PayloadCodec::Pcma));
        assert_eq!(PayloadCodec::from_payload_type(9), Some(PayloadCodec::G722));
        assert_eq!(PayloadCodec::from_payload_type(18), None);
        assert_eq!(PayloadCodec::from_payload_type(101), None);
        assert_eq!(PayloadCodec::G722.payload_type(), 9);
    }

    #[test]
    fn test_negotiate_first_supported() {
        // ---
        assert_eq!(PayloadCodec::negotiate(&[18, 0, 8, 101]), PayloadCodec::Pcmu);
        assert_eq!(PayloadCodec::negotiate(&[9, 8]), PayloadCodec::G722);
        assert_eq!(PayloadCodec::negotiate(&[18, 101]), PayloadCodec::Pcma);
        assert_eq!(PayloadCodec::negotiate(&[]), PayloadCodec::Pcma);
    }

    #[test]
    fn test_packet_sizes() {
        // ---
        for codec in [PayloadCodec::Pcmu, PayloadCodec::Pcma, PayloadCodec::G722] {
            assert_eq!(codec.bytes_per_packet(10), 80);
            assert_eq!(codec.bytes_per_packet(20), 160);
        }
    }

    #[test]
    fn test_encode_decode_g711() {
        // ---
        let pcm: Vec<i16> = (0..480).map(|i| ((i % 48) as i16 - 24) * 500).collect();
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();

        let encoded = encoder.encode(PayloadCodec::Pcmu, &pcm, 24000);
        assert_eq!(encoded.codec, PayloadCodec::Pcmu);
        assert_eq!(encoded.payload.len(), 160);
        assert!(!encoded.fell_back);

        assert_eq!(decoder.decode(PayloadCodec::Pcmu, &encoded.payload).len(), 160);
    }

    #[test]
    fn test_g722_sizes() {
        // ---
        let pcm = vec![0i16; 480];
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();

        let encoded = encoder.encode(PayloadCodec::G722, &pcm, 24000);
        assert_eq!(encoded.codec, PayloadCodec::G722);
        assert_eq!(encoded.payload.len(), 160);
        assert_eq!(decoder.decode(PayloadCodec::G722, &encoded.payload).len(), 320);
    }

    #[test]
    fn test_g722_failure_falls_back_to_alaw() {
        // ---
        // 3 samples @ 16kHz is an odd count, which G.722 cannot pack
        let pcm = vec![1000i16, 2000, 3000];
        let mut encoder = Encoder::new();

        assert!(matches!(
            encoder.encode_native(PayloadCodec::G722, &pcm),
            Err(CallError::CodecFallback(_))
        ));

        let encoded = encoder.encode_or_fall_back(PayloadCodec::G722, &pcm, 16000);
        assert!(encoded.fell_back);
        assert_eq!(encoded.codec, PayloadCodec::Pcma);
        assert_eq!(encoded.payload.len(), 1);
    }

    #[test]
    fn test_g722_odd_chunks_stay_g722() {
        // ---
        let mut encoder = Encoder::new();
        let mut total_bytes = 0;

        for len in [482usize, 1001, 2399, 480, 960] {
            let pcm: Vec<i16> = (0..len).map(|i| ((i % 60) as i16 - 30) * 300).collect();
            let encoded = encoder.encode(PayloadCodec::G722, &pcm, 24000);
            assert_eq!(encoded.codec, PayloadCodec::G722, "len {len}");
            assert!(!encoded.fell_back, "len {len}");
            total_bytes += encoded.payload.len();
        }

        // 5322 samples @ 24kHz -> 3548 @ 16kHz -> 1774 bytes
        assert_eq!(total_bytes, 1774);
    }

    #[test]
    fn test_carry_across_chunks() {
        // ---
        let mut encoder = Encoder::new();

        // 24kHz -> 8kHz converts in runs of 3
        assert!(encoder.encode(PayloadCodec::Pcmu, &[0; 2], 24000).payload.is_empty());
        assert_eq!(encoder.encode(PayloadCodec::Pcmu, &[0; 2], 24000).payload.len(), 1);
        assert_eq!(encoder.encode(PayloadCodec::Pcmu, &[0; 5], 24000).payload.len(), 2);

        // A new source rate starts over
        assert_eq!(encoder.encode(PayloadCodec::Pcmu, &[0; 160], 8000).payload.len(), 160);
    }

    #[test]
    fn test_block_len() {
        // ---
        assert_eq!(block_len(PayloadCodec::G722, 24000), 3);
        assert_eq!(block_len(PayloadCodec::G722, 16000), 2);
        assert_eq!(block_len(PayloadCodec::G722, 8000), 1);
        assert_eq!(block_len(PayloadCodec::G722, 44100), 441);
        assert_eq!(block_len(PayloadCodec::Pcmu, 24000), 3);
        assert_eq!(block_len(PayloadCodec::Pcma, 8000), 1);
    }
}
