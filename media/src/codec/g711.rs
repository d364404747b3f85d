//! ITU-T G.711 companding.
//!
//! Bit-exact with the reference `g711.c`: A-law quantizes the top 13 bits
//! of a sample, μ-law the top 14 bits with a bias of 0x84. Decoding goes
//! through 256-entry tables computed at compile time.

const SIGN_BIT: u8 = 0x80;
const QUANT_MASK: u8 = 0x0F;
const SEG_SHIFT: u8 = 4;
const SEG_MASK: u8 = 0x70;

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 8159;

/// Segment end points for A-law (13-bit magnitudes).
const SEG_AEND: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

/// Segment end points for μ-law (14-bit magnitudes).
const SEG_UEND: [i32; 8] = [0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF];

/// A-law code for a small negative value; used to pad short payloads.
pub const ALAW_SILENCE: u8 = 0x55;

/// μ-law code for zero.
pub const ULAW_SILENCE: u8 = 0xFF;

static ALAW_TABLE: [i16; 256] = build_alaw_table();
static ULAW_TABLE: [i16; 256] = build_ulaw_table();

const fn alaw_to_linear(code: u8) -> i16 {
    // ---
    let a = code ^ 0x55;
    let mut t = ((a & QUANT_MASK) as i32) << 4;
    let seg = ((a & SEG_MASK) >> SEG_SHIFT) as i32;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }
    if a & SIGN_BIT != 0 {
        t as i16
    } else {
        -t as i16
    }
}

const fn ulaw_to_linear(code: u8) -> i16 {
    // ---
    let u = !code;
    let mut t = (((u & QUANT_MASK) as i32) << 3) + ULAW_BIAS;
    t <<= ((u & SEG_MASK) >> SEG_SHIFT) as i32;
    if u & SIGN_BIT != 0 {
        (ULAW_BIAS - t) as i16
    } else {
        (t - ULAW_BIAS) as i16
    }
}

const fn build_alaw_table() -> [i16; 256] {
    // ---
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = alaw_to_linear(i as u8);
        i += 1;
    }
    table
}

const fn build_ulaw_table() -> [i16; 256] {
    // ---
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = ulaw_to_linear(i as u8);
        i += 1;
    }
    table
}

fn segment(value: i32, ends: &[i32; 8]) -> usize {
    // ---
    ends.iter().position(|&end| value <= end).unwrap_or(8)
}

/// Decodes one A-law byte.
pub fn alaw_decode(code: u8) -> i16 {
    ALAW_TABLE[code as usize]
}

/// Decodes one μ-law byte.
pub fn ulaw_decode(code: u8) -> i16 {
    ULAW_TABLE[code as usize]
}

/// Encodes one sample as A-law.
pub fn alaw_encode(sample: i16) -> u8 {
    // ---
    let mut pcm = (sample as i32) >> 3;
    let mask = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let seg = segment(pcm, &SEG_AEND);
    if seg >= 8 {
        return 0x7F ^ mask;
    }

    let mut aval = (seg as u8) << SEG_SHIFT;
    aval |= if seg < 2 {
        ((pcm >> 1) as u8) & QUANT_MASK
    } else {
        ((pcm >> seg) as u8) & QUANT_MASK
    };
    aval ^ mask
}

/// Encodes one sample as μ-law.
pub fn ulaw_encode(sample: i16) -> u8 {
    // ---
    let mut pcm = (sample as i32) >> 2;
    let mask = if pcm < 0 {
        pcm = -pcm;
        0x7F
    } else {
        0xFF
    };
    pcm = pcm.min(ULAW_CLIP) + (ULAW_BIAS >> 2);

    let seg = segment(pcm, &SEG_UEND);
    if seg >= 8 {
        return 0x7F ^ mask;
    }

    let uval = ((seg as u8) << SEG_SHIFT) | (((pcm >> (seg + 1)) as u8) & QUANT_MASK);
    uval ^ mask
}

pub fn alaw_decode_all(payload: &[u8]) -> Vec<i16> {
    payload.iter().map(|&b| alaw_decode(b)).collect()
}

pub fn ulaw_decode_all(payload: &[u8]) -> Vec<i16> {
    payload.iter().map(|&b| ulaw_decode(b)).collect()
}

pub fn alaw_encode_all(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().map(|&s| alaw_encode(s)).collect()
}

pub fn ulaw_encode_all(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().map(|&s| ulaw_encode(s)).collect()
}
