//! G.711 µ-law companding for the peer media track.

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

pub fn encode_sample(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
    let magnitude = (sample as i32).abs().min(CLIP) + BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

pub fn decode_sample(byte: u8) -> i16 {
    let v = !byte;
    let exponent = (v >> 4) & 0x07;
    let mantissa = (v & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if v & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encodes normalized f32 samples to µ-law bytes.
pub fn encode_f32(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|&s| encode_sample((s * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16))
        .collect()
}

/// Decodes µ-law bytes to normalized f32 samples.
pub fn decode_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes.iter().map(|&b| decode_sample(b) as f32 / 32768.0).collect()
}
