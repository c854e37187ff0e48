//! G.711 µ-law companding.
//!
//! The recognition backend and the diagnostic recordings both take 8-bit
//! µ-law, so every linear frame is companded once on the write path.

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

/// Compand one 16-bit linear sample to 8-bit µ-law.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut value = i32::from(sample);
    let sign: u8 = if value < 0 {
        value = -value;
        0x80
    } else {
        0x00
    };
    if value > CLIP {
        value = CLIP;
    }
    value += BIAS;

    let mut exponent = 7u8;
    let mut mask = 0x4000;
    while exponent > 0 && value & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((value >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Compand a whole frame.
pub fn encode_frame(frame: &[i16]) -> Vec<u8> {
    frame.iter().map(|&s| linear_to_ulaw(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_maps_to_ff() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
    }

    #[test]
    fn sign_bit_distinguishes_polarity() {
        let positive = linear_to_ulaw(1000);
        let negative = linear_to_ulaw(-1000);
        assert_eq!(positive & 0x80, 0x80);
        assert_eq!(negative & 0x80, 0x00);
        assert_eq!(positive & 0x7F, negative & 0x7F);
    }

    #[test]
    fn extremes_clip_to_full_scale() {
        assert_eq!(linear_to_ulaw(i16::MAX), linear_to_ulaw(32_635));
        assert_eq!(linear_to_ulaw(i16::MIN), linear_to_ulaw(-32_635));
    }

    #[test]
    fn magnitude_is_monotonic() {
        // Larger magnitudes never decode "quieter" than smaller ones.
        let mut last = 0xFFu8 & 0x7F;
        for sample in [10i16, 100, 500, 2_000, 8_000, 30_000] {
            let code = linear_to_ulaw(sample) & 0x7F;
            assert!(code <= last, "sample {sample} produced code {code:#x}");
            last = code;
        }
    }

    #[test]
    fn encode_frame_is_one_byte_per_sample() {
        let frame = [0i16, 100, -100, 32_000];
        let encoded = encode_frame(&frame);
        assert_eq!(encoded.len(), frame.len());
        assert_eq!(encoded[0], 0xFF);
    }
}
