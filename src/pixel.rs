//! Channel conversion between the CPU representation (f32 in [0,1]) and the
//! device representation (8-bit unorm).

pub fn float_to_unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub fn unorm8_to_float(b: u8) -> f32 {
    f32::from(b) / 255.0
}

/// Convert a float texel slice to tightly packed RGBA8 bytes.
pub fn floats_to_rgba8(data: &[f32]) -> Vec<u8> {
    data.iter().map(|&v| float_to_unorm8(v)).collect()
}

/// Convert tightly packed RGBA8 bytes back to floats.
pub fn rgba8_to_floats(bytes: &[u8], out: &mut [f32]) {
    for (dst, &src) in out.iter_mut().zip(bytes.iter()) {
        *dst = unorm8_to_float(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_idempotent_for_quantized_values() {
        for b in 0..=255u8 {
            let f = unorm8_to_float(b);
            assert_eq!(float_to_unorm8(f), b);
        }
    }

    #[test]
    fn round_trip_within_half_step() {
        for i in 0..=1000 {
            let v = i as f32 / 1000.0;
            let back = unorm8_to_float(float_to_unorm8(v));
            assert!((back - v).abs() <= 0.5 / 255.0 + f32::EPSILON);
        }
    }

    #[test]
    fn out_of_range_values_clamp() {
        assert_eq!(float_to_unorm8(-0.5), 0);
        assert_eq!(float_to_unorm8(1.5), 255);
        assert_eq!(float_to_unorm8(f32::NAN), 0);
    }
}
