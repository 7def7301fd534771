//! CPU-side texture sampling, used by kernels that execute off-device and by
//! the rect compositor when it needs synchronous reads.
//!
//! Mirrors the device sampler semantics, with two additions the device path
//! does not offer: bilinear filtering and mirror addressing.

use crate::resource::WrapMode;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

impl FilterMode {
    /// Filter flag as emitted by the kernel generator (0=nearest, 1=linear).
    pub fn from_flag(flag: i32) -> Self {
        if flag == 1 {
            FilterMode::Linear
        } else {
            FilterMode::Nearest
        }
    }
}

/// Sample a row-major float image at normalized coordinates `(u, v)`.
///
/// `stride` is the number of floats per texel; single-channel storage is
/// replicated to RGB with alpha forced to 1. Out-of-range coordinates are
/// wrapped or clamped, never read out of bounds.
pub fn sample(
    data: &[f32],
    width: usize,
    height: usize,
    stride: usize,
    u: f32,
    v: f32,
    wrap: WrapMode,
    filter: FilterMode,
) -> [f32; 4] {
    if width == 0 || height == 0 {
        return [0.0; 4];
    }
    let (w, h) = (width as i64, height as i64);

    let wu = apply_wrap(u, wrap);
    let wv = apply_wrap(v, wrap);

    match filter {
        FilterMode::Nearest => {
            let x = ((wu * width as f32).floor() as i64).min(w - 1);
            let y = ((wv * height as f32).floor() as i64).min(h - 1);
            texel(data, width, height, stride, x, y, wrap)
        }
        FilterMode::Linear => {
            let tx = wu * width as f32 - 0.5;
            let ty = wv * height as f32 - 0.5;
            let x0 = tx.floor() as i64;
            let y0 = ty.floor() as i64;
            let fx = tx - x0 as f32;
            let fy = ty - y0 as f32;

            let s00 = texel(data, width, height, stride, x0, y0, wrap);
            let s10 = texel(data, width, height, stride, x0 + 1, y0, wrap);
            let s01 = texel(data, width, height, stride, x0, y0 + 1, wrap);
            let s11 = texel(data, width, height, stride, x0 + 1, y0 + 1, wrap);

            let mut out = [0.0; 4];
            for c in 0..4 {
                let top = s00[c] * (1.0 - fx) + s10[c] * fx;
                let bot = s01[c] * (1.0 - fx) + s11[c] * fx;
                out[c] = top * (1.0 - fy) + bot * fy;
            }
            out
        }
    }
}

/// Normalized-space wrap applied before the pixel lookup.
fn apply_wrap(coord: f32, wrap: WrapMode) -> f32 {
    match wrap {
        WrapMode::Clamp => coord.clamp(0.0, 1.0),
        WrapMode::Mirror => {
            let mut c = coord % 2.0;
            if c < 0.0 {
                c += 2.0;
            }
            if c > 1.0 { 2.0 - c } else { c }
        }
        WrapMode::Repeat => coord - coord.floor(),
    }
}

/// Fetch one texel, applying the wrap mode again in pixel space so that
/// bilinear neighbor taps stay in bounds.
fn texel(
    data: &[f32],
    width: usize,
    height: usize,
    stride: usize,
    x: i64,
    y: i64,
    wrap: WrapMode,
) -> [f32; 4] {
    let (w, h) = (width as i64, height as i64);
    let (x, y) = match wrap {
        WrapMode::Clamp => (x.clamp(0, w - 1), y.clamp(0, h - 1)),
        WrapMode::Repeat => (x.rem_euclid(w), y.rem_euclid(h)),
        WrapMode::Mirror => {
            let mx = x.rem_euclid(2 * w);
            let my = y.rem_euclid(2 * h);
            (
                if mx >= w { 2 * w - 1 - mx } else { mx },
                if my >= h { 2 * h - 1 - my } else { my },
            )
        }
    };

    let base = (y as usize * width + x as usize) * stride;
    let mut out = [0.0, 0.0, 0.0, 1.0];
    for c in 0..stride.min(4) {
        if let Some(&v) = data.get(base + c) {
            out[c] = v;
        }
    }
    if stride == 1 {
        out[1] = out[0];
        out[2] = out[0];
        out[3] = 1.0;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2x1 image: left texel red, right texel green.
    fn two_texels() -> Vec<f32> {
        vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]
    }

    fn red_at(data: &[f32], u: f32, wrap: WrapMode, filter: FilterMode) -> f32 {
        sample(data, 2, 1, 4, u, 0.5, wrap, filter)[0]
    }

    #[test]
    fn nearest_and_linear_agree_at_texel_centers() {
        let data = two_texels();
        for (u, expected) in [(0.25, 1.0), (0.75, 0.0)] {
            assert_eq!(red_at(&data, u, WrapMode::Clamp, FilterMode::Nearest), expected);
            assert_eq!(red_at(&data, u, WrapMode::Clamp, FilterMode::Linear), expected);
        }
    }

    #[test]
    fn linear_midpoint_is_arithmetic_mean() {
        let data = two_texels();
        let mid = sample(&data, 2, 1, 4, 0.5, 0.5, WrapMode::Clamp, FilterMode::Linear);
        assert!((mid[0] - 0.5).abs() < 1e-6);
        assert!((mid[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn repeat_wraps_past_one() {
        let data = two_texels();
        let a = red_at(&data, 1.2, WrapMode::Repeat, FilterMode::Nearest);
        let b = red_at(&data, 0.2, WrapMode::Repeat, FilterMode::Nearest);
        assert_eq!(a, b);
    }

    #[test]
    fn clamp_saturates_past_one() {
        let data = two_texels();
        let a = red_at(&data, 1.2, WrapMode::Clamp, FilterMode::Nearest);
        let b = red_at(&data, 1.0, WrapMode::Clamp, FilterMode::Nearest);
        assert_eq!(a, b);
    }

    #[test]
    fn mirror_reflects_past_one() {
        let data = two_texels();
        let a = red_at(&data, 1.2, WrapMode::Mirror, FilterMode::Nearest);
        let b = red_at(&data, 0.8, WrapMode::Mirror, FilterMode::Nearest);
        assert_eq!(a, b);
    }

    #[test]
    fn single_channel_replicates_to_rgb() {
        let data = vec![0.25, 0.75];
        let s = sample(&data, 2, 1, 1, 0.25, 0.5, WrapMode::Clamp, FilterMode::Nearest);
        assert_eq!(s, [0.25, 0.25, 0.25, 1.0]);
    }

    #[test]
    fn empty_image_yields_zero() {
        assert_eq!(
            sample(&[], 0, 0, 4, 0.5, 0.5, WrapMode::Repeat, FilterMode::Nearest),
            [0.0; 4]
        );
    }
}
