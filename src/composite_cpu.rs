//! CPU rectangular image copy/blit with resampling and alpha-over
//! compositing, plus element-wise buffer copies. This is the synchronous
//! fallback for kernels that run off-device.

/// Resampling applied when source and destination rects differ in size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SampleMode {
    /// 1:1 copy clamped to source bounds, never resamples.
    #[default]
    Direct,
    Nearest,
    Bilinear,
}

impl SampleMode {
    /// Sample-mode flag as emitted by the kernel generator
    /// (0=direct, 1=nearest, 2=bilinear).
    pub fn from_flag(flag: i32) -> Self {
        match flag {
            1 => SampleMode::Nearest,
            2 => SampleMode::Bilinear,
            _ => SampleMode::Direct,
        }
    }
}

/// A copy rectangle in the form `[x, y, w, h]`. A negative `x` selects the
/// whole image; otherwise coordinates are normalized (`normalized = true`)
/// or absolute pixels.
pub type CopyRect = [f32; 4];

/// Whole-image sentinel rect.
pub const FULL_RECT: CopyRect = [-1.0, -1.0, -1.0, -1.0];

fn resolve_rect(rect: CopyRect, width: usize, height: usize, normalized: bool) -> [i64; 4] {
    let [x, y, w, h] = rect;
    if x < 0.0 {
        return [0, 0, width as i64, height as i64];
    }
    if normalized {
        [
            (x * width as f32).floor() as i64,
            (y * height as f32).floor() as i64,
            (w * width as f32).floor() as i64,
            (h * height as f32).floor() as i64,
        ]
    } else {
        [
            x.floor() as i64,
            y.floor() as i64,
            w.floor() as i64,
            h.floor() as i64,
        ]
    }
}

fn src_pixel(src: &[f32], src_w: usize, src_h: usize, x: i64, y: i64) -> [f32; 4] {
    if src_w == 0 || src_h == 0 {
        return [0.0; 4];
    }
    let cx = x.clamp(0, src_w as i64 - 1) as usize;
    let cy = y.clamp(0, src_h as i64 - 1) as usize;
    let off = (cy * src_w + cx) * 4;
    match src.get(off..off + 4) {
        Some(px) => [px[0], px[1], px[2], px[3]],
        None => [0.0; 4],
    }
}

fn src_bilinear(src: &[f32], src_w: usize, src_h: usize, u: f32, v: f32) -> [f32; 4] {
    let tx = u - 0.5;
    let ty = v - 0.5;
    let x0 = tx.floor() as i64;
    let y0 = ty.floor() as i64;
    let fx = tx - x0 as f32;
    let fy = ty - y0 as f32;
    let s00 = src_pixel(src, src_w, src_h, x0, y0);
    let s10 = src_pixel(src, src_w, src_h, x0 + 1, y0);
    let s01 = src_pixel(src, src_w, src_h, x0, y0 + 1);
    let s11 = src_pixel(src, src_w, src_h, x0 + 1, y0 + 1);
    let mut out = [0.0; 4];
    for c in 0..4 {
        let top = s00[c] * (1.0 - fx) + s10[c] * fx;
        let bot = s01[c] * (1.0 - fx) + s11[c] * fx;
        out[c] = top * (1.0 - fy) + bot * fy;
    }
    out
}

/// Source-over one destination texel in place. `src_a` has already been
/// scaled by the copy's global alpha.
fn over_in_place(dst: &mut [f32], px: [f32; 4], src_a: f32) {
    let dst_a = dst[3];
    let out_a = src_a + dst_a * (1.0 - src_a);
    if out_a < 1e-5 {
        dst[0] = 0.0;
        dst[1] = 0.0;
        dst[2] = 0.0;
    } else {
        for c in 0..3 {
            dst[c] = (px[c] * src_a + dst[c] * dst_a * (1.0 - src_a)) / out_a;
        }
    }
    dst[3] = out_a;
}

/// Copy/blit a rectangle of `src` into `dst`.
///
/// When the resolved rect sizes differ and `mode` requests resampling, each
/// destination pixel maps back into source space; otherwise pixels copy 1:1
/// clamped to the source rect. `alpha >= 1` overwrites, `alpha <= 0` is a
/// no-op, anything between composites source-over-destination.
#[allow(clippy::too_many_arguments)]
pub fn copy_texture(
    src: &[f32],
    src_w: usize,
    src_h: usize,
    dst: &mut [f32],
    dst_w: usize,
    dst_h: usize,
    src_rect: CopyRect,
    dst_rect: CopyRect,
    mode: SampleMode,
    alpha: f32,
    normalized: bool,
) {
    if alpha <= 0.0 {
        return;
    }
    let [sx, sy, sw, sh] = resolve_rect(src_rect, src_w, src_h, normalized);
    let [dx, dy, dw, dh] = resolve_rect(dst_rect, dst_w, dst_h, normalized);
    if dw <= 0 || dh <= 0 || sw <= 0 || sh <= 0 {
        return;
    }

    let resample = mode != SampleMode::Direct && (sw != dw || sh != dh);

    for py in 0..dh {
        for px in 0..dw {
            let out_x = dx + px;
            let out_y = dy + py;
            if out_x < 0 || out_x >= dst_w as i64 || out_y < 0 || out_y >= dst_h as i64 {
                continue;
            }

            let pixel = if resample {
                let u = sx as f32 + (px as f32 + 0.5) * sw as f32 / dw as f32;
                let v = sy as f32 + (py as f32 + 0.5) * sh as f32 / dh as f32;
                match mode {
                    SampleMode::Bilinear => src_bilinear(src, src_w, src_h, u, v),
                    _ => src_pixel(src, src_w, src_h, u.floor() as i64, v.floor() as i64),
                }
            } else {
                src_pixel(src, src_w, src_h, sx + px.min(sw - 1), sy + py.min(sh - 1))
            };

            let off = (out_y as usize * dst_w + out_x as usize) * 4;
            let Some(out) = dst.get_mut(off..off + 4) else {
                continue;
            };

            if alpha >= 1.0 {
                out.copy_from_slice(&pixel);
            } else {
                over_in_place(out, pixel, pixel[3] * alpha);
            }
        }
    }
}

/// Copy whole elements (`stride` floats each) between two buffers.
/// `count < 0` copies as many elements as fit in both; partial elements are
/// never read or written.
pub fn copy_buffer(
    src: &[f32],
    dst: &mut [f32],
    stride: usize,
    src_offset: usize,
    dst_offset: usize,
    count: i64,
) {
    let stride = stride.max(1);
    let src_elems = src.len() / stride;
    let dst_elems = dst.len() / stride;
    let from_src = src_elems.saturating_sub(src_offset);
    let to_dst = dst_elems.saturating_sub(dst_offset);
    let mut n = from_src.min(to_dst);
    if count >= 0 {
        n = n.min(count as usize);
    }
    for i in 0..n {
        let s = (src_offset + i) * stride;
        let d = (dst_offset + i) * stride;
        dst[d..d + stride].copy_from_slice(&src[s..s + stride]);
    }
}
