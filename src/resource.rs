//! Named units of data exchanged between the CPU representation and the
//! device representation.
//!
//! A [`Resource`] is either a flat float buffer or a 2D RGBA image. Internal
//! resources own their backing data; external resources reference an image
//! owned by a foreign graphics context for the duration of one frame and are
//! only ever written through explicit readback.

/// Texture addressing outside [0,1].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WrapMode {
    #[default]
    Repeat,
    Clamp,
    Mirror,
}

impl WrapMode {
    /// Wrap-mode flag as emitted by the kernel generator (0=repeat, 1=clamp,
    /// 2=mirror). Unknown flags fall back to repeat.
    pub fn from_flag(flag: i32) -> Self {
        match flag {
            1 => WrapMode::Clamp,
            2 => WrapMode::Mirror,
            _ => WrapMode::Repeat,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// Flat numeric array; `stride` is the number of floats per logical element.
    Buffer { stride: usize },
    /// 2D RGBA image, 4 floats per texel.
    Image { wrap: WrapMode },
}

impl ResourceKind {
    pub fn stride(&self) -> usize {
        match self {
            ResourceKind::Buffer { stride } => (*stride).max(1),
            ResourceKind::Image { .. } => 4,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ResourceKind::Image { .. })
    }
}

/// An image owned by a foreign graphics context.
///
/// The runtime only assumes the handle is copyable (blit source and
/// destination); it never binds it for device-side writes. The handle is
/// attached fresh each frame and released by `drain`.
#[derive(Debug)]
pub struct ExternalImage {
    texture: wgpu::Texture,
}

impl ExternalImage {
    pub fn new(texture: wgpu::Texture) -> Self {
        Self { texture }
    }

    pub fn width(&self) -> u32 {
        self.texture.width()
    }

    pub fn height(&self) -> u32 {
        self.texture.height()
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.texture.format()
    }

    pub(crate) fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn into_texture(self) -> wgpu::Texture {
        self.texture
    }
}

/// Cached device-writable stand-in for an external image.
///
/// Format is part of the reuse key: a host that swaps the external image's
/// pixel format frame-to-frame gets a fresh staging allocation.
#[derive(Debug)]
pub(crate) struct StagingImage {
    pub texture: wgpu::Texture,
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
}

impl StagingImage {
    pub(crate) fn matches(&self, external: &ExternalImage) -> bool {
        self.width == external.width()
            && self.height == external.height()
            && self.format == external.format()
    }
}

#[derive(Debug)]
pub struct Resource {
    pub(crate) name: String,
    pub(crate) data: Vec<f32>,
    pub(crate) width: usize,
    pub(crate) height: usize,
    pub(crate) kind: ResourceKind,
    pub(crate) external: Option<ExternalImage>,
    /// Persistent device buffer retained across frames (internal buffers only).
    pub(crate) device_buffer: Option<wgpu::Buffer>,
    /// Cached device texture retained across frames (internal images only).
    pub(crate) device_texture: Option<wgpu::Texture>,
    /// Cached staging image (external images only).
    pub(crate) staging: Option<StagingImage>,
}

impl Resource {
    pub fn buffer(name: impl Into<String>, len: usize, stride: usize) -> Self {
        let stride = stride.max(1);
        Self {
            name: name.into(),
            data: vec![0.0; len * stride],
            width: len,
            height: 1,
            kind: ResourceKind::Buffer { stride },
            external: None,
            device_buffer: None,
            device_texture: None,
            staging: None,
        }
    }

    pub fn image(name: impl Into<String>, width: usize, height: usize, wrap: WrapMode) -> Self {
        Self {
            name: name.into(),
            data: vec![0.0; width * height * 4],
            width,
            height,
            kind: ResourceKind::Image { wrap },
            external: None,
            device_buffer: None,
            device_texture: None,
            staging: None,
        }
    }

    /// An image slot backed by a foreign-owned texture. CPU data stays empty;
    /// the handle (or its staging copy) defines the content.
    pub fn external_image(name: impl Into<String>, handle: ExternalImage) -> Self {
        let (w, h) = (handle.width() as usize, handle.height() as usize);
        Self {
            name: name.into(),
            data: Vec::new(),
            width: w,
            height: h,
            kind: ResourceKind::Image {
                wrap: WrapMode::Repeat,
            },
            external: Some(handle),
            device_buffer: None,
            device_texture: None,
            staging: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn is_external(&self) -> bool {
        self.external.is_some()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub(crate) fn element_count(&self) -> usize {
        self.width * self.height
    }

    pub(crate) fn float_len(&self) -> usize {
        self.element_count() * self.kind.stride()
    }

    pub(crate) fn byte_len(&self) -> u64 {
        self.float_len() as u64 * 4
    }

    /// Store a vector at element index `idx` (contiguous floats). Grows the
    /// CPU array if needed. No-op for external resources.
    pub fn store_vec<const N: usize>(&mut self, idx: usize, v: [f32; N]) {
        if self.external.is_some() {
            return;
        }
        let base = idx * N;
        if base + N > self.data.len() {
            self.data.resize(base + N, 0.0);
        }
        self.data[base..base + N].copy_from_slice(&v);
    }

    /// Load a vector from element index `idx`, zero-padded past the end.
    /// External resources yield zeros.
    pub fn load_vec<const N: usize>(&self, idx: usize) -> [f32; N] {
        let mut out = [0.0; N];
        if self.external.is_some() {
            return out;
        }
        let base = idx * N;
        for (i, slot) in out.iter_mut().enumerate() {
            if let Some(&v) = self.data.get(base + i) {
                *slot = v;
            }
        }
        out
    }

    /// Resize the CPU representation. `clear` discards old content; otherwise
    /// values up to the overlap survive. Keeps the length invariant
    /// `data.len() == width * height * stride`.
    pub(crate) fn resize_cpu(&mut self, width: usize, height: usize, clear: bool) {
        self.width = width;
        self.height = height;
        let total = self.float_len();
        if clear {
            self.data.clear();
            self.data.resize(total, 0.0);
        } else {
            self.data.resize(total, 0.0);
        }
    }

    /// Resize and fill the CPU representation with a repeating per-element
    /// pattern, zero-padded to the element stride.
    pub(crate) fn fill_pattern(&mut self, width: usize, height: usize, pattern: &[f32]) {
        self.width = width;
        self.height = height;
        let stride = self.kind.stride();
        let total = self.float_len();
        self.data.clear();
        self.data.resize(total, 0.0);
        for elem in self.data.chunks_exact_mut(stride) {
            for (dst, &src) in elem.iter_mut().zip(pattern.iter()) {
                *dst = src;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_mode_flags() {
        assert_eq!(WrapMode::from_flag(0), WrapMode::Repeat);
        assert_eq!(WrapMode::from_flag(1), WrapMode::Clamp);
        assert_eq!(WrapMode::from_flag(2), WrapMode::Mirror);
        assert_eq!(WrapMode::from_flag(99), WrapMode::Repeat);
    }

    #[test]
    fn buffer_keeps_length_invariant() {
        let mut r = Resource::buffer("pts", 8, 3);
        assert_eq!(r.data().len(), 24);
        r.resize_cpu(5, 1, false);
        assert_eq!(r.data().len(), 15);
        r.resize_cpu(10, 1, true);
        assert_eq!(r.data().len(), 30);
        assert!(r.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn store_and_load_vec() {
        let mut r = Resource::buffer("v", 2, 3);
        r.store_vec(1, [1.0, 2.0, 3.0]);
        assert_eq!(r.load_vec::<3>(1), [1.0, 2.0, 3.0]);
        assert_eq!(r.load_vec::<3>(0), [0.0, 0.0, 0.0]);
        // Reads past the end are zero-padded.
        assert_eq!(r.load_vec::<3>(7), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn store_vec_grows_data() {
        let mut r = Resource::buffer("v", 1, 1);
        r.store_vec(4, [7.0, 8.0]);
        assert_eq!(r.data().len(), 10);
        assert_eq!(r.load_vec::<2>(4), [7.0, 8.0]);
    }

    #[test]
    fn fill_pattern_pads_to_stride() {
        let mut r = Resource::image("img", 2, 1, WrapMode::Repeat);
        r.fill_pattern(2, 1, &[0.5, 0.25]);
        assert_eq!(r.data(), &[0.5, 0.25, 0.0, 0.0, 0.5, 0.25, 0.0, 0.0]);
    }
}
