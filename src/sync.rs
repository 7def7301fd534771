//! CPU <-> device synchronization.
//!
//! Bridges the CPU resource state and the wgpu device state once per frame,
//! lazily: `sync_to_device` materializes buffers, textures, samplers and
//! staging images; readback happens on drain. Externally-owned images are
//! never bound for device writes — kernels see a device-writable staging
//! image that is blitted from the external handle before dispatch and back
//! after the frame's work completes.

use std::hash::{Hash, Hasher};
use std::sync::mpsc;

use crate::context::{ActionKind, ActionRecord};
use crate::error::{FxrtError, FxrtResult};
use crate::pixel;
use crate::resource::{Resource, ResourceKind, StagingImage, WrapMode};

/// Usage for every runtime-allocated image: sampled reads, storage writes,
/// render target, and blit source/destination.
const IMAGE_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::TEXTURE_BINDING
    .union(wgpu::TextureUsages::STORAGE_BINDING)
    .union(wgpu::TextureUsages::RENDER_ATTACHMENT)
    .union(wgpu::TextureUsages::COPY_SRC)
    .union(wgpu::TextureUsages::COPY_DST);

const BUFFER_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

/// Per-frame device bindings, positionally aligned with the resource list.
/// Rebuilt by [`sync_to_device`] whenever empty; cleared by drain and by
/// resizes that have no persistent device buffer to carry content forward.
#[derive(Default)]
pub(crate) struct DeviceState {
    pub buffers: Vec<Option<wgpu::Buffer>>,
    pub textures: Vec<Option<wgpu::Texture>>,
    pub views: Vec<Option<wgpu::TextureView>>,
    pub samplers: Vec<Option<wgpu::Sampler>>,
    dummy_storage: std::collections::HashMap<wgpu::TextureFormat, wgpu::TextureView>,
    dummy_sampled: Option<wgpu::TextureView>,
}

impl DeviceState {
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.textures.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.textures.clear();
        self.views.clear();
        self.samplers.clear();
    }

    fn reset(&mut self, len: usize) {
        self.clear();
        self.buffers.resize_with(len, || None);
        self.textures.resize_with(len, || None);
        self.views.resize_with(len, || None);
        self.samplers.resize_with(len, || None);
    }

    /// 1x1 write-only storage view of the given format, bound in storage
    /// slots the current kernel never writes (or whose external texture
    /// cannot back a storage binding). Keeps a written image out of the
    /// usage scope of kernels that only read it.
    fn dummy_storage_view(
        &mut self,
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
    ) -> wgpu::TextureView {
        if let Some(view) = self.dummy_storage.get(&format) {
            return view.clone();
        }
        let tex = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("fxrt_dummy_storage"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::STORAGE_BINDING,
            view_formats: &[],
        });
        let view = tex.create_view(&wgpu::TextureViewDescriptor::default());
        self.dummy_storage.insert(format, view.clone());
        view
    }

    /// 1x1 sampled view bound in sampled slots the current kernel never
    /// reads.
    fn dummy_sampled_view(&mut self, device: &wgpu::Device) -> wgpu::TextureView {
        if let Some(view) = &self.dummy_sampled {
            return view.clone();
        }
        let tex = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("fxrt_dummy_sampled"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = tex.create_view(&wgpu::TextureViewDescriptor::default());
        self.dummy_sampled = Some(view.clone());
        view
    }
}

pub(crate) fn floats_to_bytes(data: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 4);
    for v in data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// True when the format can back a write-only storage binding without extra
/// device features.
pub(crate) fn storage_compatible(format: wgpu::TextureFormat) -> bool {
    matches!(
        format,
        wgpu::TextureFormat::Rgba8Unorm
            | wgpu::TextureFormat::Rgba8Snorm
            | wgpu::TextureFormat::Rgba16Float
            | wgpu::TextureFormat::Rgba32Float
            | wgpu::TextureFormat::R32Float
    )
}

fn create_image(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: IMAGE_USAGE,
        view_formats: &[],
    })
}

/// Create a storage buffer and seed it with the given floats. Zero-length
/// data still allocates one float so the binding stays valid.
pub(crate) fn buffer_from_floats(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    label: &str,
    data: &[f32],
) -> wgpu::Buffer {
    let bytes = floats_to_bytes(data);
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: (bytes.len() as u64).max(4),
        usage: BUFFER_USAGE,
        mapped_at_creation: false,
    });
    if !bytes.is_empty() {
        queue.write_buffer(&buffer, 0, &bytes);
    }
    buffer
}

/// Allocate a device buffer of `new_byte_len` and, when `preserve` is set,
/// carry the old content over with a device-to-device copy (no host round
/// trip). Returns the new buffer and the copy's submission index, if any.
/// Queue submission order keeps the copy correctly sequenced against
/// previously submitted dispatches.
pub(crate) fn resize_device_buffer(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    old: &wgpu::Buffer,
    new_byte_len: u64,
    preserve: bool,
) -> (wgpu::Buffer, Option<wgpu::SubmissionIndex>) {
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("fxrt_resized_buffer"),
        size: new_byte_len.max(4),
        usage: BUFFER_USAGE,
        mapped_at_creation: false,
    });
    if !preserve || old.size() == 0 || new_byte_len == 0 {
        return (buffer, None);
    }
    let copy_len = old.size().min(new_byte_len);
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("fxrt_buffer_resize_encoder"),
    });
    encoder.copy_buffer_to_buffer(old, 0, &buffer, 0, copy_len);
    let index = queue.submit(Some(encoder.finish()));
    (buffer, Some(index))
}

fn make_sampler(device: &wgpu::Device, name: &str, wrap: WrapMode) -> wgpu::Sampler {
    let address = match wrap {
        WrapMode::Repeat => wgpu::AddressMode::Repeat,
        WrapMode::Clamp => wgpu::AddressMode::ClampToEdge,
        WrapMode::Mirror => wgpu::AddressMode::MirrorRepeat,
    };
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some(&format!("fxrt_sampler_{name}")),
        address_mode_u: address,
        address_mode_v: address,
        address_mode_w: address,
        mag_filter: wgpu::FilterMode::Nearest,
        min_filter: wgpu::FilterMode::Nearest,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

/// Materialize every resource on the device.
///
/// External images get (or reuse) a staging image matched on dimensions and
/// format; internal images get an rgba8 texture seeded from CPU data;
/// internal buffers reuse their persistent device buffer when the byte
/// length still matches. Finishes by blitting external content into staging
/// so kernels observe up-to-date input; returns that blit's submission
/// index.
pub(crate) fn sync_to_device(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    resources: &mut [Resource],
    state: &mut DeviceState,
    actions: &mut Vec<ActionRecord>,
    log_actions: bool,
) -> Option<wgpu::SubmissionIndex> {
    state.reset(resources.len());

    for (i, res) in resources.iter_mut().enumerate() {
        match res.kind {
            ResourceKind::Image { wrap } => {
                if let Some(external) = &res.external {
                    let reuse = res
                        .staging
                        .as_ref()
                        .is_some_and(|staging| staging.matches(external));
                    if !reuse {
                        let (w, h) = (external.width(), external.height());
                        let format = external.format();
                        let texture =
                            create_image(device, &format!("fxrt_staging_{}", res.name), w, h, format);
                        res.staging = Some(StagingImage {
                            texture,
                            width: w,
                            height: h,
                            format,
                        });
                        if log_actions {
                            actions.push(ActionRecord {
                                kind: ActionKind::Alloc,
                                target: res.name.clone(),
                                width: w as usize,
                                height: h as usize,
                            });
                        }
                    }
                    if let Some(staging) = &res.staging {
                        res.width = staging.width as usize;
                        res.height = staging.height as usize;
                        state.textures[i] = Some(staging.texture.clone());
                    }
                } else {
                    let (w, h) = (res.width as u32, res.height as u32);
                    let reuse = res
                        .device_texture
                        .as_ref()
                        .is_some_and(|t| t.width() == w.max(1) && t.height() == h.max(1));
                    if !reuse {
                        res.device_texture = Some(create_image(
                            device,
                            &format!("fxrt_image_{}", res.name),
                            w,
                            h,
                            wgpu::TextureFormat::Rgba8Unorm,
                        ));
                        if log_actions {
                            actions.push(ActionRecord {
                                kind: ActionKind::Alloc,
                                target: res.name.clone(),
                                width: res.width,
                                height: res.height,
                            });
                        }
                    }
                    if let Some(texture) = &res.device_texture {
                        // Seed from CPU data when populated.
                        let texel_floats = res.width * res.height * 4;
                        if texel_floats > 0 && res.data.len() >= texel_floats {
                            let bytes = pixel::floats_to_rgba8(&res.data[..texel_floats]);
                            queue.write_texture(
                                wgpu::TexelCopyTextureInfo {
                                    texture,
                                    mip_level: 0,
                                    origin: wgpu::Origin3d::ZERO,
                                    aspect: wgpu::TextureAspect::All,
                                },
                                &bytes,
                                wgpu::TexelCopyBufferLayout {
                                    offset: 0,
                                    bytes_per_row: Some(res.width as u32 * 4),
                                    rows_per_image: Some(res.height as u32),
                                },
                                wgpu::Extent3d {
                                    width: res.width as u32,
                                    height: res.height as u32,
                                    depth_or_array_layers: 1,
                                },
                            );
                        }
                        state.textures[i] = Some(texture.clone());
                    }
                }

                if let Some(texture) = &state.textures[i] {
                    state.views[i] =
                        Some(texture.create_view(&wgpu::TextureViewDescriptor::default()));
                    state.samplers[i] = Some(make_sampler(device, &res.name, wrap));
                }
            }
            ResourceKind::Buffer { .. } => {
                let byte_len = res.byte_len().max(4);
                let reuse = res
                    .device_buffer
                    .as_ref()
                    .is_some_and(|b| b.size() == byte_len);
                if reuse {
                    // CPU data is authoritative at sync time; refresh the
                    // retained buffer in place.
                    if let Some(buffer) = &res.device_buffer
                        && !res.data.is_empty()
                    {
                        let bytes = floats_to_bytes(&res.data);
                        let n = bytes.len().min(buffer.size() as usize);
                        queue.write_buffer(buffer, 0, &bytes[..n]);
                    }
                } else {
                    let buffer = buffer_from_floats(
                        device,
                        queue,
                        &format!("fxrt_buffer_{}", res.name),
                        &res.data,
                    );
                    res.device_buffer = Some(buffer);
                    if log_actions {
                        actions.push(ActionRecord {
                            kind: ActionKind::Alloc,
                            target: res.name.clone(),
                            width: res.width,
                            height: res.height,
                        });
                    }
                }
                state.buffers[i] = res.device_buffer.clone();
            }
        }
    }

    blit_external_to_staging(device, queue, resources)
}

/// Copy each external image's current content into its staging image.
pub(crate) fn blit_external_to_staging(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    resources: &[Resource],
) -> Option<wgpu::SubmissionIndex> {
    copy_external(device, queue, resources, Direction::ExternalToStaging)
}

/// Copy each staging image back into its external handle after device work
/// has completed.
pub(crate) fn blit_staging_to_external(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    resources: &[Resource],
) -> Option<wgpu::SubmissionIndex> {
    copy_external(device, queue, resources, Direction::StagingToExternal)
}

#[derive(Clone, Copy, PartialEq)]
enum Direction {
    ExternalToStaging,
    StagingToExternal,
}

fn copy_external(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    resources: &[Resource],
    direction: Direction,
) -> Option<wgpu::SubmissionIndex> {
    let mut encoder: Option<wgpu::CommandEncoder> = None;

    for res in resources {
        let (Some(external), Some(staging)) = (&res.external, &res.staging) else {
            continue;
        };
        if !staging.matches(external) {
            continue;
        }
        let encoder = encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fxrt_external_blit_encoder"),
            })
        });
        let ext_copy = wgpu::TexelCopyTextureInfo {
            texture: external.texture(),
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        };
        let staging_copy = wgpu::TexelCopyTextureInfo {
            texture: &staging.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        };
        let extent = wgpu::Extent3d {
            width: staging.width,
            height: staging.height,
            depth_or_array_layers: 1,
        };
        match direction {
            Direction::ExternalToStaging => {
                encoder.copy_texture_to_texture(ext_copy, staging_copy, extent)
            }
            Direction::StagingToExternal => {
                encoder.copy_texture_to_texture(staging_copy, ext_copy, extent)
            }
        }
    }

    encoder.map(|e| queue.submit(Some(e.finish())))
}

/// Read every internal resource's device content back into CPU `data`.
/// Encodes all copies into one submission, then maps and converts. Blocks
/// until the device has finished all outstanding work.
pub(crate) fn read_back(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    resources: &mut [Resource],
    state: &DeviceState,
) -> FxrtResult<()> {
    enum Pending {
        Image {
            index: usize,
            width: usize,
            height: usize,
            padded_row: usize,
            buffer: wgpu::Buffer,
        },
        Buffer {
            index: usize,
            buffer: wgpu::Buffer,
        },
    }

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("fxrt_readback_encoder"),
    });
    let mut pending = Vec::new();

    for (i, res) in resources.iter().enumerate() {
        if res.external.is_some() {
            continue;
        }
        match res.kind {
            ResourceKind::Image { .. } => {
                let Some(texture) = state.textures.get(i).and_then(|t| t.as_ref()) else {
                    continue;
                };
                let (w, h) = (res.width as u32, res.height as u32);
                if w == 0 || h == 0 {
                    continue;
                }
                let padded_row = align_to(w * 4, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
                let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("fxrt_readback_image"),
                    size: padded_row as u64 * h as u64,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                encoder.copy_texture_to_buffer(
                    wgpu::TexelCopyTextureInfo {
                        texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    wgpu::TexelCopyBufferInfo {
                        buffer: &buffer,
                        layout: wgpu::TexelCopyBufferLayout {
                            offset: 0,
                            bytes_per_row: Some(padded_row),
                            rows_per_image: Some(h),
                        },
                    },
                    wgpu::Extent3d {
                        width: w,
                        height: h,
                        depth_or_array_layers: 1,
                    },
                );
                pending.push(Pending::Image {
                    index: i,
                    width: res.width,
                    height: res.height,
                    padded_row: padded_row as usize,
                    buffer,
                });
            }
            ResourceKind::Buffer { .. } => {
                let Some(src) = res.device_buffer.as_ref() else {
                    continue;
                };
                if res.data.is_empty() {
                    continue;
                }
                let byte_len = res.byte_len().min(src.size());
                let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("fxrt_readback_buffer"),
                    size: byte_len.max(4),
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                encoder.copy_buffer_to_buffer(src, 0, &buffer, 0, byte_len);
                pending.push(Pending::Buffer { index: i, buffer });
            }
        }
    }

    if pending.is_empty() {
        return Ok(());
    }
    queue.submit(Some(encoder.finish()));

    let mut receivers = Vec::with_capacity(pending.len());
    for item in &pending {
        let buffer = match item {
            Pending::Image { buffer, .. } | Pending::Buffer { buffer, .. } => buffer,
        };
        let (tx, rx) = mpsc::channel();
        buffer.slice(..).map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        receivers.push(rx);
    }

    device
        .poll(wgpu::PollType::wait_indefinitely())
        .map_err(|e| FxrtError::sync(format!("wgpu poll failed: {e:?}")))?;

    for (item, rx) in pending.into_iter().zip(receivers) {
        rx.recv()
            .map_err(|_| FxrtError::sync("readback channel closed"))?
            .map_err(|e| FxrtError::sync(format!("readback map failed: {e:?}")))?;

        match item {
            Pending::Image {
                index,
                width,
                height,
                padded_row,
                buffer,
            } => {
                let mapped = buffer.slice(..).get_mapped_range();
                let res = &mut resources[index];
                res.data.resize(width * height * 4, 0.0);
                let row_bytes = width * 4;
                for row in 0..height {
                    let src = &mapped[row * padded_row..row * padded_row + row_bytes];
                    let dst = &mut res.data[row * row_bytes..(row + 1) * row_bytes];
                    pixel::rgba8_to_floats(src, dst);
                }
                drop(mapped);
                buffer.unmap();
            }
            Pending::Buffer { index, buffer } => {
                let mapped = buffer.slice(..).get_mapped_range();
                let res = &mut resources[index];
                for (dst, chunk) in res.data.iter_mut().zip(mapped.chunks_exact(4)) {
                    *dst = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
                drop(mapped);
                buffer.unmap();
            }
        }
    }

    Ok(())
}

/// One binding slot in the positional contract: binding 0 carries the scalar
/// arguments; resource `i` owns the binding triple based at `3*i + 1`
/// (buffer: storage at the base; image: sampled view at the base, sampler at
/// base+1, write-only storage view at base+2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum BindSlot {
    Args,
    Buffer(usize),
    SampledImage(usize),
    ImageSampler(usize),
    StorageImage {
        index: usize,
        format: wgpu::TextureFormat,
    },
}

impl BindSlot {
    pub(crate) fn binding(self) -> u32 {
        match self {
            BindSlot::Args => 0,
            BindSlot::Buffer(i) | BindSlot::SampledImage(i) => 3 * i as u32 + 1,
            BindSlot::ImageSampler(i) => 3 * i as u32 + 2,
            BindSlot::StorageImage { index, .. } => 3 * index as u32 + 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PlanStage {
    Compute,
    /// Render pass binding plan; the draw target's own slots are omitted
    /// (an attachment cannot also be bound).
    Render { target: usize },
}

/// Explicit superset bind-group layout derived from the resource list.
/// Generated kernels reference whatever subset of the contract they need.
pub(crate) struct BindingPlan {
    pub slots: Vec<BindSlot>,
    pub layout: wgpu::BindGroupLayout,
    pub pipeline_layout: wgpu::PipelineLayout,
    /// Digest of `slots`; pipeline caches key on it so a kernel compiled
    /// against one layout is never paired with a bind group from another.
    pub signature: u64,
}

/// Order-sensitive digest of a slot list. Changes whenever the layout does:
/// resource count, resource kinds, or a storage format.
fn plan_signature(slots: &[BindSlot]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    slots.hash(&mut hasher);
    hasher.finish()
}

pub(crate) fn build_binding_plan(
    device: &wgpu::Device,
    resources: &[Resource],
    stage: PlanStage,
) -> BindingPlan {
    let mut slots = vec![BindSlot::Args];
    for (i, res) in resources.iter().enumerate() {
        if let PlanStage::Render { target } = stage
            && i == target
        {
            continue;
        }
        match res.kind {
            ResourceKind::Buffer { .. } => slots.push(BindSlot::Buffer(i)),
            ResourceKind::Image { .. } => {
                let format = res
                    .external
                    .as_ref()
                    .map(|e| e.format())
                    .filter(|f| storage_compatible(*f))
                    .unwrap_or(wgpu::TextureFormat::Rgba8Unorm);
                slots.push(BindSlot::SampledImage(i));
                slots.push(BindSlot::ImageSampler(i));
                slots.push(BindSlot::StorageImage { index: i, format });
            }
        }
    }

    let (uniform_vis, buffer_vis, image_vis, storage_vis) = match stage {
        PlanStage::Compute => (
            wgpu::ShaderStages::COMPUTE,
            wgpu::ShaderStages::COMPUTE,
            wgpu::ShaderStages::COMPUTE,
            wgpu::ShaderStages::COMPUTE,
        ),
        // Vertex stages may not hold read-write storage, so buffer and
        // storage-image slots are fragment-only in render plans.
        PlanStage::Render { .. } => (
            wgpu::ShaderStages::VERTEX_FRAGMENT,
            wgpu::ShaderStages::FRAGMENT,
            wgpu::ShaderStages::VERTEX_FRAGMENT,
            wgpu::ShaderStages::FRAGMENT,
        ),
    };

    let entries: Vec<wgpu::BindGroupLayoutEntry> = slots
        .iter()
        .map(|slot| match *slot {
            BindSlot::Args => wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: uniform_vis,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            BindSlot::Buffer(_) => wgpu::BindGroupLayoutEntry {
                binding: slot.binding(),
                visibility: buffer_vis,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            BindSlot::SampledImage(_) => wgpu::BindGroupLayoutEntry {
                binding: slot.binding(),
                visibility: image_vis,
                ty: wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                },
                count: None,
            },
            BindSlot::ImageSampler(_) => wgpu::BindGroupLayoutEntry {
                binding: slot.binding(),
                visibility: image_vis,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
            BindSlot::StorageImage { format, .. } => wgpu::BindGroupLayoutEntry {
                binding: slot.binding(),
                visibility: storage_vis,
                ty: wgpu::BindingType::StorageTexture {
                    access: wgpu::StorageTextureAccess::WriteOnly,
                    format,
                    view_dimension: wgpu::TextureViewDimension::D2,
                },
                count: None,
            },
        })
        .collect();

    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("fxrt_binding_layout"),
        entries: &entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("fxrt_pipeline_layout"),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });

    let signature = plan_signature(&slots);
    BindingPlan {
        slots,
        layout,
        pipeline_layout,
        signature,
    }
}

/// Build the bind group for one submission following a plan. `args` is the
/// frame's scalar-argument uniform buffer; `used` lists the bindings the
/// kernel actually references. Image slots outside `used` get inert dummy
/// views, so a kernel that only samples an image never pulls that image's
/// storage-write usage into its usage scope (and vice versa). Returns
/// `None` when a used slot has no materialized device object; the caller
/// drops the submission.
pub(crate) fn build_bind_group(
    device: &wgpu::Device,
    plan: &BindingPlan,
    state: &mut DeviceState,
    args: &wgpu::Buffer,
    used: &[u32],
) -> Option<wgpu::BindGroup> {
    // Dummies are owned views; collect them up front, positionally aligned
    // with the slots, so entry references stay alive.
    let mut stand_ins: Vec<Option<wgpu::TextureView>> = Vec::with_capacity(plan.slots.len());
    for slot in &plan.slots {
        let is_used = used.contains(&slot.binding());
        stand_ins.push(match *slot {
            BindSlot::SampledImage(_) if !is_used => Some(state.dummy_sampled_view(device)),
            BindSlot::StorageImage { index, format } => {
                let actual = state
                    .textures
                    .get(index)
                    .and_then(|t| t.as_ref())
                    .map(|t| t.format());
                if !is_used || actual != Some(format) {
                    Some(state.dummy_storage_view(device, format))
                } else {
                    None
                }
            }
            _ => None,
        });
    }

    let mut entries = Vec::with_capacity(plan.slots.len());
    for (slot, stand_in) in plan.slots.iter().zip(&stand_ins) {
        let resource = match (*slot, stand_in) {
            (BindSlot::Args, _) => args.as_entire_binding(),
            (BindSlot::Buffer(i), _) => state.buffers.get(i)?.as_ref()?.as_entire_binding(),
            (BindSlot::SampledImage(_) | BindSlot::StorageImage { .. }, Some(view)) => {
                wgpu::BindingResource::TextureView(view)
            }
            (BindSlot::SampledImage(i) | BindSlot::StorageImage { index: i, .. }, None) => {
                wgpu::BindingResource::TextureView(state.views.get(i)?.as_ref()?)
            }
            (BindSlot::ImageSampler(i), _) => {
                wgpu::BindingResource::Sampler(state.samplers.get(i)?.as_ref()?)
            }
        };
        entries.push(wgpu::BindGroupEntry {
            binding: slot.binding(),
            resource,
        });
    }

    Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("fxrt_bind_group"),
        layout: &plan.layout,
        entries: &entries,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_slots_are_positionally_stable() {
        assert_eq!(BindSlot::Args.binding(), 0);
        assert_eq!(BindSlot::Buffer(0).binding(), 1);
        assert_eq!(BindSlot::SampledImage(0).binding(), 1);
        assert_eq!(BindSlot::ImageSampler(0).binding(), 2);
        assert_eq!(
            BindSlot::StorageImage {
                index: 0,
                format: wgpu::TextureFormat::Rgba8Unorm
            }
            .binding(),
            3
        );
        assert_eq!(BindSlot::Buffer(2).binding(), 7);
        assert_eq!(BindSlot::SampledImage(2).binding(), 7);
    }

    #[test]
    fn plan_signature_tracks_layout_changes() {
        let a = vec![
            BindSlot::Args,
            BindSlot::SampledImage(0),
            BindSlot::ImageSampler(0),
            BindSlot::StorageImage {
                index: 0,
                format: wgpu::TextureFormat::Rgba8Unorm,
            },
        ];
        assert_eq!(plan_signature(&a), plan_signature(&a));

        let mut recolored = a.clone();
        recolored[3] = BindSlot::StorageImage {
            index: 0,
            format: wgpu::TextureFormat::Rgba16Float,
        };
        assert_ne!(plan_signature(&a), plan_signature(&recolored));

        let mut wider = a.clone();
        wider.push(BindSlot::Buffer(1));
        assert_ne!(plan_signature(&a), plan_signature(&wider));
    }

    #[test]
    fn align_to_matches_copy_alignment() {
        assert_eq!(align_to(1, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
    }

    #[test]
    fn float_byte_layout_is_little_endian() {
        let bytes = floats_to_bytes(&[1.0]);
        assert_eq!(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 1.0);
    }

    #[test]
    fn storage_compat_covers_runtime_formats() {
        assert!(storage_compatible(wgpu::TextureFormat::Rgba8Unorm));
        assert!(!storage_compatible(wgpu::TextureFormat::Bgra8Unorm));
    }
}
