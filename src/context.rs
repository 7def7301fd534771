//! Per-effect execution context: the resource list, scalar inputs, device
//! submission state and the action log.
//!
//! All dispatch and draw failures are soft. A missing kernel, a failed
//! pipeline or a bad draw target logs a warning and the call becomes a
//! no-op; the frame keeps running. Errors only surface from construction,
//! `drain` and readback, where the host can actually react to them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::composite_cpu::{self, CopyRect, SampleMode};
use crate::error::{FxrtError, FxrtResult};
use crate::programs::{ProgramCache, ProgramLibrary};
use crate::resource::{ExternalImage, Resource, WrapMode};
use crate::sample_cpu::{self, FilterMode};
use crate::sync::{self, BindingPlan, DeviceState, PlanStage};

/// One entry in the action log, a compact record of what the runtime did on
/// behalf of the generated kernel. Serialized in tests to pin the execution
/// shape of a frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub target: String,
    pub width: usize,
    pub height: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Resize,
    Dispatch,
    Draw,
    Alloc,
}

#[derive(Clone, Debug)]
pub struct ContextOptions {
    /// Diagnostic label attached to log events.
    pub label: Option<String>,
    /// Disable to skip action-log bookkeeping entirely.
    pub log_actions: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            label: None,
            log_actions: true,
        }
    }
}

pub struct ExecContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    options: ContextOptions,
    programs: ProgramCache,
    resources: Vec<Resource>,
    inputs: HashMap<String, f32>,
    return_value: Vec<f32>,
    state: DeviceState,
    compute_plan: Option<BindingPlan>,
    render_plans: HashMap<usize, BindingPlan>,
    pending: Option<wgpu::SubmissionIndex>,
    actions: Vec<ActionRecord>,
}

impl ExecContext {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, library: ProgramLibrary) -> Self {
        Self::with_options(device, queue, library, ContextOptions::default())
    }

    pub fn with_options(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        library: ProgramLibrary,
        options: ContextOptions,
    ) -> Self {
        Self {
            device: device.clone(),
            queue: queue.clone(),
            options,
            programs: ProgramCache::new(library),
            resources: Vec::new(),
            inputs: HashMap::new(),
            return_value: Vec::new(),
            state: DeviceState::default(),
            compute_plan: None,
            render_plans: HashMap::new(),
            pending: None,
            actions: Vec::new(),
        }
    }

    /// Register a resource and return its index, the handle every later
    /// operation refers to.
    pub fn add_resource(&mut self, resource: Resource) -> usize {
        self.resources.push(resource);
        self.invalidate_plans();
        self.state.clear();
        self.resources.len() - 1
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn resource(&self, index: usize) -> Option<&Resource> {
        self.resources.get(index)
    }

    pub fn resource_mut(&mut self, index: usize) -> Option<&mut Resource> {
        self.resources.get_mut(index)
    }

    pub fn has_kernel(&self, name: &str) -> bool {
        self.programs.library().has_entry_point(name)
    }

    // Scalar inputs, read by name with a zero default so generated kernels
    // can reference parameters the host never set.

    pub fn set_input(&mut self, name: impl Into<String>, value: f32) {
        self.inputs.insert(name.into(), value);
    }

    pub fn input(&self, name: &str) -> f32 {
        self.inputs.get(name).copied().unwrap_or(0.0)
    }

    pub fn clear_inputs(&mut self) {
        self.inputs.clear();
    }

    /// Store the result of a generated CPU-side function call. Scalars store
    /// one component, vector results store their full width; each call
    /// replaces the previous value.
    pub fn set_return_value(&mut self, value: &[f32]) {
        self.return_value.clear();
        self.return_value.extend_from_slice(value);
    }

    pub fn return_value(&self) -> &[f32] {
        &self.return_value
    }

    pub fn actions(&self) -> &[ActionRecord] {
        &self.actions
    }

    pub fn clear_actions(&mut self) {
        self.actions.clear();
    }

    /// Point an image resource at a foreign-owned texture for the duration
    /// of the current frame. The handle is released by [`Self::drain`].
    pub fn attach_external(&mut self, index: usize, handle: ExternalImage) -> FxrtResult<()> {
        let Some(res) = self.resources.get_mut(index) else {
            return Err(FxrtError::validation(format!(
                "resource index {index} out of range"
            )));
        };
        if !res.kind().is_image() {
            return Err(FxrtError::validation(format!(
                "resource '{}' is not an image",
                res.name()
            )));
        }
        res.external = Some(handle);
        self.state.clear();
        self.invalidate_plans();
        Ok(())
    }

    pub fn resize_1d(&mut self, index: usize, len: usize, clear: bool) {
        self.resize_2d(index, len, 1, clear);
    }

    /// Resize a resource's logical dimensions.
    ///
    /// CPU content up to the overlap survives unless `clear` is set. A
    /// persistent device buffer is carried forward with a device-to-device
    /// copy so device-resident content never round-trips through the host.
    /// External resources cannot be resized; the call is a no-op.
    pub fn resize_2d(&mut self, index: usize, width: usize, height: usize, clear: bool) {
        let Some(res) = self.resources.get_mut(index) else {
            tracing::warn!(index, "resize of unknown resource ignored");
            return;
        };
        if res.is_external() {
            tracing::warn!(name = res.name(), "resize of external resource ignored");
            return;
        }

        res.resize_cpu(width, height, clear);
        let name = res.name().to_string();
        let byte_len = res.byte_len();

        if let Some(old) = res.device_buffer.take() {
            let (buffer, submitted) =
                sync::resize_device_buffer(&self.device, &self.queue, &old, byte_len, !clear);
            if let Some(idx) = submitted {
                self.pending = Some(idx);
            }
            if !self.state.is_empty()
                && let Some(slot) = self.state.buffers.get_mut(index)
            {
                *slot = Some(buffer.clone());
            }
            res.device_buffer = Some(buffer);
        } else {
            // Nothing persistent to carry over; let the next sync rebuild.
            self.state.clear();
        }

        self.log(ActionKind::Resize, &name, width, height);
    }

    /// Resize and fill with a repeating per-element pattern (zero-padded to
    /// the element stride). Replaces device content wholesale.
    pub fn resize_with_fill(&mut self, index: usize, width: usize, height: usize, pattern: &[f32]) {
        let Some(res) = self.resources.get_mut(index) else {
            tracing::warn!(index, "resize of unknown resource ignored");
            return;
        };
        if res.is_external() {
            tracing::warn!(name = res.name(), "resize of external resource ignored");
            return;
        }

        res.fill_pattern(width, height, pattern);
        let name = res.name().to_string();

        if res.device_buffer.is_some() {
            let buffer = sync::buffer_from_floats(
                &self.device,
                &self.queue,
                &format!("fxrt_buffer_{name}"),
                &res.data,
            );
            if !self.state.is_empty()
                && let Some(slot) = self.state.buffers.get_mut(index)
            {
                *slot = Some(buffer.clone());
            }
            res.device_buffer = Some(buffer);
        } else {
            self.state.clear();
        }

        self.log(ActionKind::Resize, &name, width, height);
    }

    /// Run a compute kernel over a thread grid of `dims` threads per axis.
    /// Workgroup counts are the ceiling division of each extent by the
    /// kernel's declared workgroup size; kernels guard the overshoot.
    #[tracing::instrument(level = "debug", skip(self, args))]
    pub fn dispatch(&mut self, kernel: &str, dims: [u32; 3], args: &[f32]) {
        if dims.iter().any(|&d| d == 0) {
            return;
        }
        if self.compute_plan.is_none() {
            self.compute_plan = Some(sync::build_binding_plan(
                &self.device,
                &self.resources,
                PlanStage::Compute,
            ));
        }
        // Resolve the kernel before touching device state so an unknown
        // name stays allocation-free.
        let Some(plan) = self.compute_plan.as_ref() else {
            return;
        };
        let Some(pipeline) = self.programs.compute(&self.device, plan, kernel) else {
            return;
        };

        self.ensure_synced();
        let args_buf = self.args_buffer(args);
        let Some(plan) = self.compute_plan.as_ref() else {
            return;
        };
        let Some(bind_group) = sync::build_bind_group(
            &self.device,
            plan,
            &mut self.state,
            &args_buf,
            &pipeline.used_bindings,
        ) else {
            tracing::warn!(kernel, "dispatch skipped, device state incomplete");
            return;
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fxrt_dispatch_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor::default());
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let wg = pipeline.workgroup_size;
            pass.dispatch_workgroups(
                dims[0].div_ceil(wg[0]),
                dims[1].div_ceil(wg[1]),
                dims[2].div_ceil(wg[2]),
            );
        }
        self.pending = Some(self.queue.submit(Some(encoder.finish())));

        let kernel = kernel.to_string();
        self.log(
            ActionKind::Dispatch,
            &kernel,
            dims[0] as usize,
            dims[1] as usize,
        );
    }

    /// Rasterize `vertex_count` vertices into an image resource, clearing it
    /// to transparent black first. The target's own bindings are omitted
    /// from the pass; everything else stays readable.
    #[tracing::instrument(level = "debug", skip(self, args))]
    pub fn draw(&mut self, target: usize, vs: &str, fs: &str, vertex_count: u32, args: &[f32]) {
        self.ensure_synced();

        let Some(res) = self.resources.get(target) else {
            tracing::warn!(target, "draw target out of range");
            return;
        };
        if !res.kind().is_image() {
            tracing::warn!(name = res.name(), "draw target is not an image");
            return;
        }
        let name = res.name().to_string();
        let (width, height) = (res.width(), res.height());
        let Some(view) = self.state.views.get(target).and_then(|v| v.clone()) else {
            tracing::warn!(name = %name, "draw target has no device image");
            return;
        };
        let format = self
            .state
            .textures
            .get(target)
            .and_then(|t| t.as_ref())
            .map(|t| t.format())
            .unwrap_or(wgpu::TextureFormat::Rgba8Unorm);

        if !self.render_plans.contains_key(&target) {
            let plan =
                sync::build_binding_plan(&self.device, &self.resources, PlanStage::Render { target });
            self.render_plans.insert(target, plan);
        }
        let args_buf = self.args_buffer(args);
        let Some(plan) = self.render_plans.get(&target) else {
            return;
        };

        let Some(pipeline) = self
            .programs
            .render(&self.device, plan, vs, fs, target, format)
        else {
            return;
        };

        let mut used: Vec<u32> = self.programs.library().used_bindings(vs).to_vec();
        used.extend_from_slice(self.programs.library().used_bindings(fs));
        let Some(bind_group) =
            sync::build_bind_group(&self.device, plan, &mut self.state, &args_buf, &used)
        else {
            tracing::warn!(name = %name, "draw skipped, device state incomplete");
            return;
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fxrt_draw_encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("fxrt_draw_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..vertex_count, 0..1);
        }
        self.pending = Some(self.queue.submit(Some(encoder.finish())));

        self.log(ActionKind::Draw, &name, width, height);
    }

    /// Wait for all submitted device work, copy staging images back to their
    /// external handles, read internal resources back to CPU data, and
    /// release external handles. After drain the CPU representation is
    /// authoritative again.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn drain(&mut self) -> FxrtResult<()> {
        if self.pending.take().is_some() {
            self.device
                .poll(wgpu::PollType::wait_indefinitely())
                .map_err(|e| FxrtError::sync(format!("wgpu poll failed: {e:?}")))?;
        }

        let blit = sync::blit_staging_to_external(&self.device, &self.queue, &self.resources);
        sync::read_back(&self.device, &self.queue, &mut self.resources, &self.state)?;
        if blit.is_some() {
            // Covers the case where readback had nothing to map and wait on.
            self.device
                .poll(wgpu::PollType::wait_indefinitely())
                .map_err(|e| FxrtError::sync(format!("wgpu poll failed: {e:?}")))?;
        }

        for res in &mut self.resources {
            res.external = None;
        }
        self.state.clear();
        self.invalidate_plans();
        Ok(())
    }

    // CPU-side kernel intrinsics, operating on the CPU representation.

    /// Sample an image resource at normalized coordinates. Unknown indices
    /// yield transparent black.
    pub fn sample_texture(
        &self,
        index: usize,
        u: f32,
        v: f32,
        wrap: WrapMode,
        filter: FilterMode,
        stride: usize,
    ) -> [f32; 4] {
        let Some(res) = self.resources.get(index) else {
            return [0.0; 4];
        };
        sample_cpu::sample(
            res.data(),
            res.width(),
            res.height(),
            stride.max(1),
            u,
            v,
            wrap,
            filter,
        )
    }

    /// Composite a rect of one image resource into another. Aliasing source
    /// and destination is rejected.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_texture(
        &mut self,
        src: usize,
        dst: usize,
        src_rect: CopyRect,
        dst_rect: CopyRect,
        mode: SampleMode,
        alpha: f32,
        normalized: bool,
    ) {
        if src == dst {
            tracing::warn!(src, "texture copy onto itself ignored");
            return;
        }
        let Some((s, d)) = two_mut(&mut self.resources, src, dst) else {
            tracing::warn!(src, dst, "texture copy with unknown resource ignored");
            return;
        };
        let (sw, sh) = (s.width(), s.height());
        let (dw, dh) = (d.width(), d.height());
        composite_cpu::copy_texture(
            s.data(),
            sw,
            sh,
            d.data_mut(),
            dw,
            dh,
            src_rect,
            dst_rect,
            mode,
            alpha,
            normalized,
        );
    }

    /// Copy elements between buffer resources. A negative `count` copies as
    /// many elements as both sides can hold.
    pub fn copy_buffer(
        &mut self,
        src: usize,
        dst: usize,
        src_offset: usize,
        dst_offset: usize,
        count: i64,
    ) {
        if src == dst {
            tracing::warn!(src, "buffer copy onto itself ignored");
            return;
        }
        let Some((s, d)) = two_mut(&mut self.resources, src, dst) else {
            tracing::warn!(src, dst, "buffer copy with unknown resource ignored");
            return;
        };
        let stride = s.kind().stride();
        composite_cpu::copy_buffer(s.data(), d.data_mut(), stride, src_offset, dst_offset, count);
    }

    /// Materialize device state if a previous drain (or resize) cleared it.
    fn ensure_synced(&mut self) {
        if !self.state.is_empty() {
            return;
        }
        if let Some(idx) = sync::sync_to_device(
            &self.device,
            &self.queue,
            &mut self.resources,
            &mut self.state,
            &mut self.actions,
            self.options.log_actions,
        ) {
            self.pending = Some(idx);
        }
    }

    fn invalidate_plans(&mut self) {
        self.compute_plan = None;
        self.render_plans.clear();
    }

    /// Scalar arguments as a uniform buffer, padded to a 16-byte multiple
    /// with at least one float so empty argument lists still bind.
    fn args_buffer(&self, args: &[f32]) -> wgpu::Buffer {
        let mut padded = args.to_vec();
        if padded.is_empty() {
            padded.push(0.0);
        }
        while padded.len() % 4 != 0 {
            padded.push(0.0);
        }
        let bytes = sync::floats_to_bytes(&padded);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("fxrt_args"),
            size: bytes.len() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue.write_buffer(&buffer, 0, &bytes);
        buffer
    }

    fn log(&mut self, kind: ActionKind, target: &str, width: usize, height: usize) {
        if !self.options.log_actions {
            return;
        }
        self.actions.push(ActionRecord {
            kind,
            target: target.to_string(),
            width,
            height,
        });
    }
}

impl std::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("label", &self.options.label)
            .field("resources", &self.resources.len())
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

/// Acquire the system's default adapter and a device for it. Hosts that
/// already own a wgpu device pass it to [`ExecContext::new`] directly.
pub fn request_device() -> FxrtResult<(wgpu::Device, wgpu::Queue)> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))
    .map_err(|e| match e {
        wgpu::RequestAdapterError::NotFound { .. } => {
            FxrtError::device("no gpu adapter available")
        }
        other => FxrtError::device(format!("wgpu request_adapter failed: {other:?}")),
    })?;

    let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: None,
        required_features: wgpu::Features::empty(),
        required_limits: wgpu::Limits::default(),
        experimental_features: wgpu::ExperimentalFeatures::default(),
        memory_hints: wgpu::MemoryHints::Performance,
        trace: wgpu::Trace::Off,
    }))
    .map_err(|e| FxrtError::device(format!("wgpu request_device failed: {e:?}")))?;

    Ok((device, queue))
}

/// Disjoint (source, destination) borrow of two resources.
fn two_mut(resources: &mut [Resource], src: usize, dst: usize) -> Option<(&Resource, &mut Resource)> {
    if src == dst || src >= resources.len() || dst >= resources.len() {
        return None;
    }
    if src < dst {
        let (left, right) = resources.split_at_mut(dst);
        Some((&left[src], &mut right[0]))
    } else {
        let (left, right) = resources.split_at_mut(src);
        Some((&right[0], &mut left[dst]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_records_serialize_compactly() {
        let record = ActionRecord {
            kind: ActionKind::Resize,
            target: "points".into(),
            width: 64,
            height: 1,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"resize","target":"points","width":64,"height":1}"#
        );
        let back: ActionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn two_mut_rejects_aliasing_and_bounds() {
        let mut resources = vec![
            Resource::buffer("a", 1, 1),
            Resource::buffer("b", 1, 1),
        ];
        assert!(two_mut(&mut resources, 0, 0).is_none());
        assert!(two_mut(&mut resources, 0, 5).is_none());
        let (s, d) = two_mut(&mut resources, 1, 0).unwrap();
        assert_eq!(s.name(), "b");
        assert_eq!(d.name(), "a");
    }
}
