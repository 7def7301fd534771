//! Loaded kernel library and memoized pipeline compilation.
//!
//! The kernel generator hands the runtime one WGSL source blob. The library
//! scans it once for entry points and their `@workgroup_size` attributes
//! (wgpu has no pipeline reflection, so the attribute is the source of truth
//! for thread-granular dispatch sizing), and compiles a single shader module.
//! Pipelines are compiled lazily by name and memoized; a missing entry point
//! or a failed compile yields `None`, never an error.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FxrtError, FxrtResult};
use crate::sync::BindingPlan;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryStage {
    Compute,
    Vertex,
    Fragment,
}

#[derive(Clone, Debug)]
struct EntryPoint {
    stage: EntryStage,
    workgroup_size: [u32; 3],
    /// `@binding` numbers this entry point references, directly or through
    /// helper functions. Bindings outside this set get inert placeholders at
    /// bind time, keeping read and write usages of the same image out of a
    /// single usage scope.
    used_bindings: Vec<u32>,
}

/// The compiled WGSL program library plus its scanned entry-point table.
pub struct ProgramLibrary {
    module: wgpu::ShaderModule,
    entries: HashMap<String, EntryPoint>,
}

impl ProgramLibrary {
    /// Compile the generated WGSL source into a shader module. Source-level
    /// errors surface here (the one place a broken generator output can be
    /// reported to the host); per-kernel failures stay soft.
    pub fn new(device: &wgpu::Device, source: &str) -> FxrtResult<Self> {
        let entries = scan_entry_points(source);

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fxrt_program_library"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(FxrtError::device(format!(
                "program library failed to compile: {err}"
            )));
        }

        Ok(Self { module, entries })
    }

    pub fn has_entry_point(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub(crate) fn used_bindings(&self, name: &str) -> &[u32] {
        self.entries
            .get(name)
            .map(|e| e.used_bindings.as_slice())
            .unwrap_or(&[])
    }

    fn entry(&self, name: &str, stage: EntryStage) -> Option<&EntryPoint> {
        self.entries.get(name).filter(|e| e.stage == stage)
    }
}

/// A compiled compute kernel, the workgroup size its grid math uses, and
/// the bindings it touches.
pub struct ComputeKernel {
    pub(crate) pipeline: wgpu::ComputePipeline,
    pub(crate) workgroup_size: [u32; 3],
    pub(crate) used_bindings: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RenderKey {
    vs: String,
    fs: String,
    target: usize,
    format: wgpu::TextureFormat,
    layout_signature: u64,
}

/// Memoized kernel-name -> pipeline mapping. Pipelines bake in the binding
/// plan's layout and (for render) the target's color format, so cache keys
/// carry both; an entry compiled against a stale layout is simply never hit
/// again.
pub struct ProgramCache {
    library: ProgramLibrary,
    compute: HashMap<(String, u64), Arc<ComputeKernel>>,
    render: HashMap<RenderKey, Arc<wgpu::RenderPipeline>>,
}

impl ProgramCache {
    pub fn new(library: ProgramLibrary) -> Self {
        Self {
            library,
            compute: HashMap::new(),
            render: HashMap::new(),
        }
    }

    pub fn library(&self) -> &ProgramLibrary {
        &self.library
    }

    /// Resolve a compute kernel by entry-point name. Absent entry points and
    /// pipeline validation failures are logged and yield `None`; the caller
    /// treats the dispatch as a no-op.
    pub(crate) fn compute(
        &mut self,
        device: &wgpu::Device,
        plan: &BindingPlan,
        name: &str,
    ) -> Option<Arc<ComputeKernel>> {
        let key = (name.to_string(), plan.signature);
        if let Some(kernel) = self.compute.get(&key) {
            return Some(kernel.clone());
        }

        let Some(entry) = self.library.entry(name, EntryStage::Compute) else {
            tracing::warn!(kernel = name, "compute entry point not found");
            return None;
        };
        let workgroup_size = entry.workgroup_size;
        let used_bindings = entry.used_bindings.clone();

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&format!("fxrt_kernel_{name}")),
            layout: Some(&plan.pipeline_layout),
            module: &self.library.module,
            entry_point: Some(name),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            tracing::warn!(kernel = name, error = %err, "compute pipeline creation failed");
            return None;
        }

        let kernel = Arc::new(ComputeKernel {
            pipeline,
            workgroup_size,
            used_bindings,
        });
        self.compute.insert(key, kernel.clone());
        Some(kernel)
    }

    /// Resolve a render pipeline for a vertex/fragment entry-point pair and a
    /// draw target. Same soft-failure contract as [`Self::compute`].
    pub(crate) fn render(
        &mut self,
        device: &wgpu::Device,
        plan: &BindingPlan,
        vs: &str,
        fs: &str,
        target: usize,
        format: wgpu::TextureFormat,
    ) -> Option<Arc<wgpu::RenderPipeline>> {
        let key = RenderKey {
            vs: vs.to_string(),
            fs: fs.to_string(),
            target,
            format,
            layout_signature: plan.signature,
        };
        if let Some(pipeline) = self.render.get(&key) {
            return Some(pipeline.clone());
        }

        if self.library.entry(vs, EntryStage::Vertex).is_none() {
            tracing::warn!(kernel = vs, "vertex entry point not found");
            return None;
        }
        if self.library.entry(fs, EntryStage::Fragment).is_none() {
            tracing::warn!(kernel = fs, "fragment entry point not found");
            return None;
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&format!("fxrt_draw_{vs}_{fs}")),
            layout: Some(&plan.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &self.library.module,
                entry_point: Some(vs),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &self.library.module,
                entry_point: Some(fs),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            tracing::warn!(vs, fs, error = %err, "render pipeline creation failed");
            return None;
        }

        let pipeline = Arc::new(pipeline);
        self.render.insert(key, pipeline.clone());
        Some(pipeline)
    }
}

struct ScannedFn {
    name: String,
    stage: Option<EntryStage>,
    workgroup_size: [u32; 3],
    body: String,
}

/// Scan WGSL source for stage-attributed entry points.
///
/// For each `fn`, the attribute block is whatever sits between the previous
/// `;`/`}` (or the start of the source) and the `fn` keyword. Good enough for
/// generated code; expressions inside `@workgroup_size` that are not integer
/// literals fall back to (1, 1, 1). Each entry point also gets the set of
/// `@binding` numbers it reaches through its body and any helper functions
/// it calls.
fn scan_entry_points(source: &str) -> HashMap<String, EntryPoint> {
    let fns = scan_functions(source);
    let globals = scan_global_bindings(source);

    // Direct references per function: global binding variables and callees.
    let mut direct_bindings: Vec<Vec<u32>> = Vec::with_capacity(fns.len());
    let mut callees: Vec<Vec<usize>> = Vec::with_capacity(fns.len());
    for f in &fns {
        direct_bindings.push(
            globals
                .iter()
                .filter(|(name, _)| contains_ident(&f.body, name))
                .map(|(_, binding)| *binding)
                .collect(),
        );
        callees.push(
            fns.iter()
                .enumerate()
                .filter(|(_, g)| g.name != f.name && contains_ident(&f.body, &g.name))
                .map(|(j, _)| j)
                .collect(),
        );
    }

    let mut entries = HashMap::new();
    for (i, f) in fns.iter().enumerate() {
        let Some(stage) = f.stage else {
            continue;
        };

        let mut used = Vec::new();
        let mut visited = vec![false; fns.len()];
        let mut stack = vec![i];
        while let Some(j) = stack.pop() {
            if visited[j] {
                continue;
            }
            visited[j] = true;
            used.extend_from_slice(&direct_bindings[j]);
            stack.extend_from_slice(&callees[j]);
        }
        used.sort_unstable();
        used.dedup();

        entries.insert(
            f.name.clone(),
            EntryPoint {
                stage,
                workgroup_size: f.workgroup_size,
                used_bindings: used,
            },
        );
    }

    entries
}

fn scan_functions(source: &str) -> Vec<ScannedFn> {
    let mut fns = Vec::new();

    for (fn_pos, _) in source.match_indices("fn ") {
        if fn_pos > 0 {
            let prev = source.as_bytes()[fn_pos - 1];
            if prev.is_ascii_alphanumeric() || prev == b'_' {
                continue;
            }
        }

        let after = &source[fn_pos + 3..];
        let name: String = after
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if name.is_empty() {
            continue;
        }

        let attr_start = source[..fn_pos]
            .rfind([';', '}'])
            .map(|p| p + 1)
            .unwrap_or(0);
        let attrs = &source[attr_start..fn_pos];

        let stage = if attrs.contains("@compute") {
            Some(EntryStage::Compute)
        } else if attrs.contains("@vertex") {
            Some(EntryStage::Vertex)
        } else if attrs.contains("@fragment") {
            Some(EntryStage::Fragment)
        } else {
            None
        };

        fns.push(ScannedFn {
            name,
            stage,
            workgroup_size: parse_workgroup_size(attrs).unwrap_or([1, 1, 1]),
            body: extract_body(&source[fn_pos..]),
        });
    }

    fns
}

/// The brace-balanced body following a `fn` keyword.
fn extract_body(from_fn: &str) -> String {
    let Some(open) = from_fn.find('{') else {
        return String::new();
    };
    let mut depth = 0usize;
    for (i, c) in from_fn[open..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return from_fn[open..open + i + 1].to_string();
                }
            }
            _ => {}
        }
    }
    from_fn[open..].to_string()
}

/// Module-scope `@binding(N) var ... name` declarations, as (name, binding).
fn scan_global_bindings(source: &str) -> Vec<(String, u32)> {
    let mut globals = Vec::new();

    for (pos, _) in source.match_indices("@binding(") {
        let rest = &source[pos + "@binding(".len()..];
        let Some(close) = rest.find(')') else {
            continue;
        };
        let Ok(binding) = rest[..close].trim().parse::<u32>() else {
            continue;
        };

        // The declared variable name follows the `var` keyword, past any
        // address-space template.
        let after = &rest[close + 1..];
        let Some(var_pos) = after.find("var") else {
            continue;
        };
        let mut decl = after[var_pos + 3..].trim_start();
        if let Some(stripped) = decl.strip_prefix('<') {
            let Some(end) = stripped.find('>') else {
                continue;
            };
            decl = stripped[end + 1..].trim_start();
        }
        let name: String = decl
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if !name.is_empty() {
            globals.push((name, binding));
        }
    }

    globals
}

fn contains_ident(text: &str, name: &str) -> bool {
    for (pos, _) in text.match_indices(name) {
        let before_ok = pos == 0 || {
            let c = text.as_bytes()[pos - 1];
            !(c.is_ascii_alphanumeric() || c == b'_')
        };
        let after = pos + name.len();
        let after_ok = after >= text.len() || {
            let c = text.as_bytes()[after];
            !(c.is_ascii_alphanumeric() || c == b'_')
        };
        if before_ok && after_ok {
            return true;
        }
    }
    false
}

fn parse_workgroup_size(attrs: &str) -> Option<[u32; 3]> {
    let start = attrs.find("@workgroup_size")?;
    let rest = &attrs[start..];
    let open = rest.find('(')?;
    let close = rest.find(')')?;
    let mut out = [1u32; 3];
    for (i, part) in rest[open + 1..close].split(',').enumerate() {
        if i >= 3 {
            break;
        }
        out[i] = part.trim().parse().ok()?;
    }
    if out.iter().any(|&v| v == 0) {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = r#"
@group(0) @binding(0) var<uniform> args: array<vec4<f32>, 2>;
@group(0) @binding(1) var src_img: texture_2d<f32>;
@group(0) @binding(2) var src_smp: sampler;
@group(0) @binding(3) var dst_img: texture_storage_2d<rgba8unorm, write>;

fn helper(uv: vec2<f32>) -> vec4<f32> {
    return textureSampleLevel(src_img, src_smp, uv, 0.0);
}

@compute @workgroup_size(8, 4, 1)
fn main_pass(@builtin(global_invocation_id) gid: vec3<u32>) {
    let c = helper(vec2<f32>(0.5, 0.5)) * args[0];
    textureStore(dst_img, vec2<u32>(gid.xy), c);
}

@compute @workgroup_size(64)
fn reduce(@builtin(global_invocation_id) gid: vec3<u32>) {
    let g = args[1];
}

@vertex
fn vs_quad(@builtin(vertex_index) vi: u32) -> @builtin(position) vec4<f32> {
    return vec4<f32>(0.0);
}

@fragment
fn fs_fill() -> @location(0) vec4<f32> { return helper(vec2<f32>(0.0, 0.0)); }
"#;

    #[test]
    fn scans_stages_and_workgroup_sizes() {
        let entries = scan_entry_points(SRC);
        let main = &entries["main_pass"];
        assert_eq!(main.stage, EntryStage::Compute);
        assert_eq!(main.workgroup_size, [8, 4, 1]);

        let reduce = &entries["reduce"];
        assert_eq!(reduce.workgroup_size, [64, 1, 1]);

        assert_eq!(entries["vs_quad"].stage, EntryStage::Vertex);
        assert_eq!(entries["fs_fill"].stage, EntryStage::Fragment);
    }

    #[test]
    fn helper_functions_are_not_entry_points() {
        let entries = scan_entry_points(SRC);
        assert!(!entries.contains_key("helper"));
    }

    #[test]
    fn binding_usage_follows_helper_calls() {
        let entries = scan_entry_points(SRC);
        assert_eq!(entries["main_pass"].used_bindings, vec![0, 1, 2, 3]);
        assert_eq!(entries["reduce"].used_bindings, vec![0]);
        assert_eq!(entries["vs_quad"].used_bindings, Vec::<u32>::new());
        assert_eq!(entries["fs_fill"].used_bindings, vec![1, 2]);
    }

    #[test]
    fn non_literal_workgroup_size_falls_back() {
        assert_eq!(parse_workgroup_size("@workgroup_size(WG, 1, 1)"), None);
        assert_eq!(parse_workgroup_size("@workgroup_size(0)"), None);
        assert_eq!(parse_workgroup_size("@workgroup_size(16, 16)"), Some([16, 16, 1]));
    }
}
