use fxrt::{ExecContext, ExternalImage, ProgramLibrary, Resource, WrapMode, request_device, wgpu};

fn gpu() -> Option<(wgpu::Device, wgpu::Queue)> {
    match request_device() {
        Ok(pair) => Some(pair),
        Err(e) if e.to_string().contains("no gpu adapter available") => None,
        Err(e) => panic!("device request failed: {e}"),
    }
}

const SCALE_SRC: &str = r#"
struct Args {
    gain: f32,
    bias: f32,
    pad0: f32,
    pad1: f32,
}

@group(0) @binding(0) var<uniform> args: Args;
@group(0) @binding(1) var<storage, read_write> values: array<f32>;

@compute @workgroup_size(64)
fn scale(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i < arrayLength(&values)) {
        values[i] = values[i] * args.gain + args.bias;
    }
}
"#;

const FILL_SRC: &str = r#"
@group(0) @binding(0) var<uniform> args: vec4<f32>;
@group(0) @binding(3) var out_img: texture_storage_2d<rgba8unorm, write>;

@compute @workgroup_size(8, 8, 1)
fn fill(@builtin(global_invocation_id) gid: vec3<u32>) {
    let dims = textureDimensions(out_img);
    if (gid.x < dims.x && gid.y < dims.y) {
        textureStore(out_img, gid.xy, vec4<f32>(args.x, args.y, 0.0, 1.0));
    }
}
"#;

#[test]
fn buffer_dispatch_round_trip() {
    let Some((device, queue)) = gpu() else { return };
    let library = ProgramLibrary::new(&device, SCALE_SRC).unwrap();
    let mut ctx = ExecContext::new(&device, &queue, library);

    assert!(ctx.has_kernel("scale"));
    assert_eq!(ctx.input("never_set"), 0.0);

    let values = ctx.add_resource(Resource::buffer("values", 8, 1));
    for (i, v) in ctx
        .resource_mut(values)
        .unwrap()
        .data_mut()
        .iter_mut()
        .enumerate()
    {
        *v = i as f32;
    }

    ctx.dispatch("scale", [8, 1, 1], &[2.0, 1.0]);
    ctx.drain().unwrap();

    let data = ctx.resource(values).unwrap().data();
    for (i, &v) in data.iter().enumerate() {
        assert!((v - (i as f32 * 2.0 + 1.0)).abs() < 1e-6, "element {i}: {v}");
    }
}

#[test]
fn image_dispatch_writes_storage_texture() {
    let Some((device, queue)) = gpu() else { return };
    let library = ProgramLibrary::new(&device, FILL_SRC).unwrap();
    let mut ctx = ExecContext::new(&device, &queue, library);

    let img = ctx.add_resource(Resource::image("out", 16, 16, WrapMode::Clamp));
    ctx.dispatch("fill", [16, 16, 1], &[0.25, 0.5]);
    ctx.drain().unwrap();

    let data = ctx.resource(img).unwrap().data();
    assert_eq!(data.len(), 16 * 16 * 4);
    // Round trip through rgba8 quantizes to byte steps.
    assert!((data[0] - 0.25).abs() < 1.0 / 255.0, "r = {}", data[0]);
    assert!((data[1] - 0.5).abs() < 1.0 / 255.0, "g = {}", data[1]);
    assert!(data[2].abs() < 1.0 / 255.0, "b = {}", data[2]);
    assert!((data[3] - 1.0).abs() < 1.0 / 255.0, "a = {}", data[3]);
}

#[test]
fn second_frame_reuses_device_allocations() {
    let Some((device, queue)) = gpu() else { return };
    let library = ProgramLibrary::new(&device, SCALE_SRC).unwrap();
    let mut ctx = ExecContext::new(&device, &queue, library);

    let values = ctx.add_resource(Resource::buffer("values", 16, 1));
    ctx.dispatch("scale", [16, 1, 1], &[1.0, 1.0]);
    ctx.drain().unwrap();
    ctx.dispatch("scale", [16, 1, 1], &[1.0, 1.0]);
    ctx.drain().unwrap();

    let allocs = ctx
        .actions()
        .iter()
        .filter(|a| a.kind == fxrt::ActionKind::Alloc)
        .count();
    assert_eq!(allocs, 1, "persistent buffer must be reused across frames");

    // Two frames of +1 over zero-initialized data.
    let data = ctx.resource(values).unwrap().data();
    assert!(data.iter().all(|&v| (v - 2.0).abs() < 1e-6));
}

#[test]
fn unknown_kernel_is_a_soft_no_op() {
    let Some((device, queue)) = gpu() else { return };
    let library = ProgramLibrary::new(&device, SCALE_SRC).unwrap();
    let mut ctx = ExecContext::new(&device, &queue, library);

    let values = ctx.add_resource(Resource::buffer("values", 4, 1));
    ctx.resource_mut(values).unwrap().data_mut()[0] = 7.0;

    ctx.dispatch("does_not_exist", [4, 1, 1], &[]);
    ctx.drain().unwrap();

    assert_eq!(ctx.resource(values).unwrap().data()[0], 7.0);
    // Unknown names bail out before device state materializes, so nothing
    // is dispatched and nothing is allocated.
    assert!(ctx.actions().is_empty(), "actions: {:?}", ctx.actions());
}

#[test]
fn adding_a_resource_rebuilds_cached_kernels() {
    let Some((device, queue)) = gpu() else { return };
    let library = ProgramLibrary::new(&device, SCALE_SRC).unwrap();
    let mut ctx = ExecContext::new(&device, &queue, library);

    let values = ctx.add_resource(Resource::buffer("values", 4, 1));
    ctx.dispatch("scale", [4, 1, 1], &[1.0, 1.0]);
    ctx.drain().unwrap();

    // A wider resource list changes the binding layout; the memoized kernel
    // must be recompiled against it rather than replayed.
    ctx.add_resource(Resource::buffer("extra", 4, 1));
    ctx.dispatch("scale", [4, 1, 1], &[1.0, 1.0]);
    ctx.drain().unwrap();

    let data = ctx.resource(values).unwrap().data();
    assert!(data.iter().all(|&v| (v - 2.0).abs() < 1e-6), "data: {data:?}");
}

#[test]
fn return_value_replaces_previous_store() {
    let Some((device, queue)) = gpu() else { return };
    let library = ProgramLibrary::new(&device, SCALE_SRC).unwrap();
    let mut ctx = ExecContext::new(&device, &queue, library);

    assert!(ctx.return_value().is_empty());
    ctx.set_return_value(&[1.0, 2.0, 3.0]);
    assert_eq!(ctx.return_value(), &[1.0, 2.0, 3.0]);
    ctx.set_return_value(&[9.0]);
    assert_eq!(ctx.return_value(), &[9.0]);
}

const DRAW_SRC: &str = r#"
@vertex
fn vs_tri(@builtin(vertex_index) vi: u32) -> @builtin(position) vec4<f32> {
    var pos = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -3.0),
        vec2<f32>(3.0, 1.0),
        vec2<f32>(-1.0, 1.0),
    );
    return vec4<f32>(pos[vi], 0.0, 1.0);
}

@fragment
fn fs_solid() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.0, 0.0, 1.0);
}
"#;

fn host_texture(device: &wgpu::Device, format: wgpu::TextureFormat) -> ExternalImage {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("host_image"),
        size: wgpu::Extent3d {
            width: 8,
            height: 8,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    ExternalImage::new(texture)
}

#[test]
fn draw_survives_a_target_format_change() {
    let Some((device, queue)) = gpu() else { return };
    let library = ProgramLibrary::new(&device, DRAW_SRC).unwrap();
    let mut ctx = ExecContext::new(&device, &queue, library);

    let target = ctx.add_resource(Resource::external_image(
        "out",
        host_texture(&device, wgpu::TextureFormat::Rgba8Unorm),
    ));
    ctx.draw(target, "vs_tri", "fs_solid", 3, &[]);
    ctx.drain().unwrap();

    // The host hands the same slot back with a different pixel format; the
    // cached pipeline targets the old format and must not be replayed.
    ctx.attach_external(
        target,
        host_texture(&device, wgpu::TextureFormat::Rgba16Float),
    )
    .unwrap();
    ctx.draw(target, "vs_tri", "fs_solid", 3, &[]);
    ctx.drain().unwrap();

    let draws = ctx
        .actions()
        .iter()
        .filter(|a| a.kind == fxrt::ActionKind::Draw)
        .count();
    assert_eq!(draws, 2);
}

#[test]
fn resize_preserves_device_buffer_content() {
    let Some((device, queue)) = gpu() else { return };
    let library = ProgramLibrary::new(&device, SCALE_SRC).unwrap();
    let mut ctx = ExecContext::new(&device, &queue, library);

    let values = ctx.add_resource(Resource::buffer("values", 4, 1));
    for (i, v) in ctx
        .resource_mut(values)
        .unwrap()
        .data_mut()
        .iter_mut()
        .enumerate()
    {
        *v = 10.0 + i as f32;
    }

    // First frame materializes the persistent buffer.
    ctx.dispatch("scale", [4, 1, 1], &[1.0, 0.0]);
    ctx.drain().unwrap();

    // Growing keeps old elements, new tail reads as zero.
    ctx.resize_1d(values, 8, false);
    ctx.dispatch("scale", [8, 1, 1], &[1.0, 0.0]);
    ctx.drain().unwrap();

    let data = ctx.resource(values).unwrap().data();
    assert_eq!(data.len(), 8);
    for i in 0..4 {
        assert!((data[i] - (10.0 + i as f32)).abs() < 1e-6, "element {i}");
    }
    for &v in &data[4..] {
        assert_eq!(v, 0.0);
    }
}
