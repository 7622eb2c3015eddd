//! WGSL compute shaders for stain normalization.
//!
//! Every kernel runs 256 invocations per workgroup over a 2D grid of
//! workgroups (`x` capped at 65535), flattened to one linear index.

/// Optical density of every sample: `-ln((s + 1) / io)`.
pub const OPTICAL_DENSITY: &str = r#"
struct Params {
    len: u32,
    io: f32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<storage, read> samples: array<f32>;
@group(0) @binding(1) var<storage, read_write> od: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(256)
fn main(
    @builtin(workgroup_id) wg: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
    @builtin(local_invocation_index) lid: u32,
) {
    let i = (wg.y * nwg.x + wg.x) * 256u + lid;
    if (i >= params.len) {
        return;
    }
    od[i] = -log((samples[i] + 1.0) / params.io);
}
"#;

/// Per-workgroup partial sums over tissue pixels.
///
/// Pass 0 writes `[count, sum_x, sum_y, sum_z, 0, 0]`, pass 1 writes the
/// six centered products `[xx, xy, xz, yy, yz, zz]` about `params.mean`.
pub const TISSUE_MOMENTS: &str = r#"
struct Params {
    mean: vec4<f32>,
    pixels: u32,
    pass_index: u32,
    beta: f32,
    _pad: u32,
}

@group(0) @binding(0) var<storage, read> od: array<f32>;
@group(0) @binding(1) var<storage, read_write> partials: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

var<workgroup> scratch: array<array<f32, 6>, 256>;

@compute @workgroup_size(256)
fn main(
    @builtin(workgroup_id) wg: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
    @builtin(local_invocation_index) lid: u32,
) {
    let group = wg.y * nwg.x + wg.x;
    let px = group * 256u + lid;

    var acc = array<f32, 6>(0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
    if (px < params.pixels) {
        let v = vec3<f32>(od[px * 3u], od[px * 3u + 1u], od[px * 3u + 2u]);
        if (all(v >= vec3<f32>(params.beta))) {
            if (params.pass_index == 0u) {
                acc[0] = 1.0;
                acc[1] = v.x;
                acc[2] = v.y;
                acc[3] = v.z;
            } else {
                let d = v - params.mean.xyz;
                acc[0] = d.x * d.x;
                acc[1] = d.x * d.y;
                acc[2] = d.x * d.z;
                acc[3] = d.y * d.y;
                acc[4] = d.y * d.z;
                acc[5] = d.z * d.z;
            }
        }
    }
    scratch[lid] = acc;
    workgroupBarrier();

    for (var stride = 128u; stride > 0u; stride = stride / 2u) {
        if (lid < stride) {
            for (var k = 0u; k < 6u; k = k + 1u) {
                scratch[lid][k] = scratch[lid][k] + scratch[lid + stride][k];
            }
        }
        workgroupBarrier();
    }

    let groups = (params.pixels + 255u) / 256u;
    if (lid == 0u && group < groups) {
        for (var k = 0u; k < 6u; k = k + 1u) {
            partials[group * 6u + k] = scratch[0][k];
        }
    }
}
"#;

/// Angle of every tissue pixel in the plane `(e0, e1)`, appended in
/// arbitrary order through an atomic counter.
pub const TISSUE_ANGLES: &str = r#"
struct Params {
    e0: vec4<f32>,
    e1: vec4<f32>,
    pixels: u32,
    beta: f32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<storage, read> od: array<f32>;
@group(0) @binding(1) var<storage, read_write> angles: array<f32>;
@group(0) @binding(2) var<storage, read_write> counter: atomic<u32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(256)
fn main(
    @builtin(workgroup_id) wg: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
    @builtin(local_invocation_index) lid: u32,
) {
    let px = (wg.y * nwg.x + wg.x) * 256u + lid;
    if (px >= params.pixels) {
        return;
    }
    let v = vec3<f32>(od[px * 3u], od[px * 3u + 1u], od[px * 3u + 2u]);
    if (!all(v >= vec3<f32>(params.beta))) {
        return;
    }
    let slot = atomicAdd(&counter, 1u);
    angles[slot] = atan2(dot(v, params.e1.xyz), dot(v, params.e0.xyz));
}
"#;

/// Stain concentrations: rows of the basis pseudo-inverse applied per pixel.
pub const CONCENTRATIONS: &str = r#"
struct Params {
    pinv0: vec4<f32>,
    pinv1: vec4<f32>,
    pixels: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

@group(0) @binding(0) var<storage, read> od: array<f32>;
@group(0) @binding(1) var<storage, read_write> conc: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(256)
fn main(
    @builtin(workgroup_id) wg: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
    @builtin(local_invocation_index) lid: u32,
) {
    let px = (wg.y * nwg.x + wg.x) * 256u + lid;
    if (px >= params.pixels) {
        return;
    }
    let v = vec3<f32>(od[px * 3u], od[px * 3u + 1u], od[px * 3u + 2u]);
    conc[px * 2u] = dot(params.pinv0.xyz, v);
    conc[px * 2u + 1u] = dot(params.pinv1.xyz, v);
}
"#;

/// Re-projection of rescaled concentrations through a stain basis.
///
/// `mode`: 0 = both stains, 1 = hematoxylin, 2 = eosin.
pub const RECONSTRUCT: &str = r#"
struct Params {
    h: vec4<f32>,
    e: vec4<f32>,
    ratio: vec4<f32>,
    io: f32,
    pixels: u32,
    mode: u32,
    _pad: u32,
}

@group(0) @binding(0) var<storage, read> conc: array<f32>;
@group(0) @binding(1) var<storage, read_write> dst: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(256)
fn main(
    @builtin(workgroup_id) wg: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
    @builtin(local_invocation_index) lid: u32,
) {
    let px = (wg.y * nwg.x + wg.x) * 256u + lid;
    if (px >= params.pixels) {
        return;
    }
    let c = vec2<f32>(conc[px * 2u], conc[px * 2u + 1u]) / params.ratio.xy;

    var od: vec3<f32>;
    switch params.mode {
        case 1u: { od = params.h.xyz * c.x; }
        case 2u: { od = params.e.xyz * c.y; }
        default: { od = params.h.xyz * c.x + params.e.xyz * c.y; }
    }

    let raw = params.io * exp(-od);
    let v = select(raw, vec3<f32>(254.0), raw > vec3<f32>(255.0));
    dst[px * 3u] = v.x;
    dst[px * 3u + 1u] = v.y;
    dst[px * 3u + 2u] = v.z;
}
"#;
