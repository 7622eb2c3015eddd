//! wgpu backend implementation.
//!
//! Runs the per-pixel stages as compute shaders in `f32`. Reductions come
//! back as per-workgroup partials and are finished on the host in `f64`;
//! percentiles are selected on the host from downloaded arrays.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, trace};
use wgpu::util::DeviceExt;

use macenko_math::{percentiles, CrossProducts, DVec3};

use super::primitives::{ArrayHandle, ReconstructParams, StainPrimitives, TissueStats};
use crate::shaders;
use crate::{ComputeError, ComputeResult};

/// Invocations per workgroup, matching `@workgroup_size` in every shader.
const WORKGROUP_SIZE: u32 = 256;

/// Per-dimension dispatch limit guaranteed by WebGPU.
const MAX_GROUPS_PER_DIM: u32 = 65_535;

/// Floats written per workgroup by the moments kernel.
const MOMENT_SLOTS: usize = 6;

// =============================================================================
// Uniform Buffers
// =============================================================================

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct DensityUniform {
    len: u32,
    io: f32,
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct MomentsUniform {
    mean: [f32; 4],
    pixels: u32,
    pass_index: u32,
    beta: f32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct AnglesUniform {
    e0: [f32; 4],
    e1: [f32; 4],
    pixels: u32,
    beta: f32,
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct UnmixUniform {
    pinv0: [f32; 4],
    pinv1: [f32; 4],
    pixels: u32,
    _pad: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ReconstructUniform {
    h: [f32; 4],
    e: [f32; 4],
    ratio: [f32; 4],
    io: f32,
    pixels: u32,
    mode: u32,
    _pad: u32,
}

fn vec4(v: [f64; 3]) -> [f32; 4] {
    [v[0] as f32, v[1] as f32, v[2] as f32, 0.0]
}

// =============================================================================
// WgpuArray Handle
// =============================================================================

/// GPU buffer handle for `f32` array data.
pub struct WgpuArray {
    buffer: wgpu::Buffer,
    rows: usize,
    components: usize,
    size_bytes: u64,
}

impl WgpuArray {
    /// Bytes of valid data at the start of the buffer.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl ArrayHandle for WgpuArray {
    fn shape(&self) -> (usize, usize) {
        (self.rows, self.components)
    }
}

// =============================================================================
// Pipelines
// =============================================================================

struct Pipelines {
    density: wgpu::ComputePipeline,
    moments: wgpu::ComputePipeline,
    angles: wgpu::ComputePipeline,
    unmix: wgpu::ComputePipeline,
    reconstruct: wgpu::ComputePipeline,
}

// =============================================================================
// WgpuPrimitives
// =============================================================================

/// wgpu GPU primitives implementation.
pub struct WgpuPrimitives {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipelines: Pipelines,
    max_buffer_bytes: u64,
    adapter_name: String,
}

impl WgpuPrimitives {
    /// Check if wgpu is available.
    pub fn is_available() -> bool {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .is_some()
        })
    }

    /// Create new wgpu primitives.
    pub fn new() -> ComputeResult<Self> {
        pollster::block_on(Self::new_async())
    }

    /// Create new wgpu primitives asynchronously.
    pub async fn new_async() -> ComputeResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(ComputeError::NoAdapter)?;

        let adapter_limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("macenko_device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter_limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
                ..Default::default()
            }, None)
            .await
            .map_err(|e| ComputeError::DeviceCreation(e.to_string()))?;

        let info = adapter.get_info();
        let max_buffer_bytes = adapter_limits
            .max_buffer_size
            .min(u64::from(adapter_limits.max_storage_buffer_binding_size));
        debug!(
            adapter = %info.name,
            backend = ?info.backend,
            max_buffer_bytes,
            "wgpu device created"
        );

        let pipelines = Self::create_pipelines(&device);

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            pipelines,
            max_buffer_bytes,
            adapter_name: info.name,
        })
    }

    /// Name of the adapter the device was created on.
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn create_pipelines(device: &wgpu::Device) -> Pipelines {
        let create_pipeline = |source: &str, label: &str| -> wgpu::ComputePipeline {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None, // Auto layout
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            })
        };

        Pipelines {
            density: create_pipeline(shaders::OPTICAL_DENSITY, "density_pipeline"),
            moments: create_pipeline(shaders::TISSUE_MOMENTS, "moments_pipeline"),
            angles: create_pipeline(shaders::TISSUE_ANGLES, "angles_pipeline"),
            unmix: create_pipeline(shaders::CONCENTRATIONS, "unmix_pipeline"),
            reconstruct: create_pipeline(shaders::RECONSTRUCT, "reconstruct_pipeline"),
        }
    }

    fn create_uniform<T: Pod>(&self, label: &str, value: &T) -> wgpu::Buffer {
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::bytes_of(value),
            usage: wgpu::BufferUsages::UNIFORM,
        })
    }

    /// Storage buffer for `floats` values, checked against device limits.
    fn create_storage(&self, label: &str, floats: usize) -> ComputeResult<wgpu::Buffer> {
        let size = self.checked_size(floats)?;
        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size.max(4),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }))
    }

    fn checked_size(&self, floats: usize) -> ComputeResult<u64> {
        let bytes = floats as u64 * 4;
        if bytes > self.max_buffer_bytes {
            return Err(ComputeError::ImageTooLarge { bytes, limit: self.max_buffer_bytes });
        }
        Ok(bytes)
    }

    fn bind(&self, pipeline: &wgpu::ComputePipeline, label: &str, buffers: &[&wgpu::Buffer]) -> wgpu::BindGroup {
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, b)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: b.as_entire_binding(),
            })
            .collect();

        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        })
    }

    /// Execute compute dispatch and wait.
    fn dispatch_and_wait(&self, pipeline: &wgpu::ComputePipeline, bind_group: &wgpu::BindGroup, workgroups: (u32, u32, u32)) {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("compute_encoder"),
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("compute_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(workgroups.0, workgroups.1, workgroups.2);
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);
    }

    /// Copy the first `size` bytes of `buffer` back to the host.
    fn read_buffer<T: Pod>(&self, buffer: &wgpu::Buffer, size: u64) -> ComputeResult<Vec<T>> {
        if size == 0 {
            return Ok(Vec::new());
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging_buffer"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| { let _ = tx.send(r); });
        self.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|_| ComputeError::OperationFailed("Map channel closed".into()))?
            .map_err(|e| ComputeError::OperationFailed(format!("Map failed: {e}")))?;

        let data = slice.get_mapped_range();
        let result: Vec<T> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();

        Ok(result)
    }

    fn download(&self, handle: &WgpuArray) -> ComputeResult<Vec<f32>> {
        self.read_buffer(&handle.buffer, handle.size_bytes)
    }

    /// Moments kernel pass; returns the per-workgroup partials.
    fn moments_pass(&self, od: &WgpuArray, beta: f64, pass_index: u32, mean: [f32; 4]) -> ComputeResult<Vec<f32>> {
        let pixels = index_u32(od.rows)?;
        let groups = pixels.div_ceil(WORKGROUP_SIZE);
        let partials = self.create_storage("moment_partials", groups as usize * MOMENT_SLOTS)?;
        let uniform = self.create_uniform("moments_uniform", &MomentsUniform {
            mean,
            pixels,
            pass_index,
            beta: beta as f32,
            _pad: 0,
        });

        let bind_group = self.bind(&self.pipelines.moments, "moments_bind_group", &[&od.buffer, &partials, &uniform]);
        self.dispatch_and_wait(&self.pipelines.moments, &bind_group, workgroups(pixels));
        self.read_buffer(&partials, groups as u64 * MOMENT_SLOTS as u64 * 4)
    }
}

/// Element count as a shader index.
fn index_u32(count: usize) -> ComputeResult<u32> {
    u32::try_from(count).map_err(|_| ComputeError::ImageTooLarge {
        bytes: count as u64 * 4,
        limit: u64::from(u32::MAX) * 4,
    })
}

/// 2D dispatch covering `items` invocations.
fn workgroups(items: u32) -> (u32, u32, u32) {
    let groups = items.div_ceil(WORKGROUP_SIZE);
    let x = groups.clamp(1, MAX_GROUPS_PER_DIM);
    (x, groups.div_ceil(x), 1)
}

fn expect_components(handle: &WgpuArray, components: usize) -> ComputeResult<()> {
    if handle.components != components {
        return Err(ComputeError::BufferSizeMismatch {
            expected: handle.rows * components,
            actual: handle.len(),
        });
    }
    Ok(())
}

impl StainPrimitives for WgpuPrimitives {
    type Handle = WgpuArray;

    fn upload_samples(&self, samples: &[u8]) -> ComputeResult<Self::Handle> {
        if samples.is_empty() || samples.len() % 3 != 0 {
            return Err(ComputeError::BufferSizeMismatch {
                expected: (samples.len() / 3).max(1) * 3,
                actual: samples.len(),
            });
        }
        let size_bytes = self.checked_size(samples.len())?;
        let data: Vec<f32> = samples.iter().map(|s| f32::from(*s)).collect();

        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("sample_buffer"),
            contents: bytemuck::cast_slice(&data),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        });

        Ok(WgpuArray { buffer, rows: samples.len() / 3, components: 3, size_bytes })
    }

    fn download_samples(&self, handle: &Self::Handle) -> ComputeResult<Vec<u8>> {
        // truncating, saturating cast
        Ok(self.download(handle)?.into_iter().map(|v| v as u8).collect())
    }

    fn exec_optical_density(&self, samples: &Self::Handle, io: f64) -> ComputeResult<Self::Handle> {
        trace!(rows = samples.rows, io, "wgpu::optical_density");
        let len = index_u32(samples.len())?;
        let dst = self.create_storage("od_buffer", samples.len())?;
        let uniform = self.create_uniform("density_uniform", &DensityUniform {
            len,
            io: io as f32,
            _pad: [0; 2],
        });

        let bind_group = self.bind(&self.pipelines.density, "density_bind_group", &[&samples.buffer, &dst, &uniform]);
        self.dispatch_and_wait(&self.pipelines.density, &bind_group, workgroups(len));

        Ok(WgpuArray {
            buffer: dst,
            rows: samples.rows,
            components: samples.components,
            size_bytes: samples.size_bytes,
        })
    }

    fn exec_tissue_stats(&self, od: &Self::Handle, beta: f64) -> ComputeResult<TissueStats> {
        expect_components(od, 3)?;
        trace!(rows = od.rows, beta, "wgpu::tissue_stats");

        let sums = self.moments_pass(od, beta, 0, [0.0; 4])?;
        let (mut count, mut sum) = (0usize, DVec3::ZERO);
        for p in sums.chunks_exact(MOMENT_SLOTS) {
            count += p[0] as usize;
            sum += DVec3::new(f64::from(p[1]), f64::from(p[2]), f64::from(p[3]));
        }
        if count == 0 {
            return Ok(TissueStats { count, mean: DVec3::ZERO, products: CrossProducts::default() });
        }
        let mean = sum / count as f64;

        // the kernel centers on the f32-rounded mean; shift back to `mean`
        let center = mean.as_vec3().as_dvec3();
        let partials = self.moments_pass(od, beta, 1, [center.x as f32, center.y as f32, center.z as f32, 0.0])?;
        let mut products = CrossProducts::default();
        for p in partials.chunks_exact(MOMENT_SLOTS) {
            products += CrossProducts {
                xx: f64::from(p[0]),
                xy: f64::from(p[1]),
                xz: f64::from(p[2]),
                yy: f64::from(p[3]),
                yz: f64::from(p[4]),
                zz: f64::from(p[5]),
            };
        }
        let d = mean - center;
        let n = count as f64;
        products.xx -= n * d.x * d.x;
        products.xy -= n * d.x * d.y;
        products.xz -= n * d.x * d.z;
        products.yy -= n * d.y * d.y;
        products.yz -= n * d.y * d.z;
        products.zz -= n * d.z * d.z;

        Ok(TissueStats { count, mean, products })
    }

    fn exec_tissue_angles(&self, od: &Self::Handle, beta: f64, e0: DVec3, e1: DVec3) -> ComputeResult<Self::Handle> {
        expect_components(od, 3)?;
        trace!(rows = od.rows, beta, "wgpu::tissue_angles");

        let pixels = index_u32(od.rows)?;
        let angles = self.create_storage("angle_buffer", od.rows)?;
        let counter = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("angle_counter"),
            contents: bytemuck::bytes_of(&0u32),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        });
        let uniform = self.create_uniform("angles_uniform", &AnglesUniform {
            e0: vec4(e0.to_array()),
            e1: vec4(e1.to_array()),
            pixels,
            beta: beta as f32,
            _pad: [0; 2],
        });

        let bind_group = self.bind(&self.pipelines.angles, "angles_bind_group", &[&od.buffer, &angles, &counter, &uniform]);
        self.dispatch_and_wait(&self.pipelines.angles, &bind_group, workgroups(pixels));

        let written = self.read_buffer::<u32>(&counter, 4)?;
        let rows = written.first().copied().unwrap_or(0) as usize;
        if rows > od.rows {
            return Err(ComputeError::OperationFailed(format!(
                "angle counter {} exceeds {} pixels",
                rows, od.rows
            )));
        }

        Ok(WgpuArray { buffer: angles, rows, components: 1, size_bytes: rows as u64 * 4 })
    }

    fn exec_unmix(&self, od: &Self::Handle, pinv: &[DVec3; 2]) -> ComputeResult<Self::Handle> {
        expect_components(od, 3)?;
        trace!(rows = od.rows, "wgpu::unmix");

        let pixels = index_u32(od.rows)?;
        let dst = self.create_storage("concentration_buffer", od.rows * 2)?;
        let uniform = self.create_uniform("unmix_uniform", &UnmixUniform {
            pinv0: vec4(pinv[0].to_array()),
            pinv1: vec4(pinv[1].to_array()),
            pixels,
            _pad: [0; 3],
        });

        let bind_group = self.bind(&self.pipelines.unmix, "unmix_bind_group", &[&od.buffer, &dst, &uniform]);
        self.dispatch_and_wait(&self.pipelines.unmix, &bind_group, workgroups(pixels));

        Ok(WgpuArray { buffer: dst, rows: od.rows, components: 2, size_bytes: od.rows as u64 * 8 })
    }

    fn exec_reconstruct(&self, concentrations: &Self::Handle, params: &ReconstructParams) -> ComputeResult<Self::Handle> {
        expect_components(concentrations, 2)?;
        trace!(rows = concentrations.rows, selection = ?params.selection, "wgpu::reconstruct");

        let pixels = index_u32(concentrations.rows)?;
        let dst = self.create_storage("reconstruct_buffer", concentrations.rows * 3)?;
        let uniform = self.create_uniform("reconstruct_uniform", &ReconstructUniform {
            h: vec4(params.basis.hematoxylin),
            e: vec4(params.basis.eosin),
            ratio: [params.ratio[0] as f32, params.ratio[1] as f32, 1.0, 1.0],
            io: params.io as f32,
            pixels,
            mode: params.selection as u32,
            _pad: 0,
        });

        let bind_group = self.bind(&self.pipelines.reconstruct, "reconstruct_bind_group", &[&concentrations.buffer, &dst, &uniform]);
        self.dispatch_and_wait(&self.pipelines.reconstruct, &bind_group, workgroups(pixels));

        Ok(WgpuArray {
            buffer: dst,
            rows: concentrations.rows,
            components: 3,
            size_bytes: concentrations.rows as u64 * 12,
        })
    }

    fn percentiles(&self, handle: &Self::Handle, component: usize, qs: &[f64]) -> ComputeResult<Vec<f64>> {
        if component >= handle.components {
            return Err(ComputeError::OperationFailed(format!(
                "component {} out of range for {} components",
                component, handle.components
            )));
        }
        let data = self.download(handle)?;
        let mut values: Vec<f64> = data
            .chunks_exact(handle.components)
            .map(|row| f64::from(row[component]))
            .collect();

        percentiles(&mut values, qs).ok_or_else(|| {
            ComputeError::OperationFailed(format!("percentiles {:?} of {} values", qs, values.len()))
        })
    }

    fn name(&self) -> &'static str {
        "wgpu"
    }
}
