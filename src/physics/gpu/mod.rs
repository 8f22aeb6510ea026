//! GPU-accelerated broad-phase using compute shaders.
//!
//! Offloads the AABB overlap sweep to the GPU for worlds with large body
//! counts; the rest of the pipeline stays on the CPU.
//!
//! # Strategy
//!
//! | Stage | CPU/GPU | Reason |
//! |-------|---------|--------|
//! | Broad-phase AABB sweep | GPU | Embarrassingly parallel pair testing |
//! | Narrow-phase SAT | CPU | Branch-heavy, poor GPU fit here |
//! | Ray tracing | CPU | Shares the rayon pool with the pipeline |
//!
//! GPU offload pays off past [`GPU_BODY_THRESHOLD`] bodies; below that the
//! readback latency dominates and the tree-based CPU path wins.

use std::sync::Arc;

use glam::Vec3;
use tracing::debug;

use crate::ecs::{ObjectId, ResponseType, Transform};
use crate::physics::broadphase::CandidateCollision;
use crate::physics::object::ObjectManager;

/// Minimum number of bodies before GPU offload is worthwhile.
pub const GPU_BODY_THRESHOLD: usize = 256;

/// Workgroup size matching the WGSL shader.
const WORKGROUP_SIZE: u32 = 64;

/// Margin added to every uploaded AABB, matching the CPU broad-phase.
const AABB_EXPANSION: f32 = 0.01;

/// GPU AABB record matching the shader layout.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuAabb {
    pub min: [f32; 3],
    /// Caller-side index carried through the kernel.
    pub index: u32,
    pub max: [f32; 3],
    pub _pad: u32,
}

/// One overlapping pair of caller-side indices.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuPair {
    pub a: u32,
    pub b: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct BroadphaseParams {
    num_aabbs: u32,
    max_pairs: u32,
    _pad0: u32,
    _pad1: u32,
}

/// Device and queue wrapper for the compute path.
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

impl GpuContext {
    /// Acquire a high-performance adapter and device.
    pub async fn new_async() -> anyhow::Result<Self> {
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
            .await?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("stampede compute device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: Default::default(),
            })
            .await?;

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
        })
    }

    /// Blocking variant of [`Self::new_async`].
    pub fn new_blocking() -> anyhow::Result<Self> {
        pollster::block_on(Self::new_async())
    }

    fn create_encoder(&self, label: Option<&str>) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label })
    }
}

/// Read a buffer back to the CPU synchronously through a staging copy.
fn read_buffer_sync<T: bytemuck::Pod>(ctx: &GpuContext, source: &wgpu::Buffer, size: u64) -> Vec<T> {
    let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("staging readback"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = ctx.create_encoder(Some("readback copy"));
    encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
    ctx.queue.submit([encoder.finish()]);

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        tx.send(result).unwrap();
    });
    let _ = ctx.device.poll(wgpu::PollType::Wait);
    rx.recv().unwrap().expect("failed to map staging buffer");

    let data = slice.get_mapped_range();
    let result: Vec<T> = bytemuck::cast_slice(&data).to_vec();
    drop(data);
    staging.unmap();

    result
}

fn storage_buffer(ctx: &GpuContext, size: u64, label: &str) -> wgpu::Buffer {
    ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

/// GPU broad-phase: an all-pairs AABB overlap kernel with an atomic pair
/// cursor, mirroring the CPU candidate buffer contract.
pub struct GpuBroadphase {
    pipeline: wgpu::ComputePipeline,
    data_bind_group: wgpu::BindGroup,
    params_bind_group: wgpu::BindGroup,
    aabb_buffer: wgpu::Buffer,
    pair_buffer: wgpu::Buffer,
    count_buffer: wgpu::Buffer,
    params_buffer: wgpu::Buffer,
    max_aabbs: usize,
    max_pairs: u32,
}

impl GpuBroadphase {
    /// Allocate buffers and compile the kernel.
    pub fn new(ctx: &GpuContext, max_aabbs: usize, max_pairs: u32) -> anyhow::Result<Self> {
        let data_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("broadphase data layout"),
                entries: &[
                    storage_entry(0, true),
                    storage_entry(1, false),
                    storage_entry(2, false),
                ],
            });

        let params_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("broadphase params layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });

        let shader = ctx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("broadphase compute"),
                source: wgpu::ShaderSource::Wgsl(
                    include_str!("../../shaders/compute/broadphase.wgsl").into(),
                ),
            });

        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("broadphase pipeline layout"),
                bind_group_layouts: &[&data_layout, &params_layout],
                push_constant_ranges: &[],
            });

        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("broadphase pipeline"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some("cs_broadphase"),
                compilation_options: Default::default(),
                cache: None,
            });

        let aabb_buffer = storage_buffer(
            ctx,
            (max_aabbs * std::mem::size_of::<GpuAabb>()) as u64,
            "aabb buffer",
        );
        let pair_buffer = storage_buffer(
            ctx,
            max_pairs as u64 * std::mem::size_of::<GpuPair>() as u64,
            "pair buffer",
        );
        let count_buffer = storage_buffer(ctx, 4, "pair count buffer");
        let params_buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("broadphase params"),
            size: std::mem::size_of::<BroadphaseParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let data_bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("broadphase data"),
            layout: &data_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: aabb_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: pair_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: count_buffer.as_entire_binding(),
                },
            ],
        });
        let params_bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("broadphase params"),
            layout: &params_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: params_buffer.as_entire_binding(),
            }],
        });

        Ok(Self {
            pipeline,
            data_bind_group,
            params_bind_group,
            aabb_buffer,
            pair_buffer,
            count_buffer,
            params_buffer,
            max_aabbs,
            max_pairs,
        })
    }

    /// Whether the body count justifies the dispatch + readback round trip.
    pub fn should_use_gpu(body_count: usize) -> bool {
        body_count >= GPU_BODY_THRESHOLD
    }

    /// Run the overlap kernel over `aabbs` and read the pair list back.
    pub fn find_pairs(&self, ctx: &GpuContext, aabbs: &[GpuAabb]) -> Vec<GpuPair> {
        assert!(aabbs.len() <= self.max_aabbs, "GPU AABB capacity exceeded");
        if aabbs.len() < 2 {
            return Vec::new();
        }

        ctx.queue
            .write_buffer(&self.aabb_buffer, 0, bytemuck::cast_slice(aabbs));
        ctx.queue
            .write_buffer(&self.count_buffer, 0, bytemuck::bytes_of(&0u32));
        ctx.queue.write_buffer(
            &self.params_buffer,
            0,
            bytemuck::bytes_of(&BroadphaseParams {
                num_aabbs: aabbs.len() as u32,
                max_pairs: self.max_pairs,
                _pad0: 0,
                _pad1: 0,
            }),
        );

        let workgroups = (aabbs.len() as u32).div_ceil(WORKGROUP_SIZE);
        let mut encoder = ctx.create_encoder(Some("broadphase dispatch"));
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("broadphase"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.data_bind_group, &[]);
            pass.set_bind_group(1, &self.params_bind_group, &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }
        ctx.queue.submit([encoder.finish()]);

        let count: Vec<u32> = read_buffer_sync(ctx, &self.count_buffer, 4);
        let count = count[0].min(self.max_pairs) as usize;
        if count == 0 {
            return Vec::new();
        }

        let mut pairs: Vec<GpuPair> = read_buffer_sync(
            ctx,
            &self.pair_buffer,
            (count * std::mem::size_of::<GpuPair>()) as u64,
        );
        pairs.truncate(count);
        debug!(bodies = aabbs.len(), pairs = pairs.len(), "gpu broad-phase");
        pairs
    }

    /// Full GPU candidate emission over a world: upload every registered
    /// entity's world AABB, run the kernel, then apply the same
    /// static-static filtering and primitive fan-out as the CPU path.
    pub fn find_candidates(
        &self,
        ctx: &GpuContext,
        world: &hecs::World,
        objects: &ObjectManager,
    ) -> Vec<CandidateCollision> {
        struct Entry {
            entity: hecs::Entity,
            response: ResponseType,
            object: ObjectId,
        }

        let mut entries = Vec::new();
        let mut aabbs = Vec::new();
        for (entity, (transform, object, response)) in world
            .query::<(&Transform, &ObjectId, &ResponseType)>()
            .iter()
        {
            let aabb = objects
                .object_aabb(*object)
                .apply_trs(transform.position, transform.rotation, transform.scale)
                .expanded(AABB_EXPANSION);
            aabbs.push(GpuAabb {
                min: aabb.min.to_array(),
                index: entries.len() as u32,
                max: aabb.max.to_array(),
                _pad: 0,
            });
            entries.push(Entry {
                entity,
                response: *response,
                object: *object,
            });
        }

        let mut candidates = Vec::new();
        for pair in self.find_pairs(ctx, &aabbs) {
            let a = &entries[pair.a as usize];
            let b = &entries[pair.b as usize];
            if a.response == ResponseType::Static && b.response == ResponseType::Static {
                continue;
            }
            let (a, b) = if a.entity < b.entity { (a, b) } else { (b, a) };

            let a_prims = objects.primitives(a.object).len() as u32;
            let b_prims = objects.primitives(b.object).len() as u32;
            for a_prim in 0..a_prims {
                for b_prim in 0..b_prims {
                    candidates.push(CandidateCollision {
                        a: a.entity,
                        b: b.entity,
                        a_prim,
                        b_prim,
                    });
                }
            }
        }
        candidates
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Build a [`GpuAabb`] from bounds and a caller-side index.
pub fn gpu_aabb(min: Vec3, max: Vec3, index: u32) -> GpuAabb {
    GpuAabb {
        min: min.to_array(),
        index,
        max: max.to_array(),
        _pad: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests are skipped when no adapter is available (CI without a GPU).
    fn test_context() -> Option<GpuContext> {
        GpuContext::new_blocking().ok()
    }

    #[test]
    fn test_gpu_pairs_match_cpu_brute_force() {
        let Some(ctx) = test_context() else {
            return;
        };

        let mut aabbs = Vec::new();
        for i in 0..300u32 {
            let f = i as f32;
            let min = Vec3::new((f * 1.3) % 40.0, (f * 2.7) % 40.0, (f * 0.9) % 40.0);
            aabbs.push(gpu_aabb(min, min + Vec3::splat(1.5), i));
        }

        let broadphase = GpuBroadphase::new(&ctx, 1024, 65536).unwrap();
        let mut gpu: Vec<(u32, u32)> = broadphase
            .find_pairs(&ctx, &aabbs)
            .iter()
            .map(|p| (p.a.min(p.b), p.a.max(p.b)))
            .collect();
        gpu.sort_unstable();

        let overlaps = |a: &GpuAabb, b: &GpuAabb| {
            a.min[0] <= b.max[0]
                && a.max[0] >= b.min[0]
                && a.min[1] <= b.max[1]
                && a.max[1] >= b.min[1]
                && a.min[2] <= b.max[2]
                && a.max[2] >= b.min[2]
        };
        let mut cpu = Vec::new();
        for i in 0..aabbs.len() {
            for j in (i + 1)..aabbs.len() {
                if overlaps(&aabbs[i], &aabbs[j]) {
                    cpu.push((i as u32, j as u32));
                }
            }
        }
        cpu.sort_unstable();

        assert_eq!(gpu, cpu);
    }

    #[test]
    fn test_gpu_threshold() {
        assert!(!GpuBroadphase::should_use_gpu(10));
        assert!(GpuBroadphase::should_use_gpu(GPU_BODY_THRESHOLD));
    }
}
