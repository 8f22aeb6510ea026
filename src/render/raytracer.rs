//! Two-level ray tracer: a quantized TLAS over instances, per-mesh BLAS
//! underneath.
//!
//! Each camera view renders into its own RGBA + depth target. On hitting a
//! TLAS leaf the ray is transformed into the instance's local frame (with
//! the direction renormalized and the scale factor tracked so reported
//! distances stay in world units), traced through the mesh BVH, and the
//! winning normal is brought back to world space. Rows of pixels are a
//! rayon parallel-for, the CPU rendition of the one-thread-per-pixel GPU
//! deployment.

use glam::{Quat, Vec2, Vec3};
use rayon::prelude::*;

use crate::geo::Aabb;

use super::mesh_bvh::{HitInfo, MeshBvh};
use super::qbvh::Qbvh;

/// Far cutoff for primary rays.
pub const T_MAX: f32 = 10_000.0;

/// Ambient lighting floor.
const AMBIENT: f32 = 0.4;

/// Fixed scene light direction.
const LIGHT_DIR: Vec3 = Vec3::new(0.5, 0.5, 0.0);

/// One renderable object instance in a world.
#[derive(Debug, Clone, Copy)]
pub struct Instance {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    /// Index into the renderer's mesh table.
    pub mesh: u32,
}

/// One camera view. The convention is y-forward, z-up: the camera looks
/// along its local +y axis.
#[derive(Debug, Clone, Copy)]
pub struct RenderView {
    pub position: Vec3,
    pub rotation: Quat,
    /// Projection scale: the image plane's half-height at unit distance is
    /// `1 / |y_scale|`.
    pub y_scale: f32,
}

/// What to write per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Depth only.
    Depth,
    /// Shaded color plus depth.
    Rgbd,
}

/// Per-view output buffers, overwritten every frame.
#[derive(Debug, Clone)]
pub struct RenderTarget {
    resolution: u32,
    /// RGBA8, row-major.
    pub color: Vec<u8>,
    /// 32-bit depth, row-major; zero on miss.
    pub depth: Vec<f32>,
}

impl RenderTarget {
    pub fn new(resolution: u32) -> Self {
        let pixels = (resolution * resolution) as usize;
        Self {
            resolution,
            color: vec![0; pixels * 4],
            depth: vec![0.0; pixels],
        }
    }

    #[inline]
    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    #[inline]
    pub fn depth_at(&self, x: u32, y: u32) -> f32 {
        self.depth[(y * self.resolution + x) as usize]
    }
}

/// Base color and optional texture reference.
#[derive(Debug, Clone, Copy)]
pub struct Material {
    pub color: Vec3,
    pub texture: Option<u32>,
}

/// CPU-side RGBA8 texture sampled at hit UVs.
#[derive(Debug, Clone)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl Texture {
    /// Nearest sample with wrap-around addressing.
    fn sample(&self, uv: Vec2) -> Vec3 {
        let x = ((uv.x.rem_euclid(1.0) * self.width as f32) as u32).min(self.width - 1);
        let y = ((uv.y.rem_euclid(1.0) * self.height as f32) as u32).min(self.height - 1);
        let idx = ((y * self.width + x) * 4) as usize;
        Vec3::new(
            self.rgba[idx] as f32 / 255.0,
            self.rgba[idx + 1] as f32 / 255.0,
            self.rgba[idx + 2] as f32 / 255.0,
        )
    }
}

/// Lambert plus ambient with the fixed light direction.
fn lighting(diffuse: Vec3, normal: Vec3) -> Vec3 {
    (normal.dot(LIGHT_DIR).max(0.0) + AMBIENT).min(1.0) * diffuse
}

struct TraceResult {
    color: Vec3,
    depth: f32,
}

/// The ray tracing backend: mesh and material tables shared by all worlds.
#[derive(Debug, Default)]
pub struct Raytracer {
    pub meshes: Vec<MeshBvh>,
    pub materials: Vec<Material>,
    pub textures: Vec<Texture>,
}

/// TLAS for one world's instances, rebuilt when instances move.
#[derive(Debug, Default)]
pub struct Tlas {
    tree: Qbvh,
}

impl Tlas {
    /// Build over the instances' world bounds.
    pub fn build(raytracer: &Raytracer, instances: &[Instance]) -> Self {
        let aabbs: Vec<Aabb> = instances
            .iter()
            .map(|instance| {
                raytracer.meshes[instance.mesh as usize]
                    .local_aabb()
                    .apply_trs(instance.position, instance.rotation, instance.scale)
            })
            .collect();
        Self {
            tree: Qbvh::build(&aabbs),
        }
    }
}

impl Raytracer {
    /// Trace one ray through the two-level structure. Returns the closest
    /// hit with `t_hit` in world units.
    pub fn trace_ray_tlas(
        &self,
        tlas: &Tlas,
        instances: &[Instance],
        origin: Vec3,
        dir: Vec3,
        t_max: f32,
    ) -> Option<HitInfo> {
        let mut closest: Option<HitInfo> = None;

        tlas.tree.trace(origin, dir, t_max, |leaf, t_best| {
            let instance = &instances[leaf as usize];

            // Instances scaled away to nothing are skipped
            if instance.scale == Vec3::ZERO {
                return None;
            }

            let inv_rot = instance.rotation.inverse();
            let inv_scale = instance.scale.recip();
            let local_origin = inv_scale * (inv_rot * (origin - instance.position));
            let local_dir = inv_scale * (inv_rot * dir);

            let t_scale = local_dir.length();
            let local_dir = local_dir / t_scale;

            let bvh = &self.meshes[instance.mesh as usize];
            let hit = bvh.trace_ray(local_origin, local_dir, t_best * t_scale)?;

            let t_world = hit.t_hit / t_scale;
            let normal = (instance.rotation * (instance.scale * hit.normal)).normalize();
            closest = Some(HitInfo {
                t_hit: t_world,
                normal,
                ..hit
            });
            Some(t_world)
        });

        closest
    }

    /// Camera ray for a pixel center: y-forward frame, square viewport.
    fn pixel_ray(view: &RenderView, resolution: u32, x: u32, y: u32) -> Vec3 {
        let inv_rot = view.rotation.inverse();
        let forward = (inv_rot * Vec3::Y).normalize();
        let u_axis = inv_rot * Vec3::X;
        let v_axis = forward.cross(u_axis).normalize();

        let h = 1.0 / view.y_scale.abs();
        let viewport = 2.0 * h;
        let horizontal = u_axis * viewport;
        let vertical = v_axis * viewport;
        let lower_left = view.position - horizontal / 2.0 - vertical / 2.0 + forward;

        let pixel_u = (x as f32 + 0.5) / resolution as f32;
        let pixel_v = (y as f32 + 0.5) / resolution as f32;

        (lower_left + pixel_u * horizontal + pixel_v * vertical - view.position).normalize()
    }

    fn shade(&self, hit: &HitInfo, mode: RenderMode) -> TraceResult {
        if mode == RenderMode::Depth {
            return TraceResult {
                color: Vec3::ZERO,
                depth: hit.t_hit,
            };
        }

        let mut color = match hit.material {
            Some(material) => {
                let material = &self.materials[material as usize];
                let mut color = material.color;
                if let Some(texture) = material.texture {
                    let uv = Vec2::new(hit.uv.x, 1.0 - hit.uv.y);
                    color *= self.textures[texture as usize].sample(uv);
                }
                color
            }
            None => Vec3::ONE,
        };
        color = lighting(color, hit.normal);

        TraceResult {
            color,
            depth: hit.t_hit,
        }
    }

    /// Render every view of one world into its target. Pixel rows are a
    /// parallel-for; the TLAS and instance tables are shared read-only.
    pub fn render_views(
        &self,
        tlas: &Tlas,
        instances: &[Instance],
        views: &[RenderView],
        targets: &mut [RenderTarget],
        mode: RenderMode,
    ) {
        assert_eq!(views.len(), targets.len(), "one target per view");

        for (view, target) in views.iter().zip(targets.iter_mut()) {
            let resolution = target.resolution;
            let row_bytes = (resolution * 4) as usize;

            target
                .color
                .par_chunks_mut(row_bytes)
                .zip(target.depth.par_chunks_mut(resolution as usize))
                .enumerate()
                .for_each(|(y, (color_row, depth_row))| {
                    for x in 0..resolution {
                        let dir = Self::pixel_ray(view, resolution, x, y as u32);
                        let hit = self.trace_ray_tlas(tlas, instances, view.position, dir, T_MAX);

                        let result = match hit {
                            Some(hit) => self.shade(&hit, mode),
                            None => TraceResult {
                                color: Vec3::ZERO,
                                depth: 0.0,
                            },
                        };

                        depth_row[x as usize] = result.depth;
                        if mode == RenderMode::Rgbd {
                            let base = (x * 4) as usize;
                            color_row[base] = (result.color.x * 255.0) as u8;
                            color_row[base + 1] = (result.color.y * 255.0) as u8;
                            color_row[base + 2] = (result.color.z * 255.0) as u8;
                            color_row[base + 3] = 255;
                        }
                    }
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::mesh_bvh::TriangleMesh;

    fn unit_box_tracer() -> Raytracer {
        Raytracer {
            meshes: vec![MeshBvh::build(TriangleMesh::box_mesh(Vec3::ZERO, Vec3::ONE))],
            materials: Vec::new(),
            textures: Vec::new(),
        }
    }

    fn identity_instance(position: Vec3) -> Instance {
        Instance {
            position,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            mesh: 0,
        }
    }

    #[test]
    fn test_tlas_hits_and_misses() {
        let tracer = unit_box_tracer();
        let instances = [
            identity_instance(Vec3::ZERO),
            identity_instance(Vec3::splat(2.0)),
        ];
        let tlas = Tlas::build(&tracer, &instances);

        let hit = tracer
            .trace_ray_tlas(&tlas, &instances, Vec3::new(-1.0, 0.5, 0.5), Vec3::X, T_MAX)
            .unwrap();
        assert!((hit.t_hit - 1.0).abs() < 1e-4);

        let hit = tracer
            .trace_ray_tlas(&tlas, &instances, Vec3::new(0.5, -1.0, 0.5), Vec3::Y, T_MAX)
            .unwrap();
        assert!((hit.t_hit - 1.0).abs() < 1e-4);

        assert!(tracer
            .trace_ray_tlas(&tlas, &instances, Vec3::splat(10.0), Vec3::X, T_MAX)
            .is_none());
    }

    #[test]
    fn test_scaled_instance_distances_stay_world_units() {
        let tracer = unit_box_tracer();
        // Doubled cube spanning [0, 2]^3
        let instances = [Instance {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::splat(2.0),
            mesh: 0,
        }];
        let tlas = Tlas::build(&tracer, &instances);

        let hit = tracer
            .trace_ray_tlas(&tlas, &instances, Vec3::new(-3.0, 1.0, 1.0), Vec3::X, T_MAX)
            .unwrap();
        assert!((hit.t_hit - 3.0).abs() < 1e-3, "t = {}", hit.t_hit);
        assert!((hit.normal - Vec3::NEG_X).length() < 1e-3);
    }

    #[test]
    fn test_zero_scale_instances_skipped() {
        let tracer = unit_box_tracer();
        let instances = [Instance {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ZERO,
            mesh: 0,
        }];
        let tlas = Tlas::build(&tracer, &instances);

        assert!(tracer
            .trace_ray_tlas(&tlas, &instances, Vec3::new(-1.0, 0.5, 0.5), Vec3::X, T_MAX)
            .is_none());
    }

    #[test]
    fn test_closest_instance_wins() {
        let tracer = unit_box_tracer();
        let instances = [
            identity_instance(Vec3::new(5.0, 0.0, 0.0)),
            identity_instance(Vec3::new(2.0, 0.0, 0.0)),
        ];
        let tlas = Tlas::build(&tracer, &instances);

        let hit = tracer
            .trace_ray_tlas(&tlas, &instances, Vec3::new(0.0, 0.5, 0.5), Vec3::X, T_MAX)
            .unwrap();
        assert!((hit.t_hit - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_render_depth_view() {
        let tracer = unit_box_tracer();
        let instances = [identity_instance(Vec3::ZERO)];
        let tlas = Tlas::build(&tracer, &instances);

        // Camera behind the cube looking along +y
        let views = [RenderView {
            position: Vec3::new(0.5, -3.0, 0.5),
            rotation: Quat::IDENTITY,
            y_scale: 1.0,
        }];
        let mut targets = [RenderTarget::new(16)];

        tracer.render_views(&tlas, &instances, &views, &mut targets, RenderMode::Rgbd);

        // Center pixel sees the front face three units away
        let center = targets[0].depth_at(8, 8);
        assert!((center - 3.0).abs() < 0.05, "center depth {center}");

        // Corner rays miss: zero depth, black pixel, opaque alpha
        assert_eq!(targets[0].depth_at(0, 0), 0.0);
        assert_eq!(targets[0].color[0], 0);
        assert_eq!(targets[0].color[3], 255);

        // Hit pixels carry opaque alpha
        let center_idx = ((8 * 16 + 8) * 4) as usize;
        assert_eq!(targets[0].color[center_idx + 3], 255);
    }
}
