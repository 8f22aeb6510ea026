//! Bottom-level acceleration structure: a quantized BVH over the triangles
//! of one mesh.
//!
//! Built once per render mesh at init. Ray queries run the shared QBVH
//! traversal with a Moller-Trumbore test per candidate triangle and return
//! the closest hit in mesh-local units; the TLAS rescales into world units.

use glam::{Vec2, Vec3};

use crate::geo::{Aabb, NEAR_ZERO};

use super::qbvh::Qbvh;

/// Closest-hit record in mesh-local space.
#[derive(Debug, Clone, Copy)]
pub struct HitInfo {
    pub t_hit: f32,
    pub normal: Vec3,
    pub uv: Vec2,
    pub material: Option<u32>,
}

/// Triangle geometry for ray tracing: shared vertices, triangle index
/// triples, optional per-vertex UVs, and one material for the whole mesh.
#[derive(Debug, Clone, Default)]
pub struct TriangleMesh {
    pub vertices: Vec<Vec3>,
    pub indices: Vec<[u32; 3]>,
    /// Per-vertex texture coordinates; empty when the mesh is untextured.
    pub uvs: Vec<Vec2>,
    pub material: Option<u32>,
}

impl TriangleMesh {
    /// Local bounds over all vertices.
    pub fn local_aabb(&self) -> Aabb {
        Aabb::from_points(self.vertices.iter().copied())
    }

    /// Axis-aligned box between `min` and `max`, two triangles per face.
    /// Test and demo geometry.
    pub fn box_mesh(min: Vec3, max: Vec3) -> Self {
        let corners = Aabb::new(min, max).corners();
        // Quad per face, wound outward
        let quads: [[usize; 4]; 6] = [
            [4, 5, 7, 6], // +z
            [1, 0, 2, 3], // -z
            [1, 3, 7, 5], // +x
            [0, 4, 6, 2], // -x
            [2, 6, 7, 3], // +y
            [0, 1, 5, 4], // -y
        ];

        let mut indices = Vec::with_capacity(12);
        for quad in quads {
            indices.push([quad[0] as u32, quad[1] as u32, quad[2] as u32]);
            indices.push([quad[0] as u32, quad[2] as u32, quad[3] as u32]);
        }

        Self {
            vertices: corners.to_vec(),
            indices,
            uvs: Vec::new(),
            material: None,
        }
    }
}

/// Moller-Trumbore ray/triangle intersection. Returns `(t, u, v)` of the
/// hit; degenerate or backfacing-parallel triangles simply miss.
fn intersect_triangle(
    origin: Vec3,
    dir: Vec3,
    v0: Vec3,
    v1: Vec3,
    v2: Vec3,
) -> Option<(f32, f32, f32)> {
    let edge1 = v1 - v0;
    let edge2 = v2 - v0;

    let p = dir.cross(edge2);
    let det = edge1.dot(p);
    if det.abs() < NEAR_ZERO {
        return None;
    }

    let inv_det = 1.0 / det;
    let s = origin - v0;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(edge1);
    let v = dir.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = edge2.dot(q) * inv_det;
    if t <= NEAR_ZERO {
        return None;
    }

    Some((t, u, v))
}

/// One mesh plus its quantized triangle tree.
#[derive(Debug, Clone)]
pub struct MeshBvh {
    mesh: TriangleMesh,
    tree: Qbvh,
    local_aabb: Aabb,
}

impl MeshBvh {
    /// Build the triangle tree. Leaf `i` refers to triangle `i`.
    pub fn build(mesh: TriangleMesh) -> Self {
        let triangle_aabbs: Vec<Aabb> = mesh
            .indices
            .iter()
            .map(|tri| {
                Aabb::from_points(tri.iter().map(|&i| mesh.vertices[i as usize]))
            })
            .collect();

        let local_aabb = mesh.local_aabb();
        Self {
            mesh,
            tree: Qbvh::build(&triangle_aabbs),
            local_aabb,
        }
    }

    #[inline]
    pub fn mesh(&self) -> &TriangleMesh {
        &self.mesh
    }

    #[inline]
    pub fn local_aabb(&self) -> Aabb {
        self.local_aabb
    }

    /// Closest hit along the ray within `t_max`, in mesh-local units.
    /// `dir` must be normalized.
    pub fn trace_ray(&self, origin: Vec3, dir: Vec3, t_max: f32) -> Option<HitInfo> {
        let mesh = &self.mesh;
        let mut closest: Option<HitInfo> = None;

        self.tree.trace(origin, dir, t_max, |triangle, t_best| {
            let [i0, i1, i2] = mesh.indices[triangle as usize];
            let v0 = mesh.vertices[i0 as usize];
            let v1 = mesh.vertices[i1 as usize];
            let v2 = mesh.vertices[i2 as usize];

            let (t, u, v) = intersect_triangle(origin, dir, v0, v1, v2)?;
            if t >= t_best {
                return None;
            }

            // Geometric normal, oriented against the ray
            let mut normal = (v1 - v0).cross(v2 - v0).normalize();
            if normal.dot(dir) > 0.0 {
                normal = -normal;
            }

            let uv = if mesh.uvs.is_empty() {
                Vec2::new(u, v)
            } else {
                let w = 1.0 - u - v;
                mesh.uvs[i0 as usize] * w + mesh.uvs[i1 as usize] * u + mesh.uvs[i2 as usize] * v
            };

            closest = Some(HitInfo {
                t_hit: t,
                normal,
                uv,
                material: mesh.material,
            });
            Some(t)
        });

        closest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_hit_and_miss() {
        let v0 = Vec3::new(-1.0, -1.0, 0.0);
        let v1 = Vec3::new(1.0, -1.0, 0.0);
        let v2 = Vec3::new(0.0, 1.0, 0.0);

        let hit = intersect_triangle(Vec3::new(0.0, 0.0, -2.0), Vec3::Z, v0, v1, v2);
        let (t, u, v) = hit.unwrap();
        assert!((t - 2.0).abs() < 1e-5);
        assert!(u >= 0.0 && v >= 0.0 && u + v <= 1.0);

        // Off to the side
        let miss = intersect_triangle(Vec3::new(5.0, 0.0, -2.0), Vec3::Z, v0, v1, v2);
        assert!(miss.is_none());

        // Parallel to the plane
        let miss = intersect_triangle(Vec3::new(0.0, 0.0, -2.0), Vec3::X, v0, v1, v2);
        assert!(miss.is_none());
    }

    #[test]
    fn test_box_mesh_trace() {
        let bvh = MeshBvh::build(TriangleMesh::box_mesh(Vec3::ZERO, Vec3::ONE));

        let hit = bvh
            .trace_ray(Vec3::new(-1.0, 0.5, 0.5), Vec3::X, 10_000.0)
            .unwrap();
        assert!((hit.t_hit - 1.0).abs() < 1e-4);
        assert!((hit.normal - Vec3::NEG_X).length() < 1e-4);

        let hit = bvh
            .trace_ray(Vec3::new(0.5, -1.0, 0.5), Vec3::Y, 10_000.0)
            .unwrap();
        assert!((hit.t_hit - 1.0).abs() < 1e-4);

        assert!(bvh
            .trace_ray(Vec3::new(10.0, 10.0, 10.0), Vec3::X, 10_000.0)
            .is_none());
    }

    #[test]
    fn test_closest_hit_wins() {
        // Two parallel quads; the nearer one must be reported
        let mut mesh = TriangleMesh::box_mesh(Vec3::ZERO, Vec3::ONE);
        let far_box = TriangleMesh::box_mesh(Vec3::new(3.0, 0.0, 0.0), Vec3::new(4.0, 1.0, 1.0));
        let offset = mesh.vertices.len() as u32;
        mesh.vertices.extend(far_box.vertices);
        mesh.indices
            .extend(far_box.indices.iter().map(|t| [t[0] + offset, t[1] + offset, t[2] + offset]));

        let bvh = MeshBvh::build(mesh);
        let hit = bvh
            .trace_ray(Vec3::new(-1.0, 0.5, 0.5), Vec3::X, 10_000.0)
            .unwrap();
        assert!((hit.t_hit - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_trace_respects_t_max() {
        let bvh = MeshBvh::build(TriangleMesh::box_mesh(Vec3::ZERO, Vec3::ONE));
        assert!(bvh
            .trace_ray(Vec3::new(-1.0, 0.5, 0.5), Vec3::X, 0.5)
            .is_none());
    }
}
