//! Half-edge convex mesh.
//!
//! Immutable hull representation consumed by the SAT narrow-phase. Each
//! undirected edge is stored as two directed half-edges with `twin`/`next`
//! links; navigation is index-based throughout. Meshes are built once at
//! object-table init (typically by the asset importer) and shared read-only.

use std::collections::HashMap;

use anyhow::{bail, Result};
use glam::Vec3;

use super::{Aabb, Plane};

/// One directed half-edge.
///
/// `next` walks counter-clockwise around `face`; `twin` is the opposite
/// direction of the same undirected edge on the adjacent face.
#[derive(Debug, Clone, Copy)]
pub struct HalfEdge {
    /// Vertex this half-edge leaves from.
    pub root_vertex: u32,
    /// Next half-edge around the same face.
    pub next: u32,
    /// Opposite half-edge on the adjacent face.
    pub twin: u32,
    /// Owning face index.
    pub face: u32,
}

/// Immutable convex hull as a half-edge mesh.
#[derive(Debug, Clone)]
pub struct HalfEdgeMesh {
    vertices: Vec<Vec3>,
    face_planes: Vec<Plane>,
    half_edges: Vec<HalfEdge>,
    /// One half-edge index per undirected edge (the lower-indexed of the pair).
    edges: Vec<u32>,
    /// First half-edge of each face.
    face_first_edge: Vec<u32>,
}

impl HalfEdgeMesh {
    /// Build from a convex polygon soup: shared vertices plus per-face
    /// vertex index loops, counter-clockwise when viewed from outside.
    ///
    /// Fails when a face has fewer than three vertices or an edge is not
    /// shared by exactly two faces (open or non-manifold input).
    pub fn from_polygons(vertices: Vec<Vec3>, faces: &[Vec<u32>]) -> Result<Self> {
        let mut half_edges: Vec<HalfEdge> = Vec::new();
        let mut face_planes = Vec::with_capacity(faces.len());
        let mut face_first_edge = Vec::with_capacity(faces.len());
        let mut directed: HashMap<(u32, u32), u32> = HashMap::new();

        for (face_idx, loop_) in faces.iter().enumerate() {
            if loop_.len() < 3 {
                bail!("face {face_idx} has {} vertices, need at least 3", loop_.len());
            }

            let first_he = half_edges.len() as u32;
            face_first_edge.push(first_he);

            for (i, &v0) in loop_.iter().enumerate() {
                let v1 = loop_[(i + 1) % loop_.len()];
                if v0 as usize >= vertices.len() || v1 as usize >= vertices.len() {
                    bail!("face {face_idx} references vertex out of range");
                }
                let he_idx = half_edges.len() as u32;
                if directed.insert((v0, v1), he_idx).is_some() {
                    bail!("directed edge ({v0}, {v1}) appears twice");
                }
                half_edges.push(HalfEdge {
                    root_vertex: v0,
                    next: first_he + ((i as u32 + 1) % loop_.len() as u32),
                    twin: u32::MAX,
                    face: face_idx as u32,
                });
            }

            // Newell's method is robust against near-degenerate corners
            let mut normal = Vec3::ZERO;
            for (i, &vi) in loop_.iter().enumerate() {
                let a = vertices[vi as usize];
                let b = vertices[loop_[(i + 1) % loop_.len()] as usize];
                normal += (a - b).cross(a + b);
            }
            let normal = normal.normalize();
            face_planes.push(Plane::from_point(normal, vertices[loop_[0] as usize]));
        }

        // Pair twins through the directed-edge map
        for idx in 0..half_edges.len() {
            let he = half_edges[idx];
            let v0 = he.root_vertex;
            let v1 = half_edges[he.next as usize].root_vertex;
            match directed.get(&(v1, v0)) {
                Some(&twin) => half_edges[idx].twin = twin,
                None => bail!("edge ({v0}, {v1}) has no twin; mesh is not closed"),
            }
        }

        let edges = half_edges
            .iter()
            .enumerate()
            .filter(|&(idx, he)| (idx as u32) < he.twin)
            .map(|(idx, _)| idx as u32)
            .collect();

        let mesh = Self {
            vertices,
            face_planes,
            half_edges,
            edges,
            face_first_edge,
        };
        mesh.debug_validate();
        Ok(mesh)
    }

    /// Axis-aligned box hull centered at the origin.
    pub fn box_hull(half_extents: Vec3) -> Self {
        let h = half_extents;
        let vertices = vec![
            Vec3::new(-h.x, -h.y, -h.z), // 0
            Vec3::new(h.x, -h.y, -h.z),  // 1
            Vec3::new(h.x, h.y, -h.z),   // 2
            Vec3::new(-h.x, h.y, -h.z),  // 3
            Vec3::new(-h.x, -h.y, h.z),  // 4
            Vec3::new(h.x, -h.y, h.z),   // 5
            Vec3::new(h.x, h.y, h.z),    // 6
            Vec3::new(-h.x, h.y, h.z),   // 7
        ];
        let faces = [
            vec![4, 5, 6, 7], // +z
            vec![1, 0, 3, 2], // -z
            vec![5, 1, 2, 6], // +x
            vec![0, 4, 7, 3], // -x
            vec![7, 6, 2, 3], // +y
            vec![0, 1, 5, 4], // -y
        ];
        Self::from_polygons(vertices, &faces).expect("box hull is closed by construction")
    }

    /// Local-space bounds of the hull.
    pub fn local_aabb(&self) -> Aabb {
        Aabb::from_points(self.vertices.iter().copied())
    }

    #[inline]
    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    #[inline]
    pub fn face_planes(&self) -> &[Plane] {
        &self.face_planes
    }

    #[inline]
    pub fn half_edges(&self) -> &[HalfEdge] {
        &self.half_edges
    }

    /// Canonical half-edge index per undirected edge.
    #[inline]
    pub fn edge_indices(&self) -> &[u32] {
        &self.edges
    }

    /// First half-edge of each face.
    #[inline]
    pub fn face_first_edges(&self) -> &[u32] {
        &self.face_first_edge
    }

    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    #[inline]
    pub fn num_faces(&self) -> usize {
        self.face_planes.len()
    }

    #[inline]
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Structural invariants, checked in debug builds only.
    fn debug_validate(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        for (idx, he) in self.half_edges.iter().enumerate() {
            let twin = &self.half_edges[he.twin as usize];
            debug_assert_eq!(twin.twin as usize, idx, "twin of twin must be self");
            debug_assert_eq!(
                self.half_edges[he.next as usize].face, he.face,
                "next must stay on the same face"
            );
        }
        for (face, &first) in self.face_first_edge.iter().enumerate() {
            let mut cursor = first;
            let mut steps = 0;
            loop {
                let he = &self.half_edges[cursor as usize];
                debug_assert_eq!(he.face as usize, face);
                cursor = he.next;
                steps += 1;
                debug_assert!(steps <= self.half_edges.len(), "face loop does not close");
                if cursor == first {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_hull_counts() {
        let mesh = HalfEdgeMesh::box_hull(Vec3::splat(0.5));
        assert_eq!(mesh.num_vertices(), 8);
        assert_eq!(mesh.num_faces(), 6);
        assert_eq!(mesh.num_edges(), 12);
        assert_eq!(mesh.half_edges().len(), 24);
    }

    #[test]
    fn test_box_hull_planes_face_outward() {
        let mesh = HalfEdgeMesh::box_hull(Vec3::splat(0.5));
        for plane in mesh.face_planes() {
            // Every vertex sits on or behind every face plane
            for &v in mesh.vertices() {
                assert!(plane.signed_distance(v) < 1e-5);
            }
            // And the plane passes through the surface, not the center
            assert!((plane.d - 0.5).abs() < 1e-5);
        }
    }

    #[test]
    fn test_twin_and_face_invariants() {
        let mesh = HalfEdgeMesh::box_hull(Vec3::new(1.0, 2.0, 3.0));
        for (idx, he) in mesh.half_edges().iter().enumerate() {
            let twin = mesh.half_edges()[he.twin as usize];
            assert_eq!(twin.twin as usize, idx);
            assert_eq!(mesh.half_edges()[he.next as usize].face, he.face);
        }
    }

    #[test]
    fn test_face_loops_close() {
        let mesh = HalfEdgeMesh::box_hull(Vec3::splat(1.0));
        for &first in mesh.face_first_edges() {
            let mut cursor = first;
            let mut count = 0;
            loop {
                cursor = mesh.half_edges()[cursor as usize].next;
                count += 1;
                assert!(count <= 4);
                if cursor == first {
                    break;
                }
            }
            assert_eq!(count, 4);
        }
    }

    #[test]
    fn test_tetrahedron_from_polygons() {
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
        ];
        let faces = [
            vec![0, 2, 1],
            vec![0, 1, 3],
            vec![0, 3, 2],
            vec![1, 2, 3],
        ];
        let mesh = HalfEdgeMesh::from_polygons(vertices, &faces).unwrap();
        assert_eq!(mesh.num_faces(), 4);
        assert_eq!(mesh.num_edges(), 6);
    }

    #[test]
    fn test_open_mesh_rejected() {
        let vertices = vec![Vec3::ZERO, Vec3::X, Vec3::Y];
        let faces = [vec![0, 1, 2]];
        assert!(HalfEdgeMesh::from_polygons(vertices, &faces).is_err());
    }
}
