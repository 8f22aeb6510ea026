//! Raycast rendering backend.
//!
//! A two-level quantized BVH (TLAS over instances, BLAS over triangle
//! meshes) traced per pixel on the CPU. The mesh/material/texture tables
//! are shared read-only across worlds; each world owns its instances,
//! views, and output targets.

pub mod mesh_bvh;
pub mod qbvh;
pub mod raytracer;

pub use mesh_bvh::{HitInfo, MeshBvh, TriangleMesh};
pub use qbvh::{Qbvh, QbvhChild, QbvhNode};
pub use raytracer::{
    Instance, Material, RenderMode, RenderTarget, RenderView, Raytracer, Texture, Tlas,
};

use std::sync::Arc;

use crate::ecs::Transform;

/// Component marking an entity as renderable: index into the shared mesh
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshInstance(pub u32);

/// Per-world render state: instance list mirrored from the ECS, camera
/// views, and their output targets.
#[derive(Debug)]
pub struct RenderState {
    pub raytracer: Arc<Raytracer>,
    pub views: Vec<RenderView>,
    pub targets: Vec<RenderTarget>,
    pub mode: RenderMode,
    instances: Vec<Instance>,
    tlas: Tlas,
}

impl RenderState {
    pub fn new(raytracer: Arc<Raytracer>, mode: RenderMode) -> Self {
        Self {
            raytracer,
            views: Vec::new(),
            targets: Vec::new(),
            mode,
            instances: Vec::new(),
            tlas: Tlas::default(),
        }
    }

    /// Add a camera view with a square target of `resolution` pixels.
    pub fn add_view(&mut self, view: RenderView, resolution: u32) {
        self.views.push(view);
        self.targets.push(RenderTarget::new(resolution));
    }

    #[inline]
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Mirror renderable entity transforms into the instance list.
    pub fn sync_instances(&mut self, world: &hecs::World) {
        self.instances.clear();
        for (_, (transform, mesh)) in world.query::<(&Transform, &MeshInstance)>().iter() {
            self.instances.push(Instance {
                position: transform.position,
                rotation: transform.rotation,
                scale: transform.scale,
                mesh: mesh.0,
            });
        }
    }

    /// One frame: refresh instances, rebuild the TLAS, trace every view.
    pub fn render_step(&mut self, world: &hecs::World) {
        self.sync_instances(world);
        self.tlas = Tlas::build(&self.raytracer, &self.instances);
        self.raytracer.render_views(
            &self.tlas,
            &self.instances,
            &self.views,
            &mut self.targets,
            self.mode,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn test_render_state_step_from_ecs() {
        let raytracer = Arc::new(Raytracer {
            meshes: vec![MeshBvh::build(TriangleMesh::box_mesh(Vec3::ZERO, Vec3::ONE))],
            materials: Vec::new(),
            textures: Vec::new(),
        });

        let mut world = hecs::World::new();
        world.spawn((Transform::identity(), MeshInstance(0)));

        let mut state = RenderState::new(raytracer, RenderMode::Depth);
        state.add_view(
            RenderView {
                position: Vec3::new(0.5, -3.0, 0.5),
                rotation: Quat::IDENTITY,
                y_scale: 1.0,
            },
            8,
        );

        state.render_step(&world);
        assert_eq!(state.instances().len(), 1);
        let center = state.targets[0].depth_at(4, 4);
        assert!((center - 3.0).abs() < 0.1, "center depth {center}");
    }
}
