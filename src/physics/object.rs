//! Shared object table: collision primitives and rigid-body metadata.
//!
//! Built once at init (typically by the asset importer) and then shared
//! read-only by every world via `Arc`. Entities refer into it with
//! [`ObjectId`](crate::ecs::ObjectId); one object is a short run of
//! primitives addressed by side-by-side offset/count arrays.

use glam::Vec3;

use crate::ecs::ObjectId;
use crate::geo::{Aabb, HalfEdgeMesh};

/// Half-extent used for the nominal bounds of an infinite plane.
const PLANE_EXTENT: f32 = 1e8;

/// A convex collision primitive.
#[derive(Debug, Clone)]
pub enum CollisionPrimitive {
    Sphere { radius: f32 },
    /// Infinite plane through the entity origin, canonical normal +z.
    Plane,
    Hull(HalfEdgeMesh),
}

impl CollisionPrimitive {
    /// Canonical ordering tag for narrow-phase dispatch:
    /// `Sphere < Hull < Plane`.
    #[inline]
    pub(crate) fn order(&self) -> u32 {
        match self {
            CollisionPrimitive::Sphere { .. } => 0,
            CollisionPrimitive::Hull(_) => 1,
            CollisionPrimitive::Plane => 2,
        }
    }

    /// Local-space bounds.
    pub fn local_aabb(&self) -> Aabb {
        match self {
            CollisionPrimitive::Sphere { radius } => {
                Aabb::new(Vec3::splat(-radius), Vec3::splat(*radius))
            }
            CollisionPrimitive::Plane => Aabb::new(
                Vec3::new(-PLANE_EXTENT, -PLANE_EXTENT, -PLANE_EXTENT),
                Vec3::new(PLANE_EXTENT, PLANE_EXTENT, 0.0),
            ),
            CollisionPrimitive::Hull(mesh) => mesh.local_aabb(),
        }
    }
}

/// Per-object mass and friction parameters, consumed by the external solver.
#[derive(Debug, Clone, Copy)]
pub struct RigidBodyMetadata {
    pub inv_mass: f32,
    /// Inverse inertia tensor diagonal, in the body frame.
    pub inv_inertia: Vec3,
    /// Static friction coefficient.
    pub mu_s: f32,
    /// Dynamic friction coefficient.
    pub mu_d: f32,
}

impl Default for RigidBodyMetadata {
    fn default() -> Self {
        Self {
            inv_mass: 1.0,
            inv_inertia: Vec3::ONE,
            mu_s: 0.5,
            mu_d: 0.5,
        }
    }
}

/// Immutable-after-init table of collision objects.
#[derive(Debug, Default)]
pub struct ObjectManager {
    primitives: Vec<CollisionPrimitive>,
    primitive_aabbs: Vec<Aabb>,
    primitive_offsets: Vec<u32>,
    primitive_counts: Vec<u32>,
    object_aabbs: Vec<Aabb>,
    metadata: Vec<RigidBodyMetadata>,
}

impl ObjectManager {
    /// Start building a table.
    pub fn builder() -> ObjectManagerBuilder {
        ObjectManagerBuilder::default()
    }

    #[inline]
    pub fn num_objects(&self) -> usize {
        self.object_aabbs.len()
    }

    /// All primitives of one object.
    #[inline]
    pub fn primitives(&self, id: ObjectId) -> &[CollisionPrimitive] {
        let offset = self.primitive_offsets[id.0 as usize] as usize;
        let count = self.primitive_counts[id.0 as usize] as usize;
        &self.primitives[offset..offset + count]
    }

    /// Local AABBs matching [`Self::primitives`] element for element.
    #[inline]
    pub fn primitive_aabbs(&self, id: ObjectId) -> &[Aabb] {
        let offset = self.primitive_offsets[id.0 as usize] as usize;
        let count = self.primitive_counts[id.0 as usize] as usize;
        &self.primitive_aabbs[offset..offset + count]
    }

    /// Composed local bounds of the whole object.
    #[inline]
    pub fn object_aabb(&self, id: ObjectId) -> Aabb {
        self.object_aabbs[id.0 as usize]
    }

    #[inline]
    pub fn metadata(&self, id: ObjectId) -> &RigidBodyMetadata {
        &self.metadata[id.0 as usize]
    }
}

/// Builder for [`ObjectManager`]; the importer's half of the contract.
#[derive(Debug, Default)]
pub struct ObjectManagerBuilder {
    table: ObjectManager,
}

impl ObjectManagerBuilder {
    /// Append one object made of `primitives` and return its id.
    pub fn add_object(
        &mut self,
        primitives: Vec<CollisionPrimitive>,
        metadata: RigidBodyMetadata,
    ) -> ObjectId {
        assert!(!primitives.is_empty(), "object must have at least one primitive");

        let id = ObjectId(self.table.object_aabbs.len() as u32);
        let offset = self.table.primitives.len() as u32;

        let mut object_aabb = Aabb::invalid();
        for prim in &primitives {
            let aabb = prim.local_aabb();
            object_aabb = object_aabb.union(&aabb);
            self.table.primitive_aabbs.push(aabb);
        }

        self.table.primitive_offsets.push(offset);
        self.table.primitive_counts.push(primitives.len() as u32);
        self.table.primitives.extend(primitives);
        self.table.object_aabbs.push(object_aabb);
        self.table.metadata.push(metadata);

        id
    }

    /// Finish building.
    pub fn build(self) -> ObjectManager {
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_table_layout() {
        let mut builder = ObjectManager::builder();
        let sphere = builder.add_object(
            vec![CollisionPrimitive::Sphere { radius: 0.5 }],
            RigidBodyMetadata::default(),
        );
        let compound = builder.add_object(
            vec![
                CollisionPrimitive::Sphere { radius: 1.0 },
                CollisionPrimitive::Hull(HalfEdgeMesh::box_hull(Vec3::splat(0.5))),
            ],
            RigidBodyMetadata::default(),
        );
        let table = builder.build();

        assert_eq!(table.num_objects(), 2);
        assert_eq!(table.primitives(sphere).len(), 1);
        assert_eq!(table.primitives(compound).len(), 2);

        let aabb = table.object_aabb(sphere);
        assert_eq!(aabb.min, Vec3::splat(-0.5));
        assert_eq!(aabb.max, Vec3::splat(0.5));

        // Compound bounds cover the larger sphere
        let aabb = table.object_aabb(compound);
        assert_eq!(aabb.min, Vec3::splat(-1.0));
        assert_eq!(aabb.max, Vec3::splat(1.0));
    }

    #[test]
    fn test_primitive_order() {
        assert!(CollisionPrimitive::Sphere { radius: 1.0 }.order()
            < CollisionPrimitive::Hull(HalfEdgeMesh::box_hull(Vec3::ONE)).order());
        assert!(CollisionPrimitive::Hull(HalfEdgeMesh::box_hull(Vec3::ONE)).order()
            < CollisionPrimitive::Plane.order());
    }
}
