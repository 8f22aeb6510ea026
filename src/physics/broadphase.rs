//! Broad-phase collision detection over the per-world AABB tree.
//!
//! Each step the broad-phase recomputes world AABBs for every registered
//! entity, rebuilds or refits the tree, and emits [`CandidateCollision`]
//! pairs for the narrow-phase. Candidate emission is a parallel-for over
//! leaves; the tree is read-only during that phase and candidates land in a
//! capped append buffer with a caller-visible dropped counter.

use glam::Vec3;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::ecs::{ObjectId, ResponseType, Transform};
use crate::geo::Aabb;

use super::buffer::AppendBuffer;
use super::bvh::{Bvh, LeafId};
use super::object::ObjectManager;

/// Margin added to every world AABB so slow contacts are not missed
/// between steps.
const AABB_EXPANSION: f32 = 0.01;

/// Average per-leaf center drift (in world units) that triggers a rebuild
/// instead of a refit.
const REBUILD_MOTION_THRESHOLD: f32 = 1.0;

/// A candidate colliding pair: two entities plus the primitive indices
/// within their objects.
#[derive(Debug, Clone, Copy)]
pub struct CandidateCollision {
    pub a: hecs::Entity,
    pub b: hecs::Entity,
    pub a_prim: u32,
    pub b_prim: u32,
}

/// Per-leaf state captured at the start of a step.
#[derive(Debug, Clone, Copy)]
struct LeafSnapshot {
    entity: hecs::Entity,
    aabb: Aabb,
    response: ResponseType,
    object: ObjectId,
}

/// Per-world broad-phase state.
#[derive(Debug)]
pub struct Broadphase {
    bvh: Bvh,
    candidates: AppendBuffer<CandidateCollision>,
    snapshots: Vec<Option<LeafSnapshot>>,
    /// Leaf centers captured at the last rebuild.
    centers_at_build: Vec<Vec3>,
    leaves_at_build: u32,
}

impl Broadphase {
    pub fn new(max_dynamic_objects: usize, max_candidates: usize) -> Self {
        Self {
            bvh: Bvh::new(max_dynamic_objects),
            candidates: AppendBuffer::new(max_candidates),
            snapshots: Vec::new(),
            centers_at_build: Vec::new(),
            leaves_at_build: 0,
        }
    }

    /// Reserve and bind a leaf for a newly registered entity.
    pub fn register(&mut self, entity: hecs::Entity) -> LeafId {
        let leaf = self.bvh.reserve_leaf();
        self.bvh.assign_leaf(leaf, entity);
        leaf
    }

    #[inline]
    pub fn bvh(&self) -> &Bvh {
        &self.bvh
    }

    /// Candidates emitted this step. Exclusive access, so producers are done.
    pub fn candidates(&mut self) -> &[CandidateCollision] {
        self.candidates.as_slice()
    }

    /// Candidates that did not fit under the configured cap this step.
    pub fn dropped_candidates(&self) -> u32 {
        self.candidates.dropped()
    }

    /// Reclaim the candidate stream at step end.
    pub fn reset(&mut self) {
        self.candidates.clear();
    }

    /// Recompute world AABBs, rebuild or refit the tree, and emit candidate
    /// pairs. The whole-step entry point, run as one task-graph node.
    pub fn update(&mut self, world: &hecs::World, objects: &ObjectManager) {
        self.update_leaves(world, objects);
        self.refresh_tree();
        self.emit_candidates(objects);

        let dropped = self.candidates.dropped();
        if dropped > 0 {
            warn!(dropped, cap = self.candidates.capacity(), "candidate buffer overflow");
        }
    }

    /// Step 1: world AABB per registered entity, expanded by a margin.
    fn update_leaves(&mut self, world: &hecs::World, objects: &ObjectManager) {
        let num_leaves = self.bvh.num_leaves() as usize;
        self.snapshots.clear();
        self.snapshots.resize(num_leaves, None);

        for (entity, (transform, object, response, leaf)) in world
            .query::<(&Transform, &ObjectId, &ResponseType, &LeafId)>()
            .iter()
        {
            let aabb = objects
                .object_aabb(*object)
                .apply_trs(transform.position, transform.rotation, transform.scale)
                .expanded(AABB_EXPANSION);
            self.bvh.update_leaf(*leaf, aabb);
            self.snapshots[leaf.0 as usize] = Some(LeafSnapshot {
                entity,
                aabb,
                response: *response,
                object: *object,
            });
        }
    }

    /// Step 2: rebuild when the leaf population changed or accumulated
    /// center motion since the last build crosses the threshold; refit
    /// otherwise.
    fn refresh_tree(&mut self) {
        let num_leaves = self.bvh.num_leaves();
        if num_leaves == 0 {
            return;
        }

        let rebuild = num_leaves != self.leaves_at_build || self.motion_exceeded(num_leaves);
        if rebuild {
            self.bvh.build();
            self.leaves_at_build = num_leaves;
            self.centers_at_build = (0..num_leaves)
                .map(|i| self.bvh.leaf_aabb(LeafId(i)).center())
                .collect();
            debug!(num_leaves, "broad-phase rebuild");
        } else {
            self.bvh.refit();
            debug!(num_leaves, "broad-phase refit");
        }
    }

    fn motion_exceeded(&self, num_leaves: u32) -> bool {
        let mut total = 0.0f32;
        for i in 0..num_leaves {
            let center = self.bvh.leaf_aabb(LeafId(i)).center();
            total += (center - self.centers_at_build[i as usize]).length();
        }
        total > REBUILD_MOTION_THRESHOLD * num_leaves as f32
    }

    /// Step 3: tree query per leaf; keep each overlapping pair once
    /// (`a < b` in entity order), skip static-static, fan out one candidate
    /// per primitive pair.
    fn emit_candidates(&self, objects: &ObjectManager) {
        let snapshots = &self.snapshots;
        let bvh = &self.bvh;
        let candidates = &self.candidates;

        (0..snapshots.len()).into_par_iter().for_each(|leaf_idx| {
            let Some(own) = snapshots[leaf_idx] else {
                return;
            };

            bvh.find_overlaps(&own.aabb, |other_leaf| {
                let Some(other) = snapshots[other_leaf.0 as usize] else {
                    return;
                };
                // Each unordered pair is discovered from both sides; keep
                // the visit where this entity sorts first.
                if own.entity >= other.entity {
                    return;
                }
                if own.response == ResponseType::Static && other.response == ResponseType::Static {
                    return;
                }

                let a_prims = objects.primitives(own.object).len() as u32;
                let b_prims = objects.primitives(other.object).len() as u32;
                for a_prim in 0..a_prims {
                    for b_prim in 0..b_prims {
                        candidates.try_push(CandidateCollision {
                            a: own.entity,
                            b: other.entity,
                            a_prim,
                            b_prim,
                        });
                    }
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::object::{CollisionPrimitive, RigidBodyMetadata};

    fn sphere_table() -> ObjectManager {
        let mut builder = ObjectManager::builder();
        builder.add_object(
            vec![CollisionPrimitive::Sphere { radius: 0.4 }],
            RigidBodyMetadata::default(),
        );
        builder.build()
    }

    fn spawn_sphere(
        world: &mut hecs::World,
        broadphase: &mut Broadphase,
        position: Vec3,
        response: ResponseType,
    ) -> hecs::Entity {
        let entity = world.spawn(());
        let leaf = broadphase.register(entity);
        world
            .insert(
                entity,
                (Transform::from_position(position), ObjectId(0), response, leaf),
            )
            .unwrap();
        entity
    }

    #[test]
    fn test_grid_of_separated_spheres_yields_no_pairs() {
        let objects = sphere_table();
        let mut world = hecs::World::new();
        let mut broadphase = Broadphase::new(1024, 4096);

        for i in 0..10 {
            for j in 0..10 {
                for k in 0..10 {
                    spawn_sphere(
                        &mut world,
                        &mut broadphase,
                        Vec3::new(i as f32 * 2.0, j as f32 * 2.0, k as f32 * 2.0),
                        ResponseType::Dynamic,
                    );
                }
            }
        }

        broadphase.update(&world, &objects);
        assert!(broadphase.candidates().is_empty());
        assert_eq!(broadphase.dropped_candidates(), 0);
    }

    #[test]
    fn test_single_overlap_yields_single_pair() {
        let objects = sphere_table();
        let mut world = hecs::World::new();
        let mut broadphase = Broadphase::new(1024, 4096);

        let mut entities = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                entities.push(spawn_sphere(
                    &mut world,
                    &mut broadphase,
                    Vec3::new(i as f32 * 2.0, j as f32 * 2.0, 0.0),
                    ResponseType::Dynamic,
                ));
            }
        }

        // Move one sphere onto another
        {
            let mut transform = world.get::<&mut Transform>(entities[1]).unwrap();
            transform.position = Vec3::new(0.3, 0.0, 0.0);
        }

        broadphase.reset();
        broadphase.update(&world, &objects);

        let candidates = broadphase.candidates();
        assert_eq!(candidates.len(), 1);
        let pair = candidates[0];
        assert!(pair.a < pair.b);
        let expected = if entities[0] < entities[1] {
            (entities[0], entities[1])
        } else {
            (entities[1], entities[0])
        };
        assert_eq!((pair.a, pair.b), expected);
    }

    #[test]
    fn test_static_static_pairs_skipped() {
        let objects = sphere_table();
        let mut world = hecs::World::new();
        let mut broadphase = Broadphase::new(16, 64);

        spawn_sphere(&mut world, &mut broadphase, Vec3::ZERO, ResponseType::Static);
        spawn_sphere(
            &mut world,
            &mut broadphase,
            Vec3::new(0.1, 0.0, 0.0),
            ResponseType::Static,
        );
        // A kinematic-static overlap still counts
        spawn_sphere(
            &mut world,
            &mut broadphase,
            Vec3::new(0.0, 0.1, 0.0),
            ResponseType::Kinematic,
        );

        broadphase.update(&world, &objects);
        let candidates = broadphase.candidates();
        // kinematic overlaps both statics; static-static is skipped
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn test_candidate_cap_drops_and_counts() {
        let objects = sphere_table();
        let mut world = hecs::World::new();
        let mut broadphase = Broadphase::new(16, 2);

        // Five co-located spheres: C(5,2) = 10 pairs, cap 2
        for _ in 0..5 {
            spawn_sphere(&mut world, &mut broadphase, Vec3::ZERO, ResponseType::Dynamic);
        }

        broadphase.update(&world, &objects);
        assert_eq!(broadphase.candidates().len(), 2);
        assert_eq!(broadphase.dropped_candidates(), 8);
    }

    #[test]
    fn test_refit_preserves_completeness() {
        let objects = sphere_table();
        let mut world = hecs::World::new();
        let mut broadphase = Broadphase::new(64, 256);

        let mut entities = Vec::new();
        for i in 0..8 {
            entities.push(spawn_sphere(
                &mut world,
                &mut broadphase,
                Vec3::new(i as f32 * 3.0, 0.0, 0.0),
                ResponseType::Dynamic,
            ));
        }

        // First update builds
        broadphase.update(&world, &objects);
        assert!(broadphase.candidates().is_empty());

        // Small drift onto a neighbor: under the motion threshold, so this
        // step refits, and the overlap must still be found
        {
            let mut transform = world.get::<&mut Transform>(entities[3]).unwrap();
            transform.position = Vec3::new(6.3, 0.0, 0.0);
        }
        broadphase.reset();
        broadphase.update(&world, &objects);
        assert_eq!(broadphase.candidates().len(), 1);
    }
}
