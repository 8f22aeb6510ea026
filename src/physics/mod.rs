//! Collision detection pipeline for batched rigid-body simulation.
//!
//! # Architecture
//!
//! Each step, per world:
//!
//! 1. Broad-phase: recompute world AABBs, rebuild or refit the 4-wide
//!    tree, emit candidate pairs
//! 2. Narrow-phase: SAT contact generation over the candidates
//!    (parallel-for), contacts into the solver buffer
//! 3. External solver consumes the contact stream
//! 4. Cleanup: per-step streams reclaimed wholesale
//!
//! The stages are wired as task-graph nodes by the `setup_*_tasks`
//! constructors; dependencies are declared at registration and the graph
//! runs them in topological order.

pub mod broadphase;
pub mod buffer;
pub mod bvh;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod narrowphase;
pub mod object;
pub mod solver;

use std::sync::Arc;

use anyhow::ensure;
use glam::Vec3;
use tracing::info;

use crate::ecs::{ObjectId, ResponseType};
use crate::taskgraph::{NodeId, TaskGraphBuilder};

pub use broadphase::{Broadphase, CandidateCollision};
pub use bvh::{Bvh, ChildRef, LeafId};
pub use narrowphase::{Manifold, Narrowphase};
pub use object::{CollisionPrimitive, ObjectManager, ObjectManagerBuilder, RigidBodyMetadata};
pub use solver::{ContactConstraint, SolverData, SolverKind};

/// Configuration for one world's collision pipeline.
#[derive(Debug, Clone)]
pub struct PhysicsConfig {
    /// Fixed timestep handed to the external solver. Default: 1/60.
    pub dt: f32,
    /// Solver substeps per step. Default: 4.
    pub num_substeps: u32,
    /// Gravity vector handed to the external solver. Default: (0, 0, -9.81).
    pub gravity: Vec3,
    /// Broad-phase leaf capacity. Default: 1024.
    pub max_dynamic_objects: usize,
    /// Candidate-pair cap; extras are dropped and counted. Default: 16384.
    pub max_candidates: usize,
    /// Contact cap; overflow is fatal. Default: 4096.
    pub max_contacts: usize,
    /// Collision-event cap; extras are dropped. Default: 4096.
    pub max_collision_events: usize,
    /// Which external solver consumes the contacts. Default: XPBD.
    pub solver: SolverKind,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            dt: 1.0 / 60.0,
            num_substeps: 4,
            gravity: Vec3::new(0.0, 0.0, -9.81),
            max_dynamic_objects: 1024,
            max_candidates: 16384,
            max_contacts: 4096,
            max_collision_events: 4096,
            solver: SolverKind::Xpbd,
        }
    }
}

/// Per-world collision state: the broad-phase tree, the narrow-phase event
/// stream, and the solver-facing contact buffer. The object table is
/// process-wide and shared.
pub struct PhysicsWorld {
    pub config: PhysicsConfig,
    objects: Arc<ObjectManager>,
    pub broadphase: Broadphase,
    pub narrowphase: Narrowphase,
    pub solver: SolverData,
}

impl PhysicsWorld {
    /// Validate the configuration and allocate per-world buffers.
    pub fn new(config: PhysicsConfig, objects: Arc<ObjectManager>) -> anyhow::Result<Self> {
        ensure!(config.dt > 0.0, "timestep must be positive");
        ensure!(config.num_substeps > 0, "need at least one substep");
        ensure!(config.max_dynamic_objects > 0, "leaf capacity must be nonzero");
        ensure!(config.max_contacts > 0, "contact capacity must be nonzero");

        info!(
            max_dynamic_objects = config.max_dynamic_objects,
            max_candidates = config.max_candidates,
            max_contacts = config.max_contacts,
            solver = ?config.solver,
            "physics world init"
        );

        let broadphase = Broadphase::new(config.max_dynamic_objects, config.max_candidates);
        let narrowphase = Narrowphase::new(config.max_collision_events);
        let solver = SolverData::new(config.solver, config.max_contacts);

        Ok(Self {
            config,
            objects,
            broadphase,
            narrowphase,
            solver,
        })
    }

    #[inline]
    pub fn objects(&self) -> &ObjectManager {
        &self.objects
    }

    /// Register an entity with the collision pipeline, reserving its
    /// broad-phase leaf and attaching the physics components. The entity's
    /// `Transform` must already be set.
    pub fn register_entity(
        &mut self,
        world: &mut hecs::World,
        entity: hecs::Entity,
        object_id: ObjectId,
        response: ResponseType,
    ) -> anyhow::Result<LeafId> {
        ensure!(
            (object_id.0 as usize) < self.objects.num_objects(),
            "object id {} out of range",
            object_id.0
        );

        let leaf = self.broadphase.register(entity);
        world.insert(entity, (object_id, response, leaf))?;
        Ok(leaf)
    }

    /// Broad-phase node body: refresh the tree and emit candidates.
    pub fn run_broadphase(&mut self, world: &hecs::World) {
        self.broadphase.update(world, &self.objects);
    }

    /// Narrow-phase node body: contact generation over the candidate
    /// stream, then reclaim the candidates (the per-step scratch of the
    /// broad-phase).
    pub fn run_narrowphase(&mut self, world: &hecs::World) {
        let candidates = self.broadphase.candidates();
        self.narrowphase
            .execute(world, &self.objects, candidates, &self.solver);
        self.broadphase.reset();
    }

    /// Step-end cleanup: contacts and events are reclaimed wholesale.
    pub fn reset(&mut self) {
        self.broadphase.reset();
        self.narrowphase.reset();
        self.solver.reset();
    }
}

/// Register the broad-phase node: build/refit the tree, emit candidates.
pub fn setup_broadphase_tasks(builder: &mut TaskGraphBuilder, deps: &[NodeId]) -> NodeId {
    builder.add_node("broadphase", deps, |ctx| {
        ctx.physics.run_broadphase(ctx.world);
    })
}

/// Register the narrow-phase node: parallel-for over candidates, then
/// reclaim the candidate scratch.
pub fn setup_narrowphase_tasks(builder: &mut TaskGraphBuilder, broadphase: NodeId) -> NodeId {
    builder.add_node("narrowphase", &[broadphase], |ctx| {
        ctx.physics.run_narrowphase(ctx.world);
    })
}

/// Register the step-end cleanup node, reclaiming contacts and events.
/// Schedule it after the solver has consumed the contact stream.
pub fn setup_cleanup_tasks(builder: &mut TaskGraphBuilder, deps: &[NodeId]) -> NodeId {
    builder.add_node("physics-cleanup", deps, |ctx| {
        ctx.physics.reset();
    })
}

/// Register the raytrace node: rebuild the TLAS and trace every view of
/// worlds that carry render state.
pub fn setup_raytrace_tasks(builder: &mut TaskGraphBuilder, deps: &[NodeId]) -> NodeId {
    builder.add_node("raytrace", deps, |ctx| {
        if let Some(render) = ctx.render.as_deref_mut() {
            render.render_step(ctx.world);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::Transform;
    use crate::taskgraph::{Simulation, StepContext, WorldContext};

    fn sphere_objects() -> Arc<ObjectManager> {
        let mut builder = ObjectManager::builder();
        builder.add_object(
            vec![CollisionPrimitive::Sphere { radius: 0.5 }],
            RigidBodyMetadata::default(),
        );
        Arc::new(builder.build())
    }

    #[test]
    fn test_config_validation() {
        let objects = sphere_objects();
        let bad = PhysicsConfig {
            num_substeps: 0,
            ..PhysicsConfig::default()
        };
        assert!(PhysicsWorld::new(bad, objects.clone()).is_err());
        assert!(PhysicsWorld::new(PhysicsConfig::default(), objects).is_ok());
    }

    #[test]
    fn test_register_entity_attaches_components() {
        let objects = sphere_objects();
        let mut physics = PhysicsWorld::new(PhysicsConfig::default(), objects).unwrap();
        let mut world = hecs::World::new();

        let entity = world.spawn((Transform::identity(),));
        let leaf = physics
            .register_entity(&mut world, entity, ObjectId(0), ResponseType::Dynamic)
            .unwrap();
        assert_eq!(leaf, LeafId(0));
        assert_eq!(*world.get::<&LeafId>(entity).unwrap(), leaf);
        assert_eq!(*world.get::<&ObjectId>(entity).unwrap(), ObjectId(0));

        // Unknown object ids are rejected
        let other = world.spawn((Transform::identity(),));
        assert!(physics
            .register_entity(&mut world, other, ObjectId(7), ResponseType::Dynamic)
            .is_err());
    }

    #[test]
    fn test_full_step_produces_contacts() {
        let objects = sphere_objects();
        let mut physics = PhysicsWorld::new(PhysicsConfig::default(), objects).unwrap();
        let mut world = hecs::World::new();

        for position in [Vec3::ZERO, Vec3::new(0.8, 0.0, 0.0), Vec3::new(5.0, 0.0, 0.0)] {
            let entity = world.spawn((Transform::from_position(position),));
            physics
                .register_entity(&mut world, entity, ObjectId(0), ResponseType::Dynamic)
                .unwrap();
        }

        let mut builder = TaskGraphBuilder::new();
        let broadphase = setup_broadphase_tasks(&mut builder, &[]);
        setup_narrowphase_tasks(&mut builder, broadphase);
        let graph = builder.build();

        let mut ctx = StepContext {
            world: &mut world,
            physics: &mut physics,
            render: None,
        };
        graph.execute(&mut ctx);

        assert_eq!(physics.solver.num_contacts(), 1);
        let contact = physics.solver.contacts()[0];
        assert_eq!(contact.num_points, 1);
        assert!((contact.points[0].w - 0.2).abs() < 1e-5);

        // Cleanup reclaims the streams
        physics.reset();
        assert_eq!(physics.solver.num_contacts(), 0);
    }

    #[test]
    fn test_batched_worlds_step_independently() {
        let objects = sphere_objects();

        let mut builder = TaskGraphBuilder::new();
        let broadphase = setup_broadphase_tasks(&mut builder, &[]);
        setup_narrowphase_tasks(&mut builder, broadphase);
        let mut sim = Simulation::new(builder.build());

        for world_idx in 0..8 {
            let mut world = hecs::World::new();
            let mut physics =
                PhysicsWorld::new(PhysicsConfig::default(), objects.clone()).unwrap();

            // Even worlds get a colliding pair, odd worlds a separated one
            let spacing = if world_idx % 2 == 0 { 0.8 } else { 3.0 };
            for position in [Vec3::ZERO, Vec3::new(spacing, 0.0, 0.0)] {
                let entity = world.spawn((Transform::from_position(position),));
                physics
                    .register_entity(&mut world, entity, ObjectId(0), ResponseType::Dynamic)
                    .unwrap();
            }

            sim.add_world(WorldContext {
                world,
                physics,
                render: None,
            });
        }

        sim.step();

        for (world_idx, ctx) in sim.worlds.iter_mut().enumerate() {
            let expected = if world_idx % 2 == 0 { 1 } else { 0 };
            assert_eq!(ctx.physics.solver.num_contacts(), expected);
            ctx.physics.reset();
        }
    }
}
