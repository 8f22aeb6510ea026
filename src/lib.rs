//! Stampede: a batched rigid-body collision core.
//!
//! High-throughput collision detection and contact generation for many
//! independent simulation worlds stepped in parallel (reinforcement
//! learning and robotics workloads), plus a quantized-BVH ray tracer for
//! rendering camera views of those worlds.
//!
//! # Architecture
//!
//! 1. **geo** - geometry primitives: AABBs, planes, half-edge convex meshes
//! 2. **ecs** - the hecs-backed component surface the pipeline reads
//! 3. **physics** - broad-phase 4-wide BVH, SAT narrow-phase, solver-facing
//!    contact stream, optional GPU broad-phase (feature = "gpu")
//! 4. **render** - two-level quantized-BVH ray tracer (TLAS over instances,
//!    BLAS over triangle meshes)
//! 5. **taskgraph** - deterministic node wiring and the batched
//!    [`Simulation`](taskgraph::Simulation) driver
//!
//! The world convention is z-up with cameras looking along their local +y.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use glam::Vec3;
//! use stampede::ecs::{ObjectId, ResponseType, Transform};
//! use stampede::physics::{
//!     setup_broadphase_tasks, setup_narrowphase_tasks, CollisionPrimitive, ObjectManager,
//!     PhysicsConfig, PhysicsWorld, RigidBodyMetadata,
//! };
//! use stampede::taskgraph::{StepContext, TaskGraphBuilder};
//!
//! // Shared object table: one sphere object
//! let mut objects = ObjectManager::builder();
//! objects.add_object(
//!     vec![CollisionPrimitive::Sphere { radius: 0.5 }],
//!     RigidBodyMetadata::default(),
//! );
//! let objects = Arc::new(objects.build());
//!
//! // One world with two touching spheres
//! let mut world = hecs::World::new();
//! let mut physics = PhysicsWorld::new(PhysicsConfig::default(), objects).unwrap();
//! for x in [0.0f32, 0.8] {
//!     let entity = world.spawn((Transform::from_position(Vec3::new(x, 0.0, 0.0)),));
//!     physics
//!         .register_entity(&mut world, entity, ObjectId(0), ResponseType::Dynamic)
//!         .unwrap();
//! }
//!
//! // Wire and run one step of the pipeline
//! let mut builder = TaskGraphBuilder::new();
//! let broadphase = setup_broadphase_tasks(&mut builder, &[]);
//! setup_narrowphase_tasks(&mut builder, broadphase);
//! let graph = builder.build();
//!
//! let mut ctx = StepContext {
//!     world: &mut world,
//!     physics: &mut physics,
//!     render: None,
//! };
//! graph.execute(&mut ctx);
//! assert_eq!(physics.solver.num_contacts(), 1);
//! ```

pub mod ecs;
pub mod geo;
pub mod physics;
pub mod render;
pub mod taskgraph;

pub use ecs::{CollisionEvent, ObjectId, ResponseType, Transform};
pub use geo::{Aabb, HalfEdgeMesh, Plane};
pub use physics::{
    CandidateCollision, CollisionPrimitive, ContactConstraint, LeafId, Manifold, ObjectManager,
    PhysicsConfig, PhysicsWorld, SolverKind,
};
pub use render::{Instance, RenderMode, RenderTarget, RenderView, Raytracer};
pub use taskgraph::{Simulation, StepContext, TaskGraph, TaskGraphBuilder, WorldContext};
