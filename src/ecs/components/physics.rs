//! Physics components for ECS entities.

/// How an entity participates in collision response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// Affected by forces and collisions.
    Dynamic,
    /// Position controlled externally, but affects dynamic bodies.
    Kinematic,
    /// Immovable.
    Static,
}

/// Index into the shared object table ([`crate::physics::ObjectManager`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectId(pub u32);

/// A collision observed this step, emitted into the per-step event buffer.
#[derive(Debug, Clone, Copy)]
pub struct CollisionEvent {
    pub a: hecs::Entity,
    pub b: hecs::Entity,
}
