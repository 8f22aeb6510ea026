//! Entity Component System surface, built on hecs.
//!
//! The core never owns the ECS runtime; it reads [`Transform`],
//! [`ObjectId`], and [`ResponseType`] components per entity and writes
//! nothing back (the constraint solver owns write-back).

pub mod components;

pub use components::{CollisionEvent, ObjectId, ResponseType, Transform};
