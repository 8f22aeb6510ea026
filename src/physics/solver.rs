//! Solver surface: the contact stream the external constraint solver
//! consumes.
//!
//! The narrow-phase produces [`ContactConstraint`]s into a shared
//! fixed-capacity buffer through one atomic cursor; insertion order is
//! nondeterministic and the solver must not depend on it. The solver itself
//! (XPBD / TGS / convex) is an external collaborator.

use glam::{Vec3, Vec4};

use super::buffer::AppendBuffer;

/// Which external solver consumes the contact stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    Xpbd,
    Tgs,
    Convex,
}

/// One solved pair: reference/alternate entities, up to four contact points
/// packed as position + penetration depth, and the shared contact normal.
#[derive(Debug, Clone, Copy)]
pub struct ContactConstraint {
    /// Entity owning the reference face.
    pub reference: hecs::Entity,
    /// The other entity.
    pub alternate: hecs::Entity,
    /// `xyz` = world position, `w` = penetration depth.
    pub points: [Vec4; 4],
    pub num_points: u32,
    /// World-space normal, pointing out of the reference side.
    pub normal: Vec3,
}

/// Contact stream handed to the external solver.
#[derive(Debug)]
pub struct SolverData {
    pub kind: SolverKind,
    contacts: AppendBuffer<ContactConstraint>,
}

impl SolverData {
    pub fn new(kind: SolverKind, max_contacts: usize) -> Self {
        Self {
            kind,
            contacts: AppendBuffer::new(max_contacts),
        }
    }

    /// Insert one constraint. Panics when `max_contacts` is exceeded —
    /// the cap is the caller's configuration contract.
    #[inline]
    pub fn push_contact(&self, contact: ContactConstraint) {
        self.contacts.push(contact);
    }

    /// Number of contacts inserted this step.
    #[inline]
    pub fn num_contacts(&self) -> usize {
        self.contacts.len()
    }

    /// The step's contact stream.
    pub fn contacts(&mut self) -> &[ContactConstraint] {
        self.contacts.as_slice()
    }

    /// Reclaim the stream wholesale at step end.
    pub fn reset(&mut self) {
        self.contacts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_stream_roundtrip() {
        let mut world = hecs::World::new();
        let a = world.spawn(());
        let b = world.spawn(());

        let mut solver = SolverData::new(SolverKind::Xpbd, 8);
        solver.push_contact(ContactConstraint {
            reference: a,
            alternate: b,
            points: [Vec4::new(0.0, 0.0, 0.0, 0.1); 4],
            num_points: 1,
            normal: Vec3::Z,
        });

        assert_eq!(solver.num_contacts(), 1);
        let contacts = solver.contacts();
        assert_eq!(contacts[0].reference, a);
        assert_eq!(contacts[0].num_points, 1);

        solver.reset();
        assert_eq!(solver.num_contacts(), 0);
    }
}
