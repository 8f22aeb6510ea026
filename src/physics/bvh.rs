//! Four-wide AABB tree for the broad-phase.
//!
//! One tree per world. Leaf slots are reserved at entity-registration time
//! and live for the whole simulation; the internal structure is rebuilt or
//! refitted every step as transforms move. Nodes hold float bounds in a
//! struct-of-arrays layout (four children per node, one array per axis
//! extreme) and are read concurrently by every traversal for the world.

use std::sync::atomic::{AtomicU32, Ordering};

use glam::Vec3;

use crate::geo::Aabb;

/// Traversal stack capacity; bounds the supported tree depth.
const TRAVERSAL_STACK: usize = 128;

/// Stable index of an entity's slot in the per-world leaf array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafId(pub u32);

/// Reference to one of a node's four children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRef {
    /// Index into the node array.
    Internal(u32),
    /// Index into the leaf arrays.
    Leaf(u32),
    Absent,
}

/// A 4-wide node: per-axis child bounds side by side, then child refs.
#[derive(Debug, Clone, Copy)]
struct Node {
    min_x: [f32; 4],
    min_y: [f32; 4],
    min_z: [f32; 4],
    max_x: [f32; 4],
    max_y: [f32; 4],
    max_z: [f32; 4],
    children: [ChildRef; 4],
}

impl Node {
    fn empty() -> Self {
        Self {
            min_x: [0.0; 4],
            min_y: [0.0; 4],
            min_z: [0.0; 4],
            max_x: [0.0; 4],
            max_y: [0.0; 4],
            max_z: [0.0; 4],
            children: [ChildRef::Absent; 4],
        }
    }

    #[inline]
    fn child_aabb(&self, i: usize) -> Aabb {
        Aabb::new(
            Vec3::new(self.min_x[i], self.min_y[i], self.min_z[i]),
            Vec3::new(self.max_x[i], self.max_y[i], self.max_z[i]),
        )
    }

    #[inline]
    fn set_child_aabb(&mut self, i: usize, aabb: &Aabb) {
        self.min_x[i] = aabb.min.x;
        self.min_y[i] = aabb.min.y;
        self.min_z[i] = aabb.min.z;
        self.max_x[i] = aabb.max.x;
        self.max_y[i] = aabb.max.y;
        self.max_z[i] = aabb.max.z;
    }
}

/// Per-world broad-phase tree over entity AABBs.
pub struct Bvh {
    nodes: Vec<Node>,
    leaf_aabbs: Vec<Aabb>,
    leaf_entities: Vec<Option<hecs::Entity>>,
    num_leaves: AtomicU32,
}

impl Bvh {
    /// Allocate leaf storage for up to `max_leaves` entities.
    pub fn new(max_leaves: usize) -> Self {
        Self {
            nodes: Vec::new(),
            leaf_aabbs: vec![Aabb::new(Vec3::ZERO, Vec3::ZERO); max_leaves],
            leaf_entities: vec![None; max_leaves],
            num_leaves: AtomicU32::new(0),
        }
    }

    /// Reserve the next leaf slot. Panics when the configured capacity is
    /// exhausted (caller misconfiguration).
    pub fn reserve_leaf(&self) -> LeafId {
        let idx = self.num_leaves.fetch_add(1, Ordering::Relaxed);
        assert!(
            (idx as usize) < self.leaf_aabbs.len(),
            "leaf capacity exceeded: max_dynamic_objects = {}",
            self.leaf_aabbs.len()
        );
        LeafId(idx)
    }

    /// Bind an entity to a reserved leaf. Registration-time only.
    pub fn assign_leaf(&mut self, leaf: LeafId, entity: hecs::Entity) {
        self.leaf_entities[leaf.0 as usize] = Some(entity);
    }

    /// Update a leaf's world AABB for this step.
    #[inline]
    pub fn update_leaf(&mut self, leaf: LeafId, aabb: Aabb) {
        self.leaf_aabbs[leaf.0 as usize] = aabb;
    }

    #[inline]
    pub fn num_leaves(&self) -> u32 {
        self.num_leaves.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn leaf_aabb(&self, leaf: LeafId) -> Aabb {
        self.leaf_aabbs[leaf.0 as usize]
    }

    #[inline]
    pub fn leaf_entity(&self, leaf: LeafId) -> Option<hecs::Entity> {
        self.leaf_entities[leaf.0 as usize]
    }

    /// Rebuild the tree over all reserved leaves: top-down longest-axis
    /// median partition of leaf centers, four children per node.
    pub fn build(&mut self) {
        self.nodes.clear();
        let count = self.num_leaves() as usize;
        if count == 0 {
            return;
        }

        let mut order: Vec<u32> = (0..count as u32).collect();
        self.nodes.push(Node::empty());
        self.build_node(0, &mut order, 0, count);
    }

    /// Fill node `node_idx` from the leaf range `order[start..end]`.
    fn build_node(&mut self, node_idx: usize, order: &mut [u32], start: usize, end: usize) {
        let count = end - start;
        if count <= 4 {
            for (slot, &leaf) in order[start..end].iter().enumerate() {
                let aabb = self.leaf_aabbs[leaf as usize];
                self.nodes[node_idx].set_child_aabb(slot, &aabb);
                self.nodes[node_idx].children[slot] = ChildRef::Leaf(leaf);
            }
            return;
        }

        // Two median splits produce four ranges
        let mid = start + count / 2;
        self.partition(order, start, end, mid);
        let q1 = start + (mid - start) / 2;
        self.partition(order, start, mid, q1);
        let q3 = mid + (end - mid) / 2;
        self.partition(order, mid, end, q3);

        let ranges = [(start, q1), (q1, mid), (mid, q3), (q3, end)];
        for (slot, &(lo, hi)) in ranges.iter().enumerate() {
            if lo == hi {
                continue;
            }
            if hi - lo == 1 {
                let leaf = order[lo];
                let aabb = self.leaf_aabbs[leaf as usize];
                self.nodes[node_idx].set_child_aabb(slot, &aabb);
                self.nodes[node_idx].children[slot] = ChildRef::Leaf(leaf);
            } else {
                let child_idx = self.nodes.len();
                self.nodes.push(Node::empty());
                self.nodes[node_idx].children[slot] = ChildRef::Internal(child_idx as u32);
                self.build_node(child_idx, order, lo, hi);

                let bounds = self.subtree_bounds(child_idx);
                self.nodes[node_idx].set_child_aabb(slot, &bounds);
            }
        }
    }

    /// Partition `order[start..end]` around `mid` along the longest axis of
    /// the range's centroid bounds. Deterministic: stable sort with leaf
    /// index as tiebreaker.
    fn partition(&self, order: &mut [u32], start: usize, end: usize, mid: usize) {
        let mut centroid_bounds = Aabb::invalid();
        for &leaf in &order[start..end] {
            let c = self.leaf_aabbs[leaf as usize].center();
            centroid_bounds.min = centroid_bounds.min.min(c);
            centroid_bounds.max = centroid_bounds.max.max(c);
        }
        let extent = centroid_bounds.max - centroid_bounds.min;
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };

        let keys = &self.leaf_aabbs;
        order[start..end].sort_by(|&a, &b| {
            let ca = keys[a as usize].center()[axis];
            let cb = keys[b as usize].center()[axis];
            ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal).then(a.cmp(&b))
        });
        debug_assert!(start < mid && mid < end);
    }

    fn subtree_bounds(&self, node_idx: usize) -> Aabb {
        let node = &self.nodes[node_idx];
        let mut bounds = Aabb::invalid();
        for i in 0..4 {
            if !matches!(node.children[i], ChildRef::Absent) {
                bounds = bounds.union(&node.child_aabb(i));
            }
        }
        bounds
    }

    /// Recompute node bounds from the current leaf AABBs without touching
    /// topology. Valid only while the leaf count matches the last build.
    pub fn refit(&mut self) {
        // Children always have higher indices than their parent, so a
        // reverse sweep sees every child before its referencing slot.
        for idx in (0..self.nodes.len()).rev() {
            for slot in 0..4 {
                match self.nodes[idx].children[slot] {
                    ChildRef::Leaf(leaf) => {
                        let aabb = self.leaf_aabbs[leaf as usize];
                        self.nodes[idx].set_child_aabb(slot, &aabb);
                    }
                    ChildRef::Internal(child) => {
                        let bounds = self.subtree_bounds(child as usize);
                        self.nodes[idx].set_child_aabb(slot, &bounds);
                    }
                    ChildRef::Absent => {}
                }
            }
        }
    }

    /// Invoke `fn(leaf)` for every leaf whose AABB overlaps `aabb`.
    /// Depth-first, children visited in insertion order, no deduplication.
    pub fn find_overlaps(&self, aabb: &Aabb, mut visit: impl FnMut(LeafId)) {
        if self.nodes.is_empty() {
            return;
        }

        let mut stack = [0u32; TRAVERSAL_STACK];
        let mut stack_size = 1usize;
        stack[0] = 0;

        while stack_size > 0 {
            stack_size -= 1;
            let node = &self.nodes[stack[stack_size] as usize];

            for i in 0..4 {
                match node.children[i] {
                    ChildRef::Absent => {}
                    ChildRef::Leaf(leaf) => {
                        if aabb.overlaps(&node.child_aabb(i)) {
                            visit(LeafId(leaf));
                        }
                    }
                    ChildRef::Internal(idx) => {
                        if aabb.overlaps(&node.child_aabb(i)) {
                            assert!(stack_size < TRAVERSAL_STACK, "BVH traversal stack overflow");
                            stack[stack_size] = idx;
                            stack_size += 1;
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Bvh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bvh")
            .field("nodes", &self.nodes.len())
            .field("num_leaves", &self.num_leaves())
            .field("capacity", &self.leaf_aabbs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bvh(aabbs: &[Aabb]) -> Bvh {
        let mut world = hecs::World::new();
        let mut bvh = Bvh::new(aabbs.len());
        for aabb in aabbs {
            let leaf = bvh.reserve_leaf();
            let entity = world.spawn(());
            bvh.assign_leaf(leaf, entity);
            bvh.update_leaf(leaf, *aabb);
        }
        bvh.build();
        bvh
    }

    fn unit_box_at(center: Vec3) -> Aabb {
        Aabb::new(center - Vec3::splat(0.5), center + Vec3::splat(0.5))
    }

    #[test]
    fn test_reserve_leaf_monotonic() {
        let bvh = Bvh::new(4);
        assert_eq!(bvh.reserve_leaf(), LeafId(0));
        assert_eq!(bvh.reserve_leaf(), LeafId(1));
        assert_eq!(bvh.num_leaves(), 2);
    }

    #[test]
    #[should_panic(expected = "leaf capacity exceeded")]
    fn test_reserve_leaf_overflow() {
        let bvh = Bvh::new(1);
        bvh.reserve_leaf();
        bvh.reserve_leaf();
    }

    #[test]
    fn test_find_overlaps_small() {
        let bvh = make_bvh(&[
            unit_box_at(Vec3::ZERO),
            unit_box_at(Vec3::new(10.0, 0.0, 0.0)),
            unit_box_at(Vec3::new(0.3, 0.3, 0.0)),
        ]);

        let mut hits = Vec::new();
        bvh.find_overlaps(&unit_box_at(Vec3::ZERO), |leaf| hits.push(leaf.0));
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 2]);
    }

    #[test]
    fn test_find_overlaps_contains_all_overlapping_leaves() {
        // A grid big enough to force several internal levels
        let mut aabbs = Vec::new();
        for x in 0..8 {
            for y in 0..8 {
                for z in 0..4 {
                    aabbs.push(unit_box_at(Vec3::new(
                        x as f32 * 3.0,
                        y as f32 * 3.0,
                        z as f32 * 3.0,
                    )));
                }
            }
        }
        let bvh = make_bvh(&aabbs);

        let query = Aabb::new(Vec3::splat(-1.0), Vec3::splat(7.0));
        let mut hits = Vec::new();
        bvh.find_overlaps(&query, |leaf| hits.push(leaf.0));

        let expected: Vec<u32> = (0..aabbs.len() as u32)
            .filter(|&i| aabbs[i as usize].overlaps(&query))
            .collect();
        let mut hits_sorted = hits.clone();
        hits_sorted.sort_unstable();
        assert_eq!(hits_sorted, expected);
        // No duplicates
        assert_eq!(hits.len(), expected.len());
    }

    #[test]
    fn test_refit_follows_moved_leaves() {
        let mut world = hecs::World::new();
        let mut bvh = Bvh::new(16);
        for i in 0..16 {
            let leaf = bvh.reserve_leaf();
            let entity = world.spawn(());
            bvh.assign_leaf(leaf, entity);
            bvh.update_leaf(leaf, unit_box_at(Vec3::new(i as f32 * 2.0, 0.0, 0.0)));
        }
        bvh.build();

        // Move every leaf up by 100 and refit
        for i in 0..16u32 {
            bvh.update_leaf(
                LeafId(i),
                unit_box_at(Vec3::new(i as f32 * 2.0, 100.0, 0.0)),
            );
        }
        bvh.refit();

        let mut hits = Vec::new();
        bvh.find_overlaps(&unit_box_at(Vec3::new(4.0, 100.0, 0.0)), |leaf| {
            hits.push(leaf.0)
        });
        assert_eq!(hits, vec![2]);

        // Old positions are no longer reported
        let mut stale = Vec::new();
        bvh.find_overlaps(&unit_box_at(Vec3::new(4.0, 0.0, 0.0)), |leaf| {
            stale.push(leaf.0)
        });
        assert!(stale.is_empty());
    }

    #[test]
    fn test_deterministic_build() {
        let aabbs: Vec<Aabb> = (0..64)
            .map(|i| {
                let f = i as f32;
                unit_box_at(Vec3::new((f * 7.3) % 11.0, (f * 3.1) % 5.0, (f * 1.7) % 13.0))
            })
            .collect();

        let bvh_a = make_bvh(&aabbs);
        let bvh_b = make_bvh(&aabbs);

        let query = Aabb::new(Vec3::splat(-100.0), Vec3::splat(100.0));
        let mut order_a = Vec::new();
        let mut order_b = Vec::new();
        bvh_a.find_overlaps(&query, |leaf| order_a.push(leaf.0));
        bvh_b.find_overlaps(&query, |leaf| order_b.push(leaf.0));
        assert_eq!(order_a, order_b);
        assert_eq!(order_a.len(), 64);
    }
}
