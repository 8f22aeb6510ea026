//! Quantized four-wide BVH shared by the ray tracer's TLAS and BLAS.
//!
//! Each node stores a base point, one power-of-two scale exponent per axis,
//! and four children's bounds quantized to 8 bits per axis against that
//! frame. Quantization rounds mins down and maxes up, so every encoded
//! child box conservatively encloses its subtree. Internal child references
//! are 1-based (0 is "absent"); negative references encode leaves as
//! `-index - 1`.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::geo::Aabb;

/// Ray traversal stack capacity.
pub const TRACE_STACK: usize = 32;

/// Stand-in reciprocal for zero ray-direction components, sign preserved.
pub const INV_EPSILON: f32 = 1e5;

/// One quantized 4-wide node.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct QbvhNode {
    /// Base point the child bounds are quantized against.
    pub min_point: [f32; 3],
    /// Per-axis scale exponents; actual scale is `2^exp`.
    pub exp_x: i8,
    pub exp_y: i8,
    pub exp_z: i8,
    pub num_children: u8,
    pub q_min_x: [u8; 4],
    pub q_min_y: [u8; 4],
    pub q_min_z: [u8; 4],
    pub q_max_x: [u8; 4],
    pub q_max_y: [u8; 4],
    pub q_max_z: [u8; 4],
    /// `> 0`: 1-based internal node. `< 0`: leaf `-idx - 1`. `0`: absent.
    pub children: [i32; 4],
}

/// Decoded child reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QbvhChild {
    Internal(u32),
    Leaf(u32),
    Absent,
}

/// Materialize a power-of-two scale from a stored exponent.
#[inline]
pub fn exp_scale(exp: i8) -> f32 {
    f32::from_bits(((exp as i32 + 127) as u32) << 23)
}

/// Componentwise reciprocal with sign-preserving replacement of zeros.
#[inline]
pub fn inv_ray_dir(dir: Vec3) -> Vec3 {
    let inv = |d: f32| {
        if d == 0.0 {
            INV_EPSILON.copysign(d)
        } else {
            1.0 / d
        }
    };
    Vec3::new(inv(dir.x), inv(dir.y), inv(dir.z))
}

impl QbvhNode {
    #[inline]
    pub fn child(&self, i: usize) -> QbvhChild {
        match self.children[i] {
            0 => QbvhChild::Absent,
            idx if idx > 0 => QbvhChild::Internal(idx as u32),
            idx => QbvhChild::Leaf((-idx - 1) as u32),
        }
    }

    /// Dequantized bounds of child `i`.
    pub fn child_aabb(&self, i: usize) -> Aabb {
        let base = Vec3::from(self.min_point);
        let scale = Vec3::new(
            exp_scale(self.exp_x),
            exp_scale(self.exp_y),
            exp_scale(self.exp_z),
        );
        let q_min = Vec3::new(
            self.q_min_x[i] as f32,
            self.q_min_y[i] as f32,
            self.q_min_z[i] as f32,
        );
        let q_max = Vec3::new(
            self.q_max_x[i] as f32,
            self.q_max_y[i] as f32,
            self.q_max_z[i] as f32,
        );
        Aabb::new(base + q_min * scale, base + q_max * scale)
    }
}

/// Per-node ray state: child slab bounds are formed directly in ray
/// parameter space from the quantized integers, no intermediate float box.
pub struct NodeIntersector {
    dir_quant: Vec3,
    origin_quant: Vec3,
}

impl NodeIntersector {
    #[inline]
    pub fn new(node: &QbvhNode, origin: Vec3, inv_dir: Vec3) -> Self {
        let scale = Vec3::new(
            exp_scale(node.exp_x),
            exp_scale(node.exp_y),
            exp_scale(node.exp_z),
        );
        let base = Vec3::from(node.min_point);
        Self {
            dir_quant: scale * inv_dir,
            origin_quant: (base - origin) * inv_dir,
        }
    }

    /// Slab test for child `i`: hit when `t_near <= t_far` with `t_near`
    /// clamped to zero and `t_far` to `t_max`.
    #[inline]
    pub fn child_hit(&self, node: &QbvhNode, i: usize, t_max: f32) -> bool {
        let t_lo = Vec3::new(
            node.q_min_x[i] as f32 * self.dir_quant.x + self.origin_quant.x,
            node.q_min_y[i] as f32 * self.dir_quant.y + self.origin_quant.y,
            node.q_min_z[i] as f32 * self.dir_quant.z + self.origin_quant.z,
        );
        let t_hi = Vec3::new(
            node.q_max_x[i] as f32 * self.dir_quant.x + self.origin_quant.x,
            node.q_max_y[i] as f32 * self.dir_quant.y + self.origin_quant.y,
            node.q_max_z[i] as f32 * self.dir_quant.z + self.origin_quant.z,
        );

        let t_near = t_lo
            .min(t_hi)
            .max_element()
            .max(0.0);
        let t_far = t_lo
            .max(t_hi)
            .min_element()
            .min(t_max);

        t_near <= t_far
    }
}

/// A packed quantized tree.
#[derive(Debug, Clone, Default)]
pub struct Qbvh {
    nodes: Vec<QbvhNode>,
}

impl Qbvh {
    /// Build over `leaf_aabbs`; leaf `i` of the tree refers back to input
    /// index `i`. Top-down longest-axis median split of centroids, nodes
    /// packed depth-first.
    pub fn build(leaf_aabbs: &[Aabb]) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        if leaf_aabbs.is_empty() {
            return tree;
        }

        let mut order: Vec<u32> = (0..leaf_aabbs.len() as u32).collect();
        tree.nodes.push(QbvhNode::zeroed());
        tree.build_node(0, leaf_aabbs, &mut order, 0, leaf_aabbs.len());
        tree
    }

    #[inline]
    pub fn nodes(&self) -> &[QbvhNode] {
        &self.nodes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn build_node(
        &mut self,
        node_idx: usize,
        leaf_aabbs: &[Aabb],
        order: &mut [u32],
        start: usize,
        end: usize,
    ) {
        let count = end - start;

        // Children and their subtree bounds, then quantize in one pass
        let mut child_refs = [0i32; 4];
        let mut child_bounds = [Aabb::invalid(); 4];
        let mut num_children = 0u8;

        if count <= 4 {
            for (slot, &leaf) in order[start..end].iter().enumerate() {
                child_refs[slot] = -(leaf as i32) - 1;
                child_bounds[slot] = leaf_aabbs[leaf as usize];
                num_children += 1;
            }
        } else {
            let mid = start + count / 2;
            partition_leaves(leaf_aabbs, order, start, end);
            let q1 = start + (mid - start) / 2;
            partition_leaves(leaf_aabbs, order, start, mid);
            let q3 = mid + (end - mid) / 2;
            partition_leaves(leaf_aabbs, order, mid, end);

            let ranges = [(start, q1), (q1, mid), (mid, q3), (q3, end)];
            for &(lo, hi) in ranges.iter() {
                let slot = num_children as usize;
                num_children += 1;
                if hi - lo == 1 {
                    let leaf = order[lo];
                    child_refs[slot] = -(leaf as i32) - 1;
                    child_bounds[slot] = leaf_aabbs[leaf as usize];
                } else {
                    let child_idx = self.nodes.len();
                    self.nodes.push(QbvhNode::zeroed());
                    // 1-based reference
                    child_refs[slot] = child_idx as i32 + 1;
                    self.build_node(child_idx, leaf_aabbs, order, lo, hi);
                    child_bounds[slot] = subtree_bounds(leaf_aabbs, &order[lo..hi]);
                }
            }
        }

        self.nodes[node_idx] = quantize_node(child_refs, &child_bounds, num_children);
    }

    /// Explicit-stack DFS over the tree. `visit` is called per intersected
    /// leaf with the current `t_max` and may return a closer hit distance
    /// to narrow subsequent slab tests.
    pub fn trace(
        &self,
        origin: Vec3,
        dir: Vec3,
        t_max: f32,
        mut visit: impl FnMut(u32, f32) -> Option<f32>,
    ) -> f32 {
        if self.nodes.is_empty() {
            return t_max;
        }

        let inv_dir = inv_ray_dir(dir);
        let mut t_max = t_max;

        let mut stack = [0i32; TRACE_STACK];
        let mut stack_size = 1usize;
        stack[0] = 1;

        while stack_size > 0 {
            stack_size -= 1;
            let node = &self.nodes[(stack[stack_size] - 1) as usize];
            let intersector = NodeIntersector::new(node, origin, inv_dir);

            for i in 0..node.num_children as usize {
                if !intersector.child_hit(node, i, t_max) {
                    continue;
                }
                match node.child(i) {
                    QbvhChild::Leaf(leaf) => {
                        if let Some(t_hit) = visit(leaf, t_max) {
                            t_max = t_max.min(t_hit);
                        }
                    }
                    QbvhChild::Internal(idx) => {
                        assert!(stack_size < TRACE_STACK, "QBVH trace stack overflow");
                        stack[stack_size] = idx as i32;
                        stack_size += 1;
                    }
                    QbvhChild::Absent => {}
                }
            }
        }

        t_max
    }
}

fn subtree_bounds(leaf_aabbs: &[Aabb], order: &[u32]) -> Aabb {
    let mut bounds = Aabb::invalid();
    for &leaf in order {
        bounds = bounds.union(&leaf_aabbs[leaf as usize]);
    }
    bounds
}

fn partition_leaves(leaf_aabbs: &[Aabb], order: &mut [u32], start: usize, end: usize) {
    let mut centroid_bounds = Aabb::invalid();
    for &leaf in &order[start..end] {
        let c = leaf_aabbs[leaf as usize].center();
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

    order[start..end].sort_by(|&a, &b| {
        let ca = leaf_aabbs[a as usize].center()[axis];
        let cb = leaf_aabbs[b as usize].center()[axis];
        ca.partial_cmp(&cb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
}

/// Choose per-axis exponents so every child's extent fits in 8 bits, then
/// quantize: mins round down, maxes round up.
fn quantize_node(child_refs: [i32; 4], child_bounds: &[Aabb; 4], num_children: u8) -> QbvhNode {
    let mut base = Vec3::splat(f32::MAX);
    let mut top = Vec3::splat(f32::MIN);
    for bounds in child_bounds.iter().take(num_children as usize) {
        base = base.min(bounds.min);
        top = top.max(bounds.max);
    }

    let extent = top - base;
    let exp_for = |extent: f32| -> i8 {
        if extent <= 0.0 {
            return -126;
        }
        let mut exp = (extent / 255.0).log2().ceil().clamp(-126.0, 127.0) as i32;
        // log2 is approximate; bump once if the scale still underflows 8 bits
        if extent > exp_scale(exp as i8) * 255.0 {
            exp += 1;
        }
        exp.clamp(-126, 127) as i8
    };
    let exp_x = exp_for(extent.x);
    let exp_y = exp_for(extent.y);
    let exp_z = exp_for(extent.z);
    let scale = Vec3::new(exp_scale(exp_x), exp_scale(exp_y), exp_scale(exp_z));

    let mut node = QbvhNode::zeroed();
    node.min_point = base.to_array();
    node.exp_x = exp_x;
    node.exp_y = exp_y;
    node.exp_z = exp_z;
    node.num_children = num_children;
    node.children = child_refs;

    for i in 0..num_children as usize {
        let q_min = ((child_bounds[i].min - base) / scale).floor();
        let q_max = ((child_bounds[i].max - base) / scale).ceil();
        node.q_min_x[i] = q_min.x.clamp(0.0, 255.0) as u8;
        node.q_min_y[i] = q_min.y.clamp(0.0, 255.0) as u8;
        node.q_min_z[i] = q_min.z.clamp(0.0, 255.0) as u8;
        node.q_max_x[i] = q_max.x.clamp(0.0, 255.0) as u8;
        node.q_max_y[i] = q_max.y.clamp(0.0, 255.0) as u8;
        node.q_max_z[i] = q_max.z.clamp(0.0, 255.0) as u8;
    }

    node
}
