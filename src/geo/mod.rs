//! Geometry primitives shared by the collision pipeline and the ray tracer.
//!
//! Everything here is plain data over [`glam`] types: axis-aligned bounding
//! boxes, planes in normal/offset form, line segments, and the half-edge
//! convex mesh used by the SAT narrow-phase. Numerical tolerances are
//! explicit constants so the collision code reads without magic numbers.

pub mod halfedge;

pub use halfedge::HalfEdgeMesh;

use glam::{Quat, Vec3};

/// Values below this are treated as zero.
pub const NEAR_ZERO: f32 = 1e-6;

/// Tolerance for the unit-vector parallelism test.
pub const PARALLEL_EPSILON: f32 = 1e-4;

/// Minimum denominator magnitude for segment-segment closest-point solves.
pub const SEGMENT_EPSILON: f32 = 1e-5;

/// A plane in normal/offset form: points `p` with `normal . p == d`.
#[derive(Debug, Clone, Copy)]
pub struct Plane {
    /// Unit normal.
    pub normal: Vec3,
    /// Offset along the normal.
    pub d: f32,
}

impl Plane {
    /// Create a plane from a unit normal and a point on the plane.
    #[inline]
    pub fn from_point(normal: Vec3, point: Vec3) -> Self {
        Self {
            normal,
            d: normal.dot(point),
        }
    }

    /// Signed distance from a point to the plane.
    /// Positive on the normal's side, negative behind.
    #[inline]
    pub fn signed_distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) - self.d
    }
}

/// A line segment between two points.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub p1: Vec3,
    pub p2: Vec3,
}

/// Test whether two unit vectors are (anti-)parallel.
#[inline]
pub fn are_parallel(a: Vec3, b: Vec3) -> bool {
    (a.dot(b).abs() - 1.0).abs() < PARALLEL_EPSILON
}

/// Intersection of the line through `p1` and `p2` with the plane's zero
/// level. The segment must not be parallel to the plane.
#[inline]
pub fn plane_intersection(plane: &Plane, p1: Vec3, p2: Vec3) -> Vec3 {
    let distance = plane.signed_distance(p1);
    p1 + (p2 - p1) * (-distance / plane.normal.dot(p2 - p1))
}

/// Shortest bridge between two segments, with both parameters clamped to
/// `[0, 1]`. Near-parallel segments pin the first parameter to zero.
pub fn shortest_segment_between(seg1: &Segment, seg2: &Segment) -> Segment {
    let v1 = seg1.p2 - seg1.p1;
    let v2 = seg2.p2 - seg2.p1;
    let v21 = seg2.p1 - seg1.p1;

    let dot_v22 = v2.dot(v2);
    let dot_v11 = v1.dot(v1);
    let dot_v21 = v2.dot(v1);
    let dot_v211 = v21.dot(v1);
    let dot_v212 = v21.dot(v2);

    let denom = dot_v21 * dot_v21 - dot_v22 * dot_v11;

    let (mut s, mut t);
    if denom.abs() < SEGMENT_EPSILON {
        s = 0.0;
        t = (dot_v11 * s - dot_v211) / dot_v21;
    } else {
        s = (dot_v212 * dot_v21 - dot_v22 * dot_v211) / denom;
        t = (-dot_v211 * dot_v21 + dot_v11 * dot_v212) / denom;
    }

    s = s.clamp(0.0, 1.0);
    t = t.clamp(0.0, 1.0);

    Segment {
        p1: seg1.p1 + v1 * s,
        p2: seg2.p1 + v2 * t,
    }
}

/// Axis-aligned bounding box with `min <= max` componentwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create a new AABB.
    #[inline]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// An inverted AABB that unions to any point.
    #[inline]
    pub fn invalid() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    /// Tightest box around a set of points.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut out = Self::invalid();
        for p in points {
            out.min = out.min.min(p);
            out.max = out.max.max(p);
        }
        out
    }

    /// Test whether two AABBs overlap (inclusive bounds).
    #[inline]
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Test whether a point lies inside (inclusive).
    #[inline]
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Smallest box containing both.
    #[inline]
    pub fn union(&self, other: &Aabb) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Center point.
    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Grow symmetrically by `amount` on every axis.
    #[inline]
    pub fn expanded(&self, amount: f32) -> Self {
        Self {
            min: self.min - Vec3::splat(amount),
            max: self.max + Vec3::splat(amount),
        }
    }

    /// The 8 corners of the box.
    pub fn corners(&self) -> [Vec3; 8] {
        let (min, max) = (self.min, self.max);
        [
            Vec3::new(min.x, min.y, min.z),
            Vec3::new(max.x, min.y, min.z),
            Vec3::new(min.x, max.y, min.z),
            Vec3::new(max.x, max.y, min.z),
            Vec3::new(min.x, min.y, max.z),
            Vec3::new(max.x, min.y, max.z),
            Vec3::new(min.x, max.y, max.z),
            Vec3::new(max.x, max.y, max.z),
        ]
    }

    /// Transform by translation/rotation/diagonal-scale and re-wrap.
    ///
    /// This is the AABB of the 8 transformed corners, not the minimal box
    /// around the rotated volume.
    pub fn apply_trs(&self, translation: Vec3, rotation: Quat, scale: Vec3) -> Self {
        let mut out = Self::invalid();
        for corner in self.corners() {
            let p = rotation * (scale * corner) + translation;
            out.min = out.min.min(p);
            out.max = out.max.max(p);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn test_aabb_overlap() {
        let a = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let b = Aabb::new(Vec3::splat(0.5), Vec3::splat(2.0));
        let c = Aabb::new(Vec3::splat(1.5), Vec3::splat(3.0));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        // Touching faces count as overlap
        let d = Aabb::new(Vec3::new(1.0, -1.0, -1.0), Vec3::new(2.0, 1.0, 1.0));
        assert!(a.overlaps(&d));
    }

    #[test]
    fn test_aabb_union() {
        let a = Aabb::new(Vec3::splat(-1.0), Vec3::splat(0.0));
        let b = Aabb::new(Vec3::splat(0.5), Vec3::splat(2.0));
        let u = a.union(&b);
        assert_eq!(u.min, Vec3::splat(-1.0));
        assert_eq!(u.max, Vec3::splat(2.0));
    }

    #[test]
    fn test_aabb_trs_contains_transformed_corners() {
        let aabb = Aabb::new(Vec3::new(-1.0, -2.0, -0.5), Vec3::new(1.0, 0.5, 2.0));
        let t = Vec3::new(3.0, -1.0, 2.0);
        let r = Quat::from_euler(glam::EulerRot::XYZ, 0.7, -0.3, 1.9);
        let s = Vec3::new(2.0, 0.5, 1.5);

        let world = aabb.apply_trs(t, r, s);
        for corner in aabb.corners() {
            let p = r * (s * corner) + t;
            assert!(world.expanded(1e-5).contains_point(p), "corner {p} escaped");
        }
    }

    #[test]
    fn test_plane_signed_distance() {
        let plane = Plane::from_point(Vec3::Z, Vec3::new(0.0, 0.0, 2.0));
        assert!((plane.signed_distance(Vec3::new(5.0, 5.0, 3.0)) - 1.0).abs() < 1e-6);
        assert!((plane.signed_distance(Vec3::new(0.0, 0.0, 0.0)) + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_plane_intersection() {
        let plane = Plane { normal: Vec3::Z, d: 0.0 };
        let hit = plane_intersection(&plane, Vec3::new(0.0, 0.0, -1.0), Vec3::new(2.0, 0.0, 1.0));
        assert!((hit - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_are_parallel() {
        assert!(are_parallel(Vec3::X, Vec3::X));
        assert!(are_parallel(Vec3::X, -Vec3::X));
        assert!(!are_parallel(Vec3::X, Vec3::Y));
        let nearly = Vec3::new(1.0, 1e-5, 0.0).normalize();
        assert!(are_parallel(Vec3::X, nearly));
    }

    #[test]
    fn test_shortest_segment_between() {
        // Crossing X and Y axes separated along Z
        let a = Segment { p1: Vec3::new(-1.0, 0.0, 0.0), p2: Vec3::new(1.0, 0.0, 0.0) };
        let b = Segment { p1: Vec3::new(0.0, -1.0, 1.0), p2: Vec3::new(0.0, 1.0, 1.0) };
        let bridge = shortest_segment_between(&a, &b);
        assert!((bridge.p1 - Vec3::ZERO).length() < 1e-5);
        assert!((bridge.p2 - Vec3::new(0.0, 0.0, 1.0)).length() < 1e-5);

        // Clamped: segments end-to-end
        let c = Segment { p1: Vec3::new(2.0, 0.0, 0.0), p2: Vec3::new(3.0, 1.0, 0.0) };
        let bridge = shortest_segment_between(&a, &c);
        assert!((bridge.p1 - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-5);
        assert!((bridge.p2 - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-5);
    }
}
