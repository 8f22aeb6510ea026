//! Narrow-phase contact generation: exact SAT between convex primitives.
//!
//! Consumes the broad-phase candidate stream and produces contact manifolds
//! (up to four points) into the solver's constraint buffer. Each candidate
//! pair is self-contained work, so the whole phase is a parallel-for; every
//! rayon worker carries its own scratch polygon buffers for the clipping
//! steps.
//!
//! Pairs are normalized by primitive-type order (`Sphere < Hull < Plane`)
//! so there are six handler cells. Plane-plane can never occur (planes are
//! static and the broad-phase skips static-static pairs); hitting it is a
//! fatal invariant violation.

use glam::{Mat3, Quat, Vec3, Vec4};
use rayon::prelude::*;

use crate::ecs::{CollisionEvent, ObjectId, Transform};
use crate::geo::{
    are_parallel, plane_intersection, shortest_segment_between, HalfEdgeMesh, Plane, Segment,
};

use super::broadphase::CandidateCollision;
use super::buffer::AppendBuffer;
use super::object::{CollisionPrimitive, ObjectManager};
use super::solver::{ContactConstraint, SolverData};

/// Scratch polygon capacity per clipping buffer.
const MAX_SCRATCH_VERTICES: usize = 512;

/// A contact manifold for one colliding pair.
#[derive(Debug, Clone, Copy)]
pub struct Manifold {
    pub points: [Vec3; 4],
    pub depths: [f32; 4],
    pub num_points: u32,
    /// World-space contact normal.
    pub normal: Vec3,
    /// Whether entity `a` owns the reference face.
    pub a_is_reference: bool,
}

impl Manifold {
    fn empty() -> Self {
        Self {
            points: [Vec3::ZERO; 4],
            depths: [0.0; 4],
            num_points: 0,
            normal: Vec3::ZERO,
            a_is_reference: false,
        }
    }
}

/// Per-worker scratch for hull transforms and polygon clipping.
struct Scratch {
    verts_a: Vec<Vec3>,
    planes_a: Vec<Plane>,
    verts_b: Vec<Vec3>,
    planes_b: Vec<Plane>,
    clip_front: Vec<Vec3>,
    clip_back: Vec<Vec3>,
    points: Vec<Vec3>,
    depths: Vec<f32>,
}

impl Scratch {
    fn new() -> Self {
        Self {
            verts_a: Vec::with_capacity(64),
            planes_a: Vec::with_capacity(32),
            verts_b: Vec::with_capacity(64),
            planes_b: Vec::with_capacity(32),
            clip_front: Vec::with_capacity(MAX_SCRATCH_VERTICES),
            clip_back: Vec::with_capacity(MAX_SCRATCH_VERTICES),
            points: Vec::with_capacity(MAX_SCRATCH_VERTICES),
            depths: Vec::with_capacity(MAX_SCRATCH_VERTICES),
        }
    }
}

/// A hull with vertices and face planes brought into world space once per
/// pair; topology stays on the shared mesh.
struct HullState<'a> {
    vertices: &'a [Vec3],
    face_planes: &'a [Plane],
    mesh: &'a HalfEdgeMesh,
    center: Vec3,
}

/// Transform a hull into world space. Normals go through `R * S^-1`,
/// vertices through `R * S`.
fn make_hull_state<'a>(
    mesh: &'a HalfEdgeMesh,
    translation: Vec3,
    rotation: Quat,
    scale: Vec3,
    dst_vertices: &'a mut Vec<Vec3>,
    dst_planes: &'a mut Vec<Plane>,
) -> HullState<'a> {
    let unscaled_rot = Mat3::from_quat(rotation);
    let vertex_txfm = unscaled_rot * Mat3::from_diagonal(scale);
    let normal_txfm = unscaled_rot * Mat3::from_diagonal(scale.recip());

    dst_vertices.clear();
    dst_vertices.extend(mesh.vertices().iter().map(|&v| vertex_txfm * v + translation));

    dst_planes.clear();
    dst_planes.extend(mesh.face_planes().iter().map(|plane| {
        let plane_origin = vertex_txfm * (plane.normal * plane.d) + translation;
        let normal = (normal_txfm * plane.normal).normalize();
        Plane::from_point(normal, plane_origin)
    }));

    HullState {
        vertices: dst_vertices,
        face_planes: dst_planes,
        mesh,
        center: translation,
    }
}

/// Farthest hull vertex along `dir`.
fn support(hull: &HullState, dir: Vec3) -> Vec3 {
    let mut furthest = hull.vertices[0];
    let mut max_dot = dir.dot(furthest);
    for &vertex in &hull.vertices[1..] {
        let d = dir.dot(vertex);
        if d > max_dot {
            max_dot = d;
            furthest = vertex;
        }
    }
    furthest
}

#[derive(Debug, Clone, Copy)]
struct FaceQuery {
    separation: f32,
    face: usize,
}

/// Best (least negative) separation over `a`'s face directions, measured
/// against `b`'s support points.
fn query_face_directions(a: &HullState, b: &HullState) -> FaceQuery {
    let mut best = FaceQuery {
        separation: f32::MIN,
        face: 0,
    };

    for (face, plane) in a.face_planes.iter().enumerate() {
        let support_b = support(b, -plane.normal);
        let distance = plane.signed_distance(support_b);
        if distance > best.separation {
            best = FaceQuery {
                separation: distance,
                face,
            };
        }
    }

    best
}

/// Separation of a hull from an infinite plane.
fn query_face_directions_plane(plane: &Plane, hull: &HullState) -> f32 {
    let support_point = support(hull, -plane.normal);
    plane.signed_distance(support_point)
}

#[derive(Debug, Clone, Copy)]
struct EdgeQuery {
    separation: f32,
    normal: Vec3,
    /// Half-edge indices into the respective meshes.
    edge_a: u32,
    edge_b: u32,
}

/// Gauss-map arc crossing test: do the two edge arcs intersect on the
/// Minkowski sum, making the edge pair a separating-axis candidate?
fn is_minkowski_face(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> bool {
    let bxa = b.cross(a);
    let dxc = d.cross(c);

    let cba = c.dot(bxa);
    let dba = d.dot(bxa);
    let adc = a.dot(dxc);
    let bdc = b.dot(dxc);

    cba * dba < 0.0 && adc * bdc < 0.0 && cba * bdc > 0.0
}

fn edge_normals(hull: &HullState, half_edge: u32) -> (Vec3, Vec3) {
    let he = hull.mesh.half_edges()[half_edge as usize];
    let normal1 = hull.face_planes[he.face as usize].normal;
    let twin_face = hull.mesh.half_edges()[he.twin as usize].face;
    let normal2 = hull.face_planes[twin_face as usize].normal;
    (normal1, normal2)
}

fn edge_segment(hull: &HullState, half_edge: u32) -> Segment {
    let he = hull.mesh.half_edges()[half_edge as usize];
    let p1 = hull.vertices[he.root_vertex as usize];
    let p2 = hull.vertices[hull.mesh.half_edges()[he.next as usize].root_vertex as usize];
    Segment { p1, p2 }
}

fn builds_minkowski_face(a: &HullState, b: &HullState, he_a: u32, he_b: u32) -> bool {
    let (a1, a2) = edge_normals(a, he_a);
    let (b1, b2) = edge_normals(b, he_b);
    is_minkowski_face(a1, a2, -b1, -b2)
}

/// Separating axis from an edge pair: `normalize(dir_a x dir_b)` oriented
/// outward from `a`'s center. Parallel edges yield no axis.
fn edge_axis(a: &HullState, b: &HullState, he_a: u32, he_b: u32) -> Option<(Vec3, f32)> {
    let seg_a = edge_segment(a, he_a);
    let seg_b = edge_segment(b, he_b);

    let dir_a = seg_a.p2 - seg_a.p1;
    let dir_b = seg_b.p2 - seg_b.p1;

    if are_parallel(dir_a.normalize(), dir_b.normalize()) {
        return None;
    }

    let mut normal = dir_a.cross(dir_b).normalize();
    if normal.dot(seg_a.p1 - a.center) < 0.0 {
        normal = -normal;
    }

    Some((normal, normal.dot(seg_b.p1 - seg_a.p1)))
}

/// Best separation over all Minkowski-face edge pairs. `None` when no edge
/// pair forms a Minkowski face — the caller must treat that as "no edge
/// axis", not as a separation.
fn query_edge_directions(a: &HullState, b: &HullState) -> Option<EdgeQuery> {
    let mut best: Option<EdgeQuery> = None;

    for &he_a in a.mesh.edge_indices() {
        for &he_b in b.mesh.edge_indices() {
            if !builds_minkowski_face(a, b, he_a, he_b) {
                continue;
            }
            let Some((normal, separation)) = edge_axis(a, b, he_a, he_b) else {
                continue;
            };
            if best.map_or(true, |q| separation > q.separation) {
                best = Some(EdgeQuery {
                    separation,
                    normal,
                    edge_a: he_a,
                    edge_b: he_b,
                });
            }
        }
    }

    best
}

/// Face on `hull` most anti-aligned with the reference normal.
fn find_incident_face(hull: &HullState, ref_normal: Vec3) -> usize {
    let mut min_dot = f32::MAX;
    let mut incident = 0;
    for (face, plane) in hull.face_planes.iter().enumerate() {
        let d = plane.normal.dot(ref_normal);
        if d < min_dot {
            min_dot = d;
            incident = face;
        }
    }
    incident
}

/// Collect a face's vertices in loop order.
fn collect_face_vertices(hull: &HullState, face: usize, out: &mut Vec<Vec3>) {
    out.clear();
    let first = hull.mesh.face_first_edges()[face];
    let mut cursor = first;
    loop {
        let he = hull.mesh.half_edges()[cursor as usize];
        out.push(hull.vertices[he.root_vertex as usize]);
        cursor = he.next;
        if cursor == first {
            break;
        }
    }
}

/// One Sutherland-Hodgman pass: clip `input` against `plane` into `out`,
/// keeping the side where signed distance is non-positive.
fn clip_polygon(plane: &Plane, input: &[Vec3], out: &mut Vec<Vec3>) {
    out.clear();
    if input.is_empty() {
        return;
    }

    let mut v1 = input[input.len() - 1];
    let mut d1 = plane.signed_distance(v1);

    for &v2 in input {
        let d2 = plane.signed_distance(v2);

        if d1 <= 0.0 && d2 <= 0.0 {
            out.push(v2);
        } else if d1 <= 0.0 && d2 > 0.0 {
            out.push(plane_intersection(plane, v1, v2));
        } else if d2 <= 0.0 && d1 > 0.0 {
            out.push(plane_intersection(plane, v1, v2));
            out.push(v2);
        }

        v1 = v2;
        d1 = d2;
    }
}

/// Assemble a face-contact manifold, reducing to four points when the
/// clipper produced more: keep the first point, the farthest from it, the
/// point maximizing the signed triangle area with those two, and the point
/// minimizing it. Selection is by index bookkeeping so no candidate is
/// clobbered mid-scan.
fn build_face_manifold(
    normal: Vec3,
    points: &[Vec3],
    depths: &[f32],
    a_is_reference: bool,
) -> Manifold {
    let mut manifold = Manifold {
        normal,
        a_is_reference,
        ..Manifold::empty()
    };

    if points.len() <= 4 {
        manifold.num_points = points.len() as u32;
        for i in 0..points.len() {
            manifold.points[i] = points[i];
            manifold.depths[i] = depths[i];
        }
        return manifold;
    }

    manifold.num_points = 4;
    let p0 = points[0];
    manifold.points[0] = p0;
    manifold.depths[0] = depths[0];

    // Farthest from the anchor
    let mut i1 = 1;
    let mut best_d2 = 0.0f32;
    for (i, &p) in points.iter().enumerate().skip(1) {
        let d2 = p0.distance_squared(p);
        if d2 > best_d2 {
            best_d2 = d2;
            i1 = i;
        }
    }
    manifold.points[1] = points[i1];
    manifold.depths[1] = depths[i1];
    let diff0 = points[i1] - p0;

    // Maximize then minimize the signed triangle area with (p0, p1)
    let mut i2 = usize::MAX;
    let mut best_area = 0.0f32;
    for (i, &p) in points.iter().enumerate().skip(1) {
        if i == i1 {
            continue;
        }
        let area = normal.dot(diff0.cross(p - p0));
        if i2 == usize::MAX || area > best_area {
            best_area = area;
            i2 = i;
        }
    }
    manifold.points[2] = points[i2];
    manifold.depths[2] = depths[i2];

    let mut i3 = usize::MAX;
    let mut worst_area = 0.0f32;
    for (i, &p) in points.iter().enumerate().skip(1) {
        if i == i1 || i == i2 {
            continue;
        }
        let area = normal.dot(diff0.cross(p - p0));
        if i3 == usize::MAX || area < worst_area {
            worst_area = area;
            i3 = i;
        }
    }
    manifold.points[3] = points[i3];
    manifold.depths[3] = depths[i3];

    manifold
}

/// Face contact: clip the incident face against the reference face's side
/// planes, keep the clipped vertices behind the reference plane, and
/// project them onto it.
fn create_face_contact(
    face_query_a: FaceQuery,
    a: &HullState,
    face_query_b: FaceQuery,
    b: &HullState,
    scratch_clip_front: &mut Vec<Vec3>,
    scratch_clip_back: &mut Vec<Vec3>,
    scratch_points: &mut Vec<Vec3>,
    scratch_depths: &mut Vec<f32>,
) -> Manifold {
    let a_is_reference = face_query_a.separation > face_query_b.separation;
    let (ref_hull, other_hull, ref_face) = if a_is_reference {
        (a, b, face_query_a.face)
    } else {
        (b, a, face_query_b.face)
    };
    let ref_plane = ref_hull.face_planes[ref_face];

    let incident_face = find_incident_face(other_hull, ref_plane.normal);
    collect_face_vertices(other_hull, incident_face, scratch_clip_front);

    // Clip against every side plane of the reference face. Side-plane
    // normals are edge x refNormal, so "behind" is toward the face.
    let mut input: &mut Vec<Vec3> = scratch_clip_front;
    let mut output: &mut Vec<Vec3> = scratch_clip_back;
    {
        let first = ref_hull.mesh.face_first_edges()[ref_face];
        let mut cursor = first;
        let mut cur_point =
            ref_hull.vertices[ref_hull.mesh.half_edges()[cursor as usize].root_vertex as usize];
        loop {
            cursor = ref_hull.mesh.half_edges()[cursor as usize].next;
            let next_point =
                ref_hull.vertices[ref_hull.mesh.half_edges()[cursor as usize].root_vertex as usize];

            let edge = next_point - cur_point;
            let side_plane = Plane::from_point(edge.cross(ref_plane.normal), cur_point);
            cur_point = next_point;

            clip_polygon(&side_plane, input, output);
            std::mem::swap(&mut input, &mut output);

            if cursor == first {
                break;
            }
        }
    }
    // The final swap leaves the clipped polygon in `input`.

    scratch_points.clear();
    scratch_depths.clear();
    for &vertex in input.iter() {
        let d = ref_plane.signed_distance(vertex);
        if d < 0.0 {
            scratch_points.push(vertex - d * ref_plane.normal);
            scratch_depths.push(-d);
        }
    }

    build_face_manifold(ref_plane.normal, scratch_points, scratch_depths, a_is_reference)
}

/// Face contact of a hull against an infinite plane: project the incident
/// face's submerged vertices onto the plane.
fn create_face_contact_plane(
    hull: &HullState,
    plane: &Plane,
    scratch_points: &mut Vec<Vec3>,
    scratch_depths: &mut Vec<f32>,
) -> Manifold {
    let incident_face = find_incident_face(hull, plane.normal);

    scratch_points.clear();
    scratch_depths.clear();

    let first = hull.mesh.face_first_edges()[incident_face];
    let mut cursor = first;
    loop {
        let he = hull.mesh.half_edges()[cursor as usize];
        let vertex = hull.vertices[he.root_vertex as usize];
        let d = plane.signed_distance(vertex);
        if d < 0.0 {
            scratch_points.push(vertex - d * plane.normal);
            scratch_depths.push(-d);
        }
        cursor = he.next;
        if cursor == first {
            break;
        }
    }

    build_face_manifold(plane.normal, scratch_points, scratch_depths, false)
}

/// Edge contact: midpoint of the shortest bridge between the two edges.
fn create_edge_contact(query: &EdgeQuery, a: &HullState, b: &HullState) -> Manifold {
    let seg_a = edge_segment(a, query.edge_a);
    let seg_b = edge_segment(b, query.edge_b);

    let bridge = shortest_segment_between(&seg_a, &seg_b);

    let mut manifold = Manifold::empty();
    manifold.points[0] = (bridge.p1 + bridge.p2) * 0.5;
    manifold.depths[0] = (bridge.p2 - bridge.p1).length() * 0.5;
    manifold.num_points = 1;
    manifold.normal = query.normal;
    // The axis was oriented out of hull A
    manifold.a_is_reference = true;
    manifold
}

/// Full SAT between two hulls in world space.
fn sat_hull_hull(
    a: &HullState,
    b: &HullState,
    clip_front: &mut Vec<Vec3>,
    clip_back: &mut Vec<Vec3>,
    points: &mut Vec<Vec3>,
    depths: &mut Vec<f32>,
) -> Manifold {
    let face_query_a = query_face_directions(a, b);
    if face_query_a.separation > 0.0 {
        return Manifold::empty();
    }

    let face_query_b = query_face_directions(b, a);
    if face_query_b.separation > 0.0 {
        return Manifold::empty();
    }

    let edge_query = query_edge_directions(a, b);
    if let Some(q) = &edge_query {
        if q.separation > 0.0 {
            return Manifold::empty();
        }
    }

    // The edge axis wins only when it beats both face queries; with no
    // Minkowski-face pair at all there is no edge axis and the face
    // contact is forced.
    match &edge_query {
        Some(query)
            if query.separation >= face_query_a.separation
                && query.separation >= face_query_b.separation =>
        {
            create_edge_contact(query, a, b)
        }
        _ => create_face_contact(
            face_query_a,
            a,
            face_query_b,
            b,
            clip_front,
            clip_back,
            points,
            depths,
        ),
    }
}

/// SAT of a hull against an infinite plane.
fn sat_hull_plane(
    hull: &HullState,
    plane: &Plane,
    points: &mut Vec<Vec3>,
    depths: &mut Vec<f32>,
) -> Manifold {
    let separation = query_face_directions_plane(plane, hull);
    if separation > 0.0 {
        return Manifold::empty();
    }
    create_face_contact_plane(hull, plane, points, depths)
}

/// Sphere against hull: closest point on the hull surface to the sphere
/// center, with a deep-center fallback through the least-penetrating face.
fn sphere_hull(center: Vec3, radius: f32, hull: &HullState) -> Manifold {
    let mut max_separation = f32::MIN;
    let mut best_face = 0;
    for (face, plane) in hull.face_planes.iter().enumerate() {
        let d = plane.signed_distance(center);
        if d > max_separation {
            max_separation = d;
            best_face = face;
        }
    }

    if max_separation > radius {
        return Manifold::empty();
    }

    let mut manifold = Manifold::empty();

    if max_separation <= 0.0 {
        // Center inside: push out through the nearest face
        let plane = hull.face_planes[best_face];
        manifold.points[0] = center - max_separation * plane.normal;
        manifold.depths[0] = radius - max_separation;
        manifold.normal = plane.normal;
        manifold.num_points = 1;
        manifold.a_is_reference = true;
        return manifold;
    }

    // Center outside: closest point on the nearest face's polygon
    let mut closest = Vec3::ZERO;
    let mut closest_d2 = f32::MAX;
    let first = hull.mesh.face_first_edges()[best_face];
    let mut cursor = first;
    let mut inside = true;
    let plane = hull.face_planes[best_face];
    loop {
        let he = hull.mesh.half_edges()[cursor as usize];
        let p1 = hull.vertices[he.root_vertex as usize];
        let p2 = hull.vertices
            [hull.mesh.half_edges()[he.next as usize].root_vertex as usize];

        // Side-plane test for the face-interior case
        let side_normal = (p2 - p1).cross(plane.normal);
        if side_normal.dot(center - p1) > 0.0 {
            inside = false;
        }

        // Closest point on this boundary edge
        let dir = p2 - p1;
        let t = (dir.dot(center - p1) / dir.length_squared()).clamp(0.0, 1.0);
        let on_edge = p1 + dir * t;
        let d2 = center.distance_squared(on_edge);
        if d2 < closest_d2 {
            closest_d2 = d2;
            closest = on_edge;
        }

        cursor = he.next;
        if cursor == first {
            break;
        }
    }

    if inside {
        closest = center - max_separation * plane.normal;
        closest_d2 = max_separation * max_separation;
    }

    let distance = closest_d2.sqrt();
    if distance >= radius {
        return Manifold::empty();
    }

    manifold.normal = if distance > crate::geo::NEAR_ZERO {
        (center - closest) / distance
    } else {
        plane.normal
    };
    manifold.points[0] = closest;
    manifold.depths[0] = radius - distance;
    manifold.num_points = 1;
    manifold.a_is_reference = true;
    manifold
}

/// Plane of a plane-primitive entity: canonical normal +z rotated by the
/// entity, offset through the entity position.
#[inline]
fn entity_plane(transform: &Transform) -> Plane {
    let normal = transform.rotation * Vec3::Z;
    Plane::from_point(normal, transform.position)
}

/// Per-world narrow-phase state: the per-step collision-event stream.
#[derive(Debug)]
pub struct Narrowphase {
    events: AppendBuffer<CollisionEvent>,
}

impl Narrowphase {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: AppendBuffer::new(max_events),
        }
    }

    /// Collision events observed this step.
    pub fn events(&mut self) -> &[CollisionEvent] {
        self.events.as_slice()
    }

    /// Reclaim the event stream at step end.
    pub fn reset(&mut self) {
        self.events.clear();
    }

    /// Run contact generation over the candidate stream. Parallel-for over
    /// candidates; contacts land in `solver` through its atomic cursor.
    pub fn execute(
        &self,
        world: &hecs::World,
        objects: &ObjectManager,
        candidates: &[CandidateCollision],
        solver: &SolverData,
    ) {
        candidates.par_iter().for_each_init(Scratch::new, |scratch, candidate| {
            process_candidate(world, objects, solver, &self.events, scratch, candidate);
        });
    }
}

fn push_manifold(
    solver: &SolverData,
    manifold: &Manifold,
    a_entity: hecs::Entity,
    b_entity: hecs::Entity,
) {
    let mut points = [Vec4::ZERO; 4];
    for i in 0..manifold.num_points as usize {
        points[i] = manifold.points[i].extend(manifold.depths[i]);
    }
    solver.push_contact(ContactConstraint {
        reference: if manifold.a_is_reference { a_entity } else { b_entity },
        alternate: if manifold.a_is_reference { b_entity } else { a_entity },
        points,
        num_points: manifold.num_points,
        normal: manifold.normal,
    });
}

fn process_candidate(
    world: &hecs::World,
    objects: &ObjectManager,
    solver: &SolverData,
    events: &AppendBuffer<CollisionEvent>,
    scratch: &mut Scratch,
    candidate: &CandidateCollision,
) {
    let mut a_entity = candidate.a;
    let mut b_entity = candidate.b;
    let mut a_prim_idx = candidate.a_prim as usize;
    let mut b_prim_idx = candidate.b_prim as usize;

    let mut a_obj = *world
        .get::<&ObjectId>(a_entity)
        .expect("candidate entity lacks ObjectId");
    let mut b_obj = *world
        .get::<&ObjectId>(b_entity)
        .expect("candidate entity lacks ObjectId");

    // Normalize handler order by primitive type tag
    if objects.primitives(a_obj)[a_prim_idx].order() > objects.primitives(b_obj)[b_prim_idx].order()
    {
        std::mem::swap(&mut a_entity, &mut b_entity);
        std::mem::swap(&mut a_obj, &mut b_obj);
        std::mem::swap(&mut a_prim_idx, &mut b_prim_idx);
    }

    let a_prim = &objects.primitives(a_obj)[a_prim_idx];
    let b_prim = &objects.primitives(b_obj)[b_prim_idx];

    let a_tf = *world
        .get::<&Transform>(a_entity)
        .expect("candidate entity lacks Transform");
    let b_tf = *world
        .get::<&Transform>(b_entity)
        .expect("candidate entity lacks Transform");

    // Defensive gate: the broad-phase already filtered, but transforms are
    // cheap to re-check against the whole-object bounds.
    {
        let a_aabb = objects
            .object_aabb(a_obj)
            .apply_trs(a_tf.position, a_tf.rotation, a_tf.scale);
        let b_aabb = objects
            .object_aabb(b_obj)
            .apply_trs(b_tf.position, b_tf.rotation, b_tf.scale);
        if !a_aabb.overlaps(&b_aabb) {
            return;
        }
    }

    let manifold = match (a_prim, b_prim) {
        (
            CollisionPrimitive::Sphere { radius: a_radius },
            CollisionPrimitive::Sphere { radius: b_radius },
        ) => {
            let to_b = b_tf.position - a_tf.position;
            let dist = to_b.length();

            if dist > 0.0 && dist < a_radius + b_radius {
                let mut manifold = Manifold::empty();
                manifold.points[0] = a_tf.position + to_b * 0.5;
                manifold.depths[0] = a_radius + b_radius - dist;
                manifold.normal = to_b / dist;
                manifold.num_points = 1;
                manifold.a_is_reference = true;
                manifold
            } else {
                Manifold::empty()
            }
        }
        (CollisionPrimitive::Sphere { radius }, CollisionPrimitive::Hull(mesh)) => {
            let hull = make_hull_state(
                mesh,
                b_tf.position,
                b_tf.rotation,
                b_tf.scale,
                &mut scratch.verts_b,
                &mut scratch.planes_b,
            );
            sphere_hull(a_tf.position, *radius, &hull)
        }
        (CollisionPrimitive::Sphere { radius }, CollisionPrimitive::Plane) => {
            let radius = *radius;
            let plane = entity_plane(&b_tf);
            let t = plane.signed_distance(a_tf.position);
            let penetration = radius - t;

            if penetration > 0.0 {
                let mut manifold = Manifold::empty();
                manifold.points[0] = a_tf.position - radius * plane.normal;
                manifold.depths[0] = penetration;
                manifold.normal = plane.normal;
                manifold.num_points = 1;
                // The plane owns the reference side
                manifold.a_is_reference = false;
                manifold
            } else {
                Manifold::empty()
            }
        }
        (CollisionPrimitive::Hull(a_mesh), CollisionPrimitive::Hull(b_mesh)) => {
            let Scratch {
                verts_a,
                planes_a,
                verts_b,
                planes_b,
                clip_front,
                clip_back,
                points,
                depths,
            } = scratch;
            let a_hull = make_hull_state(
                a_mesh,
                a_tf.position,
                a_tf.rotation,
                a_tf.scale,
                verts_a,
                planes_a,
            );
            let b_hull = make_hull_state(
                b_mesh,
                b_tf.position,
                b_tf.rotation,
                b_tf.scale,
                verts_b,
                planes_b,
            );
            sat_hull_hull(&a_hull, &b_hull, clip_front, clip_back, points, depths)
        }
        (CollisionPrimitive::Hull(mesh), CollisionPrimitive::Plane) => {
            let Scratch {
                verts_a,
                planes_a,
                points,
                depths,
                ..
            } = scratch;
            let hull = make_hull_state(
                mesh,
                a_tf.position,
                a_tf.rotation,
                a_tf.scale,
                verts_a,
                planes_a,
            );
            let plane = entity_plane(&b_tf);
            sat_hull_plane(&hull, &plane, points, depths)
        }
        (CollisionPrimitive::Plane, CollisionPrimitive::Plane) => {
            panic!("plane-plane candidate: planes must be static")
        }
        _ => unreachable!("candidate pair not canonically ordered"),
    };

    if manifold.num_points > 0 {
        push_manifold(solver, &manifold, a_entity, b_entity);
        events.try_push(CollisionEvent {
            a: candidate.a,
            b: candidate.b,
        });
    }
}
