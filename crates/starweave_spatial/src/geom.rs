//! Combat geometry.
//!
//! Pure functions behind the scan/shoot pipeline: cone reachability against
//! partition bounds, circle/triangle and circle/cap intersection, shield
//! coverage, and the damage falloff curve. All angles are radians; a shot
//! cone is described by its origin, center direction, half-width and radius.

use serde::{Deserialize, Serialize};

use crate::quad::Quad;

/// Energy-to-area scaling for scans and shots.
pub const SCAN_ENERGY_SCALING_FACTOR: f64 = 2000.0;

/// 2D vector / point, double precision.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn dot(self, other: Vec2) -> f64 {
        self.x * other.x + self.y * other.y
    }

    pub fn length_squared(self) -> f64 {
        self.dot(self)
    }

    pub fn length(self) -> f64 {
        self.length_squared().sqrt()
    }

    pub fn normalized(self) -> Vec2 {
        let len = self.length();
        if len == 0.0 {
            Vec2::ZERO
        } else {
            self * (1.0 / len)
        }
    }

    /// The polar angle of this vector.
    pub fn angle(self) -> f64 {
        self.y.atan2(self.x)
    }
}

impl std::ops::Add for Vec2 {
    type Output = Vec2;
    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Vec2;
    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Mul<f64> for Vec2 {
    type Output = Vec2;
    fn mul(self, k: f64) -> Vec2 {
        Vec2::new(self.x * k, self.y * k)
    }
}

impl std::ops::AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Vec2) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl std::fmt::Display for Vec2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

pub fn rad2deg(rad: f64) -> f64 {
    rad * 180.0 / std::f64::consts::PI
}

pub fn deg2rad(deg: f64) -> f64 {
    deg * std::f64::consts::PI / 180.0
}

pub fn tolerance_eq(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance
}

/// Unit direction vector for an angle.
pub fn dir_vec(direction: f64) -> Vec2 {
    Vec2::new(direction.cos(), direction.sin())
}

/// Wraps an angle into `0..2π`.
pub fn clamp_angle(angle: f64) -> f64 {
    let tau = 2.0 * std::f64::consts::PI;
    let a = angle % tau;
    if a < 0.0 {
        a + tau
    } else {
        a
    }
}

/// Folds an angle into `-π..π`.
pub fn normalize_angle(angle: f64) -> f64 {
    let pi = std::f64::consts::PI;
    if angle > pi {
        angle - 2.0 * pi
    } else if angle < -pi {
        angle + 2.0 * pi
    } else {
        angle
    }
}

fn sign(x: f64) -> i32 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

/// Which side of the directed line `a -> b` the point lies on.
pub fn point_line_sign(point: Vec2, a: Vec2, b: Vec2) -> i32 {
    let normal = Vec2::new(b.y - a.y, -(b.x - a.x));
    sign(normal.dot(point - a))
}

/// Near and far intersection points of a ray with a circle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayCircleHit {
    pub near: Option<Vec2>,
    pub far: Option<Vec2>,
}

/// A 2D ray for the shield raycasts.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vec2,
    dir: Vec2,
}

impl Ray {
    pub fn new(origin: Vec2, direction: f64) -> Self {
        Self {
            origin,
            dir: dir_vec(direction),
        }
    }

    pub fn from_vec(origin: Vec2, dir_vec: Vec2) -> Self {
        Self {
            origin,
            dir: dir_vec.normalized(),
        }
    }

    /// Intersects the ray with a circle; `None` when the supporting line
    /// misses or both hits lie behind the origin.
    pub fn hit_circle(&self, center: Vec2, radius: f64) -> Option<RayCircleHit> {
        let q = self.origin - center;
        let c2 = 2.0 * q.dot(self.dir);
        let c3 = q.dot(q) - radius * radius;
        let mut delta = c2 * c2 - 4.0 * c3;
        if tolerance_eq(delta, 0.0, 0.001) {
            delta = delta.abs();
        }
        if delta < 0.0 {
            return None;
        }
        if delta == 0.0 {
            let t = -c2 / 2.0;
            if t >= 0.0 {
                return Some(RayCircleHit {
                    near: Some(self.origin + self.dir * t),
                    far: None,
                });
            }
            return None;
        }
        let sqrt_delta = delta.sqrt();
        let t1 = (-c2 - sqrt_delta) / 2.0;
        let t2 = (-c2 + sqrt_delta) / 2.0;
        let near = (t1 >= 0.0).then(|| self.origin + self.dir * t1);
        let far = (t2 >= 0.0).then(|| self.origin + self.dir * t2);
        if near.is_none() && far.is_none() {
            return None;
        }
        Some(RayCircleHit { near, far })
    }
}

fn circle_triangle_side_hits(center: Vec2, radius: f64, a: Vec2, b: Vec2) -> bool {
    let side = b - a;
    let to_circle = center - a;
    let mut along = to_circle.dot(side);
    if along <= 0.0 {
        return false;
    }
    let side_sq = side.length_squared();
    along = along * along / side_sq;
    along < side_sq && to_circle.length_squared() - along <= radius * radius
}

/// Circle vs. triangle `a, b, c`: vertex inside the circle, center inside
/// the triangle, or circle crossing one of the sides.
pub fn circle_triangle_intersects(center: Vec2, radius: f64, a: Vec2, b: Vec2, c: Vec2) -> bool {
    let r_sq = radius * radius;
    if r_sq >= (a - center).length_squared()
        || r_sq >= (b - center).length_squared()
        || r_sq >= (c - center).length_squared()
    {
        return true;
    }

    let s_ab = point_line_sign(center, a, b);
    let s_bc = point_line_sign(center, b, c);
    let s_ca = point_line_sign(center, c, a);
    if (s_ab >= 0 && s_bc >= 0 && s_ca >= 0) || (s_ab <= 0 && s_bc <= 0 && s_ca <= 0) {
        return true;
    }

    circle_triangle_side_hits(center, radius, a, b)
        || circle_triangle_side_hits(center, radius, b, c)
        || circle_triangle_side_hits(center, radius, c, a)
}

/// Circle vs. the cap of a circular sector (center `segment_center`, radius
/// `segment_radius`, mid direction `segment_angle`, half-width
/// `segment_width`).
pub fn circle_segment_intersects(
    circle_center: Vec2,
    circle_radius: f64,
    segment_center: Vec2,
    segment_radius: f64,
    segment_angle: f64,
    segment_width: f64,
) -> bool {
    if circle_radius + segment_radius < (segment_center - circle_center).length() {
        return false;
    }

    let edge_distance = segment_width * 2.0;
    let center_angle = (circle_center - segment_center).angle();

    for edge in [segment_angle - segment_width, segment_angle + segment_width] {
        let mut distance = (edge - center_angle).abs();
        if distance > std::f64::consts::PI {
            distance = 2.0 * std::f64::consts::PI - distance;
        }
        if distance > edge_distance {
            return false;
        }
    }
    true
}

/// Tangent points on a circle from an external point, plus the angle between
/// the center line and either tangent.
pub fn circle_tangents(center: Vec2, radius: f64, point: Vec2) -> (Vec2, Vec2, f64) {
    let delta = center - point;
    let bisect = std::f64::consts::FRAC_PI_2 - (radius / delta.length()).acos();
    let center_angle = delta.angle();
    let internal = std::f64::consts::FRAC_PI_2 - bisect;
    let tg1 = center - dir_vec(center_angle - internal) * radius;
    let tg2 = center - dir_vec(center_angle + internal) * radius;
    (tg1, tg2, bisect)
}

/// Intersection points of two circles; the second point is `None` when the
/// circles are tangent.
pub fn circle_circle_intersection(
    center1: Vec2,
    radius1: f64,
    center2: Vec2,
    radius2: f64,
) -> Option<(Vec2, Option<Vec2>)> {
    let r_dist = (center1 - center2).length();
    let dist_sign = sign(r_dist - (radius1 + radius2));
    if dist_sign == 1 || r_dist + radius1 < radius2 || r_dist + radius2 < radius1 {
        return None;
    }
    let r1r2_sq = radius1 * radius1 - radius2 * radius2;
    let r_dist_sq = r_dist * r_dist;
    let c1 = r1r2_sq / (2.0 * r_dist_sq);
    let k1 = (center1 + center2) * 0.5 + (center2 - center1) * c1;
    if dist_sign == 0 || r_dist + radius1 == radius2 || r_dist + radius2 == radius1 {
        return Some((k1, None));
    }
    let c2 = 0.5
        * (2.0 * (radius1 * radius1 + radius2 * radius2) / r_dist_sq
            - (r1r2_sq * r1r2_sq) / (r_dist_sq * r_dist_sq)
            - 1.0)
            .sqrt();
    let k2 = Vec2::new(center2.y - center1.y, center1.x - center2.x) * c2;
    Some((k1 - k2, Some(k1 + k2)))
}

/// If `point` sits on the arc (within tolerance), the angle along the arc
/// relative to `arc_dir`.
pub fn point_on_arc(
    point: Vec2,
    arc_center: Vec2,
    arc_dir: f64,
    arc_width: f64,
    arc_radius: f64,
) -> Option<f64> {
    let dir = (point - arc_center) * (1.0 / arc_radius);
    if !tolerance_eq(dir.length(), 1.0, 0.001) {
        return None;
    }
    let on_arc = normalize_angle(dir.angle() - arc_dir);
    let edge_eq = |edge: f64| tolerance_eq(rad2deg(edge), rad2deg(on_arc), 0.000001);
    if (-arc_width <= on_arc && on_arc <= arc_width) || edge_eq(-arc_width) || edge_eq(arc_width) {
        Some(on_arc)
    } else {
        None
    }
}

/// Damage applied at `distance` by a shot of the given scaled energy and
/// half-width (radians). Falloff is exponential in width and square-root in
/// distance.
pub fn shot_damage(scaled_energy: f64, width: f64, distance: f64) -> f64 {
    let distance = distance.max(1.0);
    scaled_energy / ((2.0f64).powf(2.0 * width).max(1.0) * distance.sqrt())
}

/// Radius covered by a scan or shot of half-width `scan_width` (radians)
/// spending `energy_spent`.
pub fn scan_shoot_radius(scan_width: f64, energy_spent: f64) -> f64 {
    let area_scanned = energy_spent * SCAN_ENERGY_SCALING_FACTOR;
    (area_scanned / (2.0 * scan_width)).sqrt()
}

/// Energy drained per second by a shield of half-width `shield_width` on a
/// ship of the given area. Shielding half of yourself is energy-neutral;
/// a full shield lasts `area` seconds.
pub fn shield_energy_usage(shield_width: f64, area: f64) -> f64 {
    if shield_width == 0.0 {
        return 0.0;
    }
    let pi = std::f64::consts::PI;
    if shield_width * 2.0 <= pi {
        area * (shield_width * 2.0) / pi
    } else {
        area + 10.0 * (shield_width * 2.0 - pi) / pi
    }
}

/// True when the shot cone in `shot` can reach anything inside `quad`.
/// The quad is conservatively approximated by its circumscribed circle.
pub fn sector_reaches(
    quad: &Quad,
    origin: Vec2,
    direction: f64,
    width: f64,
    radius: f64,
) -> bool {
    let quad_center = Vec2::new(quad.center_x, quad.center_y);
    let max_quad_radius = std::f64::consts::SQRT_2 * quad.half_extent;
    let left = origin + dir_vec(direction + width) * radius;
    let right = origin + dir_vec(direction - width) * radius;

    circle_triangle_intersects(quad_center, max_quad_radius, origin, left, right)
        || circle_segment_intersects(quad_center, max_quad_radius, origin, radius, direction, width)
}

/// Fraction (0..=1) of the shot arc `[shot_start, shot_stop]` (angles seen
/// from the victim) covered by a shield of half-width `shield_width` facing
/// `shield_dir`.
pub fn shot_shield_intersection(
    shot_start: f64,
    shot_stop: f64,
    shield_dir: f64,
    shield_width: f64,
) -> f64 {
    let tau = 2.0 * std::f64::consts::PI;
    let mut shot_start = clamp_angle(shot_start);
    let mut shot_stop = clamp_angle(shot_stop);

    let (smaller, larger) = (shot_start.min(shot_stop), shot_start.max(shot_stop));
    if (shot_stop - shot_start).abs() > std::f64::consts::PI {
        shot_start = larger;
        shot_stop = smaller;
    } else {
        shot_start = smaller;
        shot_stop = larger;
    }

    let mut shield_start = clamp_angle(shield_dir - shield_width);
    let mut shield_stop = clamp_angle(shield_dir + shield_width);
    let dir = clamp_angle(shield_dir);
    let (smaller, larger) = (shield_start.min(shield_stop), shield_start.max(shield_stop));
    if smaller > dir || larger < dir {
        shield_start = larger;
        shield_stop = smaller;
    } else {
        shield_start = smaller;
        shield_stop = larger;
    }

    if shot_stop < shot_start {
        shot_stop += tau;
    }
    if shield_start < shot_start {
        shield_start += tau;
    }
    if shield_stop < shot_start {
        shield_stop += tau;
    }

    let mut angles = [shot_start, shot_stop, shield_start, shield_stop];
    angles.sort_by(|a, b| a.total_cmp(b));

    let shielded = if angles[1] == shot_stop {
        if angles[2] == shield_stop {
            shot_stop - shot_start
        } else {
            0.0
        }
    } else if angles[1] == shield_start {
        angles[2] - angles[1]
    } else {
        let mut d = angles[1] - angles[0];
        if angles[2] == shield_start {
            d += angles[3] - angles[2];
        }
        d
    };

    shielded / (shot_stop - shot_start)
}

/// Fraction (0..=1) of incoming shot damage absorbed by the target's shield.
///
/// The target is the circle at `ship_pos` with `ship_radius`; its shield
/// spans `shield_width` radians either side of `shield_dir`. The shot is the
/// cone from `shot_origin` with direction `shot_dir`, half-width `shot_width`
/// and length `shot_radius`.
#[allow(clippy::too_many_arguments)]
pub fn shielding_fraction(
    ship_pos: Vec2,
    ship_radius: f64,
    shield_dir: f64,
    shield_width: f64,
    shot_origin: Vec2,
    shot_dir: f64,
    shot_width: f64,
    shot_radius: f64,
) -> f64 {
    // Point-blank shots bypass the shield entirely.
    if (shot_origin - ship_pos).length() <= ship_radius {
        return 0.0;
    }
    if shield_width < 0.001 {
        return 0.0;
    }

    let shot_dir = normalize_angle(clamp_angle(shot_dir));

    let (tg1, tg2, tg_angle) = circle_tangents(ship_pos, ship_radius, shot_origin);

    let ship_center_angle = (ship_pos - shot_origin).angle();
    // Angle of the ship center in shot space.
    let cas2ss = normalize_angle(ship_center_angle - shot_dir);

    let (mut tg_left_ss, mut tg_right_ss) = (-tg_angle + cas2ss, tg_angle + cas2ss);
    let (mut tg_left, mut tg_right) = (tg1, tg2);
    if tg_left_ss > tg_right_ss {
        std::mem::swap(&mut tg_left_ss, &mut tg_right_ss);
        std::mem::swap(&mut tg_left, &mut tg_right);
    }

    // Where the circular cap of the shot clips the target, if it does.
    let mut left_cap_ss = f64::NEG_INFINITY;
    let mut right_cap_ss = f64::INFINITY;
    if let Some((hit_a, hit_b)) =
        circle_circle_intersection(shot_origin, shot_radius, ship_pos, ship_radius)
    {
        let mut cap_left = hit_a;
        let mut cap_right = hit_b.unwrap_or(hit_a);
        if (cap_right - tg_left).length() < (cap_left - tg_left).length() {
            std::mem::swap(&mut cap_left, &mut cap_right);
        }

        let left_cap_delta = cap_left - shot_origin;
        let right_cap_delta = cap_right - shot_origin;
        if left_cap_delta.length_squared() < (tg_left - shot_origin).length_squared() {
            left_cap_ss = left_cap_delta.angle() - shot_dir;
        }
        if right_cap_delta.length_squared() < (tg_right - shot_origin).length_squared() {
            right_cap_ss = right_cap_delta.angle() - shot_dir;
        }
    }

    tg_left_ss = normalize_angle(tg_left_ss);
    tg_right_ss = normalize_angle(tg_right_ss);
    if left_cap_ss.is_finite() {
        left_cap_ss = normalize_angle(left_cap_ss);
    }
    if right_cap_ss.is_finite() {
        right_cap_ss = normalize_angle(right_cap_ss);
    }

    let left_ray_ss = (-shot_width).max(tg_left_ss).max(left_cap_ss);
    let right_ray_ss = tg_right_ss.min(shot_width).min(right_cap_ss);

    let left_hit = Ray::new(shot_origin, shot_dir + left_ray_ss).hit_circle(ship_pos, ship_radius);
    let right_hit =
        Ray::new(shot_origin, shot_dir + right_ray_ss).hit_circle(ship_pos, ship_radius);

    // Degenerate geometry (boundary raycast misses): treat as unshielded.
    let (Some(left_hit), Some(right_hit)) = (left_hit, right_hit) else {
        return 0.0;
    };
    let (Some(left_near), Some(right_near)) = (left_hit.near, right_hit.near) else {
        return 0.0;
    };

    let left_victim = (left_near - ship_pos).angle();
    let right_victim = (right_near - ship_pos).angle();

    shot_shield_intersection(left_victim, right_victim, shield_dir, shield_width)
}
