//! Axis-aligned square regions and their four-way subdivision.
//!
//! A [`Quad`] is stored as a center plus a half extent rather than min/max
//! corners, which keeps subdivision exact: a child's half extent is the
//! parent's halved, and the child center is offset by the new half extent
//! along each axis.

use serde::{Deserialize, Serialize};

/// One of the four subdivision quadrants of a [`Quad`].
///
/// The numeric values are part of the wire format (packed paths encode two
/// bits per quadrant) and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Quadrant {
    Ne = 0,
    Nw = 1,
    Se = 2,
    Sw = 3,
}

impl Quadrant {
    /// All quadrants in wire order.
    pub const ALL: [Quadrant; 4] = [Quadrant::Ne, Quadrant::Nw, Quadrant::Se, Quadrant::Sw];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: u8) -> Option<Quadrant> {
        match i {
            0 => Some(Quadrant::Ne),
            1 => Some(Quadrant::Nw),
            2 => Some(Quadrant::Se),
            3 => Some(Quadrant::Sw),
            _ => None,
        }
    }

    /// Unit sign offsets of this quadrant's center relative to the parent.
    fn signs(self) -> (f64, f64) {
        match self {
            Quadrant::Ne => (1.0, 1.0),
            Quadrant::Nw => (-1.0, 1.0),
            Quadrant::Se => (1.0, -1.0),
            Quadrant::Sw => (-1.0, -1.0),
        }
    }
}

impl std::fmt::Display for Quadrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Quadrant::Ne => "NE",
            Quadrant::Nw => "NW",
            Quadrant::Se => "SE",
            Quadrant::Sw => "SW",
        };
        write!(f, "{s}")
    }
}

/// An axis-aligned square region of the universe.
///
/// Invariant: `half_extent > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quad {
    pub center_x: f64,
    pub center_y: f64,
    pub half_extent: f64,
}

impl Quad {
    pub fn new(center_x: f64, center_y: f64, half_extent: f64) -> Self {
        debug_assert!(half_extent > 0.0, "quad half extent must be positive");
        Self {
            center_x,
            center_y,
            half_extent,
        }
    }

    /// The full-universe quad centered on the origin.
    pub fn universe(half_extent: f64) -> Self {
        Self::new(0.0, 0.0, half_extent)
    }

    pub fn min_x(&self) -> f64 {
        self.center_x - self.half_extent
    }

    pub fn max_x(&self) -> f64 {
        self.center_x + self.half_extent
    }

    pub fn min_y(&self) -> f64 {
        self.center_y - self.half_extent
    }

    pub fn max_y(&self) -> f64 {
        self.center_y + self.half_extent
    }

    /// True when `other` lies entirely within this quad (boundary included).
    pub fn contains(&self, other: &Quad) -> bool {
        self.min_x() <= other.min_x()
            && self.max_x() >= other.max_x()
            && self.min_y() <= other.min_y()
            && self.max_y() >= other.max_y()
    }

    /// True when the two quads overlap (boundary contact counts).
    pub fn intersects(&self, other: &Quad) -> bool {
        (self.center_x - other.center_x).abs() <= self.half_extent + other.half_extent
            && (self.center_y - other.center_y).abs() <= self.half_extent + other.half_extent
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        (x - self.center_x).abs() <= self.half_extent
            && (y - self.center_y).abs() <= self.half_extent
    }

    /// The sub-quad covering the given quadrant.
    pub fn quadrant(&self, q: Quadrant) -> Quad {
        let h = self.half_extent / 2.0;
        let (sx, sy) = q.signs();
        Quad::new(self.center_x + sx * h, self.center_y + sy * h, h)
    }
}

impl std::fmt::Display for Quad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[({}, {}) ± {}]",
            self.center_x, self.center_y, self.half_extent
        )
    }
}
