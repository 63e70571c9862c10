//! The publicly known state of a spaceship, as it travels on the wire and
//! in the persistence store.

use serde::{Deserialize, Serialize};

use starweave_spatial::geom::{clamp_angle, normalize_angle, Vec2};
use starweave_spatial::Quad;

use crate::wire::{WireError, WireReader, WireWriter};

/// How many trailing token characters form the public id.
pub const PUBLIC_ID_LEN: usize = 8;

/// A spaceship as other nodes (and the document store) see it.
///
/// Wire field order is fixed: token, energy, area, pos.x, pos.y, shield_dir,
/// shield_width, kill_reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spaceship {
    /// Private key of the ship. Holders of the token control the ship.
    pub token: String,
    pub energy: f64,
    pub area: f64,
    pub pos: Vec2,
    /// Center direction of the shield, radians; kept in `-pi..pi`.
    pub shield_dir: f64,
    /// Shield half-width, radians.
    pub shield_width: f64,
    /// Area credited to whoever destroys this ship.
    pub kill_reward: f64,
}

impl Spaceship {
    /// A freshly connected ship: unit area, full energy, at the origin.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            energy: 10.0,
            area: 1.0,
            pos: Vec2::ZERO,
            shield_dir: 0.0,
            shield_width: 0.0,
            kill_reward: 1.0,
        }
    }

    /// Last characters of the token; safe to show to other players.
    pub fn public_id(&self) -> &str {
        let start = self.token.len().saturating_sub(PUBLIC_ID_LEN);
        &self.token[start..]
    }

    pub fn radius(&self) -> f64 {
        (self.area / std::f64::consts::PI).sqrt()
    }

    pub fn bounds(&self) -> Quad {
        Quad::new(self.pos.x, self.pos.y, self.radius())
    }

    /// Sets the shield direction, folding it into `-pi..pi`.
    pub fn set_shield_dir(&mut self, dir: f64) {
        self.shield_dir = normalize_angle(clamp_angle(dir));
    }

    pub fn encode(&self, w: &mut WireWriter) {
        w.put_str(&self.token);
        w.put_f64(self.energy);
        w.put_f64(self.area);
        w.put_f64(self.pos.x);
        w.put_f64(self.pos.y);
        w.put_f64(self.shield_dir);
        w.put_f64(self.shield_width);
        w.put_f64(self.kill_reward);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            token: r.str()?,
            energy: r.f64()?,
            area: r.f64()?,
            pos: Vec2::new(r.f64()?, r.f64()?),
            shield_dir: r.f64()?,
            shield_width: r.f64()?,
            kill_reward: r.f64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ship_defaults() {
        let ship = Spaceship::new("0123456789abcdef");
        assert_eq!(ship.area, 1.0);
        assert_eq!(ship.energy, 10.0);
        assert_eq!(ship.pos, Vec2::ZERO);
        assert_eq!(ship.kill_reward, 1.0);
        assert_eq!(ship.public_id(), "89abcdef");
    }

    #[test]
    fn wire_round_trip_short_token() {
        let ship = Spaceship {
            token: "abc-123".into(),
            energy: 12.3,
            area: 5.0,
            pos: Vec2::new(1.5, -2.25),
            shield_dir: 1.0,
            shield_width: 0.5,
            kill_reward: 5.0,
        };
        let mut w = WireWriter::new();
        ship.encode(&mut w);
        let bytes = w.into_bytes();
        let back = Spaceship::decode(&mut WireReader::new(&bytes)).unwrap();
        assert_eq!(back, ship);
        // Public ids of short tokens are the whole token.
        assert_eq!(back.public_id(), "abc-123");
    }

    #[test]
    fn wire_round_trip_preserves_every_field() {
        let mut ship = Spaceship::new("ffffffff-ffff-ffff-ffff-ffffffffffff");
        ship.energy = 7.25;
        ship.area = 3.5;
        ship.pos = Vec2::new(-120.75, 4096.5);
        ship.shield_width = 0.5;
        ship.set_shield_dir(1.25);
        ship.kill_reward = 3.25;

        let mut w = WireWriter::new();
        ship.encode(&mut w);
        let bytes = w.into_bytes();
        let back = Spaceship::decode(&mut WireReader::new(&bytes)).unwrap();
        assert_eq!(back, ship);
    }

    #[test]
    fn shield_dir_folds_into_signed_range() {
        let mut ship = Spaceship::new("t");
        ship.set_shield_dir(1.5 * std::f64::consts::PI);
        assert!((ship.shield_dir + 0.5 * std::f64::consts::PI).abs() < 1e-12);
        ship.set_shield_dir(-0.25);
        assert!((ship.shield_dir + 0.25).abs() < 1e-12);
    }

    #[test]
    fn radius_follows_area() {
        let mut ship = Spaceship::new("t");
        ship.area = std::f64::consts::PI;
        assert!((ship.radius() - 1.0).abs() < 1e-12);
    }
}
