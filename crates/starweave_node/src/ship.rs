//! Per-ship simulation state.
//!
//! A [`LocalShip`] wraps the wire-level [`Spaceship`] with the state only
//! the owning node tracks: velocity and the timestamps driving energy
//! regeneration and the kill-reward cooldown. All timekeeping goes through
//! a [`GameClock`] so tests can step time by hand.

use starweave_bus::Spaceship;
use starweave_spatial::geom::{shield_energy_usage, Vec2};
use tokio::time::Instant;

/// Ships below this area are destroyed.
pub const MIN_SHIP_AREA: f64 = 0.75;

/// After this long without a combat action, the next one re-pins the
/// kill reward to the ship's current area.
pub const COMBAT_COOLDOWN_MS: u64 = 60_000;

/// Energy capacity is this multiple of the ship's area.
const ENERGY_CAP_PER_AREA: f64 = 10.0;

/// Millisecond game time, either real or test-driven.
#[derive(Debug)]
pub enum GameClock {
    Monotonic { start: Instant },
    Manual { now_ms: u64 },
}

impl GameClock {
    pub fn monotonic() -> Self {
        GameClock::Monotonic {
            start: Instant::now(),
        }
    }

    /// A clock frozen at zero until [`GameClock::set_manual`] moves it.
    pub fn manual() -> Self {
        GameClock::Manual { now_ms: 0 }
    }

    pub fn now_ms(&self) -> u64 {
        match self {
            GameClock::Monotonic { start } => start.elapsed().as_millis() as u64,
            GameClock::Manual { now_ms } => *now_ms,
        }
    }

    /// Moves a manual clock; has no effect on a monotonic one.
    pub fn set_manual(&mut self, ms: u64) {
        debug_assert!(matches!(self, GameClock::Manual { .. }));
        if let GameClock::Manual { now_ms } = self {
            *now_ms = ms;
        }
    }
}

/// A spaceship owned by this node, with simulation state.
#[derive(Debug, Clone)]
pub struct LocalShip {
    pub ship: Spaceship,
    pub velocity: Vec2,
    last_update_ms: u64,
    last_combat_ms: u64,
}

impl LocalShip {
    /// A brand new ship for a freshly connected player.
    pub fn new(token: impl Into<String>, now_ms: u64) -> Self {
        Self::restored(Spaceship::new(token), now_ms)
    }

    /// Wraps a ship arriving from the wire or the document store. The
    /// velocity is not carried across nodes and restarts at zero.
    pub fn restored(ship: Spaceship, now_ms: u64) -> Self {
        Self {
            ship,
            velocity: Vec2::ZERO,
            last_update_ms: now_ms,
            last_combat_ms: now_ms,
        }
    }

    /// Advances position and energy to `now_ms`.
    ///
    /// Energy regenerates at `area` per second, minus the shield drain,
    /// clamped to `[0, 10 * area]`.
    pub fn update_state(&mut self, now_ms: u64) {
        let dt = now_ms.saturating_sub(self.last_update_ms) as f64 / 1000.0;
        self.last_update_ms = now_ms;
        if dt <= 0.0 {
            return;
        }
        self.ship.pos = self.ship.pos + self.velocity * dt;
        let regen = self.ship.area - shield_energy_usage(self.ship.shield_width, self.ship.area);
        self.ship.energy =
            (self.ship.energy + regen * dt).clamp(0.0, ENERGY_CAP_PER_AREA * self.ship.area);
    }

    /// Applies an acceleration request, spending whole units of energy.
    ///
    /// The energy required is `ceil(area * (|x| + |y|))`; if less is
    /// available the thrust is scaled down proportionally.
    pub fn accelerate(&mut self, x: f64, y: f64) {
        if x == 0.0 && y == 0.0 {
            return;
        }
        let required = (self.ship.area * (x.abs() + y.abs())).ceil();
        let spent = required.min(self.ship.energy.floor());
        if required <= 0.0 || spent <= 0.0 {
            return;
        }
        self.ship.energy -= spent;
        self.velocity = self.velocity + Vec2::new(x, y) * (spent / required);
    }

    /// Records a combat action. Outside the cooldown window the kill
    /// reward is re-pinned to the ship's current area; inside it the
    /// reward can only grow.
    pub fn note_combat(&mut self, now_ms: u64) {
        self.note_combat_at(now_ms, self.ship.area);
    }

    /// [`note_combat`](Self::note_combat) with an explicit area, for hits
    /// where the reward tracks the victim's pre-hit area.
    pub fn note_combat_at(&mut self, now_ms: u64, area: f64) {
        if now_ms.saturating_sub(self.last_combat_ms) > COMBAT_COOLDOWN_MS {
            self.ship.kill_reward = area;
        } else {
            self.ship.kill_reward = self.ship.kill_reward.max(area);
        }
        self.last_combat_ms = now_ms;
    }

    pub fn is_dead(&self) -> bool {
        self.ship.area < MIN_SHIP_AREA
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ship_starts_at_the_origin_with_full_energy() {
        let ship = LocalShip::new("token", 0);
        assert_eq!(ship.ship.pos, Vec2::ZERO);
        assert_eq!(ship.ship.energy, 10.0);
        assert_eq!(ship.ship.area, 1.0);
        assert_eq!(ship.velocity, Vec2::ZERO);
        assert!(!ship.is_dead());
    }

    #[test]
    fn accelerate_spends_whole_energy_units() {
        let mut ship = LocalShip::new("t", 0);
        ship.accelerate(1.0, 0.0);
        // area 1, |x|+|y| = 1 -> 1 unit required, 1 available.
        assert_eq!(ship.ship.energy, 9.0);
        assert_eq!(ship.velocity, Vec2::new(1.0, 0.0));
    }

    #[test]
    fn accelerate_scales_thrust_when_energy_runs_short() {
        let mut ship = LocalShip::new("t", 0);
        // Requires 20 units; only 10 are there, so half the thrust applies.
        ship.accelerate(20.0, 0.0);
        assert_eq!(ship.ship.energy, 0.0);
        assert_eq!(ship.velocity, Vec2::new(10.0, 0.0));
    }

    #[test]
    fn accelerate_with_fractional_energy_does_nothing() {
        let mut ship = LocalShip::new("t", 0);
        ship.ship.energy = 0.5;
        ship.accelerate(3.0, 4.0);
        assert_eq!(ship.ship.energy, 0.5);
        assert_eq!(ship.velocity, Vec2::ZERO);
    }

    #[test]
    fn update_state_integrates_velocity_and_regenerates_energy() {
        let mut ship = LocalShip::new("t", 0);
        ship.ship.energy = 2.0;
        ship.velocity = Vec2::new(2.0, -1.0);
        ship.update_state(3000);
        assert_eq!(ship.ship.pos, Vec2::new(6.0, -3.0));
        // area 1 regenerates 1/s; 2 + 3 = 5.
        assert!((ship.ship.energy - 5.0).abs() < 1e-9);
    }

    #[test]
    fn energy_caps_at_ten_times_area() {
        let mut ship = LocalShip::new("t", 0);
        ship.ship.area = 2.0;
        ship.ship.energy = 19.5;
        ship.update_state(60_000);
        assert_eq!(ship.ship.energy, 20.0);
    }

    #[test]
    fn a_full_shield_drains_instead_of_regenerating() {
        let mut ship = LocalShip::new("t", 0);
        ship.ship.shield_width = std::f64::consts::PI;
        ship.ship.energy = 10.0;
        ship.update_state(1000);
        // Full shield on area 1 drains 11/s against 1/s regen.
        assert!(ship.ship.energy < 1.0);
    }

    #[test]
    fn kill_reward_repins_after_the_cooldown() {
        let mut ship = LocalShip::new("t", 0);
        ship.ship.area = 4.0;
        ship.note_combat(COMBAT_COOLDOWN_MS + 1);
        assert_eq!(ship.ship.kill_reward, 4.0);

        // Shrinking mid-streak does not lower the reward.
        ship.ship.area = 2.0;
        ship.note_combat(COMBAT_COOLDOWN_MS + 5_000);
        assert_eq!(ship.ship.kill_reward, 4.0);

        // After the window lapses the next action re-pins, down included.
        ship.note_combat(2 * COMBAT_COOLDOWN_MS + 10_000);
        assert_eq!(ship.ship.kill_reward, 2.0);
    }

    #[test]
    fn kill_reward_grows_with_area_inside_the_window() {
        let mut ship = LocalShip::new("t", 0);
        ship.note_combat(0);
        assert_eq!(ship.ship.kill_reward, 1.0);

        ship.ship.area = 5.0;
        ship.note_combat(30_000);
        assert_eq!(ship.ship.kill_reward, 5.0);
    }

    #[test]
    fn manual_clock_steps_on_demand() {
        let mut clock = GameClock::manual();
        assert_eq!(clock.now_ms(), 0);
        clock.set_manual(1234);
        assert_eq!(clock.now_ms(), 1234);
    }
}
