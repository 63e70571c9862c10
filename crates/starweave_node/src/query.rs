//! The cross-node scan/shoot query engine.
//!
//! Every node keeps a replica of the whole partition tree. Exactly one
//! entry is [`QueryNodeKind::Local`] and owns the ships simulated here;
//! the rest are [`QueryNodeKind::Remote`] routing stubs or placeholders
//! for regions nobody has announced yet.
//!
//! A scan or shot walks the replica once, gathering every node whose
//! region the cone can touch. The walk recurses both downward (children)
//! and sideways (siblings), so an explicit visited set keeps the mutual
//! recursion from revisiting a node; remote peers are deduplicated on top
//! of that so each peer is queried at most once per operation.

use std::collections::HashSet;

use starweave_bus::messages::{ScanShoot, StruckShip};
use starweave_bus::{PeerId, Spaceship};
use starweave_spatial::geom::{
    circle_segment_intersects, circle_triangle_intersects, dir_vec, sector_reaches, shielding_fraction,
    shot_damage,
};
use starweave_spatial::{NodeId, PartitionTree, Quadrant};
use tokio::time::Duration;

use crate::ship::{LocalShip, MIN_SHIP_AREA};

/// How long to wait for a remote node's reply before counting it empty.
pub const SCAN_SHOOT_TIMEOUT: Duration = Duration::from_secs(5);

/// A region owned by another process, reachable over the bus.
#[derive(Debug, Clone)]
pub struct RemoteState {
    pub peer: PeerId,
    pub api_url: String,
}

/// The ships simulated by this process.
#[derive(Debug, Default)]
pub struct LocalState {
    pub ships_by_token: std::collections::HashMap<String, LocalShip>,
}

/// What a replica entry stands for.
#[derive(Debug)]
pub enum QueryNodeKind {
    Local(LocalState),
    Remote(RemoteState),
    /// An interior region no announcement has claimed yet.
    Unknown,
}

pub type QueryTree = PartitionTree<QueryNodeKind>;

/// Accumulated outcome of one scan/shoot across any number of nodes.
///
/// `area_gain` is the total area the originator is owed for fatal hits in
/// this partial. Merging is associative and commutative, so partials can
/// arrive in any order.
#[derive(Debug, Default, Clone)]
pub struct ScanShootResults {
    pub struck: Vec<StruckShip>,
    pub area_gain: f64,
}

impl ScanShootResults {
    pub fn merge(&mut self, other: ScanShootResults) {
        self.struck.extend(other.struck);
        self.area_gain += other.area_gain;
    }

    /// Rebuilds a partial from a remote reply, recovering the gain owed
    /// for its fatal hits.
    pub fn from_struck(struck: Vec<StruckShip>) -> Self {
        let area_gain = struck
            .iter()
            .filter(|s| s.area_gain < 0.0)
            .map(|s| s.area_gain.abs())
            .sum();
        Self { struck, area_gain }
    }
}

/// Every node in the replica whose region the cone can reach, starting
/// the walk at `start`.
pub fn fan_out_targets(tree: &QueryTree, start: NodeId, msg: &ScanShoot) -> Vec<NodeId> {
    let mut visited = HashSet::new();
    let mut hits = Vec::new();
    visit(tree, start, msg, &mut visited, &mut hits);
    hits
}

fn visit(
    tree: &QueryTree,
    id: NodeId,
    msg: &ScanShoot,
    visited: &mut HashSet<NodeId>,
    hits: &mut Vec<NodeId>,
) {
    if !visited.insert(id) {
        return;
    }
    let Some(node) = tree.get(id) else { return };
    let reachable = sector_reaches(&node.bounds(), msg.origin, msg.direction, msg.width, msg.radius);
    if reachable {
        hits.push(id);
    }
    // Siblings are always entered; their own reachability gates whether
    // they land in `hits` or descend further.
    if let Some(parent) = node.parent() {
        if let Some(p) = tree.get(parent) {
            for q in Quadrant::ALL {
                if let Some(sibling) = p.child(q) {
                    if sibling != id {
                        visit(tree, sibling, msg, visited, hits);
                    }
                }
            }
        }
    }
    if reachable {
        for q in Quadrant::ALL {
            if let Some(child) = node.child(q) {
                visit(tree, child, msg, visited, hits);
            }
        }
    }
}

/// True when the shot cone touches the ship's bounding circle.
pub fn cone_hits_ship(msg: &ScanShoot, ship: &Spaceship) -> bool {
    let left = msg.origin + dir_vec(msg.direction + msg.width) * msg.radius;
    let right = msg.origin + dir_vec(msg.direction - msg.width) * msg.radius;
    circle_triangle_intersects(ship.pos, ship.radius(), msg.origin, left, right)
        || circle_segment_intersects(ship.pos, ship.radius(), msg.origin, msg.radius, msg.direction, msg.width)
}

/// Applies one scan/shoot to the local ships.
///
/// Ships in the cone are reported; when the message carries shot energy
/// they also take damage, reduced by whatever fraction their shield
/// covers. A fatal hit removes the ship from the state and reports a
/// negative `area_gain` worth the victim's kill reward; the returned
/// second element holds the destroyed ships for the graveyard.
pub fn strike(
    state: &mut LocalState,
    msg: &ScanShoot,
    now_ms: u64,
) -> (ScanShootResults, Vec<Spaceship>) {
    let mut results = ScanShootResults::default();
    let mut fatalities = Vec::new();

    for (token, local) in state.ships_by_token.iter_mut() {
        if *token == msg.originator {
            continue;
        }
        local.update_state(now_ms);
        if !cone_hits_ship(msg, &local.ship) {
            continue;
        }
        if msg.scaled_energy <= 0.0 {
            results.struck.push(StruckShip {
                ship: local.ship.clone(),
                area_gain: 0.0,
            });
            continue;
        }
        let distance = (local.ship.pos - msg.origin).length();
        let pre_hit_area = local.ship.area;
        let raw = shot_damage(msg.scaled_energy, msg.width, distance);
        let shielded = shielding_fraction(
            local.ship.pos,
            local.ship.radius(),
            local.ship.shield_dir,
            local.ship.shield_width,
            msg.origin,
            msg.direction,
            msg.width,
            msg.radius,
        );
        local.ship.area -= raw * (1.0 - shielded);
        if local.is_dead() {
            let mut snapshot = local.ship.clone();
            snapshot.area = 0.0;
            results.struck.push(StruckShip {
                ship: snapshot,
                area_gain: -local.ship.kill_reward,
            });
            results.area_gain += local.ship.kill_reward;
            fatalities.push(token.clone());
        } else {
            // Being hit is a combat action too; the victim's reward tracks
            // its pre-hit area.
            local.note_combat_at(now_ms, pre_hit_area);
            results.struck.push(StruckShip {
                ship: local.ship.clone(),
                area_gain: 0.0,
            });
        }
    }

    let mut destroyed = Vec::new();
    for token in fatalities {
        if let Some(dead) = state.ships_by_token.remove(&token) {
            destroyed.push(dead.ship);
        }
    }
    (results, destroyed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use starweave_spatial::geom::{deg2rad, Vec2};
    use starweave_spatial::Quad;

    fn universe() -> Quad {
        Quad::universe(1024.0)
    }

    fn scan_msg(origin: Vec2, direction: f64, width: f64, radius: f64) -> ScanShoot {
        ScanShoot {
            originator: "originator".into(),
            origin,
            direction,
            width,
            radius,
            scaled_energy: 0.0,
        }
    }

    fn partial(gains: &[f64]) -> ScanShootResults {
        ScanShootResults {
            struck: gains
                .iter()
                .map(|g| StruckShip {
                    ship: Spaceship::new("x"),
                    area_gain: *g,
                })
                .collect(),
            area_gain: gains.iter().filter(|g| **g < 0.0).map(|g| g.abs()).sum(),
        }
    }

    #[test]
    fn merge_is_commutative_and_associative() {
        let a = partial(&[0.0, -1.5]);
        let b = partial(&[-2.0]);
        let c = partial(&[0.0]);

        let mut ab_c = a.clone();
        ab_c.merge(b.clone());
        ab_c.merge(c.clone());

        let mut a_bc = b.clone();
        a_bc.merge(c);
        a_bc.merge(a);

        assert!((ab_c.area_gain - a_bc.area_gain).abs() < 1e-12);
        assert_eq!(ab_c.struck.len(), a_bc.struck.len());
        assert!((ab_c.area_gain - 3.5).abs() < 1e-12);
    }

    #[test]
    fn from_struck_recovers_the_gain_owed() {
        let rebuilt = ScanShootResults::from_struck(partial(&[0.0, -2.5, -1.0]).struck);
        assert!((rebuilt.area_gain - 3.5).abs() < 1e-12);
    }

    #[test]
    fn a_universe_wide_cone_visits_every_node_once() {
        let mut tree = QueryTree::new();
        let root = tree.insert_root(universe(), QueryNodeKind::Unknown).unwrap();
        let ne = tree.attach_child(root, Quadrant::Ne, QueryNodeKind::Unknown).unwrap();
        tree.attach_child(root, Quadrant::Sw, QueryNodeKind::Unknown).unwrap();
        tree.attach_child(ne, Quadrant::Nw, QueryNodeKind::Unknown).unwrap();

        let msg = scan_msg(Vec2::ZERO, 0.0, deg2rad(89.0), 1_000_000.0);
        let hits = fan_out_targets(&tree, ne, &msg);
        assert_eq!(hits.len(), tree.len());
        let unique: HashSet<_> = hits.iter().copied().collect();
        assert_eq!(unique.len(), hits.len());
    }

    #[test]
    fn a_tight_cone_skips_far_quadrants() {
        let mut tree = QueryTree::new();
        let root = tree.insert_root(universe(), QueryNodeKind::Unknown).unwrap();
        let ne = tree.attach_child(root, Quadrant::Ne, QueryNodeKind::Unknown).unwrap();
        let sw = tree.attach_child(root, Quadrant::Sw, QueryNodeKind::Unknown).unwrap();

        // A short shot deep inside the NE quadrant.
        let msg = scan_msg(Vec2::new(512.0, 512.0), 0.0, deg2rad(10.0), 10.0);
        let hits = fan_out_targets(&tree, ne, &msg);
        assert!(hits.contains(&ne));
        assert!(!hits.contains(&sw));
    }

    fn shot_at(target: Vec2, scaled_energy: f64) -> ScanShoot {
        ScanShoot {
            originator: "shooter".into(),
            origin: Vec2::ZERO,
            direction: target.angle(),
            width: deg2rad(10.0),
            radius: 100.0,
            scaled_energy,
        }
    }

    #[test]
    fn a_plain_scan_reports_without_damaging() {
        let mut state = LocalState::default();
        let mut victim = LocalShip::new("victim", 0);
        victim.ship.pos = Vec2::new(10.0, 0.0);
        state.ships_by_token.insert("victim".into(), victim);

        let (results, destroyed) = strike(&mut state, &shot_at(Vec2::new(10.0, 0.0), 0.0), 0);
        assert_eq!(results.struck.len(), 1);
        assert_eq!(results.struck[0].area_gain, 0.0);
        assert_eq!(results.area_gain, 0.0);
        assert!(destroyed.is_empty());
        assert_eq!(state.ships_by_token["victim"].ship.area, 1.0);
    }

    #[test]
    fn the_originator_never_strikes_itself() {
        let mut state = LocalState::default();
        state
            .ships_by_token
            .insert("shooter".into(), LocalShip::new("shooter", 0));

        let (results, _) = strike(&mut state, &shot_at(Vec2::new(1.0, 0.0), 100.0), 0);
        assert!(results.struck.is_empty());
        assert!(state.ships_by_token.contains_key("shooter"));
    }

    #[test]
    fn a_fatal_hit_moves_the_ship_out_exactly_once() {
        let mut state = LocalState::default();
        let mut victim = LocalShip::new("victim", 0);
        victim.ship.pos = Vec2::new(10.0, 0.0);
        victim.ship.kill_reward = 2.0;
        state.ships_by_token.insert("victim".into(), victim);

        let msg = shot_at(Vec2::new(10.0, 0.0), 1000.0);
        let (results, destroyed) = strike(&mut state, &msg, 0);
        assert_eq!(destroyed.len(), 1);
        assert_eq!(destroyed[0].token, "victim");
        assert_eq!(results.struck.len(), 1);
        assert_eq!(results.struck[0].area_gain, -2.0);
        assert_eq!(results.struck[0].ship.area, 0.0);
        assert!((results.area_gain - 2.0).abs() < 1e-12);
        assert!(!state.ships_by_token.contains_key("victim"));

        // A second identical shot finds nothing to hit.
        let (again, destroyed) = strike(&mut state, &msg, 0);
        assert!(again.struck.is_empty());
        assert!(destroyed.is_empty());
    }

    #[test]
    fn a_surviving_victim_gets_a_combat_stamp_at_its_pre_hit_area() {
        let mut state = LocalState::default();
        let mut victim = LocalShip::new("victim", 0);
        victim.ship.pos = Vec2::new(10.0, 0.0);
        victim.ship.area = 5.0;
        assert_eq!(victim.ship.kill_reward, 1.0);
        state.ships_by_token.insert("victim".into(), victim);

        // Weak shot, long after the victim's last combat.
        let (results, destroyed) = strike(&mut state, &shot_at(Vec2::new(10.0, 0.0), 0.8), 100_000);
        assert!(destroyed.is_empty());
        assert_eq!(results.struck.len(), 1);

        let victim = &state.ships_by_token["victim"];
        assert!(victim.ship.area < 5.0);
        assert_eq!(victim.ship.kill_reward, 5.0);
    }

    #[test]
    fn a_facing_shield_softens_the_blow() {
        let mut open = LocalState::default();
        let mut victim = LocalShip::new("victim", 0);
        victim.ship.pos = Vec2::new(10.0, 0.0);
        open.ships_by_token.insert("victim".into(), victim.clone());

        let mut shielded = LocalState::default();
        // Shield facing the shooter at the origin.
        victim.ship.set_shield_dir(std::f64::consts::PI);
        victim.ship.shield_width = deg2rad(60.0);
        shielded.ships_by_token.insert("victim".into(), victim);

        // Weak enough that the unshielded victim survives.
        let msg = shot_at(Vec2::new(10.0, 0.0), 0.8);
        strike(&mut open, &msg, 0);
        strike(&mut shielded, &msg, 0);

        let open_area = open.ships_by_token["victim"].ship.area;
        let shielded_area = shielded.ships_by_token["victim"].ship.area;
        assert!(open_area < 1.0);
        assert!(shielded_area > open_area);
    }
}
