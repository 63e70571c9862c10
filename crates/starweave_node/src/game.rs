//! The compute node's game state and bus protocol.
//!
//! A `GameNode` owns one [`QueryNodeKind::Local`] entry in its replica of
//! the partition tree, plus the graveyard of recently killed ships. The
//! arbiter is the only peer whose `NodeConfig` messages are believed;
//! everything else on the bus is either ship hand-off or scan/shoot
//! traffic between nodes.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use starweave_bus::messages::{
    Message, NodeConfig, NodeOffline, ScanShoot, ShipConnected, ShipDisconnected, Struck,
    TransferShip, TAG_STRUCK,
};
use starweave_bus::{BusError, BusNode, Delivery, PeerId, Spaceship};
use starweave_spatial::{NodePath, Quad, SpatialError};
use thiserror::Error;

use crate::persistence::ShipStore;
use crate::query::{
    self, fan_out_targets, LocalState, QueryNodeKind, QueryTree, RemoteState, ScanShootResults,
    SCAN_SHOOT_TIMEOUT,
};
use crate::ship::{GameClock, LocalShip};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Ship not found for given token.")]
    UnknownToken,
    #[error("Your spaceship has been killed. Please reconnect.")]
    ShipDead,
    #[error(transparent)]
    Spatial(#[from] SpatialError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// One compute node's view of the game.
pub struct GameNode {
    bus: Arc<BusNode>,
    arbiter: PeerId,
    tree: QueryTree,
    /// The replica entry this process owns.
    local_id: starweave_spatial::NodeId,
    /// Tokens of ships destroyed here; the next request with such a token
    /// gets the death notice, then the entry is dropped.
    dead_ships: HashMap<String, Spaceship>,
    store: Option<ShipStore>,
    clock: GameClock,
    api_url: String,
    advertised_bus: SocketAddr,
}

impl GameNode {
    /// Starts with the whole universe as local; the arbiter's first
    /// `NodeConfig` moves this node to its real place in the tree.
    pub fn new(
        bus: Arc<BusNode>,
        arbiter: PeerId,
        api_url: String,
        advertised_bus: SocketAddr,
        universe_half_extent: f64,
        store: Option<ShipStore>,
        clock: GameClock,
    ) -> Result<Self, NodeError> {
        let mut tree = QueryTree::new();
        let local_id = tree.insert_root(
            Quad::universe(universe_half_extent),
            QueryNodeKind::Local(LocalState::default()),
        )?;
        Ok(Self {
            bus,
            arbiter,
            tree,
            local_id,
            dead_ships: HashMap::new(),
            store,
            clock,
            api_url,
            advertised_bus,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn bounds(&self) -> Option<Quad> {
        self.tree.get(self.local_id).map(|n| n.bounds())
    }

    pub fn path(&self) -> Option<NodePath> {
        self.tree.path(self.local_id)
    }

    pub fn ship_count(&self) -> usize {
        self.local_state().map_or(0, |s| s.ships_by_token.len())
    }

    pub fn clock_mut(&mut self) -> &mut GameClock {
        &mut self.clock
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn local_state(&self) -> Option<&LocalState> {
        match self.tree.value(self.local_id) {
            Some(QueryNodeKind::Local(state)) => Some(state),
            _ => None,
        }
    }

    fn local_state_mut(&mut self) -> Option<&mut LocalState> {
        match self.tree.value_mut(self.local_id) {
            Some(QueryNodeKind::Local(state)) => Some(state),
            _ => None,
        }
    }

    /// Looks up a live local ship and brings it up to date.
    ///
    /// A token in the graveyard consumes its death notice; an unknown
    /// token is rejected.
    pub fn live_ship_mut(&mut self, token: &str) -> Result<&mut LocalShip, NodeError> {
        if self.dead_ships.remove(token).is_some() {
            return Err(NodeError::ShipDead);
        }
        let now = self.clock.now_ms();
        let ship = self
            .local_state_mut()
            .and_then(|s| s.ships_by_token.get_mut(token))
            .ok_or(NodeError::UnknownToken)?;
        ship.update_state(now);
        Ok(ship)
    }

    /// Inserts a ship arriving from elsewhere (transfer or test setup).
    pub fn adopt_ship(&mut self, ship: Spaceship) {
        let now = self.clock.now_ms();
        if let Some(state) = self.local_state_mut() {
            state
                .ships_by_token
                .insert(ship.token.clone(), LocalShip::restored(ship, now));
        }
    }

    /// This node's own placement announcement. Doubles as the heartbeat.
    pub fn own_config(&self) -> Option<NodeConfig> {
        let node = self.tree.get(self.local_id)?;
        Some(NodeConfig {
            bounds: node.bounds(),
            path: self.tree.path(self.local_id)?,
            bus_addr: self.advertised_bus,
            api_url: self.api_url.clone(),
        })
    }

    /// Announces this node to the arbiter.
    pub async fn announce(&self) -> Result<(), NodeError> {
        let Some(cfg) = self.own_config() else {
            return Err(NodeError::Spatial(SpatialError::UnknownNode(self.local_id)));
        };
        self.bus
            .send(self.arbiter, &Message::NodeConfig(cfg), Delivery::ReliableOrdered)
            .await?;
        Ok(())
    }

    /// Unreliable re-announcement; the arbiter reads it as a liveness
    /// signal once the node is known.
    pub async fn heartbeat(&self) {
        if let Some(cfg) = self.own_config() {
            if let Err(e) = self
                .bus
                .send(self.arbiter, &Message::NodeConfig(cfg), Delivery::Unreliable)
                .await
            {
                warn!(error = %e, "heartbeat send failed");
            }
        }
    }

    /// One simulation step: drain the bus, advance every ship, and hand
    /// off ships that drifted out of our region.
    pub async fn tick(&mut self) {
        for (peer, msg) in self.bus.poll() {
            self.handle_message(peer, msg).await;
        }
        let now = self.clock.now_ms();
        if let Some(state) = self.local_state_mut() {
            for ship in state.ships_by_token.values_mut() {
                ship.update_state(now);
            }
        }
        self.garbage_collect().await;
    }

    pub async fn handle_message(&mut self, from: PeerId, msg: Message) {
        match msg {
            Message::NodeConfig(cfg) => self.on_node_config(from, cfg),
            Message::NodeOffline(offline) => self.on_node_offline(offline),
            Message::ShipConnected(m) => self.on_ship_connected(m).await,
            Message::ShipDisconnected(m) => self.on_ship_disconnected(m).await,
            Message::ShipTransferred(m) => {
                info!(token = %m.ship.token, "ship transferred in");
                self.adopt_ship(m.ship);
            }
            Message::ScanShoot(m) => self.on_scan_shoot(from, m).await,
            Message::Struck(_) => {
                // A reply that outlived its waiter.
                debug!(%from, "late scan/shoot reply, ignoring");
            }
            other => {
                debug!(%from, tag = other.tag(), "unexpected bus message");
            }
        }
    }

    /// Patches the replica from an arbiter placement announcement.
    fn on_node_config(&mut self, from: PeerId, cfg: NodeConfig) {
        if from != self.arbiter {
            debug!(%from, "ignoring placement not from the arbiter");
            return;
        }
        let target = match self
            .tree
            .ensure_path(&cfg.path, |_, _| QueryNodeKind::Unknown)
        {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, path = %cfg.path, "cannot apply placement");
                return;
            }
        };
        if cfg.api_url == self.api_url {
            if target != self.local_id {
                info!(path = %cfg.path, "this node moved in the partition tree");
                self.relocate_local(target);
            }
            return;
        }
        if target == self.local_id {
            // Stale announcement for our old slot; our own follows.
            warn!(api_url = %cfg.api_url, "placement collides with our slot, ignoring");
            return;
        }
        let peer = self.bus.connect(cfg.bus_addr);
        if let Some(value) = self.tree.value_mut(target) {
            debug!(api_url = %cfg.api_url, path = %cfg.path, "peer placed in the tree");
            *value = QueryNodeKind::Remote(RemoteState {
                peer,
                api_url: cfg.api_url,
            });
        }
    }

    /// Moves the local state (ships included) to a new replica entry.
    fn relocate_local(&mut self, target: starweave_spatial::NodeId) {
        let state = match self.tree.value_mut(self.local_id) {
            Some(value) if matches!(value, QueryNodeKind::Local(_)) => {
                match std::mem::replace(value, QueryNodeKind::Unknown) {
                    QueryNodeKind::Local(state) => state,
                    _ => LocalState::default(),
                }
            }
            _ => LocalState::default(),
        };
        if let Some(value) = self.tree.value_mut(target) {
            *value = QueryNodeKind::Local(state);
            self.local_id = target;
        }
    }

    /// Drops the routing entry for a departed node.
    fn on_node_offline(&mut self, msg: NodeOffline) {
        let by_path = self.tree.node_at_path(&msg.path).filter(|id| {
            matches!(
                self.tree.value(*id),
                Some(QueryNodeKind::Remote(r)) if r.api_url == msg.api_url
            )
        });
        // The path may already belong to the substitute; fall back to
        // searching for the departed node's url.
        let id = by_path.or_else(|| {
            self.tree.root().and_then(|root| {
                self.tree.iter(root).find(|id| {
                    matches!(
                        self.tree.value(*id),
                        Some(QueryNodeKind::Remote(r)) if r.api_url == msg.api_url
                    )
                })
            })
        });
        let Some(id) = id else { return };
        if id == self.local_id {
            return;
        }
        info!(api_url = %msg.api_url, "dropping departed node");
        let is_removable_leaf = self
            .tree
            .get(id)
            .map(|n| n.is_leaf() && n.parent().is_some())
            .unwrap_or(false);
        if is_removable_leaf {
            let _ = self.tree.remove(id);
        } else if let Some(value) = self.tree.value_mut(id) {
            *value = QueryNodeKind::Unknown;
        }
    }

    /// Creates (or restores) a ship for a connecting player and confirms
    /// the hand-over to the arbiter.
    async fn on_ship_connected(&mut self, msg: ShipConnected) {
        let ship = match &self.store {
            Some(store) => match store.get_ship(&msg.token) {
                Ok(Some(stored)) => {
                    info!(token = %msg.token, "restored ship from the document store");
                    stored
                }
                Ok(None) => Spaceship::new(&msg.token),
                Err(e) => {
                    warn!(error = %e, "store lookup failed, starting fresh");
                    Spaceship::new(&msg.token)
                }
            },
            None => Spaceship::new(&msg.token),
        };
        info!(token = %msg.token, "ship connected");
        self.adopt_ship(ship);
        if let Err(e) = self
            .bus
            .send(self.arbiter, &Message::ShipConnected(msg), Delivery::Reliable)
            .await
        {
            warn!(error = %e, "failed to confirm ship connection");
        }
    }

    async fn on_ship_disconnected(&mut self, msg: ShipDisconnected) {
        let removed = self
            .local_state_mut()
            .map(|s| s.ships_by_token.remove(&msg.token).is_some())
            .unwrap_or(false);
        let removed = removed || self.dead_ships.remove(&msg.token).is_some();
        if !removed {
            debug!(token = %msg.token, "disconnect for a ship we do not hold");
            return;
        }
        info!(token = %msg.token, "ship disconnected");
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_ship(&msg.token) {
                warn!(error = %e, "failed to delete ship document");
            }
        }
        if let Err(e) = self
            .bus
            .send(
                self.arbiter,
                &Message::ShipDisconnected(msg),
                Delivery::Reliable,
            )
            .await
        {
            warn!(error = %e, "failed to confirm ship disconnection");
        }
    }

    /// Answers another node's scan/shoot with our local partial.
    async fn on_scan_shoot(&mut self, from: PeerId, msg: ScanShoot) {
        let now = self.clock.now_ms();
        let originator = msg.originator.clone();
        let struck = match self.local_state_mut() {
            Some(state) => {
                let (results, destroyed) = query::strike(state, &msg, now);
                for dead in destroyed {
                    self.bury(dead);
                }
                results.struck
            }
            None => Vec::new(),
        };
        let reply = Message::Struck(Struck {
            originator,
            ships_info: struck,
        });
        if let Err(e) = self.bus.send(from, &reply, Delivery::Unreliable).await {
            warn!(error = %e, %from, "failed to answer scan/shoot");
        }
    }

    fn bury(&mut self, ship: Spaceship) {
        info!(id = %ship.public_id(), "ship destroyed");
        self.dead_ships.insert(ship.token.clone(), ship);
    }

    /// Runs one scan/shoot as the originating node: walk the replica,
    /// strike locally, query each reachable peer once, and merge whatever
    /// answers before the timeout.
    pub async fn scan_shoot(&mut self, msg: ScanShoot) -> ScanShootResults {
        let targets = fan_out_targets(&self.tree, self.local_id, &msg);
        let mut strike_here = false;
        let mut queried = HashSet::new();
        let mut remote_peers = Vec::new();
        for id in targets {
            match self.tree.value(id) {
                Some(QueryNodeKind::Local(_)) => strike_here = true,
                Some(QueryNodeKind::Remote(remote)) => {
                    if queried.insert(remote.peer) {
                        remote_peers.push(remote.peer);
                    }
                }
                _ => {}
            }
        }

        let mut results = ScanShootResults::default();
        if strike_here {
            let now = self.clock.now_ms();
            if let Some(state) = self.local_state_mut() {
                let (local, destroyed) = query::strike(state, &msg, now);
                results.merge(local);
                for dead in destroyed {
                    self.bury(dead);
                }
            }
        }

        // Waiters go in before the requests so replies cannot race them.
        let waiters: Vec<_> = remote_peers
            .iter()
            .map(|peer| {
                let originator = msg.originator.clone();
                self.bus.wait_for(
                    *peer,
                    TAG_STRUCK,
                    move |m| matches!(m, Message::Struck(s) if s.originator == originator),
                    SCAN_SHOOT_TIMEOUT,
                )
            })
            .collect();
        let wire = Message::ScanShoot(msg);
        for peer in &remote_peers {
            if let Err(e) = self.bus.send(*peer, &wire, Delivery::Unreliable).await {
                warn!(error = %e, peer = %peer, "failed to query peer");
            }
        }
        for reply in futures::future::join_all(waiters).await {
            match reply {
                Ok(Message::Struck(struck)) => {
                    results.merge(ScanShootResults::from_struck(struck.ships_info));
                }
                Ok(_) => {}
                Err(_) => debug!("peer did not answer in time, counting it empty"),
            }
        }
        results
    }

    /// Hands off every ship that drifted outside our region, targeting
    /// the best-fit node we know of (the arbiter has the final say).
    pub async fn garbage_collect(&mut self) {
        let Some(bounds) = self.bounds() else { return };
        let strays: Vec<String> = self
            .local_state()
            .map(|s| {
                s.ships_by_token
                    .values()
                    .filter(|ship| !bounds.contains_point(ship.ship.pos.x, ship.ship.pos.y))
                    .map(|ship| ship.ship.token.clone())
                    .collect()
            })
            .unwrap_or_default();
        for token in strays {
            self.hand_off(&token).await;
        }
    }

    /// Hands off every ship we hold, drifted or not. Used on shutdown so
    /// nothing is stranded.
    pub async fn garbage_collect_all(&mut self) {
        let tokens: Vec<String> = self
            .local_state()
            .map(|s| s.ships_by_token.keys().cloned().collect())
            .unwrap_or_default();
        for token in tokens {
            self.hand_off(&token).await;
        }
    }

    async fn hand_off(&mut self, token: &str) {
        let Some(local) = self
            .local_state_mut()
            .and_then(|s| s.ships_by_token.remove(token))
        else {
            return;
        };
        let ship = local.ship;
        let path = self.best_fit_path(&ship);
        info!(token = %token, pos = ?ship.pos, path = %path, "handing off ship");
        if let Some(store) = &self.store {
            if let Err(e) = store.put_ship(&ship) {
                warn!(error = %e, "failed to persist ship before hand-off");
            }
        }
        let msg = Message::TransferShip(TransferShip { ship, path });
        if let Err(e) = self.bus.send(self.arbiter, &msg, Delivery::Reliable).await {
            warn!(error = %e, "failed to send ship hand-off");
        }
    }

    /// The deepest replica node containing the ship, falling back to our
    /// parent (and then the root) when nothing contains it.
    fn best_fit_path(&self, ship: &Spaceship) -> NodePath {
        let best = self
            .tree
            .root()
            .and_then(|root| self.tree.smallest_containing(root, &ship.bounds()))
            .and_then(|id| self.tree.path(id));
        let parent = || {
            self.tree
                .get(self.local_id)
                .and_then(|n| n.parent())
                .and_then(|p| self.tree.path(p))
        };
        best.or_else(parent).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starweave_spatial::geom::{deg2rad, Vec2};
    use starweave_spatial::Quadrant;
    use tokio::time::Duration;

    const UNIVERSE: f64 = 1024.0;

    struct Fake {
        bus: Arc<BusNode>,
    }

    impl Fake {
        async fn new() -> Self {
            let bus = Arc::new(BusNode::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
            Self { bus }
        }

        fn addr(&self) -> SocketAddr {
            self.bus.local_addr().unwrap()
        }

        async fn recv(&self) -> (PeerId, Message) {
            for _ in 0..300 {
                if let Some(item) = self.bus.poll().into_iter().next() {
                    return item;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("no bus message arrived in time");
        }
    }

    async fn node_with_arbiter(arbiter: &Fake) -> GameNode {
        let bus = Arc::new(BusNode::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let addr = bus.local_addr().unwrap();
        let arbiter_peer = bus.connect(arbiter.addr());
        GameNode::new(
            bus,
            arbiter_peer,
            format!("http://127.0.0.1:{}/", addr.port()),
            addr,
            UNIVERSE,
            None,
            GameClock::manual(),
        )
        .unwrap()
    }

    fn placement(quadrants: &[Quadrant], api_url: &str, port: u16) -> NodeConfig {
        let path = NodePath::from_quadrants(quadrants.to_vec()).unwrap();
        let mut bounds = Quad::universe(UNIVERSE);
        for q in quadrants {
            bounds = bounds.quadrant(*q);
        }
        NodeConfig {
            bounds,
            path,
            bus_addr: format!("127.0.0.1:{port}").parse().unwrap(),
            api_url: api_url.into(),
        }
    }

    #[tokio::test]
    async fn a_connected_ship_appears_at_the_origin_and_is_acked() {
        let arbiter = Fake::new().await;
        let mut node = node_with_arbiter(&arbiter).await;

        node.handle_message(
            node.arbiter,
            Message::ShipConnected(ShipConnected {
                token: "fresh-token".into(),
            }),
        )
        .await;

        assert_eq!(node.ship_count(), 1);
        let ship = node.live_ship_mut("fresh-token").unwrap();
        assert_eq!(ship.ship.pos, Vec2::ZERO);
        assert_eq!(ship.ship.energy, 10.0);

        let (_, ack) = arbiter.recv().await;
        assert_eq!(
            ack,
            Message::ShipConnected(ShipConnected {
                token: "fresh-token".into()
            })
        );
    }

    #[tokio::test]
    async fn placement_moves_this_node_and_registers_peers() {
        let arbiter = Fake::new().await;
        let mut node = node_with_arbiter(&arbiter).await;
        node.adopt_ship(Spaceship::new("survivor"));

        let own = placement(&[Quadrant::Ne], node.api_url(), 0);
        let own_api = node.api_url().to_string();
        node.handle_message(node.arbiter, Message::NodeConfig(own)).await;

        assert_eq!(
            node.bounds().unwrap(),
            Quad::universe(UNIVERSE).quadrant(Quadrant::Ne)
        );
        assert_eq!(node.api_url(), own_api);
        // The ships moved with us.
        assert_eq!(node.ship_count(), 1);

        let other = placement(&[Quadrant::Sw], "http://10.0.0.9:8001/", 4000);
        node.handle_message(node.arbiter, Message::NodeConfig(other)).await;
        assert_eq!(node.ship_count(), 1);

        // Placements from strangers are ignored.
        let stranger = PeerId("127.0.0.1:1".parse().unwrap());
        let bogus = placement(&[Quadrant::Se], "http://evil:1/", 4001);
        node.handle_message(stranger, Message::NodeConfig(bogus)).await;
        assert!(node
            .tree
            .node_at_path(&NodePath::from_quadrants(vec![Quadrant::Se]).unwrap())
            .is_none());
    }

    #[tokio::test]
    async fn scan_shoot_merges_a_remote_partial() {
        let arbiter = Fake::new().await;
        let remote = Fake::new().await;
        let mut node = node_with_arbiter(&arbiter).await;

        // We live in NE; the remote owns SW.
        let own = placement(&[Quadrant::Ne], node.api_url(), 0);
        node.handle_message(node.arbiter, Message::NodeConfig(own)).await;
        let far = placement(
            &[Quadrant::Sw],
            "http://127.0.0.1:9999/",
            remote.addr().port(),
        );
        node.handle_message(node.arbiter, Message::NodeConfig(far)).await;

        node.adopt_ship(Spaceship::new("shooter-token"));
        let mut nearby = Spaceship::new("nearby-token");
        nearby.pos = Vec2::new(-30.0, 10.0);
        node.adopt_ship(nearby);

        // The remote answers with one ship of its own.
        let remote_bus = remote.bus.clone();
        tokio::spawn(async move {
            for _ in 0..300 {
                for (from, msg) in remote_bus.poll() {
                    if let Message::ScanShoot(scan) = msg {
                        let reply = Message::Struck(Struck {
                            originator: scan.originator,
                            ships_info: vec![starweave_bus::messages::StruckShip {
                                ship: Spaceship::new("far-away-token"),
                                area_gain: 0.0,
                            }],
                        });
                        remote_bus.send(from, &reply, Delivery::Unreliable).await.unwrap();
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let results = node
            .scan_shoot(ScanShoot {
                originator: "shooter-token".into(),
                origin: Vec2::new(10.0, 10.0),
                direction: deg2rad(180.0),
                width: deg2rad(45.0),
                radius: 4000.0,
                scaled_energy: 0.0,
            })
            .await;

        let ids: Vec<&str> = results.struck.iter().map(|s| s.ship.token.as_str()).collect();
        assert!(ids.contains(&"far-away-token"));
        assert!(ids.contains(&"nearby-token"));
        // The local partial excluded the originator.
        assert!(!ids.contains(&"shooter-token"));
    }

    #[tokio::test]
    async fn stray_ships_are_handed_off_to_the_arbiter() {
        let arbiter = Fake::new().await;
        let mut node = node_with_arbiter(&arbiter).await;

        let own = placement(&[Quadrant::Ne], node.api_url(), 0);
        node.handle_message(node.arbiter, Message::NodeConfig(own)).await;

        let mut stray = Spaceship::new("stray-token");
        stray.pos = Vec2::new(-100.0, -100.0);
        node.adopt_ship(stray);
        let mut resident = Spaceship::new("resident-token");
        resident.pos = Vec2::new(512.0, 512.0);
        node.adopt_ship(resident);

        node.garbage_collect().await;

        assert_eq!(node.ship_count(), 1);
        let (_, msg) = arbiter.recv().await;
        match msg {
            Message::TransferShip(transfer) => {
                assert_eq!(transfer.ship.token, "stray-token");
                // Only the root of our replica contains (-100, -100).
                assert_eq!(transfer.path, NodePath::root());
            }
            other => panic!("expected a hand-off, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_killed_token_reports_death_exactly_once() {
        let arbiter = Fake::new().await;
        let mut node = node_with_arbiter(&arbiter).await;
        let shooter = Fake::new().await;

        let mut victim = Spaceship::new("victim-token");
        victim.pos = Vec2::new(10.0, 0.0);
        node.adopt_ship(victim);

        let shot = ScanShoot {
            originator: "someone-else".into(),
            origin: Vec2::ZERO,
            direction: 0.0,
            width: deg2rad(10.0),
            radius: 100.0,
            scaled_energy: 1000.0,
        };
        node.handle_message(PeerId(shooter.addr()), Message::ScanShoot(shot))
            .await;

        let (_, reply) = shooter.recv().await;
        match reply {
            Message::Struck(struck) => {
                assert_eq!(struck.ships_info.len(), 1);
                assert!(struck.ships_info[0].area_gain < 0.0);
            }
            other => panic!("expected a struck reply, got {other:?}"),
        }

        assert!(matches!(
            node.live_ship_mut("victim-token"),
            Err(NodeError::ShipDead)
        ));
        assert!(matches!(
            node.live_ship_mut("victim-token"),
            Err(NodeError::UnknownToken)
        ));
    }
}
