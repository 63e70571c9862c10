//! The arbiter process state and its bus protocol.
//!
//! Joins, departures, and ship lifecycle all funnel through [`Arbiter`],
//! which owns the routing table exclusively. The embedding transport and
//! the tick task share it behind one coarse lock; every await inside is
//! bounded by a timeout, so holding the lock across a call cannot wedge
//! the process.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use starweave_bus::messages::{
    NodeConfig, NodeOffline, ShipConnected, ShipDisconnected, ShipTransferred, TransferShip,
    TAG_SHIP_CONNECTED,
};
use starweave_bus::{BusError, BusNode, Delivery, Message, PeerId};
use starweave_spatial::{NodeId, SpatialError};

use crate::routing::{ComputeNode, RoutingTable};

/// How long a ship hand-off waits for the receiving node's acknowledgment.
const SHIP_ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("No ship with token: {0}")]
    UnknownToken(String),
    #[error("no compute nodes available")]
    NoNodes,
    #[error("ship connect was not acknowledged in time")]
    ConnectUnacked,
    #[error(transparent)]
    Spatial(#[from] SpatialError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// The coordinating process: partition tree, ship routing, membership.
pub struct Arbiter {
    routing: RoutingTable,
    bus: Arc<BusNode>,
    peer_timeout: Duration,
    rng: StdRng,
}

impl Arbiter {
    pub fn new(bus: Arc<BusNode>, universe_half_extent: f64, peer_timeout: Duration) -> Self {
        Self {
            routing: RoutingTable::new(universe_half_extent),
            bus,
            peer_timeout,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// One scheduler tick: drain the bus, then recover from silent peers.
    pub async fn tick(&mut self) {
        for (peer, msg) in self.bus.poll() {
            self.handle_message(peer, msg).await;
        }
        for peer in self.bus.silent_peers(self.peer_timeout) {
            info!(%peer, "peer silent past the timeout, recovering");
            match self.remove_compute_node(peer).await {
                Ok(true) => {}
                Ok(false) => self.bus.forget_peer(peer),
                Err(e) => warn!(%peer, error = %e, "node departure recovery failed"),
            }
        }
    }

    pub async fn handle_message(&mut self, peer: PeerId, msg: Message) {
        match msg {
            Message::NodeConfig(cfg) => self.on_node_config(peer, cfg).await,
            Message::TransferShip(m) => self.on_transfer_ship(peer, m).await,
            Message::ShipDisconnected(m) => {
                if self.routing.remove_ship(&m.token).is_some() {
                    debug!(token = %m.token, "ship disconnected by its node");
                }
            }
            // A ShipConnected that no waiter claimed is a late acknowledgment.
            Message::ShipConnected(m) => debug!(token = %m.token, "late ship acknowledgment"),
            other => debug!(%peer, tag = other.tag(), "ignoring unexpected message"),
        }
    }

    /// A `NodeConfig` from an unknown peer is a join request; from a known
    /// peer it is a heartbeat (the bus already refreshed its last-seen time).
    async fn on_node_config(&mut self, peer: PeerId, cfg: NodeConfig) {
        if self.routing.node_by_peer(peer).is_some() {
            return;
        }
        let node = ComputeNode {
            peer,
            bus_addr: cfg.bus_addr,
            api_url: cfg.api_url,
        };
        self.bus.connect(peer.0);
        match self.routing.add_compute_node(node, &mut self.rng) {
            Ok(id) => {
                info!(
                    %peer,
                    path = %self.routing.path(id).unwrap_or_default(),
                    nodes = self.routing.node_count(),
                    "compute node joined"
                );
                if let Err(e) = self.announce_join(id, peer).await {
                    warn!(%peer, error = %e, "failed to announce join");
                }
            }
            Err(e) => warn!(%peer, error = %e, "could not place compute node"),
        }
    }

    /// Broadcasts the newcomer's authoritative config to everyone, then
    /// sends the newcomer the config of every other node. All of it ordered,
    /// so the topology converges before anything that depends on it.
    async fn announce_join(&self, id: NodeId, peer: PeerId) -> Result<(), ArbiterError> {
        let cfg = self.node_config(id).ok_or(SpatialError::UnknownNode(id))?;
        self.bus
            .broadcast(&cfg, Delivery::ReliableOrdered, None)
            .await?;

        let Some(root) = self.routing.tree().root() else {
            return Ok(());
        };
        let others: Vec<Message> = self
            .routing
            .tree()
            .iter(root)
            .filter(|other| *other != id)
            .filter_map(|other| self.node_config(other))
            .collect();
        for other_cfg in others {
            self.bus
                .send(peer, &other_cfg, Delivery::ReliableOrdered)
                .await?;
        }
        Ok(())
    }

    /// A ship drifted out of its node's bounds. Route it to the path the
    /// sender proposed, falling back to the smallest node containing the
    /// ship, then to a random leaf.
    async fn on_transfer_ship(&mut self, from: PeerId, m: TransferShip) {
        let target = self
            .routing
            .node_at_path(&m.path)
            .or_else(|| {
                let root = self.routing.tree().root()?;
                self.routing.tree().smallest_containing(root, &m.ship.bounds())
            })
            .or_else(|| {
                let root = self.routing.tree().root()?;
                self.routing.tree().random_leaf(root, &mut self.rng)
            });
        let Some(target) = target else {
            warn!(token = %m.ship.token, "no node left to re-home ship");
            return;
        };
        let Some(target_peer) = self.routing.node(target).map(|n| n.peer) else {
            return;
        };
        self.routing.assign_ship(&m.ship.token, target);
        debug!(token = %m.ship.token, from = %from, to = %target_peer, "ship transferred");
        let out = Message::ShipTransferred(ShipTransferred { ship: m.ship });
        if let Err(e) = self.bus.send(target_peer, &out, Delivery::Reliable).await {
            warn!(to = %target_peer, error = %e, "ship transfer send failed");
        }
    }

    /// Connects a new ship: allocate a token, place it on a random leaf,
    /// and wait for that node to acknowledge before handing the token out.
    pub async fn connect_ship(&mut self) -> Result<String, ArbiterError> {
        let (token, owner) = self
            .routing
            .add_new_ship(&mut self.rng)
            .ok_or(ArbiterError::NoNodes)?;
        let Some(peer) = self.routing.node(owner).map(|n| n.peer) else {
            self.routing.remove_ship(&token);
            return Err(ArbiterError::NoNodes);
        };

        let expected = token.clone();
        let ack = self.bus.wait_for(
            peer,
            TAG_SHIP_CONNECTED,
            move |m| matches!(m, Message::ShipConnected(c) if c.token == expected),
            SHIP_ACK_TIMEOUT,
        );
        let msg = Message::ShipConnected(ShipConnected {
            token: token.clone(),
        });
        self.bus.send(peer, &msg, Delivery::ReliableOrdered).await?;

        if ack.await.is_err() {
            self.routing.remove_ship(&token);
            return Err(ArbiterError::ConnectUnacked);
        }
        info!(owner = %peer, "ship connected");
        Ok(token)
    }

    pub async fn disconnect_ship(&mut self, token: &str) -> Result<(), ArbiterError> {
        let owner = self
            .routing
            .remove_ship(token)
            .ok_or_else(|| ArbiterError::UnknownToken(token.to_string()))?;
        if let Some(peer) = self.routing.node(owner).map(|n| n.peer) {
            let msg = Message::ShipDisconnected(ShipDisconnected {
                token: token.to_string(),
            });
            self.bus.send(peer, &msg, Delivery::Reliable).await?;
        }
        Ok(())
    }

    /// The API endpoint of the node owning `token`, with the route appended,
    /// for redirect-style forwarding.
    pub fn forward_url(&self, token: &str, route: &str) -> Result<String, ArbiterError> {
        let owner = self
            .routing
            .owner_of(token)
            .ok_or_else(|| ArbiterError::UnknownToken(token.to_string()))?;
        let node = self
            .routing
            .node(owner)
            .ok_or_else(|| ArbiterError::UnknownToken(token.to_string()))?;
        Ok(format!("{}{}", node.api_url, route))
    }

    /// Recovers from a compute node going away. Returns `false` when the
    /// peer was not in the tree, so duplicate notifications are harmless.
    pub async fn remove_compute_node(&mut self, peer: PeerId) -> Result<bool, ArbiterError> {
        let Some(plan) = self.routing.plan_removal(peer, &mut self.rng) else {
            return Ok(false);
        };

        // Re-home every ship the departed node owned onto the substitute,
        // waiting for each acknowledgment so the ownership map never points
        // at a node that has not seen the ship. A node that misses the
        // deadline still becomes the owner; it restores the ship from the
        // store when traffic for it arrives.
        if let Some(sub) = plan.substitute {
            if let Some(sub_peer) = self.routing.node(sub).map(|n| n.peer) {
                for token in &plan.tokens {
                    let expected = token.clone();
                    let ack = self.bus.wait_for(
                        sub_peer,
                        TAG_SHIP_CONNECTED,
                        move |m| matches!(m, Message::ShipConnected(c) if c.token == expected),
                        SHIP_ACK_TIMEOUT,
                    );
                    let msg = Message::ShipConnected(ShipConnected {
                        token: token.clone(),
                    });
                    self.bus
                        .send(sub_peer, &msg, Delivery::ReliableOrdered)
                        .await?;
                    if ack.await.is_err() {
                        warn!(token = %token, to = %sub_peer, "ship re-home not acknowledged");
                    }
                }
            }
        }

        self.routing.apply_removal(&plan, &mut self.rng)?;
        self.bus.forget_peer(plan.departed_peer);
        info!(
            peer = %plan.departed_peer,
            path = %plan.departed_path,
            nodes = self.routing.node_count(),
            "compute node removed"
        );

        // Topology notices go out reliable and ordered so every peer sees
        // the departure before the substitute's new position.
        let offline = Message::NodeOffline(NodeOffline {
            path: plan.departed_path.clone(),
            api_url: plan.departed_api_url.clone(),
        });
        self.bus
            .broadcast(&offline, Delivery::ReliableOrdered, None)
            .await?;
        if let Some(sub) = plan.substitute {
            if let Some(cfg) = self.node_config(sub) {
                self.bus
                    .broadcast(&cfg, Delivery::ReliableOrdered, None)
                    .await?;
            }
        }
        Ok(true)
    }

    fn node_config(&self, id: NodeId) -> Option<Message> {
        let node = self.routing.node(id)?;
        let tree_node = self.routing.tree().get(id)?;
        Some(Message::NodeConfig(NodeConfig {
            bounds: tree_node.bounds(),
            path: self.routing.path(id)?,
            bus_addr: node.bus_addr,
            api_url: node.api_url.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starweave_spatial::Quad;
    use std::net::SocketAddr;

    const UNIVERSE: f64 = 1024.0;

    async fn arbiter() -> (Arc<BusNode>, Arbiter, SocketAddr) {
        let bus = Arc::new(BusNode::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let addr = bus.local_addr().unwrap();
        let arb = Arbiter::new(bus.clone(), UNIVERSE, Duration::from_secs(30));
        (bus, arb, addr)
    }

    async fn fake_node(arbiter_addr: SocketAddr) -> (BusNode, PeerId) {
        let bus = BusNode::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let arb_peer = bus.connect(arbiter_addr);
        (bus, arb_peer)
    }

    fn join_msg(bus: &BusNode) -> Message {
        let addr = bus.local_addr().unwrap();
        Message::NodeConfig(NodeConfig {
            bounds: Quad::universe(1.0),
            path: Default::default(),
            bus_addr: addr,
            api_url: format!("http://{}/", addr),
        })
    }

    async fn recv_msg(bus: &BusNode) -> (PeerId, Message) {
        for _ in 0..300 {
            if let Some(item) = bus.poll().into_iter().next() {
                return item;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no message arrived in time");
    }

    async fn pump_until(arb: &mut Arbiter, nodes: usize) {
        for _ in 0..300 {
            arb.tick().await;
            if arb.routing().node_count() == nodes {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("arbiter never reached {nodes} nodes");
    }

    /// Echoes every ShipConnected back to the sender, acting as a
    /// cooperative compute node.
    fn spawn_echo(bus: BusNode) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                for (from, msg) in bus.poll() {
                    if let Message::ShipConnected(_) = &msg {
                        let _ = bus.send(from, &msg, Delivery::Reliable).await;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    #[tokio::test]
    async fn second_join_broadcasts_a_path_of_length_one() {
        let (_bus, mut arb, addr) = arbiter().await;
        let (n1, arb_from_n1) = fake_node(addr).await;
        n1.send(arb_from_n1, &join_msg(&n1), Delivery::Reliable)
            .await
            .unwrap();
        pump_until(&mut arb, 1).await;

        // The first node hears its own (root) placement.
        let (_, msg) = recv_msg(&n1).await;
        match msg {
            Message::NodeConfig(cfg) => {
                assert_eq!(cfg.path.len(), 0);
                assert_eq!(cfg.bounds, Quad::universe(UNIVERSE));
            }
            other => panic!("expected NodeConfig, got {other:?}"),
        }

        let (n2, arb_from_n2) = fake_node(addr).await;
        n2.send(arb_from_n2, &join_msg(&n2), Delivery::Reliable)
            .await
            .unwrap();
        pump_until(&mut arb, 2).await;

        let (_, msg) = recv_msg(&n1).await;
        match msg {
            Message::NodeConfig(cfg) => assert_eq!(cfg.path.len(), 1),
            other => panic!("expected NodeConfig, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_produces_a_36_char_token_once_acknowledged() {
        let (_bus, mut arb, addr) = arbiter().await;
        assert!(matches!(
            arb.connect_ship().await,
            Err(ArbiterError::NoNodes)
        ));

        let (n1, arb_from_n1) = fake_node(addr).await;
        n1.send(arb_from_n1, &join_msg(&n1), Delivery::Reliable)
            .await
            .unwrap();
        pump_until(&mut arb, 1).await;
        let echo = spawn_echo(n1);

        let token = arb.connect_ship().await.unwrap();
        assert_eq!(token.len(), 36);
        assert!(arb.routing().owner_of(&token).is_some());

        arb.disconnect_ship(&token).await.unwrap();
        assert!(arb.routing().owner_of(&token).is_none());
        assert!(matches!(
            arb.disconnect_ship(&token).await,
            Err(ArbiterError::UnknownToken(_))
        ));
        echo.abort();
    }

    #[tokio::test]
    async fn forward_url_points_at_the_owning_node() {
        let (_bus, mut arb, addr) = arbiter().await;
        let (n1, arb_from_n1) = fake_node(addr).await;
        n1.send(arb_from_n1, &join_msg(&n1), Delivery::Reliable)
            .await
            .unwrap();
        pump_until(&mut arb, 1).await;
        let echo = spawn_echo(n1);

        let token = arb.connect_ship().await.unwrap();
        let url = arb.forward_url(&token, "accelerate").unwrap();
        assert!(url.ends_with("/accelerate"));
        assert!(matches!(
            arb.forward_url("no-such-token", "scan"),
            Err(ArbiterError::UnknownToken(_))
        ));
        echo.abort();
    }

    #[tokio::test]
    async fn root_departure_rehomes_ships_onto_the_substitute() {
        let (_bus, mut arb, addr) = arbiter().await;
        let (n1, arb_from_n1) = fake_node(addr).await;
        n1.send(arb_from_n1, &join_msg(&n1), Delivery::Reliable)
            .await
            .unwrap();
        pump_until(&mut arb, 1).await;
        let echo1 = spawn_echo(n1);

        let token = arb.connect_ship().await.unwrap();
        let root_owner = arb.routing().owner_of(&token).unwrap();

        let (n2, arb_from_n2) = fake_node(addr).await;
        let n2_bus_addr = n2.local_addr().unwrap();
        n2.send(arb_from_n2, &join_msg(&n2), Delivery::Reliable)
            .await
            .unwrap();
        pump_until(&mut arb, 2).await;
        let echo2 = spawn_echo(n2);

        let root_peer = arb.routing().node(root_owner).unwrap().peer;
        assert!(arb.remove_compute_node(root_peer).await.unwrap());
        assert_eq!(arb.routing().node_count(), 1);

        let new_owner = arb.routing().owner_of(&token).unwrap();
        let new_node = arb.routing().node(new_owner).unwrap();
        assert_eq!(new_node.peer.0, n2_bus_addr);
        assert_eq!(
            arb.routing().tree().get(new_owner).unwrap().bounds(),
            Quad::universe(UNIVERSE)
        );

        // A second notification for the same peer is a no-op.
        assert!(!arb.remove_compute_node(root_peer).await.unwrap());
        echo1.abort();
        echo2.abort();
    }
}
