//! The authoritative routing table.
//!
//! One [`PartitionTree`] node per connected compute node, plus the
//! token-to-owner map and the set of public id suffixes in use. Node leave
//! recovery is split into a pure planning step ([`RoutingTable::plan_removal`])
//! and an applying step ([`RoutingTable::apply_removal`]); the bus traffic
//! that must happen between the two (per-ship re-homing acknowledgments,
//! topology notices) lives in the [`crate::arbiter`] module.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use rand::Rng;
use uuid::Uuid;

use starweave_bus::ship::PUBLIC_ID_LEN;
use starweave_bus::PeerId;
use starweave_spatial::{NodeId, NodePath, PartitionTree, Quad, Quadrant, SpatialError};

/// One connected compute node as the arbiter sees it.
#[derive(Debug, Clone)]
pub struct ComputeNode {
    pub peer: PeerId,
    pub bus_addr: SocketAddr,
    pub api_url: String,
}

/// What a departure will do, computed before any of it happens.
#[derive(Debug)]
pub struct RemovalPlan {
    pub departed: NodeId,
    pub departed_peer: PeerId,
    pub departed_path: NodePath,
    pub departed_api_url: String,
    /// The node taking over the departed node's region and ships. `None`
    /// means the departed node was a lone root and the tree empties.
    pub substitute: Option<NodeId>,
    /// Tokens of every ship the departed node owned.
    pub tokens: Vec<String>,
}

/// Tree of compute nodes plus the ship ownership map.
pub struct RoutingTable {
    tree: PartitionTree<ComputeNode>,
    ship_owner: HashMap<String, NodeId>,
    used_public_ids: HashSet<String>,
    universe_half_extent: f64,
}

fn public_id(token: &str) -> &str {
    let start = token.len().saturating_sub(PUBLIC_ID_LEN);
    &token[start..]
}

impl RoutingTable {
    pub fn new(universe_half_extent: f64) -> Self {
        Self {
            tree: PartitionTree::new(),
            ship_owner: HashMap::new(),
            used_public_ids: HashSet::new(),
            universe_half_extent,
        }
    }

    pub fn universe(&self) -> Quad {
        Quad::universe(self.universe_half_extent)
    }

    pub fn tree(&self) -> &PartitionTree<ComputeNode> {
        &self.tree
    }

    pub fn node_count(&self) -> usize {
        self.tree.len()
    }

    pub fn ship_count(&self) -> usize {
        self.ship_owner.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&ComputeNode> {
        self.tree.value(id)
    }

    pub fn path(&self, id: NodeId) -> Option<NodePath> {
        self.tree.path(id)
    }

    pub fn node_at_path(&self, path: &NodePath) -> Option<NodeId> {
        self.tree.node_at_path(path)
    }

    pub fn node_by_peer(&self, peer: PeerId) -> Option<NodeId> {
        let root = self.tree.root()?;
        self.tree
            .iter(root)
            .find(|id| self.tree.value(*id).is_some_and(|n| n.peer == peer))
    }

    /// Places a newly joined compute node.
    ///
    /// The first node becomes the root and covers the full universe. Later
    /// nodes walk down from the root: at each level the four child slots are
    /// scanned from a uniformly random offset and the first empty one is
    /// taken; when all four are occupied the walk descends into the offset
    /// quadrant. Placement is deliberately load-blind.
    pub fn add_compute_node(
        &mut self,
        node: ComputeNode,
        rng: &mut impl Rng,
    ) -> Result<NodeId, SpatialError> {
        let Some(mut cur) = self.tree.root() else {
            return self.tree.insert_root(self.universe(), node);
        };
        loop {
            let offset: usize = rng.gen_range(0..4);
            let children = self
                .tree
                .get(cur)
                .ok_or(SpatialError::UnknownNode(cur))?
                .children();
            let free = (0..4)
                .map(|j| (offset + j) % 4)
                .find(|i| children[*i].is_none());
            match free {
                Some(i) => return self.tree.attach_child(cur, Quadrant::ALL[i], node),
                None => {
                    // Full house: the offset quadrant is guaranteed occupied.
                    cur = children[offset].ok_or(SpatialError::UnknownNode(cur))?;
                }
            }
        }
    }

    /// Mints a fresh token whose trailing public id is unused.
    pub fn allocate_token(&mut self) -> String {
        loop {
            let token = Uuid::new_v4().to_string();
            if self.used_public_ids.insert(public_id(&token).to_string()) {
                return token;
            }
        }
    }

    /// Allocates a token and assigns it to a random leaf node. `None` when
    /// no compute node is connected.
    pub fn add_new_ship(&mut self, rng: &mut impl Rng) -> Option<(String, NodeId)> {
        let root = self.tree.root()?;
        let owner = self.tree.random_leaf(root, rng)?;
        let token = self.allocate_token();
        self.ship_owner.insert(token.clone(), owner);
        Some((token, owner))
    }

    /// Records that `owner` holds the ship, reserving its public id.
    pub fn assign_ship(&mut self, token: &str, owner: NodeId) {
        self.used_public_ids.insert(public_id(token).to_string());
        self.ship_owner.insert(token.to_string(), owner);
    }

    /// Forgets a ship, releasing its public id. Returns the former owner.
    pub fn remove_ship(&mut self, token: &str) -> Option<NodeId> {
        let owner = self.ship_owner.remove(token)?;
        self.used_public_ids.remove(public_id(token));
        Some(owner)
    }

    pub fn owner_of(&self, token: &str) -> Option<NodeId> {
        self.ship_owner.get(token).copied()
    }

    pub fn ships_owned_by(&self, id: NodeId) -> Vec<String> {
        self.ship_owner
            .iter()
            .filter(|(_, owner)| **owner == id)
            .map(|(token, _)| token.clone())
            .collect()
    }

    /// Works out how to recover from `peer` going away. `None` when the
    /// peer is not in the tree, which makes duplicate departure
    /// notifications a no-op.
    ///
    /// The substitute is the first child in quadrant order when the root
    /// departs, the parent when a non-root leaf departs, and a random leaf
    /// descendant otherwise.
    pub fn plan_removal(&self, peer: PeerId, rng: &mut impl Rng) -> Option<RemovalPlan> {
        let departed = self.node_by_peer(peer)?;
        let node = self.tree.get(departed)?;
        let substitute = if node.parent().is_none() {
            Quadrant::ALL.iter().find_map(|q| node.child(*q))
        } else if node.is_leaf() {
            node.parent()
        } else {
            // The departed node has children, so the walk never stops on it.
            self.tree.random_leaf(departed, rng)
        };
        Some(RemovalPlan {
            departed,
            departed_peer: peer,
            departed_path: self.tree.path(departed)?,
            departed_api_url: node.value.api_url.clone(),
            substitute,
            tokens: self.ships_owned_by(departed),
        })
    }

    /// Re-wires the tree and the ownership map according to `plan`.
    ///
    /// The substitute is detached from its old position and takes over the
    /// departed node's slot (or becomes the new root with full-universe
    /// bounds), keeping its own children. Any other children the departed
    /// node had are re-attached under the substitute.
    pub fn apply_removal(
        &mut self,
        plan: &RemovalPlan,
        rng: &mut impl Rng,
    ) -> Result<(), SpatialError> {
        let departed = plan.departed;
        let (d_parent, d_slot) = {
            let d = self
                .tree
                .get(departed)
                .ok_or(SpatialError::UnknownNode(departed))?;
            (d.parent(), d.slot())
        };

        match plan.substitute {
            None => {
                // A lone root departed; the tree empties.
                self.tree.remove(departed)?;
            }
            Some(sub) if Some(sub) == d_parent => {
                // A leaf departed; its ships merge upward into the parent
                // and the parent's slot for it simply empties.
                self.tree.remove(departed)?;
            }
            Some(sub) => {
                self.tree.detach(sub)?;
                let orphans: Vec<(Quadrant, NodeId)> = {
                    let d = self
                        .tree
                        .get(departed)
                        .ok_or(SpatialError::UnknownNode(departed))?;
                    Quadrant::ALL
                        .iter()
                        .filter_map(|&q| d.child(q).map(|c| (q, c)))
                        .collect()
                };
                for (_, child) in &orphans {
                    self.tree.detach(*child)?;
                }
                self.tree.remove(departed)?;
                match (d_parent, d_slot) {
                    (Some(parent), Some(slot)) => self.tree.reattach(sub, parent, slot)?,
                    _ => self.tree.promote_root(sub, self.universe())?,
                }
                self.adopt(sub, orphans, rng)?;
            }
        }

        for token in &plan.tokens {
            match plan.substitute {
                Some(sub) => {
                    self.ship_owner.insert(token.clone(), sub);
                }
                None => {
                    // No node left to hold the ship.
                    self.ship_owner.remove(token);
                    self.used_public_ids.remove(public_id(token));
                }
            }
        }
        Ok(())
    }

    /// Hangs the departed node's leftover branches under the substitute:
    /// same quadrant when free, else the first free slot, else under one of
    /// the substitute's leaves.
    fn adopt(
        &mut self,
        sub: NodeId,
        orphans: Vec<(Quadrant, NodeId)>,
        rng: &mut impl Rng,
    ) -> Result<(), SpatialError> {
        for (slot, orphan) in orphans {
            let free = {
                let s = self.tree.get(sub).ok_or(SpatialError::UnknownNode(sub))?;
                if s.child(slot).is_none() {
                    Some(slot)
                } else {
                    Quadrant::ALL.iter().copied().find(|q| s.child(*q).is_none())
                }
            };
            match free {
                Some(q) => self.tree.reattach(orphan, sub, q)?,
                None => {
                    let leaf = self
                        .tree
                        .random_leaf(sub, rng)
                        .ok_or(SpatialError::UnknownNode(sub))?;
                    self.tree.reattach(orphan, leaf, slot)?;
                }
            }
        }
        Ok(())
    }
}
