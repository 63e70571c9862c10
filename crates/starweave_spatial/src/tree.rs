//! Arena-backed partition tree.
//!
//! Nodes live in a slab (`Vec` of slots with a free list) and refer to each
//! other through stable [`NodeId`] indices instead of owned boxes. Leave
//! recovery rewires subtrees by swapping ids, so moving a whole branch is a
//! handful of index writes plus a depth/bounds refresh walk, with no
//! reallocation of the branch itself.

use crate::error::SpatialError;
use crate::path::{NodePath, MAX_DEPTH};
use crate::quad::{Quad, Quadrant};

use rand::Rng;

/// Stable handle to a node in a [`PartitionTree`].
///
/// Ids stay valid until the node is removed; removed ids may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// A single partition node: payload plus tree wiring.
#[derive(Debug)]
pub struct TreeNode<T> {
    pub value: T,
    parent: Option<NodeId>,
    /// Which slot of the parent this node occupies. `None` for the root
    /// and for detached subtree roots.
    slot: Option<Quadrant>,
    depth: u8,
    bounds: Quad,
    children: [Option<NodeId>; 4],
}

impl<T> TreeNode<T> {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn slot(&self) -> Option<Quadrant> {
        self.slot
    }

    pub fn depth(&self) -> usize {
        self.depth as usize
    }

    pub fn bounds(&self) -> Quad {
        self.bounds
    }

    pub fn child(&self, q: Quadrant) -> Option<NodeId> {
        self.children[q.index()]
    }

    pub fn children(&self) -> [Option<NodeId>; 4] {
        self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(|c| c.is_none())
    }
}

/// Generic 4-ary spatial partition tree with slab storage.
#[derive(Debug, Default)]
pub struct PartitionTree<T> {
    slots: Vec<Option<TreeNode<T>>>,
    free: Vec<usize>,
    root: Option<NodeId>,
    len: usize,
}

impl<T> PartitionTree<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&TreeNode<T>> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut TreeNode<T>> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    pub fn value(&self, id: NodeId) -> Option<&T> {
        self.get(id).map(|n| &n.value)
    }

    pub fn value_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.get_mut(id).map(|n| &mut n.value)
    }

    fn alloc(&mut self, node: TreeNode<T>) -> NodeId {
        self.len += 1;
        match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(node);
                NodeId(i)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    /// Creates the root node of an empty tree.
    pub fn insert_root(&mut self, bounds: Quad, value: T) -> Result<NodeId, SpatialError> {
        if self.root.is_some() {
            return Err(SpatialError::RootOccupied);
        }
        let id = self.alloc(TreeNode {
            value,
            parent: None,
            slot: None,
            depth: 0,
            bounds,
            children: [None; 4],
        });
        self.root = Some(id);
        Ok(id)
    }

    /// Attaches a new child under `parent` in slot `q`.
    ///
    /// Fails without mutating when the slot is taken or the parent already
    /// sits at the depth limit.
    pub fn attach_child(
        &mut self,
        parent: NodeId,
        q: Quadrant,
        value: T,
    ) -> Result<NodeId, SpatialError> {
        let p = self.get(parent).ok_or(SpatialError::UnknownNode(parent))?;
        if p.depth() == MAX_DEPTH {
            return Err(SpatialError::DepthExceeded);
        }
        if p.children[q.index()].is_some() {
            return Err(SpatialError::SlotOccupied(q));
        }
        let depth = p.depth + 1;
        let bounds = p.bounds.quadrant(q);
        let id = self.alloc(TreeNode {
            value,
            parent: Some(parent),
            slot: Some(q),
            depth,
            bounds,
            children: [None; 4],
        });
        if let Some(p) = self.get_mut(parent) {
            p.children[q.index()] = Some(id);
        }
        Ok(id)
    }

    /// Unlinks `id` (and its whole subtree) from its parent, or clears the
    /// root link when `id` is the root. The subtree stays in the arena.
    pub fn detach(&mut self, id: NodeId) -> Result<NodeId, SpatialError> {
        let (parent, slot) = {
            let n = self.get(id).ok_or(SpatialError::UnknownNode(id))?;
            (n.parent, n.slot)
        };
        match (parent, slot) {
            (Some(p), Some(q)) => {
                if let Some(p) = self.get_mut(p) {
                    p.children[q.index()] = None;
                }
            }
            _ => {
                if self.root == Some(id) {
                    self.root = None;
                }
            }
        }
        if let Some(n) = self.get_mut(id) {
            n.parent = None;
            n.slot = None;
        }
        Ok(id)
    }

    /// Attaches a detached subtree under `parent` in slot `q`, recomputing
    /// depth and bounds across the subtree.
    pub fn reattach(
        &mut self,
        id: NodeId,
        parent: NodeId,
        q: Quadrant,
    ) -> Result<(), SpatialError> {
        let (p_depth, p_bounds) = {
            let p = self.get(parent).ok_or(SpatialError::UnknownNode(parent))?;
            if p.depth() == MAX_DEPTH {
                return Err(SpatialError::DepthExceeded);
            }
            if p.children[q.index()].is_some() {
                return Err(SpatialError::SlotOccupied(q));
            }
            (p.depth, p.bounds)
        };
        {
            let n = self.get_mut(id).ok_or(SpatialError::UnknownNode(id))?;
            n.parent = Some(parent);
            n.slot = Some(q);
            n.depth = p_depth + 1;
            n.bounds = p_bounds.quadrant(q);
        }
        if let Some(p) = self.get_mut(parent) {
            p.children[q.index()] = Some(id);
        }
        self.refresh_descendants(id);
        Ok(())
    }

    /// Makes a detached subtree the root of an empty tree with the given
    /// bounds, recomputing depth and bounds across the subtree.
    pub fn promote_root(&mut self, id: NodeId, bounds: Quad) -> Result<(), SpatialError> {
        if self.root.is_some() {
            return Err(SpatialError::RootOccupied);
        }
        {
            let n = self.get_mut(id).ok_or(SpatialError::UnknownNode(id))?;
            n.parent = None;
            n.slot = None;
            n.depth = 0;
            n.bounds = bounds;
        }
        self.root = Some(id);
        self.refresh_descendants(id);
        Ok(())
    }

    /// Recomputes depth and bounds of every descendant of `id` from its
    /// parent's, following the quadrant tags.
    fn refresh_descendants(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            let Some(n) = self.get(cur) else { continue };
            let (depth, bounds, children) = (n.depth, n.bounds, n.children);
            for (i, child) in children.iter().enumerate() {
                let Some(child) = *child else { continue };
                // Child index equals its quadrant tag.
                let q = Quadrant::from_index(i as u8).unwrap_or(Quadrant::Ne);
                if let Some(c) = self.get_mut(child) {
                    c.depth = depth + 1;
                    c.bounds = bounds.quadrant(q);
                }
                stack.push(child);
            }
        }
    }

    /// Frees `id` and its entire subtree, returning the root value.
    pub fn remove(&mut self, id: NodeId) -> Result<T, SpatialError> {
        self.detach(id)?;
        let mut stack: Vec<NodeId> = self
            .get(id)
            .map(|n| n.children.iter().flatten().copied().collect())
            .unwrap_or_default();
        while let Some(cur) = stack.pop() {
            if let Some(n) = self.slots[cur.0].take() {
                self.len -= 1;
                self.free.push(cur.0);
                stack.extend(n.children.iter().flatten().copied());
            }
        }
        let node = self.slots[id.0]
            .take()
            .ok_or(SpatialError::UnknownNode(id))?;
        self.len -= 1;
        self.free.push(id.0);
        Ok(node.value)
    }

    /// Descends from `from` to a leaf, scanning the four child slots from a
    /// uniformly random offset at each level and following the first
    /// occupied one.
    pub fn random_leaf(&self, from: NodeId, rng: &mut impl Rng) -> Option<NodeId> {
        let mut cur = from;
        loop {
            let node = self.get(cur)?;
            if node.is_leaf() {
                return Some(cur);
            }
            let offset: usize = rng.gen_range(0..4);
            let next = (0..4)
                .map(|j| (offset + j) % 4)
                .find_map(|i| node.children[i]);
            match next {
                Some(next) => cur = next,
                None => return Some(cur),
            }
        }
    }

    /// The deepest node under `from` whose bounds fully contain `target`,
    /// or `None` when even `from` does not contain it.
    pub fn smallest_containing(&self, from: NodeId, target: &Quad) -> Option<NodeId> {
        let mut cur = from;
        if !self.get(cur)?.bounds.contains(target) {
            return None;
        }
        'descend: loop {
            let node = self.get(cur)?;
            for child in node.children.iter().flatten() {
                if let Some(c) = self.get(*child) {
                    if c.bounds.contains(target) {
                        cur = *child;
                        continue 'descend;
                    }
                }
            }
            return Some(cur);
        }
    }

    /// The quadrant path from the root to `id`.
    pub fn path(&self, id: NodeId) -> Option<NodePath> {
        let mut quadrants = Vec::new();
        let mut cur = id;
        loop {
            let node = self.get(cur)?;
            match (node.parent, node.slot) {
                (Some(p), Some(q)) => {
                    quadrants.push(q);
                    cur = p;
                }
                _ => break,
            }
        }
        quadrants.reverse();
        NodePath::from_quadrants(quadrants).ok()
    }

    /// Resolves a path from the root; `None` when any step is missing.
    pub fn node_at_path(&self, path: &NodePath) -> Option<NodeId> {
        let mut cur = self.root?;
        for q in path {
            cur = self.get(cur)?.child(q)?;
        }
        Some(cur)
    }

    /// Resolves a path from the root, creating any missing node along the
    /// way with `fill(bounds, depth)`.
    pub fn ensure_path(
        &mut self,
        path: &NodePath,
        mut fill: impl FnMut(Quad, usize) -> T,
    ) -> Result<NodeId, SpatialError> {
        let mut cur = self.root.ok_or(SpatialError::EmptyTree)?;
        for q in path {
            cur = match self.get(cur).ok_or(SpatialError::UnknownNode(cur))?.child(q) {
                Some(child) => child,
                None => {
                    let node = self.get(cur).ok_or(SpatialError::UnknownNode(cur))?;
                    let bounds = node.bounds.quadrant(q);
                    let depth = node.depth() + 1;
                    self.attach_child(cur, q, fill(bounds, depth))?
                }
            };
        }
        Ok(cur)
    }

    /// Pre-order depth-first iteration over the subtree rooted at `from`.
    pub fn iter(&self, from: NodeId) -> PreOrderIter<'_, T> {
        PreOrderIter {
            tree: self,
            stack: vec![from],
        }
    }

    /// Recursive range query: subtrees whose bounds do not intersect
    /// `range` are skipped whole; per-node results are concatenated.
    pub fn collect_range<R>(
        &self,
        from: NodeId,
        range: &Quad,
        local: &mut impl FnMut(NodeId, &T) -> Vec<R>,
    ) -> Vec<R> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(cur) = stack.pop() {
            let Some(node) = self.get(cur) else { continue };
            if !node.bounds.intersects(range) {
                continue;
            }
            out.extend(local(cur, &node.value));
            stack.extend(node.children.iter().flatten().copied());
        }
        out
    }
}

pub struct PreOrderIter<'a, T> {
    tree: &'a PartitionTree<T>,
    stack: Vec<NodeId>,
}

impl<'a, T> Iterator for PreOrderIter<'a, T> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        if let Some(node) = self.tree.get(id) {
            // Push in reverse so NE comes out first.
            for child in node.children.iter().rev().flatten() {
                self.stack.push(*child);
            }
        }
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn seeded() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(7)
    }

    fn universe() -> Quad {
        Quad::universe(1024.0)
    }

    #[test]
    fn attach_preserves_bounds_invariant() {
        let mut tree = PartitionTree::new();
        let root = tree.insert_root(universe(), "root").unwrap();
        let ne = tree.attach_child(root, Quadrant::Ne, "ne").unwrap();
        let sw = tree.attach_child(ne, Quadrant::Sw, "ne/sw").unwrap();

        let root_b = tree.get(root).unwrap().bounds();
        let ne_b = tree.get(ne).unwrap().bounds();
        let sw_b = tree.get(sw).unwrap().bounds();
        assert_eq!(ne_b, root_b.quadrant(Quadrant::Ne));
        assert_eq!(sw_b, ne_b.quadrant(Quadrant::Sw));
        assert!(root_b.contains(&ne_b) && ne_b.contains(&sw_b));
        assert_eq!(tree.get(sw).unwrap().depth(), 2);
    }

    #[test]
    fn attach_rejects_taken_slot_and_depth_limit() {
        let mut tree = PartitionTree::new();
        let root = tree.insert_root(universe(), 0usize).unwrap();
        tree.attach_child(root, Quadrant::Ne, 1).unwrap();
        assert_eq!(
            tree.attach_child(root, Quadrant::Ne, 2),
            Err(SpatialError::SlotOccupied(Quadrant::Ne))
        );

        // Build a chain down to MAX_DEPTH, then one more must fail cleanly.
        let mut cur = root;
        for d in 1..=MAX_DEPTH {
            cur = tree.attach_child(cur, Quadrant::Sw, d).unwrap();
        }
        let before = tree.len();
        assert_eq!(
            tree.attach_child(cur, Quadrant::Sw, 99),
            Err(SpatialError::DepthExceeded)
        );
        assert_eq!(tree.len(), before);
        assert!(tree.get(cur).unwrap().is_leaf());
    }

    #[test]
    fn detach_and_reattach_rewires_bounds() {
        let mut tree = PartitionTree::new();
        let root = tree.insert_root(universe(), "root").unwrap();
        let ne = tree.attach_child(root, Quadrant::Ne, "a").unwrap();
        let deep = tree.attach_child(ne, Quadrant::Nw, "b").unwrap();

        tree.detach(ne).unwrap();
        assert_eq!(tree.get(root).unwrap().child(Quadrant::Ne), None);
        tree.reattach(ne, root, Quadrant::Se).unwrap();

        let root_b = tree.get(root).unwrap().bounds();
        assert_eq!(tree.get(ne).unwrap().bounds(), root_b.quadrant(Quadrant::Se));
        // The grandchild followed along and got fresh bounds too.
        assert_eq!(
            tree.get(deep).unwrap().bounds(),
            root_b.quadrant(Quadrant::Se).quadrant(Quadrant::Nw)
        );
        assert_eq!(tree.get(deep).unwrap().depth(), 2);
    }

    #[test]
    fn promote_root_resets_depth_and_bounds() {
        let mut tree = PartitionTree::new();
        let root = tree.insert_root(universe(), "root").unwrap();
        let child = tree.attach_child(root, Quadrant::Nw, "child").unwrap();
        let grand = tree.attach_child(child, Quadrant::Se, "grand").unwrap();

        tree.detach(child).unwrap();
        tree.detach(root).unwrap();
        tree.remove(root).unwrap();
        tree.promote_root(child, universe()).unwrap();

        assert_eq!(tree.root(), Some(child));
        assert_eq!(tree.get(child).unwrap().depth(), 0);
        assert_eq!(tree.get(child).unwrap().bounds(), universe());
        assert_eq!(
            tree.get(grand).unwrap().bounds(),
            universe().quadrant(Quadrant::Se)
        );
    }

    #[test]
    fn random_leaf_lands_on_a_leaf() {
        let mut tree = PartitionTree::new();
        let root = tree.insert_root(universe(), 0).unwrap();
        let a = tree.attach_child(root, Quadrant::Nw, 1).unwrap();
        tree.attach_child(root, Quadrant::Se, 2).unwrap();
        tree.attach_child(a, Quadrant::Ne, 3).unwrap();

        let mut rng = seeded();
        for _ in 0..64 {
            let leaf = tree.random_leaf(root, &mut rng).unwrap();
            assert!(tree.get(leaf).unwrap().is_leaf());
        }
    }

    #[test]
    fn smallest_containing_walks_down() {
        let mut tree = PartitionTree::new();
        let root = tree.insert_root(universe(), ()).unwrap();
        let ne = tree.attach_child(root, Quadrant::Ne, ()).unwrap();
        let ne_ne = tree.attach_child(ne, Quadrant::Ne, ()).unwrap();

        // Deep inside the NE/NE cell.
        let target = Quad::new(900.0, 900.0, 10.0);
        assert_eq!(tree.smallest_containing(root, &target), Some(ne_ne));

        // Straddles the center: only the root contains it.
        let straddle = Quad::new(0.0, 0.0, 10.0);
        assert_eq!(tree.smallest_containing(root, &straddle), Some(root));

        // Outside the universe entirely.
        let outside = Quad::new(5000.0, 0.0, 10.0);
        assert_eq!(tree.smallest_containing(root, &outside), None);
    }

    #[test]
    fn path_and_node_at_path_agree() {
        let mut tree = PartitionTree::new();
        let root = tree.insert_root(universe(), ()).unwrap();
        let a = tree.attach_child(root, Quadrant::Sw, ()).unwrap();
        let b = tree.attach_child(a, Quadrant::Ne, ()).unwrap();

        let path = tree.path(b).unwrap();
        assert_eq!(path.quadrants(), &[Quadrant::Sw, Quadrant::Ne]);
        assert_eq!(tree.node_at_path(&path), Some(b));
        assert_eq!(tree.path(root).unwrap(), NodePath::root());
    }

    #[test]
    fn ensure_path_creates_missing_nodes() {
        let mut tree = PartitionTree::new();
        let root = tree.insert_root(universe(), 0usize).unwrap();
        let path =
            NodePath::from_quadrants(vec![Quadrant::Se, Quadrant::Se, Quadrant::Nw]).unwrap();
        let id = tree.ensure_path(&path, |_, depth| depth).unwrap();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.path(id).unwrap(), path);
        assert_eq!(*tree.value(id).unwrap(), 3);
        // Resolving again creates nothing new.
        assert_eq!(tree.ensure_path(&path, |_, d| d).unwrap(), id);
        assert_eq!(tree.len(), 4);
        let _ = root;
    }

    #[test]
    fn collect_range_prunes_disjoint_subtrees() {
        let mut tree = PartitionTree::new();
        let root = tree.insert_root(universe(), "root").unwrap();
        tree.attach_child(root, Quadrant::Ne, "ne").unwrap();
        tree.attach_child(root, Quadrant::Sw, "sw").unwrap();

        // A range confined to the NE quadrant never sees the SW node.
        let range = Quad::new(700.0, 700.0, 50.0);
        let hits = tree.collect_range(root, &range, &mut |_, v: &&str| vec![v.to_string()]);
        assert!(hits.contains(&"root".to_string()));
        assert!(hits.contains(&"ne".to_string()));
        assert!(!hits.contains(&"sw".to_string()));
    }

    #[test]
    fn remove_frees_the_subtree() {
        let mut tree = PartitionTree::new();
        let root = tree.insert_root(universe(), 0).unwrap();
        let a = tree.attach_child(root, Quadrant::Ne, 1).unwrap();
        tree.attach_child(a, Quadrant::Ne, 2).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.remove(a).unwrap(), 1);
        assert_eq!(tree.len(), 1);
        assert!(tree.get(a).is_none());
        assert_eq!(tree.get(root).unwrap().child(Quadrant::Ne), None);
    }
}
