use std::collections::VecDeque;

use hashbrown::HashMap;

use super::machine::{ChipCoord, Direction, Route};

/// Index of a node in a [`RoutingTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// An outgoing edge of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    /// Leave the chip over a link towards another node of the tree.
    Hop(Direction, NodeId),
    /// Deliver locally, to a core or out of an external link.
    Endpoint(Route),
}

#[derive(Debug, Clone)]
pub struct TreeNode {
    chip: ChipCoord,
    children: Vec<Child>,
}

impl TreeNode {
    pub fn chip(&self) -> ChipCoord {
        self.chip
    }

    pub fn children(&self) -> &[Child] {
        &self.children
    }
}

/// The multicast tree of one partition.
///
/// Nodes live in an arena and are keyed by chip, so a chip appears at most
/// once. Parents own their children through [`Child::Hop`] edges and there
/// are no parent links. While a tree is being repaired it may briefly hold
/// subtrees that are not reachable from the root.
#[derive(Debug, Clone)]
pub struct RoutingTree {
    nodes: Vec<TreeNode>,
    lookup: HashMap<ChipCoord, NodeId>,
    root: NodeId,
}

impl RoutingTree {
    pub fn new(root: ChipCoord) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            lookup: HashMap::new(),
            root: NodeId(0),
        };
        tree.root = tree.add_node(root);
        tree
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_chip(&self) -> ChipCoord {
        self.chip(self.root)
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.0]
    }

    pub fn chip(&self, id: NodeId) -> ChipCoord {
        self.nodes[id.0].chip
    }

    pub fn children(&self, id: NodeId) -> &[Child] {
        &self.nodes[id.0].children
    }

    pub fn get(&self, chip: ChipCoord) -> Option<NodeId> {
        self.lookup.get(&chip).copied()
    }

    pub fn contains(&self, chip: ChipCoord) -> bool {
        self.lookup.contains_key(&chip)
    }

    /// Number of chips held, reachable from the root or not.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All chips held, in insertion order.
    pub fn chips(&self) -> impl Iterator<Item = ChipCoord> + '_ {
        self.nodes.iter().map(|node| node.chip)
    }

    /// Adds a node with no parent. The chip must not already be present.
    pub(crate) fn add_node(&mut self, chip: ChipCoord) -> NodeId {
        debug_assert!(!self.contains(chip), "chip {} already in tree", chip);
        let id = NodeId(self.nodes.len());
        self.nodes.push(TreeNode {
            chip,
            children: Vec::new(),
        });
        self.lookup.insert(chip, id);
        id
    }

    pub(crate) fn add_hop(&mut self, parent: NodeId, direction: Direction, child: NodeId) {
        self.nodes[parent.0].children.push(Child::Hop(direction, child));
    }

    /// Adds a local delivery to a node, once.
    pub fn add_endpoint(&mut self, node: NodeId, route: Route) {
        let children = &mut self.nodes[node.0].children;
        if !children.contains(&Child::Endpoint(route)) {
            children.push(Child::Endpoint(route));
        }
    }

    /// Removes the hop edge leading into `child`, wherever it is.
    pub(crate) fn detach(&mut self, child: NodeId) {
        for node in &mut self.nodes {
            if let Some(pos) = node
                .children
                .iter()
                .position(|c| matches!(c, Child::Hop(_, id) if *id == child))
            {
                node.children.remove(pos);
                return;
            }
        }
    }

    /// `id` and everything below it, breadth first.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = vec![id];
        let mut next = 0;
        while next < out.len() {
            let node = out[next];
            next += 1;
            out.extend(self.children(node).iter().filter_map(|child| match child {
                Child::Hop(_, child) => Some(*child),
                Child::Endpoint(_) => None,
            }));
        }
        out
    }

    /// Every `(parent, direction, child)` hop reachable from the root,
    /// breadth first.
    pub fn hops(&self) -> Vec<(NodeId, Direction, NodeId)> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([self.root]);
        while let Some(node) = queue.pop_front() {
            for child in self.children(node) {
                if let Child::Hop(direction, child) = child {
                    out.push((node, *direction, *child));
                    queue.push_back(*child);
                }
            }
        }
        out
    }

    /// A compacted copy holding the root and only those nodes with an
    /// endpoint somewhere below them. Branches left dangling by a repair are
    /// dropped; nodes not reachable from the root are never copied.
    pub fn pruned(&self) -> RoutingTree {
        let order = self.descendants(self.root);
        let mut useful = vec![false; self.nodes.len()];
        for &id in order.iter().rev() {
            let keep = self.children(id).iter().any(|child| match child {
                Child::Endpoint(_) => true,
                Child::Hop(_, next) => useful[next.0],
            });
            useful[id.0] = keep;
        }

        let mut out = RoutingTree::new(self.root_chip());
        let mut queue = VecDeque::from([(self.root, out.root)]);
        while let Some((old, new)) = queue.pop_front() {
            for child in self.children(old) {
                match *child {
                    Child::Endpoint(route) => out.add_endpoint(new, route),
                    Child::Hop(direction, next) if useful[next.0] => {
                        let id = out.add_node(self.chip(next));
                        out.add_hop(new, direction, id);
                        queue.push_back((next, id));
                    }
                    Child::Hop(..) => {}
                }
            }
        }
        out
    }

    /// Every local delivery reachable from the root.
    pub fn endpoints(&self) -> Vec<(ChipCoord, Route)> {
        self.descendants(self.root)
            .into_iter()
            .flat_map(|id| {
                let chip = self.chip(id);
                self.children(id).iter().filter_map(move |child| match child {
                    Child::Endpoint(route) => Some((chip, *route)),
                    Child::Hop(..) => None,
                })
            })
            .collect()
    }
}
