//! Rerouting trees around dead chips and links.
//!
//! Trees are grown as if the machine were perfect. Repair copies the tree
//! while dropping every hop that does not exist on the live machine, leaving
//! a forest, then grafts each orphaned subtree back on with an A* search
//! over the live links.

use std::collections::VecDeque;

use hashbrown::HashSet;
use petgraph::algo::astar;
use tracing::{debug, warn};

use super::{
    error::Error,
    machine::{ChipCoord, Direction, LinkGraph, Topology},
    tree::{Child, NodeId, RoutingTree},
};

/// A tree with its unusable hops cut out.
#[derive(Debug, Clone)]
pub struct Disconnected {
    /// Every live chip of the original tree. Orphaned subtrees are held but
    /// not reachable from the root.
    pub tree: RoutingTree,
    /// `(parent, orphan)` pairs: the orphaned subtree root and the node it
    /// used to hang from.
    pub broken: Vec<(NodeId, NodeId)>,
}

/// True if any hop of the tree crosses a link (or reaches a chip) that is not
/// alive.
pub fn has_dead_links(tree: &RoutingTree, topology: &Topology) -> bool {
    tree.hops().into_iter().any(|(parent, direction, child)| {
        topology.link(tree.chip(parent), direction) != Some(tree.chip(child))
    })
}

/// Copies `tree` breadth first, keeping only hops that exist on the live
/// machine.
///
/// Dead chips are skipped and their children re-parented onto the nearest
/// live ancestor; as that ancestor is not a neighbour of the child the link
/// is recorded as broken. Deliveries on a dead chip cannot be honoured and
/// fail the whole tree.
pub fn disconnect(tree: &RoutingTree, topology: &Topology) -> Result<Disconnected, Error> {
    let root_chip = tree.root_chip();
    if !topology.contains(root_chip) {
        return Err(Error::DeadSource(root_chip));
    }

    let mut copy = RoutingTree::new(root_chip);
    let mut broken = Vec::new();
    let mut queue: VecDeque<(Option<(NodeId, Direction)>, NodeId)> =
        VecDeque::from([(None, tree.root())]);

    while let Some((link, old)) = queue.pop_front() {
        let chip = tree.chip(old);
        let node = match link {
            None => copy.root(),
            Some((parent, _)) if !topology.contains(chip) => parent,
            Some(_) => copy.add_node(chip),
        };

        if let Some((parent, direction)) = link {
            if node != parent {
                if topology.link(copy.chip(parent), direction) == Some(chip) {
                    copy.add_hop(parent, direction, node);
                } else {
                    broken.push((parent, node));
                }
            }
        }

        for child in tree.children(old) {
            match *child {
                Child::Hop(direction, child) => queue.push_back((Some((node, direction)), child)),
                Child::Endpoint(route) if copy.chip(node) == chip => {
                    copy.add_endpoint(node, route)
                }
                Child::Endpoint(_) => {
                    return Err(Error::UnreachableDestination {
                        source: root_chip,
                        sink: chip,
                    })
                }
            }
        }
    }

    Ok(Disconnected { tree: copy, broken })
}

/// Grafts every orphaned subtree back onto the rest of the tree.
///
/// For each orphan an A* search runs backwards over the live links from the
/// orphan's root, guided towards its old parent, and stops at the first chip
/// held by the tree outside the orphan itself. Chips on the found path are
/// added, or taken over from the orphan when the path runs back through it.
pub fn reconnect(
    disconnected: Disconnected,
    topology: &Topology,
    graph: &LinkGraph,
) -> Result<RoutingTree, Error> {
    let Disconnected { mut tree, broken } = disconnected;

    for (parent, orphan) in broken {
        let target = tree.chip(parent);
        let orphan_chip = tree.chip(orphan);
        let subtree: HashSet<ChipCoord> = tree
            .descendants(orphan)
            .into_iter()
            .map(|id| tree.chip(id))
            .collect();

        let path = astar(
            graph,
            orphan_chip,
            |chip| !subtree.contains(&chip) && tree.contains(chip),
            |_| 1u32,
            |chip| topology.distance(chip, target),
        );
        let Some((_, path)) = path else {
            return Err(Error::UnreachableDestination {
                source: tree.root_chip(),
                sink: orphan_chip,
            });
        };

        // The path runs orphan -> ... -> attachment; lay it down the other way.
        let mut last = tree
            .get(path[path.len() - 1])
            .ok_or(Error::UnreachableDestination {
                source: tree.root_chip(),
                sink: orphan_chip,
            })?;
        for pair in path.windows(2).rev() {
            let (chip, from) = (pair[0], pair[1]);
            let direction = *graph
                .edge_weight(chip, from)
                .ok_or(Error::UnreachableDestination {
                    source: from,
                    sink: chip,
                })?;
            let node = match tree.get(chip) {
                Some(node) => {
                    tree.detach(node);
                    node
                }
                None => tree.add_node(chip),
            };
            tree.add_hop(last, direction, node);
            last = node;
        }
        debug!(
            "reconnected {} to {} over {} hops",
            orphan_chip,
            path[path.len() - 1],
            path.len() - 1
        );
    }

    Ok(tree)
}

/// Returns a tree equivalent to `tree` that only uses live links, or the
/// tree unchanged if it already does. Every leaf of a repaired tree carries
/// an endpoint.
pub fn avoid_dead_links(
    tree: RoutingTree,
    topology: &Topology,
    graph: &LinkGraph,
) -> Result<RoutingTree, Error> {
    if !has_dead_links(&tree, topology) {
        return Ok(tree);
    }
    let disconnected = disconnect(&tree, topology)?;
    warn!(
        "tree from {} crosses {} dead links, rerouting",
        tree.root_chip(),
        disconnected.broken.len()
    );
    // Splicing a path in away from an orphan's old parent can leave that
    // parent, and the chain above it, leading nowhere.
    let repaired = reconnect(disconnected, topology, graph)?.pruned();
    debug_assert!(!has_dead_links(&repaired, topology));
    Ok(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{
        machine::{Route, RouteSet},
        ner::ner_tree,
        ner::tests::assert_tree,
        table::compile_tree,
    };
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

    fn line_tree(topology: &Topology) -> RoutingTree {
        let mut rng = StdRng::seed_from_u64(0);
        let mut tree = ner_tree(
            ChipCoord::new(0, 2),
            &[ChipCoord::new(5, 2)],
            topology,
            20,
            &mut rng,
        );
        let sink = tree.get(ChipCoord::new(5, 2)).unwrap();
        tree.add_endpoint(sink, Route::Core(1));
        tree
    }

    #[test]
    fn repairs_a_removed_link() {
        let mut topology = Topology::full(8, 8, false);
        let tree = line_tree(&topology);
        assert!(!has_dead_links(&tree, &topology));

        topology.remove_link(ChipCoord::new(2, 2), Direction::East);
        assert!(has_dead_links(&tree, &topology));

        let disconnected = disconnect(&tree, &topology).unwrap();
        assert_eq!(disconnected.broken.len(), 1);
        assert_eq!(disconnected.tree.hops().len(), 2);

        let graph = topology.link_graph();
        let repaired = avoid_dead_links(tree, &topology, &graph).unwrap();
        assert!(!has_dead_links(&repaired, &topology));
        let reached = assert_tree(&repaired, &topology);
        assert!(reached.contains(&ChipCoord::new(5, 2)));
        assert_eq!(
            repaired.endpoints(),
            vec![(ChipCoord::new(5, 2), Route::Core(1))]
        );
    }

    #[test]
    fn routes_round_a_dead_chip() {
        let mut topology = Topology::full(8, 8, false);
        let tree = line_tree(&topology);
        topology.remove_chip(ChipCoord::new(3, 2));

        let graph = topology.link_graph();
        let repaired = avoid_dead_links(tree, &topology, &graph).unwrap();
        assert!(!has_dead_links(&repaired, &topology));
        assert!(!repaired.contains(ChipCoord::new(3, 2)));
        let reached = assert_tree(&repaired, &topology);
        assert!(reached.contains(&ChipCoord::new(5, 2)));
    }

    #[test]
    fn dead_source_is_rejected() {
        let mut topology = Topology::full(8, 8, false);
        let tree = line_tree(&topology);
        topology.remove_chip(ChipCoord::new(0, 2));
        assert_eq!(
            disconnect(&tree, &topology).unwrap_err(),
            Error::DeadSource(ChipCoord::new(0, 2))
        );
    }

    #[test]
    fn isolated_sink_is_unreachable() {
        let mut topology = Topology::full(8, 8, false);
        let tree = line_tree(&topology);
        let sink = ChipCoord::new(5, 2);
        for direction in Direction::ALL {
            let (dx, dy) = direction.to_vector();
            let neighbour = ChipCoord::new(sink.x + dx, sink.y + dy);
            topology.remove_link(neighbour, direction.opposite());
        }

        let graph = topology.link_graph();
        let err = avoid_dead_links(tree, &topology, &graph).unwrap_err();
        assert!(matches!(err, Error::UnreachableDestination { sink: s, .. } if s == sink));
    }

    #[test]
    fn joining_away_from_old_parent_leaves_no_dead_end() {
        // (1,5) -E-> (2,5) -E-> (3,5) delivering to core 2, and
        // (1,5) -S-> (1,4) -E-> (2,4) delivering to core 1.
        let mut topology = Topology::full(5, 7, false);
        let mut tree = RoutingTree::new(ChipCoord::new(1, 5));
        let a = tree.add_node(ChipCoord::new(2, 5));
        let b = tree.add_node(ChipCoord::new(3, 5));
        let c = tree.add_node(ChipCoord::new(1, 4));
        let d = tree.add_node(ChipCoord::new(2, 4));
        tree.add_hop(tree.root(), Direction::East, a);
        tree.add_hop(a, Direction::East, b);
        tree.add_hop(tree.root(), Direction::South, c);
        tree.add_hop(c, Direction::East, d);
        tree.add_endpoint(b, Route::Core(2));
        tree.add_endpoint(d, Route::Core(1));

        // Only (2,4) can still reach (3,5).
        let sink = ChipCoord::new(3, 5);
        for direction in Direction::ALL {
            if direction == Direction::SouthWest {
                continue;
            }
            let (dx, dy) = direction.to_vector();
            let neighbour = ChipCoord::new(sink.x + dx, sink.y + dy);
            topology.remove_link(neighbour, direction.opposite());
        }

        let graph = topology.link_graph();
        let repaired = avoid_dead_links(tree, &topology, &graph).unwrap();
        assert!(!has_dead_links(&repaired, &topology));
        assert!(!repaired.contains(ChipCoord::new(2, 5)));
        let reached = assert_tree(&repaired, &topology);
        assert_eq!(reached.len(), repaired.len());
        assert_eq!(repaired.len(), 4);

        let entries = compile_tree(&repaired, Route::Core(0), &topology).unwrap();
        let chips: HashSet<ChipCoord> = entries.iter().map(|(chip, _)| *chip).collect();
        for (chip, entry) in &entries {
            for route in entry.routes.iter() {
                if let Route::Link(direction) = route {
                    let next = topology.link(*chip, direction).unwrap();
                    assert!(chips.contains(&next), "{} forwards to {} with no entry", chip, next);
                }
            }
        }
        let (_, root) = entries
            .iter()
            .find(|(chip, _)| *chip == ChipCoord::new(1, 5))
            .unwrap();
        assert_eq!(root.routes, RouteSet::from(Route::Link(Direction::South)));
        let (_, turn) = entries
            .iter()
            .find(|(chip, _)| *chip == ChipCoord::new(2, 4))
            .unwrap();
        let expected: RouteSet = [Route::Link(Direction::NorthEast), Route::Core(1)]
            .into_iter()
            .collect();
        assert_eq!(turn.routes, expected);
    }

    #[test]
    fn repaired_leaves_all_deliver() {
        for seed in 0..40u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let wrap = seed % 2 == 0;
            let mut topology = Topology::full(rng.gen_range(3..8), rng.gen_range(3..8), wrap);
            let chips = topology.chips();
            let source = chips[0];
            let sinks: Vec<_> = chips[1..].choose_multiple(&mut rng, 4).copied().collect();

            let mut tree = ner_tree(source, &sinks, &topology, 20, &mut rng);
            for &sink in &sinks {
                let id = tree.get(sink).unwrap();
                tree.add_endpoint(id, Route::Core(3));
            }
            for _ in 0..rng.gen_range(1..=5) {
                let chip = chips[rng.gen_range(0..chips.len())];
                let direction = Direction::ALL[rng.gen_range(0..6)];
                topology.remove_link(chip, direction);
            }

            let graph = topology.link_graph();
            let Ok(repaired) = avoid_dead_links(tree, &topology, &graph) else {
                continue;
            };
            assert!(!has_dead_links(&repaired, &topology));
            for id in repaired.descendants(repaired.root()) {
                assert!(
                    !repaired.children(id).is_empty() || id == repaired.root(),
                    "seed {}: {} leads nowhere",
                    seed,
                    repaired.chip(id)
                );
            }
            assert_eq!(repaired.endpoints().len(), sinks.len());
        }
    }

    #[test]
    fn repairs_large_trees_with_many_faults() {
        for (wrap, seed) in [(true, 21), (false, 22), (true, 23)] {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut topology = Topology::full(16, 16, wrap);
            let chips = topology.chips();
            let source = chips[0];
            let sinks: Vec<_> = chips[1..].choose_multiple(&mut rng, 60).copied().collect();

            let mut tree = ner_tree(source, &sinks, &topology, 20, &mut rng);
            for &sink in &sinks {
                let id = tree.get(sink).unwrap();
                tree.add_endpoint(id, Route::Core(2));
            }

            // Knock out links used by the tree, but never both directions of
            // one, so the machine stays connected.
            for (parent, direction, _) in tree.hops().into_iter().step_by(3) {
                topology.remove_link(tree.chip(parent), direction);
            }
            assert!(has_dead_links(&tree, &topology));

            let graph = topology.link_graph();
            let repaired = avoid_dead_links(tree, &topology, &graph).unwrap();
            assert!(!has_dead_links(&repaired, &topology));
            let reached = assert_tree(&repaired, &topology);
            assert_eq!(reached.len(), repaired.len());
            for sink in &sinks {
                assert!(reached.contains(sink));
            }
            assert_eq!(repaired.endpoints().len(), sinks.len());
        }
    }
}
