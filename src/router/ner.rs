//! Neighbour Exploring Routing (NER), after J. Navaridas et al., "SpiNNaker:
//! Enhanced multicast routing", Parallel Computing (2014).
//!
//! Sinks are visited nearest first. Each one is joined to the closest chip
//! already in the tree (or to the source when nothing is close enough) with a
//! longest-dimension-first path. The tree assumes every link works;
//! [`super::repair`] deals with the ones that don't.

use rand::{seq::SliceRandom, Rng};
use tracing::trace;

use super::{
    geometry::{concentric_ring_cells, concentric_rings, longest_dimension_first},
    machine::{ChipCoord, Topology},
    tree::RoutingTree,
};

/// Builds a tree from `source` spanning every chip in `sinks`.
///
/// `radius` bounds how far from a sink an existing tree chip may be to count
/// as its attachment point. Ties (sink order, dimension order, ring cells) are
/// broken with `rng`.
pub fn ner_tree<R: Rng + ?Sized>(
    source: ChipCoord,
    sinks: &[ChipCoord],
    topology: &Topology,
    radius: u32,
    rng: &mut R,
) -> RoutingTree {
    let mut tree = RoutingTree::new(source);

    let mut ordered: Vec<(u32, u32, ChipCoord)> = sinks
        .iter()
        .map(|&sink| (topology.distance(source, sink), rng.gen(), sink))
        .collect();
    ordered.sort_unstable();

    let ring_cells = concentric_ring_cells(radius);
    for (_, _, sink) in ordered {
        if tree.contains(sink) {
            continue;
        }

        let neighbour = attachment_point(&tree, sink, topology, radius, ring_cells, rng)
            .unwrap_or(source);
        let vector = topology.shortest_vector(neighbour, sink, rng);
        let mut hops = longest_dimension_first(vector, neighbour, topology.bounds(), rng);

        // Join at the last hop already in the tree so the new branch can't
        // cross an old one.
        let mut last = match hops.iter().rposition(|(_, chip)| tree.contains(*chip)) {
            Some(pos) => {
                let chip = hops[pos].1;
                hops.drain(..=pos);
                chip
            }
            None => neighbour,
        };
        trace!(
            "sink {} joins tree at {} with {} new hops",
            sink,
            last,
            hops.len()
        );

        for (direction, chip) in hops {
            if !tree.contains(chip) {
                let node = tree.add_node(chip);
                if let Some(parent) = tree.get(last) {
                    tree.add_hop(parent, direction, node);
                }
            }
            last = chip;
        }
    }

    tree
}

/// The tree chip a new branch towards `sink` should grow from, if one lies
/// within `radius` hops.
///
/// Large trees are searched ring by ring outwards from the sink; small trees
/// are scanned chip by chip for the closest one.
fn attachment_point<R: Rng + ?Sized>(
    tree: &RoutingTree,
    sink: ChipCoord,
    topology: &Topology,
    radius: u32,
    ring_cells: usize,
    rng: &mut R,
) -> Option<ChipCoord> {
    if ring_cells * 3 < tree.len() {
        let mut rings = concentric_rings(radius, sink).peekable();
        let mut ring = Vec::new();
        while let Some((r, first)) = rings.next() {
            ring.clear();
            ring.push(first);
            while let Some((_, cell)) = rings.next_if(|(next, _)| *next == r) {
                ring.push(cell);
            }
            ring.shuffle(rng);
            let hit = ring
                .iter()
                .filter_map(|&cell| topology.normalise(cell))
                .find(|&chip| tree.contains(chip));
            if hit.is_some() {
                return hit;
            }
        }
        None
    } else {
        tree.chips()
            .map(|chip| (topology.distance(chip, sink), chip))
            .filter(|(distance, _)| *distance <= radius)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, chip)| chip)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::router::tree::Child;
    use hashbrown::HashSet;
    use rand::{rngs::StdRng, SeedableRng};

    /// Walks the tree from its root and checks that no chip is met twice and
    /// every hop is a single step in its labelled direction.
    pub(crate) fn assert_tree(tree: &RoutingTree, topology: &Topology) -> HashSet<ChipCoord> {
        let mut seen = HashSet::new();
        let mut stack = vec![tree.root()];
        while let Some(node) = stack.pop() {
            let chip = tree.chip(node);
            assert!(seen.insert(chip), "chip {} reached twice", chip);
            for child in tree.children(node) {
                if let Child::Hop(direction, child) = child {
                    let (dx, dy) = direction.to_vector();
                    let expected = topology
                        .normalise(ChipCoord::new(chip.x + dx, chip.y + dy))
                        .expect("hop leaves the grid");
                    assert_eq!(tree.chip(*child), expected);
                    stack.push(*child);
                }
            }
        }
        seen
    }

    fn random_chips(topology: &Topology, n: usize, rng: &mut StdRng) -> Vec<ChipCoord> {
        let chips = topology.chips();
        chips.choose_multiple(rng, n).copied().collect()
    }

    #[test]
    fn single_path_across_board() {
        let topology = Topology::full(28, 16, false);
        let mut rng = StdRng::seed_from_u64(1);
        let sink = ChipCoord::new(7, 11);
        let tree = ner_tree(ChipCoord::new(0, 0), &[sink], &topology, 20, &mut rng);

        assert_eq!(tree.len(), 12);
        assert_eq!(tree.hops().len(), 11);
        assert_eq!(tree.get(sink).map(|id| tree.descendants(id).len()), Some(1));
        assert_tree(&tree, &topology);
    }

    #[test]
    fn small_torus_uses_one_hop() {
        let topology = Topology::full(2, 2, true);
        let mut rng = StdRng::seed_from_u64(3);
        let tree = ner_tree(
            ChipCoord::new(0, 0),
            &[ChipCoord::new(1, 1)],
            &topology,
            20,
            &mut rng,
        );
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.hops().len(), 1);
    }

    #[test]
    fn sink_on_source_adds_nothing() {
        let topology = Topology::full(4, 4, false);
        let mut rng = StdRng::seed_from_u64(0);
        let source = ChipCoord::new(2, 2);
        let tree = ner_tree(source, &[source, source], &topology, 20, &mut rng);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn spans_every_sink() {
        for (wrap, seed) in [(false, 11), (true, 12), (false, 13), (true, 14)] {
            let topology = Topology::full(24, 24, wrap);
            let mut rng = StdRng::seed_from_u64(seed);
            let source = ChipCoord::new(5, 17);
            let sinks = random_chips(&topology, 80, &mut rng);
            let tree = ner_tree(source, &sinks, &topology, 4, &mut rng);

            let reached = assert_tree(&tree, &topology);
            assert_eq!(reached.len(), tree.len(), "orphaned nodes");
            for sink in sinks {
                assert!(reached.contains(&sink), "sink {} missed", sink);
            }
        }
    }

    #[test]
    fn ring_search_on_large_tree() {
        // With radius 1 the ring holds 7 cells, so once the tree passes 21
        // chips attachment points come from the ring scan.
        let topology = Topology::full(32, 32, true);
        let mut rng = StdRng::seed_from_u64(5);
        let sinks = random_chips(&topology, 300, &mut rng);
        let tree = ner_tree(ChipCoord::new(0, 0), &sinks, &topology, 1, &mut rng);
        let reached = assert_tree(&tree, &topology);
        assert!(sinks.iter().all(|sink| reached.contains(sink)));
    }

    #[test]
    fn same_seed_same_tree() {
        let topology = Topology::full(16, 16, true);
        let sinks: Vec<_> = (0..16).map(|i| ChipCoord::new(i, (i * 7) % 16)).collect();
        let build = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            ner_tree(ChipCoord::new(3, 3), &sinks, &topology, 20, &mut rng)
                .chips()
                .collect::<Vec<_>>()
        };
        assert_eq!(build(99), build(99));
    }
}
