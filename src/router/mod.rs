pub mod compress;
pub mod error;
pub mod geometry;
pub mod hex;
pub mod machine;
pub mod ner;
pub mod partition;
pub mod repair;
pub mod table;
pub mod tree;

// Routing runs in four stages per partition: a tree is grown over the ideal
// grid, repaired against the live links, compiled into one entry per chip and
// finally merged with every other partition's entries and compressed chip by
// chip. Partitions never look at each other's state until the merge, so they
// are routed in parallel; each one draws its own generator from the
// configured seed up front so the result does not depend on which thread ran
// it.

use rand::{rngs::StdRng, Rng, SeedableRng};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, debug_span};
use typed_builder::TypedBuilder;

use self::{
    compress::compress_tables,
    error::Error,
    machine::{ChipCoord, LinkGraph, Topology},
    ner::ner_tree,
    partition::Partition,
    repair::avoid_dead_links,
    table::{compile_tree, PartitionEntry, RouterTables, TablesByPartition},
};

/// Router table capacity of the hardware.
pub const ROUTER_CAPACITY: usize = 1024;

#[derive(Debug, Clone, TypedBuilder)]
pub struct RouterConfig {
    /// How far from a sink the tree builder looks for a chip to attach to.
    #[builder(default = 20)]
    pub radius: u32,
    #[builder(default = 0)]
    pub seed: u64,
    /// Entries each router can hold after compression.
    #[builder(default = ROUTER_CAPACITY)]
    pub capacity: usize,
    /// High bits an entry's mask must already fix for it to be widened by
    /// the compressor.
    #[builder(default = 0xFFFF_0000)]
    pub reserved_mask: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Turns partitions into per-chip router tables for one machine.
pub struct MulticastRouter {
    topology: Topology,
    graph: LinkGraph,
    config: RouterConfig,
}

impl MulticastRouter {
    pub fn new(topology: Topology, config: RouterConfig) -> Self {
        let graph = topology.link_graph();
        Self {
            topology,
            graph,
            config,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Routes a single partition, returning the entry each chip on its tree
    /// needs.
    pub fn route_partition<R: Rng + ?Sized>(
        &self,
        index: usize,
        partition: &Partition,
        rng: &mut R,
    ) -> Result<Vec<(ChipCoord, PartitionEntry)>, Error> {
        let span = debug_span!("partition", index, source = %partition.source);
        let _enter = span.enter();

        partition.validate(&self.topology)?;
        let sinks = partition.sink_chips();
        let mut tree = ner_tree(
            partition.source,
            &sinks,
            &self.topology,
            self.config.radius,
            rng,
        );
        for &(chip, route) in &partition.sinks {
            let node = tree.get(chip).ok_or(Error::UnreachableDestination {
                source: partition.source,
                sink: chip,
            })?;
            tree.add_endpoint(node, route);
        }
        debug!("tree spans {} chips for {} sinks", tree.len(), sinks.len());

        let tree = avoid_dead_links(tree, &self.topology, &self.graph)?;
        let entries = compile_tree(&tree, partition.source_route, &self.topology)?;
        debug!("{} entries emitted", entries.len());
        Ok(entries)
    }

    /// Routes every partition and groups the resulting entries by chip.
    pub fn route(&self, partitions: &[Partition]) -> Result<TablesByPartition, Error> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let jobs: Vec<(usize, &Partition, u64)> = partitions
            .iter()
            .enumerate()
            .map(|(index, partition)| (index, partition, rng.gen()))
            .collect();

        let route_one = |(index, partition, seed): (usize, &Partition, u64)| {
            let mut rng = StdRng::seed_from_u64(seed);
            self.route_partition(index, partition, &mut rng)
                .map(|entries| (index, entries))
        };
        #[cfg(feature = "parallel")]
        let routed = jobs
            .into_par_iter()
            .map(route_one)
            .collect::<Result<Vec<_>, Error>>()?;
        #[cfg(not(feature = "parallel"))]
        let routed = jobs
            .into_iter()
            .map(route_one)
            .collect::<Result<Vec<_>, Error>>()?;

        let mut by_partition = TablesByPartition::new();
        for (index, entries) in routed {
            for (chip, entry) in entries {
                by_partition.add(chip, index, entry);
            }
        }
        debug!(
            "routed {} partitions onto {} chips",
            partitions.len(),
            by_partition.chips().len()
        );
        Ok(by_partition)
    }

    /// Compresses tables to fit the configured capacity.
    pub fn compress(&self, tables: &RouterTables) -> Result<RouterTables, Error> {
        compress_tables(tables, self.config.reserved_mask, self.config.capacity)
    }

    /// Routes, builds and compresses: the whole pipeline. Returns the
    /// uncompressed and compressed tables.
    pub fn run(&self, partitions: &[Partition]) -> Result<(RouterTables, RouterTables), Error> {
        let tables = self.route(partitions)?.build_tables(partitions)?;
        let compressed = self.compress(&tables)?;
        Ok((tables, compressed))
    }
}
