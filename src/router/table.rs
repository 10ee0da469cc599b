//! Router tables and the compiler from trees to table entries.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

use super::{
    error::Error,
    hex::HexDisplayExt,
    machine::{ChipCoord, Route, RouteSet, Topology},
    partition::Partition,
    tree::{Child, RoutingTree},
};

/// Size of one encoded entry: route word, key, mask.
pub const ENTRY_BYTES: usize = 12;

/// A single router table row. A packet matches when `key & mask == self.key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct RoutingEntry {
    pub key: u32,
    pub mask: u32,
    pub routes: RouteSet,
    /// Where matching packets arrive from, when known.
    pub incoming: Option<Route>,
    /// The router would send matching packets the same way with no entry at
    /// all, so the entry may be left out on hardware with default routing.
    pub defaultable: bool,
}

impl RoutingEntry {
    pub fn matches(&self, key: u32) -> bool {
        key & self.mask == self.key
    }

    /// Highest key this entry matches.
    pub fn last_key(&self) -> u32 {
        self.key | !self.mask
    }
}

impl fmt::Display for RoutingEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} -> {}", self.key.hex(), self.mask.hex(), self.routes)?;
        if self.defaultable {
            f.write_str(" (defaultable)")?;
        }
        Ok(())
    }
}

/// The ordered entries of one chip's router. Earlier entries win.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct RouterTable {
    pub chip: ChipCoord,
    entries: Vec<RoutingEntry>,
}

impl RouterTable {
    pub fn new(chip: ChipCoord) -> Self {
        Self {
            chip,
            entries: Vec::new(),
        }
    }

    pub fn with_entries(chip: ChipCoord, entries: Vec<RoutingEntry>) -> Self {
        Self { chip, entries }
    }

    pub fn push(&mut self, entry: RoutingEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[RoutingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The first entry matching `key`, as the router would pick it.
    pub fn lookup(&self, key: u32) -> Option<&RoutingEntry> {
        self.entries.iter().find(|entry| entry.matches(key))
    }

    /// Encodes the table as the router loads it: an entry count followed by
    /// (route word, key, mask) per entry, all little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 4 + self.entries.len() * ENTRY_BYTES];
        LittleEndian::write_u32(&mut buf[..4], self.entries.len() as u32);
        for (entry, chunk) in self
            .entries
            .iter()
            .zip(buf[4..].chunks_exact_mut(ENTRY_BYTES))
        {
            LittleEndian::write_u32(&mut chunk[0..4], entry.routes.bits());
            LittleEndian::write_u32(&mut chunk[4..8], entry.key);
            LittleEndian::write_u32(&mut chunk[8..12], entry.mask);
        }
        buf
    }

    /// Inverse of [`RouterTable::encode`]. The hardware layout carries no
    /// incoming route, so decoded entries have none and are never
    /// defaultable.
    pub fn decode(chip: ChipCoord, buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 4 {
            return Err(Error::CouldNotDecodeTables);
        }
        let count = LittleEndian::read_u32(&buf[..4]) as usize;
        let body = &buf[4..];
        if count.checked_mul(ENTRY_BYTES) != Some(body.len()) {
            return Err(Error::CouldNotDecodeTables);
        }

        let mut entries = Vec::with_capacity(count);
        for chunk in body.chunks_exact(ENTRY_BYTES) {
            let word = LittleEndian::read_u32(&chunk[0..4]);
            let routes = RouteSet::from_bits(word);
            if routes.bits() != word {
                return Err(Error::CouldNotDecodeTables);
            }
            entries.push(RoutingEntry {
                key: LittleEndian::read_u32(&chunk[4..8]),
                mask: LittleEndian::read_u32(&chunk[8..12]),
                routes,
                incoming: None,
                defaultable: false,
            });
        }
        Ok(Self { chip, entries })
    }
}

impl fmt::Display for RouterTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "chip {}: {} entries", self.chip, self.entries.len())?;
        for entry in &self.entries {
            writeln!(f, "  {}", entry)?;
        }
        Ok(())
    }
}

/// Every chip's table, ordered by chip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct RouterTables {
    tables: Vec<RouterTable>,
}

impl RouterTables {
    pub fn new(mut tables: Vec<RouterTable>) -> Self {
        tables.sort_unstable_by_key(|table| table.chip);
        Self { tables }
    }

    pub fn get(&self, chip: ChipCoord) -> Option<&RouterTable> {
        self.tables
            .binary_search_by_key(&chip, |table| table.chip)
            .ok()
            .map(|i| &self.tables[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouterTable> {
        self.tables.iter()
    }

    pub fn tables(&self) -> &[RouterTable] {
        &self.tables
    }

    /// Number of chips with a table.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Entries summed over every chip.
    pub fn n_entries(&self) -> usize {
        self.tables.iter().map(RouterTable::len).sum()
    }

    /// Largest single table.
    pub fn max_entries(&self) -> usize {
        self.tables.iter().map(RouterTable::len).max().unwrap_or(0)
    }

    pub fn to_bytes(&self) -> Result<AlignedVec, Error> {
        rkyv::to_bytes::<_, 4096>(self).map_err(|_| Error::CouldNotEncodeTables)
    }

    /// Validates and deserializes tables written by
    /// [`RouterTables::to_bytes`]. `bytes` must be suitably aligned.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self>(bytes).map_err(|_| Error::CouldNotDecodeTables)
    }
}

/// What one partition needs from one chip's router, before keys are
/// attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    pub routes: RouteSet,
    pub incoming: Option<Route>,
}

impl PartitionEntry {
    /// A packet arriving on link `l` and leaving only through the opposite
    /// link is what the router does by default.
    pub fn defaultable(&self) -> bool {
        match self.incoming {
            Some(Route::Link(direction)) => {
                self.routes == RouteSet::from(Route::Link(direction.opposite()))
            }
            _ => false,
        }
    }
}

/// Walks a repaired tree and emits the entry each chip needs for it.
///
/// Every chip the tree reaches gets an entry, even one that sends nowhere,
/// so no packet forwarded along the tree meets a router without a match.
/// Every hop is checked against the live topology; one that does not exist
/// means the tree was never repaired.
pub fn compile_tree(
    tree: &RoutingTree,
    source_route: Route,
    topology: &Topology,
) -> Result<Vec<(ChipCoord, PartitionEntry)>, Error> {
    let mut out = Vec::with_capacity(tree.len());
    let mut stack = vec![(tree.root(), Some(source_route))];

    while let Some((node, incoming)) = stack.pop() {
        let chip = tree.chip(node);
        let mut routes = RouteSet::new();
        for child in tree.children(node) {
            match *child {
                Child::Endpoint(route) => routes.insert(route),
                Child::Hop(direction, next) => {
                    if topology.link(chip, direction) != Some(tree.chip(next)) {
                        return Err(Error::TopologyInconsistency { chip, direction });
                    }
                    routes.insert(Route::Link(direction));
                    stack.push((next, Some(Route::Link(direction.opposite()))));
                }
            }
        }
        out.push((chip, PartitionEntry { routes, incoming }));
    }

    Ok(out)
}

/// Entries grouped by chip, each tagged with the index of the partition it
/// belongs to.
#[derive(Debug, Clone, Default)]
pub struct TablesByPartition {
    by_chip: HashMap<ChipCoord, Vec<(usize, PartitionEntry)>>,
}

impl TablesByPartition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `entry` for `partition` on `chip`. A second entry for the same
    /// partition and chip is folded into the first.
    pub fn add(&mut self, chip: ChipCoord, partition: usize, entry: PartitionEntry) {
        let entries = self.by_chip.entry(chip).or_default();
        match entries.iter_mut().find(|(index, _)| *index == partition) {
            Some((_, existing)) => {
                existing.routes = existing
                    .routes
                    .iter()
                    .chain(entry.routes.iter())
                    .collect();
                if existing.incoming != entry.incoming {
                    existing.incoming = None;
                }
            }
            None => entries.push((partition, entry)),
        }
    }

    pub fn get(&self, chip: ChipCoord) -> Option<&[(usize, PartitionEntry)]> {
        self.by_chip.get(&chip).map(Vec::as_slice)
    }

    /// Chips with at least one entry, in order.
    pub fn chips(&self) -> Vec<ChipCoord> {
        let mut chips: Vec<_> = self.by_chip.keys().copied().collect();
        chips.sort_unstable();
        chips
    }

    pub fn n_entries(&self) -> usize {
        self.by_chip.values().map(Vec::len).sum()
    }

    /// Attaches each partition's key and mask, ordering every chip's
    /// entries by partition. An entry tagged with an index outside
    /// `partitions` fails the whole build.
    pub fn build_tables(&self, partitions: &[Partition]) -> Result<RouterTables, Error> {
        let tables = self
            .by_chip
            .iter()
            .map(|(&chip, entries)| {
                let mut entries = entries.clone();
                entries.sort_unstable_by_key(|(index, _)| *index);
                let entries = entries
                    .into_iter()
                    .map(|(index, entry)| {
                        let partition = partitions
                            .get(index)
                            .ok_or(Error::UnknownPartition(index))?;
                        Ok(RoutingEntry {
                            key: partition.key,
                            mask: partition.mask,
                            routes: entry.routes,
                            incoming: entry.incoming,
                            defaultable: entry.defaultable(),
                        })
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                Ok(RouterTable::with_entries(chip, entries))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(RouterTables::new(tables))
    }
}
