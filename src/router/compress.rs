//! Router table compression by mask widening.
//!
//! An entry is widened one don't-care bit at a time. A width is accepted when
//! every other entry overlapping the widened range sends packets the same way
//! and lies wholly inside it; those entries are then replaced by the widened
//! one. Passes repeat until nothing more merges.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, debug_span};

use super::{
    error::Error,
    table::{RouterTable, RouterTables, RoutingEntry},
};

/// True if the mask's ones are a single run starting at bit 31 (or it is
/// zero).
pub fn is_hole_free(mask: u32) -> bool {
    let inverse = !mask;
    inverse & inverse.wrapping_add(1) == 0
}

/// The hole-free mask with its lowest `n` bits clear.
fn widen(n: u32) -> u32 {
    u32::MAX.checked_shl(n).unwrap_or(0)
}

/// True if the two entries match at least one key in common.
fn overlaps(a: &RoutingEntry, b: &RoutingEntry) -> bool {
    let common = a.mask & b.mask;
    a.key & common == b.key & common
}

/// Tries every width of `entries[candidate]` from narrowest to widest and
/// returns the first mask, with the entries it absorbs, that merges at least
/// two entries.
fn find_merge(
    entries: &[RoutingEntry],
    candidate: usize,
    merged: &[bool],
    reserved_mask: u32,
) -> Option<(u32, Vec<usize>)> {
    let entry = &entries[candidate];
    let first = entry.mask.trailing_zeros() + 1;
    let last = reserved_mask.trailing_zeros();

    'widths: for n in first..=last {
        let mask = widen(n);
        let widened = RoutingEntry {
            key: entry.key & mask,
            mask,
            ..*entry
        };

        let mut absorbed = vec![candidate];
        for (i, other) in entries.iter().enumerate() {
            if i == candidate || !overlaps(&widened, other) {
                continue;
            }
            let contained = other.mask & mask == mask;
            if merged[i] || !contained || other.routes != entry.routes {
                continue 'widths;
            }
            absorbed.push(i);
        }
        if absorbed.len() >= 2 {
            return Some((mask, absorbed));
        }
    }
    None
}

/// One pass over the table, merging wherever possible. Merged entries take
/// the place of the first entry they absorbed.
fn merge_pass(entries: &[RoutingEntry], reserved_mask: u32) -> Vec<RoutingEntry> {
    let mut merged = vec![false; entries.len()];
    let mut out = Vec::with_capacity(entries.len());

    for (i, entry) in entries.iter().enumerate() {
        if merged[i] {
            continue;
        }
        if entry.mask & reserved_mask == reserved_mask {
            if let Some((mask, absorbed)) = find_merge(entries, i, &merged, reserved_mask) {
                for j in absorbed {
                    merged[j] = true;
                }
                out.push(RoutingEntry {
                    key: entry.key & mask,
                    mask,
                    routes: entry.routes,
                    incoming: None,
                    defaultable: false,
                });
                continue;
            }
        }
        merged[i] = true;
        out.push(*entry);
    }
    out
}

/// Rejects any mask with a hole in it, or a key with bits the mask does
/// not cover.
pub fn check_masks(table: &RouterTable) -> Result<(), Error> {
    match table
        .entries()
        .iter()
        .find(|entry| !is_hole_free(entry.mask) || entry.key & !entry.mask != 0)
    {
        Some(entry) => Err(Error::InvalidMaskConfiguration {
            chip: Some(table.chip),
            key: entry.key,
            mask: entry.mask,
        }),
        None => Ok(()),
    }
}

/// Compresses one table until no entry can absorb another, then checks it
/// fits in `capacity` entries.
pub fn compress_table(
    table: &RouterTable,
    reserved_mask: u32,
    capacity: usize,
) -> Result<RouterTable, Error> {
    let span = debug_span!("compress", chip = %table.chip);
    let _enter = span.enter();

    check_masks(table)?;
    let mut entries = table.entries().to_vec();
    loop {
        let next = merge_pass(&entries, reserved_mask);
        let done = next.len() == entries.len();
        entries = next;
        if done {
            break;
        }
    }

    debug!("reduced from {} to {} entries", table.len(), entries.len());
    if entries.len() > capacity {
        return Err(Error::CapacityExceeded {
            chip: table.chip,
            entries: entries.len(),
            capacity,
        });
    }
    Ok(RouterTable::with_entries(table.chip, entries))
}

/// Compresses every table independently. Fails on the first chip whose table
/// is malformed or still too big.
pub fn compress_tables(
    tables: &RouterTables,
    reserved_mask: u32,
    capacity: usize,
) -> Result<RouterTables, Error> {
    for table in tables.iter() {
        check_masks(table)?;
    }

    #[cfg(feature = "parallel")]
    let compressed = tables
        .tables()
        .par_iter()
        .map(|table| compress_table(table, reserved_mask, capacity))
        .collect::<Result<Vec<_>, Error>>()?;
    #[cfg(not(feature = "parallel"))]
    let compressed = tables
        .iter()
        .map(|table| compress_table(table, reserved_mask, capacity))
        .collect::<Result<Vec<_>, Error>>()?;

    debug!(
        "compressed {} tables from {} to {} entries",
        tables.len(),
        tables.n_entries(),
        compressed.iter().map(RouterTable::len).sum::<usize>()
    );
    Ok(RouterTables::new(compressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::machine::{ChipCoord, Direction, Route, RouteSet};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const RESERVED: u32 = 0xFFFF_0000;

    fn entry(key: u32, mask: u32, routes: RouteSet) -> RoutingEntry {
        RoutingEntry {
            key,
            mask,
            routes,
            incoming: None,
            defaultable: false,
        }
    }

    fn table(entries: Vec<RoutingEntry>) -> RouterTable {
        RouterTable::with_entries(ChipCoord::new(0, 0), entries)
    }

    #[test]
    fn hole_free_masks() {
        assert!(is_hole_free(0xFFFF_F800));
        assert!(is_hole_free(u32::MAX));
        assert!(is_hole_free(0));
        assert!(!is_hole_free(0xFFFF_08FF));
        assert!(!is_hole_free(0x0000_FFFF));
    }

    #[test]
    fn merges_neighbouring_ranges() {
        let routes = RouteSet::from(Route::Link(Direction::North));
        let original = table(vec![
            entry(0x1234_0000, 0xFFFF_F800, routes),
            entry(0x1234_0800, 0xFFFF_F800, routes),
        ]);
        let compressed = compress_table(&original, RESERVED, 1024).unwrap();
        assert_eq!(
            compressed.entries(),
            &[entry(0x1234_0000, 0xFFFF_F000, routes)]
        );
    }

    #[test]
    fn different_routes_block_a_width() {
        let north = RouteSet::from(Route::Link(Direction::North));
        let core = RouteSet::from(Route::Core(3));
        let original = table(vec![
            entry(0x0001_0000, 0xFFFF_F800, north),
            entry(0x0001_0800, 0xFFFF_F800, core),
            entry(0x0001_1000, 0xFFFF_F800, north),
        ]);
        let compressed = compress_table(&original, RESERVED, 1024).unwrap();
        assert_eq!(compressed.entries(), original.entries());
    }

    #[test]
    fn unreserved_entries_are_left_alone() {
        let routes = RouteSet::from(Route::Core(1));
        let original = table(vec![
            entry(0x0000_0000, 0xFF00_0000, routes),
            entry(0x0100_0000, 0xFF00_0000, routes),
        ]);
        let compressed = compress_table(&original, RESERVED, 1024).unwrap();
        assert_eq!(compressed.entries(), original.entries());
    }

    #[test]
    fn merged_entries_are_not_defaultable() {
        let routes = RouteSet::from(Route::Link(Direction::East));
        let mut a = entry(0x0002_0000, 0xFFFF_FF00, routes);
        a.incoming = Some(Route::Link(Direction::West));
        a.defaultable = true;
        let mut b = a;
        b.key = 0x0002_0100;
        let compressed = compress_table(&table(vec![a, b]), RESERVED, 1024).unwrap();
        assert_eq!(compressed.len(), 1);
        assert!(!compressed.entries()[0].defaultable);
        assert_eq!(compressed.entries()[0].incoming, None);
    }

    #[test]
    fn too_many_entries() {
        let entries = (0..1025u32)
            .map(|i| entry(i << 11, 0xFFFF_F800, RouteSet::from_bits(i + 1)))
            .collect();
        assert_eq!(
            compress_table(&table(entries), RESERVED, 1024),
            Err(Error::CapacityExceeded {
                chip: ChipCoord::new(0, 0),
                entries: 1025,
                capacity: 1024,
            })
        );
    }

    #[test]
    fn holed_mask_is_rejected() {
        let routes = RouteSet::from(Route::Core(1));
        let tables = RouterTables::new(vec![table(vec![entry(0x1000_0000, 0xFFFF_08FF, routes)])]);
        assert!(matches!(
            compress_tables(&tables, RESERVED, 1024),
            Err(Error::InvalidMaskConfiguration { chip: Some(_), .. })
        ));
    }

    fn random_table(rng: &mut StdRng) -> RouterTable {
        // Blocks of 256 keys under one reserved prefix, three route choices so
        // that some neighbours merge and some don't.
        let choices = [
            RouteSet::from(Route::Core(1)),
            RouteSet::from(Route::Link(Direction::South)),
            RouteSet::from(Route::Core(7)),
        ];
        let mut entries = Vec::new();
        for block in 0..200u32 {
            if rng.gen_bool(0.7) {
                let routes = choices[rng.gen_range(0..choices.len())];
                entries.push(entry(0x00AB_0000 | block << 8, 0xFFFF_FF00, routes));
            }
        }
        entries.push(entry(0x00CD_0000, 0xFFFF_0000, choices[0]));
        table(entries)
    }

    #[test]
    fn every_key_keeps_its_routes() {
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..8 {
            let original = random_table(&mut rng);
            let compressed = compress_table(&original, RESERVED, 1024).unwrap();
            assert!(compressed.len() <= original.len());
            for e in original.entries() {
                for key in [e.key, e.key | 0x7F, e.last_key()] {
                    let before = original.lookup(key).map(|e| e.routes);
                    let after = compressed.lookup(key).map(|e| e.routes);
                    assert_eq!(before, after, "key {:#x}", key);
                }
            }
        }
    }

    #[test]
    fn compressing_twice_changes_nothing() {
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..8 {
            let once = compress_table(&random_table(&mut rng), RESERVED, 1024).unwrap();
            let twice = compress_table(&once, RESERVED, 1024).unwrap();
            assert_eq!(once, twice);
        }
    }
}
