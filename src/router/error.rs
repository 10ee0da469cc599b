use std::fmt;

use super::{
    hex::HexDisplayExt,
    machine::{ChipCoord, Direction},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A tree hop uses a link the topology does not have.
    TopologyInconsistency {
        chip: ChipCoord,
        direction: Direction,
    },
    /// No live path joins part of a tree to the rest of it.
    UnreachableDestination {
        source: ChipCoord,
        sink: ChipCoord,
    },
    /// A mask with a gap in its run of ones, or a key with bits outside its
    /// mask.
    InvalidMaskConfiguration {
        chip: Option<ChipCoord>,
        key: u32,
        mask: u32,
    },
    /// A table still holds more entries than the router after compression.
    CapacityExceeded {
        chip: ChipCoord,
        entries: usize,
        capacity: usize,
    },
    /// A partition whose source is not a live chip.
    DeadSource(ChipCoord),
    /// A partition delivering to a chip the topology does not hold.
    InvalidPartition {
        source: ChipCoord,
        sink: ChipCoord,
    },
    InvalidRoute(u8),
    UnknownDirection(String),
    /// A table entry names a partition the caller did not supply.
    UnknownPartition(usize),
    CouldNotEncodeTables,
    CouldNotDecodeTables,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::TopologyInconsistency { chip, direction } => write!(
                f,
                "tree uses link {} of chip {} which is not alive",
                direction, chip
            ),
            Error::UnreachableDestination { source, sink } => write!(
                f,
                "no live path from {} can reach {}",
                source, sink
            ),
            Error::InvalidMaskConfiguration { chip, key, mask } => {
                write!(f, "invalid key {} / mask {}", key.hex(), mask.hex())?;
                if let Some(chip) = chip {
                    write!(f, " on chip {}", chip)?;
                }
                Ok(())
            }
            Error::CapacityExceeded {
                chip,
                entries,
                capacity,
            } => write!(
                f,
                "table for chip {} has {} entries after compression (capacity {})",
                chip, entries, capacity
            ),
            Error::DeadSource(chip) => {
                write!(f, "partition sourced from dead chip {}", chip)
            }
            Error::InvalidPartition { source, sink } => write!(
                f,
                "partition from {} names sink {} which is not a live chip",
                source, sink
            ),
            Error::InvalidRoute(id) => write!(f, "invalid route id {}", id),
            Error::UnknownDirection(name) => {
                write!(f, "unknown link direction {:?}", name)
            }
            Error::UnknownPartition(index) => {
                write!(f, "entry for unknown partition {}", index)
            }
            Error::CouldNotEncodeTables => f.write_str("could not encode router tables"),
            Error::CouldNotDecodeTables => f.write_str("could not decode router tables"),
        }
    }
}

impl std::error::Error for Error {}
