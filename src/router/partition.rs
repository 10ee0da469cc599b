use typed_builder::TypedBuilder;

use super::{
    compress::is_hole_free,
    error::Error,
    machine::{ChipCoord, Route, Topology},
};

/// One multicast group: a single source fanning out to every sink, with the
/// key and mask already allocated to it.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct Partition {
    /// The chip packets are sent from.
    pub source: ChipCoord,
    /// Where packets enter the source chip's router: the sending core, or
    /// the link an external device is attached to.
    pub source_route: Route,
    /// Every (chip, core or external link) the packets must reach.
    #[builder(default)]
    pub sinks: Vec<(ChipCoord, Route)>,
    pub key: u32,
    pub mask: u32,
}

impl Partition {
    /// The distinct sink chips, in first-seen order.
    pub fn sink_chips(&self) -> Vec<ChipCoord> {
        let mut chips = Vec::with_capacity(self.sinks.len());
        for (chip, _) in &self.sinks {
            if !chips.contains(chip) {
                chips.push(*chip);
            }
        }
        chips
    }

    /// Every key this partition may send.
    pub fn keys(&self) -> impl Iterator<Item = u32> {
        self.key..=(self.key | !self.mask)
    }

    /// Checks the partition can be routed on `topology` at all.
    pub fn validate(&self, topology: &Topology) -> Result<(), Error> {
        if !topology.contains(self.source) {
            return Err(Error::DeadSource(self.source));
        }
        if let Some((sink, _)) = self.sinks.iter().find(|(chip, _)| !topology.contains(*chip)) {
            return Err(Error::InvalidPartition {
                source: self.source,
                sink: *sink,
            });
        }
        if !is_hole_free(self.mask) || self.key & !self.mask != 0 {
            return Err(Error::InvalidMaskConfiguration {
                chip: None,
                key: self.key,
                mask: self.mask,
            });
        }
        Ok(())
    }
}
