pub mod router;

pub use router::{
    error::Error,
    machine::{ChipCoord, Direction, Route, RouteSet, Topology},
    partition::Partition,
    table::{RouterTable, RouterTables, RoutingEntry},
    MulticastRouter, RouterConfig,
};
