use std::{fmt, str::FromStr};

use hashbrown::HashMap;
use petgraph::graphmap::DiGraphMap;
use rand::Rng;
use rkyv::{Archive, Deserialize, Serialize};

use super::{
    error::Error,
    geometry::{
        shortest_mesh_path, shortest_mesh_path_length, shortest_torus_path,
        shortest_torus_path_length, to_xyz, HexVector,
    },
};

/// Highest core number a route can deliver to.
pub const MAX_CORE: u8 = 17;

/// Number of inter-chip links on every chip.
pub const N_LINKS: usize = 6;

/// A chip address in the grid. Coordinates outside the grid are valid values
/// (ring scans produce them) but never name a chip of a [`Topology`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Archive,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
pub struct ChipCoord {
    pub x: i32,
    pub y: i32,
}

impl ChipCoord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for ChipCoord {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for ChipCoord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// One of the six links leaving a chip, declared in hardware link id order.
#[repr(u8)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Archive,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
pub enum Direction {
    East,
    NorthEast,
    North,
    West,
    SouthWest,
    South,
}

impl Direction {
    pub const ALL: [Direction; N_LINKS] = [
        Direction::East,
        Direction::NorthEast,
        Direction::North,
        Direction::West,
        Direction::SouthWest,
        Direction::South,
    ];

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    /// The link on the far chip which leads back to this chip.
    pub fn opposite(self) -> Self {
        Self::ALL[(self.id() as usize + 3) % N_LINKS]
    }

    /// The (dx, dy) step taken by following this link.
    pub fn to_vector(self) -> (i32, i32) {
        match self {
            Direction::East => (1, 0),
            Direction::NorthEast => (1, 1),
            Direction::North => (0, 1),
            Direction::West => (-1, 0),
            Direction::SouthWest => (-1, -1),
            Direction::South => (0, -1),
        }
    }

    /// Inverse of [`Direction::to_vector`].
    ///
    /// On a 2×N or N×2 torus a packet can also "spiral" round the Z axis, so
    /// the otherwise impossible steps (1, -1) and (-1, 1) are accepted as
    /// south-west and north-east respectively.
    pub fn from_vector(vector: (i32, i32)) -> Option<Self> {
        match vector {
            (1, 0) => Some(Direction::East),
            (-1, 0) => Some(Direction::West),
            (0, 1) => Some(Direction::North),
            (0, -1) => Some(Direction::South),
            (1, 1) => Some(Direction::NorthEast),
            (-1, -1) => Some(Direction::SouthWest),
            (1, -1) => Some(Direction::SouthWest),
            (-1, 1) => Some(Direction::NorthEast),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::East => "east",
            Direction::NorthEast => "north_east",
            Direction::North => "north",
            Direction::West => "west",
            Direction::SouthWest => "south_west",
            Direction::South => "south",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Direction {
    type Err = Error;

    /// Accepts either the link name (`north_east`, `ne`) or its numeric id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if let Ok(id) = lower.parse::<u8>() {
            return Self::from_id(id).ok_or(Error::InvalidRoute(id));
        }
        let direction = match lower.as_str() {
            "east" | "e" => Direction::East,
            "north_east" | "northeast" | "ne" => Direction::NorthEast,
            "north" | "n" => Direction::North,
            "west" | "w" => Direction::West,
            "south_west" | "southwest" | "sw" => Direction::SouthWest,
            "south" | "s" => Direction::South,
            _ => return Err(Error::UnknownDirection(s.to_string())),
        };
        Ok(direction)
    }
}

/// Where a router sends a packet: out of a link, or into a core.
///
/// Route ids follow the router registers: 0-5 are links, 6-23 are cores
/// 0-17.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Archive,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
pub enum Route {
    Link(Direction),
    Core(u8),
}

impl Route {
    /// The route into the numbered core.
    pub fn core(num: u8) -> Result<Self, Error> {
        if num > MAX_CORE {
            return Err(Error::InvalidRoute(num.saturating_add(N_LINKS as u8)));
        }
        Ok(Route::Core(num))
    }

    pub fn from_id(id: u8) -> Result<Self, Error> {
        match Direction::from_id(id) {
            Some(direction) => Ok(Route::Link(direction)),
            None if id <= MAX_CORE + N_LINKS as u8 => {
                Ok(Route::Core(id - N_LINKS as u8))
            }
            None => Err(Error::InvalidRoute(id)),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Route::Link(direction) => direction.id(),
            Route::Core(num) => num.saturating_add(N_LINKS as u8),
        }
    }

    pub fn is_link(self) -> bool {
        matches!(self, Route::Link(_))
    }

    pub fn is_core(self) -> bool {
        !self.is_link()
    }

    pub fn core_num(self) -> Option<u8> {
        match self {
            Route::Core(num) => Some(num),
            Route::Link(_) => None,
        }
    }

    /// Position of this route in a packed route word.
    pub fn bit(self) -> u32 {
        1u32.checked_shl(self.id() as u32).unwrap_or(0)
    }
}

impl From<Direction> for Route {
    fn from(direction: Direction) -> Self {
        Route::Link(direction)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Route::Link(direction) => write!(f, "{}", direction),
            Route::Core(num) => write!(f, "core_{}", num),
        }
    }
}

/// A set of routes packed the way the router stores them: link `l` is bit
/// `l`, core `c` is bit `c + 6`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Archive,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
pub struct RouteSet(u32);

impl RouteSet {
    const VALID_BITS: u32 = (1 << (N_LINKS as u32 + MAX_CORE as u32 + 1)) - 1;

    pub fn new() -> Self {
        Self(0)
    }

    /// Builds a set from a route word, ignoring bits above core 17.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits & Self::VALID_BITS)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn insert(&mut self, route: Route) {
        self.0 |= route.bit();
    }

    pub fn contains(self, route: Route) -> bool {
        self.0 & route.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = Route> {
        (0..=(MAX_CORE + N_LINKS as u8))
            .filter(move |id| self.0 & (1 << id) != 0)
            .filter_map(|id| Route::from_id(id).ok())
    }

    pub fn links(self) -> impl Iterator<Item = Direction> {
        self.iter().filter_map(|route| match route {
            Route::Link(direction) => Some(direction),
            Route::Core(_) => None,
        })
    }

    pub fn cores(self) -> impl Iterator<Item = u8> {
        self.iter().filter_map(Route::core_num)
    }
}

impl From<Route> for RouteSet {
    fn from(route: Route) -> Self {
        Self(route.bit())
    }
}

impl FromIterator<Route> for RouteSet {
    fn from_iter<I: IntoIterator<Item = Route>>(iter: I) -> Self {
        let mut set = RouteSet::new();
        for route in iter {
            set.insert(route);
        }
        set
    }
}

impl fmt::Display for RouteSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for route in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}", route)?;
            first = false;
        }
        Ok(())
    }
}

/// Reverse live-link graph: an edge `a -> b` weighted `d` means chip `b`
/// reaches chip `a` over its link `d`.
pub type LinkGraph = DiGraphMap<ChipCoord, Direction>;

/// The live chips of a machine and, per chip, where each working link leads.
///
/// A topology is built up front (starting from a perfect grid and knocking
/// out whatever is broken) and then only read while routing.
#[derive(Debug, Clone)]
pub struct Topology {
    width: u32,
    height: u32,
    wrap_around: bool,
    chips: HashMap<ChipCoord, [Option<ChipCoord>; N_LINKS]>,
}

impl Topology {
    /// A fully working `width` × `height` grid, torus-wrapped if
    /// `wrap_around` is set.
    pub fn full(width: u32, height: u32, wrap_around: bool) -> Self {
        let mut topology = Self {
            width,
            height,
            wrap_around,
            chips: HashMap::with_capacity((width * height) as usize),
        };
        for x in 0..width as i32 {
            for y in 0..height as i32 {
                let chip = ChipCoord::new(x, y);
                let mut links = [None; N_LINKS];
                for direction in Direction::ALL {
                    let (dx, dy) = direction.to_vector();
                    links[direction.id() as usize] =
                        topology.normalise(ChipCoord::new(x + dx, y + dy));
                }
                topology.chips.insert(chip, links);
            }
        }
        topology
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn has_wrap_around(&self) -> bool {
        self.wrap_around
    }

    /// The (width, height) to wrap hops against, if this is a torus.
    pub fn bounds(&self) -> Option<(u32, u32)> {
        self.wrap_around.then_some((self.width, self.height))
    }

    pub fn contains(&self, chip: ChipCoord) -> bool {
        self.chips.contains_key(&chip)
    }

    pub fn n_chips(&self) -> usize {
        self.chips.len()
    }

    /// Live chips in (x, y) order.
    pub fn chips(&self) -> Vec<ChipCoord> {
        let mut chips: Vec<_> = self.chips.keys().copied().collect();
        chips.sort_unstable();
        chips
    }

    /// Maps an arbitrary coordinate onto the grid: wrapped on a torus,
    /// rejected when out of range on a mesh. Dead chips are not filtered.
    pub fn normalise(&self, chip: ChipCoord) -> Option<ChipCoord> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        if self.wrap_around {
            Some(ChipCoord::new(
                chip.x.rem_euclid(self.width as i32),
                chip.y.rem_euclid(self.height as i32),
            ))
        } else if (0..self.width as i32).contains(&chip.x)
            && (0..self.height as i32).contains(&chip.y)
        {
            Some(chip)
        } else {
            None
        }
    }

    /// Where `direction` leads from `chip`, if both the link and the chip at
    /// its far end are alive.
    pub fn link(&self, chip: ChipCoord, direction: Direction) -> Option<ChipCoord> {
        let target = self.chips.get(&chip)?[direction.id() as usize]?;
        self.contains(target).then_some(target)
    }

    /// Live links leaving `chip`, with their destinations.
    pub fn links(
        &self,
        chip: ChipCoord,
    ) -> impl Iterator<Item = (Direction, ChipCoord)> + '_ {
        Direction::ALL
            .into_iter()
            .filter_map(move |d| self.link(chip, d).map(|target| (d, target)))
    }

    /// Marks one direction of a link as dead. The reverse direction is left
    /// alone.
    pub fn remove_link(&mut self, chip: ChipCoord, direction: Direction) {
        if let Some(links) = self.chips.get_mut(&chip) {
            links[direction.id() as usize] = None;
        }
    }

    /// Removes a chip. Links of other chips towards it stop resolving.
    pub fn remove_chip(&mut self, chip: ChipCoord) {
        self.chips.remove(&chip);
    }

    /// Shortest hop count between two chips, ignoring link liveness.
    pub fn distance(&self, a: ChipCoord, b: ChipCoord) -> u32 {
        if self.wrap_around {
            shortest_torus_path_length(
                to_xyz(a),
                to_xyz(b),
                self.width,
                self.height,
            )
        } else {
            shortest_mesh_path_length(to_xyz(a), to_xyz(b))
        }
    }

    /// A shortest vector from `a` to `b`; equally short torus vectors are
    /// picked between at random.
    pub fn shortest_vector<R: Rng + ?Sized>(
        &self,
        a: ChipCoord,
        b: ChipCoord,
        rng: &mut R,
    ) -> HexVector {
        if self.wrap_around {
            shortest_torus_path(to_xyz(a), to_xyz(b), self.width, self.height, rng)
        } else {
            shortest_mesh_path(to_xyz(a), to_xyz(b))
        }
    }

    /// Builds the reverse live-link graph used by the repair search.
    pub fn link_graph(&self) -> LinkGraph {
        let chips = self.chips();
        let mut graph = LinkGraph::with_capacity(chips.len(), chips.len() * N_LINKS);
        for &chip in &chips {
            graph.add_node(chip);
        }
        for &chip in &chips {
            for (direction, target) in self.links(chip) {
                graph.add_edge(target, chip, direction);
            }
        }
        graph
    }
}
