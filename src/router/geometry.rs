//! Hexagonal grid geometry.
//!
//! Chips are addressed by (x, y) but vectors between them are held as
//! (x, y, z) triples, where a step along z moves one chip south-west. Any
//! multiple of (1, 1, 1) is a journey that ends where it began, so every
//! vector has a "minimal" representative with at most two non-zero
//! components of opposite sign. For a minimal vector the hop count equals the
//! range of its components.

use std::ops::{Add, Neg, Sub};

use rand::{seq::SliceRandom, Rng};

use super::machine::{ChipCoord, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HexVector {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl HexVector {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub const fn from_xy(x: i32, y: i32) -> Self {
        Self { x, y, z: 0 }
    }

    /// The equivalent vector with the smallest component magnitudes.
    pub fn minimise(self) -> Self {
        let HexVector { x, y, z } = self;
        let m = x.min(y).max(x.max(y).min(z));
        Self::new(x - m, y - m, z - m)
    }

    /// Hop count of a shortest route covering this vector.
    pub fn magnitude(self) -> u32 {
        let max = self.x.max(self.y).max(self.z);
        let min = self.x.min(self.y).min(self.z);
        (max - min) as u32
    }

    /// Hops taken when walking each component separately.
    pub fn hops(self) -> u32 {
        self.x.unsigned_abs() + self.y.unsigned_abs() + self.z.unsigned_abs()
    }

    fn components(self) -> [i32; 3] {
        [self.x, self.y, self.z]
    }
}

impl Add for HexVector {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for HexVector {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Neg for HexVector {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

pub fn to_xyz(chip: ChipCoord) -> HexVector {
    HexVector::from_xy(chip.x, chip.y)
}

pub fn shortest_mesh_path_length(source: HexVector, destination: HexVector) -> u32 {
    // Adding (1, 1, 1) never changes the range, so no need to minimise.
    (destination - source).magnitude()
}

pub fn shortest_mesh_path(source: HexVector, destination: HexVector) -> HexVector {
    (destination - source).minimise()
}

/// Folds the destination onto the torus as if the source were at the origin,
/// giving non-negative (dx, dy) with dx < width and dy < height.
fn torus_offset(
    source: HexVector,
    destination: HexVector,
    width: u32,
    height: u32,
) -> (i32, i32) {
    let (w, h) = (width as i32, height as i32);
    let sx = source.x - source.z;
    let sy = source.y - source.z;
    let dx = (destination.x - destination.z - sx).rem_euclid(w);
    let dy = (destination.y - destination.z - sy).rem_euclid(h);
    (dx, dy)
}

/// The four ways round a torus: straight, wrapping X, wrapping Y, wrapping
/// both. Each is (hop count, vector).
fn torus_approaches(dx: i32, dy: i32, w: i32, h: i32) -> [(i32, HexVector); 4] {
    [
        (dx.max(dy), HexVector::from_xy(dx, dy)),
        (w - dx + dy, HexVector::from_xy(-(w - dx), dy)),
        (dx + h - dy, HexVector::from_xy(dx, -(h - dy))),
        ((w - dx).max(h - dy), HexVector::from_xy(-(w - dx), -(h - dy))),
    ]
}

pub fn shortest_torus_path_length(
    source: HexVector,
    destination: HexVector,
    width: u32,
    height: u32,
) -> u32 {
    let (dx, dy) = torus_offset(source, destination, width, height);
    torus_approaches(dx, dy, width as i32, height as i32)
        .iter()
        .map(|(length, _)| *length)
        .min()
        .unwrap_or(0) as u32
}

/// A shortest vector between two chips of a torus.
///
/// When several approaches tie, one is chosen uniformly at random. On narrow
/// tori a random number of "spirals" round the Z axis is also folded in where
/// that leaves the length unchanged.
pub fn shortest_torus_path<R: Rng + ?Sized>(
    source: HexVector,
    destination: HexVector,
    width: u32,
    height: u32,
    rng: &mut R,
) -> HexVector {
    let (w, h) = (width as i32, height as i32);
    let (dx, dy) = torus_offset(source, destination, width, height);
    let approaches = torus_approaches(dx, dy, w, h);
    let shortest = approaches.iter().map(|(l, _)| *l).min().unwrap_or(0);
    let candidates: Vec<HexVector> = approaches
        .iter()
        .filter(|(l, _)| *l == shortest)
        .map(|(_, v)| *v)
        .collect();
    let HexVector { mut x, mut y, mut z } = candidates
        .choose(rng)
        .copied()
        .unwrap_or_default()
        .minimise();

    if x.abs() >= h {
        let max_spirals = (if x < 0 { x + h - 1 } else { x }).div_euclid(h);
        let d = rng.gen_range(max_spirals.min(0)..=max_spirals.max(0)) * h;
        x -= d;
        z -= d;
    } else if y.abs() >= w {
        let max_spirals = (if y < 0 { y + w - 1 } else { y }).div_euclid(w);
        let d = rng.gen_range(max_spirals.min(0)..=max_spirals.max(0)) * w;
        y -= d;
        z -= d;
    }

    HexVector::new(x, y, z)
}

/// Lists the hops of a longest-dimension-first route covering `vector`,
/// starting at (but not including) `start`.
///
/// The vector is minimised first. Components of equal magnitude are ordered
/// at random. Each hop is wrapped into `bounds` when given, so torus routes
/// stay on the grid.
pub fn longest_dimension_first<R: Rng + ?Sized>(
    vector: HexVector,
    start: ChipCoord,
    bounds: Option<(u32, u32)>,
    rng: &mut R,
) -> Vec<(Direction, ChipCoord)> {
    let vector = vector.minimise();
    let mut dimensions: Vec<(u32, u32, usize, i32)> = vector
        .components()
        .into_iter()
        .enumerate()
        .map(|(dimension, magnitude)| {
            (magnitude.unsigned_abs(), rng.gen::<u32>(), dimension, magnitude)
        })
        .collect();
    dimensions.sort_unstable_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));

    let ChipCoord { mut x, mut y } = start;
    let mut hops = Vec::with_capacity(vector.hops() as usize);
    for (_, _, dimension, magnitude) in dimensions {
        if magnitude == 0 {
            break;
        }
        let sign = magnitude.signum();
        let (dx, dy) = match dimension {
            0 => (sign, 0),
            1 => (0, sign),
            _ => (-sign, -sign),
        };
        let Some(direction) = Direction::from_vector((dx, dy)) else {
            continue;
        };
        for _ in 0..magnitude.unsigned_abs() {
            x += dx;
            y += dy;
            if let Some((width, height)) = bounds {
                x = x.rem_euclid(width as i32);
                y = y.rem_euclid(height as i32);
            }
            hops.push((direction, ChipCoord::new(x, y)));
        }
    }
    hops
}

/// Steps walked round each hexagonal ring, starting from the cell directly
/// south of the centre.
const RING_STEPS: [(i32, i32); 6] = [(1, 1), (0, 1), (-1, 0), (-1, -1), (0, -1), (1, 0)];

/// Number of cells in all rings out to `radius`, the centre included.
pub fn concentric_ring_cells(radius: u32) -> usize {
    let r = radius as usize;
    1 + 3 * r * (r + 1)
}

/// Lazily yields `(ring, coordinate)` for the concentric hexagonal rings
/// round `center`, ring 0 (the centre itself) first, out to `radius`.
///
/// Coordinates are not wrapped or bounds checked.
pub fn concentric_rings(
    radius: u32,
    center: ChipCoord,
) -> impl Iterator<Item = (u32, ChipCoord)> {
    (0..=radius).flat_map(move |ring| {
        let r = ring as i32;
        let cells = if ring == 0 { 1 } else { 6 * ring };
        (0..cells).map(move |i| {
            if ring == 0 {
                return (0, center);
            }
            let (side, step) = ((i / ring) as usize, (i % ring) as i32);
            let (mut x, mut y) = (center.x, center.y - r);
            for &(dx, dy) in &RING_STEPS[..side] {
                x += dx * r;
                y += dy * r;
            }
            let (dx, dy) = RING_STEPS[side];
            (ring, ChipCoord::new(x + dx * step, y + dy * step))
        })
    })
}
