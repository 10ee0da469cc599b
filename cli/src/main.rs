use std::error::Error;

use clap::Parser;
use meshcast::{
    router::machine::MAX_CORE, ChipCoord, Direction, MulticastRouter, Partition, Route,
    RouterConfig, Topology,
};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "meshcast",
    about = "Routes random multicast partitions over a hexagonal chip grid and reports the router tables."
)]
struct Args {
    /// Machine width in chips.
    #[arg(long, default_value_t = 8)]
    width: u32,
    /// Machine height in chips.
    #[arg(long, default_value_t = 8)]
    height: u32,
    /// Wrap the grid into a torus.
    #[arg(long)]
    torus: bool,
    #[arg(short, long, default_value_t = 0)]
    seed: u64,
    /// Attachment search radius for the tree builder.
    #[arg(short, long, default_value_t = 20)]
    radius: u32,
    /// A dead link as `x,y,direction`; may be repeated.
    #[arg(long = "dead-link", value_parser = parse_dead_link)]
    dead_links: Vec<DeadLink>,
    /// A dead chip as `x,y`; may be repeated.
    #[arg(long = "dead-chip", value_parser = parse_chip)]
    dead_chips: Vec<ChipCoord>,
    /// Number of random partitions to route.
    #[arg(short, long, default_value_t = 64)]
    partitions: usize,
    /// Sinks per partition.
    #[arg(short, long, default_value_t = 8)]
    fan_out: usize,
    /// Print every compressed table.
    #[arg(long)]
    dump: bool,
}

#[derive(Debug, Clone, Copy)]
struct DeadLink {
    chip: ChipCoord,
    direction: Direction,
}

fn parse_chip(s: &str) -> Result<ChipCoord, String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected x,y, got {:?}", s))?;
    let x = x.trim().parse().map_err(|e| format!("bad x in {:?}: {}", s, e))?;
    let y = y.trim().parse().map_err(|e| format!("bad y in {:?}: {}", s, e))?;
    Ok(ChipCoord::new(x, y))
}

fn parse_dead_link(s: &str) -> Result<DeadLink, String> {
    let (chip, direction) = s
        .rsplit_once(',')
        .ok_or_else(|| format!("expected x,y,direction, got {:?}", s))?;
    Ok(DeadLink {
        chip: parse_chip(chip)?,
        direction: direction.parse().map_err(|e| format!("{}", e))?,
    })
}

/// Partitions with random sources and sinks on live chips, each owning a
/// block of 2048 keys.
fn random_partitions(
    topology: &Topology,
    count: usize,
    fan_out: usize,
    rng: &mut StdRng,
) -> Vec<Partition> {
    let chips = topology.chips();
    (0..count as u32)
        .filter_map(|i| {
            let source = *chips.choose(rng)?;
            let sinks = chips
                .choose_multiple(rng, fan_out)
                .map(|&chip| (chip, Route::Core(rng.gen_range(1..=MAX_CORE))))
                .collect();
            Some(
                Partition::builder()
                    .source(source)
                    .source_route(Route::Core(rng.gen_range(1..=MAX_CORE)))
                    .sinks(sinks)
                    .key(i << 11)
                    .mask(0xFFFF_F800)
                    .build(),
            )
        })
        .collect()
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut topology = Topology::full(args.width, args.height, args.torus);
    for dead in &args.dead_links {
        topology.remove_link(dead.chip, dead.direction);
    }
    for &chip in &args.dead_chips {
        topology.remove_chip(chip);
    }
    info!(
        "{}x{} {} with {} live chips",
        args.width,
        args.height,
        if args.torus { "torus" } else { "mesh" },
        topology.n_chips()
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    let partitions = random_partitions(&topology, args.partitions, args.fan_out, &mut rng);

    let config = RouterConfig::builder()
        .seed(args.seed)
        .radius(args.radius)
        .build();
    let router = MulticastRouter::new(topology, config);
    let (tables, compressed) = router.run(&partitions)?;

    println!(
        "{} partitions over {} chips: {} entries ({} max per chip), {} after compression ({} max)",
        partitions.len(),
        tables.len(),
        tables.n_entries(),
        tables.max_entries(),
        compressed.n_entries(),
        compressed.max_entries(),
    );
    if args.dump {
        for table in compressed.iter() {
            print!("{}", table);
        }
    }
    Ok(())
}
