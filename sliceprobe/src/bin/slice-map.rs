use clap::Parser;
use itertools::Itertools;
use tracing_subscriber::EnvFilter;

use sliceprobe::*;
use sliceprobe::period::discover_sequence_period;
use sliceprobe::sim::SyntheticOracle;

/// Recover the slice function for one of the known parts.
///
/// Physical addresses are read from '/proc/self/pagemap' (you probably need
/// to be root), and slice measurements come from a simulated oracle for the
/// selected platform. The recovered model is checked against the oracle on
/// random lines from the arena.
///
/// The sequence period doesn't fit in a 4KiB page on parts with a slice
/// count that isn't a power of two, so those need '--huge'.
///
/// Set RUST_LOG for more/less output (defaults to 'info').
#[derive(Parser)]
#[command(verbatim_doc_comment)]
pub struct Args {
    /// The part to simulate.
    #[arg(long, value_enum, default_value = "coffee-lake6")]
    platform: TargetPlatform,

    /// Size of the arena (in MiB).
    #[arg(long, default_value_t = 1024)]
    arena_mib: usize,

    /// Back the arena with 2MiB pages.
    #[arg(long)]
    huge: bool,

    /// Number of adjacent pairs to find for each bit.
    #[arg(long, default_value_t = 2)]
    quota: usize,

    /// Number of search workers (defaults to the number of online CPUs).
    #[arg(long)]
    threads: Option<usize>,

    /// Try to discover the sequence length before the run.
    /// Only meaningful with '--huge'.
    #[arg(long)]
    discover_period: bool,

    /// Number of random lines used to check the result.
    #[arg(long, default_value_t = 10_000)]
    check: usize,
}

fn main() -> sliceprobe::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let hash = args.platform.known_hash();
    let page_bits = if args.huge { 21 } else { 12 };

    let mut cfg = ProbeConfig::for_platform(args.platform)
        .page_bits(page_bits)
        .quota(args.quota);
    if let Some(threads) = args.threads {
        cfg = cfg.num_threads(threads);
    }
    let cfg = cfg.validate()?;

    let arena = Arena::acquire(args.arena_mib << 20, args.huge)?;
    let pagemap = PageMap::open_self()?;
    let mut oracle = SyntheticOracle::new(hash, &pagemap);

    if args.discover_period {
        let res = discover_sequence_period(&arena, &mut oracle, &cfg)?;
        match res.period {
            Some(period) => println!("[*] Sequence length: {}", period),
            None => println!("[!] Couldn't find the sequence length"),
        }
    }

    let res = SliceMapper::new(cfg)
        .run(&arena, &pagemap, &mut oracle, &mut thread_rng())?;
    let model = res.model();

    println!("[*] Adjacent pairs:");
    for (bit, count) in res.fill_counts() {
        let flag = if count < cfg.quota { " [!]" } else { "" };
        println!("  bit {:02}: {}/{}{}", bit, count, cfg.quota, flag);
    }

    println!("[*] Reduction map:");
    for (bit, value) in model.map().values().iter().enumerate() {
        match value {
            Some(v) => println!("  bit {:02}: {:#04x}", bit, v),
            None => println!("  bit {:02}: ?", bit),
        }
    }

    println!("[*] Reduction masks:");
    for (i, mask) in model.mask().masks().iter().enumerate() {
        println!("  {}: {:#011x}", i, mask);
    }

    if let Some(master) = model.master() {
        println!("[*] Master sequence:");
        for chunk in &master.entries().iter().chunks(16) {
            let line = chunk.map(|e| match e {
                Some(s) => format!("{}", s),
                None => "?".to_string(),
            }).join(" ");
            println!("  {}", line);
        }
    }

    let mut rng = thread_rng();
    let mut hits = 0;
    let mut unknown = 0;
    let mut total = 0;
    for _ in 0..args.check {
        let offset = rng.gen_range(0..arena.len()) & !(cfg.line_size() - 1);
        let Some(vaddr) = arena.touch(offset) else { continue };
        let Ok(paddr) = pagemap.translate(vaddr) else { continue };
        total += 1;
        match model.predict(paddr) {
            None => unknown += 1,
            p if p == hash.slice(paddr) => hits += 1,
            _ => {},
        }
    }
    if total == 0 {
        println!("[!] Couldn't translate any lines for checking");
    } else {
        println!("[*] Prediction agrees on {}/{} lines ({:.2}%)",
            hits, total, 100.0 * hits as f64 / total as f64);
        if unknown > 0 {
            println!("[!] No prediction for {} lines", unknown);
        }
    }
    Ok(())
}
