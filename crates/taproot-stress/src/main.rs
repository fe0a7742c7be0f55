//! Random-operation equivalence harness.
//!
//! Each cycle inserts random keys into a taproot map and a
//! `std::collections::BTreeMap` until the maximum element count is
//! reached, cross-checks traversal, find, and bound queries, then erases
//! back down to the minimum and checks again. Small pages and caches
//! raise the structural stress. Exits non-zero on the first divergence.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use taproot_core::{BTree, NaturalOrder, OpenFlags, TreeOptions};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "taproot-stress", version)]
struct Cli {
    /// Tree file path prefix; the harness writes <prefix>.btr.
    #[arg(long, default_value = "stress")]
    path_prefix: PathBuf,

    /// Grow to this many elements each cycle.
    #[arg(long, default_value_t = 10_000)]
    max: usize,

    /// Shrink to this many elements each cycle.
    #[arg(long, default_value_t = 10)]
    min: usize,

    /// Low end of the random key range.
    #[arg(long, default_value_t = 0)]
    low: i32,

    /// High end of the random key range; 0 means 2 * max.
    #[arg(long, default_value_t = 0)]
    high: i32,

    /// Number of grow/shrink cycles.
    #[arg(long, default_value_t = 3)]
    cycles: u32,

    /// Random seed.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Page size in bytes; small sizes stress splits and merges.
    #[arg(long, default_value_t = 128)]
    page_size: u32,

    /// Page cache capacity.
    #[arg(long, default_value_t = 32)]
    cache_pages: usize,
}

#[derive(Default)]
struct Counts {
    insert_ok: u64,
    insert_dup: u64,
    erase_ok: u64,
    erase_miss: u64,
    finds: u64,
    bounds: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("stress run failed: {e}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let high = if cli.high == 0 {
        (cli.max as i32).saturating_mul(2)
    } else {
        cli.high
    };
    if (high - cli.low) as usize <= cli.max {
        return Err("key range (high - low) must exceed --max".into());
    }

    let path = cli.path_prefix.with_extension("btr");
    let options = TreeOptions::new()
        .flags(OpenFlags::TRUNCATE)
        .page_size(cli.page_size)
        .cache_pages(cli.cache_pages);
    let mut tree: BTree<i32, i32, NaturalOrder> = BTree::open_map(&path, options)?;
    let mut model: BTreeMap<i32, i32> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let mut counts = Counts::default();

    info!(
        path = %path.display(),
        max = cli.max,
        min = cli.min,
        low = cli.low,
        high,
        cycles = cli.cycles,
        seed = cli.seed,
        page_size = cli.page_size,
        cache_pages = cli.cache_pages,
        "starting stress cycles"
    );

    for cycle in 1..=cli.cycles {
        while model.len() < cli.max {
            let k = rng.gen_range(cli.low..high);
            let fresh = !model.contains_key(&k);
            let (_, inserted) = tree.insert(k, k)?;
            if inserted != fresh {
                return Err(format!("insert({k}): tree said {inserted}, model said {fresh}").into());
            }
            if fresh {
                model.insert(k, k);
                counts.insert_ok += 1;
            } else {
                counts.insert_dup += 1;
            }
        }
        check_all(&tree, &model, &mut counts, &mut rng, cli.low, high)?;

        while model.len() > cli.min {
            let k = rng.gen_range(cli.low..high);
            let removed = tree.erase(&k)?;
            let expected = u64::from(model.remove(&k).is_some());
            if removed != expected {
                return Err(format!("erase({k}): tree said {removed}, model said {expected}").into());
            }
            if removed > 0 {
                counts.erase_ok += 1;
            } else {
                counts.erase_miss += 1;
            }
        }
        check_all(&tree, &model, &mut counts, &mut rng, cli.low, high)?;

        info!(
            cycle,
            size = model.len(),
            insert_ok = counts.insert_ok,
            insert_dup = counts.insert_dup,
            erase_ok = counts.erase_ok,
            erase_miss = counts.erase_miss,
            finds = counts.finds,
            bounds = counts.bounds,
            "cycle complete"
        );
    }

    // Contents must survive a close and reopen.
    tree.close()?;
    let reopen_options = TreeOptions::new()
        .page_size(cli.page_size)
        .cache_pages(cli.cache_pages);
    let tree: BTree<i32, i32, NaturalOrder> = BTree::open_map(&path, reopen_options)?;
    compare_traversal(&tree, &model)?;
    info!(size = tree.size(), "reopen check complete");
    Ok(())
}

fn check_all(
    tree: &BTree<i32, i32, NaturalOrder>,
    model: &BTreeMap<i32, i32>,
    counts: &mut Counts,
    rng: &mut StdRng,
    low: i32,
    high: i32,
) -> Result<(), Box<dyn std::error::Error>> {
    compare_traversal(tree, model)?;

    // Backward traversal mirrors the forward one.
    let mut backward: Vec<(i32, i32)> = tree
        .iter()?
        .rev()
        .collect::<Result<_, _>>()?;
    backward.reverse();
    let forward: Vec<(i32, i32)> = model.iter().map(|(&k, &v)| (k, v)).collect();
    if backward != forward {
        return Err("backward traversal diverged".into());
    }

    // Every stored key must be findable; random probes must agree.
    for &k in model.keys() {
        let found = tree.find(&k)?.ok_or("find lost a stored key")?;
        if found.value() != model[&k] {
            return Err(format!("find({k}) returned the wrong value").into());
        }
        counts.finds += 1;
    }
    for _ in 0..model.len() {
        let probe = rng.gen_range(low..high);
        let lb = tree.lower_bound(&probe)?.map(|c| c.key());
        if lb != model.range(probe..).next().map(|(&k, _)| k) {
            return Err(format!("lower_bound({probe}) diverged").into());
        }
        let ub = tree.upper_bound(&probe)?.map(|c| c.key());
        if ub != model.range(probe + 1..).next().map(|(&k, _)| k) {
            return Err(format!("upper_bound({probe}) diverged").into());
        }
        counts.bounds += 2;
    }

    tree.verify()?;
    Ok(())
}

fn compare_traversal(
    tree: &BTree<i32, i32, NaturalOrder>,
    model: &BTreeMap<i32, i32>,
) -> Result<(), Box<dyn std::error::Error>> {
    if tree.size() != model.len() as u64 {
        return Err(format!("size {} != model {}", tree.size(), model.len()).into());
    }
    let got: Vec<(i32, i32)> = tree.iter()?.collect::<Result<_, _>>()?;
    let want: Vec<(i32, i32)> = model.iter().map(|(&k, &v)| (k, v)).collect();
    if got != want {
        return Err("forward traversal diverged".into());
    }
    Ok(())
}
