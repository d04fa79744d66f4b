use std::{collections::VecDeque, fmt, process, thread};

use argh::FromArgs;
use detalloc::{
    AllocatorFlags, Config, DetAllocator, DetError, LogLevel, Stats, UseCase, log, required_size,
};
use snafu::{ResultExt as _, ensure_whatever, whatever};
use snafu_utils::{GenericError, Report};

/// Blocks a worker keeps alive before it starts returning the oldest one.
const LIVE_BLOCKS: usize = 64;

/// Run a fixed alloc/free workload against a detalloc preset and report
/// worst-case cycle costs.
#[derive(Debug, FromArgs)]
struct Args {
    /// preset to measure: audio, robotics, networking or embedded
    #[argh(option, default = "UseCase::Audio")]
    use_case: UseCase,
    /// alloc/free steps per thread
    #[argh(option, default = "100_000")]
    iterations: usize,
    /// keep occupancy bitmaps and detect double frees
    #[argh(switch)]
    validation: bool,
    /// number of threads sharing the allocator
    #[argh(option, default = "1")]
    threads: usize,
    /// log pool layout details
    #[argh(switch, short = 'v')]
    verbose: bool,
}

fn main() {
    let args: Args = argh::from_env();

    log::set_sink(Some(print_log));
    if args.verbose {
        log::set_max_level(LogLevel::Debug);
    }

    if let Err(err) = run(&args) {
        let report = Report::located(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn print_log(level: LogLevel, message: fmt::Arguments<'_>) {
    eprintln!("{} {message}", level.colored());
}

#[derive(Debug, Default, Clone, Copy)]
struct Summary {
    allocs: u64,
    pool_full: u64,
}

fn run(args: &Args) -> Result<(), GenericError> {
    ensure_whatever!(args.threads > 0, "thread count must be positive");

    let mut flags = AllocatorFlags::STATS;
    if args.validation {
        flags |= AllocatorFlags::VALIDATION;
    }
    if args.threads > 1 {
        flags |= AllocatorFlags::THREAD_SAFE;
    }
    let config = Config::for_use_case(args.use_case).with_flags(flags);
    let required = required_size(&config).whatever_context("failed to size the buffer")?;
    let mut buffer = vec![0_u8; required];
    let allocator = DetAllocator::init(&mut buffer, &config)
        .whatever_context("failed to initialize the allocator")?;
    let sizes = request_sizes(&config);

    let outcomes = thread::scope(|s| {
        let workers: Vec<_> = (0..args.threads)
            .map(|id| {
                let allocator = &allocator;
                let sizes = sizes.as_slice();
                s.spawn(move || run_workload(allocator, sizes, id, args.iterations))
            })
            .collect();
        workers
            .into_iter()
            .map(thread::ScopedJoinHandle::join)
            .collect::<Vec<_>>()
    });

    let mut total = Summary::default();
    for (id, outcome) in outcomes.into_iter().enumerate() {
        let Ok(result) = outcome else {
            whatever!("worker {id} panicked");
        };
        let summary = result.with_whatever_context(|_| format!("worker {id} failed"))?;
        total.allocs += summary.allocs;
        total.pool_full += summary.pool_full;
    }

    let stats = allocator
        .get_stats()
        .whatever_context("failed to read statistics")?;
    println!(
        "use case: {}, threads: {}, iterations: {}, buffer: {required} bytes, usable: {} bytes",
        args.use_case,
        args.threads,
        args.iterations,
        allocator.total_memory(),
    );
    println!(
        "allocations: {}, pool full: {}",
        total.allocs, total.pool_full
    );
    print_stats(&stats);

    let mut report = String::new();
    allocator
        .write_report(&mut report)
        .whatever_context("failed to format the report")?;
    print!("{report}");

    ensure_whatever!(
        allocator.validate(),
        "allocator failed validation after the workload"
    );
    Ok(())
}

/// Request sizes covering every pool: a half-full block and a full block.
fn request_sizes(config: &Config) -> Vec<usize> {
    config
        .active_pools()
        .iter()
        .flat_map(|pool| [pool.block_size / 2 + 1, pool.block_size])
        .collect()
}

fn run_workload(
    allocator: &DetAllocator<'_>,
    sizes: &[usize],
    id: usize,
    iterations: usize,
) -> Result<Summary, DetError> {
    let mut live = VecDeque::with_capacity(LIVE_BLOCKS);
    let mut summary = Summary::default();

    for step in 0..iterations {
        let size = sizes[(step * 7 + id * 3) % sizes.len()];
        if live.len() == LIVE_BLOCKS {
            free_oldest(allocator, &mut live)?;
        }
        match allocator.alloc(size) {
            Ok(ptr) => {
                live.push_back(ptr.as_ptr());
                summary.allocs += 1;
            }
            Err(err) if err.kind().is_pool_full() => {
                summary.pool_full += 1;
                free_oldest(allocator, &mut live)?;
            }
            Err(err) => return Err(err),
        }
    }

    for ptr in live {
        allocator.free(ptr)?;
    }
    Ok(summary)
}

fn free_oldest(allocator: &DetAllocator<'_>, live: &mut VecDeque<*mut u8>) -> Result<(), DetError> {
    match live.pop_front() {
        Some(ptr) => allocator.free(ptr),
        None => Ok(()),
    }
}

fn print_stats(stats: &Stats) {
    println!(
        "{:>8} {:>8} {:>10} {:>10} {:>8} {:>8} {:>10} {:>10}",
        "block", "blocks", "allocs", "frees", "peak", "failed", "avg_alloc", "avg_free"
    );
    for pool in &stats.pools {
        println!(
            "{:>8} {:>8} {:>10} {:>10} {:>8} {:>8} {:>10} {:>10}",
            pool.block_size,
            pool.capacity,
            pool.allocs,
            pool.frees,
            pool.peak_usage,
            pool.failed_allocs,
            Cycles(pool.avg_alloc_cycles()),
            Cycles(pool.avg_free_cycles()),
        );
    }
    println!(
        "wcet: alloc={} cycles, free={} cycles",
        stats.wcet_alloc_cycles, stats.wcet_free_cycles
    );
}

struct Cycles(Option<u64>);

impl fmt::Display for Cycles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(cycles) => fmt::Display::fmt(&cycles, f),
            None => f.pad("-"),
        }
    }
}
