use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use color_eyre::eyre;
use futures::future::join_all;
use get_size::GetSize;
use latest_value_cache::{LatestValueCache, MEMORY_MANAGER};
use rand::Rng;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Hammers a latest-value cache with concurrent requests and checks that they coalesce.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Concurrent `get()` calls per round
    #[arg(short, long, default_value_t = 100)]
    callers: usize,

    /// Upper bound of the random delay before each call
    #[arg(long, default_value_t = 40)]
    max_delay_ms: u64,

    /// How long one producer invocation takes
    #[arg(long, default_value_t = 25)]
    work_ms: u64,

    /// Make the very first producer invocation fail
    #[arg(long)]
    fail_first: bool,

    /// Rounds to run, the cache is cleared between them
    #[arg(short, long, default_value_t = 3)]
    rounds: usize,
}

#[derive(Debug, Clone, GetSize)]
struct Reading {
    seq: u64,
    samples: Vec<u64>,
}

#[derive(Debug, thiserror::Error)]
#[error("simulated failure in invocation {0}")]
struct SimulatedFailure(u64);

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();

    let seq = Arc::new(AtomicU64::new(0));
    let work = Duration::from_millis(args.work_ms);
    let fail_first = args.fail_first;

    let cache = {
        let seq = seq.clone();
        LatestValueCache::new_enrolled(move || {
            let seq = seq.clone();
            async move {
                tokio::time::sleep(work).await;
                let n = seq.fetch_add(1, Ordering::SeqCst) + 1;
                if fail_first && n == 1 {
                    return Err(SimulatedFailure(n));
                }
                Ok(Reading {
                    seq: n,
                    samples: (0..n * 16).collect(),
                })
            }
        })
    };

    for round in 1..=args.rounds {
        let invocations_before = cache.invocations();

        let tasks: Vec<_> = (0..args.callers)
            .map(|_| {
                let cache = cache.clone();
                let delay =
                    Duration::from_millis(rand::thread_rng().gen_range(0..=args.max_delay_ms));
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    cache.get().await
                })
            })
            .collect();

        let mut seen = BTreeSet::new();
        let mut failures = 0usize;
        for res in join_all(tasks).await {
            match res? {
                Ok(reading) => {
                    seen.insert(reading.seq);
                }
                Err(e) => {
                    debug!(error = %e, "Caller saw a failure");
                    failures += 1;
                }
            }
        }

        info!(
            round,
            invocations = cache.invocations() - invocations_before,
            distinct_values = seen.len(),
            failures,
            "Round finished"
        );
        info!(round, "{}", MEMORY_MANAGER.stats());

        if seen.len() > 1 {
            eyre::bail!("round {round} observed {} different values: {seen:?}", seen.len());
        }

        if round < args.rounds {
            cache.clear();
        }
    }

    info!("{}", MEMORY_MANAGER.stats());
    let flushed = MEMORY_MANAGER.flush_all();
    info!(flushed, "Flushed all");

    Ok(())
}
