//! Minimal CLI miniapp driver
//!
//! Out of scope for the core engine per §1 — this is intentionally a thin,
//! hand-rolled argument parser (no argument-parsing crate pulled in for a
//! component the design explicitly excludes), wiring `cosma::multiply()`
//! over the in-process `ThreadCommunicator` reference transport for local
//! demonstration and benchmarking runs.
//!
//! Usage:
//!   cosma-miniapp --m 1000 --n 1000 --k 1000 --p 4 [--strategy pm2,pn2] [--memory-limit N]

#![forbid(unsafe_code)]

use std::env;
use std::time::Instant;

use cosma::strategy;
use cosma::{multiply, MultiplyOptions, Op, ReferenceGemm, ThreadCommunicator};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn parse_usize(args: &[String], key: &str, default: usize) -> usize {
    parse_flag(args, key).and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// `COSMA_MEMORY_LIMIT`/`COSMA_STRATEGY` env overrides, read once here at
/// the CLI boundary only (§B.8) — never inside the library.
fn env_or(key: &str, flag_value: Option<String>) -> Option<String> {
    flag_value.or_else(|| env::var(key).ok())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = env::args().skip(1).collect();

    let m = parse_usize(&args, "--m", 256);
    let n = parse_usize(&args, "--n", 256);
    let k = parse_usize(&args, "--k", 256);
    let p = parse_usize(&args, "--p", 4);
    let memory_limit = env_or("COSMA_MEMORY_LIMIT", parse_flag(&args, "--memory-limit"))
        .and_then(|s| s.parse().ok())
        .unwrap_or(usize::MAX / 4);
    let strategy_spec = env_or("COSMA_STRATEGY", parse_flag(&args, "--strategy"));

    let user_steps = strategy_spec
        .as_deref()
        .map(cosma::dsl::parse)
        .transpose()
        .map_err(|e| anyhow::anyhow!("invalid --strategy: {e}"))?;
    // Compile once up front purely to print it. `multiply()` recompiles
    // from the same `(m, n, k, p, memory_limit)` internally rather than
    // being handed this `Strategy` directly — determinism (§A.9) guarantees
    // the two compilations agree, and re-deriving keeps a user-supplied
    // step list's validation (divisor product vs `p`) in exactly one place
    // instead of two.
    let strat = strategy::compile(m, n, k, p, memory_limit, user_steps.clone())?;
    println!("{}", strat.explain());

    let mut builder = MultiplyOptions::builder().memory_limit(memory_limit);
    if let Some(steps) = user_steps {
        builder = builder.strategy_steps(steps);
    }
    let opts = builder.build();

    let a: Vec<f64> = (0..m * k).map(|x| (x % 97) as f64 * 0.01).collect();
    let b: Vec<f64> = (0..k * n).map(|x| (x % 89) as f64 * 0.01).collect();
    let c = vec![0.0f64; m * n];

    let comms = ThreadCommunicator::world(p);
    let start = Instant::now();
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .iter()
            .map(|comm| {
                let opts = &opts;
                let (a, b, c) = (&a, &b, &c);
                s.spawn(move || multiply(comm, &ReferenceGemm, m, n, k, a, b, c, 1.0, 0.0, Op::Identity, Op::Identity, opts))
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("worker thread panicked")).collect()
    });
    let elapsed = start.elapsed();

    let active = results.iter().filter(|r| matches!(r, Ok(Some(_)))).count();
    println!("m={m} n={n} k={k} requested_p={p} active_ranks={active} elapsed={elapsed:?}");
    for r in results {
        r?;
    }
    Ok(())
}
