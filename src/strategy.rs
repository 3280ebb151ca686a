//! Strategy compiler
//!
//! Turns `(m, n, k, P, S)` into an ordered [`Strategy`]: a list of [`Step`]s
//! that, read left to right, say exactly how the M/N/K problem is carved up
//! among processes (`Parallel`) and/or across time on one process
//! (`Sequential`) to keep per-process memory at or below `S`.
//!
//! ## Tie-breaking is the contract
//! Given identical `(m, n, k, P, S)` and no user override, [`compile`] must
//! return a bit-identical [`Strategy`] every time, on every rank. The order
//! in which axes and step kinds are preferred is therefore not a heuristic
//! detail, it is load-bearing:
//! - prefer splitting `K` over `M`, `M` over `N`;
//! - prefer `Parallel` steps over `Sequential` ones;
//! - prefer the smallest divisor that does the job.
//!
//! ## Reducing P for a cleaner factorisation
//! When the requested process count does not factor cleanly against the
//! problem's axes, the compiler may use fewer processes than `P` and mark
//! the rest idle for the whole call — see [`Strategy::idle_ranks`].

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors produced while compiling or validating a [`Strategy`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StrategyError {
    #[error("m, n, k and P must all be positive (got m={m}, n={n}, k={k}, p={p})")]
    NonPositiveProblem { m: usize, n: usize, k: usize, p: usize },
    #[error("step divisor must be >= 2 (got {0})")]
    BadDivisor(usize),
    #[error("step on axis {axis:?} with divisor {divisor} exceeds that axis's current length {length}")]
    DivisorExceedsAxis { axis: Axis, divisor: usize, length: usize },
    #[error("user strategy's parallel-divisor product {got} does not equal P={expected}")]
    DivisorProductMismatch { expected: usize, got: usize },
    #[error("compiled strategy requires {required} elements per process, exceeding the limit of {limit}")]
    MemoryBudgetExceeded { required: usize, limit: usize },
    #[error("memory budget {limit} cannot be satisfied even with single-element tiles")]
    MemoryBudgetUnsatisfiable { limit: usize },
}

/// The three axes a [`Step`] can split.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    M,
    N,
    K,
}

impl Axis {
    /// Tie-break preference order: K before M before N.
    pub const PREFERENCE_ORDER: [Axis; 3] = [Axis::K, Axis::M, Axis::N];
}

/// Whether a [`Step`] fans the problem out across processes or runs the
/// sub-problems back to back on the same process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    Parallel,
    Sequential,
}

/// One level of the compiled schedule.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub kind: StepKind,
    pub axis: Axis,
    pub divisor: usize,
}

impl Step {
    pub fn parallel(axis: Axis, divisor: usize) -> Self {
        Self { kind: StepKind::Parallel, axis, divisor }
    }

    pub fn sequential(axis: Axis, divisor: usize) -> Self {
        Self { kind: StepKind::Sequential, axis, divisor }
    }
}

/// Per-level working dimensions, reduced as steps are applied. Every step
/// (parallel or sequential) shrinks the axis it splits to the size of its
/// *largest* sub-piece — the pessimistic bound the buffer pool sizes to.
#[derive(Copy, Clone, Debug)]
struct Dims {
    m: usize,
    n: usize,
    k: usize,
}

impl Dims {
    fn get(&self, axis: Axis) -> usize {
        match axis {
            Axis::M => self.m,
            Axis::N => self.n,
            Axis::K => self.k,
        }
    }

    fn with(&self, axis: Axis, value: usize) -> Dims {
        let mut d = *self;
        match axis {
            Axis::M => d.m = value,
            Axis::N => d.n = value,
            Axis::K => d.k = value,
        }
        d
    }

    /// Per-process element count to hold A, B and C sub-blocks at this level.
    fn footprint(&self) -> usize {
        self.m * self.k + self.k * self.n + self.m * self.n
    }
}

fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Largest power of two `<= n` (returns 1 if `n == 0`, matching "no split
/// possible").
fn largest_pow2_leq(n: usize) -> usize {
    if n == 0 {
        return 1;
    }
    1usize << (usize::BITS - 1 - n.leading_zeros())
}

/// A compiled, immutable schedule for one `multiply` call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Strategy {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    /// The process count the caller requested.
    pub requested_p: usize,
    pub steps: Vec<Step>,
    /// Per-step human-readable tie-break reasons, parallel to `steps`.
    reasons: Vec<String>,
    /// Ranks `>= effective_p` (when `effective_p < requested_p`) that never
    /// participate: §4.2's "may reduce P".
    effective_p: usize,
}

impl Strategy {
    /// Process count actually used by this strategy (`<= requested_p`).
    #[inline]
    pub fn effective_p(&self) -> usize {
        self.effective_p
    }

    /// Ranks in `[effective_p, requested_p)`: idle for the whole call.
    pub fn idle_ranks(&self) -> Vec<usize> {
        (self.effective_p..self.requested_p).collect()
    }

    #[inline]
    pub fn is_idle(&self, rank: usize) -> bool {
        rank >= self.effective_p
    }

    /// Peak per-process element count across every level of this strategy,
    /// the value testable property #4 bounds by `S`.
    pub fn peak_memory(&self) -> usize {
        peak_memory_over_steps(self.m, self.n, self.k, &self.steps)
    }

    /// Peak per-process element count for `A`, `B`, `C` individually across
    /// every level (`(peak_a, peak_b, peak_c)`). The buffer pool sizes its
    /// three arenas to these values independently rather than to their sum,
    /// since `A`, `B` and `C` are never resized by the same step unless the
    /// step happens to touch all three axes at once.
    pub fn peak_per_matrix(&self) -> (usize, usize, usize) {
        let mut dims = Dims { m: self.m, n: self.n, k: self.k };
        let (mut pa, mut pb, mut pc) = (dims.m * dims.k, dims.k * dims.n, dims.m * dims.n);
        for step in &self.steps {
            let length = dims.get(step.axis);
            let piece = ceil_div(length, step.divisor);
            dims = dims.with(step.axis, piece);
            pa = pa.max(dims.m * dims.k);
            pb = pb.max(dims.k * dims.n);
            pc = pc.max(dims.m * dims.n);
        }
        (pa, pb, pc)
    }

    /// Human-readable dump: one line per step plus its tie-break reason,
    /// and the idle-rank outcome if any. Used by the CLI and by tests
    /// asserting determinism (testable property #5).
    pub fn explain(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "strategy for m={} n={} k={} requested_p={} effective_p={}\n",
            self.m, self.n, self.k, self.requested_p, self.effective_p
        ));
        for (i, (step, reason)) in self.steps.iter().zip(self.reasons.iter()).enumerate() {
            out.push_str(&format!(
                "  [{i}] {:?} {:?} / {} — {reason}\n",
                step.kind, step.axis, step.divisor
            ));
        }
        if self.effective_p < self.requested_p {
            out.push_str(&format!(
                "  idle ranks: {:?} (reduced P for a cleaner factorisation)\n",
                self.idle_ranks()
            ));
        }
        out
    }

    /// Serialize to the JSON introspection dump used by debug tooling and
    /// logs (`tracing::debug!` spans carry this rather than the `Debug`
    /// form, so it survives structured-log ingestion).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Inverse of [`Strategy::to_json`], for replaying a dumped strategy.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

fn peak_memory_over_steps(m: usize, n: usize, k: usize, steps: &[Step]) -> usize {
    let mut dims = Dims { m, n, k };
    let mut peak = dims.footprint();
    for step in steps {
        let length = dims.get(step.axis);
        let piece = ceil_div(length, step.divisor);
        dims = dims.with(step.axis, piece);
        peak = peak.max(dims.footprint());
    }
    peak
}

/// Compile a [`Strategy`] for `(m, n, k, p)` under memory budget `s`
/// (elements per process). `user_steps`, if given, is validated and used
/// verbatim instead of being auto-derived.
pub fn compile(
    m: usize,
    n: usize,
    k: usize,
    p: usize,
    s: usize,
    user_steps: Option<Vec<Step>>,
) -> Result<Strategy, StrategyError> {
    if m == 0 || n == 0 || k == 0 || p == 0 {
        return Err(StrategyError::NonPositiveProblem { m, n, k, p });
    }

    match user_steps {
        Some(steps) => compile_user(m, n, k, p, s, steps),
        None => compile_auto(m, n, k, p, s),
    }
}

fn compile_user(
    m: usize,
    n: usize,
    k: usize,
    p: usize,
    s: usize,
    steps: Vec<Step>,
) -> Result<Strategy, StrategyError> {
    let mut dims = Dims { m, n, k };
    let mut divisor_product: usize = 1;
    for step in &steps {
        if step.divisor < 2 {
            return Err(StrategyError::BadDivisor(step.divisor));
        }
        let length = dims.get(step.axis);
        if step.divisor > length {
            return Err(StrategyError::DivisorExceedsAxis { axis: step.axis, divisor: step.divisor, length });
        }
        if step.kind == StepKind::Parallel {
            divisor_product *= step.divisor;
        }
        dims = dims.with(step.axis, ceil_div(length, step.divisor));
    }
    if divisor_product != p {
        return Err(StrategyError::DivisorProductMismatch { expected: p, got: divisor_product });
    }

    let peak = peak_memory_over_steps(m, n, k, &steps);
    if peak > s {
        return Err(StrategyError::MemoryBudgetExceeded { required: peak, limit: s });
    }

    let reasons = steps.iter().map(|_| "user-supplied".to_string()).collect();
    Ok(Strategy { m, n, k, requested_p: p, steps, reasons, effective_p: p })
}

fn compile_auto(m: usize, n: usize, k: usize, p: usize, s: usize) -> Result<Strategy, StrategyError> {
    // A single element per matrix is the smallest possible per-axis piece;
    // if even a fully-split-down schedule can't hold 3 elements, no
    // strategy exists.
    if s < 3 {
        return Err(StrategyError::MemoryBudgetUnsatisfiable { limit: s });
    }

    let effective_p = largest_pow2_leq(p);
    let mut dims = Dims { m, n, k };
    let mut p_remaining = effective_p;
    let mut steps = Vec::new();
    let mut reasons = Vec::new();

    loop {
        let footprint = dims.footprint();
        if footprint > s {
            let (axis, divisor) = smallest_sequential_split(dims, s)?;
            debug!(?axis, divisor, footprint, limit = s, "sequential step: memory budget forces a split");
            steps.push(Step::sequential(axis, divisor));
            reasons.push(format!(
                "memory budget: footprint {footprint} > S={s}, smallest d>=2 on the largest axis that fits"
            ));
            dims = dims.with(axis, ceil_div(dims.get(axis), divisor));
            continue;
        }

        if p_remaining <= 1 {
            break;
        }

        match choose_parallel_split(dims, p_remaining) {
            Some((axis, divisor)) => {
                debug!(?axis, divisor, p_remaining, "parallel step: K > M > N, parallel > sequential, smallest divisor");
                steps.push(Step::parallel(axis, divisor));
                reasons.push(format!(
                    "tie-break: K>M>N, parallel preferred, divisor {divisor} consumes remaining P={p_remaining}"
                ));
                dims = dims.with(axis, ceil_div(dims.get(axis), divisor));
                p_remaining /= divisor;
            }
            None => break, // no axis can accommodate any further parallel split
        }
    }

    let peak = peak_memory_over_steps(m, n, k, &steps);
    if peak > s {
        return Err(StrategyError::MemoryBudgetExceeded { required: peak, limit: s });
    }

    Ok(Strategy { m, n, k, requested_p: p, steps, reasons, effective_p })
}

/// Largest power-of-two divisor `d` of `p_remaining` (so `p_remaining` stays
/// a power of two throughout) such that some axis, tried in tie-break
/// preference order, is long enough to host it.
fn choose_parallel_split(dims: Dims, p_remaining: usize) -> Option<(Axis, usize)> {
    let mut d = p_remaining;
    while d >= 2 {
        for axis in Axis::PREFERENCE_ORDER {
            if d <= dims.get(axis) {
                return Some((axis, d));
            }
        }
        d /= 2;
    }
    None
}

/// Smallest `d >= 2` on the largest current axis (ties broken K > M > N)
/// that brings the footprint at or below `s`.
fn smallest_sequential_split(dims: Dims, s: usize) -> Result<(Axis, usize), StrategyError> {
    let axis = largest_axis(dims);
    let length = dims.get(axis);
    for d in 2..=length {
        let piece = ceil_div(length, d);
        let candidate = dims.with(axis, piece);
        if candidate.footprint() <= s {
            return Ok((axis, d));
        }
    }
    Err(StrategyError::MemoryBudgetUnsatisfiable { limit: s })
}

fn largest_axis(dims: Dims) -> Axis {
    let mut best = Axis::K;
    let mut best_len = dims.k;
    for axis in [Axis::M, Axis::N] {
        let len = dims.get(axis);
        if len > best_len {
            best = axis;
            best_len = len;
        }
    }
    best
}
