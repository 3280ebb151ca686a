//! Crate root: public surface, the `multiply()` entry point, and
//! crate-wide invariants.
//!
//! ## Invariants
//!
//! - **I/O-optimal schedule, not merely asymptotic.** [`strategy::compile`]
//!   derives a [`strategy::Strategy`] whose parallel-step divisors and
//!   sequential-step count are chosen by a deterministic, tie-broken
//!   procedure (K-axis over M over N, parallel over sequential, smallest
//!   divisor first) rather than a fixed heuristic, so the same `(m, n, k, P,
//!   S)` always compiles to the same schedule.
//!
//! - **Memory budget.** No process ever holds more than `S` elements per
//!   matrix live at once; [`strategy::Strategy::peak_per_matrix`] is the
//!   closed-form bound [`buffer::BufferPool`] is sized to, checked at
//!   compile time rather than discovered at runtime.
//!
//! - **Determinism.** Given identical inputs and no user-supplied step list,
//!   every rank derives a bit-identical [`strategy::Strategy`] without
//!   communicating — strategy compilation never blocks on the transport.
//!
//! - **No unsafe.** This crate forbids `unsafe` throughout; cross-thread
//!   transfer of matrix data goes through the tagged [`transport::Payload`]
//!   enum rather than raw byte reinterpretation.
//!
//! Each submodule owns one piece of the pipeline, listed leaves-first:
//! [`interval`] (range algebra) underlies [`strategy`] (schedule
//! derivation), which [`layout`] turns into a concrete, per-level movement
//! plan, which [`buffer`] sizes arenas for and [`engine`] executes against a
//! [`transport::Communicator`] and a [`gemm::LocalGemm`] backend. [`dsl`]
//! and [`shim`] are the two caller-facing translation boundaries named in
//! §6 of the design: the strategy text grammar and the block-cyclic
//! interop shim, respectively.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use thiserror::Error;

/// Half-open-free integer ranges and their 2-D products.
pub mod interval;
/// Strategy compiler: `(m, n, k, P, S)` -> an ordered list of steps.
pub mod strategy;
/// Strategy specification DSL (`pm2,sm2,pk2`).
pub mod dsl;
/// Data-layout mapper: per-level ownership and movement plans.
pub mod layout;
/// Standard dense-linear-algebra (`p?gemm`-style) interop shim.
pub mod shim;
/// Buffer pool: pre-sized, reusable per-matrix arenas.
pub mod buffer;
/// Local GEMM kernel boundary and the closed `Scalar` element-type set.
pub mod gemm;
/// Message-transport / communicator boundary.
pub mod transport;
/// The recursive (iteratively-walked) multiply executor.
pub mod engine;

pub use engine::{Engine, EngineError};
pub use gemm::{GemmError, LocalGemm, Op, ReferenceGemm, Scalar};
pub use interval::{Interval, Interval2D, IntervalError};
pub use layout::{LayoutDescriptor, LayoutError, MatrixDescriptor, NativeLayout};
pub use strategy::{Axis, Step, StepKind, Strategy, StrategyError};
pub use transport::{Communicator, ThreadCommunicator, TransportError, WireScalar};

/// Errors `multiply()` can return, aggregating every stage's own error enum.
///
/// Matches §7's propagation policy: [`MultiplyError::Strategy`] is detected
/// deterministically on every rank before any communication happens;
/// [`MultiplyError::Layout`] derives from the already-validated strategy and
/// is likewise communication-free; [`MultiplyError::Engine`] wraps whatever
/// surfaces once the transport and local GEMM are actually exercised, after
/// which `C`'s contents are left unspecified on the calling rank.
#[derive(Debug, Error)]
pub enum MultiplyError {
    #[error(transparent)]
    Strategy(#[from] strategy::StrategyError),
    #[error(transparent)]
    Layout(#[from] layout::LayoutError),
    #[error(transparent)]
    Engine(#[from] engine::EngineError),
    #[error("strategy's own DSL spec was invalid: {0}")]
    Dsl(#[from] dsl::DslError),
}

/// Per-call configuration knobs (§6 "Control knobs" / SPEC_FULL §B.8),
/// built with the same `...::builder()...build()` idiom this codebase
/// already uses for its prover/verifier constructors.
///
/// `relabel_topology` is accepted and threaded through for interface
/// completeness but is a documented no-op: a topology-aware relabelling
/// pass only has something to act on once more than one [`Communicator`]
/// backend with real network topology exists, and [`ThreadCommunicator`]
/// (the only backend this crate ships) has none.
#[derive(Clone, Debug)]
pub struct MultiplyOptions {
    memory_limit: usize,
    strategy_override: Option<Vec<strategy::Step>>,
    relabel_topology: bool,
}

impl Default for MultiplyOptions {
    fn default() -> Self {
        Self { memory_limit: usize::MAX / 4, strategy_override: None, relabel_topology: false }
    }
}

impl MultiplyOptions {
    /// Start a builder with the default memory limit (effectively
    /// unbounded) and no strategy override.
    pub fn builder() -> MultiplyOptionsBuilder {
        MultiplyOptionsBuilder::default()
    }
}

/// Builder for [`MultiplyOptions`].
#[derive(Clone, Debug, Default)]
pub struct MultiplyOptionsBuilder {
    opts: MultiplyOptions,
}

impl MultiplyOptionsBuilder {
    /// Per-process memory limit `S`, in elements (not bytes).
    pub fn memory_limit(mut self, s: usize) -> Self {
        self.opts.memory_limit = s;
        self
    }

    /// Supply an explicit step list, bypassing auto-derivation entirely.
    /// Validated against `P`/`S` when [`multiply`] compiles the strategy.
    pub fn strategy_steps(mut self, steps: Vec<strategy::Step>) -> Self {
        self.opts.strategy_override = Some(steps);
        self
    }

    /// Supply an explicit strategy via the DSL grammar (e.g. `"pm2,sm2,pk2"`).
    pub fn strategy_spec(mut self, spec: &str) -> Result<Self, dsl::DslError> {
        self.opts.strategy_override = Some(dsl::parse(spec)?);
        Ok(self)
    }

    /// Toggle topology-aware rank relabelling. See [`MultiplyOptions`] docs:
    /// currently a no-op, accepted for interface completeness.
    pub fn relabel_topology(mut self, on: bool) -> Self {
        self.opts.relabel_topology = on;
        self
    }

    pub fn build(self) -> MultiplyOptions {
        self.opts
    }
}

/// The primary entry point (§6): `C <- alpha * op_a(A) * op_b(B) + beta * C`
/// across every rank in `comm`.
///
/// `a_full`/`b_full`/`c_full` only need to be meaningful at global rank 0 —
/// every other rank may pass empty slices; see [`engine::Engine::run`] for
/// the exact contract. Returns `None` on ranks the compiled strategy marks
/// idle (testable property #6); active ranks get back the region of `C`
/// they ended up owning and the data for it.
///
/// This is the common "caller already holds A/B/C at rank 0" entry point. A
/// caller whose data starts out in a non-native layout (e.g. block-cyclic)
/// translates it first via [`shim`]; `multiply()` itself has no layout
/// descriptor parameter because the root-owns-everything starting point it
/// assumes is exactly what that translation produces.
#[allow(clippy::too_many_arguments)]
pub fn multiply<T, C, G>(
    comm: &C,
    gemm: &G,
    m: usize,
    n: usize,
    k: usize,
    a_full: &[T],
    b_full: &[T],
    c_full: &[T],
    alpha: T,
    beta: T,
    op_a: Op,
    op_b: Op,
    opts: &MultiplyOptions,
) -> Result<Option<(Interval2D, Vec<T>)>, MultiplyError>
where
    T: WireScalar,
    C: Communicator,
    G: LocalGemm<T>,
{
    let strat = strategy::compile(m, n, k, comm.size(), opts.memory_limit, opts.strategy_override.clone())?;
    if opts.relabel_topology {
        tracing::debug!("relabel_topology requested but this crate's only transport backend carries no topology to act on");
    }
    let plans = layout::derive_level_plans(&strat)?;
    let engine = engine::Engine::new(&strat, &plans);
    Ok(engine.run(comm, gemm, a_full, b_full, c_full, alpha, beta, op_a, op_b)?)
}
