//! Multiply engine
//!
//! Walks a compiled [`Strategy`]'s [`LevelPlan`]s top-down, moving data
//! between ranks for each `Parallel` step, looping locally for each
//! `Sequential` step, and calling into a [`LocalGemm`] backend at the
//! recursion's leaf. This is where every other module's contract gets
//! discharged at once: the interval algebra decides who owns what, the
//! layout mapper decides who sends what to whom, the strategy decides how
//! deep to recurse, and the transport is the only thing that actually moves
//! bytes.
//!
//! ## Composing `Parallel`-K reductions
//! A single `Parallel`-K step is just "every rank computes a partial product
//! into the same C region, then `all_reduce_sum`". Nesting K-splits (e.g.
//! `pk2,pk2`) is not simply "reduce again at the end" — by the time a
//! K-branch's own recursion returns, every rank *within that branch* already
//! holds an identical, fully-combined partial sum (its own nested reduce
//! already ran). Re-summing all of them at the parent level would count that
//! branch's contribution `branch_size` times over. The fix: the
//! cross-branch reduce at a given level is taken over a communicator formed
//! by splitting *this level's own* pre-descent group with `color` equal to
//! the rank's offset within its branch and `key` equal to the branch index —
//! that picks exactly one representative value per branch.
//!
//! ## Two communicators, two jobs
//! `flat` never changes across the whole recursion and is used only to
//! address point-to-point A/B movement, because [`LevelPlan::movements`] is
//! always expressed in absolute rank numbers `0..effective_p`. `group` is
//! forward-split at every `Parallel` level and is used only for collectives
//! scoped to the current sub-communicator (the K cross-reduce above). They
//! start out as the same communicator at the root and diverge from there.
//!
//! ## Why `C` needs its own distribute step
//! [`LevelPlan::movements`] only ever covers `A`/`B` — by design, `C`'s
//! combination is resolved after a level's recursion returns (reduce for K,
//! gather for M/N), not during the distribute phase. But a sub-call still
//! needs an accurate, correctly-beta-scaled slice of `C` to recurse *into*,
//! and only one rank (`group_start`, inductively — the caller at the root,
//! and the rank re-established by this very step one level up) is
//! guaranteed to hold it. [`Engine::distribute_c`] mirrors `A`/`B`'s
//! distribute shape for `C` alone, off the critical path `movements`
//! encodes.

#![forbid(unsafe_code)]

use thiserror::Error;
use tracing::debug;

use crate::gemm::{GemmError, LocalGemm, Op};
use crate::interval::Interval2D;
use crate::layout::{LayoutError, LevelAssignment, LevelPlan, MatrixRole, MovementTriple};
use crate::strategy::{Axis, Strategy};
use crate::transport::{Communicator, TransportError, WireScalar};

/// Errors raised while executing a compiled strategy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Gemm(#[from] GemmError),
    /// `layout.rs`'s region splitting assumes a matrix's physical storage is
    /// already logically (rows x cols) oriented, so a transposed or
    /// conjugate-transposed operand can only be honored once no further
    /// `Parallel`/`Sequential` splitting remains to misinterpret its
    /// physical layout — i.e. the single local leaf call every strategy
    /// bottoms out at. A strategy with at least one step still needs real
    /// distributed splitting and cannot take a non-identity op.
    #[error("a strategy with at least one step only supports Op::Identity for op_a/op_b; got op_a={op_a:?}, op_b={op_b:?}")]
    UnsupportedDistributedOp { op_a: Op, op_b: Op },
}

/// Extract the sub-region `sub` (within `full`) from a column-major buffer.
fn extract_region<T: Copy>(buf: &[T], full: Interval2D, sub: Interval2D) -> Vec<T> {
    let mut out = Vec::with_capacity(sub.num_elements());
    for c in sub.cols.first()..=sub.cols.last() {
        for r in sub.rows.first()..=sub.rows.last() {
            out.push(buf[full.local_index(r, c)]);
        }
    }
    out
}

/// Write `data` (shaped like `sub`) back into `dst` (shaped like `dst_region`).
fn scatter_region<T: Copy>(dst: &mut [T], dst_region: Interval2D, sub: Interval2D, data: &[T]) {
    let mut idx = 0;
    for c in sub.cols.first()..=sub.cols.last() {
        for r in sub.rows.first()..=sub.rows.last() {
            dst[dst_region.local_index(r, c)] = data[idx];
            idx += 1;
        }
    }
}

/// Walks a compiled [`Strategy`]'s [`LevelPlan`]s, realizing every
/// `Parallel`/`Sequential` step over a [`Communicator`] and calling a
/// [`LocalGemm`] backend at the leaf.
pub struct Engine<'s> {
    strategy: &'s Strategy,
    plans: &'s [LevelPlan],
}

impl<'s> Engine<'s> {
    pub fn new(strategy: &'s Strategy, plans: &'s [LevelPlan]) -> Self {
        Self { strategy, plans }
    }

    /// Run one multiply call: `C <- alpha * A * B + beta * C`.
    ///
    /// `a_full`/`b_full`/`c_full` only need to be meaningful at global rank
    /// 0 — every other rank may pass empty slices. Returns `None` for ranks
    /// `strategy.is_idle(rank)` marks idle (they make no transport calls
    /// beyond the one bootstrap [`Communicator::split`] every rank,
    /// including idle ones, must take part in). Active ranks get back the
    /// `[A,B,C]` region's C component they ended up owning, and the data
    /// they hold for it.
    ///
    /// `op_a`/`op_b` are only supported when the compiled strategy has no
    /// steps at all (a single local leaf call per rank); see
    /// [`EngineError::UnsupportedDistributedOp`].
    #[allow(clippy::too_many_arguments)]
    pub fn run<T, C, G>(
        &self,
        comm: &C,
        gemm: &G,
        a_full: &[T],
        b_full: &[T],
        c_full: &[T],
        alpha: T,
        beta: T,
        op_a: Op,
        op_b: Op,
    ) -> Result<Option<(Interval2D, Vec<T>)>, EngineError>
    where
        T: WireScalar,
        C: Communicator,
        G: LocalGemm<T>,
    {
        if !self.plans.is_empty() && (op_a != Op::Identity || op_b != Op::Identity) {
            return Err(EngineError::UnsupportedDistributedOp { op_a, op_b });
        }

        let rank = comm.rank();
        let color = if rank < self.strategy.effective_p() { 0 } else { 1 };
        let group = comm.split(color, rank)?;

        if self.strategy.is_idle(rank) {
            debug!(rank, "idle rank: carved out at the bootstrap split, making no further transport calls");
            return Ok(None);
        }

        let whole = |len: usize| crate::interval::Interval::new(0, len - 1);
        let root_region = [
            Interval2D::new(whole(self.strategy.m), whole(self.strategy.k)),
            Interval2D::new(whole(self.strategy.k), whole(self.strategy.n)),
            Interval2D::new(whole(self.strategy.m), whole(self.strategy.n)),
        ];

        // After the bootstrap split, local rank 0 is exactly global rank 0
        // (color 0's keys are the active global ranks 0..effective_p,
        // already sorted ascending), which is the only rank that needs to
        // materialize the full input matrices.
        let is_root = group.rank() == 0;
        let a0 = if is_root { a_full.to_vec() } else { Vec::new() };
        let b0 = if is_root { b_full.to_vec() } else { Vec::new() };
        let c0 = if is_root { c_full.to_vec() } else { Vec::new() };

        let (region, buf) =
            self.execute_from(0, 0, self.strategy.effective_p(), root_region, a0, b0, c0, beta, &group, &group, gemm, alpha, op_a, op_b)?;
        Ok(Some((region, buf)))
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_from<T, C, G>(
        &self,
        level_idx: usize,
        group_start: usize,
        group_count: usize,
        region: [Interval2D; 3],
        a: Vec<T>,
        b: Vec<T>,
        c: Vec<T>,
        beta: T,
        flat: &C,
        group: &C,
        gemm: &G,
        alpha: T,
        op_a: Op,
        op_b: Op,
    ) -> Result<(Interval2D, Vec<T>), EngineError>
    where
        T: WireScalar,
        C: Communicator,
        G: LocalGemm<T>,
    {
        let Some(plan) = self.plans.get(level_idx) else {
            let m = region[0].rows.length();
            let k = region[0].cols.length();
            let n = region[1].cols.length();
            // No further splitting bottoms out here, so `a`/`b` are still
            // exactly the caller's physical buffers (see
            // `UnsupportedDistributedOp`'s doc) and their physical leading
            // dimensions follow BLAS's op-dependent (rows, cols) swap.
            let lda = if op_a == Op::Identity { m } else { k };
            let ldb = if op_b == Op::Identity { k } else { n };
            let mut c = c;
            gemm.gemm(m, n, k, alpha, &a, lda, op_a, &b, ldb, op_b, beta, &mut c, m)?;
            return Ok((region[2], c));
        };

        match &plan.assignment {
            LevelAssignment::Parallel { sub_comm_of_rank, .. } => {
                let d = plan.step.divisor;
                let sub_size = group_count / d;
                let rank = flat.rank();
                let i = (rank - group_start) / sub_size;
                let off = (rank - group_start) % sub_size;
                let new_group_start = group_start + i * sub_size;
                let new_region = plan.regions[sub_comm_of_rank[rank]];

                let new_a = self.realize_movement(MatrixRole::A, flat, plan, rank, region[0], &a, new_region[0])?;
                let new_b = self.realize_movement(MatrixRole::B, flat, plan, rank, region[1], &b, new_region[1])?;
                let new_c =
                    self.distribute_c(flat, rank, group_start, sub_size, d, region[2], &c, plan, sub_comm_of_rank)?;

                // A K-axis split sums every branch's leaf result via the
                // cross-reduce below; only one branch may carry the real
                // `beta` into its leaf or `beta * C_old` would be counted
                // once per branch instead of once overall.
                let branch_beta = if plan.step.axis == Axis::K && i != 0 { T::zero() } else { beta };

                let child_group = group.split(i, off)?;
                let (_, mut result_c) = self.execute_from(
                    level_idx + 1,
                    new_group_start,
                    sub_size,
                    new_region,
                    new_a,
                    new_b,
                    new_c,
                    branch_beta,
                    flat,
                    &child_group,
                    gemm,
                    alpha,
                    op_a,
                    op_b,
                )?;

                if plan.step.axis == Axis::K {
                    let cross = group.split(off, i)?;
                    cross.all_reduce_sum(&mut result_c)?;
                }

                Ok((new_region[2], result_c))
            }
            LevelAssignment::Sequential { divisor } => {
                let pieces = crate::layout::split_region(region, plan.step.axis, *divisor)?;
                let mut accumulated: Option<Vec<T>> = None;
                let mut out_c = c.clone();
                let last = pieces.len() - 1;

                for (idx, piece) in pieces.into_iter().enumerate() {
                    let a_piece = extract_region(&a, region[0], piece[0]);
                    let b_piece = extract_region(&b, region[1], piece[1]);
                    let c_unchanged = piece[2] == region[2];

                    let (eff_beta, c_piece) = if c_unchanged {
                        match accumulated.take() {
                            Some(prev) => (T::one(), prev),
                            None => (beta, extract_region(&c, region[2], piece[2])),
                        }
                    } else {
                        (beta, extract_region(&c, region[2], piece[2]))
                    };

                    let (_, result) = self.execute_from(
                        level_idx + 1,
                        group_start,
                        group_count,
                        piece,
                        a_piece,
                        b_piece,
                        c_piece,
                        eff_beta,
                        flat,
                        group,
                        gemm,
                        alpha,
                        op_a,
                        op_b,
                    )?;

                    if c_unchanged {
                        if idx == last {
                            scatter_region(&mut out_c, region[2], piece[2], &result);
                        } else {
                            accumulated = Some(result);
                        }
                    } else {
                        scatter_region(&mut out_c, region[2], piece[2], &result);
                    }
                }
                Ok((region[2], out_c))
            }
        }
    }

    /// Deliver `C`'s contribution for this level's split, since (per
    /// [`crate::layout::derive_level_plans`]'s docs) `C` is deliberately
    /// excluded from `LevelPlan::movements` — its combination happens after
    /// the recursion returns (reduce for K, gather for M/N), not during the
    /// distribute phase. But the leaf still needs a correctly beta-scaled
    /// slice of *this level's* C to recurse into, and only the rank at
    /// `group_start` is guaranteed (inductively — true at the root by
    /// construction, true after a shallower call to this same method) to
    /// hold accurate data for the level above. So this mirrors `A`/`B`'s
    /// movement shape for `C` specifically: `group_start` slices its C
    /// region per branch and sends each branch's slice to every rank in
    /// that branch (itself included), re-establishing the same invariant
    /// one level deeper.
    #[allow(clippy::too_many_arguments)]
    fn distribute_c<T, C>(
        &self,
        flat: &C,
        rank: usize,
        group_start: usize,
        sub_size: usize,
        divisor: usize,
        old_region_c: Interval2D,
        old_c: &[T],
        plan: &LevelPlan,
        sub_comm_of_rank: &[usize],
    ) -> Result<Vec<T>, EngineError>
    where
        T: WireScalar,
        C: Communicator,
    {
        let my_branch = sub_comm_of_rank[rank];
        if rank == group_start {
            let base = sub_comm_of_rank[group_start];
            for i in 0..divisor {
                let branch_region = plan.regions[base + i][2];
                let piece = extract_region(old_c, old_region_c, branch_region);
                for receiver in (group_start + i * sub_size)..(group_start + (i + 1) * sub_size) {
                    if receiver == rank {
                        continue;
                    }
                    let handle = flat.post_send(receiver, &piece)?;
                    flat.wait_send(handle)?;
                }
            }
            Ok(extract_region(old_c, old_region_c, plan.regions[my_branch][2]))
        } else {
            let branch_region = plan.regions[my_branch][2];
            let handle = flat.post_recv::<T>(group_start, branch_region.num_elements())?;
            Ok(flat.wait_recv(handle)?)
        }
    }

    /// Realize one matrix's movements for `rank` at this level: send every
    /// piece this rank is the root of to its receivers, and return the
    /// piece this rank itself ends up owning (locally restricted if this
    /// rank is already its own sender, received over the wire otherwise).
    fn realize_movement<T, C>(
        &self,
        matrix: MatrixRole,
        flat: &C,
        plan: &LevelPlan,
        rank: usize,
        old_region: Interval2D,
        old_buf: &[T],
        new_region: Interval2D,
    ) -> Result<Vec<T>, EngineError>
    where
        T: WireScalar,
        C: Communicator,
    {
        for mv in movements_for(plan, matrix, rank) {
            if mv.sender == rank && mv.receiver != rank {
                let piece = extract_region(old_buf, old_region, mv.region);
                let handle = flat.post_send(mv.receiver, &piece)?;
                flat.wait_send(handle)?;
            }
        }
        match plan.movements.iter().find(|m| m.matrix == matrix && m.receiver == rank) {
            Some(mv) if mv.sender == rank => Ok(extract_region(old_buf, old_region, mv.region)),
            Some(mv) => {
                let handle = flat.post_recv::<T>(mv.sender, mv.region.num_elements())?;
                Ok(flat.wait_recv(handle)?)
            }
            // No movement touches this matrix at this level (e.g. it isn't
            // one of SPLIT_ROLES for this axis): the rank keeps its own
            // restricted region unchanged.
            None => Ok(extract_region(old_buf, old_region, new_region)),
        }
    }
}

fn movements_for(plan: &LevelPlan, matrix: MatrixRole, rank: usize) -> impl Iterator<Item = &MovementTriple> {
    plan.movements.iter().filter(move |m| m.matrix == matrix && m.sender == rank)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemm::ReferenceGemm;
    use crate::layout::derive_level_plans;
    use crate::strategy::{compile, Step};
    use crate::transport::ThreadCommunicator;

    const GENEROUS: usize = usize::MAX / 4;

    /// Dense column-major reference product, computed single-threaded, to
    /// check distributed results against.
    fn reference_product(m: usize, n: usize, k: usize, a: &[f64], b: &[f64], alpha: f64, beta: f64, c: &[f64]) -> Vec<f64> {
        let mut out = c.to_vec();
        for j in 0..n {
            for i in 0..m {
                let mut acc = 0.0;
                for p in 0..k {
                    acc += a[p * m + i] * b[j * k + p];
                }
                out[j * m + i] = alpha * acc + beta * out[j * m + i];
            }
        }
        out
    }

    fn reassemble(m: usize, n: usize, pieces: &[(Interval2D, Vec<f64>)]) -> Vec<f64> {
        let whole = Interval2D::new(crate::interval::Interval::new(0, m - 1), crate::interval::Interval::new(0, n - 1));
        let mut out = vec![0.0; m * n];
        for (region, buf) in pieces {
            for c in region.cols.first()..=region.cols.last() {
                for r in region.rows.first()..=region.rows.last() {
                    out[whole.local_index(r, c)] = buf[region.local_index(r, c)];
                }
            }
        }
        out
    }

    /// Runs `strategy` over `ThreadCommunicator::world(strategy.requested_p)`
    /// and reassembles the global C, panicking on any engine error.
    fn run_and_reassemble(m: usize, n: usize, k: usize, strategy: &Strategy, a: &[f64], b: &[f64], c: &[f64], alpha: f64, beta: f64) -> Vec<f64> {
        let plans = derive_level_plans(strategy).unwrap();
        let engine = Engine::new(strategy, &plans);
        let comms = ThreadCommunicator::world(strategy.requested_p);

        let pieces: Vec<Option<(Interval2D, Vec<f64>)>> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|comm| {
                    s.spawn(|| {
                        engine
                            .run(comm, &ReferenceGemm, a, b, c, alpha, beta, Op::Identity, Op::Identity)
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let owned: Vec<(Interval2D, Vec<f64>)> = pieces.into_iter().flatten().collect();
        reassemble(m, n, &owned)
    }

    #[test]
    fn scenario1_single_process_matches_the_reference_product() {
        let (m, n, k) = (4, 4, 4);
        let a: Vec<f64> = (0..m * k).map(|x| x as f64).collect();
        let b: Vec<f64> = (0..k * n).map(|x| (x as f64) * 0.5).collect();
        let c = vec![0.0; m * n];
        let strategy = compile(m, n, k, 1, GENEROUS, None).unwrap();

        let got = run_and_reassemble(m, n, k, &strategy, &a, &b, &c, 1.0, 0.0);
        let want = reference_product(m, n, k, &a, &b, 1.0, 0.0, &c);
        assert_eq!(got, want);
    }

    #[test]
    fn scenario2_parallel_m_then_n_matches_the_reference_product() {
        let (m, n, k) = (8, 8, 6);
        let a: Vec<f64> = (0..m * k).map(|x| x as f64 * 0.1).collect();
        let b: Vec<f64> = (0..k * n).map(|x| x as f64 * 0.2 - 1.0).collect();
        let c = vec![0.0; m * n];
        let steps = vec![Step::parallel(Axis::M, 2), Step::parallel(Axis::N, 2)];
        let strategy = compile(m, n, k, 4, GENEROUS, Some(steps)).unwrap();

        let got = run_and_reassemble(m, n, k, &strategy, &a, &b, &c, 1.0, 0.0);
        let want = reference_product(m, n, k, &a, &b, 1.0, 0.0, &c);
        assert_eq!(got, want);
    }

    #[test]
    fn scenario3_parallel_k_reduction_matches_beta_accumulation() {
        let (m, n, k) = (6, 6, 8);
        let a: Vec<f64> = (0..m * k).map(|x| x as f64 * 0.3).collect();
        let b: Vec<f64> = (0..k * n).map(|x| x as f64 * -0.1).collect();
        let c: Vec<f64> = (0..m * n).map(|x| x as f64 * 0.05).collect();
        let strategy = compile(m, n, k, 4, GENEROUS, Some(vec![Step::parallel(Axis::K, 4)])).unwrap();

        let got = run_and_reassemble(m, n, k, &strategy, &a, &b, &c, 1.0, 2.0);
        let want = reference_product(m, n, k, &a, &b, 1.0, 2.0, &c);
        for (g, w) in got.iter().zip(want.iter()) {
            assert!((g - w).abs() < 1e-9, "got {g}, want {w}");
        }
    }

    #[test]
    fn nested_same_axis_k_splits_do_not_double_count() {
        // The case that exposed the composition bug during design: two
        // nested Parallel-K steps over 4 ranks (pk2,pk2) must reduce to
        // exactly one copy of each partial sum, not `branch_size` copies.
        let (m, n, k) = (4, 4, 8);
        let a: Vec<f64> = (0..m * k).map(|x| x as f64).collect();
        let b: Vec<f64> = (0..k * n).map(|x| x as f64 * 0.5).collect();
        let c = vec![0.0; m * n];
        let steps = vec![Step::parallel(Axis::K, 2), Step::parallel(Axis::K, 2)];
        let strategy = compile(m, n, k, 4, GENEROUS, Some(steps)).unwrap();

        let got = run_and_reassemble(m, n, k, &strategy, &a, &b, &c, 1.0, 0.0);
        let want = reference_product(m, n, k, &a, &b, 1.0, 0.0, &c);
        for (g, w) in got.iter().zip(want.iter()) {
            assert!((g - w).abs() < 1e-6, "got {g}, want {w} (possible double-counting)");
        }
    }

    #[test]
    fn scenario4_mixed_parallel_sequential_parallel_matches_the_reference_product() {
        let (m, n, k) = (8, 8, 8);
        let a: Vec<f64> = (0..m * k).map(|x| x as f64 * 0.1).collect();
        let b: Vec<f64> = (0..k * n).map(|x| x as f64 * -0.2).collect();
        let c = vec![0.0; m * n];
        let steps = vec![Step::parallel(Axis::M, 2), Step::sequential(Axis::M, 2), Step::parallel(Axis::K, 2)];
        let strategy = compile(m, n, k, 4, GENEROUS, Some(steps)).unwrap();

        let got = run_and_reassemble(m, n, k, &strategy, &a, &b, &c, 1.0, 0.0);
        let want = reference_product(m, n, k, &a, &b, 1.0, 0.0, &c);
        for (g, w) in got.iter().zip(want.iter()) {
            assert!((g - w).abs() < 1e-9, "got {g}, want {w}");
        }
    }

    #[test]
    fn sequential_only_matches_the_reference_product() {
        let (m, n, k) = (6, 6, 6);
        let a: Vec<f64> = (0..m * k).map(|x| x as f64).collect();
        let b: Vec<f64> = (0..k * n).map(|x| x as f64 * 0.1).collect();
        let c: Vec<f64> = (0..m * n).map(|x| x as f64).collect();
        let strategy = compile(m, n, k, 1, GENEROUS, Some(vec![Step::sequential(Axis::K, 3)])).unwrap();

        let got = run_and_reassemble(m, n, k, &strategy, &a, &b, &c, 2.0, 0.5);
        let want = reference_product(m, n, k, &a, &b, 2.0, 0.5, &c);
        for (g, w) in got.iter().zip(want.iter()) {
            assert!((g - w).abs() < 1e-9, "got {g}, want {w}");
        }
    }

    #[test]
    fn scenario6_idle_rank_returns_none_and_active_ranks_match_the_reference_product() {
        let (m, n, k) = (4, 4, 4);
        let a: Vec<f64> = (0..m * k).map(|x| x as f64).collect();
        let b: Vec<f64> = (0..k * n).map(|x| x as f64 * 0.5).collect();
        let c = vec![0.0; m * n];
        let strategy = compile(m, n, k, 3, GENEROUS, None).unwrap();
        assert_eq!(strategy.effective_p(), 2);

        let plans = derive_level_plans(&strategy).unwrap();
        let engine = Engine::new(&strategy, &plans);
        let comms = ThreadCommunicator::world(3);

        let results: Vec<Option<(Interval2D, Vec<f64>)>> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|comm| s.spawn(|| engine.run(comm, &ReferenceGemm, &a, &b, &c, 1.0, 0.0, Op::Identity, Op::Identity).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results[2].is_none(), "rank 2 is idle and must return None");
        let owned: Vec<(Interval2D, Vec<f64>)> = results.into_iter().flatten().collect();
        let got = reassemble(m, n, &owned);
        let want = reference_product(m, n, k, &a, &b, 1.0, 0.0, &c);
        assert_eq!(got, want);
    }

    #[test]
    fn unsupported_op_is_rejected_once_a_strategy_actually_splits() {
        let strategy = compile(8, 8, 8, 4, GENEROUS, Some(vec![Step::parallel(Axis::M, 2), Step::parallel(Axis::N, 2)])).unwrap();
        let plans = derive_level_plans(&strategy).unwrap();
        let engine = Engine::new(&strategy, &plans);
        let comms = ThreadCommunicator::world(4);
        let err = engine
            .run(&comms[0], &ReferenceGemm, &[0.0f64; 64], &[0.0f64; 64], &[0.0f64; 64], 1.0, 0.0, Op::Transpose, Op::Identity)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedDistributedOp { .. }));
    }

    #[test]
    fn leaf_only_transpose_matches_the_transposed_reference_product() {
        // No steps at all (single rank, generous memory): the strategy
        // bottoms out at one local leaf call, so op_a is honored instead of
        // being rejected. m != k so a wrong lda (m instead of k) would fail.
        let (m, n, k) = (2, 2, 3);
        // Logical A (2x3) column-major: [[1,2,3],[4,5,6]] => [1,4,2,5,3,6].
        // Its transpose, column-major (3x2), is the row-major flattening of
        // the logical form: physical storage for op_a = Transpose.
        let a_t = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let a_logical = vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0];
        let b = vec![7.0, 9.0, 11.0, 8.0, 10.0, 12.0]; // logical B (3x2), column-major
        let c = vec![0.0; m * n];
        let strategy = compile(m, n, k, 1, GENEROUS, None).unwrap();
        assert!(strategy.steps.is_empty());

        let plans = derive_level_plans(&strategy).unwrap();
        let engine = Engine::new(&strategy, &plans);
        let comms = ThreadCommunicator::world(1);
        let (_, got) = engine.run(&comms[0], &ReferenceGemm, &a_t, &b, &c, 1.0, 0.0, Op::Transpose, Op::Identity).unwrap().unwrap();

        let want = reference_product(m, n, k, &a_logical, &b, 1.0, 0.0, &c);
        assert_eq!(got, want);
    }
}
