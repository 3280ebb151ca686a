//! Data-layout mapper
//!
//! Describes how a matrix's elements are distributed across processes (the
//! [`LayoutDescriptor`] capability trait and the native [`NativeLayout`]
//! implementation), and turns a compiled [`Strategy`](crate::strategy::Strategy)
//! into a list of [`LevelPlan`]s: one per step, each recording the regions
//! every sub-communicator owns after that step and the data movement
//! needed to get there.
//!
//! [`LayoutDescriptor`] is modeled as a trait rather than a class hierarchy
//! so that both the native layout and the block-cyclic shim
//! ([`crate::shim`]) satisfy it without virtual dispatch on any hot path —
//! every caller of this trait is generic over the concrete implementation.

#![forbid(unsafe_code)]

use thiserror::Error;
use tracing::trace;

use crate::interval::{Interval, Interval2D, IntervalError};
use crate::strategy::{Axis, Step, StepKind, Strategy};

/// Errors raised while querying a layout or deriving level plans.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error(transparent)]
    Interval(#[from] IntervalError),
    #[error("global position ({r}, {c}) is not owned by any rank in this layout")]
    NotOwned { r: usize, c: usize },
    #[error("rank {rank} is out of range (layout spans {len} ranks)")]
    RankOutOfRange { rank: usize, len: usize },
    #[error("layout rank count {layout_ranks} does not match the {expected} ranks this strategy targets")]
    RankCountMismatch { layout_ranks: usize, expected: usize },
}

/// Which of the three matrices a region or movement belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MatrixRole {
    A,
    B,
    C,
}

/// A mapping from global `(row, col)` to `(owning rank, local offset)`, plus
/// its inverse view: an enumeration of the 2-D regions a given rank owns.
/// Any type satisfying this contract — COSMA's own [`NativeLayout`] or a
/// caller's block-cyclic descriptor via [`crate::shim`] — can be handed to
/// [`crate::multiply`].
pub trait LayoutDescriptor {
    fn global_rows(&self) -> usize;
    fn global_cols(&self) -> usize;
    fn num_ranks(&self) -> usize;

    /// The rank owning global `(r, c)`.
    fn owner(&self, r: usize, c: usize) -> Result<usize, LayoutError>;

    /// The offset of `(r, c)` within its owning rank's local buffer.
    fn local_offset(&self, r: usize, c: usize) -> Result<usize, LayoutError>;

    /// The 2-D regions `rank` owns (native layouts: exactly one; block-cyclic: many).
    fn owned_regions(&self, rank: usize) -> Result<Vec<Interval2D>, LayoutError>;
}

/// COSMA's own layout: each rank owns a *set* of [`Interval2D`] regions
/// (per §A.6), stored column-major locally within each region, with a
/// rank's local buffer laid out as its regions concatenated in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeLayout {
    global_rows: usize,
    global_cols: usize,
    regions: Vec<Vec<Interval2D>>,
}

impl NativeLayout {
    /// Build a native layout from an explicit region set per rank.
    pub fn new(global_rows: usize, global_cols: usize, regions: Vec<Vec<Interval2D>>) -> Self {
        Self { global_rows, global_cols, regions }
    }

    /// The common case: split the full `global_rows x global_cols` matrix
    /// into `p` column slices, one (single-region) rank each, using
    /// [`Interval2D::divide_cols`].
    pub fn uniform_columns(global_rows: usize, global_cols: usize, p: usize) -> Result<Self, LayoutError> {
        let whole = Interval2D::new(Interval::new(0, global_rows - 1), Interval::new(0, global_cols - 1));
        let regions = whole.divide_cols_r(p)?.into_iter().map(|r| vec![r]).collect();
        Ok(Self { global_rows, global_cols, regions })
    }
}

impl LayoutDescriptor for NativeLayout {
    fn global_rows(&self) -> usize {
        self.global_rows
    }

    fn global_cols(&self) -> usize {
        self.global_cols
    }

    fn num_ranks(&self) -> usize {
        self.regions.len()
    }

    fn owner(&self, r: usize, c: usize) -> Result<usize, LayoutError> {
        self.regions
            .iter()
            .position(|rank_regions| rank_regions.iter().any(|region| region.rows.contains(r) && region.cols.contains(c)))
            .ok_or(LayoutError::NotOwned { r, c })
    }

    fn local_offset(&self, r: usize, c: usize) -> Result<usize, LayoutError> {
        let rank = self.owner(r, c)?;
        let mut offset = 0usize;
        for region in &self.regions[rank] {
            if region.rows.contains(r) && region.cols.contains(c) {
                return Ok(offset + region.local_index(r, c));
            }
            offset += region.num_elements();
        }
        Err(LayoutError::NotOwned { r, c })
    }

    fn owned_regions(&self, rank: usize) -> Result<Vec<Interval2D>, LayoutError> {
        self.regions.get(rank).cloned().ok_or(LayoutError::RankOutOfRange { rank, len: self.regions.len() })
    }
}

/// Per-matrix shape and orientation, independent of which concrete
/// [`LayoutDescriptor`] backs it (§A.3's "MatrixDescriptor").
#[derive(Copy, Clone, Debug)]
pub struct MatrixDescriptor {
    pub global_rows: usize,
    pub global_cols: usize,
    pub op: crate::gemm::Op,
}

impl MatrixDescriptor {
    pub fn new(global_rows: usize, global_cols: usize, op: crate::gemm::Op) -> Self {
        Self { global_rows, global_cols, op }
    }
}

/// One `(sender, receiver, region)` data-movement triple, scoped to a single matrix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MovementTriple {
    pub matrix: MatrixRole,
    pub sender: usize,
    pub receiver: usize,
    pub region: Interval2D,
}

/// How ranks are grouped at a level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LevelAssignment {
    /// `sub_comm_of_rank[r]` is the sub-communicator index rank `r` belongs
    /// to after this split (`0..divisor`).
    Parallel { divisor: usize, sub_comm_of_rank: Vec<usize> },
    /// Same ranks throughout; `divisor` sub-intervals are visited back to
    /// back on each rank, one at a time.
    Sequential { divisor: usize },
}

/// The fully-resolved plan for one [`Step`]: who ends up owning what, and
/// (for `Parallel` steps) the movements that get them there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelPlan {
    pub step: Step,
    pub assignment: LevelAssignment,
    /// Regions owned by each sub-communicator (`Parallel`) or visited in
    /// sequence (`Sequential`), as `[A, B, C]` triples.
    pub regions: Vec<[Interval2D; 3]>,
    pub movements: Vec<MovementTriple>,
}

#[derive(Clone, Copy, Debug)]
struct Group {
    rank_start: usize,
    rank_count: usize,
    region: [Interval2D; 3],
}

/// Split a group's `[A, B, C]` region for a `Parallel` or `Sequential` step
/// on `axis`, returning the `d` resulting region triples in sub-index
/// order. Only the matrices whose dimension `axis` names are actually
/// split; the third is replicated unchanged (per §4.3: "the other two
/// matrices are broadcast" for Parallel; for Sequential the unaffected
/// matrices are simply not touched).
pub(crate) fn split_region(region: [Interval2D; 3], axis: Axis, d: usize) -> Result<Vec<[Interval2D; 3]>, LayoutError> {
    let [a, b, c] = region;
    let (a_pieces, b_pieces, c_pieces): (Vec<Interval2D>, Vec<Interval2D>, Vec<Interval2D>) = match axis {
        Axis::M => (a.divide_rows_r(d)?, vec![b; d], c.divide_rows_r(d)?),
        Axis::N => (vec![a; d], b.divide_cols_r(d)?, c.divide_cols_r(d)?),
        Axis::K => (a.divide_cols_r(d)?, b.divide_rows_r(d)?, vec![c; d]),
    };
    Ok((0..d).map(|i| [a_pieces[i], b_pieces[i], c_pieces[i]]).collect())
}

/// The matrices that must actually be moved to every destination when a
/// `Parallel` step splits `axis`: A and B are always read-inputs to the
/// leaf GEMM (one split by this axis, the other broadcast unsplit); C is
/// never part of the distribute phase — its contribution is resolved after
/// the recursion returns (reduced for K, gathered for M/N), per §4.3/§4.5.
const SPLIT_ROLES: [MatrixRole; 2] = [MatrixRole::A, MatrixRole::B];

/// Derive the list of [`LevelPlan`]s for a compiled [`Strategy`], one per
/// step, starting from the single root group that owns the whole problem
/// (ranks `0..strategy.effective_p()`).
///
/// Reconciling a caller's non-native initial layout (e.g. block-cyclic)
/// with this root-owns-everything starting point is the job of
/// [`crate::shim`], not of this function.
pub fn derive_level_plans(strategy: &Strategy) -> Result<Vec<LevelPlan>, LayoutError> {
    let whole = |len: usize| Interval::new(0, len - 1);
    let root_region = [
        Interval2D::new(whole(strategy.m), whole(strategy.k)), // A: m x k
        Interval2D::new(whole(strategy.k), whole(strategy.n)), // B: k x n
        Interval2D::new(whole(strategy.m), whole(strategy.n)), // C: m x n
    ];
    let mut groups = vec![Group { rank_start: 0, rank_count: strategy.effective_p(), region: root_region }];

    let mut plans = Vec::with_capacity(strategy.steps.len());
    for step in &strategy.steps {
        match step.kind {
            StepKind::Parallel => {
                let mut new_groups = Vec::with_capacity(groups.len() * step.divisor);
                let mut movements = Vec::new();
                let mut sub_comm_of_rank = vec![0usize; strategy.effective_p()];
                let mut level_regions = Vec::with_capacity(groups.len() * step.divisor);

                for group in &groups {
                    let d = step.divisor;
                    debug_assert_eq!(group.rank_count % d, 0, "strategy divisors must evenly factor the group");
                    let sub_size = group.rank_count / d;
                    let pieces = split_region(group.region, step.axis, d)?;
                    let root = group.rank_start;

                    for (i, region) in pieces.into_iter().enumerate() {
                        let new_rank_start = group.rank_start + i * sub_size;
                        for r in new_rank_start..new_rank_start + sub_size {
                            sub_comm_of_rank[r] = new_groups.len();
                        }
                        for role in SPLIT_ROLES {
                            let idx = match role {
                                MatrixRole::A => 0,
                                MatrixRole::B => 1,
                                MatrixRole::C => 2,
                            };
                            for receiver in new_rank_start..new_rank_start + sub_size {
                                trace!(?role, root, receiver, "movement triple computed");
                                movements.push(MovementTriple { matrix: role, sender: root, receiver, region: region[idx] });
                            }
                        }
                        level_regions.push(region);
                        new_groups.push(Group { rank_start: new_rank_start, rank_count: sub_size, region });
                    }
                }

                groups = new_groups;
                plans.push(LevelPlan {
                    step: *step,
                    assignment: LevelAssignment::Parallel { divisor: step.divisor, sub_comm_of_rank },
                    regions: level_regions,
                    movements,
                });
            }
            StepKind::Sequential => {
                let mut level_regions = Vec::with_capacity(groups.len());
                let mut new_groups = Vec::with_capacity(groups.len());
                for group in &groups {
                    let pieces = split_region(group.region, step.axis, step.divisor)?;
                    // The group's shape continues with the (pessimistic,
                    // first/largest) sub-interval; the engine iterates all
                    // `divisor` pieces locally within this same rank set.
                    let continuing = pieces[0];
                    level_regions.push(continuing);
                    new_groups.push(Group { region: continuing, ..*group });
                }
                groups = new_groups;
                plans.push(LevelPlan {
                    step: *step,
                    assignment: LevelAssignment::Sequential { divisor: step.divisor },
                    regions: level_regions,
                    movements: Vec::new(),
                });
            }
        }
    }
    Ok(plans)
}

/// Each of `0..strategy.effective_p()` ranks' final `[A, B, C]` region once
/// every step has been applied. The same group-splitting walk
/// [`derive_level_plans`] does, without the movement bookkeeping — lets a
/// caller size its own output buffer, or a test reassemble a distributed `C`
/// back into one matrix, without re-deriving the whole level-by-level plan.
pub fn final_regions(strategy: &Strategy) -> Result<Vec<[Interval2D; 3]>, LayoutError> {
    let whole = |len: usize| Interval::new(0, len - 1);
    let root_region = [
        Interval2D::new(whole(strategy.m), whole(strategy.k)),
        Interval2D::new(whole(strategy.k), whole(strategy.n)),
        Interval2D::new(whole(strategy.m), whole(strategy.n)),
    ];
    let mut groups = vec![Group { rank_start: 0, rank_count: strategy.effective_p(), region: root_region }];
    for step in &strategy.steps {
        let mut new_groups = Vec::with_capacity(groups.len() * step.divisor.max(1));
        for group in &groups {
            match step.kind {
                StepKind::Parallel => {
                    let d = step.divisor;
                    let sub_size = group.rank_count / d;
                    let pieces = split_region(group.region, step.axis, d)?;
                    for (i, region) in pieces.into_iter().enumerate() {
                        new_groups.push(Group { rank_start: group.rank_start + i * sub_size, rank_count: sub_size, region });
                    }
                }
                StepKind::Sequential => {
                    let pieces = split_region(group.region, step.axis, step.divisor)?;
                    new_groups.push(Group { region: pieces[0], ..*group });
                }
            }
        }
        groups = new_groups;
    }
    let mut out = vec![root_region; strategy.effective_p()];
    for group in &groups {
        for r in group.rank_start..group.rank_start + group.rank_count {
            out[r] = group.region;
        }
    }
    Ok(out)
}
