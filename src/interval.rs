//! Interval algebra
//!
//! Half-open-free integer ranges and their 2-D products, with an exact,
//! deterministic splitting rule that the layout mapper and the multiply
//! engine both rely on bit-for-bit.
//!
//! ## Tie-breaking contract
//! Splitting an [`Interval`] of length `L` into `d` pieces assigns the
//! `i`-th piece the (relative) bounds `[⌊L·i/d⌋, ⌊L·(i+1)/d⌋ − 1]`. Lengths
//! differ by at most one, and the larger pieces are always the
//! lower-indexed ones. This is not an implementation detail — the data
//! layout mapper and every rank in a communicator must derive the same
//! partition from the same `(L, d)`, so the formula itself is the contract,
//! not merely "some correct partition".

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors constructing or splitting an [`Interval`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("interval bounds must satisfy first <= last (got first={first}, last={last})")]
    BackwardsRange { first: usize, last: usize },
    #[error("divisor must be >= 1 (got {0})")]
    BadDivisor(usize),
    #[error("divisor {d} exceeds interval length {length}; cannot produce {d} nonempty pieces")]
    DivisorExceedsLength { d: usize, length: usize },
    #[error("sub-interval index {i} out of range (d={d})")]
    SubIndexOutOfRange { i: usize, d: usize },
    #[error("x={x} is not contained in the interval [{first}, {last}]")]
    NotContained { x: usize, first: usize, last: usize },
}

/// A nonempty closed range `[first, last]` of nonnegative integers.
///
/// Invariant: `first <= last`. There is no empty `Interval` — a zero-length
/// region is represented by simply not having a rank own one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Interval {
    first: usize,
    last: usize,
}

impl Interval {
    /// Construct an interval, validating `first <= last` (result-returning).
    #[inline]
    pub fn new_r(first: usize, last: usize) -> Result<Self, IntervalError> {
        if first > last {
            return Err(IntervalError::BackwardsRange { first, last });
        }
        Ok(Self { first, last })
    }

    /// Construct an interval (panics on invalid bounds).
    ///
    /// Constructing an `Interval` with `first > last` is a programmer error,
    /// matching §4.1 of the design: it is not a runtime condition a caller
    /// should expect to recover from.
    #[inline]
    pub fn new(first: usize, last: usize) -> Self {
        Self::new_r(first, last).expect("Interval::new: first must be <= last")
    }

    /// Inclusive start.
    #[inline]
    pub fn first(&self) -> usize {
        self.first
    }

    /// Inclusive end.
    #[inline]
    pub fn last(&self) -> usize {
        self.last
    }

    /// Number of integers covered, `last - first + 1`.
    #[inline]
    pub fn length(&self) -> usize {
        self.last - self.first + 1
    }

    /// Whether `x` lies within `[first, last]`.
    #[inline]
    pub fn contains(&self, x: usize) -> bool {
        x >= self.first && x <= self.last
    }

    /// Whether `self` lies entirely before `other` (`self.last < other.first`).
    #[inline]
    pub fn precedes(&self, other: &Interval) -> bool {
        self.last < other.first
    }

    /// The `i`-th of `d` contiguous sub-intervals, per the tie-breaking
    /// contract in the module docs (result-returning).
    pub fn subinterval_r(&self, d: usize, i: usize) -> Result<Interval, IntervalError> {
        if d == 0 {
            return Err(IntervalError::BadDivisor(d));
        }
        let length = self.length();
        if d > length {
            return Err(IntervalError::DivisorExceedsLength { d, length });
        }
        if i >= d {
            return Err(IntervalError::SubIndexOutOfRange { i, d });
        }
        let l = length as u128;
        let start = (l * i as u128 / d as u128) as usize;
        let end = (l * (i + 1) as u128 / d as u128) as usize;
        debug_assert!(end > start, "tie-break formula must yield a nonempty piece when d <= length");
        Ok(Interval::new(self.first + start, self.first + end - 1))
    }

    /// The `i`-th of `d` contiguous sub-intervals (panics on invalid `d`/`i`).
    #[inline]
    pub fn subinterval(&self, d: usize, i: usize) -> Interval {
        self.subinterval_r(d, i).expect("Interval::subinterval: invalid divisor or index")
    }

    /// All `d` sub-intervals produced by [`subinterval`](Self::subinterval),
    /// in index order (result-returning).
    pub fn divide_by_r(&self, d: usize) -> Result<Vec<Interval>, IntervalError> {
        if d == 0 {
            return Err(IntervalError::BadDivisor(d));
        }
        if d > self.length() {
            return Err(IntervalError::DivisorExceedsLength { d, length: self.length() });
        }
        Ok((0..d).map(|i| self.subinterval(d, i)).collect())
    }

    /// All `d` sub-intervals (panics on invalid `d`).
    #[inline]
    pub fn divide_by(&self, d: usize) -> Vec<Interval> {
        self.divide_by_r(d).expect("Interval::divide_by: invalid divisor")
    }

    /// Locate `x` within the `d`-way split: returns `(i, off)` such that `x`
    /// is the `off`-th element (0-based) of sub-interval `i`.
    ///
    /// Inverse of [`locate_in_interval`](Self::locate_in_interval).
    pub fn locate_in_subinterval_r(&self, d: usize, x: usize) -> Result<(usize, usize), IntervalError> {
        if d == 0 {
            return Err(IntervalError::BadDivisor(d));
        }
        let length = self.length();
        if d > length {
            return Err(IntervalError::DivisorExceedsLength { d, length });
        }
        if !self.contains(x) {
            return Err(IntervalError::NotContained { x, first: self.first, last: self.last });
        }
        let l = length as u128;
        let r = (x - self.first) as u128;

        // `start(i) = floor(l * i / d)` is non-decreasing in `i`; binary
        // search for the largest `i` with `start(i) <= r`.
        let (mut lo, mut hi) = (0usize, d); // invariant: start(lo) <= r < start(hi)
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            let start_mid = (l * mid as u128) / d as u128;
            if start_mid <= r {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let start_lo = (l * lo as u128 / d as u128) as u128;
        let off = (r - start_lo) as usize;
        Ok((lo, off))
    }

    /// Locate `x` within the `d`-way split (panics on invalid input).
    #[inline]
    pub fn locate_in_subinterval(&self, d: usize, x: usize) -> (usize, usize) {
        self.locate_in_subinterval_r(d, x).expect("Interval::locate_in_subinterval: invalid input")
    }

    /// Inverse of [`locate_in_subinterval`](Self::locate_in_subinterval):
    /// recover the global `x` from `(i, off)`.
    pub fn locate_in_interval_r(&self, d: usize, i: usize, off: usize) -> Result<usize, IntervalError> {
        let sub = self.subinterval_r(d, i)?;
        if off >= sub.length() {
            return Err(IntervalError::SubIndexOutOfRange { i: off, d: sub.length() });
        }
        Ok(sub.first + off)
    }

    /// Inverse of [`locate_in_subinterval`](Self::locate_in_subinterval)
    /// (panics on invalid input).
    #[inline]
    pub fn locate_in_interval(&self, d: usize, i: usize, off: usize) -> usize {
        self.locate_in_interval_r(d, i, off).expect("Interval::locate_in_interval: invalid input")
    }
}

/// An ordered pair `(rows, cols)` representing a rectangular sub-matrix
/// region. Local storage within the region is **column-major**:
/// `local_index(r, c) = (c - cols.first) * rows.length() + (r - rows.first)`.
///
/// Splitting an `Interval2D` only ever splits `cols`; `rows` is preserved.
/// This matches the contract the layout mapper depends on: a Parallel step
/// on axis M always splits the row interval of the *matrices whose M
/// dimension varies* by transposing the roles before calling into here, so
/// that the single column-major split rule stays uniform everywhere.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval2D {
    pub rows: Interval,
    pub cols: Interval,
}

impl Interval2D {
    /// Construct a 2-D interval from its row and column ranges.
    #[inline]
    pub fn new(rows: Interval, cols: Interval) -> Self {
        Self { rows, cols }
    }

    /// Total element count, `rows.length() * cols.length()`.
    #[inline]
    pub fn num_elements(&self) -> usize {
        self.rows.length() * self.cols.length()
    }

    /// Column-major local linear index of global `(r, c)` within this region.
    #[inline]
    pub fn local_index(&self, r: usize, c: usize) -> usize {
        debug_assert!(self.rows.contains(r) && self.cols.contains(c));
        (c - self.cols.first()) * self.rows.length() + (r - self.rows.first())
    }

    /// Split the column interval into `d` pieces, keeping `rows` fixed
    /// (result-returning).
    pub fn divide_cols_r(&self, d: usize) -> Result<Vec<Interval2D>, IntervalError> {
        Ok(self
            .cols
            .divide_by_r(d)?
            .into_iter()
            .map(|c| Interval2D::new(self.rows, c))
            .collect())
    }

    /// Split the column interval into `d` pieces (panics on invalid `d`).
    #[inline]
    pub fn divide_cols(&self, d: usize) -> Vec<Interval2D> {
        self.divide_cols_r(d).expect("Interval2D::divide_cols: invalid divisor")
    }

    /// Split the row interval into `d` pieces, keeping `cols` fixed
    /// (result-returning). The layout mapper uses this when the axis being
    /// split is a matrix's row dimension rather than its column dimension —
    /// `Interval2D` itself has no preferred split axis, only `local_index`
    /// has a fixed (column-major) orientation.
    pub fn divide_rows_r(&self, d: usize) -> Result<Vec<Interval2D>, IntervalError> {
        Ok(self
            .rows
            .divide_by_r(d)?
            .into_iter()
            .map(|r| Interval2D::new(r, self.cols))
            .collect())
    }

    /// Split the row interval into `d` pieces (panics on invalid `d`).
    #[inline]
    pub fn divide_rows(&self, d: usize) -> Vec<Interval2D> {
        self.divide_rows_r(d).expect("Interval2D::divide_rows: invalid divisor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subinterval_tie_break_examples_from_spec() {
        let i = Interval::new(0, 9);

        let got3: Vec<Interval> = (0..3).map(|k| i.subinterval(3, k)).collect();
        assert_eq!(got3, vec![Interval::new(0, 2), Interval::new(3, 5), Interval::new(6, 9)]);

        let got4: Vec<Interval> = (0..4).map(|k| i.subinterval(4, k)).collect();
        assert_eq!(
            got4,
            vec![Interval::new(0, 1), Interval::new(2, 4), Interval::new(5, 6), Interval::new(7, 9)]
        );
    }

    #[test]
    fn divide_by_partitions_exactly() {
        // Property #3: for any interval of length L >= d, the d
        // sub-intervals partition it exactly.
        for length in 1..=37usize {
            let iv = Interval::new(100, 100 + length - 1);
            for d in 1..=length {
                let pieces = iv.divide_by(d);
                assert_eq!(pieces.len(), d);

                // Pairwise disjoint and strictly ordered.
                for w in pieces.windows(2) {
                    assert!(w[0].precedes(&w[1]), "pieces must be disjoint and ordered");
                }
                // Union covers the original interval exactly.
                assert_eq!(pieces.first().unwrap().first(), iv.first());
                assert_eq!(pieces.last().unwrap().last(), iv.last());
                let total: usize = pieces.iter().map(|p| p.length()).sum();
                assert_eq!(total, iv.length());

                // Lengths differ by at most one (property #3's balance bound).
                let lens: Vec<usize> = pieces.iter().map(|p| p.length()).collect();
                let (min, max) = (*lens.iter().min().unwrap(), *lens.iter().max().unwrap());
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn locate_round_trips() {
        let iv = Interval::new(50, 99); // length 50
        for d in 1..=50usize {
            for x in iv.first()..=iv.last() {
                let (i, off) = iv.locate_in_subinterval(d, x);
                assert!(i < d);
                let back = iv.locate_in_interval(d, i, off);
                assert_eq!(back, x);
            }
        }
    }

    #[test]
    fn divisor_exceeding_length_is_an_error() {
        let iv = Interval::new(0, 2); // length 3
        assert_eq!(
            iv.divide_by_r(4),
            Err(IntervalError::DivisorExceedsLength { d: 4, length: 3 })
        );
    }

    #[test]
    fn backwards_bounds_is_an_error() {
        assert_eq!(
            Interval::new_r(5, 2),
            Err(IntervalError::BackwardsRange { first: 5, last: 2 })
        );
    }

    #[test]
    fn interval2d_local_index_is_column_major() {
        let region = Interval2D::new(Interval::new(10, 12), Interval::new(100, 101));
        // rows.length() == 3
        assert_eq!(region.local_index(10, 100), 0);
        assert_eq!(region.local_index(11, 100), 1);
        assert_eq!(region.local_index(12, 100), 2);
        assert_eq!(region.local_index(10, 101), 3);
        assert_eq!(region.num_elements(), 6);
    }

    #[test]
    fn interval2d_divide_cols_keeps_rows() {
        let region = Interval2D::new(Interval::new(0, 9), Interval::new(0, 3));
        let pieces = region.divide_cols(2);
        assert_eq!(pieces.len(), 2);
        for p in &pieces {
            assert_eq!(p.rows, region.rows);
        }
        assert_eq!(pieces[0].cols, Interval::new(0, 1));
        assert_eq!(pieces[1].cols, Interval::new(2, 3));
    }

    #[test]
    fn interval2d_divide_rows_keeps_cols() {
        let region = Interval2D::new(Interval::new(0, 3), Interval::new(0, 9));
        let pieces = region.divide_rows(2);
        assert_eq!(pieces.len(), 2);
        for p in &pieces {
            assert_eq!(p.cols, region.cols);
        }
        assert_eq!(pieces[0].rows, Interval::new(0, 1));
        assert_eq!(pieces[1].rows, Interval::new(2, 3));
    }
}
