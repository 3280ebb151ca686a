//! Local GEMM kernel
//!
//! The recursion leaf of a multiply call is a fully local, single-process
//! matrix product. This module defines the [`LocalGemm`] trait that
//! boundary sits behind, the closed [`Scalar`] element-type set COSMA
//! supports, and [`ReferenceGemm`] — a correct, `rayon`-parallel
//! implementation used by every test and by the CLI miniapp. Swapping in a
//! vendor BLAS is the expected production path and is deliberately left as
//! "implement this trait"; it is not this crate's concern.

#![forbid(unsafe_code)]

use num_complex::{Complex32, Complex64};
use num_traits::{One, Zero};
use rayon::prelude::*;
use thiserror::Error;

/// Errors a [`LocalGemm`] backend may report.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GemmError {
    #[error("dimension mismatch: {what} expected length >= {expected}, got {got}")]
    DimensionMismatch { what: &'static str, expected: usize, got: usize },
    /// Reserved for non-reference backends (device/driver failures).
    #[error("device failure: {0}")]
    DeviceFailure(String),
}

/// How a matrix argument is interpreted relative to its physical storage.
/// Collapses to [`Op::Transpose`]'s behaviour for real [`Scalar`]s, since
/// [`Scalar::conjugate`] is the identity there.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Identity,
    Transpose,
    ConjugateTranspose,
}

impl Op {
    #[inline]
    fn is_transposed(self) -> bool {
        !matches!(self, Op::Identity)
    }

    #[inline]
    fn conjugates(self) -> bool {
        matches!(self, Op::ConjugateTranspose)
    }
}

/// The closed set of element types a multiply call may use: real or
/// complex, single or double precision.
pub trait Scalar:
    Copy
    + Send
    + Sync
    + std::fmt::Debug
    + Zero
    + One
    + std::ops::Add<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::AddAssign
{
    /// Complex conjugate; the identity for real types.
    fn conjugate(self) -> Self;
}

impl Scalar for f32 {
    #[inline]
    fn conjugate(self) -> Self {
        self
    }
}

impl Scalar for f64 {
    #[inline]
    fn conjugate(self) -> Self {
        self
    }
}

impl Scalar for Complex32 {
    #[inline]
    fn conjugate(self) -> Self {
        Complex32::conj(&self)
    }
}

impl Scalar for Complex64 {
    #[inline]
    fn conjugate(self) -> Self {
        Complex64::conj(&self)
    }
}

/// A local, single-process matrix-multiply primitive:
/// `C <- alpha * op_a(A) * op_b(B) + beta * C`.
///
/// Matrices are column-major. `a`/`b`/`c` are the *physical* storage (before
/// `op_a`/`op_b` are applied); `lda`/`ldb`/`ldc` are physical leading
/// dimensions, matching the `p?gemm`/BLAS convention the interop shim
/// targets.
pub trait LocalGemm<T: Scalar> {
    #[allow(clippy::too_many_arguments)]
    fn gemm(
        &self,
        m: usize,
        n: usize,
        k: usize,
        alpha: T,
        a: &[T],
        lda: usize,
        op_a: Op,
        b: &[T],
        ldb: usize,
        op_b: Op,
        beta: T,
        c: &mut [T],
        ldc: usize,
    ) -> Result<(), GemmError>;
}

/// Physical (rows, cols) of a matrix argument given its logical (m, n) and
/// whether it enters the product transposed.
#[inline]
fn physical_dims(logical_rows: usize, logical_cols: usize, op: Op) -> (usize, usize) {
    if op.is_transposed() {
        (logical_cols, logical_rows)
    } else {
        (logical_rows, logical_cols)
    }
}

#[inline]
fn elem<T: Scalar>(buf: &[T], ld: usize, op: Op, row: usize, col: usize) -> T {
    let (phys_row, phys_col) = if op.is_transposed() { (col, row) } else { (row, col) };
    let v = buf[phys_col * ld + phys_row];
    if op.conjugates() {
        v.conjugate()
    } else {
        v
    }
}

fn check_len(what: &'static str, buf_len: usize, ld: usize, cols: usize) -> Result<(), GemmError> {
    let expected = ld * cols;
    if buf_len < expected {
        return Err(GemmError::DimensionMismatch { what, expected, got: buf_len });
    }
    Ok(())
}

/// A correct, cache-oblivious, `rayon`-parallel reference [`LocalGemm`].
/// Parallelizes over output columns: each column of `C` is owned by exactly
/// one task, so there is no data race on the mutable output.
#[derive(Copy, Clone, Debug, Default)]
pub struct ReferenceGemm;

impl<T: Scalar> LocalGemm<T> for ReferenceGemm {
    fn gemm(
        &self,
        m: usize,
        n: usize,
        k: usize,
        alpha: T,
        a: &[T],
        lda: usize,
        op_a: Op,
        b: &[T],
        ldb: usize,
        op_b: Op,
        beta: T,
        c: &mut [T],
        ldc: usize,
    ) -> Result<(), GemmError> {
        let (a_rows, a_cols) = physical_dims(m, k, op_a);
        let (b_rows, b_cols) = physical_dims(k, n, op_b);
        if a_rows > lda {
            return Err(GemmError::DimensionMismatch { what: "lda", expected: a_rows, got: lda });
        }
        if b_rows > ldb {
            return Err(GemmError::DimensionMismatch { what: "ldb", expected: b_rows, got: ldb });
        }
        if m > ldc {
            return Err(GemmError::DimensionMismatch { what: "ldc", expected: m, got: ldc });
        }
        check_len("a", a.len(), lda, a_cols)?;
        check_len("b", b.len(), ldb, b_cols)?;
        check_len("c", c.len(), ldc, n)?;

        c.par_chunks_mut(ldc).take(n).enumerate().for_each(|(j, col)| {
            for i in 0..m {
                let mut acc = T::zero();
                for p in 0..k {
                    acc += elem(a, lda, op_a, i, p) * elem(b, ldb, op_b, p, j);
                }
                col[i] = alpha * acc + beta * col[i];
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity3() -> Vec<f64> {
        vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
    }

    #[test]
    fn identity_times_identity_is_identity() {
        let a = identity3();
        let b = identity3();
        let mut c = vec![0.0; 9];
        ReferenceGemm
            .gemm(3, 3, 3, 1.0, &a, 3, Op::Identity, &b, 3, Op::Identity, 0.0, &mut c, 3)
            .unwrap();
        assert_eq!(c, identity3());
    }

    #[test]
    fn two_by_two_known_product() {
        // A = [[1,2],[3,4]] column-major => [1,3,2,4]
        let a = vec![1.0, 3.0, 2.0, 4.0];
        // B = [[5,6],[7,8]] column-major => [5,7,6,8]
        let b = vec![5.0, 7.0, 6.0, 8.0];
        let mut c = vec![0.0; 4];
        ReferenceGemm
            .gemm(2, 2, 2, 1.0, &a, 2, Op::Identity, &b, 2, Op::Identity, 0.0, &mut c, 2)
            .unwrap();
        // Expected A*B = [[19,22],[43,50]] column-major => [19,43,22,50]
        assert_eq!(c, vec![19.0, 43.0, 22.0, 50.0]);
    }

    #[test]
    fn beta_accumulates_onto_existing_c() {
        let a = identity3();
        let b = identity3();
        let mut c = vec![1.0; 9]; // C pre-filled to ones, beta=1 (scenario 3 shape)
        ReferenceGemm
            .gemm(3, 3, 3, 1.0, &a, 3, Op::Identity, &b, 3, Op::Identity, 1.0, &mut c, 3)
            .unwrap();
        let expected = [2.0, 1.0, 1.0, 1.0, 2.0, 1.0, 1.0, 1.0, 2.0];
        assert_eq!(c, expected);
    }

    #[test]
    fn transpose_flag_is_honored_without_physical_rearrangement() {
        // A physically stored as its transpose: op_a = Transpose recovers
        // the same logical product as the identity case above.
        let a_t = vec![1.0, 2.0, 3.0, 4.0]; // transpose of [1,3,2,4] stored 2x2
        let b = vec![5.0, 7.0, 6.0, 8.0];
        let mut c = vec![0.0; 4];
        ReferenceGemm
            .gemm(2, 2, 2, 1.0, &a_t, 2, Op::Transpose, &b, 2, Op::Identity, 0.0, &mut c, 2)
            .unwrap();
        assert_eq!(c, vec![19.0, 43.0, 22.0, 50.0]);
    }

    #[test]
    fn conjugate_transpose_conjugates_complex_entries() {
        // Physical A is 2x1 (lda=2); op_a=ConjugateTranspose makes the
        // logical A a 1x2 row of conjugated entries.
        let a = vec![Complex64::new(1.0, 1.0), Complex64::new(2.0, -1.0)];
        // Physical B is 2x1 (ldb=2), op_b=Identity, logical k=2,n=1.
        let b = vec![Complex64::new(1.0, 0.0), Complex64::new(1.0, 0.0)];
        let mut c = vec![Complex64::new(0.0, 0.0)]; // logical 1x1, ldc=1

        ReferenceGemm
            .gemm(
                1,
                1,
                2,
                Complex64::new(1.0, 0.0),
                &a,
                2,
                Op::ConjugateTranspose,
                &b,
                2,
                Op::Identity,
                Complex64::new(0.0, 0.0),
                &mut c,
                1,
            )
            .unwrap();
        // conj(1+1i) + conj(2-1i) = (1-1i) + (2+1i) = 3+0i
        assert_eq!(c[0], Complex64::new(3.0, 0.0));
    }

    #[test]
    fn dimension_mismatch_is_reported() {
        let a = vec![1.0; 4];
        let b = vec![1.0; 4];
        let mut c = vec![0.0; 2];
        let err = ReferenceGemm
            .gemm(2, 2, 2, 1.0, &a, 2, Op::Identity, &b, 2, Op::Identity, 0.0, &mut c, 1)
            .unwrap_err();
        assert!(matches!(err, GemmError::DimensionMismatch { .. }));
    }

    #[test]
    fn random_inputs_agree_with_a_naive_triple_loop() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0xC05A1);
        for _ in 0..20 {
            let m = rng.gen_range(1..8);
            let n = rng.gen_range(1..8);
            let k = rng.gen_range(1..8);
            let a: Vec<f64> = (0..m * k).map(|_| rng.gen_range(-5.0..5.0)).collect();
            let b: Vec<f64> = (0..k * n).map(|_| rng.gen_range(-5.0..5.0)).collect();
            let mut c = vec![0.0; m * n];
            ReferenceGemm.gemm(m, n, k, 1.0, &a, m, Op::Identity, &b, k, Op::Identity, 0.0, &mut c, m).unwrap();

            let mut expected = vec![0.0; m * n];
            for j in 0..n {
                for i in 0..m {
                    let mut acc = 0.0;
                    for p in 0..k {
                        acc += a[p * m + i] * b[j * k + p];
                    }
                    expected[j * m + i] = acc;
                }
            }
            for (got, want) in c.iter().zip(expected.iter()) {
                assert!((got - want).abs() < 1e-9, "m={m} n={n} k={k}: {got} != {want}");
            }
        }
    }
}
