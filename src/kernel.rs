//! Row-range by column-range multiplier used by workers.
//!
//! B is transposed up front so every dot product walks two contiguous
//! slices, then an AVX path accumulates four doubles per lane with a scalar
//! tail. Targets without AVX fall back to the plain loop.

use crate::matrix::Matrix;

/// Multiply rows `[start_row, end_row)` of `a` against columns
/// `[start_col, end_col)` of `b`, returning the tile row-major.
///
/// The caller guarantees `a.cols == b.rows` and in-range bounds. Reduction
/// order differs between the vector and scalar paths, so results match a
/// reference only to within floating-point tolerance.
pub fn multiply_range(
    a: &Matrix,
    b: &Matrix,
    start_row: usize,
    end_row: usize,
    start_col: usize,
    end_col: usize,
) -> Vec<f64> {
    let inner = a.cols;
    let tile_cols = end_col - start_col;

    // Transpose B so its columns become contiguous rows.
    let b_t = b.transpose();

    let use_avx = avx_available(inner);

    let mut out = vec![0.0; (end_row - start_row) * tile_cols];
    for i in start_row..end_row {
        let a_row = &a.data[i * inner..(i + 1) * inner];
        for j in start_col..end_col {
            let b_col = &b_t.data[j * inner..(j + 1) * inner];
            out[(i - start_row) * tile_cols + (j - start_col)] = dot(a_row, b_col, use_avx);
        }
    }
    out
}

fn avx_available(inner: usize) -> bool {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        inner >= 4 && std::arch::is_x86_feature_detected!("avx")
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        let _ = inner;
        false
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64], use_avx: bool) -> f64 {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        if use_avx {
            return unsafe { dot_avx(a, b) };
        }
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    let _ = use_avx;
    dot_scalar(a, b)
}

fn dot_scalar(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[target_feature(enable = "avx")]
unsafe fn dot_avx(a: &[f64], b: &[f64]) -> f64 {
    #[cfg(target_arch = "x86")]
    use std::arch::x86::*;
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::*;

    let len = a.len();
    let mut sum_vec = _mm256_setzero_pd();
    let mut k = 0;

    while k + 4 <= len {
        let a_vec = _mm256_loadu_pd(a.as_ptr().add(k));
        let b_vec = _mm256_loadu_pd(b.as_ptr().add(k));
        sum_vec = _mm256_add_pd(sum_vec, _mm256_mul_pd(a_vec, b_vec));
        k += 4;
    }

    let mut partial = [0.0f64; 4];
    _mm256_storeu_pd(partial.as_mut_ptr(), sum_vec);
    let mut sum = partial[0] + partial[1] + partial[2] + partial[3];

    while k < len {
        sum += a[k] * b[k];
        k += 1;
    }

    sum
}
