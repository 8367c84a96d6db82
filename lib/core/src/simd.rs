// SIMD kernels for embedding rows.
// Dot products dominate both exact search and HNSW traversal, so they get
// platform paths; k-means distances stay scalar.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

#[cfg(target_arch = "aarch64")]
use std::arch::aarch64::*;

#[cfg(target_arch = "x86_64")]
const MIN_DIM_SIZE_AVX: usize = 32;

#[cfg(target_arch = "aarch64")]
const MIN_DIM_SIZE_NEON: usize = 16;

/// Dot product of two equal-length rows. Mismatched lengths score 0.0.
///
/// On L2-normalized embeddings this is the cosine similarity.
#[inline]
pub fn dot_product_simd(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2")
            && is_x86_feature_detected!("fma")
            && a.len() >= MIN_DIM_SIZE_AVX
        {
            return unsafe { dot_product_avx2(a, b) };
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        if std::arch::is_aarch64_feature_detected!("neon") && a.len() >= MIN_DIM_SIZE_NEON {
            return unsafe { dot_product_neon(a, b) };
        }
    }

    dot_product_scalar(a, b)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
#[inline]
unsafe fn dot_product_avx2(a: &[f32], b: &[f32]) -> f32 {
    let dim = a.len();
    let mut i = 0;

    let mut acc_lo = _mm256_setzero_ps();
    let mut acc_hi = _mm256_setzero_ps();

    while i + 16 <= dim {
        let a_lo = _mm256_loadu_ps(a.as_ptr().add(i));
        let b_lo = _mm256_loadu_ps(b.as_ptr().add(i));
        let a_hi = _mm256_loadu_ps(a.as_ptr().add(i + 8));
        let b_hi = _mm256_loadu_ps(b.as_ptr().add(i + 8));
        acc_lo = _mm256_fmadd_ps(a_lo, b_lo, acc_lo);
        acc_hi = _mm256_fmadd_ps(a_hi, b_hi, acc_hi);
        i += 16;
    }

    let acc = _mm256_add_ps(acc_lo, acc_hi);
    let upper = _mm256_extractf128_ps(acc, 1);
    let lower = _mm256_castps256_ps128(acc);
    let mut folded = _mm_add_ps(upper, lower);
    folded = _mm_hadd_ps(folded, folded);
    folded = _mm_hadd_ps(folded, folded);

    let mut dot = _mm_cvtss_f32(folded);
    while i < dim {
        dot += a[i] * b[i];
        i += 1;
    }
    dot
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
#[inline]
unsafe fn dot_product_neon(a: &[f32], b: &[f32]) -> f32 {
    let dim = a.len();
    let mut i = 0;

    let mut acc_lo = vdupq_n_f32(0.0);
    let mut acc_hi = vdupq_n_f32(0.0);

    while i + 8 <= dim {
        acc_lo = vfmaq_f32(acc_lo, vld1q_f32(a.as_ptr().add(i)), vld1q_f32(b.as_ptr().add(i)));
        acc_hi = vfmaq_f32(
            acc_hi,
            vld1q_f32(a.as_ptr().add(i + 4)),
            vld1q_f32(b.as_ptr().add(i + 4)),
        );
        i += 8;
    }

    let mut dot = vaddvq_f32(vaddq_f32(acc_lo, acc_hi));
    while i < dim {
        dot += a[i] * b[i];
        i += 1;
    }
    dot
}

/// Scalar fallback with two accumulators.
#[inline]
fn dot_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut even = 0.0f32;
    let mut odd = 0.0f32;

    let a_chunks = a.chunks_exact(2);
    let tail = a_chunks.remainder();
    for (x, y) in a_chunks.zip(b.chunks_exact(2)) {
        even += x[0] * y[0];
        odd += x[1] * y[1];
    }
    if let (Some(x), Some(y)) = (tail.first(), b.last()) {
        even += x * y;
    }

    even + odd
}

/// Squared Euclidean distance. Mismatched lengths are infinitely far apart.
#[inline]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[inline]
pub fn norm_simd(v: &[f32]) -> f32 {
    dot_product_simd(v, v).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_dot_matches_naive_for_odd_and_wide_dims() {
        for dim in [1usize, 3, 7, 33, 100] {
            let a: Vec<f32> = (0..dim).map(|i| (i as f32 * 0.37).sin()).collect();
            let b: Vec<f32> = (0..dim).map(|i| (i as f32 * 0.11).cos()).collect();
            assert!((dot_product_simd(&a, &b) - naive_dot(&a, &b)).abs() < 1e-4, "dim {}", dim);
        }
    }

    #[test]
    fn test_mismatched_lengths() {
        assert_eq!(dot_product_simd(&[1.0, 2.0], &[1.0]), 0.0);
        assert!(squared_l2(&[1.0], &[1.0, 2.0]).is_infinite());
    }

    #[test]
    fn test_squared_l2_and_norm() {
        assert!((squared_l2(&[0.0, 0.0], &[3.0, 4.0]) - 25.0).abs() < 1e-6);
        assert!((norm_simd(&[3.0, 4.0]) - 5.0).abs() < 1e-6);
    }
}
