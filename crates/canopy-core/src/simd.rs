//! SIMD distance kernels
//!
//! Explicit intrinsics for aarch64 (NEON) and x86_64 (AVX2), with a scalar
//! fallback that LLVM auto-vectorizes with `-C target-cpu=native`.
//!
//! | Platform     | ISA      | Width           | Kernels                          |
//! |--------------|----------|-----------------|----------------------------------|
//! | Apple M1+    | NEON     | 128-bit (4×f32) | dot, L2², L1                     |
//! | x86_64+AVX2  | AVX2+FMA | 256-bit (8×f32) | dot, L2², L1                     |
//! | any          | scalar   | 64-bit words    | hamming (`count_ones` → popcnt)  |
//!
//! Node vectors live at a 16-byte offset inside fixed-stride slots, so every
//! load here is unaligned.

// ============================================================================
// aarch64 NEON intrinsics
// ============================================================================

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn dot_product_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let chunks = a.len() / 4;
    let mut acc = vdupq_n_f32(0.0);
    let (a_ptr, b_ptr) = (a.as_ptr(), b.as_ptr());

    for i in 0..chunks {
        let va = vld1q_f32(a_ptr.add(i * 4));
        let vb = vld1q_f32(b_ptr.add(i * 4));
        acc = vfmaq_f32(acc, va, vb);
    }

    let mut sum = vaddvq_f32(acc);
    for i in chunks * 4..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn l2_distance_squared_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let chunks = a.len() / 4;
    let mut acc = vdupq_n_f32(0.0);
    let (a_ptr, b_ptr) = (a.as_ptr(), b.as_ptr());

    for i in 0..chunks {
        let diff = vsubq_f32(vld1q_f32(a_ptr.add(i * 4)), vld1q_f32(b_ptr.add(i * 4)));
        acc = vfmaq_f32(acc, diff, diff);
    }

    let mut sum = vaddvq_f32(acc);
    for i in chunks * 4..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn manhattan_distance_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let chunks = a.len() / 4;
    let mut acc = vdupq_n_f32(0.0);
    let (a_ptr, b_ptr) = (a.as_ptr(), b.as_ptr());

    for i in 0..chunks {
        let va = vld1q_f32(a_ptr.add(i * 4));
        let vb = vld1q_f32(b_ptr.add(i * 4));
        acc = vaddq_f32(acc, vabdq_f32(va, vb)); // |a - b|
    }

    let mut sum = vaddvq_f32(acc);
    for i in chunks * 4..a.len() {
        sum += (a[i] - b[i]).abs();
    }
    sum
}

// ============================================================================
// x86_64 AVX2 intrinsics (runtime feature detection)
// ============================================================================

/// Horizontal sum of 8 floats → 1 float
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn hsum_avx2(acc: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;

    let hi = _mm256_extractf128_ps(acc, 1);
    let lo = _mm256_castps256_ps128(acc);
    let sum128 = _mm_add_ps(lo, hi);
    let shuf = _mm_movehdup_ps(sum128);
    let sums = _mm_add_ps(sum128, shuf);
    let shuf2 = _mm_movehl_ps(sums, sums);
    _mm_cvtss_f32(_mm_add_ss(sums, shuf2))
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn dot_product_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let chunks = a.len() / 8;
    let mut acc = _mm256_setzero_ps();
    let (a_ptr, b_ptr) = (a.as_ptr(), b.as_ptr());

    for i in 0..chunks {
        let va = _mm256_loadu_ps(a_ptr.add(i * 8));
        let vb = _mm256_loadu_ps(b_ptr.add(i * 8));
        acc = _mm256_fmadd_ps(va, vb, acc);
    }

    let mut sum = hsum_avx2(acc);
    for i in chunks * 8..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn l2_distance_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let chunks = a.len() / 8;
    let mut acc = _mm256_setzero_ps();
    let (a_ptr, b_ptr) = (a.as_ptr(), b.as_ptr());

    for i in 0..chunks {
        let diff = _mm256_sub_ps(
            _mm256_loadu_ps(a_ptr.add(i * 8)),
            _mm256_loadu_ps(b_ptr.add(i * 8)),
        );
        acc = _mm256_fmadd_ps(diff, diff, acc);
    }

    let mut sum = hsum_avx2(acc);
    for i in chunks * 8..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn manhattan_distance_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let chunks = a.len() / 8;
    let mut acc = _mm256_setzero_ps();
    // -0.0 has only the sign bit set; andnot clears it
    let sign_mask = _mm256_set1_ps(-0.0);
    let (a_ptr, b_ptr) = (a.as_ptr(), b.as_ptr());

    for i in 0..chunks {
        let diff = _mm256_sub_ps(
            _mm256_loadu_ps(a_ptr.add(i * 8)),
            _mm256_loadu_ps(b_ptr.add(i * 8)),
        );
        acc = _mm256_add_ps(acc, _mm256_andnot_ps(sign_mask, diff));
    }

    let mut sum = hsum_avx2(acc);
    for i in chunks * 8..a.len() {
        sum += (a[i] - b[i]).abs();
    }
    sum
}

// ============================================================================
// Scalar fallback (auto-vectorized by LLVM)
// ============================================================================

#[inline(always)]
fn dot_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline(always)]
fn l2_distance_squared_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

#[inline(always)]
fn manhattan_distance_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
}

// ============================================================================
// Public dispatch functions
// ============================================================================

/// Dot product of two equal-length vectors.
#[inline(always)]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { dot_product_neon(a, b) };
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { dot_product_avx2(a, b) };
        }
    }

    #[allow(unreachable_code)]
    dot_product_scalar(a, b)
}

/// Squared L2 distance `||a - b||²`.
#[inline(always)]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { l2_distance_squared_neon(a, b) };
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { l2_distance_squared_avx2(a, b) };
        }
    }

    #[allow(unreachable_code)]
    l2_distance_squared_scalar(a, b)
}

/// L1 distance `Σ |a_i - b_i|`.
#[inline(always)]
pub fn manhattan_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { manhattan_distance_neon(a, b) };
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { manhattan_distance_avx2(a, b) };
        }
    }

    #[allow(unreachable_code)]
    manhattan_distance_scalar(a, b)
}

/// Number of differing bits between two packed bit sets.
#[inline]
pub fn hamming_distance(a: &[u64], b: &[u64]) -> u32 {
    debug_assert_eq!(a.len(), b.len(), "Word count mismatch");
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Euclidean norm `||v||`.
#[inline]
pub fn norm(v: &[f32]) -> f32 {
    dot_product(v, v).sqrt()
}

/// L2 normalize a vector in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = norm(v);
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
