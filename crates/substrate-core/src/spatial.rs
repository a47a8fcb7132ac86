//! # Spatial Index
//!
//! 64-bit Hilbert keys for points of S³.
//!
//! Each coordinate in `[-1, 1]` is quantized to `HILBERT_BITS` bits and the
//! four axes are mapped onto a 4D Hilbert curve (Skilling's transpose
//! construction), then interleaved most significant bit first. Points close
//! on the sphere get close keys often enough for a range scan around a key
//! to find good neighbour candidates; the keys are only used for ordering,
//! never decoded.

use crate::geometry::Point4;
use crate::primitives::HILBERT_BITS;

const DIMS: usize = 4;
const AXIS_MAX: u32 = (1 << HILBERT_BITS) - 1;

/// Quantize one coordinate from `[-1, 1]` to `0..=AXIS_MAX`.
#[must_use]
pub fn quantize(coord: f64) -> u32 {
    let clamped = if coord.is_finite() { coord.clamp(-1.0, 1.0) } else { 0.0 };
    let scaled = ((clamped + 1.0) * 0.5 * f64::from(AXIS_MAX)).round();
    (scaled as u32).min(AXIS_MAX)
}

/// Hilbert key of a point.
#[must_use]
pub fn encode(point: &Point4) -> u64 {
    let axes = [
        quantize(point.0[0]),
        quantize(point.0[1]),
        quantize(point.0[2]),
        quantize(point.0[3]),
    ];
    hilbert_key(axes)
}

/// Hilbert key of already-quantized axes.
#[must_use]
pub fn hilbert_key(mut x: [u32; DIMS]) -> u64 {
    axes_to_transpose(&mut x);
    interleave(&x)
}

fn axes_to_transpose(x: &mut [u32; DIMS]) {
    let top = 1u32 << (HILBERT_BITS - 1);

    // Inverse undo
    let mut q = top;
    while q > 1 {
        let p = q - 1;
        for i in 0..DIMS {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode
    for i in 1..DIMS {
        x[i] ^= x[i - 1];
    }
    let mut t = 0;
    let mut q = top;
    while q > 1 {
        if x[DIMS - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for axis in x.iter_mut() {
        *axis ^= t;
    }
}

fn interleave(x: &[u32; DIMS]) -> u64 {
    let mut key = 0u64;
    for bit in (0..HILBERT_BITS).rev() {
        for axis in x {
            key = (key << 1) | u64::from((axis >> bit) & 1);
        }
    }
    key
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn quantize_covers_full_range() {
        assert_eq!(quantize(-1.0), 0);
        assert_eq!(quantize(1.0), AXIS_MAX);
        assert_eq!(quantize(2.0), AXIS_MAX);
        assert_eq!(quantize(f64::NAN), quantize(0.0));
    }

    #[test]
    fn origin_maps_to_zero() {
        assert_eq!(hilbert_key([0, 0, 0, 0]), 0);
    }

    #[test]
    fn curve_is_a_bijection_on_a_small_cube() {
        // Low 2 bits per axis: the 256 cells of the 4x4x4x4 corner cube map to
        // distinct keys.
        let mut keys = BTreeSet::new();
        for a in 0..4u32 {
            for b in 0..4u32 {
                for c in 0..4u32 {
                    for d in 0..4u32 {
                        keys.insert(hilbert_key([a, b, c, d]));
                    }
                }
            }
        }
        assert_eq!(keys.len(), 256);
    }

    #[test]
    fn consecutive_keys_are_unit_steps() {
        // On the corner cube the first 16 keys visit cells one axis step apart.
        let mut by_key = Vec::new();
        for a in 0..2u32 {
            for b in 0..2u32 {
                for c in 0..2u32 {
                    for d in 0..2u32 {
                        by_key.push((hilbert_key([a, b, c, d]), [a, b, c, d]));
                    }
                }
            }
        }
        by_key.sort_unstable();
        for pair in by_key.windows(2) {
            let moved: u32 = pair[0]
                .1
                .iter()
                .zip(pair[1].1.iter())
                .map(|(p, q)| p.abs_diff(*q))
                .sum();
            assert_eq!(moved, 1);
        }
    }

    #[test]
    fn encode_is_repeatable() {
        let p = Point4::new(0.5, -0.5, 0.5, -0.5);
        assert_eq!(encode(&p), encode(&p));
    }
}
