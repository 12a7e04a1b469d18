//! Utilities for numerics.

use std::cmp::Ordering;

/// An `f32` that implements [`Ord`] according to the IEEE 754 totalOrder predicate.
#[derive(Debug, Clone, Copy)]
pub struct TotalF32(pub f32);

impl PartialEq for TotalF32 {
    fn eq(&self, other: &Self) -> bool {
        f32::total_cmp(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for TotalF32 {}

impl PartialOrd for TotalF32 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TotalF32 {
    fn cmp(&self, other: &Self) -> Ordering {
        f32::total_cmp(&self.0, &other.0)
    }
}

/// Applies the standard sigmoid/logistic function to the input.
pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Inverse of [`sigmoid`], mapping a probability in `(0, 1)` back to a logit.
pub fn logit(p: f32) -> f32 {
    (p / (1.0 - p)).ln()
}

/// Compares two scored indices so that higher scores come first, and equal scores keep their
/// original index order.
///
/// This is a total order, so it can be used with unstable sorts and selection while still
/// producing the same result as a stable descending sort.
#[inline]
pub fn cmp_desc(scores: &[f32], a: usize, b: usize) -> Ordering {
    TotalF32(scores[b])
        .cmp(&TotalF32(scores[a]))
        .then(a.cmp(&b))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn sigmoid_logit_inverse() {
        for p in [0.1, 0.3, 0.5, 0.8, 0.9] {
            assert_relative_eq!(sigmoid(logit(p)), p, epsilon = 1e-6);
        }
        assert_eq!(sigmoid(0.0), 0.5);
    }

    #[test]
    fn desc_order_breaks_ties_by_index() {
        let scores = [0.5, 0.9, 0.5, 0.9];
        let mut idx = vec![0, 1, 2, 3];
        idx.sort_unstable_by(|&a, &b| cmp_desc(&scores, a, b));
        assert_eq!(idx, [1, 3, 0, 2]);
    }
}
