//! Top-k selection over score vectors.

use ndarray::ArrayView2;
use rayon::prelude::*;
use rpn_boxes::num::cmp_desc;

/// Returns the indices of the `min(k, scores.len())` highest scores, best first.
///
/// Equal scores are ordered by ascending index, so the result equals the first `k` entries of a
/// stable descending sort.
pub fn top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let k = k.min(scores.len());
    let mut order: Vec<usize> = (0..scores.len()).collect();
    if k == 0 {
        return Vec::new();
    }
    if k < order.len() {
        order.select_nth_unstable_by(k - 1, |&a, &b| cmp_desc(scores, a, b));
        order.truncate(k);
    }
    order.sort_unstable_by(|&a, &b| cmp_desc(scores, a, b));
    order
}

/// Runs [`top_k`] independently on every row of a `[N, M]` score matrix.
pub fn top_k_rows(scores: ArrayView2<'_, f32>, k: usize) -> Vec<Vec<usize>> {
    (0..scores.nrows())
        .into_par_iter()
        .map(|i| match scores.row(i).as_slice() {
            Some(slice) => top_k(slice, k),
            None => top_k(&scores.row(i).to_vec(), k),
        })
        .collect()
}
