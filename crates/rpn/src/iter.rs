//! Iterator and slice helpers.

use std::iter::Zip;

/// A variant of [`Iterator::zip`] that panics if the iterators have different lengths.
///
/// Per-box fields, per-image outputs and per-level inputs are all parallel sequences. Zipping two
/// of them with [`Iterator::zip`] silently truncates the longer one, which hides wiring bugs.
#[track_caller]
pub fn zip_exact<A, B>(a: A, b: B) -> Zip<A::IntoIter, B::IntoIter>
where
    A: IntoIterator,
    B: IntoIterator,
    A::IntoIter: ExactSizeIterator,
    B::IntoIter: ExactSizeIterator,
{
    let a = a.into_iter();
    let b = b.into_iter();
    assert_eq!(
        a.len(),
        b.len(),
        "`zip_exact` called on iterators with different lengths"
    );

    a.zip(b)
}

/// Splits `slice` into consecutive chunks of the given lengths.
///
/// # Panics
///
/// Panics if `lengths` does not sum up to `slice.len()`.
#[track_caller]
pub fn split_lengths<'a, T>(slice: &'a [T], lengths: &[usize]) -> Vec<&'a [T]> {
    assert_eq!(
        lengths.iter().sum::<usize>(),
        slice.len(),
        "chunk lengths do not cover the slice"
    );
    let mut rest = slice;
    lengths
        .iter()
        .map(|&len| {
            let (head, tail) = rest.split_at(len);
            rest = tail;
            head
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_lengths_chunks_in_order() {
        let v = [1, 2, 3, 4, 5];
        let parts = split_lengths(&v, &[2, 0, 3]);
        assert_eq!(parts, [&[1, 2][..], &[][..], &[3, 4, 5][..]]);
    }

    #[test]
    #[should_panic]
    fn zip_exact_panics_on_mismatch() {
        zip_exact([1, 2], [1]).for_each(drop);
    }
}
