use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;
use std::cmp::Ordering;

/// Descending order with NaN sorted last, so the comparator stays total.
fn descending<T: KernelElem>(a: T, b: T) -> Ordering {
    #[allow(clippy::eq_op)]
    let (a_nan, b_nan) = (a != a, b != b);
    match (a_nan, b_nan) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

/// Top-`k` along the last axis of a `[rows, cols]` buffer.
///
/// Returns `(values, indices)`, both `[rows, k]`, with each row sorted from largest to smallest.
/// Ties are broken by position: the lower column index is ranked first. The result is therefore
/// a pure function of the input, independent of thread scheduling.
pub fn cpu_topk<T>(data: &[T], shape: &[usize; 2], k: usize) -> Result<(Vec<T>, Vec<usize>)>
where
    T: KernelElem,
{
    let [rows, cols] = *shape;
    if data.len() != rows * cols {
        return Err(KernelError::ShapeMismatch {
            expected: vec![rows, cols],
            got: vec![data.len()],
        });
    }
    if k > cols {
        return Err(KernelError::InvalidTopK { k, len: cols });
    }

    let mut values = vec![T::zero(); rows * k];
    let mut indices = vec![0usize; rows * k];
    if k == 0 {
        return Ok((values, indices));
    }

    values
        .par_chunks_mut(k)
        .zip(indices.par_chunks_mut(k))
        .zip(data.par_chunks(cols))
        .for_each(|((v_row, i_row), src)| {
            let mut order: Vec<usize> = (0..cols).collect();
            // `sort_by` is stable, so equal scores keep ascending index order.
            order.sort_by(|&a, &b| descending(src[a], src[b]));
            for ((v, i), &col) in v_row.iter_mut().zip(i_row.iter_mut()).zip(&order) {
                *v = src[col];
                *i = col;
            }
        });

    Ok((values, indices))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topk_rows() {
        let data = vec![
            0.1, 0.7, 0.2, //
            0.5, 0.1, 0.4,
        ];
        let (v, i) = cpu_topk(&data, &[2, 3], 2).unwrap();
        assert_eq!(i, vec![1, 2, 0, 2]);
        assert_eq!(v, vec![0.7, 0.2, 0.5, 0.4]);
    }

    #[test]
    fn test_topk_ties_prefer_lower_index() {
        let data = vec![1.0, 3.0, 3.0, 1.0];
        let (_, i) = cpu_topk(&data, &[1, 4], 4).unwrap();
        assert_eq!(i, vec![1, 2, 0, 3]);
    }

    #[test]
    fn test_topk_nan_ranked_last() {
        let data = vec![f32::NAN, 0.5, -1.0];
        let (_, i) = cpu_topk(&data, &[1, 3], 3).unwrap();
        assert_eq!(i, vec![1, 2, 0]);
    }

    #[test]
    fn test_topk_k_too_large() {
        let data = vec![1.0, 2.0];
        let err = cpu_topk(&data, &[1, 2], 3);
        assert!(matches!(err, Err(KernelError::InvalidTopK { k: 3, len: 2 })));
    }

    #[test]
    fn test_topk_zero() {
        let data = vec![1.0, 2.0];
        let (v, i) = cpu_topk(&data, &[1, 2], 0).unwrap();
        assert!(v.is_empty() && i.is_empty());
    }
}
