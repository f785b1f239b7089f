//! Row gather and row scatter-add.
//!
//! These are the two primitives the MoE dispatcher is built from: `index_select` copies token
//! rows into expert slots, `index_add` sums expert rows back into token positions.

use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

fn check_rows<T>(data: &[T], row_len: usize) -> Result<usize> {
    if row_len == 0 {
        return Ok(0);
    }
    if data.len() % row_len != 0 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![data.len() / row_len * row_len],
            got: vec![data.len()],
        });
    }
    Ok(data.len() / row_len)
}

fn check_indices(indices: &[usize], bound: usize) -> Result<()> {
    match indices.iter().find(|&&i| i >= bound) {
        Some(&index) => Err(KernelError::IndexOutOfBounds { index, bound }),
        None => Ok(()),
    }
}

/// Gathers rows of a `[rows, row_len]` buffer.
///
/// Output row `i` is a copy of input row `indices[i]`; indices may repeat.
pub fn cpu_index_select<T>(data: &[T], row_len: usize, indices: &[usize]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let rows = check_rows(data, row_len)?;
    if row_len == 0 {
        return Ok(Vec::new());
    }
    check_indices(indices, rows)?;

    let mut out = vec![T::zero(); indices.len() * row_len];
    out.par_chunks_mut(row_len)
        .zip(indices.par_iter())
        .for_each(|(dst, &src_row)| {
            let start = src_row * row_len;
            dst.copy_from_slice(&data[start..start + row_len]);
        });
    Ok(out)
}

/// Adds row `i` of `src` into row `indices[i]` of `out`.
///
/// Rows that share a target index are summed, never overwritten. Accumulation walks `src` in
/// order so repeated calls produce bit-identical results.
pub fn cpu_index_add<T>(out: &mut [T], row_len: usize, indices: &[usize], src: &[T]) -> Result<()>
where
    T: KernelElem,
{
    let rows = check_rows(out, row_len)?;
    if row_len == 0 {
        return Ok(());
    }
    if src.len() != indices.len() * row_len {
        return Err(KernelError::ShapeMismatch {
            expected: vec![indices.len(), row_len],
            got: vec![src.len()],
        });
    }
    check_indices(indices, rows)?;

    for (src_row, &dst_row) in src.chunks_exact(row_len).zip(indices) {
        let start = dst_row * row_len;
        for (o, &v) in out[start..start + row_len].iter_mut().zip(src_row) {
            *o += v;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_select_repeats() {
        // 3 rows of width 2
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let out = cpu_index_select(&data, 2, &[2, 0, 2]).unwrap();
        assert_eq!(out, vec![5.0, 6.0, 1.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn test_index_select_out_of_bounds() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let err = cpu_index_select(&data, 2, &[0, 2]);
        assert!(matches!(
            err,
            Err(KernelError::IndexOutOfBounds { index: 2, bound: 2 })
        ));
    }

    #[test]
    fn test_index_add_accumulates() {
        let mut out = vec![0.0; 4];
        let src = vec![1.0, 1.0, 2.0, 2.0, 10.0, 20.0];
        // Rows 0 and 1 of src both land on out row 1.
        cpu_index_add(&mut out, 2, &[1, 1, 0], &src).unwrap();
        assert_eq!(out, vec![10.0, 20.0, 3.0, 3.0]);
    }

    #[test]
    fn test_index_add_length_mismatch() {
        let mut out = vec![0.0; 4];
        let err = cpu_index_add(&mut out, 2, &[0, 1], &[1.0, 2.0]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_index_add_out_of_bounds() {
        let mut out = vec![0.0; 4];
        let err = cpu_index_add(&mut out, 2, &[5], &[1.0, 2.0]);
        assert!(matches!(err, Err(KernelError::IndexOutOfBounds { .. })));
    }
}
