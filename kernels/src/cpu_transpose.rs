use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Swaps the last two axes of a row-major buffer.
///
/// Used to turn `[tokens, experts]` score matrices into `[experts, tokens]` so that per-expert
/// selection can run over contiguous rows, and by [`cpu_matmul`](crate::cpu_matmul) to lay the
/// right-hand side out column-first.
pub fn cpu_transpose<T, const RANK: usize>(data: &[T], shape: &[usize; RANK]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let size: usize = shape.iter().product();
    if data.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![data.len()],
        });
    }

    let m = shape[RANK - 2];
    let n = shape[RANK - 1];
    let mut out = vec![T::zero(); size];
    if m == 0 || n == 0 {
        return Ok(out);
    }

    // Output viewed as [batch * N] rows of length M.
    out.par_chunks_mut(m).enumerate().for_each(|(i, out_row)| {
        let b = i / n;
        let col = i % n;
        let base = b * m * n;
        for (r, o) in out_row.iter_mut().enumerate() {
            *o = data[base + r * n + col];
        }
    });

    Ok(out)
}
