use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Batched matrix multiplication over the last two axes.
///
/// `lhs` is `[..., M, K]`, `rhs` is `[..., K, N]`, and the leading (batch) axes must agree.
/// The MoE expert stack relies on the batched form: `[E, C, H] x [E, H, S]` runs every
/// expert's slice of the input against its own weight matrix in one call.
///
/// The right-hand side is transposed up front so each output element is a dot product of two
/// contiguous slices. Rows of the output are distributed over the rayon pool.
pub fn cpu_matmul<T, const RANK: usize>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; RANK],
    rhs_shape: &[usize; RANK],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let m = lhs_shape[RANK - 2];
    let k = lhs_shape[RANK - 1];
    let n = rhs_shape[RANK - 1];

    if k != rhs_shape[RANK - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k],
            got: vec![rhs_shape[RANK - 2]],
        });
    }
    if lhs_shape[..RANK - 2] != rhs_shape[..RANK - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: lhs_shape[..RANK - 2].to_vec(),
            got: rhs_shape[..RANK - 2].to_vec(),
        });
    }

    let batch: usize = lhs_shape[..RANK - 2].iter().product();
    let mut out_data = vec![T::zero(); batch * m * n];
    if n == 0 || m == 0 {
        return Ok(out_data);
    }

    // rhs: [..., K, N] -> [..., N, K]
    let rhs_t = crate::cpu_transpose::cpu_transpose(rhs_data, rhs_shape)?;

    out_data
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(global_row, out_row)| {
            let b = global_row / m;
            let row = global_row % m;

            let a_start = b * m * k + row * k;
            let a_row = &lhs_data[a_start..a_start + k];
            let bt_base = b * n * k;

            for (col, out) in out_row.iter_mut().enumerate() {
                let bt_start = bt_base + col * k;
                let bt_row = &rhs_t[bt_start..bt_start + k];

                let mut acc = T::zero();
                for (&x, &y) in a_row.iter().zip(bt_row) {
                    acc += x * y;
                }
                *out = acc;
            }
        });

    Ok(out_data)
}
