//! Parameter initialization.
//!
//! Both schemes scale with `1 / fan_in` so activations keep roughly unit variance as the
//! hidden width changes. `init_scale` multiplies the resulting spread.

use crate::tensor::{FloatElem, Result, Tensor, TensorError, scalar};
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

/// Weight initialization scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitType {
    /// `U(-b, b)` with `b = init_scale * sqrt(3 / fan_in)`.
    #[default]
    KaimingUniform,
    /// `N(0, s^2)` with `s = init_scale * sqrt(1 / fan_in)`, resampled outside `[-2s, 2s]`.
    TruncatedNormal,
}

/// Draws a tensor of `shape` with the given scheme.
///
/// # Errors
///
/// `TensorError::Unsupported` if `fan_in` is zero or `init_scale` is not a positive finite number.
pub fn init_tensor<T, const RANK: usize, R>(
    shape: [usize; RANK],
    fan_in: usize,
    init_type: InitType,
    init_scale: f64,
    rng: &mut R,
) -> Result<Tensor<T, RANK>>
where
    T: FloatElem,
    R: Rng + ?Sized,
{
    if fan_in == 0 || !init_scale.is_finite() || init_scale <= 0.0 {
        return Err(TensorError::Unsupported(format!(
            "cannot initialize with fan_in={fan_in}, init_scale={init_scale}"
        )));
    }
    let size: usize = shape.iter().product();
    let fan_in = fan_in as f64;

    let data: Vec<T> = match init_type {
        InitType::KaimingUniform => {
            let bound = init_scale * (3.0 / fan_in).sqrt();
            let dist = Uniform::new_inclusive(-bound, bound)
                .map_err(|e| TensorError::Unsupported(e.to_string()))?;
            (0..size).map(|_| scalar(dist.sample(rng))).collect()
        }
        InitType::TruncatedNormal => {
            let std = init_scale * (1.0 / fan_in).sqrt();
            let dist =
                Normal::new(0.0, std).map_err(|e| TensorError::Unsupported(e.to_string()))?;
            (0..size)
                .map(|_| loop {
                    let v: f64 = dist.sample(rng);
                    if v.abs() <= 2.0 * std {
                        break scalar(v);
                    }
                })
                .collect()
        }
    };

    Tensor::new(data, shape)
}
