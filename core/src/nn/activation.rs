//! Activation Functions.
//!
//! Non-linearity between the two projections of an expert feed-forward network.
//!
//! - **ReLU**: $f(x) = \max(0, x)$. The default for experts.
//! - **GELU**: Gaussian Error Linear Unit, tanh approximation. Smooth, lets small negative
//!   inputs keep a non-zero gradient.

use crate::autograd::Variable;
use crate::tensor::FloatElem;
use serde::{Deserialize, Serialize};

/// Expert activation, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Relu,
    Gelu,
}

impl Activation {
    /// Applies the activation element-wise, recording it on the tape.
    pub fn apply<T: FloatElem + 'static, const RANK: usize>(
        &self,
        x: &Variable<T, RANK>,
    ) -> Variable<T, RANK> {
        match self {
            Activation::Relu => x.relu(),
            Activation::Gelu => x.gelu(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn test_apply() {
        let x = Variable::new(Tensor::<f32, 1>::new(vec![-1.0, 0.0, 1.0], [3]).unwrap());

        let r = Activation::Relu.apply(&x);
        assert_eq!(r.data.data(), &[0.0, 0.0, 1.0]);

        let g = Activation::Gelu.apply(&x);
        let d = g.data.data();
        assert!(d[0] < 0.0 && d[0] > -0.2);
        assert!((d[1] - 0.0).abs() < 1e-6);
        assert!((d[2] - 0.8412).abs() < 1e-3);
    }

    #[test]
    fn test_serde_names() {
        let a: Activation = serde_json::from_str("\"gelu\"").unwrap();
        assert_eq!(a, Activation::Gelu);
        assert_eq!(Activation::default(), Activation::Relu);
    }
}
