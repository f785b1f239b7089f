use crate::autograd::Variable;
use crate::nn::init::{InitType, init_tensor};
use crate::nn::module::{Module, Parameter};
use crate::tensor::{FloatElem, Result, Tensor, TensorElem, TensorError};
use rand::Rng;

/// Linear Layer: `y = xW + b`
///
/// The weight is stored as `[in_features, out_features]`, so the forward pass is a plain
/// `[tokens, in] x [in, out]` matmul with no transpose. The MoE gate is a bias-free `Linear`
/// from the hidden dimension to the number of experts.
///
/// # Examples
/// ```rust
/// use moe_rs::nn::Linear;
/// use moe_rs::tensor::Tensor;
///
/// let layer = Linear::<f32>::new(Tensor::zeros([10, 5]), Some(Tensor::zeros([5]))).unwrap();
/// assert_eq!(layer.in_features(), 10);
/// assert_eq!(layer.out_features(), 5);
/// ```
#[derive(Debug)]
pub struct Linear<T: TensorElem> {
    /// Shape: `[in_features, out_features]`
    pub weight: Variable<T, 2>,
    /// Shape: `[out_features]`
    pub bias: Option<Variable<T, 1>>,
}

impl<T: TensorElem + 'static> Linear<T> {
    /// Wraps existing tensors as trainable parameters.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` if the bias length differs from `out_features`.
    pub fn new(weight: Tensor<T, 2>, bias: Option<Tensor<T, 1>>) -> Result<Self> {
        let [_, out] = *weight.shape();
        if let Some(b) = &bias
            && b.shape() != &[out]
        {
            return Err(TensorError::ShapeMismatch {
                expected: vec![out],
                got: b.shape().to_vec(),
            });
        }
        Ok(Self {
            weight: Variable::new(weight),
            bias: bias.map(Variable::new),
        })
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[1]
    }

    /// `[tokens, in] -> [tokens, out]`.
    pub fn forward(&self, x: &Variable<T, 2>) -> Result<Variable<T, 2>> {
        let [_, width] = *x.shape();
        if width != self.in_features() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.in_features()],
                got: vec![width],
            });
        }
        let y = x.matmul(&self.weight)?;
        match &self.bias {
            Some(b) => y.add_bias(b),
            None => Ok(y),
        }
    }
}

impl<T: FloatElem + 'static> Linear<T> {
    /// Randomly initialized layer; the bias, if any, starts at zero.
    pub fn init<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        bias: bool,
        init_type: InitType,
        init_scale: f64,
        rng: &mut R,
    ) -> Result<Self> {
        let weight = init_tensor(
            [in_features, out_features],
            in_features,
            init_type,
            init_scale,
            rng,
        )?;
        let bias = bias.then(|| Tensor::zeros([out_features]));
        Self::new(weight, bias)
    }
}

impl<T: TensorElem + 'static> Module<T> for Linear<T> {
    fn parameters_mut(&mut self) -> Vec<Parameter<'_, T>> {
        let mut params = vec![Parameter::Matrix(&mut self.weight)];
        if let Some(b) = self.bias.as_mut() {
            params.push(Parameter::Vector(b));
        }
        params
    }
}
