use burn::{
    module::Module,
    tensor::{backend::Backend, Tensor},
};

/// Applies the leaky rectified linear unit function element-wise:
///
/// `y = max(0, x) + slope * min(0, x)`
#[derive(Module, Clone, Debug)]
pub struct LeakyRelu {
    slope: f64,
}

impl LeakyRelu {
    /// Create the module with the given negative slope.
    pub fn new(slope: f64) -> Self {
        Self { slope }
    }

    /// Applies the forward pass on the input tensor.
    ///
    /// # Shapes
    ///
    /// - input: `[..., any]`
    /// - output: `[..., any]`
    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let positive = input.clone().clamp_min(0.0);
        let negative = input.clamp_max(0.0);
        positive + negative.mul_scalar(self.slope)
    }
}
