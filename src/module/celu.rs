use burn::{
    module::Module,
    prelude::{Backend, Config},
    tensor::Tensor,
};

/// Continuously differentiable exponential linear unit:
/// `max(0, x) + min(0, alpha * (exp(x / alpha) - 1))`.
#[derive(Module, Debug, Clone)]
pub struct Celu {
    alpha: f64,
}

#[derive(Config, Debug)]
pub struct CeluConfig {
    #[config(default = 1.0)]
    pub alpha: f64,
}

impl CeluConfig {
    pub fn init(&self) -> Celu {
        assert!(self.alpha != 0.0, "CELU alpha must be non-zero");

        Celu { alpha: self.alpha }
    }
}

impl Celu {
    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let negative = (input.clone().clamp_max(0.0) / self.alpha)
            .exp()
            .sub_scalar(1.0)
            .mul_scalar(self.alpha);

        input.clamp_min(0.0) + negative
    }
}
