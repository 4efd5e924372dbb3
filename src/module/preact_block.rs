use burn::{nn::conv::Conv2d, prelude::*};
use nn::{conv::Conv2dConfig, BatchNorm, BatchNormConfig, PaddingConfig2d};

use super::celu::{Celu, CeluConfig};

/// Residual block with batch norm and activation ahead of each convolution.
///
/// The projection shortcut, when present, reads the pre-activated input so that
/// both paths start from the same normalized tensor.
#[derive(Module, Debug)]
pub struct PreActBlock<B: Backend> {
    norm1: BatchNorm<B, 2>,
    conv1: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    shortcut: Option<Conv2d<B>>,
    activation: Celu,
}

impl<B: Backend> PreActBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.activation.forward(self.norm1.forward(x.clone()));

        let shortcut = match &self.shortcut {
            Some(shortcut) => shortcut.forward(out.clone()),
            None => x,
        };

        let out = self.conv1.forward(out);
        let out = self.activation.forward(self.norm2.forward(out));
        let out = self.conv2.forward(out);

        out + shortcut
    }
}

#[derive(Config, Debug)]
pub struct PreActBlockConfig {
    pub channels: [usize; 2],

    #[config(default = "[1, 1]")]
    pub stride: [usize; 2],

    pub activation: CeluConfig,
}

impl PreActBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PreActBlock<B> {
        let [in_channels, out_channels] = self.channels;

        let shortcut = if self.stride != [1, 1] || in_channels != out_channels {
            Some(
                Conv2dConfig::new(self.channels, [1, 1])
                    .with_stride(self.stride)
                    .with_bias(false)
                    .init(device),
            )
        } else {
            None
        };

        PreActBlock {
            norm1: BatchNormConfig::new(in_channels).init(device),
            conv1: Conv2dConfig::new(self.channels, [3, 3])
                .with_stride(self.stride)
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            norm2: BatchNormConfig::new(out_channels).init(device),
            conv2: Conv2dConfig::new([out_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            shortcut,
            activation: self.activation.init(),
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::{backend::NdArray, tensor::Distribution};

    use super::*;

    type TestBackend = NdArray<f32>;

    #[test]
    fn identity_block_keeps_shape() {
        let device = Default::default();
        let block = PreActBlockConfig::new([8, 8], CeluConfig::new()).init::<TestBackend>(&device);

        let output = block.forward(Tensor::random([2, 8, 6, 6], Distribution::Default, &device));

        assert!(block.shortcut.is_none());
        assert_eq!(output.dims(), [2, 8, 6, 6]);
    }

    #[test]
    fn strided_block_projects_shortcut() {
        let device = Default::default();
        let block = PreActBlockConfig::new([4, 8], CeluConfig::new())
            .with_stride([2, 2])
            .init::<TestBackend>(&device);

        let output = block.forward(Tensor::random([1, 4, 8, 8], Distribution::Default, &device));

        assert!(block.shortcut.is_some());
        assert_eq!(output.dims(), [1, 8, 4, 4]);
    }

    #[test]
    fn widening_block_projects_shortcut() {
        let device = Default::default();
        let block = PreActBlockConfig::new([4, 8], CeluConfig::new()).init::<TestBackend>(&device);

        assert!(block.shortcut.is_some());
    }
}
