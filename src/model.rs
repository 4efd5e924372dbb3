use burn::{nn::conv::Conv2d, prelude::*, train::ClassificationOutput};
use nn::{
    conv::Conv2dConfig,
    loss::CrossEntropyLossConfig,
    pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d,
};

use crate::module::{
    celu::{Celu, CeluConfig},
    preact_block::{PreActBlock, PreActBlockConfig},
};

// (output channels, stride of the first block)
const STAGE_SETTINGS: [(usize, usize); 4] = [(64, 1), (128, 2), (256, 2), (512, 2)];

#[derive(Module, Debug)]
pub struct PreActResNet<B: Backend> {
    stem: Conv2d<B>,
    blocks: Vec<PreActBlock<B>>,

    norm: BatchNorm<B, 2>,
    activation: Celu,
    avg_pool: AdaptiveAvgPool2d,
    linear: Linear<B>,
}

impl<B: Backend> PreActResNet<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem.forward(x);
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));

        let x = self.activation.forward(self.norm.forward(x));
        let x = self.avg_pool.forward(x);
        let x = x.flatten(1, 3);

        self.linear.forward(x)
    }

    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);

        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// Pre-activation ResNet; the defaults build the 18-layer variant.
#[derive(Config, Debug)]
pub struct PreActResNetConfig {
    pub classes: usize,

    #[config(default = "[2, 2, 2, 2]")]
    pub blocks_per_stage: [usize; 4],

    /// Width of the first stage; later stages scale it like 64/128/256/512.
    #[config(default = 64)]
    pub base_channels: usize,

    pub activation: CeluConfig,
}

impl PreActResNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PreActResNet<B> {
        let mut input_channel = self.base_channels;
        let mut blocks = vec![];

        for ((width, stride), count) in STAGE_SETTINGS.into_iter().zip(self.blocks_per_stage) {
            let c = width * self.base_channels / 64;

            for i in 0..count {
                let stride = if i == 0 { stride } else { 1 };

                blocks.push(
                    PreActBlockConfig::new([input_channel, c], self.activation.clone())
                        .with_stride([stride, stride])
                        .init(device),
                );
                input_channel = c;
            }
        }

        PreActResNet {
            stem: Conv2dConfig::new([3, self.base_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            blocks,
            norm: BatchNormConfig::new(input_channel).init(device),
            activation: self.activation.init(),
            avg_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            linear: LinearConfig::new(input_channel, self.classes).init(device),
        }
    }
}
