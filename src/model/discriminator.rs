use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::Conv2d, BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::burn_ext::{activation::LeakyRelu, utils::convolution};

/// Convolutional classifier over a source/target channel pair, emitting an
/// authenticity logit and per-style category logits.
///
/// A single value is shared between the real-pair and generated-pair
/// invocations of every batch, so both see identical parameters.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    conv0: Conv2d<B>,
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    norm2: BatchNorm<B, 2>,
    norm3: BatchNorm<B, 2>,
    fc_adversarial: Linear<B>,
    fc_category: Linear<B>,
    lrelu: LeakyRelu,
}

impl<B: Backend> Discriminator<B> {
    /// # Shapes
    ///
    /// - images: `[batch, source+target channels, size, size]`
    /// - output: (`[batch, 1]` authenticity logits, `[batch, styles]` category logits)
    pub fn forward(&self, images: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let h0 = self.lrelu.forward(self.conv0.forward(images));
        let h1 = self.lrelu.forward(self.norm1.forward(self.conv1.forward(h0)));
        let h2 = self.lrelu.forward(self.norm2.forward(self.conv2.forward(h1)));
        let h3 = self.lrelu.forward(self.norm3.forward(self.conv3.forward(h2)));

        let flat = h3.flatten::<2>(1, 3);
        let adversarial = self.fc_adversarial.forward(flat.clone());
        let category = self.fc_category.forward(flat);

        (adversarial, category)
    }
}

#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub image_size: usize,
    pub num_styles: usize,
    #[config(default = 64)]
    pub discriminator_dim: usize,
    #[config(default = 2)]
    pub pair_channels: usize,
}

impl DiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let dim = self.discriminator_dim;
        // three stride-2 stages then one unit-stride stage
        let flat_size = dim * 8 * (self.image_size / 8) * (self.image_size / 8);
        let fc_init = Initializer::Normal {
            mean: 0.0,
            std: 0.02,
        };

        Discriminator {
            conv0: convolution(device, self.pair_channels, dim, [2, 2]),
            conv1: convolution(device, dim, dim * 2, [2, 2]),
            conv2: convolution(device, dim * 2, dim * 4, [2, 2]),
            conv3: convolution(device, dim * 4, dim * 8, [1, 1]),
            norm1: BatchNormConfig::new(dim * 2).init(device),
            norm2: BatchNormConfig::new(dim * 4).init(device),
            norm3: BatchNormConfig::new(dim * 8).init(device),
            fc_adversarial: LinearConfig::new(flat_size, 1)
                .with_initializer(fc_init.clone())
                .init(device),
            fc_category: LinearConfig::new(flat_size, self.num_styles)
                .with_initializer(fc_init)
                .init(device),
            lrelu: LeakyRelu::new(0.2),
        }
    }
}

#[cfg(test)]
mod test {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};
    use burn::tensor::Distribution;

    use super::*;

    #[test]
    fn test_output_shapes() {
        let device = NdArrayDevice::Cpu;
        let discriminator = DiscriminatorConfig::new(64, 5)
            .with_discriminator_dim(4)
            .init::<NdArray>(&device);

        let pairs: Tensor<NdArray, 4> =
            Tensor::random([3, 2, 64, 64], Distribution::Uniform(-1.0, 1.0), &device);
        let (adversarial, category) = discriminator.forward(pairs);

        assert_eq!(adversarial.dims(), [3, 1]);
        assert_eq!(category.dims(), [3, 5]);
    }

    #[test]
    fn test_shared_weights_give_identical_outputs() {
        let device = NdArrayDevice::Cpu;
        let discriminator = DiscriminatorConfig::new(64, 3)
            .with_discriminator_dim(4)
            .init::<NdArray>(&device);

        let pairs: Tensor<NdArray, 4> =
            Tensor::random([2, 2, 64, 64], Distribution::Uniform(-1.0, 1.0), &device);
        let (first, _) = discriminator.forward(pairs.clone());
        let (second, _) = discriminator.forward(pairs);

        assert_eq!(
            first.to_data().to_vec::<f32>().unwrap(),
            second.to_data().to_vec::<f32>().unwrap()
        );
    }
}
