pub mod discriminator;
pub mod generator;
pub mod loss;
pub mod structure;

pub use loss::{compute_losses, GanLosses, LossConfig};

use burn::{
    config::Config,
    tensor::{backend::Backend, Tensor},
};

use discriminator::DiscriminatorConfig;
use generator::GeneratorConfig;
use structure::StructureEncoderConfig;

/// Hyperparameters shared by the generator, discriminator and structure
/// encoder.
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub image_size: usize,
    pub num_styles: usize,
    /// Radical/component code vocabulary size.
    pub vocab_size: usize,
    /// Fixed maximum structure-sequence length.
    pub max_seq_len: usize,
    #[config(default = 64)]
    pub generator_dim: usize,
    #[config(default = 64)]
    pub discriminator_dim: usize,
    #[config(default = 128)]
    pub structure_embed_dim: usize,
    #[config(default = 3)]
    pub structure_blocks: usize,
    #[config(default = 8)]
    pub n_heads: usize,
    #[config(default = 512)]
    pub feed_forward_size: usize,
    #[config(default = 0.3)]
    pub structure_dropout: f64,
    #[config(default = 1)]
    pub input_channels: usize,
    #[config(default = 1)]
    pub output_channels: usize,
    #[config(default = false)]
    pub inst_norm: bool,
}

impl ModelConfig {
    pub fn structure_config(&self) -> StructureEncoderConfig {
        StructureEncoderConfig::new(self.vocab_size, self.max_seq_len)
            .with_embed_dim(self.structure_embed_dim)
            .with_blocks(self.structure_blocks)
            .with_n_heads(self.n_heads)
            .with_feed_forward_size(self.feed_forward_size)
            .with_dropout(self.structure_dropout)
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(self.image_size, self.num_styles, self.structure_config())
            .with_generator_dim(self.generator_dim)
            .with_input_channels(self.input_channels)
            .with_output_channels(self.output_channels)
            .with_inst_norm(self.inst_norm)
    }

    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        DiscriminatorConfig::new(self.image_size, self.num_styles)
            .with_discriminator_dim(self.discriminator_dim)
            .with_pair_channels(self.input_channels + self.output_channels)
    }

    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> generator::Generator<B> {
        self.generator_config().init(device)
    }

    pub fn init_discriminator<B: Backend>(
        &self,
        device: &B::Device,
    ) -> discriminator::Discriminator<B> {
        self.discriminator_config().init(device)
    }
}

/// Split a channel-concatenated pair batch into (source, target).
///
/// The data pipeline stores each pair with the target glyph in the leading
/// channels and the source glyph behind it.
pub fn split_pair<B: Backend>(
    pairs: Tensor<B, 4>,
    target_channels: usize,
    source_channels: usize,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let target = pairs.clone().narrow(1, 0, target_channels);
    let source = pairs.narrow(1, target_channels, source_channels);
    (source, target)
}

#[cfg(test)]
mod test {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};
    use burn::tensor::{Distribution, Int, Tensor, TensorData};

    use super::*;

    #[test]
    fn test_split_pair_orientation() {
        let device = NdArrayDevice::Cpu;
        let target: Tensor<NdArray, 4> = Tensor::ones([1, 1, 4, 4], &device);
        let source: Tensor<NdArray, 4> = Tensor::zeros([1, 1, 4, 4], &device);
        let pairs = Tensor::cat(vec![target, source], 1);

        let (source, target) = split_pair(pairs, 1, 1);
        assert_eq!(source.sum().into_scalar(), 0.0);
        assert_eq!(target.sum().into_scalar(), 16.0);
    }

    /// Full-size forward pass: batch of 16 256x256 glyphs, 7 styles, vocab
    /// 518, sequence length 28.
    #[test]
    fn test_full_size_forward_shapes() {
        let device = NdArrayDevice::Cpu;
        let config = ModelConfig::new(256, 7, 518, 28);
        let generator = config.init_generator::<NdArray>(&device);
        let discriminator = config.init_discriminator::<NdArray>(&device);

        let source: Tensor<NdArray, 4> =
            Tensor::random([16, 1, 256, 256], Distribution::Uniform(-1.0, 1.0), &device);
        let ids: Tensor<NdArray, 1, Int> =
            Tensor::from_ints([0, 1, 2, 3, 4, 5, 6, 0, 1, 2, 3, 4, 5, 6, 0, 1], &device);
        let mut code_values = vec![0i64; 16 * 28];
        for (i, value) in code_values.iter_mut().enumerate() {
            // a handful of leading codes per sequence, the rest padding
            if i % 28 < 5 {
                *value = (i % 517 + 1) as i64;
            }
        }
        let codes: Tensor<NdArray, 2, Int> =
            Tensor::from_data(TensorData::new(code_values, [16, 28]), &device);

        let (generated, bottleneck) = generator.forward(source.clone(), ids, codes);
        assert_eq!(generated.dims(), [16, 1, 256, 256]);
        assert_eq!(bottleneck.dims(), [16, 512, 1, 1]);

        let pairs = Tensor::cat(vec![source, generated], 1);
        let (adversarial, category) = discriminator.forward(pairs);
        assert_eq!(adversarial.dims(), [16, 1]);
        assert_eq!(category.dims(), [16, 7]);
    }
}
