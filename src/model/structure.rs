use burn::{
    config::Config,
    module::Module,
    nn::{
        attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        transformer::{PositionWiseFeedForward, PositionWiseFeedForwardConfig},
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig,
        PositionalEncoding, PositionalEncodingConfig,
    },
    tensor::{backend::Backend, Bool, Int, Tensor},
};

use crate::utils::structure_codes::PAD_CODE;

/// One self-attention block: attention and position-wise feed-forward
/// sublayers, each wrapped in pre-norm, residual and dropout.
#[derive(Module, Debug)]
pub struct StructureBlock<B: Backend> {
    pub attention: MultiHeadAttention<B>,
    pub feed_forward: PositionWiseFeedForward<B>,
    pub norm_attention: LayerNorm<B>,
    pub norm_feed_forward: LayerNorm<B>,
    dropout: Dropout,
}

impl<B: Backend> StructureBlock<B> {
    fn forward(&self, input: Tensor<B, 3>, pad_mask: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let normed = self.norm_attention.forward(input.clone());
        let attended = self
            .attention
            .forward(
                MhaInput::new(normed.clone(), normed.clone(), normed).mask_pad(pad_mask),
            )
            .context;
        let output = input + self.dropout.forward(attended);

        let normed = self.norm_feed_forward.forward(output.clone());
        output + self.dropout.forward(self.feed_forward.forward(normed))
    }
}

/// Encodes a padded radical/component code sequence into a per-position
/// memory tensor used to condition the glyph generator.
#[derive(Module, Debug)]
pub struct StructureEncoder<B: Backend> {
    pub embedding: Embedding<B>,
    pub position: PositionalEncoding<B>,
    pos_dropout: Dropout,
    pub blocks: Vec<StructureBlock<B>>,
    pub norm_final: LayerNorm<B>,
    sqrt_embed_dim: f64,
    max_seq_len: usize,
    embed_dim: usize,
}

impl<B: Backend> StructureEncoder<B> {
    /// Encode a `[batch, max_seq_len]` code batch into `[batch, max_seq_len,
    /// embed_dim]` memory. Positions holding the pad code contribute zero
    /// attention weight in every head of every block.
    pub fn forward(&self, codes: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let pad_mask = codes.clone().equal_elem(PAD_CODE);

        let embedded = self
            .embedding
            .forward(codes)
            .mul_scalar(self.sqrt_embed_dim);
        let embedded = self.position.forward(embedded);
        let mut memory = self.pos_dropout.forward(embedded);

        for block in self.blocks.iter() {
            memory = block.forward(memory, pad_mask.clone());
        }

        self.norm_final.forward(memory)
    }

    /// Memory flattened to the fixed-size conditioning vector
    /// `[batch, max_seq_len * embed_dim, 1, 1]` consumed by the decoder.
    pub fn forward_flattened(&self, codes: Tensor<B, 2, Int>) -> Tensor<B, 4> {
        let memory = self.forward(codes);
        let [batch, _, _] = memory.dims();
        memory.reshape([batch, self.max_seq_len * self.embed_dim, 1, 1])
    }

    pub fn memory_size(&self) -> usize {
        self.max_seq_len * self.embed_dim
    }
}

#[derive(Config, Debug)]
pub struct StructureEncoderConfig {
    /// Size of the radical/component code vocabulary.
    vocab_size: usize,
    /// Fixed maximum sequence length; all inputs are pre-padded to this.
    max_seq_len: usize,
    #[config(default = 128)]
    embed_dim: usize,
    #[config(default = 3)]
    blocks: usize,
    #[config(default = 8)]
    n_heads: usize,
    #[config(default = 512)]
    feed_forward_size: usize,
    #[config(default = 0.3)]
    dropout: f64,
}

impl StructureEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> StructureEncoder<B> {
        let embedding = EmbeddingConfig::new(self.vocab_size, self.embed_dim).init(device);
        let position = PositionalEncodingConfig::new(self.embed_dim)
            .with_max_sequence_size(self.max_seq_len.max(2))
            .init(device);
        let pos_dropout = DropoutConfig::new(self.dropout).init();

        let blocks = (0..self.blocks)
            .map(|_| StructureBlock {
                attention: MultiHeadAttentionConfig::new(self.embed_dim, self.n_heads)
                    .with_dropout(self.dropout)
                    .init(device),
                feed_forward: PositionWiseFeedForwardConfig::new(
                    self.embed_dim,
                    self.feed_forward_size,
                )
                .with_dropout(self.dropout)
                .init(device),
                norm_attention: LayerNormConfig::new(self.embed_dim)
                    .with_epsilon(1e-6)
                    .init(device),
                norm_feed_forward: LayerNormConfig::new(self.embed_dim)
                    .with_epsilon(1e-6)
                    .init(device),
                dropout: DropoutConfig::new(self.dropout).init(),
            })
            .collect();

        let norm_final = LayerNormConfig::new(self.embed_dim)
            .with_epsilon(1e-6)
            .init(device);

        StructureEncoder {
            embedding,
            position,
            pos_dropout,
            blocks,
            norm_final,
            sqrt_embed_dim: (self.embed_dim as f64).sqrt(),
            max_seq_len: self.max_seq_len,
            embed_dim: self.embed_dim,
        }
    }
}

#[cfg(test)]
mod test {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};
    use burn::tensor::{Distribution, TensorData};

    use super::*;

    #[test]
    fn test_memory_shape() {
        let device = NdArrayDevice::Cpu;
        let encoder = StructureEncoderConfig::new(50, 8)
            .with_embed_dim(16)
            .with_n_heads(4)
            .with_blocks(2)
            .init::<NdArray>(&device);

        let codes: Tensor<NdArray, 2, Int> = Tensor::from_data(
            TensorData::new(vec![5i64, 7, 9, 0, 0, 0, 0, 0, 11, 2, 0, 0, 0, 0, 0, 0], [2, 8]),
            &device,
        );
        let memory = encoder.forward(codes.clone());
        assert_eq!(memory.dims(), [2, 8, 16]);

        let flat = encoder.forward_flattened(codes);
        assert_eq!(flat.dims(), [2, 128, 1, 1]);
    }

    #[test]
    fn test_pad_positions_get_zero_attention_weight() {
        let device = NdArrayDevice::Cpu;
        let encoder = StructureEncoderConfig::new(50, 6)
            .with_embed_dim(16)
            .with_n_heads(4)
            .with_blocks(1)
            .init::<NdArray>(&device);

        let codes: Tensor<NdArray, 2, Int> = Tensor::from_data(
            TensorData::new(vec![5i64, 7, 9, 0, 0, 0], [1, 6]),
            &device,
        );
        let pad_mask = codes.equal_elem(PAD_CODE);
        let queries: Tensor<NdArray, 3> =
            Tensor::random([1, 6, 16], Distribution::Uniform(-1.0, 1.0), &device);

        let output = encoder.blocks[0].attention.forward(
            MhaInput::new(queries.clone(), queries.clone(), queries).mask_pad(pad_mask),
        );

        // weights: [batch, heads, query, key]; keys 3..6 are padding
        let weights = output.weights.to_data().to_vec::<f32>().unwrap();
        for (i, w) in weights.iter().enumerate() {
            let key = i % 6;
            if key >= 3 {
                assert_eq!(*w, 0.0, "pad key {key} received attention weight {w}");
            }
        }
    }
}
