use anyhow::Result;
use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};
use glyph_gan::{
    model::{LossConfig, ModelConfig},
    parse_config::GanFullConfig,
    training::{self, TrainingConfig},
};

fn main() -> Result<()> {
    let full_config = GanFullConfig::from_yaml("./config.yaml")?;

    let model_config = ModelConfig::new(
        full_config.image_size,
        full_config.num_styles,
        full_config.vocab_size,
        full_config.max_seq_len,
    )
    .with_generator_dim(full_config.generator_dim)
    .with_discriminator_dim(full_config.discriminator_dim)
    .with_structure_embed_dim(full_config.structure_embed_dim)
    .with_structure_blocks(full_config.structure_blocks)
    .with_n_heads(full_config.n_heads)
    .with_feed_forward_size(full_config.feed_forward_size)
    .with_structure_dropout(full_config.structure_dropout)
    .with_inst_norm(full_config.inst_norm);
    let loss_config = LossConfig::new()
        .with_l1_penalty(full_config.l1_penalty)
        .with_lconst_penalty(full_config.lconst_penalty)
        .with_ltv_penalty(full_config.ltv_penalty)
        .with_lcategory_penalty(full_config.lcategory_penalty);

    let training_config = TrainingConfig::new(
        model_config,
        loss_config,
        full_config.experiment_id,
        full_config.experiment_dir,
        full_config.data_root_path,
        full_config.structure_encoder_dir,
        full_config.batch_size,
        full_config.num_epochs,
        full_config.learning_rate,
        full_config.seed,
    )
    .with_min_learning_rate(full_config.min_learning_rate)
    .with_schedule(full_config.schedule)
    .with_sample_steps(full_config.sample_steps)
    .with_max_to_keep(full_config.max_to_keep)
    .with_resume(full_config.resume)
    .with_flip_labels(full_config.flip_labels)
    .with_freeze_encoder(full_config.freeze_encoder)
    .with_freeze_structure_encoder(full_config.freeze_structure_encoder)
    .with_fine_tune(full_config.fine_tune);

    let devices = vec![WgpuDevice::default()];
    training::train::<Autodiff<Wgpu>>(training_config, devices)
}
