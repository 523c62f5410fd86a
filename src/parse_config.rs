use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
struct ModelYaml {
    image_size: usize,
    num_styles: usize,
    vocab_size: usize,
    max_seq_len: usize,
    generator_dim: usize,
    discriminator_dim: usize,
    structure_embed_dim: usize,
    structure_blocks: usize,
    n_heads: usize,
    feed_forward_size: usize,
    structure_dropout: f64,
    inst_norm: bool,
}

#[derive(Serialize, Deserialize, Debug)]
struct LossYaml {
    l1_penalty: f64,
    lconst_penalty: f64,
    ltv_penalty: f64,
    lcategory_penalty: f64,
}

#[derive(Serialize, Deserialize, Debug)]
struct TrainingYaml {
    experiment_id: usize,
    experiment_dir: String,
    data_root_path: String,
    structure_encoder_dir: String,
    batch_size: usize,
    num_epochs: usize,
    learning_rate: f64,
    min_learning_rate: f64,
    schedule: usize,
    sample_steps: usize,
    max_to_keep: usize,
    resume: bool,
    flip_labels: bool,
    freeze_encoder: bool,
    freeze_structure_encoder: bool,
    fine_tune: Option<Vec<i64>>,
    seed: u64,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "UPPERCASE")]
struct GanTrainingConfigYaml {
    model: ModelYaml,
    loss: LossYaml,
    training: TrainingYaml,
}

#[derive(Debug)]
pub struct GanFullConfig {
    pub image_size: usize,
    pub num_styles: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub generator_dim: usize,
    pub discriminator_dim: usize,
    pub structure_embed_dim: usize,
    pub structure_blocks: usize,
    pub n_heads: usize,
    pub feed_forward_size: usize,
    pub structure_dropout: f64,
    pub inst_norm: bool,
    pub l1_penalty: f64,
    pub lconst_penalty: f64,
    pub ltv_penalty: f64,
    pub lcategory_penalty: f64,
    pub experiment_id: usize,
    pub experiment_dir: String,
    pub data_root_path: String,
    pub structure_encoder_dir: String,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub learning_rate: f64,
    pub min_learning_rate: f64,
    pub schedule: usize,
    pub sample_steps: usize,
    pub max_to_keep: usize,
    pub resume: bool,
    pub flip_labels: bool,
    pub freeze_encoder: bool,
    pub freeze_structure_encoder: bool,
    pub fine_tune: Option<Vec<i64>>,
    pub seed: u64,
}

impl GanFullConfig {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("training config {} does not exist", path.as_ref().display())
        })?;
        let yaml: GanTrainingConfigYaml =
            serde_yaml::from_str(&raw).context("fail to read training config")?;

        Ok(Self {
            image_size: yaml.model.image_size,
            num_styles: yaml.model.num_styles,
            vocab_size: yaml.model.vocab_size,
            max_seq_len: yaml.model.max_seq_len,
            generator_dim: yaml.model.generator_dim,
            discriminator_dim: yaml.model.discriminator_dim,
            structure_embed_dim: yaml.model.structure_embed_dim,
            structure_blocks: yaml.model.structure_blocks,
            n_heads: yaml.model.n_heads,
            feed_forward_size: yaml.model.feed_forward_size,
            structure_dropout: yaml.model.structure_dropout,
            inst_norm: yaml.model.inst_norm,
            l1_penalty: yaml.loss.l1_penalty,
            lconst_penalty: yaml.loss.lconst_penalty,
            ltv_penalty: yaml.loss.ltv_penalty,
            lcategory_penalty: yaml.loss.lcategory_penalty,
            experiment_id: yaml.training.experiment_id,
            experiment_dir: yaml.training.experiment_dir,
            data_root_path: yaml.training.data_root_path,
            structure_encoder_dir: yaml.training.structure_encoder_dir,
            batch_size: yaml.training.batch_size,
            num_epochs: yaml.training.num_epochs,
            learning_rate: yaml.training.learning_rate,
            min_learning_rate: yaml.training.min_learning_rate,
            schedule: yaml.training.schedule,
            sample_steps: yaml.training.sample_steps,
            max_to_keep: yaml.training.max_to_keep,
            resume: yaml.training.resume,
            flip_labels: yaml.training.flip_labels,
            freeze_encoder: yaml.training.freeze_encoder,
            freeze_structure_encoder: yaml.training.freeze_structure_encoder,
            fine_tune: yaml.training.fine_tune,
            seed: yaml.training.seed,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
MODEL:
  image_size: 256
  num_styles: 7
  vocab_size: 518
  max_seq_len: 28
  generator_dim: 64
  discriminator_dim: 64
  structure_embed_dim: 128
  structure_blocks: 3
  n_heads: 8
  feed_forward_size: 512
  structure_dropout: 0.3
  inst_norm: true
LOSS:
  l1_penalty: 100.0
  lconst_penalty: 15.0
  ltv_penalty: 0.0
  lcategory_penalty: 1.0
TRAINING:
  experiment_id: 0
  experiment_dir: ./experiment
  data_root_path: ./experiment/data
  structure_encoder_dir: ./structure_encoder
  batch_size: 16
  num_epochs: 40
  learning_rate: 0.001
  min_learning_rate: 0.0002
  schedule: 10
  sample_steps: 50
  max_to_keep: 2
  resume: true
  flip_labels: true
  freeze_encoder: false
  freeze_structure_encoder: false
  fine_tune: [1, 3]
  seed: 42
"#;
        let dir = std::env::temp_dir().join("glyph_gan_config_test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        fs::write(&path, yaml).unwrap();

        let config = GanFullConfig::from_yaml(&path).unwrap();
        assert_eq!(config.num_styles, 7);
        assert_eq!(config.max_seq_len, 28);
        assert_eq!(config.fine_tune, Some(vec![1, 3]));
        assert!(config.flip_labels);
        assert_eq!(config.min_learning_rate, 0.0002);
    }
}
