use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{bail, Context, Result};
use burn::{
    config::Config,
    module::Module,
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinFileRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::AutodiffBackend, ElementConversion, Int, Tensor, TensorData},
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    dataset::{DataProvider, GlyphBatch},
    image_data::{merge_column, save_concat_images, tensor_to_images},
    model::{
        compute_losses, discriminator::Discriminator, generator::Generator, split_pair,
        LossConfig, ModelConfig,
    },
};

type FileRecorder = BinFileRecorder<FullPrecisionSettings>;

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub loss: LossConfig,
    pub experiment_id: usize,
    pub experiment_dir: String,
    pub data_root_path: String,
    pub structure_encoder_dir: String,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub learning_rate: f64,
    #[config(default = 0.0002)]
    pub min_learning_rate: f64,
    /// Halve the learning rate every this many epochs.
    #[config(default = 10)]
    pub schedule: usize,
    #[config(default = 50)]
    pub sample_steps: usize,
    #[config(default = 2)]
    pub max_to_keep: usize,
    #[config(default = true)]
    pub resume: bool,
    /// Enable the no-target loss path with shuffled style ids.
    #[config(default = false)]
    pub flip_labels: bool,
    #[config(default = false)]
    pub freeze_encoder: bool,
    #[config(default = false)]
    pub freeze_structure_encoder: bool,
    pub fine_tune: Option<Vec<i64>>,
    pub seed: u64,
}

impl TrainingConfig {
    /// Checkpoint directory keyed by experiment id and batch size.
    pub fn model_dir(&self) -> PathBuf {
        Path::new(&self.experiment_dir)
            .join("checkpoint")
            .join(format!(
                "experiment_{}_batch_{}",
                self.experiment_id, self.batch_size
            ))
    }

    pub fn sample_dir(&self) -> PathBuf {
        Path::new(&self.experiment_dir).join("sample").join(format!(
            "experiment_{}_batch_{}",
            self.experiment_id, self.batch_size
        ))
    }
}

/// Mutable run state persisted next to the parameter records.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrainingState {
    pub step: usize,
    pub epoch: usize,
    pub learning_rate: f64,
    pub best_l1: f64,
}

impl TrainingState {
    fn fresh(learning_rate: f64) -> Self {
        Self {
            step: 0,
            epoch: 0,
            learning_rate,
            best_l1: f64::INFINITY,
        }
    }
}

/// One decay event: halve, floored at the configured minimum.
pub fn decay_learning_rate(current: f64, min_learning_rate: f64) -> f64 {
    (current / 2.0).max(min_learning_rate)
}

/// Run the adversarial training loop.
///
/// Per batch: one discriminator step, then two generator steps (the second
/// generator update is the stabilizing move the original DCGAN recipe uses).
/// The generator objective also carries the structure-encoder parameters; the
/// discriminator objective only its own.
pub fn train<B: AutodiffBackend>(config: TrainingConfig, devices: Vec<B::Device>) -> Result<()> {
    let device = match devices.first() {
        Some(device) => device.clone(),
        // the caller must bind the run to an execution device first
        None => bail!("no device bound for this training run"),
    };
    B::seed(config.seed);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let model_dir = config.model_dir();
    let sample_dir = config.sample_dir();
    fs::create_dir_all(&model_dir)?;
    fs::create_dir_all(&sample_dir)?;
    config.save(model_dir.join("config.json"))?;

    let mut provider = DataProvider::new(
        Path::new(&config.data_root_path),
        config.model.image_size,
        config.model.max_seq_len,
        config.fine_tune.as_deref(),
    )?;
    let total_batches = provider.compute_total_batch_num(config.batch_size);

    let mut generator = config.model.init_generator::<B>(&device);
    let mut discriminator = config.model.init_discriminator::<B>(&device);

    // the structure encoder is pretrained separately and restored before the
    // adversarial run starts
    restore_structure_encoder(&mut generator, Path::new(&config.structure_encoder_dir), &device);

    if config.freeze_encoder {
        println!("freeze encoder weights");
        generator.encoder = generator.encoder.clone().no_grad();
    }
    if config.freeze_structure_encoder {
        println!("freeze structure encoder weights");
        generator.structure = generator.structure.clone().no_grad();
    }

    let mut optim_gen = AdamConfig::new().with_beta_1(0.5).init();
    let mut optim_disc = AdamConfig::new().with_beta_1(0.5).init();

    let mut state = TrainingState::fresh(config.learning_rate);
    if config.resume {
        let (g, d, og, od, restored) = restore_checkpoint(
            &model_dir,
            &device,
            generator,
            discriminator,
            optim_gen,
            optim_disc,
        )?;
        generator = g;
        discriminator = d;
        optim_gen = og;
        optim_disc = od;
        if let Some(restored) = restored {
            println!("restored model at step {}", restored.step);
            state = restored;
        }
    }

    let start_time = Instant::now();

    for epoch in state.epoch..config.num_epochs {
        if (epoch + 1) % config.schedule == 0 {
            let next = decay_learning_rate(state.learning_rate, config.min_learning_rate);
            if next < state.learning_rate {
                println!(
                    "decay learning rate from {:.5} to {:.5}",
                    state.learning_rate, next
                );
                state.learning_rate = next;
            }
        }

        provider.shuffle_train(&mut rng);

        for batch_idx in 0..total_batches {
            state.step += 1;
            let selected = provider.select_train_batch(config.batch_size, batch_idx);
            let batch = provider.build_batch::<B>(&selected, &device)?;
            let (source, target) = split_pair(
                batch.images.clone(),
                config.model.output_channels,
                config.model.input_channels,
            );

            let no_target_ids = config.flip_labels.then(|| {
                let mut shuffled = batch.labels.clone();
                shuffled.shuffle(&mut rng);
                let count = shuffled.len();
                Tensor::<B, 1, Int>::from_data(
                    TensorData::new(shuffled, [count]).convert::<B::IntElem>(),
                    &device,
                )
            });

            // optimize D
            let d_losses = compute_losses(
                &generator,
                &discriminator,
                &config.loss,
                source.clone(),
                target.clone(),
                batch.style_ids.clone(),
                batch.codes.clone(),
                no_target_ids.clone(),
            );
            let grads = GradientsParams::from_grads(d_losses.d_loss.backward(), &discriminator);
            discriminator = optim_disc.step(state.learning_rate, discriminator, grads);

            // optimize G
            let g_losses = compute_losses(
                &generator,
                &discriminator,
                &config.loss,
                source.clone(),
                target.clone(),
                batch.style_ids.clone(),
                batch.codes.clone(),
                no_target_ids.clone(),
            );
            let grads = GradientsParams::from_grads(g_losses.g_loss.backward(), &generator);
            generator = optim_gen.step(state.learning_rate, generator, grads);

            // a second G update keeps the adversarial game from collapsing
            let losses = compute_losses(
                &generator,
                &discriminator,
                &config.loss,
                source,
                target,
                batch.style_ids.clone(),
                batch.codes.clone(),
                no_target_ids,
            );
            let grads = GradientsParams::from_grads(losses.g_loss.clone().backward(), &generator);
            generator = optim_gen.step(state.learning_rate, generator, grads);

            println!(
                "Epoch: [{:2}], [{:4}/{:4}] time: {:.4}, d_loss: {:.5}, g_loss: {:.5}, \
                 category_loss: {:.5}, cheat_loss: {:.5}, const_loss: {:.5}, l1_loss: {:.5}, tv_loss: {:.5}",
                epoch,
                batch_idx,
                total_batches,
                start_time.elapsed().as_secs_f64(),
                losses.d_loss.into_scalar().elem::<f32>(),
                losses.g_loss.into_scalar().elem::<f32>(),
                losses.category_loss.into_scalar().elem::<f32>(),
                losses.cheat_loss.into_scalar().elem::<f32>(),
                losses.const_loss.into_scalar().elem::<f32>(),
                losses.l1_loss.into_scalar().elem::<f32>(),
                losses.tv_loss.into_scalar().elem::<f32>(),
            );

            if state.step % config.sample_steps == 0 {
                if let Some(valid_l1) = validate_all(
                    &generator,
                    &discriminator,
                    &provider,
                    &config,
                    &sample_dir,
                    epoch,
                    state.step,
                    &device,
                )? {
                    println!("validation l1: {valid_l1:.5}");
                    if valid_l1 < state.best_l1 {
                        state.best_l1 = valid_l1;
                        save_checkpoint(
                            &model_dir,
                            &generator,
                            &discriminator,
                            &optim_gen,
                            &optim_disc,
                            &state,
                            config.max_to_keep,
                        )?;
                    }
                }
            }
        }

        state.epoch = epoch + 1;
    }

    println!("Checkpoint: last checkpoint step {}", state.step);
    save_checkpoint(
        &model_dir,
        &generator,
        &discriminator,
        &optim_gen,
        &optim_disc,
        &state,
        config.max_to_keep,
    )?;

    Ok(())
}

/// Mean L1 reconstruction loss over the whole validation stream, writing a
/// sample sheet for the first batch. Returns `None` when there is no
/// validation data.
#[allow(clippy::too_many_arguments)]
fn validate_all<B: AutodiffBackend>(
    generator: &Generator<B>,
    discriminator: &Discriminator<B>,
    provider: &DataProvider,
    config: &TrainingConfig,
    sample_dir: &Path,
    epoch: usize,
    step: usize,
    device: &B::Device,
) -> Result<Option<f64>> {
    if provider.val.is_empty() {
        return Ok(None);
    }
    let batches = (provider.val.len() + config.batch_size - 1) / config.batch_size;
    let mut total = 0.0f64;

    for batch_idx in 0..batches {
        let selected = provider.select_val_batch(config.batch_size, batch_idx * config.batch_size);
        let batch: GlyphBatch<B> = provider.build_batch(&selected, device)?;
        let (source, target) = split_pair(
            batch.images,
            config.model.output_channels,
            config.model.input_channels,
        );

        let losses = compute_losses(
            generator,
            discriminator,
            &config.loss,
            source.clone(),
            target.clone(),
            batch.style_ids,
            batch.codes,
            None,
        );
        total += f64::from(losses.l1_loss.clone().into_scalar().elem::<f32>());

        if batch_idx == 0 {
            let source_column = merge_column(&tensor_to_images(source)?)?;
            let real_column = merge_column(&tensor_to_images(target)?)?;
            let fake_column = merge_column(&tensor_to_images(losses.generated.clone())?)?;
            let path = sample_dir.join(format!("sample_{epoch:02}_{step:04}.png"));
            save_concat_images(&[source_column, real_column, fake_column], &path)?;
        }
    }

    Ok(Some(total / batches as f64))
}

/// Write all parameter records plus run state under `step-<n>`, pruning the
/// oldest snapshots beyond the retention bound. The final snapshot only
/// becomes visible once fully written.
pub fn save_checkpoint<B, OG, OD>(
    model_dir: &Path,
    generator: &Generator<B>,
    discriminator: &Discriminator<B>,
    optim_gen: &OG,
    optim_disc: &OD,
    state: &TrainingState,
    max_to_keep: usize,
) -> Result<()>
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B>,
    OD: Optimizer<Discriminator<B>, B>,
{
    let recorder = FileRecorder::new();
    let staging = model_dir.join(format!(".step-{}.partial", state.step));
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    generator
        .clone()
        .save_file(staging.join("generator"), &recorder)?;
    // the structure encoder is also written standalone so it can seed a
    // later run's pretrained restore
    generator
        .structure
        .clone()
        .save_file(staging.join("structure"), &recorder)?;
    discriminator
        .clone()
        .save_file(staging.join("discriminator"), &recorder)?;
    recorder.record(optim_gen.to_record(), staging.join("optim_gen"))?;
    recorder.record(optim_disc.to_record(), staging.join("optim_disc"))?;
    fs::write(
        staging.join("state.json"),
        serde_json::to_string_pretty(state)?,
    )?;

    let final_dir = model_dir.join(format!("step-{}", state.step));
    if final_dir.exists() {
        fs::remove_dir_all(&final_dir)?;
    }
    fs::rename(&staging, &final_dir)?;

    prune_checkpoints(model_dir, max_to_keep)?;
    Ok(())
}

fn prune_checkpoints(model_dir: &Path, max_to_keep: usize) -> Result<()> {
    let mut steps = checkpoint_steps(model_dir)?;
    steps.sort_unstable();
    while steps.len() > max_to_keep {
        let oldest = steps.remove(0);
        fs::remove_dir_all(model_dir.join(format!("step-{oldest}")))?;
    }
    Ok(())
}

fn checkpoint_steps(model_dir: &Path) -> Result<Vec<usize>> {
    let mut steps = Vec::new();
    for entry in fs::read_dir(model_dir).context("cannot list checkpoint directory")? {
        let entry = entry?;
        if let Some(step) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.strip_prefix("step-"))
            .and_then(|raw| raw.parse::<usize>().ok())
        {
            steps.push(step);
        }
    }
    Ok(steps)
}

/// Newest retained snapshot, if any.
pub fn latest_checkpoint(model_dir: &Path) -> Option<PathBuf> {
    let steps = checkpoint_steps(model_dir).ok()?;
    let newest = steps.into_iter().max()?;
    Some(model_dir.join(format!("step-{newest}")))
}

/// Load the newest snapshot into the given modules and optimizers. Missing
/// checkpoints are not an error: the run proceeds from the in-memory
/// parameters.
#[allow(clippy::type_complexity)]
pub fn restore_checkpoint<B, OG, OD>(
    model_dir: &Path,
    device: &B::Device,
    generator: Generator<B>,
    discriminator: Discriminator<B>,
    optim_gen: OG,
    optim_disc: OD,
) -> Result<(
    Generator<B>,
    Discriminator<B>,
    OG,
    OD,
    Option<TrainingState>,
)>
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B>,
    OD: Optimizer<Discriminator<B>, B>,
{
    let Some(snapshot) = latest_checkpoint(model_dir) else {
        println!("fail to restore model {}", model_dir.display());
        return Ok((generator, discriminator, optim_gen, optim_disc, None));
    };
    let recorder = FileRecorder::new();

    let generator = generator.load_file(snapshot.join("generator"), &recorder, device)?;
    let discriminator =
        discriminator.load_file(snapshot.join("discriminator"), &recorder, device)?;

    let gen_record = recorder.load(snapshot.join("optim_gen").into(), device)?;
    let optim_gen = optim_gen.load_record(gen_record);
    let disc_record = recorder.load(snapshot.join("optim_disc").into(), device)?;
    let optim_disc = optim_disc.load_record(disc_record);

    let raw = fs::read_to_string(snapshot.join("state.json"))?;
    let state = serde_json::from_str(&raw)?;
    Ok((generator, discriminator, optim_gen, optim_disc, Some(state)))
}

/// Restore only the pretrained structure-encoder parameters; missing records
/// are logged and skipped.
pub fn restore_structure_encoder<B: AutodiffBackend>(
    generator: &mut Generator<B>,
    dir: &Path,
    device: &B::Device,
) {
    let recorder = FileRecorder::new();
    match generator
        .structure
        .clone()
        .load_file(dir.join("structure"), &recorder, device)
    {
        Ok(structure) => {
            println!("restored structure encoder {}", dir.display());
            generator.structure = structure;
        }
        Err(_) => println!("fail to restore structure encoder {}", dir.display()),
    }
}

/// Restore the newest full checkpoint, then write only the generation-side
/// parameters (generator + structure encoder) for deployment.
pub fn export_generator<B: AutodiffBackend>(
    config: &TrainingConfig,
    save_dir: &Path,
    device: &B::Device,
) -> Result<()> {
    let model_dir = config.model_dir();
    let snapshot =
        latest_checkpoint(&model_dir).context("no checkpoint available for export")?;
    let recorder = FileRecorder::new();

    let generator = config
        .model
        .init_generator::<B>(device)
        .load_file(snapshot.join("generator"), &recorder, device)?;

    fs::create_dir_all(save_dir)?;
    generator
        .structure
        .clone()
        .save_file(save_dir.join("structure"), &recorder)?;
    generator.save_file(save_dir.join("gen_model"), &recorder)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
    use burn::tensor::Distribution;

    use super::*;

    #[test]
    fn test_frozen_encoder_is_not_updated() {
        type B = Autodiff<NdArray>;
        let device = NdArrayDevice::Cpu;

        let model = ModelConfig::new(256, 3, 12, 6)
            .with_generator_dim(2)
            .with_discriminator_dim(2)
            .with_structure_embed_dim(4)
            .with_structure_blocks(1)
            .with_n_heads(2)
            .with_feed_forward_size(8);
        let mut generator = model.init_generator::<B>(&device);
        let discriminator = model.init_discriminator::<B>(&device);
        generator.encoder = generator.encoder.clone().no_grad();

        let encoder_before = generator.encoder.layers[0]
            .conv
            .weight
            .val()
            .to_data()
            .to_vec::<f32>()
            .unwrap();
        let decoder_before = generator.decoder.layers[0]
            .deconv
            .weight
            .val()
            .to_data()
            .to_vec::<f32>()
            .unwrap();

        let source: Tensor<B, 4> =
            Tensor::random([2, 1, 256, 256], Distribution::Uniform(-1.0, 1.0), &device);
        let target: Tensor<B, 4> =
            Tensor::random([2, 1, 256, 256], Distribution::Uniform(-1.0, 1.0), &device);
        let style_ids = Tensor::from_ints([0, 2], &device);
        let codes = Tensor::from_ints([[1, 2, 0, 0, 0, 0], [3, 4, 5, 0, 0, 0]], &device);

        let losses = compute_losses(
            &generator,
            &discriminator,
            &crate::model::LossConfig::new(),
            source,
            target,
            style_ids,
            codes,
            None,
        );
        let grads = GradientsParams::from_grads(losses.g_loss.backward(), &generator);
        let mut optim = AdamConfig::new().init();
        let generator = optim.step(1e-2, generator, grads);

        let encoder_after = generator.encoder.layers[0]
            .conv
            .weight
            .val()
            .to_data()
            .to_vec::<f32>()
            .unwrap();
        let decoder_after = generator.decoder.layers[0]
            .deconv
            .weight
            .val()
            .to_data()
            .to_vec::<f32>()
            .unwrap();

        assert_eq!(encoder_before, encoder_after);
        assert_ne!(decoder_before, decoder_after);
    }

    #[test]
    fn test_learning_rate_halves_to_floor() {
        let r0 = 0.0016;
        let floor = 0.0002;
        let mut lr = r0;
        for decay_events in 1..=6 {
            lr = decay_learning_rate(lr, floor);
            let expected = (r0 / f64::powi(2.0, decay_events)).max(floor);
            assert!((lr - expected).abs() < 1e-12);
        }
        assert_eq!(lr, floor);
    }

    #[test]
    fn test_checkpoint_step_listing() {
        let dir = std::env::temp_dir().join("glyph_gan_ckpt_listing_test");
        let _ = fs::remove_dir_all(&dir);
        for step in [10, 250, 40] {
            fs::create_dir_all(dir.join(format!("step-{step}"))).unwrap();
        }
        fs::create_dir_all(dir.join("not-a-step")).unwrap();

        let latest = latest_checkpoint(&dir).unwrap();
        assert!(latest.ends_with("step-250"));

        prune_checkpoints(&dir, 2).unwrap();
        let mut steps = checkpoint_steps(&dir).unwrap();
        steps.sort_unstable();
        assert_eq!(steps, vec![40, 250]);
    }
}
