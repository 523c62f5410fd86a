use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use burn::{
    module::Module,
    record::{BinFileRecorder, FullPrecisionSettings},
    tensor::{backend::Backend, Tensor},
};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    dataset::DataProvider,
    image_data::{merge_column, save_concat_images, tensor_to_images},
    model::{
        generator::{DecoderNorm, Generator},
        split_pair, ModelConfig,
    },
    training::latest_checkpoint,
};

type FileRecorder = BinFileRecorder<FullPrecisionSettings>;

/// Load the generation-side parameters from the newest snapshot under
/// `model_dir`.
pub fn restore_generator<B: Backend>(
    model: &ModelConfig,
    model_dir: &Path,
    device: &B::Device,
) -> Result<Generator<B>> {
    let snapshot = latest_checkpoint(model_dir)
        .with_context(|| format!("no checkpoint under {}", model_dir.display()))?;
    println!("restore generator from {}", snapshot.display());
    let generator = model
        .init_generator::<B>(device)
        .load_file(snapshot.join("generator"), &FileRecorder::new(), device)?;
    Ok(generator)
}

/// Render styled glyphs for every source sheet listed in
/// `infer-labels.txt` under `data_root`.
///
/// With a single style id every example is rendered in that style; with
/// several ids each example draws one of them at random. One column image is
/// written per batch as `inferred_%04d.png`.
#[allow(clippy::too_many_arguments)]
pub fn infer<B: Backend>(
    model: &ModelConfig,
    model_dir: &Path,
    data_root: &Path,
    style_ids: &[i64],
    batch_size: usize,
    save_dir: &Path,
    seed: u64,
    device: &B::Device,
) -> Result<()> {
    if style_ids.is_empty() {
        bail!("at least one style id is required");
    }
    let generator = restore_generator::<B>(model, model_dir, device)?;
    let provider = DataProvider::inject(data_root, "infer-labels.txt", model.image_size, model.max_seq_len)?;
    fs::create_dir_all(save_dir)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let batches = (provider.val.len() + batch_size - 1) / batch_size;
    for count in 0..batches {
        let selected = provider.select_val_batch(batch_size, count * batch_size);
        let mut batch = provider.build_batch::<B>(&selected, device)?;
        let (source, _) = split_pair(batch.images, model.output_channels, model.input_channels);

        for label in batch.labels.iter_mut() {
            *label = style_ids[rng.gen_range(0..style_ids.len())];
        }
        let style_ids = styles_tensor::<B>(&batch.labels, device);

        let (generated, _) = generator.forward(source, style_ids, batch.codes);
        let column = merge_column(&tensor_to_images(generated)?)?;
        let path = save_dir.join(format!("inferred_{count:04}.png"));
        save_concat_images(&[column], &path)?;
        println!("generated images saved at {}", path.display());
    }
    Ok(())
}

/// Walk a morph between two trained styles.
///
/// The conditional instance-norm rows for the two styles are linearly
/// interpolated into `steps + 1` temporary rows, one frame is rendered per
/// interpolation step with that step's row selected, and the original
/// parameters are put back afterwards. Only meaningful for generators built
/// with conditional instance normalization.
#[allow(clippy::too_many_arguments)]
pub fn interpolate<B: Backend>(
    model: &ModelConfig,
    model_dir: &Path,
    data_root: &Path,
    between: (usize, usize),
    steps: usize,
    batch_size: usize,
    save_dir: &Path,
    device: &B::Device,
) -> Result<()> {
    if !model.inst_norm {
        bail!("style interpolation requires a conditional instance-norm generator");
    }
    if steps == 0 {
        bail!("interpolation needs at least one step");
    }
    let mut generator = restore_generator::<B>(model, model_dir, device)?;
    let provider = DataProvider::inject(data_root, "infer-labels.txt", model.image_size, model.max_seq_len)?;
    fs::create_dir_all(save_dir)?;

    let alphas: Vec<f64> = (0..=steps).map(|i| i as f64 / steps as f64).collect();

    // overwrite the per-style rows with the interpolated ones; the originals
    // are snapshotted for restore
    let mut snapshots = Vec::new();
    for layer in generator.decoder.layers.iter_mut() {
        if let Some(DecoderNorm::CondInstance(norm)) = layer.norm.as_mut() {
            let (scale, shift) = norm.snapshot();
            println!(
                "overwrite style rows, old shape -> {:?}, new shape -> [{}, {}]",
                scale.dims(),
                alphas.len(),
                scale.dims()[1],
            );
            norm.overwrite(
                interpolate_rows(&scale, between, &alphas),
                interpolate_rows(&shift, between, &alphas),
            );
            snapshots.push((scale, shift));
        }
    }

    let batches = (provider.val.len() + batch_size - 1) / batch_size;
    for (step_idx, alpha) in alphas.iter().enumerate() {
        println!(
            "interpolate {} -> {:.4} + {} -> {:.4}",
            between.0,
            1.0 - alpha,
            between.1,
            alpha
        );
        let mut columns = Vec::with_capacity(batches);
        for batch_idx in 0..batches {
            let selected = provider.select_val_batch(batch_size, batch_idx * batch_size);
            let batch = provider.build_batch::<B>(&selected, device)?;
            let (source, _) =
                split_pair(batch.images, model.output_channels, model.input_channels);
            let labels = vec![step_idx as i64; batch.labels.len()];
            let style_ids = styles_tensor::<B>(&labels, device);

            let (generated, _) = generator.forward(source, style_ids, batch.codes);
            columns.push(merge_column(&tensor_to_images(generated)?)?);
        }
        let path = save_dir.join(format!(
            "frame_{:02}_{:02}_step_{step_idx:02}.png",
            between.0, between.1
        ));
        save_concat_images(&columns, &path)?;
    }

    println!("restore style rows");
    let mut snapshots = snapshots.into_iter();
    for layer in generator.decoder.layers.iter_mut() {
        if let Some(DecoderNorm::CondInstance(norm)) = layer.norm.as_mut() {
            if let Some((scale, shift)) = snapshots.next() {
                norm.overwrite(scale, shift);
            }
        }
    }
    Ok(())
}

/// `rows[a] * (1 - alpha) + rows[b] * alpha` for every alpha, stacked.
fn interpolate_rows<B: Backend>(
    rows: &Tensor<B, 2>,
    between: (usize, usize),
    alphas: &[f64],
) -> Tensor<B, 2> {
    let x = rows.clone().narrow(0, between.0, 1);
    let y = rows.clone().narrow(0, between.1, 1);

    let interpolated = alphas
        .iter()
        .map(|&alpha| x.clone().mul_scalar(1.0 - alpha) + y.clone().mul_scalar(alpha))
        .collect();
    Tensor::cat(interpolated, 0)
}

fn styles_tensor<B: Backend>(
    labels: &[i64],
    device: &B::Device,
) -> Tensor<B, 1, burn::tensor::Int> {
    Tensor::from_data(
        burn::tensor::TensorData::new(labels.to_vec(), [labels.len()]).convert::<B::IntElem>(),
        device,
    )
}

#[cfg(test)]
mod test {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};
    use burn::tensor::TensorData;

    use super::*;

    #[test]
    fn test_interpolated_rows_hit_both_endpoints() {
        let device = NdArrayDevice::Cpu;
        let rows: Tensor<NdArray, 2> = Tensor::from_data(
            TensorData::new(vec![1.0f32, 2.0, 5.0, 6.0, 9.0, 10.0], [3, 2]),
            &device,
        );

        let alphas = [0.0, 0.5, 1.0];
        let out = interpolate_rows(&rows, (0, 2), &alphas);
        assert_eq!(out.dims(), [3, 2]);

        let values = out.to_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 5.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn test_interpolation_row_count_is_steps_plus_one() {
        let device = NdArrayDevice::Cpu;
        let rows: Tensor<NdArray, 2> = Tensor::ones([4, 3], &device);
        let alphas: Vec<f64> = (0..=10).map(|i| i as f64 / 10.0).collect();
        assert_eq!(interpolate_rows(&rows, (1, 3), &alphas).dims(), [11, 3]);
    }
}
