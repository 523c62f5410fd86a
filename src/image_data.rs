use std::path::Path;

use anyhow::{bail, Context, Result};
use burn::tensor::{backend::Backend, Tensor};
use image::{imageops, GrayImage, Luma};

/// Convert a `[batch, 1, height, width]` tensor in [-1, 1] back to grayscale
/// images.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<GrayImage>> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 1 {
        bail!("expected single-channel images, got {channels} channels");
    }

    let scaled = (tensor + 1.0) / 2.0 * 255.0;
    let values = scaled
        .clamp(0.0, 255.0)
        .to_data()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("cannot read image tensor: {err:?}"))?;

    let plane = height * width;
    let mut images = Vec::with_capacity(batch);
    for i in 0..batch {
        let pixels: Vec<u8> = values[i * plane..(i + 1) * plane]
            .iter()
            .map(|&v| v as u8)
            .collect();
        let img = GrayImage::from_raw(width as u32, height as u32, pixels)
            .context("tensor plane did not fill an image")?;
        images.push(img);
    }
    Ok(images)
}

/// Stack a batch of equally sized images into one vertical strip.
pub fn merge_column(images: &[GrayImage]) -> Result<GrayImage> {
    let first = images.first().context("no images to merge")?;
    let (width, height) = (first.width(), first.height());

    let mut merged = GrayImage::from_pixel(width, height * images.len() as u32, Luma([255]));
    for (i, img) in images.iter().enumerate() {
        imageops::overlay(&mut merged, img, 0, (i as u32 * height) as i64);
    }
    Ok(merged)
}

/// Concatenate strips side by side and write the sheet to disk.
pub fn save_concat_images(strips: &[GrayImage], path: &Path) -> Result<()> {
    let first = strips.first().context("no images to save")?;
    let (width, height) = (first.width(), first.height());

    let mut sheet = GrayImage::from_pixel(width * strips.len() as u32, height, Luma([255]));
    for (i, strip) in strips.iter().enumerate() {
        imageops::overlay(&mut sheet, strip, (i as u32 * width) as i64, 0);
    }
    sheet
        .save(path)
        .with_context(|| format!("cannot write sample sheet {}", path.display()))
}
