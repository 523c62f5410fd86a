use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use image::imageops;

use crate::utils::structure_codes::parse_codes;

/// One training example: a paired glyph sheet on disk plus its style label
/// and structure decomposition, pre-padded to the fixed sequence length.
#[derive(Clone, Debug)]
pub struct GlyphExample {
    pub path: String,
    pub style_id: i64,
    pub codes: Vec<i64>,
}

/// A batch of decoded examples, ready for the model.
///
/// `images` holds the target glyph in channel 0 and the source glyph in
/// channel 1, both normalized to [-1, 1].
#[derive(Clone, Debug)]
pub struct GlyphBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub style_ids: Tensor<B, 1, Int>,
    pub codes: Tensor<B, 2, Int>,
    pub labels: Vec<i64>,
}

/// Streams training/validation batches from a data directory holding
/// `train-labels.txt`, `valid-labels.txt` and the paired glyph sheets they
/// reference. Each label row is `path \t style_id \t code,code,...`; each
/// sheet is one grayscale image `[target | source]` split down the middle.
pub struct DataProvider {
    root: PathBuf,
    pub train: Vec<GlyphExample>,
    pub val: Vec<GlyphExample>,
    max_seq_len: usize,
    image_size: usize,
    error_log: PathBuf,
}

impl DataProvider {
    pub fn new(
        data_root: &Path,
        image_size: usize,
        max_seq_len: usize,
        filter_by: Option<&[i64]>,
    ) -> Result<Self> {
        let mut train = load_examples(&data_root.join("train-labels.txt"), max_seq_len)?;
        let mut val = load_examples(&data_root.join("valid-labels.txt"), max_seq_len)?;

        if let Some(styles) = filter_by {
            println!("filter by style -> {styles:?}");
            train.retain(|e| styles.contains(&e.style_id));
            val.retain(|e| styles.contains(&e.style_id));
        }
        println!(
            "train examples -> {}, val examples -> {}",
            train.len(),
            val.len()
        );
        if train.is_empty() {
            bail!("no training examples found under {}", data_root.display());
        }

        Ok(Self {
            root: data_root.to_path_buf(),
            train,
            val,
            max_seq_len,
            image_size,
            error_log: data_root.join("decode_errors.txt"),
        })
    }

    /// Provider over a single injected label file, served through the
    /// validation selectors. Used by inference and interpolation.
    pub fn inject(
        data_root: &Path,
        label_file: &str,
        image_size: usize,
        max_seq_len: usize,
    ) -> Result<Self> {
        let val = load_examples(&data_root.join(label_file), max_seq_len)?;
        if val.is_empty() {
            bail!("no examples found in {label_file}");
        }
        Ok(Self {
            root: data_root.to_path_buf(),
            train: Vec::new(),
            val,
            max_seq_len,
            image_size,
            error_log: data_root.join("decode_errors.txt"),
        })
    }

    /// Reshuffle the training examples at the start of an epoch.
    pub fn shuffle_train<R: rand::Rng>(&mut self, rng: &mut R) {
        use rand::seq::SliceRandom;
        self.train.shuffle(rng);
    }

    /// Total padded batch count per epoch.
    pub fn compute_total_batch_num(&self, batch_size: usize) -> usize {
        (self.train.len() + batch_size - 1) / batch_size
    }

    /// Select training batch `batch_idx` with wraparound, so every batch has
    /// exactly `batch_size` examples.
    pub fn select_train_batch(&self, batch_size: usize, batch_idx: usize) -> Vec<&GlyphExample> {
        select_batch(&self.train, batch_size, batch_idx * batch_size)
    }

    pub fn select_val_batch(&self, batch_size: usize, start: usize) -> Vec<&GlyphExample> {
        select_batch(&self.val, batch_size, start)
    }

    /// Decode a batch of examples into tensors. Undecodable sheets are
    /// appended to the on-disk error log and skipped rather than failing the
    /// run.
    pub fn build_batch<B: Backend>(
        &self,
        examples: &[&GlyphExample],
        device: &B::Device,
    ) -> Result<GlyphBatch<B>> {
        let size = self.image_size;
        let mut images = Vec::with_capacity(examples.len());
        let mut labels = Vec::with_capacity(examples.len());
        let mut codes = Vec::with_capacity(examples.len() * self.max_seq_len);

        for example in examples {
            let path = self.root.join(&example.path);
            match decode_pair(&path, size) {
                Ok(pair) => {
                    let data = TensorData::new(pair, [1, 2, size, size]);
                    images.push(Tensor::<B, 4>::from_data(
                        data.convert::<B::FloatElem>(),
                        device,
                    ));
                    labels.push(example.style_id);
                    codes.extend_from_slice(&example.codes);
                }
                Err(err) => self.log_decode_error(&path, &err),
            }
        }
        if images.is_empty() {
            bail!("every example in the batch failed to decode");
        }

        let batch = images.len();
        Ok(GlyphBatch {
            images: Tensor::cat(images, 0),
            style_ids: Tensor::from_data(
                TensorData::new(labels.clone(), [batch]).convert::<B::IntElem>(),
                device,
            ),
            codes: Tensor::from_data(
                TensorData::new(codes, [batch, self.max_seq_len]).convert::<B::IntElem>(),
                device,
            ),
            labels,
        })
    }

    fn log_decode_error(&self, path: &Path, err: &anyhow::Error) {
        eprintln!("skip undecodable sample {}: {err:#}", path.display());
        let entry = format!("{}\t{err:#}\n", path.display());
        let write = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.error_log)
            .and_then(|mut f| f.write_all(entry.as_bytes()));
        if let Err(io_err) = write {
            eprintln!("cannot write decode error log: {io_err}");
        }
    }
}

fn select_batch(examples: &[GlyphExample], batch_size: usize, start: usize) -> Vec<&GlyphExample> {
    let mut batch = Vec::with_capacity(batch_size);
    for offset in 0..batch_size {
        batch.push(&examples[(start + offset) % examples.len()]);
    }
    batch
}

/// Parse a tab-separated label file into examples.
pub fn load_examples(label_file: &Path, max_seq_len: usize) -> Result<Vec<GlyphExample>> {
    let data = fs::read_to_string(label_file)
        .with_context(|| format!("cannot read label file {}", label_file.display()))?;

    let mut examples = Vec::new();
    for (line_no, row) in data.trim().split('\n').enumerate() {
        let row = row.trim();
        if row.is_empty() {
            continue;
        }
        let mut fields = row.split('\t');
        let (path, style, raw_codes) = match (fields.next(), fields.next(), fields.next()) {
            (Some(p), Some(s), Some(c)) => (p, s, c),
            _ => bail!("malformed row {} in {}", line_no + 1, label_file.display()),
        };
        let style_id: i64 = style
            .trim()
            .parse()
            .with_context(|| format!("bad style id in row {}", line_no + 1))?;
        let codes = parse_codes(raw_codes, max_seq_len)
            .with_context(|| format!("bad structure codes in row {}", line_no + 1))?;
        examples.push(GlyphExample {
            path: path.to_string(),
            style_id,
            codes,
        });
    }
    Ok(examples)
}

/// Decode one `[target | source]` sheet into normalized interleaved floats,
/// target plane first.
fn decode_pair(path: &Path, size: usize) -> Result<Vec<f32>> {
    let img = image::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let gray = imageops::grayscale(&img);
    let (width, height) = (gray.width() as usize, gray.height() as usize);
    if width != size * 2 || height != size {
        bail!("expected a {}x{} pair sheet, got {width}x{height}", size * 2, size);
    }

    let target = imageops::crop_imm(&gray, 0, 0, size as u32, size as u32).to_image();
    let source = imageops::crop_imm(&gray, size as u32, 0, size as u32, size as u32).to_image();

    let mut pixels = Vec::with_capacity(2 * size * size);
    for plane in [target, source] {
        pixels.extend(
            plane
                .into_vec()
                .into_iter()
                .map(|p| (p as f32 / 255.0 - 0.5) / 0.5),
        );
    }
    Ok(pixels)
}

#[cfg(test)]
mod test {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};
    use image::{GrayImage, Luma};

    use super::*;

    fn write_test_data(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        for (name, shade) in [("a.png", 40u8), ("b.png", 200u8)] {
            let img = GrayImage::from_pixel(8, 4, Luma([shade]));
            img.save(dir.join(name)).unwrap();
        }
        fs::write(
            dir.join("train-labels.txt"),
            "a.png\t0\t3,5,9\nb.png\t2\t7,1\n",
        )
        .unwrap();
        fs::write(dir.join("valid-labels.txt"), "a.png\t1\t4\n").unwrap();
    }

    #[test]
    fn test_provider_builds_batches() {
        let dir = std::env::temp_dir().join("glyph_gan_dataset_test");
        write_test_data(&dir);

        let provider = DataProvider::new(&dir, 4, 6, None).unwrap();
        assert_eq!(provider.train.len(), 2);
        assert_eq!(provider.compute_total_batch_num(2), 1);

        let device = NdArrayDevice::Cpu;
        let selected = provider.select_train_batch(3, 0);
        assert_eq!(selected.len(), 3); // wraps around

        let batch = provider.build_batch::<NdArray>(&selected, &device).unwrap();
        assert_eq!(batch.images.dims(), [3, 2, 4, 4]);
        assert_eq!(batch.codes.dims(), [3, 6]);
        assert_eq!(batch.labels, vec![0, 2, 0]);

        let values = batch.images.to_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_style_filter() {
        let dir = std::env::temp_dir().join("glyph_gan_dataset_filter_test");
        write_test_data(&dir);

        let provider = DataProvider::new(&dir, 4, 6, Some(&[2])).unwrap();
        assert_eq!(provider.train.len(), 1);
        assert_eq!(provider.train[0].style_id, 2);
        assert!(provider.val.is_empty());
    }

    #[test]
    fn test_undecodable_sample_is_skipped_and_logged() {
        let dir = std::env::temp_dir().join("glyph_gan_dataset_error_test");
        write_test_data(&dir);
        fs::write(dir.join("broken.png"), b"not an image").unwrap();
        fs::write(
            dir.join("train-labels.txt"),
            "a.png\t0\t3,5\nbroken.png\t1\t2,2\n",
        )
        .unwrap();
        let _ = fs::remove_file(dir.join("decode_errors.txt"));

        let provider = DataProvider::new(&dir, 4, 6, None).unwrap();
        let device = NdArrayDevice::Cpu;
        let selected = provider.select_train_batch(2, 0);
        let batch = provider.build_batch::<NdArray>(&selected, &device).unwrap();

        assert_eq!(batch.images.dims()[0], 1);
        let log = fs::read_to_string(dir.join("decode_errors.txt")).unwrap();
        assert!(log.contains("broken.png"));
    }
}
