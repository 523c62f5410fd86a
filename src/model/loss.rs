use burn::{
    config::Config,
    nn::loss::{BinaryCrossEntropyLoss, BinaryCrossEntropyLossConfig},
    tensor::{backend::Backend, Int, Tensor},
};

use crate::burn_ext::utils::one_hot_int;

use super::{discriminator::Discriminator, generator::Generator};

/// Weighting for each loss term.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = 100.0)]
    pub l1_penalty: f64,
    #[config(default = 15.0)]
    pub lconst_penalty: f64,
    #[config(default = 0.0)]
    pub ltv_penalty: f64,
    #[config(default = 1.0)]
    pub lcategory_penalty: f64,
}

/// The named loss values of one batch, plus the tensors worth keeping around
/// for sampling. All terms are non-negative scalars.
#[derive(Debug)]
pub struct GanLosses<B: Backend> {
    pub d_loss: Tensor<B, 1>,
    pub g_loss: Tensor<B, 1>,
    pub d_loss_real: Tensor<B, 1>,
    pub d_loss_fake: Tensor<B, 1>,
    pub const_loss: Tensor<B, 1>,
    pub l1_loss: Tensor<B, 1>,
    pub category_loss: Tensor<B, 1>,
    pub cheat_loss: Tensor<B, 1>,
    pub tv_loss: Tensor<B, 1>,
    pub generated: Tensor<B, 4>,
}

/// Binary cross-entropy over logits, averaged over every element.
fn bce<B: Backend>(
    loss: &BinaryCrossEntropyLoss<B>,
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2, Int>,
) -> Tensor<B, 1> {
    loss.forward(logits.reshape([-1]), targets.reshape([-1]))
}

fn adversarial_targets<B: Backend>(
    logits: &Tensor<B, 2>,
    real: bool,
) -> Tensor<B, 2, Int> {
    let device = logits.device();
    if real {
        Tensor::ones(logits.dims(), &device)
    } else {
        Tensor::zeros(logits.dims(), &device)
    }
}

/// Sum-of-squared finite differences along both spatial axes, each normalized
/// by the image width.
pub fn total_variation<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 1> {
    let [_, _, height, width] = images.dims();
    let diff_h = images.clone().narrow(2, 1, height - 1) - images.clone().narrow(2, 0, height - 1);
    let diff_w = images.clone().narrow(3, 1, width - 1) - images.narrow(3, 0, width - 1);
    let l2_h = diff_h.powf_scalar(2.0).sum().mul_scalar(0.5);
    let l2_w = diff_w.powf_scalar(2.0).sum().mul_scalar(0.5);
    (l2_h + l2_w).div_scalar(width as f64)
}

/// Compute every loss term and the combined discriminator/generator
/// objectives for one batch.
///
/// When `no_target_ids` is given, the same source images are pushed through
/// the generator a second time with those (shuffled) style ids. That pass has
/// no ground-truth target, so its reconstruction term is omitted, but its
/// adversarial, category and constancy terms still feed both objectives as
/// extra gradient signal.
/// Its discriminator contribution carries only a fake-label term; there is no
/// guaranteed-real counterpart for a no-target pair.
pub fn compute_losses<B: Backend>(
    generator: &Generator<B>,
    discriminator: &Discriminator<B>,
    loss_config: &LossConfig,
    source: Tensor<B, 4>,
    target: Tensor<B, 4>,
    style_ids: Tensor<B, 1, Int>,
    codes: Tensor<B, 2, Int>,
    no_target_ids: Option<Tensor<B, 1, Int>>,
) -> GanLosses<B> {
    let device = source.device();
    let num_styles = generator.num_styles();
    let bce_loss = BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(&device);

    let (generated, encoded_source) =
        generator.forward(source.clone(), style_ids.clone(), codes.clone());
    let real_pair = Tensor::cat(vec![source.clone(), target.clone()], 1);
    let fake_pair = Tensor::cat(vec![source.clone(), generated.clone()], 1);

    let (real_logits, real_category_logits) = discriminator.forward(real_pair);
    let (fake_logits, fake_category_logits) = discriminator.forward(fake_pair);

    // the generated image should re-encode close to its source
    let encoded_generated = generator.encode_only(generated.clone());
    let const_loss = (encoded_source - encoded_generated)
        .powf_scalar(2.0)
        .mean()
        .mul_scalar(loss_config.lconst_penalty);

    let true_labels = one_hot_int(style_ids, num_styles);
    let real_category_loss = bce(&bce_loss, real_category_logits, true_labels.clone());
    let fake_category_loss = bce(&bce_loss, fake_category_logits, true_labels);
    let category_loss = (real_category_loss + fake_category_loss.clone())
        .mul_scalar(loss_config.lcategory_penalty);

    let d_loss_real = bce(
        &bce_loss,
        real_logits.clone(),
        adversarial_targets(&real_logits, true),
    );
    let d_loss_fake = bce(
        &bce_loss,
        fake_logits.clone(),
        adversarial_targets(&fake_logits, false),
    );

    let l1_loss = (generated.clone() - target)
        .abs()
        .mean()
        .mul_scalar(loss_config.l1_penalty);
    let tv_loss = total_variation(generated.clone()).mul_scalar(loss_config.ltv_penalty);
    let cheat_loss = bce(
        &bce_loss,
        fake_logits.clone(),
        adversarial_targets(&fake_logits, true),
    );

    let mut d_loss =
        d_loss_real.clone() + d_loss_fake.clone() + category_loss.clone().div_scalar(2.0);
    let mut g_loss = cheat_loss.clone()
        + l1_loss.clone()
        + fake_category_loss
            .clone()
            .mul_scalar(loss_config.lcategory_penalty)
        + const_loss.clone()
        + tv_loss.clone();

    if let Some(no_target_ids) = no_target_ids {
        let (nt_generated, encoded_nt_source) =
            generator.forward(source.clone(), no_target_ids.clone(), codes);
        let nt_pair = Tensor::cat(vec![source, nt_generated.clone()], 1);
        let (nt_logits, nt_category_logits) = discriminator.forward(nt_pair);

        let encoded_nt_generated = generator.encode_only(nt_generated);
        let nt_const_loss = (encoded_nt_source - encoded_nt_generated)
            .powf_scalar(2.0)
            .mean()
            .mul_scalar(loss_config.lconst_penalty);
        let nt_labels = one_hot_int(no_target_ids, num_styles);
        let nt_category_loss = bce(&bce_loss, nt_category_logits, nt_labels)
            .mul_scalar(loss_config.lcategory_penalty);

        let d_loss_nt = bce(
            &bce_loss,
            nt_logits.clone(),
            adversarial_targets(&nt_logits, false),
        );
        let nt_cheat = bce(
            &bce_loss,
            nt_logits.clone(),
            adversarial_targets(&nt_logits, true),
        );

        d_loss = d_loss_real.clone()
            + d_loss_fake.clone()
            + d_loss_nt
            + (category_loss.clone() + nt_category_loss.clone()).div_scalar(3.0);
        // the no-target category term arrives already penalty-scaled and the
        // combined pair is scaled once more, so that side carries the penalty
        // squared
        g_loss = (cheat_loss.clone() + nt_cheat).div_scalar(2.0)
            + l1_loss.clone()
            + (fake_category_loss + nt_category_loss)
                .mul_scalar(loss_config.lcategory_penalty)
                .div_scalar(2.0)
            + (const_loss.clone() + nt_const_loss).div_scalar(2.0)
            + tv_loss.clone();
    }

    GanLosses {
        d_loss,
        g_loss,
        d_loss_real,
        d_loss_fake,
        const_loss,
        l1_loss,
        category_loss,
        cheat_loss,
        tv_loss,
        generated,
    }
}
