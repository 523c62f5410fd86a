use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        Initializer,
    },
    tensor::{backend::Backend, Int, Tensor},
};

/// 5x5 stride-2 convolution with SAME-style padding, halving the spatial size.
pub fn convolution<B: Backend>(
    device: &B::Device,
    in_channels: usize,
    out_channels: usize,
    stride: [usize; 2],
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [5, 5])
        .with_stride(stride)
        .with_padding(burn::nn::PaddingConfig2d::Explicit(2, 2))
        .with_initializer(Initializer::Normal {
            mean: 0.0,
            std: 0.02,
        })
        .init(device)
}

/// 5x5 stride-2 transposed convolution that exactly doubles the spatial size.
pub fn deconvolution<B: Backend>(
    device: &B::Device,
    in_channels: usize,
    out_channels: usize,
) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [5, 5])
        .with_stride([2, 2])
        .with_padding([2, 2])
        .with_padding_out([1, 1])
        .with_initializer(Initializer::Normal {
            mean: 0.0,
            std: 0.02,
        })
        .init(device)
}

/// One-hot encode integer ids into a float tensor of shape `[batch, depth]`.
///
/// Ids outside `[0, depth)` produce an all-zero row instead of panicking. The
/// style interpolation path relies on this when it generates with more steps
/// than there are trained styles.
pub fn one_hot<B: Backend>(ids: Tensor<B, 1, Int>, depth: usize) -> Tensor<B, 2> {
    let device = ids.device();
    let batch = ids.dims()[0];
    let classes = Tensor::<B, 1, Int>::arange(0..depth as i64, &device)
        .reshape([1, depth])
        .expand([batch, depth]);
    let ids = ids.reshape([batch, 1]).expand([batch, depth]);
    ids.equal(classes).float()
}

/// Integer variant of [`one_hot`], used as binary cross-entropy targets.
pub fn one_hot_int<B: Backend>(ids: Tensor<B, 1, Int>, depth: usize) -> Tensor<B, 2, Int> {
    let device = ids.device();
    let batch = ids.dims()[0];
    let classes = Tensor::<B, 1, Int>::arange(0..depth as i64, &device)
        .reshape([1, depth])
        .expand([batch, depth]);
    let ids = ids.reshape([batch, 1]).expand([batch, depth]);
    ids.equal(classes).int()
}
