use std::str::FromStr;

use tch::nn::{ self, BatchNorm, Conv2D, ModuleT, SequentialT };
use tch::Tensor;

use crate::error::Error;

/// Namespace the feature extractor registers under. Every top-level layer
/// sits at `base.<index>` so freezing can address layers by position.
pub const BASE_SCOPE: &str = "base";

/// The supported pretrained feature extractors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backbone {
    ResNet50V2,
    MobileNetV2,
    Vgg16,
}

impl Backbone {
    pub fn name(&self) -> &'static str {
        match self {
            Backbone::ResNet50V2 => "ResNet50V2",
            Backbone::MobileNetV2 => "MobileNetV2",
            Backbone::Vgg16 => "VGG16",
        }
    }

    /// Register the feature extractor under `p`. The classification top is
    /// never built; the output is the final feature map.
    pub fn build(&self, p: &nn::Path) -> BaseModel {
        let (net, out_channels, num_layers) = match self {
            Backbone::Vgg16 => vgg16(p),
            Backbone::ResNet50V2 => resnet50v2(p),
            Backbone::MobileNetV2 => mobilenet_v2(p),
        };
        BaseModel { net, out_channels, num_layers }
    }
}

impl FromStr for Backbone {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "ResNet50V2" => Ok(Backbone::ResNet50V2),
            "MobileNetV2" => Ok(Backbone::MobileNetV2),
            "VGG16" => Ok(Backbone::Vgg16),
            other => Err(Error::UnsupportedBackbone(other.to_string())),
        }
    }
}

/// A built feature extractor plus the facts the head needs about it.
pub struct BaseModel {
    pub net: SequentialT,
    pub out_channels: i64,
    pub num_layers: usize,
}

fn conv3x3(p: nn::Path, c_in: i64, c_out: i64) -> Conv2D {
    let conv2d_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
    nn::conv2d(p, c_in, c_out, 3, conv2d_cfg)
}

fn vgg16_layers() -> Vec<Vec<i64>> {
    vec![
        vec![64, 64],
        vec![128, 128],
        vec![256, 256, 256],
        vec![512, 512, 512],
        vec![512, 512, 512]
    ]
}

fn vgg16(p: &nn::Path) -> (SequentialT, i64, usize) {
    let mut seq = nn::seq_t();
    let mut c_in = 3;
    let mut idx = 0usize;
    for channels in vgg16_layers().into_iter() {
        for &c_out in channels.iter() {
            seq = seq.add(conv3x3(p / &idx.to_string(), c_in, c_out)).add_fn(|xs| xs.relu());
            c_in = c_out;
            idx += 1;
        }
        seq = seq.add_fn(|xs| xs.max_pool2d_default(2));
    }
    (seq, 512, idx)
}

/// Pre-activation bottleneck: BN and ReLU run before each convolution, and
/// the projection shortcut (when present) taps the pre-activated input.
#[derive(Debug)]
struct PreactBottleneck {
    preact_bn: BatchNorm,
    conv1: Conv2D,
    bn1: BatchNorm,
    conv2: Conv2D,
    bn2: BatchNorm,
    conv3: Conv2D,
    shortcut: Option<Conv2D>,
    stride: i64,
}

impl PreactBottleneck {
    fn new(p: &nn::Path, c_in: i64, filters: i64, stride: i64, conv_shortcut: bool) -> Self {
        let c_out = filters * 4;
        let no_bias = nn::ConvConfig { bias: false, ..Default::default() };
        let mid_cfg = nn::ConvConfig { stride, padding: 1, bias: false, ..Default::default() };

        let preact_bn = nn::batch_norm2d(p / "preact_bn", c_in, Default::default());
        let conv1 = nn::conv2d(p / "conv1", c_in, filters, 1, no_bias);
        let bn1 = nn::batch_norm2d(p / "bn1", filters, Default::default());
        let conv2 = nn::conv2d(p / "conv2", filters, filters, 3, mid_cfg);
        let bn2 = nn::batch_norm2d(p / "bn2", filters, Default::default());
        let conv3 = nn::conv2d(p / "conv3", filters, c_out, 1, Default::default());
        let shortcut = if conv_shortcut {
            let shortcut_cfg = nn::ConvConfig { stride, ..Default::default() };
            Some(nn::conv2d(p / "shortcut", c_in, c_out, 1, shortcut_cfg))
        } else {
            None
        };

        PreactBottleneck { preact_bn, conv1, bn1, conv2, bn2, conv3, shortcut, stride }
    }
}

impl ModuleT for PreactBottleneck {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let preact = self.preact_bn.forward_t(xs, train).relu();

        let shortcut = match &self.shortcut {
            Some(conv) => preact.apply(conv),
            None if self.stride > 1 => {
                xs.max_pool2d([1, 1], [self.stride, self.stride], [0, 0], [1, 1], false)
            }
            None => xs.shallow_clone(),
        };

        let mut ys = preact.apply(&self.conv1);
        ys = self.bn1.forward_t(&ys, train).relu();
        ys = ys.apply(&self.conv2);
        ys = self.bn2.forward_t(&ys, train).relu();
        ys = ys.apply(&self.conv3);
        ys + shortcut
    }
}

fn resnet50v2(p: &nn::Path) -> (SequentialT, i64, usize) {
    // (bottleneck width, blocks) per stage; output width is 4x.
    let stages: [(i64, usize); 4] = [
        (64, 3),
        (128, 4),
        (256, 6),
        (512, 3),
    ];

    let stem_cfg = nn::ConvConfig { stride: 2, padding: 3, ..Default::default() };
    let mut seq = nn::seq_t()
        .add(nn::conv2d(p / "0", 3, 64, 7, stem_cfg))
        .add_fn(|xs| xs.max_pool2d([3, 3], [2, 2], [1, 1], [1, 1], false));

    let mut idx = 1usize;
    let mut c_in = 64;
    for (stage, &(filters, blocks)) in stages.iter().enumerate() {
        let last_stage = stage == stages.len() - 1;
        for block in 0..blocks {
            // v2 downsamples at the end of a stage, not the start of the next.
            let stride = if block == blocks - 1 && !last_stage { 2 } else { 1 };
            let conv_shortcut = block == 0;
            let unit = PreactBottleneck::new(&(p / &idx.to_string()), c_in, filters, stride, conv_shortcut);
            seq = seq.add(unit);
            c_in = filters * 4;
            idx += 1;
        }
    }

    let post_bn = nn::batch_norm2d(p / &idx.to_string(), c_in, Default::default());
    seq = seq.add_fn_t(move |xs, train| post_bn.forward_t(xs, train).relu());
    idx += 1;

    (seq, 2048, idx)
}

fn relu6(xs: &Tensor) -> Tensor {
    xs.clamp(0.0, 6.0)
}

/// Inverted residual block: pointwise expand, depthwise, linear project.
#[derive(Debug)]
struct InvertedResidual {
    expand: Option<(Conv2D, BatchNorm)>,
    depthwise: (Conv2D, BatchNorm),
    project: (Conv2D, BatchNorm),
    use_residual: bool,
}

impl InvertedResidual {
    fn new(p: &nn::Path, c_in: i64, c_out: i64, stride: i64, expand_ratio: i64) -> Self {
        let hidden = c_in * expand_ratio;
        let pointwise = nn::ConvConfig { bias: false, ..Default::default() };

        let expand = if expand_ratio != 1 {
            let conv = nn::conv2d(&p.sub("expand"), c_in, hidden, 1, pointwise);
            let bn = nn::batch_norm2d(&p.sub("expand").sub("bn"), hidden, Default::default());
            Some((conv, bn))
        } else {
            None
        };

        let dw_cfg = nn::ConvConfig {
            stride,
            padding: 1,
            groups: hidden,
            bias: false,
            ..Default::default()
        };
        let depthwise = (
            nn::conv2d(&p.sub("dw"), hidden, hidden, 3, dw_cfg),
            nn::batch_norm2d(&p.sub("dw").sub("bn"), hidden, Default::default()),
        );

        let project = (
            nn::conv2d(&p.sub("project"), hidden, c_out, 1, pointwise),
            nn::batch_norm2d(&p.sub("project").sub("bn"), c_out, Default::default()),
        );

        InvertedResidual {
            expand,
            depthwise,
            project,
            use_residual: stride == 1 && c_in == c_out,
        }
    }
}

impl ModuleT for InvertedResidual {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut ys = xs.shallow_clone();
        if let Some((conv, bn)) = &self.expand {
            ys = relu6(&bn.forward_t(&ys.apply(conv), train));
        }
        let (dw_conv, dw_bn) = &self.depthwise;
        ys = relu6(&dw_bn.forward_t(&ys.apply(dw_conv), train));
        let (pr_conv, pr_bn) = &self.project;
        ys = pr_bn.forward_t(&ys.apply(pr_conv), train);

        if self.use_residual { xs + ys } else { ys }
    }
}

// (expand ratio, output channels, repeats, first stride)
const MOBILENET_BLOCKS: [(i64, i64, usize, i64); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

fn mobilenet_v2(p: &nn::Path) -> (SequentialT, i64, usize) {
    let stem_cfg = nn::ConvConfig { stride: 2, padding: 1, bias: false, ..Default::default() };
    let stem_path = p / "0";
    let stem_bn = nn::batch_norm2d(&stem_path.sub("bn"), 32, Default::default());
    let mut seq = nn::seq_t()
        .add(nn::conv2d(&stem_path, 3, 32, 3, stem_cfg))
        .add_fn_t(move |xs, train| relu6(&stem_bn.forward_t(xs, train)));

    let mut idx = 1usize;
    let mut c_in = 32;
    for &(expand_ratio, c_out, repeats, first_stride) in MOBILENET_BLOCKS.iter() {
        for repeat in 0..repeats {
            let stride = if repeat == 0 { first_stride } else { 1 };
            let block = InvertedResidual::new(&(p / &idx.to_string()), c_in, c_out, stride, expand_ratio);
            seq = seq.add(block);
            c_in = c_out;
            idx += 1;
        }
    }

    let top_cfg = nn::ConvConfig { bias: false, ..Default::default() };
    let top_path = p / &idx.to_string();
    let top_bn = nn::batch_norm2d(&top_path.sub("bn"), 1280, Default::default());
    let top_conv = nn::conv2d(&top_path, c_in, 1280, 1, top_cfg);
    seq = seq.add_fn_t(move |xs, train| relu6(&top_bn.forward_t(&xs.apply(&top_conv), train)));
    idx += 1;

    (seq, 1280, idx)
}

/// Force `requires_grad = false` on every variable of the base namespace.
/// Returns how many variables were touched.
pub fn freeze_base(vs: &nn::VarStore) -> usize {
    let mut frozen = 0usize;
    for (name, var) in vs.variables().iter() {
        if layer_index(name).is_some() {
            let _ = var.set_requires_grad(false);
            frozen += 1;
        }
    }
    frozen
}

/// Mark every base layer at or after `from_layer` trainable again. Layers
/// before the index keep whatever state they had. Returns how many
/// variables were unfrozen.
pub fn unfreeze_from(vs: &nn::VarStore, from_layer: usize) -> usize {
    let mut unfrozen = 0usize;
    for (name, var) in vs.variables().iter() {
        if is_running_stat(name) {
            continue;
        }
        match layer_index(name) {
            Some(layer) if layer >= from_layer => {
                let _ = var.set_requires_grad(true);
                unfrozen += 1;
            }
            _ => {}
        }
    }
    unfrozen
}

/// Batch-norm running statistics are updated by the forward pass, never by
/// the optimizer; they must not be flipped to trainable.
fn is_running_stat(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}

/// Top-level layer index of a base variable, `None` for anything outside
/// the base namespace. Variable names look like `base.7.conv1.weight`.
pub fn layer_index(name: &str) -> Option<usize> {
    name.strip_prefix(BASE_SCOPE)?
        .strip_prefix('.')?
        .split('.')
        .next()?
        .parse()
        .ok()
}

/// Number of trainable scalars under a name prefix.
pub fn trainable_parameters(vs: &nn::VarStore, prefix: &str) -> i64 {
    vs.variables()
        .iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .filter(|(_, var)| var.requires_grad())
        .map(|(_, var)| var.size().iter().product::<i64>())
        .sum()
}
