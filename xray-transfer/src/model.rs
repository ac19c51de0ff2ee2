use std::path::{ Path as FsPath, PathBuf };

use tch::nn::{ self, ModuleT, Optimizer, OptimizerConfig, SequentialT, VarStore };
use tch::{ Device, Kind, Reduction, Tensor };
use tracing::info;

use crate::backbone::{ self, Backbone };
use crate::error::Result;

/// Head activation. Picking one fixes the loss and the metric set; there is
/// no other combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Categorical cross-entropy, `accuracy`.
    Softmax,
    /// Binary cross-entropy, the five-metric set.
    Sigmoid,
}

impl Activation {
    pub fn metric_names(&self) -> &'static [&'static str] {
        match self {
            Activation::Softmax => &["accuracy"],
            Activation::Sigmoid =>
                &["mae", "auc", "binary_accuracy", "false_negatives", "false_positives"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub backbone: Backbone,
    pub num_classes: i64,
    pub activation: Activation,
    pub learning_rate: f64,
    /// (channels, height, width)
    pub input_shape: (i64, i64, i64),
    pub freeze_base: bool,
    /// Weights exported from the published image-classification pretraining
    /// run; `None` leaves the backbone randomly initialized.
    pub pretrained_weights: Option<PathBuf>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            backbone: Backbone::ResNet50V2,
            num_classes: 15,
            activation: Activation::Softmax,
            learning_rate: 0.01,
            input_shape: (3, 224, 224),
            freeze_base: false,
            pretrained_weights: None,
        }
    }
}

/// Backbone plus a fresh dense head, compiled with Adam and ready to fit.
/// Unfreezing and recompiling mutate this object in place.
pub struct Classifier {
    vs: VarStore,
    net: SequentialT,
    activation: Activation,
    num_classes: i64,
    learning_rate: f64,
    optimizer: Optimizer,
    base_layers: usize,
}

impl Classifier {
    /// Build the backbone, load pretrained weights if given, optionally
    /// freeze the base, flatten its output into a dense head and compile.
    ///
    /// The weights load happens while the store holds base variables only,
    /// so a backbone-only export matches exactly; the head is created after.
    pub fn build(cfg: &ClassifierConfig, device: Device) -> Result<Self> {
        let mut vs = VarStore::new(device);
        let base = cfg.backbone.build(&(vs.root() / backbone::BASE_SCOPE));

        if let Some(weights) = &cfg.pretrained_weights {
            info!("loading pretrained {} weights from {}", cfg.backbone.name(), weights.display());
            vs.load(weights)?;
        }
        if cfg.freeze_base {
            let frozen = backbone::freeze_base(&vs);
            info!("froze {frozen} base variables");
        }

        let (c, h, w) = cfg.input_shape;
        let flat_dim = flattened_width(&base.net, c, h, w, device);
        info!(
            "{}: {} layers, {} feature channels, flattened width {flat_dim}",
            cfg.backbone.name(),
            base.num_layers,
            base.out_channels
        );

        let head = vs.root() / "head";
        let fc = nn::linear(&head / "fc", flat_dim, cfg.num_classes, Default::default());
        let mut net = nn::seq_t().add(base.net).add_fn(|xs| xs.flat_view()).add(fc);
        if cfg.activation == Activation::Sigmoid {
            net = net.add_fn(|xs| xs.sigmoid());
        }

        let optimizer = build_adam(&vs, cfg.learning_rate)?;

        Ok(Classifier {
            vs,
            net,
            activation: cfg.activation,
            num_classes: cfg.num_classes,
            learning_rate: cfg.learning_rate,
            optimizer,
            base_layers: base.num_layers,
        })
    }

    /// Sigmoid shortcut for binary and multi-label targets.
    pub fn build_binary(mut cfg: ClassifierConfig, device: Device) -> Result<Self> {
        cfg.activation = Activation::Sigmoid;
        Self::build(&cfg, device)
    }

    /// Replace the compiled optimizer with a fresh Adam at `learning_rate`,
    /// picking up whatever the trainable set currently is.
    pub fn compile(&mut self, learning_rate: f64) -> Result<()> {
        self.learning_rate = learning_rate;
        self.optimizer = build_adam(&self.vs, learning_rate)?;
        Ok(())
    }

    /// Unfreeze every base layer at or after `from_layer` and recompile at
    /// the (typically much lower) learning rate. One-shot: repeated calls
    /// never re-freeze earlier layers.
    pub fn fine_tune(&mut self, from_layer: usize, learning_rate: f64) -> Result<usize> {
        let unfrozen = backbone::unfreeze_from(&self.vs, from_layer);
        info!("fine-tuning: unfroze {unfrozen} variables from layer {from_layer}");
        self.compile(learning_rate)?;
        Ok(unfrozen)
    }

    pub fn forward(&self, images: &Tensor, train: bool) -> Tensor {
        self.net.forward_t(images, train)
    }

    /// The activation-determined loss. Softmax heads emit logits and pair
    /// with categorical cross-entropy over class indices; sigmoid heads
    /// emit probabilities and pair with binary cross-entropy over the
    /// multi-hot expansion of the labels.
    pub fn loss(&self, output: &Tensor, labels: &Tensor) -> Tensor {
        match self.activation {
            Activation::Softmax => output.cross_entropy_for_logits(labels),
            Activation::Sigmoid =>
                output.binary_cross_entropy::<Tensor>(
                    &self.multi_hot(labels),
                    None,
                    Reduction::Mean
                ),
        }
    }

    pub fn multi_hot(&self, labels: &Tensor) -> Tensor {
        labels.one_hot(self.num_classes).to_kind(Kind::Float)
    }

    pub fn save_weights(&self, path: &FsPath) -> Result<()> {
        self.vs.save(path)?;
        Ok(())
    }

    pub fn load_weights(&mut self, path: &FsPath) -> Result<()> {
        self.vs.load(path)?;
        Ok(())
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
        self.optimizer.set_lr(learning_rate);
    }

    pub fn optimizer_mut(&mut self) -> &mut Optimizer {
        &mut self.optimizer
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn metric_names(&self) -> &'static [&'static str] {
        self.activation.metric_names()
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn base_layers(&self) -> usize {
        self.base_layers
    }

    pub fn var_store(&self) -> &VarStore {
        &self.vs
    }
}

fn build_adam(vs: &VarStore, learning_rate: f64) -> Result<Optimizer> {
    let config = nn::Adam { beta1: 0.9, beta2: 0.999, wd: 0.0, eps: 1e-7, amsgrad: true };
    Ok(config.build(vs, learning_rate)?)
}

/// Width of the flattened feature map at the configured input resolution,
/// discovered with a throwaway forward pass.
fn flattened_width(net: &SequentialT, c: i64, h: i64, w: i64, device: Device) -> i64 {
    let probe = Tensor::zeros([1, c, h, w], (Kind::Float, device));
    let out = tch::no_grad(|| net.forward_t(&probe, false));
    out.size().iter().skip(1).product()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::trainable_parameters;

    fn small_config(activation: Activation) -> ClassifierConfig {
        ClassifierConfig {
            backbone: Backbone::MobileNetV2,
            num_classes: 4,
            activation,
            learning_rate: 1e-3,
            input_shape: (3, 96, 96),
            freeze_base: true,
            pretrained_weights: None,
        }
    }

    #[test]
    fn test_metric_names_by_activation() {
        assert_eq!(Activation::Softmax.metric_names(), &["accuracy"]);
        assert_eq!(
            Activation::Sigmoid.metric_names(),
            &["mae", "auc", "binary_accuracy", "false_negatives", "false_positives"]
        );
    }

    #[test]
    fn test_frozen_base_trainable_head() {
        let classifier = Classifier::build(&small_config(Activation::Softmax), Device::Cpu).unwrap();

        assert_eq!(trainable_parameters(classifier.var_store(), "base"), 0);
        assert!(trainable_parameters(classifier.var_store(), "head") > 0);
    }

    #[test]
    fn test_sigmoid_head_emits_probabilities() {
        let classifier = Classifier::build_binary(small_config(Activation::Softmax), Device::Cpu)
            .unwrap();
        assert_eq!(classifier.activation(), Activation::Sigmoid);

        let images = Tensor::rand([2, 3, 96, 96], (Kind::Float, Device::Cpu));
        let output = tch::no_grad(|| classifier.forward(&images, false));

        assert_eq!(output.size(), vec![2, 4]);
        let max = output.max().double_value(&[]);
        let min = output.min().double_value(&[]);
        assert!((0.0..=1.0).contains(&min) && (0.0..=1.0).contains(&max));
    }

    #[test]
    fn test_fine_tune_unfreezes_tail() {
        let mut classifier = Classifier::build(&small_config(Activation::Softmax), Device::Cpu)
            .unwrap();
        assert_eq!(trainable_parameters(classifier.var_store(), "base"), 0);

        let from_layer = classifier.base_layers() - 4;
        let unfrozen = classifier.fine_tune(from_layer, 1e-5).unwrap();

        assert!(unfrozen > 0);
        assert!(trainable_parameters(classifier.var_store(), "base") > 0);
        assert!((classifier.learning_rate() - 1e-5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_multi_hot_expansion() {
        let classifier = Classifier::build_binary(small_config(Activation::Sigmoid), Device::Cpu)
            .unwrap();
        let labels = Tensor::from_slice(&[0i64, 3]);
        let expanded = classifier.multi_hot(&labels);

        assert_eq!(expanded.size(), vec![2, 4]);
        assert_eq!(expanded.double_value(&[0, 0]), 1.0);
        assert_eq!(expanded.double_value(&[1, 3]), 1.0);
        assert_eq!(expanded.double_value(&[0, 3]), 0.0);
    }
}
