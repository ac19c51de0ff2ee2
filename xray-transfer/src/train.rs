use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::mpsc::Sender;

use serde::{ Deserialize, Serialize };
use tch::{ Device, Tensor };
use tracing::{ info, warn };
use ui::state::{ CurveSeries, TrainingSnapshot };

use crate::backbone::trainable_parameters;
use crate::callbacks::{ CallbackConfig, CallbackSet };
use crate::data::Loader;
use crate::error::{ Error, Result };
use crate::metrics;
use crate::model::{ Activation, Classifier };

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub num_epochs: usize,
    pub batch_size: i64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig { num_epochs: 20, batch_size: 32 }
    }
}

/// Per-epoch metric series keyed by name. `loss` and `val_loss` are always
/// present; the rest follow the compiled metric set.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct History {
    series: BTreeMap<String, Vec<f64>>,
}

impl History {
    pub fn record(&mut self, name: &str, value: f64) {
        self.series.entry(name.to_string()).or_default().push(value);
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.series.get(name).map(|values| values.as_slice())
    }

    pub fn last(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|values| values.last().copied())
    }

    pub fn num_epochs(&self) -> usize {
        self.get("loss").map(|values| values.len()).unwrap_or(0)
    }

    /// `(epoch, value)` points for the charts, epochs counted from 1.
    pub fn chart_series(&self, name: &str) -> Vec<(f64, f64)> {
        self.get(name)
            .map(|values| {
                values
                    .iter()
                    .enumerate()
                    .map(|(epoch, value)| ((epoch + 1) as f64, *value))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

/// Run the managed training loop.
///
/// Each epoch: one shuffled pass over the training loader, a no-grad pass
/// over the validation loader, metric computation over the collected
/// outputs, then the callback decisions (checkpoint, LR reduction, early
/// stop with best-weights restore). Progress streams to `monitor` when one
/// is given.
pub fn fit(
    classifier: &mut Classifier,
    train_loader: &mut Loader,
    val_loader: &mut Loader,
    cfg: &TrainConfig,
    callback_cfg: &CallbackConfig,
    monitor: Option<&Sender<TrainingSnapshot>>
) -> Result<History> {
    if train_loader.is_empty() || val_loader.is_empty() {
        return Err(Error::Training("empty data provider".to_string()));
    }

    let mut callbacks = CallbackSet::new(callback_cfg, classifier.learning_rate());
    let steps_per_epoch = train_loader.len_batch();
    let validation_steps = val_loader.len_batch();
    let mut history = History::default();

    let mut snapshot = TrainingSnapshot::default();
    snapshot.progress.max_epoch = cfg.num_epochs as u16;
    snapshot.progress.batch_size = cfg.batch_size as u16;
    snapshot.progress.max_batch = steps_per_epoch as u16;
    snapshot.classes = train_loader.classes();
    send(monitor, &snapshot);

    info!(
        "training for {} epochs ({steps_per_epoch} train batches, {validation_steps} val batches)",
        cfg.num_epochs
    );
    info!(
        "compiled metrics {:?}, {} trainable parameters",
        classifier.metric_names(),
        trainable_parameters(classifier.var_store(), "")
    );

    for epoch in 1..=cfg.num_epochs {
        snapshot.progress.current_epoch = epoch as u16;
        snapshot.progress.current_batch = 0;

        let mut running_loss = 0.0;
        let mut steps = 0usize;
        let mut epoch_outputs: Vec<Tensor> = Vec::new();
        let mut epoch_targets: Vec<Tensor> = Vec::new();

        for (step, (images, labels)) in train_loader.by_ref().enumerate() {
            let output = classifier.forward(&images, true);
            let loss = classifier.loss(&output, &labels);
            classifier.optimizer_mut().backward_step(&loss);

            running_loss += loss.double_value(&[]);
            steps += 1;
            epoch_outputs.push(output.detach().to_device(Device::Cpu));
            epoch_targets.push(target_tensor(classifier, &labels));

            snapshot.progress.current_batch = (step + 1) as u16;
            send(monitor, &snapshot);
        }

        if steps == 0 {
            return Err(Error::Training("training loader produced no batches".to_string()));
        }

        let train_loss = running_loss / (steps as f64);
        let outputs = Tensor::cat(&epoch_outputs, 0);
        let targets = Tensor::cat(&epoch_targets, 0);
        let train_metrics = metrics::compute_set(classifier.activation(), &outputs, &targets)?;

        let (val_loss, val_outputs, val_targets) = validate(classifier, val_loader)?;
        let val_metrics = metrics::compute_set(classifier.activation(), &val_outputs, &val_targets)?;

        history.record("loss", train_loss);
        history.record("val_loss", val_loss);
        for (name, value) in &train_metrics {
            history.record(name, *value);
        }
        for (name, value) in &val_metrics {
            history.record(&format!("val_{name}"), *value);
        }

        info!("epoch {epoch}/{}: loss {train_loss:.4} | val_loss {val_loss:.4}", cfg.num_epochs);

        let decision = callbacks.after_epoch(val_loss);
        if decision.save_checkpoint {
            if let Some(parent) = callbacks.checkpoint_path.parent() {
                fs::create_dir_all(parent)?;
            }
            classifier.save_weights(&callbacks.checkpoint_path)?;
            info!("epoch {epoch}: val_loss improved, checkpoint saved");
            snapshot.events.push((format!("epoch {epoch} checkpoint"), format!("{val_loss:.4}")));
        }
        if let Some(lr) = decision.new_lr {
            classifier.set_learning_rate(lr);
            info!("epoch {epoch}: learning rate reduced to {lr:.6}");
            snapshot.events.push((format!("epoch {epoch} reduce lr"), format!("{lr:.6}")));
        }

        snapshot.loss = CurveSeries {
            train: history.chart_series("loss"),
            val: history.chart_series("val_loss"),
        };
        snapshot.auc = CurveSeries {
            train: history.chart_series("auc"),
            val: history.chart_series("val_auc"),
        };
        snapshot.events.push((
            format!("epoch {epoch}"),
            format!("loss {train_loss:.4} val {val_loss:.4}"),
        ));
        send(monitor, &snapshot);

        if decision.stop {
            warn!("epoch {epoch}: early stopping, validation loss stopped improving");
            if callbacks.restore_best && callbacks.checkpoint_path.exists() {
                classifier.load_weights(&callbacks.checkpoint_path)?;
                info!("restored best weights from {}", callbacks.checkpoint_path.display());
            }
            snapshot.events.push((format!("epoch {epoch}"), "early stop".to_string()));
            send(monitor, &snapshot);
            break;
        }
    }

    Ok(history)
}

fn validate(classifier: &Classifier, loader: &mut Loader) -> Result<(f64, Tensor, Tensor)> {
    let mut running_loss = 0.0;
    let mut steps = 0usize;
    let mut outputs: Vec<Tensor> = Vec::new();
    let mut targets: Vec<Tensor> = Vec::new();

    for (images, labels) in loader.by_ref() {
        let output = tch::no_grad(|| classifier.forward(&images, false));
        let loss = classifier.loss(&output, &labels);

        running_loss += loss.double_value(&[]);
        steps += 1;
        outputs.push(output.to_device(Device::Cpu));
        targets.push(target_tensor(classifier, &labels));
    }

    if steps == 0 {
        return Err(Error::Training("validation loader produced no batches".to_string()));
    }

    Ok((running_loss / (steps as f64), Tensor::cat(&outputs, 0), Tensor::cat(&targets, 0)))
}

/// Metric targets live on the CPU: class indices for softmax, the multi-hot
/// expansion for sigmoid.
fn target_tensor(classifier: &Classifier, labels: &Tensor) -> Tensor {
    match classifier.activation() {
        Activation::Softmax => labels.to_device(Device::Cpu),
        Activation::Sigmoid => classifier.multi_hot(labels).to_device(Device::Cpu),
    }
}

fn send(monitor: Option<&Sender<TrainingSnapshot>>, snapshot: &TrainingSnapshot) {
    if let Some(tx) = monitor {
        let _ = tx.send(snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::Backbone;
    use crate::callbacks::{ CheckpointConfig, ReduceLrConfig };
    use crate::data::Dataset;
    use crate::model::ClassifierConfig;
    use std::path::PathBuf;

    #[test]
    fn test_history_records_per_epoch() {
        let mut history = History::default();
        history.record("loss", 0.9);
        history.record("loss", 0.7);
        history.record("val_loss", 0.8);

        assert_eq!(history.get("loss"), Some(&[0.9, 0.7][..]));
        assert_eq!(history.num_epochs(), 2);
        assert_eq!(history.last("val_loss"), Some(0.8));
        assert!(history.get("auc").is_none());
    }

    #[test]
    fn test_history_chart_series_is_one_based() {
        let mut history = History::default();
        history.record("loss", 0.9);
        history.record("loss", 0.7);

        assert_eq!(history.chart_series("loss"), vec![(1.0, 0.9), (2.0, 0.7)]);
        assert!(history.chart_series("missing").is_empty());
    }

    fn fixture_dataset(root: &PathBuf) -> Dataset {
        use std::fs;
        let _ = fs::remove_dir_all(root);
        for (class, value) in [("effusion", 30u8), ("normal", 220u8)] {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..4 {
                let pixel = image::Rgb([value, value.saturating_add(i * 5), value]);
                image::RgbImage::from_pixel(64, 64, pixel)
                    .save(dir.join(format!("{i}.png")))
                    .unwrap();
            }
        }
        Dataset::new(root).unwrap()
    }

    #[test]
    fn test_fit_records_history_and_checkpoint() {
        tch::manual_seed(7);
        let root = std::env::temp_dir().join("xray_transfer_fit_test");
        let checkpoint = root.join("weights/best.ot");

        let train = fixture_dataset(&root.join("train"));
        let val = fixture_dataset(&root.join("val"));
        let mut train_loader = Loader::new(train, 4, Device::Cpu, true, false, (64, 64));
        let mut val_loader = Loader::new(val, 4, Device::Cpu, false, false, (64, 64));

        let mut classifier = Classifier::build(
            &ClassifierConfig {
                backbone: Backbone::MobileNetV2,
                num_classes: 2,
                activation: Activation::Sigmoid,
                learning_rate: 1e-3,
                input_shape: (3, 64, 64),
                freeze_base: true,
                pretrained_weights: None,
            },
            Device::Cpu
        ).unwrap();

        let callback_cfg = CallbackConfig {
            checkpoint: CheckpointConfig { path: checkpoint.clone() },
            reduce_lr: ReduceLrConfig { min_lr: 1e-6, ..Default::default() },
            ..Default::default()
        };
        let train_cfg = TrainConfig { num_epochs: 2, batch_size: 4 };

        let history = fit(
            &mut classifier,
            &mut train_loader,
            &mut val_loader,
            &train_cfg,
            &callback_cfg,
            None
        ).unwrap();

        assert_eq!(history.num_epochs(), 2);
        for name in ["loss", "val_loss", "auc", "val_auc", "mae", "false_positives"] {
            assert_eq!(history.get(name).map(|v| v.len()), Some(2), "missing series {name}");
        }
        // first epoch always improves on infinity, so the artifact exists
        assert!(checkpoint.exists());
    }
}
