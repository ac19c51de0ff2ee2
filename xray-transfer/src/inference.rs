use std::path::Path;

use tch::Device;

use crate::data;
use crate::error::Result;
use crate::model::{ Classifier, ClassifierConfig };

/// Rebuild the graph, load the best-checkpoint weights and classify one
/// image. Returns the predicted class index.
pub fn classify(
    cfg: &ClassifierConfig,
    checkpoint: &Path,
    image_path: &Path,
    device: Device
) -> Result<i64> {
    let mut config = cfg.clone();
    config.pretrained_weights = None;

    let mut classifier = Classifier::build(&config, device)?;
    classifier.load_weights(checkpoint)?;

    let (_, height, width) = config.input_shape;
    let image = data::load_image(image_path, (height, width), false)?.unsqueeze(0).to_device(device);

    let output = tch::no_grad(|| classifier.forward(&image, false));
    let prediction = output.argmax(-1, false);
    Ok(prediction.int64_value(&[0]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::Backbone;
    use crate::model::Activation;
    use std::fs;

    #[test]
    fn test_classify_round_trips_checkpoint() {
        tch::manual_seed(11);
        let root = std::env::temp_dir().join("xray_transfer_inference_test");
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();

        let cfg = ClassifierConfig {
            backbone: Backbone::MobileNetV2,
            num_classes: 3,
            activation: Activation::Softmax,
            learning_rate: 1e-3,
            input_shape: (3, 64, 64),
            freeze_base: false,
            pretrained_weights: None,
        };

        let classifier = Classifier::build(&cfg, Device::Cpu).unwrap();
        let checkpoint = root.join("best.ot");
        classifier.save_weights(&checkpoint).unwrap();

        let image_path = root.join("sample.png");
        image::RgbImage
            ::from_pixel(64, 64, image::Rgb([90, 120, 90]))
            .save(&image_path)
            .unwrap();

        let class = classify(&cfg, &checkpoint, &image_path, Device::Cpu).unwrap();
        assert!((0..3).contains(&class));
    }
}
