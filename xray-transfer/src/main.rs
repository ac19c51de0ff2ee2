use std::{ env, path::PathBuf, sync::{ mpsc, Arc, Mutex }, thread };

use color_eyre::eyre::Result;
use tracing::{ error, info, warn };
use ui::{ editor::Monitor, state::TrainingSnapshot, ui::{ App, AppState } };

mod backbone;
mod callbacks;
mod data;
mod device;
mod error;
mod inference;
mod metrics;
mod model;
mod train;

use backbone::Backbone;
use callbacks::CallbackConfig;
use data::{ Dataset, Loader };
use model::{ Activation, Classifier, ClassifierConfig };
use train::TrainConfig;

const SEED: i64 = 123;
const INPUT_RESOLUTION: (i64, i64) = (224, 224);
const HEAD_LEARNING_RATE: f64 = 1e-3;
const FINE_TUNE_LEARNING_RATE: f64 = 1e-5;

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt().with_writer(std::io::stderr).compact().init();

    let (tx, rx) = mpsc::channel();
    let snapshot = Arc::new(Mutex::new(TrainingSnapshot::default()));

    let monitor = Monitor { rx, snapshot: Arc::clone(&snapshot) };
    thread::spawn(move || {
        monitor.listen_and_update();
    });

    thread::spawn(move || {
        if let Err(err) = run_training(tx) {
            error!("training failed: {err}");
        }
    });

    let terminal = ratatui::init();
    let app = App { state: AppState::default(), snapshot: Arc::clone(&snapshot) };
    let app_result = app.run(terminal);
    ratatui::restore();
    app_result
}

fn run_training(tx: mpsc::Sender<TrainingSnapshot>) -> error::Result<()> {
    let device = device::setup(SEED);

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let project_dir = PathBuf::from(manifest_dir);

    let dataset_train = Dataset::new(project_dir.join("data/train"))?;
    let dataset_val = Dataset::new(project_dir.join("data/val"))?;

    let train_cfg = TrainConfig::default();
    let mut train_loader = Loader::new(
        dataset_train,
        train_cfg.batch_size,
        device,
        true,
        true,
        INPUT_RESOLUTION
    );
    let mut val_loader = Loader::new(
        dataset_val,
        train_cfg.batch_size,
        device,
        false,
        false,
        INPUT_RESOLUTION
    );

    let num_classes = train_loader.num_classes();
    if val_loader.num_classes() != num_classes {
        return Err(
            error::Error::Training(format!(
                "class mismatch: {} train classes, {} val classes",
                num_classes,
                val_loader.num_classes()
            ))
        );
    }
    info!(
        "loaded {} train / {} val images across {num_classes} classes",
        train_loader.len(),
        val_loader.len()
    );

    let weights = project_dir.join("weights/resnet50v2_imagenet.ot");
    let pretrained_weights = weights.exists().then(|| weights.clone());
    if pretrained_weights.is_none() {
        warn!(
            "no pretrained weights at {}, the backbone starts from random init",
            weights.display()
        );
    }

    let classifier_cfg = ClassifierConfig {
        backbone: Backbone::ResNet50V2,
        num_classes,
        activation: Activation::Sigmoid,
        learning_rate: HEAD_LEARNING_RATE,
        input_shape: (3, INPUT_RESOLUTION.0, INPUT_RESOLUTION.1),
        freeze_base: true,
        pretrained_weights,
    };
    let mut classifier = Classifier::build_binary(classifier_cfg.clone(), device)?;
    let callback_cfg = CallbackConfig::default();

    // stage one: train the fresh head on the frozen backbone
    let history = train::fit(
        &mut classifier,
        &mut train_loader,
        &mut val_loader,
        &train_cfg,
        &callback_cfg,
        Some(&tx)
    )?;
    history.save_json(&project_dir.join("weights/history_head.json"))?;
    info!(
        "head stage: {} epochs, final val_loss {:?}",
        history.num_epochs(),
        history.last("val_loss")
    );

    // stage two: unfreeze the last backbone stage and continue much slower
    let fine_tune_at = classifier.base_layers().saturating_sub(5);
    classifier.fine_tune(fine_tune_at, FINE_TUNE_LEARNING_RATE)?;

    let history = train::fit(
        &mut classifier,
        &mut train_loader,
        &mut val_loader,
        &train_cfg,
        &callback_cfg,
        Some(&tx)
    )?;
    history.save_json(&project_dir.join("weights/history_finetune.json"))?;
    info!(
        "fine-tune stage: {} epochs, final val_loss {:?}",
        history.num_epochs(),
        history.last("val_loss")
    );

    info!("training complete, best weights at {}", callback_cfg.checkpoint.path.display());

    let sample = project_dir.join("data/sample.png");
    if sample.exists() {
        let class = inference::classify(
            &classifier_cfg,
            &callback_cfg.checkpoint.path,
            &sample,
            device
        )?;
        info!("sample prediction for {}: class {class}", sample.display());
    }

    Ok(())
}
