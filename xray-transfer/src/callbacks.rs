//! Monitoring callbacks for the training loop.
//!
//! The three trackers watch validation loss and are plain state machines so
//! the trainer stays in charge of the side effects (saving weights,
//! touching the optimizer, stopping). Each run gets its own set built from
//! an explicit `CallbackConfig`; nothing here is process-wide.

use std::path::PathBuf;

use serde::{ Deserialize, Serialize };

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Weights-only artifact, overwritten whenever validation loss improves.
    pub path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig { path: PathBuf::from("weights/xray_class.best.ot") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    pub patience: usize,
    pub min_delta: f64,
    pub restore_best_weights: bool,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        EarlyStoppingConfig { patience: 5, min_delta: 1e-4, restore_best_weights: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceLrConfig {
    pub factor: f64,
    pub patience: usize,
    pub min_delta: f64,
    pub min_lr: f64,
    pub cooldown: usize,
}

impl Default for ReduceLrConfig {
    fn default() -> Self {
        ReduceLrConfig { factor: 0.5, patience: 2, min_delta: 1e-4, min_lr: 1e-6, cooldown: 1 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallbackConfig {
    pub checkpoint: CheckpointConfig,
    pub early_stopping: EarlyStoppingConfig,
    pub reduce_lr: ReduceLrConfig,
}

/// Remembers the best validation loss and says when to overwrite the
/// checkpoint.
#[derive(Debug)]
pub struct CheckpointTracker {
    best: f64,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        CheckpointTracker { best: f64::INFINITY }
    }

    pub fn should_save(&mut self, val_loss: f64) -> bool {
        if val_loss < self.best {
            self.best = val_loss;
            true
        } else {
            false
        }
    }
}

/// Signals a stop after `patience` epochs without improvement.
#[derive(Debug)]
pub struct EarlyStopper {
    best: f64,
    wait: usize,
    patience: usize,
    min_delta: f64,
}

impl EarlyStopper {
    pub fn new(cfg: &EarlyStoppingConfig) -> Self {
        EarlyStopper {
            best: f64::INFINITY,
            wait: 0,
            patience: cfg.patience,
            min_delta: cfg.min_delta,
        }
    }

    pub fn should_stop(&mut self, val_loss: f64) -> bool {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.wait = 0;
            false
        } else {
            self.wait += 1;
            self.wait >= self.patience
        }
    }
}

/// Multiplies the learning rate by `factor` after `patience` flat epochs,
/// never below `min_lr`, then sits out `cooldown` epochs before counting
/// again.
#[derive(Debug)]
pub struct PlateauReducer {
    best: f64,
    wait: usize,
    cooldown_left: usize,
    lr: f64,
    cfg: ReduceLrConfig,
}

impl PlateauReducer {
    pub fn new(cfg: &ReduceLrConfig, initial_lr: f64) -> Self {
        PlateauReducer {
            best: f64::INFINITY,
            wait: 0,
            cooldown_left: 0,
            lr: initial_lr,
            cfg: cfg.clone(),
        }
    }

    /// Feed one epoch's validation loss; `Some(new_lr)` when a reduction
    /// fired this epoch.
    pub fn step(&mut self, val_loss: f64) -> Option<f64> {
        if self.cooldown_left > 0 {
            self.cooldown_left -= 1;
            self.wait = 0;
        }

        if val_loss < self.best - self.cfg.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return None;
        }

        if self.cooldown_left > 0 {
            return None;
        }

        self.wait += 1;
        if self.wait < self.cfg.patience {
            return None;
        }

        self.wait = 0;
        self.cooldown_left = self.cfg.cooldown;
        let reduced = (self.lr * self.cfg.factor).max(self.cfg.min_lr);
        if reduced < self.lr {
            self.lr = reduced;
            Some(reduced)
        } else {
            None
        }
    }
}

/// What the trainer should do after an epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochDecision {
    pub save_checkpoint: bool,
    pub stop: bool,
    pub new_lr: Option<f64>,
}

/// One training run's callback state, built fresh from the config.
pub struct CallbackSet {
    pub checkpoint_path: PathBuf,
    pub restore_best: bool,
    checkpoint: CheckpointTracker,
    early: EarlyStopper,
    reduce: PlateauReducer,
}

impl CallbackSet {
    pub fn new(cfg: &CallbackConfig, initial_lr: f64) -> Self {
        CallbackSet {
            checkpoint_path: cfg.checkpoint.path.clone(),
            restore_best: cfg.early_stopping.restore_best_weights,
            checkpoint: CheckpointTracker::new(),
            early: EarlyStopper::new(&cfg.early_stopping),
            reduce: PlateauReducer::new(&cfg.reduce_lr, initial_lr),
        }
    }

    pub fn after_epoch(&mut self, val_loss: f64) -> EpochDecision {
        EpochDecision {
            save_checkpoint: self.checkpoint.should_save(val_loss),
            stop: self.early.should_stop(val_loss),
            new_lr: self.reduce.step(val_loss),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_saves_first_epoch_only_when_loss_worsens() {
        let mut tracker = CheckpointTracker::new();
        assert!(tracker.should_save(0.5));
        assert!(!tracker.should_save(0.7));
        assert!(tracker.should_save(0.4));
    }

    #[test]
    fn test_early_stopper_patience() {
        let cfg = EarlyStoppingConfig { patience: 5, min_delta: 1e-4, restore_best_weights: true };
        let mut stopper = EarlyStopper::new(&cfg);

        assert!(!stopper.should_stop(1.0));
        for flat in 0..4 {
            assert!(!stopper.should_stop(1.0), "no stop after {} flat epochs", flat + 1);
        }
        assert!(stopper.should_stop(1.0));
    }

    #[test]
    fn test_early_stopper_min_delta() {
        let cfg = EarlyStoppingConfig { patience: 2, min_delta: 1e-4, restore_best_weights: true };
        let mut stopper = EarlyStopper::new(&cfg);

        assert!(!stopper.should_stop(1.0));
        // a hair better than best is not an improvement under min_delta
        assert!(!stopper.should_stop(1.0 - 1e-5));
        assert!(stopper.should_stop(1.0 - 2e-5));
    }

    #[test]
    fn test_plateau_reducer_halves_after_patience() {
        let cfg = ReduceLrConfig { factor: 0.5, patience: 2, min_delta: 1e-4, min_lr: 1e-6, cooldown: 0 };
        let mut reducer = PlateauReducer::new(&cfg, 1e-3);

        assert_eq!(reducer.step(1.0), None);
        assert_eq!(reducer.step(1.0), None);
        assert_eq!(reducer.step(1.0), Some(5e-4));
    }

    #[test]
    fn test_plateau_reducer_cooldown() {
        let cfg = ReduceLrConfig { factor: 0.5, patience: 2, min_delta: 1e-4, min_lr: 1e-6, cooldown: 1 };
        let mut reducer = PlateauReducer::new(&cfg, 1e-3);

        assert_eq!(reducer.step(1.0), None);
        assert_eq!(reducer.step(1.0), None);
        assert_eq!(reducer.step(1.0), Some(5e-4));
        // cooldown epoch resets the wait counter before counting resumes
        assert_eq!(reducer.step(1.0), None);
        assert_eq!(reducer.step(1.0), Some(2.5e-4));
    }

    #[test]
    fn test_plateau_reducer_floor() {
        let cfg = ReduceLrConfig { factor: 0.5, patience: 1, min_delta: 1e-4, min_lr: 1e-6, cooldown: 0 };
        let mut reducer = PlateauReducer::new(&cfg, 2e-6);

        assert_eq!(reducer.step(1.0), None);
        assert_eq!(reducer.step(1.0), Some(1e-6));
        // already at the floor: no further reductions are reported
        assert_eq!(reducer.step(1.0), None);
        assert_eq!(reducer.step(1.0), None);
    }

    #[test]
    fn test_callback_set_improve_then_worsen_keeps_first_checkpoint() {
        let mut set = CallbackSet::new(&CallbackConfig::default(), 1e-3);

        let first = set.after_epoch(0.6);
        assert!(first.save_checkpoint);

        let second = set.after_epoch(0.9);
        assert!(!second.save_checkpoint);
        assert!(!second.stop);
    }
}
