use std::sync::{ Arc, Mutex };

/// One learning curve, training and validation points as (epoch, value).
#[derive(Debug, Default, Clone)]
pub struct CurveSeries {
    pub train: Vec<(f64, f64)>,
    pub val: Vec<(f64, f64)>,
}

impl CurveSeries {
    pub fn max_x(&self) -> f64 {
        self.train
            .iter()
            .chain(self.val.iter())
            .map(|(x, _)| *x)
            .fold(1.0, f64::max)
    }

    pub fn max_y(&self) -> f64 {
        self.train
            .iter()
            .chain(self.val.iter())
            .map(|(_, y)| *y)
            .fold(f64::MIN, f64::max)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Progress {
    pub current_epoch: u16,
    pub max_epoch: u16,
    pub batch_size: u16,
    pub max_batch: u16,
    pub current_batch: u16,
}

#[derive(Debug, Default, Clone)]
pub struct TrainingSnapshot {
    pub loss: CurveSeries,
    pub auc: CurveSeries,
    pub progress: Progress,
    pub classes: Vec<(String, String)>,
    pub events: Vec<(String, String)>,
}

pub type SharedSnapshot = Arc<Mutex<TrainingSnapshot>>;
