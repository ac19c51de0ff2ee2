//! Epoch metric computation.
//!
//! The framework hands us raw outputs and targets; everything reported in
//! the history is computed here. Sigmoid runs report the five-metric set
//! (MAE, multi-label AUC, thresholded binary accuracy, false negatives,
//! false positives); softmax runs report plain accuracy.

use tch::{ Kind, Tensor };

use crate::error::Result;
use crate::model::Activation;

/// Decision threshold for the binary accuracy and the error counts.
pub const BINARY_THRESHOLD: f64 = 0.65;

/// Share of rows whose argmax matches the label. `labels` holds class
/// indices.
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> f64 {
    let predictions = logits.argmax(-1, false);
    let correct = predictions
        .eq_tensor(labels)
        .to_kind(Kind::Float)
        .sum(Kind::Float)
        .double_value(&[]);
    let total = labels.size()[0] as f64;
    if total > 0.0 { correct / total } else { 0.0 }
}

pub fn mean_absolute_error(probs: &Tensor, targets: &Tensor) -> f64 {
    (probs - targets).abs().mean(Kind::Float).double_value(&[])
}

/// Element-wise accuracy of the thresholded probabilities.
pub fn binary_accuracy(probs: &Tensor, targets: &Tensor, threshold: f64) -> f64 {
    let predicted = probs.gt(threshold);
    let actual = targets.gt(0.5);
    predicted.eq_tensor(&actual).to_kind(Kind::Float).mean(Kind::Float).double_value(&[])
}

/// Positive targets the thresholded prediction missed.
pub fn false_negatives(probs: &Tensor, targets: &Tensor, threshold: f64) -> f64 {
    let predicted = probs.gt(threshold);
    let actual = targets.gt(0.5);
    actual.logical_and(&predicted.logical_not()).sum(Kind::Int64).double_value(&[])
}

/// Negative targets the thresholded prediction flagged.
pub fn false_positives(probs: &Tensor, targets: &Tensor, threshold: f64) -> f64 {
    let predicted = probs.gt(threshold);
    let actual = targets.gt(0.5);
    predicted.logical_and(&actual.logical_not()).sum(Kind::Int64).double_value(&[])
}

/// ROC AUC of one score column via average ranks (ties share their rank).
/// `None` when the column holds a single class and the curve is undefined.
fn rank_auc(scores: &[f64], positives: &[bool]) -> Option<f64> {
    let n_pos = positives.iter().filter(|p| **p).count();
    let n_neg = positives.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].partial_cmp(&scores[b]).unwrap_or(std::cmp::Ordering::Equal));

    let mut ranks = vec![0.0f64; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // 1-based ranks, averaged across the tie group
        let rank = ((i + 1 + j + 1) as f64) / 2.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }

    let rank_sum: f64 = ranks
        .iter()
        .zip(positives.iter())
        .filter(|(_, p)| **p)
        .map(|(r, _)| *r)
        .sum();
    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Some((rank_sum - (n_pos * (n_pos + 1.0)) / 2.0) / (n_pos * n_neg))
}

/// Label-wise AUC averaged over the classes that have both a positive and a
/// negative example; degenerate columns are skipped.
pub fn multi_label_auc(probs: &Tensor, targets: &Tensor) -> Result<f64> {
    let num_classes = probs.size()[1];
    let mut total = 0.0;
    let mut counted = 0usize;

    for class in 0..num_classes {
        let scores: Vec<f64> = Vec::try_from(
            probs.select(1, class).to_kind(Kind::Double).contiguous()
        )?;
        let labels: Vec<f64> = Vec::try_from(
            targets.select(1, class).to_kind(Kind::Double).contiguous()
        )?;
        let positives: Vec<bool> = labels
            .iter()
            .map(|l| *l > 0.5)
            .collect();

        if let Some(auc) = rank_auc(&scores, &positives) {
            total += auc;
            counted += 1;
        }
    }

    Ok(if counted > 0 { total / (counted as f64) } else { 0.0 })
}

/// Every metric of the compiled set, in declaration order, over one epoch's
/// collected outputs. Sigmoid targets arrive multi-hot, softmax targets as
/// class indices.
pub fn compute_set(
    activation: Activation,
    outputs: &Tensor,
    targets: &Tensor
) -> Result<Vec<(&'static str, f64)>> {
    let values = match activation {
        Activation::Softmax => vec![("accuracy", accuracy(outputs, targets))],
        Activation::Sigmoid =>
            vec![
                ("mae", mean_absolute_error(outputs, targets)),
                ("auc", multi_label_auc(outputs, targets)?),
                ("binary_accuracy", binary_accuracy(outputs, targets, BINARY_THRESHOLD)),
                ("false_negatives", false_negatives(outputs, targets, BINARY_THRESHOLD)),
                ("false_positives", false_positives(outputs, targets, BINARY_THRESHOLD))
            ],
    };
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor_2x2(values: [f64; 4]) -> Tensor {
        Tensor::from_slice(&values).reshape([2, 2]).to_kind(Kind::Float)
    }

    #[test]
    fn test_accuracy() {
        let logits = Tensor::from_slice(&[0.9f64, 0.1, 0.2, 0.8, 0.7, 0.3]).reshape([3, 2]);
        let labels = Tensor::from_slice(&[0i64, 1, 1]);
        let value = accuracy(&logits, &labels);
        assert!((value - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_mean_absolute_error() {
        let probs = tensor_2x2([0.5, 0.0, 1.0, 0.5]);
        let targets = tensor_2x2([1.0, 0.0, 1.0, 0.0]);
        let value = mean_absolute_error(&probs, &targets);
        assert!((value - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_binary_accuracy_threshold() {
        // 0.7 crosses the 0.65 threshold, 0.6 does not
        let probs = tensor_2x2([0.7, 0.6, 0.1, 0.9]);
        let targets = tensor_2x2([1.0, 1.0, 0.0, 1.0]);
        let value = binary_accuracy(&probs, &targets, BINARY_THRESHOLD);
        assert!((value - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_error_counts() {
        let probs = tensor_2x2([0.7, 0.6, 0.9, 0.1]);
        let targets = tensor_2x2([1.0, 1.0, 0.0, 0.0]);

        // missed positive: 0.6 under threshold; flagged negative: 0.9
        assert_eq!(false_negatives(&probs, &targets, BINARY_THRESHOLD), 1.0);
        assert_eq!(false_positives(&probs, &targets, BINARY_THRESHOLD), 1.0);
    }

    #[test]
    fn test_rank_auc_perfect_and_inverted() {
        let scores = [0.1, 0.4, 0.35, 0.8];
        let positives = [false, false, false, true];
        assert_eq!(rank_auc(&scores, &positives), Some(1.0));

        let positives = [true, false, false, false];
        assert_eq!(rank_auc(&scores, &positives), Some(0.0));
    }

    #[test]
    fn test_rank_auc_with_ties() {
        let scores = [0.5, 0.5, 0.5, 0.5];
        let positives = [true, false, true, false];
        // indistinguishable scores: chance-level AUC
        assert_eq!(rank_auc(&scores, &positives), Some(0.5));
    }

    #[test]
    fn test_rank_auc_degenerate() {
        let scores = [0.2, 0.9];
        assert_eq!(rank_auc(&scores, &[true, true]), None);
        assert_eq!(rank_auc(&scores, &[false, false]), None);
    }

    #[test]
    fn test_multi_label_auc_skips_single_class_column() {
        // column 0 separates perfectly; column 1 is all-negative and skipped
        let probs = tensor_2x2([0.9, 0.3, 0.1, 0.2]);
        let targets = tensor_2x2([1.0, 0.0, 0.0, 0.0]);
        let value = multi_label_auc(&probs, &targets).unwrap();
        assert!((value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_set_names_match_activation() {
        let probs = tensor_2x2([0.9, 0.3, 0.1, 0.2]);
        let targets = tensor_2x2([1.0, 0.0, 0.0, 1.0]);
        let values = compute_set(Activation::Sigmoid, &probs, &targets).unwrap();
        let names: Vec<&str> = values
            .iter()
            .map(|(name, _)| *name)
            .collect();
        assert_eq!(names, vec![
            "mae",
            "auc",
            "binary_accuracy",
            "false_negatives",
            "false_positives",
        ]);

        let logits = tensor_2x2([0.9, 0.1, 0.2, 0.8]);
        let labels = Tensor::from_slice(&[0i64, 1]);
        let values = compute_set(Activation::Softmax, &logits, &labels).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].0, "accuracy");
    }
}
