use std::collections::BTreeMap;

use crate::error::TrainingError;

fn check_lengths(predictions: &[usize], labels: &[usize]) -> Result<(), TrainingError> {
    if predictions.len() != labels.len() {
        return Err(TrainingError::ValidationError(format!(
            "Got {} predictions for {} labels",
            predictions.len(),
            labels.len()
        )));
    }
    Ok(())
}

/// Fraction of correct predictions.
pub fn accuracy(predictions: &[usize], labels: &[usize]) -> Result<f32, TrainingError> {
    check_lengths(predictions, labels)?;
    if labels.is_empty() {
        return Ok(0.0);
    }
    let correct = predictions.iter().zip(labels).filter(|(p, l)| p == l).count();
    Ok(correct as f32 / labels.len() as f32)
}

/// Mean over classes of the per-class correct-prediction rate.
///
/// Every class index from 0 to the largest label weighs the same no matter how
/// many test examples it has. Classes in that range without test examples
/// count as 0.
pub fn average_class_accuracy(predictions: &[usize], labels: &[usize]) -> Result<f32, TrainingError> {
    check_lengths(predictions, labels)?;
    let mut per_class: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for (&pred, &label) in predictions.iter().zip(labels) {
        let entry = per_class.entry(label).or_default();
        entry.1 += 1;
        if pred == label {
            entry.0 += 1;
        }
    }
    let Some(&max_label) = per_class.keys().next_back() else {
        return Ok(0.0);
    };
    let sum: f32 = per_class.values().map(|&(correct, total)| correct as f32 / total as f32).sum();
    Ok(sum / (max_label + 1) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_average_accuracy_corrects_for_imbalance() {
        // class 0: 8 examples, 6 right; class 1: 2 examples, 0 right
        let labels = [0, 0, 0, 0, 0, 0, 0, 0, 1, 1];
        let predictions = [0, 0, 0, 0, 0, 0, 1, 1, 0, 0];
        assert_abs_diff_eq!(accuracy(&predictions, &labels).unwrap(), 0.6);
        assert_abs_diff_eq!(average_class_accuracy(&predictions, &labels).unwrap(), (0.75 + 0.0) / 2.0);
    }

    #[test]
    fn test_classes_absent_from_labels_count_as_zero() {
        // classes 0, 1, 3 and 4 have no examples; class 2 is half right, class 5 fully
        let labels = [2, 2, 5];
        let predictions = [2, 0, 5];
        assert_abs_diff_eq!(average_class_accuracy(&predictions, &labels).unwrap(), 1.5 / 6.0);
        assert_abs_diff_eq!(average_class_accuracy(&[], &[]).unwrap(), 0.0);
    }

    #[test]
    fn test_length_mismatch() {
        assert!(average_class_accuracy(&[0], &[0, 1]).is_err());
    }
}
