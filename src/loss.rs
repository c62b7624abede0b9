//! Loss functions, all reduced to a scalar by averaging over the batch

use crate::{
    tensor::{Tensor, TensorError, tree_sum},
    values::Value,
};

/// Mean Squared Error between two tensors of the same shape
pub fn mse_loss(pred: &Tensor, target: &Tensor) -> Result<Value, TensorError> {
    if pred.shape() != target.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: pred.shape().to_vec(),
            got: target.shape().to_vec(),
        });
    }
    let two = Value::new(2.0);
    let squares = pred
        .values()
        .iter()
        .zip(target.values().iter())
        .map(|(a, b)| (a - b).pow(&two))
        .collect::<Vec<_>>();
    Ok(tree_sum(squares) / Value::new(pred.len().max(1) as f32))
}

/// Softmax cross entropy of `[batch, classes]` logits against class indices
pub fn sparse_softmax_cross_entropy(logits: &Tensor, labels: &[usize]) -> Result<Value, TensorError> {
    let &[batch, classes] = logits.shape() else {
        return Err(TensorError::Rank {
            expected: 2,
            shape: logits.shape().to_vec(),
        });
    };
    if labels.len() != batch {
        return Err(TensorError::ShapeMismatch {
            expected: vec![batch],
            got: vec![labels.len()],
        });
    }
    let mut losses = Vec::with_capacity(batch);
    for (row, &label) in labels.iter().enumerate() {
        if label >= classes {
            return Err(TensorError::InvalidParameter {
                param: "labels",
                reason: format!("class {} out of range for {} classes", label, classes),
            });
        }
        let logits_row = &logits.values()[row * classes..(row + 1) * classes];
        // shift by the row max for stability, the shift cancels in the gradient
        let max = logits_row
            .iter()
            .map(Value::data)
            .fold(f32::NEG_INFINITY, f32::max);
        let shift = Value::new(max);
        let exp_sum = tree_sum(logits_row.iter().map(|v| (v - &shift).exp()).collect());
        let log_sum_exp = &exp_sum.ln() + &shift;
        losses.push(&log_sum_exp - &logits_row[label]);
    }
    Ok(tree_sum(losses) / Value::new(batch.max(1) as f32))
}
