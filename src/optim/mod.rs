//! Optimizers and the wrappers layered on top of them
//!
//! Every optimizer implements [`Optimizer`]: gradients are computed as a list of
//! `(gradient, variable)` pairs which can be inspected or transformed (clipped,
//! averaged across devices, accumulated over minibatches) before being applied.

use std::collections::HashMap;

use ndarray::ArrayD;
use thiserror::Error;

use crate::{
    graph::{GlobalStep, Graph, Variable},
    tensor::TensorError,
    values::Value,
};

pub mod clip;
pub mod minibatch;

pub use clip::ClipOptimizer;
pub use minibatch::{AggregationMethod, GradientSlot, MiniBatchFlag, MinibatchOptimizer};

/// Dense gradient of a variable, same shape as the variable
pub type Gradient = ArrayD<f32>;

/// A gradient paired with its variable, `None` when the variable does not affect the loss
pub type GradAndVar = (Option<Gradient>, Variable);

/// Errors for optimizers
#[derive(Debug, Error, PartialEq)]
pub enum OptimError {
    #[error("The scope name, {0}, you specified does not contain any trainable variables")]
    EmptyScope(String),
    #[error("No gradients provided for any variable")]
    NoGradients,
    #[error("Gradients have to be computed before they can be accumulated")]
    VarListNotEstablished,
    #[error("Expected {expected} gradients, got {got}")]
    GradientCountMismatch { expected: usize, got: usize },
    #[error("Gradient for '{got}' given where '{expected}' was expected")]
    VariableMismatch { expected: String, got: String },
    #[error("The number of minibatches must be at least 1")]
    ZeroMinibatches,
    #[error("Device {device} produced {got} gradients, expected {expected}")]
    TowerLengthMismatch {
        device: usize,
        expected: usize,
        got: usize,
    },
    #[error("Unsupported aggregation method: {0}")]
    UnsupportedAggregation(String),
    #[error("Gradient for '{var}' has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        var: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Common interface for optimizers
pub trait Optimizer {
    /// Gradients of `loss` with respect to each variable of `var_list`, in order.
    /// All trainable variables of `graph` are used when no list is given.
    fn compute_gradients(
        &mut self,
        graph: &Graph,
        loss: &Value,
        var_list: Option<&[Variable]>,
    ) -> Result<Vec<GradAndVar>, OptimError> {
        let var_list = match var_list {
            Some(vars) => vars.to_vec(),
            None => graph.trainable_variables(None),
        };
        Ok(gradients(loss, &var_list))
    }

    /// Updates the variables from their gradients. Pairs without a gradient are skipped.
    fn apply_gradients(
        &mut self,
        grads_and_vars: &[GradAndVar],
        global_step: Option<&GlobalStep>,
    ) -> Result<(), OptimError>;
}

/// Backpropagates `loss` and reads the gradient of every variable.
/// Variables the loss does not depend on get `None` rather than a zero gradient.
pub fn gradients(loss: &Value, var_list: &[Variable]) -> Vec<GradAndVar> {
    loss.zero_grad();
    loss.backward();
    let reachable = loss.reachable_ids();
    var_list
        .iter()
        .map(|var| {
            let related = var
                .tensor()
                .values()
                .iter()
                .any(|v| reachable.contains(&v.id()));
            let grad = related.then(|| var.tensor().grad_array());
            (grad, var.clone())
        })
        .collect()
}

/// Checks that a gradient can be applied to `var`
pub(crate) fn check_shape(grad: &Gradient, var: &Variable) -> Result<(), OptimError> {
    if grad.shape() != var.shape() {
        return Err(OptimError::ShapeMismatch {
            var: var.name().to_string(),
            expected: var.shape().to_vec(),
            got: grad.shape().to_vec(),
        });
    }
    Ok(())
}

/// SGD with momentum, a momentum of 0 gives plain gradient descent
pub struct MomentumOptimizer {
    // currently does not change the learning rate based on the iteration
    learning_rate: f32,
    momentum: f32,
    // velocity per variable name
    velocity: HashMap<String, ArrayD<f32>>,
}

impl MomentumOptimizer {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: HashMap::new(),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    #[cfg(test)]
    fn velocity(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.velocity.get(name)
    }
}

impl Optimizer for MomentumOptimizer {
    fn apply_gradients(
        &mut self,
        grads_and_vars: &[GradAndVar],
        global_step: Option<&GlobalStep>,
    ) -> Result<(), OptimError> {
        let present = grads_and_vars
            .iter()
            .filter_map(|(grad, var)| grad.as_ref().map(|g| (g, var)))
            .collect::<Vec<_>>();
        if present.is_empty() {
            return Err(OptimError::NoGradients);
        }
        for (grad, var) in present.iter() {
            check_shape(grad, var)?;
        }
        for (grad, var) in present {
            let velocity = self
                .velocity
                .entry(var.name().to_string())
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            // v = momentum * v - lr * g, var += v
            velocity.zip_mut_with(grad, |v, g| {
                *v = self.momentum * *v - self.learning_rate * g;
            });
            let updated = var.to_array() + &*velocity;
            var.assign(&updated)?;
        }
        if let Some(step) = global_step {
            step.increment();
        }
        log::debug!(
            "applied gradients to {} variables (step {})",
            grads_and_vars.len(),
            global_step.map(GlobalStep::get).unwrap_or_default()
        );
        Ok(())
    }
}
