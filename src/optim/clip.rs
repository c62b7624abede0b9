//! Gradient clipping and selective training
//!
//! [`ClipOptimizer`] wraps another optimizer. Gradients are clamped to
//! [`CLIP_RANGE`] and training can be restricted to the trainable variables of
//! a few named scopes.

use crate::{
    graph::{GlobalStep, Graph, Variable},
    values::Value,
};

use super::{GradAndVar, OptimError, Optimizer};

/// Range every gradient value is clamped into
pub const CLIP_RANGE: (f32, f32) = (-1.0, 1.0);

pub struct ClipOptimizer<O> {
    optimizer: O,
    clip: bool,
    trainable_names: Option<Vec<String>>,
    var_list: Option<Vec<Variable>>,
}

impl<O: Optimizer> ClipOptimizer<O> {
    /// Clips by default and trains every trainable variable
    pub fn new(optimizer: O) -> Self {
        Self {
            optimizer,
            clip: true,
            trainable_names: None,
            var_list: None,
        }
    }

    pub fn with_clip(mut self, clip: bool) -> Self {
        self.clip = clip;
        self
    }

    /// Only variables under these scopes are trained, e.g. `["fc7", "fc8"]`
    pub fn with_trainable_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trainable_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Variables selected by the last call to `compute_gradients`
    pub fn var_list(&self) -> Option<&[Variable]> {
        self.var_list.as_deref()
    }

    pub fn inner(&self) -> &O {
        &self.optimizer
    }

    /// Trainable variables of every configured scope, in scope order
    fn scoped_variables(&self, graph: &Graph) -> Result<Option<Vec<Variable>>, OptimError> {
        let Some(names) = &self.trainable_names else {
            return Ok(None);
        };
        log::info!(
            "All trainable vars: {:?}",
            graph
                .trainable_variables(None)
                .iter()
                .map(Variable::name)
                .collect::<Vec<_>>()
        );
        let mut train_vars = vec![];
        for scope in names {
            let vars = graph.trainable_variables(Some(scope));
            if vars.is_empty() {
                return Err(OptimError::EmptyScope(scope.clone()));
            }
            train_vars.extend(vars);
        }
        log::info!(
            "Variables to be trained: {:?}",
            train_vars.iter().map(Variable::name).collect::<Vec<_>>()
        );
        Ok(Some(train_vars))
    }
}

impl<O: Optimizer> Optimizer for ClipOptimizer<O> {
    /// Configured scopes take precedence over `var_list`. When clipping, pairs
    /// without a gradient are dropped and the rest are clamped.
    fn compute_gradients(
        &mut self,
        graph: &Graph,
        loss: &Value,
        var_list: Option<&[Variable]>,
    ) -> Result<Vec<GradAndVar>, OptimError> {
        let var_list = match self.scoped_variables(graph)? {
            Some(vars) => vars,
            None => match var_list {
                Some(vars) => vars.to_vec(),
                None => graph.trainable_variables(None),
            },
        };
        let gvs = self
            .optimizer
            .compute_gradients(graph, loss, Some(&var_list))?;
        self.var_list = Some(var_list);
        if !self.clip {
            return Ok(gvs);
        }
        let (lo, hi) = CLIP_RANGE;
        Ok(gvs
            .into_iter()
            .filter_map(|(grad, var)| grad.map(|g| (Some(g.mapv(|v| v.clamp(lo, hi))), var)))
            .collect())
    }

    fn apply_gradients(
        &mut self,
        grads_and_vars: &[GradAndVar],
        global_step: Option<&GlobalStep>,
    ) -> Result<(), OptimError> {
        self.optimizer.apply_gradients(grads_and_vars, global_step)
    }
}
