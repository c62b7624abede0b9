//! Minibatching: accumulating gradients over several minibatches and devices
//! before a single parameter update
//!
//! A step split into `N` minibatches runs [`MinibatchOptimizer::accumulate_gradients`]
//! once per minibatch and [`MinibatchOptimizer::apply_gradients`] once at the end.
//! The accumulator of every variable holds the running sum of `gradient / N`, so
//! after the last minibatch it holds the average gradient of the step.

use std::{fmt, str::FromStr};

use ndarray::{ArrayViewD, Axis};

use crate::{
    graph::{GlobalStep, Graph, Variable},
    values::Value,
};

use super::{GradAndVar, Gradient, OptimError, Optimizer, check_shape};

/// Whether the next accumulation starts a new step or adds to the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MiniBatchFlag {
    /// Accumulators are cleared by the next minibatch
    #[default]
    First,
    /// Accumulators already hold part of the current step
    Subsequent,
}

impl MiniBatchFlag {
    pub fn value(self) -> f32 {
        match self {
            MiniBatchFlag::First => 0.0,
            MiniBatchFlag::Subsequent => 1.0,
        }
    }
}

/// Accumulated gradient of one variable, lives as long as the optimizer
#[derive(Debug, Clone)]
pub struct GradientSlot {
    variable: Variable,
    accumulator: Gradient,
    minibatch_count: usize,
}

impl GradientSlot {
    fn new(variable: &Variable) -> Self {
        Self {
            variable: variable.clone(),
            accumulator: Gradient::zeros(variable.shape()),
            minibatch_count: 0,
        }
    }

    pub fn variable(&self) -> &Variable {
        &self.variable
    }

    pub fn accumulator(&self) -> &Gradient {
        &self.accumulator
    }

    /// Minibatches accumulated into the slot during the current step
    pub fn minibatch_count(&self) -> usize {
        self.minibatch_count
    }
}

/// How gradients computed on several devices are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMethod {
    Average,
}

impl FromStr for AggregationMethod {
    type Err = OptimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "average" => Ok(AggregationMethod::Average),
            other => Err(OptimError::UnsupportedAggregation(other.to_string())),
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationMethod::Average => write!(f, "average"),
        }
    }
}

pub struct MinibatchOptimizer<O> {
    optimizer: O,
    slots: Option<Vec<GradientSlot>>,
    flag: MiniBatchFlag,
    var_list: Option<Vec<Variable>>,
}

impl<O: Optimizer> MinibatchOptimizer<O> {
    pub fn new(optimizer: O) -> Self {
        Self {
            optimizer,
            slots: None,
            flag: MiniBatchFlag::First,
            var_list: None,
        }
    }

    pub fn flag(&self) -> MiniBatchFlag {
        self.flag
    }

    /// Accumulators, empty until the first accumulation
    pub fn slots(&self) -> &[GradientSlot] {
        self.slots.as_deref().unwrap_or_default()
    }

    pub fn var_list(&self) -> Option<&[Variable]> {
        self.var_list.as_deref()
    }

    pub fn inner(&self) -> &O {
        &self.optimizer
    }

    /// Delegates to the wrapped optimizer and remembers which variables it returned
    /// gradients for; accumulation follows that order.
    pub fn compute_gradients(
        &mut self,
        graph: &Graph,
        loss: &Value,
        var_list: Option<&[Variable]>,
    ) -> Result<Vec<GradAndVar>, OptimError> {
        let gvs = self.optimizer.compute_gradients(graph, loss, var_list)?;
        self.var_list = Some(gvs.iter().map(|(_, var)| var.clone()).collect());
        Ok(gvs)
    }

    pub fn aggregate_gradients(
        towers: &[Vec<GradAndVar>],
        method: AggregationMethod,
    ) -> Result<Vec<GradAndVar>, OptimError> {
        match method {
            AggregationMethod::Average => Self::average_gradients(towers),
        }
    }

    /// Averages the gradients each device computed for the same variables.
    ///
    /// Devices are matched by position. A position where no device has a gradient is
    /// passed through from the first device; devices without a gradient are left out
    /// of the mean of the others.
    pub fn average_gradients(towers: &[Vec<GradAndVar>]) -> Result<Vec<GradAndVar>, OptimError> {
        let Some(first) = towers.first() else {
            return Ok(vec![]);
        };
        for (device, tower) in towers.iter().enumerate() {
            if tower.len() != first.len() {
                return Err(OptimError::TowerLengthMismatch {
                    device,
                    expected: first.len(),
                    got: tower.len(),
                });
            }
        }

        let mut averaged = Vec::with_capacity(first.len());
        for (i, (_, var)) in first.iter().enumerate() {
            let present = towers
                .iter()
                .filter_map(|tower| tower[i].0.as_ref())
                .collect::<Vec<_>>();
            if present.is_empty() {
                averaged.push(first[i].clone());
                continue;
            }
            if present.len() != towers.len() {
                log::warn!(
                    "only {} of {} devices produced a gradient for '{}'",
                    present.len(),
                    towers.len(),
                    var.name()
                );
            }
            for grad in present.iter() {
                check_shape(grad, var)?;
            }
            let views = present.iter().map(|g| g.view()).collect::<Vec<ArrayViewD<f32>>>();
            let stacked = ndarray::stack(Axis(0), &views).map_err(|_| OptimError::ShapeMismatch {
                var: var.name().to_string(),
                expected: var.shape().to_vec(),
                got: views[0].shape().to_vec(),
            })?;
            let mean = stacked
                .mean_axis(Axis(0))
                .ok_or(OptimError::NoGradients)?;
            averaged.push((Some(mean), var.clone()));
        }
        Ok(averaged)
    }

    /// Adds one minibatch worth of gradients, `gradient / num_minibatches`, to the
    /// accumulators. With the flag at `First` every accumulator is zeroed first,
    /// including those of variables without a gradient in this minibatch.
    ///
    /// `minibatch_grads` must pair up, in order, with the variables of the last
    /// `compute_gradients`. Pairs without a gradient are skipped. Returns the flag,
    /// now `Subsequent`, and the accumulated gradients of the updated variables.
    pub fn accumulate_gradients(
        &mut self,
        minibatch_grads: &[GradAndVar],
        num_minibatches: usize,
    ) -> Result<(MiniBatchFlag, Vec<GradAndVar>), OptimError> {
        if num_minibatches == 0 {
            return Err(OptimError::ZeroMinibatches);
        }
        let var_list = self
            .var_list
            .as_ref()
            .ok_or(OptimError::VarListNotEstablished)?;
        // a new step may follow a different variable list, its slots start empty anyway
        let stale = self.slots.as_ref().is_some_and(|slots| {
            slots.len() != var_list.len()
                || slots.iter().zip(var_list).any(|(slot, var)| slot.variable != *var)
        });
        if self.flag == MiniBatchFlag::First && stale {
            log::debug!("variable list changed, rebuilding {} slots", var_list.len());
            self.slots = None;
        }
        let slots = self
            .slots
            .get_or_insert_with(|| var_list.iter().map(GradientSlot::new).collect());
        if minibatch_grads.len() != slots.len() {
            return Err(OptimError::GradientCountMismatch {
                expected: slots.len(),
                got: minibatch_grads.len(),
            });
        }
        // validate everything first so a bad gradient leaves the accumulators untouched
        for (slot, (grad, var)) in slots.iter().zip(minibatch_grads) {
            if *var != slot.variable {
                return Err(OptimError::VariableMismatch {
                    expected: slot.variable.name().to_string(),
                    got: var.name().to_string(),
                });
            }
            if let Some(grad) = grad {
                check_shape(grad, &slot.variable)?;
            }
        }

        if self.flag == MiniBatchFlag::First {
            for slot in slots.iter_mut() {
                slot.accumulator.fill(0.0);
                slot.minibatch_count = 0;
            }
        }
        let n = num_minibatches as f32;
        let mut grads = vec![];
        for (slot, (grad, _)) in slots.iter_mut().zip(minibatch_grads) {
            let Some(grad) = grad else {
                continue;
            };
            slot.accumulator.zip_mut_with(grad, |acc, g| *acc += g / n);
            slot.minibatch_count += 1;
            grads.push((Some(slot.accumulator.clone()), slot.variable.clone()));
        }
        self.flag = MiniBatchFlag::Subsequent;
        log::debug!(
            "accumulated {} of {} gradients (1/{} each)",
            grads.len(),
            slots.len(),
            num_minibatches
        );
        Ok((self.flag, grads))
    }

    /// Ends the step: resets the flag, runs the graph's update operations and then
    /// lets the wrapped optimizer apply `grads_and_vars`.
    pub fn apply_gradients(
        &mut self,
        graph: &mut Graph,
        grads_and_vars: &[GradAndVar],
        global_step: Option<&GlobalStep>,
    ) -> Result<(), OptimError> {
        self.flag = MiniBatchFlag::First;
        graph.run_update_ops();
        self.optimizer.apply_gradients(grads_and_vars, global_step)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use ndarray::arr1;

    use super::*;
    use crate::{assert_eq_float, init::Initializer, optim::MomentumOptimizer};

    fn grad(values: &[f32]) -> Option<Gradient> {
        Some(arr1(values).into_dyn())
    }

    /// A graph with a scalar `w` and a 2-vector `v`, optimizer already knows both
    fn setup() -> (Graph, MinibatchOptimizer<MomentumOptimizer>, Variable, Variable) {
        let mut graph = Graph::new(0);
        let w = graph
            .get_variable("w", &[1], Initializer::Constant(0.0), true)
            .unwrap();
        let v = graph
            .get_variable("v", &[2], Initializer::Constant(0.0), true)
            .unwrap();
        let loss = &w.tensor().values()[0] + &v.tensor().sum();
        let mut optim = MinibatchOptimizer::new(MomentumOptimizer::new(1.0, 0.0));
        optim.compute_gradients(&graph, &loss, None).unwrap();
        (graph, optim, w, v)
    }

    #[test]
    fn test_accumulates_the_mean() {
        let (_, mut optim, w, v) = setup();
        let mut last = vec![];
        for g in [1.0, 2.0, 3.0, 4.0] {
            let (flag, grads) = optim
                .accumulate_gradients(&[(grad(&[g]), w.clone()), (None, v.clone())], 4)
                .unwrap();
            assert_eq!(flag, MiniBatchFlag::Subsequent);
            last = grads;
        }
        assert_eq!(last.len(), 1);
        assert_eq_float!(last[0].0.as_ref().unwrap()[[0]], 2.5);
        assert_eq!(last[0].1, w);
        assert_eq!(optim.slots()[0].minibatch_count(), 4);
        // v never received a gradient
        assert_eq!(optim.slots()[1].minibatch_count(), 0);
    }

    #[test]
    fn test_vector_mean() {
        let (_, mut optim, w, v) = setup();
        let batches = [[1.0, -2.0], [3.0, 6.0], [-1.0, 2.0]];
        for b in batches.iter() {
            optim
                .accumulate_gradients(&[(grad(&[0.0]), w.clone()), (grad(b), v.clone())], 3)
                .unwrap();
        }
        let acc = optim.slots()[1].accumulator();
        assert_eq_float!(acc[[0]], 1.0);
        assert_eq_float!(acc[[1]], 2.0);
    }

    #[test]
    fn test_first_flag_discards_previous_content() {
        let (mut graph, mut optim, w, v) = setup();
        let gvs = [(grad(&[8.0]), w.clone()), (grad(&[8.0, 8.0]), v.clone())];
        optim.accumulate_gradients(&gvs, 2).unwrap();
        optim.accumulate_gradients(&gvs, 2).unwrap();
        assert_eq_float!(optim.slots()[0].accumulator()[[0]], 8.0);

        let (_, grads) = optim.accumulate_gradients(&gvs, 2).unwrap();
        optim.apply_gradients(&mut graph, &grads, None).unwrap();
        assert_eq!(optim.flag(), MiniBatchFlag::First);

        let (_, grads) = optim
            .accumulate_gradients(&[(grad(&[2.0]), w.clone()), (grad(&[2.0, 2.0]), v.clone())], 2)
            .unwrap();
        assert_eq_float!(grads[0].0.as_ref().unwrap()[[0]], 1.0);
        assert_eq!(optim.slots()[0].minibatch_count(), 1);
    }

    #[test]
    fn test_first_flag_clears_slots_without_gradient() {
        let (mut graph, mut optim, w, v) = setup();
        let full = [(grad(&[10.0]), w.clone()), (grad(&[10.0, 10.0]), v.clone())];
        optim.accumulate_gradients(&full, 2).unwrap();
        let (_, grads) = optim.accumulate_gradients(&full, 2).unwrap();
        optim.apply_gradients(&mut graph, &grads, None).unwrap();

        // v has no gradient in the first minibatch of the next step
        optim
            .accumulate_gradients(&[(grad(&[2.0]), w.clone()), (None, v.clone())], 2)
            .unwrap();
        assert_eq_float!(optim.slots()[1].accumulator()[[0]], 0.0);
        assert_eq!(optim.slots()[1].minibatch_count(), 0);

        let (_, grads) = optim
            .accumulate_gradients(&[(grad(&[2.0]), w.clone()), (grad(&[2.0, 4.0]), v.clone())], 2)
            .unwrap();
        assert_eq!(grads[1].1, v);
        assert_eq!(grads[1].0, grad(&[1.0, 2.0]));
        assert_eq!(optim.slots()[1].minibatch_count(), 1);
        assert_eq_float!(grads[0].0.as_ref().unwrap()[[0]], 2.0);
    }

    #[test]
    fn test_accumulate_checks_variable_order() {
        let mut graph = Graph::new(0);
        let a = graph
            .get_variable("a", &[1], Initializer::Constant(0.0), true)
            .unwrap();
        let b = graph
            .get_variable("b", &[1], Initializer::Constant(0.0), true)
            .unwrap();
        let loss = &a.tensor().values()[0] + &b.tensor().values()[0];
        let mut optim = MinibatchOptimizer::new(MomentumOptimizer::new(1.0, 0.0));
        optim.compute_gradients(&graph, &loss, None).unwrap();

        let swapped = [(grad(&[7.0]), b.clone()), (grad(&[3.0]), a.clone())];
        assert_eq!(
            optim.accumulate_gradients(&swapped, 1),
            Err(OptimError::VariableMismatch {
                expected: "a".to_string(),
                got: "b".to_string()
            })
        );
        assert_eq!(optim.flag(), MiniBatchFlag::First);
        assert_eq_float!(optim.slots()[0].accumulator()[[0]], 0.0);
    }

    #[test]
    fn test_slots_follow_new_variable_list() {
        let mut graph = Graph::new(0);
        let a = graph
            .get_variable("a", &[1], Initializer::Constant(0.0), true)
            .unwrap();
        let b = graph
            .get_variable("b", &[2], Initializer::Constant(0.0), true)
            .unwrap();
        let mut optim = MinibatchOptimizer::new(MomentumOptimizer::new(1.0, 0.0));

        let loss = &a.tensor().values()[0] * &Value::new(4.0);
        let gvs = optim.compute_gradients(&graph, &loss, Some(&[a.clone()][..])).unwrap();
        let (_, grads) = optim.accumulate_gradients(&gvs, 1).unwrap();
        optim.apply_gradients(&mut graph, &grads, None).unwrap();
        assert_eq!(optim.slots().len(), 1);

        // the next step trains b first, then a
        let loss = &b.tensor().sum() + &a.tensor().values()[0];
        let gvs = optim
            .compute_gradients(&graph, &loss, Some(&[b.clone(), a.clone()][..]))
            .unwrap();
        let (_, grads) = optim.accumulate_gradients(&gvs, 1).unwrap();
        assert_eq!(optim.slots().len(), 2);
        assert_eq!(optim.slots()[0].variable(), &b);
        assert_eq!(grads[0].0, grad(&[1.0, 1.0]));
        assert_eq!(grads[1].1, a);
        assert_eq_float!(grads[1].0.as_ref().unwrap()[[0]], 1.0);

        // mid-step the list cannot change
        let loss = &a.tensor().values()[0] * &Value::new(2.0);
        let gvs = optim.compute_gradients(&graph, &loss, Some(&[a.clone()][..])).unwrap();
        assert!(matches!(
            optim.accumulate_gradients(&gvs, 1),
            Err(OptimError::GradientCountMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_accumulate_before_compute_gradients() {
        let mut optim = MinibatchOptimizer::new(MomentumOptimizer::new(1.0, 0.0));
        let mut graph = Graph::new(0);
        let w = graph
            .get_variable("w", &[1], Initializer::Constant(0.0), true)
            .unwrap();
        assert!(matches!(
            optim.accumulate_gradients(&[(grad(&[1.0]), w)], 1),
            Err(OptimError::VarListNotEstablished)
        ));
        assert_eq!(optim.flag(), MiniBatchFlag::First);
    }

    #[test]
    fn test_accumulate_argument_checks() {
        let (_, mut optim, w, v) = setup();
        assert!(matches!(
            optim.accumulate_gradients(&[(grad(&[1.0]), w.clone()), (None, v.clone())], 0),
            Err(OptimError::ZeroMinibatches)
        ));
        assert!(matches!(
            optim.accumulate_gradients(&[(grad(&[1.0]), w.clone())], 1),
            Err(OptimError::GradientCountMismatch {
                expected: 2,
                got: 1
            })
        ));
        assert!(matches!(
            optim.accumulate_gradients(&[(grad(&[1.0]), w.clone()), (grad(&[1.0]), v.clone())], 1),
            Err(OptimError::ShapeMismatch { .. })
        ));
        // nothing was accumulated by the failed calls
        assert_eq!(optim.flag(), MiniBatchFlag::First);
        assert_eq!(optim.slots()[0].minibatch_count(), 0);
    }

    #[test]
    fn test_apply_resets_flag_and_runs_update_ops_first() {
        let (mut graph, mut optim, w, v) = setup();
        let seen = Rc::new(RefCell::new(vec![]));
        let (seen_by_op, w_by_op) = (seen.clone(), w.clone());
        graph.add_update_op("record_w", move || {
            seen_by_op.borrow_mut().push(w_by_op.to_array()[[0]]);
        });

        let (_, grads) = optim
            .accumulate_gradients(&[(grad(&[0.5]), w.clone()), (grad(&[0.0, 0.0]), v.clone())], 1)
            .unwrap();
        let step = graph.global_step().clone();
        optim.apply_gradients(&mut graph, &grads, Some(&step)).unwrap();

        assert_eq!(optim.flag(), MiniBatchFlag::First);
        // the update op saw w before the optimizer changed it
        assert_eq!(*seen.borrow(), vec![0.0]);
        assert_eq_float!(w.to_array()[[0]], -0.5);
        assert_eq!(step.get(), 1);
    }

    #[test]
    fn test_average_two_devices() {
        let (_, _, w, v) = setup();
        let towers = vec![
            vec![(grad(&[1.0]), w.clone()), (grad(&[2.0, 4.0]), v.clone())],
            vec![(grad(&[3.0]), w.clone()), (grad(&[0.0, -4.0]), v.clone())],
        ];
        let avg = MinibatchOptimizer::<MomentumOptimizer>::average_gradients(&towers).unwrap();
        assert_eq!(avg.len(), 2);
        assert_eq!(avg[0].1, w);
        assert_eq_float!(avg[0].0.as_ref().unwrap()[[0]], 2.0);
        assert_eq!(avg[1].0.as_ref().unwrap().as_slice().unwrap(), &[1.0, 0.0]);
    }

    #[test]
    fn test_average_with_missing_gradients() {
        let (_, _, w, v) = setup();
        let towers = vec![
            vec![(None, w.clone()), (grad(&[2.0, 4.0]), v.clone())],
            vec![(None, w.clone()), (None, v.clone())],
        ];
        let avg = MinibatchOptimizer::<MomentumOptimizer>::average_gradients(&towers).unwrap();
        // nobody has a gradient for w: first device's pair passes through
        assert!(avg[0].0.is_none());
        assert_eq!(avg[0].1, w);
        // only device 0 has one for v: it is used unchanged
        assert_eq!(avg[1].0, grad(&[2.0, 4.0]));
    }

    #[test]
    fn test_average_checks_tower_lengths() {
        let (_, _, w, v) = setup();
        let towers = vec![
            vec![(grad(&[1.0]), w.clone()), (grad(&[2.0, 4.0]), v.clone())],
            vec![(grad(&[3.0]), w.clone())],
        ];
        assert_eq!(
            MinibatchOptimizer::<MomentumOptimizer>::average_gradients(&towers),
            Err(OptimError::TowerLengthMismatch {
                device: 1,
                expected: 2,
                got: 1
            })
        );
        assert!(
            MinibatchOptimizer::<MomentumOptimizer>::average_gradients(&[])
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_aggregation_method() {
        let (_, _, w, _) = setup();
        let method = "average".parse::<AggregationMethod>().unwrap();
        let towers = vec![vec![(grad(&[1.0]), w.clone())], vec![(grad(&[2.0]), w.clone())]];
        let agg = MinibatchOptimizer::<MomentumOptimizer>::aggregate_gradients(&towers, method).unwrap();
        assert_eq_float!(agg[0].0.as_ref().unwrap()[[0]], 1.5);
        assert_eq!(
            "sum".parse::<AggregationMethod>(),
            Err(OptimError::UnsupportedAggregation("sum".to_string()))
        );
    }

    #[test]
    fn test_minibatching_matches_full_batch() {
        // loss_i = x_i * w, the mean gradient over the step is mean(x)
        let mut graph = Graph::new(0);
        let w = graph
            .get_variable("w", &[1], Initializer::Constant(1.0), true)
            .unwrap();
        let mut optim = MinibatchOptimizer::new(MomentumOptimizer::new(0.5, 0.0));
        let xs = [1.0, 2.0, 3.0, 6.0];
        let mut grads = vec![];
        for x in xs {
            let loss = &w.tensor().values()[0] * &Value::new(x);
            let gvs = optim.compute_gradients(&graph, &loss, None).unwrap();
            grads = optim.accumulate_gradients(&gvs, xs.len()).unwrap().1;
        }
        optim.apply_gradients(&mut graph, &grads, None).unwrap();
        assert_eq_float!(w.to_array()[[0]], 1.0 - 0.5 * 3.0);
    }
}
