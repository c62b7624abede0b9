//! Variable store of a computation graph
//!
//! Keeps track of the variables created while a network is built, the variable
//! scopes they are created under and the collections optimizers read from
//! (trainable variables, regularization losses, update operations).

use std::{cell::Cell, fmt, rc::Rc};

use ndarray::ArrayD;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{
    init::{InitError, Initializer},
    tensor::{Tensor, TensorError, tree_sum},
    values::Value,
};

/// Errors for the graph
#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("Scope names must not be empty")]
    EmptyScopeName,
    #[error("Variable '{0}' already exists")]
    DuplicateVariable(String),
    #[error("Variable '{0}' does not exist and cannot be reused")]
    MissingVariable(String),
    #[error("Variable '{name}' has shape {existing:?}, requested {requested:?}")]
    ReuseShapeMismatch {
        name: String,
        existing: Vec<usize>,
        requested: Vec<usize>,
    },
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// A named parameter tensor. Clones share storage with the original.
#[derive(Clone)]
pub struct Variable {
    name: Rc<str>,
    value: Tensor,
    trainable: bool,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    /// The leaf values backing the variable, to be used when building expressions
    pub fn tensor(&self) -> &Tensor {
        &self.value
    }

    pub fn to_array(&self) -> ArrayD<f32> {
        self.value.to_array()
    }

    /// Overwrites the variable's data in place
    pub fn assign(&self, data: &ArrayD<f32>) -> Result<(), TensorError> {
        if data.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape().to_vec(),
                got: data.shape().to_vec(),
            });
        }
        for (value, new) in self.value.values().iter().zip(data.iter()) {
            value.clone().set_data(*new);
        }
        Ok(())
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("shape", &self.shape())
            .field("trainable", &self.trainable)
            .finish()
    }
}

/// Counter of applied optimizer steps
#[derive(Debug, Clone, Default)]
pub struct GlobalStep(Rc<Cell<u64>>);

impl GlobalStep {
    pub fn get(&self) -> u64 {
        self.0.get()
    }

    pub fn increment(&self) {
        self.0.set(self.0.get() + 1);
    }
}

struct UpdateOp {
    name: String,
    op: Box<dyn FnMut()>,
}

/// Holds variables, scopes and collections for one network
pub struct Graph {
    variables: Vec<Variable>,
    scopes: Vec<String>,
    reuse: bool,
    // L2 weight decay per variable
    weight_decay: Vec<(Variable, f32)>,
    update_ops: Vec<UpdateOp>,
    outputs: Vec<(String, Tensor)>,
    global_step: GlobalStep,
    seed: u64,
    rng: Pcg64Mcg,
}

impl Graph {
    /// Creates an empty graph, `seed` drives initializers and dropout
    pub fn new(seed: u64) -> Self {
        Self {
            variables: vec![],
            scopes: vec![],
            reuse: false,
            weight_decay: vec![],
            update_ops: vec![],
            outputs: vec![],
            global_step: GlobalStep::default(),
            seed,
            rng: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rng(&mut self) -> &mut Pcg64Mcg {
        &mut self.rng
    }

    pub fn global_step(&self) -> &GlobalStep {
        &self.global_step
    }

    pub fn push_scope(&mut self, name: &str) -> Result<(), GraphError> {
        if name.is_empty() {
            return Err(GraphError::EmptyScopeName);
        }
        self.scopes.push(name.to_string());
        Ok(())
    }

    pub fn pop_scope(&mut self) -> Option<String> {
        self.scopes.pop()
    }

    /// Runs `f` inside the scope `name`, the scope is left again even if `f` fails
    pub fn with_scope<T, E, F>(&mut self, name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Graph) -> Result<T, E>,
        E: From<GraphError>,
    {
        self.push_scope(name)?;
        let result = f(self);
        self.pop_scope();
        result
    }

    pub fn current_scope(&self) -> String {
        self.scopes.join("/")
    }

    fn scoped_name(&self, name: &str) -> String {
        if self.scopes.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.current_scope(), name)
        }
    }

    /// Switches the graph into reuse mode: from now on `get_variable` returns the
    /// existing variable of that name instead of creating one. Used to build the
    /// forward pass again, for another minibatch or another device.
    pub fn reuse_variables(&mut self) {
        self.reuse = true;
    }

    pub fn is_reusing(&self) -> bool {
        self.reuse
    }

    /// Creates `<scope>/<name>` with values drawn from `init`, or returns it when reusing
    pub fn get_variable(
        &mut self,
        name: &str,
        shape: &[usize],
        init: Initializer,
        trainable: bool,
    ) -> Result<Variable, GraphError> {
        let full_name = self.scoped_name(name);
        if self.reuse {
            let existing = self
                .variable(&full_name)
                .ok_or_else(|| GraphError::MissingVariable(full_name.clone()))?;
            if existing.shape() != shape {
                return Err(GraphError::ReuseShapeMismatch {
                    name: full_name,
                    existing: existing.shape().to_vec(),
                    requested: shape.to_vec(),
                });
            }
            return Ok(existing.clone());
        }
        if self.variable(&full_name).is_some() {
            return Err(GraphError::DuplicateVariable(full_name));
        }
        let data = init.sample(shape, &mut self.rng)?;
        let variable = Variable {
            name: full_name.into(),
            value: Tensor::from_data(shape, &data)?,
            trainable,
        };
        log::debug!("created variable {:?}", variable);
        self.variables.push(variable.clone());
        Ok(variable)
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name() == name)
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Trainable variables in creation order, restricted to `scope` when given.
    /// A scope matches whole name segments: `conv1` selects `conv1/...` but not `conv10/...`.
    pub fn trainable_variables(&self, scope: Option<&str>) -> Vec<Variable> {
        self.variables
            .iter()
            .filter(|v| v.trainable())
            .filter(|v| match scope {
                None => true,
                Some(scope) => {
                    let scope = scope.trim_end_matches('/');
                    v.name() == scope
                        || v
                            .name()
                            .strip_prefix(scope)
                            .is_some_and(|rest| rest.starts_with('/'))
                }
            })
            .cloned()
            .collect()
    }

    /// Adds `weight_decay * sum(var^2) / 2` to the regularization loss.
    /// A variable is decayed once, later calls for it are ignored.
    pub fn add_weight_decay(&mut self, var: &Variable, weight_decay: f32) {
        if !self.weight_decay.iter().any(|(v, _)| v == var) {
            self.weight_decay.push((var.clone(), weight_decay));
        }
    }

    /// Sum of the L2 terms of every decayed variable (0 when there are none),
    /// built from the current variable values
    pub fn regularization_loss(&self) -> Value {
        let two = Value::new(2.0);
        let terms = self
            .weight_decay
            .iter()
            .map(|(var, wd)| {
                let squares = var.tensor().map(|w| w.pow(&two)).sum();
                &(&squares * &Value::new(*wd)) / &two
            })
            .collect();
        tree_sum(terms)
    }

    /// Registers a side-effect operation that has to run before every optimizer update
    pub fn add_update_op<F>(&mut self, name: &str, op: F)
    where
        F: FnMut() + 'static,
    {
        self.update_ops.push(UpdateOp {
            name: name.to_string(),
            op: Box::new(op),
        });
    }

    pub fn run_update_ops(&mut self) {
        for update in self.update_ops.iter_mut() {
            log::debug!("running update op '{}'", update.name);
            (update.op)();
        }
    }

    /// Identity marker so a tensor can be looked up by name later on
    pub fn mark_output(&mut self, name: &str, tensor: Tensor) {
        match self.outputs.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = tensor,
            None => self.outputs.push((name.to_string(), tensor)),
        }
    }

    pub fn output(&self, name: &str) -> Option<&Tensor> {
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }
}
