//! Recording layer calls and replaying them against a graph

use serde::Serialize;

use crate::{graph::Graph, tensor::Tensor};

use super::{Arg, Args, LayerError, OpRegistry};

/// Operations whose `ksize` and `strides` may be given as `k` or `[h, w]`
const POOL_OPS: [&str; 3] = ["pool", "max_pool", "avg_pool"];
const WINDOW_ARGS: [&str; 2] = ["ksize", "strides"];

/// Keywords handled by the recorder rather than the operation
const NAME: &str = "name";
const INPUT: &str = "input";

/// One recorded operation call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerSpec {
    #[serde(skip)]
    layer: String,
    name: String,
    op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<String>,
    args: Args,
}

impl LayerSpec {
    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> &str {
        &self.op
    }

    /// Earlier layer whose output feeds this operation, the previous output otherwise
    pub fn input(&self) -> Option<&str> {
        self.input.as_deref()
    }

    /// Every declared parameter of the operation, in declaration order
    pub fn args(&self) -> &Args {
        &self.args
    }
}

/// Recorded specs of one layer
#[derive(Debug, Serialize)]
pub struct LayerParams<'a> {
    pub layer: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub ops: Vec<&'a LayerSpec>,
}

/// Ordered log of layer calls
pub struct Recorder {
    registry: OpRegistry,
    specs: Vec<LayerSpec>,
    // layer names in order of first appearance
    layers: Vec<String>,
    current: Option<String>,
    seed: Option<u64>,
}

impl Recorder {
    pub fn new(registry: OpRegistry) -> Self {
        Self {
            registry,
            specs: vec![],
            layers: vec![],
            current: None,
            seed: None,
        }
    }

    /// Seed the network is meant to be built with, kept in the metadata
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn registry(&self) -> &OpRegistry {
        &self.registry
    }

    /// Opens `name`, later calls are recorded into it. Layers can be re-entered.
    pub fn layer(&mut self, name: &str) -> Result<(), LayerError> {
        if name.is_empty() {
            return Err(LayerError::EmptyName);
        }
        if !self.layers.iter().any(|l| l == name) {
            self.layers.push(name.to_string());
        }
        self.current = Some(name.to_string());
        Ok(())
    }

    pub fn current_layer(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Records a call of `op` in the current layer and returns the name it was given.
    ///
    /// Positional arguments bind to the declared parameters in order, keywords by
    /// name and everything left takes its default. `name` and `input` are reserved
    /// keywords. Nothing is recorded when the call is rejected.
    pub fn call(
        &mut self,
        op: &str,
        positional: &[Arg],
        keyword: &[(&str, Arg)],
    ) -> Result<String, LayerError> {
        let layer = self.current.clone().ok_or(LayerError::NoActiveLayer)?;
        let builder = self.registry.get(op)?;
        let params = builder.params();

        if positional.len() > params.len() {
            return Err(LayerError::TooManyArguments {
                op: op.to_string(),
                max: params.len(),
                got: positional.len(),
            });
        }
        let mut bound: Vec<Option<Arg>> = vec![None; params.len()];
        for (slot, arg) in bound.iter_mut().zip(positional) {
            *slot = Some(arg.clone());
        }

        let mut name = None;
        let mut input = None;
        for (key, arg) in keyword {
            let duplicate = || LayerError::DuplicateArgument {
                op: op.to_string(),
                name: key.to_string(),
            };
            match *key {
                NAME => {
                    if name.replace(reserved_string(NAME, arg)?).is_some() {
                        return Err(duplicate());
                    }
                }
                INPUT => {
                    if input.replace(reserved_string(INPUT, arg)?).is_some() {
                        return Err(duplicate());
                    }
                }
                _ => {
                    let index = params.iter().position(|p| p.name == *key).ok_or_else(|| {
                        LayerError::UnexpectedArgument {
                            op: op.to_string(),
                            name: key.to_string(),
                        }
                    })?;
                    if bound[index].replace(arg.clone()).is_some() {
                        return Err(duplicate());
                    }
                }
            }
        }

        let mut args = Args::default();
        for (param, arg) in params.iter().zip(bound) {
            let arg = arg
                .or_else(|| param.default.clone())
                .ok_or_else(|| LayerError::MissingArgument {
                    op: op.to_string(),
                    name: param.name.to_string(),
                })?;
            args.set(param.name, arg);
        }
        if POOL_OPS.contains(&op) {
            for key in WINDOW_ARGS {
                if let Some(window) = args.get(key).and_then(expand_window) {
                    args.set(key, window);
                }
            }
        }

        if let Some(source) = &input {
            let recorded = self.specs.iter().any(|s| &s.layer == source);
            if *source == layer || !recorded {
                return Err(LayerError::UnknownInput(source.clone()));
            }
        }
        let name = self.unique_name(&layer, name.as_deref().unwrap_or(op))?;
        builder.validate(&args)?;

        log::debug!("recorded {}/{} = {}({:?})", layer, name, op, args);
        self.specs.push(LayerSpec {
            layer,
            name: name.clone(),
            op: op.to_string(),
            input,
            args,
        });
        Ok(name)
    }

    /// `base`, or `base_1`, `base_2`, ... when the name is taken in `layer`
    fn unique_name(&self, layer: &str, base: &str) -> Result<String, LayerError> {
        if base.is_empty() {
            return Err(LayerError::EmptyName);
        }
        let taken = |candidate: &str| {
            self.specs
                .iter()
                .any(|s| s.layer == layer && s.name == candidate)
        };
        if !taken(base) {
            return Ok(base.to_string());
        }
        let mut i = 1;
        loop {
            let candidate = format!("{}_{}", base, i);
            if !taken(&candidate) {
                return Ok(candidate);
            }
            i += 1;
        }
    }

    /// Every recorded spec in insertion order
    pub fn specs(&self) -> &[LayerSpec] {
        &self.specs
    }

    /// The log grouped by layer, layers in order of first appearance
    pub fn params(&self) -> Vec<LayerParams<'_>> {
        self.layers
            .iter()
            .map(|layer| LayerParams {
                layer,
                seed: self.seed,
                ops: self.specs.iter().filter(|s| &s.layer == layer).collect(),
            })
            .collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.params())
    }

    /// Replays the log in insertion order. Every operation is built in the scope
    /// `<layer>/<name>` and the last output of each layer is marked on the graph.
    pub fn build(&self, graph: &mut Graph, input: Tensor) -> Result<Network, LayerError> {
        if let Some(seed) = self.seed.filter(|seed| *seed != graph.seed()) {
            log::warn!(
                "network recorded with seed {} is built on a graph seeded with {}",
                seed,
                graph.seed()
            );
        }
        let mut outputs: Vec<(String, Tensor)> = vec![];
        let mut current = input;
        for spec in self.specs.iter() {
            let builder = self.registry.get(&spec.op)?;
            let source = match &spec.input {
                Some(name) => outputs
                    .iter()
                    .find(|(layer, _)| layer == name)
                    .map(|(_, t)| t.clone())
                    .ok_or_else(|| LayerError::UnknownInput(name.clone()))?,
                None => current,
            };
            let output = graph.with_scope(&spec.layer, |g| {
                g.with_scope(&spec.name, |g| builder.build(g, &source, &spec.args))
            })?;
            log::debug!(
                "built {}/{}: {:?} -> {:?}",
                spec.layer,
                spec.name,
                source.shape(),
                output.shape()
            );

            graph.mark_output(&spec.layer, output.clone());
            match outputs.iter_mut().find(|(layer, _)| *layer == spec.layer) {
                Some((_, existing)) => *existing = output.clone(),
                None => outputs.push((spec.layer.clone(), output.clone())),
            }
            current = output;
        }
        Ok(Network {
            output: current,
            layers: outputs,
        })
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(OpRegistry::with_builtins())
    }
}

fn reserved_string(key: &str, arg: &Arg) -> Result<String, LayerError> {
    match arg {
        Arg::Str(s) => Ok(s.clone()),
        other => Err(super::invalid(key, format!("expected a string, got {}", other))),
    }
}

/// `k -> [1, k, k, 1]` and `[h, w] -> [1, h, w, 1]`
fn expand_window(arg: &Arg) -> Option<Arg> {
    match arg {
        Arg::Int(k) => Some(Arg::Ints(vec![1, *k, *k, 1])),
        Arg::Ints(v) if v.len() == 2 => Some(Arg::Ints(vec![1, v[0], v[1], 1])),
        _ => None,
    }
}

/// Result of replaying a [`Recorder`]
#[derive(Debug)]
pub struct Network {
    output: Tensor,
    layers: Vec<(String, Tensor)>,
}

impl Network {
    /// Output of the last recorded operation
    pub fn output(&self) -> &Tensor {
        &self.output
    }

    /// Last output of `name`
    pub fn layer(&self, name: &str) -> Option<&Tensor> {
        self.layers
            .iter()
            .find(|(layer, _)| layer == name)
            .map(|(_, t)| t)
    }

    pub fn into_output(self) -> Tensor {
        self.output
    }
}
