//! Operation builders that can be referenced by name from a recorded layer

use std::collections::HashMap;

use crate::{
    graph::Graph,
    init::Initializer,
    ops::{self, Padding, PoolKind},
    tensor::{Tensor, TensorError},
};

use super::{Activation, Arg, Args, LayerError, Param, invalid};

/// Builds one operation of a network from its recorded arguments
pub trait OpBuilder {
    /// Declared parameters in positional order, `Param::default` is `None` for required ones
    fn params(&self) -> Vec<Param>;

    /// Checks the arguments at recording time, before anything is built
    fn validate(&self, _args: &Args) -> Result<(), LayerError> {
        Ok(())
    }

    /// Creates the variables of the operation in the current scope of `graph` and
    /// returns its output
    fn build(&self, graph: &mut Graph, input: &Tensor, args: &Args) -> Result<Tensor, LayerError>;
}

/// Maps operation names to their builders
pub struct OpRegistry {
    builders: HashMap<String, Box<dyn OpBuilder>>,
}

impl OpRegistry {
    /// A registry without any operations
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// `conv`, `fc`, `norm`, `pool`, `max_pool`, `avg_pool`, `relu`, `dropout` and `flatten`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("conv", ConvBuilder);
        registry.register("fc", FcBuilder);
        registry.register("norm", NormBuilder);
        registry.register("pool", PoolBuilder);
        registry.register("max_pool", FixedPoolBuilder(PoolKind::Max));
        registry.register("avg_pool", FixedPoolBuilder(PoolKind::Avg));
        registry.register("relu", ReluBuilder);
        registry.register("dropout", DropoutBuilder);
        registry.register("flatten", FlattenBuilder);
        registry
    }

    /// Registers `builder` under `name`, replacing a previous builder of that name
    pub fn register<B: OpBuilder + 'static>(&mut self, name: &str, builder: B) {
        self.builders.insert(name.to_string(), Box::new(builder));
    }

    pub fn get(&self, name: &str) -> Result<&dyn OpBuilder, LayerError> {
        self.builders
            .get(name)
            .map(|b| b.as_ref())
            .ok_or_else(|| LayerError::UnknownOperation(name.to_string()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names = self.builders.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn activation(args: &Args) -> Result<Option<Activation>, LayerError> {
    args.opt_string("activation")?
        .map(str::parse::<Activation>)
        .transpose()
}

fn apply_activation(input: Tensor, activation: Option<Activation>) -> Tensor {
    match activation {
        Some(Activation::Relu) => ops::relu(&input),
        None => input,
    }
}

fn padding(args: &Args) -> Result<Padding, LayerError> {
    Ok(args.string("padding")?.parse::<Padding>()?)
}

fn initializer(args: &Args) -> Result<Initializer, LayerError> {
    Ok(Initializer::from_name(
        args.string("init")?,
        args.float("stddev")?,
    )?)
}

fn keep_prob(args: &Args, name: &str) -> Result<Option<f32>, LayerError> {
    match args.opt_float(name)? {
        Some(p) if !(p > 0.0 && p <= 1.0) => {
            Err(invalid(name, format!("keep probability {} is not in (0, 1]", p)))
        }
        p => Ok(p),
    }
}

fn pool_kind(kind: &str) -> Result<PoolKind, LayerError> {
    match kind {
        "max" => Ok(PoolKind::Max),
        "avg" => Ok(PoolKind::Avg),
        other => Err(LayerError::UnknownPooling(other.to_string())),
    }
}

fn last_dim(input: &Tensor, rank: usize) -> Result<usize, LayerError> {
    match input.shape() {
        shape if shape.len() == rank => Ok(shape[rank - 1]),
        shape => Err(TensorError::Rank {
            expected: rank,
            shape: shape.to_vec(),
        }
        .into()),
    }
}

/// Convolution with bias, activation and optional L2 weight decay.
/// Creates `weights` `[kh, kw, in, out_shape]` and `bias` `[out_shape]`.
struct ConvBuilder;

impl OpBuilder for ConvBuilder {
    fn params(&self) -> Vec<Param> {
        vec![
            Param::required("out_shape"),
            Param::optional("ksize", 3),
            Param::optional("stride", 1),
            Param::optional("padding", "SAME"),
            Param::optional("init", "xavier"),
            Param::optional("stddev", 0.01),
            Param::optional("bias", 1.0),
            Param::optional("activation", "relu"),
            Param::optional("weight_decay", Arg::None),
        ]
    }

    fn validate(&self, args: &Args) -> Result<(), LayerError> {
        args.positive("out_shape")?;
        args.pair("ksize")?;
        args.pair("stride")?;
        padding(args)?;
        initializer(args)?;
        args.float("bias")?;
        activation(args)?;
        if let Some(wd) = args.opt_float("weight_decay")? {
            if wd < 0.0 {
                return Err(invalid("weight_decay", format!("{} is negative", wd)));
            }
        }
        Ok(())
    }

    fn build(&self, graph: &mut Graph, input: &Tensor, args: &Args) -> Result<Tensor, LayerError> {
        let out_shape = args.positive("out_shape")?;
        let [kh, kw] = args.pair("ksize")?;
        let [sh, sw] = args.pair("stride")?;
        let in_channels = last_dim(input, 4)?;

        let weights = graph.get_variable(
            "weights",
            &[kh, kw, in_channels, out_shape],
            initializer(args)?,
            true,
        )?;
        let bias = graph.get_variable(
            "bias",
            &[out_shape],
            Initializer::Constant(args.float("bias")?),
            true,
        )?;
        if let Some(wd) = args.opt_float("weight_decay")? {
            graph.add_weight_decay(&weights, wd);
        }

        let conv = ops::conv2d(input, weights.tensor(), (sh, sw), padding(args)?)?;
        let output = ops::bias_add(&conv, bias.tensor())?;
        Ok(apply_activation(output, activation(args)?))
    }
}

/// Dense layer on the flattened input, followed by activation and dropout
struct FcBuilder;

impl OpBuilder for FcBuilder {
    fn params(&self) -> Vec<Param> {
        vec![
            Param::required("out_shape"),
            Param::optional("init", "xavier"),
            Param::optional("stddev", 0.01),
            Param::optional("bias", 1.0),
            Param::optional("activation", "relu"),
            Param::optional("dropout", 0.5),
        ]
    }

    fn validate(&self, args: &Args) -> Result<(), LayerError> {
        args.positive("out_shape")?;
        initializer(args)?;
        args.float("bias")?;
        activation(args)?;
        keep_prob(args, "dropout")?;
        Ok(())
    }

    fn build(&self, graph: &mut Graph, input: &Tensor, args: &Args) -> Result<Tensor, LayerError> {
        let out_shape = args.positive("out_shape")?;
        let flat = input.flatten()?;
        let in_dim = last_dim(&flat, 2)?;

        let weights = graph.get_variable("weights", &[in_dim, out_shape], initializer(args)?, true)?;
        let bias = graph.get_variable(
            "bias",
            &[out_shape],
            Initializer::Constant(args.float("bias")?),
            true,
        )?;

        let dense = ops::bias_add(&ops::matmul(&flat, weights.tensor())?, bias.tensor())?;
        let output = apply_activation(dense, activation(args)?);
        match keep_prob(args, "dropout")? {
            Some(keep) => Ok(ops::dropout(&output, keep, graph.rng())?),
            None => Ok(output),
        }
    }
}

/// Local response normalization across channels
struct NormBuilder;

impl NormBuilder {
    fn depth_radius(args: &Args) -> Result<usize, LayerError> {
        let radius = args.int("depth_radius")?;
        usize::try_from(radius)
            .map_err(|_| invalid("depth_radius", format!("{} is negative", radius)))
    }
}

impl OpBuilder for NormBuilder {
    fn params(&self) -> Vec<Param> {
        vec![
            Param::optional("depth_radius", 2),
            Param::optional("bias", 1.0),
            Param::optional("alpha", 2e-5),
            Param::optional("beta", 0.75),
        ]
    }

    fn validate(&self, args: &Args) -> Result<(), LayerError> {
        Self::depth_radius(args)?;
        for name in ["bias", "alpha", "beta"] {
            args.float(name)?;
        }
        Ok(())
    }

    fn build(&self, _graph: &mut Graph, input: &Tensor, args: &Args) -> Result<Tensor, LayerError> {
        Ok(ops::local_response_norm(
            input,
            Self::depth_radius(args)?,
            args.float("bias")?,
            args.float("alpha")?,
            args.float("beta")?,
        )?)
    }
}

/// Pooling whose kind is an argument, `max` or `avg`
struct PoolBuilder;

impl OpBuilder for PoolBuilder {
    fn params(&self) -> Vec<Param> {
        vec![
            Param::optional("ksize", 3),
            Param::optional("strides", 2),
            Param::optional("padding", "SAME"),
            Param::optional("kind", "max"),
        ]
    }

    fn validate(&self, args: &Args) -> Result<(), LayerError> {
        pool_kind(args.string("kind")?)?;
        args.window("ksize")?;
        args.window("strides")?;
        padding(args)?;
        Ok(())
    }

    fn build(&self, _graph: &mut Graph, input: &Tensor, args: &Args) -> Result<Tensor, LayerError> {
        Ok(ops::pool(
            input,
            pool_kind(args.string("kind")?)?,
            args.window("ksize")?,
            args.window("strides")?,
            padding(args)?,
        )?)
    }
}

/// `max_pool` and `avg_pool`, window and strides have to be given
struct FixedPoolBuilder(PoolKind);

impl OpBuilder for FixedPoolBuilder {
    fn params(&self) -> Vec<Param> {
        vec![
            Param::required("ksize"),
            Param::required("strides"),
            Param::optional("padding", "SAME"),
        ]
    }

    fn validate(&self, args: &Args) -> Result<(), LayerError> {
        args.window("ksize")?;
        args.window("strides")?;
        padding(args)?;
        Ok(())
    }

    fn build(&self, _graph: &mut Graph, input: &Tensor, args: &Args) -> Result<Tensor, LayerError> {
        Ok(ops::pool(
            input,
            self.0,
            args.window("ksize")?,
            args.window("strides")?,
            padding(args)?,
        )?)
    }
}

struct ReluBuilder;

impl OpBuilder for ReluBuilder {
    fn params(&self) -> Vec<Param> {
        vec![]
    }

    fn build(&self, _graph: &mut Graph, input: &Tensor, _args: &Args) -> Result<Tensor, LayerError> {
        Ok(ops::relu(input))
    }
}

struct DropoutBuilder;

impl OpBuilder for DropoutBuilder {
    fn params(&self) -> Vec<Param> {
        vec![Param::optional("keep_prob", 0.5)]
    }

    fn validate(&self, args: &Args) -> Result<(), LayerError> {
        keep_prob(args, "keep_prob")?;
        Ok(())
    }

    fn build(&self, graph: &mut Graph, input: &Tensor, args: &Args) -> Result<Tensor, LayerError> {
        match keep_prob(args, "keep_prob")? {
            Some(keep) => Ok(ops::dropout(input, keep, graph.rng())?),
            None => Ok(input.clone()),
        }
    }
}

struct FlattenBuilder;

impl OpBuilder for FlattenBuilder {
    fn params(&self) -> Vec<Param> {
        vec![]
    }

    fn build(&self, _graph: &mut Graph, input: &Tensor, _args: &Args) -> Result<Tensor, LayerError> {
        Ok(input.flatten()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assert_eq_float, values::Value};

    /// Declared defaults overridden by `pairs`
    fn args_for(builder: &dyn OpBuilder, pairs: &[(&str, Arg)]) -> Args {
        let mut args = Args::default();
        for param in builder.params() {
            args.set(param.name, param.default.unwrap_or(Arg::None));
        }
        for (name, arg) in pairs {
            args.set(name, arg.clone());
        }
        args
    }

    #[test]
    fn test_builtin_names() {
        let registry = OpRegistry::default();
        assert_eq!(
            registry.names(),
            vec!["avg_pool", "conv", "dropout", "fc", "flatten", "max_pool", "norm", "pool", "relu"]
        );
        assert!(matches!(
            registry.get("batch_norm"),
            Err(LayerError::UnknownOperation(name)) if name == "batch_norm"
        ));
        assert!(OpRegistry::new().get("conv").is_err());
    }

    #[test]
    fn test_conv_creates_variables() {
        let registry = OpRegistry::with_builtins();
        let conv = registry.get("conv").unwrap();
        let args = args_for(conv, &[("out_shape", Arg::from(3)), ("stride", Arg::from(2))]);
        conv.validate(&args).unwrap();

        let mut graph = Graph::new(0);
        let input = Tensor::constant(&[2, 5, 5, 4], 1.0);
        let output = graph
            .with_scope("conv1", |g| conv.build(g, &input, &args))
            .unwrap();
        assert_eq!(output.shape(), &[2, 3, 3, 3]);
        assert_eq!(graph.variable("conv1/weights").unwrap().shape(), &[3, 3, 4, 3]);
        assert_eq!(graph.variable("conv1/bias").unwrap().to_array()[[0]], 1.0);
        assert_eq!(graph.regularization_loss().data(), 0.0);
    }

    #[test]
    fn test_conv_weight_decay() {
        let registry = OpRegistry::with_builtins();
        let conv = registry.get("conv").unwrap();
        let args = args_for(
            conv,
            &[
                ("out_shape", Arg::from(1)),
                ("ksize", Arg::from(1)),
                ("init", Arg::from("trunc_norm")),
                ("weight_decay", Arg::from(0.5)),
            ],
        );
        let mut graph = Graph::new(0);
        let input = Tensor::constant(&[1, 1, 1, 2], 1.0);
        conv.build(&mut graph, &input, &args).unwrap();
        let w = graph.variable("weights").unwrap().to_array();
        let expected = 0.5 * (w[[0, 0, 0, 0]].powi(2) + w[[0, 0, 1, 0]].powi(2)) / 2.0;
        assert_eq_float!(graph.regularization_loss().data(), expected);
    }

    #[test]
    fn test_conv_validation() {
        let conv = ConvBuilder;
        let bad_activation = args_for(
            &conv,
            &[("out_shape", Arg::from(8)), ("activation", Arg::from("tanh"))],
        );
        assert_eq!(
            conv.validate(&bad_activation),
            Err(LayerError::UnknownActivation("tanh".to_string()))
        );
        let bad_padding = args_for(
            &conv,
            &[("out_shape", Arg::from(8)), ("padding", Arg::from("FULL"))],
        );
        assert!(matches!(conv.validate(&bad_padding), Err(LayerError::Tensor(_))));
        let no_activation = args_for(&conv, &[("out_shape", Arg::from(8)), ("activation", Arg::None)]);
        assert!(conv.validate(&no_activation).is_ok());
    }

    #[test]
    fn test_fc_flattens_input() {
        let fc = FcBuilder;
        let args = args_for(
            &fc,
            &[
                ("out_shape", Arg::from(2)),
                ("bias", Arg::from(0.0)),
                ("activation", Arg::None),
                ("dropout", Arg::None),
                ("init", Arg::from("trunc_norm")),
            ],
        );
        let mut graph = Graph::new(0);
        let input = Tensor::constant(&[3, 2, 2, 1], 1.0);
        let output = fc.build(&mut graph, &input, &args).unwrap();
        assert_eq!(output.shape(), &[3, 2]);

        let w = graph.variable("weights").unwrap().to_array();
        assert_eq!(w.shape(), &[4, 2]);
        let column_sum = (0..4).map(|i| w[[i, 1]]).sum::<f32>();
        assert_eq_float!(output.get(&[2, 1]).data(), column_sum);
    }

    #[test]
    fn test_pool_kind() {
        let pool = PoolBuilder;
        let args = args_for(
            &pool,
            &[
                ("ksize", Arg::from([1usize, 2, 2, 1])),
                ("strides", Arg::from([1usize, 2, 2, 1])),
                ("kind", Arg::from("avg")),
            ],
        );
        pool.validate(&args).unwrap();
        let input = Tensor::from_data(&[1, 2, 2, 1], &[1.0, 2.0, 3.0, 6.0]).unwrap();
        let output = pool.build(&mut Graph::new(0), &input, &args).unwrap();
        assert_eq!(output.shape(), &[1, 1, 1, 1]);
        assert_eq_float!(output.values()[0].data(), 3.0);

        let mut bad = args.clone();
        bad.set("kind", Arg::from("min"));
        assert_eq!(
            pool.validate(&bad),
            Err(LayerError::UnknownPooling("min".to_string()))
        );
    }

    #[test]
    fn test_register_custom_builder() {
        struct Double;
        impl OpBuilder for Double {
            fn params(&self) -> Vec<Param> {
                vec![]
            }
            fn build(&self, _: &mut Graph, input: &Tensor, _: &Args) -> Result<Tensor, LayerError> {
                Ok(input.map(|v| v * &Value::new(2.0)))
            }
        }

        let mut registry = OpRegistry::new();
        registry.register("double", Double);
        let input = Tensor::from_data(&[2], &[1.0, 3.0]).unwrap();
        let output = registry
            .get("double")
            .unwrap()
            .build(&mut Graph::new(0), &input, &Args::default())
            .unwrap();
        assert_eq!(output.to_array().as_slice().unwrap(), &[2.0, 6.0]);
    }
}
