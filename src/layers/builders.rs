//! Typed helpers for the common layers
//!
//! ```ignore
//! let mut rec = Recorder::default();
//! rec.layer("conv1")?;
//! rec.conv(Conv::new(64).with_ksize(11).with_stride(4).with_padding(Padding::Valid))?;
//! rec.norm(Norm::default())?;
//! rec.pool(Pool::default())?;
//! ```

use crate::ops::{Padding, PoolKind};

use super::{Activation, Arg, LayerError, Recorder};

/// `name` and `input` shared by every helper
#[derive(Debug, Clone, Default, PartialEq)]
struct Naming {
    name: Option<String>,
    input: Option<String>,
}

impl Naming {
    fn extend(self, keywords: &mut Vec<(&'static str, Arg)>) {
        if let Some(name) = self.name {
            keywords.push(("name", Arg::from(name)));
        }
        if let Some(input) = self.input {
            keywords.push(("input", Arg::from(input)));
        }
    }
}

macro_rules! naming_methods(
    () => {
        /// Explicit operation name instead of the generated one
        pub fn with_name(mut self, name: impl Into<String>) -> Self {
            self.naming.name = Some(name.into());
            self
        }

        /// Reads the output of an earlier layer instead of the previous operation
        pub fn with_input(mut self, layer: impl Into<String>) -> Self {
            self.naming.input = Some(layer.into());
            self
        }
    }
);

fn activation_arg(activation: Option<Activation>) -> Arg {
    activation.map(|a| a.to_string()).into()
}

fn pool_kind_arg(kind: PoolKind) -> Arg {
    match kind {
        PoolKind::Max => Arg::from("max"),
        PoolKind::Avg => Arg::from("avg"),
    }
}

/// Convolution followed by bias and activation
#[derive(Debug, Clone, PartialEq)]
pub struct Conv {
    out_shape: usize,
    ksize: [usize; 2],
    stride: [usize; 2],
    padding: Padding,
    init: String,
    stddev: f32,
    bias: f32,
    activation: Option<Activation>,
    weight_decay: Option<f32>,
    naming: Naming,
}

impl Conv {
    /// `out_shape` output channels, 3x3 kernel, stride 1, SAME padding, xavier, relu
    pub fn new(out_shape: usize) -> Self {
        Self {
            out_shape,
            ksize: [3, 3],
            stride: [1, 1],
            padding: Padding::Same,
            init: "xavier".to_string(),
            stddev: 0.01,
            bias: 1.0,
            activation: Some(Activation::Relu),
            weight_decay: None,
            naming: Naming::default(),
        }
    }

    pub fn with_ksize(mut self, ksize: usize) -> Self {
        self.ksize = [ksize, ksize];
        self
    }

    pub fn with_kernel(mut self, kernel: [usize; 2]) -> Self {
        self.ksize = kernel;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = [stride, stride];
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// `xavier`, or `trunc_norm` with [`with_stddev`](Self::with_stddev)
    pub fn with_init(mut self, init: impl Into<String>) -> Self {
        self.init = init.into();
        self
    }

    pub fn with_stddev(mut self, stddev: f32) -> Self {
        self.stddev = stddev;
        self
    }

    /// Initial value of the bias
    pub fn with_bias(mut self, bias: f32) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_activation(mut self, activation: Option<Activation>) -> Self {
        self.activation = activation;
        self
    }

    /// Adds `weight_decay * sum(w^2) / 2` to the regularization losses
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = Some(weight_decay);
        self
    }

    naming_methods!();

    fn into_keywords(self) -> Vec<(&'static str, Arg)> {
        let mut keywords = vec![
            ("out_shape", Arg::from(self.out_shape)),
            ("ksize", Arg::from(self.ksize)),
            ("stride", Arg::from(self.stride)),
            ("padding", Arg::from(self.padding.to_string())),
            ("init", Arg::from(self.init)),
            ("stddev", Arg::from(self.stddev)),
            ("bias", Arg::from(self.bias)),
            ("activation", activation_arg(self.activation)),
            ("weight_decay", Arg::from(self.weight_decay)),
        ];
        self.naming.extend(&mut keywords);
        keywords
    }
}

/// Dense layer with activation and dropout
#[derive(Debug, Clone, PartialEq)]
pub struct Fc {
    out_shape: usize,
    init: String,
    stddev: f32,
    bias: f32,
    activation: Option<Activation>,
    dropout: Option<f32>,
    naming: Naming,
}

impl Fc {
    /// xavier, relu and a keep probability of 0.5
    pub fn new(out_shape: usize) -> Self {
        Self {
            out_shape,
            init: "xavier".to_string(),
            stddev: 0.01,
            bias: 1.0,
            activation: Some(Activation::Relu),
            dropout: Some(0.5),
            naming: Naming::default(),
        }
    }

    pub fn with_init(mut self, init: impl Into<String>) -> Self {
        self.init = init.into();
        self
    }

    pub fn with_stddev(mut self, stddev: f32) -> Self {
        self.stddev = stddev;
        self
    }

    pub fn with_bias(mut self, bias: f32) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_activation(mut self, activation: Option<Activation>) -> Self {
        self.activation = activation;
        self
    }

    /// Keep probability of the dropout after the activation, `None` disables it
    pub fn with_dropout(mut self, keep_prob: Option<f32>) -> Self {
        self.dropout = keep_prob;
        self
    }

    naming_methods!();

    fn into_keywords(self) -> Vec<(&'static str, Arg)> {
        let mut keywords = vec![
            ("out_shape", Arg::from(self.out_shape)),
            ("init", Arg::from(self.init)),
            ("stddev", Arg::from(self.stddev)),
            ("bias", Arg::from(self.bias)),
            ("activation", activation_arg(self.activation)),
            ("dropout", Arg::from(self.dropout)),
        ];
        self.naming.extend(&mut keywords);
        keywords
    }
}

/// Local response normalization
#[derive(Debug, Clone, PartialEq)]
pub struct Norm {
    depth_radius: usize,
    bias: f32,
    alpha: f32,
    beta: f32,
    naming: Naming,
}

impl Default for Norm {
    fn default() -> Self {
        Self {
            depth_radius: 2,
            bias: 1.0,
            alpha: 2e-5,
            beta: 0.75,
            naming: Naming::default(),
        }
    }
}

impl Norm {
    pub fn new(depth_radius: usize, bias: f32, alpha: f32, beta: f32) -> Self {
        Self {
            depth_radius,
            bias,
            alpha,
            beta,
            naming: Naming::default(),
        }
    }

    naming_methods!();

    fn into_keywords(self) -> Vec<(&'static str, Arg)> {
        let mut keywords = vec![
            ("depth_radius", Arg::from(self.depth_radius)),
            ("bias", Arg::from(self.bias)),
            ("alpha", Arg::from(self.alpha)),
            ("beta", Arg::from(self.beta)),
        ];
        self.naming.extend(&mut keywords);
        keywords
    }
}

/// Max or average pooling
#[derive(Debug, Clone, PartialEq)]
pub struct Pool {
    ksize: [usize; 2],
    strides: [usize; 2],
    padding: Padding,
    kind: PoolKind,
    naming: Naming,
}

impl Default for Pool {
    /// 3x3 max pooling with stride 2 and SAME padding
    fn default() -> Self {
        Self {
            ksize: [3, 3],
            strides: [2, 2],
            padding: Padding::Same,
            kind: PoolKind::Max,
            naming: Naming::default(),
        }
    }
}

impl Pool {
    pub fn max(ksize: usize, strides: usize) -> Self {
        Self {
            ksize: [ksize, ksize],
            strides: [strides, strides],
            ..Self::default()
        }
    }

    pub fn avg(ksize: usize, strides: usize) -> Self {
        Self {
            kind: PoolKind::Avg,
            ..Self::max(ksize, strides)
        }
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    naming_methods!();

    fn into_keywords(self) -> Vec<(&'static str, Arg)> {
        let mut keywords = vec![
            ("ksize", Arg::from(self.ksize)),
            ("strides", Arg::from(self.strides)),
            ("padding", Arg::from(self.padding.to_string())),
            ("kind", pool_kind_arg(self.kind)),
        ];
        self.naming.extend(&mut keywords);
        keywords
    }
}

impl Recorder {
    /// Records a `conv` call
    pub fn conv(&mut self, conv: Conv) -> Result<String, LayerError> {
        self.call("conv", &[], &conv.into_keywords())
    }

    /// Records an `fc` call
    pub fn fc(&mut self, fc: Fc) -> Result<String, LayerError> {
        self.call("fc", &[], &fc.into_keywords())
    }

    /// Records a `norm` call
    pub fn norm(&mut self, norm: Norm) -> Result<String, LayerError> {
        self.call("norm", &[], &norm.into_keywords())
    }

    /// Records a `pool` call
    pub fn pool(&mut self, pool: Pool) -> Result<String, LayerError> {
        self.call("pool", &[], &pool.into_keywords())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assert_eq_float, graph::Graph, layers::LayerSpec, tensor::Tensor};

    #[test]
    fn test_helpers_match_plain_calls() {
        let mut typed = Recorder::default();
        typed.layer("conv1").unwrap();
        typed.conv(Conv::new(8)).unwrap();
        typed.norm(Norm::default()).unwrap();
        typed.pool(Pool::default()).unwrap();
        typed.layer("fc").unwrap();
        typed.fc(Fc::new(4)).unwrap();

        let mut plain = Recorder::default();
        plain.layer("conv1").unwrap();
        plain.call("conv", &[Arg::from(8)], &[]).unwrap();
        plain.call("norm", &[], &[]).unwrap();
        plain.call("pool", &[], &[]).unwrap();
        plain.layer("fc").unwrap();
        plain.call("fc", &[Arg::from(4)], &[]).unwrap();

        // defaults agree up to the representation of pairs and floats
        let typed_conv = typed.specs()[0].args();
        assert_eq!(typed_conv.pair("ksize").unwrap(), [3, 3]);
        assert_eq!(typed_conv.get("activation"), Some(&Arg::from("relu")));
        assert_eq!(typed_conv.get("weight_decay"), Some(&Arg::None));
        assert_eq!(typed.specs()[2].args(), plain.specs()[2].args());
        for (t, p) in typed.specs().iter().zip(plain.specs()) {
            assert_eq!(t.name(), p.name());
            let names = |spec: &LayerSpec| spec.args().iter().map(|(n, _)| n.to_string()).collect::<Vec<_>>();
            assert_eq!(names(t), names(p));
            for (name, _) in p.args().iter() {
                if let (Ok(a), Ok(b)) = (t.args().float(name), p.args().float(name)) {
                    assert_eq_float!(a, b);
                }
            }
        }
    }

    #[test]
    fn test_helper_options() {
        let mut rec = Recorder::default();
        rec.layer("conv1").unwrap();
        let name = rec
            .conv(
                Conv::new(16)
                    .with_kernel([5, 3])
                    .with_stride(2)
                    .with_padding(Padding::Valid)
                    .with_init("trunc_norm")
                    .with_activation(None)
                    .with_weight_decay(5e-4)
                    .with_name("proj"),
            )
            .unwrap();
        assert_eq!(name, "proj");
        let args = rec.specs()[0].args();
        assert_eq!(args.pair("ksize").unwrap(), [5, 3]);
        assert_eq!(args.string("padding").unwrap(), "VALID");
        assert_eq!(args.opt_string("activation").unwrap(), None);
        assert!((args.opt_float("weight_decay").unwrap().unwrap() - 5e-4).abs() < 1e-9);

        rec.pool(Pool::avg(2, 2)).unwrap();
        let pool = rec.specs()[1].args();
        assert_eq!(pool.window("ksize").unwrap(), [1, 2, 2, 1]);
        assert_eq!(pool.string("kind").unwrap(), "avg");

        rec.layer("fc").unwrap();
        rec.fc(Fc::new(2).with_dropout(None).with_input("conv1")).unwrap();
        assert_eq!(rec.specs()[2].input(), Some("conv1"));
    }

    #[test]
    fn test_helpers_build() {
        let mut rec = Recorder::default();
        rec.layer("conv1").unwrap();
        rec.conv(Conv::new(3).with_ksize(1)).unwrap();
        rec.pool(Pool::max(2, 2)).unwrap();
        rec.layer("out").unwrap();
        rec.fc(Fc::new(2).with_activation(None).with_dropout(None)).unwrap();

        let mut graph = Graph::new(1);
        let network = rec.build(&mut graph, Tensor::constant(&[1, 4, 4, 2], 1.0)).unwrap();
        assert_eq!(network.layer("conv1").unwrap().shape(), &[1, 2, 2, 3]);
        assert_eq!(network.output().shape(), &[1, 2]);
    }
}
