//! Declarative network construction
//!
//! Layers are described by calls such as `conv(64, ksize = 11, stride = 4)` which
//! are recorded as [`LayerSpec`]s by a [`Recorder`]. Nothing is computed while
//! recording; [`Recorder::build`] replays the log against a [`Graph`](crate::graph::Graph)
//! using the operation builders of an [`OpRegistry`].

use std::{fmt, str::FromStr};

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::{graph::GraphError, init::InitError, tensor::TensorError};

pub mod builders;
pub mod recorder;
pub mod registry;

pub use builders::{Conv, Fc, Norm, Pool};
pub use recorder::{LayerSpec, Network, Recorder};
pub use registry::{OpBuilder, OpRegistry};

/// Errors for recording and building layers
#[derive(Debug, Error, PartialEq)]
pub enum LayerError {
    #[error("Unknown operation '{0}'")]
    UnknownOperation(String),
    #[error("Activation '{0}' not defined")]
    UnknownActivation(String),
    #[error("Pooling '{0}' not defined, expected 'max' or 'avg'")]
    UnknownPooling(String),
    #[error("Layer and operation names must not be empty")]
    EmptyName,
    #[error("No layer has been opened, call `layer` first")]
    NoActiveLayer,
    #[error("'{op}' takes at most {max} positional arguments, got {got}")]
    TooManyArguments { op: String, max: usize, got: usize },
    #[error("'{op}' has no parameter '{name}'")]
    UnexpectedArgument { op: String, name: String },
    #[error("'{op}' got multiple values for '{name}'")]
    DuplicateArgument { op: String, name: String },
    #[error("'{op}' is missing the required argument '{name}'")]
    MissingArgument { op: String, name: String },
    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },
    #[error("Unknown input layer '{0}'")]
    UnknownInput(String),
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Value of a recorded argument
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Arg {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::None => write!(f, "None"),
            Arg::Bool(b) => write!(f, "{}", b),
            Arg::Int(i) => write!(f, "{}", i),
            Arg::Float(x) => write!(f, "{}", x),
            Arg::Str(s) => write!(f, "'{}'", s),
            Arg::Ints(v) => write!(f, "{:?}", v),
        }
    }
}

macro_rules! impl_from_for_arg(
    ($variant:ident, $cast:ty, $($t:ty),+) => {
        $(
            impl From<$t> for Arg {
                fn from(v: $t) -> Self {
                    Arg::$variant(v as $cast)
                }
            }
        )+
    }
);
impl_from_for_arg!(Int, i64, i32, i64, usize, u32);
impl_from_for_arg!(Float, f64, f32, f64);

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Str(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Str(v)
    }
}

impl<const N: usize> From<[usize; N]> for Arg {
    fn from(v: [usize; N]) -> Self {
        Arg::Ints(v.iter().map(|x| *x as i64).collect())
    }
}

impl From<Vec<i64>> for Arg {
    fn from(v: Vec<i64>) -> Self {
        Arg::Ints(v)
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Arg::None)
    }
}

/// Declared parameter of an operation
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: &'static str,
    /// `None` marks a required parameter
    pub default: Option<Arg>,
}

impl Param {
    pub fn required(name: &'static str) -> Self {
        Self {
            name,
            default: None,
        }
    }

    pub fn optional(name: &'static str, default: impl Into<Arg>) -> Self {
        Self {
            name,
            default: Some(default.into()),
        }
    }
}

/// Named arguments in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<(String, Arg)>);

impl Serialize for Args {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(k, v)| (k, v)))
    }
}

impl Args {
    pub fn get(&self, name: &str) -> Option<&Arg> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arg)> {
        self.0.iter().map(|(n, a)| (n.as_str(), a))
    }

    pub(crate) fn set(&mut self, name: &str, arg: Arg) {
        match self.0.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = arg,
            None => self.0.push((name.to_string(), arg)),
        }
    }

    fn require(&self, name: &str) -> Result<&Arg, LayerError> {
        self.get(name).ok_or_else(|| invalid(name, "not set"))
    }

    pub fn int(&self, name: &str) -> Result<i64, LayerError> {
        match self.require(name)? {
            Arg::Int(i) => Ok(*i),
            other => Err(invalid(name, format!("expected an integer, got {}", other))),
        }
    }

    /// A strictly positive integer
    pub fn positive(&self, name: &str) -> Result<usize, LayerError> {
        let value = self.int(name)?;
        usize::try_from(value)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| invalid(name, format!("expected a positive integer, got {}", value)))
    }

    pub fn float(&self, name: &str) -> Result<f32, LayerError> {
        match self.require(name)? {
            Arg::Int(i) => Ok(*i as f32),
            Arg::Float(x) => Ok(*x as f32),
            other => Err(invalid(name, format!("expected a number, got {}", other))),
        }
    }

    pub fn opt_float(&self, name: &str) -> Result<Option<f32>, LayerError> {
        match self.require(name)? {
            Arg::None => Ok(None),
            _ => self.float(name).map(Some),
        }
    }

    pub fn string(&self, name: &str) -> Result<&str, LayerError> {
        match self.require(name)? {
            Arg::Str(s) => Ok(s),
            other => Err(invalid(name, format!("expected a string, got {}", other))),
        }
    }

    pub fn opt_string(&self, name: &str) -> Result<Option<&str>, LayerError> {
        match self.require(name)? {
            Arg::None => Ok(None),
            _ => self.string(name).map(Some),
        }
    }

    /// `k` or `[h, w]`, as `[h, w]`
    pub fn pair(&self, name: &str) -> Result<[usize; 2], LayerError> {
        let dims = match self.require(name)? {
            Arg::Int(k) => vec![*k, *k],
            Arg::Ints(v) if v.len() == 2 => v.clone(),
            other => {
                return Err(invalid(
                    name,
                    format!("expected an integer or a pair, got {}", other),
                ));
            }
        };
        let dims = positive_dims(name, &dims)?;
        Ok([dims[0], dims[1]])
    }

    /// A 4 element window such as `[1, h, w, 1]`
    pub fn window(&self, name: &str) -> Result<[usize; 4], LayerError> {
        match self.require(name)? {
            Arg::Ints(v) if v.len() == 4 => {
                let dims = positive_dims(name, v)?;
                Ok([dims[0], dims[1], dims[2], dims[3]])
            }
            other => Err(invalid(
                name,
                format!("expected 4 window dimensions, got {}", other),
            )),
        }
    }
}

fn positive_dims(name: &str, dims: &[i64]) -> Result<Vec<usize>, LayerError> {
    dims.iter()
        .map(|d| {
            usize::try_from(*d)
                .ok()
                .filter(|d| *d > 0)
                .ok_or_else(|| invalid(name, format!("dimensions must be positive, got {:?}", dims)))
        })
        .collect()
}

pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> LayerError {
    LayerError::InvalidArgument {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Activation applied after convolutions and dense layers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
}

impl FromStr for Activation {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relu" => Ok(Activation::Relu),
            other => Err(LayerError::UnknownActivation(other.to_string())),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::Relu => write!(f, "relu"),
        }
    }
}
