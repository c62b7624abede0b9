//! Shaped, row-major tensors of graph values
//!
//! Images follow the NHWC layout (batch, height, width, channels) and convolution
//! kernels HWIO (height, width, in channels, out channels).

use std::fmt;

use ndarray::{ArrayD, IxDyn};
use thiserror::Error;

use crate::values::Value;

/// Errors for tensor construction and shape handling
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("Shape {shape:?} holds {expected} elements, got {got}")]
    ElementCount {
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Expected a tensor of rank {expected}, got shape {shape:?}")]
    Rank { expected: usize, shape: Vec<usize> },
    #[error("Invalid {param}: {reason}")]
    InvalidParameter { param: &'static str, reason: String },
}

#[derive(Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<Value>,
}

impl Tensor {
    pub fn from_vec(shape: &[usize], data: Vec<Value>) -> Result<Self, TensorError> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(TensorError::ElementCount {
                shape: shape.to_vec(),
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// A tensor of fresh leaf values
    pub fn from_data(shape: &[usize], data: &[f32]) -> Result<Self, TensorError> {
        Self::from_vec(shape, data.iter().map(|v| Value::new(*v)).collect())
    }

    pub fn constant(shape: &[usize], value: f32) -> Self {
        let len = shape.iter().product::<usize>();
        Self {
            shape: shape.to_vec(),
            data: (0..len).map(|_| Value::new(value)).collect(),
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::constant(shape, 0.0)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.data
    }

    /// Row-major offset of a multi-dimensional index
    pub fn offset(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.shape.len());
        index
            .iter()
            .zip(self.shape.iter())
            .fold(0, |acc, (i, dim)| acc * dim + i)
    }

    pub fn get(&self, index: &[usize]) -> &Value {
        &self.data[self.offset(index)]
    }

    /// Snapshot of the current data
    pub fn to_array(&self) -> ArrayD<f32> {
        let data = self.data.iter().map(Value::data).collect::<Vec<_>>();
        // shape and length always agree, see `from_vec`
        ArrayD::from_shape_vec(IxDyn(&self.shape), data)
            .unwrap_or_else(|_| unreachable!("tensor shape and length diverged"))
    }

    /// Gradients currently held by the values, in the tensor's shape
    pub fn grad_array(&self) -> ArrayD<f32> {
        let grads = self.data.iter().map(Value::grad).collect::<Vec<_>>();
        ArrayD::from_shape_vec(IxDyn(&self.shape), grads)
            .unwrap_or_else(|_| unreachable!("tensor shape and length diverged"))
    }

    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor, TensorError> {
        Tensor::from_vec(shape, self.data.clone())
    }

    /// Collapses every dimension after the first one, `[n, ...] -> [n, rest]`
    pub fn flatten(&self) -> Result<Tensor, TensorError> {
        let Some(&batch) = self.shape.first() else {
            return Err(TensorError::Rank {
                expected: 1,
                shape: self.shape.clone(),
            });
        };
        let rest = self.shape[1..].iter().product::<usize>();
        self.reshape(&[batch, rest])
    }

    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(&Value) -> Value,
    {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(f).collect(),
        }
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        Ok(Tensor {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| a + b)
                .collect(),
        })
    }

    pub fn sum(&self) -> Value {
        tree_sum(self.data.clone())
    }

    pub fn mean(&self) -> Value {
        let n = Value::new(self.data.len().max(1) as f32);
        &self.sum() / &n
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data", &self.data.iter().map(Value::data).collect::<Vec<_>>())
            .finish()
    }
}

/// Sums values pairwise so the resulting graph stays shallow
pub(crate) fn tree_sum(mut values: Vec<Value>) -> Value {
    if values.is_empty() {
        return Value::new(0.0);
    }
    while values.len() > 1 {
        values = values
            .chunks(2)
            .map(|pair| match pair {
                [a, b] => a + b,
                [a] => a.clone(),
                _ => unreachable!(),
            })
            .collect();
    }
    values.swap_remove(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_eq_float;

    #[test]
    fn test_from_vec_checks_length() {
        let err = Tensor::from_data(&[2, 3], &[1.0; 5]).unwrap_err();
        assert_eq!(
            err,
            TensorError::ElementCount {
                shape: vec![2, 3],
                expected: 6,
                got: 5
            }
        );
    }

    #[test]
    fn test_offset_is_row_major() {
        let t = Tensor::from_data(&[2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(t.get(&[0, 2]).data(), 2.0);
        assert_eq!(t.get(&[1, 0]).data(), 3.0);
        assert_eq!(t.to_array()[&[1, 2][..]], 5.0);
    }

    #[test]
    fn test_flatten() {
        let t = Tensor::zeros(&[2, 3, 4, 5]);
        assert_eq!(t.flatten().unwrap().shape(), &[2, 60]);
        assert!(Tensor::zeros(&[]).flatten().is_err());
    }

    #[test]
    fn test_sum_and_mean_backprop() {
        let t = Tensor::from_data(&[5], &[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let mean = t.mean();
        assert_eq_float!(mean.data(), 3.0);
        mean.backward();
        for v in t.values() {
            assert_eq_float!(v.grad(), 0.2);
        }
    }

    #[test]
    fn test_add_shape_mismatch() {
        let a = Tensor::zeros(&[2, 2]);
        let b = Tensor::zeros(&[4]);
        assert!(matches!(a.add(&b), Err(TensorError::ShapeMismatch { .. })));
    }
}
