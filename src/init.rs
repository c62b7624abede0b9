//! Variable initializers

use rand::{Rng, distr::Uniform};
use rand_distr::{Distribution, Normal};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum InitError {
    #[error("Unknown initializer '{0}', expected 'xavier' or 'trunc_norm'")]
    UnknownInitializer(String),
    #[error("Invalid standard deviation {0}")]
    InvalidStddev(f32),
}

/// How the initial values of a variable are drawn
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    /// Glorot uniform, bounded by `sqrt(6 / (fan_in + fan_out))`
    Xavier,
    /// Normal with mean 0, values further than two standard deviations are redrawn
    TruncatedNormal { stddev: f32 },
    Constant(f32),
}

impl Initializer {
    /// Resolves the names used in layer arguments
    pub fn from_name(kind: &str, stddev: f32) -> Result<Self, InitError> {
        match kind {
            "xavier" => Ok(Initializer::Xavier),
            "trunc_norm" => {
                if !stddev.is_finite() || stddev <= 0.0 {
                    return Err(InitError::InvalidStddev(stddev));
                }
                Ok(Initializer::TruncatedNormal { stddev })
            }
            other => Err(InitError::UnknownInitializer(other.to_string())),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> Result<Vec<f32>, InitError> {
        let len = shape.iter().product::<usize>();
        match *self {
            Initializer::Constant(value) => Ok(vec![value; len]),
            Initializer::Xavier => {
                let (fan_in, fan_out) = fans(shape);
                let limit = (6.0 / (fan_in + fan_out).max(1.0)).sqrt();
                let uniform = Uniform::new_inclusive(-limit, limit)
                    .map_err(|_| InitError::InvalidStddev(limit))?;
                Ok((0..len).map(|_| uniform.sample(rng)).collect())
            }
            Initializer::TruncatedNormal { stddev } => {
                let normal = Normal::new(0.0, stddev).map_err(|_| InitError::InvalidStddev(stddev))?;
                Ok((0..len)
                    .map(|_| loop {
                        let v: f32 = normal.sample(rng);
                        if v.abs() <= 2.0 * stddev {
                            break v;
                        }
                    })
                    .collect())
            }
        }
    }
}

/// Fan in/out for dense `[in, out]` and convolution `[h, w, in, out]` shapes
fn fans(shape: &[usize]) -> (f32, f32) {
    match shape {
        [] => (1.0, 1.0),
        [n] => (*n as f32, *n as f32),
        _ => {
            let receptive = shape[..shape.len() - 2].iter().product::<usize>() as f32;
            let fan_in = shape[shape.len() - 2] as f32 * receptive;
            let fan_out = shape[shape.len() - 1] as f32 * receptive;
            (fan_in, fan_out)
        }
    }
}
