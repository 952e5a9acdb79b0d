//! Elementwise activation functions.
//!
//! Every activation exposes a forward transform and a *local* derivative.
//! The derivative is always evaluated at the already-activated value
//! `y = forward(x)`, never at the pre-activation input, so layers only need
//! to cache their output.
//!
//! | Activation | forward | backward(y) |
//! |---|---|---|
//! | ReLU | `max(0, x)` | `1` if `y > 0` else `0` |
//! | LeakyReLU(α) | `x` or `α·x` | `1` if `y > 0` else `α` |
//! | Sigmoid | `1/(1+e^-x)` | `y(1-y)` |
//! | Tanh | `tanh x` | `1-y²` |
//! | Softmax | stabilised row softmax | `y(1-y)` (diagonal only) |

use serde_json::{Map, Value};

use crate::error::{ModelError, Result};
use crate::tensors::Tensor;

pub const DEFAULT_LEAKY_ALPHA: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Relu,
    LeakyRelu { alpha: f64 },
    Sigmoid,
    Tanh,
    Softmax,
}

impl Activation {
    /// Applies the activation elementwise (row-wise for softmax).
    #[must_use]
    pub fn forward(&self, x: &Tensor) -> Tensor {
        match *self {
            Self::Relu => x.map(|v| if v > 0.0 { v } else { 0.0 }),
            Self::LeakyRelu { alpha } => x.map(|v| if v > 0.0 { v } else { alpha * v }),
            Self::Sigmoid => x.map(|v| 1.0 / (1.0 + (-v).exp())),
            Self::Tanh => x.map(f64::tanh),
            Self::Softmax => softmax(x),
        }
    }

    /// Local derivative evaluated at `y = forward(x)`.
    #[must_use]
    pub fn backward(&self, y: &Tensor) -> Tensor {
        match *self {
            Self::Relu => y.map(|v| if v > 0.0 { 1.0 } else { 0.0 }),
            Self::LeakyRelu { alpha } => y.map(|v| if v > 0.0 { 1.0 } else { alpha }),
            Self::Sigmoid | Self::Softmax => y.map(|v| v * (1.0 - v)),
            Self::Tanh => y.map(|v| 1.0 - v * v),
        }
    }

    /// Tag written to model files.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Relu => "ReLU",
            Self::LeakyRelu { .. } => "LeakyReLU",
            Self::Sigmoid => "Sigmoid",
            Self::Tanh => "Tanh",
            Self::Softmax => "Softmax",
        }
    }

    /// Looks an activation up by its file tag. `LeakyReLU` uses [`DEFAULT_LEAKY_ALPHA`].
    ///
    /// # Errors
    /// Returns [`ModelError::UnknownVariant`] for an unrecognised name.
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "ReLU" => Self::Relu,
            "LeakyReLU" => Self::LeakyRelu {
                alpha: DEFAULT_LEAKY_ALPHA,
            },
            "Sigmoid" => Self::Sigmoid,
            "Tanh" => Self::Tanh,
            "Softmax" => Self::Softmax,
            other => return Err(ModelError::unknown("activation", other)),
        })
    }

    /// Writes the tag under `key`, plus `{key}_alpha` for leaky ReLU.
    pub(crate) fn save_into(&self, config: &mut Map<String, Value>, key: &str) {
        config.insert(key.to_owned(), Value::from(self.name()));
        if let Self::LeakyRelu { alpha } = self {
            config.insert(format!("{key}_alpha"), Value::from(*alpha));
        }
    }

    pub(crate) fn load_from(config: &Map<String, Value>, key: &str, owner: &str) -> Result<Self> {
        let name = config
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| ModelError::config(owner, key))?;
        let mut activation = Self::from_name(name)?;
        if let Self::LeakyRelu { alpha } = &mut activation {
            if let Some(a) = config.get(&format!("{key}_alpha")).and_then(Value::as_f64) {
                *alpha = a;
            }
        }
        Ok(activation)
    }
}

fn softmax(x: &Tensor) -> Tensor {
    let width = x.shape().last().copied().unwrap_or(1).max(1);
    let mut data = x.data().to_vec();
    for row in data.chunks_mut(width) {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
    Tensor::new(x.shape().to_vec(), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0]);
        let y = Activation::Softmax.forward(&x);
        for r in 0..2 {
            let s: f64 = y.row(r).unwrap_or_default().iter().sum();
            assert!((s - 1.0).abs() < 1e-12);
        }
        assert!((y.get(&[1, 0]) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn leaky_alpha_round_trips_through_config() {
        let mut config = Map::new();
        Activation::LeakyRelu { alpha: 0.2 }.save_into(&mut config, "activation");
        let back = Activation::load_from(&config, "activation", "test").unwrap();
        assert_eq!(back, Activation::LeakyRelu { alpha: 0.2 });
    }

    #[test]
    fn unknown_name_is_an_error() {
        assert!(Activation::from_name("Swish").is_err());
    }
}
