//! Weight penalties.
//!
//! A regulariser adds the derivative of its penalty to an existing gradient
//! buffer in place ([`Regulariser::apply`]) and can report the penalty
//! itself ([`Regulariser::penalty`]). `sign(0)` is taken as `0`.

use serde_json::{Map, Value};

use crate::error::{ModelError, Result};
use crate::modelio::number;
use crate::tensors::Tensor;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Regulariser {
    /// Adds `λ·sign(w)`; penalty `λ·|w|`.
    L1 { lambda: f64 },
    /// Adds `λ·w`; penalty `0.5·λ·w²`.
    ///
    /// The penalty carries the `0.5` so that [`Regulariser::apply`] adds its
    /// exact derivative. Plain `λ·w²` would report twice the loss the
    /// gradient step actually minimises.
    L2 { lambda: f64 },
    /// Adds `λ1·sign(w) + λ2·w`; penalty `λ1·|w| + 0.5·λ2·w²`.
    ElasticNet { lambda1: f64, lambda2: f64 },
}

fn sign(w: f64) -> f64 {
    if w > 0.0 {
        1.0
    } else if w < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl Regulariser {
    /// Adds the penalty derivative for `weights` into `gradients`.
    ///
    /// # Panics
    /// Panics if the two tensors hold a different number of elements.
    pub fn apply(&self, weights: &Tensor, gradients: &mut Tensor) {
        assert_eq!(
            weights.size(),
            gradients.size(),
            "regulariser: {:?} weights vs {:?} gradients",
            weights.shape(),
            gradients.shape()
        );
        for (g, &w) in gradients.data_mut().iter_mut().zip(weights.data()) {
            *g += self.derivative(w);
        }
    }

    fn derivative(&self, w: f64) -> f64 {
        match *self {
            Self::L1 { lambda } => lambda * sign(w),
            Self::L2 { lambda } => lambda * w,
            Self::ElasticNet { lambda1, lambda2 } => lambda1 * sign(w) + lambda2 * w,
        }
    }

    /// Penalty contributed to the loss by `weights`.
    #[must_use]
    pub fn penalty(&self, weights: &Tensor) -> f64 {
        let w = weights.data().iter();
        match *self {
            Self::L1 { lambda } => w.map(|v| lambda * v.abs()).sum(),
            Self::L2 { lambda } => w.map(|v| 0.5 * lambda * v * v).sum(),
            Self::ElasticNet { lambda1, lambda2 } => w
                .map(|v| lambda1 * v.abs() + 0.5 * lambda2 * v * v)
                .sum(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::L1 { .. } => "L1",
            Self::L2 { .. } => "L2",
            Self::ElasticNet { .. } => "ElasticNet",
        }
    }

    #[must_use]
    pub fn save(&self) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert("type".into(), Value::from(self.name()));
        match *self {
            Self::L1 { lambda } | Self::L2 { lambda } => {
                config.insert("lambda".into(), Value::from(lambda));
            }
            Self::ElasticNet { lambda1, lambda2 } => {
                config.insert("lambda1".into(), Value::from(lambda1));
                config.insert("lambda2".into(), Value::from(lambda2));
            }
        }
        config
    }

    /// # Errors
    /// Fails on a missing `type`, an unknown type, or a missing coefficient.
    pub fn load(config: &Map<String, Value>) -> Result<Self> {
        const OWNER: &str = "regularisation";
        let tag = config
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ModelError::config(OWNER, "type"))?;
        Ok(match tag {
            "L1" => Self::L1 {
                lambda: number(config, "lambda", OWNER)?,
            },
            "L2" => Self::L2 {
                lambda: number(config, "lambda", OWNER)?,
            },
            "ElasticNet" => Self::ElasticNet {
                lambda1: number(config, "lambda1", OWNER)?,
                lambda2: number(config, "lambda2", OWNER)?,
            },
            other => return Err(ModelError::unknown("regulariser", other)),
        })
    }
}
