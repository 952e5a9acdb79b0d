//! Parameter update rules.
//!
//! # Optimisers
//!
//! An [`Optimiser`] mutates a parameter tensor in place from its gradient.
//! Stateful rules keep their running vectors in a table keyed by the
//! parameter's [`TensorId`]:
//!
//! - state is created lazily (zero-filled) the first time an id is updated;
//! - it always has exactly as many elements as the parameter;
//! - [`Optimiser::zero_gradients`] only clears a gradient buffer and never
//!   touches this table.
//!
//! A parameter that is replaced (for example after loading weights) gets a
//! new id and starts from fresh state; the old entry is simply never read
//! again. [`Optimiser::retain`] drops such entries.
//!
//! ## Update rules
//!
//! | Rule | update |
//! |---|---|
//! | SGD | `w -= lr·g` |
//! | SGD with momentum | `v = μ·v - lr·g; w += v` |
//! | RMSProp | `s = β·s + (1-β)·g²; w -= lr·g/(√s+ε)` |
//! | Adam | bias-corrected first/second moments, per-id step count |

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ModelError, Result};
use crate::modelio::number;
use crate::tensors::{Tensor, TensorId};

/// Plain gradient descent.
#[derive(Debug, Clone, PartialEq)]
pub struct Sgd {
    pub learning_rate: f64,
}

/// Gradient descent with a velocity term.
#[derive(Debug, Clone)]
pub struct SgdMomentum {
    pub learning_rate: f64,
    pub momentum: f64,
    velocity: HashMap<TensorId, Vec<f64>>,
}

/// Root-mean-square propagation.
#[derive(Debug, Clone)]
pub struct RmsProp {
    pub learning_rate: f64,
    pub beta: f64,
    pub epsilon: f64,
    mean_square: HashMap<TensorId, Vec<f64>>,
}

#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f64>,
    v: Vec<f64>,
    step: i32,
}

/// Adaptive moment estimation.
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    moments: HashMap<TensorId, Moments>,
}

#[derive(Debug, Clone)]
pub enum Optimiser {
    Sgd(Sgd),
    SgdMomentum(SgdMomentum),
    RmsProp(RmsProp),
    Adam(Adam),
}

/// Fetches (or zero-initialises) the state for `weights`.
fn slot<'a>(table: &'a mut HashMap<TensorId, Vec<f64>>, weights: &Tensor) -> &'a mut Vec<f64> {
    let state = table.entry(weights.id()).or_insert_with(|| {
        debug!(id = weights.id().get(), len = weights.size(), "optimiser state created");
        vec![0.0; weights.size()]
    });
    assert_eq!(
        state.len(),
        weights.size(),
        "optimiser state out of sync with parameter {:?}",
        weights.shape()
    );
    state
}

impl Optimiser {
    #[must_use]
    pub fn sgd(learning_rate: f64) -> Self {
        Self::Sgd(Sgd { learning_rate })
    }

    #[must_use]
    pub fn sgd_momentum(learning_rate: f64, momentum: f64) -> Self {
        Self::SgdMomentum(SgdMomentum {
            learning_rate,
            momentum,
            velocity: HashMap::new(),
        })
    }

    #[must_use]
    pub fn rms_prop(learning_rate: f64, beta: f64, epsilon: f64) -> Self {
        Self::RmsProp(RmsProp {
            learning_rate,
            beta,
            epsilon,
            mean_square: HashMap::new(),
        })
    }

    #[must_use]
    pub fn adam(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self::Adam(Adam {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            moments: HashMap::new(),
        })
    }

    /// Zero-fills a gradient buffer. Optimiser state is left untouched.
    pub fn zero_gradients(&self, gradients: &mut Tensor) {
        gradients.fill_zero();
    }

    /// Applies one update step to `weights` in place.
    ///
    /// # Panics
    /// Panics if `weights` and `gradients` hold a different number of elements.
    pub fn update(&mut self, weights: &mut Tensor, gradients: &Tensor) {
        assert_eq!(
            weights.size(),
            gradients.size(),
            "optimiser: {:?} weights vs {:?} gradients",
            weights.shape(),
            gradients.shape()
        );
        let g = gradients.data();
        match self {
            Self::Sgd(o) => {
                for (w, &g) in weights.data_mut().iter_mut().zip(g) {
                    *w -= o.learning_rate * g;
                }
            }
            Self::SgdMomentum(o) => {
                let velocity = slot(&mut o.velocity, weights);
                for ((w, v), &g) in weights.data_mut().iter_mut().zip(velocity.iter_mut()).zip(g) {
                    *v = o.momentum * *v - o.learning_rate * g;
                    *w += *v;
                }
            }
            Self::RmsProp(o) => {
                let mean_square = slot(&mut o.mean_square, weights);
                for ((w, s), &g) in weights.data_mut().iter_mut().zip(mean_square.iter_mut()).zip(g) {
                    *s = o.beta * *s + (1.0 - o.beta) * g * g;
                    *w -= o.learning_rate * g / (s.sqrt() + o.epsilon);
                }
            }
            Self::Adam(o) => {
                let moments = o.moments.entry(weights.id()).or_insert_with(|| {
                    debug!(id = weights.id().get(), len = weights.size(), "optimiser state created");
                    Moments {
                        m: vec![0.0; weights.size()],
                        v: vec![0.0; weights.size()],
                        step: 0,
                    }
                });
                assert_eq!(
                    moments.m.len(),
                    weights.size(),
                    "optimiser state out of sync with parameter {:?}",
                    weights.shape()
                );
                moments.step += 1;
                let correction1 = 1.0 - o.beta1.powi(moments.step);
                let correction2 = 1.0 - o.beta2.powi(moments.step);
                for (i, w) in weights.data_mut().iter_mut().enumerate() {
                    moments.m[i] = o.beta1 * moments.m[i] + (1.0 - o.beta1) * g[i];
                    moments.v[i] = o.beta2 * moments.v[i] + (1.0 - o.beta2) * g[i] * g[i];
                    let m_hat = moments.m[i] / correction1;
                    let v_hat = moments.v[i] / correction2;
                    *w -= o.learning_rate * m_hat / (v_hat.sqrt() + o.epsilon);
                }
            }
        }
    }

    /// Number of parameters with live state.
    #[must_use]
    pub fn tracked(&self) -> usize {
        match self {
            Self::Sgd(_) => 0,
            Self::SgdMomentum(o) => o.velocity.len(),
            Self::RmsProp(o) => o.mean_square.len(),
            Self::Adam(o) => o.moments.len(),
        }
    }

    /// Adam step count for `id`, if it has been updated.
    #[must_use]
    pub fn step_count(&self, id: TensorId) -> Option<i32> {
        match self {
            Self::Adam(o) => o.moments.get(&id).map(|m| m.step),
            _ => None,
        }
    }

    /// Drops state for every id not in `live`.
    pub fn retain(&mut self, live: &HashSet<TensorId>) {
        match self {
            Self::Sgd(_) => {}
            Self::SgdMomentum(o) => o.velocity.retain(|id, _| live.contains(id)),
            Self::RmsProp(o) => o.mean_square.retain(|id, _| live.contains(id)),
            Self::Adam(o) => o.moments.retain(|id, _| live.contains(id)),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sgd(_) => "SGD",
            Self::SgdMomentum(_) => "SGDWithMomentum",
            Self::RmsProp(_) => "RMSProp",
            Self::Adam(_) => "Adam",
        }
    }

    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Sgd(o) => o.learning_rate,
            Self::SgdMomentum(o) => o.learning_rate,
            Self::RmsProp(o) => o.learning_rate,
            Self::Adam(o) => o.learning_rate,
        }
    }

    /// Hyperparameters as a model-file section. Running state is not persisted.
    #[must_use]
    pub fn save(&self) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert("type".into(), Value::from(self.name()));
        config.insert("learning_rate".into(), Value::from(self.learning_rate()));
        match self {
            Self::Sgd(_) => {}
            Self::SgdMomentum(o) => {
                config.insert("momentum".into(), Value::from(o.momentum));
            }
            Self::RmsProp(o) => {
                config.insert("beta".into(), Value::from(o.beta));
                config.insert("epsilon".into(), Value::from(o.epsilon));
            }
            Self::Adam(o) => {
                config.insert("beta1".into(), Value::from(o.beta1));
                config.insert("beta2".into(), Value::from(o.beta2));
                config.insert("epsilon".into(), Value::from(o.epsilon));
            }
        }
        config
    }

    /// Rebuilds an optimiser with empty state from a model-file section.
    ///
    /// # Errors
    /// Fails on a missing `type`, an unknown type, or a missing hyperparameter.
    pub fn load(config: &Map<String, Value>) -> Result<Self> {
        const OWNER: &str = "optimiser";
        let tag = config
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ModelError::config(OWNER, "type"))?;
        let lr = || number(config, "learning_rate", OWNER);
        Ok(match tag {
            "SGD" => Self::sgd(lr()?),
            "SGDWithMomentum" => Self::sgd_momentum(lr()?, number(config, "momentum", OWNER)?),
            "RMSProp" => Self::rms_prop(
                lr()?,
                number(config, "beta", OWNER)?,
                number(config, "epsilon", OWNER)?,
            ),
            "Adam" => Self::adam(
                lr()?,
                number(config, "beta1", OWNER)?,
                number(config, "beta2", OWNER)?,
                number(config, "epsilon", OWNER)?,
            ),
            other => return Err(ModelError::unknown("optimiser", other)),
        })
    }
}
