use rand::Rng;
use serde_json::Value;

use crate::activation::Activation;
use crate::error::Result;
use crate::modelio::{count, Config, TensorRecord, TensorSet};
use crate::tensors::{Tensor, WithGrad};

use super::Params;

/// Affine map followed by an activation: `y = act(x·W + b)`.
///
/// Input is `[batch, input_dim]`, output `[batch, output_dim]`. Weights are
/// Xavier-initialised, biases start at zero and are broadcast across the batch.
#[derive(Debug, Clone)]
pub struct FullyConnected {
    weights: WithGrad<Tensor>,
    biases: WithGrad<Tensor>,
    activation: Activation,
    input: Option<Tensor>,
    output: Option<Tensor>,
}

impl FullyConnected {
    pub fn new<R: Rng + ?Sized>(input_dim: usize, output_dim: usize, activation: Activation, rng: &mut R) -> Self {
        Self {
            weights: WithGrad::new(Tensor::xavier(input_dim, output_dim, rng)),
            biases: WithGrad::new(Tensor::zeros(vec![1, output_dim])),
            activation,
            input: None,
            output: None,
        }
    }

    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.weights.value.shape()[0]
    }

    #[must_use]
    pub fn output_dim(&self) -> usize {
        self.weights.value.shape()[1]
    }

    #[must_use]
    pub const fn activation(&self) -> Activation {
        self.activation
    }

    /// # Panics
    /// Panics if `input` is not `[batch, input_dim]`.
    pub fn forward(&mut self, input: &Tensor) -> Tensor {
        let z = input.dot(&self.weights.value).add_row_broadcast(&self.biases.value);
        let y = self.activation.forward(&z);
        self.input = Some(input.clone());
        self.output = Some(y.clone());
        y
    }

    /// Accumulates `dW = xᵀ·δ` and `db = Σ_batch δ`, returns `δ·Wᵀ`,
    /// where `δ = grad ⊙ act'(y)`.
    ///
    /// # Panics
    /// Panics if called before [`FullyConnected::forward`] or if `grad` does not
    /// match the last output's shape.
    pub fn backward(&mut self, grad: &Tensor) -> Tensor {
        let (Some(input), Some(output)) = (&self.input, &self.output) else {
            panic!("FullyConnected::backward called before forward");
        };
        let delta = grad.multiply(&self.activation.backward(output));
        self.weights.grad.accumulate(&input.transpose().dot(&delta));
        self.biases.grad.accumulate(&delta.sum_along_batch());
        delta.dot(&self.weights.value.transpose())
    }

    pub(crate) fn params(&self) -> (Vec<&WithGrad<Tensor>>, Vec<&WithGrad<Tensor>>) {
        (vec![&self.weights], vec![&self.biases])
    }

    pub(crate) fn params_mut(&mut self) -> Params<'_> {
        (vec![&mut self.weights], vec![&mut self.biases])
    }

    pub(crate) fn save(&self) -> (Config, Vec<TensorRecord>) {
        let mut config = Config::new();
        config.insert("input_dim".into(), Value::from(self.input_dim()));
        config.insert("output_dim".into(), Value::from(self.output_dim()));
        self.activation.save_into(&mut config, "activation");
        let tensors = vec![
            TensorRecord::from_tensor("Weights", &self.weights.value),
            TensorRecord::from_tensor("Biases", &self.biases.value),
        ];
        (config, tensors)
    }

    pub(crate) fn load(config: &Config, mut tensors: TensorSet) -> Result<Self> {
        const OWNER: &str = "FullyConnected";
        let input_dim = count(config, "input_dim", OWNER)?;
        let output_dim = count(config, "output_dim", OWNER)?;
        let activation = Activation::load_from(config, "activation", OWNER)?;
        let weights = tensors.take_shaped("Weights", &[input_dim, output_dim])?;
        let biases = tensors.take_shaped("Biases", &[1, output_dim])?;
        tensors.finish()?;
        Ok(Self {
            weights: WithGrad::new(weights),
            biases: WithGrad::new(biases),
            activation,
            input: None,
            output: None,
        })
    }
}

impl From<FullyConnected> for super::Layer {
    fn from(layer: FullyConnected) -> Self {
        Self::FullyConnected(layer)
    }
}
