use serde_json::Value;

use crate::error::Result;
use crate::modelio::{dims, Config, TensorRecord, TensorSet};
use crate::tensors::Tensor;

fn save_shapes(input: &[usize], output: &[usize]) -> (Config, Vec<TensorRecord>) {
    let mut config = Config::new();
    config.insert("input_shape".into(), Value::from(input.to_vec()));
    config.insert("output_shape".into(), Value::from(output.to_vec()));
    (config, Vec::new())
}

/// Collapses `[batch, d1, d2, ..]` into `[batch, d1·d2·..]`.
///
/// The shapes given at construction are the expected ones; forward records the
/// actual input shape so that backward can restore it.
#[derive(Debug, Clone)]
pub struct Flatten {
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl Flatten {
    /// # Panics
    /// Panics if `input_shape` is empty.
    #[must_use]
    pub fn new(input_shape: impl Into<Vec<usize>>) -> Self {
        let input_shape = input_shape.into();
        let output_shape = Self::flat_shape(&input_shape);
        Self {
            input_shape,
            output_shape,
        }
    }

    fn flat_shape(shape: &[usize]) -> Vec<usize> {
        assert!(!shape.is_empty(), "Flatten needs at least a batch dimension");
        vec![shape[0], shape[1..].iter().product()]
    }

    #[must_use]
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    #[must_use]
    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    pub fn forward(&mut self, input: &Tensor) -> Tensor {
        self.input_shape = input.shape().to_vec();
        self.output_shape = Self::flat_shape(&self.input_shape);
        input.reshape(self.output_shape.clone())
    }

    /// # Panics
    /// Panics if `grad` does not hold as many elements as the last input.
    #[must_use]
    pub fn backward(&self, grad: &Tensor) -> Tensor {
        grad.reshape(self.input_shape.clone())
    }

    pub(crate) fn save(&self) -> (Config, Vec<TensorRecord>) {
        save_shapes(&self.input_shape, &self.output_shape)
    }

    pub(crate) fn load(config: &Config, tensors: TensorSet) -> Result<Self> {
        const OWNER: &str = "Flatten";
        let input_shape = dims(config, "input_shape", OWNER)?;
        let output_shape = dims(config, "output_shape", OWNER)?;
        tensors.finish()?;
        Ok(Self {
            input_shape,
            output_shape,
        })
    }
}

/// Reinterprets its input with a fixed output shape; backward restores the
/// shape of the most recent input.
#[derive(Debug, Clone)]
pub struct Reshape {
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl Reshape {
    #[must_use]
    pub fn new(input_shape: impl Into<Vec<usize>>, output_shape: impl Into<Vec<usize>>) -> Self {
        Self {
            input_shape: input_shape.into(),
            output_shape: output_shape.into(),
        }
    }

    #[must_use]
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    #[must_use]
    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    /// # Panics
    /// Panics if `input` does not hold as many elements as the output shape.
    pub fn forward(&mut self, input: &Tensor) -> Tensor {
        self.input_shape = input.shape().to_vec();
        input.reshape(self.output_shape.clone())
    }

    /// # Panics
    /// Panics if `grad` does not hold as many elements as the last input.
    #[must_use]
    pub fn backward(&self, grad: &Tensor) -> Tensor {
        grad.reshape(self.input_shape.clone())
    }

    pub(crate) fn save(&self) -> (Config, Vec<TensorRecord>) {
        save_shapes(&self.input_shape, &self.output_shape)
    }

    pub(crate) fn load(config: &Config, tensors: TensorSet) -> Result<Self> {
        const OWNER: &str = "Reshape";
        let input_shape = dims(config, "input_shape", OWNER)?;
        let output_shape = dims(config, "output_shape", OWNER)?;
        tensors.finish()?;
        Ok(Self::new(input_shape, output_shape))
    }
}

impl From<Flatten> for super::Layer {
    fn from(layer: Flatten) -> Self {
        Self::Flatten(layer)
    }
}

impl From<Reshape> for super::Layer {
    fn from(layer: Reshape) -> Self {
        Self::Reshape(layer)
    }
}
