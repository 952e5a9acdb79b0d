use rand::Rng;
use serde_json::Value;

use crate::error::Result;
use crate::modelio::{count, Config, TensorRecord, TensorSet};
use crate::tensors::{Tensor, WithGrad};

use super::Params;

/// Lookup table from integer token ids to dense vectors.
///
/// Forward takes a tensor of `n` ids (any shape, whole-number values) and
/// returns `[n, embed_size]`. Backward scatter-adds each row gradient into the
/// table row it came from and returns an empty tensor, since ids carry no gradient.
#[derive(Debug, Clone)]
pub struct Embedding {
    weights: WithGrad<Tensor>,
    indices: Option<Vec<usize>>,
}

impl Embedding {
    /// Table entries are drawn uniformly from `[-1, 1)`.
    pub fn new<R: Rng + ?Sized>(vocab_size: usize, embed_size: usize, rng: &mut R) -> Self {
        Self {
            weights: WithGrad::new(Tensor::random(vec![vocab_size, embed_size], rng)),
            indices: None,
        }
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.weights.value.shape()[0]
    }

    #[must_use]
    pub fn embed_size(&self) -> usize {
        self.weights.value.shape()[1]
    }

    fn token(&self, id: f64) -> usize {
        assert!(
            id >= 0.0 && id.fract() == 0.0,
            "embedding index {id} is not a non-negative whole number"
        );
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let id = id as usize;
        assert!(
            id < self.vocab_size(),
            "embedding index {id} out of range for vocabulary of {}",
            self.vocab_size()
        );
        id
    }

    /// # Panics
    /// Panics if any id is negative, fractional, or not below `vocab_size`.
    pub fn forward(&mut self, input: &Tensor) -> Tensor {
        let indices: Vec<usize> = input.data().iter().map(|&id| self.token(id)).collect();
        let width = self.embed_size();
        let mut data = Vec::with_capacity(indices.len() * width);
        for &id in &indices {
            data.extend_from_slice(self.weights.value.row(id).unwrap_or_default());
        }
        let out = Tensor::new(vec![indices.len(), width], data);
        self.indices = Some(indices);
        out
    }

    /// # Panics
    /// Panics if called before [`Embedding::forward`] or if `grad` is not `[n, embed_size]`.
    pub fn backward(&mut self, grad: &Tensor) -> Tensor {
        let Some(indices) = &self.indices else {
            panic!("Embedding::backward called before forward");
        };
        let width = self.weights.value.shape()[1];
        assert_eq!(
            grad.shape(),
            &[indices.len(), width],
            "Embedding gradient shape mismatch"
        );
        for (row, &id) in grad.data().chunks(width.max(1)).zip(indices) {
            self.weights.grad.add_row(id, row);
        }
        Tensor::empty()
    }

    pub(crate) fn params(&self) -> (Vec<&WithGrad<Tensor>>, Vec<&WithGrad<Tensor>>) {
        (vec![&self.weights], Vec::new())
    }

    pub(crate) fn params_mut(&mut self) -> Params<'_> {
        (vec![&mut self.weights], Vec::new())
    }

    pub(crate) fn save(&self) -> (Config, Vec<TensorRecord>) {
        let mut config = Config::new();
        config.insert("vocab_size".into(), Value::from(self.vocab_size()));
        config.insert("embed_size".into(), Value::from(self.embed_size()));
        (config, vec![TensorRecord::from_tensor("Weights", &self.weights.value)])
    }

    pub(crate) fn load(config: &Config, mut tensors: TensorSet) -> Result<Self> {
        const OWNER: &str = "Embedding";
        let vocab_size = count(config, "vocab_size", OWNER)?;
        let embed_size = count(config, "embed_size", OWNER)?;
        let weights = tensors.take_shaped("Weights", &[vocab_size, embed_size])?;
        tensors.finish()?;
        Ok(Self {
            weights: WithGrad::new(weights),
            indices: None,
        })
    }
}

impl From<Embedding> for super::Layer {
    fn from(layer: Embedding) -> Self {
        Self::Embedding(layer)
    }
}
