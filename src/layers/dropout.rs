use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use crate::error::{ModelError, Result};
use crate::modelio::{number, Config, TensorRecord, TensorSet};
use crate::tensors::Tensor;

/// Zeroes each element independently with probability `rate` while training.
///
/// Survivors are passed through unscaled (this is not inverted dropout), and
/// backward multiplies by the same mask. Outside training the layer is the
/// identity. The mask generator is seeded from the rng given at construction.
#[derive(Debug, Clone)]
pub struct Dropout {
    rate: f64,
    training: bool,
    rng: StdRng,
    mask: Option<Tensor>,
}

impl Dropout {
    /// # Panics
    /// Panics if `rate` is outside `[0, 1]`.
    pub fn new<R: Rng + ?Sized>(rate: f64, rng: &mut R) -> Self {
        assert!((0.0..=1.0).contains(&rate), "dropout rate {rate} outside [0, 1]");
        Self {
            rate,
            training: true,
            rng: StdRng::seed_from_u64(rng.random()),
            mask: None,
        }
    }

    #[must_use]
    pub const fn rate(&self) -> f64 {
        self.rate
    }

    /// Reseeds the mask generator.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    #[must_use]
    pub const fn is_training(&self) -> bool {
        self.training
    }

    /// The mask drawn by the last forward call.
    #[must_use]
    pub fn mask(&self) -> Option<&Tensor> {
        self.mask.as_ref()
    }

    pub fn forward(&mut self, input: &Tensor) -> Tensor {
        let mask = if self.training {
            let rate = self.rate;
            let rng = &mut self.rng;
            Tensor::from_fn(input.shape().to_vec(), |_| {
                if rng.random::<f64>() > rate { 1.0 } else { 0.0 }
            })
        } else {
            Tensor::ones(input.shape().to_vec())
        };
        let out = input.multiply(&mask);
        self.mask = Some(mask);
        out
    }

    /// # Panics
    /// Panics if called before [`Dropout::forward`] or if `grad` does not match the mask.
    #[must_use]
    pub fn backward(&self, grad: &Tensor) -> Tensor {
        let Some(mask) = &self.mask else {
            panic!("Dropout::backward called before forward");
        };
        grad.multiply(mask)
    }

    pub(crate) fn save(&self) -> (Config, Vec<TensorRecord>) {
        let mut config = Config::new();
        config.insert("rate".into(), Value::from(self.rate));
        (config, Vec::new())
    }

    /// The mask generator of a loaded layer is seeded from the thread rng;
    /// call [`Dropout::reseed`] (or [`crate::network::Network::reseed`]) for
    /// reproducible masks.
    pub(crate) fn load(config: &Config, tensors: TensorSet) -> Result<Self> {
        let rate = number(config, "rate", "Dropout")?;
        if !(0.0..=1.0).contains(&rate) {
            return Err(ModelError::config("Dropout", "rate"));
        }
        tensors.finish()?;
        Ok(Self::new(rate, &mut rand::rng()))
    }
}

impl From<Dropout> for super::Layer {
    fn from(layer: Dropout) -> Self {
        Self::Dropout(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backward_reuses_forward_mask() {
        let mut layer = Dropout::new(0.5, &mut StdRng::seed_from_u64(3));
        let input = Tensor::ones(vec![4, 8]);
        let out = layer.forward(&input);
        let grad = layer.backward(&Tensor::filled(vec![4, 8], 2.0));
        for (o, g) in out.data().iter().zip(grad.data()) {
            assert_eq!(*g, 2.0 * *o);
        }
    }

    #[test]
    fn rate_zero_keeps_everything() {
        let mut layer = Dropout::new(0.0, &mut StdRng::seed_from_u64(3));
        let input = Tensor::filled(vec![16], 3.0);
        assert_eq!(layer.forward(&input), input);
    }

    #[test]
    fn inference_is_identity() {
        let mut layer = Dropout::new(1.0, &mut StdRng::seed_from_u64(3));
        layer.set_training(false);
        let input = Tensor::filled(vec![5], 1.5);
        assert_eq!(layer.forward(&input), input);
    }
}
