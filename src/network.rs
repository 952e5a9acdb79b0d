//! Layer stack plus the training loop.
//!
//! One training step is a fixed cycle:
//!
//! ```text
//! forward → loss → backward → regularise → optimise → zero gradients
//! ```
//!
//! Samples are processed one at a time; there is no batching across samples
//! in the training loop (a single sample may itself carry a batch dimension).

use std::collections::HashSet;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::error::{ModelError, Result};
use crate::layers::Layer;
use crate::loss::Loss;
use crate::modelio::{self, LayerRecord, Metadata, Model};
use crate::optimiser::Optimiser;
use crate::regularisation::Regulariser;
use crate::tensors::{Tensor, TensorId};

#[derive(Debug, Clone)]
pub struct Network {
    layers: Vec<Layer>,
    optimiser: Optimiser,
    loss: Loss,
    regulariser: Option<Regulariser>,
}

impl Network {
    #[must_use]
    pub const fn new(
        layers: Vec<Layer>,
        optimiser: Optimiser,
        loss: Loss,
        regulariser: Option<Regulariser>,
    ) -> Self {
        Self {
            layers,
            optimiser,
            loss,
            regulariser,
        }
    }

    pub fn add_layer(&mut self, layer: impl Into<Layer>) {
        self.layers.push(layer.into());
    }

    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    #[must_use]
    pub const fn optimiser(&self) -> &Optimiser {
        &self.optimiser
    }

    #[must_use]
    pub const fn loss(&self) -> Loss {
        self.loss
    }

    #[must_use]
    pub const fn regulariser(&self) -> Option<&Regulariser> {
        self.regulariser.as_ref()
    }

    /// Runs `input` through every layer in order.
    pub fn forward(&mut self, input: &Tensor) -> Tensor {
        self.layers
            .iter_mut()
            .fold(input.clone(), |x, layer| layer.forward(&x))
    }

    /// Runs the loss gradient back through every layer in reverse order,
    /// returning the gradient with respect to the network input.
    pub fn backward(&mut self, grad: &Tensor) -> Tensor {
        self.layers
            .iter_mut()
            .rev()
            .fold(grad.clone(), |g, layer| layer.backward(&g))
    }

    /// Adds the regulariser's correction to every weight and bias gradient.
    pub fn regularise(&mut self) {
        let Some(regulariser) = &self.regulariser else {
            return;
        };
        for layer in self.layers.iter_mut().filter(|l| l.requires_regularisation()) {
            let (weights, biases) = layer.parameters_mut();
            for p in weights.into_iter().chain(biases) {
                regulariser.apply(&p.value, &mut p.grad);
            }
        }
    }

    /// Regularisation penalty summed over every regularised weight and bias tensor.
    #[must_use]
    pub fn penalty(&self) -> f64 {
        let Some(regulariser) = &self.regulariser else {
            return 0.0;
        };
        self.layers
            .iter()
            .filter(|l| l.requires_regularisation())
            .flat_map(|l| [l.weights(), l.biases()])
            .flatten()
            .map(|w| regulariser.penalty(&w))
            .sum()
    }

    /// Applies one optimiser step to every parameter.
    pub fn optimise(&mut self) {
        let mut live = HashSet::new();
        for layer in self.layers.iter_mut().filter(|l| l.requires_optimisation()) {
            let (weights, biases) = layer.parameters_mut();
            for p in weights.into_iter().chain(biases) {
                self.optimiser.update(&mut p.value, &p.grad);
                live.insert(p.value.id());
            }
        }
        if self.optimiser.tracked() > live.len() {
            self.prune(&live);
        }
    }

    fn prune(&mut self, live: &HashSet<TensorId>) {
        let before = self.optimiser.tracked();
        self.optimiser.retain(live);
        debug!(dropped = before - self.optimiser.tracked(), "stale optimiser state pruned");
    }

    pub fn zero_gradients(&mut self) {
        for layer in self.layers.iter_mut().filter(|l| l.requires_optimisation()) {
            let (weights, biases) = layer.parameters_mut();
            for p in weights.into_iter().chain(biases) {
                self.optimiser.zero_gradients(&mut p.grad);
            }
        }
    }

    /// One full cycle on a single sample, returning its summed loss.
    pub fn train_step(&mut self, input: &Tensor, target: &Tensor) -> f64 {
        let output = self.forward(input);
        let (loss, grad) = self.loss.compute(&output, target);
        self.backward(&grad);
        self.regularise();
        self.optimise();
        self.zero_gradients();
        loss.sum()
    }

    /// Trains for `epochs` passes over `data`/`targets`.
    ///
    /// Returns the sum over epochs of each epoch's mean per-sample loss. Zero
    /// epochs or an empty data set return `0.0` without touching any state.
    ///
    /// # Panics
    /// Panics if `data` and `targets` differ in length.
    pub fn train(&mut self, data: &[Tensor], targets: &[Tensor], epochs: usize) -> f64 {
        assert_eq!(
            data.len(),
            targets.len(),
            "{} inputs but {} targets",
            data.len(),
            targets.len()
        );
        if epochs == 0 || data.is_empty() {
            return 0.0;
        }
        self.set_training(true);

        #[allow(clippy::cast_precision_loss)]
        let samples = data.len() as f64;
        let mut total = 0.0;
        for epoch in 0..epochs {
            let mut epoch_loss = 0.0;
            for (sample, (input, target)) in data.iter().zip(targets).enumerate() {
                let loss = self.train_step(input, target);
                debug!(epoch, sample, loss, "sample trained");
                epoch_loss += loss;
            }
            let loss = epoch_loss / samples;
            info!(epoch, loss, "epoch complete");
            total += loss;
        }
        total
    }

    /// Forward pass with training behaviour switched off. No gradients or
    /// optimiser state are touched; recurrent layers still advance their state.
    /// Each layer's training flag is restored afterwards.
    pub fn predict(&mut self, input: &Tensor) -> Tensor {
        let modes: Vec<bool> = self.layers.iter().map(Layer::is_training).collect();
        self.set_training(false);
        let output = self.forward(input);
        for (layer, training) in self.layers.iter_mut().zip(modes) {
            layer.set_training(training);
        }
        output
    }

    pub fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }

    /// Reseeds every dropout layer from one seed, in layer order.
    pub fn reseed(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for layer in &mut self.layers {
            layer.reseed(rng.random());
        }
    }

    /// Clears the hidden state of every recurrent layer.
    pub fn reset_state(&mut self) {
        for layer in &mut self.layers {
            layer.reset_state();
        }
    }

    /// Snapshot of the network as a serialisable model.
    #[must_use]
    pub fn to_model(&self, name: &str, dataset_name: &str, total_loss: f64) -> Model {
        let layers = self
            .layers
            .iter()
            .map(|layer| {
                let (config, tensors) = layer.save();
                LayerRecord {
                    layer_name: layer.name().to_owned(),
                    config,
                    tensors,
                }
            })
            .collect();
        Model {
            metadata: Metadata::new(name, dataset_name, total_loss),
            layers,
            optimiser: Some(self.optimiser.save()),
            loss_function: Some(self.loss.save()),
            regularisation: self.regulariser.as_ref().map(Regulariser::save),
        }
    }

    /// Rebuilds a network from a model. Optimiser state starts empty.
    ///
    /// # Errors
    /// Fails on a missing optimiser or loss section or on any invalid layer.
    pub fn from_model(model: Model) -> Result<Self> {
        let optimiser = model
            .optimiser
            .as_ref()
            .ok_or(ModelError::MissingSection("optimiser"))
            .and_then(Optimiser::load)?;
        let loss = model
            .loss_function
            .as_ref()
            .ok_or(ModelError::MissingSection("lossFunction"))
            .and_then(Loss::load)?;
        let regulariser = model.regularisation.as_ref().map(Regulariser::load).transpose()?;
        let layers = model
            .layers
            .into_iter()
            .map(|record| Layer::load(&record.layer_name, &record.config, record.tensors))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(layers, optimiser, loss, regulariser))
    }

    /// # Errors
    /// Fails if serialisation fails.
    pub fn to_json(&self, name: &str, dataset_name: &str, total_loss: f64) -> Result<String> {
        self.to_model(name, dataset_name, total_loss).to_json()
    }

    /// # Errors
    /// Fails on malformed JSON or an invalid model.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_model(Model::from_json(json)?)
    }

    /// Writes the network to `path` as JSON.
    ///
    /// # Errors
    /// Fails if the file cannot be written.
    pub fn save(
        &self,
        path: impl AsRef<Path>,
        name: &str,
        dataset_name: &str,
        total_loss: f64,
    ) -> Result<()> {
        modelio::save_model(path, &self.to_model(name, dataset_name, total_loss))
    }

    /// Reads a network previously written by [`Network::save`].
    ///
    /// Dropout masks of the loaded network are not reproducible until
    /// [`Network::reseed`] is called.
    ///
    /// # Errors
    /// Fails if the file cannot be read or does not describe a valid network.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_model(modelio::load_model(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;

    fn tiny() -> Network {
        let mut rng = StdRng::seed_from_u64(11);
        Network::new(
            vec![Layer::fully_connected(2, 1, Activation::Sigmoid, &mut rng)],
            Optimiser::sgd(0.1),
            Loss::MeanSquaredError,
            None,
        )
    }

    #[test]
    fn gradients_are_zero_after_a_step() {
        let mut net = tiny();
        net.train_step(&Tensor::new(vec![1, 2], vec![1.0, 0.0]), &Tensor::new(vec![1, 1], vec![1.0]));
        let grads = net.layers()[0].gradients().unwrap();
        assert!(grads.data().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn replaced_weights_drop_stale_state() {
        let mut net = Network::new(
            tiny().layers.clone(),
            Optimiser::adam(0.01, 0.9, 0.999, 1e-8),
            Loss::MeanSquaredError,
            None,
        );
        let x = Tensor::new(vec![1, 2], vec![1.0, 1.0]);
        let y = Tensor::new(vec![1, 1], vec![0.0]);
        net.train_step(&x, &y);
        assert_eq!(net.optimiser().tracked(), 2);

        let w = net.layers()[0].weights().unwrap();
        net.layers_mut()[0].set_weights(&w);
        net.train_step(&x, &y);
        assert_eq!(net.optimiser().tracked(), 2);
    }

    #[test]
    fn missing_loss_section_is_an_error() {
        let mut model = tiny().to_model("m", "d", 0.0);
        model.loss_function = None;
        assert!(matches!(
            Network::from_model(model),
            Err(ModelError::MissingSection("lossFunction"))
        ));
    }
}
