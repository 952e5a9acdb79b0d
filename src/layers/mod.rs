//! The layer stack.
//!
//! Every layer follows the same contract: `forward` caches whatever its
//! `backward` needs and returns the transformed tensor; `backward` takes the
//! gradient with respect to its output, accumulates parameter gradients, and
//! returns the gradient with respect to its input. Calling `backward` before a
//! matching `forward` panics.
//!
//! Parameters are held as [`WithGrad`] pairs. [`Layer::parameters_mut`] hands
//! them out one by one, so optimiser state follows each tensor's identity even
//! for layers with several gate matrices.

mod conv;
mod dense;
mod dropout;
mod embedding;
mod gru;
mod lstm;
mod pool;
mod recurrent;
mod shape;

use rand::Rng;

use crate::activation::Activation;
use crate::error::{ModelError, Result};
use crate::modelio::{Config, TensorRecord, TensorSet};
use crate::tensors::{Tensor, WithGrad};

pub use conv::Conv2D;
pub use dense::FullyConnected;
pub use dropout::Dropout;
pub use embedding::Embedding;
pub use gru::Gru;
pub use lstm::Lstm;
pub use pool::{AveragePooling, MaxPooling};
pub use shape::{Flatten, Reshape};

/// Mutable weight and bias parameters of one layer.
pub type Params<'a> = (Vec<&'a mut WithGrad<Tensor>>, Vec<&'a mut WithGrad<Tensor>>);

#[derive(Debug, Clone)]
pub enum Layer {
    FullyConnected(FullyConnected),
    Conv2D(Conv2D),
    MaxPooling(MaxPooling),
    AveragePooling(AveragePooling),
    Flatten(Flatten),
    Reshape(Reshape),
    Dropout(Dropout),
    Embedding(Embedding),
    Gru(Gru),
    Lstm(Lstm),
}

/// Forwards a method call to whichever layer is inside.
macro_rules! each_layer {
    ($layer:expr, $l:ident => $body:expr) => {
        match $layer {
            Layer::FullyConnected($l) => $body,
            Layer::Conv2D($l) => $body,
            Layer::MaxPooling($l) => $body,
            Layer::AveragePooling($l) => $body,
            Layer::Flatten($l) => $body,
            Layer::Reshape($l) => $body,
            Layer::Dropout($l) => $body,
            Layer::Embedding($l) => $body,
            Layer::Gru($l) => $body,
            Layer::Lstm($l) => $body,
        }
    };
}

/// Forwards a call only to the layers that own parameters.
macro_rules! with_params {
    ($layer:expr, $l:ident => $body:expr, _ => $none:expr) => {
        match $layer {
            Layer::FullyConnected($l) => $body,
            Layer::Conv2D($l) => $body,
            Layer::Embedding($l) => $body,
            Layer::Gru($l) => $body,
            Layer::Lstm($l) => $body,
            Layer::MaxPooling(_)
            | Layer::AveragePooling(_)
            | Layer::Flatten(_)
            | Layer::Reshape(_)
            | Layer::Dropout(_) => $none,
        }
    };
}

impl Layer {
    pub fn fully_connected<R: Rng + ?Sized>(
        input_dim: usize,
        output_dim: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        FullyConnected::new(input_dim, output_dim, activation, rng).into()
    }

    pub fn conv2d<R: Rng + ?Sized>(
        input_dim: usize,
        output_dim: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        Conv2D::new(input_dim, output_dim, kernel_size, stride, padding, activation, rng).into()
    }

    #[must_use]
    pub fn max_pooling(pool_size: usize, stride: usize) -> Self {
        MaxPooling::new(pool_size, stride).into()
    }

    #[must_use]
    pub fn average_pooling(pool_size: usize, stride: usize) -> Self {
        AveragePooling::new(pool_size, stride).into()
    }

    #[must_use]
    pub fn flatten(input_shape: impl Into<Vec<usize>>) -> Self {
        Flatten::new(input_shape).into()
    }

    #[must_use]
    pub fn reshape(input_shape: impl Into<Vec<usize>>, output_shape: impl Into<Vec<usize>>) -> Self {
        Reshape::new(input_shape, output_shape).into()
    }

    pub fn dropout<R: Rng + ?Sized>(rate: f64, rng: &mut R) -> Self {
        Dropout::new(rate, rng).into()
    }

    pub fn embedding<R: Rng + ?Sized>(vocab_size: usize, embed_size: usize, rng: &mut R) -> Self {
        Embedding::new(vocab_size, embed_size, rng).into()
    }

    pub fn gru<R: Rng + ?Sized>(input_size: usize, hidden_size: usize, rng: &mut R) -> Self {
        Gru::new(input_size, hidden_size, rng).into()
    }

    pub fn lstm<R: Rng + ?Sized>(input_size: usize, hidden_size: usize, rng: &mut R) -> Self {
        Lstm::new(input_size, hidden_size, rng).into()
    }

    /// Tag written to the `layerName` field of a saved model.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::FullyConnected(_) => "FullyConnected",
            Self::Conv2D(_) => "Conv2D",
            Self::MaxPooling(_) => "MaxPooling",
            Self::AveragePooling(_) => "AvgPooling",
            Self::Flatten(_) => "Flatten",
            Self::Reshape(_) => "Reshape",
            Self::Dropout(_) => "Dropout",
            Self::Embedding(_) => "Embedding",
            Self::Gru(_) => "GRU",
            Self::Lstm(_) => "LSTM",
        }
    }

    /// Runs one forward step.
    ///
    /// In training mode a recurrent layer caches every step for a later
    /// [`Layer::backward`]. Streaming input without backward calls should go
    /// through evaluation mode (or [`Layer::reset_state`] between sequences),
    /// otherwise the cache keeps growing; see [`Layer::cached_steps`].
    pub fn forward(&mut self, input: &Tensor) -> Tensor {
        each_layer!(self, l => l.forward(input))
    }

    pub fn backward(&mut self, grad: &Tensor) -> Tensor {
        each_layer!(self, l => l.backward(grad))
    }

    /// Whether the optimiser has anything to update.
    #[must_use]
    pub const fn requires_optimisation(&self) -> bool {
        matches!(
            self,
            Self::FullyConnected(_) | Self::Conv2D(_) | Self::Embedding(_) | Self::Gru(_) | Self::Lstm(_)
        )
    }

    /// Whether a regulariser should touch this layer's weight and bias gradients.
    #[must_use]
    pub const fn requires_regularisation(&self) -> bool {
        self.requires_optimisation()
    }

    fn params(&self) -> (Vec<&WithGrad<Tensor>>, Vec<&WithGrad<Tensor>>) {
        with_params!(self, l => l.params(), _ => (Vec::new(), Vec::new()))
    }

    /// Every parameter of the layer, weights first, as value/gradient pairs.
    pub fn parameters_mut(&mut self) -> Params<'_> {
        with_params!(self, l => l.params_mut(), _ => (Vec::new(), Vec::new()))
    }

    /// All weight tensors, flattened and concatenated in parameter order.
    /// `None` for layers without parameters.
    #[must_use]
    pub fn weights(&self) -> Option<Tensor> {
        let (weights, _) = self.params();
        joined(weights.iter().map(|p| &p.value))
    }

    /// All bias tensors, flattened and concatenated. `None` when the layer has none.
    #[must_use]
    pub fn biases(&self) -> Option<Tensor> {
        let (_, biases) = self.params();
        joined(biases.iter().map(|p| &p.value))
    }

    /// Accumulated weight gradients in the same layout as [`Layer::weights`].
    #[must_use]
    pub fn gradients(&self) -> Option<Tensor> {
        let (weights, _) = self.params();
        joined(weights.iter().map(|p| &p.grad))
    }

    /// Accumulated bias gradients in the same layout as [`Layer::biases`].
    #[must_use]
    pub fn bias_gradients(&self) -> Option<Tensor> {
        let (_, biases) = self.params();
        joined(biases.iter().map(|p| &p.grad))
    }

    /// Replaces every weight tensor from a flat concatenation. Gradients are reset.
    ///
    /// # Panics
    /// Panics if the layer has no weights or the element count differs.
    pub fn set_weights(&mut self, weights: &Tensor) {
        let name = self.name();
        let (params, _) = self.parameters_mut();
        assert!(!params.is_empty(), "{name} has no weights to set");
        scatter(params, weights);
    }

    /// Replaces every bias tensor from a flat concatenation. Gradients are reset.
    ///
    /// # Panics
    /// Panics if the layer has no biases or the element count differs.
    pub fn set_biases(&mut self, biases: &Tensor) {
        let name = self.name();
        let (_, params) = self.parameters_mut();
        assert!(!params.is_empty(), "{name} has no biases to set");
        scatter(params, biases);
    }

    /// Zeroes every accumulated gradient of the layer.
    pub fn zero_gradients(&mut self) {
        let (weights, biases) = self.parameters_mut();
        for p in weights.into_iter().chain(biases) {
            p.grad.fill_zero();
        }
    }

    /// Switches training-only behaviour: dropout masks and recurrent step caching.
    pub fn set_training(&mut self, training: bool) {
        match self {
            Self::Dropout(l) => l.set_training(training),
            Self::Gru(l) => l.set_training(training),
            Self::Lstm(l) => l.set_training(training),
            _ => {}
        }
    }

    /// Current training flag. Layers without training-only behaviour report `true`.
    #[must_use]
    pub const fn is_training(&self) -> bool {
        match self {
            Self::Dropout(l) => l.is_training(),
            Self::Gru(l) => l.is_training(),
            Self::Lstm(l) => l.is_training(),
            _ => true,
        }
    }

    /// Recurrent steps cached for backpropagation. Zero for other layers.
    #[must_use]
    pub fn cached_steps(&self) -> usize {
        match self {
            Self::Gru(l) => l.cached_steps(),
            Self::Lstm(l) => l.cached_steps(),
            _ => 0,
        }
    }

    /// Reseeds a dropout mask generator. No-op for other layers.
    pub fn reseed(&mut self, seed: u64) {
        if let Self::Dropout(l) = self {
            l.reseed(seed);
        }
    }

    /// Clears recurrent hidden/cell state. No-op for other layers.
    pub fn reset_state(&mut self) {
        match self {
            Self::Gru(l) => l.reset_state(),
            Self::Lstm(l) => l.reset_state(),
            _ => {}
        }
    }

    /// Config map and named tensors for the model file.
    #[must_use]
    pub fn save(&self) -> (Config, Vec<TensorRecord>) {
        each_layer!(self, l => l.save())
    }

    /// Rebuilds a layer from its `layerName` tag, config and tensors.
    ///
    /// # Errors
    /// Fails on an unknown tag, a missing or mistyped config field, or a
    /// missing, extra or misshapen tensor.
    pub fn load(name: &str, config: &Config, tensors: Vec<TensorRecord>) -> Result<Self> {
        let set = TensorSet::new(name, tensors);
        let layer = match name {
            "FullyConnected" => FullyConnected::load(config, set)?.into(),
            "Conv2D" => Conv2D::load(config, set)?.into(),
            "MaxPooling" => MaxPooling::load(config, set)?.into(),
            "AvgPooling" | "AveragePooling" => AveragePooling::load(config, set)?.into(),
            "Flatten" => Flatten::load(config, set)?.into(),
            "Reshape" => Reshape::load(config, set)?.into(),
            "Dropout" => Dropout::load(config, set)?.into(),
            "Embedding" | "Embedded" => Embedding::load(config, set)?.into(),
            "GRU" => Gru::load(config, set)?.into(),
            "LSTM" => Lstm::load(config, set)?.into(),
            other => return Err(ModelError::unknown("layer", other)),
        };
        Ok(layer)
    }
}

fn joined<'a>(parts: impl Iterator<Item = &'a Tensor>) -> Option<Tensor> {
    let parts: Vec<&Tensor> = parts.collect();
    if parts.is_empty() {
        None
    } else {
        Some(Tensor::concatenate(&parts))
    }
}

fn scatter(params: Vec<&mut WithGrad<Tensor>>, flat: &Tensor) {
    let sizes: Vec<usize> = params.iter().map(|p| p.value.size()).collect();
    for (param, part) in params.into_iter().zip(flat.split(&sizes)) {
        let shape = param.value.shape().to_vec();
        param.replace(part.reshape(shape));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn parameter_free_layers_report_nothing() {
        let mut rng = StdRng::seed_from_u64(1);
        for layer in [
            Layer::max_pooling(2, 2),
            Layer::average_pooling(2, 2),
            Layer::flatten(vec![1, 2, 2]),
            Layer::reshape(vec![1, 4], vec![1, 2, 2]),
            Layer::dropout(0.5, &mut rng),
        ] {
            assert!(!layer.requires_optimisation(), "{}", layer.name());
            assert!(layer.weights().is_none());
            assert!(layer.biases().is_none());
            assert!(layer.gradients().is_none());
        }
    }

    #[test]
    fn gru_weights_round_trip_through_setter() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut layer = Layer::gru(3, 2, &mut rng);
        let weights = layer.weights().unwrap();
        assert_eq!(weights.size(), 3 * (3 * 2) + 3 * (2 * 2));
        let doubled = weights.multiply_scalar(2.0);
        layer.set_weights(&doubled);
        assert_eq!(layer.weights().unwrap(), doubled);
    }

    #[test]
    #[should_panic(expected = "has no weights")]
    fn setting_weights_on_flatten_panics() {
        Layer::flatten(vec![1, 4]).set_weights(&Tensor::zeros(vec![1]));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let err = Layer::load("Attention", &Config::new(), Vec::new()).unwrap_err();
        assert!(matches!(err, ModelError::UnknownVariant { kind: "layer", .. }));
    }

    #[test]
    fn legacy_tags_are_accepted() {
        let mut rng = StdRng::seed_from_u64(3);
        let (config, tensors) = Layer::embedding(4, 2, &mut rng).save();
        let layer = Layer::load("Embedded", &config, tensors).unwrap();
        assert_eq!(layer.name(), "Embedding");

        let (config, tensors) = Layer::average_pooling(2, 1).save();
        assert_eq!(Layer::load("AveragePooling", &config, tensors).unwrap().name(), "AvgPooling");
    }
}
