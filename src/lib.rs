//! handgrad: a small neural-network library with hand-derived gradients.
//!
//! Every layer computes its own backward pass explicitly; there is no tape or
//! graph. Models are plain layer stacks trained one sample at a time and
//! persisted as human-readable JSON.
//!
//! # Features
//!
//! - Dense `f64` tensors of any rank with row-major storage.
//! - Ten layers: fully connected, 2-D convolution, max/average pooling,
//!   flatten, reshape, dropout, embedding, GRU and LSTM.
//! - Four losses, three regularisers and four optimisers whose running state
//!   follows each parameter tensor's identity.
//! - Optional rayon-backed kernels for matrix products and convolutions.
//!
//! # Modules
//!
//! - [`tensors`]: `Tensor`, `TensorId`, `WithGrad`.
//! - [`ops`] and [`backend`]: compute kernels and the execution-mode switch.
//! - [`activation`], [`loss`], [`regularisation`], [`optimiser`].
//! - [`layers`]: the [`Layer`](layers::Layer) enum and its variants.
//! - [`network`]: the training loop.
//! - [`modelio`]: the JSON model format.
//! - [`error`]: recoverable failures.
//!
//! # Example
//!
//! ```rust
//! use handgrad::prelude::*;
//!
//! let mut rng = handgrad::seeded(7);
//! let mut net = Network::new(
//!     vec![
//!         Layer::fully_connected(2, 4, Activation::Tanh, &mut rng),
//!         Layer::fully_connected(4, 1, Activation::Sigmoid, &mut rng),
//!     ],
//!     Optimiser::sgd(0.5),
//!     Loss::MeanSquaredError,
//!     None,
//! );
//! let x = vec![Tensor::new(vec![1, 2], vec![0.0, 1.0])];
//! let y = vec![Tensor::new(vec![1, 1], vec![1.0])];
//! let total = net.train(&x, &y, 10);
//! assert!(total.is_finite());
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::many_single_char_names,
    clippy::similar_names,
    clippy::too_many_arguments
)]

pub mod activation;
pub mod backend;
pub mod error;
pub mod layers;
pub mod loss;
pub mod modelio;
pub mod network;
pub mod ops;
pub mod optimiser;
pub mod regularisation;
pub mod tensors;

use rand::SeedableRng;
use rand::rngs::StdRng;

/// Deterministic generator for reproducible initialisation and dropout.
#[must_use]
pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// The types needed to build and train a network.
pub mod prelude {
    pub use crate::activation::Activation;
    pub use crate::layers::Layer;
    pub use crate::loss::Loss;
    pub use crate::network::Network;
    pub use crate::optimiser::Optimiser;
    pub use crate::regularisation::Regulariser;
    pub use crate::tensors::{Tensor, WithGrad};
}
