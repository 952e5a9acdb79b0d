//! Saving and loading whole networks.
//!
//! # Model File Format
//!
//! A model is a single JSON document:
//!
//! ```text
//! {
//!   "metadata": {"name", "creation_date" (RFC 3339), "id" (UUID v4),
//!                "total_loss", "dataset_name"},
//!   "layers": [ {"layerName", "config": {..}, "tensors": [{"name", "shape", "data"}]} ],
//!   "optimiser":      {"type", ..hyperparameters},
//!   "lossFunction":   {"type"},
//!   "regularisation": {"type", ..coefficients}     (optional)
//! }
//! ```
//!
//! Layers appear in network order. Each layer writes its own `config`
//! object and a list of named tensors; see [`crate::layers`] for the tags.
//!
//! # Integrity
//!
//! Every tensor record read from disk passes through a `briny` validation
//! gate (`shape` product must equal `data` length) before it becomes a
//! [`Tensor`]. Unknown layer, activation, loss, optimiser or regulariser
//! tags and unexpected tensor names are errors; nothing is skipped.
//!
//! # Example
//!
//! ```rust,no_run
//! use handgrad::prelude::*;
//!
//! fn main() -> handgrad::error::Result<()> {
//!     let mut rng = handgrad::seeded(7);
//!     let net = Network::new(
//!         vec![Layer::fully_connected(2, 1, Activation::Sigmoid, &mut rng)],
//!         Optimiser::sgd(0.1),
//!         Loss::MeanSquaredError,
//!         None,
//!     );
//!     net.save("model.json", "xor", "toy", 0.0)?;
//!     let restored = Network::load("model.json")?;
//!     assert_eq!(restored.layers().len(), 1);
//!     Ok(())
//! }
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use briny::prelude::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::{ModelError, Result};
use crate::tensors::Tensor;

pub type Config = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub creation_date: DateTime<Utc>,
    pub id: Uuid,
    pub total_loss: f64,
    pub dataset_name: String,
}

impl Metadata {
    /// Fresh metadata stamped with the current time and a random id.
    #[must_use]
    pub fn new(name: &str, dataset_name: &str, total_loss: f64) -> Self {
        Self {
            name: name.to_owned(),
            creation_date: Utc::now(),
            id: Uuid::new_v4(),
            total_loss,
            dataset_name: dataset_name.to_owned(),
        }
    }
}

/// One serialised tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl Validate for TensorRecord {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.shape.iter().product::<usize>() != self.data.len() {
            return Err(ValidationError);
        }
        Ok(())
    }
}

impl TensorRecord {
    #[must_use]
    pub fn from_tensor(name: &str, tensor: &Tensor) -> Self {
        Self {
            name: name.to_owned(),
            shape: tensor.shape().to_vec(),
            data: tensor.data().to_vec(),
        }
    }

    /// Validates the record and turns it into a tensor with a fresh id.
    ///
    /// # Errors
    /// [`ModelError::CorruptTensor`] if `shape` and `data` disagree.
    pub fn into_tensor(self) -> Result<Tensor> {
        let (name, shape, len) = (self.name.clone(), self.shape.clone(), self.data.len());
        let trusted = TrustedData::new(self).map_err(|_| ModelError::CorruptTensor { name, shape, len })?;
        let inner = trusted.into_inner();
        Ok(Tensor::new(inner.shape, inner.data))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    #[serde(rename = "layerName")]
    pub layer_name: String,
    #[serde(default)]
    pub config: Config,
    #[serde(default)]
    pub tensors: Vec<TensorRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub metadata: Metadata,
    pub layers: Vec<LayerRecord>,
    #[serde(default)]
    pub optimiser: Option<Config>,
    #[serde(rename = "lossFunction", default)]
    pub loss_function: Option<Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regularisation: Option<Config>,
}

impl Model {
    /// # Errors
    /// Fails if the document is not a valid model.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// # Errors
    /// Fails only if serialisation itself fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Writes `model` as JSON to `path`.
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn save_model(path: impl AsRef<Path>, model: &Model) -> Result<()> {
    let path = path.as_ref();
    let mut file = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut file, model)?;
    file.flush()?;
    info!(path = %path.display(), name = %model.metadata.name, layers = model.layers.len(), "model saved");
    Ok(())
}

/// Reads a JSON model document from `path`.
///
/// # Errors
/// Returns an error if the file cannot be read or is not a model document.
pub fn load_model(path: impl AsRef<Path>) -> Result<Model> {
    let path = path.as_ref();
    let model: Model = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    info!(path = %path.display(), name = %model.metadata.name, layers = model.layers.len(), "model loaded");
    Ok(model)
}

/// Named tensors of one layer record, consumed by name while the layer
/// rebuilds itself.
pub(crate) struct TensorSet {
    owner: String,
    records: Vec<TensorRecord>,
}

impl TensorSet {
    pub(crate) fn new(owner: &str, records: Vec<TensorRecord>) -> Self {
        Self {
            owner: owner.to_owned(),
            records,
        }
    }

    /// Removes and validates the tensor called `name`.
    pub(crate) fn take(&mut self, name: &str) -> Result<Tensor> {
        let at = self
            .records
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| ModelError::MissingTensor {
                owner: self.owner.clone(),
                name: name.to_owned(),
            })?;
        self.records.swap_remove(at).into_tensor()
    }

    /// Like [`TensorSet::take`], but also checks the shape.
    pub(crate) fn take_shaped(&mut self, name: &str, expected: &[usize]) -> Result<Tensor> {
        let tensor = self.take(name)?;
        if tensor.shape() != expected {
            return Err(ModelError::ShapeMismatch {
                name: name.to_owned(),
                expected: expected.to_vec(),
                found: tensor.shape().to_vec(),
            });
        }
        Ok(tensor)
    }

    /// Takes `name` if present; absent records are not an error.
    pub(crate) fn take_optional(&mut self, name: &str) -> Result<Option<Tensor>> {
        if self.records.iter().any(|r| r.name == name) {
            self.take(name).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Fails if any record was not consumed.
    pub(crate) fn finish(self) -> Result<()> {
        match self.records.into_iter().next() {
            Some(extra) => Err(ModelError::UnexpectedTensor {
                owner: self.owner,
                name: extra.name,
            }),
            None => Ok(()),
        }
    }
}

/// Reads a float config field.
pub(crate) fn number(config: &Config, key: &str, owner: &str) -> Result<f64> {
    config
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| ModelError::config(owner, key))
}

/// Reads a non-negative integer config field.
pub(crate) fn count(config: &Config, key: &str, owner: &str) -> Result<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| ModelError::config(owner, key))
}

/// Reads an array-of-integers config field.
pub(crate) fn dims(config: &Config, key: &str, owner: &str) -> Result<Vec<usize>> {
    config
        .get(key)
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .map(|v| v.as_u64().and_then(|v| usize::try_from(v).ok()))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| ModelError::config(owner, key))
}
