//! Recoverable errors.
//!
//! Shape and index violations are programming errors and panic at the call
//! site. Everything that can go wrong while reading or writing a model file
//! is reported as a [`ModelError`] instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing or invalid config field `{field}` for {owner}")]
    Config { owner: String, field: String },
    #[error("unknown {kind} `{name}`")]
    UnknownVariant { kind: &'static str, name: String },
    #[error("unexpected tensor `{name}` for {owner}")]
    UnexpectedTensor { owner: String, name: String },
    #[error("missing tensor `{name}` for {owner}")]
    MissingTensor { owner: String, name: String },
    #[error("tensor `{name}` has shape {shape:?} but {len} data elements")]
    CorruptTensor {
        name: String,
        shape: Vec<usize>,
        len: usize,
    },
    #[error("tensor `{name}` expected shape {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("missing `{0}` section")]
    MissingSection(&'static str),
}

impl ModelError {
    pub(crate) fn config(owner: &str, field: &str) -> Self {
        Self::Config {
            owner: owner.to_owned(),
            field: field.to_owned(),
        }
    }

    pub(crate) fn unknown(kind: &'static str, name: &str) -> Self {
        Self::UnknownVariant {
            kind,
            name: name.to_owned(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
