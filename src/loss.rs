//! Loss functions.
//!
//! [`Loss::compute`] returns both the loss tensor and the gradient of the
//! loss with respect to the prediction, so the network can start its
//! backward pass immediately.
//!
//! | Loss | loss shape | gradient |
//! |---|---|---|
//! | `MeanSquaredError` | `[1]`, `0.5·Σ(p-a)²` | `p-a` |
//! | `BinaryCrossEntropy` | same as `p` | `(p-a)/(p(1-p)+ε)` |
//! | `CategoricalCrossEntropy` | `[rows]` | `(p-a)/(p+ε)` |
//! | `CosineProximity` | `[1]`, `-p·a/(‖p‖‖a‖)` | analytic |
//!
//! `ε` is [`EPSILON`] and guards every logarithm and division.

use serde_json::{Map, Value};

use crate::error::{ModelError, Result};
use crate::tensors::Tensor;

pub const EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loss {
    MeanSquaredError,
    BinaryCrossEntropy,
    CategoricalCrossEntropy,
    CosineProximity,
}

impl Loss {
    /// Computes `(loss, dloss/dpredicted)`.
    ///
    /// # Panics
    /// Panics if `predicted` and `actual` have different shapes.
    #[must_use]
    pub fn compute(&self, predicted: &Tensor, actual: &Tensor) -> (Tensor, Tensor) {
        assert_eq!(
            predicted.shape(),
            actual.shape(),
            "shape mismatch between predicted and actual tensors"
        );
        match self {
            Self::MeanSquaredError => mean_squared_error(predicted, actual),
            Self::BinaryCrossEntropy => binary_cross_entropy(predicted, actual),
            Self::CategoricalCrossEntropy => categorical_cross_entropy(predicted, actual),
            Self::CosineProximity => cosine_proximity(predicted, actual),
        }
    }

    /// Tag written to model files.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MeanSquaredError => "MeanSquaredError",
            Self::BinaryCrossEntropy => "BinaryCrossEntropy",
            Self::CategoricalCrossEntropy => "CategoricalCrossEntropy",
            Self::CosineProximity => "CosineProximityLoss",
        }
    }

    #[must_use]
    pub fn save(&self) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert("type".into(), Value::from(self.name()));
        config
    }

    /// # Errors
    /// Fails when `type` is missing or names no known loss.
    pub fn load(config: &Map<String, Value>) -> Result<Self> {
        let tag = config
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ModelError::config("lossFunction", "type"))?;
        Ok(match tag {
            "MeanSquaredError" => Self::MeanSquaredError,
            "BinaryCrossEntropy" => Self::BinaryCrossEntropy,
            "CategoricalCrossEntropy" => Self::CategoricalCrossEntropy,
            "CosineProximityLoss" => Self::CosineProximity,
            other => return Err(ModelError::unknown("loss", other)),
        })
    }
}

fn mean_squared_error(p: &Tensor, a: &Tensor) -> (Tensor, Tensor) {
    let grad = p.subtract(a);
    let loss = 0.5 * grad.data().iter().map(|d| d * d).sum::<f64>();
    (Tensor::new(vec![1], vec![loss]), grad)
}

fn binary_cross_entropy(p: &Tensor, a: &Tensor) -> (Tensor, Tensor) {
    let loss = p.zip_map(a, |p, a| {
        -a * (p + EPSILON).ln() - (1.0 - a) * (1.0 - p + EPSILON).ln()
    });
    let grad = p.zip_map(a, |p, a| (p - a) / (p * (1.0 - p) + EPSILON));
    (loss, grad)
}

fn categorical_cross_entropy(p: &Tensor, a: &Tensor) -> (Tensor, Tensor) {
    let width = p.shape().last().copied().unwrap_or(1).max(1);
    let rows: Vec<f64> = p
        .data()
        .chunks(width)
        .zip(a.data().chunks(width))
        .map(|(pr, ar)| {
            pr.iter()
                .zip(ar)
                .map(|(&p, &a)| -a * (p + EPSILON).ln())
                .sum()
        })
        .collect();
    let grad = p.zip_map(a, |p, a| (p - a) / (p + EPSILON));
    (Tensor::new(vec![rows.len()], rows), grad)
}

fn cosine_proximity(p: &Tensor, a: &Tensor) -> (Tensor, Tensor) {
    let dot: f64 = p.data().iter().zip(a.data()).map(|(x, y)| x * y).sum();
    let norm_p = p.data().iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_a = a.data().iter().map(|x| x * x).sum::<f64>().sqrt();

    // zero vectors have no direction
    if norm_p < EPSILON || norm_a < EPSILON {
        return (Tensor::zeros(vec![1]), Tensor::zeros(p.shape().to_vec()));
    }

    let loss = -dot / (norm_p * norm_a);
    // d(-cos)/dp; flipping the sign would train away from the target
    let grad = p.zip_map(a, |pi, ai| {
        -(ai / norm_a - (dot / (norm_p * norm_p * norm_a)) * pi) / norm_p
    });
    (Tensor::new(vec![1], vec![loss]), grad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_parallel_vectors_is_minus_one() {
        let p = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
        let a = Tensor::new(vec![3], vec![2.0, 4.0, 6.0]);
        let (loss, grad) = Loss::CosineProximity.compute(&p, &a);
        assert!((loss.data()[0] + 1.0).abs() < 1e-9);
        assert!(grad.data().iter().all(|g| g.abs() < 1e-9));
    }

    #[test]
    fn categorical_loss_is_per_row() {
        let p = Tensor::new(vec![2, 2], vec![0.5, 0.5, 0.9, 0.1]);
        let a = Tensor::new(vec![2, 2], vec![1.0, 0.0, 1.0, 0.0]);
        let (loss, _) = Loss::CategoricalCrossEntropy.compute(&p, &a);
        assert_eq!(loss.shape(), &[2]);
        assert!((loss.data()[0] - (-(0.5f64 + EPSILON).ln())).abs() < 1e-12);
    }
}
