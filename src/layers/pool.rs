use serde_json::Value;

use crate::error::{ModelError, Result};
use crate::modelio::{count, Config, TensorRecord, TensorSet};
use crate::tensors::Tensor;

/// Window geometry shared by both pooling layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Windows {
    batch: usize,
    channels: usize,
    in_h: usize,
    in_w: usize,
    out_h: usize,
    out_w: usize,
}

impl Windows {
    fn new(shape: &[usize], pool: usize, stride: usize) -> Self {
        assert_eq!(shape.len(), 4, "pooling requires a rank-4 input, got {shape:?}");
        assert!(
            shape[2] >= pool && shape[3] >= pool,
            "pool size {pool} larger than input {shape:?}"
        );
        Self {
            batch: shape[0],
            channels: shape[1],
            in_h: shape[2],
            in_w: shape[3],
            out_h: (shape[2] - pool) / stride + 1,
            out_w: (shape[3] - pool) / stride + 1,
        }
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![self.batch, self.channels, self.out_h, self.out_w]
    }

    /// Calls `f(out_index, in_index)` for every input cell of every window.
    fn visit(&self, pool: usize, stride: usize, mut f: impl FnMut(usize, usize)) {
        let mut out = 0;
        for plane in 0..self.batch * self.channels {
            let base = plane * self.in_h * self.in_w;
            for i in 0..self.out_h {
                for j in 0..self.out_w {
                    for di in 0..pool {
                        for dj in 0..pool {
                            let (h, w) = (i * stride + di, j * stride + dj);
                            f(out, base + h * self.in_w + w);
                        }
                    }
                    out += 1;
                }
            }
        }
    }
}

fn save_pool(pool_size: usize, stride: usize) -> (Config, Vec<TensorRecord>) {
    let mut config = Config::new();
    config.insert("pool_size".into(), Value::from(pool_size));
    config.insert("stride".into(), Value::from(stride));
    (config, Vec::new())
}

fn load_pool(config: &Config, tensors: TensorSet, owner: &str) -> Result<(usize, usize)> {
    let pool_size = count(config, "pool_size", owner)?;
    let stride = count(config, "stride", owner)?;
    if pool_size == 0 {
        return Err(ModelError::config(owner, "pool_size"));
    }
    if stride == 0 {
        return Err(ModelError::config(owner, "stride"));
    }
    tensors.finish()?;
    Ok((pool_size, stride))
}

/// Max over each `pool_size × pool_size` window of a `[batch, channels, h, w]` input.
///
/// The flat input position of every window's maximum is remembered; backward
/// routes each output gradient there, accumulating where windows overlap.
#[derive(Debug, Clone)]
pub struct MaxPooling {
    pool_size: usize,
    stride: usize,
    input_shape: Option<Vec<usize>>,
    winners: Vec<usize>,
}

impl MaxPooling {
    /// # Panics
    /// Panics if `pool_size` or `stride` is zero.
    #[must_use]
    pub fn new(pool_size: usize, stride: usize) -> Self {
        assert!(pool_size > 0 && stride > 0, "pool size and stride must be positive");
        Self {
            pool_size,
            stride,
            input_shape: None,
            winners: Vec::new(),
        }
    }

    #[must_use]
    pub const fn pool_size(&self) -> usize {
        self.pool_size
    }

    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// # Panics
    /// Panics if `input` is not rank 4 or is smaller than one window.
    pub fn forward(&mut self, input: &Tensor) -> Tensor {
        let win = Windows::new(input.shape(), self.pool_size, self.stride);
        let out_len: usize = win.output_shape().iter().product();
        let x = input.data();
        let mut best = vec![f64::NEG_INFINITY; out_len];
        let mut winners = vec![0; out_len];
        win.visit(self.pool_size, self.stride, |o, i| {
            if x[i] > best[o] {
                best[o] = x[i];
                winners[o] = i;
            }
        });
        self.winners = winners;
        self.input_shape = Some(input.shape().to_vec());
        Tensor::new(win.output_shape(), best)
    }

    /// # Panics
    /// Panics if called before [`MaxPooling::forward`] or if `grad` has the wrong size.
    pub fn backward(&mut self, grad: &Tensor) -> Tensor {
        let Some(shape) = &self.input_shape else {
            panic!("MaxPooling::backward called before forward");
        };
        assert_eq!(grad.size(), self.winners.len(), "MaxPooling gradient size mismatch");
        let mut d_input = Tensor::zeros(shape.clone());
        let dx = d_input.data_mut();
        for (&at, &g) in self.winners.iter().zip(grad.data()) {
            dx[at] += g;
        }
        d_input
    }

    /// Same-shape mask with `1.0` at every recorded maximum, if forward has run.
    #[must_use]
    pub fn mask(&self) -> Option<Tensor> {
        let shape = self.input_shape.as_ref()?;
        let mut mask = Tensor::zeros(shape.clone());
        for &at in &self.winners {
            mask.data_mut()[at] = 1.0;
        }
        Some(mask)
    }

    pub(crate) fn save(&self) -> (Config, Vec<TensorRecord>) {
        save_pool(self.pool_size, self.stride)
    }

    pub(crate) fn load(config: &Config, tensors: TensorSet) -> Result<Self> {
        let (pool_size, stride) = load_pool(config, tensors, "MaxPooling")?;
        Ok(Self::new(pool_size, stride))
    }
}

/// Mean over each `pool_size × pool_size` window of a `[batch, channels, h, w]` input.
///
/// Backward spreads each output gradient equally over its window,
/// accumulating where windows overlap.
#[derive(Debug, Clone)]
pub struct AveragePooling {
    pool_size: usize,
    stride: usize,
    input_shape: Option<Vec<usize>>,
}

impl AveragePooling {
    /// # Panics
    /// Panics if `pool_size` or `stride` is zero.
    #[must_use]
    pub fn new(pool_size: usize, stride: usize) -> Self {
        assert!(pool_size > 0 && stride > 0, "pool size and stride must be positive");
        Self {
            pool_size,
            stride,
            input_shape: None,
        }
    }

    #[must_use]
    pub const fn pool_size(&self) -> usize {
        self.pool_size
    }

    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    #[allow(clippy::cast_precision_loss)]
    fn window_len(&self) -> f64 {
        (self.pool_size * self.pool_size) as f64
    }

    /// # Panics
    /// Panics if `input` is not rank 4 or is smaller than one window.
    pub fn forward(&mut self, input: &Tensor) -> Tensor {
        let win = Windows::new(input.shape(), self.pool_size, self.stride);
        let x = input.data();
        let mut sums = vec![0.0; win.output_shape().iter().product::<usize>()];
        win.visit(self.pool_size, self.stride, |o, i| sums[o] += x[i]);
        let n = self.window_len();
        sums.iter_mut().for_each(|s| *s /= n);
        self.input_shape = Some(input.shape().to_vec());
        Tensor::new(win.output_shape(), sums)
    }

    /// # Panics
    /// Panics if called before [`AveragePooling::forward`] or if `grad` has the wrong size.
    pub fn backward(&mut self, grad: &Tensor) -> Tensor {
        let Some(shape) = &self.input_shape else {
            panic!("AveragePooling::backward called before forward");
        };
        let win = Windows::new(shape, self.pool_size, self.stride);
        assert_eq!(
            grad.size(),
            win.output_shape().iter().product::<usize>(),
            "AveragePooling gradient size mismatch"
        );
        let n = self.window_len();
        let g = grad.data();
        let mut d_input = Tensor::zeros(shape.clone());
        let dx = d_input.data_mut();
        win.visit(self.pool_size, self.stride, |o, i| dx[i] += g[o] / n);
        d_input
    }

    pub(crate) fn save(&self) -> (Config, Vec<TensorRecord>) {
        save_pool(self.pool_size, self.stride)
    }

    pub(crate) fn load(config: &Config, tensors: TensorSet) -> Result<Self> {
        let (pool_size, stride) = load_pool(config, tensors, "AvgPooling")?;
        Ok(Self::new(pool_size, stride))
    }
}

impl From<MaxPooling> for super::Layer {
    fn from(layer: MaxPooling) -> Self {
        Self::MaxPooling(layer)
    }
}

impl From<AveragePooling> for super::Layer {
    fn from(layer: AveragePooling) -> Self {
        Self::AveragePooling(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_max_windows_accumulate() {
        // both 2x2 windows contain the 5.0 at flat index 1
        let input = Tensor::new(vec![1, 1, 2, 3], vec![1.0, 5.0, 2.0, 0.0, 0.0, 0.0]);
        let mut pool = MaxPooling::new(2, 1);
        let out = pool.forward(&input);
        assert_eq!(out.data(), &[5.0, 5.0]);
        let grad = pool.backward(&Tensor::new(vec![1, 1, 1, 2], vec![1.0, 2.0]));
        assert_eq!(grad.data(), &[0.0, 3.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn average_pool_spreads_gradient() {
        let input = Tensor::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let mut pool = AveragePooling::new(2, 2);
        assert_eq!(pool.forward(&input).data(), &[2.5]);
        let grad = pool.backward(&Tensor::new(vec![1, 1, 1, 1], vec![4.0]));
        assert_eq!(grad.data(), &[1.0, 1.0, 1.0, 1.0]);
    }
}
