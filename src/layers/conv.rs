use rand::Rng;
use serde_json::Value;

use crate::activation::Activation;
use crate::error::Result;
use crate::modelio::{count, Config, TensorRecord, TensorSet};
use crate::ops::ConvGeometry;
use crate::tensors::{Tensor, WithGrad};

use super::Params;

/// 2-D convolution with a per-channel bias and an activation.
///
/// Input `[batch, input_dim, h, w]`, weights `[output_dim, input_dim, k, k]`,
/// biases `[output_dim]`. Output spatial size is `(dim + 2·padding - k)/stride + 1`.
#[derive(Debug, Clone)]
pub struct Conv2D {
    weights: WithGrad<Tensor>,
    biases: WithGrad<Tensor>,
    stride: usize,
    padding: usize,
    activation: Activation,
    input: Option<Tensor>,
    output: Option<Tensor>,
}

impl Conv2D {
    /// Weights are drawn uniformly from `[-1, 1)`, biases start at zero.
    ///
    /// # Panics
    /// Panics if `stride` is zero.
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        output_dim: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        assert!(stride > 0, "Conv2D stride must be positive");
        Self {
            weights: WithGrad::new(Tensor::random(
                vec![output_dim, input_dim, kernel_size, kernel_size],
                rng,
            )),
            biases: WithGrad::new(Tensor::zeros(vec![output_dim])),
            stride,
            padding,
            activation,
            input: None,
            output: None,
        }
    }

    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.weights.value.shape()[1]
    }

    #[must_use]
    pub fn output_dim(&self) -> usize {
        self.weights.value.shape()[0]
    }

    #[must_use]
    pub fn kernel_size(&self) -> usize {
        self.weights.value.shape()[2]
    }

    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    #[must_use]
    pub const fn padding(&self) -> usize {
        self.padding
    }

    #[must_use]
    pub const fn activation(&self) -> Activation {
        self.activation
    }

    /// # Panics
    /// Panics if `input` is not rank 4 with `input_dim` channels.
    pub fn forward(&mut self, input: &Tensor) -> Tensor {
        let mut z = input.conv2d(&self.weights.value, self.stride, self.padding);
        let channels = self.output_dim();
        let map_len = z.shape()[2] * z.shape()[3];
        let biases = self.biases.value.data();
        if map_len > 0 {
            for (idx, map) in z.data_mut().chunks_mut(map_len).enumerate() {
                let bias = biases[idx % channels];
                map.iter_mut().for_each(|v| *v += bias);
            }
        }
        let y = self.activation.forward(&z);
        self.input = Some(input.clone());
        self.output = Some(y.clone());
        y
    }

    /// Walks every output position with the forward index mapping, accumulating
    /// weight and bias gradients and scatter-adding into the input gradient.
    ///
    /// # Panics
    /// Panics if called before [`Conv2D::forward`] or if `grad` does not match
    /// the last output's shape.
    pub fn backward(&mut self, grad: &Tensor) -> Tensor {
        let (Some(input), Some(output)) = (&self.input, &self.output) else {
            panic!("Conv2D::backward called before forward");
        };
        let delta = grad.multiply(&self.activation.backward(output));
        let g = ConvGeometry::new(input.shape(), self.weights.value.shape(), self.stride, self.padding);

        let x = input.data();
        let w = self.weights.value.data();
        let d = delta.data();
        let mut d_input = Tensor::zeros(input.shape().to_vec());
        let dx = d_input.data_mut();
        let dw = self.weights.grad.data_mut();
        let db = self.biases.grad.data_mut();

        for b in 0..g.batch {
            for oc in 0..g.out_channels {
                for oh in 0..g.out_h {
                    for ow in 0..g.out_w {
                        let gv = d[g.output_offset(b, oc, oh, ow)];
                        for c in 0..g.in_channels {
                            for kh in 0..g.kernel_h {
                                for kw in 0..g.kernel_w {
                                    if let Some((ih, iw)) = g.source(oh, ow, kh, kw) {
                                        let xi = g.input_offset(b, c, ih, iw);
                                        let wi = g.kernel_offset(oc, c, kh, kw);
                                        dw[wi] += gv * x[xi];
                                        dx[xi] += gv * w[wi];
                                    }
                                }
                            }
                        }
                        db[oc] += gv;
                    }
                }
            }
        }
        d_input
    }

    pub(crate) fn params(&self) -> (Vec<&WithGrad<Tensor>>, Vec<&WithGrad<Tensor>>) {
        (vec![&self.weights], vec![&self.biases])
    }

    pub(crate) fn params_mut(&mut self) -> Params<'_> {
        (vec![&mut self.weights], vec![&mut self.biases])
    }

    pub(crate) fn save(&self) -> (Config, Vec<TensorRecord>) {
        let mut config = Config::new();
        config.insert("input_dim".into(), Value::from(self.input_dim()));
        config.insert("output_dim".into(), Value::from(self.output_dim()));
        config.insert("kernel_size".into(), Value::from(self.kernel_size()));
        config.insert("stride".into(), Value::from(self.stride));
        config.insert("padding".into(), Value::from(self.padding));
        self.activation.save_into(&mut config, "activation");
        let tensors = vec![
            TensorRecord::from_tensor("Weights", &self.weights.value),
            TensorRecord::from_tensor("Biases", &self.biases.value),
        ];
        (config, tensors)
    }

    pub(crate) fn load(config: &Config, mut tensors: TensorSet) -> Result<Self> {
        const OWNER: &str = "Conv2D";
        let input_dim = count(config, "input_dim", OWNER)?;
        let output_dim = count(config, "output_dim", OWNER)?;
        let kernel_size = count(config, "kernel_size", OWNER)?;
        let stride = count(config, "stride", OWNER)?;
        let padding = count(config, "padding", OWNER)?;
        if stride == 0 {
            return Err(crate::error::ModelError::config(OWNER, "stride"));
        }
        let activation = Activation::load_from(config, "activation", OWNER)?;
        let weights =
            tensors.take_shaped("Weights", &[output_dim, input_dim, kernel_size, kernel_size])?;
        let biases = tensors.take_shaped("Biases", &[output_dim])?;
        tensors.finish()?;
        Ok(Self {
            weights: WithGrad::new(weights),
            biases: WithGrad::new(biases),
            stride,
            padding,
            activation,
            input: None,
            output: None,
        })
    }
}

impl From<Conv2D> for super::Layer {
    fn from(layer: Conv2D) -> Self {
        Self::Conv2D(layer)
    }
}
