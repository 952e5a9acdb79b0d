use rand::Rng;
use serde_json::Value;

use crate::activation::Activation;
use crate::error::Result;
use crate::modelio::{count, Config, TensorRecord, TensorSet};
use crate::tensors::{Tensor, WithGrad};

use super::Params;
use super::recurrent::{Gate, StepState};

/// Cached activations of one timestep.
#[derive(Debug, Clone)]
struct GruStep {
    x: Tensor,
    h_prev: Tensor,
    z: Tensor,
    r: Tensor,
    candidate: Tensor,
}

/// Gated recurrent unit processing one timestep per [`Gru::forward`] call.
///
/// ```text
/// z  = σ(x·Wu + h·Ru + bu)
/// r  = σ(x·Wr + h·Rr + br)
/// ĥ  = tanh(x·Wh + (r⊙h)·Rh + bh)
/// h' = z⊙h + (1-z)⊙ĥ
/// ```
///
/// The hidden state carries over between calls until [`Gru::reset_state`].
/// Each forward pushes its activations onto a history stack and each backward
/// pops one, so calling backward once per step in reverse order performs
/// truncated backpropagation through time over the cached steps.
#[derive(Debug, Clone)]
pub struct Gru {
    update: Gate,
    reset: Gate,
    candidate: Gate,
    gate_activation: Activation,
    candidate_activation: Activation,
    state: StepState<GruStep>,
}

impl Gru {
    pub fn new<R: Rng + ?Sized>(input_size: usize, hidden_size: usize, rng: &mut R) -> Self {
        Self {
            update: Gate::new(input_size, hidden_size, rng),
            reset: Gate::new(input_size, hidden_size, rng),
            candidate: Gate::new(input_size, hidden_size, rng),
            gate_activation: Activation::Sigmoid,
            candidate_activation: Activation::Tanh,
            state: StepState::new(hidden_size),
        }
    }

    #[must_use]
    pub fn input_size(&self) -> usize {
        self.update.input_size()
    }

    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.update.hidden_size()
    }

    /// Current hidden state, if any step has run since the last reset.
    #[must_use]
    pub fn hidden(&self) -> Option<&Tensor> {
        self.state.hidden.as_ref()
    }

    /// Clears hidden state, cached steps and any pending recurrent gradient.
    pub fn reset_state(&mut self) {
        self.state.reset();
    }

    pub fn set_training(&mut self, training: bool) {
        self.state.training = training;
    }

    #[must_use]
    pub const fn is_training(&self) -> bool {
        self.state.training
    }

    /// Forward steps cached for backpropagation through time. Grows by one
    /// per training-mode [`Gru::forward`] until [`Gru::backward`] or
    /// [`Gru::reset_state`] consumes it.
    #[must_use]
    pub fn cached_steps(&self) -> usize {
        self.state.depth()
    }

    /// Advances one timestep on `x: [batch, input_size]`, returning the new hidden state.
    ///
    /// # Panics
    /// Panics if `x` is not `[batch, input_size]` or the batch size changed
    /// without a [`Gru::reset_state`].
    pub fn forward(&mut self, x: &Tensor) -> Tensor {
        let h_prev = self.state.previous(x);
        let z = self.gate_activation.forward(&self.update.pre_activation(x, &h_prev));
        let r = self.gate_activation.forward(&self.reset.pre_activation(x, &h_prev));
        let candidate = self
            .candidate_activation
            .forward(&self.candidate.pre_activation(x, &r.multiply(&h_prev)));
        let h = z
            .multiply(&h_prev)
            .add(&z.map(|v| 1.0 - v).multiply(&candidate));

        self.state.push(
            h.clone(),
            GruStep {
                x: x.clone(),
                h_prev,
                z,
                r,
                candidate,
            },
        );
        h
    }

    /// Backpropagates through the most recent cached step and returns `dL/dx`.
    ///
    /// The gradient with respect to the previous hidden state is kept and added
    /// to the incoming gradient of the next (earlier) step popped.
    ///
    /// # Panics
    /// Panics if no forward step is cached or `dh` does not match the hidden shape.
    pub fn backward(&mut self, dh: &Tensor) -> Tensor {
        let (step, carry) = self.state.pop("Gru");
        let dh = match carry {
            Some(c) => dh.add(&c),
            None => dh.clone(),
        };

        let d_candidate = dh.multiply(&step.z.map(|v| 1.0 - v));
        let dz = dh.multiply(&step.h_prev.subtract(&step.candidate));
        let da_h = d_candidate.multiply(&self.candidate_activation.backward(&step.candidate));
        let da_z = dz.multiply(&self.gate_activation.backward(&step.z));

        let d_reset_h = da_h.dot(&self.candidate.recurrent.value.transpose());
        let da_r = d_reset_h
            .multiply(&step.h_prev)
            .multiply(&self.gate_activation.backward(&step.r));

        self.candidate.accumulate(&step.x, &step.r.multiply(&step.h_prev), &da_h);
        self.update.accumulate(&step.x, &step.h_prev, &da_z);
        self.reset.accumulate(&step.x, &step.h_prev, &da_r);

        let dx = self
            .candidate
            .input_grad(&da_h)
            .add(&self.update.input_grad(&da_z))
            .add(&self.reset.input_grad(&da_r));

        let dh_prev = dh
            .multiply(&step.z)
            .add(&d_reset_h.multiply(&step.r))
            .add(&self.update.hidden_grad(&da_z))
            .add(&self.reset.hidden_grad(&da_r));
        self.state.carry(dh_prev);
        dx
    }

    /// Runs `forward` over a sequence of `[batch, input_size]` steps.
    pub fn forward_sequence(&mut self, inputs: &[Tensor]) -> Vec<Tensor> {
        inputs.iter().map(|x| self.forward(x)).collect()
    }

    /// Backpropagates per-step hidden gradients through the cached sequence,
    /// returning per-step input gradients in forward order.
    ///
    /// # Panics
    /// Panics if more gradients are given than steps are cached.
    pub fn backward_sequence(&mut self, grads: &[Tensor]) -> Vec<Tensor> {
        let mut dx: Vec<Tensor> = grads.iter().rev().map(|g| self.backward(g)).collect();
        dx.reverse();
        dx
    }

    fn gates(&self) -> [&Gate; 3] {
        [&self.update, &self.reset, &self.candidate]
    }

    pub(crate) fn params(&self) -> (Vec<&WithGrad<Tensor>>, Vec<&WithGrad<Tensor>>) {
        let g = self.gates();
        (
            vec![
                &g[0].input, &g[1].input, &g[2].input,
                &g[0].recurrent, &g[1].recurrent, &g[2].recurrent,
            ],
            vec![&g[0].bias, &g[1].bias, &g[2].bias],
        )
    }

    pub(crate) fn params_mut(&mut self) -> Params<'_> {
        let (u, r, c) = (&mut self.update, &mut self.reset, &mut self.candidate);
        (
            vec![
                &mut u.input, &mut r.input, &mut c.input,
                &mut u.recurrent, &mut r.recurrent, &mut c.recurrent,
            ],
            vec![&mut u.bias, &mut r.bias, &mut c.bias],
        )
    }

    const NAMES: [(&'static str, &'static str, &'static str); 3] =
        [("Wu", "Ru", "Bu"), ("Wr", "Rr", "Br"), ("Wh", "Rh", "Bh")];

    pub(crate) fn save(&self) -> (Config, Vec<TensorRecord>) {
        let mut config = Config::new();
        config.insert("input_size".into(), Value::from(self.input_size()));
        config.insert("hidden_size".into(), Value::from(self.hidden_size()));
        self.gate_activation.save_into(&mut config, "activation_sigmoid");
        self.candidate_activation.save_into(&mut config, "activation_tanh");

        let gates = self.gates();
        let mut tensors = Vec::new();
        for (gate, (w, _, _)) in gates.iter().zip(Self::NAMES) {
            tensors.push(TensorRecord::from_tensor(w, &gate.input.value));
        }
        for (gate, (_, r, _)) in gates.iter().zip(Self::NAMES) {
            tensors.push(TensorRecord::from_tensor(r, &gate.recurrent.value));
        }
        for (gate, (_, _, b)) in gates.iter().zip(Self::NAMES) {
            tensors.push(TensorRecord::from_tensor(b, &gate.bias.value));
        }
        if let Some(h) = &self.state.hidden {
            tensors.push(TensorRecord::from_tensor("H", h));
        }
        (config, tensors)
    }

    pub(crate) fn load(config: &Config, mut tensors: TensorSet) -> Result<Self> {
        const OWNER: &str = "GRU";
        let input_size = count(config, "input_size", OWNER)?;
        let hidden_size = count(config, "hidden_size", OWNER)?;
        let gate_activation = Activation::load_from(config, "activation_sigmoid", OWNER)?;
        let candidate_activation = Activation::load_from(config, "activation_tanh", OWNER)?;

        let [update, reset, candidate] = Self::NAMES
            .map(|names| Gate::load(&mut tensors, names, input_size, hidden_size));
        let mut state = StepState::new(hidden_size);
        state.hidden = tensors.take_optional("H")?;
        tensors.finish()?;
        Ok(Self {
            update: update?,
            reset: reset?,
            candidate: candidate?,
            gate_activation,
            candidate_activation,
            state,
        })
    }
}

impl From<Gru> for super::Layer {
    fn from(layer: Gru) -> Self {
        Self::Gru(layer)
    }
}
