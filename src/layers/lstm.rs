use rand::Rng;
use serde_json::Value;

use crate::activation::Activation;
use crate::error::Result;
use crate::modelio::{count, Config, TensorRecord, TensorSet};
use crate::tensors::{Tensor, WithGrad};

use super::Params;
use super::recurrent::{Gate, StepState};

#[derive(Debug, Clone)]
struct LstmStep {
    x: Tensor,
    h_prev: Tensor,
    c_prev: Tensor,
    forget: Tensor,
    input: Tensor,
    candidate: Tensor,
    output: Tensor,
    /// `tanh(c')`, the squashed new cell state.
    cell_out: Tensor,
}

/// Long short-term memory cell processing one timestep per [`Lstm::forward`] call.
///
/// ```text
/// f  = σ(x·Wf + h·Uf + bf)      i = σ(x·Wi + h·Ui + bi)
/// g  = tanh(x·Wc + h·Uc + bc)   o = σ(x·Wo + h·Uo + bo)
/// c' = f⊙c + i⊙g
/// h' = o⊙tanh(c')
/// ```
///
/// Hidden and cell state persist across calls until [`Lstm::reset_state`];
/// backward follows the same one-step-per-call stack discipline as the GRU.
#[derive(Debug, Clone)]
pub struct Lstm {
    forget: Gate,
    input: Gate,
    candidate: Gate,
    output: Gate,
    gate_activation: Activation,
    candidate_activation: Activation,
    cell: Option<Tensor>,
    state: StepState<LstmStep, (Tensor, Tensor)>,
}

impl Lstm {
    pub fn new<R: Rng + ?Sized>(input_size: usize, hidden_size: usize, rng: &mut R) -> Self {
        Self {
            forget: Gate::new(input_size, hidden_size, rng),
            input: Gate::new(input_size, hidden_size, rng),
            candidate: Gate::new(input_size, hidden_size, rng),
            output: Gate::new(input_size, hidden_size, rng),
            gate_activation: Activation::Sigmoid,
            candidate_activation: Activation::Tanh,
            cell: None,
            state: StepState::new(hidden_size),
        }
    }

    #[must_use]
    pub fn input_size(&self) -> usize {
        self.forget.input_size()
    }

    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.forget.hidden_size()
    }

    #[must_use]
    pub fn hidden(&self) -> Option<&Tensor> {
        self.state.hidden.as_ref()
    }

    #[must_use]
    pub fn cell(&self) -> Option<&Tensor> {
        self.cell.as_ref()
    }

    pub fn reset_state(&mut self) {
        self.state.reset();
        self.cell = None;
    }

    pub fn set_training(&mut self, training: bool) {
        self.state.training = training;
    }

    #[must_use]
    pub const fn is_training(&self) -> bool {
        self.state.training
    }

    /// Forward steps cached for backpropagation through time. Grows by one
    /// per training-mode [`Lstm::forward`] until [`Lstm::backward`] or
    /// [`Lstm::reset_state`] consumes it.
    #[must_use]
    pub fn cached_steps(&self) -> usize {
        self.state.depth()
    }

    /// # Panics
    /// Panics if `x` is not `[batch, input_size]` or the batch size changed
    /// without a [`Lstm::reset_state`].
    pub fn forward(&mut self, x: &Tensor) -> Tensor {
        let h_prev = self.state.previous(x);
        let c_prev = match &self.cell {
            Some(c) => c.clone(),
            None => self.state.zeros_for(x),
        };
        let gate = |g: &Gate| self.gate_activation.forward(&g.pre_activation(x, &h_prev));
        let forget = gate(&self.forget);
        let input = gate(&self.input);
        let output = gate(&self.output);
        let candidate = self
            .candidate_activation
            .forward(&self.candidate.pre_activation(x, &h_prev));

        let cell = forget.multiply(&c_prev).add(&input.multiply(&candidate));
        let cell_out = cell.map(f64::tanh);
        let h = output.multiply(&cell_out);

        self.cell = Some(cell);
        self.state.push(
            h.clone(),
            LstmStep {
                x: x.clone(),
                h_prev,
                c_prev,
                forget,
                input,
                candidate,
                output,
                cell_out,
            },
        );
        h
    }

    /// Backpropagates through the most recent cached step and returns `dL/dx`.
    ///
    /// # Panics
    /// Panics if no forward step is cached or `dh` does not match the hidden shape.
    pub fn backward(&mut self, dh: &Tensor) -> Tensor {
        let (step, carry) = self.state.pop("Lstm");
        let (dh, dc_next) = match carry {
            Some((h, c)) => (dh.add(&h), Some(c)),
            None => (dh.clone(), None),
        };

        let d_output = dh.multiply(&step.cell_out);
        let mut dc = dh
            .multiply(&step.output)
            .multiply(&step.cell_out.map(|t| 1.0 - t * t));
        if let Some(c) = dc_next {
            dc = dc.add(&c);
        }
        let d_forget = dc.multiply(&step.c_prev);
        let d_input = dc.multiply(&step.candidate);
        let d_candidate = dc.multiply(&step.input);

        let sigma = &self.gate_activation;
        let da_f = d_forget.multiply(&sigma.backward(&step.forget));
        let da_i = d_input.multiply(&sigma.backward(&step.input));
        let da_o = d_output.multiply(&sigma.backward(&step.output));
        let da_g = d_candidate.multiply(&self.candidate_activation.backward(&step.candidate));

        let pairs = [
            (&mut self.forget, &da_f),
            (&mut self.input, &da_i),
            (&mut self.candidate, &da_g),
            (&mut self.output, &da_o),
        ];
        let mut dx = Tensor::zeros(step.x.shape().to_vec());
        let mut dh_prev = Tensor::zeros(step.h_prev.shape().to_vec());
        for (gate, da) in pairs {
            gate.accumulate(&step.x, &step.h_prev, da);
            dx.accumulate(&gate.input_grad(da));
            dh_prev.accumulate(&gate.hidden_grad(da));
        }

        let dc_prev = dc.multiply(&step.forget);
        self.state.carry((dh_prev, dc_prev));
        dx
    }

    pub fn forward_sequence(&mut self, inputs: &[Tensor]) -> Vec<Tensor> {
        inputs.iter().map(|x| self.forward(x)).collect()
    }

    /// Per-step input gradients in forward order.
    pub fn backward_sequence(&mut self, grads: &[Tensor]) -> Vec<Tensor> {
        let mut dx: Vec<Tensor> = grads.iter().rev().map(|g| self.backward(g)).collect();
        dx.reverse();
        dx
    }

    fn gates(&self) -> [&Gate; 4] {
        [&self.forget, &self.input, &self.candidate, &self.output]
    }

    pub(crate) fn params(&self) -> (Vec<&WithGrad<Tensor>>, Vec<&WithGrad<Tensor>>) {
        let gates = self.gates();
        let mut weights: Vec<_> = gates.iter().map(|g| &g.input).collect();
        weights.extend(gates.iter().map(|g| &g.recurrent));
        (weights, gates.iter().map(|g| &g.bias).collect())
    }

    pub(crate) fn params_mut(&mut self) -> Params<'_> {
        let mut weights = Vec::with_capacity(8);
        let mut recurrent = Vec::with_capacity(4);
        let mut biases = Vec::with_capacity(4);
        for gate in [&mut self.forget, &mut self.input, &mut self.candidate, &mut self.output] {
            weights.push(&mut gate.input);
            recurrent.push(&mut gate.recurrent);
            biases.push(&mut gate.bias);
        }
        weights.extend(recurrent);
        (weights, biases)
    }

    const NAMES: [(&'static str, &'static str, &'static str); 4] = [
        ("Wf", "Uf", "Bf"),
        ("Wi", "Ui", "Bi"),
        ("Wc", "Uc", "Bc"),
        ("Wo", "Uo", "Bo"),
    ];

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
        for (gate, (_, u, _)) in gates.iter().zip(Self::NAMES) {
            tensors.push(TensorRecord::from_tensor(u, &gate.recurrent.value));
        }
        for (gate, (_, _, b)) in gates.iter().zip(Self::NAMES) {
            tensors.push(TensorRecord::from_tensor(b, &gate.bias.value));
        }
        if let Some(h) = &self.state.hidden {
            tensors.push(TensorRecord::from_tensor("H", h));
        }
        if let Some(c) = &self.cell {
            tensors.push(TensorRecord::from_tensor("C", c));
        }
        (config, tensors)
    }

    pub(crate) fn load(config: &Config, mut tensors: TensorSet) -> Result<Self> {
        const OWNER: &str = "LSTM";
        let input_size = count(config, "input_size", OWNER)?;
        let hidden_size = count(config, "hidden_size", OWNER)?;
        let gate_activation = Activation::load_from(config, "activation_sigmoid", OWNER)?;
        let candidate_activation = Activation::load_from(config, "activation_tanh", OWNER)?;

        let [forget, input, candidate, output] = Self::NAMES
            .map(|names| Gate::load(&mut tensors, names, input_size, hidden_size));
        let mut state = StepState::new(hidden_size);
        state.hidden = tensors.take_optional("H")?;
        let cell = tensors.take_optional("C")?;
        tensors.finish()?;
        Ok(Self {
            forget: forget?,
            input: input?,
            candidate: candidate?,
            output: output?,
            gate_activation,
            candidate_activation,
            cell,
            state,
        })
    }
}

impl From<Lstm> for super::Layer {
    fn from(layer: Lstm) -> Self {
        Self::Lstm(layer)
    }
}
