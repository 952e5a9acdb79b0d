//! Pieces shared by the recurrent layers.

use rand::Rng;

use crate::error::Result;
use crate::modelio::TensorSet;
use crate::tensors::{Tensor, WithGrad};

/// One gate: `x·W + h·U + b` before its activation.
#[derive(Debug, Clone)]
pub(super) struct Gate {
    /// `W: [input_size, hidden_size]`
    pub(super) input: WithGrad<Tensor>,
    /// `U: [hidden_size, hidden_size]`
    pub(super) recurrent: WithGrad<Tensor>,
    /// `b: [1, hidden_size]`
    pub(super) bias: WithGrad<Tensor>,
}

impl Gate {
    pub(super) fn new<R: Rng + ?Sized>(input_size: usize, hidden_size: usize, rng: &mut R) -> Self {
        Self {
            input: WithGrad::new(Tensor::xavier(input_size, hidden_size, rng)),
            recurrent: WithGrad::new(Tensor::xavier(hidden_size, hidden_size, rng)),
            bias: WithGrad::new(Tensor::zeros(vec![1, hidden_size])),
        }
    }

    pub(super) fn input_size(&self) -> usize {
        self.input.value.shape()[0]
    }

    pub(super) fn hidden_size(&self) -> usize {
        self.input.value.shape()[1]
    }

    pub(super) fn pre_activation(&self, x: &Tensor, h: &Tensor) -> Tensor {
        x.dot(&self.input.value)
            .add(&h.dot(&self.recurrent.value))
            .add_row_broadcast(&self.bias.value)
    }

    /// Adds the parameter gradients for pre-activation gradient `da`.
    pub(super) fn accumulate(&mut self, x: &Tensor, h: &Tensor, da: &Tensor) {
        self.input.grad.accumulate(&x.transpose().dot(da));
        self.recurrent.grad.accumulate(&h.transpose().dot(da));
        self.bias.grad.accumulate(&da.sum_along_batch());
    }

    pub(super) fn input_grad(&self, da: &Tensor) -> Tensor {
        da.dot(&self.input.value.transpose())
    }

    pub(super) fn hidden_grad(&self, da: &Tensor) -> Tensor {
        da.dot(&self.recurrent.value.transpose())
    }

    pub(super) fn load(
        tensors: &mut TensorSet,
        (w, u, b): (&str, &str, &str),
        input_size: usize,
        hidden_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            input: WithGrad::new(tensors.take_shaped(w, &[input_size, hidden_size])?),
            recurrent: WithGrad::new(tensors.take_shaped(u, &[hidden_size, hidden_size])?),
            bias: WithGrad::new(tensors.take_shaped(b, &[1, hidden_size])?),
        })
    }
}

/// Hidden state plus the stack of per-step caches used for backpropagation
/// through time. `C` is whatever gradient flows back into the previous step.
#[derive(Debug, Clone)]
pub(super) struct StepState<S, C = Tensor> {
    hidden_size: usize,
    pub(super) hidden: Option<Tensor>,
    pub(super) training: bool,
    history: Vec<S>,
    carry: Option<C>,
}

impl<S, C> StepState<S, C> {
    pub(super) fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            hidden: None,
            training: true,
            history: Vec::new(),
            carry: None,
        }
    }

    pub(super) fn reset(&mut self) {
        self.hidden = None;
        self.history.clear();
        self.carry = None;
    }

    /// Zero state of shape `[batch, hidden_size]` for an input of `batch` rows.
    pub(super) fn zeros_for(&self, x: &Tensor) -> Tensor {
        assert_eq!(x.rank(), 2, "recurrent input must be [batch, features], got {:?}", x.shape());
        Tensor::zeros(vec![x.shape()[0], self.hidden_size])
    }

    /// The hidden state entering this step.
    ///
    /// # Panics
    /// Panics if the batch size differs from the stored state.
    pub(super) fn previous(&self, x: &Tensor) -> Tensor {
        let zeros = self.zeros_for(x);
        match &self.hidden {
            Some(h) => {
                assert_eq!(
                    h.shape(),
                    zeros.shape(),
                    "hidden state shape changed; call reset_state between batch sizes"
                );
                h.clone()
            }
            None => zeros,
        }
    }

    /// Number of forward steps still waiting for a backward call.
    pub(super) fn depth(&self) -> usize {
        self.history.len()
    }

    /// Stores the new hidden state and, while training, the step cache.
    /// A new forward step starts a fresh backward chain.
    pub(super) fn push(&mut self, hidden: Tensor, step: S) {
        self.hidden = Some(hidden);
        self.carry = None;
        if self.training {
            self.history.push(step);
        }
    }

    /// Pops the most recent step together with the gradient carried from the later one.
    ///
    /// # Panics
    /// Panics when no step is cached.
    pub(super) fn pop(&mut self, owner: &str) -> (S, Option<C>) {
        let Some(step) = self.history.pop() else {
            panic!("{owner}::backward called with no cached forward step");
        };
        (step, self.carry.take())
    }

    /// Keeps the previous-step gradient only while earlier steps remain.
    pub(super) fn carry(&mut self, grad: C) {
        self.carry = if self.history.is_empty() { None } else { Some(grad) };
    }
}
