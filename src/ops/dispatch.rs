//! Kernel dispatch.
//!
//! Selects the sequential or parallel CPU kernel for each operation based on
//! the global [`Execution`] mode.

use crate::backend::{get_execution, Execution};

use super::ConvGeometry;

/// Dispatches a flat `[m, k] · [k, n]` matrix product.
#[must_use]
pub fn dot(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    match get_execution() {
        Execution::Parallel => super::cpu::par_dot(a, b, m, k, n),
        Execution::Sequential => super::cpu::dot(a, b, m, k, n),
    }
}

/// Dispatches a direct 2-D convolution.
#[must_use]
pub fn conv2d(input: &[f64], kernel: &[f64], geometry: &ConvGeometry) -> Vec<f64> {
    match get_execution() {
        Execution::Parallel => super::cpu::par_conv2d(input, kernel, geometry),
        Execution::Sequential => super::cpu::conv2d(input, kernel, geometry),
    }
}
