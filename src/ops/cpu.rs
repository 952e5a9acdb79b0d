//! CPU tensor kernels
//!
//! Sequential loops plus `rayon` row-parallel variants of the same loops.
//!
//! ## Implemented Ops
//!
//! - `dot` / `par_dot`: row-major matrix product `[m, k] · [k, n]`
//! - `conv2d` / `par_conv2d`: direct convolution with implicit zero padding
//!
//! The parallel variants split the output into independent chunks
//! (one matrix row, or one `[out_h, out_w]` feature map) and compute each
//! element with exactly the same summation order as the sequential path.

use rayon::prelude::*;

use super::ConvGeometry;

fn dot_row(a: &[f64], b: &[f64], i: usize, k: usize, n: usize, row: &mut [f64]) {
    for (j, out) in row.iter_mut().enumerate() {
        let mut sum = 0.0;
        for l in 0..k {
            sum += a[i * k + l] * b[l * n + j];
        }
        *out = sum;
    }
}

/// Sequential matrix product of flat `a: [m, k]` and `b: [k, n]`.
#[must_use]
pub fn dot(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; m * n];
    if n == 0 {
        return out;
    }
    out.chunks_mut(n)
        .enumerate()
        .for_each(|(i, row)| dot_row(a, b, i, k, n, row));
    out
}

/// Row-parallel matrix product; each output row is one `rayon` task.
#[must_use]
pub fn par_dot(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; m * n];
    if n == 0 {
        return out;
    }
    out.par_chunks_mut(n)
        .enumerate()
        .for_each(|(i, row)| dot_row(a, b, i, k, n, row));
    out
}

/// Fills the `[out_h, out_w]` map for batch `b`, output channel `oc`.
fn conv_map(input: &[f64], kernel: &[f64], g: &ConvGeometry, b: usize, oc: usize, map: &mut [f64]) {
    for oh in 0..g.out_h {
        for ow in 0..g.out_w {
            let mut sum = 0.0;
            for c in 0..g.in_channels {
                for kh in 0..g.kernel_h {
                    for kw in 0..g.kernel_w {
                        if let Some((ih, iw)) = g.source(oh, ow, kh, kw) {
                            sum += input[g.input_offset(b, c, ih, iw)]
                                * kernel[g.kernel_offset(oc, c, kh, kw)];
                        }
                    }
                }
            }
            map[oh * g.out_w + ow] = sum;
        }
    }
}

/// Sequential direct convolution.
#[must_use]
pub fn conv2d(input: &[f64], kernel: &[f64], g: &ConvGeometry) -> Vec<f64> {
    let map_len = g.out_h * g.out_w;
    let mut out = vec![0.0; g.batch * g.out_channels * map_len];
    if map_len == 0 {
        return out;
    }
    out.chunks_mut(map_len).enumerate().for_each(|(idx, map)| {
        conv_map(input, kernel, g, idx / g.out_channels, idx % g.out_channels, map);
    });
    out
}

/// Convolution with one `rayon` task per output feature map.
#[must_use]
pub fn par_conv2d(input: &[f64], kernel: &[f64], g: &ConvGeometry) -> Vec<f64> {
    let map_len = g.out_h * g.out_w;
    let mut out = vec![0.0; g.batch * g.out_channels * map_len];
    if map_len == 0 {
        return out;
    }
    out.par_chunks_mut(map_len).enumerate().for_each(|(idx, map)| {
        conv_map(input, kernel, g, idx / g.out_channels, idx % g.out_channels, map);
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_dot_matches_sequential() {
        let a: Vec<f64> = (0..12).map(f64::from).collect();
        let b: Vec<f64> = (0..20).map(|v| f64::from(v) * 0.5).collect();
        assert_eq!(dot(&a, &b, 3, 4, 5), par_dot(&a, &b, 3, 4, 5));
    }

    #[test]
    fn parallel_conv_matches_sequential() {
        let g = ConvGeometry::new(&[2, 2, 5, 5], &[3, 2, 3, 3], 2, 1);
        let input: Vec<f64> = (0..100).map(|v| f64::from(v).sin()).collect();
        let kernel: Vec<f64> = (0..54).map(|v| f64::from(v).cos()).collect();
        assert_eq!(conv2d(&input, &kernel, &g), par_conv2d(&input, &kernel, &g));
    }
}
