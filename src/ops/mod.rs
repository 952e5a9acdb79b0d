//! # Tensor Kernels
//!
//! Raw loops behind [`Tensor::dot`](crate::tensors::Tensor::dot) and
//! [`Tensor::conv2d`](crate::tensors::Tensor::conv2d).
//!
//! ## Submodules
//!
//! - [`cpu`]: sequential and `rayon` row-parallel implementations
//! - [`dispatch`]: picks one based on [`crate::backend::get_execution`]
//!
//! Shape checks live in `Tensor` (and in [`ConvGeometry::new`]); kernels
//! work on flat slices and trust the dimensions they are given.

pub mod cpu;
pub mod dispatch;

/// Dimensions of one 2-D convolution, shared by the forward kernel and the
/// layer backward pass so both walk the same index mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_channels: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvGeometry {
    /// Derives the output size from an input `[batch, channels, h, w]` and
    /// kernel `[out_channels, channels, kh, kw]`.
    ///
    /// # Panics
    /// Panics if either shape is not rank 4, the channel counts differ,
    /// `stride` is zero, or the padded input is smaller than the kernel.
    #[must_use]
    pub fn new(input: &[usize], kernel: &[usize], stride: usize, padding: usize) -> Self {
        assert!(
            input.len() == 4 && kernel.len() == 4,
            "conv2d requires rank-4 tensors, got {input:?} and {kernel:?}"
        );
        assert_eq!(
            input[1], kernel[1],
            "conv2d channel mismatch: input {input:?}, kernel {kernel:?}"
        );
        assert!(stride > 0, "conv2d stride must be positive");
        assert!(
            input[2] + 2 * padding >= kernel[2] && input[3] + 2 * padding >= kernel[3],
            "conv2d kernel {kernel:?} larger than padded input {input:?}"
        );
        Self {
            batch: input[0],
            in_channels: input[1],
            in_h: input[2],
            in_w: input[3],
            out_channels: kernel[0],
            kernel_h: kernel[2],
            kernel_w: kernel[3],
            out_h: (input[2] + 2 * padding - kernel[2]) / stride + 1,
            out_w: (input[3] + 2 * padding - kernel[3]) / stride + 1,
            stride,
            padding,
        }
    }

    #[must_use]
    pub fn output_shape(&self) -> Vec<usize> {
        vec![self.batch, self.out_channels, self.out_h, self.out_w]
    }

    /// Source position `(ih, iw)` read by output `(oh, ow)` at kernel tap
    /// `(kh, kw)`, or `None` when it falls into the padding.
    #[inline]
    #[must_use]
    pub fn source(&self, oh: usize, ow: usize, kh: usize, kw: usize) -> Option<(usize, usize)> {
        let ih = (oh * self.stride + kh).checked_sub(self.padding)?;
        let iw = (ow * self.stride + kw).checked_sub(self.padding)?;
        (ih < self.in_h && iw < self.in_w).then_some((ih, iw))
    }

    #[inline]
    #[must_use]
    pub fn input_offset(&self, b: usize, c: usize, ih: usize, iw: usize) -> usize {
        ((b * self.in_channels + c) * self.in_h + ih) * self.in_w + iw
    }

    #[inline]
    #[must_use]
    pub fn kernel_offset(&self, oc: usize, c: usize, kh: usize, kw: usize) -> usize {
        ((oc * self.in_channels + c) * self.kernel_h + kh) * self.kernel_w + kw
    }

    #[inline]
    #[must_use]
    pub fn output_offset(&self, b: usize, oc: usize, oh: usize, ow: usize) -> usize {
        ((b * self.out_channels + oc) * self.out_h + oh) * self.out_w + ow
    }
}

#[cfg(test)]
mod tests {
    use super::ConvGeometry;

    #[test]
    fn same_padding_keeps_size() {
        let g = ConvGeometry::new(&[1, 1, 28, 28], &[32, 1, 5, 5], 1, 2);
        assert_eq!(g.output_shape(), vec![1, 32, 28, 28]);
    }

    #[test]
    fn padding_positions_are_skipped() {
        let g = ConvGeometry::new(&[1, 1, 3, 3], &[1, 1, 3, 3], 1, 1);
        assert_eq!(g.source(0, 0, 0, 0), None);
        assert_eq!(g.source(0, 0, 1, 1), Some((0, 0)));
        assert_eq!(g.source(2, 2, 2, 2), None);
    }
}
