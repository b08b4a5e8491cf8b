//! Output/input geometry for forward and transposed convolution.
//!
//! Both variants describe the same pair of tensors: the full-resolution
//! image side (`inp`) and the strided column side (`out`). Forward
//! convolution reads `inp` and produces `out`; deconvolution reads `out` and
//! reconstructs `inp`. `top` is whichever one the layer produces.

use std::fmt;

use crate::config::{ConvGeometry, ConvMode};
use crate::error::{ConvError, Result};

/// Channel count and spatial extent of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dims3 {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Dims3 {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Per-sample dims of an NCHW shape.
    pub fn of(shape: [usize; 4]) -> Self {
        Self::new(shape[1], shape[2], shape[3])
    }

    pub fn plane(&self) -> usize {
        self.height * self.width
    }

    pub fn as_array(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }
}

impl fmt::Display for Dims3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.channels, self.height, self.width)
    }
}

/// Geometry derived from a layer's hyperparameters and one input shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedShape {
    pub mode: ConvMode,
    /// Full-resolution image side.
    pub inp: Dims3,
    /// Strided column side.
    pub out: Dims3,
    pub inp_group_cn: usize,
    pub out_group_cn: usize,
    /// Rows of the column matrix: `inp_group_cn * kernel_h * kernel_w`.
    pub ksize: usize,
}

impl DerivedShape {
    /// Per-sample dims of the tensor the layer consumes.
    pub fn bottom(&self) -> Dims3 {
        match self.mode {
            ConvMode::Convolution => self.inp,
            ConvMode::Deconvolution => self.out,
        }
    }

    /// Per-sample dims of the tensor the layer produces.
    pub fn top(&self) -> Dims3 {
        match self.mode {
            ConvMode::Convolution => self.out,
            ConvMode::Deconvolution => self.inp,
        }
    }

    /// NCHW shape of the output for a batch of `num` samples.
    pub fn top_shape(&self, num: usize) -> [usize; 4] {
        let top = self.top();
        [num, top.channels, top.height, top.width]
    }

    /// Elements in the column matrix.
    pub fn col_len(&self) -> usize {
        self.ksize * self.out.plane()
    }
}

/// Infer the derived shape for `mode`.
///
/// `weight` is the NCHW shape of the weight blob:
/// `(num_output, channels_per_group, kernel_h, kernel_w)`.
pub fn infer(
    mode: ConvMode,
    input: Dims3,
    geometry: &ConvGeometry,
    weight: [usize; 4],
) -> Result<DerivedShape> {
    match mode {
        ConvMode::Convolution => infer_forward(input, geometry, weight),
        ConvMode::Deconvolution => infer_transposed(input, geometry, weight),
    }
}

/// Forward convolution:
/// `out = (in + 2*pad - kernel) / stride + 1`, truncating.
pub fn infer_forward(input: Dims3, geometry: &ConvGeometry, weight: [usize; 4]) -> Result<DerivedShape> {
    let out_h = forward_extent(input.height, geometry.kernel_h, geometry.pad_h, geometry.stride_h, "height")?;
    let out_w = forward_extent(input.width, geometry.kernel_w, geometry.pad_w, geometry.stride_w, "width")?;
    let out = Dims3::new(weight[0], out_h, out_w);
    finish(ConvMode::Convolution, input, out, geometry, weight)
}

/// Transposed convolution: treats `input` as the strided tensor and
/// reconstructs `stride*(in - 1) + kernel - 2*pad`.
pub fn infer_transposed(input: Dims3, geometry: &ConvGeometry, weight: [usize; 4]) -> Result<DerivedShape> {
    let inp_h = transposed_extent(input.height, geometry.kernel_h, geometry.pad_h, geometry.stride_h, "height")?;
    let inp_w = transposed_extent(input.width, geometry.kernel_w, geometry.pad_w, geometry.stride_w, "width")?;
    let inp = Dims3::new(weight[1] * geometry.group, inp_h, inp_w);
    finish(ConvMode::Deconvolution, inp, input, geometry, weight)
}

fn overflow(axis: &str) -> ConvError {
    ConvError::InvalidGeometry(format!("{axis} arithmetic overflows"))
}

fn forward_extent(size: usize, kernel: usize, pad: usize, stride: usize, axis: &str) -> Result<usize> {
    let padded = pad
        .checked_mul(2)
        .and_then(|p| p.checked_add(size))
        .ok_or_else(|| overflow(axis))?;
    if padded < kernel {
        return Err(ConvError::InvalidGeometry(format!(
            "padded input {axis} {padded} is smaller than kernel {kernel}"
        )));
    }
    let span = padded - kernel;
    if span % stride != 0 {
        log::debug!(
            "output {axis} truncated: ({size} + 2*{pad} - {kernel}) is not a multiple of stride {stride}"
        );
    }
    Ok(span / stride + 1)
}

fn transposed_extent(size: usize, kernel: usize, pad: usize, stride: usize, axis: &str) -> Result<usize> {
    if size == 0 {
        return Err(ConvError::InvalidGeometry(format!("input {axis} is zero")));
    }
    let full = stride
        .checked_mul(size - 1)
        .and_then(|v| v.checked_add(kernel))
        .ok_or_else(|| overflow(axis))?;
    if pad.checked_mul(2).map_or(true, |p| full <= p) {
        return Err(ConvError::InvalidGeometry(format!(
            "reconstructed {axis} is not positive: {stride}*({size}-1) + {kernel} - 2*{pad}"
        )));
    }
    Ok(full - 2 * pad)
}

fn finish(
    mode: ConvMode,
    inp: Dims3,
    out: Dims3,
    geometry: &ConvGeometry,
    weight: [usize; 4],
) -> Result<DerivedShape> {
    let group = geometry.group;
    if inp.channels % group != 0 || out.channels % group != 0 {
        return Err(ConvError::InvalidGeometry(format!(
            "channels {} -> {} are not divisible by group {group}",
            inp.channels, out.channels
        )));
    }
    let inp_group_cn = inp.channels / group;
    let out_group_cn = out.channels / group;
    if weight[1] != inp_group_cn {
        return Err(ConvError::WeightShape {
            expected: format!("{} channels per filter", inp_group_cn),
            found: weight.to_vec(),
        });
    }
    if weight[0] != out.channels {
        return Err(ConvError::WeightShape {
            expected: format!("{} filters", out.channels),
            found: weight.to_vec(),
        });
    }
    let ksize = geometry
        .kernel_h
        .checked_mul(geometry.kernel_w)
        .and_then(|k| k.checked_mul(inp_group_cn))
        .ok_or_else(|| overflow("kernel size"))?;
    for dims in [inp, out] {
        dims.height
            .checked_mul(dims.width)
            .and_then(|p| p.checked_mul(ksize.max(dims.channels)))
            .ok_or_else(|| overflow("buffer size"))?;
    }
    Ok(DerivedShape {
        mode,
        inp,
        out,
        inp_group_cn,
        out_group_cn,
        ksize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(kernel: usize, pad: usize, stride: usize, group: usize, num_output: usize) -> ConvGeometry {
        ConvGeometry {
            kernel_h: kernel,
            kernel_w: kernel,
            pad_h: pad,
            pad_w: pad,
            stride_h: stride,
            stride_w: stride,
            group,
            num_output,
            bias_term: false,
        }
    }

    #[test]
    fn forward_same_padding() {
        let g = geometry(3, 1, 1, 1, 8);
        let s = infer_forward(Dims3::new(3, 32, 32), &g, [8, 3, 3, 3]).unwrap();
        assert_eq!(s.top(), Dims3::new(8, 32, 32));
        assert_eq!(s.bottom(), Dims3::new(3, 32, 32));
        assert_eq!(s.ksize, 27);
        assert_eq!(s.col_len(), 27 * 32 * 32);
    }

    #[test]
    fn forward_truncates_partial_windows() {
        let g = geometry(3, 0, 2, 1, 1);
        let s = infer_forward(Dims3::new(1, 8, 8), &g, [1, 1, 3, 3]).unwrap();
        assert_eq!((s.out.height, s.out.width), (3, 3));
    }

    #[test]
    fn transposed_inverts_forward() {
        for &(kernel, pad, stride) in &[(3, 1, 1), (5, 2, 2), (2, 0, 2), (4, 1, 2), (1, 0, 1), (3, 0, 3)] {
            let g = geometry(kernel, pad, stride, 2, 6);
            // (in + 2*pad - kernel) divisible by stride
            let size = kernel - 2 * pad.min(kernel / 2) + stride * 4;
            let fwd = infer_forward(Dims3::new(4, size, size + stride), &g, [6, 2, kernel, kernel]).unwrap();
            let back = infer_transposed(fwd.top(), &g, [6, 2, kernel, kernel]).unwrap();
            assert_eq!(back.top(), fwd.bottom(), "kernel {kernel} pad {pad} stride {stride}");
            assert_eq!(back.inp, fwd.inp);
            assert_eq!(back.out, fwd.out);
            assert_eq!(back.ksize, fwd.ksize);
        }
    }

    #[test]
    fn transposed_channels_come_from_filter_depth() {
        let g = geometry(2, 0, 2, 2, 4);
        let s = infer_transposed(Dims3::new(4, 2, 2), &g, [4, 3, 2, 2]).unwrap();
        assert_eq!(s.top(), Dims3::new(6, 4, 4));
        assert_eq!(s.inp_group_cn, 3);
        assert_eq!(s.out_group_cn, 2);
    }

    #[test]
    fn depth_mismatch_is_rejected() {
        let g = geometry(3, 1, 1, 2, 4);
        let err = infer_forward(Dims3::new(6, 5, 5), &g, [4, 2, 3, 3]).unwrap_err();
        assert!(matches!(err, ConvError::WeightShape { .. }));
        let err = infer_forward(Dims3::new(5, 5, 5), &g, [4, 2, 3, 3]).unwrap_err();
        assert!(matches!(err, ConvError::InvalidGeometry(_)));
    }

    #[test]
    fn transposed_input_channels_must_match_filters() {
        let g = geometry(2, 0, 2, 1, 4);
        let err = infer_transposed(Dims3::new(3, 2, 2), &g, [4, 1, 2, 2]).unwrap_err();
        assert!(matches!(err, ConvError::WeightShape { .. }));
    }

    #[test]
    fn oversized_geometry_is_an_error() {
        let g = geometry(3, usize::MAX / 2 + 1, 1, 1, 1);
        let err = infer_forward(Dims3::new(1, 4, 4), &g, [1, 1, 3, 3]).unwrap_err();
        assert!(matches!(err, ConvError::InvalidGeometry(_)));

        let g = geometry(3, 0, usize::MAX / 2, 1, 1);
        let err = infer_transposed(Dims3::new(1, 4, 4), &g, [1, 1, 3, 3]).unwrap_err();
        assert!(matches!(err, ConvError::InvalidGeometry(_)));

        let g = geometry(1, usize::MAX / 2 + 1, 1, 1, 1);
        let err = infer_transposed(Dims3::new(1, 4, 4), &g, [1, 1, 1, 1]).unwrap_err();
        assert!(matches!(err, ConvError::InvalidGeometry(_)));
    }

    #[test]
    fn degenerate_extents_fail() {
        let g = geometry(5, 0, 1, 1, 1);
        assert!(infer_forward(Dims3::new(1, 3, 8), &g, [1, 1, 5, 5]).is_err());
        let g = geometry(1, 1, 1, 1, 1);
        assert!(infer_transposed(Dims3::new(1, 1, 1), &g, [1, 1, 1, 1]).is_err());
        assert!(infer_transposed(Dims3::new(1, 0, 1), &g, [1, 1, 1, 1]).is_err());
    }
}
