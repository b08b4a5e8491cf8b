//! Per-group dense products, routed through `ndarray::linalg::general_mat_mul`.

use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewMut2};

use crate::blob::Element;
use crate::error::{ConvError, Result};

fn check(a: (usize, usize), b: (usize, usize), c: (usize, usize)) -> Result<()> {
    if a.1 != b.0 || c != (a.0, b.1) {
        return Err(ConvError::GemmShape { a, b, c });
    }
    Ok(())
}

/// `dst = kernel × cols`
///
/// kernel: `(out_group_cn, ksize)`, cols: `(ksize, out_h*out_w)`.
pub fn conv_group<T: Element>(
    kernel: &ArrayView2<'_, T>,
    cols: &ArrayView2<'_, T>,
    dst: &mut ArrayViewMut2<'_, T>,
) -> Result<()> {
    check(kernel.dim(), cols.dim(), dst.dim())?;
    general_mat_mul(T::one(), kernel, cols, T::zero(), dst);
    Ok(())
}

/// `cols = kernelᵗ × src`
///
/// kernel: `(out_group_cn, ksize)`, src: `(out_group_cn, out_h*out_w)`.
pub fn deconv_group<T: Element>(
    kernel: &ArrayView2<'_, T>,
    src: &ArrayView2<'_, T>,
    cols: &mut ArrayViewMut2<'_, T>,
) -> Result<()> {
    let kernel_t = kernel.t();
    check(kernel_t.dim(), src.dim(), cols.dim())?;
    general_mat_mul(T::one(), &kernel_t, src, T::zero(), cols);
    Ok(())
}

/// `dst += bias × ones`, the outer product that broadcasts one value per
/// channel across every spatial position.
pub fn add_bias<T: Element>(
    bias: &ArrayView2<'_, T>,
    ones: &ArrayView2<'_, T>,
    dst: &mut ArrayViewMut2<'_, T>,
) -> Result<()> {
    check(bias.dim(), ones.dim(), dst.dim())?;
    general_mat_mul(T::one(), bias, ones, T::one(), dst);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn conv_group_overwrites_destination() {
        let kernel = array![[1.0f32, 2.0], [0.0, -1.0]];
        let cols = array![[1.0f32, 0.0, 2.0], [3.0, 1.0, 0.0]];
        let mut dst = Array2::from_elem((2, 3), 99.0f32);
        conv_group(&kernel.view(), &cols.view(), &mut dst.view_mut()).unwrap();
        assert_eq!(dst, array![[7.0, 2.0, 2.0], [-3.0, -1.0, 0.0]]);
    }

    #[test]
    fn deconv_group_uses_transpose() {
        let kernel = array![[1.0f64, 2.0, 3.0]];
        let src = array![[1.0f64, -1.0]];
        let mut cols = Array2::zeros((3, 2));
        deconv_group(&kernel.view(), &src.view(), &mut cols.view_mut()).unwrap();
        assert_eq!(cols, array![[1.0, -1.0], [2.0, -2.0], [3.0, -3.0]]);
    }

    #[test]
    fn bias_is_added_per_row() {
        let bias = array![[0.5f32], [-1.0]];
        let ones = Array2::from_elem((1, 3), 1.0f32);
        let mut dst = array![[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]];
        add_bias(&bias.view(), &ones.view(), &mut dst.view_mut()).unwrap();
        assert_eq!(dst, array![[1.5, 2.5, 3.5], [-1.0, -1.0, -1.0]]);
    }

    #[test]
    fn mismatched_dims_are_errors() {
        let kernel = Array2::<f32>::zeros((2, 3));
        let cols = Array2::<f32>::zeros((2, 4));
        let mut dst = Array2::<f32>::zeros((2, 4));
        let err = conv_group(&kernel.view(), &cols.view(), &mut dst.view_mut()).unwrap_err();
        assert!(matches!(err, ConvError::GemmShape { .. }));
    }
}
