use ndarray::{ArrayView2, ArrayViewMut2};

use crate::blob::Element;
use crate::error::Result;

use super::shape::DerivedShape;

/// Per-layer scratch memory reused across every sample and group.
///
/// Holds the column matrix and the ones row used to broadcast bias over
/// spatial positions. Both are resized only when the bound shape changes.
#[derive(Debug)]
pub struct ScratchBuffers<T> {
    col: Vec<T>,
    col_dims: (usize, usize),
    ones: Vec<T>,
}

impl<T: Element> Default for ScratchBuffers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> ScratchBuffers<T> {
    pub fn new() -> Self {
        Self {
            col: Vec::new(),
            col_dims: (0, 0),
            ones: Vec::new(),
        }
    }

    /// Size the buffers for `shape`. The column matrix is skipped on the
    /// 1x1 path and the ones row when the layer has no bias.
    pub fn resize_for(&mut self, shape: &DerivedShape, is_1x1: bool, bias: bool) {
        let col_dims = if is_1x1 { (0, 0) } else { (shape.ksize, shape.out.plane()) };
        if col_dims != self.col_dims {
            log::debug!(
                "column buffer {}x{} -> {}x{}",
                self.col_dims.0,
                self.col_dims.1,
                col_dims.0,
                col_dims.1
            );
            self.col = vec![T::zero(); col_dims.0 * col_dims.1];
            self.col_dims = col_dims;
        }

        let ones_len = if bias { shape.top().plane() } else { 0 };
        if ones_len != self.ones.len() {
            self.ones = vec![T::one(); ones_len];
        }
    }

    pub fn col_dims(&self) -> (usize, usize) {
        self.col_dims
    }

    pub fn col(&self) -> &[T] {
        &self.col
    }

    pub fn col_mut(&mut self) -> &mut [T] {
        &mut self.col
    }

    pub fn col_view(&self) -> Result<ArrayView2<'_, T>> {
        Ok(ArrayView2::from_shape(self.col_dims, &self.col)?)
    }

    pub fn col_view_mut(&mut self) -> Result<ArrayViewMut2<'_, T>> {
        Ok(ArrayViewMut2::from_shape(self.col_dims, &mut self.col)?)
    }

    /// The `(1, top_h*top_w)` row of ones.
    pub fn ones_row(&self) -> Result<ArrayView2<'_, T>> {
        Ok(ArrayView2::from_shape((1, self.ones.len()), &self.ones)?)
    }

    /// Bytes currently held.
    pub fn footprint(&self) -> usize {
        (self.col.capacity() + self.ones.capacity()) * std::mem::size_of::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConvMode;
    use crate::engine::shape::Dims3;

    fn shape(mode: ConvMode, ksize: usize, out: (usize, usize), inp: (usize, usize)) -> DerivedShape {
        DerivedShape {
            mode,
            inp: Dims3::new(1, inp.0, inp.1),
            out: Dims3::new(1, out.0, out.1),
            inp_group_cn: 1,
            out_group_cn: 1,
            ksize,
        }
    }

    #[test]
    fn sizes_follow_shape() {
        let mut scratch = ScratchBuffers::<f32>::new();
        scratch.resize_for(&shape(ConvMode::Convolution, 9, (4, 5), (6, 7)), false, true);
        assert_eq!(scratch.col_dims(), (9, 20));
        assert_eq!(scratch.col_view().unwrap().dim(), (9, 20));
        assert_eq!(scratch.ones_row().unwrap().dim(), (1, 20));

        // Transposed layers broadcast bias over the reconstructed plane.
        scratch.resize_for(&shape(ConvMode::Deconvolution, 9, (4, 5), (6, 7)), false, true);
        assert_eq!(scratch.col_dims(), (9, 20));
        assert_eq!(scratch.ones_row().unwrap().dim(), (1, 42));
        assert!(scratch.ones_row().unwrap().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn one_by_one_and_no_bias_hold_nothing() {
        let mut scratch = ScratchBuffers::<f64>::new();
        scratch.resize_for(&shape(ConvMode::Convolution, 4, (3, 3), (3, 3)), true, false);
        assert_eq!(scratch.col_dims(), (0, 0));
        assert_eq!(scratch.ones_row().unwrap().dim(), (1, 0));
        assert_eq!(scratch.footprint(), 0);
    }

    #[test]
    fn unchanged_shape_keeps_buffer() {
        let mut scratch = ScratchBuffers::<f32>::new();
        let s = shape(ConvMode::Convolution, 2, (2, 2), (3, 3));
        scratch.resize_for(&s, false, false);
        scratch.col_mut()[0] = 5.0;
        scratch.resize_for(&s, false, false);
        assert_eq!(scratch.col_mut()[0], 5.0);
    }
}
