//! Window gather (im2col) and scatter-add (col2im).
//!
//! The column matrix has `channels * kernel_h * kernel_w` rows, one per
//! (channel, kernel row, kernel col), and `col_h * col_w` columns, one per
//! window position. Taps that land in the padding read as zero on gather and
//! are dropped on scatter.

use std::ops::Range;

use crate::blob::Element;
use crate::config::ConvGeometry;

use super::shape::Dims3;

/// Window positions along one axis whose tap `k` stays inside the image.
///
/// Position `o` reads image index `o * stride + k - pad`; the returned range
/// covers exactly the `o < col_len` for which that index is in `0..img_len`.
fn valid_positions(img_len: usize, col_len: usize, k: usize, pad: usize, stride: usize) -> Range<usize> {
    let lo = if k < pad { (pad - k).div_ceil(stride) } else { 0 };
    let hi = if img_len + pad > k {
        ((img_len + pad - k - 1) / stride + 1).min(col_len)
    } else {
        0
    };
    lo..hi.max(lo)
}

/// Unfold `src` (`img.channels` planes of `img.height x img.width`) into
/// `col`, which must hold `img.channels * kh * kw * col_h * col_w` values.
pub fn im2col<T: Element>(src: &[T], img: Dims3, col_hw: (usize, usize), geometry: &ConvGeometry, col: &mut [T]) {
    let (kh, kw) = (geometry.kernel_h, geometry.kernel_w);
    let (sh, sw) = (geometry.stride_h, geometry.stride_w);
    let (ph, pw) = (geometry.pad_h, geometry.pad_w);
    let (col_h, col_w) = col_hw;
    let col_plane = col_h * col_w;
    debug_assert_eq!(src.len(), img.channels * img.plane());
    debug_assert_eq!(col.len(), img.channels * kh * kw * col_plane);

    col.fill(T::zero());

    for c in 0..img.channels {
        let img_base = c * img.plane();
        for ki in 0..kh {
            let rows = valid_positions(img.height, col_h, ki, ph, sh);
            for kj in 0..kw {
                let col_row = ((c * kh + ki) * kw + kj) * col_plane;
                let cols = valid_positions(img.width, col_w, kj, pw, sw);
                if cols.is_empty() {
                    continue;
                }
                let iw_base = cols.start * sw + kj - pw;

                for oh in rows.clone() {
                    let ih = oh * sh + ki - ph;
                    let src_row = img_base + ih * img.width;
                    let dst_row = col_row + oh * col_w;

                    let mut iw = iw_base;
                    for ow in cols.clone() {
                        col[dst_row + ow] = src[src_row + iw];
                        iw += sw;
                    }
                }
            }
        }
    }
}

/// Fold `col` back into `dst`, adding every tap onto the image element it
/// was gathered from. Overlapping windows accumulate; `dst` is not cleared.
pub fn col2im<T: Element>(col: &[T], img: Dims3, col_hw: (usize, usize), geometry: &ConvGeometry, dst: &mut [T]) {
    let (kh, kw) = (geometry.kernel_h, geometry.kernel_w);
    let (sh, sw) = (geometry.stride_h, geometry.stride_w);
    let (ph, pw) = (geometry.pad_h, geometry.pad_w);
    let (col_h, col_w) = col_hw;
    let col_plane = col_h * col_w;
    debug_assert_eq!(dst.len(), img.channels * img.plane());
    debug_assert_eq!(col.len(), img.channels * kh * kw * col_plane);

    for c in 0..img.channels {
        let img_base = c * img.plane();
        for ki in 0..kh {
            let rows = valid_positions(img.height, col_h, ki, ph, sh);
            for kj in 0..kw {
                let col_row = ((c * kh + ki) * kw + kj) * col_plane;
                let cols = valid_positions(img.width, col_w, kj, pw, sw);
                if cols.is_empty() {
                    continue;
                }
                let iw_base = cols.start * sw + kj - pw;

                for oh in rows.clone() {
                    let ih = oh * sh + ki - ph;
                    let dst_row = img_base + ih * img.width;
                    let src_row = col_row + oh * col_w;

                    let mut iw = iw_base;
                    for ow in cols.clone() {
                        dst[dst_row + iw] = dst[dst_row + iw] + col[src_row + ow];
                        iw += sw;
                    }
                }
            }
        }
    }
}
