//! Grouped im2col + GEMM convolution engine.
//!
//! A [`ConvLayer`] is configured once from [`LayerParams`], bound to an input
//! shape by [`ConvLayer::allocate`], and then run any number of times with
//! [`ConvLayer::forward`]. For every sample and every channel group it
//! unfolds the input with im2col, multiplies by that group's kernel matrix
//! and broadcasts the bias. Deconvolution runs the same pipeline backwards:
//! transposed product into the column buffer, then col2im.
//!
//! A layer owns its scratch column buffer and mutates it on every call, so
//! `forward` takes `&mut self`. Independent layers share nothing and can run
//! on separate threads.

pub mod gemm;
pub mod im2col;
pub mod scratch;
pub mod shape;

use ndarray::ArrayView2;

use crate::blob::{AnyBlob, Blob, ElemType, Element};
use crate::config::{ConvGeometry, ConvMode};
use crate::error::{ConvError, Result};
use crate::params::LayerParams;

use self::im2col::{col2im, im2col};
use self::scratch::ScratchBuffers;
use self::shape::{DerivedShape, Dims3};

/// Lifecycle of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    /// Geometry and learned blobs are set; no input shape bound yet.
    Configured,
    /// Shape inferred and scratch sized; `forward` may be called.
    Ready,
}

/// A convolution or deconvolution layer over `f32` or `f64` blobs.
#[derive(Debug)]
pub struct ConvLayer<T: Element> {
    mode: ConvMode,
    geometry: ConvGeometry,
    weight: Blob<T>,
    bias: Option<Blob<T>>,
    shape: Option<DerivedShape>,
    scratch: ScratchBuffers<T>,
}

fn typed<T: Element>(blob: &AnyBlob) -> Result<&Blob<T>> {
    T::from_any(blob).ok_or(ConvError::ElementType {
        expected: T::ELEM_TYPE,
        found: blob.elem_type(),
    })
}

fn typed_mut<T: Element>(blob: &mut AnyBlob) -> Result<&mut Blob<T>> {
    let found = blob.elem_type();
    T::from_any_mut(blob).ok_or(ConvError::ElementType {
        expected: T::ELEM_TYPE,
        found,
    })
}

/// Per-sample dims of a rank-4 input.
fn sample_dims<T: Element>(index: usize, blob: &Blob<T>) -> Result<Dims3> {
    if blob.dims() != 4 {
        return Err(ConvError::InputRank {
            index,
            rank: blob.dims(),
        });
    }
    Ok(Dims3::new(blob.channels(), blob.rows(), blob.cols()))
}

impl<T: Element> ConvLayer<T> {
    /// Build a layer from parsed parameters.
    ///
    /// Reads the geometry keys and takes the weight blob (and the bias blob
    /// when `bias_term` is set) from `params.learned_blobs`.
    pub fn new(mode: ConvMode, params: &LayerParams) -> Result<Self> {
        let geometry = ConvGeometry::from_params(params)?;
        let needed = if geometry.bias_term { 2 } else { 1 };
        let blobs = &params.learned_blobs;
        if blobs.len() < needed {
            return Err(ConvError::MissingLearnedBlob {
                expected: needed,
                found: blobs.len(),
            });
        }
        if blobs.len() > needed {
            log::debug!(
                "layer `{}`: ignoring {} extra learned blob(s)",
                params.name,
                blobs.len() - needed
            );
        }

        let weight = typed::<T>(&blobs[0])?.clone();
        let bias = match geometry.bias_term {
            true => Some(typed::<T>(&blobs[1])?.clone()),
            false => None,
        };
        Self::from_parts(mode, geometry, weight, bias)
    }

    /// Build a layer from an explicit geometry and learned blobs.
    pub fn from_parts(
        mode: ConvMode,
        geometry: ConvGeometry,
        weight: Blob<T>,
        bias: Option<Blob<T>>,
    ) -> Result<Self> {
        geometry.validate()?;

        if weight.dims() != 4
            || weight.num() != geometry.num_output
            || weight.rows() != geometry.kernel_h
            || weight.cols() != geometry.kernel_w
        {
            return Err(ConvError::WeightShape {
                expected: format!(
                    "({}, _, {}, {})",
                    geometry.num_output, geometry.kernel_h, geometry.kernel_w
                ),
                found: weight.shape().to_vec(),
            });
        }

        let bias = match (bias, geometry.bias_term) {
            (None, true) => {
                return Err(ConvError::MissingLearnedBlob {
                    expected: 2,
                    found: 1,
                })
            }
            (Some(_), false) => {
                log::debug!("bias_term is false, dropping bias blob");
                None
            }
            (bias, _) => bias,
        };

        if let Some(b) = &bias {
            // Bias follows the produced channels: num_output forward,
            // reconstructed channels for deconvolution.
            let expected = match mode {
                ConvMode::Convolution => geometry.num_output,
                ConvMode::Deconvolution => weight.channels() * geometry.group,
            };
            if b.total() != expected {
                return Err(ConvError::BiasLength {
                    expected,
                    found: b.total(),
                });
            }
        }

        Ok(Self {
            mode,
            geometry,
            weight,
            bias,
            shape: None,
            scratch: ScratchBuffers::new(),
        })
    }

    pub fn mode(&self) -> ConvMode {
        self.mode
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }

    pub fn weight(&self) -> &Blob<T> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Blob<T>> {
        self.bias.as_ref()
    }

    pub fn state(&self) -> LayerState {
        match self.shape {
            Some(_) => LayerState::Ready,
            None => LayerState::Configured,
        }
    }

    /// Shape bound by the last successful `allocate`.
    pub fn derived_shape(&self) -> Option<&DerivedShape> {
        self.shape.as_ref()
    }

    pub fn scratch_bytes(&self) -> usize {
        self.scratch.footprint()
    }

    fn weight_dims(&self) -> [usize; 4] {
        [
            self.weight.num(),
            self.weight.channels(),
            self.weight.rows(),
            self.weight.cols(),
        ]
    }

    /// Infer the derived shape for one per-sample input shape without
    /// binding it.
    pub fn infer(&self, input: Dims3) -> Result<DerivedShape> {
        shape::infer(self.mode, input, &self.geometry, self.weight_dims())
    }

    /// Bind the layer to the shape of `inputs` and create one zeroed output
    /// blob per input.
    ///
    /// All inputs must be rank 4 and share the first input's per-sample
    /// shape; batch sizes may differ. On error the previous binding is kept.
    pub fn allocate(&mut self, inputs: &[&Blob<T>]) -> Result<Vec<Blob<T>>> {
        let first = inputs.first().ok_or(ConvError::NoInputs)?;
        let bottom = sample_dims(0, first)?;
        let shape = self.infer(bottom)?;

        let mut outputs = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let dims = sample_dims(index, input)?;
            if dims != bottom {
                return Err(ConvError::InputShape {
                    index,
                    expected: bottom.as_array(),
                    found: dims.as_array(),
                });
            }
            outputs.push(Blob::zeros(&shape.top_shape(input.num())));
        }

        if self.shape != Some(shape) {
            log::debug!(
                "{} {}: {} -> {} (groups {}, ksize {}, 1x1 {})",
                self.mode,
                T::ELEM_TYPE,
                shape.bottom(),
                shape.top(),
                self.geometry.group,
                shape.ksize,
                self.geometry.is_1x1()
            );
        }
        self.scratch
            .resize_for(&shape, self.geometry.is_1x1(), self.bias.is_some());
        self.shape = Some(shape);
        Ok(outputs)
    }

    /// Run the layer on `inputs`, writing into the blobs `allocate` returned.
    pub fn forward(&mut self, inputs: &[&Blob<T>], outputs: &mut [Blob<T>]) -> Result<()> {
        if outputs.len() != inputs.len() {
            return Err(ConvError::OutputCount {
                expected: inputs.len(),
                found: outputs.len(),
            });
        }
        for (index, (input, output)) in inputs.iter().zip(outputs.iter_mut()).enumerate() {
            self.forward_one(index, input, output)?;
        }
        Ok(())
    }

    /// Run the layer on a single input/output pair.
    pub fn forward_one(&mut self, index: usize, input: &Blob<T>, output: &mut Blob<T>) -> Result<()> {
        let shape = self.shape.ok_or(ConvError::NotAllocated)?;

        let dims = sample_dims(index, input)?;
        if dims != shape.bottom() {
            return Err(ConvError::InputShape {
                index,
                expected: shape.bottom().as_array(),
                found: dims.as_array(),
            });
        }
        let expected = shape.top_shape(input.num());
        if output.shape() != expected {
            return Err(ConvError::OutputShape {
                index,
                expected: expected.to_vec(),
                found: output.shape().to_vec(),
            });
        }

        log::trace!("{} forward: input {index} ({input})", self.mode);
        for n in 0..input.num() {
            for g in 0..self.geometry.group {
                match self.mode {
                    ConvMode::Convolution => self.conv_group(&shape, input, output, n, g)?,
                    ConvMode::Deconvolution => self.deconv_group(&shape, input, output, n, g)?,
                }
            }
        }
        Ok(())
    }

    fn conv_group(
        &mut self,
        shape: &DerivedShape,
        input: &Blob<T>,
        output: &mut Blob<T>,
        n: usize,
        g: usize,
    ) -> Result<()> {
        let inp_channels = g * shape.inp_group_cn..(g + 1) * shape.inp_group_cn;
        let out_channels = g * shape.out_group_cn..(g + 1) * shape.out_group_cn;

        let cols: ArrayView2<'_, T> = if self.geometry.is_1x1() {
            input.channel_block(n, inp_channels)?
        } else {
            let src = input.channel_slice(n, inp_channels)?;
            let img = Dims3::new(shape.inp_group_cn, shape.inp.height, shape.inp.width);
            im2col(
                src,
                img,
                (shape.out.height, shape.out.width),
                &self.geometry,
                self.scratch.col_mut(),
            );
            self.scratch.col_view()?
        };

        let kernel = self.weight.filter_block(out_channels.clone())?;
        let mut dst = output.channel_block_mut(n, out_channels.clone())?;
        gemm::conv_group(&kernel, &cols, &mut dst)?;

        if let Some(bias) = &self.bias {
            gemm::add_bias(&bias.column(out_channels)?, &self.scratch.ones_row()?, &mut dst)?;
        }
        Ok(())
    }

    fn deconv_group(
        &mut self,
        shape: &DerivedShape,
        input: &Blob<T>,
        output: &mut Blob<T>,
        n: usize,
        g: usize,
    ) -> Result<()> {
        // The consumed tensor is the strided `out` side.
        let inp_channels = g * shape.inp_group_cn..(g + 1) * shape.inp_group_cn;
        let out_channels = g * shape.out_group_cn..(g + 1) * shape.out_group_cn;

        let kernel = self.weight.filter_block(out_channels.clone())?;
        let src = input.channel_block(n, out_channels)?;

        if self.geometry.is_1x1() {
            let mut dst = output.channel_block_mut(n, inp_channels.clone())?;
            gemm::deconv_group(&kernel, &src, &mut dst)?;
        } else {
            gemm::deconv_group(&kernel, &src, &mut self.scratch.col_view_mut()?)?;
            let dst = output.channel_slice_mut(n, inp_channels.clone())?;
            dst.fill(T::zero());
            let img = Dims3::new(shape.inp_group_cn, shape.inp.height, shape.inp.width);
            col2im(
                self.scratch.col(),
                img,
                (shape.out.height, shape.out.width),
                &self.geometry,
                dst,
            );
        }

        if let Some(bias) = &self.bias {
            let mut dst = output.channel_block_mut(n, inp_channels.clone())?;
            gemm::add_bias(&bias.column(inp_channels)?, &self.scratch.ones_row()?, &mut dst)?;
        }
        Ok(())
    }
}

/// A layer whose element type is chosen at runtime from its weight blob.
#[derive(Debug)]
pub enum AnyConvLayer {
    F32(ConvLayer<f32>),
    F64(ConvLayer<f64>),
}

impl AnyConvLayer {
    pub fn new(mode: ConvMode, params: &LayerParams) -> Result<Self> {
        let weight = params
            .learned_blobs
            .first()
            .ok_or(ConvError::MissingLearnedBlob {
                expected: 1,
                found: 0,
            })?;
        Ok(match weight.elem_type() {
            ElemType::F32 => Self::F32(ConvLayer::new(mode, params)?),
            ElemType::F64 => Self::F64(ConvLayer::new(mode, params)?),
        })
    }

    pub fn elem_type(&self) -> ElemType {
        match self {
            Self::F32(_) => ElemType::F32,
            Self::F64(_) => ElemType::F64,
        }
    }

    pub fn mode(&self) -> ConvMode {
        match self {
            Self::F32(layer) => layer.mode(),
            Self::F64(layer) => layer.mode(),
        }
    }

    pub fn state(&self) -> LayerState {
        match self {
            Self::F32(layer) => layer.state(),
            Self::F64(layer) => layer.state(),
        }
    }

    pub fn infer(&self, input: Dims3) -> Result<DerivedShape> {
        match self {
            Self::F32(layer) => layer.infer(input),
            Self::F64(layer) => layer.infer(input),
        }
    }

    /// [`ConvLayer::allocate`] over blobs of the layer's element type.
    pub fn allocate(&mut self, inputs: &[&AnyBlob]) -> Result<Vec<AnyBlob>> {
        fn run<T: Element>(layer: &mut ConvLayer<T>, inputs: &[&AnyBlob]) -> Result<Vec<AnyBlob>> {
            let typed_inputs = inputs
                .iter()
                .map(|b| typed::<T>(b))
                .collect::<Result<Vec<_>>>()?;
            Ok(layer
                .allocate(&typed_inputs)?
                .into_iter()
                .map(T::into_any)
                .collect())
        }
        match self {
            Self::F32(layer) => run(layer, inputs),
            Self::F64(layer) => run(layer, inputs),
        }
    }

    /// [`ConvLayer::forward`] over blobs of the layer's element type.
    pub fn forward(&mut self, inputs: &[&AnyBlob], outputs: &mut [AnyBlob]) -> Result<()> {
        fn run<T: Element>(
            layer: &mut ConvLayer<T>,
            inputs: &[&AnyBlob],
            outputs: &mut [AnyBlob],
        ) -> Result<()> {
            if outputs.len() != inputs.len() {
                return Err(ConvError::OutputCount {
                    expected: inputs.len(),
                    found: outputs.len(),
                });
            }
            for (index, (input, output)) in inputs.iter().zip(outputs.iter_mut()).enumerate() {
                layer.forward_one(index, typed::<T>(input)?, typed_mut::<T>(output)?)?;
            }
            Ok(())
        }
        match self {
            Self::F32(layer) => run(layer, inputs, outputs),
            Self::F64(layer) => run(layer, inputs, outputs),
        }
    }
}
