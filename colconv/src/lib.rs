//! Grouped convolution and deconvolution via im2col + GEMM.
//!
//! Layers are configured from a [`params::LayerParams`] store (geometry keys
//! plus learned weight and bias blobs), bound to an input shape with
//! `allocate`, and run with `forward` over NCHW [`blob::Blob`]s of `f32` or
//! `f64`.

pub mod blob;
pub mod config;
pub mod engine;
pub mod error;
pub mod params;

pub use blob::{AnyBlob, Blob, ElemType, Element};
pub use config::{ConvGeometry, ConvMode};
pub use engine::shape::{DerivedShape, Dims3};
pub use engine::{AnyConvLayer, ConvLayer, LayerState};
pub use error::{ConvError, ParamError, Result, ValueError};
pub use params::{Dict, DictValue, LayerParams};
