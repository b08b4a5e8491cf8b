//! Error types for parameter parsing and the convolution engine.

use thiserror::Error;

use crate::blob::ElemType;

/// Failure converting a single `DictValue` to a requested Rust type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error("holds {found}, cannot be read as {requested}")]
    TypeMismatch {
        found: &'static str,
        requested: &'static str,
    },

    #[error("value {value} is out of range for {requested}")]
    OutOfRange {
        value: String,
        requested: &'static str,
    },
}

/// Errors produced by the named parameter store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    #[error("required parameter `{0}` is missing")]
    Missing(String),

    #[error("parameter `{name}` {source}")]
    Value {
        name: String,
        #[source]
        source: ValueError,
    },

    #[error("parameter `{present}` is set but its counterpart `{missing}` is not")]
    Unpaired {
        present: String,
        missing: String,
    },
}

/// Errors produced by the convolution engine and its tensor container.
#[derive(Debug, Error)]
pub enum ConvError {
    #[error(transparent)]
    Param(#[from] ParamError),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("layer needs {expected} learned blob(s), got {found}")]
    MissingLearnedBlob { expected: usize, found: usize },

    #[error("weight blob has shape {found:?}, expected {expected}")]
    WeightShape { expected: String, found: Vec<usize> },

    #[error("bias blob holds {found} values, expected {expected}")]
    BiasLength { expected: usize, found: usize },

    #[error("allocate called with no inputs")]
    NoInputs,

    #[error("input {index} has rank {rank}, expected 4")]
    InputRank { index: usize, rank: usize },

    #[error("element type mismatch: expected {expected}, found {found}")]
    ElementType { expected: ElemType, found: ElemType },

    #[error("input {index} has per-sample shape {found:?}, expected {expected:?}")]
    InputShape {
        index: usize,
        expected: [usize; 3],
        found: [usize; 3],
    },

    #[error("forward called before allocate")]
    NotAllocated,

    #[error("expected {expected} output blob(s), got {found}")]
    OutputCount { expected: usize, found: usize },

    #[error("output {index} has shape {found:?}, expected {expected:?}")]
    OutputShape {
        index: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("blob shape {shape:?} needs {expected} values, got {found}")]
    DataLength {
        shape: Vec<usize>,
        expected: usize,
        found: usize,
    },

    #[error("block {what} out of range for blob of shape {shape:?}")]
    BlockOutOfRange { what: String, shape: Vec<usize> },

    #[error("matrix product {a:?} x {b:?} does not fit destination {c:?}")]
    GemmShape {
        a: (usize, usize),
        b: (usize, usize),
        c: (usize, usize),
    },

    #[error(transparent)]
    Layout(#[from] ndarray::ShapeError),
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, ConvError>;
