//! Dense NCHW tensor container and its binary file format.
//!
//! File format (all multi-byte values are big-endian):
//! ```text
//! [magic:   4 bytes]  0x43 0x47 0x42 0x00  ("CGB\0")
//! [version: 1 byte ]  0x01
//! [dtype:   1 byte ]  0 = f32, 1 = f64
//! [rank:    1 byte ]
//! for each axis:
//!     [dim: 4 bytes]
//! [data: product(dims) elements]
//! ```

use std::fmt;
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::ops::Range;
use std::path::Path;

use anyhow::{bail, ensure, Context};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{ArrayView2, ArrayViewMut2, LinalgScalar};
use serde::{Deserialize, Serialize};

use crate::error::{ConvError, Result};

const MAGIC: [u8; 4] = [0x43, 0x47, 0x42, 0x00]; // "CGB\0"
const VERSION: u8 = 1;
const MAX_RANK: u8 = 8;

/// Runtime tag for the floating-point element types the engine supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElemType {
    F32,
    F64,
}

impl ElemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::F32 => 0,
            Self::F64 => 1,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::F32),
            1 => Some(Self::F64),
            _ => None,
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Floating-point element stored in a [`Blob`].
///
/// Implemented for `f32` and `f64` only; every kernel in the crate is
/// instantiated per element type, never converted between them.
pub trait Element: LinalgScalar + PartialOrd + fmt::Debug + fmt::Display + Send + Sync {
    const ELEM_TYPE: ElemType;

    fn into_any(blob: Blob<Self>) -> AnyBlob;

    fn from_any(blob: &AnyBlob) -> Option<&Blob<Self>>;

    fn from_any_mut(blob: &mut AnyBlob) -> Option<&mut Blob<Self>>;

    fn read_be_into<R: Read>(reader: &mut R, dst: &mut [Self]) -> io::Result<()>;

    fn write_be<W: Write>(writer: &mut W, value: Self) -> io::Result<()>;
}

impl Element for f32 {
    const ELEM_TYPE: ElemType = ElemType::F32;

    fn into_any(blob: Blob<Self>) -> AnyBlob {
        AnyBlob::F32(blob)
    }

    fn from_any(blob: &AnyBlob) -> Option<&Blob<Self>> {
        match blob {
            AnyBlob::F32(b) => Some(b),
            AnyBlob::F64(_) => None,
        }
    }

    fn from_any_mut(blob: &mut AnyBlob) -> Option<&mut Blob<Self>> {
        match blob {
            AnyBlob::F32(b) => Some(b),
            AnyBlob::F64(_) => None,
        }
    }

    fn read_be_into<R: Read>(reader: &mut R, dst: &mut [Self]) -> io::Result<()> {
        reader.read_f32_into::<BigEndian>(dst)
    }

    fn write_be<W: Write>(writer: &mut W, value: Self) -> io::Result<()> {
        writer.write_f32::<BigEndian>(value)
    }
}

impl Element for f64 {
    const ELEM_TYPE: ElemType = ElemType::F64;

    fn into_any(blob: Blob<Self>) -> AnyBlob {
        AnyBlob::F64(blob)
    }

    fn from_any(blob: &AnyBlob) -> Option<&Blob<Self>> {
        match blob {
            AnyBlob::F64(b) => Some(b),
            AnyBlob::F32(_) => None,
        }
    }

    fn from_any_mut(blob: &mut AnyBlob) -> Option<&mut Blob<Self>> {
        match blob {
            AnyBlob::F64(b) => Some(b),
            AnyBlob::F32(_) => None,
        }
    }

    fn read_be_into<R: Read>(reader: &mut R, dst: &mut [Self]) -> io::Result<()> {
        reader.read_f64_into::<BigEndian>(dst)
    }

    fn write_be<W: Write>(writer: &mut W, value: Self) -> io::Result<()> {
        writer.write_f64::<BigEndian>(value)
    }
}

/// A dense row-major tensor. Four-dimensional blobs use NCHW layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T: Element> Blob<T> {
    pub fn zeros(shape: &[usize]) -> Self {
        let total = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![T::zero(); total],
        }
    }

    pub fn from_vec(shape: &[usize], data: Vec<T>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(ConvError::DataLength {
                shape: shape.to_vec(),
                expected,
                found: data.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Build an NCHW blob by evaluating `f(n, c, h, w)` for every element.
    pub fn from_fn(shape: [usize; 4], mut f: impl FnMut(usize, usize, usize, usize) -> T) -> Self {
        let [num, channels, height, width] = shape;
        let mut data = Vec::with_capacity(num * channels * height * width);
        for n in 0..num {
            for c in 0..channels {
                for h in 0..height {
                    for w in 0..width {
                        data.push(f(n, c, h, w));
                    }
                }
            }
        }
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of axes.
    pub fn dims(&self) -> usize {
        self.shape.len()
    }

    pub fn total(&self) -> usize {
        self.data.len()
    }

    pub fn elem_type(&self) -> ElemType {
        T::ELEM_TYPE
    }

    fn axis(&self, axis: usize) -> usize {
        self.shape.get(axis).copied().unwrap_or(1)
    }

    pub fn num(&self) -> usize {
        self.axis(0)
    }

    pub fn channels(&self) -> usize {
        self.axis(1)
    }

    pub fn rows(&self) -> usize {
        self.axis(2)
    }

    pub fn cols(&self) -> usize {
        self.axis(3)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Element at `(n, c, h, w)`. Panics when out of range.
    pub fn at(&self, n: usize, c: usize, h: usize, w: usize) -> T {
        let idx = ((n * self.channels() + c) * self.rows() + h) * self.cols() + w;
        self.data[idx]
    }

    fn channel_span(&self, n: usize, channels: &Range<usize>) -> Result<Range<usize>> {
        if self.dims() != 4
            || n >= self.num()
            || channels.start > channels.end
            || channels.end > self.channels()
        {
            return Err(ConvError::BlockOutOfRange {
                what: format!("(sample {n}, channels {channels:?})"),
                shape: self.shape.clone(),
            });
        }
        let plane = self.rows() * self.cols();
        let start = (n * self.channels() + channels.start) * plane;
        Ok(start..start + channels.len() * plane)
    }

    /// Contiguous storage of sample `n`, channels `channels`.
    pub fn channel_slice(&self, n: usize, channels: Range<usize>) -> Result<&[T]> {
        let span = self.channel_span(n, &channels)?;
        Ok(&self.data[span])
    }

    pub fn channel_slice_mut(&mut self, n: usize, channels: Range<usize>) -> Result<&mut [T]> {
        let span = self.channel_span(n, &channels)?;
        Ok(&mut self.data[span])
    }

    /// Sample `n`, channels `channels` viewed as a `(channels, H*W)` matrix.
    pub fn channel_block(&self, n: usize, channels: Range<usize>) -> Result<ArrayView2<'_, T>> {
        let rows = channels.len();
        let plane = self.rows() * self.cols();
        let slice = self.channel_slice(n, channels)?;
        Ok(ArrayView2::from_shape((rows, plane), slice)?)
    }

    pub fn channel_block_mut(
        &mut self,
        n: usize,
        channels: Range<usize>,
    ) -> Result<ArrayViewMut2<'_, T>> {
        let rows = channels.len();
        let plane = self.rows() * self.cols();
        let slice = self.channel_slice_mut(n, channels)?;
        Ok(ArrayViewMut2::from_shape((rows, plane), slice)?)
    }

    /// Entries `range` of the leading axis viewed as a `(range, rest)` matrix.
    ///
    /// For a weight blob `(filters, depth, kh, kw)` this is the
    /// `(filters, depth*kh*kw)` kernel matrix of a filter group.
    pub fn filter_block(&self, range: Range<usize>) -> Result<ArrayView2<'_, T>> {
        if self.dims() == 0 || range.start > range.end || range.end > self.num() {
            return Err(ConvError::BlockOutOfRange {
                what: format!("(filters {range:?})"),
                shape: self.shape.clone(),
            });
        }
        let per = self.shape[1..].iter().product::<usize>();
        let slice = &self.data[range.start * per..range.end * per];
        Ok(ArrayView2::from_shape((range.len(), per), slice)?)
    }

    /// Flat elements `range` viewed as a column vector.
    pub fn column(&self, range: Range<usize>) -> Result<ArrayView2<'_, T>> {
        if range.start > range.end || range.end > self.total() {
            return Err(ConvError::BlockOutOfRange {
                what: format!("(elements {range:?})"),
                shape: self.shape.clone(),
            });
        }
        let len = range.len();
        Ok(ArrayView2::from_shape((len, 1), &self.data[range])?)
    }

    fn write_payload<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for &v in &self.data {
            T::write_be(writer, v)?;
        }
        Ok(())
    }
}

impl<T> fmt::Display for Blob<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_shape(f, &self.shape)
    }
}

fn fmt_shape(f: &mut fmt::Formatter<'_>, shape: &[usize]) -> fmt::Result {
    for (i, d) in shape.iter().enumerate() {
        if i > 0 {
            f.write_str("x")?;
        }
        write!(f, "{d}")?;
    }
    Ok(())
}

/// A blob of either supported element type.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyBlob {
    F32(Blob<f32>),
    F64(Blob<f64>),
}

impl From<Blob<f32>> for AnyBlob {
    fn from(blob: Blob<f32>) -> Self {
        Self::F32(blob)
    }
}

impl From<Blob<f64>> for AnyBlob {
    fn from(blob: Blob<f64>) -> Self {
        Self::F64(blob)
    }
}

impl AnyBlob {
    pub fn elem_type(&self) -> ElemType {
        match self {
            Self::F32(_) => ElemType::F32,
            Self::F64(_) => ElemType::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::F32(b) => b.shape(),
            Self::F64(b) => b.shape(),
        }
    }

    pub fn total(&self) -> usize {
        self.shape().iter().product()
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let shape = self.shape();
        ensure!(
            shape.len() <= MAX_RANK as usize,
            "blob rank {} exceeds the maximum of {MAX_RANK}",
            shape.len()
        );
        let elem_size = match self.elem_type() {
            ElemType::F32 => 4,
            ElemType::F64 => 8,
        };
        let mut buf = Vec::with_capacity(7 + 4 * shape.len() + elem_size * self.total());
        buf.write_all(&MAGIC)?;
        buf.write_u8(VERSION)?;
        buf.write_u8(self.elem_type().code())?;
        buf.write_u8(shape.len() as u8)?;
        for &dim in shape {
            let dim = u32::try_from(dim).context("blob dimension does not fit in u32")?;
            buf.write_u32::<BigEndian>(dim)?;
        }
        match self {
            Self::F32(b) => b.write_payload(&mut buf)?,
            Self::F64(b) => b.write_payload(&mut buf)?,
        }
        Ok(buf)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        let mut cur = Cursor::new(data);

        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic)
            .context("failed to read blob magic")?;
        ensure!(magic == MAGIC, "invalid blob magic: expected CGB\\0");

        let version = cur.read_u8().context("failed to read blob version")?;
        ensure!(
            version == VERSION,
            "unsupported blob version {version}, expected {VERSION}"
        );

        let code = cur.read_u8().context("failed to read element type")?;
        let Some(elem_type) = ElemType::from_code(code) else {
            bail!("unknown element type code {code}");
        };

        let rank = cur.read_u8().context("failed to read blob rank")?;
        if rank > MAX_RANK {
            bail!("unreasonable blob rank: {rank}");
        }

        let mut shape = Vec::with_capacity(rank as usize);
        for axis in 0..rank {
            let dim = cur
                .read_u32::<BigEndian>()
                .with_context(|| format!("failed to read dimension {axis}"))?;
            shape.push(dim as usize);
        }

        let blob = match elem_type {
            ElemType::F32 => Self::F32(read_payload(&mut cur, &shape)?),
            ElemType::F64 => Self::F64(read_payload(&mut cur, &shape)?),
        };
        ensure!(
            cur.position() as usize == data.len(),
            "{} trailing bytes after blob payload",
            data.len() - cur.position() as usize
        );
        Ok(blob)
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("failed to decode {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        fs::write(path, self.to_bytes()?)
            .with_context(|| format!("failed to write blob to {}", path.display()))
    }
}

fn read_payload<T: Element>(cur: &mut Cursor<&[u8]>, shape: &[usize]) -> anyhow::Result<Blob<T>> {
    let total = shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .context("blob element count overflows")?;
    let remaining = cur.get_ref().len() - cur.position() as usize;
    let elem_size = std::mem::size_of::<T>();
    ensure!(
        remaining >= total.saturating_mul(elem_size),
        "blob payload truncated: need {} bytes, have {remaining}",
        total.saturating_mul(elem_size)
    );
    let mut data = vec![T::zero(); total];
    T::read_be_into(cur, &mut data).context("failed to read blob payload")?;
    Ok(Blob::from_vec(shape, data)?)
}

impl fmt::Display for AnyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_shape(f, self.shape())?;
        write!(f, " {}", self.elem_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_f64() {
        let blob = Blob::<f64>::from_fn([2, 3, 2, 2], |n, c, h, w| {
            (n * 100 + c * 10 + h * 2 + w) as f64 - 0.5
        });
        let bytes = AnyBlob::from(blob.clone()).to_bytes().unwrap();
        let decoded = AnyBlob::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, AnyBlob::F64(blob));
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let bytes = AnyBlob::from(Blob::<f32>::zeros(&[1, 1, 2, 2])).to_bytes().unwrap();

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(AnyBlob::from_bytes(&bad).is_err());

        let short = &bytes[..bytes.len() - 1];
        assert!(AnyBlob::from_bytes(short).is_err());

        let mut long = bytes.clone();
        long.push(0);
        assert!(AnyBlob::from_bytes(&long).is_err());
    }

    #[test]
    fn channel_block_addresses_sample_and_group() {
        let blob = Blob::<f32>::from_fn([2, 4, 2, 3], |n, c, h, w| {
            (n * 1000 + c * 100 + h * 10 + w) as f32
        });
        let block = blob.channel_block(1, 2..4).unwrap();
        assert_eq!(block.dim(), (2, 6));
        assert_eq!(block[[0, 0]], 1200.0);
        assert_eq!(block[[1, 5]], 1312.0);
    }

    #[test]
    fn channel_block_checks_bounds() {
        let blob = Blob::<f32>::zeros(&[1, 2, 2, 2]);
        assert!(blob.channel_block(1, 0..1).is_err());
        assert!(blob.channel_block(0, 1..3).is_err());
        let flat = Blob::<f32>::zeros(&[8]);
        assert!(flat.channel_block(0, 0..1).is_err());
    }

    #[test]
    fn filter_block_rows_are_whole_filters() {
        let blob = Blob::<f32>::from_fn([4, 2, 1, 1], |n, c, _, _| (n * 10 + c) as f32);
        let block = blob.filter_block(2..4).unwrap();
        assert_eq!(block.dim(), (2, 2));
        assert_eq!(block[[0, 1]], 21.0);
        assert_eq!(block[[1, 0]], 30.0);
    }

    #[test]
    fn from_vec_checks_length() {
        assert!(Blob::<f32>::from_vec(&[2, 2], vec![0.0; 3]).is_err());
        assert!(Blob::<f32>::from_vec(&[2, 2], vec![0.0; 4]).is_ok());
    }

    #[test]
    fn display_shows_shape() {
        let blob = AnyBlob::from(Blob::<f32>::zeros(&[1, 3, 4, 5]));
        assert_eq!(blob.to_string(), "1x3x4x5 f32");
    }
}
