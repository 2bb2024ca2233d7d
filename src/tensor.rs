//! Typed, shaped tensors and their encoding into `tensorflow.TensorProto`.
//!
//! Every tensor keeps the invariant that the product of its shape equals the
//! number of flat values it holds. Tensors are only built through the
//! encoders below, [`Tensor::new`], or by decoding a response proto.

use std::fmt;
use std::str::Utf8Error;

use rayon::prelude::*;
use thiserror::Error;

use crate::proto::{tensor_shape_proto, DataType, TensorProto, TensorShapeProto};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cannot encode a matrix without rows")]
    EmptyMatrix,
    #[error("row {row} has {found} columns, expected {expected}")]
    RaggedRows {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("shape {shape} does not fit {len} values")]
    ShapeMismatch { shape: Shape, len: usize },
    #[error("{examples} examples but {labels} labels")]
    BatchMismatch { examples: usize, labels: usize },
    #[error("negative dimension {0} in tensor shape")]
    InvalidDim(i64),
    #[error("unsupported tensor dtype {0}")]
    UnsupportedDtype(&'static str),
    #[error("expected a {expected} tensor, found {found}")]
    DtypeMismatch { expected: DType, found: DType },
    #[error("tensor_content of {len} bytes is not a whole number of {dtype} values")]
    MalformedContent { dtype: DType, len: usize },
    #[error("string value {index} is not valid UTF-8")]
    InvalidUtf8 {
        index: usize,
        #[source]
        source: Utf8Error,
    },
}

/// Element type tag carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    Int64,
    Float,
    String,
}

impl DType {
    fn to_proto(self) -> DataType {
        match self {
            DType::Int64 => DataType::DtInt64,
            DType::Float => DataType::DtFloat,
            DType::String => DataType::DtString,
        }
    }
}

impl TryFrom<DataType> for DType {
    type Error = EncodeError;

    fn try_from(value: DataType) -> Result<Self, Self::Error> {
        match value {
            DataType::DtInt64 => Ok(DType::Int64),
            DataType::DtFloat => Ok(DType::Float),
            DataType::DtString => Ok(DType::String),
            other => Err(EncodeError::UnsupportedDtype(other.as_str_name())),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Int64 => "int64",
            DType::Float => "float",
            DType::String => "string",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn from_slice(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of values the shape describes. A rank-0 shape is a scalar.
    /// `None` when the product of the dims overflows `usize`.
    pub fn numel(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Flat, row-major tensor values. Strings are stored as their UTF-8 bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum Values {
    Int64(Vec<i64>),
    Float(Vec<f32>),
    String(Vec<Vec<u8>>),
}

impl Values {
    pub fn dtype(&self) -> DType {
        match self {
            Values::Int64(_) => DType::Int64,
            Values::Float(_) => DType::Float,
            Values::String(_) => DType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Values::Int64(v) => v.len(),
            Values::Float(v) => v.len(),
            Values::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A scalar type that can be stored in a [`Tensor`].
pub trait Element: Sized + Sync {
    const DTYPE: DType;

    /// Concatenates `rows` into flat values, preserving row-major order.
    fn encode_rows<R: AsRef<[Self]> + Sync>(rows: &[R]) -> Values;
}

impl Element for i64 {
    const DTYPE: DType = DType::Int64;

    fn encode_rows<R: AsRef<[Self]> + Sync>(rows: &[R]) -> Values {
        Values::Int64(rows.iter().flat_map(|r| r.as_ref().iter().copied()).collect())
    }
}

impl Element for f32 {
    const DTYPE: DType = DType::Float;

    fn encode_rows<R: AsRef<[Self]> + Sync>(rows: &[R]) -> Values {
        Values::Float(rows.iter().flat_map(|r| r.as_ref().iter().copied()).collect())
    }
}

impl Element for String {
    const DTYPE: DType = DType::String;

    fn encode_rows<R: AsRef<[Self]> + Sync>(rows: &[R]) -> Values {
        encode_string_rows(rows)
    }
}

impl Element for &str {
    const DTYPE: DType = DType::String;

    fn encode_rows<R: AsRef<[Self]> + Sync>(rows: &[R]) -> Values {
        encode_string_rows(rows)
    }
}

// Each element is converted on the rayon pool; `par_extend` keeps input order.
fn encode_string_rows<S, R>(rows: &[R]) -> Values
where
    S: AsRef<str> + Sync,
    R: AsRef<[S]> + Sync,
{
    let total = rows.iter().map(|r| r.as_ref().len()).sum();
    let mut bytes = Vec::with_capacity(total);
    for row in rows {
        bytes.par_extend(row.as_ref().par_iter().map(|s| s.as_ref().as_bytes().to_vec()));
    }
    Values::String(bytes)
}

fn matrix_shape<T, R: AsRef<[T]>>(rows: &[R]) -> Result<Shape, EncodeError> {
    let cols = rows.first().ok_or(EncodeError::EmptyMatrix)?.as_ref().len();
    if let Some((row, found)) = rows
        .iter()
        .map(|r| r.as_ref().len())
        .enumerate()
        .find(|(_, len)| *len != cols)
    {
        return Err(EncodeError::RaggedRows {
            row,
            expected: cols,
            found,
        });
    }
    Ok(Shape(vec![rows.len(), cols]))
}

/// Encodes a flat sequence as a tensor of shape `[values.len()]`.
pub fn encode_vector<T: Element>(values: &[T]) -> Tensor {
    Tensor {
        shape: Shape(vec![values.len()]),
        values: T::encode_rows(&[values]),
    }
}

/// Encodes equal-length rows as a tensor of shape `[rows, cols]`.
///
/// Ragged rows are rejected rather than truncated, and an empty outer slice
/// has no column count to derive a shape from.
pub fn encode_matrix<T: Element, R: AsRef<[T]> + Sync>(rows: &[R]) -> Result<Tensor, EncodeError> {
    let shape = matrix_shape::<T, R>(rows)?;
    Ok(Tensor {
        shape,
        values: T::encode_rows(rows),
    })
}

pub fn encode_int64_vector(values: &[i64]) -> Tensor {
    encode_vector(values)
}

pub fn encode_float_vector(values: &[f32]) -> Tensor {
    encode_vector(values)
}

pub fn encode_string_vector<S: AsRef<str> + Sync>(values: &[S]) -> Tensor {
    Tensor {
        shape: Shape(vec![values.len()]),
        values: encode_string_rows(&[values]),
    }
}

pub fn encode_int64_matrix<R: AsRef<[i64]> + Sync>(rows: &[R]) -> Result<Tensor, EncodeError> {
    encode_matrix(rows)
}

pub fn encode_float_matrix<R: AsRef<[f32]> + Sync>(rows: &[R]) -> Result<Tensor, EncodeError> {
    encode_matrix(rows)
}

pub fn encode_string_matrix<S, R>(rows: &[R]) -> Result<Tensor, EncodeError>
where
    S: AsRef<str> + Sync,
    R: AsRef<[S]> + Sync,
{
    let shape = matrix_shape::<S, R>(rows)?;
    Ok(Tensor {
        shape,
        values: encode_string_rows(rows),
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Shape,
    values: Values,
}

impl Tensor {
    pub fn new(shape: Shape, values: Values) -> Result<Self, EncodeError> {
        if shape.numel() != Some(values.len()) {
            return Err(EncodeError::ShapeMismatch {
                shape,
                len: values.len(),
            });
        }
        Ok(Self { shape, values })
    }

    pub fn dtype(&self) -> DType {
        self.values.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn values(&self) -> &Values {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_floats(&self) -> Result<&[f32], EncodeError> {
        match &self.values {
            Values::Float(v) => Ok(v),
            other => Err(EncodeError::DtypeMismatch {
                expected: DType::Float,
                found: other.dtype(),
            }),
        }
    }

    pub fn as_int64s(&self) -> Result<&[i64], EncodeError> {
        match &self.values {
            Values::Int64(v) => Ok(v),
            other => Err(EncodeError::DtypeMismatch {
                expected: DType::Int64,
                found: other.dtype(),
            }),
        }
    }

    /// Decodes string values back from UTF-8, in order.
    pub fn as_strings(&self) -> Result<Vec<&str>, EncodeError> {
        match &self.values {
            Values::String(v) => v
                .iter()
                .enumerate()
                .map(|(index, bytes)| {
                    std::str::from_utf8(bytes).map_err(|source| EncodeError::InvalidUtf8 { index, source })
                })
                .collect(),
            other => Err(EncodeError::DtypeMismatch {
                expected: DType::String,
                found: other.dtype(),
            }),
        }
    }
}

impl From<&Tensor> for TensorProto {
    fn from(tensor: &Tensor) -> Self {
        let mut proto = TensorProto {
            dtype: tensor.dtype().to_proto() as i32,
            tensor_shape: Some(TensorShapeProto {
                dim: tensor
                    .shape
                    .dims()
                    .iter()
                    .map(|&size| tensor_shape_proto::Dim {
                        size: size as i64,
                        name: String::new(),
                    })
                    .collect(),
                unknown_rank: false,
            }),
            ..Default::default()
        };
        match &tensor.values {
            Values::Int64(v) => proto.int64_val = v.clone(),
            Values::Float(v) => proto.float_val = v.clone(),
            Values::String(v) => proto.string_val = v.clone(),
        }
        proto
    }
}

impl TryFrom<TensorProto> for Tensor {
    type Error = EncodeError;

    /// Servers may answer with either the typed `*_val` fields or packed
    /// little-endian `tensor_content`; both are accepted.
    fn try_from(proto: TensorProto) -> Result<Self, Self::Error> {
        let dtype = DType::try_from(proto.dtype())?;
        let packed = proto.tensor_content;
        let values = match dtype {
            DType::Float if proto.float_val.is_empty() && !packed.is_empty() => {
                Values::Float(decode_content::<f32, 4>(&packed, dtype, f32::from_le_bytes)?)
            }
            DType::Float => Values::Float(proto.float_val),
            DType::Int64 if proto.int64_val.is_empty() && !packed.is_empty() => {
                Values::Int64(decode_content::<i64, 8>(&packed, dtype, i64::from_le_bytes)?)
            }
            DType::Int64 => Values::Int64(proto.int64_val),
            DType::String => Values::String(proto.string_val),
        };

        let shape = match proto.tensor_shape {
            Some(shape) if !shape.unknown_rank => shape
                .dim
                .iter()
                .map(|d| usize::try_from(d.size).map_err(|_| EncodeError::InvalidDim(d.size)))
                .collect::<Result<Vec<_>, _>>()?
                .into(),
            _ => Shape(vec![values.len()]),
        };

        Tensor::new(shape, values)
    }
}

fn decode_content<T, const N: usize>(
    content: &[u8],
    dtype: DType,
    from_le: fn([u8; N]) -> T,
) -> Result<Vec<T>, EncodeError> {
    if content.len() % N != 0 {
        return Err(EncodeError::MalformedContent {
            dtype,
            len: content.len(),
        });
    }
    Ok(content
        .chunks_exact(N)
        .map(|chunk| {
            let mut buf = [0_u8; N];
            buf.copy_from_slice(chunk);
            from_le(buf)
        })
        .collect())
}
