use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Float16,
    Float32,
    Float64,
    Int8,
    Int32,
    Int64,
    Uint8,
    Bool,
}

impl DataType {
    pub const ALL: [DataType; 8] = [
        DataType::Float16,
        DataType::Float32,
        DataType::Float64,
        DataType::Int8,
        DataType::Int32,
        DataType::Int64,
        DataType::Uint8,
        DataType::Bool,
    ];

    pub fn bytes_per_element(self) -> usize {
        match self {
            DataType::Float16 => 2,
            DataType::Float32 => 4,
            DataType::Float64 => 8,
            DataType::Int8 => 1,
            DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::Uint8 => 1,
            DataType::Bool => 1,
        }
    }
}

/// Ordered, non-negative dimension sizes of a tensor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape(Vec<u64>);

impl Shape {
    pub fn new(dims: Vec<u64>) -> Self {
        Shape(dims)
    }

    pub fn dims(&self) -> &[u64] {
        &self.0
    }

    pub fn num_axes(&self) -> usize {
        self.0.len()
    }

    pub fn at(&self, axis: usize) -> Option<u64> {
        self.0.get(axis).copied()
    }

    /// Number of elements, `None` if the product overflows. A rank-0 shape
    /// holds one element.
    pub fn elem_cnt(&self) -> Option<u64> {
        self.0
            .iter()
            .try_fold(1u64, |count, dim| count.checked_mul(*dim))
    }
}

impl From<Vec<u64>> for Shape {
    fn from(dims: Vec<u64>) -> Self {
        Shape(dims)
    }
}

impl<const N: usize> From<[u64; N]> for Shape {
    fn from(dims: [u64; N]) -> Self {
        Shape(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (idx, dim) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", dim)?;
        }
        f.write_str(")")
    }
}

/// Shape, element type and batch-axis metadata of one logical tensor slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub shape: Shape,
    pub data_type: DataType,
    #[serde(default)]
    pub batch_axis: Option<usize>,
}

impl TensorDesc {
    pub fn new(shape: impl Into<Shape>, data_type: DataType) -> Self {
        Self {
            shape: shape.into(),
            data_type,
            batch_axis: None,
        }
    }

    pub fn with_batch_axis(mut self, axis: usize) -> Self {
        self.batch_axis = Some(axis);
        self
    }

    pub fn byte_length(&self) -> Option<u64> {
        let elements = self.shape.elem_cnt()?;
        elements.checked_mul(self.data_type.bytes_per_element() as u64)
    }
}

impl Default for TensorDesc {
    fn default() -> Self {
        Self::new(Shape::default(), DataType::Float32)
    }
}
