use std::path::PathBuf;

use serde_json::Error as JsonError;
use thiserror::Error;

use crate::attr::AttrKind;
use crate::tensor::{DataType, Shape};

/// Coarse classification of an [`OpError`], used by callers that only care
/// about which family of failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    TypeMismatch,
    Range,
    ContractViolation,
    Registration,
    Io,
}

/// Stage of the per-operator compiler pass in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferStage {
    CheckConf,
    TensorDesc,
    BatchAxis,
    SbpSignature,
    InputArgModify,
    Grad,
}

impl std::fmt::Display for InferStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InferStage::CheckConf => "conf check",
            InferStage::TensorDesc => "tensor desc inference",
            InferStage::BatchAxis => "batch axis inference",
            InferStage::SbpSignature => "sbp signature inference",
            InferStage::InputArgModify => "input arg modification",
            InferStage::Grad => "gradient generation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum OpError {
    #[error("job file {path} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON could not be processed: {source}")]
    Parse {
        #[from]
        source: JsonError,
    },
    #[error("{}", describe_op_failure(.op_name, .stage, .source))]
    Op {
        op_name: String,
        stage: InferStage,
        #[source]
        source: Box<OpError>,
    },
    #[error("attribute `{attr}` is not set")]
    AttrNotFound { attr: String },
    #[error("attribute `{attr}` holds {actual:?} but was read as {expected:?}")]
    AttrTypeMismatch {
        attr: String,
        expected: AttrKind,
        actual: AttrKind,
    },
    #[error("attribute `{attr}` is not declared by op type `{op_type}`")]
    UndeclaredAttr { op_type: String, attr: String },
    #[error("op `{op_name}` has no {direction} argument `{arg}`")]
    ArgNotFound {
        op_name: String,
        direction: &'static str,
        arg: String,
    },
    #[error("op `{op_name}` {direction} argument `{arg}` index {index} is out of range (size {size})")]
    ArgIndexOutOfRange {
        op_name: String,
        direction: &'static str,
        arg: String,
        index: usize,
        size: usize,
    },
    #[error("op `{op_name}` {direction} argument `{arg}` expects {expected} tensors, got {actual}")]
    ArgCountMismatch {
        op_name: String,
        direction: &'static str,
        arg: String,
        expected: String,
        actual: usize,
    },
    #[error("op `{op_name}` references undeclared argument slot `{bn}`")]
    UndeclaredArg { op_name: String, bn: String },
    #[error("op type `{op_type}` is not registered")]
    OpTypeNotFound { op_type: String },
    #[error("op `{op_name}` declares type `{actual}` but was checked against `{expected}`")]
    OpTypeMismatch {
        op_name: String,
        expected: String,
        actual: String,
    },
    #[error("op type `{op_type}` is already registered")]
    DuplicateOpType { op_type: String },
    #[error("op type `{op_type}` registration is invalid: {reason}")]
    InvalidRegistration { op_type: String, reason: String },
    #[error("the global op registry is already installed")]
    RegistryAlreadyInstalled,
    #[error("the global op registry has not been installed")]
    RegistryNotInstalled,
    #[error("tensor `{lbn}` is not available")]
    TensorNotFound { lbn: String },
    #[error("tensor `{lbn}` is produced more than once")]
    TensorProducedTwice { lbn: String },
    #[error("op `{op_name}`: shape of `{lhs}` {lhs_shape} does not match shape of `{rhs}` {rhs_shape}")]
    ShapeMismatch {
        op_name: String,
        lhs: String,
        lhs_shape: Shape,
        rhs: String,
        rhs_shape: Shape,
    },
    #[error("op `{op_name}`: data type of `{lhs}` ({lhs_type:?}) does not match `{rhs}` ({rhs_type:?})")]
    DataTypeMismatch {
        op_name: String,
        lhs: String,
        lhs_type: DataType,
        rhs: String,
        rhs_type: DataType,
    },
    #[error("op `{op_name}`: tensor `{bn}` uses data type {data_type:?} which is not allowed")]
    UnsupportedDataType {
        op_name: String,
        bn: String,
        data_type: DataType,
    },
    #[error("op `{op_name}`: axis {axis} is out of range for `{bn}` with {num_axes} axes")]
    AxisOutOfRange {
        op_name: String,
        bn: String,
        axis: i64,
        num_axes: usize,
    },
    #[error("op `{op_name}`: output `{bn}` was not inferred")]
    OutputNotInferred { op_name: String, bn: String },
    #[error("op `{op_name}` produced no sbp signature")]
    NoSbpSignature { op_name: String },
    #[error("op `{op_name}`: sbp signature leaves `{bn}` unassigned")]
    IncompleteSbpSignature { op_name: String, bn: String },
    #[error("op `{op_name}` produced more than {limit} sbp signatures")]
    TooManySbpSignatures { op_name: String, limit: usize },
    #[error("op `{op_name}`: input `{bn}` does not require a gradient")]
    NoGradientRequired { op_name: String, bn: String },
    #[error("op type `{op_type}` has inputs requiring gradients but registers no grad fn")]
    GradNotRegistered { op_type: String },
}

fn describe_op_failure(op_name: &str, stage: &InferStage, source: &OpError) -> String {
    if source.scoped_op_name() == Some(op_name) {
        format!("{stage} failed: {source}")
    } else {
        format!("op `{op_name}` failed during {stage}: {source}")
    }
}

impl OpError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OpError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn in_op(op_name: &str, stage: InferStage, source: OpError) -> Self {
        OpError::Op {
            op_name: op_name.to_string(),
            stage,
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OpError::Io { .. } | OpError::Parse { .. } => ErrorKind::Io,
            OpError::Op { source, .. } => source.kind(),
            OpError::AttrNotFound { .. }
            | OpError::ArgNotFound { .. }
            | OpError::OpTypeNotFound { .. }
            | OpError::TensorNotFound { .. }
            | OpError::RegistryNotInstalled
            | OpError::OutputNotInferred { .. } => ErrorKind::NotFound,
            OpError::AttrTypeMismatch { .. }
            | OpError::OpTypeMismatch { .. }
            | OpError::ShapeMismatch { .. }
            | OpError::DataTypeMismatch { .. }
            | OpError::UnsupportedDataType { .. } => ErrorKind::TypeMismatch,
            OpError::ArgIndexOutOfRange { .. }
            | OpError::ArgCountMismatch { .. }
            | OpError::AxisOutOfRange { .. }
            | OpError::TooManySbpSignatures { .. } => ErrorKind::Range,
            OpError::UndeclaredAttr { .. }
            | OpError::UndeclaredArg { .. }
            | OpError::NoSbpSignature { .. }
            | OpError::IncompleteSbpSignature { .. }
            | OpError::NoGradientRequired { .. }
            | OpError::TensorProducedTwice { .. }
            | OpError::GradNotRegistered { .. } => ErrorKind::ContractViolation,
            OpError::DuplicateOpType { .. }
            | OpError::InvalidRegistration { .. }
            | OpError::RegistryAlreadyInstalled => ErrorKind::Registration,
        }
    }

    /// Op name carried by variants whose message already names the op.
    fn scoped_op_name(&self) -> Option<&str> {
        match self {
            OpError::ArgNotFound { op_name, .. }
            | OpError::ArgIndexOutOfRange { op_name, .. }
            | OpError::ArgCountMismatch { op_name, .. }
            | OpError::UndeclaredArg { op_name, .. }
            | OpError::OpTypeMismatch { op_name, .. }
            | OpError::ShapeMismatch { op_name, .. }
            | OpError::DataTypeMismatch { op_name, .. }
            | OpError::UnsupportedDataType { op_name, .. }
            | OpError::AxisOutOfRange { op_name, .. }
            | OpError::OutputNotInferred { op_name, .. }
            | OpError::NoSbpSignature { op_name }
            | OpError::IncompleteSbpSignature { op_name, .. }
            | OpError::TooManySbpSignatures { op_name, .. }
            | OpError::NoGradientRequired { op_name, .. } => Some(op_name),
            _ => None,
        }
    }

    /// Name of the operator instance the failure is attributed to, if any.
    pub fn op_name(&self) -> Option<&str> {
        match self {
            OpError::Op { op_name, .. } => Some(op_name),
            _ => None,
        }
    }
}
