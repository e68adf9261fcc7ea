pub mod attr;
pub mod conf;
pub mod context;
pub mod error;
pub mod grad;
pub mod infer;
pub mod job;
pub mod loader;
pub mod ops;
pub mod registry;
pub mod sbp;
pub mod tensor;

pub use attr::{AttrKind, AttrStore, AttrType, AttrValue};
pub use conf::{OpArg, OpConfWrapper, OpConfWrapperBuilder, OperatorConf};
pub use context::{
    BatchAxisInferContext, InputArgModifier, InputArgModifyContext, SbpContext,
    TensorDescInferContext,
};
pub use error::{ErrorKind, InferStage, OpError};
pub use grad::{GradOpSink, OpWrapper};
pub use infer::{InferOptions, InferredOp, check_and_complete_conf, infer_op};
pub use job::{BackwardGraph, Job, JobInference, generate_backward, infer_job};
pub use loader::load_job_from_path;
pub use registry::{
    OpRegistration, OpRegistrationBuilder, OpRegistry, OpRegistryBuilder, OpSchema,
};
pub use sbp::{SbpParallel, SbpSignature, SbpSignatureBuilder, SbpSignatureList};
pub use tensor::{DataType, Shape, TensorDesc};
