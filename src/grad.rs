use std::collections::{BTreeMap, HashMap};

use crate::attr::AttrType;
use crate::conf::{OpArg, OpConfWrapper};
use crate::error::OpError;
use crate::infer::InferredOp;
use crate::tensor::TensorDesc;

/// View of an inferred operator instance used while building its backward
/// ops.
///
/// Input slots whose modifier cleared `requires_grad` have no gradient slot;
/// output slots have a gradient only if one was supplied by the caller.
#[derive(Debug, Clone)]
pub struct OpWrapper {
    conf: OpConfWrapper,
    bn2tensor_desc: HashMap<String, TensorDesc>,
    input_diffs: BTreeMap<String, Option<String>>,
    output_diffs: HashMap<String, String>,
}

impl OpWrapper {
    /// `output_grads` maps logical blob names of this op's outputs to the
    /// logical blob names of their gradients.
    pub fn new(op: &InferredOp, output_grads: &HashMap<String, String>) -> Self {
        let conf = op.conf.clone();
        let mut bn2tensor_desc = HashMap::new();
        for (arg, desc) in op.input_descs.iter().chain(&op.output_descs) {
            bn2tensor_desc.insert(arg.bn(), desc.clone());
        }
        let input_diffs = op
            .input_modifiers
            .iter()
            .filter(|(_, modifier)| modifier.requires_grad)
            .map(|(arg, _)| (arg.bn(), None))
            .collect();
        let output_diffs = op
            .output_descs
            .keys()
            .filter_map(|arg| {
                let lbn = conf.output(&arg.name, arg.index).ok()?;
                let grad = output_grads.get(lbn)?;
                Some((arg.bn(), grad.clone()))
            })
            .collect();
        Self {
            conf,
            bn2tensor_desc,
            input_diffs,
            output_diffs,
        }
    }

    pub fn conf(&self) -> &OpConfWrapper {
        &self.conf
    }

    pub fn op_name(&self) -> &str {
        self.conf.op_name()
    }

    pub fn op_type_name(&self) -> &str {
        self.conf.op_type_name()
    }

    pub fn input(&self, arg_name: &str, index: usize) -> Result<&str, OpError> {
        self.conf.input(arg_name, index)
    }

    pub fn output(&self, arg_name: &str, index: usize) -> Result<&str, OpError> {
        self.conf.output(arg_name, index)
    }

    pub fn input_size(&self, arg_name: &str) -> usize {
        self.conf.input_size(arg_name)
    }

    pub fn output_size(&self, arg_name: &str) -> usize {
        self.conf.output_size(arg_name)
    }

    pub fn attr<T: AttrType>(&self, attr_name: &str) -> Result<&T, OpError> {
        self.conf.attr(attr_name)
    }

    pub fn tensor_desc(&self, arg_name: &str, index: usize) -> Result<&TensorDesc, OpError> {
        let bn = OpArg::new(arg_name, index).bn();
        self.bn2tensor_desc
            .get(&bn)
            .ok_or_else(|| OpError::UndeclaredArg {
                op_name: self.conf.op_name().to_string(),
                bn,
            })
    }

    /// Records `grad_lbn` as the gradient of the given input slot.
    pub fn bind_grad_tensor_with_op_input(
        &mut self,
        grad_lbn: impl Into<String>,
        arg_name: &str,
        index: usize,
    ) -> Result<(), OpError> {
        self.conf.input(arg_name, index)?;
        let bn = OpArg::new(arg_name, index).bn();
        match self.input_diffs.get_mut(&bn) {
            Some(slot) => {
                *slot = Some(grad_lbn.into());
                Ok(())
            }
            None => Err(OpError::NoGradientRequired {
                op_name: self.conf.op_name().to_string(),
                bn,
            }),
        }
    }

    /// Gradient of an output slot, `None` if nothing downstream produced one.
    pub fn grad_tensor_with_op_output(
        &self,
        arg_name: &str,
        index: usize,
    ) -> Result<Option<&str>, OpError> {
        self.conf.output(arg_name, index)?;
        let bn = OpArg::new(arg_name, index).bn();
        Ok(self.output_diffs.get(&bn).map(String::as_str))
    }

    pub fn need_gen_grad_tensor_for_op_input(
        &self,
        arg_name: &str,
        index: usize,
    ) -> Result<bool, OpError> {
        self.conf.input(arg_name, index)?;
        Ok(self
            .input_diffs
            .contains_key(&OpArg::new(arg_name, index).bn()))
    }

    pub fn needs_any_input_grad(&self) -> bool {
        !self.input_diffs.is_empty()
    }

    /// `(input lbn, gradient lbn)` for every input slot that was bound.
    pub fn input_grads(&self) -> Vec<(String, String)> {
        self.conf
            .input_args()
            .into_iter()
            .filter_map(|arg| {
                let grad = self.input_diffs.get(&arg.bn())?.as_ref()?;
                let lbn = self.conf.input(&arg.name, arg.index).ok()?;
                Some((lbn.to_string(), grad.clone()))
            })
            .collect()
    }
}

/// Collects the backward ops generated by a grad fn.
#[derive(Debug, Default)]
pub struct GradOpSink {
    ops: Vec<OpConfWrapper>,
}

impl GradOpSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_op(&mut self, op: OpConfWrapper) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[OpConfWrapper] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<OpConfWrapper> {
        self.ops
    }
}
