//! Per-callback views handed to an operator type's registered functions.
//!
//! Each context only exposes what its stage may read or write. Writable
//! slots point into scratch tables owned by the inference pass, which
//! commits them once the callback has returned successfully.

use std::collections::BTreeMap;

use crate::attr::AttrType;
use crate::conf::{OpArg, OpConfWrapper};
use crate::error::OpError;
use crate::sbp::{SbpSignatureBuilder, SbpSignatureList};
use crate::tensor::TensorDesc;

fn undeclared(conf: &OpConfWrapper, arg_name: &str, index: usize) -> OpError {
    OpError::UndeclaredArg {
        op_name: conf.op_name().to_string(),
        bn: OpArg::new(arg_name, index).bn(),
    }
}

fn input_desc<'a>(
    conf: &OpConfWrapper,
    inputs: &'a BTreeMap<OpArg, TensorDesc>,
    arg_name: &str,
    index: usize,
) -> Result<&'a TensorDesc, OpError> {
    conf.input(arg_name, index)?;
    inputs
        .get(&OpArg::new(arg_name, index))
        .ok_or_else(|| undeclared(conf, arg_name, index))
}

/// Shape and data type inference.
pub struct TensorDescInferContext<'a> {
    conf: &'a OpConfWrapper,
    inputs: &'a BTreeMap<OpArg, TensorDesc>,
    outputs: &'a mut BTreeMap<OpArg, Option<TensorDesc>>,
}

impl<'a> TensorDescInferContext<'a> {
    pub(crate) fn new(
        conf: &'a OpConfWrapper,
        inputs: &'a BTreeMap<OpArg, TensorDesc>,
        outputs: &'a mut BTreeMap<OpArg, Option<TensorDesc>>,
    ) -> Self {
        Self {
            conf,
            inputs,
            outputs,
        }
    }

    pub fn conf(&self) -> &'a OpConfWrapper {
        self.conf
    }

    pub fn op_name(&self) -> &'a str {
        self.conf.op_name()
    }

    pub fn attr<T: AttrType>(&self, attr_name: &str) -> Result<&'a T, OpError> {
        self.conf.attr(attr_name)
    }

    pub fn input_tensor_desc(&self, arg_name: &str, index: usize) -> Result<&'a TensorDesc, OpError> {
        input_desc(self.conf, self.inputs, arg_name, index)
    }

    /// Writable descriptor of an output slot. An output that was never
    /// requested here is reported as not inferred once the callback returns.
    pub fn output_tensor_desc_mut(
        &mut self,
        arg_name: &str,
        index: usize,
    ) -> Result<&mut TensorDesc, OpError> {
        self.conf.output(arg_name, index)?;
        let slot = self
            .outputs
            .get_mut(&OpArg::new(arg_name, index))
            .ok_or_else(|| undeclared(self.conf, arg_name, index))?;
        Ok(slot.get_or_insert_with(TensorDesc::default))
    }
}

/// Batch axis propagation. Output shapes and data types are already final.
pub struct BatchAxisInferContext<'a> {
    conf: &'a OpConfWrapper,
    inputs: &'a BTreeMap<OpArg, TensorDesc>,
    outputs: &'a BTreeMap<OpArg, TensorDesc>,
    output_batch_axes: &'a mut BTreeMap<OpArg, Option<usize>>,
}

impl<'a> BatchAxisInferContext<'a> {
    pub(crate) fn new(
        conf: &'a OpConfWrapper,
        inputs: &'a BTreeMap<OpArg, TensorDesc>,
        outputs: &'a BTreeMap<OpArg, TensorDesc>,
        output_batch_axes: &'a mut BTreeMap<OpArg, Option<usize>>,
    ) -> Self {
        Self {
            conf,
            inputs,
            outputs,
            output_batch_axes,
        }
    }

    pub fn conf(&self) -> &'a OpConfWrapper {
        self.conf
    }

    pub fn attr<T: AttrType>(&self, attr_name: &str) -> Result<&'a T, OpError> {
        self.conf.attr(attr_name)
    }

    pub fn input_batch_axis(&self, arg_name: &str, index: usize) -> Result<Option<usize>, OpError> {
        Ok(self.logical_tensor_desc_for_input(arg_name, index)?.batch_axis)
    }

    pub fn logical_tensor_desc_for_input(
        &self,
        arg_name: &str,
        index: usize,
    ) -> Result<&'a TensorDesc, OpError> {
        input_desc(self.conf, self.inputs, arg_name, index)
    }

    pub fn logical_tensor_desc_for_output(
        &self,
        arg_name: &str,
        index: usize,
    ) -> Result<&'a TensorDesc, OpError> {
        self.conf.output(arg_name, index)?;
        self.outputs
            .get(&OpArg::new(arg_name, index))
            .ok_or_else(|| undeclared(self.conf, arg_name, index))
    }

    pub fn output_batch_axis_mut(
        &mut self,
        arg_name: &str,
        index: usize,
    ) -> Result<&mut Option<usize>, OpError> {
        self.conf.output(arg_name, index)?;
        self.output_batch_axes
            .get_mut(&OpArg::new(arg_name, index))
            .ok_or_else(|| undeclared(self.conf, arg_name, index))
    }
}

/// Enumeration of candidate parallelization signatures.
pub struct SbpContext<'a> {
    conf: &'a OpConfWrapper,
    inputs: &'a BTreeMap<OpArg, TensorDesc>,
    input_args: &'a [OpArg],
    output_args: &'a [OpArg],
    signatures: &'a mut SbpSignatureList,
}

impl<'a> SbpContext<'a> {
    pub(crate) fn new(
        conf: &'a OpConfWrapper,
        inputs: &'a BTreeMap<OpArg, TensorDesc>,
        input_args: &'a [OpArg],
        output_args: &'a [OpArg],
        signatures: &'a mut SbpSignatureList,
    ) -> Self {
        Self {
            conf,
            inputs,
            input_args,
            output_args,
            signatures,
        }
    }

    pub fn conf(&self) -> &'a OpConfWrapper {
        self.conf
    }

    pub fn attr<T: AttrType>(&self, attr_name: &str) -> Result<&'a T, OpError> {
        self.conf.attr(attr_name)
    }

    pub fn logical_tensor_desc_for_input(
        &self,
        arg_name: &str,
        index: usize,
    ) -> Result<&'a TensorDesc, OpError> {
        input_desc(self.conf, self.inputs, arg_name, index)
    }

    /// Every input slot, in declaration order.
    pub fn inputs(&self) -> &'a [OpArg] {
        self.input_args
    }

    /// Every output slot, in declaration order.
    pub fn outputs(&self) -> &'a [OpArg] {
        self.output_args
    }

    pub fn new_builder(&mut self) -> SbpSignatureBuilder<'_> {
        SbpSignatureBuilder::new(self.signatures)
    }

    pub fn num_signatures(&self) -> usize {
        self.signatures.len()
    }
}

/// Runtime and gradient flags of one input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputArgModifier {
    /// Only shape and data type are needed at runtime, not the contents.
    pub use_header_only: bool,
    pub requires_grad: bool,
}

impl Default for InputArgModifier {
    fn default() -> Self {
        Self {
            use_header_only: false,
            requires_grad: true,
        }
    }
}

impl InputArgModifier {
    pub fn set_use_header_only(&mut self, value: bool) -> &mut Self {
        self.use_header_only = value;
        self
    }

    pub fn set_requires_grad(&mut self, value: bool) -> &mut Self {
        self.requires_grad = value;
        self
    }
}

pub struct InputArgModifyContext<'a> {
    conf: &'a OpConfWrapper,
    modifiers: &'a mut BTreeMap<OpArg, InputArgModifier>,
}

impl<'a> InputArgModifyContext<'a> {
    pub(crate) fn new(
        conf: &'a OpConfWrapper,
        modifiers: &'a mut BTreeMap<OpArg, InputArgModifier>,
    ) -> Self {
        Self { conf, modifiers }
    }

    pub fn conf(&self) -> &'a OpConfWrapper {
        self.conf
    }

    /// Flags of an input slot. Naming a slot the op does not have is a
    /// contract violation of the registration itself.
    pub fn modifier(&mut self, arg_name: &str, index: usize) -> Result<&mut InputArgModifier, OpError> {
        self.modifiers
            .get_mut(&OpArg::new(arg_name, index))
            .ok_or_else(|| undeclared(self.conf, arg_name, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::OpConfWrapperBuilder;
    use crate::error::ErrorKind;
    use crate::sbp::SbpParallel;
    use crate::tensor::DataType;

    fn conf() -> OpConfWrapper {
        OpConfWrapperBuilder::new("op")
            .op("test")
            .input("x", "in/x_0")
            .output("y")
            .attr("k", 2i32)
            .build()
    }

    fn inputs() -> BTreeMap<OpArg, TensorDesc> {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            OpArg::new("x", 0),
            TensorDesc::new([2, 3], DataType::Float32).with_batch_axis(0),
        );
        inputs
    }

    #[test]
    fn tensor_desc_context_reads_inputs_and_writes_outputs() {
        let conf = conf();
        let inputs = inputs();
        let mut outputs = BTreeMap::from([(OpArg::new("y", 0), None)]);
        let mut ctx = TensorDescInferContext::new(&conf, &inputs, &mut outputs);

        let x = ctx.input_tensor_desc("x", 0).unwrap().clone();
        assert_eq!(*ctx.attr::<i32>("k").unwrap(), 2);
        *ctx.output_tensor_desc_mut("y", 0).unwrap() = x.clone();
        assert_eq!(
            ctx.input_tensor_desc("x", 1).unwrap_err().kind(),
            ErrorKind::Range
        );
        assert_eq!(
            ctx.output_tensor_desc_mut("z", 0).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(outputs[&OpArg::new("y", 0)], Some(x));
    }

    #[test]
    fn batch_axis_context_exposes_only_batch_slots() {
        let conf = conf();
        let inputs = inputs();
        let outputs = BTreeMap::from([(OpArg::new("y", 0), TensorDesc::new([2, 3], DataType::Float32))]);
        let mut axes = BTreeMap::from([(OpArg::new("y", 0), None)]);
        let mut ctx = BatchAxisInferContext::new(&conf, &inputs, &outputs, &mut axes);
        let axis = ctx.input_batch_axis("x", 0).unwrap();
        *ctx.output_batch_axis_mut("y", 0).unwrap() = axis;
        assert_eq!(axes[&OpArg::new("y", 0)], Some(0));
    }

    #[test]
    fn sbp_context_builds_into_list() {
        let conf = conf();
        let inputs = inputs();
        let input_args = vec![OpArg::new("x", 0)];
        let output_args = vec![OpArg::new("y", 0)];
        let mut list = SbpSignatureList::new();
        let mut ctx = SbpContext::new(&conf, &inputs, &input_args, &output_args, &mut list);
        let ins = ctx.inputs();
        let outs = ctx.outputs();
        ctx.new_builder().split(ins, 1).split(outs, 1).build();
        ctx.new_builder().split(ins, 1).split(outs, 1).build();
        assert_eq!(ctx.num_signatures(), 1);
        assert_eq!(
            list.as_slice()[0].get_bn("y_0"),
            Some(SbpParallel::Split { axis: 1 })
        );
    }

    #[test]
    fn modifier_on_unknown_arg_is_contract_violation() {
        let conf = conf();
        let mut modifiers = BTreeMap::from([(OpArg::new("x", 0), InputArgModifier::default())]);
        let mut ctx = InputArgModifyContext::new(&conf, &mut modifiers);
        ctx.modifier("x", 0)
            .unwrap()
            .set_use_header_only(true)
            .set_requires_grad(false);
        let err = ctx.modifier("like", 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert!(modifiers[&OpArg::new("x", 0)].use_header_only);
        assert!(!modifiers[&OpArg::new("x", 0)].requires_grad);
    }
}
