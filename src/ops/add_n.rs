use crate::conf::OpArg;
use crate::context::{BatchAxisInferContext, SbpContext, TensorDescInferContext};
use crate::error::OpError;
use crate::grad::{GradOpSink, OpWrapper};
use crate::registry::{OpRegistration, OpRegistrationBuilder};

use super::{check_same_data_type, check_same_shape};

/// Elementwise sum of two or more tensors of identical shape. Used to
/// accumulate gradients of tensors consumed more than once.
pub fn add_n() -> Result<OpRegistration, OpError> {
    OpRegistrationBuilder::new("add_n")
        .input_with_minimum("in", 2)
        .output("out")
        .set_tensor_desc_infer_fn(infer_tensor_desc)
        .set_batch_axis_infer_fn(infer_batch_axis)
        .set_get_sbp_fn(get_sbp_signatures)
        .set_grad_fn(generate_grad)
        .finish()
}

fn infer_tensor_desc(ctx: &mut TensorDescInferContext<'_>) -> Result<(), OpError> {
    let first = ctx.input_tensor_desc("in", 0)?;
    for index in 1..ctx.conf().input_size("in") {
        let other = ctx.input_tensor_desc("in", index)?;
        let bn = OpArg::new("in", index).bn();
        check_same_shape(ctx.op_name(), ("in_0", first), (bn.as_str(), other))?;
        check_same_data_type(ctx.op_name(), ("in_0", first), (bn.as_str(), other))?;
    }
    *ctx.output_tensor_desc_mut("out", 0)? = first.clone();
    Ok(())
}

fn infer_batch_axis(ctx: &mut BatchAxisInferContext<'_>) -> Result<(), OpError> {
    let axis = ctx.input_batch_axis("in", 0)?;
    *ctx.output_batch_axis_mut("out", 0)? = axis;
    Ok(())
}

fn get_sbp_signatures(ctx: &mut SbpContext<'_>) -> Result<(), OpError> {
    let num_axes = ctx.logical_tensor_desc_for_input("in", 0)?.shape.num_axes();
    let (inputs, outputs) = (ctx.inputs(), ctx.outputs());
    for axis in 0..num_axes {
        ctx.new_builder()
            .split(inputs, axis)
            .split(outputs, axis)
            .build();
    }
    ctx.new_builder()
        .partial_sum(inputs)
        .partial_sum(outputs)
        .build();
    ctx.new_builder().broadcast(inputs).broadcast(outputs).build();
    Ok(())
}

fn generate_grad(op: &mut OpWrapper, _sink: &mut GradOpSink) -> Result<(), OpError> {
    let Some(dy) = op.grad_tensor_with_op_output("out", 0)?.map(str::to_string) else {
        return Ok(());
    };
    for index in 0..op.input_size("in") {
        if op.need_gen_grad_tensor_for_op_input("in", index)? {
            op.bind_grad_tensor_with_op_input(dy.as_str(), "in", index)?;
        }
    }
    Ok(())
}
