use crate::attr::AttrKind;
use crate::conf::{OpArg, OpConfWrapperBuilder, gen_logical_blob_name};
use crate::context::{
    BatchAxisInferContext, InputArgModifyContext, SbpContext, TensorDescInferContext,
};
use crate::error::OpError;
use crate::grad::{GradOpSink, OpWrapper};
use crate::registry::{OpRegistration, OpRegistrationBuilder};
use crate::sbp::reduced_axis_predicate;

use super::{check_axes, check_same_data_type, check_same_shape};

/// Sums `x` over `axis` into a tensor shaped like `like`.
pub fn reduce_sum_like() -> Result<OpRegistration, OpError> {
    OpRegistrationBuilder::new("reduce_sum_like")
        .input("x")
        .input("like")
        .output("y")
        .attr("axis", AttrKind::ListInt32)
        .set_tensor_desc_infer_fn(infer_tensor_desc)
        .set_batch_axis_infer_fn(infer_batch_axis)
        .set_get_sbp_fn(get_sbp_signatures)
        .set_input_arg_modify_fn(modify_input_args)
        .set_grad_fn(generate_grad)
        .finish()
}

fn infer_tensor_desc(ctx: &mut TensorDescInferContext<'_>) -> Result<(), OpError> {
    let x = ctx.input_tensor_desc("x", 0)?;
    let like = ctx.input_tensor_desc("like", 0)?;
    let axis = ctx.attr::<Vec<i32>>("axis")?;
    check_axes(ctx.op_name(), "x_0", axis, x.shape.num_axes())?;
    if axis.is_empty() {
        check_same_shape(ctx.op_name(), ("x", x), ("like", like))?;
    }
    check_same_data_type(ctx.op_name(), ("x", x), ("like", like))?;
    *ctx.output_tensor_desc_mut("y", 0)? = like.clone();
    Ok(())
}

fn infer_batch_axis(ctx: &mut BatchAxisInferContext<'_>) -> Result<(), OpError> {
    let like_axis = ctx.input_batch_axis("like", 0)?;
    *ctx.output_batch_axis_mut("y", 0)? = like_axis;
    Ok(())
}

fn get_sbp_signatures(ctx: &mut SbpContext<'_>) -> Result<(), OpError> {
    let num_axes = ctx.logical_tensor_desc_for_input("x", 0)?.shape.num_axes();
    let is_reduced_axis = reduced_axis_predicate(ctx.attr::<Vec<i32>>("axis")?, num_axes);
    let (inputs, outputs) = (ctx.inputs(), ctx.outputs());
    let (x, like, y) = (OpArg::new("x", 0), OpArg::new("like", 0), OpArg::new("y", 0));

    for i in 0..num_axes {
        if is_reduced_axis(i) {
            ctx.new_builder()
                .split(&x, i)
                .broadcast(&like)
                .partial_sum(&y)
                .build();
            ctx.new_builder()
                .split(&x, i)
                .partial_sum(&like)
                .partial_sum(&y)
                .build();
        } else {
            ctx.new_builder().split(inputs, i).split(outputs, i).build();
        }
        // Emitted on every axis; the list keeps one copy.
        ctx.new_builder()
            .broadcast(&x)
            .partial_sum(&like)
            .broadcast(&y)
            .build();
    }
    if num_axes == 0 {
        ctx.new_builder().broadcast(inputs).broadcast(outputs).build();
    }
    Ok(())
}

fn modify_input_args(ctx: &mut InputArgModifyContext<'_>) -> Result<(), OpError> {
    ctx.modifier("like", 0)?
        .set_use_header_only(true)
        .set_requires_grad(false);
    Ok(())
}

fn generate_grad(op: &mut OpWrapper, sink: &mut GradOpSink) -> Result<(), OpError> {
    if !op.need_gen_grad_tensor_for_op_input("x", 0)? {
        return Ok(());
    }
    let Some(dy) = op.grad_tensor_with_op_output("y", 0)? else {
        return Ok(());
    };
    let grad_op_name = format!("{}_grad_x", op.op_name());
    let grad_op = OpConfWrapperBuilder::new(grad_op_name.as_str())
        .op("broadcast_like")
        .input("x", dy)
        .input("like", op.input("x", 0)?)
        .attr("broadcast_axes", op.attr::<Vec<i32>>("axis")?.clone())
        .output("y")
        .build();
    sink.add_op(grad_op);
    op.bind_grad_tensor_with_op_input(gen_logical_blob_name(&grad_op_name, "y_0"), "x", 0)
}
