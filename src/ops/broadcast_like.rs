use crate::attr::AttrKind;
use crate::conf::{OpArg, OpConfWrapperBuilder, gen_logical_blob_name};
use crate::context::{
    BatchAxisInferContext, InputArgModifyContext, SbpContext, TensorDescInferContext,
};
use crate::error::OpError;
use crate::grad::{GradOpSink, OpWrapper};
use crate::registry::{OpRegistration, OpRegistrationBuilder};
use crate::sbp::normalize_axes;

use super::{check_axes, check_same_data_type, check_same_shape};

/// Broadcasts `x` along `broadcast_axes` to the shape of `like`. `x` either
/// keeps the broadcast axes as size-1 dimensions or drops them.
pub fn broadcast_like() -> Result<OpRegistration, OpError> {
    OpRegistrationBuilder::new("broadcast_like")
        .input("x")
        .input("like")
        .output("y")
        .attr("broadcast_axes", AttrKind::ListInt32)
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
    let axes = ctx.attr::<Vec<i32>>("broadcast_axes")?;
    let like_rank = like.shape.num_axes();
    check_axes(ctx.op_name(), "like_0", axes, like_rank)?;
    if axes.is_empty() {
        check_same_shape(ctx.op_name(), ("x", x), ("like", like))?;
    }
    let broadcast_axes = normalize_axes(axes, like_rank);
    let like_dims = like.shape.dims();
    let fits = if x.shape.num_axes() == like_rank {
        x.shape
            .dims()
            .iter()
            .zip(like_dims)
            .enumerate()
            .all(|(i, (&xd, &ld))| if broadcast_axes.contains(&i) { xd == 1 } else { xd == ld })
    } else {
        let kept = like_dims
            .iter()
            .enumerate()
            .filter(|(i, _)| !broadcast_axes.contains(i))
            .map(|(_, &d)| d);
        x.shape.dims().iter().copied().eq(kept)
    };
    if !fits {
        return Err(OpError::ShapeMismatch {
            op_name: ctx.op_name().to_string(),
            lhs: "x".to_string(),
            lhs_shape: x.shape.clone(),
            rhs: "like".to_string(),
            rhs_shape: like.shape.clone(),
        });
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
    let like_rank = ctx.logical_tensor_desc_for_input("like", 0)?.shape.num_axes();
    let x_rank = ctx.logical_tensor_desc_for_input("x", 0)?.shape.num_axes();
    let broadcast_axes = normalize_axes(ctx.attr::<Vec<i32>>("broadcast_axes")?, like_rank);
    let keeps_dims = x_rank == like_rank;
    let (x, like, y) = (OpArg::new("x", 0), OpArg::new("like", 0), OpArg::new("y", 0));

    let mut x_axis = 0;
    for i in 0..like_rank {
        if broadcast_axes.contains(&i) {
            ctx.new_builder()
                .broadcast(&x)
                .split(&like, i)
                .split(&y, i)
                .build();
            if keeps_dims {
                x_axis += 1;
            }
        } else {
            ctx.new_builder()
                .split(&x, x_axis)
                .split(&like, i)
                .split(&y, i)
                .build();
            x_axis += 1;
        }
    }
    ctx.new_builder()
        .partial_sum(&x)
        .broadcast(&like)
        .partial_sum(&y)
        .build();
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
        .op("reduce_sum_like")
        .input("x", dy)
        .input("like", op.input("x", 0)?)
        .attr("axis", op.attr::<Vec<i32>>("broadcast_axes")?.clone())
        .output("y")
        .build();
    sink.add_op(grad_op);
    op.bind_grad_tensor_with_op_input(gen_logical_blob_name(&grad_op_name, "y_0"), "x", 0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::conf::OpConfWrapperBuilder;
    use crate::error::{ErrorKind, OpError};
    use crate::infer::{InferOptions, InferredOp, infer_op};
    use crate::registry::OpRegistryBuilder;
    use crate::sbp::SbpParallel;
    use crate::tensor::{DataType, TensorDesc};

    fn infer(x: TensorDesc, like: TensorDesc, axes: Vec<i32>) -> Result<InferredOp, OpError> {
        let registry = OpRegistryBuilder::with_builtins().unwrap().seal();
        let conf = OpConfWrapperBuilder::new("bcast")
            .op("broadcast_like")
            .input("x", "in/x")
            .input("like", "in/like")
            .output("y")
            .attr("broadcast_axes", axes)
            .build();
        let tensors = HashMap::from([("in/x".to_string(), x), ("in/like".to_string(), like)]);
        infer_op(&registry, conf.op_conf(), &tensors, &InferOptions::default())
    }

    #[test]
    fn output_takes_like_desc() {
        let like = TensorDesc::new([4, 5], DataType::Float32).with_batch_axis(0);
        let op = infer(TensorDesc::new([5], DataType::Float32), like.clone(), vec![0]).unwrap();
        assert_eq!(op.output_tensor_desc("y", 0), Some(&like));
    }

    #[test]
    fn split_positions_skip_dropped_axes() {
        let op = infer(
            TensorDesc::new([5], DataType::Float32),
            TensorDesc::new([4, 5], DataType::Float32),
            vec![0],
        )
        .unwrap();
        let sigs = op.sbp_signatures.as_slice();
        assert_eq!(sigs.len(), 3);
        assert_eq!(sigs[0].get_bn("x_0"), Some(SbpParallel::Broadcast));
        assert_eq!(sigs[0].get_bn("like_0"), Some(SbpParallel::Split { axis: 0 }));
        assert_eq!(sigs[1].get_bn("x_0"), Some(SbpParallel::Split { axis: 0 }));
        assert_eq!(sigs[1].get_bn("y_0"), Some(SbpParallel::Split { axis: 1 }));
        assert_eq!(sigs[2].get_bn("y_0"), Some(SbpParallel::PartialSum));
    }

    #[test]
    fn split_positions_with_kept_dims() {
        let op = infer(
            TensorDesc::new([1, 5], DataType::Float32),
            TensorDesc::new([4, 5], DataType::Float32),
            vec![0],
        )
        .unwrap();
        let sigs = op.sbp_signatures.as_slice();
        assert_eq!(sigs[1].get_bn("x_0"), Some(SbpParallel::Split { axis: 1 }));
    }

    #[test]
    fn rank_mismatch_fails() {
        let err = infer(
            TensorDesc::new([2, 2, 5], DataType::Float32),
            TensorDesc::new([4, 5], DataType::Float32),
            vec![0],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn kept_dims_must_be_one_on_broadcast_axes() {
        let err = infer(
            TensorDesc::new([3, 7], DataType::Float32),
            TensorDesc::new([4, 5], DataType::Float32),
            vec![0],
        )
        .unwrap_err();
        assert!(matches!(
            &err,
            OpError::Op { source, .. } if matches!(**source, OpError::ShapeMismatch { .. })
        ));
        let err = infer(
            TensorDesc::new([1, 7], DataType::Float32),
            TensorDesc::new([4, 5], DataType::Float32),
            vec![0],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn dropped_dims_must_match_kept_like_dims() {
        let err = infer(
            TensorDesc::new([7], DataType::Float32),
            TensorDesc::new([4, 5], DataType::Float32),
            vec![0],
        )
        .unwrap_err();
        assert!(matches!(
            &err,
            OpError::Op { source, .. } if matches!(**source, OpError::ShapeMismatch { .. })
        ));
        let op = infer(
            TensorDesc::new([4], DataType::Float32),
            TensorDesc::new([4, 5], DataType::Float32),
            vec![-1],
        )
        .unwrap();
        assert_eq!(op.output_tensor_desc("y", 0).unwrap().shape.dims(), &[4, 5]);
    }

    #[test]
    fn like_is_header_only() {
        let op = infer(
            TensorDesc::new([5], DataType::Float32),
            TensorDesc::new([4, 5], DataType::Float32),
            vec![0],
        )
        .unwrap();
        let like = op.input_modifier("like", 0).unwrap();
        assert!(like.use_header_only);
        assert!(!like.requires_grad);
    }
}
