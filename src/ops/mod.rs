//! Operator types shipped with the crate.

use crate::error::OpError;
use crate::registry::OpRegistryBuilder;
use crate::tensor::TensorDesc;

mod add_n;
mod broadcast_like;
mod reduce_sum_like;

pub use add_n::add_n;
pub use broadcast_like::broadcast_like;
pub use reduce_sum_like::reduce_sum_like;

pub fn register_builtins(builder: &mut OpRegistryBuilder) -> Result<(), OpError> {
    builder.register(reduce_sum_like()?)?;
    builder.register(broadcast_like()?)?;
    builder.register(add_n()?)?;
    Ok(())
}

pub(crate) fn check_same_data_type(
    op_name: &str,
    lhs: (&str, &TensorDesc),
    rhs: (&str, &TensorDesc),
) -> Result<(), OpError> {
    if lhs.1.data_type != rhs.1.data_type {
        return Err(OpError::DataTypeMismatch {
            op_name: op_name.to_string(),
            lhs: lhs.0.to_string(),
            lhs_type: lhs.1.data_type,
            rhs: rhs.0.to_string(),
            rhs_type: rhs.1.data_type,
        });
    }
    Ok(())
}

pub(crate) fn check_same_shape(
    op_name: &str,
    lhs: (&str, &TensorDesc),
    rhs: (&str, &TensorDesc),
) -> Result<(), OpError> {
    if lhs.1.shape != rhs.1.shape {
        return Err(OpError::ShapeMismatch {
            op_name: op_name.to_string(),
            lhs: lhs.0.to_string(),
            lhs_shape: lhs.1.shape.clone(),
            rhs: rhs.0.to_string(),
            rhs_shape: rhs.1.shape.clone(),
        });
    }
    Ok(())
}

/// Rejects configured axes that fall outside `[-num_axes, num_axes)`.
pub(crate) fn check_axes(op_name: &str, bn: &str, axes: &[i32], num_axes: usize) -> Result<(), OpError> {
    let rank = num_axes as i64;
    match axes.iter().find(|&&axis| !(-rank..rank).contains(&(axis as i64))) {
        Some(&axis) => Err(OpError::AxisOutOfRange {
            op_name: op_name.to_string(),
            bn: bn.to_string(),
            axis: axis as i64,
            num_axes,
        }),
        None => Ok(()),
    }
}
