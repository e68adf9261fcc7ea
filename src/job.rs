//! Whole-job driver: runs the per-operator pass over a list of operators in
//! order and generates backward operators from the inferred result.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::conf::{OpConfWrapper, OpConfWrapperBuilder, OperatorConf, gen_logical_blob_name};
use crate::error::{InferStage, OpError};
use crate::grad::{GradOpSink, OpWrapper};
use crate::infer::{InferOptions, InferredOp, infer_op};
use crate::registry::OpRegistry;
use crate::tensor::TensorDesc;

/// Operators of one job plus the descriptors of externally fed tensors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub tensors: BTreeMap<String, TensorDesc>,
    #[serde(default)]
    pub ops: Vec<OperatorConf>,
}

#[derive(Debug)]
pub struct JobInference {
    pub ops: Vec<InferredOp>,
    pub tensors: HashMap<String, TensorDesc>,
    /// Logical blob name to the name of the op producing it.
    pub producers: HashMap<String, String>,
}

impl JobInference {
    pub fn op(&self, op_name: &str) -> Option<&InferredOp> {
        self.ops.iter().find(|op| op.op_name() == op_name)
    }
}

/// Infers every op in order. An op may only consume tensors fed to the job
/// or produced by an earlier op.
pub fn infer_job(
    registry: &OpRegistry,
    job: &Job,
    options: &InferOptions,
) -> Result<JobInference, OpError> {
    let mut tensors: HashMap<String, TensorDesc> = job
        .tensors
        .iter()
        .map(|(lbn, desc)| (lbn.clone(), desc.clone()))
        .collect();
    let mut producers = HashMap::new();
    let mut ops = Vec::with_capacity(job.ops.len());

    for conf in &job.ops {
        let op = infer_op(registry, conf, &tensors, options)?;
        for (lbn, desc) in op.produced_tensors() {
            if tensors.contains_key(&lbn) {
                return Err(OpError::in_op(
                    op.op_name(),
                    InferStage::TensorDesc,
                    OpError::TensorProducedTwice { lbn },
                ));
            }
            producers.insert(lbn.clone(), op.op_name().to_string());
            tensors.insert(lbn, desc);
        }
        ops.push(op);
    }
    info!(ops = ops.len(), tensors = tensors.len(), "job inferred");

    Ok(JobInference {
        ops,
        tensors,
        producers,
    })
}

#[derive(Debug, Default)]
pub struct BackwardGraph {
    /// Generated backward ops, in the order they must run.
    pub ops: Vec<OpConfWrapper>,
    /// Forward logical blob name to the logical blob name of its gradient.
    pub tensor_grads: BTreeMap<String, String>,
}

impl BackwardGraph {
    /// Backward ops as a job that can be fed back into [`infer_job`], with
    /// the forward tensors and the loss gradient available as inputs.
    pub fn to_job(&self, forward: &JobInference, loss_grad: (&str, &TensorDesc)) -> Job {
        let mut tensors: BTreeMap<String, TensorDesc> = forward
            .tensors
            .iter()
            .map(|(lbn, desc)| (lbn.clone(), desc.clone()))
            .collect();
        tensors.insert(loss_grad.0.to_string(), loss_grad.1.clone());
        Job {
            tensors,
            ops: self.ops.iter().map(|op| op.op_conf().clone()).collect(),
        }
    }
}

/// Sums several gradient contributions of the same tensor with an `add_n`
/// op; a single contribution is used as is. The op name carries the index of
/// the op in `ops`, so it stays unique even when escaped tensor names collide.
fn accumulate_grads(lbn: &str, mut grads: Vec<String>, ops: &mut Vec<OpConfWrapper>) -> Option<String> {
    if grads.len() <= 1 {
        return grads.pop();
    }
    let op_name = format!("{}_grad_add_n_{}", lbn.replace('/', "_"), ops.len());
    let mut builder = OpConfWrapperBuilder::new(op_name.as_str()).op("add_n");
    for grad in grads {
        builder = builder.input("in", grad);
    }
    ops.push(builder.output("out").build());
    Some(gen_logical_blob_name(&op_name, "out_0"))
}

/// Walks the inferred ops backwards from `loss_lbn`, seeded with
/// `loss_grad_lbn`, and calls each op's grad fn.
pub fn generate_backward(
    registry: &OpRegistry,
    forward: &JobInference,
    loss_lbn: &str,
    loss_grad_lbn: &str,
) -> Result<BackwardGraph, OpError> {
    if !forward.tensors.contains_key(loss_lbn) {
        return Err(OpError::TensorNotFound {
            lbn: loss_lbn.to_string(),
        });
    }
    let mut pending: HashMap<String, Vec<String>> = HashMap::new();
    pending.insert(loss_lbn.to_string(), vec![loss_grad_lbn.to_string()]);
    let mut backward = BackwardGraph::default();

    for op in forward.ops.iter().rev() {
        let mut output_grads = HashMap::new();
        for (lbn, _) in op.produced_tensors() {
            let Some(grads) = pending.remove(&lbn) else {
                continue;
            };
            if let Some(grad) = accumulate_grads(&lbn, grads, &mut backward.ops) {
                backward.tensor_grads.insert(lbn.clone(), grad.clone());
                output_grads.insert(lbn, grad);
            }
        }
        if output_grads.is_empty() {
            continue;
        }

        let mut wrapper = OpWrapper::new(op, &output_grads);
        if !wrapper.needs_any_input_grad() {
            continue;
        }
        let op_name = op.op_name();
        let registration = registry
            .get(op.conf.op_type_name())
            .map_err(|err| OpError::in_op(op_name, InferStage::Grad, err))?;
        let Some(grad_fn) = &registration.grad_fn else {
            return Err(OpError::in_op(
                op_name,
                InferStage::Grad,
                OpError::GradNotRegistered {
                    op_type: registration.op_type_name.clone(),
                },
            ));
        };
        let mut sink = GradOpSink::new();
        grad_fn(&mut wrapper, &mut sink)
            .map_err(|err| OpError::in_op(op_name, InferStage::Grad, err))?;
        debug!(op = op_name, generated = sink.ops().len(), "backward ops generated");
        backward.ops.extend(sink.into_ops());

        for (input_lbn, grad_lbn) in wrapper.input_grads() {
            pending.entry(input_lbn).or_default().push(grad_lbn);
        }
    }

    // What is left are gradients of tensors fed to the job.
    let mut remaining: Vec<_> = pending.into_iter().collect();
    remaining.sort_by(|a, b| a.0.cmp(&b.0));
    for (lbn, grads) in remaining {
        if let Some(grad) = accumulate_grads(&lbn, grads, &mut backward.ops) {
            backward.tensor_grads.insert(lbn, grad);
        }
    }
    Ok(backward)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::registry::{OpRegistrationBuilder, OpRegistryBuilder};
    use crate::tensor::DataType;

    fn registry() -> OpRegistry {
        OpRegistryBuilder::with_builtins().unwrap().seal()
    }

    fn reduce_job() -> Job {
        Job {
            tensors: BTreeMap::from([
                ("in/x".to_string(), TensorDesc::new([4, 5], DataType::Float32)),
                ("in/like".to_string(), TensorDesc::new([5], DataType::Float32)),
            ]),
            ops: vec![
                OpConfWrapperBuilder::new("op1")
                    .op("reduce_sum_like")
                    .input("x", "in/x")
                    .input("like", "in/like")
                    .output("y")
                    .attr("axis", vec![0i32])
                    .build()
                    .into_op_conf(),
            ],
        }
    }

    #[test]
    fn outputs_feed_later_ops() {
        let mut job = reduce_job();
        job.ops.push(
            OpConfWrapperBuilder::new("op2")
                .op("add_n")
                .input("in", "op1/y_0")
                .input("in", "in/like")
                .output("out")
                .build()
                .into_op_conf(),
        );
        let inference = infer_job(&registry(), &job, &InferOptions::default()).unwrap();
        assert_eq!(inference.ops.len(), 2);
        assert_eq!(
            inference.tensors["op2/out_0"],
            TensorDesc::new([5], DataType::Float32)
        );
        assert_eq!(inference.producers["op1/y_0"], "op1");
        assert!(inference.op("op2").is_some());
    }

    #[test]
    fn consuming_unproduced_tensor_fails() {
        let mut job = reduce_job();
        job.ops.insert(
            0,
            OpConfWrapperBuilder::new("op0")
                .op("add_n")
                .input("in", "op1/y_0")
                .input("in", "in/like")
                .output("out")
                .build()
                .into_op_conf(),
        );
        let err = infer_job(&registry(), &job, &InferOptions::default()).unwrap_err();
        assert_eq!(err.op_name(), Some("op0"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn duplicate_op_names_collide() {
        let mut job = reduce_job();
        let again = job.ops[0].clone();
        job.ops.push(again);
        let err = infer_job(&registry(), &job, &InferOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
    }

    #[test]
    fn backward_of_reduce_sum_like_infers() {
        let registry = registry();
        let forward = infer_job(&registry, &reduce_job(), &InferOptions::default()).unwrap();
        let backward = generate_backward(&registry, &forward, "op1/y_0", "in/dy").unwrap();

        assert_eq!(backward.ops.len(), 1);
        assert_eq!(backward.ops[0].op_type_name(), "broadcast_like");
        assert_eq!(backward.tensor_grads["in/x"], "op1_grad_x/y_0");
        assert!(!backward.tensor_grads.contains_key("in/like"));

        let dy = TensorDesc::new([5], DataType::Float32);
        let job = backward.to_job(&forward, ("in/dy", &dy));
        let inferred = infer_job(&registry, &job, &InferOptions::default()).unwrap();
        assert_eq!(
            inferred.tensors["op1_grad_x/y_0"],
            TensorDesc::new([4, 5], DataType::Float32)
        );
    }

    #[test]
    fn fan_out_gradients_are_summed() {
        let job = Job {
            tensors: BTreeMap::from([(
                "in/x".to_string(),
                TensorDesc::new([3], DataType::Float32),
            )]),
            ops: vec![
                OpConfWrapperBuilder::new("double")
                    .op("add_n")
                    .input("in", "in/x")
                    .input("in", "in/x")
                    .output("out")
                    .build()
                    .into_op_conf(),
            ],
        };
        let registry = registry();
        let forward = infer_job(&registry, &job, &InferOptions::default()).unwrap();
        let backward = generate_backward(&registry, &forward, "double/out_0", "in/g").unwrap();

        assert_eq!(backward.ops.len(), 1);
        let acc = &backward.ops[0];
        assert_eq!(acc.op_type_name(), "add_n");
        assert_eq!(acc.input_size("in"), 2);
        assert_eq!(backward.tensor_grads["in/x"], "in_x_grad_add_n_0/out_0");
    }

    #[test]
    fn accumulated_grad_names_stay_unique() {
        let desc = TensorDesc::new([3], DataType::Float32);
        let job = Job {
            tensors: BTreeMap::from([
                ("a/b_0".to_string(), desc.clone()),
                ("a_b/0".to_string(), desc.clone()),
            ]),
            ops: vec![
                OpConfWrapperBuilder::new("sum")
                    .op("add_n")
                    .input("in", "a/b_0")
                    .input("in", "a/b_0")
                    .input("in", "a_b/0")
                    .input("in", "a_b/0")
                    .output("out")
                    .build()
                    .into_op_conf(),
            ],
        };
        let registry = registry();
        let forward = infer_job(&registry, &job, &InferOptions::default()).unwrap();
        let backward = generate_backward(&registry, &forward, "sum/out_0", "in/g").unwrap();

        assert_eq!(backward.ops.len(), 2);
        assert_eq!(backward.tensor_grads["a/b_0"], "a_b_0_grad_add_n_0/out_0");
        assert_eq!(backward.tensor_grads["a_b/0"], "a_b_0_grad_add_n_1/out_0");
        let job = backward.to_job(&forward, ("in/g", &desc));
        let inferred = infer_job(&registry, &job, &InferOptions::default()).unwrap();
        assert_eq!(inferred.tensors["a_b_0_grad_add_n_1/out_0"], desc);
    }

    #[test]
    fn missing_grad_fn_is_reported() {
        let mut builder = OpRegistryBuilder::new();
        builder
            .register(
                OpRegistrationBuilder::new("copy")
                    .input("in")
                    .output("out")
                    .set_tensor_desc_infer_fn(|ctx| {
                        let desc = ctx.input_tensor_desc("in", 0)?.clone();
                        *ctx.output_tensor_desc_mut("out", 0)? = desc;
                        Ok(())
                    })
                    .finish()
                    .unwrap(),
            )
            .unwrap();
        let registry = builder.seal();
        let job = Job {
            tensors: BTreeMap::from([("in/x".to_string(), TensorDesc::new([3], DataType::Float32))]),
            ops: vec![
                OpConfWrapperBuilder::new("c")
                    .op("copy")
                    .input("in", "in/x")
                    .output("out")
                    .build()
                    .into_op_conf(),
            ],
        };
        let forward = infer_job(&registry, &job, &InferOptions::default()).unwrap();
        let err = generate_backward(&registry, &forward, "c/out_0", "in/g").unwrap_err();
        assert!(matches!(
            err,
            OpError::Op {
                stage: InferStage::Grad,
                ..
            }
        ));
        assert!(generate_backward(&registry, &forward, "nope/out_0", "in/g").is_err());
    }
}
