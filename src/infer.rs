//! The per-operator compiler pass.
//!
//! [`infer_op`] checks a configuration against its registered schema and
//! then runs the registered callbacks in order: tensor desc, batch axis,
//! sbp signatures, input arg modifiers. The first failure aborts the pass
//! and is reported with the operator name and stage attached.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, trace};

use crate::conf::{OpArg, OpConfWrapper, OperatorConf};
use crate::context::{
    BatchAxisInferContext, InputArgModifier, InputArgModifyContext, SbpContext,
    TensorDescInferContext,
};
use crate::error::{InferStage, OpError};
use crate::registry::{ArgDef, OpRegistration, OpRegistry};
use crate::sbp::{SbpSignatureBuilder, SbpSignatureList};
use crate::tensor::{DataType, TensorDesc};

#[derive(Debug, Clone)]
pub struct InferOptions {
    /// Reject attributes the op type does not declare.
    pub reject_undeclared_attrs: bool,
    pub allowed_data_types: HashSet<DataType>,
    pub max_sbp_signatures: usize,
}

impl Default for InferOptions {
    fn default() -> Self {
        Self {
            reject_undeclared_attrs: true,
            allowed_data_types: DataType::ALL.into_iter().collect(),
            max_sbp_signatures: 4096,
        }
    }
}

/// Fully resolved result of the pass for one operator instance.
#[derive(Debug, Clone)]
pub struct InferredOp {
    pub conf: OpConfWrapper,
    pub input_args: Vec<OpArg>,
    pub output_args: Vec<OpArg>,
    pub input_descs: BTreeMap<OpArg, TensorDesc>,
    pub output_descs: BTreeMap<OpArg, TensorDesc>,
    pub sbp_signatures: SbpSignatureList,
    pub input_modifiers: BTreeMap<OpArg, InputArgModifier>,
}

impl InferredOp {
    pub fn op_name(&self) -> &str {
        self.conf.op_name()
    }

    pub fn output_tensor_desc(&self, arg_name: &str, index: usize) -> Option<&TensorDesc> {
        self.output_descs.get(&OpArg::new(arg_name, index))
    }

    pub fn input_tensor_desc(&self, arg_name: &str, index: usize) -> Option<&TensorDesc> {
        self.input_descs.get(&OpArg::new(arg_name, index))
    }

    pub fn input_modifier(&self, arg_name: &str, index: usize) -> Option<&InputArgModifier> {
        self.input_modifiers.get(&OpArg::new(arg_name, index))
    }

    /// `(logical blob name, descriptor)` of every output.
    pub fn produced_tensors(&self) -> Vec<(String, TensorDesc)> {
        self.output_descs
            .iter()
            .filter_map(|(arg, desc)| {
                let lbn = self.conf.output(&arg.name, arg.index).ok()?;
                Some((lbn.to_string(), desc.clone()))
            })
            .collect()
    }
}

fn check_args(
    op_name: &str,
    direction: &'static str,
    defs: &[ArgDef],
    bound: &BTreeMap<String, Vec<String>>,
) -> Result<(), OpError> {
    for name in bound.keys() {
        if !defs.iter().any(|def| &def.name == name) {
            return Err(OpError::ArgNotFound {
                op_name: op_name.to_string(),
                direction,
                arg: name.clone(),
            });
        }
    }
    for def in defs {
        let count = bound.get(&def.name).map_or(0, Vec::len);
        if !def.accepts(count) {
            return Err(OpError::ArgCountMismatch {
                op_name: op_name.to_string(),
                direction,
                arg: def.name.clone(),
                expected: def.describe_count(),
                actual: count,
            });
        }
    }
    Ok(())
}

/// Validates `conf` against the registered schema and fills in default
/// attribute values.
pub fn check_and_complete_conf(
    conf: &OperatorConf,
    registration: &OpRegistration,
    options: &InferOptions,
) -> Result<OperatorConf, OpError> {
    if conf.op_type_name != registration.op_type_name {
        return Err(OpError::OpTypeMismatch {
            op_name: conf.name.clone(),
            expected: registration.op_type_name.clone(),
            actual: conf.op_type_name.clone(),
        });
    }
    let schema = &registration.schema;
    check_args(&conf.name, "input", &schema.inputs, &conf.input)?;
    check_args(&conf.name, "output", &schema.outputs, &conf.output)?;

    let mut completed = conf.clone();
    for (name, value) in conf.attr.iter() {
        match schema.attr(name) {
            Some(def) if def.kind != value.kind() => {
                return Err(OpError::AttrTypeMismatch {
                    attr: name.to_string(),
                    expected: def.kind,
                    actual: value.kind(),
                });
            }
            Some(_) => {}
            None if options.reject_undeclared_attrs => {
                return Err(OpError::UndeclaredAttr {
                    op_type: conf.op_type_name.clone(),
                    attr: name.to_string(),
                });
            }
            None => {}
        }
    }
    for def in &schema.attrs {
        if completed.attr.contains(&def.name) {
            continue;
        }
        match &def.default {
            Some(default) => completed.attr.set(def.name.clone(), default.clone()),
            None => {
                return Err(OpError::AttrNotFound {
                    attr: def.name.clone(),
                });
            }
        }
    }
    Ok(completed)
}

/// Slots in schema declaration order, then index.
fn ordered_args(defs: &[ArgDef], size: impl Fn(&str) -> usize) -> Vec<OpArg> {
    defs.iter()
        .flat_map(|def| (0..size(&def.name)).map(|index| OpArg::new(def.name.clone(), index)))
        .collect()
}

fn check_data_type(
    op_name: &str,
    arg: &OpArg,
    desc: &TensorDesc,
    options: &InferOptions,
) -> Result<(), OpError> {
    if options.allowed_data_types.contains(&desc.data_type) {
        Ok(())
    } else {
        Err(OpError::UnsupportedDataType {
            op_name: op_name.to_string(),
            bn: arg.bn(),
            data_type: desc.data_type,
        })
    }
}

/// Runs the full pass for one operator instance. Input descriptors are
/// looked up by logical blob name in `tensors`.
pub fn infer_op(
    registry: &OpRegistry,
    conf: &OperatorConf,
    tensors: &HashMap<String, TensorDesc>,
    options: &InferOptions,
) -> Result<InferredOp, OpError> {
    let op_name = conf.name.as_str();
    let registration = registry
        .get(&conf.op_type_name)
        .map_err(|err| OpError::in_op(op_name, InferStage::CheckConf, err))?;
    let completed = check_and_complete_conf(conf, registration, options)
        .map_err(|err| OpError::in_op(op_name, InferStage::CheckConf, err))?;
    let conf = OpConfWrapper::new(completed);
    debug!(op = op_name, op_type = %conf.op_type_name(), "inferring op");

    let input_args = ordered_args(&registration.schema.inputs, |name| conf.input_size(name));
    let output_args = ordered_args(&registration.schema.outputs, |name| conf.output_size(name));

    let input_descs = collect_inputs(&conf, &input_args, tensors, options)
        .map_err(|err| OpError::in_op(op_name, InferStage::CheckConf, err))?;

    let mut output_descs =
        infer_tensor_descs(registration, &conf, &input_descs, &output_args, options)
            .map_err(|err| OpError::in_op(op_name, InferStage::TensorDesc, err))?;

    infer_batch_axes(registration, &conf, &input_descs, &mut output_descs)
        .map_err(|err| OpError::in_op(op_name, InferStage::BatchAxis, err))?;

    let sbp_signatures = infer_sbp_signatures(
        registration,
        &conf,
        &input_descs,
        &input_args,
        &output_args,
        options,
    )
    .map_err(|err| OpError::in_op(op_name, InferStage::SbpSignature, err))?;
    debug!(
        op = op_name,
        candidates = sbp_signatures.len(),
        "sbp signatures enumerated"
    );

    let input_modifiers = modify_input_args(registration, &conf, &input_args)
        .map_err(|err| OpError::in_op(op_name, InferStage::InputArgModify, err))?;

    Ok(InferredOp {
        conf,
        input_args,
        output_args,
        input_descs,
        output_descs,
        sbp_signatures,
        input_modifiers,
    })
}

fn collect_inputs(
    conf: &OpConfWrapper,
    input_args: &[OpArg],
    tensors: &HashMap<String, TensorDesc>,
    options: &InferOptions,
) -> Result<BTreeMap<OpArg, TensorDesc>, OpError> {
    let mut inputs = BTreeMap::new();
    for arg in input_args {
        let lbn = conf.input(&arg.name, arg.index)?;
        let desc = tensors.get(lbn).ok_or_else(|| OpError::TensorNotFound {
            lbn: lbn.to_string(),
        })?;
        check_data_type(conf.op_name(), arg, desc, options)?;
        inputs.insert(arg.clone(), desc.clone());
    }
    Ok(inputs)
}

fn infer_tensor_descs(
    registration: &OpRegistration,
    conf: &OpConfWrapper,
    inputs: &BTreeMap<OpArg, TensorDesc>,
    output_args: &[OpArg],
    options: &InferOptions,
) -> Result<BTreeMap<OpArg, TensorDesc>, OpError> {
    let mut scratch: BTreeMap<OpArg, Option<TensorDesc>> =
        output_args.iter().map(|arg| (arg.clone(), None)).collect();
    {
        let mut ctx = TensorDescInferContext::new(conf, inputs, &mut scratch);
        (registration.tensor_desc_infer_fn)(&mut ctx)?;
    }
    let mut outputs = BTreeMap::new();
    for (arg, desc) in scratch {
        let desc = desc.ok_or_else(|| OpError::OutputNotInferred {
            op_name: conf.op_name().to_string(),
            bn: arg.bn(),
        })?;
        check_data_type(conf.op_name(), &arg, &desc, options)?;
        trace!(op = conf.op_name(), bn = %arg.bn(), shape = %desc.shape, "output inferred");
        outputs.insert(arg, desc);
    }
    Ok(outputs)
}

fn infer_batch_axes(
    registration: &OpRegistration,
    conf: &OpConfWrapper,
    inputs: &BTreeMap<OpArg, TensorDesc>,
    outputs: &mut BTreeMap<OpArg, TensorDesc>,
) -> Result<(), OpError> {
    let mut axes: BTreeMap<OpArg, Option<usize>> =
        outputs.keys().map(|arg| (arg.clone(), None)).collect();
    if let Some(batch_axis_infer_fn) = &registration.batch_axis_infer_fn {
        let mut ctx = BatchAxisInferContext::new(conf, inputs, outputs, &mut axes);
        batch_axis_infer_fn(&mut ctx)?;
    }
    for (arg, axis) in &axes {
        let Some(desc) = outputs.get(arg) else {
            continue;
        };
        if let Some(axis) = *axis
            && axis >= desc.shape.num_axes()
        {
            return Err(OpError::AxisOutOfRange {
                op_name: conf.op_name().to_string(),
                bn: arg.bn(),
                axis: axis as i64,
                num_axes: desc.shape.num_axes(),
            });
        }
    }
    for (arg, axis) in axes {
        if let Some(desc) = outputs.get_mut(&arg) {
            desc.batch_axis = axis;
        }
    }
    Ok(())
}

fn infer_sbp_signatures(
    registration: &OpRegistration,
    conf: &OpConfWrapper,
    inputs: &BTreeMap<OpArg, TensorDesc>,
    input_args: &[OpArg],
    output_args: &[OpArg],
    options: &InferOptions,
) -> Result<SbpSignatureList, OpError> {
    let mut signatures = SbpSignatureList::new();
    match &registration.get_sbp_fn {
        Some(get_sbp_fn) => {
            let mut ctx = SbpContext::new(conf, inputs, input_args, output_args, &mut signatures);
            get_sbp_fn(&mut ctx)?;
        }
        None => {
            // Without a registered enumeration only full replication is known to be safe.
            SbpSignatureBuilder::new(&mut signatures)
                .broadcast(input_args)
                .broadcast(output_args)
                .build();
        }
    }

    let op_name = conf.op_name();
    if signatures.is_empty() {
        return Err(OpError::NoSbpSignature {
            op_name: op_name.to_string(),
        });
    }
    if signatures.len() > options.max_sbp_signatures {
        return Err(OpError::TooManySbpSignatures {
            op_name: op_name.to_string(),
            limit: options.max_sbp_signatures,
        });
    }
    let declared: HashSet<String> = input_args
        .iter()
        .chain(output_args)
        .map(OpArg::bn)
        .collect();
    for signature in &signatures {
        if let Some((bn, _)) = signature.iter().find(|(bn, _)| !declared.contains(*bn)) {
            return Err(OpError::UndeclaredArg {
                op_name: op_name.to_string(),
                bn: bn.to_string(),
            });
        }
        if let Some(bn) = declared.iter().find(|bn| signature.get_bn(bn).is_none()) {
            return Err(OpError::IncompleteSbpSignature {
                op_name: op_name.to_string(),
                bn: bn.clone(),
            });
        }
    }
    Ok(signatures)
}

fn modify_input_args(
    registration: &OpRegistration,
    conf: &OpConfWrapper,
    input_args: &[OpArg],
) -> Result<BTreeMap<OpArg, InputArgModifier>, OpError> {
    let mut modifiers: BTreeMap<OpArg, InputArgModifier> = input_args
        .iter()
        .map(|arg| (arg.clone(), InputArgModifier::default()))
        .collect();
    if let Some(input_arg_modify_fn) = &registration.input_arg_modify_fn {
        let mut ctx = InputArgModifyContext::new(conf, &mut modifiers);
        input_arg_modify_fn(&mut ctx)?;
    }
    Ok(modifiers)
}
