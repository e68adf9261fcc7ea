use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::attr::{AttrStore, AttrType, AttrValue};
use crate::error::OpError;

/// One argument slot of an operator: argument name plus position within it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpArg {
    pub name: String,
    pub index: usize,
}

impl OpArg {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }

    /// Blob name of the slot, e.g. `x_0`.
    pub fn bn(&self) -> String {
        gen_repeated_bn(&self.name, self.index)
    }
}

pub fn gen_repeated_bn(arg_name: &str, index: usize) -> String {
    format!("{}_{}", arg_name, index)
}

/// Logical blob name of an operator output, e.g. `op1/y_0`.
pub fn gen_logical_blob_name(op_name: &str, bn: &str) -> String {
    format!("{}/{}", op_name, bn)
}

pub fn parse_logical_blob_name(lbn: &str) -> Option<(&str, &str)> {
    let (op_name, bn) = lbn.rsplit_once('/')?;
    if op_name.is_empty() || bn.is_empty() {
        return None;
    }
    Some((op_name, bn))
}

/// Serialized operator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorConf {
    pub name: String,
    pub op_type_name: String,
    #[serde(default)]
    pub input: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub output: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub attr: AttrStore,
}

/// Read-only view over an [`OperatorConf`].
#[derive(Debug, Clone, PartialEq)]
pub struct OpConfWrapper {
    conf: OperatorConf,
}

impl OpConfWrapper {
    pub fn new(conf: OperatorConf) -> Self {
        Self { conf }
    }

    pub fn op_conf(&self) -> &OperatorConf {
        &self.conf
    }

    pub fn into_op_conf(self) -> OperatorConf {
        self.conf
    }

    pub fn op_name(&self) -> &str {
        &self.conf.name
    }

    pub fn op_type_name(&self) -> &str {
        &self.conf.op_type_name
    }

    pub fn input(&self, arg_name: &str, index: usize) -> Result<&str, OpError> {
        self.lookup("input", &self.conf.input, arg_name, index)
    }

    pub fn output(&self, arg_name: &str, index: usize) -> Result<&str, OpError> {
        self.lookup("output", &self.conf.output, arg_name, index)
    }

    pub fn has_input(&self, arg_name: &str, index: usize) -> bool {
        index < self.input_size(arg_name)
    }

    pub fn has_output(&self, arg_name: &str, index: usize) -> bool {
        index < self.output_size(arg_name)
    }

    pub fn input_size(&self, arg_name: &str) -> usize {
        self.conf.input.get(arg_name).map_or(0, Vec::len)
    }

    pub fn output_size(&self, arg_name: &str) -> usize {
        self.conf.output.get(arg_name).map_or(0, Vec::len)
    }

    /// Every bound input slot, ordered by argument name then index.
    pub fn input_args(&self) -> Vec<OpArg> {
        expand_args(&self.conf.input)
    }

    /// Every declared output slot, ordered by argument name then index.
    pub fn output_args(&self) -> Vec<OpArg> {
        expand_args(&self.conf.output)
    }

    pub fn attr<T: AttrType>(&self, attr_name: &str) -> Result<&T, OpError> {
        self.conf.attr.get(attr_name)
    }

    pub fn attrs(&self) -> &AttrStore {
        &self.conf.attr
    }

    fn lookup<'a>(
        &self,
        direction: &'static str,
        args: &'a BTreeMap<String, Vec<String>>,
        arg_name: &str,
        index: usize,
    ) -> Result<&'a str, OpError> {
        let list = args.get(arg_name).ok_or_else(|| OpError::ArgNotFound {
            op_name: self.conf.name.clone(),
            direction,
            arg: arg_name.to_string(),
        })?;
        list.get(index)
            .map(String::as_str)
            .ok_or_else(|| OpError::ArgIndexOutOfRange {
                op_name: self.conf.name.clone(),
                direction,
                arg: arg_name.to_string(),
                index,
                size: list.len(),
            })
    }
}

fn expand_args(args: &BTreeMap<String, Vec<String>>) -> Vec<OpArg> {
    args.iter()
        .flat_map(|(name, list)| (0..list.len()).map(move |index| OpArg::new(name.clone(), index)))
        .collect()
}

/// Fluent constructor for a new operator configuration.
///
/// ```
/// use opframe::OpConfWrapperBuilder;
///
/// let op = OpConfWrapperBuilder::new("op1")
///     .op("reduce_sum_like")
///     .input("x", "in/x_0")
///     .input("like", "in/like_0")
///     .output("y")
///     .attr("axis", vec![0i32])
///     .build();
/// assert_eq!(op.output("y", 0).unwrap(), "op1/y_0");
/// ```
#[derive(Debug, Clone)]
pub struct OpConfWrapperBuilder {
    op_name: String,
    op_type_name: String,
    input: BTreeMap<String, Vec<String>>,
    output: BTreeMap<String, Vec<String>>,
    attr: AttrStore,
}

impl OpConfWrapperBuilder {
    pub fn new(op_name: impl Into<String>) -> Self {
        Self {
            op_name: op_name.into(),
            op_type_name: String::new(),
            input: BTreeMap::new(),
            output: BTreeMap::new(),
            attr: AttrStore::new(),
        }
    }

    pub fn op(mut self, op_type_name: impl Into<String>) -> Self {
        self.op_type_name = op_type_name.into();
        self
    }

    pub fn input(mut self, arg_name: impl Into<String>, logical_blob_name: impl Into<String>) -> Self {
        self.input
            .entry(arg_name.into())
            .or_default()
            .push(logical_blob_name.into());
        self
    }

    pub fn output(self, arg_name: impl Into<String>) -> Self {
        self.output_n(arg_name, 1)
    }

    pub fn output_n(mut self, arg_name: impl Into<String>, num: usize) -> Self {
        let arg_name = arg_name.into();
        let list = self.output.entry(arg_name.clone()).or_default();
        let start = list.len();
        for index in start..start + num {
            list.push(gen_logical_blob_name(
                &self.op_name,
                &gen_repeated_bn(&arg_name, index),
            ));
        }
        self
    }

    pub fn attr(mut self, attr_name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attr.set(attr_name, value);
        self
    }

    pub fn build(self) -> OpConfWrapper {
        OpConfWrapper::new(OperatorConf {
            name: self.op_name,
            op_type_name: self.op_type_name,
            input: self.input,
            output: self.output,
            attr: self.attr,
        })
    }
}
