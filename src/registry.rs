//! Operator type registry.
//!
//! Registration happens in a closed phase on an [`OpRegistryBuilder`]; calling
//! [`OpRegistryBuilder::seal`] yields the read-only [`OpRegistry`] that every
//! compilation pass queries. A sealed registry can be installed once as the
//! process-wide instance.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::debug;

use crate::attr::{AttrKind, AttrValue};
use crate::context::{
    BatchAxisInferContext, InputArgModifyContext, SbpContext, TensorDescInferContext,
};
use crate::error::OpError;
use crate::grad::{GradOpSink, OpWrapper};

pub type TensorDescInferFn =
    Arc<dyn Fn(&mut TensorDescInferContext<'_>) -> Result<(), OpError> + Send + Sync>;
pub type BatchAxisInferFn =
    Arc<dyn Fn(&mut BatchAxisInferContext<'_>) -> Result<(), OpError> + Send + Sync>;
pub type GetSbpFn = Arc<dyn Fn(&mut SbpContext<'_>) -> Result<(), OpError> + Send + Sync>;
pub type InputArgModifyFn =
    Arc<dyn Fn(&mut InputArgModifyContext<'_>) -> Result<(), OpError> + Send + Sync>;
pub type GradFn =
    Arc<dyn Fn(&mut OpWrapper, &mut GradOpSink) -> Result<(), OpError> + Send + Sync>;

/// Declared input or output argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDef {
    pub name: String,
    pub num: usize,
    pub optional: bool,
    /// `num` is a lower bound rather than an exact count.
    pub num_as_min: bool,
}

impl ArgDef {
    pub fn accepts(&self, count: usize) -> bool {
        if count == 0 && self.optional {
            return true;
        }
        if self.num_as_min {
            count >= self.num
        } else {
            count == self.num
        }
    }

    pub fn describe_count(&self) -> String {
        match (self.optional, self.num_as_min) {
            (true, true) => format!("0 or at least {}", self.num),
            (true, false) => format!("0 or {}", self.num),
            (false, true) => format!("at least {}", self.num),
            (false, false) => self.num.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttrDef {
    pub name: String,
    pub kind: AttrKind,
    pub default: Option<AttrValue>,
}

/// Declared arguments and attributes of an operator type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpSchema {
    pub inputs: Vec<ArgDef>,
    pub outputs: Vec<ArgDef>,
    pub attrs: Vec<AttrDef>,
}

impl OpSchema {
    pub fn input(&self, name: &str) -> Option<&ArgDef> {
        self.inputs.iter().find(|def| def.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&ArgDef> {
        self.outputs.iter().find(|def| def.name == name)
    }

    pub fn attr(&self, name: &str) -> Option<&AttrDef> {
        self.attrs.iter().find(|def| def.name == name)
    }
}

/// One registry entry: schema plus the callbacks of the operator type.
#[derive(Clone)]
pub struct OpRegistration {
    pub op_type_name: String,
    pub schema: OpSchema,
    pub tensor_desc_infer_fn: TensorDescInferFn,
    pub batch_axis_infer_fn: Option<BatchAxisInferFn>,
    pub get_sbp_fn: Option<GetSbpFn>,
    pub input_arg_modify_fn: Option<InputArgModifyFn>,
    pub grad_fn: Option<GradFn>,
}

impl fmt::Debug for OpRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRegistration")
            .field("op_type_name", &self.op_type_name)
            .field("schema", &self.schema)
            .field("batch_axis_infer_fn", &self.batch_axis_infer_fn.is_some())
            .field("get_sbp_fn", &self.get_sbp_fn.is_some())
            .field("input_arg_modify_fn", &self.input_arg_modify_fn.is_some())
            .field("grad_fn", &self.grad_fn.is_some())
            .finish()
    }
}

fn is_identifier(name: &str) -> bool {
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    IDENTIFIER
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
        .is_match(name)
}

/// Fluent declaration of an operator type.
///
/// ```
/// use opframe::{AttrKind, OpRegistrationBuilder};
///
/// let registration = OpRegistrationBuilder::new("identity")
///     .input("in")
///     .output("out")
///     .attr("note", AttrKind::String)
///     .set_tensor_desc_infer_fn(|ctx| {
///         let desc = ctx.input_tensor_desc("in", 0)?.clone();
///         *ctx.output_tensor_desc_mut("out", 0)? = desc;
///         Ok(())
///     })
///     .finish()
///     .unwrap();
/// assert_eq!(registration.schema.inputs.len(), 1);
/// ```
pub struct OpRegistrationBuilder {
    op_type_name: String,
    schema: OpSchema,
    tensor_desc_infer_fn: Option<TensorDescInferFn>,
    batch_axis_infer_fn: Option<BatchAxisInferFn>,
    get_sbp_fn: Option<GetSbpFn>,
    input_arg_modify_fn: Option<InputArgModifyFn>,
    grad_fn: Option<GradFn>,
}

impl OpRegistrationBuilder {
    pub fn new(op_type_name: impl Into<String>) -> Self {
        Self {
            op_type_name: op_type_name.into(),
            schema: OpSchema::default(),
            tensor_desc_infer_fn: None,
            batch_axis_infer_fn: None,
            get_sbp_fn: None,
            input_arg_modify_fn: None,
            grad_fn: None,
        }
    }

    pub fn input(self, name: impl Into<String>) -> Self {
        self.push_input(name, 1, false, false)
    }

    pub fn input_with_num(self, name: impl Into<String>, num: usize) -> Self {
        self.push_input(name, num, false, false)
    }

    pub fn input_with_minimum(self, name: impl Into<String>, num: usize) -> Self {
        self.push_input(name, num, false, true)
    }

    pub fn optional_input(self, name: impl Into<String>) -> Self {
        self.push_input(name, 1, true, false)
    }

    pub fn output(self, name: impl Into<String>) -> Self {
        self.output_with_num(name, 1)
    }

    pub fn output_with_num(mut self, name: impl Into<String>, num: usize) -> Self {
        self.schema.outputs.push(ArgDef {
            name: name.into(),
            num,
            optional: false,
            num_as_min: false,
        });
        self
    }

    pub fn attr(mut self, name: impl Into<String>, kind: AttrKind) -> Self {
        self.schema.attrs.push(AttrDef {
            name: name.into(),
            kind,
            default: None,
        });
        self
    }

    pub fn attr_with_default(mut self, name: impl Into<String>, default: impl Into<AttrValue>) -> Self {
        let default = default.into();
        self.schema.attrs.push(AttrDef {
            name: name.into(),
            kind: default.kind(),
            default: Some(default),
        });
        self
    }

    pub fn set_tensor_desc_infer_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut TensorDescInferContext<'_>) -> Result<(), OpError> + Send + Sync + 'static,
    {
        self.tensor_desc_infer_fn = Some(Arc::new(f));
        self
    }

    pub fn set_batch_axis_infer_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut BatchAxisInferContext<'_>) -> Result<(), OpError> + Send + Sync + 'static,
    {
        self.batch_axis_infer_fn = Some(Arc::new(f));
        self
    }

    pub fn set_get_sbp_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SbpContext<'_>) -> Result<(), OpError> + Send + Sync + 'static,
    {
        self.get_sbp_fn = Some(Arc::new(f));
        self
    }

    pub fn set_input_arg_modify_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut InputArgModifyContext<'_>) -> Result<(), OpError> + Send + Sync + 'static,
    {
        self.input_arg_modify_fn = Some(Arc::new(f));
        self
    }

    pub fn set_grad_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut OpWrapper, &mut GradOpSink) -> Result<(), OpError> + Send + Sync + 'static,
    {
        self.grad_fn = Some(Arc::new(f));
        self
    }

    pub fn finish(self) -> Result<OpRegistration, OpError> {
        let invalid = |reason: String| OpError::InvalidRegistration {
            op_type: self.op_type_name.clone(),
            reason,
        };

        if !is_identifier(&self.op_type_name) {
            return Err(invalid("type name must be an identifier".to_string()));
        }
        let mut arg_names = HashSet::new();
        for def in self.schema.inputs.iter().chain(&self.schema.outputs) {
            if !is_identifier(&def.name) {
                return Err(invalid(format!("argument name `{}` is not an identifier", def.name)));
            }
            if !arg_names.insert(def.name.as_str()) {
                return Err(invalid(format!("argument `{}` is declared twice", def.name)));
            }
            if def.num == 0 {
                return Err(invalid(format!("argument `{}` declares zero tensors", def.name)));
            }
        }
        let mut attr_names = HashSet::new();
        for def in &self.schema.attrs {
            if !is_identifier(&def.name) {
                return Err(invalid(format!("attribute name `{}` is not an identifier", def.name)));
            }
            if !attr_names.insert(def.name.as_str()) {
                return Err(invalid(format!("attribute `{}` is declared twice", def.name)));
            }
        }
        let tensor_desc_infer_fn = self
            .tensor_desc_infer_fn
            .clone()
            .ok_or_else(|| invalid("no tensor desc infer fn".to_string()))?;

        Ok(OpRegistration {
            op_type_name: self.op_type_name,
            schema: self.schema,
            tensor_desc_infer_fn,
            batch_axis_infer_fn: self.batch_axis_infer_fn,
            get_sbp_fn: self.get_sbp_fn,
            input_arg_modify_fn: self.input_arg_modify_fn,
            grad_fn: self.grad_fn,
        })
    }

    fn push_input(mut self, name: impl Into<String>, num: usize, optional: bool, num_as_min: bool) -> Self {
        self.schema.inputs.push(ArgDef {
            name: name.into(),
            num,
            optional,
            num_as_min,
        });
        self
    }
}

/// Registration phase of the registry.
#[derive(Default)]
pub struct OpRegistryBuilder {
    registrations: HashMap<String, OpRegistration>,
}

impl OpRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pre-populated with the operator types shipped with this crate.
    pub fn with_builtins() -> Result<Self, OpError> {
        let mut builder = Self::new();
        crate::ops::register_builtins(&mut builder)?;
        Ok(builder)
    }

    pub fn register(&mut self, registration: OpRegistration) -> Result<(), OpError> {
        if self.registrations.contains_key(&registration.op_type_name) {
            return Err(OpError::DuplicateOpType {
                op_type: registration.op_type_name,
            });
        }
        debug!(op_type = %registration.op_type_name, "registered op type");
        self.registrations
            .insert(registration.op_type_name.clone(), registration);
        Ok(())
    }

    pub fn seal(self) -> OpRegistry {
        OpRegistry {
            registrations: self.registrations,
        }
    }
}

/// Sealed, read-only registry.
#[derive(Debug)]
pub struct OpRegistry {
    registrations: HashMap<String, OpRegistration>,
}

impl OpRegistry {
    pub fn get(&self, op_type_name: &str) -> Result<&OpRegistration, OpError> {
        self.registrations
            .get(op_type_name)
            .ok_or_else(|| OpError::OpTypeNotFound {
                op_type: op_type_name.to_string(),
            })
    }

    pub fn contains(&self, op_type_name: &str) -> bool {
        self.registrations.contains_key(op_type_name)
    }

    pub fn op_type_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.registrations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

static GLOBAL_REGISTRY: OnceLock<OpRegistry> = OnceLock::new();

/// Installs the process-wide registry. Only the first call succeeds.
pub fn install_global(registry: OpRegistry) -> Result<&'static OpRegistry, OpError> {
    let mut installed = false;
    let global = GLOBAL_REGISTRY.get_or_init(|| {
        installed = true;
        registry
    });
    if installed {
        Ok(global)
    } else {
        Err(OpError::RegistryAlreadyInstalled)
    }
}

pub fn global() -> Result<&'static OpRegistry, OpError> {
    GLOBAL_REGISTRY.get().ok_or(OpError::RegistryNotInstalled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn identity(name: &str) -> OpRegistrationBuilder {
        OpRegistrationBuilder::new(name)
            .input("in")
            .output("out")
            .set_tensor_desc_infer_fn(|ctx| {
                let desc = ctx.input_tensor_desc("in", 0)?.clone();
                *ctx.output_tensor_desc_mut("out", 0)? = desc;
                Ok(())
            })
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut builder = OpRegistryBuilder::new();
        builder.register(identity("identity").finish().unwrap()).unwrap();
        let err = builder
            .register(identity("identity").finish().unwrap())
            .unwrap_err();
        assert!(matches!(err, OpError::DuplicateOpType { .. }));
        assert_eq!(err.kind(), ErrorKind::Registration);
    }

    #[test]
    fn sealed_registry_looks_up_by_name() {
        let mut builder = OpRegistryBuilder::new();
        builder.register(identity("b_op").finish().unwrap()).unwrap();
        builder.register(identity("a_op").finish().unwrap()).unwrap();
        let registry = builder.seal();
        assert_eq!(registry.op_type_names(), vec!["a_op", "b_op"]);
        assert!(registry.get("a_op").is_ok());
        assert_eq!(
            registry.get("missing").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn registration_requires_tensor_desc_fn() {
        let err = OpRegistrationBuilder::new("bare")
            .input("in")
            .finish()
            .unwrap_err();
        assert!(matches!(err, OpError::InvalidRegistration { .. }));
    }

    #[test]
    fn registration_rejects_bad_names() {
        assert!(identity("has space").finish().is_err());
        assert!(identity("ok").input("in").finish().is_err());
        assert!(identity("ok").attr("1bad", AttrKind::Int32).finish().is_err());
        assert!(identity("ok").input_with_num("empty", 0).finish().is_err());
    }

    #[test]
    fn arg_def_counts() {
        let exact = ArgDef {
            name: "x".into(),
            num: 2,
            optional: false,
            num_as_min: false,
        };
        assert!(exact.accepts(2));
        assert!(!exact.accepts(3));
        let at_least = ArgDef {
            num_as_min: true,
            ..exact.clone()
        };
        assert!(at_least.accepts(5));
        assert!(!at_least.accepts(1));
        let optional = ArgDef {
            optional: true,
            ..exact
        };
        assert!(optional.accepts(0));
        assert_eq!(optional.describe_count(), "0 or 2");
    }

    #[test]
    fn builtins_are_registered() {
        let registry = OpRegistryBuilder::with_builtins().unwrap().seal();
        for name in ["add_n", "broadcast_like", "reduce_sum_like"] {
            assert!(registry.contains(name), "{name} missing");
        }
    }

    #[test]
    fn global_registry_installs_once() {
        let registry = OpRegistryBuilder::with_builtins().unwrap().seal();
        let installed = install_global(registry).unwrap();
        assert!(installed.contains("reduce_sum_like"));
        assert!(global().unwrap().contains("reduce_sum_like"));
        let again = OpRegistryBuilder::new().seal();
        assert!(matches!(
            install_global(again),
            Err(OpError::RegistryAlreadyInstalled)
        ));
    }
}
