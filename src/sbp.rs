//! Parallelization signatures.
//!
//! A signature assigns every argument slot of an operator one
//! [`SbpParallel`] mode. Operator types register the legal signatures for
//! an instance through [`SbpSignatureBuilder`]; the scheduler later picks
//! one of them.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::conf::OpArg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SbpParallel {
    /// Partitioned along one axis.
    Split { axis: usize },
    /// Full copy on every device.
    Broadcast,
    /// Every device holds a partial result to be summed.
    PartialSum,
}

impl std::fmt::Display for SbpParallel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SbpParallel::Split { axis } => write!(f, "S({})", axis),
            SbpParallel::Broadcast => f.write_str("B"),
            SbpParallel::PartialSum => f.write_str("P"),
        }
    }
}

/// Mode per argument slot, keyed by blob name (`x_0`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SbpSignature {
    bn2sbp: BTreeMap<String, SbpParallel>,
}

impl SbpSignature {
    pub fn get(&self, arg: &OpArg) -> Option<SbpParallel> {
        self.get_bn(&arg.bn())
    }

    pub fn get_bn(&self, bn: &str) -> Option<SbpParallel> {
        self.bn2sbp.get(bn).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, SbpParallel)> {
        self.bn2sbp.iter().map(|(bn, sbp)| (bn.as_str(), *sbp))
    }

    pub fn len(&self) -> usize {
        self.bn2sbp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bn2sbp.is_empty()
    }

    fn set(&mut self, arg: &OpArg, sbp: SbpParallel) {
        self.bn2sbp.insert(arg.bn(), sbp);
    }
}

impl std::fmt::Display for SbpSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (idx, (bn, sbp)) in self.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", bn, sbp)?;
        }
        f.write_str("}")
    }
}

/// Candidate signatures of one operator instance, in registration order.
/// Registering a signature structurally equal to an existing one is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<SbpSignature>", into = "Vec<SbpSignature>")]
pub struct SbpSignatureList {
    signatures: Vec<SbpSignature>,
    seen: HashSet<SbpSignature>,
}

impl SbpSignatureList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the signature was not already present.
    pub fn push(&mut self, signature: SbpSignature) -> bool {
        if self.seen.contains(&signature) {
            return false;
        }
        self.seen.insert(signature.clone());
        self.signatures.push(signature);
        true
    }

    pub fn contains(&self, signature: &SbpSignature) -> bool {
        self.seen.contains(signature)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SbpSignature> {
        self.signatures.iter()
    }

    pub fn as_slice(&self) -> &[SbpSignature] {
        &self.signatures
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

impl From<Vec<SbpSignature>> for SbpSignatureList {
    fn from(signatures: Vec<SbpSignature>) -> Self {
        let mut list = SbpSignatureList::new();
        for signature in signatures {
            list.push(signature);
        }
        list
    }
}

impl From<SbpSignatureList> for Vec<SbpSignature> {
    fn from(list: SbpSignatureList) -> Self {
        list.signatures
    }
}

impl<'a> IntoIterator for &'a SbpSignatureList {
    type Item = &'a SbpSignature;
    type IntoIter = std::slice::Iter<'a, SbpSignature>;

    fn into_iter(self) -> Self::IntoIter {
        self.signatures.iter()
    }
}

/// One slot or a group of slots that receive the same mode.
pub trait ArgSet {
    fn for_each_arg(&self, f: &mut dyn FnMut(&OpArg));
}

impl ArgSet for OpArg {
    fn for_each_arg(&self, f: &mut dyn FnMut(&OpArg)) {
        f(self)
    }
}

impl ArgSet for [OpArg] {
    fn for_each_arg(&self, f: &mut dyn FnMut(&OpArg)) {
        self.iter().for_each(f)
    }
}

impl ArgSet for Vec<OpArg> {
    fn for_each_arg(&self, f: &mut dyn FnMut(&OpArg)) {
        self.iter().for_each(f)
    }
}

impl<T: ArgSet + ?Sized> ArgSet for &T {
    fn for_each_arg(&self, f: &mut dyn FnMut(&OpArg)) {
        (**self).for_each_arg(f)
    }
}

/// Accumulates one candidate signature and commits it with [`build`].
///
/// Assigning a slot twice keeps the last mode.
///
/// [`build`]: SbpSignatureBuilder::build
#[must_use = "a signature is only registered once `build` is called"]
pub struct SbpSignatureBuilder<'a> {
    list: &'a mut SbpSignatureList,
    signature: SbpSignature,
}

impl<'a> SbpSignatureBuilder<'a> {
    pub fn new(list: &'a mut SbpSignatureList) -> Self {
        Self {
            list,
            signature: SbpSignature::default(),
        }
    }

    pub fn split(self, args: impl ArgSet, axis: usize) -> Self {
        self.assign(args, SbpParallel::Split { axis })
    }

    pub fn broadcast(self, args: impl ArgSet) -> Self {
        self.assign(args, SbpParallel::Broadcast)
    }

    pub fn partial_sum(self, args: impl ArgSet) -> Self {
        self.assign(args, SbpParallel::PartialSum)
    }

    /// Commits the signature; a duplicate of an existing one collapses into it.
    pub fn build(self) {
        self.list.push(self.signature);
    }

    fn assign(mut self, args: impl ArgSet, sbp: SbpParallel) -> Self {
        args.for_each_arg(&mut |arg| self.signature.set(arg, sbp));
        self
    }
}

/// Normalizes possibly negative reduction axes against `num_axes`. Axes that
/// stay out of range after normalization are dropped.
pub fn normalize_axes(axes: &[i32], num_axes: usize) -> HashSet<usize> {
    axes.iter()
        .filter_map(|&axis| {
            let axis = if axis < 0 {
                axis as i64 + num_axes as i64
            } else {
                axis as i64
            };
            (0..num_axes as i64).contains(&axis).then_some(axis as usize)
        })
        .collect()
}

/// Predicate telling whether axis `i` of a rank-`num_axes` tensor is one of
/// the configured reduction axes.
pub fn reduced_axis_predicate(axes: &[i32], num_axes: usize) -> impl Fn(usize) -> bool + use<> {
    let reduced = normalize_axes(axes, num_axes);
    move |axis| reduced.contains(&axis)
}
