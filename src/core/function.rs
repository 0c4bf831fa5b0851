//! The function model: an abstract [`Function`] refines into one
//! [`StagedFunction`] per compile stage, and each staged function holds
//! an ordered list of [`SpecializedFunction`] implementations.
//!
//! Redefinition never erases: the old entry is flagged invalidated and
//! stays addressable so that its backedges identify exactly the call
//! sites that need recompilation.

use crate::core::arena::{entity_id, IdMap};
use crate::core::intern::GlobalSymbol;
use crate::core::ir::{RegionId, StmtId};
use crate::core::signature::Signature;
use crate::core::stage::CompileStage;
use alloc::vec::Vec;
use std::collections::BTreeSet;
use std::fmt;

entity_id! {
    /// A pipeline-level function token.
    pub struct FuncId
}

entity_id! {
    /// A staged-function token, relative to one stage's storage.
    pub struct StagedFuncId
}

entity_id! {
    /// A specialized-function token, relative to one stage's storage.
    pub struct SpecFuncId
}

/// An inbound call site: the statement (in the caller's stage) whose
/// definition resolves to the callee this edge is recorded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Backedge {
    pub stage: CompileStage,
    pub stmt: StmtId,
}

impl fmt::Display for Backedge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{:?}", self.stage, self.stmt)
    }
}

/// A named abstract callable: one conceptual operation viewed through a
/// different type system at each compile stage.
///
/// All staged entries must agree on the conceptual arity; a same-name
/// staged function with a different shape is rejected rather than
/// treated as multiple dispatch.
#[derive(Debug)]
pub struct Function {
    name: GlobalSymbol,
    staged: Vec<(CompileStage, StagedFuncId)>,
    arity: Option<usize>,
}

impl Function {
    pub(crate) fn new(name: GlobalSymbol) -> Function {
        Function {
            name,
            staged: Vec::new(),
            arity: None,
        }
    }

    pub fn get_name(&self) -> GlobalSymbol {
        self.name
    }

    /// Staged entries in insertion order.
    pub fn get_staged(&self) -> &[(CompileStage, StagedFuncId)] {
        &self.staged
    }

    pub fn staged_at(&self, stage: CompileStage) -> Option<StagedFuncId> {
        self.staged
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, f)| *f)
    }

    pub fn conceptual_arity(&self) -> Option<usize> {
        self.arity
    }

    pub(crate) fn attach(&mut self, stage: CompileStage, staged: StagedFuncId, arity: usize) {
        self.staged.push((stage, staged));
        self.arity.get_or_insert(arity);
    }

    pub(crate) fn reattach(&mut self, stage: CompileStage, staged: StagedFuncId) {
        for entry in self.staged.iter_mut() {
            if entry.0 == stage {
                entry.1 = staged;
                return;
            }
        }
        self.staged.push((stage, staged));
    }

    pub(crate) fn remap_staged(&mut self, stage: CompileStage, map: &IdMap<StagedFuncId>) {
        for entry in self.staged.iter_mut() {
            if entry.0 == stage {
                if let Some(new) = map.remap(entry.1) {
                    entry.1 = new;
                }
            }
        }
    }
}

/// One compile-stage view of a [`Function`]. Zero specializations means
/// the staged function is extern: signature only.
#[derive(Debug)]
pub struct StagedFunction<T> {
    function: FuncId,
    name: GlobalSymbol,
    sig: Signature<T>,
    specializations: Vec<SpecFuncId>,
    backedges: BTreeSet<Backedge>,
    invalidated: bool,
}

impl<T> StagedFunction<T> {
    pub(crate) fn new(function: FuncId, name: GlobalSymbol, sig: Signature<T>) -> StagedFunction<T> {
        StagedFunction {
            function,
            name,
            sig,
            specializations: Vec::new(),
            backedges: BTreeSet::new(),
            invalidated: false,
        }
    }

    pub fn get_function(&self) -> FuncId {
        self.function
    }

    pub fn get_name(&self) -> GlobalSymbol {
        self.name
    }

    pub fn get_signature(&self) -> &Signature<T> {
        &self.sig
    }

    /// Specialization handles in attachment order.
    pub fn get_specializations(&self) -> &[SpecFuncId] {
        &self.specializations
    }

    pub fn get_backedges(&self) -> &BTreeSet<Backedge> {
        &self.backedges
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn is_extern(&self) -> bool {
        self.specializations.is_empty()
    }

    pub(crate) fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub(crate) fn push_specialization(&mut self, spec: SpecFuncId) {
        self.specializations.push(spec);
    }

    pub(crate) fn backedges_mut(&mut self) -> &mut BTreeSet<Backedge> {
        &mut self.backedges
    }

    pub(crate) fn specializations_mut(&mut self) -> &mut Vec<SpecFuncId> {
        &mut self.specializations
    }
}

/// One concrete implementation of a staged function: a signature accepted
/// by the parent under the configured semantics, and a body region.
#[derive(Debug)]
pub struct SpecializedFunction<T> {
    staged: StagedFuncId,
    name: GlobalSymbol,
    sig: Signature<T>,
    body: RegionId,
    backedges: BTreeSet<Backedge>,
    invalidated: bool,
}

impl<T> SpecializedFunction<T> {
    pub(crate) fn new(
        staged: StagedFuncId,
        name: GlobalSymbol,
        sig: Signature<T>,
        body: RegionId,
    ) -> SpecializedFunction<T> {
        SpecializedFunction {
            staged,
            name,
            sig,
            body,
            backedges: BTreeSet::new(),
            invalidated: false,
        }
    }

    pub fn get_staged(&self) -> StagedFuncId {
        self.staged
    }

    pub fn get_name(&self) -> GlobalSymbol {
        self.name
    }

    pub fn get_signature(&self) -> &Signature<T> {
        &self.sig
    }

    pub fn get_body(&self) -> RegionId {
        self.body
    }

    pub fn get_backedges(&self) -> &BTreeSet<Backedge> {
        &self.backedges
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub(crate) fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub(crate) fn backedges_mut(&mut self) -> &mut BTreeSet<Backedge> {
        &mut self.backedges
    }

    pub(crate) fn set_body(&mut self, body: RegionId) {
        self.body = body;
    }
}

/// A staged-signature conflict, returned as data so the caller can opt
/// into [`redefine_staged_function`](crate::StageInfo::redefine_staged_function)
/// or abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedConflict<T> {
    pub name: GlobalSymbol,
    pub stage: CompileStage,
    pub existing: StagedFuncId,
    pub old: Signature<T>,
    pub new: Signature<T>,
}

/// A duplicate-specialization conflict, carrying the new signature and
/// body so [`redefine_specialization`](crate::StageInfo::redefine_specialization)
/// can attach them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecializeConflict<T> {
    pub name: GlobalSymbol,
    pub stage: CompileStage,
    pub staged: StagedFuncId,
    pub existing: SpecFuncId,
    pub sig: Signature<T>,
    pub body: RegionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionError<T> {
    Staged(StagedConflict<T>),
    Specialize(SpecializeConflict<T>),
    /// A staged entry disagrees with the function's conceptual arity.
    ArityMismatch { expected: usize, found: usize },
    /// The specialization signature is not accepted by its parent staged
    /// signature under the requested semantics.
    NotAccepted,
    UnknownSymbol(GlobalSymbol),
    UnknownFunction(StagedFuncId),
}

impl<T: fmt::Debug> fmt::Display for FunctionError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FunctionError::Staged(c) => write!(
                f,
                "staged signature conflict at {}: {:?} vs {:?}",
                c.stage, c.old, c.new
            ),
            FunctionError::Specialize(c) => write!(
                f,
                "duplicate specialization at {}: {:?}",
                c.stage, c.sig
            ),
            FunctionError::ArityMismatch { expected, found } => write!(
                f,
                "staged entry arity {} disagrees with conceptual arity {}",
                found, expected
            ),
            FunctionError::NotAccepted => {
                write!(f, "specialization not accepted by the staged signature")
            }
            FunctionError::UnknownSymbol(s) => write!(f, "unknown function symbol {:?}", s),
            FunctionError::UnknownFunction(s) => write!(f, "unknown staged function {:?}", s),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for FunctionError<T> {}
