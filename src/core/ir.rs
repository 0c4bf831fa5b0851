/*!

  The structural IR: SSA values with use lists, statements linked
  intrusively into blocks, blocks linked intrusively into regions.

  This IR uses parametrized basic blocks (in contrast to phi nodes).
  Cyclic structure (use-def edges, sibling links, the region tree) is
  expressed as index tokens into the owning stage's arenas; ownership is
  singular and every other reference is a by-index back-reference checked
  at dereference.

  For background on SSA-based IRs:
  https://en.wikipedia.org/wiki/Static_single_assignment_form

*/

use crate::core::arena::{entity_id, ArenaError};
use alloc::vec::Vec;
use std::collections::BTreeSet;
use std::fmt;

entity_id! {
    /// An SSA value token.
    pub struct Var
}

entity_id! {
    /// A statement token.
    pub struct StmtId
}

entity_id! {
    /// A block token.
    pub struct BlockId
}

entity_id! {
    /// A region token.
    pub struct RegionId
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IRError {
    Arena(ArenaError),
    ArityMismatch { expected: usize, found: usize },
    /// A detached statement was used where an attached one is required,
    /// or an attached one where a detached one is required.
    OrphanStatement(StmtId),
    /// A block's terminator discipline is broken: appending past a
    /// terminator, a terminator before the tail, or no terminator at all.
    InvalidTerminator(BlockId),
    /// A terminator names a successor outside its own region.
    CrossRegionSuccessor { stmt: StmtId, successor: BlockId },
    /// A name was not found in the relevant symbol table.
    UnknownSymbol(String),
    /// A region handed to statement construction already has an owner.
    RegionInUse(RegionId),
    /// A use list disagrees with the operand list it mirrors.
    InconsistentUseList { stmt: StmtId, index: usize },
    /// A block with no successor edge from the region entry.
    UnreachableBlock(BlockId),
    /// A region that needs an entry block but has none.
    EmptyRegion(RegionId),
    /// A stage tag with no storage registered in the pipeline.
    UnknownStage(u32),
}

impl From<ArenaError> for IRError {
    fn from(e: ArenaError) -> IRError {
        IRError::Arena(e)
    }
}

impl fmt::Display for IRError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IRError::Arena(e) => write!(f, "{}", e),
            IRError::ArityMismatch { expected, found } => {
                write!(f, "arity mismatch: expected {}, found {}", expected, found)
            }
            IRError::OrphanStatement(s) => write!(f, "statement {:?} is detached", s),
            IRError::InvalidTerminator(b) => {
                write!(f, "block {:?} breaks the terminator discipline", b)
            }
            IRError::CrossRegionSuccessor { stmt, successor } => write!(
                f,
                "statement {:?} names successor {:?} outside its region",
                stmt, successor
            ),
            IRError::UnknownSymbol(name) => write!(f, "unknown symbol `{}`", name),
            IRError::RegionInUse(r) => write!(f, "region {:?} already has an owner", r),
            IRError::InconsistentUseList { stmt, index } => write!(
                f,
                "use list out of sync with operand {} of statement {:?}",
                index, stmt
            ),
            IRError::UnreachableBlock(b) => {
                write!(f, "block {:?} is unreachable from the region entry", b)
            }
            IRError::EmptyRegion(r) => write!(f, "region {:?} has no entry block", r),
            IRError::UnknownStage(s) => write!(f, "no storage registered for stage {}", s),
        }
    }
}

impl std::error::Error for IRError {}

/// Where an SSA value is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    BlockArgument { block: BlockId, index: usize },
    StatementResult { stmt: StmtId, index: usize },
}

/// One consumer of an SSA value: operand `index` of `stmt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Use {
    pub stmt: StmtId,
    pub index: usize,
}

/// An SSA value: its definition site, its type attribute, and the set of
/// operand slots consuming it.
///
/// Invariant: every `Use { stmt, index }` in the list is mirrored by
/// `stmt`'s operand list — `replace_all_uses_with` updates both sides
/// atomically.
#[derive(Debug)]
pub struct SSAValue<T> {
    kind: ValueKind,
    ty: T,
    uses: BTreeSet<Use>,
}

impl<T> SSAValue<T> {
    pub(crate) fn new(kind: ValueKind, ty: T) -> SSAValue<T> {
        SSAValue {
            kind,
            ty,
            uses: BTreeSet::new(),
        }
    }

    pub fn get_kind(&self) -> ValueKind {
        self.kind
    }

    pub fn get_type(&self) -> &T {
        &self.ty
    }

    pub fn get_uses(&self) -> &BTreeSet<Use> {
        &self.uses
    }

    pub(crate) fn set_kind(&mut self, kind: ValueKind) {
        self.kind = kind;
    }

    pub(crate) fn uses_mut(&mut self) -> &mut BTreeSet<Use> {
        &mut self.uses
    }
}

/// A statement: ordered operands, results, successor blocks and owned
/// regions, an intrusive position in its block, and the dialect payload
/// that defines its semantics.
#[derive(Debug)]
pub struct Statement<L> {
    parent: Option<BlockId>,
    prev: Option<StmtId>,
    next: Option<StmtId>,
    operands: Vec<Var>,
    results: Vec<Var>,
    successors: Vec<BlockId>,
    regions: Vec<RegionId>,
    def: L,
}

impl<L> Statement<L> {
    pub(crate) fn new(
        def: L,
        operands: Vec<Var>,
        successors: Vec<BlockId>,
        regions: Vec<RegionId>,
    ) -> Statement<L> {
        Statement {
            parent: None,
            prev: None,
            next: None,
            operands,
            results: Vec::new(),
            successors,
            regions,
            def,
        }
    }

    pub fn get_parent(&self) -> Option<BlockId> {
        self.parent
    }

    pub fn get_prev(&self) -> Option<StmtId> {
        self.prev
    }

    pub fn get_next(&self) -> Option<StmtId> {
        self.next
    }

    pub fn get_operands(&self) -> &[Var] {
        &self.operands
    }

    pub fn get_results(&self) -> &[Var] {
        &self.results
    }

    pub fn get_successors(&self) -> &[BlockId] {
        &self.successors
    }

    pub fn get_regions(&self) -> &[RegionId] {
        &self.regions
    }

    pub fn def(&self) -> &L {
        &self.def
    }

    pub(crate) fn set_parent(&mut self, parent: Option<BlockId>) {
        self.parent = parent;
    }

    pub(crate) fn set_prev(&mut self, prev: Option<StmtId>) {
        self.prev = prev;
    }

    pub(crate) fn set_next(&mut self, next: Option<StmtId>) {
        self.next = next;
    }

    pub(crate) fn set_operand(&mut self, index: usize, v: Var) {
        self.operands[index] = v;
    }

    pub(crate) fn set_results(&mut self, results: Vec<Var>) {
        self.results = results;
    }

    pub(crate) fn operands_mut(&mut self) -> &mut Vec<Var> {
        &mut self.operands
    }

    pub(crate) fn results_mut(&mut self) -> &mut Vec<Var> {
        &mut self.results
    }

    pub(crate) fn successors_mut(&mut self) -> &mut Vec<BlockId> {
        &mut self.successors
    }

    pub(crate) fn regions_mut(&mut self) -> &mut Vec<RegionId> {
        &mut self.regions
    }
}

/// A basic block: ordered arguments and an intrusive statement list.
///
/// Invariant: a well-formed block ends with exactly one terminator, and
/// no other statement in it is a terminator.
#[derive(Debug, Default)]
pub struct Block {
    parent: Option<RegionId>,
    prev: Option<BlockId>,
    next: Option<BlockId>,
    args: Vec<Var>,
    first: Option<StmtId>,
    last: Option<StmtId>,
}

impl Block {
    pub fn get_parent(&self) -> Option<RegionId> {
        self.parent
    }

    pub fn get_prev(&self) -> Option<BlockId> {
        self.prev
    }

    pub fn get_next(&self) -> Option<BlockId> {
        self.next
    }

    pub fn get_args(&self) -> &[Var] {
        &self.args
    }

    pub fn get_first(&self) -> Option<StmtId> {
        self.first
    }

    pub fn get_last(&self) -> Option<StmtId> {
        self.last
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub(crate) fn set_parent(&mut self, parent: Option<RegionId>) {
        self.parent = parent;
    }

    pub(crate) fn set_prev(&mut self, prev: Option<BlockId>) {
        self.prev = prev;
    }

    pub(crate) fn set_next(&mut self, next: Option<BlockId>) {
        self.next = next;
    }

    pub(crate) fn set_first(&mut self, first: Option<StmtId>) {
        self.first = first;
    }

    pub(crate) fn set_last(&mut self, last: Option<StmtId>) {
        self.last = last;
    }

    pub(crate) fn args_mut(&mut self) -> &mut Vec<Var> {
        &mut self.args
    }
}

/// A region: an intrusive list of blocks scoped under an owning
/// statement, or top-level when it is a function body. The first block
/// is the entry.
#[derive(Debug, Default)]
pub struct Region {
    owner: Option<StmtId>,
    first: Option<BlockId>,
    last: Option<BlockId>,
}

impl Region {
    pub fn get_owner(&self) -> Option<StmtId> {
        self.owner
    }

    pub fn get_entry(&self) -> Option<BlockId> {
        self.first
    }

    pub fn get_last(&self) -> Option<BlockId> {
        self.last
    }

    pub(crate) fn set_owner(&mut self, owner: Option<StmtId>) {
        self.owner = owner;
    }

    pub(crate) fn set_first(&mut self, first: Option<BlockId>) {
        self.first = first;
    }

    pub(crate) fn set_last(&mut self, last: Option<BlockId>) {
        self.last = last;
    }
}
