//! Per-stage storage and the structural operations over it.
//!
//! A [`StageInfo`] owns every arena for the IR one compile stage hosts:
//! SSA values, statements, blocks, regions, staged and specialized
//! functions, and the stage-local symbol table. Every token handed out by
//! a stage is relative to exactly that stage's storage.

use crate::core::arena::{Arena, ArenaError, EntityId, IdMap};
use crate::core::dialect::Dialect;
use crate::core::function::{
    Backedge, FuncId, Function, FunctionError, SpecFuncId, SpecializeConflict, SpecializedFunction,
    StagedConflict, StagedFuncId, StagedFunction,
};
use crate::core::intern::{GlobalSymbol, InternTable, Symbol};
use crate::core::ir::{
    Block, BlockId, IRError, Region, RegionId, SSAValue, Statement, StmtId, Use, ValueKind, Var,
};
use crate::core::pipeline::StorageCounts;
use crate::core::signature::{reduce_candidates, DispatchError, Signature, SignatureSemantics};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// An opaque handle naming one compile stage. The pretty symbol lives on
/// the stage's storage; the handle itself is just an index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CompileStage(u32);

impl CompileStage {
    pub(crate) fn new(raw: u32) -> CompileStage {
        CompileStage(raw)
    }

    pub fn get_id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for CompileStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "stage<{}>", self.0)
    }
}

/// Control for [`StageInfo::walk`]: keep descending, skip the statement's
/// nested regions, or stop the whole traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkFlow {
    Advance,
    SkipNested,
    Halt,
}

/// The remappings produced by [`StageInfo::compact`]. The stage rewrites
/// its own cross-references; the pipeline applies these maps to
/// everything that points into the stage from outside (function tables,
/// backedges recorded on other stages).
#[derive(Debug)]
pub struct CompactionMaps {
    pub values: IdMap<Var>,
    pub stmts: IdMap<StmtId>,
    pub blocks: IdMap<BlockId>,
    pub regions: IdMap<RegionId>,
    pub staged: IdMap<StagedFuncId>,
    pub specialized: IdMap<SpecFuncId>,
}

fn remap<I: EntityId>(map: &IdMap<I>, old: I) -> Result<I, IRError> {
    map.remap(old)
        .ok_or(IRError::Arena(ArenaError::Deleted(old.as_raw())))
}

fn remap_opt<I: EntityId>(map: &IdMap<I>, old: Option<I>) -> Result<Option<I>, IRError> {
    old.map(|v| remap(map, v)).transpose()
}

/// Storage and structural operations for one compile stage.
#[derive(Debug)]
pub struct StageInfo<L: Dialect> {
    stage: CompileStage,
    name: String,
    symbols: InternTable<String, Symbol>,
    values: Arena<Var, SSAValue<L::Type>>,
    stmts: Arena<StmtId, Statement<L>>,
    blocks: Arena<BlockId, Block>,
    regions: Arena<RegionId, Region>,
    staged: Arena<StagedFuncId, StagedFunction<L::Type>>,
    specialized: Arena<SpecFuncId, SpecializedFunction<L::Type>>,
    staged_by_name: HashMap<GlobalSymbol, StagedFuncId>,
}

impl<L: Dialect> StageInfo<L> {
    pub(crate) fn new(stage: CompileStage, name: &str) -> StageInfo<L> {
        StageInfo {
            stage,
            name: name.to_string(),
            symbols: InternTable::new(),
            values: Arena::new(),
            stmts: Arena::new(),
            blocks: Arena::new(),
            regions: Arena::new(),
            staged: Arena::new(),
            specialized: Arena::new(),
            staged_by_name: HashMap::new(),
        }
    }

    pub fn get_stage(&self) -> CompileStage {
        self.stage
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn intern_symbol(&mut self, name: &str) -> Symbol {
        self.symbols.intern(name.to_string())
    }

    pub fn lookup_symbol(&self, sym: Symbol) -> Result<&str, IRError> {
        Ok(self.symbols.lookup(sym)?.as_str())
    }

    pub fn resolve_symbol(&self, name: &str) -> Option<Symbol> {
        self.symbols.resolve(&name.to_string())
    }

    /// Like [`resolve_symbol`](Self::resolve_symbol), for callers (e.g.
    /// parsers resolving labels) that treat a missing name as an error.
    pub fn require_symbol(&self, name: &str) -> Result<Symbol, IRError> {
        self.resolve_symbol(name)
            .ok_or_else(|| IRError::UnknownSymbol(name.to_string()))
    }

    /////
    ///// Accessors.
    /////

    pub fn get_value(&self, v: Var) -> Result<&SSAValue<L::Type>, IRError> {
        Ok(self.values.get(v)?)
    }

    pub fn get_statement(&self, s: StmtId) -> Result<&Statement<L>, IRError> {
        Ok(self.stmts.get(s)?)
    }

    pub fn get_block(&self, b: BlockId) -> Result<&Block, IRError> {
        Ok(self.blocks.get(b)?)
    }

    pub fn get_region(&self, r: RegionId) -> Result<&Region, IRError> {
        Ok(self.regions.get(r)?)
    }

    pub fn get_staged(&self, f: StagedFuncId) -> Result<&StagedFunction<L::Type>, IRError> {
        Ok(self.staged.get(f)?)
    }

    pub fn get_specialized(&self, f: SpecFuncId) -> Result<&SpecializedFunction<L::Type>, IRError> {
        Ok(self.specialized.get(f)?)
    }

    pub fn is_live_stmt(&self, s: StmtId) -> bool {
        self.stmts.is_live(s)
    }

    /// The live staged function currently registered under `name`.
    pub fn resolve_staged(&self, name: GlobalSymbol) -> Option<StagedFuncId> {
        self.staged_by_name.get(&name).copied()
    }

    pub fn block_args(&self, b: BlockId) -> Result<&[Var], IRError> {
        Ok(self.blocks.get(b)?.get_args())
    }

    pub fn first_stmt(&self, b: BlockId) -> Result<Option<StmtId>, IRError> {
        Ok(self.blocks.get(b)?.get_first())
    }

    pub fn next_stmt(&self, s: StmtId) -> Result<Option<StmtId>, IRError> {
        Ok(self.stmts.get(s)?.get_next())
    }

    pub fn stmt_is_terminator(&self, s: StmtId) -> Result<bool, IRError> {
        Ok(self.stmts.get(s)?.def().is_terminator())
    }

    /// The entry block of a specialization's body region.
    pub fn specialized_entry(&self, f: SpecFuncId) -> Result<BlockId, IRError> {
        let body = self.specialized.get(f)?.get_body();
        self.regions
            .get(body)?
            .get_entry()
            .ok_or(IRError::EmptyRegion(body))
    }

    pub fn live_counts(&self) -> StorageCounts {
        StorageCounts {
            values: self.values.live_len(),
            stmts: self.stmts.live_len(),
            blocks: self.blocks.live_len(),
            regions: self.regions.live_len(),
            staged: self.staged.live_len(),
            specialized: self.specialized.live_len(),
        }
    }

    /////
    ///// Construction.
    /////

    pub fn create_region(&mut self) -> RegionId {
        self.regions.alloc(Region::default())
    }

    /// Append a fresh block at the tail of `region` and return it.
    pub fn append_block(&mut self, region: RegionId) -> Result<BlockId, IRError> {
        self.regions.get(region)?;
        let block = self.blocks.alloc(Block::default());
        let reg = self.regions.get_mut(region)?;
        let old_last = reg.get_last();
        reg.set_last(Some(block));
        if reg.get_entry().is_none() {
            reg.set_first(Some(block));
        }
        let b = self.blocks.get_mut(block)?;
        b.set_parent(Some(region));
        b.set_prev(old_last);
        if let Some(prev) = old_last {
            self.blocks.get_mut(prev)?.set_next(Some(block));
        }
        Ok(block)
    }

    /// Unlink `block` from its region without deleting it.
    pub fn remove_block(&mut self, block: BlockId) -> Result<(), IRError> {
        let (parent, prev, next) = {
            let b = self.blocks.get(block)?;
            (b.get_parent(), b.get_prev(), b.get_next())
        };
        match prev {
            Some(p) => self.blocks.get_mut(p)?.set_next(next),
            None => {
                if let Some(r) = parent {
                    self.regions.get_mut(r)?.set_first(next);
                }
            }
        }
        match next {
            Some(n) => self.blocks.get_mut(n)?.set_prev(prev),
            None => {
                if let Some(r) = parent {
                    self.regions.get_mut(r)?.set_last(prev);
                }
            }
        }
        let b = self.blocks.get_mut(block)?;
        b.set_parent(None);
        b.set_prev(None);
        b.set_next(None);
        Ok(())
    }

    /// Append a block argument of type `ty` and return its SSA value.
    pub fn push_block_arg(&mut self, block: BlockId, ty: L::Type) -> Result<Var, IRError> {
        let index = self.blocks.get(block)?.get_args().len();
        let v = self
            .values
            .alloc(SSAValue::new(ValueKind::BlockArgument { block, index }, ty));
        self.blocks.get_mut(block)?.args_mut().push(v);
        Ok(v)
    }

    /// Create a detached statement. Result SSA values are allocated from
    /// `result_types`, operand uses are registered, and each handed-over
    /// region gets this statement as its owner.
    pub fn create_stmt(
        &mut self,
        def: L,
        operands: Vec<Var>,
        result_types: Vec<L::Type>,
        successors: Vec<BlockId>,
        regions: Vec<RegionId>,
    ) -> Result<StmtId, IRError> {
        for op in &operands {
            self.values.get(*op)?;
        }
        for b in &successors {
            self.blocks.get(*b)?;
        }
        for r in &regions {
            if self.regions.get(*r)?.get_owner().is_some() {
                return Err(IRError::RegionInUse(*r));
            }
        }
        let stmt = self
            .stmts
            .alloc(Statement::new(def, operands.clone(), successors, regions.clone()));
        for r in regions {
            self.regions.get_mut(r)?.set_owner(Some(stmt));
        }
        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| {
                self.values
                    .alloc(SSAValue::new(ValueKind::StatementResult { stmt, index }, ty))
            })
            .collect::<Vec<_>>();
        self.stmts.get_mut(stmt)?.set_results(results);
        for (index, op) in operands.into_iter().enumerate() {
            self.values
                .get_mut(op)?
                .uses_mut()
                .insert(Use { stmt, index });
        }
        Ok(stmt)
    }

    /// Append a detached statement at the tail of `block`. Appending past
    /// a terminator is rejected.
    pub fn append_stmt(&mut self, block: BlockId, stmt: StmtId) -> Result<(), IRError> {
        if self.stmts.get(stmt)?.get_parent().is_some() {
            return Err(IRError::OrphanStatement(stmt));
        }
        let old_last = self.blocks.get(block)?.get_last();
        if let Some(last) = old_last {
            if self.stmts.get(last)?.def().is_terminator() {
                return Err(IRError::InvalidTerminator(block));
            }
        }
        let s = self.stmts.get_mut(stmt)?;
        s.set_parent(Some(block));
        s.set_prev(old_last);
        s.set_next(None);
        match old_last {
            Some(last) => self.stmts.get_mut(last)?.set_next(Some(stmt)),
            None => self.blocks.get_mut(block)?.set_first(Some(stmt)),
        }
        self.blocks.get_mut(block)?.set_last(Some(stmt));
        Ok(())
    }

    /// Insert a detached statement immediately before `cursor`.
    pub fn insert_before(&mut self, cursor: StmtId, stmt: StmtId) -> Result<(), IRError> {
        if self.stmts.get(stmt)?.get_parent().is_some() {
            return Err(IRError::OrphanStatement(stmt));
        }
        let (block, prev) = {
            let c = self.stmts.get(cursor)?;
            (
                c.get_parent().ok_or(IRError::OrphanStatement(cursor))?,
                c.get_prev(),
            )
        };
        let s = self.stmts.get_mut(stmt)?;
        s.set_parent(Some(block));
        s.set_prev(prev);
        s.set_next(Some(cursor));
        self.stmts.get_mut(cursor)?.set_prev(Some(stmt));
        match prev {
            Some(p) => self.stmts.get_mut(p)?.set_next(Some(stmt)),
            None => self.blocks.get_mut(block)?.set_first(Some(stmt)),
        }
        Ok(())
    }

    /// Insert a detached statement immediately after `cursor`. Inserting
    /// after a terminator is rejected.
    pub fn insert_after(&mut self, cursor: StmtId, stmt: StmtId) -> Result<(), IRError> {
        if self.stmts.get(stmt)?.get_parent().is_some() {
            return Err(IRError::OrphanStatement(stmt));
        }
        let (block, next, cursor_terminates) = {
            let c = self.stmts.get(cursor)?;
            (
                c.get_parent().ok_or(IRError::OrphanStatement(cursor))?,
                c.get_next(),
                c.def().is_terminator(),
            )
        };
        if cursor_terminates {
            return Err(IRError::InvalidTerminator(block));
        }
        let s = self.stmts.get_mut(stmt)?;
        s.set_parent(Some(block));
        s.set_prev(Some(cursor));
        s.set_next(next);
        self.stmts.get_mut(cursor)?.set_next(Some(stmt));
        match next {
            Some(n) => self.stmts.get_mut(n)?.set_prev(Some(stmt)),
            None => self.blocks.get_mut(block)?.set_last(Some(stmt)),
        }
        Ok(())
    }

    /// Unlink `stmt` from its block, keeping it (and its uses) alive.
    pub fn remove_stmt(&mut self, stmt: StmtId) -> Result<(), IRError> {
        let (parent, prev, next) = {
            let s = self.stmts.get(stmt)?;
            (s.get_parent(), s.get_prev(), s.get_next())
        };
        match prev {
            Some(p) => self.stmts.get_mut(p)?.set_next(next),
            None => {
                if let Some(b) = parent {
                    self.blocks.get_mut(b)?.set_first(next);
                }
            }
        }
        match next {
            Some(n) => self.stmts.get_mut(n)?.set_prev(prev),
            None => {
                if let Some(b) = parent {
                    self.blocks.get_mut(b)?.set_last(prev);
                }
            }
        }
        let s = self.stmts.get_mut(stmt)?;
        s.set_parent(None);
        s.set_prev(None);
        s.set_next(None);
        Ok(())
    }

    /// Rewrite every use of `old` to `new`, moving the use tokens between
    /// the two use lists. Both sides are validated before any mutation.
    pub fn replace_all_uses_with(&mut self, old: Var, new: Var) -> Result<(), IRError> {
        if old == new {
            return Ok(());
        }
        self.values.get(new)?;
        let uses = self
            .values
            .get(old)?
            .get_uses()
            .iter()
            .copied()
            .collect::<Vec<_>>();
        for u in &uses {
            self.stmts.get(u.stmt)?;
        }
        for u in &uses {
            self.stmts.get_mut(u.stmt)?.set_operand(u.index, new);
        }
        self.values.get_mut(old)?.uses_mut().clear();
        self.values.get_mut(new)?.uses_mut().extend(uses);
        Ok(())
    }

    /// Replace an attached statement by a detached one: swap the block
    /// occupancy and rewrite all uses of the old results to the new ones.
    /// Result arities must match; the check runs before any mutation, so
    /// a failed replacement leaves the IR untouched.
    pub fn replace_stmt(&mut self, old: StmtId, new: StmtId) -> Result<(), IRError> {
        let (block, prev, next, old_results) = {
            let s = self.stmts.get(old)?;
            (
                s.get_parent().ok_or(IRError::OrphanStatement(old))?,
                s.get_prev(),
                s.get_next(),
                s.get_results().to_vec(),
            )
        };
        let new_results = {
            let s = self.stmts.get(new)?;
            if s.get_parent().is_some() {
                return Err(IRError::OrphanStatement(new));
            }
            s.get_results().to_vec()
        };
        if old_results.len() != new_results.len() {
            return Err(IRError::ArityMismatch {
                expected: old_results.len(),
                found: new_results.len(),
            });
        }
        let s = self.stmts.get_mut(new)?;
        s.set_parent(Some(block));
        s.set_prev(prev);
        s.set_next(next);
        match prev {
            Some(p) => self.stmts.get_mut(p)?.set_next(Some(new)),
            None => self.blocks.get_mut(block)?.set_first(Some(new)),
        }
        match next {
            Some(n) => self.stmts.get_mut(n)?.set_prev(Some(new)),
            None => self.blocks.get_mut(block)?.set_last(Some(new)),
        }
        let s = self.stmts.get_mut(old)?;
        s.set_parent(None);
        s.set_prev(None);
        s.set_next(None);
        for (o, n) in old_results.into_iter().zip(new_results) {
            self.replace_all_uses_with(o, n)?;
        }
        Ok(())
    }

    /// Erase a statement: unlink it, drop its operand uses, recursively
    /// erase its regions, and tombstone it together with its results.
    /// Returns the call sites that disappeared so the pipeline can drop
    /// their backedges.
    pub fn erase_stmt(&mut self, stmt: StmtId) -> Result<Vec<(StmtId, crate::CallTarget)>, IRError> {
        let mut removed = Vec::new();
        self.remove_stmt(stmt)?;
        self.erase_stmt_inner(stmt, &mut removed)?;
        Ok(removed)
    }

    fn erase_stmt_inner(
        &mut self,
        stmt: StmtId,
        removed: &mut Vec<(StmtId, crate::CallTarget)>,
    ) -> Result<(), IRError> {
        let (operands, regions, results, target) = {
            let s = self.stmts.get(stmt)?;
            (
                s.get_operands().to_vec(),
                s.get_regions().to_vec(),
                s.get_results().to_vec(),
                s.def().call_target(),
            )
        };
        for (index, op) in operands.into_iter().enumerate() {
            if self.values.is_live(op) {
                self.values
                    .get_mut(op)?
                    .uses_mut()
                    .remove(&Use { stmt, index });
            }
        }
        if let Some(t) = target {
            removed.push((stmt, t));
        }
        for r in regions {
            self.erase_region_inner(r, removed)?;
        }
        for v in results {
            self.values.mark_deleted(v)?;
        }
        self.stmts.mark_deleted(stmt)?;
        Ok(())
    }

    fn erase_region_inner(
        &mut self,
        region: RegionId,
        removed: &mut Vec<(StmtId, crate::CallTarget)>,
    ) -> Result<(), IRError> {
        let mut block = self.regions.get(region)?.get_entry();
        while let Some(b) = block {
            let (next, args) = {
                let blk = self.blocks.get(b)?;
                (blk.get_next(), blk.get_args().to_vec())
            };
            let mut stmt = self.blocks.get(b)?.get_first();
            while let Some(s) = stmt {
                stmt = self.stmts.get(s)?.get_next();
                self.erase_stmt_inner(s, removed)?;
            }
            for arg in args {
                self.values.mark_deleted(arg)?;
            }
            self.blocks.mark_deleted(b)?;
            block = next;
        }
        self.regions.mark_deleted(region)?;
        Ok(())
    }

    /////
    ///// Verification.
    /////

    /// Check the structural invariants of one region: every block ends
    /// with exactly one terminator, successors stay inside the region,
    /// and every operand is mirrored by a use-list entry.
    pub fn verify_region(&self, region: RegionId) -> Result<(), IRError> {
        let mut block = self.regions.get(region)?.get_entry();
        while let Some(b) = block {
            let blk = self.blocks.get(b)?;
            let last = blk.get_last().ok_or(IRError::InvalidTerminator(b))?;
            let mut stmt = blk.get_first();
            while let Some(s) = stmt {
                let st = self.stmts.get(s)?;
                let is_term = st.def().is_terminator();
                if (s == last) != is_term {
                    return Err(IRError::InvalidTerminator(b));
                }
                for succ in st.get_successors() {
                    if self.blocks.get(*succ)?.get_parent() != Some(region) {
                        return Err(IRError::CrossRegionSuccessor {
                            stmt: s,
                            successor: *succ,
                        });
                    }
                }
                for (index, op) in st.get_operands().iter().enumerate() {
                    if !self.values.get(*op)?.get_uses().contains(&Use { stmt: s, index }) {
                        return Err(IRError::InconsistentUseList { stmt: s, index });
                    }
                }
                for r in st.get_regions() {
                    self.verify_region(*r)?;
                }
                stmt = st.get_next();
            }
            block = blk.get_next();
        }
        Ok(())
    }

    /// Optional extra pass: every block must be reachable from the entry
    /// via successor edges.
    pub fn verify_reachability(&self, region: RegionId) -> Result<(), IRError> {
        let entry = match self.regions.get(region)?.get_entry() {
            None => return Ok(()),
            Some(b) => b,
        };
        let mut seen = std::collections::BTreeSet::new();
        let mut work = vec![entry];
        while let Some(b) = work.pop() {
            if !seen.insert(b) {
                continue;
            }
            let mut stmt = self.blocks.get(b)?.get_first();
            while let Some(s) = stmt {
                let st = self.stmts.get(s)?;
                for succ in st.get_successors() {
                    if !seen.contains(succ) {
                        work.push(*succ);
                    }
                }
                stmt = st.get_next();
            }
        }
        let mut block = Some(entry);
        while let Some(b) = block {
            if !seen.contains(&b) {
                return Err(IRError::UnreachableBlock(b));
            }
            block = self.blocks.get(b)?.get_next();
        }
        Ok(())
    }

    /////
    ///// Traversal.
    /////

    /// Depth-first statement traversal with a short-circuit control.
    pub fn walk<F>(&self, region: RegionId, f: &mut F) -> Result<(), IRError>
    where
        F: FnMut(StmtId, &Statement<L>) -> WalkFlow,
    {
        self.walk_inner(region, f).map(|_| ())
    }

    fn walk_inner<F>(&self, region: RegionId, f: &mut F) -> Result<bool, IRError>
    where
        F: FnMut(StmtId, &Statement<L>) -> WalkFlow,
    {
        let mut block = self.regions.get(region)?.get_entry();
        while let Some(b) = block {
            let blk = self.blocks.get(b)?;
            let mut stmt = blk.get_first();
            while let Some(s) = stmt {
                let st = self.stmts.get(s)?;
                match f(s, st) {
                    WalkFlow::Halt => return Ok(true),
                    WalkFlow::SkipNested => {}
                    WalkFlow::Advance => {
                        for r in st.get_regions() {
                            if self.walk_inner(*r, f)? {
                                return Ok(true);
                            }
                        }
                    }
                }
                stmt = st.get_next();
            }
            block = blk.get_next();
        }
        Ok(false)
    }

    /////
    ///// Function model.
    /////

    /// Attach a staged entry for this stage to `function`. Re-attaching
    /// the identical signature returns the existing entry; a conflicting
    /// signature is returned as data for the caller to resolve.
    pub fn staged_function(
        &mut self,
        function: &mut Function,
        fid: FuncId,
        sig: Signature<L::Type>,
    ) -> Result<StagedFuncId, FunctionError<L::Type>> {
        let name = function.get_name();
        if let Some(existing) = function.staged_at(self.stage) {
            let old = self
                .staged
                .get(existing)
                .map_err(|_| FunctionError::UnknownFunction(existing))?;
            if !old.is_invalidated() && old.get_signature() == &sig {
                return Ok(existing);
            }
            return Err(FunctionError::Staged(StagedConflict {
                name,
                stage: self.stage,
                existing,
                old: old.get_signature().clone(),
                new: sig,
            }));
        }
        if let Some(expected) = function.conceptual_arity() {
            if expected != sig.arity() {
                return Err(FunctionError::ArityMismatch {
                    expected,
                    found: sig.arity(),
                });
            }
        }
        let arity = sig.arity();
        let id = self.staged.alloc(StagedFunction::new(fid, name, sig));
        function.attach(self.stage, id, arity);
        self.staged_by_name.insert(name, id);
        Ok(id)
    }

    /// Opt-in resolution of a [`StagedConflict`]: invalidate the old
    /// entry (it stays addressable) and attach the new signature.
    pub fn redefine_staged_function(
        &mut self,
        function: &mut Function,
        conflict: StagedConflict<L::Type>,
    ) -> Result<StagedFuncId, FunctionError<L::Type>> {
        let fid = {
            let old = self
                .staged
                .get_mut(conflict.existing)
                .map_err(|_| FunctionError::UnknownFunction(conflict.existing))?;
            old.invalidate();
            old.get_function()
        };
        debug!(
            stage = self.stage.get_id(),
            staged = conflict.existing.get_id(),
            "staged function invalidated by redefinition"
        );
        let id = self
            .staged
            .alloc(StagedFunction::new(fid, conflict.name, conflict.new));
        function.reattach(self.stage, id);
        self.staged_by_name.insert(conflict.name, id);
        Ok(id)
    }

    /// Append a specialization whose signature must be accepted by the
    /// parent staged signature under `sem`. A live duplicate signature is
    /// returned as a [`SpecializeConflict`].
    pub fn specialize<Sem>(
        &mut self,
        staged: StagedFuncId,
        sig: Signature<L::Type>,
        body: RegionId,
        sem: &Sem,
    ) -> Result<SpecFuncId, FunctionError<L::Type>>
    where
        Sem: SignatureSemantics<L::Type>,
    {
        let (name, existing) = {
            let parent = self
                .staged
                .get(staged)
                .map_err(|_| FunctionError::UnknownFunction(staged))?;
            if sem.applicable(&sig, parent.get_signature()).is_none() {
                return Err(FunctionError::NotAccepted);
            }
            let dup = parent.get_specializations().iter().copied().find(|sp| {
                self.specialized
                    .get(*sp)
                    .map(|s| !s.is_invalidated() && s.get_signature() == &sig)
                    .unwrap_or(false)
            });
            (parent.get_name(), dup)
        };
        if let Some(existing) = existing {
            return Err(FunctionError::Specialize(SpecializeConflict {
                name,
                stage: self.stage,
                staged,
                existing,
                sig,
                body,
            }));
        }
        let id = self
            .specialized
            .alloc(SpecializedFunction::new(staged, name, sig, body));
        self.staged
            .get_mut(staged)
            .map_err(|_| FunctionError::UnknownFunction(staged))?
            .push_specialization(id);
        Ok(id)
    }

    /// Opt-in resolution of a [`SpecializeConflict`]: invalidate the old
    /// specialization and append the new one. The old entry keeps its
    /// backedges so callers needing recompilation stay enumerable.
    pub fn redefine_specialization(
        &mut self,
        conflict: SpecializeConflict<L::Type>,
    ) -> Result<SpecFuncId, FunctionError<L::Type>> {
        self.specialized
            .get_mut(conflict.existing)
            .map_err(|_| FunctionError::UnknownFunction(conflict.staged))?
            .invalidate();
        debug!(
            stage = self.stage.get_id(),
            specialized = conflict.existing.get_id(),
            "specialization invalidated by redefinition"
        );
        let id = self.specialized.alloc(SpecializedFunction::new(
            conflict.staged,
            conflict.name,
            conflict.sig,
            conflict.body,
        ));
        self.staged
            .get_mut(conflict.staged)
            .map_err(|_| FunctionError::UnknownFunction(conflict.staged))?
            .push_specialization(id);
        Ok(id)
    }

    /// Resolve a call signature against the live specializations of a
    /// staged function: filter by applicability, reduce by strict
    /// domination, then demand a unique winner.
    pub fn resolve<Sem>(
        &self,
        staged: StagedFuncId,
        call: &Signature<L::Type>,
        sem: &Sem,
    ) -> Result<(SpecFuncId, Sem::Env), DispatchError>
    where
        Sem: SignatureSemantics<L::Type>,
    {
        let sf = self
            .staged
            .get(staged)
            .map_err(|_| DispatchError::UnknownFunction)?;
        let mut applicable = Vec::new();
        for sp in sf.get_specializations() {
            let s = match self.specialized.get(*sp) {
                Ok(s) => s,
                Err(_) => continue,
            };
            if s.is_invalidated() {
                continue;
            }
            if let Some(env) = sem.applicable(call, s.get_signature()) {
                applicable.push((*sp, s.get_signature().clone(), env));
            }
        }
        reduce_candidates(sem, applicable)
    }

    /////
    ///// Backedges.
    /////

    pub fn add_backedge(
        &mut self,
        staged: StagedFuncId,
        specialized: Option<SpecFuncId>,
        edge: Backedge,
    ) -> Result<(), IRError> {
        self.staged.get_mut(staged)?.backedges_mut().insert(edge);
        if let Some(sp) = specialized {
            self.specialized.get_mut(sp)?.backedges_mut().insert(edge);
        }
        Ok(())
    }

    pub fn remove_backedge(
        &mut self,
        staged: StagedFuncId,
        specialized: Option<SpecFuncId>,
        edge: Backedge,
    ) -> Result<(), IRError> {
        self.staged.get_mut(staged)?.backedges_mut().remove(&edge);
        if let Some(sp) = specialized {
            self.specialized.get_mut(sp)?.backedges_mut().remove(&edge);
        }
        Ok(())
    }

    /// Rewrite backedges whose caller lives in `stage` through the
    /// caller's post-compaction statement map. Edges whose statement was
    /// dropped disappear.
    pub fn remap_backedges_from(&mut self, stage: CompileStage, stmts: &IdMap<StmtId>) {
        let remap_set = |edges: &mut std::collections::BTreeSet<Backedge>| {
            let rewritten = edges
                .iter()
                .filter_map(|e| {
                    if e.stage != stage {
                        return Some(*e);
                    }
                    stmts.remap(e.stmt).map(|s| Backedge {
                        stage: e.stage,
                        stmt: s,
                    })
                })
                .collect();
            *edges = rewritten;
        };
        for (_, sf) in self.staged.iter_live_mut() {
            remap_set(sf.backedges_mut());
        }
        for (_, sp) in self.specialized.iter_live_mut() {
            remap_set(sp.backedges_mut());
        }
    }

    /////
    ///// Compaction.
    /////

    /// Compact every arena and rewrite all intra-stage references through
    /// the fresh maps. References into this stage held elsewhere (the
    /// pipeline's function table, backedges recorded on other stages)
    /// must be rewritten by the caller using the returned maps.
    pub fn compact(&mut self) -> Result<CompactionMaps, IRError> {
        // Validate that no live entity references a tombstone; compaction
        // is all-or-nothing.
        for (_, st) in self.stmts.iter_live() {
            for op in st.get_operands() {
                self.values.get(*op)?;
            }
            for r in st.get_results() {
                self.values.get(*r)?;
            }
            for b in st.get_successors() {
                self.blocks.get(*b)?;
            }
            for r in st.get_regions() {
                self.regions.get(*r)?;
            }
        }
        for (_, sp) in self.specialized.iter_live() {
            self.regions.get(sp.get_body())?;
        }

        let maps = CompactionMaps {
            values: self.values.compact(),
            stmts: self.stmts.compact(),
            blocks: self.blocks.compact(),
            regions: self.regions.compact(),
            staged: self.staged.compact(),
            specialized: self.specialized.compact(),
        };

        for (_, v) in self.values.iter_live_mut() {
            let kind = match v.get_kind() {
                ValueKind::BlockArgument { block, index } => ValueKind::BlockArgument {
                    block: remap(&maps.blocks, block)?,
                    index,
                },
                ValueKind::StatementResult { stmt, index } => ValueKind::StatementResult {
                    stmt: remap(&maps.stmts, stmt)?,
                    index,
                },
            };
            v.set_kind(kind);
            let uses = v
                .get_uses()
                .iter()
                .filter_map(|u| {
                    maps.stmts.remap(u.stmt).map(|s| Use {
                        stmt: s,
                        index: u.index,
                    })
                })
                .collect();
            *v.uses_mut() = uses;
        }
        for (_, st) in self.stmts.iter_live_mut() {
            st.set_parent(remap_opt(&maps.blocks, st.get_parent())?);
            st.set_prev(remap_opt(&maps.stmts, st.get_prev())?);
            st.set_next(remap_opt(&maps.stmts, st.get_next())?);
            for op in st.operands_mut() {
                *op = remap(&maps.values, *op)?;
            }
            for r in st.results_mut() {
                *r = remap(&maps.values, *r)?;
            }
            for b in st.successors_mut() {
                *b = remap(&maps.blocks, *b)?;
            }
            for r in st.regions_mut() {
                *r = remap(&maps.regions, *r)?;
            }
        }
        for (_, blk) in self.blocks.iter_live_mut() {
            blk.set_parent(remap_opt(&maps.regions, blk.get_parent())?);
            blk.set_prev(remap_opt(&maps.blocks, blk.get_prev())?);
            blk.set_next(remap_opt(&maps.blocks, blk.get_next())?);
            blk.set_first(remap_opt(&maps.stmts, blk.get_first())?);
            blk.set_last(remap_opt(&maps.stmts, blk.get_last())?);
            for arg in blk.args_mut() {
                *arg = remap(&maps.values, *arg)?;
            }
        }
        for (_, reg) in self.regions.iter_live_mut() {
            reg.set_owner(remap_opt(&maps.stmts, reg.get_owner())?);
            reg.set_first(remap_opt(&maps.blocks, reg.get_entry())?);
            reg.set_last(remap_opt(&maps.blocks, reg.get_last())?);
        }
        let stage = self.stage;
        for (_, sf) in self.staged.iter_live_mut() {
            let specs = sf
                .get_specializations()
                .iter()
                .filter_map(|sp| maps.specialized.remap(*sp))
                .collect::<Vec<_>>();
            *sf.specializations_mut() = specs;
        }
        for (_, sp) in self.specialized.iter_live_mut() {
            sp.set_body(remap(&maps.regions, sp.get_body())?);
        }
        self.remap_backedges_from(stage, &maps.stmts);
        for staged in self.staged_by_name.values_mut() {
            if let Some(new) = maps.staged.remap(*staged) {
                *staged = new;
            }
        }
        Ok(maps)
    }
}
