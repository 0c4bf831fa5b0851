//! Pipeline-level rewrite utilities.
//!
//! These wrap the stage-local structural operations and keep callee
//! backedges in sync: inserting a call statement registers an edge on
//! its (possibly cross-stage) callee, and erasing or replacing one
//! removes it. Compaction of one stage rewrites every reference into it
//! held elsewhere in the pipeline.

use crate::core::dialect::{CallTarget, Dialect};
use crate::core::function::Backedge;
use crate::core::ir::{BlockId, IRError, StmtId};
use crate::core::pipeline::{Pipeline, Selector, StageIdentity, StageList};
use crate::core::stage::{CompactionMaps, CompileStage};

impl<S> Pipeline<S> {
    fn register_call(
        &mut self,
        caller_stage: CompileStage,
        stmt: StmtId,
        target: CallTarget,
    ) -> Result<(), IRError>
    where
        S: StageList,
    {
        let edge = Backedge {
            stage: caller_stage,
            stmt,
        };
        let store = self
            .get_stage_dyn_mut(target.stage)
            .ok_or(IRError::UnknownStage(target.stage.get_id()))?;
        store.add_backedge(target.staged, target.specialized, edge)
    }

    fn unregister_call(
        &mut self,
        caller_stage: CompileStage,
        stmt: StmtId,
        target: CallTarget,
    ) -> Result<(), IRError>
    where
        S: StageList,
    {
        let edge = Backedge {
            stage: caller_stage,
            stmt,
        };
        let store = self
            .get_stage_dyn_mut(target.stage)
            .ok_or(IRError::UnknownStage(target.stage.get_id()))?;
        store.remove_backedge(target.staged, target.specialized, edge)
    }

    /// Append a detached statement on stage `Id`, registering the callee
    /// backedge if the statement is a resolved call.
    pub fn append_statement<Id: StageIdentity, Ix>(
        &mut self,
        block: BlockId,
        stmt: StmtId,
    ) -> Result<(), IRError>
    where
        S: Selector<Id, Ix> + StageList,
    {
        let (stage, target) = {
            let cell = <S as Selector<Id, Ix>>::select(&self.stages);
            let st = cell.get_info().get_statement(stmt)?;
            (cell.get_stage(), st.def().call_target())
        };
        <S as Selector<Id, Ix>>::select_mut(&mut self.stages)
            .get_info_mut()
            .append_stmt(block, stmt)?;
        if let Some(t) = target {
            self.register_call(stage, stmt, t)?;
        }
        Ok(())
    }

    /// Insert a detached statement before `cursor` on stage `Id`; see
    /// [`append_statement`](Self::append_statement) for the backedge
    /// contract.
    pub fn insert_statement_before<Id: StageIdentity, Ix>(
        &mut self,
        cursor: StmtId,
        stmt: StmtId,
    ) -> Result<(), IRError>
    where
        S: Selector<Id, Ix> + StageList,
    {
        let (stage, target) = {
            let cell = <S as Selector<Id, Ix>>::select(&self.stages);
            let st = cell.get_info().get_statement(stmt)?;
            (cell.get_stage(), st.def().call_target())
        };
        <S as Selector<Id, Ix>>::select_mut(&mut self.stages)
            .get_info_mut()
            .insert_before(cursor, stmt)?;
        if let Some(t) = target {
            self.register_call(stage, stmt, t)?;
        }
        Ok(())
    }

    /// Replace an attached statement by a detached one on stage `Id`,
    /// atomically moving call backedges from the old statement to the
    /// new one.
    pub fn replace_statement<Id: StageIdentity, Ix>(
        &mut self,
        old: StmtId,
        new: StmtId,
    ) -> Result<(), IRError>
    where
        S: Selector<Id, Ix> + StageList,
    {
        let (stage, old_target, new_target) = {
            let cell = <S as Selector<Id, Ix>>::select(&self.stages);
            let info = cell.get_info();
            (
                cell.get_stage(),
                info.get_statement(old)?.def().call_target(),
                info.get_statement(new)?.def().call_target(),
            )
        };
        <S as Selector<Id, Ix>>::select_mut(&mut self.stages)
            .get_info_mut()
            .replace_stmt(old, new)?;
        if let Some(t) = old_target {
            self.unregister_call(stage, old, t)?;
        }
        if let Some(t) = new_target {
            self.register_call(stage, new, t)?;
        }
        Ok(())
    }

    /// Erase a statement on stage `Id`, dropping the backedges of every
    /// call site that disappears (including calls nested in erased
    /// regions).
    pub fn erase_statement<Id: StageIdentity, Ix>(&mut self, stmt: StmtId) -> Result<(), IRError>
    where
        S: Selector<Id, Ix> + StageList,
    {
        let stage = <S as Selector<Id, Ix>>::select(&self.stages).get_stage();
        let removed = <S as Selector<Id, Ix>>::select_mut(&mut self.stages)
            .get_info_mut()
            .erase_stmt(stmt)?;
        for (s, target) in removed {
            self.unregister_call(stage, s, target)?;
        }
        Ok(())
    }

    /// Compact one stage's arenas and rewrite every reference into that
    /// stage held elsewhere: backedges recorded on other stages and the
    /// pipeline's function table.
    pub fn compact_stage<Id: StageIdentity, Ix>(&mut self) -> Result<CompactionMaps, IRError>
    where
        S: Selector<Id, Ix> + StageList,
    {
        let stage = self.get_stage_id::<Id, Ix>();
        let maps = <S as Selector<Id, Ix>>::select_mut(&mut self.stages)
            .get_info_mut()
            .compact()?;
        self.stages.for_each_mut(&mut |store| {
            if store.stage() != stage {
                store.remap_backedges_from(stage, &maps.stmts);
            }
        });
        for (_, func) in self.functions.iter_live_mut() {
            func.remap_staged(stage, &maps.staged);
        }
        Ok(maps)
    }
}
