/*!

   Cursor-based construction of function bodies.

   A builder owns a fresh region inside one stage's storage and appends
   blocks and statements at its cursor. Construction ends with an
   explicit `finish()` returning the region handle; dropping an
   unfinished builder leaves the partially built region unattached and is
   reported through the diagnostics stream.

*/

use crate::core::dialect::Dialect;
use crate::core::ir::{BlockId, IRError, RegionId, StmtId, Var};
use crate::core::stage::StageInfo;
use tracing::warn;

#[derive(Debug)]
pub struct FunctionBuilder<'a, L: Dialect> {
    info: &'a mut StageInfo<L>,
    region: RegionId,
    cursor: Option<BlockId>,
    finished: bool,
}

impl<'a, L: Dialect> FunctionBuilder<'a, L> {
    /// Start building a fresh body region in `info`.
    pub fn new(info: &'a mut StageInfo<L>) -> FunctionBuilder<'a, L> {
        let region = info.create_region();
        FunctionBuilder {
            info,
            region,
            cursor: None,
            finished: false,
        }
    }

    pub fn get_region(&self) -> RegionId {
        self.region
    }

    pub fn get_cursor(&self) -> Option<BlockId> {
        self.cursor
    }

    /// Append a block to the body and move the cursor to it. The first
    /// appended block is the entry.
    pub fn append_block(&mut self) -> Result<BlockId, IRError> {
        let block = self.info.append_block(self.region)?;
        self.cursor = Some(block);
        Ok(block)
    }

    pub fn set_cursor(&mut self, block: BlockId) {
        self.cursor = Some(block);
    }

    /// Append an argument to the cursor block.
    pub fn push_arg(&mut self, ty: L::Type) -> Result<Var, IRError> {
        let block = self.cursor.ok_or(IRError::EmptyRegion(self.region))?;
        self.info.push_block_arg(block, ty)
    }

    /// Create a statement and append it at the cursor block's tail.
    pub fn push(
        &mut self,
        def: L,
        operands: Vec<Var>,
        result_types: Vec<L::Type>,
        successors: Vec<BlockId>,
    ) -> Result<StmtId, IRError> {
        let block = self.cursor.ok_or(IRError::EmptyRegion(self.region))?;
        let stmt = self
            .info
            .create_stmt(def, operands, result_types, successors, Vec::new())?;
        self.info.append_stmt(block, stmt)?;
        Ok(stmt)
    }

    pub fn result_of(&self, stmt: StmtId, index: usize) -> Result<Var, IRError> {
        let results = self.info.get_statement(stmt)?.get_results();
        results
            .get(index)
            .copied()
            .ok_or(IRError::ArityMismatch {
                expected: index + 1,
                found: results.len(),
            })
    }

    /// Finish construction and hand back the body region.
    pub fn finish(mut self) -> RegionId {
        self.finished = true;
        self.region
    }
}

impl<'a, L: Dialect> Drop for FunctionBuilder<'a, L> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                region = self.region.get_id(),
                "function builder dropped before finish"
            );
        }
    }
}
