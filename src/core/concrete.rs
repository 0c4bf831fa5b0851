//! The stack-based concrete interpreter.
//!
//! Drives one session of execution over a pipeline: a stack of frames,
//! explicit `step`/`advance` control, optional fuel and depth limits, a
//! breakpoint set, and an optional global state `G` attached through a
//! type-changing builder.
//!
//! `advance` must be called with exactly the continuation returned by the
//! immediately preceding `step`; mixing stale continuations is a
//! programmer error the types do not defend against. On an interpretation
//! error the machine is left valid at the current cursor, so a tool can
//! inspect frames, repair bindings, and retry.

use crate::core::function::SpecFuncId;
use crate::core::interpreter::{
    Continuation, DialectSet, Frame, Interpretable, Interpreter, InterpreterError, Progress,
    StmtContext,
};
use crate::core::ir::{BlockId, StmtId, Var};
use crate::core::pipeline::{Pipeline, Selector, StageIdentity, StageList, StageStorage};
use crate::core::stage::CompileStage;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Why [`StackInterpreter::run_until_break`] returned control.
#[derive(Debug, Clone, PartialEq)]
pub enum Paused<V> {
    /// The cursor reached a statement in the breakpoint set.
    Breakpoint(StmtId),
    /// The dialect semantics emitted `Break` at this statement.
    Break(StmtId),
    /// The root frame returned.
    Finished(V),
    /// The session halted.
    Halted,
}

/// The concrete execution engine.
#[derive(Debug)]
pub struct StackInterpreter<'p, S, V, G = ()> {
    pipeline: &'p Pipeline<S>,
    active: CompileStage,
    frames: Vec<Frame<V>>,
    fuel: Option<usize>,
    max_depth: Option<usize>,
    breakpoints: HashSet<(CompileStage, StmtId)>,
    paused_at: Option<(CompileStage, StmtId)>,
    global: G,
}

impl<'p, S, V> StackInterpreter<'p, S, V, ()> {
    /// A fresh session over `pipeline`, resolving root calls at `active`.
    pub fn new(pipeline: &'p Pipeline<S>, active: CompileStage) -> StackInterpreter<'p, S, V, ()> {
        StackInterpreter {
            pipeline,
            active,
            frames: Vec::new(),
            fuel: None,
            max_depth: None,
            breakpoints: HashSet::new(),
            paused_at: None,
            global: (),
        }
    }
}

impl<'p, S, V, G> StackInterpreter<'p, S, V, G> {
    /// Attach a global runtime state, changing the session's type.
    pub fn with_global<G2>(self, global: G2) -> StackInterpreter<'p, S, V, G2> {
        StackInterpreter {
            pipeline: self.pipeline,
            active: self.active,
            frames: self.frames,
            fuel: self.fuel,
            max_depth: self.max_depth,
            breakpoints: self.breakpoints,
            paused_at: self.paused_at,
            global,
        }
    }

    /// Cap the number of `step`s this session may take.
    pub fn with_fuel(mut self, fuel: usize) -> Self {
        self.fuel = Some(fuel);
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn get_pipeline(&self) -> &'p Pipeline<S> {
        self.pipeline
    }

    pub fn get_active_stage(&self) -> CompileStage {
        self.active
    }

    pub fn get_global(&self) -> &G {
        &self.global
    }

    pub fn get_global_mut(&mut self) -> &mut G {
        &mut self.global
    }

    pub fn get_fuel(&self) -> Option<usize> {
        self.fuel
    }

    pub fn get_frames(&self) -> &[Frame<V>] {
        &self.frames
    }

    pub fn current_frame(&self) -> Option<&Frame<V>> {
        self.frames.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut Frame<V>> {
        self.frames.last_mut()
    }

    /// The stage and statement the session is suspended at.
    pub fn cursor(&self) -> Option<(CompileStage, StmtId)> {
        let f = self.frames.last()?;
        f.get_cursor().map(|s| (f.get_stage(), s))
    }

    pub fn add_breakpoint(&mut self, stage: CompileStage, stmt: StmtId) {
        self.breakpoints.insert((stage, stmt));
    }

    pub fn remove_breakpoint(&mut self, stage: CompileStage, stmt: StmtId) {
        self.breakpoints.remove(&(stage, stmt));
    }

    fn take_fuel(&mut self) -> Result<(), InterpreterError> {
        match self.fuel {
            None => Ok(()),
            Some(0) => Err(InterpreterError::Exhausted),
            Some(f) => {
                self.fuel = Some(f - 1);
                Ok(())
            }
        }
    }

    fn current_pos(&self) -> Result<(CompileStage, StmtId), InterpreterError> {
        let f = self.frames.last().ok_or(InterpreterError::NoFrame)?;
        let cursor = f.get_cursor().ok_or(InterpreterError::BadState)?;
        Ok((f.get_stage(), cursor))
    }

    fn set_cursor(&mut self, cursor: Option<StmtId>) -> Result<(), InterpreterError> {
        self.frames
            .last_mut()
            .ok_or(InterpreterError::NoFrame)?
            .set_cursor(cursor);
        Ok(())
    }

    fn storage(&self, stage: CompileStage) -> Result<&dyn StageStorage, InterpreterError>
    where
        S: StageList,
    {
        self.pipeline
            .get_stage_dyn(stage)
            .ok_or(InterpreterError::StageMismatch {
                expected: None,
                found: stage,
            })
    }

    fn push_frame(
        &mut self,
        callee: SpecFuncId,
        stage: CompileStage,
        args: Vec<V>,
        ret_to: Option<Var>,
    ) -> Result<(), InterpreterError>
    where
        S: StageList,
    {
        if let Some(depth) = self.max_depth {
            if self.frames.len() >= depth {
                return Err(InterpreterError::MaxDepthExceeded);
            }
        }
        let (first, params) = {
            let store = self.storage(stage)?;
            let entry = store
                .specialized_entry(callee)
                .map_err(|_| InterpreterError::BadState)?;
            let first = store
                .first_stmt(entry)
                .map_err(|_| InterpreterError::BadState)?
                .ok_or(InterpreterError::BadState)?;
            let params = store
                .block_args(entry)
                .map_err(|_| InterpreterError::BadState)?
                .to_vec();
            (first, params)
        };
        if params.len() != args.len() {
            return Err(InterpreterError::BadState);
        }
        let mut env = HashMap::new();
        for (p, a) in params.into_iter().zip(args) {
            env.insert(p, a);
        }
        debug!(
            stage = stage.get_id(),
            callee = callee.get_id(),
            depth = self.frames.len(),
            "push frame"
        );
        self.frames
            .push(Frame::new(callee, stage, env, Some(first), ret_to));
        Ok(())
    }

    fn bind_jump(&mut self, block: BlockId, args: Vec<V>) -> Result<(), InterpreterError>
    where
        S: StageList,
    {
        let stage = self
            .frames
            .last()
            .ok_or(InterpreterError::NoFrame)?
            .get_stage();
        let (first, params) = {
            let store = self.storage(stage)?;
            let first = store
                .first_stmt(block)
                .map_err(|_| InterpreterError::BadState)?
                .ok_or(InterpreterError::BadState)?;
            let params = store
                .block_args(block)
                .map_err(|_| InterpreterError::BadState)?
                .to_vec();
            (first, params)
        };
        if params.len() != args.len() {
            return Err(InterpreterError::BadState);
        }
        let frame = self.frames.last_mut().ok_or(InterpreterError::NoFrame)?;
        for (p, a) in params.into_iter().zip(args) {
            frame.bind(p, a);
        }
        frame.set_cursor(Some(first));
        Ok(())
    }

    /// Execute the current statement's dialect semantics and return the
    /// raw continuation without applying any cursor mutation. Routes
    /// through the stage tag at runtime, so mixed-stage frames work.
    pub fn step(&mut self) -> Result<Continuation<V>, InterpreterError>
    where
        S: DialectSet<Self>,
    {
        self.take_fuel()?;
        let (stage, stmt) = self.current_pos()?;
        trace!(stage = stage.get_id(), stmt = stmt.get_id(), "step");
        let pipeline = self.pipeline;
        pipeline.get_stages().dispatch(stage, stmt, self)
    }

    /// Typed `step`: additionally checks that the current frame lives on
    /// stage `Id` and dispatches through that stage's dialect statically.
    pub fn step_on<Id: StageIdentity, Ix>(&mut self) -> Result<Continuation<V>, InterpreterError>
    where
        S: Selector<Id, Ix>,
        <S as Selector<Id, Ix>>::Lang: Interpretable<Self>,
    {
        self.take_fuel()?;
        let (stage, stmt) = self.current_pos()?;
        let expected = self.pipeline.get_stage_id::<Id, Ix>();
        if stage != expected {
            return Err(InterpreterError::StageMismatch {
                expected: Some(expected),
                found: stage,
            });
        }
        trace!(stage = stage.get_id(), stmt = stmt.get_id(), "step (typed)");
        let pipeline = self.pipeline;
        let info = <S as Selector<Id, Ix>>::select(pipeline.get_stages()).get_info();
        let st = info
            .get_statement(stmt)
            .map_err(|_| InterpreterError::BadState)?;
        let ctx = StmtContext {
            stmt,
            operands: st.get_operands(),
            results: st.get_results(),
            successors: st.get_successors(),
            regions: st.get_regions(),
        };
        st.def().interpret(&ctx, self)
    }

    /// Apply the cursor mutation a continuation asks for. `Fork` is a
    /// programmer error under concrete execution.
    pub fn advance(&mut self, control: Continuation<V>) -> Result<Progress<V>, InterpreterError>
    where
        S: StageList,
    {
        match control {
            Continuation::Continue => {
                let (stage, cur) = self.current_pos()?;
                let next = self
                    .storage(stage)?
                    .next_stmt(cur)
                    .map_err(|_| InterpreterError::BadState)?
                    .ok_or(InterpreterError::BadState)?;
                self.set_cursor(Some(next))?;
                Ok(Progress::Continue)
            }
            Continuation::Jump(block, args) => {
                self.bind_jump(block, args)?;
                Ok(Progress::Continue)
            }
            Continuation::Fork(_) => Err(InterpreterError::BadState),
            Continuation::Call {
                callee,
                stage,
                args,
                result,
            } => {
                self.push_frame(callee, stage, args, Some(result))?;
                Ok(Progress::Continue)
            }
            Continuation::Return(v) => {
                let done = self.frames.pop().ok_or(InterpreterError::NoFrame)?;
                debug!(depth = self.frames.len(), "pop frame");
                if self.frames.is_empty() {
                    return Ok(Progress::Finished(v));
                }
                let slot = done.ret_to().ok_or(InterpreterError::BadState)?;
                let (stage, call_stmt) = self.current_pos()?;
                let next = self
                    .storage(stage)?
                    .next_stmt(call_stmt)
                    .map_err(|_| InterpreterError::BadState)?
                    .ok_or(InterpreterError::BadState)?;
                let frame = self.frames.last_mut().ok_or(InterpreterError::NoFrame)?;
                frame.bind(slot, v);
                frame.set_cursor(Some(next));
                Ok(Progress::Continue)
            }
            Continuation::Break => Ok(Progress::Suspended),
            Continuation::Halt => Ok(Progress::Halted),
        }
    }

    /// Push a root frame for `callee` at the active stage. Resolving the
    /// specialization is the caller's responsibility.
    pub fn enter(&mut self, callee: SpecFuncId, args: Vec<V>) -> Result<(), InterpreterError>
    where
        S: StageList,
    {
        let stage = self.active;
        self.push_frame(callee, stage, args, None)
    }

    /// Step/advance until the root call returns or the session halts.
    /// Breakpoints are ignored; a statement that keeps yielding `Break`
    /// is re-stepped and will spin until fuel runs out.
    pub fn run(&mut self) -> Result<Option<V>, InterpreterError>
    where
        S: DialectSet<Self> + StageList,
    {
        loop {
            let control = self.step()?;
            match self.advance(control)? {
                Progress::Finished(v) => return Ok(Some(v)),
                Progress::Halted => return Ok(None),
                Progress::Continue | Progress::Suspended => continue,
            }
        }
    }

    /// Like [`run`](Self::run), but pauses at breakpoints and honors
    /// dialect-emitted `Break`. Resuming from a pause does not re-trigger
    /// the same breakpoint.
    pub fn run_until_break(&mut self) -> Result<Paused<V>, InterpreterError>
    where
        S: DialectSet<Self> + StageList,
    {
        loop {
            let at = self.current_pos()?;
            if self.breakpoints.contains(&at) && self.paused_at != Some(at) {
                self.paused_at = Some(at);
                return Ok(Paused::Breakpoint(at.1));
            }
            self.paused_at = None;
            let control = self.step()?;
            match self.advance(control)? {
                Progress::Suspended => {
                    let at = self.current_pos()?;
                    self.paused_at = Some(at);
                    return Ok(Paused::Break(at.1));
                }
                Progress::Finished(v) => return Ok(Paused::Finished(v)),
                Progress::Halted => return Ok(Paused::Halted),
                Progress::Continue => continue,
            }
        }
    }

    /// Typed driver loop pinned to stage `Id`: returns `StageMismatch` on
    /// the first cross-stage transition.
    pub fn run_on<Id: StageIdentity, Ix>(&mut self) -> Result<Option<V>, InterpreterError>
    where
        S: Selector<Id, Ix> + StageList,
        <S as Selector<Id, Ix>>::Lang: Interpretable<Self>,
    {
        loop {
            let control = self.step_on::<Id, Ix>()?;
            match self.advance(control)? {
                Progress::Finished(v) => return Ok(Some(v)),
                Progress::Halted => return Ok(None),
                Progress::Continue | Progress::Suspended => continue,
            }
        }
    }

    /// Push a root frame, run to completion, and return the root value.
    pub fn call(&mut self, callee: SpecFuncId, args: Vec<V>) -> Result<V, InterpreterError>
    where
        S: DialectSet<Self> + StageList,
    {
        self.enter(callee, args)?;
        match self.run()? {
            Some(v) => Ok(v),
            None => Err(InterpreterError::UnexpectedHalt),
        }
    }
}

impl<'p, S, V, G> Interpreter for StackInterpreter<'p, S, V, G> {
    type Value = V;
    type Error = InterpreterError;

    fn read_ref(&self, v: Var) -> Result<&V, InterpreterError> {
        let frame = self.frames.last().ok_or(InterpreterError::NoFrame)?;
        frame.get(v).ok_or(InterpreterError::Unbound(v))
    }

    fn write(&mut self, v: Var, value: V) -> Result<(), InterpreterError> {
        let frame = self.frames.last_mut().ok_or(InterpreterError::NoFrame)?;
        frame.bind(v, value);
        Ok(())
    }
}
