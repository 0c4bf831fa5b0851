//! The abstract interpreter: a worklist-driven fixpoint over block entry
//! states, with configurable widening, bounded narrowing, and a call
//! summary cache keyed by `(callee, stage, argument abstraction)`.
//!
//! For each reachable block entry the engine computes an
//! over-approximation of the values every SSA binding may take, joining
//! (and widening, where the strategy applies) at merge points until the
//! ascending chain stabilizes, then optionally refining downward with
//! `narrow`. `Fork` is interpreted as one `Jump` per target; `Call` is
//! served from the summary cache or by recursive analysis with
//! in-progress cycle detection.

use crate::core::dialect::Dialect;
use crate::core::function::SpecFuncId;
use crate::core::interpreter::{
    Continuation, DialectSet, Interpreter, InterpreterError, InterpreterErrors,
};
use crate::core::ir::{BlockId, IRError, RegionId, Var};
use crate::core::lattice::AbstractValue;
use crate::core::pipeline::{Pipeline, StageList, StageStorage};
use crate::core::stage::{CompileStage, StageInfo};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::mem;
use tracing::{debug, trace};

type Store<V> = BTreeMap<Var, V>;

/// Where the ascending phase applies `widen` instead of plain `join`.
#[derive(Debug, Clone)]
pub enum WideningStrategy {
    /// Widen at every join. Eagerly terminating, least precise.
    AllJoins,
    /// Widen only at the given blocks. Header identification is an
    /// input: use [`loop_headers`] or supply the set externally.
    LoopHeaders(BTreeSet<BlockId>),
    /// Widen a block only after it has been revisited this many times.
    DelayedN(usize),
}

/// The result of analyzing one specialization: per-block entry states,
/// the joined return abstraction, and iteration counts.
#[derive(Debug, Clone)]
pub struct Analysis<V> {
    pub entries: BTreeMap<BlockId, Store<V>>,
    pub ret: Option<V>,
    pub ascending_pops: usize,
    pub narrowing_rounds: usize,
}

impl<V> Analysis<V> {
    pub fn block_entry(&self, b: BlockId) -> Option<&Store<V>> {
        self.entries.get(&b)
    }

    pub fn get_ret(&self) -> Option<&V> {
        self.ret.as_ref()
    }
}

#[derive(Debug, Clone)]
struct Summary<V> {
    ret: Option<V>,
    tentative: bool,
}

#[derive(Debug)]
struct Activation<V> {
    stage: CompileStage,
    entry: BlockId,
    seed: Store<V>,
    entries: BTreeMap<BlockId, Store<V>>,
    worklist: VecDeque<BlockId>,
    queued: BTreeSet<BlockId>,
    revisits: BTreeMap<BlockId, usize>,
    ret: Option<V>,
    pops: usize,
}

impl<V> Activation<V> {
    fn enqueue(&mut self, b: BlockId) {
        if self.queued.insert(b) {
            self.worklist.push_back(b);
        }
    }

    fn pop(&mut self) -> Option<BlockId> {
        let b = self.worklist.pop_front()?;
        self.queued.remove(&b);
        Some(b)
    }
}

fn join_store<V: AbstractValue>(a: &Store<V>, b: &Store<V>) -> Store<V> {
    let mut out = a.clone();
    for (k, v) in b {
        match out.get(k) {
            Some(existing) => {
                let joined = existing.join(v);
                out.insert(*k, joined);
            }
            None => {
                out.insert(*k, v.clone());
            }
        }
    }
    out
}

// Missing keys are bottom.
fn store_le<V: AbstractValue>(a: &Store<V>, b: &Store<V>) -> bool {
    a.iter().all(|(k, v)| match b.get(k) {
        Some(w) => v.is_subseteq(w),
        None => v.is_subseteq(&V::bottom()),
    })
}

fn widen_store<V: AbstractValue>(
    prior: &Store<V>,
    merged: &Store<V>,
) -> Result<Store<V>, InterpreterError> {
    let mut out = prior.clone();
    for (k, m) in merged {
        let widened = match prior.get(k) {
            Some(p) => {
                let w = p.widen(m);
                if !p.is_subseteq(&w) || !m.is_subseteq(&w) {
                    return Err(InterpreterError::DidNotConverge);
                }
                w
            }
            None => m.clone(),
        };
        out.insert(*k, widened);
    }
    Ok(out)
}

fn narrow_store<V: AbstractValue>(
    prior: &Store<V>,
    recomputed: &Store<V>,
) -> Result<Store<V>, InterpreterError> {
    let mut out = prior.clone();
    for (k, p) in prior {
        if let Some(r) = recomputed.get(k) {
            let n = p.narrow(r);
            if !n.is_subseteq(p) {
                return Err(InterpreterError::DidNotConverge);
            }
            out.insert(*k, n);
        }
    }
    Ok(out)
}

/// Identify loop headers of a region as the targets of DFS back edges.
pub fn loop_headers<L: Dialect>(
    info: &StageInfo<L>,
    region: RegionId,
) -> Result<BTreeSet<BlockId>, IRError> {
    fn dfs<L: Dialect>(
        info: &StageInfo<L>,
        b: BlockId,
        visited: &mut BTreeSet<BlockId>,
        onstack: &mut BTreeSet<BlockId>,
        headers: &mut BTreeSet<BlockId>,
    ) -> Result<(), IRError> {
        visited.insert(b);
        onstack.insert(b);
        let mut succs = Vec::new();
        let mut stmt = info.first_stmt(b)?;
        while let Some(s) = stmt {
            let st = info.get_statement(s)?;
            succs.extend(st.get_successors().iter().copied());
            stmt = st.get_next();
        }
        for succ in succs {
            if onstack.contains(&succ) {
                headers.insert(succ);
            } else if !visited.contains(&succ) {
                dfs(info, succ, visited, onstack, headers)?;
            }
        }
        onstack.remove(&b);
        Ok(())
    }

    let mut headers = BTreeSet::new();
    if let Some(entry) = info.get_region(region)?.get_entry() {
        let mut visited = BTreeSet::new();
        let mut onstack = BTreeSet::new();
        dfs(info, entry, &mut visited, &mut onstack, &mut headers)?;
    }
    Ok(headers)
}

/// The worklist fixpoint engine.
#[derive(Debug)]
pub struct AbstractInterpreter<'p, S, V> {
    pipeline: &'p Pipeline<S>,
    active: CompileStage,
    widening: WideningStrategy,
    max_iterations: usize,
    narrowing_iterations: usize,
    summaries: HashMap<(CompileStage, SpecFuncId), Vec<(Vec<V>, Summary<V>)>>,
    in_progress: Vec<(CompileStage, SpecFuncId, Vec<V>)>,
    // Transfer-local state; the dialect semantics observe it through the
    // `Interpreter` contract.
    env: Store<V>,
    pending: Vec<(BlockId, Vec<V>)>,
    returned: Option<V>,
    depended_on_tentative: bool,
}

impl<'p, S, V: AbstractValue> AbstractInterpreter<'p, S, V> {
    pub fn new(pipeline: &'p Pipeline<S>, active: CompileStage) -> AbstractInterpreter<'p, S, V> {
        AbstractInterpreter {
            pipeline,
            active,
            widening: WideningStrategy::AllJoins,
            max_iterations: usize::MAX,
            narrowing_iterations: 0,
            summaries: HashMap::new(),
            in_progress: Vec::new(),
            env: BTreeMap::new(),
            pending: Vec::new(),
            returned: None,
            depended_on_tentative: false,
        }
    }

    pub fn with_widening(mut self, widening: WideningStrategy) -> Self {
        self.widening = widening;
        self
    }

    /// Cap the number of worklist pops per activation (and of tentative
    /// summary sweeps); hitting the cap yields `DidNotConverge`.
    pub fn with_max_iterations(mut self, cap: usize) -> Self {
        self.max_iterations = cap;
        self
    }

    pub fn with_narrowing(mut self, iterations: usize) -> Self {
        self.narrowing_iterations = iterations;
        self
    }

    pub fn get_pipeline(&self) -> &'p Pipeline<S> {
        self.pipeline
    }

    pub fn get_active_stage(&self) -> CompileStage {
        self.active
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

    /// Analyze `callee` at the active stage with the given argument
    /// abstraction, driving recursive callee summaries to commitment.
    pub fn analyze(&mut self, callee: SpecFuncId, args: Vec<V>) -> Result<Analysis<V>, InterpreterError>
    where
        S: DialectSet<Self> + StageList,
    {
        let stage = self.active;
        self.in_progress.push((stage, callee, args.clone()));
        let result = self.analyze_at(stage, callee, args.clone());
        self.in_progress.pop();
        let analysis = result?;
        let dep = mem::replace(&mut self.depended_on_tentative, false);
        self.store_summary(
            stage,
            callee,
            args.clone(),
            Summary {
                ret: analysis.ret.clone(),
                tentative: dep,
            },
        );
        if !self.has_tentative() {
            return Ok(analysis);
        }

        // Re-analyze tentative summaries until a full sweep changes
        // nothing, then commit.
        let mut sweeps = 0usize;
        loop {
            sweeps += 1;
            if sweeps > self.max_iterations {
                return Err(InterpreterError::DidNotConverge);
            }
            let tentative = self
                .summaries
                .iter()
                .flat_map(|((s, c), entries)| {
                    entries
                        .iter()
                        .filter(|(_, summary)| summary.tentative)
                        .map(move |(inputs, _)| (*s, *c, inputs.clone()))
                })
                .collect::<Vec<_>>();
            let mut changed = false;
            for (s, c, inputs) in tentative {
                self.in_progress.push((s, c, inputs.clone()));
                let res = self.analyze_at(s, c, inputs.clone());
                self.in_progress.pop();
                let a = res?;
                let prev = self
                    .lookup_summary_exact(s, c, &inputs)
                    .and_then(|summary| summary.ret.clone());
                if prev != a.ret {
                    changed = true;
                }
                let dep = mem::replace(&mut self.depended_on_tentative, false);
                self.store_summary(
                    s,
                    c,
                    inputs,
                    Summary {
                        ret: a.ret,
                        tentative: dep,
                    },
                );
            }
            if !changed {
                self.commit_all();
                break;
            }
        }

        // One final pass with committed summaries for the root entries.
        self.in_progress.push((stage, callee, args.clone()));
        let res = self.analyze_at(stage, callee, args.clone());
        self.in_progress.pop();
        self.depended_on_tentative = false;
        let final_analysis = res?;
        self.store_summary(
            stage,
            callee,
            args,
            Summary {
                ret: final_analysis.ret.clone(),
                tentative: false,
            },
        );
        Ok(final_analysis)
    }

    fn analyze_at(
        &mut self,
        stage: CompileStage,
        callee: SpecFuncId,
        args: Vec<V>,
    ) -> Result<Analysis<V>, InterpreterError>
    where
        S: DialectSet<Self> + StageList,
    {
        let (entry, params) = {
            let store = self.storage(stage)?;
            let entry = store
                .specialized_entry(callee)
                .map_err(|_| InterpreterError::BadState)?;
            let params = store
                .block_args(entry)
                .map_err(|_| InterpreterError::BadState)?
                .to_vec();
            (entry, params)
        };
        if params.len() != args.len() {
            return Err(InterpreterError::BadState);
        }
        let seed = params
            .into_iter()
            .zip(args)
            .collect::<Store<V>>();
        let mut act = Activation {
            stage,
            entry,
            seed: seed.clone(),
            entries: BTreeMap::new(),
            worklist: VecDeque::new(),
            queued: BTreeSet::new(),
            revisits: BTreeMap::new(),
            ret: None,
            pops: 0,
        };
        act.entries.insert(entry, seed);
        act.enqueue(entry);
        self.ascend(&mut act)?;
        let narrowing_rounds = self.descend(&mut act)?;
        Ok(Analysis {
            entries: act.entries,
            ret: act.ret,
            ascending_pops: act.pops,
            narrowing_rounds,
        })
    }

    fn ascend(&mut self, act: &mut Activation<V>) -> Result<(), InterpreterError>
    where
        S: DialectSet<Self> + StageList,
    {
        while let Some(block) = act.pop() {
            act.pops += 1;
            if act.pops > self.max_iterations {
                return Err(InterpreterError::DidNotConverge);
            }
            trace!(block = block.get_id(), pops = act.pops, "worklist pop");
            let entry_store = act.entries.get(&block).cloned().unwrap_or_default();
            let (out, emissions, ret) = self.transfer(act.stage, block, entry_store)?;
            if let Some(v) = ret {
                act.ret = Some(match act.ret.take() {
                    None => v,
                    Some(acc) => acc.join(&v),
                });
            }
            for (target, vals) in emissions {
                let params = self
                    .storage(act.stage)?
                    .block_args(target)
                    .map_err(|_| InterpreterError::BadState)?
                    .to_vec();
                if params.len() != vals.len() {
                    return Err(InterpreterError::BadState);
                }
                let mut incoming = out.clone();
                for (p, a) in params.into_iter().zip(vals) {
                    incoming.insert(p, a);
                }
                match act.entries.get(&target) {
                    None => {
                        act.entries.insert(target, incoming);
                        act.enqueue(target);
                    }
                    Some(prior) => {
                        let merged = join_store(prior, &incoming);
                        if store_le(&merged, prior) {
                            continue;
                        }
                        let revisits = {
                            let r = act.revisits.entry(target).or_insert(0);
                            *r += 1;
                            *r
                        };
                        let widen_now = match &self.widening {
                            WideningStrategy::AllJoins => true,
                            WideningStrategy::LoopHeaders(headers) => headers.contains(&target),
                            WideningStrategy::DelayedN(k) => revisits >= *k,
                        };
                        let new = if widen_now {
                            debug!(block = target.get_id(), "widening at merge point");
                            widen_store(prior, &merged)?
                        } else {
                            merged
                        };
                        act.entries.insert(target, new);
                        act.enqueue(target);
                    }
                }
            }
        }
        Ok(())
    }

    fn descend(&mut self, act: &mut Activation<V>) -> Result<usize, InterpreterError>
    where
        S: DialectSet<Self> + StageList,
    {
        let mut rounds = 0;
        for _ in 0..self.narrowing_iterations {
            rounds += 1;
            let mut contrib: BTreeMap<BlockId, Store<V>> = BTreeMap::new();
            contrib.insert(act.entry, act.seed.clone());
            let mut ret_acc: Option<V> = None;
            let blocks = act
                .entries
                .iter()
                .map(|(b, s)| (*b, s.clone()))
                .collect::<Vec<_>>();
            for (block, store) in blocks {
                let (out, emissions, ret) = self.transfer(act.stage, block, store)?;
                if let Some(v) = ret {
                    ret_acc = Some(match ret_acc.take() {
                        None => v,
                        Some(acc) => acc.join(&v),
                    });
                }
                for (target, vals) in emissions {
                    let params = self
                        .storage(act.stage)?
                        .block_args(target)
                        .map_err(|_| InterpreterError::BadState)?
                        .to_vec();
                    if params.len() != vals.len() {
                        return Err(InterpreterError::BadState);
                    }
                    let mut incoming = out.clone();
                    for (p, a) in params.into_iter().zip(vals) {
                        incoming.insert(p, a);
                    }
                    match contrib.get(&target) {
                        Some(existing) => {
                            let joined = join_store(existing, &incoming);
                            contrib.insert(target, joined);
                        }
                        None => {
                            contrib.insert(target, incoming);
                        }
                    }
                }
            }
            let mut changed = false;
            for (block, c) in &contrib {
                if let Some(prior) = act.entries.get(block) {
                    let new = narrow_store(prior, c)?;
                    if &new != prior {
                        debug!(block = block.get_id(), "narrowing refined block entry");
                        act.entries.insert(*block, new);
                        changed = true;
                    }
                }
            }
            if let (Some(prior), Some(rec)) = (&act.ret, &ret_acc) {
                let n = prior.narrow(rec);
                if !n.is_subseteq(prior) {
                    return Err(InterpreterError::DidNotConverge);
                }
                if &n != prior {
                    act.ret = Some(n);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        Ok(rounds)
    }

    /// Run one block's statements over `store`, collecting outgoing edge
    /// emissions and any return.
    fn transfer(
        &mut self,
        stage: CompileStage,
        block: BlockId,
        store: Store<V>,
    ) -> Result<(Store<V>, Vec<(BlockId, Vec<V>)>, Option<V>), InterpreterError>
    where
        S: DialectSet<Self> + StageList,
    {
        self.env = store;
        self.pending.clear();
        self.returned = None;
        let mut cursor = self
            .storage(stage)?
            .first_stmt(block)
            .map_err(|_| InterpreterError::BadState)?;
        while let Some(stmt) = cursor {
            let pipeline = self.pipeline;
            let control = pipeline.get_stages().dispatch(stage, stmt, self)?;
            match control {
                Continuation::Continue => {
                    cursor = self
                        .storage(stage)?
                        .next_stmt(stmt)
                        .map_err(|_| InterpreterError::BadState)?;
                    if cursor.is_none() {
                        return Err(InterpreterError::BadState);
                    }
                }
                Continuation::Jump(target, vals) => {
                    self.pending.push((target, vals));
                    break;
                }
                Continuation::Fork(targets) => {
                    self.pending.extend(targets);
                    break;
                }
                Continuation::Return(v) => {
                    self.returned = Some(v);
                    break;
                }
                Continuation::Call {
                    callee,
                    stage: callee_stage,
                    args,
                    result,
                } => {
                    let ret = self.call_summary(callee_stage, callee, args)?;
                    self.env.insert(result, ret);
                    cursor = self
                        .storage(stage)?
                        .next_stmt(stmt)
                        .map_err(|_| InterpreterError::BadState)?;
                    if cursor.is_none() {
                        return Err(InterpreterError::BadState);
                    }
                }
                Continuation::Break | Continuation::Halt => break,
            }
        }
        Ok((
            mem::take(&mut self.env),
            mem::take(&mut self.pending),
            self.returned.take(),
        ))
    }

    /// Serve a call from the summary cache, or recursively analyze the
    /// callee. A call into an in-progress activation returns the current
    /// tentative abstraction (bottom on first encounter) and marks the
    /// caller's summary tentative.
    fn call_summary(
        &mut self,
        stage: CompileStage,
        callee: SpecFuncId,
        args: Vec<V>,
    ) -> Result<V, InterpreterError>
    where
        S: DialectSet<Self> + StageList,
    {
        if let Some(entries) = self.summaries.get(&(stage, callee)) {
            for (inputs, summary) in entries {
                let covers = inputs.len() == args.len()
                    && args.iter().zip(inputs).all(|(a, i)| a.is_subseteq(i));
                if covers {
                    if summary.tentative {
                        self.depended_on_tentative = true;
                    }
                    return Ok(summary.ret.clone().unwrap_or_else(V::bottom));
                }
            }
        }
        let cycle = self.in_progress.iter().any(|(s, c, inputs)| {
            *s == stage
                && *c == callee
                && inputs.len() == args.len()
                && args.iter().zip(inputs).all(|(a, i)| a.is_subseteq(i))
        });
        if cycle {
            debug!(
                stage = stage.get_id(),
                callee = callee.get_id(),
                "recursive call served with tentative bottom"
            );
            self.depended_on_tentative = true;
            return Ok(V::bottom());
        }
        let saved_env = mem::take(&mut self.env);
        let saved_pending = mem::take(&mut self.pending);
        let saved_ret = self.returned.take();
        let saved_dep = mem::replace(&mut self.depended_on_tentative, false);
        self.in_progress.push((stage, callee, args.clone()));
        let result = self.analyze_at(stage, callee, args.clone());
        self.in_progress.pop();
        let dep = mem::replace(&mut self.depended_on_tentative, saved_dep);
        self.env = saved_env;
        self.pending = saved_pending;
        self.returned = saved_ret;
        let analysis = result?;
        let ret = analysis.ret.clone().unwrap_or_else(V::bottom);
        self.store_summary(
            stage,
            callee,
            args,
            Summary {
                ret: analysis.ret,
                tentative: dep,
            },
        );
        if dep {
            self.depended_on_tentative = true;
        }
        Ok(ret)
    }

    fn store_summary(
        &mut self,
        stage: CompileStage,
        callee: SpecFuncId,
        inputs: Vec<V>,
        summary: Summary<V>,
    ) {
        let entries = self.summaries.entry((stage, callee)).or_default();
        for entry in entries.iter_mut() {
            if entry.0 == inputs {
                entry.1 = summary;
                return;
            }
        }
        entries.push((inputs, summary));
    }

    fn lookup_summary_exact(
        &self,
        stage: CompileStage,
        callee: SpecFuncId,
        inputs: &[V],
    ) -> Option<&Summary<V>> {
        self.summaries
            .get(&(stage, callee))?
            .iter()
            .find(|(i, _)| i.as_slice() == inputs)
            .map(|(_, s)| s)
    }

    fn has_tentative(&self) -> bool {
        self.summaries
            .values()
            .any(|entries| entries.iter().any(|(_, s)| s.tentative))
    }

    fn commit_all(&mut self) {
        for entries in self.summaries.values_mut() {
            for (_, summary) in entries.iter_mut() {
                summary.tentative = false;
            }
        }
    }

    /// The committed return abstraction cached for `(callee, stage)`
    /// under inputs covering `args`, if any.
    pub fn cached_summary(&self, stage: CompileStage, callee: SpecFuncId, args: &[V]) -> Option<&V> {
        let entries = self.summaries.get(&(stage, callee))?;
        entries
            .iter()
            .find(|(inputs, _)| {
                inputs.len() == args.len()
                    && args.iter().zip(inputs).all(|(a, i)| a.is_subseteq(i))
            })
            .and_then(|(_, s)| s.ret.as_ref())
    }
}

impl<'p, S, V: AbstractValue> Interpreter for AbstractInterpreter<'p, S, V> {
    type Value = V;
    type Error = InterpreterError;

    fn read_ref(&self, v: Var) -> Result<&V, InterpreterError> {
        self.env.get(&v).ok_or_else(|| InterpreterError::unbound_value(v))
    }

    fn write(&mut self, v: Var, value: V) -> Result<(), InterpreterError> {
        self.env.insert(v, value);
        Ok(())
    }
}
