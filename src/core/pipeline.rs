//! The pipeline: a directed graph of compile stages, each owning storage
//! for one dialect, plus the cross-stage symbol and function tables.
//!
//! The stage set is a type-level list of [`StageCell`]s, so `get_stage`
//! returns a fully typed `&StageInfo<L>` with zero dynamic dispatch. A
//! parallel runtime surface ([`StageStorage`], [`StageList::find`])
//! routes through the stage tag at runtime and recovers the typed view
//! by downcast where needed; this is what lets mixed-stage call chains
//! (`A → C → B → A`) keep per-frame stage fidelity.

use crate::core::arena::{Arena, ArenaError, IdMap};
use crate::core::dialect::Dialect;
use crate::core::function::{
    Backedge, FuncId, Function, FunctionError, SpecFuncId, SpecializeConflict, StagedConflict,
    StagedFuncId,
};
use crate::core::intern::{GlobalSymbol, InternTable};
use crate::core::interpreter::{
    Continuation, DialectSet, Interpretable, Interpreter, InterpreterErrors, NoFrameReason,
    StmtContext,
};
use crate::core::ir::{BlockId, IRError, RegionId, StmtId, Var};
use crate::core::signature::{DispatchError, Signature, SignatureSemantics};
use crate::core::stage::{CompileStage, StageInfo};
use downcast_rs::{impl_downcast, Downcast};
use std::collections::HashMap;
use std::fmt::Debug;
use std::marker::PhantomData;

/// A type-level stage identity: a user-declared unit type naming one
/// stage of the pipeline. Declared with [`stages!`](crate::stages!).
pub trait StageIdentity: Copy + Debug + 'static {
    const NAME: &'static str;
}

/// Declares type-level stage identities.
///
/// ```ignore
/// kirin::stages! {
///     pub stage Source = "src";
///     pub stage Typed = "typed";
/// }
/// ```
#[macro_export]
macro_rules! stages {
    ($($(#[$m:meta])* $vis:vis stage $name:ident = $sym:literal;)+) => {
        $(
            $(#[$m])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq)]
            $vis struct $name;

            impl $crate::StageIdentity for $name {
                const NAME: &'static str = $sym;
            }
        )+
    };
}

/// Live per-stage counts, for summaries and displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageCounts {
    pub values: usize,
    pub stmts: usize,
    pub blocks: usize,
    pub regions: usize,
    pub staged: usize,
    pub specialized: usize,
}

/// The object-safe runtime view of one stage's storage: everything the
/// drivers need for cursor mechanics and backedge maintenance without
/// knowing the stage's dialect. Recover the typed view with
/// `downcast_ref::<StageInfo<L>>()`.
pub trait StageStorage: Downcast {
    fn stage(&self) -> CompileStage;
    fn symbol(&self) -> &str;
    fn counts(&self) -> StorageCounts;
    fn block_args(&self, b: BlockId) -> Result<&[Var], IRError>;
    fn first_stmt(&self, b: BlockId) -> Result<Option<StmtId>, IRError>;
    fn next_stmt(&self, s: StmtId) -> Result<Option<StmtId>, IRError>;
    fn stmt_is_terminator(&self, s: StmtId) -> Result<bool, IRError>;
    fn specialized_entry(&self, f: SpecFuncId) -> Result<BlockId, IRError>;
    fn add_backedge(
        &mut self,
        staged: StagedFuncId,
        specialized: Option<SpecFuncId>,
        edge: Backedge,
    ) -> Result<(), IRError>;
    fn remove_backedge(
        &mut self,
        staged: StagedFuncId,
        specialized: Option<SpecFuncId>,
        edge: Backedge,
    ) -> Result<(), IRError>;
    fn remap_backedges_from(&mut self, stage: CompileStage, stmts: &IdMap<StmtId>);
}
impl_downcast!(StageStorage);

impl<L: Dialect> StageStorage for StageInfo<L> {
    fn stage(&self) -> CompileStage {
        StageInfo::get_stage(self)
    }

    fn symbol(&self) -> &str {
        StageInfo::get_name(self)
    }

    fn counts(&self) -> StorageCounts {
        StageInfo::live_counts(self)
    }

    fn block_args(&self, b: BlockId) -> Result<&[Var], IRError> {
        StageInfo::block_args(self, b)
    }

    fn first_stmt(&self, b: BlockId) -> Result<Option<StmtId>, IRError> {
        StageInfo::first_stmt(self, b)
    }

    fn next_stmt(&self, s: StmtId) -> Result<Option<StmtId>, IRError> {
        StageInfo::next_stmt(self, s)
    }

    fn stmt_is_terminator(&self, s: StmtId) -> Result<bool, IRError> {
        StageInfo::stmt_is_terminator(self, s)
    }

    fn specialized_entry(&self, f: SpecFuncId) -> Result<BlockId, IRError> {
        StageInfo::specialized_entry(self, f)
    }

    fn add_backedge(
        &mut self,
        staged: StagedFuncId,
        specialized: Option<SpecFuncId>,
        edge: Backedge,
    ) -> Result<(), IRError> {
        StageInfo::add_backedge(self, staged, specialized, edge)
    }

    fn remove_backedge(
        &mut self,
        staged: StagedFuncId,
        specialized: Option<SpecFuncId>,
        edge: Backedge,
    ) -> Result<(), IRError> {
        StageInfo::remove_backedge(self, staged, specialized, edge)
    }

    fn remap_backedges_from(&mut self, stage: CompileStage, stmts: &IdMap<StmtId>) {
        StageInfo::remap_backedges_from(self, stage, stmts)
    }
}

/// One stage of the pipeline: its identity, runtime tag, and storage.
#[derive(Debug)]
pub struct StageCell<Id: StageIdentity, L: Dialect> {
    stage: CompileStage,
    info: StageInfo<L>,
    _id: PhantomData<Id>,
}

impl<Id: StageIdentity, L: Dialect> StageCell<Id, L> {
    fn new(stage: CompileStage) -> StageCell<Id, L> {
        StageCell {
            stage,
            info: StageInfo::new(stage, Id::NAME),
            _id: PhantomData,
        }
    }

    pub fn get_stage(&self) -> CompileStage {
        self.stage
    }

    pub fn get_info(&self) -> &StageInfo<L> {
        &self.info
    }

    pub fn get_info_mut(&mut self) -> &mut StageInfo<L> {
        &mut self.info
    }
}

/// The empty stage list.
#[derive(Debug, Default)]
pub struct HNil;

/// A stage list cell.
#[derive(Debug)]
pub struct HCons<H, T> {
    pub head: H,
    pub tail: T,
}

/// Type-level index of the head.
#[derive(Debug, Clone, Copy)]
pub struct Here;

/// Type-level index into the tail.
#[derive(Debug, Clone, Copy)]
pub struct There<I>(PhantomData<I>);

/// Typed selection of one stage cell by its identity. The `Index`
/// parameter is inferred; call sites write `get_stage::<Id, _>()`.
pub trait Selector<Id: StageIdentity, Index> {
    type Lang: Dialect;

    fn select(&self) -> &StageCell<Id, Self::Lang>;
    fn select_mut(&mut self) -> &mut StageCell<Id, Self::Lang>;
}

impl<Id: StageIdentity, L: Dialect, Tail> Selector<Id, Here> for HCons<StageCell<Id, L>, Tail> {
    type Lang = L;

    fn select(&self) -> &StageCell<Id, L> {
        &self.head
    }

    fn select_mut(&mut self) -> &mut StageCell<Id, L> {
        &mut self.head
    }
}

impl<Id: StageIdentity, Head, Tail, I> Selector<Id, There<I>> for HCons<Head, Tail>
where
    Tail: Selector<Id, I>,
{
    type Lang = Tail::Lang;

    fn select(&self) -> &StageCell<Id, Self::Lang> {
        self.tail.select()
    }

    fn select_mut(&mut self) -> &mut StageCell<Id, Self::Lang> {
        self.tail.select_mut()
    }
}

/// Runtime iteration and lookup over the stage list.
pub trait StageList {
    fn find(&self, stage: CompileStage) -> Option<&dyn StageStorage>;
    fn find_mut(&mut self, stage: CompileStage) -> Option<&mut dyn StageStorage>;
    fn for_each(&self, f: &mut dyn FnMut(&dyn StageStorage));
    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut dyn StageStorage));

    fn count(&self) -> usize {
        let mut n = 0;
        self.for_each(&mut |_| n += 1);
        n
    }
}

impl StageList for HNil {
    fn find(&self, _stage: CompileStage) -> Option<&dyn StageStorage> {
        None
    }

    fn find_mut(&mut self, _stage: CompileStage) -> Option<&mut dyn StageStorage> {
        None
    }

    fn for_each(&self, _f: &mut dyn FnMut(&dyn StageStorage)) {}

    fn for_each_mut(&mut self, _f: &mut dyn FnMut(&mut dyn StageStorage)) {}
}

impl<Id: StageIdentity, L: Dialect, Tail: StageList> StageList for HCons<StageCell<Id, L>, Tail> {
    fn find(&self, stage: CompileStage) -> Option<&dyn StageStorage> {
        if self.head.get_stage() == stage {
            Some(self.head.get_info())
        } else {
            self.tail.find(stage)
        }
    }

    fn find_mut(&mut self, stage: CompileStage) -> Option<&mut dyn StageStorage> {
        if self.head.get_stage() == stage {
            Some(self.head.get_info_mut())
        } else {
            self.tail.find_mut(stage)
        }
    }

    fn for_each(&self, f: &mut dyn FnMut(&dyn StageStorage)) {
        f(self.head.get_info());
        self.tail.for_each(f);
    }

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut dyn StageStorage)) {
        f(self.head.get_info_mut());
        self.tail.for_each_mut(f);
    }
}

impl<I: Interpreter> DialectSet<I> for HNil {
    fn dispatch(
        &self,
        stage: CompileStage,
        _stmt: StmtId,
        _interp: &mut I,
    ) -> Result<Continuation<I::Value>, I::Error> {
        Err(I::Error::stage_mismatch(None, stage))
    }
}

impl<Id, L, Tail, I> DialectSet<I> for HCons<StageCell<Id, L>, Tail>
where
    Id: StageIdentity,
    L: Dialect + Interpretable<I>,
    Tail: DialectSet<I>,
    I: Interpreter,
{
    fn dispatch(
        &self,
        stage: CompileStage,
        stmt: StmtId,
        interp: &mut I,
    ) -> Result<Continuation<I::Value>, I::Error> {
        if self.head.get_stage() != stage {
            return self.tail.dispatch(stage, stmt, interp);
        }
        let st = self
            .head
            .get_info()
            .get_statement(stmt)
            .map_err(|_| I::Error::no_frame(NoFrameReason::BadState))?;
        let ctx = StmtContext {
            stmt,
            operands: st.get_operands(),
            results: st.get_results(),
            successors: st.get_successors(),
            regions: st.get_regions(),
        };
        st.def().interpret(&ctx, interp)
    }
}

/// Builds a [`Pipeline`] by registering stages; each registration changes
/// the type of the builder, growing the type-level stage list.
#[derive(Debug)]
pub struct PipelineBuilder<S> {
    stages: S,
    next: u32,
}

impl PipelineBuilder<HNil> {
    pub fn new() -> PipelineBuilder<HNil> {
        PipelineBuilder {
            stages: HNil,
            next: 0,
        }
    }
}

impl Default for PipelineBuilder<HNil> {
    fn default() -> PipelineBuilder<HNil> {
        PipelineBuilder::new()
    }
}

impl<S> PipelineBuilder<S> {
    /// Register a stage hosting dialect `L` under identity `Id`.
    pub fn stage<Id: StageIdentity, L: Dialect>(self) -> PipelineBuilder<HCons<StageCell<Id, L>, S>> {
        let cell = StageCell::new(CompileStage::new(self.next));
        PipelineBuilder {
            stages: HCons {
                head: cell,
                tail: self.stages,
            },
            next: self.next + 1,
        }
    }

    pub fn finish(self) -> Pipeline<S> {
        Pipeline {
            stages: self.stages,
            edges: Vec::new(),
            symbols: InternTable::new(),
            functions: Arena::new(),
            by_name: HashMap::new(),
        }
    }
}

type StageLang<S, Id, Ix> = <S as Selector<Id, Ix>>::Lang;
type StageType<S, Id, Ix> = <<S as Selector<Id, Ix>>::Lang as Dialect>::Type;

/// The pipeline: the stage set, informational lowering edges, the global
/// symbol table, and the function table mapping each function to its
/// per-stage entries.
#[derive(Debug)]
pub struct Pipeline<S> {
    pub(crate) stages: S,
    edges: Vec<(CompileStage, CompileStage)>,
    pub(crate) symbols: InternTable<String, GlobalSymbol>,
    pub(crate) functions: Arena<FuncId, Function>,
    by_name: HashMap<GlobalSymbol, FuncId>,
}

impl Pipeline<HNil> {
    pub fn builder() -> PipelineBuilder<HNil> {
        PipelineBuilder::new()
    }
}

impl<S> Pipeline<S> {
    /// The stage list, for interpretation dispatch.
    pub fn get_stages(&self) -> &S {
        &self.stages
    }

    /// Typed stage lookup by identity.
    pub fn get_stage<Id: StageIdentity, Ix>(&self) -> &StageInfo<StageLang<S, Id, Ix>>
    where
        S: Selector<Id, Ix>,
    {
        <S as Selector<Id, Ix>>::select(&self.stages).get_info()
    }

    pub fn get_stage_mut<Id: StageIdentity, Ix>(&mut self) -> &mut StageInfo<StageLang<S, Id, Ix>>
    where
        S: Selector<Id, Ix>,
    {
        <S as Selector<Id, Ix>>::select_mut(&mut self.stages).get_info_mut()
    }

    pub fn get_stage_id<Id: StageIdentity, Ix>(&self) -> CompileStage
    where
        S: Selector<Id, Ix>,
    {
        <S as Selector<Id, Ix>>::select(&self.stages).get_stage()
    }

    /// Runtime stage lookup by tag.
    pub fn get_stage_dyn(&self, stage: CompileStage) -> Option<&dyn StageStorage>
    where
        S: StageList,
    {
        self.stages.find(stage)
    }

    pub fn get_stage_dyn_mut(&mut self, stage: CompileStage) -> Option<&mut dyn StageStorage>
    where
        S: StageList,
    {
        self.stages.find_mut(stage)
    }

    /// Record an informational lowering edge between two stages.
    pub fn add_lowering_edge(&mut self, from: CompileStage, to: CompileStage) {
        if !self.edges.contains(&(from, to)) {
            self.edges.push((from, to));
        }
    }

    pub fn get_lowering_edges(&self) -> &[(CompileStage, CompileStage)] {
        &self.edges
    }

    /////
    ///// Global symbols and functions.
    /////

    pub fn global_symbol(&mut self, name: &str) -> GlobalSymbol {
        self.symbols.intern(name.to_string())
    }

    pub fn lookup_global(&self, sym: GlobalSymbol) -> Result<&str, ArenaError> {
        self.symbols.lookup(sym).map(|s| s.as_str())
    }

    pub fn resolve_global(&self, name: &str) -> Option<GlobalSymbol> {
        self.symbols.resolve(&name.to_string())
    }

    /// Create-or-return the function registered under `name`.
    pub fn function(&mut self, name: &str) -> FuncId {
        let sym = self.symbols.intern(name.to_string());
        match self.by_name.get(&sym) {
            Some(f) => *f,
            None => {
                let f = self.functions.alloc(Function::new(sym));
                self.by_name.insert(sym, f);
                f
            }
        }
    }

    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        let sym = self.symbols.resolve(&name.to_string())?;
        self.by_name.get(&sym).copied()
    }

    pub fn get_function(&self, f: FuncId) -> Result<&Function, ArenaError> {
        self.functions.get(f)
    }

    /// Attach a staged signature for `name` at stage `Id`; see
    /// [`StageInfo::staged_function`].
    pub fn staged_function<Id: StageIdentity, Ix>(
        &mut self,
        name: &str,
        sig: Signature<StageType<S, Id, Ix>>,
    ) -> Result<StagedFuncId, FunctionError<StageType<S, Id, Ix>>>
    where
        S: Selector<Id, Ix>,
    {
        let fid = self.function(name);
        let sym = self.symbols.intern(name.to_string());
        let Pipeline {
            functions, stages, ..
        } = self;
        let func = functions
            .get_mut(fid)
            .map_err(|_| FunctionError::UnknownSymbol(sym))?;
        let cell = <S as Selector<Id, Ix>>::select_mut(stages);
        cell.get_info_mut().staged_function(func, fid, sig)
    }

    /// Opt-in resolution of a [`StagedConflict`].
    pub fn redefine_staged_function<Id: StageIdentity, Ix>(
        &mut self,
        conflict: StagedConflict<StageType<S, Id, Ix>>,
    ) -> Result<StagedFuncId, FunctionError<StageType<S, Id, Ix>>>
    where
        S: Selector<Id, Ix>,
    {
        let fid = self
            .by_name
            .get(&conflict.name)
            .copied()
            .ok_or(FunctionError::UnknownSymbol(conflict.name))?;
        let Pipeline {
            functions, stages, ..
        } = self;
        let func = functions
            .get_mut(fid)
            .map_err(|_| FunctionError::UnknownSymbol(conflict.name))?;
        let cell = <S as Selector<Id, Ix>>::select_mut(stages);
        cell.get_info_mut().redefine_staged_function(func, conflict)
    }

    /// Append a specialization of `name` at stage `Id`; see
    /// [`StageInfo::specialize`].
    pub fn specialize<Id: StageIdentity, Ix, Sem>(
        &mut self,
        name: &str,
        sig: Signature<StageType<S, Id, Ix>>,
        body: RegionId,
        sem: &Sem,
    ) -> Result<SpecFuncId, FunctionError<StageType<S, Id, Ix>>>
    where
        S: Selector<Id, Ix>,
        Sem: SignatureSemantics<StageType<S, Id, Ix>>,
    {
        let sym = self.symbols.intern(name.to_string());
        let info = <S as Selector<Id, Ix>>::select_mut(&mut self.stages).get_info_mut();
        let staged = info
            .resolve_staged(sym)
            .ok_or(FunctionError::UnknownSymbol(sym))?;
        info.specialize(staged, sig, body, sem)
    }

    /// Opt-in resolution of a [`SpecializeConflict`].
    pub fn redefine_specialization<Id: StageIdentity, Ix>(
        &mut self,
        conflict: SpecializeConflict<StageType<S, Id, Ix>>,
    ) -> Result<SpecFuncId, FunctionError<StageType<S, Id, Ix>>>
    where
        S: Selector<Id, Ix>,
    {
        let info = <S as Selector<Id, Ix>>::select_mut(&mut self.stages).get_info_mut();
        info.redefine_specialization(conflict)
    }

    /// Resolve a call signature against `name`'s specializations at stage
    /// `Id`.
    pub fn resolve<Id: StageIdentity, Ix, Sem>(
        &self,
        name: &str,
        call: &Signature<StageType<S, Id, Ix>>,
        sem: &Sem,
    ) -> Result<(SpecFuncId, Sem::Env), DispatchError>
    where
        S: Selector<Id, Ix>,
        Sem: SignatureSemantics<StageType<S, Id, Ix>>,
    {
        let sym = self
            .symbols
            .resolve(&name.to_string())
            .ok_or(DispatchError::UnknownFunction)?;
        let info = <S as Selector<Id, Ix>>::select(&self.stages).get_info();
        let staged = info
            .resolve_staged(sym)
            .ok_or(DispatchError::UnknownFunction)?;
        info.resolve(staged, call, sem)
    }
}
