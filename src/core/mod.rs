//! Core functionality: the arena-backed structural IR, the dialect
//! abstraction, the staged function model, the stage pipeline, and the
//! concrete/abstract interpretation engines.

mod absint;
mod arena;
mod builder;
mod concrete;
mod diagnostics;
mod dialect;
mod display;
mod function;
mod intern;
mod interpreter;
mod ir;
mod lattice;
mod pipeline;
mod rewrite;
mod signature;
mod stage;

// Public API.
pub use self::{
    absint::{loop_headers, AbstractInterpreter, Analysis, WideningStrategy},
    arena::{Arena, ArenaError, EntityId, IdMap},
    builder::FunctionBuilder,
    concrete::{Paused, StackInterpreter},
    diagnostics::{diagnostics_color_disable, diagnostics_setup},
    dialect::{CallTarget, Dialect, TypeAttr, TypeLattice},
    display::RegionDisplay,
    function::{
        Backedge, FuncId, Function, FunctionError, SpecFuncId, SpecializeConflict,
        SpecializedFunction, StagedConflict, StagedFuncId, StagedFunction,
    },
    intern::{GlobalSymbol, InternTable, Symbol},
    interpreter::{
        Continuation, DialectSet, Frame, Interpretable, Interpreter, InterpreterError,
        InterpreterErrors, NoFrameReason, Progress, StmtContext,
    },
    ir::{Block, BlockId, IRError, Region, RegionId, SSAValue, Statement, StmtId, Use, ValueKind, Var},
    lattice::{check_abstract_value_laws, check_lattice_laws, AbstractValue, Lattice, LawViolation},
    pipeline::{
        HCons, HNil, Here, Pipeline, PipelineBuilder, Selector, StageCell, StageIdentity,
        StageList, StageStorage, StorageCounts, There,
    },
    signature::{
        CandidateOrd, DispatchError, ExactSemantics, LatticeSemantics, Signature,
        SignatureSemantics,
    },
    stage::{CompactionMaps, CompileStage, StageInfo, WalkFlow},
};
