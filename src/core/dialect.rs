//! The dialect abstraction.
//!
//! A dialect is a value-typed sum whose variants are statement kinds.
//! Each statement carries its dialect payload inline, and interpretation
//! dispatches statically through the enum; there is no registry. Dialects
//! compose by wrapping: a parent enum variant wraps a sub-dialect and
//! forwards all predicates and interpretation (see [`dialect_union!`]).

use crate::core::function::{SpecFuncId, StagedFuncId};
use crate::core::lattice::Lattice;
use crate::core::stage::CompileStage;
use std::fmt::Debug;
use std::hash::Hash;

/// The minimum interface of a dialect's type attribute: clone, equality,
/// hash, and a default placeholder.
pub trait TypeAttr: Clone + Eq + Hash + Debug + Default {}
impl<T> TypeAttr for T where T: Clone + Eq + Hash + Debug + Default {}

/// A type attribute whose values form a lattice, enabling
/// [`LatticeSemantics`](crate::LatticeSemantics) dispatch.
pub trait TypeLattice: TypeAttr + Lattice {}
impl<T> TypeLattice for T where T: TypeAttr + Lattice {}

/// The resolved callee of a call statement, as recorded in its dialect
/// payload. Identifiers are relative to `stage`'s storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTarget {
    pub stage: CompileStage,
    pub staged: StagedFuncId,
    pub specialized: Option<SpecFuncId>,
}

/// A set of statement kinds with property predicates.
///
/// Property semantics:
///
/// - `pure`: no observable side effects; a dead pure statement may be
///   erased.
/// - `speculatable`: requires `pure`; execution with an unused result is
///   safe (no trap). Integer `div`/`rem` are pure but not speculatable.
/// - `terminator`: must appear exactly once, at the tail of its block.
/// - `constant`: the result is determined by the definition payload alone.
pub trait Dialect: Debug + 'static {
    type Type: TypeAttr;

    fn namespace(&self) -> &'static str;
    fn name(&self) -> &'static str;

    fn is_pure(&self) -> bool {
        false
    }

    fn is_speculatable(&self) -> bool {
        false
    }

    fn is_terminator(&self) -> bool {
        false
    }

    fn is_constant(&self) -> bool {
        false
    }

    /// The resolved callee, for statements that are calls. The pipeline
    /// uses this to maintain backedges on insertion and erasure.
    fn call_target(&self) -> Option<CallTarget> {
        None
    }
}

/// Composes sub-dialects into a wrapping sum.
///
/// Generates the wrapper enum, `From` impls for each sub-dialect, a
/// [`Dialect`] impl forwarding every predicate, an
/// [`Interpretable`](crate::Interpretable) impl forwarding to whichever
/// sub-dialect the statement belongs to, and a `Display` impl (each
/// sub-dialect must itself implement `Display`).
///
/// ```ignore
/// dialect_union! {
///     pub enum Lang["lang"]: Ty {
///         Arith(ArithOp),
///         Cf(CfOp),
///     }
/// }
/// ```
#[macro_export]
macro_rules! dialect_union {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident [$ns:literal] : $ty:ty {
            $($variant:ident($sub:ty)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis enum $name {
            $($variant($sub)),+
        }

        $(
            impl ::std::convert::From<$sub> for $name {
                fn from(v: $sub) -> $name {
                    $name::$variant(v)
                }
            }
        )+

        impl $crate::Dialect for $name {
            type Type = $ty;

            fn namespace(&self) -> &'static str {
                $ns
            }

            fn name(&self) -> &'static str {
                match self {
                    $($name::$variant(v) => $crate::Dialect::name(v)),+
                }
            }

            fn is_pure(&self) -> bool {
                match self {
                    $($name::$variant(v) => $crate::Dialect::is_pure(v)),+
                }
            }

            fn is_speculatable(&self) -> bool {
                match self {
                    $($name::$variant(v) => $crate::Dialect::is_speculatable(v)),+
                }
            }

            fn is_terminator(&self) -> bool {
                match self {
                    $($name::$variant(v) => $crate::Dialect::is_terminator(v)),+
                }
            }

            fn is_constant(&self) -> bool {
                match self {
                    $($name::$variant(v) => $crate::Dialect::is_constant(v)),+
                }
            }

            fn call_target(&self) -> ::std::option::Option<$crate::CallTarget> {
                match self {
                    $($name::$variant(v) => $crate::Dialect::call_target(v)),+
                }
            }
        }

        impl<I> $crate::Interpretable<I> for $name
        where
            I: $crate::Interpreter,
            $($sub: $crate::Interpretable<I>),+
        {
            fn interpret(
                &self,
                stmt: &$crate::StmtContext<'_>,
                interp: &mut I,
            ) -> ::std::result::Result<$crate::Continuation<I::Value>, I::Error> {
                match self {
                    $($name::$variant(v) => v.interpret(stmt, interp)),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                match self {
                    $($name::$variant(v) => ::std::fmt::Display::fmt(v, f)),+
                }
            }
        }
    };
}
