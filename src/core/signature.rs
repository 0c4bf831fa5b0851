//! Function signatures and the specialization dispatch policy.
//!
//! A [`SignatureSemantics`] decides whether a specialization can serve a
//! call (`applicable`) and partially orders applicable candidates
//! (`cmp_candidate`). Resolution keeps the candidates no other candidate
//! strictly dominates; ambiguity is surfaced as data, never silently
//! tie-broken.

use crate::core::dialect::TypeLattice;
use crate::core::function::SpecFuncId;
use alloc::vec::Vec;
use std::fmt;

/// A function signature in one stage's type system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature<T, C = ()> {
    params: Vec<T>,
    ret: T,
    constraints: C,
}

impl<T> Signature<T> {
    pub fn new(params: Vec<T>, ret: T) -> Signature<T> {
        Signature {
            params,
            ret,
            constraints: (),
        }
    }
}

impl<T, C> Signature<T, C> {
    pub fn with_constraints(params: Vec<T>, ret: T, constraints: C) -> Signature<T, C> {
        Signature {
            params,
            ret,
            constraints,
        }
    }

    pub fn get_params(&self) -> &[T] {
        &self.params
    }

    pub fn get_ret(&self) -> &T {
        &self.ret
    }

    pub fn get_constraints(&self) -> &C {
        &self.constraints
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl<T, C> fmt::Display for Signature<T, C>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        let l = self.params.len();
        for (ind, t) in self.params.iter().enumerate() {
            match ind == l - 1 {
                true => write!(f, "{}", t)?,
                false => write!(f, "{}, ", t)?,
            };
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Relative specificity of two applicable candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrd {
    /// The left candidate is strictly more specific.
    More,
    /// The left candidate is strictly less specific.
    Less,
    Equal,
    Incomparable,
}

/// Policy deciding applicability and specificity of specializations
/// against a call signature.
pub trait SignatureSemantics<T, C = ()> {
    /// Solved bindings produced by a successful applicability check.
    type Env;

    /// Whether `candidate` can serve `call`; `Some` carries the solved
    /// bindings.
    fn applicable(&self, call: &Signature<T, C>, candidate: &Signature<T, C>)
        -> Option<Self::Env>;

    /// Partial order on applicable candidates.
    fn cmp_candidate(
        &self,
        a: &Signature<T, C>,
        a_env: &Self::Env,
        b: &Signature<T, C>,
        b_env: &Self::Env,
    ) -> CandidateOrd;
}

/// Component-wise equality; candidates are never ordered.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactSemantics;

impl<T, C> SignatureSemantics<T, C> for ExactSemantics
where
    T: PartialEq,
{
    type Env = ();

    fn applicable(&self, call: &Signature<T, C>, candidate: &Signature<T, C>) -> Option<()> {
        (call.get_params() == candidate.get_params() && call.get_ret() == candidate.get_ret())
            .then(|| ())
    }

    fn cmp_candidate(
        &self,
        a: &Signature<T, C>,
        _a_env: &(),
        b: &Signature<T, C>,
        _b_env: &(),
    ) -> CandidateOrd {
        if a.get_params() == b.get_params() && a.get_ret() == b.get_ret() {
            CandidateOrd::Equal
        } else {
            CandidateOrd::Incomparable
        }
    }
}

/// Pointwise `is_subseteq`: a candidate is applicable when every call
/// parameter and the call return are below the candidate's, and more
/// specific when it is pointwise below another candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatticeSemantics;

fn pointwise_le<T: TypeLattice, C>(a: &Signature<T, C>, b: &Signature<T, C>) -> bool {
    a.arity() == b.arity()
        && a.get_params()
            .iter()
            .zip(b.get_params())
            .all(|(x, y)| x.is_subseteq(y))
        && a.get_ret().is_subseteq(b.get_ret())
}

impl<T, C> SignatureSemantics<T, C> for LatticeSemantics
where
    T: TypeLattice,
{
    type Env = ();

    fn applicable(&self, call: &Signature<T, C>, candidate: &Signature<T, C>) -> Option<()> {
        pointwise_le(call, candidate).then(|| ())
    }

    fn cmp_candidate(
        &self,
        a: &Signature<T, C>,
        _a_env: &(),
        b: &Signature<T, C>,
        _b_env: &(),
    ) -> CandidateOrd {
        match (pointwise_le(a, b), pointwise_le(b, a)) {
            (true, true) => CandidateOrd::Equal,
            (true, false) => CandidateOrd::More,
            (false, true) => CandidateOrd::Less,
            (false, false) => CandidateOrd::Incomparable,
        }
    }
}

/// Dispatch failure, surfaced to the caller as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No live specialization is applicable.
    NoMatch,
    /// More than one maximal candidate remains; the set is sorted so the
    /// outcome is independent of insertion order.
    Ambiguous(Vec<SpecFuncId>),
    /// The staged function handle does not address a live entry.
    UnknownFunction,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DispatchError::NoMatch => write!(f, "no applicable specialization"),
            DispatchError::Ambiguous(cands) => {
                write!(f, "ambiguous dispatch between {:?}", cands)
            }
            DispatchError::UnknownFunction => write!(f, "unknown staged function"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Reduce applicable candidates to the ones no other candidate strictly
/// dominates, then demand uniqueness.
pub(crate) fn reduce_candidates<T, C, Sem>(
    sem: &Sem,
    mut applicable: Vec<(SpecFuncId, Signature<T, C>, Sem::Env)>,
) -> Result<(SpecFuncId, Sem::Env), DispatchError>
where
    Sem: SignatureSemantics<T, C>,
{
    if applicable.is_empty() {
        return Err(DispatchError::NoMatch);
    }
    let dominated = applicable
        .iter()
        .map(|(id, sig, env)| {
            applicable.iter().any(|(other_id, other_sig, other_env)| {
                other_id != id
                    && matches!(
                        sem.cmp_candidate(other_sig, other_env, sig, env),
                        CandidateOrd::More
                    )
            })
        })
        .collect::<Vec<_>>();
    let mut kept = applicable
        .drain(..)
        .zip(dominated)
        .filter_map(|(cand, dom)| (!dom).then(|| cand))
        .collect::<Vec<_>>();
    match (kept.len(), kept.pop()) {
        (_, None) => Err(DispatchError::NoMatch),
        (1, Some((id, _, env))) => Ok((id, env)),
        (_, Some(last)) => {
            kept.push(last);
            let mut ids = kept.into_iter().map(|(id, _, _)| id).collect::<Vec<_>>();
            ids.sort();
            Err(DispatchError::Ambiguous(ids))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::arena::EntityId;
    use crate::core::lattice::Lattice;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    enum Num {
        #[default]
        Bottom,
        Pos,
        Int,
        Top,
    }

    impl Num {
        fn rank(self) -> u8 {
            match self {
                Num::Bottom => 0,
                Num::Pos => 1,
                Num::Int => 2,
                Num::Top => 3,
            }
        }
    }

    impl Lattice for Num {
        fn top() -> Num {
            Num::Top
        }

        fn bottom() -> Num {
            Num::Bottom
        }

        fn join(&self, other: &Num) -> Num {
            if self.rank() >= other.rank() {
                *self
            } else {
                *other
            }
        }

        fn meet(&self, other: &Num) -> Num {
            if self.rank() <= other.rank() {
                *self
            } else {
                *other
            }
        }

        fn is_subseteq(&self, other: &Num) -> bool {
            self.rank() <= other.rank()
        }
    }

    #[test]
    fn exact_semantics_never_orders() {
        let sem = ExactSemantics;
        let a = Signature::new(vec![Num::Int, Num::Int], Num::Int);
        let b = Signature::new(vec![Num::Pos, Num::Pos], Num::Pos);
        assert!(SignatureSemantics::<Num>::applicable(&sem, &a, &a).is_some());
        assert!(SignatureSemantics::<Num>::applicable(&sem, &a, &b).is_none());
        assert_eq!(sem.cmp_candidate(&a, &(), &b, &()), CandidateOrd::Incomparable);
        assert_eq!(sem.cmp_candidate(&a, &(), &a, &()), CandidateOrd::Equal);
    }

    #[test]
    fn lattice_semantics_orders_pointwise() {
        let sem = LatticeSemantics;
        let wide = Signature::new(vec![Num::Int, Num::Int], Num::Int);
        let narrow = Signature::new(vec![Num::Pos, Num::Pos], Num::Pos);
        assert!(SignatureSemantics::<Num>::applicable(&sem, &narrow, &wide).is_some());
        assert!(SignatureSemantics::<Num>::applicable(&sem, &wide, &narrow).is_none());
        assert_eq!(sem.cmp_candidate(&narrow, &(), &wide, &()), CandidateOrd::More);
        assert_eq!(sem.cmp_candidate(&wide, &(), &narrow, &()), CandidateOrd::Less);
    }

    #[test]
    fn reduction_is_insertion_order_independent() {
        let sem = LatticeSemantics;
        let wide = Signature::new(vec![Num::Int], Num::Int);
        let narrow = Signature::new(vec![Num::Pos], Num::Pos);
        let f0 = SpecFuncId::from_raw(0);
        let f1 = SpecFuncId::from_raw(1);
        for (first, second) in [
            ((f0, wide.clone()), (f1, narrow.clone())),
            ((f1, narrow.clone()), (f0, wide.clone())),
        ] {
            let cands = vec![
                (first.0, first.1.clone(), ()),
                (second.0, second.1.clone(), ()),
            ];
            let (winner, _) = reduce_candidates(&sem, cands).unwrap();
            assert_eq!(winner, f1);
        }
    }

    #[test]
    fn equal_candidates_are_ambiguous_as_a_set() {
        let sem = LatticeSemantics;
        let sig = Signature::new(vec![Num::Int], Num::Int);
        let f0 = SpecFuncId::from_raw(0);
        let f1 = SpecFuncId::from_raw(1);
        for order in [[f0, f1], [f1, f0]] {
            let cands = order
                .iter()
                .map(|id| (*id, sig.clone(), ()))
                .collect::<Vec<_>>();
            let err = reduce_candidates(&sem, cands).unwrap_err();
            assert_eq!(err, DispatchError::Ambiguous(vec![f0, f1]));
        }
    }
}
