//! Lattice algebra for type attributes and abstract-interpretation
//! domains, plus a property harness that checks the laws over
//! user-submitted sample values.

use std::fmt;

/// A bounded lattice.
///
/// Implementations must satisfy the usual laws:
///
/// - `join` and `meet` are associative, commutative and idempotent;
/// - `bottom` is the unit of `join` and `top` the unit of `meet`;
/// - `is_subseteq` is a partial order consistent with `meet`:
///   `a.is_subseteq(b)` iff `a.meet(b) == a`.
///
/// Violations are a programmer error; [`check_lattice_laws`] verifies a
/// sample of values.
pub trait Lattice: Sized {
    fn top() -> Self;
    fn bottom() -> Self;
    fn join(&self, other: &Self) -> Self;
    fn meet(&self, other: &Self) -> Self;
    fn is_subseteq(&self, other: &Self) -> bool;
}

/// A lattice element usable as an abstract-interpretation domain.
///
/// `widen` accelerates ascending chains: it must satisfy
/// `self ⊑ widen(self, next)` and `next ⊑ widen(self, next)`, and the
/// chain `x₀, widen(x₀, x₁), widen(·, x₂), …` must stabilize in finitely
/// many steps. `narrow` refines a post-fixpoint downward and must satisfy
/// `self ⊓ next ⊑ narrow(self, next) ⊑ self`; the default is the identity
/// on `self`, which trivially satisfies both bounds.
pub trait AbstractValue: Lattice + Clone + PartialEq {
    fn widen(&self, next: &Self) -> Self;

    fn narrow(&self, _next: &Self) -> Self {
        self.clone()
    }
}

/// A lattice law that failed over specific sample values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LawViolation {
    pub law: &'static str,
    pub detail: String,
}

impl fmt::Display for LawViolation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "lattice law `{}` violated: {}", self.law, self.detail)
    }
}

impl std::error::Error for LawViolation {}

fn violation<V: fmt::Debug>(law: &'static str, vs: &[&V]) -> LawViolation {
    LawViolation {
        law,
        detail: format!("over {:?}", vs),
    }
}

/// Check the [`Lattice`] laws over every pair and triple drawn from
/// `samples`. Quadratic/cubic in the sample count; intended for tests.
pub fn check_lattice_laws<V>(samples: &[V]) -> Result<(), LawViolation>
where
    V: Lattice + PartialEq + fmt::Debug,
{
    let top = V::top();
    let bottom = V::bottom();
    for a in samples {
        if a.join(a) != *a {
            return Err(violation("join idempotence", &[a]));
        }
        if a.meet(a) != *a {
            return Err(violation("meet idempotence", &[a]));
        }
        if !a.is_subseteq(&top) {
            return Err(violation("top bounds", &[a]));
        }
        if !bottom.is_subseteq(a) {
            return Err(violation("bottom bounds", &[a]));
        }
        if a.join(&bottom) != *a {
            return Err(violation("join unit", &[a]));
        }
        if a.meet(&top) != *a {
            return Err(violation("meet unit", &[a]));
        }
    }
    for a in samples {
        for b in samples {
            if a.join(b) != b.join(a) {
                return Err(violation("join commutativity", &[a, b]));
            }
            if a.meet(b) != b.meet(a) {
                return Err(violation("meet commutativity", &[a, b]));
            }
            // The order must be consistent with meet.
            if a.is_subseteq(b) != (a.meet(b) == *a) {
                return Err(violation("order/meet consistency", &[a, b]));
            }
            // Antisymmetry.
            if a.is_subseteq(b) && b.is_subseteq(a) && a != b {
                return Err(violation("order antisymmetry", &[a, b]));
            }
            // Absorption by join/meet.
            if !a.is_subseteq(&a.join(b)) {
                return Err(violation("join upper bound", &[a, b]));
            }
            if !a.meet(b).is_subseteq(a) {
                return Err(violation("meet lower bound", &[a, b]));
            }
        }
    }
    for a in samples {
        for b in samples {
            for c in samples {
                if a.join(&b.join(c)) != a.join(b).join(c) {
                    return Err(violation("join associativity", &[a, b, c]));
                }
                if a.meet(&b.meet(c)) != a.meet(b).meet(c) {
                    return Err(violation("meet associativity", &[a, b, c]));
                }
            }
        }
    }
    Ok(())
}

/// Check the [`AbstractValue`] contracts over `samples`: widening bounds
/// both arguments, every widening chain through the samples stabilizes
/// within `chain_cap` steps, and narrowing stays inside its bracket.
pub fn check_abstract_value_laws<V>(samples: &[V], chain_cap: usize) -> Result<(), LawViolation>
where
    V: AbstractValue + fmt::Debug,
{
    for a in samples {
        for b in samples {
            let w = a.widen(b);
            if !a.is_subseteq(&w) || !b.is_subseteq(&w) {
                return Err(violation("widen upper bound", &[a, b]));
            }
            let n = a.narrow(b);
            if !n.is_subseteq(a) {
                return Err(violation("narrow upper bracket", &[a, b]));
            }
            if !a.meet(b).is_subseteq(&n) {
                return Err(violation("narrow lower bracket", &[a, b]));
            }
        }
    }
    for start in samples {
        let mut acc = start.clone();
        let mut steps = 0;
        'chain: loop {
            let mut changed = false;
            for next in samples {
                let w = acc.widen(next);
                if w != acc {
                    acc = w;
                    changed = true;
                    steps += 1;
                    if steps > chain_cap {
                        return Err(violation("widening chain stabilization", &[start]));
                    }
                }
            }
            if !changed {
                break 'chain;
            }
        }
    }
    Ok(())
}
