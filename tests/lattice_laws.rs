use kirin::*;

// The five-point sign lattice: Bottom, Neg, Zero, Pos, Top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sign {
    Bottom,
    Neg,
    Zero,
    Pos,
    Top,
}

impl Lattice for Sign {
    fn top() -> Sign {
        Sign::Top
    }

    fn bottom() -> Sign {
        Sign::Bottom
    }

    fn join(&self, other: &Sign) -> Sign {
        match (self, other) {
            (Sign::Bottom, v) | (v, Sign::Bottom) => *v,
            (a, b) if a == b => *a,
            (_, _) => Sign::Top,
        }
    }

    fn meet(&self, other: &Sign) -> Sign {
        match (self, other) {
            (Sign::Top, v) | (v, Sign::Top) => *v,
            (a, b) if a == b => *a,
            (_, _) => Sign::Bottom,
        }
    }

    fn is_subseteq(&self, other: &Sign) -> bool {
        *self == Sign::Bottom || *other == Sign::Top || self == other
    }
}

impl AbstractValue for Sign {
    // Finite lattice: joining is already terminating.
    fn widen(&self, next: &Sign) -> Sign {
        self.join(next)
    }
}

const SIGNS: [Sign; 5] = [Sign::Bottom, Sign::Neg, Sign::Zero, Sign::Pos, Sign::Top];

#[test]
fn sign_lattice_laws_hold() {
    check_lattice_laws(&SIGNS).unwrap();
    check_abstract_value_laws(&SIGNS, 16).unwrap();
}

// A widening that is not an upper bound of its arguments must be caught
// by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Shrinking(Sign);

impl Lattice for Shrinking {
    fn top() -> Shrinking {
        Shrinking(Sign::Top)
    }

    fn bottom() -> Shrinking {
        Shrinking(Sign::Bottom)
    }

    fn join(&self, other: &Shrinking) -> Shrinking {
        Shrinking(self.0.join(&other.0))
    }

    fn meet(&self, other: &Shrinking) -> Shrinking {
        Shrinking(self.0.meet(&other.0))
    }

    fn is_subseteq(&self, other: &Shrinking) -> bool {
        self.0.is_subseteq(&other.0)
    }
}

impl AbstractValue for Shrinking {
    fn widen(&self, _next: &Shrinking) -> Shrinking {
        Shrinking(Sign::Bottom)
    }
}

#[test]
fn broken_widen_is_reported() {
    let samples = [Shrinking(Sign::Neg), Shrinking(Sign::Pos)];
    let err = check_abstract_value_laws(&samples, 16).unwrap_err();
    assert_eq!(err.law, "widen upper bound");
}

#[test]
fn narrow_default_stays_in_bracket() {
    // The default narrow is the identity on the left argument, which
    // trivially satisfies `self ⊓ next ⊑ narrow(self, next) ⊑ self`.
    for a in SIGNS {
        for b in SIGNS {
            let n = a.narrow(&b);
            assert_eq!(n, a);
            assert!(a.meet(&b).is_subseteq(&n));
            assert!(n.is_subseteq(&a));
        }
    }
}
