//! Boolean condition trees recovered from comparison and test
//! instructions, plus the identity-keyed placeholders used while a boolean
//! materialization idiom is still being stitched together.

/// Comparison operator of an atomic condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn flip(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
        }
    }
}

/// How a comparison operand field is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Register,
    Constant,
    /// Raw RK field; the constant bit is part of the value (pre-5.4
    /// comparisons).
    RegOrConst,
    Immediate,
    /// Immediate that renders as a float.
    ImmediateF,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    pub value: i32,
}

impl Operand {
    pub fn new(kind: OperandKind, value: i32) -> Self {
        Operand { kind, value }
    }
}

/// Handle into [`FinalSets`]. Two placeholder conditions are the same
/// placeholder only when their ids are equal; structural comparison is
/// deliberately not provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FinalId(u32);

/// Resolved form of a finalset placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalKind {
    Pending,
    /// The materialized value is read back from the register.
    Register,
    /// The materialized value is the instruction's own result.
    Value,
}

#[derive(Debug, Clone)]
pub struct FinalSetData {
    pub line: usize,
    pub register: i32,
    pub kind: FinalKind,
}

/// Arena of finalset placeholders.
///
/// The placeholder's line is adjusted after block construction, and a
/// single placeholder can be referenced from both a branch's condition and
/// its finalset link; the arena gives those references one shared identity.
#[derive(Debug, Default)]
pub struct FinalSets {
    items: Vec<FinalSetData>,
}

impl FinalSets {
    pub fn alloc(&mut self, line: usize, register: i32) -> FinalId {
        let id = FinalId(self.items.len() as u32);
        self.items.push(FinalSetData { line, register, kind: FinalKind::Pending });
        id
    }

    pub fn get(&self, id: FinalId) -> &FinalSetData {
        &self.items[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: FinalId) -> &mut FinalSetData {
        &mut self.items[id.0 as usize]
    }
}

/// A recovered boolean expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cond {
    Compare {
        op: CmpOp,
        line: usize,
        left: Operand,
        right: Operand,
    },
    /// Truthiness test of a register.
    Test {
        line: usize,
        register: i32,
        negated: bool,
    },
    /// Literal boolean, optionally tied to the register it was loaded into.
    Constant { register: i32, value: bool },
    And(Box<Cond>, Box<Cond>),
    Or(Box<Cond>, Box<Cond>),
    /// Placeholder for the completion point of a boolean materialization.
    FinalSet(FinalId),
}

impl Cond {
    /// Logical negation. Total for every variant; a placeholder inverts to
    /// itself because the materialized value already has the right sense.
    pub fn inverse(&self) -> Cond {
        match self {
            Cond::Compare { op, line, left, right } => Cond::Compare {
                op: op.flip(),
                line: *line,
                left: *left,
                right: *right,
            },
            Cond::Test { line, register, negated } => Cond::Test {
                line: *line,
                register: *register,
                negated: !negated,
            },
            Cond::Constant { register, value } => Cond::Constant {
                register: *register,
                value: !value,
            },
            Cond::And(l, r) => Cond::Or(Box::new(l.inverse()), Box::new(r.inverse())),
            Cond::Or(l, r) => Cond::And(Box::new(l.inverse()), Box::new(r.inverse())),
            Cond::FinalSet(id) => Cond::FinalSet(*id),
        }
    }

    /// The register this condition's truth value lives in, or -1.
    pub fn register(&self) -> i32 {
        match self {
            Cond::Test { register, .. } => *register,
            Cond::Constant { register, .. } => *register,
            _ => -1,
        }
    }

    pub fn and(left: Cond, right: Cond) -> Cond {
        Cond::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Cond, right: Cond) -> Cond {
        Cond::Or(Box::new(left), Box::new(right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compare(op: CmpOp) -> Cond {
        Cond::Compare {
            op,
            line: 3,
            left: Operand::new(OperandKind::Register, 0),
            right: Operand::new(OperandKind::Constant, 1),
        }
    }

    #[test]
    fn test_inverse_is_involutive() {
        let cases = vec![
            compare(CmpOp::Eq),
            compare(CmpOp::Lt),
            compare(CmpOp::Le),
            compare(CmpOp::Gt),
            Cond::Test { line: 1, register: 2, negated: false },
            Cond::Constant { register: -1, value: true },
            Cond::and(compare(CmpOp::Eq), Cond::Test { line: 2, register: 0, negated: true }),
            Cond::or(compare(CmpOp::Ge), compare(CmpOp::Ne)),
        ];
        for c in cases {
            assert_eq!(c.inverse().inverse(), c);
        }
    }

    #[test]
    fn test_inverse_applies_de_morgan() {
        let c = Cond::and(
            Cond::Test { line: 1, register: 0, negated: false },
            Cond::Test { line: 2, register: 1, negated: false },
        );
        let inv = c.inverse();
        match inv {
            Cond::Or(l, r) => {
                assert_eq!(*l, Cond::Test { line: 1, register: 0, negated: true });
                assert_eq!(*r, Cond::Test { line: 2, register: 1, negated: true });
            }
            other => panic!("expected Or, got {:?}", other),
        }
    }

    #[test]
    fn test_finalset_identity_not_structural() {
        let mut finals = FinalSets::default();
        let a = finals.alloc(7, 2);
        let b = finals.alloc(7, 2);
        assert_ne!(a, b);
        assert_eq!(Cond::FinalSet(a).inverse(), Cond::FinalSet(a));
    }
}
