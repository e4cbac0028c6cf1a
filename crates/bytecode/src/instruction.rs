use crate::opcode::Op;

/// A decoded instruction.
///
/// Operand extraction from raw instruction words is version-specific and
/// happens upstream; this struct carries every field any version can
/// populate. Fields an encoding doesn't use are left zero. Registers and
/// operands are `i32` because downstream arithmetic mixes them with -1
/// sentinels and signed offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub op: Op,
    pub a: i32,
    pub b: i32,
    pub c: i32,
    pub bx: i32,
    pub sbx: i32,
    /// The k flag bit (5.4 comparison/test forms).
    pub k: bool,
}

impl Instr {
    /// ABC-format instruction.
    pub fn abc(op: Op, a: i32, b: i32, c: i32) -> Self {
        Instr { op, a, b, c, bx: 0, sbx: 0, k: false }
    }

    /// ABC-format instruction with the k flag set.
    pub fn abck(op: Op, a: i32, b: i32, c: i32, k: bool) -> Self {
        Instr { op, a, b, c, bx: 0, sbx: 0, k }
    }

    /// ABx-format instruction.
    pub fn abx(op: Op, a: i32, bx: i32) -> Self {
        Instr { op, a, b: 0, c: 0, bx, sbx: 0, k: false }
    }

    /// AsBx-format instruction (signed jump offset).
    pub fn asbx(op: Op, a: i32, sbx: i32) -> Self {
        Instr { op, a, b: 0, c: 0, bx: 0, sbx, k: false }
    }
}
