use crate::instruction::Instr;
use crate::opcode::Op;
use crate::version::{CloseSemantics, Version};

/// Classification of a scope-exit instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    None,
    /// A 5.0/5.1 CLOSE instruction.
    Close,
    /// A 5.4 CLOSE instruction (to-be-closed semantics).
    Close54,
    /// A 5.2/5.3 JMP doubling as a close.
    Jmp,
}

/// Random-access, 1-indexed view of one function's decoded instructions.
///
/// Line 0 and `length + 1` are sentinel boundaries; every range handed
/// around downstream is half-open over this index space. The adapter also
/// owns the close-instruction predicate family and the upvalue-declaration
/// mask (5.0/5.1 compile closures as CLOSURE followed by one
/// pseudo-instruction per captured register; those lines are not real
/// statements).
pub struct Code {
    version: Version,
    instrs: Vec<Instr>,
    upvalue_decl: Vec<bool>,
}

impl Code {
    /// Build an adapter over decoded instructions.
    ///
    /// `child_upvalue_counts[i]` is the number of upvalues captured by child
    /// prototype `i`, used to mark inline upvalue declaration lines on
    /// versions that emit them.
    pub fn new(version: Version, instrs: Vec<Instr>, child_upvalue_counts: &[usize]) -> Self {
        let mut upvalue_decl = vec![false; instrs.len()];
        if version.inline_upvalues {
            for (i, instr) in instrs.iter().enumerate() {
                if instr.op == Op::Closure {
                    let count = child_upvalue_counts
                        .get(instr.bx as usize)
                        .copied()
                        .unwrap_or(0);
                    for offset in 1..=count {
                        if i + offset < upvalue_decl.len() {
                            upvalue_decl[i + offset] = true;
                        }
                    }
                }
            }
        }
        Code { version, instrs, upvalue_decl }
    }

    pub fn length(&self) -> usize {
        self.instrs.len()
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    fn at(&self, line: usize) -> &Instr {
        &self.instrs[line - 1]
    }

    pub fn op(&self, line: usize) -> Op {
        self.at(line).op
    }

    pub fn a(&self, line: usize) -> i32 {
        self.at(line).a
    }

    pub fn b(&self, line: usize) -> i32 {
        self.at(line).b
    }

    pub fn c(&self, line: usize) -> i32 {
        self.at(line).c
    }

    pub fn bx(&self, line: usize) -> i32 {
        self.at(line).bx
    }

    /// Signed B operand (5.4 immediate comparisons).
    pub fn sb(&self, line: usize) -> i32 {
        self.at(line).b
    }

    pub fn k(&self, line: usize) -> bool {
        self.at(line).k
    }

    /// Resolved destination of a jump-family instruction.
    pub fn target(&self, line: usize) -> usize {
        let instr = self.at(line);
        assert!(
            instr.op.has_jump_target(),
            "target() on non-jump {:?} at line {}",
            instr.op,
            line
        );
        (line as i64 + 1 + instr.sbx as i64) as usize
    }

    /// Whether this line is an inline upvalue declaration after a CLOSURE.
    pub fn is_upvalue_declaration(&self, line: usize) -> bool {
        self.upvalue_decl.get(line - 1).copied().unwrap_or(false)
    }

    /// Whether the instruction is one of the plain jump encodings, taking
    /// the operand at face value (a JMP52 close marker still counts).
    pub fn is_jmp_raw(&self, line: usize) -> bool {
        self.op(line).is_jump()
    }

    /// Whether the instruction is an actual jump: JMP52 close markers are
    /// excluded.
    pub fn is_jmp(&self, line: usize) -> bool {
        match self.op(line) {
            Op::Jmp | Op::Jmp54 => true,
            Op::Jmp52 => !self.is_close(line),
            _ => false,
        }
    }

    /// Whether the instruction closes registers at or above some index.
    ///
    /// CLOSE always does. JMP52 encodes a disguised close when its A field
    /// is nonzero and it either targets the next line or duplicates the
    /// following jump's target.
    pub fn is_close(&self, line: usize) -> bool {
        match self.op(line) {
            Op::Close => true,
            Op::Jmp52 => {
                let target = self.target(line);
                if target == line + 1 {
                    self.a(line) != 0
                } else if line + 1 <= self.length() && self.op(line + 1) == Op::Jmp52 {
                    target == self.target(line + 1) && self.a(line) != 0
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// First register closed by a close instruction.
    pub fn close_value(&self, line: usize) -> i32 {
        match self.op(line) {
            Op::Close => self.a(line),
            Op::Jmp52 => self.a(line) - 1,
            op => panic!("close_value() on non-close {:?} at line {}", op, line),
        }
    }

    /// Close classification for a candidate line; `None` when the line is
    /// out of range or not a close instruction.
    pub fn close_type(&self, line: usize) -> CloseType {
        if line < 1 || line > self.length() || !self.is_close(line) {
            CloseType::None
        } else if self.op(line) == Op::Close {
            if self.version.close_semantics == CloseSemantics::Lua54 {
                CloseType::Close54
            } else {
                CloseType::Close
            }
        } else {
            CloseType::Jmp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jmp(offset: i32) -> Instr {
        Instr::asbx(Op::Jmp52, 0, offset)
    }

    fn jmp_close(a: i32, offset: i32) -> Instr {
        Instr { op: Op::Jmp52, a, b: 0, c: 0, bx: 0, sbx: offset, k: false }
    }

    #[test]
    fn test_target_resolution() {
        let code = Code::new(
            Version::lua51(),
            vec![
                Instr::asbx(Op::Jmp, 0, 2),
                Instr::abc(Op::Move, 0, 1, 0),
                Instr::abc(Op::Move, 1, 0, 0),
                Instr::asbx(Op::Jmp, 0, -4),
            ],
            &[],
        );
        assert_eq!(code.target(1), 4);
        assert_eq!(code.target(4), 1);
    }

    #[test]
    fn test_jmp52_close_detection() {
        // JMP52 with A != 0 targeting the next line is a disguised close.
        let code = Code::new(
            Version::lua52(),
            vec![jmp_close(3, 0), jmp(1), Instr::abc(Op::Return, 0, 1, 0)],
            &[],
        );
        assert!(code.is_close(1));
        assert!(!code.is_jmp(1));
        assert_eq!(code.close_value(1), 2);
        assert_eq!(code.close_type(1), CloseType::Jmp);

        // Plain JMP52 with A == 0 is a real jump.
        assert!(!code.is_close(2));
        assert!(code.is_jmp(2));
    }

    #[test]
    fn test_upvalue_declaration_mask() {
        // CLOSURE proto 0 (2 upvalues) followed by two MOVE pseudo-instrs.
        let code = Code::new(
            Version::lua51(),
            vec![
                Instr::abx(Op::Closure, 0, 0),
                Instr::abc(Op::Move, 0, 1, 0),
                Instr::abc(Op::Move, 0, 2, 0),
                Instr::abc(Op::Return, 0, 1, 0),
            ],
            &[2],
        );
        assert!(!code.is_upvalue_declaration(1));
        assert!(code.is_upvalue_declaration(2));
        assert!(code.is_upvalue_declaration(3));
        assert!(!code.is_upvalue_declaration(4));
    }
}
