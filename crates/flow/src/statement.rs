//! Classification of instructions as source statements.
//!
//! The block builder asks "does this range contain a statement" to decide
//! whether a candidate loop or else body is plausible. Most answers come
//! straight from the opcode plus whether the written register is a named
//! local; table stores are genuinely ambiguous at this level and are
//! deferred to the caller's oracle.

use relume_bytecode::Op;

use crate::error::FlowError;
use crate::State;

pub(crate) fn is_statement(st: &State, line: usize) -> Result<bool, FlowError> {
    if st.reverse_targets[line] {
        return Ok(true);
    }
    if st.decls.new_locals(line).next().is_some() {
        return Ok(true);
    }
    let code = st.code;
    if code.is_upvalue_declaration(line) {
        return Ok(false);
    }
    let registers = st.func.registers as i32;
    let local = |register: i32, l: usize| st.decls.is_local(register, l);
    match code.op(line) {
        Op::Move
        | Op::LoadI
        | Op::LoadF
        | Op::LoadK
        | Op::LoadKx
        | Op::LoadBool
        | Op::LoadFalse
        | Op::LoadTrue
        | Op::LFalseSkip
        | Op::GetGlobal
        | Op::GetUpval
        | Op::GetTabUp
        | Op::GetTabUp54
        | Op::GetTable
        | Op::GetTable54
        | Op::GetI
        | Op::GetField
        | Op::NewTable50
        | Op::NewTable
        | Op::NewTable54
        | Op::Add
        | Op::Sub
        | Op::Mul
        | Op::Div
        | Op::IDiv
        | Op::Mod
        | Op::Pow
        | Op::BAnd
        | Op::BOr
        | Op::BXor
        | Op::Shl
        | Op::Shr
        | Op::Unm
        | Op::Not
        | Op::Len
        | Op::BNot
        | Op::Concat
        | Op::Concat54
        | Op::Closure
        | Op::TestSet
        | Op::TestSet54 => Ok(local(code.a(line), line)),
        Op::Add54
        | Op::Sub54
        | Op::Mul54
        | Op::Div54
        | Op::IDiv54
        | Op::Mod54
        | Op::Pow54
        | Op::BAnd54
        | Op::BOr54
        | Op::BXor54
        | Op::Shl54
        | Op::Shr54
        | Op::AddK
        | Op::SubK
        | Op::MulK
        | Op::DivK
        | Op::IDivK
        | Op::ModK
        | Op::PowK
        | Op::BAndK
        | Op::BOrK
        | Op::BXorK
        | Op::AddI
        | Op::ShlI
        | Op::ShrI => {
            // Only the following MMBIN continuation counts.
            Ok(false)
        }
        Op::MmBin | Op::MmBinI | Op::MmBinK => {
            if line <= 1 {
                return Err(FlowError::Inconsistency(
                    "metamethod continuation with no preceding instruction",
                ));
            }
            Ok(local(code.a(line - 1), line - 1))
        }
        Op::LoadNil => {
            for register in code.a(line)..=code.b(line) {
                if local(register, line) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Op::LoadNil52 => {
            for register in code.a(line)..=code.a(line) + code.b(line) {
                if local(register, line) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Op::SetGlobal
        | Op::SetUpval
        | Op::SetTabUp
        | Op::SetTabUp54
        | Op::TailCall
        | Op::TailCall54
        | Op::Return
        | Op::Return54
        | Op::Return0
        | Op::Return1
        | Op::ForLoop
        | Op::ForLoop54
        | Op::ForPrep
        | Op::ForPrep54
        | Op::TForCall
        | Op::TForCall54
        | Op::TForLoop
        | Op::TForLoop52
        | Op::TForLoop54
        | Op::TForPrep
        | Op::TForPrep54
        | Op::Close
        | Op::Tbc => Ok(true),
        Op::Test50 => Ok(code.a(line) != code.b(line) && local(code.a(line), line)),
        Op::Self_ | Op::Self54 => {
            Ok(local(code.a(line), line) || local(code.a(line) + 1, line))
        }
        Op::Eq
        | Op::Lt
        | Op::Le
        | Op::Eq54
        | Op::Lt54
        | Op::Le54
        | Op::EqK
        | Op::EqI
        | Op::LtI
        | Op::LeI
        | Op::GtI
        | Op::GeI
        | Op::Test
        | Op::Test54
        | Op::SetList50
        | Op::SetListO
        | Op::SetList
        | Op::SetList52
        | Op::SetList54
        | Op::VarArgPrep
        | Op::ExtraArg
        | Op::ExtraByte => Ok(false),
        Op::Jmp | Op::Jmp52 | Op::Jmp54 => {
            if line == 1 {
                return Ok(true);
            }
            let prev = code.op(line - 1);
            if prev.is_comparison() || prev.is_test() {
                return Ok(false);
            }
            if line + 1 <= code.length() {
                let next = code.op(line + 1);
                if next == Op::LoadBool && code.c(line + 1) != 0 {
                    return Ok(false);
                }
                if next == Op::LFalseSkip {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Op::Call => {
            let a = code.a(line);
            let mut c = code.c(line);
            if c == 1 {
                return Ok(true);
            }
            if c == 0 {
                c = registers - a + 1;
            }
            for register in a..a + c - 1 {
                if local(register, line) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Op::VarArg => {
            let a = code.a(line);
            let mut b = code.b(line);
            if b == 0 {
                b = registers - a + 1;
            }
            for register in a..a + b - 1 {
                if local(register, line) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Op::VarArg54 => {
            let a = code.a(line);
            let mut c = code.c(line);
            if c == 0 {
                c = registers - a + 1;
            }
            for register in a..a + c - 1 {
                if local(register, line) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        // Ambiguous table stores are resolved by the caller's oracle.
        Op::SetTable | Op::SetTable54 | Op::SetI | Op::SetField => Ok(false),
    }
}

/// Whether `[begin, end]` contains a statement, consulting the caller's
/// oracle for cases the opcode table alone cannot decide.
pub(crate) fn has_statement(st: &State, begin: usize, end: usize) -> Result<bool, FlowError> {
    let mut line = begin.max(1);
    while line <= end {
        if is_statement(st, line)? {
            return Ok(true);
        }
        line += 1;
    }
    Ok(st.oracle.has_statement(begin, end))
}
