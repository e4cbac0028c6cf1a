//! Register lifetime inference for functions compiled without debug info.
//!
//! Walks the instruction stream once, tracking per-register per-line facts
//! (last write, read counts, temporary/local evidence), then assembles
//! declarations from segments that behave like named locals rather than
//! expression temporaries. The walk recognizes the 5.4-centric opcode set;
//! anything unrecognized contributes no evidence.

use relume_bytecode::{Code, FuncInfo, Op, VarArgType};

use crate::declaration::Declaration;

#[derive(Clone)]
struct RegState {
    last_written: usize,
    read_count: u32,
    temporary: bool,
    local: bool,
    read: bool,
    written: bool,
    is_func: bool,
}

impl Default for RegState {
    fn default() -> Self {
        RegState {
            last_written: 1,
            read_count: 0,
            temporary: false,
            local: false,
            read: false,
            written: false,
            is_func: false,
        }
    }
}

/// Dense [line][register] fact table, 1-indexed by line.
struct RegStates {
    registers: usize,
    lines: usize,
    states: Vec<RegState>,
}

impl RegStates {
    fn new(registers: usize, lines: usize) -> Self {
        RegStates {
            registers,
            lines,
            states: vec![RegState::default(); registers * lines],
        }
    }

    fn get(&self, register: usize, line: usize) -> &RegState {
        &self.states[(line - 1) * self.registers + register]
    }

    fn get_mut(&mut self, register: usize, line: usize) -> &mut RegState {
        &mut self.states[(line - 1) * self.registers + register]
    }

    fn set_written(&mut self, register: usize, line: usize) {
        let s = self.get_mut(register, line);
        s.is_func = false;
        s.written = true;
        if line < self.lines {
            self.get_mut(register, line + 1).last_written = line;
        }
    }

    fn set_read(&mut self, register: usize, line: usize) {
        self.get_mut(register, line).read = true;
        let written = self.get(register, line).last_written;
        self.get_mut(register, written).read_count += 1;
    }

    /// A closure captured `register`; it and everything below it were
    /// referenced by name.
    fn set_local_read(&mut self, register: usize, line: usize) {
        for r in 0..=register {
            let written = self.get(r, line).last_written;
            self.get_mut(r, written).local = true;
        }
    }

    fn set_local_write(&mut self, register_min: usize, register_max: usize, line: usize) {
        for r in 0..register_min {
            let written = self.get(r, line).last_written;
            self.get_mut(r, written).local = true;
        }
        for r in register_min..=register_max {
            self.get_mut(r, line).local = true;
        }
    }

    /// A stack-top consumer read `register`; it and everything above it
    /// were expression temporaries.
    fn set_temporary_read(&mut self, register: usize, line: usize) {
        for r in register..self.registers {
            let written = self.get(r, line).last_written;
            self.get_mut(r, written).temporary = true;
        }
    }

    fn set_temporary_write(&mut self, register_min: usize, register_max: usize, line: usize) {
        for r in register_max + 1..self.registers {
            let written = self.get(r, line).last_written;
            self.get_mut(r, written).temporary = true;
        }
        for r in register_min..=register_max {
            self.get_mut(r, line).temporary = true;
        }
    }

    fn next_line(&mut self, line: usize) {
        if line + 1 <= self.lines {
            for r in 0..self.registers {
                let (last_written, is_func) = {
                    let s = self.get(r, line);
                    (s.last_written, s.is_func)
                };
                let next = self.get_mut(r, line + 1);
                if last_written > next.last_written {
                    next.last_written = last_written;
                }
                if is_func {
                    next.is_func = true;
                }
            }
        }
    }
}

/// Infer declarations for a function with stripped debug info.
///
/// `counter` feeds synthesized names (`A<r>_<n>` for arguments, `L<r>_<n>`
/// for locals) and is shared across a chunk so names stay unique.
pub fn infer_declarations(code: &Code, func: &FuncInfo, counter: &mut usize) -> Vec<Declaration> {
    let registers = func.registers;
    let length = code.length();
    let mut states = RegStates::new(registers, length);
    let mut skip = vec![false; length];

    for line in 1..=length {
        states.next_line(line);
        if skip[line - 1] {
            continue;
        }
        let a = code.a(line) as usize;
        let b = code.b(line);
        let c = code.c(line);
        match code.op(line) {
            Op::Move => {
                states.set_written(a, line);
                states.set_read(b as usize, line);
            }
            Op::NewTable54 => {
                states.set_local_write(a, a, line);
            }
            Op::LoadNil52 => {
                states.set_temporary_write(a, a + b as usize, line);
            }
            Op::GetI => {
                states.set_written(a, line);
                states.set_read(b as usize, line);
            }
            Op::GetUpval | Op::GetTabUp54 => {
                states.set_written(a, line);
                states.set_temporary_write(a, a, line);
            }
            Op::GetTable54 => {
                states.set_written(a, line);
                states.set_read(b as usize, line);
                states.set_read(c as usize, line);
            }
            Op::AddI
            | Op::AddK
            | Op::SubK
            | Op::MulK
            | Op::DivK
            | Op::ModK
            | Op::PowK
            | Op::IDivK
            | Op::BAndK
            | Op::BOrK
            | Op::BXorK
            | Op::ShrI
            | Op::ShlI => {
                states.set_written(a, line);
                states.set_read(b as usize, line);
            }
            Op::SetUpval | Op::Return1 => {
                states.set_read(a, line);
            }
            Op::SetI => {
                if !code.k(line) {
                    states.set_read(c as usize, line);
                }
            }
            Op::GetField => {
                states.set_written(a, line);
                states.set_read(b as usize, line);
                states.set_temporary_read(b as usize, line);
            }
            Op::SetTabUp54 => {
                if !code.k(line) {
                    states.set_read(c as usize, line);
                }
            }
            Op::SetField => {
                states.set_written(a, line);
                if !code.k(line) {
                    states.set_read(c as usize, line);
                }
            }
            Op::SetTable54 => {
                states.set_read(b as usize, line);
                if !code.k(line) {
                    states.set_read(c as usize, line);
                }
            }
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
            | Op::Shr54
            | Op::Shl54 => {
                states.set_written(a, line);
                states.set_read(b as usize, line);
                states.set_read(c as usize, line);
            }
            Op::Self54 => {
                states.set_written(a, line);
                states.set_written(a + 1, line);
                states.set_read(b as usize, line);
                if !code.k(line) {
                    states.set_read(c as usize, line);
                }
            }
            Op::Unm | Op::BNot | Op::Not | Op::Len => {
                states.set_written(a, line);
                states.get_mut(b as usize, line).read = true;
            }
            Op::Concat54 => {
                for register in a..a + b as usize {
                    states.set_read(register, line);
                    states.set_temporary_read(register, line);
                }
            }
            Op::SetList54 => {
                for register in a + 1..=b as usize {
                    states.set_read(register, line);
                }
                states.set_written(a, line);
            }
            Op::Eq54 | Op::Lt54 | Op::Le54 => {
                states.set_read(a, line);
                states.set_read(b as usize, line);
            }
            Op::EqK | Op::EqI | Op::LtI | Op::LeI | Op::GtI | Op::GeI => {
                states.set_read(a, line);
            }
            Op::TestSet54 => {
                states.set_written(a, line);
                states.set_local_write(a, a, line);
                states.set_read(b as usize, line);
            }
            Op::Closure => {
                if let Some(upvalues) = func.child_upvalues.get(code.bx(line) as usize) {
                    for upvalue in upvalues {
                        if upvalue.in_stack {
                            states.set_local_read(upvalue.index as usize, line);
                        }
                    }
                }
                states.set_written(a, line);
            }
            Op::Call | Op::TailCall54 => {
                let first = states.get(a, line).last_written;
                for i in first..=line {
                    states.get_mut(a, i).is_func = true;
                }
                if code.op(line) != Op::TailCall54 && c >= 2 {
                    for register in a..=a + c as usize - 2 {
                        states.set_written(register, line);
                    }
                }
                if b >= 1 {
                    for register in a..=a + b as usize - 1 {
                        states.set_read(register, line);
                        states.set_temporary_read(register, line);
                    }
                }
                // Multi-return results moved into lower registers right
                // after the call belong to the call statement itself.
                if c >= 2 {
                    let mut nline = line + 1;
                    let mut register = a as i64 + c as i64 - 2;
                    while register >= a as i64 && nline <= length {
                        if code.op(nline) == Op::Move && code.b(nline) as i64 == register {
                            let dest = code.a(nline) as usize;
                            states.set_written(dest, nline);
                            states.set_read(code.b(nline) as usize, nline);
                            states.set_local_write(dest, dest, nline);
                            skip[nline - 1] = true;
                        }
                        register -= 1;
                        nline += 1;
                    }
                }
            }
            Op::Return54 => {
                let mut b = b;
                if b == 0 {
                    b = registers as i32 - code.a(line) + 1;
                }
                if b >= 2 {
                    for register in a..=a + b as usize - 2 {
                        states.get_mut(register, line).read = true;
                    }
                }
            }
            _ => {}
        }
    }

    // Temporaries force everything computed for them to be temporary too:
    // walk back through the lines that fed each temporary write and record
    // reads for the unclaimed inputs.
    for line in 1..=length {
        for register in 0..registers {
            let s = states.get(register, line);
            if !(s.written && s.temporary) {
                continue;
            }
            let mut ancestors: Vec<usize> = Vec::new();
            for read in 0..registers {
                let r = states.get(read, line);
                if r.read && !r.local {
                    ancestors.push(read);
                }
            }
            let mut pline = line - 1;
            while pline >= 1 {
                let mut any_written = false;
                for pregister in 0..registers {
                    if states.get(pregister, pline).written {
                        if let Some(pos) = ancestors.iter().position(|&r| r == pregister) {
                            any_written = true;
                            ancestors.remove(pos);
                        }
                    }
                }
                if !any_written {
                    break;
                }
                for pregister in 0..registers {
                    let p = states.get(pregister, pline);
                    if p.read && !p.local {
                        ancestors.push(pregister);
                    }
                }
                pline -= 1;
            }
            if pline >= 1 {
                for ancestor in ancestors {
                    states.set_read(ancestor, pline);
                }
            }
        }
    }

    let end = (length as i64 + code.version().outer_scope_adjustment as i64).max(0) as usize;
    let mut decls: Vec<Declaration> = Vec::new();
    for register in 0..registers {
        let mut id = "L";
        let mut local = false;
        let mut temporary = false;
        let mut read = 0u32;
        let mut written = 0u32;

        let mut starts: Vec<usize> = Vec::new();
        let mut locals: Vec<bool> = Vec::new();
        let mut temps: Vec<bool> = Vec::new();

        if register < func.params {
            local = true;
            id = "A";
        }
        let mut is_arg = false;
        if register == func.params {
            match code.version().vararg_type {
                VarArgType::Arg | VarArgType::Hybrid => {
                    if func.vararg {
                        local = true;
                        is_arg = true;
                    }
                }
                VarArgType::Ellipsis => {}
            }
        }

        if !local {
            for line in 1..=length {
                let state = states.get(register, line).clone();
                if state.temporary || state.is_func {
                    temporary = true;
                }
                if state.read {
                    written = 0;
                    read += 1;
                }
                if state.written {
                    if written == 0 {
                        if read != 0 && state.read_count >= 2 && !state.is_func {
                            temporary = false;
                            local = true;
                        }
                        locals.push(local);
                        temps.push(temporary);
                        starts.push(if state.is_func { line } else { 1 });
                    }
                    read = 0;
                    written += 1;
                }
            }
        }

        if !local {
            // A register captured by any child closure lives as a local for
            // the whole function.
            'capture: for upvalues in &func.child_upvalues {
                for upvalue in upvalues {
                    if upvalue.in_stack && upvalue.index as usize == register {
                        local = true;
                        temporary = false;
                        locals.push(true);
                        temps.push(false);
                        starts.push(1);
                        break 'capture;
                    }
                }
            }
        }

        if !local && !temporary {
            let promote = (func.has_parent && read >= 2) || (read == 0 && written > 0);
            if promote {
                locals.push(true);
                temps.push(false);
                starts.push(1);
            }
        }

        for i in 0..locals.len() {
            if locals[i] && !temps[i] {
                let name = if is_arg {
                    "arg".to_string()
                } else {
                    let n = *counter;
                    *counter += 1;
                    format!("{}{}_{}", id, register, n)
                };
                decls.push(Declaration::new(name, register as i32, starts[i], end));
            }
        }

        if locals.is_empty() && register < func.params {
            let n = *counter;
            *counter += 1;
            let name = format!("{}{}_{}", id, register, n);
            decls.push(Declaration::new(name, register as i32, 0, end));
        }
    }

    decls
}

/// Overlay named declarations onto an inferred set.
///
/// A named declaration renames the inferred declaration sharing its
/// register; unmatched names are appended as-is.
pub fn merge_declarations(mut inferred: Vec<Declaration>, named: Vec<Declaration>) -> Vec<Declaration> {
    for decl in named {
        match inferred.iter_mut().find(|d| d.register == decl.register) {
            Some(existing) => existing.name = decl.name,
            None => inferred.push(decl),
        }
    }
    inferred
}

#[cfg(test)]
mod tests {
    use super::*;
    use relume_bytecode::{Instr, Version};

    fn func(params: usize, registers: usize) -> FuncInfo {
        FuncInfo::new(params, registers, false, true)
    }

    // Register 2 is written, read, rewritten, and the rewritten value is
    // read twice more. Reassignment of a multiply-read register is the
    // signature of a named local.
    #[test]
    fn test_rewritten_reread_register_promoted_to_local() {
        let code = Code::new(
            Version::lua54(),
            vec![
                Instr::abc(Op::Add54, 2, 0, 1),
                Instr::abc(Op::Add54, 3, 2, 1),
                Instr::abc(Op::Add54, 2, 0, 1),
                Instr::abc(Op::Add54, 3, 2, 2),
                Instr::abc(Op::Return54, 3, 2, 0),
            ],
            &[],
        );
        let mut counter = 0;
        let decls = infer_declarations(&code, &func(2, 4), &mut counter);
        let names: Vec<&str> = decls.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"A0_0"));
        assert!(names.contains(&"A1_1"));
        assert!(names.contains(&"L2_2"));
    }

    // f(g()) with all registers consumed at stack top stays temporary.
    #[test]
    fn test_call_arguments_stay_temporary() {
        let code = Code::new(
            Version::lua54(),
            vec![
                Instr::abx(Op::Closure, 0, 0),
                Instr::abx(Op::Closure, 1, 1),
                Instr::abc(Op::Call, 1, 1, 2),
                Instr::abc(Op::Call, 0, 2, 1),
                Instr::abc(Op::Return54, 0, 1, 0),
            ],
            &[],
        );
        let mut counter = 0;
        let mut f = func(0, 2);
        f.child_upvalues = vec![vec![], vec![]];
        let decls = infer_declarations(&code, &f, &mut counter);
        assert!(decls.is_empty());
    }

    #[test]
    fn test_captured_register_spans_function() {
        let code = Code::new(
            Version::lua54(),
            vec![
                Instr::abc(Op::LoadFalse, 0, 0, 0),
                Instr::abx(Op::Closure, 1, 0),
                Instr::abc(Op::Call, 1, 1, 1),
                Instr::abc(Op::Return54, 1, 1, 0),
            ],
            &[],
        );
        let mut f = func(0, 2);
        f.child_upvalues = vec![vec![relume_bytecode::UpvalueRef { in_stack: true, index: 0 }]];
        let mut counter = 0;
        let decls = infer_declarations(&code, &f, &mut counter);
        let captured = decls.iter().find(|d| d.register == 0).unwrap();
        assert_eq!(captured.begin, 1);
        assert_eq!(captured.end, code.length());
    }

    #[test]
    fn test_merge_renames_by_register() {
        let inferred = vec![
            Declaration::new("L0_0".into(), 0, 1, 10),
            Declaration::new("L1_1".into(), 1, 1, 10),
        ];
        let named = vec![
            Declaration::new("count".into(), 1, 1, 10),
            Declaration::new("extra".into(), 5, 3, 8),
        ];
        let merged = merge_declarations(inferred, named);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1].name, "count");
        assert_eq!(merged[2].register, 5);
    }
}
