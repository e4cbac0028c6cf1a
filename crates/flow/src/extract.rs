//! Branch extraction.
//!
//! One forward pass over the code turns every conditional instruction and
//! its paired jump into a branch record, and every surviving plain jump
//! into a jump branch. Boolean materialization idioms (a conditional chain
//! feeding LOADBOOL pairs or LOADFALSE/LFALSESKIP/LOADTRUE triples) are
//! recognized here and produce testset/finalset branches instead.

use relume_bytecode::Op;

use crate::branch::{Branch, BranchKind};
use crate::condition::{CmpOp, Cond, Operand, OperandKind};
use crate::error::FlowError;
use crate::statement::has_statement;
use crate::State;

pub(crate) fn find_reverse_targets(st: &mut State) {
    for line in 1..=st.code.length() {
        if st.code.is_jmp(line) {
            let target = st.code.target(line);
            if target <= line {
                st.reverse_targets[target] = true;
            }
        }
    }
}

pub(crate) fn find_branches(st: &mut State) -> Result<(), FlowError> {
    let length = st.code.length();
    let mut skip = vec![false; length + 2];
    for line in 1..=length {
        if skip[line] {
            continue;
        }
        match st.code.op(line) {
            Op::Eq | Op::Lt | Op::Le => {
                let op = match st.code.op(line) {
                    Op::Lt => CmpOp::Lt,
                    Op::Le => CmpOp::Le,
                    _ => CmpOp::Eq,
                };
                let left = Operand::new(OperandKind::RegOrConst, st.code.b(line));
                let right = Operand::new(OperandKind::RegOrConst, st.code.c(line));
                let c = Cond::Compare { op, line, left, right };
                process_condition(st, &mut skip, line, c, st.code.a(line) != 0)?;
            }
            Op::Eq54 | Op::Lt54 | Op::Le54 => {
                let op = match st.code.op(line) {
                    Op::Lt54 => CmpOp::Lt,
                    Op::Le54 => CmpOp::Le,
                    _ => CmpOp::Eq,
                };
                let left = Operand::new(OperandKind::Register, st.code.a(line));
                let right = Operand::new(OperandKind::Register, st.code.b(line));
                let c = Cond::Compare { op, line, left, right };
                process_condition(st, &mut skip, line, c, st.code.k(line))?;
            }
            Op::EqK => {
                let left = Operand::new(OperandKind::Constant, st.code.b(line));
                let right = Operand::new(OperandKind::Register, st.code.a(line));
                let c = Cond::Compare { op: CmpOp::Eq, line, left, right };
                process_condition(st, &mut skip, line, c, st.code.k(line))?;
            }
            Op::EqI | Op::LtI | Op::LeI | Op::GtI | Op::GeI => {
                let op = match st.code.op(line) {
                    Op::LtI => CmpOp::Lt,
                    Op::LeI => CmpOp::Le,
                    Op::GtI => CmpOp::Gt,
                    Op::GeI => CmpOp::Ge,
                    _ => CmpOp::Eq,
                };
                let imm = if st.code.c(line) != 0 {
                    OperandKind::ImmediateF
                } else {
                    OperandKind::Immediate
                };
                let mut left = Operand::new(OperandKind::Register, st.code.a(line));
                let mut right = Operand::new(imm, st.code.sb(line));
                if op == CmpOp::Eq {
                    std::mem::swap(&mut left, &mut right);
                }
                let c = Cond::Compare { op, line, left, right };
                process_condition(st, &mut skip, line, c, st.code.k(line))?;
            }
            Op::Test50 => {
                let c = Cond::Test { line, register: st.code.b(line), negated: false };
                let target = paired_target(st, line)?;
                if st.code.a(line) == st.code.b(line) {
                    handle_test(st, &mut skip, line, c, target, st.code.c(line) != 0)?;
                } else {
                    handle_testset(st, &mut skip, line, c, target, st.code.a(line), st.code.c(line) != 0)?;
                }
            }
            Op::Test => {
                let c = Cond::Test { line, register: st.code.a(line), negated: false };
                let target = paired_target(st, line)?;
                handle_test(st, &mut skip, line, c, target, st.code.c(line) != 0)?;
            }
            Op::Test54 => {
                let c = Cond::Test { line, register: st.code.a(line), negated: false };
                let target = paired_target(st, line)?;
                handle_test(st, &mut skip, line, c, target, st.code.k(line))?;
            }
            Op::TestSet => {
                let c = Cond::Test { line, register: st.code.b(line), negated: false };
                let target = paired_target(st, line)?;
                handle_testset(st, &mut skip, line, c, target, st.code.a(line), st.code.c(line) != 0)?;
            }
            Op::TestSet54 => {
                let c = Cond::Test { line, register: st.code.b(line), negated: false };
                let target = paired_target(st, line)?;
                handle_testset(st, &mut skip, line, c, target, st.code.a(line), st.code.k(line))?;
            }
            Op::Jmp | Op::Jmp52 | Op::Jmp54 => {
                if st.code.is_jmp(line) {
                    let target = st.code.target(line);
                    if let Some(lb) = find_loadboolblock(st, target) {
                        let c = Cond::Constant { register: -1, value: false };
                        handle_loadboolblock(st, &mut skip, lb, c, line, target)?;
                    } else {
                        st.list.insert(Branch::new(
                            BranchKind::Jump,
                            line,
                            line,
                            None,
                            target,
                            target,
                            None,
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    st.list.link();
    Ok(())
}

fn paired_target(st: &State, line: usize) -> Result<usize, FlowError> {
    if line + 1 > st.code.length() || !st.code.is_jmp_raw(line + 1) {
        return Err(FlowError::UnsupportedShape {
            line,
            what: "conditional instruction without a paired jump",
        });
    }
    Ok(st.code.target(line + 1))
}

/// Start of the boolean materialization block a jump to `target` lands in,
/// if any.
fn find_loadboolblock(st: &State, target: usize) -> Option<usize> {
    if target < 1 || target > st.code.length() {
        return None;
    }
    match st.code.op(target) {
        Op::LoadBool => {
            if st.code.c(target) != 0 {
                Some(target)
            } else if target >= 2
                && st.code.op(target - 1) == Op::LoadBool
                && st.code.c(target - 1) != 0
            {
                Some(target - 1)
            } else {
                None
            }
        }
        Op::LFalseSkip => Some(target),
        Op::LoadTrue if target >= 2 && st.code.op(target - 1) == Op::LFalseSkip => {
            Some(target - 1)
        }
        _ => None,
    }
}

fn handle_loadboolblock(
    st: &mut State,
    skip: &mut [bool],
    loadboolblock: usize,
    c: Cond,
    line: usize,
    target: usize,
) -> Result<(), FlowError> {
    let loadboolvalue = match st.code.op(target) {
        Op::LoadBool => st.code.b(target) != 0,
        Op::LFalseSkip => false,
        Op::LoadTrue => true,
        _ => {
            return Err(FlowError::UnsupportedShape {
                line: target,
                what: "boolean materialization expected",
            })
        }
    };
    let mut final_line: Option<usize> = None;
    if loadboolblock >= 2 && st.code.is_jmp(loadboolblock - 1) {
        let boolskip_target = st.code.target(loadboolblock - 1);
        let mut redirected = None;
        if loadboolblock + 2 <= st.code.length() && st.code.is_jmp_raw(loadboolblock + 2) {
            redirected = Some(st.code.target(loadboolblock + 2));
        }
        if boolskip_target == loadboolblock + 2 || Some(boolskip_target) == redirected {
            skip[loadboolblock - 1] = true;
            final_line = Some(loadboolblock - 2);
        }
    }
    let mut c = c;
    let mut inverse = false;
    if loadboolvalue {
        inverse = true;
        c = c.inverse();
    }
    let constant = st.code.is_jmp(line);
    let mut begin = line + 2;
    let register = st.code.a(loadboolblock);
    let (kind, branch_line) = if constant {
        begin -= 1;
        (BranchKind::TestSet, line)
    } else if line + 2 == loadboolblock {
        (BranchKind::FinalSet, loadboolblock)
    } else {
        (BranchKind::TestSet, line)
    };
    let mut b = Branch::new(kind, branch_line, branch_line, Some(c), begin, loadboolblock + 2, None);
    b.register = register;
    b.inverse_value = inverse;
    let b_id = st.list.insert(b);
    if let Some(mut fl) = final_line {
        if constant && fl < begin {
            fl += 1;
        }
        let id = st.finals.alloc(fl, register);
        let mut fb = Branch::new(
            BranchKind::FinalSet,
            fl,
            fl,
            Some(Cond::FinalSet(id)),
            fl,
            loadboolblock + 2,
            Some(id),
        );
        fb.register = register;
        st.list.insert(fb);
        st.list.branch_mut(b_id).finalset = Some(id);
    }
    Ok(())
}

fn handle_test(
    st: &mut State,
    skip: &mut [bool],
    line: usize,
    c: Cond,
    target: usize,
    invert: bool,
) -> Result<(), FlowError> {
    if let Some(lb) = find_loadboolblock(st, target) {
        let c = if invert { c.inverse() } else { c };
        handle_loadboolblock(st, skip, lb, c, line, target)?;
    } else {
        // A skipped-over materialization just before the target means this
        // test feeds the same register and is really a testset.
        let pload = if target >= 3 { find_loadboolblock(st, target - 2) } else { None };
        if target >= 2
            && pload == Some(target - 2)
            && st.code.a(target - 2) == c.register()
            && !has_statement(st, line + 2, target.saturating_sub(3))?
        {
            let register = c.register();
            handle_testset(st, skip, line, c, target, register, invert)?;
            return Ok(());
        }
        let c = if invert { c.inverse() } else { c };
        let mut b = Branch::new(BranchKind::Test, line, line, Some(c), line + 2, target, None);
        b.register = st.code.a(line);
        b.inverse_value = invert;
        st.list.insert(b);
    }
    skip[line + 1] = true;
    Ok(())
}

fn handle_testset(
    st: &mut State,
    skip: &mut [bool],
    line: usize,
    c: Cond,
    target: usize,
    register: i32,
    invert: bool,
) -> Result<(), FlowError> {
    skip[line + 1] = true;
    if st.settings.no_debug && find_loadboolblock(st, target).is_none() {
        // Without debug info the register's lifetime cannot confirm an
        // assignment idiom, so fall back to a plain test.
        let c = if invert { c.inverse() } else { c };
        let mut b = Branch::new(BranchKind::Test, line, line, Some(c), line + 2, target, None);
        b.register = st.code.a(line);
        b.inverse_value = invert;
        st.list.insert(b);
        return Ok(());
    }
    let mut b = Branch::new(BranchKind::TestSet, line, line, Some(c), line + 2, target, None);
    b.register = register;
    b.inverse_value = invert;
    let b_id = st.list.insert(b);
    let mut final_line = target - 1;
    let loadboolblock = if target >= 3 { find_loadboolblock(st, target - 2) } else { None };
    let branch_line = match loadboolblock {
        Some(lb) if st.code.a(lb) == register => {
            final_line = lb;
            if lb >= 3 && st.code.is_jmp(lb - 1) {
                let skip_target = st.code.target(lb - 1);
                let redirected = target <= st.code.length()
                    && st.code.is_jmp_raw(target)
                    && skip_target == st.code.target(target);
                if skip_target == target || redirected {
                    final_line = lb - 2;
                }
            }
            final_line
        }
        _ => final_line.max(line + 2),
    };
    let id = st.finals.alloc(final_line, register);
    let mut fb = Branch::new(
        BranchKind::FinalSet,
        branch_line,
        branch_line,
        Some(Cond::FinalSet(id)),
        final_line,
        target,
        Some(id),
    );
    fb.register = register;
    st.list.insert(fb);
    st.list.branch_mut(b_id).finalset = Some(id);
    Ok(())
}

fn process_condition(
    st: &mut State,
    skip: &mut [bool],
    line: usize,
    c: Cond,
    invert: bool,
) -> Result<(), FlowError> {
    let target = paired_target(st, line)?;
    let c = if invert { c.inverse() } else { c };
    if let Some(lb) = find_loadboolblock(st, target) {
        handle_loadboolblock(st, skip, lb, c, line, target)?;
    } else {
        let mut b = Branch::new(BranchKind::Comparison, line, line, Some(c), line + 2, target, None);
        b.inverse_value = invert;
        st.list.insert(b);
    }
    skip[line + 1] = true;
    Ok(())
}
