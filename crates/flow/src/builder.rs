//! Block construction passes.
//!
//! After extraction and combining, the branch list is consumed in a fixed
//! pass order: loops anchored to dedicated instructions first, then while
//! and repeat loops, then the if/else/break ladder, then materialization
//! blocks, pseudo gotos, and finally synthesized do..end scopes. Each pass
//! removes the branches it explains; a branch surviving every pass either
//! becomes a goto or is an error.

use relume_bytecode::{CloseType, Op, WhileFormat};
use rustc_hash::FxHashSet;

use crate::block::{Block, BlockKind};
use crate::branch::{BranchId, BranchKind};
use crate::condition::{Cond, FinalKind};
use crate::error::FlowError;
use crate::statement::{has_statement, is_statement};
use crate::State;

/// Chase jump chains so distinct lines that flow to the same place compare
/// equal. A close-flavored JMP resolves past itself.
pub(crate) fn resolve_lines(st: &mut State) {
    let length = st.code.length();
    let mut resolved: Vec<i64> = vec![-1; length + 2];
    for line in 1..=length {
        let mut r = line;
        let mut b = st.list.plain_at(line);
        while let Some(id) = b {
            if st.list.branch(id).kind != BranchKind::Jump {
                break;
            }
            if resolved[r] >= 1 {
                r = resolved[r] as usize;
                break;
            } else if resolved[r] == -2 {
                r = st.list.branch(id).target_second;
                break;
            } else {
                resolved[r] = -2;
                r = st.list.branch(id).target_second;
                b = if r <= length + 1 { st.list.plain_at(r) } else { None };
            }
        }
        if r == line && st.code.op(line) == Op::Jmp52 && st.code.is_close(line) {
            r = line + 1;
        }
        resolved[line] = r as i64;
    }
    let mut out = vec![0usize; length + 2];
    for (line, slot) in out.iter_mut().enumerate().take(length + 1).skip(1) {
        *slot = resolved[line].max(0) as usize;
    }
    out[length + 1] = length + 1;
    st.resolved = out;
}

fn close_info(st: &State, line: i64) -> (CloseType, Option<usize>) {
    if line >= 1 {
        let line = line as usize;
        let ct = st.code.close_type(line);
        if ct != CloseType::None {
            return (ct, Some(line));
        }
    }
    (CloseType::None, None)
}

fn set_close(st: &State, block: &mut Block, line: i64) {
    let (ct, cl) = close_info(st, line);
    block.close_type = ct;
    block.close_line = cl;
}

fn cond_of(st: &State, id: BranchId) -> Result<Cond, FlowError> {
    st.list
        .branch(id)
        .cond
        .clone()
        .ok_or(FlowError::Inconsistency("branch without a condition"))
}

fn mark_loop_registers(st: &mut State, begin: usize, a: i32, bookkeeping: i32, explicit: i32) {
    for r in a..a + bookkeeping {
        st.decls.mark_for_loop(r, begin);
    }
    for r in a + bookkeeping..a + bookkeeping + explicit {
        st.decls.mark_for_loop_explicit(r, begin);
    }
}

/// Loops anchored to dedicated instructions: numeric and generic for.
pub(crate) fn find_fixed_blocks(st: &mut State) -> Result<(), FlowError> {
    let length = st.code.length();
    // Begins at 0 so parameter declarations opening before the first
    // instruction are in scope.
    st.blocks.push(Block::new(
        BlockKind::Outer { scope_adjustment: st.version.outer_scope_adjustment },
        0,
        length + 1,
    ));

    let tfor_target = st.version.tfor_target;
    let for_target = st.version.for_target;
    let mut loop_marks: FxHashSet<usize> = FxHashSet::default();

    // Pre-5.4 generic for and 5.0 numeric for are found from the entry
    // jump into the loop instruction.
    let mut b = st.list.head();
    while let Some(id) = b {
        let br = st.list.branch(id);
        if br.kind == BranchKind::Jump {
            let line = br.line;
            let target = br.target_first;
            if target >= 1 && target <= length {
                let op = st.code.op(target);
                if Some(op) == tfor_target && !loop_marks.contains(&target) {
                    loop_marks.insert(target);
                    let a = st.code.a(target);
                    let c = st.code.c(target);
                    if c == 0 {
                        return Err(FlowError::UnsupportedShape {
                            line: target,
                            what: "generic for loop declaring no variables",
                        });
                    }
                    st.list.remove(id);
                    if let Some(next) = st.list.plain_at(target + 1) {
                        st.list.remove(next);
                    }
                    let mut var_close = false;
                    let mut inner_close = false;
                    let mut close = target as i64 - 1;
                    if close >= (line + 1) as i64
                        && st.code.is_close(close as usize)
                        && st.code.close_value(close as usize) == a + 3
                    {
                        var_close = true;
                        close -= 1;
                    }
                    if close >= (line + 1) as i64
                        && st.code.is_close(close as usize)
                        && st.code.close_value(close as usize) <= a + 3 + c
                    {
                        inner_close = true;
                    }
                    let begin = line + 1;
                    mark_loop_registers(st, begin, a, 3, c);
                    st.blocks.push(Block::new(
                        BlockKind::GenericFor { register: a, var_count: c, var_close, inner_close },
                        begin,
                        target + 2,
                    ));
                } else if Some(op) == for_target && !loop_marks.contains(&target) {
                    loop_marks.insert(target);
                    let a = st.code.a(target);
                    let begin = line + 1;
                    let mut block = Block::new(
                        BlockKind::NumericFor { register: a, var_pre_close: false, var_post_close: false },
                        begin,
                        target + 1,
                    );
                    set_close(st, &mut block, target as i64 - 1);
                    st.decls.mark_for_loop_explicit(a, begin);
                    st.decls.mark_for_loop(a + 1, begin);
                    st.decls.mark_for_loop(a + 2, begin);
                    st.blocks.push(block);
                    st.list.remove(id);
                }
            }
        }
        b = st.list.next(id);
    }

    for line in 1..=length {
        match st.code.op(line) {
            Op::ForPrep | Op::ForPrep54 => {
                let a = st.code.a(line);
                let target = st.code.target(line);
                let begin = line + 1;
                let end = target + 1;
                let mut var_pre_close = false;
                let mut var_post_close = false;
                let mut close_line = target as i64 - 1;
                if close_line >= (line + 1) as i64
                    && st.code.is_close(close_line as usize)
                    && st.code.close_value(close_line as usize) == a + 3
                {
                    var_pre_close = true;
                    close_line -= 1;
                } else if end <= length
                    && st.code.is_close(end)
                    && st.code.close_value(end) == a + 3
                {
                    var_post_close = true;
                }
                let mut block = Block::new(
                    BlockKind::NumericFor { register: a, var_pre_close, var_post_close },
                    begin,
                    end,
                );
                set_close(st, &mut block, close_line);
                mark_loop_registers(st, begin, a, 3, 1);
                st.blocks.push(block);
            }
            Op::TForPrep => {
                let target = st.code.target(line);
                let a = st.code.a(target);
                let c = st.code.c(target);
                let mut inner_close = false;
                let close = target as i64 - 1;
                if close >= (line + 1) as i64
                    && st.code.is_close(close as usize)
                    && st.code.close_value(close as usize) == a + 3 + c
                {
                    inner_close = true;
                }
                let begin = line + 1;
                mark_loop_registers(st, begin, a, 2, c + 1);
                st.blocks.push(Block::new(
                    BlockKind::GenericFor {
                        register: a,
                        var_count: c + 1,
                        var_close: false,
                        inner_close,
                    },
                    begin,
                    target + 2,
                ));
                if let Some(next) = st.list.plain_at(target + 1) {
                    st.list.remove(next);
                }
            }
            Op::TForPrep54 => {
                let target = st.code.target(line);
                let a = st.code.a(line);
                let c = st.code.c(target);
                let mut var_close = false;
                let close = target as i64 - 1;
                if close >= (line + 1) as i64
                    && st.code.is_close(close as usize)
                    && st.code.close_value(close as usize) == a + 4
                {
                    var_close = true;
                }
                let begin = line + 1;
                mark_loop_registers(st, begin, a, 4, c);
                st.blocks.push(Block::new(
                    BlockKind::GenericFor { register: a, var_count: c, var_close, inner_close: false },
                    begin,
                    target + 2,
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Rewrite branches in `[begin, end)` that jump to `target` so they land
/// on `line` instead; the compiler redirected them through the loop's own
/// backward jump.
fn unredirect(st: &mut State, begin: usize, end: usize, line: usize, target: usize) {
    let mut b = st.list.head();
    while let Some(id) = b {
        b = st.list.next(id);
        let finalset = {
            let br = st.list.branch_mut(id);
            if br.line >= begin && br.line < end && br.target_second == target {
                if br.kind == BranchKind::FinalSet {
                    br.target_first = line - 1;
                    br.target_second = line;
                    br.finalset
                } else {
                    br.target_second = line;
                    if br.target_first == target {
                        br.target_first = line;
                    }
                    None
                }
            } else {
                None
            }
        };
        if let Some(f) = finalset {
            st.finals.get_mut(f).line = line - 1;
        }
    }
}

fn unredirect_finalsets(st: &mut State, target: usize, line: usize, begin: usize) {
    let mut b = st.list.head();
    while let Some(id) = b {
        b = st.list.next(id);
        let finalset = {
            let br = st.list.branch_mut(id);
            if br.kind == BranchKind::FinalSet
                && br.target_second == target
                && br.line < line
                && br.line >= begin
            {
                br.target_first = line - 1;
                br.target_second = line;
                br.finalset
            } else {
                None
            }
        };
        if let Some(f) = finalset {
            st.finals.get_mut(f).line = line - 1;
        }
    }
}

pub(crate) fn find_while_loops(st: &mut State) -> Result<(), FlowError> {
    let mut j = st.list.tail();
    while let Some(jid) = j {
        let jb = st.list.branch(jid).clone();
        if jb.kind == BranchKind::Jump
            && jb.target_first <= jb.line
            && !st.decls.splits(jb.target_first, jb.target_first, jb.line + 1)
        {
            let loopback = jb.target_first;
            let end = jb.line + 1;

            // The loop condition is the first conditional inside the loop
            // whose false exit resolves to the loop exit, provided no
            // earlier branch reaches past it.
            let mut b: Option<BranchId> = None;
            let mut cur = st.list.head();
            let mut extent: i64 = -1;
            while let Some(id) = cur {
                let br = st.list.branch(id);
                if br.is_conditional()
                    && br.line >= loopback
                    && br.line < jb.line
                    && st.resolved[br.target_second] == st.resolved[end]
                    && extent <= br.line as i64
                {
                    b = Some(id);
                    break;
                }
                if br.line >= loopback {
                    extent = extent.max(br.target_second as i64);
                }
                cur = st.list.next(id);
            }
            if let Some(id) = b {
                let reverse = st.reverse_targets[loopback];
                st.reverse_targets[loopback] = false;
                let cond_line = st.list.branch(id).line;
                let statement = has_statement(st, loopback, cond_line.saturating_sub(1))?;
                st.reverse_targets[loopback] = reverse;
                if statement {
                    b = None;
                }
            }
            if st.version.while_format == WhileFormat::BottomCondition {
                // 5.0 compiles the condition at the bottom; a top
                // conditional is something else.
                b = None;
            }

            let mut loop_block: Option<Block> = None;
            if let Some(id) = b {
                st.list.branch_mut(id).target_second = end;
                let br = st.list.branch(id).clone();
                st.list.remove(id);
                let cond = br.cond.ok_or(FlowError::Inconsistency("while condition missing"))?;
                let mut block = Block::new(
                    BlockKind::While { cond, top_condition: true, loopback },
                    br.target_first,
                    br.target_second,
                );
                set_close(st, &mut block, end as i64 - 2);
                loop_block = Some(block);
                unredirect(st, loopback, end, jb.line, loopback);
            }
            if loop_block.is_none()
                && jb.line >= 6
                && st.code.op(jb.line - 3) == Op::Close
                && st.code.is_jmp_raw(jb.line - 2)
                && st.code.target(jb.line - 2) == end
                && st.code.op(jb.line - 1) == Op::Close
            {
                // Repeat loop whose condition captures upvalues: the body
                // ends in CLOSE, exit jump, CLOSE before the loopback.
                let mut cur = st.list.prev(jid);
                let mut found = None;
                while let Some(id) = cur {
                    let br = st.list.branch(id);
                    if br.is_conditional() && br.line2 == jb.line - 5 {
                        found = Some(id);
                        break;
                    }
                    cur = st.list.prev(id);
                }
                if let Some(id) = found {
                    let skip = st
                        .list
                        .plain_at(jb.line - 2)
                        .ok_or(FlowError::Inconsistency("repeat closure without its exit jump"))?;
                    let scope_end =
                        if st.version.close_in_scope { jb.line - 2 } else { jb.line - 3 };
                    let cond = cond_of(st, id)?;
                    st.list.remove(id);
                    st.list.remove(skip);
                    loop_block = Some(Block::new(
                        BlockKind::Repeat { cond, scope_end: Some(scope_end) },
                        jb.target_first,
                        jb.line + 1,
                    ));
                }
            }
            let loop_block = match loop_block {
                Some(block) => block,
                None => {
                    let mut repeat = false;
                    if st.version.while_format == WhileFormat::BottomCondition {
                        repeat = true;
                        if loopback >= 2 {
                            if let Some(head) = st.list.plain_at(loopback - 1) {
                                let hb = st.list.branch(head);
                                if hb.kind == BranchKind::Jump && hb.target_first == jb.line {
                                    st.list.remove(head);
                                    repeat = false;
                                }
                            }
                        }
                    }
                    let mut block = Block::new(BlockKind::AlwaysLoop { repeat }, loopback, end);
                    set_close(st, &mut block, end as i64 - 2);
                    unredirect(st, loopback, end, jb.line, loopback);
                    block
                }
            };
            st.list.remove(jid);
            st.blocks.push(loop_block);
        }
        j = st.list.prev(jid);
    }
    Ok(())
}

pub(crate) fn find_repeat_loops(st: &mut State) -> Result<(), FlowError> {
    let mut b = st.list.head();
    while let Some(id) = b {
        b = st.list.next(id);
        let br = st.list.branch(id).clone();
        if !br.is_conditional() || br.target_second >= br.target_first {
            continue;
        }
        let mut block: Option<Block> = None;
        if st.version.while_format == WhileFormat::BottomCondition && br.target_second >= 2 {
            // 5.0 while: entry jump over the body to a bottom condition.
            let head = br.target_second - 1;
            if let Some(head_id) = st.list.plain_at(head) {
                let hb = st.list.branch(head_id).clone();
                if hb.kind == BranchKind::Jump
                    && hb.target_second <= br.line
                    && !has_statement(st, hb.target_second, br.line.saturating_sub(1))?
                {
                    let cond = br
                        .cond
                        .clone()
                        .ok_or(FlowError::Inconsistency("loop condition missing"))?;
                    let mut w = Block::new(
                        BlockKind::While {
                            cond: cond.inverse(),
                            top_condition: false,
                            loopback: hb.target_first,
                        },
                        head + 1,
                        br.target_first,
                    );
                    set_close(st, &mut w, hb.target_first as i64 - 1);
                    st.list.remove(head_id);
                    unredirect(st, 1, hb.line, hb.line, hb.target_second);
                    block = Some(w);
                }
            }
        }
        let block = match block {
            Some(w) => w,
            None => {
                let cond = br.cond.clone().ok_or(FlowError::Inconsistency("loop condition missing"))?;
                if st.version.extended_repeat_scope {
                    let mut statement_line = br.line as i64 - 1;
                    while statement_line >= 1 && !is_statement(st, statement_line as usize)? {
                        statement_line -= 1;
                    }
                    let mut r = Block::new(
                        BlockKind::Repeat {
                            cond,
                            scope_end: Some(statement_line.max(0) as usize),
                        },
                        br.target_second,
                        br.target_first,
                    );
                    set_close(st, &mut r, statement_line);
                    r
                } else if st.version.close_semantics == relume_bytecode::CloseSemantics::Jump {
                    let mut r = Block::new(
                        BlockKind::Repeat { cond, scope_end: None },
                        br.target_second,
                        br.target_first,
                    );
                    set_close(st, &mut r, br.target_first as i64);
                    r
                } else {
                    Block::new(
                        BlockKind::Repeat { cond, scope_end: None },
                        br.target_second,
                        br.target_first,
                    )
                }
            }
        };
        st.list.remove(id);
        st.blocks.push(block);
    }
    Ok(())
}

fn enclosing_block(st: &State, line: usize) -> Option<usize> {
    let mut enclosing: Option<usize> = None;
    for (i, block) in st.blocks.iter().enumerate() {
        if block.contains(line) && enclosing.map_or(true, |e| st.blocks[e].contains_block(block)) {
            enclosing = Some(i);
        }
    }
    enclosing
}

fn enclosing_breakable_block(st: &State, line: usize) -> Option<usize> {
    let mut enclosing: Option<usize> = None;
    for (i, block) in st.blocks.iter().enumerate() {
        if block.contains(line)
            && block.breakable()
            && enclosing.map_or(true, |e| st.blocks[e].contains_block(block))
        {
            enclosing = Some(i);
        }
    }
    enclosing
}

fn enclosing_unprotected_block(st: &State, line: usize) -> Option<usize> {
    let mut enclosing: Option<usize> = None;
    for (i, block) in st.blocks.iter().enumerate() {
        if block.contains(line)
            && block.is_unprotected()
            && enclosing.map_or(true, |e| st.blocks[e].contains_block(block))
        {
            enclosing = Some(i);
        }
    }
    enclosing
}

fn peek_at(stack: &[BranchId], i: usize) -> BranchId {
    stack[stack.len() - 1 - i]
}

/// Nearest if end the stack can reach, skipping entries that exit their
/// loop (those resolve as breaks, not if ends).
fn stack_reach(st: &State, stack: &[BranchId]) -> usize {
    for i in 0..stack.len() {
        let b = st.list.branch(peek_at(stack, i));
        let absorbed = enclosing_breakable_block(st, b.line)
            .map_or(false, |idx| st.blocks[idx].end == b.target_second);
        if !absorbed {
            return b.target_second;
        }
    }
    usize::MAX
}

/// Pop and emit the top of the if stack when its end has been passed.
fn resolve_if_stack(
    st: &mut State,
    stack: &mut Vec<BranchId>,
    line: usize,
) -> Result<bool, FlowError> {
    if stack.is_empty() || stack_reach(st, stack) > line {
        return Ok(false);
    }
    let Some(top) = stack.pop() else {
        return Ok(false);
    };
    let tb = st.list.branch(top).clone();
    let cond = tb.cond.ok_or(FlowError::Inconsistency("if branch without a condition"))?;
    if st.version.use_if_break_rewrite
        && st.version.use_goto
        && tb.target_first + 1 == tb.target_second
        && tb.target_first <= st.code.length()
        && st.code.is_jmp(tb.target_first)
    {
        // A real if statement over a single jump would have been rewritten
        // by the compiler. It was not, so restore the if+goto form.
        let at = tb.target_first - 1;
        st.blocks
            .push(Block::new(BlockKind::IfThenEnd { cond: cond.inverse(), redirected: false }, at, at));
        st.blocks.push(Block::new(BlockKind::Goto { target: tb.target_second }, at, at));
        st.labels.insert(tb.target_second);
    } else {
        if tb.target_first < 2
            || tb.target_first - 1 > st.code.length()
            || !st.code.is_jmp_raw(tb.target_first - 1)
        {
            return Err(FlowError::UnsupportedShape {
                line: tb.target_first,
                what: "if body not preceded by a jump",
            });
        }
        let literal_end = st.code.target(tb.target_first - 1);
        let mut block = Block::new(
            BlockKind::IfThenEnd { cond, redirected: literal_end != tb.target_second },
            tb.target_first,
            tb.target_second,
        );
        set_close(st, &mut block, tb.target_second as i64 - 1);
        st.blocks.push(block);
    }
    st.list.remove(top);
    Ok(true)
}

/// Close the if block `top` with an else body delimited by the jump `b`.
fn resolve_else(
    st: &mut State,
    stack: &mut Vec<BranchId>,
    hanging: &mut Vec<BranchId>,
    else_stack: &mut Vec<usize>,
    top: BranchId,
    b: BranchId,
    tail: usize,
) -> Result<(), FlowError> {
    let top_b = st.list.branch(top).clone();
    let b_line = st.list.branch(b).line;

    // Enclosing else bodies that shared the redirected end now stop at
    // this else's jump.
    while let Some(&idx) = else_stack.last() {
        if st.blocks[idx].end == tail && st.blocks[idx].begin >= top_b.target_first {
            st.blocks[idx].end = b_line;
            else_stack.pop();
        } else {
            break;
        }
    }

    let mut replaced: Vec<BranchId> = Vec::new();
    while let Some(&h) = hanging.last() {
        let hb = st.list.branch(h);
        if hb.target_second != tail || hb.line <= top_b.line {
            break;
        }
        hanging.pop();
        st.list.branch_mut(h).target_second = b_line;
        let h_line = st.list.branch(h).line;
        let exits_loop = enclosing_breakable_block(st, h_line)
            .map_or(false, |idx| st.list.branch(h).target_second >= st.blocks[idx].end);
        if exits_loop {
            replaced.push(h);
        } else {
            stack.push(h);
            if !resolve_if_stack(st, stack, b_line)? {
                return Err(FlowError::Inconsistency("hanging branch failed to resolve in else"));
            }
        }
    }
    while let Some(h) = replaced.pop() {
        hanging.push(h);
    }

    unredirect_finalsets(st, tail, b_line, top_b.target_first);

    let mut restore: Vec<BranchId> = Vec::new();
    let b_target_second = st.list.branch(b).target_second;
    while let Some(&s) = stack.last() {
        let sb = st.list.branch(s);
        if sb.line > top_b.line && sb.target_second == b_target_second {
            st.list.branch_mut(s).target_second = b_line;
            stack.pop();
            restore.push(s);
        } else {
            break;
        }
    }
    while let Some(s) = restore.pop() {
        stack.push(s);
    }

    st.list.branch_mut(b).target_second = tail;
    let mut ite = Block::new(
        BlockKind::IfThenElse {
            cond: top_b.cond.ok_or(FlowError::Inconsistency("if branch without a condition"))?,
            else_target: tail,
        },
        top_b.target_first,
        top_b.target_second,
    );
    set_close(st, &mut ite, top_b.target_second as i64 - 2);
    st.blocks.push(ite);
    let mut ee = Block::new(BlockKind::ElseEnd, top_b.target_second, tail);
    set_close(st, &mut ee, tail as i64 - 1);
    st.blocks.push(ee);
    else_stack.push(st.blocks.len() - 1);
    st.list.remove(b);
    Ok(())
}

fn is_hanger_resolvable(st: &State, hanging: BranchId, resolver: BranchId) -> bool {
    let h = st.list.branch(hanging);
    let r = st.list.branch(resolver);
    h.target_second == r.target_first
        && enclosing_block(st, h.line) == enclosing_block(st, r.line)
        && !st.decls.splits(h.line, h.target_first, r.line)
        && !(st.version.use_if_break_rewrite
            && r.line >= 2
            && h.target_first == r.line - 1
            && st.code.is_jmp(r.line - 1))
}

fn is_hanger_resolvable_any(st: &State, hanging: BranchId, resolvers: &[BranchId]) -> bool {
    resolvers.iter().any(|&r| is_hanger_resolvable(st, hanging, r))
}

fn resolve_hanger(
    st: &mut State,
    stack: &mut Vec<BranchId>,
    hanger: BranchId,
    resolver: BranchId,
) -> Result<(), FlowError> {
    let line = st.list.branch(resolver).line;
    st.list.branch_mut(hanger).target_second = line;
    stack.push(hanger);
    if !resolve_if_stack(st, stack, line)? {
        return Err(FlowError::Inconsistency("hanging branch failed to resolve"));
    }
    Ok(())
}

fn resolve_hangers(
    st: &mut State,
    stack: &mut Vec<BranchId>,
    hanging: &mut Vec<BranchId>,
    resolver: BranchId,
) -> Result<(), FlowError> {
    while let Some(&h) = hanging.last() {
        if !is_hanger_resolvable(st, h, resolver) {
            break;
        }
        hanging.pop();
        resolve_hanger(st, stack, h, resolver)?;
    }
    Ok(())
}

pub(crate) fn find_if_break(st: &mut State) -> Result<(), FlowError> {
    let mut stack: Vec<BranchId> = Vec::new();
    let mut hanging: Vec<BranchId> = Vec::new();
    let mut else_stack: Vec<usize> = Vec::new();
    let mut hanging_resolver: Vec<BranchId> = Vec::new();

    let mut b = st.list.head();
    while let Some(id) = b {
        let line2 = st.list.branch(id).line2;
        while resolve_if_stack(st, &mut stack, line2)? {}

        let line = st.list.branch(id).line;
        while let Some(&idx) = else_stack.last() {
            if st.blocks[idx].end <= line {
                else_stack.pop();
            } else {
                break;
            }
        }
        while let Some(&resolver) = hanging_resolver.last() {
            let r_line = st.list.branch(resolver).line;
            let still_inside =
                enclosing_block(st, r_line).map_or(false, |idx| st.blocks[idx].contains(line));
            if still_inside {
                break;
            }
            hanging_resolver.pop();
            resolve_hangers(st, &mut stack, &mut hanging, resolver)?;
        }

        if st.list.branch(id).is_conditional() {
            if st.list.branch(id).target_first > st.list.branch(id).target_second {
                return Err(FlowError::Inconsistency("conditional branch targets out of order"));
            }
            if let Some(uidx) = enclosing_unprotected_block(st, line) {
                let ts = st.list.branch(id).target_second;
                let ub = &st.blocks[uidx];
                if !ub.contains(ts) && ub.unprotected_target() == Some(ts) {
                    if let Some(l) = ub.unprotected_line() {
                        st.list.branch_mut(id).target_second = l;
                    }
                }
            }
            let ts = st.list.branch(id).target_second;
            let blocked_by_stack =
                stack.last().map_or(false, |&s| st.list.branch(s).target_second < ts);
            let exits_loop = enclosing_breakable_block(st, line)
                .map_or(false, |idx| !st.blocks[idx].contains(ts));
            if blocked_by_stack || exits_loop {
                hanging.push(id);
            } else {
                stack.push(id);
            }
        } else if st.list.branch(id).kind == BranchKind::Jump {
            let enclosing = enclosing_block(st, line);
            let tf = st.list.branch(id).target_first;

            let mut tail = st.list.branch(id).target_second;
            if let Some(uidx) = enclosing_unprotected_block(st, line) {
                let ub = &st.blocks[uidx];
                if !ub.contains(st.list.branch(id).target_second) {
                    let redirected = ub
                        .unprotected_target()
                        .map_or(false, |t| tail == st.resolved[t]);
                    if redirected {
                        if let Some(l) = ub.unprotected_line() {
                            tail = l;
                        }
                    }
                }
            }

            let mut handled = false;
            let breakable = enclosing_breakable_block(st, line);

            if let Some(bidx) = breakable {
                let bend = st.blocks[bidx].end;
                if tf == bend || tf == st.resolved[bend] {
                    let hang_match = hanging.last().map_or(false, |&h| {
                        st.list.branch(h).target_second == tf
                            && enclosing_block(st, st.list.branch(h).line) == enclosing
                            && stack
                                .last()
                                .map_or(true, |&s| st.list.branch(h).line > st.list.branch(s).line)
                    });
                    if hang_match {
                        hanging_resolver.push(id);
                    }
                    let bbegin = st.blocks[bidx].begin;
                    unredirect_finalsets(st, tf, line, bbegin);
                    st.blocks.push(Block::new(BlockKind::Break { target: tf }, line, line));
                    st.list.remove(id);
                    handled = true;
                }
            }

            if !handled && st.version.use_goto {
                if let Some(bidx) = breakable {
                    let escapes = !st.blocks[bidx].contains(tf)
                        && st.resolved[tf] != st.resolved[st.blocks[bidx].end];
                    if escapes {
                        let hang_match = hanging.last().map_or(false, |&h| {
                            st.list.branch(h).target_second == tf
                                && enclosing_block(st, st.list.branch(h).line) == enclosing
                                && stack.last().map_or(true, |&s| {
                                    st.list.branch(h).line > st.list.branch(s).line
                                })
                        });
                        if hang_match {
                            hanging_resolver.push(id);
                        }
                        unredirect_finalsets(st, tf, line, 1);
                        st.blocks.push(Block::new(BlockKind::Goto { target: tf }, line, line));
                        st.labels.insert(tf);
                        st.list.remove(id);
                        handled = true;
                    }
                }
            }

            if !handled {
                let ts = st.list.branch(id).target_second;
                let top_adjacent =
                    stack.last().map_or(false, |&s| st.list.branch(s).target_second == line + 1);
                let enclosed = enclosing
                    .map_or(false, |idx| st.blocks[idx].contains_range(line, ts));
                if top_adjacent && enclosed && ts > line {
                    // This jump is an else entry for the if on top of the
                    // stack; pop ifs whose scope it would split.
                    loop {
                        let top = match stack.last().copied() {
                            Some(t) => t,
                            None => break,
                        };
                        let tb = st.list.branch(top).clone();
                        if tb.target_second != line + 1
                            || !st.decls.splits(tb.line, tb.target_first, tb.target_second)
                        {
                            break;
                        }
                        if !resolve_if_stack(st, &mut stack, tb.target_second)? {
                            return Err(FlowError::Inconsistency("if stack stalled at else"));
                        }
                    }
                    if let Some(&top) = stack.last() {
                        if st.list.branch(top).target_second == line + 1 {
                            if st.list.branch(top).target_second != ts {
                                while let (Some(&h), Some(&r)) =
                                    (hanging.last(), hanging_resolver.last())
                                {
                                    if !is_hanger_resolvable(st, h, r) {
                                        break;
                                    }
                                    hanging.pop();
                                    resolve_hanger(st, &mut stack, h, r)?;
                                }
                                stack.pop();
                                resolve_else(
                                    st,
                                    &mut stack,
                                    &mut hanging,
                                    &mut else_stack,
                                    top,
                                    id,
                                    tail,
                                )?;
                            } else {
                                let tb = st.list.branch(top).clone();
                                if !st.decls.splits(tb.line, tb.target_first, tb.target_second - 1)
                                {
                                    // An if whose else body is empty.
                                    st.list.branch_mut(id).target_second = tail;
                                    let cond = tb.cond.ok_or(FlowError::Inconsistency(
                                        "if branch without a condition",
                                    ))?;
                                    let mut ite = Block::new(
                                        BlockKind::IfThenElse { cond, else_target: tail },
                                        tb.target_first,
                                        tb.target_second,
                                    );
                                    set_close(st, &mut ite, tb.target_second as i64 - 2);
                                    st.blocks.push(ite);
                                    st.list.remove(id);
                                    stack.pop();
                                }
                            }
                        }
                    }
                    handled = true;
                }
            }

            if !handled {
                if let (Some(bidx), Some(nj)) = (breakable, st.list.plain_at(line + 1)) {
                    if st.list.branch(nj).kind == BranchKind::Jump {
                        let bend = st.blocks[bidx].end;
                        for i in 0..hanging.len() {
                            let hanger = peek_at(&hanging, i);
                            let hb = st.list.branch(hanger).clone();
                            let fires = st.resolved[hb.target_second] == st.resolved[bend]
                                && st.list.branch(nj).target_first == hb.target_second
                                && !st.decls.splits(hb.line, hb.target_first, line)
                                && !st.decls.splits(line, line + 1, line + 2)
                                && !st.decls.splits(hb.line, hb.target_first, line + 2);
                            if fires {
                                // Hangers above this one resolve against
                                // pending resolvers first.
                                for _ in 0..i {
                                    loop {
                                        let h_top = *hanging.last().ok_or(
                                            FlowError::Inconsistency("hanging stack underflow"),
                                        )?;
                                        let r_top = *hanging_resolver.last().ok_or(
                                            FlowError::Inconsistency("hanging resolver underflow"),
                                        )?;
                                        if is_hanger_resolvable(st, h_top, r_top) {
                                            break;
                                        }
                                        hanging_resolver.pop();
                                    }
                                    let h_top = hanging
                                        .pop()
                                        .ok_or(FlowError::Inconsistency("hanging stack underflow"))?;
                                    let r_top = *hanging_resolver
                                        .last()
                                        .ok_or(FlowError::Inconsistency("hanging resolver underflow"))?;
                                    resolve_hanger(st, &mut stack, h_top, r_top)?;
                                }
                                let top = hanging
                                    .pop()
                                    .ok_or(FlowError::Inconsistency("hanging stack underflow"))?;
                                let resolver_matches = hanging_resolver.last().map_or(false, |&r| {
                                    st.list.branch(r).target_first
                                        == st.list.branch(top).target_second
                                });
                                if resolver_matches {
                                    hanging_resolver.pop();
                                }
                                st.list.branch_mut(top).target_second = line + 1;
                                resolve_else(
                                    st,
                                    &mut stack,
                                    &mut hanging,
                                    &mut else_stack,
                                    top,
                                    id,
                                    tail,
                                )?;
                                handled = true;
                                break;
                            } else if !is_hanger_resolvable_any(st, hanger, &hanging_resolver) {
                                break;
                            }
                        }
                    }
                }
            }

            if !handled {
                if let (Some(bidx), Some(nj)) = (breakable, st.list.plain_at(line + 1)) {
                    let splits_condition = st.blocks[bidx].is_splitable()
                        && st.blocks[bidx].unprotected_target() == Some(st.resolved[tf])
                        && st.list.branch(nj).kind == BranchKind::Jump
                        && st.resolved[st.list.branch(nj).target_first]
                            == st.resolved[st.blocks[bidx].end];
                    if splits_condition {
                        let (ct, cl) = close_info(st, line as i64 - 1);
                        if let Some(head) = st.blocks[bidx].split(line, ct, cl) {
                            st.blocks.push(head);
                        }
                        st.list.remove(id);
                        handled = true;
                    }
                }
            }

            if !handled {
                if let (Some(&top), Some(nj)) = (stack.last(), st.list.plain_at(line + 1)) {
                    if st.list.branch(top).target_second == tf
                        && st.list.branch(nj).kind == BranchKind::Jump
                        && st.list.branch(nj).target_first == tf
                    {
                        // Redirected empty else.
                        let tb = st.list.branch(top).clone();
                        if !st.decls.splits(tb.line, tb.target_first, line) {
                            st.list.branch_mut(top).target_second = line + 1;
                            st.list.branch_mut(id).target_second = line + 1;
                            let cond = tb
                                .cond
                                .ok_or(FlowError::Inconsistency("if branch without a condition"))?;
                            let mut ite = Block::new(
                                BlockKind::IfThenElse { cond, else_target: line + 1 },
                                tb.target_first,
                                line + 1,
                            );
                            set_close(st, &mut ite, line as i64 - 1);
                            st.blocks.push(ite);
                            st.list.remove(id);
                            stack.pop();
                        }
                        handled = true;
                    }
                }
            }

            if !handled {
                if let (Some(&top), Some(nj)) = (hanging.last(), st.list.plain_at(line + 1)) {
                    if st.list.branch(top).target_second == tf
                        && st.list.branch(nj).kind == BranchKind::Jump
                        && st.list.branch(nj).target_first == tf
                    {
                        // Redirected empty else under a hanging if.
                        let tb = st.list.branch(top).clone();
                        if !st.decls.splits(tb.line, tb.target_first, line) {
                            let resolver_matches = hanging_resolver.last().map_or(false, |&r| {
                                st.list.branch(r).target_first == tb.target_second
                            });
                            if resolver_matches {
                                hanging_resolver.pop();
                            }
                            st.list.branch_mut(top).target_second = line + 1;
                            st.list.branch_mut(id).target_second = line + 1;
                            let cond = tb
                                .cond
                                .ok_or(FlowError::Inconsistency("if branch without a condition"))?;
                            let mut ite = Block::new(
                                BlockKind::IfThenElse { cond, else_target: line + 1 },
                                tb.target_first,
                                line + 1,
                            );
                            set_close(st, &mut ite, line as i64 - 1);
                            st.blocks.push(ite);
                            st.list.remove(id);
                            hanging.pop();
                        }
                        handled = true;
                    }
                }
            }

            if !handled && (st.version.use_goto || st.settings.no_debug) {
                let hang_match = hanging.last().map_or(false, |&h| {
                    st.list.branch(h).target_second == tf
                        && enclosing_block(st, st.list.branch(h).line) == enclosing
                });
                if hang_match {
                    hanging_resolver.push(id);
                }
                st.blocks.push(Block::new(BlockKind::Goto { target: tf }, line, line));
                st.labels.insert(tf);
                st.list.remove(id);
            }
        }
        b = st.list.next(id);
    }

    while let Some(resolver) = hanging_resolver.pop() {
        resolve_hangers(st, &mut stack, &mut hanging, resolver)?;
    }
    while let Some(top) = hanging.pop() {
        let tb = st.list.branch(top).clone();
        let cond = tb.cond.clone().ok_or(FlowError::Inconsistency("if branch without a condition"))?;
        let at = tb.target_first - 1;
        let is_break = enclosing_breakable_block(st, tb.line)
            .map_or(false, |idx| st.blocks[idx].end == tb.target_second);
        if is_break {
            if !(st.version.use_if_break_rewrite || st.settings.no_debug) {
                return Err(FlowError::UnsupportedShape {
                    line: tb.line,
                    what: "unmatched conditional at loop end",
                });
            }
            st.blocks.push(Block::new(
                BlockKind::IfThenEnd { cond: cond.inverse(), redirected: false },
                at,
                at,
            ));
            st.blocks
                .push(Block::new(BlockKind::Break { target: tb.target_second }, at, at));
        } else if st.version.use_goto || st.settings.no_debug {
            if !(st.version.use_if_break_rewrite || st.settings.no_debug) {
                return Err(FlowError::Inconsistency("goto requires the if-break rewrite"));
            }
            st.blocks.push(Block::new(
                BlockKind::IfThenEnd { cond: cond.inverse(), redirected: false },
                at,
                at,
            ));
            st.blocks
                .push(Block::new(BlockKind::Goto { target: tb.target_second }, at, at));
            st.labels.insert(tb.target_second);
        } else {
            return Err(FlowError::UnsupportedShape {
                line: tb.line,
                what: "unmatched conditional branch",
            });
        }
        st.list.remove(top);
    }
    while resolve_if_stack(st, &mut stack, usize::MAX)? {}
    Ok(())
}

/// Turn surviving testset/finalset branches into boolean materialization
/// blocks and pin each finalset placeholder to its real set point.
pub(crate) fn find_set_blocks(st: &mut State) -> Result<(), FlowError> {
    let mut b = st.list.head();
    while let Some(id) = b {
        b = st.list.next(id);
        let br = st.list.branch(id).clone();
        if !br.is_assignment() && br.kind != BranchKind::FinalSet {
            continue;
        }
        if let Some(fs) = br.finalset {
            let mut target_first = br.target_first;
            let mut cline = st.finals.get(fs).line;
            if cline >= 2 && cline <= st.code.length() {
                let op = st.code.op(cline);
                if matches!(op, Op::MmBin | Op::MmBinI | Op::MmBinK | Op::ExtraArg) {
                    cline -= 1;
                    if target_first == cline + 1 {
                        target_first = cline;
                    }
                }
            }
            while cline >= 1 && st.code.is_upvalue_declaration(cline) {
                cline -= 1;
                if target_first == cline + 1 {
                    target_first = cline;
                }
            }
            let kind = if cline >= 1 && cline <= st.code.length() && st.code.is_jmp_raw(cline) {
                FinalKind::Register
            } else {
                FinalKind::Value
            };
            let data = st.finals.get_mut(fs);
            data.line = cline;
            data.kind = kind;
            st.list.branch_mut(id).target_first = target_first;
        }
        if st.list.branch(id).cond_is_finalset() {
            st.list.remove(id);
        } else {
            let br = st.list.branch(id).clone();
            let cond = br
                .cond
                .ok_or(FlowError::Inconsistency("materialization branch without a condition"))?;
            st.blocks.push(Block::new(
                BlockKind::SetBlock { cond, register: br.register },
                br.target_first,
                br.target_second,
            ));
            st.list.remove(id);
        }
    }
    Ok(())
}

/// Forward jumps nothing else explained become breaks out of a synthesized
/// single-iteration loop.
pub(crate) fn find_pseudo_goto_statements(st: &mut State) -> Result<(), FlowError> {
    let mut b = st.list.head();
    while let Some(id) = b {
        let mut cur = id;
        let br = st.list.branch(id).clone();
        if br.kind == BranchKind::Jump && br.target_first > br.line {
            let end = br.target_first;
            let mut smallest: Option<usize> = None;
            for (i, block) in st.blocks.iter().enumerate() {
                if block.contains(br.line)
                    && block.contains(end - 1)
                    && smallest.map_or(true, |s| st.blocks[s].contains_block(block))
                {
                    smallest = Some(i);
                }
            }
            if let Some(sidx) = smallest {
                let mut wrapping: Option<usize> = None;
                for (i, block) in st.blocks.iter().enumerate() {
                    if i != sidx
                        && st.blocks[sidx].contains_block(block)
                        && block.contains(br.line)
                        && wrapping.map_or(true, |w| block.contains_block(&st.blocks[w]))
                    {
                        wrapping = Some(i);
                    }
                }
                let mut begin_i = st.blocks[sidx].begin as i64;
                if let Some(w) = wrapping {
                    begin_i = (st.blocks[w].begin as i64 - 1).max(begin_i);
                }
                // Declarations crossing the candidate range bound where the
                // loop can start.
                let mut lower_bound = i64::MIN;
                let mut upper_bound = i64::MAX;
                let scope_limit = end as i64 - 1;
                for decl in st.decls.iter() {
                    let (db, de) = (decl.begin as i64, decl.end as i64);
                    if de >= begin_i && de <= scope_limit && db < begin_i {
                        upper_bound = upper_bound.min(db);
                    }
                    if db >= begin_i && db <= scope_limit && de > scope_limit {
                        lower_bound = lower_bound.max(db + 1);
                        begin_i = db + 1;
                    }
                }
                if lower_bound > upper_bound {
                    return Err(FlowError::Inconsistency("pseudo goto scope bounds crossed"));
                }
                begin_i = begin_i.max(lower_bound).min(upper_bound);
                let mut begin = begin_i.max(0) as usize;
                if let Some(bidx) = enclosing_breakable_block(st, br.line) {
                    begin = begin.max(st.blocks[bidx].begin);
                }
                let once = Block::new(BlockKind::OnceLoop, begin, end);
                let contains_break = st
                    .blocks
                    .iter()
                    .any(|bl| once.contains_block(bl) && matches!(bl.kind, BlockKind::Break { .. }));
                if contains_break {
                    // A break inside would bind to the synthesized loop, so
                    // use an if true/else split instead.
                    st.blocks.push(Block::new(
                        BlockKind::IfThenElse {
                            cond: Cond::Constant { register: -1, value: true },
                            else_target: end,
                        },
                        begin,
                        br.line + 1,
                    ));
                    st.blocks.push(Block::new(BlockKind::ElseEnd, br.line + 1, end));
                    st.list.remove(id);
                } else {
                    st.blocks.push(once);
                    let mut b2 = Some(id);
                    while let Some(b2id) = b2 {
                        let br2 = st.list.branch(b2id).clone();
                        if br2.kind == BranchKind::Jump
                            && br2.target_first > br2.line
                            && br2.target_first == br.target_first
                        {
                            st.blocks.push(Block::new(
                                BlockKind::Break { target: br2.target_first },
                                br2.line,
                                br2.line,
                            ));
                            st.list.remove(b2id);
                            if st.list.next(cur) == Some(b2id) {
                                cur = b2id;
                            }
                        }
                        b2 = st.list.next(b2id);
                    }
                }
            }
        }
        b = st.list.next(cur);
    }
    Ok(())
}

fn strict_scope_check(st: &State) -> Result<(), FlowError> {
    if st.settings.strict_scope {
        return Err(FlowError::StrictScope);
    }
    Ok(())
}

/// Match close instructions and declaration scopes against the block tree,
/// synthesizing do..end blocks where no block accounts for a scope.
pub(crate) fn find_do_blocks(st: &mut State) -> Result<(), FlowError> {
    let mut new_blocks: Vec<Block> = Vec::new();
    for i in 0..st.blocks.len() {
        let close_line = match st.blocks[i].close_line {
            Some(l) if l >= 1 => l,
            _ => continue,
        };
        let enclosing = enclosing_block(st, close_line);
        let applies = enclosing == Some(i)
            || enclosing.map_or(false, |e| st.blocks[e].contains_block(&st.blocks[i]));
        if !applies || !st.code.is_close(close_line) {
            continue;
        }
        let register = st.code.close_value(close_line);
        let mut close = true;
        let mut close_decl: Option<(usize, usize)> = None;
        for decl in st.decls.iter() {
            if !decl.for_loop && !decl.for_loop_explicit && st.blocks[i].contains(decl.begin) {
                if decl.register < register {
                    close = false;
                } else if decl.register == register {
                    close_decl = Some((decl.begin, decl.end));
                }
            }
        }
        if close {
            st.blocks[i].close_used = true;
        } else if let Some((dbegin, dend)) = close_decl {
            let mut inner = Block::new(BlockKind::DoEnd, dbegin, dend + 1);
            inner.close_register = register;
            new_blocks.push(inner);
            strict_scope_check(st)?;
        }
    }
    st.blocks.append(&mut new_blocks);

    let decl_spans: Vec<(usize, usize)> = st
        .decls
        .iter()
        .filter(|d| !d.for_loop && !d.for_loop_explicit)
        .map(|d| (d.begin, d.end))
        .collect();
    for (dbegin, dend) in decl_spans {
        let mut begin = dbegin;
        let mut needs_do_end = true;
        for i in 0..st.blocks.len() {
            if st.blocks[i].contains(dbegin) {
                let scope_end = st.blocks[i].scope_end();
                if scope_end == dend as i64 {
                    st.blocks[i].scope_used = true;
                    needs_do_end = false;
                    break;
                } else if scope_end < dend as i64 {
                    begin = begin.min(st.blocks[i].begin);
                }
            }
        }
        if needs_do_end {
            st.blocks.push(Block::new(BlockKind::DoEnd, begin, dend + 1));
            strict_scope_check(st)?;
        }
    }
    Ok(())
}
