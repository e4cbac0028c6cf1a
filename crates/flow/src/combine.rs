//! Folding adjacent branches into and/or condition trees.
//!
//! The walk is right to left: each branch tries to absorb the branch
//! before it, recursing into the absorbed side first so nesting matches
//! evaluation order. Replaced and removed nodes keep their links, which
//! the outer walk relies on to continue from a consumed position.

use crate::branch::{Branch, BranchId, BranchKind};
use crate::condition::Cond;
use crate::error::FlowError;
use crate::statement::has_statement;
use crate::State;

pub(crate) fn combine_branches(st: &mut State) -> Result<(), FlowError> {
    let mut b = st.list.tail();
    while let Some(id) = b {
        let n = combine_left(st, id)?;
        b = st.list.prev(n);
    }
    Ok(())
}

fn combine_left(st: &mut State, branch1: BranchId) -> Result<BranchId, FlowError> {
    let b = st.list.branch(branch1);
    if b.is_conditional() {
        combine_conditional(st, branch1)
    } else if b.is_assignment() || b.kind == BranchKind::FinalSet {
        combine_assignment(st, branch1)
    } else {
        Ok(branch1)
    }
}

fn cond_of(st: &State, id: BranchId) -> Result<Cond, FlowError> {
    st.list
        .branch(id)
        .cond
        .clone()
        .ok_or(FlowError::Inconsistency("branch without a condition"))
}

/// Whether two branches are close enough to fold: no statement and no jump
/// target may separate the first branch's exit from the second's entry.
fn adjacent(st: &State, branch0: BranchId, branch1: BranchId) -> Result<bool, FlowError> {
    let b0 = st.list.branch(branch0);
    let b1 = st.list.branch(branch1);
    if b1.finalset.is_some() && b0.finalset == b1.finalset {
        // Redirects can leave real statements between a finalset and its
        // paired branches.
        return Ok(true);
    }
    if b0.target_first > b1.line {
        return Ok(false);
    }
    if has_statement(st, b0.target_first, b1.line.saturating_sub(1))? {
        return Ok(false);
    }
    Ok(!st.reverse_targets[b1.line])
}

fn combine_conditional(st: &mut State, branch1: BranchId) -> Result<BranchId, FlowError> {
    let mut branch0 = st.list.prev(branch1);
    let line1 = st.list.branch(branch1).line;
    while let Some(b0) = branch0 {
        if st.list.branch(b0).line <= line1 {
            break;
        }
        branch0 = st.list.prev(b0);
    }
    let mut branchn = branch1;
    while let Some(b0) = branch0 {
        if branchn != branch1 || !adjacent(st, b0, branch1)? {
            break;
        }
        branchn = combine_conditional_helper(st, b0, branch1)?;
        if st.list.branch(b0).target_second > st.list.branch(branch1).target_first {
            break;
        }
        branch0 = st.list.prev(b0);
    }
    Ok(branchn)
}

fn combine_conditional_helper(
    st: &mut State,
    branch0: BranchId,
    branch1: BranchId,
) -> Result<BranchId, FlowError> {
    if !st.list.branch(branch0).is_conditional() || !st.list.branch(branch1).is_conditional() {
        return Ok(branch1);
    }
    let mut b0_target_second = st.list.branch(branch0).target_second;
    let b1_target_first = st.list.branch(branch1).target_first;
    if b1_target_first <= st.code.length()
        && st.code.is_jmp(b1_target_first)
        && st.code.target(b1_target_first) == b0_target_second
    {
        // The first branch's false exit was redirected through the
        // second's true exit.
        b0_target_second = b1_target_first;
    }
    let b1_target_second = st.list.branch(branch1).target_second;
    if b0_target_second == b1_target_first {
        let branch0 = combine_conditional(st, branch0)?;
        let c = Cond::or(cond_of(st, branch0)?.inverse(), cond_of(st, branch1)?);
        let merged = merged_conditional(st, branch0, branch1, c);
        let n = st.list.replace(branch0, branch1, merged);
        combine_conditional(st, n)
    } else if b0_target_second == b1_target_second {
        let branch0 = combine_conditional(st, branch0)?;
        let c = Cond::and(cond_of(st, branch0)?, cond_of(st, branch1)?);
        let merged = merged_conditional(st, branch0, branch1, c);
        let n = st.list.replace(branch0, branch1, merged);
        combine_conditional(st, n)
    } else {
        Ok(branch1)
    }
}

fn merged_conditional(st: &State, branch0: BranchId, branch1: BranchId, c: Cond) -> Branch {
    let b0_line = st.list.branch(branch0).line;
    let b1 = st.list.branch(branch1);
    let mut merged = Branch::new(
        BranchKind::Comparison,
        b0_line,
        b1.line2,
        Some(c),
        b1.target_first,
        b1.target_second,
        b1.finalset,
    );
    merged.inverse_value = b1.inverse_value;
    merged
}

fn combine_assignment(st: &mut State, branch1: BranchId) -> Result<BranchId, FlowError> {
    let mut branch0 = st.list.prev(branch1);
    let mut branchn = branch1;
    while let Some(b0) = branch0 {
        if branchn != branch1 {
            break;
        }
        branchn = combine_assignment_helper(st, b0, branch1)?;
        if st.list.branch(branch1).cond_is_finalset() {
            // A raw finalset keeps scanning left for the branch it pairs
            // with.
        } else if st.list.branch(b0).cond_is_finalset() {
            // A duplicated finalset from the other arm is skipped over.
        } else if st.list.branch(b0).target_second > st.list.branch(branch1).target_first {
            break;
        }
        branch0 = st.list.prev(b0);
    }
    Ok(branchn)
}

fn combine_assignment_helper(
    st: &mut State,
    branch0: BranchId,
    branch1: BranchId,
) -> Result<BranchId, FlowError> {
    if !adjacent(st, branch0, branch1)? {
        return Ok(branch1);
    }
    let register = st.list.branch(branch1).register;
    if register == -1 {
        return Err(FlowError::Inconsistency("materialization branch without a register"));
    }

    // A conditional guarding an assignment bridges into it.
    if st.list.branch(branch0).is_conditional()
        && st.list.branch(branch1).is_assignment()
        && st.list.branch(branch0).target_second == st.list.branch(branch1).target_first
    {
        let inverse = st.list.branch(branch0).inverse_value;
        let branch0 = combine_conditional(st, branch0)?;
        if inverse != st.list.branch(branch0).inverse_value {
            return Err(FlowError::Inconsistency("condition sense changed while combining"));
        }
        let c0 = cond_of(st, branch0)?;
        let c1 = cond_of(st, branch1)?;
        let c = if !st.list.branch(branch1).inverse_value {
            Cond::or(c0.inverse(), c1)
        } else {
            Cond::and(c0, c1)
        };
        let merged = merged_assignment(st, branch0, branch1, c, register, true);
        let n = st.list.replace(branch0, branch1, merged);
        return combine_assignment(st, n);
    }

    // Chained assignments to the same register.
    if st.list.branch(branch0).is_assignment_to(register)
        && st.list.branch(branch1).is_assignment()
        && st.list.branch(branch0).inverse_value == st.list.branch(branch1).inverse_value
        && st.list.branch(branch0).target_second == st.list.branch(branch1).target_second
    {
        let branch0 = combine_assignment_side(st, branch0)?;
        let c0 = cond_of(st, branch0)?;
        let c1 = cond_of(st, branch1)?;
        let c = if st.list.branch(branch0).inverse_value {
            Cond::or(c0, c1)
        } else {
            Cond::and(c0, c1)
        };
        let merged = merged_assignment(st, branch0, branch1, c, register, true);
        let n = st.list.replace(branch0, branch1, merged);
        return combine_assignment(st, n);
    }

    // An assignment feeding the chain's final set point.
    if st.list.branch(branch0).is_assignment_to(register)
        && st.list.branch(branch1).kind == BranchKind::FinalSet
        && st.list.branch(branch0).target_second == st.list.branch(branch1).target_second
    {
        if let Some(fs0) = st.list.branch(branch0).finalset {
            if st.list.branch(branch1).finalset != Some(fs0) {
                // The other arm's finalset is superseded by this one.
                let mut b = st.list.next(branch0);
                while let Some(id) = b {
                    let dupe = matches!(st.list.branch(id).cond, Some(Cond::FinalSet(f)) if f == fs0);
                    if dupe {
                        st.list.remove(id);
                        break;
                    }
                    b = st.list.next(id);
                }
            }
        }
        let branch0 = combine_assignment_side(st, branch0)?;
        let c0 = cond_of(st, branch0)?;
        let c1 = cond_of(st, branch1)?;
        let c = if st.list.branch(branch0).inverse_value {
            Cond::or(c0, c1)
        } else {
            Cond::and(c0, c1)
        };
        let merged = merged_assignment(st, branch0, branch1, c, register, false);
        let n = st.list.replace(branch0, branch1, merged);
        return combine_assignment(st, n);
    }

    Ok(branch1)
}

/// Recursively combine the left side of an assignment pair, normalizing
/// the condition sense afterwards.
fn combine_assignment_side(st: &mut State, branch0: BranchId) -> Result<BranchId, FlowError> {
    if st.list.branch(branch0).is_conditional() {
        let b0 = combine_conditional(st, branch0)?;
        if st.list.branch(b0).inverse_value {
            // The inversion was applied on both levels; undo one.
            let inv = cond_of(st, b0)?.inverse();
            st.list.branch_mut(b0).cond = Some(inv);
        }
        Ok(b0)
    } else {
        let inverse = st.list.branch(branch0).inverse_value;
        let b0 = combine_assignment(st, branch0)?;
        if inverse != st.list.branch(b0).inverse_value {
            return Err(FlowError::Inconsistency("condition sense changed while combining"));
        }
        Ok(b0)
    }
}

fn merged_assignment(
    st: &State,
    branch0: BranchId,
    branch1: BranchId,
    c: Cond,
    register: i32,
    keep_inverse: bool,
) -> Branch {
    let b0_line = st.list.branch(branch0).line;
    let b1 = st.list.branch(branch1);
    let mut merged = Branch::new(
        b1.kind,
        b0_line,
        b1.line2,
        Some(c),
        b1.target_first,
        b1.target_second,
        b1.finalset,
    );
    if keep_inverse {
        merged.inverse_value = b1.inverse_value;
    }
    merged.register = register;
    merged
}
