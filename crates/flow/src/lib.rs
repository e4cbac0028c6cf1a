//! Control flow reconstruction for register-based Lua-family bytecode.
//!
//! The engine turns one function's decoded instruction stream into a sorted
//! list of structure blocks (ifs, loops, else bodies, boolean set blocks,
//! breaks and gotos) plus the goto label set. It runs as a fixed pipeline:
//! branch extraction, and/or condition folding, jump resolution, then a
//! series of block recognition passes that consume the branch list.
//!
//! Positions are 1-indexed instruction lines; 0 and `length + 1` are
//! sentinels and every block range is half-open.

mod block;
mod branch;
mod builder;
mod combine;
mod condition;
mod error;
mod extract;
mod statement;

pub use block::{Block, BlockKind};
pub use condition::{
    CmpOp, Cond, FinalId, FinalKind, FinalSetData, FinalSets, Operand, OperandKind,
};
pub use error::FlowError;

use relume_bytecode::{Code, FuncInfo, Version};
use relume_vars::DeclList;
use rustc_hash::FxHashSet;

use branch::BranchList;

/// Per-function analysis switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    /// Fail instead of synthesizing a do..end block the compiler would not
    /// have required.
    pub strict_scope: bool,
    /// The function carries no debug info; register lifetimes are inferred
    /// and some assignment idioms cannot be confirmed.
    pub no_debug: bool,
}

/// Caller hook for statement knowledge the opcode-level classifier lacks.
///
/// Table-store instructions (`SETTABLE` family) are statements only when
/// their target is a named table, which this crate cannot see.
pub trait StatementOracle {
    /// Whether the inclusive line range holds a statement invisible to the
    /// opcode table.
    fn has_statement(&self, begin: usize, end: usize) -> bool {
        let _ = (begin, end);
        false
    }
}

/// The default oracle: no extra statements.
pub struct NoExtraStatements;

impl StatementOracle for NoExtraStatements {}

pub(crate) struct State<'a> {
    pub(crate) code: &'a Code,
    pub(crate) func: &'a FuncInfo,
    pub(crate) version: &'a Version,
    pub(crate) settings: Settings,
    pub(crate) decls: &'a mut DeclList,
    pub(crate) oracle: &'a dyn StatementOracle,
    pub(crate) list: BranchList,
    pub(crate) finals: FinalSets,
    pub(crate) reverse_targets: Vec<bool>,
    pub(crate) resolved: Vec<usize>,
    pub(crate) labels: FxHashSet<usize>,
    pub(crate) blocks: Vec<Block>,
}

/// Result of reconstructing one function.
#[derive(Debug)]
pub struct FlowOutcome {
    /// Blocks ordered begin ascending, end descending, so an enclosing
    /// block always precedes its contents.
    pub blocks: Vec<Block>,
    /// Lines that need a goto label.
    pub labels: FxHashSet<usize>,
    /// Resolved boolean materialization placeholders referenced from block
    /// conditions.
    pub finalsets: FinalSets,
}

/// Reconstruct the control flow of one function.
///
/// `decls` is consulted for scope queries and updated in place with
/// for-loop variable markings.
pub fn reconstruct(
    code: &Code,
    func: &FuncInfo,
    decls: &mut DeclList,
    settings: Settings,
    oracle: &dyn StatementOracle,
) -> Result<FlowOutcome, FlowError> {
    let length = code.length();
    let mut st = State {
        code,
        func,
        version: code.version(),
        settings,
        decls,
        oracle,
        list: BranchList::new(length),
        finals: FinalSets::default(),
        reverse_targets: vec![false; length + 2],
        resolved: vec![0; length + 2],
        labels: FxHashSet::default(),
        blocks: Vec::new(),
    };
    extract::find_reverse_targets(&mut st);
    extract::find_branches(&mut st)?;
    combine::combine_branches(&mut st)?;
    builder::resolve_lines(&mut st);
    builder::find_fixed_blocks(&mut st)?;
    builder::find_while_loops(&mut st)?;
    builder::find_repeat_loops(&mut st)?;
    builder::find_if_break(&mut st)?;
    builder::find_set_blocks(&mut st)?;
    builder::find_pseudo_goto_statements(&mut st)?;
    builder::find_do_blocks(&mut st)?;
    let mut blocks = st.blocks;
    block::sort_blocks(&mut blocks);
    Ok(FlowOutcome { blocks, labels: st.labels, finalsets: st.finals })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relume_bytecode::{Instr, Op};
    use relume_vars::Declaration;

    fn run(version: Version, instrs: Vec<Instr>) -> FlowOutcome {
        run_with(version, instrs, DeclList::default(), Settings::default()).unwrap()
    }

    fn run_with(
        version: Version,
        instrs: Vec<Instr>,
        mut decls: DeclList,
        settings: Settings,
    ) -> Result<FlowOutcome, FlowError> {
        let length = instrs.len();
        let code = Code::new(version, instrs, &[]);
        let func = FuncInfo::new(0, 8, false, true);
        let out = reconstruct(&code, &func, &mut decls, settings, &NoExtraStatements)?;
        for block in &out.blocks {
            assert!(block.begin <= block.end, "inverted block {:?}", block.kind);
            if let Some(close) = block.close_line {
                assert!(close >= 1 && close <= length);
            }
        }
        Ok(out)
    }

    fn spans(out: &FlowOutcome) -> Vec<(usize, usize)> {
        out.blocks.iter().map(|b| (b.begin, b.end)).collect()
    }

    #[test]
    fn test_plain_if_becomes_if_then_end() {
        let out = run(
            Version::lua51(),
            vec![
                Instr::abc(Op::Test, 0, 0, 0),
                Instr::asbx(Op::Jmp, 0, 1),
                Instr::abx(Op::LoadK, 1, 0),
                Instr::abc(Op::Return, 0, 1, 0),
            ],
        );
        assert_eq!(spans(&out), [(0, 5), (3, 4)]);
        assert!(matches!(out.blocks[0].kind, BlockKind::Outer { .. }));
        match &out.blocks[1].kind {
            BlockKind::IfThenEnd { cond, redirected } => {
                assert_eq!(*cond, Cond::Test { line: 1, register: 0, negated: false });
                assert!(!redirected);
            }
            other => panic!("expected IfThenEnd, got {:?}", other),
        }
    }

    #[test]
    fn test_if_else_pairs_then_with_else_end() {
        let out = run(
            Version::lua51(),
            vec![
                Instr::abc(Op::Test, 0, 0, 0),
                Instr::asbx(Op::Jmp, 0, 2),
                Instr::abx(Op::LoadK, 1, 0),
                Instr::asbx(Op::Jmp, 0, 1),
                Instr::abx(Op::LoadK, 1, 1),
                Instr::abc(Op::Return, 0, 1, 0),
            ],
        );
        assert_eq!(spans(&out), [(0, 7), (3, 5), (5, 6)]);
        match &out.blocks[1].kind {
            BlockKind::IfThenElse { else_target, .. } => assert_eq!(*else_target, 6),
            other => panic!("expected IfThenElse, got {:?}", other),
        }
        assert!(matches!(out.blocks[2].kind, BlockKind::ElseEnd));
    }

    #[test]
    fn test_top_condition_while_loop() {
        let out = run(
            Version::lua51(),
            vec![
                Instr::abc(Op::Test, 0, 0, 0),
                Instr::asbx(Op::Jmp, 0, 3),
                Instr::abx(Op::LoadK, 1, 0),
                Instr::abx(Op::LoadK, 1, 1),
                Instr::asbx(Op::Jmp, 0, -5),
                Instr::abc(Op::Return, 0, 1, 0),
            ],
        );
        assert_eq!(spans(&out), [(0, 7), (3, 6)]);
        match &out.blocks[1].kind {
            BlockKind::While { top_condition, loopback, .. } => {
                assert!(*top_condition);
                assert_eq!(*loopback, 1);
            }
            other => panic!("expected While, got {:?}", other),
        }
    }

    #[test]
    fn test_testset_chain_becomes_set_block() {
        let out = run(
            Version::lua51(),
            vec![
                Instr::abc(Op::TestSet, 2, 0, 0),
                Instr::asbx(Op::Jmp, 0, 1),
                Instr::abc(Op::Move, 2, 1, 0),
                Instr::abc(Op::Return, 0, 1, 0),
            ],
        );
        assert_eq!(spans(&out), [(0, 5), (3, 4)]);
        match &out.blocks[1].kind {
            BlockKind::SetBlock { cond: Cond::And(left, right), register } => {
                assert_eq!(*register, 2);
                assert_eq!(**left, Cond::Test { line: 1, register: 0, negated: false });
                match **right {
                    Cond::FinalSet(id) => {
                        let data = out.finalsets.get(id);
                        assert_eq!(data.line, 3);
                        assert_eq!(data.register, 2);
                        assert_eq!(data.kind, FinalKind::Value);
                    }
                    ref other => panic!("expected FinalSet, got {:?}", other),
                }
            }
            other => panic!("expected SetBlock, got {:?}", other),
        }
    }

    #[test]
    fn test_jump_out_of_always_loop_becomes_goto() {
        let out = run(
            Version::lua52(),
            vec![
                Instr::asbx(Op::Jmp52, 0, 2),
                Instr::asbx(Op::Jmp52, 0, -2),
                Instr::abx(Op::LoadK, 0, 0),
                Instr::abc(Op::Return, 0, 1, 0),
            ],
        );
        assert_eq!(spans(&out), [(0, 5), (1, 3), (1, 1)]);
        assert!(matches!(out.blocks[1].kind, BlockKind::AlwaysLoop { repeat: false }));
        assert!(matches!(out.blocks[2].kind, BlockKind::Goto { target: 4 }));
        assert!(out.labels.contains(&4));
    }

    #[test]
    fn test_and_combines_conditions_sharing_false_exit() {
        let out = run(
            Version::lua51(),
            vec![
                Instr::abc(Op::Test, 0, 0, 0),
                Instr::asbx(Op::Jmp, 0, 3),
                Instr::abc(Op::Test, 1, 0, 0),
                Instr::asbx(Op::Jmp, 0, 1),
                Instr::abx(Op::LoadK, 2, 0),
                Instr::abc(Op::Return, 0, 1, 0),
            ],
        );
        assert_eq!(spans(&out), [(0, 7), (5, 6)]);
        match &out.blocks[1].kind {
            BlockKind::IfThenEnd { cond: Cond::And(left, right), .. } => {
                assert_eq!(**left, Cond::Test { line: 1, register: 0, negated: false });
                assert_eq!(**right, Cond::Test { line: 3, register: 1, negated: false });
            }
            other => panic!("expected combined IfThenEnd, got {:?}", other),
        }
    }

    #[test]
    fn test_or_combines_inverted_condition_with_second_true_exit() {
        let out = run(
            Version::lua51(),
            vec![
                Instr::abc(Op::Test, 0, 0, 1),
                Instr::asbx(Op::Jmp, 0, 2),
                Instr::abc(Op::Test, 1, 0, 0),
                Instr::asbx(Op::Jmp, 0, 1),
                Instr::abx(Op::LoadK, 2, 0),
                Instr::abc(Op::Return, 0, 1, 0),
            ],
        );
        assert_eq!(spans(&out), [(0, 7), (5, 6)]);
        match &out.blocks[1].kind {
            BlockKind::IfThenEnd { cond: Cond::Or(left, right), .. } => {
                assert_eq!(**left, Cond::Test { line: 1, register: 0, negated: false });
                assert_eq!(**right, Cond::Test { line: 3, register: 1, negated: false });
            }
            other => panic!("expected combined IfThenEnd, got {:?}", other),
        }
    }

    #[test]
    fn test_if_nested_inside_while() {
        let out = run(
            Version::lua51(),
            vec![
                Instr::abc(Op::Test, 0, 0, 0),
                Instr::asbx(Op::Jmp, 0, 4),
                Instr::abc(Op::Test, 1, 0, 0),
                Instr::asbx(Op::Jmp, 0, 1),
                Instr::abx(Op::LoadK, 2, 0),
                Instr::asbx(Op::Jmp, 0, -6),
                Instr::abc(Op::Return, 0, 1, 0),
            ],
        );
        assert_eq!(spans(&out), [(0, 8), (3, 7), (5, 6)]);
        assert!(matches!(out.blocks[1].kind, BlockKind::While { .. }));
        assert!(matches!(out.blocks[2].kind, BlockKind::IfThenEnd { .. }));
    }

    #[test]
    fn test_numeric_for_from_forprep() {
        let out = run(
            Version::lua51(),
            vec![
                Instr::abx(Op::LoadK, 0, 0),
                Instr::abx(Op::LoadK, 1, 1),
                Instr::abx(Op::LoadK, 2, 2),
                Instr::asbx(Op::ForPrep, 0, 1),
                Instr::abx(Op::LoadK, 4, 0),
                Instr::asbx(Op::ForLoop, 0, -2),
            ],
        );
        assert_eq!(spans(&out), [(0, 7), (5, 7)]);
        match &out.blocks[1].kind {
            BlockKind::NumericFor { register, var_pre_close, var_post_close } => {
                assert_eq!(*register, 0);
                assert!(!var_pre_close && !var_post_close);
            }
            other => panic!("expected NumericFor, got {:?}", other),
        }
    }

    #[test]
    fn test_generic_for_consumes_both_jumps() {
        let out = run(
            Version::lua51(),
            vec![
                Instr::abx(Op::LoadK, 0, 0),
                Instr::abx(Op::LoadK, 1, 1),
                Instr::abx(Op::LoadK, 2, 2),
                Instr::asbx(Op::Jmp, 0, 1),
                Instr::abx(Op::LoadK, 4, 0),
                Instr::abc(Op::TForLoop, 0, 0, 1),
                Instr::asbx(Op::Jmp, 0, -3),
                Instr::abc(Op::Return, 0, 1, 0),
            ],
        );
        assert_eq!(spans(&out), [(0, 9), (5, 8)]);
        match &out.blocks[1].kind {
            BlockKind::GenericFor { register, var_count, .. } => {
                assert_eq!(*register, 0);
                assert_eq!(*var_count, 1);
            }
            other => panic!("expected GenericFor, got {:?}", other),
        }
    }

    #[test]
    fn test_backward_conditional_becomes_repeat() {
        let out = run(
            Version::lua51(),
            vec![
                Instr::abx(Op::LoadK, 0, 0),
                Instr::abc(Op::Test, 0, 0, 0),
                Instr::asbx(Op::Jmp, 0, -3),
                Instr::abc(Op::Return, 0, 1, 0),
            ],
        );
        assert_eq!(spans(&out), [(0, 5), (1, 4)]);
        assert!(matches!(out.blocks[1].kind, BlockKind::Repeat { scope_end: None, .. }));
    }

    #[test]
    fn test_unexplained_forward_jump_becomes_once_loop_break() {
        let out = run(
            Version::lua51(),
            vec![
                Instr::asbx(Op::Jmp, 0, 2),
                Instr::abx(Op::LoadK, 0, 0),
                Instr::abx(Op::LoadK, 0, 1),
                Instr::abc(Op::Return, 0, 1, 0),
            ],
        );
        assert_eq!(spans(&out), [(0, 5), (0, 4), (1, 1)]);
        assert!(matches!(out.blocks[1].kind, BlockKind::OnceLoop));
        assert!(matches!(out.blocks[2].kind, BlockKind::Break { target: 4 }));
    }

    #[test]
    fn test_unscoped_declaration_gets_do_end() {
        let decls = DeclList::new(vec![Declaration::new("x".into(), 0, 2, 2)]);
        let instrs = vec![
            Instr::abx(Op::LoadK, 0, 0),
            Instr::abc(Op::Move, 1, 0, 0),
            Instr::abx(Op::LoadK, 0, 1),
            Instr::abc(Op::Return, 0, 1, 0),
        ];
        let out =
            run_with(Version::lua51(), instrs.clone(), decls.clone(), Settings::default()).unwrap();
        assert_eq!(spans(&out), [(0, 5), (2, 3)]);
        assert!(matches!(out.blocks[1].kind, BlockKind::DoEnd));

        let strict = Settings { strict_scope: true, no_debug: false };
        let err = run_with(Version::lua51(), instrs, decls, strict).unwrap_err();
        assert!(matches!(err, FlowError::StrictScope));
    }
}
