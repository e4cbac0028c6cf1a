//! Relume: control flow reconstruction for register-based Lua-family
//! bytecode.
//!
//! This crate is the per-function pipeline entry point: declaration
//! recovery (debug-backed, or inferred when debug info is stripped)
//! followed by branch extraction and block building. Chunk functions are
//! processed independently; one function failing does not abort its
//! siblings.

pub use relume_flow::{
    Block, BlockKind, CmpOp, Cond, FinalId, FinalKind, FinalSetData, FinalSets, FlowError,
    NoExtraStatements, Operand, OperandKind, Settings, StatementOracle,
};

use relume_bytecode::{Code, FuncInfo};
use relume_vars::{infer_declarations, merge_declarations, DeclList, Declaration};
use rustc_hash::FxHashSet;

/// Everything reconstructed for one function, ready for a rendering layer.
pub struct FlowResult {
    /// Blocks ordered begin ascending, end descending.
    pub blocks: Vec<Block>,
    /// Lines needing a goto label.
    pub labels: FxHashSet<usize>,
    /// Boolean materialization placeholders referenced from block
    /// conditions.
    pub finalsets: FinalSets,
    /// Declarations after for-loop variable marking.
    pub decls: DeclList,
}

/// One function of a chunk queued for reconstruction.
pub struct ChunkFunction {
    pub code: Code,
    pub func: FuncInfo,
    /// Declarations from debug info, when present.
    pub named: Option<Vec<Declaration>>,
}

/// Reconstruct one function.
///
/// `counter` feeds synthesized local names and is shared across a chunk so
/// names stay unique between functions.
pub fn reconstruct_function(
    code: &Code,
    func: &FuncInfo,
    named: Option<Vec<Declaration>>,
    settings: Settings,
    counter: &mut usize,
) -> Result<FlowResult, FlowError> {
    let mut decls = match named {
        Some(named) if !settings.no_debug => DeclList::new(named),
        Some(named) => {
            DeclList::new(merge_declarations(infer_declarations(code, func, counter), named))
        }
        None => DeclList::new(infer_declarations(code, func, counter)),
    };
    let out = relume_flow::reconstruct(code, func, &mut decls, settings, &NoExtraStatements)?;
    Ok(FlowResult {
        blocks: out.blocks,
        labels: out.labels,
        finalsets: out.finalsets,
        decls,
    })
}

/// Reconstruct every function of a chunk, collecting per-function results.
///
/// Failures stay attached to the function that produced them.
pub fn reconstruct_chunk(
    functions: &[ChunkFunction],
    settings: Settings,
) -> Vec<Result<FlowResult, FlowError>> {
    let mut counter = 0usize;
    functions
        .iter()
        .map(|f| reconstruct_function(&f.code, &f.func, f.named.clone(), settings, &mut counter))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relume_bytecode::{Instr, Op, Version};

    fn plain_if() -> ChunkFunction {
        ChunkFunction {
            code: Code::new(
                Version::lua51(),
                vec![
                    Instr::abc(Op::Test, 0, 0, 0),
                    Instr::asbx(Op::Jmp, 0, 1),
                    Instr::abx(Op::LoadK, 1, 0),
                    Instr::abc(Op::Return, 0, 1, 0),
                ],
                &[],
            ),
            func: FuncInfo::new(0, 8, false, true),
            named: None,
        }
    }

    fn broken() -> ChunkFunction {
        // A conditional with no paired jump is not valid compiler output.
        ChunkFunction {
            code: Code::new(
                Version::lua51(),
                vec![Instr::abc(Op::Test, 0, 0, 0), Instr::abc(Op::Return, 0, 1, 0)],
                &[],
            ),
            func: FuncInfo::new(0, 8, false, true),
            named: None,
        }
    }

    #[test]
    fn test_failing_function_does_not_abort_siblings() {
        let results = reconstruct_chunk(&[plain_if(), broken(), plain_if()], Settings::default());
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(FlowError::UnsupportedShape { line: 1, .. })));
        assert!(results[2].is_ok());
        let first = results[0].as_ref().unwrap();
        assert!(matches!(first.blocks[1].kind, BlockKind::IfThenEnd { .. }));
    }

    #[test]
    fn test_inferred_names_stay_unique_across_chunk() {
        let body = || {
            ChunkFunction {
                code: Code::new(
                    Version::lua54(),
                    vec![
                        Instr::abc(Op::Add54, 2, 0, 1),
                        Instr::abc(Op::Add54, 3, 2, 1),
                        Instr::abc(Op::Add54, 2, 0, 1),
                        Instr::abc(Op::Add54, 3, 2, 2),
                        Instr::abc(Op::Return54, 3, 2, 0),
                    ],
                    &[],
                ),
                func: FuncInfo::new(2, 4, false, true),
                named: None,
            }
        };
        let results = reconstruct_chunk(&[body(), body()], Settings::default());
        let mut names: Vec<String> = Vec::new();
        for result in &results {
            let r = result.as_ref().unwrap();
            assert!(matches!(r.blocks[0].kind, BlockKind::Outer { .. }));
            names.extend(r.decls.iter().map(|d| d.name.clone()));
        }
        let unique: std::collections::BTreeSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        assert!(names.iter().any(|n| n.starts_with("L2_")));
    }

    #[test]
    fn test_named_declarations_used_when_debug_info_present() {
        let mut f = plain_if();
        f.named = Some(vec![Declaration::new("flag".into(), 0, 0, 3)]);
        let mut counter = 0;
        let result =
            reconstruct_function(&f.code, &f.func, f.named, Settings::default(), &mut counter)
                .unwrap();
        let names: Vec<&str> = result.decls.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["flag"]);
        assert_eq!(counter, 0);
    }
}
