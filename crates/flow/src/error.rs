use thiserror::Error;

/// Failure modes of control flow reconstruction.
///
/// All of these abort the enclosing function only; sibling functions are
/// unaffected. `Inconsistency` means an invariant the analysis relies on
/// was violated, which indicates either an unmodeled compiler idiom or a
/// defect in an earlier pass. It is never downgraded to a warning.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("unsupported bytecode shape at line {line}: {what}")]
    UnsupportedShape { line: usize, what: &'static str },

    #[error("internal inconsistency: {0}")]
    Inconsistency(&'static str),

    #[error("scope rule violation: a synthesized do..end block was required")]
    StrictScope,
}
