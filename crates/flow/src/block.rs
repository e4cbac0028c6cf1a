//! Structure blocks recovered from the branch graph.
//!
//! A block is a half-open line range `[begin, end)` plus a kind payload.
//! Break and Goto are empty ranges pinned at their source line. The final
//! block list is ordered by begin ascending, end descending, priority
//! ascending, so an enclosing block always precedes the blocks inside it.

use relume_bytecode::CloseType;

use crate::condition::Cond;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    /// Whole-function scope.
    Outer { scope_adjustment: i32 },
    IfThenEnd {
        cond: Cond,
        /// The jump guarding the body did not literally target the end;
        /// it was redirected there.
        redirected: bool,
    },
    IfThenElse {
        cond: Cond,
        /// First line after the else body.
        else_target: usize,
    },
    ElseEnd,
    While {
        cond: Cond,
        /// Condition compiled at the top of the loop.
        top_condition: bool,
        /// Line the bottom jump returns to.
        loopback: usize,
    },
    Repeat {
        cond: Cond,
        /// Explicit scope end when the until condition shares the body
        /// scope.
        scope_end: Option<usize>,
    },
    AlwaysLoop {
        /// Renders as `repeat ... until false` rather than `while true`.
        repeat: bool,
    },
    /// Single-iteration loop synthesized to host forward jumps as breaks.
    OnceLoop,
    NumericFor {
        register: i32,
        /// Loop variable closed just before the loop instruction.
        var_pre_close: bool,
        /// Loop variable closed just after the loop.
        var_post_close: bool,
    },
    GenericFor {
        register: i32,
        var_count: i32,
        var_close: bool,
        inner_close: bool,
    },
    /// Boolean materialization of a combined condition into a register.
    SetBlock { cond: Cond, register: i32 },
    DoEnd,
    Break { target: usize },
    Goto { target: usize },
}

#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    pub begin: usize,
    pub end: usize,
    pub close_type: CloseType,
    pub close_line: Option<usize>,
    /// Register a synthesized do..end block exists to close, or -1.
    pub close_register: i32,
    pub scope_used: bool,
    pub close_used: bool,
}

impl Block {
    pub fn new(kind: BlockKind, begin: usize, end: usize) -> Self {
        Block {
            kind,
            begin,
            end,
            close_type: CloseType::None,
            close_line: None,
            close_register: -1,
            scope_used: false,
            close_used: false,
        }
    }

    pub fn contains(&self, line: usize) -> bool {
        self.begin <= line && line < self.end
    }

    pub fn contains_range(&self, begin: usize, end: usize) -> bool {
        self.begin <= begin && self.end >= end
    }

    pub fn contains_block(&self, other: &Block) -> bool {
        self.contains_range(other.begin, other.end)
    }

    pub fn breakable(&self) -> bool {
        matches!(
            self.kind,
            BlockKind::While { .. }
                | BlockKind::Repeat { .. }
                | BlockKind::AlwaysLoop { .. }
                | BlockKind::OnceLoop
                | BlockKind::NumericFor { .. }
                | BlockKind::GenericFor { .. }
        )
    }

    /// Whether the block ends in a jump instruction of its own, so inner
    /// jumps targeting the end get redirected past it by the compiler.
    pub fn is_unprotected(&self) -> bool {
        match self.kind {
            BlockKind::IfThenElse { .. } => true,
            BlockKind::While { top_condition, .. } => top_condition,
            BlockKind::AlwaysLoop { .. } => true,
            _ => false,
        }
    }

    /// Ultimate destination of the block's closing jump.
    pub fn unprotected_target(&self) -> Option<usize> {
        match self.kind {
            BlockKind::IfThenElse { else_target, .. } => Some(else_target),
            BlockKind::While { top_condition: true, loopback, .. } => Some(loopback),
            BlockKind::AlwaysLoop { .. } => Some(self.begin),
            _ => None,
        }
    }

    /// Line of the block's closing jump.
    pub fn unprotected_line(&self) -> Option<usize> {
        if self.is_unprotected() {
            Some(self.end - 1)
        } else {
            None
        }
    }

    pub fn is_splitable(&self) -> bool {
        matches!(self.kind, BlockKind::While { top_condition: true, .. })
    }

    /// Split a top-condition while loop whose condition turned out to
    /// guard only a prefix of the body: the loop becomes an always-loop
    /// from its own loopback and the condition becomes a leading if block
    /// ending at `line + 1`.
    pub fn split(&mut self, line: usize, close_type: CloseType, close_line: Option<usize>) -> Option<Block> {
        if !self.is_splitable() {
            return None;
        }
        match std::mem::replace(&mut self.kind, BlockKind::AlwaysLoop { repeat: false }) {
            BlockKind::While { cond, loopback, .. } => {
                let old_begin = self.begin;
                self.begin = loopback;
                let mut head =
                    Block::new(BlockKind::IfThenEnd { cond, redirected: false }, old_begin, line + 1);
                head.close_type = close_type;
                head.close_line = close_line;
                Some(head)
            }
            other => {
                self.kind = other;
                None
            }
        }
    }

    /// Last line a local declared inside the block can extend to.
    pub fn scope_end(&self) -> i64 {
        let end = self.end as i64;
        match self.kind {
            BlockKind::Outer { scope_adjustment } => end - 1 + scope_adjustment as i64,
            BlockKind::While { .. } | BlockKind::AlwaysLoop { .. } => end - 2,
            BlockKind::Repeat { scope_end: Some(s), .. } => s as i64,
            _ => end - 1,
        }
    }

    fn priority(&self) -> u8 {
        match self.kind {
            BlockKind::Outer { .. } => 0,
            BlockKind::SetBlock { .. } => 2,
            BlockKind::Break { .. } | BlockKind::Goto { .. } => 3,
            _ => 1,
        }
    }
}

pub(crate) fn sort_blocks(blocks: &mut [Block]) {
    blocks.sort_by(|a, b| {
        a.begin
            .cmp(&b.begin)
            .then_with(|| b.end.cmp(&a.end))
            .then_with(|| a.priority().cmp(&b.priority()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cond() -> Cond {
        Cond::Test { line: 1, register: 0, negated: false }
    }

    #[test]
    fn test_sort_puts_enclosing_blocks_first() {
        let mut blocks = vec![
            Block::new(BlockKind::Break { target: 9 }, 4, 4),
            Block::new(
                BlockKind::IfThenEnd { cond: test_cond(), redirected: false },
                3,
                6,
            ),
            Block::new(BlockKind::Outer { scope_adjustment: -1 }, 1, 10),
            Block::new(
                BlockKind::While { cond: test_cond(), top_condition: true, loopback: 1 },
                3,
                9,
            ),
        ];
        sort_blocks(&mut blocks);
        assert!(matches!(blocks[0].kind, BlockKind::Outer { .. }));
        assert!(matches!(blocks[1].kind, BlockKind::While { .. }));
        assert!(matches!(blocks[2].kind, BlockKind::IfThenEnd { .. }));
        assert!(matches!(blocks[3].kind, BlockKind::Break { .. }));
    }

    #[test]
    fn test_split_turns_while_into_always_loop_with_if_head() {
        let mut block = Block::new(
            BlockKind::While { cond: test_cond(), top_condition: true, loopback: 2 },
            5,
            12,
        );
        let head = block.split(7, CloseType::None, None).unwrap();
        assert!(matches!(block.kind, BlockKind::AlwaysLoop { repeat: false }));
        assert_eq!(block.begin, 2);
        assert_eq!(block.end, 12);
        assert_eq!((head.begin, head.end), (5, 8));
        assert!(matches!(head.kind, BlockKind::IfThenEnd { .. }));
    }

    #[test]
    fn test_unprotected_surface() {
        let w = Block::new(
            BlockKind::While { cond: test_cond(), top_condition: true, loopback: 3 },
            5,
            10,
        );
        assert!(w.is_unprotected());
        assert_eq!(w.unprotected_target(), Some(3));
        assert_eq!(w.unprotected_line(), Some(9));
        let r = Block::new(BlockKind::Repeat { cond: test_cond(), scope_end: None }, 2, 8);
        assert!(!r.is_unprotected());
        assert_eq!(r.unprotected_target(), None);
        assert_eq!(r.scope_end(), 7);
    }
}
