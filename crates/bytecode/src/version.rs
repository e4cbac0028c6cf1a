use crate::opcode::Op;

/// Where the compiled while-loop condition sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhileFormat {
    /// Condition compiled at the top of the loop, backward jump at the
    /// bottom (5.1 and later).
    TopCondition,
    /// Condition compiled at the bottom, entry jump over the body (5.0).
    BottomCondition,
}

/// How scope-exit instructions are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseSemantics {
    /// Dedicated CLOSE instruction (5.0/5.1).
    Default,
    /// JMP with a nonzero A field doubles as a close (5.2/5.3).
    Jump,
    /// Dedicated CLOSE plus to-be-closed variables (5.4).
    Lua54,
}

/// How a function's vararg surface is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarArgType {
    /// Implicit `arg` table (5.0).
    Arg,
    /// `arg` table or `...` depending on a per-function flag (5.1).
    Hybrid,
    /// `...` only (5.2+).
    Ellipsis,
}

/// Per-version capability set.
///
/// Resolved once per function from the declared bytecode version and passed
/// down by reference; recognizers branch on these flags instead of on
/// version numbers.
#[derive(Debug, Clone)]
pub struct Version {
    /// Jump-target opcode identifying a 5.0-style numeric for loop.
    pub for_target: Option<Op>,
    /// Jump-target opcode identifying a 5.1-5.3-style generic for loop.
    pub tfor_target: Option<Op>,
    pub while_format: WhileFormat,
    pub close_semantics: CloseSemantics,
    /// Whether the source language has `goto`.
    pub use_goto: bool,
    /// Whether the compiler rewrites `if cond then break end` into an
    /// inverted conditional jump (so the undone form must be restored).
    pub use_if_break_rewrite: bool,
    /// Whether repeat-until scope extends over the until condition.
    pub extended_repeat_scope: bool,
    /// Whether a loop's close instruction sits inside the loop scope.
    pub close_in_scope: bool,
    /// Whether CLOSURE is followed by pseudo-instructions naming each
    /// captured register.
    pub inline_upvalues: bool,
    pub vararg_type: VarArgType,
    /// Adjustment applied to the outer block's scope end when synthesizing
    /// whole-function declarations.
    pub outer_scope_adjustment: i32,
}

impl Version {
    pub fn lua50() -> Self {
        Version {
            for_target: Some(Op::ForLoop),
            tfor_target: None,
            while_format: WhileFormat::BottomCondition,
            close_semantics: CloseSemantics::Default,
            use_goto: false,
            use_if_break_rewrite: false,
            extended_repeat_scope: false,
            close_in_scope: false,
            inline_upvalues: true,
            vararg_type: VarArgType::Arg,
            outer_scope_adjustment: -1,
        }
    }

    pub fn lua51() -> Self {
        Version {
            for_target: None,
            tfor_target: Some(Op::TForLoop),
            while_format: WhileFormat::TopCondition,
            close_semantics: CloseSemantics::Default,
            use_goto: false,
            use_if_break_rewrite: false,
            extended_repeat_scope: false,
            close_in_scope: true,
            inline_upvalues: true,
            vararg_type: VarArgType::Hybrid,
            outer_scope_adjustment: -1,
        }
    }

    pub fn lua52() -> Self {
        Version {
            for_target: None,
            tfor_target: Some(Op::TForCall),
            while_format: WhileFormat::TopCondition,
            close_semantics: CloseSemantics::Jump,
            use_goto: true,
            use_if_break_rewrite: true,
            extended_repeat_scope: false,
            close_in_scope: false,
            inline_upvalues: false,
            vararg_type: VarArgType::Ellipsis,
            outer_scope_adjustment: -1,
        }
    }

    pub fn lua53() -> Self {
        Version {
            tfor_target: Some(Op::TForCall),
            ..Version::lua52()
        }
    }

    pub fn lua54() -> Self {
        Version {
            for_target: None,
            tfor_target: None,
            while_format: WhileFormat::TopCondition,
            close_semantics: CloseSemantics::Lua54,
            use_goto: true,
            use_if_break_rewrite: true,
            extended_repeat_scope: true,
            close_in_scope: true,
            inline_upvalues: false,
            vararg_type: VarArgType::Ellipsis,
            outer_scope_adjustment: 0,
        }
    }
}
