/// One captured upvalue of a child prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueRef {
    /// True when the upvalue captures a register of the enclosing function
    /// rather than one of its upvalues.
    pub in_stack: bool,
    /// Register or upvalue index in the enclosing function.
    pub index: i32,
}

/// Per-function header facts the analyses need beyond the instruction
/// stream itself.
#[derive(Debug, Clone)]
pub struct FuncInfo {
    /// Declared parameter count.
    pub params: usize,
    /// Register file size.
    pub registers: usize,
    /// Whether the function accepts varargs.
    pub vararg: bool,
    /// False only for the top-level chunk.
    pub has_parent: bool,
    /// Upvalue lists of each child prototype, indexed by CLOSURE Bx.
    pub child_upvalues: Vec<Vec<UpvalueRef>>,
}

impl FuncInfo {
    pub fn new(params: usize, registers: usize, vararg: bool, has_parent: bool) -> Self {
        FuncInfo { params, registers, vararg, has_parent, child_upvalues: Vec::new() }
    }

    /// Upvalue counts per child prototype, in CLOSURE Bx order.
    pub fn child_upvalue_counts(&self) -> Vec<usize> {
        self.child_upvalues.iter().map(|u| u.len()).collect()
    }
}
