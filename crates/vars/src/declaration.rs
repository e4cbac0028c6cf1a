use relume_bytecode::{Code, Op};

/// A local variable's register and line extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub name: String,
    pub register: i32,
    /// First line on which the variable is in scope.
    pub begin: usize,
    /// Last line on which the variable is in scope.
    pub end: usize,
    /// To-be-closed variable (5.4 `<close>` attribute).
    pub tbc: bool,
    /// Invisible for-loop bookkeeping variable.
    pub for_loop: bool,
    /// Explicitly declared for-loop variable.
    pub for_loop_explicit: bool,
}

impl Declaration {
    pub fn new(name: String, register: i32, begin: usize, end: usize) -> Self {
        Declaration {
            name,
            register,
            begin,
            end,
            tbc: false,
            for_loop: false,
            for_loop_explicit: false,
        }
    }

    /// Build a declaration from a debug-info local entry.
    ///
    /// When the recorded start line lands on a metamethod or extra-arg
    /// continuation instruction the declaration actually begins one line
    /// earlier, on the instruction those continuations belong to.
    pub fn from_debug_local(name: String, register: i32, start: usize, end: usize, code: &Code) -> Self {
        let mut begin = start;
        if start >= 1 && start <= code.length() {
            match code.op(start) {
                Op::MmBin | Op::MmBinI | Op::MmBinK | Op::ExtraArg => begin -= 1,
                _ => {}
            }
        }
        Declaration::new(name, register, begin, end)
    }

    /// Whether a block spanning `[begin, end)` with a jump at `line` would
    /// cut this variable's scope in half.
    pub fn is_split_by(&self, line: usize, begin: usize, end: usize) -> bool {
        let scope_end = end as i64 - 1;
        let line = line as i64;
        let mut begin = begin as i64;
        if begin == end as i64 {
            begin -= 1;
        }
        let d_begin = self.begin as i64;
        let d_end = self.end as i64;
        d_begin >= line && d_begin < begin
            || d_end >= line && d_end < begin
            || d_begin < begin && d_end >= begin && d_end < scope_end
            || d_begin >= begin && d_begin <= scope_end && d_end > scope_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relume_bytecode::{Instr, Version};

    #[test]
    fn test_debug_local_begin_adjustment() {
        let code = Code::new(
            Version::lua54(),
            vec![
                Instr::abc(Op::Add54, 0, 1, 2),
                Instr::abc(Op::MmBin, 1, 2, 6),
                Instr::abc(Op::Return54, 0, 1, 0),
            ],
            &[],
        );
        let decl = Declaration::from_debug_local("x".into(), 0, 2, 3, &code);
        assert_eq!(decl.begin, 1);
        let decl = Declaration::from_debug_local("y".into(), 0, 1, 3, &code);
        assert_eq!(decl.begin, 1);
    }

    #[test]
    fn test_split_detection() {
        // Variable living past a candidate block's end is split by it.
        let decl = Declaration::new("x".into(), 0, 4, 10);
        assert!(decl.is_split_by(3, 4, 8));
        // Variable fully inside the block is not.
        let decl = Declaration::new("y".into(), 0, 5, 6);
        assert!(!decl.is_split_by(3, 4, 8));
        // Variable entirely before the block is not.
        let decl = Declaration::new("z".into(), 0, 1, 2);
        assert!(!decl.is_split_by(3, 4, 8));
    }
}
