//! Local variable declarations: debug-info backed construction, lifetime
//! inference for stripped functions, and the scope queries the control-flow
//! engine asks while shaping blocks.

mod analyzer;
mod declaration;

pub use analyzer::{infer_declarations, merge_declarations};
pub use declaration::Declaration;

/// The declaration set of one function.
#[derive(Debug, Clone, Default)]
pub struct DeclList {
    decls: Vec<Declaration>,
}

impl DeclList {
    pub fn new(decls: Vec<Declaration>) -> Self {
        DeclList { decls }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Declaration> {
        self.decls.iter()
    }

    pub fn push(&mut self, decl: Declaration) {
        self.decls.push(decl);
    }

    /// Whether `register` holds a named local at `line`.
    pub fn is_local(&self, register: i32, line: usize) -> bool {
        self.decls
            .iter()
            .any(|d| d.register == register && d.begin <= line && line <= d.end)
    }

    /// Declarations whose scope opens exactly at `line`.
    pub fn new_locals(&self, line: usize) -> impl Iterator<Item = &Declaration> {
        self.decls.iter().filter(move |d| d.begin == line)
    }

    /// Whether a block spanning `[begin, end)` entered at `line` would cut
    /// any declaration's scope.
    pub fn splits(&self, line: usize, begin: usize, end: usize) -> bool {
        self.decls.iter().any(|d| d.is_split_by(line, begin, end))
    }

    /// Flag the declaration covering `line` in `register` as an invisible
    /// for-loop bookkeeping variable.
    pub fn mark_for_loop(&mut self, register: i32, line: usize) {
        for d in &mut self.decls {
            if d.register == register && d.begin <= line && line <= d.end {
                d.for_loop = true;
            }
        }
    }

    /// Flag the declaration covering `line` in `register` as an explicit
    /// for-loop variable.
    pub fn mark_for_loop_explicit(&mut self, register: i32, line: usize) {
        for d in &mut self.decls {
            if d.register == register && d.begin <= line && line <= d.end {
                d.for_loop_explicit = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> DeclList {
        DeclList::new(vec![
            Declaration::new("a".into(), 0, 1, 20),
            Declaration::new("b".into(), 1, 5, 12),
            Declaration::new("c".into(), 2, 5, 8),
        ])
    }

    #[test]
    fn test_is_local_respects_extent() {
        let l = list();
        assert!(l.is_local(1, 5));
        assert!(l.is_local(1, 12));
        assert!(!l.is_local(1, 13));
        assert!(!l.is_local(3, 5));
    }

    #[test]
    fn test_new_locals_groups_by_begin_line() {
        let l = list();
        let at5: Vec<&str> = l.new_locals(5).map(|d| d.name.as_str()).collect();
        assert_eq!(at5, ["b", "c"]);
        assert_eq!(l.new_locals(2).count(), 0);
    }

    #[test]
    fn test_splits_consults_every_declaration() {
        let l = list();
        // "b" lives past line 10, so a block [6, 11) entered at 4 cuts it.
        assert!(l.splits(4, 6, 11));
        assert!(!l.splits(14, 15, 21));
    }
}
