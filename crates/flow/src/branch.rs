//! Branch records and the ordered, doubly linked sequence they live in.
//!
//! Branches are arena allocated and addressed by stable ids; the links are
//! explicit index fields. Removal unlinks a node from its neighbors but
//! leaves the node's own `prev`/`next` intact, so a walk holding a removed
//! id can still continue from where that node used to be. Every pass in
//! this crate depends on that property.

use crate::condition::{Cond, FinalId};

/// What a branch was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// Comparison instruction plus its paired jump.
    Comparison,
    /// Truthiness test plus its paired jump.
    Test,
    /// Test that also materializes a boolean into a register.
    TestSet,
    /// Completion point of a boolean materialization chain.
    FinalSet,
    /// Plain unconditional jump.
    Jump,
}

/// A candidate control flow edge.
#[derive(Debug, Clone)]
pub struct Branch {
    pub kind: BranchKind,
    /// First source instruction.
    pub line: usize,
    /// Last source instruction of a combined multi-instruction condition.
    pub line2: usize,
    pub cond: Option<Cond>,
    /// Position reached when the condition holds (for jumps, the target).
    pub target_first: usize,
    /// Position reached when the condition fails (for jumps, the target).
    pub target_second: usize,
    /// Whether the stored condition is logically negated.
    pub inverse_value: bool,
    /// Register a materialization writes, or -1.
    pub register: i32,
    /// Paired finalset placeholder, if part of a materialization idiom.
    pub finalset: Option<FinalId>,
}

impl Branch {
    pub fn new(
        kind: BranchKind,
        line: usize,
        line2: usize,
        cond: Option<Cond>,
        target_first: usize,
        target_second: usize,
        finalset: Option<FinalId>,
    ) -> Self {
        Branch {
            kind,
            line,
            line2,
            cond,
            target_first,
            target_second,
            inverse_value: false,
            register: -1,
            finalset,
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self.kind, BranchKind::Comparison | BranchKind::Test)
    }

    pub fn is_assignment(&self) -> bool {
        self.kind == BranchKind::TestSet
    }

    pub fn is_assignment_to(&self, register: i32) -> bool {
        self.kind == BranchKind::TestSet
            || self.kind == BranchKind::Test && self.register == register
    }

    /// Whether the branch's condition is its own raw finalset placeholder.
    pub fn cond_is_finalset(&self) -> bool {
        match (&self.cond, self.finalset) {
            (Some(Cond::FinalSet(id)), Some(fs)) => *id == fs,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchId(u32);

struct Node {
    branch: Branch,
    prev: Option<BranchId>,
    next: Option<BranchId>,
    live: bool,
}

/// The branch sequence plus the per-line registries used while it is being
/// assembled and rewritten.
///
/// Each line owns up to one plain (comparison/test/jump) branch, up to one
/// testset branch, and any number of finalset branches. `link` threads the
/// registries into one chain ordered by line, finalsets first within a
/// line, so a finalset conceptually precedes the branch that consumes it.
pub struct BranchList {
    nodes: Vec<Node>,
    head: Option<BranchId>,
    tail: Option<BranchId>,
    plain: Vec<Option<BranchId>>,
    sets: Vec<Option<BranchId>>,
    finals: Vec<Vec<BranchId>>,
}

impl BranchList {
    pub fn new(length: usize) -> Self {
        BranchList {
            nodes: Vec::new(),
            head: None,
            tail: None,
            plain: vec![None; length + 2],
            sets: vec![None; length + 2],
            finals: vec![Vec::new(); length + 2],
        }
    }

    pub fn head(&self) -> Option<BranchId> {
        self.head
    }

    pub fn tail(&self) -> Option<BranchId> {
        self.tail
    }

    pub fn branch(&self, id: BranchId) -> &Branch {
        &self.nodes[id.0 as usize].branch
    }

    pub fn branch_mut(&mut self, id: BranchId) -> &mut Branch {
        &mut self.nodes[id.0 as usize].branch
    }

    /// Successor link. Valid on removed nodes too; it reports the neighbor
    /// at the time of removal.
    pub fn next(&self, id: BranchId) -> Option<BranchId> {
        self.nodes[id.0 as usize].next
    }

    pub fn prev(&self, id: BranchId) -> Option<BranchId> {
        self.nodes[id.0 as usize].prev
    }

    /// Live branch registered at `line` in the plain registry.
    pub fn plain_at(&self, line: usize) -> Option<BranchId> {
        self.plain.get(line).copied().flatten()
    }

    /// Allocate and register a branch. Linking into the chain happens
    /// separately once extraction has seen the whole function.
    pub fn insert(&mut self, branch: Branch) -> BranchId {
        let id = BranchId(self.nodes.len() as u32);
        self.nodes.push(Node { branch, prev: None, next: None, live: true });
        self.register(id);
        id
    }

    fn register(&mut self, id: BranchId) {
        let (kind, line) = {
            let b = &self.nodes[id.0 as usize].branch;
            (b.kind, b.line)
        };
        match kind {
            BranchKind::FinalSet => self.finals[line].push(id),
            BranchKind::TestSet => self.sets[line] = Some(id),
            _ => self.plain[line] = Some(id),
        }
    }

    fn unregister(&mut self, id: BranchId) {
        let (kind, line) = {
            let b = &self.nodes[id.0 as usize].branch;
            (b.kind, b.line)
        };
        match kind {
            BranchKind::FinalSet => self.finals[line].retain(|&f| f != id),
            BranchKind::TestSet => {
                if self.sets[line] == Some(id) {
                    self.sets[line] = None;
                }
            }
            _ => {
                if self.plain[line] == Some(id) {
                    self.plain[line] = None;
                }
            }
        }
    }

    /// Thread every registered branch into one ordered chain.
    pub fn link(&mut self) {
        let mut previous: Option<BranchId> = None;
        self.head = None;
        for line in 0..self.plain.len() {
            let mut at_line: Vec<BranchId> = Vec::new();
            at_line.extend(self.finals[line].iter().copied());
            at_line.extend(self.sets[line]);
            at_line.extend(self.plain[line]);
            for id in at_line {
                self.nodes[id.0 as usize].prev = previous;
                match previous {
                    Some(p) => self.nodes[p.0 as usize].next = Some(id),
                    None => self.head = Some(id),
                }
                previous = Some(id);
            }
        }
        self.tail = previous;
    }

    /// Unlink a branch from the chain and drop it from its registry. The
    /// removed node keeps its own links.
    pub fn remove(&mut self, id: BranchId) {
        self.unregister(id);
        self.nodes[id.0 as usize].live = false;
        let (prev, next) = {
            let n = &self.nodes[id.0 as usize];
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.nodes[p.0 as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n.0 as usize].prev = prev,
            None => self.tail = prev,
        }
    }

    /// Replace a combined pair with its merged result: `b0` is fully
    /// removed, `b1` is dropped from its registry only, and the new branch
    /// takes `b1`'s position in the chain.
    pub fn replace(&mut self, b0: BranchId, b1: BranchId, branch: Branch) -> BranchId {
        self.remove(b0);
        self.unregister(b1);
        self.nodes[b1.0 as usize].live = false;
        let id = BranchId(self.nodes.len() as u32);
        let (prev, next) = {
            let n = &self.nodes[b1.0 as usize];
            (n.prev, n.next)
        };
        self.nodes.push(Node { branch, prev, next, live: true });
        match prev {
            Some(p) => self.nodes[p.0 as usize].next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(n) => self.nodes[n.0 as usize].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.register(id);
        id
    }

    /// Number of branches still in the chain.
    pub fn live_count(&self) -> usize {
        let mut count = 0;
        let mut b = self.head;
        while let Some(id) = b {
            count += 1;
            b = self.next(id);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jump(line: usize, target: usize) -> Branch {
        Branch::new(BranchKind::Jump, line, line, None, target, target, None)
    }

    fn test_branch(line: usize) -> Branch {
        let cond = Cond::Test { line, register: 0, negated: false };
        Branch::new(BranchKind::Test, line, line, Some(cond), line + 2, line + 5, None)
    }

    #[test]
    fn test_link_orders_finalsets_first_within_line() {
        let mut list = BranchList::new(10);
        let j = list.insert(jump(4, 8));
        let f = list.insert(Branch::new(BranchKind::FinalSet, 4, 4, None, 4, 8, None));
        let t = list.insert(test_branch(2));
        list.link();
        assert_eq!(list.head(), Some(t));
        assert_eq!(list.next(t), Some(f));
        assert_eq!(list.next(f), Some(j));
        assert_eq!(list.tail(), Some(j));
    }

    #[test]
    fn test_removed_node_keeps_links_for_in_flight_walks() {
        let mut list = BranchList::new(10);
        let a = list.insert(test_branch(1));
        let b = list.insert(jump(4, 8));
        let c = list.insert(jump(6, 9));
        list.link();
        list.remove(b);
        // Chain skips the removed node.
        assert_eq!(list.next(a), Some(c));
        assert_eq!(list.prev(c), Some(a));
        // A walk still parked on it can continue.
        assert_eq!(list.next(b), Some(c));
        assert_eq!(list.prev(b), Some(a));
        assert_eq!(list.plain_at(4), None);
    }

    #[test]
    fn test_replace_takes_second_position() {
        let mut list = BranchList::new(12);
        let a = list.insert(test_branch(1));
        let b = list.insert(test_branch(3));
        let c = list.insert(jump(8, 10));
        list.link();
        let merged = list.replace(a, b, test_branch(3));
        assert_eq!(list.head(), Some(merged));
        assert_eq!(list.next(merged), Some(c));
        assert_eq!(list.prev(merged), None);
        assert_eq!(list.live_count(), 2);
    }
}
