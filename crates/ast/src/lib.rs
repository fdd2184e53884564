//! The side AST produced by the parser, arena-allocated and immutable.
//!
//! Nodes are built bottom-up during the parse and own their children
//! structurally: a node is referenced by exactly one parent, so the tree
//! shape the formatter and linter rely on holds by construction. All
//! string payloads are copied into the parse arena when nodes are built,
//! which is why traversals here never need to coordinate with the engine's
//! collector.

mod dot;
mod json;
mod node;

pub use dot::to_dot;
pub use json::to_json;
pub use node::{
    BinOp, Node, NodeKind, NodeList, NodeRef, Number, Quote, TableKey, UnOp, UNARY_PRIORITY,
};

/// A comment recorded by the lexer, in source order, with the `--` /
/// `--[[` `]]` delimiters stripped.
#[derive(Debug, Copy, Clone)]
pub struct Comment<'a> {
    pub line: u32,
    pub endline: u32,
    pub islong: bool,
    pub text: &'a str,
}

/// A syntax error accumulated in recover mode, carrying the parser's own
/// source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub line: u32,
    pub col: u32,
    pub message: String,
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

/// The AST container: root node, side lists, and the traversal flags the
/// parser honors while building.
pub struct Ast<'a> {
    pub root: NodeRef<'a>,
    pub comments: Vec<Comment<'a>>,
    pub errors: Vec<SyntaxError>,
    pub node_count: usize,
    /// When set before parsing, syntax errors are recorded on `errors`
    /// and a partial tree is produced instead of unwinding.
    pub recover: bool,
    /// When cleared, the lexer discards comments instead of recording them.
    pub include_comments: bool,
}

impl<'a> Ast<'a> {
    /// Walk every node reachable from the root in depth-first order.
    pub fn walk(&self, visit: &mut dyn FnMut(NodeRef<'a>)) {
        fn recurse<'a>(node: NodeRef<'a>, visit: &mut dyn FnMut(NodeRef<'a>)) {
            visit(node);
            for child in node.children() {
                recurse(child, visit);
            }
        }
        recurse(self.root, visit)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nodes_have_one_parent_each() {
        // Build a small tree by hand and confirm each node is reachable
        // through exactly one child edge.
        let arena = arena::Arena::new();
        let lhs = &*arena.alloc(Node::new(NodeKind::Number(Number::Int(1)), 1));
        let rhs = &*arena.alloc(Node::new(NodeKind::Number(Number::Int(2)), 1));
        let sum = &*arena.alloc(Node::new(
            NodeKind::BinOp {
                op: BinOp::Add,
                lhs,
                rhs,
            },
            1,
        ));
        let stat = &*arena.alloc(Node::new(
            NodeKind::Return {
                values: arena.alloc_slice_copy(&[sum]),
            },
            1,
        ));
        let root = &*arena.alloc(Node::new(
            NodeKind::Chunk {
                body: arena.alloc_slice_copy(&[stat]),
            },
            1,
        ));

        let ast = Ast {
            root,
            comments: Vec::new(),
            errors: Vec::new(),
            node_count: 5,
            recover: false,
            include_comments: true,
        };

        let mut seen = Vec::new();
        ast.walk(&mut |node| seen.push(node as *const Node));
        assert_eq!(seen.len(), 5);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5, "no node may be visited through two parents");
    }
}
