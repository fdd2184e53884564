//! The pedantic linter: AST pattern rules that flag code which predates
//! (or ignores) the language's newer constructs. Each diagnostic carries
//! its rule id and source line; callers decide how to surface them.

use ast::{Ast, BinOp, NodeKind, NodeList, NodeRef, TableKey};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Rule {
    /// W1: `pledge(...)` after the registry has been sealed.
    PledgeAfterSeal,
    /// W2: bare `pcall`/`xpcall`.
    DeprecatedProtectedCall,
    /// W3: a local that only feeds the next condition.
    LocalMovableIntoCondition,
    /// W4: nested nil checks or and-chains that optional chaining covers.
    UseOptionalChaining,
    /// W5: parallel field reads that `from` destructuring covers.
    UseFromDestructuring,
}

impl Rule {
    pub fn id(self) -> &'static str {
        match self {
            Rule::PledgeAfterSeal => "W1",
            Rule::DeprecatedProtectedCall => "W2",
            Rule::LocalMovableIntoCondition => "W3",
            Rule::UseOptionalChaining => "W4",
            Rule::UseFromDestructuring => "W5",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Warning {
    pub rule: Rule,
    pub line: u32,
    pub message: String,
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.rule.id(), self.line, self.message)
    }
}

/// Run every pedantic rule over the tree, returning diagnostics in source
/// order.
pub fn check(ast: &Ast) -> Vec<Warning> {
    let mut linter = Linter {
        warnings: Vec::new(),
        sealed_at: None,
    };
    linter.scan(ast.root);
    if let NodeKind::Chunk { body } = ast.root.kind {
        linter.block(body);
    }
    linter.warnings.sort_by_key(|w| w.line);
    tracing::debug!(count = linter.warnings.len(), "pedantic lint finished");
    linter.warnings
}

struct Linter {
    warnings: Vec<Warning>,
    sealed_at: Option<u32>,
}

impl Linter {
    fn warn(&mut self, rule: Rule, line: u32, message: String) {
        self.warnings.push(Warning {
            rule,
            line,
            message,
        });
    }

    /// Source-order scan for the execution-order rules (W1) and bare-name
    /// rules (W2).
    fn scan(&mut self, node: NodeRef) {
        match &node.kind {
            NodeKind::CallExpr { func, args } => {
                if let NodeKind::Name { name: "pledge" } = func.kind {
                    let seals = args
                        .first()
                        .is_some_and(|a| matches!(a.kind, NodeKind::Str { value: "seal", .. }));
                    if seals {
                        self.sealed_at.get_or_insert(node.line);
                    } else if let Some(sealed) = self.sealed_at {
                        self.warn(
                            Rule::PledgeAfterSeal,
                            node.line,
                            format!(
                                "pledge() after seal on line {sealed} is a no-op: permissions are frozen"
                            ),
                        );
                    }
                }
            }
            NodeKind::Name { name } if matches!(*name, "pcall" | "xpcall") => {
                self.warn(
                    Rule::DeprecatedProtectedCall,
                    node.line,
                    format!("'{name}' is deprecated; use 'catch'"),
                );
            }
            _ => {}
        }
        for child in node.children() {
            self.scan(child);
        }
    }

    /// Statement-structure walk for the shape rules (W3, W4, W5).
    fn block(&mut self, stats: NodeList) {
        for (i, stat) in stats.iter().enumerate() {
            self.stat(stat, &stats[i + 1..]);
        }
    }

    fn stat(&mut self, node: NodeRef, rest: &[NodeRef]) {
        match &node.kind {
            NodeKind::Local { targets, values } => {
                self.check_from_candidate(node, targets, values);
                self.check_movable_local(node, targets, rest);
            }
            NodeKind::If {
                cond,
                body,
                else_ifs,
                else_body,
            } => {
                self.check_nested_nil_ifs(node, cond, body);
                self.check_and_chain(cond);
                self.block(body);
                for arm in *else_ifs {
                    if let NodeKind::ElseIf { cond, body } = &arm.kind {
                        self.check_and_chain(cond);
                        self.block(body);
                    }
                }
                if let Some(else_node) = else_body {
                    if let NodeKind::Else { body } = &else_node.kind {
                        self.block(body);
                    }
                }
            }
            NodeKind::While { cond, body } => {
                self.check_and_chain(cond);
                self.block(body);
            }
            NodeKind::Repeat { body, cond } => {
                self.block(body);
                self.check_and_chain(cond);
            }
            NodeKind::Do { body }
            | NodeKind::Block { body }
            | NodeKind::Chunk { body } => self.block(body),
            NodeKind::ForNum { body, .. } | NodeKind::ForGen { body, .. } => self.block(body),
            NodeKind::FuncStat { func, .. }
            | NodeKind::LocalFunc { func, .. }
            | NodeKind::GlobalFunc { func, .. } => {
                if let NodeKind::FuncExpr { body, .. } = func.kind {
                    self.block(body);
                }
            }
            _ => {
                // Function expressions anywhere in the statement get their
                // bodies checked too.
                for child in node.children() {
                    if let NodeKind::FuncExpr { body, .. } = child.kind {
                        self.block(body);
                    }
                }
            }
        }
    }

    /// W5: `local a, b = t.a, t.b` where every value reads the matching
    /// field off one table.
    fn check_from_candidate(&mut self, node: NodeRef, targets: NodeList, values: NodeList) {
        if targets.len() < 2 || targets.len() != values.len() {
            return;
        }
        let mut table = None;
        for (target, value) in targets.iter().zip(values.iter()) {
            let NodeKind::Param { name, attrib: None } = target.kind else {
                return;
            };
            let NodeKind::Field { object, field } = value.kind else {
                return;
            };
            if field != name {
                return;
            }
            let NodeKind::Name { name: source } = object.kind else {
                return;
            };
            match table {
                None => table = Some(source),
                Some(have) if have == source => {}
                Some(_) => return,
            }
        }
        if let Some(table) = table {
            self.warn(
                Rule::UseFromDestructuring,
                node.line,
                format!("locals mirror fields of '{table}': use 'from' destructuring (local ... from {table})"),
            );
        }
    }

    /// W3: a single local consumed only by the very next `if`/`while`
    /// condition can be declared inside it.
    fn check_movable_local(&mut self, node: NodeRef, targets: NodeList, rest: &[NodeRef]) {
        let [target] = targets else { return };
        let NodeKind::Param { name, attrib: None } = target.kind else {
            return;
        };
        let Some(next) = rest.first() else { return };
        let cond = match &next.kind {
            NodeKind::If { cond, .. } | NodeKind::While { cond, .. } => *cond,
            _ => return,
        };
        // Already an assignment condition.
        if matches!(cond.kind, NodeKind::Assign { .. }) {
            return;
        }
        if !references_name(cond, name) {
            return;
        }
        if rest[1..].iter().any(|stat| references_name(stat, name)) {
            return;
        }
        self.warn(
            Rule::LocalMovableIntoCondition,
            node.line,
            format!("local '{name}' only feeds the next condition: declare it there with an assignment condition"),
        );
    }

    /// W4a: `if x ~= nil then if x.y ~= nil then ...` nesting.
    fn check_nested_nil_ifs(&mut self, node: NodeRef, cond: NodeRef, body: NodeList) {
        let Some(outer) = nil_checked(cond) else { return };
        let NodeKind::Name { name } = outer.kind else {
            return;
        };
        let Some(first) = body.first() else { return };
        let NodeKind::If { cond: inner, .. } = &first.kind else {
            return;
        };
        let Some(checked) = nil_checked(inner) else {
            return;
        };
        if chain_root(checked) == Some(name) && matches!(checked.kind, NodeKind::Field { .. }) {
            self.warn(
                Rule::UseOptionalChaining,
                node.line,
                format!("nested nil checks on '{name}': use optional chaining ({name}?. ...)"),
            );
        }
    }

    /// W4b: `a and a.b and a.b.c` style chains.
    fn check_and_chain(&mut self, cond: NodeRef) {
        let mut terms = Vec::new();
        flatten_and(cond, &mut terms);
        if terms.len() < 3 {
            return;
        }
        if terms[1..]
            .iter()
            .all(|t| matches!(t.kind, NodeKind::Field { .. }))
        {
            let root = chain_root(terms[1]).unwrap_or("value");
            self.warn(
                Rule::UseOptionalChaining,
                cond.line,
                format!("'and' chain over fields of '{root}': use optional chaining"),
            );
        }
    }
}

/// The expression a `x ~= nil` comparison guards, if this is one.
fn nil_checked(cond: NodeRef) -> Option<NodeRef> {
    let NodeKind::BinOp {
        op: BinOp::Ne,
        lhs,
        rhs,
    } = &cond.kind
    else {
        return None;
    };
    if matches!(rhs.kind, NodeKind::Nil) {
        Some(*lhs)
    } else if matches!(lhs.kind, NodeKind::Nil) {
        Some(*rhs)
    } else {
        None
    }
}

/// The base name of a field-access chain (`a.b.c` → `a`).
fn chain_root<'a>(node: NodeRef<'a>) -> Option<&'a str> {
    match &node.kind {
        NodeKind::Name { name } => Some(name),
        NodeKind::Field { object, .. } | NodeKind::OptChain { object, .. } => chain_root(object),
        NodeKind::Index { object, .. } => chain_root(object),
        _ => None,
    }
}

fn flatten_and<'a>(node: NodeRef<'a>, out: &mut Vec<NodeRef<'a>>) {
    if let NodeKind::BinOp {
        op: BinOp::And,
        lhs,
        rhs,
    } = &node.kind
    {
        flatten_and(lhs, out);
        out.push(rhs);
    } else {
        out.push(node);
    }
}

fn references_name(node: NodeRef, name: &str) -> bool {
    if let NodeKind::Name { name: have } = node.kind {
        if have == name {
            return true;
        }
    }
    node.children()
        .into_iter()
        .any(|child| references_name(child, name))
}

#[cfg(test)]
mod test {
    use super::*;

    fn lint(source: &str) -> Vec<Warning> {
        let arena = arena::Arena::new();
        let parsed = parser::parse(source, "test", &arena, &parser::Options::default())
            .expect("lint fixtures parse");
        check(&parsed.ast.expect("ast requested"))
    }

    fn rules(warnings: &[Warning]) -> Vec<Rule> {
        warnings.iter().map(|w| w.rule).collect()
    }

    #[test]
    fn pledge_after_seal_warns() {
        let warnings = lint("pledge('seal')\npledge('fs:read')\n");
        assert_eq!(rules(&warnings), vec![Rule::PledgeAfterSeal]);
        assert_eq!(warnings[0].line, 2);

        assert!(lint("pledge('fs:read')\npledge('seal')\n").is_empty());
    }

    #[test]
    fn bare_pcall_warns() {
        let warnings = lint("local ok = pcall(f)\nlocal ok2 = xpcall(f, h)\n");
        assert_eq!(
            rules(&warnings),
            vec![
                Rule::DeprecatedProtectedCall,
                Rule::DeprecatedProtectedCall
            ]
        );
        assert!(warnings[0].message.contains("use 'catch'"));
    }

    #[test]
    fn movable_local_warns_only_when_unused_after() {
        let warnings = lint("local x = f()\nif x then g() end\n");
        assert_eq!(rules(&warnings), vec![Rule::LocalMovableIntoCondition]);
        assert_eq!(warnings[0].line, 1);

        // Used after the construct: no warning.
        assert!(lint("local x = f()\nif x then g() end\nreturn x\n").is_empty());
    }

    #[test]
    fn nested_nil_ifs_warn() {
        let warnings = lint("if x ~= nil then if x.y ~= nil then f(x.y) end end\n");
        assert_eq!(rules(&warnings), vec![Rule::UseOptionalChaining]);
        assert!(warnings[0].message.contains("optional chaining"));
    }

    #[test]
    fn and_chains_over_fields_warn() {
        let warnings = lint("if a and a.b and a.b.c then f() end\n");
        assert_eq!(rules(&warnings), vec![Rule::UseOptionalChaining]);

        // A two-term chain is fine.
        assert!(lint("if a and a.b then f() end\n").is_empty());
    }

    #[test]
    fn parallel_field_reads_suggest_from() {
        let warnings = lint("local a, b, c = t.a, t.b, t.c\n");
        assert_eq!(rules(&warnings), vec![Rule::UseFromDestructuring]);
        assert!(warnings[0].message.contains("use 'from' destructuring"));
        assert!(warnings[0].message.contains("t"));

        // Mismatched names or mixed tables do not warn.
        assert!(lint("local a, b = t.a, u.b\n").is_empty());
        assert!(lint("local a, b = t.b, t.a\n").is_empty());
    }

    #[test]
    fn warnings_inside_function_bodies_are_found() {
        let warnings = lint("local function f()\n  local a, b = t.a, t.b\nend\n");
        assert_eq!(rules(&warnings), vec![Rule::UseFromDestructuring]);
    }
}
