//! Graphviz rendering of an AST: one graph node per tree node, labeled
//! with its kind (and value, for literals and names), edges labeled by the
//! child's role. Node numbering is local to one dump.

use crate::{Ast, NodeKind, NodeRef, Number, TableKey};
use std::fmt::Write;

pub fn to_dot(ast: &Ast) -> String {
    let mut out = String::new();
    out.push_str("digraph ast {\n");
    out.push_str("  node [shape=box, fontname=\"monospace\"];\n");
    let mut next_id = 0usize;
    emit(ast.root, &mut next_id, &mut out);
    out.push_str("}\n");
    out
}

fn emit(node: NodeRef, next_id: &mut usize, out: &mut String) -> usize {
    let id = *next_id;
    *next_id += 1;
    writeln!(out, "  n{id} [label=\"{}\"];", escape(&label(node))).unwrap();
    for (role, child) in edges(node) {
        let child_id = emit(child, next_id, out);
        writeln!(out, "  n{id} -> n{child_id} [label=\"{role}\"];").unwrap();
    }
    id
}

fn label(node: NodeRef) -> String {
    use NodeKind::*;
    let kind = node.kind.name();
    match &node.kind {
        Number(self::Number::Int(i)) => format!("{kind} {i}"),
        Number(self::Number::Float(f)) => format!("{kind} {f:?}"),
        Str { value, .. } => format!("{kind} {value:?}"),
        Name { name } | Label { name } | GlobalFunc { name, .. } | LocalFunc { name, .. } => {
            format!("{kind} {name}")
        }
        Goto { label } => format!("{kind} {label}"),
        Param {
            name,
            attrib: Some(attrib),
        } => format!("{kind} {name} <{attrib}>"),
        Param { name, attrib: None } => format!("{kind} {name}"),
        Field { field, .. } => format!("{kind} {field}"),
        OptChain { field, .. } => format!("{kind} {field}"),
        MethodCall { method, .. } => format!("{kind} :{method}"),
        BinOp { op, .. } => format!("{kind} {}", op.symbol()),
        UnOp { op, .. } => format!("{kind} {}", op.symbol()),
        ErrorStat { message } => format!("{kind} {message:?}"),
        _ => kind.to_owned(),
    }
}

/// Role-labeled edges to direct children, in source order.
fn edges<'a>(node: NodeRef<'a>) -> Vec<(&'static str, NodeRef<'a>)> {
    use NodeKind::*;
    let mut out = Vec::new();
    let mut list = |out: &mut Vec<(&'static str, NodeRef<'a>)>, role, nodes: &[NodeRef<'a>]| {
        out.extend(nodes.iter().map(|n| (role, *n)));
    };
    match &node.kind {
        Chunk { body } | Block { body } | Do { body } | DoExpr { body } | Else { body } => {
            list(&mut out, "body", body)
        }
        Local { targets, values } | Global { targets, values } => {
            list(&mut out, "name", targets);
            list(&mut out, "value", values);
        }
        Assign { targets, values } => {
            list(&mut out, "target", targets);
            list(&mut out, "value", values);
        }
        If {
            cond,
            body,
            else_ifs,
            else_body,
        } => {
            out.push(("cond", *cond));
            list(&mut out, "then", body);
            list(&mut out, "elseif", else_ifs);
            if let Some(else_body) = else_body {
                out.push(("else", *else_body));
            }
        }
        ElseIf { cond, body } | While { cond, body } => {
            out.push(("cond", *cond));
            list(&mut out, "body", body);
        }
        Repeat { body, cond } => {
            list(&mut out, "body", body);
            out.push(("cond", *cond));
        }
        ForNum {
            var,
            start,
            limit,
            step,
            body,
        } => {
            out.push(("var", *var));
            out.push(("start", *start));
            out.push(("limit", *limit));
            if let Some(step) = step {
                out.push(("step", *step));
            }
            list(&mut out, "body", body);
        }
        ForGen {
            targets,
            values,
            body,
        } => {
            list(&mut out, "name", targets);
            list(&mut out, "value", values);
            list(&mut out, "body", body);
        }
        FuncStat { path, func, .. } => {
            list(&mut out, "path", path);
            out.push(("func", *func));
        }
        LocalFunc { func, .. } | GlobalFunc { func, .. } => out.push(("func", *func)),
        Return { values } | Provide { values } => list(&mut out, "value", values),
        CallStat { call } => out.push(("call", *call)),
        CatchStat { handler, expr } | CatchExpr { handler, expr } => {
            if let Some(handler) = handler {
                out.push(("handler", *handler));
            }
            out.push(("expr", *expr));
        }
        From { targets, source } => {
            list(&mut out, "name", targets);
            out.push(("source", *source));
        }
        Interp { parts } => list(&mut out, "part", parts),
        Index { object, index } => {
            out.push(("object", *object));
            out.push(("index", *index));
        }
        Field { object, .. } | OptChain { object, .. } => out.push(("object", *object)),
        Slice { object, start, end } => {
            out.push(("object", *object));
            if let Some(start) = start {
                out.push(("start", *start));
            }
            if let Some(end) = end {
                out.push(("end", *end));
            }
        }
        BinOp { lhs, rhs, .. } => {
            out.push(("L", *lhs));
            out.push(("R", *rhs));
        }
        UnOp { operand, .. } => out.push(("operand", *operand)),
        Table { fields } => list(&mut out, "field", fields),
        TableField { key, value } => {
            if let TableKey::Expr(key) = key {
                out.push(("key", *key));
            }
            out.push(("value", *value));
        }
        FuncExpr { params, body } => {
            list(&mut out, "param", params);
            list(&mut out, "body", body);
        }
        CallExpr { func, args } => {
            out.push(("func", *func));
            list(&mut out, "arg", args);
        }
        MethodCall { object, args, .. } => {
            out.push(("object", *object));
            list(&mut out, "arg", args);
        }
        Enum { names } => list(&mut out, "name", names),
        Break
        | Goto { .. }
        | Label { .. }
        | ErrorStat { .. }
        | Nil
        | True
        | False
        | Vararg
        | Number(_)
        | Str { .. }
        | Name { .. }
        | Param { .. } => {}
    }
    out
}

fn escape(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}
