//! JSON rendering of an AST: one object per node with `type`, `line`, and
//! a kind-specific set of keyed children. Generic statement lists appear
//! under `children`. Control characters in strings are escaped by the
//! JSON encoder (`\u00XX`).

use crate::{Ast, NodeKind, NodeRef, Number, TableKey};
use serde_json::{json, Value};

pub fn to_json(ast: &Ast) -> Value {
    node_json(ast.root)
}

fn nodes_json(nodes: &[NodeRef]) -> Value {
    Value::Array(nodes.iter().map(|n| node_json(n)).collect())
}

fn opt_json(node: &Option<NodeRef>) -> Value {
    match node {
        Some(node) => node_json(node),
        None => Value::Null,
    }
}

fn node_json(node: NodeRef) -> Value {
    use NodeKind::*;
    let mut object = match &node.kind {
        Chunk { body } | Block { body } | Do { body } | DoExpr { body } | Else { body } => {
            json!({ "children": nodes_json(body) })
        }
        Local { targets, values } | Global { targets, values } => {
            json!({ "names": nodes_json(targets), "values": nodes_json(values) })
        }
        Assign { targets, values } => {
            json!({ "targets": nodes_json(targets), "values": nodes_json(values) })
        }
        If {
            cond,
            body,
            else_ifs,
            else_body,
        } => json!({
            "cond": node_json(cond),
            "then": nodes_json(body),
            "elseifs": nodes_json(else_ifs),
            "else": opt_json(else_body),
        }),
        ElseIf { cond, body } | While { cond, body } => {
            json!({ "cond": node_json(cond), "body": nodes_json(body) })
        }
        Repeat { body, cond } => {
            json!({ "body": nodes_json(body), "cond": node_json(cond) })
        }
        ForNum {
            var,
            start,
            limit,
            step,
            body,
        } => json!({
            "var": node_json(var),
            "start": node_json(start),
            "limit": node_json(limit),
            "step": opt_json(step),
            "body": nodes_json(body),
        }),
        ForGen {
            targets,
            values,
            body,
        } => json!({
            "names": nodes_json(targets),
            "values": nodes_json(values),
            "body": nodes_json(body),
        }),
        FuncStat { path, method, func } => json!({
            "path": nodes_json(path),
            "method": method,
            "func": node_json(func),
        }),
        LocalFunc { name, func } | GlobalFunc { name, func } => {
            json!({ "name": name, "func": node_json(func) })
        }
        Return { values } | Provide { values } => json!({ "values": nodes_json(values) }),
        CallStat { call } => json!({ "call": node_json(call) }),
        Break | Nil | True | False | Vararg => json!({}),
        Goto { label } => json!({ "label": label }),
        Label { name } => json!({ "name": name }),
        CatchStat { handler, expr } | CatchExpr { handler, expr } => {
            json!({ "handler": opt_json(handler), "expr": node_json(expr) })
        }
        From { targets, source } => {
            json!({ "names": nodes_json(targets), "source": node_json(source) })
        }
        ErrorStat { message } => json!({ "message": message }),
        Number(self::Number::Int(i)) => json!({ "value": i }),
        Number(self::Number::Float(f)) => json!({ "value": f }),
        Str { value, .. } => json!({ "value": value }),
        Interp { parts } => json!({ "parts": nodes_json(parts) }),
        Name { name } => json!({ "name": name }),
        Param { name, attrib } => json!({ "name": name, "attrib": attrib }),
        Index { object, index } => {
            json!({ "object": node_json(object), "index": node_json(index) })
        }
        Field { object, field } | OptChain { object, field } => {
            json!({ "object": node_json(object), "field": field })
        }
        Slice { object, start, end } => json!({
            "object": node_json(object),
            "start": opt_json(start),
            "end": opt_json(end),
        }),
        BinOp { op, lhs, rhs } => json!({
            "op": op.symbol(),
            "left": node_json(lhs),
            "right": node_json(rhs),
        }),
        UnOp { op, operand } => {
            json!({ "op": op.symbol(), "operand": node_json(operand) })
        }
        Table { fields } => json!({ "fields": nodes_json(fields) }),
        TableField { key, value } => {
            let key = match key {
                TableKey::None => Value::Null,
                TableKey::Name(name) => json!(name),
                TableKey::Expr(expr) => node_json(expr),
            };
            json!({ "key": key, "value": node_json(value) })
        }
        FuncExpr { params, body } => {
            json!({ "params": nodes_json(params), "body": nodes_json(body) })
        }
        CallExpr { func, args } => {
            json!({ "func": node_json(func), "args": nodes_json(args) })
        }
        MethodCall {
            object,
            method,
            args,
        } => json!({
            "object": node_json(object),
            "method": method,
            "args": nodes_json(args),
        }),
        Enum { names } => json!({ "names": nodes_json(names) }),
    };

    let map = object.as_object_mut().expect("node objects are objects");
    map.insert("type".to_owned(), json!(node.kind.name()));
    map.insert("line".to_owned(), json!(node.line));
    if node.endline != node.line {
        map.insert("endline".to_owned(), json!(node.endline));
    }
    if node.paren {
        map.insert("paren".to_owned(), json!(true));
    }
    object
}
