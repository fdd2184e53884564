use crate::Options;
use ast::{
    Ast, Comment, NodeKind, NodeList, NodeRef, Number, Quote, TableKey, UnOp, UNARY_PRIORITY,
};

/// Precedence classes for parenthesization. Atoms and suffix chains never
/// need parentheses.
const ATOM: u8 = u8::MAX;

pub(crate) fn render(ast: &Ast, options: &Options) -> String {
    let NodeKind::Chunk { body } = ast.root.kind else {
        unreachable!("AST root is always a chunk");
    };
    let mut r = Renderer {
        out: String::new(),
        depth: 0,
        opts: options,
        comments: &ast.comments,
        ci: 0,
        prev_end: None,
    };
    r.stats(0, body, u32::MAX);
    r.finish()
}

struct Renderer<'c, 'a> {
    out: String,
    depth: usize,
    opts: &'c Options,
    comments: &'c [Comment<'a>],
    ci: usize,
    /// Source endline of the last statement or comment written, used to
    /// carry the author's blank lines through.
    prev_end: Option<u32>,
}

impl<'c, 'a> Renderer<'c, 'a> {
    // ----- layout plumbing -----

    fn write_indent(&mut self) {
        for _ in 0..self.depth * self.opts.indent_width {
            self.out.push(' ');
        }
    }

    fn maybe_blank(&mut self, line: u32) {
        if let Some(prev) = self.prev_end {
            if line > prev + 1 {
                self.out.push('\n');
            }
        }
    }

    /// Emit comments recorded strictly before `line`, at the current
    /// indent, preserving gaps around them.
    fn drain_comments(&mut self, line: u32) {
        while let Some(comment) = self.comments.get(self.ci) {
            if comment.line >= line {
                break;
            }
            self.ci += 1;
            self.maybe_blank(comment.line);
            self.write_indent();
            if comment.islong {
                self.out.push_str("--[[");
                self.out.push_str(comment.text);
                self.out.push_str("]]");
            } else {
                self.out.push_str("--");
                self.out.push_str(comment.text);
            }
            self.out.push('\n');
            self.prev_end = Some(comment.endline);
        }
    }

    fn stats(&mut self, header_line: u32, body: NodeList<'a>, endline: u32) {
        self.prev_end = Some(header_line);
        for stat in body {
            self.drain_comments(stat.line);
            self.maybe_blank(stat.line);
            self.write_indent();
            self.stat(stat);
            self.out.push('\n');
            self.prev_end = Some(stat.endline);
        }
        self.drain_comments(endline);
    }

    fn block(&mut self, header_line: u32, body: NodeList<'a>, endline: u32) {
        self.depth += 1;
        self.stats(header_line, body, endline);
        self.depth -= 1;
    }

    fn finish(self) -> String {
        let mut lines: Vec<&str> = self.out.split('\n').map(str::trim_end).collect();
        while lines.last() == Some(&"") {
            lines.pop();
        }
        if lines.is_empty() {
            return String::new();
        }
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }

    // ----- statements -----

    fn stat(&mut self, node: NodeRef<'a>) {
        match &node.kind {
            NodeKind::Local { targets, values } => {
                self.out.push_str("local ");
                self.exprs(targets);
                if !values.is_empty() {
                    self.out.push_str(" = ");
                    self.exprs(values);
                }
            }
            NodeKind::Global { targets, values } => {
                self.out.push_str("global ");
                self.exprs(targets);
                if !values.is_empty() {
                    self.out.push_str(" = ");
                    self.exprs(values);
                }
            }
            NodeKind::From { targets, source } => {
                self.out.push_str("local ");
                self.exprs(targets);
                self.out.push_str(" from ");
                self.expr(source);
            }
            NodeKind::Assign { targets, values } => {
                self.exprs(targets);
                self.out.push_str(" = ");
                self.exprs(values);
            }
            NodeKind::If {
                cond,
                body,
                else_ifs,
                else_body,
            } => {
                self.out.push_str("if ");
                self.cond(cond);
                self.out.push_str(" then\n");
                let next = else_ifs
                    .first()
                    .map(|n| n.line)
                    .or(else_body.map(|n| n.line))
                    .unwrap_or(node.endline);
                self.block(node.line, body, next);
                for (i, arm) in else_ifs.iter().enumerate() {
                    let NodeKind::ElseIf { cond, body } = &arm.kind else {
                        unreachable!("if arms are elseif nodes");
                    };
                    self.write_indent();
                    self.out.push_str("elseif ");
                    self.cond(cond);
                    self.out.push_str(" then\n");
                    let next = else_ifs
                        .get(i + 1)
                        .map(|n| n.line)
                        .or(else_body.map(|n| n.line))
                        .unwrap_or(node.endline);
                    self.block(arm.line, body, next);
                }
                if let Some(else_node) = else_body {
                    let NodeKind::Else { body } = &else_node.kind else {
                        unreachable!("else arm is an else node");
                    };
                    self.write_indent();
                    self.out.push_str("else\n");
                    self.block(else_node.line, body, node.endline);
                }
                self.write_indent();
                self.out.push_str("end");
            }
            NodeKind::While { cond, body } => {
                self.out.push_str("while ");
                self.cond(cond);
                self.out.push_str(" do\n");
                self.block(node.line, body, node.endline);
                self.write_indent();
                self.out.push_str("end");
            }
            NodeKind::Repeat { body, cond } => {
                self.out.push_str("repeat\n");
                self.block(node.line, body, node.endline);
                self.write_indent();
                self.out.push_str("until ");
                self.expr(cond);
            }
            NodeKind::ForNum {
                var,
                start,
                limit,
                step,
                body,
            } => {
                self.out.push_str("for ");
                self.expr(var);
                self.out.push_str(" = ");
                self.expr(start);
                self.out.push_str(", ");
                self.expr(limit);
                if let Some(step) = step {
                    self.out.push_str(", ");
                    self.expr(step);
                }
                self.out.push_str(" do\n");
                self.block(node.line, body, node.endline);
                self.write_indent();
                self.out.push_str("end");
            }
            NodeKind::ForGen {
                targets,
                values,
                body,
            } => {
                self.out.push_str("for ");
                self.exprs(targets);
                self.out.push_str(" in ");
                self.exprs(values);
                self.out.push_str(" do\n");
                self.block(node.line, body, node.endline);
                self.write_indent();
                self.out.push_str("end");
            }
            NodeKind::FuncStat { path, method, func } => {
                self.out.push_str("function ");
                for (i, part) in path.iter().enumerate() {
                    if i > 0 {
                        self.out.push('.');
                    }
                    self.expr(part);
                }
                if let Some(method) = method {
                    self.out.push(':');
                    self.out.push_str(method);
                }
                self.func_tail(func);
            }
            NodeKind::LocalFunc { name, func } => {
                self.out.push_str("local function ");
                self.out.push_str(name);
                self.func_tail(func);
            }
            NodeKind::GlobalFunc { name, func } => {
                self.out.push_str("global function ");
                self.out.push_str(name);
                self.func_tail(func);
            }
            NodeKind::Return { values } => {
                self.out.push_str("return");
                if !values.is_empty() {
                    self.out.push(' ');
                    self.exprs(values);
                }
            }
            NodeKind::Provide { values } => {
                self.out.push_str("provide");
                if !values.is_empty() {
                    self.out.push(' ');
                    self.exprs(values);
                }
            }
            NodeKind::CallStat { call } => self.expr(call),
            NodeKind::Break => self.out.push_str("break"),
            NodeKind::Goto { label } => {
                self.out.push_str("goto ");
                self.out.push_str(label);
            }
            NodeKind::Label { name } => {
                self.out.push_str("::");
                self.out.push_str(name);
                self.out.push_str("::");
            }
            NodeKind::CatchStat { handler, expr } => self.catch(handler, expr),
            NodeKind::Do { body } | NodeKind::Block { body } => {
                self.out.push_str("do\n");
                self.block(node.line, body, node.endline);
                self.write_indent();
                self.out.push_str("end");
            }
            NodeKind::ErrorStat { message } => {
                self.out.push_str("-- parse error: ");
                self.out.push_str(message);
            }
            other => unreachable!("{} is not a statement", other.name()),
        }
    }

    /// Condition position: an `Assign` node here is an assignment
    /// condition (`if x = f() then`).
    fn cond(&mut self, node: NodeRef<'a>) {
        if let NodeKind::Assign { targets, values } = &node.kind {
            self.exprs(targets);
            self.out.push_str(" = ");
            self.exprs(values);
        } else {
            self.expr(node);
        }
    }

    fn catch(&mut self, handler: &Option<NodeRef<'a>>, expr: &NodeRef<'a>) {
        self.out.push_str("catch");
        if let Some(handler) = handler {
            self.out.push('[');
            self.expr(handler);
            self.out.push(']');
        }
        self.out.push(' ');
        self.expr(expr);
    }

    fn func_tail(&mut self, func: NodeRef<'a>) {
        let NodeKind::FuncExpr { params, body } = &func.kind else {
            unreachable!("function statements carry funcexpr nodes");
        };
        self.out.push('(');
        self.exprs(params);
        self.out.push_str(")\n");
        self.block(func.line, body, func.endline);
        self.write_indent();
        self.out.push_str("end");
    }

    // ----- expressions -----

    fn exprs(&mut self, nodes: &[NodeRef<'a>]) {
        for (i, node) in nodes.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(node);
        }
    }

    fn expr(&mut self, node: NodeRef<'a>) {
        self.expr_at(node, 0, false);
    }

    fn prec(node: NodeRef) -> u8 {
        match &node.kind {
            NodeKind::BinOp { op, .. } => op.priority().0,
            NodeKind::UnOp { .. } => UNARY_PRIORITY,
            _ => ATOM,
        }
    }

    /// Render with parentheses when the source had them, when precedence
    /// demands them, or when equal precedence would flip associativity.
    fn expr_at(&mut self, node: NodeRef<'a>, min: u8, parens_on_equal: bool) {
        let prec = Self::prec(node);
        let parens = node.paren || prec < min || (prec == min && parens_on_equal);
        if parens {
            self.out.push('(');
        }
        self.expr_bare(node);
        if parens {
            self.out.push(')');
        }
    }

    fn expr_bare(&mut self, node: NodeRef<'a>) {
        match &node.kind {
            NodeKind::Nil => self.out.push_str("nil"),
            NodeKind::True => self.out.push_str("true"),
            NodeKind::False => self.out.push_str("false"),
            NodeKind::Vararg => self.out.push_str("..."),
            NodeKind::Number(Number::Int(value)) => {
                self.out.push_str(&value.to_string());
            }
            NodeKind::Number(Number::Float(value)) => {
                self.out.push_str(&float_literal(*value));
            }
            NodeKind::Str { value, quote } => {
                self.out.push_str(&string_literal(value, *quote));
            }
            NodeKind::Interp { parts } => self.interp(parts),
            NodeKind::Name { name } => self.out.push_str(name),
            NodeKind::Param { name, attrib } => {
                self.out.push_str(name);
                if let Some(attrib) = attrib {
                    self.out.push_str(" <");
                    self.out.push_str(attrib);
                    self.out.push('>');
                }
            }
            NodeKind::Index { object, index } => {
                self.expr_at(object, ATOM, false);
                self.out.push('[');
                self.expr(index);
                self.out.push(']');
            }
            NodeKind::Field { object, field } => {
                self.expr_at(object, ATOM, false);
                self.out.push('.');
                self.out.push_str(field);
            }
            NodeKind::OptChain { object, field } => {
                self.expr_at(object, ATOM, false);
                self.out.push_str("?.");
                self.out.push_str(field);
            }
            NodeKind::Slice { object, start, end } => {
                self.expr_at(object, ATOM, false);
                self.out.push('[');
                if let Some(start) = start {
                    self.expr(start);
                }
                self.out.push(',');
                if let Some(end) = end {
                    self.out.push(' ');
                    self.expr(end);
                }
                self.out.push(']');
            }
            NodeKind::BinOp { op, lhs, rhs } => {
                let (left_pri, right_pri) = op.priority();
                let right_assoc = right_pri < left_pri;
                self.expr_at(lhs, left_pri, right_assoc);
                self.out.push(' ');
                self.out.push_str(op.symbol());
                self.out.push(' ');
                self.expr_at(rhs, right_pri, !right_assoc);
            }
            NodeKind::UnOp { op, operand } => {
                self.out.push_str(op.symbol());
                let doubled_minus = *op == UnOp::Neg
                    && !operand.paren
                    && matches!(
                        operand.kind,
                        NodeKind::UnOp {
                            op: UnOp::Neg,
                            ..
                        }
                    );
                if *op == UnOp::Not || doubled_minus {
                    self.out.push(' ');
                }
                self.expr_at(operand, UNARY_PRIORITY, false);
            }
            NodeKind::Table { fields } => self.table(fields),
            NodeKind::FuncExpr { .. } => {
                self.out.push_str("function");
                self.func_tail(node);
            }
            NodeKind::CallExpr { func, args } => {
                self.expr_at(func, ATOM, false);
                self.out.push('(');
                self.exprs(args);
                self.out.push(')');
            }
            NodeKind::MethodCall {
                object,
                method,
                args,
            } => {
                self.expr_at(object, ATOM, false);
                self.out.push(':');
                self.out.push_str(method);
                self.out.push('(');
                self.exprs(args);
                self.out.push(')');
            }
            NodeKind::Enum { names } => {
                self.out.push_str("enum ");
                self.exprs(names);
                self.out.push_str(" end");
            }
            NodeKind::CatchExpr { handler, expr } => self.catch(handler, expr),
            NodeKind::DoExpr { body } => {
                self.out.push_str("do\n");
                self.block(node.line, body, node.endline);
                self.write_indent();
                self.out.push_str("end");
            }
            other => unreachable!("{} is not an expression", other.name()),
        }
    }

    fn interp(&mut self, parts: &[NodeRef<'a>]) {
        self.out.push('`');
        for part in parts {
            match &part.kind {
                NodeKind::Str { value, quote: None } => {
                    for c in value.chars() {
                        match c {
                            '$' => self.out.push_str("\\$"),
                            '`' => self.out.push_str("\\`"),
                            '\\' => self.out.push_str("\\\\"),
                            '\n' => self.out.push_str("\\n"),
                            '\t' => self.out.push_str("\\t"),
                            c => self.out.push(c),
                        }
                    }
                }
                NodeKind::Name { name } if !part.paren => {
                    self.out.push('$');
                    self.out.push_str(name);
                }
                _ => {
                    self.out.push_str("$(");
                    self.expr(part);
                    self.out.push(')');
                }
            }
        }
        self.out.push('`');
    }

    fn table(&mut self, fields: &[NodeRef<'a>]) {
        if fields.is_empty() {
            self.out.push_str("{}");
            return;
        }

        // Attempt the one-line form for small constructors, rolling back
        // when a field itself breaks the line or the line runs long.
        if fields.len() <= 3 {
            let mark = self.out.len();
            let saved = (self.ci, self.prev_end);
            self.out.push_str("{ ");
            for (i, field) in fields.iter().enumerate() {
                if i > 0 {
                    self.out.push_str(", ");
                }
                self.table_field(field);
            }
            self.out.push_str(" }");

            let rendered = &self.out[mark..];
            let line_start = self.out[..mark].rfind('\n').map(|i| i + 1).unwrap_or(0);
            let line_len = self.out.len() - line_start;
            if !rendered.contains('\n') && line_len <= self.opts.max_line_width {
                return;
            }
            self.out.truncate(mark);
            (self.ci, self.prev_end) = saved;
        }

        self.out.push_str("{\n");
        self.depth += 1;
        for field in fields {
            self.write_indent();
            self.table_field(field);
            self.out.push_str(",\n");
        }
        self.depth -= 1;
        self.write_indent();
        self.out.push('}');
    }

    fn table_field(&mut self, field: NodeRef<'a>) {
        let NodeKind::TableField { key, value } = &field.kind else {
            unreachable!("table fields are tablefield nodes");
        };
        match key {
            TableKey::None => {}
            TableKey::Name(name) => {
                self.out.push_str(name);
                self.out.push_str(" = ");
            }
            TableKey::Expr(expr) => {
                self.out.push('[');
                self.expr(expr);
                self.out.push_str("] = ");
            }
        }
        self.expr(value);
    }
}

/// Render a float so it reads back as a float: integral values keep a
/// trailing `.0`.
fn float_literal(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn string_literal(value: &str, quote: Option<Quote>) -> String {
    let quote = quote.unwrap_or_else(|| {
        // Prefer double quotes unless the content argues otherwise.
        if value.contains('"') && !value.contains('\'') {
            Quote::Single
        } else {
            Quote::Double
        }
    });
    match quote {
        Quote::Long(level) => {
            let eq = "=".repeat(level as usize);
            format!("[{eq}[{value}]{eq}]")
        }
        Quote::Single => format!("'{}'", escape_short(value, '\'')),
        Quote::Double => format!("\"{}\"", escape_short(value, '"')),
    }
}

fn escape_short(value: &str, quote: char) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7F => {
                out.push_str(&format!("\\x{:02X}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}
