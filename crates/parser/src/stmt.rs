//! Parser core and statement grammar. Expressions live in `expr.rs`.
//!
//! Register discipline: every expression leaves exactly one result in a
//! fresh register at the pre-call `freereg`, advancing it by one. List
//! contexts therefore see consecutive registers without copying. Statement
//! dispatch releases temporaries afterwards, except for statements that
//! turn their registers into locals.

use crate::emit::{Const, Op, MULTI, NO_TARGET};
use crate::expr::Pending;
use crate::lexer::{Lexer, Spanned};
use crate::state::{ActVar, Attrib, BlockCnt, DynData, FuncState, LabelDesc};
use crate::token::Token;
use crate::{Error, Options, Parsed};
use arena::Arena;
use ast::{Ast, Node, NodeKind, NodeList, NodeRef, SyntaxError};

pub(crate) struct Parser<'a, 's> {
    lex: Lexer<'a, 's>,
    pub(crate) tok: Spanned<'a>,
    ahead: Option<Spanned<'a>>,
    chunk_name: &'s str,
    pub(crate) arena: &'a Arena,
    recover: bool,
    errors: Vec<SyntaxError>,
    pub(crate) node_count: usize,
    pub(crate) fs: Vec<FuncState<'a>>,
    pub(crate) dyn_data: DynData<'a>,
}

/// Outcome of a condition position: the jumps to take when it is false,
/// its AST node, and whether it opened a scope for declared variables.
struct Cond<'a> {
    false_jumps: Vec<u32>,
    node: NodeRef<'a>,
    opened_block: bool,
}

impl<'a, 's> Parser<'a, 's> {
    pub(crate) fn run(
        source: &'s str,
        chunk_name: &'s str,
        arena: &'a Arena,
        options: &Options,
    ) -> Result<Parsed<'a>, Error> {
        let mut lex = Lexer::new(source, chunk_name, arena, options.include_comments);
        let tok = lex.next_token()?;
        let mut p = Parser {
            lex,
            tok,
            ahead: None,
            chunk_name,
            arena,
            recover: options.recover,
            errors: Vec::new(),
            node_count: 0,
            fs: Vec::new(),
            dyn_data: DynData::default(),
        };

        let mut main = FuncState::new(chunk_name, 1, &p.dyn_data);
        main.chunk.is_vararg = true;
        p.fs.push(main);
        p.open_block(false);

        let body = p.stat_list()?;
        if p.tok.tok != Token::Eof {
            let err = p.err_here(format!("unexpected {}", p.tok.tok.describe()));
            if !p.recover {
                return Err(err);
            }
            p.record_error(err);
        }
        let endline = p.tok.line;
        p.emit(Op::Return { base: 0, n: 0 });
        p.close_block()?;
        let main = p.fs.pop().expect("main function state");

        let root = p.node(NodeKind::Chunk { body }, 1, endline);
        let ast = Ast {
            root,
            comments: std::mem::take(&mut p.lex.comments),
            errors: p.errors,
            node_count: p.node_count,
            recover: options.recover,
            include_comments: options.include_comments,
        };
        Ok(Parsed {
            chunk: main.chunk,
            ast: options.capture_ast.then_some(ast),
        })
    }

    // ----- token plumbing -----

    pub(crate) fn next(&mut self) -> Result<(), Error> {
        self.tok = match self.ahead.take() {
            Some(t) => t,
            None => self.lex.next_token()?,
        };
        Ok(())
    }

    /// Peek one token past the current one.
    pub(crate) fn peek_ahead(&mut self) -> Result<Token<'a>, Error> {
        if self.ahead.is_none() {
            self.ahead = Some(self.lex.next_token()?);
        }
        Ok(self.ahead.as_ref().expect("just filled").tok)
    }

    pub(crate) fn accept(&mut self, tok: Token) -> Result<bool, Error> {
        if self.tok.tok == tok {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) fn expect(&mut self, tok: Token, what: &str) -> Result<Spanned<'a>, Error> {
        if self.tok.tok != tok {
            return Err(self.err_here(format!(
                "{} expected ({} found)",
                what,
                self.tok.tok.describe()
            )));
        }
        let t = self.tok;
        self.next()?;
        Ok(t)
    }

    pub(crate) fn expect_name(&mut self) -> Result<(&'a str, u32), Error> {
        match self.tok.tok {
            Token::Name(name) => {
                let line = self.tok.line;
                self.next()?;
                Ok((name, line))
            }
            other => Err(self.err_here(format!("name expected ({} found)", other.describe()))),
        }
    }

    pub(crate) fn err_here(&self, message: impl Into<String>) -> Error {
        Error {
            chunk: self.chunk_name.to_owned(),
            line: self.tok.line,
            col: self.tok.col,
            message: message.into(),
        }
    }

    fn record_error(&mut self, err: Error) {
        self.errors.push(SyntaxError {
            line: err.line,
            col: err.col,
            message: err.message,
        });
    }

    // ----- AST plumbing -----

    pub(crate) fn node(&mut self, kind: NodeKind<'a>, line: u32, endline: u32) -> NodeRef<'a> {
        self.node_count += 1;
        &*self.arena.alloc(Node::spanning(kind, line, endline))
    }

    pub(crate) fn nodes(&self, list: Vec<NodeRef<'a>>) -> NodeList<'a> {
        self.arena.alloc_slice_copy(&list)
    }

    // ----- emission plumbing -----

    pub(crate) fn fs_mut(&mut self) -> &mut FuncState<'a> {
        self.fs.last_mut().expect("function state stack is non-empty")
    }

    pub(crate) fn fs_ref(&self) -> &FuncState<'a> {
        self.fs.last().expect("function state stack is non-empty")
    }

    pub(crate) fn emit(&mut self, op: Op) -> u32 {
        let line = self.tok.line;
        self.fs_mut().chunk.emit(op, line)
    }

    pub(crate) fn reserve(&mut self, n: u8) -> Result<u8, Error> {
        let line = self.tok.line;
        let col = self.tok.col;
        let chunk = self.chunk_name;
        self.fs_mut().reserve(n).map_err(|message| Error {
            chunk: chunk.to_owned(),
            line,
            col,
            message,
        })
    }

    pub(crate) fn str_const(&mut self, s: &str) -> u32 {
        self.fs_mut().chunk.str_const(s)
    }

    // ----- scopes -----

    pub(crate) fn open_block(&mut self, is_loop: bool) {
        let fs = self.fs.last().expect("fs");
        let block = BlockCnt {
            first_label: self.dyn_data.labels.len(),
            first_goto: self.dyn_data.gotos.len(),
            first_group: self.dyn_data.groups.len(),
            nactvar: fs.nactvar(&self.dyn_data),
            freereg: fs.freereg,
            is_loop,
        };
        self.fs.last_mut().expect("fs").blocks.push(block);
    }

    pub(crate) fn close_block(&mut self) -> Result<(), Error> {
        let chunk_name = self.chunk_name;
        let fs = self.fs.last_mut().expect("fs");
        let dyn_data = &mut self.dyn_data;
        let block = fs.blocks.pop().expect("block stack is non-empty");
        let here = fs.chunk.here();

        // Match pending gotos against labels declared in this block.
        let mut i = block.first_goto;
        while i < dyn_data.gotos.len() {
            let goto = dyn_data.gotos[i];
            let label = dyn_data.labels[block.first_label..]
                .iter()
                .find(|l| l.name == goto.name)
                .copied();
            match label {
                Some(label) => {
                    if label.nactvar > goto.nactvar {
                        return Err(Error {
                            chunk: chunk_name.to_owned(),
                            line: goto.line,
                            col: 1,
                            message: format!(
                                "'goto {}' jumps into the scope of a local",
                                goto.name
                            ),
                        });
                    }
                    fs.chunk.patch_to(goto.pc, label.pc);
                    dyn_data.gotos.remove(i);
                }
                None if block.is_loop && goto.name == "break" => {
                    fs.chunk.patch_to(goto.pc, here);
                    dyn_data.gotos.remove(i);
                }
                None => {
                    // Propagates to the enclosing block.
                    dyn_data.gotos[i].nactvar = dyn_data.gotos[i].nactvar.min(block.nactvar);
                    i += 1;
                }
            }
        }

        dyn_data.labels.truncate(block.first_label);
        dyn_data.groups.truncate(block.first_group);
        dyn_data.actvar.truncate(fs.first_local + block.nactvar);
        fs.free_to(block.freereg);

        if fs.blocks.is_empty() {
            // Function boundary: anything still pending is unresolved.
            if let Some(goto) = dyn_data.gotos.get(fs.first_goto).copied() {
                let message = if goto.name == "break" {
                    "break outside a loop".to_owned()
                } else {
                    format!("no visible label '{}' for goto", goto.name)
                };
                return Err(Error {
                    chunk: chunk_name.to_owned(),
                    line: goto.line,
                    col: 1,
                    message,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn declare_local(
        &mut self,
        name: &'a str,
        reg: u8,
        attrib: Attrib,
        group: Option<usize>,
    ) {
        self.dyn_data.actvar.push(ActVar {
            name,
            reg,
            attrib,
            group,
        });
    }

    // ----- statement lists -----

    fn block_follow(&self) -> bool {
        matches!(
            self.tok.tok,
            Token::End | Token::Else | Token::Elseif | Token::Until | Token::Eof
        )
    }

    /// Parse statements until a block terminator. In recover mode,
    /// malformed statements are recorded and skipped.
    pub(crate) fn stat_list(&mut self) -> Result<NodeList<'a>, Error> {
        let fs_depth = self.fs.len();
        let block_depth = self.fs_ref().blocks.len();
        let mut body = Vec::new();
        while !self.block_follow() {
            let mark = self.fs_ref().freereg;
            match self.statement() {
                Ok(None) => continue,
                Ok(Some(node)) => {
                    let terminating = matches!(
                        node.kind,
                        NodeKind::Return { .. } | NodeKind::Provide { .. }
                    );
                    let keeps_registers = matches!(
                        node.kind,
                        NodeKind::Local { .. } | NodeKind::From { .. } | NodeKind::LocalFunc { .. }
                    );
                    if !keeps_registers {
                        self.fs_mut().free_to(mark);
                    }
                    body.push(node);
                    if terminating {
                        // return/provide close the block; allow a stray ';'.
                        let _ = self.accept(Token::Semi)?;
                        break;
                    }
                }
                Err(err) if self.recover => {
                    let line = err.line;
                    self.record_error(err);
                    let message = self
                        .errors
                        .last()
                        .map(|e| self.arena.alloc_str(&e.message) as &str)
                        .expect("just recorded");
                    body.push(self.node(NodeKind::ErrorStat { message }, line, line));
                    self.unwind_to(fs_depth, block_depth);
                    if !self.synchronize() {
                        break;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(self.nodes(body))
    }

    /// Discard function and block state left open by an abandoned
    /// statement, so recovery continues from a consistent frame.
    fn unwind_to(&mut self, fs_depth: usize, block_depth: usize) {
        while self.fs.len() > fs_depth {
            let fs = self.fs.pop().expect("fs depth checked");
            self.dyn_data.actvar.truncate(fs.first_local);
            self.dyn_data.labels.truncate(fs.first_label);
            self.dyn_data.gotos.truncate(fs.first_goto);
        }
        while self.fs_ref().blocks.len() > block_depth {
            let fs = self.fs.last_mut().expect("fs");
            let block = fs.blocks.pop().expect("depth checked");
            self.dyn_data.labels.truncate(block.first_label);
            self.dyn_data.gotos.truncate(block.first_goto);
            self.dyn_data.groups.truncate(block.first_group);
            self.dyn_data
                .actvar
                .truncate(fs.first_local + block.nactvar);
            fs.free_to(block.freereg);
        }
    }

    /// Skip ahead to a plausible statement boundary. Returns false when
    /// no further progress is possible (give up on this parse).
    fn synchronize(&mut self) -> bool {
        loop {
            match self.tok.tok {
                Token::Eof
                | Token::End
                | Token::Else
                | Token::Elseif
                | Token::Until
                | Token::Local
                | Token::Global
                | Token::If
                | Token::While
                | Token::For
                | Token::Repeat
                | Token::Function
                | Token::Return
                | Token::Provide
                | Token::Break
                | Token::Goto
                | Token::Do => return true,
                Token::Semi => {
                    return self.next().is_ok();
                }
                _ => {
                    if self.next().is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn statement(&mut self) -> Result<Option<NodeRef<'a>>, Error> {
        match self.tok.tok {
            Token::Semi => {
                self.next()?;
                Ok(None)
            }
            Token::If => self.if_stat().map(Some),
            Token::While => self.while_stat().map(Some),
            Token::Do => self.do_stat().map(Some),
            Token::For => self.for_stat().map(Some),
            Token::Repeat => self.repeat_stat().map(Some),
            Token::Function => self.func_stat().map(Some),
            Token::Local => self.local_stat().map(Some),
            Token::Global => self.global_stat().map(Some),
            Token::Return | Token::Provide => self.ret_stat().map(Some),
            Token::Break => self.break_stat().map(Some),
            Token::Goto => self.goto_stat().map(Some),
            Token::DColon => self.label_stat().map(Some),
            Token::Catch => self.catch_stat().map(Some),
            _ => self.expr_stat().map(Some),
        }
    }

    // ----- conditions (if / while), including assignment conditions -----

    fn condition(&mut self) -> Result<Cond<'a>, Error> {
        let line = self.tok.line;
        if let Token::Name(_) = self.tok.tok {
            if matches!(self.peek_ahead()?, Token::Assign | Token::Comma) {
                return self.assignment_condition(line);
            }
        }
        let e = self.expr()?;
        let pc = self.emit(Op::TestJump {
            src: e.reg,
            if_true: false,
            to: NO_TARGET,
        });
        self.fs_mut().free_to(e.reg);
        Ok(Cond {
            false_jumps: vec![pc],
            node: e.node,
            opened_block: false,
        })
    }

    /// `if x = expr then` / `while x, y = f() do`: the declared variables
    /// live in a block wrapping the whole construct, and the condition is
    /// false when any of them is falsey.
    fn assignment_condition(&mut self, line: u32) -> Result<Cond<'a>, Error> {
        self.open_block(false);
        let mut names = Vec::new();
        let mut targets = Vec::new();
        loop {
            let (name, nline) = self.expect_name()?;
            names.push(name);
            targets.push(self.node(NodeKind::Name { name }, nline, nline));
            if !self.accept(Token::Comma)? {
                break;
            }
        }
        self.expect(Token::Assign, "'='")?;
        let base = self.fs_ref().freereg;
        let list = self.explist()?;
        let values = list.nodes.clone();
        self.adjust_explist(list, names.len() as u8)?;
        let mut false_jumps = Vec::new();
        for (i, &name) in names.iter().enumerate() {
            let reg = base + i as u8;
            self.declare_local(name, reg, Attrib::None, None);
            false_jumps.push(self.emit(Op::TestJump {
                src: reg,
                if_true: false,
                to: NO_TARGET,
            }));
        }
        let endline = self.tok.line;
        let node = self.node(
            NodeKind::Assign {
                targets: self.nodes(targets),
                values: self.nodes(values),
            },
            line,
            endline,
        );
        Ok(Cond {
            false_jumps,
            node,
            opened_block: true,
        })
    }

    pub(crate) fn patch_jumps_here(&mut self, jumps: &[u32]) {
        let here = self.fs_ref().chunk.here();
        for &pc in jumps {
            self.fs_mut().chunk.patch_to(pc, here);
        }
    }

    // ----- statements -----

    fn if_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        let mut scopes = 0usize;

        let cond = self.condition()?;
        if cond.opened_block {
            scopes += 1;
        }
        self.expect(Token::Then, "'then'")?;
        let body = self.stat_list()?;

        let mut escapes = Vec::new();
        let mut else_ifs = Vec::new();
        let mut else_body = None;
        let mut pending_false = cond.false_jumps;

        while self.tok.tok == Token::Elseif {
            let eline = self.tok.line;
            escapes.push(self.emit(Op::Jump { to: NO_TARGET }));
            self.patch_jumps_here(&pending_false);
            self.next()?;
            let cond = self.condition()?;
            if cond.opened_block {
                scopes += 1;
            }
            self.expect(Token::Then, "'then'")?;
            let arm_body = self.stat_list()?;
            pending_false = cond.false_jumps;
            let endline = self.tok.line;
            else_ifs.push(self.node(
                NodeKind::ElseIf {
                    cond: cond.node,
                    body: arm_body,
                },
                eline,
                endline,
            ));
        }

        if self.tok.tok == Token::Else {
            let eline = self.tok.line;
            escapes.push(self.emit(Op::Jump { to: NO_TARGET }));
            self.patch_jumps_here(&pending_false);
            pending_false = Vec::new();
            self.next()?;
            let body = self.stat_list()?;
            let endline = self.tok.line;
            else_body = Some(self.node(NodeKind::Else { body }, eline, endline));
        }

        let end = self.expect(Token::End, "'end'")?;
        self.patch_jumps_here(&pending_false);
        self.patch_jumps_here(&escapes);
        for _ in 0..scopes {
            self.close_block()?;
        }

        Ok(self.node(
            NodeKind::If {
                cond: cond.node,
                body,
                else_ifs: self.nodes(else_ifs),
                else_body,
            },
            line,
            end.line,
        ))
    }

    fn while_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        let start = self.fs_ref().chunk.here();
        self.open_block(true);

        let cond = self.condition()?;
        self.expect(Token::Do, "'do'")?;
        let body = self.stat_list()?;
        let end = self.expect(Token::End, "'end'")?;

        if cond.opened_block {
            self.close_block()?;
        }
        self.emit(Op::Jump { to: start });
        self.patch_jumps_here(&cond.false_jumps);
        self.close_block()?;

        Ok(self.node(
            NodeKind::While {
                cond: cond.node,
                body,
            },
            line,
            end.line,
        ))
    }

    fn repeat_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        let start = self.fs_ref().chunk.here();
        self.open_block(true);
        self.open_block(false);

        let body = self.stat_list()?;
        let end = self.expect(Token::Until, "'until'")?;
        // Body locals stay in scope for the condition.
        let cond = self.expr()?;
        self.emit(Op::TestJump {
            src: cond.reg,
            if_true: false,
            to: start,
        });
        self.fs_mut().free_to(cond.reg);
        self.close_block()?;
        self.close_block()?;

        Ok(self.node(
            NodeKind::Repeat {
                body,
                cond: cond.node,
            },
            line,
            end.line,
        ))
    }

    fn do_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        self.open_block(false);
        let body = self.stat_list()?;
        let end = self.expect(Token::End, "'end'")?;
        self.close_block()?;
        Ok(self.node(NodeKind::Do { body }, line, end.line))
    }

    fn for_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        let (name, nline) = self.expect_name()?;
        match self.tok.tok {
            Token::Assign => self.for_num(line, name, nline),
            Token::Comma | Token::In => self.for_gen(line, name, nline),
            other => Err(self.err_here(format!(
                "'=' or 'in' expected ({} found)",
                other.describe()
            ))),
        }
    }

    fn for_num(&mut self, line: u32, name: &'a str, nline: u32) -> Result<NodeRef<'a>, Error> {
        self.next()?;
        let base = self.fs_ref().freereg;
        let start = self.expr()?;
        self.expect(Token::Comma, "','")?;
        let limit = self.expr()?;
        let step = if self.accept(Token::Comma)? {
            Some(self.expr()?)
        } else {
            let reg = self.reserve(1)?;
            let k = self.fs_mut().chunk.add_const(Const::Int(1));
            self.emit(Op::LoadK { dst: reg, k });
            None
        };

        let prep = self.emit(Op::ForPrep {
            base,
            to: NO_TARGET,
        });
        self.open_block(true);
        let var_reg = self.reserve(1)?;
        self.declare_local(name, var_reg, Attrib::None, None);
        let body_start = self.fs_ref().chunk.here();

        self.expect(Token::Do, "'do'")?;
        let body = self.stat_list()?;
        let end = self.expect(Token::End, "'end'")?;

        let loop_pc = self.emit(Op::ForLoop {
            base,
            to: body_start,
        });
        self.fs_mut().chunk.patch_to(prep, loop_pc);
        self.close_block()?;

        let var = self.node(
            NodeKind::Param {
                name,
                attrib: None,
            },
            nline,
            nline,
        );
        Ok(self.node(
            NodeKind::ForNum {
                var,
                start: start.node,
                limit: limit.node,
                step: step.as_ref().map(|s| s.node),
                body,
            },
            line,
            end.line,
        ))
    }

    fn for_gen(&mut self, line: u32, first: &'a str, first_line: u32) -> Result<NodeRef<'a>, Error> {
        let mut names = vec![(first, first_line)];
        while self.accept(Token::Comma)? {
            names.push(self.expect_name()?);
        }
        self.expect(Token::In, "'in'")?;
        let base = self.fs_ref().freereg;
        let list = self.explist()?;
        let value_nodes = list.nodes.clone();
        // Iterator function, state, and control value.
        self.adjust_explist(list, 3)?;

        let prep = self.emit(Op::GenForPrep {
            base,
            to: NO_TARGET,
        });
        self.open_block(true);
        for &(name, _) in &names {
            let reg = self.reserve(1)?;
            self.declare_local(name, reg, Attrib::None, None);
        }
        let body_start = self.fs_ref().chunk.here();

        self.expect(Token::Do, "'do'")?;
        let body = self.stat_list()?;
        let end = self.expect(Token::End, "'end'")?;

        let loop_pc = self.emit(Op::GenForLoop {
            base,
            nvars: names.len() as u8,
            to: body_start,
        });
        self.fs_mut().chunk.patch_to(prep, loop_pc);
        self.close_block()?;

        let targets = names
            .iter()
            .map(|&(name, nline)| {
                self.node(
                    NodeKind::Param {
                        name,
                        attrib: None,
                    },
                    nline,
                    nline,
                )
            })
            .collect();
        Ok(self.node(
            NodeKind::ForGen {
                targets: self.nodes(targets),
                values: self.nodes(value_nodes),
                body,
            },
            line,
            end.line,
        ))
    }

    fn func_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        let (first, first_line) = self.expect_name()?;
        let mut path = vec![self.node(NodeKind::Name { name: first }, first_line, first_line)];
        let mut fields = Vec::new();
        let mut method = None;
        while self.accept(Token::Dot)? {
            let (name, nline) = self.expect_name()?;
            fields.push(name);
            path.push(self.node(NodeKind::Name { name }, nline, nline));
        }
        if self.accept(Token::Colon)? {
            let (name, _) = self.expect_name()?;
            method = Some(name);
        }

        let func = self.function_body(method.is_some(), first, line)?;

        if fields.is_empty() && method.is_none() {
            // Plain `function f() ... end` assigns to `f` directly.
            let closure = self.reserve(1)?;
            self.emit(Op::Closure {
                dst: closure,
                proto: func.proto,
            });
            self.store_name(first, closure)?;
        } else {
            // Realize the object path, then set the final field.
            let obj = self.load_name(first)?;
            let last = method.unwrap_or_else(|| *fields.last().expect("non-empty path"));
            let walk: &[&str] = if method.is_some() {
                &fields
            } else {
                &fields[..fields.len() - 1]
            };
            for field in walk {
                let k = self.str_const(field);
                self.emit(Op::GetField {
                    dst: obj,
                    obj,
                    name: k,
                });
            }
            let closure = self.reserve(1)?;
            self.emit(Op::Closure {
                dst: closure,
                proto: func.proto,
            });
            let k = self.str_const(last);
            self.emit(Op::SetField {
                obj,
                name: k,
                src: closure,
            });
        }

        Ok(self.node(
            NodeKind::FuncStat {
                path: self.nodes(path),
                method,
                func: func.node,
            },
            line,
            func.endline,
        ))
    }

    fn local_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        if self.tok.tok == Token::Function {
            return self.local_func(line);
        }

        let mut names: Vec<(&'a str, u32, Attrib, Option<&'a str>)> = Vec::new();
        loop {
            let (name, nline) = self.expect_name()?;
            let (attrib, attrib_name) = self.attrib()?;
            names.push((name, nline, attrib, attrib_name));
            if !self.accept(Token::Comma)? {
                break;
            }
        }

        if names.iter().any(|&(_, _, a, _)| a == Attrib::Group) {
            return self.group_decl(line, names);
        }

        if self.tok.tok == Token::From {
            return self.from_stat(line, names);
        }

        let base = self.fs_ref().freereg;
        let n = names.len() as u8;
        let mut values = Vec::new();
        if self.accept(Token::Assign)? {
            let list = self.explist()?;
            values = list.nodes.clone();
            self.adjust_explist(list, n)?;
        } else {
            let reg = self.reserve(n)?;
            self.emit(Op::LoadNil { dst: reg, n });
        }
        for (i, &(name, _, attrib, _)) in names.iter().enumerate() {
            self.declare_local(name, base + i as u8, attrib, None);
        }

        let endline = self.tok.line;
        let targets = self.param_nodes(&names);
        Ok(self.node(
            NodeKind::Local {
                targets,
                values: self.nodes(values),
            },
            line,
            endline,
        ))
    }

    fn param_nodes(
        &mut self,
        names: &[(&'a str, u32, Attrib, Option<&'a str>)],
    ) -> NodeList<'a> {
        let targets = names
            .iter()
            .map(|&(name, nline, _, attrib_name)| {
                self.node(
                    NodeKind::Param {
                        name,
                        attrib: attrib_name,
                    },
                    nline,
                    nline,
                )
            })
            .collect();
        self.nodes(targets)
    }

    pub(crate) fn attrib(&mut self) -> Result<(Attrib, Option<&'a str>), Error> {
        if !self.accept(Token::Lt)? {
            return Ok((Attrib::None, None));
        }
        let (name, _) = self.expect_name()?;
        let Some(attrib) = Attrib::parse(name) else {
            return Err(self.err_here(format!("unknown attribute '{name}'")));
        };
        self.expect(Token::Gt, "'>'")?;
        Ok((attrib, Some(name)))
    }

    /// `local a, b from t` — reserve the target registers, evaluate the
    /// source once, then one field read per target into its slot.
    fn from_stat(
        &mut self,
        line: u32,
        names: Vec<(&'a str, u32, Attrib, Option<&'a str>)>,
    ) -> Result<NodeRef<'a>, Error> {
        self.next()?;
        let n = names.len() as u8;
        let base = self.reserve(n)?;
        let source = self.expr()?;
        for (i, &(name, _, _, _)) in names.iter().enumerate() {
            let k = self.str_const(name);
            self.emit(Op::GetField {
                dst: base + i as u8,
                obj: source.reg,
                name: k,
            });
        }
        self.fs_mut().free_to(base + n);
        for (i, &(name, _, attrib, _)) in names.iter().enumerate() {
            self.declare_local(name, base + i as u8, attrib, None);
        }

        let endline = self.tok.line;
        let targets = self.param_nodes(&names);
        Ok(self.node(
            NodeKind::From {
                targets,
                source: source.node,
            },
            line,
            endline,
        ))
    }

    fn local_func(&mut self, line: u32) -> Result<NodeRef<'a>, Error> {
        self.next()?;
        let (name, _) = self.expect_name()?;
        // Declared before the body so the function can call itself.
        let reg = self.reserve(1)?;
        self.declare_local(name, reg, Attrib::None, None);
        let func = self.function_body(false, name, line)?;
        self.emit(Op::Closure {
            dst: reg,
            proto: func.proto,
        });
        Ok(self.node(
            NodeKind::LocalFunc {
                name,
                func: func.node,
            },
            line,
            func.endline,
        ))
    }

    fn global_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        if self.tok.tok == Token::Function {
            return self.global_func(line);
        }

        let mut names = Vec::new();
        loop {
            let (name, nline) = self.expect_name()?;
            self.check_global_conflict(name)?;
            names.push((name, nline, Attrib::None, None));
            if !self.accept(Token::Comma)? {
                break;
            }
        }

        let base = self.fs_ref().freereg;
        let n = names.len() as u8;
        let mut values = Vec::new();
        if self.accept(Token::Assign)? {
            let list = self.explist()?;
            values = list.nodes.clone();
            self.adjust_explist(list, n)?;
        } else {
            let reg = self.reserve(n)?;
            self.emit(Op::LoadNil { dst: reg, n });
        }
        for (i, &(name, _, _, _)) in names.iter().enumerate() {
            let k = self.str_const(name);
            self.emit(Op::SetGlobal {
                name: k,
                src: base + i as u8,
            });
        }

        let endline = self.tok.line;
        let targets = self.param_nodes(&names);
        Ok(self.node(
            NodeKind::Global {
                targets,
                values: self.nodes(values),
            },
            line,
            endline,
        ))
    }

    fn global_func(&mut self, line: u32) -> Result<NodeRef<'a>, Error> {
        self.next()?;
        let (name, _) = self.expect_name()?;
        self.check_global_conflict(name)?;
        let func = self.function_body(false, name, line)?;
        let closure = self.reserve(1)?;
        self.emit(Op::Closure {
            dst: closure,
            proto: func.proto,
        });
        let k = self.str_const(name);
        self.emit(Op::SetGlobal { name: k, src: closure });
        Ok(self.node(
            NodeKind::GlobalFunc {
                name,
                func: func.node,
            },
            line,
            func.endline,
        ))
    }

    fn check_global_conflict(&self, name: &str) -> Result<(), Error> {
        let fs = self.fs_ref();
        let locals = &self.dyn_data.actvar[fs.first_local..];
        if locals.iter().any(|v| v.name == name) {
            return Err(self.err_here(format!(
                "global declaration of '{name}' conflicts with a local"
            )));
        }
        Ok(())
    }

    fn ret_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        let provide = self.tok.tok == Token::Provide;
        self.next()?;

        let (base, n, nodes) = if self.block_follow() || self.tok.tok == Token::Semi {
            (0, 0, Vec::new())
        } else {
            let list = self.explist()?;
            let nodes = list.nodes.clone();
            let n = if let Some(pc) = list.last_multi {
                self.fs_mut().chunk.patch_results(pc, MULTI);
                MULTI
            } else {
                list.count
            };
            (list.base, n, nodes)
        };
        self.emit(Op::Return { base, n });

        let endline = self.tok.line;
        let values = self.nodes(nodes);
        let kind = if provide {
            NodeKind::Provide { values }
        } else {
            NodeKind::Return { values }
        };
        Ok(self.node(kind, line, endline))
    }

    fn break_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        let pc = self.emit(Op::Jump { to: NO_TARGET });
        let nactvar = self.fs_ref().nactvar(&self.dyn_data);
        self.dyn_data.gotos.push(LabelDesc {
            name: "break",
            pc,
            line,
            nactvar,
        });
        Ok(self.node(NodeKind::Break, line, line))
    }

    fn goto_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        let (label, _) = self.expect_name()?;
        let pc = self.emit(Op::Jump { to: NO_TARGET });
        let nactvar = self.fs_ref().nactvar(&self.dyn_data);
        self.dyn_data.gotos.push(LabelDesc {
            name: label,
            pc,
            line,
            nactvar,
        });
        Ok(self.node(NodeKind::Goto { label }, line, line))
    }

    fn label_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        let (name, _) = self.expect_name()?;
        self.expect(Token::DColon, "'::'")?;

        let fs = self.fs_ref();
        if self.dyn_data.labels[fs.first_label..]
            .iter()
            .any(|l| l.name == name)
        {
            return Err(self.err_here(format!("label '{name}' already defined")));
        }
        let pc = fs.chunk.here();
        let nactvar = fs.nactvar(&self.dyn_data);
        self.dyn_data.labels.push(LabelDesc {
            name,
            pc,
            line,
            nactvar,
        });
        Ok(self.node(NodeKind::Label { name }, line, line))
    }

    fn catch_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        let parts = self.catch_core()?;
        // Statement form: the success flag and results are discarded.
        self.fs_mut().chunk.patch_results(parts.end_pc, 0);
        let endline = self.tok.line;
        Ok(self.node(
            NodeKind::CatchStat {
                handler: parts.handler_node,
                expr: parts.expr_node,
            },
            line,
            endline,
        ))
    }

    fn expr_stat(&mut self) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        let first = self.suffixed()?;

        if matches!(self.tok.tok, Token::Assign | Token::Comma) {
            if let Pending::Group { gidx } = first.pend {
                return self.group_overwrite(line, gidx, first.node);
            }
            return self.assignment(line, first);
        }

        // Not an assignment: only a call may stand as a statement.
        let Some(call_pc) = first.call_pc() else {
            return Err(self.err_here("syntax error: expression is not a statement"));
        };
        let call = first.node;
        self.finish_suffixed(first)?;
        self.fs_mut().chunk.patch_results(call_pc, 0);
        let endline = self.tok.line;
        Ok(self.node(NodeKind::CallStat { call }, line, endline))
    }
}
