//! Expression grammar: precedence climbing, suffix chains (field, index,
//! slice, optional chain, calls), constructors, closures, catch and enum
//! expressions, interpolated strings, and name resolution with upvalue
//! capture.

use crate::emit::{Const, Op, UpvalDesc, MULTI, NO_REG, NO_TARGET};
use crate::state::{Attrib, FuncState, GroupDesc, GroupField};
use crate::stmt::Parser;
use crate::token::Token;
use crate::Error;
use ast::{BinOp, NodeKind, NodeList, NodeRef, Number, TableKey, UnOp, UNARY_PRIORITY};

/// A fully evaluated expression: one value in `reg`, which is always the
/// register that was `freereg` when evaluation began. `multi` carries the
/// pc of an open call/vararg/catch whose result count the caller may still
/// widen.
pub(crate) struct ExprVal<'a> {
    pub(crate) reg: u8,
    pub(crate) node: NodeRef<'a>,
    pub(crate) multi: Option<u32>,
}

/// A comma-separated expression list, evaluated into consecutive registers
/// starting at `base`.
pub(crate) struct ExpList<'a> {
    pub(crate) base: u8,
    pub(crate) count: u8,
    pub(crate) last_multi: Option<u32>,
    pub(crate) nodes: Vec<NodeRef<'a>>,
}

/// The yet-unrealized tail of a suffixed expression. Keeping the final
/// suffix pending is what lets one parse serve both rvalue and assignment-
/// target positions.
#[derive(Copy, Clone)]
pub(crate) enum Pending<'a> {
    /// Computed into the chain's base register.
    Temp { reg: u8 },
    Local { reg: u8, attrib: Attrib },
    Upval { idx: u8 },
    Global { name: &'a str },
    Field { obj: u8, name: &'a str },
    Index { obj: u8, idx: u8 },
    /// A bare `<group>` binding; only a field access or an overwrite may
    /// follow.
    Group { gidx: usize },
    /// A group field, resolved at compile time to its local register.
    GroupField { reg: u8 },
}

pub(crate) struct SuffixedExpr<'a> {
    pub(crate) pend: Pending<'a>,
    pub(crate) node: NodeRef<'a>,
    base: Option<u8>,
    opt_jumps: Vec<u32>,
    last_call: Option<u32>,
    has_opt: bool,
    line: u32,
}

impl SuffixedExpr<'_> {
    /// The pc of the trailing call, when the expression ends in one.
    pub(crate) fn call_pc(&self) -> Option<u32> {
        match self.pend {
            Pending::Temp { .. } => self.last_call,
            _ => None,
        }
    }
}

/// How a name resolves at its use site.
pub(crate) enum NameRef {
    Local {
        reg: u8,
        attrib: Attrib,
        group: Option<usize>,
    },
    Upval {
        idx: u8,
    },
    Global,
}

enum LValue {
    Local { reg: u8 },
    Upval { idx: u8 },
    Global { k: u32 },
    Field { obj: u8, k: u32 },
    Index { obj: u8, idx: u8 },
}

pub(crate) struct FuncResult<'a> {
    pub(crate) proto: u32,
    pub(crate) node: NodeRef<'a>,
    pub(crate) endline: u32,
}

pub(crate) struct CatchParts<'a> {
    pub(crate) handler_node: Option<NodeRef<'a>>,
    pub(crate) expr_node: NodeRef<'a>,
    pub(crate) end_pc: u32,
    pub(crate) base: u8,
}

fn binop_of(tok: Token) -> Option<BinOp> {
    Some(match tok {
        Token::Plus => BinOp::Add,
        Token::Minus => BinOp::Sub,
        Token::Star => BinOp::Mul,
        Token::Slash => BinOp::Div,
        Token::DSlash => BinOp::IDiv,
        Token::Percent => BinOp::Mod,
        Token::Caret => BinOp::Pow,
        Token::Concat => BinOp::Concat,
        Token::Eq => BinOp::Eq,
        Token::Ne => BinOp::Ne,
        Token::Lt => BinOp::Lt,
        Token::Le => BinOp::Le,
        Token::Gt => BinOp::Gt,
        Token::Ge => BinOp::Ge,
        Token::And => BinOp::And,
        Token::Or => BinOp::Or,
        Token::Amp => BinOp::BAnd,
        Token::Pipe => BinOp::BOr,
        Token::Tilde => BinOp::BXor,
        Token::Shl => BinOp::Shl,
        Token::Shr => BinOp::Shr,
        _ => return None,
    })
}

fn unop_of(tok: Token) -> Option<UnOp> {
    Some(match tok {
        Token::Minus => UnOp::Neg,
        Token::Not => UnOp::Not,
        Token::Hash => UnOp::Len,
        Token::Tilde => UnOp::BNot,
        _ => return None,
    })
}

impl<'a, 's> Parser<'a, 's> {
    // ----- name resolution -----

    pub(crate) fn resolve(&mut self, name: &'a str) -> Result<NameRef, Error> {
        let top = self.fs.len() - 1;
        self.resolve_at(top, name)
    }

    fn resolve_at(&mut self, level: usize, name: &'a str) -> Result<NameRef, Error> {
        let lo = self.fs[level].first_local;
        let hi = if level + 1 < self.fs.len() {
            self.fs[level + 1].first_local
        } else {
            self.dyn_data.actvar.len()
        };
        if let Some(var) = self.dyn_data.actvar[lo..hi]
            .iter()
            .rev()
            .find(|v| v.name == name)
        {
            if var.group.is_some() && level + 1 != self.fs.len() {
                return Err(self.err_here(format!(
                    "cannot capture group '{name}' in a nested function"
                )));
            }
            return Ok(NameRef::Local {
                reg: var.reg,
                attrib: var.attrib,
                group: var.group,
            });
        }
        if level == 0 {
            return Ok(NameRef::Global);
        }
        if let Some(idx) = self.fs[level]
            .chunk
            .upvals
            .iter()
            .position(|u| u.name == name)
        {
            return Ok(NameRef::Upval { idx: idx as u8 });
        }
        match self.resolve_at(level - 1, name)? {
            NameRef::Local { reg, .. } => Ok(NameRef::Upval {
                idx: self.add_upval(level, name, true, reg)?,
            }),
            NameRef::Upval { idx } => Ok(NameRef::Upval {
                idx: self.add_upval(level, name, false, idx)?,
            }),
            NameRef::Global => Ok(NameRef::Global),
        }
    }

    fn add_upval(
        &mut self,
        level: usize,
        name: &str,
        from_parent_reg: bool,
        index: u8,
    ) -> Result<u8, Error> {
        if self.fs[level].chunk.upvals.len() >= u8::MAX as usize {
            return Err(self.err_here("too many upvalues in function"));
        }
        self.fs[level].chunk.upvals.push(UpvalDesc {
            name: name.to_owned(),
            from_parent_reg,
            index,
        });
        Ok((self.fs[level].chunk.upvals.len() - 1) as u8)
    }

    /// Load `name` into a fresh register.
    pub(crate) fn load_name(&mut self, name: &'a str) -> Result<u8, Error> {
        match self.resolve(name)? {
            NameRef::Local { group: Some(_), .. } => Err(self.err_here(format!(
                "group '{name}' must be accessed through a field"
            ))),
            NameRef::Local { reg, .. } => {
                let dst = self.reserve(1)?;
                self.emit(Op::Move { dst, src: reg });
                Ok(dst)
            }
            NameRef::Upval { idx } => {
                let dst = self.reserve(1)?;
                self.emit(Op::GetUpval { dst, upval: idx });
                Ok(dst)
            }
            NameRef::Global => {
                let dst = self.reserve(1)?;
                let k = self.str_const(name);
                self.emit(Op::GetGlobal { dst, name: k });
                Ok(dst)
            }
        }
    }

    /// Store the value in `src` into `name`.
    pub(crate) fn store_name(&mut self, name: &'a str, src: u8) -> Result<(), Error> {
        match self.resolve(name)? {
            NameRef::Local { group: Some(_), .. } => Err(self.err_here(format!(
                "group '{name}' can only be overwritten field-wise"
            ))),
            NameRef::Local { attrib, .. } if attrib.readonly() => Err(self.err_here(format!(
                "cannot assign to <{}> variable '{name}'",
                match attrib {
                    Attrib::Const => "const",
                    Attrib::Close => "close",
                    _ => "group",
                }
            ))),
            NameRef::Local { reg, .. } => {
                self.emit(Op::Move { dst: reg, src });
                Ok(())
            }
            NameRef::Upval { idx } => {
                self.emit(Op::SetUpval { upval: idx, src });
                Ok(())
            }
            NameRef::Global => {
                let k = self.str_const(name);
                self.emit(Op::SetGlobal { name: k, src });
                Ok(())
            }
        }
    }

    // ----- expressions -----

    pub(crate) fn expr(&mut self) -> Result<ExprVal<'a>, Error> {
        self.subexpr(0)
    }

    fn subexpr(&mut self, limit: u8) -> Result<ExprVal<'a>, Error> {
        let line = self.tok.line;
        let mut left = if let Some(op) = unop_of(self.tok.tok) {
            self.next()?;
            let operand = self.subexpr(UNARY_PRIORITY)?;
            self.emit(Op::Unary {
                op,
                dst: operand.reg,
                src: operand.reg,
            });
            let node = self.node(
                NodeKind::UnOp {
                    op,
                    operand: operand.node,
                },
                line,
                line,
            );
            ExprVal {
                reg: operand.reg,
                node,
                multi: None,
            }
        } else {
            self.simple_exp()?
        };

        while let Some(op) = binop_of(self.tok.tok) {
            let (left_pri, right_pri) = op.priority();
            if left_pri <= limit {
                break;
            }
            self.next()?;
            let node = match op {
                // and/or short-circuit through the shared result register.
                BinOp::And | BinOp::Or => {
                    let pc = self.emit(Op::TestJump {
                        src: left.reg,
                        if_true: op == BinOp::Or,
                        to: NO_TARGET,
                    });
                    self.fs_mut().free_to(left.reg);
                    let rhs = self.subexpr(right_pri)?;
                    debug_assert_eq!(rhs.reg, left.reg);
                    self.patch_jumps_here(&[pc]);
                    self.node(
                        NodeKind::BinOp {
                            op,
                            lhs: left.node,
                            rhs: rhs.node,
                        },
                        line,
                        line,
                    )
                }
                _ => {
                    let rhs = self.subexpr(right_pri)?;
                    self.emit(Op::Arith {
                        op,
                        dst: left.reg,
                        lhs: left.reg,
                        rhs: rhs.reg,
                    });
                    self.fs_mut().free_to(left.reg + 1);
                    self.node(
                        NodeKind::BinOp {
                            op,
                            lhs: left.node,
                            rhs: rhs.node,
                        },
                        line,
                        line,
                    )
                }
            };
            left = ExprVal {
                reg: left.reg,
                node,
                multi: None,
            };
        }
        Ok(left)
    }

    fn simple_exp(&mut self) -> Result<ExprVal<'a>, Error> {
        let line = self.tok.line;
        match self.tok.tok {
            Token::Int(value) => {
                self.next()?;
                let reg = self.reserve(1)?;
                let k = self.fs_mut().chunk.add_const(Const::Int(value));
                self.emit(Op::LoadK { dst: reg, k });
                let node = self.node(NodeKind::Number(Number::Int(value)), line, line);
                Ok(ExprVal {
                    reg,
                    node,
                    multi: None,
                })
            }
            Token::Float(value) => {
                self.next()?;
                let reg = self.reserve(1)?;
                let k = self.fs_mut().chunk.add_const(Const::Float(value));
                self.emit(Op::LoadK { dst: reg, k });
                let node = self.node(NodeKind::Number(Number::Float(value)), line, line);
                Ok(ExprVal {
                    reg,
                    node,
                    multi: None,
                })
            }
            Token::Str { value, quote } => {
                self.next()?;
                let reg = self.reserve(1)?;
                let k = self.str_const(value);
                self.emit(Op::LoadK { dst: reg, k });
                let node = self.node(
                    NodeKind::Str {
                        value,
                        quote: Some(quote),
                    },
                    line,
                    line,
                );
                Ok(ExprVal {
                    reg,
                    node,
                    multi: None,
                })
            }
            Token::Nil => {
                self.next()?;
                let reg = self.reserve(1)?;
                self.emit(Op::LoadNil { dst: reg, n: 1 });
                let node = self.node(NodeKind::Nil, line, line);
                Ok(ExprVal {
                    reg,
                    node,
                    multi: None,
                })
            }
            Token::True | Token::False => {
                let value = self.tok.tok == Token::True;
                self.next()?;
                let reg = self.reserve(1)?;
                self.emit(Op::LoadBool { dst: reg, value });
                let node = self.node(
                    if value { NodeKind::True } else { NodeKind::False },
                    line,
                    line,
                );
                Ok(ExprVal {
                    reg,
                    node,
                    multi: None,
                })
            }
            Token::Ellipsis => {
                if !self.fs_ref().chunk.is_vararg {
                    return Err(self.err_here("cannot use '...' outside a vararg function"));
                }
                self.next()?;
                let reg = self.reserve(1)?;
                let pc = self.emit(Op::Vararg { dst: reg, n: 1 });
                let node = self.node(NodeKind::Vararg, line, line);
                Ok(ExprVal {
                    reg,
                    node,
                    multi: Some(pc),
                })
            }
            Token::Function => {
                self.next()?;
                let func = self.function_body(false, "anonymous", line)?;
                let reg = self.reserve(1)?;
                self.emit(Op::Closure {
                    dst: reg,
                    proto: func.proto,
                });
                Ok(ExprVal {
                    reg,
                    node: func.node,
                    multi: None,
                })
            }
            Token::Catch => self.catch_expr(),
            Token::Enum => self.enum_expr(),
            Token::Do => self.do_expr(),
            Token::InterpStart => self.interp_expr(),
            Token::LBrace => self.table_constructor(),
            _ => {
                let sx = self.suffixed()?;
                self.finish_suffixed(sx)
            }
        }
    }

    // ----- suffixed expressions -----

    pub(crate) fn suffixed(&mut self) -> Result<SuffixedExpr<'a>, Error> {
        let line = self.tok.line;
        let (pend, node) = match self.tok.tok {
            Token::Name(name) => {
                self.next()?;
                let node = self.node(NodeKind::Name { name }, line, line);
                let pend = match self.resolve(name)? {
                    NameRef::Local {
                        group: Some(gidx), ..
                    } => Pending::Group { gidx },
                    NameRef::Local { reg, attrib, .. } => Pending::Local { reg, attrib },
                    NameRef::Upval { idx } => Pending::Upval { idx },
                    NameRef::Global => Pending::Global { name },
                };
                (pend, node)
            }
            Token::LParen => {
                self.next()?;
                let e = self.expr()?;
                self.expect(Token::RParen, "')'")?;
                let node = self.paren_wrap(e.node);
                (Pending::Temp { reg: e.reg }, node)
            }
            other => {
                return Err(self.err_here(format!("unexpected {}", other.describe())));
            }
        };

        let mut sx = SuffixedExpr {
            pend,
            node,
            base: None,
            opt_jumps: Vec::new(),
            last_call: None,
            has_opt: false,
            line,
        };
        loop {
            match self.tok.tok {
                Token::Dot => {
                    self.next()?;
                    let (name, nline) = self.expect_name()?;
                    sx.last_call = None;
                    if let Pending::Group { gidx } = sx.pend {
                        let field = self.group_field(gidx, name)?;
                        sx.pend = match field.group {
                            Some(sub) => Pending::Group { gidx: sub },
                            None => Pending::GroupField { reg: field.reg },
                        };
                    } else {
                        let obj = self.apply_pending(&mut sx)?;
                        sx.pend = Pending::Field { obj, name };
                    }
                    sx.node = self.node(
                        NodeKind::Field {
                            object: sx.node,
                            field: name,
                        },
                        sx.line,
                        nline,
                    );
                }
                Token::OptDot => {
                    self.next()?;
                    let (name, nline) = self.expect_name()?;
                    sx.last_call = None;
                    let obj = self.apply_pending(&mut sx)?;
                    let pc = self.emit(Op::TestJump {
                        src: obj,
                        if_true: false,
                        to: NO_TARGET,
                    });
                    sx.opt_jumps.push(pc);
                    sx.has_opt = true;
                    sx.pend = Pending::Field { obj, name };
                    sx.node = self.node(
                        NodeKind::OptChain {
                            object: sx.node,
                            field: name,
                        },
                        sx.line,
                        nline,
                    );
                }
                Token::LBracket => {
                    self.next()?;
                    sx.last_call = None;
                    let obj = self.apply_pending(&mut sx)?;
                    self.bracket_suffix(&mut sx, obj)?;
                }
                Token::Colon => {
                    self.next()?;
                    let (method, _) = self.expect_name()?;
                    sx.last_call = None;
                    let base = self.apply_pending(&mut sx)?;
                    let k = self.str_const(method);
                    self.emit(Op::SelfField {
                        base,
                        obj: base,
                        name: k,
                    });
                    self.reserve(1)?; // the implicit self argument
                    let (nargs, args, endline) = self.call_args()?;
                    let nargs = if nargs == MULTI { MULTI } else { nargs + 1 };
                    let pc = self.emit(Op::Call {
                        base,
                        nargs,
                        nresults: 1,
                    });
                    self.fs_mut().free_to(base + 1);
                    sx.pend = Pending::Temp { reg: base };
                    sx.last_call = Some(pc);
                    sx.node = self.node(
                        NodeKind::MethodCall {
                            object: sx.node,
                            method,
                            args,
                        },
                        sx.line,
                        endline,
                    );
                }
                Token::LParen | Token::Str { .. } | Token::LBrace => {
                    sx.last_call = None;
                    let base = self.apply_pending(&mut sx)?;
                    let (nargs, args, endline) = self.call_args()?;
                    let pc = self.emit(Op::Call {
                        base,
                        nargs,
                        nresults: 1,
                    });
                    self.fs_mut().free_to(base + 1);
                    sx.pend = Pending::Temp { reg: base };
                    sx.last_call = Some(pc);
                    sx.node = self.node(
                        NodeKind::CallExpr {
                            func: sx.node,
                            args,
                        },
                        sx.line,
                        endline,
                    );
                }
                _ => break,
            }
        }
        Ok(sx)
    }

    /// `[expr]` index, or `[a, b]` slice with either endpoint omissible.
    fn bracket_suffix(&mut self, sx: &mut SuffixedExpr<'a>, obj: u8) -> Result<(), Error> {
        let start = if matches!(self.tok.tok, Token::Comma) {
            None
        } else {
            Some(self.expr()?)
        };
        if self.accept(Token::Comma)? {
            // Slice: load nil for an omitted endpoint.
            let start_reg = match &start {
                Some(e) => e.reg,
                None => {
                    let reg = self.reserve(1)?;
                    self.emit(Op::LoadNil { dst: reg, n: 1 });
                    reg
                }
            };
            let end = if self.tok.tok == Token::RBracket {
                None
            } else {
                Some(self.expr()?)
            };
            let end_reg = match &end {
                Some(e) => e.reg,
                None => {
                    let reg = self.reserve(1)?;
                    self.emit(Op::LoadNil { dst: reg, n: 1 });
                    reg
                }
            };
            let endline = self.expect(Token::RBracket, "']'")?.line;
            self.emit(Op::Slice {
                dst: obj,
                obj,
                start: start_reg,
                end: end_reg,
            });
            self.fs_mut().free_to(obj + 1);
            sx.pend = Pending::Temp { reg: obj };
            sx.node = self.node(
                NodeKind::Slice {
                    object: sx.node,
                    start: start.as_ref().map(|e| e.node),
                    end: end.as_ref().map(|e| e.node),
                },
                sx.line,
                endline,
            );
        } else {
            let Some(index) = start else {
                return Err(self.err_here("index expression expected"));
            };
            let endline = self.expect(Token::RBracket, "']'")?.line;
            sx.pend = Pending::Index {
                obj,
                idx: index.reg,
            };
            sx.node = self.node(
                NodeKind::Index {
                    object: sx.node,
                    index: index.node,
                },
                sx.line,
                endline,
            );
        }
        Ok(())
    }

    /// Realize the pending value into the chain's base register, which is
    /// shared by every suffix of the chain.
    fn apply_pending(&mut self, sx: &mut SuffixedExpr<'a>) -> Result<u8, Error> {
        if sx.base.is_none() {
            if let Pending::Temp { reg } = sx.pend {
                // The computed value is already the top temporary.
                sx.base = Some(reg);
                return Ok(reg);
            }
        }
        let base = match sx.base {
            Some(base) => base,
            None => {
                let base = self.reserve(1)?;
                sx.base = Some(base);
                base
            }
        };
        match sx.pend {
            Pending::Temp { reg } => {
                if reg != base {
                    self.emit(Op::Move { dst: base, src: reg });
                }
            }
            Pending::Local { reg, .. } | Pending::GroupField { reg } => {
                self.emit(Op::Move { dst: base, src: reg });
            }
            Pending::Upval { idx } => {
                self.emit(Op::GetUpval {
                    dst: base,
                    upval: idx,
                });
            }
            Pending::Global { name } => {
                let k = self.str_const(name);
                self.emit(Op::GetGlobal { dst: base, name: k });
            }
            Pending::Field { obj, name } => {
                let k = self.str_const(name);
                self.emit(Op::GetField {
                    dst: base,
                    obj,
                    name: k,
                });
            }
            Pending::Index { obj, idx } => {
                self.emit(Op::GetIndex {
                    dst: base,
                    obj,
                    idx,
                });
            }
            Pending::Group { .. } => {
                return Err(self.err_here("group binding must be accessed through a field"));
            }
        }
        self.fs_mut().free_to(base + 1);
        sx.pend = Pending::Temp { reg: base };
        Ok(base)
    }

    /// Realize a suffixed expression as an rvalue, closing any optional
    /// chain by patching its short-circuit jumps here.
    pub(crate) fn finish_suffixed(&mut self, mut sx: SuffixedExpr<'a>) -> Result<ExprVal<'a>, Error> {
        let reg = self.apply_pending(&mut sx)?;
        self.patch_jumps_here(&sx.opt_jumps);
        Ok(ExprVal {
            reg,
            node: sx.node,
            multi: sx.call_pc(),
        })
    }

    fn group_field(&mut self, gidx: usize, name: &str) -> Result<GroupField<'a>, Error> {
        match self.dyn_data.groups[gidx].field(name) {
            Some(field) => Ok(field),
            None => Err(self.err_here(format!("field '{name}' is not part of the group"))),
        }
    }

    fn paren_wrap(&mut self, inner: NodeRef<'a>) -> NodeRef<'a> {
        let mut wrapped = *inner;
        wrapped.paren = true;
        self.node_count += 1;
        &*self.arena.alloc(wrapped)
    }

    fn call_args(&mut self) -> Result<(u8, NodeList<'a>, u32), Error> {
        match self.tok.tok {
            Token::LParen => {
                self.next()?;
                if self.tok.tok == Token::RParen {
                    let endline = self.tok.line;
                    self.next()?;
                    return Ok((0, self.nodes(Vec::new()), endline));
                }
                let list = self.explist()?;
                let endline = self.expect(Token::RParen, "')'")?.line;
                let nargs = if let Some(pc) = list.last_multi {
                    self.fs_mut().chunk.patch_results(pc, MULTI);
                    MULTI
                } else {
                    list.count
                };
                Ok((nargs, self.nodes(list.nodes), endline))
            }
            Token::Str { value, quote } => {
                let line = self.tok.line;
                self.next()?;
                let reg = self.reserve(1)?;
                let k = self.str_const(value);
                self.emit(Op::LoadK { dst: reg, k });
                let node = self.node(
                    NodeKind::Str {
                        value,
                        quote: Some(quote),
                    },
                    line,
                    line,
                );
                Ok((1, self.nodes(vec![node]), line))
            }
            Token::LBrace => {
                let table = self.table_constructor()?;
                let endline = table.node.endline;
                Ok((1, self.nodes(vec![table.node]), endline))
            }
            other => Err(self.err_here(format!(
                "function arguments expected ({} found)",
                other.describe()
            ))),
        }
    }

    // ----- expression lists -----

    pub(crate) fn explist(&mut self) -> Result<ExpList<'a>, Error> {
        let base = self.fs_ref().freereg;
        let mut nodes = Vec::new();
        let mut count = 0u8;
        let mut last_multi = None;
        loop {
            let e = self.expr()?;
            debug_assert_eq!(e.reg, base + count);
            nodes.push(e.node);
            count += 1;
            last_multi = e.multi;
            if !self.accept(Token::Comma)? {
                break;
            }
        }
        Ok(ExpList {
            base,
            count,
            last_multi,
            nodes,
        })
    }

    /// Fit an evaluated list to exactly `want` registers: widen an open
    /// trailing call, pad with nils, or drop extras.
    pub(crate) fn adjust_explist(&mut self, list: ExpList<'a>, want: u8) -> Result<(), Error> {
        let have = list.count;
        if let Some(pc) = list.last_multi {
            if want >= have {
                self.fs_mut().chunk.patch_results(pc, want - have + 1);
                if want > have {
                    self.reserve(want - have)?;
                }
                return Ok(());
            }
        }
        if want > have {
            let reg = self.reserve(want - have)?;
            self.emit(Op::LoadNil {
                dst: reg,
                n: want - have,
            });
        } else if want < have {
            self.fs_mut().free_to(list.base + want);
        }
        Ok(())
    }

    // ----- assignment -----

    pub(crate) fn assignment(
        &mut self,
        line: u32,
        first: SuffixedExpr<'a>,
    ) -> Result<NodeRef<'a>, Error> {
        let mut target_nodes = vec![first.node];
        let mut targets = vec![self.lvalue_of(first)?];
        while self.accept(Token::Comma)? {
            let sx = self.suffixed()?;
            target_nodes.push(sx.node);
            if let Pending::Group { .. } = sx.pend {
                return Err(
                    self.err_here("a group overwrite must be the only assignment target")
                );
            }
            targets.push(self.lvalue_of(sx)?);
        }
        self.expect(Token::Assign, "'='")?;

        let base = self.fs_ref().freereg;
        let list = self.explist()?;
        let value_nodes = list.nodes.clone();
        let n = targets.len() as u8;
        self.adjust_explist(list, n)?;

        for (i, target) in targets.iter().enumerate() {
            let src = base + i as u8;
            match *target {
                LValue::Local { reg } => {
                    self.emit(Op::Move { dst: reg, src });
                }
                LValue::Upval { idx } => {
                    self.emit(Op::SetUpval { upval: idx, src });
                }
                LValue::Global { k } => {
                    self.emit(Op::SetGlobal { name: k, src });
                }
                LValue::Field { obj, k } => {
                    self.emit(Op::SetField {
                        obj,
                        name: k,
                        src,
                    });
                }
                LValue::Index { obj, idx } => {
                    self.emit(Op::SetIndex { obj, idx, src });
                }
            }
        }

        let endline = self.tok.line;
        Ok(self.node(
            NodeKind::Assign {
                targets: self.nodes(target_nodes),
                values: self.nodes(value_nodes),
            },
            line,
            endline,
        ))
    }

    fn lvalue_of(&mut self, sx: SuffixedExpr<'a>) -> Result<LValue, Error> {
        if sx.has_opt {
            return Err(self.err_here("cannot assign through an optional chain"));
        }
        match sx.pend {
            Pending::Local { reg, attrib } => {
                if attrib.readonly() {
                    return Err(self.err_here(format!(
                        "cannot assign to <{}> variable",
                        match attrib {
                            Attrib::Const => "const",
                            Attrib::Close => "close",
                            _ => "group",
                        }
                    )));
                }
                Ok(LValue::Local { reg })
            }
            Pending::GroupField { reg } => Ok(LValue::Local { reg }),
            Pending::Upval { idx } => Ok(LValue::Upval { idx }),
            Pending::Global { name } => {
                let k = self.str_const(name);
                Ok(LValue::Global { k })
            }
            Pending::Field { obj, name } => {
                let k = self.str_const(name);
                Ok(LValue::Field { obj, k })
            }
            Pending::Index { obj, idx } => Ok(LValue::Index { obj, idx }),
            Pending::Group { .. } => {
                Err(self.err_here("a group overwrite must be the only assignment target"))
            }
            Pending::Temp { .. } => Err(self.err_here("cannot assign to this expression")),
        }
    }

    // ----- groups -----

    /// `g = { x = v, ... }` or `g = other_group`: field-wise moves. This is
    /// the one assignment form that rejects unknown keys.
    pub(crate) fn group_overwrite(
        &mut self,
        line: u32,
        gidx: usize,
        group_node: NodeRef<'a>,
    ) -> Result<NodeRef<'a>, Error> {
        if self.tok.tok == Token::Comma {
            return Err(self.err_here("a group overwrite must be the only assignment target"));
        }
        self.expect(Token::Assign, "'='")?;

        let value_node = match self.tok.tok {
            Token::LBrace => self.group_overwrite_ctor(gidx)?,
            Token::Name(src_name) => {
                let nline = self.tok.line;
                match self.resolve(src_name)? {
                    NameRef::Local {
                        group: Some(src_gidx),
                        ..
                    } => {
                        self.next()?;
                        self.group_copy(gidx, src_gidx)?;
                        self.node(NodeKind::Name { name: src_name }, nline, nline)
                    }
                    _ => {
                        return Err(self.err_here(
                            "only a table constructor or another group can overwrite a group",
                        ))
                    }
                }
            }
            _ => {
                return Err(self.err_here(
                    "only a table constructor or another group can overwrite a group",
                ))
            }
        };

        let endline = self.tok.line;
        Ok(self.node(
            NodeKind::Assign {
                targets: self.nodes(vec![group_node]),
                values: self.nodes(vec![value_node]),
            },
            line,
            endline,
        ))
    }

    fn group_overwrite_ctor(&mut self, gidx: usize) -> Result<NodeRef<'a>, Error> {
        let line = self.tok.line;
        self.expect(Token::LBrace, "'{'")?;
        let mut fields = Vec::new();
        while self.tok.tok != Token::RBrace {
            let Token::Name(fname) = self.tok.tok else {
                return Err(self.err_here("a group overwrite allows only 'name = value' fields"));
            };
            let fline = self.tok.line;
            self.next()?;
            self.expect(Token::Assign, "'='")?;
            let field = self.group_field(gidx, fname)?;
            let value_node = match field.group {
                Some(sub) => {
                    if self.tok.tok != Token::LBrace {
                        return Err(self.err_here(format!(
                            "field '{fname}' is a sub-group and needs a constructor"
                        )));
                    }
                    self.group_overwrite_ctor(sub)?
                }
                None => {
                    let e = self.expr()?;
                    self.emit(Op::Move {
                        dst: field.reg,
                        src: e.reg,
                    });
                    self.fs_mut().free_to(e.reg);
                    e.node
                }
            };
            fields.push(self.node(
                NodeKind::TableField {
                    key: TableKey::Name(fname),
                    value: value_node,
                },
                fline,
                fline,
            ));
            if !(self.accept(Token::Comma)? || self.accept(Token::Semi)?) {
                break;
            }
        }
        let end = self.expect(Token::RBrace, "'}'")?;
        Ok(self.node(
            NodeKind::Table {
                fields: self.nodes(fields),
            },
            line,
            end.line,
        ))
    }

    fn group_copy(&mut self, dst: usize, src: usize) -> Result<(), Error> {
        let src_fields = self.dyn_data.groups[src].fields.clone();
        for sf in src_fields {
            let Some(tf) = self.dyn_data.groups[dst].field(sf.name) else {
                return Err(self.err_here(format!(
                    "field '{}' is not part of the target group",
                    sf.name
                )));
            };
            match (tf.group, sf.group) {
                (Some(td), Some(sd)) => self.group_copy(td, sd)?,
                (None, None) => {
                    self.emit(Op::Move {
                        dst: tf.reg,
                        src: sf.reg,
                    });
                }
                _ => {
                    return Err(self.err_here(format!(
                        "field '{}' differs in group shape",
                        sf.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// `local g <group> = { ... }`: declare every field as a real local and
    /// record the register map for compile-time resolution.
    pub(crate) fn group_decl(
        &mut self,
        line: u32,
        names: Vec<(&'a str, u32, Attrib, Option<&'a str>)>,
    ) -> Result<NodeRef<'a>, Error> {
        if names.len() != 1 {
            return Err(self.err_here("a group declaration binds exactly one name"));
        }
        let (name, nline, _, attrib_name) = names[0];
        self.expect(Token::Assign, "'='")?;
        if self.tok.tok != Token::LBrace {
            return Err(self.err_here("a group must be initialized with a table constructor"));
        }
        let base = self.fs_ref().freereg;
        let (gidx, table_node) = self.group_ctor()?;
        self.declare_local(name, base, Attrib::Group, Some(gidx));

        let endline = self.tok.line;
        let target = self.node(
            NodeKind::Param {
                name,
                attrib: attrib_name,
            },
            nline,
            nline,
        );
        let targets = self.nodes(vec![target]);
        Ok(self.node(
            NodeKind::Local {
                targets,
                values: self.nodes(vec![table_node]),
            },
            line,
            endline,
        ))
    }

    fn group_ctor(&mut self) -> Result<(usize, NodeRef<'a>), Error> {
        let line = self.tok.line;
        self.expect(Token::LBrace, "'{'")?;
        let gidx = self.dyn_data.groups.len();
        self.dyn_data.groups.push(GroupDesc::default());

        let mut fields = Vec::new();
        while self.tok.tok != Token::RBrace {
            let Token::Name(fname) = self.tok.tok else {
                return Err(self.err_here("a group constructor allows only 'name = value' fields"));
            };
            let fline = self.tok.line;
            self.next()?;
            self.expect(Token::Assign, "'='")?;
            if self.dyn_data.groups[gidx].field(fname).is_some() {
                return Err(self.err_here(format!("duplicate group field '{fname}'")));
            }

            let (field, value_node) = if self.tok.tok == Token::LBrace {
                // A nested constructor declares a sub-group.
                let sub_base = self.fs_ref().freereg;
                let (sub, sub_node) = self.group_ctor()?;
                (
                    GroupField {
                        name: fname,
                        reg: sub_base,
                        group: Some(sub),
                    },
                    sub_node,
                )
            } else {
                let e = self.expr()?;
                (
                    GroupField {
                        name: fname,
                        reg: e.reg,
                        group: None,
                    },
                    e.node,
                )
            };
            self.dyn_data.groups[gidx].fields.push(field);
            fields.push(self.node(
                NodeKind::TableField {
                    key: TableKey::Name(fname),
                    value: value_node,
                },
                fline,
                fline,
            ));
            if !(self.accept(Token::Comma)? || self.accept(Token::Semi)?) {
                break;
            }
        }
        let end = self.expect(Token::RBrace, "'}'")?;
        let node = self.node(
            NodeKind::Table {
                fields: self.nodes(fields),
            },
            line,
            end.line,
        );
        Ok((gidx, node))
    }

    // ----- constructors and special expressions -----

    fn table_constructor(&mut self) -> Result<ExprVal<'a>, Error> {
        let line = self.tok.line;
        self.expect(Token::LBrace, "'{'")?;
        let reg = self.reserve(1)?;
        self.emit(Op::NewTable { dst: reg, hint: 0 });

        let mut fields = Vec::new();
        let mut index = 1i64;
        while self.tok.tok != Token::RBrace {
            let fline = self.tok.line;
            let named =
                matches!(self.tok.tok, Token::Name(_)) && self.peek_ahead()? == Token::Assign;
            if self.tok.tok == Token::LBracket {
                self.next()?;
                let key = self.expr()?;
                self.expect(Token::RBracket, "']'")?;
                self.expect(Token::Assign, "'='")?;
                let value = self.expr()?;
                self.emit(Op::SetIndex {
                    obj: reg,
                    idx: key.reg,
                    src: value.reg,
                });
                self.fs_mut().free_to(reg + 1);
                fields.push(self.node(
                    NodeKind::TableField {
                        key: TableKey::Expr(key.node),
                        value: value.node,
                    },
                    fline,
                    fline,
                ));
            } else if named {
                let Token::Name(name) = self.tok.tok else {
                    unreachable!("checked above");
                };
                self.next()?;
                self.next()?;
                let value = self.expr()?;
                let k = self.str_const(name);
                self.emit(Op::SetField {
                    obj: reg,
                    name: k,
                    src: value.reg,
                });
                self.fs_mut().free_to(reg + 1);
                fields.push(self.node(
                    NodeKind::TableField {
                        key: TableKey::Name(name),
                        value: value.node,
                    },
                    fline,
                    fline,
                ));
            } else {
                let value = self.expr()?;
                let idx_reg = self.reserve(1)?;
                let k = self.fs_mut().chunk.add_const(Const::Int(index));
                self.emit(Op::LoadK { dst: idx_reg, k });
                self.emit(Op::SetIndex {
                    obj: reg,
                    idx: idx_reg,
                    src: value.reg,
                });
                index += 1;
                self.fs_mut().free_to(reg + 1);
                fields.push(self.node(
                    NodeKind::TableField {
                        key: TableKey::None,
                        value: value.node,
                    },
                    fline,
                    fline,
                ));
            }
            if !(self.accept(Token::Comma)? || self.accept(Token::Semi)?) {
                break;
            }
        }
        let end = self.expect(Token::RBrace, "'}'")?;
        let node = self.node(
            NodeKind::Table {
                fields: self.nodes(fields),
            },
            line,
            end.line,
        );
        Ok(ExprVal {
            reg,
            node,
            multi: None,
        })
    }

    /// `catch expr` / `catch[h] expr`: a protected frame bracketed by
    /// Catch/EndCatch, yielding `(true, results…)` or `(false, error)`.
    pub(crate) fn catch_core(&mut self) -> Result<CatchParts<'a>, Error> {
        self.next()?;
        let base = self.reserve(1)?;
        let (handler, handler_node) = if self.accept(Token::LBracket)? {
            let h = self.expr()?;
            self.expect(Token::RBracket, "']'")?;
            (h.reg, Some(h.node))
        } else {
            (NO_REG, None)
        };

        let catch_pc = self.emit(Op::Catch {
            base,
            handler,
            to: NO_TARGET,
        });
        let e = self.expr()?;
        if let Some(pc) = e.multi {
            self.fs_mut().chunk.patch_results(pc, MULTI);
        }
        let end_pc = self.emit(Op::EndCatch {
            base,
            src: e.reg,
            nresults: 1,
        });
        let here = self.fs_ref().chunk.here();
        self.fs_mut().chunk.patch_to(catch_pc, here);
        self.fs_mut().free_to(base + 1);

        Ok(CatchParts {
            handler_node,
            expr_node: e.node,
            end_pc,
            base,
        })
    }

    fn catch_expr(&mut self) -> Result<ExprVal<'a>, Error> {
        let line = self.tok.line;
        let parts = self.catch_core()?;
        let endline = self.tok.line;
        let node = self.node(
            NodeKind::CatchExpr {
                handler: parts.handler_node,
                expr: parts.expr_node,
            },
            line,
            endline,
        );
        Ok(ExprVal {
            reg: parts.base,
            node,
            multi: Some(parts.end_pc),
        })
    }

    fn enum_expr(&mut self) -> Result<ExprVal<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        let mut names = Vec::new();
        let mut name_nodes = Vec::new();
        loop {
            let (name, nline) = self.expect_name()?;
            if names.iter().any(|have| have == name) {
                return Err(self.err_here(format!("duplicate enum name '{name}'")));
            }
            names.push(name.to_owned());
            name_nodes.push(self.node(NodeKind::Name { name }, nline, nline));
            if !self.accept(Token::Comma)? {
                break;
            }
        }
        let end = self.expect(Token::End, "'end'")?;
        let reg = self.reserve(1)?;
        let k = self.fs_mut().chunk.add_const(Const::Enum(names));
        self.emit(Op::LoadK { dst: reg, k });
        let node = self.node(
            NodeKind::Enum {
                names: self.nodes(name_nodes),
            },
            line,
            end.line,
        );
        Ok(ExprVal {
            reg,
            node,
            multi: None,
        })
    }

    /// `do ... end` in expression position: an immediately invoked closure
    /// whose `return`/`provide` yields the expression's value.
    fn do_expr(&mut self) -> Result<ExprVal<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        let fs = FuncState::new("do", line, &self.dyn_data);
        self.fs.push(fs);
        self.open_block(false);
        let body = self.stat_list()?;
        let end = self.expect(Token::End, "'end'")?;
        self.emit(Op::Return { base: 0, n: 0 });
        self.close_block()?;

        let done = self.fs.pop().expect("pushed above");
        let parent = self.fs.last_mut().expect("enclosing function");
        parent.chunk.protos.push(done.chunk);
        let proto = (parent.chunk.protos.len() - 1) as u32;

        let reg = self.reserve(1)?;
        self.emit(Op::Closure { dst: reg, proto });
        self.emit(Op::Call {
            base: reg,
            nargs: 0,
            nresults: 1,
        });
        let node = self.node(NodeKind::DoExpr { body }, line, end.line);
        Ok(ExprVal {
            reg,
            node,
            multi: None,
        })
    }

    fn interp_expr(&mut self) -> Result<ExprVal<'a>, Error> {
        let line = self.tok.line;
        self.next()?;
        let base = self.fs_ref().freereg;
        let mut parts = Vec::new();
        let mut count = 0u8;
        let endline;
        loop {
            match self.tok.tok {
                Token::InterpLit(value) => {
                    let pline = self.tok.line;
                    self.next()?;
                    let reg = self.reserve(1)?;
                    let k = self.str_const(value);
                    self.emit(Op::LoadK { dst: reg, k });
                    parts.push(self.node(NodeKind::Str { value, quote: None }, pline, pline));
                    count += 1;
                }
                Token::InterpHoleName(name) => {
                    let pline = self.tok.line;
                    self.next()?;
                    let reg = self.load_name(name)?;
                    self.emit(Op::ToString { dst: reg, src: reg });
                    parts.push(self.node(NodeKind::Name { name }, pline, pline));
                    count += 1;
                }
                Token::InterpExprStart => {
                    self.next()?;
                    let e = self.expr()?;
                    self.expect(Token::InterpExprEnd, "')'")?;
                    self.emit(Op::ToString {
                        dst: e.reg,
                        src: e.reg,
                    });
                    parts.push(e.node);
                    count += 1;
                }
                Token::InterpEnd => {
                    endline = self.tok.line;
                    self.next()?;
                    break;
                }
                other => {
                    return Err(self.err_here(format!(
                        "malformed interpolated string ({} found)",
                        other.describe()
                    )));
                }
            }
        }

        if count == 0 {
            let reg = self.reserve(1)?;
            let k = self.str_const("");
            self.emit(Op::LoadK { dst: reg, k });
        } else if count > 1 {
            self.emit(Op::Concat {
                dst: base,
                base,
                n: count,
            });
        }
        self.fs_mut().free_to(base + 1);
        let node = self.node(
            NodeKind::Interp {
                parts: self.nodes(parts),
            },
            line,
            endline,
        );
        Ok(ExprVal {
            reg: base,
            node,
            multi: None,
        })
    }

    // ----- function bodies -----

    pub(crate) fn function_body(
        &mut self,
        is_method: bool,
        name: &str,
        line: u32,
    ) -> Result<FuncResult<'a>, Error> {
        let fs = FuncState::new(name, line, &self.dyn_data);
        self.fs.push(fs);
        self.open_block(false);

        self.expect(Token::LParen, "'('")?;
        let mut params = Vec::new();
        let mut nparams = 0u8;
        if is_method {
            let reg = self.reserve(1)?;
            self.declare_local("self", reg, Attrib::None, None);
            nparams += 1;
        }
        if self.tok.tok != Token::RParen {
            loop {
                match self.tok.tok {
                    Token::Ellipsis => {
                        let pline = self.tok.line;
                        self.next()?;
                        self.fs_mut().chunk.is_vararg = true;
                        params.push(self.node(NodeKind::Vararg, pline, pline));
                        break;
                    }
                    Token::Name(pname) => {
                        let pline = self.tok.line;
                        self.next()?;
                        let (attrib, attrib_name) = self.attrib()?;
                        let reg = self.reserve(1)?;
                        self.declare_local(pname, reg, attrib, None);
                        nparams += 1;
                        params.push(self.node(
                            NodeKind::Param {
                                name: pname,
                                attrib: attrib_name,
                            },
                            pline,
                            pline,
                        ));
                    }
                    other => {
                        return Err(self.err_here(format!(
                            "parameter name expected ({} found)",
                            other.describe()
                        )));
                    }
                }
                if !self.accept(Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')'")?;
        self.fs_mut().chunk.nparams = nparams;

        let body = self.stat_list()?;
        let end = self.expect(Token::End, "'end'")?;
        self.emit(Op::Return { base: 0, n: 0 });
        self.close_block()?;

        let done = self.fs.pop().expect("pushed above");
        let parent = self.fs.last_mut().expect("enclosing function");
        parent.chunk.protos.push(done.chunk);
        let proto = (parent.chunk.protos.len() - 1) as u32;

        let params = self.nodes(params);
        let node = self.node(NodeKind::FuncExpr { params, body }, line, end.line);
        Ok(FuncResult {
            proto,
            node,
            endline: end.line,
        })
    }
}
