use ast::{NodeKind, Quote};
use parser::{parse, Chunk, Const, Op, Options, MULTI, NO_REG};

fn compile(source: &str) -> Chunk {
    let arena = arena::Arena::new();
    parse(source, "test", &arena, &Options::default())
        .expect("source should parse")
        .chunk
}

fn compile_err(source: &str) -> parser::Error {
    let arena = arena::Arena::new();
    match parse(source, "test", &arena, &Options::default()) {
        Ok(_) => panic!("source should not parse: {source:?}"),
        Err(err) => err,
    }
}

#[test]
fn empty_input_is_an_empty_chunk() {
    let chunk = compile("");
    assert_eq!(chunk.ops, vec![Op::Return { base: 0, n: 0 }]);

    let arena = arena::Arena::new();
    let parsed = parse("", "test", &arena, &Options::default()).unwrap();
    let ast = parsed.ast.unwrap();
    match ast.root.kind {
        NodeKind::Chunk { body } => assert!(body.is_empty()),
        ref other => panic!("root is {}", other.name()),
    }
}

#[test]
fn optional_chain_shares_one_register() {
    let chunk = compile("local r = a?.b?.c");
    // One base register carries the whole chain; both short-circuit
    // jumps land just past its final read.
    assert_eq!(
        chunk.ops,
        vec![
            Op::GetGlobal { dst: 0, name: 0 },
            Op::TestJump {
                src: 0,
                if_true: false,
                to: 5
            },
            Op::GetField {
                dst: 0,
                obj: 0,
                name: 1
            },
            Op::TestJump {
                src: 0,
                if_true: false,
                to: 5
            },
            Op::GetField {
                dst: 0,
                obj: 0,
                name: 2
            },
            Op::Return { base: 0, n: 0 },
        ]
    );
    assert_eq!(
        chunk.consts,
        vec![
            Const::Str("a".into()),
            Const::Str("b".into()),
            Const::Str("c".into()),
        ]
    );
}

#[test]
fn from_reserves_targets_then_reads_fields() {
    let chunk = compile("local x, y from t");
    assert_eq!(
        chunk.ops,
        vec![
            Op::GetGlobal { dst: 2, name: 0 },
            Op::GetField {
                dst: 0,
                obj: 2,
                name: 1
            },
            Op::GetField {
                dst: 1,
                obj: 2,
                name: 2
            },
            Op::Return { base: 0, n: 0 },
        ]
    );
}

#[test]
fn catch_brackets_protected_code() {
    let chunk = compile("local ok, v = catch[h] f()");
    assert_eq!(
        chunk.ops,
        vec![
            Op::GetGlobal { dst: 1, name: 0 }, // handler
            Op::Catch {
                base: 0,
                handler: 1,
                to: 5
            },
            Op::GetGlobal { dst: 2, name: 1 },
            Op::Call {
                base: 2,
                nargs: 0,
                nresults: MULTI
            },
            Op::EndCatch {
                base: 0,
                src: 2,
                nresults: 2 // widened to fill both targets
            },
            Op::Return { base: 0, n: 0 },
        ]
    );
}

#[test]
fn catch_without_handler_uses_no_register() {
    let chunk = compile("local ok = catch f()");
    assert!(chunk
        .ops
        .iter()
        .any(|op| matches!(op, Op::Catch { handler, .. } if *handler == NO_REG)));
}

#[test]
fn interpolation_tostrings_holes_and_concats() {
    let chunk = compile("local s = `a $x b`");
    assert_eq!(
        chunk.ops,
        vec![
            Op::LoadK { dst: 0, k: 0 },
            Op::GetGlobal { dst: 1, name: 1 },
            Op::ToString { dst: 1, src: 1 },
            Op::LoadK { dst: 2, k: 2 },
            Op::Concat {
                dst: 0,
                base: 0,
                n: 3
            },
            Op::Return { base: 0, n: 0 },
        ]
    );
    assert_eq!(chunk.consts[0], Const::Str("a ".into()));
    assert_eq!(chunk.consts[2], Const::Str(" b".into()));
}

#[test]
fn slice_with_omitted_endpoints_loads_nil() {
    let chunk = compile("local s = t[,]");
    assert_eq!(
        chunk.ops,
        vec![
            Op::GetGlobal { dst: 0, name: 0 },
            Op::LoadNil { dst: 1, n: 1 },
            Op::LoadNil { dst: 2, n: 1 },
            Op::Slice {
                dst: 0,
                obj: 0,
                start: 1,
                end: 2
            },
            Op::Return { base: 0, n: 0 },
        ]
    );
}

#[test]
fn enum_lives_in_the_constant_pool() {
    let chunk = compile("local e = enum A, B, C end");
    assert_eq!(
        chunk.consts,
        vec![Const::Enum(vec!["A".into(), "B".into(), "C".into()])]
    );
    assert_eq!(chunk.ops[0], Op::LoadK { dst: 0, k: 0 });
}

#[test]
fn group_fields_compile_to_register_moves() {
    let chunk = compile(
        "local g <group> = { x = 1, y = 2 }\n\
         local z = g.x\n\
         g = { y = 5 }\n\
         g.x = 7",
    );
    // g.x and g.y live in registers 0 and 1; z copies directly from 0,
    // and both overwrite forms are plain moves.
    assert!(chunk.ops.contains(&Op::Move { dst: 2, src: 0 }), "read");
    assert!(chunk.ops.contains(&Op::Move { dst: 1, src: 3 }), "ctor overwrite");
    assert!(chunk.ops.contains(&Op::Move { dst: 0, src: 3 }), "field write");
    // No table is ever constructed for a group.
    assert!(!chunk.ops.iter().any(|op| matches!(op, Op::NewTable { .. })));
}

#[test]
fn group_misuse_is_rejected_at_parse_time() {
    let err = compile_err("local g <group> = { x = 1 }\ng = { y = 2 }");
    assert!(err.message.contains("not part of the group"), "{err}");

    let err = compile_err("local g <group> = { x = 1 }\nlocal z = g");
    assert!(err.message.contains("field"), "{err}");

    let err = compile_err("local g <group> = { x = 1 }\ng = 1");
    assert!(err.message.contains("constructor"), "{err}");
}

#[test]
fn assignment_condition_scopes_variable_over_branches() {
    let chunk = compile("if x = f() then return x end");
    assert_eq!(
        chunk.ops,
        vec![
            Op::GetGlobal { dst: 0, name: 0 },
            Op::Call {
                base: 0,
                nargs: 0,
                nresults: 1
            },
            Op::TestJump {
                src: 0,
                if_true: false,
                to: 5
            },
            Op::Move { dst: 1, src: 0 },
            Op::Return { base: 1, n: 1 },
            Op::Return { base: 0, n: 0 },
        ]
    );

    // The declared variable is also visible in the else branch.
    compile("if x = f() then return x else return x end");
}

#[test]
fn assignment_condition_is_distinguished_by_lookahead() {
    // `==` is an ordinary comparison, not a declaration.
    let chunk = compile("if x == 1 then return end");
    assert!(chunk.ops.iter().any(|op| matches!(op, Op::Arith { .. })));
}

#[test]
fn multi_value_calls_widen_on_demand() {
    let chunk = compile("local a, b = f()");
    assert!(chunk.ops.contains(&Op::Call {
        base: 0,
        nargs: 0,
        nresults: 2
    }));

    let chunk = compile("return f()");
    assert!(chunk.ops.contains(&Op::Call {
        base: 0,
        nargs: 0,
        nresults: MULTI
    }));
    assert!(chunk.ops.contains(&Op::Return { base: 0, n: MULTI }));
}

#[test]
fn method_call_preps_self() {
    let chunk = compile("obj:poke(1)");
    assert!(chunk
        .ops
        .iter()
        .any(|op| matches!(op, Op::SelfField { base: 0, obj: 0, .. })));
    // Statement position discards the results.
    assert!(chunk.ops.contains(&Op::Call {
        base: 0,
        nargs: 2,
        nresults: 0
    }));
}

#[test]
fn const_assignment_is_a_compile_error() {
    let err = compile_err("local x <const> = 1\nx = 2");
    assert!(err.message.contains("const"), "{err}");
}

#[test]
fn unknown_attribute_is_a_compile_error() {
    let err = compile_err("local x <frozen> = 1");
    assert!(err.message.contains("unknown attribute"), "{err}");
}

#[test]
fn duplicate_label_is_a_compile_error() {
    let err = compile_err("::top::\n::top::");
    assert!(err.message.contains("already defined"), "{err}");
}

#[test]
fn goto_into_local_scope_is_a_compile_error() {
    let err = compile_err("goto skip\nlocal x = 1\n::skip::\nreturn x");
    assert!(err.message.contains("scope"), "{err}");
}

#[test]
fn break_outside_loop_is_a_compile_error() {
    let err = compile_err("break");
    assert!(err.message.contains("break"), "{err}");
}

#[test]
fn vararg_outside_vararg_function_is_a_compile_error() {
    let err = compile_err("local function f() local x = ... end");
    assert!(err.message.contains("..."), "{err}");
}

#[test]
fn upvalues_chain_through_nested_functions() {
    let chunk = compile(
        "local v = 1\n\
         local function outer()\n\
           local function inner() return v end\n\
           return inner\n\
         end",
    );
    let outer = &chunk.protos[0];
    assert_eq!(outer.upvals.len(), 1);
    assert!(outer.upvals[0].from_parent_reg);
    let inner = &outer.protos[0];
    assert_eq!(inner.upvals.len(), 1);
    assert!(!inner.upvals[0].from_parent_reg);
}

#[test]
fn error_positions_are_one_line_synopses() {
    let err = compile_err("local x =\n= 2");
    assert_eq!(err.line, 2);
    assert!(err.to_string().starts_with("test:2:"), "{err}");
}

#[test]
fn recover_mode_accumulates_errors_and_builds_a_partial_tree() {
    let arena = arena::Arena::new();
    let options = Options {
        recover: true,
        ..Options::default()
    };
    let parsed = parse(
        "local a = 1\nlocal = 2\nlocal b = 3\n",
        "test",
        &arena,
        &options,
    )
    .expect("recover mode returns a tree");
    let ast = parsed.ast.unwrap();
    assert_eq!(ast.errors.len(), 1);
    assert_eq!(ast.errors[0].line, 2);

    let NodeKind::Chunk { body } = ast.root.kind else {
        panic!("root is not a chunk");
    };
    assert!(body
        .iter()
        .any(|n| matches!(n.kind, NodeKind::ErrorStat { .. })));
    // The statements around the error both survive.
    let locals = body
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Local { .. }))
        .count();
    assert_eq!(locals, 2);
}

#[test]
fn formatter_metadata_is_preserved() {
    let arena = arena::Arena::new();
    let parsed = parse(
        "local s = 'single'\nlocal p = (f())\n",
        "test",
        &arena,
        &Options::default(),
    )
    .unwrap();
    let ast = parsed.ast.unwrap();

    let mut saw_quote = false;
    let mut saw_paren = false;
    ast.walk(&mut |node| {
        if let NodeKind::Str { quote, .. } = node.kind {
            saw_quote |= quote == Some(Quote::Single);
        }
        if node.paren {
            saw_paren = true;
        }
    });
    assert!(saw_quote, "string quote metadata lost");
    assert!(saw_paren, "paren metadata lost");
}

#[test]
fn comments_ride_the_ast_container() {
    let arena = arena::Arena::new();
    let parsed = parse(
        "-- leading\nlocal x = 1 --[[inline]]\n",
        "test",
        &arena,
        &Options::default(),
    )
    .unwrap();
    let ast = parsed.ast.unwrap();
    assert_eq!(ast.comments.len(), 2);
    assert_eq!(ast.comments[0].text, " leading");
    assert!(ast.comments[1].islong);
}

#[test]
fn provide_terminates_the_chunk_like_return() {
    let chunk = compile("provide 42");
    assert_eq!(
        chunk.ops,
        vec![
            Op::LoadK { dst: 0, k: 0 },
            Op::Return { base: 0, n: 1 },
            Op::Return { base: 0, n: 0 },
        ]
    );
}
