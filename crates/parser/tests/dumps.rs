//! The AST dump formats, driven through a real parse.

use parser::{parse, Options};

fn with_ast<R>(source: &str, f: impl FnOnce(&ast::Ast) -> R) -> R {
    let arena = arena::Arena::new();
    let parsed = parse(source, "test", &arena, &Options::default()).expect("source parses");
    f(&parsed.ast.expect("ast requested"))
}

#[test]
fn dot_renders_labeled_nodes_and_role_edges() {
    let dot = with_ast("if ok then f(1 + 2) end", |ast| ast::to_dot(ast));

    assert!(dot.starts_with("digraph ast {"));
    assert!(dot.trim_end().ends_with('}'));
    assert!(dot.contains("[label=\"chunk\"]"), "{dot}");
    assert!(dot.contains("[label=\"name ok\"]"), "{dot}");
    assert!(dot.contains("[label=\"binop +\"]"), "{dot}");
    assert!(dot.contains("[label=\"cond\"]"), "{dot}");
    assert!(dot.contains("[label=\"then\"]"), "{dot}");
    assert!(dot.contains("[label=\"L\"]"), "{dot}");
    assert!(dot.contains("[label=\"R\"]"), "{dot}");
}

#[test]
fn dot_escapes_string_payloads() {
    let dot = with_ast(r#"local s = "say \"hi\"""#, |ast| ast::to_dot(ast));
    // The quoted value is escaped into the DOT label.
    assert!(dot.contains(r#"string \"say \\\"hi\\\"\""#), "{dot}");
}

#[test]
fn json_nodes_carry_type_line_and_keyed_children() {
    let json = with_ast("local a = 1 + x\nreturn a\n", |ast| ast::to_json(ast));

    assert_eq!(json["type"], "chunk");
    assert_eq!(json["line"], 1);
    let children = json["children"].as_array().expect("chunk children");
    assert_eq!(children.len(), 2);

    let local = &children[0];
    assert_eq!(local["type"], "local");
    assert_eq!(local["names"][0]["name"], "a");
    let sum = &local["values"][0];
    assert_eq!(sum["type"], "binop");
    assert_eq!(sum["op"], "+");
    assert_eq!(sum["left"]["value"], 1);
    assert_eq!(sum["right"]["name"], "x");

    let ret = &children[1];
    assert_eq!(ret["type"], "return");
    assert_eq!(ret["line"], 2);
}

#[test]
fn json_escapes_control_characters() {
    let json = with_ast("local s = \"a\\x01b\"", |ast| ast::to_json(ast));
    let text = serde_json::to_string(&json).unwrap();
    assert!(text.contains("a\\u0001b"), "{text}");
}

#[test]
fn json_marks_parenthesized_and_block_spans() {
    let json = with_ast("local x = (1 + 2)\nwhile go do\n  step()\nend\n", |ast| {
        ast::to_json(ast)
    });
    let children = json["children"].as_array().unwrap();
    assert_eq!(children[0]["values"][0]["paren"], true);
    assert_eq!(children[1]["type"], "while");
    assert_eq!(children[1]["line"], 2);
    assert_eq!(children[1]["endline"], 4);
}
