//! Canonical source formatter: a depth-first walk over the AST that
//! reproduces the program with normalized spacing, interleaving the
//! comment list back into the output and preserving the vertical gaps the
//! author left between statements.

mod render;

use arena::Arena;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] parser::Error),
}

#[derive(Debug, Clone)]
pub struct Options {
    pub indent_width: usize,
    pub max_line_width: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            indent_width: 2,
            max_line_width: 100,
        }
    }
}

/// Format `source`, returning the canonical text. The output always ends
/// with exactly one newline (or is empty for empty input).
pub fn format(source: &str, chunk_name: &str, options: &Options) -> Result<String, Error> {
    let arena = Arena::new();
    let parsed = parser::parse(
        source,
        chunk_name,
        &arena,
        &parser::Options {
            capture_ast: true,
            include_comments: true,
            recover: false,
        },
    )?;
    let ast = parsed.ast.expect("capture_ast was requested");
    tracing::debug!(
        chunk = chunk_name,
        nodes = ast.node_count,
        comments = ast.comments.len(),
        "formatting chunk"
    );
    Ok(render::render(&ast, options))
}

#[cfg(test)]
mod test {
    use super::*;

    fn fmt(source: &str) -> String {
        format(source, "test", &Options::default()).expect("source should format")
    }

    /// Formatting must be stable: formatting its own output changes
    /// nothing.
    fn assert_stable(source: &str) -> String {
        let once = fmt(source);
        let twice = fmt(&once);
        assert_eq!(once, twice, "formatter is not idempotent for {source:?}");
        once
    }

    #[test]
    fn empty_input_formats_to_nothing() {
        assert_eq!(fmt(""), "");
    }

    #[test]
    fn nested_ifs_normalize_spacing() {
        let out = assert_stable("if x~=nil then if x.y~=nil then f(x.y) end end");
        assert_eq!(
            out,
            "if x ~= nil then\n  if x.y ~= nil then\n    f(x.y)\n  end\nend\n"
        );
    }

    #[test]
    fn comments_and_blank_lines_survive() {
        let source = "-- header\nlocal a = 1\n\n-- about b\nlocal b = 2\n";
        let out = assert_stable(source);
        assert_eq!(
            out,
            "-- header\nlocal a = 1\n\n-- about b\nlocal b = 2\n"
        );
    }

    #[test]
    fn long_comments_keep_their_form() {
        let out = assert_stable("--[[multi\nline]]\nlocal a = 1\n");
        assert_eq!(out, "--[[multi\nline]]\nlocal a = 1\n");
    }

    #[test]
    fn string_quotes_are_preserved() {
        let out = assert_stable("local a = 'single'\nlocal b = \"double\"\n");
        assert_eq!(out, "local a = 'single'\nlocal b = \"double\"\n");
    }

    #[test]
    fn nonprintable_characters_escape_as_hex() {
        let out = fmt("local s = \"a\\x01b\"");
        assert_eq!(out, "local s = \"a\\x01b\"\n");
    }

    #[test]
    fn precedence_forces_parentheses_only_where_needed() {
        assert_eq!(fmt("local x = (a + b) * c"), "local x = (a + b) * c\n");
        assert_eq!(fmt("local x = a + b * c"), "local x = a + b * c\n");
        assert_eq!(fmt("local x = a - (b - c)"), "local x = a - (b - c)\n");
        assert_eq!(fmt("local x = (a .. b) .. c"), "local x = (a .. b) .. c\n");
        assert_eq!(fmt("local x = a .. b .. c"), "local x = a .. b .. c\n");
    }

    #[test]
    fn adjacent_unary_minus_keeps_a_space() {
        let out = fmt("local x = - -a");
        assert_eq!(out, "local x = - -a\n");
        assert_stable("local x = - -a");
    }

    #[test]
    fn small_tables_are_one_line_large_tables_break() {
        assert_eq!(
            fmt("local t = {a = 1, b = 2}"),
            "local t = { a = 1, b = 2 }\n"
        );
        let out = assert_stable("local t = {a = 1, b = 2, c = 3, d = 4}");
        assert_eq!(
            out,
            "local t = {\n  a = 1,\n  b = 2,\n  c = 3,\n  d = 4,\n}\n"
        );
    }

    #[test]
    fn expression_keys_render_bracketed() {
        let out = assert_stable("local t = {[1 + 1] = true, ok = false}");
        assert_eq!(out, "local t = { [1 + 1] = true, ok = false }\n");
    }

    #[test]
    fn interpolation_reconstructs_holes() {
        let out = assert_stable("local s = `a $x b $(1 + 2) c`");
        assert_eq!(out, "local s = `a $x b $(1 + 2) c`\n");
    }

    #[test]
    fn interpolation_escapes_specials() {
        let out = assert_stable("local s = `price: \\$5 \\` tick`");
        assert_eq!(out, "local s = `price: \\$5 \\` tick`\n");
    }

    #[test]
    fn optional_chains_and_slices_round_trip() {
        assert_eq!(fmt("local r = a?.b?.c"), "local r = a?.b?.c\n");
        assert_eq!(fmt("local s = t[1, n]"), "local s = t[1, n]\n");
        assert_eq!(fmt("local s = t[,]"), "local s = t[,]\n");
        assert_eq!(fmt("local s = t[, n]"), "local s = t[, n]\n");
        assert_eq!(fmt("local s = t[1,]"), "local s = t[1,]\n");
    }

    #[test]
    fn from_and_groups_round_trip() {
        assert_eq!(fmt("local a, b from t"), "local a, b from t\n");
        let out = assert_stable("local g <group> = {x = 1, y = 2}");
        assert_eq!(out, "local g <group> = { x = 1, y = 2 }\n");
    }

    #[test]
    fn catch_forms_round_trip() {
        assert_eq!(fmt("local ok = catch f()"), "local ok = catch f()\n");
        assert_eq!(
            fmt("local ok, v = catch[h] f()"),
            "local ok, v = catch[h] f()\n"
        );
    }

    #[test]
    fn enums_and_assignment_conditions_round_trip() {
        assert_eq!(fmt("local e = enum A, B end"), "local e = enum A, B end\n");
        let out = assert_stable("if x = f() then return x end");
        assert_eq!(out, "if x = f() then\n  return x\nend\n");
    }

    #[test]
    fn functions_keep_method_colon_and_varargs() {
        let out = assert_stable("function obj.sub:go(a, ...) return a end");
        assert_eq!(
            out,
            "function obj.sub:go(a, ...)\n  return a\nend\n"
        );
    }

    #[test]
    fn numbers_keep_their_type() {
        let out = fmt("local a, b = 3, 3.0");
        assert_eq!(out, "local a, b = 3, 3.0\n");
        assert_stable("local a, b = 3, 3.0");
    }

    #[test]
    fn control_flow_round_trips() {
        let source = "\
while x do\n  x = x - 1\nend\n\nrepeat\n  tick()\nuntil done\n\nfor i = 1, 10, 2 do\n  go(i)\nend\n\nfor k, v in pairs(t) do\n  use(k, v)\nend\n";
        assert_eq!(assert_stable(source), source);
    }

    #[test]
    fn goto_labels_and_do_blocks_round_trip() {
        let source = "::top::\ndo\n  work()\nend\ngoto top\n";
        assert_eq!(assert_stable(source), source);
    }

    #[test]
    fn formatting_output_always_reparses() {
        // The formatter's output must itself be valid input.
        let sources = [
            "local a = {1, 2, 'x', [k] = v}",
            "if a then b() elseif c then d() else e() end",
            "local f = function(x <const>) return x end",
            "provide setup",
            "x, y.z = f(), g()",
        ];
        for source in sources {
            assert_stable(source);
        }
    }
}
