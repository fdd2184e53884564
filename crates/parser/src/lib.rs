//! The Lus front end: a single-pass recursive-descent parser that drives
//! the lexer, emits register-based bytecode, and attaches a side AST for
//! the formatter, linter, and dump tooling.
//!
//! The executing VM is an external collaborator. Its seam is the `Chunk`
//! prototype this crate produces; everything through that boundary is
//! plain data.

mod emit;
mod expr;
mod lexer;
mod state;
mod stmt;
mod token;

pub use emit::{Chunk, Const, Op, UpvalDesc, MULTI, NO_REG, NO_TARGET};
pub use lexer::{Lexer, Spanned};
pub use token::Token;

use arena::Arena;
use ast::Ast;

/// A parse failure, carrying the source position the parser was at.
/// Displays as the conventional one-line `chunk:line:col: message` synopsis.
#[derive(Debug, thiserror::Error)]
#[error("{chunk}:{line}:{col}: {message}")]
pub struct Error {
    pub chunk: String,
    pub line: u32,
    pub col: u32,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Return the side AST alongside the compiled chunk.
    pub capture_ast: bool,
    /// Record comments on the AST container (the formatter needs them).
    pub include_comments: bool,
    /// Accumulate syntax errors on the AST and produce a partial tree
    /// instead of failing on the first error. The compiled chunk of a
    /// recovered parse is not runnable and is discarded by callers.
    pub recover: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            capture_ast: true,
            include_comments: true,
            recover: false,
        }
    }
}

/// The outputs of one parse.
pub struct Parsed<'a> {
    pub chunk: Chunk,
    pub ast: Option<Ast<'a>>,
}

/// Parse `source`, compiling bytecode and (optionally) building the AST
/// into `arena`.
pub fn parse<'a>(
    source: &str,
    chunk_name: &str,
    arena: &'a Arena,
    options: &Options,
) -> Result<Parsed<'a>, Error> {
    tracing::debug!(
        chunk = chunk_name,
        bytes = source.len(),
        recover = options.recover,
        "parsing chunk"
    );
    stmt::Parser::run(source, chunk_name, arena, options)
}
