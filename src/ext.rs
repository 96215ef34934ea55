//! Pluggable extensions: source preprocessing, token stream filtering and custom tags.

use crate::{
    ast::{Stmt, StmtKind},
    error::JinjateResult,
    lexer::TokenIter,
    parser::Parser,
};

/// A component registered with the environment that extends the template language.
///
/// Every hook has a pass-through default, so an extension only implements what it changes.
/// Extensions run in ascending [`Extension::priority`] order.
pub trait Extension: Send + Sync {
    /// A unique identifier, used to replace an extension registered under the same name.
    fn name(&self) -> &str;

    /// Tag names this extension parses.
    fn tags(&self) -> &[&'static str] {
        &[]
    }

    fn priority(&self) -> i32 {
        100
    }

    /// Rewrites the raw source before lexing.
    fn preprocess(&self, source: String, _name: Option<&str>, _filename: Option<&str>) -> String {
        source
    }

    /// Transforms the token stream before parsing.
    fn filter_stream(&self, stream: TokenIter) -> TokenIter {
        stream
    }

    /// Called with the tag name as the current token. Returns the nodes spliced into the tree.
    fn parse(&self, parser: &mut Parser<'_>) -> JinjateResult<Vec<Stmt>> {
        let lineno = parser.stream().current().lineno;
        Err(parser.fail(
            format!("extension '{}' does not parse any tags", self.name()),
            lineno,
        ))
    }
}

/// Adds `{% break %}` and `{% continue %}` inside loops.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopControls;

impl Extension for LoopControls {
    fn name(&self) -> &str {
        "loopcontrols"
    }

    fn tags(&self) -> &[&'static str] {
        &["break", "continue"]
    }

    fn parse(&self, parser: &mut Parser<'_>) -> JinjateResult<Vec<Stmt>> {
        let token = parser.stream().advance()?;
        let kind = if token.is_name("break") {
            StmtKind::Break
        } else {
            StmtKind::Continue
        };
        Ok(vec![Stmt::new(kind, token.lineno)])
    }
}

/// Adds `{% do expr %}`, which evaluates an expression and discards the result.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExprStmt;

impl Extension for ExprStmt {
    fn name(&self) -> &str {
        "do"
    }

    fn tags(&self) -> &[&'static str] {
        &["do"]
    }

    fn parse(&self, parser: &mut Parser<'_>) -> JinjateResult<Vec<Stmt>> {
        let lineno = parser.stream().advance()?.lineno;
        let node = parser.parse_tuple(false, true, &[], false)?;
        Ok(vec![Stmt::new(StmtKind::ExprStmt(node), lineno)])
    }
}
