//! A Jinja-style template engine.
//!
//! Source text goes through a lexer, a recursive-descent parser, a scope resolver, an optional
//! constant folder and a code generator producing flat instruction lists, which an interpreter
//! executes against a render context.
//!
//! ```rust
//! use jinjate::{Context, Environment};
//!
//! let mut env = Environment::new();
//! env.add_template("greet.html", "{% macro greet(n) %}Hi {{ n }}{% endmacro %}{{ greet(who) }}")
//!     .unwrap();
//!
//! let mut context = Context::new();
//! context.insert("who", "Bob");
//! let output = env.get_template("greet.html").unwrap().render(&context).unwrap();
//! assert_eq!(output, "Hi Bob");
//! ```

pub mod ast;
pub mod bccache;
mod cache;
mod compiler;
mod environment;
mod error;
pub mod ext;
mod filters;
mod functions;
mod idtracking;
pub mod instructions;
mod interface;
pub mod lexer;
pub mod loader;
mod optimizer;
mod output;
pub mod parser;
mod runtime;
mod sandbox;
mod template;
mod tests;
mod value;
mod vm;

// Crate-level imports to make convienent imports for the rest of the library.
pub(crate) use error::JinjateResult;

// Public exports.
pub use bccache::{Bucket, BytecodeCache, MemoryBytecodeCache};
pub use cache::LruCache;
pub use environment::{AutoEscape, Environment, Syntax, select_autoescape};
pub use error::{Error, ErrorKind, TraceFrame};
pub use ext::Extension;
pub use filters::Filter;
pub use functions::{Args, Function, State};
pub use instructions::CompiledTemplate;
pub use interface::{Context, TemplateEngine};
pub use lexer::LexerCache;
pub use loader::{ChoiceLoader, FunctionLoader, Loader, MapLoader, PrefixLoader, TemplateSource};
pub use sandbox::{DefaultSandbox, SandboxPolicy};
pub use template::{Template, TemplateModule};
pub use tests::Test;
pub use value::{BinOpKind, CmpOp, Key, Kwargs, Undefined, UndefinedBehavior, Value, escape};
