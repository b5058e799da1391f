/// SQL AST for synthesized statements.
///
/// ```text
/// Template + payload
///       ↓
/// Synthesizer             (synth/)
///       ↓
/// SelectQuery AST         (types.rs)
///       ↓
/// SQL Compiler            (compiler.rs)
///       ↓
/// Safety gate → execution (guard.rs, db/)
/// ```
pub mod compiler;
pub mod types;

pub use compiler::{compile, quote_ident};
pub use types::*;
