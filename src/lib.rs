//! Template-filling query core.
//!
//! A caller sends an [`Envelope`] whose `response` is a JSON skeleton of the
//! answer it wants. The core turns that skeleton into one read-only
//! PostgreSQL SELECT, screens it, runs it, and folds the rows back into the
//! skeleton. Failures never surface: a degraded request answers with the
//! skeleton's own defaults.

pub mod ast;
pub mod config;
pub mod db;
pub mod digest;
pub mod envelope;
pub mod error;
pub mod guard;
pub mod handlers;
pub mod mapper;
pub mod pagination;
pub mod pipeline;
pub mod rules;
pub mod synth;
pub mod template;

pub use envelope::{Envelope, RequestKind};
pub use error::{Diagnostic, Failure};
pub use guard::SafetyGate;
pub use pipeline::{FillService, Limits};
pub use rules::RuleTable;
pub use template::Template;
