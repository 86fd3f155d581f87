//! Template evaluation.
//!
//! Templates embed `${{ expression }}` spans. Expressions are evaluated by a
//! pluggable [`ExpressionLanguage`]; the default is Jinja via minijinja.

mod engine;
mod expression;
mod filters;

pub use engine::{TemplateEngine, QUOTE_FN};
pub use expression::{ExprFn, ExpressionLanguage, Functions, Jinja};
