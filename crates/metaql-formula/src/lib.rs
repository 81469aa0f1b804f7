//! metaql formula language
//!
//! A small, side-effect-free expression language for computed fields and
//! boolean business rules. Source text is lexed, parsed into a typed AST and
//! evaluated by a tree-walking interpreter with a fixed function whitelist;
//! nothing in a formula can reach the host process.
//!
//! # Syntax
//!
//! ```text
//! quantity * unit_price
//! first_name + ' ' + last_name
//! status == 'won' ? amount : 0
//! (discount ?? 0) * 2
//! dateDiff(start_date, end_date, 'days')
//! account.owner.name
//! $current_user.email
//! ```
//!
//! # Usage
//!
//! ```rust
//! use metaql_formula::{FormulaContext, FormulaEngine, FormulaType};
//! use serde_json::json;
//!
//! let engine = FormulaEngine::new();
//! let record = json!({"quantity": 10, "unit_price": 25.5});
//! let ctx = FormulaContext::new(&record);
//!
//! let total = engine
//!     .evaluate("quantity * unit_price", &ctx, FormulaType::Currency)
//!     .unwrap();
//! assert_eq!(total.as_f64(), Some(255.0));
//!
//! let meta = engine
//!     .extract_metadata("total", "quantity * unit_price", FormulaType::Currency)
//!     .unwrap();
//! assert!(meta.dependencies.contains("quantity"));
//! ```

pub mod ast;
pub mod builtins;
pub mod engine;
pub mod error;
pub mod interpreter;
pub mod lexer;
pub mod metadata;
pub mod parser;
pub mod span;
pub mod value;

pub use ast::{Expr, ExprKind};
pub use builtins::{is_builtin, BUILTIN_FUNCTIONS};
pub use engine::{FormulaEngine, FormulaType};
pub use error::{FormulaError, FormulaErrorKind, ParseError};
pub use interpreter::{CustomFunction, FieldSource, FormulaContext, SYSTEM_VARIABLES};
pub use metadata::{Complexity, FormulaMetadata};
pub use parser::{is_blocked_identifier, BLOCKED_IDENTIFIERS};
pub use span::Span;
pub use value::Value;

/// Parse a formula into an AST without evaluating it.
///
/// # Example
///
/// ```rust
/// use metaql_formula::parse;
///
/// assert!(parse("a + b * 2").is_ok());
/// assert!(parse("eval('x')").unwrap_err().is_blocked());
/// ```
pub fn parse(source: &str) -> Result<Expr, FormulaError> {
    parser::parse(source)
}
