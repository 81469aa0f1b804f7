//! Static analysis of formula expressions.
//!
//! Nothing here evaluates the expression: dependencies are read off the
//! AST, so analysis is safe on formulas that would fail at runtime.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ast::{Expr, ExprKind};
use crate::engine::FormulaType;
use crate::error::FormulaError;
use crate::interpreter::SYSTEM_VARIABLES;

/// Coarse cost classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    /// Classify a complexity score.
    ///
    /// Operators score 1, calls 2, conditionals and lookup chains 3.
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=2 => Complexity::Simple,
            3..=8 => Complexity::Medium,
            _ => Complexity::Complex,
        }
    }
}

/// What a formula reads, without running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaMetadata {
    /// The formula field this describes.
    pub field: String,
    pub target: FormulaType,
    /// Top-level record fields read.
    pub dependencies: BTreeSet<String>,
    /// System variables referenced, without the `$`.
    pub system_variables: BTreeSet<String>,
    /// Dotted paths through lookups, e.g. `account.owner.name`.
    pub lookup_chains: BTreeSet<String>,
    /// Functions called, after `Math.` aliasing.
    pub functions: BTreeSet<String>,
    pub score: u32,
    pub complexity: Complexity,
}

impl FormulaMetadata {
    /// Whether the formula reaches into another object.
    pub fn has_lookups(&self) -> bool {
        !self.lookup_chains.is_empty()
    }
}

/// Analyze an already-parsed expression.
///
/// Fails only on references that can never resolve, i.e. unknown system
/// variables.
pub fn extract_metadata(
    field: impl Into<String>,
    expr: &Expr,
    target: FormulaType,
) -> Result<FormulaMetadata, FormulaError> {
    let mut metadata = FormulaMetadata {
        field: field.into(),
        target,
        dependencies: BTreeSet::new(),
        system_variables: BTreeSet::new(),
        lookup_chains: BTreeSet::new(),
        functions: BTreeSet::new(),
        score: 0,
        complexity: Complexity::Simple,
    };
    let mut unknown = None;

    expr.walk(&mut |node| match &node.kind {
        ExprKind::Field(path) => {
            if let Some(first) = path.first() {
                metadata.dependencies.insert(first.clone());
            }
            if path.len() > 1 && metadata.lookup_chains.insert(path.join(".")) {
                metadata.score += 3;
            }
        }
        ExprKind::System { name, .. } => {
            if SYSTEM_VARIABLES.contains(&name.as_str()) {
                metadata.system_variables.insert(name.clone());
            } else if unknown.is_none() {
                unknown = Some(name.clone());
            }
        }
        ExprKind::Unary { .. } | ExprKind::Binary { .. } | ExprKind::Logical { .. } => {
            metadata.score += 1;
        }
        ExprKind::Conditional { .. } => metadata.score += 3,
        ExprKind::Call { function, .. } => {
            metadata.score += if function == "if" { 3 } else { 2 };
            metadata.functions.insert(function.clone());
        }
        ExprKind::Number(_) | ExprKind::Text(_) | ExprKind::Bool(_) | ExprKind::Null => {}
    });

    if let Some(name) = unknown {
        return Err(FormulaError::UnknownVariable(name));
    }
    metadata.complexity = Complexity::from_score(metadata.score);
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use pretty_assertions::assert_eq;

    fn analyze(source: &str) -> FormulaMetadata {
        extract_metadata("f", &parse(source).unwrap(), FormulaType::Number).unwrap()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_simple_product() {
        let meta = analyze("quantity * unit_price");
        assert_eq!(meta.dependencies, set(&["quantity", "unit_price"]));
        assert_eq!(meta.complexity, Complexity::Simple);
        assert!(!meta.has_lookups());
    }

    #[test]
    fn test_lookup_chains_and_variables() {
        let meta = analyze("account.owner.name + ' ' + $current_user.name + $today");
        assert_eq!(meta.dependencies, set(&["account"]));
        assert_eq!(meta.lookup_chains, set(&["account.owner.name"]));
        assert_eq!(meta.system_variables, set(&["current_user", "today"]));
    }

    #[test]
    fn test_complexity_levels() {
        assert_eq!(analyze("round(a * b, 2)").complexity, Complexity::Medium);
        assert_eq!(
            analyze("if(status == 'won', amount * probability / 100, a.b.c > 0 ? max(x, y) : 0)").complexity,
            Complexity::Complex
        );
    }

    #[test]
    fn test_functions_are_recorded_with_alias() {
        let meta = analyze("Math.max(a, b) + upper(c)");
        assert_eq!(meta.functions, set(&["max", "upper"]));
    }

    #[test]
    fn test_unknown_system_variable_rejected() {
        let err = extract_metadata("f", &parse("$env.HOME").unwrap(), FormulaType::Text).unwrap_err();
        assert_eq!(err, FormulaError::UnknownVariable("env".into()));
    }
}
