//! Embedded SQL expression engine.
//!
//! Computed attributes and attribute filters are SQL expressions over
//! bracketed references (`[name]`). Registration rewrites each
//! unescaped reference into a positional placeholder and resolves the
//! name against the layer's catalog: a declared field binds by index,
//! anything else binds as a raw tag key at evaluation time. The
//! rewritten SQL runs on one shared in-memory SQLite connection with
//! statement caching, so each expression is prepared once.

use rusqlite::types::Value;
use rusqlite::Connection;
use thiserror::Error;

use crate::fields::FieldCatalog;

/// Where a placeholder takes its value from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// A declared field, bound by catalog index and coerced to the
    /// field's type.
    Field(usize),
    /// A raw tag key, bound as text when the record carries it.
    Tag(String),
}

/// A rewritten expression with its resolved placeholder sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedExpression {
    /// Expression text with `[name]` references replaced by `?`.
    pub sql: String,
    /// One binding per placeholder, in placeholder order.
    pub bindings: Vec<Binding>,
}

/// Errors raised by the expression engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExpressionError {
    /// The in-memory engine database could not be opened.
    #[error("cannot open in-memory expression database")]
    Open {
        /// Underlying engine error.
        #[source]
        source: rusqlite::Error,
    },
    /// The rewritten expression failed to prepare.
    #[error("expression failed to prepare")]
    Prepare {
        /// Underlying engine error.
        #[source]
        source: rusqlite::Error,
    },
    /// Binding or stepping the prepared expression failed.
    #[error("expression evaluation failed")]
    Evaluate {
        /// Underlying engine error.
        #[source]
        source: rusqlite::Error,
    },
}

/// Shared prepared-expression evaluator for one source.
#[derive(Debug)]
pub struct ExpressionEngine {
    conn: Connection,
}

impl ExpressionEngine {
    /// Open the backing in-memory database.
    pub fn new() -> Result<Self, ExpressionError> {
        Connection::open_in_memory()
            .map(|conn| Self { conn })
            .map_err(|source| ExpressionError::Open { source })
    }

    /// Prepare `sql` once to surface syntax errors at configuration
    /// time.
    pub(crate) fn validate(&self, sql: &str) -> Result<(), ExpressionError> {
        self.conn
            .prepare(sql)
            .map(|_| ())
            .map_err(|source| ExpressionError::Prepare { source })
    }

    /// Run `sql` with `params` bound positionally and return the first
    /// column of the first row. Expressions that do not produce exactly
    /// one column, or produce no row, yield `None`.
    pub(crate) fn query_single(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<Value>, ExpressionError> {
        let mut statement = self
            .conn
            .prepare_cached(sql)
            .map_err(|source| ExpressionError::Prepare { source })?;
        if statement.column_count() != 1 {
            return Ok(None);
        }
        let mut rows = statement
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(|source| ExpressionError::Evaluate { source })?;
        let row = rows
            .next()
            .map_err(|source| ExpressionError::Evaluate { source })?;
        match row {
            Some(row) => {
                let value = row
                    .get_ref(0)
                    .map_err(|source| ExpressionError::Evaluate { source })?;
                Ok(Some(Value::from(value)))
            }
            None => Ok(None),
        }
    }
}

/// Rewrite bracketed references into placeholders and resolve each name
/// against `catalog`.
///
/// A reference is `[name]` not preceded by a backslash; the name runs to
/// the first `]`. An unterminated bracket stops the scan and the tail is
/// kept verbatim. After rewriting, backslash escapes are stripped (a
/// lone trailing backslash survives). A backslash immediately before a
/// literal bracket therefore escapes the bracket; escaping a backslash
/// itself is not expressible. Known ambiguity of this syntax, kept
/// as-is.
pub fn parse_references(expression: &str, catalog: &FieldCatalog) -> ParsedExpression {
    let mut rewritten = String::with_capacity(expression.len());
    let mut names: Vec<String> = Vec::new();
    let mut chars = expression.chars();
    let mut prev_backslash = false;
    while let Some(ch) = chars.next() {
        if ch == '[' && !prev_backslash {
            let mut name = String::new();
            let mut closed = false;
            for inner in chars.by_ref() {
                if inner == ']' {
                    closed = true;
                    break;
                }
                name.push(inner);
            }
            if closed {
                rewritten.push('?');
                names.push(name);
                prev_backslash = false;
                continue;
            }
            rewritten.push('[');
            rewritten.push_str(&name);
            break;
        }
        prev_backslash = ch == '\\';
        rewritten.push(ch);
    }

    let keep_trailing = rewritten.ends_with('\\');
    let mut sql: String = rewritten.chars().filter(|&ch| ch != '\\').collect();
    if keep_trailing {
        sql.push('\\');
    }

    let bindings = names
        .into_iter()
        .map(|name| match catalog.find_field(&name) {
            Some(index) => Binding::Field(index),
            None => Binding::Tag(name),
        })
        .collect();
    ParsedExpression { sql, bindings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldSubtype, FieldType};
    use rstest::{fixture, rstest};

    #[fixture]
    fn catalog() -> FieldCatalog {
        let mut catalog = FieldCatalog::new(false);
        catalog.add_field("foo", FieldType::Integer, FieldSubtype::None);
        catalog
    }

    #[rstest]
    fn resolves_fields_and_tags(catalog: FieldCatalog) {
        let parsed = parse_references("SELECT [foo] + [bar]", &catalog);
        assert_eq!(parsed.sql, "SELECT ? + ?");
        assert_eq!(
            parsed.bindings,
            vec![Binding::Field(0), Binding::Tag("bar".into())]
        );
    }

    #[rstest]
    fn escaped_brackets_stay_literal(catalog: FieldCatalog) {
        let parsed = parse_references("SELECT '\\[foo]' , [foo]", &catalog);
        assert_eq!(parsed.sql, "SELECT '[foo]' , ?");
        assert_eq!(parsed.bindings, vec![Binding::Field(0)]);
    }

    #[rstest]
    fn unterminated_bracket_keeps_tail(catalog: FieldCatalog) {
        let parsed = parse_references("SELECT [foo] + [bar", &catalog);
        assert_eq!(parsed.sql, "SELECT ? + [bar");
        assert_eq!(parsed.bindings, vec![Binding::Field(0)]);
    }

    #[rstest]
    fn trailing_backslash_survives(catalog: FieldCatalog) {
        let parsed = parse_references("SELECT 1 \\", &catalog);
        assert_eq!(parsed.sql, "SELECT 1 \\");
    }

    #[rstest]
    fn evaluates_bound_placeholders() {
        let engine = ExpressionEngine::new().expect("in-memory engine");
        let value = engine
            .query_single("SELECT ? + ?", &[Value::Integer(3), Value::Integer(4)])
            .expect("evaluation succeeds");
        assert_eq!(value, Some(Value::Integer(7)));
    }

    #[rstest]
    fn null_bindings_flow_through() {
        let engine = ExpressionEngine::new().expect("in-memory engine");
        let value = engine
            .query_single(
                "SELECT CASE WHEN ? IS NULL THEN 5 ELSE 0 END",
                &[Value::Null],
            )
            .expect("evaluation succeeds");
        assert_eq!(value, Some(Value::Integer(5)));
    }

    #[rstest]
    fn rejects_bad_syntax_at_validation() {
        let engine = ExpressionEngine::new().expect("in-memory engine");
        let outcome = engine.validate("SELECT nonsense(");
        assert!(matches!(outcome, Err(ExpressionError::Prepare { .. })));
    }
}
