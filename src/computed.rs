//! Derived fields evaluated per record.
//!
//! A computed attribute owns a prepared SQL expression whose
//! placeholders bind to already-set fields or raw tags. One expression,
//! the road z-order heuristic shipped with the stock line schema, is
//! recognised by exact text and computed directly, bypassing the engine;
//! its result matches what the engine would produce for the same text.

use log::debug;
use rusqlite::types::Value;
use thiserror::Error;

use crate::expr::{Binding, ExpressionEngine, ExpressionError};
use crate::fields::{FieldCatalog, FieldDef, FieldType};
use crate::record::{Feature, RawRecord};
use crate::value::FieldValue;

/// The z-order heuristic for transportation features, as shipped in the
/// stock line-layer configuration. Registering exactly this text as an
/// integer attribute takes the hardcoded fast path.
pub const Z_ORDER_EXPRESSION: &str = concat!(
    "SELECT (CASE [highway] WHEN 'minor' THEN 3 WHEN 'road' THEN 3 ",
    "WHEN 'unclassified' THEN 3 WHEN 'residential' THEN 3 WHEN ",
    "'tertiary_link' THEN 4 WHEN 'tertiary' THEN 4 WHEN 'secondary_link' ",
    "THEN 6 WHEN 'secondary' THEN 6 WHEN 'primary_link' THEN 7 WHEN ",
    "'primary' THEN 7 WHEN 'trunk_link' THEN 8 WHEN 'trunk' THEN 8 ",
    "WHEN 'motorway_link' THEN 9 WHEN 'motorway' THEN 9 ELSE 0 END) + ",
    "(CASE WHEN [bridge] IN ('yes', 'true', '1') THEN 10 ELSE 0 END) + ",
    "(CASE WHEN [tunnel] IN ('yes', 'true', '1') THEN -10 ELSE 0 END) + ",
    "(CASE WHEN [railway] IS NOT NULL THEN 5 ELSE 0 END) + ",
    "(CASE WHEN [layer] IS NOT NULL THEN 10 * CAST([layer] AS INTEGER) ",
    "ELSE 0 END)"
);

/// Errors raised while registering a computed attribute.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ComputedAttributeError {
    /// The attribute name collides with an existing field.
    #[error("a field named '{name}' already exists")]
    DuplicateName {
        /// The colliding name.
        name: String,
    },
    /// No layer exists at the given index.
    #[error("no layer at index {index}")]
    UnknownLayer {
        /// The out-of-range layer index.
        index: usize,
    },
    /// The expression engine rejected the expression.
    #[error(transparent)]
    Engine(#[from] ExpressionError),
}

/// One registered derived field.
#[derive(Debug)]
pub struct ComputedAttribute {
    name: String,
    field_index: usize,
    field_type: FieldType,
    source: String,
    sql: String,
    bindings: Vec<Binding>,
    z_order_fast_path: bool,
}

impl ComputedAttribute {
    pub(crate) fn new(
        name: &str,
        field_index: usize,
        field_type: FieldType,
        source: &str,
        sql: String,
        bindings: Vec<Binding>,
    ) -> Self {
        let z_order_fast_path = field_type == FieldType::Integer && source == Z_ORDER_EXPRESSION;
        Self {
            name: name.to_owned(),
            field_index,
            field_type,
            source: source.to_owned(),
            sql,
            bindings,
            z_order_fast_path,
        }
    }

    /// Declared attribute name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Catalog index of the derived field.
    pub const fn field_index(&self) -> usize {
        self.field_index
    }

    /// Original expression text as registered.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when evaluation bypasses the engine.
    pub const fn is_z_order_fast_path(&self) -> bool {
        self.z_order_fast_path
    }

    /// Evaluate against a partially materialized feature and its raw
    /// record, writing the derived value when one is produced.
    pub(crate) fn evaluate(
        &self,
        feature: &mut Feature,
        record: &RawRecord,
        catalog: &FieldCatalog,
        engine: Option<&ExpressionEngine>,
    ) {
        if self.z_order_fast_path {
            let score = hardcoded_z_order(feature, record, &self.bindings);
            feature.set_field(self.field_index, FieldValue::Integer(score));
            return;
        }
        let Some(engine) = engine else { return };
        let params: Vec<Value> = self
            .bindings
            .iter()
            .map(|binding| bind_value(binding, feature, record, catalog))
            .collect();
        match engine.query_single(&self.sql, &params) {
            Ok(Some(value)) => {
                if let Some(coerced) = column_to_field(&value, self.field_type) {
                    feature.set_field(self.field_index, coerced);
                }
            }
            Ok(None) => {}
            Err(error) => {
                debug!("computed attribute '{}' failed to evaluate: {error}", self.name);
            }
        }
    }
}

/// Bind a declared field's current value, coerced by the field's
/// declared type; unset fields bind as NULL.
pub(crate) fn bind_field(feature: &Feature, catalog: &FieldCatalog, index: usize) -> Value {
    match feature.field(index) {
        None => Value::Null,
        Some(value) => match catalog.field(index).map(FieldDef::field_type) {
            Some(FieldType::Integer | FieldType::Integer64) => {
                value.as_i64().map_or(Value::Integer(0), Value::Integer)
            }
            Some(FieldType::Real) => value.as_f64().map_or(Value::Real(0.0), Value::Real),
            _ => Value::Text(value.to_string()),
        },
    }
}

fn bind_value(
    binding: &Binding,
    feature: &Feature,
    record: &RawRecord,
    catalog: &FieldCatalog,
) -> Value {
    match binding {
        Binding::Field(index) => bind_field(feature, catalog, *index),
        Binding::Tag(key) => record
            .tag_value(key)
            .map_or(Value::Null, |value| Value::Text(value.to_owned())),
    }
}

fn column_to_field(value: &Value, target: FieldType) -> Option<FieldValue> {
    match value {
        Value::Integer(v) => FieldValue::Integer64(*v).coerce_to(target),
        Value::Real(v) => FieldValue::Real(*v).coerce_to(target),
        Value::Text(v) => FieldValue::Text(v.clone()).coerce_to(target),
        Value::Null | Value::Blob(_) => None,
    }
}

/// Inputs come from the bound field when the expression resolved one
/// (unset fields stay absent, with no tag fallback), else from the raw
/// tag set.
fn z_order_input(
    slot: usize,
    key: &str,
    bindings: &[Binding],
    feature: &Feature,
    record: &RawRecord,
) -> Option<String> {
    match bindings.get(slot) {
        Some(Binding::Field(index)) => feature.field(*index).map(|value| value.to_string()),
        _ => record.tag_value(key).map(str::to_owned),
    }
}

pub(crate) fn hardcoded_z_order(
    feature: &Feature,
    record: &RawRecord,
    bindings: &[Binding],
) -> i32 {
    let truthy = |value: &str| matches!(value, "yes" | "true" | "1");
    let mut score = 0_i32;

    if let Some(highway) = z_order_input(0, "highway", bindings, feature, record) {
        score += match highway.as_str() {
            "minor" | "road" | "unclassified" | "residential" => 3,
            "tertiary_link" | "tertiary" => 4,
            "secondary_link" | "secondary" => 6,
            "primary_link" | "primary" => 7,
            "trunk_link" | "trunk" => 8,
            "motorway_link" | "motorway" => 9,
            _ => 0,
        };
    }
    if z_order_input(1, "bridge", bindings, feature, record)
        .as_deref()
        .is_some_and(truthy)
    {
        score += 10;
    }
    if z_order_input(2, "tunnel", bindings, feature, record)
        .as_deref()
        .is_some_and(truthy)
    {
        score -= 10;
    }
    if z_order_input(3, "railway", bindings, feature, record).is_some() {
        score += 5;
    }
    if let Some(layer) = z_order_input(4, "layer", bindings, feature, record) {
        let level: i32 = layer.trim().parse().unwrap_or(0);
        score = score.saturating_add(level.saturating_mul(10));
    }
    score
}
