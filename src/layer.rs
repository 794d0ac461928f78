//! A logical output layer: schema, buffer and filters.
//!
//! One layer exists per feature category of a source and lives until the
//! source closes. Schema changes (fields, computed attributes) happen in
//! a one-time setup phase before reading begins; afterwards the layer
//! only buffers and serves features.

use geo::algorithm::{BoundingRect, Intersects};
use geo::Rect;
use log::warn;
use rusqlite::types::Value;
use thiserror::Error;

use crate::computed::{bind_field, ComputedAttribute, ComputedAttributeError};
use crate::expr::{parse_references, Binding, ExpressionEngine, ExpressionError};
use crate::fields::{FieldCatalog, FieldSubtype, FieldType};
use crate::queue::{EnqueueError, FeatureQueue, QueueLimits};
use crate::record::Feature;

/// Errors raised while configuring an attribute filter.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FilterError {
    /// The filter references a name that is not a declared field.
    /// Filters evaluate over materialized fields only, never raw tags.
    #[error("attribute filter references unknown field '{name}'")]
    UnknownField {
        /// The unresolved reference.
        name: String,
    },
    /// No layer exists at the given index.
    #[error("no layer at index {index}")]
    UnknownLayer {
        /// The out-of-range layer index.
        index: usize,
    },
    /// The expression engine rejected the filter expression.
    #[error(transparent)]
    Engine(#[from] ExpressionError),
}

/// Outcome of offering a feature to a layer.
#[derive(Debug)]
pub enum AddOutcome {
    /// Buffered for a consumer.
    Queued,
    /// Dropped by disinterest or a filter; not an error.
    Filtered,
    /// The buffer refused it (capacity or allocation failure).
    Rejected(EnqueueError),
}

#[derive(Debug)]
struct AttributeFilter {
    source: String,
    sql: String,
    bindings: Vec<usize>,
}

/// One logical feature category of a source.
#[derive(Debug)]
pub struct Layer {
    index: usize,
    name: String,
    catalog: FieldCatalog,
    computed: Vec<ComputedAttribute>,
    queue: FeatureQueue,
    spatial_filter: Option<Rect<f64>>,
    attr_filter: Option<AttributeFilter>,
    user_interested: bool,
    reset_allowed: bool,
}

impl Layer {
    /// Create an empty layer.
    pub fn new(index: usize, name: impl Into<String>, launder: bool, limits: QueueLimits) -> Self {
        let label: String = name.into();
        Self {
            index,
            queue: FeatureQueue::new(label.clone(), limits),
            name: label,
            catalog: FieldCatalog::new(launder),
            computed: Vec::new(),
            spatial_filter: None,
            attr_filter: None,
            user_interested: true,
            reset_allowed: false,
        }
    }

    /// Position of this layer within its source.
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Layer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared schema.
    pub const fn catalog(&self) -> &FieldCatalog {
        &self.catalog
    }

    /// Registered computed attributes, in declaration order.
    pub fn computed_attributes(&self) -> &[ComputedAttribute] {
        &self.computed
    }

    /// Append a declared field; see [`FieldCatalog::add_field`].
    pub fn add_field(&mut self, name: &str, field_type: FieldType, subtype: FieldSubtype) -> usize {
        self.catalog.add_field(name, field_type, subtype)
    }

    /// Register a derived field evaluated per record.
    ///
    /// The expression is rewritten and prepared immediately; failures
    /// leave both the catalog and the attribute list unchanged.
    pub fn add_computed_attribute(
        &mut self,
        engine: &ExpressionEngine,
        name: &str,
        field_type: FieldType,
        expression: &str,
    ) -> Result<(), ComputedAttributeError> {
        if self.catalog.has_name(name) {
            return Err(ComputedAttributeError::DuplicateName {
                name: name.to_owned(),
            });
        }
        let parsed = parse_references(expression, &self.catalog);
        engine.validate(&parsed.sql)?;
        let field_index = self.catalog.add_field(name, field_type, FieldSubtype::None);
        self.computed.push(ComputedAttribute::new(
            name,
            field_index,
            field_type,
            expression,
            parsed.sql,
            parsed.bindings,
        ));
        Ok(())
    }

    /// Whether any consumer wants this layer's output. Disinterested
    /// layers drop every record before buffering.
    pub const fn user_interested(&self) -> bool {
        self.user_interested
    }

    /// Mark this layer as wanted or unwanted.
    pub fn set_user_interest(&mut self, interested: bool) {
        self.user_interested = interested;
    }

    /// Restrict output to features whose geometry envelope intersects
    /// `envelope`; `None` clears the filter.
    pub fn set_spatial_filter(&mut self, envelope: Option<Rect<f64>>) {
        self.spatial_filter = envelope;
    }

    /// The active spatial filter envelope, if any.
    pub const fn spatial_filter_envelope(&self) -> Option<&Rect<f64>> {
        self.spatial_filter.as_ref()
    }

    /// Install, replace or clear the attribute filter.
    ///
    /// Setting a filter textually identical to the active one is a
    /// no-op. Changing the filter after reads have started is accepted
    /// but not retroactive: features already buffered in other layers
    /// were filtered under the old predicate.
    pub fn set_attribute_filter(
        &mut self,
        engine: &ExpressionEngine,
        expression: Option<&str>,
    ) -> Result<(), FilterError> {
        match (expression, &self.attr_filter) {
            (None, None) => return Ok(()),
            (Some(new), Some(active)) if active.source == new => return Ok(()),
            _ => {}
        }
        if self.queue.has_partial_reads() {
            warn!(
                "the new attribute filter on layer '{}' will not be applied \
                 immediately; set filters for all needed layers before reading \
                 any layer",
                self.name
            );
        }
        let Some(text) = expression else {
            self.attr_filter = None;
            return Ok(());
        };
        let parsed = parse_references(text, &self.catalog);
        let mut bindings = Vec::with_capacity(parsed.bindings.len());
        for binding in parsed.bindings {
            match binding {
                Binding::Field(field_index) => bindings.push(field_index),
                Binding::Tag(name) => return Err(FilterError::UnknownField { name }),
            }
        }
        let sql = format!("SELECT ({})", parsed.sql);
        engine.validate(&sql)?;
        self.attr_filter = Some(AttributeFilter {
            source: text.to_owned(),
            sql,
            bindings,
        });
        Ok(())
    }

    /// Source text of the active attribute filter, if any.
    pub fn attribute_filter(&self) -> Option<&str> {
        self.attr_filter.as_ref().map(|filter| filter.source.as_str())
    }

    /// Evaluate the attribute filter against a materialized feature.
    /// No filter (or no engine) passes everything.
    pub fn evaluate_attribute_filter(
        &self,
        engine: Option<&ExpressionEngine>,
        feature: &Feature,
    ) -> bool {
        let Some(filter) = &self.attr_filter else {
            return true;
        };
        let Some(engine) = engine else {
            return true;
        };
        let params: Vec<Value> = filter
            .bindings
            .iter()
            .map(|&field_index| bind_field(feature, &self.catalog, field_index))
            .collect();
        match engine.query_single(&filter.sql, &params) {
            Ok(Some(Value::Integer(v))) => v != 0,
            #[expect(clippy::float_cmp, reason = "SQL truthiness: any nonzero real passes")]
            Ok(Some(Value::Real(v))) => v != 0.0,
            Ok(_) => false,
            Err(error) => {
                warn!(
                    "attribute filter on layer '{}' failed to evaluate: {error}",
                    self.name
                );
                false
            }
        }
    }

    /// Offer a materialized feature to this layer.
    ///
    /// The feature is buffered only when the layer is of interest and
    /// passes the active spatial and attribute filters; the attribute
    /// filter may have been pre-evaluated by the caller to avoid a
    /// second evaluation.
    pub fn add_feature(
        &mut self,
        feature: Feature,
        engine: Option<&ExpressionEngine>,
        attr_filter_already_evaluated: bool,
        check_threshold: bool,
    ) -> AddOutcome {
        if !self.user_interested {
            return AddOutcome::Filtered;
        }
        let passes = self.passes_spatial_filter(&feature)
            && (attr_filter_already_evaluated
                || self.evaluate_attribute_filter(engine, &feature));
        if !passes {
            return AddOutcome::Filtered;
        }
        match self.queue.enqueue(feature, check_threshold) {
            Ok(()) => AddOutcome::Queued,
            Err(error) => AddOutcome::Rejected(error),
        }
    }

    /// Remove and return the oldest buffered feature, marking that a
    /// destructive read happened.
    pub fn next_buffered(&mut self) -> Option<Feature> {
        self.reset_allowed = true;
        self.queue.dequeue_next()
    }

    /// Buffered feature count, as read coordination sees it.
    pub fn buffered_len(&self) -> usize {
        self.queue.buffered_len()
    }

    /// True above the queue's soft threshold.
    pub fn is_overfull(&self) -> bool {
        self.queue.is_overfull()
    }

    /// True when some buffered features were consumed but not all.
    pub fn has_partial_reads(&self) -> bool {
        self.queue.has_partial_reads()
    }

    /// True when a destructive read happened since the last rewind.
    pub const fn reset_allowed(&self) -> bool {
        self.reset_allowed
    }

    pub(crate) fn mark_read_attempt(&mut self) {
        self.reset_allowed = true;
    }

    /// Drop all buffered content; future automatic rewinds are disabled
    /// until the next destructive read.
    pub fn force_reset(&mut self) {
        self.queue.force_clear();
        self.reset_allowed = false;
    }

    fn passes_spatial_filter(&self, feature: &Feature) -> bool {
        let Some(envelope) = &self.spatial_filter else {
            return true;
        };
        feature
            .geometry
            .as_ref()
            .and_then(|geometry| geometry.bounding_rect())
            .is_some_and(|rect| envelope.intersects(&rect))
    }
}
