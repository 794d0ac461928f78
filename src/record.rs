//! Raw parsed records and materialized features.
//!
//! A [`RawRecord`] is what the upstream parser hands over: an
//! identifier, the node/way origin flag, the ordered tag list and
//! whatever edit metadata the input carried. A [`Feature`] is the
//! layer-shaped output record; its value slots parallel the owning
//! layer's [`FieldCatalog`](crate::fields::FieldCatalog) and geometry is
//! attached by the caller before filtering.

use geo::Geometry;

use crate::value::FieldValue;

/// Origin of a raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Node-like entity; the identifier is a node id.
    Node,
    /// Way-like entity; the identifier is a way id.
    Way,
}

/// A timestamp as the input carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampValue {
    /// Seconds since the Unix epoch.
    Epoch(i64),
    /// A literal datetime string, parsed lazily at materialization.
    Literal(String),
}

/// Edit metadata attached to a raw record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordInfo {
    /// Object version number.
    pub version: Option<i32>,
    /// Last-modified timestamp.
    pub timestamp: Option<TimestampValue>,
    /// Editing user id.
    pub uid: Option<i64>,
    /// Editing user name.
    pub user: Option<String>,
    /// Changeset id.
    pub changeset: Option<i64>,
}

/// One entity decoded by the upstream parser.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Entity identifier (node id or way id per [`RecordKind`]).
    pub id: i64,
    /// Node/way origin flag.
    pub kind: RecordKind,
    /// Ordered key/value tag pairs.
    pub tags: Vec<(String, String)>,
    /// Edit metadata, when the input carried it.
    pub info: RecordInfo,
}

impl RawRecord {
    /// Build a record with no tags and empty metadata.
    pub fn new(id: i64, kind: RecordKind) -> Self {
        Self {
            id,
            kind,
            tags: Vec::new(),
            info: RecordInfo::default(),
        }
    }

    /// Builder-style tag append, mostly for tests and adapters.
    #[must_use]
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.push((key.to_owned(), value.to_owned()));
        self
    }

    /// First value recorded for `key`, if any.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(tag_key, _)| tag_key == key)
            .map(|(_, value)| value.as_str())
    }
}

/// A materialized output record conforming to one layer's catalog.
#[derive(Debug, Clone)]
pub struct Feature {
    /// Entity identifier carried over from the raw record.
    pub id: i64,
    values: Vec<Option<FieldValue>>,
    /// Geometry attached post hoc by the caller.
    pub geometry: Option<Geometry<f64>>,
}

impl Feature {
    /// Create a feature with `width` unset value slots.
    pub fn new(id: i64, width: usize) -> Self {
        Self {
            id,
            values: vec![None; width],
            geometry: None,
        }
    }

    /// Set the value slot at `index`; out-of-range indices are ignored.
    pub fn set_field(&mut self, index: usize, value: FieldValue) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = Some(value);
        }
    }

    /// The value at `index`, when set.
    pub fn field(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index).and_then(Option::as_ref)
    }

    /// True when the slot at `index` holds a value.
    pub fn is_field_set(&self, index: usize) -> bool {
        self.field(index).is_some()
    }

    /// Number of value slots.
    pub fn width(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_lookup_returns_first_match() {
        let record = RawRecord::new(1, RecordKind::Node)
            .with_tag("name", "first")
            .with_tag("name", "second");
        assert_eq!(record.tag_value("name"), Some("first"));
        assert_eq!(record.tag_value("ref"), None);
    }

    #[test]
    fn out_of_range_set_is_ignored() {
        let mut feature = Feature::new(1, 2);
        feature.set_field(5, FieldValue::Integer(1));
        assert_eq!(feature.width(), 2);
        assert!(!feature.is_field_set(0));
    }
}
