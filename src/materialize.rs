//! Record materialization: raw tags and metadata into layer-shaped
//! features.
//!
//! Population is best effort and never fails: a value that cannot be
//! coerced into its field's declared type leaves the field unset. The
//! population order is fixed (identifier, metadata, tag fields, the
//! aggregated blob, then computed attributes) because computed
//! expressions may read fields set by the earlier steps.

use crate::computed::ComputedAttribute;
use crate::expr::ExpressionEngine;
use crate::fields::FieldCatalog;
use crate::record::{Feature, RawRecord, RecordKind, TimestampValue};
use crate::tags::{BlobBuilder, KeyPolicy, TagBlobStyle};
use crate::value::{epoch_to_datetime, parse_datetime, FieldValue};

/// Which edit-metadata fields are populated. Each toggle only matters
/// when the layer also declares the corresponding field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataOptions {
    /// Populate `osm_version`.
    pub version: bool,
    /// Populate `osm_timestamp`.
    pub timestamp: bool,
    /// Populate `osm_uid`.
    pub uid: bool,
    /// Populate `osm_user`.
    pub user: bool,
    /// Populate `osm_changeset`.
    pub changeset: bool,
}

impl MetadataOptions {
    /// Enable every metadata field.
    pub const fn all() -> Self {
        Self {
            version: true,
            timestamp: true,
            uid: true,
            user: true,
            changeset: true,
        }
    }
}

/// Materialize one raw record into a feature conforming to `catalog`.
///
/// Geometry is not handled here; the caller attaches it afterwards.
pub fn materialize_record(
    catalog: &FieldCatalog,
    computed: &[ComputedAttribute],
    keys: &mut KeyPolicy,
    style: TagBlobStyle,
    metadata: MetadataOptions,
    engine: Option<&ExpressionEngine>,
    record: &RawRecord,
) -> Feature {
    let mut feature = Feature::new(record.id, catalog.len());
    set_identifier(catalog, record, &mut feature);
    set_metadata(catalog, metadata, record, &mut feature);
    set_tag_fields(catalog, keys, style, record, &mut feature);
    for attribute in computed {
        attribute.evaluate(&mut feature, record, catalog, engine);
    }
    feature
}

fn set_identifier(catalog: &FieldCatalog, record: &RawRecord, feature: &mut Feature) {
    // Way records prefer the dedicated way-id field; layers that only
    // declare `osm_id` (the stock lines layer) get the id there.
    let index = match record.kind {
        RecordKind::Node => catalog.id_index(),
        RecordKind::Way => catalog.way_id_index().or_else(|| catalog.id_index()),
    };
    if let Some(index) = index {
        feature.set_field(index, FieldValue::Text(record.id.to_string()));
    }
}

fn set_metadata(
    catalog: &FieldCatalog,
    metadata: MetadataOptions,
    record: &RawRecord,
    feature: &mut Feature,
) {
    let info = &record.info;
    if metadata.version {
        if let Some(version) = info.version {
            set_named(catalog, feature, "osm_version", FieldValue::Integer(version));
        }
    }
    if metadata.timestamp {
        let parsed = match &info.timestamp {
            Some(TimestampValue::Literal(text)) => parse_datetime(text),
            Some(TimestampValue::Epoch(seconds)) => epoch_to_datetime(*seconds),
            None => None,
        };
        if let Some(datetime) = parsed {
            set_named(
                catalog,
                feature,
                "osm_timestamp",
                FieldValue::DateTime(datetime),
            );
        }
    }
    if metadata.uid {
        if let Some(uid) = info.uid {
            set_named(catalog, feature, "osm_uid", FieldValue::Integer64(uid));
        }
    }
    if metadata.user {
        if let Some(user) = &info.user {
            set_named(catalog, feature, "osm_user", FieldValue::Text(user.clone()));
        }
    }
    if metadata.changeset {
        if let Some(changeset) = info.changeset {
            set_named(
                catalog,
                feature,
                "osm_changeset",
                FieldValue::Integer64(changeset),
            );
        }
    }
}

fn set_tag_fields(
    catalog: &FieldCatalog,
    keys: &mut KeyPolicy,
    style: TagBlobStyle,
    record: &RawRecord,
    feature: &mut Feature,
) {
    let wants_blob = catalog.all_tags_index().is_some() || catalog.other_tags_index().is_some();
    let mut blob = BlobBuilder::new(style);
    for (key, value) in &record.tags {
        if let Some(index) = catalog.find_field(key) {
            // A literal `osm_id` tag must not clobber the identifier.
            if catalog.id_index() != Some(index) {
                set_coerced(catalog, feature, index, FieldValue::Text(value.clone()));
                // `other_tags` aggregates only unmapped keys; `all_tags`
                // keeps every key, mapped or not.
                if catalog.all_tags_index().is_none() {
                    continue;
                }
            }
        }
        if wants_blob {
            if keys.include_in_blob(key) {
                blob.push(key, value);
            } else {
                keys.note_dropped(key);
            }
        }
    }
    if let Some(serialized) = blob.finish() {
        if let Some(index) = catalog
            .all_tags_index()
            .or_else(|| catalog.other_tags_index())
        {
            feature.set_field(index, FieldValue::Text(serialized));
        }
    }
}

fn set_named(catalog: &FieldCatalog, feature: &mut Feature, name: &str, value: FieldValue) {
    if let Some(index) = catalog.find_field(name) {
        set_coerced(catalog, feature, index, value);
    }
}

fn set_coerced(catalog: &FieldCatalog, feature: &mut Feature, index: usize, value: FieldValue) {
    if let Some(field) = catalog.field(index) {
        if let Some(coerced) = value.coerce_to(field.field_type()) {
            feature.set_field(index, coerced);
        }
    }
}
