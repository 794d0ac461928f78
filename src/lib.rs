//! Layered feature materialization for OpenStreetMap streams.
//!
//! Responsibilities:
//! - Buffer materialized features per logical layer with bounded queues.
//! - Turn raw tag lists and edit metadata into typed, schema-shaped
//!   records, including aggregated tag blobs and computed attributes.
//! - Coordinate several layers reading one shared upstream stream, in
//!   sequential or interleaved mode.
//!
//! Boundaries:
//! - Wire-format decoding belongs to `osmpbf`; the adapter in [`pbf`]
//!   only walks blobs and classifies elements.
//! - Geometry algorithms and spatial reference handling stay out; only
//!   envelope intersection is used for spatial filtering.
//!
//! Invariants:
//! - Single-threaded, synchronous, pull-based: nothing here suspends or
//!   locks, and every queue is mutated by one logical thread of control.
//! - Field catalog indices are stable for a layer's lifetime.
#![forbid(unsafe_code)]

pub mod computed;
pub mod coordinator;
pub mod expr;
pub mod fields;
pub mod layer;
pub mod materialize;
pub mod pbf;
pub mod queue;
pub mod record;
pub mod source;
pub mod tags;
pub mod value;

pub use computed::{ComputedAttribute, ComputedAttributeError, Z_ORDER_EXPRESSION};
pub use coordinator::{LayerLoad, ReadCoordinator, ReadMode, Step};
pub use expr::{parse_references, Binding, ExpressionEngine, ExpressionError, ParsedExpression};
pub use fields::{FieldCatalog, FieldDef, FieldKind, FieldSubtype, FieldType};
pub use layer::{AddOutcome, FilterError, Layer};
pub use materialize::{materialize_record, MetadataOptions};
pub use pbf::{default_layers, PbfCounts, PbfError, PbfSource, StandardLayers};
pub use queue::{EnqueueError, FeatureQueue, QueueLimits};
pub use record::{Feature, RawRecord, RecordInfo, RecordKind, TimestampValue};
pub use source::{ChunkSource, FeatureSource, LayerSet, SourceError, SourceOptions};
pub use tags::{KeyPolicy, TagBlobStyle};
pub use value::FieldValue;
