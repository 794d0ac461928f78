//! The feature source: layers, upstream pulls and reset semantics.
//!
//! A [`FeatureSource`] owns a [`LayerSet`] and an upstream
//! [`ChunkSource`]. Pulls are synchronous and single-threaded: "read
//! more data" is a blocking call that may enqueue into many layers'
//! queues as a side effect before returning. There is no cancellation
//! beyond the caller not pulling again.

use geo::Geometry;
use log::warn;
use thiserror::Error;

use crate::computed::ComputedAttributeError;
use crate::coordinator::{LayerLoad, ReadCoordinator, ReadMode, Step};
use crate::expr::{ExpressionEngine, ExpressionError};
use crate::fields::FieldType;
use crate::layer::{AddOutcome, FilterError, Layer};
use crate::materialize::{materialize_record, MetadataOptions};
use crate::queue::QueueLimits;
use crate::record::{Feature, RawRecord};
use crate::tags::{KeyPolicy, TagBlobStyle};

/// Global toggles supplied by the owning source, fixed for all layers.
#[derive(Debug, Clone, Copy)]
pub struct SourceOptions {
    /// Replace colons with underscores in visible field names.
    pub launder: bool,
    /// Serialization style of the aggregated tag blob.
    pub tag_blob_style: TagBlobStyle,
    /// Which edit-metadata fields are populated.
    pub metadata: MetadataOptions,
    /// Traversal mode over the shared upstream stream.
    pub read_mode: ReadMode,
    /// Buffering thresholds applied to every layer queue.
    pub queue_limits: QueueLimits,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            launder: true,
            tag_blob_style: TagBlobStyle::default(),
            metadata: MetadataOptions::default(),
            read_mode: ReadMode::default(),
            queue_limits: QueueLimits::default(),
        }
    }
}

/// Errors surfaced while pulling features.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SourceError {
    /// The upstream parser failed to produce a chunk.
    #[error("upstream parser failed")]
    Upstream {
        /// Adapter-specific failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl SourceError {
    /// Wrap an adapter failure.
    pub fn upstream<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Upstream {
            source: Box::new(source),
        }
    }
}

/// The shared upstream parse stream.
///
/// One call decodes one chunk of input and, as a side effect, delivers
/// every record it produced into the sink's layers. The return value
/// reports whether more input may follow. `layer_hint` names the layer
/// whose pull triggered the call; adapters may use it to prioritise
/// work, and may ignore it.
pub trait ChunkSource {
    /// Pull and deliver one more chunk.
    fn pull_next_chunk(
        &mut self,
        layer_hint: Option<usize>,
        sink: &mut LayerSet,
    ) -> Result<bool, SourceError>;

    /// Restart the stream from the beginning.
    fn rewind(&mut self) -> Result<(), SourceError>;
}

/// All layers of one open source, with the session-wide key policy and
/// the shared expression engine.
#[derive(Debug)]
pub struct LayerSet {
    layers: Vec<Layer>,
    keys: KeyPolicy,
    options: SourceOptions,
    engine: Option<ExpressionEngine>,
}

impl LayerSet {
    /// Create an empty set with an empty key policy.
    pub fn new(options: SourceOptions) -> Self {
        Self {
            layers: Vec::new(),
            keys: KeyPolicy::new(),
            options,
            engine: None,
        }
    }

    /// Replace the key policy (typically [`KeyPolicy::default_osm`]).
    #[must_use]
    pub fn with_key_policy(mut self, keys: KeyPolicy) -> Self {
        self.keys = keys;
        self
    }

    /// The source-wide toggles.
    pub const fn options(&self) -> &SourceOptions {
        &self.options
    }

    /// The session key policy.
    pub const fn key_policy(&self) -> &KeyPolicy {
        &self.keys
    }

    /// Mutable access to the session key policy, for setup-time
    /// additions.
    pub fn key_policy_mut(&mut self) -> &mut KeyPolicy {
        &mut self.keys
    }

    /// Append a new empty layer and return its index.
    pub fn add_layer(&mut self, name: impl Into<String>) -> usize {
        let index = self.layers.len();
        self.layers.push(Layer::new(
            index,
            name,
            self.options.launder,
            self.options.queue_limits,
        ));
        index
    }

    /// The layer at `index`, if any.
    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    /// Mutable access to the layer at `index`.
    pub fn layer_mut(&mut self, index: usize) -> Option<&mut Layer> {
        self.layers.get_mut(index)
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// True when no layer was added.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Iterate over layers in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Layer> {
        self.layers.iter_mut()
    }

    /// The shared expression engine, once one was needed.
    pub const fn engine(&self) -> Option<&ExpressionEngine> {
        self.engine.as_ref()
    }

    /// Register a computed attribute on the layer at `layer_index`.
    ///
    /// The shared engine is opened lazily on first use.
    pub fn add_computed_attribute(
        &mut self,
        layer_index: usize,
        name: &str,
        field_type: FieldType,
        expression: &str,
    ) -> Result<(), ComputedAttributeError> {
        self.ensure_engine()
            .map_err(ComputedAttributeError::Engine)?;
        let Self { layers, engine, .. } = self;
        let layer = layers
            .get_mut(layer_index)
            .ok_or(ComputedAttributeError::UnknownLayer { index: layer_index })?;
        match engine.as_ref() {
            Some(engine) => layer.add_computed_attribute(engine, name, field_type, expression),
            None => Err(ComputedAttributeError::UnknownLayer { index: layer_index }),
        }
    }

    /// Install, replace or clear the attribute filter on a layer.
    pub fn set_attribute_filter(
        &mut self,
        layer_index: usize,
        expression: Option<&str>,
    ) -> Result<(), FilterError> {
        self.ensure_engine().map_err(FilterError::Engine)?;
        let Self { layers, engine, .. } = self;
        let layer = layers
            .get_mut(layer_index)
            .ok_or(FilterError::UnknownLayer { index: layer_index })?;
        match engine.as_ref() {
            Some(engine) => layer.set_attribute_filter(engine, expression),
            None => Err(FilterError::UnknownLayer { index: layer_index }),
        }
    }

    /// Materialize `record` for the layer at `layer_index`, attach
    /// `geometry`, run the layer's filters and buffer the result.
    ///
    /// Returns true when the feature was buffered. Disinterest, filters
    /// and buffer rejection all drop the record silently; rejection was
    /// already logged by the queue.
    pub fn deliver(
        &mut self,
        layer_index: usize,
        record: &RawRecord,
        geometry: Option<Geometry<f64>>,
    ) -> bool {
        let Self {
            layers,
            keys,
            options,
            engine,
        } = self;
        let Some(layer) = layers.get_mut(layer_index) else {
            return false;
        };
        if !layer.user_interested() {
            return false;
        }
        let mut feature = materialize_record(
            layer.catalog(),
            layer.computed_attributes(),
            keys,
            options.tag_blob_style,
            options.metadata,
            engine.as_ref(),
            record,
        );
        feature.geometry = geometry;
        matches!(
            layer.add_feature(feature, engine.as_ref(), false, true),
            AddOutcome::Queued
        )
    }

    pub(crate) fn load_snapshot(&self) -> Vec<LayerLoad> {
        self.layers
            .iter()
            .map(|layer| LayerLoad {
                buffered: layer.buffered_len(),
                overfull: layer.is_overfull(),
            })
            .collect()
    }

    fn ensure_engine(&mut self) -> Result<(), ExpressionError> {
        if self.engine.is_none() {
            self.engine = Some(ExpressionEngine::new()?);
        }
        Ok(())
    }
}

/// Pull-based reader over a layer set and its upstream stream.
#[derive(Debug)]
pub struct FeatureSource<U> {
    upstream: U,
    set: LayerSet,
    coordinator: ReadCoordinator,
    dataset_cursor: usize,
}

impl<U: ChunkSource> FeatureSource<U> {
    /// Bind an upstream stream to a configured layer set.
    pub fn new(upstream: U, set: LayerSet) -> Self {
        let mode = set.options().read_mode;
        Self {
            upstream,
            set,
            coordinator: ReadCoordinator::new(mode),
            dataset_cursor: 0,
        }
    }

    /// The owned layer set.
    pub const fn layers(&self) -> &LayerSet {
        &self.set
    }

    /// Mutable access to the layer set, for setup-time configuration.
    pub fn layers_mut(&mut self) -> &mut LayerSet {
        &mut self.set
    }

    /// The read coordinator state machine.
    pub const fn coordinator(&self) -> &ReadCoordinator {
        &self.coordinator
    }

    /// The upstream adapter.
    pub const fn upstream_ref(&self) -> &U {
        &self.upstream
    }

    /// Pull the next feature for one specific layer.
    ///
    /// Returns `None` when the layer cannot produce right now: in
    /// interleaved mode another layer may own the stream (check
    /// [`ReadCoordinator::current`] and dispatch there), or the stream
    /// is exhausted.
    pub fn next_feature_for(&mut self, layer_index: usize) -> Result<Option<Feature>, SourceError> {
        if let Some(layer) = self.set.layer_mut(layer_index) {
            layer.mark_read_attempt();
        } else {
            return Ok(None);
        }
        loop {
            let step = self
                .coordinator
                .begin_pull(layer_index, &self.set.load_snapshot());
            match step {
                Step::Deliver => {
                    return Ok(self.set.layer_mut(layer_index).and_then(Layer::next_buffered));
                }
                Step::Refused { .. } | Step::Switch(_) | Step::EndOfStream => return Ok(None),
                Step::Parse => {
                    let has_more = self
                        .upstream
                        .pull_next_chunk(Some(layer_index), &mut self.set)?;
                    let after = self.coordinator.after_parse(
                        layer_index,
                        &self.set.load_snapshot(),
                        has_more,
                    );
                    match after {
                        Step::Deliver => {
                            return Ok(self
                                .set
                                .layer_mut(layer_index)
                                .and_then(Layer::next_buffered));
                        }
                        Step::Parse => {}
                        Step::Refused { .. } | Step::Switch(_) | Step::EndOfStream => {
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Pull the next feature from whichever layer the coordinator says
    /// is current, falling back to layer order. Sequential mode rewinds
    /// the stream between layers so each one sees the whole input.
    pub fn next_feature(&mut self) -> Result<Option<(usize, Feature)>, SourceError> {
        let layer_count = self.set.len();
        loop {
            let target = match self.coordinator.current() {
                Some(current) => current,
                None => {
                    if self.dataset_cursor >= layer_count {
                        return Ok(None);
                    }
                    self.dataset_cursor
                }
            };
            if let Some(feature) = self.next_feature_for(target)? {
                return Ok(Some((target, feature)));
            }
            if self.coordinator.current().is_none() {
                // `target` is exhausted; move on to the next layer.
                self.dataset_cursor += 1;
                if self.coordinator.mode() == ReadMode::Sequential
                    && self.dataset_cursor < layer_count
                {
                    self.rewind_all()?;
                }
            }
        }
    }

    /// Rewind reading for one layer's consumer.
    ///
    /// A no-op in interleaved mode, and when no destructive read
    /// happened since the last rewind. Otherwise the upstream restarts
    /// and every layer's buffer is dropped.
    pub fn reset_reading(&mut self, layer_index: usize) -> Result<(), SourceError> {
        let allowed = self.set.layer(layer_index).is_some_and(Layer::reset_allowed);
        if !allowed || self.coordinator.mode() == ReadMode::Interleaved {
            return Ok(());
        }
        self.dataset_cursor = 0;
        self.rewind_all()
    }

    /// Install, replace or clear a layer's attribute filter.
    ///
    /// In sequential mode, changing the filter before any destructive
    /// read rewinds the stream so the filter applies from the start;
    /// afterwards the change is accepted with a warning (it is not
    /// retroactive).
    pub fn set_attribute_filter(
        &mut self,
        layer_index: usize,
        expression: Option<&str>,
    ) -> Result<(), FilterError> {
        let active = self.set.layer(layer_index).and_then(Layer::attribute_filter);
        let unchanged = match (expression, active) {
            (None, None) => true,
            (Some(new), Some(current)) => new == current,
            _ => false,
        };
        if unchanged {
            return Ok(());
        }
        let had_partial = self
            .set
            .layer(layer_index)
            .is_some_and(Layer::has_partial_reads);
        self.set.set_attribute_filter(layer_index, expression)?;
        if !had_partial && self.coordinator.mode() == ReadMode::Sequential {
            self.dataset_cursor = 0;
            if let Err(error) = self.rewind_all() {
                warn!("could not rewind after an attribute filter change: {error}");
            }
        }
        Ok(())
    }

    fn rewind_all(&mut self) -> Result<(), SourceError> {
        self.upstream.rewind()?;
        for layer in self.set.iter_mut() {
            layer.force_reset();
        }
        self.coordinator.clear_current();
        Ok(())
    }
}
