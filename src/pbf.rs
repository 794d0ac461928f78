//! OSM PBF upstream adapter and the stock layer schema.
//!
//! Wire-format decoding stays in `osmpbf`; this adapter only walks the
//! file blob by blob (one blob per [`ChunkSource::pull_next_chunk`]
//! call) and classifies decoded elements into the points and lines
//! layers. Way geometry is resolved against an in-memory node
//! coordinate cache filled as the stream advances, so ways whose nodes
//! appear later in the file (unsorted inputs) may go without geometry.
//! Relation assembly is out of scope; relations are only counted.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use geo::{Coord, Geometry, LineString, Point};
use osmpbf::{BlobDecode, BlobReader, Element};
use thiserror::Error;

use crate::computed::{ComputedAttributeError, Z_ORDER_EXPRESSION};
use crate::fields::{FieldSubtype, FieldType};
use crate::layer::Layer;
use crate::materialize::MetadataOptions;
use crate::record::{RawRecord, RecordKind};
use crate::source::{ChunkSource, LayerSet, SourceError};

/// Errors returned while reading an OSM PBF file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PbfError {
    /// The file could not be opened.
    #[error("failed to open OSM PBF file at {path:?}")]
    Open {
        /// Offending path.
        path: PathBuf,
        /// Underlying parser error.
        #[source]
        source: osmpbf::Error,
    },
    /// A blob could not be read or decoded.
    #[error("failed to decode OSM PBF data at {path:?}")]
    Decode {
        /// Offending path.
        path: PathBuf,
        /// Underlying parser error.
        #[source]
        source: osmpbf::Error,
    },
}

/// Raw element counts seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PbfCounts {
    /// Nodes, including dense-node entries.
    pub nodes: u64,
    /// Ways.
    pub ways: u64,
    /// Relations (counted, never materialized).
    pub relations: u64,
}

/// Blob-at-a-time [`ChunkSource`] over one `.osm.pbf` file.
pub struct PbfSource {
    path: PathBuf,
    reader: BlobReader<BufReader<File>>,
    nodes: HashMap<i64, Coord<f64>>,
    points_layer: usize,
    lines_layer: usize,
    counts: PbfCounts,
}

impl std::fmt::Debug for PbfSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbfSource")
            .field("path", &self.path)
            .field("cached_nodes", &self.nodes.len())
            .field("counts", &self.counts)
            .finish_non_exhaustive()
    }
}

impl PbfSource {
    /// Open a PBF file, targeting layer 0 for points and layer 1 for
    /// lines.
    pub fn open(path: &Path) -> Result<Self, PbfError> {
        let reader = BlobReader::from_path(path).map_err(|source| PbfError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            nodes: HashMap::new(),
            points_layer: 0,
            lines_layer: 1,
            counts: PbfCounts::default(),
        })
    }

    /// Override which layers receive point and line records.
    #[must_use]
    pub fn with_layer_targets(mut self, points_layer: usize, lines_layer: usize) -> Self {
        self.points_layer = points_layer;
        self.lines_layer = lines_layer;
        self
    }

    /// Element counts seen so far.
    pub const fn counts(&self) -> PbfCounts {
        self.counts
    }

    fn process_block(&mut self, block: &osmpbf::PrimitiveBlock, sink: &mut LayerSet) {
        for element in block.elements() {
            match element {
                Element::Node(node) => {
                    self.process_node(node.id(), node.lon(), node.lat(), node.tags(), sink);
                }
                Element::DenseNode(node) => {
                    self.process_node(node.id(), node.lon(), node.lat(), node.tags(), sink);
                }
                Element::Way(way) => self.process_way(&way, sink),
                Element::Relation(_) => self.counts.relations += 1,
            }
        }
    }

    fn process_node<'a, T>(&mut self, id: i64, lon: f64, lat: f64, tags: T, sink: &mut LayerSet)
    where
        T: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.counts.nodes += 1;
        self.nodes.insert(id, Coord { x: lon, y: lat });
        let tags: Vec<(String, String)> = tags
            .into_iter()
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();
        if !sink
            .key_policy()
            .has_significant_tag(tags.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        {
            return;
        }
        let mut record = RawRecord::new(id, RecordKind::Node);
        record.tags = tags;
        let geometry = Some(Geometry::Point(Point::new(lon, lat)));
        sink.deliver(self.points_layer, &record, geometry);
    }

    fn process_way(&mut self, way: &osmpbf::Way<'_>, sink: &mut LayerSet) {
        self.counts.ways += 1;
        let tags: Vec<(String, String)> = way
            .tags()
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();
        if !sink
            .key_policy()
            .has_significant_tag(tags.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        {
            return;
        }
        let refs: Vec<i64> = way.refs().collect();
        let geometry = line_from_cache(&self.nodes, &refs);
        let mut record = RawRecord::new(way.id(), RecordKind::Way);
        record.tags = tags;
        sink.deliver(self.lines_layer, &record, geometry);
    }
}

impl ChunkSource for PbfSource {
    fn pull_next_chunk(
        &mut self,
        _layer_hint: Option<usize>,
        sink: &mut LayerSet,
    ) -> Result<bool, SourceError> {
        loop {
            let Some(next) = self.reader.next() else {
                return Ok(false);
            };
            let blob = next
                .map_err(|source| PbfError::Decode {
                    path: self.path.clone(),
                    source,
                })
                .map_err(SourceError::upstream)?;
            let decoded = blob
                .decode()
                .map_err(|source| PbfError::Decode {
                    path: self.path.clone(),
                    source,
                })
                .map_err(SourceError::upstream)?;
            match decoded {
                BlobDecode::OsmData(block) => {
                    self.process_block(&block, sink);
                    return Ok(true);
                }
                BlobDecode::OsmHeader(_) | BlobDecode::Unknown(_) => {}
            }
        }
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.reader = BlobReader::from_path(&self.path)
            .map_err(|source| PbfError::Open {
                path: self.path.clone(),
                source,
            })
            .map_err(SourceError::upstream)?;
        self.nodes.clear();
        self.counts = PbfCounts::default();
        Ok(())
    }
}

/// Build a line from cached node coordinates; fewer than two resolved
/// coordinates yield no geometry.
fn line_from_cache(nodes: &HashMap<i64, Coord<f64>>, refs: &[i64]) -> Option<Geometry<f64>> {
    let coords: Vec<Coord<f64>> = refs
        .iter()
        .filter_map(|node_id| nodes.get(node_id))
        .copied()
        .collect();
    (coords.len() >= 2).then(|| Geometry::LineString(LineString::new(coords)))
}

/// Indices of the stock layers built by [`default_layers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardLayers {
    /// Tagged nodes.
    pub points: usize,
    /// Tagged ways.
    pub lines: usize,
}

/// Add the stock points and lines layers to `set`, in the shape of the
/// driver's default configuration: a handful of commonly mapped keys as
/// named fields, an `other_tags` blob for the rest, edit-metadata
/// fields per the source toggles, and the z-order computed attribute on
/// lines.
pub fn default_layers(set: &mut LayerSet) -> Result<StandardLayers, ComputedAttributeError> {
    let metadata = set.options().metadata;
    let points = set.add_layer("points");
    if let Some(layer) = set.layer_mut(points) {
        layer.add_field("osm_id", FieldType::Text, FieldSubtype::None);
        for name in ["name", "barrier", "highway", "ref", "place", "man_made"] {
            layer.add_field(name, FieldType::Text, FieldSubtype::None);
        }
        add_metadata_fields(layer, metadata);
        layer.add_field("other_tags", FieldType::Text, FieldSubtype::None);
    }

    let lines = set.add_layer("lines");
    if let Some(layer) = set.layer_mut(lines) {
        layer.add_field("osm_id", FieldType::Text, FieldSubtype::None);
        for name in [
            "name", "highway", "waterway", "aerialway", "barrier", "man_made", "railway",
        ] {
            layer.add_field(name, FieldType::Text, FieldSubtype::None);
        }
        add_metadata_fields(layer, metadata);
    }
    set.add_computed_attribute(lines, "z_order", FieldType::Integer, Z_ORDER_EXPRESSION)?;
    if let Some(layer) = set.layer_mut(lines) {
        layer.add_field("other_tags", FieldType::Text, FieldSubtype::None);
    }

    Ok(StandardLayers { points, lines })
}

fn add_metadata_fields(layer: &mut Layer, metadata: MetadataOptions) {
    if metadata.version {
        layer.add_field("osm_version", FieldType::Integer, FieldSubtype::None);
    }
    if metadata.timestamp {
        layer.add_field("osm_timestamp", FieldType::DateTime, FieldSubtype::None);
    }
    if metadata.uid {
        layer.add_field("osm_uid", FieldType::Integer, FieldSubtype::None);
    }
    if metadata.user {
        layer.add_field("osm_user", FieldType::Text, FieldSubtype::None);
    }
    if metadata.changeset {
        layer.add_field("osm_changeset", FieldType::Integer, FieldSubtype::None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceOptions;
    use rstest::rstest;

    #[rstest]
    fn lines_need_at_least_two_resolved_nodes() {
        let mut nodes = HashMap::new();
        nodes.insert(1, Coord { x: 0.0, y: 0.0 });
        nodes.insert(2, Coord { x: 1.0, y: 1.0 });

        assert!(line_from_cache(&nodes, &[1, 2]).is_some());
        assert!(line_from_cache(&nodes, &[1, 7]).is_none());
        assert!(line_from_cache(&nodes, &[7, 8]).is_none());
        // Unresolved references in the middle are skipped, not fatal.
        assert!(line_from_cache(&nodes, &[1, 7, 2]).is_some());
    }

    #[rstest]
    fn stock_schema_wires_the_z_order_fast_path() {
        let mut set = LayerSet::new(SourceOptions::default());
        let layers = default_layers(&mut set).expect("stock schema");
        let lines = set.layer(layers.lines).expect("lines layer");
        let attribute = lines
            .computed_attributes()
            .first()
            .expect("z_order attribute");
        assert!(attribute.is_z_order_fast_path());
        assert!(lines.catalog().find_field("z_order").is_some());
        assert!(lines.catalog().other_tags_index().is_some());

        let points = set.layer(layers.points).expect("points layer");
        assert!(points.catalog().id_index().is_some());
        assert!(points.catalog().way_id_index().is_none());
    }

    #[rstest]
    fn metadata_toggles_shape_the_stock_schema() {
        let options = SourceOptions {
            metadata: MetadataOptions::all(),
            ..SourceOptions::default()
        };
        let mut set = LayerSet::new(options);
        let layers = default_layers(&mut set).expect("stock schema");
        let points = set.layer(layers.points).expect("points layer");
        for name in ["osm_version", "osm_timestamp", "osm_uid", "osm_user", "osm_changeset"] {
            assert!(points.catalog().find_field(name).is_some(), "missing {name}");
        }
    }
}
