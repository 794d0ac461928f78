//! CLI entrypoint: stream materialized features out of an OSM PBF file.
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process;

use clap::Parser;
use thiserror::Error;

use osmflow::{
    default_layers, ComputedAttributeError, Feature, FeatureSource, KeyPolicy, Layer, LayerSet,
    MetadataOptions, PbfError, PbfSource, ReadMode, SourceError, SourceOptions, TagBlobStyle,
};

#[derive(Parser, Debug)]
#[command(name = "osmdump", about = "Stream features from an OSM PBF file")]
struct Arguments {
    /// Input `.osm.pbf` file.
    input: PathBuf,

    /// Read all layers in one pass instead of layer by layer.
    #[arg(long)]
    interleaved: bool,

    /// Serialize unmapped tags as JSON instead of HSTORE.
    #[arg(long)]
    json_tags: bool,

    /// Populate edit-metadata fields (version, timestamp, ...).
    #[arg(long)]
    metadata: bool,

    /// Stop after this many features; 0 streams everything.
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Open(#[from] PbfError),
    #[error(transparent)]
    Schema(#[from] ComputedAttributeError),
    #[error(transparent)]
    Read(#[from] SourceError),
}

fn main() {
    let arguments = Arguments::parse();
    if let Err(error) = run(&arguments) {
        eprintln!("osmdump: {error}");
        process::exit(1);
    }
}

fn run(arguments: &Arguments) -> Result<(), CliError> {
    let options = SourceOptions {
        read_mode: if arguments.interleaved {
            ReadMode::Interleaved
        } else {
            ReadMode::Sequential
        },
        tag_blob_style: if arguments.json_tags {
            TagBlobStyle::Json
        } else {
            TagBlobStyle::Hstore
        },
        metadata: if arguments.metadata {
            MetadataOptions::all()
        } else {
            MetadataOptions::default()
        },
        ..SourceOptions::default()
    };

    let mut set = LayerSet::new(options).with_key_policy(KeyPolicy::default_osm());
    let layers = default_layers(&mut set)?;
    let upstream =
        PbfSource::open(&arguments.input)?.with_layer_targets(layers.points, layers.lines);
    let mut source = FeatureSource::new(upstream, set);

    let mut emitted = 0_usize;
    while let Some((layer_index, feature)) = source.next_feature()? {
        let line = describe(&feature, source.layers().layer(layer_index));
        println!("{line}");
        emitted += 1;
        if arguments.limit != 0 && emitted >= arguments.limit {
            break;
        }
    }
    eprintln!("{emitted} features emitted");
    Ok(())
}

fn describe(feature: &Feature, layer: Option<&Layer>) -> String {
    let Some(layer) = layer else {
        return format!("id={}", feature.id);
    };
    let mut line = format!("{}\tid={}", layer.name(), feature.id);
    for (index, field) in layer.catalog().iter().enumerate() {
        if let Some(value) = feature.field(index) {
            line.push_str(&format!("\t{}={value}", field.visible_name()));
        }
    }
    line
}
