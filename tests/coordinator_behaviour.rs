//! Behavioural tests for interleaved multi-layer reading.

use std::cell::RefCell;
use std::collections::VecDeque;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use osmflow::{
    ChunkSource, FeatureSource, FieldSubtype, FieldType, LayerSet, QueueLimits, RawRecord,
    ReadMode, RecordKind, SourceError, SourceOptions,
};

/// Scripted upstream: each chunk is a list of (layer, record)
/// deliveries.
struct ScriptedSource {
    pending: VecDeque<Vec<(usize, RawRecord)>>,
}

impl ScriptedSource {
    fn new(script: Vec<Vec<(usize, RawRecord)>>) -> Self {
        Self {
            pending: script.into(),
        }
    }

    fn remaining_chunks(&self) -> usize {
        self.pending.len()
    }
}

impl ChunkSource for ScriptedSource {
    fn pull_next_chunk(
        &mut self,
        _layer_hint: Option<usize>,
        sink: &mut LayerSet,
    ) -> Result<bool, SourceError> {
        let Some(chunk) = self.pending.pop_front() else {
            return Ok(false);
        };
        for (layer_index, record) in chunk {
            sink.deliver(layer_index, &record, None);
        }
        Ok(true)
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

type Source = FeatureSource<ScriptedSource>;

fn record(id: i64) -> RawRecord {
    RawRecord::new(id, RecordKind::Node).with_tag("name", "x")
}

fn build_source(soft: usize, script: Vec<Vec<(usize, RawRecord)>>) -> Source {
    let options = SourceOptions {
        read_mode: ReadMode::Interleaved,
        queue_limits: QueueLimits { soft, hard: 100 },
        ..SourceOptions::default()
    };
    let mut set = LayerSet::new(options);
    for name in ["points", "lines"] {
        let index = set.add_layer(name);
        if let Some(layer) = set.layer_mut(index) {
            layer.add_field("osm_id", FieldType::Text, FieldSubtype::None);
            layer.add_field("name", FieldType::Text, FieldSubtype::None);
        }
    }
    FeatureSource::new(ScriptedSource::new(script), set)
}

#[fixture]
fn source_cell() -> RefCell<Option<Source>> {
    RefCell::new(None)
}

#[fixture]
fn delivered() -> RefCell<Vec<(usize, i64)>> {
    RefCell::new(Vec::new())
}

#[given("a two-layer source whose first chunk overfills the points layer")]
fn overfull_source(#[from(source_cell)] source: &RefCell<Option<Source>>) {
    // Soft limit 2; chunk one parks three features in points (layer 0)
    // and one in lines (layer 1); chunk two must stay unread.
    let script = vec![
        vec![(0, record(1)), (0, record(2)), (0, record(3)), (1, record(9))],
        vec![(1, record(10))],
    ];
    *source.borrow_mut() = Some(build_source(2, script));
}

#[given("a two-layer source with one feature per layer")]
fn small_source(#[from(source_cell)] source: &RefCell<Option<Source>>) {
    let script = vec![vec![(0, record(1)), (1, record(2))]];
    *source.borrow_mut() = Some(build_source(10, script));
}

#[when("the lines layer is pulled until it yields nothing")]
fn pull_lines_until_empty(
    #[from(source_cell)] source: &RefCell<Option<Source>>,
    #[from(delivered)] seen: &RefCell<Vec<(usize, i64)>>,
) {
    let mut guard = source.borrow_mut();
    let reader = guard.as_mut().expect("source prepared");
    while let Some(feature) = reader.next_feature_for(1).expect("pull succeeds") {
        seen.borrow_mut().push((1, feature.id));
    }
}

#[when("the points layer is pulled once")]
fn pull_points_once(
    #[from(source_cell)] source: &RefCell<Option<Source>>,
    #[from(delivered)] seen: &RefCell<Vec<(usize, i64)>>,
) {
    let mut guard = source.borrow_mut();
    let reader = guard.as_mut().expect("source prepared");
    let feature = reader
        .next_feature_for(0)
        .expect("pull succeeds")
        .expect("points has a feature");
    seen.borrow_mut().push((0, feature.id));
}

#[when("every feature is pulled")]
fn pull_everything(
    #[from(source_cell)] source: &RefCell<Option<Source>>,
    #[from(delivered)] seen: &RefCell<Vec<(usize, i64)>>,
) {
    let mut guard = source.borrow_mut();
    let reader = guard.as_mut().expect("source prepared");
    while let Some((layer, feature)) = reader.next_feature().expect("pull succeeds") {
        seen.borrow_mut().push((layer, feature.id));
    }
}

#[then("the coordinator hands the stream to the points layer")]
fn stream_handed_to_points(
    #[from(source_cell)] source: &RefCell<Option<Source>>,
    #[from(delivered)] seen: &RefCell<Vec<(usize, i64)>>,
) {
    let guard = source.borrow();
    let reader = guard.as_ref().expect("source prepared");
    assert_eq!(reader.coordinator().current(), Some(0));
    // Lines delivered its single buffered feature before parking.
    assert_eq!(seen.borrow().as_slice(), &[(1, 9)]);
}

#[then("no further upstream input was consumed")]
fn upstream_untouched(#[from(source_cell)] source: &RefCell<Option<Source>>) {
    let guard = source.borrow();
    let reader = guard.as_ref().expect("source prepared");
    assert_eq!(reader.upstream_ref().remaining_chunks(), 1);
}

#[then("pulling the lines layer yields nothing while points stays current")]
fn lines_refused(#[from(source_cell)] source: &RefCell<Option<Source>>) {
    let mut guard = source.borrow_mut();
    let reader = guard.as_mut().expect("source prepared");
    let refused = reader.next_feature_for(1).expect("pull succeeds");
    assert!(refused.is_none());
    assert_eq!(reader.coordinator().current(), Some(0));
}

#[then("both features were delivered and no layer is current")]
fn stream_finished(
    #[from(source_cell)] source: &RefCell<Option<Source>>,
    #[from(delivered)] seen: &RefCell<Vec<(usize, i64)>>,
) {
    let guard = source.borrow();
    let reader = guard.as_ref().expect("source prepared");
    assert_eq!(reader.coordinator().current(), None);
    let mut sorted = seen.borrow().clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![(0, 1), (1, 2)]);
}

#[test]
fn scenario_indices_follow_feature_order() {
    let feature = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/features/interleaved_reading.feature");
    let contents = std::fs::read_to_string(&feature).unwrap_or_else(|err| {
        panic!("failed to read feature file {feature:?}: {err}");
    });
    let titles: Vec<String> = contents
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Scenario: "))
        .map(std::borrow::ToOwned::to_owned)
        .collect();
    let expected = [
        "draining an overfull layer before consuming more input",
        "a non-current layer is refused",
        "finishing the stream",
    ];
    assert_eq!(titles.len(), expected.len());
    for (index, expected_title) in expected.iter().enumerate() {
        assert_eq!(titles.get(index).map(String::as_str), Some(*expected_title));
    }
}

#[scenario(path = "tests/features/interleaved_reading.feature", index = 0)]
fn draining_an_overfull_layer(
    source_cell: RefCell<Option<Source>>,
    delivered: RefCell<Vec<(usize, i64)>>,
) {
    let _ = (source_cell, delivered);
}

#[scenario(path = "tests/features/interleaved_reading.feature", index = 1)]
fn refusing_a_non_current_layer(
    source_cell: RefCell<Option<Source>>,
    delivered: RefCell<Vec<(usize, i64)>>,
) {
    let _ = (source_cell, delivered);
}

#[scenario(path = "tests/features/interleaved_reading.feature", index = 2)]
fn finishing_the_stream(
    source_cell: RefCell<Option<Source>>,
    delivered: RefCell<Vec<(usize, i64)>>,
) {
    let _ = (source_cell, delivered);
}
