//! Helpers for asserting on metrics with a debugging recorder.

use metrics::{SharedString, Unit};
use metrics_util::{
    CompositeKey,
    debugging::{DebugValue, DebuggingRecorder},
};

type Entry = (CompositeKey, Option<Unit>, Option<SharedString>, DebugValue);

/// Everything a [`with_recorder`] run recorded.
///
/// Taking a debugging snapshot resets its counters, so the snapshot is
/// taken once and every query reads the same values.
#[derive(Debug)]
pub struct Recorded(Vec<Entry>);

/// Run `f` with a thread-local debugging recorder and return what it
/// recorded.
pub fn with_recorder<F: FnOnce()>(f: F) -> Recorded {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    metrics::with_local_recorder(&recorder, f);
    Recorded(snapshotter.snapshot().into_vec())
}

/// Sum of the counter `name` across all label sets whose labels include
/// every `(key, value)` pair in `labels`.
#[must_use]
pub fn counter_value(recorded: &Recorded, name: &str, labels: &[(&str, &str)]) -> u64 {
    recorded
        .0
        .iter()
        .filter(|(key, _, _, _)| matches_key(key.key(), name, labels))
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => *count,
            _ => 0,
        })
        .sum()
}

/// Value of the gauge `name`, if it was touched.
#[must_use]
pub fn gauge_value(recorded: &Recorded, name: &str) -> Option<f64> {
    recorded
        .0
        .iter()
        .find(|(key, _, _, _)| key.key().name() == name)
        .and_then(|(_, _, _, value)| match value {
            DebugValue::Gauge(gauge) => Some(gauge.into_inner()),
            _ => None,
        })
}

fn matches_key(key: &metrics::Key, name: &str, labels: &[(&str, &str)]) -> bool {
    key.name() == name
        && labels
            .iter()
            .all(|(k, v)| key.labels().any(|label| label.key() == *k && label.value() == *v))
}
