//! Merging of test data for one step invocation.
//!
//! Precedence, lowest to highest: data sources in order, the cyclic data
//! set pick for the iteration, then static data.

use karta_core::types::{ExecutionStepPointer, TestData, TestDataSet};
use std::sync::Arc;

use crate::capability::TestDataSource;

pub fn merge_test_data(
    sources: &[Arc<dyn TestDataSource>],
    static_data: &TestData,
    data_set: &TestDataSet,
    pointer: &ExecutionStepPointer,
) -> TestData {
    let mut merged = TestData::new();
    for source in sources {
        merged.extend(source.get_data(pointer));
    }
    for (key, candidates) in data_set {
        if let Some(value) = pick_cyclic(candidates, pointer.iteration_index) {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged.extend(static_data.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// `candidates[index mod len]`, or `None` for an empty list.
pub fn pick_cyclic<T>(candidates: &[T], index: u64) -> Option<&T> {
    if candidates.is_empty() {
        return None;
    }
    let slot = (index % candidates.len() as u64) as usize;
    candidates.get(slot)
}

/// `base` with every key of `top` laid over it.
pub fn overlay<V: Clone>(
    base: &std::collections::HashMap<String, V>,
    top: &std::collections::HashMap<String, V>,
) -> std::collections::HashMap<String, V> {
    let mut merged = base.clone();
    merged.extend(top.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    struct FixedSource(TestData);

    impl TestDataSource for FixedSource {
        fn get_data(&self, _pointer: &ExecutionStepPointer) -> TestData {
            self.0.clone()
        }
    }

    fn data(pairs: &[(&str, Value)]) -> TestData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn pointer(iteration: i64) -> ExecutionStepPointer {
        ExecutionStepPointer::new("run", "feature", Some("scenario".to_string()), iteration, "step")
    }

    #[test]
    fn static_beats_data_set_beats_sources() {
        let sources: Vec<Arc<dyn TestDataSource>> = vec![
            Arc::new(FixedSource(data(&[("k", json!("source-1")), ("only_source", json!(1))]))),
            Arc::new(FixedSource(data(&[("k", json!("source-2"))]))),
        ];
        let mut data_set = TestDataSet::new();
        data_set.insert("k".to_string(), vec![json!("set")]);
        data_set.insert("only_set".to_string(), vec![json!("set-only")]);

        let merged = merge_test_data(&sources, &TestData::new(), &data_set, &pointer(0));
        assert_eq!(merged["k"], json!("set"));
        assert_eq!(merged["only_source"], json!(1));
        assert_eq!(merged["only_set"], json!("set-only"));

        let merged = merge_test_data(&sources, &data(&[("k", json!("static"))]), &data_set, &pointer(0));
        assert_eq!(merged["k"], json!("static"));

        let merged = merge_test_data(&sources, &TestData::new(), &TestDataSet::new(), &pointer(0));
        assert_eq!(merged["k"], json!("source-2"));
    }

    #[test]
    fn data_set_cycles_by_iteration_and_clamps_negative_index() {
        let mut data_set = TestDataSet::new();
        data_set.insert("v".to_string(), vec![json!("a"), json!("b"), json!("c")]);

        let picks: Vec<Value> = (0..4)
            .map(|i| merge_test_data(&[], &TestData::new(), &data_set, &pointer(i))["v"].clone())
            .collect();
        assert_eq!(picks, vec![json!("a"), json!("b"), json!("c"), json!("a")]);

        let merged = merge_test_data(&[], &TestData::new(), &data_set, &pointer(-5));
        assert_eq!(merged["v"], json!("a"));
    }

    #[test]
    fn empty_candidate_list_is_ignored() {
        let mut data_set = TestDataSet::new();
        data_set.insert("v".to_string(), Vec::new());
        let merged = merge_test_data(&[], &TestData::new(), &data_set, &pointer(3));
        assert!(!merged.contains_key("v"));
    }

    #[test]
    fn overlay_prefers_top() {
        let merged = overlay(&data(&[("a", json!(1)), ("b", json!(1))]), &data(&[("b", json!(2))]));
        assert_eq!(merged["a"], json!(1));
        assert_eq!(merged["b"], json!(2));
    }

    proptest! {
        #[test]
        fn static_value_always_wins(
            key in "[a-z]{1,6}",
            source_value in any::<i64>(),
            set_values in proptest::collection::vec(any::<i64>(), 1..5),
            static_value in any::<i64>(),
            iteration in any::<i64>(),
        ) {
            let sources: Vec<Arc<dyn TestDataSource>> =
                vec![Arc::new(FixedSource(data(&[(key.as_str(), json!(source_value))])))];
            let mut data_set = TestDataSet::new();
            data_set.insert(key.clone(), set_values.iter().map(|v| json!(v)).collect());

            let merged = merge_test_data(
                &sources,
                &data(&[(key.as_str(), json!(static_value))]),
                &data_set,
                &pointer(iteration),
            );
            prop_assert_eq!(&merged[&key], &json!(static_value));

            let without_static = merge_test_data(&sources, &TestData::new(), &data_set, &pointer(iteration));
            let slot = (iteration.max(0) as u64 % set_values.len() as u64) as usize;
            prop_assert_eq!(&without_static[&key], &json!(set_values[slot]));
        }
    }
}
