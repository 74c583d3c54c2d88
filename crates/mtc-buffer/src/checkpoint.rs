//! Checkpoints: latest-per-data-item snapshots
//!
//! A checkpoint applied with the observations admitted after it reproduces
//! the pointwise latest value at any sequence; that identity is what
//! streaming consumers bootstrap from. Data-set and table observations
//! merge into the checkpointed entry instead of replacing it.

use std::sync::{Arc, Weak};

use ahash::AHashMap;

use mtc_model::{DataItem, Observation};

#[derive(Default, Clone)]
pub struct Checkpoint {
    latest: AHashMap<String, Arc<Observation>>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an observation in. Keeps the merged view for data sets, the
    /// observation itself for everything else.
    pub fn add(&mut self, observation: &Arc<Observation>) {
        let id = observation.data_item_id().to_string();
        let merged = observation.merged_with(self.latest.get(&id));
        self.latest.insert(id, merged);
    }

    pub fn get(&self, data_item_id: &str) -> Option<Arc<Observation>> {
        self.latest.get(data_item_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// All checkpointed observations, ordered by sequence for printing
    pub fn observations(&self) -> Vec<Arc<Observation>> {
        let mut all: Vec<_> = self.latest.values().cloned().collect();
        all.sort_by_key(|obs| obs.sequence());
        all
    }

    /// Drop entries whose data item no longer exists in `map` and rebind the
    /// weak handles of those that survived a device replace.
    pub fn update_data_items(&mut self, map: &AHashMap<String, Weak<DataItem>>) {
        self.latest.retain(|id, observation| {
            match map.get(id).and_then(Weak::upgrade) {
                Some(item) => {
                    observation.rebind_data_item(&item);
                    true
                }
                None => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mtc_model::{DataSet, DataSetEntry, DataSetValue, Value};
    use std::collections::HashMap;

    fn data_item(id: &str, representation: Option<&str>) -> Arc<DataItem> {
        let mut attrs: HashMap<String, String> = [
            ("id".to_string(), id.to_string()),
            ("type".to_string(), "VARIABLE".to_string()),
            ("category".to_string(), "EVENT".to_string()),
        ]
        .into();
        if let Some(r) = representation {
            attrs.insert("representation".to_string(), r.to_string());
        }
        Arc::new(DataItem::make(&attrs).unwrap())
    }

    fn obs(di: &Arc<DataItem>, value: Value, seq: u64) -> Arc<Observation> {
        let observation = Arc::new(Observation::new(di, value, Utc::now()));
        observation.assign_sequence(seq);
        observation
    }

    fn set(entries: &[(&str, i64)]) -> DataSet {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), DataSetEntry::value(DataSetValue::Int(*v))))
            .collect()
    }

    #[test]
    fn keeps_latest_per_item() {
        let a = data_item("a", None);
        let b = data_item("b", None);
        let mut checkpoint = Checkpoint::new();
        checkpoint.add(&obs(&a, Value::Text("1".into()), 1));
        checkpoint.add(&obs(&b, Value::Text("x".into()), 2));
        checkpoint.add(&obs(&a, Value::Text("2".into()), 3));

        assert_eq!(checkpoint.len(), 2);
        assert_eq!(checkpoint.get("a").unwrap().value().to_text(), "2");
        assert_eq!(checkpoint.get("b").unwrap().value().to_text(), "x");
    }

    #[test]
    fn merges_data_sets() {
        let vars = data_item("vars", Some("DATA_SET"));
        let mut checkpoint = Checkpoint::new();
        checkpoint.add(&obs(&vars, Value::DataSet(set(&[("a", 1), ("b", 2)])), 1));
        checkpoint.add(&obs(&vars, Value::DataSet(set(&[("a", 4)])), 2));

        let latest = checkpoint.get("vars").unwrap();
        match latest.value() {
            Value::DataSet(s) => {
                assert_eq!(s["a"].value, Some(DataSetValue::Int(4)));
                assert_eq!(s["b"].value, Some(DataSetValue::Int(2)));
            }
            other => panic!("expected data set, got {other:?}"),
        }
    }

    #[test]
    fn observations_sorted_by_sequence() {
        let a = data_item("a", None);
        let b = data_item("b", None);
        let mut checkpoint = Checkpoint::new();
        checkpoint.add(&obs(&b, Value::Text("x".into()), 5));
        checkpoint.add(&obs(&a, Value::Text("y".into()), 3));

        let all = checkpoint.observations();
        assert_eq!(all[0].data_item_id(), "a");
        assert_eq!(all[1].data_item_id(), "b");
    }

    #[test]
    fn update_data_items_prunes_and_rebinds() {
        let a = data_item("a", None);
        let b = data_item("b", None);
        let mut checkpoint = Checkpoint::new();
        checkpoint.add(&obs(&a, Value::Text("1".into()), 1));
        checkpoint.add(&obs(&b, Value::Text("2".into()), 2));

        let replacement = data_item("a", None);
        let mut map: AHashMap<String, Weak<DataItem>> = AHashMap::new();
        map.insert("a".to_string(), Arc::downgrade(&replacement));

        checkpoint.update_data_items(&map);
        assert_eq!(checkpoint.len(), 1);
        let bound = checkpoint.get("a").unwrap().data_item().unwrap();
        assert!(Arc::ptr_eq(&bound, &replacement));
    }
}
