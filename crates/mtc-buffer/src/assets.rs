//! The asset buffer: capacity-bounded LRU of assets keyed by asset id
//!
//! "Recently used" means recently updated: an upsert refreshes the entry's
//! position, a removal tombstones in place (the entry stays resolvable for
//! sequence-based consumers until normal eviction reclaims the slot).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use mtc_model::Asset;

pub struct AssetBuffer {
    capacity: usize,
    /// Update order, oldest first
    order: VecDeque<String>,
    by_id: HashMap<String, Arc<Asset>>,
}

impl AssetBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries in store, tombstones included
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Non-tombstoned assets
    pub fn active_count(&self) -> usize {
        self.by_id.values().filter(|a| !a.is_removed()).count()
    }

    /// Upsert; evicts the least-recently-updated entry past capacity.
    /// Returns the evicted asset, if any.
    pub fn add_asset(&mut self, asset: Arc<Asset>) -> Option<Arc<Asset>> {
        let id = asset.asset_id();
        if self.by_id.contains_key(&id) {
            self.touch(&id);
            self.by_id.insert(id, asset);
            return None;
        }

        self.order.push_back(id.clone());
        self.by_id.insert(id, asset);

        if self.by_id.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                let evicted = self.by_id.remove(&oldest);
                debug!(asset_id = %oldest, "evicted least-recently-updated asset");
                return evicted;
            }
        }
        None
    }

    fn touch(&mut self, id: &str) {
        if let Some(position) = self.order.iter().position(|k| k == id) {
            self.order.remove(position);
            self.order.push_back(id.to_string());
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Asset>> {
        self.by_id.get(id).cloned()
    }

    /// Assets in update order, newest first, optionally filtered
    pub fn assets(
        &self,
        device_uuid: Option<&str>,
        asset_type: Option<&str>,
        include_removed: bool,
    ) -> Vec<Arc<Asset>> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.by_id.get(id))
            .filter(|a| include_removed || !a.is_removed())
            .filter(|a| match device_uuid {
                Some(uuid) => a.device_uuid().as_deref() == Some(uuid),
                None => true,
            })
            .filter(|a| match asset_type {
                Some(t) => a.asset_type() == t,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Tombstone a single asset. The entry remains in store.
    pub fn remove_asset(&mut self, id: &str) -> Option<Arc<Asset>> {
        let asset = self.by_id.get(id)?;
        if asset.is_removed() {
            return None;
        }
        asset.set_removed();
        Some(Arc::clone(asset))
    }

    /// Tombstone every matching asset; returns the ones newly removed.
    pub fn remove_all(
        &mut self,
        device_uuid: Option<&str>,
        asset_type: Option<&str>,
        before: Option<DateTime<Utc>>,
    ) -> Vec<Arc<Asset>> {
        let matching: Vec<Arc<Asset>> = self
            .by_id
            .values()
            .filter(|a| !a.is_removed())
            .filter(|a| match device_uuid {
                Some(uuid) => a.device_uuid().as_deref() == Some(uuid),
                None => true,
            })
            .filter(|a| match asset_type {
                Some(t) => a.asset_type() == t,
                None => true,
            })
            .filter(|a| match before {
                Some(bound) => a.timestamp() < bound,
                None => true,
            })
            .cloned()
            .collect();

        for asset in &matching {
            asset.set_removed();
        }
        matching
    }

    /// Non-tombstoned count for (device, type)
    pub fn count_for_device_and_type(&self, device_uuid: &str, asset_type: &str) -> usize {
        self.by_id
            .values()
            .filter(|a| !a.is_removed())
            .filter(|a| a.device_uuid().as_deref() == Some(device_uuid))
            .filter(|a| a.asset_type() == asset_type)
            .count()
    }

    /// Counts per type for one device. Tombstones don't count, but a type
    /// whose assets are all tombstoned still appears with a zero count (the
    /// asset-count maintenance marks those entries removed).
    pub fn counts_by_type_for_device(&self, device_uuid: &str) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for asset in self.by_id.values() {
            if asset.device_uuid().as_deref() != Some(device_uuid) {
                continue;
            }
            let entry = counts.entry(asset.asset_type().to_string()).or_insert(0);
            if !asset.is_removed() {
                *entry += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(id: &str, asset_type: &str, device: &str) -> Arc<Asset> {
        Arc::new(Asset::new(
            id,
            asset_type,
            Some(device.to_string()),
            Utc::now(),
            format!("<{asset_type} assetId='{id}'/>"),
        ))
    }

    #[test]
    fn upsert_and_get() {
        let mut buffer = AssetBuffer::new(4);
        buffer.add_asset(asset("0001", "Part", "000"));
        assert_eq!(buffer.get("0001").unwrap().asset_type(), "Part");
        assert_eq!(buffer.active_count(), 1);

        // upsert replaces, no growth
        buffer.add_asset(asset("0001", "Part", "000"));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn eviction_is_least_recently_updated() {
        let mut buffer = AssetBuffer::new(3);
        buffer.add_asset(asset("a", "Part", "000"));
        buffer.add_asset(asset("b", "Part", "000"));
        buffer.add_asset(asset("c", "Part", "000"));

        // refresh "a" so "b" is now oldest
        buffer.add_asset(asset("a", "Part", "000"));

        let evicted = buffer.add_asset(asset("d", "Part", "000")).unwrap();
        assert_eq!(evicted.asset_id(), "b");
        assert!(buffer.get("b").is_none());
        assert!(buffer.get("a").is_some());
    }

    #[test]
    fn capacity_never_exceeded() {
        let mut buffer = AssetBuffer::new(2);
        for i in 0..10 {
            buffer.add_asset(asset(&format!("id{i}"), "Part", "000"));
        }
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn remove_tombstones_in_place() {
        let mut buffer = AssetBuffer::new(4);
        buffer.add_asset(asset("a", "Part", "000"));

        let removed = buffer.remove_asset("a").unwrap();
        assert!(removed.is_removed());
        // still resolvable, no longer counted
        assert!(buffer.get("a").is_some());
        assert_eq!(buffer.active_count(), 0);

        // second removal is a no-op
        assert!(buffer.remove_asset("a").is_none());
    }

    #[test]
    fn remove_all_filters() {
        let mut buffer = AssetBuffer::new(8);
        buffer.add_asset(asset("a", "Part", "000"));
        buffer.add_asset(asset("b", "Part", "111"));
        buffer.add_asset(asset("c", "CuttingTool", "000"));

        let removed = buffer.remove_all(Some("000"), Some("Part"), None);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].asset_id(), "a");
        assert_eq!(buffer.active_count(), 2);

        let removed = buffer.remove_all(None, None, None);
        assert_eq!(removed.len(), 2);
        assert_eq!(buffer.active_count(), 0);
    }

    #[test]
    fn counts_exclude_tombstones() {
        let mut buffer = AssetBuffer::new(8);
        buffer.add_asset(asset("a", "Part", "000"));
        buffer.add_asset(asset("b", "Part", "000"));
        buffer.add_asset(asset("c", "CuttingTool", "000"));

        assert_eq!(buffer.count_for_device_and_type("000", "Part"), 2);
        buffer.remove_asset("a");
        assert_eq!(buffer.count_for_device_and_type("000", "Part"), 1);

        let counts = buffer.counts_by_type_for_device("000");
        assert_eq!(counts["Part"], 1);
        assert_eq!(counts["CuttingTool"], 1);
        assert!(!counts.contains_key("missing"));

        // a type whose assets are all tombstoned reports zero
        buffer.remove_asset("c");
        let counts = buffer.counts_by_type_for_device("000");
        assert_eq!(counts["CuttingTool"], 0);
    }

    #[test]
    fn listing_is_newest_first() {
        let mut buffer = AssetBuffer::new(8);
        buffer.add_asset(asset("a", "Part", "000"));
        buffer.add_asset(asset("b", "Part", "000"));
        buffer.add_asset(asset("a", "Part", "000")); // refresh

        let listed = buffer.assets(None, None, false);
        assert_eq!(listed[0].asset_id(), "a");
        assert_eq!(listed[1].asset_id(), "b");
    }
}
