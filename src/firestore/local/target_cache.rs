use std::collections::{HashMap, HashSet};

use crate::firestore::core::target::{Target, TargetId, TargetIdGenerator};
use crate::firestore::core::types::ListenSequenceNumber;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, DocumentKeySet, SnapshotVersion};
use crate::util::assert::hard_assert;

/// Persisted targets and the documents the backend reported for each.
#[derive(Clone, Debug)]
pub struct MemoryTargetCache {
    targets: HashMap<String, TargetData>,
    last_remote_snapshot_version: SnapshotVersion,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    references: ReferenceSet,
    target_id_generator: TargetIdGenerator,
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self {
            targets: HashMap::new(),
            last_remote_snapshot_version: SnapshotVersion::min(),
            highest_target_id: 0,
            highest_sequence_number: 0,
            references: ReferenceSet::new(),
            target_id_generator: TargetIdGenerator::for_target_cache(),
        }
    }
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn get_last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    pub fn get_highest_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    pub fn allocate_target_id(&mut self) -> TargetId {
        self.highest_target_id = self.target_id_generator.next();
        self.highest_target_id
    }

    pub fn set_targets_metadata(
        &mut self,
        highest_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) {
        if let Some(version) = last_remote_snapshot_version {
            self.last_remote_snapshot_version = version;
        }
        if highest_sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = highest_sequence_number;
        }
    }

    pub fn add_target_data(&mut self, target_data: TargetData) {
        hard_assert(
            !self.targets.contains_key(&target_data.target.canonical_id()),
            0xb0bf,
            "adding a target that already exists",
        );
        self.save_target_data(target_data);
    }

    pub fn update_target_data(&mut self, target_data: TargetData) {
        hard_assert(
            self.targets.contains_key(&target_data.target.canonical_id()),
            0x2b4c,
            "updating a nonexistent target",
        );
        self.save_target_data(target_data);
    }

    /// Removes the target and its matching keys. Returns the keys that were
    /// associated with it.
    pub fn remove_target_data(&mut self, target_data: &TargetData) -> Vec<DocumentKey> {
        hard_assert(!self.targets.is_empty(), 0x5ae1, "removing a target from an empty cache");
        self.targets.remove(&target_data.target.canonical_id());
        self.references.remove_references_for_id(target_data.target_id)
    }

    /// Removes inactive targets at or below `upper_bound`. Returns the ids
    /// of removed targets.
    pub fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &HashSet<TargetId>,
    ) -> Vec<TargetId> {
        let doomed: Vec<(String, TargetId)> = self
            .targets
            .iter()
            .filter(|(_, data)| {
                data.sequence_number <= upper_bound && !active_target_ids.contains(&data.target_id)
            })
            .map(|(canonical_id, data)| (canonical_id.clone(), data.target_id))
            .collect();
        for (canonical_id, target_id) in &doomed {
            self.targets.remove(canonical_id);
            self.references.remove_references_for_id(*target_id);
        }
        doomed.into_iter().map(|(_, target_id)| target_id).collect()
    }

    pub fn get_target_data(&self, target: &Target) -> Option<&TargetData> {
        self.targets.get(&target.canonical_id())
    }

    pub fn add_matching_keys<'a, I>(&mut self, keys: I, target_id: TargetId)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        self.references.add_references(keys, target_id);
    }

    pub fn remove_matching_keys<'a, I>(&mut self, keys: I, target_id: TargetId)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        self.references.remove_references(keys, target_id);
    }

    pub fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) -> Vec<DocumentKey> {
        self.references.remove_references_for_id(target_id)
    }

    pub fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> DocumentKeySet {
        self.references.references_for_id(target_id)
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }

    fn save_target_data(&mut self, target_data: TargetData) {
        let target_id = target_data.target_id;
        if target_id > self.highest_target_id {
            self.target_id_generator = TargetIdGenerator::after(target_id);
            self.highest_target_id = target_id;
        }
        if target_data.sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = target_data.sequence_number;
        }
        self.targets.insert(target_data.target.canonical_id(), target_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::target_data::TargetPurpose;
    use crate::firestore::model::ResourcePath;

    fn target_data(cache: &mut MemoryTargetCache, path: &str, sequence_number: i64) -> TargetData {
        let target = Query::new(ResourcePath::from_string(path).unwrap()).to_target();
        TargetData::new(target, cache.allocate_target_id(), TargetPurpose::Listen, sequence_number)
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn allocates_even_target_ids() {
        let mut cache = MemoryTargetCache::new();
        assert_eq!(cache.allocate_target_id(), 2);
        assert_eq!(cache.allocate_target_id(), 4);
    }

    #[test]
    fn stores_targets_and_matching_keys() {
        let mut cache = MemoryTargetCache::new();
        let data = target_data(&mut cache, "rooms", 10);
        cache.add_target_data(data.clone());
        assert_eq!(cache.get_target_data(&data.target), Some(&data));
        assert_eq!(cache.get_highest_sequence_number(), 10);

        cache.add_matching_keys([key("rooms/a"), key("rooms/b")].iter(), data.target_id);
        assert_eq!(cache.get_matching_keys_for_target_id(data.target_id).len(), 2);
        assert!(cache.contains_key(&key("rooms/a")));

        let removed = cache.remove_target_data(&data);
        assert_eq!(removed.len(), 2);
        assert!(!cache.contains_key(&key("rooms/a")));
        assert_eq!(cache.target_count(), 0);
    }

    #[test]
    fn removes_only_inactive_targets_below_bound() {
        let mut cache = MemoryTargetCache::new();
        let old = target_data(&mut cache, "a", 1);
        let active = target_data(&mut cache, "b", 1);
        let recent = target_data(&mut cache, "c", 9);
        for data in [&old, &active, &recent] {
            cache.add_target_data(data.clone());
        }
        let active_ids: HashSet<TargetId> = [active.target_id].into_iter().collect();
        assert_eq!(cache.remove_targets(5, &active_ids), vec![old.target_id]);
        assert_eq!(cache.target_count(), 2);
    }
}
