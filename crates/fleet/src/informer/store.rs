use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::RwLock;

use super::selector::LabelSelector;
use super::types::DeletedObject;
use super::types::DeploymentEvent;
use super::types::DeploymentRecord;
use super::types::ObjectKey;

#[derive(Debug, Default)]
struct StoreState {
    items: BTreeMap<ObjectKey, Arc<DeploymentRecord>>,
    synced: bool,
}

/// Indexed local mirror of one cluster's deployments.
///
/// Cloning is cheap and every clone shares the same index. Only the owning
/// informer writes; any number of readers may query concurrently and reads
/// never leave the process.
#[derive(Debug, Clone, Default)]
pub struct DeploymentStore {
    state: Arc<RwLock<StoreState>>,
}

impl DeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    ///
    /// Returns `None` when the cached record already has the same resource
    /// version, so duplicate deliveries and resync floods are no-ops.
    pub(crate) fn upsert(&self, record: DeploymentRecord) -> Option<DeploymentEvent> {
        let mut state = self.state.write().expect("poisoned");
        Self::upsert_locked(&mut state, record)
    }

    fn upsert_locked(state: &mut StoreState, record: DeploymentRecord) -> Option<DeploymentEvent> {
        let key = record.key();
        let new = Arc::new(record);

        match state.items.insert(key, new.clone()) {
            Some(old)
                if old.resource_version.is_some()
                    && old.resource_version == new.resource_version =>
            {
                None
            }
            Some(old) => Some(DeploymentEvent::Updated { old, new }),
            None => Some(DeploymentEvent::Added(new)),
        }
    }

    /// Remove a record, returning the delete notification if it was cached.
    pub(crate) fn delete(&self, record: DeploymentRecord) -> Option<DeploymentEvent> {
        let mut state = self.state.write().expect("poisoned");
        state
            .items
            .remove(&record.key())
            .map(|_| DeploymentEvent::Deleted(DeletedObject::Observed(Arc::new(record))))
    }

    /// Replace the whole index with a fresh listing and mark the store synced.
    ///
    /// Cached keys missing from the listing were deleted while the watch was
    /// not looking; they are reported as final-state-unknown deletes carrying
    /// the last cached record.
    pub(crate) fn replace(&self, records: Vec<DeploymentRecord>) -> Vec<DeploymentEvent> {
        let mut state = self.state.write().expect("poisoned");
        let listed: BTreeSet<ObjectKey> = records.iter().map(DeploymentRecord::key).collect();

        let mut events: Vec<DeploymentEvent> = records
            .into_iter()
            .filter_map(|record| Self::upsert_locked(&mut state, record))
            .collect();

        let vanished: Vec<ObjectKey> = state
            .items
            .keys()
            .filter(|key| !listed.contains(*key))
            .cloned()
            .collect();
        for key in vanished {
            if let Some(last_known) = state.items.remove(&key) {
                events.push(DeploymentEvent::Deleted(DeletedObject::FinalStateUnknown {
                    key,
                    last_known,
                }));
            }
        }

        state.synced = true;
        events
    }

    /// Drop every record and forget the previous sync.
    pub(crate) fn clear(&self) {
        let mut state = self.state.write().expect("poisoned");
        state.items.clear();
        state.synced = false;
    }

    pub fn has_synced(&self) -> bool {
        self.state.read().expect("poisoned").synced
    }

    pub fn len(&self) -> usize {
        self.state.read().expect("poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records in `namespace`, or in every namespace when it is empty.
    ///
    /// Results are ordered by namespace then name.
    pub fn list(&self, namespace: &str) -> Vec<Arc<DeploymentRecord>> {
        let state = self.state.read().expect("poisoned");
        state
            .items
            .values()
            .filter(|r| namespace.is_empty() || r.namespace == namespace)
            .cloned()
            .collect()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<DeploymentRecord>> {
        let state = self.state.read().expect("poisoned");
        state.items.get(&ObjectKey::new(namespace, name)).cloned()
    }

    /// Records in `namespace` (empty for all) whose labels match `selector`.
    pub fn list_by_selector(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Vec<Arc<DeploymentRecord>> {
        let state = self.state.read().expect("poisoned");
        state
            .items
            .values()
            .filter(|r| namespace.is_empty() || r.namespace == namespace)
            .filter(|r| selector.matches(&r.labels))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::informer::types::fixtures::deployment;
    use crate::informer::types::fixtures::with_labels;

    fn record(ns: &str, name: &str, replicas: i32, rv: &str) -> DeploymentRecord {
        DeploymentRecord::try_from(&deployment(ns, name, replicas, "app:v1", rv))
            .expect("valid fixture")
    }

    #[test]
    fn clear_forgets_records_and_sync() {
        let store = DeploymentStore::new();
        store.replace(vec![record("web", "d1", 3, "1")]);
        assert!(store.has_synced());

        store.clear();
        assert!(!store.has_synced());
        assert!(store.is_empty());
        assert!(store.get("web", "d1").is_none());
    }

    #[test]
    fn upsert_adds_then_updates() {
        let store = DeploymentStore::new();

        let added = store.upsert(record("web", "d1", 3, "1"));
        assert!(matches!(added, Some(DeploymentEvent::Added(_))));

        let updated = store.upsert(record("web", "d1", 5, "2"));
        match updated {
            Some(DeploymentEvent::Updated { old, new }) => {
                assert_eq!(old.desired_replicas, 3);
                assert_eq!(new.desired_replicas, 5);
            }
            other => panic!("expected update, got {other:?}"),
        }

        assert_eq!(store.len(), 1, "key stays unique");
        assert_eq!(
            store.get("web", "d1").expect("cached").desired_replicas,
            5
        );
    }

    #[test]
    fn unchanged_resource_version_is_a_noop() {
        let store = DeploymentStore::new();
        store.upsert(record("web", "d1", 3, "7"));

        assert_eq!(store.upsert(record("web", "d1", 3, "7")), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn delete_removes_only_cached_records() {
        let store = DeploymentStore::new();
        store.upsert(record("web", "d1", 1, "1"));

        let event = store.delete(record("web", "d1", 1, "2"));
        assert!(matches!(
            event,
            Some(DeploymentEvent::Deleted(DeletedObject::Observed(_)))
        ));
        assert!(store.get("web", "d1").is_none());

        assert_eq!(store.delete(record("web", "d1", 1, "3")), None);
    }

    #[test]
    fn last_notification_wins_for_any_sequence() {
        let store = DeploymentStore::new();
        store.upsert(record("ns", "a", 1, "1"));
        store.upsert(record("ns", "a", 2, "2"));
        store.delete(record("ns", "a", 2, "3"));
        store.upsert(record("ns", "a", 4, "4"));

        assert_eq!(store.get("ns", "a").expect("re-added").desired_replicas, 4);

        store.delete(record("ns", "a", 4, "5"));
        assert!(store.get("ns", "a").is_none());
    }

    #[test]
    fn replace_marks_synced_and_tombstones_missing_keys() {
        let store = DeploymentStore::new();
        assert!(!store.has_synced());

        store.upsert(record("web", "kept", 1, "1"));
        store.upsert(record("web", "gone", 1, "1"));

        let events = store.replace(vec![
            record("web", "kept", 1, "1"),
            record("web", "fresh", 2, "1"),
        ]);

        assert!(store.has_synced());
        assert_eq!(store.len(), 2);
        assert_eq!(events.len(), 2, "no event for the unchanged record");
        assert!(matches!(&events[0], DeploymentEvent::Added(r) if r.name == "fresh"));
        match &events[1] {
            DeploymentEvent::Deleted(deleted @ DeletedObject::FinalStateUnknown { key, .. }) => {
                assert_eq!(key, &ObjectKey::new("web", "gone"));
                assert!(deleted.is_tombstone());
                assert_eq!(deleted.last_known().name, "gone");
            }
            other => panic!("expected tombstone delete, got {other:?}"),
        }
    }

    #[test]
    fn list_filters_by_namespace() {
        let store = DeploymentStore::new();
        store.upsert(record("b", "x", 1, "1"));
        store.upsert(record("a", "y", 1, "1"));
        store.upsert(record("a", "x", 1, "1"));

        let all: Vec<String> = store.list("").iter().map(|r| r.key().to_string()).collect();
        assert_eq!(all, vec!["a/x", "a/y", "b/x"]);

        let only_a: Vec<String> = store.list("a").iter().map(|r| r.name.clone()).collect();
        assert_eq!(only_a, vec!["x", "y"]);

        assert!(store.list("missing").is_empty());
    }

    #[test]
    fn list_by_selector_matches_labels() {
        let store = DeploymentStore::new();
        let prod = with_labels(
            deployment("web", "api", 1, "api:v1", "1"),
            &[("env", "prod"), ("app", "api")],
        );
        let dev = with_labels(
            deployment("web", "api-dev", 1, "api:v1", "1"),
            &[("env", "dev"), ("app", "api")],
        );
        store.upsert(DeploymentRecord::try_from(&prod).expect("record"));
        store.upsert(DeploymentRecord::try_from(&dev).expect("record"));

        let selector: LabelSelector = "app=api,env in (prod)".parse().expect("valid selector");
        let names: Vec<String> = store
            .list_by_selector("", &selector)
            .iter()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(names, vec!["api"]);

        assert!(store.list_by_selector("other", &selector).is_empty());
    }

    #[test]
    fn clones_share_the_same_index() {
        let writer = DeploymentStore::new();
        let reader = writer.clone();
        writer.upsert(record("ns", "shared", 1, "1"));
        assert!(reader.get("ns", "shared").is_some());
    }
}
