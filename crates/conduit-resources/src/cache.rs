use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use conduit_events::Bus;
use conduit_topics as topics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

/// Resource lists held by the client-side data layer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceList {
    McpServers,
    CredentialModels,
    Documents,
}

impl ResourceList {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceList::McpServers => "mcp-servers",
            ResourceList::CredentialModels => "credential-models",
            ResourceList::Documents => "documents",
        }
    }
}

impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Saved copy of one list, taken before an optimistic write.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheSnapshot {
    pub list: ResourceList,
    /// `None` when the list was not cached at all.
    pub entries: Option<BTreeMap<String, Value>>,
}

/// Client-side cache of resource lists.
///
/// `invalidate` is fire-and-forget: it marks the list stale and asks the
/// data layer to refetch; it never blocks on the refetch.
pub trait ResourceCache: Send + Sync {
    fn invalidate(&self, list: ResourceList);
    fn snapshot(&self, list: ResourceList) -> CacheSnapshot;
    fn restore(&self, snapshot: CacheSnapshot);
    fn upsert(&self, list: ResourceList, id: &str, value: Value);
    fn get(&self, list: ResourceList, id: &str) -> Option<Value>;
}

#[derive(Default)]
struct CacheInner {
    lists: HashMap<ResourceList, BTreeMap<String, Value>>,
    invalidations: HashMap<ResourceList, usize>,
}

/// In-process `ResourceCache` that announces invalidations on the bus.
pub struct MemoryCache {
    inner: Mutex<CacheInner>,
    bus: Option<Bus>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            bus: None,
        }
    }

    pub fn with_bus(bus: Bus) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            bus: Some(bus),
        }
    }

    /// How many times `list` has been invalidated.
    pub fn invalidations(&self, list: ResourceList) -> usize {
        self.inner
            .lock()
            .invalidations
            .get(&list)
            .copied()
            .unwrap_or(0)
    }

    pub fn entries(&self, list: ResourceList) -> BTreeMap<String, Value> {
        self.inner
            .lock()
            .lists
            .get(&list)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceCache for MemoryCache {
    fn invalidate(&self, list: ResourceList) {
        *self.inner.lock().invalidations.entry(list).or_default() += 1;
        debug!(target: "conduit::cache", list = list.as_str(), "list invalidated");
        if let Some(bus) = &self.bus {
            bus.publish(topics::TOPIC_RESOURCES_INVALIDATED, &json!({"list": list}));
        }
    }

    fn snapshot(&self, list: ResourceList) -> CacheSnapshot {
        CacheSnapshot {
            list,
            entries: self.inner.lock().lists.get(&list).cloned(),
        }
    }

    fn restore(&self, snapshot: CacheSnapshot) {
        let mut inner = self.inner.lock();
        match snapshot.entries {
            Some(entries) => {
                inner.lists.insert(snapshot.list, entries);
            }
            None => {
                inner.lists.remove(&snapshot.list);
            }
        }
    }

    fn upsert(&self, list: ResourceList, id: &str, value: Value) {
        self.inner
            .lock()
            .lists
            .entry(list)
            .or_default()
            .insert(id.to_string(), value);
    }

    fn get(&self, list: ResourceList, id: &str) -> Option<Value> {
        self.inner.lock().lists.get(&list)?.get(id).cloned()
    }
}

/// Optimistic insert, then either confirm with the server record or roll
/// back to the snapshot taken before the insert.
#[must_use = "an optimistic commit must be confirmed or rolled back"]
pub struct OptimisticCommit {
    cache: Arc<dyn ResourceCache>,
    list: ResourceList,
    id: String,
    before: CacheSnapshot,
    bus: Option<Bus>,
}

impl OptimisticCommit {
    pub fn begin(
        cache: Arc<dyn ResourceCache>,
        list: ResourceList,
        id: impl Into<String>,
        optimistic: Value,
    ) -> Self {
        let id = id.into();
        let before = cache.snapshot(list);
        cache.upsert(list, &id, optimistic);
        debug!(target: "conduit::cache", list = list.as_str(), id = %id, "optimistic insert");
        Self {
            cache,
            list,
            id,
            before,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replaces the optimistic entry with the confirmed record.
    pub fn confirm(self, confirmed: Value) {
        self.cache.upsert(self.list, &self.id, confirmed);
        self.cache.invalidate(self.list);
    }

    pub fn rollback(self) {
        info!(
            target: "conduit::cache",
            list = self.list.as_str(),
            id = %self.id,
            "rolling back optimistic insert"
        );
        let list = self.list;
        self.cache.restore(self.before);
        if let Some(bus) = &self.bus {
            bus.publish(
                topics::TOPIC_RESOURCES_ROLLED_BACK,
                &json!({"list": list, "id": self.id}),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_replaces_optimistic_value_and_invalidates() {
        let cache = Arc::new(MemoryCache::new());
        let commit = OptimisticCommit::begin(
            cache.clone(),
            ResourceList::CredentialModels,
            "llama3.2",
            json!({"name": "llama3.2", "pending": true}),
        );
        assert_eq!(
            cache.get(ResourceList::CredentialModels, "llama3.2"),
            Some(json!({"name": "llama3.2", "pending": true}))
        );
        commit.confirm(json!({"name": "llama3.2"}));
        assert_eq!(
            cache.get(ResourceList::CredentialModels, "llama3.2"),
            Some(json!({"name": "llama3.2"}))
        );
        assert_eq!(cache.invalidations(ResourceList::CredentialModels), 1);
    }

    #[test]
    fn rollback_restores_previous_entries() {
        let bus = Bus::new_with_replay(8, 8);
        let cache = Arc::new(MemoryCache::new());
        cache.upsert(ResourceList::CredentialModels, "phi", json!({"name": "phi"}));

        let commit = OptimisticCommit::begin(
            cache.clone(),
            ResourceList::CredentialModels,
            "qwen",
            json!({"name": "qwen"}),
        )
        .with_bus(bus.clone());
        commit.rollback();

        let entries = cache.entries(ResourceList::CredentialModels);
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("phi"));
        assert_eq!(
            bus.replay(Some(topics::TOPIC_RESOURCES_ROLLED_BACK)).len(),
            1
        );
    }

    #[test]
    fn rollback_of_uncached_list_removes_it() {
        let cache = Arc::new(MemoryCache::new());
        OptimisticCommit::begin(cache.clone(), ResourceList::Documents, "d", json!({}))
            .rollback();
        assert!(cache.entries(ResourceList::Documents).is_empty());
        assert_eq!(cache.snapshot(ResourceList::Documents).entries, None);
    }

    #[test]
    fn invalidation_is_published() {
        let bus = Bus::new_with_replay(8, 8);
        let cache = MemoryCache::with_bus(bus.clone());
        cache.invalidate(ResourceList::Documents);
        let events = bus.replay(Some(topics::TOPIC_RESOURCES_INVALIDATED));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["list"], "documents");
    }
}
