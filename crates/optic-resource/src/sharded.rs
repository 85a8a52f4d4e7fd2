use std::collections::HashMap;
use std::sync::RwLock;

use crate::id::ResourceId;

const SHARD_COUNT: usize = 16;

/// Id-keyed map split across independently locked shards. Every intercepted
/// call performs at least one lookup here, so the point is that two threads
/// touching unrelated resources almost never contend.
pub(crate) struct Sharded<V> {
    shards: Vec<RwLock<HashMap<ResourceId, V>>>,
}

impl<V> Default for Sharded<V> {
    fn default() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }
}

impl<V> Sharded<V> {
    fn shard(&self, id: ResourceId) -> &RwLock<HashMap<ResourceId, V>> {
        &self.shards[(id.to_raw() as usize) & (SHARD_COUNT - 1)]
    }

    pub fn insert(&self, id: ResourceId, value: V) -> Option<V> {
        self.shard(id).write().unwrap().insert(id, value)
    }

    pub fn remove(&self, id: ResourceId) -> Option<V> {
        self.shard(id).write().unwrap().remove(&id)
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.shard(id).read().unwrap().contains_key(&id)
    }

    pub fn keys(&self) -> Vec<ResourceId> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read().unwrap().keys().copied());
        }
        out
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().unwrap().clear();
        }
    }
}

impl<V: Clone> Sharded<V> {
    pub fn get(&self, id: ResourceId) -> Option<V> {
        self.shard(id).read().unwrap().get(&id).cloned()
    }

    pub fn values(&self) -> Vec<V> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read().unwrap().values().cloned());
        }
        out
    }
}
