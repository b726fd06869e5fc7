//! Session Map: a bounded LRU from session id to the deployment last used for
//! it. Grounded in the teacher's `core/cache_manager/manager.rs`, which wraps
//! an `lru::LruCache` in a `parking_lot::RwLock` for a multi-reader,
//! single-writer cache tier.

use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;

/// Default capacity when a [`crate::config::SwitchboardConfig`] doesn't
/// override it.
pub const DEFAULT_CAPACITY: usize = 1024;

pub struct SessionMap {
    inner: RwLock<LruCache<String, String>>,
}

impl SessionMap {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap());
        Self {
            inner: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Looks up the deployment bound to `session_id`, if any. Touches the
    /// entry's recency, so this takes the write lock like `put`.
    pub fn get(&self, session_id: &str) -> Option<String> {
        self.inner.write().get(session_id).cloned()
    }

    /// Binds `session_id` to `deployment_name`, evicting the least-recently
    /// used entry if the map is at capacity.
    pub fn put(&self, session_id: impl Into<String>, deployment_name: impl Into<String>) {
        self.inner.write().put(session_id.into(), deployment_name.into());
    }

    /// Removes a stale binding, e.g. after its deployment fails and failover
    /// picks a different one.
    pub fn evict(&self, session_id: &str) {
        self.inner.write().pop(session_id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_roundtrips() {
        let map = SessionMap::new(2);
        map.put("s1", "d1");
        assert_eq!(map.get("s1"), Some("d1".to_string()));
    }

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let map = SessionMap::new(2);
        map.put("s1", "d1");
        map.put("s2", "d2");
        map.get("s1"); // s1 now most recent
        map.put("s3", "d3"); // evicts s2
        assert_eq!(map.get("s2"), None);
        assert_eq!(map.get("s1"), Some("d1".to_string()));
        assert_eq!(map.get("s3"), Some("d3".to_string()));
    }

    #[test]
    fn evict_removes_binding() {
        let map = SessionMap::new(4);
        map.put("s1", "d1");
        map.evict("s1");
        assert_eq!(map.get("s1"), None);
    }
}
