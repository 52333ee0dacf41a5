//! TTL'd LRU cache for read-endpoint responses.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use lru::LruCache;
use serde_json::Value;

use crate::service::query::QueryParams;

struct Entry {
    stored: Instant,
    ttl: Duration,
    status: StatusCode,
    body: Value,
}

/// Keys are the logical request path plus the sorted query string, so
/// parameter order never splits the cache.
pub struct ResponseCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        ResponseCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn key(path: &str, params: &QueryParams) -> String {
        let query = params.sorted_encoded();
        if query.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, query)
        }
    }

    pub fn get(&self, key: &str) -> Option<(StatusCode, Value)> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if entry.stored.elapsed() < entry.ttl => {
                Some((entry.status, entry.body.clone()))
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, ttl: Duration, status: StatusCode, body: Value) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        entries.put(
            key,
            Entry {
                stored: Instant::now(),
                ttl,
                status,
                body,
            },
        );
    }

    /// Drops every entry under a path prefix; writes call this so
    /// reads never serve rows older than the last mutation.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_sorts_query_params() {
        let a = QueryParams(vec![
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        let b = QueryParams(vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        assert_eq!(ResponseCache::key("/tasks", &a), ResponseCache::key("/tasks", &b));
        assert_eq!(ResponseCache::key("/tasks", &QueryParams(vec![])), "/tasks");
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = ResponseCache::new(4);
        cache.put(
            "/tasks".to_string(),
            Duration::from_secs(0),
            StatusCode::OK,
            json!({"x": 1}),
        );
        assert!(cache.get("/tasks").is_none());

        cache.put(
            "/tasks".to_string(),
            Duration::from_secs(60),
            StatusCode::OK,
            json!({"x": 2}),
        );
        let (status, body) = cache.get("/tasks").unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"x": 2}));
    }

    #[test]
    fn prefix_invalidation_spares_other_slugs() {
        let cache = ResponseCache::new(8);
        let ttl = Duration::from_secs(60);
        cache.put("/tasks".to_string(), ttl, StatusCode::OK, json!(1));
        cache.put("/tasks/3".to_string(), ttl, StatusCode::OK, json!(2));
        cache.put("/lists".to_string(), ttl, StatusCode::OK, json!(3));
        cache.invalidate_prefix("/tasks");
        assert!(cache.get("/tasks").is_none());
        assert!(cache.get("/tasks/3").is_none());
        assert!(cache.get("/lists").is_some());
    }
}
