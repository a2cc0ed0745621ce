//! Idempotency cache for action results.
//!
//! Keys are `sha256(run_id ":" node_id ":" digest(rendered_args))`. A hit
//! means the invoker already succeeded for identical arguments: the cached
//! slim result is replayed and no external call is made. This is the guard
//! that makes lease takeover and loop re-dispatch safe.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

struct Entry {
    value: Value,
    expires_at: DateTime<Utc>,
}

/// Process-wide TTL cache of slim action results.
pub struct IdempotencyCache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: chrono::Duration,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.expires_at > Utc::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &str, value: Value) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Utc::now() + self.ttl,
            },
        );
    }

    /// Drop expired entries; called opportunistically by long-lived owners.
    pub fn purge_expired(&self) {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Node-local idempotency key for one dispatch of an action.
pub fn action_idem_key(run_id: &str, node_id: &str, rendered_args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(b":");
    hasher.update(node_id.as_bytes());
    hasher.update(b":");
    hasher.update(args_digest(rendered_args).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Digest of rendered arguments over a canonical (key-sorted) encoding.
pub fn args_digest(args: &Value) -> String {
    let mut hasher = Sha256::new();
    write_canonical(args, &mut hasher);
    format!("{:x}", hasher.finalize())
}

fn write_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update(key.as_bytes());
                hasher.update(b"=");
                write_canonical(&map[key], hasher);
                hasher.update(b";");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                write_canonical(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        other => hasher.update(other.to_string().as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(args_digest(&a), args_digest(&b));
    }

    #[test]
    fn digest_distinguishes_values() {
        assert_ne!(args_digest(&json!({"a": 1})), args_digest(&json!({"a": 2})));
        assert_ne!(args_digest(&json!([1, 2])), args_digest(&json!([2, 1])));
    }

    #[test]
    fn key_depends_on_run_node_and_args() {
        let args = json!({"to": "x@example.com"});
        let k1 = action_idem_key("run-1", "a1", &args);
        let k2 = action_idem_key("run-1", "a2", &args);
        let k3 = action_idem_key("run-2", "a1", &args);
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1, action_idem_key("run-1", "a1", &args));
    }

    #[test]
    fn cache_round_trip_and_expiry() {
        let cache = IdempotencyCache::new(Duration::from_secs(60));
        assert!(cache.get("k").is_none());
        cache.put("k", json!({"id": "x"}));
        assert_eq!(cache.get("k"), Some(json!({"id": "x"})));

        let expired = IdempotencyCache::new(Duration::from_secs(0));
        expired.put("k", json!(1));
        assert!(expired.get("k").is_none());
    }
}
