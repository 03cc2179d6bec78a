use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use traced_proto::prelude::Value;

/// Prefix of environment variables imported by [`ConfigStore::load_env`].
pub const ENV_PREFIX: &str = "TRACED_";

/// Ordered key-value configuration store.
///
/// Keys are dotted paths such as `traced.sample_rate`. A store is an
/// ordinary value: build one per tracer (or per test) and pass it to
/// [`TracerConfig::from_store`](super::TracerConfig::from_store).
#[derive(Debug, Default)]
pub struct ConfigStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Value>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a configuration value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    /// Set a configuration value, replacing any previous one.
    pub fn set<T: Into<Value>>(&self, key: &str, value: T) {
        self.write().insert(key.to_string(), value.into());
    }

    /// Get a configuration value as string.
    ///
    /// Text is returned as is; every other value uses its JSON rendering.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).map(|value| match value {
            Value::Text(s) => s,
            other => other.to_string(),
        })
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Int(i) => Some(i as f64),
            Value::UInt(u) => Some(u as f64),
            Value::Float(f) => Some(f),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::Int(i) => u64::try_from(i).ok(),
            Value::UInt(u) => Some(u),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Remove a configuration value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.write().remove(key)
    }

    /// Check if a key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// Get all configuration keys, in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Get all configuration entries.
    pub fn all(&self) -> BTreeMap<String, Value> {
        self.read().clone()
    }

    /// Clear all configuration.
    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Get configuration entries with a prefix.
    ///
    /// This is useful for getting all configuration for a specific namespace
    /// (e.g., all "traced.retry_*" settings).
    pub fn get_with_prefix(&self, prefix: &str) -> BTreeMap<String, Value> {
        self.read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Remove configuration entries with a prefix and return how many were
    /// removed.
    pub fn remove_with_prefix(&self, prefix: &str) -> usize {
        let mut store = self.write();
        let keys_to_remove: Vec<String> = store
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &keys_to_remove {
            store.remove(key);
        }

        keys_to_remove.len()
    }

    /// Imports `TRACED_*` environment variables.
    ///
    /// `TRACED_SAMPLE_RATE=0.5` becomes `traced.sample_rate = 0.5`.
    pub fn load_env(&self) -> usize {
        self.load_vars(std::env::vars())
    }

    /// Imports `TRACED_*` pairs from any source of variables.
    pub fn load_vars<I>(&self, vars: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut loaded = 0;
        for (name, raw) in vars {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let key = format!("traced.{}", rest.to_ascii_lowercase());
            log::debug!("config {key} loaded from {name}");
            self.set(&key, parse_scalar(&raw));
            loaded += 1;
        }
        loaded
    }
}

fn parse_scalar(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Text(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let store = ConfigStore::new();
        store.set("test.key1", "value1");
        store.set("test.key2", 42i64);
        store.set("test.key3", true);

        assert_eq!(store.get("test.key1"), Some(Value::Text("value1".into())));
        assert_eq!(store.get_str("test.key1"), Some("value1".to_string()));
        assert_eq!(store.get_str("test.key2"), Some("42".to_string()));
        assert_eq!(store.get_str("test.key3"), Some("true".to_string()));
        assert_eq!(store.get_u64("test.key2"), Some(42));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn test_remove_and_contains() {
        let store = ConfigStore::new();
        store.set("a", 1i64);
        assert!(store.contains_key("a"));
        assert_eq!(store.remove("a"), Some(Value::Int(1)));
        assert!(!store.contains_key("a"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_prefix_operations() {
        let store = ConfigStore::new();
        store.set("traced.retry_max_attempts", 3i64);
        store.set("traced.retry_max_backoff_ms", 100i64);
        store.set("traced.sample_rate", 0.5);
        store.set("other.key", "x");

        let retry = store.get_with_prefix("traced.retry_");
        assert_eq!(retry.len(), 2);
        assert!(retry.contains_key("traced.retry_max_attempts"));

        assert_eq!(store.remove_with_prefix("traced."), 3);
        assert_eq!(store.keys(), vec!["other.key".to_string()]);
        store.clear();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_instances_are_isolated() {
        let a = ConfigStore::new();
        let b = ConfigStore::new();
        a.set("k", "v");
        assert!(b.get("k").is_none());
    }

    #[test]
    fn test_load_vars_maps_prefix_and_types() {
        let store = ConfigStore::new();
        let loaded = store.load_vars(vec![
            ("TRACED_SAMPLE_RATE".to_string(), "0.25".to_string()),
            ("TRACED_SEED".to_string(), "17".to_string()),
            ("TRACED_STORE_URL".to_string(), "sled:///tmp/t".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ]);
        assert_eq!(loaded, 3);
        assert_eq!(store.get_f64("traced.sample_rate"), Some(0.25));
        assert_eq!(store.get("traced.seed"), Some(Value::Int(17)));
        assert_eq!(
            store.get_str("traced.store_url").as_deref(),
            Some("sled:///tmp/t")
        );
        assert!(!store.contains_key("traced.home"));
    }
}
