// Tool Output Cache
// Shared in-memory cache of tool outputs keyed by tool identity and resolved inputs

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// A cached tool output and the node run that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct CachedOutput {
    pub output: Value,
    pub run_id: String,
}

/// Output cache shared by every line of a run, held behind an `Arc`.
///
/// Writes for one key always carry the same value, so concurrent misses may
/// both call the tool and the last writer wins.
#[derive(Debug, Default)]
pub struct ToolCache {
    entries: RwLock<HashMap<String, CachedOutput>>,
}

impl ToolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the cache key: tool identity plus canonical JSON of the inputs
    pub fn key(tool: &str, inputs: &BTreeMap<String, Value>) -> String {
        // serde_json maps are ordered, so nested objects serialize canonically too
        let canonical = Value::Object(
            inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        format!("{}@{}", tool, canonical)
    }

    pub async fn get(&self, key: &str) -> Option<CachedOutput> {
        let entries = self.entries.read().await;
        entries.get(key).cloned()
    }

    pub async fn insert(&self, key: String, output: CachedOutput) {
        let mut entries = self.entries.write().await;
        entries.insert(key, output);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_key_is_order_independent() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();

        assert_eq!(
            ToolCache::key("llm", &inputs(&[("opts", a)])),
            ToolCache::key("llm", &inputs(&[("opts", b)]))
        );
    }

    #[test]
    fn test_key_includes_tool_identity() {
        let args = inputs(&[("x", json!(3))]);
        assert_ne!(ToolCache::key("double", &args), ToolCache::key("square", &args));
        assert_eq!(ToolCache::key("double", &args), r#"double@{"x":3}"#);
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let cache = ToolCache::new();
        assert!(cache.is_empty().await);

        let key = ToolCache::key("double", &inputs(&[("x", json!(3))]));
        cache
            .insert(
                key.clone(),
                CachedOutput {
                    output: json!(6),
                    run_id: "run_double_0".to_string(),
                },
            )
            .await;

        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.output, json!(6));
        assert_eq!(hit.run_id, "run_double_0");
        assert_eq!(cache.len().await, 1);

        cache.clear().await;
        assert!(cache.get(&key).await.is_none());
    }
}
