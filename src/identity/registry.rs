//! Process-wide registry mapping a conversation's identity to its buffer
//! manager.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::buffer::manager::BufferManager;
use crate::config::ProxyConfig;

struct Entry {
    manager: Arc<BufferManager>,
    last_seen: Instant,
}

/// Holds one [`BufferManager`] per `fingerprint:model` key, with TTL-based
/// expiry. Access is guarded by a single lock so concurrent requests for the
/// same key always observe (and share) the same manager.
pub struct ConversationRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
}

impl ConversationRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up the manager for `key`, creating one with the given
    /// `context_window` if it doesn't exist yet.
    pub fn get_or_create(&self, key: &str, model: &str, context_window: u64, config: &ProxyConfig) -> Arc<BufferManager> {
        {
            let mut entries = self.entries.write().unwrap();
            if let Some(entry) = entries.get_mut(key) {
                entry.last_seen = Instant::now();
                return Arc::clone(&entry.manager);
            }

            let manager = Arc::new(BufferManager::new(
                fingerprint_prefix(key),
                model,
                context_window,
                config.checkpoint_threshold,
                config.swap_threshold,
                config.upstream_url.clone(),
                config.compact_trigger_tokens,
            ));
            entries.insert(
                key.to_string(),
                Entry {
                    manager: Arc::clone(&manager),
                    last_seen: Instant::now(),
                },
            );
            manager
        }
    }

    /// Look up a manager whose key starts with `prefix`. Returns `None` if
    /// no entry matches.
    pub fn get_by_prefix(&self, prefix: &str) -> Option<Arc<BufferManager>> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .find(|(key, _)| key.starts_with(prefix))
            .map(|(_, entry)| Arc::clone(&entry.manager))
    }

    /// Remove every entry whose key starts with `prefix`. Returns the
    /// number of entries removed.
    pub fn remove(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write().unwrap();
        let to_remove: Vec<String> = entries.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
        for key in &to_remove {
            entries.remove(key);
        }
        to_remove.len()
    }

    /// Remove every entry whose manager hasn't been touched within the TTL.
    pub fn expire_stale(&self) {
        let mut entries = self.entries.write().unwrap();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.last_seen.elapsed() <= ttl);
    }

    /// A consistent snapshot of all registered keys, for the health and
    /// dashboard endpoints.
    pub fn snapshot_keys(&self) -> Vec<String> {
        self.entries.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn fingerprint_prefix(key: &str) -> String {
    let fingerprint = key.split(':').next().unwrap_or(key);
    fingerprint.chars().take(16).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn test_config() -> ProxyConfig {
        ProxyConfig::parse_from(["compaction-proxy"])
    }

    #[test]
    fn get_or_create_returns_the_same_manager_for_repeat_lookups() {
        let registry = ConversationRegistry::new(Duration::from_secs(7200));
        let config = test_config();
        let a = registry.get_or_create("fp1:model1", "model1", 200_000, &config);
        let b = registry.get_or_create("fp1:model1", "model1", 200_000, &config);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_models_get_independent_managers() {
        let registry = ConversationRegistry::new(Duration::from_secs(7200));
        let config = test_config();
        let a = registry.get_or_create("fp1:model1", "model1", 200_000, &config);
        let b = registry.get_or_create("fp1:model2", "model2", 200_000, &config);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn get_by_prefix_finds_a_matching_entry() {
        let registry = ConversationRegistry::new(Duration::from_secs(7200));
        let config = test_config();
        registry.get_or_create("abcdef1234567890:model1", "model1", 200_000, &config);
        assert!(registry.get_by_prefix("abcdef12").is_some());
        assert!(registry.get_by_prefix("ffffffff").is_none());
    }

    #[test]
    fn remove_deletes_matching_entries_and_reports_count() {
        let registry = ConversationRegistry::new(Duration::from_secs(7200));
        let config = test_config();
        registry.get_or_create("abc:model1", "model1", 200_000, &config);
        registry.get_or_create("abc:model2", "model2", 200_000, &config);
        registry.get_or_create("xyz:model1", "model1", 200_000, &config);
        assert_eq!(registry.remove("abc"), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn expire_stale_drops_entries_past_ttl() {
        let registry = ConversationRegistry::new(Duration::from_millis(0));
        let config = test_config();
        registry.get_or_create("abc:model1", "model1", 200_000, &config);
        std::thread::sleep(Duration::from_millis(5));
        registry.expire_stale();
        assert!(registry.is_empty());
    }
}
