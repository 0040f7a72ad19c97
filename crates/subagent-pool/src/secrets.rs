//! Secrets Filter (component C9): per-task allow-list projection from a
//! host-side secret store onto the names a specific task actually needs.
//!
//! Secrets never appear in container env ([`crate::container::container_env`]
//! contains only `SKILLS_PATH`), in the CLI, or in logs — log call sites
//! pass results through [`subagent_protocol::redact_for_log`] first.

use std::collections::{HashMap, HashSet};

use crate::error::PoolError;

/// Host-side store of secret values by name. A real deployment backs this
/// with a vault or similar; [`InMemorySecretStore`] is the test/CLI
/// implementation.
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;

    /// Projects the store down to exactly `required`. Spec §9 open
    /// question, resolved: a missing required name fails the whole request
    /// with a terminal [`PoolError::Validation`] rather than silently
    /// omitting it — a partial secret set reaching a sandboxed worker is a
    /// worse failure mode than refusing the task up front.
    fn filter_for_task(&self, required: &HashSet<String>) -> Result<HashMap<String, String>, PoolError> {
        let mut out = HashMap::with_capacity(required.len());
        for name in required {
            match self.get(name) {
                Some(value) => {
                    out.insert(name.clone(), value);
                }
                None => {
                    return Err(PoolError::Validation(format!("missing required secret: {name}")));
                }
            }
        }
        Ok(out)
    }
}

/// In-memory `SecretStore`, used by tests and the CLI's `--secret name=value`
/// flags.
#[derive(Default)]
pub struct InMemorySecretStore {
    values: HashMap<String, String>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }
}

impl SecretStore for InMemorySecretStore {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_down_to_required_names_only() {
        let mut store = InMemorySecretStore::new();
        store.insert("API_KEY", "sk-abc");
        store.insert("UNRELATED", "nope");

        let required: HashSet<String> = ["API_KEY".to_string()].into_iter().collect();
        let filtered = store.filter_for_task(&required).expect("present");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("API_KEY"), Some(&"sk-abc".to_string()));
    }

    #[test]
    fn missing_required_secret_fails_the_request() {
        let store = InMemorySecretStore::new();
        let required: HashSet<String> = ["MISSING".to_string()].into_iter().collect();
        let err = store.filter_for_task(&required).expect_err("must fail");
        match err {
            PoolError::Validation(msg) => assert!(msg.contains("MISSING")),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn empty_requirement_set_yields_empty_map() {
        let store = InMemorySecretStore::new();
        let filtered = store.filter_for_task(&HashSet::new()).expect("empty ok");
        assert!(filtered.is_empty());
    }
}
