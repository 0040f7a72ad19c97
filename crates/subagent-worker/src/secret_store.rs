//! Process-local secret store (spec §4.7/§9): installed once per in-flight
//! request, cleared unconditionally on completion, including error paths.
//! Global by necessity — the worker handles one task at a time — but its
//! lifecycle is tied strictly to a single request, never left populated
//! across requests.

use std::collections::HashMap;
use std::sync::Mutex;

static STORE: Mutex<Option<HashMap<String, String>>> = Mutex::new(None);

/// Installs `secrets` for the duration of the in-flight task.
pub fn set_all(secrets: HashMap<String, String>) {
    *STORE.lock().expect("secret store mutex poisoned") = Some(secrets);
}

/// Reads a secret installed by [`set_all`], if any.
pub fn get(name: &str) -> Option<String> {
    STORE
        .lock()
        .expect("secret store mutex poisoned")
        .as_ref()
        .and_then(|m| m.get(name).cloned())
}

/// Clears the store. Must be called unconditionally at the end of every
/// request, regardless of success or failure.
pub fn clear() {
    *STORE.lock().expect("secret store mutex poisoned") = None;
}
