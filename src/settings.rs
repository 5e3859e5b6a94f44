// Key/value settings surface
// Persisted host state is owned by external collaborators; the core only
// reads a few keys through this interface and never writes storage itself.

use std::collections::HashMap;
use std::sync::Mutex;

/// Keys the core reads on behalf of its collaborators.
pub mod keys {
    /// Explicit adb path override.
    pub const ADB_PATH: &str = "adb_path";
    /// Comma-separated list of known wireless hosts (`ip` or `ip:port`).
    pub const WIRELESS_HOSTS: &str = "wireless_hosts";
    /// Whether known wireless hosts are re-connected on startup.
    pub const AUTO_RECONNECT: &str = "auto_reconnect";
}

/// Simple string key/value settings store. Implemented by the host
/// application over whatever persistence it uses.
pub trait Settings: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

/// In-memory implementation, used in tests and by hosts without persistence.
#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Settings for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}
