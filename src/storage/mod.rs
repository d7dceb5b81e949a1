//! Small on-disk key/value stores backing cooldowns, encounter history and
//! engine settings.

use std::collections::BTreeMap;

use crate::errors::Result;

mod file_storage;

pub use file_storage::FileStorage;

pub const COOLDOWNS_FILE: &str = "cooldowns.json";
pub const HISTORY_FILE: &str = "history.json";
pub const SETTINGS_FILE: &str = "settings.json";

pub trait BaseStorage<K, V>: AsRef<BTreeMap<K, V>> {
    /// Create or update an entry in the internal mapping.
    fn set(&mut self, id: K, value: V);

    /// Remove an entry from the internal mapping.
    fn remove(&mut self, id: &K) -> Result<()>;

    /// Whether the in-memory mapping and the file on disk have diverged.
    fn needs_syncing(&self) -> Result<bool>;

    /// Load the mapping from disk, replacing the in-memory one.
    /// A missing file reads as an empty mapping.
    fn read_fs(&mut self) -> Result<&BTreeMap<K, V>>;

    /// Persist the in-memory mapping.
    fn write_fs(&mut self) -> Result<()>;

    /// Remove the persisted file.
    fn erase(&self) -> Result<()>;
}
