use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::BaseStorage;
use crate::errors::{Result, VibeError};

const STORAGE_VERSION: i32 = 1;

/// JSON file holding a versioned key/value mapping.
///
/// Writes go to a sibling temporary file first and are renamed into place,
/// so a crash never leaves a half-written mapping behind.
pub struct FileStorage<K, V>
where
    K: Ord,
{
    label: String,
    path: PathBuf,
    modified: Option<SystemTime>,
    dirty: bool,
    data: FileStorageData<K, V>,
}

#[derive(Serialize, Deserialize)]
struct FileStorageData<K, V>
where
    K: Ord,
{
    version: i32,
    entries: BTreeMap<K, V>,
}

impl<K, V> FileStorage<K, V>
where
    K: Ord + Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    /// Create a storage with a diagnostic label. Nothing is read yet.
    pub fn new(label: impl Into<String>, path: &Path) -> Self {
        Self {
            label: label.into(),
            path: PathBuf::from(path),
            modified: None,
            dirty: false,
            data: FileStorageData {
                version: STORAGE_VERSION,
                entries: BTreeMap::new(),
            },
        }
    }

    /// Create and immediately load whatever is on disk.
    pub fn load(label: impl Into<String>, path: &Path) -> Result<Self> {
        let mut storage = Self::new(label, path);
        storage.read_fs()?;
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.data.entries.get(key)
    }

    /// Keep only the entries matching `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        let before = self.data.entries.len();
        self.data.entries.retain(|k, v| keep(k, v));
        if self.data.entries.len() != before {
            self.dirty = true;
        }
    }

    pub fn clear(&mut self) {
        if !self.data.entries.is_empty() {
            self.data.entries.clear();
            self.dirty = true;
        }
    }

    fn storage_error(&self, message: impl Into<String>) -> VibeError {
        VibeError::Storage(self.label.clone(), message.into())
    }
}

impl<K, V> BaseStorage<K, V> for FileStorage<K, V>
where
    K: Ord + Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    fn set(&mut self, key: K, value: V) {
        self.data.entries.insert(key, value);
        self.dirty = true;
    }

    fn remove(&mut self, id: &K) -> Result<()> {
        self.data
            .entries
            .remove(id)
            .ok_or_else(|| self.storage_error("Key not found"))?;
        self.dirty = true;
        Ok(())
    }

    fn needs_syncing(&self) -> Result<bool> {
        if self.dirty {
            return Ok(true);
        }
        match fs::metadata(&self.path) {
            Ok(metadata) => Ok(Some(metadata.modified()?) != self.modified),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(self.modified.is_some())
            }
            Err(e) => Err(self.storage_error(e.to_string())),
        }
    }

    fn read_fs(&mut self) -> Result<&BTreeMap<K, V>> {
        if !self.path.exists() {
            log::debug!("{}: no file at {:?} yet", self.label, self.path);
            self.data.entries.clear();
            self.modified = None;
            self.dirty = false;
            return Ok(&self.data.entries);
        }

        let file = File::open(&self.path)?;
        let data: FileStorageData<K, V> = serde_json::from_reader(file)
            .map_err(|err| self.storage_error(err.to_string()))?;
        if data.version != STORAGE_VERSION {
            return Err(self.storage_error(format!(
                "Storage version mismatch: expected {}, got {}",
                STORAGE_VERSION, data.version
            )));
        }

        self.data = data;
        self.modified = Some(fs::metadata(&self.path)?.modified()?);
        self.dirty = false;
        log::debug!(
            "{}: {} entries have been read",
            self.label,
            self.data.entries.len()
        );
        Ok(&self.data.entries)
    }

    fn write_fs(&mut self) -> Result<()> {
        let parent_dir = self
            .path
            .parent()
            .ok_or_else(|| self.storage_error("Failed to get parent directory"))?;
        fs::create_dir_all(parent_dir)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, &self.data)
                .map_err(|err| self.storage_error(err.to_string()))?;
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;

        self.modified = Some(fs::metadata(&self.path)?.modified()?);
        self.dirty = false;
        log::info!(
            "{}: {} entries have been written",
            self.label,
            self.data.entries.len()
        );
        Ok(())
    }

    fn erase(&self) -> Result<()> {
        fs::remove_file(&self.path)
            .map_err(|err| self.storage_error(err.to_string()))
    }
}

impl<K, V> AsRef<BTreeMap<K, V>> for FileStorage<K, V>
where
    K: Ord,
{
    fn as_ref(&self) -> &BTreeMap<K, V> {
        &self.data.entries
    }
}
