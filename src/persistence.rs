//! Storage for the last known configuration snapshot.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{event, Level};

const CONFIG_FILE_NAME: &str = "appconfiguration.json";

/// Loads and stores the raw configuration blob.
pub trait ConfigPersistence: Send + Sync {
    fn load(&self) -> Option<Vec<u8>>;

    /// Returns `false` when the blob could not be written.
    fn store(&self, blob: &[u8]) -> bool;
}

/// Keeps the snapshot in `appconfiguration.json` inside a directory.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CONFIG_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigPersistence for FileStore {
    fn load(&self) -> Option<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(data) => Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                event!(
                    Level::ERROR,
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    fn store(&self, blob: &[u8]) -> bool {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                event!(Level::ERROR, "Failed to create {}: {}", parent.display(), e);
                return false;
            }
        }
        // written next to the target, then renamed over it
        let tmp = self.path.with_extension("json.tmp");
        let res = fs::write(&tmp, blob).and_then(|_| fs::rename(&tmp, &self.path));
        match res {
            Ok(_) => true,
            Err(e) => {
                event!(
                    Level::ERROR,
                    "Failed to write {}: {}",
                    self.path.display(),
                    e
                );
                false
            }
        }
    }
}

/// In-process snapshot, used when no directory is configured.
#[derive(Default)]
pub struct MemoryStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: Vec<u8>) -> Self {
        Self {
            blob: Mutex::new(Some(blob)),
        }
    }
}

impl ConfigPersistence for MemoryStore {
    fn load(&self) -> Option<Vec<u8>> {
        match self.blob.lock() {
            Ok(blob) => blob.clone(),
            Err(_) => None,
        }
    }

    fn store(&self, blob: &[u8]) -> bool {
        match self.blob.lock() {
            Ok(mut current) => {
                *current = Some(blob.to_vec());
                true
            }
            Err(_) => false,
        }
    }
}
