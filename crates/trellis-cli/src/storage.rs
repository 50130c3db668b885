//! Database snapshots kept as JSON files, one per snapshot name.

use std::fs;
use std::io;
use std::path::PathBuf;
use trellis::EngineError;
use trellis::services::SnapshotStore;

pub struct FileSnapshotStore {
    base_path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn path(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_path.join(format!("{file}.json"))
    }
}

fn io_error(path: PathBuf) -> impl FnOnce(io::Error) -> EngineError {
    move |source| EngineError::Io { path, source }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, name: &str, snapshot: &serde_json::Value) -> Result<(), EngineError> {
        fs::create_dir_all(&self.base_path).map_err(io_error(self.base_path.clone()))?;
        let path = self.path(name);
        let content = serde_json::to_string_pretty(snapshot)?;
        fs::write(&path, content).map_err(io_error(path.clone()))?;
        log::debug!("saved snapshot `{name}` to {}", path.display());
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<serde_json::Value>, EngineError> {
        let path = self.path(name);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(io_error(path)(error)),
        }
    }

    fn delete(&self, name: &str) -> Result<bool, EngineError> {
        let path = self.path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(io_error(path)(error)),
        }
    }
}
