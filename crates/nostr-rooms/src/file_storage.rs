use crate::{Error, Result, StorageAdapter};
use std::fs;
use std::path::{Path, PathBuf};

/// Stores each key as a JSON file. Key segments separated by `/` become
/// nested directories, so `v1/room-keys/<room>/1` lands in
/// `<base>/v1/room-keys/<room>/1.json`.
pub struct FileStorageAdapter {
    base_path: PathBuf,
}

impl FileStorageAdapter {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)
            .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        let Some((last, dirs)) = segments.split_last() else {
            return self.base_path.join("_.json");
        };
        for dir in dirs {
            path.push(sanitize(dir));
        }
        path.push(format!("{}.json", sanitize(last)));
        path
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::Storage(format!("Failed to read directory: {}", e))),
        };

        for entry in entries {
            let entry =
                entry.map_err(|e| Error::Storage(format!("Failed to read dir entry: {}", e)))?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, prefix, out)?;
                continue;
            }

            let Some(key) = self.path_to_key(&path) else {
                continue;
            };
            if key.starts_with(prefix) {
                out.push(key);
            }
        }
        Ok(())
    }

    fn path_to_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_path).ok()?;
        let relative = relative.to_str()?.strip_suffix(".json")?;
        Some(relative.replace(std::path::MAIN_SEPARATOR, "/"))
    }
}

fn sanitize(segment: &str) -> String {
    segment.replace(['\\', ':', '.'], "_")
}

impl StorageAdapter for FileStorageAdapter {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.key_to_path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read file: {}", e))),
        }
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        let path = self.key_to_path(key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create parent dir: {}", e)))?;
        }

        // Write then rename so a crash never leaves a torn value behind.
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, value)
            .map_err(|e| Error::Storage(format!("Failed to write file: {}", e)))?;
        fs::rename(&temp_path, &path)
            .map_err(|e| Error::Storage(format!("Failed to move file: {}", e)))?;

        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_to_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to delete file: {}", e))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.base_path, prefix, &mut keys)?;
        keys.sort();
        Ok(keys)
    }
}
