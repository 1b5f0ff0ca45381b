//! Storage collaborators and the records persisted through them.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::path::InstructionPath;
use crate::procedure::VariableMap;

/// A place that persists named resources for one instruction path.
pub trait Location: Send + Sync {
    fn describe(&self) -> String;

    fn persist(&self, name: &str, contents: &[u8]) -> Result<()>;

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    fn remove(&self, name: &str) -> Result<()>;

    fn resources(&self) -> Result<Vec<String>>;

    /// Delete every resource, attempting all of them before reporting.
    fn clear(&self) -> Result<()> {
        let mut failures = Vec::new();
        for name in self.resources()? {
            if let Err(err) = self.remove(&name) {
                failures.push(format!("{name}: {err:#}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "failed to clear {} resource(s) at {}: {}",
                failures.len(),
                self.describe(),
                failures.join("; ")
            ))
        }
    }
}

pub trait StorageConfiguration: Send + Sync {
    fn locate_storage(&self, path: &InstructionPath) -> Result<Arc<dyn Location>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionRecord {
    pub path: InstructionPath,
    pub id: String,
    pub executor: String,
    #[serde(default)]
    pub variables: VariableMap,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureRecord {
    pub id: String,
    pub instructions: Vec<InstructionRecord>,
}

pub fn record_name(id: &str) -> String {
    format!("{id}.yaml")
}

pub fn persist_yaml<T: Serialize>(location: &dyn Location, name: &str, value: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(value)
        .with_context(|| format!("failed to serialize '{name}'"))?;
    location
        .persist(name, yaml.as_bytes())
        .with_context(|| format!("failed to persist '{name}' at {}", location.describe()))
}

pub fn load_yaml<T: for<'de> Deserialize<'de>>(
    location: &dyn Location,
    name: &str,
) -> Result<Option<T>> {
    let Some(bytes) = location.read(name)? else {
        return Ok(None);
    };
    let value = serde_yaml::from_slice(&bytes)
        .with_context(|| format!("failed to parse '{name}' at {}", location.describe()))?;
    Ok(Some(value))
}

/// Directory-backed storage: each path segment is a subdirectory of `root`.
#[derive(Debug, Clone)]
pub struct FileSystemStore {
    root: PathBuf,
}

impl FileSystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn directory_for(&self, path: &InstructionPath) -> PathBuf {
        let mut dir = self.root.clone();
        for segment in path.segments() {
            dir.push(segment);
        }
        dir
    }
}

impl StorageConfiguration for FileSystemStore {
    fn locate_storage(&self, path: &InstructionPath) -> Result<Arc<dyn Location>> {
        let dir = self.directory_for(path);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create storage directory '{}'", dir.display()))?;
        Ok(Arc::new(DirectoryLocation { dir }))
    }
}

#[derive(Debug)]
struct DirectoryLocation {
    dir: PathBuf,
}

impl DirectoryLocation {
    fn resource_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return Err(anyhow!("invalid resource name '{name}'"));
        }
        Ok(self.dir.join(name))
    }
}

impl Location for DirectoryLocation {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    fn persist(&self, name: &str, contents: &[u8]) -> Result<()> {
        let path = self.resource_path(name)?;
        fs::write(&path, contents).with_context(|| format!("failed to write '{}'", path.display()))
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resource_path(name)?;
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("failed to read '{}'", path.display()))?;
        Ok(Some(bytes))
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.resource_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove '{}'", path.display())),
        }
    }

    /// Files only; child instruction directories are not resources of this
    /// location.
    fn resources(&self) -> Result<Vec<String>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list '{}'", self.dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// In-memory storage, mostly for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    locations: Mutex<BTreeMap<InstructionPath, Arc<MemoryLocation>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The location at `path`, if anything ever located it.
    pub fn location(&self, path: &InstructionPath) -> Option<Arc<MemoryLocation>> {
        let locations = self
            .locations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locations.get(path).cloned()
    }
}

impl StorageConfiguration for MemoryStore {
    fn locate_storage(&self, path: &InstructionPath) -> Result<Arc<dyn Location>> {
        let mut locations = self
            .locations
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        let location = locations
            .entry(path.clone())
            .or_insert_with(|| {
                Arc::new(MemoryLocation {
                    path: path.clone(),
                    resources: Mutex::new(BTreeMap::new()),
                })
            })
            .clone();
        Ok(location)
    }
}

#[derive(Debug)]
pub struct MemoryLocation {
    path: InstructionPath,
    resources: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryLocation {
    fn resources_lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.resources
            .lock()
            .map_err(|_| anyhow!("memory location {} lock poisoned", self.path))
    }
}

impl Location for MemoryLocation {
    fn describe(&self) -> String {
        format!("memory:{}", self.path)
    }

    fn persist(&self, name: &str, contents: &[u8]) -> Result<()> {
        self.resources_lock()?
            .insert(name.to_string(), contents.to_vec());
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.resources_lock()?.get(name).cloned())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.resources_lock()?.remove(name);
        Ok(())
    }

    fn resources(&self) -> Result<Vec<String>> {
        Ok(self.resources_lock()?.keys().cloned().collect())
    }
}
