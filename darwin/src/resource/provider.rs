use crate::common::PATH_SEPARATOR;
use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use crate::resource::classifier::sort_resource_paths;
use crate::script::tokenize;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Source of migration scripts for one component.
///
/// Resources are addressed as `<platform>/<file name>`. Listing returns the
/// paths of one platform, ordered by embedded version and then by name.
pub trait ResourceProvider: Send + Sync {
    /// Lists the resource paths available for `platform`, sorted.
    fn list_sorted(&self, platform: &str) -> DarwinResult<Vec<String>>;

    /// Reads the full text of the resource at `path`.
    fn read_text(&self, path: &str) -> DarwinResult<String>;

    /// Reads and splits the resource at `path` into statements.
    fn tokenize(&self, path: &str) -> DarwinResult<Vec<String>> {
        let text = self.read_text(path)?;
        tokenize(&text).map_err(|e| {
            DarwinError::new_with_cause(
                &format!("Failed to split resource {} into statements", path),
                ErrorKind::StatementFormat,
                e,
            )
        })
    }
}

/// Serves `*.sql` files from `<root>/<platform>/`.
#[derive(Debug, Clone)]
pub struct DirectoryResourceProvider {
    root: PathBuf,
}

impl DirectoryResourceProvider {
    pub fn new<P: AsRef<Path>>(root: P) -> DirectoryResourceProvider {
        DirectoryResourceProvider {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> DarwinResult<PathBuf> {
        let mut resolved = self.root.clone();
        for segment in path.split(PATH_SEPARATOR) {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if segment == ".." {
                return Err(DarwinError::new(
                    &format!("Resource path '{}' escapes the resource root", path),
                    ErrorKind::InvalidOperation,
                ));
            }
            resolved.push(segment);
        }
        Ok(resolved)
    }
}

impl ResourceProvider for DirectoryResourceProvider {
    fn list_sorted(&self, platform: &str) -> DarwinResult<Vec<String>> {
        let directory = self.root.join(platform);
        if !directory.is_dir() {
            log::debug!("No resource directory for platform {} under {:?}", platform, self.root);
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                paths.push(format!("{}{}{}", platform, PATH_SEPARATOR, name));
            } else {
                log::warn!("Skipping resource with non UTF-8 name in {:?}", directory);
            }
        }
        Ok(sort_resource_paths(paths))
    }

    fn read_text(&self, path: &str) -> DarwinResult<String> {
        let file = self.resolve(path)?;
        fs::read_to_string(&file).map_err(|e| {
            DarwinError::new_with_cause(
                &format!("Failed to read resource {}", path),
                ErrorKind::IOError,
                e.into(),
            )
        })
    }
}

/// Keeps resources in memory.
///
/// Used for the bundled bookkeeping scripts, and handy in tests where scripts
/// are added or corrected between migration runs.
#[derive(Clone, Default)]
pub struct MemoryResourceProvider {
    resources: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryResourceProvider {
    pub fn new() -> MemoryResourceProvider {
        MemoryResourceProvider::default()
    }

    /// Builder style variant of [`MemoryResourceProvider::put`].
    pub fn with(self, path: &str, text: &str) -> MemoryResourceProvider {
        self.put(path, text);
        self
    }

    /// Adds or replaces the resource at `path`.
    pub fn put(&self, path: &str, text: &str) {
        self.resources
            .write()
            .insert(path.to_string(), text.to_string());
    }

    pub fn remove(&self, path: &str) -> Option<String> {
        self.resources.write().remove(path)
    }

    pub fn len(&self) -> usize {
        self.resources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.read().is_empty()
    }
}

impl ResourceProvider for MemoryResourceProvider {
    fn list_sorted(&self, platform: &str) -> DarwinResult<Vec<String>> {
        let prefix = format!("{}{}", platform, PATH_SEPARATOR);
        let paths = self
            .resources
            .read()
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .cloned()
            .collect();
        Ok(sort_resource_paths(paths))
    }

    fn read_text(&self, path: &str) -> DarwinResult<String> {
        self.resources.read().get(path).cloned().ok_or_else(|| {
            DarwinError::new(
                &format!("Resource {} not found", path),
                ErrorKind::NotFound,
            )
        })
    }
}
