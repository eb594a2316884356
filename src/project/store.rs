//! Project persistence.
//!
//! The controller only depends on [`ProjectStore`]; [`JsonProjectStore`] is the
//! file-backed implementation used by the binary.

use super::{Project, ProjectParams};
use crate::config::Defaults;
use crate::error::ProjectError;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Durable record the controller appends finished tests into.
pub trait ProjectStore: Send + Sync {
    /// Load the project stored at `path`.
    fn load(&self, path: &Path) -> Result<Project, ProjectError>;

    /// Persist `project` to its own path. Labels and test order are
    /// normalized in place before writing.
    fn save(&self, project: &mut Project) -> Result<(), ProjectError>;
}

/// JSON file store.
#[derive(Clone, Debug, Default)]
pub struct JsonProjectStore {
    defaults: Defaults,
}

impl JsonProjectStore {
    /// Parameters missing from a file fall back to `defaults`.
    pub fn new(defaults: Defaults) -> Self {
        JsonProjectStore {
            defaults: defaults.sanitized(),
        }
    }

    /// Overlay the non-null parameters found in a file onto the defaults.
    fn merge_params(&self, loaded: Option<&Value>) -> Result<Value, ProjectError> {
        let mut merged = serde_json::to_value(ProjectParams::from_defaults(&self.defaults))?;
        if let (Some(Value::Object(loaded)), Value::Object(target)) = (loaded, &mut merged) {
            for (key, value) in loaded {
                if !value.is_null() && target.contains_key(key) {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(merged)
    }
}

/// Absolute path with `.` and `..` and symlinks resolved, so the same file
/// always gets the same path property.
fn resolve(path: &Path) -> PathBuf {
    fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

impl ProjectStore for JsonProjectStore {
    fn load(&self, path: &Path) -> Result<Project, ProjectError> {
        if !path.is_file() {
            return Err(ProjectError::FileNotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        let mut raw: Value = serde_json::from_str(&content)?;

        let params = self.merge_params(raw.get("params"))?;
        if let Value::Object(map) = &mut raw {
            map.insert("params".to_string(), params);
            if map.get("outputFormat").map_or(true, Value::is_null) {
                map.insert(
                    "outputFormat".to_string(),
                    Value::String(self.defaults.output_format.clone()),
                );
            }
        }

        let mut project: Project = serde_json::from_value(raw)?;

        if project.uuid.as_deref().map_or(true, str::is_empty) {
            project.uuid = Some(uuid::Uuid::new_v4().simple().to_string());
        }

        let actual = resolve(path).display().to_string();
        if project.info.path != actual {
            log::warn!(
                "[Project] Opened a project whose actual path didn't match its path property"
            );
            log::warn!(
                "[Project] Path property: {:?}, actual path: {}",
                project.info.path,
                actual
            );
            project.info.path = actual;
        }

        log::info!("[Project] Loaded {} ({} tests)", path.display(), project.tests.len());
        Ok(project)
    }

    fn save(&self, project: &mut Project) -> Result<(), ProjectError> {
        let path = project.path();
        if project.info.path.trim().is_empty() {
            return Err(ProjectError::Persist("project has no file path".to_string()));
        }
        project.arrange_tests();

        let mut buf = Vec::new();
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        project.serialize(&mut ser)?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&buf)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .map_err(|e| ProjectError::Persist(format!("{}: {}", path.display(), e.error)))?;

        log::info!("[Project] Saved {} ({} tests)", path.display(), project.tests.len());
        Ok(())
    }
}
