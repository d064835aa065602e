//! Registry file load and save.

use log::debug;
use std::fs;
use std::path::Path;

use super::{Registry, RegistryError};

pub fn load_registry(path: &Path) -> Result<Registry, RegistryError> {
    let content =
        fs::read_to_string(path).map_err(|e| RegistryError::Io(path.to_path_buf(), e))?;
    let registry: Registry = serde_json::from_str(&content)?;
    debug!("Loaded {} registry entries from {}", registry.len(), path.display());
    Ok(registry)
}

/// Write the registry as pretty-printed JSON.
pub fn save_registry(path: &Path, registry: &Registry) -> Result<(), RegistryError> {
    let mut content = serde_json::to_string_pretty(registry)?;
    content.push('\n');
    fs::write(path, content).map_err(|e| RegistryError::Io(path.to_path_buf(), e))?;
    debug!("Wrote {} registry entries to {}", registry.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryEntry;
    use tempdir::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new("registry").unwrap();
        let path = dir.path().join("nodes.json");

        let mut registry = Registry::new();
        registry.insert("b".to_string(), RegistryEntry::new("enr:b"));
        registry.insert("a".to_string(), RegistryEntry::new("enr:a"));
        save_registry(&path, &registry).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        // Two-space indent, keys sorted
        assert!(content.starts_with("{\n  \"a\": {\n    \"seq\": 0,"));
        assert!(content.find("\"a\"").unwrap() < content.find("\"b\"").unwrap());

        assert_eq!(load_registry(&path).unwrap(), registry);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new("registry").unwrap();
        let err = load_registry(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, RegistryError::Io(..)));
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = TempDir::new("registry").unwrap();
        let path = dir.path().join("nodes.json");
        fs::write(&path, "[1, 2").unwrap();
        assert!(matches!(
            load_registry(&path).unwrap_err(),
            RegistryError::Json(_)
        ));
    }
}
