//! Opaque Milvus configuration maps.
//!
//! The configuration namespace is open-ended, so it is kept as a recursive
//! JSON value instead of a fixed schema.

use std::path::Path;

use serde_json::{Map, Value};

/// Nested key/value configuration, as found in `milvus.yaml`
pub type ConfigMap = Map<String, Value>;

/// Merges `incoming` into `base`.
///
/// Objects present on both sides are merged recursively; every other value
/// (scalars, arrays, or a type mismatch) from `incoming` replaces the existing one.
pub fn deep_merge(base: &mut ConfigMap, incoming: ConfigMap) {
    for (key, value) in incoming {
        let Value::Object(nested) = value else {
            base.insert(key, value);
            continue;
        };
        if let Some(Value::Object(existing)) = base.get_mut(&key) {
            deep_merge(existing, nested);
        } else {
            base.insert(key, Value::Object(nested));
        }
    }
}

/// Reads a YAML configuration file; a missing file is an empty map
pub fn load_yaml(path: &Path) -> Result<ConfigMap, crate::BackendError> {
    if !path.exists() {
        return Ok(ConfigMap::new());
    }
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(ConfigMap::new());
    }
    Ok(serde_yaml::from_str(&contents)?)
}

pub fn save_yaml(path: &Path, config: &ConfigMap) -> Result<(), crate::BackendError> {
    let contents = serde_yaml::to_string(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}
