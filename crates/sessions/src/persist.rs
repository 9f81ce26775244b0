//! Atomic-rename JSON persistence shared by the stores.

use ag_domain::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Write `value` to `path` atomically: serialize to `<path>.tmp`, fsync,
/// then rename over the target. Readers see either the old file or the new
/// one, never a partial write.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");

    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp).map_err(Error::Io)?;
        file.write_all(json.as_bytes()).map_err(Error::Io)?;
        file.sync_all().map_err(Error::Io)?;
    }

    std::fs::rename(&tmp, path).map_err(Error::Io)?;
    Ok(())
}

/// Load a JSON file, returning `T::default()` when it does not exist yet.
/// A corrupt file is an error — the caller decides whether to repair.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
    serde_json::from_str(&raw).map_err(Error::Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let empty: HashMap<String, u32> = load_json_or_default(&path).unwrap();
        assert!(empty.is_empty());

        let mut data = HashMap::new();
        data.insert("a".to_string(), 1u32);
        write_json_atomic(&path, &data).unwrap();

        let back: HashMap<String, u32> = load_json_or_default(&path).unwrap();
        assert_eq!(back, data);

        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }
}
