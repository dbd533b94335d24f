use super::fingerprint::ColumnFingerprint;
use crate::storage::{StoreError, read_json, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionProgram {
    pub fingerprint: ColumnFingerprint,
    pub headers: Vec<String>,
    pub script: String,
    pub version: u32,
    pub saved_at: DateTime<Utc>,
}

/// Programs that ran clean, one file per fingerprint, shared across jobs.
#[derive(Debug, Clone)]
pub struct ScriptStore {
    dir: PathBuf,
}

impl ScriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, fingerprint: &ColumnFingerprint) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    /// A stored program is only returned for the exact fingerprint it was
    /// saved under.
    pub fn load(
        &self,
        fingerprint: &ColumnFingerprint,
    ) -> Result<Option<ExtractionProgram>, StoreError> {
        let program: Option<ExtractionProgram> = read_json(&self.path(fingerprint))?;
        Ok(program.filter(|program| &program.fingerprint == fingerprint))
    }

    /// Saving a different script over an existing fingerprint supersedes it
    /// with the next version. Re-saving the same script is a no-op.
    pub fn save(
        &self,
        fingerprint: &ColumnFingerprint,
        headers: &[String],
        script: &str,
    ) -> Result<ExtractionProgram, StoreError> {
        let previous = self.load(fingerprint)?;
        if let Some(previous) = previous.as_ref().filter(|prev| prev.script == script) {
            return Ok(previous.clone());
        }
        let program = ExtractionProgram {
            fingerprint: fingerprint.clone(),
            headers: headers.to_vec(),
            script: script.to_string(),
            version: previous.map(|prev| prev.version + 1).unwrap_or(1),
            saved_at: Utc::now(),
        };
        write_json_atomic(&self.path(fingerprint), &program)?;
        info!(
            target = "listing.extract",
            fingerprint = %fingerprint,
            version = program.version,
            "extraction_program_saved"
        );
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_program_reloads_byte_identical() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ScriptStore::new(dir.path());
        let headers = vec!["sku".to_string(), "title".to_string()];
        let fp = ColumnFingerprint::of(&headers);
        let script = "import json\n# ünïcode\r\nresult_json = json.dumps([])\n\t";
        store.save(&fp, &headers, script).expect("save");
        let loaded = store.load(&fp).expect("load").expect("present");
        assert_eq!(loaded.script.as_bytes(), script.as_bytes());
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn other_fingerprints_never_hit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ScriptStore::new(dir.path());
        let fp = ColumnFingerprint::of(&["sku"]);
        store.save(&fp, &["sku".to_string()], "x = 1").expect("save");
        let other = ColumnFingerprint::of(&["sku", "price"]);
        assert!(store.load(&other).expect("load").is_none());
    }

    #[test]
    fn new_script_bumps_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ScriptStore::new(dir.path());
        let headers = vec!["sku".to_string()];
        let fp = ColumnFingerprint::of(&headers);
        store.save(&fp, &headers, "a = 1").expect("v1");
        assert_eq!(store.save(&fp, &headers, "a = 1").expect("same").version, 1);
        let second = store.save(&fp, &headers, "a = 2").expect("v2");
        assert_eq!(second.version, 2);
        assert_eq!(store.load(&fp).expect("load").expect("present").script, "a = 2");
    }
}
