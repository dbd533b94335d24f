use crate::{
    models::{BatchReport, ItemResult},
    storage::{JobDir, StoreError, read_json, sanitize_file_stem, write_json_atomic},
};
use std::path::PathBuf;
use tracing::warn;

/// Per-item result files plus the batch report.
#[derive(Debug, Clone)]
pub struct ResultStore {
    listings_dir: PathBuf,
    report_path: PathBuf,
}

impl ResultStore {
    pub fn new(job: &JobDir) -> Self {
        Self {
            listings_dir: job.listings_dir(),
            report_path: job.report_path(),
        }
    }

    pub fn path_for(&self, item_id: &str) -> PathBuf {
        self.listings_dir
            .join(format!("{}.json", sanitize_file_stem(item_id)))
    }

    pub fn write(&self, result: &ItemResult) -> Result<(), StoreError> {
        write_json_atomic(&self.path_for(&result.item_id), result)
    }

    /// A settled result, if one is on disk. A damaged file counts as absent
    /// so the item gets generated again.
    pub fn load(&self, item_id: &str) -> Result<Option<ItemResult>, StoreError> {
        match read_json::<ItemResult>(&self.path_for(item_id)) {
            Ok(Some(result)) if result.item_id == item_id => Ok(Some(result)),
            Ok(Some(result)) => {
                warn!(target = "listing.batch", item_id, found = %result.item_id, "result_file_mismatch");
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(StoreError::Json { path, source }) => {
                warn!(target = "listing.batch", item_id, path = %path.display(), error = %source, "result_file_unreadable");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn write_report(&self, report: &BatchReport) -> Result<(), StoreError> {
        write_json_atomic(&self.report_path, report)
    }

    pub fn report(&self) -> Result<Option<BatchReport>, StoreError> {
        read_json(&self.report_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureKind;
    use crate::storage::JobStore;

    #[test]
    fn results_round_trip_and_damage_reads_as_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = JobStore::new(dir.path())
            .job(&uuid::Uuid::new_v4().to_string())
            .expect("job");
        let store = ResultStore::new(&job);

        let result = ItemResult::failed("SKU/7", FailureKind::Generation, "boom");
        store.write(&result).expect("write");
        assert!(
            store
                .path_for("SKU/7")
                .starts_with(job.listings_dir())
        );
        assert_eq!(store.load("SKU/7").expect("load"), Some(result));

        std::fs::write(store.path_for("other"), b"{not json").expect("damage");
        assert_eq!(store.load("other").expect("load"), None);
        assert_eq!(store.load("never").expect("load"), None);
        assert!(store.report().expect("report").is_none());
    }
}
