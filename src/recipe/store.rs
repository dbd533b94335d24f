use super::{Recipe, RecipeError, SampleResult};
use crate::storage::{JobDir, StoreError, read_json, write_json_atomic, write_json_new};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fs, io, path::PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecipeSummary {
    pub version: u32,
    pub approved: bool,
    pub created_at: DateTime<Utc>,
    pub changes_made: Option<String>,
    pub avg_score: Option<f64>,
    pub samples_tested: usize,
}

/// Version history under `recipes/v{N}.json` plus the `recipe.json` pointer
/// to the current version.
#[derive(Debug, Clone)]
pub struct RecipeStore {
    job: JobDir,
}

impl RecipeStore {
    pub fn new(job: JobDir) -> Self {
        Self { job }
    }

    fn version_path(&self, version: u32) -> PathBuf {
        self.job.recipes_dir().join(format!("v{version}.json"))
    }

    pub fn current(&self) -> Result<Option<Recipe>, StoreError> {
        read_json(&self.job.current_recipe_path())
    }

    pub fn version(&self, version: u32) -> Result<Option<Recipe>, StoreError> {
        read_json(&self.version_path(version))
    }

    /// Writes a brand-new version. Refuses to touch an existing version file.
    pub fn create(&self, recipe: &Recipe) -> Result<(), StoreError> {
        write_json_new(&self.version_path(recipe.version), recipe)?;
        write_json_atomic(&self.job.current_recipe_path(), recipe)?;
        info!(target = "listing.recipe", job_id = %self.job.id(), version = recipe.version, "recipe_version_saved");
        Ok(())
    }

    /// Attaches test results to an unapproved version and makes it current.
    pub fn record_tests(
        &self,
        version: u32,
        results: Vec<SampleResult>,
    ) -> Result<Recipe, RecipeError> {
        let mut recipe = self
            .version(version)?
            .ok_or(RecipeError::MissingVersion(version))?;
        if recipe.approved {
            return Err(RecipeError::Locked(version));
        }
        recipe.test_results = results;
        self.overwrite(&recipe)?;
        Ok(recipe)
    }

    /// Locks the current version. Approving an approved recipe is a no-op.
    pub fn approve(&self) -> Result<Option<Recipe>, RecipeError> {
        let Some(current) = self.current()? else {
            return Ok(None);
        };
        let mut recipe = self.version(current.version)?.unwrap_or(current);
        if recipe.approved {
            return Ok(Some(recipe));
        }
        recipe.approved = true;
        recipe.approved_at = Some(Utc::now());
        self.overwrite(&recipe)?;
        info!(target = "listing.recipe", job_id = %self.job.id(), version = recipe.version, "recipe_approved");
        Ok(Some(recipe))
    }

    fn overwrite(&self, recipe: &Recipe) -> Result<(), StoreError> {
        write_json_atomic(&self.version_path(recipe.version), recipe)?;
        write_json_atomic(&self.job.current_recipe_path(), recipe)
    }

    pub fn history(&self) -> Result<Vec<RecipeSummary>, StoreError> {
        let dir = self.job.recipes_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut versions: Vec<u32> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                name.strip_prefix('v')?.strip_suffix(".json")?.parse().ok()
            })
            .collect();
        versions.sort_unstable();

        let mut summaries = Vec::with_capacity(versions.len());
        for version in versions {
            if let Some(recipe) = self.version(version)? {
                summaries.push(RecipeSummary {
                    version: recipe.version,
                    approved: recipe.approved,
                    created_at: recipe.created_at,
                    avg_score: recipe.average_score(),
                    samples_tested: recipe.test_results.len(),
                    changes_made: recipe.changes_made,
                });
            }
        }
        Ok(summaries)
    }
}
