use super::{Recipe, SampleResult, ValidationEngine, template::fill_template};
use crate::{
    llm::{AiError, AiService, Effort, ImagePart, UsageLedger},
    models::{CatalogItem, StyleProfile, ValidationResult},
    sandbox::Executor,
    storage::JobDir,
};
use tracing::{info, warn};

pub const MAX_IMAGES_PER_ITEM: usize = 2;
const NAME_FIELDS: [&str; 6] = ["name", "item", "title", "product_name", "product", "sku"];

/// Best-effort display name from whichever field the catalog uses.
pub fn item_name(item: &CatalogItem) -> String {
    NAME_FIELDS
        .iter()
        .find_map(|field| item.field_str(field))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| item.id.clone())
}

/// Up to two of the item's photos, from `images/` or `uploads/`.
pub async fn item_images(job: &JobDir, item: &CatalogItem) -> Vec<ImagePart> {
    let mut parts = Vec::new();
    for filename in item.image_files.iter().take(MAX_IMAGES_PER_ITEM) {
        let Some(path) = job.find_image(filename) else {
            continue;
        };
        match ImagePart::load(&path).await {
            Ok(part) => parts.push(part),
            Err(err) => {
                warn!(target = "listing.recipe", item_id = %item.id, image = %filename, error = %err, "image_load_failed")
            }
        }
    }
    parts
}

pub struct RecipeTester<'a> {
    ai: &'a dyn AiService,
    executor: &'a Executor,
    ledger: &'a UsageLedger,
}

impl<'a> RecipeTester<'a> {
    pub fn new(ai: &'a dyn AiService, executor: &'a Executor, ledger: &'a UsageLedger) -> Self {
        Self {
            ai,
            executor,
            ledger,
        }
    }

    /// Generates and grades one listing per sample with both validation
    /// layers. Service errors become failed samples; quota aborts the run.
    pub async fn test(
        &self,
        recipe: &Recipe,
        samples: &[&CatalogItem],
        style: &StyleProfile,
        job: &JobDir,
    ) -> Result<Vec<SampleResult>, AiError> {
        let mut results = Vec::with_capacity(samples.len());
        for item in samples {
            match self.test_one(recipe, item, style, job).await {
                Ok(result) => results.push(result),
                Err(err) if err.is_quota() => return Err(err),
                Err(err) => {
                    warn!(target = "listing.recipe", item_id = %item.id, error = %err, "sample_generation_failed");
                    results.push(SampleResult {
                        item_id: item.id.clone(),
                        item_name: item_name(item),
                        listing: None,
                        validation: ValidationResult {
                            passed: false,
                            score: 0,
                            issues: vec![format!("Error during testing: {err}")],
                            code_issues: None,
                            judge_criteria: None,
                        },
                        image_filename: item.image_files.first().cloned(),
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        Ok(results)
    }

    async fn test_one(
        &self,
        recipe: &Recipe,
        item: &CatalogItem,
        style: &StyleProfile,
        job: &JobDir,
    ) -> Result<SampleResult, AiError> {
        let prompt = fill_template(&recipe.prompt_template, item, style);
        let images = item_images(job, item).await;
        let generation = self
            .ai
            .generate_structured(&prompt, &images, &recipe.output_schema, Effort::Medium)
            .await?;
        self.ledger.record(generation.usage);
        let listing = generation.value;

        let validation = ValidationEngine::with_judge(self.executor, self.ai, self.ledger)
            .validate(&listing, &recipe.validation_program, style, item)
            .await;
        info!(
            target = "listing.recipe",
            item_id = %item.id,
            version = recipe.version,
            score = validation.score,
            passed = validation.passed,
            "sample_tested"
        );

        Ok(SampleResult {
            item_id: item.id.clone(),
            item_name: item_name(item),
            listing: Some(listing),
            validation,
            image_filename: item.image_files.first().cloned(),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{Scripted, ScriptedAi};
    use crate::recipe::{DEFAULT_OUTPUT_SCHEMA, DEFAULT_VALIDATION_PROGRAM};
    use crate::sandbox::runtime::ScriptReply;
    use crate::sandbox::testing::StubRuntime;
    use crate::storage::JobStore;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn recipe() -> Recipe {
        Recipe {
            version: 1,
            prompt_template: "Write a listing for {title}".into(),
            output_schema: DEFAULT_OUTPUT_SCHEMA.clone(),
            validation_program: DEFAULT_VALIDATION_PROGRAM.to_string(),
            approved: false,
            approved_at: None,
            created_at: Utc::now(),
            changes_made: None,
            test_results: Vec::new(),
        }
    }

    fn job() -> (tempfile::TempDir, JobDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = JobStore::new(dir.path())
            .job(&uuid::Uuid::new_v4().to_string())
            .expect("job");
        (dir, job)
    }

    fn passing(n: usize) -> Vec<Scripted> {
        (0..n)
            .map(|_| Scripted::Json(json!({"reasoning": "fine", "pass": true})))
            .collect()
    }

    #[test]
    fn names_come_from_common_fields() {
        let item = CatalogItem::new("item_001").with_field("title", " Oak stool ");
        assert_eq!(item_name(&item), "Oak stool");
        assert_eq!(item_name(&CatalogItem::new("item_002")), "item_002");
    }

    #[tokio::test]
    async fn sample_errors_become_failed_results() {
        let (_dir, job) = job();
        let executor = Executor::new(Arc::new(StubRuntime::new(|_| ScriptReply::Ok {
            result: json!({"issues": []}),
        })));
        let mut replies = vec![Scripted::Json(json!({"title": "Oak stool"}))];
        replies.extend(passing(5));
        replies.push(Scripted::Fail(AiError::Rejected {
            status: 400,
            message: "bad schema".into(),
        }));
        let ai = ScriptedAi::new(replies);
        let ledger = UsageLedger::new();
        let a = CatalogItem::new("a").with_field("title", "Oak stool");
        let b = CatalogItem::new("b").with_field("title", "Pine shelf");

        let results = RecipeTester::new(&ai, &executor, &ledger)
            .test(&recipe(), &[&a, &b], &StyleProfile::default(), &job)
            .await
            .expect("results");
        assert_eq!(results.len(), 2);
        assert!(results[0].validation.passed);
        assert_eq!(results[0].validation.score, 100);
        assert!(results[1].listing.is_none());
        assert_eq!(results[1].validation.score, 0);
        assert!(results[1].error.as_deref().is_some_and(|e| e.contains("bad schema")));

        let prompts = ai.prompts.lock().expect("prompts");
        assert_eq!(prompts[0], "Write a listing for Oak stool");
    }

    #[tokio::test]
    async fn quota_aborts_the_test_run() {
        let (_dir, job) = job();
        let executor = Executor::new(Arc::new(StubRuntime::new(|_| ScriptReply::Missing)));
        let ai = ScriptedAi::new(vec![Scripted::Fail(AiError::QuotaExhausted("daily limit".into()))]);
        let a = CatalogItem::new("a");
        let err = RecipeTester::new(&ai, &executor, &UsageLedger::new())
            .test(&recipe(), &[&a], &StyleProfile::default(), &job)
            .await
            .expect_err("quota");
        assert!(err.is_quota());
    }
}
