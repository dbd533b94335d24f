use super::{
    Artifacts, Recipe, RecipeError, RecipeStore, RecipeTester, SampleResult, average_score,
};
use crate::{
    llm::{AiError, AiService, Effort, UsageLedger},
    models::{CatalogItem, StyleProfile, display_value},
    storage::JobDir,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

/// Produces the next version from feedback. Artifacts the model leaves out
/// are carried over; the input recipe is never modified.
pub async fn refine(
    ai: &dyn AiService,
    recipe: &Recipe,
    style: &StyleProfile,
    feedback: &str,
    ledger: &UsageLedger,
) -> Result<Recipe, AiError> {
    let prompt = refine_prompt(recipe, style, feedback);
    let generation = ai.generate_text(&prompt, Effort::High).await?;
    ledger.record(generation.usage);
    let artifacts = Artifacts::parse(&generation.value);

    let next = Recipe {
        version: recipe.version + 1,
        prompt_template: artifacts
            .prompt_template
            .unwrap_or_else(|| recipe.prompt_template.clone()),
        output_schema: artifacts
            .output_schema
            .unwrap_or_else(|| recipe.output_schema.clone()),
        validation_program: artifacts
            .validation_program
            .unwrap_or_else(|| recipe.validation_program.clone()),
        approved: false,
        approved_at: None,
        created_at: Utc::now(),
        changes_made: artifacts.changes_made,
        test_results: recipe.test_results.clone(),
    };
    info!(
        target = "listing.recipe",
        from = recipe.version,
        to = next.version,
        changes = next.changes_made.as_deref().unwrap_or(""),
        "recipe_refined"
    );
    Ok(next)
}

fn results_summary(results: &[SampleResult]) -> Value {
    Value::Array(
        results
            .iter()
            .map(|result| {
                let mut entry = json!({
                    "item_id": result.item_id,
                    "item_name": result.item_name,
                    "score": result.validation.score,
                    "passed": result.validation.passed,
                    "issues": result.validation.issues,
                });
                if let Some(listing) = &result.listing {
                    let text = |key: &str| listing.get(key).map(display_value).unwrap_or_default();
                    entry["title_generated"] = json!(text("title"));
                    entry["description_preview"] =
                        json!(text("description").chars().take(200).collect::<String>());
                    entry["tags_count"] = json!(
                        listing
                            .get("tags")
                            .and_then(Value::as_array)
                            .map(Vec::len)
                            .unwrap_or(0)
                    );
                    entry["price"] = listing.get("suggested_price").cloned().unwrap_or(Value::Null);
                }
                entry
            })
            .collect(),
    )
}

fn refine_prompt(recipe: &Recipe, style: &StyleProfile, feedback: &str) -> String {
    let pretty = |value: &Value| serde_json::to_string_pretty(value).unwrap_or_default();
    format!(
        "You are refining a product listing recipe based on feedback.\n\n\
## Current Recipe (v{version})\n\n\
### Prompt Template\n{template}\n\n\
### Output Schema\n{schema}\n\n\
### Validation Code\n{program}\n\n\
## Style Profile\n{style}\n\n\
## Test Results\n{results}\n\n\
## Feedback\n{feedback}\n\n\
## Your Task\n\
Update the recipe to address the feedback. You may modify any of the three artifacts \
(prompt_template, output_schema, validation_code); omit the ones that need no change. \
Consider what specifically should change, how the test results relate to the feedback, \
and which artifacts need updating.\n\n\
Respond with exactly this JSON (no markdown fencing):\n\
{{\"prompt_template\": \"...\", \"output_schema\": {{}}, \
\"validation_code\": \"def validate_listing(listing, style_profile):\\n    ...\", \
\"changes_made\": \"what you changed and why\"}}",
        version = recipe.version,
        template = recipe.prompt_template,
        schema = pretty(&recipe.output_schema),
        program = recipe.validation_program,
        style = serde_json::to_string_pretty(style).unwrap_or_default(),
        results = pretty(&results_summary(&recipe.test_results)),
    )
}

/// Feedback written from the last test run's issues, for unattended rounds.
pub fn build_auto_feedback(results: &[SampleResult]) -> String {
    let mut lines = vec!["The following issues were found during automated testing:\n".to_string()];

    for result in results {
        let validation = &result.validation;
        let name = &result.item_name;
        let score = validation.score;
        let code_issues = validation
            .code_issues
            .as_ref()
            .unwrap_or(&validation.issues);
        let failed: Vec<_> = validation
            .judge_criteria
            .iter()
            .flatten()
            .filter(|verdict| !verdict.passed)
            .collect();

        if !code_issues.is_empty() {
            lines.push(format!("**{name}** ({score}/100) - Structural issues:"));
            lines.extend(code_issues.iter().map(|issue| format!("  - {issue}")));
        }
        if !failed.is_empty() {
            if code_issues.is_empty() {
                lines.push(format!("**{name}** ({score}/100) - Quality issues:"));
            } else {
                lines.push("  Quality issues:".to_string());
            }
            lines.extend(failed.iter().map(|verdict| {
                let reasoning: String = verdict.reasoning.chars().take(200).collect();
                format!("  - [{}] {reasoning}", verdict.criterion)
            }));
        }
        if code_issues.is_empty() && failed.is_empty() && !validation.passed {
            lines.push(format!("- {name} ({score}/100): Failed validation"));
        }
        if !code_issues.is_empty() || !failed.is_empty() {
            lines.push(String::new());
        }
    }

    lines.push(
        "Please fix the recipe to address these issues. Focus on the most common problems first."
            .to_string(),
    );
    lines.join("\n")
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoundSummary {
    pub round: usize,
    pub version: u32,
    pub avg_score: f64,
    pub passed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoRefineOutcome {
    pub recipe: Recipe,
    pub rounds: Vec<RoundSummary>,
    pub converged: bool,
}

/// Test, then refine with synthesized feedback, until the samples pass or
/// the round budget runs out. Every version along the way is persisted.
pub struct AutoRefiner<'a> {
    pub ai: &'a dyn AiService,
    pub tester: RecipeTester<'a>,
    pub store: &'a RecipeStore,
    pub ledger: &'a UsageLedger,
    pub max_rounds: usize,
    pub threshold: f64,
}

impl AutoRefiner<'_> {
    pub async fn run(
        &self,
        mut recipe: Recipe,
        samples: &[&CatalogItem],
        style: &StyleProfile,
        job: &JobDir,
    ) -> Result<AutoRefineOutcome, RecipeError> {
        if samples.is_empty() {
            return Err(RecipeError::NoItems);
        }
        if recipe.approved {
            return Err(RecipeError::Locked(recipe.version));
        }

        let mut rounds = Vec::new();
        let mut converged = false;
        for round in 1..=self.max_rounds.max(1) {
            let results = self.tester.test(&recipe, samples, style, job).await?;
            recipe = self.store.record_tests(recipe.version, results)?;

            let summary = RoundSummary {
                round,
                version: recipe.version,
                avg_score: average_score(&recipe.test_results).unwrap_or(0.0),
                passed: recipe
                    .test_results
                    .iter()
                    .filter(|result| result.validation.passed)
                    .count(),
                total: recipe.test_results.len(),
            };
            info!(
                target = "listing.recipe",
                round,
                version = summary.version,
                avg_score = summary.avg_score,
                passed = summary.passed,
                total = summary.total,
                "auto_refine_round"
            );
            converged = summary.avg_score >= self.threshold && summary.passed == summary.total;
            rounds.push(summary);
            if converged || round == self.max_rounds.max(1) {
                break;
            }

            let feedback = build_auto_feedback(&recipe.test_results);
            let next = refine(self.ai, &recipe, style, &feedback, self.ledger).await?;
            self.store.create(&next)?;
            recipe = next;
        }

        Ok(AutoRefineOutcome {
            recipe,
            rounds,
            converged,
        })
    }
}
